use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::deal::{DealRow, LegacyDealRow};

/// Namespace for deterministic target ids: the same legacy identity always
/// maps to the same `zoho_deals.id`.
const DEAL_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2d0e_8a4b_4c7e_9b21_5e3f_d4a0_c871);

/// Keyset position in the legacy table. `None` means "before the first row".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(Option<i64>);

impl Cursor {
    pub fn start() -> Self {
        Cursor(None)
    }

    pub fn after(row: i64) -> Self {
        Cursor(Some(row))
    }

    pub fn last_row(&self) -> Option<i64> {
        self.0
    }

    /// Whether a row with this primary key lies past the cursor.
    pub fn admits(&self, row: i64) -> bool {
        self.0.map_or(true, |last| row > last)
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            None => write!(f, "start"),
            Some(row) => write!(f, "after row {row}"),
        }
    }
}

/// A row as read from the legacy table. Never mutated after the read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyDealRecord {
    pub source_row: i64,
    pub fields: Value,
}

impl From<LegacyDealRow> for LegacyDealRecord {
    fn from(row: LegacyDealRow) -> Self {
        LegacyDealRecord {
            source_row: row.id,
            fields: row.data,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DealStage {
    Qualification,
    NeedsAnalysis,
    ValueProposition,
    IdDecisionMakers,
    PerceptionAnalysis,
    ProposalPriceQuote,
    NegotiationReview,
    ClosedWon,
    ClosedLost,
    ClosedLostToCompetition,
    Unspecified,
}

impl DealStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            DealStage::Qualification => "qualification",
            DealStage::NeedsAnalysis => "needs_analysis",
            DealStage::ValueProposition => "value_proposition",
            DealStage::IdDecisionMakers => "id_decision_makers",
            DealStage::PerceptionAnalysis => "perception_analysis",
            DealStage::ProposalPriceQuote => "proposal_price_quote",
            DealStage::NegotiationReview => "negotiation_review",
            DealStage::ClosedWon => "closed_won",
            DealStage::ClosedLost => "closed_lost",
            DealStage::ClosedLostToCompetition => "closed_lost_to_competition",
            DealStage::Unspecified => "unspecified",
        }
    }

    /// Parses both Zoho display labels ("Proposal/Price Quote") and our own
    /// snake_case names. Punctuation, spacing and case are ignored.
    pub fn parse(raw: &str) -> Option<Self> {
        let key: String = raw
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        let stage = match key.as_str() {
            "qualification" => DealStage::Qualification,
            "needsanalysis" => DealStage::NeedsAnalysis,
            "valueproposition" => DealStage::ValueProposition,
            "iddecisionmakers" => DealStage::IdDecisionMakers,
            "perceptionanalysis" => DealStage::PerceptionAnalysis,
            "proposalpricequote" => DealStage::ProposalPriceQuote,
            "negotiationreview" => DealStage::NegotiationReview,
            "closedwon" => DealStage::ClosedWon,
            "closedlost" => DealStage::ClosedLost,
            "closedlosttocompetition" => DealStage::ClosedLostToCompetition,
            "unspecified" => DealStage::Unspecified,
            _ => return None,
        };
        Some(stage)
    }
}

/// Soft anomaly found while transforming. The record is still written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransformWarning {
    UnresolvedOwner { reference: String },
    UnknownStage { value: String },
    MalformedTimestamp { field: String, value: String },
    MalformedAmount { value: String },
    MalformedDate { field: String, value: String },
}

impl fmt::Display for TransformWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransformWarning::UnresolvedOwner { reference } => {
                write!(f, "owner '{reference}' not found, left unset")
            }
            TransformWarning::UnknownStage { value } => {
                write!(f, "unknown stage '{value}', stored as unspecified")
            }
            TransformWarning::MalformedTimestamp { field, value } => {
                write!(f, "{field} '{value}' is not a timestamp, left unknown")
            }
            TransformWarning::MalformedAmount { value } => {
                write!(f, "amount '{value}' is not a number, left unset")
            }
            TransformWarning::MalformedDate { field, value } => {
                write!(f, "{field} '{value}' is not a date, left unset")
            }
        }
    }
}

/// Target-schema deal, produced by the transformer and owned by the writer
/// once persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigratedDealRecord {
    pub id: Uuid,
    /// Back-reference to the legacy identity. Unique in the target table.
    pub legacy_id: String,
    pub source_row: i64,
    pub name: String,
    pub stage: DealStage,
    pub owner_id: Option<String>,
    pub amount: Option<f64>,
    pub closing_date: Option<NaiveDate>,
    pub created_time: Option<DateTime<Utc>>,
    pub modified_time: Option<DateTime<Utc>>,
    pub warnings: Vec<TransformWarning>,
}

impl MigratedDealRecord {
    pub fn target_id(legacy_id: &str) -> Uuid {
        Uuid::new_v5(&DEAL_NAMESPACE, legacy_id.as_bytes())
    }

    /// Compares the migrated payload, ignoring identity and traceability columns.
    pub fn same_content(&self, other: &MigratedDealRecord) -> bool {
        self.name == other.name
            && self.stage == other.stage
            && self.owner_id == other.owner_id
            && self.amount == other.amount
            && self.closing_date == other.closing_date
            && self.created_time == other.created_time
            && self.modified_time == other.modified_time
            && self.warnings == other.warnings
    }
}

impl From<DealRow> for MigratedDealRecord {
    fn from(row: DealRow) -> Self {
        MigratedDealRecord {
            id: row.id,
            legacy_id: row.legacy_id,
            source_row: row.source_row,
            name: row.name,
            stage: DealStage::parse(&row.stage).unwrap_or(DealStage::Unspecified),
            owner_id: row.owner_id,
            amount: row.amount,
            closing_date: row.closing_date,
            created_time: row.created_time,
            modified_time: row.modified_time,
            warnings: serde_json::from_value(row.migration_warnings).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    Inserted,
    AlreadyPresent,
    Updated,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WriteMode {
    /// Existing back-references are left untouched.
    #[default]
    InsertOnly,
    /// Existing rows whose content changed are overwritten.
    Force,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_admits_rows_past_it() {
        assert!(Cursor::start().admits(1));
        assert!(Cursor::after(4).admits(5));
        assert!(!Cursor::after(4).admits(4));
    }

    #[test]
    fn test_cursor_display() {
        assert_eq!(Cursor::start().to_string(), "start");
        assert_eq!(Cursor::after(4).to_string(), "after row 4");
    }

    #[test]
    fn test_stage_parses_zoho_labels() {
        assert_eq!(
            DealStage::parse("Proposal/Price Quote"),
            Some(DealStage::ProposalPriceQuote)
        );
        assert_eq!(
            DealStage::parse("Id. Decision Makers"),
            Some(DealStage::IdDecisionMakers)
        );
        assert_eq!(
            DealStage::parse("Closed-Lost to Competition"),
            Some(DealStage::ClosedLostToCompetition)
        );
        assert_eq!(DealStage::parse("closed_won"), Some(DealStage::ClosedWon));
        assert_eq!(DealStage::parse("Pending Magic"), None);
    }

    #[test]
    fn test_stage_round_trips_through_as_str() {
        for stage in [
            DealStage::NeedsAnalysis,
            DealStage::NegotiationReview,
            DealStage::Unspecified,
        ] {
            assert_eq!(DealStage::parse(stage.as_str()), Some(stage));
        }
    }

    #[test]
    fn test_target_id_is_deterministic() {
        assert_eq!(
            MigratedDealRecord::target_id("42"),
            MigratedDealRecord::target_id("42")
        );
        assert_ne!(
            MigratedDealRecord::target_id("42"),
            MigratedDealRecord::target_id("43")
        );
    }
}
