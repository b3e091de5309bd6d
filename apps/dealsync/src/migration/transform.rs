use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SubsecRound, TimeZone, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::migration::models::{
    DealStage, LegacyDealRecord, MigratedDealRecord, TransformWarning,
};

// Field aliases seen across the legacy dumps. Old scripts wrote Zoho's API
// names, newer ones wrote snake_case.
const ID_FIELDS: &[&str] = &["id", "deal_id", "Deal_Id", "Id"];
const NAME_FIELDS: &[&str] = &["name", "deal_name", "Deal_Name"];
const STAGE_FIELDS: &[&str] = &["stage", "Stage"];
const OWNER_FIELDS: &[&str] = &["owner", "owner_id", "Owner"];
const CREATED_FIELDS: &[&str] = &["created_at", "created_time", "Created_Time"];
const MODIFIED_FIELDS: &[&str] = &["modified_at", "modified_time", "Modified_Time"];
const AMOUNT_FIELDS: &[&str] = &["amount", "Amount"];
const CLOSING_FIELDS: &[&str] = &["closing_date", "Closing_Date"];

/// Hard failure: the record is skipped and reported, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing {0}")]
    MissingField(&'static str),

    #[error("identity has incompatible type: {0}")]
    InvalidIdentity(String),
}

/// Maps a legacy record onto the target schema.
///
/// Only a missing identity, an identity of the wrong type, or a missing name
/// fail the record. Everything else that is present but malformed is
/// downgraded to a [`TransformWarning`] and the field is left unset.
///
/// `owners` maps legacy owner references to canonical owner ids for the
/// current batch.
pub fn transform(
    record: &LegacyDealRecord,
    owners: &HashMap<String, String>,
) -> Result<MigratedDealRecord, ValidationError> {
    let fields = &record.fields;
    let legacy_id = legacy_identity(field(fields, ID_FIELDS))?;
    let name = field(fields, NAME_FIELDS)
        .and_then(scalar_text)
        .ok_or(ValidationError::MissingField("name"))?;

    let mut warnings = Vec::new();

    let stage = match field(fields, STAGE_FIELDS).and_then(scalar_text) {
        None => DealStage::Unspecified,
        Some(raw) => DealStage::parse(&raw).unwrap_or_else(|| {
            warnings.push(TransformWarning::UnknownStage { value: raw });
            DealStage::Unspecified
        }),
    };

    let owner_id = owner_reference(record).and_then(|reference| {
        let resolved = owners.get(&reference).cloned();
        if resolved.is_none() {
            warnings.push(TransformWarning::UnresolvedOwner { reference });
        }
        resolved
    });

    let created_time = timestamp_field(fields, CREATED_FIELDS, "created_time", &mut warnings);
    let modified_time = timestamp_field(fields, MODIFIED_FIELDS, "modified_time", &mut warnings);

    let amount = field(fields, AMOUNT_FIELDS).and_then(|v| {
        let parsed = parse_amount(v);
        if parsed.is_none() {
            warnings.push(TransformWarning::MalformedAmount {
                value: display_value(v),
            });
        }
        parsed
    });

    let closing_date = field(fields, CLOSING_FIELDS).and_then(|v| {
        let parsed = parse_date(v);
        if parsed.is_none() {
            warnings.push(TransformWarning::MalformedDate {
                field: "closing_date".to_string(),
                value: display_value(v),
            });
        }
        parsed
    });

    Ok(MigratedDealRecord {
        id: MigratedDealRecord::target_id(&legacy_id),
        legacy_id,
        source_row: record.source_row,
        name,
        stage,
        owner_id,
        amount,
        closing_date,
        created_time,
        modified_time,
        warnings,
    })
}

/// The legacy identity if it can be read, used to label skipped records.
pub fn identity_hint(record: &LegacyDealRecord) -> Option<String> {
    legacy_identity(field(&record.fields, ID_FIELDS)).ok()
}

/// The owner reference exactly as the transformer will look it up.
/// Zoho exports the owner either as a bare id or as `{"id": .., "name": ..}`.
pub fn owner_reference(record: &LegacyDealRecord) -> Option<String> {
    match field(&record.fields, OWNER_FIELDS)? {
        Value::Object(map) => map.get("id").and_then(scalar_text),
        other => scalar_text(other),
    }
}

fn field<'a>(fields: &'a Value, aliases: &[&str]) -> Option<&'a Value> {
    aliases
        .iter()
        .find_map(|key| fields.get(*key))
        .filter(|v| !v.is_null())
}

fn legacy_identity(value: Option<&Value>) -> Result<String, ValidationError> {
    match value {
        None => Err(ValidationError::MissingField("id")),
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                Err(ValidationError::MissingField("id"))
            } else {
                Ok(trimmed.to_string())
            }
        }
        Some(Value::Number(n)) => n
            .as_u64()
            .map(|id| id.to_string())
            .ok_or_else(|| ValidationError::InvalidIdentity(format!("number {n}"))),
        Some(Value::Bool(_)) => Err(ValidationError::InvalidIdentity("boolean".into())),
        Some(Value::Array(_)) => Err(ValidationError::InvalidIdentity("array".into())),
        Some(Value::Object(_)) => Err(ValidationError::InvalidIdentity("object".into())),
        Some(Value::Null) => Err(ValidationError::MissingField("id")),
    }
}

/// Non-blank string or number rendered as text.
fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn timestamp_field(
    fields: &Value,
    aliases: &[&str],
    name: &str,
    warnings: &mut Vec<TransformWarning>,
) -> Option<DateTime<Utc>> {
    let value = field(fields, aliases)?;
    let parsed = parse_timestamp(value);
    if parsed.is_none() {
        warnings.push(TransformWarning::MalformedTimestamp {
            field: name.to_string(),
            value: display_value(value),
        });
    }
    parsed
}

/// Accepts RFC 3339, naive `YYYY-MM-DD[ T]HH:MM:SS[.f]` (taken as UTC), bare
/// and compact (`YYYYMMDD`) dates, and unix epochs in seconds or milliseconds.
///
/// Results are truncated to microseconds, the precision `TIMESTAMPTZ` stores.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let parsed = match value {
        Value::Number(n) => n.as_i64().and_then(from_epoch),
        Value::String(s) => parse_timestamp_str(s.trim()),
        _ => None,
    };
    parsed.map(|ts| ts.trunc_subsecs(6))
}

fn parse_timestamp_str(s: &str) -> Option<DateTime<Utc>> {
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return date
            .and_hms_opt(0, 0, 0)
            .map(|naive| Utc.from_utc_datetime(&naive));
    }
    if s.chars().all(|c| c.is_ascii_digit()) {
        // Eight digits is a compact date; a real epoch that short is early 1970.
        if s.len() == 8 {
            return NaiveDate::parse_from_str(s, "%Y%m%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
                .map(|naive| Utc.from_utc_datetime(&naive));
        }
        return s.parse::<i64>().ok().and_then(from_epoch);
    }
    None
}

fn from_epoch(n: i64) -> Option<DateTime<Utc>> {
    // Anything past ~5138 AD in seconds is really milliseconds.
    if n.abs() >= 100_000_000_000 {
        DateTime::from_timestamp_millis(n)
    } else {
        DateTime::from_timestamp(n, 0)
    }
}

fn parse_amount(value: &Value) -> Option<f64> {
    let amount = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s
            .trim()
            .trim_start_matches(['$', '€', '£'])
            .replace(',', "")
            .parse::<f64>()
            .ok()?,
        _ => return None,
    };
    amount.is_finite().then_some(amount)
}

fn parse_date(value: &Value) -> Option<NaiveDate> {
    if let Value::String(s) = value {
        if let Ok(date) = NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d") {
            return Some(date);
        }
    }
    parse_timestamp(value).map(|ts| ts.date_naive())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(row: i64, fields: Value) -> LegacyDealRecord {
        LegacyDealRecord {
            source_row: row,
            fields,
        }
    }

    fn owners() -> HashMap<String, String> {
        HashMap::from([("valid-id".to_string(), "valid-id".to_string())])
    }

    #[test]
    fn test_clean_record_has_no_warnings() {
        let r = record(
            3,
            json!({"id": 3, "name": "Kathy Longo", "owner": "valid-id", "stage": "Closed Won"}),
        );
        let migrated = transform(&r, &owners()).unwrap();
        assert_eq!(migrated.legacy_id, "3");
        assert_eq!(migrated.name, "Kathy Longo");
        assert_eq!(migrated.owner_id.as_deref(), Some("valid-id"));
        assert_eq!(migrated.stage, DealStage::ClosedWon);
        assert!(migrated.warnings.is_empty());
        assert_eq!(migrated.id, MigratedDealRecord::target_id("3"));
    }

    #[test]
    fn test_unknown_owner_is_a_warning() {
        let r = record(
            1,
            json!({"id": 1, "name": "Jerry Fedeff", "owner": "unknown-owner-id"}),
        );
        let migrated = transform(&r, &owners()).unwrap();
        assert_eq!(migrated.owner_id, None);
        assert_eq!(
            migrated.warnings,
            vec![TransformWarning::UnresolvedOwner {
                reference: "unknown-owner-id".into()
            }]
        );
    }

    #[test]
    fn test_blank_name_fails() {
        let r = record(2, json!({"id": 2, "name": "  ", "owner": "valid-id"}));
        let err = transform(&r, &owners()).unwrap_err();
        assert_eq!(err, ValidationError::MissingField("name"));
        assert_eq!(err.to_string(), "missing name");
    }

    #[test]
    fn test_missing_identity_fails() {
        let r = record(9, json!({"name": "No Id"}));
        assert_eq!(
            transform(&r, &owners()).unwrap_err(),
            ValidationError::MissingField("id")
        );
    }

    #[test]
    fn test_incompatible_identity_fails() {
        for bad in [json!(true), json!(1.5), json!(-3), json!({"x": 1})] {
            let r = record(9, json!({"id": bad, "name": "Odd"}));
            assert!(matches!(
                transform(&r, &owners()),
                Err(ValidationError::InvalidIdentity(_))
            ));
        }
    }

    #[test]
    fn test_zoho_api_field_names_are_accepted() {
        let r = record(
            5,
            json!({
                "Deal_Id": "4150868000001234",
                "Deal_Name": "Acme renewal",
                "Owner": {"id": "valid-id", "name": "Sam"},
                "Stage": "Negotiation/Review",
                "Amount": "$12,500.00",
                "Closing_Date": "2024-03-31",
                "Created_Time": "2023-05-01T10:20:30+05:30"
            }),
        );
        let migrated = transform(&r, &owners()).unwrap();
        assert_eq!(migrated.legacy_id, "4150868000001234");
        assert_eq!(migrated.owner_id.as_deref(), Some("valid-id"));
        assert_eq!(migrated.stage, DealStage::NegotiationReview);
        assert_eq!(migrated.amount, Some(12500.0));
        assert_eq!(
            migrated.closing_date,
            NaiveDate::from_ymd_opt(2024, 3, 31)
        );
        assert_eq!(
            migrated.created_time.unwrap().to_rfc3339(),
            "2023-05-01T04:50:30+00:00"
        );
        assert!(migrated.warnings.is_empty());
    }

    #[test]
    fn test_malformed_values_downgrade_to_warnings() {
        let r = record(
            6,
            json!({
                "id": "6",
                "name": "Messy",
                "stage": "Pending Magic",
                "created_at": "last tuesday",
                "amount": "lots",
                "closing_date": "soon"
            }),
        );
        let migrated = transform(&r, &owners()).unwrap();
        assert_eq!(migrated.stage, DealStage::Unspecified);
        assert_eq!(migrated.created_time, None);
        assert_eq!(migrated.amount, None);
        assert_eq!(migrated.closing_date, None);
        assert_eq!(migrated.warnings.len(), 4);
    }

    #[test]
    fn test_missing_optional_fields_are_silent() {
        let r = record(7, json!({"id": 7, "name": "Bare"}));
        let migrated = transform(&r, &owners()).unwrap();
        assert_eq!(migrated.stage, DealStage::Unspecified);
        assert!(migrated.warnings.is_empty());
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2023, 5, 1, 10, 20, 30).unwrap();
        for raw in [
            json!("2023-05-01T10:20:30Z"),
            json!("2023-05-01 10:20:30"),
            json!("2023-05-01T10:20:30"),
            json!(1682936430),
            json!(1682936430000_i64),
            json!("1682936430"),
        ] {
            assert_eq!(parse_timestamp(&raw), Some(expected), "{raw}");
        }
        assert_eq!(
            parse_timestamp(&json!("2023-05-01")),
            Utc.with_ymd_and_hms(2023, 5, 1, 0, 0, 0).single()
        );
        assert_eq!(parse_timestamp(&json!("not a date")), None);
    }

    #[test]
    fn test_compact_dates_are_not_epochs() {
        assert_eq!(
            parse_timestamp(&json!("20230501")),
            Utc.with_ymd_and_hms(2023, 5, 1, 0, 0, 0).single()
        );
        assert_eq!(parse_timestamp(&json!("20231341")), None);

        let migrated = transform(
            &record(1, json!({"id": 1, "name": "Acme", "created_time": "20230501", "closing_date": "20230615"})),
            &HashMap::new(),
        )
        .unwrap();
        assert!(migrated.warnings.is_empty(), "{:?}", migrated.warnings);
        assert_eq!(
            migrated.created_time,
            Utc.with_ymd_and_hms(2023, 5, 1, 0, 0, 0).single()
        );
        assert_eq!(migrated.closing_date, NaiveDate::from_ymd_opt(2023, 6, 15));
    }

    #[test]
    fn test_timestamps_keep_only_microseconds() {
        let ts = parse_timestamp(&json!("2023-05-01T10:20:30.123456789Z")).unwrap();
        assert_eq!(ts.timestamp_subsec_nanos(), 123_456_000);

        let a = transform(
            &record(1, json!({"id": 1, "name": "Acme", "modified_time": "2023-05-01T10:20:30.123456789Z"})),
            &HashMap::new(),
        )
        .unwrap();
        let b = transform(
            &record(1, json!({"id": 1, "name": "Acme", "modified_time": "2023-05-01T10:20:30.123456Z"})),
            &HashMap::new(),
        )
        .unwrap();
        assert!(a.same_content(&b));
    }

    #[test]
    fn test_identity_hint() {
        assert_eq!(
            identity_hint(&record(2, json!({"id": 2, "name": ""}))),
            Some("2".into())
        );
        assert_eq!(identity_hint(&record(2, json!({"name": "x"}))), None);
    }

    #[test]
    fn test_owner_reference_shapes() {
        assert_eq!(
            owner_reference(&record(1, json!({"owner": " abc "}))),
            Some("abc".into())
        );
        assert_eq!(
            owner_reference(&record(1, json!({"Owner": {"id": 77}}))),
            Some("77".into())
        );
        assert_eq!(owner_reference(&record(1, json!({"owner": ""}))), None);
    }
}
