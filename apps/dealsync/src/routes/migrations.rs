use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use tokio::sync::Mutex;

use crate::errors::AppError;
use crate::migration::checkpoint::{Checkpoint, CheckpointStore, PgCheckpointStore};
use crate::migration::controller::{RunOptions, MAX_BATCH_SIZE};
use crate::migration::report::{MigrationReport, RunStatus};
use crate::migration::{progress_tracker, run_deal_backfill, ZOHO_DEALS};
use crate::progress::JobProgress;
use crate::state::AppState;

fn validate_run_options(options: &RunOptions) -> Result<(), AppError> {
    if !(1..=MAX_BATCH_SIZE).contains(&options.batch_size) {
        return Err(AppError::Validation(format!(
            "batch_size must be between 1 and {MAX_BATCH_SIZE}"
        )));
    }
    if options.resume && options.start_after.is_some() {
        return Err(AppError::Validation(
            "resume and start_after are mutually exclusive".to_string(),
        ));
    }
    Ok(())
}

fn known_migration(name: &str) -> Result<(), AppError> {
    if name == ZOHO_DEALS {
        Ok(())
    } else {
        Err(AppError::NotFound(format!("Unknown migration '{name}'")))
    }
}

/// Takes the backfill lock and runs `work` on its own task.
/// The lock travels with the task, so a dropped caller neither cancels the run
/// nor frees the lock before the run finishes.
async fn run_detached<T, F>(lock: Arc<Mutex<()>>, work: F) -> Result<T, AppError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, AppError>> + Send + 'static,
{
    let guard = lock
        .try_lock_owned()
        .map_err(|_| AppError::Conflict("A backfill is already running".to_string()))?;
    let handle = tokio::spawn(async move {
        let _guard = guard;
        work.await
    });
    match handle.await {
        Ok(result) => result,
        Err(e) => Err(AppError::Internal(anyhow::anyhow!("backfill task failed: {e}"))),
    }
}

/// POST /api/v1/migrations/zoho_deals/run
/// Runs to completion and returns the report: 200 when completed, 422 when aborted.
pub async fn handle_run(
    State(state): State<AppState>,
    Json(options): Json<RunOptions>,
) -> Result<(StatusCode, Json<MigrationReport>), AppError> {
    validate_run_options(&options)?;
    let lock = Arc::clone(&state.backfill_lock);
    let report = run_detached(lock, async move {
        Ok(run_deal_backfill(&state, &options).await?)
    })
    .await?;
    let status = match report.status {
        RunStatus::Completed => StatusCode::OK,
        RunStatus::Aborted => StatusCode::UNPROCESSABLE_ENTITY,
    };
    Ok((status, Json(report)))
}

/// GET /api/v1/migrations/:name/checkpoint
pub async fn handle_checkpoint(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Checkpoint>, AppError> {
    known_migration(&name)?;
    let checkpoint = PgCheckpointStore::new(state.db.clone())
        .load(&name)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("No checkpoint for '{name}'")))?;
    Ok(Json(checkpoint))
}

/// GET /api/v1/migrations/:name/progress
pub async fn handle_progress(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<JobProgress>, AppError> {
    known_migration(&name)?;
    let progress = progress_tracker(&state)
        .latest(&name)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("No recent progress for '{name}'")))?;
    Ok(Json(progress))
}
