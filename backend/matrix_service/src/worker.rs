//! Long-running background task that turns engine events into ledger
//! payouts, cycle audit rows and re-entry placements.
//!
//! Events arrive over a bounded channel from the API. Re-entries produce new
//! events of their own; those are handled in the same pass rather than sent
//! back through the channel, which the worker itself drains.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use matrix_engine::{
    CycleRecord, FillEvent, MatrixEngine, MatrixId, PayoutInstruction, ReentryOutcome, RunId,
};
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db;
use crate::errors::{Result, ServiceError};
use crate::events::EngineEvent;
use crate::notify::Notifier;

const INITIAL_RETRY_SECS: u64 = 2;
const MAX_RETRY_SECS: u64 = 60;

pub struct WorkerState {
    pub engine: MatrixEngine,
    pub pool: SqlitePool,
    pub notifier: Option<Notifier>,
    pub payout_max_retries: u32,
}

/// Run the worker until `cancel` fires or every sender is gone.
///
/// Events already queued at shutdown are still processed.
pub async fn run(
    state: Arc<WorkerState>,
    mut rx: mpsc::Receiver<EngineEvent>,
    cancel: CancellationToken,
) {
    info!("Payout worker started");

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        handle(&state, event).await;
    }

    rx.close();
    while let Some(event) = rx.recv().await {
        handle(&state, event).await;
    }
    info!("Payout worker stopped");
}

/// Process one event and every follow-up event it causes.
pub async fn handle(state: &WorkerState, event: EngineEvent) {
    let mut queue = VecDeque::from([event]);
    while let Some(event) = queue.pop_front() {
        match process_event(state, &event).await {
            Ok(follow_ups) => queue.extend(follow_ups),
            Err(e) => error!("Failed to process {} event: {e}", event.kind().as_str()),
        }

        if let Some(notifier) = &state.notifier {
            if let Err(e) = notifier.publish(&event).await {
                warn!("Dropping {} notification: {e}", event.kind().as_str());
            }
        }
    }
}

/// Apply a single event. Returns the events produced by re-entry placements.
async fn process_event(state: &WorkerState, event: &EngineEvent) -> Result<Vec<EngineEvent>> {
    match event {
        EngineEvent::PositionFilled(fill) => {
            process_fill(state, fill).await?;
            Ok(Vec::new())
        }
        EngineEvent::CycleCompleted(record) => process_cycle(state, record).await,
    }
}

async fn process_fill(state: &WorkerState, fill: &FillEvent) -> Result<()> {
    let payouts = state.engine.payouts_for_fill(fill)?;
    let recorded = record_all(state, fill.run, fill.matrix_id, &payouts).await;
    debug!(
        "Fill of {} in {}: {recorded}/{} payouts recorded",
        fill.position,
        fill.matrix_id,
        payouts.len()
    );
    Ok(())
}

async fn process_cycle(state: &WorkerState, record: &CycleRecord) -> Result<Vec<EngineEvent>> {
    if !db::insert_cycle_record(&state.pool, record).await? {
        debug!("Cycle {} already in the audit log", record.id);
    }

    let payouts = state.engine.payouts_for_cycle(record)?;
    let recorded = record_all(state, record.run, record.matrix_id, &payouts).await;
    info!(
        "Cycle {} of {} at {}: {recorded}/{} payouts recorded",
        record.id,
        record.matrix_id,
        record.root,
        payouts.len()
    );

    let engine = state.engine.clone();
    let cycle = record.clone();
    let outcome = tokio::task::spawn_blocking(move || engine.reenter(&cycle)).await??;

    let follow_ups = match outcome {
        ReentryOutcome::Placed {
            placements,
            skipped,
        } => {
            if skipped > 0 {
                warn!(
                    "Cycle {}: {skipped} re-entries skipped, matrix {} is full",
                    record.id, record.matrix_id
                );
            }
            placements.iter().flat_map(EngineEvent::from_outcome).collect()
        }
        ReentryOutcome::Disabled | ReentryOutcome::AlreadyProcessed => Vec::new(),
    };
    Ok(follow_ups)
}

/// Record every payout, logging failures. Returns how many were new.
async fn record_all(
    state: &WorkerState,
    run: RunId,
    matrix_id: MatrixId,
    payouts: &[PayoutInstruction],
) -> usize {
    let mut recorded = 0;
    for payout in payouts {
        match record_with_retry(state, run, matrix_id, payout).await {
            Ok(true) => recorded += 1,
            Ok(false) => {}
            Err(e) => error!(
                "Payout {} to {} not recorded: {e}",
                payout.idempotency_key, payout.member
            ),
        }
    }
    recorded
}

/// Write a payout to the ledger, retrying transient database errors.
///
/// Returns `false` if an earlier attempt had already recorded it.
async fn record_with_retry(
    state: &WorkerState,
    run: RunId,
    matrix_id: MatrixId,
    payout: &PayoutInstruction,
) -> Result<bool> {
    let mut backoff = Duration::from_secs(INITIAL_RETRY_SECS);
    let max_backoff = Duration::from_secs(MAX_RETRY_SECS);
    let mut attempt = 1;

    loop {
        match db::record_payout(&state.pool, run, matrix_id, payout).await {
            Ok(()) => return Ok(true),
            Err(ServiceError::PayoutIdempotencyViolation(key)) => {
                debug!("Payout {key} already recorded");
                return Ok(false);
            }
            Err(e) if attempt < state.payout_max_retries => {
                warn!("Ledger write failed (attempt {attempt}, retry in {backoff:?}): {e}");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(max_backoff);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
