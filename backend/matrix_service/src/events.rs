//! Events handed from the placement path to the payout worker, and the
//! ledger records the worker persists.

use matrix_engine::{CycleRecord, FillEvent, PlacementOutcome};
use serde::{Deserialize, Serialize};

/// All event kinds produced by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A position was confirmed for a member.
    PositionFilled,
    /// A position's window completed.
    CycleCompleted,
}

impl EventKind {
    /// Return a short identifier string suitable for logs and webhooks.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PositionFilled => "position_filled",
            Self::CycleCompleted => "cycle_completed",
        }
    }
}

/// A committed engine event awaiting payout processing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    PositionFilled(FillEvent),
    CycleCompleted(CycleRecord),
}

impl EngineEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::PositionFilled(_) => EventKind::PositionFilled,
            Self::CycleCompleted(_) => EventKind::CycleCompleted,
        }
    }

    /// The fill first, then every cycle it completed.
    pub fn from_outcome(outcome: &PlacementOutcome) -> Vec<EngineEvent> {
        std::iter::once(Self::PositionFilled(outcome.fill.clone()))
            .chain(outcome.cycles.iter().cloned().map(Self::CycleCompleted))
            .collect()
    }
}

/// A payout row as stored in / read from the ledger.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PayoutRecord {
    pub id: i64,
    pub idempotency_key: String,
    pub run_id: i64,
    pub matrix_id: i64,
    pub member_id: i64,
    pub amount: String,
    pub currency: String,
    pub reason: String,
    pub level: Option<i64>,
    pub created_at: i64,
}

/// A cycle audit row. `participants` holds a JSON array of member ids.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CycleRow {
    pub run_id: i64,
    pub id: i64,
    pub matrix_id: i64,
    pub root_position: i64,
    pub completer: i64,
    pub participants: String,
    pub completion_bonus: String,
    pub completed_at: i64,
}
