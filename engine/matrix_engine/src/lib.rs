//! # Matrix Engine
//!
//! Placement and cycling engine for forced matrices: fixed-width,
//! fixed-depth trees that members are placed into, that "cycle" once a
//! position's window below it is full, and that pay bonuses along the way.
//!
//! | Phase        | Entry Point(s)                                                  |
//! |--------------|-----------------------------------------------------------------|
//! | Admin        | [`MatrixEngine::create_matrix`], `disable_matrix`, `block_position`, `reset_position` |
//! | Registration | [`MatrixEngine::register_member`]                               |
//! | Placement    | [`MatrixEngine::place_member`], `claim_position`, `confirm_position`, `cancel_position` |
//! | Payouts      | [`MatrixEngine::payouts_for_fill`], `payouts_for_cycle`         |
//! | Re-entry     | [`MatrixEngine::reenter`]                                       |
//! | Queries      | `config`, `position`, `positions_of`, `cycles`                  |
//!
//! ## Architecture
//!
//! State lives in a [`MatrixStore`] owned by the caller and shared by handle.
//! Allocation is delegated to [`allocator`], completion to [`detector`],
//! payouts to [`bonus`] and re-entry to [`reentry`]. This file contains only
//! the public entry points.
//!
//! The engine is synchronous. Placement may sleep briefly while backing off
//! from a contended slot, so async callers should run it on a blocking pool.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;

pub mod allocator;
pub mod bonus;
pub mod config;
pub mod detector;
pub mod error;
pub mod reentry;
pub mod storage;
pub mod types;

#[cfg(test)]
mod test_concurrency;
#[cfg(test)]
mod test_placement;

pub use allocator::{PlacementRequest, PositionAllocator};
pub use bonus::BonusCalculator;
pub use config::{
    BonusRates, ConfigError, MatrixConfig, PayoutPlan, ReentryPolicy, SpilloverOrder,
};
pub use detector::CycleDetector;
pub use error::{EngineError, Result};
pub use reentry::{ReentryOutcome, ReentryScheduler};
pub use storage::MatrixStore;
pub use types::*;

#[derive(Debug, Clone, Default)]
pub struct MatrixEngine {
    store: Arc<MatrixStore>,
}

impl MatrixEngine {
    pub fn new(store: Arc<MatrixStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<MatrixStore> {
        &self.store
    }

    // ─────────────────────────────────────────────────────────
    // Admin
    // ─────────────────────────────────────────────────────────

    /// Validate and register a new matrix.
    pub fn create_matrix(&self, config: MatrixConfig) -> Result<Arc<MatrixConfig>> {
        self.store.create_matrix(config)
    }

    pub fn disable_matrix(&self, matrix_id: MatrixId) -> Result<()> {
        self.store.disable_matrix(matrix_id)
    }

    /// Administratively disable a `Filled` or `Empty` position. A filled
    /// position stops counting towards its ancestors' windows.
    pub fn block_position(&self, matrix_id: MatrixId, position_id: PositionId) -> Result<Position> {
        let matrix = self.store.matrix(matrix_id)?;
        let mut tree = matrix.write();
        let was_filled = tree.position(position_id)?.status == PositionStatus::Filled;
        tree.transition(position_id, PositionStatus::Blocked)?;
        if was_filled {
            CycleDetector::new(&self.store).on_release(&mut tree, position_id)?;
        }
        info!("Position {position_id} in matrix {matrix_id} blocked");
        Ok(tree.position(position_id)?.clone())
    }

    /// Return a `Blocked` position to `Empty` so it can be placed into again.
    pub fn reset_position(&self, matrix_id: MatrixId, position_id: PositionId) -> Result<Position> {
        let matrix = self.store.matrix(matrix_id)?;
        let mut tree = matrix.write();
        tree.transition(position_id, PositionStatus::Empty)?;
        info!("Position {position_id} in matrix {matrix_id} reset");
        Ok(tree.position(position_id)?.clone())
    }

    // ─────────────────────────────────────────────────────────
    // Registration & placement
    // ─────────────────────────────────────────────────────────

    pub fn register_member(&self, id: MemberId, sponsor: Option<MemberId>) -> Result<Member> {
        if let Some(sponsor) = sponsor {
            self.store.member(sponsor)?;
        }
        let member = Member {
            id,
            sponsor,
            joined_at: Utc::now(),
        };
        self.store.register_member(member.clone())?;
        Ok(member)
    }

    /// Place `member` under `sponsor` in `matrix_id` and confirm it.
    ///
    /// Fails with [`EngineError::MatrixFull`] when the sponsor's window has no
    /// capacity left.
    pub fn place_member(
        &self,
        sponsor: Option<MemberId>,
        matrix_id: MatrixId,
        member: MemberId,
    ) -> Result<PlacementOutcome> {
        PositionAllocator::new(&self.store).place(PlacementRequest {
            matrix_id,
            sponsor,
            member,
            entry: EntryKind::Fresh,
        })
    }

    /// Reserve a position without confirming it (e.g. while payment clears).
    pub fn claim_position(
        &self,
        sponsor: Option<MemberId>,
        matrix_id: MatrixId,
        member: MemberId,
    ) -> Result<Position> {
        PositionAllocator::new(&self.store).claim(PlacementRequest {
            matrix_id,
            sponsor,
            member,
            entry: EntryKind::Fresh,
        })
    }

    pub fn confirm_position(
        &self,
        matrix_id: MatrixId,
        position_id: PositionId,
    ) -> Result<PlacementOutcome> {
        PositionAllocator::new(&self.store).confirm(matrix_id, position_id)
    }

    pub fn cancel_position(&self, matrix_id: MatrixId, position_id: PositionId) -> Result<Position> {
        PositionAllocator::new(&self.store).cancel(matrix_id, position_id)
    }

    // ─────────────────────────────────────────────────────────
    // Payouts & re-entry
    // ─────────────────────────────────────────────────────────

    pub fn payouts_for_fill(&self, fill: &FillEvent) -> Result<Vec<PayoutInstruction>> {
        let matrix = self.store.matrix(fill.matrix_id)?;
        Ok(BonusCalculator::new(matrix.config()).for_fill(fill))
    }

    pub fn payouts_for_cycle(&self, record: &CycleRecord) -> Result<Vec<PayoutInstruction>> {
        let matrix = self.store.matrix(record.matrix_id)?;
        let sponsor = self.store.member(record.completer)?.sponsor;
        Ok(BonusCalculator::new(matrix.config()).for_cycle(record, sponsor))
    }

    pub fn reenter(&self, record: &CycleRecord) -> Result<ReentryOutcome> {
        ReentryScheduler::new(&self.store).on_cycle(record)
    }

    // ─────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────

    pub fn config(&self, matrix_id: MatrixId) -> Result<Arc<MatrixConfig>> {
        Ok(self.store.matrix(matrix_id)?.config().clone())
    }

    pub fn position(&self, matrix_id: MatrixId, position_id: PositionId) -> Result<Position> {
        let matrix = self.store.matrix(matrix_id)?;
        let tree = matrix.read();
        Ok(tree.position(position_id)?.clone())
    }

    pub fn positions_of(&self, matrix_id: MatrixId, member: MemberId) -> Result<Vec<Position>> {
        let matrix = self.store.matrix(matrix_id)?;
        let tree = matrix.read();
        Ok(tree.positions_of(member).cloned().collect())
    }

    pub fn cycles(&self, matrix_id: MatrixId) -> Result<Vec<CycleRecord>> {
        let matrix = self.store.matrix(matrix_id)?;
        let cycles = matrix.read().cycles().to_vec();
        Ok(cycles)
    }
}
