//! Automatic re-entry after a cycle.
//!
//! Progress is tracked per cycle record: each placement first reserves its
//! index, then runs, and gives the reservation back if it fails for any
//! reason other than a full matrix. A retried call therefore continues where
//! the previous one stopped and never grants more than the configured count.

use serde::Serialize;
use tracing::{info, warn};

use crate::allocator::{PlacementRequest, PositionAllocator};
use crate::error::{EngineError, Result};
use crate::storage::MatrixStore;
use crate::types::{CycleRecord, EntryKind, PlacementOutcome};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReentryOutcome {
    /// The matrix does not re-enter completers.
    Disabled,
    /// Every granted placement for this cycle has already been made.
    AlreadyProcessed,
    Placed {
        placements: Vec<PlacementOutcome>,
        /// Placements given up because the matrix had no capacity.
        skipped: u32,
    },
}

pub struct ReentryScheduler<'a> {
    store: &'a MatrixStore,
}

impl<'a> ReentryScheduler<'a> {
    pub fn new(store: &'a MatrixStore) -> Self {
        Self { store }
    }

    pub fn on_cycle(&self, record: &CycleRecord) -> Result<ReentryOutcome> {
        let matrix = self.store.matrix(record.matrix_id)?;
        let policy = &matrix.config().reentry;
        if !policy.enabled || policy.count == 0 {
            return Ok(ReentryOutcome::Disabled);
        }

        let sponsor = self.store.member(record.completer)?.sponsor;
        let allocator = PositionAllocator::new(self.store);
        let request = PlacementRequest {
            matrix_id: record.matrix_id,
            sponsor,
            member: record.completer,
            entry: EntryKind::Reentry { cycle: record.id },
        };

        let mut placements = Vec::new();
        let mut skipped = 0;
        while self.reserve(record, policy.count) {
            match allocator.place(request) {
                Ok(outcome) => {
                    info!(
                        "Member {} re-entered matrix {} at {} after cycle {}",
                        record.completer, record.matrix_id, outcome.position.id, record.id
                    );
                    placements.push(outcome);
                }
                Err(EngineError::MatrixFull(_)) => {
                    let remaining = self.exhaust(record, policy.count);
                    skipped = remaining + 1;
                    warn!(
                        "Matrix {} full; {skipped} re-entries for cycle {} dropped",
                        record.matrix_id, record.id
                    );
                    break;
                }
                Err(e) => {
                    self.release(record);
                    return Err(e);
                }
            }
        }

        if placements.is_empty() && skipped == 0 {
            return Ok(ReentryOutcome::AlreadyProcessed);
        }
        Ok(ReentryOutcome::Placed {
            placements,
            skipped,
        })
    }

    /// Take the next placement index for `record`, if any is left.
    fn reserve(&self, record: &CycleRecord, count: u32) -> bool {
        let mut progress = self.store.reentries();
        let done = progress.entry(record.id).or_insert(0);
        if *done >= count {
            return false;
        }
        *done += 1;
        true
    }

    fn release(&self, record: &CycleRecord) {
        if let Some(done) = self.store.reentries().get_mut(&record.id) {
            *done = done.saturating_sub(1);
        }
    }

    /// Mark every remaining placement as consumed; returns how many were left.
    fn exhaust(&self, record: &CycleRecord, count: u32) -> u32 {
        let mut progress = self.store.reentries();
        let done = progress.entry(record.id).or_insert(0);
        let remaining = count.saturating_sub(*done);
        *done = count;
        remaining
    }
}
