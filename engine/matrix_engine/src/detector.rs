//! Cycle detection.
//!
//! Every position keeps a per-row occupancy counter for its window
//! (`window_fill`). A confirmed fill bumps the counter of each ancestor
//! within `depth` levels; a block releases it again. Completion is then a
//! constant-time comparison against `width^row` per row instead of a subtree
//! walk.
//!
//! All functions here run while the caller holds the matrix write lock, which
//! makes the completion check and the `Filled -> Cycled` mark one atomic step:
//! no interleaving of fills can emit two records for the same root.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::config::{MatrixConfig, PayoutPlan};
use crate::error::Result;
use crate::storage::{MatrixStore, MatrixTree};
use crate::types::{CycleRecord, PositionId, PositionStatus, RowCompletion, WindowAncestor};

/// What a single fill changed above the filled position.
#[derive(Debug, Default)]
pub(crate) struct Detection {
    pub upline: Vec<WindowAncestor>,
    pub completed_rows: Vec<RowCompletion>,
    pub cycles: Vec<CycleRecord>,
}

pub struct CycleDetector<'a> {
    store: &'a MatrixStore,
}

impl<'a> CycleDetector<'a> {
    pub fn new(store: &'a MatrixStore) -> Self {
        Self { store }
    }

    /// Account for `filled` (just moved to `Filled`) and re-evaluate it and
    /// its window ancestors bottom-up.
    pub(crate) fn on_fill(
        &self,
        tree: &mut MatrixTree,
        filled: PositionId,
        now: DateTime<Utc>,
    ) -> Result<Detection> {
        let depth = tree.config().depth;
        let ancestors = tree.ancestors(filled, depth);
        let mut detection = Detection::default();

        for &(ancestor, distance) in &ancestors {
            let position = tree.position_mut(ancestor)?;
            position.window_fill[distance as usize - 1] += 1;
            if position.status == PositionStatus::Filled {
                if let Some(owner) = position.owner {
                    detection.upline.push(WindowAncestor {
                        position: ancestor,
                        owner,
                        distance,
                    });
                }
            }
        }

        // A reused position may already carry a subtree, so it is checked too.
        let candidates = std::iter::once(filled).chain(ancestors.iter().map(|(id, _)| *id));
        for candidate in candidates {
            self.evaluate(tree, candidate, now, &mut detection)?;
        }
        Ok(detection)
    }

    /// Undo the window accounting of a position that stops being occupied.
    pub(crate) fn on_release(&self, tree: &mut MatrixTree, released: PositionId) -> Result<()> {
        let depth = tree.config().depth;
        for (ancestor, distance) in tree.ancestors(released, depth) {
            let position = tree.position_mut(ancestor)?;
            let count = &mut position.window_fill[distance as usize - 1];
            *count = count.saturating_sub(1);
        }
        Ok(())
    }

    fn evaluate(
        &self,
        tree: &mut MatrixTree,
        candidate: PositionId,
        now: DateTime<Utc>,
        detection: &mut Detection,
    ) -> Result<()> {
        let config = tree.shared_config();
        let position = tree.position_mut(candidate)?;
        if position.status != PositionStatus::Filled {
            return Ok(());
        }
        let Some(owner) = position.owner else {
            return Ok(());
        };

        let mut complete = true;
        for row in 1..=config.depth {
            if position.window_fill[row as usize - 1] < config.row_capacity(row) {
                complete = false;
                continue;
            }
            if !position.is_row_completed(row) {
                position.completed_rows |= 1 << (row - 1);
                debug!("Row {row} of {candidate} complete in matrix {}", config.id);
                detection.completed_rows.push(RowCompletion {
                    position: candidate,
                    owner,
                    row,
                });
            }
        }
        if !complete {
            return Ok(());
        }

        tree.transition(candidate, PositionStatus::Cycled)?;
        let participants = tree
            .row(candidate, config.depth)
            .into_iter()
            .filter_map(|slot| slot.and_then(|id| tree.get(id)).and_then(|p| p.owner))
            .collect();

        let record = CycleRecord {
            run: self.store.run(),
            id: self.store.next_cycle_id(),
            matrix_id: config.id,
            root: candidate,
            completer: owner,
            participants,
            completion_bonus: completion_bonus(&config),
            completed_at: now,
        };
        info!(
            "Cycle {} completed in matrix {}: root {candidate}, completer {owner}",
            record.id, config.id
        );
        tree.push_cycle(record.clone());
        detection.cycles.push(record);
        Ok(())
    }
}

fn completion_bonus(config: &MatrixConfig) -> Decimal {
    match &config.payout {
        PayoutPlan::Cycle { completion_bonus } => *completion_bonus,
        PayoutPlan::PerLevel { .. } | PayoutPlan::PerCompletingLevel { .. } => Decimal::ZERO,
    }
}
