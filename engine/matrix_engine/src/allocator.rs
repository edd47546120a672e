//! Position allocation.
//!
//! ## Resilience
//!
//! * Placement is planned under the matrix read lock and claimed under the
//!   write lock with a compare-and-swap against the slot state seen while
//!   planning. A lost race surfaces as `ConcurrentSlotConflict` and is retried
//!   with exponential back-off, up to [`MAX_CLAIM_ATTEMPTS`].
//! * The last attempt plans and claims under one write lock, so callers never
//!   observe the conflict.

use std::thread;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::SpilloverOrder;
use crate::detector::CycleDetector;
use crate::error::{EngineError, Result};
use crate::storage::{MatrixStore, MatrixTree};
use crate::types::{
    EntryKind, FillEvent, MatrixId, MemberId, PlacementOutcome, Position, PositionId,
    PositionStatus,
};

pub const MAX_CLAIM_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_micros(200);
const MAX_BACKOFF: Duration = Duration::from_millis(10);

/// Input of a placement: who enters which matrix, under whom.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlacementRequest {
    pub matrix_id: MatrixId,
    pub sponsor: Option<MemberId>,
    pub member: MemberId,
    pub entry: EntryKind,
}

/// Where a claim will land, as observed while planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    /// The matrix is empty; open a root.
    Root,
    /// A free child slot.
    Slot { parent: PositionId, slot: usize },
    /// An `Empty` position left behind by a cancel or admin reset.
    Reuse(PositionId),
}

pub struct PositionAllocator<'a> {
    store: &'a MatrixStore,
}

impl<'a> PositionAllocator<'a> {
    pub fn new(store: &'a MatrixStore) -> Self {
        Self { store }
    }

    /// Claim and confirm in one step.
    pub fn place(&self, request: PlacementRequest) -> Result<PlacementOutcome> {
        let position = self.claim(request)?;
        self.confirm(request.matrix_id, position.id)
    }

    /// Reserve a slot for `request.member`, leaving it `Pending`.
    pub fn claim(&self, request: PlacementRequest) -> Result<Position> {
        let matrix = self.store.matrix(request.matrix_id)?;
        if !matrix.is_enabled() {
            return Err(EngineError::MatrixDisabled(request.matrix_id));
        }
        self.store.member(request.member)?;
        let upline = request
            .sponsor
            .map(|sponsor| self.store.upline(sponsor))
            .unwrap_or_default();

        let mut backoff = INITIAL_BACKOFF;
        for attempt in 1..MAX_CLAIM_ATTEMPTS {
            let target = plan(&matrix.read(), &upline)?;
            let mut tree = matrix.write();
            match commit(&mut tree, target, &request) {
                Ok(id) => return Ok(tree.position(id)?.clone()),
                Err(EngineError::ConcurrentSlotConflict(_)) => {
                    drop(tree);
                    debug!(
                        "Slot conflict for member {} (attempt {attempt}), retrying in {backoff:?}",
                        request.member
                    );
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(e) => return Err(e),
            }
        }

        warn!(
            "Member {} still contended after {} attempts; claiming under the write lock",
            request.member,
            MAX_CLAIM_ATTEMPTS - 1
        );
        let mut tree = matrix.write();
        let target = plan(&tree, &upline)?;
        let id = commit(&mut tree, target, &request)?;
        Ok(tree.position(id)?.clone())
    }

    /// Move a `Pending` position to `Filled` and run cycle detection under
    /// the same write lock.
    pub fn confirm(&self, matrix_id: MatrixId, position_id: PositionId) -> Result<PlacementOutcome> {
        let matrix = self.store.matrix(matrix_id)?;
        let mut tree = matrix.write();

        let current = tree.position(position_id)?;
        let (Some(member), PositionStatus::Pending) = (current.owner, current.status) else {
            return Err(EngineError::InvalidTransition {
                position: position_id,
                from: current.status,
                to: PositionStatus::Filled,
            });
        };

        tree.transition(position_id, PositionStatus::Filled)?;
        let now = Utc::now();
        let position = tree.position_mut(position_id)?;
        position.filled_at = Some(now);
        position.fill_seq += 1;

        let detection = CycleDetector::new(self.store).on_fill(&mut tree, position_id, now)?;
        let position = tree.position(position_id)?.clone();
        info!(
            "Member {member} placed at {position_id} (level {}) in matrix {matrix_id}",
            position.level
        );

        let fill = FillEvent {
            run: self.store.run(),
            matrix_id,
            position: position_id,
            fill_seq: position.fill_seq,
            member,
            sponsor: position.sponsor,
            level: position.level,
            entry: position.entry,
            upline: detection.upline,
            completed_rows: detection.completed_rows,
            filled_at: now,
        };
        Ok(PlacementOutcome {
            position,
            fill,
            cycles: detection.cycles,
        })
    }

    /// Release a `Pending` claim. The position stays linked as `Empty` and is
    /// handed to the next placement that reaches it.
    pub fn cancel(&self, matrix_id: MatrixId, position_id: PositionId) -> Result<Position> {
        let matrix = self.store.matrix(matrix_id)?;
        let mut tree = matrix.write();
        let status = tree.position(position_id)?.status;
        if status != PositionStatus::Pending {
            return Err(EngineError::InvalidTransition {
                position: position_id,
                from: status,
                to: PositionStatus::Empty,
            });
        }
        tree.transition(position_id, PositionStatus::Empty)?;
        info!("Claim on {position_id} in matrix {matrix_id} cancelled");
        Ok(tree.position(position_id)?.clone())
    }
}

// ─────────────────────────────────────────────────────────
// Planning
// ─────────────────────────────────────────────────────────

fn plan(tree: &MatrixTree, upline: &[MemberId]) -> Result<Target> {
    if tree.is_empty() {
        return Ok(Target::Root);
    }
    let full = EngineError::MatrixFull(tree.config().id);

    if let Some(anchor) = upline.iter().find_map(|m| tree.latest_active(*m)) {
        return search(tree, anchor).ok_or(full);
    }
    house(tree).ok_or(full)
}

/// Breadth-first search of `anchor`'s window, one row at a time.
fn search(tree: &MatrixTree, anchor: PositionId) -> Option<Target> {
    let config = tree.config();
    // (position, index of the anchor's child this branch hangs from)
    let mut frontier: Vec<(PositionId, Option<usize>)> = vec![(anchor, None)];

    for _row in 1..=config.depth {
        let mut candidates: Vec<(Target, usize)> = Vec::new();
        let mut next = Vec::new();

        for &(node, branch) in &frontier {
            let Some(parent) = tree.get(node) else { continue };
            // Blocked and cycled positions are walked through, never extended.
            let open = parent.status.accepts_descendants();
            for (slot, child) in parent.children.iter().enumerate() {
                let branch = branch.unwrap_or(slot);
                match child.and_then(|id| tree.get(id)) {
                    None if open => candidates.push((Target::Slot { parent: node, slot }, branch)),
                    None => {}
                    Some(c) if open && c.status == PositionStatus::Empty => {
                        candidates.push((Target::Reuse(c.id), branch))
                    }
                    Some(c) => next.push((c.id, Some(branch))),
                }
            }
        }

        if !candidates.is_empty() {
            return Some(pick(tree, anchor, candidates, config.spillover));
        }
        if next.is_empty() {
            break;
        }
        frontier = next;
    }
    None
}

fn pick(
    tree: &MatrixTree,
    anchor: PositionId,
    candidates: Vec<(Target, usize)>,
    order: SpilloverOrder,
) -> Target {
    match order {
        SpilloverOrder::LeftToRight => candidates[0].0,
        SpilloverOrder::Balanced => {
            candidates
                .iter()
                .enumerate()
                .min_by_key(|(index, (_, branch))| (branch_load(tree, anchor, *branch), *index))
                .map(|(_, (target, _))| *target)
                .unwrap_or(candidates[0].0)
        }
    }
}

/// Occupied positions in the anchor's window that hang from child `branch`.
fn branch_load(tree: &MatrixTree, anchor: PositionId, branch: usize) -> u64 {
    let child = tree
        .get(anchor)
        .and_then(|a| a.children.get(branch).copied().flatten())
        .and_then(|id| tree.get(id));
    match child {
        Some(c) if c.status.is_occupied() => {
            let rows = tree.config().depth as usize - 1;
            1 + c.window_fill.iter().take(rows).sum::<u64>()
        }
        _ => 0,
    }
}

/// Placement for a member without an active upline: the first free slot of
/// the earliest filled position, then of the earliest pending one, or an
/// abandoned root.
fn house(tree: &MatrixTree) -> Option<Target> {
    let free_under = |status: PositionStatus| {
        tree.positions()
            .iter()
            .filter(|p| p.status == status)
            .find_map(|p| {
                p.children
                    .iter()
                    .enumerate()
                    .find_map(|(slot, child)| match child.and_then(|id| tree.get(id)) {
                        None => Some(Target::Slot { parent: p.id, slot }),
                        Some(c) if c.status == PositionStatus::Empty => Some(Target::Reuse(c.id)),
                        Some(_) => None,
                    })
            })
    };

    free_under(PositionStatus::Filled)
        .or_else(|| free_under(PositionStatus::Pending))
        .or_else(|| {
            tree.positions()
                .iter()
                .find(|p| p.parent.is_none() && p.status == PositionStatus::Empty)
                .map(|p| Target::Reuse(p.id))
        })
}

// ─────────────────────────────────────────────────────────
// Claiming
// ─────────────────────────────────────────────────────────

/// Compare the planned target against the current tree and claim it.
fn commit(tree: &mut MatrixTree, target: Target, request: &PlacementRequest) -> Result<PositionId> {
    let conflict = EngineError::ConcurrentSlotConflict(request.matrix_id);
    let now = Utc::now();

    let id = match target {
        Target::Root => {
            if !tree.is_empty() {
                return Err(conflict);
            }
            tree.insert(None, request.member, request.sponsor, request.entry, now)
        }
        Target::Slot { parent, slot } => {
            let p = tree.position(parent)?;
            if !p.status.accepts_descendants() || p.children[slot].is_some() {
                return Err(conflict);
            }
            tree.insert(
                Some((parent, slot)),
                request.member,
                request.sponsor,
                request.entry,
                now,
            )
        }
        Target::Reuse(id) => {
            let position = tree.position(id)?;
            let parent_open = match position.parent {
                Some(parent) => tree.position(parent)?.status.accepts_descendants(),
                None => true,
            };
            if position.status != PositionStatus::Empty || !parent_open {
                return Err(conflict);
            }
            tree.reassign(id, request.member, request.sponsor, request.entry)?;
            id
        }
    };
    debug!(
        "Claimed {id} for member {} in matrix {}",
        request.member, request.matrix_id
    );
    Ok(id)
}
