//! # Storage
//!
//! In-memory state of the engine, passed explicitly into every engine call.
//!
//! | Item                      | Lock                        | Description                                  |
//! |---------------------------|-----------------------------|----------------------------------------------|
//! | matrix registry           | `RwLock<HashMap>`           | `MatrixId` → [`MatrixEntry`]                 |
//! | [`MatrixEntry::tree`]     | one `RwLock` per matrix     | position arena, owner index, cycle log       |
//! | member directory          | `RwLock<HashMap>`           | sponsor linkage read by the allocator        |
//! | re-entry progress         | `Mutex<HashMap>`            | placements done per cycle record             |
//!
//! Lock order is always registry → tree → members. Nothing that holds the
//! member directory lock ever takes a tree lock.
//!
//! Poisoned locks are recovered rather than propagated: every mutation below
//! leaves the tree consistent before it can panic.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::config::MatrixConfig;
use crate::error::{EngineError, Result};
use crate::types::{
    CycleId, CycleRecord, EntryKind, MatrixId, Member, MemberId, Position, PositionId,
    PositionStatus, RunId,
};

/// Upper bound on sponsor-chain hops when looking for an active upline.
pub const MAX_UPLINE_HOPS: usize = 64;

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Matrix tree ──────────────────────────────────────────────────────

/// Arena of positions for one matrix plus its append-only cycle log.
#[derive(Debug)]
pub struct MatrixTree {
    config: Arc<MatrixConfig>,
    positions: Vec<Position>,
    by_owner: HashMap<MemberId, Vec<PositionId>>,
    cycles: Vec<CycleRecord>,
}

impl MatrixTree {
    pub fn new(config: Arc<MatrixConfig>) -> Self {
        Self {
            config,
            positions: Vec::new(),
            by_owner: HashMap::new(),
            cycles: Vec::new(),
        }
    }

    pub fn config(&self) -> &MatrixConfig {
        &self.config
    }

    pub(crate) fn shared_config(&self) -> Arc<MatrixConfig> {
        self.config.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    pub fn cycles(&self) -> &[CycleRecord] {
        &self.cycles
    }

    pub fn get(&self, id: PositionId) -> Option<&Position> {
        self.positions.get(id.index())
    }

    pub(crate) fn get_mut(&mut self, id: PositionId) -> Option<&mut Position> {
        self.positions.get_mut(id.index())
    }

    /// Like [`MatrixTree::get`], failing with `PositionNotFound`.
    pub fn position(&self, id: PositionId) -> Result<&Position> {
        self.get(id).ok_or(EngineError::PositionNotFound {
            matrix: self.config.id,
            position: id,
        })
    }

    pub(crate) fn position_mut(&mut self, id: PositionId) -> Result<&mut Position> {
        let matrix = self.config.id;
        self.get_mut(id)
            .ok_or(EngineError::PositionNotFound { matrix, position: id })
    }

    /// Every position `member` has ever been assigned, oldest first.
    pub fn positions_of(&self, member: MemberId) -> impl Iterator<Item = &Position> + '_ {
        self.by_owner
            .get(&member)
            .into_iter()
            .flatten()
            .filter_map(|id| self.get(*id))
            .filter(move |p| p.owner == Some(member))
    }

    /// The member's most recent live (`Pending` or `Filled`) position.
    pub fn latest_active(&self, member: MemberId) -> Option<PositionId> {
        self.positions_of(member)
            .filter(|p| p.status.is_active())
            .map(|p| p.id)
            .last()
    }

    /// Ancestors of `id` up to `max` levels above it, nearest first.
    pub fn ancestors(&self, id: PositionId, max: u32) -> Vec<(PositionId, u32)> {
        let mut out = Vec::new();
        let mut current = self.get(id).and_then(|p| p.parent);
        let mut distance = 1;
        while let Some(parent) = current {
            if distance > max {
                break;
            }
            out.push((parent, distance));
            current = self.get(parent).and_then(|p| p.parent);
            distance += 1;
        }
        out
    }

    /// Slots of window row `row` below `root`, left to right. Slots under a
    /// missing subtree are reported as `None`.
    pub fn row(&self, root: PositionId, row: u32) -> Vec<Option<PositionId>> {
        let width = self.config.width as usize;
        let mut frontier = vec![Some(root)];
        for _ in 0..row {
            let mut next = Vec::with_capacity(frontier.len() * width);
            for slot in &frontier {
                match slot.and_then(|id| self.get(id)) {
                    Some(p) => next.extend(p.children.iter().copied()),
                    None => next.extend(std::iter::repeat(None).take(width)),
                }
            }
            frontier = next;
        }
        frontier
    }

    /// Append a new position, linking it into `parent`'s slot if given.
    pub(crate) fn insert(
        &mut self,
        parent: Option<(PositionId, usize)>,
        owner: MemberId,
        sponsor: Option<MemberId>,
        entry: EntryKind,
        now: DateTime<Utc>,
    ) -> PositionId {
        let id = PositionId(self.positions.len() as u32);
        let level = parent
            .and_then(|(p, _)| self.get(p))
            .map(|p| p.level + 1)
            .unwrap_or(0);

        self.positions.push(Position {
            id,
            matrix_id: self.config.id,
            level,
            slot: parent.map(|(_, slot)| slot),
            parent: parent.map(|(p, _)| p),
            children: vec![None; self.config.width as usize],
            owner: Some(owner),
            sponsor,
            status: PositionStatus::Pending,
            entry,
            window_fill: vec![0; self.config.depth as usize],
            completed_rows: 0,
            fill_seq: 0,
            created_at: now,
            filled_at: None,
        });

        if let Some((parent, slot)) = parent {
            if let Some(p) = self.get_mut(parent) {
                p.children[slot] = Some(id);
            }
        }
        self.by_owner.entry(owner).or_default().push(id);
        id
    }

    /// Hand an `Empty` position to a new owner, keeping its subtree.
    pub(crate) fn reassign(
        &mut self,
        id: PositionId,
        owner: MemberId,
        sponsor: Option<MemberId>,
        entry: EntryKind,
    ) -> Result<()> {
        self.transition(id, PositionStatus::Pending)?;
        let position = self.position_mut(id)?;
        position.owner = Some(owner);
        position.sponsor = sponsor;
        position.entry = entry;
        position.filled_at = None;
        let owned = self.by_owner.entry(owner).or_default();
        if !owned.contains(&id) {
            owned.push(id);
        }
        Ok(())
    }

    /// Apply a lifecycle transition, rejecting anything the state machine forbids.
    pub(crate) fn transition(&mut self, id: PositionId, to: PositionStatus) -> Result<()> {
        let position = self.position_mut(id)?;
        if !position.status.can_transition_to(to) {
            return Err(EngineError::InvalidTransition {
                position: id,
                from: position.status,
                to,
            });
        }
        position.status = to;
        if to == PositionStatus::Empty {
            position.owner = None;
            position.sponsor = None;
            position.entry = EntryKind::Fresh;
        }
        Ok(())
    }

    pub(crate) fn push_cycle(&mut self, record: CycleRecord) {
        self.cycles.push(record);
    }
}

// ── Matrix entry ─────────────────────────────────────────────────────

/// A registered matrix: immutable config, enable flag and the locked tree.
#[derive(Debug)]
pub struct MatrixEntry {
    config: Arc<MatrixConfig>,
    enabled: AtomicBool,
    tree: RwLock<MatrixTree>,
}

impl MatrixEntry {
    fn new(config: MatrixConfig) -> Self {
        let config = Arc::new(config);
        Self {
            tree: RwLock::new(MatrixTree::new(config.clone())),
            config,
            enabled: AtomicBool::new(true),
        }
    }

    pub fn config(&self) -> &Arc<MatrixConfig> {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn read(&self) -> RwLockReadGuard<'_, MatrixTree> {
        read(&self.tree)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, MatrixTree> {
        write(&self.tree)
    }
}

// ── Store ────────────────────────────────────────────────────────────

/// Process-scoped handle to every matrix and the member directory.
#[derive(Debug, Default)]
pub struct MatrixStore {
    matrices: RwLock<HashMap<MatrixId, Arc<MatrixEntry>>>,
    members: RwLock<HashMap<MemberId, Member>>,
    next_cycle_id: AtomicU64,
    reentries: Mutex<HashMap<CycleId, u32>>,
    run: RunId,
}

impl MatrixStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose events are tagged with `run`. Callers that persist
    /// payouts across restarts allocate a fresh run per process.
    pub fn with_run(run: RunId) -> Self {
        Self {
            run,
            ..Self::default()
        }
    }

    pub fn run(&self) -> RunId {
        self.run
    }

    /// Validate and register a matrix configuration.
    pub fn create_matrix(&self, config: MatrixConfig) -> Result<Arc<MatrixConfig>> {
        config.validate()?;
        let mut matrices = write(&self.matrices);
        if matrices.contains_key(&config.id) {
            return Err(EngineError::MatrixExists(config.id));
        }
        let id = config.id;
        info!(
            "Matrix {id} created: {}x{} ({})",
            config.width, config.depth, config.name
        );
        let entry = Arc::new(MatrixEntry::new(config));
        let config = entry.config().clone();
        matrices.insert(id, entry);
        Ok(config)
    }

    pub fn matrix(&self, id: MatrixId) -> Result<Arc<MatrixEntry>> {
        read(&self.matrices)
            .get(&id)
            .cloned()
            .ok_or(EngineError::MatrixNotFound(id))
    }

    pub fn configs(&self) -> Vec<Arc<MatrixConfig>> {
        let mut configs: Vec<_> = read(&self.matrices)
            .values()
            .map(|e| e.config().clone())
            .collect();
        configs.sort_by_key(|c| c.id);
        configs
    }

    /// Stop accepting placements. Existing positions are untouched.
    pub fn disable_matrix(&self, id: MatrixId) -> Result<()> {
        self.matrix(id)?.enabled.store(false, Ordering::Release);
        info!("Matrix {id} disabled");
        Ok(())
    }

    pub fn register_member(&self, member: Member) -> Result<()> {
        let mut members = write(&self.members);
        if members.contains_key(&member.id) {
            return Err(EngineError::MemberExists(member.id));
        }
        debug!("Member {} registered (sponsor {:?})", member.id, member.sponsor);
        members.insert(member.id, member);
        Ok(())
    }

    pub fn member(&self, id: MemberId) -> Result<Member> {
        read(&self.members)
            .get(&id)
            .cloned()
            .ok_or(EngineError::MemberNotFound(id))
    }

    /// `start` followed by its sponsors, nearest first. Stops at
    /// [`MAX_UPLINE_HOPS`], an unknown member or a sponsor loop.
    pub fn upline(&self, start: MemberId) -> Vec<MemberId> {
        let members = read(&self.members);
        let mut seen = HashSet::new();
        let mut chain = Vec::new();
        let mut current = Some(start);
        while let Some(id) = current {
            if chain.len() >= MAX_UPLINE_HOPS || !seen.insert(id) {
                break;
            }
            chain.push(id);
            current = members.get(&id).and_then(|m| m.sponsor);
        }
        chain
    }

    pub(crate) fn next_cycle_id(&self) -> CycleId {
        CycleId(self.next_cycle_id.fetch_add(1, Ordering::AcqRel))
    }

    pub(crate) fn reentries(&self) -> MutexGuard<'_, HashMap<CycleId, u32>> {
        lock(&self.reentries)
    }
}
