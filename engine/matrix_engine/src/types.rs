//! # Types
//!
//! Shared data structures used across all modules of the matrix engine.
//!
//! ## Design decisions
//!
//! ### Arena-indexed positions
//!
//! Every matrix owns a flat arena of [`Position`]s. Parent and child links are
//! stored as [`PositionId`]s (arena indices) rather than references, so a tree
//! can be mutated under a single lock without any shared-ownership cycles.
//!
//! ### Status as a Finite-State Machine
//!
//! [`PositionStatus`] enforces the lifecycle below:
//!
//! ```text
//! Empty ──► Pending ──► Filled ──► Cycled
//!   ▲  ◄────────┘          │
//!   │                      ▼
//!   └─────────────────── Blocked ◄── Empty
//! ```
//!
//! `Cycled` is terminal. `Blocked` only leaves through an explicit admin reset
//! back to `Empty`.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident($inner:ty), $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub $inner);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

id_type!(
    /// Identifier of a matrix configuration.
    MatrixId(u64),
    "m"
);
id_type!(
    /// Index of a position inside its matrix arena.
    PositionId(u32),
    "p"
);
id_type!(
    /// Identifier of a member, owned by the registration service.
    MemberId(u64),
    "u"
);
id_type!(
    /// Store-wide sequence number of a completed cycle.
    CycleId(u64),
    "c"
);
id_type!(
    /// One lifetime of a [`MatrixStore`](crate::MatrixStore). Position and
    /// cycle ids restart with every run, so anything persisted next to them
    /// is scoped by the run.
    RunId(u64),
    "r"
);

impl PositionId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Lifecycle status of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    /// Slot exists but has no owner; placeable.
    Empty,
    /// Claimed by a member, awaiting confirmation.
    Pending,
    /// Owner confirmed; counts towards its ancestors' windows.
    Filled,
    /// Administratively disabled.
    Blocked,
    /// Window completed and paid out. Terminal.
    Cycled,
}

impl PositionStatus {
    /// Whether `self -> next` is an allowed lifecycle transition.
    pub fn can_transition_to(self, next: PositionStatus) -> bool {
        use PositionStatus::*;
        matches!(
            (self, next),
            (Empty, Pending)
                | (Pending, Filled)
                | (Pending, Empty)
                | (Filled, Cycled)
                | (Filled, Blocked)
                | (Empty, Blocked)
                | (Blocked, Empty)
        )
    }

    /// Occupied for the purpose of window completion.
    pub fn is_occupied(self) -> bool {
        matches!(self, PositionStatus::Filled | PositionStatus::Cycled)
    }

    /// New children may be linked directly beneath positions in this state.
    /// `Blocked` and `Cycled` positions keep their subtree but never grow it.
    pub(crate) fn accepts_descendants(self) -> bool {
        matches!(self, PositionStatus::Pending | PositionStatus::Filled)
    }

    /// Can anchor a placement window: the owner's entry is live.
    pub(crate) fn is_active(self) -> bool {
        matches!(self, PositionStatus::Pending | PositionStatus::Filled)
    }
}

/// How a member came to hold a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntryKind {
    /// A paid entry from registration.
    Fresh,
    /// Automatic re-entry after the given cycle.
    Reentry { cycle: CycleId },
}

/// A node of a matrix tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub id: PositionId,
    pub matrix_id: MatrixId,
    /// Absolute depth in the tree; roots are level 0.
    pub level: u32,
    /// Index of this position in its parent's child slots.
    pub slot: Option<usize>,
    pub parent: Option<PositionId>,
    /// Exactly `width` entries, `None` until a member lands there.
    pub children: Vec<Option<PositionId>>,
    pub owner: Option<MemberId>,
    pub sponsor: Option<MemberId>,
    pub status: PositionStatus,
    pub entry: EntryKind,
    /// Occupied positions per window row (index 0 is the direct row).
    pub window_fill: Vec<u64>,
    /// Bit `r - 1` is set once window row `r` has been complete.
    pub completed_rows: u16,
    /// Incremented on every confirmed fill of this slot.
    pub fill_seq: u32,
    pub created_at: DateTime<Utc>,
    pub filled_at: Option<DateTime<Utc>>,
}

impl Position {
    pub fn is_row_completed(&self, row: u32) -> bool {
        row >= 1 && self.completed_rows & (1 << (row - 1)) != 0
    }
}

/// Minimal member reference; only the sponsor linkage is read by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: MemberId,
    pub sponsor: Option<MemberId>,
    pub joined_at: DateTime<Utc>,
}

/// An owner above a freshly filled position, within the configured depth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowAncestor {
    pub position: PositionId,
    pub owner: MemberId,
    /// 1 for the parent, 2 for the grandparent, ...
    pub distance: u32,
}

/// A window row that became complete for the first time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowCompletion {
    pub position: PositionId,
    pub owner: MemberId,
    pub row: u32,
}

/// The committed fill of a position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillEvent {
    pub run: RunId,
    pub matrix_id: MatrixId,
    pub position: PositionId,
    pub fill_seq: u32,
    pub member: MemberId,
    pub sponsor: Option<MemberId>,
    pub level: u32,
    pub entry: EntryKind,
    /// Filled ancestors within the window, nearest first.
    pub upline: Vec<WindowAncestor>,
    pub completed_rows: Vec<RowCompletion>,
    pub filled_at: DateTime<Utc>,
}

/// Immutable record of a completed window. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleRecord {
    pub run: RunId,
    pub id: CycleId,
    pub matrix_id: MatrixId,
    pub root: PositionId,
    pub completer: MemberId,
    /// Owners of the root's bottom window row, in slot order.
    pub participants: Vec<MemberId>,
    pub completion_bonus: Decimal,
    pub completed_at: DateTime<Utc>,
}

/// Result of a confirmed placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementOutcome {
    pub position: Position,
    pub fill: FillEvent,
    pub cycles: Vec<CycleRecord>,
}

/// Why a payout is owed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PayoutReason {
    Referral,
    LevelFill { level: u32 },
    LevelCompletion { level: u32 },
    CycleCompletion,
    Matching,
}

impl PayoutReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Referral => "referral",
            Self::LevelFill { .. } => "level_fill",
            Self::LevelCompletion { .. } => "level_completion",
            Self::CycleCompletion => "cycle_completion",
            Self::Matching => "matching",
        }
    }
}

/// A payout for the external ledger. The engine never moves funds itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutInstruction {
    pub member: MemberId,
    pub amount: Decimal,
    pub currency: String,
    pub reason: PayoutReason,
    pub idempotency_key: String,
}
