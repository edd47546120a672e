//! Matrix configuration and its creation-time validation.
//!
//! A [`MatrixConfig`] is written once by an admin action and is read-only to
//! the engine afterwards. Invalid configurations are rejected by
//! [`MatrixConfig::validate`] before a matrix is ever created, so the
//! allocator never has to second-guess width, depth or payout shape.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::MatrixId;

pub const MAX_WIDTH: u32 = 16;
pub const MAX_DEPTH: u32 = 10;
/// Upper bound on the number of slots in one position's window.
pub const MAX_WINDOW_SLOTS: u64 = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("width must be between 1 and {MAX_WIDTH}, got {0}")]
    InvalidWidth(u32),

    #[error("depth must be between 1 and {MAX_DEPTH}, got {0}")]
    InvalidDepth(u32),

    #[error("window of {0} slots exceeds the limit of {MAX_WINDOW_SLOTS}")]
    WindowTooLarge(u64),

    #[error("{0} must not be negative")]
    NegativeAmount(&'static str),

    #[error("{0} must be between 0 and 100, got {1}")]
    PercentOutOfRange(&'static str, Decimal),

    #[error("expected {expected} level bonuses, got {got}")]
    LevelBonusCount { expected: u32, got: usize },

    #[error("invalid currency code: {0:?}")]
    InvalidCurrency(String),

    #[error("matrix name must not be empty")]
    EmptyName,
}

/// How a matrix pays out. Dispatched once by the bonus calculator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PayoutPlan {
    /// One completion bonus per cycle.
    Cycle { completion_bonus: Decimal },
    /// `level_bonus[l - 1]` for every fill at distance `l` below an owner.
    PerLevel { level_bonus: Vec<Decimal> },
    /// `level_bonus[l - 1]` once, when row `l` of an owner's window fills up.
    PerCompletingLevel { level_bonus: Vec<Decimal> },
}

/// Percentage bonuses paid on top of the payout plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BonusRates {
    /// Share of the entry fee paid to the direct sponsor of a fresh entry.
    #[serde(default)]
    pub referral_percent: Decimal,
    /// Share of a completion bonus paid to the completer's sponsor.
    #[serde(default)]
    pub matching_percent: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReentryPolicy {
    pub enabled: bool,
    /// Placements granted per completed cycle.
    #[serde(default = "default_reentry_count")]
    pub count: u32,
}

fn default_reentry_count() -> u32 {
    1
}

/// Order in which deeper rows are searched once the sponsor's row is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpilloverOrder {
    /// Breadth-first, leftmost free slot first.
    #[default]
    LeftToRight,
    /// Within a row, prefer the branch with the fewest occupied positions.
    Balanced,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixConfig {
    pub id: MatrixId,
    pub name: String,
    /// Children per position.
    pub width: u32,
    /// Rows below a position that make up its window.
    pub depth: u32,
    pub fee: Decimal,
    pub currency: String,
    pub payout: PayoutPlan,
    #[serde(default)]
    pub bonus: BonusRates,
    #[serde(default)]
    pub reentry: ReentryPolicy,
    #[serde(default)]
    pub spillover: SpilloverOrder,
}

impl MatrixConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::EmptyName);
        }
        if !(1..=MAX_WIDTH).contains(&self.width) {
            return Err(ConfigError::InvalidWidth(self.width));
        }
        if !(1..=MAX_DEPTH).contains(&self.depth) {
            return Err(ConfigError::InvalidDepth(self.depth));
        }
        let slots = self.window_slots();
        if slots > MAX_WINDOW_SLOTS {
            return Err(ConfigError::WindowTooLarge(slots));
        }
        if self.fee.is_sign_negative() {
            return Err(ConfigError::NegativeAmount("fee"));
        }
        if self.currency.len() != 3 || !self.currency.chars().all(|c| c.is_ascii_uppercase()) {
            return Err(ConfigError::InvalidCurrency(self.currency.clone()));
        }

        check_percent("referral_percent", self.bonus.referral_percent)?;
        check_percent("matching_percent", self.bonus.matching_percent)?;

        match &self.payout {
            PayoutPlan::Cycle { completion_bonus } => {
                if completion_bonus.is_sign_negative() {
                    return Err(ConfigError::NegativeAmount("completion_bonus"));
                }
            }
            PayoutPlan::PerLevel { level_bonus } | PayoutPlan::PerCompletingLevel { level_bonus } => {
                if level_bonus.len() != self.depth as usize {
                    return Err(ConfigError::LevelBonusCount {
                        expected: self.depth,
                        got: level_bonus.len(),
                    });
                }
                if level_bonus.iter().any(|b| b.is_sign_negative()) {
                    return Err(ConfigError::NegativeAmount("level_bonus"));
                }
            }
        }
        Ok(())
    }

    /// Number of slots in row `row` (1-based) of a position's window.
    pub fn row_capacity(&self, row: u32) -> u64 {
        (self.width as u64).saturating_pow(row)
    }

    /// Total slots across rows `1..=depth`.
    pub fn window_slots(&self) -> u64 {
        (1..=self.depth).fold(0u64, |acc, row| acc.saturating_add(self.row_capacity(row)))
    }
}

fn check_percent(field: &'static str, value: Decimal) -> Result<(), ConfigError> {
    if value.is_sign_negative() || value > Decimal::ONE_HUNDRED {
        return Err(ConfigError::PercentOutOfRange(field, value));
    }
    Ok(())
}
