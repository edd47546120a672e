//! Bonus computation.
//!
//! Turns fill events and cycle records into [`PayoutInstruction`]s. The
//! payout plan is matched exactly once per entry point; referral and matching
//! bonuses apply on top of any plan.
//!
//! Idempotency keys are derived only from the event, so recomputing the
//! payouts of an event after a partial failure yields the same keys and the
//! ledger can drop the duplicates. Every key starts with the engine run, so
//! positions and cycle ids handed out again by a later run never collide
//! with payouts already in the ledger.

use rust_decimal::Decimal;

use crate::config::{MatrixConfig, PayoutPlan};
use crate::types::{
    CycleRecord, EntryKind, FillEvent, MemberId, PayoutInstruction, PayoutReason,
};

pub struct BonusCalculator<'a> {
    config: &'a MatrixConfig,
}

impl<'a> BonusCalculator<'a> {
    pub fn new(config: &'a MatrixConfig) -> Self {
        Self { config }
    }

    /// Payouts owed for a single confirmed fill.
    pub fn for_fill(&self, fill: &FillEvent) -> Vec<PayoutInstruction> {
        let fill_key = format!(
            "{}:{}:{}#{}",
            fill.run, fill.matrix_id, fill.position, fill.fill_seq
        );
        let mut payouts = Vec::new();

        if let (EntryKind::Fresh, Some(sponsor)) = (fill.entry, fill.sponsor) {
            let amount = percent_of(self.config.fee, self.config.bonus.referral_percent);
            self.push(
                &mut payouts,
                sponsor,
                amount,
                PayoutReason::Referral,
                format!("{fill_key}:referral"),
            );
        }

        match &self.config.payout {
            PayoutPlan::Cycle { .. } => {}
            PayoutPlan::PerLevel { level_bonus } => {
                for ancestor in &fill.upline {
                    let Some(amount) = level_bonus.get(ancestor.distance as usize - 1) else {
                        continue;
                    };
                    self.push(
                        &mut payouts,
                        ancestor.owner,
                        *amount,
                        PayoutReason::LevelFill {
                            level: ancestor.distance,
                        },
                        format!("{fill_key}:level{}:{}", ancestor.distance, ancestor.position),
                    );
                }
            }
            PayoutPlan::PerCompletingLevel { level_bonus } => {
                for completion in &fill.completed_rows {
                    let Some(amount) = level_bonus.get(completion.row as usize - 1) else {
                        continue;
                    };
                    // Each row completes at most once per position, whoever fills it.
                    self.push(
                        &mut payouts,
                        completion.owner,
                        *amount,
                        PayoutReason::LevelCompletion {
                            level: completion.row,
                        },
                        format!(
                            "{}:{}:{}:row{}",
                            fill.run, fill.matrix_id, completion.position, completion.row
                        ),
                    );
                }
            }
        }
        payouts
    }

    /// Payouts owed for a completed cycle. `completer_sponsor` receives the
    /// matching bonus.
    pub fn for_cycle(
        &self,
        record: &CycleRecord,
        completer_sponsor: Option<MemberId>,
    ) -> Vec<PayoutInstruction> {
        let mut payouts = Vec::new();
        let PayoutPlan::Cycle { completion_bonus } = &self.config.payout else {
            return payouts;
        };

        self.push(
            &mut payouts,
            record.completer,
            *completion_bonus,
            PayoutReason::CycleCompletion,
            format!("{}:{}:completion", record.run, record.id),
        );
        if let Some(sponsor) = completer_sponsor {
            let amount = percent_of(*completion_bonus, self.config.bonus.matching_percent);
            self.push(
                &mut payouts,
                sponsor,
                amount,
                PayoutReason::Matching,
                format!("{}:{}:matching", record.run, record.id),
            );
        }
        payouts
    }

    fn push(
        &self,
        payouts: &mut Vec<PayoutInstruction>,
        member: MemberId,
        amount: Decimal,
        reason: PayoutReason,
        idempotency_key: String,
    ) {
        if amount <= Decimal::ZERO {
            return;
        }
        payouts.push(PayoutInstruction {
            member,
            amount,
            currency: self.config.currency.clone(),
            reason,
            idempotency_key,
        });
    }
}

fn percent_of(base: Decimal, percent: Decimal) -> Decimal {
    (base * percent / Decimal::ONE_HUNDRED).round_dp(2)
}
