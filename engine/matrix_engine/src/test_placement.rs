use std::sync::Arc;

use rust_decimal_macros::dec;

use crate::invariants::assert_all_tree_invariants;
use crate::{
    BonusRates, EngineError, MatrixConfig, MatrixEngine, MatrixId, MatrixStore, MemberId,
    PayoutPlan, PayoutReason, PlacementOutcome, PositionId, PositionStatus, ReentryPolicy,
    RowCompletion, SpilloverOrder, WindowAncestor,
};

pub(crate) const M: MatrixId = MatrixId(1);

pub(crate) fn matrix_config(width: u32, depth: u32) -> MatrixConfig {
    MatrixConfig {
        id: M,
        name: format!("{width}x{depth}"),
        width,
        depth,
        fee: dec!(50),
        currency: "USD".to_string(),
        payout: PayoutPlan::Cycle {
            completion_bonus: dec!(200),
        },
        bonus: BonusRates {
            referral_percent: dec!(10),
            matching_percent: dec!(10),
        },
        reentry: ReentryPolicy::default(),
        spillover: SpilloverOrder::LeftToRight,
    }
}

pub(crate) fn engine_with(config: MatrixConfig) -> MatrixEngine {
    let engine = MatrixEngine::new(Arc::new(MatrixStore::new()));
    engine.create_matrix(config).unwrap();
    engine
}

/// Register `member` under `sponsor` and place it.
pub(crate) fn enter(engine: &MatrixEngine, member: u64, sponsor: Option<u64>) -> PlacementOutcome {
    let sponsor = sponsor.map(MemberId);
    engine.register_member(MemberId(member), sponsor).unwrap();
    engine.place_member(sponsor, M, MemberId(member)).unwrap()
}

pub(crate) fn check_tree(engine: &MatrixEngine) {
    let matrix = engine.store().matrix(M).unwrap();
    assert_all_tree_invariants(&matrix.read());
}

#[test]
fn test_first_member_opens_root() {
    let engine = engine_with(matrix_config(3, 2));
    let outcome = enter(&engine, 1, None);

    assert_eq!(outcome.position.id, PositionId(0));
    assert_eq!(outcome.position.level, 0);
    assert_eq!(outcome.position.parent, None);
    assert_eq!(outcome.position.status, PositionStatus::Filled);
    assert_eq!(outcome.position.children, vec![None, None, None]);
    assert!(outcome.cycles.is_empty());
    check_tree(&engine);
}

#[test]
fn test_direct_row_fills_left_to_right() {
    let engine = engine_with(matrix_config(3, 2));
    let root = enter(&engine, 1, None).position.id;

    for (slot, member) in (2..=4).enumerate() {
        let p = enter(&engine, member, Some(1)).position;
        assert_eq!(p.parent, Some(root));
        assert_eq!(p.slot, Some(slot));
        assert_eq!(p.level, 1);
    }
    check_tree(&engine);
}

#[test]
fn test_fourth_member_spills_to_leftmost_child() {
    let run = || {
        let engine = engine_with(matrix_config(3, 2));
        enter(&engine, 1, None);
        let first_child = enter(&engine, 2, Some(1)).position;
        enter(&engine, 3, Some(1));
        let direct = enter(&engine, 4, Some(1)).position;
        let spilled = enter(&engine, 5, Some(1)).position;

        assert_eq!(spilled.level, direct.level + 1);
        assert_eq!(spilled.parent, Some(first_child.id));
        assert_eq!(spilled.slot, Some(0));
        check_tree(&engine);
        (spilled.id, spilled.parent)
    };
    assert_eq!(run(), run());
}

#[test]
fn test_balanced_spillover_prefers_lighter_branch() {
    let placement = |order: SpilloverOrder| {
        let mut config = matrix_config(2, 3);
        config.spillover = order;
        let engine = engine_with(config);
        enter(&engine, 1, None);
        let left = enter(&engine, 2, Some(1)).position;
        let right = enter(&engine, 3, Some(1)).position;
        // Member 2 recruits on its own, loading the left branch.
        enter(&engine, 4, Some(2));
        let p = enter(&engine, 5, Some(1)).position;
        check_tree(&engine);
        (p.parent, left.id, right.id)
    };

    let (parent, left, _) = placement(SpilloverOrder::LeftToRight);
    assert_eq!(parent, Some(left));

    let (parent, _, right) = placement(SpilloverOrder::Balanced);
    assert_eq!(parent, Some(right));
}

#[test]
fn test_three_by_two_cycles_on_ninth_bottom_fill() {
    let engine = engine_with(matrix_config(3, 2));
    let root = enter(&engine, 1, None).position.id;

    // Three in the direct row, then nine in the bottom row.
    for member in 2..=12 {
        let outcome = enter(&engine, member, Some(1));
        assert!(outcome.cycles.is_empty(), "early cycle at member {member}");
    }
    let last = enter(&engine, 13, Some(1));

    assert_eq!(last.cycles.len(), 1);
    let record = &last.cycles[0];
    assert_eq!(record.root, root);
    assert_eq!(record.completer, MemberId(1));
    assert_eq!(record.participants.len(), 9);
    assert_eq!(
        record.participants,
        (5..=13).map(MemberId).collect::<Vec<_>>()
    );
    assert_eq!(record.completion_bonus, dec!(200));

    assert_eq!(engine.position(M, root).unwrap().status, PositionStatus::Cycled);
    assert_eq!(engine.cycles(M).unwrap(), last.cycles);
    check_tree(&engine);
}

#[test]
fn test_fill_event_reports_upline_and_completed_rows() {
    let engine = engine_with(matrix_config(3, 2));
    let root = enter(&engine, 1, None).position.id;
    let a = enter(&engine, 2, Some(1)).position.id;
    enter(&engine, 3, Some(1));
    let third = enter(&engine, 4, Some(1));

    assert_eq!(
        third.fill.completed_rows,
        vec![RowCompletion {
            position: root,
            owner: MemberId(1),
            row: 1
        }]
    );

    let spilled = enter(&engine, 5, Some(1));
    assert_eq!(
        spilled.fill.upline,
        vec![
            WindowAncestor {
                position: a,
                owner: MemberId(2),
                distance: 1
            },
            WindowAncestor {
                position: root,
                owner: MemberId(1),
                distance: 2
            },
        ]
    );
    assert_eq!(spilled.fill.sponsor, Some(MemberId(1)));
    assert_eq!(spilled.fill.fill_seq, 1);
}

#[test]
fn test_sponsor_without_position_uses_upline() {
    let engine = engine_with(matrix_config(2, 2));
    let root = enter(&engine, 1, None).position.id;
    // Member 2 joins the platform but never enters this matrix.
    engine.register_member(MemberId(2), Some(MemberId(1))).unwrap();

    let p = enter(&engine, 3, Some(2)).position;
    assert_eq!(p.parent, Some(root));
    assert_eq!(p.sponsor, Some(MemberId(2)));
}

#[test]
fn test_member_without_upline_gets_house_placement() {
    let engine = engine_with(matrix_config(2, 2));
    let root = enter(&engine, 1, None).position.id;
    enter(&engine, 2, Some(1));

    let p = enter(&engine, 3, None).position;
    assert_eq!(p.parent, Some(root));
    assert_eq!(p.slot, Some(1));
    check_tree(&engine);
}

#[test]
fn test_pending_root_anchors_its_sponsor_window() {
    let engine = engine_with(matrix_config(2, 1));
    engine.register_member(MemberId(1), None).unwrap();
    let root = engine.claim_position(None, M, MemberId(1)).unwrap();
    assert_eq!(root.status, PositionStatus::Pending);

    for (slot, member) in [(0, 2), (1, 3)] {
        let p = enter(&engine, member, Some(1)).position;
        assert_eq!(p.parent, Some(root.id));
        assert_eq!(p.slot, Some(slot));
    }
    assert_eq!(engine.position(M, root.id).unwrap().status, PositionStatus::Pending);

    let outcome = engine.confirm_position(M, root.id).unwrap();
    assert_eq!(outcome.cycles.len(), 1);
    assert_eq!(outcome.cycles[0].participants, vec![MemberId(2), MemberId(3)]);
    check_tree(&engine);
}

#[test]
fn test_house_placement_falls_back_to_pending_position() {
    let engine = engine_with(matrix_config(1, 1));
    engine.register_member(MemberId(1), None).unwrap();
    let root = engine.claim_position(None, M, MemberId(1)).unwrap();

    let housed = enter(&engine, 2, None).position;
    assert_eq!(housed.parent, Some(root.id));

    let outcome = engine.confirm_position(M, root.id).unwrap();
    assert_eq!(outcome.cycles.len(), 1);
    check_tree(&engine);
}

#[test]
fn test_cycled_position_never_gets_new_children() {
    let engine = engine_with(matrix_config(2, 2));
    enter(&engine, 1, None);
    let left = enter(&engine, 2, Some(1)).position.id;
    let right = enter(&engine, 3, Some(1)).position.id;
    // Members 4..=9 complete member 2's window below the root.
    let first = enter(&engine, 4, Some(2)).position.id;
    for m in 5..=9 {
        enter(&engine, m, Some(2));
    }
    assert_eq!(engine.position(M, left).unwrap().status, PositionStatus::Cycled);

    engine.block_position(M, first).unwrap();
    engine.reset_position(M, first).unwrap();
    assert_eq!(engine.position(M, first).unwrap().parent, Some(left));

    // The free position under the cycled branch is skipped.
    let p = enter(&engine, 10, Some(1)).position;
    assert_eq!(p.parent, Some(right));
    assert_eq!(engine.position(M, first).unwrap().status, PositionStatus::Empty);
    check_tree(&engine);
}

#[test]
fn test_blocked_parent_never_gets_new_children() {
    let engine = engine_with(matrix_config(2, 2));
    enter(&engine, 1, None);
    let left = enter(&engine, 2, Some(1)).position.id;
    let right = enter(&engine, 3, Some(1)).position.id;
    engine.block_position(M, left).unwrap();

    let p = enter(&engine, 4, Some(1)).position;
    assert_eq!(p.parent, Some(right));
    assert!(engine
        .position(M, left)
        .unwrap()
        .children
        .iter()
        .all(Option::is_none));
    check_tree(&engine);
}

#[test]
fn test_blocked_slot_makes_window_full_until_reset() {
    let engine = engine_with(matrix_config(2, 1));
    let root = enter(&engine, 1, None).position.id;
    let a = enter(&engine, 2, Some(1)).position.id;
    engine.block_position(M, a).unwrap();
    enter(&engine, 3, Some(1));

    engine.register_member(MemberId(4), Some(MemberId(1))).unwrap();
    assert_eq!(
        engine.place_member(Some(MemberId(1)), M, MemberId(4)),
        Err(EngineError::MatrixFull(M))
    );
    assert_eq!(engine.position(M, root).unwrap().status, PositionStatus::Filled);

    let reset = engine.reset_position(M, a).unwrap();
    assert_eq!(reset.status, PositionStatus::Empty);
    assert_eq!(reset.owner, None);

    let outcome = engine.place_member(Some(MemberId(1)), M, MemberId(4)).unwrap();
    assert_eq!(outcome.position.id, a);
    assert_eq!(outcome.position.owner, Some(MemberId(4)));
    assert_eq!(outcome.cycles.len(), 1);
    assert_eq!(outcome.cycles[0].root, root);
    assert_eq!(
        outcome.cycles[0].participants,
        vec![MemberId(4), MemberId(3)]
    );
    check_tree(&engine);
}

#[test]
fn test_two_phase_claim_and_cancel() {
    let engine = engine_with(matrix_config(2, 1));
    enter(&engine, 1, None);
    engine.register_member(MemberId(2), Some(MemberId(1))).unwrap();
    engine.register_member(MemberId(3), Some(MemberId(1))).unwrap();
    engine.register_member(MemberId(4), Some(MemberId(1))).unwrap();

    let claimed = engine.claim_position(Some(MemberId(1)), M, MemberId(2)).unwrap();
    assert_eq!(claimed.status, PositionStatus::Pending);

    let other = engine.claim_position(Some(MemberId(1)), M, MemberId(3)).unwrap();
    assert_ne!(other.id, claimed.id);
    assert_eq!(
        engine.claim_position(Some(MemberId(1)), M, MemberId(4)),
        Err(EngineError::MatrixFull(M))
    );

    let cancelled = engine.cancel_position(M, claimed.id).unwrap();
    assert_eq!(cancelled.status, PositionStatus::Empty);
    assert!(matches!(
        engine.confirm_position(M, claimed.id),
        Err(EngineError::InvalidTransition { .. })
    ));

    let reused = engine.claim_position(Some(MemberId(1)), M, MemberId(4)).unwrap();
    assert_eq!(reused.id, claimed.id);
    engine.confirm_position(M, reused.id).unwrap();
    let outcome = engine.confirm_position(M, other.id).unwrap();
    assert_eq!(outcome.cycles.len(), 1);
    check_tree(&engine);
}

/// `(member, amount, reason, key)` of every payout owed for `outcome`'s fill.
fn fill_payouts(
    engine: &MatrixEngine,
    outcome: &PlacementOutcome,
) -> Vec<(MemberId, rust_decimal::Decimal, PayoutReason, String)> {
    engine
        .payouts_for_fill(&outcome.fill)
        .unwrap()
        .into_iter()
        .map(|p| (p.member, p.amount, p.reason, p.idempotency_key))
        .collect()
}

#[test]
fn test_per_level_plan_pays_filled_ancestors() {
    let mut config = matrix_config(2, 2);
    config.payout = PayoutPlan::PerLevel {
        level_bonus: vec![dec!(3), dec!(1)],
    };
    config.bonus = BonusRates::default();
    let engine = engine_with(config);

    let root = enter(&engine, 1, None);
    assert!(fill_payouts(&engine, &root).is_empty());

    let mut paid = Vec::new();
    for m in 2..=4 {
        let outcome = enter(&engine, m, Some(1));
        paid.extend(
            fill_payouts(&engine, &outcome)
                .into_iter()
                .map(|(member, amount, reason, _)| (member, amount, reason)),
        );
    }
    assert_eq!(
        paid,
        vec![
            (MemberId(1), dec!(3), PayoutReason::LevelFill { level: 1 }),
            (MemberId(1), dec!(3), PayoutReason::LevelFill { level: 1 }),
            (MemberId(2), dec!(3), PayoutReason::LevelFill { level: 1 }),
            (MemberId(1), dec!(1), PayoutReason::LevelFill { level: 2 }),
        ]
    );
}

#[test]
fn test_per_completing_level_plan_pays_each_row_once() {
    let mut config = matrix_config(2, 2);
    config.payout = PayoutPlan::PerCompletingLevel {
        level_bonus: vec![dec!(10), dec!(5)],
    };
    config.bonus = BonusRates::default();
    let engine = engine_with(config);
    enter(&engine, 1, None);

    let per_member: Vec<_> = (2..=7)
        .map(|m| fill_payouts(&engine, &enter(&engine, m, Some(1))))
        .collect();

    let row = |member, amount, level, key: &str| {
        (
            MemberId(member),
            amount,
            PayoutReason::LevelCompletion { level },
            key.to_string(),
        )
    };
    assert_eq!(
        per_member,
        vec![
            vec![],
            vec![row(1, dec!(10), 1, "r0:m1:p0:row1")],
            vec![],
            vec![row(2, dec!(10), 1, "r0:m1:p1:row1")],
            vec![],
            vec![
                row(3, dec!(10), 1, "r0:m1:p2:row1"),
                row(1, dec!(5), 2, "r0:m1:p0:row2"),
            ],
        ]
    );
}

#[test]
fn test_cycled_position_is_terminal() {
    let engine = engine_with(matrix_config(1, 1));
    let root = enter(&engine, 1, None).position.id;
    enter(&engine, 2, Some(1));

    assert_eq!(engine.position(M, root).unwrap().status, PositionStatus::Cycled);
    assert_eq!(
        engine.block_position(M, root),
        Err(EngineError::InvalidTransition {
            position: root,
            from: PositionStatus::Cycled,
            to: PositionStatus::Blocked,
        })
    );
}

#[test]
fn test_rejected_placements() {
    let engine = engine_with(matrix_config(2, 2));
    enter(&engine, 1, None);

    assert_eq!(
        engine.place_member(Some(MemberId(1)), M, MemberId(77)),
        Err(EngineError::MemberNotFound(MemberId(77)))
    );
    engine.register_member(MemberId(2), Some(MemberId(1))).unwrap();
    assert_eq!(
        engine.place_member(Some(MemberId(1)), MatrixId(9), MemberId(2)),
        Err(EngineError::MatrixNotFound(MatrixId(9)))
    );

    engine.disable_matrix(M).unwrap();
    assert_eq!(
        engine.place_member(Some(MemberId(1)), M, MemberId(2)),
        Err(EngineError::MatrixDisabled(M))
    );
}

#[test]
fn test_invalid_config_is_rejected_at_creation() {
    let engine = MatrixEngine::default();
    let mut config = matrix_config(0, 2);
    assert!(matches!(
        engine.create_matrix(config.clone()),
        Err(EngineError::InvalidConfig(_))
    ));
    config.width = 2;
    engine.create_matrix(config.clone()).unwrap();
    assert_eq!(engine.create_matrix(config), Err(EngineError::MatrixExists(M)));
}

#[test]
fn test_status_transitions() {
    use PositionStatus::*;
    assert!(Empty.can_transition_to(Pending));
    assert!(Pending.can_transition_to(Filled));
    assert!(Pending.can_transition_to(Empty));
    assert!(Filled.can_transition_to(Cycled));
    assert!(Filled.can_transition_to(Blocked));
    assert!(Blocked.can_transition_to(Empty));

    assert!(!Cycled.can_transition_to(Filled));
    assert!(!Cycled.can_transition_to(Empty));
    assert!(!Blocked.can_transition_to(Filled));
    assert!(!Empty.can_transition_to(Filled));
    assert!(!Filled.can_transition_to(Empty));
}
