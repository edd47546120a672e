use std::sync::Mutex;
use std::thread;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::invariants::{assert_all_tree_invariants, assert_unique_roots};
use crate::storage::MatrixTree;
use crate::test_placement::{engine_with, enter, matrix_config, M};
use crate::{CycleRecord, EngineError, MatrixEngine, MemberId, PositionId, PositionStatus};

const THREADS: usize = 4;

/// Run `job` for every id, spread over [`THREADS`] threads, collecting cycles.
fn run_concurrently<F>(ids: &[u64], job: F) -> Vec<CycleRecord>
where
    F: Fn(u64) -> Vec<CycleRecord> + Sync,
{
    let cycles = Mutex::new(Vec::new());
    let chunk = ids.len().div_ceil(THREADS).max(1);
    thread::scope(|s| {
        for part in ids.chunks(chunk) {
            let job = &job;
            let cycles = &cycles;
            s.spawn(move || {
                for id in part {
                    let found = job(*id);
                    cycles.lock().unwrap().extend(found);
                }
            });
        }
    });
    cycles.into_inner().unwrap()
}

fn check(engine: &MatrixEngine) {
    let matrix = engine.store().matrix(M).unwrap();
    assert_all_tree_invariants(&matrix.read());
}

/// Whether a new member could still be placed inside `anchor`'s window.
fn window_has_room(tree: &MatrixTree, anchor: PositionId) -> bool {
    let mut frontier = vec![anchor];
    for _row in 1..=tree.config().depth {
        let mut next = Vec::new();
        for id in frontier {
            let Some(parent) = tree.get(id) else { continue };
            let open = parent.status.accepts_descendants();
            for child in &parent.children {
                match child.and_then(|c| tree.get(c)) {
                    None if open => return true,
                    Some(c) if open && c.status == PositionStatus::Empty => return true,
                    Some(c) => next.push(c.id),
                    None => {}
                }
            }
        }
        frontier = next;
    }
    false
}

#[test]
fn test_concurrent_entries_into_empty_matrix() {
    for seed in 0..16 {
        let engine = engine_with(matrix_config(2, 2));
        engine.register_member(MemberId(1), None).unwrap();
        for m in 2..=7 {
            engine.register_member(MemberId(m), Some(MemberId(1))).unwrap();
        }
        let mut members: Vec<u64> = (1..=7).collect();
        members.shuffle(&mut StdRng::seed_from_u64(seed));

        // Whoever lands first opens the root; the rest race for it too.
        let cycles = run_concurrently(&members, |m| {
            let sponsor = (m != 1).then_some(MemberId(1));
            engine.place_member(sponsor, M, MemberId(m)).unwrap().cycles
        });

        let matrix = engine.store().matrix(M).unwrap();
        let tree = matrix.read();
        assert_eq!(tree.positions().len(), 7, "seed {seed}");
        let roots = tree.positions().iter().filter(|p| p.parent.is_none()).count();
        assert_eq!(roots, 1, "seed {seed}");
        for m in 1..=7 {
            assert_eq!(tree.positions_of(MemberId(m)).count(), 1, "seed {seed} member {m}");
        }
        let cycled = tree
            .positions()
            .iter()
            .filter(|p| p.status == PositionStatus::Cycled)
            .count();
        assert_eq!(cycled, cycles.len(), "seed {seed}");
        assert_unique_roots(&cycles);
        assert_all_tree_invariants(&tree);
    }
}

#[test]
fn test_concurrent_placements_cycle_root_once() {
    for seed in 0..16 {
        let engine = engine_with(matrix_config(3, 2));
        let root = enter(&engine, 1, None).position.id;
        let mut members: Vec<u64> = (2..=13).collect();
        for m in &members {
            engine.register_member(MemberId(*m), Some(MemberId(1))).unwrap();
        }
        members.shuffle(&mut StdRng::seed_from_u64(seed));

        let cycles = run_concurrently(&members, |m| {
            engine
                .place_member(Some(MemberId(1)), M, MemberId(m))
                .unwrap()
                .cycles
        });

        assert_eq!(cycles.len(), 1, "seed {seed}");
        assert_eq!(cycles[0].root, root);
        assert_eq!(cycles[0].participants.len(), 9);
        assert_eq!(engine.cycles(M).unwrap().len(), 1);
        check(&engine);
    }
}

#[test]
fn test_racing_confirms_emit_one_record() {
    for seed in 0..16 {
        let engine = engine_with(matrix_config(3, 2));
        enter(&engine, 1, None);

        let mut claimed = Vec::new();
        for m in 2..=13 {
            engine.register_member(MemberId(m), Some(MemberId(1))).unwrap();
            let p = engine.claim_position(Some(MemberId(1)), M, MemberId(m)).unwrap();
            claimed.push(p.id.0 as u64);
        }
        claimed.shuffle(&mut StdRng::seed_from_u64(seed));

        let cycles = run_concurrently(&claimed, |id| {
            engine
                .confirm_position(M, PositionId(id as u32))
                .unwrap()
                .cycles
        });

        assert_eq!(cycles.len(), 1, "seed {seed}");
        assert_unique_roots(&cycles);
        check(&engine);
    }
}

#[test]
fn test_random_sponsor_trees_keep_invariants() {
    for seed in 0..8 {
        let mut rng = StdRng::seed_from_u64(seed);
        let engine = engine_with(matrix_config(2, 2));
        enter(&engine, 1, None);

        let mut members = Vec::new();
        for m in 2..=60u64 {
            let sponsor = rng.gen_range(1..m);
            engine.register_member(MemberId(m), Some(MemberId(sponsor))).unwrap();
            members.push((m, sponsor));
        }
        members.shuffle(&mut rng);
        let ids: Vec<u64> = members.iter().map(|(m, _)| *m).collect();
        let sponsor_of = |m: u64| members.iter().find(|(id, _)| *id == m).map(|(_, s)| *s);

        let rejected = Mutex::new(Vec::new());
        let cycles = run_concurrently(&ids, |m| {
            match engine.place_member(sponsor_of(m).map(MemberId), M, MemberId(m)) {
                Ok(outcome) => outcome.cycles,
                Err(e) => {
                    rejected.lock().unwrap().push((m, e));
                    Vec::new()
                }
            }
        });

        assert_unique_roots(&cycles);
        let matrix = engine.store().matrix(M).unwrap();
        let tree = matrix.read();

        // A rejection is only allowed when the window it was aimed at has no
        // room left, and that window belongs to someone up the sponsor chain.
        for (m, err) in rejected.into_inner().unwrap() {
            assert_eq!(err, EngineError::MatrixFull(M), "seed {seed} member {m}");
            let mut chain = Vec::new();
            let mut next = sponsor_of(m);
            while let Some(s) = next {
                chain.push(s);
                next = sponsor_of(s);
            }
            let full = chain.iter().any(|s| {
                tree.positions_of(MemberId(*s))
                    .any(|p| !window_has_room(&tree, p.id))
            });
            assert!(full, "seed {seed}: member {m} rejected with room upline");
        }
        let cycled = tree
            .positions()
            .iter()
            .filter(|p| p.status == PositionStatus::Cycled)
            .count();
        assert_eq!(cycled, cycles.len(), "seed {seed}");
        assert_eq!(tree.cycles().len(), cycles.len());
        assert_all_tree_invariants(&tree);
    }
}
