//! Property-based checks of the queue's structural invariants (I1-I4) and
//! round-trip/idempotence properties, exercised over randomized sequences
//! of `pwrite`/`pread`/`barrier` calls across multiple contexts.

use std::sync::Arc;

use bq::{Context, MemoryBackend, PendingKind, Queue};
use proptest::prelude::*;

const BACKEND_SIZE: usize = 4096;

#[derive(Debug, Clone)]
enum Op {
    Write { ctx: usize, offset: u64, len: u8 },
    Barrier { ctx: usize },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0usize..3, 0u64..(BACKEND_SIZE as u64 - 64), 1u8..32).prop_map(|(ctx, offset, len)| Op::Write {
            ctx,
            offset,
            len
        }),
        (0usize..3).prop_map(|ctx| Op::Barrier { ctx }),
    ]
}

/// I1: `sections` is always a subsequence of `pending` restricted to
/// Barriers. Checked indirectly through [`Queue::pending_snapshot`]: every
/// Barrier entry it reports must appear in non-decreasing section order,
/// and at most one Barrier per section may exist at any moment (I1/I4).
fn check_structural_invariants(q: &Queue) {
    let snap = q.pending_snapshot();
    let mut last_barrier_section: Option<u64> = None;
    let mut seen_barrier_sections = std::collections::HashSet::new();
    let mut last_section = 0u64;
    for entry in &snap {
        // I4: within `pending`, sections never decrease.
        assert!(entry.section >= last_section, "pending section order violated: {snap:?}");
        last_section = entry.section;
        if entry.kind == PendingKind::Barrier {
            if let Some(last) = last_barrier_section {
                assert!(entry.section >= last, "sections list out of order: {snap:?}");
            }
            // I1 (at most one Barrier per section) within `pending` at once.
            assert!(
                seen_barrier_sections.insert(entry.section),
                "more than one Barrier for section {} in pending: {snap:?}",
                entry.section
            );
            last_barrier_section = Some(entry.section);
        }
    }

    // I3 in spirit: a write never sits in `pending` at a section strictly
    // greater than a not-yet-passed Barrier that precedes it in insertion
    // order is already implied by I4's monotonic section scan above,
    // together with the fact insert_by_section never places a request past
    // a barrier whose section is below it.
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn structural_invariants_hold_after_every_operation(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let backend = Arc::new(MemoryBackend::new(BACKEND_SIZE, 0xA5));
        let queue = Queue::new(backend, Arc::new(|_ret| false));
        let mut contexts: Vec<Context> = (0..3).map(|_| Context::open(queue.clone())).collect();

        for op in ops {
            match op {
                Op::Write { ctx, offset, len } => {
                    let buf = vec![0x42; len as usize];
                    contexts[ctx].pwrite(offset, buf).unwrap();
                }
                Op::Barrier { ctx } => {
                    contexts[ctx].barrier().unwrap();
                }
            }
            check_structural_invariants(&queue);
        }
    }

    #[test]
    fn pwrite_then_pread_round_trips_for_any_offset(
        offset in 0u64..(BACKEND_SIZE as u64 - 64),
        len in 1u8..32,
        fill in any::<u8>(),
    ) {
        let backend = Arc::new(MemoryBackend::new(BACKEND_SIZE, 0xA5));
        let queue = Queue::new(backend, Arc::new(|_ret| false));
        let mut ctx = Context::open(queue);

        let buf = vec![fill; len as usize];
        ctx.pwrite(offset, buf.clone()).unwrap();
        let data = ctx.pread(offset, len as usize).unwrap();
        prop_assert_eq!(data, buf);
    }

    #[test]
    fn repeated_barrier_is_idempotent(n in 1usize..6) {
        let backend = Arc::new(MemoryBackend::new(BACKEND_SIZE, 0xA5));
        let queue = Queue::new(backend, Arc::new(|_ret| false));
        let mut ctx = Context::open(queue.clone());

        ctx.barrier().unwrap();
        let after_first = ctx.section();
        let snapshot_after_first = queue.queue_size();
        for _ in 0..n {
            ctx.barrier().unwrap();
        }
        prop_assert_eq!(ctx.section(), after_first);
        prop_assert_eq!(queue.queue_size(), snapshot_after_first);
    }
}
