//! Property tests pitting the ring against a queue model.
//!
//! Coverage:
//! - bounded count: `0 <= count <= capacity`, `count + free == capacity`
//! - FIFO: the dequeued sequence is a prefix-respecting replay of the
//!   enqueued sequence for a single producer/consumer pair

use proptest::prelude::*;
use shmem_ring::{Ring, RingFlags};
use shmem_rt::InternalConfig;
use std::collections::VecDeque;
use std::sync::{Once, OnceLock};

fn setup() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        static DIR: OnceLock<std::path::PathBuf> = OnceLock::new();
        let dir = DIR
            .get_or_init(|| tempfile::tempdir().unwrap().into_path())
            .clone();
        let mut cfg = InternalConfig::default();
        cfg.no_hugetlbfs = true;
        cfg.memory = 64 * 1024 * 1024;
        cfg.file_prefix = format!("ringprop_{}", std::process::id());
        cfg.runtime_dir = Some(dir);
        shmem_rt::init_with(cfg).unwrap();
    });
}

fn model_ring() -> &'static Ring {
    static RING: OnceLock<&'static Ring> = OnceLock::new();
    RING.get_or_init(|| {
        setup();
        Ring::create(
            "model",
            64,
            shmem_rt::SOCKET_ID_ANY,
            RingFlags::SP_ENQ | RingFlags::SC_DEQ,
        )
        .unwrap()
    })
}

#[derive(Debug, Clone)]
enum Op {
    EnqueueBurst(u8),
    DequeueBurst(u8),
    EnqueueBulk(u8),
    DequeueBulk(u8),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1u8..48).prop_map(Op::EnqueueBurst),
        (1u8..48).prop_map(Op::DequeueBurst),
        (1u8..48).prop_map(Op::EnqueueBulk),
        (1u8..48).prop_map(Op::DequeueBulk),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn ring_matches_queue_model(ops in prop::collection::vec(op_strategy(), 1..80)) {
        let ring = model_ring();
        let capacity = ring.capacity() as usize;
        let mut model: VecDeque<usize> = VecDeque::new();
        let mut next_value = 1usize;

        // Start from a drained ring (cases share one ring; the runner is
        // single-threaded per property).
        let mut sink = vec![std::ptr::null_mut(); capacity];
        ring.dequeue_burst(&mut sink);

        for op in ops {
            match op {
                Op::EnqueueBurst(n) => {
                    let vals: Vec<*mut u8> =
                        (0..n as usize).map(|i| (next_value + i) as *mut u8).collect();
                    let pushed = ring.enqueue_burst(&vals);
                    prop_assert_eq!(pushed, (n as usize).min(capacity - model.len()));
                    for v in &vals[..pushed] {
                        model.push_back(*v as usize);
                    }
                    next_value += pushed;
                }
                Op::EnqueueBulk(n) => {
                    let vals: Vec<*mut u8> =
                        (0..n as usize).map(|i| (next_value + i) as *mut u8).collect();
                    let pushed = ring.enqueue_bulk(&vals);
                    let expect = if capacity - model.len() >= n as usize { n as usize } else { 0 };
                    prop_assert_eq!(pushed, expect);
                    for v in &vals[..pushed] {
                        model.push_back(*v as usize);
                    }
                    next_value += pushed;
                }
                Op::DequeueBurst(n) => {
                    let mut out = vec![std::ptr::null_mut(); n as usize];
                    let popped = ring.dequeue_burst(&mut out);
                    prop_assert_eq!(popped, (n as usize).min(model.len()));
                    for v in &out[..popped] {
                        prop_assert_eq!(model.pop_front(), Some(*v as usize));
                    }
                }
                Op::DequeueBulk(n) => {
                    let mut out = vec![std::ptr::null_mut(); n as usize];
                    let popped = ring.dequeue_bulk(&mut out);
                    let expect = if model.len() >= n as usize { n as usize } else { 0 };
                    prop_assert_eq!(popped, expect);
                    for v in &out[..popped] {
                        prop_assert_eq!(model.pop_front(), Some(*v as usize));
                    }
                }
            }

            // Bounded count, in every intermediate state.
            let count = ring.count() as usize;
            prop_assert_eq!(count, model.len());
            prop_assert!(count <= capacity);
            prop_assert_eq!(count + ring.free_count() as usize, capacity);
            prop_assert_eq!(ring.is_empty(), model.is_empty());
            prop_assert_eq!(ring.is_full(), model.len() == capacity);
        }

        // Leave the ring clean for the next case.
        let mut sink = vec![std::ptr::null_mut(); capacity];
        ring.dequeue_burst(&mut sink);
    }
}
