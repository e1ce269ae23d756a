//! Property tests for connection queues: swapping never changes what is
//! polled, and rollback puts records back exactly where they were.

use std::sync::Arc;

use flowrepo_core::{ConnectionId, FlowFileId, FlowFileRecord, QueueSettings};
use flowrepo_queue::{ConnectionQueue, FlowFileQueue, NoopSwapRecorder, QueueOrder, SwapManager};
use proptest::prelude::*;
use tempfile::TempDir;

#[derive(Debug, Clone)]
enum Op {
    Enqueue(u8),
    Poll(u8),
    RollbackLast,
    CommitLast,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        5 => (1u8..6).prop_map(Op::Enqueue),
        3 => (1u8..8).prop_map(Op::Poll),
        1 => Just(Op::RollbackLast),
        1 => Just(Op::CommitLast),
    ]
}

fn queue(dir: &TempDir, swap_threshold: usize, swap_batch_size: usize) -> ConnectionQueue {
    let settings = QueueSettings {
        swap_threshold,
        swap_batch_size,
        ..QueueSettings::default()
    };
    ConnectionQueue::new(
        ConnectionId::new("prop"),
        settings,
        QueueOrder::fifo(),
        Arc::new(SwapManager::open(dir.path()).unwrap()),
        Arc::new(NoopSwapRecorder),
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_swapping_is_invisible(ops in prop::collection::vec(op_strategy(), 1..60)) {
        let swapped_dir = TempDir::new().unwrap();
        let memory_dir = TempDir::new().unwrap();
        let swapping = queue(&swapped_dir, 3, 2);
        let in_memory = queue(&memory_dir, 1_000_000, 1);

        let mut next_id = 1u64;
        let mut last: Option<(Vec<FlowFileRecord>, Vec<FlowFileRecord>)> = None;

        for op in ops {
            match op {
                Op::Enqueue(n) => {
                    for _ in 0..n {
                        let mut record = FlowFileRecord::new(FlowFileId::new(next_id)).with_queue_entry(0, next_id);
                        record.size = next_id % 7;
                        next_id += 1;
                        swapping.enqueue(record.clone()).unwrap();
                        in_memory.enqueue(record).unwrap();
                    }
                }
                Op::Poll(n) => {
                    if let Some((a, b)) = last.take() {
                        swapping.acknowledge(&a);
                        in_memory.acknowledge(&b);
                    }
                    let a = swapping.poll(n as usize).unwrap();
                    let b = in_memory.poll(n as usize).unwrap();
                    prop_assert_eq!(&a, &b);
                    last = Some((a, b));
                }
                Op::RollbackLast => {
                    if let Some((a, b)) = last.take() {
                        swapping.reinsert(a);
                        in_memory.reinsert(b);
                    }
                }
                Op::CommitLast => {
                    if let Some((a, b)) = last.take() {
                        swapping.acknowledge(&a);
                        in_memory.acknowledge(&b);
                    }
                }
            }
            let (sa, sb) = (swapping.size(), in_memory.size());
            prop_assert_eq!(sa.object_count(), sb.object_count());
            prop_assert_eq!(sa.byte_count(), sb.byte_count());
            prop_assert_eq!(sa.in_flight_count, sb.in_flight_count);
        }

        if let Some((a, b)) = last.take() {
            swapping.acknowledge(&a);
            in_memory.acknowledge(&b);
        }
        let rest_a = swapping.poll(usize::MAX).unwrap();
        let rest_b = in_memory.poll(usize::MAX).unwrap();
        prop_assert_eq!(&rest_a, &rest_b);
        prop_assert!(rest_a.windows(2).all(|w| w[0].queue_date_index < w[1].queue_date_index));
    }
}
