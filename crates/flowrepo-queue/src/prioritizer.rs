//! Ordering policies for connection queues.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use flowrepo_core::{FlowFileRecord, PrioritizerKind, PRIORITY_ATTRIBUTE};

/// Orders two FlowFiles; `Less` means `a` is polled first.
pub trait FlowFilePrioritizer: Send + Sync + fmt::Debug {
    /// Compares two queued FlowFiles.
    fn compare(&self, a: &FlowFileRecord, b: &FlowFileRecord) -> Ordering;
}

/// Enqueue order.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstInFirstOutPrioritizer;

impl FlowFilePrioritizer for FirstInFirstOutPrioritizer {
    fn compare(&self, a: &FlowFileRecord, b: &FlowFileRecord) -> Ordering {
        a.queue_date_index.cmp(&b.queue_date_index)
    }
}

/// Oldest lineage first.
#[derive(Debug, Clone, Copy, Default)]
pub struct OldestFlowFileFirstPrioritizer;

impl FlowFilePrioritizer for OldestFlowFileFirstPrioritizer {
    fn compare(&self, a: &FlowFileRecord, b: &FlowFileRecord) -> Ordering {
        a.lineage_start_ms
            .cmp(&b.lineage_start_ms)
            .then(a.entry_date_ms.cmp(&b.entry_date_ms))
    }
}

/// Newest lineage first.
#[derive(Debug, Clone, Copy, Default)]
pub struct NewestFlowFileFirstPrioritizer;

impl FlowFilePrioritizer for NewestFlowFileFirstPrioritizer {
    fn compare(&self, a: &FlowFileRecord, b: &FlowFileRecord) -> Ordering {
        b.lineage_start_ms
            .cmp(&a.lineage_start_ms)
            .then(b.entry_date_ms.cmp(&a.entry_date_ms))
    }
}

/// Orders by the `priority` attribute, lowest first.
///
/// FlowFiles carrying the attribute come before those without it; numeric
/// values come before non-numeric ones and compare numerically.
#[derive(Debug, Clone, Copy, Default)]
pub struct PriorityAttributePrioritizer;

impl FlowFilePrioritizer for PriorityAttributePrioritizer {
    fn compare(&self, a: &FlowFileRecord, b: &FlowFileRecord) -> Ordering {
        match (a.attribute(PRIORITY_ATTRIBUTE), b.attribute(PRIORITY_ATTRIBUTE)) {
            (None, None) => Ordering::Equal,
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some(x), Some(y)) => match (x.trim().parse::<i64>(), y.trim().parse::<i64>()) {
                (Ok(x), Ok(y)) => x.cmp(&y),
                (Ok(_), Err(_)) => Ordering::Less,
                (Err(_), Ok(_)) => Ordering::Greater,
                (Err(_), Err(_)) => x.cmp(y),
            },
        }
    }
}

/// Builds the prioritizer for a configured kind.
pub fn prioritizer_for(kind: PrioritizerKind) -> Arc<dyn FlowFilePrioritizer> {
    match kind {
        PrioritizerKind::FirstInFirstOut => Arc::new(FirstInFirstOutPrioritizer),
        PrioritizerKind::OldestFlowFileFirst => Arc::new(OldestFlowFileFirstPrioritizer),
        PrioritizerKind::NewestFlowFileFirst => Arc::new(NewestFlowFileFirstPrioritizer),
        PrioritizerKind::PriorityAttribute => Arc::new(PriorityAttributePrioritizer),
    }
}

/// A chain of prioritizers with enqueue order as the final tie-breaker.
///
/// The tie-breaker makes the order total, so a record reinserted after a
/// rollback lands exactly where it was polled from.
#[derive(Debug, Clone, Default)]
pub struct QueueOrder {
    chain: Vec<Arc<dyn FlowFilePrioritizer>>,
}

impl QueueOrder {
    /// Plain first-in-first-out order.
    pub fn fifo() -> Self {
        Self::default()
    }

    /// Order built from configured kinds, applied in the given sequence.
    pub fn from_kinds(kinds: &[PrioritizerKind]) -> Self {
        Self {
            chain: kinds.iter().map(|k| prioritizer_for(*k)).collect(),
        }
    }

    /// Order built from arbitrary prioritizers.
    pub fn with_prioritizers(chain: Vec<Arc<dyn FlowFilePrioritizer>>) -> Self {
        Self { chain }
    }

    /// Compares two records under the full chain.
    pub fn compare(&self, a: &FlowFileRecord, b: &FlowFileRecord) -> Ordering {
        for prioritizer in &self.chain {
            let ord = prioritizer.compare(a, b);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        a.queue_date_index
            .cmp(&b.queue_date_index)
            .then(a.id.cmp(&b.id))
    }
}
