#![warn(missing_docs)]

//! flowrepo subsystem: prioritized connection queues with back-pressure,
//! reservations and swapping to disk.

pub mod error;
pub mod prioritizer;
pub mod queue;
pub mod size;
pub mod swap;

pub use error::{QueueError, QueueResult};
pub use prioritizer::{
    prioritizer_for, FirstInFirstOutPrioritizer, FlowFilePrioritizer, NewestFlowFileFirstPrioritizer,
    OldestFlowFileFirstPrioritizer, PriorityAttributePrioritizer, QueueOrder,
};
pub use queue::{ConnectionQueue, FlowFileQueue, Reservation};
pub use size::QueueSize;
pub use swap::{NoopSwapRecorder, SwapManager, SwapRecorder, SwapSummary};
