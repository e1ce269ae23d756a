#![warn(missing_docs)]

//! flowrepo subsystem: append-only content containers, claim reference counting
//! and grace-period reclamation.

pub mod claims;
pub mod container;
pub mod error;
pub mod reclaim;
pub mod store;

pub use claims::ClaimRegistry;
pub use container::{scan_containers, ContainerFile, ContainerPool, WritableContainer};
pub use error::{ContentError, ContentResult};
pub use reclaim::{ContainerReclaimer, ReclaimStats};
pub use store::{ClaimReader, ClaimStore, ContentStats, ContentStore};
