//! Content claim references.
//!
//! A [`ResourceClaim`] names one append-only container file; a
//! [`ContentClaim`] names a byte range inside it. Reference counts are not
//! stored here: the content store keeps them in its claim registry so that a
//! claim can be copied freely between FlowFile records.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// One append-only container file inside a content section.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceClaim {
    /// Container id, unique across the repository.
    pub container: u64,
    /// Section (sub-directory) the container lives in.
    pub section: u32,
}

impl ResourceClaim {
    /// Creates a resource claim for the given container and section.
    pub fn new(container: u64, section: u32) -> Self {
        Self { container, section }
    }

    /// Path of the container file relative to the content root.
    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from(self.section.to_string()).join(self.container.to_string())
    }
}

impl fmt::Display for ResourceClaim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.section, self.container)
    }
}

/// A byte range `[offset, offset + length)` inside a container.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentClaim {
    /// The container holding the bytes.
    pub resource: ResourceClaim,
    /// Offset of the first byte in the container.
    pub offset: u64,
    /// Number of bytes in the range.
    pub length: u64,
}

impl ContentClaim {
    /// Creates a claim over `[offset, offset + length)` of `resource`.
    pub fn new(resource: ResourceClaim, offset: u64, length: u64) -> Self {
        Self {
            resource,
            offset,
            length,
        }
    }

    /// First byte offset past the end of this claim.
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

impl fmt::Display for ContentClaim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}+{}", self.resource, self.offset, self.length)
    }
}
