//! FlowFile records.
//!
//! A [`FlowFileRecord`] is immutable by replacement: every mutation helper
//! consumes or clones the record and returns a new version with `version`
//! bumped. Records that sit in a queue are never modified in place.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::claim::ContentClaim;
use crate::types::{now_millis, FlowFileId};

/// Attribute holding the FlowFile's globally unique identifier.
pub const UUID_ATTRIBUTE: &str = "uuid";
/// Attribute holding the FlowFile's file name.
pub const FILENAME_ATTRIBUTE: &str = "filename";
/// Attribute read by the priority-attribute prioritizer.
pub const PRIORITY_ATTRIBUTE: &str = "priority";

/// Insertion-ordered string attributes of a FlowFile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes(IndexMap<String, String>);

impl Attributes {
    /// Creates an empty attribute map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value of `key`, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Sets `key` to `value`. An existing key keeps its original position.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    /// Removes `key`, preserving the order of the remaining entries.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.shift_remove(key)
    }

    /// Returns true if `key` is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Number of attributes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when there are no attributes.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over `(key, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Attributes {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Attributes(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Metadata record of one unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowFileRecord {
    /// Repository-unique id.
    pub id: FlowFileId,
    /// String attributes in insertion order.
    pub attributes: Attributes,
    /// Content size in bytes (0 when there is no content).
    pub size: u64,
    /// Content reference, if the FlowFile has content.
    pub claim: Option<ContentClaim>,
    /// Update counter, bumped on every replacement.
    pub version: u64,
    /// When the oldest ancestor of this FlowFile entered the flow.
    pub lineage_start_ms: u64,
    /// When this FlowFile was created.
    pub entry_date_ms: u64,
    /// When this FlowFile last entered a queue.
    pub last_queue_date_ms: u64,
    /// Global enqueue index; the FIFO ordering key.
    pub queue_date_index: u64,
    /// Millisecond timestamp before which the FlowFile must not be polled (0 = none).
    pub penalty_expiration_ms: u64,
}

impl FlowFileRecord {
    /// Creates a fresh record with no content and a new `uuid` attribute.
    pub fn new(id: FlowFileId) -> Self {
        let now = now_millis();
        let uuid = uuid::Uuid::new_v4().to_string();
        let mut attributes = Attributes::new();
        attributes.insert(UUID_ATTRIBUTE, uuid.clone());
        attributes.insert(FILENAME_ATTRIBUTE, uuid);
        Self {
            id,
            attributes,
            size: 0,
            claim: None,
            version: 0,
            lineage_start_ms: now,
            entry_date_ms: now,
            last_queue_date_ms: 0,
            queue_date_index: 0,
            penalty_expiration_ms: 0,
        }
    }

    /// Returns the `uuid` attribute.
    pub fn uuid(&self) -> Option<&str> {
        self.attributes.get(UUID_ATTRIBUTE)
    }

    /// Returns the value of an attribute.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key)
    }

    /// True while the penalty has not expired at `now_ms`.
    pub fn is_penalized_at(&self, now_ms: u64) -> bool {
        self.penalty_expiration_ms > now_ms
    }

    /// New version with `key` set to `value`.
    pub fn with_attribute(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut next = self.next_version();
        next.attributes.insert(key, value);
        next
    }

    /// New version with every pair of `attributes` set, in order.
    pub fn with_attributes<'a>(&self, attributes: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut next = self.next_version();
        for (key, value) in attributes {
            next.attributes.insert(key, value);
        }
        next
    }

    /// New version without `key`.
    pub fn without_attribute(&self, key: &str) -> Self {
        let mut next = self.next_version();
        next.attributes.remove(key);
        next
    }

    /// New version pointing at `claim` (or no content).
    pub fn with_content(&self, claim: Option<ContentClaim>) -> Self {
        let mut next = self.next_version();
        next.size = claim.map(|c| c.length).unwrap_or(0);
        next.claim = claim;
        next
    }

    /// New version with the given penalty expiration.
    pub fn with_penalty(&self, expiration_ms: u64) -> Self {
        let mut next = self.next_version();
        next.penalty_expiration_ms = expiration_ms;
        next
    }

    /// New version stamped as entering a queue.
    pub fn with_queue_entry(&self, queue_date_ms: u64, queue_date_index: u64) -> Self {
        let mut next = self.next_version();
        next.last_queue_date_ms = queue_date_ms;
        next.queue_date_index = queue_date_index;
        next
    }

    fn next_version(&self) -> Self {
        let mut next = self.clone();
        next.version += 1;
        next
    }
}
