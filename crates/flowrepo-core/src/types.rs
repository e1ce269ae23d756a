//! Identifier newtypes and clock helpers shared by every flowrepo subsystem.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Unique identifier of a FlowFile within one repository.
///
/// Ids are assigned monotonically and the generator is restored from the
/// ledger on startup, so an id is never reused for a different FlowFile.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowFileId(u64);

impl FlowFileId {
    /// Creates a new FlowFileId from a raw u64 value
    pub fn new(id: u64) -> Self {
        FlowFileId(id)
    }

    /// Returns the raw u64 value of this FlowFile ID
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for FlowFileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a connection queue between two processing stages.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Creates a connection id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        ConnectionId(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a form of the id that is safe to embed in a file name.
    ///
    /// Anything other than ASCII alphanumerics, `-` and `_` is replaced by `_`.
    pub fn file_stem(&self) -> String {
        self.0
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        ConnectionId::new(value)
    }
}

impl From<String> for ConnectionId {
    fn from(value: String) -> Self {
        ConnectionId(value)
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Adds a duration to a millisecond timestamp, saturating on overflow.
pub fn millis_after(base_ms: u64, duration: Duration) -> u64 {
    base_ms.saturating_add(duration.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flowfile_id_ordering() {
        assert!(FlowFileId::new(1) < FlowFileId::new(2));
        assert_eq!(FlowFileId::new(7).as_u64(), 7);
        assert_eq!(format!("{}", FlowFileId::new(42)), "42");
    }

    #[test]
    fn test_connection_file_stem() {
        let id = ConnectionId::new("ingest/parse step#1");
        assert_eq!(id.file_stem(), "ingest_parse_step_1");
        assert_eq!(id.as_str(), "ingest/parse step#1");
    }

    #[test]
    fn test_millis_after_saturates() {
        assert_eq!(millis_after(u64::MAX - 1, Duration::from_secs(10)), u64::MAX);
        assert_eq!(millis_after(1_000, Duration::from_millis(250)), 1_250);
    }

    #[test]
    fn test_now_millis_monotone_enough() {
        let a = now_millis();
        let b = now_millis();
        assert!(b >= a);
        assert!(a > 1_600_000_000_000);
    }
}
