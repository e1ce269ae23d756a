//! Queue size accounting.

/// Point-in-time size of one connection queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueSize {
    /// Records sorted in memory and ready to poll.
    pub active_count: u64,
    /// Content bytes of the active records.
    pub active_bytes: u64,
    /// Records waiting for their penalty to expire.
    pub penalized_count: u64,
    /// Content bytes of the penalized records.
    pub penalized_bytes: u64,
    /// Records held in swap files.
    pub swapped_count: u64,
    /// Content bytes of the swapped records.
    pub swapped_bytes: u64,
    /// Number of swap files.
    pub swap_files: usize,
    /// Records polled by sessions that have not committed or rolled back.
    pub in_flight_count: u64,
    /// Content bytes of the in-flight records.
    pub in_flight_bytes: u64,
    /// Records reserved by committing sessions.
    pub reserved_count: u64,
    /// Content bytes reserved by committing sessions.
    pub reserved_bytes: u64,
}

impl QueueSize {
    /// Records queued on this connection, excluding in-flight and reserved ones.
    pub fn object_count(&self) -> u64 {
        self.active_count + self.penalized_count + self.swapped_count
    }

    /// Bytes queued on this connection, excluding in-flight and reserved ones.
    pub fn byte_count(&self) -> u64 {
        self.active_bytes + self.penalized_bytes + self.swapped_bytes
    }

    /// True when nothing is queued, in flight or reserved.
    pub fn is_empty(&self) -> bool {
        self.object_count() == 0 && self.in_flight_count == 0 && self.reserved_count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_totals_exclude_in_flight() {
        let size = QueueSize {
            active_count: 3,
            active_bytes: 30,
            penalized_count: 1,
            penalized_bytes: 5,
            swapped_count: 10,
            swapped_bytes: 100,
            in_flight_count: 2,
            in_flight_bytes: 20,
            ..QueueSize::default()
        };
        assert_eq!(size.object_count(), 14);
        assert_eq!(size.byte_count(), 135);
        assert!(!size.is_empty());
        assert!(QueueSize::default().is_empty());
    }
}
