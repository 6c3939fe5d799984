use super::Timestamp;

/// Counts distinct physical readings.
///
/// One reading may fan out to several streams with the same timestamp; it is
/// counted once. The count only grows for the life of the manager.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadingCounter {
    count: u64,
    last_timestamp: Option<Timestamp>,
}

impl ReadingCounter {
    pub const fn new() -> Self {
        Self {
            count: 0,
            last_timestamp: None,
        }
    }

    /// Record a reading at `timestamp`, returning whether it was counted
    pub fn record(&mut self, timestamp: Timestamp) -> bool {
        if self.last_timestamp == Some(timestamp) {
            return false;
        }
        self.count += 1;
        self.last_timestamp = Some(timestamp);
        true
    }

    pub const fn count(&self) -> u64 {
        self.count
    }

    pub const fn last_timestamp(&self) -> Option<Timestamp> {
        self.last_timestamp
    }
}
