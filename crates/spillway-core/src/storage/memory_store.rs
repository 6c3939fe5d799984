extern crate alloc;
use alloc::vec::Vec;

use thiserror_no_std::Error;

use super::{PersistedRecord, PersistenceGateway};
use crate::sensors::Timestamp;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store unavailable")]
    Unavailable,
}

/// Heap-backed [`PersistenceGateway`]
///
/// Used by the simulator and by tests. It can be told to go offline or to
/// accept only part of each batch, which is how write shortfalls and
/// unavailable stores are exercised.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Vec<PersistedRecord>,
    offline: bool,
    /// Accept at most this many records per batch
    write_limit: Option<usize>,
    append_calls: usize,
    query_calls: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&mut self, offline: bool) {
        self.offline = offline;
    }

    pub fn set_write_limit(&mut self, limit: Option<usize>) {
        self.write_limit = limit;
    }

    pub fn records(&self) -> &[PersistedRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn append_calls(&self) -> usize {
        self.append_calls
    }

    pub fn query_calls(&self) -> usize {
        self.query_calls
    }
}

impl PersistenceGateway for MemoryStore {
    type Error = StoreError;

    async fn append_batch(
        &mut self,
        _stream: &str,
        records: &[PersistedRecord],
    ) -> Result<usize, Self::Error> {
        self.append_calls += 1;
        if self.offline {
            return Err(StoreError::Unavailable);
        }

        let accepted = self
            .write_limit
            .map_or(records.len(), |limit| limit.min(records.len()));
        self.records.extend_from_slice(&records[..accepted]);
        Ok(accepted)
    }

    async fn query_range(
        &mut self,
        stream: &str,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<PersistedRecord>, Self::Error> {
        self.query_calls += 1;
        if self.offline {
            return Err(StoreError::Unavailable);
        }

        let mut found: Vec<PersistedRecord> = self
            .records
            .iter()
            .filter(|r| r.stream == stream && r.timestamp >= start && r.timestamp <= end)
            .cloned()
            .collect();
        // Stable, so equal timestamps keep insertion order
        found.sort_by_key(|r| r.timestamp);
        Ok(found)
    }
}
