pub mod buffer;
pub mod manager;
pub mod memory_store;
#[cfg(feature = "sd-card")]
pub mod sd_card;
pub mod spill;

pub use buffer::SeriesBuffer;
pub use memory_store::{MemoryStore, StoreError};
pub use spill::{SpillBatch, SpillStats, Spillway};

use core::fmt::Debug;
use core::future::Future;

use alloc::string::{String, ToString};
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

use crate::config::StorageMode;
use crate::sensors::{DataType, SensorDescriptor, Timestamp, TimestampedSample};

/// Upload state stored with every persisted record
///
/// The numeric codes match the transmit column of the local datapoint table.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransmitState {
    /// Waiting to be synced to the remote backend
    Pending = 0,
    /// Kept on the device only
    LocalOnly = 1,
}

impl TransmitState {
    pub const fn for_mode(mode: StorageMode) -> Self {
        match mode {
            StorageMode::RemoteSync => Self::Pending,
            StorageMode::LocalOnly | StorageMode::Discard => Self::LocalOnly,
        }
    }
}

/// Durable form of one sample
///
/// Values are stored as text so the store does not need to know the
/// sensor's value type.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PersistedRecord {
    pub sensor_name: String,
    pub display_name: String,
    pub description: String,
    pub stream: String,
    pub data_type: DataType,
    pub timestamp: Timestamp,
    pub value: String,
    pub transmit: TransmitState,
}

impl PersistedRecord {
    pub fn from_sample<V: core::fmt::Display>(
        sensor: &SensorDescriptor,
        stream: &str,
        sample: &TimestampedSample<V>,
        transmit: TransmitState,
    ) -> Self {
        Self {
            sensor_name: sensor.name.clone(),
            display_name: sensor.display_name.clone(),
            description: sensor.stream_description(stream),
            stream: stream.into(),
            data_type: sensor.data_type,
            timestamp: sample.timestamp,
            value: sample.value.to_string(),
            transmit,
        }
    }

    /// Parse the stored text back into a sample
    pub fn to_sample<V: core::str::FromStr>(&self) -> Option<TimestampedSample<V>> {
        self.value
            .parse()
            .ok()
            .map(|value| TimestampedSample::new(value, self.timestamp))
    }
}

/// Narrow interface to the durable store that receives spilled samples
///
/// Both operations may suspend; the manager calls `append_batch` only from
/// the background writer so producers never wait on it.
pub trait PersistenceGateway {
    type Error: Debug;

    /// Append a batch of records for `stream`, returning how many were
    /// actually written. Fewer than requested is a shortfall, not an error.
    fn append_batch(
        &mut self,
        stream: &str,
        records: &[PersistedRecord],
    ) -> impl Future<Output = Result<usize, Self::Error>>;

    /// Records of `stream` with `start <= timestamp <= end`, ascending by
    /// timestamp.
    fn query_range(
        &mut self,
        stream: &str,
        start: Timestamp,
        end: Timestamp,
    ) -> impl Future<Output = Result<Vec<PersistedRecord>, Self::Error>>;
}
