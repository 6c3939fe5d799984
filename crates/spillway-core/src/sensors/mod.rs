//! Sensor-facing types: samples, reading accounting, advertisement and
//! consumer notification.

mod notify;
mod readings;

pub use notify::{ConsumerHub, Notification};
pub use readings::ReadingCounter;

use core::fmt::Display;

use alloc::format;
use alloc::string::String;
use serde::{Deserialize, Serialize};

/// Wall-clock timestamp in milliseconds
pub type Timestamp = i64;

/// A single value produced by a sensor, tagged with the time it was read
///
/// This is the unit stored in every buffer, batch and query result. It is
/// owned by exactly one buffer until trimmed or drained.
#[derive(Debug, Clone, PartialEq)]
pub struct TimestampedSample<V> {
    pub value: V,
    pub timestamp: Timestamp,
}

impl<V> TimestampedSample<V> {
    pub const fn new(value: V, timestamp: Timestamp) -> Self {
        Self { value, timestamp }
    }
}

impl<V: Display> Display for TimestampedSample<V> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "[{}] {}", self.timestamp, self.value)
    }
}

/// Data type advertised for a sensor's values
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataType {
    #[default]
    Float,
    Integer,
    Bool,
    Text,
}

/// Identity of a sensor as it appears in persisted records and in the
/// advertisement sent to the remote backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorDescriptor {
    pub name: String,
    pub display_name: String,
    pub data_type: DataType,
}

impl SensorDescriptor {
    pub fn new(name: &str, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            display_name: name.into(),
            data_type,
        }
    }

    pub fn with_display_name(mut self, display_name: &str) -> Self {
        self.display_name = display_name.into();
        self
    }

    /// Description attached to every record of the given stream
    pub fn stream_description(&self, stream: &str) -> String {
        format!("stream={}", stream)
    }

    /// Build the advertisement for one of this sensor's streams
    pub fn advertise(&self, stream: &str) -> StreamAdvertisement {
        StreamAdvertisement {
            sensor_name: self.name.clone(),
            display_name: self.display_name.clone(),
            data_type: self.data_type,
            description: self.stream_description(stream),
        }
    }
}

/// What the (external) registration task needs to announce one stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamAdvertisement {
    pub sensor_name: String,
    pub display_name: String,
    pub data_type: DataType,
    pub description: String,
}
