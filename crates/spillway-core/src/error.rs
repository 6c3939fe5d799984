//! Error types shared across the buffering engine

use alloc::string::String;

use thiserror_no_std::Error;

/// Errors raised by a single [`SeriesBuffer`](crate::storage::SeriesBuffer)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    /// The host could not provide memory for the operation.
    ///
    /// A buffer that reports this cannot be trusted to retain further data
    /// and must be drained or destroyed.
    #[error("Out of resources (buffer holds {stream_len} samples)")]
    OutOfResources {
        /// Number of samples held when the reservation failed
        stream_len: usize,
    },
}

/// Errors surfaced to producers and consumers by the manager
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ManagerError {
    /// The stream name was not declared when the manager was built
    #[error("Unknown stream: {0}")]
    UnknownStream(String),

    /// Memory ran out while appending; the sensor instance was torn down
    #[error("Out of resources on stream {stream}, {lost} samples lost")]
    OutOfResources {
        /// Stream whose buffer failed
        stream: String,
        /// Samples dropped from that stream, including the rejected one
        lost: u64,
    },

    /// The manager was torn down after resource exhaustion
    #[error("Sensor buffers were torn down")]
    TornDown,
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Storage mode setting not recognised
    #[error("Unknown storage mode: {0}")]
    UnknownStorageMode(heapless::String<32>),

    /// Release threshold above the entry threshold, or ratio above 1
    #[error("Invalid pressure band (high: {high}, low: {low})")]
    InvalidPressureBand {
        /// Entry threshold in permille
        high: u16,
        /// Release threshold in permille
        low: u16,
    },

    /// Stored configuration could not be decoded
    #[error("Config decode failed: {0}")]
    Decode(postcard::Error),
}
