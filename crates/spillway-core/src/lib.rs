//! Hardware-independent core library for spillway
//!
//! This crate manages the in-memory lifetime of streaming sensor readings:
//! per-stream buffering, size/time trimming, memory-pressure detection, the
//! spill of buffered samples to a durable store, and the read path that
//! stitches persisted, in-flight and buffered samples back together.
//!
//! It is `#![no_std]` with `extern crate alloc` so it compiles on both
//! embedded targets (heap in PSRAM) and desktop hosts (for the simulator and tests).

#![no_std]

extern crate alloc;

pub mod config;
pub mod error;
pub mod pressure;
pub mod sensors;
pub mod storage;

pub use config::{BufferConfig, PressureConfig, StorageMode};
pub use error::{BufferError, ConfigError, ManagerError};
pub use pressure::{MemoryPressureMonitor, MemoryProbe, MemoryUsage, PressureReading, PressureState};
pub use sensors::{
    ConsumerHub, Notification, ReadingCounter, SensorDescriptor, Timestamp, TimestampedSample,
};
pub use storage::manager::{PressureAction, RetainedStreams, SensorBufferManager, StreamState};
pub use storage::{PersistedRecord, PersistenceGateway, SeriesBuffer, Spillway};
