//! Deployment configuration for the buffering engine
//!
//! The configuration is plain serde data so it can be stored next to the
//! other device settings (postcard-encoded on flash or SD card).

use core::str::FromStr;

use alloc::vec::Vec;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Where buffered samples go when memory runs short
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageMode {
    /// Persist locally and mark records for upload to the remote backend
    #[default]
    RemoteSync,
    /// Persist locally, never upload
    LocalOnly,
    /// Persist nothing; pressure only clears the buffers
    Discard,
}

impl StorageMode {
    /// Parse a host setting, falling back to [`StorageMode::RemoteSync`]
    /// when the value is not recognised.
    pub fn from_setting(value: &str) -> Self {
        match value.parse() {
            Ok(mode) => mode,
            Err(e) => {
                warn!("{}, falling back to remote sync", e);
                Self::RemoteSync
            }
        }
    }

    /// Whether pressure should write samples out rather than drop them
    pub const fn persists(self) -> bool {
        !matches!(self, Self::Discard)
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::RemoteSync => "Remote Storage",
            Self::LocalOnly => "Local Storage",
            Self::Discard => "None",
        }
    }
}

impl FromStr for StorageMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("remote storage") || s.eq_ignore_ascii_case("remote_sync") {
            Ok(Self::RemoteSync)
        } else if s.eq_ignore_ascii_case("local storage") || s.eq_ignore_ascii_case("local_only")
        {
            Ok(Self::LocalOnly)
        } else if s.eq_ignore_ascii_case("none") || s.eq_ignore_ascii_case("discard") {
            Ok(Self::Discard)
        } else {
            let mut name = heapless::String::new();
            for c in s.chars() {
                if name.push(c).is_err() {
                    break;
                }
            }
            Err(ConfigError::UnknownStorageMode(name))
        }
    }
}

/// Hysteresis band for the memory pressure latch, in permille of the
/// host's memory ceiling.
///
/// The latch engages once usage rises above `high_water_permille` and
/// releases once usage falls to `low_water_permille` or below. Setting both
/// to the same value gives a single threshold with no dead-band.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PressureConfig {
    pub high_water_permille: u16,
    pub low_water_permille: u16,
}

impl PressureConfig {
    /// One fifth of the ceiling
    pub const DEFAULT_HIGH_WATER: u16 = 200;
    pub const DEFAULT_LOW_WATER: u16 = 180;

    /// Single-threshold latch that re-engages as soon as usage re-crosses
    pub const fn without_dead_band(threshold_permille: u16) -> Self {
        Self {
            high_water_permille: threshold_permille,
            low_water_permille: threshold_permille,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.high_water_permille > 1000 || self.low_water_permille > self.high_water_permille {
            return Err(ConfigError::InvalidPressureBand {
                high: self.high_water_permille,
                low: self.low_water_permille,
            });
        }
        Ok(())
    }
}

impl Default for PressureConfig {
    fn default() -> Self {
        Self {
            high_water_permille: Self::DEFAULT_HIGH_WATER,
            low_water_permille: Self::DEFAULT_LOW_WATER,
        }
    }
}

/// Complete buffering configuration for one sensor instance
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BufferConfig {
    pub storage_mode: StorageMode,
    pub pressure: PressureConfig,
    /// Sample the memory monitor every N successful appends
    pub check_every: u32,
    /// Per-stream sample ceiling, covering held samples plus query copies;
    /// exceeding it counts as allocation failure
    pub reserve_limit: Option<u32>,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            storage_mode: StorageMode::default(),
            pressure: PressureConfig::default(),
            check_every: 1,
            reserve_limit: None,
        }
    }
}

impl BufferConfig {
    /// Replace invalid fields with their defaults, logging each fallback.
    pub fn validated(mut self) -> Self {
        if let Err(e) = self.pressure.validate() {
            warn!("{}, using default pressure band", e);
            self.pressure = PressureConfig::default();
        }
        if self.check_every == 0 {
            warn!("check_every must be at least 1, checking on every append");
            self.check_every = 1;
        }
        self
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ConfigError> {
        postcard::to_allocvec(self).map_err(ConfigError::Decode)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ConfigError> {
        postcard::from_bytes(bytes)
            .map(Self::validated)
            .map_err(ConfigError::Decode)
    }
}
