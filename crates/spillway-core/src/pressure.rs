//! Memory pressure detection
//!
//! The monitor never touches buffers. It samples an injectable
//! [`MemoryProbe`] and reports whether the process should consider itself
//! memory-constrained, latching with hysteresis so one sustained excursion
//! produces exactly one `Normal -> Pressure` transition.

use log::{debug, info};

use crate::config::PressureConfig;

/// Aggregate memory statistics for the host process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryUsage {
    /// Bytes currently in use
    pub used: usize,
    /// Bytes the host is allowed to use at most
    pub ceiling: usize,
}

impl MemoryUsage {
    pub const fn new(used: usize, ceiling: usize) -> Self {
        Self { used, ceiling }
    }

    /// Usage in permille of the ceiling, `None` when the ceiling is unknown
    pub fn permille(&self) -> Option<u64> {
        if self.ceiling == 0 {
            return None;
        }
        let permille = self.used as u128 * 1000 / self.ceiling as u128;
        Some(u64::try_from(permille).unwrap_or(u64::MAX))
    }

    // Widened so neither side can overflow for any usize
    fn above(&self, permille: u16) -> bool {
        self.used as u128 * 1000 > self.ceiling as u128 * permille as u128
    }
}

/// Source of memory statistics.
///
/// On the device this reads the heap allocator's counters; tests and the
/// simulator provide synthetic values.
pub trait MemoryProbe {
    fn usage(&self) -> MemoryUsage;
}

impl<P: MemoryProbe + ?Sized> MemoryProbe for &P {
    fn usage(&self) -> MemoryUsage {
        (**self).usage()
    }
}

/// Adapts a closure into a [`MemoryProbe`]
pub struct FnProbe<F>(pub F);

impl<F: Fn() -> MemoryUsage> MemoryProbe for FnProbe<F> {
    fn usage(&self) -> MemoryUsage {
        (self.0)()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PressureState {
    #[default]
    Normal,
    Pressure,
}

/// Result of one monitor sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PressureReading {
    pub state: PressureState,
    /// Set only on the sample that flipped the latch
    pub changed: bool,
    pub usage: MemoryUsage,
}

impl PressureReading {
    /// Fresh `Normal -> Pressure` transition
    pub fn entered_pressure(&self) -> bool {
        self.changed && self.state == PressureState::Pressure
    }
}

pub struct MemoryPressureMonitor<P> {
    probe: P,
    band: PressureConfig,
    state: PressureState,
    transitions: u64,
}

impl<P: MemoryProbe> MemoryPressureMonitor<P> {
    pub fn new(probe: P, band: PressureConfig) -> Self {
        Self {
            probe,
            band,
            state: PressureState::Normal,
            transitions: 0,
        }
    }

    pub fn sample(&mut self) -> PressureReading {
        let usage = self.probe.usage();
        if usage.ceiling == 0 {
            return PressureReading {
                state: self.state,
                changed: false,
                usage,
            };
        }

        let next = match self.state {
            PressureState::Normal if usage.above(self.band.high_water_permille) => {
                PressureState::Pressure
            }
            PressureState::Pressure if !usage.above(self.band.low_water_permille) => {
                PressureState::Normal
            }
            unchanged => unchanged,
        };

        let changed = next != self.state;
        if changed {
            self.transitions += 1;
            match next {
                PressureState::Pressure => info!(
                    "Memory pressure: {} of {} bytes in use",
                    usage.used, usage.ceiling
                ),
                PressureState::Normal => info!("Memory freed: {} bytes in use", usage.used),
            }
        } else {
            debug!("Memory usage {:?} permille", usage.permille());
        }
        self.state = next;

        PressureReading {
            state: next,
            changed,
            usage,
        }
    }

    pub fn state(&self) -> PressureState {
        self.state
    }

    /// Number of latch flips since creation
    pub fn transitions(&self) -> u64 {
        self.transitions
    }

    pub fn probe(&self) -> &P {
        &self.probe
    }
}
