//! Hand-off between the producer path and the background storage writer
//!
//! Spilling must never block a producer on I/O. The manager drains its
//! buffers into [`SpillBatch`]es and stages them here, which only takes a
//! short blocking lock and raises a signal. A writer task (the `run` loop on
//! an embassy executor, or a host thread calling `drain_pending`) picks the
//! batches up and appends them to the [`PersistenceGateway`].
//!
//! ## Flush mark
//!
//! `last_flushed` is advanced only after a batch has landed, and it is
//! advanced while the writer still holds the gateway lock. Queries take the
//! same lock before looking at the mark and the in-flight queue, so every
//! staged sample is visible to a query either in flight or in storage.

use core::cell::RefCell;
use core::fmt::Display;

extern crate alloc;
use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;

use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::mutex::{Mutex as AsyncMutex, MutexGuard};
use embassy_sync::signal::Signal;
use log::{debug, error, warn};

use super::{PersistedRecord, PersistenceGateway, TransmitState};
use crate::sensors::{SensorDescriptor, Timestamp, TimestampedSample};

/// Samples drained from one stream, waiting to be written
#[derive(Debug, Clone)]
pub struct SpillBatch<V> {
    pub stream: String,
    pub samples: Vec<TimestampedSample<V>>,
    pub transmit: TransmitState,
}

impl<V> SpillBatch<V> {
    /// Newest timestamp in the batch
    pub fn high_water(&self) -> Option<Timestamp> {
        self.samples.iter().map(|s| s.timestamp).max()
    }
}

/// Writer counters, for logging and assertions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpillStats {
    pub batches_staged: u64,
    pub batches_written: u64,
    pub records_written: u64,
    /// Records the store did not accept
    pub records_short: u64,
}

pub(crate) struct SpillState<V> {
    pub(crate) pending: VecDeque<SpillBatch<V>>,
    pub(crate) last_flushed: Option<Timestamp>,
    pub(crate) stats: SpillStats,
}

/// What a read-through query saw, captured under the gateway lock
pub(crate) struct ReadBack<V, R, E> {
    pub(crate) persisted: Option<Result<Vec<PersistedRecord>, E>>,
    pub(crate) in_flight: Vec<TimestampedSample<V>>,
    pub(crate) memory: R,
}

/// Shared spill state for one sensor instance
///
/// One `Spillway` pairs with exactly one manager, so the flush mark and the
/// in-flight queue are per instance. Place it in a `StaticCell` (or any
/// long-lived location) and hand references to the manager and the writer.
pub struct Spillway<M: RawMutex, V, G> {
    sensor: SensorDescriptor,
    gateway: AsyncMutex<M, G>,
    state: BlockingMutex<M, RefCell<SpillState<V>>>,
    wake: Signal<M, ()>,
}

impl<M, V, G> Spillway<M, V, G>
where
    M: RawMutex,
    G: PersistenceGateway,
{
    pub fn new(sensor: SensorDescriptor, gateway: G) -> Self {
        Self {
            sensor,
            gateway: AsyncMutex::new(gateway),
            state: BlockingMutex::new(RefCell::new(SpillState {
                pending: VecDeque::new(),
                last_flushed: None,
                stats: SpillStats::default(),
            })),
            wake: Signal::new(),
        }
    }

    pub fn sensor(&self) -> &SensorDescriptor {
        &self.sensor
    }

    /// Direct access to the store, e.g. to inspect it in tests
    pub async fn gateway(&self) -> MutexGuard<'_, M, G> {
        self.gateway.lock().await
    }

    /// Latest timestamp known to have landed in storage
    pub fn last_flushed(&self) -> Option<Timestamp> {
        self.state.lock(|s| s.borrow().last_flushed)
    }

    pub fn pending_batches(&self) -> usize {
        self.state.lock(|s| s.borrow().pending.len())
    }

    pub fn pending_samples(&self) -> usize {
        self.state
            .lock(|s| s.borrow().pending.iter().map(|b| b.samples.len()).sum())
    }

    pub fn stats(&self) -> SpillStats {
        self.state.lock(|s| s.borrow().stats)
    }

    /// Wake the writer without staging anything
    pub fn wake(&self) {
        self.wake.signal(());
    }

    /// Queue batches for the writer.
    ///
    /// `fill` runs under the spill lock, so draining buffers inside it is
    /// atomic with respect to queries.
    pub(crate) fn stage_with<R>(&self, fill: impl FnOnce(&mut VecDeque<SpillBatch<V>>) -> R) -> R {
        let (result, staged) = self.state.lock(|s| {
            let mut s = s.borrow_mut();
            let before = s.pending.len();
            let result = fill(&mut s.pending);
            let staged = s.pending.len() - before;
            s.stats.batches_staged += staged as u64;
            (result, staged)
        });
        if staged > 0 {
            self.wake.signal(());
        }
        result
    }

    /// Capture persisted, in-flight and in-memory samples for a window.
    ///
    /// `memory` runs under the spill lock, so no spill can move samples
    /// between the three sources while they are being read.
    pub(crate) async fn read_back<R>(
        &self,
        stream: &str,
        start: Timestamp,
        end: Timestamp,
        memory: impl FnOnce() -> R,
    ) -> ReadBack<V, R, G::Error>
    where
        V: Clone,
    {
        let mut gateway = self.gateway.lock().await;

        let (flushed, in_flight, memory) = self.state.lock(|s| {
            let s = s.borrow();
            let in_flight: Vec<TimestampedSample<V>> = s
                .pending
                .iter()
                .filter(|b| b.stream == stream)
                .flat_map(|b| b.samples.iter())
                .filter(|sample| sample.timestamp >= start && sample.timestamp <= end)
                .cloned()
                .collect();
            (s.last_flushed, in_flight, memory())
        });

        let persisted = match flushed {
            Some(flushed) if start < flushed => {
                Some(gateway.query_range(stream, start, flushed.min(end)).await)
            }
            _ => None,
        };

        ReadBack {
            persisted,
            in_flight,
            memory,
        }
    }

    /// Write every staged batch to the gateway, returning the number of
    /// records the store accepted.
    pub async fn drain_pending(&self) -> usize
    where
        V: Display,
    {
        let mut landed = 0;
        loop {
            let mut gateway = self.gateway.lock().await;
            let Some(batch) = self.state.lock(|s| s.borrow_mut().pending.pop_front()) else {
                break;
            };

            let records: Vec<PersistedRecord> = batch
                .samples
                .iter()
                .map(|s| PersistedRecord::from_sample(&self.sensor, &batch.stream, s, batch.transmit))
                .collect();
            let requested = records.len();

            let written = match gateway.append_batch(&batch.stream, &records).await {
                Ok(count) => count.min(requested),
                Err(e) => {
                    error!(
                        "Failed to write {} samples of {} to storage: {:?}",
                        requested, batch.stream, e
                    );
                    0
                }
            };

            if written == requested {
                debug!("data (count = {}) flushed successfully", written);
            } else {
                warn!(
                    "inserted {} samples of {} in storage instead of {}",
                    written, batch.stream, requested
                );
            }

            let high_water = batch.high_water();
            self.state.lock(|s| {
                let mut s = s.borrow_mut();
                if written > 0 {
                    s.last_flushed = s.last_flushed.max(high_water);
                }
                s.stats.batches_written += 1;
                s.stats.records_written += written as u64;
                s.stats.records_short += (requested - written) as u64;
            });
            landed += written;
        }
        landed
    }

    /// Writer task body for embassy executors
    pub async fn run(&self)
    where
        V: Display,
    {
        loop {
            self.wake.wait().await;
            self.drain_pending().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::DataType;
    use crate::storage::MemoryStore;
    use alloc::vec;
    use embassy_futures::block_on;
    use embassy_futures::select::{Either, select};
    use embassy_futures::yield_now;
    use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

    type TestSpillway = Spillway<CriticalSectionRawMutex, i32, MemoryStore>;

    fn spillway() -> TestSpillway {
        Spillway::new(
            SensorDescriptor::new("test", DataType::Integer),
            MemoryStore::new(),
        )
    }

    fn batch(stream: &str, timestamps: &[Timestamp]) -> SpillBatch<i32> {
        SpillBatch {
            stream: stream.into(),
            samples: timestamps
                .iter()
                .map(|&ts| TimestampedSample::new(ts as i32, ts))
                .collect(),
            transmit: TransmitState::Pending,
        }
    }

    #[test]
    fn test_flush_mark_moves_only_when_batch_lands() {
        let spillway = spillway();
        spillway.stage_with(|pending| pending.push_back(batch("a", &[1, 5, 3])));

        assert_eq!(spillway.pending_batches(), 1);
        assert_eq!(spillway.last_flushed(), None);

        assert_eq!(block_on(spillway.drain_pending()), 3);
        assert_eq!(spillway.pending_batches(), 0);
        assert_eq!(spillway.last_flushed(), Some(5));
    }

    #[test]
    fn test_flush_mark_is_max_across_batches() {
        let spillway = spillway();
        spillway.stage_with(|pending| {
            pending.push_back(batch("a", &[10, 20]));
            pending.push_back(batch("b", &[15]));
        });
        block_on(spillway.drain_pending());
        assert_eq!(spillway.last_flushed(), Some(20));

        let stats = spillway.stats();
        assert_eq!(stats.batches_staged, 2);
        assert_eq!(stats.batches_written, 2);
        assert_eq!(stats.records_written, 3);
        assert_eq!(stats.records_short, 0);
    }

    #[test]
    fn test_shortfall_is_counted_not_retried() {
        let spillway = spillway();
        block_on(spillway.gateway()).set_write_limit(Some(1));
        spillway.stage_with(|pending| pending.push_back(batch("a", &[1, 2, 3])));

        assert_eq!(block_on(spillway.drain_pending()), 1);
        assert_eq!(spillway.stats().records_short, 2);
        assert_eq!(spillway.pending_batches(), 0);
        assert_eq!(block_on(spillway.gateway()).len(), 1);
    }

    #[test]
    fn test_failed_write_leaves_mark_alone() {
        let spillway = spillway();
        block_on(spillway.gateway()).set_offline(true);
        spillway.stage_with(|pending| pending.push_back(batch("a", &[7])));

        assert_eq!(block_on(spillway.drain_pending()), 0);
        assert_eq!(spillway.last_flushed(), None);
        assert_eq!(spillway.stats().records_short, 1);
    }

    #[test]
    fn test_run_writes_batches_when_woken() {
        let spillway = spillway();
        let producer = async {
            spillway.stage_with(|pending| pending.push_back(batch("a", &[4, 9])));
            while spillway.last_flushed().is_none() {
                yield_now().await;
            }
            spillway.stats()
        };

        match block_on(select(spillway.run(), producer)) {
            Either::First(()) => panic!("writer loop returned"),
            Either::Second(stats) => {
                assert_eq!(stats.batches_written, 1);
                assert_eq!(stats.records_written, 2);
            }
        }
        assert_eq!(spillway.last_flushed(), Some(9));
        assert_eq!(spillway.pending_batches(), 0);
        assert_eq!(block_on(spillway.gateway()).len(), 2);
    }

    #[test]
    fn test_read_back_sees_in_flight_samples() {
        let spillway = spillway();
        spillway.stage_with(|pending| {
            pending.push_back(batch("a", &[100, 200]));
            pending.push_back(batch("b", &[150]));
        });

        let seen = block_on(spillway.read_back("a", 150, 300, || 42));
        assert!(seen.persisted.is_none());
        assert_eq!(seen.in_flight, vec![TimestampedSample::new(200, 200)]);
        assert_eq!(seen.memory, 42);
        assert_eq!(spillway.pending_samples(), 3);
    }

    #[test]
    fn test_read_back_queries_store_below_flush_mark() {
        let spillway = spillway();
        spillway.stage_with(|pending| pending.push_back(batch("a", &[100, 200])));
        block_on(spillway.drain_pending());

        let seen = block_on(spillway.read_back("a", 50, 300, || ()));
        let persisted = seen.persisted.unwrap().unwrap();
        let ts: Vec<Timestamp> = persisted.iter().map(|r| r.timestamp).collect();
        assert_eq!(ts, [100, 200]);
        assert!(seen.in_flight.is_empty());

        // Window entirely after the mark never touches the store
        let seen = block_on(spillway.read_back("a", 200, 300, || ()));
        assert!(seen.persisted.is_none());
        assert_eq!(block_on(spillway.gateway()).query_calls(), 1);
    }
}
