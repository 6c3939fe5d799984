use core::cell::RefCell;
use core::str::FromStr;

extern crate alloc;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::blocking_mutex::raw::RawMutex;
use log::{debug, error, info, warn};

use super::spill::{SpillBatch, Spillway};
use super::{PersistenceGateway, SeriesBuffer, TransmitState};
use crate::config::BufferConfig;
use crate::error::{BufferError, ManagerError};
use crate::pressure::{MemoryPressureMonitor, MemoryProbe, PressureState};
use crate::sensors::{
    ConsumerHub, Notification, ReadingCounter, StreamAdvertisement, Timestamp, TimestampedSample,
};

/// Storage state of one stream's buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Nothing buffered
    Empty,
    /// Holding samples, none evicted since the last empty state
    Buffered,
    /// Holding samples after older ones were trimmed away
    Trimmed,
    /// Drained to storage; empty until the next append
    Spilled,
}

/// What a pressure check did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressureAction {
    None,
    /// Samples handed to the writer
    Spilled(usize),
    /// Samples dropped because the deployment persists nothing
    Cleared(usize),
}

/// Samples left buffered when a sensor is deactivated while consumers are
/// still registered. Hand them to the next activation with
/// [`SensorBufferManager::restore`].
#[derive(Debug, Clone, Default)]
pub struct RetainedStreams<V> {
    pub streams: BTreeMap<String, Vec<TimestampedSample<V>>>,
}

impl<V> RetainedStreams<V> {
    pub fn samples(&self) -> usize {
        self.streams.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.samples() == 0
    }
}

struct Slot<V> {
    buffer: SeriesBuffer<V>,
    state: StreamState,
}

impl<V> Slot<V> {
    fn after_trim(&mut self, removed: usize) -> usize {
        if removed > 0 {
            self.state = if self.buffer.is_empty() {
                StreamState::Empty
            } else {
                StreamState::Trimmed
            };
        }
        removed
    }
}

struct Control {
    readings: ReadingCounter,
    appends_since_check: u32,
    lost_samples: u64,
    torn_down: bool,
}

/// Buffers every value stream of one sensor instance
///
/// Owns one [`SeriesBuffer`] per declared stream, each behind its own lock so
/// unrelated streams never contend. Appends sample the memory monitor; a
/// fresh pressure transition drains every stream to the [`Spillway`] (or
/// clears them when the deployment persists nothing). Queries stitch stored,
/// in-flight and buffered samples into one ascending sequence.
///
/// ## Teardown
///
/// Running out of memory while appending is fatal for the instance: the
/// failing stream's samples are counted as lost, every other stream is
/// flushed and further appends are refused. Queries keep working.
///
/// ## Flush mark
///
/// A single `last_flushed` mark covers all streams. When streams run at very
/// different rates the mark can run ahead of a slow stream's stored data, in
/// which case queries simply ask the store for a range it partly lacks.
pub struct SensorBufferManager<'a, M, V, G, P, H>
where
    M: RawMutex,
    G: PersistenceGateway,
    P: MemoryProbe,
    H: ConsumerHub,
{
    streams: BTreeMap<String, BlockingMutex<M, RefCell<Slot<V>>>>,
    spillway: &'a Spillway<M, V, G>,
    monitor: BlockingMutex<M, RefCell<MemoryPressureMonitor<P>>>,
    control: BlockingMutex<M, RefCell<Control>>,
    hub: H,
    config: BufferConfig,
    deactivated: bool,
}

impl<'a, M, V, G, P, H> SensorBufferManager<'a, M, V, G, P, H>
where
    M: RawMutex,
    G: PersistenceGateway,
    P: MemoryProbe,
    H: ConsumerHub,
{
    /// Create a manager for the given streams. The stream set is fixed for
    /// the life of the manager.
    pub fn new(
        streams: &[&str],
        spillway: &'a Spillway<M, V, G>,
        probe: P,
        hub: H,
        config: BufferConfig,
    ) -> Self {
        let config = config.validated();
        let streams = streams
            .iter()
            .map(|&name| {
                let buffer = match config.reserve_limit {
                    Some(limit) => SeriesBuffer::with_reserve_limit(limit as usize),
                    None => SeriesBuffer::new(),
                };
                let slot = Slot {
                    buffer,
                    state: StreamState::Empty,
                };
                (String::from(name), BlockingMutex::new(RefCell::new(slot)))
            })
            .collect();

        Self {
            streams,
            spillway,
            monitor: BlockingMutex::new(RefCell::new(MemoryPressureMonitor::new(
                probe,
                config.pressure,
            ))),
            control: BlockingMutex::new(RefCell::new(Control {
                readings: ReadingCounter::new(),
                appends_since_check: 0,
                lost_samples: 0,
                torn_down: false,
            })),
            hub,
            config,
            deactivated: false,
        }
    }

    /// Buffer a value for `stream`, then notify consumers.
    ///
    /// With an `id` only that consumer is notified; otherwise every consumer
    /// of the stream is.
    pub fn record(
        &self,
        stream: &str,
        id: Option<&str>,
        timestamp: Timestamp,
        value: V,
    ) -> Result<(), ManagerError> {
        self.append(stream, timestamp, value)?;
        if self.due_for_check() {
            self.check_pressure();
        }
        self.hub.notify(Notification::for_append(stream, id));
        Ok(())
    }

    /// Buffer a value, then drop every sample older than `history` from all
    /// streams.
    pub fn record_trim_time(
        &self,
        stream: &str,
        id: Option<&str>,
        timestamp: Timestamp,
        value: V,
        history: Timestamp,
    ) -> Result<(), ManagerError> {
        self.append(stream, timestamp, value)?;
        self.trim_all_by_time(timestamp.saturating_sub(history));
        if self.due_for_check() {
            self.check_pressure();
        }
        self.hub.notify(Notification::for_append(stream, id));
        Ok(())
    }

    fn append(&self, stream: &str, timestamp: Timestamp, value: V) -> Result<(), ManagerError> {
        let slot = self.slot(stream)?;
        if self.is_torn_down() {
            return Err(ManagerError::TornDown);
        }
        self.control
            .lock(|c| c.borrow_mut().readings.record(timestamp));

        let appended: Result<(), BufferError> = slot.lock(|s| {
            let mut s = s.borrow_mut();
            s.buffer.append(TimestampedSample::new(value, timestamp))?;
            if matches!(s.state, StreamState::Empty | StreamState::Spilled) {
                s.state = StreamState::Buffered;
            }
            Ok(())
        });

        if let Err(e) = appended {
            error!("{} on stream {}, tearing down sensor buffers", e, stream);
            let lost = self.tear_down(Some(stream), 0);
            return Err(ManagerError::OutOfResources {
                stream: stream.into(),
                lost,
            });
        }
        Ok(())
    }

    fn due_for_check(&self) -> bool {
        let every = self.config.check_every;
        self.control.lock(|c| {
            let mut c = c.borrow_mut();
            c.appends_since_check += 1;
            if c.appends_since_check >= every {
                c.appends_since_check = 0;
                true
            } else {
                false
            }
        })
    }

    /// Sample memory usage and react to a fresh pressure transition.
    pub fn check_pressure(&self) -> PressureAction {
        let reading = self.monitor.lock(|m| m.borrow_mut().sample());
        if !reading.entered_pressure() {
            return PressureAction::None;
        }

        info!(
            "Flush to storage, storage option: {}",
            self.config.storage_mode.label()
        );
        if self.config.storage_mode.persists() {
            PressureAction::Spilled(self.spill_all())
        } else {
            PressureAction::Cleared(self.clear_all())
        }
    }

    /// Drain every non-empty stream and stage the batches for the writer.
    ///
    /// Returns the number of samples staged.
    pub fn spill_all(&self) -> usize {
        let transmit = TransmitState::for_mode(self.config.storage_mode);
        let staged = self.spillway.stage_with(|pending| {
            let mut staged = 0;
            for (name, slot) in &self.streams {
                let samples = slot.lock(|s| {
                    let mut s = s.borrow_mut();
                    if s.buffer.is_empty() {
                        return None;
                    }
                    s.state = StreamState::Spilled;
                    Some(s.buffer.drain_all())
                });

                match samples {
                    Some(samples) => {
                        staged += samples.len();
                        pending.push_back(SpillBatch {
                            stream: name.clone(),
                            samples,
                            transmit,
                        });
                    }
                    None => debug!("No values to send for stream {}", name),
                }
            }
            staged
        });

        info!("Staged {} samples for storage", staged);
        staged
    }

    /// Drop everything buffered without writing it.
    ///
    /// Returns the number of samples dropped.
    pub fn clear_all(&self) -> usize {
        let cleared = self
            .streams
            .values()
            .map(|slot| {
                slot.lock(|s| {
                    let mut s = s.borrow_mut();
                    let len = s.buffer.len();
                    s.buffer.clear();
                    s.state = StreamState::Empty;
                    len
                })
            })
            .sum();
        info!("Cleared {} buffered samples", cleared);
        cleared
    }

    /// Spill or clear everything according to the storage mode
    pub fn flush(&self) -> usize {
        if self.config.storage_mode.persists() {
            self.spill_all()
        } else {
            self.clear_all()
        }
    }

    /// Keep only the newest `max_len` samples of `stream`
    pub fn trim_by_size(&self, stream: &str, max_len: usize) -> Result<usize, ManagerError> {
        let slot = self.slot(stream)?;
        Ok(slot.lock(|s| {
            let mut s = s.borrow_mut();
            let removed = s.buffer.trim_to_size(max_len);
            s.after_trim(removed)
        }))
    }

    /// Drop samples of `stream` older than `horizon`
    pub fn trim_by_time(&self, stream: &str, horizon: Timestamp) -> Result<usize, ManagerError> {
        let slot = self.slot(stream)?;
        Ok(slot.lock(|s| {
            let mut s = s.borrow_mut();
            let removed = s.buffer.trim_to_time(horizon);
            s.after_trim(removed)
        }))
    }

    fn trim_all_by_time(&self, horizon: Timestamp) -> usize {
        self.streams
            .values()
            .map(|slot| {
                slot.lock(|s| {
                    let mut s = s.borrow_mut();
                    let removed = s.buffer.trim_to_time(horizon);
                    s.after_trim(removed)
                })
            })
            .sum()
    }

    /// Force a teardown-and-flush. A failing stream's contents are counted
    /// as lost (plus the sample that could not be stored) instead of being
    /// written, together with `dropped` samples that never reached a buffer.
    fn tear_down(&self, failing: Option<&str>, dropped: u64) -> u64 {
        let held = failing
            .and_then(|name| self.streams.get(name))
            .map_or(0, |slot| {
                slot.lock(|s| {
                    let mut s = s.borrow_mut();
                    let held = s.buffer.len() as u64;
                    s.buffer.clear();
                    s.state = StreamState::Empty;
                    held + 1
                })
            });
        let lost = held + dropped;

        self.control.lock(|c| {
            let mut c = c.borrow_mut();
            c.lost_samples += lost;
            c.torn_down = true;
        });

        let flushed = self.flush();
        error!(
            "Sensor buffers torn down: {} samples lost, {} flushed",
            lost, flushed
        );
        lost
    }

    /// Put samples retained by a previous activation back into the buffers.
    ///
    /// Returns the number of samples restored. Streams this manager does not
    /// declare are dropped. Running out of memory tears the instance down;
    /// every retained sample that did not make it into a buffer is counted
    /// as lost.
    pub fn restore(&self, retained: RetainedStreams<V>) -> Result<usize, ManagerError> {
        let mut restored = 0;
        let mut streams = retained.streams.into_iter();
        while let Some((name, samples)) = streams.next() {
            let Some(slot) = self.streams.get(&name) else {
                warn!(
                    "Dropping {} retained samples of unknown stream {}",
                    samples.len(),
                    name
                );
                continue;
            };

            let count = samples.len();
            let appended: Result<(), (BufferError, usize)> = slot.lock(|s| {
                let mut s = s.borrow_mut();
                let mut samples = samples.into_iter();
                while let Some(sample) = samples.next() {
                    if let Err(e) = s.buffer.append(sample) {
                        return Err((e, samples.len()));
                    }
                }
                if count > 0 && !s.buffer.is_empty() {
                    s.state = StreamState::Buffered;
                }
                Ok(())
            });

            if let Err((e, unappended)) = appended {
                error!("{} while restoring stream {}", e, name);
                let later: usize = streams.map(|(_, rest)| rest.len()).sum();
                let lost = self.tear_down(Some(&name), (unappended + later) as u64);
                return Err(ManagerError::OutOfResources { stream: name, lost });
            }
            restored += count;
        }
        debug!("Restored {} retained samples", restored);
        Ok(restored)
    }

    /// Release the sensor instance.
    ///
    /// With no consumers left, everything buffered is flushed and `None` is
    /// returned. Otherwise the buffered samples are handed back for the next
    /// activation.
    pub fn deactivate(mut self) -> Option<RetainedStreams<V>> {
        self.deactivated = true;
        if self.hub.active_consumers() == 0 {
            let flushed = self.flush();
            info!("Deactivated with no consumers, flushed {} samples", flushed);
            return None;
        }

        let streams = self
            .streams
            .iter()
            .map(|(name, slot)| {
                let samples = slot.lock(|s| {
                    let mut s = s.borrow_mut();
                    s.state = StreamState::Empty;
                    s.buffer.drain_all()
                });
                (name.clone(), samples)
            })
            .collect();
        let retained = RetainedStreams { streams };
        info!(
            "Deactivated with consumers registered, retaining {} samples",
            retained.samples()
        );
        Some(retained)
    }

    fn slot(&self, stream: &str) -> Result<&BlockingMutex<M, RefCell<Slot<V>>>, ManagerError> {
        self.streams
            .get(stream)
            .ok_or_else(|| ManagerError::UnknownStream(stream.into()))
    }

    /// Number of distinct readings recorded
    pub fn reading_count(&self) -> u64 {
        self.control.lock(|c| c.borrow().readings.count())
    }

    pub fn last_flushed(&self) -> Option<Timestamp> {
        self.spillway.last_flushed()
    }

    /// Samples lost to resource exhaustion
    pub fn lost_samples(&self) -> u64 {
        self.control.lock(|c| c.borrow().lost_samples)
    }

    pub fn is_torn_down(&self) -> bool {
        self.control.lock(|c| c.borrow().torn_down)
    }

    pub fn pressure_state(&self) -> PressureState {
        self.monitor.lock(|m| m.borrow().state())
    }

    /// Whether any stream still holds samples in memory
    pub fn is_memory_empty(&self) -> bool {
        self.streams
            .values()
            .all(|slot| slot.lock(|s| s.borrow().buffer.is_empty()))
    }

    pub fn buffered_len(&self, stream: &str) -> Result<usize, ManagerError> {
        Ok(self.slot(stream)?.lock(|s| s.borrow().buffer.len()))
    }

    /// Samples buffered across every stream
    pub fn buffered_samples(&self) -> usize {
        self.streams
            .values()
            .map(|slot| slot.lock(|s| s.borrow().buffer.len()))
            .sum()
    }

    pub fn stream_state(&self, stream: &str) -> Result<StreamState, ManagerError> {
        Ok(self.slot(stream)?.lock(|s| s.borrow().state))
    }

    pub fn stream_names(&self) -> impl Iterator<Item = &str> {
        self.streams.keys().map(String::as_str)
    }

    /// One advertisement per stream, for the registration task
    pub fn advertisements(&self) -> Vec<StreamAdvertisement> {
        let sensor = self.spillway.sensor();
        self.streams.keys().map(|name| sensor.advertise(name)).collect()
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }
}

impl<M, V, G, P, H> SensorBufferManager<'_, M, V, G, P, H>
where
    M: RawMutex,
    V: Clone + FromStr,
    G: PersistenceGateway,
    P: MemoryProbe,
    H: ConsumerHub,
{
    /// Samples of `stream` with `timestamp` in `[now - span, now]`.
    ///
    /// Stored samples come first, then samples still waiting for the writer,
    /// then the buffered tail. A store that cannot be queried, or a value
    /// that cannot be parsed back, degrades the result rather than failing
    /// it. Running out of memory while copying the buffer tears the instance
    /// down and returns what was gathered so far.
    pub async fn query(
        &self,
        stream: &str,
        now: Timestamp,
        span: Timestamp,
    ) -> Result<Vec<TimestampedSample<V>>, ManagerError> {
        let slot = self.slot(stream)?;
        let start = now.saturating_sub(span);

        let seen = self
            .spillway
            .read_back(stream, start, now, || {
                slot.lock(|s| s.borrow().buffer.range_since(now, span))
            })
            .await;

        let mut merged = Vec::new();
        match seen.persisted {
            Some(Ok(records)) => {
                debug!("{} items retrieved from storage", records.len());
                merged.reserve(records.len());
                for record in &records {
                    match record.to_sample() {
                        Some(sample) => merged.push(sample),
                        None => warn!(
                            "Skipping unreadable value {:?} at {} on {}",
                            record.value, record.timestamp, stream
                        ),
                    }
                }
            }
            Some(Err(e)) => warn!(
                "Failed to query stored data for {}: {:?}, serving memory only",
                stream, e
            ),
            None => {}
        }
        merged.extend(seen.in_flight);

        match seen.memory {
            Ok(buffered) => merged.extend(buffered),
            Err(e) => {
                error!("{} while reading stream {}", e, stream);
                self.tear_down(None, 0);
            }
        }
        Ok(merged)
    }
}

impl<M, V, G, P, H> Drop for SensorBufferManager<'_, M, V, G, P, H>
where
    M: RawMutex,
    G: PersistenceGateway,
    P: MemoryProbe,
    H: ConsumerHub,
{
    fn drop(&mut self) {
        if self.deactivated || self.is_memory_empty() {
            return;
        }
        if self.hub.active_consumers() == 0 {
            self.flush();
        } else {
            warn!(
                "Dropping {} buffered samples without deactivation",
                self.buffered_samples()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PressureConfig, StorageMode};
    use crate::pressure::MemoryUsage;
    use crate::sensors::{DataType, SensorDescriptor};
    use crate::storage::MemoryStore;
    use alloc::string::ToString;
    use alloc::vec;
    use core::cell::Cell;
    use core::sync::atomic::{AtomicUsize, Ordering};
    use embassy_futures::block_on;
    use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

    type TestSpillway = Spillway<CriticalSectionRawMutex, i32, MemoryStore>;
    type TestManager<'a> =
        SensorBufferManager<'a, CriticalSectionRawMutex, i32, MemoryStore, &'a FakeHeap, &'a TestHub>;

    const CEILING: usize = 1000;
    const CALM: usize = 100;
    const HOT: usize = 500;

    struct FakeHeap {
        used: AtomicUsize,
    }

    impl FakeHeap {
        fn new() -> Self {
            Self {
                used: AtomicUsize::new(CALM),
            }
        }

        fn set(&self, used: usize) {
            self.used.store(used, Ordering::Relaxed);
        }
    }

    impl MemoryProbe for FakeHeap {
        fn usage(&self) -> MemoryUsage {
            MemoryUsage::new(self.used.load(Ordering::Relaxed), CEILING)
        }
    }

    #[derive(Debug, PartialEq, Eq)]
    enum Seen {
        One(String),
        All(String),
    }

    #[derive(Default)]
    struct TestHub {
        seen: RefCell<Vec<Seen>>,
        consumers: Cell<usize>,
    }

    impl ConsumerHub for TestHub {
        fn notify(&self, notification: Notification<'_>) {
            let seen = match notification {
                Notification::One(id) => Seen::One(id.to_string()),
                Notification::All(stream) => Seen::All(stream.to_string()),
            };
            self.seen.borrow_mut().push(seen);
        }

        fn active_consumers(&self) -> usize {
            self.consumers.get()
        }
    }

    fn spillway() -> TestSpillway {
        Spillway::new(
            SensorDescriptor::new("test_sensor", DataType::Integer),
            MemoryStore::new(),
        )
    }

    fn manager<'a>(
        spillway: &'a TestSpillway,
        heap: &'a FakeHeap,
        hub: &'a TestHub,
        config: BufferConfig,
    ) -> TestManager<'a> {
        SensorBufferManager::new(&["x", "y"], spillway, heap, hub, config)
    }

    fn timestamps(samples: &[TimestampedSample<i32>]) -> Vec<Timestamp> {
        samples.iter().map(|s| s.timestamp).collect()
    }

    fn record_all(manager: &TestManager<'_>, stream: &str, ts: &[Timestamp]) {
        for &t in ts {
            manager.record(stream, None, t, t as i32).unwrap();
        }
    }

    #[test]
    fn test_query_then_trim_scenario() {
        let (spillway, heap, hub) = (spillway(), FakeHeap::new(), TestHub::default());
        let manager = manager(&spillway, &heap, &hub, BufferConfig::default());

        record_all(&manager, "x", &[100, 200, 300]);
        let all = block_on(manager.query("x", 300, 300)).unwrap();
        assert_eq!(timestamps(&all), vec![100, 200, 300]);

        assert_eq!(manager.trim_by_time("x", 200), Ok(1));
        let trimmed = block_on(manager.query("x", 300, 300)).unwrap();
        assert_eq!(timestamps(&trimmed), vec![200, 300]);
    }

    #[test]
    fn test_query_merges_stored_and_buffered_without_gaps() {
        let (spillway, heap, hub) = (spillway(), FakeHeap::new(), TestHub::default());
        let manager = manager(&spillway, &heap, &hub, BufferConfig::default());

        record_all(&manager, "x", &[100, 200]);
        heap.set(HOT);
        record_all(&manager, "x", &[300]);
        assert!(manager.is_memory_empty());
        assert_eq!(manager.stream_state("x"), Ok(StreamState::Spilled));

        // Staged but not yet written: still visible
        let in_flight = block_on(manager.query("x", 300, 300)).unwrap();
        assert_eq!(timestamps(&in_flight), vec![100, 200, 300]);
        assert_eq!(manager.last_flushed(), None);

        assert_eq!(block_on(spillway.drain_pending()), 3);
        assert_eq!(manager.last_flushed(), Some(300));

        heap.set(CALM);
        record_all(&manager, "x", &[350, 400]);
        let merged = block_on(manager.query("x", 400, 400)).unwrap();
        assert_eq!(timestamps(&merged), vec![100, 200, 300, 350, 400]);
        assert_eq!(merged[0].value, 100);

        let recent = block_on(manager.query("x", 400, 50)).unwrap();
        assert_eq!(timestamps(&recent), vec![350, 400]);
    }

    #[test]
    fn test_sustained_pressure_spills_once() {
        let (spillway, heap, hub) = (spillway(), FakeHeap::new(), TestHub::default());
        let manager = manager(&spillway, &heap, &hub, BufferConfig::default());

        heap.set(HOT);
        record_all(&manager, "x", &[1, 2, 3, 4, 5]);

        assert_eq!(spillway.stats().batches_staged, 1);
        assert_eq!(spillway.pending_samples(), 1);
        assert_eq!(manager.buffered_len("x"), Ok(4));
        assert_eq!(manager.pressure_state(), PressureState::Pressure);
        assert_eq!(manager.check_pressure(), PressureAction::None);
    }

    #[test]
    fn test_discard_mode_clears_without_writing() {
        let (spillway, heap, hub) = (spillway(), FakeHeap::new(), TestHub::default());
        let config = BufferConfig {
            storage_mode: StorageMode::Discard,
            ..BufferConfig::default()
        };
        let manager = manager(&spillway, &heap, &hub, config);

        record_all(&manager, "x", &[100]);
        record_all(&manager, "y", &[100]);
        heap.set(HOT);
        assert_eq!(manager.check_pressure(), PressureAction::Cleared(2));

        assert!(manager.is_memory_empty());
        assert_eq!(manager.last_flushed(), None);
        assert_eq!(spillway.pending_batches(), 0);
        assert_eq!(block_on(spillway.drain_pending()), 0);
        assert_eq!(block_on(spillway.gateway()).append_calls(), 0);
    }

    #[test]
    fn test_out_of_resources_tears_down_and_flushes_healthy_streams() {
        let (spillway, heap, hub) = (spillway(), FakeHeap::new(), TestHub::default());
        let config = BufferConfig {
            reserve_limit: Some(2),
            ..BufferConfig::default()
        };
        let manager = manager(&spillway, &heap, &hub, config);

        record_all(&manager, "x", &[1, 2]);
        record_all(&manager, "y", &[1]);

        let err = manager.record("x", None, 3, 3).unwrap_err();
        assert_eq!(
            err,
            ManagerError::OutOfResources {
                stream: "x".into(),
                lost: 3,
            }
        );
        assert_eq!(manager.lost_samples(), 3);
        assert!(manager.is_torn_down());
        assert!(manager.is_memory_empty());
        assert_eq!(spillway.pending_samples(), 1);

        assert_eq!(manager.record("y", None, 4, 4), Err(ManagerError::TornDown));

        // Reads still work after teardown
        let y = block_on(manager.query("y", 10, 10)).unwrap();
        assert_eq!(timestamps(&y), vec![1]);
    }

    #[test]
    fn test_restore_counts_every_unrestored_sample_as_lost() {
        let (spillway, heap, hub) = (spillway(), FakeHeap::new(), TestHub::default());
        let config = BufferConfig {
            reserve_limit: Some(2),
            ..BufferConfig::default()
        };
        let manager = manager(&spillway, &heap, &hub, config);

        let mut retained = RetainedStreams::default();
        retained.streams.insert(
            "x".into(),
            (1..=5).map(|ts| TimestampedSample::new(ts as i32, ts)).collect(),
        );
        retained
            .streams
            .insert("y".into(), vec![TimestampedSample::new(7, 7)]);

        let err = manager.restore(retained).unwrap_err();
        assert_eq!(
            err,
            ManagerError::OutOfResources {
                stream: "x".into(),
                lost: 6,
            }
        );
        assert_eq!(manager.lost_samples(), 6);
        assert!(manager.is_torn_down());
        assert!(manager.is_memory_empty());
        assert_eq!(spillway.pending_samples(), 0);
    }

    #[test]
    fn test_query_out_of_resources_returns_partial_and_tears_down() {
        let (spillway, heap, hub) = (spillway(), FakeHeap::new(), TestHub::default());
        let config = BufferConfig {
            reserve_limit: Some(3),
            ..BufferConfig::default()
        };
        let manager = manager(&spillway, &heap, &hub, config);

        record_all(&manager, "x", &[100, 200]);
        manager.spill_all();
        block_on(spillway.drain_pending());
        record_all(&manager, "x", &[250]);
        manager.spill_all();

        // Two held samples cannot be copied under a ceiling of three
        record_all(&manager, "x", &[300, 400]);
        record_all(&manager, "y", &[300]);

        let partial = block_on(manager.query("x", 400, 400)).unwrap();
        assert_eq!(timestamps(&partial), vec![100, 200, 250]);
        assert!(manager.is_torn_down());
        assert_eq!(manager.lost_samples(), 0);
        assert!(manager.is_memory_empty());
        // In-flight 250 plus the flushed x and y buffers
        assert_eq!(spillway.pending_samples(), 4);
        assert_eq!(manager.stream_state("y"), Ok(StreamState::Spilled));
        assert_eq!(manager.record("y", None, 500, 5), Err(ManagerError::TornDown));
    }

    #[test]
    fn test_unreachable_store_degrades_to_memory() {
        let (spillway, heap, hub) = (spillway(), FakeHeap::new(), TestHub::default());
        let manager = manager(&spillway, &heap, &hub, BufferConfig::default());

        record_all(&manager, "x", &[100, 200]);
        manager.spill_all();
        block_on(spillway.drain_pending());
        record_all(&manager, "x", &[300]);

        block_on(spillway.gateway()).set_offline(true);
        let partial = block_on(manager.query("x", 300, 300)).unwrap();
        assert_eq!(timestamps(&partial), vec![300]);
        assert!(!manager.is_torn_down());
    }

    #[test]
    fn test_unparsable_stored_values_are_skipped() {
        let (spillway, heap, hub) = (spillway(), FakeHeap::new(), TestHub::default());
        let manager = manager(&spillway, &heap, &hub, BufferConfig::default());

        record_all(&manager, "x", &[100, 200]);
        manager.spill_all();
        block_on(spillway.drain_pending());

        let mut bad = block_on(spillway.gateway()).records()[0].clone();
        bad.value = "not a number".into();
        bad.timestamp = 150;
        block_on(async {
            spillway.gateway().await.append_batch("x", &[bad]).await
        })
        .unwrap();

        let result = block_on(manager.query("x", 200, 200)).unwrap();
        assert_eq!(timestamps(&result), vec![100, 200]);
    }

    #[test]
    fn test_notifications_target_id_or_stream() {
        let (spillway, heap, hub) = (spillway(), FakeHeap::new(), TestHub::default());
        let manager = manager(&spillway, &heap, &hub, BufferConfig::default());

        manager.record("x", Some("expr-1"), 1, 1).unwrap();
        manager.record("y", None, 1, 1).unwrap();

        assert_eq!(
            *hub.seen.borrow(),
            vec![Seen::One("expr-1".into()), Seen::All("y".into())]
        );
    }

    #[test]
    fn test_fan_out_counts_one_reading() {
        let (spillway, heap, hub) = (spillway(), FakeHeap::new(), TestHub::default());
        let manager = manager(&spillway, &heap, &hub, BufferConfig::default());

        manager.record("x", None, 10, 1).unwrap();
        manager.record("y", None, 10, 2).unwrap();
        manager.record("x", None, 20, 3).unwrap();
        assert_eq!(manager.reading_count(), 2);
    }

    #[test]
    fn test_unknown_stream_is_rejected() {
        let (spillway, heap, hub) = (spillway(), FakeHeap::new(), TestHub::default());
        let manager = manager(&spillway, &heap, &hub, BufferConfig::default());

        let err = ManagerError::UnknownStream("z".into());
        assert_eq!(manager.record("z", None, 1, 1), Err(err.clone()));
        assert_eq!(block_on(manager.query("z", 1, 1)), Err(err.clone()));
        assert_eq!(manager.trim_by_size("z", 1), Err(err));
        assert_eq!(manager.reading_count(), 0);
        assert!(hub.seen.borrow().is_empty());
    }

    #[test]
    fn test_record_trim_time_trims_every_stream() {
        let (spillway, heap, hub) = (spillway(), FakeHeap::new(), TestHub::default());
        let manager = manager(&spillway, &heap, &hub, BufferConfig::default());

        record_all(&manager, "x", &[100, 200, 300, 400]);
        record_all(&manager, "y", &[100, 450]);
        manager
            .record_trim_time("x", None, 500, 500, 100)
            .unwrap();

        let x = block_on(manager.query("x", 500, 500)).unwrap();
        let y = block_on(manager.query("y", 500, 500)).unwrap();
        assert_eq!(timestamps(&x), vec![400, 500]);
        assert_eq!(timestamps(&y), vec![450]);
        assert_eq!(manager.stream_state("y"), Ok(StreamState::Trimmed));
    }

    #[test]
    fn test_stream_state_transitions() {
        let (spillway, heap, hub) = (spillway(), FakeHeap::new(), TestHub::default());
        let manager = manager(&spillway, &heap, &hub, BufferConfig::default());

        assert_eq!(manager.stream_state("x"), Ok(StreamState::Empty));
        record_all(&manager, "x", &[1, 2]);
        assert_eq!(manager.stream_state("x"), Ok(StreamState::Buffered));

        assert_eq!(manager.trim_by_size("x", 1), Ok(1));
        assert_eq!(manager.stream_state("x"), Ok(StreamState::Trimmed));

        assert_eq!(manager.spill_all(), 1);
        assert_eq!(manager.stream_state("x"), Ok(StreamState::Spilled));
        assert_eq!(manager.stream_state("y"), Ok(StreamState::Empty));

        record_all(&manager, "x", &[3]);
        assert_eq!(manager.stream_state("x"), Ok(StreamState::Buffered));

        assert_eq!(manager.clear_all(), 1);
        assert_eq!(manager.stream_state("x"), Ok(StreamState::Empty));
    }

    #[test]
    fn test_check_cadence_follows_config() {
        let (spillway, heap, hub) = (spillway(), FakeHeap::new(), TestHub::default());
        let config = BufferConfig {
            check_every: 3,
            ..BufferConfig::default()
        };
        let manager = manager(&spillway, &heap, &hub, config);

        heap.set(HOT);
        record_all(&manager, "x", &[1, 2]);
        assert_eq!(manager.buffered_samples(), 2);

        record_all(&manager, "x", &[3]);
        assert_eq!(manager.buffered_samples(), 0);
        assert_eq!(spillway.pending_samples(), 3);
    }

    #[test]
    fn test_spill_marks_transmit_state_from_mode() {
        let (spillway, heap, hub) = (spillway(), FakeHeap::new(), TestHub::default());
        let config = BufferConfig {
            storage_mode: StorageMode::LocalOnly,
            ..BufferConfig::default()
        };
        let manager = manager(&spillway, &heap, &hub, config);

        record_all(&manager, "y", &[5]);
        manager.spill_all();
        block_on(spillway.drain_pending());

        let gateway = block_on(spillway.gateway());
        let record = &gateway.records()[0];
        assert_eq!(record.transmit, TransmitState::LocalOnly);
        assert_eq!(record.stream, "y");
        assert_eq!(record.sensor_name, "test_sensor");
        assert_eq!(record.value, "5");
    }

    #[test]
    fn test_deactivate_without_consumers_flushes() {
        let (spillway, heap, hub) = (spillway(), FakeHeap::new(), TestHub::default());
        let manager = manager(&spillway, &heap, &hub, BufferConfig::default());

        record_all(&manager, "x", &[1, 2]);
        record_all(&manager, "y", &[3]);
        assert!(manager.deactivate().is_none());
        assert_eq!(spillway.pending_samples(), 3);
    }

    #[test]
    fn test_deactivate_with_consumers_retains_for_next_activation() {
        let (spillway, heap, hub) = (spillway(), FakeHeap::new(), TestHub::default());
        hub.consumers.set(2);

        let first = manager(&spillway, &heap, &hub, BufferConfig::default());
        record_all(&first, "x", &[1, 2]);
        let retained = first.deactivate().unwrap();
        assert_eq!(retained.samples(), 2);
        assert_eq!(spillway.pending_samples(), 0);

        let second = manager(&spillway, &heap, &hub, BufferConfig::default());
        assert_eq!(second.restore(retained), Ok(2));
        let x = block_on(second.query("x", 2, 2)).unwrap();
        assert_eq!(timestamps(&x), vec![1, 2]);
        assert_eq!(second.stream_state("x"), Ok(StreamState::Buffered));
    }

    #[test]
    fn test_drop_without_consumers_flushes() {
        let (spillway, heap, hub) = (spillway(), FakeHeap::new(), TestHub::default());
        {
            let manager = manager(&spillway, &heap, &hub, BufferConfig::default());
            record_all(&manager, "x", &[1]);
        }
        assert_eq!(spillway.pending_samples(), 1);
    }

    #[test]
    fn test_managers_keep_independent_latches() {
        let (spill_a, spill_b) = (spillway(), spillway());
        let (hot, calm) = (FakeHeap::new(), FakeHeap::new());
        let hub = TestHub::default();
        hot.set(HOT);

        let a = manager(&spill_a, &hot, &hub, BufferConfig::default());
        let b = manager(&spill_b, &calm, &hub, BufferConfig::default());
        record_all(&a, "x", &[1]);
        record_all(&b, "x", &[1]);

        assert_eq!(a.pressure_state(), PressureState::Pressure);
        assert_eq!(b.pressure_state(), PressureState::Normal);
        assert!(a.is_memory_empty());
        assert_eq!(b.buffered_samples(), 1);
    }

    #[test]
    fn test_single_threshold_relatch_spills_again() {
        let (spillway, heap, hub) = (spillway(), FakeHeap::new(), TestHub::default());
        let config = BufferConfig {
            pressure: PressureConfig::without_dead_band(200),
            ..BufferConfig::default()
        };
        let manager = manager(&spillway, &heap, &hub, config);

        heap.set(201);
        record_all(&manager, "x", &[1]);
        heap.set(200);
        record_all(&manager, "x", &[2]);
        heap.set(201);
        record_all(&manager, "x", &[3]);

        assert_eq!(spillway.stats().batches_staged, 2);
        assert!(manager.is_memory_empty());
    }

    #[test]
    fn test_advertisements_cover_every_stream() {
        let (spillway, heap, hub) = (spillway(), FakeHeap::new(), TestHub::default());
        let manager = manager(&spillway, &heap, &hub, BufferConfig::default());

        let ads = manager.advertisements();
        let descriptions: Vec<&str> = ads.iter().map(|a| a.description.as_str()).collect();
        assert_eq!(descriptions, vec!["stream=x", "stream=y"]);
        assert!(ads.iter().all(|a| a.sensor_name == "test_sensor"));
        assert_eq!(manager.stream_names().count(), 2);
    }
}
