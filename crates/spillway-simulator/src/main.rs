//! Desktop simulator for the spillway buffering engine.
//!
//! Drives a synthetic three-stream sensor through a [`SensorBufferManager`]
//! backed by an in-memory store. A synthetic heap grows with every buffered
//! sample, so memory-pressure spills happen on a regular cadence, and a
//! background writer thread drains them the way the firmware's writer task
//! would.
//!
//! # Environment
//!
//! | Variable                | Effect                                      |
//! |-------------------------|---------------------------------------------|
//! | `RUST_LOG`              | Log level (`info` is a good start)          |
//! | `SPILLWAY_STORAGE_MODE` | `Remote Storage`, `Local Storage` or `None` |

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use embassy_futures::block_on;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use log::{debug, info, warn};
use static_cell::StaticCell;

use spillway_core::pressure::FnProbe;
use spillway_core::sensors::DataType;
use spillway_core::storage::MemoryStore;
use spillway_core::{
    BufferConfig, ConsumerHub, MemoryUsage, Notification, SensorBufferManager, SensorDescriptor,
    Spillway, StorageMode, Timestamp,
};

// ---------------------------------------------------------------------------
// Simulation constants
// ---------------------------------------------------------------------------

/// Number of synthetic readings to produce
const TICKS: u32 = 600;

/// Simulated time between readings
const TICK_MS: Timestamp = 1_000;

/// Real time between readings, so the writer thread gets to run
const TICK_PAUSE: Duration = Duration::from_millis(2);

/// How often the writer thread looks for staged batches
const WRITER_PERIOD: Duration = Duration::from_millis(20);

/// Synthetic heap: fixed baseline plus a cost per buffered sample
const HEAP_CEILING: usize = 64 * 1024;
const HEAP_BASELINE: usize = 8 * 1024;
const SAMPLE_COST: usize = 64;

/// Log a merged query every this many ticks
const QUERY_EVERY: u32 = 100;

/// Window covered by the periodic query
const QUERY_SPAN_MS: Timestamp = 120 * TICK_MS;

const STREAMS: [&str; 3] = ["temperature", "humidity", "step"];

type SimSpillway = Spillway<CriticalSectionRawMutex, f32, MemoryStore>;

static SPILLWAY: StaticCell<SimSpillway> = StaticCell::new();
static HEAP_USED: AtomicUsize = AtomicUsize::new(HEAP_BASELINE);
static STOP_WRITER: AtomicBool = AtomicBool::new(false);

// ---------------------------------------------------------------------------
// Consumers
// ---------------------------------------------------------------------------

/// Stand-in for the host's consumer registry
struct LoggingHub {
    consumers: usize,
    notified: AtomicUsize,
}

impl ConsumerHub for LoggingHub {
    fn notify(&self, notification: Notification<'_>) {
        let count = self.notified.fetch_add(1, Ordering::Relaxed) + 1;
        if count % QUERY_EVERY as usize == 0 {
            debug!("notification #{}: {:?}", count, notification);
        }
    }

    fn active_consumers(&self) -> usize {
        self.consumers
    }
}

// ---------------------------------------------------------------------------
// Mock data generation
// ---------------------------------------------------------------------------

/// Generates synthetic readings that vary over time.
struct MockSensorGenerator {
    tick: u32,
}

impl MockSensorGenerator {
    fn new() -> Self {
        Self { tick: 0 }
    }

    /// Advance one tick and return the stream to feed and its value.
    fn next_reading(&mut self) -> (&'static str, f32) {
        self.tick += 1;
        let t = self.tick as f64;
        let stream = STREAMS[self.tick as usize % STREAMS.len()];

        let value = match stream {
            // 20–26 °C sinusoidal
            "temperature" => 23.0 + 3.0 * (t / 120.0).sin(),
            // 40–60 %
            "humidity" => 50.0 + 10.0 * (t / 180.0).sin(),
            // A step roughly every seventh reading
            _ => {
                if self.tick % 7 == 0 {
                    1.0
                } else {
                    0.0
                }
            }
        };
        (stream, value as f32)
    }
}

fn now_ms() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Timestamp
}

fn main() {
    env_logger::init();

    let storage_mode = std::env::var("SPILLWAY_STORAGE_MODE")
        .map(|value| StorageMode::from_setting(&value))
        .unwrap_or_default();
    let config = BufferConfig {
        storage_mode,
        ..BufferConfig::default()
    };
    info!("Starting simulator, storage option: {}", storage_mode.label());

    let sensor =
        SensorDescriptor::new("synthetic", DataType::Float).with_display_name("Synthetic Sensor");
    let spillway: &'static SimSpillway = SPILLWAY.init(Spillway::new(sensor, MemoryStore::new()));

    let writer = thread::spawn(move || {
        while !STOP_WRITER.load(Ordering::Relaxed) {
            let landed = block_on(spillway.drain_pending());
            if landed > 0 {
                info!("Writer stored {} samples", landed);
            }
            thread::sleep(WRITER_PERIOD);
        }
    });

    let probe = FnProbe(|| MemoryUsage::new(HEAP_USED.load(Ordering::Relaxed), HEAP_CEILING));
    let hub = LoggingHub {
        consumers: 0,
        notified: AtomicUsize::new(0),
    };
    let manager = SensorBufferManager::new(&STREAMS, spillway, probe, &hub, config);

    for advertisement in manager.advertisements() {
        info!(
            "Advertising {} ({}) {}",
            advertisement.display_name, advertisement.sensor_name, advertisement.description
        );
    }

    let mut generator = MockSensorGenerator::new();
    let start = now_ms();
    let mut now = start;

    for tick in 1..=TICKS {
        now = start + tick as Timestamp * TICK_MS;
        let (stream, value) = generator.next_reading();

        if let Err(e) = manager.record(stream, None, now, value) {
            warn!("Dropping reading: {}", e);
            break;
        }
        HEAP_USED.store(
            HEAP_BASELINE + manager.buffered_samples() * SAMPLE_COST,
            Ordering::Relaxed,
        );

        if tick % QUERY_EVERY == 0 {
            for stream in STREAMS {
                match block_on(manager.query(stream, now, QUERY_SPAN_MS)) {
                    Ok(samples) => info!(
                        "{}: {} samples in the last {}s, newest {}",
                        stream,
                        samples.len(),
                        QUERY_SPAN_MS / 1000,
                        samples
                            .last()
                            .map(|s| s.value)
                            .unwrap_or_default()
                    ),
                    Err(e) => warn!("Query of {} failed: {}", stream, e),
                }
            }
        }

        thread::sleep(TICK_PAUSE);
    }

    info!(
        "Recorded {} readings, {} still buffered, last flushed at {:?}",
        manager.reading_count(),
        manager.buffered_samples(),
        manager.last_flushed().map(|ts| ts - start)
    );

    if manager.deactivate().is_some() {
        warn!("Consumers still registered, buffered samples retained");
    }

    STOP_WRITER.store(true, Ordering::Relaxed);
    if writer.join().is_err() {
        warn!("Writer thread panicked");
    }
    let landed = block_on(spillway.drain_pending());

    let stats = spillway.stats();
    let stored = block_on(spillway.gateway()).len();
    info!(
        "Final drain stored {} samples; {} batches staged, {} written, {} records short, {} in store",
        landed, stats.batches_staged, stats.batches_written, stats.records_short, stored
    );
    info!("Simulated {}s", (now - start) / 1000);
}
