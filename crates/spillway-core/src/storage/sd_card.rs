use core::fmt::Debug;

extern crate alloc;
use alloc::vec::Vec;

use embedded_sdmmc::{BlockDevice, Mode, TimeSource, VolumeIdx, VolumeManager};
use log::{debug, warn};
use thiserror_no_std::Error;

use super::{PersistedRecord, PersistenceGateway};
use crate::sensors::Timestamp;

/// Every stream shares one file; FAT wants 8.3 names
const SAMPLES_FILE: &str = "SAMPLES.BIN";
const READ_CHUNK: usize = 512;

#[derive(Error, Debug)]
pub enum SdStoreError<E: Debug> {
    #[error("SD card error: {0:?}")]
    Volume(embedded_sdmmc::Error<E>),
    #[error("Failed to encode record: {0}")]
    Encode(postcard::Error),
}

impl<E: Debug> From<embedded_sdmmc::Error<E>> for SdStoreError<E> {
    fn from(e: embedded_sdmmc::Error<E>) -> Self {
        Self::Volume(e)
    }
}

/// [`PersistenceGateway`] backed by a FAT volume on an SD card
///
/// Records are appended to a single file as COBS-framed postcard messages,
/// so a torn write at the tail only costs the last frame.
///
/// The card operations themselves are blocking. They run on the writer task
/// and on the read path of queries, never on a producer's append.
pub struct SdCardStore<D, T>
where
    D: BlockDevice,
    T: TimeSource,
{
    volume_mgr: VolumeManager<D, T, 4, 4, 1>,
}

impl<D, T> SdCardStore<D, T>
where
    D: BlockDevice,
    T: TimeSource,
{
    pub fn new(device: D, ts: T) -> Self {
        Self {
            volume_mgr: VolumeManager::new(device, ts),
        }
    }

    fn write_frames(&self, frames: &[Vec<u8>]) -> Result<usize, SdStoreError<D::Error>> {
        let volume0 = self.volume_mgr.open_volume(VolumeIdx(0))?;
        let root_dir = volume0.open_root_dir()?;
        let file = root_dir.open_file_in_dir(SAMPLES_FILE, Mode::ReadWriteCreateOrAppend)?;

        let mut written = 0;
        for frame in frames {
            if let Err(e) = file.write(frame) {
                warn!("SD write stopped after {} records: {:?}", written, e);
                break;
            }
            written += 1;
        }

        file.close()?;
        root_dir.close()?;
        volume0.close()?;

        Ok(written)
    }

    fn read_all(&self) -> Result<Vec<u8>, SdStoreError<D::Error>> {
        let volume0 = self.volume_mgr.open_volume(VolumeIdx(0))?;
        let root_dir = volume0.open_root_dir()?;
        let file = match root_dir.open_file_in_dir(SAMPLES_FILE, Mode::ReadOnly) {
            Ok(file) => file,
            // Nothing spilled yet
            Err(embedded_sdmmc::Error::NotFound) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut bytes = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let read = file.read(&mut chunk)?;
            if read == 0 {
                break; // EOF
            }
            bytes.extend_from_slice(&chunk[..read]);
        }

        file.close()?;
        root_dir.close()?;
        volume0.close()?;

        Ok(bytes)
    }
}

impl<D, T> PersistenceGateway for SdCardStore<D, T>
where
    D: BlockDevice,
    T: TimeSource,
{
    type Error = SdStoreError<D::Error>;

    async fn append_batch(
        &mut self,
        stream: &str,
        records: &[PersistedRecord],
    ) -> Result<usize, Self::Error> {
        let frames = records
            .iter()
            .map(postcard::to_allocvec_cobs)
            .collect::<Result<Vec<_>, _>>()
            .map_err(SdStoreError::Encode)?;

        let written = self.write_frames(&frames)?;
        debug!("Appended {} records of {} to {}", written, stream, SAMPLES_FILE);
        Ok(written)
    }

    async fn query_range(
        &mut self,
        stream: &str,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<PersistedRecord>, Self::Error> {
        let mut bytes = self.read_all()?;
        Ok(decode_frames(&mut bytes, stream, start, end))
    }
}

/// Decode every COBS frame in `bytes`, keeping the records of `stream` in
/// `[start, end]` sorted by timestamp. Corrupt frames are skipped.
fn decode_frames(
    bytes: &mut [u8],
    stream: &str,
    start: Timestamp,
    end: Timestamp,
) -> Vec<PersistedRecord> {
    let mut found = Vec::new();
    let mut skipped = 0usize;
    for frame in bytes.split_mut(|&b| b == 0).filter(|f| !f.is_empty()) {
        match postcard::from_bytes_cobs::<PersistedRecord>(frame) {
            Ok(record) => {
                if record.stream == stream && record.timestamp >= start && record.timestamp <= end {
                    found.push(record);
                }
            }
            Err(_) => skipped += 1,
        }
    }
    if skipped > 0 {
        warn!("Skipped {} unreadable frames in {}", skipped, SAMPLES_FILE);
    }
    found.sort_by_key(|r| r.timestamp);
    found
}
