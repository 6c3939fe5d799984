extern crate alloc;
use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::error::BufferError;
use crate::sensors::{Timestamp, TimestampedSample};

/// Ordered in-memory history for one stream
///
/// Samples are appended at the tail and evicted from the head, so both ends
/// are backed by a [`VecDeque`]. There is no fixed capacity: the buffer is
/// bounded only by explicit size or time trims, or by draining it on spill.
///
/// Producers normally append non-decreasing timestamps, but nothing relies
/// on it. The buffer remembers whether an out-of-order append ever happened
/// and falls back to full scans while that is the case.
#[derive(Debug, Clone)]
pub struct SeriesBuffer<V> {
    samples: VecDeque<TimestampedSample<V>>,
    /// Reservation ceiling standing in for the heap when set
    reserve_limit: Option<usize>,
    ordered: bool,
}

impl<V> Default for SeriesBuffer<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> SeriesBuffer<V> {
    pub const fn new() -> Self {
        Self {
            samples: VecDeque::new(),
            reserve_limit: None,
            ordered: true,
        }
    }

    /// Create a buffer that reports [`BufferError::OutOfResources`] once it
    /// would hold more than `limit` samples, counting any copy being made by
    /// [`range_since`](Self::range_since).
    pub const fn with_reserve_limit(limit: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            reserve_limit: Some(limit),
            ordered: true,
        }
    }

    /// Append a sample at the tail
    pub fn append(&mut self, sample: TimestampedSample<V>) -> Result<(), BufferError> {
        let exhausted = BufferError::OutOfResources {
            stream_len: self.samples.len(),
        };
        if self
            .reserve_limit
            .is_some_and(|limit| self.samples.len() >= limit)
        {
            return Err(exhausted);
        }
        self.samples.try_reserve(1).map_err(|_| exhausted)?;

        if self
            .samples
            .back()
            .is_some_and(|last| sample.timestamp < last.timestamp)
        {
            self.ordered = false;
        }
        self.samples.push_back(sample);
        Ok(())
    }

    /// Evict the oldest samples until at most `max_len` remain.
    ///
    /// Returns the number of samples removed.
    pub fn trim_to_size(&mut self, max_len: usize) -> usize {
        let excess = self.samples.len().saturating_sub(max_len);
        self.samples.drain(..excess);
        self.reset_order_if_empty();
        excess
    }

    /// Evict every sample older than `horizon`.
    ///
    /// Returns the number of samples removed.
    pub fn trim_to_time(&mut self, horizon: Timestamp) -> usize {
        let before = self.samples.len();
        while self
            .samples
            .front()
            .is_some_and(|head| head.timestamp < horizon)
        {
            self.samples.pop_front();
        }
        if !self.ordered {
            // Stragglers behind a newer head
            self.samples.retain(|s| s.timestamp >= horizon);
        }
        self.reset_order_if_empty();
        before - self.samples.len()
    }

    /// Copy out the samples with `timestamp` in `[now - span, now]`, in
    /// insertion order. An empty window is not an error.
    ///
    /// The copy needs memory of its own: with a reservation limit set, the
    /// held samples plus the copy must fit under it.
    pub fn range_since(
        &self,
        now: Timestamp,
        span: Timestamp,
    ) -> Result<Vec<TimestampedSample<V>>, BufferError>
    where
        V: Clone,
    {
        let start = now.saturating_sub(span);
        let in_window = |s: &&TimestampedSample<V>| s.timestamp >= start && s.timestamp <= now;

        let (lo, hi) = if self.ordered {
            let lo = self.samples.partition_point(|s| s.timestamp < start);
            let hi = self.samples.partition_point(|s| s.timestamp <= now);
            (lo, hi.max(lo))
        } else {
            (0, self.samples.len())
        };
        let count = if self.ordered {
            hi - lo
        } else {
            self.samples.iter().filter(in_window).count()
        };

        let mut out = Vec::new();
        if count == 0 {
            return Ok(out);
        }
        let exhausted = BufferError::OutOfResources {
            stream_len: self.samples.len(),
        };
        if self
            .reserve_limit
            .is_some_and(|limit| self.samples.len() + count > limit)
        {
            return Err(exhausted);
        }
        out.try_reserve_exact(count).map_err(|_| exhausted)?;

        if self.ordered {
            out.extend(self.samples.range(lo..hi).cloned());
        } else {
            out.extend(self.samples.iter().filter(in_window).cloned());
        }
        Ok(out)
    }

    /// Take every sample out, leaving the buffer empty
    pub fn drain_all(&mut self) -> Vec<TimestampedSample<V>> {
        let drained = Vec::from(core::mem::take(&mut self.samples));
        self.ordered = true;
        drained
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.ordered = true;
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TimestampedSample<V>> {
        self.samples.iter()
    }

    pub fn first_timestamp(&self) -> Option<Timestamp> {
        self.samples.front().map(|s| s.timestamp)
    }

    pub fn last_timestamp(&self) -> Option<Timestamp> {
        self.samples.back().map(|s| s.timestamp)
    }

    /// Whether every append so far had a non-decreasing timestamp
    pub fn is_ordered(&self) -> bool {
        self.ordered
    }

    fn reset_order_if_empty(&mut self) {
        if self.samples.is_empty() {
            self.ordered = true;
        }
    }
}
