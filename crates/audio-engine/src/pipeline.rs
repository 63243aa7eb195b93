//! Interfaces to the application's audio pipeline
//!
//! The engine only pulls and pushes fixed-size chunks of mono `i16` samples;
//! multi-party mixing lives behind [`SampleRing`]. [`MemoryRing`] is a
//! simple per-channel FIFO implementation used by tests and by hosts that
//! do not bring their own mixer.

use crate::types::ChannelId;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

/// Main pipeline / urgent buffer interface
///
/// Implementations must be internally thread-safe: the application pushes
/// from its own threads while the engine pulls from the audio worker.
pub trait SampleRing: Send + Sync {
    /// Samples ready to be read for `channel`
    fn available_for_get(&self, channel: ChannelId) -> usize;

    /// Read up to `out.len()` samples; returns the number written
    fn get_data(&self, out: &mut [i16], channel: ChannelId) -> usize;

    /// Append samples to `channel`
    fn put_data(&self, data: &[i16], channel: ChannelId);

    /// Drop up to `count` samples; returns the number actually dropped
    fn discard(&self, count: usize, channel: ChannelId) -> usize;

    /// Rate of the samples carried by this ring
    fn internal_sampling_rate(&self) -> u32;

    /// Drop everything buffered for `channel`
    fn flush(&self, channel: ChannelId) {
        let available = self.available_for_get(channel);
        self.discard(available, channel);
    }
}

/// Restartable, effectively infinite sample source (tones, looped files)
pub trait ToneSource: Send {
    /// Fill `out` with the next samples scaled by `gain`; returns samples written
    fn next_samples(&mut self, out: &mut [i16], gain: f64) -> usize;

    /// Rewind to the start of the sequence
    fn restart(&mut self) {}

    /// Rate of the generated samples
    fn sample_rate(&self) -> u32;
}

/// In-memory [`SampleRing`] with one FIFO per channel
#[derive(Debug)]
pub struct MemoryRing {
    sample_rate: u32,
    capacity: usize,
    channels: Mutex<HashMap<ChannelId, VecDeque<i16>>>,
}

impl MemoryRing {
    /// Create a ring at `sample_rate` holding at most `capacity` samples per channel
    pub fn new(sample_rate: u32, capacity: usize) -> Self {
        Self {
            sample_rate,
            capacity,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// One second of buffering at `sample_rate`
    pub fn with_rate(sample_rate: u32) -> Self {
        Self::new(sample_rate, sample_rate as usize)
    }

    /// Drain and return everything buffered for `channel`
    pub fn drain(&self, channel: ChannelId) -> Vec<i16> {
        let mut channels = self.channels.lock();
        channels
            .get_mut(&channel)
            .map(|queue| queue.drain(..).collect())
            .unwrap_or_default()
    }
}

impl SampleRing for MemoryRing {
    fn available_for_get(&self, channel: ChannelId) -> usize {
        self.channels.lock().get(&channel).map_or(0, |q| q.len())
    }

    fn get_data(&self, out: &mut [i16], channel: ChannelId) -> usize {
        let mut channels = self.channels.lock();
        let Some(queue) = channels.get_mut(&channel) else {
            return 0;
        };
        let count = out.len().min(queue.len());
        for (slot, sample) in out.iter_mut().zip(queue.drain(..count)) {
            *slot = sample;
        }
        count
    }

    fn put_data(&self, data: &[i16], channel: ChannelId) {
        let mut channels = self.channels.lock();
        let queue = channels.entry(channel).or_default();
        queue.extend(data.iter().copied());
        // Oldest samples go first when the consumer falls behind.
        if queue.len() > self.capacity {
            let excess = queue.len() - self.capacity;
            queue.drain(..excess);
        }
    }

    fn discard(&self, count: usize, channel: ChannelId) -> usize {
        let mut channels = self.channels.lock();
        let Some(queue) = channels.get_mut(&channel) else {
            return 0;
        };
        let count = count.min(queue.len());
        queue.drain(..count);
        count
    }

    fn internal_sampling_rate(&self) -> u32 {
        self.sample_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_roundtrip() {
        let ring = MemoryRing::with_rate(8000);
        ring.put_data(&[1, 2, 3, 4], ChannelId::DEFAULT);
        assert_eq!(ring.available_for_get(ChannelId::DEFAULT), 4);

        let mut out = [0i16; 3];
        assert_eq!(ring.get_data(&mut out, ChannelId::DEFAULT), 3);
        assert_eq!(out, [1, 2, 3]);
        assert_eq!(ring.available_for_get(ChannelId::DEFAULT), 1);
    }

    #[test]
    fn test_channels_are_independent() {
        let ring = MemoryRing::with_rate(8000);
        ring.put_data(&[1, 1], ChannelId(7));
        assert_eq!(ring.available_for_get(ChannelId::DEFAULT), 0);
        assert_eq!(ring.available_for_get(ChannelId(7)), 2);
    }

    #[test]
    fn test_discard_is_truncated_to_available() {
        let ring = MemoryRing::with_rate(8000);
        ring.put_data(&[1, 2, 3], ChannelId::DEFAULT);
        assert_eq!(ring.discard(10, ChannelId::DEFAULT), 3);
        assert_eq!(ring.discard(10, ChannelId(3)), 0);
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let ring = MemoryRing::new(8000, 4);
        ring.put_data(&[1, 2, 3, 4, 5, 6], ChannelId::DEFAULT);
        assert_eq!(ring.drain(ChannelId::DEFAULT), vec![3, 4, 5, 6]);
    }

    #[test]
    fn test_flush_empties_channel() {
        let ring = MemoryRing::with_rate(16000);
        ring.put_data(&[9; 32], ChannelId::DEFAULT);
        ring.flush(ChannelId::DEFAULT);
        assert_eq!(ring.available_for_get(ChannelId::DEFAULT), 0);
    }
}
