//! Sample-level helpers used on the real-time path
//!
//! All functions work in place or into caller-provided buffers; nothing here
//! allocates.

use crate::types::BYTES_PER_SAMPLE;

/// Scale samples by `gain`, saturating at the i16 range
pub fn apply_gain(samples: &mut [i16], gain: f64) {
    if (gain - 1.0).abs() < f64::EPSILON {
        return;
    }
    if gain <= 0.0 {
        samples.fill(0);
        return;
    }
    for sample in samples.iter_mut() {
        let scaled = (*sample as f64 * gain).round();
        *sample = scaled.clamp(i16::MIN as f64, i16::MAX as f64) as i16;
    }
}

/// Spread mono samples across `channels` interleaved channels.
///
/// Writes `mono.len() * channels` samples into `out` (truncated to what fits)
/// and returns the number written.
pub fn interleave_mono(mono: &[i16], channels: usize, out: &mut [i16]) -> usize {
    if channels == 0 {
        return 0;
    }
    let frames = mono.len().min(out.len() / channels);
    for (frame, &sample) in out.chunks_exact_mut(channels).take(frames).zip(mono) {
        frame.fill(sample);
    }
    frames * channels
}

/// Average interleaved frames down to mono.
///
/// Returns the number of mono samples written to `out`.
pub fn downmix_to_mono(interleaved: &[i16], channels: usize, out: &mut [i16]) -> usize {
    if channels == 0 {
        return 0;
    }
    if channels == 1 {
        let n = interleaved.len().min(out.len());
        out[..n].copy_from_slice(&interleaved[..n]);
        return n;
    }
    let frames = (interleaved.len() / channels).min(out.len());
    for (slot, frame) in out.iter_mut().zip(interleaved.chunks_exact(channels)).take(frames) {
        let sum: i32 = frame.iter().map(|&s| s as i32).sum();
        *slot = (sum / channels as i32) as i16;
    }
    frames
}

/// Encode samples as signed 16-bit little-endian bytes.
///
/// Returns the number of bytes written.
pub fn samples_to_bytes(samples: &[i16], out: &mut [u8]) -> usize {
    let count = samples.len().min(out.len() / BYTES_PER_SAMPLE);
    for (chunk, sample) in out.chunks_exact_mut(BYTES_PER_SAMPLE).zip(&samples[..count]) {
        chunk.copy_from_slice(&sample.to_le_bytes());
    }
    count * BYTES_PER_SAMPLE
}

/// Decode signed 16-bit little-endian bytes; a trailing odd byte is ignored.
///
/// Returns the number of samples written.
pub fn bytes_to_samples(bytes: &[u8], out: &mut [i16]) -> usize {
    let count = (bytes.len() / BYTES_PER_SAMPLE).min(out.len());
    for (slot, chunk) in out.iter_mut().zip(bytes.chunks_exact(BYTES_PER_SAMPLE)).take(count) {
        *slot = i16::from_le_bytes([chunk[0], chunk[1]]);
    }
    count
}

/// Single-pole DC blocking filter: `y[n] = x[n] - x[n-1] + R * y[n-1]`
///
/// State is kept across calls so consecutive capture fragments are filtered
/// continuously.
#[derive(Debug, Clone)]
pub struct DcBlocker {
    pole: f64,
    previous_input: f64,
    previous_output: f64,
}

impl DcBlocker {
    /// Default pole, a corner around 40 Hz at 48 kHz
    pub const DEFAULT_POLE: f64 = 0.995;

    /// Create a blocker with the default pole
    pub fn new() -> Self {
        Self::with_pole(Self::DEFAULT_POLE)
    }

    /// Create a blocker with an explicit pole in `(0, 1)`
    pub fn with_pole(pole: f64) -> Self {
        Self {
            pole: pole.clamp(0.0, 0.9999),
            previous_input: 0.0,
            previous_output: 0.0,
        }
    }

    /// Filter samples in place
    pub fn process(&mut self, samples: &mut [i16]) {
        for sample in samples.iter_mut() {
            let input = *sample as f64;
            let output = input - self.previous_input + self.pole * self.previous_output;
            self.previous_input = input;
            self.previous_output = output;
            *sample = output.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16;
        }
    }

    /// Forget filter history
    pub fn reset(&mut self) {
        self.previous_input = 0.0;
        self.previous_output = 0.0;
    }
}

impl Default for DcBlocker {
    fn default() -> Self {
        Self::new()
    }
}
