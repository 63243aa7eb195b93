//! Call-progress and DTMF tone generation
//!
//! [`ToneGenerator`] is a looping [`ToneSource`]: a sum of sine partials
//! gated by an on/off cadence. Presets follow the North American call
//! progress plan.

use crate::pipeline::ToneSource;
use std::f64::consts::TAU;

/// Peak amplitude of a full-scale tone, leaving headroom for summed partials
const TONE_AMPLITUDE: f64 = 0.4 * i16::MAX as f64;

/// Standard call-progress tones
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToneKind {
    /// Continuous 350 + 440 Hz
    Dial,
    /// 440 + 480 Hz, 2 s on / 4 s off
    Ringback,
    /// 480 + 620 Hz, 0.5 s on / 0.5 s off
    Busy,
    /// 440 Hz, 0.3 s on / 9.7 s off
    CallWaiting,
}

impl ToneKind {
    fn partials(&self) -> &'static [f64] {
        match self {
            ToneKind::Dial => &[350.0, 440.0],
            ToneKind::Ringback => &[440.0, 480.0],
            ToneKind::Busy => &[480.0, 620.0],
            ToneKind::CallWaiting => &[440.0],
        }
    }

    /// (on, off) cadence in milliseconds; `off == 0` means continuous
    fn cadence_ms(&self) -> (u32, u32) {
        match self {
            ToneKind::Dial => (1000, 0),
            ToneKind::Ringback => (2000, 4000),
            ToneKind::Busy => (500, 500),
            ToneKind::CallWaiting => (300, 9700),
        }
    }
}

/// DTMF row/column frequencies for a keypad digit
pub fn dtmf_frequencies(digit: char) -> Option<(f64, f64)> {
    let row = match digit.to_ascii_uppercase() {
        '1' | '2' | '3' | 'A' => 697.0,
        '4' | '5' | '6' | 'B' => 770.0,
        '7' | '8' | '9' | 'C' => 852.0,
        '*' | '0' | '#' | 'D' => 941.0,
        _ => return None,
    };
    let column = match digit.to_ascii_uppercase() {
        '1' | '4' | '7' | '*' => 1209.0,
        '2' | '5' | '8' | '0' => 1336.0,
        '3' | '6' | '9' | '#' => 1477.0,
        'A' | 'B' | 'C' | 'D' => 1633.0,
        _ => return None,
    };
    Some((row, column))
}

/// Looping multi-partial sine generator
#[derive(Debug, Clone)]
pub struct ToneGenerator {
    sample_rate: u32,
    frequencies: Vec<f64>,
    on_samples: u64,
    period_samples: u64,
    position: u64,
}

impl ToneGenerator {
    /// Continuous tone made of `frequencies`
    pub fn new(sample_rate: u32, frequencies: &[f64]) -> Self {
        Self::with_cadence(sample_rate, frequencies, 1000, 0)
    }

    /// Tone gated `on_ms` on / `off_ms` off, looping forever
    pub fn with_cadence(sample_rate: u32, frequencies: &[f64], on_ms: u32, off_ms: u32) -> Self {
        let on_samples = (sample_rate as u64 * on_ms as u64 / 1000).max(1);
        let off_samples = sample_rate as u64 * off_ms as u64 / 1000;
        Self {
            sample_rate,
            frequencies: frequencies.to_vec(),
            on_samples,
            period_samples: on_samples + off_samples,
            position: 0,
        }
    }

    /// Call-progress preset
    pub fn preset(kind: ToneKind, sample_rate: u32) -> Self {
        let (on, off) = kind.cadence_ms();
        Self::with_cadence(sample_rate, kind.partials(), on, off)
    }

    /// Continuous DTMF tone for `digit`
    pub fn dtmf(digit: char, sample_rate: u32) -> Option<Self> {
        dtmf_frequencies(digit).map(|(row, column)| Self::new(sample_rate, &[row, column]))
    }

    fn sample_at(&self, position: u64) -> f64 {
        if self.frequencies.is_empty() || position % self.period_samples >= self.on_samples {
            return 0.0;
        }
        let t = position as f64 / self.sample_rate as f64;
        let sum: f64 = self.frequencies.iter().map(|f| (TAU * f * t).sin()).sum();
        sum / self.frequencies.len() as f64 * TONE_AMPLITUDE
    }
}

impl ToneSource for ToneGenerator {
    fn next_samples(&mut self, out: &mut [i16], gain: f64) -> usize {
        for slot in out.iter_mut() {
            let value = self.sample_at(self.position) * gain;
            *slot = value.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16;
            self.position += 1;
        }
        out.len()
    }

    fn restart(&mut self) {
        self.position = 0;
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtmf_table() {
        assert_eq!(dtmf_frequencies('5'), Some((770.0, 1336.0)));
        assert_eq!(dtmf_frequencies('#'), Some((941.0, 1477.0)));
        assert_eq!(dtmf_frequencies('d'), Some((941.0, 1633.0)));
        assert_eq!(dtmf_frequencies('x'), None);
    }

    #[test]
    fn test_tone_fills_whole_buffer() {
        let mut tone = ToneGenerator::preset(ToneKind::Dial, 8000);
        let mut out = [0i16; 160];
        assert_eq!(tone.next_samples(&mut out, 1.0), 160);
        assert!(out.iter().any(|&s| s != 0));
        assert!(out.iter().all(|&s| (s as f64).abs() <= TONE_AMPLITUDE + 1.0));
    }

    #[test]
    fn test_cadence_gates_output() {
        // 10 ms on, 10 ms off at 8 kHz: samples 80..160 are silent.
        let mut tone = ToneGenerator::with_cadence(8000, &[440.0], 10, 10);
        let mut out = [0i16; 160];
        tone.next_samples(&mut out, 1.0);
        assert!(out[..80].iter().any(|&s| s != 0));
        assert!(out[80..].iter().all(|&s| s == 0));
    }

    #[test]
    fn test_restart_repeats_sequence() {
        let mut tone = ToneGenerator::dtmf('1', 8000).unwrap();
        let mut first = [0i16; 64];
        tone.next_samples(&mut first, 0.5);
        tone.restart();
        let mut second = [0i16; 64];
        tone.next_samples(&mut second, 0.5);
        assert_eq!(first, second);
    }
}
