//! Sample rate conversion
//!
//! A [`Resampler`] keeps filter state across calls so consecutive ticks are
//! continuous; it is bound to one rate pair and must be recreated when either
//! side changes.

use crate::config::ResamplerKind;
use std::fmt;
use tracing::warn;

/// Stateful sample rate converter for mono `i16` audio
pub trait Resampler: Send + fmt::Debug {
    /// Convert `input` into exactly `output.len()` samples; returns samples written
    fn resample(&mut self, input: &[i16], output: &mut [i16]) -> usize;

    /// Input rate this instance was created for
    fn input_rate(&self) -> u32;

    /// Output rate this instance was created for
    fn output_rate(&self) -> u32;
}

/// Build a resampler for the given rate pair
pub fn create_resampler(kind: ResamplerKind, input_rate: u32, output_rate: u32) -> Box<dyn Resampler> {
    match kind {
        ResamplerKind::Linear => Box::new(LinearResampler::new(input_rate, output_rate)),
        #[cfg(feature = "format-conversion")]
        ResamplerKind::Sinc => match SincResampler::new(input_rate, output_rate) {
            Ok(resampler) => Box::new(resampler),
            Err(reason) => {
                warn!(
                    "Sinc resampler unavailable for {} -> {} Hz ({}), using linear",
                    input_rate, output_rate, reason
                );
                Box::new(LinearResampler::new(input_rate, output_rate))
            }
        },
        #[cfg(not(feature = "format-conversion"))]
        ResamplerKind::Sinc => {
            warn!("Sinc resampler requires the format-conversion feature, using linear");
            Box::new(LinearResampler::new(input_rate, output_rate))
        }
    }
}

/// Linear interpolation resampler
///
/// The input block is stretched over the requested output length, with the
/// last sample of the previous block as the interpolation origin so block
/// boundaries stay continuous.
#[derive(Debug, Clone)]
pub struct LinearResampler {
    input_rate: u32,
    output_rate: u32,
    previous: i16,
}

impl LinearResampler {
    /// Create a resampler for one rate pair
    pub fn new(input_rate: u32, output_rate: u32) -> Self {
        Self {
            input_rate,
            output_rate,
            previous: 0,
        }
    }

    /// Conversion ratio (output / input)
    pub fn ratio(&self) -> f64 {
        self.output_rate as f64 / self.input_rate.max(1) as f64
    }
}

impl Resampler for LinearResampler {
    fn resample(&mut self, input: &[i16], output: &mut [i16]) -> usize {
        if output.is_empty() {
            return 0;
        }
        if input.is_empty() {
            output.fill(self.previous);
            return output.len();
        }

        let step = input.len() as f64 / output.len() as f64;
        for (j, slot) in output.iter_mut().enumerate() {
            // Position 0 is the previous block's last sample, position k is input[k - 1].
            let position = (j + 1) as f64 * step;
            let index = position.floor() as usize;
            let fraction = position - index as f64;

            let left = if index == 0 { self.previous } else { input[(index - 1).min(input.len() - 1)] };
            let right = input[index.min(input.len() - 1)];
            let value = left as f64 + (right as f64 - left as f64) * fraction;
            *slot = value.round() as i16;
        }

        self.previous = input[input.len() - 1];
        output.len()
    }

    fn input_rate(&self) -> u32 {
        self.input_rate
    }

    fn output_rate(&self) -> u32 {
        self.output_rate
    }
}

#[cfg(feature = "format-conversion")]
pub use sinc::SincResampler;

#[cfg(feature = "format-conversion")]
mod sinc {
    use super::Resampler;
    use rubato::{FftFixedIn, Resampler as _};
    use std::collections::VecDeque;
    use std::fmt;
    use tracing::{trace, warn};

    /// Band-limited resampler backed by rubato's FFT resampler
    ///
    /// rubato consumes fixed input chunks, so input is queued until a chunk is
    /// complete and output is served from a FIFO. Until the first chunk has
    /// been processed the output holds the last produced sample. The FIFO
    /// keeps at most 200 ms; older samples are dropped when it overflows.
    pub struct SincResampler {
        inner: FftFixedIn<f32>,
        input_rate: u32,
        output_rate: u32,
        pending_in: Vec<f32>,
        pending_out: VecDeque<i16>,
        chunk: Vec<Vec<f32>>,
        max_pending: usize,
        last: i16,
    }

    impl SincResampler {
        /// Create a resampler processing 10 ms input chunks
        pub fn new(input_rate: u32, output_rate: u32) -> Result<Self, String> {
            let chunk_size = (input_rate as usize / 100).max(1);
            let inner = FftFixedIn::<f32>::new(input_rate as usize, output_rate as usize, chunk_size, 2, 1)
                .map_err(|e| e.to_string())?;
            Ok(Self {
                inner,
                input_rate,
                output_rate,
                pending_in: Vec::with_capacity(chunk_size * 2),
                pending_out: VecDeque::new(),
                chunk: vec![Vec::with_capacity(chunk_size)],
                max_pending: (output_rate as usize / 5).max(1),
                last: 0,
            })
        }
    }

    impl fmt::Debug for SincResampler {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("SincResampler")
                .field("input_rate", &self.input_rate)
                .field("output_rate", &self.output_rate)
                .field("pending_in", &self.pending_in.len())
                .field("pending_out", &self.pending_out.len())
                .finish()
        }
    }

    impl Resampler for SincResampler {
        fn resample(&mut self, input: &[i16], output: &mut [i16]) -> usize {
            self.pending_in
                .extend(input.iter().map(|&s| s as f32 / i16::MAX as f32));

            loop {
                let needed = self.inner.input_frames_next();
                if self.pending_in.len() < needed {
                    break;
                }
                self.chunk[0].clear();
                self.chunk[0].extend(self.pending_in.drain(..needed));
                match self.inner.process(&self.chunk, None) {
                    Ok(frames) => {
                        if let Some(channel) = frames.first() {
                            self.pending_out.extend(channel.iter().map(|&s| {
                                (s * i16::MAX as f32).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
                            }));
                        }
                    }
                    Err(e) => {
                        warn!("Resampler chunk dropped: {}", e);
                        break;
                    }
                }
            }

            if self.pending_out.len() > self.max_pending {
                let excess = self.pending_out.len() - self.max_pending;
                self.pending_out.drain(..excess);
                trace!(
                    "Resampler output backlog over {} samples, dropped {} oldest",
                    self.max_pending,
                    excess
                );
            }

            for slot in output.iter_mut() {
                if let Some(sample) = self.pending_out.pop_front() {
                    self.last = sample;
                }
                *slot = self.last;
            }
            output.len()
        }

        fn input_rate(&self) -> u32 {
            self.input_rate
        }

        fn output_rate(&self) -> u32 {
            self.output_rate
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_backlog_stays_bounded_at_exact_ratio() {
            let mut resampler = SincResampler::new(44100, 16000).unwrap();
            let input = vec![500i16; 512];
            let mut output = Vec::new();
            let mut carry = 0u64;
            for tick in 0..10_000 {
                let total = 512 * 16000 + carry;
                carry = total % 44100;
                output.resize((total / 44100) as usize, 0);
                resampler.resample(&input, &mut output);
                assert!(
                    resampler.pending_out.len() <= 2000,
                    "backlog {} at tick {}",
                    resampler.pending_out.len(),
                    tick
                );
            }
        }

        #[test]
        fn test_backlog_is_capped_when_output_stalls() {
            let mut resampler = SincResampler::new(16000, 8000).unwrap();
            let input = vec![100i16; 1600];
            for _ in 0..100 {
                resampler.resample(&input, &mut []);
            }
            assert_eq!(resampler.pending_out.len(), 1600);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_upsampling_fills_output() {
        let mut resampler = LinearResampler::new(8000, 16000);
        assert_eq!(resampler.ratio(), 2.0);

        let mut output = [0i16; 8];
        assert_eq!(resampler.resample(&[100, 200, 300, 400], &mut output), 8);
        assert_eq!(output, [50, 100, 150, 200, 250, 300, 350, 400]);
    }

    #[test]
    fn test_linear_downsampling() {
        let mut resampler = LinearResampler::new(16000, 8000);
        let mut output = [0i16; 4];
        resampler.resample(&[100, 150, 200, 250, 300, 350, 400, 450], &mut output);
        assert_eq!(output, [150, 250, 350, 450]);
    }

    #[test]
    fn test_linear_is_continuous_across_blocks() {
        let mut resampler = LinearResampler::new(8000, 16000);
        let mut first = [0i16; 4];
        resampler.resample(&[1000, 1000], &mut first);
        let mut second = [0i16; 4];
        resampler.resample(&[1000, 1000], &mut second);
        assert_eq!(second, [1000; 4]);
    }

    #[test]
    fn test_linear_empty_input_holds_last_value() {
        let mut resampler = LinearResampler::new(8000, 48000);
        let mut output = [0i16; 6];
        resampler.resample(&[10, 20], &mut output);
        resampler.resample(&[], &mut output);
        assert_eq!(output, [20; 6]);
    }

    #[test]
    fn test_factory_reports_rates() {
        let resampler = create_resampler(ResamplerKind::Linear, 16000, 48000);
        assert_eq!(resampler.input_rate(), 16000);
        assert_eq!(resampler.output_rate(), 48000);
    }

    #[cfg(feature = "format-conversion")]
    #[test]
    fn test_sinc_produces_requested_length() {
        let mut resampler = create_resampler(ResamplerKind::Sinc, 16000, 48000);
        let input = vec![1000i16; 320];
        let mut output = vec![0i16; 960];
        for _ in 0..5 {
            assert_eq!(resampler.resample(&input, &mut output), 960);
        }
        // Once the filter has settled a constant input stays near constant.
        let settled = output[480];
        assert!((settled as i32 - 1000).abs() < 100, "settled at {}", settled);
    }
}
