//! Duplex mixer
//!
//! The mixer owns the per-tick data path between the audio server and the
//! application's pipeline. On each playback tick it fills exactly the
//! writable byte count from, in priority order:
//!
//! 1. the urgent buffer (an equal amount of main-pipeline audio is discarded
//!    to keep the two time-aligned),
//! 2. the active synthesized tone,
//! 3. the main pipeline, resampled when its rate differs from the stream's,
//! 4. silence.
//!
//! On each capture tick it peeks one fragment, downmixes it to mono, applies
//! mute/gain and DC removal, resamples to the pipeline rate and pushes it
//! into the main pipeline on the default channel.
//!
//! Gains and mute flags are atomics so control calls never block a tick.

use crate::config::EngineConfig;
use crate::dsp::{apply_gain, bytes_to_samples, downmix_to_mono, interleave_mono, samples_to_bytes, DcBlocker};
use crate::pipeline::{SampleRing, ToneSource};
use crate::resample::{create_resampler, Resampler};
use crate::stream::StreamIo;
use crate::types::{ChannelId, MixPriority, StreamRole};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// Upper bound for capture and playback gain
pub const MAX_GAIN: f64 = 4.0;

/// Builds a resampler for an (input, output) rate pair
pub type ResamplerFactory = Arc<dyn Fn(u32, u32) -> Box<dyn Resampler> + Send + Sync>;

/// Gain and mute controls shared with the control surface
#[derive(Debug)]
pub struct MixerControls {
    capture_gain: AtomicU64,
    playback_gain: AtomicU64,
    capture_muted: AtomicBool,
    playback_muted: AtomicBool,
    ringtone_muted: AtomicBool,
}

impl Default for MixerControls {
    fn default() -> Self {
        Self {
            capture_gain: AtomicU64::new(1.0f64.to_bits()),
            playback_gain: AtomicU64::new(1.0f64.to_bits()),
            capture_muted: AtomicBool::new(false),
            playback_muted: AtomicBool::new(false),
            ringtone_muted: AtomicBool::new(false),
        }
    }
}

impl MixerControls {
    fn store_gain(slot: &AtomicU64, gain: f64) -> f64 {
        if gain.is_nan() {
            warn!("Ignoring NaN gain");
            return f64::from_bits(slot.load(Ordering::Relaxed));
        }
        let gain = gain.clamp(0.0, MAX_GAIN);
        slot.store(gain.to_bits(), Ordering::Relaxed);
        gain
    }

    /// Set capture gain, clamped to `[0, MAX_GAIN]`; returns the stored value
    pub fn set_capture_gain(&self, gain: f64) -> f64 {
        Self::store_gain(&self.capture_gain, gain)
    }

    /// Set playback gain, clamped to `[0, MAX_GAIN]`; returns the stored value
    pub fn set_playback_gain(&self, gain: f64) -> f64 {
        Self::store_gain(&self.playback_gain, gain)
    }

    pub fn capture_gain(&self) -> f64 {
        f64::from_bits(self.capture_gain.load(Ordering::Relaxed))
    }

    pub fn playback_gain(&self) -> f64 {
        f64::from_bits(self.playback_gain.load(Ordering::Relaxed))
    }

    pub fn set_capture_muted(&self, muted: bool) {
        self.capture_muted.store(muted, Ordering::Relaxed);
    }

    pub fn set_playback_muted(&self, muted: bool) {
        self.playback_muted.store(muted, Ordering::Relaxed);
    }

    pub fn set_ringtone_muted(&self, muted: bool) {
        self.ringtone_muted.store(muted, Ordering::Relaxed);
    }

    pub fn capture_muted(&self) -> bool {
        self.capture_muted.load(Ordering::Relaxed)
    }

    pub fn playback_muted(&self) -> bool {
        self.playback_muted.load(Ordering::Relaxed)
    }

    pub fn ringtone_muted(&self) -> bool {
        self.ringtone_muted.load(Ordering::Relaxed)
    }

    fn effective_playback_gain(&self) -> f64 {
        if self.playback_muted() {
            0.0
        } else {
            self.playback_gain()
        }
    }
}

/// Running counters, updated from the audio thread
#[derive(Debug, Default)]
struct MixerStats {
    playback_ticks: AtomicU64,
    capture_ticks: AtomicU64,
    ringtone_ticks: AtomicU64,
    urgent_samples: AtomicU64,
    tone_samples: AtomicU64,
    main_samples: AtomicU64,
    silence_samples: AtomicU64,
    captured_samples: AtomicU64,
    urgent_discard_shortfall: AtomicU64,
    transient_errors: AtomicU64,
    underflows: AtomicU64,
    overflows: AtomicU64,
    moves: AtomicU64,
    led_ticks: [AtomicU64; 4],
}

fn bump(counter: &AtomicU64, by: usize) {
    counter.fetch_add(by as u64, Ordering::Relaxed);
}

/// Point-in-time copy of the mixer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MixerStatsSnapshot {
    /// Playback write callbacks handled
    pub playback_ticks: u64,
    /// Capture read callbacks handled
    pub capture_ticks: u64,
    /// Ringtone write callbacks handled
    pub ringtone_ticks: u64,
    /// Output frames taken from the urgent buffer
    pub urgent_samples: u64,
    /// Output frames synthesized by the tone source
    pub tone_samples: u64,
    /// Output frames taken from the main pipeline
    pub main_samples: u64,
    /// Output frames padded with silence
    pub silence_samples: u64,
    /// Samples pushed into the main pipeline from capture
    pub captured_samples: u64,
    /// Main-pipeline samples that could not be discarded to match urgent data
    pub urgent_discard_shortfall: u64,
    /// Negative size reports, null fragments and similar hiccups
    pub transient_errors: u64,
    /// Playback underflow notifications
    pub underflows: u64,
    /// Capture overflow notifications
    pub overflows: u64,
    /// Stream moved notifications
    pub moves: u64,
    /// Playback ticks by the highest-priority source that contributed
    pub led_ticks: [u64; 4],
}

impl MixerStatsSnapshot {
    /// Playback ticks whose leading source was `priority`
    pub fn ticks_led_by(&self, priority: MixPriority) -> u64 {
        self.led_ticks[priority as usize]
    }
}

impl MixerStats {
    fn snapshot(&self) -> MixerStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MixerStatsSnapshot {
            playback_ticks: load(&self.playback_ticks),
            capture_ticks: load(&self.capture_ticks),
            ringtone_ticks: load(&self.ringtone_ticks),
            urgent_samples: load(&self.urgent_samples),
            tone_samples: load(&self.tone_samples),
            main_samples: load(&self.main_samples),
            silence_samples: load(&self.silence_samples),
            captured_samples: load(&self.captured_samples),
            urgent_discard_shortfall: load(&self.urgent_discard_shortfall),
            transient_errors: load(&self.transient_errors),
            underflows: load(&self.underflows),
            overflows: load(&self.overflows),
            moves: load(&self.moves),
            led_ticks: std::array::from_fn(|i| load(&self.led_ticks[i])),
        }
    }
}

/// Resampler cached for one source; rebuilt when either rate changes.
///
/// Also carries the remainder of each tick's rate conversion so the sample
/// counts requested from and produced by the resampler follow the exact
/// ratio over time.
#[derive(Debug, Default)]
struct ResamplerSlot {
    resampler: Option<Box<dyn Resampler>>,
    rates: (u32, u32),
    carry: u64,
}

impl ResamplerSlot {
    fn get(&mut self, factory: &ResamplerFactory, input_rate: u32, output_rate: u32) -> &mut dyn Resampler {
        let stale = self
            .resampler
            .as_ref()
            .is_none_or(|r| r.input_rate() != input_rate || r.output_rate() != output_rate);
        if stale {
            debug!("Creating {} -> {} Hz resampler", input_rate, output_rate);
            self.resampler = None;
        }
        self.resampler
            .get_or_insert_with(|| factory(input_rate, output_rate))
            .as_mut()
    }

    /// Samples at `to_rate` covering `frames` samples at `from_rate`,
    /// including the remainder left over by previous ticks
    fn convert_frames(&mut self, frames: usize, from_rate: u32, to_rate: u32) -> usize {
        if self.rates != (from_rate, to_rate) {
            self.rates = (from_rate, to_rate);
            self.carry = 0;
        }
        let from = from_rate.max(1) as u64;
        let total = frames as u64 * to_rate as u64 + self.carry;
        self.carry = total % from;
        (total / from) as usize
    }
}

#[derive(Debug, Default)]
struct PlaybackPath {
    mono: Vec<i16>,
    source: Vec<i16>,
    interleaved: Vec<i16>,
    urgent: ResamplerSlot,
    tone: ResamplerSlot,
    main: ResamplerSlot,
}

#[derive(Debug, Default)]
struct RingtonePath {
    mono: Vec<i16>,
    source: Vec<i16>,
    interleaved: Vec<i16>,
    resampler: ResamplerSlot,
}

#[derive(Debug, Default)]
struct CapturePath {
    interleaved: Vec<i16>,
    mono: Vec<i16>,
    resampled: Vec<i16>,
    resampler: ResamplerSlot,
    dc: DcBlocker,
}

fn frames_at(frames: usize, from_rate: u32, to_rate: u32) -> usize {
    (frames as u64 * to_rate as u64 / from_rate.max(1) as u64) as usize
}

/// Fill `out` (at `out_rate`) from a source running at `source_rate`.
///
/// `read` receives a buffer sized in source samples and returns how many it
/// filled. Matching rates read straight into `out` and never touch the
/// resampler. Returns output samples produced.
fn pull_converted(
    out: &mut [i16],
    out_rate: u32,
    source_rate: u32,
    scratch: &mut Vec<i16>,
    slot: &mut ResamplerSlot,
    factory: &ResamplerFactory,
    read: impl FnOnce(&mut [i16]) -> usize,
) -> usize {
    if out.is_empty() {
        return 0;
    }
    if source_rate == out_rate || source_rate == 0 {
        return read(out).min(out.len());
    }

    let wanted = slot.convert_frames(out.len(), out_rate, source_rate);
    if wanted == 0 {
        // Less than one source sample is due; it stays in the carry.
        return 0;
    }
    scratch.resize(wanted, 0);
    let got = read(&mut scratch[..wanted]).min(wanted);
    if got == 0 {
        return 0;
    }
    let produced = if got == wanted {
        out.len()
    } else {
        frames_at(got, source_rate, out_rate).clamp(1, out.len())
    };
    slot.get(factory, source_rate, out_rate)
        .resample(&scratch[..got], &mut out[..produced])
}

/// Per-tick data path between the audio server and the pipeline
pub struct DuplexMixer {
    main: Arc<dyn SampleRing>,
    urgent: Arc<dyn SampleRing>,
    controls: MixerControls,
    stats: MixerStats,
    tone: Mutex<Option<Box<dyn ToneSource>>>,
    ringtone: Mutex<Option<Box<dyn ToneSource>>>,
    playback: Mutex<PlaybackPath>,
    ringtone_path: Mutex<RingtonePath>,
    capture: Mutex<CapturePath>,
    resampler_factory: ResamplerFactory,
    dc_removal: bool,
}

impl DuplexMixer {
    /// Mixer over the main pipeline and urgent buffer, configured from `config`
    pub fn new(main: Arc<dyn SampleRing>, urgent: Arc<dyn SampleRing>, config: &EngineConfig) -> Self {
        let kind = config.resampler;
        Self {
            main,
            urgent,
            controls: MixerControls::default(),
            stats: MixerStats::default(),
            tone: Mutex::new(None),
            ringtone: Mutex::new(None),
            playback: Mutex::new(PlaybackPath::default()),
            ringtone_path: Mutex::new(RingtonePath::default()),
            capture: Mutex::new(CapturePath::default()),
            resampler_factory: Arc::new(move |input, output| create_resampler(kind, input, output)),
            dc_removal: config.dc_removal,
        }
    }

    /// Replace the resampler factory
    pub fn with_resampler_factory(mut self, factory: ResamplerFactory) -> Self {
        self.resampler_factory = factory;
        self
    }

    /// Gain and mute controls
    pub fn controls(&self) -> &MixerControls {
        &self.controls
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> MixerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Main pipeline
    pub fn main(&self) -> &Arc<dyn SampleRing> {
        &self.main
    }

    /// Urgent buffer
    pub fn urgent(&self) -> &Arc<dyn SampleRing> {
        &self.urgent
    }

    /// Install or clear the playback tone; returns the previous one
    pub fn set_tone(&self, tone: Option<Box<dyn ToneSource>>) -> Option<Box<dyn ToneSource>> {
        std::mem::replace(&mut *self.tone.lock(), tone)
    }

    /// Whether a playback tone is active
    pub fn has_tone(&self) -> bool {
        self.tone.lock().is_some()
    }

    /// Install or clear the ringtone source; returns the previous one
    pub fn set_ringtone(&self, tone: Option<Box<dyn ToneSource>>) -> Option<Box<dyn ToneSource>> {
        std::mem::replace(&mut *self.ringtone.lock(), tone)
    }

    /// Whether a ringtone source is active
    pub fn has_ringtone(&self) -> bool {
        self.ringtone.lock().is_some()
    }

    /// Drop buffered pipeline audio and forget filter history
    pub fn flush(&self) {
        self.main.flush(ChannelId::DEFAULT);
        self.urgent.flush(ChannelId::DEFAULT);
        *self.playback.lock() = PlaybackPath::default();
        *self.ringtone_path.lock() = RingtonePath::default();
        *self.capture.lock() = CapturePath::default();
    }

    fn transient(&self) {
        bump(&self.stats.transient_errors, 1);
    }

    /// Whole frames the stream accepts now, `None` when there is nothing to do
    fn writable_frames(&self, io: &StreamIo) -> Option<usize> {
        let writable = io.writable_size();
        if writable < 0 {
            error!("{} stream reported writable size {}", io.role(), writable);
            self.transient();
            return None;
        }
        let frames = io.format().frames_in(writable as usize);
        (frames > 0).then_some(frames)
    }

    fn align_main_with_urgent(&self, consumed: usize, urgent_rate: u32) {
        if consumed == 0 {
            return;
        }
        let count = frames_at(consumed, urgent_rate, self.main.internal_sampling_rate());
        let discarded = self.main.discard(count, ChannelId::DEFAULT);
        if discarded < count {
            let shortfall = count - discarded;
            bump(&self.stats.urgent_discard_shortfall, shortfall);
            trace!(
                "Main pipeline short by {} samples while aligning with urgent data",
                shortfall
            );
        }
    }

    /// Playback write callback
    pub fn on_playback_ready(&self, io: &mut StreamIo) {
        bump(&self.stats.playback_ticks, 1);
        let Some(frames) = self.writable_frames(io) else {
            return;
        };
        let rate = io.format().sample_rate;
        let factory = &self.resampler_factory;
        let gain = self.controls.effective_playback_gain();

        let mut path = self.playback.lock();
        let PlaybackPath {
            mono,
            source,
            interleaved,
            urgent: urgent_slot,
            tone: tone_slot,
            main: main_slot,
        } = &mut *path;
        mono.clear();
        mono.resize(frames, 0);
        let mut filled = 0;
        let mut leader = MixPriority::Silence;

        let urgent_available = self.urgent.available_for_get(ChannelId::DEFAULT);
        if urgent_available > 0 {
            let urgent_rate = self.urgent.internal_sampling_rate();
            let mut consumed = 0;
            filled = pull_converted(mono, rate, urgent_rate, source, urgent_slot, factory, |buf| {
                let n = buf.len().min(urgent_available);
                consumed = self.urgent.get_data(&mut buf[..n], ChannelId::DEFAULT);
                consumed
            });
            self.align_main_with_urgent(consumed, urgent_rate);
            bump(&self.stats.urgent_samples, filled);
            if filled > 0 {
                leader = MixPriority::UrgentTone;
            }
        }
        let urgent_end = filled;

        if filled < frames {
            if let Some(tone) = self.tone.lock().as_mut() {
                let tone_rate = tone.sample_rate();
                let produced = pull_converted(&mut mono[filled..], rate, tone_rate, source, tone_slot, factory, |buf| {
                    tone.next_samples(buf, gain)
                });
                filled += produced;
                bump(&self.stats.tone_samples, produced);
                if produced > 0 {
                    leader = leader.min(MixPriority::SynthesizedTone);
                }
            }
        }
        let tone_end = filled;

        if filled < frames {
            let main_available = self.main.available_for_get(ChannelId::DEFAULT);
            if main_available > 0 {
                let main_rate = self.main.internal_sampling_rate();
                let produced = pull_converted(&mut mono[filled..], rate, main_rate, source, main_slot, factory, |buf| {
                    let n = buf.len().min(main_available);
                    self.main.get_data(&mut buf[..n], ChannelId::DEFAULT)
                });
                filled += produced;
                bump(&self.stats.main_samples, produced);
                if produced > 0 {
                    leader = leader.min(MixPriority::MixedVoice);
                }
            }
        }

        // Tone samples were generated at this gain already.
        apply_gain(&mut mono[..urgent_end], gain);
        apply_gain(&mut mono[tone_end..filled], gain);
        if filled < frames {
            mono[filled..].fill(0);
            bump(&self.stats.silence_samples, frames - filled);
        }

        bump(&self.stats.led_ticks[leader as usize], 1);
        trace!(
            "Playback tick: {} frames, led by {:?} ({} urgent, {} tone, {} main)",
            frames,
            leader,
            urgent_end,
            tone_end - urgent_end,
            filled - tone_end
        );
        self.write_frames(io, mono, interleaved);
    }

    /// Ringtone write callback
    pub fn on_ringtone_ready(&self, io: &mut StreamIo) {
        bump(&self.stats.ringtone_ticks, 1);
        let Some(frames) = self.writable_frames(io) else {
            return;
        };
        let rate = io.format().sample_rate;

        let mut path = self.ringtone_path.lock();
        let RingtonePath {
            mono,
            source,
            interleaved,
            resampler,
        } = &mut *path;
        mono.clear();
        mono.resize(frames, 0);

        if !self.controls.ringtone_muted() {
            if let Some(tone) = self.ringtone.lock().as_mut() {
                let tone_rate = tone.sample_rate();
                let gain = self.controls.playback_gain();
                let produced = pull_converted(mono, rate, tone_rate, source, resampler, &self.resampler_factory, |buf| {
                    tone.next_samples(buf, gain)
                });
                mono[produced..].fill(0);
            }
        }

        self.write_frames(io, mono, interleaved);
    }

    fn write_frames(&self, io: &mut StreamIo, mono: &[i16], interleaved: &mut Vec<i16>) {
        let format = io.format();
        let channels = format.channels as usize;
        interleaved.clear();
        interleaved.resize(mono.len() * channels, 0);
        interleave_mono(mono, channels, interleaved);

        let bytes = mono.len() * format.frame_bytes();
        let written = io.write_with(bytes, |buffer| samples_to_bytes(interleaved, buffer));
        if written < bytes {
            trace!("{} stream accepted {} of {} bytes", io.role(), written, bytes);
        }
    }

    /// Capture read callback
    pub fn on_capture_ready(&self, io: &mut StreamIo) {
        bump(&self.stats.capture_ticks, 1);
        let readable = io.readable_size();
        if readable < 0 {
            error!("Capture stream reported readable size {}", readable);
            self.transient();
            return;
        }
        if readable == 0 {
            return;
        }

        let format = io.format();
        let channels = format.channels as usize;
        let device_rate = format.sample_rate;

        let fragment = match io.peek() {
            Ok(Some(fragment)) => fragment,
            Ok(None) => return,
            Err(e) => {
                error!("Failed to peek capture fragment: {}", e);
                self.transient();
                return;
            }
        };

        let data = fragment.data();
        let usable = data.len().min(readable as usize);
        let frames = format.frames_in(usable);
        if frames == 0 {
            trace!(
                "Dropping {} capture bytes short of a {}-byte frame",
                usable,
                format.frame_bytes()
            );
            self.transient();
            return;
        }

        let mut path = self.capture.lock();
        let CapturePath {
            interleaved,
            mono,
            resampled,
            resampler,
            dc,
        } = &mut *path;
        interleaved.clear();
        interleaved.resize(frames * channels, 0);
        bytes_to_samples(&data[..frames * format.frame_bytes()], interleaved);
        drop(fragment);

        mono.clear();
        mono.resize(frames, 0);
        downmix_to_mono(interleaved, channels, mono);

        if self.controls.capture_muted() {
            mono.fill(0);
        } else {
            apply_gain(mono, self.controls.capture_gain());
        }
        if self.dc_removal {
            dc.process(mono);
        }

        let pipeline_rate = self.main.internal_sampling_rate();
        let out: &[i16] = if pipeline_rate == device_rate {
            &mono[..]
        } else {
            let count = resampler.convert_frames(frames, device_rate, pipeline_rate);
            resampled.clear();
            resampled.resize(count, 0);
            resampler
                .get(&self.resampler_factory, device_rate, pipeline_rate)
                .resample(mono, resampled);
            &resampled[..]
        };

        self.main.put_data(out, ChannelId::DEFAULT);
        bump(&self.stats.captured_samples, out.len());
    }

    pub fn note_underflow(&self, role: StreamRole) {
        bump(&self.stats.underflows, 1);
        debug!("{} stream underflow", role);
    }

    pub fn note_overflow(&self, role: StreamRole) {
        bump(&self.stats.overflows, 1);
        debug!("{} stream overflow", role);
    }

    pub fn note_moved(&self, role: StreamRole) {
        bump(&self.stats.moves, 1);
        debug!("{} stream moved to another device", role);
    }
}

impl fmt::Debug for DuplexMixer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DuplexMixer")
            .field("main_rate", &self.main.internal_sampling_rate())
            .field("urgent_rate", &self.urgent.internal_sampling_rate())
            .field("controls", &self.controls)
            .field("tone", &self.has_tone())
            .field("ringtone", &self.has_ringtone())
            .field("dc_removal", &self.dc_removal)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::simulated::{SimStreamProbe, SimulatedServer};
    use crate::config::LatencyConfig;
    use crate::event_loop::EventLoop;
    use crate::pipeline::MemoryRing;
    use crate::resample::LinearResampler;
    use crate::stream::StreamHandle;
    use crate::tone::ToneGenerator;
    use crate::types::{AudioFormat, DeviceDescriptor, StreamState};
    use std::sync::atomic::AtomicUsize;
    use tracing_test::traced_test;

    struct Fixture {
        server: SimulatedServer,
        _event_loop: EventLoop,
        main: Arc<MemoryRing>,
        urgent: Arc<MemoryRing>,
        mixer: Arc<DuplexMixer>,
        resamplers_built: Arc<AtomicUsize>,
    }

    impl Fixture {
        fn new(pipeline_rate: u32) -> Self {
            Self::with_config(pipeline_rate, EngineConfig::new().with_dc_removal(false))
        }

        fn with_config(pipeline_rate: u32, config: EngineConfig) -> Self {
            let server = SimulatedServer::new();
            let event_loop = server.connect_standalone().unwrap();
            let main = Arc::new(MemoryRing::with_rate(pipeline_rate));
            let urgent = Arc::new(MemoryRing::with_rate(pipeline_rate));
            let resamplers_built = Arc::new(AtomicUsize::new(0));
            let counter = resamplers_built.clone();
            let mixer = DuplexMixer::new(main.clone(), urgent.clone(), &config).with_resampler_factory(Arc::new(
                move |input, output| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Box::new(LinearResampler::new(input, output))
                },
            ));
            Self {
                server,
                _event_loop: event_loop,
                main,
                urgent,
                mixer: Arc::new(mixer),
                resamplers_built,
            }
        }

        fn open(&self, role: StreamRole, format: AudioFormat) -> (StreamHandle, SimStreamProbe) {
            let device = DeviceDescriptor::new(0, "dev0", "Device", format);
            let mut handle =
                StreamHandle::create(role, format, &device, &self.server, &LatencyConfig::default()).unwrap();
            let mixer = self.mixer.clone();
            handle.register_callbacks(
                Box::new(|_, _| {}),
                Box::new(move |io| match io.role() {
                    StreamRole::Playback => mixer.on_playback_ready(io),
                    StreamRole::Ringtone => mixer.on_ringtone_ready(io),
                    StreamRole::Capture => mixer.on_capture_ready(io),
                }),
            );
            handle.handle_state(StreamState::Ready);
            let probe = self.server.stream(role).unwrap();
            (handle, probe)
        }
    }

    fn le_bytes(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn test_urgent_then_main_fills_tick_exactly() {
        let fixture = Fixture::new(8000);
        let (mut handle, probe) = fixture.open(StreamRole::Playback, AudioFormat::narrowband_mono());
        fixture.urgent.put_data(&[7; 240], ChannelId::DEFAULT);
        let main: Vec<i16> = (0..1000).map(|i| i as i16).collect();
        fixture.main.put_data(&main, ChannelId::DEFAULT);

        probe.set_writable(960);
        handle.handle_audio_ready();

        let written = probe.written_samples();
        assert_eq!(written.len(), 480);
        assert!(written[..240].iter().all(|&s| s == 7));
        // The first 240 main samples were discarded for alignment.
        assert_eq!(&written[240..], &main[240..480]);
        assert_eq!(fixture.main.available_for_get(ChannelId::DEFAULT), 520);
        assert_eq!(fixture.urgent.available_for_get(ChannelId::DEFAULT), 0);
        assert_eq!(fixture.resamplers_built.load(Ordering::SeqCst), 0);
        assert_eq!(fixture.mixer.stats().ticks_led_by(MixPriority::UrgentTone), 1);
    }

    #[test]
    fn test_empty_sources_write_silence() {
        let fixture = Fixture::new(8000);
        let (mut handle, probe) = fixture.open(StreamRole::Playback, AudioFormat::new(8000, 2));
        probe.set_writable(640);
        handle.handle_audio_ready();

        assert_eq!(probe.written(), vec![0u8; 640]);
        let stats = fixture.mixer.stats();
        assert_eq!(stats.silence_samples, 160);
        assert_eq!(stats.ticks_led_by(MixPriority::Silence), 1);
    }

    #[test]
    fn test_tone_preempts_main() {
        let fixture = Fixture::new(8000);
        let (mut handle, probe) = fixture.open(StreamRole::Playback, AudioFormat::narrowband_mono());
        fixture.main.put_data(&[5; 160], ChannelId::DEFAULT);
        fixture
            .mixer
            .set_tone(Some(Box::new(ToneGenerator::new(8000, &[440.0]))));

        probe.set_writable(320);
        handle.handle_audio_ready();

        assert_eq!(probe.written().len(), 320);
        assert_eq!(fixture.main.available_for_get(ChannelId::DEFAULT), 160);
        let stats = fixture.mixer.stats();
        assert_eq!(stats.tone_samples, 160);
        assert_eq!(stats.ticks_led_by(MixPriority::SynthesizedTone), 1);
        assert_eq!(stats.ticks_led_by(MixPriority::MixedVoice), 0);
    }

    #[test]
    fn test_tone_is_generated_at_playback_gain() {
        let fixture = Fixture::new(8000);
        let (mut handle, probe) = fixture.open(StreamRole::Playback, AudioFormat::narrowband_mono());
        fixture.mixer.controls().set_playback_gain(0.5);
        fixture
            .mixer
            .set_tone(Some(Box::new(ToneGenerator::new(8000, &[440.0]))));

        probe.set_writable(320);
        handle.handle_audio_ready();

        let mut expected = [0i16; 160];
        ToneGenerator::new(8000, &[440.0]).next_samples(&mut expected, 0.5);
        assert_eq!(probe.written_samples(), expected.to_vec());
    }

    #[test]
    fn test_playback_reads_main_at_exact_rate_ratio() {
        let fixture = Fixture::new(16000);
        let (mut handle, probe) = fixture.open(StreamRole::Playback, AudioFormat::new(44100, 1));
        for _ in 0..1000 {
            fixture.main.put_data(&[100; 200], ChannelId::DEFAULT);
            probe.set_writable(1024);
            handle.handle_audio_ready();
        }

        // 1000 ticks of 512 frames at 44.1 kHz cover 185759.6 samples at 16 kHz.
        let consumed = 200_000 - fixture.main.available_for_get(ChannelId::DEFAULT);
        assert_eq!(consumed, 185_759);
        assert_eq!(fixture.mixer.stats().silence_samples, 0);
    }

    #[test]
    fn test_capture_pushes_at_exact_rate_ratio() {
        let fixture = Fixture::new(16000);
        let (mut handle, probe) = fixture.open(StreamRole::Capture, AudioFormat::new(44100, 1));
        let block = le_bytes(&[250; 512]);
        for _ in 0..10_000 {
            probe.push_capture(block.clone());
            handle.handle_audio_ready();
        }

        // 10000 fragments of 512 samples at 44.1 kHz carry 1857596.4 samples at 16 kHz.
        assert_eq!(fixture.mixer.stats().captured_samples, 1_857_596);
        assert_eq!(fixture.resamplers_built.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_short_main_is_padded_with_silence() {
        let fixture = Fixture::new(8000);
        let (mut handle, probe) = fixture.open(StreamRole::Playback, AudioFormat::narrowband_mono());
        fixture.main.put_data(&[9; 100], ChannelId::DEFAULT);

        probe.set_writable(320);
        handle.handle_audio_ready();

        let written = probe.written_samples();
        assert_eq!(written.len(), 160);
        assert!(written[..100].iter().all(|&s| s == 9));
        assert!(written[100..].iter().all(|&s| s == 0));
    }

    #[test]
    fn test_urgent_shortfall_is_recorded() {
        let fixture = Fixture::new(8000);
        let (mut handle, probe) = fixture.open(StreamRole::Playback, AudioFormat::narrowband_mono());
        fixture.urgent.put_data(&[1; 100], ChannelId::DEFAULT);
        fixture.main.put_data(&[2; 30], ChannelId::DEFAULT);

        probe.set_writable(200);
        handle.handle_audio_ready();

        assert_eq!(probe.written_samples(), vec![1; 100]);
        assert_eq!(fixture.mixer.stats().urgent_discard_shortfall, 70);
    }

    #[test]
    fn test_main_is_resampled_to_stream_rate() {
        let fixture = Fixture::new(8000);
        let (mut handle, probe) = fixture.open(StreamRole::Playback, AudioFormat::new(16000, 1));
        fixture.main.put_data(&[1000; 400], ChannelId::DEFAULT);

        probe.set_writable(640);
        handle.handle_audio_ready();
        probe.set_writable(640);
        handle.handle_audio_ready();

        assert_eq!(probe.written_samples().len(), 640);
        assert_eq!(fixture.main.available_for_get(ChannelId::DEFAULT), 80);
        assert_eq!(fixture.resamplers_built.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_gain_and_mute_apply_to_playback() {
        let fixture = Fixture::new(8000);
        let (mut handle, probe) = fixture.open(StreamRole::Playback, AudioFormat::narrowband_mono());
        assert_eq!(fixture.mixer.controls().set_playback_gain(9.0), MAX_GAIN);
        fixture.mixer.controls().set_playback_gain(0.5);
        fixture.main.put_data(&[1000; 4], ChannelId::DEFAULT);
        probe.set_writable(8);
        handle.handle_audio_ready();
        assert_eq!(probe.take_written(), le_bytes(&[500; 4]));

        fixture.mixer.controls().set_playback_muted(true);
        fixture.main.put_data(&[1000; 4], ChannelId::DEFAULT);
        probe.set_writable(8);
        handle.handle_audio_ready();
        assert_eq!(probe.written(), vec![0u8; 8]);
    }

    #[test]
    #[traced_test]
    fn test_negative_writable_size_writes_nothing() {
        let fixture = Fixture::new(8000);
        let (mut handle, probe) = fixture.open(StreamRole::Playback, AudioFormat::narrowband_mono());
        fixture.main.put_data(&[3; 160], ChannelId::DEFAULT);

        probe.set_writable(-1);
        handle.handle_audio_ready();

        assert_eq!(probe.commit_count(), 0);
        assert_eq!(fixture.main.available_for_get(ChannelId::DEFAULT), 160);
        assert_eq!(fixture.mixer.stats().transient_errors, 1);
        assert!(logs_contain("reported writable size -1"));
    }

    #[test]
    fn test_capture_downmixes_into_main_pipeline() {
        let fixture = Fixture::new(8000);
        let (mut handle, probe) = fixture.open(StreamRole::Capture, AudioFormat::new(8000, 2));
        probe.push_capture(le_bytes(&[100, 300, -200, -400]));
        handle.handle_audio_ready();

        assert_eq!(fixture.main.drain(ChannelId::DEFAULT), vec![200, -300]);
        assert_eq!((probe.peek_count(), probe.drop_count()), (1, 1));
    }

    #[test]
    fn test_capture_is_resampled_to_pipeline_rate() {
        let fixture = Fixture::new(8000);
        let (mut handle, probe) = fixture.open(StreamRole::Capture, AudioFormat::new(48000, 1));
        probe.push_capture(le_bytes(&[250; 960]));
        handle.handle_audio_ready();

        assert_eq!(fixture.main.available_for_get(ChannelId::DEFAULT), 160);
        assert_eq!(fixture.resamplers_built.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_muted_capture_pushes_silence() {
        let fixture = Fixture::new(8000);
        let (mut handle, probe) = fixture.open(StreamRole::Capture, AudioFormat::narrowband_mono());
        fixture.mixer.controls().set_capture_muted(true);
        probe.push_capture(le_bytes(&[1234; 80]));
        handle.handle_audio_ready();

        assert_eq!(fixture.main.drain(ChannelId::DEFAULT), vec![0; 80]);
    }

    #[test]
    #[traced_test]
    fn test_null_peek_is_not_dropped() {
        let fixture = Fixture::new(8000);
        let (mut handle, probe) = fixture.open(StreamRole::Capture, AudioFormat::narrowband_mono());
        probe.push_capture(le_bytes(&[1; 80]));
        probe.inject_null_peeks(1);

        handle.handle_audio_ready();
        assert_eq!((probe.peek_count(), probe.drop_count()), (0, 0));
        assert!(logs_contain("Failed to peek capture fragment"));

        handle.handle_audio_ready();
        assert_eq!((probe.peek_count(), probe.drop_count()), (1, 1));
        assert_eq!(fixture.main.available_for_get(ChannelId::DEFAULT), 80);
    }

    #[test]
    #[traced_test]
    fn test_partial_capture_frame_is_counted() {
        let fixture = Fixture::new(8000);
        let (mut handle, probe) = fixture.open(StreamRole::Capture, AudioFormat::new(8000, 2));
        probe.push_capture(vec![1, 0]);
        handle.handle_audio_ready();

        assert_eq!(fixture.main.available_for_get(ChannelId::DEFAULT), 0);
        assert_eq!(fixture.mixer.stats().transient_errors, 1);
        assert_eq!(probe.drop_count(), 1);
        assert!(logs_contain("short of a 4-byte frame"));
    }

    #[test]
    fn test_capture_never_reads_past_reported_size() {
        let fixture = Fixture::new(8000);
        let (mut handle, probe) = fixture.open(StreamRole::Capture, AudioFormat::narrowband_mono());
        probe.push_capture(le_bytes(&[4; 100]));
        probe.set_readable(Some(60));
        handle.handle_audio_ready();

        assert_eq!(fixture.main.available_for_get(ChannelId::DEFAULT), 30);
        assert_eq!(probe.drop_count(), 1);
    }

    #[test]
    fn test_dc_removal_settles_offset() {
        let fixture = Fixture::with_config(8000, EngineConfig::new());
        let (mut handle, probe) = fixture.open(StreamRole::Capture, AudioFormat::narrowband_mono());
        for _ in 0..20 {
            probe.push_capture(le_bytes(&[2000; 160]));
            handle.handle_audio_ready();
        }
        let captured = fixture.main.drain(ChannelId::DEFAULT);
        assert!(captured[0] > 1900);
        assert!(captured.last().copied().unwrap_or(i16::MAX).abs() < 100);
    }

    #[test]
    fn test_ringtone_plays_unless_muted() {
        let fixture = Fixture::new(8000);
        let (mut handle, probe) = fixture.open(StreamRole::Ringtone, AudioFormat::new(16000, 1));
        fixture
            .mixer
            .set_ringtone(Some(Box::new(ToneGenerator::new(8000, &[440.0, 480.0]))));

        probe.set_writable(640);
        handle.handle_audio_ready();
        assert!(probe.take_written().iter().any(|&b| b != 0));

        fixture.mixer.controls().set_ringtone_muted(true);
        probe.set_writable(640);
        handle.handle_audio_ready();
        assert_eq!(probe.written(), vec![0u8; 640]);
    }
}
