//! # Audio-Engine: Duplex Audio I/O for VoIP Clients
//!
//! This library connects a VoIP client's audio pipeline to the platform audio
//! server. It owns the server connection, tracks input and output devices
//! across hot-plug, and runs three streams (playback, capture and ringtone)
//! whose callbacks move audio between the device and the client's sample
//! rings.
//!
//! ## Features
//!
//! - **Single engine lock**: all engine state and every stream callback run
//!   under one lock, so tearing a stream down guarantees no later callbacks
//! - **Device tracking**: epoch-tagged enumeration, preferred-device
//!   fallback and automatic stream re-creation on hot-plug
//! - **Prioritized mixing**: urgent samples, then tones, then the main voice
//!   channel, then silence, with per-direction gain and mute
//! - **Rate conversion**: linear or band-limited resampling between device
//!   and pipeline rates
//!
//! ## Usage
//!
//! ```rust
//! use rvoip_audio_engine::backend::simulated::SimulatedServer;
//! use rvoip_audio_engine::{
//!     AudioFormat, DeviceDescriptor, DevicePreferences, Direction, EngineConfig, EngineContext,
//!     MemoryRing,
//! };
//! use std::sync::Arc;
//!
//! let server = SimulatedServer::new()
//!     .with_device(Direction::Playback, DeviceDescriptor::new(0, "out", "Speakers", AudioFormat::wideband_mono()))
//!     .with_device(Direction::Capture, DeviceDescriptor::new(0, "in", "Microphone", AudioFormat::wideband_mono()));
//!
//! let engine = EngineContext::new(
//!     EngineConfig::default(),
//!     Arc::new(server),
//!     Arc::new(MemoryRing::new(16000, 16000)),
//!     Arc::new(MemoryRing::new(16000, 16000)),
//! );
//! engine.start(&DevicePreferences::default(), None)?;
//! assert!(engine.is_running());
//! engine.stop()?;
//! # Ok::<(), rvoip_audio_engine::EngineError>(())
//! ```
//!
//! ## Feature Flags
//!
//! - `format-conversion`: band-limited resampling via rubato (enabled by default)
//! - `device-cpal`: real devices through cpal
//! - `full`: everything above

pub mod backend;
pub mod config;
pub mod dsp;
pub mod engine;
pub mod error;
pub mod event_loop;
pub mod lock;
pub mod mixer;
pub mod pipeline;
pub mod registry;
pub mod resample;
pub mod stream;
pub mod tone;
pub mod types;

// Re-export commonly used types and traits
pub use backend::{AudioServer, BufferAttributes, RawStream, ServerEvent, StreamParams};
pub use config::{AudioPreferences, DevicePreferences, EngineConfig, LatencyConfig, ResamplerKind};
pub use engine::{EngineContext, EngineEvent};
pub use error::{EngineError, EngineResult, ErrorCategory, StreamError};
pub use event_loop::{EventLoop, LoopHandle};
pub use mixer::{DuplexMixer, MixerControls, MixerStatsSnapshot, MAX_GAIN};
pub use pipeline::{MemoryRing, SampleRing, ToneSource};
pub use registry::DeviceRegistry;
pub use resample::{create_resampler, LinearResampler, Resampler};
pub use stream::{StreamHandle, StreamIo};
pub use tone::{ToneGenerator, ToneKind};
pub use types::{
    AudioFormat, ChannelId, ConnectionState, DeviceDescriptor, Direction, HotplugKind, MixPriority,
    StreamId, StreamRole, StreamState,
};

#[cfg(feature = "device-cpal")]
pub use backend::cpal_impl::CpalServer;

/// Version information for the audio engine
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Audio server backends compiled into this build
pub const AVAILABLE_BACKENDS: &[&str] = &[
    "simulated",
    #[cfg(feature = "device-cpal")]
    "cpal",
];
