//! Core value types shared by the engine components
//!
//! Everything here is a plain value: formats negotiated with the audio
//! server, device descriptors produced by enumeration, stream roles and the
//! state enums reported by the backend.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Bytes per sample for the signed 16-bit little-endian stream format
pub const BYTES_PER_SAMPLE: usize = 2;

/// Sample rate and channel layout of a stream
///
/// Produced by negotiation with the audio server and consumed wherever a
/// resampling or buffer-sizing decision is made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AudioFormat {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of interleaved channels
    pub channels: u8,
}

impl AudioFormat {
    /// Create a new audio format
    pub const fn new(sample_rate: u32, channels: u8) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// 8kHz mono narrowband voice
    pub const fn narrowband_mono() -> Self {
        Self::new(8000, 1)
    }

    /// 16kHz mono wideband voice
    pub const fn wideband_mono() -> Self {
        Self::new(16000, 1)
    }

    /// 44.1kHz stereo
    pub const fn cd_stereo() -> Self {
        Self::new(44100, 2)
    }

    /// 48kHz stereo, the usual audio-server native format
    pub const fn studio_stereo() -> Self {
        Self::new(48000, 2)
    }

    /// Size in bytes of one interleaved frame (one sample per channel)
    pub fn frame_bytes(&self) -> usize {
        self.channels as usize * BYTES_PER_SAMPLE
    }

    /// Number of bytes covering `ms` milliseconds of audio
    pub fn bytes_for_ms(&self, ms: u32) -> usize {
        let frames = (self.sample_rate as u64 * ms as u64) / 1000;
        frames as usize * self.frame_bytes()
    }

    /// Number of whole frames contained in `bytes`
    pub fn frames_in(&self, bytes: usize) -> usize {
        let frame_bytes = self.frame_bytes();
        if frame_bytes == 0 {
            0
        } else {
            bytes / frame_bytes
        }
    }

    /// Whether the format is structurally usable at all
    pub fn is_valid(&self) -> bool {
        self.sample_rate > 0 && self.channels > 0
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::studio_stereo()
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}Hz/{}ch/s16le", self.sample_rate, self.channels)
    }
}

/// Device direction as seen by the audio server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Output endpoints (sinks)
    Playback,
    /// Input endpoints (sources)
    Capture,
}

impl Direction {
    /// Both directions, playback first
    pub const ALL: [Direction; 2] = [Direction::Playback, Direction::Capture];
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Playback => write!(f, "playback"),
            Direction::Capture => write!(f, "capture"),
        }
    }
}

/// One physical sink/source known to the audio server
///
/// Owned by the device registry for one enumeration epoch; snapshots are
/// rebuilt wholesale, never edited in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Server-side index of the device
    pub index: u32,
    /// Unique system name within its direction (e.g. `hw:0`)
    pub system_name: String,
    /// Human-readable name
    pub display_name: String,
    /// Native device format
    pub format: AudioFormat,
}

impl DeviceDescriptor {
    /// Create a new device descriptor
    pub fn new(
        index: u32,
        system_name: impl Into<String>,
        display_name: impl Into<String>,
        format: AudioFormat,
    ) -> Self {
        Self {
            index,
            system_name: system_name.into(),
            display_name: display_name.into(),
            format,
        }
    }
}

/// Logical stream role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamRole {
    /// Call audio to the speaker
    Playback,
    /// Microphone audio into the call
    Capture,
    /// Ringtone output, usually routed to a separate device
    Ringtone,
}

impl StreamRole {
    /// All roles in creation order
    pub const ALL: [StreamRole; 3] = [StreamRole::Playback, StreamRole::Capture, StreamRole::Ringtone];

    /// Device direction this role connects to
    pub fn direction(&self) -> Direction {
        match self {
            StreamRole::Playback | StreamRole::Ringtone => Direction::Playback,
            StreamRole::Capture => Direction::Capture,
        }
    }

    /// Roles that connect to the given direction
    pub fn for_direction(direction: Direction) -> &'static [StreamRole] {
        match direction {
            Direction::Playback => &[StreamRole::Playback, StreamRole::Ringtone],
            Direction::Capture => &[StreamRole::Capture],
        }
    }

    /// Short name used as the server-side stream name
    pub fn stream_name(&self) -> &'static str {
        match self {
            StreamRole::Playback => "playback",
            StreamRole::Capture => "capture",
            StreamRole::Ringtone => "ringtone",
        }
    }
}

impl fmt::Display for StreamRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.stream_name())
    }
}

/// Stream lifecycle state
///
/// `Unconnected → Creating → Ready → Terminated`, with `Failed` absorbing
/// from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamState {
    /// Allocated but not yet connected
    Unconnected,
    /// Connection requested, waiting for the server
    Creating,
    /// Connected; read/write permitted
    Ready,
    /// Torn down
    Terminated,
    /// Unrecoverable backend error
    Failed,
}

impl StreamState {
    /// Terminal states accept no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamState::Terminated | StreamState::Failed)
    }
}

/// State of the connection to the audio server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No connection object
    Unconnected,
    /// Handshake in progress
    Connecting,
    /// Authorizing with the server
    Authorizing,
    /// Setting the client name
    SettingName,
    /// Connection established
    Ready,
    /// Connection failed
    Failed,
    /// Connection closed
    Terminated,
}

impl ConnectionState {
    /// Ready, Failed or Terminated
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            ConnectionState::Ready | ConnectionState::Failed | ConnectionState::Terminated
        )
    }
}

/// Hot-plug notification kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HotplugKind {
    /// A device appeared
    Added,
    /// A device disappeared
    Removed,
    /// A device's properties changed
    Changed,
}

/// Per-callback source ordering used by the playback path
///
/// Not stored anywhere; declaration order is priority order, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MixPriority {
    /// DTMF and call-waiting signaling tones
    UrgentTone,
    /// Dial/ring tones and file playback
    SynthesizedTone,
    /// The application's own multi-party mix
    MixedVoice,
    /// Nothing available
    Silence,
}

/// Identifier of a pipeline channel (one participant's mix)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub u32);

impl ChannelId {
    /// The engine's own mix channel
    pub const DEFAULT: ChannelId = ChannelId(0);
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel-{}", self.0)
    }
}

/// Identifier of one backend stream object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId(pub Uuid);

impl StreamId {
    /// Allocate a fresh identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
