//! Audio server capability interface
//!
//! One [`AudioServer`] implementation exists per backend and is selected at
//! startup. The engine talks to it only through this trait:
//!
//! ```text
//! ┌─────────────────────┐  connect / enumerate   ┌─────────────────────┐
//! │   EngineContext     │───────────────────────▶│    AudioServer      │
//! │                     │  create_stream         │ (simulated / cpal)  │
//! │  StreamHandle ──────┼──── RawStream ◀────────┤                     │
//! └─────────────────────┘                        └─────────────────────┘
//!           ▲                                               │
//!           │        ServerEvent (state, devices,           │
//!           └──────── hot-plug, audio-ready) ◀── LoopHandle ┘
//! ```
//!
//! Backends report everything asynchronously through the [`LoopHandle`]
//! they receive in [`AudioServer::connect`]; the engine's event loop
//! delivers those events under the engine lock.

pub mod simulated;

#[cfg(feature = "device-cpal")]
pub mod cpal_impl;

use crate::error::{EngineError, StreamError};
use crate::event_loop::LoopHandle;
use crate::types::{
    AudioFormat, ConnectionState, DeviceDescriptor, Direction, HotplugKind, StreamId, StreamRole,
    StreamState,
};
use serde::{Deserialize, Serialize};

/// Byte-length buffering attributes handed to the server
///
/// `u32::MAX` leaves a field to the server's default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferAttributes {
    /// Maximum buffer length
    pub max_length: u32,
    /// Target buffer length (playback)
    pub target_length: u32,
    /// Pre-buffering before playback starts (playback)
    pub prebuffer: u32,
    /// Minimum request size (playback)
    pub min_request: u32,
    /// Fragment size (capture)
    pub fragment_size: u32,
}

/// Everything a backend needs to allocate and connect one stream
#[derive(Debug, Clone, PartialEq)]
pub struct StreamParams {
    /// Identifier echoed back in stream events
    pub id: StreamId,
    /// Logical role
    pub role: StreamRole,
    /// Negotiated format
    pub format: AudioFormat,
    /// Target device system name
    pub device: String,
    /// Buffering attributes
    pub attributes: BufferAttributes,
}

impl StreamParams {
    /// Output or input mode
    pub fn direction(&self) -> Direction {
        self.role.direction()
    }
}

/// Events a backend reports to the engine
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Connection state changed
    ConnectionState(ConnectionState),
    /// One device of an enumeration
    Device {
        direction: Direction,
        epoch: u64,
        device: DeviceDescriptor,
    },
    /// End of an enumeration
    DeviceListEnd { direction: Direction, epoch: u64 },
    /// Device added/removed/changed
    Hotplug { direction: Direction, kind: HotplugKind },
    /// Stream state changed
    StreamState { stream: StreamId, state: StreamState },
    /// Playback stream can accept data
    WriteReady { stream: StreamId },
    /// Capture stream has data
    ReadReady { stream: StreamId },
    /// Playback buffer ran dry
    Underflow { stream: StreamId },
    /// Capture buffer overran
    Overflow { stream: StreamId },
    /// Stream was moved to another device by the server
    Moved { stream: StreamId },
}

/// Backend stream object
///
/// Owned exclusively by a `StreamHandle`; dropping the box releases the
/// server-side object.
pub trait RawStream: Send {
    /// Identifier given at creation
    fn id(&self) -> StreamId;

    /// Connect in output or input mode; the outcome arrives as a state event
    fn connect(&mut self) -> Result<(), StreamError>;

    /// Disconnect from the server; no further events are produced
    fn disconnect(&mut self);

    /// Bytes that may be written now; negative on backend error
    fn writable_size(&self) -> i64;

    /// Borrow a server buffer of at most `max_bytes` for zero-copy writing
    fn begin_write(&mut self, max_bytes: usize) -> Result<&mut [u8], StreamError>;

    /// Commit `bytes` of the buffer obtained from `begin_write`
    fn commit_write(&mut self, bytes: usize) -> Result<(), StreamError>;

    /// Bytes available to read now; negative on backend error
    fn readable_size(&self) -> i64;

    /// Peek the next capture fragment without copying.
    ///
    /// `Ok(Some(len))` makes [`RawStream::fragment`] valid until
    /// [`RawStream::drop_fragment`]; `Ok(None)` means nothing to read; an
    /// `Err` means nothing was peeked and nothing must be dropped.
    fn peek(&mut self) -> Result<Option<usize>, StreamError>;

    /// Bytes of the fragment returned by the last successful `peek`
    fn fragment(&self) -> &[u8];

    /// Release the peeked fragment
    fn drop_fragment(&mut self) -> Result<(), StreamError>;

    /// Discard queued data
    fn flush(&mut self) {}
}

/// Capability interface implemented once per audio server backend
pub trait AudioServer: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Start the connect handshake; progress is reported as
    /// [`ServerEvent::ConnectionState`] through `events`
    fn connect(&self, application_name: &str, events: LoopHandle) -> Result<(), EngineError>;

    /// Ask for hot-plug notifications in both directions
    fn subscribe_hotplug(&self) -> Result<(), EngineError>;

    /// Start an asynchronous device query tagged with `epoch`
    fn enumerate(&self, direction: Direction, epoch: u64) -> Result<(), EngineError>;

    /// Whether the server can run a stream in `format`
    fn supports_format(&self, direction: Direction, format: &AudioFormat) -> bool;

    /// Allocate a stream object
    fn create_stream(&self, params: &StreamParams) -> Result<Box<dyn RawStream>, StreamError>;

    /// Disconnect and release the connection object
    fn disconnect(&self);
}
