//! Stream handles
//!
//! A [`StreamHandle`] exclusively owns one backend stream object. The raw
//! object is private, so the only way to release it is [`StreamHandle::teardown`]
//! (also run from `Drop`), which always disconnects, then clears every
//! callback, then releases.
//!
//! Audio-ready callbacks receive a [`StreamIo`], the handle's zero-copy
//! accessors: `write_with` fills the server's buffer in place and `peek`
//! returns a [`CaptureFragment`] that drops itself exactly once.

use crate::backend::{AudioServer, RawStream, StreamParams};
use crate::config::LatencyConfig;
use crate::error::StreamError;
use crate::types::{AudioFormat, DeviceDescriptor, StreamId, StreamRole, StreamState};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, trace, warn};

/// State-change handler
pub type StateCallback = Box<dyn FnMut(StreamRole, StreamState) + Send>;

/// Data-ready handler
pub type AudioReadyCallback = Box<dyn FnMut(&mut StreamIo) + Send>;

/// Underflow/overflow/moved handler
pub type NotifyCallback = Box<dyn FnMut(StreamRole) + Send>;

#[derive(Default)]
struct StreamCallbacks {
    state: Option<StateCallback>,
    audio_ready: Option<AudioReadyCallback>,
    underflow: Option<NotifyCallback>,
    overflow: Option<NotifyCallback>,
    moved: Option<NotifyCallback>,
}

impl StreamCallbacks {
    fn clear(&mut self) {
        self.state = None;
        self.audio_ready = None;
        self.underflow = None;
        self.overflow = None;
        self.moved = None;
    }

    fn is_empty(&self) -> bool {
        self.state.is_none()
            && self.audio_ready.is_none()
            && self.underflow.is_none()
            && self.overflow.is_none()
            && self.moved.is_none()
    }
}

/// I/O view of a stream handed to audio-ready callbacks
pub struct StreamIo {
    role: StreamRole,
    format: AudioFormat,
    state: StreamState,
    raw: Option<Box<dyn RawStream>>,
}

impl StreamIo {
    /// Stream role
    pub fn role(&self) -> StreamRole {
        self.role
    }

    /// Negotiated format
    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Current state
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Whether read/write is permitted
    pub fn is_ready(&self) -> bool {
        self.state == StreamState::Ready && self.raw.is_some()
    }

    fn not_ready(&self, operation: &str) {
        warn!(
            "Ignoring {} on {} stream in state {:?}",
            operation, self.role, self.state
        );
    }

    /// Bytes the backend accepts now; 0 outside Ready, negative on backend error
    pub fn writable_size(&self) -> i64 {
        match self.raw.as_ref() {
            Some(raw) if self.state == StreamState::Ready => raw.writable_size(),
            _ => {
                self.not_ready("writable size query");
                0
            }
        }
    }

    /// Bytes available to read; 0 outside Ready, negative on backend error
    pub fn readable_size(&self) -> i64 {
        match self.raw.as_ref() {
            Some(raw) if self.state == StreamState::Ready => raw.readable_size(),
            _ => {
                self.not_ready("readable size query");
                0
            }
        }
    }

    /// Borrow up to `max_bytes` of the server's write buffer, let `fill`
    /// populate it, and commit what `fill` reports. Returns bytes committed,
    /// never more than `max_bytes`.
    pub fn write_with(&mut self, max_bytes: usize, fill: impl FnOnce(&mut [u8]) -> usize) -> usize {
        if !self.is_ready() {
            self.not_ready("write");
            return 0;
        }
        let role = self.role;
        let Some(raw) = self.raw.as_mut() else {
            return 0;
        };

        let filled = match raw.begin_write(max_bytes) {
            Ok(buffer) => {
                let capacity = buffer.len().min(max_bytes);
                fill(&mut buffer[..capacity]).min(capacity)
            }
            Err(e) => {
                error!("Failed to obtain {} write buffer: {}", role, e);
                return 0;
            }
        };

        match raw.commit_write(filled) {
            Ok(()) => filled,
            Err(e) => {
                error!("Failed to commit {} bytes to {} stream: {}", filled, role, e);
                0
            }
        }
    }

    /// Peek the next capture fragment.
    ///
    /// `Ok(None)` when nothing is available or the stream is not Ready. An
    /// error means nothing was peeked; the caller must not drop anything.
    pub fn peek(&mut self) -> Result<Option<CaptureFragment<'_>>, StreamError> {
        if !self.is_ready() {
            self.not_ready("peek");
            return Ok(None);
        }
        let Some(raw) = self.raw.as_mut() else {
            return Err(StreamError::Disconnected);
        };
        match raw.peek()? {
            Some(len) => Ok(Some(CaptureFragment { raw, len })),
            None => Ok(None),
        }
    }

    /// Discard queued backend data
    pub fn flush(&mut self) {
        if let Some(raw) = self.raw.as_mut() {
            raw.flush();
        }
    }
}

impl fmt::Debug for StreamIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamIo")
            .field("role", &self.role)
            .field("format", &self.format)
            .field("state", &self.state)
            .field("attached", &self.raw.is_some())
            .finish()
    }
}

/// A peeked capture fragment; dropped back to the backend when this guard goes away
pub struct CaptureFragment<'a> {
    raw: &'a mut Box<dyn RawStream>,
    len: usize,
}

impl CaptureFragment<'_> {
    /// Fragment bytes
    pub fn data(&self) -> &[u8] {
        let data = self.raw.fragment();
        &data[..self.len.min(data.len())]
    }

    /// Fragment length in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the fragment carries no bytes
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for CaptureFragment<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.raw.drop_fragment() {
            error!("Failed to drop capture fragment: {}", e);
        }
    }
}

/// One logical stream: playback, capture or ringtone
pub struct StreamHandle {
    id: StreamId,
    device: DeviceDescriptor,
    io: StreamIo,
    callbacks: StreamCallbacks,
    ready: AtomicBool,
}

impl StreamHandle {
    /// Allocate and connect a stream for `role` on `device`.
    ///
    /// The format is checked against the server before any allocation.
    pub fn create(
        role: StreamRole,
        format: AudioFormat,
        device: &DeviceDescriptor,
        server: &dyn AudioServer,
        latency: &LatencyConfig,
    ) -> Result<Self, StreamError> {
        if !format.is_valid() {
            return Err(StreamError::rejected(format!("invalid format {}", format)));
        }
        if !server.supports_format(role.direction(), &format) {
            return Err(StreamError::rejected(format!(
                "{} does not accept {} for {}",
                server.name(),
                format,
                role
            )));
        }

        let params = StreamParams {
            id: StreamId::new(),
            role,
            format,
            device: device.system_name.clone(),
            attributes: latency.attributes_for(role, &format),
        };
        debug!(
            "Creating {} stream on '{}' ({}) with {:?}",
            role, device.system_name, format, params.attributes
        );

        let mut raw = server.create_stream(&params)?;
        raw.connect()?;

        Ok(Self {
            id: params.id,
            device: device.clone(),
            io: StreamIo {
                role,
                format,
                state: StreamState::Creating,
                raw: Some(raw),
            },
            callbacks: StreamCallbacks::default(),
            ready: AtomicBool::new(false),
        })
    }

    /// Attach the state and data handlers, replacing any previous pair
    pub fn register_callbacks(&mut self, on_state_changed: StateCallback, on_audio_ready: AudioReadyCallback) {
        self.callbacks.state = Some(on_state_changed);
        self.callbacks.audio_ready = Some(on_audio_ready);
    }

    /// Attach underflow/overflow/moved handlers, replacing previous ones
    pub fn register_notifications(
        &mut self,
        on_underflow: NotifyCallback,
        on_overflow: NotifyCallback,
        on_moved: NotifyCallback,
    ) {
        self.callbacks.underflow = Some(on_underflow);
        self.callbacks.overflow = Some(on_overflow);
        self.callbacks.moved = Some(on_moved);
    }

    /// True iff the backend reports the stream Ready
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Backend stream identifier
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Stream role
    pub fn role(&self) -> StreamRole {
        self.io.role
    }

    /// Negotiated format
    pub fn format(&self) -> AudioFormat {
        self.io.format
    }

    /// Device the stream is connected to
    pub fn device(&self) -> &DeviceDescriptor {
        &self.device
    }

    /// Current state
    pub fn state(&self) -> StreamState {
        self.io.state
    }

    /// Whether any callback is still registered
    pub fn has_callbacks(&self) -> bool {
        !self.callbacks.is_empty()
    }

    /// Apply a backend state report
    pub fn handle_state(&mut self, state: StreamState) {
        let current = self.io.state;
        if current.is_terminal() {
            trace!("Ignoring {:?} for {} stream already {:?}", state, self.io.role, current);
            return;
        }
        if state == current || state == StreamState::Unconnected {
            return;
        }

        self.io.state = state;
        self.ready.store(state == StreamState::Ready, Ordering::Release);
        match state {
            StreamState::Ready => info!(
                "{} stream ready on '{}' ({})",
                self.io.role, self.device.system_name, self.io.format
            ),
            StreamState::Failed => error!("{} stream on '{}' failed", self.io.role, self.device.system_name),
            _ => debug!("{} stream state {:?} -> {:?}", self.io.role, current, state),
        }

        let role = self.io.role;
        if let Some(callback) = self.callbacks.state.as_mut() {
            callback(role, state);
        }
    }

    /// Deliver an audio-ready event to the data handler
    pub fn handle_audio_ready(&mut self) {
        let Self { io, callbacks, .. } = self;
        if let Some(callback) = callbacks.audio_ready.as_mut() {
            callback(io);
        }
    }

    /// Deliver an underflow notification
    pub fn handle_underflow(&mut self) {
        let role = self.io.role;
        if let Some(callback) = self.callbacks.underflow.as_mut() {
            callback(role);
        }
    }

    /// Deliver an overflow notification
    pub fn handle_overflow(&mut self) {
        let role = self.io.role;
        if let Some(callback) = self.callbacks.overflow.as_mut() {
            callback(role);
        }
    }

    /// Deliver a moved notification
    pub fn handle_moved(&mut self) {
        let role = self.io.role;
        if let Some(callback) = self.callbacks.moved.as_mut() {
            callback(role);
        }
    }

    /// Discard queued backend data
    pub fn flush(&mut self) {
        self.io.flush();
    }

    /// Disconnect, clear every callback, release the stream object.
    ///
    /// Safe on a handle in any state; the second call is a no-op.
    pub fn teardown(&mut self) {
        let Some(mut raw) = self.io.raw.take() else {
            return;
        };
        raw.disconnect();
        self.callbacks.clear();
        drop(raw);

        self.ready.store(false, Ordering::Release);
        if self.io.state != StreamState::Failed {
            self.io.state = StreamState::Terminated;
        }
        debug!("{} stream {} torn down", self.io.role, self.id);
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("id", &self.id)
            .field("device", &self.device.system_name)
            .field("io", &self.io)
            .field("ready", &self.is_ready())
            .finish()
    }
}
