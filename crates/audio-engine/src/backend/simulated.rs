//! In-process audio server
//!
//! `SimulatedServer` behaves like a sound server without touching hardware:
//! connection progress, device enumeration and stream state are reported
//! through the event loop exactly like a real backend. Tests drive it
//! through the `tick_*`, `plug`/`unplug` and failure-injection methods and
//! inspect every stream through a [`SimStreamProbe`]. Released streams
//! stay inspectable until [`RELEASED_HISTORY`] newer ones have been released.

use super::{AudioServer, RawStream, ServerEvent, StreamParams};
use crate::error::{EngineError, StreamError};
use crate::event_loop::{EventLoop, LoopHandle};
use crate::types::{
    AudioFormat, ConnectionState, DeviceDescriptor, Direction, HotplugKind, StreamId, StreamRole,
    StreamState,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace};

/// Released stream probes kept for inspection
pub const RELEASED_HISTORY: usize = 16;

/// How the simulated handshake ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectBehavior {
    /// Reaches Ready
    #[default]
    Succeed,
    /// Reaches Failed
    Fail,
    /// Never settles
    Hang,
    /// `connect` itself returns an error
    Refuse,
}

#[derive(Default)]
struct SimState {
    events: Option<LoopHandle>,
    behavior: ConnectBehavior,
    playback_devices: Vec<DeviceDescriptor>,
    capture_devices: Vec<DeviceDescriptor>,
    rejected_formats: Vec<AudioFormat>,
    defer_enumeration: bool,
    pending_enumerations: Vec<(Direction, u64)>,
    hotplug_subscribed: bool,
    streams: Vec<SimStreamProbe>,
    connects: usize,
    disconnects: usize,
}

impl SimState {
    fn devices(&self, direction: Direction) -> &Vec<DeviceDescriptor> {
        match direction {
            Direction::Playback => &self.playback_devices,
            Direction::Capture => &self.capture_devices,
        }
    }

    fn devices_mut(&mut self, direction: Direction) -> &mut Vec<DeviceDescriptor> {
        match direction {
            Direction::Playback => &mut self.playback_devices,
            Direction::Capture => &mut self.capture_devices,
        }
    }

    fn prune_released(&mut self) {
        let released = self.streams.iter().filter(|s| s.is_released()).count();
        let mut excess = released.saturating_sub(RELEASED_HISTORY);
        if excess == 0 {
            return;
        }
        trace!("Forgetting {} released streams", excess);
        self.streams.retain(|s| {
            if excess > 0 && s.is_released() {
                excess -= 1;
                false
            } else {
                true
            }
        });
    }

    fn latest(&self, role: StreamRole) -> Option<SimStreamProbe> {
        self.streams.iter().rev().find(|s| s.role() == role).cloned()
    }

    fn report_devices(&self, events: &LoopHandle, direction: Direction, epoch: u64) {
        for device in self.devices(direction) {
            events.post(ServerEvent::Device {
                direction,
                epoch,
                device: device.clone(),
            });
        }
        events.post(ServerEvent::DeviceListEnd { direction, epoch });
    }
}

/// Hardware-free [`AudioServer`]; clones share the same server
#[derive(Clone, Default)]
pub struct SimulatedServer {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedServer {
    /// Server with no devices that accepts every connection
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device to a direction
    pub fn with_device(self, direction: Direction, device: DeviceDescriptor) -> Self {
        self.state.lock().devices_mut(direction).push(device);
        self
    }

    /// Set how the handshake ends
    pub fn with_connect_behavior(self, behavior: ConnectBehavior) -> Self {
        self.state.lock().behavior = behavior;
        self
    }

    /// Reject streams in `format`
    pub fn reject_format(self, format: AudioFormat) -> Self {
        self.state.lock().rejected_formats.push(format);
        self
    }

    /// Hold enumeration results until [`SimulatedServer::complete_enumerations`]
    pub fn with_deferred_enumeration(self) -> Self {
        self.state.lock().defer_enumeration = true;
        self
    }

    /// Change the handshake outcome for later connections
    pub fn set_connect_behavior(&self, behavior: ConnectBehavior) {
        self.state.lock().behavior = behavior;
    }

    /// Epochs of the held enumerations for `direction`, oldest first
    pub fn pending_enumerations(&self, direction: Direction) -> Vec<u64> {
        self.state
            .lock()
            .pending_enumerations
            .iter()
            .filter(|(d, _)| *d == direction)
            .map(|(_, epoch)| *epoch)
            .collect()
    }

    /// Report every held enumeration
    pub fn complete_enumerations(&self) {
        let mut state = self.state.lock();
        let pending = std::mem::take(&mut state.pending_enumerations);
        if let Some(events) = state.events.clone() {
            for (direction, epoch) in pending {
                state.report_devices(&events, direction, epoch);
            }
        }
    }

    /// Connect through a private event loop that discards every event, for
    /// driving stream handles without an engine. Keep the loop alive while
    /// the streams are in use.
    pub fn connect_standalone(&self) -> Result<EventLoop, EngineError> {
        let event_loop = EventLoop::spawn(self.name(), Arc::new(|_| {}))?;
        self.connect("standalone", event_loop.handle())?;
        Ok(event_loop)
    }

    /// Whether a connection object exists
    pub fn is_connected(&self) -> bool {
        self.state.lock().events.is_some()
    }

    /// Number of `connect` calls
    pub fn connect_count(&self) -> usize {
        self.state.lock().connects
    }

    /// Number of `disconnect` calls
    pub fn disconnect_count(&self) -> usize {
        self.state.lock().disconnects
    }

    /// Whether hot-plug notifications were requested
    pub fn hotplug_subscribed(&self) -> bool {
        self.state.lock().hotplug_subscribed
    }

    /// Most recently created stream for `role`
    pub fn stream(&self, role: StreamRole) -> Option<SimStreamProbe> {
        self.state.lock().latest(role)
    }

    /// Live and recently released streams for `role`, oldest first
    pub fn streams(&self, role: StreamRole) -> Vec<SimStreamProbe> {
        self.state
            .lock()
            .streams
            .iter()
            .filter(|s| s.role() == role)
            .cloned()
            .collect()
    }

    fn live_stream(&self, role: StreamRole) -> Option<(LoopHandle, SimStreamProbe)> {
        let state = self.state.lock();
        let events = state.events.clone()?;
        let probe = state.latest(role)?;
        probe.is_connected().then_some((events, probe))
    }

    /// Offer `writable_bytes` to the live `role` stream and deliver a
    /// write-ready event on the calling thread. `false` if no live stream.
    pub fn tick_playback(&self, role: StreamRole, writable_bytes: i64) -> bool {
        let Some((events, probe)) = self.live_stream(role) else {
            return false;
        };
        probe.set_writable(writable_bytes);
        events.dispatch(ServerEvent::WriteReady { stream: probe.id() });
        true
    }

    /// Queue a capture fragment and deliver a read-ready event on the calling thread
    pub fn tick_capture(&self, fragment: &[u8]) -> bool {
        let Some((events, probe)) = self.live_stream(StreamRole::Capture) else {
            return false;
        };
        probe.push_capture(fragment.to_vec());
        events.dispatch(ServerEvent::ReadReady { stream: probe.id() });
        true
    }

    /// Deliver an arbitrary event on the calling thread
    pub fn dispatch(&self, event: ServerEvent) -> bool {
        let events = self.state.lock().events.clone();
        match events {
            Some(events) => {
                events.dispatch(event);
                true
            }
            None => false,
        }
    }

    /// Queue an arbitrary event for the event loop
    pub fn post(&self, event: ServerEvent) -> bool {
        self.state
            .lock()
            .events
            .as_ref()
            .is_some_and(|events| events.post(event))
    }

    /// Add a device and announce it
    pub fn plug(&self, direction: Direction, device: DeviceDescriptor) {
        let mut state = self.state.lock();
        state.devices_mut(direction).push(device);
        if state.hotplug_subscribed {
            if let Some(events) = state.events.as_ref() {
                events.post(ServerEvent::Hotplug {
                    direction,
                    kind: HotplugKind::Added,
                });
            }
        }
    }

    /// Remove a device and announce it
    pub fn unplug(&self, direction: Direction, system_name: &str) {
        let mut state = self.state.lock();
        state.devices_mut(direction).retain(|d| d.system_name != system_name);
        if state.hotplug_subscribed {
            if let Some(events) = state.events.as_ref() {
                events.post(ServerEvent::Hotplug {
                    direction,
                    kind: HotplugKind::Removed,
                });
            }
        }
    }

    /// Report the connection as failed
    pub fn drop_connection(&self) -> bool {
        self.post(ServerEvent::ConnectionState(ConnectionState::Failed))
    }

    /// Report the live `role` stream as failed
    pub fn fail_stream(&self, role: StreamRole) -> bool {
        match self.stream(role) {
            Some(probe) => self.post(ServerEvent::StreamState {
                stream: probe.id(),
                state: StreamState::Failed,
            }),
            None => false,
        }
    }
}

impl AudioServer for SimulatedServer {
    fn name(&self) -> &str {
        "simulated"
    }

    fn connect(&self, application_name: &str, events: LoopHandle) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        state.connects += 1;
        if state.behavior == ConnectBehavior::Refuse {
            return Err(EngineError::connect_failed("connection refused"));
        }
        debug!("Simulated server connecting '{}'", application_name);

        for progress in [
            ConnectionState::Connecting,
            ConnectionState::Authorizing,
            ConnectionState::SettingName,
        ] {
            events.post(ServerEvent::ConnectionState(progress));
        }
        match state.behavior {
            ConnectBehavior::Succeed => {
                events.post(ServerEvent::ConnectionState(ConnectionState::Ready));
            }
            ConnectBehavior::Fail => {
                events.post(ServerEvent::ConnectionState(ConnectionState::Failed));
            }
            ConnectBehavior::Hang | ConnectBehavior::Refuse => {}
        }
        state.events = Some(events);
        Ok(())
    }

    fn subscribe_hotplug(&self) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        if state.events.is_none() {
            return Err(EngineError::transient("hot-plug subscription without connection"));
        }
        state.hotplug_subscribed = true;
        Ok(())
    }

    fn enumerate(&self, direction: Direction, epoch: u64) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        let Some(events) = state.events.clone() else {
            return Err(EngineError::transient("enumeration without connection"));
        };
        if state.defer_enumeration {
            state.pending_enumerations.push((direction, epoch));
        } else {
            state.report_devices(&events, direction, epoch);
        }
        Ok(())
    }

    fn supports_format(&self, _direction: Direction, format: &AudioFormat) -> bool {
        !self.state.lock().rejected_formats.contains(format)
    }

    fn create_stream(&self, params: &StreamParams) -> Result<Box<dyn RawStream>, StreamError> {
        let mut state = self.state.lock();
        let Some(events) = state.events.clone() else {
            return Err(StreamError::rejected("no connection"));
        };
        let probe = SimStreamProbe::new(params.clone());
        state.prune_released();
        state.streams.push(probe.clone());
        Ok(Box::new(SimulatedStream {
            probe,
            events: Some(events),
            write_buffer: Vec::new(),
            fragment: Vec::new(),
        }))
    }

    fn disconnect(&self) {
        let mut state = self.state.lock();
        state.disconnects += 1;
        state.hotplug_subscribed = false;
        state.pending_enumerations.clear();
        state.events = None;
    }
}

#[derive(Debug)]
struct SimStreamState {
    params: StreamParams,
    connected: bool,
    released: bool,
    lifecycle: Vec<&'static str>,
    writable: i64,
    written: Vec<u8>,
    commits: usize,
    readable_override: Option<i64>,
    capture: VecDeque<Vec<u8>>,
    null_peeks: usize,
    peeks: usize,
    drops: usize,
    flushes: usize,
}

/// Inspection and control handle for one simulated stream
#[derive(Debug, Clone)]
pub struct SimStreamProbe {
    id: StreamId,
    role: StreamRole,
    state: Arc<Mutex<SimStreamState>>,
}

impl SimStreamProbe {
    fn new(params: StreamParams) -> Self {
        Self {
            id: params.id,
            role: params.role,
            state: Arc::new(Mutex::new(SimStreamState {
                params,
                connected: false,
                released: false,
                lifecycle: Vec::new(),
                writable: 0,
                written: Vec::new(),
                commits: 0,
                readable_override: None,
                capture: VecDeque::new(),
                null_peeks: 0,
                peeks: 0,
                drops: 0,
                flushes: 0,
            })),
        }
    }

    /// Stream identifier
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Stream role
    pub fn role(&self) -> StreamRole {
        self.role
    }

    /// Creation parameters
    pub fn params(&self) -> StreamParams {
        self.state.lock().params.clone()
    }

    /// Connected and not yet disconnected
    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// Stream object released
    pub fn is_released(&self) -> bool {
        self.state.lock().released
    }

    /// `connect`, `disconnect` and `release` in the order they happened
    pub fn lifecycle(&self) -> Vec<&'static str> {
        self.state.lock().lifecycle.clone()
    }

    /// Every committed byte
    pub fn written(&self) -> Vec<u8> {
        self.state.lock().written.clone()
    }

    /// Take and clear the committed bytes
    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.lock().written)
    }

    /// Committed bytes decoded as samples
    pub fn written_samples(&self) -> Vec<i16> {
        self.state
            .lock()
            .written
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect()
    }

    /// Number of commits
    pub fn commit_count(&self) -> usize {
        self.state.lock().commits
    }

    /// Writable size reported to the engine
    pub fn set_writable(&self, bytes: i64) {
        self.state.lock().writable = bytes;
    }

    /// Override the readable size, `None` for the queued fragment length
    pub fn set_readable(&self, bytes: Option<i64>) {
        self.state.lock().readable_override = bytes;
    }

    /// Queue a capture fragment
    pub fn push_capture(&self, fragment: Vec<u8>) {
        self.state.lock().capture.push_back(fragment);
    }

    /// Make the next `count` peeks return a null fragment
    pub fn inject_null_peeks(&self, count: usize) {
        self.state.lock().null_peeks += count;
    }

    /// Successful peeks
    pub fn peek_count(&self) -> usize {
        self.state.lock().peeks
    }

    /// Fragment drops
    pub fn drop_count(&self) -> usize {
        self.state.lock().drops
    }

    /// Flush requests
    pub fn flush_count(&self) -> usize {
        self.state.lock().flushes
    }

    /// Fragments not yet peeked
    pub fn pending_capture(&self) -> usize {
        self.state.lock().capture.len()
    }
}

struct SimulatedStream {
    probe: SimStreamProbe,
    events: Option<LoopHandle>,
    write_buffer: Vec<u8>,
    fragment: Vec<u8>,
}

impl RawStream for SimulatedStream {
    fn id(&self) -> StreamId {
        self.probe.id
    }

    fn connect(&mut self) -> Result<(), StreamError> {
        {
            let mut state = self.probe.state.lock();
            state.connected = true;
            state.lifecycle.push("connect");
        }
        if let Some(events) = self.events.as_ref() {
            for state in [StreamState::Creating, StreamState::Ready] {
                events.post(ServerEvent::StreamState {
                    stream: self.probe.id,
                    state,
                });
            }
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        let mut state = self.probe.state.lock();
        state.connected = false;
        state.lifecycle.push("disconnect");
        self.events = None;
    }

    fn writable_size(&self) -> i64 {
        self.probe.state.lock().writable
    }

    fn begin_write(&mut self, max_bytes: usize) -> Result<&mut [u8], StreamError> {
        let writable = self.probe.state.lock().writable;
        let len = max_bytes.min(writable.max(0) as usize);
        self.write_buffer.clear();
        self.write_buffer.resize(len, 0);
        Ok(&mut self.write_buffer[..])
    }

    fn commit_write(&mut self, bytes: usize) -> Result<(), StreamError> {
        if bytes > self.write_buffer.len() {
            return Err(StreamError::transient(format!(
                "commit of {} bytes exceeds {} byte buffer",
                bytes,
                self.write_buffer.len()
            )));
        }
        let mut state = self.probe.state.lock();
        state.written.extend_from_slice(&self.write_buffer[..bytes]);
        state.writable -= bytes as i64;
        state.commits += 1;
        Ok(())
    }

    fn readable_size(&self) -> i64 {
        let state = self.probe.state.lock();
        state
            .readable_override
            .unwrap_or_else(|| state.capture.front().map_or(0, |f| f.len() as i64))
    }

    fn peek(&mut self) -> Result<Option<usize>, StreamError> {
        let mut state = self.probe.state.lock();
        if state.null_peeks > 0 {
            state.null_peeks -= 1;
            return Err(StreamError::transient("null capture fragment"));
        }
        match state.capture.pop_front() {
            Some(fragment) => {
                state.peeks += 1;
                self.fragment = fragment;
                Ok(Some(self.fragment.len()))
            }
            None => Ok(None),
        }
    }

    fn fragment(&self) -> &[u8] {
        &self.fragment
    }

    fn drop_fragment(&mut self) -> Result<(), StreamError> {
        self.probe.state.lock().drops += 1;
        self.fragment.clear();
        Ok(())
    }

    fn flush(&mut self) {
        let mut state = self.probe.state.lock();
        state.flushes += 1;
        state.capture.clear();
    }
}

impl Drop for SimulatedStream {
    fn drop(&mut self) {
        let mut state = self.probe.state.lock();
        state.connected = false;
        state.released = true;
        state.lifecycle.push("release");
    }
}
