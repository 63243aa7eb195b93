//! Engine context
//!
//! [`EngineContext`] owns the connection to the audio server, the device
//! registry, the three stream handles and the event loop that delivers
//! backend events. All of that state lives behind one [`LoopLock`]; the
//! event-loop dispatcher takes the same lock before handling any event, so a
//! control call and a backend callback never interleave.
//!
//! # Lifecycle
//!
//! ```text
//! Stopped ──start()──▶ Starting ──connected + enumerated──▶ Running
//!    ▲                    │                                   │
//!    └──── stop() / connect failure / connection loss ◀───────┘
//! ```
//!
//! `start()` blocks on the lock's condition variable (never polls) until the
//! connection settles and both device enumerations finish, bounded by a
//! deadline. On connection failure everything created so far is torn down
//! and the event loop is released after the lock is dropped.
//!
//! ```rust
//! use rvoip_audio_engine::{
//!     backend::simulated::SimulatedServer, AudioFormat, DeviceDescriptor, DevicePreferences,
//!     Direction, EngineConfig, EngineContext, MemoryRing,
//! };
//! use std::sync::Arc;
//!
//! let server = SimulatedServer::new()
//!     .with_device(Direction::Playback, DeviceDescriptor::new(0, "sink0", "Speakers", AudioFormat::wideband_mono()))
//!     .with_device(Direction::Capture, DeviceDescriptor::new(0, "source0", "Microphone", AudioFormat::wideband_mono()));
//!
//! let engine = EngineContext::new(
//!     EngineConfig::new(),
//!     Arc::new(server),
//!     Arc::new(MemoryRing::with_rate(16000)),
//!     Arc::new(MemoryRing::with_rate(16000)),
//! );
//! engine.start(&DevicePreferences::default(), None).unwrap();
//! assert!(engine.is_running());
//! engine.stop().unwrap();
//! ```

use crate::backend::{AudioServer, ServerEvent};
use crate::config::{AudioPreferences, EngineConfig};
use crate::error::{EngineError, EngineResult};
use crate::event_loop::{EventDispatcher, EventLoop};
use crate::lock::{LoopLock, ScopedLoopLock};
use crate::mixer::{DuplexMixer, MixerStatsSnapshot};
use crate::pipeline::{SampleRing, ToneSource};
use crate::registry::DeviceRegistry;
use crate::stream::{AudioReadyCallback, StreamHandle, StreamIo};
use crate::types::{
    AudioFormat, ConnectionState, DeviceDescriptor, Direction, StreamId, StreamRole, StreamState,
};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Notifications published to engine subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Audio server connection state changed
    ConnectionChanged(ConnectionState),
    /// A device snapshot was published
    DevicesChanged { direction: Direction, count: usize },
    /// A stream changed state
    StreamStateChanged { role: StreamRole, state: StreamState },
    /// A stream was (re)created on a device
    StreamCreated { role: StreamRole, device: String },
    /// A stream failed and was torn down
    StreamFailed { role: StreamRole },
    /// The engine stopped on its own (connection loss)
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Stopped,
    Starting,
    Running,
}

#[derive(Debug, Default)]
struct StreamSet {
    playback: Option<StreamHandle>,
    capture: Option<StreamHandle>,
    ringtone: Option<StreamHandle>,
}

impl StreamSet {
    fn slot(&self, role: StreamRole) -> &Option<StreamHandle> {
        match role {
            StreamRole::Playback => &self.playback,
            StreamRole::Capture => &self.capture,
            StreamRole::Ringtone => &self.ringtone,
        }
    }

    fn slot_mut(&mut self, role: StreamRole) -> &mut Option<StreamHandle> {
        match role {
            StreamRole::Playback => &mut self.playback,
            StreamRole::Capture => &mut self.capture,
            StreamRole::Ringtone => &mut self.ringtone,
        }
    }

    fn find_mut(&mut self, id: StreamId) -> Option<&mut StreamHandle> {
        [&mut self.playback, &mut self.capture, &mut self.ringtone]
            .into_iter()
            .flatten()
            .find(|handle| handle.id() == id)
    }

    fn teardown(&mut self, role: StreamRole) {
        if let Some(mut handle) = self.slot_mut(role).take() {
            handle.teardown();
        }
    }

    fn teardown_all(&mut self) {
        for role in StreamRole::ALL {
            self.teardown(role);
        }
    }

    fn flush_all(&mut self) {
        for role in StreamRole::ALL {
            if let Some(handle) = self.slot_mut(role).as_mut() {
                handle.flush();
            }
        }
    }
}

#[derive(Debug, Default)]
struct PreferredDevices {
    playback: Option<String>,
    capture: Option<String>,
    ringtone: Option<String>,
}

impl PreferredDevices {
    fn get(&self, role: StreamRole) -> Option<&str> {
        match role {
            StreamRole::Playback => self.playback.as_deref(),
            StreamRole::Capture => self.capture.as_deref(),
            StreamRole::Ringtone => self.ringtone.as_deref(),
        }
    }

    fn set(&mut self, role: StreamRole, name: Option<String>) {
        match role {
            StreamRole::Playback => self.playback = name,
            StreamRole::Capture => self.capture = name,
            StreamRole::Ringtone => self.ringtone = name,
        }
    }
}

struct EngineState {
    lifecycle: Lifecycle,
    connection: ConnectionState,
    registry: DeviceRegistry,
    streams: StreamSet,
    preferred: PreferredDevices,
    event_loop: Option<EventLoop>,
}

impl EngineState {
    fn new() -> Self {
        Self {
            lifecycle: Lifecycle::Stopped,
            connection: ConnectionState::Unconnected,
            registry: DeviceRegistry::new(),
            streams: StreamSet::default(),
            preferred: PreferredDevices::default(),
            event_loop: None,
        }
    }
}

type StateGuard<'a> = ScopedLoopLock<'a, EngineState>;

struct EngineShared {
    config: EngineConfig,
    server: Arc<dyn AudioServer>,
    lock: LoopLock<EngineState>,
    mixer: Arc<DuplexMixer>,
    events: broadcast::Sender<EngineEvent>,
}

impl EngineShared {
    fn publish(&self, event: EngineEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn dispatch(&self, event: ServerEvent) {
        let mut state = self.lock.acquire();
        match event {
            ServerEvent::ConnectionState(connection) => self.on_connection_state(&mut state, connection),
            ServerEvent::Device {
                direction,
                epoch,
                device,
            } => {
                state.registry.add_device(direction, epoch, device);
            }
            ServerEvent::DeviceListEnd { direction, epoch } => {
                if state.registry.finish_enumeration(direction, epoch) {
                    let count = state.registry.snapshot(direction).len();
                    self.publish(EngineEvent::DevicesChanged { direction, count });
                    state.signal();
                    if state.lifecycle == Lifecycle::Running {
                        self.reconcile_streams(&mut state, direction);
                    }
                }
            }
            ServerEvent::Hotplug { direction, kind } => {
                if state.lifecycle == Lifecycle::Stopped || state.connection != ConnectionState::Ready {
                    debug!("Ignoring {} hot-plug while not connected", direction);
                    return;
                }
                if let Err(e) = state.registry.on_hotplug(direction, kind, self.server.as_ref()) {
                    error!("Failed to re-enumerate {} devices: {}", direction, e);
                }
                state.signal();
            }
            ServerEvent::StreamState { stream, state: stream_state } => {
                let Some(handle) = state.streams.find_mut(stream) else {
                    debug!("State {:?} for unknown stream {}", stream_state, stream);
                    return;
                };
                handle.handle_state(stream_state);
                if stream_state == StreamState::Failed {
                    let role = handle.role();
                    state.streams.teardown(role);
                    self.publish(EngineEvent::StreamFailed { role });
                }
                state.signal();
            }
            ServerEvent::WriteReady { stream } | ServerEvent::ReadReady { stream } => {
                if let Some(handle) = state.streams.find_mut(stream) {
                    handle.handle_audio_ready();
                }
            }
            ServerEvent::Underflow { stream } => {
                if let Some(handle) = state.streams.find_mut(stream) {
                    handle.handle_underflow();
                }
            }
            ServerEvent::Overflow { stream } => {
                if let Some(handle) = state.streams.find_mut(stream) {
                    handle.handle_overflow();
                }
            }
            ServerEvent::Moved { stream } => {
                if let Some(handle) = state.streams.find_mut(stream) {
                    handle.handle_moved();
                }
            }
        }
    }

    fn on_connection_state(&self, state: &mut StateGuard<'_>, connection: ConnectionState) {
        if state.lifecycle == Lifecycle::Stopped {
            debug!("Ignoring connection {:?} while stopped", connection);
            return;
        }
        let previous = state.connection;
        state.connection = connection;
        match connection {
            ConnectionState::Ready => info!("Connected to audio server '{}'", self.server.name()),
            ConnectionState::Failed | ConnectionState::Terminated => {
                error!("Audio server connection {:?}", connection)
            }
            _ => debug!("Audio server connection {:?} -> {:?}", previous, connection),
        }
        self.publish(EngineEvent::ConnectionChanged(connection));

        if state.lifecycle == Lifecycle::Running
            && matches!(connection, ConnectionState::Failed | ConnectionState::Terminated)
        {
            warn!("Audio server connection lost; tearing down streams");
            self.teardown_locked(state);
            state.connection = connection;
            self.publish(EngineEvent::Stopped);
        }
        state.signal();
    }

    /// Streams, then connection; the event loop stays for the caller to join.
    fn teardown_locked(&self, state: &mut StateGuard<'_>) {
        state.streams.teardown_all();
        self.server.disconnect();
        state.connection = ConnectionState::Unconnected;
        state.registry = DeviceRegistry::new();
        state.lifecycle = Lifecycle::Stopped;
    }

    fn open_stream(&self, state: &mut StateGuard<'_>, role: StreamRole, device: &DeviceDescriptor) -> EngineResult<()> {
        state.streams.teardown(role);

        let mut handle = StreamHandle::create(
            role,
            device.format,
            device,
            self.server.as_ref(),
            &self.config.latency,
        )
        .map_err(|e| EngineError::BackendRejected {
            role,
            reason: e.to_string(),
        })?;

        let events = self.events.clone();
        let mixer = self.mixer.clone();
        let on_audio_ready: AudioReadyCallback = match role {
            StreamRole::Playback => Box::new(move |io: &mut StreamIo| mixer.on_playback_ready(io)),
            StreamRole::Capture => Box::new(move |io: &mut StreamIo| mixer.on_capture_ready(io)),
            StreamRole::Ringtone => Box::new(move |io: &mut StreamIo| mixer.on_ringtone_ready(io)),
        };
        handle.register_callbacks(
            Box::new(move |role, stream_state| {
                let _ = events.send(EngineEvent::StreamStateChanged {
                    role,
                    state: stream_state,
                });
            }),
            on_audio_ready,
        );
        let (underflow, overflow, moved) = (self.mixer.clone(), self.mixer.clone(), self.mixer.clone());
        handle.register_notifications(
            Box::new(move |role| underflow.note_underflow(role)),
            Box::new(move |role| overflow.note_overflow(role)),
            Box::new(move |role| moved.note_moved(role)),
        );

        info!(
            "Opened {} stream on '{}' ({})",
            role, device.system_name, device.format
        );
        self.publish(EngineEvent::StreamCreated {
            role,
            device: device.system_name.clone(),
        });
        *state.streams.slot_mut(role) = Some(handle);
        Ok(())
    }

    /// Create the streams for `roles` from the current snapshots.
    ///
    /// A direction without devices yields `NoDeviceAvailable`; a rejected
    /// stream is skipped. Every other role is still attempted and the first
    /// error is returned.
    fn create_streams_locked(&self, state: &mut StateGuard<'_>, roles: &[StreamRole]) -> EngineResult<()> {
        let mut first_error = None;
        for &role in roles {
            let direction = role.direction();
            let device = match state.registry.resolve(direction, state.preferred.get(role)) {
                Ok(device) => device,
                Err(e) => {
                    warn!("Cannot open {} stream: {}", role, e);
                    state.streams.teardown(role);
                    first_error.get_or_insert(e);
                    continue;
                }
            };
            if let Err(e) = self.open_stream(state, role, &device) {
                warn!("Skipping {} stream: {}", role, e);
                first_error.get_or_insert(e);
            }
        }
        state.signal();
        first_error.map_or(Ok(()), Err)
    }

    /// Bring the streams of `direction` in line with a freshly published snapshot
    fn reconcile_streams(&self, state: &mut StateGuard<'_>, direction: Direction) {
        for &role in StreamRole::for_direction(direction) {
            let current = state
                .streams
                .slot(role)
                .as_ref()
                .map(|handle| handle.device().system_name.clone());
            // A stream on a fallback device moves once its preferred device is back.
            let keep = match current.as_deref() {
                Some(name) => {
                    state.registry.contains(direction, name)
                        && state.preferred.get(role).is_none_or(|preferred| {
                            preferred == name || !state.registry.contains(direction, preferred)
                        })
                }
                None => false,
            };
            if keep {
                continue;
            }
            if let Some(name) = current.as_deref() {
                info!("{} device '{}' changed; recreating {} stream", direction, name, role);
            }
            if let Err(e) = self.create_streams_locked(state, &[role]) {
                warn!("{} stream not restored after device change: {}", role, e);
            }
        }
    }
}

/// Audio engine: connection, devices, streams and the control surface
pub struct EngineContext {
    shared: Arc<EngineShared>,
}

impl EngineContext {
    /// Engine over `server`, reading from `main` and `urgent` and capturing into `main`
    pub fn new(
        config: EngineConfig,
        server: Arc<dyn AudioServer>,
        main: Arc<dyn SampleRing>,
        urgent: Arc<dyn SampleRing>,
    ) -> Self {
        let mixer = Arc::new(DuplexMixer::new(main, urgent, &config));
        Self::with_mixer(config, server, mixer)
    }

    /// Engine driving a preconfigured mixer
    pub fn with_mixer(config: EngineConfig, server: Arc<dyn AudioServer>, mixer: Arc<DuplexMixer>) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            shared: Arc::new(EngineShared {
                config,
                server,
                lock: LoopLock::new(EngineState::new()),
                mixer,
                events,
            }),
        }
    }

    /// Connect, enumerate devices and open the streams.
    ///
    /// Blocks until the connection settles and both enumerations complete,
    /// at most `timeout` (the configured start timeout when `None`). A
    /// failed or timed-out connection leaves nothing behind and returns
    /// `ConnectFailed`; missing devices return `NoDeviceAvailable` with the
    /// engine left running so a later hot-plug can restore the stream.
    pub fn start(&self, preferences: &dyn AudioPreferences, timeout: Option<Duration>) -> EngineResult<()> {
        let shared = &self.shared;
        shared.config.validate()?;
        let deadline = Instant::now() + timeout.unwrap_or_else(|| shared.config.start_timeout());

        self.reap_event_loop();
        let mut state = shared.lock.acquire();
        if state.lifecycle != Lifecycle::Stopped {
            return Err(EngineError::AlreadyStarted);
        }

        let controls = shared.mixer.controls();
        controls.set_capture_gain(preferences.capture_gain());
        controls.set_playback_gain(preferences.playback_gain());
        controls.set_capture_muted(preferences.capture_muted());
        controls.set_playback_muted(preferences.playback_muted());
        controls.set_ringtone_muted(preferences.ringtone_muted());
        for role in StreamRole::ALL {
            state.preferred.set(role, preferences.device_name(role));
        }

        state.lifecycle = Lifecycle::Starting;
        state.connection = ConnectionState::Connecting;
        state.registry = DeviceRegistry::new();

        let weak: Weak<EngineShared> = Arc::downgrade(shared);
        let dispatcher: EventDispatcher = Arc::new(move |event| {
            if let Some(shared) = weak.upgrade() {
                shared.dispatch(event);
            }
        });
        let event_loop = match EventLoop::spawn(&shared.config.application_name, dispatcher) {
            Ok(event_loop) => event_loop,
            Err(e) => return Self::abort_start(shared, state, e),
        };
        let handle = event_loop.handle();
        state.event_loop = Some(event_loop);

        info!(
            "Connecting to audio server '{}' as '{}'",
            shared.server.name(),
            shared.config.application_name
        );
        if let Err(e) = shared.server.connect(&shared.config.application_name, handle) {
            return Self::abort_start(shared, state, e);
        }

        let settled = state.wait_while_for(remaining(deadline), |s| s.connection.is_settled());
        if !settled {
            let reason = format!("no answer from '{}' before the start deadline", shared.server.name());
            return Self::abort_start(shared, state, EngineError::connect_failed(reason));
        }
        if state.connection != ConnectionState::Ready {
            let reason = format!("server reported {:?}", state.connection);
            return Self::abort_start(shared, state, EngineError::connect_failed(reason));
        }

        if let Err(e) = shared.server.subscribe_hotplug() {
            warn!("Hot-plug notifications unavailable: {}", e);
        }
        for direction in Direction::ALL {
            if let Err(e) = state.registry.enumerate(direction, shared.server.as_ref()) {
                return Self::abort_start(shared, state, e);
            }
        }

        let enumerated = state.wait_while_for(remaining(deadline), |s| {
            !s.registry.any_enumerating() || s.connection != ConnectionState::Ready
        });
        if state.connection != ConnectionState::Ready {
            let reason = format!("connection {:?} during device enumeration", state.connection);
            return Self::abort_start(shared, state, EngineError::connect_failed(reason));
        }
        if !enumerated {
            warn!("Device enumeration still running at the start deadline; streams open when it completes");
        }

        state.lifecycle = Lifecycle::Running;
        info!("Audio engine running");
        shared.create_streams_locked(&mut state, &StreamRole::ALL)
    }

    fn abort_start(shared: &EngineShared, mut state: StateGuard<'_>, err: EngineError) -> EngineResult<()> {
        error!("Audio engine start failed: {}", err);
        shared.teardown_locked(&mut state);
        if let Some(mut event_loop) = state.event_loop.take() {
            // The worker may be blocked on this lock; join only after release.
            state.destroy_owner_on_release(move || event_loop.shutdown());
        }
        state.signal();
        drop(state);
        Err(err)
    }

    /// Join an event loop left behind by a connection loss
    fn reap_event_loop(&self) {
        let stale = {
            let mut state = self.shared.lock.acquire();
            if state.lifecycle == Lifecycle::Stopped {
                state.event_loop.take()
            } else {
                None
            }
        };
        if let Some(mut event_loop) = stale {
            event_loop.shutdown();
        }
    }

    /// Tear down and recreate every stream from the current device snapshots.
    ///
    /// Waits for in-flight enumerations first.
    pub fn create_streams(&self) -> EngineResult<()> {
        let shared = &self.shared;
        let mut state = shared.lock.acquire();
        if state.lifecycle != Lifecycle::Running {
            return Err(EngineError::NotRunning);
        }
        if !state.wait_while_for(shared.config.start_timeout(), |s| !s.registry.any_enumerating()) {
            warn!("Device enumeration still running; using the last published devices");
        }
        shared.create_streams_locked(&mut state, &StreamRole::ALL)
    }

    /// Flush buffered audio, tear down streams and connection, join the
    /// event loop. Idempotent.
    pub fn stop(&self) -> EngineResult<()> {
        let shared = &self.shared;
        let event_loop = {
            let mut state = shared.lock.acquire();
            if state.lifecycle != Lifecycle::Stopped {
                shared.mixer.flush();
                state.streams.flush_all();
                shared.teardown_locked(&mut state);
                state.signal();
                info!("Audio engine stopped");
            }
            state.event_loop.take()
        };
        if let Some(mut event_loop) = event_loop {
            event_loop.shutdown();
        }
        Ok(())
    }

    /// Whether the engine is running
    pub fn is_running(&self) -> bool {
        self.shared.lock.acquire().lifecycle == Lifecycle::Running
    }

    /// Current connection state
    pub fn connection_state(&self) -> ConnectionState {
        self.shared.lock.acquire().connection
    }

    /// Whether the stream for `role` is Ready
    pub fn is_stream_ready(&self, role: StreamRole) -> bool {
        let state = self.shared.lock.acquire();
        state.streams.slot(role).as_ref().is_some_and(|h| h.is_ready())
    }

    /// Device the stream for `role` is connected to
    pub fn stream_device(&self, role: StreamRole) -> Option<DeviceDescriptor> {
        let state = self.shared.lock.acquire();
        state.streams.slot(role).as_ref().map(|h| h.device().clone())
    }

    /// Negotiated format of the stream for `role`
    pub fn stream_format(&self, role: StreamRole) -> Option<AudioFormat> {
        let state = self.shared.lock.acquire();
        state.streams.slot(role).as_ref().map(|h| h.format())
    }

    /// Display names of the devices in `direction`.
    ///
    /// Waits for an in-flight enumeration; empty if it does not finish
    /// within the start timeout.
    pub fn get_device_list(&self, direction: Direction) -> Vec<String> {
        let shared = &self.shared;
        let mut state = shared.lock.acquire();
        if !state.wait_while_for(shared.config.start_timeout(), |s| !s.registry.is_enumerating(direction)) {
            warn!("{} device enumeration still running", direction);
            return Vec::new();
        }
        state.registry.names(direction)
    }

    /// Switch the playback or capture stream to device `index` of the current list
    pub fn select_device(&self, direction: Direction, index: usize) -> EngineResult<()> {
        let role = match direction {
            Direction::Playback => StreamRole::Playback,
            Direction::Capture => StreamRole::Capture,
        };
        self.select_role_device(role, index)
    }

    /// Switch the ringtone stream to playback device `index`
    pub fn select_ringtone_device(&self, index: usize) -> EngineResult<()> {
        self.select_role_device(StreamRole::Ringtone, index)
    }

    fn select_role_device(&self, role: StreamRole, index: usize) -> EngineResult<()> {
        let shared = &self.shared;
        let direction = role.direction();
        let mut state = shared.lock.acquire();
        state.wait_while_for(shared.config.start_timeout(), |s| !s.registry.is_enumerating(direction));

        let device = state.registry.device_at(direction, index)?;
        info!("Selecting {} device '{}'", role, device.system_name);
        state.preferred.set(role, Some(device.system_name.clone()));
        if state.lifecycle != Lifecycle::Running {
            return Ok(());
        }
        shared.open_stream(&mut state, role, &device)
    }

    /// Set capture gain (clamped to `[0, 4]`)
    pub fn set_capture_gain(&self, gain: f64) {
        let _state = self.shared.lock.acquire();
        let applied = self.shared.mixer.controls().set_capture_gain(gain);
        debug!("Capture gain {}", applied);
    }

    /// Set playback gain (clamped to `[0, 4]`)
    pub fn set_playback_gain(&self, gain: f64) {
        let _state = self.shared.lock.acquire();
        let applied = self.shared.mixer.controls().set_playback_gain(gain);
        debug!("Playback gain {}", applied);
    }

    pub fn capture_gain(&self) -> f64 {
        self.shared.mixer.controls().capture_gain()
    }

    pub fn playback_gain(&self) -> f64 {
        self.shared.mixer.controls().playback_gain()
    }

    pub fn mute_capture(&self, muted: bool) {
        let _state = self.shared.lock.acquire();
        self.shared.mixer.controls().set_capture_muted(muted);
    }

    pub fn mute_playback(&self, muted: bool) {
        let _state = self.shared.lock.acquire();
        self.shared.mixer.controls().set_playback_muted(muted);
    }

    pub fn mute_ringtone(&self, muted: bool) {
        let _state = self.shared.lock.acquire();
        self.shared.mixer.controls().set_ringtone_muted(muted);
    }

    pub fn is_capture_muted(&self) -> bool {
        self.shared.mixer.controls().capture_muted()
    }

    pub fn is_playback_muted(&self) -> bool {
        self.shared.mixer.controls().playback_muted()
    }

    pub fn is_ringtone_muted(&self) -> bool {
        self.shared.mixer.controls().ringtone_muted()
    }

    /// Play a tone from its start on the playback stream, preempting the
    /// main pipeline
    pub fn play_tone(&self, mut tone: Box<dyn ToneSource>) {
        tone.restart();
        let _state = self.shared.lock.acquire();
        self.shared.mixer.set_tone(Some(tone));
    }

    pub fn stop_tone(&self) {
        let _state = self.shared.lock.acquire();
        self.shared.mixer.set_tone(None);
    }

    /// Play a source from its start on the ringtone stream
    pub fn play_ringtone(&self, mut tone: Box<dyn ToneSource>) {
        tone.restart();
        let _state = self.shared.lock.acquire();
        self.shared.mixer.set_ringtone(Some(tone));
    }

    pub fn stop_ringtone(&self) {
        let _state = self.shared.lock.acquire();
        self.shared.mixer.set_ringtone(None);
    }

    /// Mixer counters
    pub fn stats(&self) -> MixerStatsSnapshot {
        self.shared.mixer.stats()
    }

    /// Subscribe to engine notifications
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.shared.events.subscribe()
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }
}

impl Drop for EngineContext {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

impl fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineContext")
            .field("server", &self.shared.server.name())
            .field("mixer", &self.shared.mixer)
            .finish()
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}
