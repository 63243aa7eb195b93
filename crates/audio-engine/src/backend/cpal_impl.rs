//! CPAL-based audio server
//!
//! cpal has no server connection, so the handshake completes immediately and
//! devices are listed from the default host. Each stream runs on its own
//! thread that owns the (non-`Send`) cpal stream until a oneshot shutdown
//! signal arrives.
//!
//! cpal pulls audio from its callback thread, so write-ready and read-ready
//! events are dispatched inline from that thread: the output callback asks
//! the engine to fill a staging buffer and copies it into cpal's buffer
//! before returning.

use super::{AudioServer, RawStream, ServerEvent, StreamParams};
use crate::error::{EngineError, StreamError};
use crate::event_loop::LoopHandle;
use crate::types::{
    AudioFormat, ConnectionState, DeviceDescriptor, Direction, HotplugKind, StreamId, StreamState,
    BYTES_PER_SAMPLE,
};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, Device, SampleRate, StreamConfig};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Capture fragments kept before the oldest is dropped
const MAX_QUEUED_FRAGMENTS: usize = 32;

fn f32_to_le_bytes(samples: &[f32], out: &mut Vec<u8>) {
    out.clear();
    for &sample in samples {
        let value = (sample * i16::MAX as f32).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        out.extend_from_slice(&value.to_le_bytes());
    }
}

fn le_bytes_to_f32(bytes: &[u8], out: &mut [f32]) -> usize {
    let count = (bytes.len() / BYTES_PER_SAMPLE).min(out.len());
    for (slot, chunk) in out.iter_mut().zip(bytes.chunks_exact(BYTES_PER_SAMPLE)).take(count) {
        *slot = i16::from_le_bytes([chunk[0], chunk[1]]) as f32 / i16::MAX as f32;
    }
    count
}

fn devices_for(direction: Direction) -> Result<Vec<Device>, EngineError> {
    let host = cpal::default_host();
    let devices = match direction {
        Direction::Playback => host.output_devices(),
        Direction::Capture => host.input_devices(),
    }
    .map_err(|e| EngineError::transient(format!("failed to list {} devices: {}", direction, e)))?;
    Ok(devices.collect())
}

fn default_format(device: &Device, direction: Direction) -> Option<AudioFormat> {
    let config = match direction {
        Direction::Playback => device.default_output_config(),
        Direction::Capture => device.default_input_config(),
    }
    .ok()?;
    let channels = u8::try_from(config.channels()).unwrap_or(u8::MAX);
    Some(AudioFormat::new(config.sample_rate().0, channels))
}

fn find_device(direction: Direction, name: &str) -> Option<Device> {
    let host = cpal::default_host();
    let named = devices_for(direction)
        .ok()?
        .into_iter()
        .find(|d| d.name().map(|n| n == name).unwrap_or(false));
    named.or_else(|| match direction {
        Direction::Playback => host.default_output_device(),
        Direction::Capture => host.default_input_device(),
    })
}

/// [`AudioServer`] over the platform's default cpal host
#[derive(Default)]
pub struct CpalServer {
    events: Mutex<Option<LoopHandle>>,
}

impl CpalServer {
    /// Create a new cpal server
    pub fn new() -> Self {
        Self::default()
    }
}

impl AudioServer for CpalServer {
    fn name(&self) -> &str {
        "cpal"
    }

    fn connect(&self, application_name: &str, events: LoopHandle) -> Result<(), EngineError> {
        debug!("cpal host '{}' for '{}'", cpal::default_host().id().name(), application_name);
        events.post(ServerEvent::ConnectionState(ConnectionState::Connecting));
        events.post(ServerEvent::ConnectionState(ConnectionState::Ready));
        *self.events.lock() = Some(events);
        Ok(())
    }

    fn subscribe_hotplug(&self) -> Result<(), EngineError> {
        Err(EngineError::transient("cpal has no device change notifications"))
    }

    fn enumerate(&self, direction: Direction, epoch: u64) -> Result<(), EngineError> {
        let Some(events) = self.events.lock().clone() else {
            return Err(EngineError::transient("enumeration without connection"));
        };
        for (index, device) in devices_for(direction)?.into_iter().enumerate() {
            let Ok(name) = device.name() else {
                continue;
            };
            let Some(format) = default_format(&device, direction) else {
                debug!("Skipping {} device '{}' without a default config", direction, name);
                continue;
            };
            events.post(ServerEvent::Device {
                direction,
                epoch,
                device: DeviceDescriptor::new(index as u32, name.clone(), name, format),
            });
        }
        events.post(ServerEvent::DeviceListEnd { direction, epoch });
        Ok(())
    }

    fn supports_format(&self, _direction: Direction, format: &AudioFormat) -> bool {
        format.is_valid() && (8000..=192_000).contains(&format.sample_rate)
    }

    fn create_stream(&self, params: &StreamParams) -> Result<Box<dyn RawStream>, StreamError> {
        let Some(events) = self.events.lock().clone() else {
            return Err(StreamError::rejected("no connection"));
        };
        Ok(Box::new(CpalStream {
            params: params.clone(),
            events,
            shared: Arc::new(Mutex::new(CpalShared::default())),
            worker: None,
            write_buffer: Vec::new(),
            fragment: Vec::new(),
        }))
    }

    fn disconnect(&self) {
        *self.events.lock() = None;
    }
}

#[derive(Default)]
struct CpalShared {
    connected: bool,
    writable: usize,
    staged: Vec<u8>,
    capture: VecDeque<Vec<u8>>,
}

struct CpalStream {
    params: StreamParams,
    events: LoopHandle,
    shared: Arc<Mutex<CpalShared>>,
    worker: Option<(oneshot::Sender<()>, JoinHandle<()>)>,
    write_buffer: Vec<u8>,
    fragment: Vec<u8>,
}

impl CpalStream {
    fn stream_config(&self) -> StreamConfig {
        let format = self.params.format;
        let attributes = self.params.attributes;
        let request = match self.params.direction() {
            Direction::Playback => attributes.min_request,
            Direction::Capture => attributes.fragment_size,
        };
        let buffer_size = if request == u32::MAX {
            BufferSize::Default
        } else {
            BufferSize::Fixed(request / format.frame_bytes().max(1) as u32)
        };
        StreamConfig {
            channels: format.channels as u16,
            sample_rate: SampleRate(format.sample_rate),
            buffer_size,
        }
    }

    fn spawn_worker(&self, shutdown_rx: oneshot::Receiver<()>) -> std::io::Result<JoinHandle<()>> {
        let params = self.params.clone();
        let config = self.stream_config();
        let events = self.events.clone();
        let shared = self.shared.clone();

        thread::Builder::new()
            .name(format!("cpal-{}", params.role))
            .spawn(move || {
                let id = params.id;
                let direction = params.direction();
                let Some(device) = find_device(direction, &params.device) else {
                    error!("No cpal {} device for '{}'", direction, params.device);
                    events.post(ServerEvent::StreamState {
                        stream: id,
                        state: StreamState::Failed,
                    });
                    return;
                };

                let error_events = events.clone();
                let on_error = move |err: cpal::StreamError| {
                    error!("cpal {} stream error: {}", direction, err);
                    if matches!(err, cpal::StreamError::DeviceNotAvailable) {
                        error_events.post(ServerEvent::Hotplug {
                            direction,
                            kind: HotplugKind::Removed,
                        });
                    }
                    error_events.post(ServerEvent::StreamState {
                        stream: id,
                        state: StreamState::Failed,
                    });
                };

                let built = match direction {
                    Direction::Playback => {
                        let shared = shared.clone();
                        let events = events.clone();
                        device.build_output_stream(
                            &config,
                            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                                {
                                    let mut state = shared.lock();
                                    if !state.connected {
                                        data.fill(0.0);
                                        return;
                                    }
                                    state.writable = data.len() * BYTES_PER_SAMPLE;
                                    state.staged.clear();
                                }
                                events.dispatch(ServerEvent::WriteReady { stream: id });
                                let state = shared.lock();
                                let filled = le_bytes_to_f32(&state.staged, data);
                                data[filled..].fill(0.0);
                            },
                            on_error,
                            None,
                        )
                    }
                    Direction::Capture => {
                        let shared = shared.clone();
                        let events = events.clone();
                        let mut bytes = Vec::new();
                        device.build_input_stream(
                            &config,
                            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                                f32_to_le_bytes(data, &mut bytes);
                                {
                                    let mut state = shared.lock();
                                    if !state.connected {
                                        return;
                                    }
                                    if state.capture.len() >= MAX_QUEUED_FRAGMENTS {
                                        state.capture.pop_front();
                                        events.post(ServerEvent::Overflow { stream: id });
                                    }
                                    state.capture.push_back(bytes.clone());
                                }
                                events.dispatch(ServerEvent::ReadReady { stream: id });
                            },
                            on_error,
                            None,
                        )
                    }
                };

                let stream = match built {
                    Ok(stream) => stream,
                    Err(e) => {
                        error!("Failed to build cpal {} stream: {}", direction, e);
                        events.post(ServerEvent::StreamState {
                            stream: id,
                            state: StreamState::Failed,
                        });
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    error!("Failed to start cpal {} stream: {}", direction, e);
                    events.post(ServerEvent::StreamState {
                        stream: id,
                        state: StreamState::Failed,
                    });
                    return;
                }

                info!("Started cpal {} stream on '{}'", params.role, params.device);
                events.post(ServerEvent::StreamState {
                    stream: id,
                    state: StreamState::Ready,
                });

                // The cpal stream stops when dropped at the end of this thread.
                let _ = shutdown_rx.blocking_recv();
                debug!("Stopped cpal {} stream on '{}'", params.role, params.device);
            })
    }

    fn stop_worker(&mut self) {
        self.shared.lock().connected = false;
        if let Some((shutdown_tx, worker)) = self.worker.take() {
            let _ = shutdown_tx.send(());
            // Not joined: the cpal callback may be waiting on the engine lock
            // held by the caller.
            drop(worker);
        }
    }
}

impl RawStream for CpalStream {
    fn id(&self) -> StreamId {
        self.params.id
    }

    fn connect(&mut self) -> Result<(), StreamError> {
        if self.worker.is_some() {
            return Ok(());
        }
        self.shared.lock().connected = true;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let worker = self
            .spawn_worker(shutdown_rx)
            .map_err(|e| StreamError::rejected(format!("failed to spawn stream thread: {}", e)))?;
        self.worker = Some((shutdown_tx, worker));
        self.events.post(ServerEvent::StreamState {
            stream: self.params.id,
            state: StreamState::Creating,
        });
        Ok(())
    }

    fn disconnect(&mut self) {
        self.stop_worker();
    }

    fn writable_size(&self) -> i64 {
        let state = self.shared.lock();
        state.writable.saturating_sub(state.staged.len()) as i64
    }

    fn begin_write(&mut self, max_bytes: usize) -> Result<&mut [u8], StreamError> {
        let len = max_bytes.min(self.writable_size().max(0) as usize);
        self.write_buffer.clear();
        self.write_buffer.resize(len, 0);
        Ok(&mut self.write_buffer[..])
    }

    fn commit_write(&mut self, bytes: usize) -> Result<(), StreamError> {
        if bytes > self.write_buffer.len() {
            return Err(StreamError::transient("commit larger than write buffer"));
        }
        self.shared
            .lock()
            .staged
            .extend_from_slice(&self.write_buffer[..bytes]);
        Ok(())
    }

    fn readable_size(&self) -> i64 {
        self.shared.lock().capture.front().map_or(0, |f| f.len() as i64)
    }

    fn peek(&mut self) -> Result<Option<usize>, StreamError> {
        match self.shared.lock().capture.pop_front() {
            Some(fragment) => {
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
        self.fragment.clear();
        Ok(())
    }

    fn flush(&mut self) {
        let mut state = self.shared.lock();
        state.capture.clear();
        state.staged.clear();
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        if self.worker.is_some() {
            warn!("cpal {} stream released while connected", self.params.role);
        }
        self.stop_worker();
    }
}
