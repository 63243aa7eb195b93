//! Event loop worker thread
//!
//! Backends post [`ServerEvent`]s into an unbounded queue; one dedicated
//! thread drains it and hands each event to the engine's dispatcher, which
//! takes the engine lock before touching any state. Backends whose audio
//! callbacks must be answered synchronously (cpal) use
//! [`LoopHandle::dispatch`] from their own thread instead.

use crate::backend::ServerEvent;
use crate::error::{EngineError, EngineResult};
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Receiver of every backend event
pub type EventDispatcher = Arc<dyn Fn(ServerEvent) + Send + Sync>;

enum LoopMessage {
    Event(ServerEvent),
    Shutdown,
}

/// Cloneable handle used by backends to reach the event loop
#[derive(Clone)]
pub struct LoopHandle {
    tx: mpsc::UnboundedSender<LoopMessage>,
    dispatcher: EventDispatcher,
}

impl LoopHandle {
    /// Queue an event for the worker thread; `false` once the loop is gone
    pub fn post(&self, event: ServerEvent) -> bool {
        self.tx.send(LoopMessage::Event(event)).is_ok()
    }

    /// Deliver an event on the calling thread.
    ///
    /// Must not be called from inside a dispatched callback: the dispatcher
    /// takes the engine lock.
    pub fn dispatch(&self, event: ServerEvent) {
        (self.dispatcher)(event);
    }

    /// Whether the worker has exited
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

/// Owner of the worker thread
pub struct EventLoop {
    handle: LoopHandle,
    worker: Option<JoinHandle<()>>,
}

impl EventLoop {
    /// Spawn the worker thread
    pub fn spawn(name: &str, dispatcher: EventDispatcher) -> EngineResult<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<LoopMessage>();
        let worker_dispatcher = dispatcher.clone();

        let worker = thread::Builder::new()
            .name(format!("{}-audio-loop", name))
            .spawn(move || {
                while let Some(message) = rx.blocking_recv() {
                    match message {
                        LoopMessage::Event(event) => worker_dispatcher(event),
                        LoopMessage::Shutdown => break,
                    }
                }
                debug!("Audio event loop exited");
            })
            .map_err(|e| EngineError::connect_failed(format!("failed to spawn event loop: {}", e)))?;

        Ok(Self {
            handle: LoopHandle { tx, dispatcher },
            worker: Some(worker),
        })
    }

    /// Handle for backends
    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Stop the worker and wait for it to exit. Idempotent.
    ///
    /// Must be called without holding the engine lock: the worker may be
    /// waiting on it to finish its current event.
    pub fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        let _ = self.handle.tx.send(LoopMessage::Shutdown);
        if worker.thread().id() == thread::current().id() {
            warn!("Event loop shut down from its own worker thread; not joining");
            return;
        }
        if worker.join().is_err() {
            warn!("Audio event loop worker panicked");
        }
    }

    /// Whether the worker is still owned by this loop
    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("running", &self.is_running())
            .finish()
    }
}
