//! Capture orchestration.
//!
//! The sniffer wires listeners to the dispatcher, runs one thread per
//! interface and joins them once the run signal is cleared.

use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::capture::{build_listener_set, capture_loop, release_listener_set, FrameCallback, Listener};
use crate::config::CaptureSettings;
use crate::dispatcher::Dispatcher;
use crate::error::{CaptureError, SnifferError};
use crate::shutdown::RunSignal;
use crate::transmitter::{BatchSink, Transmitter};

/// How often the controlling thread checks whether draining has begun.
const DRAIN_POLL: Duration = Duration::from_millis(50);

/// Lifecycle of a sniffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnifferState {
    Uninitialized,
    Initialized,
    Running,
    Draining,
    Terminated,
}

impl SnifferState {
    fn as_str(self) -> &'static str {
        match self {
            SnifferState::Uninitialized => "uninitialized",
            SnifferState::Initialized => "initialized",
            SnifferState::Running => "running",
            SnifferState::Draining => "draining",
            SnifferState::Terminated => "terminated",
        }
    }
}

impl fmt::Display for SnifferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Draining starts once the run signal is cleared or every capture thread has returned.
fn drain_started(signal: &RunSignal, handles: &[JoinHandle<Listener>]) -> bool {
    !signal.is_running() || handles.iter().all(JoinHandle::is_finished)
}

/// Callback forwarding captured header windows into `dispatcher`.
pub fn dispatch_callback<S: BatchSink + 'static>(dispatcher: &Arc<Dispatcher<S>>) -> FrameCallback {
    let dispatcher = Arc::clone(dispatcher);
    Arc::new(move |interface: &str, capture_time: u32, data: &[u8]| {
        if let Err(e) = dispatcher.write(interface, capture_time, data) {
            debug!("Record from {} not written: {}", interface, e);
        }
    })
}

pub struct Sniffer<S: BatchSink + 'static> {
    dispatcher: Arc<Dispatcher<S>>,
    listeners: Vec<Listener>,
    signal: RunSignal,
    state: SnifferState,
}

impl Sniffer<Transmitter> {
    /// Connect to the collector and open every eligible interface.
    pub fn initialize(
        collector_key: &str,
        settings: &CaptureSettings,
        signal: RunSignal,
    ) -> Result<Self, SnifferError> {
        let dispatcher = Dispatcher::initialize(collector_key, settings).inspect_err(|e| {
            error!("Failed to initialize the data dispatcher: {}", e);
        })?;
        let dispatcher = Arc::new(dispatcher);

        let listeners = build_listener_set(settings, dispatch_callback(&dispatcher))?;
        Self::with_listeners(dispatcher, listeners, signal)
    }
}

impl<S: BatchSink + 'static> Sniffer<S> {
    /// Assemble a sniffer from an existing dispatcher and listener set.
    pub fn with_listeners(
        dispatcher: Arc<Dispatcher<S>>,
        listeners: Vec<Listener>,
        signal: RunSignal,
    ) -> Result<Self, SnifferError> {
        if listeners.is_empty() {
            return Err(CaptureError::NoInterfaces.into());
        }

        Ok(Self {
            dispatcher,
            listeners,
            signal,
            state: SnifferState::Initialized,
        })
    }

    pub fn state(&self) -> SnifferState {
        self.state
    }

    pub fn listeners(&self) -> &[Listener] {
        &self.listeners
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher<S>> {
        &self.dispatcher
    }

    fn transition(&mut self, next: SnifferState) {
        debug!("Sniffer {} -> {}", self.state, next);
        self.state = next;
    }

    /// Run one capture thread per listener until the run signal is cleared.
    ///
    /// If a thread cannot be spawned, the threads already started are stopped
    /// and joined before the error is returned.
    pub fn run(&mut self) -> Result<(), SnifferError> {
        if self.state != SnifferState::Initialized {
            return Err(SnifferError::InvalidState {
                action: "run",
                state: self.state.as_str(),
            });
        }

        let group = self.signal.child();
        let listeners = std::mem::take(&mut self.listeners);
        let mut handles = Vec::with_capacity(listeners.len());
        self.transition(SnifferState::Running);

        for mut listener in listeners {
            let interface = listener.interface().to_string();
            let signal = group.clone();

            let spawned = thread::Builder::new()
                .name(format!("capture-{}", interface))
                .spawn(move || {
                    capture_loop(&mut listener, &signal);
                    listener
                });

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(source) => {
                    error!("Failed to spawn listener thread for {}: {}", interface, source);
                    group.cancel();
                    self.transition(SnifferState::Draining);
                    self.join_all(handles);
                    self.transition(SnifferState::Terminated);
                    return Err(SnifferError::Spawn { interface, source });
                }
            }
        }

        info!("Capturing on {} interface(s)", handles.len());
        while !drain_started(&group, &handles) {
            thread::sleep(DRAIN_POLL);
        }

        self.transition(SnifferState::Draining);
        self.join_all(handles);
        self.transition(SnifferState::Terminated);
        Ok(())
    }

    fn join_all(&mut self, handles: Vec<JoinHandle<Listener>>) {
        for handle in handles {
            match handle.join() {
                Ok(listener) => {
                    info!(
                        "Listener on {} stopped ({})",
                        listener.interface(),
                        listener.stats()
                    );
                    self.listeners.push(listener);
                }
                Err(_) => error!("A listener thread panicked"),
            }
        }
    }

    /// Release the listeners, then the dispatcher and its transmitter.
    pub fn finalize(self) {
        let Sniffer {
            dispatcher,
            listeners,
            ..
        } = self;

        release_listener_set(listeners);

        match Arc::try_unwrap(dispatcher) {
            Ok(dispatcher) => {
                info!("Dispatcher statistics: {}", dispatcher.stats());
                drop(dispatcher.finalize());
            }
            Err(dispatcher) => {
                warn!(
                    "Dispatcher still referenced at shutdown ({})",
                    dispatcher.stats()
                );
            }
        }
    }
}
