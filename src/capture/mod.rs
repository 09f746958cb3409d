//! Per-interface packet capture.
//!
//! This module defines the `CaptureSource` trait that a listener reads from
//! and the blocking `capture_loop` each listener thread runs. The libpcap
//! backend lives in `pcap_capture`; tests drive the loop with in-memory sources.

pub mod header;
mod pcap_capture;

pub use pcap_capture::{build_listener_set, list_interfaces, release_listener_set, PcapSource};

use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, trace};

use crate::filter::CompiledFilter;
use crate::shutdown::RunSignal;
use crate::stats::ListenerStats;

/// Consecutive device errors after which a listener gives up.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 100;

/// Outcome of one read from a capture handle.
#[derive(Debug)]
pub enum NextPacket<'a> {
    /// A frame arrived, stamped with its capture time in seconds since the epoch.
    Packet { timestamp: u32, data: &'a [u8] },
    /// The read timeout expired with nothing to deliver.
    Timeout,
    /// The device reported an error.
    Error(String),
}

/// A live capture handle (Dependency Inversion for the capture loop).
///
/// Implementations must bound each call by a read timeout so the loop can
/// observe the run signal.
pub trait CaptureSource: Send {
    fn next_packet(&mut self) -> NextPacket<'_>;
}

/// Receives `(interface, capture_time, header_window)` for every reported frame.
pub type FrameCallback = Arc<dyn Fn(&str, u32, &[u8]) + Send + Sync>;

/// One interface being captured, owned by its capture thread.
pub struct Listener {
    source: Box<dyn CaptureSource>,
    interface: String,
    filter: Option<CompiledFilter>,
    callback: FrameCallback,
    stats: ListenerStats,
}

impl Listener {
    pub fn new(
        interface: impl Into<String>,
        source: Box<dyn CaptureSource>,
        filter: Option<CompiledFilter>,
        callback: FrameCallback,
    ) -> Self {
        Self {
            source,
            interface: interface.into(),
            filter,
            callback,
            stats: ListenerStats::default(),
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn filter(&self) -> Option<&CompiledFilter> {
        self.filter.as_ref()
    }

    pub fn stats(&self) -> ListenerStats {
        self.stats
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("interface", &self.interface)
            .field("filter", &self.filter)
            .field("stats", &self.stats)
            .finish()
    }
}

/// Read, classify and forward packets until `signal` stops.
///
/// Timeouts and device errors both continue the loop; a run of
/// `MAX_CONSECUTIVE_ERRORS` device errors ends it early.
pub fn capture_loop(listener: &mut Listener, signal: &RunSignal) {
    let Listener {
        source,
        interface,
        callback,
        stats,
        ..
    } = listener;

    debug!("Capture loop started on {}", interface);
    let mut consecutive_errors = 0u32;

    while signal.is_running() {
        match source.next_packet() {
            NextPacket::Packet { timestamp, data } => {
                consecutive_errors = 0;
                stats.packets_seen += 1;

                match header::header_window(data) {
                    Some(window) => {
                        (callback.as_ref())(interface.as_str(), timestamp, &data[..window]);
                        stats.forwarded += 1;
                    }
                    None => {
                        trace!("Dropped {} byte frame on {}", data.len(), interface);
                        stats.dropped += 1;
                    }
                }
            }
            NextPacket::Timeout => {
                consecutive_errors = 0;
                stats.timeouts += 1;
            }
            NextPacket::Error(reason) => {
                stats.errors += 1;
                consecutive_errors += 1;
                debug!("Capture error on {}: {}", interface, reason);

                if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    error!(
                        "Giving up on {} after {} consecutive capture errors: {}",
                        interface, consecutive_errors, reason
                    );
                    break;
                }
            }
        }
    }

    debug!("Capture loop finished on {} ({})", interface, stats);
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Scripted capture source. Returns `Timeout` once the script runs out
    /// and cancels `stop_when_empty` if given.
    pub(crate) struct ScriptedSource {
        script: VecDeque<Scripted>,
        current: Vec<u8>,
        stop_when_empty: Option<RunSignal>,
    }

    pub(crate) enum Scripted {
        Frame(u32, Vec<u8>),
        Timeout,
        Error,
    }

    impl ScriptedSource {
        pub(crate) fn new(script: Vec<Scripted>, stop_when_empty: Option<RunSignal>) -> Self {
            Self {
                script: script.into(),
                current: Vec::new(),
                stop_when_empty,
            }
        }
    }

    impl CaptureSource for ScriptedSource {
        fn next_packet(&mut self) -> NextPacket<'_> {
            match self.script.pop_front() {
                Some(Scripted::Frame(timestamp, data)) => {
                    self.current = data;
                    NextPacket::Packet {
                        timestamp,
                        data: &self.current,
                    }
                }
                Some(Scripted::Timeout) => NextPacket::Timeout,
                Some(Scripted::Error) => NextPacket::Error("device went away".to_string()),
                None => {
                    if let Some(signal) = &self.stop_when_empty {
                        signal.cancel();
                    }
                    NextPacket::Timeout
                }
            }
        }
    }

    type Seen = Arc<Mutex<Vec<(String, u32, Vec<u8>)>>>;

    fn recording_callback() -> (FrameCallback, Seen) {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: FrameCallback = Arc::new(move |iface: &str, ts: u32, data: &[u8]| {
            sink.lock().unwrap().push((iface.to_string(), ts, data.to_vec()));
        });
        (callback, seen)
    }

    #[test]
    fn test_loop_forwards_header_windows_only() {
        let signal = RunSignal::new();
        let tcp = header::tests::tcp_frame();
        let udp = header::tests::udp_frame();
        let icmp = header::tests::ipv4_frame(1, 5, 16);

        let source = ScriptedSource::new(
            vec![
                Scripted::Frame(10, tcp.clone()),
                Scripted::Timeout,
                Scripted::Frame(11, icmp),
                Scripted::Frame(12, udp.clone()),
            ],
            Some(signal.clone()),
        );

        let (callback, seen) = recording_callback();
        let mut listener = Listener::new("em0", Box::new(source), None, callback);
        capture_loop(&mut listener, &signal);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], ("em0".to_string(), 10, tcp[..54].to_vec()));
        assert_eq!(seen[1], ("em0".to_string(), 12, udp[..42].to_vec()));

        let stats = listener.stats();
        assert_eq!(stats.packets_seen, 3);
        assert_eq!(stats.forwarded, 2);
        assert_eq!(stats.dropped, 1);
        assert!(stats.timeouts >= 1);
    }

    #[test]
    fn test_loop_does_not_run_when_cancelled() {
        let signal = RunSignal::new();
        signal.cancel();

        let source = ScriptedSource::new(
            vec![Scripted::Frame(1, header::tests::tcp_frame())],
            None,
        );
        let (callback, seen) = recording_callback();
        let mut listener = Listener::new("em0", Box::new(source), None, callback);
        capture_loop(&mut listener, &signal);

        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(listener.stats(), ListenerStats::default());
    }

    #[test]
    fn test_errors_are_retried() {
        let signal = RunSignal::new();
        let source = ScriptedSource::new(
            vec![
                Scripted::Error,
                Scripted::Error,
                Scripted::Frame(5, header::tests::tcp_frame()),
            ],
            Some(signal.clone()),
        );
        let (callback, seen) = recording_callback();
        let mut listener = Listener::new("igb0", Box::new(source), None, callback);
        capture_loop(&mut listener, &signal);

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(listener.stats().errors, 2);
    }

    #[test]
    fn test_persistent_errors_end_the_loop() {
        let signal = RunSignal::new();
        let script = (0..MAX_CONSECUTIVE_ERRORS + 5).map(|_| Scripted::Error).collect();
        let source = ScriptedSource::new(script, None);
        let (callback, _seen) = recording_callback();
        let mut listener = Listener::new("igb0", Box::new(source), None, callback);
        capture_loop(&mut listener, &signal);

        assert!(signal.is_running());
        assert_eq!(listener.stats().errors, u64::from(MAX_CONSECUTIVE_ERRORS));
    }
}
