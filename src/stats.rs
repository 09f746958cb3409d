//! Capture and dispatch counters.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters owned by a single capture thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerStats {
    /// Packets returned by the capture handle
    pub packets_seen: u64,
    /// Header windows handed to the callback
    pub forwarded: u64,
    /// Packets that were not Ethernet/IPv4 TCP or UDP
    pub dropped: u64,
    /// Capture calls that ended on the read timeout
    pub timeouts: u64,
    /// Capture calls that failed with a device error
    pub errors: u64,
}

impl fmt::Display for ListenerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "seen={} forwarded={} dropped={} timeouts={} errors={}",
            self.packets_seen, self.forwarded, self.dropped, self.timeouts, self.errors
        )
    }
}

/// Plain copy of the dispatcher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSnapshot {
    pub records: u64,
    pub batches_sent: u64,
    pub batches_dropped: u64,
    pub bytes_sent: u64,
    pub oversized: u64,
}

impl fmt::Display for DispatchSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "records={} batches_sent={} batches_dropped={} bytes_sent={} oversized={}",
            self.records, self.batches_sent, self.batches_dropped, self.bytes_sent, self.oversized
        )
    }
}

/// Dispatcher counters, readable without taking the dispatcher lock.
#[derive(Debug, Default)]
pub struct DispatchStats {
    records: AtomicU64,
    batches_sent: AtomicU64,
    batches_dropped: AtomicU64,
    bytes_sent: AtomicU64,
    oversized: AtomicU64,
}

impl DispatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_written(&self) {
        self.records.fetch_add(1, Ordering::Relaxed);
    }

    pub fn batch_sent(&self, bytes: usize) {
        self.batches_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn batch_dropped(&self) {
        self.batches_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn oversized_record(&self) {
        self.oversized.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DispatchSnapshot {
        DispatchSnapshot {
            records: self.records.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            batches_dropped: self.batches_dropped.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            oversized: self.oversized.load(Ordering::Relaxed),
        }
    }
}
