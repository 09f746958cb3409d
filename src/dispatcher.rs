//! Shared sink for all capture threads.
//!
//! Every listener writes through one mutex-protected buffer. When the next
//! record does not fit, the buffer is pushed to the transmitter and cleared
//! before the record is appended, so a batch always starts with exactly one
//! system id followed by whole records.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::buffer::FrameBuffer;
use crate::config::CaptureSettings;
use crate::error::DispatchError;
use crate::stats::{DispatchSnapshot, DispatchStats};
use crate::transmitter::{BatchSink, Transmitter};
use crate::wire::{record_len, SYSTEM_ID_LEN, TIMESTAMP_LEN};

/// Batch capacity.
#[cfg(not(debug_assertions))]
pub const DEFAULT_BATCH_CAPACITY: usize = 65536;
#[cfg(debug_assertions)]
pub const DEFAULT_BATCH_CAPACITY: usize = 2048;

struct Inner<S> {
    buffer: FrameBuffer,
    sink: S,
}

pub struct Dispatcher<S: BatchSink> {
    inner: Mutex<Inner<S>>,
    system_id: Uuid,
    stats: DispatchStats,
}

impl Dispatcher<Transmitter> {
    /// Connect the transmitter and allocate the batch buffer.
    pub fn initialize(collector_key: &str, settings: &CaptureSettings) -> Result<Self, DispatchError> {
        let transmitter = Transmitter::initialize(collector_key, &settings.monitor_url)
            .inspect_err(|e| error!("Failed to initialize data transmitter: {}", e))?;

        Ok(Self::new(transmitter, settings.system_id, DEFAULT_BATCH_CAPACITY))
    }
}

impl<S: BatchSink> Dispatcher<S> {
    pub fn new(sink: S, system_id: Uuid, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                buffer: FrameBuffer::new(capacity),
                sink,
            }),
            system_id,
            stats: DispatchStats::new(),
        }
    }

    pub fn system_id(&self) -> Uuid {
        self.system_id
    }

    fn lock(&self) -> MutexGuard<'_, Inner<S>> {
        // The critical section never leaves the buffer half-written.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn flush_locked(&self, inner: &mut Inner<S>) {
        if inner.buffer.is_empty() {
            return;
        }

        let len = inner.buffer.len();
        let Inner { buffer, sink } = inner;
        match sink.send(buffer.as_bytes()) {
            Ok(()) => {
                debug!("Flushed {} byte batch", len);
                self.stats.batch_sent(len);
            }
            Err(e) => {
                error!("Dropping {} byte batch: {}", len, e);
                self.stats.batch_dropped();
            }
        }
        buffer.clear();
    }

    /// Append one frame record, flushing the current batch first if the record does not fit.
    ///
    /// Blocks the calling capture thread for the duration of a flush.
    pub fn write(&self, interface: &str, capture_time: u32, data: &[u8]) -> Result<(), DispatchError> {
        if interface.as_bytes().contains(&0) {
            return Err(DispatchError::InvalidInterfaceName(interface.to_string()));
        }

        let size = record_len(interface, data.len());
        let mut inner = self.lock();

        let capacity = inner.buffer.capacity();
        if SYSTEM_ID_LEN + size > capacity {
            self.stats.oversized_record();
            warn!(
                "Dropping {} byte record from {}: exceeds {} byte batch",
                size, interface, capacity
            );
            return Err(DispatchError::RecordTooLarge { size, capacity });
        }

        if !inner.buffer.can_write(size) {
            self.flush_locked(&mut inner);
        }

        if inner.buffer.is_empty() {
            inner.buffer.write(self.system_id.as_bytes());
        }

        let timestamp: [u8; TIMESTAMP_LEN] = capture_time.to_be_bytes();
        let written = inner
            .buffer
            .write_parts(&[interface.as_bytes(), &[0], &timestamp, data]);
        debug_assert!(written, "record must fit after flush");

        self.stats.record_written();
        Ok(())
    }

    /// Send whatever is buffered now.
    pub fn flush(&self) {
        let mut inner = self.lock();
        self.flush_locked(&mut inner);
    }

    /// Bytes currently buffered.
    pub fn pending(&self) -> usize {
        self.lock().buffer.len()
    }

    pub fn stats(&self) -> DispatchSnapshot {
        self.stats.snapshot()
    }

    /// Release the buffer and the transmitter. Buffered records are discarded.
    pub fn finalize(self) -> S {
        let inner = self.inner.into_inner().unwrap_or_else(PoisonError::into_inner);
        if !inner.buffer.is_empty() {
            debug!("Discarding {} buffered bytes", inner.buffer.len());
        }
        debug!("Dispatcher finished ({})", self.stats.snapshot());
        inner.sink
    }
}
