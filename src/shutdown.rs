//! Cooperative shutdown token.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A cloneable "keep running" signal polled by capture threads.
///
/// A child signal stops when either it or its parent is cancelled, which lets
/// the sniffer tear down its own thread group without touching the process-wide
/// signal.
#[derive(Debug, Clone)]
pub struct RunSignal {
    running: Arc<AtomicBool>,
    parent: Option<Arc<AtomicBool>>,
}

impl RunSignal {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
            parent: None,
        }
    }

    /// Derive a signal that also observes this one.
    pub fn child(&self) -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
            parent: Some(self.running.clone()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
            && self
                .parent
                .as_ref()
                .map_or(true, |parent| parent.load(Ordering::SeqCst))
    }

    pub fn cancel(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

impl Default for RunSignal {
    fn default() -> Self {
        Self::new()
    }
}
