//! Live task counters
//!
//! Reader tasks and reconnect loops hold a [`GaugeGuard`] for as long as they
//! run, so "at most one alive" can be checked from outside.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct TaskGauge {
    live: Arc<AtomicUsize>,
}

impl TaskGauge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one task as alive until the guard is dropped
    pub fn enter(&self) -> GaugeGuard {
        self.live.fetch_add(1, Ordering::SeqCst);
        GaugeGuard {
            live: self.live.clone(),
        }
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct GaugeGuard {
    live: Arc<AtomicUsize>,
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}
