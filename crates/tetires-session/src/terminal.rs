//! Passthrough log
//!
//! Everything the operator would see on the terminal screen: records that
//! are not part of a scan, `SYSTEM:` status lines, `SENT:` commands and the
//! session's own progress lines. Entries are stamped `[HH:MM:SS]`.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Local};
use parking_lot::Mutex;

use crate::config::DEFAULT_LOG_CAPACITY;

struct Inner {
    lines: VecDeque<String>,
    capacity: usize,
    last_cleared: Option<Vec<String>>,
}

/// Shared, bounded log; clones refer to the same log
#[derive(Clone)]
pub struct TerminalLog {
    inner: Arc<Mutex<Inner>>,
}

impl Default for TerminalLog {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl TerminalLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                lines: VecDeque::with_capacity(capacity.min(DEFAULT_LOG_CAPACITY)),
                capacity: capacity.max(1),
                last_cleared: None,
            })),
        }
    }

    pub fn append(&self, text: &str) {
        self.append_at(text, Local::now());
    }

    /// Multi-line text becomes one entry per line, all with the same stamp
    pub fn append_at(&self, text: &str, at: DateTime<Local>) {
        let stamp = at.format("%H:%M:%S");
        let mut inner = self.inner.lock();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            inner.lines.push_back(format!("[{}] {}", stamp, line));
        }
        while inner.lines.len() > inner.capacity {
            inner.lines.pop_front();
        }
    }

    pub fn system(&self, status: &str) {
        self.append(&format!("SYSTEM: {}", status));
    }

    pub fn sent(&self, command: &str) {
        self.append(&format!("SENT: {}", command));
    }

    pub fn lines(&self) -> Vec<String> {
        self.inner.lock().lines.iter().cloned().collect()
    }

    /// The last `n` entries, oldest first
    pub fn tail(&self, n: usize) -> Vec<String> {
        let inner = self.inner.lock();
        let skip = inner.lines.len().saturating_sub(n);
        inner.lines.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empty the log, keeping its content for one [`restore_last`](Self::restore_last)
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        if inner.lines.is_empty() {
            return;
        }
        let cleared = inner.lines.drain(..).collect();
        inner.last_cleared = Some(cleared);
    }

    /// Bring back what the last `clear` removed; returns false if there is nothing
    pub fn restore_last(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.last_cleared.take() {
            Some(lines) => {
                inner.lines = lines.into();
                true
            }
            None => false,
        }
    }
}
