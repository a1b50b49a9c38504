//! Bounded per-service log retention
//!
//! Lines are stored verbatim (ANSI escapes included); colouring is the
//! dashboard's job. Each buffer is a FIFO ring: once full, the oldest line is
//! evicted for every new one.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Ordered, bounded log lines for one service
#[derive(Debug)]
pub struct LogBuffer {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    /// Append one line. Trailing `\r`/`\n` are trimmed; empty lines are kept
    /// out so the buffer is not flooded by blank output.
    pub fn push(&self, line: impl Into<String>) {
        let mut line = line.into();
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        if line.is_empty() {
            return;
        }

        let mut lines = self.lines.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Snapshot of every retained line, oldest first
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.lines.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Remove ANSI escape sequences (CSI and OSC) from a line.
pub fn strip_ansi(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\x1b' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('[') => {
                chars.next();
                // parameters and intermediates, then one final byte in @..~
                for c in chars.by_ref() {
                    if ('@'..='~').contains(&c) {
                        break;
                    }
                }
            }
            Some(']') => {
                chars.next();
                while let Some(c) = chars.next() {
                    if c == '\x07' {
                        break;
                    }
                    if c == '\x1b' && chars.peek() == Some(&'\\') {
                        chars.next();
                        break;
                    }
                }
            }
            Some(_) => {
                chars.next();
            }
            None => {}
        }
    }
    out
}

/// All log buffers, keyed by `(app, service)`. A single-process app uses
/// its own name as the service name.
pub struct LogStore {
    buffers: DashMap<(String, String), Arc<LogBuffer>>,
    capacity: usize,
}

fn key(app: &str, service: &str) -> (String, String) {
    (app.to_string(), service.to_string())
}

impl LogStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffers: DashMap::new(),
            capacity,
        }
    }

    /// Get (or lazily create) the buffer a service's runner writes to.
    pub fn buffer(&self, app: &str, service: &str) -> Arc<LogBuffer> {
        self.buffers
            .entry(key(app, service))
            .or_insert_with(|| Arc::new(LogBuffer::new(self.capacity)))
            .clone()
    }

    pub fn read(&self, app: &str, service: &str) -> Vec<String> {
        self.buffers
            .get(&key(app, service))
            .map(|b| b.lines())
            .unwrap_or_default()
    }

    pub fn clear(&self, app: &str, service: &str) {
        if let Some(buffer) = self.buffers.get(&key(app, service)) {
            buffer.clear();
        }
    }

    /// Drop every buffer of an app (it was removed from config).
    pub fn remove_app(&self, app: &str) {
        self.buffers.retain(|(owner, _), _| owner != app);
    }
}
