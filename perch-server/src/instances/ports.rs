//! Dynamic port assignment for services without a fixed port

use crate::error::SupervisorError;
use parking_lot::Mutex;
use std::net::TcpListener;
use std::ops::Range;
use std::time::{SystemTime, UNIX_EPOCH};

/// Hands out ports from a range, round-robin, skipping ones that can't be bound.
///
/// The cursor starts at a time-seeded offset so a restarted daemon doesn't
/// collide with processes orphaned by a previous run.
pub struct PortAllocator {
    range: Range<u16>,
    next: Mutex<u16>,
}

impl PortAllocator {
    pub fn new(range: Range<u16>) -> Self {
        let width = range.end.saturating_sub(range.start).max(1) as u128;
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let start = range.start + (seed % width) as u16;
        Self::starting_at(range, start)
    }

    pub fn starting_at(range: Range<u16>, start: u16) -> Self {
        let start = if range.contains(&start) {
            start
        } else {
            range.start
        };
        Self {
            range,
            next: Mutex::new(start),
        }
    }

    pub fn allocate(&self) -> Result<u16, SupervisorError> {
        let mut next = self.next.lock();
        let width = self.range.end.saturating_sub(self.range.start);
        for _ in 0..width {
            let port = *next;
            *next = if port + 1 >= self.range.end {
                self.range.start
            } else {
                port + 1
            };
            if port_is_free(port) {
                return Ok(port);
            }
        }
        Err(SupervisorError::NoFreePort {
            start: self.range.start,
            end: self.range.end,
        })
    }
}

pub fn port_is_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}
