//! Readiness probing - decides when a starting service counts as running
//!
//! A service is ready when its port accepts TCP connections, or, if it
//! declares a `ready_pattern`, when that text shows up in its output. The
//! probe itself never times out; callers bound it and drop the future to
//! abandon it.

use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::timeout;

/// What a probe waits for
#[derive(Debug, Clone)]
pub enum ReadinessCheck {
    /// The port accepts a connection on 127.0.0.1
    Port(u16),
    /// Output capture saw the pattern and fired `matched`
    Pattern {
        pattern: String,
        matched: Arc<Notify>,
    },
}

/// Output-side half of a pattern check, handed to the log pumps
#[derive(Debug, Clone)]
pub struct ReadySignal {
    pattern: String,
    matched: Arc<Notify>,
}

impl ReadySignal {
    pub fn new(pattern: impl Into<String>, matched: Arc<Notify>) -> Self {
        Self {
            pattern: pattern.into(),
            matched,
        }
    }

    /// Fire once the (ANSI-stripped) line contains the pattern.
    pub fn observe(&self, line: &str) -> bool {
        if crate::logs::strip_ansi(line).contains(&self.pattern) {
            self.matched.notify_one();
            return true;
        }
        false
    }
}

pub struct ReadinessProbe {
    check: ReadinessCheck,
    interval: Duration,
    connect_timeout: Duration,
}

impl ReadinessProbe {
    pub fn new(check: ReadinessCheck, interval: Duration) -> Self {
        Self {
            check,
            interval,
            connect_timeout: crate::defaults::PROBE_CONNECT_TIMEOUT,
        }
    }

    pub fn describe(&self) -> String {
        match &self.check {
            ReadinessCheck::Port(port) => format!("waiting for port {port}"),
            ReadinessCheck::Pattern { pattern, .. } => {
                format!("waiting for output matching `{pattern}`")
            }
        }
    }

    /// Resolve once the service is ready.
    pub async fn ready(&self) {
        match &self.check {
            ReadinessCheck::Pattern { matched, .. } => matched.notified().await,
            ReadinessCheck::Port(port) => {
                let mut attempts: u32 = 0;
                loop {
                    if port_accepts(*port, self.connect_timeout).await {
                        return;
                    }
                    attempts += 1;
                    if attempts % 25 == 0 {
                        tracing::debug!(port = *port, attempts, "Still waiting for port");
                    }
                    tokio::time::sleep(self.interval).await;
                }
            }
        }
    }
}

pub async fn port_accepts(port: u16, connect_timeout: Duration) -> bool {
    matches!(
        timeout(connect_timeout, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}
