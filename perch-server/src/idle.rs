//! Idle timeout management - stops apps nobody has touched for a while

use crate::supervisor::Supervisor;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};

/// Configuration for idle checks
#[derive(Debug, Clone)]
pub struct IdleConfig {
    /// How often to look for idle apps
    pub check_interval: Duration,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            check_interval: crate::defaults::IDLE_CHECK_INTERVAL,
        }
    }
}

/// Stops apps whose `idle_timeout_secs` elapsed without API activity
pub struct IdleMonitor {
    config: IdleConfig,
    supervisor: Arc<Supervisor>,
}

impl IdleMonitor {
    pub fn new(config: IdleConfig, supervisor: Arc<Supervisor>) -> Self {
        Self { config, supervisor }
    }

    /// One pass; returns the apps that were stopped.
    pub async fn sweep(&self) -> Vec<String> {
        let mut stopped = Vec::new();
        for app in self.supervisor.idle_candidates() {
            tracing::info!(app = %app, "Stopping idle app");
            match self.supervisor.stop(&app).await {
                Ok(()) => stopped.push(app),
                Err(e) => tracing::warn!(app = %app, "Idle stop failed: {}", e),
            }
        }
        stopped
    }

    pub async fn run(self) {
        let mut ticker = interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.sweep().await;
        }
    }
}
