use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Lifecycle errors.
///
/// Anything that happens to a running process is folded into the runner's
/// `Failed` state using this type's `Display`; `NotFound`, `Static` and
/// `External` are purely caller errors.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("app not found: {0}")]
    NotFound(String),

    #[error("{0} serves static files and has no process")]
    Static(String),

    #[error("{app} forwards to port {port} and has no process")]
    External { app: String, port: u16 },

    #[error("failed to launch `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("not ready after {}s ({waiting_for})", timeout.as_secs())]
    ReadinessTimeout {
        timeout: Duration,
        waiting_for: String,
    },

    #[error("process exited with {0}")]
    Crash(String),

    #[error("process did not stop within {}ms and was killed", grace.as_millis())]
    StopTimeout { grace: Duration },

    #[error("no free ports available in range {start}-{end}")]
    NoFreePort { start: u16, end: u16 },
}

impl SupervisorError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, SupervisorError::NotFound(_))
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {0}: {1}")]
    FileRead(PathBuf, std::io::Error),

    #[error("Failed to parse TOML in {0}: {1}")]
    TomlParse(PathBuf, toml::de::Error),

    #[error("Validation error in {0}: {1}")]
    Validation(PathBuf, String),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
