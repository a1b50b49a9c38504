//! Perch dashboard protocol types
//!
//! These types are shared between the daemon and its clients. Field names
//! follow what the dashboard reads (`errorLines`, `type`, optional fields
//! omitted when empty).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Lifecycle status of a supervised service (or an app, aggregated)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Idle,
    Starting,
    Running,
    Failed,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Idle => "idle",
            Status::Starting => "starting",
            Status::Running => "running",
            Status::Failed => "failed",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of one service together with the fields that only exist in that status.
///
/// `port` is known while starting or running, `uptime` only while running and
/// `error` only when failed. Views are built from this so the optional JSON
/// fields can never disagree with the status flags.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StatusDetail {
    #[default]
    Idle,
    Starting {
        port: u16,
    },
    Running {
        port: u16,
        uptime: Duration,
    },
    Failed {
        error: String,
    },
}

impl StatusDetail {
    pub fn status(&self) -> Status {
        match self {
            StatusDetail::Idle => Status::Idle,
            StatusDetail::Starting { .. } => Status::Starting,
            StatusDetail::Running { .. } => Status::Running,
            StatusDetail::Failed { .. } => Status::Failed,
        }
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            StatusDetail::Starting { port } | StatusDetail::Running { port, .. } => Some(*port),
            _ => None,
        }
    }

    pub fn uptime(&self) -> Option<Duration> {
        match self {
            StatusDetail::Running { uptime, .. } => Some(*uptime),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            StatusDetail::Failed { error } => Some(error),
            _ => None,
        }
    }
}

/// The three mutually exclusive booleans the dashboard renders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusFlags {
    pub running: bool,
    pub starting: bool,
    pub failed: bool,
}

impl From<Status> for StatusFlags {
    fn from(status: Status) -> Self {
        Self {
            running: status == Status::Running,
            starting: status == Status::Starting,
            failed: status == Status::Failed,
        }
    }
}

/// Combine service statuses into the app-level status.
///
/// Failure wins over starting, starting wins over running, so at most one
/// flag is ever set on the app.
pub fn aggregate_status<I>(statuses: I) -> Status
where
    I: IntoIterator<Item = Status>,
{
    let mut any_running = false;
    let mut any_starting = false;
    for status in statuses {
        match status {
            Status::Failed => return Status::Failed,
            Status::Starting => any_starting = true,
            Status::Running => any_running = true,
            Status::Idle => {}
        }
    }
    if any_starting {
        Status::Starting
    } else if any_running {
        Status::Running
    } else {
        Status::Idle
    }
}

/// Render a duration the way the dashboard shows uptimes (`42s`, `3m7s`, `2h0m5s`).
pub fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h{m}m{s}s")
    } else if m > 0 {
        format!("{m}m{s}s")
    } else {
        format!("{s}s")
    }
}

/// How an app is served
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppKind {
    /// One or more supervised processes
    Process,
    /// A static file root; no process, no status
    Static,
    /// Forwards to a port something else listens on
    Port,
}

/// One service of an app as the dashboard sees it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceView {
    pub name: String,
    pub running: bool,
    pub starting: bool,
    pub failed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime: Option<String>,
    pub url: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub default: bool,
}

impl ServiceView {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        default: bool,
        detail: &StatusDetail,
    ) -> Self {
        let flags = StatusFlags::from(detail.status());
        Self {
            name: name.into(),
            running: flags.running,
            starting: flags.starting,
            failed: flags.failed,
            error: detail.error().map(str::to_string),
            port: detail.port(),
            uptime: detail.uptime().map(format_uptime),
            url: url.into(),
            default,
        }
    }

    pub fn status(&self) -> Status {
        if self.failed {
            Status::Failed
        } else if self.starting {
            Status::Starting
        } else if self.running {
            Status::Running
        } else {
            Status::Idle
        }
    }
}

/// One configured app as the dashboard sees it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppView {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    #[serde(rename = "type")]
    pub kind: AppKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime: Option<String>,
    pub running: bool,
    pub starting: bool,
    pub failed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ServiceView>,
}

impl AppView {
    fn base(name: impl Into<String>, url: impl Into<String>, kind: AppKind) -> Self {
        Self {
            name: name.into(),
            description: None,
            aliases: Vec::new(),
            kind,
            port: None,
            url: url.into(),
            uptime: None,
            running: false,
            starting: false,
            failed: false,
            error: None,
            services: Vec::new(),
        }
    }

    /// A static app; status fields stay unset and the dashboard shows a placeholder.
    pub fn static_site(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::base(name, url, AppKind::Static)
    }

    /// An app served by a process perch doesn't own; always reported running.
    pub fn port_proxy(name: impl Into<String>, url: impl Into<String>, port: u16) -> Self {
        let mut view = Self::base(name, url, AppKind::Port);
        view.running = true;
        view.port = Some(port);
        view
    }

    /// A bare single-process app; its only service is implicit.
    pub fn single(name: impl Into<String>, url: impl Into<String>, detail: &StatusDetail) -> Self {
        let mut view = Self::base(name, url, AppKind::Process);
        let flags = StatusFlags::from(detail.status());
        view.running = flags.running;
        view.starting = flags.starting;
        view.failed = flags.failed;
        view.error = detail.error().map(str::to_string);
        view.port = detail.port();
        view.uptime = detail.uptime().map(format_uptime);
        view
    }

    /// A multi-service app; app-level flags are derived from the services.
    pub fn grouped(
        name: impl Into<String>,
        url: impl Into<String>,
        services: Vec<ServiceView>,
    ) -> Self {
        let mut view = Self::base(name, url, AppKind::Process);
        let flags = StatusFlags::from(aggregate_status(services.iter().map(ServiceView::status)));
        view.running = flags.running;
        view.starting = flags.starting;
        view.failed = flags.failed;
        view.error = services
            .iter()
            .find(|s| s.failed)
            .and_then(|s| s.error.as_ref().map(|e| format!("{}: {}", s.name, e)));
        view.services = services;
        view
    }

    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description;
        self
    }

    pub fn with_aliases(mut self, aliases: Vec<String>) -> Self {
        self.aliases = aliases;
        self
    }

    /// App-level status, `None` for static apps.
    pub fn status(&self) -> Option<Status> {
        if self.kind == AppKind::Static {
            return None;
        }
        Some(if self.failed {
            Status::Failed
        } else if self.starting {
            Status::Starting
        } else if self.running {
            Status::Running
        } else {
            Status::Idle
        })
    }
}

/// Dashboard colour scheme, shared by every connected client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    System,
    Light,
    Dark,
}

impl Theme {
    pub fn as_str(self) -> &'static str {
        match self {
            Theme::System => "system",
            Theme::Light => "light",
            Theme::Dark => "dark",
        }
    }
}

impl fmt::Display for Theme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid theme: {0}")]
pub struct UnknownTheme(pub String);

impl FromStr for Theme {
    type Err = UnknownTheme;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "system" => Ok(Theme::System),
            "light" => Ok(Theme::Light),
            "dark" => Ok(Theme::Dark),
            other => Err(UnknownTheme(other.to_string())),
        }
    }
}

/// Typed events pushed next to snapshots
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Theme { theme: Theme },
}

/// One server-sent event payload.
///
/// Serializes either as a bare JSON array (full app list) or as an object
/// carrying a `type` tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StreamMessage {
    Snapshot(Vec<AppView>),
    Event(ServerEvent),
}

impl StreamMessage {
    pub fn theme(theme: Theme) -> Self {
        Self::Event(ServerEvent::Theme { theme })
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "null".to_string())
    }
}

/// Reply of `GET /api/app-status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppStatusReply {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AppStatusReply {
    pub fn idle() -> Self {
        Self {
            status: Status::Idle,
            error: None,
        }
    }
}

impl From<&StatusDetail> for AppStatusReply {
    fn from(detail: &StatusDetail) -> Self {
        Self {
            status: detail.status(),
            error: detail.error().map(str::to_string),
        }
    }
}

/// Reply of `GET /api/analyze-logs`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyzeReply {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(
        rename = "errorLines",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub error_lines: Option<Vec<usize>>,
}

impl AnalyzeReply {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            error: None,
            error_lines: None,
        }
    }

    pub fn lines(error_lines: Vec<usize>) -> Self {
        Self {
            enabled: true,
            error: None,
            error_lines: Some(error_lines),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            enabled: true,
            error: Some(error.into()),
            error_lines: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThemeRequest {
    pub theme: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThemeReply {
    pub theme: Theme,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigPathReply {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnabledReply {
    pub enabled: bool,
}
