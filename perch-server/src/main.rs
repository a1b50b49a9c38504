mod analyze;
mod api;
mod broadcast;
mod defaults;
mod desktop;
mod error;
mod idle;
mod instances;
mod logs;
mod registry;
mod settings;
mod supervisor;
mod theme;

use crate::api::ApiState;
use crate::broadcast::EventBroadcaster;
use crate::idle::{IdleConfig, IdleMonitor};
use crate::instances::LaunchOptions;
use crate::registry::{AppRegistry, ConfigWatcher, WatcherHandle};
use crate::settings::Settings;
use crate::supervisor::{Supervisor, SupervisorConfig, UrlScheme};
use crate::theme::ThemeState;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// Perch - local development supervisor
#[derive(Parser)]
#[command(name = "perch-server")]
#[command(version)]
#[command(about = "Perch - supervises local dev servers and serves the dashboard API")]
pub struct Args {
    /// Directory holding app definitions, config.toml and the saved theme
    #[arg(long, env = "PERCH_CONFIG_DIR")]
    pub config_dir: Option<PathBuf>,

    /// Address for the HTTP API
    #[arg(long, env = "PERCH_LISTEN", default_value = defaults::DEFAULT_LISTEN)]
    pub listen: String,

    /// Top-level domain used in app URLs (overrides config.toml)
    #[arg(long, env = "PERCH_TLD")]
    pub tld: Option<String>,

    /// Port used in app URLs (overrides config.toml)
    #[arg(long, env = "PERCH_URL_PORT")]
    pub url_port: Option<u16>,

    /// Lines of output kept per service
    #[arg(long, env = "PERCH_LOG_LINES", default_value_t = defaults::LOG_CAPACITY)]
    pub log_lines: usize,

    /// How long a process may take to become ready
    #[arg(long, env = "PERCH_READINESS_TIMEOUT_SECS", default_value_t = defaults::READINESS_TIMEOUT.as_secs())]
    pub readiness_timeout_secs: u64,

    /// Grace period between SIGTERM and SIGKILL on stop
    #[arg(long, env = "PERCH_STOP_GRACE_MS", default_value_t = defaults::STOP_GRACE_PERIOD.as_millis() as u64)]
    pub stop_grace_ms: u64,

    /// Don't watch the config directory for changes
    #[arg(long, env = "PERCH_NO_WATCH")]
    pub no_watch: bool,
}

fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(registry::home_dir)
        .join("perch")
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let config_dir = args.config_dir.clone().unwrap_or_else(default_config_dir);
    std::fs::create_dir_all(&config_dir)?;

    let settings = Settings::load(&config_dir);
    let tld = args
        .tld
        .clone()
        .or_else(|| settings.tld.clone())
        .unwrap_or_else(|| defaults::DEFAULT_TLD.to_string());
    let url_port = args
        .url_port
        .or(settings.url_port)
        .unwrap_or(defaults::DEFAULT_URL_PORT);

    tracing::info!("Perch v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Config directory: {}", config_dir.display());

    let supervisor_config = SupervisorConfig {
        launch: LaunchOptions {
            readiness_timeout: Duration::from_secs(args.readiness_timeout_secs),
            stop_grace: Duration::from_millis(args.stop_grace_ms),
            ..LaunchOptions::default()
        },
        urls: UrlScheme::new(tld, url_port),
        log_capacity: args.log_lines.max(1),
        ..SupervisorConfig::default()
    };

    let registry = Arc::new(AppRegistry::load(&config_dir));
    tracing::info!("Loaded {} app(s)", registry.all().len());

    let (runner_tx, runner_rx) = mpsc::channel(defaults::RUNNER_EVENT_BUFFER);
    let supervisor = Arc::new(Supervisor::new(registry, supervisor_config, runner_tx));
    let broadcaster = EventBroadcaster::new(defaults::SUBSCRIBER_BUFFER);

    tokio::spawn(broadcast::run_fanout(
        broadcaster.clone(),
        supervisor.clone(),
        runner_rx,
        defaults::STATUS_REFRESH_INTERVAL,
    ));

    let _watcher = if args.no_watch {
        None
    } else {
        spawn_config_watcher(&config_dir, supervisor.clone(), broadcaster.clone())
    };

    tokio::spawn(IdleMonitor::new(IdleConfig::default(), supervisor.clone()).run());

    let state = Arc::new(ApiState {
        supervisor: supervisor.clone(),
        broadcaster,
        theme: ThemeState::load(&config_dir),
        analyzer: Arc::from(analyze::from_settings(&settings.analyzer)),
        config_dir,
    });

    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    tracing::info!("Listening on http://{}", listener.local_addr()?);

    let served = axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    tracing::info!("Stopping all apps");
    supervisor.stop_all().await;
    served?;
    Ok(())
}

/// Reload on config changes. Returns the handle that keeps the watcher
/// alive, or `None` if watching could not start.
fn spawn_config_watcher(
    config_dir: &std::path::Path,
    supervisor: Arc<Supervisor>,
    broadcaster: EventBroadcaster,
) -> Option<WatcherHandle> {
    let (changed_tx, mut changed_rx) = mpsc::channel(16);
    let watcher = ConfigWatcher::new(config_dir.to_path_buf(), defaults::CONFIG_DEBOUNCE, changed_tx);
    let handle = match watcher.start() {
        Ok(handle) => handle,
        Err(e) => {
            tracing::warn!("Config watching disabled: {}", e);
            return None;
        }
    };

    tokio::spawn(async move {
        while changed_rx.recv().await.is_some() {
            while changed_rx.try_recv().is_ok() {}
            let diff = supervisor.reload().await;
            if !diff.is_empty() {
                tracing::info!(
                    added = diff.added.len(),
                    removed = diff.removed.len(),
                    changed = diff.changed.len(),
                    updated = diff.updated.len(),
                    "Config reloaded"
                );
            }
            broadcaster.publish_snapshot(&supervisor);
        }
    });
    Some(handle)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("Shutting down");
}
