//! Supervisor - the single entry point for app lifecycle operations
//!
//! Names are resolved (app name, alias, or `<service>-<app>` address) before
//! anything else. Every mutating operation on an app holds that app's lock,
//! so a restart can never interleave with a stop of the same app while
//! different apps proceed independently.

use crate::defaults::{DEFAULT_TLD, DEFAULT_URL_PORT, LOG_CAPACITY, PORT_RANGE};
use crate::error::SupervisorError;
use crate::instances::{
    GroupMember, LaunchOptions, PortAllocator, ProcessRunner, RunnerEvent, ServiceGroup,
    ServiceSpec,
};
use crate::logs::LogStore;
use crate::registry::{AppDefinition, AppLayout, AppRegistry, RegistryDiff, service_address};
use dashmap::DashMap;
use futures_util::future::join_all;
use perch_core::{AppStatusReply, AppView, ServiceView, Status, StatusDetail};
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};

/// How app URLs are built
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlScheme {
    pub tld: String,
    pub port: u16,
}

impl UrlScheme {
    pub fn new(tld: impl Into<String>, port: u16) -> Self {
        let tld = tld.into();
        Self {
            tld: tld.trim_matches('.').to_string(),
            port,
        }
    }

    pub fn url_for(&self, host: &str) -> String {
        if self.port == 80 {
            format!("http://{host}.{}", self.tld)
        } else {
            format!("http://{host}.{}:{}", self.tld, self.port)
        }
    }
}

impl Default for UrlScheme {
    fn default() -> Self {
        Self::new(DEFAULT_TLD, DEFAULT_URL_PORT)
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub launch: LaunchOptions,
    pub urls: UrlScheme,
    pub log_capacity: usize,
    pub port_range: Range<u16>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            launch: LaunchOptions::default(),
            urls: UrlScheme::default(),
            log_capacity: LOG_CAPACITY,
            port_range: PORT_RANGE,
        }
    }
}

/// A resolved name
#[derive(Debug, Clone)]
pub enum Target {
    App(Arc<AppDefinition>),
    Service {
        app: Arc<AppDefinition>,
        service: String,
    },
}

impl Target {
    pub fn app(&self) -> &Arc<AppDefinition> {
        match self {
            Target::App(app) | Target::Service { app, .. } => app,
        }
    }
}

/// What the terminal integration needs to know about an app
#[derive(Debug, Clone)]
pub struct Focus {
    pub app: String,
    pub dir: PathBuf,
    pub config_path: PathBuf,
    pub logs: Vec<String>,
}

pub struct Supervisor {
    registry: Arc<AppRegistry>,
    groups: DashMap<String, Arc<ServiceGroup>>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    logs: LogStore,
    ports: Arc<PortAllocator>,
    config: SupervisorConfig,
    events: mpsc::Sender<RunnerEvent>,
}

impl Supervisor {
    pub fn new(
        registry: Arc<AppRegistry>,
        config: SupervisorConfig,
        events: mpsc::Sender<RunnerEvent>,
    ) -> Self {
        let supervisor = Self {
            registry,
            groups: DashMap::new(),
            locks: DashMap::new(),
            logs: LogStore::new(config.log_capacity),
            ports: Arc::new(PortAllocator::new(config.port_range.clone())),
            config,
            events,
        };
        for app in supervisor.registry.all() {
            if let Some(group) = supervisor.build_group(&app) {
                supervisor.groups.insert(app.name.clone(), group);
            }
        }
        supervisor
    }

    fn build_group(&self, app: &AppDefinition) -> Option<Arc<ServiceGroup>> {
        let members = match &app.layout {
            AppLayout::Static { .. } | AppLayout::Port(_) => return None,
            AppLayout::Single(spec) => vec![GroupMember {
                service: app.name.clone(),
                default: true,
                depends_on: Vec::new(),
                runner: self.runner(&app.name, &app.name, &app.name, spec.clone()),
            }],
            AppLayout::Services(services) => services
                .iter()
                .map(|s| GroupMember {
                    service: s.name.clone(),
                    default: s.default,
                    depends_on: s.depends_on.clone(),
                    runner: self.runner(
                        &app.name,
                        &s.name,
                        &service_address(&app.name, &s.name),
                        s.spec.clone(),
                    ),
                })
                .collect(),
        };
        let implicit = matches!(app.layout, AppLayout::Single(_));
        Some(Arc::new(ServiceGroup::new(
            app.name.clone(),
            implicit,
            members,
            app.idle_timeout,
        )))
    }

    fn runner(&self, app: &str, service: &str, key: &str, spec: ServiceSpec) -> Arc<ProcessRunner> {
        Arc::new(ProcessRunner::new(
            key,
            spec,
            self.logs.buffer(app, service),
            self.config.launch.clone(),
            self.ports.clone(),
            self.events.clone(),
        ))
    }

    /// Resolve an app name, alias or `<service>-<app>` address.
    pub fn resolve(&self, name: &str) -> Result<Target, SupervisorError> {
        let name = name.trim();
        if let Some(app) = self.registry.resolve(name) {
            return Ok(Target::App(app));
        }
        for app in self.registry.all() {
            if let AppLayout::Services(services) = &app.layout {
                if let Some(s) = services
                    .iter()
                    .find(|s| service_address(&app.name, &s.name) == name)
                {
                    let service = s.name.clone();
                    return Ok(Target::Service { app, service });
                }
            }
        }
        Err(SupervisorError::NotFound(name.to_string()))
    }

    fn app_lock(&self, app: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(app.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    fn group(&self, app: &AppDefinition) -> Result<Arc<ServiceGroup>, SupervisorError> {
        match app.layout {
            AppLayout::Static { .. } => return Err(SupervisorError::Static(app.name.clone())),
            AppLayout::Port(port) => {
                return Err(SupervisorError::External {
                    app: app.name.clone(),
                    port,
                });
            }
            _ => {}
        }
        self.groups
            .get(&app.name)
            .map(|g| g.value().clone())
            .ok_or_else(|| SupervisorError::NotFound(app.name.clone()))
    }

    pub async fn start(&self, name: &str) -> Result<(), SupervisorError> {
        let target = self.resolve(name)?;
        let lock = self.app_lock(&target.app().name);
        let _guard = lock.lock().await;
        let group = self.group(target.app())?;

        match &target {
            Target::App(app) => {
                tracing::info!(app = %app.name, "Start requested");
                group.start_all().await
            }
            Target::Service { app, service } => {
                tracing::info!(app = %app.name, service = %service, "Start requested");
                group.start_service(service).await
            }
        }
    }

    /// Stop an app (every service, dependents first) or one service.
    /// A failed target ends up idle with its error cleared.
    pub async fn stop(&self, name: &str) -> Result<(), SupervisorError> {
        let target = self.resolve(name)?;
        let lock = self.app_lock(&target.app().name);
        let _guard = lock.lock().await;
        let group = self.group(target.app())?;

        match &target {
            Target::App(app) => {
                tracing::info!(app = %app.name, "Stop requested");
                group.stop_all().await;
            }
            Target::Service { app, service } => {
                tracing::info!(app = %app.name, service = %service, "Stop requested");
                if let Some(member) = group.member(service) {
                    member.runner.stop().await;
                }
            }
        }
        Ok(())
    }

    pub async fn restart(&self, name: &str) -> Result<(), SupervisorError> {
        let target = self.resolve(name)?;
        let lock = self.app_lock(&target.app().name);
        let _guard = lock.lock().await;
        let group = self.group(target.app())?;

        match &target {
            Target::App(app) => {
                tracing::info!(app = %app.name, "Restart requested");
                group.restart_all().await
            }
            Target::Service { app, service } => {
                tracing::info!(app = %app.name, service = %service, "Restart requested");
                group.restart_service(service).await
            }
        }
    }

    /// Drop failure state without touching anything that is running.
    pub async fn clear(&self, name: &str) -> Result<bool, SupervisorError> {
        let target = self.resolve(name)?;
        let lock = self.app_lock(&target.app().name);
        let _guard = lock.lock().await;
        let group = self.group(target.app())?;

        Ok(match &target {
            Target::App(_) => group.clear_failures(),
            Target::Service { service, .. } => group
                .member(service)
                .is_some_and(|m| m.runner.clear_failure()),
        })
    }

    pub fn clear_logs(&self, name: &str) -> Result<(), SupervisorError> {
        let target = self.resolve(name)?;
        let app = &target.app().name;
        for service in self.log_services(&target) {
            self.logs.clear(app, &service);
        }
        Ok(())
    }

    /// Services whose logs a target covers, in group order.
    fn log_services(&self, target: &Target) -> Vec<String> {
        let Ok(group) = self.group(target.app()) else {
            return Vec::new();
        };
        match target {
            Target::App(_) => group.members().iter().map(|m| m.service.clone()).collect(),
            Target::Service { service, .. } => group
                .member(service)
                .map(|m| vec![m.service.clone()])
                .unwrap_or_default(),
        }
    }

    /// Log lines for an app or service. Multi-service apps get every
    /// service's lines, each prefixed with `[<service>] `.
    pub fn logs(&self, name: &str) -> Result<Vec<String>, SupervisorError> {
        let target = self.resolve(name)?;
        let Ok(group) = self.group(target.app()) else {
            return Ok(Vec::new());
        };
        group.touch();

        let app = &target.app().name;
        let services = self.log_services(&target);
        let lines = match &target {
            Target::App(_) if !group.is_implicit() => services
                .iter()
                .flat_map(|service| {
                    let prefix = format!("[{service}] ");
                    self.logs
                        .read(app, service)
                        .into_iter()
                        .map(move |line| format!("{prefix}{line}"))
                })
                .collect(),
            _ => services
                .iter()
                .flat_map(|service| self.logs.read(app, service))
                .collect(),
        };
        Ok(lines)
    }

    /// Status for polling clients. Unknown names read as idle; static and
    /// port apps are always being served.
    pub fn app_status(&self, name: &str) -> AppStatusReply {
        let Ok(target) = self.resolve(name) else {
            return AppStatusReply::idle();
        };
        if !target.app().is_supervised() {
            return AppStatusReply {
                status: Status::Running,
                error: None,
            };
        }
        let Ok(group) = self.group(target.app()) else {
            return AppStatusReply::idle();
        };
        group.touch();

        match &target {
            Target::App(_) => group.status_reply(),
            Target::Service { service, .. } => group.service_status_reply(service),
        }
    }

    /// Every visible app. Reads runner state only; no app lock is taken.
    pub fn snapshot(&self) -> Vec<AppView> {
        self.registry
            .all()
            .iter()
            .filter(|app| !app.hidden)
            .map(|app| self.view(app))
            .collect()
    }

    fn view(&self, app: &AppDefinition) -> AppView {
        let url = self.config.urls.url_for(&app.name);
        let group = self.groups.get(&app.name).map(|g| g.value().clone());

        let view = match (&app.layout, group) {
            (AppLayout::Static { .. }, _) => AppView::static_site(&app.name, url),
            (AppLayout::Port(port), _) => AppView::port_proxy(&app.name, url, *port),
            (_, None) => AppView::single(&app.name, url, &StatusDetail::Idle),
            (_, Some(group)) if group.is_implicit() => {
                let detail = group
                    .members()
                    .first()
                    .map(|m| m.runner.detail())
                    .unwrap_or(StatusDetail::Idle);
                AppView::single(&app.name, url, &detail)
            }
            (_, Some(group)) => {
                let services = group
                    .members()
                    .iter()
                    .map(|m| {
                        let service_url = if m.default {
                            url.clone()
                        } else {
                            self.config.urls.url_for(m.runner.key())
                        };
                        ServiceView::new(&m.service, service_url, m.default, &m.runner.detail())
                    })
                    .collect();
                AppView::grouped(&app.name, url, services)
            }
        };
        view.with_description(app.description.clone())
            .with_aliases(app.aliases.clone())
    }

    /// Re-read config and reconcile running processes with it.
    pub async fn reload(&self) -> RegistryDiff {
        let registry = self.registry.clone();
        let diff = match tokio::task::spawn_blocking(move || registry.reload()).await {
            Ok(diff) => diff,
            Err(e) => {
                tracing::error!(error = %e, "Config reload task failed");
                return RegistryDiff::default();
            }
        };
        self.reconcile(&diff).await;
        diff
    }

    /// Apply a registry diff: stop removed apps, rebuild changed ones
    /// (restarting them if they were active) and register new ones.
    pub async fn reconcile(&self, diff: &RegistryDiff) {
        for app in &diff.removed {
            let lock = self.app_lock(&app.name);
            let _guard = lock.lock().await;
            if let Some((_, group)) = self.groups.remove(&app.name) {
                tracing::info!(app = %app.name, "App removed from config, stopping");
                group.stop_all().await;
                self.logs.remove_app(&app.name);
            }
        }

        for app in &diff.changed {
            let lock = self.app_lock(&app.name);
            let _guard = lock.lock().await;
            let was_active = match self.groups.remove(&app.name) {
                Some((_, old)) => {
                    let active = old.is_active();
                    old.stop_all().await;
                    active
                }
                None => false,
            };
            let Some(group) = self.build_group(app) else {
                continue;
            };
            self.groups.insert(app.name.clone(), group.clone());
            if was_active {
                tracing::info!(app = %app.name, "App config changed, restarting");
                if let Err(e) = group.start_all().await {
                    tracing::warn!(app = %app.name, "Restart after config change failed: {}", e);
                }
            }
        }

        for app in &diff.added {
            if let Some(group) = self.build_group(app) {
                self.groups.entry(app.name.clone()).or_insert(group);
            }
        }
    }

    /// Stop every process. Used on shutdown.
    pub async fn stop_all(&self) {
        let groups: Vec<Arc<ServiceGroup>> = self.groups.iter().map(|g| g.value().clone()).collect();
        join_all(groups.iter().map(|g| g.stop_all())).await;
    }

    /// Apps that have been active and untouched for longer than their idle timeout
    pub fn idle_candidates(&self) -> Vec<String> {
        self.groups
            .iter()
            .filter(|g| g.idle_expired())
            .map(|g| g.key().clone())
            .collect()
    }

    pub fn config_path(&self, name: &str) -> PathBuf {
        match self.resolve(name) {
            Ok(target) => target.app().source.clone(),
            Err(_) => self.registry.config_path(name),
        }
    }

    /// Directory and logs of the part of an app that needs attention: the
    /// named service, else the first failed service, else the app itself.
    pub fn focus(&self, name: &str) -> Result<Focus, SupervisorError> {
        let target = self.resolve(name)?;
        let app = target.app().clone();
        let group = self.group(&app).ok();

        let member = group.as_ref().and_then(|g| match &target {
            Target::Service { service, .. } => g.member(service),
            Target::App(_) => g
                .members()
                .iter()
                .find(|m| m.runner.status() == Status::Failed)
                .or_else(|| g.members().iter().find(|m| m.default))
                .or_else(|| g.members().first()),
        });

        let (dir, logs) = match member {
            Some(m) => (m.runner.spec().dir, self.logs.read(&app.name, &m.service)),
            None => (app.working_dir(), Vec::new()),
        };
        Ok(Focus {
            app: app.name.clone(),
            dir,
            config_path: app.source.clone(),
            logs,
        })
    }
}
