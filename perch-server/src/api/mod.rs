//! HTTP API served under `/api/*`
//!
//! Lifecycle endpoints return as soon as the transition has been initiated;
//! clients follow progress through `/api/events` or by polling
//! `/api/app-status`.

mod events;

use crate::analyze::{self, LogAnalyzer};
use crate::broadcast::EventBroadcaster;
use crate::desktop::{self, DesktopError};
use crate::error::SupervisorError;
use crate::settings::Settings;
use crate::supervisor::Supervisor;
use crate::theme::ThemeState;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use perch_core::{
    AnalyzeReply, AppStatusReply, AppView, ConfigPathReply, EnabledReply, Theme, ThemeReply,
    ThemeRequest,
};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Shared by every handler
pub struct ApiState {
    pub supervisor: Arc<Supervisor>,
    pub broadcaster: EventBroadcaster,
    pub theme: ThemeState,
    pub analyzer: Arc<dyn LogAnalyzer>,
    pub config_dir: PathBuf,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/events", get(events::events))
        .route("/api/status", get(status))
        .route("/api/app-status", get(app_status))
        .route("/api/logs", get(logs))
        .route("/api/start", get(start))
        .route("/api/stop", get(stop))
        .route("/api/restart", get(restart))
        .route("/api/clear", get(clear))
        .route("/api/clear-logs", get(clear_logs))
        .route("/api/reload", get(reload))
        .route("/api/analyze-logs", get(analyze_logs))
        .route("/api/open-terminal", get(open_terminal))
        .route("/api/open-config", get(open_config))
        .route("/api/config-path", get(config_path))
        .route("/api/theme", get(get_theme).post(set_theme))
        .route("/api/claude-enabled", get(agent_enabled))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (status, message).into_response()
    }
}

impl From<SupervisorError> for ApiError {
    fn from(err: SupervisorError) -> Self {
        match err {
            SupervisorError::NotFound(_) => ApiError::NotFound(err.to_string()),
            SupervisorError::Static(_) | SupervisorError::External { .. } => {
                ApiError::BadRequest(err.to_string())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<DesktopError> for ApiError {
    fn from(err: DesktopError) -> Self {
        if err.is_config() {
            ApiError::BadRequest(err.to_string())
        } else {
            ApiError::Internal(err.to_string())
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
struct NameQuery {
    name: Option<String>,
}

impl NameQuery {
    fn require(self) -> ApiResult<String> {
        self.name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| ApiError::BadRequest("name parameter required".to_string()))
    }
}

async fn status(State(state): State<Arc<ApiState>>) -> Json<Vec<AppView>> {
    Json(state.supervisor.snapshot())
}

async fn app_status(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<NameQuery>,
) -> ApiResult<Json<AppStatusReply>> {
    let name = query.require()?;
    Ok(Json(state.supervisor.app_status(&name)))
}

async fn logs(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<NameQuery>,
) -> ApiResult<Json<Vec<String>>> {
    let name = query.require()?;
    Ok(Json(state.supervisor.logs(&name)?))
}

async fn start(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<NameQuery>,
) -> ApiResult<StatusCode> {
    let name = query.require()?;
    let result = state.supervisor.start(&name).await;
    state.broadcaster.publish_snapshot(&state.supervisor);
    result?;
    Ok(StatusCode::OK)
}

async fn stop(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<NameQuery>,
) -> ApiResult<StatusCode> {
    let name = query.require()?;
    let result = state.supervisor.stop(&name).await;
    state.broadcaster.publish_snapshot(&state.supervisor);
    result?;
    Ok(StatusCode::OK)
}

async fn restart(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<NameQuery>,
) -> ApiResult<StatusCode> {
    let name = query.require()?;
    let result = state.supervisor.restart(&name).await;
    state.broadcaster.publish_snapshot(&state.supervisor);
    result?;
    Ok(StatusCode::OK)
}

async fn clear(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<NameQuery>,
) -> ApiResult<StatusCode> {
    let name = query.require()?;
    if state.supervisor.clear(&name).await? {
        state.broadcaster.publish_snapshot(&state.supervisor);
    }
    Ok(StatusCode::OK)
}

async fn clear_logs(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<NameQuery>,
) -> ApiResult<StatusCode> {
    let name = query.require()?;
    state.supervisor.clear_logs(&name)?;
    Ok(StatusCode::OK)
}

async fn reload(State(state): State<Arc<ApiState>>) -> &'static str {
    state.supervisor.reload().await;
    state.broadcaster.publish_snapshot(&state.supervisor);
    "OK"
}

async fn analyze_logs(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<NameQuery>,
) -> ApiResult<Json<AnalyzeReply>> {
    if !state.analyzer.enabled() {
        return Ok(Json(AnalyzeReply::disabled()));
    }
    let name = query.require()?;
    let lines = state.supervisor.logs(&name)?;
    Ok(Json(analyze::analyze(state.analyzer.as_ref(), &lines).await))
}

async fn open_terminal(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<NameQuery>,
) -> ApiResult<StatusCode> {
    let name = query.require()?;
    let focus = state.supervisor.focus(&name)?;
    let settings = Settings::load(&state.config_dir);
    desktop::open_terminal(&settings, &focus).await?;
    Ok(StatusCode::OK)
}

async fn open_config(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<NameQuery>,
) -> ApiResult<StatusCode> {
    let name = query.require()?;
    let path = state.supervisor.config_path(&name);
    let settings = Settings::load(&state.config_dir);
    desktop::open_editor(&settings, &path).await?;
    Ok(StatusCode::OK)
}

async fn config_path(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<NameQuery>,
) -> ApiResult<Json<ConfigPathReply>> {
    let name = query.require()?;
    let path = state.supervisor.config_path(&name);
    Ok(Json(ConfigPathReply {
        path: path.to_string_lossy().into_owned(),
    }))
}

async fn get_theme(State(state): State<Arc<ApiState>>) -> Json<ThemeReply> {
    Json(ThemeReply {
        theme: state.theme.get(),
    })
}

async fn set_theme(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<ThemeRequest>,
) -> ApiResult<Json<ThemeReply>> {
    let theme: Theme = request
        .theme
        .parse()
        .map_err(|e: perch_core::UnknownTheme| ApiError::BadRequest(e.to_string()))?;
    state.theme.set(theme);
    state.broadcaster.publish_theme(theme);
    tracing::info!(theme = %theme, "Theme changed");
    Ok(Json(ThemeReply { theme }))
}

async fn agent_enabled(State(state): State<Arc<ApiState>>) -> Json<EnabledReply> {
    let settings = Settings::load(&state.config_dir);
    Json(EnabledReply {
        enabled: settings.agent_command().is_some(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyze::{AnalyzeError, DisabledAnalyzer};
    use async_trait::async_trait;
    use crate::instances::{LaunchOptions, RunnerEvent};
    use crate::registry::AppRegistry;
    use crate::supervisor::{SupervisorConfig, UrlScheme};
    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    struct TestApi {
        dir: TempDir,
        state: Arc<ApiState>,
        _events: mpsc::Receiver<RunnerEvent>,
    }

    impl TestApi {
        fn new(files: &[(&str, &str)]) -> Self {
            Self::with_analyzer(files, Arc::new(DisabledAnalyzer))
        }

        fn with_analyzer(files: &[(&str, &str)], analyzer: Arc<dyn LogAnalyzer>) -> Self {
            let dir = TempDir::new().unwrap();
            for (name, content) in files {
                std::fs::write(dir.path().join(name), content).unwrap();
            }
            let (tx, rx) = mpsc::channel(1024);
            let config = SupervisorConfig {
                launch: LaunchOptions {
                    shell: "/bin/sh".to_string(),
                    readiness_timeout: Duration::from_secs(5),
                    probe_interval: Duration::from_millis(20),
                    stop_grace: Duration::from_secs(2),
                },
                urls: UrlScheme::default(),
                log_capacity: 100,
                port_range: 50000..60000,
            };
            let supervisor = Arc::new(Supervisor::new(
                Arc::new(AppRegistry::load(dir.path())),
                config,
                tx,
            ));
            let state = Arc::new(ApiState {
                supervisor,
                broadcaster: EventBroadcaster::new(16),
                theme: ThemeState::load(dir.path()),
                analyzer,
                config_dir: dir.path().to_path_buf(),
            });
            Self {
                dir,
                state,
                _events: rx,
            }
        }

        async fn send(&self, request: Request<Body>) -> (StatusCode, String) {
            let response = router(self.state.clone()).oneshot(request).await.unwrap();
            let status = response.status();
            let body = response.into_body().collect().await.unwrap().to_bytes();
            (status, String::from_utf8_lossy(&body).into_owned())
        }

        async fn get(&self, uri: &str) -> (StatusCode, String) {
            self.send(Request::get(uri).body(Body::empty()).unwrap()).await
        }

        async fn post_json(&self, uri: &str, json: &str) -> (StatusCode, String) {
            let request = Request::builder()
                .method(Method::POST)
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap();
            self.send(request).await
        }
    }

    #[tokio::test]
    async fn missing_name_is_bad_request() {
        let api = TestApi::new(&[]);
        for path in ["/api/app-status", "/api/logs", "/api/start", "/api/stop", "/api/restart"] {
            let (status, _) = api.get(path).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{path}");
        }
    }

    #[tokio::test]
    async fn unknown_app_is_not_found_for_lifecycle() {
        let api = TestApi::new(&[]);
        let (status, body) = api.get("/api/start?name=ghost").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.contains("ghost"));

        let (status, body) = api.get("/api/app-status?name=ghost").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"status":"idle"}"#);
    }

    #[tokio::test]
    async fn failing_app_reports_exit_code() {
        let api = TestApi::new(&[("web", "exit 1")]);
        let (status, _) = api.get("/api/start?name=web").await;
        assert_eq!(status, StatusCode::OK);

        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let (_, body) = api.get("/api/app-status?name=web").await;
            let reply: AppStatusReply = serde_json::from_str(&body).unwrap();
            if reply.status == perch_core::Status::Failed {
                assert!(reply.error.unwrap().contains("exit code 1"));
                break;
            }
            assert!(Instant::now() < deadline, "still {body}");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let (_, body) = api.get("/api/status").await;
        let apps: Vec<AppView> = serde_json::from_str(&body).unwrap();
        assert!(apps[0].failed);

        // stop doubles as clear
        api.get("/api/stop?name=web").await;
        let (_, body) = api.get("/api/app-status?name=web").await;
        assert_eq!(body, r#"{"status":"idle"}"#);
    }

    #[tokio::test]
    async fn logs_are_returned_verbatim() {
        let api = TestApi::new(&[("web", "printf '\\033[31mred\\033[0m\\n'")]);
        api.get("/api/start?name=web").await;

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let (status, body) = api.get("/api/logs?name=web").await;
            assert_eq!(status, StatusCode::OK);
            let lines: Vec<String> = serde_json::from_str(&body).unwrap();
            if lines.iter().any(|l| l == "\x1b[31mred\x1b[0m") {
                break;
            }
            assert!(Instant::now() < deadline, "{lines:?}");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        api.get("/api/clear-logs?name=web").await;
        let (_, body) = api.get("/api/logs?name=web").await;
        assert_eq!(body, "[]");
    }

    #[tokio::test]
    async fn theme_post_is_broadcast_and_persisted() {
        let api = TestApi::new(&[]);
        let mut a = api.state.broadcaster.subscribe_with(|| "[]".to_string());
        let mut b = api.state.broadcaster.subscribe_with(|| "[]".to_string());
        assert_eq!(&*a.recv().await.unwrap(), "[]");
        assert_eq!(&*b.recv().await.unwrap(), "[]");

        let (status, body) = api.post_json("/api/theme", r#"{"theme":"dark"}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"theme":"dark"}"#);

        let expected = r#"{"type":"theme","theme":"dark"}"#;
        assert_eq!(&*a.recv().await.unwrap(), expected);
        assert_eq!(&*b.recv().await.unwrap(), expected);

        let (_, body) = api.get("/api/theme").await;
        assert_eq!(body, r#"{"theme":"dark"}"#);
        let saved = std::fs::read_to_string(api.dir.path().join("theme")).unwrap();
        assert_eq!(saved.trim(), "dark");
    }

    #[tokio::test]
    async fn invalid_theme_is_rejected() {
        let api = TestApi::new(&[]);
        let (status, _) = api.post_json("/api/theme", r#"{"theme":"purple"}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(api.state.theme.get(), Theme::System);
    }

    #[tokio::test]
    async fn agent_enabled_follows_settings_file() {
        let api = TestApi::new(&[]);
        let (_, body) = api.get("/api/claude-enabled").await;
        assert_eq!(body, r#"{"enabled":false}"#);

        std::fs::write(api.dir.path().join("config.toml"), "agent_command = \"claude\"\n").unwrap();
        let (_, body) = api.get("/api/claude-enabled").await;
        assert_eq!(body, r#"{"enabled":true}"#);
    }

    #[tokio::test]
    async fn open_terminal_without_agent_is_bad_request() {
        let api = TestApi::new(&[("web", "true")]);
        let (status, body) = api.get("/api/open-terminal?name=web").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("agent_command"));
    }

    #[tokio::test]
    async fn config_path_resolves_alias() {
        let api = TestApi::new(&[("shop.toml", "alias = \"store\"\ncmd = \"true\"\n")]);
        let (_, body) = api.get("/api/config-path?name=store").await;
        let reply: ConfigPathReply = serde_json::from_str(&body).unwrap();
        assert!(reply.path.ends_with("shop.toml"));

        let (_, body) = api.get("/api/config-path?name=new").await;
        let reply: ConfigPathReply = serde_json::from_str(&body).unwrap();
        assert!(reply.path.ends_with("new.toml"));
    }

    #[tokio::test]
    async fn analyze_disabled_by_default() {
        let api = TestApi::new(&[]);
        let (_, body) = api.get("/api/analyze-logs?name=web").await;
        assert_eq!(body, r#"{"enabled":false}"#);
    }

    /// Flags lines mentioning "Error"
    struct KeywordAnalyzer;

    #[async_trait]
    impl LogAnalyzer for KeywordAnalyzer {
        fn enabled(&self) -> bool {
            true
        }

        async fn error_lines(&self, lines: &[String]) -> Result<Vec<usize>, AnalyzeError> {
            Ok(lines
                .iter()
                .enumerate()
                .filter(|(_, l)| l.contains("Error"))
                .map(|(i, _)| i)
                .collect())
        }
    }

    #[tokio::test]
    async fn analyze_unknown_app_is_not_found() {
        let api = TestApi::with_analyzer(&[], Arc::new(KeywordAnalyzer));
        let (status, body) = api.get("/api/analyze-logs?name=ghost").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.contains("ghost"));
    }

    #[tokio::test]
    async fn analyze_flags_matching_lines() {
        let api = TestApi::with_analyzer(
            &[("web", "echo ok; echo 'Error: boom'; exit 1")],
            Arc::new(KeywordAnalyzer),
        );
        api.get("/api/start?name=web").await;
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let (_, body) = api.get("/api/app-status?name=web").await;
            if body.contains("failed") {
                break;
            }
            assert!(Instant::now() < deadline, "{body}");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let (status, body) = api.get("/api/analyze-logs?name=web").await;
        assert_eq!(status, StatusCode::OK);
        let reply: AnalyzeReply = serde_json::from_str(&body).unwrap();
        assert!(reply.enabled);
        assert_eq!(reply.error_lines, Some(vec![1]));
    }

    #[tokio::test]
    async fn static_app_rejects_start() {
        let site = TempDir::new().unwrap();
        let api = TestApi::new(&[("docs", &format!("{}\n", site.path().display()))]);
        let (status, _) = api.get("/api/start?name=docs").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn reload_picks_up_new_files() {
        let api = TestApi::new(&[]);
        std::fs::write(api.dir.path().join("new.toml"), "cmd = \"true\"\n").unwrap();
        let (status, body) = api.get("/api/reload").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK");
        let (_, body) = api.get("/api/status").await;
        assert!(body.contains("\"name\":\"new\""));
    }

    #[tokio::test]
    async fn event_stream_starts_with_snapshot() {
        let api = TestApi::new(&[("web", "true")]);
        let response = router(api.state.clone())
            .oneshot(Request::get("/api/events").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"],
            "text/event-stream"
        );

        let mut body = response.into_body();
        let frame = tokio::time::timeout(Duration::from_secs(1), body.frame())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let text = String::from_utf8_lossy(frame.data_ref().unwrap()).into_owned();
        assert!(text.starts_with("data: ["), "{text}");
        assert!(text.contains("\"name\":\"web\""));
        assert_eq!(api.state.broadcaster.client_count(), 1);

        drop(body);
        assert_eq!(api.state.broadcaster.client_count(), 0);
    }
}
