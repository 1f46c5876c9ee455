use std::path::{Path as StdPath, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::config::{self, AppConfig};
use crate::config_registry::{ActiveConfigResolver, RegistryConfigResolver};
use crate::container::{ContainerExecutor, DockerCli};
use crate::runs::{RunError, RunOrchestrator, RunRecord, RunSettings, RunStore};

const DEFAULT_TRIGGER: &str = "manual";

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    orchestrator: RunOrchestrator,
    config: AppConfig,
    config_path: PathBuf,
    data_dir: PathBuf,
}

impl AppState {
    pub fn new(
        orchestrator: RunOrchestrator,
        config: AppConfig,
        config_path: PathBuf,
        data_dir: PathBuf,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                orchestrator,
                config,
                config_path,
                data_dir,
            }),
        }
    }

    pub fn orchestrator(&self) -> &RunOrchestrator {
        &self.inner.orchestrator
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn config_path(&self) -> &StdPath {
        &self.inner.config_path
    }

    pub fn data_dir(&self) -> &StdPath {
        &self.inner.data_dir
    }
}

#[derive(Deserialize)]
pub struct CreateRunRequest {
    #[serde(default)]
    pub trigger: Option<String>,
}

#[derive(Serialize)]
pub struct CreateRunResponse {
    pub run_id: String,
}

#[derive(Deserialize)]
pub struct TailQuery {
    pub tail: Option<i64>,
}

#[derive(Serialize)]
pub struct RunLogsResponse {
    pub lines: Vec<String>,
    pub has_more: bool,
}

#[derive(Serialize)]
pub struct LatestLogResponse {
    pub lines: Vec<String>,
    pub has_more: bool,
    pub file: String,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub docker_socket: bool,
    pub kometa_container_found: bool,
    pub container_reason: Option<String>,
    pub run_in_progress: bool,
    pub config_exists: bool,
    pub config_path: Option<String>,
    pub config_root: String,
    pub log_dir: String,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/runs", get(list_runs).post(create_run))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/logs", get(get_run_logs))
        .route("/api/runs/{id}/download", get(download_run_log))
        .route("/api/logs/latest", get(get_latest_log))
        .route("/api/logs/latest/download", get(download_latest_log))
        .route("/api/{*path}", any(api_route_not_found))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let orchestrator = state.orchestrator();
    let executor = orchestrator.executor();
    let docker_socket = executor.socket_available();

    let availability = executor
        .check_available(&orchestrator.settings().container_name)
        .await;

    let config_path = match orchestrator.resolver().active_config_path() {
        Ok(path) => Some(path),
        Err(err) => {
            warn!(error = %err, "Failed to resolve active config for health report");
            None
        }
    };

    Json(HealthResponse {
        ok: true,
        docker_socket,
        kometa_container_found: availability.ok,
        container_reason: availability.reason,
        run_in_progress: orchestrator.run_in_progress(),
        config_exists: config_path.as_deref().is_some_and(StdPath::exists),
        config_path: config_path.map(|path| path.display().to_string()),
        config_root: state.config().paths.config_dir.display().to_string(),
        log_dir: orchestrator.settings().log_dir.display().to_string(),
    })
}

async fn create_run(
    State(state): State<AppState>,
    payload: Option<Json<CreateRunRequest>>,
) -> Result<Json<CreateRunResponse>, AppError> {
    let trigger = payload
        .as_ref()
        .and_then(|Json(request)| request.trigger.as_deref())
        .map(str::trim)
        .filter(|trigger| !trigger.is_empty())
        .unwrap_or(DEFAULT_TRIGGER);

    let run_id = state.orchestrator().start(trigger)?;
    Ok(Json(CreateRunResponse { run_id }))
}

async fn list_runs(State(state): State<AppState>) -> Result<Json<Vec<RunRecord>>, AppError> {
    Ok(Json(state.orchestrator().list_runs()?))
}

async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RunRecord>, AppError> {
    Ok(Json(state.orchestrator().get_status(&id)?))
}

async fn get_run_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TailQuery>,
) -> Result<Json<RunLogsResponse>, AppError> {
    let tail = query.tail.unwrap_or(state.config().runs.default_tail);
    let logs = state.orchestrator().get_logs(&id, tail)?;
    Ok(Json(RunLogsResponse {
        lines: logs.lines,
        has_more: logs.has_more,
    }))
}

async fn download_run_log(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let path = state.orchestrator().download_log(&id)?;
    file_download(&path).await
}

async fn get_latest_log(
    State(state): State<AppState>,
    Query(query): Query<TailQuery>,
) -> Result<Json<LatestLogResponse>, AppError> {
    let tail = query.tail.unwrap_or(state.config().runs.default_tail);
    let latest = state.orchestrator().latest_log(tail)?;
    Ok(Json(LatestLogResponse {
        lines: latest.tail.lines,
        has_more: latest.tail.has_more,
        file: latest.file,
    }))
}

async fn download_latest_log(State(state): State<AppState>) -> Result<Response, AppError> {
    let path = state.orchestrator().latest_log_path()?;
    file_download(&path).await
}

async fn api_route_not_found(Path(path): Path<String>) -> AppError {
    AppError::NotFound(format!("api endpoint not found: /api/{path}"))
}

/// Streams a log file as an attachment without buffering it in memory.
async fn file_download(path: &StdPath) -> Result<Response, AppError> {
    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(AppError::NotFound("Log file not found".to_string()));
        }
        Err(err) => return Err(AppError::Internal(format!("failed to open log file: {err}"))),
    };

    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().replace('"', ""))
        .unwrap_or_else(|| "run.log".to_string());
    let mime = mime_guess::from_path(path).first_or(mime_guess::mime::TEXT_PLAIN);

    Ok((
        [
            (header::CONTENT_TYPE, mime.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

#[derive(Debug)]
pub enum AppError {
    Conflict(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}

impl From<RunError> for AppError {
    fn from(err: RunError) -> Self {
        match err {
            RunError::Conflict => AppError::Conflict("A run is already in progress.".to_string()),
            RunError::NotFound(msg) => AppError::NotFound(msg),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", err))
    }
}

/// Wires the docker-backed orchestrator for `config` and reconciles leftovers
/// from a previous process when enabled.
pub fn app_state_with_config(
    config: AppConfig,
    config_path: PathBuf,
    data_dir: PathBuf,
) -> Result<AppState> {
    let orchestrator = orchestrator_for_config(&config, &data_dir)?;

    if config.runs.reconcile_on_startup {
        let reconciled = orchestrator
            .reconcile_on_startup()
            .context("failed to reconcile runs left by a previous process")?;
        info!(reconciled, "Startup run reconciliation finished");
    }

    Ok(AppState::new(orchestrator, config, config_path, data_dir))
}

pub fn orchestrator_for_config(config: &AppConfig, data_dir: &StdPath) -> Result<RunOrchestrator> {
    std::fs::create_dir_all(&config.paths.log_dir).with_context(|| {
        format!(
            "failed to create run log directory: {}",
            config.paths.log_dir.display()
        )
    })?;

    let store = RunStore::open(&config::db_path(data_dir))?;
    let runtime = Arc::new(DockerCli::new(config.docker.socket_path.clone()));
    let executor = ContainerExecutor::new(runtime, config.docker.socket_path.clone());
    let resolver: Arc<dyn ActiveConfigResolver> = Arc::new(RegistryConfigResolver::new(
        config::registry_path(data_dir),
        config.paths.config_dir.clone(),
        config.paths.config_file.clone(),
    ));

    Ok(RunOrchestrator::new(
        store,
        executor,
        resolver,
        RunSettings::from_config(config, data_dir),
    ))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::http::Request;
    use tokio::sync::Notify;
    use tower::{Service, ServiceExt};

    use super::*;
    use crate::config_registry::StaticConfigResolver;
    use crate::container::testing::ScriptedRuntime;
    use crate::container::ExecChunk;

    struct TestApp {
        _temp: tempfile::TempDir,
        state: AppState,
        router: Router,
    }

    fn test_app(runtime: ScriptedRuntime) -> TestApp {
        let temp = tempfile::tempdir().expect("tempdir");
        let data_dir = temp.path().join("data");
        let socket = temp.path().join("docker.sock");
        std::fs::write(&socket, b"").expect("fake socket");

        let mut config = AppConfig::default();
        config.paths.log_dir = temp.path().join("logs");
        config.paths.config_dir = temp.path().join("config");
        config.docker.socket_path = socket.clone();

        let store = RunStore::open(&config::db_path(&data_dir)).expect("store");
        let executor = ContainerExecutor::new(Arc::new(runtime), socket);
        let resolver = Arc::new(StaticConfigResolver(temp.path().join("config/config.yml")));
        let orchestrator = RunOrchestrator::new(
            store,
            executor,
            resolver,
            RunSettings::from_config(&config, &data_dir),
        );

        let state = AppState::new(
            orchestrator,
            config,
            config::config_path(&data_dir),
            data_dir,
        );
        TestApp {
            router: app_router(state.clone()),
            state,
            _temp: temp,
        }
    }

    async fn send_request(router: &mut Router, request: Request<Body>) -> Response {
        router
            .as_service()
            .ready()
            .await
            .unwrap()
            .call(request)
            .await
            .unwrap()
    }

    async fn get(router: &mut Router, uri: &str) -> Response {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        send_request(router, req).await
    }

    async fn post_run(router: &mut Router, body: serde_json::Value) -> Response {
        let req = Request::builder()
            .method("POST")
            .uri("/api/runs")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap();
        send_request(router, req).await
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    async fn wait_for_idle(state: &AppState, run_id: &str) -> RunRecord {
        const MAX_POLLS: usize = 200;
        const POLL_INTERVAL_MS: u64 = 10;

        for _ in 0..MAX_POLLS {
            let run = state.orchestrator().get_status(run_id).expect("run exists");
            if run.status.is_terminal() && !state.orchestrator().run_in_progress() {
                return run;
            }
            tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
        }

        panic!("run {run_id} did not reach terminal status within timeout");
    }

    #[tokio::test]
    async fn test_health_reports_container_and_config() {
        let mut app = test_app(ScriptedRuntime::running(Vec::new(), Some(0)));

        let resp = get(&mut app.router, "/api/health").await;
        assert_eq!(resp.status(), StatusCode::OK);

        let json = body_json(resp).await;
        assert_eq!(json["ok"], true);
        assert_eq!(json["docker_socket"], true);
        assert_eq!(json["kometa_container_found"], true);
        assert_eq!(json["config_exists"], false);
        assert_eq!(json["run_in_progress"], false);
        assert!(json["config_path"]
            .as_str()
            .unwrap()
            .ends_with("config/config.yml"));
    }

    #[tokio::test]
    async fn test_create_run_then_fetch_detail_and_logs() {
        let mut app = test_app(ScriptedRuntime::running(
            (1..=10)
                .map(|i| ExecChunk::Stdout(format!("line-{i}\n").into_bytes()))
                .collect(),
            Some(0),
        ));

        let resp = post_run(&mut app.router, serde_json::json!({"trigger": "api"})).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let run_id = body_json(resp).await["run_id"]
            .as_str()
            .unwrap()
            .to_string();

        wait_for_idle(&app.state, &run_id).await;

        let resp = get(&mut app.router, &format!("/api/runs/{run_id}")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let run = body_json(resp).await;
        assert_eq!(run["status"], "success");
        assert_eq!(run["trigger"], "api");
        assert_eq!(run["exit_code"], 0);

        let resp = get(&mut app.router, &format!("/api/runs/{run_id}/logs?tail=3")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let logs = body_json(resp).await;
        assert_eq!(
            logs["lines"],
            serde_json::json!(["line-8", "line-9", "line-10"])
        );
        assert_eq!(logs["has_more"], true);

        let resp = get(&mut app.router, "/api/runs").await;
        let runs = body_json(resp).await;
        assert_eq!(runs.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_body_uses_manual_trigger() {
        let mut app = test_app(ScriptedRuntime::running(Vec::new(), Some(0)));

        let resp = post_run(&mut app.router, serde_json::json!({})).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let run_id = body_json(resp).await["run_id"]
            .as_str()
            .unwrap()
            .to_string();

        let run = wait_for_idle(&app.state, &run_id).await;
        assert_eq!(run.trigger, "manual");
    }

    #[tokio::test]
    async fn test_second_create_while_running_is_conflict() {
        let gate = Arc::new(Notify::new());
        let mut app = test_app(
            ScriptedRuntime::running(Vec::new(), Some(0)).gated(gate.clone()),
        );

        let resp = post_run(&mut app.router, serde_json::json!({})).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let run_id = body_json(resp).await["run_id"]
            .as_str()
            .unwrap()
            .to_string();

        let resp = post_run(&mut app.router, serde_json::json!({})).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let json = body_json(resp).await;
        assert_eq!(json["error"], "A run is already in progress.");

        gate.notify_one();
        wait_for_idle(&app.state, &run_id).await;
    }

    #[tokio::test]
    async fn test_unknown_run_returns_404() {
        let mut app = test_app(ScriptedRuntime::running(Vec::new(), Some(0)));

        for uri in [
            "/api/runs/ghost",
            "/api/runs/ghost/logs",
            "/api/runs/ghost/download",
        ] {
            let resp = get(&mut app.router, uri).await;
            assert_eq!(resp.status(), StatusCode::NOT_FOUND, "{uri}");
            let json = body_json(resp).await;
            assert!(json["error"].as_str().unwrap().contains("not found"), "{uri}");
        }
    }

    #[tokio::test]
    async fn test_latest_log_404_without_logs() {
        let mut app = test_app(ScriptedRuntime::running(Vec::new(), Some(0)));

        let resp = get(&mut app.router, "/api/logs/latest").await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = get(&mut app.router, "/api/logs/latest/download").await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_downloads_return_raw_log_bytes() {
        let mut app = test_app(ScriptedRuntime::running(
            vec![ExecChunk::Stdout(b"alpha\nbeta\n".to_vec())],
            Some(0),
        ));

        let resp = post_run(&mut app.router, serde_json::json!({})).await;
        let run_id = body_json(resp).await["run_id"]
            .as_str()
            .unwrap()
            .to_string();
        let run = wait_for_idle(&app.state, &run_id).await;
        let log_file = run.log_file.expect("log file");

        let resp = get(&mut app.router, &format!("/api/runs/{run_id}/download")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let disposition = resp
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(disposition.contains(&log_file));
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"alpha\nbeta\n");

        let resp = get(&mut app.router, "/api/logs/latest?tail=1").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let latest = body_json(resp).await;
        assert_eq!(latest["file"], log_file);
        assert_eq!(latest["lines"], serde_json::json!(["beta"]));
        assert_eq!(latest["has_more"], true);

        let resp = get(&mut app.router, "/api/logs/latest/download").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"alpha\nbeta\n");
    }

    #[tokio::test]
    async fn test_failed_run_is_visible_in_detail() {
        let mut runtime = ScriptedRuntime::running(Vec::new(), Some(0));
        runtime.status = None;
        let mut app = test_app(runtime);

        let resp = post_run(&mut app.router, serde_json::json!({})).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let run_id = body_json(resp).await["run_id"]
            .as_str()
            .unwrap()
            .to_string();
        wait_for_idle(&app.state, &run_id).await;

        let resp = get(&mut app.router, &format!("/api/runs/{run_id}")).await;
        let run = body_json(resp).await;
        assert_eq!(run["status"], "failed");
        assert!(run["exit_code"].is_null());
        assert!(run["error"].as_str().unwrap().contains("container not found"));
    }

    #[tokio::test]
    async fn test_unknown_api_route_is_json_404() {
        let mut app = test_app(ScriptedRuntime::running(Vec::new(), Some(0)));

        let resp = get(&mut app.router, "/api/does-not-exist").await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let json = body_json(resp).await;
        assert_eq!(json["error"], "api endpoint not found: /api/does-not-exist");
    }

    #[test]
    fn test_app_state_with_config_reconciles_leftovers() {
        let temp = tempfile::tempdir().expect("tempdir");
        let data_dir = temp.path().join("data");
        let mut config = AppConfig::default();
        config.paths.log_dir = temp.path().join("logs");
        config.docker.socket_path = temp.path().join("missing.sock");
        config.runs.reconcile_on_startup = true;

        let store = RunStore::open(&config::db_path(&data_dir)).expect("store");
        store.insert("left-over", 1, "manual", "ui-run-old.log").expect("insert");
        assert!(crate::lease::acquire(&config::lease_path(&data_dir), "left-over").expect("lease"));

        let state = app_state_with_config(config, config::config_path(&data_dir), data_dir.clone())
            .expect("state");

        let run = state.orchestrator().get_status("left-over").expect("run");
        assert_eq!(run.status, crate::runs::RunStatus::Failed);
        assert!(!state.orchestrator().run_in_progress());
        assert!(state.config_path().ends_with("config.toml"));
        assert_eq!(state.data_dir(), data_dir.as_path());
    }

    #[test]
    fn test_default_config_leaves_running_records_and_lease_alone() {
        let temp = tempfile::tempdir().expect("tempdir");
        let data_dir = temp.path().join("data");
        let mut config = AppConfig::default();
        config.paths.log_dir = temp.path().join("logs");
        config.docker.socket_path = temp.path().join("missing.sock");

        let store = RunStore::open(&config::db_path(&data_dir)).expect("store");
        store.insert("live", 1, "manual", "ui-run-live.log").expect("insert");
        assert!(crate::lease::acquire(&config::lease_path(&data_dir), "live").expect("lease"));

        let state = app_state_with_config(config, config::config_path(&data_dir), data_dir)
            .expect("state");

        let run = state.orchestrator().get_status("live").expect("run");
        assert_eq!(run.status, crate::runs::RunStatus::Running);
        assert!(state.orchestrator().run_in_progress());
    }
}
