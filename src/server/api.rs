use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::errors::OrchestratorError;
use crate::orchestrator::ControlPlane;
use crate::orchestrator::hub::ObserverInfo;
use crate::orchestrator::lifecycle::JobReceipt;
use crate::orchestrator::models::{
    BuildOptions, PackageManager, ProcessInfo, ProcessKind, Project, ProjectStatus,
};
use crate::orchestrator::queue::CancelOutcome;
use crate::orchestrator::store::ProjectStore;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub plane: Arc<ControlPlane>,
}

pub type SharedState = Arc<AppState>;

// ── Request / response payloads ───────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateProjectRequest {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub path: PathBuf,
    /// One of `npm`, `pnpm`, `yarn` or `bun`; defaults to `npm`.
    #[serde(default)]
    pub package_manager: Option<String>,
}

#[derive(Deserialize)]
pub struct ListProjectsQuery {
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Serialize)]
pub struct ProjectDetail {
    #[serde(flatten)]
    pub project: Project,
    pub dev_process: Option<ProcessInfo>,
    pub has_job: bool,
}

#[derive(Serialize)]
pub struct CancelResponse {
    pub outcome: CancelOutcome,
}

// ── Error handling ────────────────────────────────────────────────────

/// Maps orchestrator errors onto HTTP statuses with a `{error, code}` body.
pub struct ApiError(pub OrchestratorError);

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self(OrchestratorError::MalformedMessage(message.into()))
    }

    pub fn status(&self) -> StatusCode {
        match self.0 {
            OrchestratorError::ProjectNotFound { .. } => StatusCode::NOT_FOUND,
            OrchestratorError::AlreadyRunning { .. }
            | OrchestratorError::AlreadyBuilding { .. }
            | OrchestratorError::DuplicateBuild { .. }
            | OrchestratorError::ProjectExists { .. } => StatusCode::CONFLICT,
            OrchestratorError::PortExhausted { .. }
            | OrchestratorError::ConnectionLimitExceeded { .. } => StatusCode::SERVICE_UNAVAILABLE,
            OrchestratorError::MalformedMessage(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = serde_json::json!({"error": self.0.to_string(), "code": self.0.code()});
        (status, Json(body)).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/projects", get(list_projects).post(create_project))
        .route("/api/projects/{id}", get(get_project).delete(delete_project))
        .route("/api/projects/{id}/start", post(start_project))
        .route("/api/projects/{id}/stop", post(stop_project))
        .route("/api/projects/{id}/restart", post(restart_project))
        .route("/api/projects/{id}/build", post(build_project))
        .route("/api/projects/{id}/build/cancel", post(cancel_build))
        .route("/api/projects/{id}/deploy", post(deploy_project))
        .route("/api/builds/stats", get(build_stats))
        .route("/api/observers", get(list_observers))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_projects(
    State(state): State<SharedState>,
    Query(query): Query<ListProjectsQuery>,
) -> Result<Json<Vec<Project>>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<ProjectStatus>)
        .transpose()
        .map_err(ApiError::bad_request)?;
    let mut projects = state.plane.store.list_projects();
    if let Some(status) = status {
        projects.retain(|p| p.status == status);
    }
    Ok(Json(projects))
}

async fn create_project(
    State(state): State<SharedState>,
    Json(req): Json<CreateProjectRequest>,
) -> Result<(StatusCode, Json<Project>), ApiError> {
    if req.name.trim().is_empty() {
        return Err(ApiError::bad_request("name must not be empty"));
    }
    let package_manager = match req.package_manager.as_deref() {
        Some(name) => name.parse::<PackageManager>().map_err(ApiError::bad_request)?,
        None => PackageManager::default(),
    };
    let id = req.id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let project = Project::new(id, req.name, req.path).with_package_manager(package_manager);
    let project = state.plane.store.insert_project(project)?;
    info!(project = %project.id, path = %project.path.display(), "Project registered");
    Ok((StatusCode::CREATED, Json(project)))
}

async fn get_project(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<ProjectDetail>, ApiError> {
    let project = state
        .plane
        .store
        .get_project(&id)
        .ok_or_else(|| OrchestratorError::ProjectNotFound { id: id.clone() })?;
    Ok(Json(ProjectDetail {
        project,
        dev_process: state.plane.manager.dev_process(&id),
        has_job: state.plane.queue.has_job(&id),
    }))
}

async fn delete_project(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Project>, ApiError> {
    state.plane.manager.release_project(&id)?;
    let project = state.plane.store.delete_project(&id)?;
    info!(project = %id, "Project deleted");
    Ok(Json(project))
}

async fn start_project(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Project>, ApiError> {
    Ok(Json(state.plane.manager.start(&id)?))
}

async fn stop_project(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Project>, ApiError> {
    Ok(Json(state.plane.manager.stop(&id)?))
}

async fn restart_project(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Project>, ApiError> {
    Ok(Json(state.plane.manager.restart(&id)?))
}

async fn build_project(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<JobReceipt>), ApiError> {
    submit_job(&state, &id, ProcessKind::Build, &body)
}

async fn deploy_project(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<JobReceipt>), ApiError> {
    submit_job(&state, &id, ProcessKind::Deploy, &body)
}

/// Build and deploy requests return as soon as the job is admitted; progress
/// is streamed over the socket.
fn submit_job(
    state: &SharedState,
    id: &str,
    kind: ProcessKind,
    body: &[u8],
) -> Result<(StatusCode, Json<JobReceipt>), ApiError> {
    let options = parse_options(body)?;
    let receipt = state.plane.manager.spawn_job(id, kind, options)?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

fn parse_options(body: &[u8]) -> Result<BuildOptions, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(BuildOptions::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::bad_request(format!("Invalid build options: {}", e)))
}

async fn cancel_build(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, ApiError> {
    let outcome = state.plane.manager.cancel_job(&id)?;
    Ok(Json(CancelResponse { outcome }))
}

async fn build_stats(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.plane.queue.stats())
}

async fn list_observers(State(state): State<SharedState>) -> Json<Vec<ObserverInfo>> {
    Json(state.plane.hub.observers())
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlaneConfig;
    use crate::orchestrator::commands::{CommandResolver, ShellResolver};
    use crate::orchestrator::models::ProjectPatch;
    use crate::orchestrator::store::SnapshotStore;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_app_with(resolver: ShellResolver) -> (Router, Arc<ControlPlane>) {
        let resolver: Arc<dyn CommandResolver> = Arc::new(resolver);
        let plane = Arc::new(
            ControlPlane::new(&PlaneConfig::default(), Arc::new(SnapshotStore::in_memory()), resolver)
                .unwrap(),
        );
        let state = Arc::new(AppState {
            plane: Arc::clone(&plane),
        });
        (api_router().with_state(state), plane)
    }

    fn test_app() -> Router {
        test_app_with(ShellResolver::new()).0
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let response = test_app().oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_create_and_list_projects() {
        let app = test_app();
        let response = app
            .clone()
            .oneshot(post(
                "/api/projects",
                serde_json::json!({"id": "site", "name": "Site", "path": "/tmp/site", "package_manager": "pnpm"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let project: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(project["status"], "idle");
        assert_eq!(project["package_manager"], "pnpm");

        let response = app.oneshot(get("/api/projects")).await.unwrap();
        let projects: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0]["id"], "site");
    }

    #[tokio::test]
    async fn test_duplicate_project_is_conflict() {
        let app = test_app();
        let body = serde_json::json!({"id": "site", "name": "Site", "path": "/tmp/site"});
        let response = app.clone().oneshot(post("/api/projects", body.clone())).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app.clone().oneshot(post("/api/projects", body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["code"], "project_exists");

        let response = app.oneshot(get("/api/projects")).await.unwrap();
        let projects: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert_eq!(projects.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_package_manager_rejected() {
        let response = test_app()
            .oneshot(post(
                "/api/projects",
                serde_json::json!({"name": "x", "path": "/tmp/x", "package_manager": "maven"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert!(body["error"].as_str().unwrap().contains("maven"));
    }

    #[tokio::test]
    async fn test_list_projects_filtered_by_status() {
        let (app, plane) = test_app_with(ShellResolver::new());
        plane.store.insert_project(Project::new("a", "a", "/tmp/a")).unwrap();
        plane.store.insert_project(Project::new("b", "b", "/tmp/b")).unwrap();
        plane
            .store
            .update_project("b", &ProjectPatch::status(ProjectStatus::Error))
            .unwrap();

        let response = app.clone().oneshot(get("/api/projects?status=error")).await.unwrap();
        let projects: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0]["id"], "b");

        let response = app.oneshot(get("/api/projects?status=sleeping")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_observers_listing() {
        let (app, plane) = test_app_with(ShellResolver::new());
        let (id, _rx) = plane.hub.connect(Some("http://localhost:5173".to_string())).unwrap();
        plane.hub.handle_text(id, r#"{"type":"subscribe","data":{"channel":"project:a:logs"}}"#);

        let response = app.oneshot(get("/api/observers")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let observers: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert_eq!(observers.len(), 1);
        assert_eq!(observers[0]["id"], id.to_string());
        assert_eq!(observers[0]["origin"], "http://localhost:5173");
        assert_eq!(observers[0]["subscriptions"], serde_json::json!(["project:a:logs"]));
    }

    #[tokio::test]
    async fn test_unknown_build_tool_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let (app, plane) = test_app_with(ShellResolver::new().with(ProcessKind::Build, "true"));
        plane
            .store
            .insert_project(Project::new("p1", "p1", dir.path()))
            .unwrap();
        let response = app
            .oneshot(post("/api/projects/p1/build", serde_json::json!({"tool": "parcel"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(plane.store.get_project("p1").unwrap().status, ProjectStatus::Idle);
    }

    #[tokio::test]
    async fn test_create_project_requires_name() {
        let response = test_app()
            .oneshot(post("/api/projects", serde_json::json!({"name": " ", "path": "/tmp/x"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["code"], "malformed_message");
    }

    #[tokio::test]
    async fn test_unknown_project_is_404() {
        let app = test_app();
        for request in [
            get("/api/projects/missing"),
            post("/api/projects/missing/start", serde_json::json!({})),
            post("/api/projects/missing/build", serde_json::json!({})),
            post("/api/projects/missing/build/cancel", serde_json::json!({})),
        ] {
            let response = app.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
            let body: serde_json::Value = body_json(response.into_body()).await;
            assert_eq!(body["code"], "project_not_found");
        }
    }

    #[tokio::test]
    async fn test_build_stats_empty() {
        let response = test_app().oneshot(get("/api/builds/stats")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let stats: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(stats["active_count"], 0);
        assert_eq!(stats["queue_length"], 0);
        assert_eq!(stats["max_concurrent"], 2);
    }

    #[tokio::test]
    async fn test_invalid_build_options_rejected() {
        let (app, plane) = test_app_with(ShellResolver::new());
        plane
            .store
            .insert_project(Project::new("p1", "p1", "/tmp/p1"))
            .unwrap();
        let request = Request::builder()
            .method("POST")
            .uri("/api/projects/p1/build")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_build_accepted_then_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let (app, plane) = test_app_with(ShellResolver::new().with(ProcessKind::Build, "sleep 30"));
        plane
            .store
            .insert_project(Project::new("p1", "p1", dir.path()))
            .unwrap();

        let response = app
            .clone()
            .oneshot(post("/api/projects/p1/build", serde_json::json!({"production": true})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let receipt: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(receipt["state"], "running");
        assert_eq!(receipt["kind"], "build");

        let response = app
            .clone()
            .oneshot(post("/api/projects/p1/deploy", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["code"], "already_building");

        let response = app
            .clone()
            .oneshot(post("/api/projects/p1/build/cancel", serde_json::json!({})))
            .await
            .unwrap();
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["outcome"], "signalled");

        plane.shutdown(std::time::Duration::from_secs(5)).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_stop_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let (app, plane) = test_app_with(ShellResolver::new().with(ProcessKind::Dev, "sleep 30"));
        plane
            .store
            .insert_project(Project::new("p1", "p1", dir.path()))
            .unwrap();

        let response = app
            .clone()
            .oneshot(post("/api/projects/p1/start", serde_json::json!({})))
            .await
            .unwrap();
        if response.status() == StatusCode::SERVICE_UNAVAILABLE {
            // Every port in the default window is taken on this host.
            return;
        }
        assert_eq!(response.status(), StatusCode::OK);
        let project: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(project["status"], "running");
        assert!(project["port"].is_u64());

        let response = app
            .clone()
            .oneshot(post("/api/projects/p1/start", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = app.clone().oneshot(get("/api/projects/p1")).await.unwrap();
        let detail: serde_json::Value = body_json(response.into_body()).await;
        assert!(detail["dev_process"]["pid"].is_u64());

        let response = app
            .clone()
            .oneshot(post("/api/projects/p1/stop", serde_json::json!({})))
            .await
            .unwrap();
        let project: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(project["status"], "idle");

        let request = Request::builder()
            .method("DELETE")
            .uri("/api/projects/p1")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = app.oneshot(get("/api/projects/p1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (OrchestratorError::AlreadyRunning { id: "p".into() }, StatusCode::CONFLICT),
            (OrchestratorError::DuplicateBuild { id: "p".into() }, StatusCode::CONFLICT),
            (OrchestratorError::ProjectExists { id: "p".into() }, StatusCode::CONFLICT),
            (OrchestratorError::PortExhausted { start: 3000, window: 10 }, StatusCode::SERVICE_UNAVAILABLE),
            (OrchestratorError::ConnectionLimitExceeded { max: 1 }, StatusCode::SERVICE_UNAVAILABLE),
            (OrchestratorError::Cancelled { id: "p".into() }, StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError(err).status(), status);
        }
    }
}
