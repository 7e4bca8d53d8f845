//! `planrunner serve`: read-only HTTP status API (§6.3).

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::CorsLayer;

use runner_core::facade::PlanRunner;
use runner_core::model::ProducerId;

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }
}

impl From<runner_core::RunnerError> for AppError {
    fn from(err: runner_core::RunnerError) -> Self {
        let status = match &err {
            runner_core::RunnerError::PlanNotFound(_) | runner_core::RunnerError::NodeNotFound(_) => StatusCode::NOT_FOUND,
            runner_core::RunnerError::Validation { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

pub fn build_router(runner: Arc<PlanRunner>) -> Router {
    Router::new()
        .route("/api/plans", get(list_plans))
        .route("/api/plans/{id}", get(get_plan))
        .route("/api/plans/{id}/nodes/{producerId}", get(get_node))
        .route("/api/plans/{id}/nodes/{producerId}/logs", get(get_node_logs))
        .layer(CorsLayer::permissive())
        .with_state(runner)
}

pub async fn run_serve(runner: Arc<PlanRunner>, bind: &str, port: u16) -> Result<()> {
    let app = build_router(runner);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!(%addr, "planrunner serve listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
    tracing::info!("planrunner serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
}

fn parse_plan_id(id: &str) -> Result<runner_core::model::PlanId, AppError> {
    id.parse().map_err(|_| AppError::bad_request(format!("invalid plan id: {id}")))
}

fn parse_producer_id(id: &str) -> Result<ProducerId, AppError> {
    ProducerId::parse(id).map_err(|_| AppError::bad_request(format!("invalid producerId: {id}")))
}

async fn list_plans(State(runner): State<Arc<PlanRunner>>) -> Result<axum::response::Response, AppError> {
    let plans = runner.list().await;
    Ok(Json(plans).into_response())
}

async fn get_plan(State(runner): State<Arc<PlanRunner>>, Path(id): Path<String>) -> Result<axum::response::Response, AppError> {
    let plan_id = parse_plan_id(&id)?;
    let plan = runner.get(plan_id).await?;
    Ok(Json(plan).into_response())
}

async fn get_node(
    State(runner): State<Arc<PlanRunner>>,
    Path((id, producer_id)): Path<(String, String)>,
) -> Result<axum::response::Response, AppError> {
    let plan_id = parse_plan_id(&id)?;
    let producer_id = parse_producer_id(&producer_id)?;
    let node = runner.get_node(plan_id, &producer_id).await?;
    Ok(Json(serde_json::json!({
        "producerId": node.producer_id,
        "nodeId": node.node_id,
        "state": node.state,
    }))
    .into_response())
}

async fn get_node_logs(
    State(runner): State<Arc<PlanRunner>>,
    Path((id, producer_id)): Path<(String, String)>,
) -> Result<axum::response::Response, AppError> {
    let plan_id = parse_plan_id(&id)?;
    let producer_id = parse_producer_id(&producer_id)?;
    let log = runner.get_node_logs(plan_id, &producer_id, None).await?;
    Ok(log.into_response())
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;

    async fn test_runner() -> (tempfile::TempDir, Arc<PlanRunner>) {
        let tmp = tempfile::TempDir::new().unwrap();
        std::process::Command::new("git").arg("init").current_dir(tmp.path()).output().unwrap();
        std::process::Command::new("git")
            .args(["commit", "--allow-empty", "-m", "root"])
            .current_dir(tmp.path())
            .output()
            .unwrap();
        let mut config = runner_core::config::RunnerConfig::resolve(tmp.path());
        config.global_storage_dir = tmp.path().join("global");
        let runner = PlanRunner::bootstrap(config).await.unwrap();
        (tmp, runner)
    }

    async fn send(runner: Arc<PlanRunner>, uri: &str) -> axum::response::Response {
        let app = build_router(runner);
        app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap()).await.unwrap()
    }

    #[tokio::test]
    async fn list_plans_empty_is_an_empty_array() {
        let (_tmp, runner) = test_runner().await;
        let resp = send(runner, "/api/plans").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), 65_536).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json, serde_json::json!([]));
    }

    #[tokio::test]
    async fn get_unknown_plan_is_404() {
        let (_tmp, runner) = test_runner().await;
        let resp = send(runner, &format!("/api/plans/{}", runner_core::model::PlanId::new())).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_plan_id_is_400() {
        let (_tmp, runner) = test_runner().await;
        let resp = send(runner, "/api/plans/not-a-uuid").await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
