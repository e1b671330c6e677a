//! Request handlers and the wire error envelope.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::Json;
use axum::Router;
use serde::{Deserialize, Serialize};

use crate::error::HostError;
use crate::http::{with_deadline, AppState};
use crate::wire::{args_to_host, host_to_args, AnyValue};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/info", get(info))
        .route("/v1/run", post(run_script_once))
        .route("/v1/scripts", post(add_script))
        .route("/v1/scripts", get(find_script))
        .route("/v1/scripts/:id", put(update_script))
        .route("/v1/scripts/:id", delete(delete_script))
        .route("/v1/scripts/:id/execute", post(execute_script))
}

struct ApiError(HostError);

impl From<HostError> for ApiError {
    fn from(err: HostError) -> ApiError {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            HostError::InvalidParam(_) => StatusCode::BAD_REQUEST,
            HostError::ScriptNotFound(_) => StatusCode::NOT_FOUND,
            HostError::MultipleMatches(_) => StatusCode::CONFLICT,
            HostError::ContextTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            HostError::Compile(_) | HostError::Runtime(_) => StatusCode::UNPROCESSABLE_ENTITY,
            HostError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "request failed");
        }
        let body = serde_json::json!({
            "code": self.0.code(),
            "message": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

fn require_id(id: &str) -> Result<(), ApiError> {
    if id.is_empty() {
        return Err(HostError::InvalidParam("id must not be empty".into()).into());
    }
    Ok(())
}

fn require_script(script: &str) -> Result<(), ApiError> {
    if script.trim().is_empty() {
        return Err(HostError::InvalidParam("script must not be empty".into()).into());
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct RunScriptOnceRequest {
    pub script: String,
    #[serde(default)]
    pub args: Vec<AnyValue>,
}

#[derive(Debug, Serialize)]
pub struct ScriptReturnedValues {
    pub args: Vec<AnyValue>,
}

async fn run_script_once(
    State(state): State<AppState>,
    Json(req): Json<RunScriptOnceRequest>,
) -> Result<Json<ScriptReturnedValues>, ApiError> {
    require_script(&req.script)?;
    let args = args_to_host(&req.args)?;
    let manager = state.manager.clone();
    let values = with_deadline(state.request_timeout, "running script", async move {
        manager.run_once(&req.script, args).await
    })
    .await?;
    Ok(Json(ScriptReturnedValues {
        args: host_to_args(&values),
    }))
}

#[derive(Debug, Deserialize)]
pub struct ScriptContent {
    pub script: String,
}

#[derive(Debug, Serialize)]
pub struct ScriptIdentifier {
    pub id: String,
}

async fn add_script(
    State(state): State<AppState>,
    Json(req): Json<ScriptContent>,
) -> Result<Json<ScriptIdentifier>, ApiError> {
    require_script(&req.script)?;
    let manager = state.manager.clone();
    let id = with_deadline(state.request_timeout, "adding script", async move {
        let id = manager.new_key();
        manager.set(&id, &req.script)?;
        Ok(id)
    })
    .await?;
    Ok(Json(ScriptIdentifier { id }))
}

async fn update_script(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ScriptContent>,
) -> Result<StatusCode, ApiError> {
    require_id(&id)?;
    require_script(&req.script)?;
    let manager = state.manager.clone();
    with_deadline(state.request_timeout, "updating script", async move {
        let Some(full) = manager.exists(&id) else {
            return Err(HostError::ScriptNotFound(id));
        };
        manager.set(&full, &req.script)
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_script(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    require_id(&id)?;
    let manager = state.manager.clone();
    with_deadline(state.request_timeout, "deleting script", async move {
        let Some(full) = manager.exists(&id) else {
            return Err(HostError::ScriptNotFound(id));
        };
        manager.remove(&full)
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct ExecuteScriptRequest {
    #[serde(default)]
    pub args: Vec<AnyValue>,
}

async fn execute_script(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ExecuteScriptRequest>,
) -> Result<Json<ScriptReturnedValues>, ApiError> {
    require_id(&id)?;
    let args = args_to_host(&req.args)?;
    let manager = state.manager.clone();
    let values = with_deadline(state.request_timeout, "executing script", async move {
        manager.execute(&id, args).await
    })
    .await?;
    Ok(Json(ScriptReturnedValues {
        args: host_to_args(&values),
    }))
}

#[derive(Debug, Deserialize)]
pub struct FindScriptQuery {
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ScriptIdentifiers {
    pub id: Vec<String>,
}

async fn find_script(
    State(state): State<AppState>,
    Query(query): Query<FindScriptQuery>,
) -> Result<Json<ScriptIdentifiers>, ApiError> {
    let prefix = query.prefix.unwrap_or_default();
    let limit = query.limit.unwrap_or(state.find_limit_default);
    let manager = state.manager.clone();
    let ids = with_deadline(state.request_timeout, "finding scripts", async move {
        Ok(manager.ids_by_prefix(&prefix, limit))
    })
    .await?;
    Ok(Json(ScriptIdentifiers { id: ids }))
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "ok": true,
        "scripts": state.manager.script_count(),
    }))
}

async fn info(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "scripts": state.manager.script_count(),
        "metrics": state.manager.metrics().snapshot(),
    }))
}
