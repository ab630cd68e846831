//! The hub's public HTTP surface.
//!
//! One router carries the module registration endpoint, the `/hub` admin API and,
//! as fallback, the reverse proxy dispatcher for every other path.
use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    body::Bytes,
    extract::{ConnectInfo, Path, Query, Request, State},
    http::{StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::{
    adapters::{
        HttpHandler,
        middleware::{
            create_basic_auth_middleware, request_id_middleware, request_timing_middleware,
        },
        process::{MODULE_LOG_FILE, working_dir},
    },
    core::{HandshakeError, Lifecycle, LifecycleError, ModuleRecord},
    ports::{credentials::CredentialChecker, process::ProcessTable},
    protocol::HandshakeResponse,
};

const DEFAULT_LOG_LINES: usize = 200;

/// Errors returned by admin endpoints, rendered as `{"success": false, "error": ...}`
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("no running process known for module '{0}'")]
    NoProcess(String),

    #[error("log of module '{name}' unavailable: {reason}")]
    LogUnavailable { name: String, reason: String },
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Lifecycle(e) => match e {
                LifecycleError::UnknownModule(_) => StatusCode::NOT_FOUND,
                LifecycleError::NotRunning { .. }
                | LifecycleError::NotManaged(_)
                | LifecycleError::Busy(_) => StatusCode::CONFLICT,
                LifecycleError::FetchFailure { .. } | LifecycleError::Unreachable { .. } => {
                    StatusCode::BAD_GATEWAY
                }
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::NoProcess(_) | ApiError::LogUnavailable { .. } => StatusCode::NOT_FOUND,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Admin request failed: {}", self);
        } else {
            tracing::debug!("Admin request refused: {}", self);
        }
        (
            status,
            Json(json!({ "success": false, "error": self.to_string() })),
        )
            .into_response()
    }
}

/// Shared state of the registration and admin handlers
#[derive(Clone)]
pub struct ControlApiState {
    lifecycle: Arc<Lifecycle>,
    process_table: Arc<dyn ProcessTable>,
}

impl ControlApiState {
    pub fn new(lifecycle: Arc<Lifecycle>, process_table: Arc<dyn ProcessTable>) -> Self {
        Self {
            lifecycle,
            process_table,
        }
    }
}

/// Build the complete public router.
pub fn build_router(
    state: ControlApiState,
    proxy: HttpHandler,
    credentials: Option<Arc<dyn CredentialChecker>>,
) -> Router {
    let hub = state.lifecycle.hub().clone();
    let config = hub.config();

    let mut admin = Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/modules/{name}/setup", post(setup_module))
        .route("/modules/{name}/start", post(start_module))
        .route("/modules/{name}/stop", post(stop_module))
        .route("/modules/{name}/command/{command}", post(relay_command))
        .route("/modules/{name}/perf", get(module_perf))
        .route("/modules/{name}/log", get(module_log))
        .with_state(state.clone());
    if config.auth.protect_admin {
        admin = admin.layer(middleware::from_fn(create_basic_auth_middleware(
            credentials,
            &config.auth.realm,
        )));
    }

    Router::new()
        .route(&config.registration_path, post(register))
        .with_state(state)
        .nest("/hub", admin)
        .fallback(move |req: Request| proxy_request(proxy.clone(), req))
        .layer(middleware::from_fn(request_timing_middleware))
        .layer(middleware::from_fn(request_id_middleware))
}

async fn proxy_request(handler: HttpHandler, req: Request) -> Response {
    let client_addr = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    match handler.handle_request(req, client_addr).await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!("Request handling error: {:?}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
        }
    }
}

async fn register(State(state): State<ControlApiState>, body: Bytes) -> Response {
    match state.lifecycle.hub().handle_handshake(&body).await {
        Ok(reply) => (StatusCode::OK, Json(reply)).into_response(),
        Err(e) => {
            let status = match &e {
                HandshakeError::AuthMismatch => StatusCode::UNAUTHORIZED,
                HandshakeError::Malformed(_) => StatusCode::BAD_REQUEST,
                HandshakeError::IdentityConflict(_) => StatusCode::CONFLICT,
                HandshakeError::NoPortAvailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            tracing::warn!("Registration refused ({}): {}", status, e);
            (status, Json(HandshakeResponse::rejected())).into_response()
        }
    }
}

async fn health(State(state): State<ControlApiState>) -> Response {
    let hub = state.lifecycle.hub();
    Json(json!({
        "status": "ok",
        "hub": hub.config().name,
        "modules": hub.registry().len(),
        "tracked": hub.tracked().len(),
        "routes": hub.routes().len(),
    }))
    .into_response()
}

async fn status(State(state): State<ControlApiState>) -> Response {
    let records = state.lifecycle.hub().registry().snapshot_all().await;
    let view: Vec<&ModuleRecord> = records.iter().map(Arc::as_ref).collect();
    Json(view).into_response()
}

async fn setup_module(
    State(state): State<ControlApiState>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    state.lifecycle.setup(&name).await?;
    Ok(accepted(&state, &name).await)
}

async fn start_module(
    State(state): State<ControlApiState>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    state.lifecycle.start(&name).await?;
    Ok(accepted(&state, &name).await)
}

async fn accepted(state: &ControlApiState, name: &str) -> Response {
    let current = state
        .lifecycle
        .hub()
        .registry()
        .get(name)
        .await
        .map(|r| r.state());
    (
        StatusCode::ACCEPTED,
        Json(json!({ "success": true, "module": name, "state": current })),
    )
        .into_response()
}

async fn stop_module(
    State(state): State<ControlApiState>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let reply = state.lifecycle.stop(&name).await?;
    Ok(Json(reply).into_response())
}

async fn relay_command(
    State(state): State<ControlApiState>,
    Path((name, command)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let reply = state.lifecycle.command(&name, &command).await?;
    let status = StatusCode::from_u16(reply.code).unwrap_or(StatusCode::BAD_GATEWAY);
    Ok((status, Json(reply)).into_response())
}

async fn module_perf(
    State(state): State<ControlApiState>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let record = state
        .lifecycle
        .hub()
        .registry()
        .get(&name)
        .await
        .ok_or_else(|| LifecycleError::UnknownModule(name.clone()))?;
    let pid = record.pid().ok_or_else(|| ApiError::NoProcess(name.clone()))?;
    let usage = state
        .process_table
        .usage(pid)
        .await
        .ok_or(ApiError::NoProcess(name))?;
    Ok(Json(usage).into_response())
}

#[derive(Debug, Deserialize)]
struct LogQuery {
    lines: Option<usize>,
}

async fn module_log(
    State(state): State<ControlApiState>,
    Path(name): Path<String>,
    Query(query): Query<LogQuery>,
) -> Result<Response, ApiError> {
    let record = state
        .lifecycle
        .hub()
        .registry()
        .get(&name)
        .await
        .ok_or_else(|| LifecycleError::UnknownModule(name.clone()))?;
    let exec = record
        .exec
        .as_ref()
        .ok_or_else(|| LifecycleError::NotManaged(name.clone()))?;

    let path = working_dir(exec).join(MODULE_LOG_FILE);
    let content =
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| ApiError::LogUnavailable {
                name: name.clone(),
                reason: e.to_string(),
            })?;

    let wanted = query.lines.unwrap_or(DEFAULT_LOG_LINES);
    let lines: Vec<&str> = content.lines().collect();
    let tail = lines[lines.len().saturating_sub(wanted)..].join("\n");
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        tail,
    )
        .into_response())
}
