//! Administrative HTTP surface, served only alongside the streamable-http
//! downstream transport. Every route is guarded by a bearer token when one is
//! configured.

use axum::{
    Json, Router,
    extract::{Path, Request, State},
    http::{HeaderMap, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::backend::BackendManager;
use crate::backend::error::ProxyError;
use crate::document::{DocumentStore, ServerConfig};
use crate::merge;
use crate::proxy::ProxyServer;

#[derive(Clone)]
pub struct AdminState {
    pub proxy: ProxyServer,
    pub manager: Arc<BackendManager>,
    pub store: Arc<DocumentStore>,
    pub token: Option<String>,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/mcp_servers", get(list_servers).post(add_server))
        .route("/mcp_servers/{name}", axum::routing::delete(remove_server))
        .route("/mcp_tools", get(list_tools))
        .route("/prune", post(prune))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_bearer,
        ))
        .with_state(state)
}

/// True when the request may pass: either no token is configured, or the
/// Authorization header carries exactly the configured bearer token.
fn authorized(headers: &HeaderMap, token: &Option<String>) -> bool {
    let Some(expected) = token else {
        return true;
    };
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|presented| presented == expected)
}

async fn require_bearer(State(state): State<AdminState>, req: Request, next: Next) -> Response {
    if !authorized(req.headers(), &state.token) {
        warn!(path = %req.uri().path(), "rejected unauthorized admin request");
        return StatusCode::UNAUTHORIZED.into_response();
    }
    next.run(req).await
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    connected: Vec<String>,
    pending: Vec<String>,
}

async fn health(State(state): State<AdminState>) -> Json<HealthResponse> {
    let mut connected = state.manager.connected_names();
    let mut pending = state.manager.pending_names();
    connected.sort();
    pending.sort();
    Json(HealthResponse {
        status: "ok",
        connected,
        pending,
    })
}

#[derive(Serialize)]
struct ServerSummary {
    name: String,
    status: &'static str,
    always_on: bool,
}

#[derive(Serialize)]
struct ListServersResponse {
    active_servers: Vec<ServerSummary>,
}

async fn list_servers(State(state): State<AdminState>) -> Json<ListServersResponse> {
    let doc = state.store.snapshot().await;
    let connected = state.manager.connected_names();
    let active_servers = doc
        .servers
        .iter()
        .map(|(name, config)| ServerSummary {
            name: name.clone(),
            status: if connected.contains(name) {
                "connected"
            } else {
                "pending"
            },
            always_on: config.always_on,
        })
        .collect();
    Json(ListServersResponse { active_servers })
}

#[derive(Deserialize)]
struct AddServerRequest {
    name: String,
    #[serde(flatten)]
    config: ServerConfig,
}

#[derive(Serialize)]
struct AddServerResponse {
    name: String,
    #[serde(flatten)]
    config: ServerConfig,
}

async fn add_server(
    State(state): State<AdminState>,
    Json(request): Json<AddServerRequest>,
) -> Response {
    info!(backend = %request.name, "admin: adding backend");
    match state
        .proxy
        .register_backend(&request.name, request.config.clone(), true)
        .await
    {
        Ok(()) => {
            // Echo the document entry, which carries the tools the eager
            // discovery pass just merged in.
            let doc = state.store.snapshot().await;
            let config = doc
                .servers
                .get(&request.name)
                .cloned()
                .unwrap_or(request.config);
            (
                StatusCode::CREATED,
                Json(AddServerResponse {
                    name: request.name,
                    config,
                }),
            )
                .into_response()
        }
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

async fn remove_server(State(state): State<AdminState>, Path(name): Path<String>) -> Response {
    info!(backend = %name, "admin: removing backend");
    match state.proxy.unregister_backend(&name, true).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(ProxyError::UnknownBackend(_)) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[derive(Serialize)]
struct ListToolsResponse {
    tools: BTreeMap<String, Vec<String>>,
}

async fn list_tools(State(state): State<AdminState>) -> Json<ListToolsResponse> {
    let doc = state.store.snapshot().await;
    let tools = doc
        .servers
        .iter()
        .map(|(backend, config)| {
            let names = config
                .tools
                .iter()
                .filter(|(_, policy)| policy.enabled && !policy.stale)
                .map(|(name, _)| name.clone())
                .collect();
            (backend.clone(), names)
        })
        .collect();
    Json(ListToolsResponse { tools })
}

#[derive(Serialize)]
struct PruneResponse {
    removed: usize,
}

async fn prune(State(state): State<AdminState>) -> Response {
    let doc = state.store.snapshot().await;
    let (pruned, removed) = merge::prune_stale_disabled(&doc);
    state.store.replace(pruned).await;
    if let Err(e) = state.store.save().await {
        warn!(error = %e, "failed to persist document after prune");
    }
    info!(removed, "admin: pruned stale disabled tools");
    Json(PruneResponse { removed }).into_response()
}
