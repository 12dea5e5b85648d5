//! HTTP handlers.

use std::convert::Infallible;
use std::time::{Duration, SystemTime};

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_stream::wrappers::BroadcastStream;
use tracing::info;

use nebula_core::Error;
use nebula_core::constants::MAX_BINARY_FRAME;
use nebula_core::protocol::Frame;

use crate::hub::AgentSummary;

use super::AppState;

/// Wait for an on-demand metrics answer this long.
const METRICS_WAIT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
struct AgentInfo {
    agent_id: String,
    agent_name: String,
    agent_os: String,
    agent_last_seen: i64,
    online: bool,
}

impl From<AgentSummary> for AgentInfo {
    fn from(summary: AgentSummary) -> Self {
        let last_seen = summary
            .last_seen
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Self {
            agent_id: summary.id,
            agent_name: summary.name,
            agent_os: summary.os,
            agent_last_seen: last_seen,
            online: summary.online,
        }
    }
}

fn error_response(err: Error) -> Response {
    let status = match &err {
        Error::AgentOffline(_) => StatusCode::NOT_FOUND,
        Error::Transfer { .. } => StatusCode::CONFLICT,
        Error::Timeout => StatusCode::GATEWAY_TIMEOUT,
        Error::Channel { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
}

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "sys_status": "ok",
        "uptime": state.started.elapsed().as_secs(),
    }))
}

pub async fn list_agents(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mut agents: Vec<AgentInfo> = state.hub.agents().into_iter().map(Into::into).collect();
    agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
    Json(serde_json::json!({ "type": "agent_list", "payload": agents }))
}

pub async fn get_agent(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.hub.connection(&id) {
        Some(conn) => {
            let info = AgentInfo::from(AgentSummary {
                id: conn.id.clone(),
                name: conn.name(),
                os: conn.os(),
                last_seen: conn.last_seen(),
                online: conn.is_connected(),
            });
            Json(serde_json::json!({ "type": "agent_info", "payload": info })).into_response()
        }
        None => error_response(Error::AgentOffline(id)),
    }
}

pub async fn agent_metrics(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let (tx, rx) = oneshot::channel();
    state
        .pending
        .lock()
        .expect("pending metrics poisoned")
        .insert(id.clone(), tx);

    if let Err(e) = state
        .hub
        .send_to(&id, Frame::MasterMetricsRequest.into())
    {
        state
            .pending
            .lock()
            .expect("pending metrics poisoned")
            .remove(&id);
        return error_response(e);
    }

    match tokio::time::timeout(METRICS_WAIT, rx).await {
        Ok(Ok(report)) => {
            Json(serde_json::json!({ "type": "metrics_request", "payload": report }))
                .into_response()
        }
        _ => {
            state
                .pending
                .lock()
                .expect("pending metrics poisoned")
                .remove(&id);
            error_response(Error::Timeout)
        }
    }
}

pub async fn restart_agent(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.hub.send_to(&id, Frame::MasterRestartRequest.into()) {
        Ok(()) => Json(serde_json::json!({
            "success": true,
            "message": "Agent restart initiated",
        }))
        .into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn uninstall_agent(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state
        .hub
        .send_to(&id, Frame::MasterUninstallInitiated.into())
    {
        Ok(()) => Json(serde_json::json!({
            "success": true,
            "message": "Agent uninstallation initiated",
        }))
        .into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct TransferRequestBody {
    pub path: String,
}

/// `POST /api/v1/agents/:id/filesystem/:source` — `:id` asks for `path`
/// from `:source`. Accepted transfers proceed asynchronously.
pub async fn request_transfer(
    State(state): State<AppState>,
    Path((id, source)): Path<(String, String)>,
    Json(body): Json<TransferRequestBody>,
) -> Response {
    match state.transfer.request_transfer(&id, &source, &body.path) {
        Ok(connection_id) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "success": true,
                "connection_id": connection_id,
            })),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct WsParams {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub os: String,
}

pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Response {
    if params.id.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "id query parameter is required" })),
        )
            .into_response();
    }
    info!(id = %params.id, name = %params.name, os = %params.os, "WebSocket upgrade");
    let hub = state.hub.clone();
    ws.max_message_size(MAX_BINARY_FRAME + 64 * 1024)
        .on_upgrade(move |socket| hub.attach(params.name, params.id, params.os, socket))
}

pub async fn sse_stream(
    State(state): State<AppState>,
) -> Sse<impl futures_util::Stream<Item = std::result::Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.hub.sse().subscribe()).filter_map(|event| async move {
        event
            .ok()
            .map(|data| Ok::<_, Infallible>(Event::default().data(data)))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
