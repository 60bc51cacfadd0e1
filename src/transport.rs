//! Transport Host: hosts the remote-call protocol over HTTP — session negotiation,
//! JSON-RPC request routing to the Tool Dispatcher's five tools, and shutdown. Hand-routed
//! directly against axum and `serde_json::Value` rather than through an external MCP SDK
//! crate, since the session-id/error-code contract here is small and fully self-contained.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ToolError;
use crate::tools::{
    GetChannelMessagesParams, ListChannelsParams, ScheduleMessageSyncParams, SearchChannelsParams, ToolDispatcher,
};

const SESSION_HEADER: &str = "mcp-session-id";

const ERR_PARSE: i64 = -32700;
const ERR_INVALID_REQUEST: i64 = -32600;
const ERR_METHOD_NOT_FOUND: i64 = -32601;
const ERR_NO_SESSION: i64 = -32000;
const ERR_SESSION_NOT_FOUND: i64 = -32001;
const ERR_INTERNAL: i64 = -32603;

/// A live per-connection session. The transport handle here is just the
/// session id itself — the actual request/response plumbing is stateless HTTP, so there is
/// nothing else to own per session beyond membership in `sessions`.
struct SessionRecord;

type Sessions = Arc<RwLock<HashMap<String, SessionRecord>>>;

#[derive(Clone)]
pub struct AppState {
    dispatcher: Arc<ToolDispatcher>,
    sessions: Sessions,
}

impl AppState {
    pub fn new(dispatcher: Arc<ToolDispatcher>) -> Self {
        Self {
            dispatcher,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/mcp", post(mcp_post).get(mcp_get).delete(mcp_delete).options(mcp_options))
        .route("/health", get(health))
        .fallback(not_found)
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn not_found() -> Response {
    json_rpc_error_response(StatusCode::NOT_FOUND, None, ERR_METHOD_NOT_FOUND, "Method not found")
}

async fn mcp_options() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn mcp_get(State(state): State<AppState>, headers: HeaderMap) -> Response {
    match validate_session_header(&state.sessions, &headers, "", None).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(response) => response,
    }
}

async fn mcp_delete(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(response) = validate_session_header(&state.sessions, &headers, "", None).await {
        return response;
    }
    // validate_session_header only succeeds for a non-"initialize" method when the header is
    // present and registered, so this is always `Some` here.
    if let Some(session_id) = session_header(&headers) {
        state.sessions.write().await.remove(&session_id);
    }
    StatusCode::NO_CONTENT.into_response()
}

/// Enforces the session-header contract for any non-`initialize` request: present and
/// registered in `sessions`, or rejected with the matching JSON-RPC error. `initialize`
/// always passes, since it's the call that creates a session.
async fn validate_session_header(
    sessions: &Sessions,
    headers: &HeaderMap,
    method: &str,
    id: Option<Value>,
) -> Result<(), Response> {
    if method == "initialize" {
        return Ok(());
    }
    match session_header(headers) {
        None => Err(json_rpc_error_response(
            StatusCode::BAD_REQUEST,
            id,
            ERR_NO_SESSION,
            "Bad Request: No valid session ID provided",
        )),
        Some(session_id) if sessions.read().await.contains_key(&session_id) => Ok(()),
        Some(_) => Err(json_rpc_error_response(StatusCode::NOT_FOUND, id, ERR_SESSION_NOT_FOUND, "Session not found")),
    }
}

/// Mints a new session id, registers it, and builds the `initialize` response carrying it
/// in the `mcp-session-id` response header.
async fn start_session(sessions: &Sessions, id: Option<Value>) -> Response {
    let session_id = Uuid::new_v4().to_string();
    sessions.write().await.insert(session_id.clone(), SessionRecord);
    info!(session_id = %session_id, "session initialized");

    let result = json!({
        "protocolVersion": "2024-11-05",
        "serverInfo": {"name": "telegram-agent-bridge", "version": env!("CARGO_PKG_VERSION")},
        "capabilities": {"tools": {}},
    });

    let mut response = Json(json!({"jsonrpc": "2.0", "id": id, "result": result})).into_response();
    if let Ok(value) = HeaderValue::from_str(&session_id) {
        response.headers_mut().insert(HeaderName::from_static(SESSION_HEADER), value);
    }
    response
}

async fn mcp_post(State(state): State<AppState>, headers: HeaderMap, body: axum::body::Bytes) -> Response {
    let request: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "failed to parse JSON-RPC request body");
            return json_rpc_error_response(StatusCode::BAD_REQUEST, None, ERR_PARSE, "Parse error");
        }
    };

    let id = request.get("id").cloned();
    let method = match request.get("method").and_then(Value::as_str) {
        Some(m) => m.to_string(),
        None => {
            return json_rpc_error_response(StatusCode::BAD_REQUEST, id, ERR_INVALID_REQUEST, "Invalid Request");
        }
    };
    let params = request.get("params").cloned().unwrap_or(Value::Null);

    if let Err(response) = validate_session_header(&state.sessions, &headers, &method, id.clone()).await {
        return response;
    }

    if method == "initialize" {
        return start_session(&state.sessions, id).await;
    }

    match method.as_str() {
        "tools/list" => Json(json!({"jsonrpc": "2.0", "id": id, "result": {"tools": tool_definitions()}})).into_response(),
        "tools/call" => dispatch_tool_call(&state, id, params).await,
        other => json_rpc_error_response(
            StatusCode::OK,
            id,
            ERR_METHOD_NOT_FOUND,
            &format!("Method not found: {other}"),
        ),
    }
}

async fn dispatch_tool_call(state: &AppState, id: Option<Value>, params: Value) -> Response {
    let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
    let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

    let result = match name {
        "listChannels" => match deserialize::<ListChannelsParams>(arguments) {
            Ok(p) => state.dispatcher.list_channels(p).await.map(|v| json!(v)),
            Err(e) => Err(e),
        },
        "searchChannels" => match deserialize::<SearchChannelsParams>(arguments) {
            Ok(p) => state.dispatcher.search_channels(p).await.map(|v| json!(v)),
            Err(e) => Err(e),
        },
        "getChannelMessages" => match deserialize::<GetChannelMessagesParams>(arguments) {
            Ok(p) => state.dispatcher.get_channel_messages(p).await.map(|v| json!(v)),
            Err(e) => Err(e),
        },
        "scheduleMessageSync" => match deserialize::<ScheduleMessageSyncParams>(arguments) {
            Ok(p) => state.dispatcher.schedule_message_sync(p).await.map(|v| json!(v)),
            Err(e) => Err(e),
        },
        "listMessageSyncJobs" => state.dispatcher.list_message_sync_jobs().await.map(|v| json!(v)),
        other => Err(ToolError::InvalidArgument(format!("unknown tool: {other}"))),
    };

    match result {
        Ok(payload) => {
            let content = json!({"content": [{"type": "text", "text": payload.to_string()}]});
            Json(json!({"jsonrpc": "2.0", "id": id, "result": content})).into_response()
        }
        Err(e) => json_rpc_error_response(StatusCode::OK, id, ERR_INTERNAL, &e.to_string()),
    }
}

fn deserialize<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, ToolError> {
    serde_json::from_value(value).map_err(|e| ToolError::InvalidArgument(e.to_string()))
}

fn tool_definitions() -> Value {
    json!([
        {"name": "listChannels", "description": "List known Telegram dialogs (channels, chats, users)."},
        {"name": "searchChannels", "description": "Search known dialogs by title or username substring."},
        {"name": "getChannelMessages", "description": "Fetch recent messages from a channel, optionally regex-filtered."},
        {"name": "scheduleMessageSync", "description": "Queue a background archive job for a channel."},
        {"name": "listMessageSyncJobs", "description": "List all background archive jobs and their status."},
    ])
}

fn session_header(headers: &HeaderMap) -> Option<String> {
    headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()).map(str::to_string)
}

fn json_rpc_error_response(status: StatusCode, id: Option<Value>, code: i64, message: &str) -> Response {
    let body = json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {"code": code, "message": message},
    });
    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_definitions_lists_all_five_tools() {
        let defs = tool_definitions();
        let names: Vec<&str> = defs.as_array().unwrap().iter().map(|d| d["name"].as_str().unwrap()).collect();
        assert_eq!(
            names,
            vec!["listChannels", "searchChannels", "getChannelMessages", "scheduleMessageSync", "listMessageSyncJobs"]
        );
    }

    #[test]
    fn deserialize_rejects_malformed_arguments() {
        let result: Result<SearchChannelsParams, ToolError> = deserialize(json!({"limit": "not a number"}));
        assert!(result.is_err());
    }

    fn empty_sessions() -> Sessions {
        Arc::new(RwLock::new(HashMap::new()))
    }

    async fn error_code(response: Response) -> i64 {
        assert_ne!(response.status(), StatusCode::OK, "expected an error status");
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        body["error"]["code"].as_i64().unwrap()
    }

    #[tokio::test]
    async fn non_initialize_request_without_session_header_is_rejected() {
        let sessions = empty_sessions();
        let headers = HeaderMap::new();

        let result = validate_session_header(&sessions, &headers, "tools/list", Some(json!(1))).await;
        let code = error_code(result.unwrap_err()).await;
        assert_eq!(code, ERR_NO_SESSION);
    }

    #[tokio::test]
    async fn request_with_unknown_session_id_is_rejected() {
        let sessions = empty_sessions();
        let mut headers = HeaderMap::new();
        headers.insert(HeaderName::from_static(SESSION_HEADER), HeaderValue::from_static("does-not-exist"));

        let result = validate_session_header(&sessions, &headers, "tools/list", Some(json!(1))).await;
        let code = error_code(result.unwrap_err()).await;
        assert_eq!(code, ERR_SESSION_NOT_FOUND);
    }

    #[tokio::test]
    async fn initialize_is_exempt_from_session_header_checks() {
        let sessions = empty_sessions();
        let headers = HeaderMap::new();

        assert!(validate_session_header(&sessions, &headers, "initialize", Some(json!(1))).await.is_ok());
    }

    #[tokio::test]
    async fn session_minted_by_initialize_is_accepted_by_a_followup_call() {
        let sessions = empty_sessions();

        let response = start_session(&sessions, Some(json!(1))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let session_id = response
            .headers()
            .get(SESSION_HEADER)
            .expect("initialize response carries a session id header")
            .to_str()
            .unwrap()
            .to_string();

        let mut headers = HeaderMap::new();
        headers.insert(HeaderName::from_static(SESSION_HEADER), HeaderValue::from_str(&session_id).unwrap());

        assert!(validate_session_header(&sessions, &headers, "tools/list", Some(json!(2))).await.is_ok());
    }
}
