//! SSE gateway endpoints: `GET /{prefix}/sse` and
//! `POST /{prefix}/message?session_id=…`.
//!
//! The GET registers a session and streams its queue as SSE frames, opening
//! with an `endpoint` event naming the message URL. Every POSTed JSON-RPC
//! request is dispatched asynchronously; the POST answers `202 Accepted`
//! and the responses travel as `message` events on the open stream.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum_extra::extract::CookieJar;
use futures::StreamExt;

use crate::error::GatewayError;
use crate::protocol::{
    CallToolParams, JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION, StreamChunk,
    initialize_result, method,
};
use crate::runtime::RouteEntry;
use crate::server::cors;
use crate::server::{AppState, capture_request_info, error_response, store_error_status};
use crate::store::{CLOSE_EVENT, Connection, Message, SessionMeta, SessionType};

/// Unregisters the session when the SSE stream is dropped, client
/// disconnects included.
struct DisconnectGuard {
    state: Arc<AppState>,
    session_id: String,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        let state = Arc::clone(&self.state);
        let session_id = self.session_id.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(err) = state.store.unregister(&session_id).await {
                    tracing::warn!(session_id = %session_id, error = %err, "unregister failed");
                }
                state.activity.remove(&session_id).await;
            });
        }
    }
}

/// `GET /{prefix}/sse`
pub async fn handle_sse(
    State(state): State<Arc<AppState>>,
    Path(prefix): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    jar: CookieJar,
    headers: HeaderMap,
) -> Response {
    let Some(entry) = state.runtime.resolve(&prefix) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let origin = headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let request_info = capture_request_info(&headers, &query);

    if let Some(cookie) = jar.get(&state.settings.session_cookie) {
        if let Some(identity) = cors::decode_identity(cookie.value()) {
            tracing::debug!(identity = %identity, prefix = %prefix, "identified session");
        }
    }

    let session_id = query
        .get("session_id")
        .cloned()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let meta = SessionMeta::new(
        &session_id,
        &entry.router.prefix,
        SessionType::Sse,
        request_info,
    );
    let conn = match state.store.register(meta).await {
        Ok(conn) => conn,
        Err(err) => return store_error_status(&err).into_response(),
    };
    state.activity.touch(&session_id).await;

    // First event: where to POST JSON-RPC requests for this session.
    let endpoint = format!("/{}/message?session_id={}", entry.router.prefix, session_id);
    if conn.send(Message::new("endpoint", endpoint)).await.is_err() {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    let mut inner = match conn.subscribe().await {
        Ok(stream) => stream,
        Err(err) => return store_error_status(&err).into_response(),
    };

    tracing::info!(session_id = %session_id, prefix = %prefix, "sse session opened");

    let guard = DisconnectGuard { state: Arc::clone(&state), session_id: session_id.clone() };
    let activity_state = Arc::clone(&state);
    let activity_id = session_id.clone();
    let stream = async_stream::stream! {
        let _guard = guard;
        while let Some(message) = inner.next().await {
            activity_state.activity.touch(&activity_id).await;
            yield Ok::<Event, Infallible>(
                Event::default().event(message.event).data(message.data),
            );
        }
        // Idle timeout, server close or unregister: say goodbye explicitly.
        yield Ok(Event::default().event(CLOSE_EVENT).data(""));
    };

    let mut response_headers = HeaderMap::new();
    response_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response_headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    if let Some(policy) = &entry.router.cors {
        cors::apply_cors(&mut response_headers, policy, origin.as_deref());
    }

    (
        response_headers,
        Sse::new(stream)
            .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("ping")),
    )
        .into_response()
}

/// `OPTIONS` preflight for all gateway endpoints of a prefix.
pub async fn handle_preflight(
    State(state): State<Arc<AppState>>,
    Path(prefix): Path<String>,
    headers: HeaderMap,
) -> Response {
    let Some(entry) = state.runtime.resolve(&prefix) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    let policy = entry.router.cors.clone().unwrap_or_default();
    cors::preflight(&policy, origin)
}

/// `POST /{prefix}/message?session_id=…`
pub async fn handle_message(
    State(state): State<Arc<AppState>>,
    Path(prefix): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(request): Json<JsonRpcRequest>,
) -> Response {
    let Some(entry) = state.runtime.resolve(&prefix) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let Some(session_id) = query.get("session_id").cloned() else {
        return (StatusCode::BAD_REQUEST, "missing session_id").into_response();
    };

    // The session must exist and belong to this prefix; otherwise nothing
    // upstream is touched.
    let conn = match state.store.get(&session_id).await {
        Ok(conn) => conn,
        Err(err) => return store_error_status(&err).into_response(),
    };
    let meta = conn.meta().await;
    if meta.prefix != entry.router.prefix {
        return StatusCode::NOT_FOUND.into_response();
    }

    state.activity.touch(&session_id).await;

    let dispatch_state = Arc::clone(&state);
    let dispatch_entry = Arc::clone(&entry);
    tokio::spawn(async move {
        dispatch_request(dispatch_state, dispatch_entry, conn, request).await;
    });

    let mut response_headers = HeaderMap::new();
    if let Some(policy) = &entry.router.cors {
        cors::apply_cors(&mut response_headers, policy, origin.as_deref());
    }
    (StatusCode::ACCEPTED, response_headers).into_response()
}

/// Push one JSON-RPC response onto the session stream. Returns false when
/// the session is gone, so callers can abandon in-flight work.
async fn respond(conn: &Arc<dyn Connection>, response: &JsonRpcResponse) -> bool {
    let payload = serde_json::to_string(response).unwrap_or_default();
    if conn.send(Message::new("message", payload)).await.is_err() {
        tracing::debug!("session closed while responding, dropped");
        return false;
    }
    true
}

/// Dispatch one client request against the session's routing entry.
pub(crate) async fn dispatch_request(
    state: Arc<AppState>,
    entry: Arc<RouteEntry>,
    conn: Arc<dyn Connection>,
    request: JsonRpcRequest,
) {
    let id = request.id.clone();

    match request.method.as_str() {
        method::INITIALIZE => {
            let meta = conn.meta().await;
            if let Err(err) = state.store.mark_initialized(&meta.id).await {
                tracing::warn!(session_id = %meta.id, error = %err, "mark_initialized failed");
            }
            let result = initialize_result(PROTOCOL_VERSION, crate::config::defaults::SERVER_NAME);
            respond(&conn, &JsonRpcResponse::success(id, result)).await;
        }
        method::PING => {
            respond(&conn, &JsonRpcResponse::success(id, serde_json::json!({}))).await;
        }
        m if m.starts_with(method::NOTIFICATION_PREFIX) => {
            // Acknowledged, no upstream work. Pure notifications get no
            // response at all.
            if !request.is_notification() {
                respond(&conn, &JsonRpcResponse::success(id, serde_json::json!({}))).await;
            }
        }
        method::TOOLS_LIST => {
            if !conn.meta().await.initialized {
                respond(&conn, &error_response(id, &GatewayError::NotInitialized)).await;
                return;
            }
            match entry.manager.fetch_all_tools().await {
                Ok(tools) => {
                    let result = serde_json::json!({ "tools": tools });
                    respond(&conn, &JsonRpcResponse::success(id, result)).await;
                }
                Err(err) => {
                    respond(&conn, &error_response(id, &GatewayError::Transport(err))).await;
                }
            }
        }
        method::TOOLS_CALL => {
            if !conn.meta().await.initialized {
                respond(&conn, &error_response(id, &GatewayError::NotInitialized)).await;
                return;
            }
            let params: CallToolParams = match serde_json::from_value(request.params) {
                Ok(params) => params,
                Err(err) => {
                    let gerr = GatewayError::invalid_params(err.to_string());
                    respond(&conn, &error_response(id, &gerr)).await;
                    return;
                }
            };

            let request_info = conn.meta().await.request;
            if entry.manager.is_streaming(&params.name).await {
                stream_call(&entry, &conn, id, params, &request_info).await;
            } else {
                match entry.manager.call_tool(params, &request_info).await {
                    Ok(result) => {
                        let result = serde_json::to_value(result).unwrap_or_default();
                        respond(&conn, &JsonRpcResponse::success(id, result)).await;
                    }
                    Err(err) => {
                        respond(&conn, &error_response(id, &GatewayError::Transport(err))).await;
                    }
                }
            }
        }
        other => {
            let gerr = GatewayError::MethodNotFound { method: other.to_string() };
            respond(&conn, &error_response(id, &gerr)).await;
        }
    }
}

/// Forward a chunk stream as successive `message` events. Chunk ids are
/// strictly increasing; the final event carries the accumulated complete
/// result and `isFinal: true`, and nothing follows it for this request id.
async fn stream_call(
    entry: &Arc<RouteEntry>,
    conn: &Arc<dyn Connection>,
    id: Option<serde_json::Value>,
    params: CallToolParams,
    request_info: &crate::protocol::RequestInfo,
) {
    let mut chunks = match entry.manager.call_tool_streaming(params, request_info).await {
        Ok(chunks) => chunks,
        Err(err) => {
            respond(conn, &error_response(id, &GatewayError::Transport(err))).await;
            return;
        }
    };

    let mut full = String::new();
    while let Some(item) = chunks.next().await {
        match item {
            Ok(chunk) if chunk.is_final => {
                full.push_str(&chunk.content);
                let final_chunk = StreamChunk {
                    content: full,
                    chunk_id: chunk.chunk_id,
                    timestamp: chunk.timestamp,
                    is_final: true,
                    metadata: chunk.metadata,
                };
                let result = serde_json::to_value(final_chunk).unwrap_or_default();
                respond(conn, &JsonRpcResponse::success(id, result)).await;
                return;
            }
            Ok(chunk) => {
                full.push_str(&chunk.content);
                let result = serde_json::to_value(chunk).unwrap_or_default();
                if !respond(conn, &JsonRpcResponse::success(id.clone(), result)).await {
                    // Client is gone: dropping the stream aborts the
                    // upstream call.
                    return;
                }
            }
            Err(err) => {
                respond(conn, &error_response(id, &GatewayError::Transport(err))).await;
                return;
            }
        }
    }

    // Stream ended without a final chunk: the call was torn down.
    respond(
        conn,
        &error_response(id, &GatewayError::Transport(crate::error::TransportError::Cancelled)),
    )
    .await;
}
