//! Streamable HTTP endpoint: `POST /{prefix}/mcp`.
//!
//! Single-request/single-response MCP transport. Session state is keyed by
//! the `Mcp-Session-Id` header, issued on `initialize`; a fresh client must
//! initialize before any other method. Non-streaming methods answer
//! `application/json`; a streaming `tools/call` answers
//! `application/x-ndjson`, one JSON-RPC message per line.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::Json;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::StreamExt;

use crate::error::{GatewayError, StoreError};
use crate::protocol::{
    CallToolParams, JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION, StreamChunk,
    initialize_result, method,
};
use crate::server::cors;
use crate::server::{AppState, capture_request_info, error_response, store_error_status};
use crate::store::{SessionMeta, SessionType};

/// Header carrying the streamable session id.
pub const SESSION_HEADER: &str = "Mcp-Session-Id";

/// `POST /{prefix}/mcp`
pub async fn handle_mcp(
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
    let mut cors_headers = HeaderMap::new();
    if let Some(policy) = &entry.router.cors {
        cors::apply_cors(&mut cors_headers, policy, origin.as_deref());
    }

    let session_header = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    // `initialize` creates (or revives) the session and issues the id.
    if request.method == method::INITIALIZE {
        let session_id = session_header
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let known = state.store.get(&session_id).await.is_ok();
        if !known {
            let meta = SessionMeta::new(
                &session_id,
                &entry.router.prefix,
                SessionType::Streamable,
                capture_request_info(&headers, &query),
            );
            if let Err(err) = state.store.register(meta).await {
                return store_error_status(&err).into_response();
            }
        }
        if let Err(err) = state.store.mark_initialized(&session_id).await {
            return store_error_status(&err).into_response();
        }
        state.activity.touch(&session_id).await;

        let result = initialize_result(PROTOCOL_VERSION, crate::config::defaults::SERVER_NAME);
        let response = JsonRpcResponse::success(request.id, result);
        let mut http = (cors_headers, Json(response)).into_response();
        if let Ok(value) = HeaderValue::from_str(&session_id) {
            http.headers_mut().insert(SESSION_HEADER, value);
        }
        return http;
    }

    // Every other method requires an initialized session.
    let Some(session_id) = session_header else {
        let response = error_response(request.id, &GatewayError::NotInitialized);
        return (cors_headers, Json(response)).into_response();
    };
    let meta = match state.store.get(&session_id).await {
        Ok(conn) => conn.meta().await,
        Err(StoreError::SessionNotFound { .. }) => {
            let response = error_response(request.id, &GatewayError::NotInitialized);
            return (cors_headers, Json(response)).into_response();
        }
        Err(err) => return store_error_status(&err).into_response(),
    };
    if meta.prefix != entry.router.prefix {
        return StatusCode::NOT_FOUND.into_response();
    }
    if !meta.initialized {
        let response = error_response(request.id, &GatewayError::NotInitialized);
        return (cors_headers, Json(response)).into_response();
    }

    state.activity.touch(&session_id).await;

    let id = request.id.clone();
    let response = match request.method.as_str() {
        method::PING => JsonRpcResponse::success(id, serde_json::json!({})),
        m if m.starts_with(method::NOTIFICATION_PREFIX) => {
            if request.is_notification() {
                return (StatusCode::ACCEPTED, cors_headers).into_response();
            }
            JsonRpcResponse::success(id, serde_json::json!({}))
        }
        method::TOOLS_LIST => match entry.manager.fetch_all_tools().await {
            Ok(tools) => JsonRpcResponse::success(id, serde_json::json!({ "tools": tools })),
            Err(err) => error_response(id, &GatewayError::Transport(err)),
        },
        method::TOOLS_CALL => {
            let params: CallToolParams = match serde_json::from_value(request.params) {
                Ok(params) => params,
                Err(err) => {
                    let gerr = GatewayError::invalid_params(err.to_string());
                    let response = error_response(id, &gerr);
                    return (cors_headers, Json(response)).into_response();
                }
            };

            if entry.manager.is_streaming(&params.name).await {
                return stream_response(&state, &entry, id, params, &meta.request, cors_headers)
                    .await;
            }
            match entry.manager.call_tool(params, &meta.request).await {
                Ok(result) => {
                    let result = serde_json::to_value(result).unwrap_or_default();
                    JsonRpcResponse::success(id, result)
                }
                Err(err) => error_response(id, &GatewayError::Transport(err)),
            }
        }
        other => error_response(id, &GatewayError::MethodNotFound { method: other.to_string() }),
    };

    (cors_headers, Json(response)).into_response()
}

/// Answer a streaming `tools/call` as newline-delimited JSON: one JSON-RPC
/// message per chunk, the last line carrying the complete result.
async fn stream_response(
    _state: &Arc<AppState>,
    entry: &Arc<crate::runtime::RouteEntry>,
    id: Option<serde_json::Value>,
    params: CallToolParams,
    request_info: &crate::protocol::RequestInfo,
    cors_headers: HeaderMap,
) -> Response {
    let mut chunks = match entry.manager.call_tool_streaming(params, request_info).await {
        Ok(chunks) => chunks,
        Err(err) => {
            let response = error_response(id, &GatewayError::Transport(err));
            return (cors_headers, Json(response)).into_response();
        }
    };

    let lines = async_stream::stream! {
        let mut full = String::new();
        while let Some(item) = chunks.next().await {
            let (line, done) = match item {
                Ok(chunk) if chunk.is_final => {
                    full.push_str(&chunk.content);
                    let final_chunk = StreamChunk {
                        content: full.clone(),
                        chunk_id: chunk.chunk_id,
                        timestamp: chunk.timestamp,
                        is_final: true,
                        metadata: chunk.metadata,
                    };
                    let result = serde_json::to_value(final_chunk).unwrap_or_default();
                    (JsonRpcResponse::success(id.clone(), result), true)
                }
                Ok(chunk) => {
                    full.push_str(&chunk.content);
                    let result = serde_json::to_value(chunk).unwrap_or_default();
                    (JsonRpcResponse::success(id.clone(), result), false)
                }
                Err(err) => {
                    (error_response(id.clone(), &GatewayError::Transport(err)), true)
                }
            };
            let mut payload = serde_json::to_string(&line).unwrap_or_default();
            payload.push('\n');
            yield Ok::<Bytes, Infallible>(Bytes::from(payload));
            if done {
                break;
            }
        }
    };

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(lines))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    response.headers_mut().extend(cors_headers);
    response
}
