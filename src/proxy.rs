//! Per-route HTTP handler: parse JSON-RPC, enforce the MCP session gate,
//! forward to the mounted child. See `SPEC_FULL.md` §4.3.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::auth;
use crate::child_session::ChildSessionError;
use crate::route_table::RouteTable;

pub struct GatewayState {
    pub table: Arc<RouteTable>,
}

#[derive(Serialize)]
struct ErrorBody {
    detail: String,
}

/// `POST <pathPrefix><name>/mcp` — the sole handler for every mounted
/// route. Unmatched paths (nothing mounted) fall through to a 404.
pub async fn handle(
    State(state): State<Arc<GatewayState>>,
    method: Method,
    uri: Uri,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: axum::body::Bytes,
) -> Response {
    if method != Method::POST {
        return StatusCode::NOT_FOUND.into_response();
    }

    let path = strip_trailing_slash(uri.path());
    let Some(route) = state.table.lookup(path).await else {
        return StatusCode::NOT_FOUND.into_response();
    };

    if let Some(auth_config) = route.auth.as_deref() {
        let header_value = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok());
        if let Err(failure) = auth::check(auth_config, header_value) {
            return (
                failure.status,
                Json(ErrorBody {
                    detail: failure.detail,
                }),
            )
                .into_response();
        }
    }

    let request: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody {
                    detail: "malformed JSON-RPC request body".to_string(),
                }),
            )
                .into_response();
        }
    };

    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let method_name = request
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let params = request.get("params").cloned().unwrap_or(Value::Null);

    let client_ip = addr.ip().to_string();
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    let session_id = resolve_session_id(&headers, &query, &request, &client_ip, user_agent);

    let was_initialized = route.sessions.is_initialized(&session_id).await;

    let body = match method_name.as_str() {
        "initialize" => {
            route.sessions.mark_initialized(&session_id).await;
            ok_response(
                &id,
                json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": route.server_name, "version": "1.0"},
                    "sessionId": session_id,
                }),
            )
        }
        "tools/list" => {
            if !was_initialized {
                not_initialized_error(&id)
            } else {
                match route.child.list_tools().await {
                    Ok(tools) => ok_response(&id, json!({ "tools": tools })),
                    Err(error) => return child_error_response(error),
                }
            }
        }
        "tools/call" => {
            if !was_initialized {
                not_initialized_error(&id)
            } else {
                let tool_name = params.get("name").and_then(Value::as_str).unwrap_or_default();
                let arguments = params.get("arguments").cloned();
                match route.child.call_tool(tool_name, arguments).await {
                    Ok(content) => ok_response(&id, json!({ "content": content })),
                    Err(error) => return child_error_response(error),
                }
            }
        }
        _ => err_response(&id, -32601, "Method not found"),
    };

    (StatusCode::OK, Json(body)).into_response()
}

fn not_initialized_error(id: &Value) -> Value {
    err_response(&id.clone(), -32000, "Bad Request: Server not initialized")
}

fn ok_response(id: &Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

fn err_response(id: &Value, code: i64, message: &str) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
}

fn child_error_response(error: ChildSessionError) -> Response {
    match error {
        ChildSessionError::NotConnected { .. } | ChildSessionError::StreamClosed { .. } => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorBody {
                detail: "MCP server not connected".to_string(),
            }),
        )
            .into_response(),
        other => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorBody {
                detail: other.to_string(),
            }),
        )
            .into_response(),
    }
}

fn strip_trailing_slash(path: &str) -> &str {
    if path.len() > 1 {
        path.trim_end_matches('/')
    } else {
        path
    }
}

/// Resolution order: `x-session-id` header, `sessionId` query parameter,
/// `sessionId` body field, then a synthesized anonymous fingerprint.
fn resolve_session_id(
    headers: &HeaderMap,
    query: &HashMap<String, String>,
    body: &Value,
    client_ip: &str,
    user_agent: &str,
) -> String {
    if let Some(value) = headers
        .get("x-session-id")
        .and_then(|value| value.to_str().ok())
    {
        return value.to_string();
    }
    if let Some(value) = query.get("sessionId") {
        return value.clone();
    }
    if let Some(value) = body.get("sessionId").and_then(Value::as_str) {
        return value.to_string();
    }
    anon_fingerprint(client_ip, user_agent)
}

/// `"anon:" + hex(sha256(clientIP + "|" + userAgent))[0:16]`. Keep the
/// exact input bytes and truncation so stable (IP, UA) pairs collapse to
/// the same fingerprint across requests.
fn anon_fingerprint(client_ip: &str, user_agent: &str) -> String {
    let digest = Sha256::digest(format!("{client_ip}|{user_agent}").as_bytes());
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(&mut hex, "{byte:02x}");
    }
    format!("anon:{}", &hex[..16])
}
