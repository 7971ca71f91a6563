//! The proxy's HTTP surface: an OpenAI-compatible front plus native
//! provider pass-through, backed by the dispatch facade.

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::Response;
use axum::routing::{any, get, post};
use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use quotio_core::{AppState, DispatchOutcome, ProxyError};
use quotio_provider_core::RuntimeStatus;

const REQUEST_ID_HEADER: &str = "x-quotio-request-id";

pub fn proxy_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/messages", post(messages))
        .route("/v1/messages/count_tokens", post(count_tokens))
        .route("/v1/models", get(models))
        .route("/healthz", get(healthz))
        .route("/providers/{provider}/{*path}", any(pass_through))
        .with_state(state)
}

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch_generate(state, headers, body).await
}

/// Anthropic-dialect inbound route; the payload stays opaque so the same
/// dispatch path applies.
async fn messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch_generate(state, headers, body).await
}

async fn dispatch_generate(state: Arc<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    if let Err(err) = state.auth.check(bearer(&headers)) {
        return error_response(err, None);
    }
    let trace_id = Uuid::new_v4().to_string();
    let started = Instant::now();
    let cancel = CancellationToken::new();

    match state.facade.dispatch_chat(body, &cancel).await {
        Ok(DispatchOutcome::Body(bytes)) => {
            info!(
                event = "request_completed",
                trace_id = %trace_id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                stream = false
            );
            json_response(StatusCode::OK, bytes, &trace_id)
        }
        Ok(DispatchOutcome::Stream(rx)) => {
            info!(
                event = "request_streaming",
                trace_id = %trace_id,
                elapsed_ms = started.elapsed().as_millis() as u64
            );
            stream_response(rx, cancel, &trace_id)
        }
        Err(err) => {
            info!(
                event = "request_failed",
                trace_id = %trace_id,
                status = err.status,
                elapsed_ms = started.elapsed().as_millis() as u64
            );
            error_response(err, Some(&trace_id))
        }
    }
}

async fn count_tokens(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(err) = state.auth.check(bearer(&headers)) {
        return error_response(err, None);
    }
    let trace_id = Uuid::new_v4().to_string();
    let cancel = CancellationToken::new();
    match state.facade.count_tokens(body, &cancel).await {
        Ok(bytes) => json_response(StatusCode::OK, bytes, &trace_id),
        Err(err) => error_response(err, Some(&trace_id)),
    }
}

async fn models(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(err) = state.auth.check(bearer(&headers)) {
        return error_response(err, None);
    }
    let list = state.facade.models();
    let body = serde_json::to_vec(&list).unwrap_or_else(|_| b"{}".to_vec());
    json_response(StatusCode::OK, Bytes::from(body), "")
}

async fn pass_through(
    State(state): State<Arc<AppState>>,
    Path((provider, path)): Path<(String, String)>,
    method: Method,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(err) = state.auth.check(bearer(&headers)) {
        return error_response(err, None);
    }
    let trace_id = Uuid::new_v4().to_string();
    let cancel = CancellationToken::new();
    let path_and_query = match query {
        Some(query) => format!("{path}?{query}"),
        None => path,
    };
    let body = if body.is_empty() { None } else { Some(body) };
    match state
        .facade
        .pass_through(&provider, method.as_str(), &path_and_query, body, &cancel)
        .await
    {
        Ok(response) => {
            let mut out = Response::new(Body::from(response.body));
            *out.status_mut() =
                StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
            for (name, value) in &response.headers {
                if let (Ok(name), Ok(value)) = (
                    http::header::HeaderName::from_bytes(name.as_bytes()),
                    HeaderValue::from_str(value),
                ) {
                    out.headers_mut().insert(name, value);
                }
            }
            set_request_id(&mut out, &trace_id);
            out
        }
        Err(err) => error_response(err, Some(&trace_id)),
    }
}

/// Pool snapshot for the external UI: per-credential status plus cooldown
/// remaining for any model still blocked.
async fn healthz(State(state): State<Arc<AppState>>) -> Response {
    let now = time::OffsetDateTime::now_utc();
    let snapshot = state.pool.snapshot().await;
    let mut available = 0usize;
    let mut cooling = 0usize;
    let mut disabled = 0usize;
    let mut rows = Vec::new();
    for cred in &snapshot {
        let status = match cred.runtime_status {
            _ if cred.is_disabled() => "disabled",
            RuntimeStatus::Active => "active",
            RuntimeStatus::Error => "error",
            RuntimeStatus::Pending => "pending",
            RuntimeStatus::Disabled => "disabled",
        };
        let cooldowns: Vec<serde_json::Value> = cred
            .model_states
            .iter()
            .filter_map(|(model, model_state)| {
                let until = model_state.next_retry_after?;
                if until <= now {
                    return None;
                }
                Some(serde_json::json!({
                    "model": model,
                    "remaining_secs": (until - now).whole_seconds().max(0),
                }))
            })
            .collect();
        match status {
            "disabled" => disabled += 1,
            _ if !cooldowns.is_empty() => cooling += 1,
            "active" => available += 1,
            _ => {}
        }
        rows.push(serde_json::json!({
            "id": cred.auth.id,
            "provider": cred.auth.provider,
            "status": status,
            "cooldowns": cooldowns,
        }));
    }
    let overall = if snapshot.is_empty() || available == 0 {
        "unhealthy"
    } else if cooling > 0 || disabled > 0 {
        "degraded"
    } else {
        "healthy"
    };
    let body = serde_json::json!({
        "status": overall,
        "credentials_total": snapshot.len(),
        "credentials_available": available,
        "credentials_cooling": cooling,
        "credentials_disabled": disabled,
        "credentials": rows,
    });
    json_response(
        StatusCode::OK,
        Bytes::from(body.to_string()),
        "",
    )
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers.get(AUTHORIZATION).and_then(|value| value.to_str().ok())
}

fn json_response(status: StatusCode, body: Bytes, trace_id: &str) -> Response {
    let mut resp = Response::new(Body::from(body));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    set_request_id(&mut resp, trace_id);
    resp
}

fn stream_response(
    rx: quotio_provider_core::ChunkStream,
    cancel: CancellationToken,
    trace_id: &str,
) -> Response {
    // The drop guard rides inside the stream: when the client goes away and
    // the body is dropped, the token cancels and upstream readers unwind.
    let guard = cancel.drop_guard();
    let stream = ReceiverStream::new(rx).map(move |chunk| {
        let _keep = &guard;
        chunk
    });
    let mut resp = Response::new(Body::from_stream(stream));
    *resp.status_mut() = StatusCode::OK;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    resp.headers_mut()
        .insert("cache-control", HeaderValue::from_static("no-cache"));
    set_request_id(&mut resp, trace_id);
    resp
}

fn error_response(err: ProxyError, trace_id: Option<&str>) -> Response {
    let mut resp = Response::new(Body::from(err.body));
    *resp.status_mut() =
        StatusCode::from_u16(err.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Some(trace_id) = trace_id {
        set_request_id(&mut resp, trace_id);
    }
    resp
}

fn set_request_id(resp: &mut Response, trace_id: &str) {
    if trace_id.is_empty() {
        return;
    }
    if let Ok(value) = HeaderValue::from_str(trace_id) {
        resp.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
}
