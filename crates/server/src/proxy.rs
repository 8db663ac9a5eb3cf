//! Forwarding of `/api/*` to the supervised agent.

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, HeaderName, HeaderValue, Request},
    response::Response,
};
use futures::TryStreamExt;
use tracing::{debug, warn};

use crate::error::ApiError;
use crate::state::AppState;

pub const MAX_BODY_BYTES: usize = 50 * 1024 * 1024;

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Request headers worth forwarding: no hop-by-hop, `Host` or length.
pub fn forward_request_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if is_hop_by_hop(name) || name == header::HOST || name == header::CONTENT_LENGTH {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

pub fn forward_response_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if !is_hop_by_hop(name) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

pub fn wants_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("text/event-stream"))
}

fn enforce_body_limit(headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(value) = headers.get(header::CONTENT_LENGTH) else {
        return Ok(());
    };
    let length = value
        .to_str()
        .ok()
        .and_then(|raw| raw.parse::<usize>().ok())
        .ok_or_else(|| ApiError::Validation("invalid Content-Length".into()))?;
    if length > MAX_BODY_BYTES {
        return Err(ApiError::PayloadTooLarge(MAX_BODY_BYTES));
    }
    Ok(())
}

/// Fallback handler: everything under `/api` the host does not serve itself.
pub async fn proxy_handler(
    State(state): State<AppState>,
    req: Request<Body>,
) -> Result<Response, ApiError> {
    let path = req.uri().path().to_string();
    if !path.starts_with("/api") {
        return Err(ApiError::NotFound(format!("no route for {path}")));
    }

    let handle = state.supervisor.snapshot();
    let Some(endpoint) = handle.endpoint() else {
        let reason = handle
            .last_error
            .clone()
            .unwrap_or_else(|| "OpenCode is not running".to_string());
        return Err(ApiError::Unavailable(reason));
    };

    let mut url = format!("{}{}", endpoint.base_url(), handle.rewrite_path(&path));
    if let Some(query) = req.uri().query().filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(query);
    }

    let (parts, body) = req.into_parts();
    enforce_body_limit(&parts.headers)?;
    let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|_| ApiError::PayloadTooLarge(MAX_BODY_BYTES))?;

    let streaming = wants_event_stream(&parts.headers);
    let mut headers = forward_request_headers(&parts.headers);
    if streaming {
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    }

    debug!(
        component = "proxy",
        event = "proxy.request.forwarded",
        method = %parts.method,
        path = %path,
        target = %url,
        streaming,
    );

    let upstream = state
        .http
        .request(parts.method, &url)
        .headers(headers)
        .body(body)
        .send()
        .await
        .map_err(|err| {
            if err.is_connect() {
                state.supervisor.report_endpoint_drift();
            }
            warn!(
                component = "proxy",
                event = "proxy.request.failed",
                path = %path,
                error = %err,
            );
            ApiError::Unavailable(format!("OpenCode is unavailable: {err}"))
        })?;

    let status = upstream.status();
    let response_headers = forward_response_headers(upstream.headers());
    let body = Body::from_stream(upstream.bytes_stream().map_err(std::io::Error::other));

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    Ok(response)
}
