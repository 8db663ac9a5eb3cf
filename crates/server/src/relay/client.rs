//! Browser-facing event streams.
//!
//! Each connected client gets its own body stream. Dropping the response
//! body (client disconnect) drops the stream, which releases the broadcast
//! receiver and, for per-connection streams, the upstream request.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use super::{activity_frame, heartbeat_frame, EventRelay, RelayEvent, SseFrameDecoder};
use crate::error::ApiError;
use crate::supervisor::Supervisor;

/// Wrap a byte stream in an SSE response with proxy-buffering disabled.
pub fn sse_response<S>(stream: S) -> Response
where
    S: Stream<Item = Result<Bytes, Infallible>> + Send + 'static,
{
    let mut response = Response::new(Body::from_stream(stream));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-cache"),
    );
    headers.insert(
        header::CONNECTION,
        header::HeaderValue::from_static("keep-alive"),
    );
    headers.insert("x-accel-buffering", header::HeaderValue::from_static("no"));
    response
}

/// Frames from the shared relay: raw upstream blocks, activity, heartbeats.
pub fn global_event_stream(
    relay: Arc<EventRelay>,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    let mut rx = relay.subscribe();
    let cancel = relay.cancel_token();
    let period = relay.heartbeat_interval();

    async_stream::stream! {
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = heartbeat.tick() => Some(heartbeat_frame()),
                event = rx.recv() => match event {
                    Ok(RelayEvent::Upstream(block)) => Some(block.to_frame()),
                    Ok(RelayEvent::Activity(change)) => Some(activity_frame(&change)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            component = "relay",
                            event = "relay.client.lagged",
                            skipped,
                            "Slow event client skipped frames"
                        );
                        None
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };
            if let Some(frame) = frame {
                yield Ok(frame);
            }
        }
        debug!(component = "relay", event = "relay.client.closed");
    }
}

/// `GET /api/global/event`
pub fn global_event_response(relay: Arc<EventRelay>) -> Response {
    sse_response(global_event_stream(relay))
}

/// `GET /api/event`: a dedicated upstream subscription for this client,
/// with the relay's activity and heartbeat frames interleaved.
pub async fn per_connection_response(
    supervisor: &Arc<Supervisor>,
    relay: Arc<EventRelay>,
    http: &reqwest::Client,
    path: &str,
    query: Option<&str>,
) -> Result<Response, ApiError> {
    let handle = supervisor.snapshot();
    let Some(endpoint) = handle.endpoint() else {
        return Err(ApiError::Restarting);
    };
    let mut url = format!("{}{}", endpoint.base_url(), handle.rewrite_path(path));
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(query);
    }

    let upstream = http
        .get(&url)
        .header(reqwest::header::ACCEPT, "text/event-stream")
        .send()
        .await
        .map_err(|err| {
            if err.is_connect() {
                supervisor.report_endpoint_drift();
            }
            ApiError::Unavailable(format!("OpenCode event stream unavailable: {err}"))
        })?;

    if !upstream.status().is_success() {
        let status = StatusCode::from_u16(upstream.status().as_u16())
            .unwrap_or(StatusCode::BAD_GATEWAY);
        let body = upstream.text().await.unwrap_or_default();
        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        return Ok(response);
    }

    let mut upstream_body = Box::pin(upstream.bytes_stream());
    let mut rx = relay.subscribe();
    let cancel = relay.cancel_token();
    let period = relay.heartbeat_interval();

    let stream = async_stream::stream! {
        let mut decoder = SseFrameDecoder::new();
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = heartbeat.tick() => Some(heartbeat_frame()),
                chunk = upstream_body.next() => match chunk {
                    Some(Ok(chunk)) => {
                        let frames: Vec<u8> = decoder
                            .push(&chunk)
                            .iter()
                            .flat_map(|block| block.to_frame())
                            .collect();
                        (!frames.is_empty()).then(|| Bytes::from(frames))
                    }
                    // Close cleanly; the browser's EventSource reconnects.
                    Some(Err(err)) => {
                        debug!(
                            component = "relay",
                            event = "relay.client.upstream_failed",
                            error = %err,
                        );
                        break;
                    }
                    None => break,
                },
                event = rx.recv() => match event {
                    Ok(RelayEvent::Activity(change)) => Some(activity_frame(&change)),
                    Ok(RelayEvent::Upstream(_)) | Err(broadcast::error::RecvError::Lagged(_)) => None,
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };
            if let Some(frame) = frame {
                yield Ok(frame);
            }
        }
    };

    Ok(sse_response(stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{PhaseChange, RelayConfig, SseBlock};
    use openchamber_protocol::ActivityPhase;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[tokio::test(start_paused = true)]
    async fn global_stream_forwards_raw_then_synthesized_and_heartbeats() {
        let relay = EventRelay::new(
            RelayConfig {
                heartbeat: Duration::from_secs(15),
                ..RelayConfig::default()
            },
            CancellationToken::new(),
        );
        let mut stream = Box::pin(global_event_stream(relay.clone()));

        // Subscription is taken when the stream is created.
        relay.publish_upstream(SseBlock::parse("data: {\"type\":\"x\"}".to_string()));
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(&first[..], b"data: {\"type\":\"x\"}\n\n");

        relay.tracker.apply(PhaseChange {
            session_id: "s1".into(),
            phase: ActivityPhase::Busy,
        });
        let second = stream.next().await.unwrap().unwrap();
        assert!(std::str::from_utf8(&second)
            .unwrap()
            .contains("openchamber:session-activity"));

        let third = stream.next().await.unwrap().unwrap();
        assert!(std::str::from_utf8(&third)
            .unwrap()
            .contains("openchamber:heartbeat"));
    }

    #[tokio::test]
    async fn stream_ends_on_cancel() {
        let cancel = CancellationToken::new();
        let relay = EventRelay::new(RelayConfig::default(), cancel.clone());
        let mut stream = Box::pin(global_event_stream(relay));
        cancel.cancel();
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn sse_headers() {
        let response = sse_response(futures::stream::empty());
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/event-stream"
        );
        assert_eq!(response.headers()["x-accel-buffering"], "no");
    }
}
