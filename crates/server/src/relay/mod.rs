//! Event relay: one persistent upstream subscription to the agent's global
//! event feed, fanned out to every browser client with derived activity.

pub mod activity;
pub mod client;
pub mod sse;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use openchamber_protocol::{ActivityPhase, SessionActivityProperties, SynthesizedEvent};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::supervisor::{ProcessHandle, Supervisor};

pub use activity::{ActivityTracker, PhaseChange};
pub use sse::{SseBlock, SseFrameDecoder};

const GLOBAL_EVENT_PATH: &str = "/global/event";
const BROADCAST_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub heartbeat: Duration,
    pub cooldown: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            heartbeat: Duration::from_secs(15),
            cooldown: activity::DEFAULT_COOLDOWN,
        }
    }
}

/// What the relay fans out to subscribers.
#[derive(Debug, Clone)]
pub enum RelayEvent {
    /// A block from the shared upstream feed, forwarded verbatim.
    Upstream(Arc<SseBlock>),
    Activity(PhaseChange),
}

pub struct EventRelay {
    events: broadcast::Sender<RelayEvent>,
    tracker: ActivityTracker,
    config: RelayConfig,
    cancel: CancellationToken,
}

impl EventRelay {
    pub fn new(config: RelayConfig, cancel: CancellationToken) -> Arc<Self> {
        let (events, _) = broadcast::channel(BROADCAST_CAPACITY);
        let tracker = ActivityTracker::spawn(config.cooldown, events.clone(), cancel.clone());
        Arc::new(Self {
            events,
            tracker,
            config,
            cancel,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.config.heartbeat
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn activity_snapshot(&self) -> HashMap<String, ActivityPhase> {
        self.tracker.snapshot()
    }

    /// Forward a block, then derive activity from it. Activity frames are
    /// therefore always queued behind the raw event that produced them.
    pub fn publish_upstream(&self, block: SseBlock) {
        let json = block.json();
        let _ = self.events.send(RelayEvent::Upstream(Arc::new(block)));
        if let Some(json) = json {
            self.tracker.observe(&json);
        }
    }

    /// Keep the shared upstream subscription alive until cancelled.
    pub fn spawn_upstream(
        self: &Arc<Self>,
        supervisor: Arc<Supervisor>,
        http: reqwest::Client,
    ) -> JoinHandle<()> {
        let relay = Arc::clone(self);
        tokio::spawn(async move { relay.run_upstream(supervisor, http).await })
    }

    async fn run_upstream(&self, supervisor: Arc<Supervisor>, http: reqwest::Client) {
        let mut backoff = Backoff::new(self.config.backoff_initial, self.config.backoff_max);

        loop {
            let handle = tokio::select! {
                _ = self.cancel.cancelled() => return,
                handle = supervisor.wait_ready() => match handle {
                    Some(handle) => handle,
                    None => return,
                },
            };

            match self.stream_once(&supervisor, &handle, &http).await {
                StreamEnd::Cancelled => return,
                StreamEnd::EndpointChanged => {
                    backoff.reset();
                    continue;
                }
                StreamEnd::Disconnected { connected } => {
                    if connected {
                        backoff.reset();
                    }
                }
            }

            let delay = backoff.next_delay();
            debug!(
                component = "relay",
                event = "relay.upstream.backoff",
                delay_ms = delay.as_millis() as u64,
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn stream_once(
        &self,
        supervisor: &Arc<Supervisor>,
        handle: &ProcessHandle,
        http: &reqwest::Client,
    ) -> StreamEnd {
        let Some(endpoint) = handle.endpoint() else {
            return StreamEnd::Disconnected { connected: false };
        };
        let url = format!(
            "{}{}{}",
            endpoint.base_url(),
            handle.api_prefix,
            GLOBAL_EVENT_PATH
        );

        let response = http
            .get(&url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await;
        let response = match response {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                warn!(
                    component = "relay",
                    event = "relay.upstream.bad_status",
                    status = response.status().as_u16(),
                    url = %url,
                );
                return StreamEnd::Disconnected { connected: false };
            }
            Err(err) => {
                warn!(
                    component = "relay",
                    event = "relay.upstream.connect_failed",
                    url = %url,
                    error = %err,
                );
                if err.is_connect() {
                    supervisor.report_endpoint_drift();
                }
                return StreamEnd::Disconnected { connected: false };
            }
        };

        info!(
            component = "relay",
            event = "relay.upstream.connected",
            url = %url,
            "Subscribed to agent event feed"
        );

        let mut revisions = supervisor.subscribe();
        let mut body = Box::pin(response.bytes_stream());
        let mut decoder = SseFrameDecoder::new();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return StreamEnd::Cancelled,
                changed = revisions.changed() => {
                    if changed.is_err() {
                        return StreamEnd::Cancelled;
                    }
                    let current = supervisor.snapshot();
                    if current.generation != handle.generation
                        || current.port != handle.port
                        || current.api_prefix != handle.api_prefix
                    {
                        info!(
                            component = "relay",
                            event = "relay.upstream.endpoint_changed",
                            "Agent endpoint changed; resubscribing"
                        );
                        return StreamEnd::EndpointChanged;
                    }
                }
                chunk = body.next() => match chunk {
                    Some(Ok(chunk)) => {
                        for block in decoder.push(&chunk) {
                            self.publish_upstream(block);
                        }
                    }
                    Some(Err(err)) => {
                        warn!(
                            component = "relay",
                            event = "relay.upstream.read_failed",
                            error = %err,
                        );
                        return StreamEnd::Disconnected { connected: true };
                    }
                    None => {
                        info!(
                            component = "relay",
                            event = "relay.upstream.closed",
                            "Agent event feed closed"
                        );
                        return StreamEnd::Disconnected { connected: true };
                    }
                },
            }
        }
    }
}

enum StreamEnd {
    Cancelled,
    EndpointChanged,
    Disconnected { connected: bool },
}

/// Exponential reconnect delay, doubling up to a cap.
#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// `data:` frame for a synthesized activity change.
pub fn activity_frame(change: &PhaseChange) -> bytes::Bytes {
    synthesized_frame(&SynthesizedEvent::SessionActivity {
        properties: SessionActivityProperties {
            session_id: change.session_id.clone(),
            phase: change.phase,
        },
    })
}

pub fn heartbeat_frame() -> bytes::Bytes {
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();
    synthesized_frame(&SynthesizedEvent::Heartbeat { timestamp })
}

fn synthesized_frame(event: &SynthesizedEvent) -> bytes::Bytes {
    let json = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    bytes::Bytes::from(format!("data: {json}\n\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn backoff_doubles_to_cap_and_resets() {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(30));
        let delays: Vec<u64> = (0..8).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(
            delays,
            vec![500, 1000, 2000, 4000, 8000, 16000, 30000, 30000]
        );
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn activity_frame_shape() {
        let frame = activity_frame(&PhaseChange {
            session_id: "s1".into(),
            phase: ActivityPhase::Cooldown,
        });
        let text = std::str::from_utf8(&frame).unwrap();
        let json: serde_json::Value =
            serde_json::from_str(text.strip_prefix("data: ").unwrap().trim_end()).unwrap();
        assert_eq!(
            json,
            json!({"type": "openchamber:session-activity", "properties": {"sessionId": "s1", "phase": "cooldown"}})
        );
        assert!(text.ends_with("\n\n"));
    }

    #[tokio::test]
    async fn raw_event_precedes_its_activity_frame() {
        let relay = EventRelay::new(RelayConfig::default(), CancellationToken::new());
        let mut rx = relay.subscribe();

        let mut decoder = SseFrameDecoder::new();
        let payload = json!({"type": "session.status", "properties": {"sessionID": "s1", "status": {"type": "busy"}}});
        for block in decoder.push(format!("data: {payload}\n\n").as_bytes()) {
            relay.publish_upstream(block);
        }

        assert!(matches!(rx.recv().await.unwrap(), RelayEvent::Upstream(_)));
        match rx.recv().await.unwrap() {
            RelayEvent::Activity(change) => assert_eq!(change.phase, ActivityPhase::Busy),
            other => panic!("expected activity, got {other:?}"),
        }
        assert_eq!(
            relay.activity_snapshot().get("s1"),
            Some(&ActivityPhase::Busy)
        );
    }
}
