//! Turns relayed agent events into push notifications.
//!
//! A single actor owns the ready-cooldown table, pending debounce timers and
//! the permission dedup set. Debounce timers live in one `DelayQueue`, so
//! rescheduling a key is a remove-then-insert within one actor step.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::poll_fn;
use std::time::Duration;

use openchamber_protocol::{NotificationKind, PushPayload};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, warn};

use crate::relay::activity::{event_parts, is_assistant_stop, session_id_of};
use crate::relay::RelayEvent;

const PERMISSION_MEMORY: usize = 1024;

#[derive(Debug, Clone)]
pub struct TriggerConfig {
    pub ready_cooldown: Duration,
    pub debounce: Duration,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            ready_cooldown: Duration::from_secs(5),
            debounce: Duration::from_millis(500),
        }
    }
}

/// A notification ready for delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub payload: PushPayload,
    /// Skip delivery while any UI is foregrounded.
    pub require_no_sse: bool,
}

/// Questions debounce per session; permissions per request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DebounceKey {
    kind: NotificationKind,
    session_id: String,
    request_id: Option<String>,
}

impl DebounceKey {
    fn new(kind: NotificationKind, session_id: &str, request_id: Option<String>) -> Self {
        Self {
            kind,
            session_id: session_id.to_string(),
            request_id: request_id.filter(|_| kind == NotificationKind::Permission),
        }
    }
}

#[derive(Debug)]
struct Pending {
    timer: delay_queue::Key,
    payload: PushPayload,
}

/// What one upstream event asks for.
#[derive(Debug, PartialEq)]
enum Trigger {
    Ready {
        session_id: String,
    },
    Ask {
        kind: NotificationKind,
        session_id: String,
        request_id: Option<String>,
        body: String,
    },
}

fn classify(event: &Value) -> Option<Trigger> {
    let (kind, props) = event_parts(event)?;
    match kind {
        "message.updated" if is_assistant_stop(kind, props) => Some(Trigger::Ready {
            session_id: session_id_of(props)?.to_string(),
        }),
        "question.asked" => {
            let body = props
                .pointer("/questions/0/question")
                .and_then(Value::as_str)
                .unwrap_or("The agent has a question for you");
            Some(Trigger::Ask {
                kind: NotificationKind::Question,
                session_id: session_id_of(props)?.to_string(),
                request_id: request_id_of(props),
                body: body.to_string(),
            })
        }
        "permission.asked" => {
            let body = ["title", "permission"]
                .iter()
                .find_map(|key| props.get(*key).and_then(Value::as_str))
                .unwrap_or("The agent is waiting for your approval");
            Some(Trigger::Ask {
                kind: NotificationKind::Permission,
                session_id: session_id_of(props)?.to_string(),
                request_id: request_id_of(props),
                body: body.to_string(),
            })
        }
        _ => None,
    }
}

fn request_id_of(props: &Value) -> Option<String> {
    ["id", "requestID", "requestId"]
        .iter()
        .find_map(|key| props.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}

fn title_for(kind: NotificationKind) -> &'static str {
    match kind {
        NotificationKind::Ready => "Response ready",
        NotificationKind::Question => "Input needed",
        NotificationKind::Permission => "Permission required",
    }
}

struct TriggerActor {
    config: TriggerConfig,
    last_ready: HashMap<String, Instant>,
    pending: HashMap<DebounceKey, Pending>,
    timers: DelayQueue<DebounceKey>,
    notified_permissions: HashSet<(String, String)>,
    notified_order: VecDeque<(String, String)>,
    out: mpsc::UnboundedSender<Notification>,
}

enum Step {
    Event(Value),
    Fire(DebounceKey),
    Skip,
    Stop,
}

/// Start the trigger actor; notifications come out of the returned channel.
pub fn spawn_triggers(
    events: broadcast::Receiver<RelayEvent>,
    config: TriggerConfig,
    cancel: CancellationToken,
) -> mpsc::UnboundedReceiver<Notification> {
    let (out, rx) = mpsc::unbounded_channel();
    let actor = TriggerActor {
        config,
        last_ready: HashMap::new(),
        pending: HashMap::new(),
        timers: DelayQueue::new(),
        notified_permissions: HashSet::new(),
        notified_order: VecDeque::new(),
        out,
    };
    tokio::spawn(actor.run(events, cancel));
    rx
}

impl TriggerActor {
    async fn run(mut self, mut events: broadcast::Receiver<RelayEvent>, cancel: CancellationToken) {
        loop {
            let step = tokio::select! {
                _ = cancel.cancelled() => Step::Stop,
                event = events.recv() => match event {
                    Ok(RelayEvent::Upstream(block)) => block.json().map_or(Step::Skip, Step::Event),
                    Ok(RelayEvent::Activity(_)) => Step::Skip,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            component = "push",
                            event = "push.triggers.lagged",
                            skipped,
                            "Push trigger consumer fell behind"
                        );
                        Step::Skip
                    }
                    Err(broadcast::error::RecvError::Closed) => Step::Stop,
                },
                Some(expired) = poll_fn(|cx| self.timers.poll_expired(cx)) => {
                    Step::Fire(expired.into_inner())
                }
            };
            match step {
                Step::Event(json) => self.observe(&json),
                Step::Fire(key) => self.fire(key),
                Step::Skip => {}
                Step::Stop => break,
            }
        }
    }

    fn observe(&mut self, event: &Value) {
        match classify(event) {
            Some(Trigger::Ready { session_id }) => self.ready(session_id),
            Some(Trigger::Ask {
                kind,
                session_id,
                request_id,
                body,
            }) => self.ask(kind, session_id, request_id, body),
            None => {}
        }
    }

    fn ready(&mut self, session_id: String) {
        let now = Instant::now();
        if let Some(last) = self.last_ready.get(&session_id) {
            if now.duration_since(*last) < self.config.ready_cooldown {
                return;
            }
        }
        self.last_ready.insert(session_id.clone(), now);
        let payload = PushPayload::for_session(
            NotificationKind::Ready,
            &session_id,
            title_for(NotificationKind::Ready),
            "The agent finished responding",
        );
        self.emit(payload, NotificationKind::Ready);
    }

    fn ask(
        &mut self,
        kind: NotificationKind,
        session_id: String,
        request_id: Option<String>,
        body: String,
    ) {
        if kind == NotificationKind::Permission {
            if let Some(request_id) = &request_id {
                if self
                    .notified_permissions
                    .contains(&(session_id.clone(), request_id.clone()))
                {
                    return;
                }
            }
        }

        let key = DebounceKey::new(kind, &session_id, request_id);
        let payload = PushPayload::for_session(kind, &session_id, title_for(kind), body);
        match self.pending.get_mut(&key) {
            Some(pending) => {
                self.timers.reset(&pending.timer, self.config.debounce);
                pending.payload = payload;
            }
            None => {
                let timer = self.timers.insert(key.clone(), self.config.debounce);
                self.pending.insert(key, Pending { timer, payload });
            }
        }
    }

    fn fire(&mut self, key: DebounceKey) {
        let Some(pending) = self.pending.remove(&key) else {
            return;
        };
        if key.kind == NotificationKind::Permission {
            if let Some(request_id) = key.request_id {
                self.remember_permission((key.session_id, request_id));
            }
        }
        self.emit(pending.payload, key.kind);
    }

    fn remember_permission(&mut self, id: (String, String)) {
        if self.notified_permissions.insert(id.clone()) {
            self.notified_order.push_back(id);
            while self.notified_order.len() > PERMISSION_MEMORY {
                if let Some(old) = self.notified_order.pop_front() {
                    self.notified_permissions.remove(&old);
                }
            }
        }
    }

    fn emit(&self, payload: PushPayload, kind: NotificationKind) {
        debug!(
            component = "push",
            event = "push.trigger.fired",
            session_id = %payload.data.session_id,
            kind = ?kind,
        );
        let _ = self.out.send(Notification {
            payload,
            require_no_sse: kind.is_passive(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::SseBlock;
    use serde_json::json;
    use std::sync::Arc;

    fn upstream(event: Value) -> RelayEvent {
        RelayEvent::Upstream(Arc::new(SseBlock::parse(format!("data: {event}"))))
    }

    fn permission(session: &str, request: &str) -> RelayEvent {
        upstream(json!({
            "type": "permission.asked",
            "properties": {"id": request, "sessionID": session, "title": "Run `rm -rf build`?"}
        }))
    }

    fn assistant_stop(session: &str) -> RelayEvent {
        upstream(json!({
            "type": "message.updated",
            "properties": {"info": {"sessionID": session, "role": "assistant", "finish": "stop"}}
        }))
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Notification>) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(n) = rx.try_recv() {
            out.push(n);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_permission_requests_notify_once() {
        let (tx, events) = broadcast::channel(64);
        let mut rx = spawn_triggers(events, TriggerConfig::default(), CancellationToken::new());

        for _ in 0..3 {
            tx.send(permission("s1", "perm-1")).unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        tx.send(permission("s1", "perm-2")).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 2);
        assert!(sent
            .iter()
            .all(|n| n.payload.data.kind == NotificationKind::Permission && !n.require_no_sse));

        // Same request again in a later cycle stays silent.
        tx.send(permission("s1", "perm-1")).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn question_burst_collapses_into_one() {
        let (tx, events) = broadcast::channel(64);
        let mut rx = spawn_triggers(events, TriggerConfig::default(), CancellationToken::new());

        for _ in 0..4 {
            tx.send(upstream(json!({
                "type": "question.asked",
                "properties": {"sessionID": "s1", "questions": [{"question": "Which branch?"}]}
            })))
            .unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;

        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload.body, "Which branch?");
        assert_eq!(sent[0].payload.tag, "openchamber-question-s1");
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_questions_in_one_session_notify_once() {
        let (tx, events) = broadcast::channel(64);
        let mut rx = spawn_triggers(events, TriggerConfig::default(), CancellationToken::new());

        for (id, question) in [("q1", "Which branch?"), ("q2", "Run tests?"), ("q3", "Push now?")] {
            tx.send(upstream(json!({
                "type": "question.asked",
                "properties": {"sessionID": "s1", "id": id, "questions": [{"question": question}]}
            })))
            .unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        tx.send(upstream(json!({
            "type": "question.asked",
            "properties": {"sessionID": "s2", "id": "q4", "questions": [{"question": "Other?"}]}
        })))
        .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let mut sent = drain(&mut rx);
        sent.sort_by(|a, b| a.payload.tag.cmp(&b.payload.tag));
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].payload.tag, "openchamber-question-s1");
        assert_eq!(sent[0].payload.body, "Push now?");
        assert_eq!(sent[1].payload.tag, "openchamber-question-s2");
    }

    #[tokio::test(start_paused = true)]
    async fn ready_is_rate_limited_per_session_and_passive() {
        let (tx, events) = broadcast::channel(64);
        let mut rx = spawn_triggers(events, TriggerConfig::default(), CancellationToken::new());

        tx.send(assistant_stop("s1")).unwrap();
        tx.send(assistant_stop("s1")).unwrap();
        tx.send(assistant_stop("s2")).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|n| n.require_no_sse));

        tokio::time::sleep(Duration::from_secs(6)).await;
        tx.send(assistant_stop("s1")).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn classifies_global_envelope() {
        let wrapped = json!({
            "directory": "/repo",
            "payload": {"type": "permission.asked", "properties": {"id": "p1", "sessionID": "s1"}}
        });
        assert_eq!(
            classify(&wrapped),
            Some(Trigger::Ask {
                kind: NotificationKind::Permission,
                session_id: "s1".into(),
                request_id: Some("p1".into()),
                body: "The agent is waiting for your approval".into(),
            })
        );
    }
}
