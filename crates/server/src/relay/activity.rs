//! Per-session activity phase derived from upstream events.
//!
//! Phase changes and cooldown expiry are both handled by a single actor task
//! that owns every session record and one `DelayQueue`. Cancelling the
//! pending cooldown and applying the next phase happen in the same step, so a
//! superseded timer can never flip a session back to idle.

use std::collections::HashMap;
use std::future::poll_fn;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use openchamber_protocol::ActivityPhase;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::debug;

use super::RelayEvent;

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseChange {
    pub session_id: String,
    pub phase: ActivityPhase,
}

/// The envelope's `type` and `properties`, unwrapping the global feed's
/// `{directory, payload}` wrapper.
pub fn event_parts(event: &Value) -> Option<(&str, &Value)> {
    let inner = match event.get("payload") {
        Some(payload) if payload.get("type").is_some() => payload,
        _ => event,
    };
    let kind = inner.get("type")?.as_str()?;
    Some((kind, inner.get("properties").unwrap_or(&Value::Null)))
}

/// Session id wherever the event carries it.
pub fn session_id_of(props: &Value) -> Option<&str> {
    let direct = ["sessionID", "sessionId"]
        .iter()
        .find_map(|key| props.get(*key).and_then(Value::as_str));
    direct.or_else(|| {
        ["info", "part"].iter().find_map(|outer| {
            let nested = props.get(*outer)?;
            ["sessionID", "sessionId"]
                .iter()
                .find_map(|key| nested.get(*key).and_then(Value::as_str))
        })
    })
}

fn str_at<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|key| value.get(*key).and_then(Value::as_str))
}

/// An assistant message (or its final step) that finished with `stop`.
pub fn is_assistant_stop(kind: &str, props: &Value) -> bool {
    let info = props.get("info").unwrap_or(&Value::Null);
    let part = props.get("part").unwrap_or(&Value::Null);
    let role = str_at(info, &["role"])
        .or_else(|| str_at(part, &["role"]))
        .or_else(|| str_at(props, &["role"]));
    let finish = str_at(info, &["finish", "reason"])
        .or_else(|| str_at(part, &["finish", "reason"]));

    let assistant = match kind {
        "message.updated" => role == Some("assistant"),
        // Parts rarely repeat the role; a step-finish part only exists on
        // assistant turns.
        "message.part.updated" => {
            role == Some("assistant")
                || (role.is_none() && str_at(part, &["type"]) == Some("step-finish"))
        }
        _ => false,
    };
    assistant && finish == Some("stop")
}

/// Rule table; first match wins.
pub fn derive_phase(event: &Value) -> Option<PhaseChange> {
    let (kind, props) = event_parts(event)?;
    let phase = match kind {
        "session.status" => {
            let status = props.get("status")?;
            let status = status
                .get("type")
                .and_then(Value::as_str)
                .or_else(|| status.as_str())?;
            match status {
                "busy" | "retry" => ActivityPhase::Busy,
                _ => ActivityPhase::Idle,
            }
        }
        "message.updated" | "message.part.updated" if is_assistant_stop(kind, props) => {
            ActivityPhase::Cooldown
        }
        "session.idle" => ActivityPhase::Idle,
        _ => return None,
    };
    Some(PhaseChange {
        session_id: session_id_of(props)?.to_string(),
        phase,
    })
}

#[derive(Debug)]
struct SessionActivityRecord {
    phase: ActivityPhase,
    updated_at: Instant,
    cooldown_timer: Option<delay_queue::Key>,
}

pub type ActivitySnapshot = Arc<ArcSwap<HashMap<String, ActivityPhase>>>;

#[derive(Clone)]
pub struct ActivityTracker {
    tx: mpsc::UnboundedSender<PhaseChange>,
    snapshot: ActivitySnapshot,
}

impl ActivityTracker {
    pub fn spawn(
        cooldown: Duration,
        events: broadcast::Sender<RelayEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let snapshot: ActivitySnapshot = Arc::new(ArcSwap::from_pointee(HashMap::new()));
        let actor = TrackerActor {
            cooldown,
            records: HashMap::new(),
            timers: DelayQueue::new(),
            events,
            snapshot: snapshot.clone(),
        };
        tokio::spawn(actor.run(rx, cancel));
        Self { tx, snapshot }
    }

    /// Feed one decoded upstream event.
    pub fn observe(&self, event: &Value) {
        if let Some(change) = derive_phase(event) {
            self.apply(change);
        }
    }

    pub fn apply(&self, change: PhaseChange) {
        let _ = self.tx.send(change);
    }

    pub fn phase(&self, session_id: &str) -> Option<ActivityPhase> {
        self.snapshot.load().get(session_id).copied()
    }

    pub fn snapshot(&self) -> HashMap<String, ActivityPhase> {
        HashMap::clone(&self.snapshot.load())
    }
}

enum Step {
    Change(PhaseChange),
    Expired(String),
    Stop,
}

struct TrackerActor {
    cooldown: Duration,
    records: HashMap<String, SessionActivityRecord>,
    timers: DelayQueue<String>,
    events: broadcast::Sender<RelayEvent>,
    snapshot: ActivitySnapshot,
}

impl TrackerActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<PhaseChange>, cancel: CancellationToken) {
        loop {
            let step = tokio::select! {
                _ = cancel.cancelled() => Step::Stop,
                change = rx.recv() => change.map_or(Step::Stop, Step::Change),
                Some(expired) = poll_fn(|cx| self.timers.poll_expired(cx)) => {
                    Step::Expired(expired.into_inner())
                }
            };
            match step {
                Step::Change(change) => self.apply(change),
                Step::Expired(session_id) => self.expire(session_id),
                Step::Stop => break,
            }
        }
    }

    fn apply(&mut self, change: PhaseChange) {
        let now = Instant::now();
        let record = self
            .records
            .entry(change.session_id.clone())
            .or_insert(SessionActivityRecord {
                phase: ActivityPhase::Idle,
                updated_at: now,
                cooldown_timer: None,
            });

        // A finished turn seen after the session already settled is a late
        // duplicate, not a new cooldown.
        if change.phase == ActivityPhase::Cooldown && record.phase == ActivityPhase::Idle {
            return;
        }

        if let Some(key) = record.cooldown_timer.take() {
            self.timers.try_remove(&key);
        }
        if change.phase == ActivityPhase::Cooldown {
            record.cooldown_timer = Some(self.timers.insert(change.session_id.clone(), self.cooldown));
        }
        record.updated_at = now;

        if record.phase != change.phase {
            record.phase = change.phase;
            self.publish(change);
        }
    }

    fn expire(&mut self, session_id: String) {
        let Some(record) = self.records.get_mut(&session_id) else {
            return;
        };
        record.cooldown_timer = None;
        if record.phase == ActivityPhase::Cooldown {
            record.phase = ActivityPhase::Idle;
            record.updated_at = Instant::now();
            self.publish(PhaseChange {
                session_id,
                phase: ActivityPhase::Idle,
            });
        }
    }

    fn publish(&self, change: PhaseChange) {
        debug!(
            component = "relay",
            event = "relay.activity.changed",
            session_id = %change.session_id,
            phase = change.phase.as_str(),
        );
        self.snapshot.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(change.session_id.clone(), change.phase);
            next
        });
        let _ = self.events.send(RelayEvent::Activity(change));
    }
}
