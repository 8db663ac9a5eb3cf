//! SSE rendering of a terminal viewer.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::response::Response;
use bytes::Bytes;
use futures::Stream;
use openchamber_protocol::TerminalFrame;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

use super::pty::PtyExit;
use super::{TerminalSession, Viewer, ViewerFrame};
use crate::relay::client::sse_response;

/// Splits a byte stream into UTF-8 text without breaking multi-byte
/// sequences across frames.
#[derive(Debug, Default)]
pub struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let valid_up_to = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            // An incomplete tail is kept for the next chunk; anything else
            // is invalid and decoded lossily.
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => {
                let text = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                return text;
            }
        };
        let rest = self.pending.split_off(valid_up_to);
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending = rest;
        text
    }
}

fn frame(frame: &TerminalFrame) -> Bytes {
    let json = serde_json::to_string(frame).unwrap_or_else(|_| "{}".to_string());
    Bytes::from(format!("data: {json}\n\n"))
}

fn exit_frame(exit: PtyExit) -> Bytes {
    frame(&TerminalFrame::Exit {
        exit_code: exit.exit_code,
        signal: exit.signal,
    })
}

/// `connected`, replayed scrollback, live `data`, and a final `exit`.
pub fn viewer_stream(
    session: Arc<TerminalSession>,
    mut viewer: Viewer,
    heartbeat: Duration,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    async_stream::stream! {
        // Detaches when the client goes away and the stream is dropped.
        let _guard = DetachGuard {
            session: Arc::clone(&session),
            viewer_id: viewer.id,
        };
        let mut utf8 = Utf8Carry::default();

        yield Ok(frame(&TerminalFrame::Connected {
            session_id: viewer.session_id.clone(),
        }));
        if !viewer.replay.is_empty() {
            let data = utf8.decode(&viewer.replay);
            yield Ok(frame(&TerminalFrame::Data { data }));
        }
        if let Some(exit) = viewer.exited() {
            yield Ok(exit_frame(exit));
            return;
        }

        let mut ticker = interval_at(Instant::now() + heartbeat, heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let (next, done) = tokio::select! {
                received = viewer.frames.recv() => match received {
                    Some(ViewerFrame::Data(chunk)) => {
                        let data = utf8.decode(&chunk);
                        ((!data.is_empty()).then(|| frame(&TerminalFrame::Data { data })), false)
                    }
                    Some(ViewerFrame::Exit(exit)) => (Some(exit_frame(exit)), true),
                    None => (None, true),
                },
                _ = ticker.tick() => (Some(Bytes::from_static(b": heartbeat\n\n")), false),
            };
            if let Some(bytes) = next {
                yield Ok(bytes);
            }
            if done {
                break;
            }
        }
        debug!(
            component = "terminal",
            event = "terminal.viewer.closed",
            session_id = %session.id,
        );
    }
}

struct DetachGuard {
    session: Arc<TerminalSession>,
    viewer_id: u64,
}

impl Drop for DetachGuard {
    fn drop(&mut self) {
        self.session.detach(self.viewer_id);
    }
}

pub fn viewer_response(session: Arc<TerminalSession>, viewer: Viewer, heartbeat: Duration) -> Response {
    sse_response(viewer_stream(session, viewer, heartbeat))
}
