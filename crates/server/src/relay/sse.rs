//! Incremental, bounded decoder for `text/event-stream` bodies.

use bytes::{Buf, Bytes, BytesMut};
use serde_json::Value;

/// Largest un-terminated frame the decoder will buffer.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// One complete SSE block.
#[derive(Debug, Clone)]
pub struct SseBlock {
    /// The block as received, without its trailing blank line.
    pub raw: String,
    pub event: Option<String>,
    /// Joined `data:` lines.
    pub data: String,
}

impl SseBlock {
    pub fn parse(raw: String) -> Self {
        let mut event = None;
        let mut data_lines: Vec<&str> = Vec::new();
        for line in raw.lines() {
            if let Some(rest) = line.strip_prefix("data:") {
                data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
            } else if let Some(rest) = line.strip_prefix("event:") {
                event = Some(rest.trim().to_string());
            }
        }
        let data = data_lines.join("\n");
        Self { raw, event, data }
    }

    /// The `data:` payload as JSON, when it is JSON.
    pub fn json(&self) -> Option<Value> {
        if self.data.is_empty() {
            return None;
        }
        serde_json::from_str(&self.data).ok()
    }

    /// Wire form for re-emission to a browser client.
    pub fn to_frame(&self) -> Bytes {
        let mut out = String::with_capacity(self.raw.len() + 2);
        out.push_str(&self.raw);
        out.push_str("\n\n");
        Bytes::from(out)
    }
}

#[derive(Debug, Default)]
pub struct SseFrameDecoder {
    buf: BytesMut,
    /// Prefix of `buf` already searched for a boundary.
    scanned: usize,
    /// Set after an oversized frame was dropped; skip to the next boundary.
    discarding: bool,
    dropped_frames: u64,
}

impl SseFrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }

    /// Feed a chunk and return every block it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseBlock> {
        self.buf.extend_from_slice(chunk);
        let mut blocks = Vec::new();

        loop {
            match find_boundary(&self.buf, self.scanned) {
                Some((end, sep_len)) => {
                    let frame = self.buf.split_to(end);
                    self.buf.advance(sep_len);
                    self.scanned = 0;
                    if self.discarding {
                        self.discarding = false;
                        continue;
                    }
                    let text = String::from_utf8_lossy(&frame).replace("\r\n", "\n");
                    let text = text.trim_matches(|c| c == '\n' || c == '\r');
                    if !text.is_empty() {
                        blocks.push(SseBlock::parse(text.to_string()));
                    }
                }
                None => {
                    // A separator is at most three bytes long.
                    self.scanned = self.buf.len().saturating_sub(2);
                    if self.buf.len() > MAX_FRAME_BYTES {
                        // Keep a tail in case a boundary straddles the cut.
                        let keep = self.buf.len().min(3);
                        self.buf.advance(self.buf.len() - keep);
                        self.scanned = 0;
                        if !self.discarding {
                            self.dropped_frames += 1;
                            tracing::warn!(
                                component = "relay",
                                event = "relay.sse.frame_dropped",
                                limit = MAX_FRAME_BYTES,
                                "Dropping oversized SSE frame"
                            );
                        }
                        self.discarding = true;
                    }
                    break;
                }
            }
        }
        blocks
    }
}

/// Position and length of the first blank-line separator starting at or
/// after `from`.
fn find_boundary(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i < buf.len() {
        if buf[i] == b'\n' {
            if buf.get(i + 1) == Some(&b'\n') {
                return Some((i, 2));
            }
            if buf.get(i + 1) == Some(&b'\r') && buf.get(i + 2) == Some(&b'\n') {
                return Some((i, 3));
            }
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reassembles_blocks_split_across_chunks() {
        let mut decoder = SseFrameDecoder::new();
        assert!(decoder.push(b"data: {\"type\":\"session.").is_empty());
        let blocks = decoder.push(b"idle\",\"properties\":{}}\n\ndata: {\"a\"");
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].json().unwrap()["type"], "session.idle");

        let blocks = decoder.push(b":1}\n\n");
        assert_eq!(blocks[0].data, "{\"a\":1}");
    }

    #[test]
    fn resumes_search_where_previous_chunk_ended() {
        let mut decoder = SseFrameDecoder::new();
        let payload = format!("data: {}", "y".repeat(4096));
        for chunk in payload.as_bytes().chunks(64) {
            assert!(decoder.push(chunk).is_empty());
            assert_eq!(decoder.scanned, decoder.buf.len() - 2);
        }

        // Separator split across three pushes.
        assert!(decoder.push(b"\n").is_empty());
        assert!(decoder.push(b"\r").is_empty());
        let blocks = decoder.push(b"\ndata: next\n\n");
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].raw.len(), payload.len());
        assert_eq!(blocks[1].raw, "data: next");
        assert_eq!(decoder.scanned, 0);
    }

    #[test]
    fn tolerates_crlf_and_multiline_data() {
        let mut decoder = SseFrameDecoder::new();
        let blocks = decoder.push(b"event: message\r\ndata: line1\r\ndata: line2\r\n\r\n");
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].event.as_deref(), Some("message"));
        assert_eq!(blocks[0].data, "line1\nline2");
        assert!(blocks[0].json().is_none());
    }

    #[test]
    fn drops_oversized_frame_and_recovers() {
        let mut decoder = SseFrameDecoder::new();
        let huge = vec![b'x'; MAX_FRAME_BYTES + 10];
        assert!(decoder.push(b"data: ").is_empty());
        assert!(decoder.push(&huge).is_empty());
        assert_eq!(decoder.dropped_frames(), 1);

        let blocks = decoder.push(b"tail of junk\n\ndata: {\"ok\":true}\n\n");
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].json().unwrap()["ok"], true);
    }

    #[test]
    fn comment_only_blocks_keep_raw_text() {
        let mut decoder = SseFrameDecoder::new();
        let blocks = decoder.push(b": keepalive\n\n");
        assert_eq!(blocks[0].raw, ": keepalive");
        assert_eq!(&blocks[0].to_frame()[..], b": keepalive\n\n");
    }
}
