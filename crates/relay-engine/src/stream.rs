//! Streaming (SSE) relay state machine: the relay is modeled as a state
//! machine whose outputs are `{ Forwarded, Done(usage), RetryWith(reason) }`.

use bytes::{Bytes, BytesMut};
use serde_json::Value;

use crate::usage::UsageAccumulator;
use relay_core::pricing::TokenCounts;

/// The phrase the source used to trigger an outer retry from inside a
/// stream.
const STREAM_RATE_LIMIT_PHRASE: &str = "exceed your account's rate limit";

#[derive(Debug, Clone, PartialEq)]
pub enum RetryReason {
    RateLimited { reset_at_epoch_secs: Option<i64> },
}

/// One output of the streaming state machine.
#[derive(Debug, Clone)]
pub enum RelayStep {
    /// A complete SSE line (with its trailing newline), to be forwarded to
    /// the inbound client verbatim and in order.
    Forwarded(Bytes),
    /// The upstream stream ended normally; carries the merged usage
    /// observation, if any segment was ever opened.
    Done(Option<(String, TokenCounts)>),
    /// The stream must be abandoned and the request retried against a
    /// fresh account.
    RetryWith(RetryReason),
}

/// Per-request streaming context. No pooling:
/// this is just an owned value the caller drops when the request ends.
#[derive(Debug, Default)]
pub struct StreamContext {
    buffer: BytesMut,
    usage: UsageAccumulator,
    forwarded_any_byte: bool,
}

impl StreamContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_forwarded_any_byte(&self) -> bool {
        self.forwarded_any_byte
    }

    /// Feeds one chunk of raw upstream bytes, returning the `RelayStep`s it
    /// produced. A `RetryWith` terminates processing of this chunk (and the
    /// caller must stop feeding further chunks and unwind the stream).
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<RelayStep> {
        self.buffer.extend_from_slice(chunk);
        let mut steps = Vec::new();

        loop {
            let Some(newline_pos) = self.buffer.iter().position(|b| *b == b'\n') else {
                break;
            };
            let line = self.buffer.split_to(newline_pos + 1);
            let line_bytes = Bytes::from(line);
            self.forwarded_any_byte = true;
            steps.push(RelayStep::Forwarded(line_bytes.clone()));

            if let Some(retry) = self.observe_line(&line_bytes) {
                steps.push(RelayStep::RetryWith(retry));
                return steps;
            }
        }

        steps
    }

    /// Parses a single forwarded line for usage/error signals. Returns `Some` only when the line demands an immediate
    /// retry.
    fn observe_line(&mut self, line: &Bytes) -> Option<RetryReason> {
        let text = std::str::from_utf8(line).ok()?.trim_end_matches(['\n', '\r']);
        let payload = text.strip_prefix("data: ")?;
        let event: Value = serde_json::from_str(payload).ok()?;

        match event.get("type").and_then(Value::as_str) {
            Some("message_start") => {
                self.usage.observe_message_start(&event);
                None
            }
            Some("message_delta") => {
                self.usage.observe_message_delta(&event);
                None
            }
            Some("error") => {
                let message = event
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("");
                if message.to_ascii_lowercase().contains(STREAM_RATE_LIMIT_PHRASE) {
                    Some(RetryReason::RateLimited {
                        reset_at_epoch_secs: None,
                    })
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Called once the upstream body is fully consumed without a mid-stream
    /// retry signal.
    pub fn finish(self) -> RelayStep {
        RelayStep::Done(self.usage.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forwarded_bytes(steps: &[RelayStep]) -> Vec<u8> {
        steps
            .iter()
            .filter_map(|s| match s {
                RelayStep::Forwarded(b) => Some(b.to_vec()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    #[test]
    fn forwards_complete_lines_and_buffers_incomplete_tail() {
        let mut ctx = StreamContext::new();
        let steps = ctx.push_chunk(b"data: {\"type\":\"ping\"}\nevent: error\npartial");
        assert_eq!(forwarded_bytes(&steps), b"data: {\"type\":\"ping\"}\nevent: error\n");
        let more = ctx.push_chunk(b" line\n");
        assert_eq!(forwarded_bytes(&more), b"partial line\n");
    }

    #[test]
    fn accumulates_usage_across_chunks_in_order() {
        let mut ctx = StreamContext::new();
        ctx.push_chunk(b"data: {\"type\":\"message_start\",\"message\":{\"model\":\"m\",\"usage\":{\"input_tokens\":10}}}\n");
        ctx.push_chunk(b"data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":4}}\n");

        match ctx.finish() {
            RelayStep::Done(Some((model, counts))) => {
                assert_eq!(model, "m");
                assert_eq!(counts.input_tokens, 10);
                assert_eq!(counts.output_tokens, 4);
            }
            other => panic!("unexpected step: {other:?}"),
        }
    }

    #[test]
    fn rate_limit_error_event_triggers_retry() {
        let mut ctx = StreamContext::new();
        let steps = ctx.push_chunk(
            b"data: {\"type\":\"error\",\"error\":{\"message\":\"You exceed your account's rate limit\"}}\n",
        );
        assert!(matches!(steps.last(), Some(RelayStep::RetryWith(RetryReason::RateLimited { .. }))));
    }

    #[test]
    fn non_rate_limit_error_does_not_retry() {
        let mut ctx = StreamContext::new();
        let steps = ctx.push_chunk(b"data: {\"type\":\"error\",\"error\":{\"message\":\"boom\"}}\n");
        assert!(!steps.iter().any(|s| matches!(s, RelayStep::RetryWith(_))));
    }

    #[test]
    fn empty_stream_finishes_with_no_usage() {
        let ctx = StreamContext::new();
        assert!(matches!(ctx.finish(), RelayStep::Done(None)));
    }
}
