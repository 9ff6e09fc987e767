//! Usage extraction and streaming accumulation.

use relay_core::pricing::TokenCounts;
use serde_json::Value;
use tracing::warn;

/// One `message_start` → `message_delta` segment closed during a streaming
/// response.
#[derive(Debug, Clone, Default)]
struct Segment {
    model: Option<String>,
    input_tokens: u64,
    cache_create_tokens: u64,
    cache_read_tokens: u64,
    ephemeral_5m_tokens: u64,
    ephemeral_1h_tokens: u64,
    output_tokens: Option<u64>,
}

/// Per-stream usage accumulator. One instance lives inside each request's
/// [`crate::stream::StreamContext`].
#[derive(Debug, Clone, Default)]
pub struct UsageAccumulator {
    segments: Vec<Segment>,
    open: Option<Segment>,
}

impl UsageAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes a `message_start` event's `message.usage` block.
    pub fn observe_message_start(&mut self, event: &Value) {
        let Some(message) = event.get("message") else {
            return;
        };
        let model = message.get("model").and_then(Value::as_str).map(str::to_owned);
        let Some(usage) = message.get("usage") else {
            return;
        };
        self.open = Some(Segment {
            model,
            input_tokens: usage.get("input_tokens").and_then(Value::as_u64).unwrap_or(0),
            cache_create_tokens: usage
                .get("cache_creation_input_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            cache_read_tokens: usage
                .get("cache_read_input_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            ephemeral_5m_tokens: usage
                .get("ephemeral_5m_input_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            ephemeral_1h_tokens: usage
                .get("ephemeral_1h_input_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            output_tokens: None,
        });
    }

    /// Consumes a `message_delta` event's `usage.output_tokens` field,
    /// closing the currently open segment once both input and output are
    /// known.
    pub fn observe_message_delta(&mut self, event: &Value) {
        let Some(output_tokens) = event
            .get("usage")
            .and_then(|u| u.get("output_tokens"))
            .and_then(Value::as_u64)
        else {
            return;
        };

        let Some(mut segment) = self.open.take() else {
            warn!("message_delta observed with no open segment; recording an estimated entry");
            self.segments.push(Segment {
                output_tokens: Some(output_tokens),
                ..Segment::default()
            });
            return;
        };
        segment.output_tokens = Some(output_tokens);
        self.segments.push(segment);
    }

    /// Merges every closed segment into a single `(model, TokenCounts)` pair
    /// for the end-of-stream usage event.
    pub fn finish(self) -> Option<(String, TokenCounts)> {
        if self.segments.is_empty() {
            return None;
        }
        let model = self
            .segments
            .iter()
            .find_map(|s| s.model.clone())
            .unwrap_or_else(|| "unknown".to_owned());

        let mut counts = TokenCounts::default();
        for segment in &self.segments {
            counts.input_tokens += segment.input_tokens;
            counts.cache_create_tokens += segment.cache_create_tokens;
            counts.cache_read_tokens += segment.cache_read_tokens;
            counts.ephemeral_5m_tokens += segment.ephemeral_5m_tokens;
            counts.ephemeral_1h_tokens += segment.ephemeral_1h_tokens;
            counts.output_tokens += segment.output_tokens.unwrap_or(0);
        }
        Some((model, counts))
    }
}

/// Extracts usage from a unary (non-streaming) response body.
/// Returns `None` when no `usage` field is present, in which case the
/// caller records an estimated count and logs a warning instead.
pub fn extract_usage_from_unary_body(body: &Value) -> Option<(String, TokenCounts)> {
    let usage = body.get("usage")?;
    let model = body.get("model").and_then(Value::as_str).unwrap_or("unknown").to_owned();
    Some((
        model,
        TokenCounts {
            input_tokens: usage.get("input_tokens").and_then(Value::as_u64).unwrap_or(0),
            output_tokens: usage.get("output_tokens").and_then(Value::as_u64).unwrap_or(0),
            cache_create_tokens: usage
                .get("cache_creation_input_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            cache_read_tokens: usage
                .get("cache_read_input_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            ephemeral_5m_tokens: usage
                .get("ephemeral_5m_input_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            ephemeral_1h_tokens: usage
                .get("ephemeral_1h_input_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accumulates_single_segment() {
        let mut acc = UsageAccumulator::new();
        acc.observe_message_start(&json!({
            "message": {"model": "claude-3-sonnet", "usage": {"input_tokens": 10, "cache_read_input_tokens": 2}}
        }));
        acc.observe_message_delta(&json!({"usage": {"output_tokens": 5}}));

        let (model, counts) = acc.finish().unwrap();
        assert_eq!(model, "claude-3-sonnet");
        assert_eq!(counts.input_tokens, 10);
        assert_eq!(counts.output_tokens, 5);
        assert_eq!(counts.cache_read_tokens, 2);
    }

    #[test]
    fn merges_multiple_segments_in_arrival_order() {
        let mut acc = UsageAccumulator::new();
        acc.observe_message_start(&json!({"message": {"model": "m", "usage": {"input_tokens": 10}}}));
        acc.observe_message_delta(&json!({"usage": {"output_tokens": 5}}));
        acc.observe_message_start(&json!({"message": {"model": "m", "usage": {"input_tokens": 1}}}));
        acc.observe_message_delta(&json!({"usage": {"output_tokens": 1}}));

        let (_, counts) = acc.finish().unwrap();
        assert_eq!(counts.input_tokens, 11);
        assert_eq!(counts.output_tokens, 6);
    }

    #[test]
    fn empty_accumulator_has_no_usage() {
        assert!(UsageAccumulator::new().finish().is_none());
    }

    #[test]
    fn unary_usage_extraction_reads_nested_fields() {
        let body = json!({"model": "claude-3-opus", "usage": {"input_tokens": 3, "output_tokens": 4}});
        let (model, counts) = extract_usage_from_unary_body(&body).unwrap();
        assert_eq!(model, "claude-3-opus");
        assert_eq!(counts.input_tokens, 3);
        assert_eq!(counts.output_tokens, 4);
    }

    #[test]
    fn missing_usage_field_is_none() {
        assert!(extract_usage_from_unary_body(&json!({"model": "m"})).is_none());
    }
}
