//! Request-body normalization.
//!
//! Copy-on-write contract: the inbound `Value` is never mutated in
//! place. Only the subtrees this module changes — `system`, `max_tokens`,
//! `top_p` — are cloned into a freshly built outbound `Value`; everything
//! else is shared by reference until `serde_json` serializes the whole tree
//! for the outbound request.

use serde_json::{json, Value};

/// The canonical Claude-Code system-prompt text this proxy injects for
/// requests that do not already carry it.
pub const CLAUDE_CODE_SYSTEM_TEXT: &str =
    "You are Claude Code, Anthropic's official CLI for Claude.";

pub struct NormalizeOptions<'a> {
    pub max_tokens_ceiling: Option<u64>,
    pub is_real_claude_code_request: bool,
    pub proxy_system_prompt: Option<&'a str>,
}

/// Applies every normalization rule and returns a new outbound body. `body`
/// is borrowed, never mutated.
pub fn normalize_request(body: &Value, options: &NormalizeOptions<'_>) -> Value {
    let mut out = body.clone();

    if let Some(ceiling) = options.max_tokens_ceiling {
        clamp_max_tokens(&mut out, ceiling);
    }

    strip_cache_control_ttl(&mut out);

    let mut system = to_system_array(out.get("system"));
    if !options.is_real_claude_code_request {
        prepend_claude_code_system(&mut system);
    }
    if let Some(prompt) = options.proxy_system_prompt.filter(|p| !p.is_empty()) {
        append_proxy_system_prompt(&mut system, prompt);
    }
    dedupe_system_entries(&mut system);
    if !system.is_empty() {
        out["system"] = Value::Array(system);
    }

    strip_top_p_if_temperature_present(&mut out);

    out
}

/// Clamps `max_tokens` down to `ceiling` if present and larger.
fn clamp_max_tokens(body: &mut Value, ceiling: u64) {
    if let Some(current) = body.get("max_tokens").and_then(Value::as_u64) {
        if current > ceiling {
            body["max_tokens"] = json!(ceiling);
        }
    }
}

/// Removes `cache_control.ttl` throughout `system` and `messages[].content`
/// arrays.
fn strip_cache_control_ttl(body: &mut Value) {
    if let Some(system) = body.get_mut("system") {
        strip_ttl_from_blocks(system);
    }
    if let Some(Value::Array(messages)) = body.get_mut("messages") {
        for message in messages {
            if let Some(content) = message.get_mut("content") {
                strip_ttl_from_blocks(content);
            }
        }
    }
}

fn strip_ttl_from_blocks(value: &mut Value) {
    match value {
        Value::Array(items) => {
            for item in items {
                strip_ttl_from_blocks(item);
            }
        }
        Value::Object(map) => {
            if let Some(Value::Object(cache_control)) = map.get_mut("cache_control") {
                cache_control.remove("ttl");
            }
        }
        _ => {}
    }
}

/// Converts whatever `system` currently is (absent, a string, or an array)
/// into the canonical array-of-blocks form this function works with.
fn to_system_array(system: Option<&Value>) -> Vec<Value> {
    match system {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::String(text)) => vec![json!({"type": "text", "text": text})],
        Some(Value::Array(items)) => items.clone(),
        Some(other) => vec![other.clone()],
    }
}

fn claude_code_block() -> Value {
    json!({
        "type": "text",
        "text": CLAUDE_CODE_SYSTEM_TEXT,
        "cache_control": {"type": "ephemeral"},
    })
}

fn is_claude_code_block(value: &Value) -> bool {
    value.get("text").and_then(Value::as_str) == Some(CLAUDE_CODE_SYSTEM_TEXT)
}

/// Prepends the Claude-Code system block ahead of whatever the caller sent,
/// unless it is already first.
fn prepend_claude_code_system(system: &mut Vec<Value>) {
    if !system.first().is_some_and(is_claude_code_block) {
        system.insert(0, claude_code_block());
    }
}

fn is_proxy_prompt_block(value: &Value, prompt: &str) -> bool {
    value.get("text").and_then(Value::as_str) == Some(prompt)
}

/// Appends the operator-configured proxy system prompt unless it is already
/// present.
fn append_proxy_system_prompt(system: &mut Vec<Value>, prompt: &str) {
    if !system.iter().any(|block| is_proxy_prompt_block(block, prompt)) {
        system.push(json!({"type": "text", "text": prompt}));
    }
}

/// Removes duplicate Claude-Code entries beyond the first.
fn dedupe_system_entries(system: &mut Vec<Value>) {
    let mut seen_claude_code = false;
    system.retain(|block| {
        if is_claude_code_block(block) {
            if seen_claude_code {
                return false;
            }
            seen_claude_code = true;
        }
        true
    });
}

/// `top_p` is removed when both `top_p` and `temperature` are present,
/// since the upstream API accepts only one.
fn strip_top_p_if_temperature_present(body: &mut Value) {
    let has_both = body.get("top_p").is_some() && body.get("temperature").is_some();
    if has_both {
        if let Some(map) = body.as_object_mut() {
            map.remove("top_p");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options<'a>(
        max_tokens_ceiling: Option<u64>,
        is_real_claude_code_request: bool,
        proxy_system_prompt: Option<&'a str>,
    ) -> NormalizeOptions<'a> {
        NormalizeOptions {
            max_tokens_ceiling,
            is_real_claude_code_request,
            proxy_system_prompt,
        }
    }

    #[test]
    fn does_not_mutate_caller_body() {
        let body = json!({"model": "claude-3-sonnet", "max_tokens": 100_000, "messages": []});
        let original = body.clone();
        let _ = normalize_request(&body, &options(Some(4096), true, None));
        assert_eq!(body, original);
    }

    #[test]
    fn clamps_max_tokens_to_ceiling() {
        let body = json!({"max_tokens": 100_000});
        let out = normalize_request(&body, &options(Some(4096), true, None));
        assert_eq!(out["max_tokens"], json!(4096));
    }

    #[test]
    fn leaves_max_tokens_under_ceiling_untouched() {
        let body = json!({"max_tokens": 10});
        let out = normalize_request(&body, &options(Some(4096), true, None));
        assert_eq!(out["max_tokens"], json!(10));
    }

    #[test]
    fn injects_claude_code_system_for_non_claude_code_requests() {
        let body = json!({"system": "be nice"});
        let out = normalize_request(&body, &options(None, false, None));
        let system = out["system"].as_array().unwrap();
        assert_eq!(system.len(), 2);
        assert_eq!(system[0]["text"], CLAUDE_CODE_SYSTEM_TEXT);
        assert_eq!(system[1]["text"], "be nice");
    }

    #[test]
    fn real_claude_code_request_is_not_double_injected() {
        let body = json!({"system": [{"type": "text", "text": CLAUDE_CODE_SYSTEM_TEXT}]});
        let out = normalize_request(&body, &options(None, true, None));
        let system = out["system"].as_array().unwrap();
        assert_eq!(system.len(), 1);
    }

    #[test]
    fn strips_cache_control_ttl_recursively() {
        let body = json!({
            "system": [{"type": "text", "text": "x", "cache_control": {"type": "ephemeral", "ttl": "1h"}}],
        });
        let out = normalize_request(&body, &options(None, true, None));
        assert!(out["system"][0]["cache_control"].get("ttl").is_none());
    }

    #[test]
    fn proxy_prompt_appended_once() {
        let body = json!({"system": []});
        let opts = options(None, true, Some("house rules"));
        let out = normalize_request(&body, &opts);
        let system = out["system"].as_array().unwrap();
        assert_eq!(system.iter().filter(|b| b["text"] == "house rules").count(), 1);
    }

    #[test]
    fn top_p_removed_when_temperature_also_present() {
        let body = json!({"top_p": 0.9, "temperature": 0.5});
        let out = normalize_request(&body, &options(None, true, None));
        assert!(out.get("top_p").is_none());
        assert_eq!(out["temperature"], json!(0.5));
    }

    #[test]
    fn top_p_kept_when_temperature_absent() {
        let body = json!({"top_p": 0.9});
        let out = normalize_request(&body, &options(None, true, None));
        assert_eq!(out["top_p"], json!(0.9));
    }
}
