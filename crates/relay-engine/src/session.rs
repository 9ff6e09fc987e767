//! Deterministic session-hash computation.
//!
//! The hash must be stable across retries of the same inbound body, and it
//! deliberately ignores model/sampling fields: retries try a different
//! account, not a different conversation, so the mapping stays keyed on
//! conversational identity (`messages` + `system`).

use sha2::{Digest, Sha256};
use serde_json::Value;

/// Computes a stable session hash from the inbound request body's
/// conversational content, used as the sticky-session key.
pub fn compute_session_hash(body: &Value) -> String {
    let canonical = serde_json::json!({
        "system": body.get("system").cloned().unwrap_or(Value::Null),
        "messages": body.get("messages").cloned().unwrap_or(Value::Null),
    });
    // `serde_json::Value`'s `Display` serializes object keys in insertion
    // order, but both sides of this literal are fixed, so the output is
    // stable regardless of the inbound body's own key ordering.
    let canonical_bytes = canonical.to_string();
    let mut hasher = Sha256::new();
    hasher.update(canonical_bytes.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn same_conversation_hashes_identically_regardless_of_sampling_params() {
        let a = json!({"model": "m1", "temperature": 0.1, "messages": [{"role":"user","content":"hi"}]});
        let b = json!({"model": "m2", "temperature": 0.9, "messages": [{"role":"user","content":"hi"}]});
        assert_eq!(compute_session_hash(&a), compute_session_hash(&b));
    }

    #[test]
    fn different_conversations_hash_differently() {
        let a = json!({"messages": [{"role":"user","content":"hi"}]});
        let b = json!({"messages": [{"role":"user","content":"bye"}]});
        assert_ne!(compute_session_hash(&a), compute_session_hash(&b));
    }
}
