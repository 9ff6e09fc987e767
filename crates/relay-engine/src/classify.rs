//! Upstream response classification.

/// The phrase that reclassifies any status code as rate-limited.
const RATE_LIMIT_PHRASE: &str = "exceed your account's rate limit";

/// Case-insensitive header name for the upstream rate-limit reset epoch.
const RATE_LIMIT_RESET_HEADER: &str = "anthropic-ratelimit-unified-reset";

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseClass {
    Success,
    Unauthorized,
    Forbidden,
    RateLimited { reset_at_epoch_secs: Option<i64> },
    ServerError,
    Other,
}

/// Classifies a completed upstream response. `body_text` is
/// only inspected for the rate-limit phrase override; full JSON parsing
/// happens later for usage extraction.
pub fn classify_response(status: u16, body_text: &str, reset_header: Option<&str>) -> ResponseClass {
    if body_text.to_ascii_lowercase().contains(RATE_LIMIT_PHRASE) {
        return ResponseClass::RateLimited {
            reset_at_epoch_secs: reset_header.and_then(|v| v.parse().ok()),
        };
    }

    match status {
        200..=299 => ResponseClass::Success,
        401 => ResponseClass::Unauthorized,
        403 => ResponseClass::Forbidden,
        429 => ResponseClass::RateLimited {
            reset_at_epoch_secs: reset_header.and_then(|v| v.parse().ok()),
        },
        500..=599 => ResponseClass::ServerError,
        _ => ResponseClass::Other,
    }
}

/// Header name the engine looks up (case-insensitively, via the caller's
/// header bag) to extract the rate-limit reset epoch.
pub fn reset_header_name() -> &'static str {
    RATE_LIMIT_RESET_HEADER
}
