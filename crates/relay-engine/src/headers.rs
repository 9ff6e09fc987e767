//! Inbound → outbound header handling.

use std::collections::BTreeMap;

/// Headers that never cross to the upstream call: they either describe the
/// inbound transport (content-length, connection, transfer-encoding) or
/// carry credentials the engine replaces with its own (authorization,
/// x-api-key).
const STRIPPED_HEADERS: &[&str] = &[
    "content-type",
    "user-agent",
    "x-api-key",
    "authorization",
    "host",
    "content-length",
    "connection",
    "proxy-authorization",
    "content-encoding",
    "transfer-encoding",
];

/// Case-insensitive header bag keyed by lower-cased names, preserving the
/// order headers were inserted.
#[derive(Debug, Clone, Default)]
pub struct HeaderBag {
    entries: Vec<(String, String)>,
}

impl HeaderBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut bag = Self::new();
        for (name, value) in pairs {
            bag.insert(name, value);
        }
        bag
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let lower = name.to_ascii_lowercase();
        if let Some(entry) = self.entries.iter_mut().find(|(n, _)| *n == lower) {
            entry.1 = value.into();
        } else {
            self.entries.push((lower, value.into()));
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        let lower = name.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(n, _)| *n == lower)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn as_map(&self) -> BTreeMap<String, String> {
        self.entries.iter().cloned().collect()
    }
}

/// Builds the outbound header set for a single relay attempt:
/// every inbound header survives except [`STRIPPED_HEADERS`] and
/// `x-request-id`, which is preserved explicitly rather than stripped, then
/// the engine's own auth/version/beta headers are injected.
pub fn build_outbound_headers(
    inbound: &HeaderBag,
    access_token: &str,
    api_version: &str,
    beta_header: Option<&str>,
) -> HeaderBag {
    let mut outbound = HeaderBag::new();
    for (name, value) in inbound.iter() {
        if STRIPPED_HEADERS.contains(&name) {
            continue;
        }
        outbound.insert(name, value);
    }

    outbound.insert("authorization", format!("Bearer {access_token}"));
    outbound.insert("anthropic-version", api_version);
    if let Some(beta) = beta_header {
        outbound.insert("anthropic-beta", beta);
    }
    outbound
}

/// Heuristic for "real Claude-Code request":
/// the inbound user-agent matches `claude-cli/<version>` and the first
/// element of the request's `system` array is the canonical Claude-Code
/// system text.
pub fn is_real_claude_code_request(user_agent: Option<&str>, first_system_text: Option<&str>) -> bool {
    let ua_matches = user_agent.is_some_and(|ua| {
        ua.split_once("claude-cli/")
            .is_some_and(|(_, rest)| rest.chars().next().is_some_and(|c| c.is_ascii_digit()))
    });
    let system_matches =
        first_system_text.is_some_and(|text| text == crate::normalize::CLAUDE_CODE_SYSTEM_TEXT);
    ua_matches && system_matches
}

/// Header-name prefixes that make up the Claude-Code client's outbound
/// fingerprint, captured onto the account when [`is_real_claude_code_request`]
/// holds for the request.
const CLAUDE_CODE_HEADER_PREFIXES: &[&str] = &["x-app"];

/// Selects the inbound headers that identify a Claude-Code client: its
/// user-agent plus any `x-app`-prefixed header.
pub fn claude_code_shaped_headers(inbound: &HeaderBag) -> Vec<(String, String)> {
    inbound
        .iter()
        .filter(|(name, _)| {
            *name == "user-agent" || CLAUDE_CODE_HEADER_PREFIXES.iter().any(|p| name.starts_with(p))
        })
        .map(|(name, value)| (name.to_owned(), value.to_owned()))
        .collect()
}

/// Case-insensitive lookup of the upstream `*-unified-5h-status` advisory
/// header on a response. [`HeaderBag`] already lower-cases every name on
/// insert, so a suffix match is sufficient.
pub fn session_window_status(response: &HeaderBag) -> Option<String> {
    response
        .iter()
        .find(|(name, _)| name.ends_with("unified-5h-status"))
        .map(|(_, value)| value.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_bag_lookup_is_case_insensitive() {
        let mut bag = HeaderBag::new();
        bag.insert("X-Request-Id", "abc");
        assert_eq!(bag.get("x-request-id"), Some("abc"));
    }

    #[test]
    fn outbound_strips_transport_and_auth_headers() {
        let mut inbound = HeaderBag::new();
        inbound.insert("x-api-key", "secret");
        inbound.insert("content-type", "application/json");
        inbound.insert("x-request-id", "req-1");

        let outbound = build_outbound_headers(&inbound, "tok", "2023-06-01", Some("beta-x"));
        assert_eq!(outbound.get("x-api-key"), None);
        assert_eq!(outbound.get("content-type"), None);
        assert_eq!(outbound.get("x-request-id"), Some("req-1"));
        assert_eq!(outbound.get("authorization"), Some("Bearer tok"));
        assert_eq!(outbound.get("anthropic-beta"), Some("beta-x"));
    }

    #[test]
    fn claude_code_detection_requires_both_signals() {
        assert!(is_real_claude_code_request(
            Some("claude-cli/1.2.3"),
            Some(crate::normalize::CLAUDE_CODE_SYSTEM_TEXT)
        ));
        assert!(!is_real_claude_code_request(Some("claude-cli/1.2.3"), Some("other")));
        assert!(!is_real_claude_code_request(Some("curl/8.0"), Some(crate::normalize::CLAUDE_CODE_SYSTEM_TEXT)));
    }

    #[test]
    fn claude_code_shaped_headers_picks_user_agent_and_x_app_headers() {
        let mut inbound = HeaderBag::new();
        inbound.insert("user-agent", "claude-cli/1.2.3");
        inbound.insert("x-app", "cli");
        inbound.insert("content-type", "application/json");

        let captured = claude_code_shaped_headers(&inbound);
        assert!(captured.contains(&("user-agent".to_owned(), "claude-cli/1.2.3".to_owned())));
        assert!(captured.contains(&("x-app".to_owned(), "cli".to_owned())));
        assert!(!captured.iter().any(|(n, _)| n == "content-type"));
    }

    #[test]
    fn session_window_status_is_case_insensitive_suffix_match() {
        let mut response = HeaderBag::new();
        response.insert("Anthropic-Unified-5h-Status", "allowed");
        assert_eq!(session_window_status(&response), Some("allowed".to_owned()));
        assert_eq!(session_window_status(&HeaderBag::new()), None);
    }
}
