//! Upstream provider and account-type taxonomy.

use serde::{Deserialize, Serialize};

/// The LLM API family a request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Claude,
    Gemini,
    Bedrock,
    OpenAi,
}

impl Provider {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "claude" | "anthropic" => Some(Self::Claude),
            "gemini" => Some(Self::Gemini),
            "bedrock" => Some(Self::Bedrock),
            "openai" | "openai-compatible" => Some(Self::OpenAi),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Gemini => "gemini",
            Self::Bedrock => "bedrock",
            Self::OpenAi => "openai",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Concrete upstream account flavor.
///
/// Distinct from [`Provider`]: a single provider (Claude) can be reached
/// through more than one account type (official OAuth vs. console API key).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccountType {
    ClaudeOfficial,
    ClaudeConsole,
    Bedrock,
    Gemini,
    OpenAiCompatible,
    Azure,
}

impl AccountType {
    pub fn provider(self) -> Provider {
        match self {
            Self::ClaudeOfficial | Self::ClaudeConsole => Provider::Claude,
            Self::Bedrock => Provider::Bedrock,
            Self::Gemini => Provider::Gemini,
            Self::OpenAiCompatible | Self::Azure => Provider::OpenAi,
        }
    }

    /// Platform identifier used in refresh-lock keys (`token_refresh_lock:{platform}:{id}`).
    ///
    /// Claude official and console accounts share a refresh platform since
    /// they exchange the same kind of OAuth token; the other account types
    /// are refreshed, if at all, under their own name.
    pub fn refresh_platform(self) -> &'static str {
        match self {
            Self::ClaudeOfficial | Self::ClaudeConsole => "claude",
            Self::Bedrock => "bedrock",
            Self::Gemini => "gemini",
            Self::OpenAiCompatible => "openai",
            Self::Azure => "azure",
        }
    }

    /// Whether this account type participates in the weekly Opus-cost counter.
    pub fn tracks_opus_cost(self) -> bool {
        matches!(self, Self::ClaudeOfficial | Self::ClaudeConsole)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_parse_is_case_insensitive() {
        assert_eq!(Provider::parse("CLAUDE"), Some(Provider::Claude));
        assert_eq!(Provider::parse("anthropic"), Some(Provider::Claude));
        assert_eq!(Provider::parse("nope"), None);
    }

    #[test]
    fn account_type_maps_to_provider() {
        assert_eq!(AccountType::ClaudeConsole.provider(), Provider::Claude);
        assert_eq!(AccountType::OpenAiCompatible.provider(), Provider::OpenAi);
    }

    #[test]
    fn claude_variants_share_refresh_platform() {
        assert_eq!(
            AccountType::ClaudeOfficial.refresh_platform(),
            AccountType::ClaudeConsole.refresh_platform()
        );
    }

    #[test]
    fn opus_cost_tracked_only_for_claude() {
        assert!(AccountType::ClaudeOfficial.tracks_opus_cost());
        assert!(!AccountType::Gemini.tracks_opus_cost());
    }
}
