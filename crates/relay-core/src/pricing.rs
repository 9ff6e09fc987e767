//! Pricing table and cost computation.
//!
//! The pricing table itself is an external collaborator ("pricing-
//! table loader" is out of scope); this module only defines the shape of an
//! entry, the trait a loader must satisfy, and the pure cost/long-context
//! arithmetic that the usage pipeline relies on.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Per-token rates for a single model, in the pricing table's unit currency.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_token: f64,
    pub output_per_token: f64,
    pub cache_create_per_token: f64,
    pub cache_read_per_token: f64,
    pub ephemeral_5m_per_token: f64,
    pub ephemeral_1h_per_token: f64,
    /// `max_tokens` ceiling this model accepts, if the table records one.
    pub max_tokens: Option<u64>,
}

/// Token counts consumed in computing cost for a single usage observation.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenCounts {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_create_tokens: u64,
    pub cache_read_tokens: u64,
    pub ephemeral_5m_tokens: u64,
    pub ephemeral_1h_tokens: u64,
}

impl ModelPricing {
    /// `cost = input*in + output*out + cacheCreate*cc + cacheRead*cr + eph5m*e5 + eph1h*e1`.
    pub fn cost(&self, counts: TokenCounts) -> f64 {
        (counts.input_tokens as f64) * self.input_per_token
            + (counts.output_tokens as f64) * self.output_per_token
            + (counts.cache_create_tokens as f64) * self.cache_create_per_token
            + (counts.cache_read_tokens as f64) * self.cache_read_per_token
            + (counts.ephemeral_5m_tokens as f64) * self.ephemeral_5m_per_token
            + (counts.ephemeral_1h_tokens as f64) * self.ephemeral_1h_per_token
    }
}

/// Threshold above which a `[1m]`-context model counts as long-context.
const LONG_CONTEXT_INPUT_THRESHOLD: u64 = 200_000;

/// Whether `model` is a long-context invocation: its id carries a `[1m]`
/// marker and the total input exceeds the threshold.
pub fn is_long_context(model: &str, total_input_tokens: u64) -> bool {
    model.contains("[1m]") && total_input_tokens > LONG_CONTEXT_INPUT_THRESHOLD
}

/// Read-only accessor for per-model pricing. A `StaticPricingTable` backs
/// tests and defaults; a real deployment plugs in its own loader (out of
/// scope) behind the same trait.
pub trait PricingTable: Send + Sync {
    fn get(&self, model: &str) -> Option<ModelPricing>;

    /// Convenience wrapper returning [`CoreError::UnknownModel`] on a miss.
    fn require(&self, model: &str) -> Result<ModelPricing, CoreError> {
        self.get(model).ok_or_else(|| CoreError::UnknownModel {
            model: model.to_owned(),
        })
    }

    /// The model ids this table has pricing for, used by the `/models`
    /// listing endpoint. A loader with no static key set may return an
    /// empty list.
    fn model_ids(&self) -> Vec<String> {
        Vec::new()
    }
}

/// In-memory pricing table, typically seeded once at startup and refreshed
/// periodically by swapping in a freshly loaded table.
#[derive(Debug, Clone, Default)]
pub struct StaticPricingTable {
    entries: HashMap<String, ModelPricing>,
}

impl StaticPricingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(mut self, model: impl Into<String>, pricing: ModelPricing) -> Self {
        self.entries.insert(model.into(), pricing);
        self
    }

    /// Atomically replace the whole table (periodic refresh).
    pub fn replace(&mut self, entries: HashMap<String, ModelPricing>) {
        self.entries = entries;
    }
}

impl PricingTable for StaticPricingTable {
    fn get(&self, model: &str) -> Option<ModelPricing> {
        self.entries.get(model).copied()
    }

    fn model_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_is_linear_combination() {
        let pricing = ModelPricing {
            input_per_token: 0.01,
            output_per_token: 0.02,
            cache_create_per_token: 0.005,
            cache_read_per_token: 0.001,
            ephemeral_5m_per_token: 0.0,
            ephemeral_1h_per_token: 0.0,
            max_tokens: None,
        };
        let counts = TokenCounts {
            input_tokens: 100,
            output_tokens: 50,
            cache_create_tokens: 10,
            cache_read_tokens: 20,
            ..Default::default()
        };
        let cost = pricing.cost(counts);
        assert!((cost - (1.0 + 1.0 + 0.05 + 0.02)).abs() < 1e-9);
    }

    #[test]
    fn long_context_requires_marker_and_threshold() {
        assert!(is_long_context("claude-3-opus-[1m]", 200_001));
        assert!(!is_long_context("claude-3-opus-[1m]", 200_000));
        assert!(!is_long_context("claude-3-opus", 500_000));
    }

    #[test]
    fn unknown_model_is_an_error() {
        let table = StaticPricingTable::new();
        assert!(table.require("nope").is_err());
    }

    #[test]
    fn table_replace_swaps_entries_atomically() {
        let mut table = StaticPricingTable::new();
        table.replace(HashMap::from([("m".to_owned(), ModelPricing::default())]));
        assert!(table.get("m").is_some());
    }
}
