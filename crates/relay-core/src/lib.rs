//! Shared domain model for the LLM relay proxy.
//!
//! This crate has no I/O of its own: it defines the entities described by the
//! data model (tenant keys, upstream accounts, session mappings, usage
//! events), the provider/account-type taxonomy, and the pricing/cost
//! calculation used by the usage pipeline. Every other crate in the
//! workspace depends on this one for its vocabulary.

pub mod error;
pub mod model;
pub mod pricing;
pub mod provider;

pub use error::CoreError;
pub use model::{
    AccountStatus, CredentialBundle, KeyPermission, RateLimitWindow, SessionMapping, TenantKey,
    UpstreamAccount, UsageEvent,
};
pub use pricing::{ModelPricing, PricingTable, StaticPricingTable};
pub use provider::{AccountType, Provider};
