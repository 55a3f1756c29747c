//! Contracts between the execution pipeline and its external collaborators.
//!
//! Implementations live elsewhere: the gateway provides the HTTP-backed rule
//! store, tests use the fakes in [`crate::fakes`].

use crate::types::ValidationRule;
use anyhow::Result;
use async_trait::async_trait;

/// Read-only source of validation rules, keyed by challenge id.
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Rules for one challenge. `Ok(None)` means the challenge does not exist.
    async fn rules_for(&self, challenge_id: &str) -> Result<Option<Vec<ValidationRule>>>;
}

/// Produces the correlation id attached to every request.
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

/// Random v4 UUIDs.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn next_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// Store used when no rule backend is configured. Every lookup fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRuleStore;

#[async_trait]
impl RuleStore for NoRuleStore {
    async fn rules_for(&self, challenge_id: &str) -> Result<Option<Vec<ValidationRule>>> {
        anyhow::bail!("no rule store configured (challenge '{challenge_id}')")
    }
}
