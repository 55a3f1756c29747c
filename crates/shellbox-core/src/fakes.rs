//! Fake implementations for testing.
#![allow(clippy::unwrap_used)]

use crate::traits::{IdGenerator, RuleStore};
use crate::types::ValidationRule;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

// ---------------------------------------------------------------------------
// FakeRuleStore
// ---------------------------------------------------------------------------

/// Rule store that records every lookup and can be told to fail.
#[derive(Debug, Default)]
pub struct FakeRuleStore {
    rules: HashMap<String, Vec<ValidationRule>>,
    failure: Option<String>,
    lookups: Mutex<Vec<String>>,
}

impl FakeRuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            failure: Some(message.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_rules(mut self, challenge_id: impl Into<String>, rules: Vec<ValidationRule>) -> Self {
        self.rules.insert(challenge_id.into(), rules);
        self
    }

    pub fn lookups(&self) -> Vec<String> {
        self.lookups.lock().unwrap().clone()
    }
}

#[async_trait]
impl RuleStore for FakeRuleStore {
    async fn rules_for(&self, challenge_id: &str) -> Result<Option<Vec<ValidationRule>>> {
        self.lookups.lock().unwrap().push(challenge_id.to_owned());
        if let Some(message) = &self.failure {
            anyhow::bail!("{message}");
        }
        Ok(self.rules.get(challenge_id).cloned())
    }
}

// ---------------------------------------------------------------------------
// SequentialIds
// ---------------------------------------------------------------------------

/// Deterministic correlation ids: `exec-1`, `exec-2`, ...
#[derive(Debug, Default)]
pub struct SequentialIds {
    next: AtomicU64,
}

impl SequentialIds {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdGenerator for SequentialIds {
    fn next_id(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        format!("exec-{n}")
    }
}
