use crate::traits::RuleStore;
use crate::types::ValidationRule;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;

/// Rule store held entirely in memory, typically loaded once from a JSON
/// file shaped like `{"<challenge id>": [rule, ...]}`.
#[derive(Debug, Clone, Default)]
pub struct StaticRuleStore {
    rules: HashMap<String, Vec<ValidationRule>>,
}

impl StaticRuleStore {
    pub fn new(rules: HashMap<String, Vec<ValidationRule>>) -> Self {
        Self { rules }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let rules = serde_json::from_str(json).context("failed to parse rules JSON")?;
        Ok(Self { rules })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read rules file: {}", path.display()))?;
        Self::from_json(&content).with_context(|| format!("invalid rules file: {}", path.display()))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[async_trait]
impl RuleStore for StaticRuleStore {
    async fn rules_for(&self, challenge_id: &str) -> Result<Option<Vec<ValidationRule>>> {
        Ok(self.rules.get(challenge_id).cloned())
    }
}
