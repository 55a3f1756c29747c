//! Rule store backends selected by `[rules]`.

use crate::config::{RulesBackend, RulesConfig};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use shellbox_core::{NoRuleStore, RuleStore, StaticRuleStore, ValidationRule};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Reads challenge rules from a PostgREST endpoint (e.g. Supabase):
/// `GET {url}/rest/v1/{table}?id=eq.{id}&select=validation_rules`.
pub(crate) struct PostgrestRuleStore {
    client: Client,
    endpoint: String,
    api_key: String,
}

impl std::fmt::Debug for PostgrestRuleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgrestRuleStore")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct ChallengeRow {
    #[serde(default)]
    validation_rules: Option<Vec<ValidationRule>>,
}

impl PostgrestRuleStore {
    pub(crate) fn new(url: &str, table: &str, api_key: String) -> Result<Self> {
        let base = url.trim().trim_end_matches('/');
        anyhow::ensure!(
            base.starts_with("http://") || base.starts_with("https://"),
            "rules url must be http(s): {base}"
        );
        anyhow::ensure!(!table.trim().is_empty(), "rules table must be set");

        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to create HTTP client")?;

        Ok(Self {
            client,
            endpoint: format!("{base}/rest/v1/{}", table.trim()),
            api_key,
        })
    }
}

#[async_trait]
impl RuleStore for PostgrestRuleStore {
    async fn rules_for(&self, challenge_id: &str) -> Result<Option<Vec<ValidationRule>>> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("id", format!("eq.{challenge_id}")),
                ("select", "validation_rules".to_owned()),
            ])
            .header("apikey", &self.api_key)
            .header("authorization", format!("Bearer {}", self.api_key))
            .header("accept", "application/json")
            .send()
            .await
            .context("rule store request failed")?;

        let status = response.status();
        debug!(status = %status, challenge_id, "rule store response");
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("rule store returned {status}: {body}");
        }

        let body = response
            .text()
            .await
            .context("failed to read rule store response")?;
        parse_rows(&body)
    }
}

/// Single-row lookup: no row means the challenge does not exist, a null
/// column means it has no rules.
fn parse_rows(body: &str) -> Result<Option<Vec<ValidationRule>>> {
    let rows: Vec<ChallengeRow> =
        serde_json::from_str(body).context("rule store returned malformed JSON")?;
    Ok(rows
        .into_iter()
        .next()
        .map(|row| row.validation_rules.unwrap_or_default()))
}

/// Build the configured backend. `lookup` resolves the service key variable.
pub(crate) fn build_rule_store<F>(
    config: &RulesConfig,
    base_dir: &Path,
    lookup: F,
) -> Result<Arc<dyn RuleStore>>
where
    F: Fn(&str) -> Option<String>,
{
    match config.backend {
        RulesBackend::None => {
            info!("no rule store configured, challenge validation will report setup failures");
            Ok(Arc::new(NoRuleStore))
        }
        RulesBackend::Postgrest => {
            let url = config
                .url
                .as_deref()
                .context("rules.url is required for the postgrest backend")?;
            let key = lookup(&config.key_env).with_context(|| {
                format!("{} must be set for the postgrest backend", config.key_env)
            })?;
            let store = PostgrestRuleStore::new(url, &config.table, key)?;
            info!(endpoint = %store.endpoint, "using postgrest rule store");
            Ok(Arc::new(store))
        }
        RulesBackend::File => {
            let path = config
                .path
                .as_deref()
                .context("rules.path is required for the file backend")?;
            let path = resolve_path(base_dir, path);
            let store = StaticRuleStore::load(&path)?;
            info!(path = %path.display(), challenges = store.len(), "loaded rules file");
            Ok(Arc::new(store))
        }
    }
}

fn resolve_path(base_dir: &Path, path: &str) -> std::path::PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}
