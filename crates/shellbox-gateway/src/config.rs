use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use shellbox_core::TimeoutLimits;
use shellbox_sandbox::{SandboxLimits, ScriptPolicy, parse_size};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

const CONFIG_FILE_NAME: &str = "shellbox.toml";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub rules: RulesConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct ServerConfig {
    pub bind: String,
    pub cors_origin: String,
    pub max_body_bytes: usize,
    pub rate_limit: RateLimitConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3001".to_owned(),
            cors_origin: "http://localhost:5173".to_owned(),
            max_body_bytes: 10 * 1024 * 1024,
            rate_limit: RateLimitConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct RateLimitConfig {
    pub enabled: bool,
    pub max_requests: u32,
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: 100,
            window_secs: 15 * 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct ExecutionConfig {
    pub default_timeout_ms: u64,
    pub max_timeout_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 10_000,
            max_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct SandboxConfig {
    pub image: String,
    pub docker_socket: Option<String>,
    pub pull_image: bool,
    pub memory: String,
    pub pids_limit: u32,
    pub file_size: String,
    pub cpu_percent: u32,
    pub tmpfs_size: String,
    pub uid: u32,
    pub gid: u32,
    pub max_output_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "alpine:latest".to_owned(),
            docker_socket: None,
            pull_image: true,
            memory: "128m".to_owned(),
            pids_limit: 10,
            file_size: "1m".to_owned(),
            cpu_percent: 50,
            tmpfs_size: "16m".to_owned(),
            uid: 1000,
            gid: 1000,
            max_output_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct PolicyConfig {
    pub enabled: bool,
    /// Replaces the built-in allowlist when set.
    pub allow: Option<Vec<String>>,
    /// Replaces the built-in denylist when set.
    pub deny: Option<Vec<String>>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allow: None,
            deny: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum RulesBackend {
    #[default]
    None,
    Postgrest,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct RulesConfig {
    pub backend: RulesBackend,
    /// Base URL of the PostgREST endpoint.
    pub url: Option<String>,
    /// Environment variable holding the service key.
    pub key_env: String,
    pub table: String,
    /// JSON rules file for the `file` backend.
    pub path: Option<String>,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            backend: RulesBackend::None,
            url: None,
            key_env: "SUPABASE_SERVICE_ROLE_KEY".to_owned(),
            table: "challenges".to_owned(),
            path: None,
        }
    }
}

impl Config {
    /// Load config from a TOML file.
    pub(crate) fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Load the config at `path` if it exists. A missing file falls back to
    /// defaults unless it was named explicitly.
    pub(crate) fn load_or_default(path: &Path, explicit: bool) -> Result<Self> {
        if explicit || path.exists() {
            return Self::load(path);
        }
        info!(path = %path.display(), "no config file found, using defaults");
        Ok(Self::default())
    }

    /// Resolve config path: check arg, then default locations.
    pub(crate) fn find_config_path(explicit: Option<&str>) -> PathBuf {
        if let Some(p) = explicit {
            return PathBuf::from(p);
        }

        let local = PathBuf::from(CONFIG_FILE_NAME);
        if local.exists() {
            return local;
        }

        if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
            let xdg = PathBuf::from(config_dir).join("shellbox").join(CONFIG_FILE_NAME);
            if xdg.exists() {
                return xdg;
            }
        }

        if let Ok(home) = std::env::var("HOME") {
            let home_config = PathBuf::from(home)
                .join(".config/shellbox")
                .join(CONFIG_FILE_NAME);
            if home_config.exists() {
                return home_config;
            }
        }

        local
    }

    /// Apply deployment environment overrides (`PORT`, `FRONTEND_URL`,
    /// `SUPABASE_URL`). `lookup` is `std::env::var` outside of tests.
    pub(crate) fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("PORT") {
            let port: u16 = port
                .trim()
                .parse()
                .with_context(|| format!("PORT is not a valid port: {port}"))?;
            let mut addr = self.bind_addr()?;
            addr.set_port(port);
            self.server.bind = addr.to_string();
            debug!(bind = %self.server.bind, "bind address overridden by PORT");
        }
        if let Some(origin) = lookup("FRONTEND_URL") {
            self.server.cors_origin = origin;
        }
        if let Some(url) = lookup("SUPABASE_URL") {
            self.rules.backend = RulesBackend::Postgrest;
            self.rules.url = Some(url);
        }
        Ok(())
    }

    pub(crate) fn bind_addr(&self) -> Result<SocketAddr> {
        self.server
            .bind
            .parse()
            .with_context(|| format!("invalid server.bind address: {}", self.server.bind))
    }

    pub(crate) fn timeout_limits(&self) -> Result<TimeoutLimits> {
        let exec = &self.execution;
        anyhow::ensure!(exec.max_timeout_ms > 0, "execution.max_timeout_ms must be positive");
        anyhow::ensure!(
            exec.default_timeout_ms > 0 && exec.default_timeout_ms <= exec.max_timeout_ms,
            "execution.default_timeout_ms ({}) must be between 1 and max_timeout_ms ({})",
            exec.default_timeout_ms,
            exec.max_timeout_ms
        );
        Ok(TimeoutLimits {
            default: Duration::from_millis(exec.default_timeout_ms),
            max: Duration::from_millis(exec.max_timeout_ms),
        })
    }

    pub(crate) fn sandbox_limits(&self) -> Result<SandboxLimits> {
        let sandbox = &self.sandbox;
        anyhow::ensure!(!sandbox.image.trim().is_empty(), "sandbox.image must be set");
        anyhow::ensure!(
            (1..=100).contains(&sandbox.cpu_percent),
            "sandbox.cpu_percent must be between 1 and 100"
        );
        anyhow::ensure!(sandbox.pids_limit > 0, "sandbox.pids_limit must be positive");
        anyhow::ensure!(
            sandbox.uid != 0 && sandbox.gid != 0,
            "sandbox.uid and sandbox.gid must not be root"
        );

        let size = |field: &str, value: &str| -> Result<u64> {
            let bytes = parse_size(value).with_context(|| format!("sandbox.{field}"))?;
            anyhow::ensure!(bytes > 0, "sandbox.{field} must be non-zero");
            Ok(bytes)
        };

        Ok(SandboxLimits {
            image: sandbox.image.clone(),
            memory_limit: size("memory", &sandbox.memory)?,
            pids_limit: sandbox.pids_limit,
            file_size_limit: size("file_size", &sandbox.file_size)?,
            cpu_percent: sandbox.cpu_percent,
            tmpfs_size: size("tmpfs_size", &sandbox.tmpfs_size)?,
            uid: sandbox.uid,
            gid: sandbox.gid,
        })
    }

    pub(crate) fn script_policy(&self) -> Result<ScriptPolicy> {
        use shellbox_sandbox::script_policy::{DEFAULT_ALLOW, DEFAULT_DENY};

        let policy = &self.policy;
        if !policy.enabled {
            return Ok(ScriptPolicy::disabled());
        }
        let built = match (&policy.allow, &policy.deny) {
            (None, None) => Ok(ScriptPolicy::default()),
            (Some(allow), Some(deny)) => ScriptPolicy::new(allow, deny),
            (Some(allow), None) => ScriptPolicy::new(allow, DEFAULT_DENY),
            (None, Some(deny)) => ScriptPolicy::new(DEFAULT_ALLOW, deny),
        };
        built.context("invalid [policy] tables")
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn empty_file_yields_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.server.bind, "0.0.0.0:3001");
        assert_eq!(config.server.rate_limit.max_requests, 100);
        assert_eq!(config.server.rate_limit.window_secs, 900);
        assert_eq!(config.execution.default_timeout_ms, 10_000);
        assert_eq!(config.sandbox.image, "alpine:latest");
        assert!(config.policy.enabled);
        assert_eq!(config.rules.backend, RulesBackend::None);
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
[server]
bind = "127.0.0.1:8080"
cors_origin = "https://learn.example.com"

[server.rate_limit]
enabled = false

[execution]
default_timeout_ms = 5000
max_timeout_ms = 20000

[sandbox]
image = "busybox:1.36"
memory = "64m"
pids_limit = 16

[policy]
allow = ["date"]

[rules]
backend = "postgrest"
url = "https://abc.supabase.co"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:8080");
        assert!(!config.server.rate_limit.enabled);
        assert_eq!(config.server.rate_limit.max_requests, 100);
        assert_eq!(config.execution.max_timeout_ms, 20_000);
        assert_eq!(config.sandbox.image, "busybox:1.36");
        assert_eq!(config.sandbox.file_size, "1m");
        assert_eq!(config.rules.backend, RulesBackend::Postgrest);
        assert_eq!(config.rules.table, "challenges");

        let limits = config.sandbox_limits().unwrap();
        assert_eq!(limits.memory_limit, 64 * 1024 * 1024);
        assert_eq!(limits.pids_limit, 16);

        let policy = config.script_policy().unwrap();
        assert!(policy.evaluate("date").allowed);
        assert!(!policy.evaluate("ls").allowed);
        assert_eq!(
            policy.evaluate("rm x").reason,
            "Execution of command 'rm' is not permitted."
        );
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = toml::from_str::<Config>("[sandbox]\nnetwork = \"host\"\n").unwrap_err();
        assert!(err.to_string().contains("network"), "{err}");
    }

    #[test]
    fn env_overrides_port_origin_and_rules() {
        let mut config = Config::default();
        config
            .apply_env(env(&[
                ("PORT", "4000"),
                ("FRONTEND_URL", "https://app.example.com"),
                ("SUPABASE_URL", "https://xyz.supabase.co"),
            ]))
            .unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:4000");
        assert_eq!(config.server.cors_origin, "https://app.example.com");
        assert_eq!(config.rules.backend, RulesBackend::Postgrest);
        assert_eq!(config.rules.url.as_deref(), Some("https://xyz.supabase.co"));
    }

    #[test]
    fn invalid_port_is_an_error() {
        let mut config = Config::default();
        let err = config.apply_env(env(&[("PORT", "http")])).unwrap_err();
        assert!(err.to_string().contains("PORT"));
    }

    #[test]
    fn timeout_ordering_is_checked() {
        let mut config = Config::default();
        config.execution.default_timeout_ms = 60_000;
        assert!(config.timeout_limits().is_err());

        let limits = Config::default().timeout_limits().unwrap();
        assert_eq!(limits, TimeoutLimits::default());
    }

    #[test]
    fn root_sandbox_identity_is_rejected() {
        let mut config = Config::default();
        config.sandbox.uid = 0;
        let err = config.sandbox_limits().unwrap_err();
        assert!(err.to_string().contains("root"));
    }

    #[test]
    fn bad_size_names_the_field() {
        let mut config = Config::default();
        config.sandbox.memory = "lots".to_owned();
        let err = config.sandbox_limits().unwrap_err();
        assert!(format!("{err:#}").contains("sandbox.memory"));
    }

    #[test]
    fn disabled_policy_allows_everything() {
        let mut config = Config::default();
        config.policy.enabled = false;
        assert!(config.script_policy().unwrap().evaluate("rm -rf /").allowed);
    }

    #[test]
    fn missing_default_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shellbox.toml");
        assert_eq!(
            Config::load_or_default(&path, false).unwrap(),
            Config::default()
        );
        assert!(Config::load_or_default(&path, true).is_err());

        std::fs::write(&path, "[execution]\nmax_timeout_ms = 15000\n").unwrap();
        let config = Config::load_or_default(&path, false).unwrap();
        assert_eq!(config.execution.max_timeout_ms, 15_000);
    }
}
