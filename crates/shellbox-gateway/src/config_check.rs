use std::path::Path;

use hyper::header::HeaderValue;
use shellbox_sandbox::DockerRuntime;

use crate::config::{Config, RulesBackend};
use crate::rule_store::build_rule_store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Severity {
    Error,
    Warning,
    Info,
}

impl Severity {
    fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct CheckResult {
    pub name: &'static str,
    pub severity: Severity,
    pub passed: bool,
    pub message: String,
}

impl CheckResult {
    fn pass(name: &'static str, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            name,
            severity,
            passed: true,
            message: message.into(),
        }
    }

    fn fail(name: &'static str, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            name,
            severity,
            passed: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct CheckReport {
    pub results: Vec<CheckResult>,
}

impl CheckReport {
    pub(crate) fn push(&mut self, result: CheckResult) {
        self.results.push(result);
    }

    pub(crate) fn has_errors(&self) -> bool {
        self.results
            .iter()
            .any(|r| r.severity == Severity::Error && !r.passed)
    }

    fn error_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.severity == Severity::Error && !r.passed)
            .count()
    }

    fn warning_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.severity == Severity::Warning && !r.passed)
            .count()
    }

    fn format_result(r: &CheckResult) -> String {
        let icon = if r.severity == Severity::Info {
            "·"
        } else if r.passed {
            "✓"
        } else {
            match r.severity {
                Severity::Warning => "⚠",
                _ => "✗",
            }
        };
        format!("{icon} {}", r.message)
    }

    pub(crate) fn to_summary_string(&self) -> String {
        let mut lines: Vec<String> = self.results.iter().map(Self::format_result).collect();
        let errors = self.error_count();
        let warnings = self.warning_count();
        if errors == 0 && warnings == 0 {
            lines.push("\nall checks passed".to_owned());
        } else {
            lines.push(format!("\n{errors} error(s), {warnings} warning(s)"));
        }
        lines.join("\n")
    }

    pub(crate) fn to_json_value(&self) -> serde_json::Value {
        let checks: Vec<serde_json::Value> = self
            .results
            .iter()
            .map(|r| {
                serde_json::json!({
                    "name": r.name,
                    "severity": r.severity.as_str(),
                    "passed": r.passed,
                    "message": r.message,
                })
            })
            .collect();

        serde_json::json!({
            "passed": !self.has_errors(),
            "errors": self.error_count(),
            "warnings": self.warning_count(),
            "checks": checks,
        })
    }
}

/// Static checks. Returns the effective config (file plus environment
/// overrides) when it could be parsed, for the runtime checks that follow.
pub(crate) fn validate_config<F>(
    config_path: &Path,
    explicit: bool,
    lookup: F,
) -> (CheckReport, Option<Config>)
where
    F: Fn(&str) -> Option<String>,
{
    let mut report = CheckReport::default();

    // 1. toml_parse
    let mut config = if explicit || config_path.exists() {
        match Config::load(config_path) {
            Ok(c) => {
                report.push(CheckResult::pass(
                    "toml_parse",
                    Severity::Error,
                    format!("config syntax valid: {}", config_path.display()),
                ));
                c
            }
            Err(e) => {
                report.push(CheckResult::fail("toml_parse", Severity::Error, format!("{e:#}")));
                return (report, None);
            }
        }
    } else {
        report.push(CheckResult::fail(
            "toml_parse",
            Severity::Info,
            format!("no config at {}, using defaults", config_path.display()),
        ));
        Config::default()
    };

    // 2. env_overrides
    if let Err(e) = config.apply_env(&lookup) {
        report.push(CheckResult::fail("env_overrides", Severity::Error, format!("{e:#}")));
    }

    // 3. bind_address
    report.push(match config.bind_addr() {
        Ok(addr) => CheckResult::pass("bind_address", Severity::Error, format!("bind: {addr}")),
        Err(e) => CheckResult::fail("bind_address", Severity::Error, format!("{e:#}")),
    });

    // 4. cors_origin
    report.push(
        match HeaderValue::from_str(config.server.cors_origin.trim()) {
            Ok(_) => CheckResult::pass(
                "cors_origin",
                Severity::Error,
                format!("cors origin: {}", config.server.cors_origin),
            ),
            Err(_) => CheckResult::fail(
                "cors_origin",
                Severity::Error,
                format!(
                    "server.cors_origin is not a valid header value: {:?}",
                    config.server.cors_origin
                ),
            ),
        },
    );

    // 5. timeouts
    report.push(match config.timeout_limits() {
        Ok(limits) => CheckResult::pass(
            "timeouts",
            Severity::Error,
            format!(
                "timeout: default {}ms, max {}ms",
                limits.default.as_millis(),
                limits.max.as_millis()
            ),
        ),
        Err(e) => CheckResult::fail("timeouts", Severity::Error, format!("{e:#}")),
    });

    check_sandbox(&mut report, &config);
    check_policy(&mut report, &config);

    // 8. rules_backend
    let base_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    report.push(match build_rule_store(&config.rules, base_dir, &lookup) {
        Ok(_) if config.rules.backend == RulesBackend::None => CheckResult::fail(
            "rules_backend",
            Severity::Warning,
            "no rules backend configured; challenge requests will report validation setup failures",
        ),
        Ok(_) => CheckResult::pass(
            "rules_backend",
            Severity::Error,
            format!("rules backend: {:?}", config.rules.backend).to_lowercase(),
        ),
        Err(e) => CheckResult::fail("rules_backend", Severity::Error, format!("{e:#}")),
    });

    (report, Some(config))
}

fn check_sandbox(report: &mut CheckReport, config: &Config) {
    // 6. sandbox_limits
    match config.sandbox_limits() {
        Ok(limits) => {
            report.push(CheckResult::pass(
                "sandbox_limits",
                Severity::Error,
                format!(
                    "sandbox: image {}, memory {} bytes, pids {}, cpu {}%",
                    limits.image, limits.memory_limit, limits.pids_limit, limits.cpu_percent
                ),
            ));
            if limits.pids_limit > 256 {
                report.push(CheckResult::fail(
                    "sandbox_limits",
                    Severity::Warning,
                    format!(
                        "sandbox.pids_limit = {} gives little protection against fork bombs",
                        limits.pids_limit
                    ),
                ));
            }
        }
        Err(e) => {
            report.push(CheckResult::fail("sandbox_limits", Severity::Error, format!("{e:#}")));
        }
    }

    if config.sandbox.max_output_bytes == 0 {
        report.push(CheckResult::fail(
            "sandbox_limits",
            Severity::Error,
            "sandbox.max_output_bytes must be positive",
        ));
    }
}

fn check_policy(report: &mut CheckReport, config: &Config) {
    // 7. policy
    match config.script_policy() {
        Ok(policy) if policy.is_enabled() => report.push(CheckResult::pass(
            "policy",
            Severity::Error,
            "script policy: allowlist filtering enabled",
        )),
        Ok(_) => report.push(CheckResult::fail(
            "policy",
            Severity::Info,
            "script policy disabled; the sandbox profile is the only boundary",
        )),
        Err(e) => report.push(CheckResult::fail("policy", Severity::Error, format!("{e:#}"))),
    }
}

/// 9. docker: the daemon answers a ping.
pub(crate) async fn check_runtime(report: &mut CheckReport, config: &Config) {
    let runtime = match DockerRuntime::connect(config.sandbox.docker_socket.as_deref()) {
        Ok(runtime) => runtime,
        Err(e) => {
            report.push(CheckResult::fail("docker", Severity::Error, format!("{e:#}")));
            return;
        }
    };

    report.push(match runtime.ping().await {
        Ok(daemon) => CheckResult::pass(
            "docker",
            Severity::Error,
            format!("docker: {daemon} at {}", runtime.endpoint()),
        ),
        Err(e) => CheckResult::fail(
            "docker",
            Severity::Error,
            format!("docker unreachable at {}: {e:#}", runtime.endpoint()),
        ),
    });
}
