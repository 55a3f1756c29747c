use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounds applied to the caller-supplied execution timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutLimits {
    pub default: Duration,
    pub max: Duration,
}

impl Default for TimeoutLimits {
    fn default() -> Self {
        Self {
            default: Duration::from_millis(10_000),
            max: Duration::from_millis(30_000),
        }
    }
}

impl TimeoutLimits {
    /// Resolve a requested timeout: missing means default, anything above
    /// `max` is clamped down. Never returns zero.
    pub fn clamp(&self, requested_ms: Option<u64>) -> Duration {
        let requested = requested_ms.map_or(self.default, Duration::from_millis);
        requested.min(self.max).max(Duration::from_millis(1))
    }
}

/// One accepted call to the execution endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    script: String,
    timeout: Duration,
    challenge_id: Option<String>,
}

impl ExecutionRequest {
    pub fn new(
        script: impl Into<String>,
        timeout_ms: Option<u64>,
        challenge_id: Option<String>,
        limits: &TimeoutLimits,
    ) -> Self {
        Self {
            script: script.into(),
            timeout: limits.clamp(timeout_ms),
            challenge_id,
        }
    }

    pub fn script(&self) -> &str {
        &self.script
    }

    /// The clamped wall-clock budget for the script.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn challenge_id(&self) -> Option<&str> {
        self.challenge_id.as_deref()
    }
}

/// Everything the capture coordinator saw from one container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` until the container reports an exit status, and stays `None`
    /// when the deadline fired first.
    pub exit_code: Option<i64>,
    pub timed_out: bool,
    /// Set when either stream exceeded the capture cap.
    pub truncated: bool,
}

impl CapturedOutput {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// Error text reported to the caller, or `None` for a clean run.
    ///
    /// A zero exit is clean even when the script wrote to stderr, so `error`
    /// and `success` never disagree.
    pub fn error_text(&self, deadline: Duration) -> Option<String> {
        let stderr = self.stderr.trim_end();
        if self.timed_out {
            let mut message = format!("execution timed out after {}ms", deadline.as_millis());
            if !stderr.is_empty() {
                message.push('\n');
                message.push_str(stderr);
            }
            return Some(message);
        }
        if self.exit_code == Some(0) {
            return None;
        }
        if !stderr.is_empty() {
            return Some(stderr.to_owned());
        }
        Some(match self.exit_code {
            Some(code) => format!("process exited with code {code}"),
            None => "process exit status unknown".to_owned(),
        })
    }
}

/// The check a [`ValidationRule`] performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    ScriptContains,
    ScriptMatches,
    OutputContains,
    OutputMatches,
    OutputEquals,
    NoError,
}

impl RuleKind {
    /// Parse a rule tag. Both the hyphenated tags and the underscore names
    /// used by the challenge database are accepted.
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "script-contains-substring" | "script_includes" => Some(Self::ScriptContains),
            "script-matches-pattern" | "script_includes_regex" => Some(Self::ScriptMatches),
            "output-contains-substring" | "output_includes" => Some(Self::OutputContains),
            "output-matches-pattern" | "output_includes_regex" => Some(Self::OutputMatches),
            "output-equals-exact" | "output_exact_match" => Some(Self::OutputEquals),
            "no-error-occurred" | "no_errors" => Some(Self::NoError),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ScriptContains => "script-contains-substring",
            Self::ScriptMatches => "script-matches-pattern",
            Self::OutputContains => "output-contains-substring",
            Self::OutputMatches => "output-matches-pattern",
            Self::OutputEquals => "output-equals-exact",
            Self::NoError => "no-error-occurred",
        }
    }
}

/// A declarative check attached to a challenge.
///
/// `kind` is kept as the raw tag so an unrecognized kind survives
/// deserialization and can be reported as a failed outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationRule {
    #[serde(rename = "type", alias = "kind")]
    pub kind: String,
    #[serde(default, alias = "expected")]
    pub pattern: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl ValidationRule {
    pub fn new(kind: RuleKind, pattern: impl Into<String>) -> Self {
        Self {
            kind: kind.as_str().to_owned(),
            pattern: Some(pattern.into()),
            description: None,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Result of one validation rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub test_case: String,
    pub passed: bool,
    pub expected: String,
    pub actual: String,
}

/// Final result of a handled execution, serialized to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    output: String,
    error: Option<String>,
    success: bool,
    #[serde(rename = "execution_time")]
    elapsed_ms: u64,
    #[serde(rename = "execution_id")]
    correlation_id: String,
    exit_code: i64,
    test_results: Vec<TestOutcome>,
}

impl ExecutionResult {
    pub fn new(
        correlation_id: impl Into<String>,
        captured: CapturedOutput,
        error: Option<String>,
        elapsed: Duration,
        test_results: Vec<TestOutcome>,
    ) -> Self {
        let success = captured.succeeded();
        Self {
            output: captured.stdout,
            error,
            success,
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            correlation_id: correlation_id.into(),
            exit_code: captured.exit_code.unwrap_or(-1),
            test_results,
        }
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed_ms
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn exit_code(&self) -> i64 {
        self.exit_code
    }

    pub fn test_results(&self) -> &[TestOutcome] {
        &self.test_results
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_defaults_when_missing() {
        let limits = TimeoutLimits::default();
        assert_eq!(limits.clamp(None), Duration::from_secs(10));
    }

    #[test]
    fn timeout_clamped_to_max() {
        let limits = TimeoutLimits::default();
        assert_eq!(limits.clamp(Some(600_000)), Duration::from_secs(30));
        assert_eq!(limits.clamp(Some(250)), Duration::from_millis(250));
    }

    #[test]
    fn timeout_never_zero() {
        let limits = TimeoutLimits::default();
        assert_eq!(limits.clamp(Some(0)), Duration::from_millis(1));
    }

    #[test]
    fn rule_kind_accepts_both_spellings() {
        assert_eq!(
            RuleKind::parse("script_includes"),
            Some(RuleKind::ScriptContains)
        );
        assert_eq!(
            RuleKind::parse("output-equals-exact"),
            Some(RuleKind::OutputEquals)
        );
        assert_eq!(RuleKind::parse("no_errors"), Some(RuleKind::NoError));
        assert_eq!(RuleKind::parse("bogus"), None);
    }

    #[test]
    fn rule_deserializes_database_shape() {
        let rule: ValidationRule = serde_json::from_str(
            r#"{"type": "output_includes", "pattern": "hello", "description": "says hello"}"#,
        )
        .unwrap();
        assert_eq!(rule.kind, "output_includes");
        assert_eq!(rule.pattern.as_deref(), Some("hello"));
        assert_eq!(rule.description.as_deref(), Some("says hello"));
    }

    #[test]
    fn rule_deserializes_kind_and_expected_aliases() {
        let rule: ValidationRule =
            serde_json::from_str(r#"{"kind": "output-equals-exact", "expected": "/tmp"}"#).unwrap();
        assert_eq!(RuleKind::parse(&rule.kind), Some(RuleKind::OutputEquals));
        assert_eq!(rule.pattern.as_deref(), Some("/tmp"));
        assert!(rule.description.is_none());
    }

    #[test]
    fn error_text_for_clean_exit_is_none() {
        let captured = CapturedOutput {
            stdout: "hi\n".into(),
            exit_code: Some(0),
            ..CapturedOutput::default()
        };
        assert!(captured.succeeded());
        assert_eq!(captured.error_text(Duration::from_secs(1)), None);
    }

    #[test]
    fn error_text_prefers_timeout_and_keeps_stderr() {
        let captured = CapturedOutput {
            stderr: "partial\n".into(),
            timed_out: true,
            ..CapturedOutput::default()
        };
        let text = captured.error_text(Duration::from_millis(500)).unwrap();
        assert!(text.starts_with("execution timed out after 500ms"));
        assert!(text.ends_with("partial"));
    }

    #[test]
    fn stderr_is_an_error_only_on_failure() {
        let mut captured = CapturedOutput {
            stderr: "warning: deprecated flag\n".into(),
            exit_code: Some(0),
            ..CapturedOutput::default()
        };
        assert!(captured.succeeded());
        assert_eq!(captured.error_text(Duration::from_secs(1)), None);

        captured.exit_code = Some(1);
        assert_eq!(
            captured.error_text(Duration::from_secs(1)).as_deref(),
            Some("warning: deprecated flag")
        );
    }

    #[test]
    fn error_text_reports_exit_code() {
        let captured = CapturedOutput {
            exit_code: Some(2),
            ..CapturedOutput::default()
        };
        assert_eq!(
            captured.error_text(Duration::from_secs(1)).as_deref(),
            Some("process exited with code 2")
        );
    }

    #[test]
    fn result_serializes_wire_names() {
        let captured = CapturedOutput {
            stdout: "out".into(),
            exit_code: None,
            timed_out: true,
            ..CapturedOutput::default()
        };
        let result = ExecutionResult::new(
            "abc",
            captured,
            Some("execution timed out after 10ms".into()),
            Duration::from_millis(12),
            Vec::new(),
        );
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["output"], "out");
        assert_eq!(json["success"], false);
        assert_eq!(json["execution_time"], 12);
        assert_eq!(json["execution_id"], "abc");
        assert_eq!(json["exit_code"], -1);
        assert_eq!(json["test_results"], serde_json::json!([]));
    }
}
