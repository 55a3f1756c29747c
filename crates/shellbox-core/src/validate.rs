//! Result validation: score a script and its output against challenge rules.
//!
//! Every rule produces exactly one outcome, in input order. A rule that
//! cannot be evaluated (bad regex, missing pattern, unknown kind) fails on
//! its own and never stops the rest of the batch.

use crate::traits::RuleStore;
use crate::types::{RuleKind, TestOutcome, ValidationRule};
use anyhow::Result;
use regex::RegexBuilder;
use tracing::{debug, warn};

const REGEX_SIZE_LIMIT: usize = 1 << 20;

/// Evaluate `rules` against one execution.
///
/// With no rules, a single outcome reports whether the script ran without
/// error.
pub fn validate(
    rules: &[ValidationRule],
    script: &str,
    output: &str,
    exec_error: Option<&str>,
) -> Vec<TestOutcome> {
    let exec_error = exec_error.filter(|e| !e.is_empty());

    if rules.is_empty() {
        return vec![TestOutcome {
            test_case: "Script executed successfully".to_owned(),
            passed: exec_error.is_none(),
            expected: "No errors during execution".to_owned(),
            actual: exec_error.map_or_else(
                || "Executed successfully".to_owned(),
                |e| format!("Error: {e}"),
            ),
        }];
    }

    rules
        .iter()
        .enumerate()
        .map(|(index, rule)| evaluate_rule(index, rule, script, output, exec_error))
        .collect()
}

/// Look up the rules for `challenge_id` and evaluate them.
///
/// A store failure or unknown challenge is reported as one failed outcome;
/// the caller still gets the raw execution output.
pub async fn validate_challenge(
    store: &dyn RuleStore,
    challenge_id: &str,
    script: &str,
    output: &str,
    exec_error: Option<&str>,
) -> Vec<TestOutcome> {
    let rules = match store.rules_for(challenge_id).await {
        Ok(Some(rules)) => rules,
        Ok(None) => {
            warn!(challenge_id, "challenge not found in rule store");
            return vec![setup_failure(&format!("challenge '{challenge_id}' not found"))];
        }
        Err(error) => {
            warn!(challenge_id, error = %error, "rule store lookup failed");
            return vec![setup_failure(&error.to_string())];
        }
    };

    debug!(challenge_id, rules = rules.len(), "evaluating validation rules");
    validate(&rules, script, output, exec_error)
}

fn setup_failure(detail: &str) -> TestOutcome {
    TestOutcome {
        test_case: "Internal Validation Error".to_owned(),
        passed: false,
        expected: "Validation should complete successfully".to_owned(),
        actual: format!("validation setup failed: {detail}"),
    }
}

struct Check {
    passed: bool,
    actual: String,
    expected: Option<String>,
}

impl Check {
    fn new(passed: bool, actual: String) -> Self {
        Self {
            passed,
            actual,
            expected: None,
        }
    }
}

fn evaluate_rule(
    index: usize,
    rule: &ValidationRule,
    script: &str,
    output: &str,
    exec_error: Option<&str>,
) -> TestOutcome {
    let label = rule
        .description
        .clone()
        .unwrap_or_else(|| format!("Validation Rule {}", index + 1));
    let default_expected = rule
        .description
        .clone()
        .unwrap_or_else(|| format!("Rule {} passed", index + 1));

    let check = match RuleKind::parse(&rule.kind) {
        Some(kind) => apply(kind, rule, script, output, exec_error).unwrap_or_else(|error| {
            warn!(rule = index, kind = %rule.kind, error = %error, "validation rule failed to evaluate");
            Check::new(false, format!("Internal validation error: {error}"))
        }),
        None => {
            warn!(rule = index, kind = %rule.kind, "unknown validation rule type");
            Check::new(
                false,
                format!("Internal validation error: Unknown rule type '{}'", rule.kind),
            )
        }
    };

    TestOutcome {
        test_case: label,
        passed: check.passed,
        expected: check.expected.unwrap_or(default_expected),
        actual: check.actual,
    }
}

fn apply(
    kind: RuleKind,
    rule: &ValidationRule,
    script: &str,
    output: &str,
    exec_error: Option<&str>,
) -> Result<Check> {
    let pattern = || {
        rule.pattern
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("rule is missing a pattern"))
    };

    let check = match kind {
        RuleKind::ScriptContains => contains("Script", "script", script, pattern()?),
        RuleKind::OutputContains => contains("Output", "output", output, pattern()?),
        RuleKind::ScriptMatches => matches("Script", script, pattern()?),
        RuleKind::OutputMatches => matches("Output", output, pattern()?),
        RuleKind::OutputEquals => {
            let expected = pattern()?;
            let passed = output.trim() == expected.trim();
            Check {
                passed,
                actual: if passed {
                    "Output matches expected value".to_owned()
                } else {
                    "Output does not match expected value".to_owned()
                },
                expected: Some(format!("Expected output: {expected}")),
            }
        }
        RuleKind::NoError => match exec_error {
            None => Check::new(true, "No errors occurred".to_owned()),
            Some(error) => Check::new(false, format!("Error occurred: {error}")),
        },
    };
    Ok(check)
}

fn contains(subject: &str, noun: &str, haystack: &str, needle: &str) -> Check {
    if haystack.contains(needle) {
        Check::new(true, format!("Found '{needle}' in {noun}"))
    } else {
        Check::new(false, format!("{subject} does not contain '{needle}'"))
    }
}

fn matches(subject: &str, haystack: &str, pattern: &str) -> Check {
    let regex = match RegexBuilder::new(pattern)
        .size_limit(REGEX_SIZE_LIMIT)
        .build()
    {
        Ok(regex) => regex,
        Err(error) => {
            warn!(pattern, error = %error, "invalid regex in validation rule");
            return Check::new(
                false,
                "Internal validation error: Invalid regex pattern".to_owned(),
            );
        }
    };

    if regex.is_match(haystack) {
        Check::new(true, format!("{subject} matches pattern '{pattern}'"))
    } else {
        Check::new(false, format!("{subject} does not match pattern '{pattern}'"))
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeRuleStore;

    fn rule(kind: &str, pattern: &str) -> ValidationRule {
        ValidationRule {
            kind: kind.to_owned(),
            pattern: Some(pattern.to_owned()),
            description: None,
        }
    }

    #[test]
    fn empty_rules_report_execution_success() {
        let outcomes = validate(&[], "ls", "a\nb\n", None);
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].passed);
        assert_eq!(outcomes[0].test_case, "Script executed successfully");
        assert_eq!(outcomes[0].actual, "Executed successfully");
    }

    #[test]
    fn empty_rules_report_execution_error() {
        let outcomes = validate(&[], "ls", "", Some("boom"));
        assert!(!outcomes[0].passed);
        assert_eq!(outcomes[0].actual, "Error: boom");
    }

    #[test]
    fn empty_error_string_counts_as_no_error() {
        let outcomes = validate(&[], "ls", "", Some(""));
        assert!(outcomes[0].passed);
    }

    #[test]
    fn script_substring_is_case_sensitive() {
        let rules = [rule("script_includes", "-l")];
        assert!(validate(&rules, "ls -la", "", None)[0].passed);
        assert!(!validate(&rules, "ls -LA", "", None)[0].passed);
    }

    #[test]
    fn output_substring() {
        let rules = [rule("output-contains-substring", "hello")];
        let outcome = &validate(&rules, "echo hello", "hello\n", None)[0];
        assert!(outcome.passed);
        assert_eq!(outcome.actual, "Found 'hello' in output");
        assert_eq!(outcome.test_case, "Validation Rule 1");
        assert_eq!(outcome.expected, "Rule 1 passed");
    }

    #[test]
    fn output_pattern_is_unanchored() {
        let rules = [rule("output_includes_regex", r"\d+ files?")];
        assert!(validate(&rules, "", "found 3 files here", None)[0].passed);
        assert!(!validate(&rules, "", "none", None)[0].passed);
    }

    #[test]
    fn exact_match_trims_both_sides() {
        let rules = [rule("output_exact_match", "  /tmp \n")];
        let outcome = &validate(&rules, "pwd", "/tmp\n", None)[0];
        assert!(outcome.passed);
        assert_eq!(outcome.expected, "Expected output:   /tmp \n");
    }

    #[test]
    fn no_error_rule() {
        let rules = [rule("no_errors", "")];
        assert!(validate(&rules, "", "", None)[0].passed);
        let failed = &validate(&rules, "", "", Some("bad"))[0];
        assert!(!failed.passed);
        assert_eq!(failed.actual, "Error occurred: bad");
    }

    #[test]
    fn unknown_kind_names_the_kind() {
        let rules = [rule("telepathy", "x")];
        let outcome = &validate(&rules, "", "", None)[0];
        assert!(!outcome.passed);
        assert!(outcome.actual.contains("Unknown rule type 'telepathy'"));
    }

    #[test]
    fn missing_pattern_fails_only_that_rule() {
        let rules = [
            ValidationRule {
                kind: "output_includes".into(),
                pattern: None,
                description: Some("needs a pattern".into()),
            },
            rule("no_errors", ""),
        ];
        let outcomes = validate(&rules, "", "", None);
        assert!(!outcomes[0].passed);
        assert!(outcomes[0].actual.contains("missing a pattern"));
        assert_eq!(outcomes[0].test_case, "needs a pattern");
        assert!(outcomes[1].passed);
    }

    #[test]
    fn invalid_pattern_does_not_abort_batch_and_keeps_order() {
        let rules = [
            rule("script_includes", "echo").with_description("first"),
            rule("script_includes_regex", "([unclosed").with_description("second"),
            rule("output_includes", "hi").with_description("third"),
            rule("output_includes", "absent").with_description("fourth"),
        ];
        let outcomes = validate(&rules, "echo hi", "hi\n", None);

        let names: Vec<_> = outcomes.iter().map(|o| o.test_case.as_str()).collect();
        assert_eq!(names, ["first", "second", "third", "fourth"]);
        assert!(outcomes[0].passed);
        assert!(!outcomes[1].passed);
        assert_eq!(
            outcomes[1].actual,
            "Internal validation error: Invalid regex pattern"
        );
        assert!(outcomes[2].passed);
        assert!(!outcomes[3].passed);
    }

    #[tokio::test]
    async fn store_failure_becomes_single_outcome() {
        let store = FakeRuleStore::failing("connection refused");
        let outcomes = validate_challenge(&store, "c1", "ls", "", None).await;
        assert_eq!(outcomes.len(), 1);
        assert!(!outcomes[0].passed);
        assert!(outcomes[0].actual.starts_with("validation setup failed"));
        assert!(outcomes[0].actual.contains("connection refused"));
    }

    #[tokio::test]
    async fn unknown_challenge_becomes_single_outcome() {
        let store = FakeRuleStore::new();
        let outcomes = validate_challenge(&store, "missing", "ls", "", None).await;
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].actual.contains("challenge 'missing' not found"));
    }

    #[tokio::test]
    async fn store_rules_are_evaluated() {
        let store = FakeRuleStore::new().with_rules("c1", vec![rule("script_includes", "-l")]);
        let outcomes = validate_challenge(&store, "c1", "ls -la", "", None).await;
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].passed);
        assert_eq!(store.lookups(), vec!["c1".to_owned()]);
    }
}
