//! Pre-execution script filtering.
//!
//! The allowlist decides. A script is accepted only when the whole trimmed
//! text matches one of the anchored command shapes. The denylist never
//! accepts or rejects anything by itself: it is consulted after the
//! allowlist has already refused a script, to name the offending command in
//! the rejection reason.
//!
//! This filter is NOT the security boundary. Allowlist shapes such as
//! `echo <anything>` can be abused to chain commands, and operators may
//! loosen the tables. Containment comes from the sandbox profile
//! (see [`crate::profile`]), which must hold even when this filter lets a
//! hostile script through.

use anyhow::{Context, Result};
use regex::Regex;
use tracing::debug;

/// Command shapes accepted by default.
pub const DEFAULT_ALLOW: &[&str] = &[
    r"ls(\s+-[a-zA-Z]+)*",
    r"echo(\s+.+)?",
    r"cat(\s+.+)?",
    r"pwd",
    r"whoami",
];

/// Command names reported by name when they appear in a refused script.
/// Checked in order as plain substrings, so a name that contains another
/// (`killall` and `kill`) must come first.
pub const DEFAULT_DENY: &[&str] = &[
    "rmdir", "rm", "shutdown", "reboot", "halt", "poweroff", "killall", "pkill", "kill", "chmod",
    "chown", "chgrp", "wget", "curl", "nc", "dd", "mkfs", "mount",
];

const GENERIC_REJECTION: &str = "The submitted script contains commands or syntax that are not \
     permitted. Please use only allowed commands like 'ls', 'echo', 'cat'.";

/// Verdict for one script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub reason: String,
}

impl PolicyDecision {
    fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
        }
    }

    fn reject(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }
}

/// Static allow/deny tables, built once at startup and shared read-only.
#[derive(Debug, Clone)]
pub struct ScriptPolicy {
    enabled: bool,
    allow: Vec<Regex>,
    deny: Vec<String>,
}

impl ScriptPolicy {
    /// Build a policy from allowlist patterns and denylist command names.
    /// Patterns are anchored here; callers write them unanchored.
    pub fn new<A, D>(allow: A, deny: D) -> Result<Self>
    where
        A: IntoIterator,
        A::Item: AsRef<str>,
        D: IntoIterator,
        D::Item: AsRef<str>,
    {
        let allow = allow
            .into_iter()
            .map(|pattern| {
                let pattern = pattern.as_ref();
                Regex::new(&format!("^(?:{pattern})$"))
                    .with_context(|| format!("invalid allowlist pattern: {pattern}"))
            })
            .collect::<Result<Vec<_>>>()?;

        let deny = deny
            .into_iter()
            .map(|token| {
                let name = token.as_ref().trim().to_owned();
                anyhow::ensure!(!name.is_empty(), "empty denylist entry");
                Ok(name)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            enabled: true,
            allow,
            deny,
        })
    }

    /// A policy that accepts everything, leaving containment entirely to
    /// the sandbox profile.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            allow: Vec::new(),
            deny: Vec::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Classify `script`. Pure; never fails.
    pub fn evaluate(&self, script: &str) -> PolicyDecision {
        let trimmed = script.trim();

        if !self.enabled {
            return PolicyDecision::allow("pre-execution filtering disabled");
        }

        if trimmed.is_empty() {
            return PolicyDecision::allow("empty script");
        }

        if self.allow.iter().any(|pattern| pattern.is_match(trimmed)) {
            debug!(script_len = trimmed.len(), "script matched allowlist");
            return PolicyDecision::allow("script matches an allowed command shape");
        }

        if let Some(token) = self.deny.iter().find(|token| trimmed.contains(token.as_str())) {
            debug!(token = %token, "script rejected by denylist");
            return PolicyDecision::reject(format!(
                "Execution of command '{token}' is not permitted."
            ));
        }

        debug!(script_len = trimmed.len(), "script matched no allowlist pattern");
        PolicyDecision::reject(GENERIC_REJECTION)
    }
}

impl Default for ScriptPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_ALLOW, DEFAULT_DENY).expect("built-in policy tables compile")
    }
}
