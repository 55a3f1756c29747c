#![allow(clippy::unwrap_used)]

use shellbox_sandbox::script_policy::{DEFAULT_DENY, ScriptPolicy};
use shellbox_sandbox::{ProfileBuilder, SandboxLimits, parse_size};

#[test]
fn allowlisted_scripts_are_always_allowed() {
    let policy = ScriptPolicy::default();
    let scripts = [
        "ls", "ls -l", "ls -la -h", "echo", "echo 1 2 3", "echo 'quoted'", "cat a.txt",
        "cat a b c", "pwd", "whoami",
    ];
    for script in scripts {
        assert!(policy.evaluate(script).allowed, "{script}");
    }
}

#[test]
fn denylisted_tokens_outside_allowlist_are_named() {
    let policy = ScriptPolicy::default();
    for token in DEFAULT_DENY {
        let script = format!("{token} --some-flag target");
        let decision = policy.evaluate(&script);
        assert!(!decision.allowed, "{script}");
        assert_eq!(
            decision.reason,
            format!("Execution of command '{token}' is not permitted."),
            "{script}"
        );
    }
}

#[test]
fn allowlist_wins_over_denylist_tokens_in_arguments() {
    // "echo rm" is an allowed shape; the denylist never overrides a match.
    let policy = ScriptPolicy::default();
    assert!(policy.evaluate("echo rm -rf /").allowed);
    assert!(policy.evaluate("cat curl.txt").allowed);
}

#[test]
fn first_denylist_entry_in_table_order_is_reported() {
    let policy = ScriptPolicy::default();
    let decision = policy.evaluate("curl http://x | rm -rf /");
    assert_eq!(decision.reason, "Execution of command 'rm' is not permitted.");
}

#[test]
fn default_limits_are_conservative() {
    let limits = SandboxLimits::default();
    assert_eq!(limits.memory_limit, parse_size("128m").unwrap());
    assert_eq!(limits.file_size_limit, parse_size("1m").unwrap());
    assert_eq!(limits.pids_limit, 10);
    assert!(limits.cpu_percent <= 100);
    assert_ne!(limits.uid, 0);
    assert_eq!(ProfileBuilder::default().limits(), &limits);
}
