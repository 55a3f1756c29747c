//! Integration tests against a real Docker daemon.
//! Gated behind `SHELLBOX_DOCKER_TEST=1` because they need a reachable
//! daemon and pull `alpine:latest` on first run.
#![allow(clippy::unwrap_used)]

use shellbox_core::{ExecutionRequest, TimeoutLimits};
use shellbox_sandbox::{DockerRuntime, LifecycleManager, ProfileBuilder, probe};
use std::sync::Arc;
use std::time::Duration;

fn should_run() -> bool {
    std::env::var("SHELLBOX_DOCKER_TEST").is_ok_and(|v| v == "1")
}

async fn run(script: &str, timeout_ms: u64) -> shellbox_sandbox::ContainerRunResult {
    let runtime = DockerRuntime::connect(None).expect("docker client");
    probe(&runtime, "alpine:latest", true)
        .await
        .expect("probe should succeed");

    let request = ExecutionRequest::new(script, Some(timeout_ms), None, &TimeoutLimits::default());
    let profile = ProfileBuilder::default().build(&request);
    let manager = LifecycleManager::new(Arc::new(runtime));
    manager
        .execute(&profile, request.script(), "docker-test", request.timeout())
        .await
        .expect("execution should succeed")
}

#[tokio::test]
async fn basic_exec() {
    if !should_run() {
        return;
    }
    let result = run("echo hello", 10_000).await;
    assert_eq!(result.output.exit_code, Some(0));
    assert_eq!(result.output.stdout.trim(), "hello");
}

#[tokio::test]
async fn stderr_is_separated() {
    if !should_run() {
        return;
    }
    let result = run("echo out; echo err >&2", 10_000).await;
    assert_eq!(result.output.stdout.trim(), "out");
    assert_eq!(result.output.stderr.trim(), "err");
}

#[tokio::test]
async fn runs_as_non_root() {
    if !should_run() {
        return;
    }
    let result = run("id -u", 10_000).await;
    assert_eq!(result.output.stdout.trim(), "1000");
}

#[tokio::test]
async fn network_isolation() {
    if !should_run() {
        return;
    }
    let result = run("wget -q -T 2 -O- http://example.com; echo exit=$?", 10_000).await;
    assert!(
        !result.output.stdout.contains("exit=0"),
        "expected network failure, got: {:?}",
        result.output
    );
}

#[tokio::test]
async fn root_filesystem_is_read_only() {
    if !should_run() {
        return;
    }
    let result = run("touch /etc/pwned", 10_000).await;
    assert_ne!(result.output.exit_code, Some(0));
}

#[tokio::test]
async fn tmp_is_writable_but_noexec() {
    if !should_run() {
        return;
    }
    let result = run(
        "echo data > /tmp/f && cat /tmp/f && printf '#!/bin/sh\\necho ran' > /tmp/x && chmod +x /tmp/x; /tmp/x",
        10_000,
    )
    .await;
    assert!(result.output.stdout.contains("data"));
    assert!(!result.output.stdout.contains("ran"));
}

#[tokio::test]
async fn timeout_kills_container() {
    if !should_run() {
        return;
    }
    let result = run("echo before; sleep 60", 1_500).await;
    assert!(result.output.timed_out);
    assert!(result.output.stdout.contains("before"));
    assert!(result.elapsed < Duration::from_secs(10));
}

#[tokio::test]
async fn exit_code_propagated() {
    if !should_run() {
        return;
    }
    let result = run("exit 42", 10_000).await;
    assert_eq!(result.output.exit_code, Some(42));
}

#[tokio::test]
async fn empty_script_is_a_no_op() {
    if !should_run() {
        return;
    }
    let result = run("", 10_000).await;
    assert_eq!(result.output.exit_code, Some(0));
    assert!(result.output.stdout.is_empty());
}
