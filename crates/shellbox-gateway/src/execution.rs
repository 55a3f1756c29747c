//! The execution pipeline behind `POST /api/execute`.
//!
//! parse → policy → profile → container (acquire/run/release) → validate.
//! Everything after the policy check runs in a tracked task of its own, so a
//! caller that goes away mid-request cannot cancel container cleanup.

use serde_json::Value;
use shellbox_core::validate::validate_challenge;
use shellbox_core::{
    ExecError, ExecutionRequest, ExecutionResult, IdGenerator, RuleStore, TimeoutLimits,
    UuidGenerator,
};
use shellbox_sandbox::{LifecycleManager, ProfileBuilder, ScriptPolicy};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::task::TaskTracker;
use tracing::{Instrument, Span, debug, info, info_span, warn};

const INVALID_SCRIPT: &str = "Invalid script provided";

/// A request that ended without a normal result.
#[derive(Debug)]
pub(crate) struct ExecutionFailure {
    pub correlation_id: String,
    pub error: ExecError,
    /// Zero when the request failed before any container was requested.
    pub elapsed: Duration,
}

impl ExecutionFailure {
    fn before_sandbox(correlation_id: &str, error: ExecError) -> Self {
        Self {
            correlation_id: correlation_id.to_owned(),
            error,
            elapsed: Duration::ZERO,
        }
    }
}

pub(crate) struct ExecutionService {
    policy: Arc<ScriptPolicy>,
    profiles: ProfileBuilder,
    lifecycle: LifecycleManager,
    rules: Arc<dyn RuleStore>,
    ids: Arc<dyn IdGenerator>,
    limits: TimeoutLimits,
    tasks: TaskTracker,
}

impl std::fmt::Debug for ExecutionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionService")
            .field("policy_enabled", &self.policy.is_enabled())
            .field("lifecycle", &self.lifecycle)
            .field("limits", &self.limits)
            .field("in_flight", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

impl ExecutionService {
    pub(crate) fn new(
        policy: ScriptPolicy,
        profiles: ProfileBuilder,
        lifecycle: LifecycleManager,
        rules: Arc<dyn RuleStore>,
        limits: TimeoutLimits,
    ) -> Self {
        Self {
            policy: Arc::new(policy),
            profiles,
            lifecycle,
            rules,
            ids: Arc::new(UuidGenerator),
            limits,
            tasks: TaskTracker::new(),
        }
    }

    #[must_use]
    #[cfg_attr(not(test), allow(dead_code))]
    pub(crate) fn with_ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub(crate) fn limits(&self) -> &TimeoutLimits {
        &self.limits
    }

    /// Handle one raw request body.
    pub(crate) async fn execute(&self, body: &[u8]) -> Result<ExecutionResult, ExecutionFailure> {
        let correlation_id = self.ids.next_id();
        let span = info_span!("execute", execution_id = %correlation_id);

        async {
            let request = parse_request(body, &self.limits).map_err(|error| {
                info!(error = %error, "request rejected");
                ExecutionFailure::before_sandbox(&correlation_id, error)
            })?;
            self.run(&correlation_id, request).await
        }
        .instrument(span)
        .await
    }

    /// Handle an already-parsed request.
    pub(crate) async fn execute_request(
        &self,
        request: ExecutionRequest,
    ) -> Result<ExecutionResult, ExecutionFailure> {
        let correlation_id = self.ids.next_id();
        let span = info_span!("execute", execution_id = %correlation_id);
        self.run(&correlation_id, request).instrument(span).await
    }

    /// Stop accepting work and wait for in-flight containers to be released.
    pub(crate) async fn shutdown(&self) {
        self.tasks.close();
        if !self.tasks.is_empty() {
            info!(in_flight = self.tasks.len(), "waiting for running executions");
        }
        self.tasks.wait().await;
    }

    async fn run(
        &self,
        correlation_id: &str,
        request: ExecutionRequest,
    ) -> Result<ExecutionResult, ExecutionFailure> {
        info!(
            script_len = request.script().len(),
            timeout_ms = u64::try_from(request.timeout().as_millis()).unwrap_or(u64::MAX),
            challenge_id = request.challenge_id().unwrap_or("-"),
            "execution requested"
        );

        let decision = self.policy.evaluate(request.script());
        if !decision.allowed {
            info!(reason = %decision.reason, "script rejected by policy");
            return Err(ExecutionFailure::before_sandbox(
                correlation_id,
                ExecError::PolicyRejection {
                    reason: decision.reason,
                },
            ));
        }
        debug!(reason = %decision.reason, "script accepted by policy");

        let profile = self.profiles.build(&request);
        let lifecycle = self.lifecycle.clone();
        let rules = Arc::clone(&self.rules);
        let id = correlation_id.to_owned();

        let task = self.tasks.spawn(
            async move {
                let deadline = request.timeout();
                let started = Instant::now();
                let run = lifecycle
                    .execute(&profile, request.script(), &id, deadline)
                    .await
                    .map_err(|error| (error, started.elapsed()))?;

                let error = run.output.error_text(deadline);
                let test_results = match request.challenge_id() {
                    Some(challenge_id) => {
                        validate_challenge(
                            rules.as_ref(),
                            challenge_id,
                            request.script(),
                            &run.output.stdout,
                            error.as_deref(),
                        )
                        .await
                    }
                    None => Vec::new(),
                };

                let result = ExecutionResult::new(id, run.output, error, run.elapsed, test_results);
                Ok::<_, (ExecError, Duration)>(result)
            }
            .instrument(Span::current()),
        );

        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(join_error) => Err((
                ExecError::Internal(format!("execution task failed: {join_error}")),
                Duration::ZERO,
            )),
        };

        match outcome {
            Ok(result) => {
                info!(
                    success = result.success(),
                    exit_code = result.exit_code(),
                    elapsed_ms = result.elapsed_ms(),
                    tests = result.test_results().len(),
                    "execution finished"
                );
                Ok(result)
            }
            Err((error, elapsed)) => {
                warn!(error = %error, "execution failed");
                Err(ExecutionFailure {
                    correlation_id: correlation_id.to_owned(),
                    error,
                    elapsed,
                })
            }
        }
    }
}

/// Parse and check a request body. Only structure is checked here; the
/// policy decides about the script itself.
pub(crate) fn parse_request(
    body: &[u8],
    limits: &TimeoutLimits,
) -> Result<ExecutionRequest, ExecError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|error| ExecError::Input(format!("Invalid JSON body: {error}")))?;
    let Value::Object(fields) = value else {
        return Err(ExecError::Input(INVALID_SCRIPT.to_owned()));
    };

    let script = match fields.get("script") {
        Some(Value::String(script)) => script.clone(),
        _ => return Err(ExecError::Input(INVALID_SCRIPT.to_owned())),
    };
    // The container runtime cannot pass NUL through argv.
    if script.contains('\0') {
        return Err(ExecError::Input("script must not contain NUL characters".to_owned()));
    }

    let challenge_id = match fields.get("challengeId") {
        None | Some(Value::Null) => None,
        Some(Value::String(id)) if !id.trim().is_empty() => Some(id.trim().to_owned()),
        Some(Value::String(_)) => None,
        Some(_) => return Err(ExecError::Input("challengeId must be a string".to_owned())),
    };

    let timeout_ms = match fields.get("timeout") {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) => match n.as_u64() {
            Some(ms) if ms > 0 => Some(ms),
            _ => return Err(invalid_timeout()),
        },
        Some(_) => return Err(invalid_timeout()),
    };

    Ok(ExecutionRequest::new(script, timeout_ms, challenge_id, limits))
}

fn invalid_timeout() -> ExecError {
    ExecError::Input("timeout must be a positive integer number of milliseconds".to_owned())
}
