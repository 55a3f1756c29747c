//! Container lifecycle: one container per accepted request, always released.
//!
//! ```text
//! Created -> Starting -> Running -> Exited
//!                                -> Killed   (deadline)
//!   any non-terminal  -> Errored             (runtime failure)
//!   anything          -> Removed             (release)
//! ```

use crate::capture::capture_with_deadline;
use crate::profile::SandboxProfile;
use crate::runtime::{ContainerRuntime, ContainerSpec, RuntimeError};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use shellbox_core::{CapturedOutput, ExecError};
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Starting,
    Running,
    Exited,
    Killed,
    Errored,
    Removed,
}

impl ContainerState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Exited | Self::Killed | Self::Errored | Self::Removed
        )
    }

    fn can_become(self, next: Self) -> bool {
        match (self, next) {
            (Self::Removed, _) => false,
            (_, Self::Removed)
            | (Self::Created, Self::Starting)
            | (Self::Starting, Self::Running)
            | (Self::Running, Self::Exited | Self::Killed) => true,
            (from, Self::Errored) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Exited => "exited",
            Self::Killed => "killed",
            Self::Errored => "errored",
            Self::Removed => "removed",
        };
        f.write_str(name)
    }
}

/// Identity and state of one in-flight container. Owned by a single request.
#[derive(Debug)]
pub struct ExecutionHandle {
    correlation_id: String,
    container_id: Option<String>,
    created_at: DateTime<Utc>,
    state: ContainerState,
}

impl ExecutionHandle {
    fn new(correlation_id: &str) -> Self {
        Self {
            correlation_id: correlation_id.to_owned(),
            container_id: None,
            created_at: Utc::now(),
            state: ContainerState::Created,
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn container_id(&self) -> Option<&str> {
        self.container_id.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> ContainerState {
        self.state
    }

    fn transition(&mut self, next: ContainerState) {
        if !self.state.can_become(next) {
            warn!(
                container_id = self.container_id.as_deref().unwrap_or("-"),
                from = %self.state,
                to = %next,
                "ignoring invalid container state transition"
            );
            return;
        }
        debug!(
            container_id = self.container_id.as_deref().unwrap_or("-"),
            from = %self.state,
            to = %next,
            "container state transition"
        );
        self.state = next;
    }
}

/// What one run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRunResult {
    pub output: CapturedOutput,
    /// Measured from the start call.
    pub elapsed: Duration,
}

/// Drives containers through their lifecycle against a shared runtime client.
#[derive(Clone)]
pub struct LifecycleManager {
    runtime: Arc<dyn ContainerRuntime>,
    max_output_bytes: usize,
}

impl fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("runtime", &self.runtime.name())
            .field("max_output_bytes", &self.max_output_bytes)
            .finish()
    }
}

impl LifecycleManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }

    #[must_use]
    pub fn with_max_output_bytes(mut self, max_output_bytes: usize) -> Self {
        self.max_output_bytes = max_output_bytes.max(1);
        self
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// Create the container for `script`. On failure nothing exists, so there
    /// is nothing to release.
    pub async fn acquire(
        &self,
        profile: &SandboxProfile,
        script: &str,
        correlation_id: &str,
    ) -> Result<ExecutionHandle, ExecError> {
        let mut handle = ExecutionHandle::new(correlation_id);
        let spec = ContainerSpec::new(profile.clone(), script, correlation_id);

        match self.runtime.create(&spec).await {
            Ok(id) => {
                info!(container_id = %id, image = %profile.image, "container created");
                handle.container_id = Some(id);
                handle.transition(ContainerState::Starting);
                Ok(handle)
            }
            Err(error) => {
                handle.transition(ContainerState::Errored);
                warn!(error = %error, "container create failed");
                Err(ExecError::Resource(error.to_string()))
            }
        }
    }

    /// Start the container and capture its output until exit or `deadline`.
    /// On deadline the container is force-stopped exactly once.
    pub async fn run(
        &self,
        handle: &mut ExecutionHandle,
        deadline: Duration,
    ) -> Result<ContainerRunResult, ExecError> {
        let Some(id) = handle.container_id.clone() else {
            return Err(ExecError::Internal(
                "run called on a handle without a container".to_owned(),
            ));
        };

        let output = match self.runtime.attach(&id).await {
            Ok(output) => output,
            Err(error) => return Err(self.fail(handle, "attach", &error)),
        };

        // Registered before start so a fast exit (and auto-remove) cannot
        // slip past the wait.
        let waiter = {
            let runtime = Arc::clone(&self.runtime);
            let id = id.clone();
            tokio::spawn(async move { runtime.wait(&id).await })
        };
        let abort_wait = waiter.abort_handle();

        let started = Instant::now();
        if let Err(error) = self.runtime.start(&id).await {
            abort_wait.abort();
            return Err(self.fail(handle, "start", &error));
        }
        handle.transition(ContainerState::Running);

        let exit = async move {
            waiter
                .await
                .map_err(|e| RuntimeError::operation("wait", e.to_string()))?
        };
        let captured =
            capture_with_deadline(output, exit, started + deadline, self.max_output_bytes).await;
        abort_wait.abort();
        let elapsed = started.elapsed();

        let captured = match captured {
            Ok(captured) => captured,
            Err(error) => return Err(self.fail(handle, "wait", &error)),
        };

        if captured.timed_out {
            warn!(
                container_id = %id,
                deadline_ms = deadline.as_millis(),
                "execution deadline reached, killing container"
            );
            if let Err(error) = self.runtime.force_stop(&id).await {
                warn!(container_id = %id, error = %error, "forced stop failed");
            }
            handle.transition(ContainerState::Killed);
        } else {
            info!(
                container_id = %id,
                exit_code = ?captured.exit_code,
                elapsed_ms = elapsed.as_millis(),
                "container exited"
            );
            handle.transition(ContainerState::Exited);
        }

        Ok(ContainerRunResult {
            output: captured,
            elapsed,
        })
    }

    /// Stop (if still running) and remove the container. Safe to call any
    /// number of times; failures are logged, never returned.
    pub async fn release(&self, handle: &mut ExecutionHandle) {
        if handle.state == ContainerState::Removed {
            return;
        }
        let Some(id) = handle.container_id.clone() else {
            handle.transition(ContainerState::Removed);
            return;
        };

        if handle.state != ContainerState::Killed {
            match self.runtime.is_running(&id).await {
                Ok(true) => {
                    info!(container_id = %id, state = %handle.state, "stopping container on release");
                    if let Err(error) = self.runtime.force_stop(&id).await {
                        warn!(container_id = %id, error = %error, "forced stop on release failed");
                    }
                }
                Ok(false) => {}
                Err(error) if error.is_not_found() => {}
                Err(error) => {
                    warn!(container_id = %id, error = %error, "could not inspect container on release");
                }
            }
        }

        match self.runtime.remove(&id).await {
            Ok(()) => debug!(container_id = %id, "container removed"),
            Err(error) if error.is_not_found() => {
                debug!(container_id = %id, "container already gone");
            }
            Err(error) => warn!(container_id = %id, error = %error, "container removal failed"),
        }
        handle.transition(ContainerState::Removed);
    }

    /// acquire, run, release. Release happens on every path, including a
    /// panic inside `run`, which then surfaces as [`ExecError::Internal`].
    pub async fn execute(
        &self,
        profile: &SandboxProfile,
        script: &str,
        correlation_id: &str,
        deadline: Duration,
    ) -> Result<ContainerRunResult, ExecError> {
        let mut handle = self.acquire(profile, script, correlation_id).await?;

        let outcome = AssertUnwindSafe(self.run(&mut handle, deadline))
            .catch_unwind()
            .await;
        self.release(&mut handle).await;

        outcome.unwrap_or_else(|panic| {
            let message = panic_message(panic.as_ref());
            warn!(error = %message, "container run panicked");
            Err(ExecError::Internal(message))
        })
    }

    fn fail(
        &self,
        handle: &mut ExecutionHandle,
        operation: &str,
        error: &RuntimeError,
    ) -> ExecError {
        warn!(
            container_id = handle.container_id.as_deref().unwrap_or("-"),
            runtime = self.runtime.name(),
            operation,
            error = %error,
            "container runtime failure"
        );
        handle.transition(ContainerState::Errored);
        ExecError::Resource(error.to_string())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with non-string payload".to_owned()
    }
}
