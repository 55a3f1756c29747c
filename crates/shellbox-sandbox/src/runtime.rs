//! The container runtime seam.
//!
//! The lifecycle manager only talks to containers through [`ContainerRuntime`].
//! Production uses the Docker client in [`crate::docker`]; tests use
//! [`crate::fakes::FakeRuntime`].

use crate::profile::SandboxProfile;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::collections::HashMap;
use std::pin::Pin;

/// Infrastructure failure reported by the container runtime.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    /// The container does not exist (never created, or already removed).
    #[error("container not found: {0}")]
    NotFound(String),

    #[error("{operation} failed: {message}")]
    Operation {
        operation: &'static str,
        message: String,
    },
}

impl RuntimeError {
    pub fn operation(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Operation {
            operation,
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// One frame of container output, tagged by origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    Stdout(Bytes),
    Stderr(Bytes),
}

/// Pull-based container output. Ends when the container closes its streams.
/// An `Err` item means the framing could not be decoded.
pub type OutputStream = Pin<Box<dyn Stream<Item = Result<OutputChunk, RuntimeError>> + Send>>;

/// Everything needed to create one sandboxed container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub profile: SandboxProfile,
    pub command: Vec<String>,
    pub labels: HashMap<String, String>,
}

impl ContainerSpec {
    pub fn new(profile: SandboxProfile, script: &str, correlation_id: &str) -> Self {
        let command = profile.command(script);
        let labels = HashMap::from([
            ("shellbox.managed".to_owned(), "true".to_owned()),
            ("shellbox.execution_id".to_owned(), correlation_id.to_owned()),
        ]);
        Self {
            profile,
            command,
            labels,
        }
    }
}

/// Operations on individual containers. Every call names its container
/// explicitly, so one client can be shared by concurrent requests.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    fn name(&self) -> &str;

    /// Create a container (not started). Returns its id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    /// Attach to stdout/stderr. Called before `start` so no output is missed.
    async fn attach(&self, id: &str) -> Result<OutputStream, RuntimeError>;

    async fn start(&self, id: &str) -> Result<(), RuntimeError>;

    /// Block until the container exits. `Ok(None)` means the exit status
    /// could not be determined.
    async fn wait(&self, id: &str) -> Result<Option<i64>, RuntimeError>;

    async fn is_running(&self, id: &str) -> Result<bool, RuntimeError>;

    /// Kill the container immediately.
    async fn force_stop(&self, id: &str) -> Result<(), RuntimeError>;

    async fn remove(&self, id: &str) -> Result<(), RuntimeError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::ProfileBuilder;
    use shellbox_core::{ExecutionRequest, TimeoutLimits};

    #[test]
    fn spec_labels_carry_correlation_id() {
        let request = ExecutionRequest::new("ls", None, None, &TimeoutLimits::default());
        let profile = ProfileBuilder::default().build(&request);
        let spec = ContainerSpec::new(profile, "ls", "exec-9");
        assert_eq!(spec.labels["shellbox.execution_id"], "exec-9");
        assert_eq!(spec.labels["shellbox.managed"], "true");
        assert_eq!(spec.command.last().map(String::as_str), Some("ls"));
    }

    #[test]
    fn not_found_is_distinguishable() {
        assert!(RuntimeError::NotFound("abc".into()).is_not_found());
        let err = RuntimeError::operation("start", "daemon gone");
        assert!(!err.is_not_found());
        assert_eq!(err.to_string(), "start failed: daemon gone");
    }
}
