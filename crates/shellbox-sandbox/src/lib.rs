//! Container sandbox for untrusted shell scripts.
//!
//! A script passes the [`ScriptPolicy`] text filter, gets a locked-down
//! [`SandboxProfile`], and runs in a throwaway container driven by the
//! [`LifecycleManager`]. The profile is the security boundary; the text
//! filter only gives early, readable rejections.

pub mod capture;
pub mod docker;
pub mod fakes;
pub mod lifecycle;
pub mod profile;
pub mod runtime;
pub mod script_policy;

pub use docker::DockerRuntime;
pub use lifecycle::{ContainerRunResult, ContainerState, ExecutionHandle, LifecycleManager};
pub use profile::{ProfileBuilder, SandboxLimits, SandboxProfile, parse_size};
pub use runtime::{ContainerRuntime, ContainerSpec, OutputChunk, OutputStream, RuntimeError};
pub use script_policy::{PolicyDecision, ScriptPolicy};

use anyhow::Result;

/// What [`probe`] found.
#[derive(Debug, Clone)]
pub struct SandboxInfo {
    pub endpoint: String,
    pub daemon: String,
}

/// Check that the Docker daemon answers and, when `pull` is set, that
/// `image` is available locally (pulling it if needed).
pub async fn probe(runtime: &DockerRuntime, image: &str, pull: bool) -> Result<SandboxInfo> {
    let daemon = runtime.ping().await?;
    if pull {
        runtime.ensure_image(image).await?;
    }
    Ok(SandboxInfo {
        endpoint: runtime.endpoint().to_owned(),
        daemon,
    })
}
