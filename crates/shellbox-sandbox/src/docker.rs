//! Docker implementation of [`ContainerRuntime`] on top of `bollard`.

use crate::profile::SandboxProfile;
use crate::runtime::{ContainerRuntime, ContainerSpec, OutputChunk, OutputStream, RuntimeError};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerCreateBody, HostConfig, ResourcesUlimits};
use bollard::query_parameters::{
    AttachContainerOptionsBuilder, CreateContainerOptions, CreateImageOptionsBuilder,
    InspectContainerOptions, KillContainerOptionsBuilder, RemoveContainerOptionsBuilder,
    StartContainerOptions, WaitContainerOptionsBuilder,
};
use bollard::{API_DEFAULT_VERSION, Docker};
use futures::{StreamExt, TryStreamExt, future};
use std::collections::HashMap;
use tracing::{debug, info, warn};

const DOCKER_TIMEOUT_SECS: u64 = 120;

/// Container runtime backed by a Docker daemon.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
    endpoint: String,
}

impl DockerRuntime {
    /// Connect to `socket`, or to the platform default (`DOCKER_HOST`, then the
    /// local socket) when `None`. No request is made until first use.
    pub fn connect(socket: Option<&str>) -> Result<Self> {
        let (docker, endpoint) = match socket {
            Some(path) => (
                Docker::connect_with_socket(path, DOCKER_TIMEOUT_SECS, API_DEFAULT_VERSION)
                    .with_context(|| format!("failed to connect to docker at {path}"))?,
                path.to_owned(),
            ),
            None => (
                Docker::connect_with_local_defaults()
                    .context("failed to connect to local docker daemon")?,
                "local".to_owned(),
            ),
        };
        Ok(Self { docker, endpoint })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Round-trip to the daemon. Returns the daemon's reply.
    pub async fn ping(&self) -> Result<String> {
        self.docker
            .ping()
            .await
            .with_context(|| format!("docker daemon at {} is not reachable", self.endpoint))
    }

    /// Pull `image` unless it is already present locally.
    pub async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image, "image present");
            return Ok(());
        }

        let (from_image, tag) = split_image_tag(image);
        info!(image, "pulling sandbox image");
        self.docker
            .create_image(
                Some(
                    CreateImageOptionsBuilder::new()
                        .from_image(from_image)
                        .tag(tag)
                        .build(),
                ),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await
            .with_context(|| format!("failed to pull image {image}"))?;
        info!(image, "image pulled");
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &str {
        "docker"
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let response = self
            .docker
            .create_container(None::<CreateContainerOptions>, create_body(spec))
            .await
            .map_err(|e| runtime_error("create", e))?;
        for warning in &response.warnings {
            warn!(container_id = %response.id, warning = %warning, "docker create warning");
        }
        Ok(response.id)
    }

    async fn attach(&self, id: &str) -> Result<OutputStream, RuntimeError> {
        let options = AttachContainerOptionsBuilder::new()
            .stdout(true)
            .stderr(true)
            .stream(true)
            .logs(true)
            .build();
        let attached = self
            .docker
            .attach_container(id, Some(options))
            .await
            .map_err(|e| runtime_error("attach", e))?;

        let output = attached.output.filter_map(|item| {
            future::ready(match item {
                Ok(LogOutput::StdOut { message } | LogOutput::Console { message }) => {
                    Some(Ok(OutputChunk::Stdout(message)))
                }
                Ok(LogOutput::StdErr { message }) => Some(Ok(OutputChunk::Stderr(message))),
                Ok(LogOutput::StdIn { .. }) => None,
                Err(error) => Some(Err(RuntimeError::operation("attach", error.to_string()))),
            })
        });
        Ok(Box::pin(output))
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(id, None::<StartContainerOptions>)
            .await
            .map_err(|e| runtime_error("start", e))
    }

    async fn wait(&self, id: &str) -> Result<Option<i64>, RuntimeError> {
        // Sandbox profiles always auto-remove, and waiting for removal is the
        // only condition that cannot miss a fast exit.
        let options = WaitContainerOptionsBuilder::new()
            .condition("removed")
            .build();
        let mut responses = std::pin::pin!(self.docker.wait_container(id, Some(options)));

        match responses.next().await {
            Some(Ok(response)) => Ok(Some(response.status_code)),
            // bollard reports a non-zero exit as an error carrying the code.
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(Some(code)),
            Some(Err(error)) if is_not_found(&error) => {
                warn!(container_id = id, "container vanished before its exit status was read");
                Ok(None)
            }
            Some(Err(error)) => Err(runtime_error("wait", error)),
            None => Ok(None),
        }
    }

    async fn is_running(&self, id: &str) -> Result<bool, RuntimeError> {
        let inspected = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| runtime_error("inspect", e))?;
        Ok(inspected
            .state
            .and_then(|state| state.running)
            .unwrap_or(false))
    }

    async fn force_stop(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .kill_container(
                id,
                Some(KillContainerOptionsBuilder::new().signal("SIGKILL").build()),
            )
            .await
            .map_err(|e| runtime_error("kill", e))
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .remove_container(
                id,
                Some(
                    RemoveContainerOptionsBuilder::new()
                        .force(true)
                        .v(true)
                        .build(),
                ),
            )
            .await
            .map_err(|e| runtime_error("remove", e))
    }
}

/// Map a spec onto the Docker create body. Every isolation setting is
/// explicit so daemon defaults never loosen the profile.
fn create_body(spec: &ContainerSpec) -> ContainerCreateBody {
    let profile = &spec.profile;
    ContainerCreateBody {
        image: Some(profile.image.clone()),
        cmd: Some(spec.command.clone()),
        entrypoint: Some(Vec::new()),
        working_dir: Some(profile.working_dir.clone()),
        user: Some(profile.user.clone()),
        env: Some(profile.env.clone()),
        labels: Some(spec.labels.clone()),
        network_disabled: Some(true),
        attach_stdin: Some(false),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        open_stdin: Some(false),
        tty: Some(false),
        host_config: Some(host_config(profile)),
        ..ContainerCreateBody::default()
    }
}

fn host_config(profile: &SandboxProfile) -> HostConfig {
    let memory = clamp_i64(profile.memory_limit);
    let file_size = clamp_i64(profile.file_size_limit);
    let tmpfs: HashMap<String, String> = profile
        .tmpfs
        .iter()
        .map(|mount| (mount.path.clone(), mount.options()))
        .collect();

    let mut security_opt = Vec::new();
    if profile.no_new_privileges {
        security_opt.push("no-new-privileges".to_owned());
    }

    HostConfig {
        network_mode: Some(profile.network.as_str().to_owned()),
        memory: Some(memory),
        memory_swap: Some(memory),
        cpu_period: Some(profile.cpu_period),
        cpu_quota: Some(profile.cpu_quota),
        pids_limit: Some(i64::from(profile.pids_limit)),
        ulimits: Some(vec![ResourcesUlimits {
            name: Some("fsize".to_owned()),
            soft: Some(file_size),
            hard: Some(file_size),
        }]),
        readonly_rootfs: Some(profile.read_only_root),
        tmpfs: Some(tmpfs),
        cap_drop: Some(profile.cap_drop.clone()),
        cap_add: Some(Vec::new()),
        security_opt: Some(security_opt),
        privileged: Some(false),
        auto_remove: Some(profile.auto_remove),
        ..HostConfig::default()
    }
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn split_image_tag(image: &str) -> (&str, &str) {
    // A colon inside the last path segment is a tag; one before a slash is a
    // registry port.
    match image.rsplit_once(':') {
        Some((name, tag)) if !tag.contains('/') => (name, tag),
        _ => (image, "latest"),
    }
}

fn is_not_found(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn runtime_error(operation: &'static str, error: BollardError) -> RuntimeError {
    if is_not_found(&error) {
        RuntimeError::NotFound(error.to_string())
    } else {
        RuntimeError::operation(operation, error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::ProfileBuilder;
    use shellbox_core::{ExecutionRequest, TimeoutLimits};

    fn spec() -> ContainerSpec {
        let request = ExecutionRequest::new("ls -la", Some(5_000), None, &TimeoutLimits::default());
        ContainerSpec::new(ProfileBuilder::default().build(&request), "ls -la", "exec-1")
    }

    #[test]
    fn create_body_is_locked_down() {
        let body = create_body(&spec());
        assert_eq!(body.network_disabled, Some(true));
        assert_eq!(body.user.as_deref(), Some("1000:1000"));
        assert_eq!(body.tty, Some(false));

        let host = body.host_config.unwrap_or_default();
        assert_eq!(host.network_mode.as_deref(), Some("none"));
        assert_eq!(host.readonly_rootfs, Some(true));
        assert_eq!(host.cap_drop, Some(vec!["ALL".to_owned()]));
        assert_eq!(host.security_opt, Some(vec!["no-new-privileges".to_owned()]));
        assert_eq!(host.privileged, Some(false));
        assert_eq!(host.auto_remove, Some(true));
        assert_eq!(host.pids_limit, Some(10));
        assert_eq!(host.memory, host.memory_swap);
    }

    #[test]
    fn tmpfs_mounts_are_noexec() {
        let host = create_body(&spec()).host_config.unwrap_or_default();
        let tmpfs = host.tmpfs.unwrap_or_default();
        assert_eq!(tmpfs.len(), 2);
        assert!(tmpfs["/tmp"].contains("noexec"));
        assert!(tmpfs["/var/tmp"].contains("nosuid"));
    }

    #[test]
    fn file_size_limit_is_an_fsize_ulimit() {
        let host = create_body(&spec()).host_config.unwrap_or_default();
        let ulimits = host.ulimits.unwrap_or_default();
        assert_eq!(ulimits.len(), 1);
        assert_eq!(ulimits[0].name.as_deref(), Some("fsize"));
        assert_eq!(ulimits[0].hard, Some(1024 * 1024));
    }

    #[test]
    fn command_wraps_script_in_timeout() {
        let body = create_body(&spec());
        let cmd = body.cmd.unwrap_or_default();
        assert_eq!(cmd[..4], ["timeout", "-s", "KILL", "6"]);
        assert_eq!(cmd.last().map(String::as_str), Some("ls -la"));
    }

    #[test]
    fn image_tags_split_correctly() {
        assert_eq!(split_image_tag("alpine:3.20"), ("alpine", "3.20"));
        assert_eq!(split_image_tag("alpine"), ("alpine", "latest"));
        assert_eq!(
            split_image_tag("registry.local:5000/tools/sh"),
            ("registry.local:5000/tools/sh", "latest")
        );
    }

    #[test]
    fn not_found_maps_to_not_found() {
        let error = BollardError::DockerResponseServerError {
            status_code: 404,
            message: "No such container".to_owned(),
        };
        assert!(runtime_error("remove", error).is_not_found());

        let error = BollardError::DockerResponseServerError {
            status_code: 500,
            message: "boom".to_owned(),
        };
        assert!(!runtime_error("remove", error).is_not_found());
    }
}
