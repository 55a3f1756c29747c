#![allow(clippy::print_stdout, clippy::print_stderr)] // stdout is the CLI output

mod cli;
mod config;
mod config_check;
mod execution;
mod rate_limit;
mod rule_store;
mod server;
mod tracing_setup;

use anyhow::{Context, Result};
use clap::Parser;
use shellbox_core::ExecutionRequest;
use shellbox_sandbox::{DockerRuntime, LifecycleManager, ProfileBuilder};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cli::{Cli, Commands};
use crate::config::Config;
use crate::execution::ExecutionService;
use crate::rule_store::build_rule_store;
use crate::server::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _tracing_guard = tracing_setup::init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        "shellbox starting"
    );

    match cli.command {
        Commands::Check { format } => cmd_check(cli.config.as_deref(), &format).await,
        Commands::Start => cmd_start(cli.config.as_deref()).await,
        Commands::Run {
            script,
            timeout_ms,
            challenge,
        } => cmd_run(cli.config.as_deref(), script, timeout_ms, challenge).await,
        Commands::Version => {
            println!("shellbox {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Resolve, load and apply environment overrides. Returns the config and
/// the path it was looked up at.
fn load_config(explicit: Option<&str>) -> Result<(Config, PathBuf)> {
    let path = Config::find_config_path(explicit);
    let mut config = Config::load_or_default(&path, explicit.is_some())?;
    config.apply_env(env_lookup)?;
    info!(path = %path.display(), bind = %config.server.bind, "config loaded");
    Ok((config, path))
}

fn config_dir(config_file: &Path) -> &Path {
    config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
}

/// Wire the pipeline from config. Fails fast when the daemon is unreachable
/// or the sandbox image cannot be made available.
async fn build_service(config: &Config, config_file: &Path) -> Result<ExecutionService> {
    let limits = config.timeout_limits()?;
    let sandbox_limits = config.sandbox_limits()?;
    let policy = config.script_policy()?;
    if !policy.is_enabled() {
        warn!("script policy disabled, relying on the sandbox profile alone");
    }

    let runtime = DockerRuntime::connect(config.sandbox.docker_socket.as_deref())?;
    let sandbox =
        shellbox_sandbox::probe(&runtime, &sandbox_limits.image, config.sandbox.pull_image)
            .await
            .context("sandbox runtime is not ready")?;
    info!(
        endpoint = %sandbox.endpoint,
        daemon = %sandbox.daemon,
        image = %sandbox_limits.image,
        "sandbox runtime ready"
    );

    let rules = build_rule_store(&config.rules, config_dir(config_file), env_lookup)?;
    let lifecycle = LifecycleManager::new(Arc::new(runtime))
        .with_max_output_bytes(config.sandbox.max_output_bytes);

    Ok(ExecutionService::new(
        policy,
        ProfileBuilder::new(sandbox_limits),
        lifecycle,
        rules,
        limits,
    ))
}

// ---------------------------------------------------------------------------
// cmd_check: validate config without starting
// ---------------------------------------------------------------------------

async fn cmd_check(config_path: Option<&str>, format: &str) -> Result<()> {
    let config_file = Config::find_config_path(config_path);
    let (mut report, config) =
        config_check::validate_config(&config_file, config_path.is_some(), env_lookup);
    if let Some(config) = &config {
        config_check::check_runtime(&mut report, config).await;
    }

    match format {
        "json" => println!(
            "{}",
            serde_json::to_string_pretty(&report.to_json_value()).unwrap_or_default()
        ),
        _ => println!("{}", report.to_summary_string()),
    }

    if report.has_errors() {
        std::process::exit(1);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// cmd_start: serve the HTTP API
// ---------------------------------------------------------------------------

async fn cmd_start(config_path: Option<&str>) -> Result<()> {
    let (config, config_file) = load_config(config_path)?;
    let service = Arc::new(build_service(&config, &config_file).await?);
    let state = Arc::new(AppState::new(service, &config.server)?);

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(error) = tokio::signal::ctrl_c().await {
                warn!(error = %error, "failed to listen for ctrl-c");
                return;
            }
            info!("shutting down");
            shutdown.cancel();
        });
    }

    println!("shellbox listening on http://{addr}");
    server::serve(listener, state, shutdown).await
}

// ---------------------------------------------------------------------------
// cmd_run: one script through the full pipeline
// ---------------------------------------------------------------------------

async fn cmd_run(
    config_path: Option<&str>,
    script: String,
    timeout_ms: Option<u64>,
    challenge: Option<String>,
) -> Result<()> {
    let (config, config_file) = load_config(config_path)?;
    let service = build_service(&config, &config_file).await?;

    let request = ExecutionRequest::new(script, timeout_ms, challenge, service.limits());
    let outcome = service.execute_request(request).await;
    service.shutdown().await;

    match outcome {
        Ok(result) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&result).context("failed to encode result")?
            );
            if !result.success() {
                std::process::exit(1);
            }
            Ok(())
        }
        Err(failure) => {
            eprintln!(
                "execution {} failed: {}",
                failure.correlation_id, failure.error
            );
            std::process::exit(if failure.error.is_client_error() { 2 } else { 1 });
        }
    }
}
