use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

/// Console default: request outcomes and container kills, without the
/// Docker client and HTTP plumbing chatter.
const CONSOLE_DIRECTIVES: &str = "info,bollard=warn,hyper=warn,hyper_util=warn,reqwest=warn";

/// Trace file default: every container state transition and policy
/// decision, still without client internals.
const TRACE_FILE_DIRECTIVES: &str =
    "debug,shellbox_sandbox=debug,bollard=info,hyper=info,hyper_util=info,reqwest=info";

/// Flushes buffered JSONL lines when dropped; hold it for the process lifetime.
pub(crate) struct TracingGuard {
    _guards: Vec<WorkerGuard>,
}

/// Initialize the layered tracing subscriber.
///
/// Layers:
/// 1. Console (stderr), filtered by `RUST_LOG` or [`CONSOLE_DIRECTIVES`]
/// 2. JSONL file, activated by `SHELLBOX_TRACE_FILE`, filtered by `RUST_LOG`
///    or [`TRACE_FILE_DIRECTIVES`]
///
/// Every request span carries `execution_id`, so one execution can be
/// followed through the JSONL file with a single filter.
pub(crate) fn init() -> TracingGuard {
    let mut guards = Vec::new();

    let console_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(env_or(CONSOLE_DIRECTIVES));

    let jsonl_layer = std::env::var("SHELLBOX_TRACE_FILE").ok().map(|trace_file| {
        let (dir, filename) = trace_file_target(&trace_file);
        let file_appender = tracing_appender::rolling::never(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        guards.push(guard);

        fmt::layer()
            .json()
            .with_writer(non_blocking)
            .with_span_list(true)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_filter(env_or(TRACE_FILE_DIRECTIVES))
    });

    Registry::default()
        .with(console_layer)
        .with(jsonl_layer)
        .init();

    TracingGuard { _guards: guards }
}

fn env_or(directives: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives))
}

/// Split `SHELLBOX_TRACE_FILE` into the appender's directory and file name.
fn trace_file_target(trace_file: &str) -> (PathBuf, String) {
    let path = Path::new(trace_file);
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .to_path_buf();
    let filename = path.file_name().map_or_else(
        || "shellbox-traces.jsonl".to_owned(),
        |f| f.to_string_lossy().into_owned(),
    );
    (dir, filename)
}
