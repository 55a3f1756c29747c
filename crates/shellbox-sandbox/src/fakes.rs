//! Scriptable in-memory container runtime for tests.
#![allow(clippy::unwrap_used)]

use crate::runtime::{ContainerRuntime, ContainerSpec, OutputChunk, OutputStream, RuntimeError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Per-operation call counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub create: usize,
    pub attach: usize,
    pub start: usize,
    pub wait: usize,
    pub is_running: usize,
    pub force_stop: usize,
    pub remove: usize,
}

#[derive(Debug, Default)]
struct Counters {
    create: AtomicUsize,
    attach: AtomicUsize,
    start: AtomicUsize,
    wait: AtomicUsize,
    is_running: AtomicUsize,
    force_stop: AtomicUsize,
    remove: AtomicUsize,
}

#[derive(Debug, Default)]
struct Containers {
    specs: Vec<ContainerSpec>,
    hanging: HashSet<String>,
    started: HashSet<String>,
    stopped: HashSet<String>,
}

/// Runtime that replays a fixed script of output and exit status.
///
/// A hanging container emits its chunks and then never finishes, which is
/// how tests drive the deadline path. Either every container hangs, or only
/// the ones created for one particular script.
#[derive(Debug)]
pub struct FakeRuntime {
    chunks: Vec<Result<OutputChunk, RuntimeError>>,
    exit_code: Option<i64>,
    hang: bool,
    hang_script: Option<String>,
    fail_on: Option<&'static str>,
    panic_on: Option<&'static str>,
    counters: Counters,
    containers: Mutex<Containers>,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self {
            chunks: Vec::new(),
            exit_code: Some(0),
            hang: false,
            hang_script: None,
            fail_on: None,
            panic_on: None,
            counters: Counters::default(),
            containers: Mutex::new(Containers::default()),
        }
    }
}

impl FakeRuntime {
    /// Exits 0 with no output.
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_stdout(mut self, text: &str) -> Self {
        self.chunks
            .push(Ok(OutputChunk::Stdout(Bytes::copy_from_slice(text.as_bytes()))));
        self
    }

    #[must_use]
    pub fn with_stderr(mut self, text: &str) -> Self {
        self.chunks
            .push(Ok(OutputChunk::Stderr(Bytes::copy_from_slice(text.as_bytes()))));
        self
    }

    /// Insert an undecodable frame into the output.
    #[must_use]
    pub fn with_malformed_frame(mut self) -> Self {
        self.chunks
            .push(Err(RuntimeError::operation("attach", "malformed frame header")));
        self
    }

    #[must_use]
    pub fn with_exit_code(mut self, code: Option<i64>) -> Self {
        self.exit_code = code;
        self
    }

    /// Output never ends and the container never exits.
    #[must_use]
    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    /// Only containers running exactly `script` hang; the rest finish.
    #[must_use]
    pub fn hanging_on_script(mut self, script: &str) -> Self {
        self.hang_script = Some(script.to_owned());
        self
    }

    /// Make `operation` ("create", "attach", "start", "wait", "is_running",
    /// "force_stop", "remove") return an error.
    #[must_use]
    pub fn failing_on(mut self, operation: &'static str) -> Self {
        self.fail_on = Some(operation);
        self
    }

    /// Make `operation` panic.
    #[must_use]
    pub fn panicking_on(mut self, operation: &'static str) -> Self {
        self.panic_on = Some(operation);
        self
    }

    pub fn counts(&self) -> CallCounts {
        let c = &self.counters;
        CallCounts {
            create: c.create.load(Ordering::SeqCst),
            attach: c.attach.load(Ordering::SeqCst),
            start: c.start.load(Ordering::SeqCst),
            wait: c.wait.load(Ordering::SeqCst),
            is_running: c.is_running.load(Ordering::SeqCst),
            force_stop: c.force_stop.load(Ordering::SeqCst),
            remove: c.remove.load(Ordering::SeqCst),
        }
    }

    /// Every spec passed to `create`, in order.
    pub fn created_specs(&self) -> Vec<ContainerSpec> {
        self.containers.lock().unwrap().specs.clone()
    }

    fn hangs(&self, id: &str) -> bool {
        self.hang || self.containers.lock().unwrap().hanging.contains(id)
    }

    fn enter(&self, operation: &'static str, counter: &AtomicUsize) -> Result<(), RuntimeError> {
        counter.fetch_add(1, Ordering::SeqCst);
        if self.panic_on == Some(operation) {
            panic!("fake runtime panicked during {operation}");
        }
        if self.fail_on == Some(operation) {
            return Err(RuntimeError::operation(operation, "fake runtime failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    fn name(&self) -> &str {
        "fake"
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        self.enter("create", &self.counters.create)?;
        let mut containers = self.containers.lock().unwrap();
        containers.specs.push(spec.clone());
        let id = format!("fake-{}", containers.specs.len());
        if self.hang_script.is_some() && spec.command.last() == self.hang_script.as_ref() {
            containers.hanging.insert(id.clone());
        }
        Ok(id)
    }

    async fn attach(&self, id: &str) -> Result<OutputStream, RuntimeError> {
        self.enter("attach", &self.counters.attach)?;
        let chunks = stream::iter(self.chunks.clone());
        if self.hangs(id) {
            Ok(Box::pin(futures::StreamExt::chain(chunks, stream::pending())))
        } else {
            Ok(Box::pin(chunks))
        }
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.enter("start", &self.counters.start)?;
        self.containers.lock().unwrap().started.insert(id.to_owned());
        Ok(())
    }

    async fn wait(&self, id: &str) -> Result<Option<i64>, RuntimeError> {
        self.enter("wait", &self.counters.wait)?;
        if self.hangs(id) {
            futures::future::pending::<()>().await;
        }
        Ok(self.exit_code)
    }

    async fn is_running(&self, id: &str) -> Result<bool, RuntimeError> {
        self.enter("is_running", &self.counters.is_running)?;
        let hangs = self.hangs(id);
        let containers = self.containers.lock().unwrap();
        Ok(hangs && containers.started.contains(id) && !containers.stopped.contains(id))
    }

    async fn force_stop(&self, id: &str) -> Result<(), RuntimeError> {
        self.enter("force_stop", &self.counters.force_stop)?;
        self.containers.lock().unwrap().stopped.insert(id.to_owned());
        Ok(())
    }

    async fn remove(&self, _id: &str) -> Result<(), RuntimeError> {
        self.enter("remove", &self.counters.remove)
    }
}
