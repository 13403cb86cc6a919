//! Worker construction by tag, and the entry point of worker host processes.

use std::collections::HashMap;
use std::fmt;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{BufReader, BufWriter};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::runtime::codec::{read_packet, write_packet};
use crate::runtime::error::{Error, WorkerError};
use crate::runtime::shared_memory::{SharedMemory, SharedMemoryDescriptor};
use crate::runtime::worker::{Inbox, Outbox, Worker, WorkerContext, WorkerExit, WorkerSpec, run_worker};

/// Environment variable that marks a process as a worker host and carries
/// its launch description as JSON.
pub const WORKER_SPEC_ENV: &str = "FERRITE_WORKER_SPEC";

pub type WorkerFactory = Arc<dyn Fn(&WorkerSpec) -> Result<Box<dyn Worker>, WorkerError> + Send + Sync>;

/// What a worker host needs to rebuild the worker its owner asked for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Launch {
    pub spec: WorkerSpec,
    pub shared_memory: Option<SharedMemoryDescriptor>,
}

#[derive(Clone, Default)]
pub struct WorkerRegistry {
    factories: HashMap<String, WorkerFactory>,
}

impl fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.factories.keys().collect();
        kinds.sort();
        f.debug_struct("WorkerRegistry").field("kinds", &kinds).finish()
    }
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&WorkerSpec) -> Result<Box<dyn Worker>, WorkerError> + Send + Sync + 'static,
    {
        self.factories.insert(kind.into(), Arc::new(factory));
        self
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    pub fn create(&self, spec: &WorkerSpec) -> Result<Box<dyn Worker>, WorkerError> {
        let factory = self
            .factories
            .get(&spec.kind)
            .ok_or_else(|| Error::UnknownWorker(spec.kind.clone()))?;
        factory(spec)
    }
}

/// True when this process was started by a `ProcessHandler`.
pub fn is_worker_process() -> bool {
    std::env::var_os(WORKER_SPEC_ENV).is_some()
}

/// Serve one worker over stdin/stdout and exit. Logs go to stderr.
pub fn worker_main(registry: &WorkerRegistry) -> ExitCode {
    crate::logging::init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to start worker runtime");
            return ExitCode::FAILURE;
        }
    };

    let code = match runtime.block_on(serve(registry)) {
        Ok(exit) => exit.code(),
        Err(e) => {
            error!(error = %e, "worker host failed");
            1
        }
    };
    // stdin is read on a blocking thread that may never see EOF.
    runtime.shutdown_timeout(Duration::from_millis(200));
    ExitCode::from(code)
}

async fn serve(registry: &WorkerRegistry) -> Result<WorkerExit, WorkerError> {
    let raw = std::env::var(WORKER_SPEC_ENV).map_err(|e| Error::Internal(format!("{WORKER_SPEC_ENV}: {e}")))?;
    let launch: Launch = serde_json::from_str(&raw).map_err(|e| Error::Deserialize(e.to_string()))?;
    let spec = launch.spec;

    let shared_memory = launch
        .shared_memory
        .as_ref()
        .map(SharedMemory::open)
        .transpose()?;
    let worker = registry.create(&spec)?;

    let (in_tx, in_rx) = mpsc::channel(spec.inbox_capacity);
    let (out_tx, mut out_rx) = mpsc::channel(spec.outbox_capacity);

    let name = spec.name.clone();
    let reader = tokio::spawn(async move {
        let mut stdin = BufReader::new(tokio::io::stdin());
        loop {
            match read_packet(&mut stdin).await {
                Ok(Some(packet)) => {
                    if in_tx.send(packet).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!(worker = %name, "owner closed the input stream");
                    break;
                }
                Err(e) => {
                    error!(worker = %name, error = %e, "bad input frame");
                    break;
                }
            }
        }
    });

    let name = spec.name.clone();
    let writer = tokio::spawn(async move {
        let mut stdout = BufWriter::new(tokio::io::stdout());
        while let Some(packet) = out_rx.recv().await {
            if let Err(e) = write_packet(&mut stdout, &packet).await {
                debug!(worker = %name, error = %e, "owner stopped reading output");
                break;
            }
        }
    });

    let ctx = WorkerContext::new(spec.name.clone(), Inbox::new(in_rx), Outbox::new(out_tx), shared_memory);
    let exit = run_worker(worker, ctx, &spec).await;

    // ctx is gone, so the writer drains what is left and finishes.
    if writer.await.is_err() {
        debug!(worker = %spec.name, "output writer aborted");
    }
    reader.abort();
    Ok(exit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Packet;
    use async_trait::async_trait;

    struct Nop;

    #[async_trait]
    impl Worker for Nop {
        async fn init(&mut self, _ctx: &mut WorkerContext) -> Result<(), WorkerError> {
            Ok(())
        }

        async fn update(&mut self, _ctx: &mut WorkerContext, _packet: Packet) -> Result<(), WorkerError> {
            Ok(())
        }

        async fn cleanup(&mut self, _ctx: &mut WorkerContext) {}
    }

    #[test]
    fn creates_registered_kinds_only() {
        let mut registry = WorkerRegistry::new();
        registry.register("nop", |_spec| Ok(Box::new(Nop) as Box<dyn Worker>));

        assert!(registry.contains("nop"));
        assert!(registry.create(&WorkerSpec::new("nop", "a")).is_ok());
        assert!(matches!(
            registry.create(&WorkerSpec::new("missing", "b")),
            Err(WorkerError::Runtime(Error::UnknownWorker(kind))) if kind == "missing"
        ));
    }
}
