use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{BufReader, BufWriter};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::runtime::codec::{read_packet, write_packet};
use crate::runtime::error::Error;
use crate::runtime::packet::Packet;
use crate::runtime::registry::{Launch, WORKER_SPEC_ENV, WorkerRegistry};
use crate::runtime::shared_memory::SharedMemory;
use crate::runtime::worker::{Inbox, Outbox, WorkerContext, WorkerExit, WorkerSpec, run_worker};

/// Bounded wait for a worker to exit on its own before it is terminated.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Where a worker runs.
#[derive(Clone)]
pub enum Launcher {
    /// Re-exec a host binary that calls `worker_main` when it sees
    /// `FERRITE_WORKER_SPEC` in its environment.
    Process { program: PathBuf, args: Vec<String> },
    /// Run the worker loop on a dedicated OS thread in this process.
    Thread(Arc<WorkerRegistry>),
}

impl fmt::Debug for Launcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Launcher::Process { program, args } => f
                .debug_struct("Process")
                .field("program", program)
                .field("args", args)
                .finish(),
            Launcher::Thread(registry) => f.debug_tuple("Thread").field(registry).finish(),
        }
    }
}

impl Launcher {
    pub fn process(program: impl Into<PathBuf>) -> Self {
        Launcher::Process {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Re-exec the running binary.
    pub fn current_exe() -> Result<Self, Error> {
        Ok(Self::process(std::env::current_exe()?))
    }

    /// The `ferrite-worker` binary installed next to the running one.
    pub fn host_binary() -> Result<Self, Error> {
        let exe = std::env::current_exe()?;
        let dir = exe
            .parent()
            .ok_or_else(|| Error::Internal(format!("{} has no parent directory", exe.display())))?;
        Ok(Self::process(dir.join(format!("ferrite-worker{}", std::env::consts::EXE_SUFFIX))))
    }

    pub fn thread(registry: WorkerRegistry) -> Self {
        Launcher::Thread(Arc::new(registry))
    }
}

enum Backend {
    Process {
        child: Child,
        pumps: Vec<JoinHandle<()>>,
    },
    Thread {
        join: Option<std::thread::JoinHandle<WorkerExit>>,
    },
}

/// Owner-side handle to one running worker and its two bounded queues.
pub struct ProcessHandler {
    id: Uuid,
    name: String,
    inbox: Option<mpsc::Sender<Packet>>,
    outbox: mpsc::Receiver<Packet>,
    backend: Backend,
    terminating: bool,
}

impl fmt::Debug for ProcessHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let backend = match &self.backend {
            Backend::Process { child, .. } => format!("process({:?})", child.id()),
            Backend::Thread { .. } => "thread".to_string(),
        };
        f.debug_struct("ProcessHandler")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("backend", &backend)
            .field("terminating", &self.terminating)
            .finish()
    }
}

impl ProcessHandler {
    /// Start a worker and wire up its queues.
    ///
    /// `shared_memory` is mapped by the worker during startup, so the block
    /// must outlive that. `cpu_affinity` pins the worker to the given cores
    /// where the platform supports it.
    pub async fn setup(
        launcher: &Launcher,
        spec: WorkerSpec,
        shared_memory: Option<&SharedMemory>,
        cpu_affinity: Option<&[usize]>,
    ) -> Result<Self, Error> {
        debug!(worker = %spec.name, kind = %spec.kind, "setting up worker");
        let (in_tx, in_rx) = mpsc::channel(spec.inbox_capacity.max(1));
        let (out_tx, out_rx) = mpsc::channel(spec.outbox_capacity.max(1));
        let name = spec.name.clone();

        let backend = match launcher {
            Launcher::Process { program, args } => {
                let launch = Launch {
                    spec,
                    shared_memory: shared_memory.map(|m| m.descriptor().clone()),
                };
                spawn_process(program, args, &launch, in_rx, out_tx, cpu_affinity)?
            }
            Launcher::Thread(registry) => {
                let shared = shared_memory.map(|m| SharedMemory::open(m.descriptor())).transpose()?;
                spawn_thread(registry.clone(), spec, shared, in_rx, out_tx, cpu_affinity)?
            }
        };

        info!(worker = %name, "worker has started");
        Ok(Self {
            id: Uuid::new_v4(),
            name,
            inbox: Some(in_tx),
            outbox: out_rx,
            backend,
            terminating: false,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a packet without waiting. Returns `false` when it was dropped
    /// because the queue is full or the worker is shutting down.
    pub fn put<T: Serialize + ?Sized>(&mut self, header: &str, data: &T) -> Result<bool, Error> {
        let Some(tx) = self.sender() else {
            return Ok(false);
        };
        match tx.try_send(Packet::new(header, data)?) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => {
                debug!(worker = %self.name, header, "input queue is full, dropping packet");
                Ok(false)
            }
            Err(TrySendError::Closed(_)) => {
                warn!(worker = %self.name, header, "worker is no longer accepting input");
                Ok(false)
            }
        }
    }

    /// Enqueue a packet, waiting up to `timeout` for room (forever if `None`).
    pub async fn put_wait<T: Serialize + ?Sized>(
        &mut self,
        header: &str,
        data: &T,
        timeout: Option<Duration>,
    ) -> Result<(), Error> {
        let tx = self.sender().ok_or(Error::NotRunning)?.clone();
        let packet = Packet::new(header, data)?;
        match timeout {
            Some(t) => tokio::time::timeout(t, tx.send(packet))
                .await
                .map_err(|_| Error::Timeout)?
                .map_err(|_| Error::NotRunning),
            None => tx.send(packet).await.map_err(|_| Error::NotRunning),
        }
    }

    /// Oldest available output, if any.
    pub fn get(&mut self) -> Option<Packet> {
        self.outbox.try_recv().ok()
    }

    /// Every available output in arrival order.
    pub fn get_all(&mut self) -> Vec<Packet> {
        let mut packets = Vec::new();
        while let Ok(packet) = self.outbox.try_recv() {
            packets.push(packet);
        }
        packets
    }

    /// Wait for the next output. `None` once the worker is gone and its
    /// output is exhausted.
    pub async fn recv(&mut self) -> Option<Packet> {
        self.outbox.recv().await
    }

    pub fn is_alive(&mut self) -> bool {
        match &mut self.backend {
            Backend::Process { child, .. } => matches!(child.try_wait(), Ok(None)),
            Backend::Thread { join } => join.as_ref().is_some_and(|j| !j.is_finished()),
        }
    }

    /// Stop the worker: send the stop packet, drain output, join with a
    /// bounded wait and escalate to termination. Calling it again is a no-op.
    pub async fn close(&mut self) {
        if self.terminating {
            return;
        }
        self.terminating = true;

        debug!(worker = %self.name, "sending terminate command");
        if let Some(tx) = self.inbox.take() {
            if tokio::time::timeout(JOIN_TIMEOUT, tx.send(Packet::stop())).await.is_err() {
                warn!(worker = %self.name, "input queue stayed full, closing it instead");
            }
            // Dropping the sender closes the input stream, which also reads as a stop.
        }

        let residual = self.get_all().len();
        debug!(worker = %self.name, residual, "removed residual outputs");

        let deadline = Instant::now() + JOIN_TIMEOUT;
        let drained = match &mut self.backend {
            Backend::Process { child, pumps } => {
                let drained = join_process(child, &mut self.outbox, deadline, &self.name).await;
                for pump in pumps.drain(..) {
                    pump.abort();
                }
                drained
            }
            Backend::Thread { join } => join_thread(join, &mut self.outbox, deadline, &self.name).await,
        };

        let residual = drained + self.get_all().len();
        debug!(worker = %self.name, residual, "worker terminated");
    }

    fn sender(&self) -> Option<&mpsc::Sender<Packet>> {
        if self.terminating { None } else { self.inbox.as_ref() }
    }
}

impl Drop for ProcessHandler {
    fn drop(&mut self) {
        if !self.terminating {
            // The input stream closes with `inbox`; process workers are also
            // killed on drop.
            debug!(worker = %self.name, "handler dropped without close");
        }
    }
}

fn spawn_process(
    program: &PathBuf,
    args: &[String],
    launch: &Launch,
    mut in_rx: mpsc::Receiver<Packet>,
    out_tx: mpsc::Sender<Packet>,
    cpu_affinity: Option<&[usize]>,
) -> Result<Backend, Error> {
    let env = serde_json::to_string(launch).map_err(|e| Error::Serialize(e.to_string()))?;

    let mut child = Command::new(program)
        .args(args)
        .env(WORKER_SPEC_ENV, env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(Error::Spawn)?;

    if let (Some(cores), Some(pid)) = (cpu_affinity, child.id()) {
        set_affinity(pid, cores, &launch.spec.name);
    }

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::Internal("worker stdin was not piped".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Internal("worker stdout was not piped".to_string()))?;

    let name = launch.spec.name.clone();
    let writer = tokio::spawn(async move {
        let mut stdin = BufWriter::new(stdin);
        while let Some(packet) = in_rx.recv().await {
            if let Err(e) = write_packet(&mut stdin, &packet).await {
                debug!(worker = %name, error = %e, "worker stopped reading input");
                break;
            }
        }
    });

    let name = launch.spec.name.clone();
    let reader = tokio::spawn(async move {
        let mut stdout = BufReader::new(stdout);
        loop {
            match read_packet(&mut stdout).await {
                Ok(Some(packet)) => {
                    if out_tx.send(packet).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!(worker = %name, error = %e, "bad output frame");
                    break;
                }
            }
        }
    });

    Ok(Backend::Process {
        child,
        pumps: vec![writer, reader],
    })
}

fn spawn_thread(
    registry: Arc<WorkerRegistry>,
    spec: WorkerSpec,
    shared_memory: Option<SharedMemory>,
    in_rx: mpsc::Receiver<Packet>,
    out_tx: mpsc::Sender<Packet>,
    cpu_affinity: Option<&[usize]>,
) -> Result<Backend, Error> {
    let worker = registry.create(&spec).map_err(|e| Error::Internal(e.to_string()))?;
    let cores = cpu_affinity.map(<[usize]>::to_vec);

    let join = std::thread::Builder::new()
        .name(spec.name.clone())
        .spawn(move || {
            if let Some(cores) = cores {
                // pid 0 is the calling thread
                set_affinity(0, &cores, &spec.name);
            }
            let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(runtime) => runtime,
                Err(e) => {
                    error!(worker = %spec.name, error = %e, "failed to start worker runtime");
                    return WorkerExit::Crashed(e.to_string());
                }
            };
            let ctx = WorkerContext::new(spec.name.clone(), Inbox::new(in_rx), Outbox::new(out_tx), shared_memory);
            runtime.block_on(run_worker(worker, ctx, &spec))
        })
        .map_err(Error::Spawn)?;

    Ok(Backend::Thread { join: Some(join) })
}

async fn join_process(
    child: &mut Child,
    outbox: &mut mpsc::Receiver<Packet>,
    deadline: Instant,
    name: &str,
) -> usize {
    let mut drained = 0;
    loop {
        tokio::select! {
            status = child.wait() => {
                match status {
                    Ok(status) => debug!(worker = %name, %status, "worker exited"),
                    Err(e) => warn!(worker = %name, error = %e, "failed to wait for worker"),
                }
                return drained;
            }
            Some(_) = outbox.recv() => drained += 1,
            _ = sleep_until(deadline) => break,
        }
    }

    warn!(worker = %name, "worker did not exit in time, terminating");
    terminate(child);
    if tokio::time::timeout(JOIN_TIMEOUT, child.wait()).await.is_err() {
        warn!(worker = %name, "worker ignored terminate, killing");
        if let Err(e) = child.kill().await {
            error!(worker = %name, error = %e, "failed to kill worker");
        }
    }
    drained
}

async fn join_thread(
    join: &mut Option<std::thread::JoinHandle<WorkerExit>>,
    outbox: &mut mpsc::Receiver<Packet>,
    deadline: Instant,
    name: &str,
) -> usize {
    let mut drained = 0;
    while join.as_ref().is_some_and(|j| !j.is_finished()) {
        if Instant::now() >= deadline {
            // Threads cannot be killed; leave it detached.
            warn!(worker = %name, "worker thread did not exit in time, detaching");
            join.take();
            return drained;
        }
        drained += std::iter::from_fn(|| outbox.try_recv().ok()).count();
        sleep(Duration::from_millis(5)).await;
    }

    if let Some(handle) = join.take() {
        match handle.join() {
            Ok(exit) => debug!(worker = %name, ?exit, "worker thread exited"),
            Err(_) => error!(worker = %name, "worker thread panicked outside its loop"),
        }
    }
    drained
}

#[cfg(unix)]
fn terminate(child: &mut Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    match child.id() {
        Some(pid) => {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!(pid, error = %e, "SIGTERM failed");
            }
        }
        None => debug!("worker already reaped"),
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "terminate failed");
    }
}

#[cfg(target_os = "linux")]
fn set_affinity(pid: u32, cores: &[usize], name: &str) {
    use nix::sched::{CpuSet, sched_setaffinity};
    use nix::unistd::Pid;

    let mut set = CpuSet::new();
    for &core in cores {
        if let Err(e) = set.set(core) {
            warn!(worker = %name, core, error = %e, "invalid cpu core");
            return;
        }
    }
    match sched_setaffinity(Pid::from_raw(pid as i32), &set) {
        Ok(()) => debug!(worker = %name, ?cores, "moved worker to cpu cores"),
        Err(e) => warn!(worker = %name, ?cores, error = %e, "failed to set cpu affinity"),
    }
}

#[cfg(not(target_os = "linux"))]
fn set_affinity(_pid: u32, cores: &[usize], name: &str) {
    warn!(worker = %name, ?cores, "cpu affinity is only supported on linux");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{Worker, WorkerError};
    use async_trait::async_trait;

    /// Echoes every packet back with the same header.
    struct Echo {
        init_delay: Duration,
    }

    #[async_trait]
    impl Worker for Echo {
        async fn init(&mut self, _ctx: &mut WorkerContext) -> Result<(), WorkerError> {
            sleep(self.init_delay).await;
            Ok(())
        }

        async fn update(&mut self, ctx: &mut WorkerContext, packet: Packet) -> Result<(), WorkerError> {
            let value: u64 = packet.decode()?;
            ctx.outbox.publish(&packet.header, &value).await?;
            Ok(())
        }

        async fn cleanup(&mut self, _ctx: &mut WorkerContext) {}
    }

    fn launcher() -> Launcher {
        let mut registry = WorkerRegistry::new();
        registry.register("echo", |_spec| {
            Ok(Box::new(Echo {
                init_delay: Duration::ZERO,
            }) as Box<dyn Worker>)
        });
        registry.register("slow-echo", |_spec| {
            Ok(Box::new(Echo {
                init_delay: Duration::from_millis(300),
            }) as Box<dyn Worker>)
        });
        Launcher::thread(registry)
    }

    async fn next(handler: &mut ProcessHandler) -> Packet {
        tokio::time::timeout(Duration::from_secs(5), handler.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn thread_worker_echoes_in_order() {
        let spec = WorkerSpec::new("echo", "echo-thread").with_process_all_updates(true);
        let mut handler = ProcessHandler::setup(&launcher(), spec, None, None).await.unwrap();
        assert!(handler.is_alive());

        for i in 0..5u64 {
            assert!(handler.put("n", &i).unwrap());
        }
        for i in 0..5u64 {
            assert_eq!(next(&mut handler).await.decode::<u64>().unwrap(), i);
        }

        handler.close().await;
        assert!(!handler.is_alive());
    }

    #[tokio::test]
    async fn close_twice_is_a_no_op() {
        let spec = WorkerSpec::new("echo", "echo-close");
        let mut handler = ProcessHandler::setup(&launcher(), spec, None, None).await.unwrap();
        handler.put("n", &1u64).unwrap();

        handler.close().await;
        handler.close().await;
        assert!(!handler.is_alive());
        assert!(!handler.put("n", &2u64).unwrap());
        assert!(matches!(
            handler.put_wait("n", &3u64, Some(Duration::from_millis(10))).await,
            Err(Error::NotRunning)
        ));
    }

    #[tokio::test]
    async fn full_input_queue_drops_non_blocking_puts() {
        let spec = WorkerSpec::new("slow-echo", "echo-full").with_capacities(1, 4);
        let mut handler = ProcessHandler::setup(&launcher(), spec, None, None).await.unwrap();

        // Nothing reads the input queue while the worker initializes.
        assert!(handler.put("n", &1u64).unwrap());
        assert!(!handler.put("n", &2u64).unwrap());

        assert_eq!(next(&mut handler).await.decode::<u64>().unwrap(), 1);
        handler.close().await;
        assert!(handler.get().is_none());
    }

    #[tokio::test]
    async fn unknown_kind_fails_setup() {
        let spec = WorkerSpec::new("nope", "x");
        assert!(ProcessHandler::setup(&launcher(), spec, None, None).await.is_err());
    }

    #[tokio::test]
    async fn missing_program_fails_setup() {
        let launcher = Launcher::process("/nonexistent/ferrite-worker-binary");
        let err = ProcessHandler::setup(&launcher, WorkerSpec::new("echo", "x"), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Spawn(_)));
    }
}
