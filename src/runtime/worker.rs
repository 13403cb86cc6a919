//! The worker side of the framework: lifecycle trait, queues and the loop.

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tracing::{debug, error, info};

use crate::runtime::error::{Error, WorkerError};
use crate::runtime::packet::Packet;
use crate::runtime::shared_memory::SharedMemory;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// How to build and drive one worker. Travels to the worker host, so it
/// must stay serializable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpec {
    /// Registry tag used to construct the worker.
    pub kind: String,
    pub name: String,
    /// Fixed sleep at the end of every loop iteration.
    pub loop_wait_ms: Option<u64>,
    /// Hand every pending packet to `update` each iteration instead of one.
    pub process_all_updates: bool,
    pub inbox_capacity: usize,
    pub outbox_capacity: usize,
    /// Opaque worker-specific bytes, passed to the factory.
    pub args: Vec<u8>,
}

impl WorkerSpec {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            loop_wait_ms: None,
            process_all_updates: false,
            inbox_capacity: DEFAULT_QUEUE_CAPACITY,
            outbox_capacity: DEFAULT_QUEUE_CAPACITY,
            args: Vec::new(),
        }
    }

    pub fn with_loop_wait(mut self, wait: Duration) -> Self {
        self.loop_wait_ms = Some(wait.as_millis() as u64);
        self
    }

    pub fn with_process_all_updates(mut self, all: bool) -> Self {
        self.process_all_updates = all;
        self
    }

    pub fn with_capacities(mut self, inbox: usize, outbox: usize) -> Self {
        self.inbox_capacity = inbox.max(1);
        self.outbox_capacity = outbox.max(1);
        self
    }

    pub fn with_args<T: Serialize>(mut self, args: &T) -> Result<Self, Error> {
        self.args = bincode::serialize(args).map_err(|e| Error::Serialize(e.to_string()))?;
        Ok(self)
    }

    pub fn args<T: serde::de::DeserializeOwned>(&self) -> Result<T, Error> {
        bincode::deserialize(&self.args).map_err(|e| Error::Deserialize(e.to_string()))
    }

    fn loop_wait(&self) -> Option<Duration> {
        self.loop_wait_ms.filter(|&ms| ms > 0).map(Duration::from_millis)
    }
}

/// Lifecycle hooks of a background worker.
///
/// `cleanup` runs exactly once whenever the loop ends: on a stop packet, on
/// an error from any other hook, and after a panic. It is the only shutdown
/// notification a worker gets.
#[async_trait]
pub trait Worker: Send {
    async fn init(&mut self, ctx: &mut WorkerContext) -> Result<(), WorkerError>;

    async fn update(&mut self, ctx: &mut WorkerContext, packet: Packet) -> Result<(), WorkerError>;

    async fn step(&mut self, _ctx: &mut WorkerContext) -> Result<(), WorkerError> {
        Ok(())
    }

    async fn publish(&mut self, _ctx: &mut WorkerContext) -> Result<(), WorkerError> {
        Ok(())
    }

    async fn cleanup(&mut self, ctx: &mut WorkerContext);
}

/// Inbound queue as seen by the worker.
#[derive(Debug)]
pub struct Inbox {
    rx: mpsc::Receiver<Packet>,
}

impl Inbox {
    pub fn new(rx: mpsc::Receiver<Packet>) -> Self {
        Self { rx }
    }

    /// Next pending packet, if any. An owner that went away reads as a stop.
    pub fn check_for_update(&mut self) -> Option<Packet> {
        match self.rx.try_recv() {
            Ok(packet) => Some(packet),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Packet::stop()),
        }
    }

    /// Every pending packet, stopping early after a stop packet.
    pub fn drain(&mut self) -> Vec<Packet> {
        let mut packets = Vec::new();
        while let Some(packet) = self.check_for_update() {
            let stop = packet.is_stop();
            packets.push(packet);
            if stop {
                break;
            }
        }
        packets
    }

    /// Block until a packet with `header` arrives, discarding anything else.
    pub async fn wait_for(&mut self, header: &str) -> Result<Packet, WorkerError> {
        debug!(header, "waiting for initialization");
        loop {
            match self.rx.recv().await {
                Some(packet) if packet.header == header => return Ok(packet),
                Some(packet) if packet.is_stop() => return Err(WorkerError::Terminated(header.to_string())),
                Some(packet) => debug!(expected = header, got = %packet.header, "ignoring packet before initialization"),
                None => return Err(WorkerError::Terminated(header.to_string())),
            }
        }
    }

    /// Resolve once the owner asks for a stop or goes away. Anything else
    /// received meanwhile is discarded, so only race this against work that
    /// ignores updates.
    pub async fn stopped(&mut self) {
        while let Some(packet) = self.rx.recv().await {
            if packet.is_stop() {
                return;
            }
            debug!(header = %packet.header, "ignoring packet while busy");
        }
    }
}

/// Outbound queue as seen by the worker.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Packet>,
    full_backoff: Duration,
}

impl Outbox {
    pub fn new(tx: mpsc::Sender<Packet>) -> Self {
        Self {
            tx,
            full_backoff: Duration::from_millis(100),
        }
    }

    /// Never blocks on the queue. Returns `false` when the packet was dropped
    /// because the owner is behind or gone.
    pub async fn publish<T: Serialize + ?Sized>(&self, header: &str, data: &T) -> Result<bool, WorkerError> {
        let packet = Packet::new(header, data)?;
        match self.tx.try_send(packet) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => {
                debug!(header, "unable to publish, output queue is full");
                tokio::time::sleep(self.full_backoff).await;
                Ok(false)
            }
            Err(TrySendError::Closed(_)) => {
                debug!(header, "unable to publish, owner is gone");
                Ok(false)
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tx.capacity() == self.tx.max_capacity()
    }
}

pub struct WorkerContext {
    pub name: String,
    pub inbox: Inbox,
    pub outbox: Outbox,
    pub shared_memory: Option<SharedMemory>,
}

impl WorkerContext {
    pub fn new(name: impl Into<String>, inbox: Inbox, outbox: Outbox, shared_memory: Option<SharedMemory>) -> Self {
        Self {
            name: name.into(),
            inbox,
            outbox,
            shared_memory,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    Stopped,
    Crashed(String),
}

impl WorkerExit {
    pub fn code(&self) -> u8 {
        match self {
            WorkerExit::Stopped => 0,
            WorkerExit::Crashed(_) => 1,
        }
    }
}

/// Run `worker` until it is told to stop or fails, then clean it up.
pub async fn run_worker(mut worker: Box<dyn Worker>, mut ctx: WorkerContext, spec: &WorkerSpec) -> WorkerExit {
    let name = ctx.name.clone();
    let outcome = AssertUnwindSafe(drive(worker.as_mut(), &mut ctx, spec))
        .catch_unwind()
        .await;

    let exit = match outcome {
        Ok(Ok(())) | Ok(Err(WorkerError::Terminated(_))) => {
            info!(worker = %name, "worker received stop signal");
            WorkerExit::Stopped
        }
        Ok(Err(e)) => {
            error!(worker = %name, error = %e, "worker has crashed");
            WorkerExit::Crashed(e.to_string())
        }
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(worker = %name, panic = %msg, "worker has crashed");
            WorkerExit::Crashed(msg)
        }
    };

    debug!(worker = %name, "cleaning up");
    worker.cleanup(&mut ctx).await;
    debug!(worker = %name, "exiting");
    exit
}

async fn drive(worker: &mut dyn Worker, ctx: &mut WorkerContext, spec: &WorkerSpec) -> Result<(), WorkerError> {
    worker.init(ctx).await?;
    debug!(worker = %ctx.name, "initialized");

    let wait = spec.loop_wait();
    loop {
        let updates = if spec.process_all_updates {
            ctx.inbox.drain()
        } else {
            ctx.inbox.check_for_update().into_iter().collect()
        };

        for packet in updates {
            if packet.is_stop() {
                return Ok(());
            }
            debug!(worker = %ctx.name, header = %packet.header, "got update");
            worker.update(ctx, packet).await?;
        }

        worker.step(ctx).await?;
        worker.publish(ctx).await?;

        match wait {
            Some(wait) => tokio::time::sleep(wait).await,
            None => tokio::task::yield_now().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        updates: Vec<String>,
        steps: usize,
        fail_on: Option<String>,
        panic_on: Option<String>,
        cleanups: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Worker for Recorder {
        async fn init(&mut self, _ctx: &mut WorkerContext) -> Result<(), WorkerError> {
            Ok(())
        }

        async fn update(&mut self, ctx: &mut WorkerContext, packet: Packet) -> Result<(), WorkerError> {
            if self.fail_on.as_deref() == Some(packet.header.as_str()) {
                return Err(WorkerError::UnexpectedPacket(packet.header));
            }
            if self.panic_on.as_deref() == Some(packet.header.as_str()) {
                panic!("boom");
            }
            ctx.outbox.publish("echo", &packet.header).await?;
            self.updates.push(packet.header);
            Ok(())
        }

        async fn step(&mut self, _ctx: &mut WorkerContext) -> Result<(), WorkerError> {
            self.steps += 1;
            Ok(())
        }

        async fn cleanup(&mut self, _ctx: &mut WorkerContext) {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn context(capacity: usize) -> (mpsc::Sender<Packet>, mpsc::Receiver<Packet>, WorkerContext) {
        let (in_tx, in_rx) = mpsc::channel(capacity);
        let (out_tx, out_rx) = mpsc::channel(capacity);
        let ctx = WorkerContext::new("recorder", Inbox::new(in_rx), Outbox::new(out_tx), None);
        (in_tx, out_rx, ctx)
    }

    #[tokio::test]
    async fn stop_packet_ends_loop_and_runs_cleanup() {
        let (tx, mut rx, ctx) = context(8);
        let cleanups = Arc::new(AtomicUsize::new(0));
        let worker = Recorder {
            cleanups: cleanups.clone(),
            ..Recorder::default()
        };

        tx.send(Packet::new("a", &()).unwrap()).await.unwrap();
        tx.send(Packet::new("b", &()).unwrap()).await.unwrap();
        tx.send(Packet::stop()).await.unwrap();

        let spec = WorkerSpec::new("recorder", "recorder");
        let exit = run_worker(Box::new(worker), ctx, &spec).await;

        assert_eq!(exit, WorkerExit::Stopped);
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
        assert_eq!(rx.recv().await.unwrap().decode::<String>().unwrap(), "a");
        assert_eq!(rx.recv().await.unwrap().decode::<String>().unwrap(), "b");
    }

    #[tokio::test]
    async fn errors_are_contained_and_still_clean_up() {
        let (tx, _rx, ctx) = context(8);
        let cleanups = Arc::new(AtomicUsize::new(0));
        let worker = Recorder {
            fail_on: Some("bad".into()),
            cleanups: cleanups.clone(),
            ..Recorder::default()
        };
        tx.send(Packet::new("bad", &()).unwrap()).await.unwrap();

        let exit = run_worker(Box::new(worker), ctx, &WorkerSpec::new("recorder", "recorder")).await;
        assert!(matches!(exit, WorkerExit::Crashed(_)));
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panics_are_contained_and_still_clean_up() {
        let (tx, _rx, ctx) = context(8);
        let cleanups = Arc::new(AtomicUsize::new(0));
        let worker = Recorder {
            panic_on: Some("explode".into()),
            cleanups: cleanups.clone(),
            ..Recorder::default()
        };
        tx.send(Packet::new("explode", &()).unwrap()).await.unwrap();

        let exit = run_worker(Box::new(worker), ctx, &WorkerSpec::new("recorder", "recorder")).await;
        assert_eq!(exit, WorkerExit::Crashed("boom".to_string()));
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropped_owner_reads_as_stop() {
        let (tx, _rx, ctx) = context(8);
        drop(tx);
        let exit = run_worker(Box::new(Recorder::default()), ctx, &WorkerSpec::new("recorder", "recorder")).await;
        assert_eq!(exit, WorkerExit::Stopped);
    }

    #[tokio::test]
    async fn wait_for_skips_other_headers() {
        let (tx, _rx, mut ctx) = context(8);
        tx.send(Packet::new("noise", &1u8).unwrap()).await.unwrap();
        tx.send(Packet::new("initialization", &7u32).unwrap()).await.unwrap();

        let packet = ctx.inbox.wait_for("initialization").await.unwrap();
        assert_eq!(packet.decode::<u32>().unwrap(), 7);

        tx.send(Packet::stop()).await.unwrap();
        assert!(matches!(
            ctx.inbox.wait_for("initialization").await,
            Err(WorkerError::Terminated(_))
        ));
    }

    #[tokio::test]
    async fn full_outbox_drops_instead_of_blocking() {
        let (_tx, mut rx, ctx) = context(1);
        assert!(ctx.outbox.is_empty());
        assert!(ctx.outbox.publish("first", &1u8).await.unwrap());
        assert!(!ctx.outbox.is_empty());
        assert!(!ctx.outbox.publish("second", &2u8).await.unwrap());

        assert_eq!(rx.recv().await.unwrap().header, "first");
        assert!(ctx.outbox.is_empty());
    }

    #[tokio::test]
    async fn drain_stops_at_stop_packet() {
        let (tx, _rx, mut ctx) = context(8);
        for header in ["a", "b"] {
            tx.send(Packet::new(header, &()).unwrap()).await.unwrap();
        }
        tx.send(Packet::stop()).await.unwrap();
        tx.send(Packet::new("after", &()).unwrap()).await.unwrap();

        let drained = ctx.inbox.drain();
        assert_eq!(drained.len(), 3);
        assert!(drained[2].is_stop());
        assert_eq!(ctx.inbox.check_for_update().unwrap().header, "after");
    }
}
