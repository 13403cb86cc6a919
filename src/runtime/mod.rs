//! Background workers with two bounded queues each.
//!
//! An owner starts a worker through a [`ProcessHandler`], sends it tagged
//! [`Packet`]s and collects whatever the worker publishes. The worker side
//! implements [`Worker`] and is driven by [`run_worker`].

pub mod codec;
pub mod error;
pub mod handle;
pub mod packet;
pub mod registry;
pub mod shared_memory;
pub mod worker;

pub use error::{Error, WorkerError};
pub use handle::{JOIN_TIMEOUT, Launcher, ProcessHandler};
pub use packet::{Packet, STOP_HEADER};
pub use registry::{WORKER_SPEC_ENV, WorkerFactory, WorkerRegistry, is_worker_process, worker_main};
pub use shared_memory::{Element, ElementKind, SharedMemory, SharedMemoryDescriptor};
pub use worker::{Inbox, Outbox, Worker, WorkerContext, WorkerExit, WorkerSpec, run_worker};
