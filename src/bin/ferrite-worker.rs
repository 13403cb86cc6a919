//! Host binary for process-backed workers. A `ProcessHandler` started with
//! `Launcher::host_binary` runs this with the worker spec in its environment.

use std::process::ExitCode;

use ferrite::config::StoreConfig;
use ferrite::runtime::{WorkerRegistry, worker_main};
use ferrite::workers::{linear_value_model, redis_connector, register_workers};

fn main() -> ExitCode {
    let store = match StoreConfig::from_env() {
        Ok(store) => store,
        Err(e) => {
            ferrite::logging::init();
            tracing::error!(error = %e, "invalid store settings");
            return ExitCode::FAILURE;
        }
    };

    let mut registry = WorkerRegistry::new();
    register_workers(&mut registry, redis_connector(store), linear_value_model());
    worker_main(&registry)
}
