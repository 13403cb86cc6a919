//! Runs a worker in a child process over stdin/stdout. The test binary
//! re-executes itself as the worker host, so it runs without the libtest
//! harness.

use std::process::ExitCode;
use std::time::Duration;

use async_trait::async_trait;
use ferrite::runtime::{
    Launcher, Packet, ProcessHandler, Worker, WorkerContext, WorkerError, WorkerRegistry, WorkerSpec,
    is_worker_process, worker_main,
};

const DOUBLER: &str = "doubler";

struct Doubler;

#[async_trait]
impl Worker for Doubler {
    async fn init(&mut self, _ctx: &mut WorkerContext) -> Result<(), WorkerError> {
        Ok(())
    }

    async fn update(&mut self, ctx: &mut WorkerContext, packet: Packet) -> Result<(), WorkerError> {
        let values: Vec<f32> = packet.decode()?;
        let doubled: Vec<f32> = values.iter().map(|v| v * 2.0).collect();
        ctx.outbox.publish(&packet.header, &doubled).await?;
        Ok(())
    }

    async fn cleanup(&mut self, _ctx: &mut WorkerContext) {}
}

fn registry() -> WorkerRegistry {
    let mut registry = WorkerRegistry::new();
    registry.register(DOUBLER, |_spec| Ok(Box::new(Doubler) as Box<dyn Worker>));
    registry
}

async fn exercise() -> Result<(), String> {
    let launcher = Launcher::current_exe().map_err(|e| e.to_string())?;
    let spec = WorkerSpec::new(DOUBLER, "doubler-process").with_process_all_updates(true);
    let mut handler = ProcessHandler::setup(&launcher, spec, None, None)
        .await
        .map_err(|e| e.to_string())?;

    for i in 0..3 {
        let sent = handler
            .put(&format!("batch-{i}"), &vec![i as f32, 1.5])
            .map_err(|e| e.to_string())?;
        if !sent {
            return Err(format!("put {i} was dropped"));
        }
    }

    for i in 0..3 {
        let packet = tokio::time::timeout(Duration::from_secs(10), handler.recv())
            .await
            .map_err(|_| format!("timed out waiting for reply {i}"))?
            .ok_or_else(|| format!("worker exited before reply {i}"))?;
        if packet.header != format!("batch-{i}") {
            return Err(format!("reply {i} has header {}", packet.header));
        }
        let values: Vec<f32> = packet.decode().map_err(|e| e.to_string())?;
        if values != vec![2.0 * i as f32, 3.0] {
            return Err(format!("reply {i} carried {values:?}"));
        }
    }

    handler.close().await;
    handler.close().await;
    if handler.is_alive() {
        return Err("worker still alive after close".to_string());
    }
    Ok(())
}

fn main() -> ExitCode {
    if is_worker_process() {
        return worker_main(&registry());
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(exercise()) {
        Ok(()) => {
            println!("process_worker ... ok");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("process_worker ... FAILED: {e}");
            ExitCode::FAILURE
        }
    }
}
