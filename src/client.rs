//! Rollout side of a run: simulate, hand trajectories to a finalizer worker,
//! follow the server's model updates and react to its status changes.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, RunConfig};
use crate::control::{ControlError, CoordinationClient, EnvSpaces, Status};
use crate::env::{Env, EnvError};
use crate::experience::{CollectionBudget, Collector, ExperienceError, Trajectory};
use crate::model::{Model, ModelError};
use crate::runtime::{Launcher, ProcessHandler, WorkerSpec};
use crate::workers::{FINALIZER_KIND, FLUSH_DATA, FinalizerInit, INITIALIZATION, StoreConnector, TRAJECTORY};

const STORE_RETRY: Duration = Duration::from_secs(1);
const FINALIZER_LOOP_WAIT: Duration = Duration::from_millis(100);

pub type EnvFactory = Box<dyn Fn(&RunConfig) -> Result<Box<dyn Env>, EnvError> + Send + Sync>;
pub type PolicyFactory = Box<dyn Fn(&RunConfig, &EnvSpaces) -> Result<Box<dyn Model>, ModelError> + Send + Sync>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Control(#[from] ControlError),

    #[error(transparent)]
    Experience(#[from] ExperienceError),

    #[error(transparent)]
    Runtime(#[from] crate::runtime::Error),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Env(#[from] EnvError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("server moved to {0:?} during configuration")]
    Interrupted(Option<Status>),

    #[error("trajectory finalizer exited")]
    FinalizerGone,

    #[error("collection failed: {0}")]
    Collection(String),
}

impl ClientError {
    pub fn is_unreachable(&self) -> bool {
        match self {
            Self::Control(e) => e.is_unreachable(),
            Self::Experience(ExperienceError::Control(e)) => e.is_unreachable(),
            _ => false,
        }
    }

    /// Faults a fresh configuration can recover from.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Control(e) => e.is_transport(),
            Self::Experience(ExperienceError::Control(e)) => e.is_transport(),
            Self::Interrupted(_) | Self::FinalizerGone => true,
            _ => false,
        }
    }
}

/// Environment and policy. Moved onto a blocking thread for each collection.
struct Rollout {
    collector: Collector,
    policy: Box<dyn Model>,
}

type Collected = (Rollout, Result<(Vec<Trajectory>, Vec<f32>), ExperienceError>);

struct Collecting {
    cancel: Arc<AtomicBool>,
    task: JoinHandle<Collected>,
}

struct Session {
    client: CoordinationClient,
    cfg: RunConfig,
    spaces: EnvSpaces,
    rollout: Option<Rollout>,
    collecting: Option<Collecting>,
    finalizer: ProcessHandler,
}

impl Session {
    /// Start a collection unless one is already in flight, then wait for it.
    ///
    /// Dropping the returned future leaves the collection running; it is
    /// picked up again by the next call or cancelled by teardown.
    async fn collect(&mut self) -> Result<(Vec<Trajectory>, Vec<f32>), ClientError> {
        if self.collecting.is_none() {
            let Some(mut rollout) = self.rollout.take() else {
                return Err(ClientError::Collection("environment lost to an earlier failure".to_string()));
            };
            let budget = CollectionBudget::duration(Duration::from_secs_f64(self.cfg.client.collection_seconds));
            let cancel = Arc::new(AtomicBool::new(false));
            let flag = cancel.clone();
            let task = tokio::task::spawn_blocking(move || {
                let result = rollout
                    .collector
                    .collect_until(rollout.policy.as_mut(), budget, &flag)
                    .map(|trajectories| (trajectories, rollout.collector.take_episode_rewards()));
                (rollout, result)
            });
            self.collecting = Some(Collecting { cancel, task });
        }

        let Some(collecting) = self.collecting.as_mut() else {
            return Ok((Vec::new(), Vec::new()));
        };
        let joined = (&mut collecting.task).await;
        self.collecting = None;
        let (rollout, result) = joined.map_err(|e| ClientError::Collection(e.to_string()))?;
        self.rollout = Some(rollout);
        result.map_err(ClientError::from)
    }

    /// Cancel any collection in flight and take back the rollout. Episode
    /// rewards it finished are returned for the final flush.
    async fn stop_collecting(&mut self) -> Vec<f32> {
        let mut rewards = Vec::new();
        if let Some(collecting) = self.collecting.take() {
            collecting.cancel.store(true, Ordering::Relaxed);
            match collecting.task.await {
                Ok((rollout, result)) => {
                    if let Ok((_, finished)) = result {
                        rewards = finished;
                    }
                    self.rollout = Some(rollout);
                }
                Err(e) => warn!(error = %e, "collection task failed during teardown"),
            }
        }
        if let Some(rollout) = self.rollout.as_mut() {
            rewards.extend(rollout.collector.take_episode_rewards());
        }
        rewards
    }
}

/// One rollout client.
///
/// Each [`step`](Self::step) checks the server status, collects for
/// `client.collection_seconds`, forwards the trajectories and episode rewards
/// to the finalizer worker and applies the newest policy parameters. The
/// environment survives reconfiguration and is only rebuilt on reset.
///
/// Collection runs on tokio's blocking pool, so a stop signal is noticed
/// while the environment is still being stepped.
pub struct RolloutClient {
    connect: StoreConnector,
    launcher: Launcher,
    make_env: EnvFactory,
    make_policy: PolicyFactory,
    env: Option<Box<dyn Env>>,
    session: Option<Session>,
}

impl std::fmt::Debug for RolloutClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RolloutClient")
            .field("launcher", &self.launcher)
            .field("configured", &self.session.is_some())
            .field("epoch", &self.session.as_ref().and_then(|s| s.client.current_epoch()))
            .finish()
    }
}

impl RolloutClient {
    pub fn new(connect: StoreConnector, launcher: Launcher, make_env: EnvFactory, make_policy: PolicyFactory) -> Self {
        Self {
            connect,
            launcher,
            make_env,
            make_policy,
            env: None,
            session: None,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.session.is_some()
    }

    /// Epoch of the policy currently in use.
    pub fn current_epoch(&self) -> Option<u64> {
        self.session.as_ref().and_then(|s| s.client.current_epoch())
    }

    pub async fn step(&mut self) -> Result<(), ClientError> {
        self.check_server_status().await?;
        self.collect().await?;
        self.update_models().await
    }

    /// Step until `stop` resolves. Transport faults trigger a fresh
    /// configuration; an unreachable store is retried indefinitely. Anything
    /// else tears the client down and is returned.
    pub async fn run_until<F: Future<Output = ()>>(&mut self, stop: F) -> Result<(), ClientError> {
        tokio::pin!(stop);
        let result = loop {
            let outcome = tokio::select! {
                () = &mut stop => None,
                result = self.step() => Some(result),
            };
            match outcome {
                None => break Ok(()),
                Some(Ok(())) => {}
                Some(Err(e)) => {
                    if let Err(e) = self.recover(e).await {
                        break Err(e);
                    }
                }
            }
        };
        self.cleanup().await;
        result
    }

    /// Step until ctrl-c.
    pub async fn run(&mut self) -> Result<(), ClientError> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            info!("interrupted, shutting down");
        })
        .await
    }

    async fn recover(&mut self, e: ClientError) -> Result<(), ClientError> {
        if e.is_unreachable() {
            warn!(error = %e, "coordination store unreachable, retrying");
            self.teardown(true).await;
            tokio::time::sleep(STORE_RETRY).await;
            Ok(())
        } else if e.is_recoverable() {
            warn!(error = %e, "reconfiguring after fault");
            self.teardown(true).await;
            Ok(())
        } else {
            error!(error = %e, "client failed");
            Err(e)
        }
    }

    async fn check_server_status(&mut self) -> Result<(), ClientError> {
        let Some(client) = self.session.as_ref().map(|s| &s.client) else {
            return self.reconfigure().await;
        };

        let status = client.check_server_status().await?;
        match status {
            None | Some(Status::Reset) => self.reset().await,
            Some(status) if status.requires_teardown() => self.reconfigure().await,
            Some(Status::AwaitingEnvSpaces) => self.transmit_env_spaces().await,
            Some(_) => Ok(()),
        }
    }

    async fn collect(&mut self) -> Result<(), ClientError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        if !session.finalizer.is_alive() {
            return Err(ClientError::FinalizerGone);
        }

        let (trajectories, rewards) = session.collect().await?;

        if !trajectories.is_empty() && !session.finalizer.put(TRAJECTORY, &trajectories)? {
            warn!(dropped = trajectories.len(), "finalizer queue full, trajectories dropped");
        }
        if !session.finalizer.put(FLUSH_DATA, &rewards)? {
            warn!("finalizer queue full, flush dropped");
        }
        debug!(trajectories = trajectories.len(), episodes = rewards.len(), "collected");
        Ok(())
    }

    async fn update_models(&mut self) -> Result<(), ClientError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let Some(rollout) = session.rollout.as_mut() else {
            return Ok(());
        };
        if let Some((update, epoch)) = session.client.get_latest_update().await? {
            rollout.policy.set_trainable_flat(&update.policy_params)?;
            debug!(epoch, "applied policy update");
        }
        Ok(())
    }

    /// Publish this client's env spaces if no other client did first.
    pub async fn transmit_env_spaces(&mut self) -> Result<(), ClientError> {
        let Some((client, spaces)) = self.session.as_ref().map(|s| (&s.client, &s.spaces)) else {
            return Ok(());
        };
        if client.transmit_env_spaces(spaces).await? {
            info!(?spaces, "transmitted env spaces");
        }
        Ok(())
    }

    /// Drop the environment and configure from scratch.
    pub async fn reset(&mut self) -> Result<(), ClientError> {
        info!("resetting client");
        self.teardown(false).await;
        self.configure().await
    }

    /// Configure again, keeping the environment.
    pub async fn reconfigure(&mut self) -> Result<(), ClientError> {
        info!("reconfiguring client");
        self.teardown(true).await;
        self.configure().await
    }

    /// Connect, wait for the server's config, build the policy and start the
    /// finalizer. Returns once the first model update has been applied.
    pub async fn configure(&mut self) -> Result<(), ClientError> {
        let store = (self.connect)().await.map_err(ControlError::from)?;
        let mut client = CoordinationClient::new(store);
        let cfg = client.get_cfg().await?;

        let env = match self.env.take() {
            Some(env) => env,
            None => (self.make_env)(&cfg)?,
        };
        let spaces = EnvSpaces::new(env.observation_shape(), env.action_shape());
        let collector = Collector::new(env);
        let mut policy = match (self.make_policy)(&cfg, &spaces) {
            Ok(policy) => policy,
            Err(e) => {
                self.env = Some(collector.into_env());
                return Err(e.into());
            }
        };

        if let Err(e) = Self::await_first_update(&mut client, &spaces, policy.as_mut(), &cfg).await {
            self.env = Some(collector.into_env());
            return Err(e);
        }

        let spec = WorkerSpec::new(FINALIZER_KIND, "client_trajectory_finalizer")
            .with_loop_wait(FINALIZER_LOOP_WAIT)
            .with_process_all_updates(true);
        let mut finalizer = match ProcessHandler::setup(&self.launcher, spec, None, None).await {
            Ok(finalizer) => finalizer,
            Err(e) => {
                self.env = Some(collector.into_env());
                return Err(e.into());
            }
        };
        let init = FinalizerInit {
            config: cfg.to_json()?,
            spaces: spaces.clone(),
        };
        finalizer.put(INITIALIZATION, &init)?;

        info!(epoch = ?client.current_epoch(), "client configured");
        self.session = Some(Session {
            client,
            cfg,
            spaces,
            rollout: Some(Rollout { collector, policy }),
            collecting: None,
            finalizer,
        });
        Ok(())
    }

    async fn await_first_update(
        client: &mut CoordinationClient,
        spaces: &EnvSpaces,
        policy: &mut dyn Model,
        cfg: &RunConfig,
    ) -> Result<(), ClientError> {
        client.transmit_env_spaces(spaces).await?;
        info!("waiting for initial model");
        loop {
            if let Some((update, epoch)) = client.get_latest_update().await? {
                policy.set_trainable_flat(&update.policy_params)?;
                debug!(epoch, "applied initial policy");
                return Ok(());
            }
            match client.check_server_status().await? {
                Some(Status::Running | Status::AwaitingEnvSpaces) => {}
                status => return Err(ClientError::Interrupted(status)),
            }
            tokio::time::sleep(cfg.polling.status_interval()).await;
        }
    }

    /// Flush and stop the finalizer, then release the environment.
    pub async fn cleanup(&mut self) {
        self.teardown(false).await;
        info!("client shut down");
    }

    async fn teardown(&mut self, keep_env: bool) {
        if let Some(mut session) = self.session.take() {
            let rewards = session.stop_collecting().await;
            if let Err(e) = session.finalizer.put(FLUSH_DATA, &rewards) {
                debug!(error = %e, "final flush not delivered");
            }
            session.finalizer.close().await;
            self.env = session.rollout.map(|rollout| rollout.collector.into_env());
        }

        if !keep_env {
            if let Some(mut env) = self.env.take() {
                if let Err(e) = env.close() {
                    warn!(error = %e, "failed to close env");
                }
            }
        }
    }
}
