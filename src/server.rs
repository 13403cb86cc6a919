//! Training side of a run: publish the config, wait for env spaces, then
//! alternate between learning from shuffled experience and publishing the
//! resulting parameters.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::{ConfigError, RunConfig};
use crate::control::{ControlError, CoordinationServer, Status, Store};
use crate::experience::{ExperienceError, ParallelExperienceManager};
use crate::learner::{LearnReport, Learner, LearnerError};
use crate::runtime::Launcher;

/// Weight of the running policy reward against each new episode reward.
const POLICY_REWARD_DECAY: f64 = 0.99;

/// Shuffler restarts allowed without a completed epoch in between.
const MAX_SHUFFLER_RESTARTS: u32 = 3;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Control(#[from] ControlError),

    #[error(transparent)]
    Experience(#[from] ExperienceError),

    #[error(transparent)]
    Learner(#[from] LearnerError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to publish model update for epoch {epoch}: {source}")]
    Publish {
        epoch: u64,
        #[source]
        source: ControlError,
    },

    #[error("training server is not configured")]
    NotConfigured,
}

impl ServerError {
    /// Store faults and undecodable peer data. Publishing failures are never
    /// transport faults here; they end the run.
    pub fn is_transport(&self) -> bool {
        match self {
            ServerError::Control(e) | ServerError::Experience(ExperienceError::Control(e)) => e.is_transport(),
            _ => false,
        }
    }
}

/// What one training epoch did.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochReport {
    pub epoch: u64,
    pub timesteps: usize,
    pub cumulative_timesteps: u64,
    pub policy_reward: Option<f64>,
    pub steps_per_second: f64,
    pub learn: LearnReport,
    pub elapsed: Duration,
}

struct Training {
    cfg: RunConfig,
    server: CoordinationServer,
    experience: ParallelExperienceManager,
    epoch: u64,
    cumulative_timesteps: u64,
    policy_reward: Option<f64>,
}

/// Drives a [`Learner`] from client experience.
///
/// Epoch 0 is published before clients are let in; every later epoch follows
/// one call to [`step`](Self::step). Failing to publish an update is fatal.
pub struct TrainingServer {
    store: Arc<dyn Store>,
    launcher: Launcher,
    learner: Box<dyn Learner>,
    training: Option<Training>,
}

impl std::fmt::Debug for TrainingServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainingServer")
            .field("launcher", &self.launcher)
            .field("epoch", &self.epoch())
            .field("cumulative_timesteps", &self.cumulative_timesteps())
            .finish()
    }
}

impl TrainingServer {
    pub fn new(store: Arc<dyn Store>, launcher: Launcher, learner: Box<dyn Learner>) -> Self {
        Self {
            store,
            launcher,
            learner,
            training: None,
        }
    }

    /// Next epoch to be trained.
    pub fn epoch(&self) -> Option<u64> {
        self.training.as_ref().map(|t| t.epoch)
    }

    pub fn cumulative_timesteps(&self) -> u64 {
        self.training.as_ref().map_or(0, |t| t.cumulative_timesteps)
    }

    pub fn policy_reward(&self) -> Option<f64> {
        self.training.as_ref().and_then(|t| t.policy_reward)
    }

    /// Take over the store, publish `cfg` and block until a client reports
    /// its env spaces. Returns once epoch 0 is published and the server is
    /// RUNNING.
    pub async fn configure(&mut self, cfg: RunConfig) -> Result<(), ServerError> {
        cfg.validate()?;
        let mut server = CoordinationServer::new(self.store.clone(), cfg.experience.max_buffer_size)
            .with_polling(cfg.polling.clone());

        server.connect(true, true).await?;
        server.set_status(Status::Reconfigure).await?;
        tokio::time::sleep(cfg.polling.transition_grace()).await;
        server.push_config(&cfg).await?;
        server.set_reward_stats(0.0, 1.0).await?;

        info!("waiting for env spaces");
        let spaces = server.get_env_spaces().await?;
        self.learner.configure(&cfg, &spaces).await?;

        let mut experience = ParallelExperienceManager::start(&self.launcher, &cfg).await?;
        let update = self.learner.snapshot()?;
        if let Err(source) = server.push_update(&update, 0).await {
            experience.cleanup().await;
            return Err(ServerError::Publish { epoch: 0, source });
        }
        server.signal_ready().await?;

        info!(
            timesteps_per_update = cfg.timesteps_per_update(),
            batch_size = cfg.policy_optimizer.batch_size,
            "training server ready"
        );
        self.training = Some(Training {
            cfg,
            server,
            experience,
            epoch: 1,
            cumulative_timesteps: 0,
            policy_reward: None,
        });
        Ok(())
    }

    /// Learn from the next shuffled batches and publish the result.
    pub async fn step(&mut self) -> Result<EpochReport, ServerError> {
        let training = self.training.as_mut().ok_or(ServerError::NotConfigured)?;
        let started = Instant::now();

        let batches = training.experience.get_all_batches_shuffled().await?;
        let learn = self.learner.learn(batches).await?;
        let timesteps = training.experience.timesteps_collected();
        training.cumulative_timesteps += timesteps as u64;

        let epoch = training.epoch;
        let update = self.learner.snapshot()?;
        if let Err(source) = training.server.push_update(&update, epoch).await {
            error!(epoch, error = %source, "failed to publish model update");
            return Err(ServerError::Publish { epoch, source });
        }
        training.epoch += 1;

        let rewards = training.server.get_policy_rewards().await?;
        training.policy_reward = smooth_policy_reward(training.policy_reward, &rewards);
        if let Some(reward) = training.policy_reward {
            training.server.set_mean_policy_reward(reward).await?;
        }

        if timesteps > 0 {
            training
                .server
                .set_cumulative_timesteps(training.cumulative_timesteps)
                .await?;
            training
                .server
                .set_reward_stats(training.experience.reward_mean(), training.experience.reward_std())
                .await?;
        }

        let report = EpochReport {
            epoch,
            timesteps,
            cumulative_timesteps: training.cumulative_timesteps,
            policy_reward: training.policy_reward,
            steps_per_second: training.experience.steps_per_second(),
            learn,
            elapsed: started.elapsed(),
        };
        info!(
            epoch,
            timesteps,
            cumulative_timesteps = report.cumulative_timesteps,
            policy_reward = ?report.policy_reward,
            steps_per_second = report.steps_per_second,
            loss = ?report.learn.loss,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "epoch complete"
        );
        Ok(report)
    }

    /// True once any enabled terminal condition holds.
    pub fn is_done(&self) -> bool {
        let Some(training) = self.training.as_ref() else {
            return false;
        };
        let terminal = &training.cfg.terminal;
        (terminal.max_epoch > 0 && training.epoch >= terminal.max_epoch)
            || (terminal.max_timesteps > 0 && training.cumulative_timesteps >= terminal.max_timesteps)
            || (terminal.policy_reward > 0.0 && training.policy_reward.is_some_and(|r| r >= terminal.policy_reward))
    }

    /// Step until a terminal condition holds.
    ///
    /// A shuffling worker that exits is restarted, and store faults are
    /// waited out, so clients keep their sessions across both. Anything else
    /// ends training with the error.
    pub async fn train(&mut self) -> Result<Vec<EpochReport>, ServerError> {
        if self.training.is_none() {
            return Err(ServerError::NotConfigured);
        }
        let mut reports = Vec::new();
        let mut restarts = 0;
        while !self.is_done() {
            match self.step().await {
                Ok(report) => {
                    restarts = 0;
                    reports.push(report);
                }
                Err(ServerError::Experience(ExperienceError::ShufflerGone)) if restarts < MAX_SHUFFLER_RESTARTS => {
                    restarts += 1;
                    self.restart_shuffler().await?;
                }
                Err(e) if e.is_transport() => {
                    warn!(epoch = ?self.epoch(), error = %e, "store fault during training, retrying");
                    tokio::time::sleep(self.fault_wait()).await;
                }
                Err(e) => return Err(e),
            }
        }
        info!(epochs = reports.len(), "training finished");
        Ok(reports)
    }

    async fn restart_shuffler(&mut self) -> Result<(), ServerError> {
        let training = self.training.as_mut().ok_or(ServerError::NotConfigured)?;
        warn!(epoch = training.epoch, "shuffling worker exited, restarting it");
        training.experience.cleanup().await;
        training.experience = ParallelExperienceManager::start(&self.launcher, &training.cfg).await?;
        Ok(())
    }

    fn fault_wait(&self) -> Duration {
        self.training
            .as_ref()
            .map_or(Duration::from_secs(1), |t| t.cfg.polling.status_interval())
    }

    /// Tell clients to drop their environments, then shut down.
    pub async fn reset(&mut self) -> Result<(), ServerError> {
        self.transition(Status::Reset).await
    }

    /// Tell clients to wait for a new config, then shut down.
    pub async fn reconfigure(&mut self) -> Result<(), ServerError> {
        self.transition(Status::Reconfigure).await
    }

    async fn transition(&mut self, status: Status) -> Result<(), ServerError> {
        let announce = self
            .training
            .as_ref()
            .map(|t| (&t.server, t.cfg.polling.transition_grace()));
        if let Some((server, grace)) = announce {
            info!(%status, "announcing transition");
            server.set_status(status).await?;
            tokio::time::sleep(grace).await;
        }
        self.shutdown().await
    }

    /// Wipe the store, announce STOPPING and stop the shuffling worker.
    pub async fn shutdown(&mut self) -> Result<(), ServerError> {
        let Some(mut training) = self.training.take() else {
            return Ok(());
        };
        let disconnected = training.server.disconnect().await;
        training.experience.cleanup().await;
        info!(epoch = training.epoch, "training server shut down");
        disconnected?;
        Ok(())
    }
}

/// First batch of rewards seeds the estimate with their mean; later rewards
/// are folded in one by one.
fn smooth_policy_reward(current: Option<f64>, rewards: &[f32]) -> Option<f64> {
    if rewards.is_empty() {
        return current;
    }
    let smoothed = match current {
        None => rewards.iter().map(|&r| r as f64).sum::<f64>() / rewards.len() as f64,
        Some(mut reward) => {
            for &r in rewards {
                reward = reward * POLICY_REWARD_DECAY + r as f64 * (1.0 - POLICY_REWARD_DECAY);
            }
            reward
        }
    };
    Some(smoothed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RolloutClient;
    use crate::config::PollingConfig;
    use crate::control::{CoordinationClient, EnvSpaces, MemoryStore, ModelUpdate, keys};
    use crate::env::{DummyEnv, Env};
    use crate::experience::Batch;
    use crate::model::{LinearModel, Model};
    use crate::runtime::WorkerRegistry;
    use crate::workers::{linear_value_model, memory_connector, register_workers};
    use async_trait::async_trait;

    /// Counts what it is fed and nudges every parameter by the epoch.
    #[derive(Default)]
    struct CountingLearner {
        policy: Vec<f32>,
        value: Vec<f32>,
        timesteps: usize,
    }

    #[async_trait]
    impl Learner for CountingLearner {
        async fn configure(&mut self, _cfg: &RunConfig, spaces: &EnvSpaces) -> Result<(), LearnerError> {
            self.policy = vec![0.0; spaces.observation_size() + 1];
            self.value = vec![0.0; spaces.observation_size() + 1];
            Ok(())
        }

        async fn learn(&mut self, batches: Vec<Batch>) -> Result<LearnReport, LearnerError> {
            let timesteps: usize = batches.iter().map(Batch::len).sum();
            self.timesteps += timesteps;
            self.policy.iter_mut().for_each(|p| *p += 0.01);
            Ok(LearnReport {
                batches: batches.len(),
                timesteps,
                loss: Some(0.0),
            })
        }

        fn snapshot(&self) -> Result<ModelUpdate, LearnerError> {
            Ok(ModelUpdate {
                policy_params: self.policy.clone(),
                value_params: self.value.clone(),
                ..ModelUpdate::default()
            })
        }
    }

    fn config() -> RunConfig {
        let mut cfg = RunConfig::default();
        cfg.polling = PollingConfig::fast();
        cfg.client.collection_seconds = 0.01;
        cfg.experience.max_buffer_size = 40;
        cfg.policy_optimizer.batch_size = 10;
        cfg.policy_optimizer.new_returns_proportion = 0.5;
        cfg.terminal.max_epoch = 3;
        cfg
    }

    fn launcher(store: &MemoryStore) -> Launcher {
        let mut registry = WorkerRegistry::new();
        register_workers(&mut registry, memory_connector(store.clone()), linear_value_model());
        Launcher::thread(registry)
    }

    #[test]
    fn policy_reward_seeds_with_mean_then_decays() {
        assert_eq!(smooth_policy_reward(None, &[]), None);
        assert_eq!(smooth_policy_reward(None, &[1.0, 3.0]), Some(2.0));
        assert_eq!(smooth_policy_reward(Some(2.0), &[]), Some(2.0));

        let next = smooth_policy_reward(Some(2.0), &[12.0]).unwrap();
        assert!((next - 2.1).abs() < 1e-9);
    }

    #[tokio::test]
    async fn step_before_configure_is_rejected() {
        let store = MemoryStore::new();
        let mut server = TrainingServer::new(
            Arc::new(store.clone()),
            launcher(&store),
            Box::new(CountingLearner::default()),
        );
        assert!(matches!(server.step().await, Err(ServerError::NotConfigured)));
        assert!(!server.is_done());
        server.shutdown().await.unwrap();
    }

    type Rollout = tokio::task::JoinHandle<(RolloutClient, Result<(), crate::client::ClientError>)>;

    fn spawn_rollout(store: &MemoryStore) -> (tokio::sync::oneshot::Sender<()>, Rollout) {
        let mut client = RolloutClient::new(
            memory_connector(store.clone()),
            launcher(store),
            Box::new(|_| Ok(Box::new(DummyEnv::with_episode_len(5)) as Box<dyn Env>)),
            Box::new(|_, spaces| Ok(Box::new(LinearModel::zeros(spaces.observation_size())) as Box<dyn Model>)),
        );
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let rollout = tokio::spawn(async move {
            let result = client
                .run_until(async {
                    let _ = stop_rx.await;
                })
                .await;
            (client, result)
        });
        (stop_tx, rollout)
    }

    #[test]
    fn only_store_and_decode_faults_are_transient() {
        let lost = || ControlError::Store(crate::control::StoreError::Unreachable("gone".to_string()));
        assert!(ServerError::Control(lost()).is_transport());
        assert!(ServerError::Experience(ExperienceError::Control(lost())).is_transport());
        assert!(
            ServerError::Control(ControlError::Message(crate::message::MessageError::UnknownCompression {
                tag: "ZSTD".to_string(),
                supported: "LZ4, NONE".to_string(),
            }))
            .is_transport()
        );

        assert!(!ServerError::Publish { epoch: 3, source: lost() }.is_transport());
        assert!(!ServerError::Experience(ExperienceError::ShufflerGone).is_transport());
        assert!(!ServerError::Control(ControlError::StaleEpoch { published: 2, attempted: 2 }).is_transport());
        assert!(!ServerError::NotConfigured.is_transport());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn training_survives_a_lost_shuffler_and_undecodable_experience() {
        let store = MemoryStore::new();
        let (stop_tx, rollout) = spawn_rollout(&store);

        let mut server = TrainingServer::new(
            Arc::new(store.clone()),
            launcher(&store),
            Box::new(CountingLearner::default()),
        );
        let cfg = config();
        tokio::time::timeout(Duration::from_secs(10), server.configure(cfg.clone()))
            .await
            .unwrap()
            .unwrap();

        let foreign = crate::message::Envelope {
            compression: "ZSTD".to_string(),
            payload: vec![7; 32],
        };
        store
            .push_trim(keys::CLIENT_EXPERIENCE_KEY, bincode::serialize(&foreign).unwrap(), 100)
            .await
            .unwrap();
        if let Some(training) = server.training.as_mut() {
            training.experience.cleanup().await;
        }

        let reports = tokio::time::timeout(Duration::from_secs(20), server.train())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reports.iter().map(|r| r.epoch).collect::<Vec<_>>(), vec![1, 2]);
        assert!(server.is_done());
        server.shutdown().await.unwrap();

        stop_tx.send(()).unwrap();
        let (_client, result) = tokio::time::timeout(Duration::from_secs(5), rollout)
            .await
            .unwrap()
            .unwrap();
        result.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn trains_against_a_rollout_client_until_max_epoch() {
        let store = MemoryStore::new();
        let (stop_tx, rollout) = spawn_rollout(&store);

        let mut server = TrainingServer::new(
            Arc::new(store.clone()),
            launcher(&store),
            Box::new(CountingLearner::default()),
        );
        let cfg = config();
        tokio::time::timeout(Duration::from_secs(10), server.configure(cfg.clone()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(server.epoch(), Some(1));

        let reports = tokio::time::timeout(Duration::from_secs(20), server.train())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reports.iter().map(|r| r.epoch).collect::<Vec<_>>(), vec![1, 2]);
        assert!(server.is_done());
        assert!(server.cumulative_timesteps() >= 2 * cfg.timesteps_per_update() as u64);
        assert!(reports.iter().all(|r| r.learn.timesteps > 0));

        let observer = CoordinationClient::new(Arc::new(store.clone()));
        assert_eq!(observer.check_server_status().await.unwrap(), Some(Status::Running));
        assert!(store.contains(keys::SERVER_CUMULATIVE_TIMESTEPS_KEY));

        server.shutdown().await.unwrap();
        assert_eq!(observer.check_server_status().await.unwrap(), Some(Status::Stopping));

        stop_tx.send(()).unwrap();
        let (client, result) = tokio::time::timeout(Duration::from_secs(5), rollout)
            .await
            .unwrap()
            .unwrap();
        result.unwrap();
        assert!(!client.is_configured());
    }
}
