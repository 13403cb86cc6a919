//! Coordination through a shared key-value store.
//!
//! One [`CoordinationServer`] owns the status key and publishes config and
//! parameters; any number of [`CoordinationClient`]s poll it and push
//! experience back. The store offers no notifications, so every wait is a
//! polling loop with an interval from [`crate::config::PollingConfig`].

mod client;
mod errors;
pub mod keys;
mod memory_store;
mod redis_store;
mod server;
mod status;
mod traits;

pub use client::CoordinationClient;
pub use errors::{ControlError, StoreError};
pub use memory_store::MemoryStore;
pub use redis_store::RedisStore;
pub use server::CoordinationServer;
pub use status::Status;
pub use traits::{EnvSpaces, ModelUpdate, Store, StoreOp};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PollingConfig, RunConfig};
    use crate::experience::{Timestep, Trajectory};
    use std::sync::Arc;
    use std::time::Duration;

    fn fast_config() -> RunConfig {
        let mut cfg = RunConfig::default();
        cfg.polling = PollingConfig::fast();
        cfg.networking.compression = "lz4".to_string();
        cfg.networking.min_size_to_compress = 64;
        cfg.networking.max_list_length = 4;
        cfg
    }

    fn pair(max_queue_size: usize) -> (MemoryStore, CoordinationServer, CoordinationClient) {
        let store = MemoryStore::new();
        let server = CoordinationServer::new(Arc::new(store.clone()), max_queue_size)
            .with_polling(PollingConfig::fast());
        let client = CoordinationClient::new(Arc::new(store.clone())).with_polling(PollingConfig::fast());
        (store, server, client)
    }

    fn trajectory(len: usize, tag: f32) -> Trajectory {
        let mut t = Trajectory::new();
        for i in 0..len {
            t.register_timestep(Timestep::new(vec![tag], 0.0, 1.0, vec![i as f32], i + 1 == len));
        }
        t.final_obs = Some(vec![len as f32]);
        t
    }

    fn update(tag: f32) -> ModelUpdate {
        ModelUpdate {
            policy_params: vec![tag; 3],
            value_params: vec![tag * 10.0; 2],
            strategy_frames: vec![vec![tag]],
            strategy_history: vec![],
        }
    }

    #[tokio::test]
    async fn get_cfg_waiting_before_ready_receives_the_config() {
        let (_store, mut server, mut client) = pair(100);
        server.connect(true, true).await.unwrap();
        assert_eq!(server.status().await.unwrap(), Some(Status::Initializing));

        let waiting = tokio::spawn(async move {
            let cfg = client.get_cfg().await.unwrap();
            (cfg, client)
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiting.is_finished());

        let cfg = fast_config();
        server.push_config(&cfg).await.unwrap();
        server.signal_ready().await.unwrap();

        let (received, client) = tokio::time::timeout(Duration::from_secs(5), waiting)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, cfg);
        assert_eq!(client.serializer().compression(), "LZ4");
        assert_eq!(client.check_server_status().await.unwrap(), Some(Status::Running));
    }

    #[tokio::test]
    async fn updates_are_delivered_once_per_epoch() {
        let (_store, mut server, mut client) = pair(100);
        server.connect(true, true).await.unwrap();
        assert!(client.get_latest_update().await.unwrap().is_none());

        server.push_update(&update(1.0), 0).await.unwrap();
        let (received, epoch) = client.get_latest_update().await.unwrap().unwrap();
        assert_eq!((received, epoch), (update(1.0), 0));
        assert!(client.get_latest_update().await.unwrap().is_none());

        server.push_update(&update(2.0), 1).await.unwrap();
        assert_eq!(client.get_latest_update().await.unwrap().unwrap().1, 1);
    }

    #[tokio::test]
    async fn stale_epochs_are_rejected() {
        let (_store, mut server, _client) = pair(100);
        server.connect(true, true).await.unwrap();
        server.push_update(&update(1.0), 3).await.unwrap();

        let err = server.push_update(&update(2.0), 3).await.unwrap_err();
        assert!(matches!(err, ControlError::StaleEpoch { published: 3, attempted: 3 }));
        assert!(server.push_update(&update(2.0), 2).await.is_err());
        assert_eq!(server.published_epoch(), Some(3));
    }

    #[tokio::test]
    async fn value_params_track_their_own_epoch() {
        let (_store, mut server, mut client) = pair(100);
        server.connect(true, true).await.unwrap();
        server.push_update(&update(1.0), 0).await.unwrap();

        assert_eq!(client.get_latest_value_params().await.unwrap(), Some(vec![10.0, 10.0]));
        assert!(client.get_latest_value_params().await.unwrap().is_none());
        // The policy update is still pending.
        assert!(client.get_latest_update().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn env_spaces_first_writer_wins() {
        let (store, server, client) = pair(100);
        let other = CoordinationClient::new(Arc::new(store.clone()));

        assert!(client.transmit_env_spaces(&EnvSpaces::new(vec![4], vec![2])).await.unwrap());
        assert!(!other.transmit_env_spaces(&EnvSpaces::new(vec![9], vec![9])).await.unwrap());

        let spaces = server.get_env_spaces().await.unwrap();
        assert_eq!(spaces, EnvSpaces::new(vec![4], vec![2]));
        assert_eq!(server.status().await.unwrap(), Some(Status::AwaitingEnvSpaces));
    }

    #[tokio::test]
    async fn pushed_lists_stay_bounded() {
        let (store, mut server, mut client) = pair(100);
        server.connect(true, true).await.unwrap();
        server.push_config(&fast_config()).await.unwrap();
        server.set_status(Status::Running).await.unwrap();
        client.get_cfg().await.unwrap();

        for i in 0..10 {
            client.push_policy_rewards(&[i as f32]).await.unwrap();
            assert!(store.list_len(keys::CLIENT_POLICY_REWARD_KEY) <= 4);
        }
        assert_eq!(server.get_policy_rewards().await.unwrap(), vec![6.0, 7.0, 8.0, 9.0]);
        assert!(server.get_policy_rewards().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn server_drains_pushed_trajectories() {
        let (_store, mut server, client) = pair(10);
        server.connect(true, true).await.unwrap();

        client
            .push_trajectories(&[trajectory(4, 1.0), trajectory(4, 2.0)])
            .await
            .unwrap();
        client.push_trajectories(&[trajectory(4, 3.0)]).await.unwrap();

        assert_eq!(server.update_buffer().await.unwrap(), 12);
        assert_eq!(server.available_timesteps(), 8);

        let popped = server.get_up_to_n_timesteps(3).await.unwrap();
        assert_eq!(popped.len(), 1);
        assert_eq!(popped[0].actions[0], vec![3.0]);
        assert_eq!(server.available_timesteps(), 4);
    }

    #[tokio::test]
    async fn undecodable_entries_are_dropped_not_fatal() {
        let (store, mut server, client) = pair(10);
        server.connect(true, true).await.unwrap();

        client.push_trajectories(&[trajectory(4, 1.0)]).await.unwrap();
        let foreign = crate::message::Envelope {
            compression: "ZSTD".to_string(),
            payload: vec![1, 2, 3, 4],
        };
        store
            .push_trim(keys::CLIENT_EXPERIENCE_KEY, bincode::serialize(&foreign).unwrap(), 100)
            .await
            .unwrap();
        store
            .push_trim(keys::CLIENT_EXPERIENCE_KEY, vec![0xff; 7], 100)
            .await
            .unwrap();
        client.push_trajectories(&[trajectory(4, 2.0)]).await.unwrap();

        assert_eq!(server.update_buffer().await.unwrap(), 8);
        assert_eq!(server.available_timesteps(), 8);
        assert_eq!(store.list_len(keys::CLIENT_EXPERIENCE_KEY), 0);
    }

    #[tokio::test]
    async fn get_n_timesteps_waits_for_enough_data() {
        let (store, mut server, client) = pair(100);
        server.connect(true, true).await.unwrap();
        client.push_trajectories(&[trajectory(3, 1.0)]).await.unwrap();

        let waiting = tokio::spawn(async move {
            let trajectories = server.get_n_timesteps(5).await.unwrap();
            (trajectories, server)
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());

        let late = CoordinationClient::new(Arc::new(store.clone()));
        late.push_trajectories(&[trajectory(3, 2.0)]).await.unwrap();

        let (trajectories, server) = tokio::time::timeout(Duration::from_secs(5), waiting)
            .await
            .unwrap()
            .unwrap();
        let total: usize = trajectories.iter().map(Trajectory::len).sum();
        assert_eq!(total, 6);
        assert_eq!(server.available_timesteps(), 0);
    }

    #[tokio::test]
    async fn signal_ready_wipes_stale_client_data() {
        let (store, mut server, client) = pair(100);
        server.connect(true, true).await.unwrap();
        client.push_trajectories(&[trajectory(2, 1.0)]).await.unwrap();
        client.push_policy_rewards(&[1.0]).await.unwrap();

        server.signal_ready().await.unwrap();
        assert!(!store.contains(keys::CLIENT_EXPERIENCE_KEY));
        assert!(!store.contains(keys::CLIENT_POLICY_REWARD_KEY));
        assert_eq!(server.update_buffer().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reward_stats_default_until_published() {
        let (_store, mut server, client) = pair(100);
        server.connect(true, true).await.unwrap();
        assert_eq!(client.get_reward_stats().await.unwrap(), (0.0, 1.0));

        server.set_reward_stats(2.5, 0.5).await.unwrap();
        assert_eq!(client.get_reward_stats().await.unwrap(), (2.5, 0.5));
    }

    #[tokio::test]
    async fn disconnect_leaves_only_the_stopping_status() {
        let (store, mut server, client) = pair(100);
        server.connect(true, true).await.unwrap();
        server.push_update(&update(1.0), 0).await.unwrap();

        server.disconnect().await.unwrap();
        assert!(!store.contains(keys::SERVER_POLICY_PARAMS_KEY));
        assert_eq!(client.check_server_status().await.unwrap(), Some(Status::Stopping));
    }

    #[tokio::test]
    async fn lost_store_is_a_transport_fault() {
        let (store, _server, client) = pair(100);
        store.set_unreachable(true);
        let err = client.check_server_status().await.unwrap_err();
        assert!(err.is_transport());
        assert!(err.is_unreachable());
    }
}
