//! Background workers the client and server loops spawn.

mod finalizer;
mod shuffler;

use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

pub use finalizer::{FINALIZER_KIND, FLUSH_DATA, FinalizerInit, INITIALIZATION, TRAJECTORY, TrajectoryFinalizer};
pub use shuffler::{EXPERIENCE_BATCH, INITIALIZATION_DATA, MISC_DATA, ParallelShuffler, SHUFFLER_KIND, ShufflerReport};

use crate::config::StoreConfig;
use crate::control::{EnvSpaces, MemoryStore, RedisStore, Store, StoreError};
use crate::model::{LinearModel, Model, ModelError};
use crate::runtime::{Worker, WorkerRegistry};

/// Opens a store connection from inside a worker.
pub type StoreConnector = Arc<dyn Fn() -> BoxFuture<'static, Result<Arc<dyn Store>, StoreError>> + Send + Sync>;

/// Builds the value model replica a finalizer scores observations with.
pub type ValueModelFactory = Arc<dyn Fn(&EnvSpaces) -> Result<Box<dyn Model>, ModelError> + Send + Sync>;

pub fn redis_connector(cfg: StoreConfig) -> StoreConnector {
    Arc::new(move || {
        let cfg = cfg.clone();
        async move {
            let store = RedisStore::connect(&cfg).await?;
            Ok(Arc::new(store) as Arc<dyn Store>)
        }
        .boxed()
    })
}

/// Every worker shares `store`. Only meaningful for thread-backed workers.
pub fn memory_connector(store: MemoryStore) -> StoreConnector {
    Arc::new(move || {
        let store = store.clone();
        async move { Ok(Arc::new(store) as Arc<dyn Store>) }.boxed()
    })
}

/// Linear value model over the flattened observation.
pub fn linear_value_model() -> ValueModelFactory {
    Arc::new(|spaces: &EnvSpaces| Ok(Box::new(LinearModel::zeros(spaces.observation_size())) as Box<dyn Model>))
}

/// Register the shuffler and the finalizer under their kinds.
pub fn register_workers(registry: &mut WorkerRegistry, connect: StoreConnector, value_models: ValueModelFactory) {
    let shuffler_connect = connect.clone();
    registry.register(SHUFFLER_KIND, move |_spec| {
        Ok(Box::new(ParallelShuffler::new(shuffler_connect.clone())) as Box<dyn Worker>)
    });
    registry.register(FINALIZER_KIND, move |_spec| {
        Ok(Box::new(TrajectoryFinalizer::new(connect.clone(), value_models.clone())) as Box<dyn Worker>)
    });
}
