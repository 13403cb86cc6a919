pub mod client;
pub mod config;
pub mod control;
pub mod env;
pub mod experience;
pub mod learner;
pub mod logging;
pub mod message;
pub mod model;
pub mod runtime;
pub mod server;
pub mod workers;

pub use client::{ClientError, RolloutClient};
pub use config::RunConfig;
pub use server::{EpochReport, ServerError, TrainingServer};
