mod buffer;
mod collector;
mod errors;
mod manager;
mod parallel;
mod replay;
mod running_stat;
mod timestep;
mod trajectory;

pub use buffer::{BufferedTrajectory, ExperienceBuffer, ThroughputMeter};
pub use collector::{CollectionBudget, Collector};
pub use errors::ExperienceError;
pub use manager::ExperienceManager;
pub use parallel::ParallelExperienceManager;
pub use replay::{Batch, ExperienceReplay};
pub use running_stat::RunningStat;
pub use timestep::Timestep;
pub use trajectory::{AdvantageEstimate, Trajectory, discounted_future_sum, generalized_advantage};
