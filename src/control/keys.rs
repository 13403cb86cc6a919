//! Key names in the coordination store.

pub const ENV_SPACES_KEY: &str = "ENV_SPACES_KEY";

pub const SERVER_POLICY_PARAMS_KEY: &str = "SERVER_POLICY_PARAMS_KEY";
pub const SERVER_VAL_PARAMS_KEY: &str = "SERVER_VAL_PARAMS_KEY";
pub const SERVER_STRATEGY_FRAMES_KEY: &str = "SERVER_STRATEGY_FRAMES_KEY";
pub const SERVER_STRATEGY_HISTORY_KEY: &str = "SERVER_STRATEGY_HISTORY_KEY";
pub const SERVER_CURRENT_UPDATE_KEY: &str = "SERVER_CURRENT_UPDATE_KEY";
pub const SERVER_CUMULATIVE_TIMESTEPS_KEY: &str = "SERVER_CUMULATIVE_TIMESTEPS_KEY";
pub const SERVER_CURRENT_STATUS_KEY: &str = "SERVER_CURRENT_STATUS_KEY";
pub const SERVER_CONFIG_KEY: &str = "SERVER_CONFIG_KEY";

pub const CLIENT_POLICY_REWARD_KEY: &str = "CLIENT_POLICY_REWARD_KEY";
pub const CLIENT_EXPERIENCE_KEY: &str = "CLIENT_EXPERIENCE_KEY";

pub const RUNNING_REWARD_MEAN_KEY: &str = "RUNNING_REWARD_MEAN_KEY";
pub const RUNNING_REWARD_STD_KEY: &str = "RUNNING_REWARD_STD_KEY";
pub const NEW_DATA_AMOUNT_KEY: &str = "NEW_DATA_AMOUNT_KEY";
pub const MEAN_POLICY_REWARD_KEY: &str = "MEAN_POLICY_REWARD_KEY";

/// The four artifacts of one parameter epoch, in publication order.
pub const UPDATE_KEYS: [&str; 4] = [
    SERVER_POLICY_PARAMS_KEY,
    SERVER_VAL_PARAMS_KEY,
    SERVER_STRATEGY_FRAMES_KEY,
    SERVER_STRATEGY_HISTORY_KEY,
];

/// Lists written by clients, wiped when the server signals ready.
pub const CLIENT_KEYS: [&str; 2] = [CLIENT_EXPERIENCE_KEY, CLIENT_POLICY_REWARD_KEY];
