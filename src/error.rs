// Crate-level error for the controller and sequencer

use crate::servo::{CommError, UsageError};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Bus error: {0}")]
    Comm(#[from] CommError),

    #[error("Usage error: {0}")]
    Usage(#[from] UsageError),

    #[error("Goal set {goal_index} not reached after {passes} polling passes")]
    ConvergenceTimeout { goal_index: usize, passes: u64 },

    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
