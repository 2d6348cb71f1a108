use thiserror::Error;

/// Conditions that end monitoring for the whole session. Recorded once in
/// the store and never cleared.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("{0}")]
    HeaderRejected(String),
    #[error("metric '{metric}' of experiment {experiment}: {reason}")]
    MetricEvaluation {
        metric: String,
        experiment: usize,
        reason: String,
    },
    #[error("error reading monitoring output: {0}")]
    StreamIo(String),
    #[error("failed to start monitoring command: {0}")]
    Spawn(String),
}

/// Failure to deliver a pause, resume or kill request.
#[derive(Error, Debug)]
pub enum ControlError {
    #[error(transparent)]
    Remote(#[from] pmc_remote::Error),
    #[error("failed to kill monitoring command: {0}")]
    Kill(#[from] std::io::Error),
}
