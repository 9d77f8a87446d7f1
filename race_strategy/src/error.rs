use thiserror::Error;

#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("invalid race state: {0}")]
    InvalidRaceState(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("invalid forecast input: {0}")]
    InvalidForecastInput(String),

    /// Predictor missing, failing or too slow. Recovered with fallback rates.
    #[error("degradation model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("no feasible strategy: {0}")]
    NoFeasibleStrategy(String),

    #[error("simulation did not finish before the deadline")]
    SimulationTimeout,

    #[error("evaluation cancelled")]
    Cancelled,

    #[error("worker failure: {0}")]
    Worker(String),
}

pub type Result<T> = std::result::Result<T, StrategyError>;
