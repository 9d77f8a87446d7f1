//! Pit-stop decision engine.
//!
//! Each call to [`StrategyEngine::recommend`] takes a race snapshot and produces a
//! [`Recommendation`] for one driver: tire degradation forecasts feed a pit-window
//! search, nearby rivals are scored for undercut and overcut threats, and the
//! shortlisted plans are run through a Monte Carlo race simulation.
//! [`StrategyEngine::compare_scenarios`] repeats the cycle over alternative race states.

pub mod config;
pub mod engine;
pub mod error;
pub mod forecast;
pub mod optimizer;
pub mod scenario;
pub mod simulator;
pub mod threat;
pub mod types;

pub use config::{EngineConfig, FallbackRates, TypicalStints};
pub use engine::{EvaluationOptions, StrategyEngine, BASE_SCENARIO};
pub use error::{Result, StrategyError};
pub use forecast::{
    DegradationPredictor, ForecastAdapter, ForecastConditions, ForecastTable,
    LinearDegradationModel, RawPrediction, TableRequest,
};
pub use optimizer::PitWindowOptimizer;
pub use scenario::{ScenarioComparison, ScenarioOutcome, ScenarioReport, ScenarioSummary};
pub use simulator::{RaceOutcomeSimulator, SimulationControl};
pub use threat::CompetitorThreatAnalyzer;
pub use types::*;
