//! Side-by-side evaluation of one driver's decision under alternative race conditions.

use serde::Serialize;

use crate::types::{Recommendation, RiskLevel};

/// Pit timing differences this small read as the same call.
const SIMILAR_TIMING_LAPS: i64 = 2;

/// Laps added to a scenario's pit lap for its overall risk.
pub fn risk_penalty(risk: RiskLevel) -> u32 {
    match risk {
        RiskLevel::Low => 0,
        RiskLevel::Medium => 5,
        RiskLevel::High => 15,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScenarioSummary {
    pub name: String,
    pub optimal_pit_lap: u32,
    pub risk_level: RiskLevel,
    /// Pit lap plus the risk penalty; lower is better.
    pub score: u32,
}

impl ScenarioSummary {
    pub fn new(name: impl Into<String>, optimal_pit_lap: u32, risk_level: RiskLevel) -> Self {
        Self {
            name: name.into(),
            optimal_pit_lap,
            risk_level,
            score: optimal_pit_lap + risk_penalty(risk_level),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScenarioOutcome {
    #[serde(flatten)]
    pub summary: ScenarioSummary,
    pub recommendation: Recommendation,
}

impl ScenarioOutcome {
    pub fn new(name: impl Into<String>, recommendation: Recommendation) -> Self {
        let summary = ScenarioSummary::new(
            name,
            recommendation.optimal_strategy.pit_lap,
            recommendation.risk_assessment.overall_risk,
        );
        Self {
            summary,
            recommendation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScenarioComparison {
    pub scenario_1: String,
    pub scenario_2: String,
    /// Second scenario's pit lap minus the first's.
    pub pit_lap_difference: i64,
    pub risk_comparison: String,
    pub summary: String,
}

impl ScenarioComparison {
    pub fn between(a: &ScenarioSummary, b: &ScenarioSummary) -> Self {
        let diff = i64::from(b.optimal_pit_lap) - i64::from(a.optimal_pit_lap);
        let summary = if diff.abs() <= SIMILAR_TIMING_LAPS {
            format!("{} and {} have similar pit timing", a.name, b.name)
        } else if diff > 0 {
            format!("{} suggests {} laps earlier pit than {}", a.name, diff, b.name)
        } else {
            format!("{} suggests {} laps earlier pit than {}", b.name, -diff, a.name)
        };
        Self {
            scenario_1: a.name.clone(),
            scenario_2: b.name.clone(),
            pit_lap_difference: diff,
            risk_comparison: format!("{} vs {}", a.risk_level.as_str(), b.risk_level.as_str()),
            summary,
        }
    }
}

/// Lowest score wins; ties keep the earlier scenario.
pub fn best_scenario(summaries: &[ScenarioSummary]) -> Option<&ScenarioSummary> {
    summaries.iter().min_by_key(|s| s.score)
}

/// Every unordered pair, in input order.
pub fn pairwise(summaries: &[ScenarioSummary]) -> Vec<ScenarioComparison> {
    let mut out = Vec::new();
    for (i, a) in summaries.iter().enumerate() {
        for b in &summaries[i + 1..] {
            out.push(ScenarioComparison::between(a, b));
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScenarioReport {
    pub scenarios: Vec<ScenarioOutcome>,
    pub best_scenario: Option<String>,
    pub comparisons: Vec<ScenarioComparison>,
}

impl ScenarioReport {
    pub fn new(scenarios: Vec<ScenarioOutcome>) -> Self {
        let summaries: Vec<ScenarioSummary> =
            scenarios.iter().map(|s| s.summary.clone()).collect();
        Self {
            best_scenario: best_scenario(&summaries).map(|s| s.name.clone()),
            comparisons: pairwise(&summaries),
            scenarios,
        }
    }
}
