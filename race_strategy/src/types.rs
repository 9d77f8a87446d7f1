use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, StrategyError};

// ---------- Enums shared across the contract ----------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Compound {
    Soft,
    Medium,
    Hard,
}

impl Compound {
    pub const ALL: [Compound; 3] = [Compound::Soft, Compound::Medium, Compound::Hard];

    /// 2 = softest. Used both for threat scoring and for model encoding.
    pub fn softness(self) -> u8 {
        match self {
            Compound::Soft => 2,
            Compound::Medium => 1,
            Compound::Hard => 0,
        }
    }

    pub fn is_softer_than(self, other: Compound) -> bool {
        self.softness() > other.softness()
    }

    /// Compound a rival is expected to switch to at its next stop.
    pub fn next_stint(self) -> Compound {
        match self {
            Compound::Soft => Compound::Medium,
            Compound::Medium => Compound::Hard,
            Compound::Hard => Compound::Medium,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Compound::Soft => "SOFT",
            Compound::Medium => "MEDIUM",
            Compound::Hard => "HARD",
        }
    }
}

impl fmt::Display for Compound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Compound {
    type Err = StrategyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SOFT" | "S" => Ok(Compound::Soft),
            "MEDIUM" | "M" => Ok(Compound::Medium),
            "HARD" | "H" => Ok(Compound::Hard),
            other => Err(StrategyError::InvalidRaceState(format!(
                "unknown compound {other:?}"
            ))),
        }
    }
}

/// Ordered LOW < MEDIUM < HIGH so `max` picks the riskier side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    /// Risk from the width of a 95% interval relative to the point estimate.
    pub fn from_interval(rate: f64, lower: f64, upper: f64) -> Self {
        let width = (upper - lower).max(0.0);
        if rate <= f64::EPSILON {
            return if width <= f64::EPSILON {
                RiskLevel::Low
            } else {
                RiskLevel::High
            };
        }
        let relative = width / rate;
        if relative < 0.5 {
            RiskLevel::Low
        } else if relative < 1.0 {
            RiskLevel::Medium
        } else {
            RiskLevel::High
        }
    }

    /// Risk from the spread of simulated finishing positions.
    pub fn from_position_std(std: f64) -> Self {
        if std < 0.75 {
            RiskLevel::Low
        } else if std < 1.5 {
            RiskLevel::Medium
        } else {
            RiskLevel::High
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
        }
    }

    pub fn from_score(score: u8) -> Self {
        match score {
            0 | 1 => RiskLevel::Low,
            2 => RiskLevel::Medium,
            _ => RiskLevel::High,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Urgency {
    Immediate,
    Soon,
    Monitor,
    Low,
}

impl Urgency {
    pub fn from_laps_to_stop(laps: u32) -> Self {
        match laps {
            0..=2 => Urgency::Immediate,
            3..=5 => Urgency::Soon,
            6..=10 => Urgency::Monitor,
            _ => Urgency::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionVerb {
    PitNow,
    Continue,
}

/// Which rung of the decision hierarchy produced the final pit lap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionBasis {
    SafetyOverride,
    Optimizer,
    CompetitorOverride,
    NoFeasibleStrategy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CyclePhase {
    Init,
    Forecasting,
    Degraded,
    Optimizing,
    ThreatAnalysis,
    Simulating,
    Assembling,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecommendedResponse {
    CoverUndercut,
    AttemptOvercut,
    Defend,
    PitOnOptimalWindow,
}

// ---------- Race state ----------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverEntry {
    pub driver: String,
    pub position: u32,
    pub compound: Compound,
    pub tire_age: u32,
    #[serde(default)]
    pub gap_to_car_ahead: f64,
    #[serde(default)]
    pub gap_to_car_behind: f64,
}

#[derive(Debug, Deserialize)]
struct RaceStateSnapshot {
    current_lap: u32,
    total_laps: u32,
    track_temp: f64,
    #[serde(default)]
    track_id: u32,
    drivers: Vec<DriverEntry>,
}

impl TryFrom<RaceStateSnapshot> for RaceState {
    type Error = StrategyError;

    fn try_from(raw: RaceStateSnapshot) -> Result<Self> {
        RaceState::new(
            raw.current_lap,
            raw.total_laps,
            raw.track_temp,
            raw.track_id,
            raw.drivers,
        )
    }
}

/// Immutable snapshot of one evaluation cycle. Drivers are kept sorted by position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RaceStateSnapshot")]
pub struct RaceState {
    current_lap: u32,
    total_laps: u32,
    track_temp: f64,
    track_id: u32,
    drivers: Vec<DriverEntry>,
}

impl RaceState {
    pub fn new(
        current_lap: u32,
        total_laps: u32,
        track_temp: f64,
        track_id: u32,
        mut drivers: Vec<DriverEntry>,
    ) -> Result<Self> {
        let invalid = |msg: String| Err(StrategyError::InvalidRaceState(msg));

        if current_lap < 1 {
            return invalid("current_lap must be >= 1".into());
        }
        if total_laps <= current_lap {
            return invalid(format!(
                "total_laps ({total_laps}) must exceed current_lap ({current_lap})"
            ));
        }
        if !track_temp.is_finite() {
            return invalid("track_temp must be finite".into());
        }
        if drivers.is_empty() {
            return invalid("race state has no drivers".into());
        }

        let mut positions = HashSet::new();
        let mut codes = HashSet::new();
        for d in &drivers {
            if d.position < 1 {
                return invalid(format!("{} has position 0", d.driver));
            }
            if !positions.insert(d.position) {
                return invalid(format!("duplicate position {}", d.position));
            }
            if d.driver.trim().is_empty() {
                return invalid(format!("driver at P{} has an empty code", d.position));
            }
            if !codes.insert(d.driver.as_str()) {
                return invalid(format!("duplicate driver {}", d.driver));
            }
            for (name, gap) in [
                ("gap_to_car_ahead", d.gap_to_car_ahead),
                ("gap_to_car_behind", d.gap_to_car_behind),
            ] {
                if !gap.is_finite() || gap < 0.0 {
                    return invalid(format!("{} has invalid {name}: {gap}", d.driver));
                }
            }
        }

        drivers.sort_by_key(|d| d.position);
        Ok(Self {
            current_lap,
            total_laps,
            track_temp,
            track_id,
            drivers,
        })
    }

    pub fn current_lap(&self) -> u32 {
        self.current_lap
    }

    pub fn total_laps(&self) -> u32 {
        self.total_laps
    }

    pub fn remaining_laps(&self) -> u32 {
        self.total_laps - self.current_lap
    }

    pub fn track_temp(&self) -> f64 {
        self.track_temp
    }

    pub fn track_id(&self) -> u32 {
        self.track_id
    }

    /// Drivers in running order.
    pub fn drivers(&self) -> &[DriverEntry] {
        &self.drivers
    }

    pub fn driver(&self, code: &str) -> Option<&DriverEntry> {
        self.drivers.iter().find(|d| d.driver == code)
    }

    fn index_of(&self, code: &str) -> Option<usize> {
        self.drivers.iter().position(|d| d.driver == code)
    }

    /// Cars ahead of `code`, nearest first, with the cumulative gap to each.
    pub fn cars_ahead(&self, code: &str) -> Vec<(&DriverEntry, f64)> {
        let Some(idx) = self.index_of(code) else {
            return Vec::new();
        };
        let mut out = Vec::with_capacity(idx);
        let mut gap = 0.0;
        for i in (0..idx).rev() {
            gap += self.drivers[i + 1].gap_to_car_ahead;
            out.push((&self.drivers[i], gap));
        }
        out
    }

    /// Cars behind `code`, nearest first, with the cumulative gap to each.
    pub fn cars_behind(&self, code: &str) -> Vec<(&DriverEntry, f64)> {
        let Some(idx) = self.index_of(code) else {
            return Vec::new();
        };
        let mut out = Vec::with_capacity(self.drivers.len() - idx - 1);
        let mut gap = 0.0;
        for i in idx + 1..self.drivers.len() {
            gap += self.drivers[i - 1].gap_to_car_behind;
            out.push((&self.drivers[i], gap));
        }
        out
    }

    /// Time behind the leader for every car, in running order.
    pub fn gaps_to_leader(&self) -> Vec<f64> {
        let mut acc = 0.0;
        self.drivers
            .iter()
            .enumerate()
            .map(|(i, d)| {
                if i > 0 {
                    acc += d.gap_to_car_ahead;
                }
                acc
            })
            .collect()
    }

    pub fn max_tire_age(&self) -> u32 {
        self.drivers.iter().map(|d| d.tire_age).max().unwrap_or(0)
    }
}

// ---------- Forecast ----------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DegradationForecast {
    pub rate: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub risk_level: RiskLevel,
}

impl DegradationForecast {
    /// Normalizes a raw prediction: clamps at zero and orders the bounds around the rate.
    pub fn from_interval(rate: f64, lower: f64, upper: f64) -> Self {
        let rate = rate.max(0.0);
        let lower = lower.min(upper).clamp(0.0, rate);
        let upper = upper.max(lower).max(rate);
        Self {
            rate,
            lower_bound: lower,
            upper_bound: upper,
            risk_level: RiskLevel::from_interval(rate, lower, upper),
        }
    }
}

// ---------- Strategy candidates ----------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stint {
    pub compound: Compound,
    pub planned_length: u32,
}

/// The slice of a race state a plan is built against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StintContext {
    pub current_lap: u32,
    pub total_laps: u32,
    pub tire_age: u32,
    pub compound: Compound,
}

impl StintContext {
    pub fn for_driver(state: &RaceState, entry: &DriverEntry) -> Self {
        Self {
            current_lap: state.current_lap(),
            total_laps: state.total_laps(),
            tire_age: entry.tire_age,
            compound: entry.compound,
        }
    }

    /// Laps every plan must cover, counting those already on the current set.
    pub fn plan_length(&self) -> u32 {
        self.total_laps - self.current_lap + self.tire_age
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyCandidate {
    stints: Vec<Stint>,
    pit_lap: Option<u32>,
    new_compound: Option<Compound>,
    expected_time_loss: f64,
    expected_position_delta: f64,
    risk_level: RiskLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

impl StrategyCandidate {
    /// Builds a plan from explicit stints, checking coverage and the compound rule.
    pub fn from_stints(
        ctx: &StintContext,
        stints: Vec<Stint>,
        require_compound_change: bool,
    ) -> Result<Self> {
        let invalid = |msg: String| Err(StrategyError::InvalidRaceState(msg));

        let Some(first) = stints.first() else {
            return invalid("a strategy needs at least one stint".into());
        };
        if first.compound != ctx.compound {
            return invalid(format!(
                "first stint must continue on {}, got {}",
                ctx.compound, first.compound
            ));
        }
        if stints.iter().any(|s| s.planned_length == 0) {
            return invalid("stint lengths must be >= 1".into());
        }
        let total: u32 = stints.iter().map(|s| s.planned_length).sum();
        if total != ctx.plan_length() {
            return invalid(format!(
                "stints cover {total} laps, expected {}",
                ctx.plan_length()
            ));
        }

        let pit_lap = if stints.len() > 1 {
            if first.planned_length <= ctx.tire_age {
                return invalid("first stop must come after the current lap".into());
            }
            Some(ctx.current_lap + first.planned_length - ctx.tire_age)
        } else {
            None
        };

        if require_compound_change && stints.len() > 1 {
            let distinct: HashSet<Compound> = stints.iter().map(|s| s.compound).collect();
            if distinct.len() < 2 {
                return invalid("plan must use at least two distinct compounds".into());
            }
        }

        let new_compound = stints.get(1).map(|s| s.compound);
        Ok(Self {
            stints,
            pit_lap,
            new_compound,
            expected_time_loss: 0.0,
            expected_position_delta: 0.0,
            risk_level: RiskLevel::Low,
            reason: None,
        })
    }

    /// One-stop plan: current set until `pit_lap`, then `new_compound` to the flag.
    pub fn pit_stop(
        ctx: &StintContext,
        pit_lap: u32,
        new_compound: Compound,
        require_compound_change: bool,
    ) -> Result<Self> {
        if pit_lap <= ctx.current_lap || pit_lap >= ctx.total_laps {
            return Err(StrategyError::InvalidRaceState(format!(
                "pit lap {pit_lap} outside {}..{}",
                ctx.current_lap + 1,
                ctx.total_laps
            )));
        }
        let stints = vec![
            Stint {
                compound: ctx.compound,
                planned_length: ctx.tire_age + (pit_lap - ctx.current_lap),
            },
            Stint {
                compound: new_compound,
                planned_length: ctx.total_laps - pit_lap,
            },
        ];
        Self::from_stints(ctx, stints, require_compound_change)
    }

    /// Stay out to the flag. Exempt from the compound rule; always carries a reason.
    pub fn no_stop(ctx: &StintContext, reason: impl Into<String>) -> Self {
        Self {
            stints: vec![Stint {
                compound: ctx.compound,
                planned_length: ctx.plan_length(),
            }],
            pit_lap: None,
            new_compound: None,
            expected_time_loss: 0.0,
            expected_position_delta: 0.0,
            risk_level: RiskLevel::High,
            reason: Some(reason.into()),
        }
    }

    pub fn assessed(
        mut self,
        expected_time_loss: f64,
        expected_position_delta: f64,
        risk_level: RiskLevel,
    ) -> Self {
        self.expected_time_loss = expected_time_loss;
        self.expected_position_delta = expected_position_delta;
        self.risk_level = risk_level;
        self
    }

    pub fn stints(&self) -> &[Stint] {
        &self.stints
    }

    pub fn pit_lap(&self) -> Option<u32> {
        self.pit_lap
    }

    /// Every stop in the plan, in lap order.
    pub fn pit_laps(&self, ctx: &StintContext) -> Vec<u32> {
        let mut laps = Vec::with_capacity(self.stints.len().saturating_sub(1));
        let mut covered = 0;
        for stint in &self.stints[..self.stints.len() - 1] {
            covered += stint.planned_length;
            laps.push(ctx.current_lap + covered - ctx.tire_age);
        }
        laps
    }

    pub fn new_compound(&self) -> Option<Compound> {
        self.new_compound
    }

    pub fn expected_time_loss(&self) -> f64 {
        self.expected_time_loss
    }

    pub fn expected_position_delta(&self) -> f64 {
        self.expected_position_delta
    }

    pub fn risk_level(&self) -> RiskLevel {
        self.risk_level
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn is_no_stop(&self) -> bool {
        self.pit_lap.is_none()
    }
}

// ---------- Simulation ----------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationResult {
    pub position_distribution: BTreeMap<u32, f64>,
    pub win_probability: f64,
    pub podium_probability: f64,
    pub expected_points: f64,
    pub expected_finish_position: f64,
    pub position_std: f64,
    pub trials: u32,
}

impl SimulationResult {
    /// `counts[i]` is the number of trials finishing in position `i + 1`.
    pub fn from_counts(counts: &[u64], points_table: &[u32]) -> Self {
        let trials: u64 = counts.iter().sum();
        let n = trials.max(1) as f64;

        let mut position_distribution = BTreeMap::new();
        let mut expected_points = 0.0;
        let mut expected_finish_position = 0.0;
        for (i, &count) in counts.iter().enumerate() {
            let position = i as u32 + 1;
            let p = count as f64 / n;
            position_distribution.insert(position, p);
            expected_points += p * f64::from(points_table.get(i).copied().unwrap_or(0));
            expected_finish_position += p * f64::from(position);
        }

        let variance: f64 = position_distribution
            .iter()
            .map(|(&pos, &p)| p * (f64::from(pos) - expected_finish_position).powi(2))
            .sum();

        let win_probability = position_distribution.get(&1).copied().unwrap_or(0.0);
        let podium_probability = position_distribution.range(1..=3).map(|(_, p)| p).sum();

        Self {
            position_distribution,
            win_probability,
            podium_probability,
            expected_points,
            expected_finish_position,
            position_std: variance.sqrt(),
            trials: trials as u32,
        }
    }

    pub fn variance_risk(&self) -> RiskLevel {
        RiskLevel::from_position_std(self.position_std)
    }
}

// ---------- Recommendation ----------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImmediateAction {
    pub verb: ActionVerb,
    pub reason: String,
    pub confidence: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimalStrategy {
    pub pit_lap: u32,
    pub new_compound: Compound,
    pub expected_time_loss: f64,
    pub expected_position_delta: f64,
    pub risk_level: RiskLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alternative {
    pub candidate: StrategyCandidate,
    pub simulation: Option<SimulationResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Ahead,
    Behind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompetitorThreat {
    pub driver: String,
    pub position: u32,
    pub side: Side,
    pub gap: f64,
    pub compound: Compound,
    pub tire_age: u32,
    pub threat_level: RiskLevel,
    pub expected_pit_lap: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompetitorAnalysis {
    pub undercut_risk: RiskLevel,
    pub overcut_opportunity: RiskLevel,
    pub recommended_response: RecommendedResponse,
    pub undercut_threat: Option<CompetitorThreat>,
    pub overcut_target: Option<CompetitorThreat>,
    pub threats: Vec<CompetitorThreat>,
}

/// Stints longer than this count against a plan.
const LONG_STINT_LAPS: u32 = 35;
/// Expected positions lost beyond this count against a plan.
const POSITION_LOSS_LIMIT: f64 = 2.0;

/// Per-factor risk breakdown of the chosen plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub overall_risk: RiskLevel,
    pub tire_degradation_risk: RiskLevel,
    pub position_loss_risk: RiskLevel,
    pub stint_length_risk: RiskLevel,
    pub timing_risk: RiskLevel,
    /// Mean factor weight, LOW 1 to HIGH 3.
    pub risk_score: f64,
}

impl RiskAssessment {
    /// `timing_risk` is the undercut pressure from the car behind.
    pub fn assess(plan: &StrategyCandidate, timing_risk: RiskLevel) -> Self {
        let position_loss_risk = if plan.expected_position_delta() > POSITION_LOSS_LIMIT {
            RiskLevel::High
        } else {
            RiskLevel::Low
        };
        let longest = plan.stints().iter().map(|s| s.planned_length).max().unwrap_or(0);
        let stint_length_risk = if longest > LONG_STINT_LAPS {
            RiskLevel::High
        } else {
            RiskLevel::Low
        };
        let factors = [plan.risk_level(), position_loss_risk, stint_length_risk, timing_risk];
        let risk_score = factors.iter().map(|&f| risk_weight(f)).sum::<f64>() / factors.len() as f64;
        let overall_risk = if risk_score < 1.5 {
            RiskLevel::Low
        } else if risk_score < 2.5 {
            RiskLevel::Medium
        } else {
            RiskLevel::High
        };

        Self {
            overall_risk,
            tire_degradation_risk: plan.risk_level(),
            position_loss_risk,
            stint_length_risk,
            timing_risk,
            risk_score,
        }
    }
}

fn risk_weight(level: RiskLevel) -> f64 {
    match level {
        RiskLevel::Low => 1.0,
        RiskLevel::Medium => 2.0,
        RiskLevel::High => 3.0,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub driver: String,
    pub evaluated_lap: u32,
    pub immediate_action: ImmediateAction,
    pub optimal_strategy: OptimalStrategy,
    pub risk_assessment: RiskAssessment,
    pub alternatives: Vec<Alternative>,
    pub competitor_analysis: CompetitorAnalysis,
    pub decision_urgency: Urgency,
    pub decision_basis: DecisionBasis,
    pub degraded_mode: bool,
    pub simulation_available: bool,
    pub cycle_trace: Vec<CyclePhase>,
    pub key_insights: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(driver: &str, position: u32, compound: Compound, tire_age: u32) -> DriverEntry {
        DriverEntry {
            driver: driver.to_string(),
            position,
            compound,
            tire_age,
            gap_to_car_ahead: 2.0,
            gap_to_car_behind: 2.0,
        }
    }

    #[test]
    fn test_race_state_rejects_duplicate_positions() {
        let drivers = vec![
            entry("LEC", 1, Compound::Medium, 10),
            entry("HAM", 1, Compound::Hard, 12),
        ];
        let err = RaceState::new(10, 50, 30.0, 1, drivers).unwrap_err();
        assert!(matches!(err, StrategyError::InvalidRaceState(_)));
    }

    #[test]
    fn test_race_state_rejects_finished_race_and_bad_gaps() {
        let drivers = vec![entry("LEC", 1, Compound::Medium, 10)];
        assert!(RaceState::new(50, 50, 30.0, 1, drivers.clone()).is_err());
        assert!(RaceState::new(0, 50, 30.0, 1, drivers.clone()).is_err());
        assert!(RaceState::new(10, 50, f64::NAN, 1, drivers).is_err());

        let mut bad = entry("LEC", 1, Compound::Medium, 10);
        bad.gap_to_car_behind = -0.5;
        assert!(RaceState::new(10, 50, 30.0, 1, vec![bad]).is_err());
    }

    #[test]
    fn test_race_state_json_goes_through_validation() {
        let ok = r#"{
            "current_lap": 25, "total_laps": 58, "track_temp": 35.0, "track_id": 3,
            "drivers": [
                {"driver": "HAM", "position": 2, "compound": "HARD", "tire_age": 18, "gap_to_car_ahead": 2.1},
                {"driver": "LEC", "position": 1, "compound": "MEDIUM", "tire_age": 20}
            ]
        }"#;
        let state: RaceState = serde_json::from_str(ok).expect("valid snapshot");
        assert_eq!(state.drivers()[0].driver, "LEC");

        let dup = ok.replace("\"position\": 2", "\"position\": 1");
        assert!(serde_json::from_str::<RaceState>(&dup).is_err());
    }

    #[test]
    fn test_cumulative_gaps_walk_the_running_order() {
        let mut a = entry("VER", 1, Compound::Hard, 5);
        let mut b = entry("LEC", 2, Compound::Medium, 20);
        let mut c = entry("NOR", 3, Compound::Soft, 8);
        a.gap_to_car_behind = 1.5;
        b.gap_to_car_ahead = 1.5;
        b.gap_to_car_behind = 3.0;
        c.gap_to_car_ahead = 3.0;
        let state = RaceState::new(20, 50, 30.0, 1, vec![c, a, b]).unwrap();

        let behind = state.cars_behind("VER");
        assert_eq!(behind.len(), 2);
        assert!((behind[1].1 - 4.5).abs() < 1e-9);

        let ahead = state.cars_ahead("NOR");
        assert_eq!(ahead[0].0.driver, "LEC");
        assert!((ahead[1].1 - 4.5).abs() < 1e-9);

        assert_eq!(state.gaps_to_leader(), vec![0.0, 1.5, 4.5]);
    }

    #[test]
    fn test_candidate_invariants() {
        let ctx = StintContext {
            current_lap: 25,
            total_laps: 58,
            tire_age: 20,
            compound: Compound::Medium,
        };
        let c = StrategyCandidate::pit_stop(&ctx, 30, Compound::Hard, true).unwrap();
        let total: u32 = c.stints().iter().map(|s| s.planned_length).sum();
        assert_eq!(total, ctx.plan_length());
        assert_eq!(c.pit_lap(), Some(30));
        assert_eq!(c.pit_laps(&ctx), vec![30]);

        assert!(StrategyCandidate::pit_stop(&ctx, 30, Compound::Medium, true).is_err());
        assert!(StrategyCandidate::pit_stop(&ctx, 30, Compound::Medium, false).is_ok());
        assert!(StrategyCandidate::pit_stop(&ctx, 25, Compound::Hard, true).is_err());

        let short = vec![Stint {
            compound: Compound::Medium,
            planned_length: 10,
        }];
        assert!(StrategyCandidate::from_stints(&ctx, short, false).is_err());
    }

    #[test]
    fn test_risk_assessment_factors() {
        let ctx = StintContext {
            current_lap: 25,
            total_laps: 58,
            tire_age: 20,
            compound: Compound::Medium,
        };
        let calm = StrategyCandidate::pit_stop(&ctx, 30, Compound::Hard, true)
            .unwrap()
            .assessed(10.0, 1.0, RiskLevel::Low);
        let r = RiskAssessment::assess(&calm, RiskLevel::Low);
        assert_eq!(r.overall_risk, RiskLevel::Low);
        assert_eq!(r.stint_length_risk, RiskLevel::Low);
        assert_eq!(r.risk_score, 1.0);

        // 2 + 1 + 1 + 2 over four factors sits on the MEDIUM boundary.
        let pressed = calm.clone().assessed(10.0, 0.0, RiskLevel::Medium);
        let r = RiskAssessment::assess(&pressed, RiskLevel::Medium);
        assert_eq!(r.risk_score, 1.5);
        assert_eq!(r.overall_risk, RiskLevel::Medium);

        // A 40-lap first stint that drops three places under undercut pressure.
        let late = StrategyCandidate::pit_stop(&ctx, 45, Compound::Hard, true)
            .unwrap()
            .assessed(30.0, 3.0, RiskLevel::Medium);
        let r = RiskAssessment::assess(&late, RiskLevel::High);
        assert_eq!(r.stint_length_risk, RiskLevel::High);
        assert_eq!(r.position_loss_risk, RiskLevel::High);
        assert_eq!(r.tire_degradation_risk, RiskLevel::Medium);
        assert_eq!(r.overall_risk, RiskLevel::High);
    }

    #[test]
    fn test_forecast_risk_from_interval_width() {
        let narrow = DegradationForecast::from_interval(0.05, 0.04, 0.06);
        assert_eq!(narrow.risk_level, RiskLevel::Low);
        let wide = DegradationForecast::from_interval(0.05, 0.0, 0.1);
        assert_eq!(wide.risk_level, RiskLevel::High);
        let clamped = DegradationForecast::from_interval(-0.02, -0.05, 0.01);
        assert_eq!(clamped.rate, 0.0);
        assert!(clamped.lower_bound <= clamped.rate && clamped.rate <= clamped.upper_bound);
    }

    #[test]
    fn test_simulation_result_from_counts() {
        let r = SimulationResult::from_counts(&[2, 1, 1, 0], &[25, 18, 15, 12]);
        let sum: f64 = r.position_distribution.values().sum();
        assert!((sum - 1.0).abs() < 1e-9);
        assert_eq!(r.win_probability, 0.5);
        assert_eq!(r.podium_probability, 1.0);
        assert!((r.expected_points - (0.5 * 25.0 + 0.25 * 18.0 + 0.25 * 15.0)).abs() < 1e-9);
        assert!((r.expected_finish_position - 1.75).abs() < 1e-9);
    }

    #[test]
    fn test_urgency_thresholds() {
        assert_eq!(Urgency::from_laps_to_stop(2), Urgency::Immediate);
        assert_eq!(Urgency::from_laps_to_stop(5), Urgency::Soon);
        assert_eq!(Urgency::from_laps_to_stop(10), Urgency::Monitor);
        assert_eq!(Urgency::from_laps_to_stop(11), Urgency::Low);
        assert!(RiskLevel::High > RiskLevel::Medium && RiskLevel::Medium > RiskLevel::Low);
    }
}
