use std::sync::Arc;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::error::{Result, StrategyError};
use crate::forecast::{ForecastAdapter, ForecastTable, TableRequest};
use crate::optimizer::PitWindowOptimizer;
use crate::scenario::{ScenarioOutcome, ScenarioReport};
use crate::simulator::{RaceOutcomeSimulator, SimulationControl};
use crate::threat::CompetitorThreatAnalyzer;
use crate::types::{
    ActionVerb, Alternative, CompetitorAnalysis, CyclePhase, DecisionBasis, DriverEntry,
    ImmediateAction, OptimalStrategy, RaceState, Recommendation, RiskAssessment, RiskLevel,
    SimulationResult, StintContext, StrategyCandidate, Urgency,
};

/// Name given to the unmodified race state in a scenario comparison.
pub const BASE_SCENARIO: &str = "base";

/// Per-call overrides. Unset fields fall back to the engine config.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvaluationOptions {
    /// Fixes every simulation's random stream.
    pub seed: Option<u64>,
    pub forecast_timeout: Option<Duration>,
    pub simulation_deadline: Option<Duration>,
}

impl EvaluationOptions {
    pub fn seeded(seed: u64) -> Self {
        Self {
            seed: Some(seed),
            ..Self::default()
        }
    }
}

/// Cancels in-flight simulations when the cycle is dropped or finishes early.
struct CancelOnDrop(SimulationControl);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

struct Decision {
    chosen: StrategyCandidate,
    basis: DecisionBasis,
    reason: String,
}

pub struct StrategyEngine {
    config: EngineConfig,
    forecasts: Arc<ForecastAdapter>,
    optimizer: PitWindowOptimizer,
    threats: CompetitorThreatAnalyzer,
    simulator: Arc<RaceOutcomeSimulator>,
}

impl StrategyEngine {
    pub fn new(config: EngineConfig, forecasts: Arc<ForecastAdapter>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            optimizer: PitWindowOptimizer::new(&config),
            threats: CompetitorThreatAnalyzer::new(&config),
            simulator: Arc::new(RaceOutcomeSimulator::new(&config)?),
            forecasts,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn forecasts(&self) -> &Arc<ForecastAdapter> {
        &self.forecasts
    }

    /// Simulation trials completed by this engine so far.
    pub fn simulated_trials(&self) -> u64 {
        self.simulator.trials_run()
    }

    /// Evaluates `base` and then every named scenario for `driver`, in order, and ranks them
    /// by pit lap plus a risk penalty. Scenarios share `opts`, seed included.
    pub async fn compare_scenarios(
        &self,
        base: &RaceState,
        scenarios: &[(String, RaceState)],
        driver: &str,
        opts: EvaluationOptions,
    ) -> Result<ScenarioReport> {
        let mut outcomes = Vec::with_capacity(scenarios.len() + 1);
        outcomes.push(ScenarioOutcome::new(
            BASE_SCENARIO,
            self.recommend(base, driver, opts).await?,
        ));
        for (name, state) in scenarios {
            let rec = self.recommend(state, driver, opts).await?;
            outcomes.push(ScenarioOutcome::new(name.clone(), rec));
        }

        let report = ScenarioReport::new(outcomes);
        tracing::info!(
            driver,
            scenarios = report.scenarios.len(),
            best = ?report.best_scenario,
            "scenario comparison finished"
        );
        Ok(report)
    }

    /// Runs one full evaluation cycle for `driver`.
    ///
    /// Only an invalid race state (or unknown driver) is an error. Model trouble, an
    /// exhausted pit window and slow simulations all still produce a recommendation.
    pub async fn recommend(
        &self,
        state: &RaceState,
        driver: &str,
        opts: EvaluationOptions,
    ) -> Result<Recommendation> {
        let mut trace = vec![CyclePhase::Init];
        let subject = state
            .driver(driver)
            .ok_or_else(|| {
                StrategyError::InvalidRaceState(format!("driver {driver} is not in the race state"))
            })?
            .clone();

        enter(&mut trace, CyclePhase::Forecasting);
        let req = TableRequest {
            track_temp: state.track_temp(),
            track_id: state.track_id(),
            driver: subject.driver.clone(),
            max_stint_length: self
                .config
                .max_stint_length
                .max(state.max_tire_age() + state.remaining_laps()),
        };
        let timeout = opts
            .forecast_timeout
            .unwrap_or_else(|| self.config.forecast_timeout());
        let table = Arc::new(ForecastAdapter::forecast_table(&self.forecasts, req, timeout).await);
        let degraded = table.is_degraded();
        if degraded {
            enter(&mut trace, CyclePhase::Degraded);
        }

        enter(&mut trace, CyclePhase::Optimizing);
        let ranked = self.optimizer.optimize(state, &subject, &table);

        enter(&mut trace, CyclePhase::ThreatAnalysis);
        let analysis = self.threats.analyze(state, &subject);

        let decision = self.decide(state, &subject, &table, &ranked, &analysis);
        let ctx = StintContext::for_driver(state, &subject);
        let candidates = alternatives(&ctx, &decision.chosen, &ranked);

        enter(&mut trace, CyclePhase::Simulating);
        let deadline = opts
            .simulation_deadline
            .unwrap_or_else(|| self.config.simulation_deadline());
        let simulations = self
            .simulate_all(state, driver, &table, &candidates, opts.seed, deadline)
            .await;

        enter(&mut trace, CyclePhase::Assembling);
        let recommendation = self.assemble(
            state,
            &subject,
            &table,
            decision,
            analysis,
            candidates,
            simulations,
            trace,
        );

        tracing::info!(
            driver = %recommendation.driver,
            lap = recommendation.evaluated_lap,
            verb = ?recommendation.immediate_action.verb,
            pit_lap = recommendation.optimal_strategy.pit_lap,
            compound = %recommendation.optimal_strategy.new_compound,
            basis = ?recommendation.decision_basis,
            degraded = recommendation.degraded_mode,
            "strategy recommendation ready"
        );
        Ok(recommendation)
    }

    /// Current-set degradation past the safety limit, or tires older than allowed.
    fn safety_trigger(&self, subject: &DriverEntry, table: &ForecastTable) -> Option<String> {
        let rate = table.get(subject.compound, subject.tire_age.max(1)).rate;
        let limit =
            self.config.safety_degradation_multiplier * self.forecasts.nominal_rate(subject.compound);
        if rate > limit {
            Some(format!(
                "{} degradation {rate:.3}s/lap is past the {limit:.3}s/lap safety limit",
                subject.compound
            ))
        } else if subject.tire_age > self.config.max_tire_age {
            Some(format!(
                "{}-lap-old {} tires exceed the {}-lap limit",
                subject.tire_age, subject.compound, self.config.max_tire_age
            ))
        } else {
            None
        }
    }

    /// Best stop on `lap`: taken from the ranking when present, otherwise evaluated directly
    /// (the stint-length filters do not apply to a forced stop).
    fn best_stop_at(
        &self,
        state: &RaceState,
        subject: &DriverEntry,
        table: &ForecastTable,
        ranked: &[StrategyCandidate],
        lap: u32,
    ) -> Option<StrategyCandidate> {
        if let Some(found) = ranked.iter().find(|c| c.pit_lap() == Some(lap)) {
            return Some(found.clone());
        }
        let ctx = StintContext::for_driver(state, subject);
        let delta = self.optimizer.estimate_position_change(state, &subject.driver);
        self.optimizer
            .allowed_compounds(subject.compound)
            .filter_map(|compound| self.optimizer.evaluate(&ctx, table, lap, compound, delta).ok())
            .min_by(|a, b| a.expected_time_loss().total_cmp(&b.expected_time_loss()))
    }

    /// Safety override, then the optimizer, then the undercut cover.
    fn decide(
        &self,
        state: &RaceState,
        subject: &DriverEntry,
        table: &ForecastTable,
        ranked: &[StrategyCandidate],
        analysis: &CompetitorAnalysis,
    ) -> Decision {
        let next_lap = state.current_lap() + 1;

        if let Some(reason) = self.safety_trigger(subject, table) {
            if let Some(chosen) = self.best_stop_at(state, subject, table, ranked, next_lap) {
                tracing::warn!(driver = %subject.driver, %reason, "safety override");
                return Decision {
                    reason: format!("Box now: {reason}"),
                    chosen,
                    basis: DecisionBasis::SafetyOverride,
                };
            }
            tracing::warn!(driver = %subject.driver, %reason, "safety limit hit with no lap left to stop");
        }

        let best = ranked[0].clone();
        let Some(optimal_lap) = best.pit_lap() else {
            return Decision {
                reason: best
                    .reason()
                    .map_or_else(|| "Stay out to the flag".to_string(), |r| format!("Stay out to the flag: {r}")),
                chosen: best,
                basis: DecisionBasis::NoFeasibleStrategy,
            };
        };

        if analysis.undercut_risk == RiskLevel::High && optimal_lap - state.current_lap() > 2 {
            if let Some(rival) = &analysis.undercut_threat {
                let cover = rival
                    .expected_pit_lap
                    .saturating_sub(1)
                    .min(state.current_lap() + 2)
                    .max(next_lap)
                    .min(optimal_lap);
                if cover < optimal_lap {
                    if let Some(chosen) = self.best_stop_at(state, subject, table, ranked, cover) {
                        tracing::info!(
                            driver = %subject.driver,
                            rival = %rival.driver,
                            optimal_lap,
                            cover,
                            "covering undercut"
                        );
                        return Decision {
                            reason: format!(
                                "Cover the undercut from {} ({:.1}s behind, expected to stop lap {}): box lap {cover} instead of {optimal_lap}",
                                rival.driver, rival.gap, rival.expected_pit_lap
                            ),
                            chosen,
                            basis: DecisionBasis::CompetitorOverride,
                        };
                    }
                }
            }
        }

        Decision {
            reason: format!(
                "Box lap {optimal_lap} for {}: {:+.1}s against staying out",
                best.new_compound().unwrap_or(subject.compound),
                best.expected_time_loss()
            ),
            chosen: best,
            basis: DecisionBasis::Optimizer,
        }
    }

    /// Simulates every alternative concurrently under one deadline.
    /// Failures leave that alternative without a result; they never fail the cycle.
    async fn simulate_all(
        &self,
        state: &RaceState,
        driver: &str,
        table: &Arc<ForecastTable>,
        candidates: &[StrategyCandidate],
        seed: Option<u64>,
        deadline: Duration,
    ) -> Vec<Option<SimulationResult>> {
        let control = SimulationControl::with_timeout(deadline);
        let _guard = CancelOnDrop(control.clone());
        let state = Arc::new(state.clone());

        let jobs = candidates.iter().cloned().map(|candidate| {
            let simulator = Arc::clone(&self.simulator);
            let state = Arc::clone(&state);
            let table = Arc::clone(table);
            let control = control.clone();
            let driver = driver.to_string();
            tokio::task::spawn_blocking(move || {
                simulator.simulate(&state, &driver, &candidate, &table, seed, &control)
            })
        });

        match tokio::time::timeout(deadline, futures::future::join_all(jobs)).await {
            Ok(done) => done
                .into_iter()
                .map(|joined| match joined {
                    Ok(Ok(result)) => Some(result),
                    Ok(Err(e)) => {
                        tracing::warn!(error = %e, "simulation unavailable");
                        None
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "simulation worker failed");
                        None
                    }
                })
                .collect(),
            Err(_) => {
                control.cancel();
                tracing::warn!(
                    deadline_ms = deadline.as_millis() as u64,
                    "simulations missed the deadline"
                );
                vec![None; candidates.len()]
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        &self,
        state: &RaceState,
        subject: &DriverEntry,
        table: &ForecastTable,
        decision: Decision,
        analysis: CompetitorAnalysis,
        candidates: Vec<StrategyCandidate>,
        simulations: Vec<Option<SimulationResult>>,
        mut trace: Vec<CyclePhase>,
    ) -> Recommendation {
        let Decision { chosen, basis, reason } = decision;
        let current_lap = state.current_lap();
        let chosen_sim = simulations.first().cloned().flatten();
        let simulation_available = chosen_sim.is_some();
        let degraded = table.is_degraded();

        let risk = chosen_sim
            .as_ref()
            .map_or(chosen.risk_level(), |s| chosen.risk_level().max(s.variance_risk()));

        let pit_lap = chosen.pit_lap();
        let decision_urgency = match (basis, pit_lap) {
            (DecisionBasis::NoFeasibleStrategy, _) | (_, None) => Urgency::Low,
            (_, Some(lap)) => Urgency::from_laps_to_stop(lap - current_lap),
        };
        let verb = if basis == DecisionBasis::SafetyOverride || pit_lap == Some(current_lap + 1) {
            ActionVerb::PitNow
        } else {
            ActionVerb::Continue
        };

        let optimal_strategy = OptimalStrategy {
            pit_lap: pit_lap.unwrap_or(state.total_laps()),
            new_compound: chosen.new_compound().unwrap_or(subject.compound),
            expected_time_loss: chosen.expected_time_loss(),
            expected_position_delta: chosen.expected_position_delta(),
            risk_level: risk,
        };

        let risk_assessment = RiskAssessment::assess(&chosen, analysis.undercut_risk);
        let key_insights = insights(table, &analysis, chosen_sim.as_ref(), basis);

        let alternatives = candidates
            .into_iter()
            .zip(simulations)
            .map(|(candidate, simulation)| Alternative {
                candidate,
                simulation,
            })
            .collect();

        enter(&mut trace, CyclePhase::Done);
        Recommendation {
            driver: subject.driver.clone(),
            evaluated_lap: current_lap,
            immediate_action: ImmediateAction {
                verb,
                reason,
                confidence: confidence(basis, risk, degraded, simulation_available),
            },
            optimal_strategy,
            risk_assessment,
            alternatives,
            competitor_analysis: analysis,
            decision_urgency,
            decision_basis: basis,
            degraded_mode: degraded,
            simulation_available,
            cycle_trace: trace,
            key_insights,
        }
    }
}

fn enter(trace: &mut Vec<CyclePhase>, phase: CyclePhase) {
    tracing::debug!(?phase, "cycle phase");
    trace.push(phase);
}

fn same_plan(a: &StrategyCandidate, b: &StrategyCandidate) -> bool {
    a.pit_lap() == b.pit_lap() && a.new_compound() == b.new_compound()
}

/// Chosen plan first, then the best earlier stop and the best later stop.
/// Without an earlier stop the next best distinct plan stands in; without a later one, staying out.
fn alternatives(
    ctx: &StintContext,
    chosen: &StrategyCandidate,
    ranked: &[StrategyCandidate],
) -> Vec<StrategyCandidate> {
    let Some(lap) = chosen.pit_lap() else {
        return vec![chosen.clone()];
    };

    let mut out = vec![chosen.clone()];
    let earlier = ranked
        .iter()
        .find(|c| c.pit_lap().is_some_and(|p| p < lap))
        .or_else(|| ranked.iter().find(|c| !same_plan(c, chosen)));
    if let Some(e) = earlier {
        out.push(e.clone());
    }

    let later = ranked
        .iter()
        .find(|c| c.pit_lap().is_some_and(|p| p > lap) && !out.iter().any(|o| same_plan(o, c)));
    match later {
        Some(l) => out.push(l.clone()),
        None if !out.iter().any(StrategyCandidate::is_no_stop) => {
            out.push(StrategyCandidate::no_stop(ctx, "stay out to the flag"));
        }
        None => {}
    }
    out
}

fn confidence(basis: DecisionBasis, risk: RiskLevel, degraded: bool, simulated: bool) -> u8 {
    let mut score: i32 = match (basis, risk) {
        (DecisionBasis::SafetyOverride, _) => 90,
        (_, RiskLevel::Low) => 85,
        (_, RiskLevel::Medium) => 70,
        (_, RiskLevel::High) => 55,
    };
    if degraded {
        score -= 15;
    }
    if !simulated {
        score -= 10;
    }
    score.clamp(0, 100) as u8
}

fn insights(
    table: &ForecastTable,
    analysis: &CompetitorAnalysis,
    simulation: Option<&SimulationResult>,
    basis: DecisionBasis,
) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(reason) = table.degraded_reason() {
        out.push(format!("Degradation model unavailable, static rates in use ({reason})"));
    }
    if basis == DecisionBasis::SafetyOverride {
        out.push("Tire safety limit reached; strategy ranking overridden".to_string());
    }
    if let Some(t) = &analysis.undercut_threat {
        if t.threat_level >= RiskLevel::Medium {
            out.push(format!(
                "{} undercut risk from {} ({:.1}s behind on {} age {})",
                t.threat_level.as_str(),
                t.driver,
                t.gap,
                t.compound,
                t.tire_age
            ));
        }
    }
    if let Some(t) = &analysis.overcut_target {
        if t.threat_level >= RiskLevel::Medium {
            out.push(format!(
                "Overcut opportunity on {} ({:.1}s ahead, expected to stop lap {})",
                t.driver, t.gap, t.expected_pit_lap
            ));
        }
    }
    match simulation {
        Some(s) => out.push(format!(
            "Simulated {} races: win {:.0}%, podium {:.0}%, expected P{:.1}",
            s.trials,
            s.win_probability * 100.0,
            s.podium_probability * 100.0,
            s.expected_finish_position
        )),
        None => out.push("Outcome simulation unavailable this lap".to_string()),
    }
    out
}
