use std::cmp::Ordering;
use std::ops::RangeInclusive;

use crate::config::EngineConfig;
use crate::error::{Result, StrategyError};
use crate::forecast::ForecastTable;
use crate::types::{Compound, DriverEntry, RaceState, RiskLevel, StintContext, StrategyCandidate};

/// Seconds a fresh set is worth over a rival on old tires during an undercut.
const UNDERCUT_FRESH_TIRE_GAIN_S: f64 = 2.0;

/// Sum of tire ages driven from `from_age + 1` through `to_age`.
/// With linear degradation this is the stint's time loss per unit rate.
fn age_sum(from_age: u32, to_age: u32) -> f64 {
    let tri = |n: u32| f64::from(n) * (f64::from(n) + 1.0) / 2.0;
    tri(to_age) - tri(from_age)
}

pub struct PitWindowOptimizer {
    pit_loss: f64,
    horizon_cap: u32,
    min_stint: u32,
    max_stint: u32,
    require_compound_change: bool,
    gap_threshold: f64,
}

impl PitWindowOptimizer {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            pit_loss: config.pit_loss_seconds,
            horizon_cap: config.horizon_cap,
            min_stint: config.min_stint_length,
            max_stint: config.max_stint_length,
            require_compound_change: config.require_compound_change,
            gap_threshold: config.gap_threshold_seconds,
        }
    }

    /// Laps worth evaluating. Empty when no full stint fits before the flag.
    pub fn candidate_laps(&self, ctx: &StintContext) -> RangeInclusive<u32> {
        let first = ctx.current_lap + 1;
        let last = (ctx.current_lap + self.horizon_cap)
            .min(ctx.total_laps.saturating_sub(self.min_stint));
        first..=last
    }

    pub fn allowed_compounds(&self, current: Compound) -> impl Iterator<Item = Compound> + '_ {
        Compound::ALL
            .into_iter()
            .filter(move |c| !self.require_compound_change || *c != current)
    }

    /// Net positions lost by stopping now: +1 per car behind inside the pit loss,
    /// -1 per car ahead close enough to undercut. Reads the gaps as they stand this lap;
    /// no attempt is made to project them forward to later stop laps.
    pub fn estimate_position_change(&self, state: &RaceState, driver: &str) -> f64 {
        let window = self.pit_loss.max(self.gap_threshold);
        let lost = state
            .cars_behind(driver)
            .iter()
            .take_while(|(_, gap)| *gap <= window)
            .filter(|(_, gap)| *gap < self.pit_loss)
            .count();
        let gained = state
            .cars_ahead(driver)
            .iter()
            .take_while(|(_, gap)| *gap <= window)
            .filter(|(_, gap)| *gap < self.pit_loss - UNDERCUT_FRESH_TIRE_GAIN_S)
            .count();
        lost as f64 - gained as f64
    }

    /// Scores a single one-stop plan against staying out to the flag.
    pub fn evaluate(
        &self,
        ctx: &StintContext,
        table: &ForecastTable,
        pit_lap: u32,
        new_compound: Compound,
        position_delta: f64,
    ) -> Result<StrategyCandidate> {
        let candidate =
            StrategyCandidate::pit_stop(ctx, pit_lap, new_compound, self.require_compound_change)?;

        let k = pit_lap - ctx.current_lap;
        let a0 = ctx.tire_age;
        let new_len = ctx.total_laps - pit_lap;
        let base_len = a0 + ctx.total_laps - ctx.current_lap;

        let current = table.get(ctx.compound, a0 + k);
        let fresh = table.get(new_compound, new_len);
        let baseline = table.get(ctx.compound, base_len);

        let loss = current.rate * age_sum(a0, a0 + k) + fresh.rate * age_sum(0, new_len)
            + self.pit_loss
            - baseline.rate * age_sum(a0, base_len);
        let risk = current.risk_level.max(fresh.risk_level);

        Ok(candidate.assessed(loss, position_delta, risk))
    }

    /// All feasible one-stop plans, best first. Every plan carries the same
    /// [`estimate_position_change`](Self::estimate_position_change) for the current gaps.
    pub fn rank(
        &self,
        state: &RaceState,
        subject: &DriverEntry,
        table: &ForecastTable,
    ) -> Result<Vec<StrategyCandidate>> {
        let ctx = StintContext::for_driver(state, subject);
        let delta = self.estimate_position_change(state, &subject.driver);

        let mut out = Vec::new();
        for pit_lap in self.candidate_laps(&ctx) {
            let k = pit_lap - ctx.current_lap;
            if k > 1 && ctx.tire_age + k > self.max_stint {
                break;
            }
            if ctx.total_laps - pit_lap > self.max_stint {
                continue;
            }
            for compound in self.allowed_compounds(ctx.compound) {
                out.push(self.evaluate(&ctx, table, pit_lap, compound, delta)?);
            }
        }

        if out.is_empty() {
            return Err(StrategyError::NoFeasibleStrategy(format!(
                "no stop between lap {} and {} leaves a {}-lap stint",
                ctx.current_lap + 1,
                ctx.total_laps,
                self.min_stint
            )));
        }

        out.sort_by(compare_candidates);
        tracing::debug!(
            driver = %subject.driver,
            candidates = out.len(),
            best_lap = ?out[0].pit_lap(),
            "pit window ranked"
        );
        Ok(out)
    }

    /// Like [`rank`](Self::rank), but an exhausted horizon yields a single no-stop plan.
    pub fn optimize(
        &self,
        state: &RaceState,
        subject: &DriverEntry,
        table: &ForecastTable,
    ) -> Vec<StrategyCandidate> {
        match self.rank(state, subject, table) {
            Ok(ranked) => ranked,
            Err(err) => {
                tracing::info!(driver = %subject.driver, "{err}; continuing to the flag");
                let ctx = StintContext::for_driver(state, subject);
                vec![StrategyCandidate::no_stop(&ctx, err.to_string())]
            }
        }
    }
}

/// Ascending loss. Equal losses favour the later lap (track position), or the
/// earlier lap when the plan's forecast risk is HIGH.
fn compare_candidates(a: &StrategyCandidate, b: &StrategyCandidate) -> Ordering {
    let lap_key = |c: &StrategyCandidate| {
        let lap = i64::from(c.pit_lap().unwrap_or(0));
        if c.risk_level() == RiskLevel::High {
            lap
        } else {
            -lap
        }
    };
    a.expected_time_loss()
        .total_cmp(&b.expected_time_loss())
        .then_with(|| lap_key(a).cmp(&lap_key(b)))
        .then_with(|| a.new_compound().cmp(&b.new_compound()))
}
