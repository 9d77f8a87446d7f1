use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};

use crate::error::{Result, StrategyError};
use crate::types::Compound;

/// Static degradation table used whenever the trained model is unavailable.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct FallbackRates {
    pub soft: f64,
    pub medium: f64,
    pub hard: f64,
    /// Relative rate change per °C away from `reference_temp`.
    pub temp_coefficient: f64,
    pub reference_temp: f64,
    /// Half-width of the fallback interval as a fraction of the rate.
    pub interval_fraction: f64,
}

impl Default for FallbackRates {
    fn default() -> Self {
        Self {
            soft: 0.08,
            medium: 0.05,
            hard: 0.03,
            temp_coefficient: 0.01,
            reference_temp: 30.0,
            interval_fraction: 0.2,
        }
    }
}

impl FallbackRates {
    /// Nominal rate for a compound, before temperature scaling.
    pub fn base_rate(&self, compound: Compound) -> f64 {
        match compound {
            Compound::Soft => self.soft,
            Compound::Medium => self.medium,
            Compound::Hard => self.hard,
        }
    }

    pub fn rate_at(&self, compound: Compound, track_temp: f64) -> f64 {
        let factor = 1.0 + (track_temp - self.reference_temp) * self.temp_coefficient;
        (self.base_rate(compound) * factor).max(0.0)
    }
}

/// Laps a compound usually runs before a stop. Drives rival pit-window estimates.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct TypicalStints {
    pub soft: u32,
    pub medium: u32,
    pub hard: u32,
}

impl Default for TypicalStints {
    fn default() -> Self {
        Self {
            soft: 18,
            medium: 28,
            hard: 38,
        }
    }
}

impl TypicalStints {
    pub fn for_compound(&self, compound: Compound) -> u32 {
        match compound {
            Compound::Soft => self.soft,
            Compound::Medium => self.medium,
            Compound::Hard => self.hard,
        }
    }

    /// Lap a car is expected to stop on, never earlier than the next lap.
    pub fn expected_pit_lap(&self, current_lap: u32, compound: Compound, tire_age: u32) -> u32 {
        current_lap + self.for_compound(compound).saturating_sub(tire_age).max(1)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub pit_loss_seconds: f64,
    /// Chance of at least one safety car over the whole race.
    pub safety_car_probability: f64,
    pub safety_car_pit_loss_factor: f64,
    pub simulation_trials: u32,
    pub simulation_workers: usize,
    pub horizon_cap: u32,
    pub gap_threshold_seconds: f64,
    pub safety_degradation_multiplier: f64,
    pub max_tire_age: u32,
    pub points_table: Vec<u32>,
    pub min_stint_length: u32,
    pub max_stint_length: u32,
    pub require_compound_change: bool,
    pub fallback: FallbackRates,
    pub track_temp_min: f64,
    pub track_temp_max: f64,
    pub typical_stints: TypicalStints,
    pub competitor_pit_jitter_laps: u32,
    pub forecast_timeout_ms: u64,
    pub simulation_deadline_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pit_loss_seconds: 22.0,
            safety_car_probability: 0.25,
            safety_car_pit_loss_factor: 0.5,
            simulation_trials: 500,
            simulation_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            horizon_cap: 15,
            gap_threshold_seconds: 10.0,
            safety_degradation_multiplier: 2.0,
            max_tire_age: 40,
            points_table: vec![25, 18, 15, 12, 10, 8, 6, 4, 2, 1],
            min_stint_length: 5,
            max_stint_length: 45,
            require_compound_change: true,
            fallback: FallbackRates::default(),
            track_temp_min: -10.0,
            track_temp_max: 60.0,
            typical_stints: TypicalStints::default(),
            competitor_pit_jitter_laps: 2,
            forecast_timeout_ms: 250,
            simulation_deadline_ms: 2_000,
        }
    }
}

impl EngineConfig {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let cfg: EngineConfig = serde_json::from_str(&data)
            .with_context(|| format!("invalid config JSON in {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(StrategyError::InvalidConfig(msg.to_string()));

        if !(self.pit_loss_seconds.is_finite() && self.pit_loss_seconds >= 0.0) {
            return invalid("pit_loss_seconds must be a non-negative number");
        }
        if !(0.0..=1.0).contains(&self.safety_car_probability) {
            return invalid("safety_car_probability must be within 0..=1");
        }
        if !(0.0..=1.0).contains(&self.safety_car_pit_loss_factor) {
            return invalid("safety_car_pit_loss_factor must be within 0..=1");
        }
        if self.simulation_trials == 0 {
            return invalid("simulation_trials must be > 0");
        }
        if self.simulation_workers == 0 {
            return invalid("simulation_workers must be > 0");
        }
        if self.horizon_cap == 0 {
            return invalid("horizon_cap must be > 0");
        }
        if !(self.gap_threshold_seconds.is_finite() && self.gap_threshold_seconds > 0.0) {
            return invalid("gap_threshold_seconds must be positive");
        }
        if !(self.safety_degradation_multiplier.is_finite()
            && self.safety_degradation_multiplier > 0.0)
        {
            return invalid("safety_degradation_multiplier must be positive");
        }
        if self.points_table.is_empty() {
            return invalid("points_table must not be empty");
        }
        if self.min_stint_length == 0 || self.min_stint_length > self.max_stint_length {
            return invalid("stint limits must satisfy 0 < min_stint_length <= max_stint_length");
        }
        if self.track_temp_min >= self.track_temp_max {
            return invalid("track_temp_min must be below track_temp_max");
        }
        let fb = &self.fallback;
        if [fb.soft, fb.medium, fb.hard].iter().any(|r| !r.is_finite() || *r < 0.0) {
            return invalid("fallback rates must be non-negative");
        }
        if !(0.0..1.0).contains(&fb.interval_fraction) {
            return invalid("fallback.interval_fraction must be within 0..1");
        }
        Ok(())
    }

    pub fn forecast_timeout(&self) -> Duration {
        Duration::from_millis(self.forecast_timeout_ms)
    }

    pub fn simulation_deadline(&self) -> Duration {
        Duration::from_millis(self.simulation_deadline_ms)
    }
}
