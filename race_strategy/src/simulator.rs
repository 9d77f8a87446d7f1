use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use crate::config::{EngineConfig, TypicalStints};
use crate::error::{Result, StrategyError};
use crate::forecast::ForecastTable;
use crate::types::{Compound, RaceState, SimulationResult, StintContext, StrategyCandidate};

const PACE_NOISE_S: f64 = 0.15;
const SAFETY_CAR_MIN_LAPS: u32 = 3;
const SAFETY_CAR_MAX_LAPS: u32 = 6;
const SAFETY_CAR_GAP_S: f64 = 1.0;
/// Rivals due this close to the flag run to the end instead.
const NO_STOP_WINDOW_LAPS: u32 = 2;

/// Deadline and cancel flag shared by every trial of a cycle.
#[derive(Debug, Clone, Default)]
pub struct SimulationControl {
    deadline: Option<Instant>,
    cancel: Arc<AtomicBool>,
}

impl SimulationControl {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(StrategyError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(StrategyError::SimulationTimeout),
            _ => Ok(()),
        }
    }
}

fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Independent stream per trial, so results do not depend on which worker ran it.
fn trial_seed(seed: u64, trial: u32) -> u64 {
    splitmix64(seed ^ splitmix64(u64::from(trial)))
}

#[derive(Debug, Clone)]
struct SimCar {
    elapsed: f64,
    compound: Compound,
    tire_age: u32,
    /// Remaining stops as (lap, compound fitted), in lap order.
    stops: Vec<(u32, Compound)>,
}

pub struct RaceOutcomeSimulator {
    pool: rayon::ThreadPool,
    trials: u32,
    pit_loss: f64,
    safety_car_probability: f64,
    safety_car_pit_loss_factor: f64,
    points_table: Vec<u32>,
    typical_stints: TypicalStints,
    pit_jitter: u32,
    /// Trials completed over the simulator's lifetime.
    completed: AtomicU64,
}

impl RaceOutcomeSimulator {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.simulation_workers)
            .thread_name(|i| format!("race-sim-{i}"))
            .build()
            .map_err(|e| StrategyError::Worker(format!("failed to build simulation pool: {e}")))?;
        Ok(Self {
            pool,
            trials: config.simulation_trials,
            pit_loss: config.pit_loss_seconds,
            safety_car_probability: config.safety_car_probability,
            safety_car_pit_loss_factor: config.safety_car_pit_loss_factor,
            points_table: config.points_table.clone(),
            typical_stints: config.typical_stints.clone(),
            pit_jitter: config.competitor_pit_jitter_laps,
            completed: AtomicU64::new(0),
        })
    }

    pub fn trials(&self) -> u32 {
        self.trials
    }

    pub fn trials_run(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Runs every trial of `candidate` for `driver` and aggregates finishing positions.
    /// Never returns partial results: a cancel or an expired deadline fails the whole run.
    pub fn simulate(
        &self,
        state: &RaceState,
        driver: &str,
        candidate: &StrategyCandidate,
        table: &ForecastTable,
        seed: Option<u64>,
        control: &SimulationControl,
    ) -> Result<SimulationResult> {
        control.check()?;
        let subject_idx = state
            .drivers()
            .iter()
            .position(|d| d.driver == driver)
            .ok_or_else(|| StrategyError::InvalidRaceState(format!("unknown driver {driver}")))?;

        let grid = self.starting_grid(state, subject_idx, candidate);
        let field = grid.len();
        let seed = seed.unwrap_or_else(rand::random);
        let started = Instant::now();

        let counts = self.pool.install(|| {
            (0..self.trials)
                .into_par_iter()
                .try_fold(
                    || vec![0u64; field],
                    |mut counts, trial| {
                        control.check()?;
                        let mut rng = StdRng::seed_from_u64(trial_seed(seed, trial));
                        let position = self.run_trial(state, &grid, subject_idx, table, &mut rng);
                        counts[position - 1] += 1;
                        self.completed.fetch_add(1, Ordering::Relaxed);
                        Ok::<_, StrategyError>(counts)
                    },
                )
                .try_reduce(
                    || vec![0u64; field],
                    |mut acc, part| {
                        for (a, p) in acc.iter_mut().zip(part) {
                            *a += p;
                        }
                        Ok(acc)
                    },
                )
        })?;

        let result = SimulationResult::from_counts(&counts, &self.points_table);
        tracing::debug!(
            driver,
            pit_lap = ?candidate.pit_lap(),
            trials = result.trials,
            expected_finish = result.expected_finish_position,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "simulation finished"
        );
        Ok(result)
    }

    fn starting_grid(
        &self,
        state: &RaceState,
        subject_idx: usize,
        candidate: &StrategyCandidate,
    ) -> Vec<SimCar> {
        let gaps = state.gaps_to_leader();
        state
            .drivers()
            .iter()
            .zip(gaps)
            .enumerate()
            .map(|(i, (d, gap))| {
                let stops = if i == subject_idx {
                    let ctx = StintContext::for_driver(state, d);
                    candidate
                        .pit_laps(&ctx)
                        .into_iter()
                        .zip(candidate.stints().iter().skip(1).map(|s| s.compound))
                        .collect()
                } else {
                    let expected = self.typical_stints.expected_pit_lap(
                        state.current_lap(),
                        d.compound,
                        d.tire_age,
                    );
                    if expected + NO_STOP_WINDOW_LAPS >= state.total_laps() {
                        Vec::new()
                    } else {
                        vec![(expected, d.compound.next_stint())]
                    }
                };
                SimCar {
                    elapsed: gap,
                    compound: d.compound,
                    tire_age: d.tire_age,
                    stops,
                }
            })
            .collect()
    }

    /// One race from the current lap to the flag. Returns the subject's finishing position.
    fn run_trial(
        &self,
        state: &RaceState,
        grid: &[SimCar],
        subject_idx: usize,
        table: &ForecastTable,
        rng: &mut StdRng,
    ) -> usize {
        let first_lap = state.current_lap() + 1;
        let last_lap = state.total_laps();
        let mut cars = grid.to_vec();

        // Rival stops move by a uniform jitter, kept inside the remaining laps.
        if self.pit_jitter > 0 {
            let jitter = i64::from(self.pit_jitter);
            for (i, car) in cars.iter_mut().enumerate() {
                if i == subject_idx {
                    continue;
                }
                for stop in &mut car.stops {
                    let shifted = i64::from(stop.0) + rng.gen_range(-jitter..=jitter);
                    stop.0 = shifted.clamp(i64::from(first_lap), i64::from(last_lap) - 1) as u32;
                }
            }
        }

        let sc_per_lap = (self.safety_car_probability / f64::from(last_lap)).clamp(0.0, 1.0);
        let mut sc_laps_left = 0u32;

        for lap in first_lap..=last_lap {
            if sc_laps_left == 0 && rng.gen_bool(sc_per_lap) {
                sc_laps_left = rng.gen_range(SAFETY_CAR_MIN_LAPS..=SAFETY_CAR_MAX_LAPS);
                compress_field(&mut cars);
            }
            let safety_car = sc_laps_left > 0;

            for car in cars.iter_mut() {
                car.tire_age += 1;
                let mut delta = rng.gen_range(-PACE_NOISE_S..=PACE_NOISE_S);
                if !safety_car {
                    let f = table.get(car.compound, car.tire_age);
                    let rate = if f.upper_bound > f.lower_bound {
                        rng.gen_range(f.lower_bound..=f.upper_bound)
                    } else {
                        f.rate
                    };
                    delta += rate * f64::from(car.tire_age);
                }
                if let Some(&(stop_lap, fitted)) = car.stops.first() {
                    if stop_lap == lap {
                        delta += if safety_car {
                            self.pit_loss * self.safety_car_pit_loss_factor
                        } else {
                            self.pit_loss
                        };
                        car.compound = fitted;
                        car.tire_age = 0;
                        car.stops.remove(0);
                    }
                }
                car.elapsed += delta;
            }

            sc_laps_left = sc_laps_left.saturating_sub(1);
        }

        let subject_time = cars[subject_idx].elapsed;
        1 + cars
            .iter()
            .enumerate()
            .filter(|(i, car)| {
                car.elapsed < subject_time || (car.elapsed == subject_time && *i < subject_idx)
            })
            .count()
    }
}

/// Safety car bunches the field: no gap to the car ahead larger than one second.
fn compress_field(cars: &mut [SimCar]) {
    let mut order: Vec<usize> = (0..cars.len()).collect();
    order.sort_by(|&a, &b| cars[a].elapsed.total_cmp(&cars[b].elapsed));
    for w in 1..order.len() {
        let ahead = cars[order[w - 1]].elapsed;
        let car = &mut cars[order[w]];
        car.elapsed = car.elapsed.min(ahead + SAFETY_CAR_GAP_S);
    }
}
