use proptest::prelude::*;
use race_strategy::{
    Compound, DriverEntry, EngineConfig, ForecastAdapter, ForecastTable, PitWindowOptimizer,
    RaceOutcomeSimulator, RaceState, SimulationControl, SimulationResult, TableRequest,
};

fn arb_compound() -> impl Strategy<Value = Compound> {
    prop_oneof![
        Just(Compound::Soft),
        Just(Compound::Medium),
        Just(Compound::Hard),
    ]
}

/// (current_lap, total_laps) with the race still running.
fn arb_laps() -> impl Strategy<Value = (u32, u32)> {
    (10u32..80).prop_flat_map(|total| (1..total, Just(total)))
}

fn solo_state(current_lap: u32, total_laps: u32, compound: Compound, tire_age: u32, temp: f64) -> RaceState {
    let drivers = vec![
        DriverEntry {
            driver: "LEC".into(),
            position: 1,
            compound,
            tire_age,
            gap_to_car_ahead: 0.0,
            gap_to_car_behind: 3.0,
        },
        DriverEntry {
            driver: "HAM".into(),
            position: 2,
            compound: Compound::Hard,
            tire_age: 5,
            gap_to_car_ahead: 3.0,
            gap_to_car_behind: 0.0,
        },
    ];
    RaceState::new(current_lap, total_laps, temp, 1, drivers).unwrap()
}

fn fallback_table(cfg: &EngineConfig, state: &RaceState) -> ForecastTable {
    ForecastAdapter::new(cfg).fallback_table(
        &TableRequest {
            track_temp: state.track_temp(),
            track_id: 1,
            driver: "LEC".into(),
            max_stint_length: state.max_tire_age() + state.remaining_laps(),
        },
        "property test",
    )
}

proptest! {
    #[test]
    fn optimizer_stays_inside_the_race(
        (current_lap, total_laps) in arb_laps(),
        compound in arb_compound(),
        tire_age in 0u32..40,
        temp in 5.0f64..55.0,
    ) {
        let cfg = EngineConfig::default();
        let state = solo_state(current_lap, total_laps, compound, tire_age, temp);
        let table = fallback_table(&cfg, &state);
        let ranked = PitWindowOptimizer::new(&cfg).optimize(&state, &state.drivers()[0], &table);

        prop_assert!(!ranked.is_empty());
        for c in &ranked {
            match c.pit_lap() {
                Some(lap) => {
                    prop_assert!(lap > current_lap && lap < total_laps);
                }
                None => {
                    prop_assert!(ranked.len() == 1 && c.reason().is_some());
                }
            }
            let covered: u32 = c.stints().iter().map(|s| s.planned_length).sum();
            prop_assert_eq!(covered, total_laps - current_lap + tire_age);
        }
        prop_assert!(ranked
            .windows(2)
            .all(|w| w[0].expected_time_loss() <= w[1].expected_time_loss()));
    }

    #[test]
    fn distribution_is_normalized(counts in prop::collection::vec(0u64..500, 1..20)) {
        prop_assume!(counts.iter().any(|&c| c > 0));
        let r = SimulationResult::from_counts(&counts, &EngineConfig::default().points_table);
        let total: f64 = r.position_distribution.values().sum();
        prop_assert!((total - 1.0).abs() < 1e-6);
        prop_assert_eq!(r.win_probability, r.position_distribution[&1]);
        prop_assert!(r.podium_probability >= r.win_probability);
        prop_assert!(r.position_std >= 0.0);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn seeded_simulation_is_reproducible(seed in any::<u64>(), current_lap in 1u32..50) {
        let cfg = EngineConfig {
            simulation_trials: 40,
            simulation_workers: 2,
            ..EngineConfig::default()
        };
        let state = solo_state(current_lap, 55, Compound::Medium, 12, 30.0);
        let table = fallback_table(&cfg, &state);
        let candidate = PitWindowOptimizer::new(&cfg)
            .optimize(&state, &state.drivers()[0], &table)
            .remove(0);
        let sim = RaceOutcomeSimulator::new(&cfg).unwrap();
        let control = SimulationControl::unbounded();

        let a = sim.simulate(&state, "LEC", &candidate, &table, Some(seed), &control).unwrap();
        let b = sim.simulate(&state, "LEC", &candidate, &table, Some(seed), &control).unwrap();
        prop_assert_eq!(a, b);
    }
}
