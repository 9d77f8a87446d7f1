use crate::config::{EngineConfig, TypicalStints};
use crate::types::{
    CompetitorAnalysis, CompetitorThreat, DriverEntry, RaceState, RecommendedResponse, RiskLevel,
    Side,
};

/// Scores nearby cars for undercut and overcut potential. Holds no state between calls.
pub struct CompetitorThreatAnalyzer {
    gap_threshold: f64,
    typical_stints: TypicalStints,
}

impl CompetitorThreatAnalyzer {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            gap_threshold: config.gap_threshold_seconds,
            typical_stints: config.typical_stints.clone(),
        }
    }

    fn undercut_score(subject: &DriverEntry, rival: &DriverEntry, gap: f64) -> u8 {
        let mut score = if gap <= 3.0 {
            2
        } else if gap <= 6.0 {
            1
        } else {
            0
        };
        if rival.tire_age >= subject.tire_age {
            score += 1;
        }
        if rival.compound.is_softer_than(subject.compound) {
            score += 1;
        }
        score
    }

    fn overcut_score(subject: &DriverEntry, rival: &DriverEntry, gap: f64) -> u8 {
        let mut score = if gap <= 5.0 { 2 } else { 1 };
        if rival.tire_age > subject.tire_age {
            score += 1;
        }
        if rival.compound.is_softer_than(subject.compound) {
            score += 1;
        }
        score
    }

    fn threat(
        &self,
        state: &RaceState,
        rival: &DriverEntry,
        side: Side,
        gap: f64,
        score: u8,
    ) -> CompetitorThreat {
        CompetitorThreat {
            driver: rival.driver.clone(),
            position: rival.position,
            side,
            gap,
            compound: rival.compound,
            tire_age: rival.tire_age,
            threat_level: RiskLevel::from_score(score),
            expected_pit_lap: self.typical_stints.expected_pit_lap(
                state.current_lap(),
                rival.compound,
                rival.tire_age,
            ),
        }
    }

    /// Every car inside the gap window on one side, nearest first.
    fn side_threats(
        &self,
        state: &RaceState,
        subject: &DriverEntry,
        side: Side,
    ) -> Vec<CompetitorThreat> {
        let cars = match side {
            Side::Ahead => state.cars_ahead(&subject.driver),
            Side::Behind => state.cars_behind(&subject.driver),
        };
        cars.into_iter()
            .take_while(|(_, gap)| *gap <= self.gap_threshold)
            .map(|(rival, gap)| {
                let score = match side {
                    Side::Ahead => Self::overcut_score(subject, rival, gap),
                    Side::Behind => Self::undercut_score(subject, rival, gap),
                };
                self.threat(state, rival, side, gap, score)
            })
            .collect()
    }

    pub fn analyze(&self, state: &RaceState, subject: &DriverEntry) -> CompetitorAnalysis {
        let behind = self.side_threats(state, subject, Side::Behind);
        let ahead = self.side_threats(state, subject, Side::Ahead);

        let undercut_threat = strongest(&behind);
        let overcut_target = strongest(&ahead);
        let undercut_risk = level_of(&undercut_threat);
        let overcut_opportunity = level_of(&overcut_target);

        let recommended_response = if undercut_risk == RiskLevel::High {
            RecommendedResponse::CoverUndercut
        } else if overcut_opportunity == RiskLevel::High {
            RecommendedResponse::AttemptOvercut
        } else if undercut_risk == RiskLevel::Medium {
            RecommendedResponse::Defend
        } else {
            RecommendedResponse::PitOnOptimalWindow
        };

        tracing::debug!(
            driver = %subject.driver,
            ?undercut_risk,
            ?overcut_opportunity,
            ?recommended_response,
            "competitor analysis"
        );

        let mut threats: Vec<CompetitorThreat> = ahead.into_iter().chain(behind).collect();
        threats.sort_by_key(|t| t.position);

        CompetitorAnalysis {
            undercut_risk,
            overcut_opportunity,
            recommended_response,
            undercut_threat,
            overcut_target,
            threats,
        }
    }
}

/// Highest threat level wins; ties go to the closer car.
fn strongest(threats: &[CompetitorThreat]) -> Option<CompetitorThreat> {
    threats
        .iter()
        .min_by(|a, b| {
            b.threat_level
                .cmp(&a.threat_level)
                .then_with(|| a.gap.total_cmp(&b.gap))
        })
        .cloned()
}

fn level_of(threat: &Option<CompetitorThreat>) -> RiskLevel {
    threat.as_ref().map_or(RiskLevel::Low, |t| t.threat_level)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Compound;

    fn car(driver: &str, position: u32, compound: Compound, tire_age: u32, ahead: f64) -> DriverEntry {
        DriverEntry {
            driver: driver.into(),
            position,
            compound,
            tire_age,
            gap_to_car_ahead: ahead,
            gap_to_car_behind: 0.0,
        }
    }

    /// Fills in `gap_to_car_behind` from the next car's `gap_to_car_ahead`.
    fn state(current_lap: u32, mut cars: Vec<DriverEntry>) -> RaceState {
        for i in 0..cars.len().saturating_sub(1) {
            cars[i].gap_to_car_behind = cars[i + 1].gap_to_car_ahead;
        }
        RaceState::new(current_lap, 58, 30.0, 1, cars).unwrap()
    }

    #[test]
    fn test_close_car_behind_on_softer_older_tires_is_high_undercut() {
        let s = state(
            20,
            vec![
                car("LEC", 1, Compound::Medium, 20, 0.0),
                car("NOR", 2, Compound::Soft, 25, 1.5),
            ],
        );
        let analyzer = CompetitorThreatAnalyzer::new(&EngineConfig::default());
        let a = analyzer.analyze(&s, &s.drivers()[0]);

        assert_eq!(a.undercut_risk, RiskLevel::High);
        assert_eq!(a.recommended_response, RecommendedResponse::CoverUndercut);
        let t = a.undercut_threat.unwrap();
        assert_eq!(t.driver, "NOR");
        assert_eq!(t.side, Side::Behind);
        // SOFT at 25 laps is already past its typical stint.
        assert_eq!(t.expected_pit_lap, 21);
        assert_eq!(a.overcut_opportunity, RiskLevel::Low);
        assert!(a.overcut_target.is_none());
    }

    #[test]
    fn test_cars_outside_gap_window_are_ignored() {
        let s = state(
            20,
            vec![
                car("LEC", 1, Compound::Hard, 10, 0.0),
                car("NOR", 2, Compound::Soft, 30, 12.0),
            ],
        );
        let analyzer = CompetitorThreatAnalyzer::new(&EngineConfig::default());
        let a = analyzer.analyze(&s, &s.drivers()[0]);
        assert!(a.threats.is_empty());
        assert_eq!(a.undercut_risk, RiskLevel::Low);
        assert_eq!(a.recommended_response, RecommendedResponse::PitOnOptimalWindow);
    }

    #[test]
    fn test_overcut_and_defend_responses() {
        // Car ahead 4s up the road on older softs: overcut HIGH.
        let s = state(
            20,
            vec![
                car("VER", 1, Compound::Soft, 22, 0.0),
                car("LEC", 2, Compound::Medium, 15, 4.0),
            ],
        );
        let analyzer = CompetitorThreatAnalyzer::new(&EngineConfig::default());
        let a = analyzer.analyze(&s, &s.drivers()[1]);
        assert_eq!(a.overcut_opportunity, RiskLevel::High);
        assert_eq!(a.recommended_response, RecommendedResponse::AttemptOvercut);

        // Car behind at 5s on the same compound and older tires: score 2.
        let s = state(
            20,
            vec![
                car("LEC", 1, Compound::Medium, 15, 0.0),
                car("HAM", 2, Compound::Medium, 18, 5.0),
            ],
        );
        let a = analyzer.analyze(&s, &s.drivers()[0]);
        assert_eq!(a.undercut_risk, RiskLevel::Medium);
        assert_eq!(a.recommended_response, RecommendedResponse::Defend);
    }

    #[test]
    fn test_ties_prefer_the_closer_car() {
        let s = state(
            20,
            vec![
                car("LEC", 1, Compound::Hard, 10, 0.0),
                car("NOR", 2, Compound::Soft, 12, 2.0),
                car("PIA", 3, Compound::Soft, 12, 0.5),
            ],
        );
        let analyzer = CompetitorThreatAnalyzer::new(&EngineConfig::default());
        let a = analyzer.analyze(&s, &s.drivers()[0]);
        assert_eq!(a.undercut_threat.unwrap().driver, "NOR");
        assert_eq!(a.threats.len(), 2);
        assert_eq!(a.threats[0].position, 2);
    }
}
