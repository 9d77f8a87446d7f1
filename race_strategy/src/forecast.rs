use anyhow::{bail, Context};
use parking_lot::RwLock;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::{collections::HashMap, fs, path::Path, sync::Arc, time::Duration};

use crate::config::{EngineConfig, FallbackRates};
use crate::error::{Result, StrategyError};
use crate::types::{Compound, DegradationForecast};

// ---------- Predictor seam ----------

#[derive(Debug, Clone, Copy)]
pub struct ForecastConditions<'a> {
    pub track_temp: f64,
    pub compound: Compound,
    pub stint_length: u32,
    pub track_id: u32,
    pub driver: &'a str,
}

/// Point estimate plus 95% interval, in seconds per lap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawPrediction {
    pub rate: f64,
    pub lower: f64,
    pub upper: f64,
}

/// A trained degradation model. Implementations must be safe for concurrent reads.
pub trait DegradationPredictor: Send + Sync {
    fn predict(&self, conditions: &ForecastConditions<'_>) -> anyhow::Result<RawPrediction>;
}

// ---------- JSON linear model ----------

#[derive(Deserialize)]
struct ModelJson {
    feat_list: Vec<String>,
    coefficients: Vec<f64>,
    intercept: f64,
    residual_std: f64,
    in_dim: Option<usize>,
}

/// Linear regression exported as JSON: `feat_list` fixes the feature order.
#[derive(Debug, Clone)]
pub struct LinearDegradationModel {
    feat_list: Vec<String>,
    coefficients: Vec<f64>,
    intercept: f64,
    residual_std: f64,
}

impl LinearDegradationModel {
    pub fn load(model_path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = model_path.as_ref();
        let txt = fs::read_to_string(path)
            .with_context(|| format!("failed to read model at {}", path.display()))?;
        Self::from_json(&txt).with_context(|| format!("failed to load model {}", path.display()))
    }

    pub fn from_json(txt: &str) -> anyhow::Result<Self> {
        let meta: ModelJson = serde_json::from_str(txt).context("failed to parse model JSON")?;

        if meta.coefficients.len() != meta.feat_list.len() {
            bail!(
                "coefficient count {} != feat_list length {}",
                meta.coefficients.len(),
                meta.feat_list.len()
            );
        }
        if let Some(in_dim) = meta.in_dim {
            if in_dim != meta.feat_list.len() {
                tracing::warn!(
                    "model in_dim ({}) != feat_list.len() ({}); using feat_list.len()",
                    in_dim,
                    meta.feat_list.len()
                );
            }
        }
        if !meta.residual_std.is_finite() || meta.residual_std < 0.0 {
            bail!("residual_std must be a non-negative number");
        }

        let model = Self {
            feat_list: meta.feat_list,
            coefficients: meta.coefficients,
            intercept: meta.intercept,
            residual_std: meta.residual_std,
        };

        // Warmup: reject artifacts that cannot produce a finite rate.
        let probe = ForecastConditions {
            track_temp: 35.0,
            compound: Compound::Medium,
            stint_length: 20,
            track_id: 1,
            driver: "",
        };
        let out = model.predict(&probe)?;
        if !out.rate.is_finite() {
            bail!("model produced a non-finite warmup prediction");
        }
        tracing::debug!("loaded degradation model; feat_list[{}]: {:?}", model.feat_list.len(), model.feat_list);
        Ok(model)
    }

    pub fn feat_list(&self) -> &[String] {
        &self.feat_list
    }

    fn features(&self, c: &ForecastConditions<'_>) -> Vec<f64> {
        let temp_norm = (c.track_temp - 35.0) / 10.0;
        let stint_norm = (f64::from(c.stint_length) - 20.0) / 10.0;
        let compound = f64::from(c.compound.softness());

        self.feat_list
            .iter()
            .map(|name| match name.as_str() {
                "TrackTemp_norm" => temp_norm,
                "Compound_encoded" => compound,
                "StintLength_norm" => stint_norm,
                "Track_encoded" => f64::from(c.track_id),
                "TempStint_interaction" => temp_norm * stint_norm,
                "CompoundTemp_interaction" => compound * temp_norm,
                _ => 0.0,
            })
            .collect()
    }
}

impl DegradationPredictor for LinearDegradationModel {
    fn predict(&self, conditions: &ForecastConditions<'_>) -> anyhow::Result<RawPrediction> {
        let x = self.features(conditions);
        let rate = self.intercept
            + x.iter()
                .zip(&self.coefficients)
                .map(|(v, w)| v * w)
                .sum::<f64>();
        let half = 1.96 * self.residual_std;
        Ok(RawPrediction {
            rate,
            lower: rate - half,
            upper: rate + half,
        })
    }
}

// ---------- Per-cycle table ----------

/// What one cycle needs forecast: every compound for stint lengths `1..=max_stint_length`.
#[derive(Debug, Clone)]
pub struct TableRequest {
    pub track_temp: f64,
    pub track_id: u32,
    pub driver: String,
    pub max_stint_length: u32,
}

/// Forecasts for one evaluation cycle. Discarded at the end of the cycle.
#[derive(Debug, Clone)]
pub struct ForecastTable {
    entries: HashMap<Compound, Vec<DegradationForecast>>,
    degraded_reason: Option<String>,
}

impl ForecastTable {
    pub fn try_from_fn(
        max_stint_length: u32,
        mut f: impl FnMut(Compound, u32) -> Result<DegradationForecast>,
    ) -> Result<Self> {
        let max = max_stint_length.max(1);
        let mut entries = HashMap::with_capacity(Compound::ALL.len());
        for compound in Compound::ALL {
            let row = (1..=max)
                .map(|len| f(compound, len))
                .collect::<Result<Vec<_>>>()?;
            entries.insert(compound, row);
        }
        Ok(Self {
            entries,
            degraded_reason: None,
        })
    }

    pub fn from_fn(
        max_stint_length: u32,
        mut f: impl FnMut(Compound, u32) -> DegradationForecast,
    ) -> Self {
        let max = max_stint_length.max(1);
        let entries: HashMap<Compound, Vec<DegradationForecast>> = Compound::ALL
            .into_iter()
            .map(|compound| (compound, (1..=max).map(|len| f(compound, len)).collect()))
            .collect();
        Self {
            entries,
            degraded_reason: None,
        }
    }

    /// Forecast for a stint of `stint_length` laps; lengths are clamped into the table.
    pub fn get(&self, compound: Compound, stint_length: u32) -> DegradationForecast {
        let row = &self.entries[&compound];
        let idx = (stint_length.max(1) as usize - 1).min(row.len() - 1);
        row[idx]
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded_reason.is_some()
    }

    pub fn degraded_reason(&self) -> Option<&str> {
        self.degraded_reason.as_deref()
    }

    fn mark_degraded(mut self, reason: String) -> Self {
        self.degraded_reason = Some(reason);
        self
    }
}

// ---------- Adapter ----------

/// Sets the flag when dropped, so an abandoned table build stops calling the model.
struct AbortOnDrop(Arc<AtomicBool>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

pub struct ForecastAdapter {
    predictor: RwLock<Option<Arc<dyn DegradationPredictor>>>,
    fallback: FallbackRates,
    temp_range: (f64, f64),
}

impl ForecastAdapter {
    /// Adapter with no model loaded; every forecast goes through the fallback path.
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            predictor: RwLock::new(None),
            fallback: config.fallback.clone(),
            temp_range: (config.track_temp_min, config.track_temp_max),
        }
    }

    pub fn with_predictor(config: &EngineConfig, predictor: Arc<dyn DegradationPredictor>) -> Self {
        let adapter = Self::new(config);
        adapter.install(predictor);
        adapter
    }

    /// Swap in a (re)loaded model. In-flight cycles keep the one they started with.
    pub fn install(&self, predictor: Arc<dyn DegradationPredictor>) {
        *self.predictor.write() = Some(predictor);
        tracing::info!("degradation model installed");
    }

    pub fn unload(&self) -> bool {
        self.predictor.write().take().is_some()
    }

    pub fn has_model(&self) -> bool {
        self.predictor.read().is_some()
    }

    pub fn nominal_rate(&self, compound: Compound) -> f64 {
        self.fallback.base_rate(compound)
    }

    fn clip_temp(&self, track_temp: f64) -> Result<f64> {
        if !track_temp.is_finite() {
            return Err(StrategyError::InvalidForecastInput(
                "track_temp must be finite".into(),
            ));
        }
        let (lo, hi) = self.temp_range;
        Ok(track_temp.clamp(lo, hi))
    }

    pub fn forecast(
        &self,
        track_temp: f64,
        compound: Compound,
        stint_length: u32,
        track_id: u32,
        driver: &str,
    ) -> Result<DegradationForecast> {
        if stint_length < 1 {
            return Err(StrategyError::InvalidForecastInput(
                "stint_length must be >= 1".into(),
            ));
        }
        let clipped = self.clip_temp(track_temp)?;
        if clipped != track_temp {
            tracing::warn!(track_temp, clipped, "track temperature outside plausible range; clipping");
        }

        // Clone the Arc so the lock is not held across the prediction.
        let predictor = self
            .predictor
            .read()
            .clone()
            .ok_or_else(|| StrategyError::ModelUnavailable("no model loaded".into()))?;

        let conditions = ForecastConditions {
            track_temp: clipped,
            compound,
            stint_length,
            track_id,
            driver,
        };
        let raw = predictor
            .predict(&conditions)
            .map_err(|e| StrategyError::ModelUnavailable(format!("{e:#}")))?;
        if !(raw.rate.is_finite() && raw.lower.is_finite() && raw.upper.is_finite()) {
            return Err(StrategyError::ModelUnavailable(
                "model returned a non-finite prediction".into(),
            ));
        }
        Ok(DegradationForecast::from_interval(raw.rate, raw.lower, raw.upper))
    }

    pub fn fallback_forecast(&self, track_temp: f64, compound: Compound) -> DegradationForecast {
        let (lo, hi) = self.temp_range;
        let temp = if track_temp.is_finite() {
            track_temp.clamp(lo, hi)
        } else {
            self.fallback.reference_temp
        };
        let rate = self.fallback.rate_at(compound, temp);
        let half = rate * self.fallback.interval_fraction;
        DegradationForecast::from_interval(rate, rate - half, rate + half)
    }

    /// Every forecast the cycle needs, from the model. Fails on the first unavailable prediction,
    /// or with `Cancelled` as soon as `abort` is set.
    pub fn build_table(&self, req: &TableRequest, abort: &AtomicBool) -> Result<ForecastTable> {
        let temp = self.clip_temp(req.track_temp)?;
        if temp != req.track_temp {
            tracing::warn!(track_temp = req.track_temp, clipped = temp, "track temperature clipped");
        }
        ForecastTable::try_from_fn(req.max_stint_length, |compound, len| {
            if abort.load(Ordering::Relaxed) {
                return Err(StrategyError::Cancelled);
            }
            self.forecast(temp, compound, len, req.track_id, &req.driver)
        })
    }

    pub fn fallback_table(&self, req: &TableRequest, reason: impl Into<String>) -> ForecastTable {
        ForecastTable::from_fn(req.max_stint_length, |compound, _| {
            self.fallback_forecast(req.track_temp, compound)
        })
        .mark_degraded(reason.into())
    }

    /// Builds the cycle's table on a blocking worker, bounded by `timeout`.
    /// Model failures and timeouts both fall back to the static table.
    pub async fn forecast_table(
        this: &Arc<Self>,
        req: TableRequest,
        timeout: Duration,
    ) -> ForecastTable {
        let adapter = Arc::clone(this);
        let job_req = req.clone();
        let abort = AbortOnDrop(Arc::new(AtomicBool::new(false)));
        let job_abort = Arc::clone(&abort.0);
        let job = tokio::task::spawn_blocking(move || adapter.build_table(&job_req, &job_abort));

        // Dropping `abort` (timeout, or the caller going away) stops the build at the next prediction.
        let failure = match tokio::time::timeout(timeout, job).await {
            Ok(Ok(Ok(table))) => return table,
            Ok(Ok(Err(e))) => e.to_string(),
            Ok(Err(join_err)) => format!("forecast worker failed: {join_err}"),
            Err(_) => StrategyError::ModelUnavailable(format!(
                "forecast timed out after {} ms",
                timeout.as_millis()
            ))
            .to_string(),
        };
        tracing::warn!(reason = %failure, "using fallback degradation table");
        this.fallback_table(&req, failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;

    impl DegradationPredictor for Failing {
        fn predict(&self, _: &ForecastConditions<'_>) -> anyhow::Result<RawPrediction> {
            bail!("model file corrupted")
        }
    }

    struct Slow;

    impl DegradationPredictor for Slow {
        fn predict(&self, _: &ForecastConditions<'_>) -> anyhow::Result<RawPrediction> {
            std::thread::sleep(Duration::from_millis(100));
            Ok(RawPrediction {
                rate: 0.05,
                lower: 0.04,
                upper: 0.06,
            })
        }
    }

    /// Counts every prediction it serves.
    struct Counting(Arc<std::sync::atomic::AtomicUsize>);

    impl DegradationPredictor for Counting {
        fn predict(&self, _: &ForecastConditions<'_>) -> anyhow::Result<RawPrediction> {
            self.0.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(5));
            Ok(RawPrediction {
                rate: 0.05,
                lower: 0.04,
                upper: 0.06,
            })
        }
    }

    const MODEL: &str = r#"{
        "feat_list": ["TrackTemp_norm", "Compound_encoded", "StintLength_norm", "Humidity_norm"],
        "coefficients": [0.01, 0.02, 0.005, 0.3],
        "intercept": 0.03,
        "residual_std": 0.005,
        "in_dim": 4
    }"#;

    fn request() -> TableRequest {
        TableRequest {
            track_temp: 35.0,
            track_id: 3,
            driver: "LEC".into(),
            max_stint_length: 40,
        }
    }

    #[test]
    fn test_linear_model_prediction() {
        let model = LinearDegradationModel::from_json(MODEL).unwrap();
        let out = model
            .predict(&ForecastConditions {
                track_temp: 45.0,
                compound: Compound::Soft,
                stint_length: 30,
                track_id: 3,
                driver: "LEC",
            })
            .unwrap();
        // 0.03 + 0.01*1 + 0.02*2 + 0.005*1; unknown features contribute nothing
        assert!((out.rate - 0.085).abs() < 1e-12);
        assert!((out.upper - out.lower - 2.0 * 1.96 * 0.005).abs() < 1e-12);
    }

    #[test]
    fn test_linear_model_rejects_mismatched_artifact() {
        let bad = r#"{ "feat_list": ["a", "b"], "coefficients": [1.0], "intercept": 0.0, "residual_std": 0.1 }"#;
        assert!(LinearDegradationModel::from_json(bad).is_err());
        assert!(LinearDegradationModel::load("/no/such/model.json").is_err());
    }

    #[test]
    fn test_forecast_without_model_is_unavailable() {
        let adapter = ForecastAdapter::new(&EngineConfig::default());
        let err = adapter
            .forecast(30.0, Compound::Medium, 10, 1, "LEC")
            .unwrap_err();
        assert!(matches!(err, StrategyError::ModelUnavailable(_)));
    }

    #[test]
    fn test_forecast_input_checks() {
        let model = Arc::new(LinearDegradationModel::from_json(MODEL).unwrap());
        let adapter = ForecastAdapter::with_predictor(&EngineConfig::default(), model);
        assert!(matches!(
            adapter.forecast(30.0, Compound::Medium, 0, 1, "LEC"),
            Err(StrategyError::InvalidForecastInput(_))
        ));
        assert!(adapter.forecast(f64::NAN, Compound::Medium, 5, 1, "LEC").is_err());

        // Out-of-range temperatures are clipped, not rejected.
        let hot = adapter.forecast(95.0, Compound::Medium, 5, 1, "LEC").unwrap();
        let max = adapter.forecast(60.0, Compound::Medium, 5, 1, "LEC").unwrap();
        assert_eq!(hot, max);
    }

    #[test]
    fn test_install_and_unload() {
        let adapter = ForecastAdapter::new(&EngineConfig::default());
        assert!(!adapter.has_model());
        adapter.install(Arc::new(LinearDegradationModel::from_json(MODEL).unwrap()));
        assert!(adapter.has_model());
        assert!(adapter.forecast(30.0, Compound::Hard, 12, 1, "HAM").is_ok());
        assert!(adapter.unload());
        assert!(!adapter.has_model());
    }

    #[test]
    fn test_fallback_table_matches_static_rates() {
        let adapter = ForecastAdapter::new(&EngineConfig::default());
        let table = adapter.fallback_table(&request(), "no model");
        assert!(table.is_degraded());
        let medium = table.get(Compound::Medium, 12);
        assert!((medium.rate - 0.05 * 1.05).abs() < 1e-12);
        assert!((medium.upper_bound - medium.rate * 1.2).abs() < 1e-12);
        // Out-of-table lengths clamp instead of panicking.
        assert_eq!(table.get(Compound::Soft, 0), table.get(Compound::Soft, 1));
        assert_eq!(table.get(Compound::Soft, 400), table.get(Compound::Soft, 40));
    }

    #[tokio::test]
    async fn test_forecast_table_falls_back_on_model_error() {
        let adapter = Arc::new(ForecastAdapter::with_predictor(
            &EngineConfig::default(),
            Arc::new(Failing),
        ));
        let table =
            ForecastAdapter::forecast_table(&adapter, request(), Duration::from_secs(1)).await;
        assert!(table.is_degraded());
        assert!(table.degraded_reason().unwrap().contains("corrupted"));
    }

    #[tokio::test]
    async fn test_forecast_table_falls_back_on_timeout() {
        let adapter = Arc::new(ForecastAdapter::with_predictor(
            &EngineConfig::default(),
            Arc::new(Slow),
        ));
        let req = TableRequest {
            max_stint_length: 2,
            ..request()
        };
        let table = ForecastAdapter::forecast_table(&adapter, req, Duration::from_millis(20)).await;
        assert!(table.is_degraded());
        assert!(table.degraded_reason().unwrap().contains("timed out"));
    }

    #[test]
    fn test_build_table_stops_when_aborted() {
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let adapter = ForecastAdapter::with_predictor(
            &EngineConfig::default(),
            Arc::new(Counting(Arc::clone(&calls))),
        );
        let err = adapter
            .build_table(&request(), &AtomicBool::new(true))
            .unwrap_err();
        assert!(matches!(err, StrategyError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_timed_out_build_stops_calling_the_model() {
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let adapter = Arc::new(ForecastAdapter::with_predictor(
            &EngineConfig::default(),
            Arc::new(Counting(Arc::clone(&calls))),
        ));
        // 3 compounds x 40 lengths at 5 ms each is far past the budget.
        let table =
            ForecastAdapter::forecast_table(&adapter, request(), Duration::from_millis(20)).await;
        assert!(table.is_degraded());

        let at_return = calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        let later = calls.load(Ordering::SeqCst);
        assert!(later <= at_return + 1, "model kept running: {at_return} -> {later}");
        assert!(later < 3 * 40);
    }

    #[tokio::test]
    async fn test_forecast_table_uses_model_when_healthy() {
        let model = Arc::new(LinearDegradationModel::from_json(MODEL).unwrap());
        let adapter = Arc::new(ForecastAdapter::with_predictor(&EngineConfig::default(), model));
        let table =
            ForecastAdapter::forecast_table(&adapter, request(), Duration::from_secs(5)).await;
        assert!(!table.is_degraded());
        assert!(table.get(Compound::Soft, 20).rate > table.get(Compound::Hard, 20).rate);
    }
}
