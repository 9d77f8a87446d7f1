use anyhow::{bail, Context};
use race_strategy::{
    EngineConfig, EvaluationOptions, ForecastAdapter, LinearDegradationModel, RaceState,
    StrategyEngine,
};
use std::{fs, sync::Arc};
use tracing_subscriber::EnvFilter;

fn load_config() -> anyhow::Result<EngineConfig> {
    match std::env::var("STRATEGY_CONFIG") {
        Ok(path) => {
            let cfg = EngineConfig::load(&path)?;
            tracing::info!("loaded engine config from {}", path);
            Ok(cfg)
        }
        Err(_) => Ok(EngineConfig::default()),
    }
}

fn load_adapter(cfg: &EngineConfig) -> anyhow::Result<ForecastAdapter> {
    let adapter = ForecastAdapter::new(cfg);
    match std::env::var("MODEL_PATH") {
        Ok(path) => {
            let model = LinearDegradationModel::load(&path)?;
            tracing::info!("loaded model; feat_list[{}]: {:?}", model.feat_list().len(), model.feat_list());
            adapter.install(Arc::new(model));
        }
        Err(_) => tracing::warn!("MODEL_PATH not set; using static degradation rates"),
    }
    Ok(adapter)
}

fn read_state(path: &str) -> anyhow::Result<RaceState> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read race state at {path}"))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid race state in {path}"))
}

/// Extra `name=path` arguments, each an alternative race state to compare against the base.
fn read_scenarios(args: &[String]) -> anyhow::Result<Vec<(String, RaceState)>> {
    args.iter()
        .map(|arg| {
            let (name, path) = arg
                .split_once('=')
                .with_context(|| format!("scenario {arg:?} must be name=path"))?;
            Ok((name.to_string(), read_state(path)?))
        })
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some((state_path, rest)) = args.split_first() else {
        bail!("usage: strategy_runner <race_state.json> [name=race_state.json ...]");
    };
    let state = read_state(state_path)?;
    let scenarios = read_scenarios(rest)?;

    let driver = match std::env::var("DRIVER") {
        Ok(d) => d,
        Err(_) => state
            .drivers()
            .first()
            .map(|d| d.driver.clone())
            .context("race state has no drivers")?,
    };
    let seed = std::env::var("SEED")
        .ok()
        .map(|s| s.parse::<u64>().context("SEED must be an unsigned integer"))
        .transpose()?;

    let cfg = load_config()?;
    let adapter = Arc::new(load_adapter(&cfg)?);
    let engine = StrategyEngine::new(cfg, adapter)?;

    let opts = EvaluationOptions {
        seed,
        ..EvaluationOptions::default()
    };
    let out = if scenarios.is_empty() {
        let rec = engine
            .recommend(&state, &driver, opts)
            .await
            .with_context(|| format!("evaluation failed for {driver}"))?;
        serde_json::to_string_pretty(&rec)?
    } else {
        let report = engine
            .compare_scenarios(&state, &scenarios, &driver, opts)
            .await
            .with_context(|| format!("scenario comparison failed for {driver}"))?;
        serde_json::to_string_pretty(&report)?
    };

    println!("{out}");
    Ok(())
}
