mod config;
mod engine;
mod evaluator;
mod executor;
mod hallucination;
mod static_analysis;


use assayer_common::config::EvalConfig;
use assayer_common::store::Recorders;
use config::LanguageConfigManager;
use engine::ProcessEngine;
use executor::{Pipeline, RunSettings};
use static_analysis::{JsonMeasurementProvider, MeasurementProvider, NoMeasurements};
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Assayer worker booting...");

    let config = EvalConfig::load_default().map_err(|e| {
        error!("Failed to load evaluation config: {:#}", e);
        error!("Set ASSAYER_CONFIG or create config/config.json");
        e
    })?;

    let languages = LanguageConfigManager::load_default().map_err(|e| {
        error!("Failed to load language configurations: {:#}", e);
        e
    })?;
    info!("Loaded language configurations for: {:?}", languages.list_languages());

    let measurements: Box<dyn MeasurementProvider> = match &config.measurements_path {
        Some(path) => {
            let provider = JsonMeasurementProvider::load(path)?;
            info!(path = %path.display(), candidates = provider.len(), "Loaded static-analysis measurements");
            Box::new(provider)
        }
        None => {
            warn!("No measurements_path configured - static-analysis stage will be empty");
            Box::new(NoMeasurements)
        }
    };

    info!(
        tasks = config.tasks.len(),
        languages = config.languages.len(),
        models = config.models.len(),
        completeness_levels = config.completeness_levels.len(),
        timeout_secs = config.timeout_secs,
        max_attempts = config.max_attempts,
        max_parallel = config.max_parallel,
        results_dir = %config.results_dir.display(),
        "Evaluation matrix configured"
    );

    let pipeline = Pipeline::new(
        ProcessEngine::new(languages),
        Recorders::new(&config.results_dir),
        measurements,
        RunSettings::from_config(&config),
    );

    // Setup graceful shutdown
    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install CTRL+C handler: {}", e);
            std::future::pending::<()>().await;
        }
        warn!("Received shutdown signal, abandoning in-flight candidates");
    };

    tokio::select! {
        result = pipeline.run_matrix(&config) => {
            let summary = result?;
            if summary.failed > 0 {
                warn!(failed = summary.failed, "Some candidates could not be processed");
            }
        },
        _ = shutdown => {},
    }

    info!("Worker shutdown complete");
    Ok(())
}
