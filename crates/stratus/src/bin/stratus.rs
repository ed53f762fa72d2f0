//! Stratus CLI — one forecast run (and optionally the daily
//! verification pass) against the configured providers.

use std::sync::{Arc, Mutex};

use anyhow::Context;
use argh::FromArgs;

use stratus::pipeline::ForecastEngine;
use stratus::prelude::*;
use stratus::providers::{ArchiveGroundTruth, OpenMeteoProvider, StaticProvider};

#[derive(FromArgs)]
/// Multi-source weather consensus and solar fog-risk engine
struct Args {
    /// path to the YAML configuration file
    #[argh(option, short = 'c')]
    config: String,

    /// override the database path from the configuration
    #[argh(option)]
    db: Option<String>,

    /// also run the daily verification pass after the forecast
    #[argh(switch)]
    verify: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = env_logger::Env::default().default_filter_or("info");
    env_logger::init_from_env(env);

    let args: Args = argh::from_env();

    let config = match Config::from_file(&args.config) {
        Ok(c) => c,
        Err(e) => {
            log::error!("Failed to load config from '{}': {}", args.config, e);
            std::process::exit(1);
        }
    };

    let db_path = args
        .db
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| config.storage.db_path.clone());
    let store = Arc::new(Mutex::new(
        Store::open(&db_path).with_context(|| format!("opening store at {}", db_path.display()))?,
    ));
    log::info!("Store opened at {}", db_path.display());

    let providers = build_providers(&config);
    log::info!(
        "Configured providers: {}",
        providers
            .iter()
            .map(|p| p.id().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );

    // Graceful shutdown: Ctrl+C aborts an in-flight fetch phase rather
    // than assembling a partial consensus.
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(());
    ctrlc::set_handler(move || {
        log::info!("Received Ctrl+C, aborting run...");
        let _ = shutdown_tx.send(());
    })
    .context("setting Ctrl+C handler")?;

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .context("system clock before epoch")?
        .as_secs() as i64;

    let engine = ForecastEngine::new(config.clone(), Arc::clone(&store));
    let artifact = engine
        .run_forecast(&providers, &mut shutdown_rx, now)
        .await
        .context("forecast run failed")?;

    print_summary(&artifact);

    if args.verify {
        let truth = ArchiveGroundTruth::new(
            reqwest::Client::new(),
            config.site.latitude,
            config.site.longitude,
            config.site.timezone.clone(),
        );
        match engine.run_daily_verification(&truth, now).await {
            Ok(record) => print_leaderboard(&record),
            Err(PipelineError::Tracker(e)) => {
                log::warn!("Verification skipped: {}", e);
            }
            Err(e) => return Err(e).context("daily verification failed"),
        }
    }

    Ok(())
}

/// Instantiate the fetch capability for each configured provider.
fn build_providers(config: &Config) -> Vec<Arc<dyn ProviderFetch>> {
    let client = reqwest::Client::new();
    config
        .providers
        .iter()
        .map(|p| match p.kind {
            stratus::config::ProviderKind::OpenMeteo => Arc::new(OpenMeteoProvider::new(
                p.id.clone(),
                client.clone(),
                config.site.latitude,
                config.site.longitude,
            )) as Arc<dyn ProviderFetch>,
            stratus::config::ProviderKind::Static => {
                Arc::new(StaticProvider::new(p.id.clone())) as Arc<dyn ProviderFetch>
            }
        })
        .collect()
}

fn print_summary(artifact: &ForecastArtifact) {
    println!("run {} (day {})", artifact.run_id, artifact.run_day);
    println!(
        "  {} consensus points, {} gaps",
        artifact.points.len(),
        artifact.gaps.len()
    );
    for d in &artifact.degraded {
        println!("  degraded: {} ({})", d.provider, d.tier.label());
    }
    for hour in &artifact.risk {
        if hour.class != RiskClass::Low || hour.smoke_alert {
            println!(
                "  {}: {} fog_p={:.2} solar={:.0} W/m2",
                hour.ts,
                hour.class.label(),
                hour.fog_probability,
                hour.solar_adjusted
            );
        }
    }
}

fn print_leaderboard(record: &VerificationRecord) {
    println!("verification day {} complete", record.day);
    for score in &record.scores {
        println!(
            "  #{} {} mae={:.2}{}",
            score.rank + 1,
            score.provider,
            score.mae,
            if score.flagged { " [FLAGGED]" } else { "" }
        );
    }
}
