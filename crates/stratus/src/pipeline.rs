//! Per-run orchestration: fetch → consensus → risk → persist, plus the
//! daily verification pass.
//!
//! The engine owns no long-lived state of its own; everything durable
//! lives in the [`Store`], and each run is a pure function of the
//! stores, the clock, and the providers' answers.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::accuracy::{AccuracyTracker, TrackerConfig, TrackerError, VerificationRecord};
use crate::cache::CacheStore;
use crate::clock;
use crate::config::Config;
use crate::consensus::{self, ConsensusPoint, SlotGap};
use crate::fetch::{FetchCoordinator, FetchError, FetchTiming};
use crate::provider::{
    GroundTruth, Metric, ProviderError, ProviderFetch, ProviderId, SourceSnapshot, TimeWindow,
    TrustTier, WeightTable,
};
use crate::risk::{HourConditions, HourRisk, RiskClassifier};
use crate::store::{Store, StoreError};

/// Errors from a forecast or verification run.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error("ground truth unavailable: {0}")]
    GroundTruth(ProviderError),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// A provider that served degraded (stale or defaulted) data this run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DegradedProvider {
    pub provider: ProviderId,
    pub tier: TrustTier,
}

/// The read-only result of one forecast run, handed to downstream
/// consumers (report renderers, briefing generators) as data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastArtifact {
    pub run_id: String,
    pub run_day: i64,
    pub generated_at: i64,
    pub points: Vec<ConsensusPoint>,
    pub gaps: Vec<SlotGap>,
    pub risk: Vec<HourRisk>,
    pub degraded: Vec<DegradedProvider>,
}

/// Top-level engine wiring the components over shared stores.
pub struct ForecastEngine {
    config: Config,
    store: Arc<Mutex<Store>>,
    cache: Arc<CacheStore>,
}

impl ForecastEngine {
    pub fn new(config: Config, store: Arc<Mutex<Store>>) -> Self {
        let cache = Arc::new(CacheStore::new(
            Arc::clone(&store),
            config.provider_profiles(),
            config.site.utc_offset_minutes,
        ));
        Self {
            config,
            store,
            cache,
        }
    }

    /// One full forecast run.
    ///
    /// Acquires every provider (cache-backed, never absent), blends the
    /// consensus series, classifies fog/smoke risk, and persists the
    /// artifact plus each live provider's daily extremes for later
    /// verification.
    pub async fn run_forecast(
        &self,
        providers: &[Arc<dyn ProviderFetch>],
        shutdown: &mut watch::Receiver<()>,
        now: i64,
    ) -> Result<ForecastArtifact> {
        let offset = self.config.site.utc_offset_minutes;
        let run_day = clock::local_day_index(now, offset);
        let (day_start, _) = clock::day_bounds(run_day, offset);
        let window = TimeWindow::new(
            day_start,
            day_start + self.config.fetch.horizon_hours * clock::HOUR_SECS,
        );

        let coordinator = FetchCoordinator::new(
            Arc::clone(&self.cache),
            FetchTiming {
                attempt_timeout: Duration::from_secs(self.config.fetch.attempt_timeout_secs),
                phase_deadline: Duration::from_secs(self.config.fetch.phase_deadline_secs),
            },
        );
        let snapshots = coordinator.acquire(providers, window, now, shutdown).await?;

        let weights = self.load_weight_table()?;
        let outcome = consensus::compute(
            &snapshots,
            &weights,
            &self.config.consensus_config(),
            window,
        );

        let classifier = RiskClassifier::new(self.config.risk_config(), offset);
        let risk = classifier.classify(&hour_conditions(&outcome.points, window));

        let degraded: Vec<DegradedProvider> = {
            let mut list: Vec<DegradedProvider> = snapshots
                .values()
                .filter(|s| s.trust_tier.is_degraded())
                .map(|s| DegradedProvider {
                    provider: s.provider.clone(),
                    tier: s.trust_tier,
                })
                .collect();
            list.sort_by(|a, b| a.provider.cmp(&b.provider));
            list
        };
        for d in &degraded {
            log::warn!(
                "[ForecastEngine] degraded provider this run: {} ({})",
                d.provider,
                d.tier.label()
            );
        }

        let artifact = ForecastArtifact {
            run_id: uuid::Uuid::new_v4().to_string(),
            run_day,
            generated_at: now,
            points: outcome.points,
            gaps: outcome.gaps,
            risk,
            degraded,
        };

        self.persist_run(&artifact, &snapshots, run_day)?;

        log::info!(
            "[ForecastEngine] run {} complete: {} points, {} gaps, {} degraded providers",
            artifact.run_id,
            artifact.points.len(),
            artifact.gaps.len(),
            artifact.degraded.len()
        );

        Ok(artifact)
    }

    /// Daily verification: grade the run from `lag_days` ago against
    /// the newest finished local day and recalibrate weights.
    ///
    /// Ground truth for a day arrives once the day ends, so the day
    /// under verification is yesterday relative to `now`.
    pub async fn run_daily_verification(
        &self,
        ground_truth: &dyn GroundTruth,
        now: i64,
    ) -> Result<VerificationRecord> {
        let day = clock::local_day_index(now, self.config.site.utc_offset_minutes) - 1;
        let truth = ground_truth
            .daily_extremes(day)
            .await
            .map_err(PipelineError::GroundTruth)?;

        let tracker = AccuracyTracker::new(
            Arc::clone(&self.store),
            TrackerConfig {
                lag_days: self.config.verification.lag_days,
                anomalous_mae: self.config.verification.anomalous_mae,
                excluded: self.config.verification.excluded_providers.clone(),
            },
        );

        let mut weights = self.load_weight_table()?;
        let record = tracker.verify(day, truth, &mut weights)?;
        Ok(record)
    }

    /// Weight table from the store, with configured base weights for
    /// providers that have no verified history yet.
    fn load_weight_table(&self) -> Result<WeightTable> {
        let rows = self
            .store
            .lock()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))?
            .load_weights()?;

        let mut table = WeightTable::new();
        for provider in &self.config.providers {
            table.set(&provider.id, provider.base_weight);
        }
        for (provider, weight) in rows {
            table.set(provider, weight);
        }
        Ok(table)
    }

    fn persist_run(
        &self,
        artifact: &ForecastArtifact,
        snapshots: &std::collections::HashMap<ProviderId, SourceSnapshot>,
        run_day: i64,
    ) -> Result<()> {
        let offset = self.config.site.utc_offset_minutes;
        let horizon_days = (self.config.fetch.horizon_hours + 23) / 24;
        let payload = serde_json::to_string(artifact)?;

        let store = self
            .store
            .lock()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))?;

        if !store.save_run(run_day, &artifact.run_id, artifact.generated_at, &payload)? {
            log::info!(
                "[ForecastEngine] run for day {} already recorded, ledger unchanged",
                run_day
            );
        }

        // Record each live provider's daily extremes for verification.
        // Synthesized defaults are constants, not predictions; graded
        // providers would only inherit noise from them.
        for snapshot in snapshots.values() {
            if snapshot.is_synthesized {
                continue;
            }
            for target_day in run_day..run_day + horizon_days {
                let (start, end) = clock::day_bounds(target_day, offset);
                if let Some(extremes) = snapshot.daily_extremes(start, end) {
                    store.log_forecast(&snapshot.provider, run_day, target_day, extremes)?;
                }
            }
        }

        Ok(())
    }
}

/// Pivot consensus points into per-hour classifier inputs.
///
/// An hour qualifies once temperature, dewpoint, and wind are all
/// present; radiation defaults to zero (no production to lose) and
/// PM2.5 stays optional.
fn hour_conditions(points: &[ConsensusPoint], window: TimeWindow) -> Vec<HourConditions> {
    let mut hours = Vec::new();
    for ts in window.hours() {
        let value = |metric: Metric| {
            points
                .iter()
                .find(|p| p.ts == ts && p.metric == metric)
                .map(|p| p.value)
        };
        let (Some(temperature), Some(dewpoint), Some(wind_kmh)) = (
            value(Metric::Temperature),
            value(Metric::Dewpoint),
            value(Metric::WindSpeed),
        ) else {
            continue;
        };
        hours.push(HourConditions {
            ts,
            temperature,
            dewpoint,
            wind_kmh,
            radiation: value(Metric::Radiation).unwrap_or(0.0),
            pm2_5: value(Metric::Pm25),
        });
    }
    hours
}
