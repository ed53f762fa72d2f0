//! Accuracy Tracker — grades providers against verified ground truth
//! and recalibrates consensus weights.
//!
//! Runs once per local day: compares what each provider predicted two
//! days ago for today against the observed high/low, ranks by MAE with
//! recency-weighted tiebreaks, and nudges the weight table. Weight
//! changes are bounded to ±0.5 per provider per day inside [1.0, 6.0].

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::provider::{
    DailyExtremes, ProviderId, WeightTable, MAX_DAILY_WEIGHT_DELTA, WEIGHT_CEILING, WEIGHT_FLOOR,
};
use crate::store::{Store, StoreError};

/// Current VerificationRecord schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Recency decay applied to rolling scores.
const ROLLING_DECAY: f64 = 0.85;

/// Rank-position weight in the recalibration formula.
const RANK_GAIN: f64 = 0.15;

/// Multiplier applied when a provider beats / misses the mean MAE.
const ACCURACY_BONUS: f64 = 1.1;
const ACCURACY_PENALTY: f64 = 0.9;

/// Errors from verification operations.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("day {0} already verified")]
    AlreadyVerified(i64),
}

pub type Result<T> = std::result::Result<T, TrackerError>;

/// Tunables for the daily verification pass.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Days between a forecast being recorded and it being verified.
    pub lag_days: i64,
    /// MAE above this is flagged for manual review (still ranked).
    pub anomalous_mae: f64,
    /// Providers an operator excluded from ranking and recalibration.
    pub excluded: Vec<ProviderId>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            lag_days: 2,
            anomalous_mae: 15.0,
            excluded: Vec::new(),
        }
    }
}

/// One provider's graded prediction for the verified day.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderScore {
    pub provider: ProviderId,
    pub predicted: DailyExtremes,
    pub mae: f64,
    /// MAE exceeded the anomaly threshold; review before trusting.
    pub flagged: bool,
    /// Ascending rank position, 0 = most accurate.
    pub rank: usize,
}

/// Append-only ledger entry for one verified day.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub schema_version: u32,
    pub day: i64,
    pub ground_truth: DailyExtremes,
    pub scores: Vec<ProviderScore>,
    /// Provider ids ascending by rank (best first).
    pub ranking: Vec<ProviderId>,
}

/// Daily verification and weight recalibration.
pub struct AccuracyTracker {
    store: Arc<Mutex<Store>>,
    config: TrackerConfig,
}

impl AccuracyTracker {
    pub fn new(store: Arc<Mutex<Store>>, config: TrackerConfig) -> Self {
        Self { store, config }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Store>> {
        self.store
            .lock()
            .map_err(|e| TrackerError::Store(StoreError::LockPoisoned(e.to_string())))
    }

    /// Verify `day` against ground truth and recalibrate `weights`.
    ///
    /// Ingests the observation, grades every provider that has a
    /// prediction on file from `day - lag_days` (others are skipped,
    /// no penalty), appends the VerificationRecord, and persists the
    /// updated weights. The new weights take effect on the *next*
    /// consensus run; this call never rewrites history.
    pub fn verify(
        &self,
        day: i64,
        ground_truth: DailyExtremes,
        weights: &mut WeightTable,
    ) -> Result<VerificationRecord> {
        let run_day = day - self.config.lag_days;

        let predictions = {
            let store = self.lock()?;
            store.ingest_observation(day, ground_truth)?;
            store.forecasts_run_on(run_day, day)?
        };

        let mut scores: Vec<ProviderScore> = predictions
            .into_iter()
            .filter(|(provider, _)| !self.config.excluded.contains(provider))
            .map(|(provider, predicted)| {
                let mae = mean_absolute_error(predicted, ground_truth);
                let flagged = mae > self.config.anomalous_mae;
                if flagged {
                    log::warn!(
                        "[AccuracyTracker] {}: anomalous MAE {:.1} on day {}, flagged for review",
                        provider,
                        mae,
                        day
                    );
                }
                ProviderScore {
                    provider,
                    predicted,
                    mae,
                    flagged,
                    rank: 0,
                }
            })
            .collect();

        self.rank(&mut scores, day)?;

        let record = VerificationRecord {
            schema_version: SCHEMA_VERSION,
            day,
            ground_truth,
            ranking: scores.iter().map(|s| s.provider.clone()).collect(),
            scores,
        };

        recalibrate(weights, &record);

        {
            let store = self.lock()?;
            let payload = serde_json::to_string(&record)?;
            if !store.append_verification(day, SCHEMA_VERSION, &payload)? {
                return Err(TrackerError::AlreadyVerified(day));
            }
            for (provider, weight) in record.ranking.iter().map(|p| (p, weights.get(p))) {
                store.save_weight(provider, weight, day)?;
            }
        }

        log::info!(
            "[AccuracyTracker] day {} verified: {} providers ranked{}",
            day,
            record.ranking.len(),
            record
                .ranking
                .first()
                .map(|p| format!(", best: {}", p))
                .unwrap_or_default()
        );

        Ok(record)
    }

    /// Sort ascending by MAE; ties broken by 7-day rolling score, then
    /// 14-day, then provider id.
    fn rank(&self, scores: &mut [ProviderScore], day: i64) -> Result<()> {
        let mut keyed: Vec<(f64, f64, f64)> = Vec::with_capacity(scores.len());
        for score in scores.iter() {
            let r7 = self.rolling_score(&score.provider, day, 7)?;
            let r14 = self.rolling_score(&score.provider, day, 14)?;
            keyed.push((
                score.mae,
                r7.unwrap_or(f64::INFINITY),
                r14.unwrap_or(f64::INFINITY),
            ));
        }

        let mut order: Vec<usize> = (0..scores.len()).collect();
        order.sort_by(|&a, &b| {
            let ka = (keyed[a].0, keyed[a].1, keyed[a].2, &scores[a].provider);
            let kb = (keyed[b].0, keyed[b].1, keyed[b].2, &scores[b].provider);
            ka.partial_cmp(&kb).unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut ranked: Vec<ProviderScore> = Vec::with_capacity(scores.len());
        for (rank, &idx) in order.iter().enumerate() {
            let mut s = scores[idx].clone();
            s.rank = rank;
            ranked.push(s);
        }
        scores.clone_from_slice(&ranked);
        Ok(())
    }

    /// Recency-weighted rolling MAE over the trailing window, the day
    /// under verification included:
    /// `Σ(mae_i · 0.85^days_ago) / Σ(0.85^days_ago)`.
    ///
    /// Days without both a prediction and an observation are simply
    /// absent from both sums. Returns `None` when no day qualifies.
    fn rolling_score(&self, provider: &str, day: i64, window_days: i64) -> Result<Option<f64>> {
        let store = self.lock()?;
        let mut num = 0.0;
        let mut den = 0.0;
        for days_ago in 0..window_days {
            let d = day - days_ago;
            let predicted = store.forecast_for(provider, d - self.config.lag_days, d)?;
            let observed = store.observation(d)?;
            if let (Some(predicted), Some(observed)) = (predicted, observed) {
                let decay = ROLLING_DECAY.powi(days_ago as i32);
                num += mean_absolute_error(predicted, observed) * decay;
                den += decay;
            }
        }
        Ok((den > 0.0).then(|| num / den))
    }
}

/// Combined high/low mean absolute error.
pub fn mean_absolute_error(predicted: DailyExtremes, actual: DailyExtremes) -> f64 {
    ((predicted.high - actual.high).abs() + (predicted.low - actual.low).abs()) / 2.0
}

/// Apply the bounded weight update for one verification record.
///
/// `new = clamp(base · (1 + 0.15 · rank_score) · accuracy_multiplier,
/// 1.0, 6.0)` with `rank_score = (n-1) - rank`, then the per-day change
/// is capped at ±0.5 regardless of what the formula produced.
pub fn recalibrate(weights: &mut WeightTable, record: &VerificationRecord) {
    let n = record.scores.len();
    if n == 0 {
        return;
    }
    let mean_mae = record.scores.iter().map(|s| s.mae).sum::<f64>() / n as f64;

    for score in &record.scores {
        let base = weights.get(&score.provider);
        let rank_score = (n - 1 - score.rank) as f64;
        let accuracy_multiplier = if score.mae < mean_mae {
            ACCURACY_BONUS
        } else {
            ACCURACY_PENALTY
        };

        let raw = base * (1.0 + RANK_GAIN * rank_score) * accuracy_multiplier;
        let clamped = raw.clamp(WEIGHT_FLOOR, WEIGHT_CEILING);
        let delta = (clamped - base).clamp(-MAX_DAILY_WEIGHT_DELTA, MAX_DAILY_WEIGHT_DELTA);
        let updated = (base + delta).clamp(WEIGHT_FLOOR, WEIGHT_CEILING);

        log::debug!(
            "[AccuracyTracker] {}: weight {:.2} -> {:.2} (rank {}, mae {:.2})",
            score.provider,
            base,
            updated,
            score.rank,
            score.mae
        );
        weights.set(&score.provider, updated);
    }
}
