//! Provider vocabulary: readings, snapshots, trust tiers, weights, and
//! the fetch/ground-truth capability traits.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::clock;

/// Provider identifier, unique within a deployment (e.g. `"open_meteo"`).
pub type ProviderId = String;

/// Weight bounds enforced on every provider weight, everywhere.
pub const WEIGHT_FLOOR: f64 = 1.0;
pub const WEIGHT_CEILING: f64 = 6.0;

/// Largest weight change the tracker may apply per provider per day.
pub const MAX_DAILY_WEIGHT_DELTA: f64 = 0.5;

// ── Metrics ─────────────────────────────────────────────────────────

/// Forecast metrics carried through the consensus pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Temperature,
    CloudCover,
    Dewpoint,
    WindSpeed,
    PrecipProbability,
    Radiation,
    /// Particulate concentration feeding the smoke guard.
    Pm25,
}

impl Metric {
    pub const ALL: [Metric; 7] = [
        Metric::Temperature,
        Metric::CloudCover,
        Metric::Dewpoint,
        Metric::WindSpeed,
        Metric::PrecipProbability,
        Metric::Radiation,
        Metric::Pm25,
    ];

    /// The canonical unit every reading of this metric is expressed in.
    pub fn unit(&self) -> Unit {
        match self {
            Metric::Temperature | Metric::Dewpoint => Unit::Celsius,
            Metric::CloudCover | Metric::PrecipProbability => Unit::Percent,
            Metric::WindSpeed => Unit::KilometersPerHour,
            Metric::Radiation => Unit::WattsPerSquareMeter,
            Metric::Pm25 => Unit::MicrogramsPerCubicMeter,
        }
    }
}

/// Units of measure for readings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    Celsius,
    Percent,
    KilometersPerHour,
    WattsPerSquareMeter,
    MicrogramsPerCubicMeter,
}

// ── Readings and snapshots ──────────────────────────────────────────

/// One provider's value for one hour-slot of one metric.
///
/// Immutable once produced; the timestamp is always hour-aligned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub provider: ProviderId,
    pub ts: i64,
    pub metric: Metric,
    pub value: f64,
    pub unit: Unit,
}

impl Reading {
    /// Build a reading, truncating the timestamp to its hour boundary.
    pub fn new(provider: impl Into<ProviderId>, ts: i64, metric: Metric, value: f64) -> Self {
        Self {
            provider: provider.into(),
            ts: clock::hour_floor(ts),
            metric,
            value,
            unit: metric.unit(),
        }
    }
}

/// Freshness classification of provider data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrustTier {
    /// Fetched less than 10 minutes ago.
    Fresh,
    /// Cached, less than 6 hours old.
    Acceptable,
    /// Cached, less than 24 hours old.
    Stale,
    /// No usable cache; static provider defaults.
    Default,
}

impl TrustTier {
    const FRESH_SECS: i64 = 10 * 60;
    const ACCEPTABLE_SECS: i64 = 6 * 3600;
    const STALE_SECS: i64 = 24 * 3600;

    /// Tier for a cache entry of the given age in seconds.
    pub fn from_age_secs(age: i64) -> Self {
        if age < Self::FRESH_SECS {
            TrustTier::Fresh
        } else if age < Self::ACCEPTABLE_SECS {
            TrustTier::Acceptable
        } else if age < Self::STALE_SECS {
            TrustTier::Stale
        } else {
            TrustTier::Default
        }
    }

    /// Stale and defaulted data is degraded; fresh and acceptable is not.
    pub fn is_degraded(&self) -> bool {
        matches!(self, TrustTier::Stale | TrustTier::Default)
    }

    /// Short label for logs and run summaries.
    pub fn label(&self) -> &'static str {
        match self {
            TrustTier::Fresh => "FRESH",
            TrustTier::Acceptable => "ACCEPTABLE",
            TrustTier::Stale => "STALE",
            TrustTier::Default => "DEFAULT",
        }
    }
}

/// The full set of readings a provider produced for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSnapshot {
    pub provider: ProviderId,
    pub readings: Vec<Reading>,
    pub fetched_at: i64,
    pub trust_tier: TrustTier,
    /// True when the snapshot was built from static defaults rather
    /// than measured data.
    pub is_synthesized: bool,
}

impl SourceSnapshot {
    /// The reading value for an hour-slot and metric, if present.
    pub fn value_at(&self, ts: i64, metric: Metric) -> Option<f64> {
        let slot = clock::hour_floor(ts);
        self.readings
            .iter()
            .find(|r| r.ts == slot && r.metric == metric)
            .map(|r| r.value)
    }

    /// Daily high/low temperature over `[start, end)`, if any
    /// temperature readings fall in the window.
    pub fn daily_extremes(&self, start: i64, end: i64) -> Option<DailyExtremes> {
        let mut temps = self
            .readings
            .iter()
            .filter(|r| r.metric == Metric::Temperature && r.ts >= start && r.ts < end)
            .map(|r| r.value)
            .peekable();
        temps.peek()?;
        let (mut high, mut low) = (f64::NEG_INFINITY, f64::INFINITY);
        for t in temps {
            high = high.max(t);
            low = low.min(t);
        }
        Some(DailyExtremes { high, low })
    }
}

/// Daily high/low pair, used for predictions and ground truth alike.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DailyExtremes {
    pub high: f64,
    pub low: f64,
}

/// Hour-aligned UTC interval `[start, end)` a fetch should cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: i64,
    pub end: i64,
}

impl TimeWindow {
    pub fn new(start: i64, end: i64) -> Self {
        Self {
            start: clock::hour_floor(start),
            end: clock::hour_floor(end),
        }
    }

    /// Iterate the hour-slot timestamps in the window.
    pub fn hours(&self) -> impl Iterator<Item = i64> {
        (self.start..self.end).step_by(clock::HOUR_SECS as usize)
    }
}

// ── Weights ─────────────────────────────────────────────────────────

/// Current per-provider consensus weights, bounded to
/// [`WEIGHT_FLOOR`], [`WEIGHT_CEILING`].
///
/// Mutated only by the accuracy tracker, at most once per day; the
/// consensus engine reads it and never writes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WeightTable {
    weights: HashMap<ProviderId, f64>,
}

impl WeightTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The provider's weight; unknown providers sit at the floor.
    pub fn get(&self, provider: &str) -> f64 {
        self.weights.get(provider).copied().unwrap_or(WEIGHT_FLOOR)
    }

    /// Set a weight, clamping into bounds.
    pub fn set(&mut self, provider: impl Into<ProviderId>, weight: f64) {
        self.weights
            .insert(provider.into(), weight.clamp(WEIGHT_FLOOR, WEIGHT_CEILING));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ProviderId, f64)> {
        self.weights.iter().map(|(p, w)| (p, *w))
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}

// ── Capability traits ───────────────────────────────────────────────

/// Errors a provider fetch capability can produce.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("request timed out")]
    Timeout,

    #[error("HTTP status {status}")]
    Http { status: u16 },

    #[error("network error: {0}")]
    Network(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("provider has no live fetch capability")]
    Unavailable,
}

impl ProviderError {
    /// Whether a retry could plausibly succeed.
    ///
    /// Parse errors are not retryable (the same bad payload comes back);
    /// client errors other than 408/429 are contract violations, not
    /// transient conditions.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Timeout | ProviderError::Network(_) => true,
            ProviderError::Http { status } => {
                matches!(status, 408 | 429) || *status >= 500
            }
            ProviderError::Parse(_) | ProviderError::Unavailable => false,
        }
    }
}

/// A provider's external fetch capability.
///
/// The core only requires this contract; transport details (HTTP,
/// scraping, files) live in the implementation.
#[async_trait]
pub trait ProviderFetch: Send + Sync {
    /// Stable provider id, matching the deployment configuration.
    fn id(&self) -> &str;

    /// Fetch readings covering the window. Timestamps in the returned
    /// snapshot must be hour-aligned.
    async fn fetch(&self, window: TimeWindow) -> Result<SourceSnapshot, ProviderError>;
}

/// Authoritative observed high/low for a finished local day.
#[async_trait]
pub trait GroundTruth: Send + Sync {
    async fn daily_extremes(&self, day_index: i64) -> Result<DailyExtremes, ProviderError>;
}
