//! Deployment configuration, loaded from a single YAML file.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::cache::ProviderProfile;
use crate::consensus::ConsensusConfig;
use crate::provider::Metric;
use crate::risk::{default_smoke_tiers, RiskConfig, SmokeTier};

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub site: SiteConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub fetch: FetchConfig,

    pub consensus: ConsensusSection,

    #[serde(default)]
    pub risk: RiskSection,

    #[serde(default)]
    pub verification: VerificationSection,

    pub providers: Vec<ProviderConfig>,
}

/// Site location and local-time handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    pub latitude: f64,
    pub longitude: f64,
    /// Fixed local offset from UTC, in minutes (e.g. -480 for UTC-8).
    pub utc_offset_minutes: i32,
    /// IANA timezone name passed to daily-aggregation APIs.
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_timezone() -> String {
    "auto".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database path (default: `~/.stratus/stratus.db`).
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".stratus")
        .join("stratus.db")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Timeout per fetch attempt, seconds.
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_secs: u64,
    /// Wall-clock deadline for the whole fetch phase, seconds.
    #[serde(default = "default_phase_deadline")]
    pub phase_deadline_secs: u64,
    /// Forecast horizon covered per run, hours.
    #[serde(default = "default_horizon_hours")]
    pub horizon_hours: i64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            attempt_timeout_secs: default_attempt_timeout(),
            phase_deadline_secs: default_phase_deadline(),
            horizon_hours: default_horizon_hours(),
        }
    }
}

fn default_attempt_timeout() -> u64 {
    15
}

fn default_phase_deadline() -> u64 {
    60
}

fn default_horizon_hours() -> i64 {
    48
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusSection {
    /// Provider whose absence marks a slot as synthesized.
    pub baseline_provider: String,
    #[serde(default = "default_stale_discount")]
    pub stale_discount: f64,
    #[serde(default = "default_default_discount")]
    pub default_discount: f64,
    /// Global outlier veto threshold, °C (~10 °F).
    #[serde(default = "default_veto_threshold")]
    pub veto_threshold: f64,
}

fn default_stale_discount() -> f64 {
    0.5
}

fn default_default_discount() -> f64 {
    0.2
}

fn default_veto_threshold() -> f64 {
    5.5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskSection {
    #[serde(default = "default_production_start")]
    pub production_start_hour: u32,
    #[serde(default = "default_production_end")]
    pub production_end_hour: u32,
    #[serde(default = "default_smoke_tiers")]
    pub smoke_tiers: Vec<SmokeTier>,
}

impl Default for RiskSection {
    fn default() -> Self {
        Self {
            production_start_hour: default_production_start(),
            production_end_hour: default_production_end(),
            smoke_tiers: default_smoke_tiers(),
        }
    }
}

fn default_production_start() -> u32 {
    8
}

fn default_production_end() -> u32 {
    16
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationSection {
    #[serde(default = "default_lag_days")]
    pub lag_days: i64,
    #[serde(default = "default_anomalous_mae")]
    pub anomalous_mae: f64,
    /// Providers an operator excluded from ranking.
    #[serde(default)]
    pub excluded_providers: Vec<String>,
}

impl Default for VerificationSection {
    fn default() -> Self {
        Self {
            lag_days: default_lag_days(),
            anomalous_mae: default_anomalous_mae(),
            excluded_providers: Vec::new(),
        }
    }
}

fn default_lag_days() -> i64 {
    2
}

fn default_anomalous_mae() -> f64 {
    15.0
}

/// How a configured provider is fetched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderKind {
    /// Bundled Open-Meteo forecast client.
    OpenMeteo,
    /// No live fetch capability; serves cache or defaults only.
    Static,
}

/// One provider entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,

    #[serde(flatten)]
    pub kind: ProviderKind,

    /// Starting consensus weight, used until verification history
    /// accumulates.
    #[serde(default = "default_base_weight")]
    pub base_weight: f64,

    /// Daily call cap for rate-limited providers.
    #[serde(default)]
    pub daily_quota: Option<u32>,

    /// Per-provider outlier veto threshold override.
    #[serde(default)]
    pub veto_threshold: Option<f64>,

    /// Static fallback value per metric when no cache exists.
    #[serde(default)]
    pub defaults: BTreeMap<Metric, f64>,
}

fn default_base_weight() -> f64 {
    1.0
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::parse(&contents)
    }

    /// Parse configuration from a YAML string and validate it.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let config: Config =
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject malformed configuration up front; these are the only
    /// startup-time failures the engine allows itself.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.providers.is_empty() {
            return Err(ConfigError::Invalid("no providers configured".into()));
        }

        let mut seen = std::collections::HashSet::new();
        for provider in &self.providers {
            if !seen.insert(provider.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate provider id: {}",
                    provider.id
                )));
            }
        }

        if !seen.contains(self.consensus.baseline_provider.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "baseline provider '{}' is not a configured provider",
                self.consensus.baseline_provider
            )));
        }

        for d in [self.consensus.stale_discount, self.consensus.default_discount] {
            if !(0.0..=1.0).contains(&d) {
                return Err(ConfigError::Invalid(format!(
                    "tier discount {} outside [0, 1]",
                    d
                )));
            }
        }

        if self.risk.production_start_hour > self.risk.production_end_hour
            || self.risk.production_end_hour > 23
        {
            return Err(ConfigError::Invalid(format!(
                "production window {}..={} is not a valid hour range",
                self.risk.production_start_hour, self.risk.production_end_hour
            )));
        }

        let tiers = &self.risk.smoke_tiers;
        if tiers.windows(2).any(|w| w[0].max_pm2_5 >= w[1].max_pm2_5) {
            return Err(ConfigError::Invalid(
                "smoke tiers must be in ascending PM2.5 order".into(),
            ));
        }

        Ok(())
    }

    /// Cache/quota profiles for the configured providers.
    pub fn provider_profiles(&self) -> Vec<ProviderProfile> {
        self.providers
            .iter()
            .map(|p| ProviderProfile {
                id: p.id.clone(),
                daily_quota: p.daily_quota,
                defaults: p.defaults.clone(),
            })
            .collect()
    }

    /// Consensus engine settings.
    pub fn consensus_config(&self) -> ConsensusConfig {
        let veto_overrides: HashMap<String, f64> = self
            .providers
            .iter()
            .filter_map(|p| p.veto_threshold.map(|t| (p.id.clone(), t)))
            .collect();
        ConsensusConfig {
            baseline: self.consensus.baseline_provider.clone(),
            stale_discount: self.consensus.stale_discount,
            default_discount: self.consensus.default_discount,
            veto_threshold: self.consensus.veto_threshold,
            veto_overrides,
        }
    }

    /// Risk classifier settings.
    pub fn risk_config(&self) -> RiskConfig {
        RiskConfig {
            production_start_hour: self.risk.production_start_hour,
            production_end_hour: self.risk.production_end_hour,
            smoke_tiers: self.risk.smoke_tiers.clone(),
        }
    }
}
