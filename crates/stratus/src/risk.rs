//! Fog/Smoke Risk Classifier — per-hour state machine over the blended
//! forecast, with pre-dawn lock-in persistence.
//!
//! Radiation fog in an inversion-prone valley forms before dawn and can
//! hold through the production window long after point readings improve.
//! Once the pre-dawn hours trip the lock-in, the rest of the local day
//! stays classified HIGH unless an hour is actively CRITICAL.

use serde::{Deserialize, Serialize};

use crate::clock;

/// Dewpoint depression (°C) below which saturation is imminent.
pub const DEW_POINT_DEPRESSION_THRESHOLD: f64 = 2.5;

/// Wind speed (km/h) below which the air column stagnates.
pub const WIND_STAGNATION_THRESHOLD: f64 = 8.0;

/// Pre-dawn lock-in window, local hours `[start, end)`.
const LOCK_IN_START_HOUR: u32 = 4;
const LOCK_IN_END_HOUR: u32 = 8;

/// Fog probability that trips the pre-dawn lock-in.
const LOCK_IN_PROBABILITY: f64 = 0.8;

/// Fog probability that marks an hour as actively fogged-in.
const ACTIVE_FOG_PROBABILITY: f64 = 0.85;

/// Fog probability above which an hour is at least MODERATE risk.
const MODERATE_PROBABILITY: f64 = 0.5;

/// PM2.5 concentration that raises a smoke alert annotation.
const SMOKE_ALERT_PM: f64 = 100.0;

/// Per-run fog state, reset at the local day boundary and discarded at
/// run end.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FogState {
    pub locked_in: bool,
    pub lock_in_hours: u32,
}

/// Risk classification for one production hour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskClass {
    Low,
    Moderate,
    High,
    Critical,
}

impl RiskClass {
    /// Solar output multiplier applied for this class.
    pub fn multiplier(&self) -> f64 {
        match self {
            RiskClass::Low => 1.0,
            RiskClass::Moderate => 0.70,
            RiskClass::High => 0.40,
            RiskClass::Critical => 0.15,
        }
    }

    /// Operator-facing label.
    pub fn label(&self) -> &'static str {
        match self {
            RiskClass::Low => "LOW",
            RiskClass::Moderate => "MODERATE (RISK)",
            RiskClass::High => "HIGH (PERSISTENT STRATUS)",
            RiskClass::Critical => "CRITICAL (ACTIVE FOG)",
        }
    }
}

/// One PM2.5 band and the steady output multiplier it imposes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SmokeTier {
    pub max_pm2_5: f64,
    pub multiplier: f64,
}

/// Smoke thresholds are calibration parameters, not constants; these
/// defaults come from the deployment the engine was built for.
pub fn default_smoke_tiers() -> Vec<SmokeTier> {
    vec![
        SmokeTier { max_pm2_5: 25.0, multiplier: 1.00 },
        SmokeTier { max_pm2_5: 50.0, multiplier: 0.95 },
        SmokeTier { max_pm2_5: 100.0, multiplier: 0.85 },
        SmokeTier { max_pm2_5: 200.0, multiplier: 0.70 },
    ]
}

/// Multiplier once PM2.5 exceeds every configured band.
const SMOKE_FLOOR_MULTIPLIER: f64 = 0.50;

/// Classifier tunables.
#[derive(Debug, Clone)]
pub struct RiskConfig {
    /// Daylight/production window, local hours `[start, end]` inclusive.
    pub production_start_hour: u32,
    pub production_end_hour: u32,
    pub smoke_tiers: Vec<SmokeTier>,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            production_start_hour: 8,
            production_end_hour: 16,
            smoke_tiers: default_smoke_tiers(),
        }
    }
}

/// Blended inputs for one hour-slot.
#[derive(Debug, Clone, Copy)]
pub struct HourConditions {
    pub ts: i64,
    pub temperature: f64,
    pub dewpoint: f64,
    pub wind_kmh: f64,
    pub radiation: f64,
    pub pm2_5: Option<f64>,
}

/// Classifier output for one hour-slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HourRisk {
    pub ts: i64,
    pub fog_probability: f64,
    pub class: RiskClass,
    pub solar_multiplier: f64,
    pub smoke_multiplier: f64,
    /// Raw radiation scaled by the worse of the fog and smoke
    /// multipliers.
    pub solar_adjusted: f64,
    pub smoke_alert: bool,
}

/// Stateful fog/smoke classifier. One instance per deployment; each
/// `classify` call runs a fresh forward pass.
pub struct RiskClassifier {
    config: RiskConfig,
    utc_offset_minutes: i32,
}

impl RiskClassifier {
    pub fn new(config: RiskConfig, utc_offset_minutes: i32) -> Self {
        Self {
            config,
            utc_offset_minutes,
        }
    }

    /// Single forward pass over the hours, in timestamp order.
    pub fn classify(&self, hours: &[HourConditions]) -> Vec<HourRisk> {
        let mut state = FogState::default();
        let mut last_day: Option<i64> = None;
        let mut out = Vec::with_capacity(hours.len());

        for hour in hours {
            let day = clock::local_day_index(hour.ts, self.utc_offset_minutes);
            if last_day.is_some_and(|d| d != day) {
                state = FogState::default();
            }
            last_day = Some(day);

            out.push(self.classify_hour(hour, &mut state));
        }

        if state.lock_in_hours > 0 {
            log::warn!(
                "[RiskClassifier] fog lock-in: {} pre-dawn hours tripped the inversion",
                state.lock_in_hours
            );
        }

        out
    }

    fn classify_hour(&self, hour: &HourConditions, state: &mut FogState) -> HourRisk {
        let local_hour = clock::local_hour(hour.ts, self.utc_offset_minutes);
        let probability = fog_probability(hour.temperature, hour.dewpoint, hour.wind_kmh);

        // Pre-dawn lock-in check runs every hour regardless of daylight.
        if (LOCK_IN_START_HOUR..LOCK_IN_END_HOUR).contains(&local_hour)
            && probability > LOCK_IN_PROBABILITY
        {
            if !state.locked_in {
                log::warn!(
                    "[RiskClassifier] pre-dawn lock-in at local hour {} (fog probability {:.2})",
                    local_hour,
                    probability
                );
            }
            state.locked_in = true;
            state.lock_in_hours += 1;
        }

        let in_production = (self.config.production_start_hour..=self.config.production_end_hour)
            .contains(&local_hour);

        // Severity precedence: an actively-fogged hour is CRITICAL even
        // while locked in.
        let class = if !in_production {
            RiskClass::Low
        } else if probability > ACTIVE_FOG_PROBABILITY {
            RiskClass::Critical
        } else if state.locked_in {
            RiskClass::High
        } else if probability > MODERATE_PROBABILITY {
            RiskClass::Moderate
        } else {
            RiskClass::Low
        };

        // Smoke applies around the clock, production window or not.
        let (smoke_multiplier, smoke_alert) = self.smoke_multiplier(hour.pm2_5);
        let solar_multiplier = class.multiplier();
        let solar_adjusted = hour.radiation * solar_multiplier.min(smoke_multiplier);

        HourRisk {
            ts: hour.ts,
            fog_probability: probability,
            class,
            solar_multiplier,
            smoke_multiplier,
            solar_adjusted,
            smoke_alert,
        }
    }

    fn smoke_multiplier(&self, pm2_5: Option<f64>) -> (f64, bool) {
        let Some(pm) = pm2_5 else {
            return (1.0, false);
        };
        let alert = pm > SMOKE_ALERT_PM;
        for tier in &self.config.smoke_tiers {
            if pm <= tier.max_pm2_5 {
                return (tier.multiplier, alert);
            }
        }
        (SMOKE_FLOOR_MULTIPLIER, alert)
    }
}

/// Probability of radiation fog from dewpoint depression and wind
/// stagnation, each clamped to [0, 1].
pub fn fog_probability(temperature: f64, dewpoint: f64, wind_kmh: f64) -> f64 {
    let depression_factor =
        (1.0 - (temperature - dewpoint) / DEW_POINT_DEPRESSION_THRESHOLD).clamp(0.0, 1.0);
    let stagnation_factor = (1.0 - wind_kmh / WIND_STAGNATION_THRESHOLD).clamp(0.0, 1.0);
    depression_factor * stagnation_factor
}
