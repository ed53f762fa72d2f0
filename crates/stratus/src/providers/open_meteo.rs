//! Open-Meteo forecast provider.
//!
//! Fetches the hourly forecast for the configured site and converts it
//! into hour-aligned readings. Free, no API key, no documented call
//! cap; doubles as the default baseline provider.

use async_trait::async_trait;
use serde::Deserialize;

use super::classify_reqwest_error;
use crate::provider::{Metric, ProviderError, ProviderFetch, Reading, SourceSnapshot, TimeWindow, TrustTier};

const FORECAST_URL: &str = "https://api.open-meteo.com/v1/forecast";

const HOURLY_FIELDS: &str = "temperature_2m,dew_point_2m,wind_speed_10m,cloud_cover,\
                             precipitation_probability,shortwave_radiation";

/// Wire format for the hourly forecast response (not public).
#[derive(Debug, Deserialize)]
struct ForecastResponse {
    hourly: HourlyBlock,
}

#[derive(Debug, Deserialize)]
struct HourlyBlock {
    /// Unix epoch seconds (`timeformat=unixtime`).
    time: Vec<i64>,
    temperature_2m: Vec<Option<f64>>,
    dew_point_2m: Vec<Option<f64>>,
    wind_speed_10m: Vec<Option<f64>>,
    cloud_cover: Vec<Option<f64>>,
    precipitation_probability: Vec<Option<f64>>,
    shortwave_radiation: Vec<Option<f64>>,
}

/// Open-Meteo hourly forecast client.
pub struct OpenMeteoProvider {
    id: String,
    client: reqwest::Client,
    latitude: f64,
    longitude: f64,
}

impl OpenMeteoProvider {
    pub fn new(id: impl Into<String>, client: reqwest::Client, latitude: f64, longitude: f64) -> Self {
        Self {
            id: id.into(),
            client,
            latitude,
            longitude,
        }
    }

    fn readings_from(&self, response: ForecastResponse, window: TimeWindow) -> Vec<Reading> {
        let hourly = response.hourly;
        let mut readings = Vec::new();
        let columns: [(Metric, &[Option<f64>]); 6] = [
            (Metric::Temperature, &hourly.temperature_2m),
            (Metric::Dewpoint, &hourly.dew_point_2m),
            (Metric::WindSpeed, &hourly.wind_speed_10m),
            (Metric::CloudCover, &hourly.cloud_cover),
            (Metric::PrecipProbability, &hourly.precipitation_probability),
            (Metric::Radiation, &hourly.shortwave_radiation),
        ];
        for (i, &ts) in hourly.time.iter().enumerate() {
            if ts < window.start || ts >= window.end {
                continue;
            }
            for (metric, column) in &columns {
                if let Some(Some(value)) = column.get(i) {
                    readings.push(Reading::new(self.id.clone(), ts, *metric, *value));
                }
            }
        }
        readings
    }
}

#[async_trait]
impl ProviderFetch for OpenMeteoProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn fetch(&self, window: TimeWindow) -> Result<SourceSnapshot, ProviderError> {
        let forecast_days = ((window.end - window.start) / 86_400 + 1).clamp(1, 16);
        let response = self
            .client
            .get(FORECAST_URL)
            .query(&[
                ("latitude", self.latitude.to_string()),
                ("longitude", self.longitude.to_string()),
                ("hourly", HOURLY_FIELDS.to_string()),
                ("timeformat", "unixtime".to_string()),
                ("timezone", "UTC".to_string()),
                ("forecast_days", forecast_days.to_string()),
            ])
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Http {
                status: status.as_u16(),
            });
        }

        let parsed: ForecastResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        let readings = self.readings_from(parsed, window);
        if readings.is_empty() {
            return Err(ProviderError::Parse(
                "no hourly readings inside the requested window".into(),
            ));
        }
        log::debug!("[{}] fetched {} readings", self.id, readings.len());

        Ok(SourceSnapshot {
            provider: self.id.clone(),
            readings,
            fetched_at: 0, // stamped by the coordinator
            trust_tier: TrustTier::Fresh,
            is_synthesized: false,
        })
    }
}
