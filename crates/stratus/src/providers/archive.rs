//! Ground-truth client over the Open-Meteo archive API.
//!
//! The archive blends station records with reanalysis, so a finished
//! day always has an observed high/low — verification never stalls on
//! missing station data.

use async_trait::async_trait;
use serde::Deserialize;

use super::classify_reqwest_error;
use crate::clock;
use crate::provider::{DailyExtremes, GroundTruth, ProviderError};

const ARCHIVE_URL: &str = "https://archive-api.open-meteo.com/v1/archive";

/// Wire format for the daily archive response (not public).
#[derive(Debug, Deserialize)]
struct ArchiveResponse {
    daily: DailyBlock,
}

#[derive(Debug, Deserialize)]
struct DailyBlock {
    temperature_2m_max: Vec<Option<f64>>,
    temperature_2m_min: Vec<Option<f64>>,
}

/// Observed daily extremes from the Open-Meteo archive.
pub struct ArchiveGroundTruth {
    client: reqwest::Client,
    latitude: f64,
    longitude: f64,
    /// IANA timezone name so the archive aggregates over site-local
    /// days ("auto" resolves from the coordinates).
    timezone: String,
}

impl ArchiveGroundTruth {
    pub fn new(
        client: reqwest::Client,
        latitude: f64,
        longitude: f64,
        timezone: impl Into<String>,
    ) -> Self {
        Self {
            client,
            latitude,
            longitude,
            timezone: timezone.into(),
        }
    }
}

#[async_trait]
impl GroundTruth for ArchiveGroundTruth {
    async fn daily_extremes(&self, day_index: i64) -> Result<DailyExtremes, ProviderError> {
        let date = chrono::DateTime::from_timestamp(day_index * clock::DAY_SECS, 0)
            .ok_or_else(|| ProviderError::Parse(format!("day index {} out of range", day_index)))?
            .date_naive()
            .format("%Y-%m-%d")
            .to_string();

        let response = self
            .client
            .get(ARCHIVE_URL)
            .query(&[
                ("latitude", self.latitude.to_string()),
                ("longitude", self.longitude.to_string()),
                ("start_date", date.clone()),
                ("end_date", date.clone()),
                ("daily", "temperature_2m_max,temperature_2m_min".to_string()),
                ("timezone", self.timezone.clone()),
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

        let parsed: ArchiveResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        match (
            parsed.daily.temperature_2m_max.first().copied().flatten(),
            parsed.daily.temperature_2m_min.first().copied().flatten(),
        ) {
            (Some(high), Some(low)) => {
                log::info!(
                    "[ArchiveGroundTruth] {}: observed high {:.1}, low {:.1}",
                    date,
                    high,
                    low
                );
                Ok(DailyExtremes { high, low })
            }
            _ => Err(ProviderError::Parse(format!(
                "archive has no daily extremes for {}",
                date
            ))),
        }
    }
}
