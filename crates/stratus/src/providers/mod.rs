//! Bundled provider implementations.
//!
//! The core only depends on the [`crate::provider::ProviderFetch`] and
//! [`crate::provider::GroundTruth`] contracts; these are the reference
//! implementations shipped with the engine. Deployment-specific
//! providers (scrapers, vendor APIs) live outside the crate.

mod archive;
mod open_meteo;

pub use archive::ArchiveGroundTruth;
pub use open_meteo::OpenMeteoProvider;

use async_trait::async_trait;

use crate::provider::{ProviderError, ProviderFetch, SourceSnapshot, TimeWindow};

/// A provider with no live fetch capability.
///
/// Always reports [`ProviderError::Unavailable`], so the coordinator
/// serves its cache or configured defaults. Useful for declaring
/// placeholder providers whose real fetcher is operated out-of-process
/// and fills the cache through other means.
pub struct StaticProvider {
    id: String,
}

impl StaticProvider {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[async_trait]
impl ProviderFetch for StaticProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn fetch(&self, _window: TimeWindow) -> Result<SourceSnapshot, ProviderError> {
        Err(ProviderError::Unavailable)
    }
}

/// Map a reqwest failure onto the provider error taxonomy.
pub(crate) fn classify_reqwest_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout
    } else if let Some(status) = err.status() {
        ProviderError::Http {
            status: status.as_u16(),
        }
    } else if err.is_decode() {
        ProviderError::Parse(err.to_string())
    } else {
        ProviderError::Network(err.to_string())
    }
}
