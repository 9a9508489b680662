use crate::{Config, error::FetchError, model::CurrentWeatherResponse};
use async_trait::async_trait;
use std::{fmt::Debug, sync::Arc};

pub mod openmeteo;

pub use openmeteo::OpenMeteoProvider;

/// Source of current-conditions data for a coordinate pair.
///
/// One attempt per call; retries are the caller's business.
#[async_trait]
pub trait WeatherProvider: Send + Sync + Debug {
    async fn get_current(
        &self,
        latitude: f64,
        longitude: f64,
    ) -> Result<CurrentWeatherResponse, FetchError>;
}

/// Construct the configured provider.
pub fn provider_from_config(config: &Config) -> anyhow::Result<Arc<dyn WeatherProvider>> {
    let provider = OpenMeteoProvider::new(&config.api.base_url, config.api.timeout())?;
    Ok(Arc::new(provider))
}
