use std::sync::Arc;
use tracing::{info, instrument};

use crate::{
    error::FetchError,
    model::WeatherSample,
    normalize::normalize,
    provider::WeatherProvider,
    store::SampleStore,
};

/// Fetch → normalize → store, shared by the HTTP handler and the job worker.
///
/// The store write is the only side effect and comes last, so any earlier
/// failure leaves nothing behind. Errors are returned untranslated.
#[derive(Debug, Clone)]
pub struct FetchPipeline {
    provider: Arc<dyn WeatherProvider>,
    store: Arc<dyn SampleStore>,
}

impl FetchPipeline {
    pub fn new(provider: Arc<dyn WeatherProvider>, store: Arc<dyn SampleStore>) -> Self {
        Self { provider, store }
    }

    pub fn store(&self) -> &Arc<dyn SampleStore> {
        &self.store
    }

    #[instrument(skip(self))]
    pub async fn run(
        &self,
        city: &str,
        latitude: f64,
        longitude: f64,
    ) -> Result<WeatherSample, FetchError> {
        let payload = self.provider.get_current(latitude, longitude).await?;
        let sample = normalize(&payload, city)?;
        let stored = self.store.store(sample).await?;

        info!(
            id = stored.id,
            temperature_c = stored.temperature_c,
            windspeed_kmh = stored.windspeed_kmh,
            observed_at = %stored.observed_at,
            "weather sample stored"
        );
        Ok(stored)
    }
}
