use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use std::time::Duration;
use tracing::debug;

use crate::{error::FetchError, model::CurrentWeatherResponse};

use super::WeatherProvider;

pub const DEFAULT_BASE_URL: &str = "https://api.open-meteo.com/v1/forecast";

/// Open-Meteo forecast endpoint, queried for current conditions only.
#[derive(Debug, Clone)]
pub struct OpenMeteoProvider {
    base_url: Url,
    timeout: Duration,
    http: Client,
}

impl OpenMeteoProvider {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .with_context(|| format!("Invalid weather API base URL '{base_url}'"))?;
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self { base_url, timeout, http })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn classify(&self, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::UpstreamTimeout { timeout: self.timeout }
        } else {
            FetchError::Transport(err)
        }
    }
}

#[async_trait]
impl WeatherProvider for OpenMeteoProvider {
    async fn get_current(
        &self,
        latitude: f64,
        longitude: f64,
    ) -> Result<CurrentWeatherResponse, FetchError> {
        debug!(%latitude, %longitude, url = %self.base_url, "requesting current weather");

        let res = self
            .http
            .get(self.base_url.clone())
            .query(&[
                ("latitude", latitude.to_string()),
                ("longitude", longitude.to_string()),
                ("current_weather", "true".to_string()),
            ])
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = res.status();
        if !status.is_success() {
            return Err(FetchError::UpstreamHttp { status });
        }

        let body = res.bytes().await.map_err(|e| self.classify(e))?;

        serde_json::from_slice(&body).map_err(|e| FetchError::MalformedResponse(e.to_string()))
    }
}
