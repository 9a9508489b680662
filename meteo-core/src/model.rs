use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Current-conditions block of an Open-Meteo forecast response.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CurrentConditions {
    pub temperature: f64,
    pub windspeed: f64,
    /// ISO-8601, with or without an offset.
    pub time: String,
}

/// The subset of the Open-Meteo forecast response the sampler relies on.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CurrentWeatherResponse {
    pub latitude: f64,
    pub longitude: f64,
    pub current_weather: CurrentConditions,
}

/// A normalized observation that has not been persisted yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSample {
    pub city: String,
    pub latitude: f64,
    pub longitude: f64,
    pub temperature_c: f64,
    pub windspeed_kmh: f64,
    pub observed_at: DateTime<FixedOffset>,
}

/// A persisted, immutable weather observation.
#[derive(Debug, Clone, PartialEq)]
pub struct WeatherSample {
    pub id: i64,
    pub city: String,
    pub latitude: f64,
    pub longitude: f64,
    pub temperature_c: f64,
    pub windspeed_kmh: f64,
    pub observed_at: DateTime<FixedOffset>,
    pub created_at: DateTime<Utc>,
}

impl fmt::Display for WeatherSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} @ {}: {:?}°C",
            self.city,
            self.observed_at.format("%Y-%m-%d %H:%M:%S%.f%:z"),
            self.temperature_c
        )
    }
}

/// Wire shape of `GET /weather/latest/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleView {
    pub city: String,
    pub lat: f64,
    pub lon: f64,
    pub temp: f64,
    pub wind: f64,
    pub observed: String,
    pub created_at: String,
}

impl From<&WeatherSample> for SampleView {
    fn from(s: &WeatherSample) -> Self {
        Self {
            city: s.city.clone(),
            lat: s.latitude,
            lon: s.longitude,
            temp: s.temperature_c,
            wind: s.windspeed_kmh,
            observed: s.observed_at.to_rfc3339_opts(SecondsFormat::AutoSi, false),
            created_at: s.created_at.to_rfc3339_opts(SecondsFormat::AutoSi, false),
        }
    }
}

/// Arguments of one deferred fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchJob {
    pub city: String,
    pub latitude: f64,
    pub longitude: f64,
}
