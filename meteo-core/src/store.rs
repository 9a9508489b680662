//! Append-only persistence of weather samples.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::fmt::Debug;
use tracing::debug;

use crate::{
    db::Database,
    error::StoreError,
    model::{NewSample, WeatherSample},
    normalize::to_utc,
};

/// Durable record store for samples.
///
/// Records are never updated or deleted. "Latest" is by `observed_at`, not by
/// insertion order.
#[async_trait]
pub trait SampleStore: Send + Sync + Debug {
    /// Persist `sample`, stamping `created_at`. All-or-nothing.
    async fn store(&self, sample: NewSample) -> Result<WeatherSample, StoreError>;

    /// Sample with the greatest `observed_at`, if any.
    async fn latest(&self) -> Result<Option<WeatherSample>, StoreError>;

    /// Up to `limit` samples, newest observation first.
    async fn recent(&self, limit: usize) -> Result<Vec<WeatherSample>, StoreError>;
}

/// SQLite-backed [`SampleStore`].
#[derive(Debug, Clone)]
pub struct SqliteSampleStore {
    db: Database,
}

const SELECT_COLUMNS: &str = "SELECT id, city, latitude, longitude, temperature_c, windspeed_kmh, \
     observed_at, created_at_us FROM weather_samples";

impl SqliteSampleStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

type RawRow = (i64, String, f64, f64, f64, f64, String, i64);

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn into_sample(raw: RawRow) -> Result<WeatherSample, StoreError> {
    let (id, city, latitude, longitude, temperature_c, windspeed_kmh, observed_at, created_at_us) =
        raw;

    let observed_at = DateTime::parse_from_rfc3339(&observed_at)
        .map_err(|e| StoreError::Corrupt(format!("sample {id} observed_at '{observed_at}': {e}")))?;
    let created_at = DateTime::<Utc>::from_timestamp_micros(created_at_us)
        .ok_or_else(|| StoreError::Corrupt(format!("sample {id} created_at {created_at_us}")))?;

    Ok(WeatherSample {
        id,
        city,
        latitude,
        longitude,
        temperature_c,
        windspeed_kmh,
        observed_at,
        created_at,
    })
}

fn insert(conn: &mut Connection, sample: NewSample) -> Result<WeatherSample, StoreError> {
    let tx = conn.transaction()?;

    // created_at never goes backwards, even if the wall clock does.
    let last_us: Option<i64> =
        tx.query_row("SELECT MAX(created_at_us) FROM weather_samples", [], |row| row.get(0))?;
    let created_us = Utc::now().timestamp_micros().max(last_us.unwrap_or(i64::MIN));
    let created_at = DateTime::<Utc>::from_timestamp_micros(created_us)
        .ok_or_else(|| StoreError::Corrupt(format!("created_at {created_us} out of range")))?;

    tx.execute(
        "INSERT INTO weather_samples \
         (city, latitude, longitude, temperature_c, windspeed_kmh, \
          observed_at, observed_at_us, created_at, created_at_us) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            sample.city,
            sample.latitude,
            sample.longitude,
            sample.temperature_c,
            sample.windspeed_kmh,
            sample.observed_at.to_rfc3339_opts(SecondsFormat::AutoSi, false),
            to_utc(&sample.observed_at).timestamp_micros(),
            created_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            created_us,
        ],
    )?;
    let id = tx.last_insert_rowid();
    tx.commit()?;

    Ok(WeatherSample {
        id,
        city: sample.city,
        latitude: sample.latitude,
        longitude: sample.longitude,
        temperature_c: sample.temperature_c,
        windspeed_kmh: sample.windspeed_kmh,
        observed_at: sample.observed_at,
        created_at,
    })
}

#[async_trait]
impl SampleStore for SqliteSampleStore {
    async fn store(&self, sample: NewSample) -> Result<WeatherSample, StoreError> {
        let stored = self.db.call(move |conn| insert(conn, sample)).await?;
        debug!(id = stored.id, city = %stored.city, observed_at = %stored.observed_at, "stored sample");
        Ok(stored)
    }

    async fn latest(&self) -> Result<Option<WeatherSample>, StoreError> {
        self.db
            .call(|conn| -> Result<Option<WeatherSample>, StoreError> {
                let raw = conn
                    .query_row(
                        &format!("{SELECT_COLUMNS} ORDER BY observed_at_us DESC, id DESC LIMIT 1"),
                        [],
                        read_row,
                    )
                    .optional()?;
                raw.map(into_sample).transpose()
            })
            .await
    }

    async fn recent(&self, limit: usize) -> Result<Vec<WeatherSample>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.db
            .call(move |conn| -> Result<Vec<WeatherSample>, StoreError> {
                let mut stmt = conn.prepare(&format!(
                    "{SELECT_COLUMNS} ORDER BY observed_at_us DESC, id DESC LIMIT ?1"
                ))?;
                let rows = stmt.query_map(params![limit], read_row)?;
                rows.map(|raw| into_sample(raw?)).collect()
            })
            .await
    }
}
