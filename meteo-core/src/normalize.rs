//! Turns a raw current-weather payload into a [`NewSample`].

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};

use crate::{
    error::FetchError,
    model::{CurrentWeatherResponse, NewSample},
};

const ZONED_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f%:z",
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%dT%H:%M%:z",
    "%Y-%m-%dT%H:%M%z",
];

const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M"];

/// Parse an ISO-8601 observation time.
///
/// Strings without an offset are taken as UTC. An explicit offset is kept, so
/// the result displays in that offset but compares by absolute instant.
pub fn parse_observed_at(value: &str) -> Result<DateTime<FixedOffset>, FetchError> {
    let invalid = || FetchError::InvalidTimestamp { value: value.to_string() };

    let mut s = value.trim().to_string();
    // Date and time may be separated by a space.
    if s.len() > 10 && s.as_bytes()[10] == b' ' {
        s.replace_range(10..11, "T");
    }
    if let Some(stripped) = s.strip_suffix('Z').or_else(|| s.strip_suffix('z')) {
        s = format!("{stripped}+00:00");
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(&s) {
        return Ok(dt);
    }
    for fmt in ZONED_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(&s, fmt) {
            return Ok(dt);
        }
    }
    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&s, fmt) {
            return Ok(naive.and_utc().fixed_offset());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(&s, "%Y-%m-%d") {
        return Ok(date.and_time(NaiveTime::MIN).and_utc().fixed_offset());
    }

    Err(invalid())
}

/// Build the sample to persist for `city` out of an upstream payload.
///
/// Coordinates are taken from the payload, not from the request.
pub fn normalize(payload: &CurrentWeatherResponse, city: &str) -> Result<NewSample, FetchError> {
    let current = &payload.current_weather;
    let observed_at = parse_observed_at(&current.time)?;

    Ok(NewSample {
        city: city.to_string(),
        latitude: payload.latitude,
        longitude: payload.longitude,
        temperature_c: current.temperature,
        windspeed_kmh: current.windspeed,
        observed_at,
    })
}

/// UTC view of an observation instant.
pub fn to_utc(dt: &DateTime<FixedOffset>) -> DateTime<Utc> {
    dt.with_timezone(&Utc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CurrentConditions;
    use chrono::{Datelike, TimeZone, Timelike};

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn naive_time_is_assumed_utc() {
        let dt = parse_observed_at("2025-12-03T12:00:00").unwrap();

        assert_eq!(dt, utc(2025, 12, 3, 12, 0, 0));
        assert_eq!(dt.offset().local_minus_utc(), 0);
    }

    #[test]
    fn naive_time_matches_parsing_as_utc_directly() {
        for s in ["2024-02-29T23:59:59", "2025-01-01T00:00:00.250", "2025-07-14T08:30"] {
            let ours = parse_observed_at(s).unwrap();
            let direct = DateTime::parse_from_rfc3339(&format!(
                "{}{}",
                if s.len() == 16 { format!("{s}:00") } else { s.to_string() },
                "Z"
            ))
            .unwrap();
            assert_eq!(ours, direct, "{s}");
        }
    }

    #[test]
    fn open_meteo_minute_precision_is_accepted() {
        let dt = parse_observed_at("2025-12-03T12:15").unwrap();
        assert_eq!(dt, utc(2025, 12, 3, 12, 15, 0));
    }

    #[test]
    fn explicit_utc_offset() {
        let dt = parse_observed_at("2025-12-03T12:00:00+00:00").unwrap();
        assert_eq!(dt, utc(2025, 12, 3, 12, 0, 0));

        let zulu = parse_observed_at("2025-12-03T12:00:00Z").unwrap();
        assert_eq!(zulu, dt);
    }

    #[test]
    fn explicit_offset_is_preserved_and_compared_by_instant() {
        let dt = parse_observed_at("2025-12-03T12:00:00+02:00").unwrap();

        assert_eq!(dt.offset().local_minus_utc(), 2 * 3600);
        assert_eq!((dt.year(), dt.month(), dt.day(), dt.hour()), (2025, 12, 3, 12));
        assert_eq!(dt, utc(2025, 12, 3, 10, 0, 0));
        assert_eq!(to_utc(&dt), utc(2025, 12, 3, 10, 0, 0));
    }

    #[test]
    fn compact_and_minute_offsets() {
        assert_eq!(parse_observed_at("2025-12-03T12:00:00-0500").unwrap(), utc(2025, 12, 3, 17, 0, 0));
        assert_eq!(parse_observed_at("2025-12-03T12:00+01:00").unwrap(), utc(2025, 12, 3, 11, 0, 0));
    }

    #[test]
    fn space_separator_and_date_only() {
        assert_eq!(parse_observed_at("2025-12-03 12:00:00").unwrap(), utc(2025, 12, 3, 12, 0, 0));
        assert_eq!(parse_observed_at("2025-12-03").unwrap(), utc(2025, 12, 3, 0, 0, 0));
    }

    #[test]
    fn garbage_is_an_invalid_timestamp() {
        for s in ["", "yesterday", "2025-13-03T12:00:00", "2025-12-03T25:00"] {
            let err = parse_observed_at(s).unwrap_err();
            assert!(matches!(err, FetchError::InvalidTimestamp { ref value } if value == s), "{s}");
        }
    }

    #[test]
    fn normalize_copies_payload_fields() {
        let payload = CurrentWeatherResponse {
            latitude: 41.12,
            longitude: 16.87,
            current_weather: CurrentConditions {
                temperature: 15.5,
                windspeed: 12.3,
                time: "2025-12-03T12:00:00".into(),
            },
        };

        let sample = normalize(&payload, "Bari").unwrap();

        assert_eq!(sample.city, "Bari");
        assert_eq!(sample.latitude, 41.12);
        assert_eq!(sample.longitude, 16.87);
        assert_eq!(sample.temperature_c, 15.5);
        assert_eq!(sample.windspeed_kmh, 12.3);
        assert_eq!(sample.observed_at, utc(2025, 12, 3, 12, 0, 0));
    }

    #[test]
    fn normalize_rejects_bad_time() {
        let payload = CurrentWeatherResponse {
            latitude: 0.0,
            longitude: 0.0,
            current_weather: CurrentConditions { temperature: 1.0, windspeed: 1.0, time: "noon".into() },
        };

        assert!(matches!(normalize(&payload, "X"), Err(FetchError::InvalidTimestamp { .. })));
    }

    proptest::proptest! {
        #[test]
        fn any_naive_timestamp_reads_as_utc(
            y in 1970i32..2100, mo in 1u32..=12, d in 1u32..=28,
            h in 0u32..24, mi in 0u32..60, sec in 0u32..60, ms in 0u32..1000,
        ) {
            let text = format!("{y:04}-{mo:02}-{d:02}T{h:02}:{mi:02}:{sec:02}.{ms:03}");
            let expected = NaiveDate::from_ymd_opt(y, mo, d)
                .and_then(|date| date.and_hms_milli_opt(h, mi, sec, ms))
                .unwrap()
                .and_utc();

            let parsed = parse_observed_at(&text).unwrap();
            proptest::prop_assert_eq!(parsed, expected);
            proptest::prop_assert_eq!(parsed.offset().local_minus_utc(), 0);
        }

        #[test]
        fn any_offset_keeps_instant_and_offset(
            y in 1970i32..2100, mo in 1u32..=12, d in 1u32..=28,
            h in 0u32..24, mi in 0u32..60, offset_min in -720i32..=840,
        ) {
            let sign = if offset_min < 0 { '-' } else { '+' };
            let abs = offset_min.abs();
            let text = format!(
                "{y:04}-{mo:02}-{d:02}T{h:02}:{mi:02}:00{sign}{:02}:{:02}",
                abs / 60,
                abs % 60
            );
            let offset = FixedOffset::east_opt(offset_min * 60).unwrap();
            let local = NaiveDate::from_ymd_opt(y, mo, d)
                .and_then(|date| date.and_hms_opt(h, mi, 0))
                .unwrap();
            let expected = offset.from_local_datetime(&local).single().unwrap();

            let parsed = parse_observed_at(&text).unwrap();
            proptest::prop_assert_eq!(to_utc(&parsed), expected.with_timezone(&Utc));
            proptest::prop_assert_eq!(parsed.offset().local_minus_utc(), offset_min * 60);
        }
    }
}
