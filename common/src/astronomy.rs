use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::{
    time::{leading_int, local_hour, local_minute, parse_hour_minute, Clock},
    uri::Uri,
};

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub status: u16,
    pub body: String,
}

pub trait Fetch {
    fn get(&mut self, host: &str, path: &str) -> Result<FetchResponse, FetchError>;
}

#[derive(Debug, Error)]
pub enum AstronomyError {
    #[error("astronomy request failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("astronomy request returned HTTP {0}")]
    Status(u16),
    #[error("astronomy response body is empty")]
    EmptyBody,
    #[error("astronomy response is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("astronomy response is missing `{0}`")]
    MissingField(&'static str),
    #[error("gave up on astronomy data after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<AstronomyError>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    /// `None` retries until a fetch succeeds.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_RETRY_INTERVAL,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    pub fn allows_retry_after(&self, attempts: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts < max)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AstronomyState {
    sunrise: Option<i64>,
    sunset: Option<i64>,
    using_astronomy_data: bool,
}

impl AstronomyState {
    pub fn sunrise(&self) -> Option<i64> {
        self.sunrise
    }

    pub fn sunset(&self) -> Option<i64> {
        self.sunset
    }

    pub fn is_using_astronomy_data(&self) -> bool {
        self.using_astronomy_data
    }

    pub fn require_astronomy_data(&mut self) {
        self.using_astronomy_data = true;
    }

    pub fn is_refresh_due<C: Clock + ?Sized>(&self, clock: &C, check_time: &str) -> bool {
        if !self.using_astronomy_data {
            return false;
        }

        let (check_hour, check_minute) = parse_hour_minute(check_time);
        let now = clock.now();
        let at_check_time =
            local_hour(clock, now) == check_hour && local_minute(clock, now) == check_minute;

        at_check_time || self.sunrise.is_none() || self.sunset.is_none()
    }

    pub fn commit(&mut self, sunrise: i64, sunset: i64) {
        self.sunrise = Some(sunrise);
        self.sunset = Some(sunset);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AstronomyReading {
    pub sunrise_hour: i32,
    pub sunrise_minute: i32,
    pub sunset_hour: i32,
    pub sunset_minute: i32,
}

/// Extracts the four clock fields from
/// `{"moon_phase": {"sunrise": {"hour", "minute"}, "sunset": {...}}}`.
/// Values may be numbers or numeric strings; non-numeric strings read as 0.
pub fn parse_astronomy_response(body: &str) -> Result<AstronomyReading, AstronomyError> {
    let root: Value = serde_json::from_str(body)?;

    let field = |event: &str, unit: &str, path: &'static str| {
        root.get("moon_phase")
            .and_then(|phase| phase.get(event))
            .and_then(|entry| entry.get(unit))
            .map(lenient_int)
            .ok_or(AstronomyError::MissingField(path))
    };

    Ok(AstronomyReading {
        sunset_hour: field("sunset", "hour", "moon_phase.sunset.hour")?,
        sunset_minute: field("sunset", "minute", "moon_phase.sunset.minute")?,
        sunrise_hour: field("sunrise", "hour", "moon_phase.sunrise.hour")?,
        sunrise_minute: field("sunrise", "minute", "moon_phase.sunrise.minute")?,
    })
}

pub fn fetch_astronomy<F: Fetch + ?Sized>(
    fetch: &mut F,
    api_url: &str,
) -> Result<AstronomyReading, AstronomyError> {
    let uri = Uri::parse(api_url);
    let response = fetch.get(&uri.authority(), &uri.request_target())?;

    if response.status != 200 {
        return Err(AstronomyError::Status(response.status));
    }
    if response.body.is_empty() {
        return Err(AstronomyError::EmptyBody);
    }

    parse_astronomy_response(&response.body)
}

fn lenient_int(value: &Value) -> i32 {
    match value {
        Value::String(text) => leading_int(text),
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|f| f as i64))
            .and_then(|n| i32::try_from(n).ok())
            .unwrap_or(0),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{epoch, FakeClock, FakeFetch};

    const BODY: &str = r#"{
        "moon_phase": {
            "percentIlluminated": "81",
            "sunset": { "hour": "19", "minute": "42" },
            "sunrise": { "hour": "6", "minute": "07" }
        }
    }"#;

    #[test]
    fn parses_string_fields() {
        let reading = parse_astronomy_response(BODY).unwrap();
        assert_eq!(
            reading,
            AstronomyReading {
                sunrise_hour: 6,
                sunrise_minute: 7,
                sunset_hour: 19,
                sunset_minute: 42,
            }
        );
    }

    #[test]
    fn parses_numeric_and_garbage_fields() {
        let body = r#"{"moon_phase":{"sunset":{"hour":20,"minute":"x"},"sunrise":{"hour":5,"minute":59}}}"#;
        let reading = parse_astronomy_response(body).unwrap();
        assert_eq!(reading.sunset_hour, 20);
        assert_eq!(reading.sunset_minute, 0);
        assert_eq!(reading.sunrise_minute, 59);
    }

    #[test]
    fn missing_field_is_an_error() {
        let body = r#"{"moon_phase":{"sunset":{"hour":"19","minute":"42"}}}"#;
        assert!(matches!(
            parse_astronomy_response(body),
            Err(AstronomyError::MissingField("moon_phase.sunrise.hour"))
        ));
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(matches!(
            parse_astronomy_response("{not json"),
            Err(AstronomyError::Json(_))
        ));
    }

    #[test]
    fn fetch_uses_host_and_path_of_url() {
        let mut fetch = FakeFetch::new();
        fetch.push_ok(200, BODY);

        let reading =
            fetch_astronomy(&mut fetch, "http://api.example.com/astronomy/q/NY.json").unwrap();

        assert_eq!(reading.sunset_hour, 19);
        assert_eq!(
            fetch.calls(),
            vec![(
                "api.example.com".to_string(),
                "/astronomy/q/NY.json".to_string()
            )]
        );
    }

    #[test]
    fn non_200_and_empty_bodies_fail() {
        let mut fetch = FakeFetch::new();
        fetch.push_ok(503, BODY);
        fetch.push_ok(200, "");

        assert!(matches!(
            fetch_astronomy(&mut fetch, "api.example.com/a"),
            Err(AstronomyError::Status(503))
        ));
        assert!(matches!(
            fetch_astronomy(&mut fetch, "api.example.com/a"),
            Err(AstronomyError::EmptyBody)
        ));
    }

    #[test]
    fn refresh_due_rules() {
        let clock = FakeClock::at(epoch(2026, 6, 1, 3, 5, 0), 0);
        let mut state = AstronomyState::default();

        // Not using astronomy data: never due.
        assert!(!state.is_refresh_due(&clock, "0:05"));

        state.require_astronomy_data();
        assert!(state.is_refresh_due(&clock, "0:05"));

        state.commit(1, 2);
        assert!(!state.is_refresh_due(&clock, "0:05"));
        assert!(state.is_refresh_due(&clock, "3:05"));
    }

    #[test]
    fn retry_policy_caps() {
        let unbounded = RetryPolicy::default();
        assert_eq!(unbounded.interval, Duration::from_secs(5));
        assert!(unbounded.allows_retry_after(10_000));

        let capped = RetryPolicy {
            max_attempts: Some(2),
            ..RetryPolicy::default()
        };
        assert!(capped.allows_retry_after(1));
        assert!(!capped.allows_retry_after(2));
    }
}
