/// Plant historian (PI Web API) client
///
/// Retrieves interpolated values for one meter at a time. Each fetch is two
/// requests: an attribute lookup that turns a hierarchical path into a data
/// link, then the interpolated-data request over the tick's window.
///
/// Paths look like:
///   \\SERVER\OPS\Gauging Stations\R4|Flow
///   \\SERVER\Energy_Marketing\Misc Tags|GEN_MDFK_and_RA

use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Deserialize;

use crate::config::HistorianConfig;
use crate::ingest::{FetchMode, TelemetrySource};
use crate::logging::log_historian_failure;
use crate::meters::ElementType;
use crate::model::{HistorianError, MeterSeries, SourceDatabase, TimeSeriesPoint};

/// Folder holding element-less tags in the energy marketing database.
const MISC_TAGS_FOLDER: &str = "Misc Tags";

// ============================================================================
// Settings
// ============================================================================

#[derive(Debug, Clone)]
pub struct HistorianSettings {
    pub base_url: String,
    pub server: String,
    pub interval: String,
    pub lookback: chrono::Duration,
    pub lookahead: chrono::Duration,
    pub timeout: Duration,
    pub tz: Tz,
}

impl HistorianSettings {
    pub fn from_config(config: &HistorianConfig, tz: Tz) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            server: config.server.clone(),
            interval: config.interval.clone(),
            lookback: chrono::Duration::hours(config.lookback_hours),
            lookahead: chrono::Duration::hours(config.lookahead_hours),
            timeout: Duration::from_secs(config.timeout_secs),
            tz,
        }
    }
}

// ============================================================================
// API Response Structures
// ============================================================================

#[derive(Debug, Deserialize)]
struct AttributeResponse {
    #[serde(rename = "Links")]
    links: AttributeLinks,
}

#[derive(Debug, Deserialize)]
struct AttributeLinks {
    #[serde(rename = "InterpolatedData")]
    interpolated_data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ItemsResponse {
    #[serde(rename = "Items")]
    items: Vec<Item>,
}

#[derive(Debug, Deserialize)]
struct Item {
    #[serde(rename = "Timestamp")]
    timestamp: String,
    /// A number, or an object describing a digital state such as "No Data".
    #[serde(rename = "Value")]
    value: serde_json::Value,
    #[serde(rename = "Good", default = "default_good")]
    good: bool,
}

fn default_good() -> bool {
    true
}

// ============================================================================
// Request construction
// ============================================================================

/// Builds the attribute path for a meter.
///
/// Operations meters need a resolvable element type; energy marketing tags
/// all live in the misc-tags folder.
pub fn build_attribute_path(server: &str, meter: &MeterSeries) -> Result<String, HistorianError> {
    match meter.database {
        SourceDatabase::EnergyMarketing => Ok(format!(
            "\\\\{}\\{}\\{}|{}",
            server,
            meter.database.path_name(),
            MISC_TAGS_FOLDER,
            meter.attribute
        )),
        SourceDatabase::Ops => {
            let element = ElementType::resolve(meter)
                .ok_or_else(|| HistorianError::UnresolvedElement(meter.column_key()))?;
            let station = meter
                .station
                .ok_or_else(|| HistorianError::UnresolvedElement(meter.column_key()))?;
            Ok(format!(
                "\\\\{}\\{}\\{}\\{}|{}",
                server,
                meter.database.path_name(),
                element.path_name(),
                station,
                meter.attribute
            ))
        }
    }
}

/// Start and end of the fetch window for `mode`.
pub fn fetch_window(
    settings: &HistorianSettings,
    mode: FetchMode,
    now: DateTime<Utc>,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = now - settings.lookback;
    let end = match mode {
        FetchMode::Observed => now,
        FetchMode::Forecast => now + settings.lookahead,
    };
    (start, end)
}

/// Historian time parameter, minute resolution, explicit UTC offset.
pub fn format_time(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%dT%H:%M:00-00:00").to_string()
}

// ============================================================================
// Response parsing
// ============================================================================

/// Extracts the interpolated-data link from an attribute lookup body.
pub fn parse_attribute_response(body: &str, path: &str) -> Result<String, HistorianError> {
    let response: AttributeResponse =
        serde_json::from_str(body).map_err(|e| HistorianError::ParseError(e.to_string()))?;
    response
        .links
        .interpolated_data
        .ok_or_else(|| HistorianError::MissingLink(path.to_string()))
}

/// Parses an `Items` envelope into points in the civil timezone, sorted by
/// timestamp. Non-numeric values and items flagged not-good become `None`.
pub fn parse_items(body: &str, tz: Tz) -> Result<Vec<TimeSeriesPoint>, HistorianError> {
    let response: ItemsResponse =
        serde_json::from_str(body).map_err(|e| HistorianError::ParseError(e.to_string()))?;

    let mut points = Vec::with_capacity(response.items.len());
    for item in response.items {
        let timestamp = DateTime::parse_from_rfc3339(&item.timestamp)
            .map_err(|e| HistorianError::ParseError(format!("{}: {}", item.timestamp, e)))?
            .with_timezone(&tz);
        let value = if item.good { item.value.as_f64() } else { None };
        points.push(TimeSeriesPoint::new(timestamp, value));
    }
    points.sort_by_key(|p| p.timestamp);
    Ok(points)
}

// ============================================================================
// API Client
// ============================================================================

pub struct HistorianClient {
    client: reqwest::blocking::Client,
    settings: HistorianSettings,
}

impl HistorianClient {
    pub fn new(settings: HistorianSettings) -> Result<Self, HistorianError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(settings.timeout)
            .build()?;
        Ok(Self { client, settings })
    }

    pub fn settings(&self) -> &HistorianSettings {
        &self.settings
    }

    /// Resolves the interpolated-data endpoint for a meter.
    pub fn resolve_endpoint(&self, meter: &MeterSeries) -> Result<String, HistorianError> {
        let path = build_attribute_path(&self.settings.server, meter)?;
        let response = self
            .client
            .get(format!("{}/attributes", self.settings.base_url))
            .query(&[("path", path.as_str())])
            .header("Accept", "application/json")
            .send()?;

        if !response.status().is_success() {
            return Err(HistorianError::HttpError(response.status().as_u16()));
        }
        parse_attribute_response(&response.text()?, &path)
    }

    /// Fetches interpolated values for a meter. Single attempt, no retry.
    pub fn fetch_interpolated(
        &self,
        meter: &MeterSeries,
        mode: FetchMode,
        now: DateTime<Utc>,
    ) -> Result<Vec<TimeSeriesPoint>, HistorianError> {
        let endpoint = self.resolve_endpoint(meter)?;
        let (start, end) = fetch_window(&self.settings, mode, now);

        let response = self
            .client
            .get(&endpoint)
            .query(&[
                ("startTime", format_time(start)),
                ("endTime", format_time(end)),
                ("interval", self.settings.interval.clone()),
            ])
            .header("Accept", "application/json")
            .send()?;

        if !response.status().is_success() {
            return Err(HistorianError::HttpError(response.status().as_u16()));
        }
        parse_items(&response.text()?, self.settings.tz)
    }
}

impl TelemetrySource for HistorianClient {
    fn fetch(&self, meter: &MeterSeries, mode: FetchMode, now: DateTime<Utc>) -> Vec<TimeSeriesPoint> {
        match self.fetch_interpolated(meter, mode, now) {
            Ok(points) => points,
            Err(e) => {
                log_historian_failure(&meter.column_key(), "interpolated fetch", &e);
                Vec::new()
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meters::{AFTERBAY_SETPOINT, GEN_MDFK_AND_RA, OXBOW_FORECAST, R4_FLOW};
    use chrono::TimeZone;
    use mockito::Matcher;

    fn settings(base_url: &str) -> HistorianSettings {
        HistorianSettings::from_config(
            &HistorianConfig {
                base_url: base_url.to_string(),
                ..HistorianConfig::default()
            },
            chrono_tz::US::Pacific,
        )
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 13, 7, 42).unwrap()
    }

    #[test]
    fn test_ops_path_uses_element_folder() {
        let path = build_attribute_path("BUSINESSPI2", &R4_FLOW).unwrap();
        assert_eq!(path, r"\\BUSINESSPI2\OPS\Gauging Stations\R4|Flow");

        let path = build_attribute_path("BUSINESSPI2", &AFTERBAY_SETPOINT).unwrap();
        assert_eq!(path, r"\\BUSINESSPI2\OPS\Reservoirs\Afterbay|Elevation Setpoint");
    }

    #[test]
    fn test_energy_marketing_path_uses_misc_tags() {
        let path = build_attribute_path("BUSINESSPI2", &GEN_MDFK_AND_RA).unwrap();
        assert_eq!(path, r"\\BUSINESSPI2\Energy_Marketing\Misc Tags|GEN_MDFK_and_RA");
    }

    #[test]
    fn test_unresolvable_ops_meter_is_an_error() {
        let meter = MeterSeries::new(SourceDatabase::Ops, Some("Ralston"), "Gate 1 Position");
        let err = build_attribute_path("S", &meter).unwrap_err();
        assert!(matches!(err, HistorianError::UnresolvedElement(_)));
    }

    #[test]
    fn test_forecast_mode_extends_window_forward() {
        let s = settings("http://unused");
        let (start, end) = fetch_window(&s, FetchMode::Observed, fixed_now());
        assert_eq!(end - start, chrono::Duration::hours(24));
        assert_eq!(end, fixed_now());

        let (start, end) = fetch_window(&s, FetchMode::Forecast, fixed_now());
        assert_eq!(start, fixed_now() - chrono::Duration::hours(24));
        assert_eq!(end, fixed_now() + chrono::Duration::hours(72));
    }

    #[test]
    fn test_format_time_truncates_seconds() {
        assert_eq!(format_time(fixed_now()), "2024-05-01T13:07:00-00:00");
    }

    #[test]
    fn test_parse_items_handles_sentinels_and_order() {
        let body = r#"{"Items": [
            {"Timestamp": "2024-05-01T13:00:00Z", "Value": 512.5, "Good": true},
            {"Timestamp": "2024-05-01T12:00:00Z", "Value": 498.0, "Good": true},
            {"Timestamp": "2024-05-01T14:00:00Z",
             "Value": {"Name": "No Data", "Value": 248, "IsSystem": true}, "Good": false},
            {"Timestamp": "2024-05-01T15:00:00Z", "Value": 7.0, "Good": false}
        ]}"#;
        let points = parse_items(body, chrono_tz::US::Pacific).unwrap();
        assert_eq!(points.len(), 4);
        assert_eq!(points[0].value, Some(498.0));
        assert_eq!(points[1].value, Some(512.5));
        assert_eq!(points[2].value, None);
        assert_eq!(points[3].value, None, "questionable value should be dropped");
        // 12:00Z is 05:00 PDT
        assert_eq!(points[0].timestamp.format("%H:%M").to_string(), "05:00");
        assert!(points.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn test_parse_items_rejects_bad_envelope() {
        assert!(matches!(
            parse_items(r#"{"Links": {}}"#, chrono_tz::US::Pacific),
            Err(HistorianError::ParseError(_))
        ));
    }

    #[test]
    fn test_parse_attribute_response_missing_link() {
        let err = parse_attribute_response(r#"{"Links": {"Self": "x"}}"#, "p").unwrap_err();
        assert!(matches!(err, HistorianError::MissingLink(_)));
    }

    #[test]
    fn test_fetch_against_mock_historian() {
        let mut server = mockito::Server::new();
        let data_url = format!("{}/streams/A1/interpolated", server.url());

        let lookup = server
            .mock("GET", "/attributes")
            .match_query(Matcher::UrlEncoded(
                "path".into(),
                r"\\BUSINESSPI2\OPS\Generation Units\Oxbow|Forecasted Generation".into(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(format!(r#"{{"Links": {{"InterpolatedData": "{}"}}}}"#, data_url))
            .create();
        let data = server
            .mock("GET", "/streams/A1/interpolated")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("startTime".into(), "2024-04-30T13:07:00-00:00".into()),
                Matcher::UrlEncoded("endTime".into(), "2024-05-04T13:07:00-00:00".into()),
                Matcher::UrlEncoded("interval".into(), "1m".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"Items": [{"Timestamp": "2024-05-01T14:00:00Z", "Value": 4.2}]}"#)
            .create();

        let client = HistorianClient::new(settings(&server.url())).unwrap();
        let points = client.fetch(&OXBOW_FORECAST, FetchMode::Forecast, fixed_now());

        lookup.assert();
        data.assert();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].value, Some(4.2));
    }

    #[test]
    fn test_http_failure_becomes_empty_series() {
        let mut server = mockito::Server::new();
        let _lookup = server
            .mock("GET", "/attributes")
            .match_query(Matcher::Any)
            .with_status(500)
            .create();

        let client = HistorianClient::new(settings(&server.url())).unwrap();
        assert!(matches!(
            client.fetch_interpolated(&R4_FLOW, FetchMode::Observed, fixed_now()),
            Err(HistorianError::HttpError(500))
        ));
        assert!(client.fetch(&R4_FLOW, FetchMode::Observed, fixed_now()).is_empty());
    }
}
