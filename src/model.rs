/// Core data types for the Afterbay forecast & alert service.
///
/// This module defines the shared domain model imported by all other modules:
/// time-series points, meter identities, per-user alarm thresholds, issued
/// alarm records and the error taxonomy of the fetch/model pipeline.
/// It contains no I/O.

use chrono::DateTime;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// An instant carried in the plant's civil timezone. Every series is
/// normalized to this before merging.
pub type Timestamp = DateTime<Tz>;

/// Civil timezone used when none is configured.
pub const DEFAULT_CIVIL_TZ: Tz = chrono_tz::US::Pacific;

/// Serde representation of a `Timestamp` that keeps its zone:
/// `2024-05-01T05:00:00-07:00[US/Pacific]`.
pub mod civil_time {
    use super::Timestamp;
    use chrono::DateTime;
    use chrono_tz::Tz;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn to_string(t: &Timestamp) -> String {
        format!("{}[{}]", t.to_rfc3339(), t.timezone().name())
    }

    pub fn from_str(s: &str) -> Result<Timestamp, String> {
        let (instant, zone) = s
            .strip_suffix(']')
            .and_then(|rest| rest.split_once('['))
            .ok_or_else(|| format!("missing zone suffix in '{}'", s))?;
        let tz: Tz = zone.parse().map_err(|e| format!("{}", e))?;
        let parsed = DateTime::parse_from_rfc3339(instant).map_err(|e| e.to_string())?;
        Ok(parsed.with_timezone(&tz))
    }

    pub fn serialize<S: Serializer>(t: &Timestamp, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&to_string(t))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Timestamp, D::Error> {
        let s = String::deserialize(d)?;
        from_str(&s).map_err(D::Error::custom)
    }

    pub mod option {
        use super::Timestamp;
        use serde::{Deserialize, Deserializer, Serializer, de::Error};

        pub fn serialize<S: Serializer>(t: &Option<Timestamp>, s: S) -> Result<S::Ok, S::Error> {
            match t {
                Some(t) => s.serialize_some(&super::to_string(t)),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Timestamp>, D::Error> {
            Option::<String>::deserialize(d)?
                .map(|s| super::from_str(&s).map_err(D::Error::custom))
                .transpose()
        }
    }
}

// ---------------------------------------------------------------------------
// Reading types
// ---------------------------------------------------------------------------

/// A single value from the historian or the forecast provider.
///
/// `value` is `None` when the source reported a sentinel (bad quality,
/// "No Data" digital state) rather than a number.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesPoint {
    #[serde(with = "civil_time")]
    pub timestamp: Timestamp,
    pub value: Option<f64>,
}

impl TimeSeriesPoint {
    pub fn new(timestamp: Timestamp, value: Option<f64>) -> Self {
        Self { timestamp, value }
    }
}

/// Historian asset database a meter lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceDatabase {
    /// Operations database: stations, reservoirs and generation units.
    Ops,
    /// Energy marketing database: schedules and aggregate tags that have no
    /// station element.
    EnergyMarketing,
}

impl SourceDatabase {
    /// Name of the database as it appears in a historian attribute path.
    pub fn path_name(&self) -> &'static str {
        match self {
            SourceDatabase::Ops => "OPS",
            SourceDatabase::EnergyMarketing => "Energy_Marketing",
        }
    }
}

/// Identifies one physical quantity in the historian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MeterSeries {
    pub database: SourceDatabase,
    /// `None` for aggregate/meta attributes stored outside any element.
    pub station: Option<&'static str>,
    pub attribute: &'static str,
}

impl MeterSeries {
    pub const fn new(
        database: SourceDatabase,
        station: Option<&'static str>,
        attribute: &'static str,
    ) -> Self {
        Self { database, station, attribute }
    }

    /// Canonical column key: `station_attribute` with whitespace replaced by
    /// underscores, or just the attribute when there is no station.
    ///
    /// `("Hell Hole", "Elevation")` → `"Hell_Hole_Elevation"`.
    pub fn column_key(&self) -> String {
        let raw = match self.station {
            Some(station) => format!("{} {}", station.trim(), self.attribute.trim()),
            None => self.attribute.trim().to_string(),
        };
        raw.split_whitespace().collect::<Vec<_>>().join("_")
    }
}

/// One meter together with the points fetched for it during a single tick.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedSeries {
    pub meter: MeterSeries,
    pub points: Vec<TimeSeriesPoint>,
}

impl FetchedSeries {
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Threshold / alarm types
// ---------------------------------------------------------------------------

/// Per-user alarm configuration. Owned by the user-preferences collaborator;
/// read-only here. Any bound left `None` is simply not monitored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertThreshold {
    pub owner: i64,
    #[serde(default)]
    pub afterbay_hi: Option<f64>,
    #[serde(default)]
    pub afterbay_lo: Option<f64>,
    #[serde(default)]
    pub oxbow_deviation: Option<f64>,
    #[serde(default)]
    pub r4_hi: Option<i64>,
    #[serde(default)]
    pub r4_lo: Option<i64>,
    #[serde(default)]
    pub r30_hi: Option<i64>,
    #[serde(default)]
    pub r30_lo: Option<i64>,
    #[serde(default)]
    pub r11_hi: Option<i64>,
    #[serde(default)]
    pub r11_lo: Option<i64>,
}

/// Where a user's notifications go.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub owner: i64,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// A persisted alarm record.
///
/// At most one row may exist per (owner, trigger, setpoint) with
/// `still_active == true`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssuedAlarm {
    pub id: i64,
    pub owner: i64,
    /// e.g. `"r4_hi"`, `"afterbay_lo"`, `"afterbay_float"`.
    pub trigger: String,
    pub setpoint: f64,
    pub trigger_value: f64,
    pub trigger_time: chrono::DateTime<chrono::Utc>,
    pub sent: bool,
    pub still_active: bool,
    pub seen_on_website: bool,
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors from the historian (telemetry) interface.
#[derive(Debug, Error)]
pub enum HistorianError {
    /// Non-2xx HTTP response.
    #[error("HTTP error: {0}")]
    HttpError(u16),
    /// Transport-level failure (connect, timeout, TLS).
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// The response body could not be deserialized.
    #[error("Parse error: {0}")]
    ParseError(String),
    /// No element category could be resolved for an operations meter.
    #[error("Unresolvable element type for meter: {0}")]
    UnresolvedElement(String),
    /// The attribute lookup did not return an interpolated-data link.
    #[error("No InterpolatedData link for path: {0}")]
    MissingLink(String),
}

/// Errors from the natural-flow forecast provider.
#[derive(Debug, Error)]
pub enum ForecastFetchError {
    #[error("HTTP error: {0}")]
    HttpError(u16),
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Archive error: {0}")]
    Archive(String),
    #[error("Parse error: {0}")]
    ParseError(String),
}

/// Telemetry unification failures. Any of these aborts the tick's model run.
#[derive(Debug, Error, PartialEq)]
pub enum UnifyError {
    /// A required series came back empty.
    #[error("No data available for meter: {0}")]
    EmptySeries(String),
    /// The roster was empty.
    #[error("No meters to unify")]
    NoMeters,
}

/// A derived quantity could not be computed from the available columns.
#[derive(Debug, Error, PartialEq)]
pub enum ConversionError {
    #[error("Missing column: {0}")]
    MissingColumn(String),
    #[error("No valid value in column: {0}")]
    NoValue(String),
}

/// Failures inside the water-balance forecaster.
#[derive(Debug, Error, PartialEq)]
pub enum ModelError {
    #[error("Missing observed input: {0}")]
    MissingObservation(String),
    #[error("Generation forecast unavailable")]
    NoGenerationForecast,
    #[error("Storage change never becomes valid on the forecast grid")]
    NoValidStart,
    #[error(transparent)]
    Conversion(#[from] ConversionError),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
