/// Data acquisition from the plant historian and the river forecast center.
///
/// Submodules:
/// - `historian`: interpolated telemetry for a single meter.
/// - `cnrfc`: natural-flow forecast exports.
///
/// The traits below are the seams the polling tick is written against, so
/// the pipeline can be driven by recorded data in tests.

pub mod cnrfc;
pub mod historian;

use chrono::{DateTime, Utc};

use crate::forecast::frame::ForecastFrame;
use crate::model::{MeterSeries, TimeSeriesPoint};

/// Fetch window selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// `[now - lookback, now]`
    Observed,
    /// `[now - lookback, now + lookahead]`, for forecast tags.
    Forecast,
}

/// Something that can return one meter's time series.
///
/// Implementations never fail past this boundary: a failed fetch is logged
/// and reported as an empty series.
pub trait TelemetrySource {
    fn fetch(&self, meter: &MeterSeries, mode: FetchMode, now: DateTime<Utc>) -> Vec<TimeSeriesPoint>;
}

/// Something that can produce the hourly natural-flow forecast grid.
///
/// A supplied `cached` frame is returned as-is without touching the network.
pub trait ForecastSource {
    fn forecast(&self, cached: Option<ForecastFrame>, now: DateTime<Utc>) -> ForecastFrame;
}
