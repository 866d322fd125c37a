//! Hourly forecast grid and the cache that carries it between ticks.

use chrono::{DateTime, Duration, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::model::{Timestamp, civil_time};

/// Natural-flow forecasts (cfs) from the provider for one hour, plus every
/// column the water-balance model derives for that hour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastRow {
    /// Hour-ending timestamp in the civil timezone.
    #[serde(with = "civil_time")]
    pub time: Timestamp,
    /// Middle Fork below the Interbay confluence (provider's natural flow).
    pub r20_fcst: Option<f64>,
    pub r30_fcst: Option<f64>,
    pub r4_fcst: Option<f64>,
    pub r11_fcst: Option<f64>,
    #[serde(default)]
    pub derived: ForecastDerived,
}

impl ForecastRow {
    pub fn empty(time: Timestamp) -> Self {
        Self {
            time,
            r20_fcst: None,
            r30_fcst: None,
            r4_fcst: None,
            r11_fcst: None,
            derived: ForecastDerived::default(),
        }
    }
}

/// Model outputs for one forecast hour. All `None` until the forecaster has
/// run, and reset to `None` when it fails.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForecastDerived {
    /// Downstream plant generation (MW), observed where available.
    pub oxbow_fcst: Option<f64>,
    /// Total upstream generation forecast (MW).
    pub mfra_fcst: Option<f64>,
    pub pmin: Option<f64>,
    pub pmax: Option<f64>,
    pub ra_mw: Option<f64>,
    pub mf_mw: Option<f64>,
    pub ra_inflow: Option<f64>,
    pub mf_inflow: Option<f64>,
    pub oxbow_outflow: Option<f64>,
    pub ibay_spill: Option<f64>,
    pub r20_fcst_adjusted: Option<f64>,
    pub abay_inflow: Option<f64>,
    pub abay_outflow: Option<f64>,
    pub abay_af_change: Option<f64>,
    pub abay_af_observed: Option<f64>,
    pub abay_af_change_observed: Option<f64>,
    pub abay_af_change_error: Option<f64>,
    pub abay_af_fcst: Option<f64>,
    pub abay_elev_fcst: Option<f64>,
    pub required_release_cfs: Option<f64>,
    pub oxbow_suggested_mw: Option<f64>,
    pub abay_outflow_suggested: Option<f64>,
    pub abay_af_change_suggested: Option<f64>,
    pub abay_af_fcst_suggested: Option<f64>,
    pub abay_elev_fcst_suggested: Option<f64>,
}

/// Retrospective error terms of one model run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ForecastSummary {
    /// Mean (forecast - observed) storage change over the lookback, AF/h.
    pub mean_bias_af: f64,
    pub mean_bias_cfs: f64,
    pub mean_bias_af_suggested: f64,
    pub mean_bias_cfs_suggested: f64,
    /// Float level used as the elevation ceiling.
    pub setpoint_ft: f64,
}

/// The provider's hourly grid for one issuance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastFrame {
    /// Issuance time, `None` for a synthesized empty frame.
    #[serde(with = "civil_time::option")]
    pub issued: Option<Timestamp>,
    pub fetched_at: DateTime<Utc>,
    pub rows: Vec<ForecastRow>,
    #[serde(default)]
    pub summary: Option<ForecastSummary>,
}

impl ForecastFrame {
    /// An hourly grid with every forecast column null, spanning
    /// `[now - 48h, now + 72h]` floored to the hour.
    pub fn synthesized(now: DateTime<Utc>, tz: Tz) -> Self {
        let start = floor_hour(now - Duration::hours(48));
        let end = floor_hour(now + Duration::hours(72));
        let rows = hourly_range(start, end)
            .map(|t| ForecastRow::empty(t.with_timezone(&tz)))
            .collect();
        Self { issued: None, fetched_at: now, rows, summary: None }
    }

    pub fn is_synthesized(&self) -> bool {
        self.issued.is_none()
    }

    /// Drops every model-derived column, keeping the provider data.
    pub fn clear_derived(&mut self) {
        for row in &mut self.rows {
            row.derived = ForecastDerived::default();
        }
        self.summary = None;
    }

    pub fn row_index(&self, time: &Timestamp) -> Option<usize> {
        self.rows.binary_search_by(|r| r.time.cmp(time)).ok()
    }

    /// Last forecast elevation, for display.
    pub fn final_elevation(&self) -> Option<f64> {
        self.rows.iter().rev().find_map(|r| r.derived.abay_elev_fcst)
    }
}

/// Explicit between-tick state: the last provider frame, if any.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForecastCache {
    pub frame: Option<ForecastFrame>,
}

impl ForecastCache {
    pub fn empty() -> Self {
        Self { frame: None }
    }

    pub fn with_frame(mut frame: ForecastFrame) -> Self {
        frame.clear_derived();
        Self { frame: Some(frame) }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Takes the cached frame unless it should be replaced by a newer
    /// issuance.
    ///
    /// A frame is stale when `recheck` has passed since it was fetched and it
    /// is either synthesized or older than `latest_expected` issuance.
    pub fn take_fresh(
        &mut self,
        now: DateTime<Utc>,
        latest_expected: DateTime<Utc>,
        recheck: Duration,
    ) -> Option<ForecastFrame> {
        let frame = self.frame.take()?;
        let due = now - frame.fetched_at >= recheck;
        let outdated = match frame.issued {
            None => true,
            Some(issued) => issued.with_timezone(&Utc) < latest_expected,
        };
        if due && outdated { None } else { Some(frame) }
    }
}

/// Truncates to the top of the hour.
pub fn floor_hour(t: DateTime<Utc>) -> DateTime<Utc> {
    t.with_nanosecond(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_minute(0))
        .unwrap_or(t)
}

/// Inclusive hourly sequence from `start` to `end`.
pub fn hourly_range(start: DateTime<Utc>, end: DateTime<Utc>) -> impl Iterator<Item = DateTime<Utc>> {
    let hours = (end - start).num_hours().max(-1);
    (0..=hours).map(move |h| start + Duration::hours(h))
}
