//! Required release and the suggested Oxbow dispatch.
//!
//! Advisory only: the suggested trajectory is what the Afterbay would do if
//! Oxbow ran just hard enough to pass the larger of its inflow and the
//! license minimum.

use chrono::Timelike;

use crate::config::ForecastConfig;
use crate::forecast::curves::{CFS_TO_AF_PER_HOUR, OXBOW_FLOW, cfs_to_af, storage_to_elevation};
use crate::forecast::frame::ForecastFrame;
use crate::forecast::water_balance::{mean_bias, project_storage};
use crate::model::{ModelError, Timestamp};

/// License minimum release below the Afterbay (cfs).
pub const BASE_RELEASE_CFS: f64 = 150.0;
/// Release during the recreational (rafting) window (cfs).
pub const RECREATION_RELEASE_CFS: f64 = 1000.0;
/// Oxbow ceiling for suggestions (MW).
pub const OXBOW_SUGGESTION_CAP_MW: f64 = 5.8;

/// Storage-to-MW fit for Oxbow used when back-solving a suggestion.
const SUGGESTION_INTERCEPT_AF: f64 = 7.36;
const SUGGESTION_AF_PER_MW: f64 = 13.425;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReleaseSchedule {
    pub recreation: bool,
    pub start_hour: u32,
    pub end_hour: u32,
}

impl ReleaseSchedule {
    pub fn from_config(config: &ForecastConfig) -> Self {
        Self {
            recreation: config.recreation_release,
            start_hour: config.recreation_start_hour,
            end_hour: config.recreation_end_hour,
        }
    }

    /// Required release for the hour at `time` (civil hours, inclusive).
    pub fn required_cfs(&self, time: &Timestamp) -> f64 {
        let hour = time.hour();
        if self.recreation && (self.start_hour..=self.end_hour).contains(&hour) {
            RECREATION_RELEASE_CFS
        } else {
            BASE_RELEASE_CFS
        }
    }
}

impl Default for ReleaseSchedule {
    fn default() -> Self {
        Self::from_config(&ForecastConfig::default())
    }
}

/// Oxbow MW that passes `max(inflow, required)`; a missing inflow falls back
/// to the required release alone.
pub fn suggested_oxbow_mw(inflow_cfs: Option<f64>, required_cfs: f64) -> f64 {
    let target = inflow_cfs.map_or(required_cfs, |inflow| inflow.max(required_cfs));
    ((target * CFS_TO_AF_PER_HOUR - SUGGESTION_INTERCEPT_AF) / SUGGESTION_AF_PER_MW)
        .min(OXBOW_SUGGESTION_CAP_MW)
}

/// Fills the suggested-dispatch columns and returns its mean bias (AF/h).
///
/// Expects `abay_inflow` and `abay_af_change_observed` to be populated by the
/// main forecast pass.
pub fn run_suggested(
    frame: &mut ForecastFrame,
    schedule: &ReleaseSchedule,
    initial_af: f64,
    setpoint_ft: f64,
) -> Result<f64, ModelError> {
    for row in &mut frame.rows {
        let required = schedule.required_cfs(&row.time);
        let mw = suggested_oxbow_mw(row.derived.abay_inflow, required);
        let outflow = OXBOW_FLOW.to_cfs(mw);
        let d = &mut row.derived;
        d.required_release_cfs = Some(required);
        d.oxbow_suggested_mw = Some(mw);
        d.abay_outflow_suggested = Some(outflow);
        d.abay_af_change_suggested = d.abay_inflow.map(|inflow| cfs_to_af(inflow - outflow));
    }

    let changes: Vec<Option<f64>> = frame
        .rows
        .iter()
        .map(|r| r.derived.abay_af_change_suggested)
        .collect();
    let observed: Vec<Option<f64>> = frame
        .rows
        .iter()
        .map(|r| r.derived.abay_af_change_observed)
        .collect();
    let bias = mean_bias(&changes, &observed);
    let storage = project_storage(&changes, initial_af, bias)?;

    for (row, af) in frame.rows.iter_mut().zip(storage) {
        row.derived.abay_af_fcst_suggested = af;
        row.derived.abay_elev_fcst_suggested =
            af.map(|af| storage_to_elevation(af).min(setpoint_ft));
    }
    Ok(bias)
}
