/// Safe-dispatch bounds (Pmin / Pmax) for the upstream plants.
///
/// Both bounds come from two linear constraints on the Middle Fork flow
/// below Interbay (R4) and the Hell Hole valve release (R5). Where one term
/// cannot be evaluated the other alone decides; where neither can, the
/// bound is `None`.

use crate::analysis::unify::UnifiedFrame;
use crate::logging::DataSource;
use crate::meters::{HELL_HOLE_ELEVATION, R4_FLOW, R5_FLOW};
use crate::model::ConversionError;

pub const PLANT_CONST_A: f64 = 0.09;
pub const PLANT_CONST_B: f64 = 0.135422;

/// Hell Hole physical elevation range (ft).
pub const HELL_HOLE_MIN_FT: f64 = 2536.0;
pub const HELL_HOLE_MAX_FT: f64 = 4536.0;

/// Flow assumed released at R5 when projecting Pmin forward (cfs).
pub const FORECAST_R5_FLOW: f64 = 26.0;

pub const PMIN_COLUMN: &str = "Pmin";
pub const PMAX_COLUMN: &str = "Pmax";

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DispatchBounds {
    pub pmin: Option<f64>,
    pub pmax: Option<f64>,
}

pub fn normalized_hell_hole(elevation_ft: f64) -> f64 {
    (elevation_ft - HELL_HOLE_MIN_FT) / (HELL_HOLE_MAX_FT - HELL_HOLE_MIN_FT)
}

fn max_present(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

fn min_present(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// `max(a·Δ, −0.14·Δ·norm(HH))` where Δ is the net R4 flow.
pub fn pmin(net_r4: Option<f64>, hell_hole_ft: Option<f64>) -> Option<f64> {
    let first = net_r4.map(|d| PLANT_CONST_A * d);
    let second = net_r4
        .zip(hell_hole_ft)
        .map(|(d, hh)| -0.14 * d * normalized_hell_hole(hh));
    max_present(first, second)
}

pub fn pmax(r4: Option<f64>, r5: Option<f64>) -> Option<f64> {
    let (a, b) = (PLANT_CONST_A, PLANT_CONST_B);
    let first = r4.zip(r5).map(|(r4, r5)| ((a + b) / b) * (124.0 + a * r4 - r5));
    let second = r4.zip(r5).map(|(r4, r5)| ((a + b) / a) * (86.0 - b * r4 - r5));
    min_present(first, second)
}

/// Bounds at each row of the observed frame.
pub fn observed_bounds(frame: &UnifiedFrame) -> Result<Vec<DispatchBounds>, ConversionError> {
    let column = |key: String| {
        frame
            .column(&key)
            .ok_or(ConversionError::MissingColumn(key))
    };
    let r4 = column(R4_FLOW.column_key())?;
    let r5 = column(R5_FLOW.column_key())?;
    let hh = column(HELL_HOLE_ELEVATION.column_key())?;

    Ok(r4
        .iter()
        .zip(r5)
        .zip(hh)
        .map(|((r4, r5), hh)| {
            let net = r4.zip(*r5).map(|(r4, r5)| r4 - r5);
            DispatchBounds { pmin: pmin(net, *hh), pmax: pmax(*r4, *r5) }
        })
        .collect())
}

/// Adds `Pmin`/`Pmax` columns to the observed frame. A conversion failure
/// leaves both columns null instead of failing the tick.
pub fn attach_observed_bounds(frame: &mut UnifiedFrame) {
    let bounds = match observed_bounds(frame) {
        Ok(bounds) => bounds,
        Err(e) => {
            tracing::warn!(source = %DataSource::Model, error = %e, "Unable to calculate Pmin or Pmax");
            vec![DispatchBounds::default(); frame.len()]
        }
    };
    frame.insert_column(PMIN_COLUMN, bounds.iter().map(|b| b.pmin).collect());
    frame.insert_column(PMAX_COLUMN, bounds.iter().map(|b| b.pmax).collect());
}

/// Bounds for a forecast hour: R4 comes from the forecast, Hell Hole
/// elevation and R5 are held at their last observed values.
pub fn forecast_bounds(
    r4_fcst: Option<f64>,
    last_hell_hole_ft: Option<f64>,
    last_r5: Option<f64>,
) -> DispatchBounds {
    DispatchBounds {
        pmin: pmin(r4_fcst.map(|r4| r4 - FORECAST_R5_FLOW), last_hell_hole_ft),
        pmax: pmax(r4_fcst, last_r5),
    }
}
