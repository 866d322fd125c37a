//! Afterbay water-balance forecaster.
//!
//! Runs hour by hour over the provider's forecast grid:
//!
//! 1. merge the hourly generation forecast onto the grid and project Pmin/Pmax
//! 2. split total upstream generation between Ralston and Middle Fork
//! 3. overwrite forecast generation with observed values where an hour has
//!    already happened
//! 4. convert MW to cfs for each plant
//! 5. add Interbay spill to the provider's natural flow below Interbay
//! 6. total Afterbay inflow and outflow
//! 7. recursive storage forecast from the observed starting storage,
//!    corrected by the mean retrospective error, then capped at the float
//!    level once converted to elevation
//!
//! The required-release variant (`forecast::release`) runs last on the same
//! grid.

use chrono::Duration;

use crate::analysis::dispatch::forecast_bounds;
use crate::analysis::unify::{UnifiedFrame, resample_hourly};
use crate::config::{ForecastConfig, GenerationForecastSource};
use crate::forecast::curves::{
    MIDDLE_FORK_FLOW, OXBOW_FLOW, RALSTON_FLOW, af_to_cfs, cfs_to_af, elevation_to_storage,
    storage_to_elevation,
};
use crate::forecast::frame::{ForecastDerived, ForecastFrame, ForecastRow, ForecastSummary};
use crate::forecast::release::{ReleaseSchedule, run_suggested};
use crate::logging::DataSource;
use crate::meters::{
    AFTERBAY_ELEVATION, AFTERBAY_SETPOINT, GEN_MDFK_AND_RA, HELL_HOLE_ELEVATION, OXBOW_POWER,
    R5_FLOW,
};
use crate::model::{ModelError, TimeSeriesPoint, Timestamp};

/// Share of total upstream generation assigned to Ralston.
pub const RALSTON_SHARE: f64 = 0.41;
pub const RALSTON_CAP_MW: f64 = 86.0;
pub const MIDDLE_FORK_CAP_MW: f64 = 128.0;
/// Valve release above R5; has not moved in years of historian data.
pub const R5_VALVE_CFS: f64 = 28.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelSettings {
    pub generation_source: GenerationForecastSource,
    pub ccs_mode: bool,
    pub release: ReleaseSchedule,
}

impl ModelSettings {
    pub fn from_config(config: &ForecastConfig) -> Self {
        Self {
            generation_source: config.generation_source,
            ccs_mode: config.ccs_mode,
            release: ReleaseSchedule::from_config(config),
        }
    }
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self::from_config(&ForecastConfig::default())
    }
}

/// Raw generation forecasts as fetched from the historian.
#[derive(Debug, Clone, Copy)]
pub struct GenerationForecast<'a> {
    /// Downstream plant forecast (MW).
    pub oxbow: &'a [TimeSeriesPoint],
    /// Dedicated total upstream forecast, when that source is configured.
    pub mfra: Option<&'a [TimeSeriesPoint]>,
}

/// Ralston / Middle Fork share of a total upstream generation.
pub fn split_generation(total_mw: f64) -> (f64, f64) {
    let ra = (total_mw * RALSTON_SHARE).min(RALSTON_CAP_MW);
    let mf = (total_mw - ra).min(MIDDLE_FORK_CAP_MW);
    (ra, mf)
}

/// Mean of `forecast - observed` over rows where both exist; 0 when the
/// series never overlap.
pub fn mean_bias(forecast: &[Option<f64>], observed: &[Option<f64>]) -> f64 {
    let errors: Vec<f64> = forecast
        .iter()
        .zip(observed)
        .filter_map(|(f, o)| f.zip(*o).map(|(f, o)| f - o))
        .collect();
    if errors.is_empty() {
        0.0
    } else {
        errors.iter().sum::<f64>() / errors.len() as f64
    }
}

/// Storage recursion. The first row with a valid change takes `initial_af`;
/// every later row adds its change minus `bias` to the previous storage. A
/// missing change breaks the chain from that row on.
pub fn project_storage(
    changes: &[Option<f64>],
    initial_af: f64,
    bias: f64,
) -> Result<Vec<Option<f64>>, ModelError> {
    let start = changes
        .iter()
        .position(Option::is_some)
        .ok_or(ModelError::NoValidStart)?;

    let mut storage = vec![None; changes.len()];
    storage[start] = Some(initial_af);
    for i in start + 1..changes.len() {
        storage[i] = storage[i - 1]
            .zip(changes[i])
            .map(|(prev, change)| prev + change - bias);
    }
    Ok(storage)
}

/// Outer-merges hourly values onto the grid, adding rows for hours the
/// grid lacks.
fn merge_onto_grid(
    frame: &mut ForecastFrame,
    points: &[TimeSeriesPoint],
    slot: fn(&mut ForecastDerived) -> &mut Option<f64>,
) {
    let mut added = false;
    for p in points {
        if frame.row_index(&p.timestamp).is_none() {
            frame.rows.push(ForecastRow::empty(p.timestamp));
            added = true;
        }
    }
    if added {
        frame.rows.sort_by_key(|r| r.time);
    }
    for p in points {
        if let Some(i) = frame.row_index(&p.timestamp) {
            *slot(&mut frame.rows[i].derived) = p.value;
        }
    }
}

/// Observed state the forecast starts from, taken from the hourly-resampled
/// telemetry.
struct ObservedState {
    hourly: UnifiedFrame,
    initial_af: f64,
    setpoint_ft: f64,
    last_r5: Option<f64>,
    last_hell_hole_ft: Option<f64>,
}

impl ObservedState {
    fn from_frame(observed: &UnifiedFrame) -> Result<Self, ModelError> {
        let hourly = observed.resample_hourly();
        let elevation_key = AFTERBAY_ELEVATION.column_key();
        let first_hour = hourly
            .index()
            .first()
            .ok_or_else(|| ModelError::MissingObservation(elevation_key.clone()))?;
        let initial_elev = hourly
            .value_at(&elevation_key, first_hour)
            .ok_or_else(|| ModelError::MissingObservation(elevation_key.clone()))?;
        let setpoint_key = AFTERBAY_SETPOINT.column_key();
        let setpoint_ft = observed
            .last_valid(&setpoint_key)
            .ok_or(ModelError::MissingObservation(setpoint_key))?;

        Ok(Self {
            initial_af: elevation_to_storage(initial_elev),
            setpoint_ft,
            last_r5: observed.last_valid(&R5_FLOW.column_key()),
            last_hell_hole_ft: observed.last_valid(&HELL_HOLE_ELEVATION.column_key()),
            hourly,
        })
    }

    fn storage_at(&self, time: &Timestamp) -> Option<f64> {
        self.hourly
            .value_at(&AFTERBAY_ELEVATION.column_key(), time)
            .map(elevation_to_storage)
    }

    /// Storage change over the hour ending at `time`.
    fn storage_change_at(&self, time: &Timestamp) -> Option<f64> {
        let previous = *time - Duration::hours(1);
        self.storage_at(time)
            .zip(self.storage_at(&previous))
            .map(|(now, before)| now - before)
    }
}

/// Runs the full forecast on `frame`, replacing any previously derived
/// columns.
pub fn run(
    frame: &mut ForecastFrame,
    observed: &UnifiedFrame,
    generation: &GenerationForecast<'_>,
    settings: &ModelSettings,
) -> Result<ForecastSummary, ModelError> {
    frame.clear_derived();

    // Step 1: generation forecast onto the grid.
    if !generation.oxbow.iter().any(|p| p.value.is_some()) {
        return Err(ModelError::NoGenerationForecast);
    }
    let mfra_raw = match settings.generation_source {
        GenerationForecastSource::Oxbow => generation.oxbow,
        GenerationForecastSource::MfraTag => generation
            .mfra
            .filter(|pts| pts.iter().any(|p| p.value.is_some()))
            .ok_or(ModelError::NoGenerationForecast)?,
    };
    merge_onto_grid(frame, &resample_hourly(generation.oxbow), |d| &mut d.oxbow_fcst);
    merge_onto_grid(frame, &resample_hourly(mfra_raw), |d| &mut d.mfra_fcst);

    let state = ObservedState::from_frame(observed)?;
    let gen_key = GEN_MDFK_AND_RA.column_key();
    let oxbow_key = OXBOW_POWER.column_key();

    for row in &mut frame.rows {
        let time = row.time;
        let d = &mut row.derived;

        let bounds = forecast_bounds(row.r4_fcst, state.last_hell_hole_ft, state.last_r5);
        d.pmin = bounds.pmin;
        d.pmax = bounds.pmax;

        // Steps 2 and 3: split, with observed generation taking precedence.
        let total = state.hourly.value_at(&gen_key, &time).or(d.mfra_fcst);
        let split = total.map(split_generation);
        d.ra_mw = split.map(|(ra, _)| ra);
        d.mf_mw = split.map(|(_, mf)| mf);
        if let Some(observed_oxbow) = state.hourly.value_at(&oxbow_key, &time) {
            d.oxbow_fcst = Some(observed_oxbow);
        }
        if settings.ccs_mode {
            if let (Some(ra), Some(pmin)) = (d.ra_mw, d.pmin) {
                d.ra_mw = Some(ra.max(pmin * RALSTON_SHARE));
            }
        }

        // Step 4.
        d.ra_inflow = RALSTON_FLOW.to_cfs_opt(d.ra_mw);
        d.mf_inflow = MIDDLE_FORK_FLOW.to_cfs_opt(d.mf_mw);
        d.oxbow_outflow = OXBOW_FLOW.to_cfs_opt(d.oxbow_fcst);

        // Steps 5 and 6.
        d.ibay_spill = d
            .mf_inflow
            .zip(d.ra_inflow)
            .zip(row.r4_fcst)
            .map(|((mf, ra), r4)| (mf - ra).max(0.0) + R5_VALVE_CFS + r4);
        d.r20_fcst_adjusted = row.r20_fcst.zip(d.ibay_spill).map(|(r20, spill)| r20 + spill);
        d.abay_inflow = d
            .ra_inflow
            .zip(d.r20_fcst_adjusted)
            .zip(row.r30_fcst)
            .map(|((ra, r20), r30)| ra + r20 + r30);
        d.abay_outflow = d.oxbow_outflow;
        d.abay_af_change = d
            .abay_inflow
            .zip(d.abay_outflow)
            .map(|(inflow, outflow)| cfs_to_af(inflow - outflow));

        d.abay_af_observed = state.storage_at(&time);
        d.abay_af_change_observed = state.storage_change_at(&time);
        d.abay_af_change_error = d
            .abay_af_change
            .zip(d.abay_af_change_observed)
            .map(|(f, o)| f - o);
    }

    // Step 7.
    let changes: Vec<Option<f64>> = frame.rows.iter().map(|r| r.derived.abay_af_change).collect();
    let observed_changes: Vec<Option<f64>> = frame
        .rows
        .iter()
        .map(|r| r.derived.abay_af_change_observed)
        .collect();
    let bias = mean_bias(&changes, &observed_changes);
    if !observed_changes.iter().any(Option::is_some) {
        tracing::info!(
            source = %DataSource::Model,
            "No observed storage change overlaps the forecast; bias set to zero"
        );
    }
    let storage = project_storage(&changes, state.initial_af, bias)?;
    for (row, af) in frame.rows.iter_mut().zip(storage) {
        row.derived.abay_af_fcst = af;
        row.derived.abay_elev_fcst = af.map(|af| storage_to_elevation(af).min(state.setpoint_ft));
    }

    // Step 8.
    let bias_suggested = run_suggested(frame, &settings.release, state.initial_af, state.setpoint_ft)?;

    let summary = ForecastSummary {
        mean_bias_af: bias,
        mean_bias_cfs: af_to_cfs(bias),
        mean_bias_af_suggested: bias_suggested,
        mean_bias_cfs_suggested: af_to_cfs(bias_suggested),
        setpoint_ft: state.setpoint_ft,
    };
    frame.summary = Some(summary);
    Ok(summary)
}

/// Runs the forecast, degrading to null derived columns on failure.
pub fn run_or_degrade(
    frame: &mut ForecastFrame,
    observed: &UnifiedFrame,
    generation: &GenerationForecast<'_>,
    settings: &ModelSettings,
) -> Option<ForecastSummary> {
    match run(frame, observed, generation, settings) {
        Ok(summary) => {
            tracing::info!(
                source = %DataSource::Model,
                bias_cfs = summary.mean_bias_cfs,
                final_elevation = ?frame.final_elevation(),
                "Forecast computed"
            );
            Some(summary)
        }
        Err(e) => {
            tracing::warn!(source = %DataSource::Model, error = %e, "Forecast unavailable this tick");
            frame.clear_derived();
            None
        }
    }
}

/// Clears derived columns without running the model, for ticks whose
/// telemetry could not be unified.
pub fn degrade(frame: &mut ForecastFrame, reason: &str) {
    tracing::warn!(source = %DataSource::Model, reason = reason, "Forecast skipped");
    frame.clear_derived();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meters::{AFTERBAY_ELEVATION, AFTERBAY_SETPOINT, GEN_MDFK_AND_RA, OXBOW_POWER};
    use chrono::{TimeZone, Utc};
    use chrono_tz::US::Pacific;

    fn hour(h: i64) -> Timestamp {
        Pacific.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap() + Duration::hours(h)
    }

    /// Minute-spaced observations for hours `[0, hours)`, constant per hour.
    fn observed_series(hours: i64, value: impl Fn(i64) -> f64) -> Vec<TimeSeriesPoint> {
        (0..hours)
            .flat_map(|h| {
                let v = value(h);
                (0..60).step_by(15).map(move |m| {
                    TimeSeriesPoint::new(hour(h) + Duration::minutes(m), Some(v))
                })
            })
            .collect()
    }

    fn grid(hours: i64, r4: f64, r20: f64, r30: f64) -> ForecastFrame {
        let mut frame = ForecastFrame {
            issued: Some(hour(0)),
            fetched_at: hour(0).with_timezone(&Utc),
            rows: Vec::new(),
            summary: None,
        };
        for h in 0..=hours {
            let mut row = ForecastRow::empty(hour(h));
            row.r4_fcst = Some(r4);
            row.r20_fcst = Some(r20);
            row.r30_fcst = Some(r30);
            frame.rows.push(row);
        }
        frame
    }

    /// A balanced system: upstream plants off, Oxbow at 1 MW passing exactly
    /// the natural inflow.
    fn balanced_case(elevation: impl Fn(i64) -> f64) -> (ForecastFrame, UnifiedFrame, Vec<TimeSeriesPoint>, Vec<TimeSeriesPoint>) {
        let oxbow_cfs = OXBOW_FLOW.to_cfs(1.0);
        let frame = grid(48, 0.0, 0.0, oxbow_cfs - R5_VALVE_CFS);

        let mut observed = UnifiedFrame::new();
        observed.merge(&AFTERBAY_ELEVATION.column_key(), &observed_series(24, elevation));
        observed.merge(&AFTERBAY_SETPOINT.column_key(), &observed_series(24, |_| 1175.0));
        observed.merge(&OXBOW_POWER.column_key(), &observed_series(24, |_| 1.0));
        observed.merge(&GEN_MDFK_AND_RA.column_key(), &observed_series(24, |_| 0.0));

        let oxbow_fcst = observed_series(48, |_| 1.0);
        let mfra_fcst = observed_series(48, |_| 0.0);
        (frame, observed, oxbow_fcst, mfra_fcst)
    }

    fn mfra_settings() -> ModelSettings {
        ModelSettings {
            generation_source: GenerationForecastSource::MfraTag,
            ..ModelSettings::default()
        }
    }

    #[test]
    fn test_split_generation_caps() {
        let (ra, mf) = split_generation(100.0);
        assert!((ra - 41.0).abs() < 1e-9);
        assert!((mf - 59.0).abs() < 1e-9);

        let (ra, mf) = split_generation(400.0);
        assert_eq!(ra, RALSTON_CAP_MW);
        assert_eq!(mf, MIDDLE_FORK_CAP_MW);
        assert_eq!(split_generation(0.0), (0.0, 0.0));
    }

    #[test]
    fn test_mean_bias_ignores_unpaired_rows() {
        let f = [Some(2.0), Some(4.0), None, Some(9.0)];
        let o = [Some(1.0), Some(1.0), Some(5.0), None];
        assert!((mean_bias(&f, &o) - 2.0).abs() < 1e-9);
        assert_eq!(mean_bias(&[None], &[Some(1.0)]), 0.0);
    }

    #[test]
    fn test_project_storage_starts_at_first_valid_change() {
        let changes = [None, None, Some(5.0), Some(1.0), Some(2.0)];
        let storage = project_storage(&changes, 100.0, 0.5).unwrap();
        assert_eq!(storage, vec![None, None, Some(100.0), Some(100.5), Some(102.0)]);
    }

    #[test]
    fn test_project_storage_propagates_gaps() {
        let storage = project_storage(&[Some(0.0), None, Some(1.0)], 10.0, 0.0).unwrap();
        assert_eq!(storage, vec![Some(10.0), None, None]);
        assert_eq!(project_storage(&[None, None], 1.0, 0.0), Err(ModelError::NoValidStart));
    }

    #[test]
    fn test_flat_elevation_without_net_flow() {
        let (mut frame, observed, oxbow, mfra) = balanced_case(|_| 1170.0);
        let generation = GenerationForecast { oxbow: &oxbow, mfra: Some(&mfra) };
        let summary = run(&mut frame, &observed, &generation, &mfra_settings()).unwrap();

        assert!(summary.mean_bias_af.abs() < 1e-6);
        let elevations: Vec<f64> = frame.rows.iter().filter_map(|r| r.derived.abay_elev_fcst).collect();
        assert!(elevations.len() >= 40);
        for e in elevations {
            assert!((e - 1170.0).abs() < 0.01, "elevation drifted to {}", e);
        }
    }

    #[test]
    fn test_bias_round_trip_reproduces_observed() {
        // Rising 0.1 ft/h while the model sees a balanced system: bias must
        // absorb the difference and the trajectory track observations.
        let (mut frame, observed, oxbow, mfra) = balanced_case(|h| 1168.0 + 0.1 * h as f64);
        let generation = GenerationForecast { oxbow: &oxbow, mfra: Some(&mfra) };
        run(&mut frame, &observed, &generation, &mfra_settings()).unwrap();

        for row in &frame.rows {
            if let (Some(obs), Some(fcst)) = (row.derived.abay_af_observed, row.derived.abay_af_fcst) {
                assert!((obs - fcst).abs() < 1.5, "{} vs {} at {}", obs, fcst, row.time);
            }
        }
    }

    #[test]
    fn test_exact_match_gives_zero_bias() {
        let (mut frame, observed, oxbow, mfra) = balanced_case(|_| 1171.0);
        let generation = GenerationForecast { oxbow: &oxbow, mfra: Some(&mfra) };
        let summary = run(&mut frame, &observed, &generation, &mfra_settings()).unwrap();
        assert!(summary.mean_bias_af.abs() < 1e-6);
        assert!(summary.mean_bias_cfs.abs() < 1e-4);
        for row in &frame.rows {
            if let (Some(obs), Some(fcst)) = (row.derived.abay_af_observed, row.derived.abay_af_fcst) {
                assert!((obs - fcst).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_elevation_capped_at_setpoint() {
        // Heavy natural inflow once past the observed window.
        let (mut frame, observed, oxbow, mfra) = balanced_case(|_| 1174.0);
        for row in frame.rows.iter_mut().filter(|r| r.time >= hour(25)) {
            row.r30_fcst = Some(2000.0);
        }
        let generation = GenerationForecast { oxbow: &oxbow, mfra: Some(&mfra) };
        run(&mut frame, &observed, &generation, &mfra_settings()).unwrap();

        let last = frame.final_elevation().unwrap();
        assert_eq!(last, 1175.0);
        assert!(frame.rows.iter().filter_map(|r| r.derived.abay_elev_fcst).all(|e| e <= 1175.0));
    }

    #[test]
    fn test_zero_generation_forces_zero_flow() {
        let (mut frame, observed, _, mfra) = balanced_case(|_| 1170.0);
        let oxbow = observed_series(48, |_| 0.0);
        let mut observed = observed;
        observed.merge(&OXBOW_POWER.column_key(), &observed_series(24, |_| 0.0));
        let generation = GenerationForecast { oxbow: &oxbow, mfra: Some(&mfra) };
        run(&mut frame, &observed, &generation, &mfra_settings()).unwrap();

        for row in &frame.rows {
            let d = &row.derived;
            if d.ra_mw == Some(0.0) {
                assert_eq!(d.ra_inflow, Some(0.0));
            }
            if d.mf_mw == Some(0.0) {
                assert_eq!(d.mf_inflow, Some(0.0));
            }
            if d.oxbow_fcst == Some(0.0) {
                assert_eq!(d.oxbow_outflow, Some(0.0));
            }
        }
    }

    #[test]
    fn test_observed_generation_overrides_forecast() {
        let (mut frame, mut observed, oxbow, _) = balanced_case(|_| 1170.0);
        observed.merge(&GEN_MDFK_AND_RA.column_key(), &observed_series(24, |_| 100.0));
        let forecast_total = observed_series(48, |_| 20.0);
        let generation = GenerationForecast { oxbow: &oxbow, mfra: Some(&forecast_total) };
        run(&mut frame, &observed, &generation, &mfra_settings()).unwrap();

        let observed_hour = frame.row_index(&hour(10)).unwrap();
        assert!((frame.rows[observed_hour].derived.ra_mw.unwrap() - 41.0).abs() < 1e-9);
        let future_hour = frame.row_index(&hour(40)).unwrap();
        assert!((frame.rows[future_hour].derived.ra_mw.unwrap() - 20.0 * RALSTON_SHARE).abs() < 1e-9);
    }

    #[test]
    fn test_missing_generation_forecast_degrades() {
        let (mut frame, observed, _, _) = balanced_case(|_| 1170.0);
        frame.rows[0].derived.abay_elev_fcst = Some(1.0);
        let generation = GenerationForecast { oxbow: &[], mfra: None };
        assert_eq!(
            run(&mut frame, &observed, &generation, &ModelSettings::default()),
            Err(ModelError::NoGenerationForecast)
        );
        assert!(run_or_degrade(&mut frame, &observed, &generation, &ModelSettings::default()).is_none());
        assert!(frame.rows.iter().all(|r| r.derived == ForecastDerived::default()));
    }

    #[test]
    fn test_missing_setpoint_is_model_error() {
        let (mut frame, _, oxbow, _) = balanced_case(|_| 1170.0);
        let mut observed = UnifiedFrame::new();
        observed.merge(&AFTERBAY_ELEVATION.column_key(), &observed_series(24, |_| 1170.0));
        let generation = GenerationForecast { oxbow: &oxbow, mfra: None };
        assert!(matches!(
            run(&mut frame, &observed, &generation, &ModelSettings::default()),
            Err(ModelError::MissingObservation(_))
        ));
    }

    #[test]
    fn test_suggested_variant_is_populated() {
        let (mut frame, observed, oxbow, mfra) = balanced_case(|_| 1170.0);
        let generation = GenerationForecast { oxbow: &oxbow, mfra: Some(&mfra) };
        run(&mut frame, &observed, &generation, &mfra_settings()).unwrap();
        let row = &frame.rows[frame.row_index(&hour(30)).unwrap()];
        assert!(row.derived.required_release_cfs.is_some());
        assert!(row.derived.oxbow_suggested_mw.is_some());
        assert!(row.derived.abay_elev_fcst_suggested.unwrap() <= 1175.0);
    }
}
