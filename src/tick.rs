/// One polling cycle
///
/// Fetch the roster, unify it, refresh the natural-flow forecast if the
/// cached issuance is stale, run the water-balance model, evaluate alarms and
/// hand pending notifications to the transport. The only state carried from
/// one tick to the next is the `ForecastCache` passed in and returned.
///
/// Nothing in here aborts the tick: each failing stage degrades its own
/// output and the remaining stages still run.

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use tracing::{info, warn};

use crate::alert::evaluator::{AlarmReport, EvaluatorSettings, evaluate};
use crate::alert::notify::{DispatchReport, Notifier, dispatch_pending};
use crate::alert::store::{AlarmStore, UserDirectory};
use crate::analysis::dispatch::attach_observed_bounds;
use crate::analysis::unify::{UnifiedFrame, unify};
use crate::config::{Config, ConfigError, GenerationForecastSource};
use crate::forecast::frame::{ForecastCache, ForecastFrame, ForecastSummary};
use crate::forecast::water_balance::{self, GenerationForecast, ModelSettings};
use crate::ingest::cnrfc::latest_expected_issuance;
use crate::ingest::{FetchMode, ForecastSource, TelemetrySource};
use crate::logging::{DataSource, log_fetch_summary};
use crate::meters::{MFRA_FORECAST, OXBOW_FORECAST, roster};
use crate::model::{FetchedSeries, civil_time};

#[derive(Debug, Clone)]
pub struct TickSettings {
    pub tz: Tz,
    pub model: ModelSettings,
    pub alarms: EvaluatorSettings,
    /// Minimum age before a stale cached issuance is replaced.
    pub recheck: Duration,
    pub organization: String,
}

impl TickSettings {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            tz: config.civil_tz()?,
            model: ModelSettings::from_config(&config.forecast),
            alarms: EvaluatorSettings::from_config(&config.alarms),
            recheck: Duration::minutes(config.forecast.recheck_minutes),
            organization: config.notify.organization.clone(),
        })
    }
}

/// The collaborators a tick talks to.
pub struct TickContext<'a> {
    pub telemetry: &'a dyn TelemetrySource,
    pub forecast: &'a dyn ForecastSource,
    pub store: &'a mut dyn AlarmStore,
    pub directory: &'a dyn UserDirectory,
    pub notifier: &'a dyn Notifier,
}

#[derive(Debug)]
pub struct TickOutput {
    /// Cache to pass to the next tick.
    pub cache: ForecastCache,
    /// Raw series as fetched, in roster order.
    pub series: Vec<FetchedSeries>,
    /// `None` when unification failed.
    pub unified: Option<UnifiedFrame>,
    /// Provider frame with this tick's derived columns.
    pub forecast: ForecastFrame,
    /// `None` when the model did not run or failed.
    pub summary: Option<ForecastSummary>,
    pub alarms: AlarmReport,
    pub dispatch: DispatchReport,
}

/// Serializable digest of a tick, printed by `--once`.
#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    pub issued: Option<String>,
    pub synthesized_forecast: bool,
    pub meters_with_data: usize,
    pub meters_total: usize,
    pub unified_rows: usize,
    pub final_elevation_ft: Option<f64>,
    pub summary: Option<ForecastSummary>,
    pub alarms: AlarmReport,
    pub dispatch: DispatchReport,
}

impl TickOutput {
    pub fn report(&self) -> TickReport {
        TickReport {
            issued: self.forecast.issued.as_ref().map(civil_time::to_string),
            synthesized_forecast: self.forecast.is_synthesized(),
            meters_with_data: self.series.iter().filter(|s| !s.is_empty()).count(),
            meters_total: self.series.len(),
            unified_rows: self.unified.as_ref().map_or(0, UnifiedFrame::len),
            final_elevation_ft: self.forecast.final_elevation(),
            summary: self.summary,
            alarms: self.alarms.clone(),
            dispatch: self.dispatch.clone(),
        }
    }
}

fn fetch_roster(telemetry: &dyn TelemetrySource, now: DateTime<Utc>) -> Vec<FetchedSeries> {
    let series: Vec<FetchedSeries> = roster()
        .into_iter()
        .map(|meter| FetchedSeries {
            points: telemetry.fetch(&meter, FetchMode::Observed, now),
            meter,
        })
        .collect();
    let successful = series.iter().filter(|s| !s.is_empty()).count();
    log_fetch_summary(series.len(), successful);
    series
}

fn unify_observed(series: &[FetchedSeries]) -> Option<UnifiedFrame> {
    match unify(series) {
        Ok(mut frame) => {
            attach_observed_bounds(&mut frame);
            Some(frame)
        }
        Err(e) => {
            warn!(source = %DataSource::Historian, error = %e, "Telemetry unification failed");
            None
        }
    }
}

fn run_model(
    ctx: &TickContext<'_>,
    forecast: &mut ForecastFrame,
    observed: Option<&UnifiedFrame>,
    settings: &TickSettings,
    now: DateTime<Utc>,
) -> Option<ForecastSummary> {
    let Some(observed) = observed else {
        water_balance::degrade(forecast, "telemetry unavailable");
        return None;
    };

    let oxbow = ctx.telemetry.fetch(&OXBOW_FORECAST, FetchMode::Forecast, now);
    let mfra = match settings.model.generation_source {
        GenerationForecastSource::MfraTag => {
            Some(ctx.telemetry.fetch(&MFRA_FORECAST, FetchMode::Forecast, now))
        }
        GenerationForecastSource::Oxbow => None,
    };
    let generation = GenerationForecast { oxbow: &oxbow, mfra: mfra.as_deref() };
    water_balance::run_or_degrade(forecast, observed, &generation, &settings.model)
}

fn run_alarms(
    ctx: &mut TickContext<'_>,
    series: &[FetchedSeries],
    settings: &TickSettings,
    now: DateTime<Utc>,
) -> (AlarmReport, DispatchReport) {
    // Evaluating against an empty list would clear every active alarm.
    let alarms = match ctx.directory.thresholds() {
        Ok(thresholds) => evaluate(&mut *ctx.store, &thresholds, series, settings.alarms, now),
        Err(e) => {
            warn!(source = %DataSource::Alarm, error = %e, "Could not read thresholds; alarm state unchanged");
            AlarmReport { store_errors: 1, ..Default::default() }
        }
    };

    let dispatch = match dispatch_pending(&mut *ctx.store, ctx.directory, ctx.notifier, &settings.organization) {
        Ok(report) => report,
        Err(e) => {
            warn!(source = %DataSource::Notify, error = %e, "Could not read pending alarms");
            DispatchReport::default()
        }
    };
    (alarms, dispatch)
}

/// Runs one polling cycle.
pub fn run_tick(
    mut ctx: TickContext<'_>,
    mut cache: ForecastCache,
    settings: &TickSettings,
    now: DateTime<Utc>,
) -> TickOutput {
    let series = fetch_roster(ctx.telemetry, now);
    let unified = unify_observed(&series);

    let latest = latest_expected_issuance(now, settings.tz);
    let cached = cache.take_fresh(now, latest, settings.recheck);
    if cached.is_none() {
        info!(source = %DataSource::Cnrfc, expected = %latest, "No usable cached forecast; fetching");
    }
    let mut forecast = ctx.forecast.forecast(cached, now);

    let summary = run_model(&ctx, &mut forecast, unified.as_ref(), settings, now);
    let (alarms, dispatch) = run_alarms(&mut ctx, &series, settings, now);

    info!(
        source = %DataSource::System,
        forecast_ok = summary.is_some(),
        alarms_created = alarms.created.len(),
        alarms_cleared = alarms.cleared.len(),
        notifications_sent = dispatch.sent.len(),
        "Tick complete"
    );

    TickOutput {
        cache: ForecastCache::with_frame(forecast.clone()),
        series,
        unified,
        forecast,
        summary,
        alarms,
        dispatch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_from_default_config() {
        let config = Config::from_toml("").unwrap();
        let settings = TickSettings::from_config(&config).unwrap();
        assert_eq!(settings.recheck, Duration::minutes(config.forecast.recheck_minutes));
        assert_eq!(settings.alarms.window, Duration::minutes(60));
        assert_eq!(settings.organization, config.notify.organization);
    }
}
