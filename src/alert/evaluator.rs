//! Alarm state machine.
//!
//! Per (user, trigger key) an alarm is either inactive (no row, or only
//! rows with `still_active == false`) or active (exactly one active row per
//! setpoint). Each tick:
//!
//! - users breaching a check get an active row at their current setpoint
//!   (created unsent if missing);
//! - active rows whose (owner, setpoint) is not in this tick's breaching set
//!   are deactivated, never deleted;
//! - a meter with no usable data leaves every alarm that depends on it
//!   untouched.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::alert::store::{AlarmStore, NewAlarm, StoreError};
use crate::alert::thresholds::{
    AlarmCheck, Breach, BoundKind, FLOAT_CHANGE_TRIGGER, WindowStats, breaching_users,
};
use crate::analysis::outliers::remove_spikes;
use crate::config::AlarmConfig;
use crate::logging::DataSource;
use crate::meters::{ADS_OXBOW, AFTERBAY_SETPOINT, OXBOW_POWER, Quantity};
use crate::model::{AlertThreshold, FetchedSeries, MeterSeries, TimeSeriesPoint};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvaluatorSettings {
    pub window: Duration,
    pub spike_z_threshold: Option<f64>,
    pub float_tolerance_ft: f64,
}

impl EvaluatorSettings {
    pub fn from_config(config: &AlarmConfig) -> Self {
        Self {
            window: Duration::minutes(config.window_minutes),
            spike_z_threshold: config.spike_z_threshold,
            float_tolerance_ft: config.float_change_tolerance_ft,
        }
    }
}

impl Default for EvaluatorSettings {
    fn default() -> Self {
        Self::from_config(&AlarmConfig::default())
    }
}

/// What one evaluation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AlarmReport {
    /// `(owner, trigger)` of rows created this pass.
    pub created: Vec<(i64, String)>,
    /// Ids of rows deactivated this pass.
    pub cleared: Vec<i64>,
    /// Checks skipped for lack of data.
    pub skipped: Vec<String>,
    pub store_errors: usize,
}

pub struct AlarmEvaluator<'a, S: AlarmStore + ?Sized> {
    store: &'a mut S,
    settings: EvaluatorSettings,
    now: DateTime<Utc>,
    report: AlarmReport,
}

impl<'a, S: AlarmStore + ?Sized> AlarmEvaluator<'a, S> {
    pub fn new(store: &'a mut S, settings: EvaluatorSettings, now: DateTime<Utc>) -> Self {
        Self { store, settings, now, report: AlarmReport::default() }
    }

    /// Runs every check against this tick's fetched series.
    pub fn evaluate(mut self, thresholds: &[AlertThreshold], series: &[FetchedSeries]) -> AlarmReport {
        for quantity in Quantity::ALL {
            let meter = quantity.meter();
            let Some(stats) = self.window_stats(series, &meter) else {
                self.skip(&meter.column_key());
                continue;
            };
            for kind in [BoundKind::Hi, BoundKind::Lo] {
                let check = AlarmCheck::Bound(quantity, kind);
                let breaches = breaching_users(&check, thresholds, &stats);
                self.apply(&check.trigger_key(), &breaches);
            }
        }

        match self.deviation_stats(series) {
            Some(stats) => {
                let check = AlarmCheck::OxbowDeviation;
                let breaches = breaching_users(&check, thresholds, &stats);
                self.apply(&check.trigger_key(), &breaches);
            }
            None => self.skip(&AlarmCheck::OxbowDeviation.trigger_key()),
        }

        match self.window_stats(series, &AFTERBAY_SETPOINT) {
            Some(stats) => self.apply_float_change(thresholds, &stats),
            None => self.skip(FLOAT_CHANGE_TRIGGER),
        }

        self.report
    }

    fn skip(&mut self, what: &str) {
        debug!(source = %DataSource::Alarm, check = what, "No data in alarm window, state unchanged");
        self.report.skipped.push(what.to_string());
    }

    fn record_error(&mut self, trigger: &str, e: &StoreError) {
        warn!(source = %DataSource::Alarm, trigger = trigger, error = %e, "Alarm store operation failed");
        self.report.store_errors += 1;
    }

    /// The trailing alarm window of a meter with spikes removed.
    fn window_points(&self, series: &[FetchedSeries], meter: &MeterSeries) -> Vec<TimeSeriesPoint> {
        let cutoff = self.now - self.settings.window;
        let Some(fetched) = series.iter().find(|s| s.meter == *meter) else {
            return Vec::new();
        };
        let window: Vec<TimeSeriesPoint> = fetched
            .points
            .iter()
            .filter(|p| p.timestamp.with_timezone(&Utc) >= cutoff)
            .copied()
            .collect();

        match self.settings.spike_z_threshold {
            Some(z) => {
                let filtered = remove_spikes(&window, z);
                if filtered.dropped > 0 {
                    info!(
                        source = %DataSource::Alarm,
                        meter = %meter.column_key(),
                        dropped = filtered.dropped,
                        "Removed spikes from alarm window"
                    );
                }
                filtered.points
            }
            None => window,
        }
    }

    fn window_stats(&self, series: &[FetchedSeries], meter: &MeterSeries) -> Option<WindowStats> {
        WindowStats::from_points(&self.window_points(series, meter))
    }

    /// Absolute difference between observed and scheduled Oxbow generation
    /// at each timestamp both report.
    fn deviation_stats(&self, series: &[FetchedSeries]) -> Option<WindowStats> {
        let scheduled: BTreeMap<_, f64> = self
            .window_points(series, &ADS_OXBOW)
            .into_iter()
            .filter_map(|p| p.value.map(|v| (p.timestamp, v)))
            .collect();
        let deviations: Vec<f64> = self
            .window_points(series, &OXBOW_POWER)
            .into_iter()
            .filter_map(|p| Some((p.value? - scheduled.get(&p.timestamp)?).abs()))
            .collect();
        WindowStats::from_values(&deviations)
    }

    /// Creates rows for current breaches and clears rows no longer breaching.
    fn apply(&mut self, trigger: &str, breaches: &[Breach]) {
        for breach in breaches {
            let alarm = NewAlarm {
                owner: breach.owner,
                trigger,
                setpoint: breach.setpoint,
                trigger_value: breach.trigger_value,
                trigger_time: self.now,
            };
            match self.store.get_or_create(&alarm) {
                Ok((row, true)) => {
                    info!(
                        source = %DataSource::Alarm,
                        owner = row.owner,
                        trigger = trigger,
                        setpoint = row.setpoint,
                        value = row.trigger_value,
                        "Alarm raised"
                    );
                    self.report.created.push((row.owner, row.trigger));
                }
                Ok((_, false)) => {}
                Err(e) => self.record_error(trigger, &e),
            }
        }

        let still_breaching: HashSet<(i64, u64)> = breaches
            .iter()
            .map(|b| (b.owner, b.setpoint.to_bits()))
            .collect();
        let active = match self.store.active(trigger) {
            Ok(rows) => rows,
            Err(e) => {
                self.record_error(trigger, &e);
                return;
            }
        };
        for row in active {
            if still_breaching.contains(&(row.owner, row.setpoint.to_bits())) {
                continue;
            }
            match self.store.deactivate(row.id) {
                Ok(()) => {
                    info!(
                        source = %DataSource::Alarm,
                        owner = row.owner,
                        trigger = trigger,
                        setpoint = row.setpoint,
                        "Alarm cleared"
                    );
                    self.report.cleared.push(row.id);
                }
                Err(e) => self.record_error(trigger, &e),
            }
        }
    }

    /// Float-level change: every user is alerted while the setpoint has moved
    /// within the window; all rows clear once it holds steady.
    fn apply_float_change(&mut self, thresholds: &[AlertThreshold], stats: &WindowStats) {
        if stats.change() > self.settings.float_tolerance_ft {
            let level = stats.last.trunc();
            let breaches: Vec<Breach> = thresholds
                .iter()
                .map(|t| Breach { owner: t.owner, setpoint: level, trigger_value: level })
                .collect();
            self.apply(FLOAT_CHANGE_TRIGGER, &breaches);
        } else {
            self.apply(FLOAT_CHANGE_TRIGGER, &[]);
        }
    }
}

/// Convenience wrapper over `AlarmEvaluator`.
pub fn evaluate(
    store: &mut dyn AlarmStore,
    thresholds: &[AlertThreshold],
    series: &[FetchedSeries],
    settings: EvaluatorSettings,
    now: DateTime<Utc>,
) -> AlarmReport {
    AlarmEvaluator::new(store, settings, now).evaluate(thresholds, series)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::store::InMemoryAlarmStore;
    use crate::meters::{AFTERBAY_ELEVATION, R4_FLOW, R30_FLOW};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 13, 0, 0).unwrap()
    }

    /// Minute samples over the hour before `now`.
    fn last_hour(meter: MeterSeries, value: impl Fn(i64) -> f64) -> FetchedSeries {
        FetchedSeries {
            meter,
            points: (0..60)
                .map(|m| {
                    let t = now() - Duration::minutes(59 - m);
                    TimeSeriesPoint::new(t.with_timezone(&chrono_tz::US::Pacific), Some(value(m)))
                })
                .collect(),
        }
    }

    fn user(owner: i64) -> AlertThreshold {
        AlertThreshold { owner, ..Default::default() }
    }

    fn active(store: &mut InMemoryAlarmStore, trigger: &str) -> Vec<(i64, f64)> {
        store.active(trigger).unwrap().iter().map(|r| (r.owner, r.setpoint)).collect()
    }

    #[test]
    fn test_breach_creates_and_clear_resets() {
        let mut store = InMemoryAlarmStore::new();
        let thresholds = vec![AlertThreshold { r4_hi: Some(400), ..user(1) }];

        let report = evaluate(&mut store, &thresholds, &[last_hour(R4_FLOW, |_| 500.0)], EvaluatorSettings::default(), now());
        assert_eq!(report.created, vec![(1, "r4_hi".to_string())]);
        assert_eq!(active(&mut store, "r4_hi"), vec![(1, 400.0)]);

        let report = evaluate(&mut store, &thresholds, &[last_hour(R4_FLOW, |_| 350.0)], EvaluatorSettings::default(), now());
        assert_eq!(report.cleared.len(), 1);
        assert!(active(&mut store, "r4_hi").is_empty());
        assert_eq!(store.rows().len(), 1, "history is kept");
    }

    #[test]
    fn test_lo_bound_breach() {
        let mut store = InMemoryAlarmStore::new();
        let thresholds = vec![AlertThreshold { afterbay_lo: Some(1168.0), ..user(2) }];
        evaluate(
            &mut store,
            &thresholds,
            &[last_hour(AFTERBAY_ELEVATION, |m| 1168.5 - m as f64 * 0.02)],
            EvaluatorSettings::default(),
            now(),
        );
        let rows = store.active("afterbay_lo").unwrap();
        assert_eq!(rows.len(), 1);
        assert!((rows[0].trigger_value - (1168.5 - 59.0 * 0.02)).abs() < 1e-9);
    }

    #[test]
    fn test_changed_setpoint_replaces_row() {
        let mut store = InMemoryAlarmStore::new();
        let series = [last_hour(R4_FLOW, |_| 500.0)];
        evaluate(&mut store, &[AlertThreshold { r4_hi: Some(400), ..user(1) }], &series, EvaluatorSettings::default(), now());
        evaluate(&mut store, &[AlertThreshold { r4_hi: Some(450), ..user(1) }], &series, EvaluatorSettings::default(), now());
        assert_eq!(active(&mut store, "r4_hi"), vec![(1, 450.0)]);
        assert_eq!(store.rows().len(), 2);
    }

    #[test]
    fn test_missing_meter_leaves_its_alarms_alone() {
        let mut store = InMemoryAlarmStore::new();
        let thresholds = vec![AlertThreshold { r4_hi: Some(400), r30_hi: Some(10), ..user(1) }];
        evaluate(
            &mut store,
            &thresholds,
            &[last_hour(R4_FLOW, |_| 500.0), last_hour(R30_FLOW, |_| 50.0)],
            EvaluatorSettings::default(),
            now(),
        );
        assert_eq!(store.active("r4_hi").unwrap().len(), 1);

        // R4 fetch failed this tick; R30 still evaluated.
        let report = evaluate(
            &mut store,
            &thresholds,
            &[FetchedSeries { meter: R4_FLOW, points: vec![] }, last_hour(R30_FLOW, |_| 5.0)],
            EvaluatorSettings::default(),
            now(),
        );
        assert!(report.skipped.contains(&"R4_Flow".to_string()));
        assert_eq!(store.active("r4_hi").unwrap().len(), 1);
        assert!(store.active("r30_hi").unwrap().is_empty());
    }

    #[test]
    fn test_old_samples_outside_window_ignored() {
        let mut store = InMemoryAlarmStore::new();
        let mut series = last_hour(R4_FLOW, |_| 350.0);
        series.points.insert(
            0,
            TimeSeriesPoint::new((now() - Duration::hours(3)).with_timezone(&chrono_tz::US::Pacific), Some(900.0)),
        );
        evaluate(&mut store, &[AlertThreshold { r4_hi: Some(400), ..user(1) }], &[series], EvaluatorSettings::default(), now());
        assert!(store.active("r4_hi").unwrap().is_empty());
    }

    #[test]
    fn test_single_spike_does_not_alarm() {
        let mut store = InMemoryAlarmStore::new();
        let series = last_hour(R4_FLOW, |m| if m == 30 { 5000.0 } else { 350.0 });
        evaluate(&mut store, &[AlertThreshold { r4_hi: Some(400), ..user(1) }], &[series.clone()], EvaluatorSettings::default(), now());
        assert!(store.active("r4_hi").unwrap().is_empty());

        let unfiltered = EvaluatorSettings { spike_z_threshold: None, ..EvaluatorSettings::default() };
        evaluate(&mut store, &[AlertThreshold { r4_hi: Some(400), ..user(1) }], &[series], unfiltered, now());
        assert_eq!(store.active("r4_hi").unwrap().len(), 1);
    }

    #[test]
    fn test_float_change_alerts_everyone_then_resets() {
        let mut store = InMemoryAlarmStore::new();
        let thresholds = vec![user(1), user(2)];
        let moved = last_hour(AFTERBAY_SETPOINT, |m| if m < 30 { 1173.0 } else { 1175.2 });
        evaluate(&mut store, &thresholds, &[moved], EvaluatorSettings::default(), now());
        assert_eq!(active(&mut store, FLOAT_CHANGE_TRIGGER), vec![(1, 1175.0), (2, 1175.0)]);

        let steady = last_hour(AFTERBAY_SETPOINT, |_| 1175.2);
        evaluate(&mut store, &thresholds, &[steady], EvaluatorSettings::default(), now());
        assert!(active(&mut store, FLOAT_CHANGE_TRIGGER).is_empty());
    }

    #[test]
    fn test_small_float_wobble_is_not_a_change() {
        let mut store = InMemoryAlarmStore::new();
        let wobble = last_hour(AFTERBAY_SETPOINT, |m| 1175.0 + (m % 2) as f64 * 0.3);
        evaluate(&mut store, &[user(1)], &[wobble], EvaluatorSettings::default(), now());
        assert!(active(&mut store, FLOAT_CHANGE_TRIGGER).is_empty());
    }

    #[test]
    fn test_oxbow_deviation_alarm() {
        let mut store = InMemoryAlarmStore::new();
        let thresholds = vec![AlertThreshold { oxbow_deviation: Some(0.5), ..user(3) }];
        let series = [
            last_hour(OXBOW_POWER, |m| if m > 50 { 4.0 } else { 5.0 }),
            last_hour(ADS_OXBOW, |_| 5.0),
        ];
        evaluate(&mut store, &thresholds, &series, EvaluatorSettings { spike_z_threshold: None, ..Default::default() }, now());
        let rows = store.active("oxbow_deviation").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].trigger_value, 1.0);

        let matched = [last_hour(OXBOW_POWER, |_| 5.0), last_hour(ADS_OXBOW, |_| 5.0)];
        evaluate(&mut store, &thresholds, &matched, EvaluatorSettings::default(), now());
        assert!(store.active("oxbow_deviation").unwrap().is_empty());
    }
}
