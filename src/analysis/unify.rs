/// Series unification
///
/// Merges the per-meter series of one tick into a single table indexed by
/// timestamp. Columns are keyed by `MeterSeries::column_key()`; a timestamp
/// present in one series but not another becomes a `None` cell in the
/// other's column (outer join). Column order is the key order, so the
/// result does not depend on the order series were fetched or merged.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{Duration, Utc};

use crate::forecast::frame::floor_hour;
use crate::model::{FetchedSeries, TimeSeriesPoint, Timestamp, UnifyError};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnifiedFrame {
    index: Vec<Timestamp>,
    columns: BTreeMap<String, Vec<Option<f64>>>,
}

impl UnifiedFrame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn index(&self) -> &[Timestamp] {
        &self.index
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn column_keys(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    pub fn column(&self, key: &str) -> Option<&[Option<f64>]> {
        self.columns.get(key).map(Vec::as_slice)
    }

    /// Value at an exact timestamp.
    pub fn value_at(&self, key: &str, time: &Timestamp) -> Option<f64> {
        let row = self.index.binary_search(time).ok()?;
        self.columns.get(key)?.get(row).copied().flatten()
    }

    /// Latest non-null value of a column.
    pub fn last_valid(&self, key: &str) -> Option<f64> {
        self.columns.get(key)?.iter().rev().find_map(|v| *v)
    }

    pub fn first_valid(&self, key: &str) -> Option<f64> {
        self.columns.get(key)?.iter().find_map(|v| *v)
    }

    /// A column as points, skipping rows with no value.
    pub fn points(&self, key: &str) -> Vec<TimeSeriesPoint> {
        let Some(values) = self.columns.get(key) else {
            return Vec::new();
        };
        self.index
            .iter()
            .zip(values)
            .filter(|(_, v)| v.is_some())
            .map(|(t, v)| TimeSeriesPoint::new(*t, *v))
            .collect()
    }

    /// Outer-merges one series as column `key`, replacing any existing column
    /// of that name. Repeated timestamps within the series keep the last
    /// value.
    pub fn merge(&mut self, key: &str, points: &[TimeSeriesPoint]) {
        let incoming: BTreeMap<Timestamp, Option<f64>> =
            points.iter().map(|p| (p.timestamp, p.value)).collect();

        let all_times: BTreeSet<Timestamp> = self
            .index
            .iter()
            .copied()
            .chain(incoming.keys().copied())
            .collect();

        if all_times.len() != self.index.len() {
            let old_index = std::mem::take(&mut self.index);
            let new_index: Vec<Timestamp> = all_times.into_iter().collect();
            for values in self.columns.values_mut() {
                let old: BTreeMap<Timestamp, Option<f64>> =
                    old_index.iter().copied().zip(values.iter().copied()).collect();
                *values = new_index
                    .iter()
                    .map(|t| old.get(t).copied().flatten())
                    .collect();
            }
            self.index = new_index;
        }

        let column = self
            .index
            .iter()
            .map(|t| incoming.get(t).copied().flatten())
            .collect();
        self.columns.insert(key.to_string(), column);
    }

    /// Adds a column aligned to the current index. Shorter inputs are padded
    /// with `None`, longer ones truncated.
    pub fn insert_column(&mut self, key: &str, mut values: Vec<Option<f64>>) {
        values.resize(self.index.len(), None);
        self.columns.insert(key.to_string(), values);
    }

    /// Hourly means, each bucket labeled by its end (hour-ending).
    pub fn resample_hourly(&self) -> UnifiedFrame {
        let mut hourly = UnifiedFrame::new();
        for key in self.columns.keys() {
            let resampled = resample_hourly(&self.points(key));
            hourly.merge(key, &resampled);
        }
        hourly
    }
}

/// Unifies the fetched series of one tick.
///
/// Fails on the first empty series: the water-balance model needs every
/// input present at once, so a partial frame is never returned.
pub fn unify(series: &[FetchedSeries]) -> Result<UnifiedFrame, UnifyError> {
    if series.is_empty() {
        return Err(UnifyError::NoMeters);
    }
    let mut frame = UnifiedFrame::new();
    for fetched in series {
        if fetched.is_empty() {
            return Err(UnifyError::EmptySeries(fetched.meter.column_key()));
        }
        frame.merge(&fetched.meter.column_key(), &fetched.points);
    }
    Ok(frame)
}

/// Right-labeled hourly mean: points in `[h, h+1)` are averaged and stamped
/// `h+1`. Buckets whose points are all null are kept as `None`.
pub fn resample_hourly(points: &[TimeSeriesPoint]) -> Vec<TimeSeriesPoint> {
    let mut buckets: BTreeMap<chrono::DateTime<Utc>, (f64, usize, Timestamp)> = BTreeMap::new();
    for p in points {
        let label = floor_hour(p.timestamp.with_timezone(&Utc)) + Duration::hours(1);
        let entry = buckets
            .entry(label)
            .or_insert((0.0, 0, label.with_timezone(&p.timestamp.timezone())));
        if let Some(v) = p.value {
            entry.0 += v;
            entry.1 += 1;
        }
    }
    buckets
        .into_values()
        .map(|(sum, n, label)| {
            let mean = if n == 0 { None } else { Some(sum / n as f64) };
            TimeSeriesPoint::new(label, mean)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MeterSeries;
    use crate::meters::{AFTERBAY_ELEVATION, R4_FLOW, R30_FLOW};
    use chrono::TimeZone;
    use chrono_tz::US::Pacific;

    fn at(h: u32, m: u32) -> Timestamp {
        Pacific.with_ymd_and_hms(2024, 5, 1, h, m, 0).unwrap()
    }

    fn series(meter: MeterSeries, pts: &[(u32, u32, f64)]) -> FetchedSeries {
        FetchedSeries {
            meter,
            points: pts
                .iter()
                .map(|(h, m, v)| TimeSeriesPoint::new(at(*h, *m), Some(*v)))
                .collect(),
        }
    }

    #[test]
    fn test_outer_merge_fills_gaps_with_none() {
        let frame = unify(&[
            series(R4_FLOW, &[(5, 0, 500.0), (6, 0, 510.0)]),
            series(R30_FLOW, &[(6, 0, 40.0), (7, 0, 41.0)]),
        ])
        .unwrap();

        assert_eq!(frame.len(), 3);
        assert_eq!(frame.column("R4_Flow").unwrap(), &[Some(500.0), Some(510.0), None]);
        assert_eq!(frame.column("R30_Flow").unwrap(), &[None, Some(40.0), Some(41.0)]);
    }

    #[test]
    fn test_unification_independent_of_order() {
        let a = series(R4_FLOW, &[(5, 0, 500.0), (5, 30, 505.0)]);
        let b = series(R30_FLOW, &[(5, 15, 40.0), (5, 30, 41.0)]);
        let c = series(AFTERBAY_ELEVATION, &[(4, 0, 1170.0)]);

        let forward = unify(&[a.clone(), b.clone(), c.clone()]).unwrap();
        let reverse = unify(&[c.clone(), b.clone(), a.clone()]).unwrap();
        let mixed = unify(&[b, a, c]).unwrap();
        assert_eq!(forward, reverse);
        assert_eq!(forward, mixed);
        assert_eq!(
            forward.column_keys().collect::<Vec<_>>(),
            vec!["Afterbay_Elevation", "R30_Flow", "R4_Flow"]
        );
    }

    #[test]
    fn test_empty_series_aborts_unification() {
        let err = unify(&[
            series(R4_FLOW, &[(5, 0, 500.0)]),
            FetchedSeries { meter: R30_FLOW, points: vec![] },
        ])
        .unwrap_err();
        assert_eq!(err, UnifyError::EmptySeries("R30_Flow".to_string()));
        assert_eq!(unify(&[]).unwrap_err(), UnifyError::NoMeters);
    }

    #[test]
    fn test_merge_normalizes_timezones() {
        // Same instant expressed in UTC and Pacific lands on one row.
        let utc_instant = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut frame = UnifiedFrame::new();
        frame.merge("a", &[TimeSeriesPoint::new(utc_instant.with_timezone(&chrono_tz::UTC), Some(1.0))]);
        frame.merge("b", &[TimeSeriesPoint::new(at(5, 0), Some(2.0))]);
        assert_eq!(frame.len(), 1);
    }

    #[test]
    fn test_last_and_first_valid_skip_nulls() {
        let mut frame = UnifiedFrame::new();
        frame.merge(
            "x",
            &[
                TimeSeriesPoint::new(at(1, 0), None),
                TimeSeriesPoint::new(at(2, 0), Some(3.0)),
                TimeSeriesPoint::new(at(3, 0), Some(4.0)),
                TimeSeriesPoint::new(at(4, 0), None),
            ],
        );
        assert_eq!(frame.first_valid("x"), Some(3.0));
        assert_eq!(frame.last_valid("x"), Some(4.0));
        assert_eq!(frame.last_valid("missing"), None);
        assert_eq!(frame.points("x").len(), 2);
    }

    #[test]
    fn test_resample_is_right_labeled_mean() {
        let pts = vec![
            TimeSeriesPoint::new(at(5, 0), Some(2.0)),
            TimeSeriesPoint::new(at(5, 30), Some(4.0)),
            TimeSeriesPoint::new(at(6, 0), Some(10.0)),
            TimeSeriesPoint::new(at(7, 10), None),
        ];
        let hourly = resample_hourly(&pts);
        assert_eq!(hourly.len(), 3);
        assert_eq!(hourly[0], TimeSeriesPoint::new(at(6, 0), Some(3.0)));
        assert_eq!(hourly[1], TimeSeriesPoint::new(at(7, 0), Some(10.0)));
        assert_eq!(hourly[2], TimeSeriesPoint::new(at(8, 0), None));
    }

    #[test]
    fn test_frame_resample_keeps_columns() {
        let frame = unify(&[
            series(R4_FLOW, &[(5, 0, 500.0), (5, 30, 520.0)]),
            series(R30_FLOW, &[(5, 45, 40.0)]),
        ])
        .unwrap();
        let hourly = frame.resample_hourly();
        assert_eq!(hourly.index(), &[at(6, 0)]);
        assert_eq!(hourly.value_at("R4_Flow", &at(6, 0)), Some(510.0));
        assert_eq!(hourly.value_at("R30_Flow", &at(6, 0)), Some(40.0));
    }

    #[test]
    fn test_insert_column_pads_to_index() {
        let mut frame = unify(&[series(R4_FLOW, &[(5, 0, 1.0), (6, 0, 2.0)])]).unwrap();
        frame.insert_column("Pmin", vec![Some(7.0)]);
        assert_eq!(frame.column("Pmin").unwrap(), &[Some(7.0), None]);
    }
}
