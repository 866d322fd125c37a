/// Z-score spike filter for alarm inputs.
///
/// Telemetry occasionally reports a single wild sample (a gauge reset, a
/// stuck transmitter returning its range limit). A one-sample spike would
/// otherwise raise and immediately clear an alarm, so points whose value is
/// `threshold` or more population standard deviations from the window mean
/// are dropped before evaluation.

use crate::model::TimeSeriesPoint;

pub struct FilterResult {
    pub points: Vec<TimeSeriesPoint>,
    pub dropped: usize,
}

pub fn remove_spikes(points: &[TimeSeriesPoint], threshold: f64) -> FilterResult {
    let values: Vec<f64> = points.iter().filter_map(|p| p.value).collect();
    if values.len() < 2 {
        return FilterResult { points: points.to_vec(), dropped: 0 };
    }

    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let std = (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
    // Flat window: every z-score is undefined.
    if std == 0.0 {
        return FilterResult { points: points.to_vec(), dropped: 0 };
    }

    let kept: Vec<TimeSeriesPoint> = points
        .iter()
        .filter(|p| match p.value {
            Some(v) => ((v - mean) / std).abs() < threshold,
            None => true,
        })
        .copied()
        .collect();
    let dropped = points.len() - kept.len();
    FilterResult { points: kept, dropped }
}
