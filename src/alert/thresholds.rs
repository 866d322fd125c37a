//! Threshold checks over a closed set of alarm kinds.
//!
//! Every alarm the service can raise is one `AlarmCheck`; its trigger key,
//! the user's bound for it and the breach rule all come from the variant, so
//! nothing here builds field names from strings.

use crate::meters::Quantity;
use crate::model::{AlertThreshold, TimeSeriesPoint};

/// Trigger key of the float-level change alarm.
pub const FLOAT_CHANGE_TRIGGER: &str = "afterbay_float";
/// Trigger key of the Oxbow schedule-deviation alarm.
pub const OXBOW_DEVIATION_TRIGGER: &str = "oxbow_deviation";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BoundKind {
    /// Breached when the window maximum exceeds the bound.
    Hi,
    /// Breached when the window minimum falls below the bound.
    Lo,
}

impl BoundKind {
    pub fn suffix(&self) -> &'static str {
        match self {
            BoundKind::Hi => "hi",
            BoundKind::Lo => "lo",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlarmCheck {
    Bound(Quantity, BoundKind),
    /// Observed vs scheduled Oxbow generation.
    OxbowDeviation,
}

impl AlarmCheck {
    /// `r4_hi`, `afterbay_lo`, `oxbow_deviation`, ...
    pub fn trigger_key(&self) -> String {
        match self {
            AlarmCheck::Bound(q, kind) => format!("{}_{}", q.trigger_prefix(), kind.suffix()),
            AlarmCheck::OxbowDeviation => OXBOW_DEVIATION_TRIGGER.to_string(),
        }
    }

    /// The user's configured bound for this check, if any.
    pub fn setpoint(&self, t: &AlertThreshold) -> Option<f64> {
        let int = |v: Option<i64>| v.map(|v| v as f64);
        match self {
            AlarmCheck::Bound(Quantity::R4Flow, BoundKind::Hi) => int(t.r4_hi),
            AlarmCheck::Bound(Quantity::R4Flow, BoundKind::Lo) => int(t.r4_lo),
            AlarmCheck::Bound(Quantity::R11Flow, BoundKind::Hi) => int(t.r11_hi),
            AlarmCheck::Bound(Quantity::R11Flow, BoundKind::Lo) => int(t.r11_lo),
            AlarmCheck::Bound(Quantity::R30Flow, BoundKind::Hi) => int(t.r30_hi),
            AlarmCheck::Bound(Quantity::R30Flow, BoundKind::Lo) => int(t.r30_lo),
            AlarmCheck::Bound(Quantity::AfterbayElevation, BoundKind::Hi) => t.afterbay_hi,
            AlarmCheck::Bound(Quantity::AfterbayElevation, BoundKind::Lo) => t.afterbay_lo,
            AlarmCheck::OxbowDeviation => t.oxbow_deviation,
        }
    }

    /// Value compared against setpoints, taken from the window statistics.
    pub fn observed_value(&self, stats: &WindowStats) -> f64 {
        match self {
            AlarmCheck::Bound(_, BoundKind::Hi) | AlarmCheck::OxbowDeviation => stats.max,
            AlarmCheck::Bound(_, BoundKind::Lo) => stats.min,
        }
    }

    pub fn is_breached(&self, setpoint: f64, stats: &WindowStats) -> bool {
        match self {
            AlarmCheck::Bound(_, BoundKind::Hi) | AlarmCheck::OxbowDeviation => setpoint < stats.max,
            AlarmCheck::Bound(_, BoundKind::Lo) => setpoint > stats.min,
        }
    }
}

/// Extremes of one alarm window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowStats {
    pub min: f64,
    pub max: f64,
    pub first: f64,
    pub last: f64,
}

impl WindowStats {
    /// `None` when the window holds no numeric value.
    pub fn from_points(points: &[TimeSeriesPoint]) -> Option<Self> {
        let mut values = points.iter().filter_map(|p| p.value);
        let first = values.next()?;
        let mut stats = WindowStats { min: first, max: first, first, last: first };
        for v in values {
            stats.min = stats.min.min(v);
            stats.max = stats.max.max(v);
            stats.last = v;
        }
        Some(stats)
    }

    pub fn from_values(values: &[f64]) -> Option<Self> {
        let (&first, rest) = values.split_first()?;
        let mut stats = WindowStats { min: first, max: first, first, last: first };
        for &v in rest {
            stats.min = stats.min.min(v);
            stats.max = stats.max.max(v);
            stats.last = v;
        }
        Some(stats)
    }

    pub fn change(&self) -> f64 {
        (self.last - self.first).abs()
    }
}

/// One user currently breaching one check.
#[derive(Debug, Clone, PartialEq)]
pub struct Breach {
    pub owner: i64,
    pub setpoint: f64,
    pub trigger_value: f64,
}

/// Users breaching `check` given the window statistics.
pub fn breaching_users(
    check: &AlarmCheck,
    thresholds: &[AlertThreshold],
    stats: &WindowStats,
) -> Vec<Breach> {
    thresholds
        .iter()
        .filter_map(|t| {
            let setpoint = check.setpoint(t)?;
            check.is_breached(setpoint, stats).then(|| Breach {
                owner: t.owner,
                setpoint,
                trigger_value: check.observed_value(stats),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(min: f64, max: f64) -> WindowStats {
        WindowStats { min, max, first: min, last: max }
    }

    #[test]
    fn test_trigger_keys() {
        assert_eq!(AlarmCheck::Bound(Quantity::R4Flow, BoundKind::Hi).trigger_key(), "r4_hi");
        assert_eq!(
            AlarmCheck::Bound(Quantity::AfterbayElevation, BoundKind::Lo).trigger_key(),
            "afterbay_lo"
        );
        assert_eq!(AlarmCheck::OxbowDeviation.trigger_key(), "oxbow_deviation");
    }

    #[test]
    fn test_hi_breach_is_strict() {
        let check = AlarmCheck::Bound(Quantity::R4Flow, BoundKind::Hi);
        assert!(check.is_breached(400.0, &stats(350.0, 500.0)));
        assert!(!check.is_breached(500.0, &stats(350.0, 500.0)));
    }

    #[test]
    fn test_lo_breach_uses_minimum() {
        let check = AlarmCheck::Bound(Quantity::AfterbayElevation, BoundKind::Lo);
        assert!(check.is_breached(1168.0, &stats(1167.5, 1170.0)));
        assert!(!check.is_breached(1167.0, &stats(1167.5, 1170.0)));
        assert_eq!(check.observed_value(&stats(1167.5, 1170.0)), 1167.5);
    }

    #[test]
    fn test_breaching_users_skips_unset_bounds() {
        let thresholds = vec![
            AlertThreshold { owner: 1, r4_hi: Some(400), ..Default::default() },
            AlertThreshold { owner: 2, r4_hi: Some(600), ..Default::default() },
            AlertThreshold { owner: 3, ..Default::default() },
        ];
        let check = AlarmCheck::Bound(Quantity::R4Flow, BoundKind::Hi);
        let breaches = breaching_users(&check, &thresholds, &stats(480.0, 500.0));
        assert_eq!(
            breaches,
            vec![Breach { owner: 1, setpoint: 400.0, trigger_value: 500.0 }]
        );
    }

    #[test]
    fn test_window_stats_skip_nulls() {
        use chrono::TimeZone;
        let t = chrono_tz::US::Pacific.with_ymd_and_hms(2024, 5, 1, 5, 0, 0).unwrap();
        let pts = vec![
            TimeSeriesPoint::new(t, None),
            TimeSeriesPoint::new(t, Some(3.0)),
            TimeSeriesPoint::new(t, Some(1.0)),
            TimeSeriesPoint::new(t, Some(2.0)),
        ];
        let s = WindowStats::from_points(&pts).unwrap();
        assert_eq!((s.min, s.max, s.first, s.last), (1.0, 3.0, 3.0, 2.0));
        assert!(WindowStats::from_points(&[TimeSeriesPoint::new(t, None)]).is_none());
        assert!((WindowStats::from_values(&[1.6, 1.0]).unwrap().change() - 0.6).abs() < 1e-9);
    }
}
