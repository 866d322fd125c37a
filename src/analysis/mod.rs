/// Telemetry shaping for the forecast and alarm stages.
///
/// Submodules:
/// - `unify`: outer-joins per-meter series into one timestamp-indexed frame.
/// - `dispatch`: Pmin/Pmax safe-dispatch bounds from the unified frame.
/// - `outliers`: z-score spike filter applied to alarm windows.

pub mod dispatch;
pub mod outliers;
pub mod unify;
