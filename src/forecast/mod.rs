/// Afterbay elevation forecasting.
///
/// Submodules:
/// - `curves`: calibrated MW→cfs and elevation↔storage fits.
/// - `frame`: the hourly forecast grid and its between-tick cache.
/// - `water_balance`: the recursive storage forecast with bias correction.
/// - `release`: required release and suggested Oxbow dispatch.

pub mod curves;
pub mod frame;
pub mod release;
pub mod water_balance;
