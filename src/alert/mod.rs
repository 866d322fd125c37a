/// Threshold alarms for the Afterbay and its feeder gauges.
///
/// Submodules:
/// - `thresholds`: the closed set of checks and their breach rules.
/// - `store`: persisted alarm state and user directory interfaces.
/// - `evaluator`: the per-tick issue/reset state machine.
/// - `notify`: message formatting and hand-off to the transport.

pub mod evaluator;
pub mod notify;
pub mod store;
pub mod thresholds;
