/// Structured logging for the Afterbay forecast service
///
/// Wraps `tracing` with the service's conventions: every event carries a
/// `source` field naming the subsystem, per-meter events carry a `meter`
/// field, and fetch failures are classified before being logged so that a
/// known-flaky tag does not page anyone while an HTTP or parse failure does.

use std::fmt;
use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Data Source Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource {
    Historian,
    Cnrfc,
    Model,
    Alarm,
    Notify,
    Database,
    System,
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataSource::Historian => write!(f, "HIST"),
            DataSource::Cnrfc => write!(f, "CNRFC"),
            DataSource::Model => write!(f, "MODEL"),
            DataSource::Alarm => write!(f, "ALARM"),
            DataSource::Notify => write!(f, "NOTIFY"),
            DataSource::Database => write!(f, "DB"),
            DataSource::System => write!(f, "SYS"),
        }
    }
}

// ---------------------------------------------------------------------------
// Failure Classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureType {
    /// Expected failure - forecast issuance not yet published, tag offline
    Expected,
    /// Unexpected failure - indicates service degradation or configuration issue
    Unexpected,
    /// Unknown - cannot determine if this is expected or not
    Unknown,
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureType::Expected => write!(f, "EXPECTED"),
            FailureType::Unexpected => write!(f, "UNEXPECTED"),
            FailureType::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

// ---------------------------------------------------------------------------
// Subscriber setup
// ---------------------------------------------------------------------------

/// Installs the global subscriber.
///
/// `level` is an `EnvFilter` directive (`"info"`, `"abay_service=debug"`);
/// `RUST_LOG` takes precedence when set. With `log_file` the output is
/// appended to that file instead of the console. Calling this twice is a
/// no-op for the second call.
pub fn init_logger(level: &str, log_file: Option<&str>, console_timestamps: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    let result = match log_file.map(|p| OpenOptions::new().create(true).append(true).open(p)) {
        Some(Ok(file)) => builder
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .try_init(),
        Some(Err(e)) => {
            eprintln!("Failed to open log file, logging to console: {}", e);
            builder.try_init()
        }
        None if console_timestamps => builder.try_init(),
        None => builder.without_time().try_init(),
    };
    // A subscriber already exists (tests, embedding); keep it.
    let _ = result;
}

// ---------------------------------------------------------------------------
// Failure Classification Helpers
// ---------------------------------------------------------------------------

/// Classify a historian fetch failure from its error text.
pub fn classify_historian_failure(error_message: &str) -> FailureType {
    if error_message.contains("No data available") {
        // Tags go quiet during maintenance outages.
        FailureType::Unknown
    } else if error_message.contains("HTTP error") || error_message.contains("Request failed") {
        FailureType::Unexpected
    } else if error_message.contains("Parse error")
        || error_message.contains("Unresolvable element")
        || error_message.contains("No InterpolatedData")
    {
        FailureType::Unexpected
    } else {
        FailureType::Unknown
    }
}

/// Classify a forecast-provider failure. A 404 on a candidate issuance just
/// means it has not been published yet.
pub fn classify_cnrfc_failure(error_message: &str) -> FailureType {
    if error_message.contains("HTTP error: 404") {
        FailureType::Expected
    } else if error_message.contains("HTTP") || error_message.contains("Request failed") {
        FailureType::Unexpected
    } else if error_message.contains("Parse error") || error_message.contains("Archive error") {
        FailureType::Unexpected
    } else {
        FailureType::Unknown
    }
}

// ---------------------------------------------------------------------------
// Structured Failure Logging
// ---------------------------------------------------------------------------

/// Log a historian failure with automatic classification.
pub fn log_historian_failure(meter: &str, operation: &str, err: &dyn std::error::Error) {
    let error_msg = err.to_string();
    let failure_type = classify_historian_failure(&error_msg);
    let source = DataSource::Historian;

    match failure_type {
        FailureType::Expected => {
            debug!(%source, meter, %failure_type, "{} failed: {}", operation, error_msg)
        }
        FailureType::Unexpected => {
            error!(%source, meter, %failure_type, "{} failed: {}", operation, error_msg)
        }
        FailureType::Unknown => {
            warn!(%source, meter, %failure_type, "{} failed: {}", operation, error_msg)
        }
    }
}

/// Log a forecast-provider failure with classification.
pub fn log_cnrfc_failure(issuance: &str, err: &dyn std::error::Error) {
    let error_msg = err.to_string();
    let failure_type = classify_cnrfc_failure(&error_msg);
    let source = DataSource::Cnrfc;

    match failure_type {
        FailureType::Expected => {
            debug!(%source, issuance, %failure_type, "forecast download failed: {}", error_msg)
        }
        FailureType::Unexpected => {
            error!(%source, issuance, %failure_type, "forecast download failed: {}", error_msg)
        }
        FailureType::Unknown => {
            warn!(%source, issuance, %failure_type, "forecast download failed: {}", error_msg)
        }
    }
}

// ---------------------------------------------------------------------------
// Tick Summary Logging
// ---------------------------------------------------------------------------

/// Log how many roster meters returned data this tick.
pub fn log_fetch_summary(total: usize, successful: usize) {
    let failed = total - successful;
    let source = DataSource::Historian;

    if failed == 0 {
        info!(%source, "Fetched {}/{} meters", successful, total);
    } else if successful == 0 {
        error!(%source, "Fetched 0/{} meters; historian unreachable?", total);
    } else {
        warn!(%source, "Fetched {}/{} meters, {} empty", successful, total, failed);
    }
}
