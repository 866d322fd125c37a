//! Roster verification
//!
//! Checks every meter of the polling roster against the live historian:
//! whether its attribute path resolves to a data endpoint, and whether a
//! short recent window returns any samples. Run this after renaming a tag or
//! moving an element before trusting the forecast again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ingest::FetchMode;
use crate::ingest::historian::{HistorianClient, HistorianSettings};
use crate::meters::{METER_ROSTER, MeterEntry};
use crate::model::HistorianError;

/// Window fetched per meter during verification.
pub const VERIFY_LOOKBACK_HOURS: i64 = 4;

// ============================================================================
// Verification Results
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum VerificationStatus {
    Success,
    PartialSuccess,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterVerification {
    pub column_key: String,
    pub description: String,
    pub status: VerificationStatus,
    pub endpoint_resolved: bool,
    pub sample_data_count: usize,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerificationSummary {
    pub total: usize,
    pub working: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationReport {
    pub timestamp: String,
    pub meters: Vec<MeterVerification>,
    pub summary: VerificationSummary,
}

impl VerificationReport {
    /// Success only when every meter returned data.
    pub fn status(&self) -> VerificationStatus {
        let all_ok = self.meters.iter().all(|m| m.status == VerificationStatus::Success);
        if all_ok {
            VerificationStatus::Success
        } else if self.summary.working == 0 {
            VerificationStatus::Failed
        } else {
            VerificationStatus::PartialSuccess
        }
    }
}

// ============================================================================
// Per-meter check
// ============================================================================

pub fn verify_meter(client: &HistorianClient, entry: &MeterEntry, now: DateTime<Utc>) -> MeterVerification {
    let mut result = MeterVerification {
        column_key: entry.meter.column_key(),
        description: entry.description.to_string(),
        status: VerificationStatus::Failed,
        endpoint_resolved: false,
        sample_data_count: 0,
        error_message: None,
    };

    if let Err(e) = client.resolve_endpoint(&entry.meter) {
        result.error_message = Some(format!("Endpoint lookup failed: {}", e));
        return result;
    }
    result.endpoint_resolved = true;

    match client.fetch_interpolated(&entry.meter, FetchMode::Observed, now) {
        Ok(points) => {
            result.sample_data_count = points.iter().filter(|p| p.value.is_some()).count();
            result.status = if result.sample_data_count > 0 {
                VerificationStatus::Success
            } else {
                VerificationStatus::PartialSuccess
            };
        }
        Err(e) => {
            result.error_message = Some(format!("Data request failed: {}", e));
            result.status = VerificationStatus::PartialSuccess;
        }
    }

    result
}

// ============================================================================
// Full Verification Runner
// ============================================================================

/// Verifies the whole roster over a short trailing window.
pub fn run_verification(
    mut settings: HistorianSettings,
    now: DateTime<Utc>,
) -> Result<VerificationReport, HistorianError> {
    settings.lookback = chrono::Duration::hours(VERIFY_LOOKBACK_HOURS);
    let client = HistorianClient::new(settings)?;

    let mut report = VerificationReport {
        timestamp: now.to_rfc3339(),
        meters: Vec::with_capacity(METER_ROSTER.len()),
        summary: VerificationSummary { total: METER_ROSTER.len(), ..Default::default() },
    };

    for entry in METER_ROSTER {
        let result = verify_meter(&client, entry, now);
        match result.status {
            VerificationStatus::Success => report.summary.working += 1,
            VerificationStatus::PartialSuccess => {
                if result.sample_data_count > 0 {
                    report.summary.working += 1;
                } else {
                    report.summary.failed += 1;
                }
            }
            VerificationStatus::Failed => report.summary.failed += 1,
        }
        report.meters.push(result);
    }

    Ok(report)
}

pub fn print_summary(report: &VerificationReport) {
    println!("Roster verification at {}", report.timestamp);
    println!();
    for m in &report.meters {
        match m.status {
            VerificationStatus::Success => {
                println!("  OK       {:<32} {} samples", m.column_key, m.sample_data_count);
            }
            VerificationStatus::PartialSuccess => {
                println!(
                    "  PARTIAL  {:<32} {}",
                    m.column_key,
                    m.error_message.as_deref().unwrap_or("resolved but no samples")
                );
            }
            VerificationStatus::Failed => {
                println!(
                    "  FAILED   {:<32} {}",
                    m.column_key,
                    m.error_message.as_deref().unwrap_or("Unknown")
                );
            }
        }
    }
    println!();
    println!(
        "{}/{} meters returning data ({} failed): {:?}",
        report.summary.working,
        report.summary.total,
        report.summary.failed,
        report.status()
    );
}
