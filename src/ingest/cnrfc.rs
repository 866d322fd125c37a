/// CNRFC natural-flow forecast client
///
/// The river forecast center publishes a zipped CSV per basin for each
/// issuance:
///   {base}/csv/{YYYYMMDD}12_{basin}_csv_export.zip
///
/// The CSV has a two-row header (gauge codes, then units), a `GMT` column
/// and one column of kcfs values per gauge. Only the gauges feeding the
/// Afterbay are kept.

use std::io::{Cursor, Read};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::config::ForecastConfig;
use crate::forecast::frame::{ForecastFrame, ForecastRow};
use crate::ingest::ForecastSource;
use crate::logging::{DataSource, log_cnrfc_failure};
use crate::model::ForecastFetchError;

/// Hour (UTC) at which each issuance is stamped.
const ISSUANCE_HOUR: u32 = 12;

/// Export values are kcfs.
const KCFS_TO_CFS: f64 = 1000.0;

/// Provider gauge code → forecast column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForecastGauge {
    /// MFAC1L: Middle Fork below Interbay (local natural flow)
    R20,
    /// RUFC1: Rubicon below Ralston
    R30,
    /// MFPC1: Middle Fork at French Meadows
    R4,
    /// MFAC1: Middle Fork above the Afterbay
    R11,
}

impl ForecastGauge {
    pub const ALL: [ForecastGauge; 4] = [Self::R20, Self::R30, Self::R4, Self::R11];

    pub fn provider_code(&self) -> &'static str {
        match self {
            Self::R20 => "MFAC1L",
            Self::R30 => "RUFC1",
            Self::R4 => "MFPC1",
            Self::R11 => "MFAC1",
        }
    }

    fn slot<'a>(&self, row: &'a mut ForecastRow) -> &'a mut Option<f64> {
        match self {
            Self::R20 => &mut row.r20_fcst,
            Self::R30 => &mut row.r30_fcst,
            Self::R4 => &mut row.r4_fcst,
            Self::R11 => &mut row.r11_fcst,
        }
    }
}

// ============================================================================
// Settings
// ============================================================================

#[derive(Debug, Clone)]
pub struct CnrfcSettings {
    pub base_url: String,
    pub basin: String,
    pub tz: Tz,
    pub timeout: StdDuration,
}

impl CnrfcSettings {
    pub fn from_config(config: &ForecastConfig, tz: Tz) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            basin: config.basin.clone(),
            tz,
            timeout: StdDuration::from_secs(60),
        }
    }
}

// ============================================================================
// Issuance selection
// ============================================================================

/// Yesterday's and today's issuances, oldest first. "Today" is the civil
/// date at `now`.
pub fn candidate_issuances(now: DateTime<Utc>, tz: Tz) -> [DateTime<Utc>; 2] {
    let today = now.with_timezone(&tz).date_naive();
    let at_noon = |date: chrono::NaiveDate| {
        Utc.from_utc_datetime(&date.and_hms_opt(ISSUANCE_HOUR, 0, 0).unwrap_or_default())
    };
    let yesterday = today.pred_opt().unwrap_or(today);
    [at_noon(yesterday), at_noon(today)]
}

/// Most recent issuance the provider should have published by `now`.
pub fn latest_expected_issuance(now: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    candidate_issuances(now, tz)[1]
}

pub fn export_url(settings: &CnrfcSettings, issuance: DateTime<Utc>) -> String {
    format!(
        "{}/csv/{}_{}_csv_export.zip",
        settings.base_url,
        issuance.format("%Y%m%d%H"),
        settings.basin
    )
}

// ============================================================================
// Parsing
// ============================================================================

/// Extracts the first CSV member of an export archive.
pub fn unzip_export(bytes: &[u8]) -> Result<String, ForecastFetchError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| ForecastFetchError::Archive(e.to_string()))?;
    if archive.is_empty() {
        return Err(ForecastFetchError::Archive("empty archive".to_string()));
    }
    let mut member = archive
        .by_index(0)
        .map_err(|e| ForecastFetchError::Archive(e.to_string()))?;
    let mut text = String::new();
    member
        .read_to_string(&mut text)
        .map_err(|e| ForecastFetchError::Archive(e.to_string()))?;
    Ok(text)
}

fn parse_gmt(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%m/%d/%Y %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Parses the export CSV into forecast rows.
///
/// The units row under the header is skipped, timestamps are read as UTC
/// and converted to `tz`, gauge values are scaled to cfs. Cells that do not
/// parse become `None`; rows whose timestamp does not parse are an error.
pub fn parse_export(text: &str, tz: Tz) -> Result<Vec<ForecastRow>, ForecastFetchError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers = reader
        .headers()
        .map_err(|e| ForecastFetchError::ParseError(e.to_string()))?
        .clone();
    let time_col = headers
        .iter()
        .position(|h| h == "GMT")
        .ok_or_else(|| ForecastFetchError::ParseError("missing GMT column".to_string()))?;
    let gauge_cols: Vec<(ForecastGauge, Option<usize>)> = ForecastGauge::ALL
        .iter()
        .map(|g| (*g, headers.iter().position(|h| h == g.provider_code())))
        .collect();

    let mut rows = Vec::new();
    for (i, record) in reader.records().enumerate() {
        let record = record.map_err(|e| ForecastFetchError::ParseError(e.to_string()))?;
        // Second header row (units).
        if i == 0 {
            continue;
        }
        let raw_time = record.get(time_col).unwrap_or_default();
        let time = parse_gmt(raw_time)
            .ok_or_else(|| ForecastFetchError::ParseError(format!("bad GMT value '{}'", raw_time)))?;

        let mut row = ForecastRow::empty(time.with_timezone(&tz));
        for (gauge, col) in &gauge_cols {
            let value = col
                .and_then(|c| record.get(c))
                .and_then(|v| v.parse::<f64>().ok())
                .map(|kcfs| kcfs * KCFS_TO_CFS);
            *gauge.slot(&mut row) = value;
        }
        rows.push(row);
    }

    if rows.is_empty() {
        return Err(ForecastFetchError::ParseError("export has no data rows".to_string()));
    }
    rows.sort_by_key(|r| r.time);
    rows.dedup_by_key(|r| r.time);
    Ok(rows)
}

// ============================================================================
// API Client
// ============================================================================

pub struct CnrfcClient {
    client: reqwest::blocking::Client,
    settings: CnrfcSettings,
}

impl CnrfcClient {
    pub fn new(settings: CnrfcSettings) -> Result<Self, ForecastFetchError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(settings.timeout)
            .build()?;
        Ok(Self { client, settings })
    }

    /// Downloads and parses one issuance.
    pub fn fetch_issuance(
        &self,
        issuance: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ForecastFrame, ForecastFetchError> {
        let url = export_url(&self.settings, issuance);
        let response = self.client.get(&url).send()?;
        if !response.status().is_success() {
            return Err(ForecastFetchError::HttpError(response.status().as_u16()));
        }
        let bytes = response.bytes()?;
        let rows = parse_export(&unzip_export(&bytes)?, self.settings.tz)?;
        Ok(ForecastFrame {
            issued: Some(issuance.with_timezone(&self.settings.tz)),
            fetched_at: now,
            rows,
            summary: None,
        })
    }

    /// Tries each candidate issuance and keeps the latest that succeeded,
    /// falling back to a synthesized empty grid.
    pub fn fetch_latest(&self, now: DateTime<Utc>) -> ForecastFrame {
        let mut latest = None;
        for issuance in candidate_issuances(now, self.settings.tz) {
            let label = issuance.format("%Y%m%d%H").to_string();
            match self.fetch_issuance(issuance, now) {
                Ok(frame) => {
                    tracing::info!(
                        source = %DataSource::Cnrfc,
                        issuance = %label,
                        rows = frame.rows.len(),
                        span_hours = frame_span(&frame).num_hours(),
                        "Downloaded forecast issuance"
                    );
                    latest = Some(frame);
                }
                Err(e) => log_cnrfc_failure(&label, &e),
            }
        }

        latest.unwrap_or_else(|| {
            tracing::warn!(
                source = %DataSource::Cnrfc,
                "No forecast issuance available, using empty grid"
            );
            ForecastFrame::synthesized(now, self.settings.tz)
        })
    }
}

impl ForecastSource for CnrfcClient {
    fn forecast(&self, cached: Option<ForecastFrame>, now: DateTime<Utc>) -> ForecastFrame {
        match cached {
            Some(frame) => frame,
            None => self.fetch_latest(now),
        }
    }
}

/// Hours covered by a frame, for log lines.
pub fn frame_span(frame: &ForecastFrame) -> Duration {
    match (frame.rows.first(), frame.rows.last()) {
        (Some(first), Some(last)) => last.time - first.time,
        _ => Duration::zero(),
    }
}

// ============================================================================
// Tests
// ============================================================================
