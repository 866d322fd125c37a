//! Service configuration.
//!
//! Settings are read from a TOML file; every field has a default so an empty
//! file (or no file at all) yields a runnable configuration. Secrets never
//! live in the file: `DATABASE_URL` and `SMTP_PASSWORD` are read from the
//! environment after `.env` has been loaded.

use std::path::Path;

use chrono_tz::Tz;
use serde::Deserialize;
use thiserror::Error;

use crate::model::AlertThreshold;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadFile(#[source] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[source] toml::de::Error),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub historian: HistorianConfig,
    pub forecast: ForecastConfig,
    pub alarms: AlarmConfig,
    pub notify: NotifyConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Seconds between polling ticks.
    pub poll_interval_secs: u64,
    /// IANA name of the civil timezone all series are normalized to.
    pub timezone: String,
    pub log_level: String,
    pub log_file: Option<String>,
    pub console_timestamps: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            timezone: "US/Pacific".into(),
            log_level: "info".into(),
            log_file: None,
            console_timestamps: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HistorianConfig {
    /// Root of the historian web API (the `/attributes` lookup lives below it).
    pub base_url: String,
    /// Data server name used as the first segment of attribute paths.
    pub server: String,
    /// Interpolation interval passed to the historian, e.g. `"1m"`.
    pub interval: String,
    pub lookback_hours: i64,
    pub lookahead_hours: i64,
    pub timeout_secs: u64,
}

impl Default for HistorianConfig {
    fn default() -> Self {
        Self {
            base_url: "https://flows.pcwa.net/piwebapi".into(),
            server: "BUSINESSPI2".into(),
            interval: "1m".into(),
            lookback_hours: 24,
            lookahead_hours: 72,
            timeout_secs: 30,
        }
    }
}

/// Which historian tag supplies the total upstream generation forecast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationForecastSource {
    /// Reuse the downstream plant's forecasted generation.
    #[default]
    Oxbow,
    /// Use the dedicated Middle Fork + Ralston forecast tag.
    MfraTag,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ForecastConfig {
    pub base_url: String,
    /// Basin segment of the export file name (`<stamp>_<basin>_csv_export.zip`).
    pub basin: String,
    /// Minimum minutes between attempts to replace a stale cached issuance.
    pub recheck_minutes: i64,
    pub generation_source: GenerationForecastSource,
    /// Continuous-compliance mode: hold Ralston at or above its Pmin share.
    pub ccs_mode: bool,
    pub recreation_release: bool,
    /// First and last civil hour (inclusive) of the recreational release.
    pub recreation_start_hour: u32,
    pub recreation_end_hour: u32,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.cnrfc.noaa.gov".into(),
            basin: "american".into(),
            recheck_minutes: 60,
            generation_source: GenerationForecastSource::Oxbow,
            ccs_mode: false,
            recreation_release: true,
            recreation_start_hour: 8,
            recreation_end_hour: 11,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlarmConfig {
    /// Trailing window, in minutes, over which hi/lo extremes are taken.
    pub window_minutes: i64,
    /// Points with |z| at or above this are dropped before evaluation.
    /// `None` disables the spike filter.
    pub spike_z_threshold: Option<f64>,
    /// Setpoint movement, in feet, that counts as a float change.
    pub float_change_tolerance_ft: f64,
    /// Thresholds used when no database is configured.
    pub users: Vec<UserThresholdConfig>,
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            window_minutes: 60,
            spike_z_threshold: Some(3.0),
            float_change_tolerance_ft: 0.5,
            users: Vec::new(),
        }
    }
}

/// A file-configured user: thresholds plus contact details.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserThresholdConfig {
    pub email: Option<String>,
    pub phone: Option<String>,
    #[serde(flatten)]
    pub threshold: AlertThreshold,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// SMTP relay; when absent notifications are only logged.
    pub smtp_host: Option<String>,
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub from_address: String,
    /// Carrier e-mail-to-SMS domain appended to phone numbers.
    pub sms_gateway: String,
    /// Organization name used in subjects.
    pub organization: String,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            smtp_host: None,
            smtp_port: 587,
            smtp_username: None,
            from_address: "alarms@localhost".into(),
            sms_gateway: "mms.att.net".into(),
            organization: "PCWA".into(),
        }
    }
}

impl Config {
    /// Loads and validates a config file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadFile)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Parsed civil timezone. Only valid after `validate`.
    pub fn civil_tz(&self) -> Result<Tz, ConfigError> {
        self.service
            .timezone
            .parse::<Tz>()
            .map_err(|e| ConfigError::InvalidValue {
                field: "service.timezone",
                reason: e.to_string(),
            })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.service.poll_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "service.poll_interval_secs",
                reason: "must be greater than zero".into(),
            });
        }
        if self.historian.base_url.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "historian.base_url",
                reason: "cannot be empty".into(),
            });
        }
        if self.historian.lookback_hours <= 0 {
            return Err(ConfigError::InvalidValue {
                field: "historian.lookback_hours",
                reason: "must be positive".into(),
            });
        }
        let f = &self.forecast;
        if f.recreation_start_hour > 23 || f.recreation_end_hour > 23 {
            return Err(ConfigError::InvalidValue {
                field: "forecast.recreation_start_hour",
                reason: "hours must be within 0..=23".into(),
            });
        }
        if f.recreation_start_hour > f.recreation_end_hour {
            return Err(ConfigError::InvalidValue {
                field: "forecast.recreation_start_hour",
                reason: format!(
                    "start hour {} is after end hour {}",
                    f.recreation_start_hour, f.recreation_end_hour
                ),
            });
        }
        if self.alarms.float_change_tolerance_ft <= 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "alarms.float_change_tolerance_ft",
                reason: "must be positive".into(),
            });
        }
        self.civil_tz()?;
        Ok(())
    }
}

/// Secrets read from the environment (after `dotenv`).
#[derive(Debug, Clone, Default)]
pub struct Secrets {
    pub database_url: Option<String>,
    pub smtp_password: Option<String>,
}

impl Secrets {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            smtp_password: std::env::var("SMTP_PASSWORD").ok().filter(|s| !s.is_empty()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
