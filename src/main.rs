/// Afterbay forecast and alarm daemon
///
/// Polls the historian on a fixed interval, keeps the natural-flow forecast
/// cached between ticks, and raises user alarms. With `DATABASE_URL` set the
/// alarm state and user preferences live in Postgres; otherwise thresholds
/// come from `[[alarms.users]]` and alarm state is kept in memory.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tracing::{error, info, warn};

use abay_service::alert::notify::{LogNotifier, Notifier, SmtpNotifier};
use abay_service::alert::store::{InMemoryAlarmStore, StaticDirectory, StoreError, UserDirectory};
use abay_service::config::{Config, Secrets};
use abay_service::db::{self, PgAlarmStore};
use abay_service::forecast::frame::ForecastCache;
use abay_service::ingest::cnrfc::{CnrfcClient, CnrfcSettings};
use abay_service::ingest::historian::{HistorianClient, HistorianSettings};
use abay_service::ingest::{ForecastSource, TelemetrySource};
use abay_service::logging::{DataSource, init_logger};
use abay_service::model::{AlertThreshold, Contact};
use abay_service::tick::{TickContext, TickOutput, TickSettings, run_tick};
use abay_service::verify;

#[derive(Parser, Debug)]
#[command(name = "abay_service", about = "Afterbay forecast and alarm service")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "abay.toml")]
    config: PathBuf,

    /// Run a single tick and print its report as JSON.
    #[arg(long)]
    once: bool,

    /// Check every roster meter against the historian and exit.
    #[arg(long, conflicts_with = "once")]
    verify: bool,
}

/// Stands in for the database directory when it cannot be read this tick,
/// so the evaluator leaves alarm state alone.
struct UnavailableDirectory(String);

impl UserDirectory for UnavailableDirectory {
    fn thresholds(&self) -> Result<Vec<AlertThreshold>, StoreError> {
        Err(StoreError::Database(self.0.clone()))
    }

    fn contact(&self, _owner: i64) -> Result<Option<Contact>, StoreError> {
        Err(StoreError::Database(self.0.clone()))
    }
}

enum Backend {
    Postgres(PgAlarmStore),
    Memory {
        store: InMemoryAlarmStore,
        directory: StaticDirectory,
    },
}

impl Backend {
    fn open(secrets: &Secrets, config: &Config) -> Result<Self> {
        match &secrets.database_url {
            Some(url) => {
                let store = PgAlarmStore::connect(url).context("connecting to alarm database")?;
                Ok(Backend::Postgres(store))
            }
            None => {
                warn!(
                    source = %DataSource::System,
                    users = config.alarms.users.len(),
                    "DATABASE_URL not set; alarm state is kept in memory"
                );
                Ok(Backend::Memory {
                    store: InMemoryAlarmStore::new(),
                    directory: StaticDirectory::new(config.alarms.users.clone()),
                })
            }
        }
    }

    fn tick(
        &mut self,
        telemetry: &dyn TelemetrySource,
        forecast: &dyn ForecastSource,
        notifier: &dyn Notifier,
        cache: ForecastCache,
        settings: &TickSettings,
    ) -> TickOutput {
        let now = Utc::now();
        match self {
            Backend::Postgres(store) => {
                let directory: Box<dyn UserDirectory> = match db::load_directory(store.client()) {
                    Ok(directory) => Box::new(directory),
                    Err(e) => {
                        error!(source = %DataSource::Database, error = %e, "Failed to load alert preferences");
                        Box::new(UnavailableDirectory(e.to_string()))
                    }
                };
                let ctx = TickContext {
                    telemetry,
                    forecast,
                    store,
                    directory: directory.as_ref(),
                    notifier,
                };
                run_tick(ctx, cache, settings, now)
            }
            Backend::Memory { store, directory } => {
                let ctx = TickContext { telemetry, forecast, store, directory: &*directory, notifier };
                run_tick(ctx, cache, settings, now)
            }
        }
    }
}

fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        Config::load(path).with_context(|| format!("loading {}", path.display()))
    } else {
        eprintln!("{} not found, using defaults", path.display());
        Ok(Config::from_toml("")?)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    init_logger(
        &config.service.log_level,
        config.service.log_file.as_deref(),
        config.service.console_timestamps,
    );

    let tz = config.civil_tz()?;
    let historian_settings = HistorianSettings::from_config(&config.historian, tz);

    if cli.verify {
        let report = verify::run_verification(historian_settings, Utc::now())?;
        verify::print_summary(&report);
        return Ok(());
    }

    let secrets = Secrets::from_env();
    let settings = TickSettings::from_config(&config)?;
    let historian = HistorianClient::new(historian_settings)?;
    let cnrfc = CnrfcClient::new(CnrfcSettings::from_config(&config.forecast, tz))?;

    let notifier: Box<dyn Notifier> = match &config.notify.smtp_host {
        Some(host) => Box::new(SmtpNotifier::new(&config.notify, host, secrets.smtp_password.as_deref())?),
        None => {
            warn!(source = %DataSource::Notify, "No SMTP host configured; notifications are only logged");
            Box::new(LogNotifier)
        }
    };

    let mut backend = Backend::open(&secrets, &config)?;
    info!(
        source = %DataSource::System,
        poll_interval_secs = config.service.poll_interval_secs,
        timezone = %tz,
        "Afterbay service started"
    );

    let mut cache = ForecastCache::empty();
    loop {
        let output = backend.tick(&historian, &cnrfc, notifier.as_ref(), cache, &settings);
        if cli.once {
            println!("{}", serde_json::to_string_pretty(&output.report())?);
            return Ok(());
        }
        cache = output.cache;
        thread::sleep(Duration::from_secs(config.service.poll_interval_secs));
    }
}
