/// Postgres adapter for the alarm collaborators
///
/// `alert_prefs` and `profiles` are read into a `StaticDirectory` snapshot at
/// the start of each tick; `issued_alarms` backs `PgAlarmStore`. The schema
/// is in `sql/001_alarm_schema.sql`.

use chrono::{DateTime, Utc};
use postgres::{Client, NoTls, Row};
use tracing::{debug, info};

use crate::alert::store::{AlarmStore, NewAlarm, StaticDirectory, StoreError};
use crate::config::UserThresholdConfig;
use crate::logging::DataSource;
use crate::model::{AlertThreshold, IssuedAlarm};

const ALARM_COLUMNS: &str = "id, owner, alarm_trigger, alarm_setpoint, trigger_value, \
     trigger_time, alarm_sent, alarm_still_active, seen_on_website";

pub fn connect(database_url: &str) -> Result<Client, StoreError> {
    let client = Client::connect(database_url, NoTls)?;
    info!(source = %DataSource::Database, "Connected to alarm database");
    Ok(client)
}

/// Tables the service reads or writes.
pub const REQUIRED_TABLES: &[&str] = &["profiles", "alert_prefs", "issued_alarms"];

/// Connects and checks that the alarm schema has been applied.
pub fn connect_and_verify(database_url: &str) -> Result<Client, StoreError> {
    let mut client = connect(database_url)?;
    let wanted: Vec<&str> = REQUIRED_TABLES.to_vec();
    let rows = client.query(
        "SELECT table_name::text FROM information_schema.tables
         WHERE table_schema = current_schema() AND table_name = ANY($1)",
        &[&wanted],
    )?;
    let found: Vec<String> = rows.iter().map(|r| r.get(0)).collect();
    let missing: Vec<&str> = wanted
        .into_iter()
        .filter(|t| !found.iter().any(|f| f == t))
        .collect();
    if !missing.is_empty() {
        return Err(StoreError::Database(format!(
            "missing tables {:?}; apply sql/001_alarm_schema.sql",
            missing
        )));
    }
    Ok(client)
}

fn alarm_from_row(row: &Row) -> Result<IssuedAlarm, StoreError> {
    Ok(IssuedAlarm {
        id: row.try_get("id")?,
        owner: row.try_get("owner")?,
        trigger: row.try_get("alarm_trigger")?,
        setpoint: row.try_get("alarm_setpoint")?,
        trigger_value: row.try_get("trigger_value")?,
        trigger_time: row.try_get::<_, DateTime<Utc>>("trigger_time")?,
        sent: row.try_get("alarm_sent")?,
        still_active: row.try_get("alarm_still_active")?,
        seen_on_website: row.try_get("seen_on_website")?,
    })
}

/// Flow bounds are stored as INTEGER columns.
fn int_bound(row: &Row, column: &str) -> Result<Option<i64>, StoreError> {
    Ok(row.try_get::<_, Option<i32>>(column)?.map(i64::from))
}

fn user_from_row(row: &Row) -> Result<UserThresholdConfig, StoreError> {
    let threshold = AlertThreshold {
        owner: row.try_get("owner")?,
        afterbay_hi: row.try_get("afterbay_hi")?,
        afterbay_lo: row.try_get("afterbay_lo")?,
        oxbow_deviation: row.try_get("oxbow_deviation")?,
        r4_hi: int_bound(row, "r4_hi")?,
        r4_lo: int_bound(row, "r4_lo")?,
        r30_hi: int_bound(row, "r30_hi")?,
        r30_lo: int_bound(row, "r30_lo")?,
        r11_hi: int_bound(row, "r11_hi")?,
        r11_lo: int_bound(row, "r11_lo")?,
    };
    Ok(UserThresholdConfig {
        email: row.try_get("email")?,
        phone: row.try_get("phone_number")?,
        threshold,
    })
}

/// Reads every user with an `alert_prefs` row, together with their contact
/// details.
pub fn load_directory(client: &mut Client) -> Result<StaticDirectory, StoreError> {
    let rows = client.query(
        "
        SELECT a.owner, p.email, p.phone_number,
               a.afterbay_hi, a.afterbay_lo, a.oxbow_deviation,
               a.r4_hi, a.r4_lo, a.r30_hi, a.r30_lo, a.r11_hi, a.r11_lo
        FROM alert_prefs a
        JOIN profiles p ON p.owner = a.owner
        ORDER BY a.owner
        ",
        &[],
    )?;

    let users = rows.iter().map(user_from_row).collect::<Result<Vec<_>, _>>()?;
    debug!(source = %DataSource::Database, users = users.len(), "Loaded alert preferences");
    Ok(StaticDirectory::new(users))
}

// ---------------------------------------------------------------------------
// issued_alarms
// ---------------------------------------------------------------------------

pub struct PgAlarmStore {
    client: Client,
}

impl PgAlarmStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn connect(database_url: &str) -> Result<Self, StoreError> {
        Ok(Self::new(connect_and_verify(database_url)?))
    }

    /// The underlying connection, for reading the user directory.
    pub fn client(&mut self) -> &mut Client {
        &mut self.client
    }

    fn query_alarms(
        &mut self,
        filter: &str,
        params: &[&(dyn postgres::types::ToSql + Sync)],
    ) -> Result<Vec<IssuedAlarm>, StoreError> {
        let sql = format!("SELECT {ALARM_COLUMNS} FROM issued_alarms WHERE {filter} ORDER BY id");
        self.client.query(&sql, params)?.iter().map(alarm_from_row).collect()
    }

    fn update_one(&mut self, sql: &str, id: i64) -> Result<(), StoreError> {
        match self.client.execute(sql, &[&id])? {
            0 => Err(StoreError::NotFound(id)),
            _ => Ok(()),
        }
    }
}

impl AlarmStore for PgAlarmStore {
    fn get_or_create(&mut self, alarm: &NewAlarm<'_>) -> Result<(IssuedAlarm, bool), StoreError> {
        let mut tx = self.client.transaction()?;

        let existing = tx.query_opt(
            &format!(
                "SELECT {ALARM_COLUMNS} FROM issued_alarms
                 WHERE owner = $1 AND alarm_trigger = $2 AND alarm_setpoint = $3
                   AND alarm_still_active
                 FOR UPDATE"
            ),
            &[&alarm.owner, &alarm.trigger, &alarm.setpoint],
        )?;

        let result = match existing {
            Some(row) => (alarm_from_row(&row)?, false),
            None => {
                let row = tx.query_one(
                    &format!(
                        "INSERT INTO issued_alarms
                             (owner, alarm_trigger, alarm_setpoint, trigger_value, trigger_time)
                         VALUES ($1, $2, $3, $4, $5)
                         RETURNING {ALARM_COLUMNS}"
                    ),
                    &[
                        &alarm.owner,
                        &alarm.trigger,
                        &alarm.setpoint,
                        &alarm.trigger_value,
                        &alarm.trigger_time,
                    ],
                )?;
                (alarm_from_row(&row)?, true)
            }
        };

        tx.commit()?;
        Ok(result)
    }

    fn active(&mut self, trigger: &str) -> Result<Vec<IssuedAlarm>, StoreError> {
        self.query_alarms("alarm_trigger = $1 AND alarm_still_active", &[&trigger])
    }

    fn deactivate(&mut self, id: i64) -> Result<(), StoreError> {
        self.update_one("UPDATE issued_alarms SET alarm_still_active = FALSE WHERE id = $1", id)
    }

    fn pending(&mut self) -> Result<Vec<IssuedAlarm>, StoreError> {
        self.query_alarms("alarm_still_active AND NOT alarm_sent", &[])
    }

    fn mark_sent(&mut self, id: i64) -> Result<(), StoreError> {
        self.update_one("UPDATE issued_alarms SET alarm_sent = TRUE WHERE id = $1", id)
    }
}
