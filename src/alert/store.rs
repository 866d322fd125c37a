//! Persisted alarm state and user directory interfaces.
//!
//! The evaluator only talks to these traits. `InMemoryAlarmStore` and
//! `StaticDirectory` back them when no database is configured (and in tests);
//! `db` provides the Postgres store and fills a `StaticDirectory` from it.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::config::UserThresholdConfig;
use crate::model::{AlertThreshold, Contact, IssuedAlarm};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("No alarm with id {0}")]
    NotFound(i64),
}

impl From<postgres::Error> for StoreError {
    fn from(e: postgres::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Fields of an alarm about to be created.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAlarm<'a> {
    pub owner: i64,
    pub trigger: &'a str,
    pub setpoint: f64,
    pub trigger_value: f64,
    pub trigger_time: DateTime<Utc>,
}

pub trait AlarmStore {
    /// Returns the active row for (owner, trigger, setpoint), creating it
    /// unsent if none exists. The flag is `true` when a row was created.
    fn get_or_create(&mut self, alarm: &NewAlarm<'_>) -> Result<(IssuedAlarm, bool), StoreError>;

    /// Active rows for a trigger key.
    fn active(&mut self, trigger: &str) -> Result<Vec<IssuedAlarm>, StoreError>;

    fn deactivate(&mut self, id: i64) -> Result<(), StoreError>;

    /// Active rows not yet handed to the transport.
    fn pending(&mut self) -> Result<Vec<IssuedAlarm>, StoreError>;

    fn mark_sent(&mut self, id: i64) -> Result<(), StoreError>;
}

/// Read-only view of user preferences and contact details.
pub trait UserDirectory {
    fn thresholds(&self) -> Result<Vec<AlertThreshold>, StoreError>;
    fn contact(&self, owner: i64) -> Result<Option<Contact>, StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory implementations
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct InMemoryAlarmStore {
    rows: Vec<IssuedAlarm>,
    next_id: i64,
}

impl InMemoryAlarmStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every row ever issued, active or not.
    pub fn rows(&self) -> &[IssuedAlarm] {
        &self.rows
    }

    fn row_mut(&mut self, id: i64) -> Result<&mut IssuedAlarm, StoreError> {
        self.rows
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(StoreError::NotFound(id))
    }
}

impl AlarmStore for InMemoryAlarmStore {
    fn get_or_create(&mut self, alarm: &NewAlarm<'_>) -> Result<(IssuedAlarm, bool), StoreError> {
        if let Some(existing) = self.rows.iter().find(|r| {
            r.still_active
                && r.owner == alarm.owner
                && r.trigger == alarm.trigger
                && r.setpoint == alarm.setpoint
        }) {
            return Ok((existing.clone(), false));
        }

        self.next_id += 1;
        let row = IssuedAlarm {
            id: self.next_id,
            owner: alarm.owner,
            trigger: alarm.trigger.to_string(),
            setpoint: alarm.setpoint,
            trigger_value: alarm.trigger_value,
            trigger_time: alarm.trigger_time,
            sent: false,
            still_active: true,
            seen_on_website: false,
        };
        self.rows.push(row.clone());
        Ok((row, true))
    }

    fn active(&mut self, trigger: &str) -> Result<Vec<IssuedAlarm>, StoreError> {
        Ok(self
            .rows
            .iter()
            .filter(|r| r.still_active && r.trigger == trigger)
            .cloned()
            .collect())
    }

    fn deactivate(&mut self, id: i64) -> Result<(), StoreError> {
        self.row_mut(id)?.still_active = false;
        Ok(())
    }

    fn pending(&mut self) -> Result<Vec<IssuedAlarm>, StoreError> {
        Ok(self
            .rows
            .iter()
            .filter(|r| r.still_active && !r.sent)
            .cloned()
            .collect())
    }

    fn mark_sent(&mut self, id: i64) -> Result<(), StoreError> {
        self.row_mut(id)?.sent = true;
        Ok(())
    }
}

/// A fixed set of users, from the config file or a per-tick database read.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    users: Vec<UserThresholdConfig>,
}

impl StaticDirectory {
    pub fn new(users: Vec<UserThresholdConfig>) -> Self {
        Self { users }
    }
}

impl UserDirectory for StaticDirectory {
    fn thresholds(&self) -> Result<Vec<AlertThreshold>, StoreError> {
        Ok(self.users.iter().map(|u| u.threshold.clone()).collect())
    }

    fn contact(&self, owner: i64) -> Result<Option<Contact>, StoreError> {
        Ok(self
            .users
            .iter()
            .find(|u| u.threshold.owner == owner)
            .map(|u| Contact { owner, email: u.email.clone(), phone: u.phone.clone() }))
    }
}
