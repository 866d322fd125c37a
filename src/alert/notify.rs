//! Alarm notifications.
//!
//! Every active, unsent alarm is formatted into one message and handed to a
//! `Notifier`. A successful hand-off marks the row sent; a failed one leaves
//! it unsent for the next pass. Delivery itself is not tracked.

use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::alert::store::{AlarmStore, StoreError, UserDirectory};
use crate::config::NotifyConfig;
use crate::logging::DataSource;
use crate::model::{Contact, IssuedAlarm};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Invalid address '{0}'")]
    Address(String),
    #[error("No recipient for owner {0}")]
    NoRecipient(i64),
    #[error("Failed to build message: {0}")]
    Build(String),
    #[error("Transport error: {0}")]
    Transport(String),
}

/// One message to one user.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub owner: i64,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub subject: String,
    pub body: String,
}

/// `"PCWA Alarm For R4"` for trigger `r4_hi`.
pub fn format_subject(organization: &str, trigger: &str) -> String {
    let quantity = trigger.split('_').next().unwrap_or(trigger).to_uppercase();
    format!("{} Alarm For {}", organization, quantity)
}

pub fn format_body(alarm: &IssuedAlarm) -> String {
    format!(
        "{} triggered this alert \nCurrent Value: {} \nYour threshold: {}",
        alarm.trigger, alarm.trigger_value, alarm.setpoint
    )
}

pub fn build_notification(alarm: &IssuedAlarm, contact: &Contact, organization: &str) -> Notification {
    Notification {
        owner: alarm.owner,
        email: contact.email.clone(),
        phone: contact.phone.clone(),
        subject: format_subject(organization, &alarm.trigger),
        body: format_body(alarm),
    }
}

pub trait Notifier {
    fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

// ---------------------------------------------------------------------------
// SMTP transport
// ---------------------------------------------------------------------------

/// Sends mail through an SMTP relay. The user's address and their phone's
/// e-mail-to-SMS address are both blind-copied.
pub struct SmtpNotifier {
    transport: SmtpTransport,
    from: Mailbox,
    sms_gateway: String,
}

impl SmtpNotifier {
    pub fn new(config: &NotifyConfig, host: &str, password: Option<&str>) -> Result<Self, NotifyError> {
        let from: Mailbox = config
            .from_address
            .parse()
            .map_err(|_| NotifyError::Address(config.from_address.clone()))?;

        let mut builder = SmtpTransport::starttls_relay(host)
            .map_err(|e| NotifyError::Transport(e.to_string()))?
            .port(config.smtp_port);
        if let (Some(user), Some(password)) = (&config.smtp_username, password) {
            builder = builder.credentials(Credentials::new(user.clone(), password.to_string()));
        }

        Ok(Self {
            transport: builder.build(),
            from,
            sms_gateway: config.sms_gateway.clone(),
        })
    }

    /// Mail addresses for a notification, SMS gateway address last.
    pub fn recipients(&self, notification: &Notification) -> Vec<String> {
        sms_recipients(notification, &self.sms_gateway)
    }
}

/// Email address plus `<digits>@<gateway>` for the phone, when present.
pub fn sms_recipients(notification: &Notification, gateway: &str) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(email) = notification.email.as_deref().filter(|e| !e.trim().is_empty()) {
        out.push(email.trim().to_string());
    }
    if let Some(phone) = &notification.phone {
        let digits: String = phone.chars().filter(char::is_ascii_digit).collect();
        if !digits.is_empty() {
            out.push(format!("{}@{}", digits, gateway));
        }
    }
    out
}

impl Notifier for SmtpNotifier {
    fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let recipients = self.recipients(notification);
        if recipients.is_empty() {
            return Err(NotifyError::NoRecipient(notification.owner));
        }

        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(notification.subject.clone())
            .header(ContentType::TEXT_PLAIN);
        for recipient in &recipients {
            let mailbox: Mailbox = recipient
                .parse()
                .map_err(|_| NotifyError::Address(recipient.clone()))?;
            builder = builder.bcc(mailbox);
        }
        let message = builder
            .body(notification.body.clone())
            .map_err(|e| NotifyError::Build(e.to_string()))?;

        self.transport
            .send(&message)
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        Ok(())
    }
}

/// Logs instead of sending; used when no SMTP relay is configured.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        info!(
            source = %DataSource::Notify,
            owner = notification.owner,
            subject = %notification.subject,
            body = %notification.body,
            "Notification (log only)"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DispatchReport {
    pub sent: Vec<i64>,
    pub failed: Vec<i64>,
}

/// Hands every pending alarm to `notifier` once. Rows are marked sent only
/// after a successful hand-off.
pub fn dispatch_pending(
    store: &mut dyn AlarmStore,
    directory: &dyn UserDirectory,
    notifier: &dyn Notifier,
    organization: &str,
) -> Result<DispatchReport, StoreError> {
    let mut report = DispatchReport::default();
    for alarm in store.pending()? {
        let contact = match directory.contact(alarm.owner) {
            Ok(Some(contact)) => contact,
            Ok(None) => Contact { owner: alarm.owner, ..Default::default() },
            Err(e) => {
                warn!(source = %DataSource::Notify, owner = alarm.owner, error = %e, "Contact lookup failed");
                report.failed.push(alarm.id);
                continue;
            }
        };

        let notification = build_notification(&alarm, &contact, organization);
        match notifier.send(&notification) {
            Ok(()) => {
                store.mark_sent(alarm.id)?;
                info!(
                    source = %DataSource::Notify,
                    owner = alarm.owner,
                    trigger = %alarm.trigger,
                    "Alarm notification sent"
                );
                report.sent.push(alarm.id);
            }
            Err(e) => {
                error!(
                    source = %DataSource::Notify,
                    owner = alarm.owner,
                    trigger = %alarm.trigger,
                    error = %e,
                    "Alarm notification failed"
                );
                report.failed.push(alarm.id);
            }
        }
    }
    Ok(report)
}
