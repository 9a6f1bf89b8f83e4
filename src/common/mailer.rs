//! Completion-notification contract.
//!
//! The engine only needs "send a message to these recipients"; actual SMTP
//! delivery lives behind the [`Mailman`] trait. Delivery problems are never
//! allowed to take down a scheduler, hence [`send_email_if_possible`].

use std::sync::Mutex;

/// Outbound mail contract consumed by the scheduler and executor.
pub trait Mailman: Send + Sync {
    /// Send a message. `from` may be `None` when the job descriptor does not
    /// name a sender; implementations pick their configured default.
    fn send_email(
        &self,
        from: Option<&str>,
        to: &[String],
        subject: &str,
        body: &str,
    ) -> Result<(), anyhow::Error>;
}

/// Best-effort send: failures are logged and swallowed.
pub fn send_email_if_possible(
    mailman: &dyn Mailman,
    from: Option<&str>,
    to: &[String],
    subject: &str,
    body: &str,
) {
    if to.is_empty() {
        return;
    }
    if let Err(e) = mailman.send_email(from, to, subject, body) {
        log::error!("Failed to send email [{subject}] to {to:?}: {e:#}");
    }
}

/// A [`Mailman`] that just logs the message. Useful as a default wiring and
/// in environments with no mail relay.
#[derive(Debug, Default)]
pub struct LoggingMailman;

impl Mailman for LoggingMailman {
    fn send_email(
        &self,
        from: Option<&str>,
        to: &[String],
        subject: &str,
        body: &str,
    ) -> Result<(), anyhow::Error> {
        log::info!(
            "Mail from[{}] to{:?} subject[{}]:\n{}",
            from.unwrap_or("<default>"),
            to,
            subject,
            body
        );
        Ok(())
    }
}

/// Records every message; test support for asserting on notifications.
#[derive(Debug, Default)]
pub struct RecordingMailman {
    messages: Mutex<Vec<RecordedMail>>,
}

/// One captured message.
#[derive(Debug, Clone)]
pub struct RecordedMail {
    pub from: Option<String>,
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
}

impl RecordingMailman {
    pub fn messages(&self) -> Vec<RecordedMail> {
        self.messages.lock().unwrap().clone()
    }
}

impl Mailman for RecordingMailman {
    fn send_email(
        &self,
        from: Option<&str>,
        to: &[String],
        subject: &str,
        body: &str,
    ) -> Result<(), anyhow::Error> {
        self.messages.lock().unwrap().push(RecordedMail {
            from: from.map(str::to_string),
            to: to.to_vec(),
            subject: subject.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }
}
