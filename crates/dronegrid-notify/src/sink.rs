//! Mail delivery backends.

use std::sync::Mutex;

use tracing::info;

/// A fully assembled notification mail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
}

/// Delivers assembled mails. SMTP and friends live behind this trait.
pub trait MailSink: Send + Sync {
    fn deliver(&self, email: &Email) -> anyhow::Result<()>;
}

/// Writes mails to the tracing log instead of sending them.
#[derive(Debug, Default)]
pub struct LogMailSink;

impl MailSink for LogMailSink {
    fn deliver(&self, email: &Email) -> anyhow::Result<()> {
        info!(
            to = %email.to.join(", "),
            subject = %email.subject,
            body = %email.body,
            "notification email"
        );
        Ok(())
    }
}

/// Keeps delivered mails in memory.
#[derive(Debug, Default)]
pub struct MemoryMailSink {
    sent: Mutex<Vec<Email>>,
}

impl MemoryMailSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mails delivered so far, oldest first.
    pub fn sent(&self) -> Vec<Email> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl MailSink for MemoryMailSink {
    fn deliver(&self, email: &Email) -> anyhow::Result<()> {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(email.clone());
        Ok(())
    }
}
