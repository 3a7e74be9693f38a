//! Batching email notification manager.

use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, warn};

use crate::Notifier;
use crate::sink::{Email, MailSink};

pub type NotifyResult<T> = Result<T, NotifyError>;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("failed to deliver notification batch: {0}")]
    Delivery(#[from] anyhow::Error),
}

const SEPARATOR: &str = "\n----------------------------------------\n";

#[derive(Debug, Clone)]
struct QueuedNotice {
    subject: String,
    message: String,
}

#[derive(Debug)]
struct Inner {
    from: String,
    to: Vec<String>,
    queue: Vec<QueuedNotice>,
}

/// Collects notices between ticks and sends them as a single mail.
pub struct EmailNotificationManager {
    inner: Mutex<Inner>,
    sink: Arc<dyn MailSink>,
}

impl EmailNotificationManager {
    pub fn new(from: impl Into<String>, to: Vec<String>, sink: Arc<dyn MailSink>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                from: from.into(),
                to,
                queue: Vec::new(),
            }),
            sink,
        }
    }

    /// Number of notices waiting for the next batch.
    pub fn queued(&self) -> usize {
        self.lock().queue.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Notifier for EmailNotificationManager {
    fn set_recipients(&self, from: &str, to: &[String]) {
        let mut inner = self.lock();
        inner.from = from.to_string();
        inner.to = to.to_vec();
    }

    fn enqueue_notify_email(&self, subject: &str, message: &str) {
        warn!(%subject, "queueing notification");
        self.lock().queue.push(QueuedNotice {
            subject: subject.to_string(),
            message: message.to_string(),
        });
    }

    fn send_queued_emails(&self) -> NotifyResult<()> {
        let (email, count) = {
            let mut inner = self.lock();
            if inner.queue.is_empty() {
                return Ok(());
            }
            let notices = std::mem::take(&mut inner.queue);
            if inner.to.is_empty() {
                debug!(
                    count = notices.len(),
                    "no notification recipients configured, dropping batch"
                );
                return Ok(());
            }

            let subject = match notices.as_slice() {
                [single] => single.subject.clone(),
                many => format!("Scheduler notifications ({} notices)", many.len()),
            };
            let body = notices
                .iter()
                .map(|n| format!("{}\n\n{}", n.subject, n.message))
                .collect::<Vec<_>>()
                .join(SEPARATOR);
            let email = Email {
                from: inner.from.clone(),
                to: inner.to.clone(),
                subject,
                body,
            };
            (email, notices.len())
        };

        self.sink.deliver(&email)?;
        debug!(count, "notification batch sent");
        Ok(())
    }
}
