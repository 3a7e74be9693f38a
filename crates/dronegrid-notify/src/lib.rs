//! dronegrid-notify — batched scheduler failure notifications.
//!
//! The scheduler never delivers mail itself. Components enqueue notices on
//! an injected [`Notifier`] as they happen, and the dispatcher flushes the
//! batch once per tick. Delivery is delegated to a [`MailSink`].

pub mod manager;
pub mod sink;

pub use manager::{EmailNotificationManager, NotifyError, NotifyResult};
pub use sink::{Email, LogMailSink, MailSink, MemoryMailSink};

/// Enqueue/flush contract for scheduler failure notices.
pub trait Notifier: Send + Sync {
    /// Queue a notice for the next batch.
    fn enqueue_notify_email(&self, subject: &str, message: &str);

    /// Deliver everything queued so far as one batch.
    fn send_queued_emails(&self) -> NotifyResult<()>;

    /// Swap sender and recipients after a configuration reload.
    fn set_recipients(&self, _from: &str, _to: &[String]) {}
}
