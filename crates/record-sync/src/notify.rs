// File: record-sync/src/notify.rs
// Purpose: User-facing notices raised by subscriptions

/// Severity of a notice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// A message meant for the person using the form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub title: String,
    pub message: String,
}

impl Notice {
    pub fn new(level: NoticeLevel, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            title: title.into(),
            message: message.into(),
        }
    }

    /// Raised when the record open in a form is deleted elsewhere
    pub fn record_deleted(table: &str, id: &str) -> Self {
        Self::new(
            NoticeLevel::Warning,
            "Record deleted",
            format!("{} '{}' was deleted by another user", table, id),
        )
    }
}

/// Toast/notification surface
pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Notifier that writes notices to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notice: Notice) {
        match notice.level {
            NoticeLevel::Info => tracing::info!("{}: {}", notice.title, notice.message),
            NoticeLevel::Warning => tracing::warn!("{}: {}", notice.title, notice.message),
            NoticeLevel::Error => tracing::error!("{}: {}", notice.title, notice.message),
        }
    }
}
