//! User-facing advisories, decoupled from any UI surface.
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoticeAction {
    OpenFile(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub severity: Severity,
    pub message: String,
    pub action: Option<NoticeAction>,
}

impl Notice {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Info,
            message: message.into(),
            action: None,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            message: message.into(),
            action: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
            action: None,
        }
    }

    pub fn with_action(mut self, action: NoticeAction) -> Self {
        self.action = Some(action);
        self
    }
}

/// Fire-and-forget sink for notices.
pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Writes notices to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notice: Notice) {
        match notice.severity {
            Severity::Info => info!(action = ?notice.action, "{}", notice.message),
            Severity::Warning => warn!(action = ?notice.action, "{}", notice.message),
            Severity::Error => error!(action = ?notice.action, "{}", notice.message),
        }
    }
}

/// Buffers notices until a front end drains them.
#[derive(Debug, Default)]
pub struct QueueNotifier {
    queue: Mutex<Vec<Notice>>,
}

impl QueueNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<Notice> {
        self.queue
            .lock()
            .map(|mut q| std::mem::take(&mut *q))
            .unwrap_or_default()
    }
}

impl Notifier for QueueNotifier {
    fn notify(&self, notice: Notice) {
        if let Ok(mut q) = self.queue.lock() {
            q.push(notice);
        }
    }
}
