//! What the surrounding editor provides to the client.
//!
//! Locating the dprint executable and config file, deciding which files are
//! eligible and showing notifications all belong to the host application.

use std::path::{Path, PathBuf};

use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Info,
    Warning,
    Error,
}

/// A user-visible message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
}

impl Notification {
    pub fn error(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: NotificationKind::Error,
            title: title.into(),
            message: message.into(),
        }
    }
}

/// Collaborators consumed by the lifecycle manager.
pub trait EditorHost: Send + Sync {
    /// Path of the dprint config file, if one was found.
    fn config_path(&self) -> Option<PathBuf>;

    /// Path of the dprint executable, if one was found.
    fn executable_path(&self) -> Option<PathBuf>;

    /// Whether `path` should be sent to the daemon at all.
    fn is_eligible(&self, _path: &Path) -> bool {
        true
    }

    /// Files currently open in the editor, re-checked after a restart.
    fn open_files(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    fn notify(&self, notification: Notification);
}

/// Host with fixed paths that logs notifications. Used by the binary.
#[derive(Debug, Clone)]
pub struct StaticHost {
    executable: PathBuf,
    config: PathBuf,
    open_files: Vec<PathBuf>,
}

impl StaticHost {
    pub fn new(executable: impl Into<PathBuf>, config: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            config: config.into(),
            open_files: Vec::new(),
        }
    }

    pub fn with_open_files(mut self, files: Vec<PathBuf>) -> Self {
        self.open_files = files;
        self
    }
}

impl EditorHost for StaticHost {
    fn config_path(&self) -> Option<PathBuf> {
        Some(self.config.clone())
    }

    fn executable_path(&self) -> Option<PathBuf> {
        Some(self.executable.clone())
    }

    fn open_files(&self) -> Vec<PathBuf> {
        self.open_files.clone()
    }

    fn notify(&self, notification: Notification) {
        match notification.kind {
            NotificationKind::Info => info!("{}: {}", notification.title, notification.message),
            NotificationKind::Warning => warn!("{}: {}", notification.title, notification.message),
            NotificationKind::Error => error!("{}: {}", notification.title, notification.message),
        }
    }
}
