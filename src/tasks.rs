//! De-duplication of in-flight lifecycle tasks.
//!
//! A task is keyed by its kind, file path and format id. While a guard for a
//! key is alive, a second request with the same key is refused.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Initialise,
    CanFormat,
    Format,
    Cancel,
    Restart,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskKey {
    pub kind: TaskKind,
    pub path: Option<PathBuf>,
    pub id: Option<u32>,
}

impl TaskKey {
    pub fn new(kind: TaskKind) -> Self {
        Self {
            kind,
            path: None,
            id: None,
        }
    }

    pub fn for_path(kind: TaskKind, path: &Path) -> Self {
        Self {
            kind,
            path: Some(path.to_path_buf()),
            id: None,
        }
    }

    pub fn with_id(mut self, id: Option<u32>) -> Self {
        self.id = id;
        self
    }
}

#[derive(Debug, Default)]
pub struct TaskRegistry {
    in_flight: Arc<Mutex<HashSet<TaskKey>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key`, or `None` when a task with the same key is running.
    pub fn try_begin(&self, key: TaskKey) -> Option<TaskGuard> {
        if !self.in_flight.lock().insert(key.clone()) {
            return None;
        }
        Some(TaskGuard {
            key,
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    pub fn is_running(&self, key: &TaskKey) -> bool {
        self.in_flight.lock().contains(key)
    }

    pub fn len(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Releases its key on drop.
#[derive(Debug)]
pub struct TaskGuard {
    key: TaskKey,
    in_flight: Arc<Mutex<HashSet<TaskKey>>>,
}

impl TaskGuard {
    pub fn key(&self) -> &TaskKey {
        &self.key
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.key);
    }
}
