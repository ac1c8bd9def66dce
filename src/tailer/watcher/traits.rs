// SPDX-License-Identifier: Apache-2.0

//! Traits and types for file system watchers.

use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Error type for watcher operations
#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("watcher initialization failed: {0}")]
    Init(String),

    #[error("watch failed: {0}")]
    Watch(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("channel error: {0}")]
    Channel(String),
}

/// Kind of file event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    /// File was created or moved into a watched directory
    Create,
    /// File content or metadata changed
    Modify,
    /// File was removed
    Remove,
    /// File was renamed. Carries `[from, to]`, or only `[from]` when the
    /// destination is not known yet.
    Rename,
    /// Catch-all for other events
    Other,
}

/// A file system event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub kind: FileEventKind,
    pub paths: Vec<PathBuf>,
}

impl FileEvent {
    pub fn new(kind: FileEventKind, paths: Vec<PathBuf>) -> Self {
        Self { kind, paths }
    }

    pub fn create(path: PathBuf) -> Self {
        Self::new(FileEventKind::Create, vec![path])
    }

    pub fn modify(path: PathBuf) -> Self {
        Self::new(FileEventKind::Modify, vec![path])
    }

    pub fn remove(path: PathBuf) -> Self {
        Self::new(FileEventKind::Remove, vec![path])
    }

    pub fn rename(from: PathBuf, to: PathBuf) -> Self {
        Self::new(FileEventKind::Rename, vec![from, to])
    }

    pub fn path(&self) -> Option<&Path> {
        self.paths.first().map(PathBuf::as_path)
    }
}

/// Trait for file system watchers.
///
/// Implementations can use native OS file system notifications or polling.
/// Watches are always recursive.
pub trait FileWatcher {
    /// Add a directory tree to watch.
    fn watch(&mut self, path: &Path) -> Result<(), WatcherError>;

    /// Return any pending events without blocking.
    fn try_recv(&mut self) -> Result<Vec<FileEvent>, WatcherError>;

    /// Receive events with a timeout.
    ///
    /// Returns an empty vector if the timeout expires with no events.
    fn recv_timeout(&mut self, timeout: Duration) -> Result<Vec<FileEvent>, WatcherError>;

    /// Name of the watcher backend for logging.
    fn backend_name(&self) -> &'static str;
}
