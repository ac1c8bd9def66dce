// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use thiserror::Error;

use crate::tailer::watcher::WatcherError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Invalid glob pattern: {0}")]
    InvalidGlob(String),

    #[error("Watch error: {0}")]
    Watch(#[from] WatcherError),

    #[error("Blocking read task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl Error {
    /// True when the error means the file went away underneath us.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::FileNotFound(_) => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
