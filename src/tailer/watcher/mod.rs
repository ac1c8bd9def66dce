// SPDX-License-Identifier: Apache-2.0

//! File system watcher abstractions for the tailer.
//!
//! This module provides two watching strategies:
//! - **Native watching**: inotify through the `notify` crate, recursive over
//!   each log root.
//! - **Poll watching**: periodic recursive walks, for filesystems where
//!   inotify is not delivered (NFS, some container overlays).
//!
//! `auto` mode attempts native watching first and falls back to polling.

mod native;
mod poll;
mod traits;

pub use native::NativeWatcher;
pub use poll::PollWatcher;
pub use traits::{FileEvent, FileEventKind, FileWatcher, WatcherError};

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Watch mode configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchMode {
    /// Try native watching, fall back to polling on failure.
    #[default]
    Auto,
    /// Force native file system watching.
    Native,
    /// Force polling mode.
    Poll,
}

impl std::str::FromStr for WatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(WatchMode::Auto),
            "native" | "notify" => Ok(WatchMode::Native),
            "poll" | "polling" => Ok(WatchMode::Poll),
            _ => Err(format!(
                "Invalid watch mode '{}'. Valid options: auto, native, poll",
                s
            )),
        }
    }
}

/// Create a watcher for the given mode.
pub fn create_watcher(
    mode: WatchMode,
    poll_interval: Duration,
) -> Result<Box<dyn FileWatcher + Send>, WatcherError> {
    match mode {
        WatchMode::Native => Ok(Box::new(NativeWatcher::new()?)),
        WatchMode::Poll => Ok(Box::new(PollWatcher::new(poll_interval))),
        WatchMode::Auto => match NativeWatcher::new() {
            Ok(watcher) => Ok(Box::new(watcher)),
            Err(e) => {
                tracing::warn!(
                    "Native file watching unavailable ({}), falling back to polling",
                    e
                );
                Ok(Box::new(PollWatcher::new(poll_interval)))
            }
        },
    }
}
