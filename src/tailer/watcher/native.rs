// SPDX-License-Identifier: Apache-2.0

//! Native file system watcher using the `notify` crate (inotify on Linux).

use std::path::Path;
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError, channel};
use std::time::Duration;

use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use super::traits::{FileEvent, FileEventKind, FileWatcher, WatcherError};

/// Native file system watcher using OS-level notifications.
pub struct NativeWatcher {
    watcher: RecommendedWatcher,
    receiver: Receiver<notify::Result<Event>>,
}

impl NativeWatcher {
    pub fn new() -> Result<Self, WatcherError> {
        let (tx, rx) = channel();

        let watcher = RecommendedWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            Config::default(),
        )
        .map_err(|e| WatcherError::Init(e.to_string()))?;

        Ok(Self {
            watcher,
            receiver: rx,
        })
    }

    /// Convert a notify event to our FileEvent type
    fn convert_event(event: Event) -> Option<FileEvent> {
        let mut paths = event.paths;
        if paths.is_empty() {
            return None;
        }

        let kind = match event.kind {
            EventKind::Create(_) => FileEventKind::Create,
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() >= 2 => {
                paths.truncate(2);
                FileEventKind::Rename
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                paths.truncate(1);
                FileEventKind::Rename
            }
            // the destination half looks like a new file appearing
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => FileEventKind::Create,
            EventKind::Modify(ModifyKind::Name(_)) => FileEventKind::Other,
            EventKind::Modify(_) => FileEventKind::Modify,
            EventKind::Remove(_) => FileEventKind::Remove,
            EventKind::Access(_) => return None,
            EventKind::Other | EventKind::Any => FileEventKind::Other,
        };

        Some(FileEvent::new(kind, paths))
    }

    fn handle(res: notify::Result<Event>, events: &mut Vec<FileEvent>) {
        match res {
            Ok(event) => {
                if let Some(file_event) = Self::convert_event(event) {
                    events.push(file_event);
                }
            }
            // overflows and similar are covered by the periodic re-scan
            Err(e) => tracing::warn!("File watcher error: {}", e),
        }
    }
}

impl FileWatcher for NativeWatcher {
    fn watch(&mut self, path: &Path) -> Result<(), WatcherError> {
        self.watcher
            .watch(path, RecursiveMode::Recursive)
            .map_err(|e| WatcherError::Watch(format!("{}: {}", path.display(), e)))
    }

    fn try_recv(&mut self) -> Result<Vec<FileEvent>, WatcherError> {
        let mut events = Vec::new();

        loop {
            match self.receiver.try_recv() {
                Ok(res) => Self::handle(res, &mut events),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    return Err(WatcherError::Channel("watcher channel disconnected".into()));
                }
            }
        }

        Ok(events)
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Vec<FileEvent>, WatcherError> {
        let mut events = Vec::new();

        match self.receiver.recv_timeout(timeout) {
            Ok(res) => Self::handle(res, &mut events),
            Err(RecvTimeoutError::Timeout) => return Ok(events),
            Err(RecvTimeoutError::Disconnected) => {
                return Err(WatcherError::Channel("watcher channel disconnected".into()));
            }
        }

        events.extend(self.try_recv()?);
        Ok(events)
    }

    fn backend_name(&self) -> &'static str {
        "inotify"
    }
}
