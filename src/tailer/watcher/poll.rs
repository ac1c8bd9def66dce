// SPDX-License-Identifier: Apache-2.0

//! Polling-based file watcher for systems where native notifications are
//! unavailable or unreliable (e.g., NFS, some overlay filesystems).
//!
//! Each poll walks the watched trees, following symlinks, and diffs the
//! result against the previous walk. A file whose identity shows up under a
//! new path is reported as a rename rather than a remove plus create.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use super::traits::{FileEvent, FileWatcher, WatcherError};
use crate::tailer::file_id::FileId;

/// Directory nesting we are willing to descend into.
const MAX_DEPTH: usize = 16;

#[derive(Debug, Clone)]
struct FileState {
    id: FileId,
    modified: Option<SystemTime>,
    size: u64,
}

impl FileState {
    fn from_metadata(metadata: &fs::Metadata) -> Self {
        Self {
            id: FileId::from_metadata(metadata),
            modified: metadata.modified().ok(),
            size: metadata.len(),
        }
    }
}

/// Polling-based file watcher.
pub struct PollWatcher {
    watched_dirs: Vec<PathBuf>,
    file_states: HashMap<PathBuf, FileState>,
    poll_interval: Duration,
    last_poll: Instant,
    pending_events: Vec<FileEvent>,
}

impl PollWatcher {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            watched_dirs: Vec::new(),
            file_states: HashMap::new(),
            poll_interval,
            last_poll: Instant::now(),
            pending_events: Vec::new(),
        }
    }

    fn walk(&self) -> HashMap<PathBuf, FileState> {
        let mut found = HashMap::with_capacity(self.file_states.len());
        let mut visited = HashSet::new();

        for dir in &self.watched_dirs {
            walk_directory(dir, 0, &mut visited, &mut found);
        }
        found
    }

    /// Walk the trees and queue events for everything that changed.
    fn scan_all(&mut self) {
        let current = self.walk();
        let previous = std::mem::take(&mut self.file_states);
        let events = diff(&previous, &current);

        self.file_states = current;
        self.pending_events.extend(events);
        self.last_poll = Instant::now();
    }

    fn poll_if_needed(&mut self) {
        if self.last_poll.elapsed() >= self.poll_interval {
            self.scan_all();
        }
    }
}

fn walk_directory(
    dir: &Path,
    depth: usize,
    visited: &mut HashSet<FileId>,
    found: &mut HashMap<PathBuf, FileState>,
) {
    if depth > MAX_DEPTH {
        return;
    }

    // guards against symlink loops
    match FileId::from_path(dir) {
        Ok(id) if visited.insert(id) => {}
        _ => return,
    }

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!("Error scanning directory {:?}: {}", dir, e);
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let metadata = match fs::metadata(&path) {
            Ok(m) => m,
            Err(_) => continue,
        };

        if metadata.is_dir() {
            walk_directory(&path, depth + 1, visited, found);
        } else if metadata.is_file() {
            found.insert(path, FileState::from_metadata(&metadata));
        }
    }
}

/// Events that turn `previous` into `current`, ordered renames, removes,
/// creates, then modifies.
fn diff(
    previous: &HashMap<PathBuf, FileState>,
    current: &HashMap<PathBuf, FileState>,
) -> Vec<FileEvent> {
    let mut renames = Vec::new();
    let mut removes = Vec::new();
    let mut creates = Vec::new();
    let mut modifies = Vec::new();

    // a previous path is free to be a rename source once its identity has
    // left it, either because the path is gone or now holds another file
    let mut sources: HashMap<FileId, &PathBuf> = previous
        .iter()
        .filter(|(path, old)| {
            current
                .get(*path)
                .is_none_or(|new| new.id != old.id)
        })
        .map(|(path, old)| (old.id, path))
        .collect();
    let mut renamed_from: HashSet<&PathBuf> = HashSet::new();

    let mut paths: Vec<&PathBuf> = current.keys().collect();
    paths.sort();

    for path in paths {
        let new = &current[path];
        match previous.get(path) {
            Some(old) if old.id == new.id => {
                if old.modified != new.modified || old.size != new.size {
                    modifies.push(FileEvent::modify(path.clone()));
                }
            }
            _ => match sources.remove(&new.id) {
                Some(from) => {
                    renamed_from.insert(from);
                    renames.push(FileEvent::rename(from.clone(), path.clone()));
                }
                None => creates.push(FileEvent::create(path.clone())),
            },
        }
    }

    let mut gone: Vec<&PathBuf> = previous
        .iter()
        .filter(|(path, old)| {
            !renamed_from.contains(path)
                && current.get(*path).is_none_or(|new| new.id != old.id)
        })
        .map(|(path, _)| path)
        .collect();
    gone.sort();
    for path in gone {
        // a replaced path that was also a rename source already moved away
        removes.push(FileEvent::remove(path.clone()));
    }

    let mut events = renames;
    events.extend(removes);
    events.extend(creates);
    events.extend(modifies);
    events
}

impl FileWatcher for PollWatcher {
    fn watch(&mut self, path: &Path) -> Result<(), WatcherError> {
        let metadata = fs::metadata(path)?;
        if !metadata.is_dir() {
            return Err(WatcherError::Watch(format!(
                "{} is not a directory",
                path.display()
            )));
        }

        if !self.watched_dirs.iter().any(|p| p == path) {
            self.watched_dirs.push(path.to_path_buf());
        }

        // baseline the new tree without reporting what already exists
        let current = self.walk();
        for (p, state) in current {
            self.file_states.entry(p).or_insert(state);
        }
        Ok(())
    }

    fn try_recv(&mut self) -> Result<Vec<FileEvent>, WatcherError> {
        self.poll_if_needed();
        Ok(std::mem::take(&mut self.pending_events))
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Vec<FileEvent>, WatcherError> {
        let deadline = Instant::now() + timeout;

        loop {
            self.poll_if_needed();

            if !self.pending_events.is_empty() {
                return Ok(std::mem::take(&mut self.pending_events));
            }

            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }

            let time_to_next_poll = self.poll_interval.saturating_sub(self.last_poll.elapsed());
            let time_to_deadline = deadline.saturating_duration_since(Instant::now());
            let sleep_duration = time_to_next_poll.min(time_to_deadline);

            if !sleep_duration.is_zero() {
                std::thread::sleep(sleep_duration);
            }
        }
    }

    fn backend_name(&self) -> &'static str {
        "poll"
    }
}
