// SPDX-License-Identifier: Apache-2.0

//! Position store: the authoritative map of tracked files.
//!
//! Readers, the coordinator and the persister all go through this one lock.
//! Every mutation bumps a pending change counter and pushes a lossy
//! notification; the counter is what the persister trusts, the notification
//! queue only wakes it up.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::bounded_channel::{BoundedReceiver, BoundedSender, bounded};
use crate::tailer::checkpoint::Checkpoint;
use crate::tailer::metadata::Metadata;

/// Capacity of the change notification queue.
pub const CHANGES_QUEUE_LEN: usize = 1024;

pub type SharedPositionStore = Arc<PositionStore>;

/// Persisted form of a tracked file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: PathBuf,
    pub size: u64,
    pub offset: u64,
    #[serde(default)]
    pub meta: Metadata,
}

impl FileEntry {
    pub fn new(path: PathBuf, size: u64, offset: u64, meta: Metadata) -> Self {
        Self {
            path,
            size,
            offset,
            meta,
        }
    }
}

#[derive(Default)]
struct Inner {
    files: HashMap<PathBuf, FileEntry>,
    pending_changes: u64,
}

pub struct PositionStore {
    inner: RwLock<Inner>,
    changes_tx: BoundedSender<()>,
    changes_rx: BoundedReceiver<()>,
}

impl Default for PositionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PositionStore {
    pub fn new() -> Self {
        let (changes_tx, changes_rx) = bounded(CHANGES_QUEUE_LEN);
        Self {
            inner: RwLock::new(Inner::default()),
            changes_tx,
            changes_rx,
        }
    }

    pub fn shared() -> SharedPositionStore {
        Arc::new(Self::new())
    }

    pub fn set_file(&self, entry: FileEntry) {
        let mut inner = self.write();
        inner.files.insert(entry.path.clone(), entry);
        self.record_change(&mut inner);
    }

    pub fn get_file(&self, path: &Path) -> Option<FileEntry> {
        self.read().files.get(path).cloned()
    }

    pub fn is_file_exists(&self, path: &Path) -> bool {
        self.read().files.contains_key(path)
    }

    pub fn delete_file(&self, path: &Path) -> Option<FileEntry> {
        let mut inner = self.write();
        let removed = inner.files.remove(path);
        if removed.is_some() {
            self.record_change(&mut inner);
        }
        removed
    }

    /// Re-keys an entry under `new`. Only the path changes, metadata and
    /// position are kept. Any entry already under `new` is replaced.
    pub fn rename_file(&self, old: &Path, new: &Path) -> bool {
        let mut inner = self.write();
        let Some(mut entry) = inner.files.remove(old) else {
            return false;
        };
        entry.path = new.to_path_buf();
        inner.files.insert(new.to_path_buf(), entry);
        self.record_change(&mut inner);
        true
    }

    /// Records a read position. Returns false if the path is not tracked.
    pub fn update_position(&self, path: &Path, offset: u64, size: u64) -> bool {
        let mut inner = self.write();
        let Some(entry) = inner.files.get_mut(path) else {
            return false;
        };
        entry.offset = offset;
        entry.size = size.max(offset);
        self.record_change(&mut inner);
        true
    }

    pub fn pending_changes(&self) -> u64 {
        self.read().pending_changes
    }

    /// Wakes up whenever a mutation happens. Lossy.
    pub fn changes(&self) -> BoundedReceiver<()> {
        self.changes_rx.clone()
    }

    /// Consumes `drain_n` pending changes and returns a snapshot of every
    /// entry, both under the same exclusive lock.
    ///
    /// Callers pass the count they observed before calling so that changes
    /// made meanwhile stay pending for the next flush.
    pub fn flush(&self, drain_n: u64) -> Checkpoint {
        let mut inner = self.write();

        let drain = usize::try_from(drain_n).unwrap_or(usize::MAX);
        self.changes_rx.drain_up_to(drain);
        inner.pending_changes = inner.pending_changes.saturating_sub(drain_n);

        Checkpoint::from_entries(inner.files.values().cloned())
    }

    /// Replaces the whole map with a recovered checkpoint.
    pub fn load(&self, checkpoint: Checkpoint) -> Vec<FileEntry> {
        let mut inner = self.write();
        inner.files = checkpoint
            .files
            .into_iter()
            .map(|(path, mut entry)| {
                entry.path = path.clone();
                (path, entry)
            })
            .collect();

        let mut entries: Vec<FileEntry> = inner.files.values().cloned().collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        entries
    }

    pub fn len(&self) -> usize {
        self.read().files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn record_change(&self, inner: &mut Inner) {
        inner.pending_changes += 1;
        // advisory only, dropping on a full queue is fine
        let _ = self.changes_tx.try_send(());
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}
