// SPDX-License-Identifier: Apache-2.0

//! Tailer coordinator.
//!
//! Owns the set of followers and keeps it in line with what is on disk:
//! - startup restores checkpointed files, then registers every other log
//!   file under the roots at its current end
//! - watcher events add, rename, remove and wake followers
//! - a periodic re-scan catches anything the watcher missed
//!
//! The watcher backend is blocking, so it runs on a dedicated thread and
//! forwards event batches over a bounded channel.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior, interval, interval_at, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bounded_channel::{BoundedReceiver, BoundedSender, bounded};
use crate::tailer::checkpoint::Checkpoint;
use crate::tailer::config::TailerConfig;
use crate::tailer::error::Result;
use crate::tailer::file_id::FileId;
use crate::tailer::finder::{FileFinder, is_log_file};
use crate::tailer::follower::{self, FollowerHandle};
use crate::tailer::metadata;
use crate::tailer::reader::LineReader;
use crate::tailer::store::{FileEntry, SharedPositionStore};
use crate::tailer::watcher::{FileEvent, FileEventKind, FileWatcher, WatcherError, create_watcher};
use crate::topology::buffer::EventBuffer;

/// How long a rename that only reported its source waits for the
/// matching create before the source is treated as removed.
pub const RENAME_PAIR_TIMEOUT: Duration = Duration::from_secs(1);

const WATCH_QUEUE_LEN: usize = 1024;
const WATCH_RECV_TIMEOUT: Duration = Duration::from_millis(100);
const WATCH_THREAD_JOIN_TIMEOUT: Duration = Duration::from_millis(500);

type WatchMessage = std::result::Result<Vec<FileEvent>, WatcherError>;

/// Where a newly tracked file starts reading.
enum StartAt {
    Beginning,
    End,
    Checkpoint(FileEntry),
}

#[derive(Debug, Clone)]
struct PendingRename {
    path: PathBuf,
    file_id: FileId,
    since: Instant,
}

pub struct Coordinator {
    config: TailerConfig,
    store: SharedPositionStore,
    buffer: EventBuffer,
    finder: FileFinder,
    followers: HashMap<PathBuf, FollowerHandle>,
    pending_rename: Option<PendingRename>,
    recovered: bool,
}

impl Coordinator {
    pub fn new(config: TailerConfig, store: SharedPositionStore, buffer: EventBuffer) -> Self {
        let finder = FileFinder::new(&config.roots);
        Self {
            config,
            store,
            buffer,
            finder,
            followers: HashMap::new(),
            pending_rename: None,
            recovered: false,
        }
    }

    /// Tails files until cancelled. Followers run a final read pass before
    /// this returns.
    ///
    /// Failing to load the checkpoint or to watch the roots is fatal, as is
    /// any later watcher failure. Problems with a single file are not.
    pub async fn run(&mut self, cancel_token: CancellationToken) -> Result<()> {
        info!(roots = ?self.config.roots, "Log tailer starting");

        if !self.recovered {
            self.recover()?;
        }

        let watch_stop = cancel_token.child_token();
        let (mut events_rx, watch_thread) = self.start_watcher(watch_stop.clone())?;

        self.initial_scan().await?;
        info!(files = self.followers.len(), "Log tailer started");

        let period = self.config.rescan_interval;
        let mut rescan = interval_at(Instant::now() + period, period);
        rescan.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut rename_check = interval(RENAME_PAIR_TIMEOUT / 4);
        rename_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            select! {
                biased;

                _ = cancel_token.cancelled() => {
                    debug!("Log tailer cancelled");
                    break Ok(());
                }

                msg = events_rx.next() => match msg {
                    Some(Ok(events)) => {
                        for event in events {
                            self.handle_event(event).await;
                        }
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "File watcher failed");
                        break Err(e.into());
                    }
                    None => {
                        error!("File watcher thread exited");
                        break Err(WatcherError::Channel("watcher thread exited".into()).into());
                    }
                },

                _ = rescan.tick() => {
                    if let Err(e) = self.rescan().await {
                        warn!(error = %e, "Re-scan of log roots failed");
                    }
                }

                _ = rename_check.tick() => self.expire_pending_rename().await,
            }
        };

        watch_stop.cancel();
        drop(events_rx);
        self.stop_followers().await;

        match timeout(
            WATCH_THREAD_JOIN_TIMEOUT,
            tokio::task::spawn_blocking(move || watch_thread.join()),
        )
        .await
        {
            Ok(Ok(Ok(()))) => debug!("Watcher thread joined"),
            Ok(Ok(Err(_))) => error!("Watcher thread panicked"),
            Ok(Err(e)) => warn!(error = %e, "Failed to join watcher thread"),
            Err(_) => warn!("Timed out waiting for watcher thread"),
        }

        info!("Log tailer stopped");
        result
    }

    /// Restores followers for every checkpointed file still on disk.
    ///
    /// Called by `run` unless it already happened. The agent calls it up
    /// front so a bad checkpoint stops startup before anything is written.
    pub fn recover(&mut self) -> Result<()> {
        self.recovered = true;
        let Some(checkpoint) = Checkpoint::load(&self.config.state_path)? else {
            info!(path = %self.config.state_path.display(), "No checkpoint found, starting fresh");
            return Ok(());
        };

        let entries = self.store.load(checkpoint);
        info!(files = entries.len(), "Loaded checkpoint");

        for entry in entries {
            let path = entry.path.clone();
            if let Err(e) = self.track(path.clone(), StartAt::Checkpoint(entry)) {
                if e.is_not_found() {
                    info!(path = %path.display(), "Checkpointed file is gone, dropping it");
                } else {
                    warn!(path = %path.display(), error = %e, "Failed to restore checkpointed file, dropping it");
                }
                self.store.delete_file(&path);
            }
        }
        Ok(())
    }

    fn start_watcher(
        &self,
        stop: CancellationToken,
    ) -> Result<(BoundedReceiver<WatchMessage>, std::thread::JoinHandle<()>)> {
        let mut watcher = create_watcher(self.config.watch_mode, self.config.poll_interval)?;
        for root in &self.config.roots {
            watcher.watch(root)?;
        }
        info!(backend = watcher.backend_name(), "File watcher initialized");

        let (events_tx, events_rx) = bounded(WATCH_QUEUE_LEN);
        let handle = std::thread::Builder::new()
            .name("logfwd-watcher".to_string())
            .spawn(move || watch_loop(watcher, events_tx, stop))?;

        Ok((events_rx, handle))
    }

    /// Files already present at startup are tailed from their end.
    async fn initial_scan(&mut self) -> Result<()> {
        for path in self.find_files().await? {
            if !self.followers.contains_key(&path) {
                self.track_logged(path, StartAt::End);
            }
        }
        Ok(())
    }

    async fn rescan(&mut self) -> Result<()> {
        self.reap_finished().await;

        let found = self.find_files().await?;
        let found_set: HashSet<&PathBuf> = found.iter().collect();
        let pending = self.pending_rename.as_ref().map(|p| p.path.clone());

        // followed files whose path is gone, by identity so that renames
        // the watcher missed can still be paired up
        let mut gone: HashMap<FileId, PathBuf> = self
            .followers
            .iter()
            .filter(|(p, _)| !found_set.contains(p) && !p.exists() && pending.as_ref() != Some(*p))
            .map(|(p, f)| (f.file_id(), p.clone()))
            .collect();

        let mut added = 0;
        for path in found {
            if let Some(follower) = self.followers.get(&path) {
                // covers writes the watcher did not report
                follower.request_read();
                continue;
            }

            let moved_from = FileId::from_path(&path)
                .ok()
                .and_then(|id| gone.remove(&id));
            match moved_from {
                Some(from) => self.apply_rename(from, path).await,
                None => {
                    self.on_create(path).await;
                    added += 1;
                }
            }
        }

        for path in gone.into_values() {
            info!(path = %path.display(), "Tracked file disappeared");
            self.untrack(&path).await;
        }

        debug!(tracked = self.followers.len(), added, "Re-scan complete");
        Ok(())
    }

    async fn find_files(&self) -> Result<Vec<PathBuf>> {
        let finder = self.finder.clone();
        tokio::task::spawn_blocking(move || finder.find_files()).await?
    }

    async fn handle_event(&mut self, event: FileEvent) {
        match event.kind {
            FileEventKind::Create => {
                for path in event.paths {
                    self.on_create(path).await;
                }
            }
            FileEventKind::Modify => {
                for path in event.paths {
                    self.on_modify(&path).await;
                }
            }
            FileEventKind::Remove => {
                for path in event.paths {
                    self.on_remove(&path).await;
                }
            }
            FileEventKind::Rename => {
                let mut paths = event.paths.into_iter();
                match (paths.next(), paths.next()) {
                    (Some(from), Some(to)) => self.on_rename(from, to).await,
                    (Some(from), None) => self.on_rename_from(from).await,
                    _ => {}
                }
            }
            FileEventKind::Other => {}
        }
    }

    async fn on_create(&mut self, path: PathBuf) {
        if !is_log_file(&path) {
            return;
        }

        let file_id = match FileId::from_path(&path) {
            Ok(id) => id,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Created file vanished before it could be opened");
                return;
            }
        };

        if let Some(pending) = self.pending_rename.take() {
            if pending.file_id == file_id {
                if pending.path != path {
                    self.apply_rename(pending.path, path).await;
                    return;
                }
            } else {
                info!(path = %pending.path.display(), "Renamed file did not reappear, treating it as removed");
                self.untrack(&pending.path).await;
            }
        }

        match self.followers.get(&path) {
            Some(follower) if follower.file_id() == file_id => {
                if !follower.request_read() {
                    self.untrack(&path).await;
                }
            }
            Some(_) => {
                info!(path = %path.display(), "File replaced, following the new one");
                self.untrack(&path).await;
                self.track_logged(path, StartAt::Beginning);
            }
            None => self.track_logged(path, StartAt::Beginning),
        }
    }

    async fn on_modify(&mut self, path: &Path) {
        if !is_log_file(path) {
            return;
        }

        match self.followers.get(path) {
            Some(follower) => {
                if !follower.request_read() {
                    self.untrack(path).await;
                }
            }
            None => debug!(path = %path.display(), "Write to an untracked file, ignoring"),
        }
    }

    async fn on_remove(&mut self, path: &Path) {
        if self.followers.contains_key(path) {
            info!(path = %path.display(), "File removed");
            self.untrack(path).await;
        }
    }

    /// Source half of a rename. Waits for the matching create.
    async fn on_rename_from(&mut self, from: PathBuf) {
        let Some(file_id) = self.followers.get(&from).map(|f| f.file_id()) else {
            return;
        };

        if let Some(previous) = self.pending_rename.take() {
            if previous.path != from {
                info!(path = %previous.path.display(), "Renamed file did not reappear, treating it as removed");
                self.untrack(&previous.path).await;
            }
        }

        debug!(path = %from.display(), "Rename pending");
        self.pending_rename = Some(PendingRename {
            path: from,
            file_id,
            since: Instant::now(),
        });
    }

    async fn on_rename(&mut self, from: PathBuf, to: PathBuf) {
        if self.pending_rename.as_ref().is_some_and(|p| p.path == from) {
            self.pending_rename = None;
        }

        let tracked = self.followers.contains_key(&from);
        match (tracked, is_log_file(&to)) {
            (true, true) => self.apply_rename(from, to).await,
            (true, false) => {
                info!(from = %from.display(), to = %to.display(), "File renamed out of scope");
                self.untrack(&from).await;
            }
            // also the late full report of a rename already applied
            (false, true) => self.on_create(to).await,
            (false, false) => {}
        }
    }

    async fn apply_rename(&mut self, from: PathBuf, to: PathBuf) {
        if from == to {
            return;
        }

        if self.followers.contains_key(&to) {
            info!(path = %to.display(), "Rename target was tracked, dropping its old entry");
            self.untrack(&to).await;
        }

        let Some(follower) = self.followers.remove(&from) else {
            return;
        };

        if follower.rename(to.clone()).await {
            info!(from = %from.display(), to = %to.display(), "File renamed");
            self.followers.insert(to, follower);
        } else {
            follower.stop().await;
            self.store.delete_file(&from);
            self.track_logged(to, StartAt::Beginning);
        }
    }

    async fn expire_pending_rename(&mut self) {
        let expired = self
            .pending_rename
            .as_ref()
            .is_some_and(|p| p.since.elapsed() >= RENAME_PAIR_TIMEOUT);
        if !expired {
            return;
        }

        if let Some(pending) = self.pending_rename.take() {
            info!(path = %pending.path.display(), "Renamed file did not reappear, treating it as removed");
            self.untrack(&pending.path).await;
        }
    }

    /// Restarts followers that exited on their own after a read error. The
    /// same file resumes from its last recorded position.
    async fn reap_finished(&mut self) {
        let finished: Vec<PathBuf> = self
            .followers
            .iter()
            .filter(|(_, f)| f.is_finished())
            .map(|(p, _)| p.clone())
            .collect();

        for path in finished {
            let Some(follower) = self.followers.remove(&path) else {
                continue;
            };
            let file_id = follower.file_id();
            follower.stop().await;

            let same_file = FileId::from_path(&path).is_ok_and(|id| id == file_id);
            let start = match self.store.get_file(&path) {
                Some(entry) if same_file => StartAt::Checkpoint(entry),
                _ => StartAt::Beginning,
            };

            match self.track(path.clone(), start) {
                Ok(()) => info!(path = %path.display(), "Restarted exited follower"),
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Exited follower could not be restarted");
                    self.untrack(&path).await;
                }
            }
        }
    }

    fn track_logged(&mut self, path: PathBuf, start: StartAt) {
        if let Err(e) = self.track(path.clone(), start) {
            if e.is_not_found() {
                debug!(path = %path.display(), "File vanished before it could be tracked");
            } else {
                warn!(path = %path.display(), error = %e, "Failed to track file");
            }
        }
    }

    /// Registers `path` in the store and starts its follower.
    /// The path must not already be followed.
    fn track(&mut self, path: PathBuf, start: StartAt) -> Result<()> {
        let mut reader = LineReader::open(&path, self.config.max_line_size)?;

        let meta = match &start {
            StartAt::Checkpoint(entry) if !entry.meta.is_empty() => entry.meta.clone(),
            _ => metadata::extract(&path),
        };

        match &start {
            StartAt::Beginning => {}
            StartAt::End => reader.seek_end()?,
            StartAt::Checkpoint(entry) => reader.restore_position(entry)?,
        }

        self.store.set_file(FileEntry::new(
            path.clone(),
            reader.size(),
            reader.offset(),
            meta.clone(),
        ));

        info!(
            path = %path.display(),
            offset = reader.offset(),
            file_id = %reader.file_id(),
            namespace = %meta.namespace,
            pod_name = %meta.pod_name,
            container_name = %meta.container_name,
            "Tracking file"
        );

        let follower = follower::spawn(reader, Arc::new(meta), self.store.clone(), self.buffer.clone());
        follower.request_read();
        self.followers.insert(path, follower);
        Ok(())
    }

    /// Stops the follower after a final read and forgets the file.
    async fn untrack(&mut self, path: &Path) {
        if self.pending_rename.as_ref().is_some_and(|p| p.path == path) {
            self.pending_rename = None;
        }

        if let Some(follower) = self.followers.remove(path) {
            follower.stop().await;
        }
        if self.store.delete_file(path).is_some() {
            info!(path = %path.display(), "Stopped tracking file");
        }
    }

    /// Final read on every follower. Store entries are kept for the last
    /// checkpoint.
    async fn stop_followers(&mut self) {
        let mut stopping = JoinSet::new();
        for (_, follower) in self.followers.drain() {
            stopping.spawn(follower.stop());
        }

        let num = stopping.len();
        while stopping.join_next().await.is_some() {}
        info!(num, "Stopped all followers");
    }
}

fn watch_loop(
    mut watcher: Box<dyn FileWatcher + Send>,
    events_tx: BoundedSender<WatchMessage>,
    stop: CancellationToken,
) {
    while !stop.is_cancelled() {
        match watcher.recv_timeout(WATCH_RECV_TIMEOUT) {
            Ok(events) if events.is_empty() => {}
            Ok(events) => {
                if events_tx.send_blocking(Ok(events)).is_err() {
                    break;
                }
            }
            Err(e) => {
                let _ = events_tx.send_blocking(Err(e));
                break;
            }
        }
    }
}
