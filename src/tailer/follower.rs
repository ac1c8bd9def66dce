// SPDX-License-Identifier: Apache-2.0

//! Per-file tailing task.
//!
//! A follower owns the [`LineReader`] of one tracked file and is the only
//! code that moves its position forward. The coordinator drives it through a
//! small command queue; reads themselves run on the blocking pool.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bounded_channel::{BoundedReceiver, BoundedSender, bounded};
use crate::tailer::error::{Error, Result};
use crate::tailer::file_id::FileId;
use crate::tailer::metadata::Metadata;
use crate::tailer::reader::{Line, LineReader, ReadStatus};
use crate::tailer::store::SharedPositionStore;
use crate::topology::buffer::EventBuffer;
use crate::topology::event::LogEvent;

/// Capacity of each follower's command queue.
pub const COMMAND_QUEUE_LEN: usize = 128;

#[derive(Debug)]
enum Command {
    Read,
    Rename(PathBuf),
    Stop,
}

/// Coordinator side of a running follower.
pub struct FollowerHandle {
    file_id: FileId,
    commands: BoundedSender<Command>,
    task: JoinHandle<()>,
}

impl FollowerHandle {
    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    /// Asks for a read pass. Returns false once the follower has exited.
    pub fn request_read(&self) -> bool {
        match self.commands.try_send(Command::Read) {
            Ok(()) => true,
            // plenty of reads already queued
            Err(e) => e.is_full(),
        }
    }

    /// Moves the follower, and its store entry, to a new path.
    pub async fn rename(&self, path: PathBuf) -> bool {
        self.commands.send(Command::Rename(path)).await.is_ok()
    }

    /// Runs a final read pass and waits for the follower to exit.
    pub async fn stop(self) {
        let _ = self.commands.send(Command::Stop).await;
        drop(self.commands);

        if let Err(e) = self.task.await {
            if e.is_panic() {
                error!(file_id = %self.file_id, "Follower task panicked");
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    #[cfg(test)]
    pub(crate) fn abort(&self) {
        self.task.abort();
    }
}

struct Follower {
    path: PathBuf,
    reader: Option<LineReader>,
    lines: BoundedReceiver<Line>,
    meta: Arc<Metadata>,
    store: SharedPositionStore,
    buffer: EventBuffer,
    commands: BoundedReceiver<Command>,
}

/// Starts following `reader`, which must already be positioned.
pub fn spawn(
    reader: LineReader,
    meta: Arc<Metadata>,
    store: SharedPositionStore,
    buffer: EventBuffer,
) -> FollowerHandle {
    let (commands_tx, commands_rx) = bounded(COMMAND_QUEUE_LEN);
    let file_id = reader.file_id();

    let follower = Follower {
        path: reader.path().to_path_buf(),
        lines: reader.listen_line(),
        reader: Some(reader),
        meta,
        store,
        buffer,
        commands: commands_rx,
    };

    FollowerHandle {
        file_id,
        commands: commands_tx,
        task: tokio::spawn(follower.run()),
    }
}

impl Follower {
    async fn run(mut self) {
        debug!(path = %self.path.display(), "Follower started");

        while let Some(command) = self.commands.next().await {
            match command {
                Command::Read => {
                    if let Err(e) = self.read_available().await {
                        warn!(path = %self.path.display(), error = %e, "Failed to read file, no longer following it");
                        return;
                    }
                }
                Command::Rename(path) => {
                    self.store.rename_file(&self.path, &path);
                    if let Some(reader) = self.reader.as_mut() {
                        reader.set_path(path.clone());
                    }
                    self.path = path;

                    if let Err(e) = self.read_available().await {
                        warn!(path = %self.path.display(), error = %e, "Failed to read renamed file, no longer following it");
                        return;
                    }
                }
                Command::Stop => {
                    if let Err(e) = self.read_available().await {
                        debug!(path = %self.path.display(), error = %e, "Final read failed");
                    }
                    break;
                }
            }
        }

        if let Some(mut reader) = self.reader.take() {
            reader.close();
        }
        debug!(path = %self.path.display(), "Follower stopped");
    }

    /// Reads until end of data, handling truncation first.
    async fn read_available(&mut self) -> Result<()> {
        let truncated = self
            .blocking(|reader| {
                if reader.is_truncated()? {
                    reader.reset()?;
                    return Ok(Some(reader.size()));
                }
                Ok(None)
            })
            .await?;

        if let Some(size) = truncated {
            info!(path = %self.path.display(), size, "File truncated, reading from the start");
            self.store.update_position(&self.path, 0, size);
        }

        loop {
            let (status, size): (ReadStatus, u64) = self
                .blocking(|reader| {
                    let status = reader.read()?;
                    Ok((status, reader.size()))
                })
                .await?;

            self.deliver(size);
            if !status.backlogged {
                return Ok(());
            }
        }
    }

    /// Hands queued lines to the event buffer, then records the new offset.
    fn deliver(&mut self, size: u64) {
        let lines = self.lines.drain_up_to(usize::MAX);
        let Some(last) = lines.last().map(|l| l.offset) else {
            return;
        };

        let num = lines.len();
        for line in lines {
            self.buffer
                .push(LogEvent::new(line.text, line.timestamp, self.meta.clone()));
        }

        self.store.update_position(&self.path, last, size);
        debug!(path = %self.path.display(), num, offset = last, "Read lines");
    }

    async fn blocking<T, F>(&mut self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut LineReader) -> Result<T> + Send + 'static,
    {
        let Some(mut reader) = self.reader.take() else {
            return Err(Error::FileNotFound(self.path.clone()));
        };

        let (reader, result) = tokio::task::spawn_blocking(move || {
            let result = f(&mut reader);
            (reader, result)
        })
        .await?;

        self.reader = Some(reader);
        result
    }
}
