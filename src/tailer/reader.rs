// SPDX-License-Identifier: Apache-2.0

//! Line reader for a single tailed file.
//!
//! The reader owns the only open handle to its file. Each `read()` pass
//! consumes complete lines up to the current end of data and pushes them to
//! an internal bounded queue, which the owning task drains via
//! [`LineReader::listen_line`]. A trailing line without its newline is left
//! in the file for the next pass.

use chrono::{DateTime, Utc};
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::bounded_channel::{BoundedReceiver, BoundedSender, bounded};
use crate::tailer::error::{Error, Result};
use crate::tailer::file_id::FileId;
use crate::tailer::store::FileEntry;

/// Capacity of the per-reader line queue.
pub const LINES_QUEUE_LEN: usize = 10240;

/// A complete line read from a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    /// Byte offset just past this line's newline.
    pub offset: u64,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of one read pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReadStatus {
    /// Lines pushed to the queue by this pass.
    pub lines: usize,
    /// The queue filled up before end of data was reached.
    pub backlogged: bool,
}

pub struct LineReader {
    path: PathBuf,
    file_id: FileId,
    reader: Option<BufReader<File>>,
    size: u64,
    offset: u64,
    max_line_size: usize,
    queue_len: usize,
    lines_tx: BoundedSender<Line>,
    lines_rx: BoundedReceiver<Line>,
    buf: Vec<u8>,
}

impl LineReader {
    /// Opens `path` positioned at offset 0.
    pub fn open(path: impl AsRef<Path>, max_line_size: usize) -> Result<Self> {
        Self::open_with_queue(path, max_line_size, LINES_QUEUE_LEN)
    }

    pub(crate) fn open_with_queue(
        path: impl AsRef<Path>,
        max_line_size: usize,
        queue_len: usize,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = open_file(&path)?;
        let metadata = file.metadata()?;
        let (lines_tx, lines_rx) = bounded(queue_len);

        Ok(Self {
            path,
            file_id: FileId::from_metadata(&metadata),
            reader: Some(BufReader::new(file)),
            size: metadata.len(),
            offset: 0,
            max_line_size,
            queue_len,
            lines_tx,
            lines_rx,
            buf: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Follows a rename. Queued lines and the open handle are kept.
    pub fn set_path(&mut self, path: PathBuf) {
        self.path = path;
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Last observed size of the file.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Receiver side of the line queue.
    pub fn listen_line(&self) -> BoundedReceiver<Line> {
        self.lines_rx.clone()
    }

    /// Skips all existing content; only lines appended later are read.
    pub fn seek_end(&mut self) -> Result<()> {
        let reader = self.reader_mut()?;
        let end = reader.seek(SeekFrom::End(0))?;
        self.size = end;
        self.offset = end;
        Ok(())
    }

    /// Resumes from a checkpointed entry.
    ///
    /// A file that is now smaller than when it was checkpointed was truncated
    /// while we were not running, reading resumes at its current end.
    pub fn restore_position(&mut self, entry: &FileEntry) -> Result<()> {
        let reader = self.reader_mut()?;
        let current = reader.get_ref().metadata()?.len();

        let target = if current < entry.size || current < entry.offset {
            current
        } else {
            entry.offset
        };
        reader.seek(SeekFrom::Start(target))?;

        self.size = current;
        self.offset = target;
        Ok(())
    }

    /// Compares the size of the open file against the last observed size.
    /// Updates the observed size as a side effect.
    pub fn is_truncated(&mut self) -> Result<bool> {
        let reader = self.reader_mut()?;
        let current = reader.get_ref().metadata()?.len();

        let truncated = current < self.size || current < self.offset;
        self.size = current;
        Ok(truncated)
    }

    /// Reopens the file at offset 0 after truncation.
    pub fn reset(&mut self) -> Result<()> {
        self.close();

        let file = open_file(&self.path)?;
        let metadata = file.metadata()?;

        self.file_id = FileId::from_metadata(&metadata);
        self.size = metadata.len();
        self.offset = 0;
        self.reader = Some(BufReader::new(file));
        Ok(())
    }

    /// Reads every complete line currently available.
    ///
    /// Stops at end of data, at a partial trailing line, or when the line
    /// queue is full. Never waits for more data.
    pub fn read(&mut self) -> Result<ReadStatus> {
        let mut status = ReadStatus::default();
        let Some(reader) = self.reader.as_mut() else {
            return Err(Error::FileNotFound(self.path.clone()));
        };

        loop {
            if self.lines_tx.len() >= self.queue_len {
                status.backlogged = true;
                break;
            }

            self.buf.clear();
            let n = reader.read_until(b'\n', &mut self.buf)?;
            if n == 0 {
                break;
            }

            if self.buf.last() != Some(&b'\n') {
                // incomplete, wait for the writer to finish it
                reader.seek(SeekFrom::Start(self.offset))?;
                break;
            }

            let text = decode_line(&self.buf, self.max_line_size, &self.path);
            let line = Line {
                offset: self.offset + n as u64,
                text,
                timestamp: Utc::now(),
            };

            if self.lines_tx.try_send(line).is_err() {
                reader.seek(SeekFrom::Start(self.offset))?;
                status.backlogged = true;
                break;
            }

            self.offset += n as u64;
            status.lines += 1;
        }

        if self.offset > self.size {
            self.size = self.offset;
        }

        Ok(status)
    }

    /// Releases the file handle. Queued lines stay available.
    pub fn close(&mut self) {
        self.reader = None;
    }

    fn reader_mut(&mut self) -> Result<&mut BufReader<File>> {
        match self.reader.as_mut() {
            Some(r) => Ok(r),
            None => Err(Error::FileNotFound(self.path.clone())),
        }
    }
}

fn open_file(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::FileNotFound(path.to_path_buf()),
        _ => Error::Io(e),
    })
}

fn decode_line(raw: &[u8], max_line_size: usize, path: &Path) -> String {
    let mut end = raw.len() - 1;
    if end > 0 && raw[end - 1] == b'\r' {
        end -= 1;
    }

    let mut text = String::from_utf8_lossy(&raw[..end]).into_owned();
    if text.len() > max_line_size {
        let mut cut = max_line_size;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        tracing::warn!(
            path = %path.display(),
            size = text.len(),
            max_line_size,
            "Line exceeds maximum size, truncating"
        );
        text.truncate(cut);
    }
    text
}
