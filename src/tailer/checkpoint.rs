// SPDX-License-Identifier: Apache-2.0

//! Recovery checkpoint file.
//!
//! The checkpoint is a JSON object mapping each tracked path to its
//! [`FileEntry`]. It is always rewritten whole: the snapshot goes to a
//! sibling temp file which is synced and then renamed over the old one, so
//! a crash leaves either the previous snapshot or the new one.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

use crate::tailer::error::{Error, Result};
use crate::tailer::store::FileEntry;

/// Mode of the checkpoint file, readable by the owner only.
pub const CHECKPOINT_FILE_MODE: u32 = 0o600;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checkpoint {
    pub files: BTreeMap<PathBuf, FileEntry>,
}

impl Checkpoint {
    pub fn from_entries(entries: impl IntoIterator<Item = FileEntry>) -> Self {
        Self {
            files: entries
                .into_iter()
                .map(|e| (e.path.clone(), e))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Reads a checkpoint. A missing or empty file yields `None`.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::Checkpoint(format!(
                    "failed to open {}: {}",
                    path.display(),
                    e
                )));
            }
        };

        let mut contents = Vec::new();
        BufReader::new(file).read_to_end(&mut contents)?;
        if contents.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }

        let checkpoint = serde_json::from_slice(&contents).map_err(|e| {
            Error::Checkpoint(format!("failed to parse {}: {}", path.display(), e))
        })?;
        Ok(Some(checkpoint))
    }

    /// Atomically replaces the checkpoint at `path` with this snapshot.
    pub fn store(&self, path: &Path) -> Result<()> {
        atomic_write(path, self)
    }
}

fn atomic_write(path: &Path, checkpoint: &Checkpoint) -> Result<()> {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::Checkpoint(format!("failed to create parent directory: {}", e))
            })?;
        }
    }

    let unique_id = COUNTER.fetch_add(1, Ordering::SeqCst);
    let temp_path = path.with_extension(format!("tmp.{}.{}", std::process::id(), unique_id));

    let result = write_synced(&temp_path, checkpoint).and_then(|()| {
        fs::rename(&temp_path, path)
            .map_err(|e| Error::Checkpoint(format!("failed to rename checkpoint file: {}", e)))
    });

    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
        return result;
    }

    // the rename itself only survives a crash once the directory is synced
    if let Err(e) = sync_parent_dir(path) {
        warn!(path = %path.display(), error = %e, "Failed to sync checkpoint directory");
    }
    Ok(())
}

fn sync_parent_dir(path: &Path) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    File::open(parent)?.sync_all()
}

fn write_synced(temp_path: &Path, checkpoint: &Checkpoint) -> Result<()> {
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(CHECKPOINT_FILE_MODE)
        .open(temp_path)
        .map_err(|e| Error::Checkpoint(format!("failed to create temp file: {}", e)))?;

    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, checkpoint)
        .map_err(|e| Error::Checkpoint(format!("failed to write checkpoint: {}", e)))?;
    writer
        .flush()
        .map_err(|e| Error::Checkpoint(format!("failed to flush checkpoint: {}", e)))?;

    let file = writer
        .into_inner()
        .map_err(|e| Error::Checkpoint(format!("failed to flush checkpoint: {}", e)))?;
    file.sync_all()
        .map_err(|e| Error::Checkpoint(format!("failed to sync checkpoint: {}", e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tailer::metadata::Metadata;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn sample() -> Checkpoint {
        Checkpoint::from_entries(vec![FileEntry::new(
            PathBuf::from("/var/log/pods/kube-system_coredns-abc_9f2e/coredns/3.log"),
            120,
            100,
            Metadata {
                namespace: "kube-system".to_string(),
                pod_name: "coredns-abc".to_string(),
                container_name: "coredns".to_string(),
                pod_id: "9f2e".to_string(),
                container_id: String::new(),
            },
        )])
    }

    #[test]
    fn test_store_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");

        sample().store(&path).unwrap();
        let loaded = Checkpoint::load(&path).unwrap().unwrap();
        assert_eq!(loaded, sample());
    }

    #[test]
    fn test_wire_format() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        sample().store(&path).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        let entry = &raw["/var/log/pods/kube-system_coredns-abc_9f2e/coredns/3.log"];
        assert_eq!(entry["size"], 120);
        assert_eq!(entry["offset"], 100);
        assert_eq!(
            entry["path"],
            "/var/log/pods/kube-system_coredns-abc_9f2e/coredns/3.log"
        );
        assert_eq!(entry["meta"]["namespace"], "kube-system");
        assert_eq!(entry["meta"]["pod_id"], "9f2e");
    }

    #[test]
    fn test_file_is_owner_only() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        sample().store(&path).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, CHECKPOINT_FILE_MODE);
    }

    #[test]
    fn test_store_replaces_previous_snapshot() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");

        sample().store(&path).unwrap();
        Checkpoint::default().store(&path).unwrap();

        let loaded = Checkpoint::load(&path).unwrap().unwrap();
        assert!(loaded.is_empty());

        // no temp files left behind
        let leftovers = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn test_missing_or_empty_file_is_no_checkpoint() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        assert!(Checkpoint::load(&path).unwrap().is_none());

        fs::write(&path, b"").unwrap();
        assert!(Checkpoint::load(&path).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, b"{\"/a.log\": {\"size\": ").unwrap();

        assert!(matches!(
            Checkpoint::load(&path),
            Err(Error::Checkpoint(_))
        ));
    }

    #[test]
    fn test_sync_parent_dir() {
        let dir = TempDir::new().unwrap();
        assert!(sync_parent_dir(&dir.path().join("state.json")).is_ok());
        assert!(sync_parent_dir(Path::new("state.json")).is_ok());
        assert!(sync_parent_dir(&dir.path().join("missing").join("state.json")).is_err());
    }

    #[test]
    fn test_creates_parent_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("state.json");
        sample().store(&path).unwrap();
        assert!(path.exists());
    }
}
