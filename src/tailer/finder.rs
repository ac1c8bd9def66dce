// SPDX-License-Identifier: Apache-2.0

use glob::glob;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::tailer::error::{Error, Result};

/// Suffix of the files we tail.
pub const LOG_SUFFIX: &str = "log";

pub fn is_log_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == LOG_SUFFIX)
}

/// FileFinder walks the configured roots for `*.log` files
#[derive(Debug, Clone)]
pub struct FileFinder {
    patterns: Vec<String>,
}

impl FileFinder {
    pub fn new(roots: &[PathBuf]) -> Self {
        let patterns = roots
            .iter()
            .map(|root| {
                let root = glob::Pattern::escape(&root.to_string_lossy());
                format!("{}/**/*.{}", root.trim_end_matches('/'), LOG_SUFFIX)
            })
            .collect();
        Self { patterns }
    }

    /// Finds every log file under the roots, sorted and without duplicates.
    /// Unreadable entries are skipped.
    pub fn find_files(&self) -> Result<Vec<PathBuf>> {
        let mut seen = HashSet::new();
        let mut paths = Vec::new();

        for pattern in &self.patterns {
            let matches = glob(pattern).map_err(|e| Error::InvalidGlob(e.to_string()))?;

            for entry in matches {
                let path = match entry {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::debug!("Skipping unreadable path during scan: {}", e);
                        continue;
                    }
                };

                // symlinks to regular files count, directories do not
                if !path.is_file() {
                    continue;
                }

                if seen.insert(path.clone()) {
                    paths.push(path);
                }
            }
        }

        paths.sort();
        Ok(paths)
    }
}
