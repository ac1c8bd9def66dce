// SPDX-License-Identifier: Apache-2.0

//! Configuration for the tailing side of the pipeline.

use std::path::PathBuf;
use std::time::Duration;

use crate::tailer::watcher::WatchMode;

/// Configuration for the log tailer
#[derive(Debug, Clone)]
pub struct TailerConfig {
    /// Root directories scanned recursively for `*.log` files
    pub roots: Vec<PathBuf>,
    /// Checkpoint file
    pub state_path: PathBuf,
    /// Watch mode: auto, native, or poll
    pub watch_mode: WatchMode,
    /// Poll interval when the poll watcher is in use
    pub poll_interval: Duration,
    /// Interval between full re-scans of the roots
    pub rescan_interval: Duration,
    /// Maximum log line size in bytes
    pub max_line_size: usize,
}

impl Default for TailerConfig {
    fn default() -> Self {
        Self {
            roots: vec![PathBuf::from("/var/lib/docker/containers")],
            state_path: PathBuf::from("./state.json"),
            watch_mode: WatchMode::Auto,
            poll_interval: Duration::from_millis(250),
            rescan_interval: Duration::from_secs(10),
            max_line_size: 1024 * 1024,
        }
    }
}

impl TailerConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.roots.is_empty() {
            return Err("At least one log root must be specified".to_string());
        }
        if self.state_path.as_os_str().is_empty() {
            return Err("State path must not be empty".to_string());
        }
        if self.max_line_size == 0 {
            return Err("max_line_size must be greater than zero".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(TailerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_empty_roots_rejected() {
        let config = TailerConfig {
            roots: vec![],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
