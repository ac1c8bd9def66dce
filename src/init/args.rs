// SPDX-License-Identifier: Apache-2.0

use clap::Args;
use std::path::PathBuf;

/// Fallback variable for the config path, checked when `LOGFWD_CONFIG` is unset.
pub const CFG_PATH_ENV: &str = "CFG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "./conf/config.json";

#[derive(Debug, Args, Clone, Default)]
pub struct AgentRun {
    /// Path to the JSON config file
    #[arg(long, env = "LOGFWD_CONFIG")]
    pub config: Option<PathBuf>,
}

impl AgentRun {
    pub fn config_path(&self) -> PathBuf {
        self.config_path_with(std::env::var_os(CFG_PATH_ENV).map(PathBuf::from))
    }

    fn config_path_with(&self, fallback: Option<PathBuf>) -> PathBuf {
        self.config
            .clone()
            .or(fallback.filter(|p| !p.as_os_str().is_empty()))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }
}
