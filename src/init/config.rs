// SPDX-License-Identifier: Apache-2.0

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::exporters::elasticsearch::{BasicAuth, BulkSenderConfig};
use crate::tailer::watcher::WatchMode;
use crate::tailer::{PersisterConfig, TailerConfig};
use crate::topology::dispatcher::DispatcherConfig;

pub const ENV_PREFIX: &str = "LOGFWD_";
const ENV_SPLIT: &str = "__";

const EVENT_QUEUE_MULTIPLIER: usize = 4;
const MIN_EVENT_QUEUE_LEN: usize = 32768;
const FINAL_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load config: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        ConfigError::Load(Box::new(e))
    }
}

/// Process configuration, read once at startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub env: String,
    pub debug_mode: bool,
    pub logs_path: Vec<PathBuf>,
    pub state_path: PathBuf,
    pub watch_mode: WatchMode,
    pub poll_interval_ms: u64,
    pub rescan_interval_ms: u64,
    pub state_flush_interval_ms: u64,
    pub state_flush_changes: u64,
    pub max_line_size: usize,
    pub shutdown_timeout_ms: u64,
    pub elasticsearch: ElasticsearchConfig,
}

#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ElasticsearchConfig {
    pub host: String,
    pub port: u16,
    pub index_name: String,
    /// Milliseconds between timer driven batch flushes
    pub flush_interval: u64,
    pub workers: usize,
    pub batch_size: usize,
    pub api_prefix: String,
    pub use_auth: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub request_timeout_ms: u64,
}

impl std::fmt::Debug for ElasticsearchConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElasticsearchConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("index_name", &self.index_name)
            .field("flush_interval", &self.flush_interval)
            .field("workers", &self.workers)
            .field("batch_size", &self.batch_size)
            .field("api_prefix", &self.api_prefix)
            .field("use_auth", &self.use_auth)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("request_timeout_ms", &self.request_timeout_ms)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            env: "prod".to_string(),
            debug_mode: false,
            logs_path: vec![PathBuf::from("/var/lib/docker/containers")],
            state_path: PathBuf::from("./state.json"),
            watch_mode: WatchMode::Auto,
            poll_interval_ms: 250,
            rescan_interval_ms: 10_000,
            state_flush_interval_ms: 1000,
            state_flush_changes: 1024,
            max_line_size: 1024 * 1024,
            shutdown_timeout_ms: 10_000,
            elasticsearch: ElasticsearchConfig::default(),
        }
    }
}

impl Default for ElasticsearchConfig {
    fn default() -> Self {
        Self {
            host: "http://elasticsearch".to_string(),
            port: 9200,
            index_name: "logfowd".to_string(),
            flush_interval: 1000,
            workers: 10,
            batch_size: 1024,
            api_prefix: String::new(),
            use_auth: false,
            username: None,
            password: None,
            request_timeout_ms: 10_000,
        }
    }
}

impl Config {
    /// Defaults, then the JSON file at `path` if there is one, then
    /// `LOGFWD_*` environment variables.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    fn load_with_prefix(path: &Path, prefix: &str) -> Result<Config, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));
        if path.exists() {
            figment = figment.merge(Json::file(path));
        }
        let config: Config = figment
            .merge(Env::prefixed(prefix).split(ENV_SPLIT))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let es = &self.elasticsearch;
        if es.workers == 0 {
            return Err(invalid("elasticsearch.workers must be greater than zero"));
        }
        if es.batch_size == 0 {
            return Err(invalid("elasticsearch.batch_size must be greater than zero"));
        }
        if es.index_name.is_empty() {
            return Err(invalid("elasticsearch.index_name must not be empty"));
        }
        if es.use_auth && es.username.as_deref().is_none_or(str::is_empty) {
            return Err(invalid("elasticsearch.use_auth requires a username"));
        }

        let intervals = [
            ("poll_interval_ms", self.poll_interval_ms),
            ("rescan_interval_ms", self.rescan_interval_ms),
            ("state_flush_interval_ms", self.state_flush_interval_ms),
            ("shutdown_timeout_ms", self.shutdown_timeout_ms),
            ("elasticsearch.flush_interval", es.flush_interval),
            ("elasticsearch.request_timeout_ms", es.request_timeout_ms),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, v)| *v == 0) {
            return Err(invalid(&format!("{} must be greater than zero", name)));
        }
        if self.state_flush_changes == 0 {
            return Err(invalid("state_flush_changes must be greater than zero"));
        }

        self.tailer_config().validate().map_err(ConfigError::Invalid)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Capacity of the event buffer between readers and dispatcher.
    pub fn event_queue_len(&self) -> usize {
        let es = &self.elasticsearch;
        es.workers
            .saturating_mul(es.batch_size)
            .saturating_mul(EVENT_QUEUE_MULTIPLIER)
            .max(MIN_EVENT_QUEUE_LEN)
    }

    /// Batches waiting for a free sender worker.
    pub fn batch_queue_len(&self) -> usize {
        self.elasticsearch.workers
    }

    pub fn tailer_config(&self) -> TailerConfig {
        TailerConfig {
            roots: self.logs_path.clone(),
            state_path: self.state_path.clone(),
            watch_mode: self.watch_mode,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            rescan_interval: Duration::from_millis(self.rescan_interval_ms),
            max_line_size: self.max_line_size,
        }
    }

    pub fn persister_config(&self) -> PersisterConfig {
        PersisterConfig {
            flush_interval: Duration::from_millis(self.state_flush_interval_ms),
            flush_changes: self.state_flush_changes,
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            batch_size: self.elasticsearch.batch_size,
            flush_interval: Duration::from_millis(self.elasticsearch.flush_interval),
            final_flush_timeout: FINAL_FLUSH_TIMEOUT,
        }
    }

    pub fn bulk_sender_config(&self) -> BulkSenderConfig {
        let es = &self.elasticsearch;
        let auth = es.use_auth.then(|| BasicAuth {
            username: es.username.clone().unwrap_or_default(),
            password: es.password.clone().unwrap_or_default(),
        });

        BulkSenderConfig {
            host: es.host.clone(),
            port: es.port,
            api_prefix: es.api_prefix.clone(),
            index_name: es.index_name.clone(),
            auth,
            request_timeout: Duration::from_millis(es.request_timeout_ms),
        }
    }
}

fn invalid(msg: &str) -> ConfigError {
    ConfigError::Invalid(msg.to_string())
}
