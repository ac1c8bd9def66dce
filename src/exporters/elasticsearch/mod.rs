// SPDX-License-Identifier: Apache-2.0

//! Elasticsearch `_bulk` exporter.
//!
//! A fixed pool of [`SenderWorker`]s pulls batches from the dispatcher and
//! ships each one as a single bulk request through [`BulkSender`].

mod client;
mod payload;
mod retry;
mod sender;

pub use client::{BulkRequest, BulkResponse, ConnectError};
pub use payload::build_bulk_body;
pub use retry::RetryOnce;
pub use sender::{BulkSender, SenderWorker};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::NaiveDate;
use http::{HeaderValue, Uri};
use std::time::Duration;
use thiserror::Error;
use tower::BoxError;

/// Upper bound on how long establishing a connection may take.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to encode bulk body: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("invalid bulk endpoint {0}")]
    InvalidEndpoint(String),

    #[error("failed to build HTTP client: {0}")]
    Client(BoxError),

    #[error("bulk request failed: {0}")]
    Request(BoxError),

    #[error("bulk request rejected with status {status}: {body}")]
    BadStatus { status: u16, body: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

impl BasicAuth {
    pub fn header_value(&self) -> Result<HeaderValue, Error> {
        let encoded = STANDARD.encode(format!("{}:{}", self.username, self.password));
        HeaderValue::from_str(&format!("Basic {}", encoded))
            .map_err(|e| Error::InvalidEndpoint(format!("authorization header: {}", e)))
    }
}

#[derive(Clone, Debug)]
pub struct BulkSenderConfig {
    /// Scheme and host, e.g. `http://elasticsearch`. Plain hosts get `http://`.
    pub host: String,
    pub port: u16,
    /// Path prepended to the index, e.g. `/es` behind a proxy.
    pub api_prefix: String,
    /// Base index name, a `-YYYY.MM.DD` suffix is added per request.
    pub index_name: String,
    pub auth: Option<BasicAuth>,
    pub request_timeout: Duration,
}

impl Default for BulkSenderConfig {
    fn default() -> Self {
        Self {
            host: "http://elasticsearch".to_string(),
            port: 9200,
            api_prefix: String::new(),
            index_name: "logfowd".to_string(),
            auth: None,
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl BulkSenderConfig {
    /// Daily index the events of `date` go to.
    pub fn index_for(&self, date: NaiveDate) -> String {
        format!("{}-{}", self.index_name, date.format("%Y.%m.%d"))
    }

    pub fn bulk_uri(&self, index: &str) -> Result<Uri, Error> {
        let host = self.host.trim_end_matches('/');
        let host = if host.contains("://") {
            host.to_string()
        } else {
            format!("http://{}", host)
        };

        let prefix = self.api_prefix.trim_matches('/');
        let url = if prefix.is_empty() {
            format!("{}:{}/{}/_bulk", host, self.port, index)
        } else {
            format!("{}:{}/{}/{}/_bulk", host, self.port, prefix, index)
        };

        url.parse::<Uri>()
            .map_err(|e| Error::InvalidEndpoint(format!("{}: {}", url, e)))
    }
}
