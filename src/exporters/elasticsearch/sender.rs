// SPDX-License-Identifier: Apache-2.0

use std::time::Instant;

use chrono::Utc;
use http::HeaderValue;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tower::retry::Retry;
use tower::timeout::Timeout;
use tower::{BoxError, ServiceBuilder, ServiceExt};
use tracing::{debug, error, info, warn};

use crate::bounded_channel::BoundedReceiver;
use crate::exporters::elasticsearch::client::{BulkRequest, HttpClient};
use crate::exporters::elasticsearch::payload::build_bulk_body;
use crate::exporters::elasticsearch::retry::RetryOnce;
use crate::exporters::elasticsearch::{BulkSenderConfig, CONNECT_TIMEOUT, Error};
use crate::topology::event::{Batch, LogEvent};

/// Response bodies quoted in errors are cut to this many bytes.
const MAX_ERROR_BODY: usize = 512;

#[derive(Deserialize)]
struct BulkSummary {
    #[serde(default)]
    errors: bool,
}

/// Ships batches to the bulk endpoint, one request per batch.
#[derive(Clone)]
pub struct BulkSender {
    config: BulkSenderConfig,
    authorization: Option<HeaderValue>,
    service: Retry<RetryOnce, Timeout<HttpClient>>,
}

impl BulkSender {
    pub fn new(config: BulkSenderConfig) -> Result<Self, Error> {
        let authorization = config
            .auth
            .as_ref()
            .map(|auth| auth.header_value())
            .transpose()?;

        // surface a bad host or prefix at startup rather than on first send
        config.bulk_uri(&config.index_for(Utc::now().date_naive()))?;

        let client = HttpClient::build(CONNECT_TIMEOUT.min(config.request_timeout))
            .map_err(Error::Client)?;
        let service = ServiceBuilder::new()
            .retry(RetryOnce::new())
            .timeout(config.request_timeout)
            .service(client);

        Ok(Self {
            config,
            authorization,
            service,
        })
    }

    /// Sends one batch. A connect failure is retried once, anything else is
    /// returned as is.
    pub async fn send_events(&self, events: &[LogEvent]) -> Result<(), Error> {
        if events.is_empty() {
            return Ok(());
        }

        let index = self.config.index_for(Utc::now().date_naive());
        let body = build_bulk_body(&index, events)?;
        let request = BulkRequest {
            uri: self.config.bulk_uri(&index)?,
            authorization: self.authorization.clone(),
            body,
        };

        let start = Instant::now();
        let response = self
            .service
            .clone()
            .oneshot(request)
            .await
            .map_err(Error::Request)?;
        let duration = start.elapsed();

        if !response.status.is_success() {
            let body = truncate_body(&response.body);
            warn!(
                status = response.status.as_u16(),
                ?duration,
                body = %body,
                "Bulk request rejected"
            );
            return Err(Error::BadStatus {
                status: response.status.as_u16(),
                body,
            });
        }

        // item level failures are the backend's business, but worth a note
        if let Ok(summary) = serde_json::from_slice::<BulkSummary>(&response.body) {
            if summary.errors {
                warn!(index = %index, num = events.len(), "Bulk response reports item errors");
            }
        }

        debug!(
            status = response.status.as_u16(),
            ?duration,
            index = %index,
            num = events.len(),
            "Bulk request completed"
        );
        Ok(())
    }
}

fn truncate_body(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    if text.len() <= MAX_ERROR_BODY {
        return text.into_owned();
    }
    let mut cut = MAX_ERROR_BODY;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &text[..cut])
}

/// One member of the sender pool.
pub struct SenderWorker {
    id: usize,
    sender: BulkSender,
    batch_rx: BoundedReceiver<Batch>,
}

impl SenderWorker {
    pub fn new(id: usize, sender: BulkSender, batch_rx: BoundedReceiver<Batch>) -> Self {
        Self {
            id,
            sender,
            batch_rx,
        }
    }

    /// Sends batches until the batch queue is closed and empty.
    ///
    /// `shutdown` only changes how failures are handled: before it fires the
    /// first failed batch ends the worker with an error, after it fires
    /// failures are logged and the worker keeps draining.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<(), BoxError> {
        debug!(worker = self.id, "Sender worker started");

        while let Some(batch) = self.batch_rx.next().await {
            let num = batch.len();
            match self.sender.send_events(&batch).await {
                Ok(()) => info!(worker = self.id, num, "Sent events"),
                Err(e) if shutdown.is_cancelled() => {
                    error!(worker = self.id, num, error = %e, "Failed to send events during shutdown");
                }
                Err(e) => {
                    error!(worker = self.id, num, error = %e, "Failed to send events");
                    return Err(e.into());
                }
            }
        }

        debug!(worker = self.id, "Sender worker stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounded_channel::bounded;
    use crate::exporters::elasticsearch::BasicAuth;
    use crate::tailer::metadata::Metadata;
    use httpmock::prelude::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn config(server: &MockServer) -> BulkSenderConfig {
        BulkSenderConfig {
            host: "http://127.0.0.1".to_string(),
            port: server.port(),
            index_name: "logs".to_string(),
            request_timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    fn events(n: usize) -> Vec<LogEvent> {
        let meta = Arc::new(Metadata {
            namespace: "default".to_string(),
            pod_name: "api-0".to_string(),
            container_name: "api".to_string(),
            pod_id: "42".to_string(),
            container_id: String::new(),
        });
        (0..n)
            .map(|i| LogEvent::new(format!("line {}", i), Utc::now(), meta.clone()))
            .collect()
    }

    fn bulk_path() -> String {
        format!("/logs-{}/_bulk", Utc::now().format("%Y.%m.%d"))
    }

    #[tokio::test]
    async fn test_send_events_posts_bulk_body() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path(bulk_path())
                .header("content-type", "application/json")
                .body_contains("\"message\":\"line 2\"")
                .body_contains("\"pod_name\":\"api-0\"");
            then.status(200).body(r#"{"took":1,"errors":false,"items":[]}"#);
        });

        let sender = BulkSender::new(config(&server)).unwrap();
        sender.send_events(&events(3)).await.unwrap();

        mock.assert();
    }

    #[tokio::test]
    async fn test_basic_auth_and_prefix() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path(format!("/es{}", bulk_path()))
                .header("authorization", "Basic dXNlcjpwYXNz");
            then.status(200);
        });

        let sender = BulkSender::new(BulkSenderConfig {
            api_prefix: "/es".to_string(),
            auth: Some(BasicAuth {
                username: "user".to_string(),
                password: "pass".to_string(),
            }),
            ..config(&server)
        })
        .unwrap();
        sender.send_events(&events(1)).await.unwrap();

        mock.assert();
    }

    #[tokio::test]
    async fn test_bad_status_is_not_retried() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path(bulk_path());
            then.status(503).body("overloaded");
        });

        let sender = BulkSender::new(config(&server)).unwrap();
        let err = sender.send_events(&events(2)).await.unwrap_err();

        match err {
            Error::BadStatus { status, body } => {
                assert_eq!(status, 503);
                assert_eq!(body, "overloaded");
            }
            other => panic!("unexpected error: {}", other),
        }
        mock.assert_hits(1);
    }

    #[tokio::test]
    async fn test_connection_refused_fails_after_retry() {
        // grab a free port, then close it
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let sender = BulkSender::new(BulkSenderConfig {
            host: "http://127.0.0.1".to_string(),
            port,
            request_timeout: Duration::from_secs(5),
            ..Default::default()
        })
        .unwrap();

        let err = sender.send_events(&events(1)).await.unwrap_err();
        assert!(matches!(err, Error::Request(_)));
    }

    #[tokio::test]
    async fn test_empty_batch_sends_nothing() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST);
            then.status(200);
        });

        let sender = BulkSender::new(config(&server)).unwrap();
        sender.send_events(&[]).await.unwrap();
        mock.assert_hits(0);
    }

    #[tokio::test]
    async fn test_worker_drains_queue_and_exits() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path(bulk_path());
            then.status(200);
        });

        let (batch_tx, batch_rx) = bounded(4);
        let mut worker = SenderWorker::new(0, BulkSender::new(config(&server)).unwrap(), batch_rx);

        batch_tx.send(events(3)).await.unwrap();
        batch_tx.send(events(2)).await.unwrap();
        drop(batch_tx);

        worker.run(CancellationToken::new()).await.unwrap();
        mock.assert_hits(2);
    }

    #[tokio::test]
    async fn test_worker_failure_is_fatal_before_shutdown() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST);
            then.status(400);
        });

        let (batch_tx, batch_rx) = bounded(4);
        let mut worker = SenderWorker::new(0, BulkSender::new(config(&server)).unwrap(), batch_rx);
        batch_tx.send(events(1)).await.unwrap();

        assert!(worker.run(CancellationToken::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_worker_keeps_draining_during_shutdown() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST);
            then.status(500);
        });

        let (batch_tx, batch_rx) = bounded(4);
        let mut worker = SenderWorker::new(0, BulkSender::new(config(&server)).unwrap(), batch_rx);
        for _ in 0..3 {
            batch_tx.send(events(1)).await.unwrap();
        }
        drop(batch_tx);

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        worker.run(shutdown).await.unwrap();
        mock.assert_hits(3);
    }

    #[test]
    fn test_truncate_body() {
        let long = "x".repeat(MAX_ERROR_BODY + 10);
        let out = truncate_body(long.as_bytes());
        assert_eq!(out.len(), MAX_ERROR_BODY + 3);
        assert!(out.ends_with("..."));
        assert_eq!(truncate_body(b"short"), "short");
    }
}
