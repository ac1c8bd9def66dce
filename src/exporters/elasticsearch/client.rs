// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::{HeaderValue, Method, Request, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper_rustls::{ConfigBuilderExt, HttpsConnector};
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use rustls::ClientConfig;
use rustls::crypto::CryptoProvider;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tower::{BoxError, Service};

#[derive(Debug)]
pub struct ConnectError;
impl Display for ConnectError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "unable to connect")
    }
}
impl Error for ConnectError {}

/// A bulk POST, cheap to clone for a retry.
#[derive(Debug, Clone)]
pub struct BulkRequest {
    pub uri: Uri,
    pub authorization: Option<HeaderValue>,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
pub struct BulkResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

pub(crate) fn init_crypto_provider() -> Result<(), BoxError> {
    if CryptoProvider::get_default().is_none() {
        // losing the race to another installer is fine
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            if CryptoProvider::get_default().is_none() {
                return Err(format!("failed to initialize crypto library: {:?}", e).into());
            }
        }
    }
    Ok(())
}

fn build_hyper_client(
    connect_timeout: Duration,
) -> Result<HyperClient<HttpsConnector<HttpConnector>, Full<Bytes>>, BoxError> {
    init_crypto_provider()?;

    let tls_config = ClientConfig::builder()
        .with_native_roots()?
        .with_no_client_auth();

    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_connect_timeout(Some(connect_timeout));

    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(tls_config)
        .https_or_http()
        .enable_http1()
        .wrap_connector(http);

    let client = hyper_util::client::legacy::Client::builder(TokioExecutor::new())
        .pool_idle_timeout(Duration::from_secs(30))
        .pool_max_idle_per_host(16)
        .timer(TokioTimer::new())
        .build::<_, Full<Bytes>>(https);

    Ok(client)
}

#[derive(Clone)]
pub struct HttpClient {
    inner: HyperClient<HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl HttpClient {
    pub fn build(connect_timeout: Duration) -> Result<Self, BoxError> {
        Ok(Self {
            inner: build_hyper_client(connect_timeout)?,
        })
    }

    async fn perform_request(&self, req: BulkRequest) -> Result<BulkResponse, BoxError> {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(req.uri)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(auth) = req.authorization {
            builder = builder.header(AUTHORIZATION, auth);
        }
        let request = builder.body(Full::new(req.body))?;

        match self.inner.request(request).await {
            Err(e) => {
                if e.is_connect() {
                    Err(ConnectError {}.into())
                } else {
                    Err(e.into())
                }
            }
            Ok(resp) => {
                let (head, body) = resp.into_parts();
                let body = body
                    .collect()
                    .await
                    .map_err(|e| format!("failed reading response: {}", e))?
                    .to_bytes();

                Ok(BulkResponse {
                    status: head.status,
                    body,
                })
            }
        }
    }
}

impl Service<BulkRequest> for HttpClient {
    type Response = BulkResponse;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: BulkRequest) -> Self::Future {
        let this = self.clone();
        Box::pin(async move { this.perform_request(req).await })
    }
}
