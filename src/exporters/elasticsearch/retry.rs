// SPDX-License-Identifier: Apache-2.0

use std::future::{Ready, ready};
use tower::BoxError;
use tower::retry::Policy;
use tracing::warn;

use crate::exporters::elasticsearch::client::{BulkRequest, BulkResponse, ConnectError};

/// Retries a request exactly once, and only when the first attempt never
/// reached the server. Everything else goes straight back to the caller.
#[derive(Clone, Debug, Default)]
pub struct RetryOnce {
    retried: bool,
}

impl RetryOnce {
    pub fn new() -> Self {
        Self::default()
    }
}

fn is_connect_error(err: &BoxError) -> bool {
    err.downcast_ref::<ConnectError>().is_some()
}

impl Policy<BulkRequest, BulkResponse, BoxError> for RetryOnce {
    type Future = Ready<()>;

    fn retry(
        &mut self,
        _req: &mut BulkRequest,
        result: &mut Result<BulkResponse, BoxError>,
    ) -> Option<Self::Future> {
        if self.retried {
            return None;
        }

        match result {
            Err(e) if is_connect_error(e) => {
                self.retried = true;
                warn!(error = %e, "Bulk request could not connect, retrying once");
                Some(ready(()))
            }
            _ => None,
        }
    }

    fn clone_request(&mut self, req: &BulkRequest) -> Option<BulkRequest> {
        Some(req.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::{StatusCode, Uri};

    fn request() -> BulkRequest {
        BulkRequest {
            uri: Uri::from_static("http://localhost:9200/i/_bulk"),
            authorization: None,
            body: Bytes::from_static(b"\n"),
        }
    }

    #[test]
    fn test_connect_error_retried_once() {
        let mut policy = RetryOnce::new();
        let mut req = request();

        let mut result: Result<BulkResponse, BoxError> = Err(ConnectError {}.into());
        assert!(policy.retry(&mut req, &mut result).is_some());

        let mut result: Result<BulkResponse, BoxError> = Err(ConnectError {}.into());
        assert!(policy.retry(&mut req, &mut result).is_none());
    }

    #[test]
    fn test_other_failures_not_retried() {
        let mut policy = RetryOnce::new();
        let mut req = request();

        let mut elapsed: Result<BulkResponse, BoxError> =
            Err(Box::new(tower::timeout::error::Elapsed::new()));
        assert!(policy.retry(&mut req, &mut elapsed).is_none());

        let mut bad_status: Result<BulkResponse, BoxError> = Ok(BulkResponse {
            status: StatusCode::SERVICE_UNAVAILABLE,
            body: Bytes::new(),
        });
        assert!(policy.retry(&mut req, &mut bad_status).is_none());

        let mut ok: Result<BulkResponse, BoxError> = Ok(BulkResponse {
            status: StatusCode::OK,
            body: Bytes::new(),
        });
        assert!(policy.retry(&mut req, &mut ok).is_none());
    }
}
