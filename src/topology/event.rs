// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::tailer::metadata::Metadata;

/// One log line on its way to the backend.
#[derive(Clone, Debug, PartialEq)]
pub struct LogEvent {
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Shared by every event read from the same file.
    pub meta: Arc<Metadata>,
}

impl LogEvent {
    pub fn new(message: String, timestamp: DateTime<Utc>, meta: Arc<Metadata>) -> Self {
        Self {
            message,
            timestamp,
            meta,
        }
    }
}

/// Events handed to a sender worker as one bulk request.
pub type Batch = Vec<LogEvent>;
