// SPDX-License-Identifier: Apache-2.0

//! Checkpoint persister.
//!
//! Runs as its own task and is the only writer of the checkpoint file. A
//! snapshot is written on every interval tick that finds pending changes,
//! and immediately once the pending count reaches the configured threshold.
//! A final snapshot is written unconditionally when the task is cancelled,
//! which the agent does only after every producer of changes has stopped.

use std::path::PathBuf;
use std::time::Duration;

use tokio::select;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::bounded_channel::BoundedReceiver;
use crate::tailer::error::Result;
use crate::tailer::store::SharedPositionStore;

/// Configuration for the checkpoint persister
#[derive(Debug, Clone)]
pub struct PersisterConfig {
    /// Interval between timer driven checkpoints
    pub flush_interval: Duration,
    /// Pending change count that forces a checkpoint
    pub flush_changes: u64,
}

impl Default for PersisterConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(1),
            flush_changes: 1024,
        }
    }
}

pub struct Persister {
    store: SharedPositionStore,
    path: PathBuf,
    config: PersisterConfig,
    changes: BoundedReceiver<()>,
}

impl Persister {
    pub fn new(store: SharedPositionStore, path: PathBuf, config: PersisterConfig) -> Self {
        let changes = store.changes();
        Self {
            store,
            path,
            config,
            changes,
        }
    }

    /// Run until cancelled, then write the final checkpoint.
    ///
    /// A failed write is returned immediately so the agent can shut down.
    pub async fn run(&mut self, cancel_token: CancellationToken) -> Result<()> {
        info!(path = %self.path.display(), "Checkpoint persister started");

        let period = self.config.flush_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                biased;

                _ = cancel_token.cancelled() => {
                    debug!("Checkpoint persister cancelled");
                    break;
                }

                _ = ticker.tick() => {
                    if self.store.pending_changes() > 0 {
                        if let Err(e) = self.persist() {
                            error!(error = %e, "Failed to write checkpoint by timer");
                            return Err(e);
                        }
                    }
                }

                Some(()) = self.changes.next() => {
                    if self.store.pending_changes() >= self.config.flush_changes {
                        if let Err(e) = self.persist() {
                            error!(error = %e, "Failed to write checkpoint by change count");
                            return Err(e);
                        }
                    }
                }
            }
        }

        let files = self.persist()?;
        info!(files, "Final checkpoint written");
        Ok(())
    }

    /// Snapshot the store and replace the checkpoint file.
    pub fn persist(&self) -> Result<usize> {
        let pending = self.store.pending_changes();
        let snapshot = self.store.flush(pending);
        snapshot.store(&self.path)?;

        debug!(files = snapshot.len(), changes = pending, "Checkpoint written");
        Ok(snapshot.len())
    }
}
