// SPDX-License-Identifier: Apache-2.0

//! Batch dispatcher.
//!
//! Drains the event buffer into batches for the sender workers:
//! - on every timer tick, everything queued at that moment becomes one batch
//! - on a has-event signal, exactly `batch_size` events are flushed once that
//!   many are queued, the rest stay queued
//! - on cancellation, whatever is left is flushed once and the batch queue is
//!   closed so the workers can finish

use std::time::Duration;

use tokio::select;
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout};
use tokio_util::sync::CancellationToken;
use tower::BoxError;
use tracing::{debug, info, warn};

use crate::bounded_channel::BoundedSender;
use crate::topology::buffer::EventQueue;
use crate::topology::event::Batch;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
    /// Upper bound on the final flush during shutdown
    pub final_flush_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 1024,
            flush_interval: Duration::from_millis(1000),
            final_flush_timeout: Duration::from_secs(5),
        }
    }
}

pub struct Dispatcher {
    queue: EventQueue,
    batch_tx: Option<BoundedSender<Batch>>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(queue: EventQueue, batch_tx: BoundedSender<Batch>, config: DispatcherConfig) -> Self {
        Self {
            queue,
            batch_tx: Some(batch_tx),
            config,
        }
    }

    pub async fn run(&mut self, cancel_token: CancellationToken) -> Result<(), BoxError> {
        info!(
            batch_size = self.config.batch_size,
            flush_interval = ?self.config.flush_interval,
            "Batch dispatcher started"
        );

        let period = self.config.flush_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            select! {
                biased;

                _ = cancel_token.cancelled() => {
                    debug!("Batch dispatcher cancelled");
                    break Ok(());
                }

                _ = ticker.tick() => {
                    if let Err(e) = self.flush_by_timer().await {
                        break Err(e);
                    }
                }

                Some(()) = self.queue.has_event_rx.next() => {
                    if let Err(e) = self.flush_by_limit().await {
                        break Err(e);
                    }
                }
            }
        };

        if result.is_ok() {
            match timeout(self.config.final_flush_timeout, self.flush_remaining()).await {
                Ok(Ok(n)) if n > 0 => info!(num = n, "Flushed remaining events before shutdown"),
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(error = %e, "Failed to flush remaining events"),
                Err(_) => warn!(
                    remaining = self.queue.len(),
                    "Timed out flushing remaining events"
                ),
            }
        }

        // closing the batch queue lets the workers drain and exit
        self.batch_tx = None;
        info!("Batch dispatcher stopped");
        result
    }

    /// Flushes exactly what is queued right now. Returns the batch size.
    pub async fn flush_by_timer(&mut self) -> Result<usize, BoxError> {
        let num = self.queue.len();
        if num == 0 {
            return Ok(0);
        }

        let batch = self.queue.events_rx.drain_up_to(num);
        let sent = self.dispatch(batch).await?;
        debug!(
            num = sent,
            remaining = self.queue.len(),
            "Flushed events to senders by timer"
        );
        Ok(sent)
    }

    /// Flushes one full batch if enough events are queued.
    pub async fn flush_by_limit(&mut self) -> Result<usize, BoxError> {
        if self.queue.len() < self.config.batch_size {
            return Ok(0);
        }

        let batch = self.queue.events_rx.drain_up_to(self.config.batch_size);
        let sent = self.dispatch(batch).await?;
        debug!(
            num = sent,
            remaining = self.queue.len(),
            "Flushed events to senders by batch size"
        );
        Ok(sent)
    }

    /// Flushes every queued event as one batch.
    pub async fn flush_remaining(&mut self) -> Result<usize, BoxError> {
        let batch = self.queue.events_rx.drain_up_to(usize::MAX);
        self.dispatch(batch).await
    }

    async fn dispatch(&mut self, batch: Batch) -> Result<usize, BoxError> {
        let num = batch.len();
        if num == 0 {
            return Ok(0);
        }

        let Some(batch_tx) = self.batch_tx.as_ref() else {
            return Err("batch queue already closed".into());
        };

        batch_tx
            .send(batch)
            .await
            .map_err(|_| -> BoxError { "sender workers are gone, batch queue closed".into() })?;
        Ok(num)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounded_channel::{BoundedReceiver, bounded};
    use crate::tailer::metadata::Metadata;
    use crate::topology::buffer::EventBuffer;
    use crate::topology::event::LogEvent;
    use chrono::Utc;
    use std::sync::Arc;

    fn setup(batch_size: usize) -> (EventBuffer, Dispatcher, BoundedReceiver<Batch>) {
        let (buffer, queue) = EventBuffer::new(8192);
        let (batch_tx, batch_rx) = bounded(16);
        let config = DispatcherConfig {
            batch_size,
            flush_interval: Duration::from_millis(50),
            final_flush_timeout: Duration::from_secs(1),
        };
        (buffer, Dispatcher::new(queue, batch_tx, config), batch_rx)
    }

    fn push_n(buffer: &EventBuffer, n: usize) {
        let meta = Arc::new(Metadata::default());
        for i in 0..n {
            assert!(buffer.push(LogEvent::new(format!("{}", i), Utc::now(), meta.clone())));
        }
    }

    #[tokio::test]
    async fn test_timer_flush_takes_exactly_what_is_queued() {
        let (buffer, mut dispatcher, batch_rx) = setup(1024);
        push_n(&buffer, 37);

        assert_eq!(dispatcher.flush_by_timer().await.unwrap(), 37);
        assert_eq!(batch_rx.try_recv().unwrap().len(), 37);

        // nothing queued, nothing sent
        assert_eq!(dispatcher.flush_by_timer().await.unwrap(), 0);
        assert!(batch_rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_limit_flush_takes_exactly_batch_size() {
        let (buffer, mut dispatcher, batch_rx) = setup(1024);

        push_n(&buffer, 1000);
        assert_eq!(dispatcher.flush_by_limit().await.unwrap(), 0);

        push_n(&buffer, 500);
        assert_eq!(dispatcher.flush_by_limit().await.unwrap(), 1024);
        assert_eq!(batch_rx.try_recv().unwrap().len(), 1024);
        assert_eq!(buffer.len(), 476);

        // remainder is below the threshold
        assert_eq!(dispatcher.flush_by_limit().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_batches_preserve_push_order() {
        let (buffer, mut dispatcher, batch_rx) = setup(4);
        push_n(&buffer, 6);

        dispatcher.flush_by_limit().await.unwrap();
        dispatcher.flush_by_timer().await.unwrap();

        let first: Vec<String> = batch_rx.try_recv().unwrap().into_iter().map(|e| e.message).collect();
        let second: Vec<String> = batch_rx.try_recv().unwrap().into_iter().map(|e| e.message).collect();
        assert_eq!(first, vec!["0", "1", "2", "3"]);
        assert_eq!(second, vec!["4", "5"]);
    }

    #[tokio::test]
    async fn test_run_threshold_then_timer() {
        let (buffer, mut dispatcher, mut batch_rx) = setup(1024);
        push_n(&buffer, 1500);

        let cancel = CancellationToken::new();
        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move { dispatcher.run(cancel).await })
        };

        let first = batch_rx.next().await.unwrap();
        let second = batch_rx.next().await.unwrap();
        assert_eq!(first.len(), 1024);
        assert_eq!(second.len(), 476);

        cancel.cancel();
        handle.await.unwrap().unwrap();
        // queue is closed once the dispatcher is done
        assert!(batch_rx.next().await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_flushes_remaining_once() {
        let (buffer, queue) = EventBuffer::new(64);
        let (batch_tx, mut batch_rx) = bounded(4);
        let config = DispatcherConfig {
            batch_size: 1024,
            flush_interval: Duration::from_secs(3600),
            final_flush_timeout: Duration::from_secs(1),
        };
        let mut dispatcher = Dispatcher::new(queue, batch_tx, config);
        push_n(&buffer, 10);

        let cancel = CancellationToken::new();
        cancel.cancel();
        dispatcher.run(cancel).await.unwrap();

        assert_eq!(batch_rx.next().await.unwrap().len(), 10);
        assert!(batch_rx.next().await.is_none());
    }

    #[tokio::test]
    async fn test_dispatch_fails_when_workers_are_gone() {
        let (buffer, mut dispatcher, batch_rx) = setup(2);
        drop(batch_rx);
        push_n(&buffer, 2);

        assert!(dispatcher.flush_by_limit().await.is_err());
    }
}
