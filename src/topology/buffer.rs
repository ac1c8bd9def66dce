// SPDX-License-Identifier: Apache-2.0

//! Event buffer between the readers and the dispatcher.
//!
//! Pushing never waits. When the queue is full the event is dropped and the
//! overflow is logged, so a slow backend never stalls file reads.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use crate::bounded_channel::{BoundedReceiver, BoundedSender, TrySendError, bounded};
use crate::topology::event::LogEvent;

/// Drops are logged on the first one and then once per this many.
const DROP_LOG_EVERY: u64 = 1024;

/// Producer side, cloned into every reader task.
#[derive(Clone)]
pub struct EventBuffer {
    events_tx: BoundedSender<LogEvent>,
    has_event_tx: BoundedSender<()>,
    dropped: Arc<AtomicU64>,
}

/// Consumer side, owned by the dispatcher.
pub struct EventQueue {
    pub(crate) events_rx: BoundedReceiver<LogEvent>,
    pub(crate) has_event_rx: BoundedReceiver<()>,
}

impl EventBuffer {
    pub fn new(capacity: usize) -> (EventBuffer, EventQueue) {
        let (events_tx, events_rx) = bounded(capacity);
        let (has_event_tx, has_event_rx) = bounded(capacity);

        (
            EventBuffer {
                events_tx,
                has_event_tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            EventQueue {
                events_rx,
                has_event_rx,
            },
        )
    }

    /// Queues an event. Returns false if it was dropped.
    pub fn push(&self, event: LogEvent) -> bool {
        match self.events_tx.try_send(event) {
            Ok(()) => {
                // wake-up only, losing one is harmless
                let _ = self.has_event_tx.try_send(());
                true
            }
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % DROP_LOG_EVERY == 0 {
                    warn!(
                        dropped,
                        capacity = self.events_tx.capacity(),
                        "Event buffer overflowed, dropping events"
                    );
                }
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("Event buffer closed, dropping event");
                false
            }
        }
    }

    /// Total events dropped on overflow so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.events_tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events_tx.is_empty()
    }
}

impl EventQueue {
    pub fn len(&self) -> usize {
        self.events_rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events_rx.is_empty()
    }
}
