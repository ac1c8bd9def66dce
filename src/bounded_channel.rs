// SPDX-License-Identifier: Apache-2.0

//! Bounded multi-producer, multi-consumer queues shared by every stage of the
//! pipeline. Async stages use `send`/`next`, blocking threads use the
//! `*_blocking` variants and lossy producers use `try_send`.

use flume::{Receiver, Sender};
use std::fmt;

pub struct BoundedSender<T> {
    tx: Sender<T>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SendError {
    Disconnected,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Disconnected => write!(f, "channel disconnected"),
        }
    }
}

impl std::error::Error for SendError {}

/// Returned by [`BoundedSender::try_send`], hands the rejected item back.
#[derive(Debug, PartialEq, Eq)]
pub enum TrySendError<T> {
    Full(T),
    Disconnected(T),
}

impl<T> TrySendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            TrySendError::Full(item) | TrySendError::Disconnected(item) => item,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, TrySendError::Full(_))
    }
}

impl<T> fmt::Display for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrySendError::Full(_) => write!(f, "channel full"),
            TrySendError::Disconnected(_) => write!(f, "channel disconnected"),
        }
    }
}

impl<T> BoundedSender<T> {
    pub async fn send(&self, item: T) -> Result<(), SendError> {
        match self.tx.send_async(item).await {
            Ok(()) => Ok(()),
            Err(_e) => Err(SendError::Disconnected), // receiver closed
        }
    }

    /// Blocking send - blocks until there is capacity in the channel.
    /// Use this from non-async contexts (e.g., dedicated OS threads).
    pub fn send_blocking(&self, item: T) -> Result<(), SendError> {
        match self.tx.send(item) {
            Ok(()) => Ok(()),
            Err(_e) => Err(SendError::Disconnected), // receiver closed
        }
    }

    /// Non-blocking send. Never waits for capacity.
    pub fn try_send(&self, item: T) -> Result<(), TrySendError<T>> {
        self.tx.try_send(item).map_err(|e| match e {
            flume::TrySendError::Full(item) => TrySendError::Full(item),
            flume::TrySendError::Disconnected(item) => TrySendError::Disconnected(item),
        })
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.tx.capacity()
    }
}

impl<T> Clone for BoundedSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

#[derive(Clone)]
pub struct BoundedReceiver<T> {
    rx: Receiver<T>,
}

impl<T> BoundedReceiver<T> {
    pub async fn next(&mut self) -> Option<T> {
        match self.rx.recv_async().await {
            Ok(item) => Some(item),
            Err(_e) => None, // disconnected
        }
    }

    /// Non-blocking receive - returns immediately.
    /// Returns None if no item is available or channel is disconnected.
    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Pops at most `max` queued items without waiting.
    pub fn drain_up_to(&self, max: usize) -> Vec<T> {
        let mut items = Vec::with_capacity(max.min(self.rx.len()));
        while items.len() < max {
            match self.rx.try_recv() {
                Ok(item) => items.push(item),
                Err(_) => break,
            }
        }
        items
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

pub fn bounded<T>(size: usize) -> (BoundedSender<T>, BoundedReceiver<T>) {
    let (tx, rx) = flume::bounded::<T>(size);

    let sender = BoundedSender { tx };
    let receiver = BoundedReceiver { rx };

    (sender, receiver)
}

#[cfg(test)]
mod tests {
    use super::{SendError, TrySendError, bounded};
    use tokio_test::{assert_ok, assert_pending, assert_ready, task::spawn};

    #[tokio::test]
    async fn basics() {
        let (tx, mut rx) = bounded(3);

        let msg = 10;

        let mut send1 = spawn(async { tx.send(msg).await });
        let mut recv1 = spawn(async { rx.next().await });

        assert!(!send1.is_woken());
        assert!(!recv1.is_woken());

        assert_pending!(recv1.poll());

        assert_ok!(assert_ready!(send1.poll()));

        assert!(recv1.is_woken());

        assert_eq!(Some(msg), assert_ready!(recv1.poll()));

        drop(send1);
        drop(recv1);

        let mut recv2 = spawn(async { rx.next().await });

        drop(tx);
        // receives None since send channel was closed
        assert_eq!(None, assert_ready!(recv2.poll()));
    }

    #[tokio::test]
    async fn sender_blocks_on_full() {
        let (tx, mut rx) = bounded(1);

        let mut send1 = spawn(async { tx.send(1).await });
        let mut recv1 = spawn(async { rx.next().await });

        assert_ok!(assert_ready!(send1.poll()));

        drop(send1);
        let mut send2 = spawn(async { tx.send(2).await });

        // Now blocks
        assert_pending!(send2.poll());

        assert_eq!(Some(1), assert_ready!(recv1.poll()));

        assert_ok!(assert_ready!(send2.poll()));
    }

    #[tokio::test]
    async fn sender_fails_on_rx_close() {
        let (tx, rx) = bounded(1);

        let mut send1 = spawn(async { tx.send(10).await });

        drop(rx);
        assert_eq!(Err(SendError::Disconnected), assert_ready!(send1.poll()));
    }

    #[test]
    fn try_send_rejects_when_full() {
        let (tx, rx) = bounded(2);

        assert!(tx.try_send(1).is_ok());
        assert!(tx.try_send(2).is_ok());

        let err = tx.try_send(3).unwrap_err();
        assert!(err.is_full());
        assert_eq!(err.into_inner(), 3);

        assert_eq!(rx.try_recv(), Some(1));
        assert!(tx.try_send(3).is_ok());

        drop(rx);
        assert_eq!(tx.try_send(4), Err(TrySendError::Disconnected(4)));
    }

    #[test]
    fn drain_up_to_leaves_remainder() {
        let (tx, rx) = bounded(10);
        for i in 0..7 {
            tx.try_send(i).unwrap();
        }

        assert_eq!(rx.drain_up_to(5), vec![0, 1, 2, 3, 4]);
        assert_eq!(rx.len(), 2);
        assert_eq!(rx.drain_up_to(5), vec![5, 6]);
        assert!(rx.is_empty());
    }
}
