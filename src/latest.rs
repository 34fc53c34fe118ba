//! Single-slot overwrite channel.
//!
//! A `crossbeam_channel::bounded(1)` whose sender evicts the undelivered value instead of
//! blocking. Memory is bounded at one value in flight; the consumer always sees the newest
//! value and never a backlog.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub(crate) fn latest<T>() -> (LatestSender<T>, LatestReceiver<T>) {
    let (tx, rx) = bounded(1);
    let closed = Arc::new(AtomicBool::new(false));
    (
        LatestSender {
            tx,
            evict: rx.clone(),
            closed: closed.clone(),
        },
        LatestReceiver { rx, closed },
    )
}

/// Returned when the receiving side is gone. Carries the value back.
#[derive(Debug)]
pub(crate) struct Closed<T>(pub T);

pub(crate) struct LatestSender<T> {
    tx: Sender<T>,
    // Receiver clone used only to evict a stale value.
    evict: Receiver<T>,
    closed: Arc<AtomicBool>,
}

impl<T> LatestSender<T> {
    /// Store `value`, returning the undelivered value it replaced, if any.
    pub(crate) fn send(&self, value: T) -> Result<Option<T>, Closed<T>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Closed(value));
        }
        let mut value = value;
        let mut displaced = None;
        loop {
            match self.tx.try_send(value) {
                Ok(()) => return Ok(displaced),
                Err(TrySendError::Full(rejected)) => {
                    value = rejected;
                    if let Ok(stale) = self.evict.try_recv() {
                        displaced = Some(stale);
                    }
                }
                Err(TrySendError::Disconnected(rejected)) => return Err(Closed(rejected)),
            }
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

pub(crate) struct LatestReceiver<T> {
    rx: Receiver<T>,
    closed: Arc<AtomicBool>,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Wait {
    Timeout,
    Disconnected,
}

impl<T> LatestReceiver<T> {
    pub(crate) fn recv_timeout(&self, timeout: Duration) -> Result<T, Wait> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => Wait::Timeout,
            RecvTimeoutError::Disconnected => Wait::Disconnected,
        })
    }

    pub(crate) fn try_recv(&self) -> Result<T, Wait> {
        self.rx.try_recv().map_err(|err| match err {
            TryRecvError::Empty => Wait::Timeout,
            TryRecvError::Disconnected => Wait::Disconnected,
        })
    }
}

impl<T> Drop for LatestReceiver<T> {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newer_value_replaces_undelivered_one() {
        let (tx, rx) = latest();
        assert!(matches!(tx.send(1), Ok(None)));
        assert!(matches!(tx.send(2), Ok(Some(1))));
        assert!(matches!(tx.send(3), Ok(Some(2))));
        assert_eq!(rx.try_recv(), Ok(3));
        assert_eq!(rx.try_recv(), Err(Wait::Timeout));
    }

    #[test]
    fn sender_sees_closed_receiver() {
        let (tx, rx) = latest::<u8>();
        drop(rx);
        assert!(tx.is_closed());
        assert!(matches!(tx.send(5), Err(Closed(5))));
    }

    #[test]
    fn receiver_sees_dropped_sender() {
        let (tx, rx) = latest::<u8>();
        drop(tx);
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(10)),
            Err(Wait::Disconnected)
        );
    }

    #[test]
    fn values_cross_threads() {
        let (tx, rx) = latest();
        let producer = std::thread::spawn(move || {
            for i in 0..100u32 {
                let _ = tx.send(i);
            }
        });
        producer.join().expect("producer thread");
        assert_eq!(rx.recv_timeout(Duration::from_millis(100)), Ok(99));
    }
}
