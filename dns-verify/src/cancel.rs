// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! External cancellation of long-running verifications
//!
//! A verification may span many attempts separated by backoff sleeps.  The
//! per-attempt timeout only bounds a single query; this module lets a caller
//! abort the whole run, either explicitly through a [`Canceller`] or when a
//! deadline passes.

use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Creates a connected [`Canceller`] and [`CancelSignal`].
pub fn cancel_pair() -> (Canceller, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (Canceller { tx }, CancelSignal { rx, deadline: None })
}

/// Requests cancellation of every [`CancelSignal`] cloned from its pair.
#[derive(Debug)]
pub struct Canceller {
    tx: watch::Sender<bool>,
}

impl Canceller {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Observes a cancellation request and/or a deadline.
///
/// Cloning is cheap; clones share the underlying request but each carries
/// its own deadline.
#[derive(Clone, Debug)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
    deadline: Option<Instant>,
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> CancelSignal {
        let (_, signal) = cancel_pair();
        signal
    }

    /// Fire at `deadline` if nothing fired sooner.  An earlier deadline
    /// already present on this signal wins.
    pub fn with_deadline(mut self, deadline: Instant) -> CancelSignal {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    /// Fire `timeout` from now if nothing fired sooner.  A timeout too far
    /// in the future to represent adds no deadline.
    pub fn with_timeout(self, timeout: Duration) -> CancelSignal {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.with_deadline(deadline),
            None => self,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns true if cancellation has been requested or the deadline has
    /// passed.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
            || self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Completes once cancellation is requested or the deadline passes.
    ///
    /// If the [`Canceller`] is dropped without cancelling, only the deadline
    /// (if any) can complete this future.
    pub async fn cancelled(&mut self) {
        let deadline = self.deadline;
        let rx = &mut self.rx;

        let requested = async move {
            loop {
                if *rx.borrow_and_update() {
                    return;
                }
                if rx.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        };
        let expired = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            () = requested => {},
            () = expired => {},
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn cancel_wakes_waiters() {
        let (canceller, signal) = cancel_pair();
        let mut waiter = signal.clone();
        let task = tokio::spawn(async move { waiter.cancelled().await });
        assert!(!signal.is_cancelled());
        canceller.cancel();
        task.await.unwrap();
        assert!(signal.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_fires_without_canceller() {
        let start = Instant::now();
        let mut signal =
            CancelSignal::never().with_timeout(Duration::from_secs(5));
        signal.cancelled().await;
        assert_eq!(start.elapsed(), Duration::from_secs(5));
        assert!(signal.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn earlier_deadline_wins() {
        let now = Instant::now();
        let signal = CancelSignal::never()
            .with_deadline(now + Duration::from_secs(3))
            .with_deadline(now + Duration::from_secs(10));
        assert_eq!(signal.deadline(), Some(now + Duration::from_secs(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn unrepresentable_timeout_adds_no_deadline() {
        let signal =
            CancelSignal::never().with_timeout(Duration::from_secs(u64::MAX));
        assert_eq!(signal.deadline(), None);
        assert!(!signal.is_cancelled());

        // An existing deadline survives.
        let signal = CancelSignal::never()
            .with_timeout(Duration::from_secs(5))
            .with_timeout(Duration::MAX);
        assert!(signal.deadline().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_canceller_is_not_cancellation() {
        let (canceller, mut signal) = cancel_pair();
        drop(canceller);
        let result = tokio::time::timeout(
            Duration::from_secs(60),
            signal.cancelled(),
        )
        .await;
        assert!(result.is_err());
        assert!(!signal.is_cancelled());
    }
}
