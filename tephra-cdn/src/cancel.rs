//! Cancellation signals for network operations.
//!
//! Every fetch path accepts a [`CancelSignal`]: a deadline, a
//! caller-held trigger, or both. A fired signal surfaces as
//! [`Error::Cancelled`](crate::Error::Cancelled), and any in-flight
//! download is dropped with its temporary file, so no partial write
//! survives at a cache path.

use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// A cancellation signal observed by the fetch path.
///
/// The default signal never fires. Clones observe the same trigger.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    deadline: Option<Instant>,
    trigger: Option<watch::Receiver<bool>>,
}

/// Caller-held handle that fires the paired [`CancelSignal`].
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Fire the signal. Idempotent.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn none() -> Self {
        Self::default()
    }

    /// A signal that fires `after` the current instant.
    pub fn with_deadline(after: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + after),
            trigger: None,
        }
    }

    /// A manually triggered signal and the handle that fires it.
    pub fn manual() -> (CancelHandle, Self) {
        let (tx, rx) = watch::channel(false);
        (
            CancelHandle { tx },
            Self {
                deadline: None,
                trigger: Some(rx),
            },
        )
    }

    /// Add a deadline to this signal, keeping any manual trigger.
    pub fn deadline(mut self, after: Duration) -> Self {
        self.deadline = Some(Instant::now() + after);
        self
    }

    /// `true` once the deadline has passed or the trigger has fired.
    pub fn is_cancelled(&self) -> bool {
        if self.deadline.is_some_and(|at| Instant::now() >= at) {
            return true;
        }
        self.trigger.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolves when the signal fires. A signal that can never fire
    /// pends forever, which makes this safe to race with real work in
    /// a `select!`.
    pub async fn cancelled(&self) {
        let deadline = async {
            match self.deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        let trigger = async {
            match self.trigger.clone() {
                Some(mut rx) => loop {
                    if *rx.borrow() {
                        return;
                    }
                    if rx.changed().await.is_err() {
                        // The handle is gone; the trigger can never fire.
                        std::future::pending::<()>().await;
                    }
                },
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            () = deadline => {}
            () = trigger => {}
        }
    }
}
