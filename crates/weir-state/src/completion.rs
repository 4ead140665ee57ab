use std::future::IntoFuture;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::watch;

use crate::completed::CompletedCheckpoint;
use crate::CheckpointError;

pub type CheckpointOutcome = Result<Arc<CompletedCheckpoint>, CheckpointError>;

/// The write side of a checkpoint's completion. Resolves at most once; later attempts are
/// ignored.
pub struct CompletionPromise {
    tx: watch::Sender<Option<CheckpointOutcome>>,
}

impl CompletionPromise {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Returns true if this call resolved the promise.
    pub fn complete(&self, outcome: CheckpointOutcome) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            true
        })
    }

    pub fn is_done(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn future(&self) -> CompletionFuture {
        CompletionFuture {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for CompletionPromise {
    fn default() -> Self {
        Self::new()
    }
}

/// The read side of a checkpoint's completion. Any number of clones may wait on it; all of them
/// observe the same outcome. If the checkpoint is dropped without resolving, waiters receive
/// [CheckpointError::Abandoned].
#[derive(Clone)]
pub struct CompletionFuture {
    rx: watch::Receiver<Option<CheckpointOutcome>>,
}

impl CompletionFuture {
    /// The outcome, if the checkpoint has already been resolved.
    pub fn peek(&self) -> Option<CheckpointOutcome> {
        self.rx.borrow().clone()
    }

    pub fn is_done(&self) -> bool {
        self.rx.borrow().is_some()
    }

    pub async fn wait(mut self) -> CheckpointOutcome {
        match self.rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone().unwrap_or(Err(CheckpointError::Abandoned)),
            Err(_) => Err(CheckpointError::Abandoned),
        }
    }
}

impl IntoFuture for CompletionFuture {
    type Output = CheckpointOutcome;
    type IntoFuture = BoxFuture<'static, CheckpointOutcome>;

    fn into_future(self) -> Self::IntoFuture {
        self.wait().boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolves_once() {
        let promise = CompletionPromise::new();
        let early = promise.future();
        assert!(early.peek().is_none());

        assert!(promise.complete(Err(CheckpointError::Expired)));
        assert!(!promise.complete(Err(CheckpointError::Declined)));
        assert!(promise.is_done());

        let late = promise.future();
        for future in [early, late] {
            assert!(matches!(future.await, Err(CheckpointError::Expired)));
        }
    }

    #[tokio::test]
    async fn test_waiters_are_woken() {
        let promise = CompletionPromise::new();
        let waiters: Vec<_> = (0..3)
            .map(|_| tokio::spawn(promise.future().wait()))
            .collect();

        promise.complete(Err(CheckpointError::Subsumed));

        for waiter in waiters {
            assert!(matches!(
                waiter.await.unwrap(),
                Err(CheckpointError::Subsumed)
            ));
        }
    }

    #[tokio::test]
    async fn test_dropped_promise_is_abandoned() {
        let promise = CompletionPromise::new();
        let future = promise.future();
        drop(promise);

        assert!(matches!(future.await, Err(CheckpointError::Abandoned)));
    }
}
