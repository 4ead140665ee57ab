use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use weir_types::{CheckpointId, ExecutionAttemptId};

use crate::completed::CompletedCheckpoint;
use crate::completion::CompletionFuture;
use crate::pending_checkpoint::{CheckpointStatus, PendingCheckpoint};
use crate::subtask_state::SubtaskState;
use crate::CheckpointError;

#[derive(Debug)]
pub enum AbortReason {
    Expired,
    Subsumed,
    Declined,
    Error(anyhow::Error),
}

enum CheckpointMessage {
    Acknowledge {
        attempt_id: ExecutionAttemptId,
        state: Option<SubtaskState>,
        reply: oneshot::Sender<bool>,
    },
    Finalize {
        reply: oneshot::Sender<Result<Arc<CompletedCheckpoint>, CheckpointError>>,
    },
    Abort {
        reason: AbortReason,
        reply: oneshot::Sender<bool>,
    },
    Status {
        reply: oneshot::Sender<CheckpointStatus>,
    },
}

/// Serializes access to a [PendingCheckpoint] from many tasks.
///
/// The checkpoint is owned by a single tokio task; handles send it messages and await the reply.
/// The task stops once every handle has been dropped. If the checkpoint hasn't terminated by then
/// its completion future resolves to [CheckpointError::Abandoned].
#[derive(Clone)]
pub struct CheckpointHandle {
    checkpoint_id: CheckpointId,
    tx: mpsc::Sender<CheckpointMessage>,
    completion: CompletionFuture,
}

impl CheckpointHandle {
    /// Moves the checkpoint onto its own task. With `expire_after` set, the checkpoint is aborted
    /// as expired if it hasn't terminated by then.
    pub fn spawn(
        pending: PendingCheckpoint,
        queue_size: usize,
        expire_after: Option<Duration>,
    ) -> (CheckpointHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        let handle = CheckpointHandle {
            checkpoint_id: pending.checkpoint_id(),
            tx,
            completion: pending.completion_future(),
        };

        let join = tokio::spawn(run(pending, rx, expire_after));
        (handle, join)
    }

    pub fn checkpoint_id(&self) -> CheckpointId {
        self.checkpoint_id
    }

    pub fn completion_future(&self) -> CompletionFuture {
        self.completion.clone()
    }

    async fn request<T>(
        &self,
        msg: impl FnOnce(oneshot::Sender<T>) -> CheckpointMessage,
    ) -> Result<T, CheckpointError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(msg(reply))
            .await
            .map_err(|_| CheckpointError::ActorStopped)?;
        rx.await.map_err(|_| CheckpointError::ActorStopped)
    }

    pub async fn acknowledge_task(
        &self,
        attempt_id: ExecutionAttemptId,
        state: Option<SubtaskState>,
    ) -> Result<bool, CheckpointError> {
        self.request(|reply| CheckpointMessage::Acknowledge {
            attempt_id,
            state,
            reply,
        })
        .await
    }

    pub async fn finalize_checkpoint(&self) -> Result<Arc<CompletedCheckpoint>, CheckpointError> {
        self.request(|reply| CheckpointMessage::Finalize { reply })
            .await?
    }

    pub async fn abort(&self, reason: AbortReason) -> Result<bool, CheckpointError> {
        self.request(|reply| CheckpointMessage::Abort { reason, reply })
            .await
    }

    pub async fn abort_expired(&self) -> Result<bool, CheckpointError> {
        self.abort(AbortReason::Expired).await
    }

    /// Panics the actor if the checkpoint is forced; the call then fails with
    /// [CheckpointError::ActorStopped].
    pub async fn abort_subsumed(&self) -> Result<bool, CheckpointError> {
        self.abort(AbortReason::Subsumed).await
    }

    pub async fn abort_declined(&self) -> Result<bool, CheckpointError> {
        self.abort(AbortReason::Declined).await
    }

    pub async fn abort_error(&self, cause: anyhow::Error) -> Result<bool, CheckpointError> {
        self.abort(AbortReason::Error(cause)).await
    }

    pub async fn status(&self) -> Result<CheckpointStatus, CheckpointError> {
        self.request(|reply| CheckpointMessage::Status { reply })
            .await
    }

    pub async fn is_fully_acknowledged(&self) -> Result<bool, CheckpointError> {
        Ok(self.status().await? == CheckpointStatus::FullyAcknowledged)
    }
}

async fn run(
    mut pending: PendingCheckpoint,
    mut rx: mpsc::Receiver<CheckpointMessage>,
    expire_after: Option<Duration>,
) {
    let expiry = async {
        match expire_after {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => futures::future::pending().await,
        }
    };
    tokio::pin!(expiry);
    let mut expiry_fired = false;

    loop {
        select! {
            msg = rx.recv() => {
                let Some(msg) = msg else {
                    break;
                };
                handle_message(&mut pending, msg).await;
            }
            _ = &mut expiry, if !expiry_fired => {
                expiry_fired = true;
                if pending.abort_expired() {
                    info!(
                        message = "checkpoint timed out",
                        job_id = %pending.job_id(),
                        checkpoint_id = pending.checkpoint_id(),
                        timeout_ms = expire_after.unwrap_or_default().as_millis() as u64,
                    );
                }
            }
        }
    }

    debug!(
        message = "checkpoint actor stopped",
        checkpoint_id = pending.checkpoint_id(),
        status = ?pending.status(),
    );
}

async fn handle_message(pending: &mut PendingCheckpoint, msg: CheckpointMessage) {
    // a caller that stopped waiting doesn't change the outcome, so send errors are ignored
    match msg {
        CheckpointMessage::Acknowledge {
            attempt_id,
            state,
            reply,
        } => {
            let _ = reply.send(pending.acknowledge_task(attempt_id, state));
        }
        CheckpointMessage::Finalize { reply } => {
            let _ = reply.send(pending.finalize_checkpoint().await);
        }
        CheckpointMessage::Abort { reason, reply } => {
            let aborted = match reason {
                AbortReason::Expired => pending.abort_expired(),
                AbortReason::Subsumed => pending.abort_subsumed(),
                AbortReason::Declined => pending.abort_declined(),
                AbortReason::Error(cause) => pending.abort_error(cause),
            };
            let _ = reply.send(aborted);
        }
        CheckpointMessage::Status { reply } => {
            let _ = reply.send(pending.status());
        }
    }
}
