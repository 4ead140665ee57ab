use std::sync::Arc;

use thiserror::Error;
use weir_types::{CheckpointId, JobVertexId};

/// Failures of a checkpoint attempt, and of calls made against one.
///
/// Cloneable so that every observer of a completion future receives the same cause.
#[derive(Error, Debug, Clone)]
pub enum CheckpointError {
    #[error("a checkpoint requires at least one task to acknowledge it")]
    EmptyTaskSet,

    #[error("an externalized checkpoint requires a target directory")]
    MissingTargetDirectory,

    #[error("subtask index {index} is out of bounds for {job_vertex_id} with parallelism {parallelism}")]
    SubtaskIndexOutOfBounds {
        job_vertex_id: JobVertexId,
        index: usize,
        parallelism: usize,
    },

    #[error("{job_vertex_id} has subtasks that disagree on parallelism")]
    InconsistentParallelism { job_vertex_id: JobVertexId },

    #[error("subtask {index} of {job_vertex_id} is assigned to more than one attempt")]
    DuplicateSubtask {
        job_vertex_id: JobVertexId,
        index: usize,
    },

    #[error("checkpoint {0} has already been discarded")]
    Discarded(CheckpointId),

    #[error("checkpoint {checkpoint_id} has not been fully acknowledged yet ({pending} tasks outstanding)")]
    NotFullyAcknowledged {
        checkpoint_id: CheckpointId,
        pending: usize,
    },

    #[error("checkpoint expired before completing")]
    Expired,

    #[error("checkpoint has been subsumed")]
    Subsumed,

    #[error("checkpoint was declined (tasks not ready)")]
    Declined,

    #[error("failure while running checkpoint: {0:#}")]
    Failed(Arc<anyhow::Error>),

    #[error("checkpoint was dropped before it completed")]
    Abandoned,

    #[error("checkpoint actor has stopped")]
    ActorStopped,
}

impl CheckpointError {
    pub fn failed(cause: anyhow::Error) -> Self {
        CheckpointError::Failed(Arc::new(cause))
    }

    /// Short label used when counting failed checkpoints.
    pub fn reason(&self) -> &'static str {
        match self {
            CheckpointError::Expired => "expired",
            CheckpointError::Subsumed => "subsumed",
            CheckpointError::Declined => "declined",
            CheckpointError::Failed(_) => "error",
            CheckpointError::Abandoned | CheckpointError::ActorStopped => "abandoned",
            CheckpointError::EmptyTaskSet
            | CheckpointError::MissingTargetDirectory
            | CheckpointError::SubtaskIndexOutOfBounds { .. }
            | CheckpointError::InconsistentParallelism { .. }
            | CheckpointError::DuplicateSubtask { .. }
            | CheckpointError::Discarded(_)
            | CheckpointError::NotFullyAcknowledged { .. } => "invalid",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_failed_wraps_cause() {
        let err = CheckpointError::failed(anyhow!("disk full").context("writing state"));
        assert_eq!(err.reason(), "error");
        assert_eq!(
            err.to_string(),
            "failure while running checkpoint: writing state: disk full"
        );
    }
}
