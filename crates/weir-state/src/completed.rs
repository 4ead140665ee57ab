use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use tracing::{info, warn};
use weir_types::{to_millis, CheckpointId, JobId, JobVertexId};

use crate::handles::StateObject;
use crate::metrics::STATE_DISCARD_FAILURES;
use crate::properties::CheckpointProperties;
use crate::task_state::TaskState;

/// A checkpoint that every task acknowledged. Owns the state handles it was built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedCheckpoint {
    job_id: JobId,
    checkpoint_id: CheckpointId,
    timestamp: SystemTime,
    completion_timestamp: SystemTime,
    task_states: HashMap<JobVertexId, TaskState>,
    props: CheckpointProperties,
    external_path: Option<String>,
}

impl CompletedCheckpoint {
    pub fn new(
        job_id: JobId,
        checkpoint_id: CheckpointId,
        timestamp: SystemTime,
        completion_timestamp: SystemTime,
        task_states: HashMap<JobVertexId, TaskState>,
        props: CheckpointProperties,
        external_path: Option<String>,
    ) -> Self {
        Self {
            job_id,
            checkpoint_id,
            timestamp,
            completion_timestamp,
            task_states,
            props,
            external_path,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn checkpoint_id(&self) -> CheckpointId {
        self.checkpoint_id
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    pub fn completion_timestamp(&self) -> SystemTime {
        self.completion_timestamp
    }

    pub fn duration(&self) -> Duration {
        self.completion_timestamp
            .duration_since(self.timestamp)
            .unwrap_or_default()
    }

    pub fn task_states(&self) -> &HashMap<JobVertexId, TaskState> {
        &self.task_states
    }

    pub fn task_state(&self, job_vertex_id: &JobVertexId) -> Option<&TaskState> {
        self.task_states.get(job_vertex_id)
    }

    pub fn props(&self) -> &CheckpointProperties {
        &self.props
    }

    pub fn external_path(&self) -> Option<&str> {
        self.external_path.as_deref()
    }

    pub fn is_externalized(&self) -> bool {
        self.external_path.is_some()
    }

    pub fn state_size(&self) -> u64 {
        self.task_states.values().map(|t| t.state_size()).sum()
    }

    /// Releases the state of a checkpoint that is no longer retained. Best effort: failures are
    /// logged and counted, and the remaining task states are still released.
    pub fn discard_state(&self) {
        info!(
            message = "discarding completed checkpoint",
            job_id = %self.job_id,
            checkpoint_id = self.checkpoint_id,
            started = to_millis(self.timestamp),
        );

        for (job_vertex_id, task_state) in &self.task_states {
            if let Err(e) = task_state.discard_state() {
                STATE_DISCARD_FAILURES.inc();
                warn!(
                    message = "failed to discard task state",
                    job_id = %self.job_id,
                    checkpoint_id = self.checkpoint_id,
                    job_vertex_id = %job_vertex_id,
                    error = format!("{:#}", e),
                );
            }
        }
    }
}
