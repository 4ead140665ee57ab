use std::collections::{HashMap, HashSet};
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, error, info, warn};
use weir_types::{to_millis, CheckpointId, ExecutionAttemptId, JobId, JobVertexId, TaskVertex};

use crate::completed::CompletedCheckpoint;
use crate::completion::{CompletionFuture, CompletionPromise};
use crate::handles::StateObject;
use crate::metrics::{
    CHECKPOINTS_COMPLETED, CHECKPOINTS_FAILED, CHECKPOINT_ACKNOWLEDGEMENTS,
    SAVEPOINT_PERSIST_FAILURES, STATE_DISCARD_FAILURES,
};
use crate::properties::CheckpointProperties;
use crate::savepoint::{Savepoint, SavepointStore, StorageSavepointStore};
use crate::subtask_state::SubtaskState;
use crate::task_state::TaskState;
use crate::CheckpointError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointStatus {
    /// Waiting for at least one task to acknowledge.
    Pending,
    /// Every task acknowledged; ready to be finalized.
    FullyAcknowledged,
    /// Turned into a completed checkpoint.
    Finalized,
    /// Aborted, or finalized from an invalid state.
    Discarded,
}

impl CheckpointStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CheckpointStatus::Finalized | CheckpointStatus::Discarded)
    }
}

/// A checkpoint that has been started but not yet acknowledged by every participating task.
///
/// It terminates exactly once: either by [PendingCheckpoint::finalize_checkpoint], which hands
/// the collected state to a [CompletedCheckpoint], or by one of the abort methods, which release
/// it. Either way the completion future is resolved and the object becomes inert.
pub struct PendingCheckpoint {
    job_id: JobId,
    checkpoint_id: CheckpointId,
    checkpoint_timestamp: SystemTime,
    not_yet_acknowledged_tasks: HashMap<ExecutionAttemptId, TaskVertex>,
    task_states: HashMap<JobVertexId, TaskState>,
    num_acknowledged_tasks: usize,
    status: CheckpointStatus,
    props: CheckpointProperties,
    target_directory: Option<String>,
    savepoint_store: Arc<dyn SavepointStore>,
    completion: CompletionPromise,
}

impl PendingCheckpoint {
    pub fn new(
        job_id: JobId,
        checkpoint_id: CheckpointId,
        checkpoint_timestamp: SystemTime,
        tasks_to_acknowledge: HashMap<ExecutionAttemptId, TaskVertex>,
        props: CheckpointProperties,
        target_directory: Option<String>,
    ) -> Result<Self, CheckpointError> {
        if tasks_to_acknowledge.is_empty() {
            return Err(CheckpointError::EmptyTaskSet);
        }

        if props.externalize_checkpoint() && target_directory.is_none() {
            return Err(CheckpointError::MissingTargetDirectory);
        }

        validate_tasks(&tasks_to_acknowledge)?;

        info!(
            message = "starting checkpoint",
            job_id = %job_id,
            checkpoint_id,
            tasks = tasks_to_acknowledge.len(),
            forced = props.force_checkpoint(),
            externalized = props.externalize_checkpoint(),
        );

        Ok(Self {
            job_id,
            checkpoint_id,
            checkpoint_timestamp,
            not_yet_acknowledged_tasks: tasks_to_acknowledge,
            task_states: HashMap::new(),
            num_acknowledged_tasks: 0,
            status: CheckpointStatus::Pending,
            props,
            target_directory,
            savepoint_store: Arc::new(StorageSavepointStore::new()),
            completion: CompletionPromise::new(),
        })
    }

    /// Replaces the store externalized checkpoints are written to.
    pub fn with_savepoint_store(mut self, store: Arc<dyn SavepointStore>) -> Self {
        self.savepoint_store = store;
        self
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn checkpoint_id(&self) -> CheckpointId {
        self.checkpoint_id
    }

    pub fn checkpoint_timestamp(&self) -> SystemTime {
        self.checkpoint_timestamp
    }

    pub fn number_of_acknowledged_tasks(&self) -> usize {
        self.num_acknowledged_tasks
    }

    pub fn number_of_non_acknowledged_tasks(&self) -> usize {
        self.not_yet_acknowledged_tasks.len()
    }

    pub fn not_yet_acknowledged_tasks(&self) -> &HashMap<ExecutionAttemptId, TaskVertex> {
        &self.not_yet_acknowledged_tasks
    }

    pub fn task_states(&self) -> &HashMap<JobVertexId, TaskState> {
        &self.task_states
    }

    pub fn props(&self) -> &CheckpointProperties {
        &self.props
    }

    pub fn target_directory(&self) -> Option<&str> {
        self.target_directory.as_deref()
    }

    pub fn status(&self) -> CheckpointStatus {
        self.status
    }

    pub fn is_discarded(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_fully_acknowledged(&self) -> bool {
        self.status == CheckpointStatus::FullyAcknowledged
    }

    pub fn can_be_subsumed(&self) -> bool {
        !self.props.force_checkpoint()
    }

    pub fn completion_future(&self) -> CompletionFuture {
        self.completion.future()
    }

    /// Records the acknowledgment of one task attempt along with the state it reported.
    ///
    /// Returns false if the checkpoint has already been discarded, or if the attempt is unknown
    /// or has already acknowledged; in those cases nothing changes.
    pub fn acknowledge_task(
        &mut self,
        attempt_id: ExecutionAttemptId,
        state: Option<SubtaskState>,
    ) -> bool {
        if self.is_discarded() {
            debug!(
                message = "ignoring acknowledgment for discarded checkpoint",
                job_id = %self.job_id,
                checkpoint_id = self.checkpoint_id,
                attempt_id = %attempt_id,
            );
            return false;
        }

        let Some(vertex) = self.not_yet_acknowledged_tasks.get(&attempt_id) else {
            warn!(
                message = "received acknowledgment for unknown or already acknowledged task",
                job_id = %self.job_id,
                checkpoint_id = self.checkpoint_id,
                attempt_id = %attempt_id,
            );
            return false;
        };

        if let Some(mut state) = state.filter(SubtaskState::has_state) {
            let task_state = self
                .task_states
                .entry(vertex.job_vertex_id.clone())
                .or_insert_with(|| {
                    TaskState::new(
                        vertex.job_vertex_id.clone(),
                        vertex.parallelism,
                        vertex.max_parallelism,
                        state.chain_length(),
                    )
                });

            let elapsed = SystemTime::now()
                .duration_since(self.checkpoint_timestamp)
                .unwrap_or_default();
            state.set_duration(elapsed.as_millis() as u64);

            if let Err(e) = task_state.put_state(vertex.subtask_index, state) {
                error!(
                    message = "rejecting acknowledgment",
                    job_id = %self.job_id,
                    checkpoint_id = self.checkpoint_id,
                    attempt_id = %attempt_id,
                    error = %e,
                );
                return false;
            }
        }

        let vertex = self.not_yet_acknowledged_tasks.remove(&attempt_id);
        self.num_acknowledged_tasks += 1;
        CHECKPOINT_ACKNOWLEDGEMENTS.inc();

        debug!(
            message = "task acknowledged checkpoint",
            job_id = %self.job_id,
            checkpoint_id = self.checkpoint_id,
            attempt_id = %attempt_id,
            job_vertex_id = ?vertex.map(|v| v.job_vertex_id),
            acknowledged = self.num_acknowledged_tasks,
            pending = self.not_yet_acknowledged_tasks.len(),
        );

        if self.not_yet_acknowledged_tasks.is_empty() {
            self.status = CheckpointStatus::FullyAcknowledged;
        }

        true
    }

    /// Turns a fully acknowledged checkpoint into a [CompletedCheckpoint], writing it to the
    /// target directory first if it is externalized.
    ///
    /// Finalizing a checkpoint that is still waiting for acknowledgments fails; the failure is
    /// also delivered through the completion future and the checkpoint is discarded. Finalizing
    /// one that has already terminated fails without further effect.
    pub async fn finalize_checkpoint(
        &mut self,
    ) -> Result<Arc<CompletedCheckpoint>, CheckpointError> {
        match self.status {
            CheckpointStatus::FullyAcknowledged => {}
            CheckpointStatus::Pending => {
                let e = CheckpointError::NotFullyAcknowledged {
                    checkpoint_id: self.checkpoint_id,
                    pending: self.not_yet_acknowledged_tasks.len(),
                };
                self.fail(e.clone());
                return Err(e);
            }
            CheckpointStatus::Finalized | CheckpointStatus::Discarded => {
                // already resolved and disposed; nothing left to fail
                return Err(CheckpointError::Discarded(self.checkpoint_id));
            }
        }

        let external_path = match (&self.target_directory, self.props.externalize_checkpoint()) {
            (Some(directory), true) => self.externalize(directory).await,
            _ => None,
        };

        let completed = Arc::new(CompletedCheckpoint::new(
            self.job_id.clone(),
            self.checkpoint_id,
            self.checkpoint_timestamp,
            SystemTime::now(),
            std::mem::take(&mut self.task_states),
            self.props,
            external_path,
        ));

        self.completion.complete(Ok(completed.clone()));
        CHECKPOINTS_COMPLETED.inc();

        info!(
            message = "completed checkpoint",
            job_id = %self.job_id,
            checkpoint_id = self.checkpoint_id,
            duration_ms = completed.duration().as_millis() as u64,
            state_size = completed.state_size(),
            external_path = completed.external_path(),
        );

        // the handles now belong to the completed checkpoint
        self.dispose(false, CheckpointStatus::Finalized);

        Ok(completed)
    }

    async fn externalize(&self, directory: &str) -> Option<String> {
        let savepoint = Savepoint::new(
            self.job_id.clone(),
            self.checkpoint_id,
            self.task_states.values().cloned().collect(),
        );

        match self.savepoint_store.store(directory, &savepoint).await {
            Ok(path) => Some(path),
            Err(e) => {
                SAVEPOINT_PERSIST_FAILURES.inc();
                error!(
                    message = "failed to persist externalized checkpoint",
                    job_id = %self.job_id,
                    checkpoint_id = self.checkpoint_id,
                    directory,
                    error = format!("{:#}", e),
                );
                None
            }
        }
    }

    /// Aborts a checkpoint that ran out of time before every task acknowledged it.
    pub fn abort_expired(&mut self) -> bool {
        self.abort(CheckpointError::Expired)
    }

    /// Aborts a checkpoint because a newer one completed.
    ///
    /// # Panics
    ///
    /// If the checkpoint is forced; forced checkpoints must never be subsumed.
    pub fn abort_subsumed(&mut self) -> bool {
        assert!(
            self.can_be_subsumed(),
            "forced checkpoint {} of job {} must never be subsumed",
            self.checkpoint_id,
            self.job_id
        );
        self.abort(CheckpointError::Subsumed)
    }

    /// Aborts a checkpoint that one or more tasks were not ready to take.
    pub fn abort_declined(&mut self) -> bool {
        self.abort(CheckpointError::Declined)
    }

    pub fn abort_error(&mut self, cause: anyhow::Error) -> bool {
        self.abort(CheckpointError::failed(cause))
    }

    /// Returns true if this call terminated the checkpoint.
    fn abort(&mut self, reason: CheckpointError) -> bool {
        if self.is_discarded() {
            debug!(
                message = "checkpoint already terminated; ignoring abort",
                job_id = %self.job_id,
                checkpoint_id = self.checkpoint_id,
                reason = %reason,
            );
            return false;
        }

        warn!(
            message = "aborting checkpoint",
            job_id = %self.job_id,
            checkpoint_id = self.checkpoint_id,
            acknowledged = self.num_acknowledged_tasks,
            pending = self.not_yet_acknowledged_tasks.len(),
            reason = %reason,
        );

        self.fail(reason);
        true
    }

    fn fail(&mut self, reason: CheckpointError) {
        CHECKPOINTS_FAILED.with_label_values(&[reason.reason()]).inc();
        self.completion.complete(Err(reason));
        self.dispose(true, CheckpointStatus::Discarded);
    }

    fn dispose(&mut self, release_state: bool, status: CheckpointStatus) {
        if release_state {
            for (job_vertex_id, task_state) in self.task_states.drain() {
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

        self.task_states.clear();
        self.not_yet_acknowledged_tasks.clear();
        if !self.status.is_terminal() {
            self.status = status;
        }
    }
}

/// Every subtask of a job vertex must agree on the vertex's shape and occupy its own slot.
fn validate_tasks(tasks: &HashMap<ExecutionAttemptId, TaskVertex>) -> Result<(), CheckpointError> {
    let mut shapes: HashMap<&JobVertexId, (usize, usize)> = HashMap::new();
    let mut slots: HashSet<(&JobVertexId, usize)> = HashSet::new();

    for vertex in tasks.values() {
        if vertex.subtask_index >= vertex.parallelism {
            return Err(CheckpointError::SubtaskIndexOutOfBounds {
                job_vertex_id: vertex.job_vertex_id.clone(),
                index: vertex.subtask_index,
                parallelism: vertex.parallelism,
            });
        }

        let shape = (vertex.parallelism, vertex.max_parallelism);
        if *shapes.entry(&vertex.job_vertex_id).or_insert(shape) != shape {
            return Err(CheckpointError::InconsistentParallelism {
                job_vertex_id: vertex.job_vertex_id.clone(),
            });
        }

        if !slots.insert((&vertex.job_vertex_id, vertex.subtask_index)) {
            return Err(CheckpointError::DuplicateSubtask {
                job_vertex_id: vertex.job_vertex_id.clone(),
                index: vertex.subtask_index,
            });
        }
    }

    Ok(())
}

impl Display for PendingCheckpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pending Checkpoint {} @ {} - confirmed={}, pending={}",
            self.checkpoint_id,
            to_millis(self.checkpoint_timestamp),
            self.num_acknowledged_tasks,
            self.not_yet_acknowledged_tasks.len()
        )
    }
}
