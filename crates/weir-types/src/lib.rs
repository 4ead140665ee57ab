use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub mod config;

pub const CONFIG_PATH_ENV: &str = "WEIR_CONFIG";

/// Identifier of a checkpoint attempt; attempts for a job are numbered in increasing order.
pub type CheckpointId = u64;

#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        JobId(id.into())
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A logical operator in the job graph, run as one or more parallel subtasks.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobVertexId(pub String);

impl JobVertexId {
    pub fn new(id: impl Into<String>) -> Self {
        JobVertexId(id.into())
    }
}

impl Display for JobVertexId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One execution attempt of a parallel subtask. A restarted subtask gets a fresh id.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionAttemptId(pub Uuid);

impl ExecutionAttemptId {
    pub fn new() -> Self {
        ExecutionAttemptId(Uuid::new_v4())
    }
}

impl Default for ExecutionAttemptId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ExecutionAttemptId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The execution vertex behind a task attempt: which job vertex it belongs to and where it
/// sits in that vertex's parallelism.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskVertex {
    pub job_vertex_id: JobVertexId,
    pub subtask_index: usize,
    pub parallelism: usize,
    pub max_parallelism: usize,
}

impl TaskVertex {
    pub fn new(
        job_vertex_id: JobVertexId,
        subtask_index: usize,
        parallelism: usize,
        max_parallelism: usize,
    ) -> Self {
        Self {
            job_vertex_id,
            subtask_index,
            parallelism,
            max_parallelism,
        }
    }

    pub fn for_test(job_vertex_id: &str, subtask_index: usize, parallelism: usize) -> Self {
        Self::new(
            JobVertexId::new(job_vertex_id),
            subtask_index,
            parallelism,
            128,
        )
    }
}

pub fn to_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn to_micros(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

pub fn from_millis(ts: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ts)
}

pub fn from_micros(ts: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_micros(ts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_conversions() {
        let now = SystemTime::now();
        let millis = to_millis(now);
        assert_eq!(to_millis(from_millis(millis)), millis);

        let micros = to_micros(now);
        assert_eq!(from_micros(micros), UNIX_EPOCH + Duration::from_micros(micros));
        assert_eq!(to_millis(from_micros(micros)), millis);
    }

    #[test]
    fn test_attempt_ids_are_unique() {
        assert_ne!(ExecutionAttemptId::new(), ExecutionAttemptId::new());
    }
}
