use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use weir_types::JobVertexId;

use crate::handles::{discard_all, StateObject};
use crate::subtask_state::SubtaskState;
use crate::CheckpointError;

/// Everything collected for one job vertex during a checkpoint, by subtask index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskState {
    job_vertex_id: JobVertexId,
    parallelism: usize,
    max_parallelism: usize,
    chain_length: usize,
    subtask_states: BTreeMap<usize, SubtaskState>,
}

impl TaskState {
    pub fn new(
        job_vertex_id: JobVertexId,
        parallelism: usize,
        max_parallelism: usize,
        chain_length: usize,
    ) -> Self {
        Self {
            job_vertex_id,
            parallelism,
            max_parallelism,
            chain_length,
            subtask_states: BTreeMap::new(),
        }
    }

    pub fn put_state(
        &mut self,
        subtask_index: usize,
        state: SubtaskState,
    ) -> Result<(), CheckpointError> {
        if subtask_index >= self.parallelism {
            return Err(CheckpointError::SubtaskIndexOutOfBounds {
                job_vertex_id: self.job_vertex_id.clone(),
                index: subtask_index,
                parallelism: self.parallelism,
            });
        }

        match self.subtask_states.entry(subtask_index) {
            Entry::Occupied(_) => Err(CheckpointError::DuplicateSubtask {
                job_vertex_id: self.job_vertex_id.clone(),
                index: subtask_index,
            }),
            Entry::Vacant(slot) => {
                slot.insert(state);
                Ok(())
            }
        }
    }

    pub fn state(&self, subtask_index: usize) -> Option<&SubtaskState> {
        self.subtask_states.get(&subtask_index)
    }

    pub fn states(&self) -> impl Iterator<Item = (usize, &SubtaskState)> {
        self.subtask_states.iter().map(|(idx, s)| (*idx, s))
    }

    pub fn job_vertex_id(&self) -> &JobVertexId {
        &self.job_vertex_id
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    pub fn max_parallelism(&self) -> usize {
        self.max_parallelism
    }

    pub fn chain_length(&self) -> usize {
        self.chain_length
    }

    pub fn number_collected_states(&self) -> usize {
        self.subtask_states.len()
    }

    pub fn has_non_partitioned_state(&self) -> bool {
        self.subtask_states
            .values()
            .any(|s| s.non_partitioned_state().is_some_and(|c| !c.is_empty()))
    }
}

impl StateObject for TaskState {
    fn discard_state(&self) -> anyhow::Result<()> {
        discard_all(self.subtask_states.values())
    }

    fn state_size(&self) -> u64 {
        self.subtask_states.values().map(|s| s.state_size()).sum()
    }
}
