use serde::{Deserialize, Serialize};

use crate::handles::{
    ChainedStateHandle, KeyGroupsStateHandle, OperatorStateHandle, StateObject, StreamStateHandle,
};

/// The state one subtask reported when acknowledging a checkpoint.
///
/// Keyed state is limited to a single handle, which belongs to the head operator of the chain.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SubtaskState {
    non_partitioned: Option<ChainedStateHandle<StreamStateHandle>>,
    partitionable: Option<ChainedStateHandle<OperatorStateHandle>>,
    keyed: Option<KeyGroupsStateHandle>,
    state_size: u64,
    // millis between checkpoint start and acknowledgment
    duration: u64,
}

impl SubtaskState {
    pub fn new(
        non_partitioned: Option<ChainedStateHandle<StreamStateHandle>>,
        partitionable: Option<ChainedStateHandle<OperatorStateHandle>>,
        keyed: Option<KeyGroupsStateHandle>,
    ) -> Self {
        let state_size = non_partitioned.as_ref().map_or(0, |s| s.state_size())
            + partitionable.as_ref().map_or(0, |s| s.state_size())
            + keyed.as_ref().map_or(0, |s| s.state_size());

        Self {
            non_partitioned,
            partitionable,
            keyed,
            state_size,
            duration: 0,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_keyed_state(keyed: KeyGroupsStateHandle) -> Self {
        Self::new(None, None, Some(keyed))
    }

    pub fn non_partitioned_state(&self) -> Option<&ChainedStateHandle<StreamStateHandle>> {
        self.non_partitioned.as_ref()
    }

    pub fn partitionable_state(&self) -> Option<&ChainedStateHandle<OperatorStateHandle>> {
        self.partitionable.as_ref()
    }

    pub fn keyed_state(&self) -> Option<&KeyGroupsStateHandle> {
        self.keyed.as_ref()
    }

    pub fn has_state(&self) -> bool {
        self.non_partitioned.as_ref().is_some_and(|s| !s.is_empty())
            || self.partitionable.as_ref().is_some_and(|s| !s.is_empty())
            || self.keyed.is_some()
    }

    /// Length of the operator chain the handles were reported for; a subtask with only keyed
    /// state counts as a chain of one.
    pub fn chain_length(&self) -> usize {
        let non_partitioned = self.non_partitioned.as_ref().map_or(0, |s| s.len());
        let partitionable = self.partitionable.as_ref().map_or(0, |s| s.len());
        non_partitioned.max(partitionable).max(1)
    }

    pub fn state_size(&self) -> u64 {
        self.state_size
    }

    pub fn duration(&self) -> u64 {
        self.duration
    }

    pub fn set_duration(&mut self, duration: u64) {
        self.duration = duration;
    }
}

impl StateObject for SubtaskState {
    fn discard_state(&self) -> anyhow::Result<()> {
        let results = [
            self.non_partitioned
                .as_ref()
                .map_or(Ok(()), |s| s.discard_state()),
            self.partitionable
                .as_ref()
                .map_or(Ok(()), |s| s.discard_state()),
            self.keyed.as_ref().map_or(Ok(()), |s| s.discard_state()),
        ];

        results.into_iter().collect()
    }

    fn state_size(&self) -> u64 {
        self.state_size
    }
}
