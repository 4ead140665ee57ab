use serde::{Deserialize, Serialize};

/// How a checkpoint is treated once it exists: whether it is written to a durable, user-visible
/// location, and whether a newer checkpoint may subsume it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointProperties {
    force_checkpoint: bool,
    externalize_checkpoint: bool,
}

impl CheckpointProperties {
    pub fn new(force_checkpoint: bool, externalize_checkpoint: bool) -> Self {
        Self {
            force_checkpoint,
            externalize_checkpoint,
        }
    }

    /// Periodic checkpoints: internal only, subsumable.
    pub fn for_standard_checkpoint() -> Self {
        Self::new(false, false)
    }

    /// User-triggered savepoints: always persisted and never subsumed.
    pub fn for_standard_savepoint() -> Self {
        Self::new(true, true)
    }

    pub fn for_externalized_checkpoint() -> Self {
        Self::new(false, true)
    }

    /// Forced checkpoints are exempt from subsumption.
    pub fn force_checkpoint(&self) -> bool {
        self.force_checkpoint
    }

    pub fn externalize_checkpoint(&self) -> bool {
        self.externalize_checkpoint
    }
}
