//! Coordination of a single in-flight checkpoint: collecting task acknowledgments and their
//! state, and turning them into a completed checkpoint or discarding them.

pub mod actor;
pub mod completed;
pub mod completion;
mod error;
pub mod handles;
pub mod metrics;
pub mod pending_checkpoint;
pub mod properties;
pub mod savepoint;
pub mod subtask_state;
pub mod task_state;

pub use actor::{AbortReason, CheckpointHandle};
pub use completed::CompletedCheckpoint;
pub use completion::{CheckpointOutcome, CompletionFuture, CompletionPromise};
pub use error::CheckpointError;
pub use handles::StateObject;
pub use pending_checkpoint::{CheckpointStatus, PendingCheckpoint};
pub use properties::CheckpointProperties;
pub use savepoint::{Savepoint, SavepointStore, StorageSavepointStore};
pub use subtask_state::SubtaskState;
pub use task_state::TaskState;
