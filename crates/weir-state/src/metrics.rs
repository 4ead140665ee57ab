use lazy_static::lazy_static;
use prometheus::{register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec};

lazy_static! {
    pub static ref CHECKPOINTS_COMPLETED: IntCounter = register_int_counter!(
        "weir_checkpoints_completed",
        "Number of checkpoints that were finalized"
    )
    .unwrap();
    pub static ref CHECKPOINTS_FAILED: IntCounterVec = register_int_counter_vec!(
        "weir_checkpoints_failed",
        "Number of checkpoints that were aborted or failed to finalize",
        &["reason"]
    )
    .unwrap();
    pub static ref CHECKPOINT_ACKNOWLEDGEMENTS: IntCounter = register_int_counter!(
        "weir_checkpoint_acknowledgements",
        "Number of task acknowledgments applied to pending checkpoints"
    )
    .unwrap();
    pub static ref SAVEPOINT_PERSIST_FAILURES: IntCounter = register_int_counter!(
        "weir_savepoint_persist_failures",
        "Number of externalized checkpoints that could not be written"
    )
    .unwrap();
    pub static ref STATE_DISCARD_FAILURES: IntCounter = register_int_counter!(
        "weir_state_discard_failures",
        "Number of state handles that could not be released"
    )
    .unwrap();
}
