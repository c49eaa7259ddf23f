//! Parallel Monte Carlo collection of decoder error statistics.
//!
//! [`collect`] fans sub-batches of each [`shotlab_core::Task`] out to a pool
//! of worker threads and folds the returned increments into a single
//! [`shotlab_core::ExistingData`] store owned by the scheduling thread. The
//! store is checkpointed to the save-resume table so an interrupted run can
//! be resumed without re-counting shots.

pub mod config;
pub mod scheduler;
pub mod worker;

pub use config::{
    build_tasks, comma_separated_key_values, load_plan, specs_from_circuits, BatchPolicy,
    CheckpointPolicy, CollectOptions, MetadataMode, Plan, TaskSpec,
};
pub use scheduler::{collect, CollectReport, HaltReason, TaskPhase, TaskReport};
pub use worker::{PreparedTask, Worker, WorkerError};
