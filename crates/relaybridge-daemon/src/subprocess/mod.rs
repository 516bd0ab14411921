//! Worker subprocess supervision.

mod supervisor;

pub use supervisor::{SupervisorError, WorkerEvent, WorkerState, WorkerSupervisor};
