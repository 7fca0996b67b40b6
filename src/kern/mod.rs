//! Kernel layer: scheduling and task lifecycle
//!
//! - **runq**: multi-level priority run queues with active/expired
//!   rotation and slice accounting
//! - **task**: per-task control blocks and their state machine
//! - **kernel**: the dispatch loop tying VMs, IPC, and the scheduler
//!   together

pub mod kernel;
pub mod runq;
pub mod task;

pub use kernel::Kernel;
pub use runq::PrioSched;
pub use task::{TaskControl, TaskEvent, TaskState};
