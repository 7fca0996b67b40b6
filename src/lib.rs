//! rMach - a miniature Mach-style microkernel simulator
//!
//! Multiplexes cooperative bytecode tasks over a single thread. Tasks
//! talk to each other — and to native service handlers — exclusively
//! through ports guarded by capabilities. An empty receive suspends the
//! running task; a send that lands on a port hands the CPU straight to
//! the recipient.
//!
//! The interesting parts:
//! - [`ipc`]: ports, rights, message queues, native handlers
//! - [`kern`]: the priority scheduler and the dispatch loop
//! - [`vm`]: the stack bytecode machine whose opcodes drive both

pub mod asm;
pub mod console;
pub mod ipc;
pub mod kern;
pub mod types;
pub mod vm;

/// Simulator name
pub const NAME: &str = "rMach";
/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
