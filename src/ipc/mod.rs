//! Mach-style inter-process communication
//!
//! All communication happens through ports guarded by capabilities.
//!
//! ## Architecture
//!
//! - **port**: bounded FIFO mailbox with a blocked-receiver marker
//! - **rights**: `(task, port)` capability table (SEND / RECEIVE / SERVER)
//! - **message**: the `(remote, reply, payload)` triple in flight
//! - **mach_msg**: the send/receive engine owning every port and every
//!   native handler

use core::fmt;

pub mod mach_msg;
pub mod message;
pub mod port;
pub mod rights;

/// IPC error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcError {
    /// Name does not refer to a live port or native handler.
    InvalidName,
    /// Caller lacks the required capability bits.
    NoRight,
    /// Name refers to a destroyed port.
    DiedName,
    /// Receive found the mailbox empty; the caller should block.
    WouldBlock,
}

impl fmt::Display for IpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpcError::InvalidName => write!(f, "invalid name"),
            IpcError::NoRight => write!(f, "no right"),
            IpcError::DiedName => write!(f, "dead name"),
            IpcError::WouldBlock => write!(f, "would block"),
        }
    }
}

/// Result type for IPC operations
pub type IpcResult<T> = Result<T, IpcError>;

pub use mach_msg::{Delivery, Ipc, NativeHandler, HANDLER_ERROR};
pub use message::Message;
pub use port::{Port, MAX_MESSAGES};
pub use rights::{Rights, RightsTable};
