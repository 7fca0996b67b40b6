//! Port implementation - the fundamental IPC primitive

use heapless::Deque;

use super::{IpcError, IpcResult};
use crate::types::TaskId;
use crate::vm::value::Value;

/// Maximum messages queued on a port; writes past the limit are dropped
/// silently.
pub const MAX_MESSAGES: usize = 32;

/// A port: bounded FIFO mailbox owned by exactly one task.
///
/// The reference count tracks how many `(task, port)` rights entries keep
/// the port alive; the IPC layer destroys the port when the count reaches
/// zero ("last releaser destroys"). `blocked` marks a receiver that found
/// the mailbox empty — there is at most one, because only the owner may
/// receive.
#[derive(Debug)]
pub struct Port {
    owner: TaskId,
    ref_count: u32,
    messages: Deque<Value, MAX_MESSAGES>,
    blocked: bool,
}

impl Port {
    pub fn new(owner: TaskId) -> Self {
        Self {
            owner,
            ref_count: 0,
            messages: Deque::new(),
            blocked: false,
        }
    }

    pub fn owner(&self) -> TaskId {
        self.owner
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    pub fn queue_len(&self) -> usize {
        self.messages.len()
    }

    /// Append a payload. A full mailbox drops it silently. Returns the
    /// owner when the put cleared a blocked receiver, signalling "this
    /// task should be woken".
    pub fn put(&mut self, payload: Value) -> Option<TaskId> {
        if self.messages.push_back(payload).is_err() {
            return None;
        }
        if self.blocked {
            self.blocked = false;
            Some(self.owner)
        } else {
            None
        }
    }

    /// Pop the front message. An empty mailbox marks the receiver blocked
    /// and reports `WouldBlock`.
    pub fn read(&mut self) -> IpcResult<Value> {
        match self.messages.pop_front() {
            Some(payload) => Ok(payload),
            None => {
                self.blocked = true;
                Err(IpcError::WouldBlock)
            }
        }
    }

    pub fn retain(&mut self) {
        self.ref_count += 1;
    }

    /// Drop one reference. True means the count reached zero and the port
    /// must be destroyed by the caller.
    pub fn release(&mut self) -> bool {
        self.ref_count = self.ref_count.saturating_sub(1);
        self.ref_count == 0
    }
}
