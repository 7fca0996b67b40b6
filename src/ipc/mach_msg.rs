//! Message send/receive engine
//!
//! Owns every port (arena keyed by id, so rights and tasks refer to ports
//! by name and no reference cycles form), the native handler table, the
//! rights table, and the tombstone set that keeps destroyed names
//! distinguishable from names that never existed.

use std::collections::{HashMap, HashSet};

use log::{debug, trace};

use super::port::Port;
use super::rights::{Rights, RightsTable};
use super::{IpcError, IpcResult, Message};
use crate::kern::runq::PrioSched;
use crate::types::{PortId, TaskId};
use crate::vm::value::Value;

/// Payload delivered on the reply channel when a native handler faults.
pub const HANDLER_ERROR: &str = "HANDLER_ERROR";

/// Native service handler, invoked synchronously during `send`. An `Err`
/// return is the handler faulting; the engine swallows it and posts
/// [`HANDLER_ERROR`] back through the reply channel instead.
pub type NativeHandler = fn(&Message, &mut Ipc, &mut PrioSched) -> IpcResult<()>;

/// Outcome of a successful send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Consumed synchronously by a native handler.
    Handled,
    /// Queued on a port; `Some` names a blocked owner the kernel should
    /// run next.
    Handoff(Option<TaskId>),
}

/// Native handler ids double as rights-table principals: a handler holds
/// its SERVER rights under its own port name.
fn handler_task(handler: PortId) -> TaskId {
    TaskId(handler.0)
}

pub struct Ipc {
    ports: HashMap<PortId, Port>,
    handlers: HashMap<PortId, NativeHandler>,
    rights: RightsTable,
    /// Ids of destroyed ports; lookups on these answer `DiedName`.
    tombstones: HashSet<PortId>,
    /// Single counter shared by ports and native handlers.
    name_counter: u32,
    /// Blocked owners woken by `syscall_send` since the kernel last
    /// drained; the kernel flips their process states to Ready.
    pending_wakes: Vec<TaskId>,
}

impl Ipc {
    pub fn new() -> Self {
        Self {
            ports: HashMap::new(),
            handlers: HashMap::new(),
            rights: RightsTable::new(),
            tombstones: HashSet::new(),
            name_counter: 0,
            pending_wakes: Vec::new(),
        }
    }

    fn next_name(&mut self) -> PortId {
        self.name_counter += 1;
        PortId(self.name_counter)
    }

    /// Allocate a port owned by `task` and grant the creator RECEIVE.
    pub fn create_port(&mut self, task: TaskId) -> PortId {
        let name = self.next_name();
        self.ports.insert(name, Port::new(task));
        self.grant_right(task, name, Rights::RECEIVE);
        debug!("port {} created by task {}", name, task);
        name
    }

    /// Bind a native handler under a fresh name from the same counter as
    /// real ports. No port object exists for this name.
    pub fn register_native_handler(&mut self, handler: NativeHandler) -> PortId {
        let name = self.next_name();
        self.handlers.insert(name, handler);
        debug!("native handler bound to name {}", name);
        name
    }

    /// Grant rights, retaining the port when this creates the entry.
    pub fn grant_right(&mut self, task: TaskId, port: PortId, rights: Rights) {
        if self.rights.grant(task, port, rights) {
            if let Some(port) = self.ports.get_mut(&port) {
                port.retain();
            }
        }
    }

    /// Consume a SERVER right if held, releasing the port reference that
    /// came with it.
    fn consume_right(&mut self, task: TaskId, port: PortId) -> bool {
        if self.rights.consume_server(task, port) {
            self.release_port(port);
            true
        } else {
            false
        }
    }

    /// Drop one reference; the last releaser destroys the port.
    fn release_port(&mut self, port_id: PortId) {
        if let Some(port) = self.ports.get_mut(&port_id) {
            if port.release() {
                let _ = self.destroy_port(port_id);
            }
        }
    }

    /// Send from a task.
    ///
    /// Destinations that are neither a live port nor a handler answer
    /// `InvalidName` (destroyed ports included: a dead name cannot be
    /// sent to, only a receive distinguishes it). The sender must hold
    /// SEND or SERVER on the destination.
    pub fn send(
        &mut self,
        task: TaskId,
        msg: Message,
        sched: &mut PrioSched,
    ) -> IpcResult<Delivery> {
        let is_port = self.ports.contains_key(&msg.remote);
        if !is_port && !self.handlers.contains_key(&msg.remote) {
            return Err(IpcError::InvalidName);
        }
        if !self.rights.check(task, msg.remote, Rights::SEND)
            && !self.rights.check(task, msg.remote, Rights::SERVER)
        {
            return Err(IpcError::NoRight);
        }

        if !is_port {
            return self.invoke_handler(msg, sched);
        }

        trace!("task {} sends to port {}", task, msg.remote);
        let Some(port) = self.ports.get_mut(&msg.remote) else {
            return Err(IpcError::InvalidName);
        };
        let owner = port.owner();
        let wake = port.put(msg.payload);

        // A SERVER right spent on this delivery goes away now.
        self.consume_right(task, msg.remote);

        if !msg.reply.is_null() {
            self.transfer_right(task, owner, msg.reply);
        }
        Ok(Delivery::Handoff(wake))
    }

    /// Dispatch to a native handler: arm its one-shot reply right, call
    /// it, and swallow any fault into a HANDLER_ERROR reply.
    fn invoke_handler(&mut self, msg: Message, sched: &mut PrioSched) -> IpcResult<Delivery> {
        if !msg.reply.is_null() && self.ports.contains_key(&msg.reply) {
            self.grant_right(handler_task(msg.remote), msg.reply, Rights::SERVER);
        }
        let Some(&handler) = self.handlers.get(&msg.remote) else {
            return Err(IpcError::InvalidName);
        };
        if let Err(err) = handler(&msg, self, sched) {
            debug!("handler {} faulted: {}", msg.remote, err);
            let _ = self.syscall_send(
                msg.remote,
                Message::new(msg.reply, PortId::NULL, Value::from(HANDLER_ERROR)),
                sched,
            );
        }
        Ok(Delivery::Handled)
    }

    /// Send from a native handler, spending its SERVER right.
    ///
    /// Unlike a task send, delivery to a blocked owner wakes it through
    /// the scheduler directly (the handler runs inside somebody else's
    /// time slice, so there is no handoff to chain).
    pub fn syscall_send(
        &mut self,
        handler: PortId,
        msg: Message,
        sched: &mut PrioSched,
    ) -> IpcResult<()> {
        if !self.handlers.contains_key(&handler) {
            return Err(IpcError::InvalidName);
        }
        if !self.rights.check(handler_task(handler), msg.remote, Rights::SERVER) {
            return Err(IpcError::NoRight);
        }
        let Some(port) = self.ports.get_mut(&msg.remote) else {
            return Err(IpcError::InvalidName);
        };
        let owner = port.owner();
        let wake = port.put(msg.payload);

        self.consume_right(handler_task(handler), msg.remote);

        if let Some(owner) = wake {
            let priority = sched.priority_of(owner).unwrap_or(0);
            sched.wake_up(owner, priority);
            self.pending_wakes.push(owner);
            trace!("handler {} wakes task {} at priority {}", handler, owner, priority);
        }

        if !msg.reply.is_null() {
            self.transfer_right(handler_task(handler), owner, msg.reply);
        }
        Ok(())
    }

    /// Receive on a port the caller owns.
    pub fn receive(&mut self, task: TaskId, port_id: PortId) -> IpcResult<Value> {
        if self.tombstones.contains(&port_id) {
            return Err(IpcError::DiedName);
        }
        let Some(port) = self.ports.get_mut(&port_id) else {
            return Err(IpcError::InvalidName);
        };
        if !self.rights.check(task, port_id, Rights::RECEIVE) {
            return Err(IpcError::NoRight);
        }
        port.read()
    }

    /// Grant `dest` SEND on `port_id`, provided `src` could send there
    /// itself and the port is live.
    pub fn transfer_right(&mut self, src: TaskId, dest: TaskId, port_id: PortId) {
        if self.rights.check(src, port_id, Rights::SEND) && self.ports.contains_key(&port_id) {
            self.grant_right(dest, port_id, Rights::SEND);
        }
    }

    /// Tear down everything a task holds: release each referenced port,
    /// and destroy outright the ports it owned (held RECEIVE on).
    pub fn cleanup_process(&mut self, task: TaskId) {
        for (port_id, mask) in self.rights.held_by(task) {
            self.release_port(port_id);
            if mask.contains(Rights::RECEIVE) {
                let _ = self.destroy_port(port_id);
            }
            self.rights.remove(task, port_id);
        }
        debug!("cleaned up rights of task {}", task);
    }

    /// Remove the port, purge every rights entry referencing it, and
    /// tombstone the name forever.
    pub fn destroy_port(&mut self, port_id: PortId) -> IpcResult<()> {
        if self.ports.remove(&port_id).is_none() {
            return Err(IpcError::InvalidName);
        }
        self.rights.purge_port(port_id);
        self.tombstones.insert(port_id);
        debug!("port {} extinguished", port_id);
        Ok(())
    }

    /// Owners woken by handler sends since the last drain.
    pub fn take_pending_wakes(&mut self) -> Vec<TaskId> {
        std::mem::take(&mut self.pending_wakes)
    }

    pub fn port(&self, port_id: PortId) -> Option<&Port> {
        self.ports.get(&port_id)
    }

    pub fn is_tombstoned(&self, port_id: PortId) -> bool {
        self.tombstones.contains(&port_id)
    }

    pub fn rights(&self) -> &RightsTable {
        &self.rights
    }
}

impl Default for Ipc {
    fn default() -> Self {
        Self::new()
    }
}
