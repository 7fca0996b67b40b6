//! Echo demo: one bytecode client looping against a native reply
//! handler.
//!
//! The client creates a reply port, sends to the handler with that port
//! attached, and prints whatever comes back. Run with RUST_LOG=debug to
//! watch the port and scheduler traffic.

use rmach::ipc::{Ipc, IpcResult, Message, Rights};
use rmach::kern::runq::PrioSched;
use rmach::kern::Kernel;
use rmach::types::{PortId, TaskId};
use rmach::vm::value::Value;

const CLIENT: &str = "
CREATE_PORT
STORE a

PUSH 1
FETCH a
PUSH 1
SEND

FETCH a
RECV

PRINT

JMP 3

HALT
";

/// Replies "hello" on the client's port, spending the one-shot SERVER
/// right that arrived with the request.
fn printer(msg: &Message, ipc: &mut Ipc, sched: &mut PrioSched) -> IpcResult<()> {
    ipc.syscall_send(
        msg.remote,
        Message::new(msg.reply, PortId::NULL, Value::from("hello")),
        sched,
    )
}

fn main() {
    env_logger::init();

    let client = TaskId(2);
    let mut kernel = Kernel::new();
    let handler = kernel.ipc_mut().register_native_handler(printer);
    kernel.ipc_mut().grant_right(client, handler, Rights::SEND);
    kernel.spawn(client, 4, CLIENT);

    // The client loops forever; give it a bounded number of rounds.
    kernel.run_for(40, &[], false);
}
