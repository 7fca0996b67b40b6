//! End-to-end scenarios driving assembled programs through the kernel.

use rmach::console::CaptureSink;
use rmach::ipc::{Delivery, Ipc, IpcError, IpcResult, Message, Rights};
use rmach::kern::runq::PrioSched;
use rmach::kern::{Kernel, TaskState};
use rmach::types::{PortId, TaskId};
use rmach::vm::value::Value;

fn kernel_with_capture() -> (Kernel, CaptureSink) {
    let sink = CaptureSink::new();
    (Kernel::with_sink(Box::new(sink.clone())), sink)
}

/// Native handler answering every request with "hello".
fn printer(msg: &Message, ipc: &mut Ipc, sched: &mut PrioSched) -> IpcResult<()> {
    ipc.syscall_send(
        msg.remote,
        Message::new(msg.reply, PortId::NULL, Value::from("hello")),
        sched,
    )
}

/// Echo to a native handler: the client loops sending to the handler and
/// printing the reply that lands on its own port.
#[test]
fn scenario_echo_native_handler() {
    let client_source = "
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
    let client = TaskId(2);
    let (mut kernel, out) = kernel_with_capture();
    let handler = kernel.ipc_mut().register_native_handler(printer);
    assert_eq!(handler, PortId(1));
    kernel.ipc_mut().grant_right(client, handler, Rights::SEND);
    kernel.spawn(client, 4, client_source);

    // The client loops forever, so it must still be alive afterwards.
    assert!(kernel.run_for(30, &[], false));
    let lines = out.lines();
    assert!(lines.len() >= 3, "expected repeated replies, got {:?}", lines);
    assert!(lines.iter().all(|line| line == "hello"));
}

/// A blocked receive wakes when another task sends to the port.
#[test]
fn scenario_blocked_receive_wakes_on_send() {
    let (mut kernel, out) = kernel_with_capture();
    kernel.spawn(
        TaskId(1),
        5,
        "CREATE_PORT\nSTORE p\nFETCH p\nRECV\nPRINT\nHALT",
    );

    // Let the receiver run until it parks on its empty port.
    kernel.run_for(2, &[], false);
    assert_eq!(kernel.task_state(TaskId(1)), Some(TaskState::Waiting));

    let port = PortId(1);
    kernel.ipc_mut().grant_right(TaskId(2), port, Rights::SEND);
    kernel.spawn(TaskId(2), 5, "PUSH 42\nPUSH 0\nPUSH 1\nSEND\nHALT");

    // The send hands off to the receiver; both run to completion.
    kernel.run(&[], false);
    assert_eq!(out.lines(), vec!["42"]);
    assert_eq!(kernel.task_count(), 0);
}

/// A send without the SEND capability is rejected and enqueues nothing.
#[test]
fn scenario_capability_violation() {
    let mut ipc = Ipc::new();
    let mut sched = PrioSched::new();
    let port = ipc.create_port(TaskId(1));

    let msg = Message::new(port, PortId::NULL, Value::Int(13));
    assert_eq!(ipc.send(TaskId(2), msg, &mut sched), Err(IpcError::NoRight));
    assert_eq!(ipc.port(port).map(|p| p.queue_len()), Some(0));
}

/// When the owner exits, its port dies even though a stranger still held
/// SEND on it; later sends answer InvalidName.
#[test]
fn scenario_refcount_destroy_on_owner_exit() {
    let mut ipc = Ipc::new();
    let mut sched = PrioSched::new();
    let owner = TaskId(1);
    let stranger = TaskId(2);

    let port = ipc.create_port(owner);
    ipc.grant_right(stranger, port, Rights::SEND);
    assert_eq!(ipc.port(port).map(|p| p.ref_count()), Some(2));

    ipc.cleanup_process(owner);

    assert!(ipc.port(port).is_none());
    assert!(ipc.is_tombstoned(port));
    let msg = Message::new(port, PortId::NULL, Value::Int(1));
    assert_eq!(
        ipc.send(stranger, msg, &mut sched),
        Err(IpcError::InvalidName)
    );
}

/// The 33rd message is dropped silently; the receiver reads exactly 32 in
/// order.
#[test]
fn scenario_queue_overflow() {
    let mut ipc = Ipc::new();
    let mut sched = PrioSched::new();
    let owner = TaskId(1);
    let sender = TaskId(2);
    let port = ipc.create_port(owner);
    ipc.grant_right(sender, port, Rights::SEND);

    for i in 0..33 {
        let msg = Message::new(port, PortId::NULL, Value::Int(i));
        // Overflow is invisible to the sender.
        assert_eq!(
            ipc.send(sender, msg, &mut sched),
            Ok(Delivery::Handoff(None))
        );
    }
    for i in 0..32 {
        assert_eq!(ipc.receive(owner, port), Ok(Value::Int(i)));
    }
    assert_eq!(ipc.receive(owner, port), Err(IpcError::WouldBlock));
}

/// A high-priority waiter preempts runnable low-priority tasks the moment
/// a send makes it runnable.
#[test]
fn scenario_priority_preemption_by_wake() {
    let (mut kernel, out) = kernel_with_capture();

    // H parks on its own port at priority 5.
    kernel.spawn(
        TaskId(10),
        5,
        "CREATE_PORT\nSTORE p\nFETCH p\nRECV\nPRINT\nHALT",
    );
    kernel.run_for(2, &[], false);
    assert_eq!(kernel.task_state(TaskId(10)), Some(TaskState::Waiting));

    // Two busy printers at priority 1.
    kernel.spawn(TaskId(11), 1, "PUSH L1\nPRINT\nJMP 0");
    kernel.spawn(TaskId(12), 1, "PUSH L2\nPRINT\nJMP 0");

    // The sender wakes H by delivering to its port.
    let port = PortId(1);
    kernel.ipc_mut().grant_right(TaskId(13), port, Rights::SEND);
    kernel.spawn(TaskId(13), 1, "PUSH 99\nPUSH 0\nPUSH 1\nSEND\nHALT");

    kernel.run_for(40, &[], false);

    let lines = out.lines();
    let woken_at = lines.iter().position(|l| l == "99");
    assert!(woken_at.is_some(), "H never ran, output {:?}", lines);
    // H finished ahead of the still-spinning background tasks.
    assert!(!kernel.is_alive(TaskId(10)));
    assert!(kernel.is_alive(TaskId(11)));
    assert!(kernel.is_alive(TaskId(12)));
    // The background tasks kept running after H was done.
    assert!(woken_at.unwrap() < lines.len() - 1);
}

/// A send chain stops after three chained recipients: the fourth stays
/// asleep, because a plain send wakes nobody on its own.
#[test]
fn scenario_handoff_chain_is_bounded() {
    let (mut kernel, out) = kernel_with_capture();

    // Relay tasks 2..=4 each wait on their own port, then forward to the
    // next relay's port and print a marker. Task 5 just waits and would
    // print the forwarded payload.
    // Task t+1 owns port t, so relay t forwards into port t.
    for (task, marker) in [(2u32, "done2"), (3, "done3"), (4, "done4")] {
        let source = format!(
            "CREATE_PORT\nSTORE p\nFETCH p\nRECV\nPOP\nPUSH fin\nPUSH 0\nPUSH {}\nSEND\nPUSH {}\nPRINT\nHALT",
            task, marker
        );
        kernel.spawn(TaskId(task), 3, &source);
    }
    kernel.spawn(TaskId(5), 3, "CREATE_PORT\nSTORE p\nFETCH p\nRECV\nPRINT\nHALT");

    // One round each: every relay creates its port (ids 1..=4) and parks.
    kernel.run_for(4, &[], false);
    for task in 2..=5 {
        assert_eq!(kernel.task_state(TaskId(task)), Some(TaskState::Waiting));
    }
    for (task, port) in [(2u32, 2u32), (3, 3), (4, 4)] {
        kernel.ipc_mut().grant_right(TaskId(task), PortId(port), Rights::SEND);
    }

    // The trigger sends into the head of the chain.
    kernel.ipc_mut().grant_right(TaskId(1), PortId(1), Rights::SEND);
    kernel.spawn(TaskId(1), 3, "PUSH go\nPUSH 0\nPUSH 1\nSEND\nHALT");
    kernel.run_for(30, &[], false);

    // The three chained relays all finished; the fourth recipient never
    // ran, so its payload was never printed.
    let lines = out.lines();
    for marker in ["done2", "done3", "done4"] {
        assert!(lines.contains(&marker.to_string()), "missing {}", marker);
    }
    assert!(!lines.contains(&"fin".to_string()));
    assert_eq!(kernel.task_state(TaskId(5)), Some(TaskState::Waiting));
}

/// Handler faults surface as HANDLER_ERROR on the reply port, printed
/// like any ordinary payload.
#[test]
fn scenario_handler_fault_reply() {
    fn broken(_: &Message, _: &mut Ipc, _: &mut PrioSched) -> IpcResult<()> {
        Err(IpcError::InvalidName)
    }

    let client_source = "
CREATE_PORT
STORE a
PUSH 1
FETCH a
PUSH 1
SEND
FETCH a
RECV
PRINT
HALT
";
    let client = TaskId(2);
    let (mut kernel, out) = kernel_with_capture();
    let handler = kernel.ipc_mut().register_native_handler(broken);
    kernel.ipc_mut().grant_right(client, handler, Rights::SEND);
    kernel.spawn(client, 4, client_source);

    kernel.run(&[], false);
    assert_eq!(out.lines(), vec!["HANDLER_ERROR"]);
}

/// Dead names are distinguishable from unknown names on receive: the VM
/// pushes the DIED sentinel.
#[test]
fn scenario_dead_name_sentinel() {
    let (mut kernel, out) = kernel_with_capture();

    // The first task creates port 1 and exits, tombstoning it.
    kernel.spawn(TaskId(1), 2, "CREATE_PORT\nSTORE p\nHALT");
    kernel.run_for(4, &[], false);
    assert!(kernel.ipc().is_tombstoned(PortId(1)));

    // A second task receiving on the dead name sees the sentinel.
    kernel.spawn(TaskId(2), 2, "PUSH 1\nRECV\nPRINT\nHALT");
    kernel.run(&[], false);
    assert_eq!(out.lines(), vec!["DIED"]);
}
