//! Kernel glue
//!
//! Spawns tasks, dispatches whatever the scheduler picks into its VM,
//! reacts to the VM's resulting state, opportunistically chains to
//! handoff recipients, and cleans up exiting tasks.

use std::collections::HashMap;

use log::{debug, warn};

use crate::asm::Assembler;
use crate::console::{Sink, StdoutSink};
use crate::ipc::Ipc;
use crate::kern::runq::PrioSched;
use crate::kern::task::{TaskControl, TaskEvent, TaskState};
use crate::types::TaskId;
use crate::vm::{RunState, Vm};

/// Maximum chained handoff recipients run before the scheduler
/// re-evaluates. Bounds priority inversion through send chains.
const HANDOFF_CHAIN_LIMIT: usize = 3;

/// Consecutive faults tolerated before a non-system task is forced out.
const FAULT_LIMIT: u32 = 3;

/// Floor for the robust-mode quantum.
const MIN_QUANTUM: usize = 8;

pub struct Kernel {
    sched: PrioSched,
    ipc: Ipc,
    asm: Assembler,
    procs: HashMap<TaskId, TaskControl>,
    out: Box<dyn Sink>,
}

impl Kernel {
    pub fn new() -> Self {
        Self::with_sink(Box::new(StdoutSink))
    }

    pub fn with_sink(out: Box<dyn Sink>) -> Self {
        Self {
            sched: PrioSched::new(),
            ipc: Ipc::new(),
            asm: Assembler::new(),
            procs: HashMap::new(),
            out,
        }
    }

    pub fn ipc(&self) -> &Ipc {
        &self.ipc
    }

    /// Mutable IPC access, used by embedders to register native handlers
    /// and pre-grant rights before the loop starts.
    pub fn ipc_mut(&mut self) -> &mut Ipc {
        &mut self.ipc
    }

    pub fn task_count(&self) -> usize {
        self.procs.len()
    }

    pub fn is_alive(&self, task: TaskId) -> bool {
        self.procs.contains_key(&task)
    }

    pub fn task_state(&self, task: TaskId) -> Option<TaskState> {
        self.procs.get(&task).map(|tc| tc.state)
    }

    /// Assemble `source`, build a VM for it, and register the task.
    pub fn spawn(&mut self, task: TaskId, priority: usize, source: &str) {
        let program = self.asm.assemble(source);
        let vm = Vm::new(task, program);
        self.procs.insert(task, TaskControl::new(task, priority, vm));
        self.sched.create_proc(task, priority);
        debug!("spawned task {} at priority {}", task, priority);
    }

    /// Tear a task down: IPC rights and ports first, then the kernel's
    /// own records.
    pub fn exit_proc(&mut self, task: TaskId) {
        self.ipc.cleanup_process(task);
        if let Some(tc) = self.procs.remove(&task) {
            debug!("task {} exited with code {}", task, tc.vm.exit_code());
        }
        self.sched.remove(task);
    }

    /// Opcodes granted per dispatch. The natural quantum scales with
    /// program size; robust mode clamps it from below, otherwise short
    /// programs run effectively unbounded.
    fn quantum_for(program_len: usize, robust: bool) -> usize {
        let natural = (program_len / 8) as i64 - 8;
        let clamped = if robust {
            natural.max(MIN_QUANTUM as i64)
        } else {
            natural.max(program_len as i64)
        };
        clamped as usize
    }

    /// Step one task's VM and absorb the state change. Returns the
    /// handoff recipient when the step ended in a delivery.
    fn run_task(&mut self, task: TaskId, system_tasks: &[TaskId], robust: bool) -> Option<TaskId> {
        let handoff = {
            let Some(tc) = self.procs.get_mut(&task) else {
                return None;
            };
            let quantum = Self::quantum_for(tc.vm.program_len(), robust);
            match tc.vm.step(quantum, &mut self.ipc, &mut self.sched, self.out.as_mut()) {
                Ok(target) => {
                    tc.faults = 0;
                    match tc.vm.run_state() {
                        RunState::Waiting => tc.transition(TaskEvent::MsgWait),
                        RunState::Closed => self.exit_proc(task),
                        RunState::Running => {}
                    }
                    target
                }
                Err(fault) => {
                    tc.faults += 1;
                    let faults = tc.faults;
                    warn!("task {} faulted: {} ({} consecutive)", task, fault, faults);
                    if faults >= FAULT_LIMIT && !system_tasks.contains(&task) {
                        if let Some(tc) = self.procs.get_mut(&task) {
                            tc.transition(TaskEvent::Closed);
                        }
                        self.exit_proc(task);
                    }
                    None
                }
            }
        };

        // Owners woken by handler sends during this step become Ready.
        for woken in self.ipc.take_pending_wakes() {
            if let Some(tc) = self.procs.get_mut(&woken) {
                if tc.state == TaskState::Waiting {
                    tc.transition(TaskEvent::MsgReady);
                }
            }
        }
        handoff
    }

    /// One scheduler iteration. False when no tasks remain (or none are
    /// reachable anymore).
    pub fn schedule_once(&mut self, system_tasks: &[TaskId], robust: bool) -> bool {
        if self.procs.is_empty() {
            return false;
        }
        let Some(task) = self.sched.get_next() else {
            warn!(
                "{} task(s) remain but none are schedulable; stopping",
                self.procs.len()
            );
            return false;
        };
        // A stale queue entry skips one iteration.
        let Some(tc) = self.procs.get_mut(&task) else {
            return true;
        };
        if tc.state == TaskState::Waiting {
            return true;
        }
        tc.transition(TaskEvent::Running);

        let mut target = self.run_task(task, system_tasks, robust);

        // Collapse the send/receive rendezvous: run the recipient (and
        // its own recipient, chained) before consulting the scheduler
        // again.
        let mut passes = 0;
        while let Some(next) = target {
            if passes >= HANDOFF_CHAIN_LIMIT {
                break;
            }
            let Some(tc) = self.procs.get_mut(&next) else {
                break;
            };
            if tc.vm.has_ended() {
                break;
            }
            let chained = self.run_task(next, system_tasks, robust);
            passes += 1;

            // A chained recipient that neither waited nor closed is
            // runnable; mark it Ready so the scheduler keeps it coming.
            if let Some(tc) = self.procs.get_mut(&next) {
                if tc.vm.run_state() == RunState::Running {
                    tc.transition(TaskEvent::MsgReady);
                }
            }
            target = match chained {
                Some(n) if n != next => Some(n),
                _ => None,
            };
        }

        // Quantum accounting for the originally scheduled task.
        if let Some(tc) = self.procs.get_mut(&task) {
            if tc.state == TaskState::Running && self.sched.tick(task) {
                tc.transition(TaskEvent::MsgReady);
            }
        }
        true
    }

    /// Run until every task has exited.
    pub fn run(&mut self, system_tasks: &[TaskId], robust: bool) {
        while self.schedule_once(system_tasks, robust) {}
    }

    /// Run at most `iterations` scheduler rounds; true when tasks remain.
    pub fn run_for(&mut self, iterations: usize, system_tasks: &[TaskId], robust: bool) -> bool {
        for _ in 0..iterations {
            if !self.schedule_once(system_tasks, robust) {
                return false;
            }
        }
        !self.procs.is_empty()
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}
