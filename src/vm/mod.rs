//! Stack bytecode virtual machine
//!
//! One instance per task. Most opcodes are ordinary stack-machine fare;
//! the syscall-like ones (CREATE_PORT, SEND, RECV) reach into the IPC
//! layer. An empty receive suspends the task, and a send that lands on a
//! port hands control back to the kernel so the recipient can run.

pub mod opcode;
pub mod value;

use std::collections::HashMap;

use log::trace;

use crate::console::Sink;
use crate::ipc::{Delivery, Ipc, IpcError, Message};
use crate::kern::runq::PrioSched;
use crate::types::TaskId;
use self::opcode::{Op, Program, Word};
use self::value::Value;

/// Operand stack limit; a stack past this at the top of an opcode
/// terminates the task.
pub const STACK_LIMIT: usize = 32;

/// Ports a single task may create over its lifetime; CREATE_PORT answers
/// -1 past this.
pub const PORT_QUOTA: u32 = 8;

/// Sentinel pushed when a receive names a destroyed port.
const DIED: &str = "DIED";

/// Run state observed by the kernel after each step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Closed,
    Running,
    Waiting,
}

/// Faults a step can raise. The kernel counts consecutive faults and
/// forces persistent offenders out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// An opcode popped more than the stack held.
    StackUnderflow,
    /// An operator met operand tags it has no meaning for.
    TypeMismatch,
    DivideByZero,
    /// A malformed program word: missing literal, bad jump target.
    BadProgram,
}

impl core::fmt::Display for Fault {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Fault::StackUnderflow => write!(f, "stack underflow"),
            Fault::TypeMismatch => write!(f, "type mismatch"),
            Fault::DivideByZero => write!(f, "divide by zero"),
            Fault::BadProgram => write!(f, "bad program word"),
        }
    }
}

pub struct Vm {
    task: TaskId,
    program: Program,
    pc: usize,
    stack: Vec<Value>,
    env: HashMap<String, Value>,
    run_state: RunState,
    /// Latched on HALT or stack overflow; the VM never runs again.
    ended: bool,
    ports_created: u32,
    exit_code: i64,
}

impl Vm {
    pub fn new(task: TaskId, program: Program) -> Self {
        let mut env = HashMap::new();
        env.insert("exitcode".to_string(), Value::Int(0));
        Self {
            task,
            program,
            pc: 0,
            stack: Vec::new(),
            env,
            run_state: RunState::Closed,
            ended: false,
            ports_created: 0,
            exit_code: 0,
        }
    }

    pub fn run_state(&self) -> RunState {
        self.run_state
    }

    pub fn has_ended(&self) -> bool {
        self.ended
    }

    pub fn exit_code(&self) -> i64 {
        self.exit_code
    }

    pub fn program_len(&self) -> usize {
        self.program.len()
    }

    #[cfg(test)]
    pub(crate) fn pc(&self) -> usize {
        self.pc
    }

    #[cfg(test)]
    pub(crate) fn stack(&self) -> &[Value] {
        &self.stack
    }

    fn pop(&mut self) -> Result<Value, Fault> {
        self.stack.pop().ok_or(Fault::StackUnderflow)
    }

    /// The inline literal at `at`, or a fault for truncated or mangled
    /// programs.
    fn lit(&self, at: usize) -> Result<&Value, Fault> {
        match self.program.get(at) {
            Some(Word::Lit(value)) => Ok(value),
            _ => Err(Fault::BadProgram),
        }
    }

    /// Environment cell name from an inline literal. Integer operands
    /// name cells by their decimal form.
    fn lit_name(&self, at: usize) -> Result<String, Fault> {
        match self.lit(at)? {
            Value::Str(s) => Ok(s.clone()),
            Value::Int(n) => Ok(n.to_string()),
            _ => Err(Fault::BadProgram),
        }
    }

    fn jump_target(&self, at: usize) -> Result<usize, Fault> {
        match self.lit(at)? {
            Value::Int(n) if *n >= 0 => Ok(*n as usize),
            _ => Err(Fault::BadProgram),
        }
    }

    /// Reaching past the program's end closes the task for good.
    fn finish_program(&mut self) {
        self.run_state = RunState::Closed;
        self.program.clear();
    }

    /// Run up to `quantum` opcodes. Returns the handoff recipient when a
    /// send landed on a port, or a fault for the kernel to count. Early
    /// exits: program end or stack overflow (Closed), RECV on an empty
    /// port (Waiting, pc held at the RECV), RETURN, HALT.
    pub fn step(
        &mut self,
        quantum: usize,
        ipc: &mut Ipc,
        sched: &mut PrioSched,
        out: &mut dyn Sink,
    ) -> Result<Option<TaskId>, Fault> {
        if self.ended {
            return Ok(None);
        }
        self.run_state = RunState::Running;
        if self.pc >= self.program.len() {
            self.finish_program();
            return Ok(None);
        }

        for _ in 0..quantum {
            if self.pc >= self.program.len() {
                self.finish_program();
                return Ok(None);
            }
            if self.stack.len() > STACK_LIMIT {
                trace!("task {} overflowed its operand stack", self.task);
                self.run_state = RunState::Closed;
                self.ended = true;
                return Ok(None);
            }

            let Word::Op(op) = self.program[self.pc] else {
                return Err(Fault::BadProgram);
            };
            match op {
                Op::Push => {
                    let value = self.lit(self.pc + 1)?.clone();
                    self.stack.push(value);
                    self.pc += 2;
                }
                Op::Pop => {
                    self.pop()?;
                    self.pc += 1;
                }
                Op::Fetch => {
                    let name = self.lit_name(self.pc + 1)?;
                    let value = match self.env.get(&name) {
                        Some(v) if v.is_truthy() => v.clone(),
                        _ => Value::Int(0),
                    };
                    self.stack.push(value);
                    self.pc += 2;
                }
                Op::Store => {
                    let name = self.lit_name(self.pc + 1)?;
                    let value = self.pop()?;
                    self.env.insert(name, value);
                    self.pc += 2;
                }
                Op::Add | Op::Sub | Op::Mul | Op::Div
                | Op::Lt | Op::Gt | Op::Eq | Op::NotEq => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.stack.push(apply_binop(op, a, b)?);
                    self.pc += 1;
                }
                Op::Jz => {
                    let target = self.jump_target(self.pc + 1)?;
                    if self.pop()?.is_zero() {
                        self.pc = target;
                    } else {
                        self.pc += 2;
                    }
                }
                Op::Jnz => {
                    let target = self.jump_target(self.pc + 1)?;
                    if self.pop()?.is_zero() {
                        self.pc += 2;
                    } else {
                        self.pc = target;
                    }
                }
                Op::Jmp => {
                    self.pc = self.jump_target(self.pc + 1)?;
                }
                Op::Print => {
                    let value = self.pop()?;
                    out.print(&value);
                    self.pc += 1;
                }
                Op::List => {
                    let count = pop_count(self.pop()?)?;
                    let mut items = Vec::with_capacity(count);
                    for _ in 0..count {
                        items.push(self.pop()?);
                    }
                    items.reverse();
                    self.stack.push(Value::List(items));
                    self.pc += 1;
                }
                Op::Dict => {
                    let count = pop_count(self.pop()?)?;
                    let mut raw = Vec::with_capacity(count);
                    for _ in 0..count {
                        raw.push(self.pop()?);
                    }
                    // Pairs were pushed key-then-value; in pop order the
                    // key of each pair sits one slot deeper.
                    let mut map = std::collections::BTreeMap::new();
                    let mut i = raw.len();
                    while i > 1 {
                        let key = raw[i - 1].clone();
                        let val = raw[i - 2].clone();
                        map.insert(key, val);
                        i -= 2;
                    }
                    self.stack.push(Value::Map(map));
                    self.pc += 1;
                }
                Op::Index => {
                    let idx = self.pop()?;
                    let obj = self.pop()?;
                    self.stack
                        .push(index_value(&obj, &idx).unwrap_or(Value::Int(0)));
                    self.pc += 1;
                }
                Op::Append => {
                    let name = self.lit_name(self.pc + 1)?;
                    let Some(container) = self.env.get(&name).cloned() else {
                        return Err(Fault::TypeMismatch);
                    };
                    match container {
                        Value::List(mut items) => {
                            items.push(self.pop()?);
                            let list = Value::List(items);
                            self.env.insert(name, list.clone());
                            self.stack.push(list);
                        }
                        Value::Map(mut map) => {
                            let key = self.pop()?;
                            let val = self.pop()?;
                            map.insert(key, val);
                            let dict = Value::Map(map);
                            self.env.insert(name, dict.clone());
                            self.stack.push(dict);
                        }
                        // Scalars are left alone and nothing is pushed.
                        _ => {}
                    }
                    self.pc += 2;
                }
                Op::CreatePort => {
                    self.ports_created += 1;
                    if self.ports_created > PORT_QUOTA {
                        self.stack.push(Value::Int(-1));
                    } else {
                        let port = ipc.create_port(self.task);
                        self.stack.push(Value::Int(port.0 as i64));
                    }
                    self.pc += 1;
                }
                Op::Send => {
                    let remote = self.pop()?;
                    let reply = self.pop()?;
                    let payload = self.pop()?;
                    self.pc += 1;
                    let (Some(remote), Some(reply)) =
                        (remote.as_port_name(), reply.as_port_name())
                    else {
                        // Malformed names: the send would answer
                        // InvalidName, which bytecode cannot observe.
                        continue;
                    };
                    match ipc.send(self.task, Message::new(remote, reply, payload), sched) {
                        // Delivery makes the recipient runnable; yield so
                        // the kernel can chain to it.
                        Ok(Delivery::Handoff(target)) => return Ok(target),
                        Ok(Delivery::Handled) => {}
                        Err(_) => {}
                    }
                }
                Op::Recv => {
                    let name = self.pop()?;
                    let Some(port) = name.as_port_name() else {
                        self.stack.push(Value::Int(0));
                        self.pc += 1;
                        continue;
                    };
                    match ipc.receive(self.task, port) {
                        Ok(payload) => {
                            self.stack.push(payload);
                            self.pc += 1;
                        }
                        Err(IpcError::WouldBlock) => {
                            // Sleep with the name re-pushed and pc held,
                            // so the woken task re-executes this RECV.
                            self.run_state = RunState::Waiting;
                            self.stack.push(Value::Int(port.0 as i64));
                            return Ok(None);
                        }
                        Err(IpcError::DiedName) => {
                            self.stack.push(Value::from(DIED));
                            self.pc += 1;
                        }
                        Err(_) => {
                            self.stack.push(Value::Int(0));
                            self.pc += 1;
                        }
                    }
                }
                Op::Return => {
                    self.pc += 1;
                    return Ok(None);
                }
                Op::Halt => {
                    self.run_state = RunState::Closed;
                    self.ended = true;
                    self.exit_code = match self.env.get("exitcode") {
                        Some(Value::Int(n)) => *n,
                        _ => 0,
                    };
                    return Ok(None);
                }
            }
        }
        Ok(None)
    }
}

fn pop_count(value: Value) -> Result<usize, Fault> {
    match value {
        Value::Int(n) if n >= 0 => Ok(n as usize),
        _ => Err(Fault::TypeMismatch),
    }
}

/// Integer division flooring toward negative infinity.
fn floor_div(a: i64, b: i64) -> i64 {
    let q = a / b;
    if a % b != 0 && (a < 0) != (b < 0) {
        q - 1
    } else {
        q
    }
}

fn apply_binop(op: Op, a: Value, b: Value) -> Result<Value, Fault> {
    use Value::{Int, List, Str};
    Ok(match op {
        Op::Add => match (a, b) {
            (Int(x), Int(y)) => Int(x.wrapping_add(y)),
            (Str(mut x), Str(y)) => {
                x.push_str(&y);
                Str(x)
            }
            (List(mut x), List(y)) => {
                x.extend(y);
                List(x)
            }
            _ => return Err(Fault::TypeMismatch),
        },
        Op::Sub => match (a, b) {
            (Int(x), Int(y)) => Int(x.wrapping_sub(y)),
            _ => return Err(Fault::TypeMismatch),
        },
        Op::Mul => match (a, b) {
            (Int(x), Int(y)) => Int(x.wrapping_mul(y)),
            _ => return Err(Fault::TypeMismatch),
        },
        Op::Div => match (a, b) {
            (Int(_), Int(0)) => return Err(Fault::DivideByZero),
            (Int(x), Int(y)) => Int(floor_div(x, y)),
            _ => return Err(Fault::TypeMismatch),
        },
        Op::Lt => match (&a, &b) {
            (Int(_), Int(_)) | (Str(_), Str(_)) => Int((a < b) as i64),
            _ => return Err(Fault::TypeMismatch),
        },
        Op::Gt => match (&a, &b) {
            (Int(_), Int(_)) | (Str(_), Str(_)) => Int((a > b) as i64),
            _ => return Err(Fault::TypeMismatch),
        },
        Op::Eq => Int((a == b) as i64),
        Op::NotEq => Int((a != b) as i64),
        _ => return Err(Fault::BadProgram),
    })
}

/// Soft indexing: negative list and string indices count from the end,
/// map lookups miss without complaint. `None` becomes 0 at the call
/// site.
fn index_value(obj: &Value, idx: &Value) -> Option<Value> {
    match (obj, idx) {
        (Value::List(items), Value::Int(n)) => {
            let i = if *n < 0 { items.len() as i64 + n } else { *n };
            usize::try_from(i).ok().and_then(|i| items.get(i).cloned())
        }
        (Value::Map(map), key) => map.get(key).cloned(),
        (Value::Str(s), Value::Int(n)) => {
            let i = if *n < 0 { s.chars().count() as i64 + n } else { *n };
            usize::try_from(i)
                .ok()
                .and_then(|i| s.chars().nth(i))
                .map(|c| Value::Str(c.to_string()))
        }
        _ => None,
    }
}
