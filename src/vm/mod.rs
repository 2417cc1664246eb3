use std::cmp::Ordering;

use crate::bytecode::*;
use crate::syscall::{CallContext, Logger, Syscall, SyscallError, SyscallTable, TRACING_LOGGER};
use crate::value::{ArithError, Value};

#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("stack underflow")]
    StackUnderflow,
    #[error("stack overflow (limit {limit})")]
    StackOverflow { limit: usize },
    #[error("{depth} values left on the stack at halt")]
    UnbalancedHalt { depth: usize },
    #[error("cannot index {container} with {key}")]
    Index { container: &'static str, key: &'static str },
    #[error("cannot iterate over {kind}")]
    NotIterable { kind: &'static str },
    #[error(transparent)]
    Arith(#[from] ArithError),
    #[error("unknown opcode: {op}")]
    UnknownOpcode { op: u8 },
    #[error("invalid operand (source {src}, argument {arg})")]
    BadOperand { src: u8, arg: u32 },
    #[error("jump target {target} out of range")]
    BadJump { target: i64 },
    #[error("unknown block id {id}")]
    BadBlock { id: u32 },
    #[error("unknown block '{name}'")]
    UnknownBlock { name: String },
    #[error("block name must be a string, got {kind}")]
    BlockName { kind: &'static str },
    #[error("block '{name}' expects {expected} arguments, got {got}")]
    Arity { name: String, expected: u32, got: u32 },
    #[error("return leaves {got} values above the frame, expected {expected}")]
    BadReturn { expected: usize, got: usize },
    #[error("return outside of a block")]
    ReturnWithoutCall,
    #[error("call depth limit ({limit}) exceeded")]
    CallDepth { limit: usize },
    #[error("unknown function '{name}'")]
    UnresolvedSyscall { name: String },
    #[error("function '{name}' failed: {source}")]
    Syscall {
        name: String,
        #[source]
        source: SyscallError,
    },
    #[error("step limit ({limit}) exceeded")]
    StepLimit { limit: u64 },
}

impl VmError {
    pub fn code(&self) -> &'static str {
        match self {
            VmError::StackUnderflow | VmError::StackOverflow { .. } | VmError::UnbalancedHalt { .. } => "TMPL-R001",
            VmError::Index { .. } | VmError::NotIterable { .. } => "TMPL-R002",
            VmError::Arith(_) => "TMPL-R003",
            VmError::UnknownOpcode { .. }
            | VmError::BadOperand { .. }
            | VmError::BadJump { .. }
            | VmError::BadBlock { .. }
            | VmError::BadReturn { .. }
            | VmError::ReturnWithoutCall => "TMPL-R004",
            VmError::UnknownBlock { .. } | VmError::BlockName { .. } | VmError::Arity { .. } => "TMPL-R005",
            VmError::UnresolvedSyscall { .. } | VmError::Syscall { .. } => "TMPL-R006",
            VmError::CallDepth { .. } | VmError::StepLimit { .. } => "TMPL-R007",
        }
    }
}

type VmResult<T> = Result<T, VmError>;

/// A failed render: what went wrong and where in the template.
#[derive(Debug)]
pub struct RuntimeError {
    pub error: VmError,
    pub ip: usize,
    pub position: Option<Position>,
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.position {
            Some(p) => write!(f, "{} at {}:{}:{}", self.error, p.file, p.line, p.column),
            None => write!(f, "{}", self.error),
        }
    }
}

impl std::error::Error for RuntimeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Instructions per run; `None` for no limit.
    pub max_steps: Option<u64>,
    pub max_stack: usize,
    pub max_call_depth: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig { max_steps: Some(50_000_000), max_stack: 65_536, max_call_depth: 256 }
    }
}

// ── Vm ──────────────────────────────────────────────────────────────

/// Runs a program against data. Holds no per-run state, so one `Vm` can
/// render from many threads at once.
pub struct Vm<'a> {
    program: &'a Program,
    table: &'a SyscallTable,
    config: VmConfig,
    logger: &'a dyn Logger,
}

impl<'a> Vm<'a> {
    pub fn new(program: &'a Program, table: &'a SyscallTable) -> Self {
        Vm { program, table, config: VmConfig::default(), logger: &TRACING_LOGGER }
    }

    pub fn with_config(mut self, config: VmConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_logger(mut self, logger: &'a dyn Logger) -> Self {
        self.logger = logger;
        self
    }

    /// Render into `out`. On failure `out` keeps what was written before
    /// the failing instruction.
    pub fn run(&self, data: &Value, out: &mut String) -> Result<(), RuntimeError> {
        tracing::debug!(instructions = self.program.code.len(), "render started");
        let syscalls = self.bind()?;
        let mut exec = Exec {
            program: self.program,
            config: &self.config,
            syscalls,
            stack: Vec::with_capacity(64),
            regs: Default::default(),
            flags: Ordering::Equal,
            frames: Vec::new(),
            entries: None,
            saved_entries: Vec::new(),
            ip: 0,
            steps: 0,
        };
        let cx = CallContext { root: data, logger: self.logger };
        let start = out.len();
        let result = exec.execute(&cx, out);
        tracing::debug!(steps = exec.steps, bytes = out.len() - start, ok = result.is_ok(), "render finished");
        result.map_err(|error| self.fail(error, exec.ip))
    }

    /// Render to a fresh string, discarding partial output on failure.
    pub fn render(&self, data: &Value) -> Result<String, RuntimeError> {
        let mut out = String::new();
        self.run(data, &mut out)?;
        Ok(out)
    }

    /// Resolve every function name the program uses before any output.
    fn bind(&self) -> Result<Vec<&'a dyn Syscall>, RuntimeError> {
        self.program
            .syscalls
            .iter()
            .enumerate()
            .map(|(id, name)| {
                self.table.get(name).ok_or_else(|| {
                    let ip = self.first_use(id).unwrap_or(0);
                    self.fail(VmError::UnresolvedSyscall { name: name.clone() }, ip)
                })
            })
            .collect()
    }

    /// Index of the first SYSCALL instruction calling function `id`.
    fn first_use(&self, id: usize) -> Option<usize> {
        self.program.code.iter().position(|inst| inst.op() == OP_SYSCALL && (inst.argument >> 16) as usize == id)
    }

    fn fail(&self, error: VmError, ip: usize) -> RuntimeError {
        let position = self.program.code.get(ip).and_then(|inst| self.program.position(inst.debug));
        RuntimeError { error, ip, position }
    }
}

// ── Execution state ─────────────────────────────────────────────────

struct Frame {
    return_ip: usize,
    bp: usize,
}

/// Entries of a hash under iteration, in key order, taken once per loop.
type Entries = Vec<(String, Value)>;

struct Exec<'p> {
    program: &'p Program,
    config: &'p VmConfig,
    syscalls: Vec<&'p dyn Syscall>,
    stack: Vec<Value>,
    regs: [Value; REG_COUNT],
    flags: Ordering,
    frames: Vec<Frame>,
    /// Snapshot for the current loop when it walks a hash.
    entries: Option<Entries>,
    /// Snapshots of the loops whose registers were saved, keyed by the
    /// stack slot of their saved HR.
    saved_entries: Vec<(usize, Option<Entries>)>,
    ip: usize,
    steps: u64,
}

fn cond_holds(cond: u8, flags: Ordering) -> Option<bool> {
    Some(match cond {
        COND_EQ => flags == Ordering::Equal,
        COND_NE => flags != Ordering::Equal,
        COND_GT => flags == Ordering::Greater,
        COND_LT => flags == Ordering::Less,
        COND_GE => flags != Ordering::Less,
        COND_LE => flags != Ordering::Greater,
        _ => return None,
    })
}

fn index(container: Value, key: &Value) -> VmResult<Value> {
    match (container, key) {
        (Value::Undefined, _) => Ok(Value::Undefined),
        (Value::Hash(mut map), Value::String(k)) => Ok(map.remove(k).unwrap_or_default()),
        (Value::Array(mut items), Value::Int(i)) => Ok(match usize::try_from(*i) {
            Ok(i) if i < items.len() => items.swap_remove(i),
            _ => Value::Undefined,
        }),
        (container, key) => Err(VmError::Index { container: container.kind(), key: key.kind() }),
    }
}

/// Loop information for the loop whose registers are `hr`, `fr`, `er`;
/// `entries` is its hash snapshot, if it walks a hash.
fn loop_info(key: LoopKey, hr: &Value, fr: &Value, er: &Value, entries: Option<&[(String, Value)]>) -> Value {
    let i = er.to_number().as_i64();
    let n = fr.to_number().as_i64();
    match key {
        LoopKey::Key => entries
            .zip(usize::try_from(i).ok())
            .and_then(|(entries, i)| entries.get(i))
            .map(|(k, _)| Value::String(k.clone()))
            .unwrap_or_default(),
        LoopKey::Index => Value::Int(i),
        LoopKey::Counter => Value::Int(i + 1),
        LoopKey::First => Value::from(i == 0),
        LoopKey::Last => Value::from(i + 1 == n),
        LoopKey::Inner => Value::from(i != 0 && i + 1 != n),
        LoopKey::Odd => Value::from((i + 1) % 2 == 1),
        LoopKey::Even => Value::from((i + 1) % 2 == 0),
        LoopKey::Size => Value::Int(n),
        LoopKey::Value => hr.clone(),
    }
}

impl<'p> Exec<'p> {
    fn push(&mut self, v: Value) -> VmResult<()> {
        if self.stack.len() >= self.config.max_stack {
            return Err(VmError::StackOverflow { limit: self.config.max_stack });
        }
        self.stack.push(v);
        Ok(())
    }

    fn pop(&mut self) -> VmResult<Value> {
        self.stack.pop().ok_or(VmError::StackUnderflow)
    }

    fn top(&self) -> VmResult<&Value> {
        self.stack.last().ok_or(VmError::StackUnderflow)
    }

    /// Absolute index of the slot `offset` positions below the top.
    fn slot(&self, offset: u32) -> VmResult<usize> {
        self.stack.len().checked_sub(1 + offset as usize).ok_or(VmError::StackUnderflow)
    }

    fn operand(&self, src: u8, arg: u32) -> VmResult<Value> {
        let bad = || VmError::BadOperand { src, arg };
        match src {
            SRC_NONE => Ok(Value::Undefined),
            SRC_INT => self.program.data.ints.get(arg as usize).map(|&i| Value::Int(i)).ok_or_else(bad),
            SRC_FLOAT => self.program.data.floats.get(arg as usize).map(|&f| Value::Float(f)).ok_or_else(bad),
            SRC_STR => self.program.text.get(arg).map(Value::from).ok_or_else(bad),
            SRC_STACK => Ok(self.stack[self.slot(arg)?].clone()),
            SRC_ARG => {
                let frame = self.frames.last().ok_or_else(bad)?;
                self.stack.get(frame.bp + arg as usize).cloned().ok_or(VmError::StackUnderflow)
            }
            SRC_REG => self.regs.get(arg as usize).cloned().ok_or_else(bad),
            _ => Err(bad()),
        }
    }

    fn reg_mut(&mut self, reg: u8) -> VmResult<&mut Value> {
        self.regs.get_mut(reg as usize).ok_or(VmError::BadOperand { src: SRC_REG, arg: reg as u32 })
    }

    fn binary(&mut self, f: fn(&Value, &Value) -> Result<Value, ArithError>) -> VmResult<()> {
        let b = self.pop()?;
        let a = self.pop()?;
        self.push(f(&a, &b)?)
    }

    fn relative(&self, arg: u32) -> VmResult<usize> {
        let target = self.ip as i64 + arg as i32 as i64;
        usize::try_from(target).map_err(|_| VmError::BadJump { target })
    }

    fn enter(&mut self, entry: u32, bp: usize, return_ip: usize) -> VmResult<usize> {
        if self.frames.len() >= self.config.max_call_depth {
            return Err(VmError::CallDepth { limit: self.config.max_call_depth });
        }
        self.frames.push(Frame { return_ip, bp });
        Ok(entry as usize)
    }

    fn execute(&mut self, cx: &CallContext<'_>, out: &mut String) -> VmResult<()> {
        let program = self.program;
        loop {
            let inst = *program
                .code
                .get(self.ip)
                .ok_or(VmError::BadJump { target: self.ip as i64 })?;
            self.steps += 1;
            if let Some(limit) = self.config.max_steps {
                if self.steps > limit {
                    return Err(VmError::StepLimit { limit });
                }
            }
            let arg = inst.argument;
            let mut next = self.ip + 1;

            match inst.op() {
                OP_HLT => {
                    if !self.stack.is_empty() {
                        return Err(VmError::UnbalancedHalt { depth: self.stack.len() });
                    }
                    return Ok(());
                }
                OP_PUSH => {
                    let v = self.operand(inst.src(), arg)?;
                    self.push(v)?;
                }
                OP_POP => {
                    if inst.dst() == REG_NONE {
                        let n = arg as usize;
                        let keep = self.stack.len().checked_sub(n).ok_or(VmError::StackUnderflow)?;
                        self.stack.truncate(keep);
                    } else {
                        let v = self.pop()?;
                        *self.reg_mut(inst.dst())? = v;
                    }
                }
                OP_LOOKUP => {
                    let name = program.text.get(arg).ok_or(VmError::BadOperand { src: SRC_STR, arg })?;
                    let v = match self.regs[REG_HR as usize].get(name) {
                        Some(local) => local.clone(),
                        None => cx.root.get(name).cloned().unwrap_or_default(),
                    };
                    self.push(v)?;
                }
                OP_INDEX => {
                    let key = self.pop()?;
                    let container = self.pop()?;
                    let v = index(container, &key)?;
                    self.push(v)?;
                }
                OP_MOV => {
                    let v = self.operand(inst.src(), arg)?;
                    *self.reg_mut(inst.dst())? = v;
                }
                OP_SAVE => {
                    let hr = self.stack.len();
                    for reg in [REG_HR, REG_GR, REG_FR, REG_ER] {
                        let v = std::mem::take(&mut self.regs[reg as usize]);
                        self.push(v)?;
                    }
                    self.saved_entries.push((hr, self.entries.take()));
                }
                OP_RESTORE => {
                    for reg in [REG_ER, REG_FR, REG_GR, REG_HR] {
                        self.regs[reg as usize] = self.pop()?;
                    }
                    let (_, entries) = self.saved_entries.pop().ok_or(VmError::StackUnderflow)?;
                    self.entries = entries;
                }
                OP_SIZE => {
                    let (size, entries) = match &self.regs[REG_GR as usize] {
                        Value::Undefined => (0, None),
                        Value::Array(items) => (items.len() as i64, None),
                        Value::Hash(map) => {
                            let entries: Entries = map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                            (entries.len() as i64, Some(entries))
                        }
                        other => return Err(VmError::NotIterable { kind: other.kind() }),
                    };
                    self.entries = entries;
                    self.flags = size.cmp(&0);
                    self.regs[REG_FR as usize] = Value::Int(size);
                }
                OP_ITER => {
                    let i = self.regs[REG_ER as usize].to_number().as_i64();
                    let element = match (&self.entries, &self.regs[REG_GR as usize], usize::try_from(i)) {
                        (Some(entries), _, Ok(i)) => entries.get(i).map(|(_, v)| v.clone()),
                        (None, Value::Array(items), Ok(i)) => items.get(i).cloned(),
                        _ => None,
                    };
                    self.regs[REG_HR as usize] = element.unwrap_or_default();
                }
                OP_LOOP => {
                    let i = self.regs[REG_ER as usize].to_number().as_i64() + 1;
                    self.regs[REG_ER as usize] = Value::Int(i);
                    if i < self.regs[REG_FR as usize].to_number().as_i64() {
                        next = arg as usize;
                    }
                }
                OP_LOOPINFO => {
                    let key = LoopKey::from_u8(inst.dst()).ok_or(VmError::BadOperand { src: inst.src(), arg })?;
                    let v = match inst.src() {
                        SRC_REG => {
                            let r = &self.regs;
                            loop_info(
                                key,
                                &r[REG_HR as usize],
                                &r[REG_FR as usize],
                                &r[REG_ER as usize],
                                self.entries.as_deref(),
                            )
                        }
                        SRC_STACK => {
                            let hr = self.slot(arg)?;
                            let saved = self.stack.get(hr..hr + 4).ok_or(VmError::StackUnderflow)?;
                            let entries = self
                                .saved_entries
                                .iter()
                                .rev()
                                .find(|(at, _)| *at == hr)
                                .and_then(|(_, entries)| entries.as_deref());
                            loop_info(key, &saved[0], &saved[2], &saved[3], entries)
                        }
                        src => return Err(VmError::BadOperand { src, arg }),
                    };
                    self.push(v)?;
                }
                OP_OUTPUT => match inst.src() {
                    SRC_STR => {
                        let text = program.text.get(arg).ok_or(VmError::BadOperand { src: SRC_STR, arg })?;
                        out.push_str(text);
                    }
                    _ => match self.pop()? {
                        Value::String(s) => out.push_str(&s),
                        other => out.push_str(&other.to_string()),
                    },
                },
                OP_ADD => self.binary(Value::add)?,
                OP_SUB => self.binary(Value::sub)?,
                OP_MUL => self.binary(Value::mul)?,
                OP_DIV => self.binary(Value::div)?,
                OP_IDIV => self.binary(Value::int_div)?,
                OP_MOD => self.binary(Value::int_mod)?,
                OP_NEG => {
                    let v = self.pop()?;
                    self.push(v.neg()?)?;
                }
                OP_NOT => {
                    let v = self.pop()?;
                    self.push(v.not())?;
                }
                OP_CMP | OP_SCMP => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.flags = if inst.op() == OP_CMP { a.compare_numeric(&b) } else { a.compare_text(&b) };
                }
                OP_EXIST => {
                    self.flags = if self.top()?.is_truthy() { Ordering::Equal } else { Ordering::Less };
                }
                OP_JMP => next = arg as usize,
                OP_JXX => {
                    let take = cond_holds(inst.cond(), self.flags).ok_or(VmError::BadOperand { src: inst.cond(), arg })?;
                    if take {
                        next = arg as usize;
                    }
                }
                OP_RJMP => next = self.relative(arg)?,
                OP_RJXX => {
                    let take = cond_holds(inst.cond(), self.flags).ok_or(VmError::BadOperand { src: inst.cond(), arg })?;
                    if take {
                        next = self.relative(arg)?;
                    }
                }
                OP_CALL => {
                    let block = program.blocks.get(arg as usize).ok_or(VmError::BadBlock { id: arg })?;
                    let bp = self.stack.len().checked_sub(block.arity as usize).ok_or(VmError::StackUnderflow)?;
                    next = self.enter(block.entry, bp, next)?;
                }
                OP_CALLIND => {
                    let name = &self.stack[self.slot(arg)?];
                    let Value::String(name) = name else {
                        return Err(VmError::BlockName { kind: name.kind() });
                    };
                    let (_, block) = program
                        .block(name)
                        .ok_or_else(|| VmError::UnknownBlock { name: name.clone() })?;
                    if block.arity != arg {
                        return Err(VmError::Arity { name: block.name.clone(), expected: block.arity, got: arg });
                    }
                    let bp = self.stack.len() - arg as usize;
                    next = self.enter(block.entry, bp, next)?;
                }
                OP_RET => {
                    let frame = self.frames.pop().ok_or(VmError::ReturnWithoutCall)?;
                    let expected = frame.bp + arg as usize;
                    if self.stack.len() != expected {
                        return Err(VmError::BadReturn {
                            expected: arg as usize,
                            got: self.stack.len().saturating_sub(frame.bp),
                        });
                    }
                    next = frame.return_ip;
                }
                OP_SYSCALL => {
                    let id = (arg >> 16) as usize;
                    let argc = (arg & 0xFFFF) as usize;
                    let f = *self.syscalls.get(id).ok_or(VmError::BadOperand { src: inst.src(), arg })?;
                    let base = self.stack.len().checked_sub(argc).ok_or(VmError::StackUnderflow)?;
                    let args = self.stack.split_off(base);
                    let mut ret = Value::Undefined;
                    f.call(&args, &mut ret, cx)
                        .map_err(|source| VmError::Syscall { name: f.name().to_string(), source })?;
                    self.push(ret)?;
                }
                op => return Err(VmError::UnknownOpcode { op }),
            }
            self.ip = next;
        }
    }
}
