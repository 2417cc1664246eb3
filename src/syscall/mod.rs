use std::collections::BTreeMap;

use crate::value::Value;

/// Sink for warnings raised by functions during a render.
pub trait Logger: Send + Sync {
    fn warn(&self, function: &str, message: &str);
}

/// Routes function warnings to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn warn(&self, function: &str, message: &str) {
        tracing::warn!(function, "{message}");
    }
}

pub(crate) static TRACING_LOGGER: TracingLogger = TracingLogger;

/// What a function can see besides its arguments.
pub struct CallContext<'a> {
    pub root: &'a Value,
    pub logger: &'a dyn Logger,
}

#[derive(Debug, thiserror::Error)]
pub enum SyscallError {
    #[error("expected {expected} arguments, got {got}")]
    Arity { expected: &'static str, got: usize },
    #[error("{0}")]
    Invalid(String),
}

/// A function callable from templates as `name(args...)`.
pub trait Syscall: Send + Sync {
    fn name(&self) -> &str;

    /// `args` are in call order; the result goes into `ret`, which starts
    /// out Undefined.
    fn call(&self, args: &[Value], ret: &mut Value, cx: &CallContext<'_>) -> Result<(), SyscallError>;
}

type SyscallFn = dyn Fn(&[Value], &mut Value, &CallContext<'_>) -> Result<(), SyscallError> + Send + Sync;

struct FnSyscall {
    name: String,
    func: Box<SyscallFn>,
}

impl Syscall for FnSyscall {
    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, args: &[Value], ret: &mut Value, cx: &CallContext<'_>) -> Result<(), SyscallError> {
        (self.func)(args, ret, cx)
    }
}

/// Functions available to templates, by name.
#[derive(Default)]
pub struct SyscallTable {
    entries: BTreeMap<String, Box<dyn Syscall>>,
}

impl std::fmt::Debug for SyscallTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.entries.keys()).finish()
    }
}

impl SyscallTable {
    pub fn new() -> Self {
        SyscallTable::default()
    }

    pub fn with_builtins() -> Self {
        let mut table = SyscallTable::new();
        for builtin in crate::builtins::all() {
            table.register(builtin);
        }
        table
    }

    /// Add `syscall`, replacing any function of the same name.
    pub fn register(&mut self, syscall: impl Syscall + 'static) -> &mut Self {
        self.entries.insert(syscall.name().to_string(), Box::new(syscall));
        self
    }

    pub fn register_fn<F>(&mut self, name: &str, func: F) -> &mut Self
    where
        F: Fn(&[Value], &mut Value, &CallContext<'_>) -> Result<(), SyscallError> + Send + Sync + 'static,
    {
        self.register(FnSyscall { name: name.to_string(), func: Box::new(func) })
    }

    pub fn get(&self, name: &str) -> Option<&dyn Syscall> {
        self.entries.get(name).map(|s| s.as_ref())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}
