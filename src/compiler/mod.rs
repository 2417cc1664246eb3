pub mod symbols;

use std::collections::HashMap;

use crate::bytecode::*;
use crate::source::SourceMap;
use symbols::SymbolTable;

/// Jump argument for a target that is not known yet.
pub(crate) const PLACEHOLDER: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    IntDiv,
    Mod,
}

impl BinaryOp {
    fn opcode(self) -> u8 {
        match self {
            BinaryOp::Add => OP_ADD,
            BinaryOp::Sub => OP_SUB,
            BinaryOp::Mul => OP_MUL,
            BinaryOp::Div => OP_DIV,
            BinaryOp::IntDiv => OP_IDIV,
            BinaryOp::Mod => OP_MOD,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

impl Relation {
    fn cond(self) -> u8 {
        match self {
            Relation::Eq => COND_EQ,
            Relation::Ne => COND_NE,
            Relation::Gt => COND_GT,
            Relation::Lt => COND_LT,
            Relation::Ge => COND_GE,
            Relation::Le => COND_LE,
        }
    }
}

/// Addresses of an open foreach, closed by `end_foreach`.
#[derive(Debug)]
pub struct LoopLabels {
    empty_check: usize,
    body: usize,
}

/// An open block definition, closed by `end_block`.
#[derive(Debug)]
pub struct BlockStart {
    skip: usize,
    arity: u32,
    outer_depth: usize,
}

/// A foreach iterator as seen from the current compile position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterRef {
    scope: usize,
}

// ── Compiler ────────────────────────────────────────────────────────

/// Bytecode emitter. Tracks the operand-stack depth every primitive leaves
/// behind so that stack slots of enclosing loops can be addressed relative
/// to the top.
#[derive(Debug, Default)]
pub struct Compiler {
    program: Program,
    depth: usize,
    symbols: SymbolTable,
    calls: Vec<usize>,
    block_args: Option<HashMap<String, u32>>,
    syscall_ids: HashMap<String, u32>,
    debug: DebugToken,
}

impl Compiler {
    pub fn new() -> Self {
        Compiler::default()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn scope(&self) -> usize {
        self.symbols.scope()
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    /// Address of the next instruction.
    pub fn here(&self) -> usize {
        self.program.code.len()
    }

    /// Register a source text for debug positions. `None` once the 16-bit
    /// source id space is exhausted.
    pub fn add_source(&mut self, name: &str, map: SourceMap) -> Option<u16> {
        let id = u16::try_from(self.program.sources.len()).ok()?;
        self.program.sources.push(SourceInfo { name: name.to_string(), map });
        Some(id)
    }

    /// Attach subsequent instructions to `offset` in source `source`.
    pub fn at(&mut self, source: u16, offset: usize) {
        self.debug = DebugToken::new(source, offset);
    }

    /// Terminate the program. The stack must be balanced and every scope
    /// closed.
    pub fn finish(mut self) -> Program {
        assert_eq!(self.depth, 0, "unbalanced operand stack at end of program");
        assert_eq!(self.symbols.scope(), 0, "unclosed foreach scope");
        assert!(self.calls.is_empty(), "unfinished call");
        self.emit(OP_HLT, SRC_NONE, 0, 0, 0);
        tracing::debug!(
            instructions = self.program.code.len(),
            strings = self.program.text.strings.len(),
            blocks = self.program.blocks.len(),
            "program compiled"
        );
        self.program
    }

    fn emit(&mut self, op: u8, src: u8, dst: u8, cond: u8, argument: u32) -> usize {
        let idx = self.program.code.len();
        self.program.code.push(Instruction::new(op, src, dst, cond, argument, self.debug));
        idx
    }

    fn grow(&mut self, n: usize) {
        self.depth += n;
    }

    fn shrink(&mut self, n: usize) {
        assert!(self.depth >= n, "operand stack underflow at compile time ({} - {n})", self.depth);
        self.depth -= n;
    }

    // ── Pushes (+1) ─────────────────────────────────────────────────

    pub fn push_int(&mut self, value: i64) -> usize {
        let id = self.program.data.add_int(value);
        self.grow(1);
        self.emit(OP_PUSH, SRC_INT, 0, 0, id)
    }

    pub fn push_float(&mut self, value: f64) -> usize {
        let id = self.program.data.add_float(value);
        self.grow(1);
        self.emit(OP_PUSH, SRC_FLOAT, 0, 0, id)
    }

    pub fn push_string(&mut self, value: &str) -> usize {
        let id = self.program.text.add(value);
        self.grow(1);
        self.emit(OP_PUSH, SRC_STR, 0, 0, id)
    }

    pub fn push_undef(&mut self) -> usize {
        self.grow(1);
        self.emit(OP_PUSH, SRC_NONE, 0, 0, 0)
    }

    /// Member of the current loop element, falling back to the root data.
    pub fn push_variable(&mut self, name: &str) -> usize {
        let id = self.program.text.add(name);
        self.grow(1);
        self.emit(OP_LOOKUP, SRC_NONE, 0, 0, id)
    }

    pub fn push_register(&mut self, reg: u8) -> usize {
        self.grow(1);
        self.emit(OP_PUSH, SRC_REG, 0, 0, reg as u32)
    }

    /// Copy of the slot `offset` positions below the top.
    pub fn push_stack(&mut self, offset: usize) -> usize {
        self.grow(1);
        self.emit(OP_PUSH, SRC_STACK, 0, 0, offset as u32)
    }

    pub fn push_block_arg(&mut self, index: u32) -> usize {
        self.grow(1);
        self.emit(OP_PUSH, SRC_ARG, 0, 0, index)
    }

    /// Current element of a visible iterator.
    pub fn push_iterator(&mut self, iter: IterRef) -> usize {
        match self.saved_registers(iter) {
            None => self.push_register(REG_HR),
            Some(offset) => self.push_stack(offset),
        }
    }

    pub fn push_loop_info(&mut self, key: LoopKey, iter: IterRef) -> usize {
        let (src, offset) = match self.saved_registers(iter) {
            None => (SRC_REG, 0),
            Some(offset) => (SRC_STACK, offset as u32),
        };
        self.grow(1);
        self.emit(OP_LOOPINFO, src, key as u8, 0, offset)
    }

    /// Offset from the top of the saved HR that holds the element of
    /// `iter`, or `None` if `iter` belongs to the innermost loop.
    fn saved_registers(&self, iter: IterRef) -> Option<usize> {
        if iter.scope == self.symbols.scope() {
            return None;
        }
        let saved = self.symbols.saved_depth(iter.scope + 1);
        let hr = match saved {
            Some(depth) if depth >= 4 => depth - 4,
            _ => panic!("iterator scope {} has no saved registers", iter.scope),
        };
        assert!(self.depth > hr, "saved registers above the stack top");
        Some(self.depth - 1 - hr)
    }

    /// Undo the push just emitted. Used when a literal condition is folded.
    pub fn remove_last_push(&mut self) {
        let last = self.program.code.pop();
        assert!(matches!(last, Some(inst) if inst.op() == OP_PUSH), "last instruction is not a push");
        self.shrink(1);
    }

    // ── Stack shaping ───────────────────────────────────────────────

    /// key = pop, container = pop, push container[key]
    pub fn index(&mut self) -> usize {
        self.shrink(1);
        self.emit(OP_INDEX, SRC_NONE, 0, 0, 0)
    }

    pub fn pop(&mut self, n: usize) -> Option<usize> {
        if n == 0 {
            return None;
        }
        self.shrink(n);
        Some(self.emit(OP_POP, SRC_NONE, REG_NONE, 0, n as u32))
    }

    pub fn pop_to(&mut self, reg: u8) -> usize {
        self.shrink(1);
        self.emit(OP_POP, SRC_NONE, reg, 0, 1)
    }

    pub fn output(&mut self) -> usize {
        self.shrink(1);
        self.emit(OP_OUTPUT, SRC_STACK, 0, 0, 0)
    }

    /// Static template text; each run gets its own table entry.
    pub fn output_text(&mut self, text: &str) -> Option<usize> {
        if text.is_empty() {
            return None;
        }
        let id = self.program.text.add_raw(text);
        Some(self.emit(OP_OUTPUT, SRC_STR, 0, 0, id))
    }

    // ── Operators ───────────────────────────────────────────────────

    pub fn binary(&mut self, op: BinaryOp) -> usize {
        self.shrink(1);
        self.emit(op.opcode(), SRC_NONE, 0, 0, 0)
    }

    pub fn neg(&mut self) -> usize {
        self.emit(OP_NEG, SRC_NONE, 0, 0, 0)
    }

    pub fn not(&mut self) -> usize {
        self.emit(OP_NOT, SRC_NONE, 0, 0, 0)
    }

    /// Replace the two topmost values by 1 or 0.
    pub fn relation(&mut self, rel: Relation, text: bool) -> usize {
        let op = if text { OP_SCMP } else { OP_CMP };
        self.shrink(2);
        let at = self.emit(op, SRC_NONE, 0, 0, 0);
        self.rel_cond_jump(rel.cond(), 3);
        self.select_tail(0);
        at
    }

    /// `PUSH first; RJMP +2; PUSH !first`, one value at run time either
    /// way. Returns the address of the second push.
    pub fn select_tail(&mut self, first: i64) -> usize {
        let second = i64::from(first == 0);
        self.push_int(first);
        self.rel_jump(2);
        let at = self.push_int(second);
        self.shrink(1);
        at
    }

    /// Flags from the truthiness of the top value, which stays in place.
    pub fn exist(&mut self) -> usize {
        assert!(self.depth > 0, "exist on empty stack");
        self.emit(OP_EXIST, SRC_NONE, 0, 0, 0)
    }

    pub fn syscall(&mut self, name: &str, argc: usize) -> usize {
        assert!(argc <= SYSCALL_MAX_ARGS, "too many syscall arguments");
        let next = self.syscall_ids.len() as u32;
        let id = *self.syscall_ids.entry(name.to_string()).or_insert(next);
        if id == next {
            self.program.syscalls.push(name.to_string());
        }
        self.shrink(argc);
        self.grow(1);
        self.emit(OP_SYSCALL, SRC_NONE, 0, 0, (id << 16) | argc as u32)
    }

    // ── Jumps ───────────────────────────────────────────────────────

    pub fn jump(&mut self, target: u32) -> usize {
        self.emit(OP_JMP, SRC_NONE, 0, 0, target)
    }

    pub fn cond_jump(&mut self, cond: u8, target: u32) -> usize {
        self.emit(OP_JXX, SRC_NONE, 0, cond, target)
    }

    pub fn rel_jump(&mut self, offset: i32) -> usize {
        self.emit(OP_RJMP, SRC_NONE, 0, 0, offset as u32)
    }

    pub fn rel_cond_jump(&mut self, cond: u8, offset: i32) -> usize {
        self.emit(OP_RJXX, SRC_NONE, 0, cond, offset as u32)
    }

    /// Point the jump at `at` to `target`.
    pub fn patch(&mut self, at: usize, target: usize) {
        let Some(inst) = self.program.code.get_mut(at) else {
            panic!("patch of instruction {at} past end of code");
        };
        assert!(
            matches!(inst.op(), OP_JMP | OP_JXX | OP_LOOP),
            "patch of non-jump instruction {at}"
        );
        inst.argument = target as u32;
    }

    // ── Foreach ─────────────────────────────────────────────────────

    /// The collection must be on top of the stack. Opens a scope in which
    /// `iterator` names the current element.
    pub fn begin_foreach(&mut self, iterator: &str) -> LoopLabels {
        self.pop_to(REG_AR);
        self.emit(OP_SAVE, SRC_NONE, 0, 0, 0);
        self.grow(4);
        self.emit(OP_MOV, SRC_REG, REG_GR, 0, REG_AR as u32);
        self.emit(OP_SIZE, SRC_NONE, 0, 0, 0);
        let empty_check = self.cond_jump(COND_EQ, PLACEHOLDER);
        self.emit(OP_MOV, SRC_INT, REG_ER, 0, 0);
        let body = self.emit(OP_ITER, SRC_NONE, 0, 0, 0);
        self.symbols.open_scope(self.depth);
        self.symbols.define(iterator);
        LoopLabels { empty_check, body }
    }

    /// Close the innermost foreach. Returns the loop exit, the target for
    /// every `break` of this loop.
    pub fn end_foreach(&mut self, labels: LoopLabels) -> usize {
        assert_eq!(self.symbols.saved_depth(self.symbols.scope()), Some(self.depth), "unbalanced foreach body");
        self.emit(OP_LOOP, SRC_NONE, 0, 0, labels.body as u32);
        let exit = self.here();
        self.patch(labels.empty_check, exit);
        self.emit(OP_RESTORE, SRC_NONE, 0, 0, 0);
        self.shrink(4);
        self.symbols.close_scope();
        exit
    }

    pub fn iterator(&self, name: &str) -> Option<IterRef> {
        self.symbols.lookup(name).map(|s| IterRef { scope: s.scope })
    }

    /// The innermost loop, for bare loop-information keys.
    pub fn current_loop(&self) -> Option<IterRef> {
        let scope = self.symbols.scope();
        (scope > 0).then_some(IterRef { scope })
    }

    // ── Blocks ──────────────────────────────────────────────────────

    pub fn in_block(&self) -> bool {
        self.block_args.is_some()
    }

    pub fn block(&self, name: &str) -> Option<(u32, u32)> {
        self.program.block(name).map(|(id, b)| (id, b.arity))
    }

    pub fn block_arg(&self, name: &str) -> Option<u32> {
        self.block_args.as_ref().and_then(|args| args.get(name).copied())
    }

    /// Register block `name` and start its body. The name must be new and
    /// the argument names distinct.
    pub fn begin_block(&mut self, name: &str, args: &[String]) -> BlockStart {
        assert!(self.block_args.is_none(), "nested block definition");
        assert!(self.block(name).is_none(), "block '{name}' already defined");
        let skip = self.jump(PLACEHOLDER);
        let arity = args.len() as u32;
        self.program.blocks.push(BlockInfo { name: name.to_string(), entry: self.here() as u32, arity });
        let map: HashMap<String, u32> = args.iter().enumerate().map(|(i, a)| (a.clone(), i as u32)).collect();
        assert_eq!(map.len(), args.len(), "duplicate block argument");
        self.block_args = Some(map);
        let outer_depth = std::mem::replace(&mut self.depth, 0);
        BlockStart { skip, arity, outer_depth }
    }

    pub fn end_block(&mut self, start: BlockStart) {
        assert_eq!(self.depth, 0, "unbalanced block body");
        self.emit(OP_RET, SRC_NONE, 0, 0, start.arity);
        let after = self.here();
        self.patch(start.skip, after);
        self.depth = start.outer_depth;
        self.block_args = None;
    }

    // ── Calls ───────────────────────────────────────────────────────

    /// Mark the stack depth before the arguments of a call are pushed.
    pub fn begin_call(&mut self) {
        self.calls.push(self.depth);
    }

    fn pending_args(&mut self) -> usize {
        let Some(base) = self.calls.pop() else {
            panic!("call finished without begin_call");
        };
        assert!(self.depth >= base, "call arguments below call base");
        self.depth - base
    }

    /// Call block `id` with the arguments pushed since `begin_call`, then
    /// drop them. Returns the argument count.
    pub fn call_block(&mut self, id: u32) -> usize {
        let argc = self.pending_args();
        self.emit(OP_CALL, SRC_NONE, 0, 0, id);
        self.pop(argc);
        argc
    }

    /// Call the block whose name sits just below the arguments; the name is
    /// dropped with them.
    pub fn call_indirect(&mut self) -> usize {
        let argc = self.pending_args();
        self.emit(OP_CALLIND, SRC_NONE, 0, 0, argc as u32);
        self.pop(argc + 1);
        argc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ops(c: &Compiler) -> Vec<u8> {
        c.program().code.iter().map(|i| i.op()).collect()
    }

    #[test]
    fn pushes_track_depth() {
        let mut c = Compiler::new();
        c.push_int(5);
        c.push_float(1.5);
        c.push_string("x");
        c.push_undef();
        c.push_variable("name");
        assert_eq!(c.depth(), 5);
        c.pop(5);
        assert_eq!(c.depth(), 0);
    }

    #[test]
    fn relation_nets_minus_one() {
        let mut c = Compiler::new();
        c.push_int(1);
        c.push_int(2);
        c.relation(Relation::Lt, false);
        assert_eq!(c.depth(), 1);
        assert_eq!(ops(&c), vec![OP_PUSH, OP_PUSH, OP_CMP, OP_RJXX, OP_PUSH, OP_RJMP, OP_PUSH]);
        let rjxx = c.program().code[3];
        assert_eq!(rjxx.cond(), COND_LT);
        assert_eq!(rjxx.argument as i32, 3);
    }

    #[test]
    fn syscall_depth_and_ids() {
        let mut c = Compiler::new();
        c.push_int(1);
        c.push_int(2);
        c.syscall("max", 2);
        assert_eq!(c.depth(), 1);
        c.syscall("size", 1);
        c.syscall("max", 0);
        assert_eq!(c.depth(), 2);
        let program = c.program();
        assert_eq!(program.syscalls, vec!["max".to_string(), "size".to_string()]);
        assert_eq!(program.code[4].argument, 0);
    }

    #[test]
    fn foreach_layout_and_balance() {
        let mut c = Compiler::new();
        c.push_variable("rows");
        let labels = c.begin_foreach("row");
        assert_eq!(c.depth(), 4);
        assert_eq!(c.scope(), 1);
        assert!(c.iterator("row").is_some());
        c.push_iterator(c.iterator("row").unwrap());
        c.output();
        let exit = c.end_foreach(labels);
        assert_eq!(c.depth(), 0);
        assert_eq!(c.scope(), 0);
        assert!(c.iterator("row").is_none());
        assert_eq!(
            ops(&c),
            vec![OP_LOOKUP, OP_POP, OP_SAVE, OP_MOV, OP_SIZE, OP_JXX, OP_MOV, OP_ITER, OP_PUSH, OP_OUTPUT, OP_LOOP, OP_RESTORE]
        );
        assert_eq!(exit, 11);
        assert_eq!(c.program().code[5].argument, 11);
        assert_eq!(c.program().code[10].argument, 7);
    }

    #[test]
    fn outer_iterator_reads_saved_register() {
        let mut c = Compiler::new();
        c.push_variable("rows");
        let outer = c.begin_foreach("row");
        c.push_variable("cols");
        let inner = c.begin_foreach("col");
        assert_eq!(c.depth(), 8);
        let row = c.iterator("row").unwrap();
        // saved HR of the outer loop sits at absolute slot 4
        c.push_iterator(row);
        assert_eq!(c.program().code.last().unwrap().argument, 3);
        assert_eq!(c.program().code.last().unwrap().src(), SRC_STACK);
        c.push_loop_info(LoopKey::Counter, row);
        assert_eq!(c.program().code.last().unwrap().argument, 4);
        c.pop(2);
        c.push_iterator(c.iterator("col").unwrap());
        assert_eq!(c.program().code.last().unwrap().src(), SRC_REG);
        c.pop(1);
        c.end_foreach(inner);
        c.end_foreach(outer);
        assert_eq!(c.depth(), 0);
    }

    #[test]
    fn block_resets_and_restores_depth() {
        let mut c = Compiler::new();
        c.push_variable("rows");
        let start = c.begin_block("greet", &["name".to_string()]);
        assert!(c.in_block());
        assert_eq!(c.depth(), 0);
        assert_eq!(c.block_arg("name"), Some(0));
        c.push_block_arg(0);
        c.output();
        c.end_block(start);
        assert!(!c.in_block());
        assert_eq!(c.depth(), 1);
        assert_eq!(c.block("greet"), Some((0, 1)));
        let program = c.program();
        assert_eq!(program.blocks[0].entry, 2);
        assert_eq!(program.code[1].op(), OP_JMP);
        assert_eq!(program.code[1].argument as usize, program.code.len());
    }

    #[test]
    fn calls_drop_arguments() {
        let mut c = Compiler::new();
        c.begin_call();
        c.push_int(1);
        c.push_int(2);
        assert_eq!(c.call_block(0), 2);
        assert_eq!(c.depth(), 0);

        c.push_variable("which");
        c.begin_call();
        c.push_string("a");
        assert_eq!(c.call_indirect(), 1);
        assert_eq!(c.depth(), 0);
        let last = c.program().code.last().unwrap();
        assert_eq!((last.op(), last.argument), (OP_POP, 2));
    }

    #[test]
    fn remove_last_push_undoes_literal() {
        let mut c = Compiler::new();
        c.push_int(7);
        c.remove_last_push();
        assert_eq!(c.depth(), 0);
        assert!(c.program().code.is_empty());
    }

    #[test]
    fn finish_appends_halt() {
        let mut c = Compiler::new();
        c.output_text("hi");
        assert!(c.output_text("").is_none());
        let program = c.finish();
        assert_eq!(program.code.len(), 2);
        assert_eq!(program.code[1].op(), OP_HLT);
    }

    #[test]
    #[should_panic(expected = "unbalanced operand stack")]
    fn finish_rejects_unbalanced_stack() {
        let mut c = Compiler::new();
        c.push_int(1);
        c.finish();
    }
}
