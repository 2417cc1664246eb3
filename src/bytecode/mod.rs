use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::source::SourceMap;

// ── Opcodes ─────────────────────────────────────────────────────────
//
// Instruction word: [OP:8 | SRC:8 | DST:8 | COND:8], plus a 32-bit argument.

pub(crate) const OP_HLT: u8 = 0;
pub(crate) const OP_PUSH: u8 = 1; // push operand (SRC, argument)
pub(crate) const OP_POP: u8 = 2; // drop `argument` values, or pop one into register DST
pub(crate) const OP_LOOKUP: u8 = 3; // push local/root member named text[argument]
pub(crate) const OP_INDEX: u8 = 4; // key = pop, container = pop, push container[key]
pub(crate) const OP_MOV: u8 = 5; // register DST <- operand (SRC, argument)
pub(crate) const OP_SAVE: u8 = 6; // push HR GR FR ER
pub(crate) const OP_RESTORE: u8 = 7; // pop ER FR GR HR
pub(crate) const OP_SIZE: u8 = 8; // FR <- |GR|, flags <- FR cmp 0
pub(crate) const OP_ITER: u8 = 9; // HR <- GR[ER]
pub(crate) const OP_LOOP: u8 = 10; // ER += 1; ER < FR -> argument
pub(crate) const OP_LOOPINFO: u8 = 11; // push loop key DST of current (SRC_REG) or saved (SRC_STACK) loop
pub(crate) const OP_OUTPUT: u8 = 12; // append pop (SRC_STACK) or text[argument] (SRC_STR)
pub(crate) const OP_ADD: u8 = 13;
pub(crate) const OP_SUB: u8 = 14;
pub(crate) const OP_MUL: u8 = 15;
pub(crate) const OP_DIV: u8 = 16;
pub(crate) const OP_IDIV: u8 = 17;
pub(crate) const OP_MOD: u8 = 18;
pub(crate) const OP_NEG: u8 = 19;
pub(crate) const OP_NOT: u8 = 20;
pub(crate) const OP_CMP: u8 = 21; // b = pop, a = pop, flags <- numeric a cmp b
pub(crate) const OP_SCMP: u8 = 22; // same, comparing text
pub(crate) const OP_EXIST: u8 = 23; // flags <- truthiness of top (not popped)
pub(crate) const OP_JMP: u8 = 24;
pub(crate) const OP_JXX: u8 = 25;
pub(crate) const OP_RJMP: u8 = 26; // relative: ip += argument as i32
pub(crate) const OP_RJXX: u8 = 27;
pub(crate) const OP_CALL: u8 = 28; // call blocks[argument]
pub(crate) const OP_CALLIND: u8 = 29; // call block named by stack[top - argument], argument = argc
pub(crate) const OP_RET: u8 = 30;
pub(crate) const OP_SYSCALL: u8 = 31; // argument = id << 16 | argc

// Operand sources
pub(crate) const SRC_NONE: u8 = 0;
pub(crate) const SRC_INT: u8 = 1;
pub(crate) const SRC_FLOAT: u8 = 2;
pub(crate) const SRC_STR: u8 = 3;
pub(crate) const SRC_STACK: u8 = 4;
pub(crate) const SRC_ARG: u8 = 5;
pub(crate) const SRC_REG: u8 = 6;

// Registers
pub(crate) const REG_AR: u8 = 0;
pub(crate) const REG_ER: u8 = 4;
pub(crate) const REG_FR: u8 = 5;
pub(crate) const REG_GR: u8 = 6;
pub(crate) const REG_HR: u8 = 7;
pub(crate) const REG_COUNT: usize = 8;
pub(crate) const REG_NONE: u8 = 0xFF;

const REG_NAMES: [&str; REG_COUNT] = ["AR", "BR", "CR", "DR", "ER", "FR", "GR", "HR"];

// Jump conditions, tested against the comparison flags
pub(crate) const COND_EQ: u8 = 1;
pub(crate) const COND_NE: u8 = 2;
pub(crate) const COND_GT: u8 = 3;
pub(crate) const COND_LT: u8 = 4;
pub(crate) const COND_GE: u8 = 5;
pub(crate) const COND_LE: u8 = 6;

pub(crate) const SYSCALL_MAX_ARGS: usize = 0xFFFF;

/// Reserved loop-information keys readable inside a foreach body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoopKey {
    Key = 0,
    Index = 1,
    Counter = 2,
    First = 3,
    Last = 4,
    Inner = 5,
    Odd = 6,
    Even = 7,
    Size = 8,
    Value = 9,
}

impl LoopKey {
    const ALL: [LoopKey; 10] = [
        LoopKey::Key,
        LoopKey::Index,
        LoopKey::Counter,
        LoopKey::First,
        LoopKey::Last,
        LoopKey::Inner,
        LoopKey::Odd,
        LoopKey::Even,
        LoopKey::Size,
        LoopKey::Value,
    ];

    pub fn name(self) -> &'static str {
        match self {
            LoopKey::Key => "__key__",
            LoopKey::Index => "__index__",
            LoopKey::Counter => "__counter__",
            LoopKey::First => "__first__",
            LoopKey::Last => "__last__",
            LoopKey::Inner => "__inner__",
            LoopKey::Odd => "__odd__",
            LoopKey::Even => "__even__",
            LoopKey::Size => "__size__",
            LoopKey::Value => "__value__",
        }
    }

    pub fn from_name(name: &str) -> Option<LoopKey> {
        LoopKey::ALL.iter().copied().find(|k| k.name() == name)
    }

    pub(crate) fn from_u8(b: u8) -> Option<LoopKey> {
        LoopKey::ALL.get(b as usize).copied()
    }
}

/// `__name__`: reserved for loop bookkeeping.
pub fn is_reserved_key(name: &str) -> bool {
    name.len() > 4 && name.starts_with("__") && name.ends_with("__")
}

// ── Instruction encoding ────────────────────────────────────────────

#[inline(always)]
pub(crate) fn encode(op: u8, src: u8, dst: u8, cond: u8) -> u32 {
    (op as u32) << 24 | (src as u32) << 16 | (dst as u32) << 8 | cond as u32
}

/// Source id (16 bits) and byte offset (48 bits) of the template text that
/// produced an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DebugToken(pub u64);

impl DebugToken {
    const OFFSET_MASK: u64 = (1 << 48) - 1;

    pub fn new(source: u16, offset: usize) -> Self {
        DebugToken(((source as u64) << 48) | (offset as u64 & Self::OFFSET_MASK))
    }

    pub fn source(self) -> u16 {
        (self.0 >> 48) as u16
    }

    pub fn offset(self) -> usize {
        (self.0 & Self::OFFSET_MASK) as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub code: u32,
    pub argument: u32,
    pub debug: DebugToken,
}

impl Instruction {
    pub(crate) fn new(op: u8, src: u8, dst: u8, cond: u8, argument: u32, debug: DebugToken) -> Self {
        Instruction { code: encode(op, src, dst, cond), argument, debug }
    }

    #[inline(always)]
    pub fn op(&self) -> u8 {
        (self.code >> 24) as u8
    }

    #[inline(always)]
    pub fn src(&self) -> u8 {
        (self.code >> 16) as u8
    }

    #[inline(always)]
    pub fn dst(&self) -> u8 {
        (self.code >> 8) as u8
    }

    #[inline(always)]
    pub fn cond(&self) -> u8 {
        self.code as u8
    }
}

// ── Literal tables ──────────────────────────────────────────────────

/// Numeric literals. Int ids 0 and 1 always hold 0 and 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticData {
    pub ints: Vec<i64>,
    pub floats: Vec<f64>,
}

impl Default for StaticData {
    fn default() -> Self {
        StaticData { ints: vec![0, 1], floats: Vec::new() }
    }
}

impl StaticData {
    pub fn add_int(&mut self, value: i64) -> u32 {
        match value {
            0 => 0,
            1 => 1,
            _ => {
                let idx = self.ints.len() as u32;
                self.ints.push(value);
                idx
            }
        }
    }

    pub fn add_float(&mut self, value: f64) -> u32 {
        let idx = self.floats.len() as u32;
        self.floats.push(value);
        idx
    }
}

/// String literals, names and template text.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticText {
    pub strings: Vec<String>,
    #[serde(skip)]
    index: HashMap<String, u32>,
}

impl PartialEq for StaticText {
    fn eq(&self, other: &Self) -> bool {
        self.strings == other.strings
    }
}

impl StaticText {
    pub(crate) fn from_strings(strings: Vec<String>) -> Self {
        StaticText { strings, index: HashMap::new() }
    }

    /// Intern `s`, reusing an id handed out by an earlier `add`.
    pub fn add(&mut self, s: &str) -> u32 {
        if let Some(&idx) = self.index.get(s) {
            return idx;
        }
        let idx = self.add_raw(s);
        self.index.insert(s.to_string(), idx);
        idx
    }

    pub fn add_raw(&mut self, s: &str) -> u32 {
        let idx = self.strings.len() as u32;
        self.strings.push(s.to_string());
        idx
    }

    pub fn get(&self, idx: u32) -> Option<&str> {
        self.strings.get(idx as usize).map(String::as_str)
    }
}

// ── Program ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub name: String,
    pub entry: u32,
    pub arity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub name: String,
    pub map: SourceMap,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Position {
    pub file: String,
    pub offset: usize,
    pub line: usize,
    pub column: usize,
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// A compiled template. Immutable once built; share it freely between
/// threads and run each render on its own `Vm` state.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Program {
    pub code: Vec<Instruction>,
    pub data: StaticData,
    pub text: StaticText,
    pub syscalls: Vec<String>,
    pub blocks: Vec<BlockInfo>,
    pub sources: Vec<SourceInfo>,
}

impl Program {
    pub fn position(&self, debug: DebugToken) -> Option<Position> {
        let source = self.sources.get(debug.source() as usize)?;
        let offset = debug.offset();
        let (line, column) = source.map.lookup(offset);
        Some(Position { file: source.name.clone(), offset, line, column })
    }

    pub fn block(&self, name: &str) -> Option<(u32, &BlockInfo)> {
        self.blocks
            .iter()
            .enumerate()
            .find(|(_, b)| b.name == name)
            .map(|(i, b)| (i as u32, b))
    }

    /// Check every jump target and table reference.
    pub fn validate(&self) -> Result<(), DecodeError> {
        let len = self.code.len();
        let invalid = |ip: usize, reason: String| DecodeError::Invalid { ip, reason };
        for (ip, inst) in self.code.iter().enumerate() {
            let arg = inst.argument;
            match inst.op() {
                OP_PUSH | OP_MOV => match inst.src() {
                    SRC_INT if arg as usize >= self.data.ints.len() => {
                        return Err(invalid(ip, format!("int literal {arg} out of range")));
                    }
                    SRC_FLOAT if arg as usize >= self.data.floats.len() => {
                        return Err(invalid(ip, format!("float literal {arg} out of range")));
                    }
                    SRC_STR if arg as usize >= self.text.strings.len() => {
                        return Err(invalid(ip, format!("string literal {arg} out of range")));
                    }
                    SRC_REG if arg as usize >= REG_COUNT => {
                        return Err(invalid(ip, format!("register {arg} out of range")));
                    }
                    _ => {}
                },
                OP_LOOKUP if arg as usize >= self.text.strings.len() => {
                    return Err(invalid(ip, format!("name {arg} out of range")));
                }
                OP_OUTPUT if inst.src() == SRC_STR && arg as usize >= self.text.strings.len() => {
                    return Err(invalid(ip, format!("text {arg} out of range")));
                }
                OP_JMP | OP_JXX | OP_LOOP if arg as usize >= len => {
                    return Err(invalid(ip, format!("jump target {arg} out of range")));
                }
                OP_RJMP | OP_RJXX => {
                    let target = ip as i64 + arg as i32 as i64;
                    if target < 0 || target as usize >= len {
                        return Err(invalid(ip, format!("relative jump to {target} out of range")));
                    }
                }
                OP_CALL if arg as usize >= self.blocks.len() => {
                    return Err(invalid(ip, format!("block {arg} out of range")));
                }
                OP_SYSCALL if (arg >> 16) as usize >= self.syscalls.len() => {
                    return Err(invalid(ip, format!("syscall {} out of range", arg >> 16)));
                }
                op if op > OP_SYSCALL => return Err(invalid(ip, format!("unknown opcode {op}"))),
                _ => {}
            }
            if inst.debug.source() as usize >= self.sources.len() && !self.sources.is_empty() {
                return Err(invalid(ip, "debug token names an unknown source".to_string()));
            }
        }
        for block in &self.blocks {
            if block.entry as usize >= len {
                return Err(DecodeError::Invalid { ip: block.entry as usize, reason: format!("block '{}' entry out of range", block.name) });
            }
        }
        Ok(())
    }
}

// ── Binary layout ───────────────────────────────────────────────────

const MAGIC: &[u8; 6] = b"TMPLVM";
const FORMAT_VERSION: u16 = 1;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("not a compiled template (bad magic)")]
    BadMagic,
    #[error("unsupported format version {0}")]
    Version(u16),
    #[error("unexpected end of data while reading {what}")]
    Truncated { what: &'static str },
    #[error("invalid UTF-8 in {what}")]
    Utf8 { what: &'static str },
    #[error("invalid program at instruction {ip}: {reason}")]
    Invalid { ip: usize, reason: String },
}

impl Program {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::default();
        w.buf.extend_from_slice(MAGIC);
        w.u16(FORMAT_VERSION);

        w.u32(self.code.len() as u32);
        for inst in &self.code {
            w.u32(inst.code);
            w.u32(inst.argument);
            w.u64(inst.debug.0);
        }
        w.u32(self.data.ints.len() as u32);
        for &i in &self.data.ints {
            w.u64(i as u64);
        }
        w.u32(self.data.floats.len() as u32);
        for &f in &self.data.floats {
            w.u64(f.to_bits());
        }
        w.strings(&self.text.strings);
        w.strings(&self.syscalls);
        w.u32(self.blocks.len() as u32);
        for block in &self.blocks {
            w.string(&block.name);
            w.u32(block.entry);
            w.u32(block.arity);
        }
        w.u32(self.sources.len() as u32);
        for source in &self.sources {
            w.string(&source.name);
            let starts = source.map.line_starts();
            w.u32(starts.len() as u32);
            for &s in starts {
                w.u64(s as u64);
            }
        }
        w.buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Program, DecodeError> {
        let mut r = Reader { buf: bytes, pos: 0 };
        if r.take(MAGIC.len(), "magic")? != MAGIC {
            return Err(DecodeError::BadMagic);
        }
        let version = r.u16("version")?;
        if version != FORMAT_VERSION {
            return Err(DecodeError::Version(version));
        }

        let n = r.count("code")?;
        let mut code = Vec::with_capacity(n);
        for _ in 0..n {
            let c = r.u32("code")?;
            let argument = r.u32("code")?;
            let debug = DebugToken(r.u64("code")?);
            code.push(Instruction { code: c, argument, debug });
        }
        let n = r.count("ints")?;
        let ints = (0..n).map(|_| r.u64("ints").map(|v| v as i64)).collect::<Result<Vec<_>, _>>()?;
        let n = r.count("floats")?;
        let floats = (0..n).map(|_| r.u64("floats").map(f64::from_bits)).collect::<Result<Vec<_>, _>>()?;
        let strings = r.strings("strings")?;
        let syscalls = r.strings("syscall names")?;
        let n = r.count("blocks")?;
        let mut blocks = Vec::with_capacity(n);
        for _ in 0..n {
            let name = r.string("blocks")?;
            let entry = r.u32("blocks")?;
            let arity = r.u32("blocks")?;
            blocks.push(BlockInfo { name, entry, arity });
        }
        let n = r.count("sources")?;
        let mut sources = Vec::with_capacity(n);
        for _ in 0..n {
            let name = r.string("sources")?;
            let m = r.count("sources")?;
            let starts = (0..m).map(|_| r.u64("sources").map(|v| v as usize)).collect::<Result<Vec<_>, _>>()?;
            sources.push(SourceInfo { name, map: SourceMap::from_line_starts(starts) });
        }

        let program = Program {
            code,
            data: StaticData { ints, floats },
            text: StaticText::from_strings(strings),
            syscalls,
            blocks,
            sources,
        };
        program.validate()?;
        Ok(program)
    }
}

#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn string(&mut self, s: &str) {
        self.u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    fn strings(&mut self, items: &[String]) {
        self.u32(items.len() as u32);
        for s in items {
            self.string(s);
        }
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.buf.len()).ok_or(DecodeError::Truncated { what })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u16(&mut self, what: &'static str) -> Result<u16, DecodeError> {
        let b = self.take(2, what)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self, what: &'static str) -> Result<u32, DecodeError> {
        let b = self.take(4, what)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self, what: &'static str) -> Result<u64, DecodeError> {
        let b = self.take(8, what)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }

    /// Element count, bounded by the bytes left so a corrupt header cannot
    /// trigger a huge allocation.
    fn count(&mut self, what: &'static str) -> Result<usize, DecodeError> {
        let n = self.u32(what)? as usize;
        if n > self.buf.len() - self.pos {
            return Err(DecodeError::Truncated { what });
        }
        Ok(n)
    }

    fn string(&mut self, what: &'static str) -> Result<String, DecodeError> {
        let n = self.count(what)?;
        let bytes = self.take(n, what)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::Utf8 { what })
    }

    fn strings(&mut self, what: &'static str) -> Result<Vec<String>, DecodeError> {
        let n = self.count(what)?;
        (0..n).map(|_| self.string(what)).collect()
    }
}

// ── Disassembly ─────────────────────────────────────────────────────

fn op_name(op: u8) -> &'static str {
    match op {
        OP_HLT => "HLT",
        OP_PUSH => "PUSH",
        OP_POP => "POP",
        OP_LOOKUP => "LOOKUP",
        OP_INDEX => "INDEX",
        OP_MOV => "MOV",
        OP_SAVE => "SAVE",
        OP_RESTORE => "RESTORE",
        OP_SIZE => "SIZE",
        OP_ITER => "ITER",
        OP_LOOP => "LOOP",
        OP_LOOPINFO => "LOOPINFO",
        OP_OUTPUT => "OUTPUT",
        OP_ADD => "ADD",
        OP_SUB => "SUB",
        OP_MUL => "MUL",
        OP_DIV => "DIV",
        OP_IDIV => "IDIV",
        OP_MOD => "MOD",
        OP_NEG => "NEG",
        OP_NOT => "NOT",
        OP_CMP => "CMP",
        OP_SCMP => "SCMP",
        OP_EXIST => "EXIST",
        OP_JMP => "JMP",
        OP_JXX => "J",
        OP_RJMP => "RJMP",
        OP_RJXX => "RJ",
        OP_CALL => "CALL",
        OP_CALLIND => "CALLIND",
        OP_RET => "RET",
        OP_SYSCALL => "SYSCALL",
        _ => "???",
    }
}

fn cond_name(cond: u8) -> &'static str {
    match cond {
        COND_EQ => "EQ",
        COND_NE => "NE",
        COND_GT => "GT",
        COND_LT => "LT",
        COND_GE => "GE",
        COND_LE => "LE",
        _ => "??",
    }
}

fn reg_name(reg: u8) -> &'static str {
    REG_NAMES.get(reg as usize).copied().unwrap_or("R?")
}

impl Program {
    fn operand(&self, src: u8, arg: u32) -> String {
        match src {
            SRC_NONE => "undef".to_string(),
            SRC_INT => format!("#{}", self.data.ints.get(arg as usize).copied().unwrap_or_default()),
            SRC_FLOAT => format!("#{}", self.data.floats.get(arg as usize).copied().unwrap_or_default()),
            SRC_STR => format!("{:?}", self.text.get(arg).unwrap_or("")),
            SRC_STACK => format!("stack[-{arg}]"),
            SRC_ARG => format!("arg[{arg}]"),
            SRC_REG => reg_name(arg as u8).to_string(),
            _ => "?".to_string(),
        }
    }

    /// Human-readable listing, one instruction per line.
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        for (ip, inst) in self.code.iter().enumerate() {
            let arg = inst.argument;
            let operands = match inst.op() {
                OP_PUSH => self.operand(inst.src(), arg),
                OP_POP if inst.dst() != REG_NONE => reg_name(inst.dst()).to_string(),
                OP_POP => arg.to_string(),
                OP_LOOKUP => format!("{:?}", self.text.get(arg).unwrap_or("")),
                OP_MOV => format!("{}, {}", reg_name(inst.dst()), self.operand(inst.src(), arg)),
                OP_LOOP | OP_JMP => format!("{arg:05}"),
                OP_JXX => format!("{} {arg:05}", cond_name(inst.cond())),
                OP_RJMP => format!("{:+}", arg as i32),
                OP_RJXX => format!("{} {:+}", cond_name(inst.cond()), arg as i32),
                OP_LOOPINFO => {
                    let key = LoopKey::from_u8(inst.dst()).map(LoopKey::name).unwrap_or("?");
                    if inst.src() == SRC_STACK { format!("{key} stack[-{arg}]") } else { key.to_string() }
                }
                OP_OUTPUT if inst.src() == SRC_STR => self.operand(SRC_STR, arg),
                OP_CALL => self.blocks.get(arg as usize).map(|b| format!("{:?}", b.name)).unwrap_or_default(),
                OP_CALLIND | OP_RET => arg.to_string(),
                OP_SYSCALL => {
                    let name = self.syscalls.get((arg >> 16) as usize).map(String::as_str).unwrap_or("?");
                    format!("{name}/{}", arg & 0xFFFF)
                }
                _ => String::new(),
            };
            let name = match inst.op() {
                OP_JXX | OP_RJXX => format!("{}{}", op_name(inst.op()), cond_name(inst.cond())),
                op => op_name(op).to_string(),
            };
            let location = self
                .position(inst.debug)
                .map(|p| format!("  ; {p}"))
                .unwrap_or_default();
            out.push_str(&format!("{ip:05}  {name:<9} {operands}{location}\n"));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Program {
        let mut program = Program::default();
        let hello = program.text.add_raw("hello\n");
        let name = program.text.add("name");
        let seven = program.data.add_int(7);
        let half = program.data.add_float(0.5);
        program.syscalls.push("size".to_string());
        program.sources.push(SourceInfo { name: "main.tmpl".into(), map: SourceMap::new("hello\n<tmpl_var name>") });
        let d = DebugToken::new(0, 6);
        program.code = vec![
            Instruction::new(OP_OUTPUT, SRC_STR, 0, 0, hello, d),
            Instruction::new(OP_LOOKUP, SRC_NONE, 0, 0, name, d),
            Instruction::new(OP_PUSH, SRC_INT, 0, 0, seven, d),
            Instruction::new(OP_PUSH, SRC_FLOAT, 0, 0, half, d),
            Instruction::new(OP_SYSCALL, SRC_NONE, 0, 0, 3, d),
            Instruction::new(OP_OUTPUT, SRC_STACK, 0, 0, 0, d),
            Instruction::new(OP_HLT, SRC_NONE, 0, 0, 0, d),
        ];
        program
    }

    #[test]
    fn encode_fields() {
        let inst = Instruction::new(OP_JXX, SRC_STACK, REG_HR, COND_LE, 9, DebugToken::default());
        assert_eq!(inst.op(), OP_JXX);
        assert_eq!(inst.src(), SRC_STACK);
        assert_eq!(inst.dst(), REG_HR);
        assert_eq!(inst.cond(), COND_LE);
    }

    #[test]
    fn debug_token_packs_source_and_offset() {
        let t = DebugToken::new(3, 123_456_789);
        assert_eq!(t.source(), 3);
        assert_eq!(t.offset(), 123_456_789);
    }

    #[test]
    fn static_data_reuses_zero_and_one() {
        let mut data = StaticData::default();
        assert_eq!(data.add_int(0), 0);
        assert_eq!(data.add_int(1), 1);
        assert_eq!(data.add_int(5), 2);
        assert_eq!(data.add_int(5), 3);
        assert_eq!(data.ints, vec![0, 1, 5, 5]);
    }

    #[test]
    fn static_text_add_dedups_add_raw_does_not() {
        let mut text = StaticText::default();
        let a = text.add("x");
        let b = text.add("x");
        let c = text.add_raw("x");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(text.strings.len(), 2);
    }

    #[test]
    fn position_from_debug_token() {
        let program = sample();
        let pos = program.position(DebugToken::new(0, 8)).unwrap();
        assert_eq!((pos.line, pos.column), (2, 3));
        assert_eq!(pos.to_string(), "main.tmpl:2:3");
        assert!(program.position(DebugToken::new(4, 0)).is_none());
    }

    #[test]
    fn binary_layout_restores_program() {
        let program = sample();
        let bytes = program.to_bytes();
        assert_eq!(&bytes[..6], b"TMPLVM");
        let decoded = Program::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, program);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(Program::from_bytes(b"nope"), Err(DecodeError::Truncated { .. })));
        assert!(matches!(Program::from_bytes(b"NOTVM!\x01\x00"), Err(DecodeError::BadMagic)));
        let mut bytes = sample().to_bytes();
        bytes.truncate(bytes.len() - 3);
        assert!(matches!(Program::from_bytes(&bytes), Err(DecodeError::Truncated { .. })));
    }

    #[test]
    fn validate_catches_bad_references() {
        let mut program = sample();
        program.code[2].argument = 99;
        assert!(matches!(program.validate(), Err(DecodeError::Invalid { ip: 2, .. })));

        let mut program = sample();
        program.code.push(Instruction::new(OP_JMP, SRC_NONE, 0, 0, 100, DebugToken::default()));
        assert!(matches!(program.validate(), Err(DecodeError::Invalid { ip: 7, .. })));
    }

    #[test]
    fn disassembly_names_operands() {
        let listing = sample().disassemble();
        assert!(listing.contains("OUTPUT"), "{listing}");
        assert!(listing.contains("\"hello\\n\""), "{listing}");
        assert!(listing.contains("PUSH      #7"), "{listing}");
        assert!(listing.contains("SYSCALL   size/3"), "{listing}");
        assert!(listing.contains("main.tmpl:2:1"), "{listing}");
    }

    #[test]
    fn loop_keys_by_name() {
        assert_eq!(LoopKey::from_name("__counter__"), Some(LoopKey::Counter));
        assert_eq!(LoopKey::from_name("__nope__"), None);
        assert!(is_reserved_key("__x__"));
        assert!(!is_reserved_key("____"));
        assert!(!is_reserved_key("x__"));
    }
}
