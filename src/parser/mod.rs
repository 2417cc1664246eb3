use std::collections::BTreeSet;

use crate::bytecode::{COND_EQ, COND_NE, LoopKey, Program, is_reserved_key};
use crate::compiler::{BinaryOp, Compiler, PLACEHOLDER, Relation};
use crate::lexer;
use crate::source::{SourceLoader, SourceMap};
use crate::value::Value;

// ── Public surface ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} at line {line}, pos {column}")]
pub struct ParseError {
    pub code: &'static str,
    pub message: String,
    pub file: String,
    pub offset: usize,
    pub line: usize,
    pub column: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    pub message: String,
    pub file: String,
    pub line: usize,
    pub column: usize,
}

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}: {}", self.file, self.line, self.column, self.message)
    }
}

#[derive(Debug, Clone)]
pub struct Compiled {
    pub program: Program,
    pub warnings: Vec<Warning>,
}

#[derive(Debug, Clone)]
pub struct CompileOptions {
    pub max_include_depth: usize,
    /// Names accepted in function-call position.
    pub functions: BTreeSet<String>,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            max_include_depth: 32,
            functions: crate::builtins::names().map(str::to_string).collect(),
        }
    }
}

impl CompileOptions {
    /// Accept exactly the functions registered in `table`.
    pub fn for_table(table: &crate::syscall::SyscallTable) -> Self {
        CompileOptions { functions: table.names().map(str::to_string).collect(), ..CompileOptions::default() }
    }
}

/// Load template `name` through `loader` and compile it.
pub fn compile(name: &str, loader: &dyn SourceLoader, options: &CompileOptions) -> Result<Compiled> {
    let text = loader.load(name).map_err(|e| ParseError {
        code: "TMPL-P016",
        message: format!("Cannot load template file `{name}`: {e}"),
        file: name.to_string(),
        offset: 0,
        line: 1,
        column: 1,
    })?;
    let nested = loader.clone_with_target(name);
    compile_source(name, &text, &*nested, options)
}

/// Compile `text` as template `name`; includes are resolved through
/// `loader`.
pub fn compile_source(
    name: &str,
    text: &str,
    loader: &dyn SourceLoader,
    options: &CompileOptions,
) -> Result<Compiled> {
    tracing::debug!(template = name, bytes = text.len(), "compiling");
    let mut compiler = Compiler::new();
    let warnings = {
        let mut parser = Parser::new(name, text, loader, options, &mut compiler, 0)?;
        parser.parse_template()?;
        parser.warnings
    };
    Ok(Compiled { program: compiler.finish(), warnings })
}

// ── Tags ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TagKind {
    Var,
    Udf,
    If,
    Unless,
    Elsif,
    Else,
    Foreach,
    Include,
    Call,
    Comment,
    Break,
    Block,
    Verbose,
}

const KEYWORDS: &[(&str, TagKind)] = &[
    ("var", TagKind::Var),
    ("udf", TagKind::Udf),
    ("if", TagKind::If),
    ("unless", TagKind::Unless),
    ("elsif", TagKind::Elsif),
    ("else", TagKind::Else),
    ("foreach", TagKind::Foreach),
    ("include", TagKind::Include),
    ("call", TagKind::Call),
    ("comment", TagKind::Comment),
    ("break", TagKind::Break),
    ("block", TagKind::Block),
    ("verbose", TagKind::Verbose),
];

impl TagKind {
    fn from_word(word: &str) -> Option<TagKind> {
        KEYWORDS.iter().find(|(w, _)| *w == word).map(|&(_, k)| k)
    }

    fn name(self) -> &'static str {
        KEYWORDS.iter().find(|(_, k)| *k == self).map(|(w, _)| *w).unwrap_or("?")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Eof,
    Else,
    Elsif,
    Close(TagKind),
}

impl Stop {
    fn describe(self) -> String {
        match self {
            Stop::Eof => "end of file".to_string(),
            Stop::Else => "<tmpl_else>".to_string(),
            Stop::Elsif => "<tmpl_elsif>".to_string(),
            Stop::Close(kind) => format!("</tmpl_{}>", kind.name()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct TagHead {
    at: usize,
    dash: bool,
    close: bool,
    kind: TagKind,
    end: usize,
}

/// What an expression left on the stack, as far as the compiler can tell.
#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Literal(Value),
    Dynamic,
}

const RELATIONS: &[(&str, Relation, bool)] = &[
    ("==", Relation::Eq, false),
    ("!=", Relation::Ne, false),
    (">=", Relation::Ge, false),
    ("<=", Relation::Le, false),
    (">", Relation::Gt, false),
    ("<", Relation::Lt, false),
];

const TEXT_RELATIONS: &[(&str, Relation)] = &[
    ("eq", Relation::Eq),
    ("ne", Relation::Ne),
    ("ge", Relation::Ge),
    ("le", Relation::Le),
    ("gt", Relation::Gt),
    ("lt", Relation::Lt),
];

fn is_tag_ws(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\r' | b'\n')
}

fn is_trim_ws(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\r' | b'\n' | 0x0b | 0x0c)
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_ident_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

type Result<T> = std::result::Result<T, ParseError>;

// ── Parser ──────────────────────────────────────────────────────────

struct Parser<'a> {
    name: &'a str,
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
    map: SourceMap,
    source_id: u16,
    loader: &'a dyn SourceLoader,
    options: &'a CompileOptions,
    compiler: &'a mut Compiler,
    include_level: usize,
    verbose: bool,
    /// Pending `break` jumps, one list per open foreach of this template.
    breaks: Vec<Vec<usize>>,
    warnings: Vec<Warning>,
}

impl<'a> Parser<'a> {
    fn new(
        name: &'a str,
        src: &'a str,
        loader: &'a dyn SourceLoader,
        options: &'a CompileOptions,
        compiler: &'a mut Compiler,
        include_level: usize,
    ) -> Result<Self> {
        let map = SourceMap::new(src);
        let Some(source_id) = compiler.add_source(name, map.clone()) else {
            return Err(ParseError {
                code: "TMPL-P016",
                message: "too many template sources".to_string(),
                file: name.to_string(),
                offset: 0,
                line: 1,
                column: 1,
            });
        };
        Ok(Parser {
            name,
            src,
            bytes: src.as_bytes(),
            pos: 0,
            map,
            source_id,
            loader,
            options,
            compiler,
            include_level,
            verbose: false,
            breaks: Vec::new(),
            warnings: Vec::new(),
        })
    }

    // ---- Cursor helpers ----

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn peek_at(&self, n: usize) -> Option<u8> {
        self.bytes.get(self.pos + n).copied()
    }

    fn error_at(&self, offset: usize, code: &'static str, message: impl Into<String>) -> ParseError {
        let (line, column) = self.map.lookup(offset);
        ParseError { code, message: message.into(), file: self.name.to_string(), offset, line, column }
    }

    fn error(&self, code: &'static str, message: impl Into<String>) -> ParseError {
        self.error_at(self.pos, code, message)
    }

    fn mark(&mut self, offset: usize) {
        self.compiler.at(self.source_id, offset);
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(is_tag_ws) {
            self.pos += 1;
        }
    }

    fn require_ws(&mut self) -> Result<()> {
        if !self.peek().is_some_and(is_tag_ws) {
            return Err(self.error("TMPL-P004", "expected at least one space symbol"));
        }
        self.skip_ws();
        Ok(())
    }

    fn eat(&mut self, token: &str) -> bool {
        if self.bytes[self.pos..].starts_with(token.as_bytes()) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    /// Case-insensitive word that must not run into an identifier.
    fn eat_word(&mut self, word: &str) -> bool {
        let end = self.pos + word.len();
        let matches = self.bytes.get(self.pos..end).is_some_and(|s| s.eq_ignore_ascii_case(word.as_bytes()))
            && !self.bytes.get(end).copied().is_some_and(is_ident_char);
        if matches {
            self.pos = end;
        }
        matches
    }

    fn ident(&mut self) -> Option<&'a str> {
        if !self.peek().is_some_and(is_ident_start) {
            return None;
        }
        let start = self.pos;
        while self.peek().is_some_and(is_ident_char) {
            self.pos += 1;
        }
        let src: &'a str = self.src;
        Some(&src[start..self.pos])
    }

    fn expect_byte(&mut self, b: u8, message: &str) -> Result<()> {
        if self.peek() == Some(b) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error("TMPL-P002", message))
        }
    }

    // ---- Text and tag framing ----

    fn tag_at(&self, at: usize) -> Result<Option<TagHead>> {
        let mut i = at + 1;
        let dash = self.bytes.get(i) == Some(&b'-');
        if dash {
            i += 1;
        }
        let close = self.bytes.get(i) == Some(&b'/');
        if close {
            i += 1;
        }
        if !self.bytes.get(i..i + 5).is_some_and(|s| s.eq_ignore_ascii_case(b"tmpl_")) {
            return Ok(None);
        }
        i += 5;
        let kw_start = i;
        while self.bytes.get(i).is_some_and(u8::is_ascii_alphabetic) {
            i += 1;
        }
        let word = self.src[kw_start..i].to_ascii_lowercase();
        let kind = TagKind::from_word(&word).ok_or_else(|| self.error_at(kw_start, "TMPL-P003", "incorrect operator"))?;
        Ok(Some(TagHead { at, dash, close, kind, end: i }))
    }

    fn next_tag(&self) -> Result<Option<TagHead>> {
        let mut from = self.pos;
        while let Some(rel) = self.bytes[from..].iter().position(|&b| b == b'<') {
            let at = from + rel;
            if let Some(head) = self.tag_at(at)? {
                return Ok(Some(head));
            }
            from = at + 1;
        }
        Ok(None)
    }

    fn emit_text(&mut self, start: usize, end: usize, trim: bool) {
        let mut text = &self.src[start..end];
        if trim {
            text = text.trim_end_matches([' ', '\t', '\r', '\n']);
        }
        self.mark(start);
        self.compiler.output_text(text);
    }

    /// Whitespace after a trimming tag, unless it runs to the end of input.
    fn trim_after(&mut self) {
        let mut i = self.pos;
        while self.bytes.get(i).copied().is_some_and(is_trim_ws) {
            i += 1;
        }
        if i < self.bytes.len() {
            self.pos = i;
        }
    }

    /// `ws* '-'? '>'`
    fn close_tag_with(&mut self, verbose: bool) -> Result<()> {
        self.skip_ws();
        let dash = self.peek() == Some(b'-') && self.peek_at(1) == Some(b'>');
        if dash {
            self.pos += 1;
        }
        self.expect_byte(b'>', "expected '>'")?;
        if dash || verbose {
            self.trim_after();
        }
        Ok(())
    }

    fn close_tag(&mut self) -> Result<()> {
        self.close_tag_with(self.verbose)
    }

    // ---- Template structure ----

    fn parse_template(&mut self) -> Result<()> {
        let (stop, at) = self.parse_body()?;
        match stop {
            Stop::Eof => Ok(()),
            other => Err(self.error_at(at, "TMPL-P008", format!("unexpected {}", other.describe()))),
        }
    }

    /// Emit text and tags until end of input, an else/elsif, or a close tag.
    /// Returns what stopped the run and where that tag starts.
    fn parse_body(&mut self) -> Result<(Stop, usize)> {
        loop {
            let text_start = self.pos;
            let Some(tag) = self.next_tag()? else {
                self.emit_text(text_start, self.bytes.len(), false);
                self.pos = self.bytes.len();
                return Ok((Stop::Eof, self.pos));
            };
            let trim = tag.dash || self.verbose;
            self.emit_text(text_start, tag.at, trim);
            self.pos = tag.end;
            self.mark(tag.at);

            if tag.close {
                return self.close_body(tag).map(|stop| (stop, tag.at));
            }
            match tag.kind {
                TagKind::Else => {
                    self.close_tag()?;
                    return Ok((Stop::Else, tag.at));
                }
                TagKind::Elsif => return Ok((Stop::Elsif, tag.at)),
                TagKind::Var | TagKind::Udf => self.parse_var()?,
                TagKind::If => self.parse_if(tag, false)?,
                TagKind::Unless => self.parse_if(tag, true)?,
                TagKind::Foreach => self.parse_foreach(tag)?,
                TagKind::Include => self.parse_include(tag)?,
                TagKind::Call => self.parse_call(tag)?,
                TagKind::Comment => self.parse_comment(tag)?,
                TagKind::Break => self.parse_break(tag)?,
                TagKind::Block => self.parse_block(tag)?,
                TagKind::Verbose => self.parse_verbose(tag)?,
            }
        }
    }

    fn close_body(&mut self, tag: TagHead) -> Result<Stop> {
        match tag.kind {
            TagKind::If | TagKind::Unless | TagKind::Foreach | TagKind::Block => {
                self.close_tag()?;
            }
            TagKind::Verbose => self.close_tag_with(false)?,
            TagKind::Comment => {
                return Err(self.error_at(tag.at, "TMPL-P009", "operator '</tmpl_comment>' cannot use here"));
            }
            other => {
                return Err(self.error_at(
                    tag.at,
                    "TMPL-P009",
                    format!("operator '</tmpl_{}>' does not exist", other.name()),
                ));
            }
        }
        Ok(Stop::Close(tag.kind))
    }

    /// The body of `open` must end with its own close tag.
    fn expect_close(&self, open: TagHead, stop: Stop, at: usize) -> Result<()> {
        match stop {
            Stop::Close(kind) if kind == open.kind => Ok(()),
            Stop::Eof => Err(self.error_at(
                open.at,
                "TMPL-P008",
                format!("Found unclosed tag </tmpl_{}>", open.kind.name()),
            )),
            other => Err(self.error_at(
                at,
                "TMPL-P008",
                format!("expected </tmpl_{}> but found {}", open.kind.name(), other.describe()),
            )),
        }
    }

    fn parse_var(&mut self) -> Result<()> {
        self.require_ws()?;
        self.tag_expr()?;
        self.close_tag()?;
        self.compiler.output();
        Ok(())
    }

    /// if / unless with any number of elsif branches and an optional else.
    fn parse_if(&mut self, open: TagHead, negate: bool) -> Result<()> {
        self.require_ws()?;
        let mut next_branch = self.condition(negate)?;
        self.close_tag()?;
        let mut exits = Vec::new();
        loop {
            let (stop, at) = self.parse_body()?;
            match stop {
                Stop::Elsif => {
                    exits.push(self.compiler.jump(PLACEHOLDER));
                    self.patch_branch(next_branch);
                    self.require_ws()?;
                    next_branch = self.condition(false)?;
                    self.close_tag()?;
                }
                Stop::Else => {
                    exits.push(self.compiler.jump(PLACEHOLDER));
                    self.patch_branch(next_branch.take());
                    let (stop, at) = self.parse_body()?;
                    self.expect_close(open, stop, at)?;
                    break;
                }
                other => {
                    self.expect_close(open, other, at)?;
                    self.patch_branch(next_branch.take());
                    break;
                }
            }
        }
        let exit = self.compiler.here();
        for jump in exits {
            self.compiler.patch(jump, exit);
        }
        Ok(())
    }

    fn patch_branch(&mut self, jump: Option<usize>) {
        if let Some(jump) = jump {
            let here = self.compiler.here();
            self.compiler.patch(jump, here);
        }
    }

    /// Compile a branch condition. Returns the jump taken when the branch is
    /// skipped, or `None` when the branch is always entered.
    fn condition(&mut self, negate: bool) -> Result<Option<usize>> {
        let at = self.pos;
        match self.tag_expr()? {
            Operand::Literal(value) => {
                self.compiler.remove_last_push();
                let kind = match value {
                    Value::Int(_) => "INTEGER",
                    Value::Float(_) => "FLOAT",
                    _ => "STRING",
                };
                let taken = value.is_truthy() != negate;
                self.warn(at, format!("comparison result of {kind} VALUE is always {taken}"));
                Ok((!taken).then(|| self.compiler.jump(PLACEHOLDER)))
            }
            Operand::Dynamic => {
                self.compiler.exist();
                self.compiler.pop(1);
                let cond = if negate { COND_EQ } else { COND_NE };
                Ok(Some(self.compiler.cond_jump(cond, PLACEHOLDER)))
            }
        }
    }

    fn warn(&mut self, offset: usize, message: String) {
        let (line, column) = self.map.lookup(offset);
        tracing::warn!(file = self.name, line, column, "{message}");
        self.warnings.push(Warning { message, file: self.name.to_string(), line, column });
    }

    fn parse_foreach(&mut self, open: TagHead) -> Result<()> {
        self.require_ws()?;
        if !self.peek().is_some_and(is_ident_start) {
            return Err(self.error("TMPL-P018", "incorrect foreach condition"));
        }
        self.factor()?;
        self.require_ws()?;
        if !self.eat_word("as") {
            return Err(self.error("TMPL-P018", "incorrect foreach condition. expected `as` keyword"));
        }
        self.skip_ws();
        let Some(iterator) = self.ident() else {
            return Err(self.error("TMPL-P018", "incorrect foreach iterator name"));
        };
        self.close_tag()?;

        let labels = self.compiler.begin_foreach(iterator);
        self.breaks.push(Vec::new());
        let (stop, at) = self.parse_body()?;
        self.expect_close(open, stop, at)?;
        let exit = self.compiler.end_foreach(labels);
        for jump in self.breaks.pop().unwrap_or_default() {
            self.compiler.patch(jump, exit);
        }
        Ok(())
    }

    fn parse_break(&mut self, open: TagHead) -> Result<()> {
        self.close_tag()?;
        if self.breaks.is_empty() {
            return Err(self.error_at(open.at, "TMPL-P015", "TMPL_break outside loop"));
        }
        let jump = self.compiler.jump(PLACEHOLDER);
        if let Some(pending) = self.breaks.last_mut() {
            pending.push(jump);
        }
        Ok(())
    }

    fn parse_include(&mut self, open: TagHead) -> Result<()> {
        self.require_ws()?;
        if !matches!(self.peek(), Some(b'"' | b'\'')) {
            return Err(self.error("TMPL-P016", "incorrect include file name"));
        }
        let name = self.string_literal()?;
        self.close_tag()?;

        if self.include_level >= self.options.max_include_depth {
            return Err(self.error_at(
                open.at,
                "TMPL-P016",
                format!("Max. recursion level of template reached ({})", self.options.max_include_depth),
            ));
        }
        let text = self.loader.load(&name).map_err(|e| {
            self.error_at(open.at, "TMPL-P016", format!("Cannot load template file `{name}`: {e}"))
        })?;
        tracing::debug!(template = self.name, include = %name, level = self.include_level + 1, "including");

        let nested = self.loader.clone_with_target(&name);
        let warnings =
            Parser::new(&name, &text, &*nested, self.options, &mut *self.compiler, self.include_level + 1).and_then(
                |mut child| child.parse_template().map(|_| std::mem::take(&mut child.warnings)),
            );
        match warnings {
            Ok(warnings) => {
                self.warnings.extend(warnings);
                Ok(())
            }
            Err(e) => Err(self.error_at(
                open.at,
                e.code,
                format!("In include file '{name}' at line {}, pos {}: {}", e.line, e.column, e.message),
            )),
        }
    }

    fn parse_call(&mut self, open: TagHead) -> Result<()> {
        self.require_ws()?;
        let named = match self.peek() {
            Some(b'"' | b'\'') => {
                let name_at = self.pos;
                let name = self.string_literal()?;
                let Some(block) = self.compiler.block(&name) else {
                    return Err(self.error_at(name_at, "TMPL-P011", format!("unknown block name '{name}'")));
                };
                Some(block)
            }
            Some(b) if is_ident_start(b) => {
                self.variable()?;
                None
            }
            _ => return Err(self.error("TMPL-P011", "incorrect block name")),
        };

        self.compiler.begin_call();
        let argc = self.call_args()?;
        self.close_tag()?;

        match named {
            Some((id, arity)) => {
                if argc != arity as usize {
                    return Err(self.error_at(
                        open.at,
                        "TMPL-P012",
                        format!("invalid number of arguments (expected {arity}, got {argc})"),
                    ));
                }
                self.compiler.call_block(id);
            }
            None => {
                self.compiler.call_indirect();
            }
        }
        Ok(())
    }

    /// Optional `args(expr, ...)`; pushes every argument.
    fn call_args(&mut self) -> Result<usize> {
        self.skip_ws();
        if !self.eat_word("args") {
            return Ok(0);
        }
        self.skip_ws();
        self.expect_byte(b'(', "need '(' token after \"args\"")?;
        self.skip_ws();
        if self.peek() == Some(b')') {
            self.pos += 1;
            return Ok(0);
        }
        let mut argc = 0;
        loop {
            self.skip_ws();
            self.logical_or()?;
            argc += 1;
            self.skip_ws();
            match self.peek() {
                Some(b',') => self.pos += 1,
                Some(b')') => {
                    self.pos += 1;
                    return Ok(argc);
                }
                _ => return Err(self.error("TMPL-P002", "expected ')' token")),
            }
        }
    }

    fn parse_block(&mut self, open: TagHead) -> Result<()> {
        if self.compiler.in_block() {
            return Err(self.error_at(open.at, "TMPL-P014", "Nesting of TMPL_block is forbidden"));
        }
        if self.compiler.scope() > 0 {
            return Err(self.error_at(open.at, "TMPL-P014", "TMPL_block inside TMPL_foreach is forbidden"));
        }
        self.require_ws()?;
        let name_at = self.pos;
        if !matches!(self.peek(), Some(b'"' | b'\'')) {
            return Err(self.error("TMPL-P011", "incorrect block name"));
        }
        let name = self.string_literal()?;
        if name.is_empty() {
            return Err(self.error_at(name_at, "TMPL-P011", "incorrect block name"));
        }
        if self.compiler.block(&name).is_some() {
            return Err(self.error_at(name_at, "TMPL-P013", format!("redefinition of block '{name}'")));
        }

        let mut args: Vec<String> = Vec::new();
        self.skip_ws();
        if self.eat_word("args") {
            self.skip_ws();
            self.expect_byte(b'(', "need '(' token after \"args\"")?;
            self.skip_ws();
            if self.peek() == Some(b')') {
                self.pos += 1;
            } else {
                loop {
                    self.skip_ws();
                    let arg_at = self.pos;
                    let Some(arg) = self.ident() else {
                        return Err(self.error("TMPL-P011", "incorrect block argument name"));
                    };
                    if args.iter().any(|a| a == arg) {
                        return Err(self.error_at(arg_at, "TMPL-P013", "duplicate argument's name"));
                    }
                    args.push(arg.to_string());
                    self.skip_ws();
                    match self.peek() {
                        Some(b',') => self.pos += 1,
                        Some(b')') => {
                            self.pos += 1;
                            break;
                        }
                        _ => return Err(self.error("TMPL-P002", "expected ')' token")),
                    }
                }
            }
        }
        self.close_tag()?;

        let start = self.compiler.begin_block(&name, &args);
        let (stop, at) = self.parse_body()?;
        self.expect_close(open, stop, at)?;
        self.compiler.end_block(start);
        Ok(())
    }

    fn parse_comment(&mut self, open: TagHead) -> Result<()> {
        self.close_tag()?;
        let mut from = self.pos;
        while let Some(rel) = self.bytes[from..].iter().position(|&b| b == b'<') {
            let at = from + rel;
            let mut i = at + 1;
            let dash = self.bytes.get(i) == Some(&b'-');
            if dash {
                i += 1;
            }
            let keyword = b"/tmpl_comment";
            if self.bytes.get(i..i + keyword.len()).is_some_and(|s| s.eq_ignore_ascii_case(keyword))
                && !self.bytes.get(i + keyword.len()).is_some_and(u8::is_ascii_alphabetic)
            {
                self.pos = i + keyword.len();
                return self.close_tag();
            }
            from = at + 1;
        }
        Err(self.error_at(open.at, "TMPL-P001", "expected '</tmpl_comment>'"))
    }

    fn parse_verbose(&mut self, open: TagHead) -> Result<()> {
        let outer = self.verbose;
        self.verbose = true;
        self.close_tag()?;
        let (stop, at) = self.parse_body()?;
        self.verbose = outer;
        self.expect_close(open, stop, at)
    }

    // ---- Expressions ----

    /// `( LogicalOr )` or a single factor, so an unparenthesized `>` ends
    /// the tag.
    fn tag_expr(&mut self) -> Result<Operand> {
        self.skip_ws();
        self.factor()
    }

    fn logical_or(&mut self) -> Result<Operand> {
        let first = self.logical_and()?;
        let save = self.pos;
        self.skip_ws();
        if !(self.eat("||") || self.eat_word("or")) {
            self.pos = save;
            return Ok(first);
        }
        let mut to_true = vec![self.truth_jump(COND_EQ)];
        loop {
            self.skip_ws();
            self.logical_and()?;
            to_true.push(self.truth_jump(COND_EQ));
            let save = self.pos;
            self.skip_ws();
            if !(self.eat("||") || self.eat_word("or")) {
                self.pos = save;
                break;
            }
        }
        let target = self.compiler.select_tail(0);
        for jump in to_true {
            self.compiler.patch(jump, target);
        }
        Ok(Operand::Dynamic)
    }

    fn logical_and(&mut self) -> Result<Operand> {
        let first = self.relational()?;
        let save = self.pos;
        self.skip_ws();
        if !(self.eat("&&") || self.eat_word("and")) {
            self.pos = save;
            return Ok(first);
        }
        let mut to_false = vec![self.truth_jump(COND_NE)];
        loop {
            self.skip_ws();
            self.relational()?;
            to_false.push(self.truth_jump(COND_NE));
            let save = self.pos;
            self.skip_ws();
            if !(self.eat("&&") || self.eat_word("and")) {
                self.pos = save;
                break;
            }
        }
        let target = self.compiler.select_tail(1);
        for jump in to_false {
            self.compiler.patch(jump, target);
        }
        Ok(Operand::Dynamic)
    }

    /// Consume the operand just pushed and jump on its truthiness.
    fn truth_jump(&mut self, cond: u8) -> usize {
        self.compiler.exist();
        self.compiler.pop(1);
        self.compiler.cond_jump(cond, PLACEHOLDER)
    }

    fn relation(&mut self) -> Option<(Relation, bool)> {
        for &(token, rel, text) in RELATIONS {
            if self.eat(token) {
                return Some((rel, text));
            }
        }
        for &(word, rel) in TEXT_RELATIONS {
            if self.eat_word(word) {
                return Some((rel, true));
            }
        }
        None
    }

    fn relational(&mut self) -> Result<Operand> {
        let left = self.additive()?;
        let save = self.pos;
        self.skip_ws();
        let at = self.pos;
        let Some((rel, text)) = self.relation() else {
            self.pos = save;
            return Ok(left);
        };
        self.skip_ws();
        self.additive()?;
        self.mark(at);
        self.compiler.relation(rel, text);
        Ok(Operand::Dynamic)
    }

    fn additive(&mut self) -> Result<Operand> {
        let mut kind = self.multiplicative()?;
        loop {
            let save = self.pos;
            self.skip_ws();
            let at = self.pos;
            let op = match self.peek() {
                Some(b'+') => BinaryOp::Add,
                Some(b'-') if self.peek_at(1) != Some(b'>') => BinaryOp::Sub,
                _ => {
                    self.pos = save;
                    return Ok(kind);
                }
            };
            self.pos += 1;
            self.skip_ws();
            self.multiplicative()?;
            self.mark(at);
            self.compiler.binary(op);
            kind = Operand::Dynamic;
        }
    }

    fn multiplicative(&mut self) -> Result<Operand> {
        let mut kind = self.factor()?;
        loop {
            let save = self.pos;
            self.skip_ws();
            let at = self.pos;
            let op = if self.eat("*") {
                BinaryOp::Mul
            } else if self.eat("/") {
                BinaryOp::Div
            } else if self.eat_word("div") {
                BinaryOp::IntDiv
            } else if self.eat_word("mod") {
                BinaryOp::Mod
            } else {
                self.pos = save;
                return Ok(kind);
            };
            self.skip_ws();
            self.factor()?;
            self.mark(at);
            self.compiler.binary(op);
            kind = Operand::Dynamic;
        }
    }

    fn factor(&mut self) -> Result<Operand> {
        self.skip_ws();
        let at = self.pos;
        self.mark(at);
        match self.peek() {
            Some(b) if is_ident_start(b) => {
                let name_end = {
                    let mut i = self.pos;
                    while self.bytes.get(i).copied().is_some_and(is_ident_char) {
                        i += 1;
                    }
                    i
                };
                let mut j = name_end;
                while self.bytes.get(j).copied().is_some_and(is_tag_ws) {
                    j += 1;
                }
                if self.bytes.get(j) == Some(&b'(') {
                    self.function_call()
                } else {
                    self.variable()
                }
            }
            Some(b) if b.is_ascii_digit() => self.number(),
            Some(b'"' | b'\'') => {
                let s = self.string_literal()?;
                self.mark(at);
                self.compiler.push_string(&s);
                Ok(Operand::Literal(Value::String(s)))
            }
            Some(b'(') => {
                self.pos += 1;
                self.skip_ws();
                let kind = self.logical_or()?;
                self.skip_ws();
                self.expect_byte(b')', "expected ')' token")?;
                Ok(kind)
            }
            Some(op @ (b'+' | b'-' | b'!')) => {
                self.pos += 1;
                self.skip_ws();
                if self.peek().is_none() {
                    return Err(self.error("TMPL-P005", "Expected rvalue after unary operation"));
                }
                self.factor()?;
                self.mark(at);
                match op {
                    b'-' => {
                        self.compiler.neg();
                    }
                    b'!' => {
                        self.compiler.not();
                    }
                    _ => {}
                }
                Ok(Operand::Dynamic)
            }
            _ => Err(self.error("TMPL-P005", "expected variable, value, function or expression")),
        }
    }

    fn function_call(&mut self) -> Result<Operand> {
        let at = self.pos;
        let Some(name) = self.ident() else {
            return Err(self.error("TMPL-P005", "expected function name"));
        };
        if !self.options.functions.contains(name) {
            return Err(self.error_at(at, "TMPL-P010", format!("unknown function '{name}'")));
        }
        self.skip_ws();
        self.expect_byte(b'(', "expected '('")?;
        self.skip_ws();
        let mut argc = 0;
        if self.peek() == Some(b')') {
            self.pos += 1;
        } else {
            loop {
                self.skip_ws();
                if self.peek() == Some(b')') {
                    return Err(self.error("TMPL-P005", "expected expression after ','"));
                }
                self.logical_or()?;
                argc += 1;
                self.skip_ws();
                match self.peek() {
                    Some(b',') => self.pos += 1,
                    Some(b')') => {
                        self.pos += 1;
                        break;
                    }
                    _ => return Err(self.error("TMPL-P002", "expected ')' token")),
                }
            }
        }
        self.mark(at);
        self.compiler.syscall(name, argc);
        Ok(Operand::Dynamic)
    }

    /// A name with any chain of `.key`, `[expr]` and `{expr}`.
    fn variable(&mut self) -> Result<Operand> {
        let at = self.pos;
        let Some(head) = self.ident() else {
            return Err(self.error("TMPL-P005", "expected variable or expression"));
        };
        self.mark(at);

        if let Some(index) = self.compiler.block_arg(head) {
            self.compiler.push_block_arg(index);
        } else if let Some(iter) = self.compiler.iterator(head) {
            let save = self.pos;
            self.skip_ws();
            let mut handled = false;
            if self.peek() == Some(b'.') {
                self.pos += 1;
                self.skip_ws();
                match self.ident() {
                    Some(key) if is_reserved_key(key) => {
                        self.push_loop_key(key, iter);
                        handled = true;
                    }
                    _ => {}
                }
            }
            if !handled {
                self.pos = save;
                self.compiler.push_iterator(iter);
            }
        } else if let (Some(current), true) = (self.compiler.current_loop(), is_reserved_key(head)) {
            self.push_loop_key(head, current);
        } else {
            self.compiler.push_variable(head);
        }

        loop {
            let save = self.pos;
            self.skip_ws();
            match self.peek() {
                Some(b'.') => {
                    self.pos += 1;
                    self.skip_ws();
                    let key_at = self.pos;
                    let Some(key) = self.ident() else {
                        return Err(self.error("TMPL-P005", "invalid indirect call"));
                    };
                    self.mark(key_at);
                    self.compiler.push_string(key);
                    self.compiler.index();
                }
                Some(open @ (b'[' | b'{')) => {
                    let close = if open == b'[' { b']' } else { b'}' };
                    let key_at = self.pos;
                    self.pos += 1;
                    self.skip_ws();
                    self.logical_or()?;
                    self.skip_ws();
                    self.expect_byte(close, "invalid indirect call")?;
                    self.mark(key_at);
                    self.compiler.index();
                }
                _ => {
                    self.pos = save;
                    return Ok(Operand::Dynamic);
                }
            }
        }
    }

    fn push_loop_key(&mut self, key: &str, iter: crate::compiler::IterRef) {
        match LoopKey::from_name(key) {
            Some(key) => self.compiler.push_loop_info(key, iter),
            None => self.compiler.push_undef(),
        };
    }

    fn number(&mut self) -> Result<Operand> {
        let start = self.pos;
        self.skip_digits();
        let mut float = false;
        if self.peek() == Some(b'.') && self.peek_at(1).is_some_and(|b| b.is_ascii_digit()) {
            self.pos += 1;
            self.skip_digits();
            float = true;
        }
        if matches!(self.peek(), Some(b'e' | b'E')) {
            self.pos += 1;
            let signed = matches!(self.peek(), Some(b'+' | b'-'));
            if signed {
                self.pos += 1;
            }
            if !self.peek().is_some_and(|b| b.is_ascii_digit()) {
                let message = if signed { "exponent has no digits after sign" } else { "exponent has no digits" };
                return Err(self.error("TMPL-P007", message));
            }
            self.skip_digits();
            float = true;
        }
        let text = &self.src[start..self.pos];
        self.mark(start);
        if float {
            let value: f64 = text.parse().map_err(|_| self.error_at(start, "TMPL-P007", "invalid number"))?;
            self.compiler.push_float(value);
            Ok(Operand::Literal(Value::Float(value)))
        } else {
            let value: i64 =
                text.parse().map_err(|_| self.error_at(start, "TMPL-P007", "integer literal out of range"))?;
            self.compiler.push_int(value);
            Ok(Operand::Literal(Value::Int(value)))
        }
    }

    fn skip_digits(&mut self) {
        while self.peek().is_some_and(|b| b.is_ascii_digit()) {
            self.pos += 1;
        }
    }

    /// Quoted string at the cursor, escapes decoded.
    fn string_literal(&mut self) -> Result<String> {
        let start = self.pos;
        let Some(end) = lexer::find_closing_quote(self.bytes, start) else {
            return Err(self.error_at(start, "TMPL-P006", "missing terminating character"));
        };
        let body = &self.src[start + 1..end];
        let value = lexer::unescape(body).map_err(|e| self.error_at(start + 1 + e.offset, "TMPL-P006", e.message))?;
        self.pos = end + 1;
        Ok(value)
    }
}
