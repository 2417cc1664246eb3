//! Template compiler and bytecode VM.
//!
//! Templates are text with embedded `<tmpl_...>` tags. [`parser::compile`]
//! turns a template (and everything it includes) into a [`bytecode::Program`]
//! in a single pass; [`vm::Vm`] renders a program against a [`value::Value`].

pub mod builtins;
pub mod bytecode;
pub mod compiler;
pub mod diagnostic;
pub mod lexer;
pub mod parser;
pub mod source;
pub mod syscall;
pub mod value;
pub mod vm;

use crate::bytecode::DecodeError;
use crate::parser::{CompileOptions, Compiled, ParseError};
use crate::source::{LoadError, MemoryLoader};
use crate::syscall::SyscallTable;
use crate::value::Value;
use crate::vm::{RuntimeError, Vm};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Load(#[from] LoadError),
}

impl Error {
    pub fn diagnostic(&self) -> diagnostic::Diagnostic {
        match self {
            Error::Parse(e) => e.into(),
            Error::Runtime(e) => e.into(),
            Error::Decode(e) => e.into(),
            Error::Load(e) => e.into(),
        }
    }
}

/// Compile standalone template text against the built-in functions.
/// Includes are not available.
pub fn compile_str(name: &str, text: &str) -> Result<Compiled, Error> {
    let compiled = parser::compile_source(name, text, &MemoryLoader::new(), &CompileOptions::default())?;
    Ok(compiled)
}

/// Compile and render `text` in one step with default limits.
pub fn render_str(text: &str, data: &Value) -> Result<String, Error> {
    let compiled = compile_str("<string>", text)?;
    let table = SyscallTable::with_builtins();
    let out = Vm::new(&compiled.program, &table).render(data)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_str_end_to_end() {
        let data: Value = serde_json::from_str(r#"{"user": {"name": "Ann"}, "n": 2}"#).unwrap();
        let out = render_str("<tmpl_var user.name> has <tmpl_var (n * 3)>", &data).unwrap();
        assert_eq!(out, "Ann has 6");
    }

    #[test]
    fn errors_convert_and_carry_codes() {
        let e = render_str("<tmpl_var>", &Value::Undefined).unwrap_err();
        assert!(matches!(e, Error::Parse(_)));
        assert_eq!(e.diagnostic().code, Some("TMPL-P004"));

        let e = render_str("<tmpl_var (1 mod 0)>", &Value::Undefined).unwrap_err();
        assert!(matches!(e, Error::Runtime(_)));
        assert_eq!(e.diagnostic().code, Some("TMPL-R003"));
    }
}
