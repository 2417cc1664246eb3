pub mod ansi;
pub mod json;
pub mod registry;

use crate::source::Span;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone)]
pub struct Label {
    pub span: Span,
    pub message: String,
    pub is_primary: bool,
}

/// A reportable problem, independent of how it is printed.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub code: Option<&'static str>,
    pub message: String,
    pub file: Option<String>,
    /// 1-based line and column, when known without the source text.
    pub location: Option<(usize, usize)>,
    pub labels: Vec<Label>,
    pub notes: Vec<String>,
    pub suggestion: Option<String>,
    pub source: Option<String>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Error,
            code: None,
            message: message.into(),
            file: None,
            location: None,
            labels: Vec::new(),
            notes: Vec::new(),
            suggestion: None,
            source: None,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Diagnostic { severity: Severity::Warning, ..Diagnostic::error(message) }
    }

    pub fn with_code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn with_location(mut self, line: usize, column: usize) -> Self {
        self.location = Some((line, column));
        self
    }

    pub fn with_span(mut self, span: Span, label: impl Into<String>) -> Self {
        self.labels.push(Label { span, message: label.into(), is_primary: true });
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Attach the text of `file` so renderers can show the offending line.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

// ---- From impls for crate error types ----

impl From<&crate::parser::ParseError> for Diagnostic {
    fn from(e: &crate::parser::ParseError) -> Self {
        let mut d = Diagnostic::error(&e.message)
            .with_code(e.code)
            .with_file(&e.file)
            .with_location(e.line, e.column)
            .with_span(Span::at(e.offset), "here");
        if let Some(hint) = registry::hint(e.code) {
            d = d.with_suggestion(hint);
        }
        d
    }
}

impl From<&crate::parser::Warning> for Diagnostic {
    fn from(w: &crate::parser::Warning) -> Self {
        Diagnostic::warning(&w.message)
            .with_code("TMPL-W001")
            .with_file(&w.file)
            .with_location(w.line, w.column)
    }
}

impl From<&crate::vm::RuntimeError> for Diagnostic {
    fn from(e: &crate::vm::RuntimeError) -> Self {
        let mut d = Diagnostic::error(e.error.to_string())
            .with_code(e.error.code())
            .with_note(format!("at instruction {}", e.ip));
        if let Some(pos) = &e.position {
            d = d
                .with_file(&pos.file)
                .with_location(pos.line, pos.column)
                .with_span(Span::at(pos.offset), "while evaluating this");
        }
        d
    }
}

impl From<&crate::bytecode::DecodeError> for Diagnostic {
    fn from(e: &crate::bytecode::DecodeError) -> Self {
        use crate::bytecode::DecodeError;
        let code = match e {
            DecodeError::BadMagic | DecodeError::Version(_) => "TMPL-D001",
            DecodeError::Truncated { .. } | DecodeError::Utf8 { .. } => "TMPL-D002",
            DecodeError::Invalid { .. } => "TMPL-D003",
        };
        Diagnostic::error(e.to_string()).with_code(code)
    }
}

impl From<&crate::source::LoadError> for Diagnostic {
    fn from(e: &crate::source::LoadError) -> Self {
        Diagnostic::error(format!("cannot load template `{}`: {e}", e.name())).with_code("TMPL-P016")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{CompileOptions, compile_source};
    use crate::source::MemoryLoader;

    fn parse_error(text: &str) -> crate::parser::ParseError {
        compile_source("page.tmpl", text, &MemoryLoader::new(), &CompileOptions::default()).unwrap_err()
    }

    #[test]
    fn diagnostic_error_builder() {
        let d = Diagnostic::error("something went wrong");
        assert_eq!(d.severity, Severity::Error);
        assert_eq!(d.message, "something went wrong");
        assert!(d.code.is_none());
        assert!(d.labels.is_empty());
        assert!(d.notes.is_empty());
        assert!(d.suggestion.is_none());
    }

    #[test]
    fn warning_keeps_builder_fields() {
        let d = Diagnostic::warning("odd").with_code("TMPL-W001").with_location(3, 4);
        assert_eq!(d.severity, Severity::Warning);
        assert_eq!(d.code, Some("TMPL-W001"));
        assert_eq!(d.location, Some((3, 4)));
    }

    #[test]
    fn from_parse_error() {
        let e = parse_error("ab\n<tmpl_var >");
        let d = Diagnostic::from(&e);
        assert_eq!(d.code, Some(e.code));
        assert_eq!(d.file.as_deref(), Some("page.tmpl"));
        assert_eq!(d.location, Some((e.line, e.column)));
        assert_eq!(d.labels[0].span.start, e.offset);
        assert!(d.labels[0].is_primary);
    }

    #[test]
    fn from_warning() {
        let compiled =
            compile_source("w.tmpl", "<tmpl_if 1>x</tmpl_if>", &MemoryLoader::new(), &CompileOptions::default())
                .unwrap();
        let d = Diagnostic::from(&compiled.warnings[0]);
        assert_eq!(d.severity, Severity::Warning);
        assert_eq!(d.code, Some("TMPL-W001"));
        assert_eq!(d.file.as_deref(), Some("w.tmpl"));
    }

    #[test]
    fn from_runtime_error() {
        let program = compile_source("r.tmpl", "x\n <tmpl_var (1 div 0)>", &MemoryLoader::new(), &CompileOptions::default())
            .unwrap()
            .program;
        let table = crate::syscall::SyscallTable::with_builtins();
        let e = crate::vm::Vm::new(&program, &table).render(&crate::value::Value::Undefined).unwrap_err();
        let d = Diagnostic::from(&e);
        assert_eq!(d.code, Some("TMPL-R003"));
        assert!(d.message.contains("division by zero"));
        assert_eq!(d.file.as_deref(), Some("r.tmpl"));
        assert_eq!(d.location.map(|(line, _)| line), Some(2));
    }

    #[test]
    fn from_decode_error() {
        let d = Diagnostic::from(&crate::bytecode::DecodeError::BadMagic);
        assert_eq!(d.code, Some("TMPL-D001"));
        assert!(d.labels.is_empty());
    }

    #[test]
    fn from_load_error() {
        let e = crate::source::LoadError::NotFound { name: "gone.tmpl".to_string() };
        let d = Diagnostic::from(&e);
        assert!(d.message.contains("gone.tmpl"));
        assert_eq!(d.code, Some("TMPL-P016"));
    }

    #[test]
    fn every_emitted_code_is_registered() {
        for text in ["<tmpl_var >", "<tmpl_foo x>", "</tmpl_if>", "<tmpl_var x", "<tmpl_break>", "<tmpl_var 'a>"] {
            let e = parse_error(text);
            assert!(registry::lookup(e.code).is_some(), "{} not in registry", e.code);
        }
    }
}
