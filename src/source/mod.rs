use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

// ---- Span infrastructure ----

/// Byte range within source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn at(offset: usize) -> Span {
        Span { start: offset, end: offset + 1 }
    }
}

/// Maps byte offsets to line/column positions within source text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMap {
    line_starts: Vec<usize>,
}

impl SourceMap {
    pub fn new(source: &str) -> Self {
        let mut line_starts = vec![0];
        for (i, b) in source.bytes().enumerate() {
            if b == b'\n' {
                line_starts.push(i + 1);
            }
        }
        SourceMap { line_starts }
    }

    pub fn from_line_starts(line_starts: Vec<usize>) -> Self {
        if line_starts.first() == Some(&0) {
            SourceMap { line_starts }
        } else {
            let mut with_origin = vec![0];
            with_origin.extend(line_starts);
            SourceMap { line_starts: with_origin }
        }
    }

    pub fn line_starts(&self) -> &[usize] {
        &self.line_starts
    }

    /// Returns (line, col), both 1-based.
    pub fn lookup(&self, offset: usize) -> (usize, usize) {
        let line = match self.line_starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i.saturating_sub(1),
        };
        let col = offset.saturating_sub(self.line_starts[line]);
        (line + 1, col + 1)
    }

    /// Returns the full text of the given 1-based line number.
    pub fn line_text<'a>(&self, source: &'a str, line: usize) -> &'a str {
        if line == 0 || line > self.line_starts.len() {
            return "";
        }
        let start = self.line_starts[line - 1].min(source.len());
        let end = if line < self.line_starts.len() {
            self.line_starts[line].min(source.len())
        } else {
            source.len()
        };
        let text = source.get(start..end).unwrap_or("");
        text.trim_end_matches('\n').trim_end_matches('\r')
    }
}

// ---- Loaders ----

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("template not found")]
    NotFound { name: String },
    #[error("{source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("template is not valid UTF-8")]
    Utf8 { name: String },
}

impl LoadError {
    pub fn name(&self) -> &str {
        match self {
            LoadError::NotFound { name } | LoadError::Io { name, .. } | LoadError::Utf8 { name } => name,
        }
    }
}

/// Supplies template text by name, for the top-level template and for
/// every `include`.
pub trait SourceLoader {
    fn load(&self, name: &str) -> Result<String, LoadError>;

    /// A loader that resolves names the way they should be resolved from
    /// inside template `name`.
    fn clone_with_target(&self, name: &str) -> Box<dyn SourceLoader>;
}

/// Loads templates from disk. Relative names resolve against the directory
/// of the including template first, then each include directory in order.
#[derive(Debug, Clone, Default)]
pub struct FileLoader {
    base: Option<PathBuf>,
    include_dirs: Vec<PathBuf>,
}

impl FileLoader {
    pub fn new() -> Self {
        FileLoader::default()
    }

    pub fn with_base(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base = Some(dir.into());
        self
    }

    pub fn with_include_dirs(mut self, dirs: impl IntoIterator<Item = PathBuf>) -> Self {
        self.include_dirs.extend(dirs);
        self
    }

    fn resolve(&self, name: &str) -> Option<PathBuf> {
        let path = Path::new(name);
        if path.is_absolute() {
            return path.is_file().then(|| path.to_path_buf());
        }
        self.base
            .iter()
            .chain(self.include_dirs.iter())
            .map(|dir| dir.join(path))
            .find(|candidate| candidate.is_file())
            .or_else(|| (self.base.is_none() && path.is_file()).then(|| path.to_path_buf()))
    }
}

impl SourceLoader for FileLoader {
    fn load(&self, name: &str) -> Result<String, LoadError> {
        let path = self.resolve(name).ok_or_else(|| LoadError::NotFound { name: name.to_string() })?;
        tracing::debug!(name, path = %path.display(), "loading template");
        let bytes = std::fs::read(&path).map_err(|source| LoadError::Io { name: name.to_string(), source })?;
        String::from_utf8(bytes).map_err(|_| LoadError::Utf8 { name: name.to_string() })
    }

    fn clone_with_target(&self, name: &str) -> Box<dyn SourceLoader> {
        let base = self
            .resolve(name)
            .and_then(|p| p.parent().map(Path::to_path_buf))
            .or_else(|| self.base.clone());
        Box::new(FileLoader { base, include_dirs: self.include_dirs.clone() })
    }
}

/// In-memory template set, mainly for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryLoader {
    templates: Arc<HashMap<String, String>>,
}

impl MemoryLoader {
    pub fn new() -> Self {
        MemoryLoader::default()
    }

    pub fn with(mut self, name: impl Into<String>, text: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.templates).insert(name.into(), text.into());
        self
    }
}

impl SourceLoader for MemoryLoader {
    fn load(&self, name: &str) -> Result<String, LoadError> {
        self.templates
            .get(name)
            .cloned()
            .ok_or_else(|| LoadError::NotFound { name: name.to_string() })
    }

    fn clone_with_target(&self, _name: &str) -> Box<dyn SourceLoader> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_line() {
        let src = "<tmpl_var x>";
        let sm = SourceMap::new(src);
        assert_eq!(sm.lookup(0), (1, 1));
        assert_eq!(sm.lookup(2), (1, 3));
        assert_eq!(sm.lookup(12), (1, 13));
    }

    #[test]
    fn multi_line() {
        let src = "line one\nline two\nline three";
        let sm = SourceMap::new(src);
        assert_eq!(sm.lookup(0), (1, 1));
        assert_eq!(sm.lookup(8), (1, 9));
        assert_eq!(sm.lookup(9), (2, 1));
        assert_eq!(sm.lookup(18), (3, 1));
    }

    #[test]
    fn line_text_multi() {
        let src = "first\nsecond\r\nthird";
        let sm = SourceMap::new(src);
        assert_eq!(sm.line_text(src, 1), "first");
        assert_eq!(sm.line_text(src, 2), "second");
        assert_eq!(sm.line_text(src, 3), "third");
        assert_eq!(sm.line_text(src, 0), "");
        assert_eq!(sm.line_text(src, 99), "");
    }

    #[test]
    fn empty_source() {
        let sm = SourceMap::new("");
        assert_eq!(sm.lookup(0), (1, 1));
        assert_eq!(sm.line_text("", 1), "");
    }

    #[test]
    fn offset_at_newline_boundary() {
        let sm = SourceMap::new("ab\ncd\nef");
        assert_eq!(sm.lookup(2), (1, 3));
        assert_eq!(sm.lookup(3), (2, 1));
        assert_eq!(sm.lookup(5), (2, 3));
        assert_eq!(sm.lookup(6), (3, 1));
    }

    #[test]
    fn line_starts_restore_map() {
        let sm = SourceMap::new("a\nb\nc");
        let restored = SourceMap::from_line_starts(sm.line_starts().to_vec());
        assert_eq!(restored, sm);
        assert_eq!(SourceMap::from_line_starts(vec![2]).lookup(3), (2, 2));
    }

    #[test]
    fn memory_loader_finds_templates() {
        let loader = MemoryLoader::new().with("a.tmpl", "A");
        assert_eq!(loader.load("a.tmpl").unwrap(), "A");
        let child = loader.clone_with_target("a.tmpl");
        assert_eq!(child.load("a.tmpl").unwrap(), "A");
        assert!(matches!(loader.load("b.tmpl"), Err(LoadError::NotFound { .. })));
    }

    #[test]
    fn file_loader_resolves_relative_to_target() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("parts")).unwrap();
        std::fs::write(dir.path().join("parts/head.tmpl"), "head").unwrap();
        std::fs::write(dir.path().join("parts/title.tmpl"), "title").unwrap();

        let loader = FileLoader::new().with_base(dir.path());
        assert_eq!(loader.load("parts/head.tmpl").unwrap(), "head");
        assert!(loader.load("title.tmpl").is_err());

        let nested = loader.clone_with_target("parts/head.tmpl");
        assert_eq!(nested.load("title.tmpl").unwrap(), "title");
    }

    #[test]
    fn file_loader_falls_back_to_include_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let lib = tempfile::tempdir().unwrap();
        std::fs::write(lib.path().join("footer.tmpl"), "footer").unwrap();

        let loader = FileLoader::new()
            .with_base(dir.path())
            .with_include_dirs([lib.path().to_path_buf()]);
        assert_eq!(loader.load("footer.tmpl").unwrap(), "footer");
    }

    #[test]
    fn file_loader_rejects_invalid_utf8() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.tmpl"), [0xffu8, 0xfe]).unwrap();
        let loader = FileLoader::new().with_base(dir.path());
        assert!(matches!(loader.load("bad.tmpl"), Err(LoadError::Utf8 { .. })));
    }
}
