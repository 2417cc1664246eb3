use std::path::Path;

use tmplvm::parser::{CompileOptions, compile};
use tmplvm::source::{FileLoader, MemoryLoader};
use tmplvm::syscall::SyscallTable;
use tmplvm::value::Value;
use tmplvm::vm::Vm;

fn write(dir: &Path, name: &str, text: &str) {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, text).unwrap();
}

fn render_file(loader: &FileLoader, name: &str, json: &str) -> String {
    let program = compile(name, loader, &CompileOptions::default()).unwrap().program;
    let data: Value = serde_json::from_str(json).unwrap();
    Vm::new(&program, &SyscallTable::with_builtins()).render(&data).unwrap()
}

#[test]
fn include_resolves_next_to_including_file() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "site/page.tmpl", "<tmpl_include 'parts/head.tmpl'>body");
    write(dir.path(), "site/parts/head.tmpl", "[<tmpl_include 'title.tmpl'>]");
    write(dir.path(), "site/parts/title.tmpl", "<tmpl_var title>");

    let loader = FileLoader::new().with_base(dir.path());
    assert_eq!(render_file(&loader, "site/page.tmpl", r#"{"title": "T"}"#), "[T]body");
}

#[test]
fn include_dirs_are_searched_in_order() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "first/common.tmpl", "first");
    write(dir.path(), "second/common.tmpl", "second");
    write(dir.path(), "second/only.tmpl", "only");
    write(dir.path(), "app/main.tmpl", "<tmpl_include 'common.tmpl'>+<tmpl_include 'only.tmpl'>");

    let loader = FileLoader::new()
        .with_base(dir.path().join("app"))
        .with_include_dirs([dir.path().join("first"), dir.path().join("second")]);
    assert_eq!(render_file(&loader, "main.tmpl", "{}"), "first+only");
}

#[test]
fn included_blocks_are_callable() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "macros.tmpl", r#"<tmpl_block "bold" args(t)><b><tmpl_var t></b></tmpl_block>"#);
    write(dir.path(), "page.tmpl", r#"<tmpl_include "macros.tmpl"><tmpl_call "bold" args(name)>"#);

    let loader = FileLoader::new().with_base(dir.path());
    assert_eq!(render_file(&loader, "page.tmpl", r#"{"name": "x"}"#), "<b>x</b>");
}

#[test]
fn include_inside_loop_sees_iterator_data() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "row.tmpl", "<tmpl_var id>,");
    write(dir.path(), "list.tmpl", "<tmpl_foreach rows as r><tmpl_include 'row.tmpl'></tmpl_foreach>");

    let loader = FileLoader::new().with_base(dir.path());
    assert_eq!(render_file(&loader, "list.tmpl", r#"{"rows": [{"id": 1}, {"id": 2}]}"#), "1,2,");
}

#[test]
fn missing_include_names_file_and_position() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "page.tmpl", "line\n  <tmpl_include 'nope.tmpl'>");

    let loader = FileLoader::new().with_base(dir.path());
    let e = compile("page.tmpl", &loader, &CompileOptions::default()).unwrap_err();
    assert_eq!(e.code, "TMPL-P016");
    assert_eq!(e.file, "page.tmpl");
    assert_eq!((e.line, e.column), (2, 3));
    assert!(e.message.contains("nope.tmpl"), "{}", e.message);
}

#[test]
fn missing_top_level_template() {
    let dir = tempfile::tempdir().unwrap();
    let loader = FileLoader::new().with_base(dir.path());
    let e = compile("absent.tmpl", &loader, &CompileOptions::default()).unwrap_err();
    assert_eq!(e.code, "TMPL-P016");
    assert!(e.message.contains("absent.tmpl"));
}

#[test]
fn recursive_include_hits_depth_limit() {
    let loader = MemoryLoader::new().with("self.tmpl", "x<tmpl_include 'self.tmpl'>");
    let options = CompileOptions { max_include_depth: 4, ..CompileOptions::default() };
    let e = compile("self.tmpl", &loader, &options).unwrap_err();
    assert_eq!(e.code, "TMPL-P016");
}

#[test]
fn runtime_error_points_into_included_file() {
    let loader = MemoryLoader::new()
        .with("main.tmpl", "ok\n<tmpl_include 'calc.tmpl'>")
        .with("calc.tmpl", "\n\n  <tmpl_var (a div b)>");
    let program = compile("main.tmpl", &loader, &CompileOptions::default()).unwrap().program;
    let data: Value = serde_json::from_str(r#"{"a": 1, "b": 0}"#).unwrap();
    let e = Vm::new(&program, &SyscallTable::with_builtins()).render(&data).unwrap_err();
    let pos = e.position.expect("position");
    assert_eq!(pos.file, "calc.tmpl");
    assert_eq!(pos.line, 3);
}
