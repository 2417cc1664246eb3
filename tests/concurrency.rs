use std::sync::Mutex;

use tmplvm::compile_str;
use tmplvm::syscall::{Logger, SyscallTable};
use tmplvm::value::Value;
use tmplvm::vm::Vm;

fn assert_send_sync<T: Send + Sync>() {}

#[test]
fn shared_types_are_thread_safe() {
    assert_send_sync::<tmplvm::bytecode::Program>();
    assert_send_sync::<SyscallTable>();
    assert_send_sync::<Vm<'static>>();
}

#[test]
fn one_program_many_threads() {
    let text = "<tmpl_foreach xs as x><tmpl_var (x * k)>,</tmpl_foreach>";
    let program = compile_str("t.tmpl", text).unwrap().program;
    let table = SyscallTable::with_builtins();
    let vm = Vm::new(&program, &table);

    std::thread::scope(|s| {
        let handles: Vec<_> = (1..=8i64)
            .map(|k| {
                let vm = &vm;
                s.spawn(move || {
                    let data: Value = serde_json::from_str(&format!(r#"{{"xs": [1, 2, 3], "k": {k}}}"#)).unwrap();
                    (k, vm.render(&data).unwrap())
                })
            })
            .collect();
        for handle in handles {
            let (k, out) = handle.join().unwrap();
            assert_eq!(out, format!("{},{},{},", k, 2 * k, 3 * k));
        }
    });
}

#[test]
fn failed_render_does_not_affect_others() {
    let program = compile_str("t.tmpl", "<tmpl_var (10 div n)>").unwrap().program;
    let table = SyscallTable::with_builtins();
    let vm = Vm::new(&program, &table);

    std::thread::scope(|s| {
        let bad = s.spawn(|| vm.render(&serde_json::from_str(r#"{"n": 0}"#).unwrap()));
        let good = s.spawn(|| vm.render(&serde_json::from_str(r#"{"n": 5}"#).unwrap()));
        assert!(bad.join().unwrap().is_err());
        assert_eq!(good.join().unwrap().unwrap(), "2");
    });
}

#[derive(Default)]
struct Collect(Mutex<Vec<String>>);

impl Logger for Collect {
    fn warn(&self, function: &str, message: &str) {
        self.0.lock().unwrap().push(format!("{function}: {message}"));
    }
}

#[test]
fn logger_is_shared_across_threads() {
    let mut table = SyscallTable::new();
    table.register_fn("note", |args, ret, cx| {
        cx.logger.warn("note", &args[0].to_string());
        *ret = Value::Undefined;
        Ok(())
    });
    let program = tmplvm::parser::compile_source(
        "t.tmpl",
        "<tmpl_var note(id)>",
        &tmplvm::source::MemoryLoader::new(),
        &tmplvm::parser::CompileOptions::for_table(&table),
    )
    .unwrap()
    .program;
    let logger = Collect::default();
    let vm = Vm::new(&program, &table).with_logger(&logger);

    std::thread::scope(|s| {
        for id in 0..4 {
            let vm = &vm;
            s.spawn(move || vm.render(&serde_json::from_str(&format!(r#"{{"id": {id}}}"#)).unwrap()).unwrap());
        }
    });

    let mut seen = logger.0.into_inner().unwrap();
    seen.sort();
    assert_eq!(seen, vec!["note: 0", "note: 1", "note: 2", "note: 3"]);
}
