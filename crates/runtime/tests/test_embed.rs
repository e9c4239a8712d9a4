//! The host embedding surface: require/load through the VFS, native
//! registration, invoke entry points, globals, userdata lifecycle.

mod common;
use common::*;
use ruse_runtime::{Config, Flow, Interp, MemVfs, NativeArgs, Value, Vm};
use std::cell::Cell;
use std::rc::Rc;

fn interp_with_files(files: &[(&str, &str)]) -> Interp {
    let mut vfs = MemVfs::new();
    for (path, content) in files {
        vfs = vfs.add(*path, *content);
    }
    let mut interp = Interp::new(Config { vfs: Some(Box::new(vfs)), ..Config::default() });
    interp.open_base().expect("open_base");
    interp
}

#[test]
fn test_require_loads_once() {
    let mut interp = interp_with_files(&[
        ("/lib/foo.rse", "def foo\n 3\nend"),
        ("/lib/bar.rse", "def bar\n 5\nend"),
    ]);
    interp.add_search_path("/lib");
    assert_bool(&mut interp, "require(\"foo\")", true);
    assert_int(&mut interp, "foo()", 3);
    // second require is a no-op returning false
    assert_bool(&mut interp, "require(\"foo\")", false);
    assert_int(&mut interp, "foo()", 3);
    // the .rse suffix is stripped before resolution
    assert_bool(&mut interp, "require(\"bar.rse\")", true);
    assert_int(&mut interp, "bar()", 5);
}

#[test]
fn test_load_rereads_every_time() {
    let mut interp = interp_with_files(&[("/lib/counted.rse", "hits = hits + 1")]);
    interp.add_search_path("/lib");
    eval(&mut interp, "hits = 0");
    assert_bool(&mut interp, "load(\"counted\")", true);
    assert_bool(&mut interp, "load(\"counted\")", true);
    assert_int(&mut interp, "hits", 2);
}

#[test]
fn test_require_missing_file() {
    let mut interp = interp_with_files(&[]);
    let err = eval_err(&mut interp, "require(\"nope\")");
    assert_eq!(err.kind, "RuntimeError");
    assert!(err.message.contains("cannot load"), "got: {}", err.message);
}

#[test]
fn test_search_path_order() {
    let mut interp = interp_with_files(&[
        ("/a/mod.rse", "which = \"a\""),
        ("/b/mod.rse", "which = \"b\""),
    ]);
    interp.add_search_path("/a");
    interp.add_search_path("/b");
    eval(&mut interp, "require(\"mod\")");
    assert_str(&mut interp, "which", "a");
}

#[test]
fn test_require_on_disk() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("disk.rse"), "def from_disk\n 11\nend").unwrap();
    let vfs = ruse_runtime::DirVfs::new(dir.path());
    let mut interp = Interp::new(Config { vfs: Some(Box::new(vfs)), ..Config::default() });
    interp.open_base().unwrap();
    interp.add_search_path("");
    assert_bool(&mut interp, "require(\"disk\")", true);
    assert_int(&mut interp, "from_disk()", 11);
}

fn host_add(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    match (a.args.first(), a.args.get(1)) {
        (Some(Value::Int(x)), Some(Value::Int(y))) => Ok(Value::Int(x + y)),
        _ => Ok(Value::Nil),
    }
}

#[test]
fn test_register_function() {
    let mut interp = new_interp();
    interp.register_function("host_add", host_add);
    assert_int(&mut interp, "host_add(40, 2)", 42);
    // natives participate in normal dispatch, so blocks can use them
    assert_ints(&mut interp, "[1, 2].map { |x| host_add(x, 10) }", &[11, 12]);
}

#[test]
fn test_invoke_global() {
    let mut interp = new_interp();
    eval(&mut interp, "def fma(a, b, c); a * b + c; end");
    let out = interp.invoke_global("fma", &[Value::Int(3), Value::Int(4), Value::Int(5)]).unwrap();
    assert!(matches!(out, Value::Int(17)));
    let err = interp.invoke_global("no_such_fn", &[]).unwrap_err();
    assert_eq!(err.kind, "NoMethodError");
}

#[test]
fn test_invoke_method() {
    let mut interp = new_interp();
    let recv = eval(&mut interp, "class Greeter; def hi(name); \"hi \" + name; end; end; Greeter.new");
    let name = interp.str_value("ann");
    let out = interp.invoke_method(&recv, "hi", &[name]).unwrap();
    let Value::Str(s) = out else { panic!("expected string") };
    assert_eq!(s.borrow().as_str_lossy(), "hi ann");
}

#[test]
fn test_define_class_and_method_from_host() {
    let mut interp = new_interp();
    let class = interp.define_class("HostThing", None).unwrap();
    interp.define_method(&class, "doubled", |vm, a| {
        let Some(Value::Int(x)) = a.args.first() else {
            return Ok(Value::Nil);
        };
        let _ = vm;
        Ok(Value::Int(x * 2))
    }).unwrap();
    assert_int(&mut interp, "HostThing.new.doubled(21)", 42);
}

#[test]
fn test_globals_roundtrip() {
    let mut interp = new_interp();
    interp.set_global("from_host", Value::Int(9));
    assert_int(&mut interp, "from_host + 1", 10);
    eval(&mut interp, "back = 123");
    assert!(matches!(interp.get_global("back"), Some(Value::Int(123))));
    assert!(interp.get_global("never_set").is_none());
}

fn host_yield(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    let value = a.args.first().cloned().unwrap_or(Value::Nil);
    Err(vm.native_yield(value))
}

#[test]
fn test_native_yield_suspends_fiber() {
    let mut interp = new_interp();
    interp.register_function("host_yield", host_yield);
    assert_int(&mut interp, "f = Fiber.new { host_yield(7); 5 }; f.resume", 7);
    assert_int(&mut interp, "f.resume", 5);
    // outside a fiber it is an error
    let err = eval_err(&mut interp, "host_yield(1)");
    assert!(err.message.contains("root fiber"));
}

#[test]
fn test_userdata_finalizer_runs_once_at_collection() {
    let mut interp = new_interp();
    let flag = Rc::new(Cell::new(0));
    let probe = flag.clone();
    let ud = interp.new_userdata(16, Some(Box::new(move |_| probe.set(probe.get() + 1))));
    interp.set_global("handle", ud.clone());
    drop(ud);
    assert_eq!(flag.get(), 0, "still referenced by the global");
    interp.set_global("handle", Value::Nil);
    assert_eq!(flag.get(), 1, "finalizer at last reference drop");
}

#[test]
fn test_userdata_tombstoning() {
    let mut interp = new_interp();
    let flag = Rc::new(Cell::new(0));
    let probe = flag.clone();
    let mut external = 7u8;
    let ud = interp.wrap_userdata(&mut external as *mut u8, Some(Box::new(move |_| {
        probe.set(probe.get() + 1);
    })));
    let Value::UserData(inner) = &ud else { panic!("expected userdata") };
    assert!(!inner.ptr().is_null());
    interp.invalidate_userdata(&ud).unwrap();
    assert_eq!(flag.get(), 1, "finalizer at invalidation");
    assert!(inner.ptr().is_null(), "tombstoned pointer reads as null");
    drop(ud);
    assert_eq!(flag.get(), 1, "not finalized twice");
}

#[test]
fn test_userdata_is_a_value() {
    let mut interp = new_interp();
    let ud = interp.new_userdata(4, None);
    interp.set_global("blob", ud);
    assert_str(&mut interp, "blob.class.name", "UserData");
    assert_bool(&mut interp, "blob.nil?", false);
}

#[test]
fn test_free_runs_finalizers() {
    let flag = Rc::new(Cell::new(0));
    {
        let mut interp = new_interp();
        let probe = flag.clone();
        let ud = interp.new_userdata(8, Some(Box::new(move |_| probe.set(probe.get() + 1))));
        interp.set_global("held", ud);
        // interp dropped here with the userdata still referenced
    }
    assert_eq!(flag.get(), 1, "finalizer at interpreter teardown");
}

#[test]
fn test_output_capture() {
    let mut interp = new_interp();
    // Vec<u8> writer captures puts/print
    struct Sink(Rc<std::cell::RefCell<Vec<u8>>>);
    impl std::io::Write for Sink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
    let buffer = Rc::new(std::cell::RefCell::new(Vec::new()));
    interp.set_output(Box::new(Sink(buffer.clone())));
    eval(&mut interp, "puts \"hello\"\nputs 42\nprint \"a\", \"b\"\nputs nil");
    let text = String::from_utf8(buffer.borrow().clone()).unwrap();
    assert_eq!(text, "hello\n42\nab\n");
}
