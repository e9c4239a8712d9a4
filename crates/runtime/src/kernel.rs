//! The primitive kernel
//!
//! `open_base` installs two layers: native methods for everything a
//! script cannot express itself (I/O, reflection, coercion, container
//! primitives, fibers), and a bytecode prelude for the enumerable layer
//! that *is* expressible — iterators compiled from source keep user
//! blocks free of native frames, so `Fiber.yield` works inside them.
//!
//! Native iterators that do take blocks (`array_map`) go through
//! [`Vm::call_block`] and handle every [`BlockSignal`]: a `break` value
//! becomes the iterator's own return value, `redo` re-invokes with the
//! same element.

use crate::interp::{class_of_value, Interp};
use crate::object::{
    ancestors, has_ancestor, lookup_method, ClassRef, MethodKind, MethodRecord, NativeMethod,
    Visibility,
};
use crate::value::{BoundMethod, FiberRef, HashKey, Value};
use crate::vfs;
use crate::vm::{BlockSignal, Flow, NativeArgs, NativeFn, Vm};
use ruse_core::{ErrorInfo, ExcKind, Symbol};
use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

const PRELUDE: &str = include_str!("prelude.rse");

/// Install the kernel into a fresh interpreter.
pub fn install(interp: &mut Interp) -> Result<(), ErrorInfo> {
    install_globals(interp);
    install_object(interp);
    install_module(interp);
    install_string(interp);
    install_array(interp);
    install_hash(interp);
    install_numeric(interp);
    install_range(interp);
    install_misc(interp);
    install_fiber(interp)?;
    interp.epoch += 1;
    interp.eval(PRELUDE, "<prelude>")?;
    Ok(())
}

fn def(interp: &mut Interp, class: &ClassRef, name: &'static str, f: NativeFn) {
    let sym = interp.symbols.intern(name);
    class
        .borrow_mut()
        .methods
        .insert(sym, MethodRecord::public(MethodKind::Native(NativeMethod { name, f })));
}

// ---- argument helpers ----

fn arg(a: &NativeArgs<'_>, i: usize) -> Value {
    a.args.get(i).cloned().unwrap_or(Value::Nil)
}

fn want_args(vm: &mut Vm<'_>, a: &NativeArgs<'_>, n: usize) -> Result<(), Flow> {
    if a.args.len() < n {
        return Err(vm.raise(
            ExcKind::ArgumentError,
            format!("wrong number of arguments (given {}, expected {})", a.args.len(), n),
        ));
    }
    Ok(())
}

fn want_int(vm: &mut Vm<'_>, value: &Value, what: &str) -> Result<i64, Flow> {
    match value {
        Value::Int(v) => Ok(*v),
        other => Err(vm.raise(
            ExcKind::TypeError,
            format!("{what} must be an Integer, got {}", other.kind_name()),
        )),
    }
}

fn want_block(vm: &mut Vm<'_>, a: &NativeArgs<'_>) -> Result<Value, Flow> {
    match &a.block {
        Some(block) => Ok(block.clone()),
        None => Err(vm.raise(ExcKind::ArgumentError, "no block given")),
    }
}

fn sym_from(vm: &mut Vm<'_>, value: &Value) -> Result<Symbol, Flow> {
    match value {
        Value::Symbol(s) => Ok(*s),
        Value::Str(s) => {
            let text = s.borrow().as_str_lossy().into_owned();
            Ok(vm.intern(&text))
        }
        other => Err(vm.raise(
            ExcKind::TypeError,
            format!("{} is not a symbol or string", other.kind_name()),
        )),
    }
}

// ---- kernel globals ----

fn install_globals(interp: &mut Interp) {
    let object = interp.core.object.clone();
    def(interp, &object, "puts", native_puts);
    def(interp, &object, "print", native_print);
    def(interp, &object, "len", native_len);
    def(interp, &object, "raise", native_raise);
    def(interp, &object, "require", native_require);
    def(interp, &object, "load", native_load);
    def(interp, &object, "rand", native_rand);
    def(interp, &object, "Integer", native_to_integer);
    def(interp, &object, "Float", native_to_float);
    def(interp, &object, "String", native_to_string);
    def(interp, &object, "array_map", native_array_map);
    def(interp, &object, "lambda", native_lambda);
    def(interp, &object, "proc", native_lambda);
    def(interp, &object, "block_given?", native_block_given);
    def(interp, &object, "__method__", native_current_method);
}

fn native_puts(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    if a.args.is_empty() {
        let _ = writeln!(vm.interp.out);
    }
    for value in a.args {
        match value {
            Value::Array(arr) => {
                let elems = arr.borrow().elems.clone();
                for elem in elems {
                    let text = vm.display(&elem)?;
                    let _ = writeln!(vm.interp.out, "{text}");
                }
            }
            other => {
                let text = vm.display(other)?;
                let _ = writeln!(vm.interp.out, "{text}");
            }
        }
    }
    Ok(Value::Nil)
}

fn native_print(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    for value in a.args {
        let text = vm.display(value)?;
        let _ = write!(vm.interp.out, "{text}");
    }
    Ok(Value::Nil)
}

fn native_len(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    want_args(vm, &a, 1)?;
    value_len(vm, &a.args[0])
}

fn value_len(vm: &mut Vm<'_>, value: &Value) -> Result<Value, Flow> {
    match value {
        Value::Str(s) => Ok(Value::Int(s.borrow().bytes.len() as i64)),
        Value::Array(arr) => Ok(Value::Int(arr.borrow().elems.len() as i64)),
        Value::Hash(h) => Ok(Value::Int(h.borrow().entries.len() as i64)),
        Value::Range(r) => match (&r.start, &r.end) {
            (Value::Int(a), Value::Int(b)) => {
                let span = if r.exclusive { b - a } else { b - a + 1 };
                Ok(Value::Int(span.max(0)))
            }
            _ => Err(vm.raise(ExcKind::TypeError, "can't take the length of this range")),
        },
        other => Err(vm.raise(
            ExcKind::TypeError,
            format!("no length for {}", other.kind_name()),
        )),
    }
}

fn native_raise(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    match a.args {
        [] => match vm.interp.current_exc.clone() {
            Some(exc) => Err(vm.raise_value(exc)),
            None => Err(vm.raise(ExcKind::RuntimeError, "unhandled exception")),
        },
        [Value::Str(s)] => {
            let message = s.borrow().as_str_lossy().into_owned();
            Err(vm.raise(ExcKind::RuntimeError, message))
        }
        [Value::Class(class)] => {
            let message = vm.sym_name(class.borrow().name).to_string();
            Err(vm.raise_in_class(class.clone(), message))
        }
        [Value::Class(class), Value::Str(msg)] => {
            let message = msg.borrow().as_str_lossy().into_owned();
            Err(vm.raise_in_class(class.clone(), message))
        }
        [exc @ Value::Object(_)] => Err(vm.raise_value(exc.clone())),
        _ => Err(vm.raise(ExcKind::TypeError, "exception class or message expected")),
    }
}

fn require_path(vm: &mut Vm<'_>, a: &NativeArgs<'_>) -> Result<String, Flow> {
    want_args(vm, a, 1)?;
    match &a.args[0] {
        Value::Str(s) => Ok(s.borrow().as_str_lossy().into_owned()),
        other => Err(vm.raise(
            ExcKind::TypeError,
            format!("path must be a String, got {}", other.kind_name()),
        )),
    }
}

fn load_file(vm: &mut Vm<'_>, request: &str, once: bool) -> Result<Value, Flow> {
    let Some(vfs) = vm.interp.vfs.as_deref() else {
        return Err(vm.raise(ExcKind::RuntimeError, "no file system configured"));
    };
    let Some(resolved) = vfs::resolve(vfs, &vm.interp.search_paths, request) else {
        return Err(vm.raise(
            ExcKind::RuntimeError,
            format!("cannot load such file -- {request}"),
        ));
    };
    if once && vm.interp.already_loaded(&resolved) {
        return Ok(Value::Bool(false));
    }
    let Some(bytes) = vm.interp.vfs.as_deref().and_then(|v| v.read(&resolved)) else {
        return Err(vm.raise(
            ExcKind::RuntimeError,
            format!("cannot read file -- {resolved}"),
        ));
    };
    let source = String::from_utf8_lossy(&bytes).into_owned();
    // marked before running so recursive requires terminate
    if once {
        vm.interp.mark_loaded(&resolved);
    }
    tracing::debug!(target: "ruse::require", path = %resolved, "loading");
    let proto = match ruse_compiler::compile(&source, &resolved, &mut vm.interp.symbols) {
        Ok(proto) => proto,
        Err(err) => {
            return Err(vm.raise(ExcKind::RuntimeError, err.to_string()));
        }
    };
    let main = vm.interp.main.clone();
    let func = Rc::new(crate::value::FunctionData::for_proto(proto, main, None));
    vm.run_toplevel_nested(func)?;
    Ok(Value::Bool(true))
}

fn native_require(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    let request = require_path(vm, &a)?;
    load_file(vm, &request, true)
}

fn native_load(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    let request = require_path(vm, &a)?;
    load_file(vm, &request, false)
}

fn native_rand(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    let mut x = vm.interp.rng_state;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    vm.interp.rng_state = x;
    match a.args.first() {
        None | Some(Value::Nil) => Ok(Value::Float((x >> 11) as f64 / (1u64 << 53) as f64)),
        Some(Value::Int(n)) if *n > 0 => Ok(Value::Int((x % *n as u64) as i64)),
        Some(Value::Int(_)) => Ok(Value::Int(0)),
        Some(other) => Err(vm.raise(
            ExcKind::ArgumentError,
            format!("invalid argument for rand: {}", other.kind_name()),
        )),
    }
}

fn native_to_integer(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    want_args(vm, &a, 1)?;
    match &a.args[0] {
        Value::Int(v) => Ok(Value::Int(*v)),
        Value::Float(v) => Ok(Value::Int(*v as i64)),
        Value::Str(s) => {
            let text = s.borrow().as_str_lossy().trim().to_string();
            text.parse::<i64>().map(Value::Int).map_err(|_| {
                vm.raise(ExcKind::ArgumentError, format!("invalid value for Integer: \"{text}\""))
            })
        }
        other => Err(vm.raise(
            ExcKind::TypeError,
            format!("can't convert {} into Integer", other.kind_name()),
        )),
    }
}

fn native_to_float(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    want_args(vm, &a, 1)?;
    match &a.args[0] {
        Value::Int(v) => Ok(Value::Float(*v as f64)),
        Value::Float(v) => Ok(Value::Float(*v)),
        Value::Str(s) => {
            let text = s.borrow().as_str_lossy().trim().to_string();
            text.parse::<f64>().map(Value::Float).map_err(|_| {
                vm.raise(ExcKind::ArgumentError, format!("invalid value for Float: \"{text}\""))
            })
        }
        other => Err(vm.raise(
            ExcKind::TypeError,
            format!("can't convert {} into Float", other.kind_name()),
        )),
    }
}

fn native_to_string(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    want_args(vm, &a, 1)?;
    let text = vm.display(&a.args[0])?;
    vm.new_string(text.into_bytes())
}

/// The native-iterator reference implementation: observes all four
/// block outcomes.
fn native_array_map(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    want_args(vm, &a, 1)?;
    let block = want_block(vm, &a)?;
    let Value::Array(arr) = &a.args[0] else {
        return Err(vm.raise(ExcKind::TypeError, "array_map expects an Array"));
    };
    let elems = arr.borrow().elems.clone();
    let mut out = Vec::with_capacity(elems.len());
    let mut i = 0;
    while i < elems.len() {
        match vm.call_block(&block, &[elems[i].clone()])? {
            BlockSignal::Normal(value) => {
                out.push(value);
                i += 1;
            }
            BlockSignal::Break(value) => return Ok(value),
            BlockSignal::Redo => {}
        }
    }
    vm.new_array(out)
}

fn native_lambda(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    want_block(vm, &a)
}

fn native_block_given(vm: &mut Vm<'_>, _a: NativeArgs<'_>) -> Result<Value, Flow> {
    Ok(Value::Bool(vm.caller_block().is_some()))
}

fn native_current_method(vm: &mut Vm<'_>, _a: NativeArgs<'_>) -> Result<Value, Flow> {
    Ok(vm.caller_method().map_or(Value::Nil, Value::Symbol))
}

// ---- Object ----

fn install_object(interp: &mut Interp) {
    let object = interp.core.object.clone();
    def(interp, &object, "class", native_class);
    def(interp, &object, "is_a?", native_is_a);
    def(interp, &object, "kind_of?", native_is_a);
    def(interp, &object, "instance_of?", native_instance_of);
    def(interp, &object, "nil?", native_nil_p);
    def(interp, &object, "respond_to?", native_respond_to);
    def(interp, &object, "send", native_send);
    def(interp, &object, "freeze", native_freeze);
    def(interp, &object, "frozen?", native_frozen_p);
    def(interp, &object, "==", native_eq);
    def(interp, &object, "!=", native_ne);
    def(interp, &object, "equal?", native_equal_p);
    def(interp, &object, "===", native_case_eq_default);
    def(interp, &object, "object_id", native_object_id);
    def(interp, &object, "to_s", native_to_s);
    def(interp, &object, "inspect", native_inspect);
    def(interp, &object, "instance_variable_get", native_ivar_get);
    def(interp, &object, "instance_variable_set", native_ivar_set);
    def(interp, &object, "method", native_method_object);
    def(interp, &object, "extend", native_extend);
    def(interp, &object, "define_singleton_method", native_define_singleton_method);
    def(interp, &object, "dup", native_dup);

    let standard_error = interp.core.standard_error.clone();
    def(interp, &standard_error, "message", native_exc_message);
    def(interp, &standard_error, "to_s", native_exc_message);
}

fn native_class(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    Ok(Value::Class(class_of_value(vm.interp, &a.recv)))
}

fn native_is_a(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    want_args(vm, &a, 1)?;
    let Value::Class(class) = &a.args[0] else {
        return Err(vm.raise(ExcKind::TypeError, "class or module required"));
    };
    Ok(Value::Bool(vm.is_instance_of(&a.recv, class)))
}

fn native_instance_of(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    want_args(vm, &a, 1)?;
    let Value::Class(class) = &a.args[0] else {
        return Err(vm.raise(ExcKind::TypeError, "class required"));
    };
    let mine = class_of_value(vm.interp, &a.recv);
    Ok(Value::Bool(Rc::ptr_eq(&mine, class)))
}

fn native_nil_p(_vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    Ok(Value::Bool(matches!(a.recv, Value::Nil)))
}

fn native_respond_to(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    want_args(vm, &a, 1)?;
    let name = sym_from(vm, &a.args[0])?;
    let class = vm.dispatch_class(&a.recv);
    if lookup_method(&class, name, vm.interp.epoch).is_some() {
        return Ok(Value::Bool(true));
    }
    let rtm = vm.intern("respond_to_missing?");
    if lookup_method(&class, rtm, vm.interp.epoch).is_some() {
        let verdict =
            vm.call_method(&a.recv, rtm, &[Value::Symbol(name), Value::Bool(false)], None)?;
        return Ok(Value::Bool(verdict.truthy()));
    }
    Ok(Value::Bool(false))
}

/// Reflective dispatch; bypasses visibility by design of the embedding
/// contract.
fn native_send(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    want_args(vm, &a, 1)?;
    let name = sym_from(vm, &a.args[0])?;
    vm.call_method(&a.recv, name, &a.args[1..], a.block.clone())
}

fn native_freeze(_vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    match &a.recv {
        Value::Str(s) => s.borrow_mut().meta.frozen = true,
        Value::Array(arr) => arr.borrow_mut().meta.frozen = true,
        Value::Hash(h) => h.borrow_mut().meta.frozen = true,
        Value::Object(o) => o.borrow_mut().meta.frozen = true,
        Value::Class(c) => c.borrow_mut().frozen = true,
        _ => {}
    }
    Ok(a.recv.clone())
}

fn native_frozen_p(_vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    Ok(Value::Bool(a.recv.frozen()))
}

fn native_eq(_vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    Ok(Value::Bool(a.recv.eq_value(&arg(&a, 0))))
}

fn native_ne(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    let rhs = arg(&a, 0);
    let eq = vm.values_equal(&a.recv, &rhs)?;
    Ok(Value::Bool(!eq))
}

fn native_equal_p(_vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    let rhs = arg(&a, 0);
    let same = match (a.recv.identity_ptr(), rhs.identity_ptr()) {
        (Some(x), Some(y)) => x == y,
        (None, None) => a.recv.eq_value(&rhs),
        _ => false,
    };
    Ok(Value::Bool(same))
}

fn native_case_eq_default(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    let rhs = arg(&a, 0);
    let eq = vm.values_equal(&a.recv, &rhs)?;
    Ok(Value::Bool(eq))
}

fn native_object_id(_vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    let id = match a.recv.identity_ptr() {
        Some(ptr) => ptr as i64,
        None => match &a.recv {
            Value::Nil => 0,
            Value::Bool(false) => 1,
            Value::Bool(true) => 2,
            Value::Int(v) => v.wrapping_mul(2).wrapping_add(1),
            Value::Symbol(s) => i64::from(s.id()) << 8,
            Value::Float(v) => v.to_bits() as i64,
            _ => -1,
        },
    };
    Ok(Value::Int(id))
}

fn native_to_s(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    match &a.recv {
        Value::Str(_) => Ok(a.recv.clone()),
        other => {
            let text = vm.display_basic(other);
            vm.new_string(text.into_bytes())
        }
    }
}

fn native_inspect(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    let text = vm.inspect_basic(&a.recv);
    vm.new_string(text.into_bytes())
}

fn ivar_name(vm: &mut Vm<'_>, value: &Value) -> Result<Symbol, Flow> {
    let text = match value {
        Value::Symbol(s) => vm.sym_name(*s).to_string(),
        Value::Str(s) => s.borrow().as_str_lossy().into_owned(),
        other => {
            return Err(vm.raise(
                ExcKind::TypeError,
                format!("{} is not a symbol or string", other.kind_name()),
            ));
        }
    };
    let trimmed = text.trim_start_matches('@');
    Ok(vm.intern(trimmed))
}

fn native_ivar_get(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    want_args(vm, &a, 1)?;
    let name = ivar_name(vm, &a.args[0])?;
    Ok(vm.read_ivar(&a.recv, name))
}

fn native_ivar_set(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    want_args(vm, &a, 2)?;
    let name = ivar_name(vm, &a.args[0])?;
    let value = a.args[1].clone();
    vm.write_ivar(&a.recv, name, value.clone())?;
    Ok(value)
}

fn native_method_object(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    want_args(vm, &a, 1)?;
    let name = sym_from(vm, &a.args[0])?;
    let class = vm.dispatch_class(&a.recv);
    let Some((method, owner)) = lookup_method(&class, name, vm.interp.epoch) else {
        let text = vm.sym_name(name);
        return Err(vm.raise(
            ExcKind::NameError,
            format!("undefined method '{text}' for class"),
        ));
    };
    Ok(Value::Method(Rc::new(BoundMethod { recv: a.recv.clone(), method, owner, name })))
}

fn native_extend(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    want_args(vm, &a, 1)?;
    for module in a.args {
        let Value::Class(module) = module else {
            return Err(vm.raise(ExcKind::TypeError, "wrong argument type (expected Module)"));
        };
        if !module.borrow().is_module {
            return Err(vm.raise(ExcKind::TypeError, "wrong argument type (expected Module)"));
        }
        let singleton = vm.singleton_class_of(&a.recv)?;
        singleton.borrow_mut().includes.push(module.clone());
    }
    vm.interp.epoch += 1;
    Ok(a.recv.clone())
}

fn native_define_singleton_method(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    want_args(vm, &a, 1)?;
    let name = sym_from(vm, &a.args[0])?;
    let callable = match (&a.block, a.args.get(1)) {
        (Some(block), _) => block.clone(),
        (None, Some(Value::Function(f))) => Value::Function(f.clone()),
        _ => return Err(vm.raise(ExcKind::ArgumentError, "no block given")),
    };
    let Value::Function(func) = callable else {
        return Err(vm.raise(ExcKind::TypeError, "callable required"));
    };
    let singleton = vm.singleton_class_of(&a.recv)?;
    singleton
        .borrow_mut()
        .methods
        .insert(name, MethodRecord::public(MethodKind::Bytecode(func)));
    vm.interp.epoch += 1;
    Ok(Value::Symbol(name))
}

fn native_dup(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    match &a.recv {
        Value::Str(s) => {
            let bytes = s.borrow().bytes.clone();
            vm.new_string(bytes)
        }
        Value::Array(arr) => {
            let elems = arr.borrow().elems.clone();
            vm.new_array(elems)
        }
        Value::Hash(h) => {
            let entries = h.borrow().entries.clone();
            vm.new_hash(entries)
        }
        other => Ok(other.clone()),
    }
}

fn native_exc_message(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    let msg = vm.intern("message");
    Ok(vm.read_ivar(&a.recv, msg))
}

// ---- Module / Class ----

fn install_module(interp: &mut Interp) {
    let module = interp.core.module_class.clone();
    def(interp, &module, "name", native_class_name);
    def(interp, &module, "ancestors", native_ancestors);
    def(interp, &module, "superclass", native_superclass);
    def(interp, &module, "attr_reader", native_attr_reader);
    def(interp, &module, "attr_writer", native_attr_writer);
    def(interp, &module, "attr_accessor", native_attr_accessor);
    def(interp, &module, "include", native_include);
    def(interp, &module, "prepend", native_prepend);
    def(interp, &module, "module_function", native_module_function);
    def(interp, &module, "define_method", native_define_method);
    def(interp, &module, "private", native_private);
    def(interp, &module, "public", native_public);
    def(interp, &module, "protected", native_protected);
    def(interp, &module, "===", native_module_case_eq);
    def(interp, &module, "instance_method?", native_method_defined);
    def(interp, &module, "method_defined?", native_method_defined);

    let class = interp.core.class_class.clone();
    def(interp, &class, "new", native_class_new);
}

fn recv_class(vm: &mut Vm<'_>, a: &NativeArgs<'_>) -> Result<ClassRef, Flow> {
    match &a.recv {
        Value::Class(class) => Ok(class.clone()),
        other => Err(vm.raise(
            ExcKind::TypeError,
            format!("expected a class or module, got {}", other.kind_name()),
        )),
    }
}

fn native_class_name(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    let class = recv_class(vm, &a)?;
    let name = vm.sym_name(class.borrow().name).to_string();
    vm.new_string(name.into_bytes())
}

fn native_ancestors(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    let class = recv_class(vm, &a)?;
    let list = ancestors(&class, vm.interp.epoch);
    let values: Vec<Value> = list.iter().map(|c| Value::Class(c.clone())).collect();
    vm.new_array(values)
}

fn native_superclass(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    let class = recv_class(vm, &a)?;
    let parent = class.borrow().superclass.clone();
    Ok(parent.map_or(Value::Nil, Value::Class))
}

fn attr_install(vm: &mut Vm<'_>, a: &NativeArgs<'_>, reader: bool, writer: bool) -> Result<Value, Flow> {
    let class = recv_class(vm, a)?;
    for value in a.args {
        let name = sym_from(vm, value)?;
        let visibility = class.borrow().default_visibility;
        if reader {
            class
                .borrow_mut()
                .methods
                .insert(name, MethodRecord { kind: MethodKind::AttrReader(name), visibility });
        }
        if writer {
            let setter = {
                let text = vm.sym_name(name);
                vm.intern(&format!("{text}="))
            };
            class
                .borrow_mut()
                .methods
                .insert(setter, MethodRecord { kind: MethodKind::AttrWriter(name), visibility });
        }
    }
    vm.interp.epoch += 1;
    Ok(Value::Nil)
}

fn native_attr_reader(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    attr_install(vm, &a, true, false)
}

fn native_attr_writer(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    attr_install(vm, &a, false, true)
}

fn native_attr_accessor(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    attr_install(vm, &a, true, true)
}

fn native_include(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    want_args(vm, &a, 1)?;
    let class = recv_class(vm, &a)?;
    for value in a.args {
        let Value::Class(module) = value else {
            return Err(vm.raise(ExcKind::TypeError, "wrong argument type (expected Module)"));
        };
        if !module.borrow().is_module {
            return Err(vm.raise(ExcKind::TypeError, "wrong argument type (expected Module)"));
        }
        let already = class.borrow().includes.iter().any(|m| Rc::ptr_eq(m, module));
        if !already {
            class.borrow_mut().includes.push(module.clone());
        }
        vm.interp.epoch += 1;
        // M.included(K) hook
        let included = vm.intern("included");
        let module_value = Value::Class(module.clone());
        let mclass = vm.dispatch_class(&module_value);
        if lookup_method(&mclass, included, vm.interp.epoch).is_some() {
            vm.call_method(&module_value, included, &[a.recv.clone()], None)?;
        }
    }
    Ok(a.recv.clone())
}

fn native_prepend(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    want_args(vm, &a, 1)?;
    let class = recv_class(vm, &a)?;
    for value in a.args {
        let Value::Class(module) = value else {
            return Err(vm.raise(ExcKind::TypeError, "wrong argument type (expected Module)"));
        };
        if !module.borrow().is_module {
            return Err(vm.raise(ExcKind::TypeError, "wrong argument type (expected Module)"));
        }
        let already = class.borrow().prepends.iter().any(|m| Rc::ptr_eq(m, module));
        if !already {
            class.borrow_mut().prepends.push(module.clone());
        }
        vm.interp.epoch += 1;
    }
    Ok(a.recv.clone())
}

fn native_module_function(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    let module = recv_class(vm, &a)?;
    if !module.borrow().is_module {
        return Err(vm.raise(ExcKind::TypeError, "module_function outside of module"));
    }
    if a.args.is_empty() {
        // mode form: every following def also lands on the singleton
        module.borrow_mut().module_function_mode = true;
        return Ok(Value::Nil);
    }
    for value in a.args {
        let name = sym_from(vm, value)?;
        let record = module.borrow().methods.get(&name).cloned();
        let Some(record) = record else {
            let text = vm.sym_name(name);
            return Err(vm.raise(
                ExcKind::NameError,
                format!("undefined method '{text}' for module"),
            ));
        };
        let singleton = vm.singleton_class_of(&a.recv)?;
        singleton
            .borrow_mut()
            .methods
            .insert(name, MethodRecord { kind: record.kind, visibility: Visibility::Public });
    }
    vm.interp.epoch += 1;
    Ok(Value::Nil)
}

fn native_define_method(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    want_args(vm, &a, 1)?;
    let class = recv_class(vm, &a)?;
    let name = sym_from(vm, &a.args[0])?;
    let callable = match (&a.block, a.args.get(1)) {
        (Some(block), _) => block.clone(),
        (None, Some(Value::Function(f))) => Value::Function(f.clone()),
        (None, Some(Value::Method(m))) => {
            class.borrow_mut().methods.insert(name, m.method.clone());
            vm.interp.epoch += 1;
            return Ok(Value::Symbol(name));
        }
        _ => return Err(vm.raise(ExcKind::ArgumentError, "no block given")),
    };
    let Value::Function(func) = callable else {
        return Err(vm.raise(ExcKind::TypeError, "callable required"));
    };
    let visibility = class.borrow().default_visibility;
    class
        .borrow_mut()
        .methods
        .insert(name, MethodRecord { kind: MethodKind::Bytecode(func), visibility });
    vm.interp.epoch += 1;
    Ok(Value::Symbol(name))
}

fn set_visibility(vm: &mut Vm<'_>, a: &NativeArgs<'_>, visibility: Visibility) -> Result<Value, Flow> {
    let class = recv_class(vm, a)?;
    if a.args.is_empty() {
        class.borrow_mut().default_visibility = visibility;
        return Ok(Value::Nil);
    }
    for value in a.args {
        let name = sym_from(vm, value)?;
        let mut class = class.borrow_mut();
        if let Some(record) = class.methods.get_mut(&name) {
            record.visibility = visibility;
        }
    }
    vm.interp.epoch += 1;
    Ok(Value::Nil)
}

fn native_private(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    set_visibility(vm, &a, Visibility::Private)
}

fn native_public(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    set_visibility(vm, &a, Visibility::Public)
}

fn native_protected(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    set_visibility(vm, &a, Visibility::Protected)
}

/// `Klass === value` is the `case`/`when` and rescue filter test.
fn native_module_case_eq(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    let class = recv_class(vm, &a)?;
    let subject = arg(&a, 0);
    Ok(Value::Bool(vm.is_instance_of(&subject, &class)))
}

fn native_method_defined(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    want_args(vm, &a, 1)?;
    let class = recv_class(vm, &a)?;
    let name = sym_from(vm, &a.args[0])?;
    Ok(Value::Bool(lookup_method(&class, name, vm.interp.epoch).is_some()))
}

fn native_class_new(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    let class = recv_class(vm, &a)?;
    if class.borrow().is_module {
        return Err(vm.raise(ExcKind::TypeError, "modules cannot be instantiated"));
    }
    let obj = vm.new_object(class.clone())?;
    // exception classes take their message positionally
    let is_exception =
        has_ancestor(&class, &vm.interp.core.standard_error.clone(), vm.interp.epoch);
    if is_exception {
        let message = match a.args.first() {
            Some(Value::Str(s)) => s.borrow().as_str_lossy().into_owned(),
            _ => vm.sym_name(class.borrow().name).to_string(),
        };
        let msg_sym = vm.intern("message");
        let msg_value = vm.new_string(message.into_bytes())?;
        vm.write_ivar(&obj, msg_sym, msg_value)?;
    }
    let initialize = vm.intern("initialize");
    let dispatch = vm.dispatch_class(&obj);
    if lookup_method(&dispatch, initialize, vm.interp.epoch).is_some() {
        vm.call_method(&obj, initialize, a.args, a.block.clone())?;
    }
    Ok(obj)
}

// ---- String ----

fn install_string(interp: &mut Interp) {
    let string = interp.core.string.clone();
    def(interp, &string, "length", native_str_length);
    def(interp, &string, "size", native_str_length);
    def(interp, &string, "empty?", native_str_empty);
    def(interp, &string, "to_i", native_str_to_i);
    def(interp, &string, "to_f", native_str_to_f);
    def(interp, &string, "to_sym", native_str_to_sym);
    def(interp, &string, "upcase", native_str_upcase);
    def(interp, &string, "downcase", native_str_downcase);
    def(interp, &string, "chars", native_str_chars);
    def(interp, &string, "split", native_str_split);
    def(interp, &string, "index", native_str_index);
    def(interp, &string, "include?", native_str_include);
    def(interp, &string, "start_with?", native_str_start_with);
    def(interp, &string, "end_with?", native_str_end_with);
    def(interp, &string, "strip", native_str_strip);
    def(interp, &string, "reverse", native_str_reverse);
    def(interp, &string, "sub", native_str_sub);
    def(interp, &string, "gsub", native_str_gsub);
}

fn str_bytes(vm: &mut Vm<'_>, value: &Value) -> Result<Vec<u8>, Flow> {
    match value {
        Value::Str(s) => Ok(s.borrow().bytes.clone()),
        other => Err(vm.raise(
            ExcKind::TypeError,
            format!("no implicit conversion of {} into String", other.kind_name()),
        )),
    }
}

fn native_str_length(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    let bytes = str_bytes(vm, &a.recv)?;
    Ok(Value::Int(bytes.len() as i64))
}

fn native_str_empty(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    let bytes = str_bytes(vm, &a.recv)?;
    Ok(Value::Bool(bytes.is_empty()))
}

fn native_str_to_i(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    let bytes = str_bytes(vm, &a.recv)?;
    let text = String::from_utf8_lossy(&bytes);
    let trimmed = text.trim();
    // leading numeric prefix, 0 when none
    let mut end = 0;
    for (i, c) in trimmed.char_indices() {
        if c.is_ascii_digit() || (i == 0 && (c == '-' || c == '+')) {
            end = i + c.len_utf8();
        } else {
            break;
        }
    }
    Ok(Value::Int(trimmed[..end].parse().unwrap_or(0)))
}

fn native_str_to_f(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    let bytes = str_bytes(vm, &a.recv)?;
    let text = String::from_utf8_lossy(&bytes);
    Ok(Value::Float(text.trim().parse().unwrap_or(0.0)))
}

fn native_str_to_sym(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    let bytes = str_bytes(vm, &a.recv)?;
    let text = String::from_utf8_lossy(&bytes).into_owned();
    Ok(Value::Symbol(vm.intern(&text)))
}

fn native_str_upcase(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    let mut bytes = str_bytes(vm, &a.recv)?;
    bytes.make_ascii_uppercase();
    vm.new_string(bytes)
}

fn native_str_downcase(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    let mut bytes = str_bytes(vm, &a.recv)?;
    bytes.make_ascii_lowercase();
    vm.new_string(bytes)
}

fn native_str_chars(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    let bytes = str_bytes(vm, &a.recv)?;
    let mut out = Vec::with_capacity(bytes.len());
    for b in bytes {
        out.push(vm.new_string(vec![b])?);
    }
    vm.new_array(out)
}

fn native_str_split(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    let bytes = str_bytes(vm, &a.recv)?;
    let text = String::from_utf8_lossy(&bytes).into_owned();
    let parts: Vec<&str> = match a.args.first() {
        None | Some(Value::Nil) => text.split_ascii_whitespace().collect(),
        Some(Value::Str(sep)) => {
            let sep = sep.borrow().as_str_lossy().into_owned();
            text.split(sep.as_str()).collect()
        }
        Some(other) => {
            return Err(vm.raise(
                ExcKind::TypeError,
                format!("bad separator: {}", other.kind_name()),
            ));
        }
    };
    let mut out = Vec::with_capacity(parts.len());
    for part in parts {
        out.push(vm.new_string(part.as_bytes().to_vec())?);
    }
    vm.new_array(out)
}

fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn native_str_index(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    want_args(vm, &a, 1)?;
    let haystack = str_bytes(vm, &a.recv)?;
    let needle = str_bytes(vm, &a.args[0])?;
    Ok(find_bytes(&haystack, &needle).map_or(Value::Nil, |i| Value::Int(i as i64)))
}

fn native_str_include(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    want_args(vm, &a, 1)?;
    let haystack = str_bytes(vm, &a.recv)?;
    let needle = str_bytes(vm, &a.args[0])?;
    Ok(Value::Bool(find_bytes(&haystack, &needle).is_some()))
}

fn native_str_start_with(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    want_args(vm, &a, 1)?;
    let haystack = str_bytes(vm, &a.recv)?;
    let needle = str_bytes(vm, &a.args[0])?;
    Ok(Value::Bool(haystack.starts_with(&needle)))
}

fn native_str_end_with(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    want_args(vm, &a, 1)?;
    let haystack = str_bytes(vm, &a.recv)?;
    let needle = str_bytes(vm, &a.args[0])?;
    Ok(Value::Bool(haystack.ends_with(&needle)))
}

fn native_str_strip(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    let bytes = str_bytes(vm, &a.recv)?;
    let text = String::from_utf8_lossy(&bytes);
    vm.new_string(text.trim().as_bytes().to_vec())
}

fn native_str_reverse(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    let mut bytes = str_bytes(vm, &a.recv)?;
    bytes.reverse();
    vm.new_string(bytes)
}

fn str_replace(
    vm: &mut Vm<'_>,
    a: &NativeArgs<'_>,
    all: bool,
) -> Result<Value, Flow> {
    want_args(vm, a, 2)?;
    let haystack = str_bytes(vm, &a.recv)?;
    let pattern = str_bytes(vm, &a.args[0])?;
    let replacement = str_bytes(vm, &a.args[1])?;
    if pattern.is_empty() {
        return vm.new_string(haystack);
    }
    let mut out = Vec::with_capacity(haystack.len());
    let mut i = 0;
    let mut replaced = false;
    while i < haystack.len() {
        if (!replaced || all) && haystack[i..].starts_with(&pattern) {
            out.extend_from_slice(&replacement);
            i += pattern.len();
            replaced = true;
        } else {
            out.push(haystack[i]);
            i += 1;
        }
    }
    vm.new_string(out)
}

fn native_str_sub(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    str_replace(vm, &a, false)
}

fn native_str_gsub(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    str_replace(vm, &a, true)
}

// ---- Array ----

fn install_array(interp: &mut Interp) {
    let array = interp.core.array.clone();
    def(interp, &array, "length", native_arr_length);
    def(interp, &array, "size", native_arr_length);
    def(interp, &array, "empty?", native_arr_empty);
    def(interp, &array, "push", native_arr_push);
    def(interp, &array, "pop", native_arr_pop);
    def(interp, &array, "shift", native_arr_shift);
    def(interp, &array, "unshift", native_arr_unshift);
    def(interp, &array, "first", native_arr_first);
    def(interp, &array, "last", native_arr_last);
    def(interp, &array, "join", native_arr_join);
    def(interp, &array, "reverse", native_arr_reverse);
    def(interp, &array, "include?", native_arr_include);
    def(interp, &array, "index", native_arr_index);
    def(interp, &array, "delete", native_arr_delete);
    def(interp, &array, "concat", native_arr_concat);
    def(interp, &array, "clear", native_arr_clear);
    def(interp, &array, "sort", native_arr_sort);
    def(interp, &array, "flatten", native_arr_flatten);
    def(interp, &array, "uniq", native_arr_uniq);
    def(interp, &array, "compact", native_arr_compact);
}

fn recv_array(vm: &mut Vm<'_>, a: &NativeArgs<'_>) -> Result<crate::value::ArrayRef, Flow> {
    match &a.recv {
        Value::Array(arr) => Ok(arr.clone()),
        other => Err(vm.raise(
            ExcKind::TypeError,
            format!("expected an Array, got {}", other.kind_name()),
        )),
    }
}

fn native_arr_length(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    let arr = recv_array(vm, &a)?;
    let len = arr.borrow().elems.len();
    Ok(Value::Int(len as i64))
}

fn native_arr_empty(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    let arr = recv_array(vm, &a)?;
    let empty = arr.borrow().elems.is_empty();
    Ok(Value::Bool(empty))
}

fn native_arr_push(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    let arr = recv_array(vm, &a)?;
    vm.check_frozen(&a.recv)?;
    for value in a.args {
        arr.borrow_mut().elems.push(value.clone());
    }
    Ok(a.recv.clone())
}

fn native_arr_pop(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    let arr = recv_array(vm, &a)?;
    vm.check_frozen(&a.recv)?;
    let popped = arr.borrow_mut().elems.pop();
    Ok(popped.unwrap_or(Value::Nil))
}

fn native_arr_shift(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    let arr = recv_array(vm, &a)?;
    vm.check_frozen(&a.recv)?;
    let mut arr = arr.borrow_mut();
    if arr.elems.is_empty() {
        Ok(Value::Nil)
    } else {
        Ok(arr.elems.remove(0))
    }
}

fn native_arr_unshift(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    let arr = recv_array(vm, &a)?;
    vm.check_frozen(&a.recv)?;
    for value in a.args.iter().rev() {
        arr.borrow_mut().elems.insert(0, value.clone());
    }
    Ok(a.recv.clone())
}

fn native_arr_first(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    let arr = recv_array(vm, &a)?;
    match a.args.first() {
        None => Ok(arr.borrow().elems.first().cloned().unwrap_or(Value::Nil)),
        Some(n) => {
            let n = want_int(vm, n, "count")?.max(0) as usize;
            let elems: Vec<Value> = arr.borrow().elems.iter().take(n).cloned().collect();
            vm.new_array(elems)
        }
    }
}

fn native_arr_last(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    let arr = recv_array(vm, &a)?;
    match a.args.first() {
        None => Ok(arr.borrow().elems.last().cloned().unwrap_or(Value::Nil)),
        Some(n) => {
            let n = want_int(vm, n, "count")?.max(0) as usize;
            let elems = arr.borrow().elems.clone();
            let skip = elems.len().saturating_sub(n);
            vm.new_array(elems[skip..].to_vec())
        }
    }
}

fn native_arr_join(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    let arr = recv_array(vm, &a)?;
    let sep = match a.args.first() {
        Some(Value::Str(s)) => s.borrow().as_str_lossy().into_owned(),
        _ => String::new(),
    };
    let elems = arr.borrow().elems.clone();
    let mut parts = Vec::with_capacity(elems.len());
    for elem in &elems {
        parts.push(vm.display(elem)?);
    }
    vm.new_string(parts.join(&sep).into_bytes())
}

fn native_arr_reverse(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    let arr = recv_array(vm, &a)?;
    let mut elems = arr.borrow().elems.clone();
    elems.reverse();
    vm.new_array(elems)
}

fn native_arr_include(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    want_args(vm, &a, 1)?;
    let arr = recv_array(vm, &a)?;
    let needle = &a.args[0];
    let elems = arr.borrow().elems.clone();
    for elem in &elems {
        if vm.values_equal(elem, needle)? {
            return Ok(Value::Bool(true));
        }
    }
    Ok(Value::Bool(false))
}

fn native_arr_index(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    want_args(vm, &a, 1)?;
    let arr = recv_array(vm, &a)?;
    let needle = &a.args[0];
    let elems = arr.borrow().elems.clone();
    for (i, elem) in elems.iter().enumerate() {
        if vm.values_equal(elem, needle)? {
            return Ok(Value::Int(i as i64));
        }
    }
    Ok(Value::Nil)
}

fn native_arr_delete(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    want_args(vm, &a, 1)?;
    let arr = recv_array(vm, &a)?;
    vm.check_frozen(&a.recv)?;
    let needle = a.args[0].clone();
    let elems = arr.borrow().elems.clone();
    let mut kept = Vec::with_capacity(elems.len());
    let mut found = false;
    for elem in elems {
        if vm.values_equal(&elem, &needle)? {
            found = true;
        } else {
            kept.push(elem);
        }
    }
    arr.borrow_mut().elems = kept;
    Ok(if found { needle } else { Value::Nil })
}

fn native_arr_concat(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    want_args(vm, &a, 1)?;
    let arr = recv_array(vm, &a)?;
    vm.check_frozen(&a.recv)?;
    let Value::Array(other) = &a.args[0] else {
        return Err(vm.raise(ExcKind::TypeError, "no implicit conversion into Array"));
    };
    let extra = other.borrow().elems.clone();
    arr.borrow_mut().elems.extend(extra);
    Ok(a.recv.clone())
}

fn native_arr_clear(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    let arr = recv_array(vm, &a)?;
    vm.check_frozen(&a.recv)?;
    arr.borrow_mut().elems.clear();
    Ok(a.recv.clone())
}

/// Three-way comparison for sorting; objects go through `<=>`.
fn compare_values(vm: &mut Vm<'_>, a: &Value, b: &Value) -> Result<std::cmp::Ordering, Flow> {
    use std::cmp::Ordering;
    let ordering = match (a, b) {
        (Value::Int(x), Value::Int(y)) => x.partial_cmp(y),
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            let x = match a {
                Value::Int(v) => *v as f64,
                Value::Float(v) => *v,
                _ => unreachable!(),
            };
            let y = match b {
                Value::Int(v) => *v as f64,
                Value::Float(v) => *v,
                _ => unreachable!(),
            };
            x.partial_cmp(&y)
        }
        (Value::Str(x), Value::Str(y)) => x.borrow().bytes.partial_cmp(&y.borrow().bytes),
        _ => {
            let cmp = vm.intern("<=>");
            let result = vm.call_method(a, cmp, &[b.clone()], None)?;
            match result {
                Value::Int(v) => Some(v.cmp(&0)),
                _ => None,
            }
        }
    };
    ordering.ok_or_else(|| {
        vm.raise(
            ExcKind::ArgumentError,
            format!("comparison of {} with {} failed", a.kind_name(), b.kind_name()),
        )
    })
}

fn native_arr_sort(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    let arr = recv_array(vm, &a)?;
    let elems = arr.borrow().elems.clone();
    // insertion sort so the comparison can re-enter the VM
    let mut sorted: Vec<Value> = Vec::with_capacity(elems.len());
    for elem in elems {
        let mut at = sorted.len();
        for (i, slot) in sorted.iter().enumerate() {
            if compare_values(vm, &elem, slot)? == std::cmp::Ordering::Less {
                at = i;
                break;
            }
        }
        sorted.insert(at, elem);
    }
    vm.new_array(sorted)
}

fn flatten_into(vm: &mut Vm<'_>, value: &Value, out: &mut Vec<Value>) {
    match value {
        Value::Array(arr) => {
            let elems = arr.borrow().elems.clone();
            for elem in &elems {
                flatten_into(vm, elem, out);
            }
        }
        other => out.push(other.clone()),
    }
}

fn native_arr_flatten(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    let mut out = Vec::new();
    flatten_into(vm, &a.recv, &mut out);
    vm.new_array(out)
}

fn native_arr_uniq(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    let arr = recv_array(vm, &a)?;
    let elems = arr.borrow().elems.clone();
    let mut out: Vec<Value> = Vec::with_capacity(elems.len());
    for elem in elems {
        let mut seen = false;
        for kept in &out {
            if vm.values_equal(kept, &elem)? {
                seen = true;
                break;
            }
        }
        if !seen {
            out.push(elem);
        }
    }
    vm.new_array(out)
}

fn native_arr_compact(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    let arr = recv_array(vm, &a)?;
    let elems: Vec<Value> = arr
        .borrow()
        .elems
        .iter()
        .filter(|e| !matches!(e, Value::Nil))
        .cloned()
        .collect();
    vm.new_array(elems)
}

// ---- Hash ----

fn install_hash(interp: &mut Interp) {
    let hash = interp.core.hash.clone();
    def(interp, &hash, "length", native_hash_length);
    def(interp, &hash, "size", native_hash_length);
    def(interp, &hash, "empty?", native_hash_empty);
    def(interp, &hash, "keys", native_hash_keys);
    def(interp, &hash, "values", native_hash_values);
    def(interp, &hash, "delete", native_hash_delete);
    def(interp, &hash, "key?", native_hash_key_p);
    def(interp, &hash, "has_key?", native_hash_key_p);
    def(interp, &hash, "include?", native_hash_key_p);
    def(interp, &hash, "member?", native_hash_key_p);
}

fn recv_hash(vm: &mut Vm<'_>, a: &NativeArgs<'_>) -> Result<crate::value::HashRef, Flow> {
    match &a.recv {
        Value::Hash(h) => Ok(h.clone()),
        other => Err(vm.raise(
            ExcKind::TypeError,
            format!("expected a Hash, got {}", other.kind_name()),
        )),
    }
}

fn native_hash_length(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    let hash = recv_hash(vm, &a)?;
    let len = hash.borrow().entries.len();
    Ok(Value::Int(len as i64))
}

fn native_hash_empty(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    let hash = recv_hash(vm, &a)?;
    let empty = hash.borrow().entries.is_empty();
    Ok(Value::Bool(empty))
}

fn native_hash_keys(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    let hash = recv_hash(vm, &a)?;
    let keys: Vec<Value> = hash.borrow().entries.keys().map(|k| k.0.clone()).collect();
    vm.new_array(keys)
}

fn native_hash_values(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    let hash = recv_hash(vm, &a)?;
    let values: Vec<Value> = hash.borrow().entries.values().cloned().collect();
    vm.new_array(values)
}

fn native_hash_delete(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    want_args(vm, &a, 1)?;
    let hash = recv_hash(vm, &a)?;
    vm.check_frozen(&a.recv)?;
    let removed = hash.borrow_mut().entries.shift_remove(&HashKey(a.args[0].clone()));
    Ok(removed.unwrap_or(Value::Nil))
}

fn native_hash_key_p(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    want_args(vm, &a, 1)?;
    let hash = recv_hash(vm, &a)?;
    let present = hash.borrow().entries.contains_key(&HashKey(a.args[0].clone()));
    Ok(Value::Bool(present))
}

// ---- numerics ----

fn install_numeric(interp: &mut Interp) {
    let integer = interp.core.integer.clone();
    def(interp, &integer, "to_i", native_identity);
    def(interp, &integer, "to_f", native_int_to_f);
    def(interp, &integer, "to_s", native_to_s);
    def(interp, &integer, "abs", native_num_abs);
    def(interp, &integer, "even?", native_int_even);
    def(interp, &integer, "odd?", native_int_odd);
    def(interp, &integer, "zero?", native_num_zero);

    let float = interp.core.float.clone();
    def(interp, &float, "to_i", native_float_to_i);
    def(interp, &float, "to_f", native_identity);
    def(interp, &float, "abs", native_num_abs);
    def(interp, &float, "floor", native_float_floor);
    def(interp, &float, "ceil", native_float_ceil);
    def(interp, &float, "round", native_float_round);
    def(interp, &float, "nan?", native_float_nan);
    def(interp, &float, "zero?", native_num_zero);
}

fn native_identity(_vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    Ok(a.recv.clone())
}

fn native_int_to_f(_vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    match a.recv {
        Value::Int(v) => Ok(Value::Float(v as f64)),
        _ => Ok(Value::Nil),
    }
}

fn native_num_abs(_vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    match a.recv {
        Value::Int(v) => Ok(Value::Int(v.wrapping_abs())),
        Value::Float(v) => Ok(Value::Float(v.abs())),
        _ => Ok(Value::Nil),
    }
}

fn native_int_even(_vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    match a.recv {
        Value::Int(v) => Ok(Value::Bool(v % 2 == 0)),
        _ => Ok(Value::Nil),
    }
}

fn native_int_odd(_vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    match a.recv {
        Value::Int(v) => Ok(Value::Bool(v % 2 != 0)),
        _ => Ok(Value::Nil),
    }
}

fn native_num_zero(_vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    match a.recv {
        Value::Int(v) => Ok(Value::Bool(v == 0)),
        Value::Float(v) => Ok(Value::Bool(v == 0.0)),
        _ => Ok(Value::Nil),
    }
}

fn native_float_to_i(_vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    match a.recv {
        Value::Float(v) => Ok(Value::Int(v as i64)),
        _ => Ok(Value::Nil),
    }
}

fn native_float_floor(_vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    match a.recv {
        Value::Float(v) => Ok(Value::Int(v.floor() as i64)),
        Value::Int(v) => Ok(Value::Int(v)),
        _ => Ok(Value::Nil),
    }
}

fn native_float_ceil(_vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    match a.recv {
        Value::Float(v) => Ok(Value::Int(v.ceil() as i64)),
        Value::Int(v) => Ok(Value::Int(v)),
        _ => Ok(Value::Nil),
    }
}

fn native_float_round(_vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    match a.recv {
        Value::Float(v) => Ok(Value::Int(v.round() as i64)),
        Value::Int(v) => Ok(Value::Int(v)),
        _ => Ok(Value::Nil),
    }
}

fn native_float_nan(_vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    match a.recv {
        Value::Float(v) => Ok(Value::Bool(v.is_nan())),
        _ => Ok(Value::Bool(false)),
    }
}

// ---- Range ----

fn install_range(interp: &mut Interp) {
    let range = interp.core.range.clone();
    def(interp, &range, "first", native_range_first);
    def(interp, &range, "last", native_range_last);
    def(interp, &range, "exclude_end?", native_range_exclude_end);
    def(interp, &range, "size", native_range_size);
    def(interp, &range, "include?", native_range_include);
    def(interp, &range, "===", native_range_include);
}

fn recv_range(vm: &mut Vm<'_>, a: &NativeArgs<'_>) -> Result<crate::value::RangeRef, Flow> {
    match &a.recv {
        Value::Range(r) => Ok(r.clone()),
        other => Err(vm.raise(
            ExcKind::TypeError,
            format!("expected a Range, got {}", other.kind_name()),
        )),
    }
}

fn native_range_first(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    let range = recv_range(vm, &a)?;
    Ok(range.start.clone())
}

fn native_range_last(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    let range = recv_range(vm, &a)?;
    Ok(range.end.clone())
}

fn native_range_exclude_end(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    let range = recv_range(vm, &a)?;
    Ok(Value::Bool(range.exclusive))
}

fn native_range_size(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    value_len(vm, &a.recv)
}

fn native_range_include(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    want_args(vm, &a, 1)?;
    let range = recv_range(vm, &a)?;
    let subject = &a.args[0];
    let inside = match (&range.start, &range.end, subject) {
        (Value::Int(lo), Value::Int(hi), Value::Int(v)) => {
            *v >= *lo && if range.exclusive { *v < *hi } else { *v <= *hi }
        }
        (Value::Int(lo), Value::Int(hi), Value::Float(v)) => {
            *v >= *lo as f64
                && if range.exclusive { *v < *hi as f64 } else { *v <= *hi as f64 }
        }
        _ => false,
    };
    Ok(Value::Bool(inside))
}

// ---- Proc / Method / misc ----

fn install_misc(interp: &mut Interp) {
    let proc_class = interp.core.proc_class.clone();
    def(interp, &proc_class, "call", native_proc_call);

    let method = interp.core.method_class.clone();
    def(interp, &method, "call", native_method_call);

    let symbol = interp.core.symbol.clone();
    def(interp, &symbol, "to_sym", native_identity);
    def(interp, &symbol, "to_s", native_sym_to_s);

    let nil = interp.core.nil_class.clone();
    def(interp, &nil, "to_a", native_nil_to_a);
    def(interp, &nil, "to_s", native_to_s);
}

fn native_proc_call(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    match vm.call_block(&a.recv, a.args)? {
        BlockSignal::Normal(value) | BlockSignal::Break(value) => Ok(value),
        BlockSignal::Redo => Ok(Value::Nil),
    }
}

fn native_method_call(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    let Value::Method(bound) = &a.recv else {
        return Err(vm.raise(ExcKind::TypeError, "expected a Method"));
    };
    let bound = bound.clone();
    vm.call_method(&bound.recv, bound.name, a.args, a.block.clone())
}

fn native_sym_to_s(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    match a.recv {
        Value::Symbol(s) => {
            let text = vm.sym_name(s).to_string();
            vm.new_string(text.into_bytes())
        }
        _ => Ok(Value::Nil),
    }
}

fn native_nil_to_a(vm: &mut Vm<'_>, _a: NativeArgs<'_>) -> Result<Value, Flow> {
    vm.new_array(Vec::new())
}

// ---- Fiber ----

fn install_fiber(interp: &mut Interp) -> Result<(), ErrorInfo> {
    let fiber = interp.core.fiber.clone();
    def(interp, &fiber, "resume", native_fiber_resume);
    def(interp, &fiber, "alive?", native_fiber_alive);

    // Fiber.new / Fiber.yield live on the metaclass
    let singleton = {
        let name = interp.symbols.intern("#<Class:Fiber>");
        let class = crate::object::ClassData::new(
            name,
            Some(interp.core.class_class.clone()),
            false,
        );
        class.borrow_mut().is_singleton = true;
        fiber.borrow_mut().singleton = Some(class.clone());
        class
    };
    def(interp, &singleton, "new", native_fiber_new);
    def(interp, &singleton, "yield", native_fiber_yield);
    Ok(())
}

fn native_fiber_new(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    let block = want_block(vm, &a)?;
    let Value::Function(body) = block else {
        return Err(vm.raise(ExcKind::TypeError, "fiber body must be a block"));
    };
    Ok(Value::Fiber(Rc::new(RefCell::new(crate::fiber::Fiber::new(body)))))
}

fn native_fiber_resume(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    let Value::Fiber(fiber) = &a.recv else {
        return Err(vm.raise(ExcKind::TypeError, "expected a Fiber"));
    };
    let fiber: FiberRef = fiber.clone();
    Err(Flow::Resume { fiber, value: arg(&a, 0) })
}

fn native_fiber_alive(_vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    match &a.recv {
        Value::Fiber(fiber) => Ok(Value::Bool(fiber.borrow().alive())),
        _ => Ok(Value::Bool(false)),
    }
}

fn native_fiber_yield(vm: &mut Vm<'_>, a: NativeArgs<'_>) -> Result<Value, Flow> {
    Err(vm.native_yield(arg(&a, 0)))
}
