//! Interpreter state and the host embedding API
//!
//! An [`Interp`] is one interpreter instance: interner, globals, class
//! registry, budgets, last-error slot, require cache, and the VFS. It is
//! single-threaded and shares nothing with other instances.
//!
//! Host entry points ([`Interp::eval`], [`Interp::invoke_global`],
//! [`Interp::invoke_method`]) reset the per-invocation budget meters,
//! run the VM, and park any failure in the last-error slot as well as
//! returning it. The VM state stays consistent after an error: globals,
//! classes, and methods defined before the failure survive.

use crate::fiber::Fiber;
use crate::kernel;
use crate::object::{ClassData, ClassRef, MethodKind, MethodRecord, NativeMethod};
use crate::userdata::{Finalizer, UserData};
use crate::value::{FunctionData, Meta, RObject, RString, Value};
use crate::vfs::Vfs;
use crate::vm::{NativeFn, Vm};
use ruse_core::{ErrorInfo, ExcKind, Limits, Meters, Status, Symbol, SymbolTable};
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::collections::HashSet;
use std::io::Write;
use std::rc::Rc;

/// Host configuration for a new interpreter.
#[derive(Default)]
pub struct Config {
    pub limits: Limits,
    pub vfs: Option<Box<dyn Vfs>>,
    pub search_paths: Vec<String>,
}

/// The built-in classes, created once per interpreter.
pub struct CoreClasses {
    pub object: ClassRef,
    pub module_class: ClassRef,
    pub class_class: ClassRef,
    pub nil_class: ClassRef,
    pub true_class: ClassRef,
    pub false_class: ClassRef,
    pub integer: ClassRef,
    pub float: ClassRef,
    pub string: ClassRef,
    pub symbol: ClassRef,
    pub array: ClassRef,
    pub hash: ClassRef,
    pub range: ClassRef,
    pub proc_class: ClassRef,
    pub method_class: ClassRef,
    pub fiber: ClassRef,
    pub userdata: ClassRef,
    pub standard_error: ClassRef,
    pub runtime_error: ClassRef,
    pub type_error: ClassRef,
    pub name_error: ClassRef,
    pub no_method_error: ClassRef,
    pub argument_error: ClassRef,
    pub zero_division_error: ClassRef,
}

pub struct Interp {
    pub symbols: SymbolTable,
    pub globals: FxHashMap<Symbol, Value>,
    pub core: CoreClasses,
    pub limits: Limits,
    pub meters: Meters,
    /// Bumped on any method-table or ancestry mutation; invalidates
    /// inline caches and ancestor lists.
    pub epoch: u64,
    pub last_error: Option<ErrorInfo>,
    /// The in-flight exception, for bare `raise` inside rescue.
    pub current_exc: Option<Value>,
    pub vfs: Option<Box<dyn Vfs>>,
    pub search_paths: Vec<String>,
    loaded: HashSet<String>,
    pub out: Box<dyn Write>,
    pub rng_state: u64,
    /// Monotonic ids for method activations (`return`-from-block
    /// targeting).
    pub next_home_id: u64,
    /// `self` at the top level.
    pub main: Value,
}

impl Interp {
    pub fn new(config: Config) -> Self {
        let mut symbols = SymbolTable::new();
        let core = CoreClasses::bootstrap(&mut symbols);
        let main = Value::Object(Rc::new(RefCell::new(RObject {
            meta: Meta::default(),
            class: core.object.clone(),
            ivars: FxHashMap::default(),
            ticket: None,
        })));
        let mut interp = Interp {
            symbols,
            globals: FxHashMap::default(),
            core,
            limits: config.limits,
            meters: Meters::new(),
            epoch: 1,
            last_error: None,
            current_exc: None,
            vfs: config.vfs,
            search_paths: config.search_paths,
            loaded: HashSet::new(),
            out: Box::new(std::io::stdout()),
            rng_state: 0x2545f4914f6cdd1d,
            next_home_id: 1,
            main,
        };
        interp.register_core_constants();
        interp
    }

    /// Register the primitive kernel (native methods plus the bytecode
    /// prelude). Scripts evaluated before this see only bare syntax.
    pub fn open_base(&mut self) -> Result<(), ErrorInfo> {
        kernel::install(self)
    }

    fn register_core_constants(&mut self) {
        let classes: Vec<ClassRef> = vec![
            self.core.object.clone(),
            self.core.module_class.clone(),
            self.core.class_class.clone(),
            self.core.nil_class.clone(),
            self.core.true_class.clone(),
            self.core.false_class.clone(),
            self.core.integer.clone(),
            self.core.float.clone(),
            self.core.string.clone(),
            self.core.symbol.clone(),
            self.core.array.clone(),
            self.core.hash.clone(),
            self.core.range.clone(),
            self.core.proc_class.clone(),
            self.core.method_class.clone(),
            self.core.fiber.clone(),
            self.core.userdata.clone(),
            self.core.standard_error.clone(),
            self.core.runtime_error.clone(),
            self.core.type_error.clone(),
            self.core.name_error.clone(),
            self.core.no_method_error.clone(),
            self.core.argument_error.clone(),
            self.core.zero_division_error.clone(),
        ];
        for class in classes {
            let name = class.borrow().name;
            self.core
                .object
                .borrow_mut()
                .constants
                .insert(name, Value::Class(class.clone()));
        }
    }

    pub fn exc_class(&self, kind: ExcKind) -> ClassRef {
        match kind {
            ExcKind::StandardError => self.core.standard_error.clone(),
            ExcKind::RuntimeError => self.core.runtime_error.clone(),
            ExcKind::TypeError => self.core.type_error.clone(),
            ExcKind::NameError => self.core.name_error.clone(),
            ExcKind::NoMethodError => self.core.no_method_error.clone(),
            ExcKind::ArgumentError => self.core.argument_error.clone(),
            ExcKind::ZeroDivisionError => self.core.zero_division_error.clone(),
        }
    }

    // ---- evaluation entry points ----

    /// Compile and run `source`; the result is the last expression's
    /// value.
    pub fn eval(&mut self, source: &str, filename: &str) -> Result<Value, ErrorInfo> {
        self.last_error = None;
        let proto = match ruse_compiler::compile(source, filename, &mut self.symbols) {
            Ok(proto) => proto,
            Err(err) => {
                self.last_error = Some(err.clone());
                return Err(err);
            }
        };
        let main = self.main.clone();
        let func = Rc::new(FunctionData::for_proto(proto, main, None));
        let result = Vm::new(self).run_main(func);
        if let Err(err) = &result {
            self.last_error = Some(err.clone());
        }
        result
    }

    /// Call a top-level function (a method on the main object) by name.
    pub fn invoke_global(&mut self, name: &str, args: &[Value]) -> Result<Value, ErrorInfo> {
        let recv = self.main.clone();
        self.invoke_method(&recv, name, args)
    }

    /// Call a method on an arbitrary receiver.
    pub fn invoke_method(
        &mut self,
        recv: &Value,
        name: &str,
        args: &[Value],
    ) -> Result<Value, ErrorInfo> {
        self.last_error = None;
        let sym = self.symbols.intern(name);
        let result = Vm::new(self).run_method(recv.clone(), sym, args);
        if let Err(err) = &result {
            self.last_error = Some(err.clone());
        }
        result
    }

    // ---- host registration ----

    /// Install a native global function (a public method on `Object`).
    pub fn register_function(&mut self, name: &'static str, f: NativeFn) {
        let sym = self.symbols.intern(name);
        self.core.object.borrow_mut().methods.insert(
            sym,
            MethodRecord::public(MethodKind::Native(NativeMethod { name, f })),
        );
        self.epoch += 1;
    }

    /// Create (or fetch) a class registered as a top-level constant.
    pub fn define_class(&mut self, name: &str, superclass: Option<&Value>) -> Result<Value, ErrorInfo> {
        let sym = self.symbols.intern(name);
        if let Some(Value::Class(existing)) = self.core.object.borrow().constants.get(&sym) {
            return Ok(Value::Class(existing.clone()));
        }
        let superclass = match superclass {
            Some(Value::Class(c)) if !c.borrow().is_module => c.clone(),
            Some(_) => {
                return Err(ErrorInfo::runtime(
                    "TypeError",
                    "superclass must be a Class",
                    "<host>",
                    0,
                ));
            }
            None => self.core.object.clone(),
        };
        let class = ClassData::new(sym, Some(superclass), false);
        self.core
            .object
            .borrow_mut()
            .constants
            .insert(sym, Value::Class(class.clone()));
        self.epoch += 1;
        Ok(Value::Class(class))
    }

    /// Install a native method on a class created with
    /// [`Interp::define_class`].
    pub fn define_method(
        &mut self,
        class: &Value,
        name: &'static str,
        f: NativeFn,
    ) -> Result<(), ErrorInfo> {
        let Value::Class(class) = class else {
            return Err(ErrorInfo::runtime("TypeError", "not a class", "<host>", 0));
        };
        let sym = self.symbols.intern(name);
        class.borrow_mut().methods.insert(
            sym,
            MethodRecord::public(MethodKind::Native(NativeMethod { name, f })),
        );
        self.epoch += 1;
        Ok(())
    }

    // ---- userdata ----

    /// Allocate `size` zeroed bytes owned by the interpreter.
    pub fn new_userdata(&mut self, size: usize, finalizer: Option<Finalizer>) -> Value {
        Value::UserData(Rc::new(UserData::owned(size, finalizer)))
    }

    /// Wrap an external pointer; the finalizer runs at collection or
    /// invalidation.
    pub fn wrap_userdata(&mut self, ptr: *mut u8, finalizer: Option<Finalizer>) -> Value {
        Value::UserData(Rc::new(UserData::wrapped(ptr, finalizer)))
    }

    /// Tombstone a userdata value: the finalizer runs now and later
    /// pointer reads observe null.
    pub fn invalidate_userdata(&mut self, value: &Value) -> Result<(), ErrorInfo> {
        let Value::UserData(ud) = value else {
            return Err(ErrorInfo::runtime("TypeError", "not a userdata", "<host>", 0));
        };
        ud.invalidate();
        Ok(())
    }

    // ---- globals ----

    pub fn set_global(&mut self, name: &str, value: Value) {
        let sym = self.symbols.intern(name);
        self.globals.insert(sym, value);
    }

    pub fn get_global(&mut self, name: &str) -> Option<Value> {
        let sym = self.symbols.intern(name);
        self.globals.get(&sym).cloned()
    }

    // ---- error plumbing ----

    pub fn last_error(&self) -> Option<&ErrorInfo> {
        self.last_error.as_ref()
    }

    /// `"<filename>:<line>: <kind>: <message>"`, or empty when clear.
    pub fn format_error(&self) -> String {
        self.last_error.as_ref().map(ToString::to_string).unwrap_or_default()
    }

    pub fn clear_error(&mut self) {
        self.last_error = None;
        self.current_exc = None;
    }

    pub fn status(&self) -> Status {
        self.last_error.as_ref().map_or(Status::Ok, |e| e.status)
    }

    // ---- limits and meters ----

    pub fn instruction_limit(&self) -> u64 {
        self.limits.instruction_limit
    }

    pub fn set_instruction_limit(&mut self, limit: u64) {
        self.limits.instruction_limit = limit;
    }

    pub fn allocation_limit(&self) -> u64 {
        self.limits.allocation_limit
    }

    pub fn set_allocation_limit(&mut self, limit: u64) {
        self.limits.allocation_limit = limit;
    }

    pub fn call_depth_limit(&self) -> usize {
        self.limits.call_depth_limit
    }

    pub fn set_call_depth_limit(&mut self, limit: usize) {
        self.limits.call_depth_limit = limit;
    }

    pub fn memory_limit(&self) -> usize {
        self.limits.memory_limit
    }

    pub fn set_memory_limit(&mut self, limit: usize) {
        self.limits.memory_limit = limit;
    }

    /// Opcodes retired by the most recent invocation.
    pub fn instruction_count(&self) -> u64 {
        self.meters.instructions
    }

    /// Heap records created by the most recent invocation.
    pub fn allocation_count(&self) -> u64 {
        self.meters.allocations
    }

    /// Live bytes currently charged to the memory meter.
    pub fn memory_usage(&self) -> usize {
        self.meters.memory.get()
    }

    // ---- require support ----

    pub fn add_search_path(&mut self, path: impl Into<String>) {
        self.search_paths.push(path.into());
    }

    pub fn already_loaded(&self, path: &str) -> bool {
        self.loaded.contains(path)
    }

    pub fn mark_loaded(&mut self, path: &str) {
        self.loaded.insert(path.to_string());
    }

    /// Redirect `puts`/`print` output (defaults to stdout).
    pub fn set_output(&mut self, out: Box<dyn Write>) {
        self.out = out;
    }

    // ---- value construction for hosts ----

    pub fn str_value(&mut self, text: &str) -> Value {
        Value::Str(Rc::new(RefCell::new(RString {
            meta: Meta::default(),
            bytes: text.as_bytes().to_vec(),
            ticket: None,
        })))
    }

    pub fn sym_value(&mut self, text: &str) -> Value {
        Value::Symbol(self.symbols.intern(text))
    }
}

impl CoreClasses {
    fn bootstrap(symbols: &mut SymbolTable) -> Self {
        let mut class = |name: &str, superclass: Option<&ClassRef>, is_module: bool| {
            ClassData::new(symbols.intern(name), superclass.cloned(), is_module)
        };
        let object = class("Object", None, false);
        let module_class = class("Module", Some(&object), false);
        let class_class = class("Class", Some(&module_class), false);
        let nil_class = class("NilClass", Some(&object), false);
        let true_class = class("TrueClass", Some(&object), false);
        let false_class = class("FalseClass", Some(&object), false);
        let integer = class("Integer", Some(&object), false);
        let float = class("Float", Some(&object), false);
        let string = class("String", Some(&object), false);
        let symbol = class("Symbol", Some(&object), false);
        let array = class("Array", Some(&object), false);
        let hash = class("Hash", Some(&object), false);
        let range = class("Range", Some(&object), false);
        let proc_class = class("Proc", Some(&object), false);
        let method_class = class("Method", Some(&object), false);
        let fiber = class("Fiber", Some(&object), false);
        let userdata = class("UserData", Some(&object), false);
        let standard_error = class("StandardError", Some(&object), false);
        let runtime_error = class("RuntimeError", Some(&standard_error), false);
        let type_error = class("TypeError", Some(&standard_error), false);
        let name_error = class("NameError", Some(&standard_error), false);
        let no_method_error = class("NoMethodError", Some(&name_error), false);
        let argument_error = class("ArgumentError", Some(&standard_error), false);
        let zero_division_error = class("ZeroDivisionError", Some(&standard_error), false);
        CoreClasses {
            object,
            module_class,
            class_class,
            nil_class,
            true_class,
            false_class,
            integer,
            float,
            string,
            symbol,
            array,
            hash,
            range,
            proc_class,
            method_class,
            fiber,
            userdata,
            standard_error,
            runtime_error,
            type_error,
            name_error,
            no_method_error,
            argument_error,
            zero_division_error,
        }
    }
}

/// Plain (non-singleton) class of a value.
pub fn class_of_value(interp: &Interp, value: &Value) -> ClassRef {
    match value {
        Value::Nil => interp.core.nil_class.clone(),
        Value::Bool(true) => interp.core.true_class.clone(),
        Value::Bool(false) => interp.core.false_class.clone(),
        Value::Int(_) => interp.core.integer.clone(),
        Value::Float(_) => interp.core.float.clone(),
        Value::Symbol(_) => interp.core.symbol.clone(),
        Value::Str(_) => interp.core.string.clone(),
        Value::Array(_) => interp.core.array.clone(),
        Value::Hash(_) => interp.core.hash.clone(),
        Value::Range(_) => interp.core.range.clone(),
        Value::Object(o) => o.borrow().class.clone(),
        Value::Class(c) => {
            if c.borrow().is_module {
                interp.core.module_class.clone()
            } else {
                interp.core.class_class.clone()
            }
        }
        Value::Function(_) => interp.core.proc_class.clone(),
        Value::Method(_) => interp.core.method_class.clone(),
        Value::Fiber(_) => interp.core.fiber.clone(),
        Value::UserData(_) => interp.core.userdata.clone(),
        Value::Cell(c) => class_of_value(interp, &c.borrow()),
    }
}

/// Dispatch class: the singleton when one exists, else the plain class.
pub fn dispatch_class_of(interp: &Interp, value: &Value) -> ClassRef {
    let singleton = match value {
        Value::Object(o) => o.borrow().meta.singleton.clone(),
        Value::Str(s) => s.borrow().meta.singleton.clone(),
        Value::Array(a) => a.borrow().meta.singleton.clone(),
        Value::Hash(h) => h.borrow().meta.singleton.clone(),
        Value::Class(c) => c.borrow().singleton.clone(),
        _ => None,
    };
    singleton.unwrap_or_else(|| class_of_value(interp, value))
}

/// A fresh root fiber for one host entry.
pub fn root_fiber() -> crate::value::FiberRef {
    Rc::new(RefCell::new(Fiber::root()))
}
