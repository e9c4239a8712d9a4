//! The bytecode interpreter
//!
//! One dispatch loop drives everything: bytecode calls push frames and
//! continue iterating (no Rust-stack recursion), fibers are switched by
//! checking their state in and out of the shared records, and exception
//! or block unwinding walks the explicit frame stack.
//!
//! Natives return [`Flow`] to request anything that is not a plain
//! value: raising, resuming a fiber, yielding the current one. The loop
//! interprets those requests at the opcode boundary. Natives that call
//! back into bytecode (`call_block`, `call_method`) re-enter the loop
//! with a stop marker (fiber, frame depth); `Fiber.yield` refuses to
//! cross such a marker because the Rust stack below it cannot be
//! suspended.
//!
//! Unwinding uses each frame's armed-handler chain. A raise pops
//! handler contexts: a rescue context receives the exception on a
//! truncated operand stack; an ensure context parks the unwind action in
//! the frame and runs the handler, whose `EndEnsure` resumes the action.
//! `break` and method `return` travel the same way so every `ensure` on
//! the way out runs exactly once.

use crate::fiber::{FiberState, FiberStatus, Frame, FrameKind, HandlerCtx, MethodCtx, Pending};
use crate::interp::{class_of_value, dispatch_class_of, root_fiber, Interp};
use crate::object::{
    ancestors, has_ancestor, lookup_method, lookup_method_after, ClassData, ClassRef, MethodKind,
    MethodRecord, Visibility,
};
use crate::value::{
    CallCache, CellRef, FiberRef, FnRef, FunctionData, HashKey, Meta, RArray, RHash, RObject,
    RRange, RString, Value,
};
use indexmap::IndexMap;
use ruse_core::proto::{Const, HandlerKind, Op, ProtoKind};
use ruse_core::{ErrorInfo, ExcKind, MemTicket, Symbol, TraceEntry};
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::trace;

/// A raised exception: the language value plus the host-facing record.
#[derive(Debug)]
pub struct Exc {
    pub value: Value,
    pub info: ErrorInfo,
}

/// Out-of-band result of a native call or an inner run.
#[derive(Debug)]
pub enum Flow {
    Raise(Exc),
    /// `Fiber#resume`.
    Resume { fiber: FiberRef, value: Value },
    /// `Fiber.yield` / `native_yield`.
    FiberYield(Value),
    /// `break` escaping a natively-invoked block.
    BreakSignal(Value),
    /// `redo` escaping a natively-invoked block.
    RedoSignal,
}

/// What a block invocation produced, as observed by a native iterator.
/// `Normal` covers both falling off the end and `next v`.
#[derive(Debug)]
pub enum BlockSignal {
    Normal(Value),
    Break(Value),
    Redo,
}

pub struct NativeArgs<'a> {
    pub recv: Value,
    pub args: &'a [Value],
    pub block: Option<Value>,
}

pub type NativeFn = fn(&mut Vm<'_>, NativeArgs<'_>) -> Result<Value, Flow>;

/// Where an inner `run` stops: back at this fiber with this many frames.
struct Stop {
    fiber: FiberRef,
    depth: usize,
}

/// One step's effect on the running frame stack.
enum Unwound {
    /// Keep executing.
    Continue,
    /// The stop boundary was reached; `run` returns this value.
    Done(Value),
}

pub struct Vm<'i> {
    pub interp: &'i mut Interp,
    active: FiberState,
    active_ref: FiberRef,
}

impl<'i> Vm<'i> {
    pub fn new(interp: &'i mut Interp) -> Self {
        let mut active = FiberState::default();
        reset_meters(&mut active, interp.limits.instruction_limit, interp.limits.allocation_limit);
        Vm { interp, active, active_ref: root_fiber() }
    }

    // ---- host entry points ----

    /// Run a compiled top-level function to completion.
    pub fn run_main(mut self, func: FnRef) -> Result<Value, ErrorInfo> {
        let self_val = func.self_val.clone();
        let stop = Stop { fiber: self.active_ref.clone(), depth: 0 };
        let result = self
            .push_bytecode_frame(func, self_val, Vec::new(), None, None, FrameKind::TopLevel, None)
            .and_then(|()| self.run(&stop));
        self.finish(result)
    }

    /// Invoke `name` on `recv` from the host.
    pub fn run_method(
        mut self,
        recv: Value,
        name: Symbol,
        args: &[Value],
    ) -> Result<Value, ErrorInfo> {
        let result = self.call_method(&recv, name, args, None);
        self.finish(result)
    }

    /// Copy meters back and translate `Flow` into the host error record.
    fn finish(&mut self, result: Result<Value, Flow>) -> Result<Value, ErrorInfo> {
        self.interp.meters.instructions = self.active.instructions;
        self.interp.meters.allocations = self.active.allocations;
        match result {
            Ok(value) => Ok(value),
            Err(Flow::Raise(exc)) => Err(exc.info),
            Err(other) => Err(ErrorInfo::runtime(
                "RuntimeError",
                format!("control escaped the interpreter ({other:?})"),
                "<main>",
                0,
            )),
        }
    }

    // ---- public helpers for natives ----

    pub fn intern(&mut self, name: &str) -> Symbol {
        self.interp.symbols.intern(name)
    }

    pub fn sym_name(&self, sym: Symbol) -> Rc<str> {
        self.interp.symbols.name(sym)
    }

    pub fn class_of(&self, value: &Value) -> ClassRef {
        class_of_value(self.interp, value)
    }

    /// The class method lookup starts from: the singleton when one
    /// exists, and for class receivers the (lazily created) metaclass so
    /// class methods inherit along the superclass chain.
    pub fn dispatch_class(&mut self, value: &Value) -> ClassRef {
        if let Value::Class(class) = value {
            let class = class.clone();
            return self.class_singleton(&class);
        }
        dispatch_class_of(self.interp, value)
    }

    /// Build a raise out of one of the built-in exception kinds.
    pub fn raise(&mut self, kind: ExcKind, message: impl Into<String>) -> Flow {
        let class = self.interp.exc_class(kind);
        self.raise_in_class(class, message.into())
    }

    pub fn raise_in_class(&mut self, class: ClassRef, message: String) -> Flow {
        let value = self.make_exception(&class, &message);
        self.raise_value_with(value, message)
    }

    /// Raise an existing exception object.
    pub fn raise_value(&mut self, value: Value) -> Flow {
        let message = self.exception_message(&value);
        self.raise_value_with(value, message)
    }

    fn raise_value_with(&mut self, value: Value, message: String) -> Flow {
        let kind = self.class_of(&value).borrow().name;
        let kind = self.sym_name(kind).to_string();
        let (filename, line) = self.current_position();
        let mut info = ErrorInfo::runtime(kind, message, &filename, line);
        info.backtrace = self.capture_backtrace();
        self.interp.current_exc = Some(value.clone());
        Flow::Raise(Exc { value, info })
    }

    /// Suspend the current fiber from inside a native function.
    pub fn native_yield(&mut self, value: Value) -> Flow {
        Flow::FiberYield(value)
    }

    /// The calling frame's block (natives run in their caller's frame).
    pub fn caller_block(&self) -> Option<Value> {
        self.active.frames.last().and_then(|frame| frame.block.clone())
    }

    /// The calling frame's method name, for `__method__`.
    pub fn caller_method(&self) -> Option<Symbol> {
        self.active
            .frames
            .last()
            .and_then(|frame| frame.method_ctx.as_ref())
            .map(|ctx| ctx.name)
    }

    /// Run a freshly-compiled file body to completion (`require`/`load`).
    pub fn run_toplevel_nested(&mut self, func: FnRef) -> Result<Value, Flow> {
        let depth = self.active.frames.len();
        let stop = Stop { fiber: self.active_ref.clone(), depth };
        let self_val = self.interp.main.clone();
        self.active.native_depth += 1;
        let result = self
            .push_bytecode_frame(func, self_val, Vec::new(), None, None, FrameKind::TopLevel, None)
            .and_then(|()| self.run(&stop));
        self.active.native_depth -= 1;
        result
    }

    fn current_position(&self) -> (String, u32) {
        match self.active.frames.last() {
            Some(frame) => {
                let pc = frame.pc.saturating_sub(1);
                (frame.func.proto.filename.to_string(), frame.func.proto.line_at(pc))
            }
            None => ("<native>".to_string(), 0),
        }
    }

    fn capture_backtrace(&self) -> Vec<TraceEntry> {
        self.active
            .frames
            .iter()
            .rev()
            .map(|frame| TraceEntry {
                filename: frame.func.proto.filename.to_string(),
                line: frame.func.proto.line_at(frame.pc.saturating_sub(1)),
                method_name: frame.func.proto.name.to_string(),
            })
            .collect()
    }

    fn make_exception(&mut self, class: &ClassRef, message: &str) -> Value {
        let msg_sym = self.intern("message");
        let mut ivars = FxHashMap::default();
        ivars.insert(msg_sym, self.plain_string(message.as_bytes().to_vec()));
        Value::Object(Rc::new(RefCell::new(RObject {
            meta: Meta::default(),
            class: class.clone(),
            ivars,
            ticket: None,
        })))
    }

    fn exception_message(&mut self, value: &Value) -> String {
        let msg_sym = self.intern("message");
        if let Value::Object(o) = value {
            if let Some(Value::Str(s)) = o.borrow().ivars.get(&msg_sym) {
                return s.borrow().as_str_lossy().into_owned();
            }
        }
        let name = self.class_of(value).borrow().name;
        self.sym_name(name).to_string()
    }

    /// A string record outside the budget meters (error text, host
    /// conversions).
    pub fn plain_string(&self, bytes: Vec<u8>) -> Value {
        Value::Str(Rc::new(RefCell::new(RString { meta: Meta::default(), bytes, ticket: None })))
    }

    // ---- metered allocation ----

    fn alloc_tick(&mut self, bytes: usize) -> Result<(), Flow> {
        self.active.allocations += 1;
        if self.active.allocations >= self.active.alloc_trap {
            let trap = self.active.alloc_trap;
            self.active.alloc_trap = trap.saturating_add(self.interp.limits.allocation_limit.max(1));
            return Err(self.raise(ExcKind::RuntimeError, "allocation limit exceeded"));
        }
        let limit = self.interp.limits.memory_limit;
        if limit > 0 && self.interp.meters.memory.get().saturating_add(bytes) > limit {
            return Err(self.raise(ExcKind::RuntimeError, "memory limit exceeded"));
        }
        Ok(())
    }

    pub fn new_string(&mut self, bytes: Vec<u8>) -> Result<Value, Flow> {
        self.alloc_tick(bytes.len())?;
        let ticket = MemTicket::charge(&self.interp.meters.memory, bytes.len());
        Ok(Value::Str(Rc::new(RefCell::new(RString {
            meta: Meta::default(),
            bytes,
            ticket: Some(ticket),
        }))))
    }

    pub fn new_array(&mut self, elems: Vec<Value>) -> Result<Value, Flow> {
        let bytes = elems.len() * std::mem::size_of::<Value>() + 32;
        self.alloc_tick(bytes)?;
        let ticket = MemTicket::charge(&self.interp.meters.memory, bytes);
        Ok(Value::Array(Rc::new(RefCell::new(RArray {
            meta: Meta::default(),
            elems,
            ticket: Some(ticket),
        }))))
    }

    pub fn new_hash(&mut self, entries: IndexMap<HashKey, Value>) -> Result<Value, Flow> {
        let bytes = entries.len() * 3 * std::mem::size_of::<Value>() + 48;
        self.alloc_tick(bytes)?;
        let ticket = MemTicket::charge(&self.interp.meters.memory, bytes);
        Ok(Value::Hash(Rc::new(RefCell::new(RHash {
            meta: Meta::default(),
            entries,
            ticket: Some(ticket),
        }))))
    }

    pub fn new_object(&mut self, class: ClassRef) -> Result<Value, Flow> {
        self.alloc_tick(64)?;
        let ticket = MemTicket::charge(&self.interp.meters.memory, 64);
        Ok(Value::Object(Rc::new(RefCell::new(RObject {
            meta: Meta::default(),
            class,
            ivars: FxHashMap::default(),
            ticket: Some(ticket),
        }))))
    }

    pub fn new_range(&mut self, start: Value, end: Value, exclusive: bool) -> Result<Value, Flow> {
        self.alloc_tick(48)?;
        Ok(Value::Range(Rc::new(RRange { start, end, exclusive })))
    }

    // ---- re-entry helpers for natives ----

    /// Invoke a block from native code, reporting break/redo as signals.
    pub fn call_block(&mut self, block: &Value, args: &[Value]) -> Result<BlockSignal, Flow> {
        let Value::Function(func) = block else {
            return Err(self.raise(ExcKind::TypeError, "no block given"));
        };
        let depth = self.active.frames.len();
        let stop = Stop { fiber: self.active_ref.clone(), depth };
        self.active.native_depth += 1;
        let self_val = func.self_val.clone();
        let result = self
            .push_bytecode_frame(
                func.clone(),
                self_val,
                args.to_vec(),
                None,
                None,
                FrameKind::Block { yielder: None },
                None,
            )
            .and_then(|()| self.run(&stop));
        self.active.native_depth -= 1;
        match result {
            Ok(value) => Ok(BlockSignal::Normal(value)),
            Err(Flow::BreakSignal(value)) => Ok(BlockSignal::Break(value)),
            Err(Flow::RedoSignal) => Ok(BlockSignal::Redo),
            Err(other) => Err(other),
        }
    }

    /// Full method dispatch from native code (`send`, operators, hooks).
    pub fn call_method(
        &mut self,
        recv: &Value,
        name: Symbol,
        args: &[Value],
        block: Option<Value>,
    ) -> Result<Value, Flow> {
        let class = self.dispatch_class(recv);
        let Some((record, owner)) = lookup_method(&class, name, self.interp.epoch) else {
            return self.method_missing_direct(recv, name, args);
        };
        self.invoke_direct(recv.clone(), record, owner, name, args.to_vec(), block)
    }

    fn method_missing_direct(
        &mut self,
        recv: &Value,
        name: Symbol,
        args: &[Value],
    ) -> Result<Value, Flow> {
        let class = self.dispatch_class(recv);
        let mm = self.intern("method_missing");
        if let Some((record, owner)) = lookup_method(&class, mm, self.interp.epoch) {
            let mut mm_args = vec![Value::Symbol(name)];
            mm_args.extend_from_slice(args);
            return self.invoke_direct(recv.clone(), record, owner, mm, mm_args, None);
        }
        let name = self.sym_name(name);
        let class_name = {
            let class = self.class_of(recv);
            let sym = class.borrow().name;
            self.sym_name(sym)
        };
        Err(self.raise(
            ExcKind::NoMethodError,
            format!("undefined method '{name}' for {class_name}"),
        ))
    }

    /// Invoke an already-resolved method, re-entering the loop for
    /// bytecode bodies.
    fn invoke_direct(
        &mut self,
        recv: Value,
        record: MethodRecord,
        owner: ClassRef,
        name: Symbol,
        args: Vec<Value>,
        block: Option<Value>,
    ) -> Result<Value, Flow> {
        match record.kind {
            MethodKind::Native(nm) => {
                self.active.native_depth += 1;
                let result = (nm.f)(self, NativeArgs { recv, args: &args, block });
                self.active.native_depth -= 1;
                result
            }
            MethodKind::AttrReader(ivar) => Ok(self.read_ivar(&recv, ivar)),
            MethodKind::AttrWriter(ivar) => {
                let value = args.first().cloned().unwrap_or(Value::Nil);
                self.write_ivar(&recv, ivar, value.clone())?;
                Ok(value)
            }
            MethodKind::Bytecode(func) => {
                let depth = self.active.frames.len();
                let stop = Stop { fiber: self.active_ref.clone(), depth };
                self.active.native_depth += 1;
                let result = self
                    .push_bytecode_frame(
                        func,
                        recv,
                        args,
                        None,
                        block,
                        FrameKind::Method,
                        Some(MethodCtx { owner, name }),
                    )
                    .and_then(|()| self.run(&stop));
                self.active.native_depth -= 1;
                result
            }
        }
    }

    /// `==` with user-defined overrides honored.
    pub fn values_equal(&mut self, a: &Value, b: &Value) -> Result<bool, Flow> {
        if let Value::Object(_) = a {
            let eq = self.intern("==");
            let class = self.dispatch_class(a);
            if let Some((record, owner)) = lookup_method(&class, eq, self.interp.epoch) {
                let result =
                    self.invoke_direct(a.clone(), record, owner, eq, vec![b.clone()], None)?;
                return Ok(result.truthy());
            }
        }
        Ok(a.eq_value(b))
    }

    /// `value === subject` fallback used by rescue matching.
    pub fn is_instance_of(&mut self, value: &Value, class: &ClassRef) -> bool {
        let vclass = self.class_of(value);
        has_ancestor(&vclass, class, self.interp.epoch)
    }

    /// Canonical textual form; dispatches a user `to_s` on objects.
    pub fn display(&mut self, value: &Value) -> Result<String, Flow> {
        if let Value::Object(_) = value {
            let to_s = self.intern("to_s");
            let class = self.dispatch_class(value);
            if let Some((record, owner)) = lookup_method(&class, to_s, self.interp.epoch) {
                let result =
                    self.invoke_direct(value.clone(), record, owner, to_s, Vec::new(), None)?;
                if let Value::Str(s) = &result {
                    return Ok(s.borrow().as_str_lossy().into_owned());
                }
            }
        }
        Ok(self.display_basic(value))
    }

    /// Display without dispatch. nil renders empty (its printed form);
    /// containers render in inspect style.
    pub fn display_basic(&self, value: &Value) -> String {
        match value {
            Value::Nil => String::new(),
            Value::Bool(true) => "true".to_string(),
            Value::Bool(false) => "false".to_string(),
            Value::Int(v) => v.to_string(),
            Value::Float(v) => format_float(*v),
            Value::Symbol(s) => self.interp.symbols.name_ref(*s).to_string(),
            Value::Str(s) => s.borrow().as_str_lossy().into_owned(),
            other => self.inspect_basic(other),
        }
    }

    pub fn inspect_basic(&self, value: &Value) -> String {
        match value {
            Value::Nil => "nil".to_string(),
            Value::Str(s) => format!("\"{}\"", s.borrow().as_str_lossy()),
            Value::Symbol(s) => format!(":{}", self.interp.symbols.name_ref(*s)),
            Value::Array(a) => {
                let items: Vec<String> =
                    a.borrow().elems.iter().map(|e| self.inspect_basic(e)).collect();
                format!("[{}]", items.join(", "))
            }
            Value::Hash(h) => {
                let items: Vec<String> = h
                    .borrow()
                    .entries
                    .iter()
                    .map(|(k, v)| {
                        format!("{} => {}", self.inspect_basic(&k.0), self.inspect_basic(v))
                    })
                    .collect();
                format!("{{{}}}", items.join(", "))
            }
            Value::Range(r) => format!(
                "{}{}{}",
                self.inspect_basic(&r.start),
                if r.exclusive { "..." } else { ".." },
                self.inspect_basic(&r.end)
            ),
            Value::Class(c) => self.interp.symbols.name_ref(c.borrow().name).to_string(),
            Value::Object(o) => {
                let name = o.borrow().class.borrow().name;
                format!("#<{}>", self.interp.symbols.name_ref(name))
            }
            Value::Function(_) => "#<Proc>".to_string(),
            Value::Method(_) => "#<Method>".to_string(),
            Value::Fiber(_) => "#<Fiber>".to_string(),
            Value::UserData(_) => "#<UserData>".to_string(),
            Value::Cell(c) => self.inspect_basic(&c.borrow()),
            other => self.display_basic(other),
        }
    }

    // ---- frames ----

    #[allow(clippy::too_many_arguments)]
    fn push_bytecode_frame(
        &mut self,
        func: FnRef,
        self_val: Value,
        mut args: Vec<Value>,
        kwargs: Option<Value>,
        block: Option<Value>,
        kind: FrameKind,
        method_ctx: Option<MethodCtx>,
    ) -> Result<(), Flow> {
        let depth_limit = self.interp.limits.call_depth_limit;
        if depth_limit > 0 && self.active.frames.len() >= depth_limit {
            return Err(self.raise(ExcKind::RuntimeError, "stack overflow (call depth limit)"));
        }
        let proto = func.proto.clone();
        let params = &proto.params;
        let lenient = proto.kind == ProtoKind::Block;

        // block auto-splat: one array argument fans out to the params
        if lenient && params.nreq > 1 && args.len() == 1 {
            if let Value::Array(arr) = &args[0] {
                let new_args = arr.borrow().elems.clone();
                args = new_args;
            }
        }

        let nreq = params.nreq as usize;
        let nopt = params.nopt as usize;
        if !lenient {
            if args.len() < nreq {
                return Err(self.raise(
                    ExcKind::ArgumentError,
                    format!("wrong number of arguments (given {}, expected {})", args.len(), nreq),
                ));
            }
            if !params.rest && args.len() > nreq + nopt {
                return Err(self.raise(
                    ExcKind::ArgumentError,
                    format!(
                        "wrong number of arguments (given {}, expected {})",
                        args.len(),
                        nreq + nopt
                    ),
                ));
            }
        }

        let mut locals: Vec<Value> = vec![Value::Nil; proto.nlocals as usize];
        let positional = nreq + nopt;
        let nargs_given = args.len().min(u8::MAX as usize) as u8;
        for (slot, value) in args.iter().take(positional).enumerate() {
            locals[slot] = value.clone();
        }
        if let Some(rest_slot) = params.rest_slot() {
            let rest: Vec<Value> =
                if args.len() > positional { args.split_off(positional) } else { Vec::new() };
            locals[rest_slot] = self.new_array(rest)?;
        }

        // keyword binding
        let mut kw_given: u32 = 0;
        if !params.kw.is_empty() {
            let supplied = match &kwargs {
                Some(Value::Hash(h)) => Some(h.clone()),
                _ => None,
            };
            for (i, kw) in params.kw.iter().enumerate() {
                let slot = params.kw_slot(i);
                let key = HashKey(Value::Symbol(kw.name));
                let found = supplied.as_ref().and_then(|h| h.borrow().entries.get(&key).cloned());
                match found {
                    Some(value) => {
                        locals[slot] = value;
                        kw_given |= 1 << i;
                    }
                    None if kw.required => {
                        let name = self.sym_name(kw.name);
                        return Err(self
                            .raise(ExcKind::ArgumentError, format!("missing keyword: {name}")));
                    }
                    None => {}
                }
            }
            if let Some(h) = supplied {
                for key in h.borrow().entries.keys() {
                    let known = match &key.0 {
                        Value::Symbol(s) => params.kw.iter().any(|kw| kw.name == *s),
                        _ => false,
                    };
                    if !known {
                        let text = self.inspect_basic(&key.0);
                        return Err(
                            self.raise(ExcKind::ArgumentError, format!("unknown keyword: {text}"))
                        );
                    }
                }
            }
        } else if let Some(hash) = kwargs {
            // callee declares no keywords: the hash is one more
            // positional argument
            if params.rest {
                if let Some(rest_slot) = params.rest_slot() {
                    if let Value::Array(arr) = &locals[rest_slot] {
                        arr.borrow_mut().elems.push(hash);
                    }
                }
            } else if args.len() < positional {
                locals[args.len()] = hash;
            } else if !lenient {
                return Err(self.raise(
                    ExcKind::ArgumentError,
                    format!("wrong number of arguments (given {}, expected {})", args.len() + 1, positional),
                ));
            }
        }

        let block = match block {
            Some(Value::Nil) | None => None,
            Some(b) => Some(b),
        };
        if let Some(block_slot) = params.block_slot() {
            locals[block_slot] = block.clone().unwrap_or(Value::Nil);
        }

        let base = self.active.stack.len();
        self.active.stack.extend(locals);
        for &cell_slot in &proto.cells {
            let idx = base + cell_slot as usize;
            let current = std::mem::take(&mut self.active.stack[idx]);
            self.active.stack[idx] = Value::Cell(Rc::new(RefCell::new(current)));
        }

        let def_target = func.def_target.clone();
        let frame_block = match kind {
            // blocks forward `yield` to the enclosing method's block
            FrameKind::Block { .. } => func.outer_block.clone(),
            _ => block,
        };
        let home_id = match kind {
            FrameKind::Block { .. } => func.home_id,
            _ => {
                let id = self.interp.next_home_id;
                self.interp.next_home_id += 1;
                id
            }
        };
        self.active.frames.push(Frame {
            operand_base: base + proto.nlocals as usize,
            func,
            base,
            pc: 0,
            self_val,
            block: frame_block,
            kind,
            handlers: Vec::new(),
            pending: None,
            method_ctx,
            def_target,
            home_id,
            nargs_given,
            kw_given,
        });
        Ok(())
    }

    // ---- the dispatch loop ----

    fn run(&mut self, stop: &Stop) -> Result<Value, Flow> {
        loop {
            // budget: one tick per opcode
            self.active.instructions += 1;
            if self.active.instructions >= self.active.instr_trap {
                let trap = self.active.instr_trap;
                self.active.instr_trap =
                    trap.saturating_add(self.interp.limits.instruction_limit.max(1));
                let flow = self.raise(ExcKind::RuntimeError, "instruction limit exceeded");
                match self.handle_flow(flow, stop)? {
                    Unwound::Continue => continue,
                    Unwound::Done(value) => return Ok(value),
                }
            }

            let op = {
                let frame = self.active.frames.last_mut().expect("running without a frame");
                let op = frame.func.proto.code[frame.pc];
                frame.pc += 1;
                op
            };
            trace!(target: "ruse::vm", ?op);

            let step = self.step(op, stop);
            match step {
                Ok(Unwound::Continue) => {}
                Ok(Unwound::Done(value)) => return Ok(value),
                Err(flow) => match self.handle_flow(flow, stop)? {
                    Unwound::Continue => {}
                    Unwound::Done(value) => return Ok(value),
                },
            }
        }
    }

    /// Route out-of-band flow at the opcode boundary. Errors that cross
    /// the stop boundary propagate to the caller of `run`.
    fn handle_flow(&mut self, flow: Flow, stop: &Stop) -> Result<Unwound, Flow> {
        match flow {
            Flow::Raise(exc) => self.unwind_raise(exc, stop).map(|()| Unwound::Continue),
            Flow::Resume { fiber, value } => {
                self.do_resume(fiber, value)?;
                Ok(Unwound::Continue)
            }
            Flow::FiberYield(value) => {
                self.do_fiber_yield(value)?;
                Ok(Unwound::Continue)
            }
            other => Err(other),
        }
    }

    fn step(&mut self, op: Op, stop: &Stop) -> Result<Unwound, Flow> {
        match op {
            Op::Const(idx) => {
                let constant = {
                    let frame = self.active.frames.last().expect("frame");
                    frame.func.proto.consts[idx as usize].clone()
                };
                let value = match constant {
                    Const::Int(v) => Value::Int(v),
                    Const::Float(v) => Value::Float(v),
                    Const::Sym(s) => Value::Symbol(s),
                    Const::Str(s) => self.new_string(s.as_bytes().to_vec())?,
                    Const::Proto(_) => {
                        return Err(self.raise(
                            ExcKind::RuntimeError,
                            "proto constant loaded outside closure creation",
                        ));
                    }
                };
                self.push(value);
            }
            Op::Nil => self.push(Value::Nil),
            Op::True => self.push(Value::Bool(true)),
            Op::False => self.push(Value::Bool(false)),
            Op::SelfVal => {
                let value = self.frame().self_val.clone();
                self.push(value);
            }
            Op::Pop => {
                self.pop();
            }
            Op::Dup => {
                let top = self.peek().clone();
                self.push(top);
            }
            Op::Swap => {
                let len = self.active.stack.len();
                self.active.stack.swap(len - 1, len - 2);
            }

            Op::LoadLocal(slot) => {
                let frame = self.active.frames.last().expect("frame");
                let value = self.active.stack[frame.base + slot as usize].clone();
                let value = match value {
                    Value::Cell(cell) => cell.borrow().clone(),
                    other => other,
                };
                self.push(value);
            }
            Op::StoreLocal(slot) => {
                let value = self.pop();
                let idx = self.frame().base + slot as usize;
                match &self.active.stack[idx] {
                    Value::Cell(cell) => {
                        let cell = cell.clone();
                        *cell.borrow_mut() = value;
                    }
                    _ => self.active.stack[idx] = value,
                }
            }
            Op::LoadUpval(idx) => {
                let value = self.frame().func.upvals[idx as usize].borrow().clone();
                self.push(value);
            }
            Op::StoreUpval(idx) => {
                let value = self.pop();
                let cell: CellRef = self.frame().func.upvals[idx as usize].clone();
                *cell.borrow_mut() = value;
            }
            Op::LoadGlobal(name) => {
                let sym = self.const_sym(name);
                let value = self.interp.globals.get(&sym).cloned().unwrap_or(Value::Nil);
                self.push(value);
            }
            Op::StoreGlobal(name) => {
                let sym = self.const_sym(name);
                let value = self.pop();
                self.interp.globals.insert(sym, value);
            }
            Op::LoadName { name, .. } => {
                let sym = self.const_sym(name);
                if let Some(value) = self.interp.globals.get(&sym).cloned() {
                    self.push(value);
                } else {
                    let recv = self.frame().self_val.clone();
                    let class = self.dispatch_class(&recv);
                    match lookup_method(&class, sym, self.interp.epoch) {
                        Some((record, owner)) => {
                            self.begin_invoke(recv, record, owner, sym, Vec::new(), None, None)?
                        }
                        None => {
                            let name = self.sym_name(sym);
                            return Err(self.raise(
                                ExcKind::NameError,
                                format!("undefined local variable or method '{name}'"),
                            ));
                        }
                    }
                }
            }
            Op::LoadIvar(name) => {
                let sym = self.const_sym(name);
                let recv = self.frame().self_val.clone();
                let value = self.read_ivar(&recv, sym);
                self.push(value);
            }
            Op::StoreIvar(name) => {
                let sym = self.const_sym(name);
                let value = self.pop();
                let recv = self.frame().self_val.clone();
                self.write_ivar(&recv, sym, value)?;
            }
            Op::LoadCvar(name) => {
                let sym = self.const_sym(name);
                let class = self.cvar_class()?;
                match cvar_lookup(&class, sym) {
                    Some(value) => self.push(value),
                    None => {
                        let name = self.sym_name(sym);
                        return Err(self.raise(
                            ExcKind::NameError,
                            format!("uninitialized class variable @@{name}"),
                        ));
                    }
                }
            }
            Op::StoreCvar(name) => {
                let sym = self.const_sym(name);
                let value = self.pop();
                let class = self.cvar_class()?;
                cvar_store(&class, sym, value);
            }
            Op::LoadConstName(name) => {
                let sym = self.const_sym(name);
                match self.lookup_constant(sym) {
                    Some(value) => self.push(value),
                    None => {
                        let name = self.sym_name(sym);
                        return Err(self
                            .raise(ExcKind::NameError, format!("uninitialized constant {name}")));
                    }
                }
            }
            Op::StoreConstName(name) => {
                let sym = self.const_sym(name);
                let value = self.pop();
                let target = self
                    .frame()
                    .def_target
                    .clone()
                    .unwrap_or_else(|| self.interp.core.object.clone());
                target.borrow_mut().constants.insert(sym, value);
            }

            Op::Add => self.binop_add()?,
            Op::Sub => self.binop_arith(Op::Sub)?,
            Op::Mul => self.binop_arith(Op::Mul)?,
            Op::Div => self.binop_arith(Op::Div)?,
            Op::Rem => self.binop_arith(Op::Rem)?,
            Op::Neg => {
                let value = self.pop();
                match value {
                    Value::Int(v) => self.push(Value::Int(v.wrapping_neg())),
                    Value::Float(v) => self.push(Value::Float(-v)),
                    other => {
                        let kind = other.kind_name();
                        return Err(
                            self.raise(ExcKind::TypeError, format!("can't negate {kind}"))
                        );
                    }
                }
            }
            Op::Not => {
                let value = self.pop();
                self.push(Value::Bool(!value.truthy()));
            }
            Op::Eq => {
                let rhs = self.pop();
                let lhs = self.pop();
                let eq = self.values_equal(&lhs, &rhs)?;
                self.push(Value::Bool(eq));
            }
            Op::Ne => {
                let rhs = self.pop();
                let lhs = self.pop();
                let eq = self.values_equal(&lhs, &rhs)?;
                self.push(Value::Bool(!eq));
            }
            Op::Lt => self.binop_compare(Op::Lt)?,
            Op::Le => self.binop_compare(Op::Le)?,
            Op::Gt => self.binop_compare(Op::Gt)?,
            Op::Ge => self.binop_compare(Op::Ge)?,
            Op::BitAnd | Op::BitOr | Op::BitXor | Op::Shl | Op::Shr => self.binop_bits(op)?,
            Op::ToS => {
                let value = self.pop();
                let text = self.display(&value)?;
                let string = self.new_string(text.into_bytes())?;
                self.push(string);
            }
            Op::StrCat => {
                let rhs = self.pop();
                let lhs = self.pop();
                let mut bytes = match &lhs {
                    Value::Str(s) => s.borrow().bytes.clone(),
                    other => self.display_basic(other).into_bytes(),
                };
                match &rhs {
                    Value::Str(s) => bytes.extend_from_slice(&s.borrow().bytes),
                    other => bytes.extend_from_slice(self.display_basic(other).as_bytes()),
                }
                let string = self.new_string(bytes)?;
                self.push(string);
            }

            Op::Jump(target) => self.frame_mut().pc = target as usize,
            Op::JumpIfFalse(target) => {
                let cond = self.pop();
                if !cond.truthy() {
                    self.frame_mut().pc = target as usize;
                }
            }
            Op::JumpIfTrue(target) => {
                let cond = self.pop();
                if cond.truthy() {
                    self.frame_mut().pc = target as usize;
                }
            }
            Op::JumpIfNil(target) => {
                if matches!(self.peek(), Value::Nil) {
                    self.frame_mut().pc = target as usize;
                }
            }

            Op::CallSelf { name, argc, flags, cache } => {
                let (args, kwargs, block) = self.collect_call_operands(argc, flags)?;
                let recv = self.frame().self_val.clone();
                let sym = self.const_sym(name);
                self.dispatch(recv, sym, args, kwargs, block, false, Some(cache))?;
            }
            Op::CallMethod { name, argc, flags, cache } => {
                let (args, kwargs, block) = self.collect_call_operands(argc, flags)?;
                let recv = self.pop();
                let sym = self.const_sym(name);
                self.dispatch(recv, sym, args, kwargs, block, true, Some(cache))?;
            }
            Op::Super { argc, flags } => {
                let (args, kwargs, block) = self.collect_call_operands(argc, flags)?;
                let frame = self.active.frames.last().expect("frame");
                let Some(ctx) = frame.method_ctx.clone() else {
                    return Err(
                        self.raise(ExcKind::RuntimeError, "super called outside of method")
                    );
                };
                let recv = frame.self_val.clone();
                let block = block.or_else(|| frame.block.clone());
                let class = self.dispatch_class(&recv);
                match lookup_method_after(&class, ctx.name, &ctx.owner, self.interp.epoch) {
                    Some((record, owner)) => {
                        self.begin_invoke(recv, record, owner, ctx.name, args, kwargs, block)?
                    }
                    None => {
                        let name = self.sym_name(ctx.name);
                        return Err(self.raise(
                            ExcKind::NoMethodError,
                            format!("super: no superclass method '{name}'"),
                        ));
                    }
                }
            }
            Op::Yield { argc } => {
                let mut args = Vec::with_capacity(argc as usize);
                for _ in 0..argc {
                    args.push(self.pop());
                }
                args.reverse();
                let frame_idx = self.active.frames.len() - 1;
                let block = self.frame().block.clone();
                let Some(Value::Function(func)) = block else {
                    // inside a fiber body, a bare `yield` suspends the fiber
                    if self.active_ref.borrow().parent.is_some() {
                        let value = args.into_iter().next().unwrap_or(Value::Nil);
                        return Err(Flow::FiberYield(value));
                    }
                    return Err(self.raise(ExcKind::RuntimeError, "no block given (yield)"));
                };
                let self_val = func.self_val.clone();
                self.push_bytecode_frame(
                    func,
                    self_val,
                    args,
                    None,
                    None,
                    FrameKind::Block { yielder: Some(frame_idx) },
                    None,
                )?;
            }

            Op::Return | Op::Next => {
                let value = self.pop();
                return self.finish_frame(value, stop);
            }
            Op::ReturnMethod => {
                let value = self.pop();
                let home = self.frame().home_id;
                return self.method_return(value, home, stop);
            }
            Op::Break => {
                let value = self.pop();
                return self.do_break(value, stop);
            }
            Op::Redo => {
                let frame = self.active.frames.last_mut().expect("frame");
                match frame.kind {
                    FrameKind::Block { yielder: Some(_) } => {
                        frame.pc = 0;
                        let operand_base = frame.operand_base;
                        self.active.stack.truncate(operand_base);
                    }
                    FrameKind::Block { yielder: None } => {
                        let base = frame.base;
                        self.active.frames.pop();
                        self.active.stack.truncate(base);
                        return Err(Flow::RedoSignal);
                    }
                    _ => {
                        return Err(
                            self.raise(ExcKind::RuntimeError, "redo outside of a block")
                        );
                    }
                }
            }

            Op::MakeClosure(proto_idx) => {
                let (proto, frame_self, frame_block, def_target) = {
                    let frame = self.active.frames.last().expect("frame");
                    let Const::Proto(proto) = &frame.func.proto.consts[proto_idx as usize] else {
                        return Err(
                            self.raise(ExcKind::RuntimeError, "closure constant is not a proto")
                        );
                    };
                    (
                        proto.clone(),
                        frame.self_val.clone(),
                        frame.block.clone(),
                        frame.def_target.clone(),
                    )
                };
                let mut upvals = Vec::with_capacity(proto.upvals.len());
                for desc in &proto.upvals {
                    let cell = match *desc {
                        ruse_core::proto::UpvalDesc::FromLocal(slot) => {
                            let frame = self.active.frames.last().expect("frame");
                            match &self.active.stack[frame.base + slot as usize] {
                                Value::Cell(cell) => cell.clone(),
                                other => Rc::new(RefCell::new(other.clone())),
                            }
                        }
                        ruse_core::proto::UpvalDesc::FromUpval(idx) => {
                            self.frame().func.upvals[idx as usize].clone()
                        }
                    };
                    upvals.push(cell);
                }
                self.alloc_tick(64)?;
                let ncaches = proto.ncaches as usize;
                let home_id = self.frame().home_id;
                let func = FunctionData {
                    proto,
                    upvals,
                    self_val: frame_self,
                    outer_block: frame_block,
                    def_target,
                    home_id,
                    caches: RefCell::new(vec![CallCache::default(); ncaches]),
                };
                self.push(Value::Function(Rc::new(func)));
            }
            Op::MakeArray(n) => {
                let mut elems = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    elems.push(self.pop());
                }
                elems.reverse();
                let array = self.new_array(elems)?;
                self.push(array);
            }
            Op::MakeHash(n) => {
                let mut pairs = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    let value = self.pop();
                    let key = self.pop();
                    pairs.push((key, value));
                }
                pairs.reverse();
                let mut entries = IndexMap::with_capacity(pairs.len());
                for (key, value) in pairs {
                    entries.insert(HashKey(self.freeze_key(key)?), value);
                }
                let hash = self.new_hash(entries)?;
                self.push(hash);
            }
            Op::MakeRange { exclusive } => {
                let end = self.pop();
                let start = self.pop();
                let range = self.new_range(start, end, exclusive)?;
                self.push(range);
            }
            Op::IndexGet { argc, .. } => self.index_get(argc)?,
            Op::IndexSet { argc, .. } => self.index_set(argc)?,
            Op::Unpack { before, rest, after } => {
                let value = self.pop();
                let elems: Vec<Value> = match &value {
                    Value::Array(a) => a.borrow().elems.clone(),
                    other => vec![other.clone()],
                };
                let before = before as usize;
                let after = after as usize;
                for i in 0..before {
                    self.push(elems.get(i).cloned().unwrap_or(Value::Nil));
                }
                if rest {
                    let hi = elems.len().saturating_sub(after).max(before);
                    let middle: Vec<Value> = elems[before.min(elems.len())..hi.min(elems.len())].to_vec();
                    let array = self.new_array(middle)?;
                    self.push(array);
                }
                for i in 0..after {
                    let idx = elems.len().saturating_sub(after) + i;
                    self.push(elems.get(idx).cloned().unwrap_or(Value::Nil));
                }
            }

            Op::DefineClass { name, has_super, body } => self.define_class(name, has_super, body)?,
            Op::DefineModule { name, body } => self.define_module(name, body)?,
            Op::DefineMethod { name, proto } => self.define_method_op(name, proto)?,
            Op::DefineSingletonMethod { name, proto } => {
                self.define_singleton_method_op(name, proto)?
            }

            Op::EnterRescue(region) => {
                let depth = self.active.stack.len();
                self.frame_mut().handlers.push(HandlerCtx { region, depth });
            }
            Op::LeaveRescue => {
                self.frame_mut().handlers.pop();
            }
            Op::Raise => {
                let value = self.pop();
                return Err(self.raise_value(value));
            }
            Op::RescueMatch => {
                let filter = self.pop();
                let exc = self.peek().clone();
                let Value::Class(class) = filter else {
                    return Err(self.raise(
                        ExcKind::TypeError,
                        "class or module required for rescue clause",
                    ));
                };
                let matched = self.is_instance_of(&exc, &class);
                self.push(Value::Bool(matched));
            }
            Op::EndEnsure => {
                let pending = self.frame_mut().pending.take();
                match pending {
                    None => {}
                    Some(Pending::Raise(exc)) => {
                        self.unwind_raise(exc, stop)?;
                    }
                    Some(Pending::FrameReturn(value)) => return self.finish_frame(value, stop),
                    Some(Pending::MethodReturn { value, home }) => {
                        return self.method_return(value, home, stop);
                    }
                    Some(Pending::Break { target, value }) => {
                        return self.break_toward(target, value, stop);
                    }
                }
            }

            Op::BranchArgSet { index, target } => {
                if self.frame().nargs_given > index {
                    self.frame_mut().pc = target as usize;
                }
            }
            Op::BranchKwSet { index, target } => {
                if self.frame().kw_given & (1 << index) != 0 {
                    self.frame_mut().pc = target as usize;
                }
            }
        }
        Ok(Unwound::Continue)
    }

    // ---- small stack utilities ----

    #[inline]
    fn push(&mut self, value: Value) {
        self.active.stack.push(value);
    }

    #[inline]
    fn pop(&mut self) -> Value {
        self.active.stack.pop().expect("operand stack underflow")
    }

    #[inline]
    fn peek(&self) -> &Value {
        self.active.stack.last().expect("operand stack underflow")
    }

    #[inline]
    fn frame(&self) -> &Frame {
        self.active.frames.last().expect("no active frame")
    }

    #[inline]
    fn frame_mut(&mut self) -> &mut Frame {
        self.active.frames.last_mut().expect("no active frame")
    }

    fn const_sym(&self, idx: u16) -> Symbol {
        match self.frame().func.proto.consts[idx as usize] {
            Const::Sym(sym) => sym,
            _ => unreachable!("name operand must be a symbol constant"),
        }
    }

    // ---- variables ----

    pub fn read_ivar(&mut self, recv: &Value, name: Symbol) -> Value {
        match recv {
            Value::Object(o) => o.borrow().ivars.get(&name).cloned().unwrap_or(Value::Nil),
            Value::Class(c) => c.borrow().ivars.get(&name).cloned().unwrap_or(Value::Nil),
            _ => Value::Nil,
        }
    }

    pub fn write_ivar(&mut self, recv: &Value, name: Symbol, value: Value) -> Result<(), Flow> {
        match recv {
            Value::Object(o) => {
                if o.borrow().meta.frozen {
                    let class = self.class_of(recv);
                    let cname = self.sym_name(class.borrow().name).to_string();
                    return Err(
                        self.raise(ExcKind::RuntimeError, format!("can't modify frozen {cname}"))
                    );
                }
                o.borrow_mut().ivars.insert(name, value);
                Ok(())
            }
            Value::Class(c) => {
                c.borrow_mut().ivars.insert(name, value);
                Ok(())
            }
            other => {
                let kind = other.kind_name();
                Err(self.raise(
                    ExcKind::TypeError,
                    format!("can't set instance variable on {kind}"),
                ))
            }
        }
    }

    /// The class that owns class-variable access from the current frame.
    fn cvar_class(&mut self) -> Result<ClassRef, Flow> {
        if let Some(target) = self.frame().def_target.clone() {
            // class variables in `def self.` methods belong to the class,
            // not its metaclass
            let attached = target.borrow().attached.as_ref().and_then(std::rc::Weak::upgrade);
            return Ok(attached.unwrap_or(target));
        }
        let recv = self.frame().self_val.clone();
        match &recv {
            Value::Class(c) => Ok(c.clone()),
            Value::Object(o) => Ok(o.borrow().class.clone()),
            _ => Err(self.raise(ExcKind::RuntimeError, "class variable access from top level")),
        }
    }

    fn lookup_constant(&mut self, name: Symbol) -> Option<Value> {
        if let Some(target) = self.frame().def_target.clone() {
            if let Some(value) = target.borrow().constants.get(&name) {
                return Some(value.clone());
            }
            for ancestor in ancestors(&target, self.interp.epoch).iter() {
                if let Some(value) = ancestor.borrow().constants.get(&name) {
                    return Some(value.clone());
                }
            }
        }
        self.interp.core.object.borrow().constants.get(&name).cloned()
    }

    // ---- calls ----

    fn collect_call_operands(
        &mut self,
        argc: u8,
        flags: ruse_core::proto::CallFlags,
    ) -> Result<(Vec<Value>, Option<Value>, Option<Value>), Flow> {
        let block = if flags.block {
            match self.pop() {
                Value::Nil => None,
                b => Some(b),
            }
        } else {
            None
        };
        let kwargs = if flags.kwargs { Some(self.pop()) } else { None };
        let mut args = Vec::with_capacity(argc as usize);
        for _ in 0..argc {
            args.push(self.pop());
        }
        args.reverse();
        if flags.splat {
            match args.pop() {
                Some(Value::Array(arr)) => args.extend(arr.borrow().elems.iter().cloned()),
                Some(other) => args.push(other),
                None => {}
            }
        }
        Ok((args, kwargs, block))
    }

    /// Method dispatch with inline cache, visibility, and
    /// method_missing.
    #[allow(clippy::too_many_arguments)]
    fn dispatch(
        &mut self,
        recv: Value,
        name: Symbol,
        args: Vec<Value>,
        kwargs: Option<Value>,
        block: Option<Value>,
        explicit_recv: bool,
        cache: Option<u16>,
    ) -> Result<(), Flow> {
        let class = self.dispatch_class(&recv);
        let epoch = self.interp.epoch;
        let class_ptr = Rc::as_ptr(&class) as usize;

        let cached = cache.and_then(|idx| {
            let frame = self.active.frames.last().expect("frame");
            let caches = frame.func.caches.borrow();
            let entry = caches.get(idx as usize)?;
            if entry.class_ptr == class_ptr && entry.epoch == epoch {
                entry.entry.clone()
            } else {
                None
            }
        });

        let resolved = match cached {
            Some(found) => Some(found),
            None => {
                let found = lookup_method(&class, name, epoch);
                if let (Some(idx), Some(found)) = (cache, &found) {
                    let frame = self.active.frames.last().expect("frame");
                    let mut caches = frame.func.caches.borrow_mut();
                    if let Some(entry) = caches.get_mut(idx as usize) {
                        *entry = CallCache {
                            class_ptr,
                            epoch,
                            entry: Some(found.clone()),
                        };
                    }
                }
                found
            }
        };

        let Some((record, owner)) = resolved else {
            return self.dispatch_missing(recv, name, args, kwargs, block);
        };

        if explicit_recv {
            match record.visibility {
                Visibility::Private => {
                    let name = self.sym_name(name);
                    return Err(self.raise(
                        ExcKind::NoMethodError,
                        format!("private method '{name}' called"),
                    ));
                }
                Visibility::Protected => {
                    let caller_self = self.frame().self_val.clone();
                    let caller_class = self.class_of(&caller_self);
                    if !has_ancestor(&caller_class, &owner, epoch) {
                        let name = self.sym_name(name);
                        return Err(self.raise(
                            ExcKind::NoMethodError,
                            format!("protected method '{name}' called"),
                        ));
                    }
                }
                Visibility::Public => {}
            }
        }

        self.begin_invoke(recv, record, owner, name, args, kwargs, block)
    }

    fn dispatch_missing(
        &mut self,
        recv: Value,
        name: Symbol,
        mut args: Vec<Value>,
        kwargs: Option<Value>,
        block: Option<Value>,
    ) -> Result<(), Flow> {
        let class = self.dispatch_class(&recv);
        let epoch = self.interp.epoch;
        let mm = self.intern("method_missing");
        if let Some((record, owner)) = lookup_method(&class, mm, epoch) {
            // gate through respond_to_missing? when the class defines it
            let rtm = self.intern("respond_to_missing?");
            if let Some((rtm_record, rtm_owner)) = lookup_method(&class, rtm, epoch) {
                let verdict = self.invoke_direct(
                    recv.clone(),
                    rtm_record,
                    rtm_owner,
                    rtm,
                    vec![Value::Symbol(name), Value::Bool(false)],
                    None,
                )?;
                if !verdict.truthy() {
                    return Err(self.undefined_method(&recv, name));
                }
            }
            args.insert(0, Value::Symbol(name));
            return self.begin_invoke(recv, record, owner, mm, args, kwargs, block);
        }
        Err(self.undefined_method(&recv, name))
    }

    fn undefined_method(&mut self, recv: &Value, name: Symbol) -> Flow {
        let name = self.sym_name(name);
        let class = self.class_of(recv);
        let class_name = self.sym_name(class.borrow().name);
        self.raise(
            ExcKind::NoMethodError,
            format!("undefined method '{name}' for {class_name}"),
        )
    }

    /// Invoke a resolved method: bytecode pushes a frame and returns to
    /// the loop; natives and accessors complete immediately.
    #[allow(clippy::too_many_arguments)]
    fn begin_invoke(
        &mut self,
        recv: Value,
        record: MethodRecord,
        owner: ClassRef,
        name: Symbol,
        mut args: Vec<Value>,
        kwargs: Option<Value>,
        block: Option<Value>,
    ) -> Result<(), Flow> {
        match record.kind {
            MethodKind::Bytecode(func) => self.push_bytecode_frame(
                func,
                recv,
                args,
                kwargs,
                block,
                FrameKind::Method,
                Some(MethodCtx { owner, name }),
            ),
            MethodKind::Native(nm) => {
                if let Some(hash) = kwargs {
                    args.push(hash);
                }
                let result = (nm.f)(self, NativeArgs { recv, args: &args, block })?;
                self.push(result);
                Ok(())
            }
            MethodKind::AttrReader(ivar) => {
                let value = self.read_ivar(&recv, ivar);
                self.push(value);
                Ok(())
            }
            MethodKind::AttrWriter(ivar) => {
                let value = args.first().cloned().unwrap_or(Value::Nil);
                self.write_ivar(&recv, ivar, value.clone())?;
                self.push(value);
                Ok(())
            }
        }
    }

    // ---- operators ----

    fn binop_add(&mut self) -> Result<(), Flow> {
        let rhs = self.pop();
        let lhs = self.pop();
        let value = match (&lhs, &rhs) {
            (Value::Int(a), Value::Int(b)) => Value::Int(a.wrapping_add(*b)),
            (Value::Float(a), Value::Float(b)) => Value::Float(a + b),
            (Value::Int(a), Value::Float(b)) => Value::Float(*a as f64 + b),
            (Value::Float(a), Value::Int(b)) => Value::Float(a + *b as f64),
            (Value::Str(a), Value::Str(b)) => {
                let mut bytes = a.borrow().bytes.clone();
                bytes.extend_from_slice(&b.borrow().bytes);
                self.new_string(bytes)?
            }
            (Value::Array(a), Value::Array(b)) => {
                let mut elems = a.borrow().elems.clone();
                elems.extend(b.borrow().elems.iter().cloned());
                self.new_array(elems)?
            }
            (Value::Object(_), _) | (Value::Class(_), _) => {
                let sym = self.intern("+");
                let value = self.call_method(&lhs, sym, &[rhs], None)?;
                self.push(value);
                return Ok(());
            }
            _ => return Err(self.coercion_error(&lhs, &rhs, "+")),
        };
        self.push(value);
        Ok(())
    }

    fn binop_arith(&mut self, op: Op) -> Result<(), Flow> {
        let rhs = self.pop();
        let lhs = self.pop();
        let name = match op {
            Op::Sub => "-",
            Op::Mul => "*",
            Op::Div => "/",
            Op::Rem => "%",
            _ => unreachable!(),
        };
        let value = match (&lhs, &rhs) {
            (Value::Int(a), Value::Int(b)) => match op {
                Op::Sub => Value::Int(a.wrapping_sub(*b)),
                Op::Mul => Value::Int(a.wrapping_mul(*b)),
                Op::Div => {
                    if *b == 0 {
                        return Err(self.raise(ExcKind::ZeroDivisionError, "divided by 0"));
                    }
                    Value::Int(floor_div(*a, *b))
                }
                Op::Rem => {
                    if *b == 0 {
                        return Err(self.raise(ExcKind::ZeroDivisionError, "divided by 0"));
                    }
                    Value::Int(floor_rem(*a, *b))
                }
                _ => unreachable!(),
            },
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                let a = to_f64(&lhs);
                let b = to_f64(&rhs);
                match op {
                    Op::Sub => Value::Float(a - b),
                    Op::Mul => Value::Float(a * b),
                    Op::Div => {
                        if b == 0.0 {
                            return Err(self.raise(ExcKind::ZeroDivisionError, "divided by 0"));
                        }
                        Value::Float(a / b)
                    }
                    Op::Rem => {
                        if b == 0.0 {
                            return Err(self.raise(ExcKind::ZeroDivisionError, "divided by 0"));
                        }
                        Value::Float(a - b * (a / b).floor())
                    }
                    _ => unreachable!(),
                }
            }
            (Value::Str(s), Value::Int(n)) if matches!(op, Op::Mul) => {
                let mut bytes = Vec::new();
                for _ in 0..(*n).max(0) {
                    bytes.extend_from_slice(&s.borrow().bytes);
                }
                self.new_string(bytes)?
            }
            (Value::Object(_), _) | (Value::Class(_), _) => {
                let sym = self.intern(name);
                let value = self.call_method(&lhs, sym, &[rhs], None)?;
                self.push(value);
                return Ok(());
            }
            _ => return Err(self.coercion_error(&lhs, &rhs, name)),
        };
        self.push(value);
        Ok(())
    }

    fn binop_compare(&mut self, op: Op) -> Result<(), Flow> {
        let rhs = self.pop();
        let lhs = self.pop();
        let name = match op {
            Op::Lt => "<",
            Op::Le => "<=",
            Op::Gt => ">",
            Op::Ge => ">=",
            _ => unreachable!(),
        };
        let ordering = match (&lhs, &rhs) {
            (Value::Int(a), Value::Int(b)) => a.partial_cmp(b),
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                to_f64(&lhs).partial_cmp(&to_f64(&rhs))
            }
            (Value::Str(a), Value::Str(b)) => a.borrow().bytes.partial_cmp(&b.borrow().bytes),
            (Value::Symbol(a), Value::Symbol(b)) => {
                let a = self.sym_name(*a);
                let b = self.sym_name(*b);
                a.partial_cmp(&b)
            }
            (Value::Object(_), _) | (Value::Class(_), _) => {
                let sym = self.intern(name);
                let value = self.call_method(&lhs, sym, &[rhs], None)?;
                self.push(value);
                return Ok(());
            }
            _ => return Err(self.coercion_error(&lhs, &rhs, name)),
        };
        let result = match ordering {
            // NaN comparisons are all false, per IEEE-754
            None => false,
            Some(ordering) => match op {
                Op::Lt => ordering.is_lt(),
                Op::Le => ordering.is_le(),
                Op::Gt => ordering.is_gt(),
                Op::Ge => ordering.is_ge(),
                _ => unreachable!(),
            },
        };
        self.push(Value::Bool(result));
        Ok(())
    }

    fn binop_bits(&mut self, op: Op) -> Result<(), Flow> {
        let rhs = self.pop();
        let lhs = self.pop();
        match (&lhs, &rhs) {
            (Value::Int(a), Value::Int(b)) => {
                let value = match op {
                    Op::BitAnd => a & b,
                    Op::BitOr => a | b,
                    Op::BitXor => a ^ b,
                    Op::Shl => a.wrapping_shl(*b as u32),
                    Op::Shr => a.wrapping_shr(*b as u32),
                    _ => unreachable!(),
                };
                self.push(Value::Int(value));
                Ok(())
            }
            (Value::Array(arr), _) if matches!(op, Op::Shl) => {
                self.check_frozen(&lhs)?;
                arr.borrow_mut().elems.push(rhs.clone());
                self.push(lhs.clone());
                Ok(())
            }
            (Value::Str(s), Value::Str(t)) if matches!(op, Op::Shl) => {
                self.check_frozen(&lhs)?;
                let extra = t.borrow().bytes.clone();
                s.borrow_mut().bytes.extend_from_slice(&extra);
                self.push(lhs.clone());
                Ok(())
            }
            (Value::Object(_), _) => {
                let name = match op {
                    Op::BitAnd => "&",
                    Op::BitOr => "|",
                    Op::BitXor => "^",
                    Op::Shl => "<<",
                    Op::Shr => ">>",
                    _ => unreachable!(),
                };
                let sym = self.intern(name);
                let value = self.call_method(&lhs, sym, &[rhs], None)?;
                self.push(value);
                Ok(())
            }
            _ => Err(self.coercion_error(&lhs, &rhs, "bit operation")),
        }
    }

    fn coercion_error(&mut self, lhs: &Value, rhs: &Value, op: &str) -> Flow {
        let l = lhs.kind_name();
        let r = rhs.kind_name();
        self.raise(ExcKind::TypeError, format!("{r} can't be coerced into {l} for '{op}'"))
    }

    pub fn check_frozen(&mut self, value: &Value) -> Result<(), Flow> {
        if value.frozen() && !matches!(value, Value::Nil | Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::Symbol(_)) {
            let class = self.class_of(value);
            let name = self.sym_name(class.borrow().name).to_string();
            return Err(self.raise(ExcKind::RuntimeError, format!("can't modify frozen {name}")));
        }
        Ok(())
    }

    /// String keys are copied frozen so later mutation of the original
    /// cannot corrupt the table.
    fn freeze_key(&mut self, key: Value) -> Result<Value, Flow> {
        match &key {
            Value::Str(s) => {
                let bytes = s.borrow().bytes.clone();
                let frozen = self.new_string(bytes)?;
                if let Value::Str(f) = &frozen {
                    f.borrow_mut().meta.frozen = true;
                }
                Ok(frozen)
            }
            _ => Ok(key),
        }
    }

    fn index_get(&mut self, argc: u8) -> Result<(), Flow> {
        let mut args = Vec::with_capacity(argc as usize);
        for _ in 0..argc {
            args.push(self.pop());
        }
        args.reverse();
        let recv = self.pop();
        match (&recv, args.as_slice()) {
            (Value::Array(arr), [Value::Int(i)]) => {
                let arr = arr.borrow();
                let idx = normalize_index(*i, arr.elems.len());
                let value = idx.and_then(|i| arr.elems.get(i).cloned()).unwrap_or(Value::Nil);
                self.push(value);
            }
            (Value::Array(arr), [Value::Int(start), Value::Int(len)]) => {
                let arr = arr.borrow();
                let slice = match normalize_index(*start, arr.elems.len() + 1) {
                    Some(start) if *len >= 0 => {
                        let end = (start + *len as usize).min(arr.elems.len());
                        arr.elems.get(start..end).map(<[Value]>::to_vec)
                    }
                    _ => None,
                };
                drop(arr);
                match slice {
                    Some(elems) => {
                        let value = self.new_array(elems)?;
                        self.push(value);
                    }
                    None => self.push(Value::Nil),
                }
            }
            (Value::Hash(h), [key]) => {
                let value = h
                    .borrow()
                    .entries
                    .get(&HashKey(key.clone()))
                    .cloned()
                    .unwrap_or(Value::Nil);
                self.push(value);
            }
            (Value::Str(s), [Value::Int(i)]) => {
                let s = s.borrow();
                let value = normalize_index(*i, s.bytes.len())
                    .map(|i| vec![s.bytes[i]]);
                drop(s);
                match value {
                    Some(bytes) => {
                        let string = self.new_string(bytes)?;
                        self.push(string);
                    }
                    None => self.push(Value::Nil),
                }
            }
            (Value::Str(s), [Value::Int(start), Value::Int(len)]) => {
                let s = s.borrow();
                let slice = match normalize_index(*start, s.bytes.len() + 1) {
                    Some(start) if *len >= 0 => {
                        let end = (start + *len as usize).min(s.bytes.len());
                        s.bytes.get(start..end).map(<[u8]>::to_vec)
                    }
                    _ => None,
                };
                drop(s);
                match slice {
                    Some(bytes) => {
                        let string = self.new_string(bytes)?;
                        self.push(string);
                    }
                    None => self.push(Value::Nil),
                }
            }
            _ => {
                let sym = self.intern("[]");
                let value = self.call_method(&recv, sym, &args, None)?;
                self.push(value);
            }
        }
        Ok(())
    }

    fn index_set(&mut self, argc: u8) -> Result<(), Flow> {
        let value = self.pop();
        let mut args = Vec::with_capacity(argc as usize);
        for _ in 0..argc {
            args.push(self.pop());
        }
        args.reverse();
        let recv = self.pop();
        match (&recv, args.as_slice()) {
            (Value::Array(arr), [Value::Int(i)]) => {
                self.check_frozen(&recv)?;
                let mut arr = arr.borrow_mut();
                let len = arr.elems.len();
                let idx = if *i < 0 {
                    match normalize_index(*i, len) {
                        Some(idx) => idx,
                        None => {
                            drop(arr);
                            return Err(
                                self.raise(ExcKind::ArgumentError, format!("index {i} out of range"))
                            );
                        }
                    }
                } else {
                    *i as usize
                };
                if idx >= arr.elems.len() {
                    arr.elems.resize(idx + 1, Value::Nil);
                }
                arr.elems[idx] = value.clone();
            }
            (Value::Hash(h), [key]) => {
                self.check_frozen(&recv)?;
                let key = self.freeze_key(key.clone())?;
                h.borrow_mut().entries.insert(HashKey(key), value.clone());
            }
            _ => {
                let sym = self.intern("[]=");
                let mut call_args = args;
                call_args.push(value.clone());
                self.call_method(&recv, sym, &call_args, None)?;
            }
        }
        self.push(value);
        Ok(())
    }

    // ---- definitions ----

    fn define_class(&mut self, name: u16, has_super: bool, body: u16) -> Result<(), Flow> {
        let sym = self.const_sym(name);
        let superclass = if has_super {
            match self.pop() {
                Value::Class(c) if !c.borrow().is_module => Some(c),
                _ => {
                    return Err(
                        self.raise(ExcKind::TypeError, "superclass must be a Class")
                    );
                }
            }
        } else {
            None
        };
        let home = self
            .frame()
            .def_target
            .clone()
            .unwrap_or_else(|| self.interp.core.object.clone());

        let existing = home
            .borrow()
            .constants
            .get(&sym)
            .cloned()
            .or_else(|| self.interp.core.object.borrow().constants.get(&sym).cloned());

        let class = match existing {
            Some(Value::Class(existing)) if !existing.borrow().is_module => {
                if let Some(given) = &superclass {
                    let current = existing.borrow().superclass.clone();
                    let matches = current.as_ref().is_some_and(|c| Rc::ptr_eq(c, given));
                    if !matches {
                        let name = self.sym_name(sym);
                        return Err(self.raise(
                            ExcKind::TypeError,
                            format!("superclass mismatch for class {name}"),
                        ));
                    }
                }
                existing
            }
            Some(_) => {
                let name = self.sym_name(sym);
                return Err(
                    self.raise(ExcKind::TypeError, format!("{name} is not a class"))
                );
            }
            None => {
                let superclass = superclass.unwrap_or_else(|| self.interp.core.object.clone());
                let class = ClassData::new(sym, Some(superclass.clone()), false);
                home.borrow_mut().constants.insert(sym, Value::Class(class.clone()));
                self.interp.epoch += 1;
                // Parent.inherited(Sub) hook
                let inherited = self.intern("inherited");
                let parent_value = Value::Class(superclass);
                let parent_class = self.dispatch_class(&parent_value);
                if let Some((record, owner)) =
                    lookup_method(&parent_class, inherited, self.interp.epoch)
                {
                    self.invoke_direct(
                        parent_value,
                        record,
                        owner,
                        inherited,
                        vec![Value::Class(class.clone())],
                        None,
                    )?;
                }
                class
            }
        };

        self.enter_class_body(class, body)
    }

    fn define_module(&mut self, name: u16, body: u16) -> Result<(), Flow> {
        let sym = self.const_sym(name);
        let home = self
            .frame()
            .def_target
            .clone()
            .unwrap_or_else(|| self.interp.core.object.clone());
        let existing = home
            .borrow()
            .constants
            .get(&sym)
            .cloned()
            .or_else(|| self.interp.core.object.borrow().constants.get(&sym).cloned());
        let module = match existing {
            Some(Value::Class(existing)) if existing.borrow().is_module => existing,
            Some(_) => {
                let name = self.sym_name(sym);
                return Err(
                    self.raise(ExcKind::TypeError, format!("{name} is not a module"))
                );
            }
            None => {
                let module = ClassData::new(sym, None, true);
                home.borrow_mut().constants.insert(sym, Value::Class(module.clone()));
                self.interp.epoch += 1;
                module
            }
        };
        self.enter_class_body(module, body)
    }

    fn enter_class_body(&mut self, class: ClassRef, body: u16) -> Result<(), Flow> {
        let Const::Proto(proto) = self.frame().func.proto.consts[body as usize].clone() else {
            return Err(self.raise(ExcKind::RuntimeError, "class body constant is not a proto"));
        };
        let func = Rc::new(FunctionData::for_proto(
            proto,
            Value::Class(class.clone()),
            Some(class.clone()),
        ));
        self.push_bytecode_frame(
            func,
            Value::Class(class),
            Vec::new(),
            None,
            None,
            FrameKind::ClassBody,
            None,
        )
    }

    fn define_method_op(&mut self, name: u16, proto: u16) -> Result<(), Flow> {
        let sym = self.const_sym(name);
        let Const::Proto(proto) = self.frame().func.proto.consts[proto as usize].clone() else {
            return Err(self.raise(ExcKind::RuntimeError, "method constant is not a proto"));
        };
        let definee = match self.frame().def_target.clone() {
            Some(target) => target,
            None => self.interp.core.object.clone(),
        };
        let func = Rc::new(FunctionData::for_proto(
            proto,
            Value::Nil,
            Some(definee.clone()),
        ));
        let visibility = definee.borrow().default_visibility;
        definee.borrow_mut().methods.insert(
            sym,
            MethodRecord { kind: MethodKind::Bytecode(func.clone()), visibility },
        );
        let module_function = definee.borrow().is_module && definee.borrow().module_function_mode;
        if module_function {
            let target = Value::Class(definee.clone());
            let singleton = self.singleton_class_of(&target)?;
            singleton
                .borrow_mut()
                .methods
                .insert(sym, MethodRecord::public(MethodKind::Bytecode(func)));
        }
        self.interp.epoch += 1;
        self.push(Value::Symbol(sym));
        Ok(())
    }

    fn define_singleton_method_op(&mut self, name: u16, proto: u16) -> Result<(), Flow> {
        let sym = self.const_sym(name);
        let Const::Proto(proto) = self.frame().func.proto.consts[proto as usize].clone() else {
            return Err(self.raise(ExcKind::RuntimeError, "method constant is not a proto"));
        };
        let target = self.pop();
        let singleton = self.singleton_class_of(&target)?;
        let func = Rc::new(FunctionData::for_proto(proto, Value::Nil, Some(singleton.clone())));
        singleton
            .borrow_mut()
            .methods
            .insert(sym, MethodRecord::public(MethodKind::Bytecode(func)));
        self.interp.epoch += 1;
        self.push(Value::Symbol(sym));
        Ok(())
    }

    /// Fetch or create the singleton class of a value.
    pub fn singleton_class_of(&mut self, value: &Value) -> Result<ClassRef, Flow> {
        match value {
            Value::Class(class) => Ok(self.class_singleton(class)),
            Value::Object(o) => {
                if let Some(singleton) = o.borrow().meta.singleton.clone() {
                    return Ok(singleton);
                }
                let base = o.borrow().class.clone();
                let singleton = self.make_singleton(&base);
                o.borrow_mut().meta.singleton = Some(singleton.clone());
                Ok(singleton)
            }
            Value::Str(s) => {
                if let Some(singleton) = s.borrow().meta.singleton.clone() {
                    return Ok(singleton);
                }
                let base = self.interp.core.string.clone();
                let singleton = self.make_singleton(&base);
                s.borrow_mut().meta.singleton = Some(singleton.clone());
                Ok(singleton)
            }
            Value::Array(a) => {
                if let Some(singleton) = a.borrow().meta.singleton.clone() {
                    return Ok(singleton);
                }
                let base = self.interp.core.array.clone();
                let singleton = self.make_singleton(&base);
                a.borrow_mut().meta.singleton = Some(singleton.clone());
                Ok(singleton)
            }
            Value::Hash(h) => {
                if let Some(singleton) = h.borrow().meta.singleton.clone() {
                    return Ok(singleton);
                }
                let base = self.interp.core.hash.clone();
                let singleton = self.make_singleton(&base);
                h.borrow_mut().meta.singleton = Some(singleton.clone());
                Ok(singleton)
            }
            other => {
                let kind = other.kind_name();
                Err(self.raise(
                    ExcKind::TypeError,
                    format!("can't define singleton on {kind}"),
                ))
            }
        }
    }

    /// Metaclass of a class; its superclass is the superclass's
    /// metaclass so class methods inherit.
    fn class_singleton(&mut self, class: &ClassRef) -> ClassRef {
        if let Some(singleton) = class.borrow().singleton.clone() {
            return singleton;
        }
        let parent = class.borrow().superclass.clone();
        let super_singleton = match parent {
            Some(parent) => self.class_singleton(&parent),
            None => self.interp.core.class_class.clone(),
        };
        let name = {
            let base = self.interp.symbols.name(class.borrow().name);
            self.interp.symbols.intern(&format!("#<Class:{base}>"))
        };
        let singleton = ClassData::new(name, Some(super_singleton), false);
        singleton.borrow_mut().is_singleton = true;
        singleton.borrow_mut().attached = Some(Rc::downgrade(class));
        class.borrow_mut().singleton = Some(singleton.clone());
        singleton
    }

    fn make_singleton(&mut self, base: &ClassRef) -> ClassRef {
        let name = {
            let base_name = self.interp.symbols.name(base.borrow().name);
            self.interp.symbols.intern(&format!("#<Class:#<{base_name}>>"))
        };
        let singleton = ClassData::new(name, Some(base.clone()), false);
        singleton.borrow_mut().is_singleton = true;
        self.interp.epoch += 1;
        singleton
    }

    // ---- unwinding ----

    /// Pop the current frame, delivering `value` to the caller; runs any
    /// armed ensure handlers first.
    fn finish_frame(&mut self, value: Value, stop: &Stop) -> Result<Unwound, Flow> {
        loop {
            let frame = self.active.frames.last_mut().expect("no frame to finish");
            if let Some(ctx) = frame.handlers.pop() {
                let region = frame.func.proto.regions[ctx.region as usize];
                if region.kind == HandlerKind::Ensure {
                    self.active.stack.truncate(ctx.depth);
                    let frame = self.active.frames.last_mut().expect("frame");
                    frame.pending = Some(Pending::FrameReturn(value));
                    frame.pc = region.handler as usize;
                    return Ok(Unwound::Continue);
                }
                continue;
            }
            let frame = self.active.frames.pop().expect("frame");
            self.active.stack.truncate(frame.base);
            if Rc::ptr_eq(&self.active_ref, &stop.fiber) && self.active.frames.len() == stop.depth
            {
                return Ok(Unwound::Done(value));
            }
            if self.active.frames.is_empty() {
                return self.fiber_finished(value).map(|()| Unwound::Continue);
            }
            self.push(value);
            return Ok(Unwound::Continue);
        }
    }

    /// `return` from inside a block: unwind until the defining method
    /// activation (identified by `home`) has been popped.
    fn method_return(&mut self, value: Value, home: u64, stop: &Stop) -> Result<Unwound, Flow> {
        loop {
            if self.active.frames.is_empty() {
                return self.fiber_finished(value).map(|()| Unwound::Continue);
            }
            if Rc::ptr_eq(&self.active_ref, &stop.fiber) && self.active.frames.len() <= stop.depth
            {
                // the enclosing method lives below a native re-entry;
                // a frozen Rust frame cannot be returned through
                return Err(self.raise(
                    ExcKind::RuntimeError,
                    "can't return across a native call boundary",
                ));
            }
            let frame = self.active.frames.last_mut().expect("frame");
            if let Some(ctx) = frame.handlers.pop() {
                let region = frame.func.proto.regions[ctx.region as usize];
                if region.kind == HandlerKind::Ensure {
                    self.active.stack.truncate(ctx.depth);
                    let frame = self.active.frames.last_mut().expect("frame");
                    frame.pending = Some(Pending::MethodReturn { value, home });
                    frame.pc = region.handler as usize;
                    return Ok(Unwound::Continue);
                }
                continue;
            }
            let frame = self.active.frames.pop().expect("frame");
            self.active.stack.truncate(frame.base);
            let is_home =
                frame.home_id == home && !matches!(frame.kind, FrameKind::Block { .. });
            if is_home {
                if Rc::ptr_eq(&self.active_ref, &stop.fiber)
                    && self.active.frames.len() == stop.depth
                {
                    return Ok(Unwound::Done(value));
                }
                if self.active.frames.is_empty() {
                    return self.fiber_finished(value).map(|()| Unwound::Continue);
                }
                self.push(value);
                return Ok(Unwound::Continue);
            }
        }
    }

    /// `break` out of the currently-executing block.
    fn do_break(&mut self, value: Value, stop: &Stop) -> Result<Unwound, Flow> {
        let kind = self.frame().kind;
        match kind {
            FrameKind::Block { yielder: Some(target) } => self.break_toward(target, value, stop),
            FrameKind::Block { yielder: None } => {
                let frame = self.active.frames.pop().expect("frame");
                self.active.stack.truncate(frame.base);
                if Rc::ptr_eq(&self.active_ref, &stop.fiber)
                    && self.active.frames.len() == stop.depth
                {
                    // natively-invoked block: surface the signal
                    return Err(Flow::BreakSignal(value));
                }
                Err(self.raise(ExcKind::RuntimeError, "break from orphan block"))
            }
            _ => Err(self.raise(ExcKind::RuntimeError, "break outside of a block")),
        }
    }

    /// Unwind frames down to (and including) `target`, the frame whose
    /// `yield` started the block; `target` returns `value`.
    fn break_toward(&mut self, target: usize, value: Value, stop: &Stop) -> Result<Unwound, Flow> {
        loop {
            if self.active.frames.is_empty() {
                return self.fiber_finished(value).map(|()| Unwound::Continue);
            }
            if Rc::ptr_eq(&self.active_ref, &stop.fiber) && self.active.frames.len() <= stop.depth
            {
                return Err(Flow::BreakSignal(value));
            }
            let frame = self.active.frames.last_mut().expect("frame");
            if let Some(ctx) = frame.handlers.pop() {
                let region = frame.func.proto.regions[ctx.region as usize];
                if region.kind == HandlerKind::Ensure {
                    self.active.stack.truncate(ctx.depth);
                    let frame = self.active.frames.last_mut().expect("frame");
                    frame.pending = Some(Pending::Break { target, value });
                    frame.pc = region.handler as usize;
                    return Ok(Unwound::Continue);
                }
                continue;
            }
            let index = self.active.frames.len() - 1;
            let frame = self.active.frames.pop().expect("frame");
            self.active.stack.truncate(frame.base);
            if index == target {
                if Rc::ptr_eq(&self.active_ref, &stop.fiber)
                    && self.active.frames.len() == stop.depth
                {
                    return Ok(Unwound::Done(value));
                }
                if self.active.frames.is_empty() {
                    return self.fiber_finished(value).map(|()| Unwound::Continue);
                }
                self.push(value);
                return Ok(Unwound::Continue);
            }
        }
    }

    /// Exception unwinding: walk armed handlers innermost-out across
    /// frames and fibers.
    fn unwind_raise(&mut self, exc: Exc, stop: &Stop) -> Result<(), Flow> {
        let mut exc = exc;
        loop {
            while !self.active.frames.is_empty() {
                // never unwind the caller of an inner run; hand the
                // exception back across the boundary instead
                if Rc::ptr_eq(&self.active_ref, &stop.fiber)
                    && self.active.frames.len() <= stop.depth
                {
                    return Err(Flow::Raise(exc));
                }
                let frame = self.active.frames.last_mut().expect("frame");
                if let Some(ctx) = frame.handlers.pop() {
                    let region = frame.func.proto.regions[ctx.region as usize];
                    self.active.stack.truncate(ctx.depth);
                    let frame = self.active.frames.last_mut().expect("frame");
                    frame.pc = region.handler as usize;
                    match region.kind {
                        HandlerKind::Rescue => {
                            self.push(exc.value.clone());
                            return Ok(());
                        }
                        HandlerKind::Ensure => {
                            frame.pending = Some(Pending::Raise(exc));
                            return Ok(());
                        }
                    }
                }
                let frame = self.active.frames.pop().expect("frame");
                self.active.stack.truncate(frame.base);
            }
            // the fiber died with the exception unhandled: propagate to
            // the parent at its resume site
            let parent = self.active_ref.borrow().parent.clone();
            match parent {
                Some(parent) => {
                    trace!(target: "ruse::fiber", "fiber died with uncaught exception");
                    {
                        let mut fiber = self.active_ref.borrow_mut();
                        fiber.status = FiberStatus::Dead;
                        fiber.saved = None;
                        fiber.body = None;
                    }
                    let state = parent
                        .borrow_mut()
                        .saved
                        .take()
                        .expect("suspended parent fiber must have saved state");
                    parent.borrow_mut().status = FiberStatus::Running;
                    self.active = *state;
                    self.active_ref = parent;
                    // continue unwinding in the parent
                    continue;
                }
                None => return Err(Flow::Raise(exc)),
            }
        }
    }

    // ---- fibers ----

    fn do_resume(&mut self, fiber: FiberRef, value: Value) -> Result<(), Flow> {
        if Rc::ptr_eq(&fiber, &self.active_ref) {
            return Err(self.raise(ExcKind::RuntimeError, "fiber already running (double resume)"));
        }
        // resuming an ancestor would corrupt the parent chain
        let mut walker = self.active_ref.borrow().parent.clone();
        while let Some(ancestor) = walker {
            if Rc::ptr_eq(&ancestor, &fiber) {
                return Err(self.raise(ExcKind::RuntimeError, "double resume of a waiting fiber"));
            }
            walker = ancestor.borrow().parent.clone();
        }

        let status = fiber.borrow().status;
        match status {
            FiberStatus::Dead => {
                self.push(Value::Nil);
                Ok(())
            }
            FiberStatus::Running => {
                Err(self.raise(ExcKind::RuntimeError, "fiber already running (double resume)"))
            }
            FiberStatus::Ready => {
                let body = fiber
                    .borrow_mut()
                    .body
                    .take()
                    .expect("ready fiber must have a body");
                self.suspend_active_into_record();
                {
                    let mut f = fiber.borrow_mut();
                    f.status = FiberStatus::Running;
                    f.parent = Some(self.active_ref.clone());
                }
                let mut state = FiberState::default();
                reset_meters(
                    &mut state,
                    self.interp.limits.instruction_limit,
                    self.interp.limits.allocation_limit,
                );
                self.active = state;
                self.active_ref = fiber;
                trace!(target: "ruse::fiber", "fiber started");
                let self_val = body.self_val.clone();
                self.push_bytecode_frame(
                    body,
                    self_val,
                    vec![value],
                    None,
                    None,
                    FrameKind::Block { yielder: None },
                    None,
                )
            }
            FiberStatus::Suspended => {
                let state = fiber
                    .borrow_mut()
                    .saved
                    .take()
                    .expect("suspended fiber must have saved state");
                self.suspend_active_into_record();
                {
                    let mut f = fiber.borrow_mut();
                    f.status = FiberStatus::Running;
                    f.parent = Some(self.active_ref.clone());
                }
                self.active = *state;
                self.active_ref = fiber;
                reset_meters(
                    &mut self.active,
                    self.interp.limits.instruction_limit,
                    self.interp.limits.allocation_limit,
                );
                trace!(target: "ruse::fiber", "fiber resumed");
                // the value becomes the result of the yield that
                // suspended the fiber
                self.push(value);
                Ok(())
            }
        }
    }

    fn do_fiber_yield(&mut self, value: Value) -> Result<(), Flow> {
        if self.active.native_depth > 0 {
            return Err(self.raise(
                ExcKind::RuntimeError,
                "can't yield across a native call boundary",
            ));
        }
        let parent = self.active_ref.borrow().parent.clone();
        let Some(parent) = parent else {
            return Err(self.raise(ExcKind::RuntimeError, "can't yield from the root fiber"));
        };
        self.suspend_active_into_record();
        let state = parent
            .borrow_mut()
            .saved
            .take()
            .expect("parent fiber must have saved state");
        parent.borrow_mut().status = FiberStatus::Running;
        self.active = *state;
        self.active_ref = parent;
        trace!(target: "ruse::fiber", "fiber yielded");
        // the value becomes the result of the parent's resume call
        self.push(value);
        Ok(())
    }

    /// The active fiber's body returned `value`.
    fn fiber_finished(&mut self, value: Value) -> Result<(), Flow> {
        let parent = self.active_ref.borrow().parent.clone();
        let Some(parent) = parent else {
            // the root fiber finishing is handled by the stop check;
            // reaching here means an unbalanced frame stack
            return Err(self.raise(ExcKind::RuntimeError, "root fiber ran out of frames"));
        };
        {
            let mut fiber = self.active_ref.borrow_mut();
            fiber.status = FiberStatus::Dead;
            fiber.saved = None;
            fiber.body = None;
        }
        let state = parent
            .borrow_mut()
            .saved
            .take()
            .expect("parent fiber must have saved state");
        parent.borrow_mut().status = FiberStatus::Running;
        self.active = *state;
        self.active_ref = parent;
        trace!(target: "ruse::fiber", "fiber finished");
        self.push(value);
        Ok(())
    }

    fn suspend_active_into_record(&mut self) {
        let state = std::mem::take(&mut self.active);
        let mut fiber = self.active_ref.borrow_mut();
        fiber.status = FiberStatus::Suspended;
        fiber.saved = Some(Box::new(state));
    }
}

fn reset_meters(state: &mut FiberState, instruction_limit: u64, allocation_limit: u64) {
    state.instructions = 0;
    state.allocations = 0;
    state.instr_trap = if instruction_limit == 0 { u64::MAX } else { instruction_limit };
    state.alloc_trap = if allocation_limit == 0 { u64::MAX } else { allocation_limit };
}

/// Floor division (toward negative infinity), matching the language's
/// integer semantics; `i64::MIN / -1` wraps.
pub fn floor_div(a: i64, b: i64) -> i64 {
    let q = a.wrapping_div(b);
    let r = a.wrapping_rem(b);
    if r != 0 && (r < 0) != (b < 0) { q - 1 } else { q }
}

/// Remainder matching floor division: the sign follows the divisor.
pub fn floor_rem(a: i64, b: i64) -> i64 {
    let r = a.wrapping_rem(b);
    if r != 0 && (r < 0) != (b < 0) { r + b } else { r }
}

fn to_f64(value: &Value) -> f64 {
    match value {
        Value::Int(v) => *v as f64,
        Value::Float(v) => *v,
        _ => f64::NAN,
    }
}

/// Negative indexes count from the end; out of range is None.
pub fn normalize_index(i: i64, len: usize) -> Option<usize> {
    if i >= 0 {
        let i = i as usize;
        (i < len).then_some(i)
    } else {
        let back = i.unsigned_abs() as usize;
        (back <= len).then(|| len - back)
    }
}

/// Integers print as themselves; floats always keep a decimal point so
/// `2.0` does not read as an integer.
pub fn format_float(v: f64) -> String {
    if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{v:.1}")
    } else {
        format!("{v}")
    }
}

fn cvar_lookup(class: &ClassRef, name: Symbol) -> Option<Value> {
    let mut current = Some(class.clone());
    while let Some(c) = current {
        if let Some(value) = c.borrow().cvars.get(&name) {
            return Some(value.clone());
        }
        current = c.borrow().superclass.clone();
    }
    None
}

/// Class variables are shared down the inheritance chain: writes land on
/// the ancestor that already owns the variable, else on the class
/// itself.
fn cvar_store(class: &ClassRef, name: Symbol, value: Value) {
    let mut current = Some(class.clone());
    while let Some(c) = current {
        if c.borrow().cvars.contains_key(&name) {
            c.borrow_mut().cvars.insert(name, value);
            return;
        }
        current = c.borrow().superclass.clone();
    }
    class.borrow_mut().cvars.insert(name, value);
}
