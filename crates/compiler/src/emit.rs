//! Bytecode emitter: AST to protos
//!
//! One [`FnCtx`] per function body being compiled; nested blocks and
//! method bodies push a child context, and finished children become
//! `Const::Proto` entries in their parent's pool.
//!
//! Scope rules: locals are function-scoped and assigned fixed slots.
//! Top-level names are globals (there are no top-level locals), which is
//! what lets definitions and state survive across host `eval` calls. A
//! block reaching an enclosing function's local promotes that local to a
//! boxed cell and reads it through an upvalue; names a block assigns that
//! resolve nowhere become block-locals, except under the top level where
//! they stay global.
//!
//! `begin/rescue/ensure` arms protected regions with `EnterRescue` /
//! `LeaveRescue`; the ensure body is additionally inlined on the normal
//! exit path and before any `break`/`next`/`return` that leaves the
//! region, so the handler copy only runs during unwinding.

use crate::ast::*;
use ruse_core::proto::*;
use ruse_core::{ErrorInfo, SymbolTable};
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

/// Compile a parsed program into its top-level proto.
pub fn compile_program(
    body: &[P<'_>],
    filename: &str,
    symbols: &mut SymbolTable,
) -> Result<Rc<Proto>, ErrorInfo> {
    let filename: Rc<str> = Rc::from(filename);
    let mut emitter = Emitter { symbols, filename: filename.clone(), fns: Vec::new() };
    emitter.push_fn(Rc::from("<main>"), ProtoKind::TopLevel, 1);
    emitter.compile_body(body, true)?;
    emitter.emit(Op::Return);
    Ok(Rc::new(emitter.pop_fn()))
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ConstKey {
    Int(i64),
    Float(u64),
    Str(String),
    Sym(u32),
}

struct LoopCtx {
    /// Jump target for `next` (the condition re-check).
    cond_pc: usize,
    /// Jump target for `redo`.
    body_pc: usize,
    break_jumps: Vec<usize>,
    /// Depth of the ensure stack at loop entry; `break` unwinds to here.
    ensure_mark: usize,
}

struct EnsureInfo<'a> {
    /// `Some` for ensure entries (the body to inline on early exits),
    /// `None` for rescue entries.
    body: Option<&'a [P<'a>]>,
}

struct FnCtx<'a> {
    name: Rc<str>,
    kind: ProtoKind,
    code: Vec<Op>,
    lines: Vec<u32>,
    consts: Vec<Const>,
    const_keys: HashMap<ConstKey, u16>,
    regions: Vec<Region>,
    params: ParamInfo,
    locals: HashMap<&'a str, u16>,
    nlocals: u16,
    cells: BTreeSet<u16>,
    upvals: Vec<UpvalDesc>,
    upval_names: HashMap<&'a str, u16>,
    ncaches: u16,
    loops: Vec<LoopCtx>,
    ensures: Vec<EnsureInfo<'a>>,
    retry_targets: Vec<usize>,
    cur_line: u32,
}

struct Emitter<'e, 'a> {
    symbols: &'e mut SymbolTable,
    filename: Rc<str>,
    fns: Vec<FnCtx<'a>>,
}

impl<'e, 'a> Emitter<'e, 'a> {
    fn push_fn(&mut self, name: Rc<str>, kind: ProtoKind, line: u32) {
        self.fns.push(FnCtx {
            name,
            kind,
            code: Vec::new(),
            lines: Vec::new(),
            consts: Vec::new(),
            const_keys: HashMap::new(),
            regions: Vec::new(),
            params: ParamInfo::default(),
            locals: HashMap::new(),
            nlocals: 0,
            cells: BTreeSet::new(),
            upvals: Vec::new(),
            upval_names: HashMap::new(),
            ncaches: 0,
            loops: Vec::new(),
            ensures: Vec::new(),
            retry_targets: Vec::new(),
            cur_line: line,
        });
    }

    fn pop_fn(&mut self) -> Proto {
        let f = self.fns.pop().expect("function context underflow");
        Proto {
            name: f.name,
            filename: self.filename.clone(),
            kind: f.kind,
            code: f.code,
            consts: f.consts,
            lines: f.lines,
            regions: f.regions,
            params: f.params,
            nlocals: f.nlocals,
            cells: f.cells.into_iter().collect(),
            upvals: f.upvals,
            ncaches: f.ncaches,
        }
    }

    fn f(&mut self) -> &mut FnCtx<'a> {
        self.fns.last_mut().expect("no function context")
    }

    fn err(&mut self, message: impl Into<String>) -> ErrorInfo {
        let line = self.f().cur_line;
        ErrorInfo::compile(message, &self.filename, line)
    }

    // ---- emission helpers ----

    fn emit(&mut self, op: Op) {
        let f = self.f();
        let line = f.cur_line;
        f.code.push(op);
        f.lines.push(line);
    }

    fn pc(&mut self) -> usize {
        self.f().code.len()
    }

    fn emit_jump(&mut self, make: fn(u32) -> Op) -> usize {
        let idx = self.pc();
        self.emit(make(u32::MAX));
        idx
    }

    fn patch_to_here(&mut self, idx: usize) {
        let target = self.pc() as u32;
        self.patch(idx, target);
    }

    fn patch(&mut self, idx: usize, target: u32) {
        match &mut self.f().code[idx] {
            Op::Jump(t)
            | Op::JumpIfFalse(t)
            | Op::JumpIfTrue(t)
            | Op::JumpIfNil(t)
            | Op::BranchArgSet { target: t, .. }
            | Op::BranchKwSet { target: t, .. } => *t = target,
            other => panic!("patching non-jump opcode {other:?}"),
        }
    }

    fn const_idx(&mut self, value: Const) -> u16 {
        let key = match &value {
            Const::Int(v) => Some(ConstKey::Int(*v)),
            Const::Float(v) => Some(ConstKey::Float(v.to_bits())),
            Const::Str(s) => Some(ConstKey::Str(s.to_string())),
            Const::Sym(s) => Some(ConstKey::Sym(s.id())),
            Const::Proto(_) => None,
        };
        if let Some(key) = &key {
            if let Some(&idx) = self.f().const_keys.get(key) {
                return idx;
            }
        }
        let f = self.f();
        let idx = f.consts.len() as u16;
        f.consts.push(value);
        if let Some(key) = key {
            f.const_keys.insert(key, idx);
        }
        idx
    }

    fn sym_idx(&mut self, name: &str) -> u16 {
        let sym = self.symbols.intern(name);
        self.const_idx(Const::Sym(sym))
    }

    fn cache_idx(&mut self) -> u16 {
        let f = self.f();
        let idx = f.ncaches;
        f.ncaches += 1;
        idx
    }

    fn alloc_local(&mut self, name: &'a str) -> u16 {
        let f = self.f();
        let slot = f.nlocals;
        f.nlocals += 1;
        f.locals.insert(name, slot);
        slot
    }

    /// The kind of the nearest non-block lexical enclosure; decides where
    /// unresolved assignments land.
    fn lexical_home(&self) -> ProtoKind {
        for f in self.fns.iter().rev() {
            if f.kind != ProtoKind::Block {
                return f.kind;
            }
        }
        ProtoKind::TopLevel
    }

    fn resolve_upval(&mut self, fn_idx: usize, name: &'a str) -> Option<u16> {
        if fn_idx == 0 || self.fns[fn_idx].kind != ProtoKind::Block {
            return None;
        }
        if let Some(&idx) = self.fns[fn_idx].upval_names.get(name) {
            return Some(idx);
        }
        let parent = fn_idx - 1;
        if let Some(&slot) = self.fns[parent].locals.get(name) {
            self.fns[parent].cells.insert(slot);
            let idx = self.fns[fn_idx].upvals.len() as u16;
            self.fns[fn_idx].upvals.push(UpvalDesc::FromLocal(slot));
            self.fns[fn_idx].upval_names.insert(name, idx);
            return Some(idx);
        }
        if let Some(pidx) = self.resolve_upval(parent, name) {
            let idx = self.fns[fn_idx].upvals.len() as u16;
            self.fns[fn_idx].upvals.push(UpvalDesc::FromUpval(pidx));
            self.fns[fn_idx].upval_names.insert(name, idx);
            return Some(idx);
        }
        None
    }

    // ---- statement/expression compilation ----

    /// Compile a body; leaves exactly one value when `want_value`.
    fn compile_body(&mut self, body: &[P<'a>], want_value: bool) -> Result<(), ErrorInfo> {
        if body.is_empty() {
            if want_value {
                self.emit(Op::Nil);
            }
            return Ok(());
        }
        for (i, &stmt) in body.iter().enumerate() {
            self.compile_node(stmt)?;
            let last = i + 1 == body.len();
            if !last || !want_value {
                self.emit(Op::Pop);
            }
        }
        Ok(())
    }

    /// Compile one expression; always leaves exactly one value.
    fn compile_node(&mut self, node: P<'a>) -> Result<(), ErrorInfo> {
        self.f().cur_line = node.line;
        match &node.expr {
            Expr::Nil => self.emit(Op::Nil),
            Expr::True => self.emit(Op::True),
            Expr::False => self.emit(Op::False),
            Expr::SelfLit => self.emit(Op::SelfVal),
            Expr::Int(v) => {
                let idx = self.const_idx(Const::Int(*v));
                self.emit(Op::Const(idx));
            }
            Expr::Float(v) => {
                let idx = self.const_idx(Const::Float(*v));
                self.emit(Op::Const(idx));
            }
            Expr::Sym(name) => {
                let idx = self.sym_idx(name);
                self.emit(Op::Const(idx));
            }
            Expr::Str(parts) => self.compile_string(parts)?,
            Expr::Array(items) => {
                for &item in *items {
                    self.compile_node(item)?;
                }
                self.emit(Op::MakeArray(items.len() as u16));
            }
            Expr::Hash(pairs) => {
                for &(k, v) in *pairs {
                    self.compile_node(k)?;
                    self.compile_node(v)?;
                }
                self.emit(Op::MakeHash(pairs.len() as u16));
            }
            Expr::Range { lo, hi, exclusive } => {
                self.compile_node(lo)?;
                self.compile_node(hi)?;
                self.emit(Op::MakeRange { exclusive: *exclusive });
            }
            Expr::Ident(name) => self.compile_ident_load(name),
            Expr::ConstName(name) => {
                let idx = self.sym_idx(name);
                self.emit(Op::LoadConstName(idx));
            }
            Expr::Ivar(name) => {
                let idx = self.sym_idx(name);
                self.emit(Op::LoadIvar(idx));
            }
            Expr::Cvar(name) => {
                let idx = self.sym_idx(name);
                self.emit(Op::LoadCvar(idx));
            }
            Expr::Assign { target, value } => self.compile_assign(target, value)?,
            Expr::OpAssign { target, op, value } => self.compile_op_assign(target, *op, value)?,
            Expr::MultiAssign { targets, splat, value } => {
                self.compile_multi_assign(targets, *splat, value)?
            }
            Expr::BinOp { op, lhs, rhs } => self.compile_binop(*op, lhs, rhs)?,
            Expr::UnOp { op, operand } => {
                self.compile_node(operand)?;
                match op {
                    UnOp::Neg => self.emit(Op::Neg),
                    UnOp::Not => self.emit(Op::Not),
                }
            }
            Expr::Call { recv, name, args, block, safe } => {
                self.compile_call(*recv, name, args, *block, *safe)?
            }
            Expr::Index { recv, args, safe } => {
                self.compile_node(recv)?;
                let end = if *safe { Some(self.emit_jump(Op::JumpIfNil)) } else { None };
                for arg in *args {
                    self.compile_node(arg)?;
                }
                let cache = self.cache_idx();
                self.emit(Op::IndexGet { argc: args.len() as u8, cache });
                if let Some(end) = end {
                    self.patch_to_here(end);
                }
            }
            Expr::Super { args, block } => self.compile_super(*args, *block)?,
            Expr::Yield { args } => {
                for arg in *args {
                    self.compile_node(arg)?;
                }
                self.emit(Op::Yield { argc: args.len() as u8 });
            }
            Expr::If { cond, then_body, else_body } => {
                self.compile_node(cond)?;
                let to_else = self.emit_jump(Op::JumpIfFalse);
                self.compile_body(then_body, true)?;
                let to_end = self.emit_jump(Op::Jump);
                self.patch_to_here(to_else);
                self.compile_body(else_body, true)?;
                self.patch_to_here(to_end);
            }
            Expr::While { cond, body } => self.compile_while(cond, body)?,
            Expr::Loop { body } => self.compile_loop(body)?,
            Expr::Case { subject, whens, else_body } => {
                self.compile_case(*subject, whens, else_body)?
            }
            Expr::Begin { body, rescues, ensure_body } => {
                self.compile_begin(body, rescues, *ensure_body)?
            }
            Expr::Def { name, singleton, params, body } => {
                self.compile_def(name, *singleton, params, body, node.line)?
            }
            Expr::ClassDef { name, superclass, body } => {
                if let Some(sup) = superclass {
                    self.compile_node(sup)?;
                }
                let proto = self.compile_child(
                    Rc::from(format!("<class:{name}>")),
                    ProtoKind::ClassBody,
                    node.line,
                    |e| e.compile_body(body, true),
                )?;
                let name_idx = self.sym_idx(name);
                self.emit(Op::DefineClass {
                    name: name_idx,
                    has_super: superclass.is_some(),
                    body: proto,
                });
            }
            Expr::ModuleDef { name, body } => {
                let proto = self.compile_child(
                    Rc::from(format!("<module:{name}>")),
                    ProtoKind::ClassBody,
                    node.line,
                    |e| e.compile_body(body, true),
                )?;
                let name_idx = self.sym_idx(name);
                self.emit(Op::DefineModule { name: name_idx, body: proto });
            }
            Expr::Return(value) => {
                match value {
                    Some(v) => self.compile_node(v)?,
                    None => self.emit(Op::Nil),
                }
                self.emit_ensure_cleanup(0)?;
                if self.f().kind == ProtoKind::Block {
                    self.emit(Op::ReturnMethod);
                } else {
                    self.emit(Op::Return);
                }
            }
            Expr::Break(value) => {
                match value {
                    Some(v) => self.compile_node(v)?,
                    None => self.emit(Op::Nil),
                }
                if let Some(mark) = self.innermost_loop_mark() {
                    self.emit_ensure_cleanup(mark)?;
                    let jump = self.emit_jump(Op::Jump);
                    self.f().loops.last_mut().expect("loop context").break_jumps.push(jump);
                } else if self.f().kind == ProtoKind::Block {
                    self.emit_ensure_cleanup(0)?;
                    self.emit(Op::Break);
                } else {
                    return Err(self.err("break outside of a loop or block"));
                }
            }
            Expr::Next(value) => {
                match value {
                    Some(v) => self.compile_node(v)?,
                    None => self.emit(Op::Nil),
                }
                if let Some(mark) = self.innermost_loop_mark() {
                    // loop-level next discards its value
                    self.emit(Op::Pop);
                    self.emit_ensure_cleanup(mark)?;
                    let target = self.f().loops.last().expect("loop context").cond_pc as u32;
                    self.emit(Op::Jump(target));
                    // unreachable, keeps the expression single-valued
                    self.emit(Op::Nil);
                } else if self.f().kind == ProtoKind::Block {
                    self.emit_ensure_cleanup(0)?;
                    self.emit(Op::Next);
                } else {
                    return Err(self.err("next outside of a loop or block"));
                }
            }
            Expr::Redo => {
                if let Some(mark) = self.innermost_loop_mark() {
                    self.emit_ensure_cleanup(mark)?;
                    let target = self.f().loops.last().expect("loop context").body_pc as u32;
                    self.emit(Op::Jump(target));
                    self.emit(Op::Nil);
                } else if self.f().kind == ProtoKind::Block {
                    self.emit(Op::Redo);
                } else {
                    return Err(self.err("redo outside of a loop or block"));
                }
            }
            Expr::Retry => {
                let Some(&target) = self.f().retry_targets.last() else {
                    return Err(self.err("retry outside of a rescue clause"));
                };
                self.emit(Op::Jump(target as u32));
                self.emit(Op::Nil);
            }
            Expr::Seq(stmts) => self.compile_body(stmts, true)?,
        }
        Ok(())
    }

    fn innermost_loop_mark(&mut self) -> Option<usize> {
        self.f().loops.last().map(|l| l.ensure_mark)
    }

    /// Emit `LeaveRescue` + inlined ensure bodies for every armed region
    /// above `mark`, innermost first. Used before any jump that leaves
    /// those regions.
    fn emit_ensure_cleanup(&mut self, mark: usize) -> Result<(), ErrorInfo> {
        let pending: Vec<Option<&'a [P<'a>]>> = self.f().ensures[mark..]
            .iter()
            .rev()
            .map(|e| e.body)
            .collect();
        for body in pending {
            self.emit(Op::LeaveRescue);
            if let Some(body) = body {
                self.compile_body(body, false)?;
            }
        }
        Ok(())
    }

    fn compile_ident_load(&mut self, name: &'a str) {
        let fn_idx = self.fns.len() - 1;
        if let Some(&slot) = self.f().locals.get(name) {
            self.emit(Op::LoadLocal(slot));
        } else if let Some(idx) = self.resolve_upval(fn_idx, name) {
            self.emit(Op::LoadUpval(idx));
        } else {
            let name_idx = self.sym_idx(name);
            let cache = self.cache_idx();
            self.emit(Op::LoadName { name: name_idx, cache });
        }
    }

    /// Emit a store for a bare name; pops the value.
    fn compile_name_store(&mut self, name: &'a str) {
        let fn_idx = self.fns.len() - 1;
        if let Some(&slot) = self.f().locals.get(name) {
            self.emit(Op::StoreLocal(slot));
        } else if let Some(idx) = self.resolve_upval(fn_idx, name) {
            self.emit(Op::StoreUpval(idx));
        } else if self.lexical_home() == ProtoKind::TopLevel {
            let idx = self.sym_idx(name);
            self.emit(Op::StoreGlobal(idx));
        } else {
            let slot = self.alloc_local(name);
            self.emit(Op::StoreLocal(slot));
        }
    }

    fn compile_assign(&mut self, target: P<'a>, value: P<'a>) -> Result<(), ErrorInfo> {
        match &target.expr {
            Expr::Ident(name) => {
                self.compile_node(value)?;
                self.emit(Op::Dup);
                self.compile_name_store(name);
            }
            Expr::Ivar(name) => {
                self.compile_node(value)?;
                self.emit(Op::Dup);
                let idx = self.sym_idx(name);
                self.emit(Op::StoreIvar(idx));
            }
            Expr::Cvar(name) => {
                self.compile_node(value)?;
                self.emit(Op::Dup);
                let idx = self.sym_idx(name);
                self.emit(Op::StoreCvar(idx));
            }
            Expr::ConstName(name) => {
                self.compile_node(value)?;
                self.emit(Op::Dup);
                let idx = self.sym_idx(name);
                self.emit(Op::StoreConstName(idx));
            }
            Expr::Index { recv, args, .. } => {
                self.compile_node(recv)?;
                for arg in *args {
                    self.compile_node(arg)?;
                }
                self.compile_node(value)?;
                let cache = self.cache_idx();
                self.emit(Op::IndexSet { argc: args.len() as u8, cache });
            }
            Expr::Call { recv: Some(recv), name, args, .. } if args.is_empty() => {
                // attribute writer: a.b = v  →  a.b=(v)
                self.compile_node(recv)?;
                self.compile_node(value)?;
                let setter = self.sym_idx(&format!("{name}="));
                let cache = self.cache_idx();
                self.emit(Op::CallMethod {
                    name: setter,
                    argc: 1,
                    flags: CallFlags::default(),
                    cache,
                });
            }
            _ => return Err(self.err("invalid assignment target")),
        }
        Ok(())
    }

    fn compile_op_assign(
        &mut self,
        target: P<'a>,
        op: BinOp,
        value: P<'a>,
    ) -> Result<(), ErrorInfo> {
        match op {
            BinOp::Or | BinOp::And => self.compile_shortcircuit_assign(target, op, value),
            _ => {
                // load target, apply, store back
                match &target.expr {
                    Expr::Ident(_) | Expr::Ivar(_) | Expr::Cvar(_) | Expr::ConstName(_) => {
                        self.compile_node(target)?;
                        self.compile_node(value)?;
                        self.emit_binop_op(op);
                        self.emit(Op::Dup);
                        self.compile_simple_store(target)?;
                    }
                    Expr::Index { recv, args, .. } => {
                        // computed into a temp so the new value ends up on
                        // top for IndexSet; receiver and index evaluate
                        // twice, matching the simple expansion of `op=`.
                        self.compile_node(target)?;
                        self.compile_node(value)?;
                        self.emit_binop_op(op);
                        let tmp = self.alloc_hidden_local();
                        self.emit(Op::StoreLocal(tmp));
                        self.compile_node(recv)?;
                        for arg in *args {
                            self.compile_node(arg)?;
                        }
                        self.emit(Op::LoadLocal(tmp));
                        let cache = self.cache_idx();
                        self.emit(Op::IndexSet { argc: args.len() as u8, cache });
                    }
                    Expr::Call { recv: Some(recv), name, args, .. } if args.is_empty() => {
                        self.compile_node(target)?;
                        self.compile_node(value)?;
                        self.emit_binop_op(op);
                        let tmp = self.alloc_hidden_local();
                        self.emit(Op::StoreLocal(tmp));
                        self.compile_node(recv)?;
                        self.emit(Op::LoadLocal(tmp));
                        let setter = self.sym_idx(&format!("{name}="));
                        let cache = self.cache_idx();
                        self.emit(Op::CallMethod {
                            name: setter,
                            argc: 1,
                            flags: CallFlags::default(),
                            cache,
                        });
                    }
                    _ => return Err(self.err("invalid target for operator assignment")),
                }
                Ok(())
            }
        }
    }

    /// `x ||= v` / `x &&= v`, preserving the already-evaluated operand as
    /// the result on the short-circuit path.
    fn compile_shortcircuit_assign(
        &mut self,
        target: P<'a>,
        op: BinOp,
        value: P<'a>,
    ) -> Result<(), ErrorInfo> {
        // For `||=` on names that resolve nowhere yet, reading would raise
        // NameError; the load site handles that by pushing nil for
        // assignment probes, so compile the plain load here.
        self.compile_target_load(target)?;
        self.emit(Op::Dup);
        let end = if op == BinOp::Or {
            self.emit_jump(Op::JumpIfTrue)
        } else {
            self.emit_jump(Op::JumpIfFalse)
        };
        self.emit(Op::Pop);
        self.compile_node(value)?;
        self.emit(Op::Dup);
        self.compile_simple_store(target)?;
        self.patch_to_here(end);
        Ok(())
    }

    /// Load the current value of an assignable target.
    fn compile_target_load(&mut self, target: P<'a>) -> Result<(), ErrorInfo> {
        match &target.expr {
            Expr::Ident(name) => {
                let fn_idx = self.fns.len() - 1;
                if let Some(&slot) = self.f().locals.get(name) {
                    self.emit(Op::LoadLocal(slot));
                } else if let Some(idx) = self.resolve_upval(fn_idx, name) {
                    self.emit(Op::LoadUpval(idx));
                } else if self.lexical_home() == ProtoKind::TopLevel {
                    let name_idx = self.sym_idx(name);
                    self.emit(Op::LoadGlobal(name_idx));
                } else {
                    // first mention inside a method: define the local now
                    self.alloc_local(name);
                    self.emit(Op::Nil);
                }
            }
            Expr::Ivar(_) | Expr::Cvar(_) | Expr::ConstName(_) | Expr::Index { .. } => {
                self.compile_node(target)?;
            }
            Expr::Call { .. } => self.compile_node(target)?,
            _ => return Err(self.err("invalid target for operator assignment")),
        }
        Ok(())
    }

    /// Store TOS into a simple target (pops the value). Index and
    /// attribute targets re-evaluate their receiver.
    fn compile_simple_store(&mut self, target: P<'a>) -> Result<(), ErrorInfo> {
        match &target.expr {
            Expr::Ident(name) => self.compile_name_store(name),
            Expr::Ivar(name) => {
                let idx = self.sym_idx(name);
                self.emit(Op::StoreIvar(idx));
            }
            Expr::Cvar(name) => {
                let idx = self.sym_idx(name);
                self.emit(Op::StoreCvar(idx));
            }
            Expr::ConstName(name) => {
                let idx = self.sym_idx(name);
                self.emit(Op::StoreConstName(idx));
            }
            Expr::Index { recv, args, .. } => {
                let tmp = self.alloc_hidden_local();
                self.emit(Op::StoreLocal(tmp));
                self.compile_node(recv)?;
                for arg in *args {
                    self.compile_node(arg)?;
                }
                self.emit(Op::LoadLocal(tmp));
                let cache = self.cache_idx();
                self.emit(Op::IndexSet { argc: args.len() as u8, cache });
                self.emit(Op::Pop);
            }
            Expr::Call { recv: Some(recv), name, args, .. } if args.is_empty() => {
                let tmp = self.alloc_hidden_local();
                self.emit(Op::StoreLocal(tmp));
                self.compile_node(recv)?;
                self.emit(Op::LoadLocal(tmp));
                let setter = self.sym_idx(&format!("{name}="));
                let cache = self.cache_idx();
                self.emit(Op::CallMethod {
                    name: setter,
                    argc: 1,
                    flags: CallFlags::default(),
                    cache,
                });
                self.emit(Op::Pop);
            }
            _ => return Err(self.err("invalid assignment target")),
        }
        Ok(())
    }

    fn alloc_hidden_local(&mut self) -> u16 {
        let f = self.f();
        let slot = f.nlocals;
        f.nlocals += 1;
        slot
    }

    fn compile_multi_assign(
        &mut self,
        targets: &'a [P<'a>],
        splat: Option<usize>,
        value: P<'a>,
    ) -> Result<(), ErrorInfo> {
        self.compile_node(value)?;
        self.emit(Op::Dup);
        let (before, after) = match splat {
            Some(i) => (i, targets.len() - i - 1),
            None => (targets.len(), 0),
        };
        self.emit(Op::Unpack {
            before: before as u8,
            rest: splat.is_some(),
            after: after as u8,
        });
        for target in targets.iter().rev() {
            match &target.expr {
                Expr::Ident(name) => self.compile_name_store(name),
                Expr::Ivar(name) => {
                    let idx = self.sym_idx(name);
                    self.emit(Op::StoreIvar(idx));
                }
                Expr::Cvar(name) => {
                    let idx = self.sym_idx(name);
                    self.emit(Op::StoreCvar(idx));
                }
                _ => return Err(self.err("unsupported multiple-assignment target")),
            }
        }
        Ok(())
    }

    fn emit_binop_op(&mut self, op: BinOp) {
        match op {
            BinOp::Add => self.emit(Op::Add),
            BinOp::Sub => self.emit(Op::Sub),
            BinOp::Mul => self.emit(Op::Mul),
            BinOp::Div => self.emit(Op::Div),
            BinOp::Mod => self.emit(Op::Rem),
            BinOp::Eq => self.emit(Op::Eq),
            BinOp::Ne => self.emit(Op::Ne),
            BinOp::Lt => self.emit(Op::Lt),
            BinOp::Le => self.emit(Op::Le),
            BinOp::Gt => self.emit(Op::Gt),
            BinOp::Ge => self.emit(Op::Ge),
            BinOp::BitAnd => self.emit(Op::BitAnd),
            BinOp::BitOr => self.emit(Op::BitOr),
            BinOp::BitXor => self.emit(Op::BitXor),
            BinOp::Shl => self.emit(Op::Shl),
            BinOp::Shr => self.emit(Op::Shr),
            BinOp::Pow | BinOp::Cmp | BinOp::CaseEq => {
                let name = self.sym_idx(op.method_name());
                let cache = self.cache_idx();
                self.emit(Op::CallMethod { name, argc: 1, flags: CallFlags::default(), cache });
            }
            BinOp::And | BinOp::Or => unreachable!("short-circuit ops compile to jumps"),
        }
    }

    fn compile_binop(&mut self, op: BinOp, lhs: P<'a>, rhs: P<'a>) -> Result<(), ErrorInfo> {
        match op {
            BinOp::And => {
                self.compile_node(lhs)?;
                self.emit(Op::Dup);
                let end = self.emit_jump(Op::JumpIfFalse);
                self.emit(Op::Pop);
                self.compile_node(rhs)?;
                self.patch_to_here(end);
            }
            BinOp::Or => {
                self.compile_node(lhs)?;
                self.emit(Op::Dup);
                let end = self.emit_jump(Op::JumpIfTrue);
                self.emit(Op::Pop);
                self.compile_node(rhs)?;
                self.patch_to_here(end);
            }
            _ => {
                self.compile_node(lhs)?;
                self.compile_node(rhs)?;
                self.emit_binop_op(op);
            }
        }
        Ok(())
    }

    fn compile_string(&mut self, parts: &'a [StrPart<'a>]) -> Result<(), ErrorInfo> {
        let mut first = true;
        for part in parts {
            match part {
                StrPart::Lit(text) => {
                    let idx = self.const_idx(Const::Str(Rc::from(*text)));
                    self.emit(Op::Const(idx));
                }
                StrPart::Interp(expr) => {
                    self.compile_node(expr)?;
                    self.emit(Op::ToS);
                }
            }
            if !first {
                self.emit(Op::StrCat);
            }
            first = false;
        }
        Ok(())
    }

    // ---- calls ----

    fn compile_call(
        &mut self,
        recv: Option<P<'a>>,
        name: &'a str,
        args: &'a [Arg<'a>],
        block: Option<&'a Block<'a>>,
        safe: bool,
    ) -> Result<(), ErrorInfo> {
        let mut end = None;
        if let Some(recv) = recv {
            self.compile_node(recv)?;
            if safe {
                end = Some(self.emit_jump(Op::JumpIfNil));
            }
        }
        let (argc, flags) = self.compile_args(args, block)?;
        let name_idx = self.sym_idx(name);
        let cache = self.cache_idx();
        if recv.is_some() {
            self.emit(Op::CallMethod { name: name_idx, argc, flags, cache });
        } else {
            self.emit(Op::CallSelf { name: name_idx, argc, flags, cache });
        }
        if let Some(end) = end {
            self.patch_to_here(end);
        }
        Ok(())
    }

    /// Push positional args, keyword hash, and block value; returns
    /// (argc, flags).
    fn compile_args(
        &mut self,
        args: &'a [Arg<'a>],
        block: Option<&'a Block<'a>>,
    ) -> Result<(u8, CallFlags), ErrorInfo> {
        let mut flags = CallFlags::default();
        let mut argc: u8 = 0;
        let mut kw_pairs: Vec<(&'a str, P<'a>)> = Vec::new();
        let mut block_pass: Option<P<'a>> = None;

        for (i, arg) in args.iter().enumerate() {
            match arg {
                Arg::Pos(expr) => {
                    if flags.splat {
                        return Err(self.err("splat argument must be last"));
                    }
                    self.compile_node(expr)?;
                    argc += 1;
                }
                Arg::Splat(expr) => {
                    let only_kw_follow = args[i + 1..]
                        .iter()
                        .all(|a| matches!(a, Arg::Kw(..) | Arg::BlockPass(_)));
                    if !only_kw_follow {
                        return Err(self.err("splat argument must be last"));
                    }
                    self.compile_node(expr)?;
                    argc += 1;
                    flags.splat = true;
                }
                Arg::Kw(name, expr) => kw_pairs.push((*name, *expr)),
                Arg::BlockPass(expr) => block_pass = Some(*expr),
            }
        }
        if !kw_pairs.is_empty() {
            for (name, expr) in &kw_pairs {
                let idx = self.sym_idx(name);
                self.emit(Op::Const(idx));
                self.compile_node(expr)?;
            }
            self.emit(Op::MakeHash(kw_pairs.len() as u16));
            flags.kwargs = true;
        }
        match (block, block_pass) {
            (Some(block), _) => {
                let proto = self.compile_block_proto(block)?;
                self.emit(Op::MakeClosure(proto));
                flags.block = true;
            }
            (None, Some(expr)) => {
                self.compile_node(expr)?;
                flags.block = true;
            }
            (None, None) => {}
        }
        Ok((argc, flags))
    }

    fn compile_block_proto(&mut self, block: &'a Block<'a>) -> Result<u16, ErrorInfo> {
        let nparams = block.params.len();
        let name: Rc<str> = {
            let enclosing = self.f().name.clone();
            Rc::from(format!("block in {enclosing}"))
        };
        self.push_fn(name, ProtoKind::Block, block.line);
        for &param in block.params {
            self.alloc_local(param);
        }
        if let Some(rest) = block.rest {
            self.alloc_local(rest);
        }
        self.f().params = ParamInfo {
            nreq: nparams as u8,
            nopt: 0,
            rest: block.rest.is_some(),
            kw: Vec::new(),
            block: false,
        };
        self.compile_body(block.body, true)?;
        self.emit(Op::Return);
        let proto = self.pop_fn();
        Ok(self.const_idx(Const::Proto(Rc::new(proto))))
    }

    fn compile_super(
        &mut self,
        args: Option<&'a [Arg<'a>]>,
        block: Option<&'a Block<'a>>,
    ) -> Result<(), ErrorInfo> {
        match args {
            Some(args) => {
                let (argc, flags) = self.compile_args(args, block)?;
                self.emit(Op::Super { argc, flags });
            }
            None => {
                // bare super forwards the positional parameters
                if self.f().kind != ProtoKind::Method {
                    return Err(self.err("super outside of a method"));
                }
                let nfwd = self.f().params.nreq + self.f().params.nopt;
                for slot in 0..nfwd {
                    self.emit(Op::LoadLocal(slot as u16));
                }
                self.emit(Op::Super { argc: nfwd, flags: CallFlags::default() });
            }
        }
        Ok(())
    }

    // ---- control flow ----

    fn compile_while(&mut self, cond: P<'a>, body: &'a [P<'a>]) -> Result<(), ErrorInfo> {
        let cond_pc = self.pc();
        self.compile_node(cond)?;
        let exit = self.emit_jump(Op::JumpIfFalse);
        let body_pc = self.pc();
        let ensure_mark = self.f().ensures.len();
        self.f().loops.push(LoopCtx {
            cond_pc,
            body_pc,
            break_jumps: Vec::new(),
            ensure_mark,
        });
        self.compile_body(body, false)?;
        self.emit(Op::Jump(cond_pc as u32));
        self.patch_to_here(exit);
        self.emit(Op::Nil);
        let ctx = self.f().loops.pop().expect("loop context");
        for jump in ctx.break_jumps {
            self.patch_to_here(jump);
        }
        Ok(())
    }

    fn compile_loop(&mut self, body: &'a [P<'a>]) -> Result<(), ErrorInfo> {
        let body_pc = self.pc();
        let ensure_mark = self.f().ensures.len();
        self.f().loops.push(LoopCtx {
            cond_pc: body_pc,
            body_pc,
            break_jumps: Vec::new(),
            ensure_mark,
        });
        self.compile_body(body, false)?;
        self.emit(Op::Jump(body_pc as u32));
        let ctx = self.f().loops.pop().expect("loop context");
        for jump in ctx.break_jumps {
            self.patch_to_here(jump);
        }
        Ok(())
    }

    fn compile_case(
        &mut self,
        subject: Option<P<'a>>,
        whens: &'a [WhenClause<'a>],
        else_body: &'a [P<'a>],
    ) -> Result<(), ErrorInfo> {
        match subject {
            Some(subject) => {
                self.compile_node(subject)?;
                let mut end_jumps = Vec::new();
                for clause in whens {
                    let mut body_jumps = Vec::new();
                    for value in clause.values {
                        // value === subject
                        self.emit(Op::Dup);
                        self.compile_node(value)?;
                        self.emit(Op::Swap);
                        let name = self.sym_idx("===");
                        let cache = self.cache_idx();
                        self.emit(Op::CallMethod {
                            name,
                            argc: 1,
                            flags: CallFlags::default(),
                            cache,
                        });
                        body_jumps.push(self.emit_jump(Op::JumpIfTrue));
                    }
                    let next_clause = self.emit_jump(Op::Jump);
                    for jump in body_jumps {
                        self.patch_to_here(jump);
                    }
                    self.emit(Op::Pop); // the subject
                    self.compile_body(clause.body, true)?;
                    end_jumps.push(self.emit_jump(Op::Jump));
                    self.patch_to_here(next_clause);
                }
                self.emit(Op::Pop);
                self.compile_body(else_body, true)?;
                for jump in end_jumps {
                    self.patch_to_here(jump);
                }
            }
            None => {
                // subjectless case: first truthy condition wins
                let mut end_jumps = Vec::new();
                for clause in whens {
                    let mut body_jumps = Vec::new();
                    for value in clause.values {
                        self.compile_node(value)?;
                        body_jumps.push(self.emit_jump(Op::JumpIfTrue));
                    }
                    let next_clause = self.emit_jump(Op::Jump);
                    for jump in body_jumps {
                        self.patch_to_here(jump);
                    }
                    self.compile_body(clause.body, true)?;
                    end_jumps.push(self.emit_jump(Op::Jump));
                    self.patch_to_here(next_clause);
                }
                self.compile_body(else_body, true)?;
                for jump in end_jumps {
                    self.patch_to_here(jump);
                }
            }
        }
        Ok(())
    }

    fn compile_begin(
        &mut self,
        body: &'a [P<'a>],
        rescues: &'a [RescueClause<'a>],
        ensure_body: Option<&'a [P<'a>]>,
    ) -> Result<(), ErrorInfo> {
        let has_rescue = !rescues.is_empty();

        let mut ensure_region = None;
        if let Some(ensure_stmts) = ensure_body {
            let idx = self.f().regions.len();
            let start = self.pc() as u32;
            self.f().regions.push(Region { start, handler: u32::MAX, kind: HandlerKind::Ensure });
            self.emit(Op::EnterRescue(idx as u16));
            self.f().ensures.push(EnsureInfo { body: Some(ensure_stmts) });
            ensure_region = Some(idx);
        }
        let mut rescue_region = None;
        let mut rescue_enter_pc = 0;
        if has_rescue {
            let idx = self.f().regions.len();
            rescue_enter_pc = self.pc();
            let start = rescue_enter_pc as u32;
            self.f().regions.push(Region { start, handler: u32::MAX, kind: HandlerKind::Rescue });
            self.emit(Op::EnterRescue(idx as u16));
            self.f().ensures.push(EnsureInfo { body: None });
            rescue_region = Some(idx);
        }

        self.compile_body(body, true)?;

        // normal path: disarm, run the inline ensure copy
        if has_rescue {
            self.emit(Op::LeaveRescue);
            self.f().ensures.pop();
        }
        if let Some(ensure_stmts) = ensure_body {
            self.emit(Op::LeaveRescue);
            self.f().ensures.pop();
            self.compile_body(ensure_stmts, false)?;
        }
        let done = self.emit_jump(Op::Jump);

        if let Some(region_idx) = rescue_region {
            let handler_pc = self.pc() as u32;
            self.f().regions[region_idx].handler = handler_pc;
            // while rescue bodies run, the ensure region is still armed
            if ensure_body.is_some() {
                self.f().ensures.push(EnsureInfo { body: ensure_body });
            }
            let mut done_jumps = Vec::new();
            for clause in rescues {
                // stack: [exc]
                let mut body_jumps = Vec::new();
                if clause.classes.is_empty() {
                    let idx = self.sym_idx("StandardError");
                    self.emit(Op::LoadConstName(idx));
                    self.emit(Op::RescueMatch);
                    body_jumps.push(self.emit_jump(Op::JumpIfTrue));
                } else {
                    for class in clause.classes {
                        self.compile_node(class)?;
                        self.emit(Op::RescueMatch);
                        body_jumps.push(self.emit_jump(Op::JumpIfTrue));
                    }
                }
                let next_clause = self.emit_jump(Op::Jump);
                for jump in body_jumps {
                    self.patch_to_here(jump);
                }
                match clause.var {
                    Some(var) => self.compile_name_store(var),
                    None => self.emit(Op::Pop),
                }
                self.f().retry_targets.push(rescue_enter_pc);
                self.compile_body(clause.body, true)?;
                self.f().retry_targets.pop();
                if let Some(ensure_stmts) = ensure_body {
                    self.emit(Op::LeaveRescue);
                    self.compile_body(ensure_stmts, false)?;
                }
                done_jumps.push(self.emit_jump(Op::Jump));
                self.patch_to_here(next_clause);
            }
            // no clause matched: re-raise (the armed ensure region below
            // will run on the way out)
            self.emit(Op::Raise);
            if ensure_body.is_some() {
                self.f().ensures.pop();
            }
            for jump in done_jumps {
                self.patch_to_here(jump);
            }
        }

        if let Some(region_idx) = ensure_region {
            // the handler copy, reached only during unwinding
            let over = self.emit_jump(Op::Jump);
            let handler_pc = self.pc() as u32;
            self.f().regions[region_idx].handler = handler_pc;
            if let Some(ensure_stmts) = ensure_body {
                self.compile_body(ensure_stmts, false)?;
            }
            self.emit(Op::EndEnsure);
            self.patch_to_here(over);
        }

        self.patch_to_here(done);
        Ok(())
    }

    // ---- definitions ----

    fn compile_def(
        &mut self,
        name: &'a str,
        singleton: bool,
        params: &'a Params<'a>,
        body: &'a [P<'a>],
        line: u32,
    ) -> Result<(), ErrorInfo> {
        let proto = self.compile_method_proto(name, params, body, line)?;
        let name_idx = self.sym_idx(name);
        if singleton {
            self.emit(Op::SelfVal);
            self.emit(Op::DefineSingletonMethod { name: name_idx, proto });
        } else {
            self.emit(Op::DefineMethod { name: name_idx, proto });
        }
        Ok(())
    }

    fn compile_method_proto(
        &mut self,
        name: &'a str,
        params: &'a Params<'a>,
        body: &'a [P<'a>],
        line: u32,
    ) -> Result<u16, ErrorInfo> {
        self.push_fn(Rc::from(name), ProtoKind::Method, line);
        // slot layout: required, optional, rest, keywords, block
        for &param in params.required {
            self.alloc_local(param);
        }
        for &(param, _) in params.optional {
            self.alloc_local(param);
        }
        if let Some(rest) = params.rest {
            self.alloc_local(rest);
        }
        for &(param, _) in params.kw {
            self.alloc_local(param);
        }
        if let Some(block) = params.block {
            self.alloc_local(block);
        }
        let mut kw = Vec::with_capacity(params.kw.len());
        for &(name, default) in params.kw {
            kw.push(KwParam { name: self.symbols.intern(name), required: default.is_none() });
        }
        self.f().params = ParamInfo {
            nreq: params.required.len() as u8,
            nopt: params.optional.len() as u8,
            rest: params.rest.is_some(),
            kw,
            block: params.block.is_some(),
        };
        // defaults evaluate in the callee prologue, skipped when the
        // caller supplied the argument
        let nreq = params.required.len() as u8;
        for (i, &(param, default)) in params.optional.iter().enumerate() {
            let index = nreq + i as u8;
            let skip = self.emit_jump_arg_set(index);
            self.compile_node(default)?;
            let slot = self.f().locals[param];
            self.emit(Op::StoreLocal(slot));
            self.patch_to_here(skip);
        }
        for (i, &(param, default)) in params.kw.iter().enumerate() {
            if let Some(default) = default {
                let skip = self.emit_jump_kw_set(i as u8);
                self.compile_node(default)?;
                let slot = self.f().locals[param];
                self.emit(Op::StoreLocal(slot));
                self.patch_to_here(skip);
            }
        }
        self.compile_body(body, true)?;
        self.emit(Op::Return);
        let proto = self.pop_fn();
        Ok(self.const_idx(Const::Proto(Rc::new(proto))))
    }

    fn emit_jump_arg_set(&mut self, index: u8) -> usize {
        let idx = self.pc();
        self.emit(Op::BranchArgSet { index, target: u32::MAX });
        idx
    }

    fn emit_jump_kw_set(&mut self, index: u8) -> usize {
        let idx = self.pc();
        self.emit(Op::BranchKwSet { index, target: u32::MAX });
        idx
    }

    fn compile_child(
        &mut self,
        name: Rc<str>,
        kind: ProtoKind,
        line: u32,
        body: impl FnOnce(&mut Self) -> Result<(), ErrorInfo>,
    ) -> Result<u16, ErrorInfo> {
        self.push_fn(name, kind, line);
        body(self)?;
        self.emit(Op::Return);
        let proto = self.pop_fn();
        Ok(self.const_idx(Const::Proto(Rc::new(proto))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::lex;
    use crate::parser::parse_program;
    use bumpalo::Bump;

    fn compile(source: &str) -> Rc<Proto> {
        let mut symbols = SymbolTable::new();
        let tokens = lex(source, "<test>").unwrap();
        let arena = Bump::new();
        let body = parse_program(&arena, &tokens, "<test>").unwrap();
        compile_program(body, "<test>", &mut symbols).unwrap()
    }

    fn compile_err(source: &str) -> ErrorInfo {
        let mut symbols = SymbolTable::new();
        let tokens = lex(source, "<test>").unwrap();
        let arena = Bump::new();
        let body = parse_program(&arena, &tokens, "<test>").unwrap();
        compile_program(body, "<test>", &mut symbols).unwrap_err()
    }

    #[test]
    fn test_constant_pool_dedup() {
        let proto = compile("x = 1; y = 1; z = 1.5; w = 1.5; s = \"a\"; t = \"a\"");
        let ints = proto.consts.iter().filter(|c| matches!(c, Const::Int(1))).count();
        let floats = proto.consts.iter().filter(|c| matches!(c, Const::Float(_))).count();
        let strs = proto.consts.iter().filter(|c| matches!(c, Const::Str(_))).count();
        assert_eq!(ints, 1);
        assert_eq!(floats, 1);
        // one pooled "a" (the globals' name symbols are Sym constants)
        assert_eq!(strs, 1);
    }

    #[test]
    fn test_toplevel_names_are_globals() {
        let proto = compile("x = 1; x");
        assert!(proto.code.iter().any(|op| matches!(op, Op::StoreGlobal(_))));
        assert_eq!(proto.nlocals, 0);
    }

    #[test]
    fn test_method_locals_get_slots() {
        let proto = compile("def f(a)\n b = a + 1\n b\n end");
        let Const::Proto(method) = proto
            .consts
            .iter()
            .find(|c| matches!(c, Const::Proto(_)))
            .unwrap()
        else {
            unreachable!()
        };
        assert_eq!(method.nlocals, 2);
        assert!(method.code.iter().any(|op| matches!(op, Op::LoadLocal(0))));
        assert!(method.code.iter().any(|op| matches!(op, Op::StoreLocal(1))));
    }

    #[test]
    fn test_block_captures_method_local() {
        let proto = compile("def f\n t = 0\n [1].each { |x| t = t + x }\n t\n end");
        let Const::Proto(method) = proto
            .consts
            .iter()
            .find(|c| matches!(c, Const::Proto(_)))
            .unwrap()
        else {
            unreachable!()
        };
        // t's slot is boxed because the block writes it
        assert!(!method.cells.is_empty());
        let Const::Proto(block) = method
            .consts
            .iter()
            .find(|c| matches!(c, Const::Proto(_)))
            .unwrap()
        else {
            unreachable!()
        };
        assert_eq!(block.kind, ProtoKind::Block);
        assert_eq!(block.upvals.len(), 1);
        assert!(block.code.iter().any(|op| matches!(op, Op::StoreUpval(0))));
    }

    #[test]
    fn test_short_circuit_keeps_operand() {
        let proto = compile("a && b");
        // Dup before the conditional jump preserves the operand as the
        // expression result on the short-circuit path
        let dup_then_jump = proto
            .code
            .windows(2)
            .any(|w| matches!(w, [Op::Dup, Op::JumpIfFalse(_)]));
        assert!(dup_then_jump);
    }

    #[test]
    fn test_ensure_region_recorded() {
        let proto = compile("begin\n 1\n ensure\n 2\n end");
        assert_eq!(proto.regions.len(), 1);
        assert_eq!(proto.regions[0].kind, HandlerKind::Ensure);
        assert!(proto.code.iter().any(|op| matches!(op, Op::EnterRescue(0))));
        assert!(proto.code.iter().any(|op| matches!(op, Op::EndEnsure)));
    }

    #[test]
    fn test_rescue_and_ensure_regions() {
        let proto = compile("begin\n 1\n rescue => e\n 2\n ensure\n 3\n end");
        assert_eq!(proto.regions.len(), 2);
        assert_eq!(proto.regions[0].kind, HandlerKind::Ensure);
        assert_eq!(proto.regions[1].kind, HandlerKind::Rescue);
        assert!(proto.code.iter().any(|op| matches!(op, Op::RescueMatch)));
    }

    #[test]
    fn test_break_outside_loop_is_compile_error() {
        let err = compile_err("break");
        assert_eq!(err.kind, "CompileError");
        assert!(err.message.contains("break"));
    }

    #[test]
    fn test_retry_outside_rescue_is_compile_error() {
        let err = compile_err("retry");
        assert_eq!(err.kind, "CompileError");
    }

    #[test]
    fn test_optional_param_prologue() {
        let proto = compile("def f(a, b = 9)\n b\n end");
        let Const::Proto(method) = proto
            .consts
            .iter()
            .find(|c| matches!(c, Const::Proto(_)))
            .unwrap()
        else {
            unreachable!()
        };
        assert!(method
            .code
            .iter()
            .any(|op| matches!(op, Op::BranchArgSet { index: 1, .. })));
        assert_eq!(method.params.nreq, 1);
        assert_eq!(method.params.nopt, 1);
    }

    #[test]
    fn test_kwargs_call_builds_hash() {
        let proto = compile("f(x: 42)");
        assert!(proto.code.iter().any(|op| matches!(op, Op::MakeHash(1))));
        assert!(proto
            .code
            .iter()
            .any(|op| matches!(op, Op::CallSelf { flags: CallFlags { kwargs: true, .. }, .. })));
    }

    #[test]
    fn test_line_map_parallel_to_code() {
        let proto = compile("x = 1\ny = 2");
        assert_eq!(proto.code.len(), proto.lines.len());
        assert!(proto.lines.contains(&1));
        assert!(proto.lines.contains(&2));
    }
}
