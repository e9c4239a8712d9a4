//! Fibers and call frames
//!
//! A fiber owns its value stack and frame stack outright. While a fiber
//! runs, the VM checks that state out of the shared record (so the hot
//! loop touches plain vectors, not `RefCell` borrows) and writes it back
//! at every suspension point: yield, resume of another fiber, body
//! return, or uncaught error.
//!
//! Every non-main fiber remembers its parent at the moment it was
//! resumed; yield and termination deliver their value there. Instruction
//! and allocation meters are per-fiber and reset at each resume
//! boundary.

use crate::object::ClassRef;
use crate::value::{FnRef, Value};
use ruse_core::Symbol;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberStatus {
    Ready,
    Running,
    Suspended,
    Dead,
}

/// One armed protected region: index into the proto's region table plus
/// the operand-stack height to restore when the handler runs.
#[derive(Debug, Clone, Copy)]
pub struct HandlerCtx {
    pub region: u16,
    pub depth: usize,
}

/// Unwind action parked while an ensure handler runs; `EndEnsure`
/// resumes it.
#[derive(Debug)]
pub enum Pending {
    Raise(crate::vm::Exc),
    /// The current frame is returning (implicit end, `next`).
    FrameReturn(Value),
    /// A `return` travelling toward the method frame identified by
    /// `home`.
    MethodReturn { value: Value, home: u64 },
    /// A block `break` travelling toward the frame that yielded to it.
    Break { target: usize, value: Value },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    TopLevel,
    Method,
    /// `yielder` is the index of the frame whose `Yield` invoked this
    /// block; `None` when a native or the fiber scheduler invoked it.
    Block { yielder: Option<usize> },
    ClassBody,
}

/// Who the currently-executing method is, for `super` and `__method__`.
#[derive(Debug, Clone)]
pub struct MethodCtx {
    pub owner: ClassRef,
    pub name: Symbol,
}

#[derive(Debug)]
pub struct Frame {
    pub func: FnRef,
    /// Locals live at `stack[base .. base + nlocals]`; operands above.
    pub base: usize,
    pub operand_base: usize,
    pub pc: usize,
    pub self_val: Value,
    pub block: Option<Value>,
    pub kind: FrameKind,
    pub handlers: Vec<HandlerCtx>,
    pub pending: Option<Pending>,
    pub method_ctx: Option<MethodCtx>,
    /// Where `def` installs methods from this frame.
    pub def_target: Option<ClassRef>,
    /// Identity of the enclosing method activation. Fresh for method,
    /// top-level, and class-body frames; blocks inherit the id captured
    /// when their closure was created, which is what `return` unwinds
    /// to.
    pub home_id: u64,
    /// Number of positional arguments the caller supplied
    /// (drives `BranchArgSet`).
    pub nargs_given: u8,
    /// Bitmask of keyword parameters the caller supplied.
    pub kw_given: u32,
}

/// The executable state a fiber owns; checked out by the VM while the
/// fiber is `Running`.
#[derive(Debug, Default)]
pub struct FiberState {
    pub stack: Vec<Value>,
    pub frames: Vec<Frame>,
    pub instructions: u64,
    pub allocations: u64,
    /// Budget thresholds; crossing one raises, then the threshold
    /// advances so a rescue body can run and still get cut off.
    pub instr_trap: u64,
    pub alloc_trap: u64,
    /// Depth of native re-entries (natives invoking blocks or methods);
    /// `Fiber.yield` cannot cross one.
    pub native_depth: u32,
}

#[derive(Debug)]
pub struct Fiber {
    pub status: FiberStatus,
    /// The fiber that last resumed this one; value destination for
    /// yield and termination. The main fiber has no parent.
    pub parent: Option<crate::value::FiberRef>,
    /// The block to run on first resume; taken when the fiber starts.
    pub body: Option<FnRef>,
    /// Present whenever the fiber is not the one running.
    pub saved: Option<Box<FiberState>>,
}

impl Fiber {
    pub fn new(body: FnRef) -> Self {
        Fiber {
            status: FiberStatus::Ready,
            parent: None,
            body: Some(body),
            saved: None,
        }
    }

    /// The root fiber of a host entry: already running, no body.
    pub fn root() -> Self {
        Fiber {
            status: FiberStatus::Running,
            parent: None,
            body: None,
            saved: None,
        }
    }

    pub fn alive(&self) -> bool {
        self.status != FiberStatus::Dead
    }
}
