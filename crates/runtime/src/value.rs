//! Value representation
//!
//! A [`Value`] is a small tagged enum: nil, booleans, 64-bit integers,
//! doubles, and interned symbols are immediate; strings, arrays, hashes,
//! ranges, objects, classes, functions, fibers, and userdata are
//! `Rc`-counted heap records. Reference identity follows the `Rc`
//! pointer; immediates compare by value.
//!
//! Mutable records carry a [`Meta`] header: the frozen flag and an
//! optional singleton class. Records that count against the memory
//! budget also carry a [`MemTicket`] that credits the live-byte meter
//! back when the record drops.
//!
//! Strings are byte-oriented with no intrinsic encoding; the case and
//! `chars` operations in the kernel are ASCII-only.

use crate::fiber::Fiber;
use crate::object::{ClassRef, MethodRecord};
use crate::userdata::UserData;
use indexmap::IndexMap;
use ruse_core::proto::Proto;
use ruse_core::{MemTicket, Symbol};
use std::cell::RefCell;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

pub type StrRef = Rc<RefCell<RString>>;
pub type ArrayRef = Rc<RefCell<RArray>>;
pub type HashRef = Rc<RefCell<RHash>>;
pub type RangeRef = Rc<RRange>;
pub type ObjectRef = Rc<RefCell<RObject>>;
pub type FnRef = Rc<FunctionData>;
pub type CellRef = Rc<RefCell<Value>>;
pub type FiberRef = Rc<RefCell<Fiber>>;
pub type UserDataRef = Rc<UserData>;

/// Frozen flag plus optional singleton class, shared by every mutable
/// heap record.
#[derive(Debug, Default)]
pub struct Meta {
    pub frozen: bool,
    pub singleton: Option<ClassRef>,
}

#[derive(Debug)]
pub struct RString {
    pub meta: Meta,
    pub bytes: Vec<u8>,
    pub ticket: Option<MemTicket>,
}

impl RString {
    pub fn as_str_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }
}

#[derive(Debug)]
pub struct RArray {
    pub meta: Meta,
    pub elems: Vec<Value>,
    pub ticket: Option<MemTicket>,
}

#[derive(Debug)]
pub struct RHash {
    pub meta: Meta,
    pub entries: IndexMap<HashKey, Value>,
    pub ticket: Option<MemTicket>,
}

/// Ranges are immutable once built; endpoints are restricted to the
/// kinds with value identity.
#[derive(Debug)]
pub struct RRange {
    pub start: Value,
    pub end: Value,
    pub exclusive: bool,
}

#[derive(Debug)]
pub struct RObject {
    pub meta: Meta,
    pub class: ClassRef,
    pub ivars: rustc_hash::FxHashMap<Symbol, Value>,
    pub ticket: Option<MemTicket>,
}

/// Per-call-site inline cache entry, keyed on the receiver's class
/// pointer and the interpreter's method epoch.
#[derive(Debug, Clone, Default)]
pub struct CallCache {
    pub class_ptr: usize,
    pub epoch: u64,
    pub entry: Option<(MethodRecord, ClassRef)>,
}

/// A closure: a proto plus everything it captured at creation. Method
/// bodies use the same record with no captures.
#[derive(Debug)]
pub struct FunctionData {
    pub proto: Rc<Proto>,
    pub upvals: Vec<CellRef>,
    /// `self` at the definition site (blocks); methods rebind at call.
    pub self_val: Value,
    /// The defining frame's block, so `yield` inside a block forwards to
    /// the enclosing method's block.
    pub outer_block: Option<Value>,
    /// Lexically-enclosing class for `def`, constants, and class vars.
    pub def_target: Option<ClassRef>,
    /// For blocks: the method activation the closure was created in,
    /// which a `return` inside the block unwinds to.
    pub home_id: u64,
    /// Inline caches, one per call site in the proto.
    pub caches: RefCell<Vec<CallCache>>,
}

impl FunctionData {
    pub fn for_proto(proto: Rc<Proto>, self_val: Value, def_target: Option<ClassRef>) -> Self {
        let ncaches = proto.ncaches as usize;
        FunctionData {
            proto,
            upvals: Vec::new(),
            self_val,
            outer_block: None,
            def_target,
            home_id: 0,
            caches: RefCell::new(vec![CallCache::default(); ncaches]),
        }
    }
}

/// A method bound to a receiver (`obj.method(:name)`).
#[derive(Debug)]
pub struct BoundMethod {
    pub recv: Value,
    pub method: MethodRecord,
    pub owner: ClassRef,
    pub name: Symbol,
}

#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Symbol(Symbol),
    Str(StrRef),
    Array(ArrayRef),
    Hash(HashRef),
    Range(RangeRef),
    Object(ObjectRef),
    Class(ClassRef),
    Function(FnRef),
    Method(Rc<BoundMethod>),
    Fiber(FiberRef),
    UserData(UserDataRef),
    /// Internal: a boxed upvalue slot. Never observable from the
    /// language; local load/store sees through it.
    Cell(CellRef),
}

impl Value {
    /// nil and false are the only falsey values.
    pub fn truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Nil => "NilClass",
            Value::Bool(true) => "TrueClass",
            Value::Bool(false) => "FalseClass",
            Value::Int(_) => "Integer",
            Value::Float(_) => "Float",
            Value::Symbol(_) => "Symbol",
            Value::Str(_) => "String",
            Value::Array(_) => "Array",
            Value::Hash(_) => "Hash",
            Value::Range(_) => "Range",
            Value::Object(_) => "Object",
            Value::Class(_) => "Class",
            Value::Function(_) => "Function",
            Value::Method(_) => "Method",
            Value::Fiber(_) => "Fiber",
            Value::UserData(_) => "UserData",
            Value::Cell(_) => "Cell",
        }
    }

    /// Structural equality for immediates, strings, arrays, hashes and
    /// ranges; pointer identity for everything else. User-defined `==`
    /// on objects is layered on top by the VM.
    pub fn eq_value(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                (*a as f64) == *b
            }
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => {
                Rc::ptr_eq(a, b) || a.borrow().bytes == b.borrow().bytes
            }
            (Value::Array(a), Value::Array(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.elems.len() == b.elems.len()
                    && a.elems.iter().zip(b.elems.iter()).all(|(x, y)| x.eq_value(y))
            }
            (Value::Hash(a), Value::Hash(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.entries.len() == b.entries.len()
                    && a.entries
                        .iter()
                        .all(|(k, v)| b.entries.get(k).is_some_and(|w| v.eq_value(w)))
            }
            (Value::Range(a), Value::Range(b)) => {
                Rc::ptr_eq(a, b)
                    || (a.exclusive == b.exclusive
                        && a.start.eq_value(&b.start)
                        && a.end.eq_value(&b.end))
            }
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            (Value::Class(a), Value::Class(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Method(a), Value::Method(b)) => Rc::ptr_eq(a, b),
            (Value::Fiber(a), Value::Fiber(b)) => Rc::ptr_eq(a, b),
            (Value::UserData(a), Value::UserData(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Pointer for identity-hashing reference kinds; None for immediates.
    pub(crate) fn identity_ptr(&self) -> Option<usize> {
        match self {
            Value::Object(r) => Some(Rc::as_ptr(r) as usize),
            Value::Class(r) => Some(Rc::as_ptr(r) as usize),
            Value::Function(r) => Some(Rc::as_ptr(r) as usize),
            Value::Method(r) => Some(Rc::as_ptr(r) as usize),
            Value::Fiber(r) => Some(Rc::as_ptr(r) as usize),
            Value::UserData(r) => Some(Rc::as_ptr(r) as usize),
            Value::Range(r) => Some(Rc::as_ptr(r) as usize),
            _ => None,
        }
    }

    pub fn frozen(&self) -> bool {
        match self {
            Value::Str(r) => r.borrow().meta.frozen,
            Value::Array(r) => r.borrow().meta.frozen,
            Value::Hash(r) => r.borrow().meta.frozen,
            Value::Object(r) => r.borrow().meta.frozen,
            Value::Class(r) => r.borrow().frozen,
            // immediates and immutable records act frozen
            Value::Nil | Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::Symbol(_) => {
                true
            }
            Value::Range(_) => true,
            _ => false,
        }
    }
}

/// Hash-table key wrapper. Hashing is stable per kind: symbol id, FNV-1a
/// over string bytes, integer identity, float bit pattern, pointer
/// identity for reference kinds. Equality follows [`Value::eq_value`],
/// except reference kinds (already identity there).
#[derive(Debug, Clone)]
pub struct HashKey(pub Value);

impl PartialEq for HashKey {
    fn eq(&self, other: &Self) -> bool {
        match (self.0.identity_ptr(), other.0.identity_ptr()) {
            (Some(a), Some(b)) => a == b,
            (None, None) => self.0.eq_value(&other.0),
            _ => false,
        }
    }
}

impl Eq for HashKey {}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

impl Hash for HashKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match &self.0 {
            Value::Nil => 0u8.hash(state),
            Value::Bool(b) => (1u8, b).hash(state),
            Value::Int(v) => (2u8, v).hash(state),
            // int/float cross-equality (1 == 1.0) requires matching
            // hashes for integral floats
            Value::Float(v) if v.fract() == 0.0 && v.is_finite() => (2u8, *v as i64).hash(state),
            Value::Float(v) => (3u8, v.to_bits()).hash(state),
            Value::Symbol(s) => (4u8, s.id()).hash(state),
            Value::Str(s) => (5u8, fnv1a(&s.borrow().bytes)).hash(state),
            Value::Array(a) => {
                6u8.hash(state);
                for elem in &a.borrow().elems {
                    HashKey(elem.clone()).hash(state);
                }
            }
            other => (7u8, other.identity_ptr().unwrap_or(0)).hash(state),
        }
    }
}
