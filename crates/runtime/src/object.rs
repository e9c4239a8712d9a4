//! Object model: classes, modules, methods
//!
//! Classes and modules share one record; a `is_module` bit distinguishes
//! them (modules cannot be instantiated or subclassed). Method and
//! constant tables are insertion-ordered because definition order is
//! user-visible through reflection.
//!
//! The ancestor list is computed lazily and cached against the
//! interpreter's method epoch: any include/prepend/inherit/def bumps the
//! epoch, and stale caches recompute on the next lookup. Lookup order is
//! prepended modules (most recent first), the class itself, included
//! modules (most recent first), then the superclass chain.

use crate::value::Value;
use crate::vm::NativeFn;
use indexmap::IndexMap;
use ruse_core::Symbol;
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::rc::Rc;

pub type ClassRef = Rc<RefCell<ClassData>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Public,
    Protected,
    Private,
}

/// A native method: a plain function pointer so host registration stays
/// a C-style API.
#[derive(Clone, Copy)]
pub struct NativeMethod {
    pub name: &'static str,
    pub f: NativeFn,
}

impl std::fmt::Debug for NativeMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#<native:{}>", self.name)
    }
}

#[derive(Debug, Clone)]
pub enum MethodKind {
    /// A `def` body or a `define_method` closure.
    Bytecode(crate::value::FnRef),
    Native(NativeMethod),
    AttrReader(Symbol),
    AttrWriter(Symbol),
}

#[derive(Debug, Clone)]
pub struct MethodRecord {
    pub kind: MethodKind,
    pub visibility: Visibility,
}

impl MethodRecord {
    pub fn public(kind: MethodKind) -> Self {
        MethodRecord { kind, visibility: Visibility::Public }
    }
}

#[derive(Debug)]
pub struct ClassData {
    pub name: Symbol,
    pub is_module: bool,
    pub is_singleton: bool,
    pub superclass: Option<ClassRef>,
    /// Declaration order; dispatch walks them most recent first.
    pub includes: Vec<ClassRef>,
    pub prepends: Vec<ClassRef>,
    pub methods: IndexMap<Symbol, MethodRecord>,
    pub constants: IndexMap<Symbol, Value>,
    pub cvars: FxHashMap<Symbol, Value>,
    pub ivars: FxHashMap<Symbol, Value>,
    /// Metaclass carrying `def self.m` methods.
    pub singleton: Option<ClassRef>,
    /// For a class's metaclass: the class it belongs to (weak, so the
    /// class ↔ metaclass pair is not a leak cycle). Class-variable
    /// access from `def self.` methods resolves through this.
    pub attached: Option<std::rc::Weak<RefCell<ClassData>>>,
    pub frozen: bool,
    /// `module_function` mode: subsequent defs also land on the
    /// module's singleton.
    pub module_function_mode: bool,
    pub default_visibility: Visibility,
    ancestors_cache: RefCell<Option<(u64, Rc<[ClassRef]>)>>,
}

impl ClassData {
    pub fn new(name: Symbol, superclass: Option<ClassRef>, is_module: bool) -> ClassRef {
        Rc::new(RefCell::new(ClassData {
            name,
            is_module,
            is_singleton: false,
            superclass,
            includes: Vec::new(),
            prepends: Vec::new(),
            methods: IndexMap::new(),
            constants: IndexMap::new(),
            cvars: FxHashMap::default(),
            ivars: FxHashMap::default(),
            singleton: None,
            attached: None,
            frozen: false,
            module_function_mode: false,
            default_visibility: Visibility::Public,
            ancestors_cache: RefCell::new(None),
        }))
    }
}

/// Materialize (or fetch) the ancestor list of `class` for the given
/// epoch: prepends (reverse declaration order), the class, includes
/// (reverse declaration order), then the superclass chain the same way.
pub fn ancestors(class: &ClassRef, epoch: u64) -> Rc<[ClassRef]> {
    if let Some((cached_epoch, list)) = &*class.borrow().ancestors_cache.borrow() {
        if *cached_epoch == epoch {
            return list.clone();
        }
    }
    let mut list: Vec<ClassRef> = Vec::new();
    collect_ancestors(class, &mut list);
    let list: Rc<[ClassRef]> = Rc::from(list);
    *class.borrow().ancestors_cache.borrow_mut() = Some((epoch, list.clone()));
    list
}

fn collect_ancestors(class: &ClassRef, out: &mut Vec<ClassRef>) {
    let data = class.borrow();
    for module in data.prepends.iter().rev() {
        push_unique(out, module);
        // modules may themselves include modules
        for inner in module.borrow().includes.iter().rev() {
            push_unique(out, inner);
        }
    }
    drop(data);
    push_unique(out, class);
    let data = class.borrow();
    for module in data.includes.iter().rev() {
        push_unique(out, module);
        for inner in module.borrow().includes.iter().rev() {
            push_unique(out, inner);
        }
    }
    if let Some(superclass) = data.superclass.clone() {
        drop(data);
        collect_ancestors(&superclass, out);
    }
}

fn push_unique(out: &mut Vec<ClassRef>, class: &ClassRef) {
    if !out.iter().any(|c| Rc::ptr_eq(c, class)) {
        out.push(class.clone());
    }
}

/// Walk the ancestor list for `name`; returns the record and the class
/// that owns it.
pub fn lookup_method(
    class: &ClassRef,
    name: Symbol,
    epoch: u64,
) -> Option<(MethodRecord, ClassRef)> {
    for ancestor in ancestors(class, epoch).iter() {
        if let Some(record) = ancestor.borrow().methods.get(&name) {
            return Some((record.clone(), ancestor.clone()));
        }
    }
    None
}

/// `super` resolution: first hit strictly after `after` in the
/// receiver's ancestor list.
pub fn lookup_method_after(
    class: &ClassRef,
    name: Symbol,
    after: &ClassRef,
    epoch: u64,
) -> Option<(MethodRecord, ClassRef)> {
    let list = ancestors(class, epoch);
    let mut seen = false;
    for ancestor in list.iter() {
        if seen {
            if let Some(record) = ancestor.borrow().methods.get(&name) {
                return Some((record.clone(), ancestor.clone()));
            }
        } else if Rc::ptr_eq(ancestor, after) {
            seen = true;
        }
    }
    None
}

/// Is `maybe_ancestor` in `class`'s ancestor list?
pub fn has_ancestor(class: &ClassRef, maybe_ancestor: &ClassRef, epoch: u64) -> bool {
    ancestors(class, epoch).iter().any(|c| Rc::ptr_eq(c, maybe_ancestor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ruse_core::SymbolTable;

    fn class(table: &mut SymbolTable, name: &str, superclass: Option<&ClassRef>) -> ClassRef {
        ClassData::new(table.intern(name), superclass.cloned(), false)
    }

    fn module(table: &mut SymbolTable, name: &str) -> ClassRef {
        ClassData::new(table.intern(name), None, true)
    }

    #[test]
    fn test_ancestor_order_include_prepend_super() {
        let mut table = SymbolTable::new();
        let object = class(&mut table, "Object", None);
        let m = module(&mut table, "M");
        let n = module(&mut table, "N");
        let p = module(&mut table, "P");
        let k = class(&mut table, "K", Some(&object));
        k.borrow_mut().includes.push(m.clone());
        k.borrow_mut().includes.push(n.clone());
        k.borrow_mut().prepends.push(p.clone());

        let list = ancestors(&k, 1);
        let ptrs: Vec<usize> = list.iter().map(|c| Rc::as_ptr(c) as usize).collect();
        let expect = [&p, &k, &n, &m, &object];
        let expect_ptrs: Vec<usize> = expect.iter().map(|c| Rc::as_ptr(c) as usize).collect();
        assert_eq!(ptrs, expect_ptrs, "prepend, self, includes (recent first), super");
    }

    #[test]
    fn test_most_recent_include_wins() {
        let mut table = SymbolTable::new();
        let object = class(&mut table, "Object", None);
        let m = module(&mut table, "M");
        let n = module(&mut table, "N");
        let v = table.intern("v");
        m.borrow_mut().methods.insert(v, MethodRecord::public(MethodKind::AttrReader(v)));
        n.borrow_mut().methods.insert(v, MethodRecord::public(MethodKind::AttrWriter(v)));
        let c = class(&mut table, "C", Some(&object));
        c.borrow_mut().includes.push(m.clone());
        c.borrow_mut().includes.push(n.clone());

        let (record, owner) = lookup_method(&c, v, 1).unwrap();
        assert!(Rc::ptr_eq(&owner, &n));
        assert!(matches!(record.kind, MethodKind::AttrWriter(_)));
    }

    #[test]
    fn test_epoch_invalidates_cache() {
        let mut table = SymbolTable::new();
        let object = class(&mut table, "Object", None);
        let c = class(&mut table, "C", Some(&object));
        let before = ancestors(&c, 1);
        assert_eq!(before.len(), 2);
        let m = module(&mut table, "M");
        c.borrow_mut().includes.push(m);
        // same epoch: stale list still served
        assert_eq!(ancestors(&c, 1).len(), 2);
        // bumped epoch: recomputed
        assert_eq!(ancestors(&c, 2).len(), 3);
    }

    #[test]
    fn test_lookup_after_for_super() {
        let mut table = SymbolTable::new();
        let object = class(&mut table, "Object", None);
        let v = table.intern("v");
        object
            .borrow_mut()
            .methods
            .insert(v, MethodRecord::public(MethodKind::AttrReader(v)));
        let a = class(&mut table, "A", Some(&object));
        a.borrow_mut().methods.insert(v, MethodRecord::public(MethodKind::AttrWriter(v)));
        let b = class(&mut table, "B", Some(&a));
        b.borrow_mut().methods.insert(v, MethodRecord::public(MethodKind::AttrWriter(v)));

        let (record, owner) = lookup_method_after(&b, v, &b, 1).unwrap();
        assert!(Rc::ptr_eq(&owner, &a));
        assert!(matches!(record.kind, MethodKind::AttrWriter(_)));
        let (record, owner) = lookup_method_after(&b, v, &a, 1).unwrap();
        assert!(Rc::ptr_eq(&owner, &object));
        assert!(matches!(record.kind, MethodKind::AttrReader(_)));
    }
}
