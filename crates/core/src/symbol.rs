//! Interned symbols
//!
//! Every identifier, method name, and `:symbol` literal is interned once
//! per interpreter and referred to by a stable `u32` id afterwards. Two
//! symbols with the same text always compare equal by id, and symbol
//! hashing is just the id. The table is interpreter-local: symbols from
//! different interpreter instances must never be mixed.

use rustc_hash::FxHashMap;
use std::fmt;
use std::rc::Rc;

/// An interned identifier. Cheap to copy, compare, and hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(u32);

impl Symbol {
    /// Raw id, usable as an index into side tables.
    #[inline]
    pub fn id(self) -> u32 {
        self.0
    }

    /// Rebuild a symbol from an id previously obtained via [`Symbol::id`].
    /// Only valid against the table the id came from.
    #[inline]
    pub fn from_raw(id: u32) -> Symbol {
        Symbol(id)
    }
}

/// Interner mapping symbol text to ids and back.
///
/// Lookup by text is a hash probe; lookup by id is an index. Names are
/// stored once as `Rc<str>` so callers can hold onto a name without
/// borrowing the table.
#[derive(Debug, Default)]
pub struct SymbolTable {
    names: Vec<Rc<str>>,
    ids: FxHashMap<Rc<str>, Symbol>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `text`, returning the existing id if it was seen before.
    pub fn intern(&mut self, text: &str) -> Symbol {
        if let Some(&sym) = self.ids.get(text) {
            return sym;
        }
        let name: Rc<str> = Rc::from(text);
        let sym = Symbol(self.names.len() as u32);
        self.names.push(name.clone());
        self.ids.insert(name, sym);
        sym
    }

    /// The text for `sym`.
    ///
    /// # Panics
    /// Panics if `sym` came from a different table.
    pub fn name(&self, sym: Symbol) -> Rc<str> {
        self.names[sym.0 as usize].clone()
    }

    /// Borrowed view of the text for `sym`.
    pub fn name_ref(&self, sym: Symbol) -> &str {
        &self.names[sym.0 as usize]
    }

    /// Number of interned symbols.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sym#{}", self.0)
    }
}
