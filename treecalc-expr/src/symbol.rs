//! Process-wide symbol interner
//!
//! Every identifier, operator head and item name is interned once and
//! afterwards handled as a small copyable [`Symbol`]. The table lives for the
//! whole process and may be used from any thread.

use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// Interned identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(u32);

/// Symbols interned at startup, in id order
const WELL_KNOWN: &[&str] = &[
    "scope",
    "arrow",
    "subitem",
    "lookup",
    "sourceDescr",
    "this",
    "iif",
    "or",
    "and",
    "not",
    "eq",
    "ne",
    "lt",
    "le",
    "gt",
    "ge",
    "add",
    "sub",
    "mul",
    "div",
    "mod",
    "pow",
    "neg",
    "NrOfRows",
];

pub const SCOPE: Symbol = Symbol(0);
pub const ARROW: Symbol = Symbol(1);
pub const SUBITEM: Symbol = Symbol(2);
pub const LOOKUP: Symbol = Symbol(3);
pub const SOURCE: Symbol = Symbol(4);
pub const THIS: Symbol = Symbol(5);
pub const IIF: Symbol = Symbol(6);
pub const OR: Symbol = Symbol(7);
pub const AND: Symbol = Symbol(8);
pub const NOT: Symbol = Symbol(9);
pub const EQ: Symbol = Symbol(10);
pub const NE: Symbol = Symbol(11);
pub const LT: Symbol = Symbol(12);
pub const LE: Symbol = Symbol(13);
pub const GT: Symbol = Symbol(14);
pub const GE: Symbol = Symbol(15);
pub const ADD: Symbol = Symbol(16);
pub const SUB: Symbol = Symbol(17);
pub const MUL: Symbol = Symbol(18);
pub const DIV: Symbol = Symbol(19);
pub const MOD: Symbol = Symbol(20);
pub const POW: Symbol = Symbol(21);
pub const NEG: Symbol = Symbol(22);
pub const NR_OF_ROWS: Symbol = Symbol(23);

static SYMBOLS: Lazy<SymbolTable> = Lazy::new(SymbolTable::with_well_known);

/// Bidirectional mapping between text and [`Symbol`]
pub struct SymbolTable {
    ids: DashMap<Arc<str>, Symbol>,
    names: RwLock<Vec<Arc<str>>>,
}

impl SymbolTable {
    fn with_well_known() -> Self {
        let table = SymbolTable {
            ids: DashMap::new(),
            names: RwLock::new(Vec::new()),
        };
        for name in WELL_KNOWN {
            table.intern(name);
        }
        table
    }

    /// Intern a name, returning the existing symbol if already present
    pub fn intern(&self, name: &str) -> Symbol {
        if let Some(sym) = self.ids.get(name) {
            return *sym;
        }
        let key: Arc<str> = Arc::from(name);
        *self.ids.entry(key.clone()).or_insert_with(|| {
            let mut names = self.names.write();
            let sym = Symbol(names.len() as u32);
            names.push(key);
            sym
        })
    }

    pub fn get(&self, name: &str) -> Option<Symbol> {
        self.ids.get(name).map(|s| *s)
    }

    pub fn name(&self, sym: Symbol) -> Arc<str> {
        self.names.read()[sym.0 as usize].clone()
    }

    pub fn len(&self) -> usize {
        self.names.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for SymbolTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymbolTable").field("len", &self.len()).finish()
    }
}

impl Symbol {
    pub fn intern(name: &str) -> Symbol {
        SYMBOLS.intern(name)
    }

    /// Find a symbol without interning
    pub fn lookup(name: &str) -> Option<Symbol> {
        SYMBOLS.get(name)
    }

    pub fn as_str(self) -> Arc<str> {
        SYMBOLS.name(self)
    }

    pub fn id(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str())
    }
}

impl From<&str> for Symbol {
    fn from(name: &str) -> Self {
        Symbol::intern(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_known_ids_are_fixed() {
        assert_eq!(Symbol::intern("scope"), SCOPE);
        assert_eq!(Symbol::intern("sourceDescr"), SOURCE);
        assert_eq!(Symbol::intern("NrOfRows"), NR_OF_ROWS);
        assert_eq!(NEG.as_str().as_ref(), "neg");
    }

    #[test]
    fn interning_is_idempotent() {
        let a = Symbol::intern("someRegion");
        let b = Symbol::intern("someRegion");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "someRegion");
        assert_ne!(a, Symbol::intern("otherRegion"));
    }

    #[test]
    fn lookup_does_not_intern() {
        assert_eq!(Symbol::lookup("never_interned_name_42"), None);
        let s = Symbol::intern("now_interned_name_42");
        assert_eq!(Symbol::lookup("now_interned_name_42"), Some(s));
    }

    #[test]
    fn interning_from_threads_agrees() {
        let handles: Vec<_> = (0..4)
            .map(|_| std::thread::spawn(|| Symbol::intern("shared_by_threads")))
            .collect();
        let syms: Vec<Symbol> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(syms.windows(2).all(|w| w[0] == w[1]));
    }
}
