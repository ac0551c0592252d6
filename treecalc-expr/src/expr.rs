//! Immutable symbolic expressions
//!
//! An [`Expr`] is either an atom or an ordered list of expressions. Lists are
//! reference counted and carry their structural hash, so cloning is cheap
//! and equality between shared or identical subtrees is decided without
//! walking them. The same type serves as parsed syntax and as the canonical
//! key of a computation.

use crate::symbol::Symbol;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

#[derive(Clone)]
pub enum Expr {
    Symbol(Symbol),
    UInt(u64),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    List(Rc<ExprList>),
}

/// Shared list payload with its precomputed hash
pub struct ExprList {
    hash: u64,
    items: Box<[Expr]>,
}

impl ExprList {
    pub fn items(&self) -> &[Expr] {
        &self.items
    }
}

impl Expr {
    pub fn sym(name: &str) -> Expr {
        Expr::Symbol(Symbol::intern(name))
    }

    pub fn string(text: &str) -> Expr {
        Expr::Str(Rc::from(text))
    }

    pub fn list(items: Vec<Expr>) -> Expr {
        let mut hasher = DefaultHasher::new();
        items.len().hash(&mut hasher);
        for item in &items {
            item.hash(&mut hasher);
        }
        Expr::List(Rc::new(ExprList {
            hash: hasher.finish(),
            items: items.into_boxed_slice(),
        }))
    }

    /// `(head args...)`
    pub fn call(head: Symbol, args: Vec<Expr>) -> Expr {
        let mut items = Vec::with_capacity(args.len() + 1);
        items.push(Expr::Symbol(head));
        items.extend(args);
        Expr::list(items)
    }

    pub fn as_symbol(&self) -> Option<Symbol> {
        match self {
            Expr::Symbol(s) => Some(*s),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Expr::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Expr]> {
        match self {
            Expr::List(l) => Some(&l.items),
            _ => None,
        }
    }

    pub fn is_list(&self) -> bool {
        matches!(self, Expr::List(_))
    }

    pub fn is_atom(&self) -> bool {
        !self.is_list()
    }

    /// Literal constant: number or string
    pub fn is_literal(&self) -> bool {
        matches!(self, Expr::UInt(_) | Expr::Int(_) | Expr::Float(_) | Expr::Str(_))
    }

    /// Head symbol of a non-empty list
    pub fn head(&self) -> Option<Symbol> {
        self.as_list().and_then(|items| items.first()).and_then(Expr::as_symbol)
    }

    /// Elements after the head, empty for atoms
    pub fn args(&self) -> &[Expr] {
        match self.as_list() {
            Some(items) if !items.is_empty() => &items[1..],
            _ => &[],
        }
    }

    /// Is this `(head ...)` with the given head?
    pub fn is_call_of(&self, head: Symbol) -> bool {
        self.head() == Some(head)
    }

    /// Same allocation, for lists; same value for atoms
    pub fn ptr_eq(&self, other: &Expr) -> bool {
        match (self, other) {
            (Expr::List(a), Expr::List(b)) => Rc::ptr_eq(a, b),
            (Expr::Str(a), Expr::Str(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Symbol atoms in depth-first, left-to-right order
    pub fn symbols(&self) -> Vec<Symbol> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(e) = stack.pop() {
            match e {
                Expr::Symbol(s) => out.push(*s),
                Expr::List(l) => stack.extend(l.items.iter().rev()),
                _ => {}
            }
        }
        out
    }

    /// Number of nodes in the tree
    pub fn size(&self) -> usize {
        let mut n = 0;
        let mut stack = vec![self];
        while let Some(e) = stack.pop() {
            n += 1;
            if let Expr::List(l) = e {
                stack.extend(l.items.iter());
            }
        }
        n
    }
}

impl PartialEq for Expr {
    fn eq(&self, other: &Expr) -> bool {
        match (self, other) {
            (Expr::Symbol(a), Expr::Symbol(b)) => a == b,
            (Expr::UInt(a), Expr::UInt(b)) => a == b,
            (Expr::Int(a), Expr::Int(b)) => a == b,
            (Expr::Float(a), Expr::Float(b)) => a.to_bits() == b.to_bits(),
            (Expr::Str(a), Expr::Str(b)) => a == b,
            (Expr::List(a), Expr::List(b)) => {
                Rc::ptr_eq(a, b) || (a.hash == b.hash && a.items == b.items)
            }
            _ => false,
        }
    }
}

impl Eq for Expr {}

impl Hash for Expr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Expr::Symbol(s) => {
                state.write_u8(0);
                s.hash(state);
            }
            Expr::UInt(v) => {
                state.write_u8(1);
                v.hash(state);
            }
            Expr::Int(v) => {
                state.write_u8(2);
                v.hash(state);
            }
            Expr::Float(v) => {
                state.write_u8(3);
                v.to_bits().hash(state);
            }
            Expr::Str(s) => {
                state.write_u8(4);
                s.hash(state);
            }
            Expr::List(l) => {
                state.write_u8(5);
                state.write_u64(l.hash);
            }
        }
    }
}

impl From<Symbol> for Expr {
    fn from(sym: Symbol) -> Self {
        Expr::Symbol(sym)
    }
}

fn write_str_literal(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    f.write_str("\"")?;
    for c in s.chars() {
        match c {
            '"' => f.write_str("\\\"")?,
            '\\' => f.write_str("\\\\")?,
            '\n' => f.write_str("\\n")?,
            '\t' => f.write_str("\\t")?,
            c => write!(f, "{}", c)?,
        }
    }
    f.write_str("\"")
}

/// Prints the S-expression form read back by [`crate::read_sexpr`]
impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Symbol(s) => write!(f, "{}", s),
            Expr::UInt(v) => write!(f, "{}", v),
            Expr::Int(v) => write!(f, "{}", v),
            Expr::Float(v) => write!(f, "{:?}", v),
            Expr::Str(s) => write_str_literal(f, s),
            Expr::List(l) => {
                f.write_str("(")?;
                for (i, item) in l.items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str(")")
            }
        }
    }
}

impl fmt::Debug for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Expr({})", self)
    }
}
