//! # treecalc expressions
//!
//! Syntax layer of the calculation core:
//! - a process-wide [`Symbol`] interner with fixed ids for special heads
//! - the immutable, structurally shared [`Expr`] tree
//! - an infix parser for the expression language written on model items
//! - a reader for the canonical S-expression form used as computation key
//!
//! ## Example
//!
//! ```
//! use treecalc_expr::{parse_expr, read_sexpr};
//!
//! let e = parse_expr("population / area").unwrap();
//! assert_eq!(e.to_string(), "(div population area)");
//! assert_eq!(read_sexpr("(div population area)").unwrap(), e);
//! ```

pub mod error;
pub mod expr;
pub mod lexer;
pub mod parser;
pub mod sexpr;
pub mod symbol;

pub use error::{ErrorContext, ExprError, Result};
pub use expr::{Expr, ExprList};
pub use lexer::{tokenize, SpannedToken, Token};
pub use parser::{parse_expr, Parser};
pub use sexpr::read_sexpr;
pub use symbol::{Symbol, SymbolTable};

pub use treecalc_types::{Span, ValueType};
