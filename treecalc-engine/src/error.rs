//! Error taxonomy of the calculation core
//!
//! Failures are plain values. [`Interrupt`] adds the one outcome that is not
//! an error: a suspended walk that should be retried later.

use crate::tree::NodeId;
use treecalc_expr::ExprError;
use treecalc_types::{FailPhase, Timestamp};

/// Reasons a calculation rule or a computation fails
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CalcError {
    /// A name in a rule resolved to nothing
    #[error("Unknown identifier '{name}' in {context}{}", guess_suffix(.best_guess))]
    UnknownIdentifier {
        /// The name as written
        name: String,
        /// Full name of the search context
        context: String,
        /// Deepest item the name resolved to
        best_guess: Option<String>,
    },

    /// The rule of `item` depends on itself
    #[error("Calculation rule would create a circular dependency in {item}")]
    CircularDependency {
        /// Full name of the item whose rule closes the cycle
        item: String,
    },

    /// A rule outside a template refers into it
    #[error("Calculation rule would create a dependency on {item} which is (part of) a template")]
    TemplateReference {
        /// Full name of the referenced template member
        item: String,
    },

    /// No operator of the group accepts these arguments
    #[error("No overload of {operator} accepts ({args})")]
    NoOverload {
        /// Operator group name
        operator: String,
        /// Rendered argument kinds
        args: String,
    },

    /// A call to something that is neither an operator nor a template
    #[error("Unknown operator or template '{name}'")]
    UnknownOperator {
        /// Name in call position
        name: String,
    },

    /// Well-formed but not computable
    #[error("{message}")]
    IllegalExpression {
        /// What is wrong with the expression
        message: String,
    },

    /// A supplier of `item` failed
    #[error("{item} depends on {source_item} which failed: {reason}")]
    Downstream {
        /// The dependent item
        item: String,
        /// Item where the failure originated
        source_item: String,
        /// Message of the original failure
        reason: String,
    },

    /// Failure reported by an operator
    #[error("{operator}: {message}")]
    Operator {
        /// Operator name
        operator: String,
        /// Operator specific message
        message: String,
    },

    /// Data or meta info that is not there
    #[error("Undefined: {what}")]
    Undefined {
        /// What is missing
        what: String,
    },

    /// The rule text does not parse
    #[error("Syntax error in {item}: {error}")]
    Syntax {
        /// Full name of the item holding the rule
        item: String,
        /// Parser error
        error: ExprError,
    },

    /// Data of the wrong value type
    #[error("{item}: expected {expected}, found {found}")]
    TypeMismatch {
        /// Item or key the data was meant for
        item: String,
        /// Declared value type
        expected: String,
        /// Value type of the data
        found: String,
    },

    /// A storage manager failed to supply data
    #[error("Storage error: {0}")]
    Storage(String),
}

fn guess_suffix(best_guess: &Option<String>) -> String {
    best_guess
        .as_ref()
        .map(|g| format!(" (resolved up to {})", g))
        .unwrap_or_default()
}

impl CalcError {
    /// Failure reported by `operator`
    pub fn operator(operator: impl ToString, message: impl Into<String>) -> Self {
        CalcError::Operator {
            operator: operator.to_string(),
            message: message.into(),
        }
    }

    /// Wrap a supplier failure seen from `item`, keeping the original source
    pub fn downstream(item: impl Into<String>, supplier: &str, cause: &CalcError) -> Self {
        match cause {
            CalcError::Downstream {
                source_item, reason, ..
            } => CalcError::Downstream {
                item: item.into(),
                source_item: source_item.clone(),
                reason: reason.clone(),
            },
            other => CalcError::Downstream {
                item: item.into(),
                source_item: supplier.to_string(),
                reason: other.to_string(),
            },
        }
    }

    /// Full name of the item where the failure originated, for downstream errors
    pub fn origin(&self) -> Option<&str> {
        match self {
            CalcError::Downstream { source_item, .. } => Some(source_item),
            _ => None,
        }
    }
}

/// Result of a step that cannot be suspended
pub type Result<T> = std::result::Result<T, CalcError>;

/// Why a long walk stopped before producing a value
#[derive(Debug, Clone, PartialEq)]
pub enum Interrupt {
    /// Not an error: retry later from cached state
    Suspended,
    /// Failed; the error is memoized where it happened
    Failed(CalcError),
}

impl From<CalcError> for Interrupt {
    fn from(error: CalcError) -> Self {
        Interrupt::Failed(error)
    }
}

impl Interrupt {
    /// Should the walk be retried later?
    pub fn is_suspended(&self) -> bool {
        matches!(self, Interrupt::Suspended)
    }

    /// Map a failure, leaving suspension untouched
    pub fn map_failure(self, f: impl FnOnce(CalcError) -> CalcError) -> Interrupt {
        match self {
            Interrupt::Failed(e) => Interrupt::Failed(f(e)),
            Interrupt::Suspended => Interrupt::Suspended,
        }
    }
}

/// Result of a suspendible step
pub type Flow<T> = std::result::Result<T, Interrupt>;

/// Memoized failure, attached to a node or a controller
#[derive(Debug, Clone, PartialEq)]
pub struct FailRecord {
    /// Stage the failure happened in
    pub phase: FailPhase,
    /// The failure itself
    pub error: CalcError,
    /// Node the failure originated at, if known
    pub source: Option<NodeId>,
    /// Session time of the failure
    pub at: Timestamp,
}

impl FailRecord {
    /// Record of `error` raised in `phase`
    pub fn new(phase: FailPhase, error: CalcError, source: Option<NodeId>, at: Timestamp) -> Self {
        Self {
            phase,
            error,
            source,
            at,
        }
    }
}
