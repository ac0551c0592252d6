//! Shared types for treecalc
//!
//! This crate provides the small value types used across the treecalc
//! workspace: source spans, logical timestamps, element value types and
//! failure phases.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Byte range in a source string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Smallest span covering both
    pub fn merge(self, other: Span) -> Span {
        Span::new(self.start.min(other.start), self.end.max(other.end))
    }
}

/// Logical time of a session
///
/// Every change to an expression or to source data advances the session
/// clock. Cached results remember the timestamp they were derived at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub fn next(self) -> Timestamp {
        Timestamp(self.0 + 1)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Element type of a unit or data item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ValueType {
    Bool,
    UInt16,
    UInt32,
    Int32,
    Int64,
    Float64,
    String,
}

impl ValueType {
    pub const ALL: [ValueType; 7] = [
        ValueType::Bool,
        ValueType::UInt16,
        ValueType::UInt32,
        ValueType::Int32,
        ValueType::Int64,
        ValueType::Float64,
        ValueType::String,
    ];

    /// Name as written in expressions, e.g. `UInt16`
    pub fn name(self) -> &'static str {
        match self {
            ValueType::Bool => "Bool",
            ValueType::UInt16 => "UInt16",
            ValueType::UInt32 => "UInt32",
            ValueType::Int32 => "Int32",
            ValueType::Int64 => "Int64",
            ValueType::Float64 => "Float64",
            ValueType::String => "String",
        }
    }

    pub fn from_name(name: &str) -> Option<ValueType> {
        ValueType::ALL.into_iter().find(|vt| vt.name() == name)
    }

    pub fn is_numeric(self) -> bool {
        !matches!(self, ValueType::Bool | ValueType::String)
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            ValueType::UInt16 | ValueType::UInt32 | ValueType::Int32 | ValueType::Int64
        )
    }

    pub fn is_signed(self) -> bool {
        matches!(self, ValueType::Int32 | ValueType::Int64 | ValueType::Float64)
    }

    /// Approximate storage cost of one element
    pub fn byte_width(self) -> u64 {
        match self {
            ValueType::Bool => 1,
            ValueType::UInt16 => 2,
            ValueType::UInt32 | ValueType::Int32 => 4,
            ValueType::Int64 | ValueType::Float64 => 8,
            ValueType::String => 24,
        }
    }

    /// Compact bit for use in [`ValueTypes`]
    pub const fn bit(self) -> u16 {
        1 << (self as u16)
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Set of value types, used in operator signatures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ValueTypes(pub u16);

impl ValueTypes {
    pub const NONE: ValueTypes = ValueTypes(0);
    pub const ALL: ValueTypes = ValueTypes(0x7f);
    pub const BOOL: ValueTypes = ValueTypes(ValueType::Bool.bit());
    pub const STRING: ValueTypes = ValueTypes(ValueType::String.bit());
    pub const INTEGER: ValueTypes = ValueTypes(
        ValueType::UInt16.bit()
            | ValueType::UInt32.bit()
            | ValueType::Int32.bit()
            | ValueType::Int64.bit(),
    );
    pub const NUMERIC: ValueTypes = ValueTypes(Self::INTEGER.0 | ValueType::Float64.bit());
    pub const SIGNED: ValueTypes =
        ValueTypes(ValueType::Int32.bit() | ValueType::Int64.bit() | ValueType::Float64.bit());
    pub const ORDERED: ValueTypes = ValueTypes(Self::NUMERIC.0 | ValueType::String.bit());

    pub fn contains(self, vt: ValueType) -> bool {
        self.0 & vt.bit() != 0
    }

    pub fn with(self, vt: ValueType) -> ValueTypes {
        ValueTypes(self.0 | vt.bit())
    }
}

/// Evaluation phase in which a failure was recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailPhase {
    /// Substitution, operator resolution or result construction
    MetaInfo,
    /// Computing the values
    Data,
}

impl fmt::Display for FailPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailPhase::MetaInfo => write!(f, "meta info"),
            FailPhase::Data => write!(f, "data"),
        }
    }
}
