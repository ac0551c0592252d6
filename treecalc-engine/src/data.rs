//! Data payloads
//!
//! Values of a data item are held as one typed [`Column`]. Each node owns a
//! [`DataSlot`]: a lock around an optional shared column, so readers on
//! worker threads can snapshot a payload while the meta thread commits new
//! ones one writer at a time.

use crate::error::{Flow, Interrupt};
use crate::suspend::Checkpoint;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use treecalc_types::ValueType;

/// Sentinel-based undefined values
pub trait Undefined: Copy {
    /// The sentinel
    const UNDEFINED: Self;
    /// Not the sentinel?
    fn is_defined(self) -> bool;
}

macro_rules! undefined_sentinel {
    ($($t:ty => $v:expr),*) => {
        $(impl Undefined for $t {
            const UNDEFINED: Self = $v;
            fn is_defined(self) -> bool {
                self != $v
            }
        })*
    };
}

undefined_sentinel!(u16 => u16::MAX, u32 => u32::MAX, i32 => i32::MIN, i64 => i64::MIN);

impl Undefined for f64 {
    const UNDEFINED: Self = f64::NAN;
    fn is_defined(self) -> bool {
        !self.is_nan()
    }
}

/// Conversion from a float, yielding undefined when out of range
pub trait FromF64: Undefined {
    /// Truncates toward zero
    fn from_f64(x: f64) -> Self;
    /// `None` when undefined
    fn to_f64(self) -> Option<f64>;
}

macro_rules! int_from_f64 {
    ($($t:ty),*) => {
        $(impl FromF64 for $t {
            fn from_f64(x: f64) -> Self {
                let x = x.trunc();
                if x.is_nan() || x < <$t>::MIN as f64 || x > <$t>::MAX as f64 {
                    Self::UNDEFINED
                } else {
                    x as $t
                }
            }
            fn to_f64(self) -> Option<f64> {
                self.is_defined().then_some(self as f64)
            }
        })*
    };
}

int_from_f64!(u16, u32, i32, i64);

impl FromF64 for f64 {
    fn from_f64(x: f64) -> Self {
        x
    }
    fn to_f64(self) -> Option<f64> {
        self.is_defined().then_some(self)
    }
}

/// A single element
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Boolean
    Bool(bool),
    /// `u16::MAX` is undefined
    UInt16(u16),
    /// `u32::MAX` is undefined
    UInt32(u32),
    /// `i32::MIN` is undefined
    Int32(i32),
    /// `i64::MIN` is undefined
    Int64(i64),
    /// NaN is undefined
    Float64(f64),
    /// Text; always defined
    String(String),
}

impl Value {
    /// Element type
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Bool(_) => ValueType::Bool,
            Value::UInt16(_) => ValueType::UInt16,
            Value::UInt32(_) => ValueType::UInt32,
            Value::Int32(_) => ValueType::Int32,
            Value::Int64(_) => ValueType::Int64,
            Value::Float64(_) => ValueType::Float64,
            Value::String(_) => ValueType::String,
        }
    }

    /// Not the undefined sentinel of its type?
    pub fn is_defined(&self) -> bool {
        match self {
            Value::Bool(_) | Value::String(_) => true,
            Value::UInt16(v) => v.is_defined(),
            Value::UInt32(v) => v.is_defined(),
            Value::Int32(v) => v.is_defined(),
            Value::Int64(v) => v.is_defined(),
            Value::Float64(v) => v.is_defined(),
        }
    }

    /// Non-negative integral value, if defined
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Bool(b) => Some(*b as u64),
            Value::UInt16(v) => v.is_defined().then_some(*v as u64),
            Value::UInt32(v) => v.is_defined().then_some(*v as u64),
            Value::Int32(v) => (v.is_defined() && *v >= 0).then_some(*v as u64),
            Value::Int64(v) => (v.is_defined() && *v >= 0).then_some(*v as u64),
            Value::Float64(v) => (v.is_defined() && *v >= 0.0 && v.fract() == 0.0).then_some(*v as u64),
            Value::String(_) => None,
        }
    }

    /// Numeric value; strings are parsed
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::UInt16(v) => v.to_f64(),
            Value::UInt32(v) => v.to_f64(),
            Value::Int32(v) => v.to_f64(),
            Value::Int64(v) => v.to_f64(),
            Value::Float64(v) => v.to_f64(),
            Value::String(s) => s.trim().parse().ok(),
        }
    }

    /// Text of a string value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_defined() {
            return f.write_str("null");
        }
        match self {
            Value::Bool(v) => write!(f, "{}", v),
            Value::UInt16(v) => write!(f, "{}", v),
            Value::UInt32(v) => write!(f, "{}", v),
            Value::Int32(v) => write!(f, "{}", v),
            Value::Int64(v) => write!(f, "{}", v),
            Value::Float64(v) => write!(f, "{}", v),
            Value::String(v) => f.write_str(v),
        }
    }
}

/// Values of one data item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Column {
    /// Booleans
    Bool(Vec<bool>),
    /// Small counts and indices
    UInt16(Vec<u16>),
    /// Indices and counts
    UInt32(Vec<u32>),
    /// Signed integers
    Int32(Vec<i32>),
    /// Wide signed integers
    Int64(Vec<i64>),
    /// Reals
    Float64(Vec<f64>),
    /// Texts
    String(Vec<String>),
}

impl Column {
    /// Element type
    pub fn value_type(&self) -> ValueType {
        match self {
            Column::Bool(_) => ValueType::Bool,
            Column::UInt16(_) => ValueType::UInt16,
            Column::UInt32(_) => ValueType::UInt32,
            Column::Int32(_) => ValueType::Int32,
            Column::Int64(_) => ValueType::Int64,
            Column::Float64(_) => ValueType::Float64,
            Column::String(_) => ValueType::String,
        }
    }

    /// Element count
    pub fn len(&self) -> usize {
        match self {
            Column::Bool(v) => v.len(),
            Column::UInt16(v) => v.len(),
            Column::UInt32(v) => v.len(),
            Column::Int32(v) => v.len(),
            Column::Int64(v) => v.len(),
            Column::Float64(v) => v.len(),
            Column::String(v) => v.len(),
        }
    }

    /// No elements?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element `i`; `None` past the end
    pub fn get(&self, i: usize) -> Option<Value> {
        match self {
            Column::Bool(v) => v.get(i).map(|x| Value::Bool(*x)),
            Column::UInt16(v) => v.get(i).map(|x| Value::UInt16(*x)),
            Column::UInt32(v) => v.get(i).map(|x| Value::UInt32(*x)),
            Column::Int32(v) => v.get(i).map(|x| Value::Int32(*x)),
            Column::Int64(v) => v.get(i).map(|x| Value::Int64(*x)),
            Column::Float64(v) => v.get(i).map(|x| Value::Float64(*x)),
            Column::String(v) => v.get(i).map(|x| Value::String(x.clone())),
        }
    }

    /// Single-element column
    pub fn scalar(value: Value) -> Column {
        match value {
            Value::Bool(v) => Column::Bool(vec![v]),
            Value::UInt16(v) => Column::UInt16(vec![v]),
            Value::UInt32(v) => Column::UInt32(vec![v]),
            Value::Int32(v) => Column::Int32(vec![v]),
            Value::Int64(v) => Column::Int64(vec![v]),
            Value::Float64(v) => Column::Float64(vec![v]),
            Value::String(v) => Column::String(vec![v]),
        }
    }

    /// Build a column of `vt` from values, converting each one
    pub fn from_values(vt: ValueType, values: &[Value]) -> Column {
        let floats = || values.iter().map(|v| v.as_f64().unwrap_or(f64::NAN));
        match vt {
            ValueType::Bool => Column::Bool(
                values
                    .iter()
                    .map(|v| v.as_f64().map(|x| x != 0.0).unwrap_or(false))
                    .collect(),
            ),
            ValueType::UInt16 => Column::UInt16(floats().map(u16::from_f64).collect()),
            ValueType::UInt32 => Column::UInt32(floats().map(u32::from_f64).collect()),
            ValueType::Int32 => Column::Int32(floats().map(i32::from_f64).collect()),
            ValueType::Int64 => Column::Int64(floats().map(i64::from_f64).collect()),
            ValueType::Float64 => Column::Float64(floats().collect()),
            ValueType::String => Column::String(values.iter().map(|v| v.to_string()).collect()),
        }
    }

    /// Element converted to a float, `None` when undefined or not numeric
    pub fn f64_at(&self, i: usize) -> Option<f64> {
        self.get(i).and_then(|v| v.as_f64())
    }

    /// Convert to another value type, polling `cp` once per chunk
    pub fn cast(&self, vt: ValueType, chunk: usize, cp: &dyn Checkpoint) -> Flow<Column> {
        if vt == self.value_type() {
            return Ok(self.clone());
        }
        let chunk = chunk.max(1);
        let mut values = Vec::with_capacity(self.len());
        for start in (0..self.len()).step_by(chunk) {
            if cp.must_suspend() {
                return Err(Interrupt::Suspended);
            }
            let end = (start + chunk).min(self.len());
            values.extend((start..end).filter_map(|i| self.get(i)));
        }
        Ok(match (vt, self) {
            (ValueType::Bool, Column::String(v)) => Column::Bool(
                v.iter()
                    .map(|s| matches!(s.trim(), "true" | "True" | "1"))
                    .collect(),
            ),
            _ => Column::from_values(vt, &values),
        })
    }

    /// Stable byte form used for content fingerprints
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Per-node payload slot
pub type DataSlot = Arc<RwLock<Option<Arc<Column>>>>;

/// Empty slot
pub fn new_slot() -> DataSlot {
    Arc::new(RwLock::new(None))
}

/// Shared read access to a node's payload
#[derive(Debug)]
pub struct DataReadLock<'a> {
    guard: RwLockReadGuard<'a, Option<Arc<Column>>>,
}

impl<'a> DataReadLock<'a> {
    /// Blocks while a writer holds the slot
    pub fn new(slot: &'a DataSlot) -> Self {
        Self { guard: slot.read() }
    }

    /// Payload, if one was committed
    pub fn column(&self) -> Option<&Column> {
        self.guard.as_deref()
    }

    /// Keep the payload beyond the lock
    pub fn snapshot(&self) -> Option<Arc<Column>> {
        self.guard.clone()
    }
}

/// Exclusive access for committing a payload
#[derive(Debug)]
pub struct DataWriteLock<'a> {
    guard: RwLockWriteGuard<'a, Option<Arc<Column>>>,
}

impl<'a> DataWriteLock<'a> {
    /// Blocks while readers hold the slot
    pub fn new(slot: &'a DataSlot) -> Self {
        Self { guard: slot.write() }
    }

    /// Replace the payload
    pub fn commit(mut self, column: Arc<Column>) {
        *self.guard = Some(column);
    }

    /// Drop the payload
    pub fn clear(mut self) {
        *self.guard = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suspend::NoSuspend;

    #[test]
    fn undefined_sentinels() {
        assert!(!u16::UNDEFINED.is_defined());
        assert!(!f64::UNDEFINED.is_defined());
        assert!(7i32.is_defined());
        assert_eq!(u16::from_f64(70000.0), u16::UNDEFINED);
        assert_eq!(i32::from_f64(-3.7), -3);
    }

    #[test]
    fn cast_between_types() {
        let c = Column::Float64(vec![1.5, -2.0, f64::NAN]);
        let cast = c.cast(ValueType::Int32, 2, &NoSuspend).unwrap();
        assert_eq!(cast, Column::Int32(vec![1, -2, i32::UNDEFINED]));

        let s = Column::UInt32(vec![3, u32::UNDEFINED]).cast(ValueType::String, 8, &NoSuspend).unwrap();
        assert_eq!(s, Column::String(vec!["3".into(), "null".into()]));

        let parsed = Column::String(vec!["4".into(), "x".into()]).cast(ValueType::UInt16, 8, &NoSuspend).unwrap();
        assert_eq!(parsed, Column::UInt16(vec![4, u16::UNDEFINED]));
    }

    #[test]
    fn scalar_values() {
        let c = Column::scalar(Value::UInt16(3));
        assert_eq!(c.len(), 1);
        assert_eq!(c.get(0).and_then(|v| v.as_u64()), Some(3));
        assert_eq!(Value::Int32(-1).as_u64(), None);
        assert_eq!(Value::UInt32(u32::UNDEFINED).to_string(), "null");
    }

    #[test]
    fn locks_guard_the_slot() {
        let slot = new_slot();
        DataWriteLock::new(&slot).commit(Arc::new(Column::Bool(vec![true])));
        let read = DataReadLock::new(&slot);
        assert_eq!(read.column().map(|c| c.len()), Some(1));
        let other = DataReadLock::new(&slot);
        assert!(other.snapshot().is_some());
    }
}
