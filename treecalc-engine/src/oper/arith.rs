//! Element-wise arithmetic, comparison and logic

use super::{
    at, broadcast_len, map_chunks, ArgClass, ArgPolicies, ArgPolicy, ArgRef, OperContext, OperGroup,
    OperRegistry, Operator, ResultSlot, Shape, Signature,
};
use crate::data::{Column, Undefined};
use crate::error::{CalcError, Flow, Interrupt, Result};
use crate::suspend::Checkpoint;
use treecalc_expr::Symbol;
use treecalc_types::{ValueType, ValueTypes};

/// Integer ops are checked; overflow, undefined inputs and division by zero
/// give the undefined sentinel
pub(crate) trait Arith: Undefined + PartialOrd {
    fn add(self, o: Self) -> Self;
    fn sub(self, o: Self) -> Self;
    fn mul(self, o: Self) -> Self;
    fn div(self, o: Self) -> Self;
    fn rem(self, o: Self) -> Self;
    fn pow(self, o: Self) -> Self;
}

macro_rules! int_arith {
    ($($t:ty),*) => {
        $(impl Arith for $t {
            fn add(self, o: Self) -> Self {
                checked(self, o, <$t>::checked_add)
            }
            fn sub(self, o: Self) -> Self {
                checked(self, o, <$t>::checked_sub)
            }
            fn mul(self, o: Self) -> Self {
                checked(self, o, <$t>::checked_mul)
            }
            fn div(self, o: Self) -> Self {
                checked(self, o, <$t>::checked_div)
            }
            fn rem(self, o: Self) -> Self {
                checked(self, o, <$t>::checked_rem)
            }
            fn pow(self, o: Self) -> Self {
                checked(self, o, |a, b| u32::try_from(b).ok().and_then(|e| a.checked_pow(e)))
            }
        })*
    };
}

fn checked<T: Undefined>(a: T, b: T, f: impl Fn(T, T) -> Option<T>) -> T {
    if !a.is_defined() || !b.is_defined() {
        return T::UNDEFINED;
    }
    f(a, b).filter(|r| r.is_defined()).unwrap_or(T::UNDEFINED)
}

int_arith!(u16, u32, i32, i64);

impl Arith for f64 {
    fn add(self, o: Self) -> Self {
        self + o
    }
    fn sub(self, o: Self) -> Self {
        self - o
    }
    fn mul(self, o: Self) -> Self {
        self * o
    }
    fn div(self, o: Self) -> Self {
        if o == 0.0 {
            f64::NAN
        } else {
            self / o
        }
    }
    fn rem(self, o: Self) -> Self {
        if o == 0.0 {
            f64::NAN
        } else {
            self % o
        }
    }
    fn pow(self, o: Self) -> Self {
        self.powf(o)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
}

impl BinOp {
    fn name(self) -> &'static str {
        match self {
            BinOp::Add => "add",
            BinOp::Sub => "sub",
            BinOp::Mul => "mul",
            BinOp::Div => "div",
            BinOp::Mod => "mod",
            BinOp::Pow => "pow",
        }
    }

    fn apply<T: Arith>(self, a: T, b: T) -> T {
        match self {
            BinOp::Add => a.add(b),
            BinOp::Sub => a.sub(b),
            BinOp::Mul => a.mul(b),
            BinOp::Div => a.div(b),
            BinOp::Mod => a.rem(b),
            BinOp::Pow => a.pow(b),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn name(self) -> &'static str {
        match self {
            CmpOp::Eq => "eq",
            CmpOp::Ne => "ne",
            CmpOp::Lt => "lt",
            CmpOp::Le => "le",
            CmpOp::Gt => "gt",
            CmpOp::Ge => "ge",
        }
    }

    fn apply<T: PartialOrd + ?Sized>(self, a: &T, b: &T) -> bool {
        match self {
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
            CmpOp::Lt => a < b,
            CmpOp::Le => a <= b,
            CmpOp::Gt => a > b,
            CmpOp::Ge => a >= b,
        }
    }
}

fn rank(vt: ValueType) -> u8 {
    match vt {
        ValueType::Bool => 0,
        ValueType::UInt16 => 1,
        ValueType::UInt32 => 2,
        ValueType::Int32 => 3,
        ValueType::Int64 => 4,
        ValueType::Float64 => 5,
        ValueType::String => 6,
    }
}

/// Smallest type both operands convert to without losing range
pub(crate) fn common_type(a: ValueType, b: ValueType) -> ValueType {
    match (a, b) {
        _ if a == b => a,
        (ValueType::UInt32, ValueType::Int32) | (ValueType::Int32, ValueType::UInt32) => ValueType::Int64,
        _ if rank(a) >= rank(b) => a,
        _ => b,
    }
}

/// Operand type of an element-wise call: a data item's type wins over
/// parameters, otherwise the common type
pub(crate) fn operand_type(args: &[ArgRef]) -> Option<ValueType> {
    let mut data_type = None;
    let mut all = None;
    let mut data_agrees = true;
    for arg in args {
        let vt = arg.value_type()?;
        all = Some(all.map_or(vt, |prev| common_type(prev, vt)));
        if !arg.is_param() {
            match data_type {
                None => data_type = Some(vt),
                Some(prev) if prev != vt => data_agrees = false,
                _ => {}
            }
        }
    }
    match data_type {
        Some(vt) if data_agrees => Some(vt),
        _ => all,
    }
}

/// Create the placeholder for an element-wise result
pub(crate) fn elementwise_result(
    ctx: &mut OperContext<'_>,
    slot: &mut ResultSlot,
    name: Symbol,
    args: &[ArgRef],
    vt: ValueType,
) -> Result<bool> {
    let domain = ctx.common_domain(name, args)?;
    let values = args.iter().find_map(|a| match a {
        ArgRef::Data { meta, .. } if meta.value_type == Some(vt) => meta.values,
        _ => None,
    });
    slot.result = Some(ctx.new_data_result(vt, domain, values));
    Ok(false)
}

fn cast_all(inputs: &[&Column], vt: ValueType, chunk: usize, cp: &dyn Checkpoint) -> Flow<Vec<Column>> {
    inputs.iter().map(|c| c.cast(vt, chunk, cp)).collect()
}

fn type_error(op: &str, vt: ValueType) -> Interrupt {
    Interrupt::Failed(CalcError::operator(op, format!("not defined for {}", vt)))
}

pub(crate) fn numeric_binop(op: BinOp, a: &Column, b: &Column, vt: ValueType, chunk: usize, cp: &dyn Checkpoint) -> Flow<Column> {
    let cast = cast_all(&[a, b], vt, chunk, cp)?;
    let n = broadcast_len(op.name(), &[cast[0].len(), cast[1].len()])?;
    macro_rules! go {
        ($variant:ident) => {
            match (&cast[0], &cast[1]) {
                (Column::$variant(x), Column::$variant(y)) => Column::$variant(map_chunks(n, chunk, cp, |i| {
                    op.apply(x[at(x.len(), i)], y[at(y.len(), i)])
                })?),
                _ => return Err(type_error(op.name(), vt)),
            }
        };
    }
    Ok(match vt {
        ValueType::UInt16 => go!(UInt16),
        ValueType::UInt32 => go!(UInt32),
        ValueType::Int32 => go!(Int32),
        ValueType::Int64 => go!(Int64),
        ValueType::Float64 => go!(Float64),
        other => return Err(type_error(op.name(), other)),
    })
}

#[derive(Debug)]
struct Numeric {
    op: BinOp,
    sig: Signature,
}

impl Operator for Numeric {
    fn signature(&self) -> &Signature {
        &self.sig
    }

    fn create_result(&self, ctx: &mut OperContext<'_>, slot: &mut ResultSlot, args: &[ArgRef], _must_calc: bool) -> Result<bool> {
        let vt = operand_type(args).unwrap_or(ValueType::Float64);
        elementwise_result(ctx, slot, Symbol::intern(self.op.name()), args, vt)
    }

    fn calc_data(&self, inputs: &[&Column], shape: &Shape, cp: &dyn Checkpoint) -> Flow<Column> {
        numeric_binop(self.op, inputs[0], inputs[1], shape.value_type, shape.chunk, cp)
    }
}

#[derive(Debug)]
struct Concat {
    sig: Signature,
}

impl Operator for Concat {
    fn signature(&self) -> &Signature {
        &self.sig
    }

    fn create_result(&self, ctx: &mut OperContext<'_>, slot: &mut ResultSlot, args: &[ArgRef], _must_calc: bool) -> Result<bool> {
        elementwise_result(ctx, slot, Symbol::intern("add"), args, ValueType::String)
    }

    fn calc_data(&self, inputs: &[&Column], shape: &Shape, cp: &dyn Checkpoint) -> Flow<Column> {
        match (inputs[0], inputs[1]) {
            (Column::String(a), Column::String(b)) => {
                let n = broadcast_len("add", &[a.len(), b.len()])?;
                Ok(Column::String(map_chunks(n, shape.chunk, cp, |i| {
                    format!("{}{}", a[at(a.len(), i)], b[at(b.len(), i)])
                })?))
            }
            _ => Err(type_error("add", ValueType::String)),
        }
    }
}

#[derive(Debug)]
struct Compare {
    op: CmpOp,
    sig: Signature,
}

impl Operator for Compare {
    fn signature(&self) -> &Signature {
        &self.sig
    }

    fn create_result(&self, ctx: &mut OperContext<'_>, slot: &mut ResultSlot, args: &[ArgRef], _must_calc: bool) -> Result<bool> {
        let domain = ctx.common_domain(Symbol::intern(self.op.name()), args)?;
        slot.result = Some(ctx.new_data_result(ValueType::Bool, domain, None));
        Ok(false)
    }

    fn calc_data(&self, inputs: &[&Column], shape: &Shape, cp: &dyn Checkpoint) -> Flow<Column> {
        let vt = common_type(inputs[0].value_type(), inputs[1].value_type());
        let cast = cast_all(inputs, vt, shape.chunk, cp)?;
        let n = broadcast_len(self.op.name(), &[cast[0].len(), cast[1].len()])?;
        let op = self.op;
        macro_rules! defined {
            ($variant:ident) => {
                match (&cast[0], &cast[1]) {
                    (Column::$variant(x), Column::$variant(y)) => map_chunks(n, shape.chunk, cp, |i| {
                        let (a, b) = (x[at(x.len(), i)], y[at(y.len(), i)]);
                        if a.is_defined() && b.is_defined() {
                            op.apply(&a, &b)
                        } else {
                            op == CmpOp::Ne
                        }
                    })?,
                    _ => return Err(type_error(op.name(), vt)),
                }
            };
        }
        let out = match (&cast[0], &cast[1]) {
            (Column::Bool(x), Column::Bool(y)) => {
                map_chunks(n, shape.chunk, cp, |i| op.apply(&x[at(x.len(), i)], &y[at(y.len(), i)]))?
            }
            (Column::String(x), Column::String(y)) => map_chunks(n, shape.chunk, cp, |i| {
                op.apply(x[at(x.len(), i)].as_str(), y[at(y.len(), i)].as_str())
            })?,
            _ => match vt {
                ValueType::UInt16 => defined!(UInt16),
                ValueType::UInt32 => defined!(UInt32),
                ValueType::Int32 => defined!(Int32),
                ValueType::Int64 => defined!(Int64),
                ValueType::Float64 => defined!(Float64),
                other => return Err(type_error(op.name(), other)),
            },
        };
        Ok(Column::Bool(out))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Logic {
    And,
    Or,
    Not,
}

#[derive(Debug)]
struct Logical {
    op: Logic,
    sig: Signature,
}

impl Operator for Logical {
    fn signature(&self) -> &Signature {
        &self.sig
    }

    fn create_result(&self, ctx: &mut OperContext<'_>, slot: &mut ResultSlot, args: &[ArgRef], _must_calc: bool) -> Result<bool> {
        let name = match self.op {
            Logic::And => "and",
            Logic::Or => "or",
            Logic::Not => "not",
        };
        elementwise_result(ctx, slot, Symbol::intern(name), args, ValueType::Bool)
    }

    fn calc_data(&self, inputs: &[&Column], shape: &Shape, cp: &dyn Checkpoint) -> Flow<Column> {
        let bools: Vec<&[bool]> = inputs
            .iter()
            .map(|c| match c {
                Column::Bool(v) => Ok(v.as_slice()),
                other => Err(type_error("logic", other.value_type())),
            })
            .collect::<Flow<_>>()?;
        let lens: Vec<usize> = bools.iter().map(|b| b.len()).collect();
        let n = broadcast_len("logic", &lens)?;
        let out = match self.op {
            Logic::Not => map_chunks(n, shape.chunk, cp, |i| !bools[0][at(lens[0], i)])?,
            Logic::And => map_chunks(n, shape.chunk, cp, |i| {
                bools[0][at(lens[0], i)] && bools[1][at(lens[1], i)]
            })?,
            Logic::Or => map_chunks(n, shape.chunk, cp, |i| {
                bools[0][at(lens[0], i)] || bools[1][at(lens[1], i)]
            })?,
        };
        Ok(Column::Bool(out))
    }
}

#[derive(Debug)]
struct Negate {
    sig: Signature,
}

impl Operator for Negate {
    fn signature(&self) -> &Signature {
        &self.sig
    }

    fn create_result(&self, ctx: &mut OperContext<'_>, slot: &mut ResultSlot, args: &[ArgRef], _must_calc: bool) -> Result<bool> {
        let vt = args[0].value_type().unwrap_or(ValueType::Float64);
        elementwise_result(ctx, slot, Symbol::intern("neg"), args, vt)
    }

    fn calc_data(&self, inputs: &[&Column], shape: &Shape, cp: &dyn Checkpoint) -> Flow<Column> {
        let n = inputs[0].len();
        Ok(match inputs[0] {
            Column::Int32(v) => Column::Int32(map_chunks(n, shape.chunk, cp, |i| {
                checked(v[i], v[i], |a, _| a.checked_neg())
            })?),
            Column::Int64(v) => Column::Int64(map_chunks(n, shape.chunk, cp, |i| {
                checked(v[i], v[i], |a, _| a.checked_neg())
            })?),
            Column::Float64(v) => Column::Float64(map_chunks(n, shape.chunk, cp, |i| -v[i])?),
            other => return Err(type_error("neg", other.value_type())),
        })
    }
}

#[derive(Debug)]
struct Iif {
    sig: Signature,
}

impl Operator for Iif {
    fn signature(&self) -> &Signature {
        &self.sig
    }

    fn create_result(&self, ctx: &mut OperContext<'_>, slot: &mut ResultSlot, args: &[ArgRef], _must_calc: bool) -> Result<bool> {
        let vt = operand_type(&args[1..]).unwrap_or(ValueType::Float64);
        elementwise_result(ctx, slot, treecalc_expr::symbol::IIF, args, vt)
    }

    fn calc_data(&self, inputs: &[&Column], shape: &Shape, cp: &dyn Checkpoint) -> Flow<Column> {
        let Column::Bool(cond) = inputs[0] else {
            return Err(type_error("iif", inputs[0].value_type()));
        };
        let cast = cast_all(&inputs[1..], shape.value_type, shape.chunk, cp)?;
        let (lc, la, lb) = (cond.len(), cast[0].len(), cast[1].len());
        let n = broadcast_len("iif", &[lc, la, lb])?;
        macro_rules! pick {
            ($variant:ident) => {
                match (&cast[0], &cast[1]) {
                    (Column::$variant(a), Column::$variant(b)) => Column::$variant(map_chunks(n, shape.chunk, cp, |i| {
                        if cond[at(lc, i)] {
                            a[at(la, i)].clone()
                        } else {
                            b[at(lb, i)].clone()
                        }
                    })?),
                    _ => return Err(type_error("iif", shape.value_type)),
                }
            };
        }
        Ok(match shape.value_type {
            ValueType::Bool => pick!(Bool),
            ValueType::UInt16 => pick!(UInt16),
            ValueType::UInt32 => pick!(UInt32),
            ValueType::Int32 => pick!(Int32),
            ValueType::Int64 => pick!(Int64),
            ValueType::Float64 => pick!(Float64),
            ValueType::String => pick!(String),
        })
    }
}

fn binary(types: ValueTypes) -> Signature {
    Signature::fixed(vec![ArgClass::Data(types), ArgClass::Data(types)])
}

fn eager() -> ArgPolicies {
    ArgPolicies::Fixed(vec![ArgPolicy::Eager])
}

pub(super) fn register(registry: &mut OperRegistry) {
    for op in [BinOp::Add, BinOp::Sub, BinOp::Mul, BinOp::Div, BinOp::Mod, BinOp::Pow] {
        let mut group = OperGroup::new(op.name(), eager()).with(Numeric {
            op,
            sig: binary(ValueTypes::NUMERIC),
        });
        if op == BinOp::Add {
            group = group.with(Concat {
                sig: binary(ValueTypes::STRING),
            });
        }
        registry.register(group);
    }
    for op in [CmpOp::Eq, CmpOp::Ne, CmpOp::Lt, CmpOp::Le, CmpOp::Gt, CmpOp::Ge] {
        let mut group = OperGroup::new(op.name(), eager()).with(Compare {
            op,
            sig: binary(ValueTypes::ORDERED),
        });
        if matches!(op, CmpOp::Eq | CmpOp::Ne) {
            group = group.with(Compare {
                op,
                sig: binary(ValueTypes::BOOL),
            });
        }
        registry.register(group);
    }
    for (name, op) in [("and", Logic::And), ("or", Logic::Or)] {
        registry.register(OperGroup::new(name, eager()).with(Logical {
            op,
            sig: binary(ValueTypes::BOOL),
        }));
    }
    registry.register(OperGroup::new("not", eager()).with(Logical {
        op: Logic::Not,
        sig: Signature::fixed(vec![ArgClass::Data(ValueTypes::BOOL)]),
    }));
    registry.register(OperGroup::new("neg", eager()).with(Negate {
        sig: Signature::fixed(vec![ArgClass::Data(ValueTypes::SIGNED)]),
    }));
    registry.register(OperGroup::new("iif", eager()).with(Iif {
        sig: Signature::fixed(vec![
            ArgClass::Data(ValueTypes::BOOL),
            ArgClass::Data(ValueTypes::ALL),
            ArgClass::Data(ValueTypes::ALL),
        ]),
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suspend::NoSuspend;

    #[test]
    fn integer_arithmetic_is_checked() {
        assert_eq!(Arith::div(7u32, 0), u32::UNDEFINED);
        assert_eq!(Arith::add(u16::MAX - 1, 5), u16::UNDEFINED);
        assert_eq!(Arith::sub(3i32, i32::UNDEFINED), i32::UNDEFINED);
        assert_eq!(Arith::pow(2i64, 10), 1024);
        assert!(Arith::div(1.0f64, 0.0).is_nan());
    }

    #[test]
    fn common_types() {
        assert_eq!(common_type(ValueType::UInt16, ValueType::UInt32), ValueType::UInt32);
        assert_eq!(common_type(ValueType::UInt32, ValueType::Int32), ValueType::Int64);
        assert_eq!(common_type(ValueType::Int32, ValueType::Float64), ValueType::Float64);
    }

    #[test]
    fn binop_broadcasts_parameters() {
        let a = Column::Float64(vec![1.0, 2.0, 3.0]);
        let b = Column::UInt32(vec![2]);
        let out = numeric_binop(BinOp::Mul, &a, &b, ValueType::Float64, 2, &NoSuspend).unwrap();
        assert_eq!(out, Column::Float64(vec![2.0, 4.0, 6.0]));
    }

    #[test]
    fn comparisons_treat_undefined_as_unequal() {
        let cmp = Compare {
            op: CmpOp::Eq,
            sig: binary(ValueTypes::ORDERED),
        };
        let shape = Shape {
            value_type: ValueType::Bool,
            arg_lens: vec![2, 1],
            chunk: 16,
        };
        let a = Column::Int32(vec![5, i32::UNDEFINED]);
        let b = Column::Int32(vec![5]);
        let out = cmp.calc_data(&[&a, &b], &shape, &NoSuspend).unwrap();
        assert_eq!(out, Column::Bool(vec![true, false]));
    }
}
