//! Whole-column aggregations yielding a parameter

use super::{
    map_chunks, ArgClass, ArgPolicies, ArgPolicy, ArgRef, CostEstimate, OperContext, OperGroup, OperRegistry,
    Operator, ResultSlot, Shape, Signature,
};
use crate::data::{Column, Undefined};
use crate::error::{CalcError, Flow, Interrupt, Result};
use crate::suspend::Checkpoint;
use treecalc_types::{ValueType, ValueTypes};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Aggr {
    Sum,
    Count,
    NrOfRows,
}

#[derive(Debug)]
struct Aggregate {
    kind: Aggr,
    sig: Signature,
}

fn sum_type(vt: ValueType) -> ValueType {
    match vt {
        ValueType::Float64 => ValueType::Float64,
        _ => ValueType::Int64,
    }
}

/// Sum of the defined elements, polling once per chunk
fn sum_defined<T: Undefined + Into<f64>>(values: &[T], chunk: usize, cp: &dyn Checkpoint) -> Flow<f64> {
    let parts = map_chunks(values.len().div_ceil(chunk.max(1)), 1, cp, |c| {
        let start = c * chunk.max(1);
        let end = (start + chunk.max(1)).min(values.len());
        values[start..end]
            .iter()
            .filter(|v| v.is_defined())
            .map(|v| Into::<f64>::into(*v))
            .sum::<f64>()
    })?;
    Ok(parts.into_iter().sum())
}

fn sum_i64(values: &[i64], chunk: usize, cp: &dyn Checkpoint) -> Flow<i64> {
    let parts = map_chunks(values.len().div_ceil(chunk.max(1)), 1, cp, |c| {
        let start = c * chunk.max(1);
        let end = (start + chunk.max(1)).min(values.len());
        values[start..end]
            .iter()
            .filter(|v| v.is_defined())
            .try_fold(0i64, |acc, v| acc.checked_add(*v))
    })?;
    parts
        .into_iter()
        .try_fold(0i64, |acc, p| p.and_then(|p| acc.checked_add(p)))
        .ok_or_else(|| Interrupt::Failed(CalcError::operator("sum", "integer overflow")))
}

impl Operator for Aggregate {
    fn signature(&self) -> &Signature {
        &self.sig
    }

    fn create_result(&self, ctx: &mut OperContext<'_>, slot: &mut ResultSlot, args: &[ArgRef], _must_calc: bool) -> Result<bool> {
        let vt = match self.kind {
            Aggr::Sum => sum_type(args[0].value_type().unwrap_or(ValueType::Float64)),
            Aggr::Count | Aggr::NrOfRows => ValueType::UInt32,
        };
        slot.result = Some(ctx.new_data_result(vt, None, None));
        Ok(false)
    }

    fn calc_data(&self, inputs: &[&Column], shape: &Shape, cp: &dyn Checkpoint) -> Flow<Column> {
        let input = inputs[0];
        match self.kind {
            Aggr::NrOfRows => {
                let n = shape.arg_lens.first().copied().unwrap_or(input.len());
                Ok(Column::UInt32(vec![u32::try_from(n).unwrap_or(u32::UNDEFINED)]))
            }
            Aggr::Count => {
                let defined = map_chunks(input.len(), shape.chunk, cp, |i| {
                    input.get(i).is_some_and(|v| v.is_defined())
                })?;
                let n = defined.into_iter().filter(|d| *d).count();
                Ok(Column::UInt32(vec![u32::try_from(n).unwrap_or(u32::UNDEFINED)]))
            }
            Aggr::Sum => Ok(match input {
                Column::UInt16(v) => Column::Int64(vec![sum_defined(v, shape.chunk, cp)? as i64]),
                Column::UInt32(v) => Column::Int64(vec![sum_defined(v, shape.chunk, cp)? as i64]),
                Column::Int32(v) => Column::Int64(vec![sum_defined(v, shape.chunk, cp)? as i64]),
                Column::Int64(v) => Column::Int64(vec![sum_i64(v, shape.chunk, cp)?]),
                Column::Float64(v) => Column::Float64(vec![sum_defined(v, shape.chunk, cp)?]),
                other => {
                    return Err(Interrupt::Failed(CalcError::operator(
                        "sum",
                        format!("not defined for {}", other.value_type()),
                    )))
                }
            }),
        }
    }

    fn estimate(&self, _elements: u64, value_type: ValueType) -> Option<CostEstimate> {
        Some(CostEstimate {
            elements: 1,
            bytes: value_type.byte_width(),
        })
    }
}

pub(super) fn register(registry: &mut OperRegistry) {
    let eager = || ArgPolicies::Fixed(vec![ArgPolicy::Eager]);
    registry.register(OperGroup::new("sum", eager()).with(Aggregate {
        kind: Aggr::Sum,
        sig: Signature::fixed(vec![ArgClass::Data(ValueTypes::NUMERIC)]),
    }));
    registry.register(OperGroup::new("count", eager()).with(Aggregate {
        kind: Aggr::Count,
        sig: Signature::fixed(vec![ArgClass::Data(ValueTypes::ALL)]),
    }));
    registry.register(
        OperGroup::new("NrOfRows", eager())
            .with(Aggregate {
                kind: Aggr::NrOfRows,
                sig: Signature::fixed(vec![ArgClass::Data(ValueTypes::ALL)]),
            })
            .with(Aggregate {
                kind: Aggr::NrOfRows,
                sig: Signature::fixed(vec![ArgClass::Unit(ValueTypes::ALL)]),
            }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suspend::NoSuspend;

    fn shape(lens: Vec<usize>) -> Shape {
        Shape {
            value_type: ValueType::Int64,
            arg_lens: lens,
            chunk: 2,
        }
    }

    #[test]
    fn sum_skips_undefined() {
        let op = Aggregate {
            kind: Aggr::Sum,
            sig: Signature::fixed(vec![]),
        };
        let input = Column::UInt32(vec![1, 2, u32::UNDEFINED, 4, 5]);
        assert_eq!(
            op.calc_data(&[&input], &shape(vec![5]), &NoSuspend).unwrap(),
            Column::Int64(vec![12])
        );
        let floats = Column::Float64(vec![0.5, f64::NAN, 1.0]);
        assert_eq!(
            op.calc_data(&[&floats], &shape(vec![3]), &NoSuspend).unwrap(),
            Column::Float64(vec![1.5])
        );
    }

    #[test]
    fn count_and_rows() {
        let count = Aggregate {
            kind: Aggr::Count,
            sig: Signature::fixed(vec![]),
        };
        let rows = Aggregate {
            kind: Aggr::NrOfRows,
            sig: Signature::fixed(vec![]),
        };
        let input = Column::Int32(vec![1, i32::UNDEFINED, 3]);
        assert_eq!(
            count.calc_data(&[&input], &shape(vec![3]), &NoSuspend).unwrap(),
            Column::UInt32(vec![2])
        );
        let empty_unit = Column::UInt32(vec![]);
        assert_eq!(
            rows.calc_data(&[&empty_unit], &shape(vec![7]), &NoSuspend).unwrap(),
            Column::UInt32(vec![7])
        );
    }
}
