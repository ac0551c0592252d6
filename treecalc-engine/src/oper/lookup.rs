//! Index operations: `id(unit)` and `lookup(index, attribute)`, the latter
//! produced by arrow substitution

use super::{
    map_chunks, ArgClass, ArgPolicies, ArgPolicy, ArgRef, OperContext, OperGroup, OperRegistry, Operator,
    ResultSlot, Shape, Signature,
};
use crate::data::{Column, FromF64, Undefined};
use crate::error::{CalcError, Flow, Interrupt, Result};
use crate::suspend::Checkpoint;
use treecalc_types::{ValueType, ValueTypes};

#[derive(Debug)]
struct Id {
    sig: Signature,
}

impl Operator for Id {
    fn signature(&self) -> &Signature {
        &self.sig
    }

    fn create_result(&self, ctx: &mut OperContext<'_>, slot: &mut ResultSlot, args: &[ArgRef], _must_calc: bool) -> Result<bool> {
        let ArgRef::Unit { node, info, .. } = &args[0] else {
            return Err(CalcError::operator("id", "argument is not a unit"));
        };
        slot.result = Some(ctx.new_data_result(info.value_type, Some(*node), Some(*node)));
        Ok(false)
    }

    fn calc_data(&self, _inputs: &[&Column], shape: &Shape, cp: &dyn Checkpoint) -> Flow<Column> {
        let n = shape.arg_lens.first().copied().unwrap_or(0);
        let ids = map_chunks(n, shape.chunk, cp, |i| i as f64)?;
        Ok(match shape.value_type {
            ValueType::UInt16 => Column::UInt16(ids.into_iter().map(u16::from_f64).collect()),
            ValueType::UInt32 => Column::UInt32(ids.into_iter().map(u32::from_f64).collect()),
            ValueType::Int32 => Column::Int32(ids.into_iter().map(i32::from_f64).collect()),
            ValueType::Int64 => Column::Int64(ids.into_iter().map(i64::from_f64).collect()),
            other => {
                return Err(Interrupt::Failed(CalcError::operator(
                    "id",
                    format!("not defined for {}", other),
                )))
            }
        })
    }
}

#[derive(Debug)]
struct Lookup {
    sig: Signature,
}

impl Operator for Lookup {
    fn signature(&self) -> &Signature {
        &self.sig
    }

    fn create_result(&self, ctx: &mut OperContext<'_>, slot: &mut ResultSlot, args: &[ArgRef], _must_calc: bool) -> Result<bool> {
        let (ArgRef::Data { meta: index, .. }, ArgRef::Data { meta: attr, .. }) = (&args[0], &args[1]) else {
            return Err(CalcError::operator("lookup", "arguments must be data items"));
        };
        if attr.domain.is_some() && attr.domain != index.values {
            let tree = &ctx.session().tree;
            let name = |n: Option<_>| n.map(|n| tree.full_name(n)).unwrap_or_else(|| "none".to_string());
            return Err(CalcError::operator(
                "lookup",
                format!(
                    "index refers to {} but the attribute is defined on {}",
                    name(index.values),
                    name(attr.domain)
                ),
            ));
        }
        let vt = attr.value_type.unwrap_or(ValueType::Float64);
        slot.result = Some(ctx.new_data_result(vt, index.domain, attr.values));
        Ok(false)
    }

    fn calc_data(&self, inputs: &[&Column], shape: &Shape, cp: &dyn Checkpoint) -> Flow<Column> {
        let (index, attr) = (inputs[0], inputs[1]);
        let positions = map_chunks(index.len(), shape.chunk, cp, |i| {
            index
                .f64_at(i)
                .filter(|p| *p >= 0.0 && (*p as usize) < attr.len())
                .map(|p| p as usize)
        })?;
        macro_rules! gather {
            ($variant:ident, $undef:expr) => {
                match attr {
                    Column::$variant(values) => Column::$variant(
                        positions
                            .iter()
                            .map(|p| p.map(|p| values[p].clone()).unwrap_or($undef))
                            .collect(),
                    ),
                    _ => unreachable_type(attr)?,
                }
            };
        }
        Ok(match attr.value_type() {
            ValueType::Bool => gather!(Bool, false),
            ValueType::UInt16 => gather!(UInt16, u16::UNDEFINED),
            ValueType::UInt32 => gather!(UInt32, u32::UNDEFINED),
            ValueType::Int32 => gather!(Int32, i32::UNDEFINED),
            ValueType::Int64 => gather!(Int64, i64::UNDEFINED),
            ValueType::Float64 => gather!(Float64, f64::UNDEFINED),
            ValueType::String => gather!(String, String::new()),
        })
    }
}

fn unreachable_type(attr: &Column) -> Flow<Column> {
    Err(Interrupt::Failed(CalcError::operator(
        "lookup",
        format!("unexpected payload {}", attr.value_type()),
    )))
}

pub(super) fn register(registry: &mut OperRegistry) {
    let eager = || ArgPolicies::Fixed(vec![ArgPolicy::Eager]);
    registry.register(OperGroup::new("id", eager()).with(Id {
        sig: Signature::fixed(vec![ArgClass::Unit(ValueTypes::INTEGER)]),
    }));
    registry.register(OperGroup::new("lookup", eager()).with(Lookup {
        sig: Signature::fixed(vec![
            ArgClass::Data(ValueTypes::INTEGER),
            ArgClass::Data(ValueTypes::ALL),
        ]),
    }));
}
