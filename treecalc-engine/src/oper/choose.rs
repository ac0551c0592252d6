//! `choose(selector, alt0, alt1, ...)`: the selector is computed first and
//! only the selected alternative is substituted for computation.

use super::{
    ArgClass, ArgPolicies, ArgPolicy, ArgRef, OperContext, OperGroup, OperRegistry, Operator, ResultSlot, Shape,
    Signature,
};
use crate::data::{Column, Value};
use crate::error::{CalcError, Flow, Result};
use crate::suspend::Checkpoint;
use treecalc_types::ValueTypes;

pub(crate) fn choose_policy(index: usize, selector: Option<&Value>) -> ArgPolicy {
    match selector.and_then(Value::as_u64) {
        Some(s) if index as u64 == s + 1 => ArgPolicy::AsResult,
        _ => ArgPolicy::Never,
    }
}

#[derive(Debug)]
struct Choose {
    sig: Signature,
}

impl Operator for Choose {
    fn signature(&self) -> &Signature {
        &self.sig
    }

    fn create_result(&self, ctx: &mut OperContext<'_>, slot: &mut ResultSlot, args: &[ArgRef], _must_calc: bool) -> Result<bool> {
        let selector = ctx.read_scalar(&args[0])?;
        let chosen = selector
            .as_u64()
            .and_then(|s| args.get(s as usize + 1))
            .ok_or_else(|| {
                CalcError::operator(
                    "choose",
                    format!("selector {} out of range for {} alternatives", selector, args.len() - 1),
                )
            })?;
        let ArgRef::Data { meta, .. } = chosen else {
            return Err(CalcError::operator("choose", "selected alternative is not a data item"));
        };
        let vt = meta.value_type.unwrap_or(treecalc_types::ValueType::Float64);
        slot.result = Some(ctx.new_data_result(vt, meta.domain, meta.values));
        Ok(false)
    }

    fn calc_data(&self, inputs: &[&Column], _shape: &Shape, _cp: &dyn Checkpoint) -> Flow<Column> {
        Ok(inputs[1].clone())
    }
}

pub(super) fn register(registry: &mut OperRegistry) {
    registry.register(OperGroup::new("choose", ArgPolicies::Dynamic(choose_policy)).with(Choose {
        sig: Signature::variadic(vec![ArgClass::Param(ValueTypes::INTEGER), ArgClass::Any]),
    }));
}
