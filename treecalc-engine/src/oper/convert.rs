//! Conversions named after the value types: `UInt16(x)`, `Float64(x)`, ...

use super::{
    arith::elementwise_result, ArgClass, ArgPolicies, ArgPolicy, ArgRef, OperContext, OperGroup, OperRegistry,
    Operator, ResultSlot, Shape, Signature,
};
use crate::data::Column;
use crate::error::{Flow, Result};
use crate::suspend::Checkpoint;
use treecalc_expr::Symbol;
use treecalc_types::{ValueType, ValueTypes};

#[derive(Debug)]
struct Convert {
    target: ValueType,
    sig: Signature,
}

impl Operator for Convert {
    fn signature(&self) -> &Signature {
        &self.sig
    }

    fn create_result(&self, ctx: &mut OperContext<'_>, slot: &mut ResultSlot, args: &[ArgRef], _must_calc: bool) -> Result<bool> {
        elementwise_result(ctx, slot, Symbol::intern(self.target.name()), args, self.target)
    }

    fn calc_data(&self, inputs: &[&Column], shape: &Shape, cp: &dyn Checkpoint) -> Flow<Column> {
        inputs[0].cast(self.target, shape.chunk, cp)
    }
}

pub(super) fn register(registry: &mut OperRegistry) {
    for target in ValueType::ALL {
        registry.register(
            OperGroup::new(target.name(), ArgPolicies::Fixed(vec![ArgPolicy::Eager])).with(Convert {
                target,
                sig: Signature::fixed(vec![ArgClass::Data(ValueTypes::ALL)]),
            }),
        );
    }
}
