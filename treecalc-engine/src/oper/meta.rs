//! Meta functions: applied while the holder's rule is compiled, they unroll
//! into generated child items instead of producing data.

use super::{
    ArgClass, ArgPolicies, ArgPolicy, ArgRef, OperContext, OperGroup, OperRegistry, Operator, ResultSlot,
    Signature,
};
use crate::data::{Column, Value};
use crate::error::{CalcError, Result};
use crate::tree::DataMeta;
use tracing::debug;
use treecalc_types::ValueTypes;

/// Upper bound on generated iterations
const MAX_ITERATIONS: u64 = u16::MAX as u64;

fn holder(slot: &ResultSlot, name: &str) -> Result<crate::tree::NodeId> {
    slot.holder
        .ok_or_else(|| CalcError::operator(name, "meta function applied without a holder"))
}

fn template_name(ctx: &OperContext<'_>, arg: &ArgRef, name: &str) -> Result<String> {
    arg.node()
        .map(|n| ctx.reference_name(n))
        .ok_or_else(|| CalcError::operator(name, "expected a template"))
}

/// Elements of a computed string argument
fn strings(ctx: &mut OperContext<'_>, arg: &ArgRef, name: &str) -> Result<Vec<String>> {
    let dc = arg
        .dc()
        .ok_or_else(|| CalcError::operator(name, "expected computed strings"))?;
    match ctx.session.calc_dc_certain(dc)?.as_deref() {
        Some(Column::String(values)) => Ok(values.clone()),
        _ => Err(CalcError::operator(name, "expected strings")),
    }
}

/// `loop(template, n)`: `iter0 .. iter{n-1}` where iteration `i` instantiates
/// the template with `UInt16(i)` and the previous iteration's `nextValue`,
/// plus `lastIter` referring to the final iteration
#[derive(Debug)]
struct Loop {
    sig: Signature,
}

impl Operator for Loop {
    fn signature(&self) -> &Signature {
        &self.sig
    }

    fn create_result(&self, ctx: &mut OperContext<'_>, slot: &mut ResultSlot, args: &[ArgRef], _must_calc: bool) -> Result<bool> {
        let holder = holder(slot, "loop")?;
        let template = template_name(ctx, &args[0], "loop")?;
        let n = ctx
            .read_scalar(&args[1])?
            .as_u64()
            .ok_or_else(|| CalcError::Undefined {
                what: "Nr iterations is undefined".to_string(),
            })?;
        if n > MAX_ITERATIONS {
            return Err(CalcError::operator(
                "loop",
                format!("{} iterations exceed the limit of {}", n, MAX_ITERATIONS),
            ));
        }
        for i in 0..n {
            let expr = if i == 0 {
                format!("{}(UInt16({}))", template, i)
            } else {
                format!("{}(UInt16({}), iter{}/nextValue)", template, i, i - 1)
            };
            ctx.create_child(holder, &format!("iter{}", i), &expr);
        }
        let last = if n == 0 { String::new() } else { format!("iter{}", n - 1) };
        ctx.create_child(holder, "lastIter", &last);
        debug!(holder = %ctx.reference_name(holder), iterations = n, "loop unrolled");
        slot.result = Some(holder);
        Ok(true)
    }
}

/// `iterate(names, template, init)`: one child per element of `names`, each
/// instantiating the template on the previous child's `nextValue`. The
/// first child gets the rule text held by `init`; `lastValue` refers to the
/// final `nextValue`.
#[derive(Debug)]
struct Iterate {
    sig: Signature,
}

impl Operator for Iterate {
    fn signature(&self) -> &Signature {
        &self.sig
    }

    fn create_result(&self, ctx: &mut OperContext<'_>, slot: &mut ResultSlot, args: &[ArgRef], _must_calc: bool) -> Result<bool> {
        let holder = holder(slot, "iterate")?;
        let template = template_name(ctx, &args[1], "iterate")?;
        let names = strings(ctx, &args[0], "iterate")?;
        let mut current = match ctx.read_scalar(&args[2])? {
            Value::String(text) if !text.trim().is_empty() => text,
            _ => return Err(CalcError::operator("iterate", "initial value must be a rule text")),
        };
        for name in &names {
            if name.is_empty() {
                return Err(CalcError::operator("iterate", "iteration names cannot be empty"));
            }
            ctx.create_child(holder, name, &format!("{}({})", template, current));
            current = format!("{}/nextValue", name);
        }
        ctx.create_child(holder, "lastValue", &current);
        debug!(holder = %ctx.reference_name(holder), steps = names.len(), "iteration unrolled");
        slot.result = Some(holder);
        Ok(true)
    }
}

/// `for_each_ne(names, exprs)` and `for_each_nedv(names, exprs, domain,
/// values)`: one generated item per non-empty name, computed by the
/// expression at the same position. A single expression applies to every
/// name.
#[derive(Debug)]
struct ForEach {
    sig: Signature,
    name: &'static str,
    /// Generated items are data items of the given domain and values unit
    typed: bool,
}

impl ForEach {
    fn item_meta(&self, args: &[ArgRef]) -> Result<Option<DataMeta>> {
        if !self.typed {
            return Ok(None);
        }
        let unit = |i: usize, role: &str| {
            args[i]
                .node()
                .ok_or_else(|| CalcError::operator(self.name, format!("{} unit expected", role)))
        };
        Ok(Some(DataMeta {
            value_type: args[3].value_type(),
            domain: Some(unit(2, "domain")?),
            values: Some(unit(3, "values")?),
        }))
    }
}

impl Operator for ForEach {
    fn signature(&self) -> &Signature {
        &self.sig
    }

    fn create_result(&self, ctx: &mut OperContext<'_>, slot: &mut ResultSlot, args: &[ArgRef], _must_calc: bool) -> Result<bool> {
        let holder = holder(slot, self.name)?;
        let names = strings(ctx, &args[0], self.name)?;
        let exprs = strings(ctx, &args[1], self.name)?;
        if exprs.len() != 1 && exprs.len() != names.len() {
            return Err(CalcError::operator(
                self.name,
                format!("{} names but {} expressions", names.len(), exprs.len()),
            ));
        }
        let meta = self.item_meta(args)?;
        let mut generated = 0;
        for (i, name) in names.iter().enumerate() {
            if name.is_empty() {
                continue;
            }
            let expr = &exprs[if exprs.len() == 1 { 0 } else { i }];
            match meta {
                Some(meta) => ctx.create_data_child(holder, name, meta, expr),
                None => ctx.create_child(holder, name, expr),
            };
            generated += 1;
        }
        debug!(holder = %ctx.reference_name(holder), function = self.name, generated, "items generated");
        slot.result = Some(holder);
        Ok(true)
    }
}

pub(super) fn register(registry: &mut OperRegistry) {
    registry.register(
        OperGroup::meta_function("loop", ArgPolicies::Fixed(vec![ArgPolicy::Template, ArgPolicy::Eager])).with(
            Loop {
                sig: Signature::fixed(vec![ArgClass::Template, ArgClass::Param(ValueTypes::INTEGER)]),
            },
        ),
    );
    registry.register(
        OperGroup::meta_function(
            "iterate",
            ArgPolicies::Fixed(vec![ArgPolicy::Eager, ArgPolicy::Template, ArgPolicy::Eager]),
        )
        .with(Iterate {
            sig: Signature::fixed(vec![
                ArgClass::Data(ValueTypes::STRING),
                ArgClass::Template,
                ArgClass::Param(ValueTypes::STRING),
            ]),
        }),
    );
    registry.register(
        OperGroup::meta_function("for_each_ne", ArgPolicies::Fixed(vec![ArgPolicy::Eager])).with(ForEach {
            sig: Signature::fixed(vec![ArgClass::Data(ValueTypes::STRING), ArgClass::Data(ValueTypes::STRING)]),
            name: "for_each_ne",
            typed: false,
        }),
    );
    registry.register(
        OperGroup::meta_function(
            "for_each_nedv",
            ArgPolicies::Fixed(vec![ArgPolicy::Eager, ArgPolicy::Eager, ArgPolicy::Never]),
        )
        .with(ForEach {
            sig: Signature::fixed(vec![
                ArgClass::Data(ValueTypes::STRING),
                ArgClass::Data(ValueTypes::STRING),
                ArgClass::Unit(ValueTypes::ALL),
                ArgClass::Unit(ValueTypes::ALL),
            ]),
            name: "for_each_nedv",
            typed: true,
        }),
    );
}
