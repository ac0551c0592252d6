//! Operator registry
//!
//! An [`OperGroup`] is a named operation with per-argument evaluation
//! policies and a list of overloads. Overload resolution matches the
//! argument classes of the substituted arguments against each operator's
//! [`Signature`] in registration order.

mod aggr;
mod arith;
mod choose;
mod convert;
mod lookup;
mod meta;

use crate::controller::DcId;
use crate::data::{Column, Value};
use crate::error::{CalcError, Flow, Interrupt, Result};
use crate::session::Session;
use crate::suspend::Checkpoint;
use crate::tree::{DataMeta, NodeFlags, NodeId, NodeKind, UnitInfo};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use treecalc_expr::Symbol;
use treecalc_types::{ValueType, ValueTypes};

/// How an argument is treated during substitution and computation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgPolicy {
    /// Substitute and compute before the operator runs
    Eager,
    /// Pass a reference, never compute
    Never,
    /// Substitute, compute only as (part of) the final result
    AsResult,
    /// Reference to a template, allowed to point inside it
    Template,
}

/// Memo partition of the substitution buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyClass {
    /// Substituted arguments
    Subst,
    /// References
    Never,
    /// Template references
    Tree,
}

impl ArgPolicy {
    /// Memo partition used for arguments under this policy
    pub fn class(self) -> PolicyClass {
        match self {
            ArgPolicy::Eager | ArgPolicy::AsResult => PolicyClass::Subst,
            ArgPolicy::Never => PolicyClass::Never,
            ArgPolicy::Template => PolicyClass::Tree,
        }
    }

    /// Does the argument get a controller?
    pub fn is_computed(self) -> bool {
        matches!(self, ArgPolicy::Eager | ArgPolicy::AsResult)
    }
}

/// Argument policies of a group
#[derive(Clone)]
pub enum ArgPolicies {
    /// Per position; the last entry repeats
    Fixed(Vec<ArgPolicy>),
    /// Decided from the value of argument 0, which is always `Eager`
    Dynamic(fn(usize, Option<&Value>) -> ArgPolicy),
}

impl ArgPolicies {
    /// Decided from argument 0?
    pub fn is_dynamic(&self) -> bool {
        matches!(self, ArgPolicies::Dynamic(_))
    }

    /// Policy of argument `index`; `first` is the value of argument 0 when known
    pub fn policy(&self, index: usize, first: Option<&Value>) -> ArgPolicy {
        match self {
            ArgPolicies::Fixed(list) => list
                .get(index)
                .or_else(|| list.last())
                .copied()
                .unwrap_or(ArgPolicy::Eager),
            ArgPolicies::Dynamic(f) => {
                if index == 0 {
                    ArgPolicy::Eager
                } else {
                    f(index, first)
                }
            }
        }
    }
}

impl fmt::Debug for ArgPolicies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgPolicies::Fixed(list) => f.debug_tuple("Fixed").field(list).finish(),
            ArgPolicies::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// Accepted kind of one argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgClass {
    /// Data item or parameter with one of the value types
    Data(ValueTypes),
    /// Parameter (single value) with one of the value types
    Param(ValueTypes),
    /// Unit whose elements have one of the value types
    Unit(ValueTypes),
    /// Any tree item, passed by reference
    Item,
    /// A template item
    Template,
    /// Anything, expressions included
    Any,
}

/// Argument classes an operator accepts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    /// One class per position
    pub args: Vec<ArgClass>,
    /// The last class repeats for any further arguments
    pub variadic: bool,
}

impl Signature {
    /// Exactly these arguments
    pub fn fixed(args: Vec<ArgClass>) -> Self {
        Self { args, variadic: false }
    }

    /// These arguments, the last one repeating
    pub fn variadic(args: Vec<ArgClass>) -> Self {
        Self { args, variadic: true }
    }

    /// Do `args` match position by position?
    pub fn accepts(&self, args: &[ArgRef]) -> bool {
        if args.len() < self.args.len() || (!self.variadic && args.len() != self.args.len()) {
            return false;
        }
        args.iter().enumerate().all(|(i, arg)| {
            let class = self.args.get(i).or_else(|| self.args.last());
            class.is_some_and(|c| arg.matches(*c))
        })
    }
}

/// An argument as seen by overload resolution and result construction
#[derive(Debug, Clone)]
pub enum ArgRef {
    /// Data item or parameter
    Data {
        /// The item
        node: NodeId,
        /// Its typing
        meta: DataMeta,
        /// Controller computing it, if any
        dc: Option<DcId>,
    },
    /// Unit
    Unit {
        /// The unit
        node: NodeId,
        /// Its description
        info: UnitInfo,
        /// Controller computing it, if any
        dc: Option<DcId>,
    },
    /// Other item, taken by reference
    Item {
        /// The item
        node: NodeId,
        /// Marked as a template?
        is_template: bool,
    },
    /// Unresolved expression, for `Never` arguments
    Expr(treecalc_expr::Expr),
}

impl ArgRef {
    /// Referenced item; `None` for expressions
    pub fn node(&self) -> Option<NodeId> {
        match self {
            ArgRef::Data { node, .. } | ArgRef::Unit { node, .. } | ArgRef::Item { node, .. } => Some(*node),
            ArgRef::Expr(_) => None,
        }
    }

    /// Controller of a computed argument
    pub fn dc(&self) -> Option<DcId> {
        match self {
            ArgRef::Data { dc, .. } | ArgRef::Unit { dc, .. } => *dc,
            _ => None,
        }
    }

    /// Element type of data and units
    pub fn value_type(&self) -> Option<ValueType> {
        match self {
            ArgRef::Data { meta, .. } => meta.value_type,
            ArgRef::Unit { info, .. } => Some(info.value_type),
            _ => None,
        }
    }

    /// A data item without a domain?
    pub fn is_param(&self) -> bool {
        matches!(self, ArgRef::Data { meta, .. } if meta.domain.is_none())
    }

    fn matches(&self, class: ArgClass) -> bool {
        match (class, self) {
            (ArgClass::Any, _) => true,
            (ArgClass::Data(types), ArgRef::Data { meta, .. }) => {
                meta.value_type.is_some_and(|vt| types.contains(vt))
            }
            (ArgClass::Param(types), ArgRef::Data { meta, .. }) => {
                meta.domain.is_none() && meta.value_type.is_some_and(|vt| types.contains(vt))
            }
            (ArgClass::Unit(types), ArgRef::Unit { info, .. }) => types.contains(info.value_type),
            (ArgClass::Item, arg) => arg.node().is_some(),
            (ArgClass::Template, ArgRef::Item { is_template, .. }) => *is_template,
            _ => false,
        }
    }

    fn describe(&self) -> String {
        match self {
            ArgRef::Data { meta, .. } => {
                let vt = meta.value_type.map(|t| t.name()).unwrap_or("?");
                if meta.domain.is_none() {
                    format!("Param<{}>", vt)
                } else {
                    format!("Data<{}>", vt)
                }
            }
            ArgRef::Unit { info, .. } => format!("Unit<{}>", info.value_type),
            ArgRef::Item { is_template: true, .. } => "Template".to_string(),
            ArgRef::Item { .. } => "Item".to_string(),
            ArgRef::Expr(_) => "Expr".to_string(),
        }
    }
}

/// Element type and lengths handed to a data computation
#[derive(Debug, Clone)]
pub struct Shape {
    /// Type of the result elements
    pub value_type: ValueType,
    /// Element count of each computed argument, in argument order
    pub arg_lens: Vec<usize>,
    /// Elements processed between two suspension checkpoints
    pub chunk: usize,
}

/// Size of a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CostEstimate {
    /// Element count
    pub elements: u64,
    /// Approximate payload size
    pub bytes: u64,
}

/// Where an operator places what it builds
#[derive(Debug, Default)]
pub struct ResultSlot {
    /// Node whose rule is being applied (meta functions)
    pub holder: Option<NodeId>,
    /// Placeholder result with type and shape
    pub result: Option<NodeId>,
}

/// One overload of an [`OperGroup`]
///
/// Operators are shared with worker threads; `calc_data` must not touch
/// the session.
pub trait Operator: Send + Sync + fmt::Debug {
    /// Accepted arguments
    fn signature(&self) -> &Signature;

    /// Build the result node (meta info). Returns true when the data is
    /// already complete.
    fn create_result(
        &self,
        ctx: &mut OperContext<'_>,
        slot: &mut ResultSlot,
        args: &[ArgRef],
        must_calc: bool,
    ) -> Result<bool>;

    /// Compute the values from the computed arguments' payloads
    fn calc_data(&self, _inputs: &[&Column], _shape: &Shape, _cp: &dyn Checkpoint) -> Flow<Column> {
        Err(Interrupt::Failed(CalcError::IllegalExpression {
            message: "operator produces no data".to_string(),
        }))
    }

    /// Cost of the result without computing it; `None` uses the element
    /// count of the result times its value width
    fn estimate(&self, _elements: u64, _value_type: ValueType) -> Option<CostEstimate> {
        None
    }
}

/// A named operation with its overloads
#[derive(Debug)]
pub struct OperGroup {
    /// Name used in rules
    pub name: Symbol,
    /// Deferred to a DataController; false for meta functions
    pub must_cache_result: bool,
    /// How each argument is substituted
    pub policies: ArgPolicies,
    /// Overloads, tried in order
    pub operators: Vec<Arc<dyn Operator>>,
}

impl OperGroup {
    /// Group whose results are cached in controllers
    pub fn new(name: &str, policies: ArgPolicies) -> Self {
        Self {
            name: Symbol::intern(name),
            must_cache_result: true,
            policies,
            operators: Vec::new(),
        }
    }

    /// Group that generates child items of the calling node
    pub fn meta_function(name: &str, policies: ArgPolicies) -> Self {
        Self {
            must_cache_result: false,
            ..Self::new(name, policies)
        }
    }

    /// Append an overload
    pub fn with(mut self, oper: impl Operator + 'static) -> Self {
        self.operators.push(Arc::new(oper));
        self
    }

    /// Does it generate items instead of a cached result?
    pub fn is_meta_function(&self) -> bool {
        !self.must_cache_result
    }

    /// First overload accepting `args`
    pub fn find_oper_by_args(&self, args: &[ArgRef]) -> Result<Arc<dyn Operator>> {
        self.operators
            .iter()
            .find(|op| op.signature().accepts(args))
            .cloned()
            .ok_or_else(|| CalcError::NoOverload {
                operator: self.name.to_string(),
                args: args.iter().map(ArgRef::describe).collect::<Vec<_>>().join(", "),
            })
    }
}

/// Operation groups by name
#[derive(Debug, Default)]
pub struct OperRegistry {
    groups: HashMap<Symbol, Arc<OperGroup>>,
}

impl OperRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the arithmetic, conversion, aggregation, lookup and
    /// meta function groups
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        arith::register(&mut registry);
        convert::register(&mut registry);
        aggr::register(&mut registry);
        lookup::register(&mut registry);
        choose::register(&mut registry);
        meta::register(&mut registry);
        registry
    }

    /// Add `group`, replacing one of the same name
    pub fn register(&mut self, group: OperGroup) {
        self.groups.insert(group.name, Arc::new(group));
    }

    /// Group called `name`
    pub fn get(&self, name: Symbol) -> Option<Arc<OperGroup>> {
        self.groups.get(&name).cloned()
    }

    /// Number of groups
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// No groups?
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Session access for result construction
pub struct OperContext<'a> {
    pub(crate) session: &'a mut Session,
    pub(crate) dc: Option<DcId>,
}

impl fmt::Debug for OperContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperContext").field("dc", &self.dc).finish()
    }
}

impl<'a> OperContext<'a> {
    /// Context of the controller `dc`, or of an ad hoc call
    pub fn new(session: &'a mut Session, dc: Option<DcId>) -> Self {
        Self { session, dc }
    }

    /// Read access to the session
    pub fn session(&self) -> &Session {
        self.session
    }

    /// Cache-owned data node typed `value_type`
    pub fn new_data_result(
        &mut self,
        value_type: ValueType,
        domain: Option<NodeId>,
        values: Option<NodeId>,
    ) -> NodeId {
        let name = match self.dc {
            Some(dc) => format!("#dc{}", dc.index()),
            None => "#result".to_string(),
        };
        let kind = NodeKind::Data(DataMeta {
            value_type: Some(value_type),
            domain,
            values,
        });
        let node = self.session.tree.create_root(&name, kind);
        let now = self.session.now;
        let data = self.session.tree.node_mut(node);
        data.flags = NodeFlags {
            cache_item: true,
            ..NodeFlags::default()
        };
        data.meta_changed = now;
        data.data_changed = now;
        node
    }

    /// Domain of a parameter typed `vt`
    pub fn default_unit(&self, vt: ValueType) -> NodeId {
        self.session.tree.default_unit(vt)
    }

    /// Domain shared by the non-parameter arguments
    pub fn common_domain(&self, operator: Symbol, args: &[ArgRef]) -> Result<Option<NodeId>> {
        let mut domain = None;
        for arg in args {
            if let ArgRef::Data {
                meta: DataMeta { domain: Some(d), .. },
                ..
            } = arg
            {
                match domain {
                    None => domain = Some(*d),
                    Some(prev) if prev == *d => {}
                    Some(prev) => {
                        return Err(CalcError::operator(
                            operator,
                            format!(
                                "arguments have different domains {} and {}",
                                self.session.tree.full_name(prev),
                                self.session.tree.full_name(*d)
                            ),
                        ))
                    }
                }
            }
        }
        Ok(domain)
    }

    /// Value of a single-valued argument, computed now
    pub fn read_scalar(&mut self, arg: &ArgRef) -> Result<Value> {
        let dc = arg.dc().ok_or_else(|| CalcError::IllegalExpression {
            message: "argument is not a computed value".to_string(),
        })?;
        let column = self.session.calc_dc_certain(dc)?;
        column
            .and_then(|c| c.get(0))
            .ok_or_else(|| CalcError::Undefined {
                what: "argument has no value".to_string(),
            })
    }

    /// Endogenous child of `parent` with a calculation rule
    pub fn create_child(&mut self, parent: NodeId, name: &str, expr: &str) -> NodeId {
        self.create_generated(parent, name, NodeKind::Container, expr)
    }

    /// Endogenous data item below `parent` computed by `expr`
    pub fn create_data_child(&mut self, parent: NodeId, name: &str, meta: DataMeta, expr: &str) -> NodeId {
        self.create_generated(parent, name, NodeKind::Data(meta), expr)
    }

    fn create_generated(&mut self, parent: NodeId, name: &str, kind: NodeKind, expr: &str) -> NodeId {
        let now = self.session.now;
        let child = self.session.tree.create_item(parent, name, kind, now);
        let data = self.session.tree.node_mut(child);
        data.expr = Some(expr.to_string());
        data.flags.endogenous = true;
        data.compiled = None;
        data.meta_changed = now;
        child
    }

    /// Name of a referenced item relative to `holder`'s parent, for use in
    /// generated rules
    pub fn reference_name(&self, node: NodeId) -> String {
        self.session.tree.full_name(node)
    }
}

/// Result length of an element-wise operation over inputs of these lengths
pub(crate) fn broadcast_len(operator: &str, lens: &[usize]) -> Flow<usize> {
    let mut len = None;
    for &n in lens {
        if n == 1 {
            continue;
        }
        match len {
            None => len = Some(n),
            Some(prev) if prev == n => {}
            Some(prev) => {
                return Err(Interrupt::Failed(CalcError::operator(
                    operator,
                    format!("lengths {} and {} do not match", prev, n),
                )))
            }
        }
    }
    Ok(len.unwrap_or(if lens.is_empty() { 0 } else { 1 }))
}

/// Index into an input that may be a broadcast single value
#[inline]
pub(crate) fn at(len: usize, i: usize) -> usize {
    if len == 1 {
        0
    } else {
        i
    }
}

/// Produce `len` elements, polling `cp` once per chunk
pub(crate) fn map_chunks<R>(
    len: usize,
    chunk: usize,
    cp: &dyn Checkpoint,
    mut f: impl FnMut(usize) -> R,
) -> Flow<Vec<R>> {
    let chunk = chunk.max(1);
    let mut out = Vec::with_capacity(len);
    let mut start = 0;
    while start < len {
        if cp.must_suspend() {
            return Err(Interrupt::Suspended);
        }
        let end = (start + chunk).min(len);
        out.extend((start..end).map(&mut f));
        start = end;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suspend::{suspend_first, NoSuspend, SuspendTrigger};

    #[test]
    fn fixed_policies_repeat_last() {
        let p = ArgPolicies::Fixed(vec![ArgPolicy::Template, ArgPolicy::Eager]);
        assert_eq!(p.policy(0, None), ArgPolicy::Template);
        assert_eq!(p.policy(5, None), ArgPolicy::Eager);
        assert_eq!(ArgPolicy::Never.class(), PolicyClass::Never);
    }

    #[test]
    fn broadcasting_rules() {
        assert_eq!(broadcast_len("add", &[1, 4]).unwrap(), 4);
        assert_eq!(broadcast_len("add", &[1, 1]).unwrap(), 1);
        assert!(broadcast_len("add", &[3, 4]).is_err());
    }

    #[test]
    fn chunks_poll_the_checkpoint() {
        let out = map_chunks(10, 3, &NoSuspend, |i| i * 2).unwrap();
        assert_eq!(out.len(), 10);
        assert_eq!(out[9], 18);

        let trigger = SuspendTrigger::new();
        trigger.install_trigger(suspend_first(1));
        trigger.mark_progress();
        assert_eq!(map_chunks(10, 3, &trigger, |i| i), Err(Interrupt::Suspended));
    }

    #[test]
    fn builtins_are_registered() {
        let registry = OperRegistry::with_builtins();
        let add = registry.get(Symbol::intern("add")).unwrap();
        assert!(add.must_cache_result);
        let lp = registry.get(Symbol::intern("loop")).unwrap();
        assert!(lp.is_meta_function());
        assert!(registry.get(Symbol::intern("choose")).unwrap().policies.is_dynamic());
    }
}
