//! Calculator
//!
//! Compiles the calculation rule of a node into its canonical key: every
//! identifier is resolved in the tree and replaced by the key of the item
//! it names, so two rules that compute the same thing end up with equal
//! keys and share one [`DataController`](crate::controller::DataController).
//!
//! Compilation of a node first orders its uncompiled calculated suppliers
//! with an explicit-stack depth-first pass ([`plan`]) and compiles them
//! leaves first. The substitution itself therefore only ever nests through
//! suppliers it could not see syntactically, and dependency cycles of any
//! length are reported without deep recursion.

mod apply;
mod find;
mod indirect;
mod plan;
mod subst;

pub(crate) use find::Resolved;

use crate::error::{CalcError, FailRecord, Flow, Interrupt};
use crate::oper::PolicyClass;
use crate::session::Session;
use crate::tree::NodeId;
use hashbrown::HashMap;
use std::rc::Rc;
use tracing::{debug, warn};
use treecalc_expr::{parse_expr, symbol, Expr};
use treecalc_types::{FailPhase, Timestamp, ValueType};

/// What compiling a rule produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaInfo {
    /// An expression computed by a DataController
    Key,
    /// A bare reference: the node stands for the target
    Alias(NodeId),
    /// A template call or meta function that generated child items
    Instantiated,
}

/// Compiled calculation rule of a node
#[derive(Debug)]
pub struct Compiled {
    /// How the node relates to its key
    pub info: MetaInfo,
    /// Canonical key of the rule
    pub key: Expr,
    /// Transitive suppliers in order of first occurrence
    pub suppliers: Rc<[NodeId]>,
    /// When the compile ran
    pub at: Timestamp,
    /// Substitution read computed values (indirection, subitem paths,
    /// dynamic argument policies)
    pub data_dependent: bool,
}

/// Ordered, deduplicated supplier list
#[derive(Debug, Clone, Default)]
pub struct SupplierSet {
    order: Vec<NodeId>,
    index: HashMap<NodeId, usize>,
}

impl SupplierSet {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Position of `node`, registering it on first occurrence
    pub fn register(&mut self, node: NodeId) -> usize {
        let next = self.order.len();
        *self.index.entry(node).or_insert_with(|| {
            self.order.push(node);
            next
        })
    }

    /// Register each of `nodes` in order
    pub fn extend(&mut self, nodes: &[NodeId]) {
        for n in nodes {
            self.register(*n);
        }
    }

    /// Already registered?
    pub fn contains(&self, node: NodeId) -> bool {
        self.index.contains_key(&node)
    }

    /// Suppliers in registration order
    pub fn as_slice(&self) -> &[NodeId] {
        &self.order
    }

    /// Number of suppliers
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// No suppliers?
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Suppliers in registration order
    pub fn into_vec(self) -> Vec<NodeId> {
        self.order
    }

    /// Shared form stored in [`Compiled`]
    pub fn into_rc(self) -> Rc<[NodeId]> {
        Rc::from(self.order)
    }
}

/// State of one substitution pass
#[derive(Debug)]
pub(crate) struct SubstitutionBuffer {
    /// Node whose rule is being substituted
    pub holder: NodeId,
    memo: HashMap<(NodeId, PolicyClass, Expr), Expr>,
    /// Nodes read so far
    pub suppliers: SupplierSet,
    /// Where a downstream failure originated
    pub failed_supplier: Option<NodeId>,
    /// Some computed value was read
    pub data_dependent: bool,
}

impl SubstitutionBuffer {
    /// Fresh pass over the rule of `holder`
    pub fn new(holder: NodeId) -> Self {
        Self {
            holder,
            memo: HashMap::new(),
            suppliers: SupplierSet::new(),
            failed_supplier: None,
            data_dependent: false,
        }
    }

    /// Record `node` as a supplier; the holder is never its own supplier
    pub fn register(&mut self, node: NodeId) {
        if node != self.holder {
            self.suppliers.register(node);
        }
    }
}

/// Canonical key and suppliers of an ad hoc substitution
#[derive(Debug, Clone, PartialEq)]
pub struct Substitution {
    /// Canonical key
    pub key: Expr,
    /// Items the key was derived from, in order of first occurrence
    pub suppliers: Vec<NodeId>,
}

impl Session {
    /// `(sourceDescr "/full/name")`
    pub(crate) fn source_key(&self, node: NodeId) -> Expr {
        Expr::call(symbol::SOURCE, vec![Expr::string(&self.tree.full_name(node))])
    }

    /// Where the identifiers of `node`'s rule are looked up
    pub(crate) fn search_context(&self, node: NodeId) -> NodeId {
        self.tree.parent(node).unwrap_or(self.config_root)
    }

    pub(crate) fn circular(&self, node: NodeId) -> Interrupt {
        Interrupt::Failed(CalcError::CircularDependency {
            item: self.tree.full_name(node),
        })
    }

    pub(crate) fn has_meta_fail(&self, node: NodeId) -> bool {
        self.tree
            .get(node)
            .and_then(|n| n.fail.as_ref())
            .is_some_and(|f| f.phase == FailPhase::MetaInfo)
    }

    /// Compile result that is still up to date
    pub(crate) fn valid_compiled(&self, node: NodeId) -> Option<Rc<Compiled>> {
        let n = self.tree.get(node)?;
        if let Some(preset) = &n.preset {
            return Some(Rc::clone(preset));
        }
        let compiled = n.compiled.as_ref()?;
        if compiled.at < n.meta_changed || (compiled.data_dependent && self.data_epoch > compiled.at) {
            return None;
        }
        let suppliers_unchanged = compiled.suppliers.iter().all(|s| {
            self.tree
                .get(*s)
                .is_some_and(|sn| sn.meta_changed <= compiled.at)
        });
        suppliers_unchanged.then(|| Rc::clone(compiled))
    }

    /// Compile `node`'s rule, reusing an up-to-date result
    pub(crate) fn compile(&mut self, node: NodeId) -> Flow<Rc<Compiled>> {
        if let Some(compiled) = self.valid_compiled(node) {
            return Ok(compiled);
        }
        self.live(node)?;
        let n = self.tree.node(node);
        if !n.has_calculator() {
            return Ok(Rc::new(Compiled {
                info: MetaInfo::Key,
                key: self.source_key(node),
                suppliers: Rc::from(Vec::new()),
                at: self.now,
                data_dependent: false,
            }));
        }
        if let Some(fail) = n.fail.as_ref().filter(|f| f.phase == FailPhase::MetaInfo) {
            return Err(Interrupt::Failed(fail.error.clone()));
        }
        if self.compile_stack.contains(&node) {
            return Err(self.circular(node));
        }

        let order = self.plan_compile(node)?;
        for dep in order {
            if !self.tree.contains(dep) || self.valid_compiled(dep).is_some() || self.has_meta_fail(dep) {
                continue;
            }
            // failures are memoized on the dependency and reported by the
            // dependent as downstream failures
            if let Err(Interrupt::Suspended) = self.compile_one(dep) {
                return Err(Interrupt::Suspended);
            }
        }
        if !self.tree.contains(node) {
            return Err(removed_while_compiling());
        }
        self.compile_one(node)
    }

    fn compile_one(&mut self, node: NodeId) -> Flow<Rc<Compiled>> {
        self.compile_stack.push(node);
        let mut buf = SubstitutionBuffer::new(node);
        let result = self.compile_rule(node, &mut buf);
        self.compile_stack.pop();
        if !self.tree.contains(node) {
            return Err(removed_while_compiling());
        }

        match result {
            Ok((info, key)) => {
                self.metrics.record_compilation();
                let now = self.now;
                let compiled = Rc::new(Compiled {
                    info,
                    key,
                    suppliers: buf.suppliers.into_rc(),
                    at: now,
                    data_dependent: buf.data_dependent,
                });
                let n = self.tree.node_mut(node);
                // dependents holding the old key must recompile
                if n.compiled.as_ref().is_some_and(|prev| prev.key != compiled.key) {
                    n.meta_changed = now;
                }
                n.compiled = Some(Rc::clone(&compiled));
                if n.fail.as_ref().is_some_and(|f| f.phase == FailPhase::MetaInfo) {
                    n.fail = None;
                }
                self.suspend.mark_progress();
                debug!(item = %self.tree.full_name(node), key = %compiled.key, "compiled");
                Ok(compiled)
            }
            Err(Interrupt::Suspended) => Err(Interrupt::Suspended),
            Err(Interrupt::Failed(error)) => {
                let source = buf.failed_supplier.unwrap_or(node);
                self.record_meta_fail(node, error.clone(), source);
                Err(Interrupt::Failed(error))
            }
        }
    }

    pub(crate) fn record_meta_fail(&mut self, node: NodeId, error: CalcError, source: NodeId) {
        if !self.tree.contains(node) {
            return;
        }
        warn!(item = %self.tree.full_name(node), %error, "calculation rule failed");
        self.metrics.record_failure();
        let now = self.now;
        self.fails_recorded = true;
        self.tree.node_mut(node).fail = Some(FailRecord::new(FailPhase::MetaInfo, error, Some(source), now));
    }

    fn compile_rule(&mut self, node: NodeId, buf: &mut SubstitutionBuffer) -> Flow<(MetaInfo, Expr)> {
        let raw = self.tree.node(node).expr.clone().unwrap_or_default();
        let ctx = self.search_context(node);
        let text = self.evaluate_possible_string_expr(ctx, &raw, buf)?;
        let name = self.tree.full_name(node);
        if text.trim().is_empty() {
            return Err(CalcError::Undefined {
                what: format!("empty calculation rule in {}", name),
            }
            .into());
        }
        let expr = parse_expr(&text).map_err(|error| CalcError::Syntax { item: name, error })?;

        if let Expr::Symbol(sym) = &expr {
            if *sym != symbol::THIS && ValueType::from_name(&sym.as_str()).is_none() {
                let target = self.find_item(ctx, &sym.as_str(), buf)?;
                let key = self.supplier_expr(target, PolicyClass::Subst, buf)?;
                return Ok((MetaInfo::Alias(target), key));
            }
        }

        if let Some(head) = expr.head() {
            match self.registry.get(head) {
                Some(group) if group.is_meta_function() => {
                    self.apply_meta_function(node, ctx, &group, &expr, buf)?;
                    return Ok((MetaInfo::Instantiated, self.source_key(node)));
                }
                Some(_) => {}
                None => {
                    if let Some(template) = self.find_template(ctx, head, node) {
                        self.instantiate_template(node, ctx, template, &expr, buf)?;
                        return Ok((MetaInfo::Instantiated, self.source_key(node)));
                    }
                }
            }
        }

        let key = self.subst(&expr, ctx, PolicyClass::Subst, buf)?;
        // resolve the operator now so overload errors belong to this rule
        let _blocker = self.suspend.blocker();
        let dc = self.get_or_create_dc(key.clone());
        self.make_result(dc)?;
        Ok((MetaInfo::Key, key))
    }

    /// Substitute `raw` in the context of `ctx` without attaching the result
    /// to a node
    pub fn substitute(&mut self, raw: &str, ctx: NodeId) -> Flow<Substitution> {
        self.assert_owner();
        self.live(ctx)?;
        let mut buf = SubstitutionBuffer::new(ctx);
        let text = self.evaluate_possible_string_expr(ctx, raw, &mut buf)?;
        let expr = parse_expr(&text).map_err(|error| CalcError::Syntax {
            item: self.tree.full_name(ctx),
            error,
        })?;
        let key = self.subst(&expr, ctx, PolicyClass::Subst, &mut buf)?;
        Ok(Substitution {
            key,
            suppliers: buf.suppliers.into_vec(),
        })
    }
}

fn removed_while_compiling() -> Interrupt {
    CalcError::Undefined {
        what: "item was removed while its suppliers were compiled".to_string(),
    }
    .into()
}
