//! DataControllers
//!
//! One controller per canonical key, found through the session's memo
//! table. A controller first makes its result (operator resolution and a
//! typed placeholder node) and computes the values only when asked:
//!
//! ```text
//! Created -> MetaPending -> MetaReady | MetaFailed
//!                           MetaReady -> DataPending -> DataReady | DataFailed
//! ```
//!
//! Failures are memoized in the controller until an invalidation resets it.

use crate::cache::CacheKey;
use crate::calc::MetaInfo;
use crate::data::{Column, DataReadLock, DataWriteLock, Value};
use crate::error::{CalcError, FailRecord, Flow, Interrupt, Result};
use crate::interest::{InterestCount, InterestGuard};
use crate::oper::{ArgPolicy, ArgRef, CostEstimate, OperContext, Operator, ResultSlot, Shape};
use crate::session::Session;
use crate::storage::StorageError;
use crate::suspend::Checkpoint;
use crate::tree::{DataMeta, NodeFlags, NodeId, NodeKind};
use hashbrown::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};
use treecalc_expr::{symbol, Expr};
use treecalc_types::{FailPhase, Timestamp, ValueType};

/// How long a certain calculation waits for a worker commit per round
const COMMIT_WAIT: Duration = Duration::from_millis(20);

/// Handle on a controller; stale once the controller is collected
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DcId {
    index: u32,
    generation: u32,
}

impl DcId {
    /// Slot index, stable while the controller lives
    pub fn index(self) -> u32 {
        self.index
    }
}

impl fmt::Debug for DcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dc{}v{}", self.index, self.generation)
    }
}

/// Lifecycle of a controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum DcState {
    /// Key interned, nothing resolved yet
    Created,
    /// Resolving the key, or suspended while doing so
    MetaPending,
    /// Result item and operator known
    MetaReady,
    /// Key resolution failed
    MetaFailed,
    /// Payload requested, computation in flight
    DataPending,
    /// Payload committed
    DataReady,
    /// Computation failed; meta info stays usable
    DataFailed,
}

impl DcState {
    /// Either phase failed
    pub fn is_failed(self) -> bool {
        matches!(self, DcState::MetaFailed | DcState::DataFailed)
    }

    /// Meta info is available
    pub fn has_result(self) -> bool {
        matches!(self, DcState::MetaReady | DcState::DataPending | DcState::DataReady | DcState::DataFailed)
    }
}

/// What a controller computes, decided from its key
#[derive(Debug, Clone)]
pub(crate) enum DcKind {
    /// Operator call; the operator sits in `DataController::oper`
    Func,
    /// Payload of an item that has no rule of its own
    Source(NodeId),
    /// Stands for the controller of a calculated item's key
    Alias(DcId),
    /// Constant committed when the result was built
    Literal,
    /// Unit standing for the implicit domain of a parameter
    DefaultUnit,
}

/// Argument of an operator call that outlives resolution
#[derive(Debug, Clone)]
pub(crate) enum DcArg {
    /// Computed argument
    Data(DcId),
    /// Argument taken as the item itself
    Item(NodeId),
}

/// Memoized calculation of one canonical key
pub struct DataController {
    /// Canonical key
    pub key: Expr,
    /// Current phase
    pub state: DcState,
    pub(crate) kind: Option<DcKind>,
    pub(crate) args: Vec<DcArg>,
    pub(crate) oper: Option<Arc<dyn Operator>>,
    /// Item carrying the payload
    pub result: Option<NodeId>,
    /// The result tree belongs to this controller and goes with it
    pub(crate) owns_result: bool,
    /// Last failure; cleared on success
    pub fail: Option<FailRecord>,
    /// When the current payload was derived
    pub data_at: Timestamp,
    pub(crate) fingerprint: Option<CacheKey>,
    /// Pins the controller against garbage collection
    pub interest: InterestCount,
}

impl DataController {
    fn new(key: Expr) -> Self {
        Self {
            key,
            state: DcState::Created,
            kind: None,
            args: Vec::new(),
            oper: None,
            result: None,
            owns_result: false,
            fail: None,
            data_at: Timestamp::ZERO,
            fingerprint: None,
            interest: InterestCount::new(),
        }
    }

    /// Controllers of the computed arguments
    pub(crate) fn arg_dcs(&self) -> impl Iterator<Item = DcId> + '_ {
        let alias = match self.kind {
            Some(DcKind::Alias(inner)) => Some(inner),
            _ => None,
        };
        self.args
            .iter()
            .filter_map(|a| match a {
                DcArg::Data(dc) => Some(*dc),
                _ => None,
            })
            .chain(alias)
    }
}

impl fmt::Debug for DataController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataController")
            .field("key", &self.key.to_string())
            .field("state", &self.state)
            .field("result", &self.result)
            .field("data_at", &self.data_at)
            .field("interest", &self.interest.get())
            .finish()
    }
}

struct DcSlot {
    generation: u32,
    dc: Option<DataController>,
}

/// Memo table: canonical key to controller
#[derive(Default)]
pub struct DcTable {
    slots: Vec<DcSlot>,
    free: Vec<u32>,
    index: HashMap<Expr, DcId>,
}

impl DcTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` for a stale id
    pub fn get(&self, id: DcId) -> Option<&DataController> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.dc.as_ref())
    }

    /// `None` for a stale id
    pub fn get_mut(&mut self, id: DcId) -> Option<&mut DataController> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.dc.as_mut())
    }

    /// Panics on a stale id
    pub fn dc(&self, id: DcId) -> &DataController {
        match self.get(id) {
            Some(dc) => dc,
            None => panic!("stale controller id {:?}", id),
        }
    }

    /// Panics on a stale id
    pub fn dc_mut(&mut self, id: DcId) -> &mut DataController {
        match self.get_mut(id) {
            Some(dc) => dc,
            None => panic!("stale controller id {:?}", id),
        }
    }

    /// Controller memoized under `key`
    pub fn lookup(&self, key: &Expr) -> Option<DcId> {
        self.index.get(key).copied()
    }

    fn insert(&mut self, key: Expr) -> DcId {
        let dc = DataController::new(key.clone());
        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.dc = Some(dc);
                DcId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(DcSlot {
                    generation: 0,
                    dc: Some(dc),
                });
                DcId { index, generation: 0 }
            }
        };
        self.index.insert(key, id);
        id
    }

    pub(crate) fn remove(&mut self, id: DcId) -> Option<DataController> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let dc = slot.dc.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.index.remove(&dc.key);
        Some(dc)
    }

    /// Ids of all live controllers
    pub fn ids(&self) -> Vec<DcId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.dc.is_some())
            .map(|(i, s)| DcId {
                index: i as u32,
                generation: s.generation,
            })
            .collect()
    }

    /// Is `id` live?
    pub fn contains(&self, id: DcId) -> bool {
        self.get(id).is_some()
    }

    /// Number of live controllers
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// No controllers?
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

impl fmt::Debug for DcTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DcTable").field("controllers", &self.len()).finish()
    }
}

/// Everything a data computation needs, detached from the session so it
/// can run on another thread
#[derive(Debug)]
pub(crate) struct CalcJob {
    pub oper: Arc<dyn Operator>,
    pub inputs: Vec<Arc<Column>>,
    pub shape: Shape,
    pub fingerprint: Option<CacheKey>,
}

impl CalcJob {
    pub fn run(&self, cp: &dyn Checkpoint) -> Flow<Column> {
        let inputs: Vec<&Column> = self.inputs.iter().map(|c| c.as_ref()).collect();
        self.oper.calc_data(&inputs, &self.shape, cp)
    }
}

/// Computed result pinned by an interest guard
pub struct FutureData {
    /// Controller that produced it
    pub dc: DcId,
    /// Result item
    pub node: NodeId,
    /// Payload; `None` for items without data, e.g. units
    pub column: Option<Arc<Column>>,
    _guard: InterestGuard,
}

impl fmt::Debug for FutureData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FutureData")
            .field("dc", &self.dc)
            .field("node", &self.node)
            .field("len", &self.column.as_ref().map(|c| c.len()))
            .finish()
    }
}

/// Answer of a certain calculation
#[derive(Debug)]
pub enum CalcOutcome {
    /// Result, pinned while the handle lives
    Ready(FutureData),
    /// Nothing changed state; the same call may be retried
    Suspended,
    /// The calculation failed
    Failed(CalcError),
}

impl CalcOutcome {
    /// Can the call be retried?
    pub fn is_suspended(&self) -> bool {
        matches!(self, CalcOutcome::Suspended)
    }
}

/// Instruction of a supplier visitor to the walk
#[derive(Debug, Clone, PartialEq)]
pub enum VisitState {
    /// Visit the next supplier
    Continue,
    /// End the walk early
    Stop,
    /// The visitor hit a checkpoint
    Suspended,
    /// Abort with an error
    Failed(CalcError),
}

/// Literal key as a typed value: small unsigned integers are UInt32, small
/// negative ones Int32, anything wider Int64 or Float64
fn literal_value(key: &Expr) -> Option<Value> {
    Some(match key {
        Expr::UInt(v) if *v < u32::MAX as u64 => Value::UInt32(*v as u32),
        Expr::UInt(v) if *v <= i64::MAX as u64 => Value::Int64(*v as i64),
        Expr::UInt(v) => Value::Float64(*v as f64),
        Expr::Int(v) if *v > i32::MIN as i64 && *v <= i32::MAX as i64 => Value::Int32(*v as i32),
        Expr::Int(v) => Value::Int64(*v),
        Expr::Float(v) => Value::Float64(*v),
        Expr::Str(s) => Value::String(s.to_string()),
        _ => return None,
    })
}

struct Resolution {
    kind: DcKind,
    args: Vec<DcArg>,
    oper: Option<Arc<dyn Operator>>,
    result: NodeId,
    owns_result: bool,
    /// The operator completed the data while building the result
    complete: bool,
}

impl Resolution {
    fn borrowed(kind: DcKind, result: NodeId) -> Self {
        Self {
            kind,
            args: Vec::new(),
            oper: None,
            result,
            owns_result: false,
            complete: false,
        }
    }
}

impl Session {
    /// Memo lookup; creates the controller on first use
    pub fn get_or_create_dc(&mut self, key: Expr) -> DcId {
        if let Some(id) = self.dcs.lookup(&key) {
            self.metrics.record_memo_hit();
            return id;
        }
        self.metrics.record_memo_miss();
        trace!(%key, "controller created");
        self.dcs.insert(key)
    }

    /// Result placeholder of `dc`, resolving the operator on first call
    ///
    /// Argument controllers are resolved leaves first from an explicit
    /// stack, so a deeply nested key does not deepen the call stack.
    pub fn make_result(&mut self, dc: DcId) -> Result<NodeId> {
        let _blocker = self.suspend.blocker();
        if self.needs_meta(dc) {
            let mut stack = vec![(dc, false)];
            let mut seen = HashSet::new();
            while let Some((id, expanded)) = stack.pop() {
                if expanded {
                    if id != dc {
                        // failures stay memoized and surface through the dependent
                        let _ = self.resolve_one(id);
                    }
                    continue;
                }
                if !seen.insert(id) || !self.needs_meta(id) {
                    continue;
                }
                stack.push((id, true));
                for arg in self.meta_deps(id) {
                    stack.push((arg, false));
                }
            }
        }
        self.resolve_one(dc)
    }

    /// Created, or resolved against nodes and controllers that are gone
    fn needs_meta(&self, dc: DcId) -> bool {
        match self.dcs.get(dc).map(|d| d.state) {
            None | Some(DcState::MetaPending) | Some(DcState::MetaFailed) => false,
            Some(DcState::Created) => true,
            Some(_) => !self.is_live(dc),
        }
    }

    /// Controllers `dc` resolves through, judged from its key alone
    fn meta_deps(&mut self, dc: DcId) -> Vec<DcId> {
        let key = self.dcs.dc(dc).key.clone();
        let Some(head) = key.head() else {
            return Vec::new();
        };
        if head == symbol::SOURCE {
            let Some(node) = self.source_node(&key) else {
                return Vec::new();
            };
            if !self.tree.node(node).has_calculator() {
                return Vec::new();
            }
            return match certain(self.compile(node)) {
                Ok(compiled) if compiled.info != MetaInfo::Instantiated && compiled.key != key => {
                    vec![self.get_or_create_dc(compiled.key.clone())]
                }
                _ => Vec::new(),
            };
        }
        let Some(group) = self.registry.get(head) else {
            return Vec::new();
        };
        if group.is_meta_function() {
            return Vec::new();
        }
        // the policies of a dynamic group depend on its computed first argument
        let dynamic = group.policies.is_dynamic();
        let computed: Vec<Expr> = key
            .args()
            .iter()
            .enumerate()
            .filter(|(i, _)| (!dynamic || *i == 0) && group.policies.policy(*i, None).is_computed())
            .map(|(_, arg)| arg.clone())
            .collect();
        computed.into_iter().map(|arg| self.get_or_create_dc(arg)).collect()
    }

    fn resolve_one(&mut self, dc: DcId) -> Result<NodeId> {
        let (state, result) = match self.dcs.get(dc) {
            Some(d) => (d.state, d.result),
            None => {
                return Err(CalcError::Undefined {
                    what: "controller was collected".to_string(),
                })
            }
        };
        match state {
            DcState::Created => {}
            DcState::MetaPending => {
                return Err(CalcError::CircularDependency {
                    item: self.dcs.dc(dc).key.to_string(),
                });
            }
            DcState::MetaFailed => return Err(self.dc_error(dc)),
            _ => match result {
                Some(result) if self.is_live(dc) => return Ok(result),
                _ => self.reset_dc(dc),
            },
        }

        let key = self.dcs.dc(dc).key.clone();
        self.dcs.dc_mut(dc).state = DcState::MetaPending;
        match self.resolve_dc(dc, &key) {
            Ok(r) => {
                let data_changed = self.tree.node(r.result).data_changed;
                let d = self.dcs.dc_mut(dc);
                d.kind = Some(r.kind);
                d.args = r.args;
                d.oper = r.oper;
                d.result = Some(r.result);
                d.owns_result = r.owns_result;
                d.state = DcState::MetaReady;
                if r.complete {
                    d.state = DcState::DataReady;
                    d.data_at = data_changed;
                }
                trace!(%key, "meta info ready");
                Ok(r.result)
            }
            Err(error) => {
                debug!(%key, %error, "meta info failed");
                self.metrics.record_failure();
                self.fails_recorded = true;
                let now = self.now;
                let d = self.dcs.dc_mut(dc);
                d.state = DcState::MetaFailed;
                d.fail = Some(FailRecord::new(FailPhase::MetaInfo, error.clone(), None, now));
                Err(error)
            }
        }
    }

    /// Memoized failure of `dc`
    pub(crate) fn dc_error(&self, dc: DcId) -> CalcError {
        let d = self.dcs.dc(dc);
        d.fail
            .as_ref()
            .map(|f| f.error.clone())
            .unwrap_or_else(|| CalcError::Undefined { what: d.key.to_string() })
    }

    /// Do the nodes and controllers this one was built on still exist?
    fn is_live(&self, dc: DcId) -> bool {
        let d = self.dcs.dc(dc);
        if !d.result.is_some_and(|r| self.tree.contains(r)) {
            return false;
        }
        match &d.kind {
            Some(DcKind::Source(node)) => self.tree.contains(*node),
            Some(DcKind::Alias(inner)) => self
                .dcs
                .get(*inner)
                .is_some_and(|i| i.state.has_result() && i.result == d.result),
            Some(DcKind::Func) => d.args.iter().all(|a| match a {
                DcArg::Data(dc) => self.dcs.get(*dc).is_some_and(|i| {
                    i.state.has_result() && i.result.is_some_and(|r| self.tree.contains(r))
                }),
                DcArg::Item(node) => self.tree.contains(*node),
            }),
            Some(DcKind::Literal) | Some(DcKind::DefaultUnit) => true,
            None => false,
        }
    }

    /// Back to `Created`, dropping an owned result tree
    pub(crate) fn reset_dc(&mut self, dc: DcId) {
        let Some(d) = self.dcs.get_mut(dc) else { return };
        let owned = d.owns_result.then_some(d.result).flatten();
        d.state = DcState::Created;
        d.kind = None;
        d.args.clear();
        d.oper = None;
        d.result = None;
        d.owns_result = false;
        d.fail = None;
        d.data_at = Timestamp::ZERO;
        d.fingerprint = None;
        if let Some(result) = owned {
            self.tree.remove_subtree(result);
        }
    }

    fn resolve_dc(&mut self, dc: DcId, key: &Expr) -> Result<Resolution> {
        if let Some(value) = literal_value(key) {
            return Ok(self.literal_result(dc, value));
        }
        let Some(head) = key.head() else {
            return Err(CalcError::IllegalExpression {
                message: format!("{} is not a computable expression", key),
            });
        };
        if head == symbol::SOURCE {
            return self.source_result(key);
        }
        if key.args().is_empty() {
            if let Some(vt) = ValueType::from_name(&head.as_str()) {
                return Ok(Resolution::borrowed(DcKind::DefaultUnit, self.tree.default_unit(vt)));
            }
        }
        let group = self
            .registry
            .get(head)
            .ok_or_else(|| CalcError::UnknownOperator { name: head.to_string() })?;
        if group.is_meta_function() {
            return Err(CalcError::IllegalExpression {
                message: "meta function call not allowed as sub-expression".to_string(),
            });
        }

        let mut refs = Vec::with_capacity(key.args().len());
        let mut args = Vec::with_capacity(key.args().len());
        let mut first: Option<Value> = None;
        for (i, arg) in key.args().iter().enumerate() {
            let policy = group.policies.policy(i, first.as_ref());
            if policy.is_computed() {
                let arg_dc = self.get_or_create_dc(arg.clone());
                let result = self.make_result(arg_dc)?;
                if i == 0 && group.policies.is_dynamic() {
                    first = self.calc_dc_certain(arg_dc)?.and_then(|c| c.get(0));
                }
                refs.push(self.arg_ref(result, Some(arg_dc)));
                args.push(DcArg::Data(arg_dc));
            } else if let Some(node) = self.source_node(arg) {
                refs.push(self.arg_ref(node, None));
                args.push(DcArg::Item(node));
            } else {
                refs.push(ArgRef::Expr(arg.clone()));
            }
        }

        let oper = group.find_oper_by_args(&refs)?;
        let mut slot = ResultSlot::default();
        let complete = oper.create_result(&mut OperContext::new(self, Some(dc)), &mut slot, &refs, false)?;
        let result = slot
            .result
            .ok_or_else(|| CalcError::operator(head, "operator built no result"))?;
        let owns_result = self.tree.node(result).flags.cache_item;
        Ok(Resolution {
            kind: DcKind::Func,
            args,
            oper: Some(oper),
            result,
            owns_result,
            complete,
        })
    }

    fn literal_result(&mut self, dc: DcId, value: Value) -> Resolution {
        let kind = NodeKind::Data(DataMeta {
            value_type: Some(value.value_type()),
            domain: None,
            values: None,
        });
        let node = self.tree.create_root(&format!("#dc{}", dc.index()), kind);
        let n = self.tree.node_mut(node);
        n.flags = NodeFlags {
            cache_item: true,
            ..NodeFlags::default()
        };
        DataWriteLock::new(&n.data).commit(Arc::new(Column::scalar(value)));
        Resolution {
            kind: DcKind::Literal,
            args: Vec::new(),
            oper: None,
            result: node,
            owns_result: true,
            complete: true,
        }
    }

    fn source_result(&mut self, key: &Expr) -> Result<Resolution> {
        let node = self.source_node(key).ok_or_else(|| CalcError::Undefined {
            what: format!("no item {}", key.args().first().map(|a| a.to_string()).unwrap_or_default()),
        })?;
        if self.tree.node(node).has_calculator() {
            let compiled = certain(self.compile(node))?;
            if compiled.info != MetaInfo::Instantiated && compiled.key != *key {
                let inner = self.get_or_create_dc(compiled.key.clone());
                let result = self.make_result(inner)?;
                return Ok(Resolution::borrowed(DcKind::Alias(inner), result));
            }
        }
        Ok(Resolution::borrowed(DcKind::Source(node), node))
    }

    /// Argument description for overload resolution
    pub(crate) fn arg_ref(&self, node: NodeId, dc: Option<DcId>) -> ArgRef {
        let n = self.tree.node(node);
        match n.kind {
            NodeKind::Data(meta) => ArgRef::Data { node, meta, dc },
            NodeKind::Unit(info) => ArgRef::Unit { node, info, dc },
            NodeKind::Container => ArgRef::Item {
                node,
                is_template: n.flags.is_template,
            },
        }
    }

    /// Argument of a meta function: computed arguments get a controller,
    /// references to items are passed as the item
    pub(crate) fn arg_ref_for(&mut self, key: &Expr, policy: ArgPolicy) -> Result<ArgRef> {
        if policy.is_computed() {
            let dc = self.get_or_create_dc(key.clone());
            let result = self.make_result(dc)?;
            return Ok(self.arg_ref(result, Some(dc)));
        }
        Ok(match self.source_node(key) {
            Some(node) => self.arg_ref(node, None),
            None => ArgRef::Expr(key.clone()),
        })
    }

    /// Bring `dc` to `DataReady`, returning when its payload was derived
    ///
    /// Arguments are brought up to date leaves first from an explicit
    /// stack; a suspension anywhere abandons the walk.
    pub(crate) fn calc_dc(&mut self, dc: DcId) -> Flow<Timestamp> {
        self.make_result(dc)?;
        let mut stack = vec![(dc, false)];
        let mut seen = HashSet::new();
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                if id != dc {
                    // failures are memoized; the dependent reports them
                    if let Err(Interrupt::Suspended) = self.calc_one(id) {
                        return Err(Interrupt::Suspended);
                    }
                }
                continue;
            }
            if !seen.insert(id) {
                continue;
            }
            stack.push((id, true));
            if let Some(d) = self.dcs.get(id) {
                if !matches!(d.state, DcState::DataPending | DcState::DataFailed) {
                    stack.extend(d.arg_dcs().map(|arg| (arg, false)));
                }
            }
        }
        self.calc_one(dc)
    }

    /// Bring one controller to `DataReady`; its arguments are expected to
    /// be settled already
    fn calc_one(&mut self, dc: DcId) -> Flow<Timestamp> {
        self.make_result(dc)?;
        if self.pending > 0 {
            self.process_meta_queue();
        }
        let d = self.dcs.dc(dc);
        match d.state {
            DcState::DataFailed => return Err(Interrupt::Failed(self.dc_error(dc))),
            DcState::DataPending => return Err(Interrupt::Suspended),
            _ => {}
        }
        match d.kind.clone() {
            Some(DcKind::Literal) | Some(DcKind::DefaultUnit) => {
                let d = self.dcs.dc_mut(dc);
                d.state = DcState::DataReady;
                Ok(d.data_at)
            }
            Some(DcKind::Alias(inner)) => {
                let at = self.settled(inner)?;
                let d = self.dcs.dc_mut(dc);
                d.state = DcState::DataReady;
                d.data_at = at;
                Ok(at)
            }
            Some(DcKind::Source(node)) => self.calc_source(dc, node),
            Some(DcKind::Func) => self.calc_func(dc),
            None => Err(CalcError::Undefined {
                what: format!("{} has no meta info", d.key),
            }
            .into()),
        }
    }

    /// Stamp of an argument the walk already brought up to date
    fn settled(&mut self, arg: DcId) -> Flow<Timestamp> {
        match self.dcs.get(arg).map(|d| (d.state, d.data_at)) {
            Some((DcState::DataReady, at)) => Ok(at),
            _ => self.calc_one(arg),
        }
    }

    fn calc_source(&mut self, dc: DcId, node: NodeId) -> Flow<Timestamp> {
        let n = self.tree.node(node);
        match n.kind {
            NodeKind::Container => {
                let error = CalcError::Undefined {
                    what: format!("no data for {}", self.tree.full_name(node)),
                };
                return Err(self.fail_data(dc, error));
            }
            NodeKind::Unit(_) => {}
            NodeKind::Data(_) => {
                let empty = DataReadLock::new(&n.data).column().is_none();
                if empty && n.is_loadable() {
                    if let Err(error) = self.load_from_storage(node) {
                        return Err(self.fail_data(dc, error));
                    }
                }
                if DataReadLock::new(&self.tree.node(node).data).column().is_none() {
                    let error = CalcError::Undefined {
                        what: format!("no data for {}", self.tree.full_name(node)),
                    };
                    return Err(self.fail_data(dc, error));
                }
            }
        }
        let at = self.tree.node(node).data_changed;
        let d = self.dcs.dc_mut(dc);
        d.state = DcState::DataReady;
        d.data_at = at;
        Ok(at)
    }

    fn load_from_storage(&mut self, node: NodeId) -> Result<()> {
        let n = self.tree.node(node);
        let storage = n.storage_type.clone().unwrap_or_else(|| "default".to_string());
        let path = n.storage_name.clone().unwrap_or_default();
        let manager = self
            .storages
            .get(&storage)
            .cloned()
            .ok_or_else(|| CalcError::Storage(StorageError::UnknownStorage(storage.clone()).to_string()))?;
        let column = manager.read(&path).map_err(|e| CalcError::Storage(e.to_string()))?;
        if let NodeKind::Data(DataMeta { value_type: Some(vt), .. }) = n.kind {
            if vt != column.value_type() {
                return Err(CalcError::TypeMismatch {
                    item: self.tree.full_name(node),
                    expected: vt.name().to_string(),
                    found: column.value_type().name().to_string(),
                });
            }
        }
        debug!(item = %self.tree.full_name(node), %storage, %path, len = column.len(), "loaded from storage");
        let n = self.tree.node_mut(node);
        DataWriteLock::new(&n.data).commit(Arc::new(column));
        n.data_from_storage = true;
        Ok(())
    }

    fn calc_func(&mut self, dc: DcId) -> Flow<Timestamp> {
        let arg_dcs: Vec<DcId> = self.dcs.dc(dc).arg_dcs().collect();
        let mut newest = Timestamp::ZERO;
        for arg in arg_dcs {
            match self.settled(arg) {
                Ok(at) => newest = newest.max(at),
                Err(Interrupt::Suspended) => return Err(Interrupt::Suspended),
                Err(Interrupt::Failed(error)) => return Err(self.fail_data(dc, error)),
            }
        }

        let d = self.dcs.dc(dc);
        let has_data = d
            .result
            .is_some_and(|r| DataReadLock::new(&self.tree.node(r).data).column().is_some());
        if d.state == DcState::DataReady && d.data_at >= newest && has_data {
            return Ok(d.data_at);
        }
        if self.suspend.must_suspend() {
            self.metrics.record_suspension();
            return Err(Interrupt::Suspended);
        }

        let job = match self.prepare_job(dc) {
            Ok(job) => job,
            Err(error) => return Err(self.fail_data(dc, error)),
        };
        let cached = match (&self.cache, &job.fingerprint) {
            (Some(cache), Some(fingerprint)) => cache.get::<Column>(fingerprint),
            _ => None,
        };
        if let Some(column) = cached {
            self.metrics.record_cache_hit();
            trace!(key = %self.dcs.dc(dc).key, "payload cache hit");
            return self.finish_job(dc, job.fingerprint, Ok(column), Duration::ZERO);
        }
        let started = Instant::now();
        let outcome = job.run(&self.suspend);
        match outcome {
            Err(Interrupt::Suspended) => {
                self.metrics.record_suspension();
                Err(Interrupt::Suspended)
            }
            Ok(column) => self.finish_job(dc, job.fingerprint, Ok(column), started.elapsed()),
            Err(Interrupt::Failed(error)) => self.finish_job(dc, job.fingerprint, Err(error), started.elapsed()),
        }
    }

    /// Snapshot the argument payloads of `dc`
    pub(crate) fn prepare_job(&self, dc: DcId) -> Result<CalcJob> {
        let d = self.dcs.dc(dc);
        let oper = d.oper.clone().ok_or_else(|| CalcError::IllegalExpression {
            message: format!("{} has no operator", d.key),
        })?;
        let result = d.result.ok_or_else(|| CalcError::Undefined {
            what: format!("{} has no result", d.key),
        })?;
        let value_type = match self.tree.node(result).kind {
            NodeKind::Data(meta) => meta.value_type.unwrap_or(ValueType::Float64),
            NodeKind::Unit(info) => info.value_type,
            NodeKind::Container => {
                return Err(CalcError::IllegalExpression {
                    message: format!("{} does not produce data", d.key),
                })
            }
        };

        let mut inputs = Vec::new();
        let mut arg_lens = Vec::new();
        let mut parts = Vec::new();
        for arg in &d.args {
            let DcArg::Data(arg_dc) = arg else { continue };
            let arg_result = self.dcs.dc(*arg_dc).result.ok_or_else(|| CalcError::Undefined {
                what: format!("argument of {} has no result", d.key),
            })?;
            let n = self.tree.node(arg_result);
            match n.kind {
                NodeKind::Unit(info) => {
                    let count = self.unit_count(arg_result);
                    inputs.push(Arc::new(Column::from_values(info.value_type, &[])));
                    arg_lens.push(count as usize);
                    parts.push(CacheKey::from_components(&[info.value_type.name().as_bytes(), &count.to_le_bytes()[..]]));
                }
                _ => {
                    let column = DataReadLock::new(&n.data).snapshot().ok_or_else(|| CalcError::Undefined {
                        what: format!("no data for {}", self.tree.full_name(arg_result)),
                    })?;
                    arg_lens.push(column.len());
                    if self.cache.is_some() {
                        parts.push(CacheKey::from_bytes(&column.to_bytes()));
                    }
                    inputs.push(column);
                }
            }
        }
        let fingerprint = self
            .cache
            .as_ref()
            .map(|_| CacheKey::for_computation(&d.key.to_string(), &parts));
        Ok(CalcJob {
            oper,
            inputs,
            shape: Shape {
                value_type,
                arg_lens,
                chunk: self.engine.chunk_size,
            },
            fingerprint,
        })
    }

    /// Publish the outcome of a computation run inline or on a worker
    pub(crate) fn finish_job(
        &mut self,
        dc: DcId,
        fingerprint: Option<CacheKey>,
        outcome: std::result::Result<Column, CalcError>,
        elapsed: Duration,
    ) -> Flow<Timestamp> {
        if !self.dcs.contains(dc) {
            return Err(CalcError::Undefined {
                what: "controller was collected".to_string(),
            }
            .into());
        }
        let column = match outcome {
            Ok(column) => column,
            Err(error) => return Err(self.fail_data(dc, error)),
        };
        if elapsed > Duration::ZERO {
            self.metrics.record_computation(elapsed);
        }
        let d = self.dcs.dc(dc);
        if let Some(result) = d.result {
            if let NodeKind::Data(DataMeta { value_type: Some(vt), .. }) = self.tree.node(result).kind {
                if vt != column.value_type() {
                    let error = CalcError::TypeMismatch {
                        item: d.key.to_string(),
                        expected: vt.name().to_string(),
                        found: column.value_type().name().to_string(),
                    };
                    return Err(self.fail_data(dc, error));
                }
            }
        }
        if let (Some(cache), Some(fp)) = (&self.cache, &fingerprint) {
            if let Err(error) = cache.put(fp.clone(), &column) {
                warn!(%error, "payload not cached");
            }
        }
        self.dcs.dc_mut(dc).fingerprint = fingerprint;
        Ok(self.commit_data(dc, column))
    }

    fn commit_data(&mut self, dc: DcId, column: Column) -> Timestamp {
        let now = self.now;
        let d = self.dcs.dc_mut(dc);
        d.state = DcState::DataReady;
        d.data_at = now;
        d.fail = None;
        if let Some(result) = d.result {
            let len = column.len();
            let n = self.tree.node_mut(result);
            DataWriteLock::new(&n.data).commit(Arc::new(column));
            n.data_changed = now;
            debug!(key = %self.dcs.dc(dc).key, len, "data ready");
        }
        self.suspend.mark_progress();
        now
    }

    /// Memoize a data failure and hand it back as an interrupt
    pub(crate) fn fail_data(&mut self, dc: DcId, error: CalcError) -> Interrupt {
        debug!(key = %self.dcs.dc(dc).key, %error, "data failed");
        self.metrics.record_failure();
        self.fails_recorded = true;
        let now = self.now;
        let d = self.dcs.dc_mut(dc);
        d.state = DcState::DataFailed;
        d.fail = Some(FailRecord::new(FailPhase::Data, error.clone(), None, now));
        Interrupt::Failed(error)
    }

    /// Compute `dc` to completion, waiting for worker commits if needed
    pub fn calc_dc_certain(&mut self, dc: DcId) -> Result<Option<Arc<Column>>> {
        let _blocker = self.suspend.blocker();
        loop {
            match self.calc_dc(dc) {
                Ok(_) => return Ok(self.dc_column(dc)),
                Err(Interrupt::Failed(error)) => return Err(error),
                Err(Interrupt::Suspended) if self.pending > 0 => {
                    self.queue.wait(COMMIT_WAIT);
                    self.process_meta_queue();
                }
                Err(Interrupt::Suspended) => {
                    return Err(CalcError::IllegalExpression {
                        message: format!("{} suspended under a blocker", self.dcs.dc(dc).key),
                    })
                }
            }
        }
    }

    /// Current payload of the result of `dc`
    pub fn dc_column(&self, dc: DcId) -> Option<Arc<Column>> {
        let result = self.dcs.get(dc)?.result?;
        let n = self.tree.get(result)?;
        DataReadLock::new(&n.data).snapshot()
    }

    /// Suspendible computation of `dc`
    pub fn calc_result(&mut self, dc: DcId) -> CalcOutcome {
        self.assert_owner();
        match self.calc_dc(dc) {
            Ok(_) => {
                let d = self.dcs.dc(dc);
                let Some(node) = d.result else {
                    return CalcOutcome::Failed(CalcError::Undefined {
                        what: format!("{} has no result", d.key),
                    });
                };
                CalcOutcome::Ready(FutureData {
                    dc,
                    node,
                    column: self.dc_column(dc),
                    _guard: d.interest.guard(),
                })
            }
            Err(Interrupt::Suspended) => CalcOutcome::Suspended,
            Err(Interrupt::Failed(error)) => CalcOutcome::Failed(error),
        }
    }

    /// Call `visitor` for each supplier of `node`, polling the latch before
    /// every call
    pub fn visit_suppliers(
        &mut self,
        node: NodeId,
        mut visitor: impl FnMut(&Session, NodeId) -> VisitState,
    ) -> VisitState {
        let compiled = match self.compile(node) {
            Ok(compiled) => compiled,
            Err(Interrupt::Suspended) => return VisitState::Suspended,
            Err(Interrupt::Failed(error)) => return VisitState::Failed(error),
        };
        for &supplier in compiled.suppliers.iter() {
            if self.suspend.must_suspend() {
                return VisitState::Suspended;
            }
            match visitor(&*self, supplier) {
                VisitState::Continue => {}
                other => return other,
            }
        }
        VisitState::Continue
    }

    /// Size of the result of `dc` without computing it
    pub fn estimate_dc(&mut self, dc: DcId) -> Result<CostEstimate> {
        let result = self.make_result(dc)?;
        let (elements, value_type) = match self.tree.node(result).kind {
            NodeKind::Data(meta) => (
                meta.domain.map(|d| self.unit_count(d)).unwrap_or(1),
                meta.value_type.unwrap_or(ValueType::Float64),
            ),
            NodeKind::Unit(info) => (self.unit_count(result), info.value_type),
            NodeKind::Container => (0, ValueType::Bool),
        };
        let estimate = self
            .dcs
            .dc(dc)
            .oper
            .as_ref()
            .and_then(|op| op.estimate(elements, value_type));
        Ok(estimate.unwrap_or(CostEstimate {
            elements,
            bytes: elements * value_type.byte_width(),
        }))
    }

    /// Keep `dc` and its arguments out of garbage collection
    pub fn retain_dc(&self, dc: DcId) -> Option<InterestGuard> {
        self.dcs.get(dc).map(|d| d.interest.guard())
    }

    /// Element count of a unit: declared, else the length of its payload
    pub fn unit_count(&self, unit: NodeId) -> u64 {
        let Some(n) = self.tree.get(unit) else { return 0 };
        if let NodeKind::Unit(info) = n.kind {
            if let Some(count) = info.count {
                return count;
            }
        }
        DataReadLock::new(&n.data).column().map_or(0, |c| c.len() as u64)
    }
}

/// Run a suspendible step where suspension is not an option
pub(crate) fn certain<T>(flow: Flow<T>) -> Result<T> {
    match flow {
        Ok(v) => Ok(v),
        Err(Interrupt::Failed(error)) => Err(error),
        Err(Interrupt::Suspended) => Err(CalcError::IllegalExpression {
            message: "suspended where the result was required".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_types() {
        assert_eq!(literal_value(&Expr::UInt(3)), Some(Value::UInt32(3)));
        assert_eq!(literal_value(&Expr::UInt(u32::MAX as u64)), Some(Value::Int64(u32::MAX as i64)));
        assert_eq!(literal_value(&Expr::Int(-3)), Some(Value::Int32(-3)));
        assert_eq!(literal_value(&Expr::Int(i32::MIN as i64)), Some(Value::Int64(i32::MIN as i64)));
        assert_eq!(literal_value(&Expr::string("a")), Some(Value::String("a".into())));
        assert_eq!(literal_value(&Expr::sym("a")), None);
    }

    #[test]
    fn table_reuses_slots_with_new_generations() {
        let mut table = DcTable::new();
        let a = table.insert(Expr::sym("a"));
        assert_eq!(table.lookup(&Expr::sym("a")), Some(a));
        assert!(table.remove(a).is_some());
        assert!(!table.contains(a));
        assert_eq!(table.lookup(&Expr::sym("a")), None);
        let b = table.insert(Expr::sym("b"));
        assert_eq!(a.index(), b.index());
        assert_ne!(a, b);
        assert_eq!(table.ids(), vec![b]);
    }
}
