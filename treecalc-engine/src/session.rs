//! Session: one model, its tree and its controllers
//!
//! A session is confined to the thread that created it. Everything that
//! reads or edits the tree goes through it; worker threads only ever see
//! snapshots of payloads (see [`crate::queue`]).

use crate::cache::{CacheStats, CalcCache};
use crate::config::EngineConfig;
use crate::controller::{certain, CalcOutcome, DcId, DcState, DcTable};
use crate::data::{Column, Value};
use crate::error::{CalcError, FailRecord, Interrupt, Result};
use crate::interest::InterestGuard;
use crate::metrics::{CalcMetrics, MetricsSnapshot};
use crate::oper::{CostEstimate, OperRegistry};
use crate::queue::MetaQueue;
use crate::storage::StorageManager;
use crate::suspend::{Blocker, SuspendTrigger};
use crate::tree::{NodeId, NodeKind, Tree};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::debug;
use treecalc_expr::{Expr, Symbol};
use treecalc_types::{FailPhase, Timestamp};

/// One model and its calculation state
///
/// A session is used from the thread that created it; data computations
/// are handed to worker threads and committed back through its queue.
pub struct Session {
    pub(crate) tree: Tree,
    pub(crate) config_root: NodeId,
    pub(crate) registry: Arc<OperRegistry>,
    pub(crate) dcs: DcTable,
    pub(crate) suspend: SuspendTrigger,
    /// Nodes whose rules are being compiled, innermost last
    pub(crate) compile_stack: Vec<NodeId>,
    pub(crate) now: Timestamp,
    /// Last time source data changed; data dependent compiles older than
    /// this are redone
    pub(crate) data_epoch: Timestamp,
    pub(crate) metrics: Arc<CalcMetrics>,
    pub(crate) cache: Option<Arc<CalcCache>>,
    pub(crate) storages: HashMap<String, Arc<dyn StorageManager>>,
    pub(crate) queue: MetaQueue,
    /// Worker computations not yet committed
    pub(crate) pending: usize,
    pub(crate) engine: EngineConfig,
    /// Some node or controller may hold a failure record
    pub(crate) fails_recorded: bool,
    owner: ThreadId,
    /// Held while suspension is switched off
    no_suspend: Option<Blocker>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// Session with the builtin operators
    pub fn new() -> Self {
        Self::with_registry(Arc::new(OperRegistry::with_builtins()))
    }

    /// Session resolving operators in `registry`
    pub fn with_registry(registry: Arc<OperRegistry>) -> Self {
        let mut tree = Tree::new();
        let config_root = tree.create_root("", NodeKind::Container);
        Self {
            tree,
            config_root,
            registry,
            dcs: DcTable::new(),
            suspend: SuspendTrigger::new(),
            compile_stack: Vec::new(),
            now: Timestamp::ZERO.next(),
            data_epoch: Timestamp::ZERO,
            metrics: Arc::new(CalcMetrics::new()),
            cache: None,
            storages: HashMap::new(),
            queue: MetaQueue::new(),
            pending: 0,
            engine: EngineConfig::default(),
            fails_recorded: false,
            owner: thread::current().id(),
            no_suspend: None,
        }
    }

    /// Share a payload cache with other sessions
    pub fn with_cache(mut self, cache: Arc<CalcCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Apply engine settings; creates a cache when a bound is configured
    pub fn with_engine(mut self, engine: EngineConfig) -> Self {
        if let Some(max) = engine.cache_max_bytes {
            if self.cache.is_none() {
                self.cache = Some(Arc::new(CalcCache::with_max_size(max)));
            }
        }
        self.no_suspend = (!engine.suspension).then(|| self.suspend.blocker());
        self.engine = engine;
        self
    }

    /// Make `manager` available to nodes naming storage `name`
    pub fn register_storage(&mut self, name: &str, manager: Arc<dyn StorageManager>) {
        self.storages.insert(name.to_string(), manager);
    }

    pub(crate) fn assert_owner(&self) {
        debug_assert_eq!(
            thread::current().id(),
            self.owner,
            "session used outside the thread that created it"
        );
    }

    /// Root of the model
    pub fn config_root(&self) -> NodeId {
        self.config_root
    }

    /// Item tree, read only
    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// Current logical time
    pub fn now(&self) -> Timestamp {
        self.now
    }

    /// Settings in effect
    pub fn engine(&self) -> &EngineConfig {
        &self.engine
    }

    /// Node at `path`, absolute or relative to the configuration root
    pub fn lookup(&self, path: &str) -> Option<NodeId> {
        self.node_by_full_name(path)
    }

    /// Get or create the child `name` of `parent`
    pub fn create_item(&mut self, parent: NodeId, name: &str, kind: NodeKind) -> Result<NodeId> {
        self.assert_owner();
        self.live(parent)?;
        self.now = self.now.next();
        let now = self.now;
        let node = self.tree.create_item(parent, name, kind, now);
        // names that failed to resolve may resolve now
        self.tree.node_mut(parent).meta_changed = now;
        self.clear_fails(Some(FailPhase::MetaInfo));
        Ok(node)
    }

    /// Error for ids whose item was removed, typically by re-instantiation
    pub(crate) fn live(&self, node: NodeId) -> Result<()> {
        if self.tree.contains(node) {
            Ok(())
        } else {
            Err(CalcError::Undefined {
                what: format!("item {:?} no longer exists", node),
            })
        }
    }

    /// Deepest node `path` resolves to from `ctx`, plus the unresolved rest
    ///
    /// Only the tree is consulted: nothing is compiled. A removed `ctx`
    /// resolves no relative path.
    pub fn find_best_item(&self, ctx: NodeId, path: &str) -> (NodeId, String) {
        if !path.starts_with('/') && !self.tree.contains(ctx) {
            return (ctx, path.to_string());
        }
        let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        let (mut cur, rest) = if path.starts_with('/') {
            (self.config_root, &parts[..])
        } else {
            match parts.split_first() {
                Some((first, _)) if *first == "." || *first == ".." => (ctx, &parts[..]),
                Some((first, rest)) => {
                    let sym = Symbol::lookup(first);
                    let mut scope = Some(ctx);
                    let mut found = None;
                    while let (Some(s), Some(sym)) = (scope, sym) {
                        if let Some(c) = self.tree.child(s, sym) {
                            found = Some(c);
                            break;
                        }
                        scope = self.tree.parent(s);
                    }
                    match found {
                        Some(f) => (f, rest),
                        None => return (ctx, parts.join("/")),
                    }
                }
                None => return (ctx, String::new()),
            }
        };
        for (i, part) in rest.iter().enumerate() {
            let next = match *part {
                "." => Some(cur),
                ".." => self.tree.parent(cur),
                name => Symbol::lookup(name).and_then(|sym| self.tree.child(cur, sym)),
            };
            match next {
                Some(n) => cur = n,
                None => return (cur, rest[i..].join("/")),
            }
        }
        (cur, String::new())
    }

    /// Canonical key of `node`'s rule
    pub fn canonical_key(&mut self, node: NodeId) -> Result<Expr> {
        self.assert_owner();
        let _blocker = self.suspend.blocker();
        Ok(certain(self.compile(node))?.key.clone())
    }

    /// Transitive suppliers of `node` in order of first occurrence
    pub fn suppliers(&mut self, node: NodeId) -> Result<Vec<NodeId>> {
        self.assert_owner();
        let _blocker = self.suspend.blocker();
        Ok(certain(self.compile(node))?.suppliers.to_vec())
    }

    /// Controller computing the data of `node`
    pub fn item_dc(&mut self, node: NodeId) -> Result<DcId> {
        self.assert_owner();
        let _blocker = self.suspend.blocker();
        let key = certain(self.compile(node))?.key.clone();
        Ok(self.get_or_create_dc(key))
    }

    /// Suspendible computation of `node`'s data
    pub fn calc_item(&mut self, node: NodeId) -> CalcOutcome {
        self.assert_owner();
        if let Err(error) = self.live(node) {
            return CalcOutcome::Failed(error);
        }
        let compiled = match self.compile(node) {
            Ok(compiled) => compiled,
            Err(Interrupt::Suspended) => return CalcOutcome::Suspended,
            Err(Interrupt::Failed(error)) => return CalcOutcome::Failed(error),
        };
        let dc = self.get_or_create_dc(compiled.key.clone());
        let outcome = self.calc_result(dc);
        if let CalcOutcome::Failed(error) = &outcome {
            self.fails_recorded = true;
            let now = self.now;
            // the walk may have re-instantiated the item away
            if let Some(n) = self.tree.get_mut(node) {
                if n.fail.is_none() {
                    n.fail = Some(FailRecord::new(FailPhase::Data, error.clone(), None, now));
                }
            }
        }
        outcome
    }

    /// Compute `node`'s data to completion
    pub fn calc_item_certain(&mut self, node: NodeId) -> Result<Option<Arc<Column>>> {
        let _blocker = self.suspend.blocker();
        match self.calc_item(node) {
            CalcOutcome::Ready(future) => Ok(future.column),
            CalcOutcome::Failed(error) => Err(error),
            CalcOutcome::Suspended => {
                // only worker commits can leave a blocked walk pending
                let dc = self.item_dc(node)?;
                self.calc_dc_certain(dc)
            }
        }
    }

    /// Payload of `node`, computed if needed
    pub fn read_column(&mut self, node: NodeId) -> Result<Arc<Column>> {
        self.calc_item_certain(node)?.ok_or_else(|| CalcError::Undefined {
            what: format!("no data for {}", self.tree.full_name(node)),
        })
    }

    /// First element of the item at `path`
    pub fn value(&mut self, path: &str) -> Result<Value> {
        let node = self.lookup(path).ok_or_else(|| {
            let (best, _) = self.find_best_item(self.config_root, path);
            CalcError::UnknownIdentifier {
                name: path.to_string(),
                context: "/".to_string(),
                best_guess: (best != self.config_root).then(|| self.tree.full_name(best)),
            }
        })?;
        let column = self.read_column(node)?;
        column.get(0).ok_or_else(|| CalcError::Undefined {
            what: format!("{} is empty", self.tree.full_name(node)),
        })
    }

    /// Memoized failure of `node`, if any
    pub fn fail_reason(&self, node: NodeId) -> Option<&CalcError> {
        self.tree.get(node)?.fail.as_ref().map(|f| &f.error)
    }

    /// Size of `node`'s data without computing it
    pub fn estimate(&mut self, node: NodeId) -> Result<CostEstimate> {
        let dc = self.item_dc(node)?;
        self.estimate_dc(dc)
    }

    /// Latch polled by long walks
    pub fn suspend(&self) -> &SuspendTrigger {
        &self.suspend
    }

    /// Counters so far
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// `None` without a cache
    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(|c| c.stats())
    }

    /// Keep `node`'s controllers and payload through garbage collection
    pub fn retain_node(&self, node: NodeId) -> Option<InterestGuard> {
        self.tree.get(node).map(|n| n.interest.guard())
    }

    /// `None` once the controller was collected
    pub fn dc_state(&self, dc: DcId) -> Option<DcState> {
        self.dcs.get(dc).map(|d| d.state)
    }

    /// Number of live controllers
    pub fn dc_count(&self) -> usize {
        self.dcs.len()
    }

    /// Items with a rule, in tree order below `root`
    pub fn calculated_items(&self, root: NodeId) -> Vec<NodeId> {
        if !self.tree.contains(root) {
            return Vec::new();
        }
        self.tree
            .descendants(root)
            .into_iter()
            .filter(|n| {
                let node = self.tree.node(*n);
                node.has_calculator() && self.tree.in_template(*n).is_none()
            })
            .collect()
    }

    /// Compile every rule below `root`; returns the failing items
    pub fn check(&mut self, root: NodeId) -> Vec<(NodeId, CalcError)> {
        self.assert_owner();
        let _blocker = self.suspend.blocker();
        let mut failures = Vec::new();
        let mut visited = 0;
        // instantiation adds items, so walk until nothing new shows up
        loop {
            let items = self.calculated_items(root);
            if items.len() <= visited {
                break;
            }
            visited = items.len();
            for node in items {
                if !self.tree.contains(node) || failures.iter().any(|(n, _)| *n == node) {
                    continue;
                }
                if let Err(error) = certain(self.compile(node)) {
                    failures.push((node, error));
                }
            }
        }
        debug!(failures = failures.len(), "rules checked");
        failures
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("tree", &self.tree)
            .field("dcs", &self.dcs)
            .field("now", &self.now)
            .field("pending", &self.pending)
            .field("storages", &self.storages.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::DataMeta;

    #[test]
    fn best_item_stops_at_the_deepest_match() {
        let mut s = Session::new();
        let root = s.config_root();
        let a = s.create_item(root, "a", NodeKind::Container).unwrap();
        let b = s.create_item(a, "b", NodeKind::Container).unwrap();
        let c = s.create_item(b, "c", NodeKind::Data(DataMeta::default())).unwrap();

        assert_eq!(s.find_best_item(c, "a/b/x/y"), (b, "x/y".to_string()));
        assert_eq!(s.find_best_item(root, "/a/b/c"), (c, String::new()));
        assert_eq!(s.find_best_item(b, "../b/c"), (c, String::new()));
        assert_eq!(s.find_best_item(b, "zz/c"), (b, "zz/c".to_string()));
    }

    #[test]
    fn creating_items_advances_the_clock() {
        let mut s = Session::new();
        let before = s.now();
        let root = s.config_root();
        let a = s.create_item(root, "a", NodeKind::Container).unwrap();
        assert!(s.now() > before);
        assert_eq!(s.lookup("/a"), Some(a));
        assert_eq!(s.lookup("a"), Some(a));
        assert_eq!(s.lookup("/b"), None);
    }

    #[test]
    fn suspension_can_be_switched_off() {
        let s = Session::new().with_engine(EngineConfig {
            suspension: false,
            ..EngineConfig::default()
        });
        s.suspend().mark_progress();
        s.suspend().do_suspend();
        assert!(!s.suspend().must_suspend());
    }
}
