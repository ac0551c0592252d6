//! Garbage collection
//!
//! Mark-sweep over the controller table. Roots are controllers with
//! interest, the controllers of nodes with interest and computations still
//! in flight; marking follows argument controllers. Swept controllers take
//! their result trees with them. Storage-loaded payloads nobody holds are
//! dropped too and read again on demand.

use crate::controller::{DcId, DcState};
use crate::data::DataWriteLock;
use crate::session::Session;
use hashbrown::HashSet;
use serde::Serialize;
use tracing::debug;

/// What one collection removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GcStats {
    /// Controllers swept
    pub dcs_removed: usize,
    /// Result nodes freed with their controllers
    pub nodes_removed: usize,
    /// Storage-loaded payloads released; read again on demand
    pub payloads_dropped: usize,
}

impl Session {
    /// Sweep controllers and payloads nothing holds an interest in
    pub fn collect_garbage(&mut self) -> GcStats {
        self.assert_owner();
        let _blocker = self.suspend.blocker();
        let marked = self.mark_live_dcs();

        let mut stats = GcStats::default();
        for id in self.dcs.ids() {
            if marked.contains(&id) {
                continue;
            }
            let d = self.dcs.dc(id);
            if matches!(d.state, DcState::MetaPending | DcState::DataPending) {
                continue;
            }
            let owned = d.owns_result.then_some(d.result).flatten();
            if let Some(result) = owned {
                stats.nodes_removed += self.tree.remove_subtree(result);
            }
            if self.dcs.remove(id).is_some() {
                stats.dcs_removed += 1;
            }
        }

        for node in self.tree.ids() {
            let n = self.tree.node(node);
            if !n.data_from_storage || n.interest.is_interesting() {
                continue;
            }
            let source_dc = self.dcs.lookup(&self.source_key(node));
            if source_dc.is_some_and(|dc| marked.contains(&dc)) {
                continue;
            }
            let n = self.tree.node_mut(node);
            DataWriteLock::new(&n.data).clear();
            n.data_from_storage = false;
            stats.payloads_dropped += 1;
            if let Some(dc) = source_dc {
                self.reset_dc(dc);
            }
        }

        self.metrics.record_collected(stats.dcs_removed as u64);
        debug!(
            dcs = stats.dcs_removed,
            nodes = stats.nodes_removed,
            payloads = stats.payloads_dropped,
            remaining = self.dcs.len(),
            "garbage collected"
        );
        stats
    }

    fn mark_live_dcs(&self) -> HashSet<DcId> {
        let mut stack = Vec::new();
        for id in self.dcs.ids() {
            let d = self.dcs.dc(id);
            if d.interest.is_interesting() || matches!(d.state, DcState::MetaPending | DcState::DataPending) {
                stack.push(id);
            }
        }
        for node in self.tree.ids() {
            let n = self.tree.node(node);
            if !n.interest.is_interesting() {
                continue;
            }
            if let Some(compiled) = n.preset.as_ref().or(n.compiled.as_ref()) {
                stack.extend(self.dcs.lookup(&compiled.key));
            }
            stack.extend(self.dcs.lookup(&self.source_key(node)));
        }

        let mut marked = HashSet::new();
        while let Some(id) = stack.pop() {
            if !marked.insert(id) {
                continue;
            }
            if let Some(d) = self.dcs.get(id) {
                stack.extend(d.arg_dcs());
            }
        }
        marked
    }
}
