//! Edits and invalidation
//!
//! Every edit advances the session clock. Compiled rules are checked
//! against the `meta_changed` stamps of their suppliers on next use, data
//! against the `data_at` stamps of argument controllers, so an edit only
//! needs to stamp what it touched and drop memoized failures that may no
//! longer hold.

use crate::controller::{DcId, DcState};
use crate::data::{Column, DataWriteLock};
use crate::error::{CalcError, Result};
use crate::props::{set_prop_raw, PropError};
use crate::session::Session;
use crate::tree::{DataMeta, NodeId, NodeKind};
use hashbrown::HashSet;
use std::sync::Arc;
use tracing::debug;
use treecalc_types::FailPhase;

impl Session {
    /// Replace the calculation rule of `node`
    pub fn set_expr(&mut self, node: NodeId, expr: &str) -> Result<()> {
        self.assert_owner();
        self.live(node)?;
        self.now = self.now.next();
        let now = self.now;
        let trimmed = expr.trim();
        let n = self.tree.node_mut(node);
        n.expr = (!trimmed.is_empty()).then(|| trimmed.to_string());
        n.meta_changed = now;
        n.compiled = None;
        n.preset = None;
        // instances registered the template as a supplier
        if let Some(template) = self.tree.in_template(node) {
            self.tree.node_mut(template).meta_changed = now;
        }
        self.clear_fails(None);
        self.invalidate_source(node);
        debug!(item = %self.tree.full_name(node), expr = trimmed, "rule changed");
        Ok(())
    }

    /// Supply the payload of an uncalculated item
    pub fn set_data(&mut self, node: NodeId, column: Column) -> Result<()> {
        self.assert_owner();
        self.live(node)?;
        let n = self.tree.node(node);
        if n.has_calculator() {
            return Err(CalcError::IllegalExpression {
                message: format!("{} is calculated; its data cannot be set", self.tree.full_name(node)),
            });
        }
        match n.kind {
            NodeKind::Container => {
                return Err(CalcError::IllegalExpression {
                    message: format!("{} is a container and holds no data", self.tree.full_name(node)),
                })
            }
            NodeKind::Data(DataMeta { value_type: Some(vt), .. }) if vt != column.value_type() => {
                return Err(CalcError::TypeMismatch {
                    item: self.tree.full_name(node),
                    expected: vt.name().to_string(),
                    found: column.value_type().name().to_string(),
                })
            }
            _ => {}
        }

        self.now = self.now.next();
        let now = self.now;
        self.data_epoch = now;
        let len = column.len();
        let n = self.tree.node_mut(node);
        DataWriteLock::new(&n.data).commit(Arc::new(column));
        n.data_changed = now;
        n.data_from_storage = false;
        if n.kind.is_unit() {
            // element counts feed result shapes
            n.meta_changed = now;
        }
        self.clear_fails(None);
        debug!(item = %self.tree.full_name(node), len, "data set");
        Ok(())
    }

    /// Set a property by name; `Expr` goes through [`Session::set_expr`]
    pub fn set_prop(&mut self, node: NodeId, name: &str, value: &str) -> std::result::Result<(), PropError> {
        if name.eq_ignore_ascii_case("Expr") {
            return self.set_expr(node, value).map_err(|_| PropError::Removed);
        }
        self.assert_owner();
        set_prop_raw(&mut self.tree, node, name, value)?;
        self.now = self.now.next();
        self.tree.node_mut(node).meta_changed = self.now;
        self.clear_fails(Some(FailPhase::MetaInfo));
        self.invalidate_source(node);
        debug!(item = %self.tree.full_name(node), prop = name, value, "property changed");
        Ok(())
    }

    /// Forget memoized failures of `phase`, or of every phase
    pub(crate) fn clear_fails(&mut self, phase: Option<FailPhase>) {
        if !self.fails_recorded {
            return;
        }
        let matches = |p: FailPhase| phase.map_or(true, |want| want == p);
        for node in self.tree.ids() {
            let n = self.tree.node_mut(node);
            if n.fail.as_ref().is_some_and(|f| matches(f.phase)) {
                n.fail = None;
            }
        }
        for dc in self.dcs.ids() {
            match self.dcs.dc(dc).state {
                DcState::MetaFailed if matches(FailPhase::MetaInfo) => self.reset_dc(dc),
                DcState::DataFailed if matches(FailPhase::Data) => {
                    let d = self.dcs.dc_mut(dc);
                    d.state = DcState::MetaReady;
                    d.fail = None;
                }
                _ => {}
            }
        }
        if phase.is_none() {
            self.fails_recorded = false;
        }
    }

    /// Reset the source controller of `node` and every controller built on it
    fn invalidate_source(&mut self, node: NodeId) {
        let Some(source) = self.dcs.lookup(&self.source_key(node)) else {
            return;
        };
        let mut doomed: HashSet<DcId> = HashSet::new();
        doomed.insert(source);
        let ids = self.dcs.ids();
        loop {
            let before = doomed.len();
            for &dc in &ids {
                if !doomed.contains(&dc) && self.dcs.dc(dc).arg_dcs().any(|a| doomed.contains(&a)) {
                    doomed.insert(dc);
                }
            }
            if doomed.len() == before {
                break;
            }
        }
        for dc in doomed {
            if !matches!(self.dcs.dc(dc).state, DcState::MetaPending | DcState::DataPending) {
                self.reset_dc(dc);
            }
        }
    }
}
