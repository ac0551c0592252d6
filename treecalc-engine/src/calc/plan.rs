//! Compile planning
//!
//! Orders the uncompiled calculated suppliers of a node so they can be
//! compiled leaves first. The walk keeps its own stack, so supplier chains
//! and cycles of any length cost heap, not call depth.

use super::Resolved;
use crate::error::{CalcError, Flow, Interrupt};
use crate::session::Session;
use crate::tree::NodeId;
use hashbrown::{HashMap, HashSet};
use tracing::debug;
use treecalc_expr::{parse_expr, symbol, Expr};
use treecalc_types::ValueType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    /// On the walk stack
    Grey,
    /// Finished
    Black,
}

struct Frame {
    node: NodeId,
    deps: Vec<NodeId>,
    next: usize,
}

impl Session {
    /// Calculated items the rule of `node` names syntactically, in order of
    /// appearance. Best effort: anything not found here is still compiled on
    /// demand during substitution.
    fn direct_deps(&self, node: NodeId) -> Vec<NodeId> {
        let Some(raw) = self.tree.node(node).expr.as_deref() else {
            return Vec::new();
        };
        // indirect rules only reveal their suppliers when evaluated
        if raw.trim_start().starts_with('=') {
            return Vec::new();
        }
        let Ok(expr) = parse_expr(raw) else {
            return Vec::new();
        };
        let ctx = self.search_context(node);

        let mut deps = Vec::new();
        let mut seen = HashSet::new();
        let mut stack: Vec<&Expr> = vec![&expr];
        while let Some(e) = stack.pop() {
            match e {
                Expr::Symbol(sym) => {
                    let name = sym.as_str();
                    if *sym == symbol::THIS || ValueType::from_name(&name).is_some() {
                        continue;
                    }
                    let found = match self.resolve_quiet(ctx, node, &name) {
                        Resolved::Found(n) | Resolved::Blocked(n) => n,
                        Resolved::Missing => continue,
                    };
                    if found != node && self.is_plan_candidate(found) && seen.insert(found) {
                        deps.push(found);
                    }
                }
                Expr::List(_) => {
                    let args = e.args();
                    let head = e.head();
                    let picked: Vec<&Expr> = match head {
                        Some(symbol::SOURCE) => Vec::new(),
                        Some(symbol::SCOPE) | Some(symbol::ARROW) | Some(symbol::SUBITEM) => {
                            args.iter().take(1).collect()
                        }
                        Some(h) => match self.registry.get(h) {
                            Some(group) if group.policies.is_dynamic() => args.iter().take(1).collect(),
                            Some(group) => args
                                .iter()
                                .enumerate()
                                .filter(|(i, _)| group.policies.policy(*i, None).is_computed())
                                .map(|(_, a)| a)
                                .collect(),
                            None => args.iter().collect(),
                        },
                        None => Vec::new(),
                    };
                    stack.extend(picked.into_iter().rev());
                }
                _ => {}
            }
        }
        deps
    }

    fn is_plan_candidate(&self, node: NodeId) -> bool {
        let n = self.tree.node(node);
        n.has_calculator()
            && self.tree.in_template(node).is_none()
            && !self.has_meta_fail(node)
            && self.valid_compiled(node).is_none()
    }

    /// Uncompiled suppliers of `root` in post order, `root` excluded
    ///
    /// A cycle through `root` fails the compilation; a cycle elsewhere is
    /// recorded on its members and left for the dependents to report.
    pub(crate) fn plan_compile(&mut self, root: NodeId) -> Flow<Vec<NodeId>> {
        let mut marks: HashMap<NodeId, Mark> = HashMap::new();
        let mut order = Vec::new();
        let mut stack = vec![Frame {
            node: root,
            deps: self.direct_deps(root),
            next: 0,
        }];
        marks.insert(root, Mark::Grey);

        loop {
            let Some(top) = stack.last_mut() else { break };
            if top.next == top.deps.len() {
                let done = top.node;
                stack.pop();
                marks.insert(done, Mark::Black);
                if done != root {
                    order.push(done);
                }
                continue;
            }
            let dep = top.deps[top.next];
            top.next += 1;
            if self.compile_stack.contains(&dep) {
                continue;
            }
            match marks.get(&dep) {
                Some(Mark::Black) => {}
                Some(Mark::Grey) => {
                    let start = stack.iter().position(|f| f.node == dep).unwrap_or(0);
                    let members: Vec<NodeId> = stack[start..].iter().map(|f| f.node).collect();
                    self.record_cycle(&members);
                    if members.contains(&root) {
                        return Err(self.circular(root));
                    }
                }
                None => {
                    if self.suspend.must_suspend() {
                        return Err(Interrupt::Suspended);
                    }
                    marks.insert(dep, Mark::Grey);
                    let deps = self.direct_deps(dep);
                    stack.push(Frame { node: dep, deps, next: 0 });
                }
            }
        }
        Ok(order)
    }

    fn record_cycle(&mut self, members: &[NodeId]) {
        debug!(
            size = members.len(),
            first = %self.tree.full_name(members[0]),
            "dependency cycle"
        );
        for &m in members {
            if self.has_meta_fail(m) {
                continue;
            }
            let error = CalcError::CircularDependency {
                item: self.tree.full_name(m),
            };
            self.record_meta_fail(m, error, m);
        }
    }
}
