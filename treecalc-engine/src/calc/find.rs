//! Identifier resolution
//!
//! A path is looked up in the search context and then in its ancestors,
//! never below them; only the first component searches upwards, the rest
//! descend strictly. Absolute paths start at the configuration root.
//! Descending through a calculated container compiles it first, so the
//! children generated by a template call or meta function are visible, and
//! a container whose rule is a bare reference is followed to its target.

use super::{MetaInfo, SubstitutionBuffer};
use crate::error::{CalcError, Flow, Interrupt};
use crate::session::Session;
use crate::tree::{NodeId, NodeKind};
use treecalc_expr::Symbol;

/// Longest chain of container aliases followed in one step
const MAX_ALIAS_DEPTH: usize = 64;

/// Outcome of a lookup that neither compiles nor fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resolved {
    Found(NodeId),
    /// Stopped at a calculated container that is not compiled yet
    Blocked(NodeId),
    Missing,
}

fn components(path: &str) -> Vec<&str> {
    path.split('/').filter(|p| !p.is_empty()).collect()
}

impl Session {
    /// Resolve `path` from `ctx`, compiling containers on the way
    pub(crate) fn find_item(&mut self, ctx: NodeId, path: &str, buf: &mut SubstitutionBuffer) -> Flow<NodeId> {
        if path.starts_with("/#") {
            return self.node_by_full_name(path).ok_or_else(|| self.unknown(ctx, path, None));
        }
        let parts = components(path);
        if path.starts_with('/') {
            return self.descend(self.config_root, &parts, ctx, path, buf);
        }
        let Some((first, rest)) = parts.split_first() else {
            return Err(self.unknown(ctx, path, None));
        };
        if *first == "." || *first == ".." {
            return self.descend(ctx, &parts, ctx, path, buf);
        }
        let mut scope = Some(ctx);
        while let Some(s) = scope {
            if let Some(found) = self.child_of(s, first, buf)? {
                return self.descend(found, rest, ctx, path, buf);
            }
            scope = self.tree.parent(s);
        }
        Err(self.unknown(ctx, path, None))
    }

    /// Follow `parts` strictly downwards from `start`
    pub(crate) fn descend(
        &mut self,
        start: NodeId,
        parts: &[&str],
        ctx: NodeId,
        path: &str,
        buf: &mut SubstitutionBuffer,
    ) -> Flow<NodeId> {
        let mut cur = start;
        for part in parts {
            let next = match *part {
                "." => Some(cur),
                ".." => self.tree.parent(cur),
                name => self.child_of(cur, name, buf)?,
            };
            match next {
                Some(n) => cur = n,
                None => return Err(self.unknown(ctx, path, Some(cur))),
            }
        }
        Ok(cur)
    }

    /// Child `name` of `parent`, looking through the parent's rule
    fn child_of(&mut self, parent: NodeId, name: &str, buf: &mut SubstitutionBuffer) -> Flow<Option<NodeId>> {
        // ancestors of the holder are already instantiated
        let parent = if self.tree.does_contain(parent, buf.holder) {
            parent
        } else {
            self.follow(parent, buf)?
        };
        Ok(Symbol::lookup(name).and_then(|sym| self.tree.child(parent, sym)))
    }

    /// Compile a calculated container and follow it if it is an alias
    pub(crate) fn follow(&mut self, node: NodeId, buf: &mut SubstitutionBuffer) -> Flow<NodeId> {
        let mut cur = node;
        for _ in 0..MAX_ALIAS_DEPTH {
            let n = self.tree.node(cur);
            if !matches!(n.kind, NodeKind::Container) || !n.has_calculator() || self.compile_stack.contains(&cur) {
                return Ok(cur);
            }
            match self.compile(cur) {
                Ok(compiled) => {
                    buf.register(cur);
                    buf.suppliers.extend(&compiled.suppliers);
                    match compiled.info {
                        MetaInfo::Alias(target) => cur = target,
                        _ => return Ok(cur),
                    }
                }
                Err(Interrupt::Suspended) => return Err(Interrupt::Suspended),
                Err(Interrupt::Failed(e)) => return Err(self.downstream(cur, &e, buf)),
            }
        }
        Err(CalcError::IllegalExpression {
            message: format!("alias chain starting at {} is too long", self.tree.full_name(node)),
        }
        .into())
    }

    /// Failure of `supplier` as seen from the buffer's holder
    pub(crate) fn downstream(&self, supplier: NodeId, cause: &CalcError, buf: &mut SubstitutionBuffer) -> Interrupt {
        let origin = self
            .tree
            .get(supplier)
            .and_then(|n| n.fail.as_ref())
            .and_then(|f| f.source)
            .unwrap_or(supplier);
        buf.failed_supplier = Some(origin);
        Interrupt::Failed(CalcError::downstream(
            self.tree.full_name(buf.holder),
            &self.tree.full_name(supplier),
            cause,
        ))
    }

    fn unknown(&self, ctx: NodeId, path: &str, reached: Option<NodeId>) -> Interrupt {
        Interrupt::Failed(CalcError::UnknownIdentifier {
            name: path.to_string(),
            context: self.tree.full_name(ctx),
            best_guess: reached.map(|n| self.tree.full_name(n)),
        })
    }

    /// Tree-only lookup: no compilation, no registration
    pub(crate) fn resolve_quiet(&self, ctx: NodeId, holder: NodeId, path: &str) -> Resolved {
        if path.starts_with("/#") {
            return self.node_by_full_name(path).map_or(Resolved::Missing, Resolved::Found);
        }
        let parts = components(path);
        let (start, rest) = if path.starts_with('/') {
            (self.config_root, &parts[..])
        } else {
            match parts.split_first() {
                Some((first, _)) if *first == "." || *first == ".." => (ctx, &parts[..]),
                Some((first, rest)) => {
                    let mut scope = Some(ctx);
                    let mut found = None;
                    while let Some(s) = scope {
                        let s = if self.tree.does_contain(s, holder) {
                            s
                        } else {
                            match self.follow_quiet(s) {
                                Ok(s) => s,
                                Err(blocked) => return Resolved::Blocked(blocked),
                            }
                        };
                        if let Some(c) = Symbol::lookup(first).and_then(|sym| self.tree.child(s, sym)) {
                            found = Some(c);
                            break;
                        }
                        scope = self.tree.parent(s);
                    }
                    match found {
                        Some(f) => (f, rest),
                        None => return Resolved::Missing,
                    }
                }
                None => return Resolved::Missing,
            }
        };
        let mut cur = start;
        for part in rest {
            cur = match *part {
                "." => cur,
                ".." => match self.tree.parent(cur) {
                    Some(p) => p,
                    None => return Resolved::Missing,
                },
                name => {
                    let parent = if self.tree.does_contain(cur, holder) {
                        cur
                    } else {
                        match self.follow_quiet(cur) {
                            Ok(p) => p,
                            Err(blocked) => return Resolved::Blocked(blocked),
                        }
                    };
                    match Symbol::lookup(name).and_then(|sym| self.tree.child(parent, sym)) {
                        Some(c) => c,
                        None => return Resolved::Missing,
                    }
                }
            };
        }
        Resolved::Found(cur)
    }

    /// Follow compiled container aliases; `Err` names a container that
    /// must be compiled first
    fn follow_quiet(&self, node: NodeId) -> Result<NodeId, NodeId> {
        let mut cur = node;
        for _ in 0..MAX_ALIAS_DEPTH {
            let n = self.tree.node(cur);
            if !matches!(n.kind, NodeKind::Container) || !n.has_calculator() || self.compile_stack.contains(&cur) {
                return Ok(cur);
            }
            match self.valid_compiled(cur) {
                Some(c) => match c.info {
                    MetaInfo::Alias(target) => cur = target,
                    _ => return Ok(cur),
                },
                None if self.has_meta_fail(cur) => return Ok(cur),
                None => return Err(cur),
            }
        }
        Ok(cur)
    }

    /// Template named by the head of a call, if any
    pub(crate) fn find_template(&self, ctx: NodeId, head: Symbol, holder: NodeId) -> Option<NodeId> {
        match self.resolve_quiet(ctx, holder, &head.as_str()) {
            Resolved::Found(n) if self.tree.node(n).flags.is_template => Some(n),
            _ => None,
        }
    }

    /// Node printed as `full_name`; `/#name/...` paths start at another root
    pub(crate) fn node_by_full_name(&self, full_name: &str) -> Option<NodeId> {
        if full_name == "/" {
            return Some(self.config_root);
        }
        if let Some(rest) = full_name.strip_prefix('/').filter(|r| r.starts_with('#')) {
            let (root_name, path) = rest.split_once('/').unwrap_or((rest, ""));
            let sym = Symbol::lookup(root_name)?;
            let root = self
                .tree
                .roots()
                .iter()
                .copied()
                .find(|r| self.tree.node(*r).name == sym)?;
            return self.tree.walk_path(root, path).ok();
        }
        self.tree.walk_path(self.config_root, full_name).ok()
    }

    /// Source node of a `(sourceDescr "/path")` key
    pub(crate) fn source_node(&self, key: &treecalc_expr::Expr) -> Option<NodeId> {
        if !key.is_call_of(treecalc_expr::symbol::SOURCE) {
            return None;
        }
        key.args()
            .first()
            .and_then(treecalc_expr::Expr::as_str)
            .and_then(|p| self.node_by_full_name(p))
    }
}
