//! Expression substitution
//!
//! Rewrites a parsed rule into its canonical key. Memoized per pass on
//! (search context, policy class, subexpression), so a subexpression
//! repeated in a rule is substituted once.

use super::SubstitutionBuffer;
use crate::data::Value;
use crate::error::{CalcError, Flow, Interrupt};
use crate::oper::{OperGroup, PolicyClass};
use crate::session::Session;
use crate::tree::{DataMeta, NodeId, NodeKind};
use std::sync::Arc;
use tracing::trace;
use treecalc_expr::{symbol, Expr, Symbol};
use treecalc_types::ValueType;

fn illegal(message: impl Into<String>) -> Interrupt {
    Interrupt::Failed(CalcError::IllegalExpression {
        message: message.into(),
    })
}

fn meta_call_not_allowed() -> Interrupt {
    illegal("meta function call not allowed as sub-expression")
}

fn binary_args<'e>(expr: &'e Expr) -> Flow<(&'e Expr, &'e Expr)> {
    match expr.args() {
        [left, right] => Ok((left, right)),
        _ => Err(illegal(format!("{} expects two operands", expr))),
    }
}

impl Session {
    pub(crate) fn subst(
        &mut self,
        expr: &Expr,
        ctx: NodeId,
        class: PolicyClass,
        buf: &mut SubstitutionBuffer,
    ) -> Flow<Expr> {
        if expr.is_literal() {
            return Ok(expr.clone());
        }
        let memo_key = (ctx, class, expr.clone());
        if let Some(done) = buf.memo.get(&memo_key) {
            return Ok(done.clone());
        }
        let out = match expr {
            Expr::Symbol(sym) => self.subst_symbol(*sym, ctx, class, buf)?,
            _ => self.subst_list(expr, ctx, class, buf)?,
        };
        trace!(%expr, key = %out, "substituted");
        buf.memo.insert(memo_key, out.clone());
        Ok(out)
    }

    fn subst_symbol(&mut self, sym: Symbol, ctx: NodeId, class: PolicyClass, buf: &mut SubstitutionBuffer) -> Flow<Expr> {
        if sym == symbol::THIS {
            return self.supplier_expr(buf.holder, class, buf);
        }
        let name = sym.as_str();
        if ValueType::from_name(&name).is_some() {
            return Ok(Expr::call(sym, Vec::new()));
        }
        let target = self.find_item(ctx, &name, buf)?;
        self.supplier_expr(target, class, buf)
    }

    fn subst_list(&mut self, expr: &Expr, ctx: NodeId, class: PolicyClass, buf: &mut SubstitutionBuffer) -> Flow<Expr> {
        let Some(head) = expr.head() else {
            return Err(illegal(format!("{} is not an operator call", expr)));
        };
        match head {
            symbol::SCOPE => {
                let (ns, body) = binary_args(expr)?;
                let ns = self.resolve_reference(ns, ctx, buf)?;
                let ns = self.follow(ns, buf)?;
                buf.register(ns);
                self.subst(body, ns, class, buf)
            }
            symbol::ARROW => {
                let (index, attr) = binary_args(expr)?;
                let lkey = self.subst(index, ctx, PolicyClass::Subst, buf)?;
                let values = self.values_unit(&lkey)?;
                let rkey = self.subst(attr, values, class, buf)?;
                Ok(Expr::call(symbol::LOOKUP, vec![lkey, rkey]))
            }
            symbol::SUBITEM => {
                let (container, path) = binary_args(expr)?;
                let container = self.resolve_reference(container, ctx, buf)?;
                buf.register(container);
                let pkey = self.subst(path, ctx, PolicyClass::Subst, buf)?;
                let path = self.eval_string(&pkey, buf)?;
                let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
                let target = self.descend(container, &parts, container, &path, buf)?;
                self.supplier_expr(target, class, buf)
            }
            symbol::SOURCE => {
                if let Some(node) = self.source_node(expr) {
                    buf.register(node);
                }
                Ok(expr.clone())
            }
            _ => match self.registry.get(head) {
                Some(group) if group.is_meta_function() => Err(meta_call_not_allowed()),
                Some(group) => self.subst_call(&group, expr, ctx, class, buf),
                None if self.find_template(ctx, head, buf.holder).is_some() => Err(meta_call_not_allowed()),
                None => Err(CalcError::UnknownOperator { name: head.to_string() }.into()),
            },
        }
    }

    /// Ordinary operator call, argument by argument under the group's
    /// policies. A dynamic group's first argument is computed before the
    /// policies of the others are known.
    fn subst_call(
        &mut self,
        group: &Arc<OperGroup>,
        expr: &Expr,
        ctx: NodeId,
        class: PolicyClass,
        buf: &mut SubstitutionBuffer,
    ) -> Flow<Expr> {
        let args = expr.args();
        let mut items = Vec::with_capacity(args.len() + 1);
        items.push(Expr::Symbol(group.name));
        if class != PolicyClass::Subst {
            for arg in args {
                items.push(self.subst(arg, ctx, class, buf)?);
            }
            return Ok(Expr::list(items));
        }
        let mut first: Option<Value> = None;
        for (i, arg) in args.iter().enumerate() {
            let policy = group.policies.policy(i, first.as_ref());
            let key = self.subst(arg, ctx, policy.class(), buf)?;
            if i == 0 && group.policies.is_dynamic() {
                first = Some(self.eval_scalar(&key, buf)?);
            }
            items.push(key);
        }
        Ok(Expr::list(items))
    }

    /// Canonical form of a reference from the buffer's holder to `target`
    pub(crate) fn supplier_expr(&mut self, target: NodeId, class: PolicyClass, buf: &mut SubstitutionBuffer) -> Flow<Expr> {
        if self.suspend.must_suspend() {
            return Err(Interrupt::Suspended);
        }
        let holder = buf.holder;
        let (calculated, template) = {
            let n = self.tree.node(target);
            (n.has_calculator(), self.tree.in_template(target))
        };

        if class == PolicyClass::Subst {
            if calculated && self.compile_stack.iter().any(|s| self.tree.does_contain(target, *s)) {
                return Err(self.circular(holder));
            }
            if let Some(t) = template {
                if !self.tree.does_contain(t, holder) {
                    return Err(CalcError::TemplateReference {
                        item: self.tree.full_name(target),
                    }
                    .into());
                }
            }
        }

        if class != PolicyClass::Subst || !calculated {
            buf.register(target);
            return Ok(self.source_key(target));
        }

        match self.compile(target) {
            Ok(compiled) => {
                buf.register(target);
                buf.suppliers.extend(&compiled.suppliers);
                Ok(compiled.key.clone())
            }
            Err(Interrupt::Suspended) => Err(Interrupt::Suspended),
            Err(Interrupt::Failed(e)) => Err(self.downstream(target, &e, buf)),
        }
    }

    fn resolve_reference(&mut self, expr: &Expr, ctx: NodeId, buf: &mut SubstitutionBuffer) -> Flow<NodeId> {
        match expr {
            Expr::Symbol(sym) if *sym == symbol::THIS => Ok(buf.holder),
            Expr::Symbol(sym) => self.find_item(ctx, &sym.as_str(), buf),
            Expr::Str(path) => self.find_item(ctx, path, buf),
            other => Err(illegal(format!("expected an item reference, found {}", other))),
        }
    }

    /// Unit an index key refers to, the search context of an arrow's
    /// right operand
    fn values_unit(&mut self, index_key: &Expr) -> Flow<NodeId> {
        let dc = self.get_or_create_dc(index_key.clone());
        let result = self.make_result(dc)?;
        match self.tree.node(result).kind {
            NodeKind::Data(DataMeta { values: Some(unit), .. }) => Ok(unit),
            _ => Err(illegal(format!(
                "{} has no values unit and cannot be used as an index",
                index_key
            ))),
        }
    }
}
