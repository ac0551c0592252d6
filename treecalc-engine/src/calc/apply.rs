//! Meta functions and template instantiation
//!
//! Both run while the holder's rule is compiled and leave their result in
//! the tree: generated children, marked endogenous, that are replaced as a
//! whole when the holder is compiled again.

use super::{Compiled, MetaInfo, SubstitutionBuffer};
use crate::error::{CalcError, Flow};
use crate::oper::{OperContext, OperGroup, PolicyClass, ResultSlot};
use crate::session::Session;
use crate::tree::{CopyTreeContext, NodeId};
use std::rc::Rc;
use std::sync::Arc;
use tracing::debug;
use treecalc_expr::Expr;

impl Session {
    pub(crate) fn apply_meta_function(
        &mut self,
        holder: NodeId,
        ctx: NodeId,
        group: &Arc<OperGroup>,
        expr: &Expr,
        buf: &mut SubstitutionBuffer,
    ) -> Flow<()> {
        let _blocker = self.suspend.blocker();
        self.remove_endogenous(holder);

        let mut args = Vec::with_capacity(expr.args().len());
        let mut first = None;
        for (i, arg) in expr.args().iter().enumerate() {
            let policy = group.policies.policy(i, first.as_ref());
            let key = self.subst(arg, ctx, policy.class(), buf)?;
            let arg_ref = self.arg_ref_for(&key, policy)?;
            if i == 0 && group.policies.is_dynamic() {
                first = Some(self.eval_scalar(&key, buf)?);
            }
            args.push(arg_ref);
        }
        let oper = group.find_oper_by_args(&args)?;
        let mut slot = ResultSlot {
            holder: Some(holder),
            result: None,
        };
        oper.create_result(&mut OperContext::new(self, None), &mut slot, &args, true)?;
        self.tree.node_mut(holder).flags.instantiated = true;
        debug!(
            holder = %self.tree.full_name(holder),
            function = %group.name,
            children = self.tree.children(holder).count(),
            "meta function applied"
        );
        Ok(())
    }

    /// Copy `template` into `holder`; the first children of the copy become
    /// the parameters bound to the actual arguments of `expr`
    pub(crate) fn instantiate_template(
        &mut self,
        holder: NodeId,
        ctx: NodeId,
        template: NodeId,
        expr: &Expr,
        buf: &mut SubstitutionBuffer,
    ) -> Flow<()> {
        let _blocker = self.suspend.blocker();
        let name = self.tree.full_name(template);
        let arity = self.tree.children(template).count();
        let given = expr.args().len();
        if given > arity {
            return Err(CalcError::IllegalExpression {
                message: format!("{} takes at most {} arguments, {} given", name, arity, given),
            }
            .into());
        }

        let now = self.now;
        let mut presets = Vec::with_capacity(given);
        for arg in expr.args() {
            let mut arg_buf = SubstitutionBuffer::new(holder);
            let key = match self.subst(arg, ctx, PolicyClass::Subst, &mut arg_buf) {
                Ok(key) => key,
                Err(e) => {
                    buf.failed_supplier = arg_buf.failed_supplier;
                    return Err(e);
                }
            };
            buf.suppliers.extend(arg_buf.suppliers.as_slice());
            buf.data_dependent |= arg_buf.data_dependent;
            let info = match self.source_node(&key) {
                Some(node) => MetaInfo::Alias(node),
                None => MetaInfo::Key,
            };
            presets.push(Rc::new(Compiled {
                info,
                key,
                suppliers: arg_buf.suppliers.into_rc(),
                at: now,
                data_dependent: arg_buf.data_dependent,
            }));
        }
        buf.register(template);

        self.remove_endogenous(holder);
        let pairs = self.tree.copy_children(template, holder, CopyTreeContext { endogenous: true, now });
        let params = pairs
            .iter()
            .filter(|(src, _)| self.tree.parent(*src) == Some(template))
            .map(|(_, copy)| *copy)
            .collect::<Vec<_>>();
        for (param, preset) in params.into_iter().zip(presets) {
            let n = self.tree.node_mut(param);
            n.preset = Some(preset);
            n.compiled = None;
        }
        self.tree.node_mut(holder).flags.instantiated = true;
        debug!(
            holder = %self.tree.full_name(holder),
            template = %name,
            arguments = given,
            copied = pairs.len(),
            "template instantiated"
        );
        Ok(())
    }

    /// Drop the children a previous instantiation generated
    pub(crate) fn remove_endogenous(&mut self, holder: NodeId) {
        let generated: Vec<NodeId> = self
            .tree
            .children(holder)
            .filter(|c| self.tree.node(*c).flags.endogenous)
            .collect();
        for child in generated {
            self.tree.remove_subtree(child);
        }
    }
}
