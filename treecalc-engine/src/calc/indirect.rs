//! Indirect rules
//!
//! A rule starting with `=` is itself computed: the remainder is evaluated
//! as a string and the resulting text is the rule. Each leading `=` is one
//! level of indirection, and `=` signs leading a computed text add levels.

use super::SubstitutionBuffer;
use crate::data::Value;
use crate::error::{CalcError, Flow};
use crate::oper::PolicyClass;
use crate::session::Session;
use crate::tree::NodeId;
use treecalc_expr::{parse_expr, Expr};

const MAX_INDIRECTIONS: usize = 64;

/// Strip leading `=` signs, returning their count and the rest
fn split_indirection(text: &str) -> (usize, &str) {
    let trimmed = text.trim_start();
    let rest = trimmed.trim_start_matches('=');
    (trimmed.len() - rest.len(), rest)
}

impl Session {
    pub(crate) fn evaluate_possible_string_expr(
        &mut self,
        ctx: NodeId,
        raw: &str,
        buf: &mut SubstitutionBuffer,
    ) -> Flow<String> {
        let (mut levels, rest) = split_indirection(raw);
        let mut text = rest.to_string();
        let mut rounds = 0;
        while levels > 0 {
            rounds += 1;
            if rounds > MAX_INDIRECTIONS {
                return Err(CalcError::IllegalExpression {
                    message: format!(
                        "more than {} levels of indirection in {}",
                        MAX_INDIRECTIONS,
                        self.tree.full_name(buf.holder)
                    ),
                }
                .into());
            }
            let expr = parse_expr(&text).map_err(|error| CalcError::Syntax {
                item: self.tree.full_name(buf.holder),
                error,
            })?;
            let key = self.subst(&expr, ctx, PolicyClass::Subst, buf)?;
            let value = self.eval_string(&key, buf)?;
            let (more, rest) = split_indirection(&value);
            levels = levels - 1 + more;
            text = rest.to_string();
        }
        Ok(text)
    }

    /// Compute `key` now and return its first element
    pub(crate) fn eval_scalar(&mut self, key: &Expr, buf: &mut SubstitutionBuffer) -> Flow<Value> {
        buf.data_dependent = true;
        let _blocker = self.suspend.blocker();
        let dc = self.get_or_create_dc(key.clone());
        let column = self.calc_dc_certain(dc)?;
        column
            .and_then(|c| c.get(0))
            .ok_or_else(|| {
                CalcError::Undefined {
                    what: format!("{} has no value", key),
                }
                .into()
            })
    }

    pub(crate) fn eval_string(&mut self, key: &Expr, buf: &mut SubstitutionBuffer) -> Flow<String> {
        match self.eval_scalar(key, buf)? {
            Value::String(s) => Ok(s),
            other => Err(CalcError::TypeMismatch {
                item: key.to_string(),
                expected: "String".to_string(),
                found: other.value_type().name().to_string(),
            }
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leading_equals_are_counted() {
        assert_eq!(split_indirection("a + b"), (0, "a + b"));
        assert_eq!(split_indirection(" ==name"), (2, "name"));
        assert_eq!(split_indirection("="), (1, ""));
    }
}
