//! Reader for the canonical S-expression form printed by `Expr`'s `Display`

use crate::error::{ExprError, Result, Span};
use crate::expr::Expr;
use crate::lexer::{tokenize, SpannedToken, Token};
use crate::symbol::Symbol;

/// Read one S-expression, e.g. `(add (sourceDescr "/a") 1)`
pub fn read_sexpr(source: &str) -> Result<Expr> {
    let tokens = tokenize(source)?;
    let mut pos = 0;
    let expr = read(&tokens, &mut pos)?;
    match tokens.get(pos) {
        Some(SpannedToken {
            token: Token::Eof, ..
        }) => Ok(expr),
        Some(t) => Err(ExprError::ParserError {
            span: t.span,
            message: "trailing input after expression".to_string(),
        }),
        None => Ok(expr),
    }
}

fn read(tokens: &[SpannedToken], pos: &mut usize) -> Result<Expr> {
    let Some(current) = tokens.get(*pos) else {
        return Err(ExprError::UnexpectedEnd {
            span: Span::default(),
            expected: "an expression".to_string(),
        });
    };
    *pos += 1;
    match &current.token {
        Token::LParen => {
            let mut items = Vec::new();
            loop {
                match tokens.get(*pos).map(|t| &t.token) {
                    Some(Token::RParen) => {
                        *pos += 1;
                        return Ok(Expr::list(items));
                    }
                    Some(Token::Eof) | None => {
                        return Err(ExprError::UnexpectedEnd {
                            span: current.span,
                            expected: "')'".to_string(),
                        })
                    }
                    _ => items.push(read(tokens, pos)?),
                }
            }
        }
        Token::Identifier(name) => Ok(match name.as_str() {
            "NaN" => Expr::Float(f64::NAN),
            "inf" => Expr::Float(f64::INFINITY),
            _ => Expr::Symbol(Symbol::intern(name)),
        }),
        Token::UIntLiteral(n) => Ok(Expr::UInt(*n)),
        Token::FloatLiteral(x) => Ok(Expr::Float(*x)),
        Token::StringLiteral(s) => Ok(Expr::string(s)),
        Token::Minus => {
            let negated = tokens.get(*pos).map(|t| t.token.clone());
            *pos += 1;
            match negated {
                Some(Token::UIntLiteral(n)) if n <= i64::MAX as u64 => Ok(Expr::Int(-(n as i64))),
                Some(Token::FloatLiteral(x)) => Ok(Expr::Float(-x)),
                Some(Token::Identifier(name)) if name == "inf" => Ok(Expr::Float(f64::NEG_INFINITY)),
                _ => Err(ExprError::InvalidLiteral {
                    span: current.span,
                    text: "-".to_string(),
                }),
            }
        }
        other => Err(ExprError::ParserError {
            span: current.span,
            message: format!("unexpected {:?} in S-expression", other),
        }),
    }
}
