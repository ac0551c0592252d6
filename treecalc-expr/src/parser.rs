//! Infix expression parser
//!
//! Precedence, lowest first:
//!
//! ```text
//! c ? a : b            iif
//! a || b, a or b       or
//! a && b, a and b      and
//! !a                   not
//! == = != <> < <= > >= comparisons
//! + -
//! * / %
//! ^                    pow
//! a!b  a->b            subitem, arrow
//! literals, names, f(args), (e), -e, +e, #e
//! ```

use crate::error::{ExprError, Result, Span};
use crate::expr::Expr;
use crate::lexer::{tokenize, SpannedToken, Token};
use crate::symbol::{self, Symbol};
use treecalc_types::ValueType;

/// Parse expression text into an [`Expr`]
pub fn parse_expr(source: &str) -> Result<Expr> {
    let tokens = tokenize(source)?;
    let mut parser = Parser::new(&tokens);
    let expr = parser.parse_expression()?;
    parser.expect_eof()?;
    Ok(expr)
}

/// Value type named by a numeric literal suffix such as `3u16`
fn suffix_type(suffix: &str) -> Option<ValueType> {
    match suffix {
        "u16" | "w" => Some(ValueType::UInt16),
        "u32" | "u" => Some(ValueType::UInt32),
        "i32" | "i" => Some(ValueType::Int32),
        "i64" => Some(ValueType::Int64),
        "f64" | "d" => Some(ValueType::Float64),
        "b" => Some(ValueType::Bool),
        _ => None,
    }
}

pub struct Parser<'a> {
    tokens: &'a [SpannedToken],
    pos: usize,
}

impl<'a> Parser<'a> {
    pub fn new(tokens: &'a [SpannedToken]) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> &Token {
        self.tokens
            .get(self.pos)
            .map(|t| &t.token)
            .unwrap_or(&Token::Eof)
    }

    fn current_span(&self) -> Span {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|t| t.span)
            .unwrap_or_default()
    }

    fn previous_span(&self) -> Span {
        self.pos
            .checked_sub(1)
            .and_then(|i| self.tokens.get(i))
            .map(|t| t.span)
            .unwrap_or_default()
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn check(&self, token: &Token) -> bool {
        self.peek() == token
    }

    fn consume(&mut self, token: &Token) -> bool {
        if self.check(token) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token, what: &str) -> Result<()> {
        if self.consume(&token) {
            Ok(())
        } else {
            Err(self.unexpected(what))
        }
    }

    fn unexpected(&self, expected: &str) -> ExprError {
        let span = self.current_span();
        match self.peek() {
            Token::Eof => ExprError::UnexpectedEnd {
                span,
                expected: expected.to_string(),
            },
            found => ExprError::ParserError {
                span,
                message: format!("expected {}, found {:?}", expected, found),
            },
        }
    }

    pub fn expect_eof(&self) -> Result<()> {
        if self.check(&Token::Eof) {
            Ok(())
        } else {
            Err(self.unexpected("end of expression"))
        }
    }

    pub fn parse_expression(&mut self) -> Result<Expr> {
        let cond = self.parse_or()?;
        if !self.consume(&Token::Question) {
            return Ok(cond);
        }
        let then = self.parse_expression()?;
        self.expect(Token::Colon, "':' of conditional expression")?;
        let otherwise = self.parse_expression()?;
        Ok(Expr::call(symbol::IIF, vec![cond, then, otherwise]))
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_and()?;
        while self.consume(&Token::OrOr) || self.consume(&Token::Or) {
            let rhs = self.parse_and()?;
            lhs = Expr::call(symbol::OR, vec![lhs, rhs]);
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_not()?;
        while self.consume(&Token::AndAnd) || self.consume(&Token::And) {
            let rhs = self.parse_not()?;
            lhs = Expr::call(symbol::AND, vec![lhs, rhs]);
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if self.consume(&Token::Bang) {
            let operand = self.parse_not()?;
            return Ok(Expr::call(symbol::NOT, vec![operand]));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let lhs = self.parse_additive()?;
        let op = match self.peek() {
            Token::EqEq | Token::Eq => symbol::EQ,
            Token::NotEq | Token::LtGt => symbol::NE,
            Token::Lt => symbol::LT,
            Token::Le => symbol::LE,
            Token::Gt => symbol::GT,
            Token::Ge => symbol::GE,
            _ => return Ok(lhs),
        };
        self.advance();
        let rhs = self.parse_additive()?;
        Ok(Expr::call(op, vec![lhs, rhs]))
    }

    fn parse_additive(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_term()?;
        loop {
            let op = match self.peek() {
                Token::Plus => symbol::ADD,
                Token::Minus => symbol::SUB,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.parse_term()?;
            lhs = Expr::call(op, vec![lhs, rhs]);
        }
    }

    fn parse_term(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_power()?;
        loop {
            let op = match self.peek() {
                Token::Star => symbol::MUL,
                Token::Slash => symbol::DIV,
                Token::Percent => symbol::MOD,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.parse_power()?;
            lhs = Expr::call(op, vec![lhs, rhs]);
        }
    }

    fn parse_power(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_compound()?;
        while self.consume(&Token::Caret) {
            let rhs = self.parse_compound()?;
            lhs = Expr::call(symbol::POW, vec![lhs, rhs]);
        }
        Ok(lhs)
    }

    fn parse_compound(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_element()?;
        loop {
            let head = match self.peek() {
                Token::Bang => symbol::SUBITEM,
                Token::Arrow => symbol::ARROW,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.parse_element()?;
            lhs = Expr::call(head, vec![lhs, rhs]);
        }
    }

    fn parse_element(&mut self) -> Result<Expr> {
        match self.advance() {
            Token::UIntLiteral(n) => Ok(self.with_suffix(Expr::UInt(n))),
            Token::FloatLiteral(x) => Ok(self.with_suffix(Expr::Float(x))),
            Token::StringLiteral(s) => Ok(Expr::string(&s)),
            Token::Identifier(name) => {
                let head = Symbol::intern(&name);
                if self.consume(&Token::LParen) {
                    let args = self.parse_args()?;
                    Ok(Expr::call(head, args))
                } else {
                    Ok(Expr::Symbol(head))
                }
            }
            Token::LParen => {
                let inner = self.parse_expression()?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Token::Plus => self.parse_element(),
            Token::Minus => Ok(match self.parse_element()? {
                Expr::UInt(n) if n <= i64::MAX as u64 => Expr::Int(-(n as i64)),
                Expr::Float(x) => Expr::Float(-x),
                operand => Expr::call(symbol::NEG, vec![operand]),
            }),
            Token::Hash => {
                let operand = self.parse_element()?;
                Ok(Expr::call(symbol::NR_OF_ROWS, vec![operand]))
            }
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.unexpected("an operand"))
            }
        }
    }

    /// Comma separated arguments; the opening parenthesis is consumed
    fn parse_args(&mut self) -> Result<Vec<Expr>> {
        let mut args = Vec::new();
        if self.consume(&Token::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.parse_expression()?);
            if self.consume(&Token::Comma) {
                continue;
            }
            self.expect(Token::RParen, "',' or ')'")?;
            return Ok(args);
        }
    }

    /// Wrap a literal in a cast when a type suffix directly follows it
    fn with_suffix(&mut self, literal: Expr) -> Expr {
        let literal_end = self.previous_span().end;
        if let Some(next) = self.tokens.get(self.pos) {
            if let Token::Identifier(suffix) = &next.token {
                if next.span.start == literal_end {
                    if let Some(vt) = suffix_type(suffix) {
                        self.advance();
                        return Expr::call(Symbol::intern(vt.name()), vec![literal]);
                    }
                }
            }
        }
        literal
    }
}
