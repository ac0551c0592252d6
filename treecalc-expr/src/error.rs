use std::fmt;

pub use treecalc_types::Span;

/// Errors produced while reading expression text
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExprError {
    #[error("Lexer error at {span:?}: {message}")]
    LexerError { span: Span, message: String },

    #[error("Parser error at {span:?}: {message}")]
    ParserError { span: Span, message: String },

    #[error("Unexpected end of expression at {span:?}: expected {expected}")]
    UnexpectedEnd { span: Span, expected: String },

    #[error("Invalid literal at {span:?}: {text}")]
    InvalidLiteral { span: Span, text: String },
}

pub type Result<T> = std::result::Result<T, ExprError>;

impl ExprError {
    pub fn span(&self) -> Span {
        match self {
            ExprError::LexerError { span, .. } => *span,
            ExprError::ParserError { span, .. } => *span,
            ExprError::UnexpectedEnd { span, .. } => *span,
            ExprError::InvalidLiteral { span, .. } => *span,
        }
    }
}

/// Display context for better error messages
pub struct ErrorContext<'a> {
    pub source: &'a str,
    pub error: &'a ExprError,
}

impl<'a> ErrorContext<'a> {
    pub fn new(source: &'a str, error: &'a ExprError) -> Self {
        Self { source, error }
    }

    /// Get line and column numbers (1-indexed)
    pub fn line_col(&self) -> (usize, usize) {
        let start = self.error.span().start.min(self.source.len());
        let line = self.source[..start].matches('\n').count() + 1;
        let line_start = self.source[..start].rfind('\n').map(|pos| pos + 1).unwrap_or(0);
        (line, start - line_start + 1)
    }

    fn source_line(&self) -> &'a str {
        let start = self.error.span().start.min(self.source.len());
        let line_start = self.source[..start].rfind('\n').map(|pos| pos + 1).unwrap_or(0);
        let line_end = self.source[start..]
            .find('\n')
            .map(|pos| start + pos)
            .unwrap_or(self.source.len());
        &self.source[line_start..line_end]
    }
}

impl<'a> fmt::Display for ErrorContext<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (line, col) = self.line_col();
        writeln!(f, "Error at line {}, column {}:", line, col)?;
        writeln!(f, "  {}", self.error)?;
        let source_line = self.source_line();
        writeln!(f)?;
        writeln!(f, "  {}", source_line)?;
        let width = self.error.span().len().clamp(1, (source_line.len() + 1).saturating_sub(col - 1).max(1));
        writeln!(f, "  {}{}", " ".repeat(col - 1), "^".repeat(width))
    }
}
