//! Severity-tagged diagnostics with source spans, hints, and related notes.
//!
//! Mirrors the shape validation, compilation, and security passes all share:
//! a single `Diagnostic` type accumulated in order by a `DiagnosticBuilder`,
//! with fluent helpers for attaching a hint or related note to the entry that
//! was just pushed.

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

use crate::lexer::Position;

/// Severity of a diagnostic message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Error,
    Warning,
    Info,
    Hint,
}

impl Severity {
    fn glyph(self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
            Severity::Hint => "hint",
        }
    }
}

/// A source span: start and end position, each `(line, column, byte_offset)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Position,
    pub end: Position,
}

impl Span {
    pub fn new(start: Position, end: Position) -> Self {
        Self { start, end }
    }

    /// Merge two spans into one covering both.
    pub fn merge(a: Span, b: Span) -> Span {
        let start = if a.start.offset <= b.start.offset {
            a.start
        } else {
            b.start
        };
        let end = if a.end.offset >= b.end.offset {
            a.end
        } else {
            b.end
        };
        Span { start, end }
    }

    /// True if the span begins and ends on the same line.
    pub fn is_single_line(&self) -> bool {
        self.start.line == self.end.line
    }
}

/// A related location attached to a diagnostic (e.g. "previous declaration here").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelatedNote {
    pub message: String,
    pub span: Span,
}

/// A single diagnostic message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub span: Span,
    pub code: Option<String>,
    pub hint: Option<String>,
    pub related: Vec<RelatedNote>,
}

impl Diagnostic {
    pub fn new(severity: Severity, message: impl Into<String>, span: Span) -> Self {
        Self {
            severity,
            message: message.into(),
            span,
            code: None,
            hint: None,
            related: Vec::new(),
        }
    }

    pub fn error(message: impl Into<String>, span: Span) -> Self {
        Self::new(Severity::Error, message, span)
    }

    pub fn warning(message: impl Into<String>, span: Span) -> Self {
        Self::new(Severity::Warning, message, span)
    }

    pub fn info(message: impl Into<String>, span: Span) -> Self {
        Self::new(Severity::Info, message, span)
    }

    pub fn hint_diag(message: impl Into<String>, span: Span) -> Self {
        Self::new(Severity::Hint, message, span)
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_related(mut self, message: impl Into<String>, span: Span) -> Self {
        self.related.push(RelatedNote {
            message: message.into(),
            span,
        });
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

/// Accumulates diagnostics in emission order.
///
/// `.hint()`/`.related()` attach to whichever diagnostic was pushed most
/// recently, so callers can write `builder.push(diag).hint("...")` style
/// chains without holding onto the index themselves.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DiagnosticBuilder {
    diagnostics: Vec<Diagnostic>,
}

impl DiagnosticBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) -> &mut Self {
        self.diagnostics.push(diagnostic);
        self
    }

    /// Attach a hint to the last-pushed diagnostic.
    pub fn hint(&mut self, hint: impl Into<String>) -> &mut Self {
        if let Some(last) = self.diagnostics.last_mut() {
            last.hint = Some(hint.into());
        }
        self
    }

    /// Attach a related note to the last-pushed diagnostic.
    pub fn related(&mut self, message: impl Into<String>, span: Span) -> &mut Self {
        if let Some(last) = self.diagnostics.last_mut() {
            last.related.push(RelatedNote {
                message: message.into(),
                span,
            });
        }
        self
    }

    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(Diagnostic::is_error)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter()
    }

    pub fn into_vec(self) -> Vec<Diagnostic> {
        self.diagnostics
    }

    pub fn len(&self) -> usize {
        self.diagnostics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.diagnostics.is_empty()
    }

    pub fn extend(&mut self, other: impl IntoIterator<Item = Diagnostic>) {
        self.diagnostics.extend(other);
    }
}

/// Render a diagnostic the way a terminal reporter would: severity glyph,
/// message, optional bracketed code, a `--> line L, column C` pointer, a
/// three-line source snippet with a caret underline when the span is
/// single-line, an optional hint, and related notes.
pub fn format_diagnostic(diagnostic: &Diagnostic, source: &str) -> String {
    let mut out = String::new();
    let code_suffix = diagnostic
        .code
        .as_ref()
        .map(|c| format!(" [{}]", c))
        .unwrap_or_default();
    let _ = writeln!(
        out,
        "{}: {}{}",
        diagnostic.severity.glyph(),
        diagnostic.message,
        code_suffix
    );
    let _ = writeln!(
        out,
        "  --> line {}, column {}",
        diagnostic.span.start.line, diagnostic.span.start.column
    );

    let lines: Vec<&str> = source.lines().collect();
    let line_no = diagnostic.span.start.line as usize;
    if line_no >= 1 && line_no <= lines.len() {
        if line_no >= 2 {
            let _ = writeln!(out, "  {}", lines[line_no - 2]);
        }
        let current = lines[line_no - 1];
        let _ = writeln!(out, "  {}", current);
        if diagnostic.span.is_single_line() {
            let start_col = diagnostic.span.start.column.max(1) as usize;
            let end_col = diagnostic.span.end.column.max(start_col as u32 + 1) as usize;
            let width = end_col.saturating_sub(start_col).max(1);
            let _ = writeln!(out, "  {}{}", " ".repeat(start_col - 1), "^".repeat(width));
        }
        if line_no < lines.len() {
            let _ = writeln!(out, "  {}", lines[line_no]);
        }
    }

    if let Some(hint) = &diagnostic.hint {
        let _ = writeln!(out, "  hint: {}", hint);
    }
    for note in &diagnostic.related {
        let _ = writeln!(
            out,
            "  related: {} (line {}, column {})",
            note.message, note.span.start.line, note.span.start.column
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(line: u32, column: u32, offset: usize) -> Position {
        Position {
            line,
            column,
            offset,
        }
    }

    #[test]
    fn error_is_error() {
        let span = Span::new(pos(1, 1, 0), pos(1, 2, 1));
        let diag = Diagnostic::error("unexpected token", span);
        assert!(diag.is_error());
    }

    #[test]
    fn warning_is_not_error() {
        let span = Span::new(pos(1, 1, 0), pos(1, 2, 1));
        let diag = Diagnostic::warning("consider reordering", span);
        assert!(!diag.is_error());
    }

    #[test]
    fn builder_tracks_order_and_errors() {
        let mut builder = DiagnosticBuilder::new();
        let span = Span::new(pos(1, 1, 0), pos(1, 2, 1));
        builder.push(Diagnostic::warning("w1", span));
        assert!(!builder.has_errors());
        builder.push(Diagnostic::error("e1", span).with_code("VER001"));
        assert!(builder.has_errors());
        assert_eq!(builder.len(), 2);
    }

    #[test]
    fn hint_attaches_to_last_pushed() {
        let mut builder = DiagnosticBuilder::new();
        let span = Span::new(pos(1, 1, 0), pos(1, 2, 1));
        builder.push(Diagnostic::error("bad value", span));
        builder.hint("did you mean :int?");
        let diags = builder.into_vec();
        assert_eq!(diags[0].hint.as_deref(), Some("did you mean :int?"));
    }

    #[test]
    fn formatter_includes_snippet_and_caret() {
        let source = "line one\nline two\nline three";
        let span = Span::new(pos(2, 1, 9), pos(2, 5, 13));
        let diag = Diagnostic::error("bad token", span).with_code("E001");
        let rendered = format_diagnostic(&diag, source);
        assert!(rendered.contains("line 2, column 1"));
        assert!(rendered.contains("[E001]"));
        assert!(rendered.contains("line one"));
        assert!(rendered.contains("line two"));
        assert!(rendered.contains("line three"));
        assert!(rendered.contains("^^^^"));
    }
}
