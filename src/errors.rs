//! Diagnostic types for the preprocessor.
//!
//! All recoverable conditions flow through a [`DiagnosticSink`] so the engine
//! can keep producing tokens after a malformed invocation. Contract
//! violations (out-of-range argument indices and the like) are not errors and
//! panic instead.

use miette::{Diagnostic, SourceSpan};
use miette::{LabeledSpan, NamedSource};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use thiserror::Error;

use crate::tokens::Span;

// ============================================================================
// SOURCE CONTEXT - Diagnostic rendering infrastructure
// ============================================================================

/// Source context for diagnostic rendering, with explicit hierarchy between
/// real sources (preferred) and fallbacks (tolerated when necessary).
#[derive(Debug, Clone)]
pub struct SourceContext {
    pub name: String,
    pub content: String,
}

impl SourceContext {
    /// Create a source context from real file content.
    pub fn from_file(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }

    /// Create a fallback when real source is unavailable.
    pub fn fallback(context: &str) -> Self {
        Self {
            name: "fallback".to_string(),
            content: format!("// {}", context),
        }
    }

    pub fn to_named_source(&self) -> Arc<NamedSource<String>> {
        Arc::new(NamedSource::new(self.name.clone(), self.content.clone()))
    }
}

impl Default for SourceContext {
    fn default() -> Self {
        Self::fallback("default context")
    }
}

/// The single diagnostic type: what went wrong, where, and how to present it.
#[derive(Debug, Clone)]
pub struct PreprocError {
    pub kind: ErrorKind,
    pub source_info: SourceInfo,
    pub diagnostic_info: DiagnosticInfo,
}

/// All diagnostic kinds as a clean enum.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ErrorKind {
    // Invocation errors: the call is abandoned and its tokens are replayed
    // unexpanded.
    #[error("unterminated invocation of macro '{macro_name}'")]
    UntermInvocation { macro_name: String },
    #[error("macro '{macro_name}' expects {expected} argument(s), but {actual} were given")]
    ArityMismatch {
        macro_name: String,
        expected: String,
        actual: usize,
    },
    #[error("pasting '{lhs}' and '{rhs}' does not give a valid preprocessing token")]
    BadPaste { lhs: String, rhs: String },
    #[error("expansion nested too deeply while expanding macro '{macro_name}'")]
    ExpansionTooDeep { macro_name: String },

    // Hygiene: self-reference is left in place, with a note.
    #[error("expansion of macro '{macro_name}' is disabled to prevent recursion")]
    DisabledExpansion { macro_name: String },

    // Definition and directive errors.
    #[error("duplicate parameter '{param}' in definition of macro '{macro_name}'")]
    DuplicateParameter { macro_name: String, param: String },
    #[error("malformed directive: {message}")]
    BadDirective { message: String },
    #[error("directive '#{directive}' is not supported; line ignored")]
    UnsupportedDirective { directive: String },

    // Host failures.
    #[error("cannot read '{path}': {message}")]
    Io { path: String, message: String },
}

/// Context-specific source information.
#[derive(Debug, Clone)]
pub struct SourceInfo {
    pub source: Arc<NamedSource<String>>,
    pub primary_span: SourceSpan,
    pub phase: String,
}

/// A secondary label pointing into the same translation unit, typically the
/// definition site of the macro a diagnostic is about.
#[derive(Debug, Clone)]
pub struct RelatedSpan {
    pub span: SourceSpan,
    pub label: String,
}

/// Diagnostic enhancement data.
#[derive(Debug, Clone)]
pub struct DiagnosticInfo {
    pub help: Option<String>,
    pub error_code: String,
    pub related: Vec<RelatedSpan>,
    pub is_warning: bool,
}

/// Context-aware diagnostic creation.
pub trait ErrorReporting {
    fn report(&self, kind: ErrorKind, span: SourceSpan) -> PreprocError;

    fn arity_mismatch(
        &self,
        macro_name: &str,
        expected: &str,
        actual: usize,
        span: SourceSpan,
    ) -> PreprocError {
        self.report(
            ErrorKind::ArityMismatch {
                macro_name: macro_name.into(),
                expected: expected.into(),
                actual,
            },
            span,
        )
    }

    fn bad_paste(&self, lhs: &str, rhs: &str, span: SourceSpan) -> PreprocError {
        self.report(
            ErrorKind::BadPaste {
                lhs: lhs.into(),
                rhs: rhs.into(),
            },
            span,
        )
    }

    fn bad_directive(&self, message: &str, span: SourceSpan) -> PreprocError {
        self.report(
            ErrorKind::BadDirective {
                message: message.into(),
            },
            span,
        )
    }
}

impl ErrorKind {
    /// Diagnostic category, used by test assertions.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::UntermInvocation { .. }
            | Self::ArityMismatch { .. }
            | Self::BadPaste { .. }
            | Self::ExpansionTooDeep { .. } => ErrorCategory::Invocation,

            Self::DisabledExpansion { .. } => ErrorCategory::Hygiene,

            Self::DuplicateParameter { .. }
            | Self::BadDirective { .. }
            | Self::UnsupportedDirective { .. } => ErrorCategory::Directive,

            Self::Io { .. } => ErrorCategory::Host,
        }
    }

    pub const fn code_suffix(&self) -> &'static str {
        match self {
            Self::UntermInvocation { .. } => "unterminated_invocation",
            Self::ArityMismatch { .. } => "arity_mismatch",
            Self::BadPaste { .. } => "bad_paste",
            Self::ExpansionTooDeep { .. } => "expansion_too_deep",
            Self::DisabledExpansion { .. } => "disabled_expansion",
            Self::DuplicateParameter { .. } => "duplicate_parameter",
            Self::BadDirective { .. } => "bad_directive",
            Self::UnsupportedDirective { .. } => "unsupported_directive",
            Self::Io { .. } => "io",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Invocation,
    Hygiene,
    Directive,
    Host,
}

impl std::error::Error for PreprocError {}

impl fmt::Display for PreprocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)
    }
}

impl Diagnostic for PreprocError {
    fn code<'a>(&'a self) -> Option<Box<dyn fmt::Display + 'a>> {
        Some(Box::new(&self.diagnostic_info.error_code))
    }

    fn severity(&self) -> Option<miette::Severity> {
        if self.diagnostic_info.is_warning {
            Some(miette::Severity::Warning)
        } else {
            Some(miette::Severity::Error)
        }
    }

    fn help<'a>(&'a self) -> Option<Box<dyn fmt::Display + 'a>> {
        self.diagnostic_info
            .help
            .as_ref()
            .map(|h| Box::new(h) as Box<dyn fmt::Display>)
    }

    fn labels(&self) -> Option<Box<dyn Iterator<Item = miette::LabeledSpan> + '_>> {
        let mut labels = vec![LabeledSpan::new_with_span(
            Some(self.primary_label()),
            self.source_info.primary_span,
        )];
        for related in &self.diagnostic_info.related {
            labels.push(LabeledSpan::new_with_span(
                Some(related.label.clone()),
                related.span,
            ));
        }
        Some(Box::new(labels.into_iter()))
    }

    fn source_code(&self) -> Option<&dyn miette::SourceCode> {
        Some(&*self.source_info.source)
    }
}

impl PreprocError {
    fn primary_label(&self) -> String {
        match &self.kind {
            ErrorKind::UntermInvocation { .. } => "invocation starts here".into(),
            ErrorKind::ArityMismatch { .. } => "wrong number of arguments".into(),
            ErrorKind::BadPaste { .. } => "operands pasted here".into(),
            ErrorKind::ExpansionTooDeep { .. } => "expansion abandoned here".into(),
            ErrorKind::DisabledExpansion { .. } => "left unexpanded".into(),
            ErrorKind::DuplicateParameter { .. } => "duplicate parameter".into(),
            ErrorKind::BadDirective { .. } => "malformed directive".into(),
            ErrorKind::UnsupportedDirective { .. } => "unsupported directive".into(),
            ErrorKind::Io { .. } => "I/O failure".into(),
        }
    }

    /// Attach a secondary label, typically the definition site.
    pub fn with_related(mut self, span: SourceSpan, label: impl Into<String>) -> Self {
        self.diagnostic_info.related.push(RelatedSpan {
            span,
            label: label.into(),
        });
        self
    }

    pub fn as_warning(mut self) -> Self {
        self.diagnostic_info.is_warning = true;
        self
    }

    pub fn is_warning(&self) -> bool {
        self.diagnostic_info.is_warning
    }
}

// ============================================================================
// DIAGNOSTIC SINK
// ============================================================================

/// Receives recoverable diagnostics as the engine produces them.
pub trait DiagnosticSink {
    fn report(&mut self, error: PreprocError);
}

pub type SharedSink = Rc<RefCell<dyn DiagnosticSink>>;

/// Sink that collects everything for later inspection. The default choice
/// for tests and for the CLI, which drains it after the run.
#[derive(Default)]
pub struct CollectedDiagnostics {
    pub errors: Vec<PreprocError>,
}

impl CollectedDiagnostics {
    pub fn has_hard_errors(&self) -> bool {
        self.errors.iter().any(|e| !e.is_warning())
    }

    pub fn take(&mut self) -> Vec<PreprocError> {
        std::mem::take(&mut self.errors)
    }
}

impl DiagnosticSink for CollectedDiagnostics {
    fn report(&mut self, error: PreprocError) {
        self.errors.push(error);
    }
}

/// Convenience constructor for the common collected-sink setup.
pub fn collected_sink() -> Rc<RefCell<CollectedDiagnostics>> {
    Rc::new(RefCell::new(CollectedDiagnostics::default()))
}

/// Creates a placeholder span for diagnostics not tied to a specific source
/// location, such as I/O errors.
pub fn unspanned() -> miette::SourceSpan {
    miette::SourceSpan::from(0..0)
}

/// Converts a token span to a miette SourceSpan.
pub fn to_source_span(span: Span) -> miette::SourceSpan {
    miette::SourceSpan::from(span.start..span.end)
}

/// General-purpose diagnostic creation context used outside the engine, e.g.
/// by the directive reader and the CLI.
pub struct ReportContext {
    pub source: SourceContext,
    pub phase: String,
}

impl ReportContext {
    pub fn new(source: SourceContext, phase: impl Into<String>) -> Self {
        Self {
            source,
            phase: phase.into(),
        }
    }
}

impl ErrorReporting for ReportContext {
    fn report(&self, kind: ErrorKind, span: SourceSpan) -> PreprocError {
        let error_code = format!("mixpp::{}::{}", self.phase, kind.code_suffix());

        PreprocError {
            kind,
            source_info: SourceInfo {
                source: self.source.to_named_source(),
                primary_span: span,
                phase: self.phase.clone(),
            },
            diagnostic_info: DiagnosticInfo {
                help: None,
                error_code,
                related: Vec::new(),
                is_warning: false,
            },
        }
    }
}

// ============================================================================
// ERROR FORMATTING UTILITIES
// ============================================================================

/// Prints a diagnostic with full miette formatting: source spans, related
/// labels, and help text. Use for user-facing display in the CLI.
pub fn print_error(error: PreprocError) {
    use miette::Report;
    let report = Report::new(error);
    eprintln!("{report:?}");
}
