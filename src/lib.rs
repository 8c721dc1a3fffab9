//! A macro preprocessor for C-family token streams built on mixed
//! computation: the argument-independent part of every macro body is
//! rewritten once, cached, and stamped with real arguments per invocation.
//!
//! The engine lives in [`engine`]; [`host`] supplies the raw lexer and the
//! `#define`/`#undef` directive driver that feed it.

pub use crate::errors::{
    CollectedDiagnostics, DiagnosticSink, ErrorKind, ErrorReporting, PreprocError, SharedSink,
    SourceContext,
};

pub mod args;
pub mod cli;
pub mod deps;
pub mod engine;
pub mod errors;
pub mod host;
pub mod tokens;
