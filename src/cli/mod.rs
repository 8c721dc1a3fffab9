//! The mixpp command-line interface.
//!
//! This module is the main entry point for all CLI commands and orchestrates
//! the core library functions. Every command reads one translation unit;
//! recoverable diagnostics are rendered after the output and turn the exit
//! code nonzero only when a hard error is among them.

use crate::cli::args::{Command, MixppArgs};
use crate::engine::Preprocessor;
use crate::errors::{
    collected_sink, print_error, unspanned, ErrorKind, ErrorReporting, PreprocError,
    ReportContext, SourceContext,
};
use crate::host::{self, Lexer, TokenSource};
use crate::tokens::{Token, TokenKind};
use clap::Parser;
use serde::Serialize;
use std::path::Path;
use std::{fs, process};

pub mod args;

/// The main entry point for the CLI.
pub fn run() {
    let args = MixppArgs::parse();

    let result = match args.command {
        Command::Pp { file } => handle_pp(&file),
        Command::Tokens { file } => handle_tokens(&file),
        Command::Macros { file } => handle_macros(&file),
    };

    if let Err(error) = result {
        print_error(error);
        process::exit(1);
    }
}

fn read_source(path: &Path) -> Result<(SourceContext, String), PreprocError> {
    let name = path.display().to_string();
    let content = fs::read_to_string(path).map_err(|io| {
        let ctx = ReportContext::new(SourceContext::fallback("file read"), "host");
        ctx.report(
            ErrorKind::Io {
                path: name.clone(),
                message: io.to_string(),
            },
            unspanned(),
        )
    })?;
    Ok((SourceContext::from_file(name, content.clone()), content))
}

fn print_token(tok: &Token) {
    println!("{} '{}'", tok.kind.name(), tok.spelling);
}

/// Handles the `pp` subcommand.
fn handle_pp(path: &Path) -> Result<(), PreprocError> {
    let (context, source) = read_source(path)?;
    let sink = collected_sink();
    let mut pp = Preprocessor::new(context, sink.clone());

    let tokens = host::preprocess_source(&mut pp, &source);
    for tok in &tokens {
        print_token(tok);
    }

    finish(sink)
}

/// Handles the `tokens` subcommand.
fn handle_tokens(path: &Path) -> Result<(), PreprocError> {
    let (_, source) = read_source(path)?;
    let mut lexer = Lexer::new(&source);
    loop {
        let tok = lexer.next_raw();
        if tok.kind == TokenKind::Eof {
            break;
        }
        print_token(&tok);
    }
    Ok(())
}

#[derive(Serialize)]
struct MacroSummary {
    name: String,
    function_like: bool,
    params: Vec<String>,
    variadic: bool,
    body: String,
}

/// Handles the `macros` subcommand: the file is fully processed so that
/// directives take effect in order, then the surviving table is dumped.
fn handle_macros(path: &Path) -> Result<(), PreprocError> {
    let (context, source) = read_source(path)?;
    let sink = collected_sink();
    let mut pp = Preprocessor::new(context, sink.clone());
    host::preprocess_source(&mut pp, &source);

    let mut summaries: Vec<MacroSummary> = pp
        .macros()
        .map(|mi| MacroSummary {
            name: mi.name.clone(),
            function_like: mi.function_like,
            params: mi.params.clone(),
            variadic: mi.variadic,
            body: mi.body_spelling(),
        })
        .collect();
    summaries.sort_by(|a, b| a.name.cmp(&b.name));

    let json = serde_json::to_string_pretty(&summaries).unwrap_or_else(|_| "[]".into());
    println!("{json}");

    finish(sink)
}

/// Drains the sink, renders everything, and fails on hard errors.
fn finish(sink: std::rc::Rc<std::cell::RefCell<crate::errors::CollectedDiagnostics>>) -> Result<(), PreprocError> {
    let mut sink = sink.borrow_mut();
    let hard = sink.has_hard_errors();
    for error in sink.take() {
        print_error(error);
    }
    if hard {
        process::exit(1);
    }
    Ok(())
}
