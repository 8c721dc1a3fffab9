//! Defines the command-line arguments and subcommands for the mixpp CLI.
//!
//! This module uses the `clap` crate with its "derive" feature to create a
//! declarative and type-safe argument parsing structure.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// The main CLI argument structure.
#[derive(Debug, Parser)]
#[command(
    name = "mixpp",
    version,
    about = "A mixed-computation macro preprocessor for C-family token streams."
)]
pub struct MixppArgs {
    #[command(subcommand)]
    pub command: Command,
}

/// An enumeration of all available CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Preprocess a file and print the expanded token stream.
    Pp {
        /// The path to the source file to preprocess.
        #[arg(required = true)]
        file: PathBuf,
    },
    /// Print the raw token stream without any macro expansion.
    Tokens {
        /// The path to the source file to lex.
        #[arg(required = true)]
        file: PathBuf,
    },
    /// Process a file and dump the surviving macro table as JSON.
    Macros {
        /// The path to the source file whose definitions to show.
        #[arg(required = true)]
        file: PathBuf,
    },
}
