//! CLI definition and command handling

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};

use commands::{ListCommand, SignCommand, TimestampCommand, VerifyCommand};

/// Signet - code signing CLI for binaries and VSIX packages
#[derive(Debug, Parser)]
#[command(name = "signet")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Working directory
    #[arg(short = 'C', long, global = true)]
    pub directory: Option<std::path::PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Output format for CLI
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output
    #[default]
    Text,
    /// JSON output
    Json,
}

/// Available commands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Sign a binary or container package
    Sign(SignCommand),

    /// Verify the signature of a binary or container package
    Verify(VerifyCommand),

    /// Add a timestamp to an already signed binary
    Timestamp(TimestampCommand),

    /// List certificate stores, hash algorithms or timestamp servers
    List(ListCommand),
}

impl Cli {
    /// Execute the CLI command, returning the process exit code
    pub fn execute(self) -> anyhow::Result<i32> {
        // Change to specified directory if provided
        if let Some(dir) = &self.directory {
            std::env::set_current_dir(dir)?;
        }

        match self.command {
            Commands::Sign(ref cmd) => cmd.execute(&self),
            Commands::Verify(ref cmd) => cmd.execute(&self),
            Commands::Timestamp(ref cmd) => cmd.execute(&self),
            Commands::List(ref cmd) => cmd.execute(&self),
        }
    }

    /// Whether narrative text output should be printed
    pub fn chatty(&self) -> bool {
        self.format == OutputFormat::Text && !self.quiet
    }
}
