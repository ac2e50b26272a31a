//! List command

use clap::{Args, ValueEnum};
use serde::Serialize;

use signet_signing::{HashAlgorithm, NamedCertificateStore};

use super::Workspace;
use crate::cli::{output, Cli, OutputFormat};
use crate::exit_codes;

/// What to list
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ListKind {
    /// Certificate stores a thumbprint can be looked up in
    Stores,
    /// Supported hash algorithms
    Algorithms,
    /// Known timestamp servers
    TimestampServers,
}

/// List certificate stores, hash algorithms or timestamp servers
#[derive(Debug, Args)]
pub struct ListCommand {
    /// What to list
    pub kind: ListKind,
}

#[derive(Debug, Serialize)]
struct Entry {
    name: String,
    detail: String,
}

impl ListCommand {
    /// Execute the list command
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<i32> {
        let entries = match self.kind {
            ListKind::Stores => stores(),
            ListKind::Algorithms => algorithms(),
            ListKind::TimestampServers => {
                let workspace = Workspace::load()?;
                workspace
                    .config
                    .signing
                    .timestamp_servers
                    .iter()
                    .map(|server| Entry {
                        name: server.clone(),
                        detail: String::new(),
                    })
                    .collect()
            }
        };

        match cli.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
            OutputFormat::Text => {
                if !cli.quiet {
                    let title = match self.kind {
                        ListKind::Stores => "Certificate stores",
                        ListKind::Algorithms => "Hash algorithms",
                        ListKind::TimestampServers => "Timestamp servers",
                    };
                    println!("{}", output::header(title));
                }
                for entry in &entries {
                    if entry.detail.is_empty() {
                        println!("  {}", entry.name);
                    } else {
                        println!("{}", output::key_value(&entry.name, &entry.detail));
                    }
                }
            }
        }

        Ok(exit_codes::SUCCESS)
    }
}

fn stores() -> Vec<Entry> {
    NamedCertificateStore::all()
        .into_iter()
        .map(|store| {
            let machine = if store.is_machine() { " /sm" } else { "" };
            Entry {
                name: store.to_string(),
                detail: format!("/s {}{}", store.name().tool_name(), machine),
            }
        })
        .collect()
}

fn algorithms() -> Vec<Entry> {
    HashAlgorithm::all()
        .into_iter()
        .map(|algorithm| Entry {
            name: algorithm.name().to_string(),
            detail: algorithm.uri().to_string(),
        })
        .collect()
}
