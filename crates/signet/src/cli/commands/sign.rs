//! Sign command

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Args;
use dialoguer::Password;
use tracing::info;

use signet_signing::{
    AlreadySignedPolicy, Certificate, CertificateReference, HashAlgorithm, NamedCertificateStore,
    SignOrchestrator, SignRequest, StoreLocation, StoreName, SigningError,
};

use super::Workspace;
use crate::cli::{output, Cli, OutputFormat};
use crate::exit_codes;

/// Sign a binary or container package
#[derive(Debug, Args)]
pub struct SignCommand {
    /// File to sign
    pub target: PathBuf,

    /// Thumbprint of an installed certificate
    #[arg(long, conflicts_with = "pfx", required_unless_present = "pfx")]
    pub thumbprint: Option<String>,

    /// Store holding the installed certificate
    #[arg(long, default_value = "my")]
    pub store: String,

    /// Look the certificate up in the machine store instead of the user store
    #[arg(long)]
    pub machine: bool,

    /// PKCS#12 certificate file
    #[arg(long)]
    pub pfx: Option<PathBuf>,

    /// Password for the PKCS#12 file
    #[arg(long, env = "SIGNET_PFX_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Hash algorithm (sha1, sha256, sha384, sha512)
    #[arg(long)]
    pub hash: Option<String>,

    /// Timestamp server URL
    #[arg(long, conflicts_with = "no_timestamp")]
    pub timestamp: Option<String>,

    /// Do not timestamp the signature
    #[arg(long)]
    pub no_timestamp: bool,

    /// Sign binaries inside a container package before the package itself
    #[arg(long)]
    pub nested: bool,

    /// Re-sign nested binaries that already carry a valid signature
    #[arg(long)]
    pub resign_signed: bool,
}

impl SignCommand {
    /// Execute the sign command
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<i32> {
        info!(
            path = %self.target.display(),
            nested = self.nested,
            "executing sign command"
        );
        let workspace = Workspace::load()?;
        let request = self.build_request(&workspace)?;

        let mut options = workspace.config.package.to_options();
        if self.resign_signed {
            options.already_signed = AlreadySignedPolicy::Resign;
        }

        if cli.chatty() {
            println!(
                "{} {}",
                output::header("Signing"),
                output::path_style().apply_to(self.target.display())
            );
            println!("{}", output::key_value("Hash", request.hash_algorithm.name()));
            println!(
                "{}",
                output::key_value(
                    "Timestamp",
                    request.timestamp_server.as_deref().unwrap_or("none")
                )
            );
            println!();
        }

        let orchestrator = Arc::new(SignOrchestrator::new(workspace.locator(), options));
        let (tx, rx) = std::sync::mpsc::channel();
        orchestrator
            .sign(request, move |result| {
                let _ = tx.send(result);
            })
            .join()
            .map_err(|_| anyhow::anyhow!("signing worker panicked"))?;
        let result = rx.recv().context("signing worker reported no result")?;

        match cli.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
            OutputFormat::Text => {
                output::completion(&result, cli.quiet);
                if !cli.quiet {
                    if result.success {
                        output::success(&format!("Signed {}", self.target.display()));
                    } else {
                        output::error(&format!("Failed to sign {}", self.target.display()));
                    }
                }
            }
        }

        Ok(exit_codes::for_success(result.success))
    }

    fn build_request(&self, workspace: &Workspace) -> anyhow::Result<SignRequest> {
        let signing = &workspace.config.signing;

        let hash_name = self.hash.as_deref().unwrap_or(&signing.hash_algorithm);
        let hash_algorithm: HashAlgorithm = hash_name.parse()?;

        let mut request = SignRequest::new(&self.target, self.certificate()?)
            .with_hash_algorithm(hash_algorithm)
            .with_nested_content(self.nested);

        request.timestamp_server = if self.no_timestamp {
            None
        } else {
            self.timestamp
                .as_deref()
                .or_else(|| signing.timestamp_server())
                .map(str::to_string)
        };

        Ok(request)
    }

    fn certificate(&self) -> anyhow::Result<CertificateReference> {
        if let Some(path) = &self.pfx {
            return Ok(CertificateReference::File {
                path: path.clone(),
                password: self.password()?,
            });
        }

        let thumbprint = self.thumbprint.as_deref().ok_or_else(|| {
            SigningError::Configuration("either --thumbprint or --pfx is required".to_string())
        })?;
        let name: StoreName = self.store.parse()?;
        let location = if self.machine {
            StoreLocation::LocalMachine
        } else {
            StoreLocation::CurrentUser
        };

        Ok(CertificateReference::Installed {
            certificate: Certificate::from_thumbprint(thumbprint),
            store: NamedCertificateStore::new(name, location),
        })
    }

    /// Password from the flag or environment, else a prompt when attended
    fn password(&self) -> anyhow::Result<Option<String>> {
        if self.password.is_some() {
            return Ok(self.password.clone());
        }
        if !console::user_attended() {
            return Ok(None);
        }

        let password = Password::new()
            .with_prompt("Certificate password")
            .allow_empty_password(true)
            .interact()?;
        Ok(Some(password))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn parse(args: &[&str]) -> SignCommand {
        let cli = Cli::try_parse_from(
            ["signet", "sign"].iter().chain(args.iter()).copied(),
        )
        .unwrap();
        match cli.command {
            crate::cli::Commands::Sign(cmd) => cmd,
            other => panic!("unexpected command: {:?}", other),
        }
    }

    fn workspace() -> Workspace {
        Workspace {
            config: Default::default(),
            config_path: None,
        }
    }

    #[test]
    fn test_thumbprint_request_uses_config_defaults() {
        let cmd = parse(&["app.exe", "--thumbprint", "aa bb cc"]);
        let request = cmd.build_request(&workspace()).unwrap();

        assert_eq!(request.hash_algorithm, HashAlgorithm::Sha256);
        assert_eq!(request.timestamp_server.as_deref(), Some("http://time.certum.pl"));
        assert!(!request.sign_nested_content);
        match request.certificate {
            CertificateReference::Installed { certificate, store } => {
                assert_eq!(certificate.thumbprint(), "AABBCC");
                assert_eq!(store, NamedCertificateStore::default());
            }
            other => panic!("unexpected certificate: {:?}", other),
        }
    }

    #[test]
    fn test_machine_store_and_overrides() {
        let cmd = parse(&[
            "app.exe",
            "--thumbprint",
            "AABBCC",
            "--store",
            "root",
            "--machine",
            "--hash",
            "sha512",
            "--no-timestamp",
        ]);
        let request = cmd.build_request(&workspace()).unwrap();

        assert_eq!(request.hash_algorithm, HashAlgorithm::Sha512);
        assert_eq!(request.timestamp_server, None);
        match request.certificate {
            CertificateReference::Installed { store, .. } => {
                assert_eq!(store.name(), StoreName::Root);
                assert!(store.is_machine());
            }
            other => panic!("unexpected certificate: {:?}", other),
        }
    }

    #[test]
    fn test_pfx_request_with_password() {
        let cmd = parse(&[
            "ext.vsix",
            "--pfx",
            "cert.pfx",
            "--password",
            "secret",
            "--timestamp",
            "http://ts.example",
            "--nested",
        ]);
        let request = cmd.build_request(&workspace()).unwrap();

        assert!(request.sign_nested_content);
        assert_eq!(request.timestamp_server.as_deref(), Some("http://ts.example"));
        match request.certificate {
            CertificateReference::File { path, password } => {
                assert_eq!(path, PathBuf::from("cert.pfx"));
                assert_eq!(password.as_deref(), Some("secret"));
            }
            other => panic!("unexpected certificate: {:?}", other),
        }
    }

    #[test]
    fn test_certificate_source_is_required_and_exclusive() {
        assert!(Cli::try_parse_from(["signet", "sign", "app.exe"]).is_err());
        assert!(Cli::try_parse_from([
            "signet", "sign", "app.exe", "--thumbprint", "AA", "--pfx", "c.pfx"
        ])
        .is_err());
        assert!(Cli::try_parse_from([
            "signet", "sign", "app.exe", "--thumbprint", "AA", "--timestamp", "http://t",
            "--no-timestamp"
        ])
        .is_err());
    }

    #[test]
    fn test_unknown_hash_and_store_are_rejected() {
        let cmd = parse(&["app.exe", "--thumbprint", "AA", "--hash", "md5"]);
        assert!(cmd.build_request(&workspace()).is_err());

        let cmd = parse(&["app.exe", "--thumbprint", "AA", "--store", "nowhere"]);
        let err = cmd.build_request(&workspace()).unwrap_err();
        assert_eq!(exit_codes::for_error(&err), exit_codes::CONFIG_ERROR);
    }
}
