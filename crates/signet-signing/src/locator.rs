//! Locating the external signing tool

use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing::{debug, info};

use crate::error::{Result, SigningError};

/// File name of the signing tool
pub const SIGNTOOL_EXE: &str = "signtool.exe";

/// Finds the signing tool executable
pub trait ToolLocator: Send + Sync {
    /// Path to the executable, or `ToolNotFound`
    fn locate(&self) -> Result<PathBuf>;
}

fn not_found() -> SigningError {
    SigningError::ToolNotFound {
        tool: SIGNTOOL_EXE.to_string(),
        hint: "Install the Windows SDK or configure tool.path".to_string(),
    }
}

/// Locator that always answers with one configured path
#[derive(Debug, Clone)]
pub struct FixedToolLocator {
    path: PathBuf,
}

impl FixedToolLocator {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ToolLocator for FixedToolLocator {
    fn locate(&self) -> Result<PathBuf> {
        if self.path.is_file() {
            Ok(self.path.clone())
        } else {
            debug!(path = %self.path.display(), "configured signing tool does not exist");
            Err(not_found())
        }
    }
}

/// Searches the well-known SDK install directories.
///
/// The first hit is remembered for the lifetime of the locator and never
/// re-checked, even if the file disappears later.
#[derive(Debug)]
pub struct SdkToolLocator {
    extra_roots: Vec<PathBuf>,
    program_files: Vec<PathBuf>,
    search_path: bool,
    cached: OnceCell<PathBuf>,
}

impl SdkToolLocator {
    /// Locator over the current machine's Program Files directories
    pub fn new() -> Self {
        let mut program_files = Vec::new();
        for var in ["ProgramFiles(x86)", "ProgramFiles"] {
            if let Some(dir) = std::env::var_os(var) {
                let dir = PathBuf::from(dir);
                if !program_files.contains(&dir) {
                    program_files.push(dir);
                }
            }
        }
        if program_files.is_empty() {
            program_files.push(PathBuf::from(r"C:\Program Files (x86)"));
            program_files.push(PathBuf::from(r"C:\Program Files"));
        }

        Self {
            extra_roots: Vec::new(),
            program_files,
            search_path: true,
            cached: OnceCell::new(),
        }
    }

    /// Locator over explicit Program Files directories, without PATH lookup
    pub fn with_program_files(program_files: Vec<PathBuf>) -> Self {
        Self {
            extra_roots: Vec::new(),
            program_files,
            search_path: false,
            cached: OnceCell::new(),
        }
    }

    /// Directories checked for the tool before any SDK location
    pub fn with_extra_roots(mut self, roots: Vec<PathBuf>) -> Self {
        self.extra_roots = roots;
        self
    }

    /// Candidate paths in search order.
    ///
    /// Versioned Windows 10 SDK directories are listed newest first, and
    /// 64-bit binaries come before 32-bit ones at every level.
    pub fn candidates(&self) -> Vec<PathBuf> {
        let mut candidates: Vec<PathBuf> = self
            .extra_roots
            .iter()
            .map(|root| root.join(SIGNTOOL_EXE))
            .collect();

        for program_files in &self.program_files {
            let kits10 = program_files.join("Windows Kits").join("10").join("bin");
            for version in sdk_versions(&kits10) {
                for arch in ["x64", "x86"] {
                    candidates.push(version.join(arch).join(SIGNTOOL_EXE));
                }
            }
            for arch in ["x64", "x86"] {
                candidates.push(kits10.join(arch).join(SIGNTOOL_EXE));
            }
        }

        for program_files in &self.program_files {
            for kit in ["8.1", "8.0"] {
                for arch in ["x64", "x86"] {
                    candidates.push(
                        program_files
                            .join("Windows Kits")
                            .join(kit)
                            .join("bin")
                            .join(arch)
                            .join(SIGNTOOL_EXE),
                    );
                }
            }
            candidates.push(
                program_files
                    .join("Microsoft SDKs")
                    .join("Windows")
                    .join("v7.1A")
                    .join("Bin")
                    .join(SIGNTOOL_EXE),
            );
        }

        candidates
    }

    fn search(&self) -> Result<PathBuf> {
        if let Some(found) = self.candidates().into_iter().find(|c| c.is_file()) {
            return Ok(found);
        }

        if self.search_path {
            if let Ok(found) = which::which("signtool") {
                return Ok(found);
            }
        }

        Err(not_found())
    }
}

impl Default for SdkToolLocator {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolLocator for SdkToolLocator {
    fn locate(&self) -> Result<PathBuf> {
        self.cached
            .get_or_try_init(|| {
                let found = self.search()?;
                info!(path = %found.display(), "located signing tool");
                Ok(found)
            })
            .cloned()
    }
}

/// Versioned SDK directories (`10.0.x.y`) under `bin`, newest first
fn sdk_versions(bin: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(bin) else {
        return Vec::new();
    };

    let mut versions: Vec<(Vec<u64>, PathBuf)> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().to_string();
            parse_version(&name).map(|v| (v, e.path()))
        })
        .collect();

    versions.sort_by(|a, b| compare_versions(&b.0, &a.0));
    versions.into_iter().map(|(_, path)| path).collect()
}

fn parse_version(name: &str) -> Option<Vec<u64>> {
    if !name.contains('.') {
        return None;
    }
    name.split('.').map(|part| part.parse().ok()).collect()
}

fn compare_versions(a: &[u64], b: &[u64]) -> Ordering {
    a.iter().cmp(b.iter())
}
