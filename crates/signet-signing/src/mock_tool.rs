//! Shell-script stand-in for the signing tool, used by tests.
//!
//! `sign` appends a marker to the target, `verify` succeeds only for files
//! carrying the marker and every invocation is appended to `calls.log`.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use crate::locator::FixedToolLocator;
use crate::signtool::SigningToolAdapter;

const SCRIPT: &str = r#"#!/bin/sh
dir=$(dirname "$0")
echo "$*" >> "$dir/calls.log"
cmd="$1"
for last; do :; done
case "$cmd" in
  sign)
    if [ -f "$dir/fail-sign" ]; then
      echo "SignTool Error: An unexpected internal error has occurred." >&2
      exit 1
    fi
    printf 'SIGNED' >> "$last"
    echo "Done Adding Additional Store"
    echo "Successfully signed: $last"
    exit 0
    ;;
  verify)
    if grep -q SIGNED "$last" 2>/dev/null; then
      echo "Successfully verified: $last"
      exit 0
    fi
    echo "SignTool Error: No signature found." >&2
    exit 1
    ;;
  timestamp)
    echo "Successfully timestamped: $last"
    exit 0
    ;;
esac
echo "SignTool Error: Invalid command: $cmd" >&2
exit 2
"#;

pub(crate) struct MockTool {
    tool_dir: TempDir,
    work_dir: TempDir,
}

impl MockTool {
    pub(crate) fn new() -> Self {
        let tool_dir = TempDir::new().unwrap();
        let script = tool_dir.path().join("signtool");
        std::fs::write(&script, SCRIPT).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        Self {
            tool_dir,
            work_dir: TempDir::new().unwrap(),
        }
    }

    pub(crate) fn path(&self) -> PathBuf {
        self.tool_dir.path().join("signtool")
    }

    /// Directory for test targets, separate from the script's own
    pub(crate) fn work_dir(&self) -> &Path {
        self.work_dir.path()
    }

    pub(crate) fn file(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.work_dir.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, contents).unwrap();
        path
    }

    pub(crate) fn locator(&self) -> Arc<FixedToolLocator> {
        Arc::new(FixedToolLocator::new(self.path()))
    }

    pub(crate) fn adapter(&self) -> SigningToolAdapter {
        SigningToolAdapter::new(self.locator())
    }

    pub(crate) fn fail_signing(&self) {
        std::fs::write(self.tool_dir.path().join("fail-sign"), b"").unwrap();
    }

    /// Argument lists of every invocation so far
    pub(crate) fn calls(&self) -> Vec<String> {
        std::fs::read_to_string(self.tool_dir.path().join("calls.log"))
            .map(|log| log.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    pub(crate) fn sign_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| call.starts_with("sign "))
            .collect()
    }
}
