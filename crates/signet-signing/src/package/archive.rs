//! Extracting and re-creating zip archives on disk

use std::io::Write;
use std::path::Path;

use tracing::debug;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::CompressionMethod;

use crate::error::{Result, SigningError};

use super::opc::CONTENT_TYPES_ENTRY;

/// Extract every entry of `archive` below `dest`; returns the file count.
///
/// Entries whose names would escape `dest` are rejected.
pub fn extract(archive: &Path, dest: &Path) -> Result<usize> {
    let file = std::fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| SigningError::Package {
        path: archive.to_path_buf(),
        reason: format!("not a zip archive: {}", e),
    })?;

    let mut files = 0;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let relative = entry.enclosed_name().ok_or_else(|| SigningError::Package {
            path: archive.to_path_buf(),
            reason: format!("unsafe entry name {}", entry.name()),
        })?;
        let out = dest.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut target = std::fs::File::create(&out)?;
        std::io::copy(&mut entry, &mut target)?;
        files += 1;
    }

    debug!(archive = %archive.display(), files, "extracted archive");
    Ok(files)
}

/// Archive every file below `source` into `archive`, replacing it.
///
/// Entry names are relative to `source` with `/` separators, in file-name
/// order, with `[Content_Types].xml` first when present.
pub fn pack(source: &Path, archive: &Path, compression: CompressionMethod) -> Result<usize> {
    let mut entries = Vec::new();
    for entry in WalkDir::new(source).sort_by_file_name() {
        let entry = entry.map_err(|e| SigningError::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|_| SigningError::Package {
                path: archive.to_path_buf(),
                reason: format!("{} is outside the working directory", entry.path().display()),
            })?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        entries.push((name, entry.into_path()));
    }
    entries.sort_by_key(|(name, _)| name != CONTENT_TYPES_ENTRY);

    let dir = archive
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    {
        let mut zip = zip::ZipWriter::new(temp.as_file_mut());
        let options = SimpleFileOptions::default().compression_method(compression);
        for (name, path) in &entries {
            zip.start_file(name.as_str(), options)?;
            zip.write_all(&std::fs::read(path)?)?;
        }
        zip.finish()?;
    }
    temp.persist(archive).map_err(|e| SigningError::Io(e.error))?;

    debug!(archive = %archive.display(), files = entries.len(), "packed archive");
    Ok(entries.len())
}
