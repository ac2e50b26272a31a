//! Minimal Open Packaging Conventions model over a zip archive
//!
//! Holds every part in memory. Part names are absolute (`/dir/file.ext`)
//! and map one-to-one onto zip entry names without the leading slash.
//! `[Content_Types].xml` is not a part; it is parsed into
//! [`ContentTypes`] and regenerated on save.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::debug;
use xml::reader::{EventReader, XmlEvent as ReadEvent};
use xml::writer::{EmitterConfig, XmlEvent};
use zip::write::SimpleFileOptions;
use zip::CompressionMethod;

use crate::error::{Result, SigningError};

pub const CONTENT_TYPES_ENTRY: &str = "[Content_Types].xml";
pub const ROOT_RELATIONSHIPS_PART: &str = "/_rels/.rels";
pub const RELATIONSHIPS_CONTENT_TYPE: &str = "application/vnd.openxmlformats-package.relationships+xml";

const CONTENT_TYPES_NS: &str = "http://schemas.openxmlformats.org/package/2006/content-types";
const RELATIONSHIPS_NS: &str = "http://schemas.openxmlformats.org/package/2006/relationships";

/// Upper bound on the buffer reserved up front for one entry
const MAX_PREALLOCATED_ENTRY: u64 = 1 << 20;

/// Read a whole zip entry.
///
/// The size in the entry header comes from the archive and only sizes the
/// initial buffer, capped at [`MAX_PREALLOCATED_ENTRY`].
fn read_entry<R: Read>(reader: &mut R, declared_size: u64) -> std::io::Result<Vec<u8>> {
    let mut data = Vec::with_capacity(declared_size.min(MAX_PREALLOCATED_ENTRY) as usize);
    reader.read_to_end(&mut data)?;
    Ok(data)
}

/// Name of the relationship part holding `source_part`'s relationships.
///
/// The package root (`/`) maps to `/_rels/.rels`.
pub fn relationship_part_name(source_part: &str) -> String {
    if source_part == "/" || source_part.is_empty() {
        return ROOT_RELATIONSHIPS_PART.to_string();
    }
    match source_part.rsplit_once('/') {
        Some((dir, file)) => format!("{}/_rels/{}.rels", dir, file),
        None => format!("/_rels/{}.rels", source_part),
    }
}

/// Resolve a relationship target against its source part
pub fn resolve_target(source_part: &str, target: &str) -> String {
    if target.starts_with('/') {
        return target.to_string();
    }

    let base = source_part.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
    let mut segments: Vec<&str> = base.split('/').filter(|s| !s.is_empty()).collect();
    for segment in target.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    format!("/{}", segments.join("/"))
}

fn extension_of(part_name: &str) -> Option<&str> {
    let file = part_name.rsplit('/').next().unwrap_or(part_name);
    file.rsplit_once('.').map(|(_, ext)| ext)
}

/// Parsed `[Content_Types].xml`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentTypes {
    defaults: Vec<(String, String)>,
    overrides: Vec<(String, String)>,
}

impl ContentTypes {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut types = Self::default();

        for event in EventReader::new(bytes) {
            if let ReadEvent::StartElement {
                name, attributes, ..
            } = event?
            {
                let attr = |key: &str| {
                    attributes
                        .iter()
                        .find(|a| a.name.local_name == key)
                        .map(|a| a.value.clone())
                };
                match name.local_name.as_str() {
                    "Default" => {
                        if let (Some(ext), Some(ct)) = (attr("Extension"), attr("ContentType")) {
                            types.defaults.push((ext, ct));
                        }
                    }
                    "Override" => {
                        if let (Some(part), Some(ct)) = (attr("PartName"), attr("ContentType")) {
                            types.overrides.push((part, ct));
                        }
                    }
                    _ => {}
                }
            }
        }

        Ok(types)
    }

    pub fn to_xml(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        let mut writer = EmitterConfig::new().create_writer(&mut buf);

        writer.write(XmlEvent::start_element("Types").default_ns(CONTENT_TYPES_NS))?;
        for (ext, ct) in &self.defaults {
            writer.write(
                XmlEvent::start_element("Default")
                    .attr("Extension", ext)
                    .attr("ContentType", ct),
            )?;
            writer.write(XmlEvent::end_element())?;
        }
        for (part, ct) in &self.overrides {
            writer.write(
                XmlEvent::start_element("Override")
                    .attr("PartName", part)
                    .attr("ContentType", ct),
            )?;
            writer.write(XmlEvent::end_element())?;
        }
        writer.write(XmlEvent::end_element())?;

        Ok(buf)
    }

    /// Content type of a part: override first, then extension default
    pub fn content_type_of(&self, part_name: &str) -> Option<&str> {
        if let Some((_, ct)) = self
            .overrides
            .iter()
            .find(|(part, _)| part.eq_ignore_ascii_case(part_name))
        {
            return Some(ct);
        }
        let ext = extension_of(part_name)?;
        self.defaults
            .iter()
            .find(|(e, _)| e.eq_ignore_ascii_case(ext))
            .map(|(_, ct)| ct.as_str())
    }

    /// Register a default for `extension` unless one exists
    pub fn ensure_default(&mut self, extension: &str, content_type: &str) {
        if !self
            .defaults
            .iter()
            .any(|(e, _)| e.eq_ignore_ascii_case(extension))
        {
            self.defaults
                .push((extension.to_string(), content_type.to_string()));
        }
    }

    pub fn set_override(&mut self, part_name: &str, content_type: &str) {
        self.remove_override(part_name);
        self.overrides
            .push((part_name.to_string(), content_type.to_string()));
    }

    pub fn remove_override(&mut self, part_name: &str) {
        self.overrides
            .retain(|(part, _)| !part.eq_ignore_ascii_case(part_name));
    }
}

/// One relationship from a `.rels` part
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relationship {
    pub id: String,
    pub rel_type: String,
    pub target: String,
    pub external: bool,
}

/// The relationships of one source part
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Relationships {
    items: Vec<Relationship>,
}

impl Relationships {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut items = Vec::new();

        for event in EventReader::new(bytes) {
            if let ReadEvent::StartElement {
                name, attributes, ..
            } = event?
            {
                if name.local_name != "Relationship" {
                    continue;
                }
                let attr = |key: &str| {
                    attributes
                        .iter()
                        .find(|a| a.name.local_name == key)
                        .map(|a| a.value.clone())
                        .unwrap_or_default()
                };
                items.push(Relationship {
                    id: attr("Id"),
                    rel_type: attr("Type"),
                    target: attr("Target"),
                    external: attr("TargetMode") == "External",
                });
            }
        }

        Ok(Self { items })
    }

    pub fn to_xml(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        let mut writer = EmitterConfig::new().create_writer(&mut buf);

        writer.write(XmlEvent::start_element("Relationships").default_ns(RELATIONSHIPS_NS))?;
        for rel in &self.items {
            let mut element = XmlEvent::start_element("Relationship")
                .attr("Type", &rel.rel_type)
                .attr("Target", &rel.target)
                .attr("Id", &rel.id);
            if rel.external {
                element = element.attr("TargetMode", "External");
            }
            writer.write(element)?;
            writer.write(XmlEvent::end_element())?;
        }
        writer.write(XmlEvent::end_element())?;

        Ok(buf)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Relationship> {
        self.items.iter()
    }

    pub fn by_type<'a>(&'a self, rel_type: &'a str) -> impl Iterator<Item = &'a Relationship> {
        self.items.iter().filter(move |r| r.rel_type == rel_type)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Add a relationship with a fresh `R<n>` id and return the id
    pub fn add(&mut self, rel_type: &str, target: &str) -> String {
        let mut n = self.items.len();
        let id = loop {
            let candidate = format!("R{}", n);
            if !self.items.iter().any(|r| r.id == candidate) {
                break candidate;
            }
            n += 1;
        };
        self.items.push(Relationship {
            id: id.clone(),
            rel_type: rel_type.to_string(),
            target: target.to_string(),
            external: false,
        });
        id
    }

    pub fn remove_by_type(&mut self, rel_type: &str) {
        self.items.retain(|r| r.rel_type != rel_type);
    }
}

/// An OPC package loaded from disk
#[derive(Debug, Clone)]
pub struct OpcPackage {
    path: PathBuf,
    parts: BTreeMap<String, Vec<u8>>,
    content_types: ContentTypes,
}

impl OpcPackage {
    /// Read every part of the package at `path`
    pub fn open(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let mut archive = zip::ZipArchive::new(file).map_err(|e| SigningError::Package {
            path: path.to_path_buf(),
            reason: format!("not a zip archive: {}", e),
        })?;

        let mut parts = BTreeMap::new();
        let mut content_types = None;

        for i in 0..archive.len() {
            let mut entry = archive.by_index(i)?;
            if entry.is_dir() {
                continue;
            }
            let name = entry.name().to_string();
            let declared_size = entry.size();
            let data = read_entry(&mut entry, declared_size)?;

            if name == CONTENT_TYPES_ENTRY {
                content_types = Some(ContentTypes::parse(&data)?);
            } else {
                parts.insert(format!("/{}", name.trim_start_matches('/')), data);
            }
        }

        let content_types = content_types.ok_or_else(|| SigningError::Package {
            path: path.to_path_buf(),
            reason: format!("missing {}", CONTENT_TYPES_ENTRY),
        })?;

        debug!(path = %path.display(), parts = parts.len(), "opened package");
        Ok(Self {
            path: path.to_path_buf(),
            parts,
            content_types,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Part names in sorted order
    pub fn part_names(&self) -> impl Iterator<Item = &str> {
        self.parts.keys().map(String::as_str)
    }

    pub fn part(&self, name: &str) -> Option<&[u8]> {
        self.parts.get(name).map(Vec::as_slice)
    }

    pub fn has_part(&self, name: &str) -> bool {
        self.parts.contains_key(name)
    }

    pub fn content_types(&self) -> &ContentTypes {
        &self.content_types
    }

    pub fn content_types_mut(&mut self) -> &mut ContentTypes {
        &mut self.content_types
    }

    pub fn content_type_of(&self, name: &str) -> Option<&str> {
        self.content_types.content_type_of(name)
    }

    /// Insert or replace a part
    pub fn put_part(&mut self, name: &str, data: Vec<u8>) {
        self.parts.insert(name.to_string(), data);
    }

    pub fn remove_part(&mut self, name: &str) -> Option<Vec<u8>> {
        self.content_types.remove_override(name);
        self.parts.remove(name)
    }

    /// Relationships whose source is `source_part` (`/` for the package)
    pub fn relationships(&self, source_part: &str) -> Result<Relationships> {
        match self.parts.get(&relationship_part_name(source_part)) {
            Some(bytes) => Relationships::parse(bytes),
            None => Ok(Relationships::default()),
        }
    }

    /// Replace `source_part`'s relationships; an empty set removes the part
    pub fn set_relationships(&mut self, source_part: &str, rels: &Relationships) -> Result<()> {
        let name = relationship_part_name(source_part);
        if rels.is_empty() {
            self.parts.remove(&name);
        } else {
            self.content_types
                .ensure_default("rels", RELATIONSHIPS_CONTENT_TYPE);
            self.parts.insert(name, rels.to_xml()?);
        }
        Ok(())
    }

    /// Write the package back to where it was opened from
    pub fn save(&self, compression: CompressionMethod) -> Result<()> {
        self.save_as(&self.path, compression)
    }

    /// Write the package to `path`, replacing it atomically
    pub fn save_as(&self, path: &Path, compression: CompressionMethod) -> Result<()> {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut temp = tempfile::NamedTempFile::new_in(dir)?;

        {
            let mut zip = zip::ZipWriter::new(temp.as_file_mut());
            let options = SimpleFileOptions::default().compression_method(compression);

            zip.start_file(CONTENT_TYPES_ENTRY, options)?;
            zip.write_all(&self.content_types.to_xml()?)?;

            for (name, data) in &self.parts {
                zip.start_file(name.trim_start_matches('/'), options)?;
                zip.write_all(data)?;
            }
            zip.finish()?;
        }

        temp.persist(path).map_err(|e| SigningError::Io(e.error))?;
        debug!(path = %path.display(), parts = self.parts.len(), "saved package");
        Ok(())
    }
}
