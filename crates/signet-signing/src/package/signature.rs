//! Package digital signatures (OPC XML-signature envelope)

use std::collections::BTreeSet;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{SecondsFormat, Utc};
use rsa::Pkcs1v15Sign;
use tracing::{debug, info, instrument, warn};
use xml::reader::{EventReader, XmlEvent as ReadEvent};
use xml::writer::{EmitterConfig, EventWriter, XmlEvent};

use crate::algorithm::HashAlgorithm;
use crate::certificate::Certificate;
use crate::error::{Result, SigningError};

use super::opc::{resolve_target, OpcPackage, ROOT_RELATIONSHIPS_PART};

pub const SIGNATURE_DIR: &str = "/package/services/digital-signature";
pub const ORIGIN_PART: &str = "/package/services/digital-signature/origin.psdor";
pub const ORIGIN_RELATIONSHIPS_PART: &str =
    "/package/services/digital-signature/_rels/origin.psdor.rels";

pub const ORIGIN_REL_TYPE: &str =
    "http://schemas.openxmlformats.org/package/2006/relationships/digital-signature/origin";
pub const SIGNATURE_REL_TYPE: &str =
    "http://schemas.openxmlformats.org/package/2006/relationships/digital-signature/signature";

const ORIGIN_CONTENT_TYPE: &str = "application/vnd.openxmlformats-package.digital-signature-origin";
const SIGNATURE_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-package.digital-signature-xmlsignature+xml";

const XMLDSIG_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
const OPC_SIGNATURE_NS: &str = "http://schemas.openxmlformats.org/package/2006/digital-signature";
const C14N_URI: &str = "http://www.w3.org/TR/2001/REC-xml-c14n-20010315";
const SIGNATURE_ID: &str = "SignatureIdValue";
const PACKAGE_OBJECT_ID: &str = "idPackageObject";
const SIGNATURE_TIME_FORMAT: &str = "YYYY-MM-DDThh:mm:ssTZD";
const CONTENT_TYPE_QUERY: &str = "?ContentType=";

/// Where the signer certificate ends up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CertificateEmbedding {
    /// `KeyInfo/X509Data` inside the signature part
    #[default]
    InSignaturePart,
    /// Not stored; the package cannot be verified on its own
    NotEmbedded,
}

/// Result of verifying the signatures of a package
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyResult {
    Success,
    NotSigned,
    InvalidSignature,
    ContentModified,
    ReferenceNotFound,
    IncompleteCoverage,
    CertificateNotFound,
}

impl std::fmt::Display for VerifyResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Success => "signature is valid",
            Self::NotSigned => "no signature present",
            Self::InvalidSignature => "signature value does not verify",
            Self::ContentModified => "a signed part was modified",
            Self::ReferenceNotFound => "a signed part is missing",
            Self::IncompleteCoverage => "signature does not cover the full package",
            Self::CertificateNotFound => "signer certificate is not available",
        };
        f.write_str(text)
    }
}

/// Summary of one signature found in a package
#[derive(Debug, Clone)]
pub struct PackageSignature {
    pub part_name: String,
    pub signer: Option<String>,
    pub thumbprint: Option<String>,
    pub signing_time: Option<String>,
}

/// Whether `part_name` belongs to the signature machinery
pub fn is_signature_part(part_name: &str) -> bool {
    part_name
        .to_ascii_lowercase()
        .starts_with(&format!("{}/", SIGNATURE_DIR))
}

/// The full parts-to-sign set of `package`: every content part plus the
/// origin relationship part, the origin and the package relationship part.
pub fn parts_to_sign(package: &OpcPackage) -> Vec<String> {
    let mut parts: Vec<String> = package
        .part_names()
        .filter(|name| *name != ROOT_RELATIONSHIPS_PART && !is_signature_part(name))
        .map(str::to_string)
        .collect();
    parts.push(ORIGIN_RELATIONSHIPS_PART.to_string());
    parts.push(ORIGIN_PART.to_string());
    parts.push(ROOT_RELATIONSHIPS_PART.to_string());
    parts
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Reference {
    part_name: String,
    content_type: String,
    digest: HashAlgorithm,
    digest_value: String,
}

impl Reference {
    /// Same-document reference to an `Object` of the signature itself
    fn is_object(&self) -> bool {
        self.part_name.starts_with('#')
    }

    fn uri(&self) -> String {
        if self.content_type.is_empty() {
            self.part_name.clone()
        } else {
            format!("{}{}{}", self.part_name, CONTENT_TYPE_QUERY, self.content_type)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SignedInfo {
    signature_method: HashAlgorithm,
    references: Vec<Reference>,
}

impl SignedInfo {
    /// Serialized form that the signature value covers.
    ///
    /// Rendering is deterministic, so a parsed `SignedInfo` renders back to
    /// the exact bytes that were signed.
    fn canonical_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        let mut writer = EmitterConfig::new()
            .write_document_declaration(false)
            .create_writer(&mut buf);
        self.write(&mut writer, true)?;
        Ok(buf)
    }

    fn write<W: std::io::Write>(&self, writer: &mut EventWriter<W>, with_ns: bool) -> Result<()> {
        let start = XmlEvent::start_element("SignedInfo");
        writer.write(if with_ns { start.default_ns(XMLDSIG_NS) } else { start })?;

        writer.write(XmlEvent::start_element("CanonicalizationMethod").attr("Algorithm", C14N_URI))?;
        writer.write(XmlEvent::end_element())?;
        writer.write(
            XmlEvent::start_element("SignatureMethod")
                .attr("Algorithm", self.signature_method.rsa_signature_uri()),
        )?;
        writer.write(XmlEvent::end_element())?;

        for reference in &self.references {
            let uri = reference.uri();
            writer.write(XmlEvent::start_element("Reference").attr("URI", &uri))?;
            writer.write(
                XmlEvent::start_element("DigestMethod").attr("Algorithm", reference.digest.uri()),
            )?;
            writer.write(XmlEvent::end_element())?;
            text_element(writer, "DigestValue", &reference.digest_value)?;
            writer.write(XmlEvent::end_element())?;
        }

        writer.write(XmlEvent::end_element())?;
        Ok(())
    }
}

/// The package `Object` carrying the signing time.
///
/// Covered by its own `Reference`; like `SignedInfo` it is rendered
/// deterministically so the digest can be recomputed from parsed values.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PackageObject {
    time_format: String,
    signing_time: String,
}

impl PackageObject {
    fn new(signing_time: impl Into<String>) -> Self {
        Self {
            time_format: SIGNATURE_TIME_FORMAT.to_string(),
            signing_time: signing_time.into(),
        }
    }

    fn reference_uri() -> String {
        format!("#{}", PACKAGE_OBJECT_ID)
    }

    fn canonical_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        let mut writer = EmitterConfig::new()
            .write_document_declaration(false)
            .create_writer(&mut buf);
        self.write(&mut writer, true)?;
        Ok(buf)
    }

    fn write<W: std::io::Write>(&self, writer: &mut EventWriter<W>, with_ns: bool) -> Result<()> {
        let start = XmlEvent::start_element("Object").attr("Id", PACKAGE_OBJECT_ID);
        writer.write(if with_ns { start.default_ns(XMLDSIG_NS) } else { start })?;
        writer.write(XmlEvent::start_element("SignatureProperties"))?;
        let target = format!("#{}", SIGNATURE_ID);
        writer.write(
            XmlEvent::start_element("SignatureProperty")
                .attr("Id", "idSignatureTime")
                .attr("Target", &target),
        )?;
        writer.write(XmlEvent::start_element("SignatureTime").default_ns(OPC_SIGNATURE_NS))?;
        text_element(writer, "Format", &self.time_format)?;
        text_element(writer, "Value", &self.signing_time)?;
        for _ in 0..4 {
            writer.write(XmlEvent::end_element())?;
        }
        Ok(())
    }
}

fn text_element<W: std::io::Write>(
    writer: &mut EventWriter<W>,
    name: &str,
    text: &str,
) -> Result<()> {
    writer.write(XmlEvent::start_element(name))?;
    writer.write(XmlEvent::characters(text))?;
    writer.write(XmlEvent::end_element())?;
    Ok(())
}

/// Contents of a signature part
#[derive(Debug, Default)]
struct SignatureDocument {
    signature_method: Option<String>,
    references: Vec<(String, Option<String>, String)>,
    signature_value: String,
    certificate: Option<String>,
    time_format: Option<String>,
    signing_time: Option<String>,
}

impl SignatureDocument {
    fn parse(bytes: &[u8]) -> Result<Self> {
        let mut doc = Self::default();
        let mut path: Vec<String> = Vec::new();
        let mut text = String::new();

        for event in EventReader::new(bytes) {
            match event? {
                ReadEvent::StartElement {
                    name, attributes, ..
                } => {
                    let attr = |key: &str| {
                        attributes
                            .iter()
                            .find(|a| a.name.local_name == key)
                            .map(|a| a.value.clone())
                    };
                    match name.local_name.as_str() {
                        "SignatureMethod" => doc.signature_method = attr("Algorithm"),
                        "Reference" => doc.references.push((
                            attr("URI").unwrap_or_default(),
                            None,
                            String::new(),
                        )),
                        "DigestMethod" => {
                            if let Some(last) = doc.references.last_mut() {
                                last.1 = attr("Algorithm");
                            }
                        }
                        _ => {}
                    }
                    path.push(name.local_name);
                    text.clear();
                }
                ReadEvent::Characters(chars) | ReadEvent::CData(chars) => text.push_str(&chars),
                ReadEvent::EndElement { .. } => {
                    let value = std::mem::take(&mut text).trim().to_string();
                    let parent = path.len().checked_sub(2).map(|i| path[i].as_str());
                    match (path.last().map(String::as_str), parent) {
                        (Some("DigestValue"), _) => {
                            if let Some(last) = doc.references.last_mut() {
                                last.2 = value;
                            }
                        }
                        (Some("SignatureValue"), _) => doc.signature_value = value,
                        (Some("X509Certificate"), _) => doc.certificate = Some(value),
                        (Some("Format"), Some("SignatureTime")) => doc.time_format = Some(value),
                        (Some("Value"), Some("SignatureTime")) => doc.signing_time = Some(value),
                        _ => {}
                    }
                    path.pop();
                }
                _ => {}
            }
        }

        Ok(doc)
    }

    fn signed_info(&self) -> Result<SignedInfo> {
        let method = self.signature_method.as_deref().ok_or_else(|| {
            SigningError::CryptographicSigning("signature has no SignatureMethod".to_string())
        })?;
        let signature_method = HashAlgorithm::from_rsa_signature_uri(method)?;

        let references = self
            .references
            .iter()
            .map(|(uri, digest, value)| {
                let digest = HashAlgorithm::from_uri(digest.as_deref().unwrap_or_default())?;
                let (part_name, content_type) = match uri.split_once(CONTENT_TYPE_QUERY) {
                    Some((part, ct)) => (part.to_string(), ct.to_string()),
                    None => (uri.clone(), String::new()),
                };
                Ok(Reference {
                    part_name,
                    content_type,
                    digest,
                    digest_value: value.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(SignedInfo {
            signature_method,
            references,
        })
    }

    fn package_object(&self) -> Option<PackageObject> {
        Some(PackageObject {
            time_format: self.time_format.clone()?,
            signing_time: self.signing_time.clone()?,
        })
    }
}

fn pkcs1v15(algorithm: HashAlgorithm) -> Pkcs1v15Sign {
    match algorithm {
        HashAlgorithm::Sha1 => Pkcs1v15Sign::new::<sha1::Sha1>(),
        HashAlgorithm::Sha256 => Pkcs1v15Sign::new::<sha2::Sha256>(),
        HashAlgorithm::Sha384 => Pkcs1v15Sign::new::<sha2::Sha384>(),
        HashAlgorithm::Sha512 => Pkcs1v15Sign::new::<sha2::Sha512>(),
    }
}

/// Signs and verifies the digital signatures of one open package.
pub struct PackageDigitalSignatureManager<'a> {
    package: &'a mut OpcPackage,
    embedding: CertificateEmbedding,
    hash_algorithm: HashAlgorithm,
}

impl<'a> PackageDigitalSignatureManager<'a> {
    /// Digest algorithm a new manager starts with
    pub const DEFAULT_HASH_ALGORITHM: HashAlgorithm = HashAlgorithm::Sha1;

    pub fn new(package: &'a mut OpcPackage) -> Self {
        Self {
            package,
            embedding: CertificateEmbedding::default(),
            hash_algorithm: Self::DEFAULT_HASH_ALGORITHM,
        }
    }

    pub fn set_embedding(&mut self, embedding: CertificateEmbedding) {
        self.embedding = embedding;
    }

    pub fn hash_algorithm(&self) -> HashAlgorithm {
        self.hash_algorithm
    }

    pub fn set_hash_algorithm(&mut self, algorithm: HashAlgorithm) {
        self.hash_algorithm = algorithm;
    }

    pub fn reset_hash_algorithm(&mut self) {
        self.hash_algorithm = Self::DEFAULT_HASH_ALGORITHM;
    }

    pub fn package(&self) -> &OpcPackage {
        self.package
    }

    /// Sign `parts` with `certificate`, replacing any existing signature.
    ///
    /// The origin, its relationship part and the package relationship are
    /// created before digesting, so they may be listed in `parts`. Every
    /// listed part must exist at that point.
    #[instrument(skip_all, fields(package = %self.package.path().display(), parts = parts.len()))]
    pub fn sign(&mut self, parts: &[String], certificate: &Certificate) -> Result<PackageSignature> {
        let (Some(private_key), Some(der)) = (certificate.private_key(), certificate.der()) else {
            return Err(SigningError::Certificate(format!(
                "Certificate {} has no private key available to sign the package",
                certificate.thumbprint()
            )));
        };

        self.remove_signatures()?;

        let signature_part = format!(
            "{}/xml-signature/{}.psdsxs",
            SIGNATURE_DIR,
            uuid::Uuid::new_v4().simple()
        );

        if !self.package.has_part(ORIGIN_PART) {
            self.package.put_part(ORIGIN_PART, Vec::new());
        }
        let mut root_rels = self.package.relationships("/")?;
        if root_rels.by_type(ORIGIN_REL_TYPE).next().is_none() {
            root_rels.add(ORIGIN_REL_TYPE, ORIGIN_PART);
            self.package.set_relationships("/", &root_rels)?;
        }
        let mut origin_rels = self.package.relationships(ORIGIN_PART)?;
        origin_rels.add(
            SIGNATURE_REL_TYPE,
            signature_part.trim_start_matches(&format!("{}/", SIGNATURE_DIR)),
        );
        self.package.set_relationships(ORIGIN_PART, &origin_rels)?;

        let content_types = self.package.content_types_mut();
        content_types.ensure_default("psdor", ORIGIN_CONTENT_TYPE);
        content_types.ensure_default("psdsxs", SIGNATURE_CONTENT_TYPE);

        let mut references = Vec::with_capacity(parts.len() + 1);
        for part_name in parts {
            let data = self.package.part(part_name).ok_or_else(|| {
                SigningError::CryptographicSigning(format!("part {} does not exist", part_name))
            })?;
            references.push(Reference {
                part_name: part_name.clone(),
                content_type: self
                    .package
                    .content_type_of(part_name)
                    .unwrap_or_default()
                    .to_string(),
                digest: self.hash_algorithm,
                digest_value: BASE64.encode(self.hash_algorithm.digest(data)),
            });
        }

        let signing_time = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let object = PackageObject::new(&signing_time);
        references.push(Reference {
            part_name: PackageObject::reference_uri(),
            content_type: String::new(),
            digest: self.hash_algorithm,
            digest_value: BASE64.encode(self.hash_algorithm.digest(&object.canonical_bytes()?)),
        });

        let signed_info = SignedInfo {
            signature_method: self.hash_algorithm,
            references,
        };
        let hashed = self.hash_algorithm.digest(&signed_info.canonical_bytes()?);
        let signature_value = private_key
            .sign(pkcs1v15(self.hash_algorithm), &hashed)
            .map_err(|e| SigningError::CryptographicSigning(e.to_string()))?;

        let certificate_der = match self.embedding {
            CertificateEmbedding::InSignaturePart => Some(der),
            CertificateEmbedding::NotEmbedded => None,
        };
        let document = render_signature(
            &signed_info,
            &BASE64.encode(signature_value),
            certificate_der,
            &object,
        )?;
        self.package.put_part(&signature_part, document);

        info!(
            signature = %signature_part,
            algorithm = %self.hash_algorithm,
            "package signed"
        );
        Ok(PackageSignature {
            part_name: signature_part,
            signer: certificate.subject().map(str::to_string),
            thumbprint: Some(certificate.thumbprint().to_string()),
            signing_time: Some(signing_time),
        })
    }

    /// Remove every signature part and its relationship from the origin
    pub fn remove_signatures(&mut self) -> Result<()> {
        for part in self.signature_parts()? {
            debug!(part = %part, "removing existing signature");
            self.package.remove_part(&part);
        }
        let mut origin_rels = self.package.relationships(ORIGIN_PART)?;
        origin_rels.remove_by_type(SIGNATURE_REL_TYPE);
        self.package.set_relationships(ORIGIN_PART, &origin_rels)
    }

    /// Whether the package carries at least one signature part
    pub fn is_signed(&self) -> bool {
        self.signature_parts().is_ok_and(|parts| !parts.is_empty())
    }

    /// Signatures present in the package
    pub fn signatures(&self) -> Result<Vec<PackageSignature>> {
        self.signature_parts()?
            .into_iter()
            .map(|part_name| {
                let doc = self
                    .package
                    .part(&part_name)
                    .map(SignatureDocument::parse)
                    .transpose()?
                    .unwrap_or_default();
                let certificate = doc
                    .certificate
                    .as_deref()
                    .and_then(|b64| BASE64.decode(b64).ok())
                    .and_then(|der| Certificate::from_der(&der).ok());
                Ok(PackageSignature {
                    part_name,
                    signer: certificate
                        .as_ref()
                        .and_then(|c| c.subject().map(str::to_string)),
                    thumbprint: certificate.map(|c| c.thumbprint().to_string()),
                    signing_time: doc.signing_time,
                })
            })
            .collect()
    }

    /// Verify every signature against the current package content
    #[instrument(skip(self), fields(package = %self.package.path().display()))]
    pub fn verify_signatures(&self) -> VerifyResult {
        let parts = match self.signature_parts() {
            Ok(parts) => parts,
            Err(e) => {
                warn!(error = %e, "cannot read signature relationships");
                return VerifyResult::InvalidSignature;
            }
        };
        if parts.is_empty() {
            return VerifyResult::NotSigned;
        }

        for part in &parts {
            let result = self.verify_signature(part);
            if result != VerifyResult::Success {
                warn!(signature = %part, result = ?result, "signature does not verify");
                return result;
            }
        }
        VerifyResult::Success
    }

    fn verify_signature(&self, part_name: &str) -> VerifyResult {
        let Some(bytes) = self.package.part(part_name) else {
            return VerifyResult::ReferenceNotFound;
        };
        let Ok(doc) = SignatureDocument::parse(bytes) else {
            return VerifyResult::InvalidSignature;
        };
        let Ok(signed_info) = doc.signed_info() else {
            return VerifyResult::InvalidSignature;
        };

        let Some(certificate) = doc
            .certificate
            .as_deref()
            .and_then(|b64| BASE64.decode(b64).ok())
            .and_then(|der| Certificate::from_der(&der).ok())
        else {
            return VerifyResult::CertificateNotFound;
        };
        let Ok(public_key) = certificate.public_key() else {
            return VerifyResult::CertificateNotFound;
        };

        let Ok(canonical) = signed_info.canonical_bytes() else {
            return VerifyResult::InvalidSignature;
        };
        let Ok(signature_value) = BASE64.decode(&doc.signature_value) else {
            return VerifyResult::InvalidSignature;
        };
        let hashed = signed_info.signature_method.digest(&canonical);
        if public_key
            .verify(pkcs1v15(signed_info.signature_method), &hashed, &signature_value)
            .is_err()
        {
            return VerifyResult::InvalidSignature;
        }

        let mut object_covered = false;
        for reference in &signed_info.references {
            if reference.is_object() {
                let Some(object) = doc
                    .package_object()
                    .filter(|_| reference.part_name == PackageObject::reference_uri())
                else {
                    return VerifyResult::ReferenceNotFound;
                };
                let Ok(canonical) = object.canonical_bytes() else {
                    return VerifyResult::InvalidSignature;
                };
                if BASE64.encode(reference.digest.digest(&canonical)) != reference.digest_value {
                    return VerifyResult::ContentModified;
                }
                object_covered = true;
                continue;
            }

            let Some(data) = self.package.part(&reference.part_name) else {
                return VerifyResult::ReferenceNotFound;
            };
            if BASE64.encode(reference.digest.digest(data)) != reference.digest_value {
                return VerifyResult::ContentModified;
            }
            let content_type = self
                .package
                .content_type_of(&reference.part_name)
                .unwrap_or_default();
            if content_type != reference.content_type {
                return VerifyResult::ContentModified;
            }
        }

        let referenced: BTreeSet<&str> = signed_info
            .references
            .iter()
            .filter(|r| !r.is_object())
            .map(|r| r.part_name.as_str())
            .collect();
        let expected = parts_to_sign(self.package());
        let expected: BTreeSet<&str> = expected.iter().map(String::as_str).collect();
        if !object_covered || referenced != expected {
            return VerifyResult::IncompleteCoverage;
        }

        VerifyResult::Success
    }

    fn signature_parts(&self) -> Result<Vec<String>> {
        let root_rels = self.package.relationships("/")?;
        let Some(origin) = root_rels.by_type(ORIGIN_REL_TYPE).next() else {
            return Ok(Vec::new());
        };
        let origin_part = resolve_target("/", &origin.target);

        let origin_rels = self.package.relationships(&origin_part)?;
        Ok(origin_rels
            .by_type(SIGNATURE_REL_TYPE)
            .map(|rel| resolve_target(&origin_part, &rel.target))
            .collect())
    }
}

fn render_signature(
    signed_info: &SignedInfo,
    signature_value: &str,
    certificate_der: Option<&[u8]>,
    object: &PackageObject,
) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut writer = EmitterConfig::new().create_writer(&mut buf);

    writer.write(
        XmlEvent::start_element("Signature")
            .attr("Id", SIGNATURE_ID)
            .default_ns(XMLDSIG_NS),
    )?;
    signed_info.write(&mut writer, false)?;
    text_element(&mut writer, "SignatureValue", signature_value)?;

    if let Some(der) = certificate_der {
        writer.write(XmlEvent::start_element("KeyInfo"))?;
        writer.write(XmlEvent::start_element("X509Data"))?;
        text_element(&mut writer, "X509Certificate", &BASE64.encode(der))?;
        writer.write(XmlEvent::end_element())?;
        writer.write(XmlEvent::end_element())?;
    }

    object.write(&mut writer, false)?;
    writer.write(XmlEvent::end_element())?;

    Ok(buf)
}
