//! Operator index file parsing (operator-index.yml)
//!
//! The index file declares the catalog version and every operator bundle
//! image that belongs in the catalog:
//!
//! ```yaml
//! version: 1.4.0
//! catalog_index:
//!   image: quay.io/acme/operator-index
//! operator_bundles:
//!   - name: acme-operator
//!     image: quay.io/acme/acme-operator-bundle
//!     tag: latest
//!   - image: quay.io/acme/widget-operator-bundle
//!     tag: v0.3.1
//!     pin: sha256:...
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{IndexError, Result};

/// Tag used when an entry does not declare one
pub const DEFAULT_TAG: &str = "latest";

/// OCI tag grammar
static TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}$").expect("valid tag regex"));

/// Content digests we accept from files and registries
static DIGEST_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(sha256:[a-f0-9]{64}|sha512:[a-f0-9]{128})$").expect("valid digest regex")
});

static VERSION_LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^version:[ \t]*\S.*$").expect("valid version line regex"));

/// Check that a string is a valid image tag
pub fn is_valid_tag(tag: &str) -> bool {
    TAG_RE.is_match(tag)
}

/// Check that a string is a well-formed content digest
pub fn is_valid_digest(digest: &str) -> bool {
    DIGEST_RE.is_match(digest)
}

/// Identity of a bundle entry
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryKey {
    pub image: String,
    pub tag: String,
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.image, self.tag)
    }
}

/// One declared operator bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleEntry {
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Registry and repository, without tag
    pub image: String,

    /// Mutable tag followed by the resolver
    pub tag: String,

    /// Pinned digest; when set the resolver verifies it instead of following the tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pin: Option<String>,

    /// Digest attached by the resolver
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_digest: Option<String>,
}

impl BundleEntry {
    pub fn new(image: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            name: None,
            image: image.into(),
            tag: tag.into(),
            pin: None,
            resolved_digest: None,
        }
    }

    /// Builder-style digest attachment
    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.resolved_digest = Some(digest.into());
        self
    }

    pub fn key(&self) -> EntryKey {
        EntryKey {
            image: self.image.clone(),
            tag: self.tag.clone(),
        }
    }

    /// `image:tag`, the mutable reference
    pub fn tag_reference(&self) -> String {
        format!("{}:{}", self.image, self.tag)
    }

    /// The most immutable reference known for this bundle
    pub fn immutable_reference(&self) -> String {
        match self.resolved_digest.as_deref().or(self.pin.as_deref()) {
            Some(digest) => format!("{}@{}", self.image, digest),
            None => self.tag_reference(),
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.image)
    }
}

/// The full catalog state declared by an index file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDescriptor {
    pub version: Version,

    /// Catalog image repository, without tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_image: Option<String>,

    pub entries: Vec<BundleEntry>,
}

// Raw shapes straight from YAML; validated into IndexDescriptor.
#[derive(Debug, Deserialize)]
struct RawIndexFile {
    #[serde(default)]
    version: Option<serde_yaml_ng::Value>,
    #[serde(default, alias = "bundles")]
    operator_bundles: Option<Vec<RawBundle>>,
    #[serde(default)]
    catalog_index: Option<RawCatalogIndex>,
}

#[derive(Debug, Deserialize)]
struct RawBundle {
    #[serde(default)]
    name: Option<String>,
    #[serde(default, alias = "img")]
    image: Option<String>,
    #[serde(default)]
    tag: Option<serde_yaml_ng::Value>,
    #[serde(default)]
    pin: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawCatalogIndex {
    #[serde(default, alias = "img")]
    image: Option<String>,
    #[serde(default)]
    tag: Option<serde_yaml_ng::Value>,
}

// Output shape for to_yaml, mirroring the file layout.
#[derive(Serialize)]
struct IndexFileOut<'a> {
    version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    catalog_index: Option<CatalogIndexOut<'a>>,
    operator_bundles: Vec<BundleOut<'a>>,
}

#[derive(Serialize)]
struct CatalogIndexOut<'a> {
    image: &'a str,
}

#[derive(Serialize)]
struct BundleOut<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    image: &'a str,
    tag: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pin: Option<&'a str>,
}

/// Load and validate an index file
pub fn load(path: &Path) -> Result<IndexDescriptor> {
    IndexDescriptor::load(path)
}

impl IndexDescriptor {
    pub fn new(version: Version) -> Self {
        Self {
            version,
            catalog_image: None,
            entries: Vec::new(),
        }
    }

    /// Load and validate an index file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| IndexError::Parse {
            path: path.to_path_buf(),
            message: format!("cannot read file: {e}"),
        })?;

        let descriptor = Self::from_yaml(&content, path)?;
        tracing::debug!(
            "Loaded index {} with version {} and {} bundle(s)",
            path.display(),
            descriptor.version,
            descriptor.entries.len()
        );
        Ok(descriptor)
    }

    /// Parse and validate index YAML; `path` is only used in error messages
    pub fn from_yaml(content: &str, path: &Path) -> Result<Self> {
        let raw: RawIndexFile =
            serde_yaml_ng::from_str(content).map_err(|e| IndexError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;

        let schema = |field: &str, message: &str| IndexError::Schema {
            path: path.to_path_buf(),
            field: field.to_string(),
            message: message.to_string(),
        };

        let version = match raw.version {
            None => return Err(schema("version", "is required")),
            Some(serde_yaml_ng::Value::String(s)) => Version::parse(s.trim()).map_err(|e| {
                schema("version", &format!("is not a semantic version ({e})"))
            })?,
            Some(_) => {
                return Err(schema(
                    "version",
                    "must be a quoted or plain semantic version such as 1.0.0",
                ))
            }
        };

        let catalog_image = match raw.catalog_index {
            Some(section) => {
                if section.tag.is_some() {
                    tracing::warn!(
                        "catalog_index.tag in {} is ignored; catalog tags come from the branch policy",
                        path.display()
                    );
                }
                match section.image {
                    Some(image) => {
                        let image = image.trim().to_string();
                        validate_image(&image)
                            .map_err(|message| schema("catalog_index.image", &message))?;
                        Some(image)
                    }
                    None => None,
                }
            }
            None => None,
        };

        let raw_bundles = raw
            .operator_bundles
            .ok_or_else(|| schema("operator_bundles", "is required (use [] for none)"))?;

        let mut entries = Vec::with_capacity(raw_bundles.len());
        let mut seen: HashMap<EntryKey, usize> = HashMap::new();

        for (position, bundle) in raw_bundles.into_iter().enumerate() {
            let field = |name: &str| format!("operator_bundles[{position}].{name}");

            let image = bundle.image.unwrap_or_default().trim().to_string();
            validate_image(&image).map_err(|message| schema(&field("image"), &message))?;

            let tag = match bundle.tag {
                None => DEFAULT_TAG.to_string(),
                Some(value) => {
                    tag_from_yaml(&value).map_err(|message| schema(&field("tag"), &message))?
                }
            };
            if !TAG_RE.is_match(&tag) {
                return Err(schema(
                    &field("tag"),
                    &format!("'{tag}' is not a valid image tag"),
                ));
            }

            let pin = match bundle.pin {
                Some(pin) => {
                    let pin = pin.trim().to_string();
                    if !is_valid_digest(&pin) {
                        return Err(schema(
                            &field("pin"),
                            &format!("'{pin}' is not a sha256/sha512 digest"),
                        ));
                    }
                    Some(pin)
                }
                None => None,
            };

            let entry = BundleEntry {
                name: bundle.name.filter(|n| !n.trim().is_empty()),
                image,
                tag,
                pin,
                resolved_digest: None,
            };

            if let Some(first) = seen.insert(entry.key(), position) {
                return Err(IndexError::DuplicateEntry {
                    path: path.to_path_buf(),
                    image: entry.image,
                    tag: entry.tag,
                    first,
                    second: position,
                });
            }

            entries.push(entry);
        }

        if entries.is_empty() {
            tracing::warn!("Index {} declares no operator bundles", path.display());
        }

        Ok(Self {
            version,
            catalog_image,
            entries,
        })
    }

    /// Serialize back to the index file layout (resolved digests are not written)
    pub fn to_yaml(&self) -> Result<String> {
        let out = IndexFileOut {
            version: self.version.to_string(),
            catalog_index: self
                .catalog_image
                .as_deref()
                .map(|image| CatalogIndexOut { image }),
            operator_bundles: self
                .entries
                .iter()
                .map(|e| BundleOut {
                    name: e.name.as_deref(),
                    image: &e.image,
                    tag: &e.tag,
                    pin: e.pin.as_deref(),
                })
                .collect(),
        };

        serde_yaml_ng::to_string(&out)
            .map_err(|e| IndexError::Config(format!("failed to serialize index: {e}")))
    }

    /// Entry identities, sorted
    pub fn keys(&self) -> Vec<EntryKey> {
        let mut keys: Vec<EntryKey> = self.entries.iter().map(BundleEntry::key).collect();
        keys.sort();
        keys
    }

    /// A copy of this descriptor with a different entry set and version
    pub fn with_entries(&self, version: Version, entries: Vec<BundleEntry>) -> Self {
        Self {
            version,
            catalog_image: self.catalog_image.clone(),
            entries,
        }
    }
}

/// Rewrite the `version:` line of an index file, leaving everything else intact
pub fn write_version(path: &Path, version: &Version) -> Result<()> {
    let content = std::fs::read_to_string(path).map_err(|e| IndexError::io(path, e))?;

    if !VERSION_LINE_RE.is_match(&content) {
        return Err(IndexError::Schema {
            path: path.to_path_buf(),
            field: "version".to_string(),
            message: "has no top-level line to rewrite".to_string(),
        });
    }

    let replacement = format!("version: {version}");
    let updated = VERSION_LINE_RE.replace(&content, replacement.as_str());
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut staged = tempfile::NamedTempFile::new_in(dir).map_err(|e| IndexError::io(dir, e))?;
    staged
        .write_all(updated.as_bytes())
        .map_err(|e| IndexError::io(staged.path(), e))?;
    staged
        .persist(path)
        .map_err(|e| IndexError::io(path, e.error))?;

    tracing::info!("Wrote version {} to {}", version, path.display());
    Ok(())
}

fn validate_image(image: &str) -> std::result::Result<(), String> {
    if image.is_empty() {
        return Err("is required and must not be empty".to_string());
    }
    if image.chars().any(char::is_whitespace) {
        return Err(format!("'{image}' must not contain whitespace"));
    }
    if image.contains('@') {
        return Err(format!(
            "'{image}' must not embed a digest; use the 'pin' field"
        ));
    }
    // A colon after the last slash is a tag, not a registry port
    let last_segment = image.rsplit('/').next().unwrap_or(image);
    if last_segment.contains(':') {
        return Err(format!("'{image}' must not embed a tag; use the 'tag' field"));
    }
    Ok(())
}

// Only strings are taken verbatim; a YAML number has already lost its
// spelling (1.10 reads as 1.1).
fn tag_from_yaml(value: &serde_yaml_ng::Value) -> std::result::Result<String, String> {
    match value {
        serde_yaml_ng::Value::String(s) => Ok(s.trim().to_string()),
        serde_yaml_ng::Value::Number(n) => Err(format!(
            "was read as the number {n}; quote it (tag: \"...\") so it is used exactly as written"
        )),
        _ => Err("must be a string".to_string()),
    }
}

/// Default index file location relative to the working directory
pub fn default_index_path() -> PathBuf {
    PathBuf::from("operator-index.yml")
}
