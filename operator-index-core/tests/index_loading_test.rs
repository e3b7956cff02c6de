//! Integration tests for index file loading
//!
//! Tests use static fixtures in `tests/fixtures/index/`:
//! - legacy_aliases.yml - `bundles`/`img` spellings, quoted numeric tag, default tag
//! - pinned.yml         - an entry with an expected digest
//! - duplicate.yml      - the same (image, tag) declared twice
//! - bad_version.yml    - version that is not semver
//! - embedded_tag.yml   - tag written into the image field
//! - unquoted_float_tag.yml - `tag: 1.10`, which YAML reads as the number 1.1

use operator_index_core::catalog::{self, write_version, IndexDescriptor, DEFAULT_TAG};
use operator_index_core::{IndexError, Stage};
use pretty_assertions::assert_eq;
use semver::Version;
use std::path::{Path, PathBuf};

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures/index")
        .join(name)
}

#[test]
fn test_legacy_aliases_are_accepted() {
    let descriptor = catalog::load(&fixture("legacy_aliases.yml")).unwrap();

    assert_eq!(descriptor.version, Version::new(2, 4, 0));
    assert_eq!(
        descriptor.catalog_image.as_deref(),
        Some("quay.io/acme/operator-index")
    );
    assert_eq!(descriptor.entries.len(), 2);

    let alpha = &descriptor.entries[0];
    assert_eq!(alpha.name.as_deref(), Some("alpha"));
    assert_eq!(alpha.image, "quay.io/acme/alpha-bundle");
    assert_eq!(alpha.tag, "1.0");

    let beta = &descriptor.entries[1];
    assert_eq!(beta.image, "registry.example.com:5000/acme/beta-bundle");
    assert_eq!(beta.tag, DEFAULT_TAG);
    assert_eq!(beta.display_name(), "registry.example.com:5000/acme/beta-bundle");
}

#[test]
fn test_pinned_entry_prefers_digest_reference() {
    let descriptor = IndexDescriptor::load(&fixture("pinned.yml")).unwrap();
    let entry = &descriptor.entries[0];

    let pin = format!("sha256:{}", "0".repeat(64));
    assert_eq!(entry.pin.as_deref(), Some(pin.as_str()));
    assert_eq!(
        entry.immutable_reference(),
        format!("quay.io/acme/alpha-bundle@{pin}")
    );
    assert_eq!(entry.tag_reference(), "quay.io/acme/alpha-bundle:1.0.0");
}

#[test]
fn test_duplicate_entries_are_rejected() {
    let err = catalog::load(&fixture("duplicate.yml")).unwrap_err();
    assert_eq!(err.stage(), Stage::Load);
    match err {
        IndexError::DuplicateEntry {
            image,
            first,
            second,
            ..
        } => {
            assert_eq!(image, "quay.io/acme/alpha-bundle");
            assert_eq!((first, second), (0, 2));
        }
        other => panic!("expected duplicate entry error, got {other:?}"),
    }
}

#[test]
fn test_invalid_files_name_the_field() {
    let err = catalog::load(&fixture("bad_version.yml")).unwrap_err();
    assert!(matches!(err, IndexError::Schema { ref field, .. } if field == "version"));

    let err = catalog::load(&fixture("embedded_tag.yml")).unwrap_err();
    assert!(
        matches!(err, IndexError::Schema { ref field, .. } if field == "operator_bundles[0].image")
    );
    assert!(err.to_string().contains("use the 'tag' field"));
}

#[test]
fn test_unquoted_float_tag_is_rejected_not_rewritten() {
    let err = catalog::load(&fixture("unquoted_float_tag.yml")).unwrap_err();
    assert_eq!(err.stage(), Stage::Load);
    match &err {
        IndexError::Schema { field, message, .. } => {
            assert_eq!(field, "operator_bundles[1].tag");
            assert!(message.contains("quote it"));
        }
        other => panic!("expected schema error, got {other:?}"),
    }
}

#[test]
fn test_missing_file_is_a_load_error() {
    let err = catalog::load(&fixture("does-not-exist.yml")).unwrap_err();
    assert!(matches!(err, IndexError::Parse { .. }));
    assert_eq!(err.stage(), Stage::Load);
}

#[test]
fn test_write_version_keeps_the_rest_of_the_file() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("operator-index.yml");
    let original = std::fs::read_to_string(fixture("legacy_aliases.yml")).unwrap();
    std::fs::write(&path, &original).unwrap();

    write_version(&path, &Version::new(2, 5, 0)).unwrap();

    let rewritten = std::fs::read_to_string(&path).unwrap();
    assert!(rewritten.starts_with("# Older index layout"));
    assert!(rewritten.contains("version: 2.5.0"));
    assert!(!rewritten.contains("2.4.0"));
    assert_eq!(rewritten.lines().count(), original.lines().count());

    let reloaded = catalog::load(&path).unwrap();
    assert_eq!(reloaded.version, Version::new(2, 5, 0));
    assert_eq!(reloaded.entries.len(), 2);
}
