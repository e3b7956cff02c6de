//! Change classification and semantic version bumps
//!
//! Diffs the resolved bundle set against the last released snapshot.
//! The single highest-impact change decides the bump:
//!
//! | Change              | Bump  |
//! |---------------------|-------|
//! | any bundle removed  | major |
//! | any bundle added    | minor |
//! | digest or pin moved | patch |
//! | nothing             | error |

use semver::{BuildMetadata, Prerelease, Version};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use super::index::{BundleEntry, EntryKey, IndexDescriptor};
use crate::error::{IndexError, Result};

/// Version component to increment; ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Bump {
    Patch,
    Minor,
    Major,
}

impl Bump {
    /// Next version after `version`, dropping pre-release and build metadata
    pub fn apply(&self, version: &Version) -> Version {
        let mut next = match self {
            Bump::Major => Version::new(version.major + 1, 0, 0),
            Bump::Minor => Version::new(version.major, version.minor + 1, 0),
            Bump::Patch => Version::new(version.major, version.minor, version.patch + 1),
        };
        next.pre = Prerelease::EMPTY;
        next.build = BuildMetadata::EMPTY;
        next
    }
}

impl fmt::Display for Bump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Bump::Patch => "patch",
            Bump::Minor => "minor",
            Bump::Major => "major",
        };
        f.write_str(label)
    }
}

/// A bundle whose identity is unchanged but whose content moved
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagUpdate {
    pub previous: BundleEntry,
    pub current: BundleEntry,
}

/// Differences between two bundle sets
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSet {
    pub added: Vec<BundleEntry>,
    pub removed: Vec<BundleEntry>,
    pub tag_updated: Vec<TagUpdate>,
}

impl ChangeSet {
    /// Classify every identity present in either set; output is sorted by identity
    pub fn between(previous: &[BundleEntry], current: &[BundleEntry]) -> Self {
        let before: BTreeMap<EntryKey, &BundleEntry> =
            previous.iter().map(|e| (e.key(), e)).collect();
        let after: BTreeMap<EntryKey, &BundleEntry> =
            current.iter().map(|e| (e.key(), e)).collect();

        let mut changes = ChangeSet::default();

        for (key, entry) in &after {
            match before.get(key) {
                None => changes.added.push((*entry).clone()),
                Some(old) => {
                    if old.resolved_digest != entry.resolved_digest || old.pin != entry.pin {
                        changes.tag_updated.push(TagUpdate {
                            previous: (*old).clone(),
                            current: (*entry).clone(),
                        });
                    }
                }
            }
        }

        for (key, entry) in &before {
            if !after.contains_key(key) {
                changes.removed.push((*entry).clone());
            }
        }

        changes
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.tag_updated.is_empty()
    }

    /// Highest-impact bump this change set requires; never cumulative
    pub fn required_bump(&self) -> Option<Bump> {
        if !self.removed.is_empty() {
            Some(Bump::Major)
        } else if !self.added.is_empty() {
            Some(Bump::Minor)
        } else if !self.tag_updated.is_empty() {
            Some(Bump::Patch)
        } else {
            None
        }
    }
}

/// Diff `current` against the previous release and compute the next version
pub fn diff(previous: &IndexDescriptor, current: &[BundleEntry]) -> Result<(ChangeSet, Version)> {
    let changes = ChangeSet::between(&previous.entries, current);

    let bump = changes.required_bump().ok_or_else(|| IndexError::NoOpRelease {
        previous: previous.version.clone(),
    })?;

    let next = bump.apply(&previous.version);
    if next <= previous.version {
        return Err(IndexError::VersionRegression {
            previous: previous.version.clone(),
            next,
        });
    }

    tracing::info!(
        "{} added, {} removed, {} updated: {} bump {} -> {}",
        changes.added.len(),
        changes.removed.len(),
        changes.tag_updated.len(),
        bump,
        previous.version,
        next
    );

    Ok((changes, next))
}

/// With nothing released yet, everything is new and the declared version stands
pub fn first_release(declared: &Version, current: &[BundleEntry]) -> (ChangeSet, Version) {
    let changes = ChangeSet::between(&[], current);
    tracing::info!(
        "No previous release; first release is {} with {} bundle(s)",
        declared,
        changes.added.len()
    );
    (changes, declared.clone())
}

/// Warn when the index file's declared version disagrees with the computed one
pub fn check_declared_version(declared: &Version, computed: &Version) -> bool {
    if declared == computed {
        return true;
    }
    tracing::warn!(
        "Index file declares version {} but the computed release version is {}; using {}",
        declared,
        computed,
        computed
    );
    false
}
