//! Release pipeline: load → resolve → diff → build → record
//!
//! One release attempt runs the stages strictly in order. The release log is
//! only written after a successful release-policy build, while holding the
//! single-release lock.

use chrono::Utc;
use semver::Version;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::catalog::{
    check_declared_version, diff, first_release, BranchPolicy, BuildResult, BundleEntry,
    ChangeSet, IndexBuilder, IndexDescriptor, RegistryClient, ReleaseLock, ReleaseLog,
    ReleaseRecord, Resolver,
};
use crate::config::ReleaseConfig;
use crate::error::Result;

/// Revision recorded when git cannot tell us
pub const UNKNOWN_REVISION: &str = "unknown";

const GIT_TIMEOUT: Duration = Duration::from_secs(10);

/// What a release would publish
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleasePlan {
    /// Last released version, if any
    pub previous: Option<Version>,
    /// Version declared in the index file
    pub declared: Version,
    /// Version this release publishes
    pub version: Version,
    pub changes: ChangeSet,
    /// Resolved descriptor at `version`
    pub descriptor: IndexDescriptor,
}

/// Caller-controlled release parameters
#[derive(Debug, Clone)]
pub struct ReleaseOptions {
    pub policy: BranchPolicy,
    /// Recorded revision; detected with git when unset
    pub git_revision: Option<String>,
    /// Publish an image already built locally instead of running opm
    pub reuse_local_image: bool,
}

/// Result of a completed release
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseOutcome {
    pub plan: ReleasePlan,
    pub build: BuildResult,
    /// Appended record; absent for development builds
    pub record: Option<ReleaseRecord>,
}

/// Drives the four stages against one index file and release log
pub struct ReleasePipeline {
    config: ReleaseConfig,
    resolver: Resolver,
    log: ReleaseLog,
}

impl ReleasePipeline {
    pub fn new(config: ReleaseConfig, registry: Arc<dyn RegistryClient>) -> Self {
        let resolver = Resolver::from_settings(registry, &config.registry);
        let log = ReleaseLog::new(config.release_log_path());
        Self {
            config,
            resolver,
            log,
        }
    }

    pub fn config(&self) -> &ReleaseConfig {
        &self.config
    }

    pub fn log(&self) -> &ReleaseLog {
        &self.log
    }

    /// Load the index file, filling the catalog image from config when absent
    pub fn load(&self) -> Result<IndexDescriptor> {
        tracing::info!("Loading index {}", self.config.index_file.display());
        let mut descriptor = IndexDescriptor::load(&self.config.index_file)?;
        if descriptor.catalog_image.is_none() {
            descriptor.catalog_image = self.config.catalog_image.clone();
        }
        Ok(descriptor)
    }

    /// Load and resolve every declared bundle
    pub async fn resolve(&self) -> Result<(IndexDescriptor, Vec<BundleEntry>)> {
        let declared = self.load()?;
        let resolved = self.resolver.resolve(declared.entries.clone()).await?;
        Ok((declared, resolved))
    }

    /// Load, resolve and diff against the last release
    pub async fn plan(&self) -> Result<ReleasePlan> {
        let (declared, resolved) = self.resolve().await?;
        let previous = self.log.latest()?;

        let (changes, version) = match &previous {
            Some(record) => {
                tracing::info!("Diffing against release {}", record.version);
                diff(&record.descriptor(), &resolved)?
            }
            None => first_release(&declared.version, &resolved),
        };

        check_declared_version(&declared.version, &version);

        Ok(ReleasePlan {
            previous: previous.map(|r| r.version),
            declared: declared.version.clone(),
            descriptor: declared.with_entries(version.clone(), resolved),
            version,
            changes,
        })
    }

    /// Run the full pipeline and publish
    pub async fn release(
        &self,
        builder: &IndexBuilder,
        options: &ReleaseOptions,
    ) -> Result<ReleaseOutcome> {
        let _lock = ReleaseLock::acquire(self.config.lock_path())?;

        let plan = self.plan().await?;
        let build = if options.reuse_local_image {
            let build = builder
                .publish_existing(&plan.descriptor, options.policy)
                .await?;
            tracing::info!("Published local image {}", build.primary_reference());
            build
        } else {
            let build = builder.build(&plan.descriptor, options.policy).await?;
            tracing::info!("Built {}", build.primary_reference());
            build
        };

        let record = match options.policy {
            BranchPolicy::Release => {
                let git_revision = match &options.git_revision {
                    Some(revision) => revision.clone(),
                    None => detect_git_revision(&self.config.index_file).await,
                };

                let record = ReleaseRecord {
                    version: plan.version.clone(),
                    committed_at: Utc::now(),
                    git_revision,
                    image: Some(build.image.clone()),
                    tags: build.tags.clone(),
                    entries: plan.descriptor.entries.clone(),
                };
                self.log.append(&record)?;
                Some(record)
            }
            BranchPolicy::Development => {
                tracing::info!(
                    "Development build of {}; release log unchanged",
                    plan.version
                );
                None
            }
        };

        Ok(ReleaseOutcome {
            plan,
            build,
            record,
        })
    }
}

/// `git rev-parse HEAD` next to the index file, or `unknown`
pub async fn detect_git_revision(index_file: &Path) -> String {
    let dir = match index_file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let mut command = tokio::process::Command::new("git");
    command
        .arg("rev-parse")
        .arg("HEAD")
        .current_dir(&dir)
        .kill_on_drop(true);

    match tokio::time::timeout(GIT_TIMEOUT, command.output()).await {
        Ok(Ok(output)) if output.status.success() => {
            let revision = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !revision.is_empty() {
                return revision;
            }
        }
        Ok(Ok(output)) => {
            tracing::debug!(
                "git rev-parse failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(Err(e)) => tracing::debug!("Could not run git: {}", e),
        Err(_) => tracing::debug!("git rev-parse timed out"),
    }

    tracing::warn!(
        "Could not determine git revision in {}; recording '{}'",
        dir.display(),
        UNKNOWN_REVISION
    );
    UNKNOWN_REVISION.to_string()
}
