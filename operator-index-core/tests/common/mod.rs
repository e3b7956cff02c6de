//! Test helper functions for integration tests
//!
//! Shared across test files using the tests/common/ pattern. Build tools are
//! replaced by small shell scripts that append their arguments to a log file.

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use operator_index_core::catalog::{
    BranchPolicy, ContainerRuntime, IndexBuilder, LookupFailure, RegistryClient,
};
use operator_index_core::config::ReleaseConfig;
use operator_index_core::error::LookupFailureKind;
use operator_index_core::release::{ReleaseOptions, ReleasePipeline};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};

/// Initialize logging for tests (only once per test run)
static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_test_writer()
                    .with_target(true)
                    .with_level(true),
            )
            .with(tracing_subscriber::filter::EnvFilter::from_default_env())
            .try_init();
    });
}

pub fn digest(seed: char) -> String {
    format!("sha256:{}", seed.to_string().repeat(64))
}

/// Registry answering from a mutable reference -> digest table
#[derive(Default)]
pub struct FakeRegistry {
    answers: Mutex<HashMap<String, String>>,
    calls: AtomicUsize,
}

impl FakeRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn publish(&self, reference: &str, digest: String) {
        self.answers
            .lock()
            .unwrap()
            .insert(reference.to_string(), digest);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RegistryClient for FakeRegistry {
    async fn manifest_digest(&self, reference: &str) -> Result<String, LookupFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answers
            .lock()
            .unwrap()
            .get(reference)
            .cloned()
            .ok_or_else(|| LookupFailure::new(LookupFailureKind::NotFound, "manifest unknown"))
    }
}

/// A scratch project: index file, state dir and fake build tools
pub struct TestProject {
    pub dir: tempfile::TempDir,
}

impl TestProject {
    pub fn new() -> Result<Self> {
        init_test_logging();
        let dir = tempfile::TempDir::new()?;
        fs::create_dir_all(dir.path().join("bin"))?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn index_path(&self) -> PathBuf {
        self.path().join("operator-index.yml")
    }

    pub fn write_index(&self, content: &str) -> Result<PathBuf> {
        let path = self.index_path();
        fs::write(&path, content)?;
        Ok(path)
    }

    pub fn config(&self) -> ReleaseConfig {
        ReleaseConfig {
            index_file: self.index_path(),
            state_dir: self.path().join(".operator-index"),
            ..Default::default()
        }
    }

    pub fn pipeline(&self, registry: Arc<FakeRegistry>) -> ReleasePipeline {
        ReleasePipeline::new(self.config(), registry)
    }

    /// Log of `opm` invocations, one line each
    pub fn opm_log(&self) -> PathBuf {
        self.path().join("opm.log")
    }

    /// Log of container runtime invocations, one line each
    pub fn runtime_log(&self) -> PathBuf {
        self.path().join("runtime.log")
    }

    /// Images the fake runtime reports as built locally
    pub fn local_images(&self) -> PathBuf {
        self.path().join("local_images.txt")
    }

    pub fn set_local_images(&self, images: &[&str]) -> Result<()> {
        let mut listing = images.join("\n");
        listing.push('\n');
        fs::write(self.local_images(), listing)?;
        Ok(())
    }

    pub fn read_log(&self, path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .map(|content| content.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Builder wired to fake opm and runtime scripts
    pub fn builder(&self, opm_succeeds: bool) -> Result<IndexBuilder> {
        let opm_body = if opm_succeeds {
            format!(
                "echo \"$@\" >> '{}'\necho 'catalog built'\nexit 0\n",
                self.opm_log().display()
            )
        } else {
            format!(
                "echo \"$@\" >> '{}'\necho 'error: failed to pull bundle image' >&2\nexit 3\n",
                self.opm_log().display()
            )
        };
        let opm = write_script(&self.path().join("bin"), "opm", &opm_body)?;

        // `images` lists local_images.txt; every other call is logged
        let runtime_body = format!(
            "if [ \"$1\" = images ]; then cat '{}' 2>/dev/null; exit 0; fi\necho \"$@\" >> '{}'\nexit 0\n",
            self.local_images().display(),
            self.runtime_log().display()
        );
        let runtime = write_script(&self.path().join("bin"), "docker", &runtime_body)?;

        Ok(IndexBuilder::new(opm, ContainerRuntime::new("docker", runtime)))
    }
}

pub fn release_options() -> ReleaseOptions {
    ReleaseOptions {
        policy: BranchPolicy::Release,
        git_revision: Some("0123abcd".to_string()),
        reuse_local_image: false,
    }
}

/// Release options that push an image built earlier
pub fn publish_options() -> ReleaseOptions {
    ReleaseOptions {
        reuse_local_image: true,
        ..release_options()
    }
}

pub fn development_options() -> ReleaseOptions {
    ReleaseOptions {
        policy: BranchPolicy::Development,
        git_revision: None,
        reuse_local_image: false,
    }
}

/// Write an executable `/bin/sh` script
pub fn write_script(dir: &Path, name: &str, body: &str) -> Result<PathBuf> {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}"))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
    }

    Ok(path)
}
