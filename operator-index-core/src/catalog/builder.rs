//! Catalog image build, tag and push
//!
//! Drives `opm index add` with the resolved bundle set, then applies the
//! branch policy tags with the container runtime and pushes them. Every
//! subprocess is killed on drop and bounded by a timeout; failures are
//! reported with their captured output and never retried.

use semver::Version;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

use super::index::{is_valid_tag, IndexDescriptor};
use crate::config::BuildSettings;
use crate::error::{IndexError, Result};

/// Default timeout for each build, tag or push step
pub const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(900);

/// Environment variable overriding the opm location
pub const OPM_PATH_ENV: &str = "OPERATOR_INDEX_OPM_PATH";

/// Runtimes tried in order when none is configured
const KNOWN_RUNTIMES: &[&str] = &["docker", "podman"];

/// Which release track a build belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchPolicy {
    Development,
    Release,
}

impl BranchPolicy {
    /// Exactly two tags: the versioned primary tag, then the floating tag
    pub fn output_tags(&self, version: &Version) -> Vec<String> {
        match self {
            BranchPolicy::Development => {
                vec![format!("{version}-dev"), self.floating_tag().to_string()]
            }
            BranchPolicy::Release => vec![version.to_string(), self.floating_tag().to_string()],
        }
    }

    /// Policy tags followed by `extra`, without duplicates
    ///
    /// An `extension` suffixes the primary tag only: `1.2.0-rc` or
    /// `1.2.0-dev-rc`. The floating tag is never extended.
    pub fn tags_with(
        &self,
        version: &Version,
        extension: Option<&str>,
        extra: &[String],
    ) -> Vec<String> {
        let mut tags = self.output_tags(version);
        if let Some(extension) = extension {
            tags[0] = format!("{}-{}", tags[0], extension);
        }
        for tag in extra {
            if !tags.contains(tag) {
                tags.push(tag.clone());
            }
        }
        tags
    }

    pub fn floating_tag(&self) -> &'static str {
        match self {
            BranchPolicy::Development => "develop",
            BranchPolicy::Release => "latest",
        }
    }
}

impl fmt::Display for BranchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BranchPolicy::Development => f.write_str("development"),
            BranchPolicy::Release => f.write_str("release"),
        }
    }
}

impl FromStr for BranchPolicy {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "development" | "develop" | "dev" => Ok(BranchPolicy::Development),
            "release" | "main" | "master" => Ok(BranchPolicy::Release),
            other => Err(IndexError::Config(format!(
                "unknown branch policy '{other}' (expected 'development' or 'release')"
            ))),
        }
    }
}

/// Locate the opm binary
///
/// 1. An explicitly configured path
/// 2. `OPERATOR_INDEX_OPM_PATH`
/// 3. An `opm` shipped next to this executable
/// 4. `opm` from the system PATH
pub fn find_opm_binary(configured: Option<&Path>) -> PathBuf {
    if let Some(path) = configured {
        tracing::debug!("Using configured opm at: {:?}", path);
        return path.to_path_buf();
    }

    if let Ok(opm_path) = std::env::var(OPM_PATH_ENV) {
        let path = PathBuf::from(opm_path);
        if path.exists() {
            tracing::debug!("Using opm from {}: {:?}", OPM_PATH_ENV, path);
            return path;
        }
    }

    if let Ok(current_exe) = std::env::current_exe() {
        if let Some(exe_dir) = current_exe.parent() {
            let bundled = exe_dir.join("opm");
            if bundled.exists() {
                tracing::debug!("Using bundled opm at: {:?}", bundled);
                return bundled;
            }
        }
    }

    tracing::debug!("Using opm from system PATH");
    PathBuf::from("opm")
}

/// Container runtime used by opm to build, and by us to tag and push
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRuntime {
    /// Name handed to `opm --build-tool`
    pub name: String,
    pub path: PathBuf,
}

impl ContainerRuntime {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }

    /// Use the configured runtime, or the first real docker/podman on PATH
    ///
    /// Symlinked shims (e.g. podman-docker's `docker`) are skipped during
    /// detection so the build tool matches the binary actually invoked.
    pub fn detect(configured: Option<&str>) -> Result<Self> {
        if let Some(runtime) = configured {
            let path = PathBuf::from(runtime);
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| runtime.to_string());
            let path = if runtime.contains('/') {
                path
            } else {
                find_on_path(runtime, true).unwrap_or(path)
            };
            tracing::debug!("Using configured container runtime {} at {:?}", name, path);
            return Ok(Self::new(name, path));
        }

        for name in KNOWN_RUNTIMES {
            if let Some(path) = find_on_path(name, false) {
                tracing::debug!("Detected container runtime {} at {:?}", name, path);
                return Ok(Self::new(*name, path));
            }
        }

        Err(IndexError::BuildTool {
            step: "detect container runtime".to_string(),
            status: None,
            timed_out: false,
            stdout: String::new(),
            stderr: "Unable to identify a container runtime: neither docker nor podman found on PATH"
                .to_string(),
        })
    }
}

fn find_on_path(name: &str, allow_symlink: bool) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| {
            let Ok(metadata) = std::fs::symlink_metadata(candidate) else {
                return false;
            };
            if metadata.file_type().is_symlink() {
                allow_symlink && candidate.is_file()
            } else {
                metadata.is_file()
            }
        })
}

/// Outcome of a successful build
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildResult {
    /// Catalog image repository
    pub image: String,
    /// Tags applied, primary first
    pub tags: Vec<String>,
    /// Bundle references handed to opm
    pub bundles: Vec<String>,
    pub pushed: bool,
    /// Captured build tool stdout
    pub output: String,
}

impl BuildResult {
    pub fn primary_reference(&self) -> String {
        match self.tags.first() {
            Some(tag) => format!("{}:{}", self.image, tag),
            None => self.image.clone(),
        }
    }
}

struct StepOutput {
    stdout: String,
}

/// A child's pipe drained on its own task, so partial output survives a kill
struct PipeCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
    task: Option<JoinHandle<()>>,
}

impl PipeCapture {
    fn spawn<R>(pipe: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let task = pipe.map(|mut pipe| {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move {
                let mut chunk = [0u8; 8192];
                loop {
                    match pipe.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => buffer
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner())
                            .extend_from_slice(&chunk[..n]),
                    }
                }
            })
        });
        Self { buffer, task }
    }

    /// Wait for the pipe to close and return everything read
    async fn finish(mut self) -> String {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.text()
    }

    /// Stop reading and return what arrived so far
    fn abort(mut self) -> String {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.text()
    }

    fn text(&self) -> String {
        let buffer = self
            .buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

/// Builds the catalog image through opm and the container runtime
pub struct IndexBuilder {
    opm: PathBuf,
    runtime: ContainerRuntime,
    timeout: Duration,
    push: bool,
    tag_extension: Option<String>,
    extra_tags: Vec<String>,
}

impl IndexBuilder {
    pub fn new(opm: impl Into<PathBuf>, runtime: ContainerRuntime) -> Self {
        Self {
            opm: opm.into(),
            runtime,
            timeout: DEFAULT_BUILD_TIMEOUT,
            push: true,
            tag_extension: None,
            extra_tags: Vec::new(),
        }
    }

    pub fn from_settings(settings: &BuildSettings) -> Result<Self> {
        let runtime = ContainerRuntime::detect(settings.runtime.as_deref())?;
        let opm = find_opm_binary(settings.opm_path.as_deref());
        Ok(Self::new(opm, runtime)
            .with_timeout(Duration::from_secs(settings.timeout_seconds))
            .with_push(settings.push))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_push(mut self, push: bool) -> Self {
        self.push = push;
        self
    }

    /// Identifier appended to the primary tag (`1.2.0-<ext>`)
    pub fn with_tag_extension(mut self, extension: Option<String>) -> Self {
        self.tag_extension = extension
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty());
        self
    }

    /// Additional tags applied and pushed alongside the policy tags
    pub fn with_extra_tags(mut self, tags: Vec<String>) -> Self {
        self.extra_tags = tags
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        self
    }

    pub fn runtime(&self) -> &ContainerRuntime {
        &self.runtime
    }

    /// Policy tags (primary extended) followed by extra tags, without duplicates
    pub fn tags_for(&self, version: &Version, policy: BranchPolicy) -> Vec<String> {
        policy.tags_with(version, self.tag_extension.as_deref(), &self.extra_tags)
    }

    /// Arguments for `opm index add`
    pub fn index_add_args(&self, bundles: &[String], target: &str) -> Vec<String> {
        vec![
            "index".to_string(),
            "add".to_string(),
            "--build-tool".to_string(),
            self.runtime.name.clone(),
            "--bundles".to_string(),
            bundles.join(","),
            "--tag".to_string(),
            target.to_string(),
        ]
    }

    /// Build, tag and (unless disabled) push the catalog image
    pub async fn build(
        &self,
        descriptor: &IndexDescriptor,
        policy: BranchPolicy,
    ) -> Result<BuildResult> {
        let (image, tags) = self.targets(descriptor, policy)?;

        if descriptor.entries.is_empty() {
            tracing::warn!("Building catalog {} with no bundles", image);
        }

        let primary = format!("{}:{}", image, tags[0]);
        let bundles = bundle_references(descriptor);

        tracing::info!(
            "Building {} from {} bundle(s) ({} policy)",
            primary,
            bundles.len(),
            policy
        );

        let args = self.index_add_args(&bundles, &primary);
        let build = self.run_step("opm index add", &self.opm, &args).await?;

        self.tag_and_push(&image, &tags).await?;

        Ok(BuildResult {
            image,
            tags,
            bundles,
            pushed: self.push,
            output: build.stdout,
        })
    }

    /// Tag and push an image already built locally, without running opm
    ///
    /// The extended primary tag is looked for first, then the plain one,
    /// which is retagged with the extension when found.
    pub async fn publish_existing(
        &self,
        descriptor: &IndexDescriptor,
        policy: BranchPolicy,
    ) -> Result<BuildResult> {
        let (image, tags) = self.targets(descriptor, policy)?;
        let primary = format!("{}:{}", image, tags[0]);
        let plain = format!("{}:{}", image, policy.output_tags(&descriptor.version)[0]);

        let listing = self
            .run_step(
                "list local images",
                &self.runtime.path,
                &[
                    "images".to_string(),
                    "--format".to_string(),
                    "{{.Repository}}:{{.Tag}}".to_string(),
                ],
            )
            .await?;
        let local: Vec<&str> = listing.stdout.lines().map(str::trim).collect();

        if local.contains(&primary.as_str()) {
            tracing::info!("Found local image {}", primary);
        } else if primary != plain && local.contains(&plain.as_str()) {
            tracing::info!("Retagging {} as {}", plain, primary);
            let step = format!("{} tag {}", self.runtime.name, primary);
            let args = vec!["tag".to_string(), plain, primary.clone()];
            self.run_step(&step, &self.runtime.path, &args).await?;
        } else {
            return Err(IndexError::BuildTool {
                step: "find local image".to_string(),
                status: None,
                timed_out: false,
                stdout: listing.stdout,
                stderr: format!("Unable to find the appropriate image to push: {primary}"),
            });
        }

        self.tag_and_push(&image, &tags).await?;

        Ok(BuildResult {
            image,
            tags,
            bundles: bundle_references(descriptor),
            pushed: self.push,
            output: String::new(),
        })
    }

    fn targets(
        &self,
        descriptor: &IndexDescriptor,
        policy: BranchPolicy,
    ) -> Result<(String, Vec<String>)> {
        let image = descriptor.catalog_image.clone().ok_or_else(|| {
            IndexError::Config(
                "no catalog image: set catalog_index.image in the index file or catalog_image in the config"
                    .to_string(),
            )
        })?;

        let tags = self.tags_for(&descriptor.version, policy);
        if let Some(bad) = tags.iter().find(|tag| !is_valid_tag(tag)) {
            return Err(IndexError::Config(format!(
                "'{bad}' is not a valid image tag (check the tag extension and extra tags)"
            )));
        }
        Ok((image, tags))
    }

    /// Apply `tags[1..]` from the primary tag, then push every tag
    async fn tag_and_push(&self, image: &str, tags: &[String]) -> Result<()> {
        let primary = format!("{}:{}", image, tags[0]);

        for tag in &tags[1..] {
            let target = format!("{image}:{tag}");
            tracing::info!("Tagging {} as {}", primary, target);
            let step = format!("{} tag {}", self.runtime.name, target);
            let args = vec!["tag".to_string(), primary.clone(), target];
            self.run_step(&step, &self.runtime.path, &args).await?;
        }

        if self.push {
            for tag in tags {
                let target = format!("{image}:{tag}");
                tracing::info!("Pushing {}", target);
                let step = format!("{} push {}", self.runtime.name, target);
                let args = vec!["push".to_string(), target];
                self.run_step(&step, &self.runtime.path, &args).await?;
            }
        } else {
            tracing::info!("Skipping push of {} tag(s)", tags.len());
        }
        Ok(())
    }

    async fn run_step(&self, step: &str, program: &Path, args: &[String]) -> Result<StepOutput> {
        tracing::debug!("Running {:?} {:?}", program, args);

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| IndexError::BuildTool {
                step: step.to_string(),
                status: None,
                timed_out: false,
                stdout: String::new(),
                stderr: format!("failed to start {}: {e}", program.display()),
            })?;

        let stdout = PipeCapture::spawn(child.stdout.take());
        let stderr = PipeCapture::spawn(child.stderr.take());

        let waited = tokio::time::timeout(self.timeout, child.wait()).await;
        let status = match waited {
            Err(_) => {
                tracing::error!("'{}' timed out after {:?}", step, self.timeout);
                let _ = child.start_kill();
                let mut stderr = stderr.abort();
                if !stderr.is_empty() && !stderr.ends_with('\n') {
                    stderr.push('\n');
                }
                stderr.push_str(&format!("no exit within {:?}", self.timeout));
                return Err(IndexError::BuildTool {
                    step: step.to_string(),
                    status: None,
                    timed_out: true,
                    stdout: stdout.abort(),
                    stderr,
                });
            }
            Ok(Err(e)) => {
                return Err(IndexError::BuildTool {
                    step: step.to_string(),
                    status: None,
                    timed_out: false,
                    stdout: stdout.abort(),
                    stderr: format!("failed to wait for {}: {e}", program.display()),
                })
            }
            Ok(Ok(status)) => status,
        };

        let stdout = stdout.finish().await;
        let stderr = stderr.finish().await;

        if !status.success() {
            tracing::error!("'{}' failed with exit code {:?}", step, status.code());
            return Err(IndexError::BuildTool {
                step: step.to_string(),
                status: status.code(),
                timed_out: false,
                stdout,
                stderr,
            });
        }

        Ok(StepOutput { stdout })
    }
}

fn bundle_references(descriptor: &IndexDescriptor) -> Vec<String> {
    descriptor
        .entries
        .iter()
        .map(|e| e.immutable_reference())
        .collect()
}
