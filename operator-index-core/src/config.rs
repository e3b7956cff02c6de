//! Release configuration
//!
//! ## Configuration Sources (in precedence order)
//!
//! 1. Command-line flags (applied by the caller)
//! 2. An explicit `--config` file
//! 3. `<state_dir>/config.yaml` - Project-level config
//! 4. Built-in defaults
//!
//! ```yaml
//! catalog_image: quay.io/acme/operator-index
//! registry:
//!   concurrency: 4
//!   timeout_seconds: 30
//!   insecure: ["localhost:5000"]
//! build:
//!   runtime: podman
//!   timeout_seconds: 900
//!   push: true
//! catalog_source:
//!   name: acme-operators
//!   namespace: olm
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{IndexError, Result};

/// Name of the project-level config file inside the state directory
pub const CONFIG_FILE_NAME: &str = "config.yaml";

/// Top-level release configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseConfig {
    /// Declarative index file
    #[serde(default = "default_index_file")]
    pub index_file: PathBuf,

    /// Directory holding the release log, lock and project config
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Catalog image repository used when the index file has no catalog_index
    #[serde(default)]
    pub catalog_image: Option<String>,

    #[serde(default)]
    pub registry: RegistrySettings,

    #[serde(default)]
    pub build: BuildSettings,

    #[serde(default)]
    pub catalog_source: CatalogSourceSettings,
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            index_file: default_index_file(),
            state_dir: default_state_dir(),
            catalog_image: None,
            registry: RegistrySettings::default(),
            build: BuildSettings::default(),
            catalog_source: CatalogSourceSettings::default(),
        }
    }
}

fn default_index_file() -> PathBuf {
    PathBuf::from("operator-index.yml")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".operator-index")
}

/// Registry lookup settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySettings {
    /// Maximum concurrent manifest lookups
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Timeout per lookup in seconds
    #[serde(default = "default_registry_timeout")]
    pub timeout_seconds: u64,

    /// Environment variable holding the registry username
    #[serde(default = "default_username_env")]
    pub username_env: String,

    /// Environment variable holding the registry password or token
    #[serde(default = "default_password_env")]
    pub password_env: String,

    /// Registries reached over plain HTTP (e.g. "localhost:5000")
    #[serde(default)]
    pub insecure: Vec<String>,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            timeout_seconds: default_registry_timeout(),
            username_env: default_username_env(),
            password_env: default_password_env(),
            insecure: Vec::new(),
        }
    }
}

impl RegistrySettings {
    /// Basic-auth credentials, if both variables are set and non-empty
    pub fn credentials(&self) -> Option<(String, String)> {
        let username = std::env::var(&self.username_env).ok()?;
        let password = std::env::var(&self.password_env).ok()?;
        if username.is_empty() || password.is_empty() {
            return None;
        }
        Some((username, password))
    }
}

fn default_concurrency() -> usize {
    4
}

fn default_registry_timeout() -> u64 {
    30
}

fn default_username_env() -> String {
    "OPERATOR_INDEX_REGISTRY_USERNAME".to_string()
}

fn default_password_env() -> String {
    "OPERATOR_INDEX_REGISTRY_PASSWORD".to_string()
}

/// External build tool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSettings {
    /// Explicit path to the opm binary
    #[serde(default)]
    pub opm_path: Option<PathBuf>,

    /// Container runtime ("docker", "podman" or a path); detected when unset
    #[serde(default)]
    pub runtime: Option<String>,

    /// Timeout per build/tag/push step in seconds
    #[serde(default = "default_build_timeout")]
    pub timeout_seconds: u64,

    /// Push tags after building
    #[serde(default = "default_push")]
    pub push: bool,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            opm_path: None,
            runtime: None,
            timeout_seconds: default_build_timeout(),
            push: default_push(),
        }
    }
}

fn default_build_timeout() -> u64 {
    900
}

fn default_push() -> bool {
    true
}

/// Fields of the rendered CatalogSource manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogSourceSettings {
    #[serde(default = "default_source_name")]
    pub name: String,

    #[serde(default = "default_source_namespace")]
    pub namespace: String,

    #[serde(default)]
    pub display_name: Option<String>,

    #[serde(default)]
    pub publisher: Option<String>,

    /// Registry poll interval, e.g. "10m"
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,
}

impl Default for CatalogSourceSettings {
    fn default() -> Self {
        Self {
            name: default_source_name(),
            namespace: default_source_namespace(),
            display_name: None,
            publisher: None,
            poll_interval: default_poll_interval(),
        }
    }
}

fn default_source_name() -> String {
    "operator-index".to_string()
}

fn default_source_namespace() -> String {
    "olm".to_string()
}

fn default_poll_interval() -> String {
    "10m".to_string()
}

impl ReleaseConfig {
    /// Load configuration from an explicit file, or the project config if present
    pub fn load(explicit: Option<&Path>, state_dir: Option<&Path>) -> Result<Self> {
        let config = match explicit {
            Some(path) => Self::load_from_path(path)?,
            None => {
                let state_dir = state_dir
                    .map(Path::to_path_buf)
                    .unwrap_or_else(default_state_dir);
                let project = state_dir.join(CONFIG_FILE_NAME);
                if project.exists() {
                    Self::load_from_path(&project)?
                } else {
                    tracing::debug!("No project config at {}, using defaults", project.display());
                    Self::default()
                }
            }
        };

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            IndexError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let config: Self = serde_yaml_ng::from_str(&content).map_err(|e| {
            IndexError::Config(format!("failed to parse {}: {e}", path.display()))
        })?;
        tracing::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.registry.concurrency == 0 {
            return Err(IndexError::Config(
                "registry.concurrency must be at least 1".to_string(),
            ));
        }
        if self.registry.timeout_seconds == 0 {
            return Err(IndexError::Config(
                "registry.timeout_seconds must be at least 1".to_string(),
            ));
        }
        if self.build.timeout_seconds == 0 {
            return Err(IndexError::Config(
                "build.timeout_seconds must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Append-only release log location
    pub fn release_log_path(&self) -> PathBuf {
        self.state_dir.join("releases.jsonl")
    }

    /// Single-release lock file location
    pub fn lock_path(&self) -> PathBuf {
        self.state_dir.join("release.lock")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = ReleaseConfig::default();
        assert_eq!(config.index_file, PathBuf::from("operator-index.yml"));
        assert_eq!(config.registry.concurrency, 4);
        assert_eq!(config.registry.timeout_seconds, 30);
        assert_eq!(config.build.timeout_seconds, 900);
        assert!(config.build.push);
        assert_eq!(
            config.release_log_path(),
            PathBuf::from(".operator-index/releases.jsonl")
        );
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "catalog_image: quay.io/acme/operator-index\nregistry:\n  concurrency: 8\nbuild:\n  push: false\n",
        )
        .unwrap();

        let config = ReleaseConfig::load(Some(&path), None).unwrap();
        assert_eq!(
            config.catalog_image.as_deref(),
            Some("quay.io/acme/operator-index")
        );
        assert_eq!(config.registry.concurrency, 8);
        assert_eq!(config.registry.timeout_seconds, 30);
        assert!(!config.build.push);
        assert_eq!(config.catalog_source.namespace, "olm");
    }

    #[test]
    fn test_project_config_in_state_dir() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(
            temp_dir.path().join(CONFIG_FILE_NAME),
            "build:\n  runtime: podman\n",
        )
        .unwrap();

        let config = ReleaseConfig::load(None, Some(temp_dir.path())).unwrap();
        assert_eq!(config.build.runtime.as_deref(), Some("podman"));
    }

    #[test]
    fn test_zero_concurrency_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.yaml");
        std::fs::write(&path, "registry:\n  concurrency: 0\n").unwrap();

        let err = ReleaseConfig::load(Some(&path), None).unwrap_err();
        assert!(err.to_string().contains("registry.concurrency"));
    }

    #[test]
    #[serial]
    fn test_credentials_from_env() {
        let settings = RegistrySettings {
            username_env: "OPERATOR_INDEX_TEST_USER".to_string(),
            password_env: "OPERATOR_INDEX_TEST_PASS".to_string(),
            ..Default::default()
        };

        std::env::remove_var("OPERATOR_INDEX_TEST_USER");
        std::env::remove_var("OPERATOR_INDEX_TEST_PASS");
        assert!(settings.credentials().is_none());

        std::env::set_var("OPERATOR_INDEX_TEST_USER", "robot");
        std::env::set_var("OPERATOR_INDEX_TEST_PASS", "s3cret");
        assert_eq!(
            settings.credentials(),
            Some(("robot".to_string(), "s3cret".to_string()))
        );

        std::env::remove_var("OPERATOR_INDEX_TEST_USER");
        std::env::remove_var("OPERATOR_INDEX_TEST_PASS");
    }
}
