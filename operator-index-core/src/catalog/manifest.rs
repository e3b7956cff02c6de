//! CatalogSource manifest rendering
//!
//! Produces the cluster-applyable resource that points OLM at the catalog
//! image. Applying it is left to the cluster tooling.

use serde::{Deserialize, Serialize};

use super::builder::BranchPolicy;
use crate::config::CatalogSourceSettings;
use crate::error::{IndexError, Result};

/// API version of the CatalogSource resource
pub const CATALOG_SOURCE_API_VERSION: &str = "operators.coreos.com/v1alpha1";

/// A CatalogSource resource
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogSource {
    pub api_version: String,
    pub kind: String,
    pub metadata: SourceMetadata,
    pub spec: SourceSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub name: String,
    pub namespace: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSpec {
    pub source_type: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
    pub update_strategy: UpdateStrategy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStrategy {
    pub registry_poll: RegistryPoll,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryPoll {
    pub interval: String,
}

impl CatalogSource {
    /// A CatalogSource tracking the floating tag of `policy`
    pub fn for_image(
        image: &str,
        policy: BranchPolicy,
        settings: &CatalogSourceSettings,
    ) -> Result<Self> {
        if image.trim().is_empty() {
            return Err(IndexError::Config(
                "catalog image is required to render a CatalogSource".to_string(),
            ));
        }

        Ok(Self {
            api_version: CATALOG_SOURCE_API_VERSION.to_string(),
            kind: "CatalogSource".to_string(),
            metadata: SourceMetadata {
                name: settings.name.clone(),
                namespace: settings.namespace.clone(),
            },
            spec: SourceSpec {
                source_type: "grpc".to_string(),
                image: format!("{}:{}", image, policy.floating_tag()),
                display_name: settings.display_name.clone(),
                publisher: settings.publisher.clone(),
                update_strategy: UpdateStrategy {
                    registry_poll: RegistryPoll {
                        interval: settings.poll_interval.clone(),
                    },
                },
            },
        })
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml_ng::to_string(self)
            .map_err(|e| IndexError::Config(format!("failed to serialize CatalogSource: {e}")))
    }
}
