//! Bundle digest resolution
//!
//! Resolves each declared bundle's mutable tag to the immutable manifest
//! digest the registry currently serves. Lookups are independent, so they run
//! concurrently under a small fixed limit, each bounded by a timeout.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use oci_distribution::client::{Client, ClientConfig, ClientProtocol};
use oci_distribution::errors::OciDistributionError;
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::Reference;
use std::sync::Arc;
use std::time::Duration;

use super::index::{is_valid_digest, BundleEntry};
use crate::config::RegistrySettings;
use crate::error::{IndexError, LookupFailureKind, Result, UnresolvableReference};

/// Default number of concurrent registry lookups
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Default per-lookup timeout
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(30);

/// A failed registry lookup, before it is tied to a bundle entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupFailure {
    pub kind: LookupFailureKind,
    pub reason: String,
}

impl LookupFailure {
    pub fn new(kind: LookupFailureKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

/// Answers "which manifest digest does this reference point at?"
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// `reference` is either `image:tag` or `image@digest`
    async fn manifest_digest(&self, reference: &str) -> std::result::Result<String, LookupFailure>;
}

/// Registry client speaking the OCI distribution protocol
pub struct OciRegistryClient {
    client: Client,
    auth: RegistryAuth,
}

impl OciRegistryClient {
    pub fn new(settings: &RegistrySettings) -> Self {
        let protocol = if settings.insecure.is_empty() {
            ClientProtocol::Https
        } else {
            ClientProtocol::HttpsExcept(settings.insecure.clone())
        };

        let config = ClientConfig {
            protocol,
            ..Default::default()
        };

        let auth = match settings.credentials() {
            Some((username, password)) => {
                tracing::debug!("Using basic registry authentication for '{}'", username);
                RegistryAuth::Basic(username, password)
            }
            None => RegistryAuth::Anonymous,
        };

        Self {
            client: Client::new(config),
            auth,
        }
    }
}

#[async_trait]
impl RegistryClient for OciRegistryClient {
    async fn manifest_digest(&self, reference: &str) -> std::result::Result<String, LookupFailure> {
        let parsed = Reference::try_from(reference).map_err(|e| {
            LookupFailure::new(
                LookupFailureKind::InvalidReference,
                format!("invalid image reference: {e}"),
            )
        })?;

        self.client
            .fetch_manifest_digest(&parsed, &self.auth)
            .await
            .map_err(classify_registry_error)
    }
}

fn classify_registry_error(err: OciDistributionError) -> LookupFailure {
    let reason = err.to_string();
    let kind = match &err {
        OciDistributionError::AuthenticationFailure(_)
        | OciDistributionError::UnauthorizedError { .. } => LookupFailureKind::Auth,
        OciDistributionError::ImageManifestNotFoundError(_) => LookupFailureKind::NotFound,
        OciDistributionError::ServerError { code, .. } => match *code {
            401 | 403 => LookupFailureKind::Auth,
            404 => LookupFailureKind::NotFound,
            _ => LookupFailureKind::Network,
        },
        _ => classify_message(&reason),
    };
    LookupFailure::new(kind, reason)
}

/// Registries disagree on how they report a missing tag
fn classify_message(reason: &str) -> LookupFailureKind {
    let lower = reason.to_lowercase();
    if lower.contains("manifest unknown")
        || lower.contains("name unknown")
        || lower.contains("not found")
    {
        LookupFailureKind::NotFound
    } else if lower.contains("unauthorized") || lower.contains("denied") {
        LookupFailureKind::Auth
    } else {
        LookupFailureKind::Network
    }
}

/// Resolves bundle entries to digests with bounded concurrency
pub struct Resolver {
    client: Arc<dyn RegistryClient>,
    concurrency: usize,
    timeout: Duration,
}

impl Resolver {
    pub fn new(client: Arc<dyn RegistryClient>) -> Self {
        Self {
            client,
            concurrency: DEFAULT_CONCURRENCY,
            timeout: DEFAULT_LOOKUP_TIMEOUT,
        }
    }

    pub fn from_settings(client: Arc<dyn RegistryClient>, settings: &RegistrySettings) -> Self {
        Self::new(client)
            .with_concurrency(settings.concurrency)
            .with_timeout(Duration::from_secs(settings.timeout_seconds))
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Attach a resolved digest to every entry
    ///
    /// Every recoverable per-entry failure is collected and reported in a
    /// single `IndexError::Resolution`. An authentication failure stops the
    /// remaining lookups; the error is then flagged as aborted.
    pub async fn resolve(&self, entries: Vec<BundleEntry>) -> Result<Vec<BundleEntry>> {
        let total = entries.len();
        tracing::info!(
            "Resolving {} bundle reference(s) with concurrency {}",
            total,
            self.concurrency
        );

        let mut lookups = stream::iter(entries.into_iter().map(|entry| self.resolve_entry(entry)))
            .buffer_unordered(self.concurrency);

        let mut resolved = Vec::with_capacity(total);
        let mut failures = Vec::new();
        let mut aborted = false;

        while let Some(outcome) = lookups.next().await {
            match outcome {
                Ok(entry) => resolved.push(entry),
                Err(failure) => {
                    let unrecoverable = failure.kind.is_unrecoverable();
                    tracing::warn!("Failed to resolve {}", failure);
                    failures.push(failure);
                    if unrecoverable {
                        aborted = true;
                        break;
                    }
                }
            }
        }
        // Dropping the stream cancels lookups still in flight
        drop(lookups);

        if aborted {
            tracing::error!(
                "Authentication failure; cancelled {} outstanding lookup(s)",
                total - resolved.len() - failures.len()
            );
        }

        if !failures.is_empty() {
            failures.sort_by(|a, b| (&a.image, &a.tag).cmp(&(&b.image, &b.tag)));
            return Err(IndexError::Resolution { failures, aborted });
        }

        resolved.sort_by_key(BundleEntry::key);
        tracing::info!("Resolved {} bundle reference(s)", resolved.len());
        Ok(resolved)
    }

    async fn resolve_entry(
        &self,
        entry: BundleEntry,
    ) -> std::result::Result<BundleEntry, UnresolvableReference> {
        let reference = match &entry.pin {
            Some(pin) => format!("{}@{}", entry.image, pin),
            None => entry.tag_reference(),
        };

        let fail = |kind: LookupFailureKind, reason: String| UnresolvableReference {
            image: entry.image.clone(),
            tag: entry.tag.clone(),
            kind,
            reason,
        };

        tracing::debug!("Looking up manifest digest for {}", reference);

        let digest =
            match tokio::time::timeout(self.timeout, self.client.manifest_digest(&reference)).await
            {
                Err(_) => {
                    return Err(fail(
                        LookupFailureKind::Timeout,
                        format!("no answer within {}s", self.timeout.as_secs_f64()),
                    ))
                }
                Ok(Err(failure)) => return Err(fail(failure.kind, failure.reason)),
                Ok(Ok(digest)) => digest,
            };

        if !is_valid_digest(&digest) {
            return Err(fail(
                LookupFailureKind::InvalidDigest,
                format!("registry answered with malformed digest '{digest}'"),
            ));
        }

        if let Some(pin) = &entry.pin {
            if &digest != pin {
                return Err(fail(
                    LookupFailureKind::DigestMismatch,
                    format!("pinned {pin} but registry serves {digest}"),
                ));
            }
        }

        tracing::debug!("{} -> {}", reference, digest);
        Ok(entry.with_digest(digest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_message() {
        assert_eq!(
            classify_message("MANIFEST_UNKNOWN: manifest unknown"),
            LookupFailureKind::NotFound
        );
        assert_eq!(
            classify_message("UNAUTHORIZED: access to the requested resource is not authorized"),
            LookupFailureKind::Auth
        );
        assert_eq!(
            classify_message("error sending request: connection refused"),
            LookupFailureKind::Network
        );
    }

    #[test]
    fn test_concurrency_is_at_least_one() {
        struct Never;

        #[async_trait]
        impl RegistryClient for Never {
            async fn manifest_digest(
                &self,
                _reference: &str,
            ) -> std::result::Result<String, LookupFailure> {
                Err(LookupFailure::new(LookupFailureKind::Network, "unused"))
            }
        }

        let resolver = Resolver::new(Arc::new(Never)).with_concurrency(0);
        assert_eq!(resolver.concurrency, 1);
    }
}
