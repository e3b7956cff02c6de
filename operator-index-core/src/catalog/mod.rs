//! Operator catalog index - loading, resolving, diffing and building
//!
//! This module holds the four release stages and the state they share.
//!
//! # Overview
//!
//! A release walks a declared index through:
//! - Loading the index file (`operator-index.yml`) into an [`IndexDescriptor`]
//! - Resolving every bundle tag to an immutable manifest digest
//! - Diffing against the last recorded release to pick the next version
//! - Invoking `opm` and the container runtime to build and push the image
//!
//! # Architecture
//!
//! ```text
//! index.yaml
//!     │
//!     ▼
//! IndexDescriptor ── Resolver (registry lookups) ──► resolved entries
//!                                                        │
//! .operator-index/releases.jsonl ── diff ◄───────────────┘
//!     ▲                               │
//!     │                               ▼
//!     └──── ReleaseRecord ◄──── IndexBuilder (opm + docker/podman)
//! ```

mod builder;
mod diff;
mod index;
mod lock;
mod manifest;
mod registry;

pub use builder::{
    find_opm_binary, BranchPolicy, BuildResult, ContainerRuntime, IndexBuilder,
    DEFAULT_BUILD_TIMEOUT, OPM_PATH_ENV,
};
pub use diff::{check_declared_version, diff, first_release, Bump, ChangeSet, TagUpdate};
pub use index::{
    default_index_path, is_valid_digest, load, write_version, BundleEntry, EntryKey,
    IndexDescriptor, DEFAULT_TAG,
};
pub use lock::{ReleaseLock, ReleaseLog, ReleaseRecord};
pub use manifest::{CatalogSource, CATALOG_SOURCE_API_VERSION};
pub use registry::{
    LookupFailure, OciRegistryClient, RegistryClient, Resolver, DEFAULT_CONCURRENCY,
    DEFAULT_LOOKUP_TIMEOUT,
};
