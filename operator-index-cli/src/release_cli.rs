//! Release CLI commands
//!
//! Thin wrappers over the core pipeline: each command runs the stages it
//! needs and renders the result as a table or JSON on stdout.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tabled::{
    settings::{object::Rows, Alignment, Modify, Style},
    Table, Tabled,
};

use operator_index_core::catalog::{
    write_version, BranchPolicy, CatalogSource, ChangeSet, IndexBuilder, OciRegistryClient,
    ReleaseLog,
};
use operator_index_core::config::ReleaseConfig;
use operator_index_core::{ReleaseOptions, ReleasePipeline};

/// Flags of the `release` command
#[derive(Debug)]
pub struct ReleaseArgs {
    pub policy: BranchPolicy,
    pub dry_run: bool,
    pub no_push: bool,
    pub no_build: bool,
    pub tag_extension: Option<String>,
    pub extra_tags: Vec<String>,
    pub git_revision: Option<String>,
}

/// Load configuration and apply command line overrides
pub fn load_config(
    config: Option<&Path>,
    index: Option<&Path>,
    state_dir: Option<&Path>,
) -> Result<ReleaseConfig> {
    let mut config = ReleaseConfig::load(config, state_dir)?;
    tracing::debug!("Loaded configuration: {:?}", config);
    if let Some(index) = index {
        config.index_file = index.to_path_buf();
    }
    if let Some(state_dir) = state_dir {
        config.state_dir = state_dir.to_path_buf();
    }
    Ok(config)
}

fn pipeline(config: ReleaseConfig) -> ReleasePipeline {
    let registry = Arc::new(OciRegistryClient::new(&config.registry));
    ReleasePipeline::new(config, registry)
}

fn render<T: Tabled>(rows: &[T]) -> String {
    Table::new(rows)
        .with(Style::rounded())
        .with(Modify::new(Rows::first()).with(Alignment::center()))
        .to_string()
}

fn short_digest(digest: &str) -> String {
    match digest.split_once(':') {
        Some((algorithm, hex)) if hex.len() > 12 => format!("{}:{}", algorithm, &hex[..12]),
        _ => digest.to_string(),
    }
}

/// Table row for declared bundles
#[derive(Tabled)]
struct EntryRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Image")]
    image: String,
    #[tabled(rename = "Tag")]
    tag: String,
    #[tabled(rename = "Pin")]
    pin: String,
}

pub fn execute_validate(config: &ReleaseConfig) -> Result<()> {
    tracing::info!("Validating {}", config.index_file.display());
    let descriptor = pipeline(config.clone()).load()?;

    println!(
        "{} is valid: version {}, {} bundle(s)",
        config.index_file.display(),
        descriptor.version,
        descriptor.entries.len()
    );
    match &descriptor.catalog_image {
        Some(image) => println!("Catalog image: {image}"),
        None => println!("Catalog image: not set (required for release)"),
    }

    if !descriptor.entries.is_empty() {
        let rows: Vec<EntryRow> = descriptor
            .entries
            .iter()
            .map(|entry| EntryRow {
                name: entry.name.clone().unwrap_or_else(|| "-".to_string()),
                image: entry.image.clone(),
                tag: entry.tag.clone(),
                pin: entry
                    .pin
                    .as_deref()
                    .map(short_digest)
                    .unwrap_or_else(|| "-".to_string()),
            })
            .collect();
        println!("\n{}", render(&rows));
    }

    Ok(())
}

/// Table row for resolved bundles
#[derive(Tabled)]
struct ResolvedRow {
    #[tabled(rename = "Bundle")]
    bundle: String,
    #[tabled(rename = "Tag")]
    tag: String,
    #[tabled(rename = "Digest")]
    digest: String,
}

pub async fn execute_resolve(config: ReleaseConfig, json_output: bool) -> Result<()> {
    let (_, resolved) = pipeline(config).resolve().await?;
    tracing::info!("Resolved {} bundle(s)", resolved.len());

    if json_output {
        println!("{}", serde_json::to_string_pretty(&resolved)?);
        return Ok(());
    }

    let rows: Vec<ResolvedRow> = resolved
        .iter()
        .map(|entry| ResolvedRow {
            bundle: entry.display_name().to_string(),
            tag: entry.tag.clone(),
            digest: entry.resolved_digest.clone().unwrap_or_default(),
        })
        .collect();
    println!("Resolved {} bundle(s):\n", rows.len());
    println!("{}", render(&rows));
    Ok(())
}

/// Table row for one change
#[derive(Tabled)]
struct ChangeRow {
    #[tabled(rename = "Change")]
    change: &'static str,
    #[tabled(rename = "Bundle")]
    bundle: String,
    #[tabled(rename = "Digest")]
    digest: String,
}

fn change_rows(changes: &ChangeSet) -> Vec<ChangeRow> {
    let digest_of = |digest: &Option<String>| {
        digest
            .as_deref()
            .map(short_digest)
            .unwrap_or_else(|| "-".to_string())
    };

    let mut rows = Vec::new();
    for entry in &changes.removed {
        rows.push(ChangeRow {
            change: "removed",
            bundle: entry.tag_reference(),
            digest: digest_of(&entry.resolved_digest),
        });
    }
    for entry in &changes.added {
        rows.push(ChangeRow {
            change: "added",
            bundle: entry.tag_reference(),
            digest: digest_of(&entry.resolved_digest),
        });
    }
    for update in &changes.tag_updated {
        rows.push(ChangeRow {
            change: "updated",
            bundle: update.current.tag_reference(),
            digest: format!(
                "{} -> {}",
                digest_of(&update.previous.resolved_digest),
                digest_of(&update.current.resolved_digest)
            ),
        });
    }
    rows
}

pub async fn execute_plan(config: ReleaseConfig, json_output: bool, write: bool) -> Result<()> {
    let index_file = config.index_file.clone();
    let plan = pipeline(config).plan().await?;

    if write && plan.declared != plan.version {
        tracing::info!(
            "Writing version {} to {}",
            plan.version,
            index_file.display()
        );
        write_version(&index_file, &plan.version)?;
    }

    if json_output {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    match &plan.previous {
        Some(previous) => println!("Next version: {} (previous {})", plan.version, previous),
        None => println!("Next version: {} (first release)", plan.version),
    }
    if plan.declared != plan.version {
        if write {
            println!("Updated {} to {}", index_file.display(), plan.version);
        } else {
            println!(
                "Index file declares {}; run with --write-version to update it",
                plan.declared
            );
        }
    }

    let rows = change_rows(&plan.changes);
    if !rows.is_empty() {
        println!("\n{}", render(&rows));
    }
    Ok(())
}

pub async fn execute_release(config: ReleaseConfig, args: ReleaseArgs) -> Result<()> {
    let build_settings = config.build.clone();
    let pipeline = pipeline(config);

    tracing::info!(
        "Release requested ({} policy, dry_run={}, no_build={}, no_push={})",
        args.policy,
        args.dry_run,
        args.no_build,
        args.no_push
    );

    if args.dry_run {
        let plan = pipeline.plan().await?;
        let tags = args.policy.tags_with(
            &plan.version,
            args.tag_extension.as_deref(),
            &args.extra_tags,
        );
        let image = plan
            .descriptor
            .catalog_image
            .clone()
            .unwrap_or_else(|| "<catalog image not set>".to_string());

        println!(
            "Dry run: would {} {} ({} policy) with tags {}",
            if args.no_build { "push" } else { "build" },
            image,
            args.policy,
            tags.join(", ")
        );
        let rows = change_rows(&plan.changes);
        if !rows.is_empty() {
            println!("\n{}", render(&rows));
        }
        return Ok(());
    }

    let mut builder = IndexBuilder::from_settings(&build_settings)?
        .with_tag_extension(args.tag_extension)
        .with_extra_tags(args.extra_tags);
    if args.no_push {
        builder = builder.with_push(false);
    }
    tracing::debug!("Using container runtime {:?}", builder.runtime());

    let options = ReleaseOptions {
        policy: args.policy,
        git_revision: args.git_revision,
        reuse_local_image: args.no_build,
    };
    let outcome = pipeline.release(&builder, &options).await?;

    println!(
        "{} {} from {} bundle(s)",
        if args.no_build { "Published" } else { "Built" },
        outcome.build.primary_reference(),
        outcome.build.bundles.len()
    );
    println!("Tags: {}", outcome.build.tags.join(", "));
    if !outcome.build.pushed {
        println!("Push skipped");
    }
    match &outcome.record {
        Some(record) => println!(
            "Recorded release {} at {} in {}",
            record.version,
            record.git_revision,
            pipeline.log().path().display()
        ),
        None => println!("Development build; release log unchanged"),
    }
    Ok(())
}

/// Table row for a recorded release
#[derive(Tabled)]
struct HistoryRow {
    #[tabled(rename = "Version")]
    version: String,
    #[tabled(rename = "Committed")]
    committed: String,
    #[tabled(rename = "Revision")]
    revision: String,
    #[tabled(rename = "Tags")]
    tags: String,
    #[tabled(rename = "Bundles")]
    bundles: usize,
}

pub fn execute_history(config: &ReleaseConfig, json_output: bool) -> Result<()> {
    let log = ReleaseLog::new(config.release_log_path());
    let records = log.records()?;
    tracing::debug!("Read {} record(s) from {}", records.len(), log.path().display());

    if json_output {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No releases recorded in {}", log.path().display());
        return Ok(());
    }

    let rows: Vec<HistoryRow> = records
        .iter()
        .rev()
        .map(|record| HistoryRow {
            version: record.version.to_string(),
            committed: record.committed_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            revision: record.git_revision.chars().take(12).collect(),
            tags: record.tags.join(", "),
            bundles: record.entries.len(),
        })
        .collect();
    println!("{}", render(&rows));
    Ok(())
}

pub fn execute_catalog_source(
    config: &ReleaseConfig,
    policy: BranchPolicy,
    output: Option<&Path>,
) -> Result<()> {
    let recorded = ReleaseLog::new(config.release_log_path())
        .latest()?
        .and_then(|record| record.image);

    let image = match recorded {
        Some(image) => image,
        None => pipeline(config.clone())
            .load()?
            .catalog_image
            .context("no catalog image recorded, declared in the index file or configured")?,
    };

    tracing::info!("Rendering CatalogSource for {} ({} policy)", image, policy);
    let manifest = CatalogSource::for_image(&image, policy, &config.catalog_source)?.to_yaml()?;

    match output {
        Some(path) => {
            std::fs::write(path, &manifest)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("Wrote CatalogSource to {}", path.display());
        }
        None => print!("{manifest}"),
    }
    Ok(())
}
