//! operator-index - build and publish OLM catalog index images
//!
//! Main entry point: argument parsing, logging setup and error reporting

use anyhow::Result;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use operator_index_core::catalog::BranchPolicy;
use operator_index_core::IndexError;

mod release_cli;

/// Log levels
#[derive(Debug, Clone, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn to_filter_directive(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Branch policy from the command line
///
/// Branch names are accepted too: `main`/`master` release, `develop`/`dev`
/// build development images.
fn parse_branch(value: &str) -> std::result::Result<BranchPolicy, String> {
    value.parse::<BranchPolicy>().map_err(|e| e.to_string())
}

#[derive(Parser, Debug)]
#[clap(
    name = "operator-index",
    about = "Build and publish Operator Lifecycle Manager catalog index images",
    version
)]
struct Cli {
    #[clap(subcommand)]
    command: Command,

    /// Configuration file (default: <state-dir>/config.yaml when present)
    #[clap(long, global = true)]
    config: Option<PathBuf>,

    /// Index file to operate on
    #[clap(long, global = true)]
    index: Option<PathBuf>,

    /// Directory holding the release log and lock
    #[clap(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Set log level
    #[clap(long, default_value = "info", global = true)]
    log_level: LogLevel,

    /// Emit logs as JSON
    #[clap(long, global = true)]
    json_logs: bool,
}

#[derive(Parser, Debug)]
enum Command {
    /// Load and validate the index file
    Validate,

    /// Resolve every bundle tag to a manifest digest
    Resolve {
        /// Output results as JSON
        #[clap(long)]
        json: bool,
    },

    /// Show what the next release would contain
    Plan {
        /// Output results as JSON
        #[clap(long)]
        json: bool,

        /// Write the computed version back into the index file
        #[clap(long)]
        write_version: bool,
    },

    /// Build, tag and push the catalog image
    Release {
        /// Branch policy deciding tags and whether the release is recorded
        #[clap(long, value_parser = parse_branch)]
        branch: BranchPolicy,

        /// Plan only; build nothing and take no lock
        #[clap(long)]
        dry_run: bool,

        /// Build and tag locally without pushing
        #[clap(long)]
        no_push: bool,

        /// Push an image already built locally instead of building one
        #[clap(long)]
        no_build: bool,

        /// Identifier appended to the primary tag ({version}-{ext})
        #[clap(short = 't', long)]
        tag_extension: Option<String>,

        /// Additional tag to apply and push (repeatable)
        #[clap(long = "extra-tag")]
        extra_tags: Vec<String>,

        /// Revision recorded in the release log (default: git rev-parse HEAD)
        #[clap(long)]
        git_revision: Option<String>,
    },

    /// List recorded releases
    History {
        /// Output results as JSON
        #[clap(long)]
        json: bool,
    },

    /// Render a CatalogSource manifest for the catalog image
    CatalogSource {
        /// Branch policy whose floating tag the source tracks
        #[clap(long, value_parser = parse_branch)]
        branch: BranchPolicy,

        /// Write the manifest to a file instead of stdout
        #[clap(long)]
        output: Option<PathBuf>,
    },
}

/// Initialize tracing with CLI flags
///
/// `RUST_LOG` takes precedence over --log-level when set.
fn initialize_tracing(log_level: &LogLevel, json_logs: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_filter_directive()));

    // Logs go to stderr; stdout carries command output
    if json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

/// `error: [<stage>] <message>` for pipeline failures
fn report(err: &anyhow::Error) {
    match err.chain().find_map(|e| e.downcast_ref::<IndexError>()) {
        Some(index_err) => eprintln!("error: [{}] {:#}", index_err.stage(), err),
        None => eprintln!("error: {err:#}"),
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = release_cli::load_config(
        cli.config.as_deref(),
        cli.index.as_deref(),
        cli.state_dir.as_deref(),
    )?;

    match cli.command {
        Command::Validate => release_cli::execute_validate(&config),
        Command::Resolve { json } => release_cli::execute_resolve(config, json).await,
        Command::Plan {
            json,
            write_version,
        } => release_cli::execute_plan(config, json, write_version).await,
        Command::Release {
            branch,
            dry_run,
            no_push,
            no_build,
            tag_extension,
            extra_tags,
            git_revision,
        } => {
            let args = release_cli::ReleaseArgs {
                policy: branch,
                dry_run,
                no_push,
                no_build,
                tag_extension,
                extra_tags,
                git_revision,
            };
            release_cli::execute_release(config, args).await
        }
        Command::History { json } => release_cli::execute_history(&config, json),
        Command::CatalogSource { branch, output } => {
            release_cli::execute_catalog_source(&config, branch, output.as_deref())
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    initialize_tracing(&cli.log_level, cli.json_logs);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report(&err);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_flags_parse() {
        let cli = Cli::try_parse_from([
            "operator-index",
            "release",
            "--branch",
            "release",
            "--no-push",
            "--no-build",
            "-t",
            "rc1",
            "--extra-tag",
            "stable",
            "--extra-tag",
            "4.14",
            "--index",
            "catalog/operator-index.yml",
        ])
        .unwrap();

        assert_eq!(
            cli.index,
            Some(PathBuf::from("catalog/operator-index.yml"))
        );
        match cli.command {
            Command::Release {
                branch,
                no_push,
                no_build,
                dry_run,
                tag_extension,
                extra_tags,
                ..
            } => {
                assert_eq!(branch, BranchPolicy::Release);
                assert!(no_push);
                assert!(no_build);
                assert!(!dry_run);
                assert_eq!(tag_extension.as_deref(), Some("rc1"));
                assert_eq!(extra_tags, vec!["stable", "4.14"]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_release_requires_branch() {
        assert!(Cli::try_parse_from(["operator-index", "release"]).is_err());
        assert!(Cli::try_parse_from(["operator-index", "release", "--branch", "feature"]).is_err());
    }

    #[test]
    fn test_branch_names_map_to_policies() {
        for (name, expected) in [
            ("main", BranchPolicy::Release),
            ("master", BranchPolicy::Release),
            ("Release", BranchPolicy::Release),
            ("develop", BranchPolicy::Development),
            ("dev", BranchPolicy::Development),
        ] {
            let cli = Cli::try_parse_from(["operator-index", "release", "--branch", name]).unwrap();
            match cli.command {
                Command::Release { branch, .. } => assert_eq!(branch, expected, "{name}"),
                other => panic!("unexpected command: {other:?}"),
            }
        }

        let err = Cli::try_parse_from(["operator-index", "release", "--branch", "feature"])
            .unwrap_err()
            .to_string();
        assert!(err.contains("unknown branch policy 'feature'"), "{err}");
    }

    #[test]
    fn test_catalog_source_parses() {
        let cli = Cli::try_parse_from([
            "operator-index",
            "catalog-source",
            "--branch",
            "development",
            "--output",
            "source.yaml",
        ])
        .unwrap();
        match cli.command {
            Command::CatalogSource { branch, output } => {
                assert_eq!(branch, BranchPolicy::Development);
                assert_eq!(output, Some(PathBuf::from("source.yaml")));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
