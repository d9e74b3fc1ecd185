use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use roster_rules::{coercion_stats, generate_batch_preview, generate_preview, RuleSet};
use roster_storage::{integrity_check, naming_check, CheckReport, MigrationManager, Store};
use roster_sync::{IngestConfig, IngestionCoordinator, UpcomingMatchWindow};
use roster_validation::{apply, simulate, GuardSettings};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "rosterdb")]
#[command(about = "League roster ingestion: migrations, incremental ingest, rule tooling")]
struct Cli {
    /// SQLite URL; falls back to ROSTER_DATABASE_URL, then the built-in default.
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply pending schema migrations.
    Migrate {
        /// Print the pending units without applying them.
        #[arg(long)]
        dry_run: bool,
        /// Compare recorded checksums with the registry; exits 1 on drift.
        #[arg(long)]
        verify: bool,
    },
    /// Ingest every new or changed source under ROOT.
    Ingest {
        root: Option<PathBuf>,
        /// YAML file with ingest settings; environment variables are used otherwise.
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
        #[arg(long, value_name = "FILE")]
        ruleset: Option<PathBuf>,
        /// Re-ingest unchanged rosters whose team plays around now.
        #[arg(long)]
        rescrape_upcoming: bool,
    },
    /// Foreign-key and duplicate checks; JSON report, exits 1 on failure.
    IntegrityCheck,
    /// Table naming convention check; JSON report, exits 1 on failure.
    NamingCheck,
    /// Run a rule set over one or more HTML files without writing anything.
    Preview {
        ruleset: PathBuf,
        #[arg(required = true)]
        html: Vec<PathBuf>,
        /// Include parse time and memory estimates.
        #[arg(long)]
        perf: bool,
    },
    /// Guard, gates, constraints, overlaps and orphans for one document.
    Validate {
        ruleset: PathBuf,
        html: PathBuf,
        #[arg(long)]
        strict: bool,
        #[arg(long)]
        allow_expressions: bool,
        /// Version the rule set and record an apply audit when the checks pass.
        #[arg(long)]
        apply: bool,
    },
    /// Inspect or roll back stored rule set versions.
    Versions {
        #[command(subcommand)]
        action: VersionAction,
    },
}

#[derive(Debug, Subcommand)]
enum VersionAction {
    List,
    Rollback,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("encoding report")?);
    Ok(())
}

fn report_exit(report: &CheckReport) -> Result<ExitCode> {
    print_json(report)?;
    Ok(if report.passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn read_html(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

async fn open_store(url: &str) -> Result<Store> {
    Store::open_migrated(url)
        .await
        .with_context(|| format!("opening store {url}"))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    let env_config = IngestConfig::from_env();
    let database_url = cli
        .database_url
        .clone()
        .unwrap_or_else(|| env_config.database_url.clone());

    match cli.command {
        Commands::Migrate { dry_run, verify } => {
            let store = Store::connect(&database_url)
                .await
                .with_context(|| format!("opening store {database_url}"))?;
            let manager = MigrationManager::registered();
            if verify {
                let mismatches = manager.verify_checksums(&store).await?;
                print_json(&mismatches)?;
                return Ok(if mismatches.is_empty() {
                    ExitCode::SUCCESS
                } else {
                    ExitCode::FAILURE
                });
            }
            if dry_run {
                print_json(&manager.preview_pending(&store).await?)?;
                return Ok(ExitCode::SUCCESS);
            }
            let applied = manager.apply_pending(&store).await?;
            let version = manager.current_version(&store).await?;
            print_json(&serde_json::json!({ "applied": applied, "version": version }))?;
        }
        Commands::Ingest {
            root,
            config,
            ruleset,
            rescrape_upcoming,
        } => {
            let mut config = match config {
                Some(path) => IngestConfig::from_yaml_file(&path)?,
                None => env_config,
            };
            if cli.database_url.is_some() {
                config.database_url = database_url;
            }
            if ruleset.is_some() {
                config.ruleset_path = ruleset;
            }
            let root = root.unwrap_or_else(|| config.data_dir.clone());

            let store = open_store(&config.database_url).await?;
            let mut coordinator = IngestionCoordinator::new(store, config).load_configured_ruleset()?;
            if rescrape_upcoming {
                coordinator = coordinator.with_policy(Box::new(UpcomingMatchWindow::default()));
            }

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; stopping after the current file");
                    on_signal.cancel();
                }
            });

            let summary = coordinator.run(&root, &cancel).await?;
            info!(run_id = %summary.run_id, "ingest complete");
            print_json(&summary)?;
            if !summary.errors.is_empty() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::IntegrityCheck => {
            let store = open_store(&database_url).await?;
            return report_exit(&integrity_check(&store).await?);
        }
        Commands::NamingCheck => {
            let store = open_store(&database_url).await?;
            return report_exit(&naming_check(&store).await?);
        }
        Commands::Preview { ruleset, html, perf } => {
            let ruleset = RuleSet::load(&ruleset).with_context(|| format!("loading {}", ruleset.display()))?;
            if let [single] = html.as_slice() {
                let preview = generate_preview(&ruleset, &read_html(single)?, perf)?;
                print_json(&serde_json::json!({
                    "preview": preview,
                    "coverage": coercion_stats(&preview),
                }))?;
            } else {
                let documents = html
                    .iter()
                    .map(|path| Ok((path.display().to_string(), read_html(path)?)))
                    .collect::<Result<Vec<_>>>()?;
                let batch = generate_batch_preview(
                    &ruleset,
                    documents.iter().map(|(name, text)| (name.as_str(), text.as_str())),
                    perf,
                )?;
                print_json(&batch)?;
            }
        }
        Commands::Validate {
            ruleset,
            html,
            strict,
            allow_expressions,
            apply: write,
        } => {
            let ruleset = RuleSet::load(&ruleset).with_context(|| format!("loading {}", ruleset.display()))?;
            let html = read_html(&html)?;
            let settings = GuardSettings {
                disallow_expressions: !allow_expressions && env_config.disallow_expressions,
                strict_gates: strict || env_config.strict_gates,
            };
            let report = simulate(&ruleset, &html, None, &settings)?;
            print_json(&report)?;
            if !report.ready_to_apply(&settings) {
                return Ok(ExitCode::FAILURE);
            }
            if write {
                let store = open_store(&database_url).await?;
                let outcome = apply(&store, &ruleset, &html, &settings).await?;
                print_json(&outcome)?;
            }
        }
        Commands::Versions { action } => {
            let store = open_store(&database_url).await?;
            let versions = store.rule_versions();
            match action {
                VersionAction::List => print_json(&versions.list_versions().await?)?,
                VersionAction::Rollback => match versions.rollback_to_previous().await? {
                    Some(payload) => println!("{payload}"),
                    None => {
                        eprintln!("no previous rule set version to roll back to");
                        return Ok(ExitCode::FAILURE);
                    }
                },
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
