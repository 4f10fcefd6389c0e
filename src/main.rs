use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio::sync::watch;

use delve_core::Config;
use delve_core::bootstrap::{
    Workspace, WorkspaceStatus, create_provider, create_table_store, open_workspace,
    workspace_status,
};
use delve_index::files::FileStore;
use delve_index::indexer::IndexReport;
use delve_index::retriever::{FileMatch, format_as_context};
use delve_index::sweeper::spawn_sweeper;
use delve_index::walk::LocalFileSystem;
use delve_llm::AnyProvider;

#[derive(Debug, Parser)]
#[command(version, about, name = "delve")]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t, global = true)]
    format: OutputFormat,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Index a workspace, embedding only content not seen before
    Index {
        #[arg(default_value = ".")]
        workspace: PathBuf,
    },
    /// Find the files most relevant to a piece of text
    Query {
        text: String,
        #[arg(long, default_value = ".")]
        workspace: PathBuf,
        /// Print matches as a `<codebase_context>` block
        #[arg(long)]
        context: bool,
    },
    /// Remove records of files that no longer exist
    Sweep,
    /// Show what the index holds for a workspace
    Status {
        #[arg(default_value = ".")]
        workspace: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    #[default]
    Plain,
    Json,
}

impl OutputFormat {
    fn print<T: Serialize>(self, value: &T, plain: impl FnOnce() -> String) -> anyhow::Result<()> {
        match self {
            Self::Plain => println!("{}", plain()),
            Self::Json => println!(
                "{}",
                serde_json::to_string_pretty(value).context("failed to encode output")?
            ),
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_subscriber();

    let config_path = resolve_config_path(cli.config.as_deref());
    let config = Config::load(&config_path)?;
    config.validate()?;
    tracing::debug!(path = %config_path.display(), backend = %config.storage.backend, "config loaded");

    let store = create_table_store(&config.storage).await?;
    let provider = Arc::new(create_provider(&config));

    match cli.command {
        Command::Index { workspace } => {
            let ws = open_workspace(&config, store, provider, &workspace).await?;
            let report = run_index(&config, &ws).await?;
            cli.format.print(&report, || describe_report(&report))
        }
        Command::Query {
            text,
            workspace,
            context,
        } => {
            let ws = open_workspace(&config, store, provider, &workspace).await?;
            // a new session starts with an empty projection; cached files are re-projected
            let report = ws.indexer.index_workspace().await?;
            tracing::debug!(
                cached = report.files_cached,
                embedded = report.files_embedded,
                "workspace refreshed"
            );
            let matches = ws.retriever.retrieve(&text).await;
            cli.format.print(&matches, || {
                if context {
                    format_as_context(&matches)
                } else {
                    describe_matches(&matches)
                }
            })
        }
        Command::Sweep => {
            let files = FileStore::open(store, config.index.file_batch).await?;
            let removed = files.sweep(&LocalFileSystem).await?;
            cli.format.print(&SweepReport { removed }, || {
                format!("removed {removed} stale file record(s)")
            })
        }
        Command::Status { workspace } => {
            let status = workspace_status(&config, store, provider.as_ref(), &workspace).await?;
            cli.format.print(&status, || describe_status(&status))
        }
    }
}

/// Full pass with a background sweeper. Ctrl-C stops the pass before its next
/// file; in-flight work finishes and buffered writes are flushed.
async fn run_index(config: &Config, ws: &Workspace<AnyProvider>) -> anyhow::Result<IndexReport> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = spawn_sweeper(
        ws.session.clone(),
        Duration::from_secs(config.index.sweep_interval_secs),
        shutdown_rx,
    );

    let session = ws.session.clone();
    let ctrl_c = tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {e:#}");
            return;
        }
        tracing::info!("received shutdown signal, finishing in-flight files");
        session.set_enabled(false);
    });

    let result = ws.indexer.index_workspace().await;
    ctrl_c.abort();
    if shutdown_tx.send(true).is_err() {
        tracing::debug!("sweeper already stopped");
    }
    if let Err(e) = sweeper.await {
        tracing::warn!("sweeper task failed: {e:#}");
    }
    Ok(result?)
}

#[derive(Debug, Serialize)]
struct SweepReport {
    removed: usize,
}

fn describe_report(report: &IndexReport) -> String {
    let mut out = format!(
        "scanned {}/{} files in {} ms: {} embedded ({} chunks), {} cached, {} refreshed, {} skipped, {} failed",
        report.files_scanned,
        report.files_total,
        report.duration_ms,
        report.files_embedded,
        report.chunks_embedded,
        report.files_cached,
        report.files_refreshed,
        report.files_skipped,
        report.files_failed,
    );
    if report.cancelled {
        out.push_str(" (cancelled)");
    }
    for e in &report.errors {
        out.push_str("\n  ");
        out.push_str(e);
    }
    out
}

fn describe_matches(matches: &[FileMatch]) -> String {
    if matches.is_empty() {
        return "no matches".into();
    }
    matches
        .iter()
        .map(|m| {
            let marker = if m.within_ceiling { ' ' } else { '~' };
            format!("{marker} {:.3}  {}", m.distance, m.filepath)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn describe_status(status: &WorkspaceStatus) -> String {
    format!(
        "workspace: {}\nbackend:   {}\nprovider:  {} ({})\ncontent:   {} record(s) in {}\nfiles:     {} record(s)\nprojection: {} record(s) in {}",
        status.workspace,
        status.backend,
        status.provider,
        status.model,
        status.content_records,
        status.content_table,
        status.file_records,
        status.projected_records,
        status.workspace_table,
    )
}

fn resolve_config_path(flag: Option<&Path>) -> PathBuf {
    if let Some(path) = flag {
        return path.to_path_buf();
    }
    if let Ok(path) = std::env::var("DELVE_CONFIG") {
        return PathBuf::from(path);
    }
    PathBuf::from("config/default.toml")
}

fn init_subscriber() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
