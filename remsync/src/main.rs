mod convert;
mod sync;

use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use convert::assemble::DocumentAssembler;
use convert::dispatch::Dispatcher;
use convert::overlay::OverlayMerger;
use convert::renderer::ToolchainRenderer;
use convert::run::{ConversionRun, ConvertSummary, Selection};
use remsync_device::{DeviceConfig, DeviceSession, TransferClient};
use sync::engine::{SyncEngine, SyncOutcome};

/// Document tree on the tablet.
const DEFAULT_REMOTE_ROOT: &str = "/home/root/.local/share/remarkable/xochitl";

/// Conversion budget when it runs as the second stage of a backup. A
/// first backup of a full tablet can outlast any reasonable sitting; the
/// next run resumes from the changed set.
const BACKUP_CONVERT_DEADLINE_SECS: u64 = 1800;

#[derive(Debug, Parser)]
#[command(name = "remsync", version, about = "Incremental reMarkable backup and PDF conversion")]
struct Cli {
    /// Backup root holding files/, pdfs/ and the sync metadata snapshot.
    #[arg(long, global = true, default_value = "./remarkable_backup")]
    backup_dir: PathBuf,

    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Sync the tablet, then convert the notebooks that changed.
    Backup {
        /// Convert every notebook, not just the changed ones.
        #[arg(long)]
        force_convert_all: bool,
    },
    /// Convert already-backed-up notebooks without touching the tablet.
    Convert {
        /// File of notebook ids to convert, one per line.
        #[arg(long, value_name = "FILE")]
        updated_only: Option<PathBuf>,

        /// Convert at most N of the selected notebooks.
        #[arg(long, value_name = "N")]
        sample: Option<usize>,

        /// Where rendered PDFs land. Defaults to <backup-dir>/pdfs.
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("[remsync] interrupt received; stopping after in-flight work");
                cancel.cancel();
            }
        });
    }

    let backup_dir = cli.backup_dir.clone();
    let files_dir = backup_dir.join("files");
    let store_path = backup_dir.join("sync_metadata.json");
    let templates_dir = backup_dir.join("templates");

    match cli.command {
        Command::Backup { force_convert_all } => {
            tokio::fs::create_dir_all(&files_dir)
                .await
                .with_context(|| format!("cannot create {}", files_dir.display()))?;

            let device = DeviceConfig::default();
            let engine = SyncEngine::new(
                DeviceSession::new(device.clone()),
                TransferClient::new(device),
                remote_root(),
                files_dir.clone(),
                store_path,
                cli.verbose,
            );
            let outcome = engine.run(&cancel).await?;
            report_sync(&outcome);
            if outcome.cancelled {
                return Ok(());
            }
            if outcome.nothing_changed() && !force_convert_all {
                eprintln!("[remsync] nothing changed; skipping conversion");
                return Ok(());
            }

            let selection = Selection {
                force_all: force_convert_all,
                changed: Some(outcome.changed_notebooks),
                ..Selection::default()
            };
            let run = conversion_run(
                files_dir,
                backup_dir.join("pdfs"),
                templates_dir,
                Some(Duration::from_secs(BACKUP_CONVERT_DEADLINE_SECS)),
                cli.verbose,
            );
            let summary = run.run(&selection, &cancel).await?;
            report_convert(&summary);
        }
        Command::Convert {
            updated_only,
            sample,
            output_dir,
        } => {
            let selection = Selection {
                id_list: updated_only,
                sample,
                ..Selection::default()
            };
            let run = conversion_run(
                files_dir,
                output_dir.unwrap_or_else(|| backup_dir.join("pdfs")),
                templates_dir,
                None,
                cli.verbose,
            );
            let summary = run.run(&selection, &cancel).await?;
            report_convert(&summary);
        }
    }
    Ok(())
}

fn remote_root() -> String {
    env::var("REMSYNC_REMOTE_ROOT").unwrap_or_else(|_| DEFAULT_REMOTE_ROOT.to_string())
}

fn conversion_run(
    files_dir: PathBuf,
    output_root: PathBuf,
    templates_dir: PathBuf,
    deadline: Option<Duration>,
    verbose: bool,
) -> ConversionRun {
    let renderer = Arc::new(ToolchainRenderer::new(Some(templates_dir)));
    let dispatcher = Dispatcher::new(
        renderer,
        OverlayMerger::default(),
        DocumentAssembler::default(),
        files_dir.clone(),
        output_root,
        verbose,
    );
    ConversionRun::new(dispatcher, files_dir, deadline, verbose)
}

fn report_sync(outcome: &SyncOutcome) {
    eprintln!(
        "[remsync] sync done: {} transferred, {} up to date, {} failed, {} notebooks changed",
        outcome.transferred,
        outcome.skipped,
        outcome.failed,
        outcome.changed_notebooks.len()
    );
}

fn report_convert(summary: &ConvertSummary) {
    eprintln!(
        "[remsync] conversion done: {} of {} notebooks produced PDFs, {} failed, {} sidecar notes",
        summary.notebooks_converted,
        summary.notebooks_selected,
        summary.notebooks_failed,
        summary.sidecars
    );
    for (generation, count) in &summary.pages_converted {
        eprintln!("[remsync]   {} pages converted: {count}", generation.label());
    }
    for (generation, count) in &summary.pages_unsupported {
        eprintln!("[remsync]   {} pages unsupported: {count}", generation.label());
    }
    if summary.deadline_exceeded {
        eprintln!("[remsync] conversion budget exhausted; rerun to convert the rest");
    }
    if summary.cancelled {
        eprintln!("[remsync] conversion cancelled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backup_dir_defaults_and_flags_parse() {
        let cli = Cli::parse_from(["remsync", "backup"]);
        assert_eq!(cli.backup_dir, PathBuf::from("./remarkable_backup"));
        assert!(matches!(
            cli.command,
            Command::Backup {
                force_convert_all: false
            }
        ));

        let cli = Cli::parse_from([
            "remsync",
            "convert",
            "--backup-dir",
            "/tmp/b",
            "--sample",
            "3",
        ]);
        assert_eq!(cli.backup_dir, PathBuf::from("/tmp/b"));
        let Command::Convert { sample, .. } = cli.command else {
            panic!("expected convert");
        };
        assert_eq!(sample, Some(3));
    }
}
