use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::classify::FormatGeneration;
use super::descriptor::{NotebookDescriptor, load_descriptors};
use super::dispatch::{ConvertError, ConversionOutcome, Dispatcher};
use super::index::NotebookIndex;

const DEFAULT_WORKERS: usize = 2;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("backup root is unreadable: {0}")]
    BackupUnreadable(#[source] io::Error),
    #[error("id list {path} is unreadable: {source}")]
    IdListUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Which notebooks one conversion run covers.
#[derive(Debug, Default)]
pub struct Selection {
    /// Convert everything, ignoring the changed set.
    pub force_all: bool,
    /// Notebook ids the sync phase saw change. `None` outside a backup run.
    pub changed: Option<BTreeSet<String>>,
    /// File of notebook ids, one per line.
    pub id_list: Option<PathBuf>,
    /// Keep only the first N selected notebooks.
    pub sample: Option<usize>,
}

/// Aggregated result of a conversion run.
#[derive(Debug, Default)]
pub struct ConvertSummary {
    pub notebooks_selected: usize,
    pub notebooks_converted: usize,
    pub notebooks_failed: usize,
    pub pages_converted: BTreeMap<FormatGeneration, usize>,
    pub pages_unsupported: BTreeMap<FormatGeneration, usize>,
    pub sidecars: usize,
    pub cancelled: bool,
    pub deadline_exceeded: bool,
}

/// Drives the dispatcher over a selection of notebooks with a bounded
/// worker pool. Notebooks are independent, so completion order is
/// irrelevant here; page order inside each document is the dispatcher's
/// concern.
pub struct ConversionRun {
    dispatcher: Dispatcher,
    files_dir: PathBuf,
    workers: usize,
    /// Overall budget when conversion runs as a backup sub-stage.
    deadline: Option<Duration>,
    verbose: bool,
}

impl ConversionRun {
    pub fn new(
        dispatcher: Dispatcher,
        files_dir: PathBuf,
        deadline: Option<Duration>,
        verbose: bool,
    ) -> Self {
        let workers = std::env::var("REMSYNC_CONVERT_WORKERS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_WORKERS)
            .max(1);
        Self {
            dispatcher,
            files_dir,
            workers,
            deadline,
            verbose,
        }
    }

    pub async fn run(
        &self,
        selection: &Selection,
        cancel: &CancellationToken,
    ) -> Result<ConvertSummary, RunError> {
        let descriptors =
            load_descriptors(&self.files_dir).map_err(RunError::BackupUnreadable)?;
        let index = NotebookIndex::build(&descriptors);
        let selected = select(&index.documents, selection)?;

        let mut summary = ConvertSummary {
            notebooks_selected: selected.len(),
            ..ConvertSummary::default()
        };
        if self.verbose {
            eprintln!(
                "[remsync] converting {} of {} notebooks",
                selected.len(),
                index.documents.len()
            );
        }

        let work = stream::iter(selected)
            .map(|document| {
                let folder = index.folder_path(&document.id);
                async move {
                    let result = self
                        .dispatcher
                        .convert_notebook(document, folder, cancel)
                        .await;
                    (document, result)
                }
            })
            .buffer_unordered(self.workers);
        tokio::pin!(work);

        let budget = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(budget);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    summary.cancelled = true;
                    break;
                }
                _ = &mut budget => {
                    // Retryable: the next run picks up where this one
                    // stopped.
                    summary.deadline_exceeded = true;
                    cancel.cancel();
                    break;
                }
                next = work.next() => match next {
                    Some((document, result)) => {
                        self.absorb(document, result, &mut summary);
                    }
                    None => break,
                },
            }
        }
        Ok(summary)
    }

    fn absorb(
        &self,
        document: &NotebookDescriptor,
        result: Result<ConversionOutcome, ConvertError>,
        summary: &mut ConvertSummary,
    ) {
        match result {
            Ok(outcome) => {
                if outcome.pages_converted() > 0 {
                    summary.notebooks_converted += 1;
                }
                if !outcome.unsupported.is_empty() {
                    summary.sidecars += 1;
                }
                for (generation, count) in &outcome.converted {
                    *summary.pages_converted.entry(*generation).or_insert(0) += count;
                }
                for (generation, count) in &outcome.unsupported {
                    *summary.pages_unsupported.entry(*generation).or_insert(0) += count;
                }
                if self.verbose && !outcome.outputs.is_empty() {
                    eprintln!(
                        "[remsync] converted {:?} ({} pages)",
                        outcome.name,
                        outcome.pages_converted()
                    );
                }
            }
            Err(err) => {
                // Contained: one notebook failing never stops the run.
                summary.notebooks_failed += 1;
                eprintln!(
                    "[remsync] warning: conversion of {:?} failed: {err}",
                    document.display_name
                );
            }
        }
    }
}

/// Applies the selection policy: force-all, explicit id list, changed set
/// from the sync phase, or everything, with an optional sample cap on top.
fn select<'a>(
    documents: &'a [NotebookDescriptor],
    selection: &Selection,
) -> Result<Vec<&'a NotebookDescriptor>, RunError> {
    let mut chosen: Vec<&NotebookDescriptor> = if selection.force_all {
        documents.iter().collect()
    } else if let Some(path) = &selection.id_list {
        let text = std::fs::read_to_string(path).map_err(|source| RunError::IdListUnreadable {
            path: path.clone(),
            source,
        })?;
        let ids: BTreeSet<&str> = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();
        documents
            .iter()
            .filter(|d| ids.contains(d.id.as_str()))
            .collect()
    } else if let Some(changed) = &selection.changed {
        documents.iter().filter(|d| changed.contains(&d.id)).collect()
    } else {
        documents.iter().collect()
    };

    if let Some(cap) = selection.sample {
        chosen.truncate(cap);
    }
    Ok(chosen)
}
