use std::collections::BTreeSet;
use std::path::PathBuf;

use futures_util::StreamExt;
use remsync_device::{DeviceError, DeviceSession, TransferClient};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::ids::notebook_id;
use super::resolver::{hash_file, relative_remote_path, resolve};
use super::store::MetadataStore;

/// How many fetch futures are kept in flight; the transfer client's own
/// semaphore is the real concurrency bound.
const PIPELINE_WIDTH: usize = 8;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("device error: {0}")]
    Device(#[from] DeviceError),
}

/// What one sync run did. Partial success is a normal outcome.
#[derive(Debug, Default)]
pub struct SyncOutcome {
    pub transferred: usize,
    pub skipped: usize,
    pub failed: usize,
    pub changed_notebooks: BTreeSet<String>,
    pub cancelled: bool,
}

impl SyncOutcome {
    /// True when the conversion phase has nothing to look at.
    pub fn nothing_changed(&self) -> bool {
        self.transferred == 0 && self.changed_notebooks.is_empty()
    }
}

/// Drives one incremental backup pass: list the device tree, resolve the
/// change set, download it, and record results in the metadata store.
pub struct SyncEngine {
    session: DeviceSession,
    transfer: TransferClient,
    remote_root: String,
    files_root: PathBuf,
    store_path: PathBuf,
    verbose: bool,
}

impl SyncEngine {
    pub fn new(
        session: DeviceSession,
        transfer: TransferClient,
        remote_root: String,
        files_root: PathBuf,
        store_path: PathBuf,
        verbose: bool,
    ) -> Self {
        Self {
            session,
            transfer,
            remote_root,
            files_root,
            store_path,
            verbose,
        }
    }

    /// Runs the sync phase once. Only a total listing failure is fatal;
    /// per-file transfer failures are counted and skipped. Cancellation is
    /// honored between transfers, and the store snapshot persisted on exit
    /// covers exactly the completed records.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<SyncOutcome, EngineError> {
        let remote_objects = self.session.list_files(&self.remote_root).await?;
        if remote_objects.is_empty() {
            eprintln!("[remsync] no files found on the device");
            return Ok(SyncOutcome::default());
        }

        let mut store = MetadataStore::load(self.store_path.clone());
        let plans = resolve(&remote_objects, &store, &self.remote_root, &self.files_root).await;

        let mut outcome = SyncOutcome {
            skipped: remote_objects.len() - plans.len(),
            ..SyncOutcome::default()
        };
        if plans.is_empty() {
            eprintln!("[remsync] all {} files are up to date", remote_objects.len());
            return Ok(outcome);
        }
        eprintln!("[remsync] syncing {} of {} files", plans.len(), remote_objects.len());

        let mut fetches = futures_util::stream::iter(plans.into_iter().map(|plan| {
            let transfer = self.transfer.clone();
            async move {
                let result = transfer
                    .fetch_to_path(&plan.object.path, &plan.local_path)
                    .await;
                (plan, result)
            }
        }))
        .buffer_unordered(PIPELINE_WIDTH);

        // Single consumer: store mutation stays serialized no matter how
        // many scp sessions run underneath.
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    eprintln!("[remsync] sync cancelled; aborting outstanding transfers");
                    outcome.cancelled = true;
                    break;
                }
                next = fetches.next() => {
                    let Some((plan, result)) = next else { break };
                    match result {
                        Ok(()) => match hash_file(&plan.local_path).await {
                            Some(hash) => {
                                store.record(&plan.object, hash);
                                outcome.transferred += 1;
                                if let Some(relative) =
                                    relative_remote_path(&plan.object.path, &self.remote_root)
                                    && let Some(id) = notebook_id(relative)
                                {
                                    outcome.changed_notebooks.insert(id.to_string());
                                }
                                if self.verbose {
                                    eprintln!("[remsync] downloaded {}", plan.object.path);
                                }
                            }
                            None => {
                                eprintln!(
                                    "[remsync] downloaded {} but cannot hash it; will retry next run",
                                    plan.object.path
                                );
                                outcome.failed += 1;
                            }
                        },
                        Err(err) => {
                            eprintln!("[remsync] failed to download {}: {err}", plan.object.path);
                            outcome.failed += 1;
                        }
                    }
                }
            }
        }
        drop(fetches);

        // Persist whatever completed; the write is atomic, so even a
        // cancelled run leaves either the old snapshot or the new one.
        if let Err(err) = store.persist() {
            eprintln!("[remsync] warning: failed to persist metadata store: {err}");
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nothing_changed_requires_zero_transfers_and_ids() {
        let mut outcome = SyncOutcome::default();
        assert!(outcome.nothing_changed());
        outcome.transferred = 1;
        assert!(!outcome.nothing_changed());
    }
}
