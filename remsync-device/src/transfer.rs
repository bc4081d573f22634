use std::{
    env, io,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Semaphore;

use crate::session::DeviceConfig;

const DEFAULT_TRANSFER_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("failed to spawn {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: io::Error,
    },
    #[error("scp failed for {path} (exit {code:?}): {stderr}")]
    CopyFailed {
        path: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("transfer of {path} timed out after {timeout:?}")]
    Timeout { path: String, timeout: Duration },
    #[error("concurrency limiter is closed")]
    ConcurrencyClosed,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct TransferConfig {
    pub download_concurrency: usize,
    pub transfer_timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            download_concurrency: read_limit("REMSYNC_DOWNLOAD_CONCURRENCY", 4),
            transfer_timeout: Duration::from_secs(
                env::var("REMSYNC_TRANSFER_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_TRANSFER_TIMEOUT_SECS),
            ),
        }
    }
}

/// Fetches remote files over scp. Each fetch is an independent scp session;
/// the semaphore bounds how many run at once over the slow USB link.
#[derive(Clone)]
pub struct TransferClient {
    device: DeviceConfig,
    scp_binary: String,
    timeout: Duration,
    download_limit: Arc<Semaphore>,
}

impl TransferClient {
    pub fn new(device: DeviceConfig) -> Self {
        Self::with_config(device, TransferConfig::default())
    }

    pub fn with_config(device: DeviceConfig, config: TransferConfig) -> Self {
        Self {
            device,
            scp_binary: env::var("REMSYNC_SCP_BINARY").unwrap_or_else(|_| "scp".to_string()),
            timeout: config.transfer_timeout,
            download_limit: Arc::new(Semaphore::new(config.download_concurrency.max(1))),
        }
    }

    /// Argument vector for one scp fetch of `remote_path` into `target`.
    pub fn scp_args(&self, remote_path: &str, target: &Path) -> Vec<String> {
        vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-P".to_string(),
            self.device.port.to_string(),
            format!("{}:{}", self.device.destination(), remote_path),
            target.to_string_lossy().into_owned(),
        ]
    }

    /// Copies one remote file into `target`, creating parent directories.
    /// The payload lands in a `.partial` sibling and is renamed into place
    /// only after scp exits cleanly, so an interrupted copy never leaves a
    /// plausible-looking truncated file behind.
    pub async fn fetch_to_path(
        &self,
        remote_path: &str,
        target: &Path,
    ) -> Result<(), TransferError> {
        let _permit = self
            .download_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransferError::ConcurrencyClosed)?;

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(target);

        let mut child = Command::new(&self.scp_binary)
            .args(self.scp_args(remote_path, &partial))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TransferError::Spawn {
                tool: self.scp_binary.clone(),
                source,
            })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(TransferError::Timeout {
                    path: remote_path.to_string(),
                    timeout: self.timeout,
                });
            }
        };

        if !output.status.success() {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(TransferError::CopyFailed {
                path: remote_path.to_string(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        tokio::fs::rename(partial, target).await?;
        Ok(())
    }
}

fn partial_path(target: &Path) -> PathBuf {
    target.with_extension(format!(
        "{}partial",
        target
            .extension()
            .map(|ext| format!("{}.", ext.to_string_lossy()))
            .unwrap_or_default()
    ))
}

fn read_limit(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> TransferClient {
        let device = DeviceConfig {
            host: "10.11.99.1".to_string(),
            user: "root".to_string(),
            port: 22,
            ssh_binary: "ssh".to_string(),
            command_timeout: Duration::from_secs(5),
        };
        TransferClient::with_config(
            device,
            TransferConfig {
                download_concurrency: 2,
                transfer_timeout: Duration::from_secs(5),
            },
        )
    }

    #[test]
    fn scp_args_name_source_and_target() {
        let args = client().scp_args("/remote/a.rm", Path::new("/local/a.rm"));
        assert!(args.contains(&"root@10.11.99.1:/remote/a.rm".to_string()));
        assert_eq!(args.last().unwrap(), "/local/a.rm");
    }

    #[test]
    fn partial_path_keeps_original_extension() {
        assert_eq!(
            partial_path(Path::new("/x/a.metadata")),
            PathBuf::from("/x/a.metadata.partial")
        );
        assert_eq!(partial_path(Path::new("/x/noext")), PathBuf::from("/x/noext.partial"));
    }

    #[tokio::test]
    async fn fetch_reports_missing_scp_binary() {
        let mut client = client();
        client.scp_binary = "remsync-no-such-tool".to_string();
        let dir = tempfile::tempdir().unwrap();
        let err = client
            .fetch_to_path("/remote/a.rm", &dir.path().join("a.rm"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Spawn { .. }));
    }

    #[tokio::test]
    async fn failed_copy_leaves_no_partial_file() {
        let mut client = client();
        // `false` exits nonzero without writing anything.
        client.scp_binary = "false".to_string();
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested/a.rm");
        let err = client.fetch_to_path("/remote/a.rm", &target).await.unwrap_err();
        assert!(matches!(err, TransferError::CopyFailed { .. }));
        assert!(!target.exists());
        assert!(!partial_path(&target).exists());
    }
}
