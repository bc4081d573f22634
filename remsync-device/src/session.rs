use std::{env, io, process::Stdio, time::Duration};

use thiserror::Error;
use tokio::process::Command;

use crate::backoff::RetryPolicy;
use crate::listing::{RemoteObject, parse_listing};

const DEFAULT_HOST: &str = "10.11.99.1";
const DEFAULT_USER: &str = "root";
const DEFAULT_PORT: u16 = 22;
const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("failed to spawn {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: io::Error,
    },
    #[error("remote command failed (exit {code:?}): {stderr}")]
    CommandFailed { code: Option<i32>, stderr: String },
    #[error("remote command timed out after {0:?}")]
    Timeout(Duration),
    #[error("remote output is not valid UTF-8")]
    InvalidOutput,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Connection parameters for the tablet's SSH service. The tablet exposes a
/// plain root login over the USB network interface.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub ssh_binary: String,
    pub command_timeout: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            host: env::var("REMSYNC_DEVICE_HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string()),
            user: env::var("REMSYNC_DEVICE_USER").unwrap_or_else(|_| DEFAULT_USER.to_string()),
            port: env::var("REMSYNC_DEVICE_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_PORT),
            ssh_binary: env::var("REMSYNC_SSH_BINARY").unwrap_or_else(|_| "ssh".to_string()),
            command_timeout: Duration::from_secs(
                env::var("REMSYNC_COMMAND_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS),
            ),
        }
    }
}

impl DeviceConfig {
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Argument vector for a non-interactive ssh invocation of `command`.
    /// Key-based auth is assumed; a password prompt would hang a batch run,
    /// so BatchMode refuses it outright.
    pub fn ssh_args(&self, command: &str) -> Vec<String> {
        vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-p".to_string(),
            self.port.to_string(),
            self.destination(),
            command.to_string(),
        ]
    }
}

/// Executes commands on the tablet through ssh child processes. One session
/// object is shared per run; each call is an independent subprocess.
#[derive(Debug, Clone)]
pub struct DeviceSession {
    config: DeviceConfig,
    retry: RetryPolicy,
}

impl DeviceSession {
    pub fn new(config: DeviceConfig) -> Self {
        Self {
            config,
            retry: RetryPolicy::transport(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Runs one remote command and returns its stdout.
    pub async fn exec(&self, command: &str) -> Result<String, DeviceError> {
        let mut child = Command::new(&self.config.ssh_binary)
            .args(self.config.ssh_args(command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| DeviceError::Spawn {
                tool: self.config.ssh_binary.clone(),
                source,
            })?;

        let output = match tokio::time::timeout(self.config.command_timeout, async {
            let out = child.wait_with_output().await?;
            Ok::<_, io::Error>(out)
        })
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(DeviceError::Timeout(self.config.command_timeout)),
        };

        if !output.status.success() {
            return Err(DeviceError::CommandFailed {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        String::from_utf8(output.stdout).map_err(|_| DeviceError::InvalidOutput)
    }

    /// Enumerates every file under `root` with modification time and size.
    /// Retried with backoff; fatal only once the attempt budget is spent.
    pub async fn list_files(&self, root: &str) -> Result<Vec<RemoteObject>, DeviceError> {
        let command = format!("find {root} -type f -exec stat -c '%Y %s %n' {{}} \\;");
        let mut last_err = None;
        for attempt in 0..self.retry.attempts {
            match self.exec(&command).await {
                Ok(output) => return Ok(parse_listing(&output)),
                Err(err) => {
                    last_err = Some(err);
                    if attempt + 1 < self.retry.attempts {
                        tokio::time::sleep(self.retry.delay(attempt)).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or(DeviceError::Timeout(self.config.command_timeout)))
    }
}
