use std::{
    env, io,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use thiserror::Error;
use tokio::process::Command;

const DEFAULT_MERGE_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("merge utility {0} is unavailable")]
    ToolUnavailable(String),
    #[error("merge input is unreadable: {0}")]
    InputUnreadable(PathBuf),
    #[error("merge failed (exit {code:?}): {stderr}")]
    Failed { code: Option<i32>, stderr: String },
    #[error("merge timed out after {0:?}")]
    Timeout(Duration),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Merges ordered per-page PDFs into one document via qpdf. Page order in
/// the output is exactly the input order; the assembler never reorders.
pub struct DocumentAssembler {
    qpdf_binary: String,
    timeout: Duration,
}

impl Default for DocumentAssembler {
    fn default() -> Self {
        Self {
            qpdf_binary: env::var("REMSYNC_QPDF_BINARY").unwrap_or_else(|_| "qpdf".to_string()),
            timeout: Duration::from_secs(DEFAULT_MERGE_TIMEOUT_SECS),
        }
    }
}

impl DocumentAssembler {
    #[cfg(test)]
    pub(crate) fn with_binary(qpdf_binary: &str) -> Self {
        Self {
            qpdf_binary: qpdf_binary.to_string(),
            timeout: Duration::from_secs(5),
        }
    }

    fn merge_args(inputs: &[PathBuf], output: &Path) -> Vec<String> {
        let mut args = vec!["--empty".to_string(), "--pages".to_string()];
        args.extend(inputs.iter().map(|p| p.to_string_lossy().into_owned()));
        args.push("--".to_string());
        args.push(output.to_string_lossy().into_owned());
        args
    }

    /// Appends the pages of each input, in order, into one document at
    /// `output`, creating parent folders as needed.
    pub async fn merge(&self, inputs: &[PathBuf], output: &Path) -> Result<(), MergeError> {
        for input in inputs {
            if !input.is_file() {
                return Err(MergeError::InputUnreadable(input.clone()));
            }
        }
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let child = Command::new(&self.qpdf_binary)
            .args(Self::merge_args(inputs, output))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| match err.kind() {
                io::ErrorKind::NotFound => MergeError::ToolUnavailable(self.qpdf_binary.clone()),
                _ => MergeError::Io(err),
            })?;

        let result = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => return Err(MergeError::Timeout(self.timeout)),
        };

        if !result.status.success() {
            return Err(MergeError::Failed {
                code: result.status.code(),
                stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn merge_args_preserve_input_order() {
        let args = DocumentAssembler::merge_args(
            &[PathBuf::from("/t/p3.pdf"), PathBuf::from("/t/p1.pdf")],
            Path::new("/out/doc.pdf"),
        );
        assert_eq!(
            args,
            vec!["--empty", "--pages", "/t/p3.pdf", "/t/p1.pdf", "--", "/out/doc.pdf"]
        );
    }

    #[tokio::test]
    async fn missing_utility_is_tool_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("p1.pdf");
        std::fs::write(&input, b"%PDF-1.4").unwrap();
        let assembler = DocumentAssembler::with_binary("remsync-no-such-tool");
        let err = assembler
            .merge(&[input], &dir.path().join("out.pdf"))
            .await
            .unwrap_err();
        assert!(matches!(err, MergeError::ToolUnavailable(_)));
    }

    #[tokio::test]
    async fn unreadable_input_fails_before_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let assembler = DocumentAssembler::with_binary("remsync-no-such-tool");
        let err = assembler
            .merge(&[dir.path().join("absent.pdf")], &dir.path().join("out.pdf"))
            .await
            .unwrap_err();
        assert!(matches!(err, MergeError::InputUnreadable(_)));
    }

    #[tokio::test]
    async fn successful_merge_creates_parent_folders() {
        let dir = tempfile::tempdir().unwrap();
        let stub = dir.path().join("qpdf-stub");
        // Last argument is the output path; the stub just creates it.
        std::fs::write(&stub, "#!/bin/sh\nfor arg in \"$@\"; do out=\"$arg\"; done\n: > \"$out\"\n")
            .unwrap();
        std::fs::set_permissions(&stub, std::fs::Permissions::from_mode(0o755)).unwrap();

        let input = dir.path().join("p1.pdf");
        std::fs::write(&input, b"%PDF-1.4").unwrap();
        let output = dir.path().join("Folder B/Folder A/doc.pdf");

        let assembler = DocumentAssembler::with_binary(&stub.to_string_lossy());
        assembler.merge(&[input], &output).await.unwrap();
        assert!(output.exists());
    }
}
