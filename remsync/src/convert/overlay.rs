use std::{env, io, path::Path, process::Stdio, time::Duration};

use thiserror::Error;
use tokio::process::Command;

const DEFAULT_OVERLAY_TIMEOUT_SECS: u64 = 30;

/// Template name the device uses for pages without a background.
const BLANK_TEMPLATE: &str = "Blank";

#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("overlay utility {0} is unavailable")]
    ToolUnavailable(String),
    #[error("overlay failed (exit {code:?}): {stderr}")]
    Failed { code: Option<i32>, stderr: String },
    #[error("overlay timed out after {0:?}")]
    Timeout(Duration),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Returns the template to render beneath a page, or `None` when the page
/// declares no background ("Blank" or absent).
pub fn overlay_template(declared: Option<&str>) -> Option<&str> {
    match declared {
        None => None,
        Some(name) if name.is_empty() || name == BLANK_TEMPLATE => None,
        Some(name) => Some(name),
    }
}

/// Composites a rendered content page on top of a background template page
/// using qpdf's underlay mode.
pub struct OverlayMerger {
    qpdf_binary: String,
    timeout: Duration,
}

impl Default for OverlayMerger {
    fn default() -> Self {
        Self {
            qpdf_binary: env::var("REMSYNC_QPDF_BINARY").unwrap_or_else(|_| "qpdf".to_string()),
            timeout: Duration::from_secs(DEFAULT_OVERLAY_TIMEOUT_SECS),
        }
    }
}

impl OverlayMerger {
    /// Places `background` beneath `content`, writing the composite to
    /// `output`. The background is copied to a scratch sibling first: the
    /// rendered template is shared across pages, and the shared copy must
    /// never be handed to the merge tool that may rewrite its input.
    pub async fn composite(
        &self,
        content: &Path,
        background: &Path,
        output: &Path,
    ) -> Result<(), OverlayError> {
        let background_copy = output.with_extension("underlay.pdf");
        tokio::fs::copy(background, &background_copy).await?;

        let content_arg = content.to_string_lossy().into_owned();
        let background_arg = background_copy.to_string_lossy().into_owned();
        let output_arg = output.to_string_lossy().into_owned();

        let child = Command::new(&self.qpdf_binary)
            .args([
                &content_arg,
                &"--underlay".to_string(),
                &background_arg,
                &"--".to_string(),
                &output_arg,
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| match err.kind() {
                io::ErrorKind::NotFound => OverlayError::ToolUnavailable(self.qpdf_binary.clone()),
                _ => OverlayError::Io(err),
            })?;

        let result = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                let _ = tokio::fs::remove_file(&background_copy).await;
                return Err(OverlayError::Timeout(self.timeout));
            }
        };
        let _ = tokio::fs::remove_file(&background_copy).await;

        if !result.status.success() {
            return Err(OverlayError::Failed {
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
    fn blank_or_absent_templates_are_never_overlaid() {
        assert_eq!(overlay_template(None), None);
        assert_eq!(overlay_template(Some("Blank")), None);
        assert_eq!(overlay_template(Some("")), None);
        assert_eq!(overlay_template(Some("P Lines small")), Some("P Lines small"));
    }

    #[tokio::test]
    async fn composite_copies_the_background_before_merging() {
        let dir = tempfile::tempdir().unwrap();
        let stub = dir.path().join("qpdf-stub");
        // Record argv, then create the output (last argument).
        std::fs::write(
            &stub,
            format!(
                "#!/bin/sh\necho \"$@\" > {}\nfor arg in \"$@\"; do out=\"$arg\"; done\n: > \"$out\"\n",
                dir.path().join("argv.txt").display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&stub, std::fs::Permissions::from_mode(0o755)).unwrap();

        let content = dir.path().join("content.pdf");
        let background = dir.path().join("template.pdf");
        std::fs::write(&content, b"%PDF-content").unwrap();
        std::fs::write(&background, b"%PDF-template").unwrap();
        let output = dir.path().join("page.pdf");

        let merger = OverlayMerger {
            qpdf_binary: stub.to_string_lossy().into_owned(),
            timeout: Duration::from_secs(5),
        };
        merger.composite(&content, &background, &output).await.unwrap();

        assert!(output.exists());
        // The shared template itself was not given to the tool.
        let argv = std::fs::read_to_string(dir.path().join("argv.txt")).unwrap();
        assert!(argv.contains("underlay.pdf"));
        assert!(!argv.contains("template.pdf"));
        // Original background survives untouched for the next page.
        assert_eq!(std::fs::read(&background).unwrap(), b"%PDF-template");
    }

    #[tokio::test]
    async fn missing_utility_is_tool_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let content = dir.path().join("content.pdf");
        let background = dir.path().join("template.pdf");
        std::fs::write(&content, b"c").unwrap();
        std::fs::write(&background, b"t").unwrap();

        let merger = OverlayMerger {
            qpdf_binary: "remsync-no-such-tool".to_string(),
            timeout: Duration::from_secs(5),
        };
        let err = merger
            .composite(&content, &background, &dir.path().join("out.pdf"))
            .await
            .unwrap_err();
        assert!(matches!(err, OverlayError::ToolUnavailable(_)));
    }
}
