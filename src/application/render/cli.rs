//! Non-pooled fallback: one `mmdc` process per render.
//!
//! No post-pass and no scale clamping beyond what the CLI does itself; the
//! output is whatever `mmdc` writes for the requested format.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{process::Command, time::Instant};
use tracing::{info, warn};

use super::types::{DiagramRenderer, RenderFailure, RenderedDiagram};
use crate::domain::request::RenderRequest;

const SOURCE: &str = "application::render::cli";

#[derive(Debug, Clone)]
pub struct CliRenderer {
    cli_path: PathBuf,
    work_dir: PathBuf,
    timeout: Duration,
}

impl CliRenderer {
    pub fn new(
        cli_path: impl Into<PathBuf>,
        work_dir: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            cli_path: cli_path.into(),
            work_dir: work_dir.into(),
            timeout,
        }
    }

    fn command(&self, request: &RenderRequest, input: &Path, output: &Path) -> Command {
        let mut command = Command::new(&self.cli_path);
        command
            .arg("--input")
            .arg(input)
            .arg("--output")
            .arg(output)
            .arg("--outputFormat")
            .arg(request.format().extension())
            .arg("--theme")
            .arg(request.theme().as_str())
            .arg("--backgroundColor")
            .arg(request.background())
            .arg("--scale")
            .arg(request.scale().to_string());
        if let Some(width) = request.width() {
            command.arg("--width").arg(width.to_string());
        }
        if let Some(height) = request.height() {
            command.arg("--height").arg(height.to_string());
        }
        command
            .arg("--quiet")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl DiagramRenderer for CliRenderer {
    async fn render(&self, request: &RenderRequest) -> Result<RenderedDiagram, RenderFailure> {
        let started_at = Instant::now();
        tokio::fs::create_dir_all(&self.work_dir).await?;
        let scratch = tempfile::Builder::new()
            .prefix("cli-")
            .tempdir_in(&self.work_dir)?;
        let input = scratch.path().join("diagram.mmd");
        let output = scratch
            .path()
            .join(format!("diagram.{}", request.format().extension()));
        tokio::fs::write(&input, request.code()).await?;

        let child = self
            .command(request, &input, &output)
            .spawn()
            .map_err(|err| {
                let error_code = if err.kind() == ErrorKind::NotFound {
                    "cli_not_found"
                } else {
                    "spawn_cli"
                };
                warn!(
                    target = SOURCE,
                    op = "cli::render",
                    result = "error",
                    error_code,
                    cli_path = %self.cli_path.display(),
                    error = %err,
                    "Failed to spawn Mermaid CLI"
                );
                err
            })?;

        // Dropping the pending future on timeout drops the child, which kills it.
        let result = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(
                    target = SOURCE,
                    op = "cli::render",
                    result = "timeout",
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    "Mermaid CLI exceeded the render timeout"
                );
                return Err(RenderFailure::Timeout {
                    step: "cli",
                    after: self.timeout,
                });
            }
        };

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr).trim().to_string();
            warn!(
                target = SOURCE,
                op = "cli::render",
                result = "error",
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                exit_code = result.status.code().map(i64::from).unwrap_or(-1),
                error_code = "mermaid_cli",
                stderr = %stderr,
                "Mermaid CLI invocation failed"
            );
            let message = if stderr.is_empty() {
                format!("mermaid CLI exited with {}", result.status)
            } else {
                stderr
            };
            return Err(RenderFailure::Render { message });
        }

        let bytes = tokio::fs::read(&output).await?;
        if bytes.is_empty() {
            return Err(RenderFailure::render("mermaid CLI produced an empty file"));
        }

        info!(
            target = SOURCE,
            op = "cli::render",
            result = "ok",
            format = request.format().as_str(),
            bytes = bytes.len(),
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "Diagram rendered via CLI"
        );

        Ok(RenderedDiagram {
            bytes: Bytes::from(bytes),
            format: request.format(),
            pixel_size: None,
            density: u32::from(request.scale()),
        })
    }
}
