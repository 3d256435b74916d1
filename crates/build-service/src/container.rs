//! Container runtime driver.
//!
//! Wraps the podman/docker CLI as a narrow capability: check for an
//! image, pull it, run a one-shot container and report its exit code and
//! combined output. The driver never interprets what the ImageBuilder
//! does inside the container.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("container runtime unavailable: {0}")]
    Runtime(#[from] std::io::Error),

    #[error("{command} failed: {detail}")]
    Command { command: String, detail: String },

    #[error("timed out after {0} seconds")]
    Timeout(u64),
}

/// A bind mount from the host into the container.
#[derive(Debug, Clone)]
pub struct Mount {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

/// Options for a one-shot container run. The container is always removed
/// on exit.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub image: String,
    pub command: Vec<String>,
    pub mounts: Vec<Mount>,
    pub env: Vec<(String, String)>,
    pub workdir: Option<String>,
}

/// Exit code and combined stdout/stderr of a container run.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub exit_code: i32,
    pub output: String,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Handle on the container runtime.
#[derive(Debug, Clone)]
pub struct ContainerRunner {
    runtime: String,
    socket_path: String,
}

impl ContainerRunner {
    pub fn new(runtime: impl Into<String>, socket_path: impl Into<String>) -> Self {
        Self {
            runtime: runtime.into(),
            socket_path: socket_path.into(),
        }
    }

    fn base_command(&self) -> Command {
        let mut cmd = Command::new(&self.runtime);
        if !self.socket_path.is_empty() {
            cmd.arg("--url").arg(format!("unix://{}", self.socket_path));
        }
        cmd
    }

    /// Local image cache probe.
    pub async fn image_exists(&self, tag: &str) -> Result<bool, ContainerError> {
        let status = self
            .base_command()
            .args(["image", "exists", tag])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        Ok(status.success())
    }

    /// Idempotent fetch; no-op if the image is already present.
    pub async fn pull(&self, tag: &str) -> Result<(), ContainerError> {
        if self.image_exists(tag).await? {
            return Ok(());
        }

        debug!("Pulling image {}", tag);
        let output = self
            .base_command()
            .args(["pull", tag])
            .output()
            .await?;

        if !output.status.success() {
            return Err(ContainerError::Command {
                command: format!("pull {tag}"),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    /// Run a one-shot container under a deadline.
    ///
    /// On deadline the child is killed and [`ContainerError::Timeout`] is
    /// returned. A non-zero container exit is not an error at this layer;
    /// the caller inspects the exit code.
    pub async fn run(&self, opts: &RunOptions, timeout: Duration) -> Result<RunOutput, ContainerError> {
        let mut cmd = self.base_command();
        cmd.args(["run", "--rm"]);

        for mount in &opts.mounts {
            let mut spec = format!("{}:{}", mount.source.display(), mount.target);
            if mount.read_only {
                spec.push_str(":ro");
            }
            cmd.arg("-v").arg(spec);
        }

        for (key, value) in &opts.env {
            cmd.arg("-e").arg(format!("{key}={value}"));
        }

        if let Some(workdir) = &opts.workdir {
            cmd.arg("-w").arg(workdir);
        }

        cmd.arg(&opts.image);
        cmd.args(&opts.command);

        debug!("Running container: {} {:?}", opts.image, opts.command);

        let child = cmd
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the wait future on timeout must not leak the
            // container process.
            .kill_on_drop(true)
            .spawn()?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => return Err(ContainerError::Timeout(timeout.as_secs())),
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(RunOutput {
            exit_code: output.status.code().unwrap_or(-1),
            output: combined,
        })
    }
}

/// Full ImageBuilder image tag for a version and `target/subtarget`.
/// Returns None when the target is malformed.
pub fn imagebuilder_tag(registry: &str, version: &str, target: &str) -> Option<String> {
    let mut parts = target.split('/');
    let (target, subtarget) = (parts.next()?, parts.next()?);
    if parts.next().is_some() || target.is_empty() || subtarget.is_empty() {
        return None;
    }
    Some(format!("{registry}:{version}-{target}-{subtarget}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_imagebuilder_tag_format() {
        assert_eq!(
            imagebuilder_tag("ghcr.io/openwrt/imagebuilder", "23.05.0", "ath79/generic").as_deref(),
            Some("ghcr.io/openwrt/imagebuilder:23.05.0-ath79-generic")
        );
    }

    #[test]
    fn test_imagebuilder_tag_rejects_bad_target() {
        assert_eq!(imagebuilder_tag("reg", "23.05.0", "ath79"), None);
        assert_eq!(imagebuilder_tag("reg", "23.05.0", "ath79/generic/extra"), None);
        assert_eq!(imagebuilder_tag("reg", "23.05.0", "ath79/"), None);
    }
}
