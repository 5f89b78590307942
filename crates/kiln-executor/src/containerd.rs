//! containerd image operations through the `nerdctl` CLI.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use kiln_core::{Error, EventLogger, EventStatus, ImageOps, RegistryAuth, Result};

/// Runs image operations with `nerdctl` against a containerd namespace.
pub struct NerdctlImageOps {
    binary: String,
    namespace: String,
}

impl Default for NerdctlImageOps {
    fn default() -> Self {
        Self::new("nerdctl", "k8s.io")
    }
}

impl NerdctlImageOps {
    pub fn new(binary: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            namespace: namespace.into(),
        }
    }

    /// Arguments for `subcommand`, scoped to the configured namespace.
    fn args(&self, subcommand: &[&str]) -> Vec<String> {
        let mut args = vec!["--namespace".to_string(), self.namespace.clone()];
        args.extend(subcommand.iter().map(|s| s.to_string()));
        args
    }

    async fn exec(&self, args: Vec<String>, stdin: Option<&str>, timeout: Duration) -> Result<String> {
        debug!(binary = %self.binary, args = ?redact_args(&args), "Running image command");
        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Internal(format!("spawn {}: {}", self.binary, e)))?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes())
                .await
                .map_err(|e| Error::Internal(format!("write stdin: {}", e)))?;
        }

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                let op = args.get(2).map(String::as_str).unwrap_or_default();
                Error::Timeout(format!("{} {} timed out after {:?}", self.binary, op, timeout))
            })?
            .map_err(|e| Error::Internal(format!("wait {}: {}", self.binary, e)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(Error::ExecutionFailed(format!(
                "{} failed: {}",
                args.get(2).map(String::as_str).unwrap_or(&self.binary),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    async fn login(&self, auth: &RegistryAuth, timeout: Duration) -> Result<()> {
        let args = self.args(&[
            "login",
            "--username",
            auth.username.as_str(),
            "--password-stdin",
            auth.server.as_str(),
        ]);
        self.exec(args, Some(&auth.password), timeout).await.map(|_| ())
    }
}

/// Arguments safe to log.
fn redact_args(args: &[String]) -> Vec<&str> {
    let mut out = Vec::with_capacity(args.len());
    let mut hide_next = false;
    for arg in args {
        if hide_next {
            out.push("[REDACTED]");
            hide_next = false;
            continue;
        }
        hide_next = arg == "--password";
        out.push(arg.as_str());
    }
    out
}

#[async_trait]
impl ImageOps for NerdctlImageOps {
    fn runtime(&self) -> &'static str {
        "containerd"
    }

    async fn pull(
        &self,
        image: &str,
        auth: Option<&RegistryAuth>,
        logger: &EventLogger,
        timeout: Duration,
    ) -> Result<()> {
        logger.info(format!("Pulling image {}", image), "pull-image", EventStatus::Running);
        if let Some(auth) = auth {
            self.login(auth, timeout).await?;
        }
        self.exec(self.args(&["pull", image]), None, timeout).await?;
        Ok(())
    }

    async fn push(
        &self,
        image: &str,
        auth: Option<&RegistryAuth>,
        logger: &EventLogger,
        timeout: Duration,
    ) -> Result<()> {
        logger.info(format!("Pushing image {}", image), "push-image", EventStatus::Running);
        if let Some(auth) = auth {
            self.login(auth, timeout).await?;
        }
        self.exec(self.args(&["push", image]), None, timeout).await?;
        Ok(())
    }

    async fn tag(
        &self,
        source: &str,
        target: &str,
        logger: &EventLogger,
        timeout: Duration,
    ) -> Result<()> {
        logger.debug(format!("Tagging {} as {}", source, target), "tag-image");
        self.exec(self.args(&["tag", source, target]), None, timeout).await?;
        Ok(())
    }

    async fn remove(&self, image: &str, logger: &EventLogger, timeout: Duration) -> Result<()> {
        logger.debug(format!("Removing image {}", image), "remove-image");
        match self.exec(self.args(&["rmi", "--force", image]), None, timeout).await {
            Ok(_) => Ok(()),
            Err(Error::ExecutionFailed(msg)) if msg.contains("not found") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn save(
        &self,
        image: &str,
        dest: &Path,
        logger: &EventLogger,
        timeout: Duration,
    ) -> Result<()> {
        logger.info(
            format!("Saving image {} to {}", image, dest.display()),
            "save-image",
            EventStatus::Running,
        );
        let dest = dest.to_string_lossy();
        self.exec(self.args(&["save", "--output", dest.as_ref(), image]), None, timeout)
            .await?;
        Ok(())
    }

    async fn load(&self, src: &Path, logger: &EventLogger, timeout: Duration) -> Result<()> {
        logger.info(
            format!("Loading images from {}", src.display()),
            "load-image",
            EventStatus::Running,
        );
        let src = src.to_string_lossy();
        self.exec(self.args(&["load", "--input", src.as_ref()]), None, timeout).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_are_namespaced() {
        let ops = NerdctlImageOps::default();
        assert_eq!(
            ops.args(&["pull", "alpine:3"]),
            vec!["--namespace", "k8s.io", "pull", "alpine:3"]
        );
        assert_eq!(ops.runtime(), "containerd");
    }

    #[test]
    fn test_redact_args() {
        let args: Vec<String> = ["login", "--password", "hunter2", "reg"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(redact_args(&args), vec!["login", "--password", "[REDACTED]", "reg"]);
    }

    #[tokio::test]
    async fn test_failed_command_maps_to_execution_failed() {
        // `false` ignores its arguments and exits 1.
        let ops = NerdctlImageOps::new("false", "default");
        let err = ops
            .exec(ops.args(&["pull", "x"]), None, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ExecutionFailed(_)));
    }

    #[tokio::test]
    async fn test_missing_binary_is_internal() {
        let ops = NerdctlImageOps::new("/nonexistent/nerdctl", "default");
        let err = ops
            .exec(ops.args(&["pull", "x"]), None, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }
}
