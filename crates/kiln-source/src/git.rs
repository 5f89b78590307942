//! Git fetching.
//!
//! An existing clone of a branch is updated with a pull. Tags and `no_cache`
//! requests always start from a clean, full clone. Fresh branch clones are
//! shallow, single-branch and tagless.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use kiln_core::Commit;
use tracing::{info, warn};
use url::Url;

use crate::fetcher::{remove_dir_if_exists, FetchOptions, FetchSettings};
use crate::{CommandRunner, CommandSpec, FetchError, RepositoryInfo};

/// Shared key used when a tenant has none, or its key is rejected.
const SHARED_SSH_KEY: &str = "builder_rsa";
const REDACTED: &str = "[REDACTED]";
/// Field separator of the `git log` format.
const FIELD_SEP: char = '\u{1f}';

/// Private key chosen for an SSH remote.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SshKey {
    Tenant(PathBuf),
    Shared(PathBuf),
    None,
}

impl SshKey {
    fn path(&self) -> Option<&Path> {
        match self {
            SshKey::Tenant(p) | SshKey::Shared(p) => Some(p),
            SshKey::None => None,
        }
    }
}

pub struct GitFetcher {
    settings: FetchSettings,
    runner: Arc<dyn CommandRunner>,
}

impl GitFetcher {
    pub fn new(settings: FetchSettings, runner: Arc<dyn CommandRunner>) -> Self {
        Self { settings, runner }
    }

    pub async fn fetch(
        &self,
        repo: &RepositoryInfo,
        opts: &FetchOptions,
    ) -> Result<Commit, FetchError> {
        let dest = &repo.cache_root;
        let clean = opts.no_cache || repo.branch.is_tag();

        if !clean && tokio::fs::try_exists(dest.join(".git")).await.unwrap_or(false) {
            let key = self.ssh_key(repo, &opts.tenant_id).await;
            match self.pull(repo, opts, key.path()).await {
                Ok(()) => {
                    info!(path = %dest.display(), "Updated existing clone");
                    return self.head_commit(dest).await;
                }
                Err(e) => {
                    warn!(path = %dest.display(), error = %e, "Pull failed, cloning again");
                }
            }
        }

        remove_dir_if_exists(dest).await?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.clone_with_fallback(repo, opts, !clean).await?;
        info!(path = %dest.display(), shallow = !clean, "Cloned repository");
        self.head_commit(dest).await
    }

    /// Clone, retrying once with the shared key when the tenant key is
    /// rejected.
    async fn clone_with_fallback(
        &self,
        repo: &RepositoryInfo,
        opts: &FetchOptions,
        shallow: bool,
    ) -> Result<(), FetchError> {
        let key = self.ssh_key(repo, &opts.tenant_id).await;
        match self.clone_repo(repo, opts, key.path(), shallow).await {
            Err(FetchError::SshAuthFailed(msg)) if matches!(key, SshKey::Tenant(_)) => {
                let shared = self.settings.ssh_key_dir.join(SHARED_SSH_KEY);
                if !tokio::fs::try_exists(&shared).await.unwrap_or(false) {
                    return Err(FetchError::SshAuthFailed(msg));
                }
                warn!(
                    tenant_id = %opts.tenant_id,
                    "Tenant SSH key rejected, retrying clone with shared key"
                );
                remove_dir_if_exists(&repo.cache_root).await?;
                self.clone_repo(repo, opts, Some(&shared), shallow).await
            }
            other => other,
        }
    }

    async fn clone_repo(
        &self,
        repo: &RepositoryInfo,
        opts: &FetchOptions,
        key: Option<&Path>,
        shallow: bool,
    ) -> Result<(), FetchError> {
        let (remote, secrets) = self.remote_url(repo, opts)?;

        let mut spec = self.base_command(repo, key).arg("clone");
        if shallow {
            spec = spec.args(["--depth", "1", "--single-branch", "--no-tags"]);
        }
        spec = spec
            .args(["--branch", repo.branch.name()])
            .arg(remote)
            .arg(repo.cache_root.to_string_lossy());

        let output = self.runner.run(&spec).await?;
        if output.success() {
            Ok(())
        } else {
            Err(classify_git_error(&redact(&output.stderr, &secrets), repo))
        }
    }

    async fn pull(
        &self,
        repo: &RepositoryInfo,
        opts: &FetchOptions,
        key: Option<&Path>,
    ) -> Result<(), FetchError> {
        let secrets = secrets(opts);
        let spec = self
            .base_command(repo, key)
            .args(["pull", "--ff-only", "origin", repo.branch.name()])
            .cwd(&repo.cache_root);

        let output = self.runner.run(&spec).await?;
        if output.success() {
            Ok(())
        } else {
            Err(classify_git_error(&redact(&output.stderr, &secrets), repo))
        }
    }

    /// Metadata of the checked out revision.
    async fn head_commit(&self, dir: &Path) -> Result<Commit, FetchError> {
        let spec = CommandSpec::new("git", self.settings.timeout)
            .args(["log", "-1", "--format=%H%x1f%an%x1f%s"])
            .cwd(dir);
        let output = self.runner.run(&spec).await?;
        if !output.success() {
            return Err(FetchError::Command(format!(
                "reading commit metadata failed: {}",
                output.stderr.trim()
            )));
        }
        parse_commit(&output.stdout)
            .ok_or_else(|| FetchError::Command("unexpected git log output".to_string()))
    }

    /// `git` with prompts disabled, the proxy for the proxied host and the
    /// SSH key, if any.
    fn base_command(&self, repo: &RepositoryInfo, key: Option<&Path>) -> CommandSpec {
        let mut spec = CommandSpec::new("git", self.settings.timeout).env("GIT_TERMINAL_PROMPT", "0");
        if let Some(proxy) = self.proxy_for(&repo.url) {
            spec = spec.args(["-c".to_string(), format!("http.proxy={}", proxy)]);
        }
        if let Some(key) = key {
            spec = spec.env("GIT_SSH_COMMAND", ssh_command(key));
        }
        spec
    }

    fn proxy_for(&self, remote: &str) -> Option<&str> {
        let proxy = self.settings.proxy.as_deref()?;
        let parsed = Url::parse(remote).ok()?;
        let proxied = matches!(parsed.scheme(), "http" | "https")
            && parsed.host_str() == Some(self.settings.proxy_host.as_str());
        proxied.then_some(proxy)
    }

    /// Remote URL with basic-auth credentials applied, and the strings to
    /// redact from any output.
    fn remote_url(
        &self,
        repo: &RepositoryInfo,
        opts: &FetchOptions,
    ) -> Result<(String, Vec<String>), FetchError> {
        let Some(creds) = &opts.credentials else {
            return Ok((repo.url.clone(), Vec::new()));
        };
        if !(repo.url.starts_with("https://") || repo.url.starts_with("http://")) {
            return Ok((repo.url.clone(), Vec::new()));
        }

        let mut parsed =
            Url::parse(&repo.url).map_err(|e| FetchError::InvalidUrl(e.to_string()))?;
        parsed
            .set_username(&creds.username)
            .map_err(|_| FetchError::InvalidUrl("cannot carry credentials".to_string()))?;
        parsed
            .set_password(Some(&creds.password))
            .map_err(|_| FetchError::InvalidUrl("cannot carry credentials".to_string()))?;

        let mut redact = secrets(opts);
        if let Some(encoded) = parsed.password() {
            redact.push(encoded.to_string());
        }
        Ok((parsed.to_string(), redact))
    }

    async fn ssh_key(&self, repo: &RepositoryInfo, tenant_id: &str) -> SshKey {
        if !repo.is_ssh() {
            return SshKey::None;
        }
        let dir = &self.settings.ssh_key_dir;
        if !tenant_id.is_empty() {
            let tenant = dir.join(format!("{}_{}", SHARED_SSH_KEY, tenant_id));
            if tokio::fs::try_exists(&tenant).await.unwrap_or(false) {
                return SshKey::Tenant(tenant);
            }
        }
        let shared = dir.join(SHARED_SSH_KEY);
        if tokio::fs::try_exists(&shared).await.unwrap_or(false) {
            SshKey::Shared(shared)
        } else {
            SshKey::None
        }
    }
}

fn ssh_command(key: &Path) -> String {
    format!(
        "ssh -i {} -o IdentitiesOnly=yes -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null",
        key.display()
    )
}

fn secrets(opts: &FetchOptions) -> Vec<String> {
    opts.credentials
        .iter()
        .map(|c| c.password.clone())
        .filter(|p| !p.is_empty())
        .collect()
}

fn redact(text: &str, secrets: &[String]) -> String {
    secrets
        .iter()
        .filter(|s| !s.is_empty())
        .fold(text.to_string(), |acc, s| acc.replace(s.as_str(), REDACTED))
}

fn parse_commit(stdout: &str) -> Option<Commit> {
    let line = stdout.lines().find(|l| !l.trim().is_empty())?;
    let mut fields = line.splitn(3, FIELD_SEP);
    let hash = fields.next()?.trim();
    if hash.is_empty() {
        return None;
    }
    Some(Commit {
        hash: hash.to_string(),
        author: fields.next().unwrap_or_default().trim().to_string(),
        message: fields.next().unwrap_or_default().trim().to_string(),
    })
}

/// Map git's stderr to a fetch error category.
fn classify_git_error(stderr: &str, repo: &RepositoryInfo) -> FetchError {
    let lower = stderr.to_lowercase();
    let detail = stderr.trim().to_string();

    if lower.contains("permission denied (publickey")
        || lower.contains("host key verification failed")
        || lower.contains("no supported authentication methods")
    {
        FetchError::SshAuthFailed(detail)
    } else if lower.contains("cloned an empty repository")
        || lower.contains("remote repository is empty")
    {
        FetchError::EmptyRepository(repo.url.clone())
    } else if (lower.contains("remote branch") && lower.contains("not found"))
        || lower.contains("couldn't find remote ref")
    {
        FetchError::BranchNotFound(repo.branch.to_string())
    } else if lower.contains("authentication failed")
        || lower.contains("could not read username")
        || lower.contains("terminal prompts disabled")
        || lower.contains("401")
    {
        FetchError::AuthRequired(detail)
    } else if lower.contains("403")
        || lower.contains("access denied")
        || lower.contains("not authorized")
        || (lower.contains("permission to") && lower.contains("denied"))
    {
        FetchError::AuthorizationFailed(detail)
    } else if lower.contains("repository not found")
        || lower.contains("does not appear to be a git repository")
        || lower.contains("404")
    {
        FetchError::RepositoryNotFound(repo.url.clone())
    } else if lower.contains("timed out") || lower.contains("timeout") {
        FetchError::Timeout(detail)
    } else {
        FetchError::Command(detail)
    }
}
