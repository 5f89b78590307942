//! Subversion fetching: checkout or update, then read the last log entry.

use std::sync::Arc;

use kiln_core::Commit;
use tracing::info;

use crate::fetcher::{FetchOptions, FetchSettings, remove_dir_if_exists};
use crate::{BranchRef, CommandRunner, CommandSpec, FetchError, RepositoryInfo};

pub struct SvnFetcher {
    settings: FetchSettings,
    runner: Arc<dyn CommandRunner>,
}

impl SvnFetcher {
    pub fn new(settings: FetchSettings, runner: Arc<dyn CommandRunner>) -> Self {
        Self { settings, runner }
    }

    pub async fn fetch(
        &self,
        repo: &RepositoryInfo,
        opts: &FetchOptions,
    ) -> Result<Commit, FetchError> {
        let dest = &repo.cache_root;
        let working_copy = tokio::fs::try_exists(dest.join(".svn")).await.unwrap_or(false);

        if working_copy && !opts.no_cache {
            let spec = self.command(opts).arg("update").cwd(dest);
            self.run(&spec, repo, opts).await?;
            info!(path = %dest.display(), "Updated working copy");
        } else {
            remove_dir_if_exists(dest).await?;
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let spec = self
                .command(opts)
                .arg("checkout")
                .arg(branch_url(&repo.url, &repo.branch))
                .arg(dest.to_string_lossy());
            self.run(&spec, repo, opts).await?;
            info!(path = %dest.display(), "Checked out working copy");
        }

        let spec = self.command(opts).args(["log", "-l", "1"]).cwd(dest);
        let output = self.run(&spec, repo, opts).await?;
        parse_log(&output)
            .ok_or_else(|| FetchError::Command("unexpected svn log output".to_string()))
    }

    fn command(&self, opts: &FetchOptions) -> CommandSpec {
        let mut spec = CommandSpec::new("svn", self.settings.timeout)
            .args(["--non-interactive", "--trust-server-cert", "--no-auth-cache"]);
        if let Some(creds) = &opts.credentials {
            spec = spec
                .args(["--username", creds.username.as_str()])
                .args(["--password", creds.password.as_str()]);
        }
        spec
    }

    async fn run(
        &self,
        spec: &CommandSpec,
        repo: &RepositoryInfo,
        opts: &FetchOptions,
    ) -> Result<String, FetchError> {
        let output = self.runner.run(spec).await?;
        if output.success() {
            return Ok(output.stdout);
        }
        let mut stderr = output.stderr;
        if let Some(creds) = &opts.credentials {
            if !creds.password.is_empty() {
                stderr = stderr.replace(&creds.password, "[REDACTED]");
            }
        }
        Err(classify_svn_error(&stderr, repo))
    }
}

/// Map a branch onto the standard trunk/branches/tags layout, unless the URL
/// already points into it.
fn branch_url(url: &str, branch: &BranchRef) -> String {
    let base = url.trim_end_matches('/');
    let in_layout = ["/trunk", "/branches/", "/tags/"]
        .iter()
        .any(|seg| base.contains(seg) || base.ends_with(seg.trim_end_matches('/')));
    if in_layout {
        return base.to_string();
    }
    match branch {
        BranchRef::Tag(name) => format!("{}/tags/{}", base, name),
        BranchRef::Branch(name) if name == "trunk" || name == "master" => {
            format!("{}/trunk", base)
        }
        BranchRef::Branch(name) => format!("{}/branches/{}", base, name),
    }
}

/// Parse the entry of `svn log -l 1`:
///
/// ```text
/// ------------------------------------------------------------------------
/// r42 | alice | 2024-01-01 10:00:00 +0000 (Mon, 01 Jan 2024) | 1 line
///
/// Fix the build
/// ------------------------------------------------------------------------
/// ```
fn parse_log(stdout: &str) -> Option<Commit> {
    let mut lines = stdout.lines().skip_while(|l| !l.starts_with('r'));
    let header = lines.next()?;
    let mut fields = header.split(" | ");
    let revision = fields.next()?.trim();
    let author = fields.next().unwrap_or_default().trim();
    let message = lines
        .take_while(|l| !l.starts_with("-----"))
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    Some(Commit {
        hash: revision.to_string(),
        author: author.to_string(),
        message,
    })
}

fn classify_svn_error(stderr: &str, repo: &RepositoryInfo) -> FetchError {
    let lower = stderr.to_lowercase();
    let detail = stderr.trim().to_string();
    if lower.contains("authentication failed") || lower.contains("authorization failed") {
        FetchError::AuthRequired(detail)
    } else if lower.contains("403") || lower.contains("forbidden") {
        FetchError::AuthorizationFailed(detail)
    } else if lower.contains("path not found") || lower.contains("doesn't exist") {
        if repo.branch.name() == "trunk" || repo.branch.name() == "master" {
            FetchError::RepositoryNotFound(repo.url.clone())
        } else {
            FetchError::BranchNotFound(repo.branch.to_string())
        }
    } else if lower.contains("timed out") {
        FetchError::Timeout(detail)
    } else {
        FetchError::Command(detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::Credentials;
    use crate::runner::fake::ScriptedRunner;
    use crate::CommandOutput;
    use std::path::Path;
    use std::time::Duration;

    const LOG: &str = "------------------------------------------------------------------------
r42 | alice | 2024-01-01 10:00:00 +0000 (Mon, 01 Jan 2024) | 1 line

Fix the build
------------------------------------------------------------------------
";

    fn svn_sub(spec: &CommandSpec) -> Option<&str> {
        spec.args
            .iter()
            .map(String::as_str)
            .find(|a| matches!(*a, "checkout" | "update" | "log"))
    }

    #[test]
    fn test_branch_url_layout() {
        let url = "svn://svn.example.com/app";
        assert_eq!(branch_url(url, &BranchRef::parse("")), "svn://svn.example.com/app/trunk");
        assert_eq!(
            branch_url(url, &BranchRef::parse("release")),
            "svn://svn.example.com/app/branches/release"
        );
        assert_eq!(
            branch_url(url, &BranchRef::parse("tag:1.0")),
            "svn://svn.example.com/app/tags/1.0"
        );
        assert_eq!(
            branch_url("svn://svn.example.com/app/trunk/", &BranchRef::parse("x")),
            "svn://svn.example.com/app/trunk"
        );
    }

    #[test]
    fn test_parse_log() {
        let commit = parse_log(LOG).unwrap();
        assert_eq!(commit.hash, "r42");
        assert_eq!(commit.author, "alice");
        assert_eq!(commit.message, "Fix the build");
        assert!(parse_log("").is_none());
    }

    #[tokio::test]
    async fn test_checkout_then_update() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = RepositoryInfo::resolve(
            "svn://svn.example.com/app",
            "",
            "svn",
            "t",
            "s",
            tmp.path(),
        )
        .unwrap();
        let runner = Arc::new(ScriptedRunner::new(|spec| match svn_sub(spec) {
            Some("log") => CommandOutput::ok(LOG),
            _ => CommandOutput::ok(""),
        }));
        let settings = FetchSettings {
            timeout: Duration::from_secs(5),
            ..Default::default()
        };
        let fetcher = SvnFetcher::new(settings, runner.clone());
        let opts = FetchOptions {
            credentials: Credentials::new(Some("alice"), Some("pw")),
            ..Default::default()
        };

        let commit = fetcher.fetch(&repo, &opts).await.unwrap();
        assert_eq!(commit.hash, "r42");
        let checkout = &runner.calls()[0];
        assert_eq!(svn_sub(checkout), Some("checkout"));
        assert!(checkout.has_arg("svn://svn.example.com/app/trunk"));
        assert!(checkout.has_arg("--non-interactive"));

        std::fs::create_dir_all(repo.cache_root.join(".svn")).unwrap();
        fetcher.fetch(&repo, &opts).await.unwrap();
        assert_eq!(svn_sub(&runner.calls()[2]), Some("update"));
    }

    #[test]
    fn test_classify_svn_error() {
        let repo = RepositoryInfo::resolve(
            "svn://svn.example.com/app",
            "feature",
            "svn",
            "t",
            "s",
            Path::new("/src"),
        )
        .unwrap();
        assert!(matches!(
            classify_svn_error("svn: E170013: Authentication failed", &repo),
            FetchError::AuthRequired(_)
        ));
        assert!(matches!(
            classify_svn_error("svn: E170000: URL doesn't exist", &repo),
            FetchError::BranchNotFound(_)
        ));
    }
}
