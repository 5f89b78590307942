//! Object storage archives: download and extract into the cache root.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use reqwest::StatusCode;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::fetcher::{FetchOptions, FetchSettings, redact_userinfo, remove_dir_if_exists};
use crate::{CommandRunner, CommandSpec, FetchError, RepositoryInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveFormat {
    TarGz,
    Tar,
    Zip,
}

impl ArchiveFormat {
    fn from_url(url: &str) -> Option<Self> {
        let path = url.split(['?', '#']).next().unwrap_or(url).to_lowercase();
        if path.ends_with(".tar.gz") || path.ends_with(".tgz") {
            Some(ArchiveFormat::TarGz)
        } else if path.ends_with(".tar") {
            Some(ArchiveFormat::Tar)
        } else if path.ends_with(".zip") {
            Some(ArchiveFormat::Zip)
        } else {
            None
        }
    }

    fn extract_command(&self, archive: &Path, dest: &Path, spec: CommandSpec) -> CommandSpec {
        let archive = archive.to_string_lossy().into_owned();
        let dest = dest.to_string_lossy().into_owned();
        match self {
            ArchiveFormat::TarGz => spec.args(["-xzf", archive.as_str(), "-C", dest.as_str()]),
            ArchiveFormat::Tar => spec.args(["-xf", archive.as_str(), "-C", dest.as_str()]),
            ArchiveFormat::Zip => spec.args(["-o", "-q", archive.as_str(), "-d", dest.as_str()]),
        }
    }

    fn program(&self) -> &'static str {
        match self {
            ArchiveFormat::TarGz | ArchiveFormat::Tar => "tar",
            ArchiveFormat::Zip => "unzip",
        }
    }
}

pub struct OssFetcher {
    settings: FetchSettings,
    runner: Arc<dyn CommandRunner>,
    client: reqwest::Client,
}

impl OssFetcher {
    pub fn new(settings: FetchSettings, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            settings,
            runner,
            client: reqwest::Client::new(),
        }
    }

    /// Archives are always fetched fresh; there is nothing to update.
    pub async fn fetch(&self, repo: &RepositoryInfo, opts: &FetchOptions) -> Result<(), FetchError> {
        let format = ArchiveFormat::from_url(&repo.url).ok_or_else(|| {
            FetchError::Unsupported(format!(
                "unknown archive format: {}",
                redact_userinfo(&repo.url)
            ))
        })?;

        let dest = &repo.cache_root;
        remove_dir_if_exists(dest).await?;
        tokio::fs::create_dir_all(dest).await?;

        let archive = archive_path(dest);
        self.download(&repo.url, &archive, opts).await?;

        let spec = format.extract_command(
            &archive,
            dest,
            CommandSpec::new(format.program(), self.settings.timeout),
        );
        let output = self.runner.run(&spec).await?;
        // The archive is inside the tree being built.
        remove_archive(&archive).await;
        if !output.success() {
            return Err(FetchError::Command(format!(
                "extracting archive failed: {}",
                output.stderr.trim()
            )));
        }
        info!(path = %dest.display(), "Extracted source archive");
        Ok(())
    }

    async fn download(&self, url: &str, dest: &Path, opts: &FetchOptions) -> Result<(), FetchError> {
        let mut request = self.client.get(url).timeout(self.settings.timeout);
        if let Some(creds) = &opts.credentials {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }
        let mut response = request.send().await?;

        match response.status() {
            s if s.is_success() => {}
            StatusCode::UNAUTHORIZED => {
                return Err(FetchError::AuthRequired(redact_userinfo(url)));
            }
            StatusCode::FORBIDDEN => {
                return Err(FetchError::AuthorizationFailed(redact_userinfo(url)));
            }
            StatusCode::NOT_FOUND => {
                return Err(FetchError::RepositoryNotFound(redact_userinfo(url)));
            }
            s => {
                return Err(FetchError::Download(format!(
                    "{} returned {}",
                    redact_userinfo(url),
                    s
                )));
            }
        }

        let mut file = tokio::fs::File::create(dest).await?;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(())
    }
}

fn archive_path(dest: &Path) -> PathBuf {
    dest.join(".kiln-source-archive")
}

/// Best effort: a leftover archive is logged, never fatal.
async fn remove_archive(archive: &Path) {
    match tokio::fs::remove_file(archive).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %archive.display(), error = %e, "Failed to remove source archive"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archive_format_from_url() {
        assert_eq!(
            ArchiveFormat::from_url("https://oss.example.com/a/app.TGZ?sig=1"),
            Some(ArchiveFormat::TarGz)
        );
        assert_eq!(
            ArchiveFormat::from_url("https://oss.example.com/app.tar"),
            Some(ArchiveFormat::Tar)
        );
        assert_eq!(
            ArchiveFormat::from_url("https://oss.example.com/app.zip"),
            Some(ArchiveFormat::Zip)
        );
        assert_eq!(ArchiveFormat::from_url("https://oss.example.com/app.rar"), None);
    }

    #[test]
    fn test_extract_commands() {
        let spec = ArchiveFormat::Zip.extract_command(
            Path::new("/c/a.zip"),
            Path::new("/c"),
            CommandSpec::new("unzip", std::time::Duration::from_secs(1)),
        );
        assert_eq!(spec.args, vec!["-o", "-q", "/c/a.zip", "-d", "/c"]);
    }

    #[tokio::test]
    async fn test_unknown_format_is_unsupported() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = RepositoryInfo::resolve(
            "https://oss.example.com/app.rar",
            "",
            "oss",
            "t",
            "s",
            tmp.path(),
        )
        .unwrap();
        let fetcher = OssFetcher::new(
            FetchSettings::default(),
            Arc::new(crate::ProcessRunner),
        );
        let err = fetcher.fetch(&repo, &FetchOptions::default()).await.unwrap_err();
        assert!(matches!(err, FetchError::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_archive_removal_is_best_effort() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = archive_path(tmp.path());
        std::fs::write(&archive, b"tar").unwrap();
        remove_archive(&archive).await;
        assert!(!archive.exists());

        // Gone already, or not a file: logged and skipped.
        remove_archive(&archive).await;
        let dir = tmp.path().join("not-a-file");
        std::fs::create_dir(&dir).unwrap();
        remove_archive(&dir).await;
        assert!(dir.is_dir());
    }
}
