//! Repository resolution.
//!
//! Turns a repository reference into a [`RepositoryInfo`]: version control
//! kind, branch or tag, optional build subdirectory and a deterministic local
//! cache root.

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

use crate::FetchError;

/// Prefix marking a branch value as a tag reference.
const TAG_PREFIX: &str = "tag:";
const DIR_QUERY: &str = "?dir=";
const DEFAULT_BRANCH: &str = "master";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VcsKind {
    Git,
    Svn,
    /// Archive in object storage.
    Oss,
}

impl VcsKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VcsKind::Git => "git",
            VcsKind::Svn => "svn",
            VcsKind::Oss => "oss",
        }
    }
}

/// A branch head or an immutable tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BranchRef {
    Branch(String),
    Tag(String),
}

impl BranchRef {
    /// `tag:v1.2` resolves to a tag, anything else to a branch of that name.
    /// An empty value is the default branch.
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        match value.strip_prefix(TAG_PREFIX) {
            Some(tag) => BranchRef::Tag(tag.trim().to_string()),
            None if value.is_empty() => BranchRef::Branch(DEFAULT_BRANCH.to_string()),
            None => BranchRef::Branch(value.to_string()),
        }
    }

    /// Short name without the `tag:` marker.
    pub fn name(&self) -> &str {
        match self {
            BranchRef::Branch(name) | BranchRef::Tag(name) => name,
        }
    }

    pub fn is_tag(&self) -> bool {
        matches!(self, BranchRef::Tag(_))
    }

    /// Fully qualified git reference.
    pub fn reference(&self) -> String {
        match self {
            BranchRef::Branch(name) => format!("refs/heads/{}", name),
            BranchRef::Tag(name) => format!("refs/tags/{}", name),
        }
    }
}

impl std::fmt::Display for BranchRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BranchRef::Branch(name) => f.write_str(name),
            BranchRef::Tag(name) => write!(f, "{}{}", TAG_PREFIX, name),
        }
    }
}

/// A resolved repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryInfo {
    /// Repository root URL, without any `?dir=` suffix.
    pub url: String,
    pub kind: VcsKind,
    pub branch: BranchRef,
    /// Local working directory the source is fetched into.
    pub cache_root: PathBuf,
    /// Build subdirectory relative to the repository root.
    pub build_subdir: Option<PathBuf>,
}

impl RepositoryInfo {
    /// Resolve a repository reference.
    ///
    /// `server_type` may be empty, in which case the kind is inferred from
    /// the URL.
    pub fn resolve(
        reference: &str,
        branch: &str,
        server_type: &str,
        tenant_id: &str,
        service_id: &str,
        source_dir: &Path,
    ) -> Result<Self, FetchError> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(FetchError::InvalidUrl("empty repository url".to_string()));
        }

        kiln_core::path_segment("tenant_id", tenant_id)
            .map_err(|e| FetchError::InvalidId(e.to_string()))?;

        let (url, build_subdir) = split_build_dir(reference)?;
        let kind = classify(&url, server_type)?;
        validate_url(&url, kind)?;

        let branch = BranchRef::parse(branch);
        let cache_root = cache_root(source_dir, tenant_id, &url, &branch, service_id);

        Ok(Self {
            url,
            kind,
            branch,
            cache_root,
            build_subdir,
        })
    }

    /// Directory the build runs in.
    pub fn build_dir(&self) -> PathBuf {
        match &self.build_subdir {
            Some(dir) => self.cache_root.join(dir),
            None => self.cache_root.clone(),
        }
    }

    /// Whether the remote is reached over SSH.
    pub fn is_ssh(&self) -> bool {
        self.url.starts_with("ssh://") || self.url.starts_with("git@")
    }
}

/// Deterministic cache root:
/// `{source_dir}/build/{tenant}/{md5(url, branch, service)}`.
pub fn cache_root(
    source_dir: &Path,
    tenant_id: &str,
    url: &str,
    branch: &BranchRef,
    service_id: &str,
) -> PathBuf {
    // NUL separators keep ("ab", "c") and ("a", "bc") apart.
    let key = format!("{}\0{}\0{}", url, branch, service_id);
    let hash = format!("{:x}", md5::compute(key.as_bytes()));
    source_dir.join("build").join(tenant_id).join(hash)
}

fn split_build_dir(reference: &str) -> Result<(String, Option<PathBuf>), FetchError> {
    let Some((url, dir)) = reference.split_once(DIR_QUERY) else {
        return Ok((reference.to_string(), None));
    };
    let dir = dir.trim().trim_matches('/');
    if dir.is_empty() {
        return Ok((url.to_string(), None));
    }
    let path = PathBuf::from(dir);
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(FetchError::InvalidUrl(format!(
            "build directory must stay inside the repository: {}",
            dir
        )));
    }
    Ok((url.to_string(), Some(path)))
}

fn classify(url: &str, server_type: &str) -> Result<VcsKind, FetchError> {
    match server_type.trim().to_lowercase().as_str() {
        "git" => Ok(VcsKind::Git),
        "svn" => Ok(VcsKind::Svn),
        "oss" => Ok(VcsKind::Oss),
        "" => {
            let lower = url.to_lowercase();
            if lower.starts_with("svn://") || lower.starts_with("svn+ssh://") {
                Ok(VcsKind::Svn)
            } else if is_archive(&lower) {
                Ok(VcsKind::Oss)
            } else {
                Ok(VcsKind::Git)
            }
        }
        other => Err(FetchError::Unsupported(format!(
            "unknown server type: {}",
            other
        ))),
    }
}

pub(crate) fn is_archive(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    [".tar.gz", ".tgz", ".tar", ".zip"]
        .iter()
        .any(|ext| path.ends_with(ext))
}

fn validate_url(url: &str, kind: VcsKind) -> Result<(), FetchError> {
    let allowed: &[&str] = match kind {
        VcsKind::Git => &["http://", "https://", "ssh://", "git://", "git@", "file://"],
        VcsKind::Svn => &["svn://", "svn+ssh://", "http://", "https://", "file://"],
        VcsKind::Oss => &["http://", "https://"],
    };
    if allowed.iter().any(|p| url.starts_with(p)) {
        Ok(())
    } else {
        Err(FetchError::InvalidUrl(format!(
            "unsupported {} url: {}",
            kind.as_str(),
            url
        )))
    }
}
