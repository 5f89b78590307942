//! Language detection from marker files in a fetched tree.

use std::path::Path;

use kiln_core::Language;
use tracing::debug;

use crate::FetchError;

/// How deep to look for project files that may live below the root.
const MAX_PROJECT_DEPTH: usize = 3;

/// Detect the build language of `dir`.
///
/// Returns `Language::Unknown("")` when nothing matches, so backend lookup
/// falls back to the generic bundler.
pub async fn detect_language(dir: &Path) -> Result<Language, FetchError> {
    let names = file_names(dir).await?;
    let has = |name: &str| names.iter().any(|n| n == name);
    let has_ext = |ext: &str| names.iter().any(|n| n.ends_with(ext));

    let lang = if has("Dockerfile") {
        Language::Dockerfile
    } else if has_ext(".csproj") || has_ext(".sln") || find_project(dir, ".csproj", 0).await? {
        Language::NetCore
    } else if has("pom.xml") {
        Language::JavaMaven
    } else if has("build.gradle") || has("build.gradle.kts") {
        Language::Gradle
    } else if has_ext(".war") {
        Language::JavaWar
    } else if has_ext(".jar") {
        Language::JavaJar
    } else if has("go.mod") || has("Godeps") || has("glide.yaml") {
        Language::Golang
    } else if has("requirements.txt") || has("setup.py") || has("Pipfile") {
        Language::Python
    } else if has("composer.json") || has("index.php") {
        Language::Php
    } else if has("package.json") && has("nodestatic.json") {
        Language::NodeJsStatic
    } else if has("package.json") {
        Language::NodeJs
    } else if has("index.html") {
        Language::Static
    } else {
        Language::Unknown(String::new())
    };

    debug!(dir = %dir.display(), lang = %lang, "Detected language");
    Ok(lang)
}

async fn file_names(dir: &Path) -> Result<Vec<String>, FetchError> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    Ok(names)
}

/// Whether a file with `ext` exists below `dir`, skipping hidden and
/// dependency directories.
#[async_recursion::async_recursion]
async fn find_project(dir: &Path, ext: &str, depth: usize) -> Result<bool, FetchError> {
    if depth > MAX_PROJECT_DEPTH {
        return Ok(false);
    }
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();

        if entry.file_type().await?.is_dir() {
            if name.starts_with('.')
                || matches!(name.as_ref(), "node_modules" | "target" | "vendor" | "bin" | "obj")
            {
                continue;
            }
            if find_project(&path, ext, depth + 1).await? {
                return Ok(true);
            }
        } else if name.ends_with(ext) {
            return Ok(true);
        }
    }
    Ok(false)
}
