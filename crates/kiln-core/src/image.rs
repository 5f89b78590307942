//! Image operations contract.
//!
//! Implemented by container runtimes (Docker daemon, containerd). Every
//! operation takes the event logger of the task it runs for and a timeout.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::{EventLogger, Result};

/// Credentials for a registry.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
    /// Registry host the credentials apply to.
    pub server: String,
}

impl std::fmt::Debug for RegistryAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryAuth")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("server", &self.server)
            .finish()
    }
}

impl RegistryAuth {
    /// Credentials for the registry that hosts `image`, if a username is set.
    pub fn for_image(username: Option<&str>, password: Option<&str>, image: &str) -> Option<Self> {
        let username = username.filter(|u| !u.is_empty())?;
        Some(Self {
            username: username.to_string(),
            password: password.unwrap_or_default().to_string(),
            server: ImageRef::parse(image).registry().unwrap_or("docker.io").to_string(),
        })
    }
}

/// A parsed image reference: `repository[:tag]` or `repository@digest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub repository: String,
    pub tag: String,
}

impl ImageRef {
    pub fn parse(reference: &str) -> Self {
        let reference = reference.trim();
        if let Some((repo, digest)) = reference.split_once('@') {
            return Self {
                repository: repo.to_string(),
                tag: digest.to_string(),
            };
        }
        // A colon after the last slash separates the tag; a colon before it
        // belongs to a registry port.
        let last_slash = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
        match reference[last_slash..].rfind(':') {
            Some(idx) => {
                let split = last_slash + idx;
                Self {
                    repository: reference[..split].to_string(),
                    tag: reference[split + 1..].to_string(),
                }
            }
            None => Self {
                repository: reference.to_string(),
                tag: "latest".to_string(),
            },
        }
    }

    /// Registry host if the first path component looks like one.
    pub fn registry(&self) -> Option<&str> {
        let (first, _) = self.repository.split_once('/')?;
        if first.contains('.') || first.contains(':') || first == "localhost" {
            Some(first)
        } else {
            None
        }
    }

    /// Last path component of the repository, without registry or namespace.
    pub fn name(&self) -> &str {
        self.repository
            .rsplit('/')
            .next()
            .unwrap_or(&self.repository)
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.tag.contains(':') {
            write!(f, "{}@{}", self.repository, self.tag)
        } else {
            write!(f, "{}:{}", self.repository, self.tag)
        }
    }
}

/// Trait for container image runtimes.
#[async_trait]
pub trait ImageOps: Send + Sync {
    /// Name of this runtime.
    fn runtime(&self) -> &'static str;

    async fn pull(
        &self,
        image: &str,
        auth: Option<&RegistryAuth>,
        logger: &EventLogger,
        timeout: Duration,
    ) -> Result<()>;

    async fn push(
        &self,
        image: &str,
        auth: Option<&RegistryAuth>,
        logger: &EventLogger,
        timeout: Duration,
    ) -> Result<()>;

    async fn tag(
        &self,
        source: &str,
        target: &str,
        logger: &EventLogger,
        timeout: Duration,
    ) -> Result<()>;

    async fn remove(&self, image: &str, logger: &EventLogger, timeout: Duration) -> Result<()>;

    /// Export an image to a tarball.
    async fn save(
        &self,
        image: &str,
        dest: &Path,
        logger: &EventLogger,
        timeout: Duration,
    ) -> Result<()>;

    /// Import images from a tarball.
    async fn load(&self, src: &Path, logger: &EventLogger, timeout: Duration) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_image() {
        let r = ImageRef::parse("nginx");
        assert_eq!(r.repository, "nginx");
        assert_eq!(r.tag, "latest");
        assert_eq!(r.registry(), None);
    }

    #[test]
    fn test_parse_registry_with_port() {
        let r = ImageRef::parse("registry.local:5000/team/app:v2");
        assert_eq!(r.repository, "registry.local:5000/team/app");
        assert_eq!(r.tag, "v2");
        assert_eq!(r.registry(), Some("registry.local:5000"));
        assert_eq!(r.name(), "app");
        assert_eq!(r.to_string(), "registry.local:5000/team/app:v2");
    }

    #[test]
    fn test_parse_port_without_tag() {
        let r = ImageRef::parse("localhost:5000/app");
        assert_eq!(r.repository, "localhost:5000/app");
        assert_eq!(r.tag, "latest");
    }

    #[test]
    fn test_parse_digest() {
        let r = ImageRef::parse("alpine@sha256:abcd");
        assert_eq!(r.repository, "alpine");
        assert_eq!(r.tag, "sha256:abcd");
        assert_eq!(r.to_string(), "alpine@sha256:abcd");
    }

    #[test]
    fn test_auth_for_image() {
        let auth = RegistryAuth::for_image(Some("u"), Some("p"), "quay.io/org/app:1").unwrap();
        assert_eq!(auth.server, "quay.io");
        assert!(RegistryAuth::for_image(Some(""), Some("p"), "nginx").is_none());
        assert!(RegistryAuth::for_image(None, None, "nginx").is_none());
        assert!(!format!("{:?}", auth).contains("\"p\""));
    }
}
