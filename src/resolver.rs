//! Host to application-root resolution
//!
//! Hostnames map to directories under the configured apps root. For a host
//! `a.b.dev` with domain `dev` the resolver probes `a.b`, then `b`, then
//! `default`; the first entry that exists (symlinks followed) wins. Hosts
//! outside the configured domain are probed verbatim, so `localhost` can be
//! symlinked too.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

/// The host resolver failed to answer (distinct from "no root configured").
#[derive(Debug, Clone, thiserror::Error)]
#[error("failed to resolve host {host}: {message}")]
pub struct ResolverError {
    pub host: String,
    pub message: String,
}

/// Maps a hostname to an application root directory.
#[async_trait]
pub trait RootResolver: Send + Sync {
    /// Returns the application root for `host`, or `None` when the host is
    /// not configured.
    async fn resolve(&self, host: &str) -> Result<Option<PathBuf>, ResolverError>;
}

/// Filesystem-backed resolver probing symlinks under the apps root.
pub struct SymlinkResolver {
    root: PathBuf,
    domain: String,
}

impl SymlinkResolver {
    pub fn new(root: PathBuf, domain: impl Into<String>) -> Self {
        Self {
            root,
            domain: domain.into(),
        }
    }

    /// Candidate entry names for a host, most specific first.
    fn candidates(&self, host: &str) -> Vec<String> {
        let mut names = Vec::new();
        let suffix = format!(".{}", self.domain);

        if let Some(prefix) = host.strip_suffix(suffix.as_str()) {
            let mut rest = prefix;
            loop {
                names.push(rest.to_string());
                match rest.split_once('.') {
                    Some((_, shorter)) => rest = shorter,
                    None => break,
                }
            }
        } else if host != self.domain {
            names.push(host.to_string());
        }

        names.push("default".to_string());
        names
    }
}

#[async_trait]
impl RootResolver for SymlinkResolver {
    async fn resolve(&self, host: &str) -> Result<Option<PathBuf>, ResolverError> {
        let failure = |path: &Path, e: std::io::Error| ResolverError {
            host: host.to_string(),
            message: format!("{}: {}", path.display(), e),
        };

        for name in self.candidates(host) {
            let entry = self.root.join(&name);
            match tokio::fs::metadata(&entry).await {
                Ok(meta) if meta.is_dir() => {
                    let root = tokio::fs::canonicalize(&entry)
                        .await
                        .map_err(|e| failure(&entry, e))?;
                    debug!(host, entry = %entry.display(), root = %root.display(), "Resolved host");
                    return Ok(Some(root));
                }
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(failure(&entry, e)),
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(dir: &tempfile::TempDir) -> SymlinkResolver {
        SymlinkResolver::new(dir.path().to_path_buf(), "dev")
    }

    #[test]
    fn test_candidate_order() {
        let dir = tempfile::tempdir().unwrap();
        let r = resolver(&dir);
        assert_eq!(r.candidates("foo.dev"), vec!["foo", "default"]);
        assert_eq!(
            r.candidates("api.shop.dev"),
            vec!["api.shop", "shop", "default"]
        );
        assert_eq!(r.candidates("localhost"), vec!["localhost", "default"]);
        assert_eq!(r.candidates("dev"), vec!["default"]);
    }

    #[tokio::test]
    async fn test_resolve_direct_entry() {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("foo");
        std::fs::create_dir(&app).unwrap();

        let root = resolver(&dir).resolve("foo.dev").await.unwrap().unwrap();
        assert_eq!(root, app.canonicalize().unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_resolve_follows_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("real-app");
        std::fs::create_dir(&target).unwrap();
        std::os::unix::fs::symlink(&target, dir.path().join("shop")).unwrap();

        let root = resolver(&dir).resolve("shop.dev").await.unwrap().unwrap();
        assert_eq!(root, target.canonicalize().unwrap());
    }

    #[tokio::test]
    async fn test_resolve_walks_subdomains() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("shop")).unwrap();

        let root = resolver(&dir)
            .resolve("admin.shop.dev")
            .await
            .unwrap()
            .unwrap();
        assert!(root.ends_with("shop"));
    }

    #[tokio::test]
    async fn test_resolve_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("default")).unwrap();

        let root = resolver(&dir).resolve("anything.dev").await.unwrap().unwrap();
        assert!(root.ends_with("default"));
    }

    #[tokio::test]
    async fn test_resolve_unknown_host_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(resolver(&dir).resolve("ghost.dev").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resolve_skips_plain_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("flat"), b"not a dir").unwrap();
        assert!(resolver(&dir).resolve("flat.dev").await.unwrap().is_none());
    }
}
