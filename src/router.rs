//! Host routing and per-root caches
//!
//! The router resolves hostnames to application roots and owns the
//! process-wide caches: at most one [`Application`] per root, and one
//! memoised static handler per root. A root stops being a rack app the
//! moment its `config.ru` disappears; the cached application is then dropped
//! and its pool quit in the background.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::app::Application;
use crate::config::Config;
use crate::files::StaticDir;
use crate::pool::PoolFactory;
use crate::resolver::{ResolverError, RootResolver};

/// Normalize a Host header value: strip any `:port` suffix, lowercase.
pub fn host_name(host: &str) -> String {
    host.split(':').next().unwrap_or(host).to_ascii_lowercase()
}

/// Routes hosts to roots and caches per-root state.
pub struct HostRouter {
    config: Arc<Config>,
    resolver: Arc<dyn RootResolver>,
    pools: Arc<dyn PoolFactory>,
    apps: DashMap<PathBuf, Arc<Application>>,
    statics: DashMap<PathBuf, Arc<StaticDir>>,
}

impl HostRouter {
    pub fn new(
        config: Arc<Config>,
        resolver: Arc<dyn RootResolver>,
        pools: Arc<dyn PoolFactory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            resolver,
            pools,
            apps: DashMap::new(),
            statics: DashMap::new(),
        })
    }

    /// Resolve a raw Host header value to an application root.
    pub async fn route_for_host(&self, host: &str) -> Result<Option<PathBuf>, ResolverError> {
        self.resolver.resolve(&host_name(host)).await
    }

    /// The application for a root, created lazily while `config.ru` exists.
    ///
    /// When `config.ru` has disappeared a cached application is evicted and
    /// quit in the background - the root has ceased to be a rack app.
    pub async fn application_for_root(&self, root: &Path) -> Option<Arc<Application>> {
        let is_rack = tokio::fs::metadata(root.join("config.ru"))
            .await
            .map(|meta| meta.is_file())
            .unwrap_or(false);

        if !is_rack {
            if let Some((_, app)) = self.apps.remove(root) {
                info!(root = %root.display(), "config.ru removed, quitting application");
                tokio::spawn(async move { app.quit().await });
            }
            return None;
        }

        let app = self
            .apps
            .entry(root.to_path_buf())
            .or_insert_with(|| {
                Application::new(
                    root.to_path_buf(),
                    Arc::clone(&self.config),
                    Arc::clone(&self.pools),
                )
            })
            .clone();
        Some(app)
    }

    /// Memoised static handler rooted at `root/public`.
    pub fn static_for_root(&self, root: &Path) -> Arc<StaticDir> {
        self.statics
            .entry(root.to_path_buf())
            .or_insert_with(|| Arc::new(StaticDir::new(root)))
            .clone()
    }

    /// Quit every cached application. Invoked when the listener closes.
    pub async fn close_all(&self) {
        let apps: Vec<Arc<Application>> = self.apps.iter().map(|e| Arc::clone(e.value())).collect();
        self.apps.clear();
        info!(apps = apps.len(), "Closing all applications");
        for app in apps {
            app.quit().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::RackPoolFactory;
    use crate::resolver::SymlinkResolver;

    fn test_router(apps_dir: &Path) -> Arc<HostRouter> {
        let config = Arc::new(Config::default());
        let resolver = Arc::new(SymlinkResolver::new(apps_dir.to_path_buf(), "dev"));
        HostRouter::new(config, resolver, Arc::new(RackPoolFactory))
    }

    #[test]
    fn test_host_name_strips_port_and_case() {
        assert_eq!(host_name("Foo.Dev:20559"), "foo.dev");
        assert_eq!(host_name("foo.dev"), "foo.dev");
        assert_eq!(host_name(""), "");
    }

    #[tokio::test]
    async fn test_route_for_host_with_port_suffix() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("foo")).unwrap();
        let router = test_router(dir.path());

        let root = router.route_for_host("foo.dev:20559").await.unwrap();
        assert!(root.is_some());
    }

    #[tokio::test]
    async fn test_application_requires_config_ru() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("app");
        std::fs::create_dir(&root).unwrap();
        let router = test_router(dir.path());

        assert!(router.application_for_root(&root).await.is_none());

        std::fs::write(root.join("config.ru"), "run App\n").unwrap();
        assert!(router.application_for_root(&root).await.is_some());
    }

    #[tokio::test]
    async fn test_application_is_cached_per_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("app");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(root.join("config.ru"), "run App\n").unwrap();
        let router = test_router(dir.path());

        let first = router.application_for_root(&root).await.unwrap();
        let second = router.application_for_root(&root).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_deleting_config_ru_evicts_application() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("app");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(root.join("config.ru"), "run App\n").unwrap();
        let router = test_router(dir.path());

        let cached = router.application_for_root(&root).await.unwrap();
        std::fs::remove_file(root.join("config.ru")).unwrap();

        assert!(router.application_for_root(&root).await.is_none());

        // A re-created config.ru yields a fresh application.
        std::fs::write(root.join("config.ru"), "run App\n").unwrap();
        let fresh = router.application_for_root(&root).await.unwrap();
        assert!(!Arc::ptr_eq(&cached, &fresh));
    }

    #[tokio::test]
    async fn test_static_handler_is_memoised() {
        let dir = tempfile::tempdir().unwrap();
        let router = test_router(dir.path());
        let first = router.static_for_root(dir.path());
        let second = router.static_for_root(dir.path());
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_close_all_empties_cache() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("app");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(root.join("config.ru"), "run App\n").unwrap();
        let router = test_router(dir.path());

        router.application_for_root(&root).await.unwrap();
        router.close_all().await;
        assert!(router.apps.is_empty());
    }
}
