use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Application hosting settings
    #[serde(default)]
    pub apps: AppConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 127.0.0.1 - this is a dev-machine tool)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Listen port (default: 20559)
    #[serde(default = "default_listen_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    /// Directory holding application symlinks, keyed by hostname
    #[serde(default = "default_apps_root")]
    pub root: String,

    /// Top-level domain the resolver strips from hostnames (default: dev)
    #[serde(default = "default_domain")]
    pub domain: String,

    /// Worker pool size per application (default: 2)
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Idle timeout in seconds before a worker is shut down (default: 900)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Deadline in seconds for a worker to start accepting connections
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Port injected as SERVER_PORT so apps generate correct self-URLs
    /// (default: 80, matching the port-forwarding rule in front of the proxy)
    #[serde(default = "default_dst_port")]
    pub dst_port: u16,

    /// Path to the rvm loader script, required when an app has a .rvmrc
    #[serde(default = "default_rvm_path")]
    pub rvm_path: String,

    /// Command used to serve an application's config.ru (default: rackup)
    #[serde(default = "default_worker_command")]
    pub worker_command: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            root: default_apps_root(),
            domain: default_domain(),
            workers: default_workers(),
            idle_timeout_secs: default_idle_timeout(),
            startup_timeout_secs: default_startup_timeout(),
            dst_port: default_dst_port(),
            rvm_path: default_rvm_path(),
            worker_command: default_worker_command(),
        }
    }
}

impl AppConfig {
    pub fn root_path(&self) -> PathBuf {
        PathBuf::from(&self.root)
    }

    pub fn rvm_path(&self) -> PathBuf {
        PathBuf::from(&self.rvm_path)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// A missing file is not an error; everything has a workable default on a
    /// dev machine.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.apps.workers == 0 {
            anyhow::bail!("apps.workers must be greater than 0");
        }
        if self.apps.domain.is_empty() {
            anyhow::bail!("apps.domain must not be empty");
        }
        if self.apps.root.is_empty() {
            anyhow::bail!("apps.root must not be empty");
        }
        if self.apps.worker_command.is_empty() {
            anyhow::bail!("apps.worker_command must not be empty");
        }
        Ok(())
    }
}

// Default value functions
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    20559
}

fn default_apps_root() -> String {
    match std::env::var("HOME") {
        Ok(home) => format!("{}/.rackway", home),
        Err(_) => ".rackway".to_string(),
    }
}

fn default_domain() -> String {
    "dev".to_string()
}

fn default_workers() -> usize {
    2
}

fn default_idle_timeout() -> u64 {
    900 // 15 minutes
}

fn default_startup_timeout() -> u64 {
    30
}

fn default_dst_port() -> u16 {
    80
}

fn default_rvm_path() -> String {
    match std::env::var("HOME") {
        Ok(home) => format!("{}/.rvm/scripts/rvm", home),
        Err(_) => ".rvm/scripts/rvm".to_string(),
    }
}

fn default_worker_command() -> String {
    "rackup".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.port, 20559);
        assert_eq!(config.apps.domain, "dev");
        assert_eq!(config.apps.workers, 2);
        assert_eq!(config.apps.dst_port, 80);
        assert_eq!(config.apps.idle_timeout(), Duration::from_secs(900));
        assert_eq!(config.apps.startup_timeout(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[server]
bind = "0.0.0.0"
port = 8080

[apps]
root = "/srv/apps"
domain = "test"
workers = 4
idle_timeout_secs = 60
startup_timeout_secs = 5
dst_port = 443
worker_command = "bundle"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.apps.root_path(), PathBuf::from("/srv/apps"));
        assert_eq!(config.apps.domain, "test");
        assert_eq!(config.apps.workers, 4);
        assert_eq!(config.apps.idle_timeout(), Duration::from_secs(60));
        assert_eq!(config.apps.dst_port, 443);
        assert_eq!(config.apps.worker_command, "bundle");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config = toml::from_str("[apps]\nworkers = 1\n").unwrap();
        assert_eq!(config.apps.workers, 1);
        assert_eq!(config.apps.domain, "dev");
        assert_eq!(config.server.port, 20559);
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let config: Config = toml::from_str("[apps]\nworkers = 0\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_domain() {
        let config: Config = toml::from_str("[apps]\ndomain = \"\"\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path().join("rackway.toml")).unwrap();
        assert_eq!(config.server.port, 20559);
    }
}
