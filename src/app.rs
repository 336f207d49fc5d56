//! Per-application lifecycle
//!
//! An application is a directory with a `config.ru`. On the first request it
//! moves uninitialized -> initializing -> ready: the boot sources the app's
//! environment scripts and creates a worker pool. Concurrent requests during
//! boot join a waiter queue and are drained in arrival order once the single
//! boot attempt settles. Touching `tmp/restart.txt` quits the pool; the next
//! `ready` boots a fresh one. Boot failures reset the application so the
//! next request retries.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use http_body_util::combinators::BoxBody;
use hyper::body::Bytes;
use hyper::{Request, Response};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::env::{self, ScriptError, SourceError};
use crate::pause::{PausedBody, ResumeHandle};
use crate::pool::{PoolError, PoolFactory, PoolOptions, ProxyMeta, WorkerPool};

/// Environment scripts sourced during boot, in order.
const ENV_SCRIPTS: [&str; 2] = [".powrc", ".powenv"];

/// An application failed to boot.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BootError {
    #[error(transparent)]
    Source(#[from] SourceError),

    /// `.rvmrc` is present but the configured rvm loader is not.
    #[error("application has a .rvmrc but the rvm loader {} does not exist", .rvm_path.display())]
    RvmMissing { rvm_path: PathBuf },

    #[error("failed to create worker pool: {0}")]
    Pool(String),

    /// The boot task went away without settling (shutdown mid-boot).
    #[error("initialization interrupted")]
    Interrupted,
}

impl BootError {
    /// Captured diagnostic output, present only for script failures.
    pub fn detail(&self) -> String {
        match self {
            BootError::Source(SourceError::Script(ScriptError { stdout, stderr, .. })) => {
                let mut detail = String::new();
                if !stdout.is_empty() {
                    detail.push_str(stdout);
                }
                if !stderr.is_empty() {
                    if !detail.is_empty() {
                        detail.push('\n');
                    }
                    detail.push_str(stderr);
                }
                detail
            }
            _ => String::new(),
        }
    }
}

/// A request could not be served by the application.
#[derive(Debug, thiserror::Error)]
pub enum HandleError {
    #[error(transparent)]
    Boot(#[from] BootError),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Externally observable lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Uninitialized,
    Initializing,
    Ready,
}

enum State {
    Uninitialized,
    Initializing,
    Ready(Arc<dyn WorkerPool>),
}

type BootResult = Result<Arc<dyn WorkerPool>, BootError>;

struct Inner {
    state: State,
    /// Pending callers waiting for boot to settle, in arrival order.
    waiters: Vec<oneshot::Sender<BootResult>>,
    /// Last observed mtime of tmp/restart.txt.
    restart_mtime: Option<SystemTime>,
}

/// One application root and its worker pool.
pub struct Application {
    root: PathBuf,
    config: Arc<Config>,
    pools: Arc<dyn PoolFactory>,
    inner: Mutex<Inner>,
}

impl Application {
    pub fn new(root: PathBuf, config: Arc<Config>, pools: Arc<dyn PoolFactory>) -> Arc<Self> {
        Arc::new(Self {
            root,
            config,
            pools,
            inner: Mutex::new(Inner {
                state: State::Uninitialized,
                waiters: Vec::new(),
                restart_mtime: None,
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state(&self) -> AppState {
        match self.inner.lock().state {
            State::Uninitialized => AppState::Uninitialized,
            State::Initializing => AppState::Initializing,
            State::Ready(_) => AppState::Ready,
        }
    }

    /// Wait until the application is ready, booting it if necessary.
    ///
    /// At most one boot runs at a time; every concurrent caller receives the
    /// same outcome. A failed boot resets the application so the next call
    /// retries.
    pub async fn ready(self: &Arc<Self>) -> BootResult {
        let rx = {
            let mut inner = self.inner.lock();
            match &inner.state {
                State::Ready(pool) => return Ok(Arc::clone(pool)),
                State::Initializing => {
                    let (tx, rx) = oneshot::channel();
                    inner.waiters.push(tx);
                    rx
                }
                State::Uninitialized => {
                    inner.state = State::Initializing;
                    let (tx, rx) = oneshot::channel();
                    inner.waiters.push(tx);
                    // The boot runs detached so a disconnecting client cannot
                    // cancel it out from under the other waiters.
                    tokio::spawn(Arc::clone(self).initialize());
                    rx
                }
            }
        };
        rx.await.map_err(|_| BootError::Interrupted)?
    }

    /// Serve one request: wait for readiness, honor a pending restart, then
    /// hand off to the pool. `resume` is released at handoff so the buffered
    /// request body flows to the worker.
    pub async fn handle(
        self: &Arc<Self>,
        req: Request<PausedBody>,
        resume: &ResumeHandle,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, HandleError> {
        self.ready().await?;
        self.restart_if_necessary().await;
        // Re-entering ready here picks up the fresh pool after a restart,
        // whether this request triggered it or raced with one that did.
        let pool = self.ready().await?;

        resume.resume();
        let meta = ProxyMeta {
            server_port: self.config.apps.dst_port,
        };
        Ok(pool.handle(req, meta).await?)
    }

    /// Quit the worker pool, if one exists, and wait for its workers to
    /// exit. The application returns to uninitialized so the next request
    /// boots a fresh pool.
    pub async fn quit(&self) {
        let pool = self.take_pool();
        if let Some(pool) = pool {
            info!(root = %self.root.display(), "Quitting application");
            pool.quit().await;
        }
    }

    /// Check `tmp/restart.txt` and restart the pool when its mtime moved.
    ///
    /// Returns true when a restart happened, in which case the caller must
    /// re-enter [`ready`](Self::ready) before forwarding anything. The
    /// decision and the mtime update happen under one lock so concurrent
    /// requests trigger a single restart. Stat failures are ignored and
    /// recorded as "not observed".
    pub async fn restart_if_necessary(&self) -> bool {
        let observed = tokio::fs::metadata(self.root.join("tmp/restart.txt"))
            .await
            .ok()
            .and_then(|meta| meta.modified().ok());

        let stale_pool = {
            let mut inner = self.inner.lock();
            let changed = observed.is_some() && inner.restart_mtime != observed;
            inner.restart_mtime = observed;
            if changed {
                match std::mem::replace(&mut inner.state, State::Uninitialized) {
                    State::Ready(pool) => Some(pool),
                    other => {
                        // Nothing to quit; put the state back.
                        inner.state = other;
                        None
                    }
                }
            } else {
                None
            }
        };

        match stale_pool {
            Some(pool) => {
                info!(root = %self.root.display(), "Restart triggered by tmp/restart.txt");
                pool.quit().await;
                true
            }
            None => false,
        }
    }

    /// The single boot attempt: source the environment, create the pool,
    /// settle every waiter with the outcome.
    async fn initialize(self: Arc<Self>) {
        info!(root = %self.root.display(), "Initializing application");
        let result = self.boot().await;

        let (waiters, outcome) = {
            let mut inner = self.inner.lock();
            let waiters = std::mem::take(&mut inner.waiters);
            let outcome: BootResult = match result {
                Ok(pool) => {
                    inner.state = State::Ready(Arc::clone(&pool));
                    Ok(pool)
                }
                Err(e) => {
                    inner.state = State::Uninitialized;
                    Err(e)
                }
            };
            (waiters, outcome)
        };

        match &outcome {
            Ok(_) => info!(root = %self.root.display(), "Application ready"),
            Err(e) => error!(root = %self.root.display(), error = %e, "Application failed to boot"),
        }

        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }

    async fn boot(&self) -> BootResult {
        let env = self.load_environment().await?;
        let options = PoolOptions {
            env,
            size: self.config.apps.workers,
            idle: self.config.apps.idle_timeout(),
            startup_timeout: self.config.apps.startup_timeout(),
            command: self.config.apps.worker_command.clone(),
        };
        self.pools
            .create(&self.root.join("config.ru"), options)
            .await
            .map_err(|e| BootError::Pool(e.to_string()))
    }

    /// Build the worker environment: the proxy's own environment, refined by
    /// `.powrc` then `.powenv`, then `.rvmrc` under the rvm loader.
    async fn load_environment(&self) -> Result<HashMap<String, String>, BootError> {
        let mut env: HashMap<String, String> = std::env::vars().collect();

        for name in ENV_SCRIPTS {
            let script = self.root.join(name);
            if file_exists(&script).await {
                env = env::source(&script, &env, None).await?;
            }
        }

        let rvmrc = self.root.join(".rvmrc");
        if file_exists(&rvmrc).await {
            let rvm_path = self.config.apps.rvm_path();
            if !file_exists(&rvm_path).await {
                return Err(BootError::RvmMissing { rvm_path });
            }
            let before = format!(". \"{}\"", rvm_path.display());
            env = env::source(&rvmrc, &env, Some(&before)).await?;
            debug!(root = %self.root.display(), "Sourced .rvmrc under rvm");
        }

        Ok(env)
    }

    fn take_pool(&self) -> Option<Arc<dyn WorkerPool>> {
        let mut inner = self.inner.lock();
        match std::mem::replace(&mut inner.state, State::Uninitialized) {
            State::Ready(pool) => Some(pool),
            other => {
                inner.state = other;
                None
            }
        }
    }
}

async fn file_exists(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok()
}
