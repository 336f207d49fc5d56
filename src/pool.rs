//! Worker pools: spawning, dispatch, idle-out, quit
//!
//! Each ready application owns a pool of worker subprocesses. A worker is a
//! rack server process (`rackup` by default) bound to an ephemeral loopback
//! port, serving one request at a time. Workers are spawned on demand up to
//! the pool size, requests queue when every worker is busy, and a reaper
//! shuts workers down after the configured idle period. `quit` drains
//! in-flight requests, terminates every worker, and resolves once all of
//! them have exited.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderValue, HOST};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

/// Grace period between SIGTERM and SIGKILL when stopping a worker
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Interval for polling a starting worker's port
const READY_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Interval for the idle-worker reaper
const REAP_INTERVAL: Duration = Duration::from_secs(10);

/// Options for creating a worker pool.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Environment shared by every worker (fully replaces the proxy's own).
    pub env: HashMap<String, String>,
    /// Maximum number of workers at the pool's disposal.
    pub size: usize,
    /// Inactivity period after which a worker is shut down.
    pub idle: Duration,
    /// Deadline for a spawned worker to start accepting connections.
    pub startup_timeout: Duration,
    /// Command used to serve the rack config.
    pub command: String,
}

/// Per-request metadata injected before worker handoff.
#[derive(Debug, Clone, Copy)]
pub struct ProxyMeta {
    /// The port applications should believe they are served on.
    pub server_port: u16,
}

/// Errors from pool creation and request dispatch.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    #[error("worker did not accept connections within {0:?}")]
    StartupTimeout(Duration),

    /// The pool is quitting; no new requests are admitted.
    #[error("worker pool is draining")]
    Draining,

    #[error("error forwarding request to worker: {0}")]
    Upstream(String),

    #[error("error building worker request: {0}")]
    RequestBuild(String),
}

/// The worker pool capability consumed by an application.
#[async_trait]
pub trait WorkerPool: Send + Sync + std::fmt::Debug {
    /// Hand a request to an available worker, queueing if all are busy.
    async fn handle(
        &self,
        req: Request<crate::pause::PausedBody>,
        meta: ProxyMeta,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError>;

    /// Drain in-flight requests and terminate all workers. Resolves when
    /// every worker process has exited; safe to call more than once.
    async fn quit(&self);
}

/// Creates pools. A seam so the application lifecycle is testable without
/// real subprocesses.
#[async_trait]
pub trait PoolFactory: Send + Sync {
    async fn create(
        &self,
        config_path: &Path,
        options: PoolOptions,
    ) -> Result<Arc<dyn WorkerPool>, PoolError>;
}

/// A single worker subprocess.
#[derive(Debug)]
struct Worker {
    id: usize,
    child: Child,
    port: u16,
    last_used: Instant,
}

/// Pool of rack worker subprocesses behind one application.
#[derive(Debug)]
pub struct RackPool {
    config_path: PathBuf,
    options: PoolOptions,
    client: Client<HttpConnector, crate::pause::PausedBody>,
    /// One permit per worker slot; closed on quit.
    permits: Arc<Semaphore>,
    /// Workers not currently serving a request.
    idle: Mutex<Vec<Worker>>,
    worker_seq: AtomicUsize,
    quitting: AtomicBool,
    exit_tx: watch::Sender<bool>,
    exit_rx: watch::Receiver<bool>,
}

impl RackPool {
    /// Create a pool. Workers are spawned lazily, on the first requests that
    /// need them.
    pub fn new(config_path: PathBuf, options: PoolOptions) -> Arc<Self> {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        let client = Client::builder(TokioExecutor::new()).build(connector);

        let (exit_tx, exit_rx) = watch::channel(false);
        let pool = Arc::new(Self {
            permits: Arc::new(Semaphore::new(options.size)),
            idle: Mutex::new(Vec::with_capacity(options.size)),
            worker_seq: AtomicUsize::new(0),
            quitting: AtomicBool::new(false),
            exit_tx,
            exit_rx,
            client,
            config_path,
            options,
        });
        pool.start_reaper();
        pool
    }

    /// Background task shutting down workers idle past the configured period.
    fn start_reaper(self: &Arc<Self>) {
        let pool = Arc::downgrade(self);
        let mut exit_rx = self.exit_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(REAP_INTERVAL) => {}
                    _ = exit_rx.changed() => return,
                }
                let Some(pool) = pool.upgrade() else { return };
                pool.reap_idle().await;
            }
        });
    }

    async fn reap_idle(&self) {
        let expired: Vec<Worker> = {
            let mut idle = self.idle.lock();
            let mut keep = Vec::with_capacity(idle.len());
            let mut expired = Vec::new();
            for worker in idle.drain(..) {
                if worker.last_used.elapsed() > self.options.idle {
                    expired.push(worker);
                } else {
                    keep.push(worker);
                }
            }
            *idle = keep;
            expired
        };

        for worker in expired {
            info!(
                worker = worker.id,
                idle_secs = worker.last_used.elapsed().as_secs(),
                "Worker idle timeout reached"
            );
            stop_worker(worker, SHUTDOWN_GRACE).await;
        }
    }

    /// Take an idle worker, or spawn one. The caller holds a permit, so at
    /// most `size` workers exist at any time.
    async fn checkout(&self) -> Result<Worker, PoolError> {
        loop {
            let candidate = self.idle.lock().pop();
            let Some(mut worker) = candidate else { break };
            match worker.child.try_wait() {
                Ok(None) => return Ok(worker),
                Ok(Some(status)) => {
                    info!(worker = worker.id, %status, "Worker exited while idle");
                }
                Err(e) => {
                    warn!(worker = worker.id, error = %e, "Failed to poll idle worker");
                }
            }
        }
        self.spawn_worker().await
    }

    async fn spawn_worker(&self) -> Result<Worker, PoolError> {
        let port = free_port().await?;
        let id = self.worker_seq.fetch_add(1, Ordering::Relaxed);

        let mut cmd = Command::new(&self.options.command);
        cmd.arg(&self.config_path)
            .arg("-o")
            .arg("127.0.0.1")
            .arg("-p")
            .arg(port.to_string());
        if let Some(root) = self.config_path.parent() {
            cmd.current_dir(root);
        }
        cmd.env_clear();
        cmd.envs(&self.options.env);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            PoolError::Spawn(format!("{}: {}", self.options.command, e))
        })?;

        info!(worker = id, port, pid = child.id(), "Worker spawned");

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(crate::lines::forward_lines(stdout, move |line| {
                info!(worker = id, "{}", line);
            }));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(crate::lines::forward_lines(stderr, move |line| {
                warn!(worker = id, "{}", line);
            }));
        }

        self.await_ready(port, &mut child).await?;
        debug!(worker = id, port, "Worker accepting connections");

        Ok(Worker {
            id,
            child,
            port,
            last_used: Instant::now(),
        })
    }

    /// Poll the worker's port until it accepts, it exits, or the startup
    /// deadline passes.
    async fn await_ready(&self, port: u16, child: &mut Child) -> Result<(), PoolError> {
        let deadline = Instant::now() + self.options.startup_timeout;
        loop {
            if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                return Ok(());
            }
            if let Ok(Some(status)) = child.try_wait() {
                return Err(PoolError::Spawn(format!(
                    "worker exited during startup with {}",
                    status
                )));
            }
            if Instant::now() > deadline {
                let _ = child.kill().await;
                return Err(PoolError::StartupTimeout(self.options.startup_timeout));
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    async fn forward(
        &self,
        req: Request<crate::pause::PausedBody>,
        worker: &Worker,
        meta: ProxyMeta,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        let (mut parts, body) = req.into_parts();
        apply_meta(&mut parts.headers, meta);

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri = format!("http://127.0.0.1:{}{}", worker.port, path_and_query);

        let mut builder = Request::builder().method(parts.method).uri(&uri);
        for (name, value) in parts.headers.iter() {
            builder = builder.header(name, value);
        }
        let upstream = builder
            .body(body)
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        let response = self
            .client
            .request(upstream)
            .await
            .map_err(|e| PoolError::Upstream(e.to_string()))?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

#[async_trait]
impl WorkerPool for RackPool {
    async fn handle(
        &self,
        req: Request<crate::pause::PausedBody>,
        meta: ProxyMeta,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| PoolError::Draining)?;

        let mut worker = self.checkout().await?;
        let result = self.forward(req, &worker, meta).await;

        match &result {
            Ok(_) => {
                worker.last_used = Instant::now();
                self.idle.lock().push(worker);
            }
            Err(e) => {
                // The worker is suspect after a forwarding failure; replace
                // it rather than risk handing it another request.
                warn!(worker = worker.id, error = %e, "Discarding worker after forward failure");
                stop_worker(worker, Duration::from_secs(1)).await;
            }
        }

        drop(permit);
        result
    }

    async fn quit(&self) {
        if self.quitting.swap(true, Ordering::SeqCst) {
            // Another caller is already quitting; wait for the terminal exit.
            let mut exit_rx = self.exit_rx.clone();
            while !*exit_rx.borrow() {
                if exit_rx.changed().await.is_err() {
                    break;
                }
            }
            return;
        }

        // Drain: acquiring every permit waits out all in-flight requests.
        let drained = self
            .permits
            .acquire_many(self.options.size as u32)
            .await;
        self.permits.close();

        let workers: Vec<Worker> = self.idle.lock().drain(..).collect();
        info!(workers = workers.len(), "Quitting worker pool");
        for worker in workers {
            stop_worker(worker, SHUTDOWN_GRACE).await;
        }

        drop(drained);
        let _ = self.exit_tx.send(true);
    }
}

/// Factory creating [`RackPool`]s.
pub struct RackPoolFactory;

#[async_trait]
impl PoolFactory for RackPoolFactory {
    async fn create(
        &self,
        config_path: &Path,
        options: PoolOptions,
    ) -> Result<Arc<dyn WorkerPool>, PoolError> {
        debug!(
            config = %config_path.display(),
            size = options.size,
            idle_secs = options.idle.as_secs(),
            "Creating worker pool"
        );
        Ok(RackPool::new(config_path.to_path_buf(), options))
    }
}

/// Rewrite the request's notion of its own port so the application generates
/// correct self-URLs.
fn apply_meta(headers: &mut HeaderMap, meta: ProxyMeta) {
    if let Some(host) = headers.get(HOST).and_then(|h| h.to_str().ok()) {
        if let Some((name, _)) = host.split_once(':') {
            if let Ok(value) = HeaderValue::from_str(&format!("{}:{}", name, meta.server_port)) {
                headers.insert(HOST, value);
            }
        }
    }
    headers.insert("X-Forwarded-Port", HeaderValue::from(meta.server_port));
}

/// Ask the kernel for a free loopback port.
async fn free_port() -> Result<u16, PoolError> {
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .map_err(|e| PoolError::Spawn(e.to_string()))?;
    let port = listener
        .local_addr()
        .map_err(|e| PoolError::Spawn(e.to_string()))?
        .port();
    Ok(port)
}

/// Terminate a worker: SIGTERM, then SIGKILL after the grace period.
async fn stop_worker(mut worker: Worker, grace: Duration) {
    if let Some(pid) = worker.child.id() {
        debug!(worker = worker.id, pid, "Sending SIGTERM to worker");

        #[cfg(unix)]
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }

        #[cfg(not(unix))]
        {
            let _ = worker.child.start_kill();
        }
    }

    match tokio::time::timeout(grace, worker.child.wait()).await {
        Ok(Ok(status)) => {
            info!(worker = worker.id, %status, "Worker exited");
        }
        Ok(Err(e)) => {
            warn!(worker = worker.id, error = %e, "Error waiting for worker to exit");
        }
        Err(_) => {
            warn!(
                worker = worker.id,
                grace_secs = grace.as_secs(),
                "Grace period exceeded, killing worker"
            );
            let _ = worker.child.kill().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Full;

    fn test_options(command: &str, startup_ms: u64) -> PoolOptions {
        PoolOptions {
            env: HashMap::from([("PATH".to_string(), "/usr/bin:/bin".to_string())]),
            size: 2,
            idle: Duration::from_secs(60),
            startup_timeout: Duration::from_millis(startup_ms),
            command: command.to_string(),
        }
    }

    fn paused_request(path: &str) -> Request<crate::pause::PausedBody> {
        let req = Request::builder()
            .uri(path)
            .header("host", "foo.dev:20559")
            .body(Full::new(Bytes::from_static(b"")))
            .unwrap();
        let (req, resume) = crate::pause::pause(req);
        resume.resume();
        req
    }

    #[test]
    fn test_apply_meta_rewrites_explicit_host_port() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("foo.dev:20559"));
        apply_meta(&mut headers, ProxyMeta { server_port: 80 });
        assert_eq!(headers.get(HOST).unwrap(), "foo.dev:80");
        assert_eq!(headers.get("X-Forwarded-Port").unwrap(), "80");
    }

    #[test]
    fn test_apply_meta_leaves_bare_host() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("foo.dev"));
        apply_meta(&mut headers, ProxyMeta { server_port: 80 });
        assert_eq!(headers.get(HOST).unwrap(), "foo.dev");
        assert_eq!(headers.get("X-Forwarded-Port").unwrap(), "80");
    }

    #[tokio::test]
    async fn test_free_port_is_nonzero() {
        assert_ne!(free_port().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_spawn_failure_surfaces() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("config.ru");
        std::fs::write(&config, "").unwrap();

        let pool = RackPool::new(config, test_options("/nonexistent/worker-cmd", 1000));
        let err = pool
            .handle(paused_request("/"), ProxyMeta { server_port: 80 })
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Spawn(_)));
    }

    #[tokio::test]
    async fn test_startup_timeout_for_worker_that_never_listens() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("config.ru");
        // Interpreted by sh: a worker that runs but never opens its port.
        std::fs::write(&config, "sleep 60\n").unwrap();

        let pool = RackPool::new(config, test_options("sh", 300));
        let err = pool
            .handle(paused_request("/"), ProxyMeta { server_port: 80 })
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::StartupTimeout(_)));
    }

    #[tokio::test]
    async fn test_quit_is_idempotent_and_closes_admission() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("config.ru");
        std::fs::write(&config, "").unwrap();

        let pool = RackPool::new(config, test_options("sh", 300));
        pool.quit().await;
        pool.quit().await;

        let err = pool
            .handle(paused_request("/"), ProxyMeta { server_port: 80 })
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Draining));
    }
}
