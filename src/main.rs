use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use rackway::config::Config;
use rackway::gateway::Gateway;
use rackway::pool::RackPoolFactory;
use rackway::resolver::SymlinkResolver;
use rackway::router::HostRouter;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rackway=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("rackway.toml"));

    let config = Arc::new(Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?);

    info!(
        bind = %config.server.bind,
        port = config.server.port,
        root = %config.apps.root,
        domain = %config.apps.domain,
        workers = config.apps.workers,
        idle_timeout_secs = config.apps.idle_timeout_secs,
        dst_port = config.apps.dst_port,
        "Starting rackway"
    );

    let resolver = Arc::new(SymlinkResolver::new(
        config.apps.root_path(),
        config.apps.domain.clone(),
    ));
    let router = HostRouter::new(Arc::clone(&config), resolver, Arc::new(RackPoolFactory));
    let gateway = Gateway::new(Arc::clone(&config), Arc::clone(&router));

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address: {}", e))?;
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Listening (HTTP/1.1)");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(run_server(listener, gateway, shutdown_rx));

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);
    let _ = server.await;

    // The listener is closed; quit every application's workers.
    router.close_all().await;

    info!("Shutdown complete");
    Ok(())
}

async fn run_server(
    listener: TcpListener,
    gateway: Arc<Gateway>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let gateway = Arc::clone(&gateway);
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let gateway = Arc::clone(&gateway);
                                async move {
                                    Ok::<_, std::convert::Infallible>(gateway.dispatch(req).await)
                                }
                            });
                            if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                .serve_connection(io, service)
                                .await
                            {
                                debug!(addr = %addr, error = %e, "Connection error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("Listener shutting down");
                    break;
                }
            }
        }
    }
}
