//! Relay server: listener, background tasks and shutdown

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::admin::AdminApi;
use crate::cleanup::Cleanup;
use crate::config::ServerConfig;
use crate::metrics::RelayMetrics;
use crate::pool::Pool;
use crate::registry::SessionRegistry;
use crate::session::{RelaySession, SessionContext};
use crate::status::{StatusService, ACCEPT_BACKOFF};
use crate::store::{SqliteStore, StoreError};

/// RDP relay server
pub struct RelayServer {
    config: ServerConfig,
    pool: Arc<Pool>,
    registry: SessionRegistry,
    metrics: Arc<RelayMetrics>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl RelayServer {
    /// Open the store, apply configured seeds and build the shared state.
    pub async fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(
            SqliteStore::new(&config.database_path)
                .await
                .with_context(|| format!("Failed to open pool database {:?}", config.database_path))?,
        );
        seed_store(&store, &config)
            .await
            .context("Failed to apply configured backends")?;

        let pool = Arc::new(Pool::new(store, config.pool_config()));
        let metrics = Arc::new(RelayMetrics::new()?);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            pool,
            registry: SessionRegistry::new(),
            metrics,
            shutdown_tx: Arc::new(shutdown_tx),
        })
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<RelayMetrics> {
        &self.metrics
    }

    pub fn session_context(&self) -> SessionContext {
        SessionContext {
            pool: self.pool.clone(),
            registry: self.registry.clone(),
            metrics: self.metrics.clone(),
            buffer_size: self.config.buffer_size,
        }
    }

    pub fn cleanup(&self) -> Cleanup {
        Cleanup::new(
            self.pool.clone(),
            self.registry.clone(),
            self.metrics.clone(),
            self.config.cleanup_interval(),
        )
    }

    /// Bind every configured port, start background tasks and relay until
    /// a shutdown signal arrives. A bind failure is returned immediately.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr)
            .await
            .with_context(|| format!("Failed to bind relay listener on {}", self.config.listen_addr))?;
        info!("Relay listening on {}", self.config.listen_addr);

        if let Some(status_addr) = self.config.status_addr {
            let status_listener = TcpListener::bind(status_addr)
                .await
                .with_context(|| format!("Failed to bind status listener on {}", status_addr))?;
            let service = StatusService::new(status_listener, self.registry.clone());
            tokio::spawn(service.run(self.shutdown_tx.subscribe()));
        }

        if let Some(http_addr) = self.config.http_addr {
            let http_listener = TcpListener::bind(http_addr)
                .await
                .with_context(|| format!("Failed to bind HTTP listener on {}", http_addr))?;
            let router =
                AdminApi::new(self.pool.clone(), self.registry.clone(), self.metrics.clone()).router();
            let shutdown_rx = self.shutdown_tx.subscribe();
            info!("HTTP server for health/metrics listening on {}", http_addr);
            tokio::spawn(async move {
                if let Err(e) = axum::serve(http_listener, router)
                    .with_graceful_shutdown(wait_for_shutdown(shutdown_rx))
                    .await
                {
                    tracing::error!("HTTP server error: {}", e);
                }
            });
        }

        self.spawn_cleanup();

        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        });

        self.serve(listener).await
    }

    /// Start the cleanup loop; it stops with the server.
    pub fn spawn_cleanup(&self) -> JoinHandle<()> {
        let cleanup = self.cleanup();
        tokio::spawn(cleanup.run(self.shutdown_tx.subscribe()))
    }

    /// Accept clients on `listener` until shutdown, one task per client.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let mut shutdown = self.shutdown_tx.subscribe();
        let ctx = self.session_context();

        while !*shutdown.borrow() {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("Accept failed: {}", e);
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                            continue;
                        }
                    };
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(client = %peer, "TCP_NODELAY not set: {}", e);
                    }
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        let reason = RelaySession::open(stream, peer, ctx).await.run().await;
                        debug!(client = %peer, ?reason, "Session closed");
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(
            "Relay stopped accepting; {} sessions still open",
            self.registry.count()
        );
        Ok(())
    }

    /// Stop accepting and stop background tasks. Open sessions run on.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn seed_store(store: &SqliteStore, config: &ServerConfig) -> Result<(), StoreError> {
    for backend in &config.backends {
        store.upsert_backend(&backend.address, backend.weight).await?;
    }
    for assignment in &config.static_assignments {
        store.assign_static(&assignment.client, &assignment.backend).await?;
    }
    if !config.backends.is_empty() || !config.static_assignments.is_empty() {
        info!(
            "Seeded {} backends and {} static assignments",
            config.backends.len(),
            config.static_assignments.len()
        );
    }
    Ok(())
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let mut sigterm = {
        use tokio::signal::unix::{signal, SignalKind};
        signal(SignalKind::terminate()).ok()
    };

    tokio::select! {
        _ = async {
            #[cfg(unix)]
            {
                if let Some(ref mut sigterm) = sigterm {
                    sigterm.recv().await;
                } else {
                    std::future::pending::<()>().await;
                }
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("Received SIGTERM, shutting down");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down");
        }
    }
}
