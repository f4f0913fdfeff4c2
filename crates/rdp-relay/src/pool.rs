//! Backend selection and claim bookkeeping
//!
//! The pool is a thin policy layer over a [`PoolStore`]. It never caches
//! claim state: every decision reads the store, so several relay tasks and
//! the cleanup loop always agree on the source of truth.

use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::net::TcpStream;
use tracing::debug;

use crate::store::{BackendRow, PoolStore, ReconcileOutcome, StoreError};

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Port dialled on every backend address
    pub backend_port: u16,
    pub connect_timeout: Duration,
    /// Delay between marking an orphaned claim and freeing it
    pub grace_period: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            backend_port: 3389,
            connect_timeout: Duration::from_secs(10),
            grace_period: Duration::from_secs(600), // 10 minutes
        }
    }
}

/// Why a backend was picked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionSource {
    Static,
    Sticky,
    Weighted,
}

/// Backend pool
pub struct Pool {
    store: Arc<dyn PoolStore>,
    config: PoolConfig,
}

impl Pool {
    pub fn new(store: Arc<dyn PoolStore>, config: PoolConfig) -> Self {
        Self { store, config }
    }

    /// Pick a backend for `client`.
    ///
    /// Static assignment first, then a backend the client already holds,
    /// then the heaviest free backend with non-zero weight.
    pub async fn select_backend(&self, client: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .select_with_source(client)
            .await?
            .map(|(backend, _)| backend))
    }

    pub async fn select_with_source(
        &self,
        client: &str,
    ) -> Result<Option<(String, SelectionSource)>, StoreError> {
        if let Some(backend) = self.store.static_backend(client).await? {
            debug!(client, backend = %backend, "Static assignment");
            return Ok(Some((backend, SelectionSource::Static)));
        }

        if let Some(backend) = self.store.claimed_backend(client).await? {
            debug!(client, backend = %backend, "Re-using existing claim");
            return Ok(Some((backend, SelectionSource::Sticky)));
        }

        Ok(self
            .store
            .best_free_backend()
            .await?
            .map(|backend| (backend, SelectionSource::Weighted)))
    }

    /// Open a TCP connection to `backend` on the configured backend port.
    pub async fn connect(&self, backend: &str) -> io::Result<TcpStream> {
        let target = (backend, self.config.backend_port);
        match tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(target)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!(
                    "connect to {}:{} timed out after {:?}",
                    backend, self.config.backend_port, self.config.connect_timeout
                ),
            )),
        }
    }

    /// Claim `backend` for `client` if it is free or already theirs.
    ///
    /// Returns whether `client` holds the claim afterwards.
    pub async fn claim(&self, backend: &str, client: &str) -> Result<bool, StoreError> {
        self.store.try_claim(backend, client).await
    }

    /// Free `backend`. Releasing a free backend is a no-op.
    pub async fn release(&self, backend: &str) -> Result<(), StoreError> {
        self.store.clear_claim(backend).await
    }

    /// Free `backend` only if `client` still holds it.
    pub async fn withdraw(&self, backend: &str, client: &str) -> Result<bool, StoreError> {
        self.store.clear_claim_of(backend, client).await
    }

    /// Expire claims whose owners are not in `live`, using the wall clock.
    pub async fn reconcile(&self, live: &HashSet<String>) -> Result<ReconcileOutcome, StoreError> {
        self.reconcile_at(live, unix_now()).await
    }

    pub async fn reconcile_at(
        &self,
        live: &HashSet<String>,
        now: i64,
    ) -> Result<ReconcileOutcome, StoreError> {
        let grace = self.config.grace_period.as_secs() as i64;
        self.store.reconcile(live, now, grace).await
    }

    pub async fn backends(&self) -> Result<Vec<BackendRow>, StoreError> {
        self.store.backends().await
    }
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
