//! Periodic reconciliation of persisted claims against live sessions

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::metrics::RelayMetrics;
use crate::pool::{unix_now, Pool};
use crate::registry::SessionRegistry;

/// Result of one cleanup tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub live_clients: usize,
    pub reasserted: usize,
    /// Re-asserted claims undone because the session closed meanwhile
    pub withdrawn: usize,
    pub marked: usize,
    pub freed: usize,
}

/// Background loop keeping the claim table consistent with the registry.
pub struct Cleanup {
    pool: Arc<Pool>,
    registry: SessionRegistry,
    metrics: Arc<RelayMetrics>,
    interval: Duration,
}

impl Cleanup {
    pub fn new(
        pool: Arc<Pool>,
        registry: SessionRegistry,
        metrics: Arc<RelayMetrics>,
        interval: Duration,
    ) -> Self {
        Self {
            pool,
            registry,
            metrics,
            interval,
        }
    }

    /// Tick until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.tick().await;
                    if report.marked > 0 || report.freed > 0 {
                        info!(
                            "Cleanup marked {} orphaned claims, freed {} expired claims",
                            report.marked, report.freed
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Cleanup loop stopping");
                        break;
                    }
                }
            }
        }
    }

    pub async fn tick(&self) -> TickReport {
        self.tick_at(unix_now()).await
    }

    /// Re-assert every live claim, then expire the rest as of `now`.
    pub async fn tick_at(&self, now: i64) -> TickReport {
        let mut report = TickReport::default();

        for (backend, client) in self.registry.live_claims() {
            match self.pool.claim(&backend, &client).await {
                Ok(true) if self.registry.holds(&backend, &client) => report.reasserted += 1,
                Ok(true) => {
                    // The session released while the claim was in flight
                    match self.pool.withdraw(&backend, &client).await {
                        Ok(true) => report.withdrawn += 1,
                        Ok(false) => {}
                        Err(e) => {
                            warn!(backend = %backend, "Withdrawing stale claim failed: {}", e);
                            self.metrics.record_store_error();
                        }
                    }
                }
                Ok(false) => {
                    warn!(backend = %backend, client = %client, "Live session no longer owns its backend");
                }
                Err(e) => {
                    warn!(backend = %backend, "Claim re-assertion failed: {}", e);
                    self.metrics.record_store_error();
                }
            }
        }

        let live = self.registry.live_clients();
        report.live_clients = live.len();

        match self.pool.reconcile_at(&live, now).await {
            Ok(outcome) => {
                report.marked = outcome.marked;
                report.freed = outcome.freed;
                self.metrics.record_reconcile(outcome.marked, outcome.freed);
            }
            Err(e) => {
                warn!("Claim expiry failed: {}", e);
                self.metrics.record_store_error();
            }
        }

        match self.pool.backends().await {
            Ok(rows) => {
                let claimed = rows.iter().filter(|row| !row.client.is_empty()).count();
                self.metrics.set_claimed_backends(claimed);
            }
            Err(e) => debug!("Backend listing failed: {}", e),
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use async_trait::async_trait;

    use crate::pool::PoolConfig;
    use crate::store::{BackendRow, PoolStore, ReconcileOutcome, SqliteStore, StoreError};

    async fn setup() -> (Cleanup, Arc<Pool>, SessionRegistry) {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        store.upsert_backend("10.0.0.1", 1).await.unwrap();
        store.upsert_backend("10.0.0.2", 1).await.unwrap();
        let pool = Arc::new(Pool::new(
            store,
            PoolConfig {
                grace_period: Duration::from_secs(10),
                ..PoolConfig::default()
            },
        ));
        let registry = SessionRegistry::new();
        let cleanup = Cleanup::new(
            pool.clone(),
            registry.clone(),
            Arc::new(RelayMetrics::new().unwrap()),
            Duration::from_secs(3),
        );
        (cleanup, pool, registry)
    }

    #[tokio::test]
    async fn test_tick_reasserts_live_claims() {
        let (cleanup, pool, registry) = setup().await;
        let guard = registry.register("192.168.0.10:50000".parse().unwrap());
        guard.set_backend("10.0.0.1");

        // Claim drifted away, e.g. an operator reset the row
        pool.release("10.0.0.1").await.unwrap();

        let report = cleanup.tick_at(1_000).await;
        assert_eq!(report.reasserted, 1);
        assert_eq!(report.live_clients, 1);
        assert_eq!(report.marked, 0);

        let rows = pool.backends().await.unwrap();
        assert_eq!(rows[0].client, "192.168.0.10");
    }

    #[tokio::test]
    async fn test_orphaned_claim_freed_only_after_grace() {
        let (cleanup, pool, registry) = setup().await;
        {
            let guard = registry.register("192.168.0.10:50000".parse().unwrap());
            guard.set_backend("10.0.0.1");
            cleanup.tick_at(1_000).await;
            // Session vanishes without releasing
        }

        let report = cleanup.tick_at(1_003).await;
        assert_eq!(report.marked, 1);
        assert_eq!(pool.select_backend("other").await.unwrap().as_deref(), Some("10.0.0.2"));
        assert!(pool.claim("10.0.0.2", "other").await.unwrap());

        let report = cleanup.tick_at(1_012).await;
        assert_eq!(report.freed, 0);
        assert_eq!(pool.select_backend("late").await.unwrap(), None);

        let report = cleanup.tick_at(1_014).await;
        assert_eq!(report.freed, 1);
        assert_eq!(pool.select_backend("late").await.unwrap().as_deref(), Some("10.0.0.1"));
    }

    #[tokio::test]
    async fn test_returning_client_keeps_pending_backend() {
        let (cleanup, pool, registry) = setup().await;
        assert!(pool.claim("10.0.0.1", "192.168.0.10").await.unwrap());
        cleanup.tick_at(2_000).await;

        // Reconnect inside the grace window: sticky selection finds the row
        assert_eq!(
            pool.select_backend("192.168.0.10").await.unwrap().as_deref(),
            Some("10.0.0.1")
        );
        let guard = registry.register("192.168.0.10:50001".parse().unwrap());
        assert!(pool.claim("10.0.0.1", "192.168.0.10").await.unwrap());
        guard.set_backend("10.0.0.1");

        let report = cleanup.tick_at(2_100).await;
        assert_eq!(report.freed, 0);
        assert_eq!(pool.backends().await.unwrap()[0].pending_since, None);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (cleanup, _pool, _registry) = setup().await;
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(cleanup.run(rx));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("cleanup loop should stop")
            .unwrap();
    }

    /// Store whose claims land only after `delay`.
    struct SlowClaimStore {
        inner: SqliteStore,
        delay: Duration,
    }

    #[async_trait]
    impl PoolStore for SlowClaimStore {
        async fn static_backend(&self, client: &str) -> Result<Option<String>, StoreError> {
            self.inner.static_backend(client).await
        }
        async fn claimed_backend(&self, client: &str) -> Result<Option<String>, StoreError> {
            self.inner.claimed_backend(client).await
        }
        async fn best_free_backend(&self) -> Result<Option<String>, StoreError> {
            self.inner.best_free_backend().await
        }
        async fn try_claim(&self, backend: &str, client: &str) -> Result<bool, StoreError> {
            tokio::time::sleep(self.delay).await;
            self.inner.try_claim(backend, client).await
        }
        async fn clear_claim(&self, backend: &str) -> Result<(), StoreError> {
            self.inner.clear_claim(backend).await
        }
        async fn clear_claim_of(&self, backend: &str, client: &str) -> Result<bool, StoreError> {
            self.inner.clear_claim_of(backend, client).await
        }
        async fn reconcile(
            &self,
            live: &HashSet<String>,
            now: i64,
            grace_secs: i64,
        ) -> Result<ReconcileOutcome, StoreError> {
            self.inner.reconcile(live, now, grace_secs).await
        }
        async fn backends(&self) -> Result<Vec<BackendRow>, StoreError> {
            self.inner.backends().await
        }
    }

    #[tokio::test]
    async fn test_reassert_racing_session_close_is_withdrawn() {
        let inner = SqliteStore::in_memory().await.unwrap();
        inner.upsert_backend("10.0.0.1", 1).await.unwrap();
        let pool = Arc::new(Pool::new(
            Arc::new(SlowClaimStore {
                inner,
                delay: Duration::from_millis(200),
            }),
            PoolConfig {
                grace_period: Duration::from_secs(10),
                ..PoolConfig::default()
            },
        ));
        let registry = SessionRegistry::new();
        let cleanup = Cleanup::new(
            pool.clone(),
            registry.clone(),
            Arc::new(RelayMetrics::new().unwrap()),
            Duration::from_secs(3),
        );

        let guard = registry.register("192.168.0.10:50000".parse().unwrap());
        assert!(pool.claim("10.0.0.1", "192.168.0.10").await.unwrap());
        guard.set_backend("10.0.0.1");

        // Session closes while the tick's re-assert is still pending
        let closing_pool = pool.clone();
        let close = async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            guard.clear_backend();
            closing_pool.release("10.0.0.1").await.unwrap();
            drop(guard);
        };
        let (report, ()) = tokio::join!(cleanup.tick_at(1_000), close);

        assert_eq!(report.reasserted, 0);
        assert_eq!(report.withdrawn, 1);
        assert_eq!(report.live_clients, 0);
        assert!(pool.backends().await.unwrap()[0].is_free());
        assert_eq!(
            pool.select_backend("192.168.0.99").await.unwrap().as_deref(),
            Some("10.0.0.1")
        );
    }
}
