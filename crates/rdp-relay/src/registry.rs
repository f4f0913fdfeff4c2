//! Registry of live relay sessions

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

/// Session identifier
pub type SessionId = u64;

/// Registry entry for one session
#[derive(Debug, Clone)]
pub struct SessionEntry {
    /// Affinity key: the client's IP address, never its port.
    pub client: String,
    pub backend: Option<String>,
}

/// One line of the status snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub client: String,
    pub server: String,
}

#[derive(Default)]
struct Inner {
    sessions: DashMap<SessionId, SessionEntry>,
    next_id: AtomicU64,
}

/// Concurrency-safe set of running sessions, shared by the listener,
/// the cleanup loop and the status service.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session. The entry lives as long as the returned guard.
    pub fn register(&self, client_addr: SocketAddr) -> SessionGuard {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let entry = SessionEntry {
            client: client_identity(&client_addr),
            backend: None,
        };
        self.inner.sessions.insert(id, entry);
        SessionGuard {
            registry: self.clone(),
            id,
        }
    }

    fn set_backend(&self, id: SessionId, backend: Option<String>) {
        if let Some(mut entry) = self.inner.sessions.get_mut(&id) {
            entry.backend = backend;
        }
    }

    /// Whether some live session still relays `client` to `backend`.
    pub fn holds(&self, backend: &str, client: &str) -> bool {
        self.inner.sessions.iter().any(|entry| {
            entry.client == client && entry.backend.as_deref() == Some(backend)
        })
    }

    /// `(backend, client)` for every session holding a backend.
    pub fn live_claims(&self) -> Vec<(String, String)> {
        self.inner
            .sessions
            .iter()
            .filter_map(|entry| {
                entry
                    .backend
                    .as_ref()
                    .map(|backend| (backend.clone(), entry.client.clone()))
            })
            .collect()
    }

    /// Client identities of every session holding a backend.
    pub fn live_clients(&self) -> HashSet<String> {
        self.live_claims().into_iter().map(|(_, client)| client).collect()
    }

    /// Status snapshot, ordered by client then backend.
    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .live_claims()
            .into_iter()
            .map(|(server, client)| SessionInfo { client, server })
            .collect();
        sessions.sort_by(|a, b| a.client.cmp(&b.client).then_with(|| a.server.cmp(&b.server)));
        sessions
    }

    /// Number of registered sessions, assigned or not
    pub fn count(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn assigned_count(&self) -> usize {
        self.inner
            .sessions
            .iter()
            .filter(|entry| entry.backend.is_some())
            .count()
    }
}

/// Keeps a session registered; deregisters on drop, including on panic.
pub struct SessionGuard {
    registry: SessionRegistry,
    id: SessionId,
}

impl SessionGuard {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn set_backend(&self, backend: &str) {
        self.registry.set_backend(self.id, Some(backend.to_string()));
    }

    pub fn clear_backend(&self) {
        self.registry.set_backend(self.id, None);
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.inner.sessions.remove(&self.id);
    }
}

/// Affinity key for a client socket address.
///
/// IPv4 clients accepted on a dual-stack socket are keyed by their plain
/// IPv4 form so they match rows provisioned as dotted quads.
pub fn client_identity(addr: &SocketAddr) -> String {
    match addr.ip() {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.to_string(),
        },
        ip => ip.to_string(),
    }
}
