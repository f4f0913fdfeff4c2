//! rdp-relay: transparent TCP relay for RDP
//!
//! Each client is pinned to one backend from a weighted pool. Claims are
//! persisted in SQLite so a returning client lands on the same machine, and
//! a background loop expires claims whose sessions have gone away.

pub mod admin;
pub mod cleanup;
pub mod config;
pub mod metrics;
pub mod pool;
pub mod registry;
pub mod server;
pub mod session;
pub mod status;
pub mod store;

pub use cleanup::{Cleanup, TickReport};
pub use config::{ConfigError, ServerConfig};
pub use metrics::RelayMetrics;
pub use pool::{Pool, PoolConfig, SelectionSource};
pub use registry::{SessionGuard, SessionInfo, SessionRegistry};
pub use server::RelayServer;
pub use session::{EndReason, RelaySession, SessionContext, SessionState, DECLINE_FRAME};
pub use store::{BackendRow, PoolStore, SqliteStore, StoreError};
