//! Read-only status port
//!
//! Every connection receives one JSON document listing the live sessions and
//! is then closed. Nothing is read from the peer.

use std::time::Duration;

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::registry::{SessionInfo, SessionRegistry};

/// Pause after a failed accept, e.g. while out of file descriptors.
pub(crate) const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub proxy: Vec<SessionInfo>,
}

impl StatusReport {
    pub fn collect(registry: &SessionRegistry) -> Self {
        Self {
            proxy: registry.snapshot(),
        }
    }
}

/// Status service over an already bound listener
pub struct StatusService {
    listener: TcpListener,
    registry: SessionRegistry,
}

impl StatusService {
    pub fn new(listener: TcpListener, registry: SessionRegistry) -> Self {
        Self { listener, registry }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if let Ok(addr) = self.listener.local_addr() {
            info!("Status service listening on {}", addr);
        }

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (mut sock, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("Status accept failed: {}", e);
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                            continue;
                        }
                    };
                    let report = StatusReport::collect(&self.registry);
                    tokio::spawn(async move {
                        let body = match serde_json::to_vec(&report) {
                            Ok(body) => body,
                            Err(e) => {
                                debug!("Status encoding failed: {}", e);
                                return;
                            }
                        };
                        if let Err(e) = sock.write_all(&body).await {
                            debug!(peer = %peer, "Status write failed: {}", e);
                        }
                        let _ = sock.shutdown().await;
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
