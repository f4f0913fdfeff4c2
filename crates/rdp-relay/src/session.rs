//! Per-connection relay worker
//!
//! A session moves through `Connecting -> Relaying -> Closed`. While
//! connecting it asks the pool for a backend, dials it and claims it. If any
//! of that fails the session stays on the client socket alone and answers an
//! RDP connection request with a fixed decline frame. Whatever happens, the
//! session ends in [`RelaySession::close`], which closes both sockets and
//! releases the claimed backend.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::metrics::RelayMetrics;
use crate::pool::Pool;
use crate::registry::{client_identity, SessionGuard, SessionRegistry};

/// TPKT version byte opening every RDP connection request.
pub const TPKT_VERSION: u8 = 0x03;

/// Reply sent to an RDP client when no backend can take it: a TPKT header
/// for an 11-byte frame followed by an X.224 disconnect request.
pub const DECLINE_FRAME: [u8; 11] = [
    0x03, 0x00, 0x00, 0x0b, // TPKT: version 3, length 11
    0x06, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00, // X.224 DR
];

pub const DEFAULT_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Error)]
enum RelayError {
    #[error("client read failed: {0}")]
    ClientRead(#[source] std::io::Error),
    #[error("client write failed: {0}")]
    ClientWrite(#[source] std::io::Error),
    #[error("backend read failed: {0}")]
    BackendRead(#[source] std::io::Error),
    #[error("backend write failed: {0}")]
    BackendWrite(#[source] std::io::Error),
}

impl RelayError {
    fn end_reason(&self) -> EndReason {
        match self {
            RelayError::ClientRead(_) | RelayError::ClientWrite(_) => EndReason::ClientError,
            RelayError::BackendRead(_) | RelayError::BackendWrite(_) => EndReason::BackendError,
        }
    }
}

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Relaying { assigned: bool },
    Closed,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    ClientClosed,
    BackendClosed,
    ClientError,
    BackendError,
    /// No backend; the decline frame was sent.
    Declined,
    /// No backend and the client did not open with an RDP request.
    Rejected,
}

/// Everything a session needs from the server, cheap to clone per accept.
#[derive(Clone)]
pub struct SessionContext {
    pub pool: Arc<Pool>,
    pub registry: SessionRegistry,
    pub metrics: Arc<RelayMetrics>,
    pub buffer_size: usize,
}

struct Backend {
    address: String,
    stream: Option<TcpStream>,
}

/// One client connection and, once assigned, its backend connection.
pub struct RelaySession {
    client: Option<TcpStream>,
    client_addr: SocketAddr,
    identity: String,
    backend: Option<Backend>,
    state: SessionState,
    ctx: SessionContext,
    guard: SessionGuard,
    started_at: Instant,
}

impl RelaySession {
    /// Register the session and try to assign a backend.
    pub async fn open(client: TcpStream, client_addr: SocketAddr, ctx: SessionContext) -> Self {
        let guard = ctx.registry.register(client_addr);
        ctx.metrics.record_session_accepted();

        let mut session = Self {
            client: Some(client),
            client_addr,
            identity: client_identity(&client_addr),
            backend: None,
            state: SessionState::Connecting,
            ctx,
            guard,
            started_at: Instant::now(),
        };
        session.assign().await;
        session
    }

    /// Open, relay until either side stops, then close.
    pub async fn run(mut self) -> EndReason {
        let reason = self.relay().await;
        debug!(
            session = self.guard.id(),
            client = %self.client_addr,
            ?reason,
            "Relay loop finished"
        );
        self.close().await;
        reason
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn backend(&self) -> Option<&str> {
        self.backend.as_ref().map(|b| b.address.as_str())
    }

    async fn assign(&mut self) {
        let pool = self.ctx.pool.clone();

        let address = match pool.select_backend(&self.identity).await {
            Ok(Some(address)) => address,
            Ok(None) => {
                info!(client = %self.client_addr, "No backend available");
                self.state = SessionState::Relaying { assigned: false };
                return;
            }
            Err(e) => {
                warn!(client = %self.client_addr, "Backend selection failed: {}", e);
                self.ctx.metrics.record_store_error();
                self.state = SessionState::Relaying { assigned: false };
                return;
            }
        };

        let stream = match pool.connect(&address).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(client = %self.client_addr, backend = %address, "Backend connect failed: {}", e);
                self.ctx.metrics.record_connect_failure();
                self.state = SessionState::Relaying { assigned: false };
                return;
            }
        };

        match pool.claim(&address, &self.identity).await {
            Ok(true) => {}
            Ok(false) => {
                info!(
                    client = %self.client_addr,
                    backend = %address,
                    "Backend claimed by another client"
                );
                self.ctx.metrics.record_claim_lost();
                drop(stream);
                self.state = SessionState::Relaying { assigned: false };
                return;
            }
            Err(e) => {
                // Relay anyway; cleanup re-asserts the claim on its next tick.
                warn!(backend = %address, "Claim bookkeeping skipped: {}", e);
                self.ctx.metrics.record_store_error();
            }
        }

        info!(
            session = self.guard.id(),
            client = %self.client_addr,
            backend = %address,
            "Relaying"
        );
        self.guard.set_backend(&address);
        self.ctx.metrics.record_session_assigned();
        self.backend = Some(Backend {
            address,
            stream: Some(stream),
        });
        self.state = SessionState::Relaying { assigned: true };
    }

    /// Pump bytes (assigned) or answer the first client chunk (unassigned).
    pub async fn relay(&mut self) -> EndReason {
        let buffer_size = self.ctx.buffer_size.max(1);
        let metrics = self.ctx.metrics.clone();

        let Some(client) = self.client.as_mut() else {
            return EndReason::ClientClosed;
        };

        match self.backend.as_mut().and_then(|b| b.stream.as_mut()) {
            Some(backend) => match pump(client, backend, buffer_size, &metrics).await {
                Ok(reason) => reason,
                Err(e) => {
                    debug!(client = %self.client_addr, "Relay ended: {}", e);
                    e.end_reason()
                }
            },
            None => {
                let reason = decline(client, buffer_size).await;
                if reason == EndReason::Declined {
                    metrics.record_declined();
                }
                reason
            }
        }
    }

    /// Close both sockets and release the backend. Safe to call repeatedly.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        let assigned = matches!(self.state, SessionState::Relaying { assigned: true });
        self.state = SessionState::Closed;

        if let Some(mut client) = self.client.take() {
            let _ = client.shutdown().await;
        }

        if let Some(mut backend) = self.backend.take() {
            if let Some(mut stream) = backend.stream.take() {
                let _ = stream.shutdown().await;
            }
            self.guard.clear_backend();
            if let Err(e) = self.ctx.pool.release(&backend.address).await {
                warn!(backend = %backend.address, "Release failed, cleanup will reclaim: {}", e);
                self.ctx.metrics.record_store_error();
            }
        }

        self.ctx
            .metrics
            .record_session_finished(assigned, self.started_at.elapsed());
    }
}

/// Forward bytes both ways until one side closes or errors.
///
/// Each direction runs its own read/write loop, so a write stalled on one
/// leg never stops the other leg from being read.
async fn pump(
    client: &mut TcpStream,
    backend: &mut TcpStream,
    buffer_size: usize,
    metrics: &RelayMetrics,
) -> Result<EndReason, RelayError> {
    let (mut client_rd, mut client_wr) = client.split();
    let (mut backend_rd, mut backend_wr) = backend.split();

    let upstream = async {
        let mut buf = vec![0u8; buffer_size];
        loop {
            let n = client_rd.read(&mut buf).await.map_err(RelayError::ClientRead)?;
            if n == 0 {
                return Ok::<_, RelayError>(EndReason::ClientClosed);
            }
            backend_wr
                .write_all(&buf[..n])
                .await
                .map_err(RelayError::BackendWrite)?;
            metrics.record_forward(n);
        }
    };

    let downstream = async {
        let mut buf = vec![0u8; buffer_size];
        loop {
            let n = backend_rd.read(&mut buf).await.map_err(RelayError::BackendRead)?;
            if n == 0 {
                return Ok::<_, RelayError>(EndReason::BackendClosed);
            }
            client_wr
                .write_all(&buf[..n])
                .await
                .map_err(RelayError::ClientWrite)?;
            metrics.record_forward(n);
        }
    };

    tokio::select! {
        result = upstream => result,
        result = downstream => result,
    }
}

/// Read one chunk from an unassigned client and answer an RDP request with
/// the decline frame. Anything else gets no reply.
async fn decline(client: &mut TcpStream, buffer_size: usize) -> EndReason {
    let mut buf = vec![0u8; buffer_size];
    match client.read(&mut buf).await {
        Ok(0) => EndReason::ClientClosed,
        Ok(_) if buf[0] == TPKT_VERSION => {
            if let Err(e) = client.write_all(&DECLINE_FRAME).await {
                debug!("Decline frame not delivered: {}", e);
                return EndReason::ClientError;
            }
            EndReason::Declined
        }
        Ok(_) => EndReason::Rejected,
        Err(e) => {
            debug!("Unassigned client read failed: {}", e);
            EndReason::ClientError
        }
    }
}
