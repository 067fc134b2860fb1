// SPDX-FileCopyrightText: © 2025 Greenhouse Broker Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Accepts TCP connections, spawns [`crate::connection::run`] per connection,
//! and orchestrates graceful shutdown (`SPEC_FULL.md` §4.6).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;

use greenhouse_core::error::BrokerError;

use crate::connection;
use crate::registry::NodeRegistry;

/// The IANA user-port range the listen port must fall within (§4.6, §6.3).
pub const MIN_PORT: u16 = 1024;
pub const MAX_PORT: u16 = 49151;

/// Bounded grace period `serve` waits for in-flight connections to finish
/// their cleanup after a shutdown signal, before returning (§4.6).
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Validates a listen port against the IANA user-port range (§4.6).
///
/// Port `0` ("let the OS assign an ephemeral port") is always accepted;
/// it is never a real configured listen port and is how tests bind a
/// throwaway server.
pub fn validate_port(port: u16) -> Result<(), BrokerError> {
    if port == 0 || (MIN_PORT..=MAX_PORT).contains(&port) {
        Ok(())
    } else {
        Err(BrokerError::Config(format!("port {port} is outside the allowed range {MIN_PORT}..={MAX_PORT}")))
    }
}

/// A cloneable handle that requests graceful shutdown of a running
/// [`BrokerServer::serve`] loop.
#[derive(Clone)]
pub struct ShutdownTrigger(watch::Sender<bool>);

impl ShutdownTrigger {
    /// Signals every connection's read loop to terminate at its next I/O
    /// boundary and the accept loop to stop accepting (§4.6).
    pub fn shutdown(&self) {
        let _ = self.0.send(true);
    }
}

/// Binds a listening socket and owns the shared registry for this broker
/// instance.
pub struct BrokerServer {
    listener: TcpListener,
    registry: Arc<NodeRegistry>,
    heartbeat_period: Duration,
    shutdown_tx: watch::Sender<bool>,
}

impl BrokerServer {
    /// Binds `addr`, validating its port against the IANA user-port range
    /// before attempting the bind (§4.6, §6.3).
    pub async fn bind(addr: SocketAddr, heartbeat_period: Duration) -> Result<Self, BrokerError> {
        validate_port(addr.port())?;
        let listener = TcpListener::bind(addr).await?;
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self { listener, registry: Arc::new(NodeRegistry::new()), heartbeat_period, shutdown_tx })
    }

    /// The bound local address (useful in tests that bind to port 0).
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// The shared registry this server's connections register into.
    #[must_use]
    pub fn registry(&self) -> Arc<NodeRegistry> {
        self.registry.clone()
    }

    /// A cloneable trigger that, once fired, causes [`Self::serve`] to stop
    /// accepting and every live connection to close.
    #[must_use]
    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        ShutdownTrigger(self.shutdown_tx.clone())
    }

    /// Runs the accept loop until shutdown is triggered, spawning one task
    /// per accepted connection (§4.6). Returns once every connection has
    /// finished its cleanup or the grace period elapses.
    pub async fn serve(self) {
        let Self { listener, registry, heartbeat_period, shutdown_tx } = self;
        let mut shutdown_rx = shutdown_tx.subscribe();
        let next_connection_id = AtomicU64::new(1);
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        tracing::info!("shutdown triggered, no longer accepting connections");
                        break;
                    }
                }

                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            let connection_id = next_connection_id.fetch_add(1, Ordering::Relaxed);
                            let registry = registry.clone();
                            let conn_shutdown_rx = shutdown_rx.clone();
                            tracing::info!(connection_id, %addr, "accepted connection");
                            let (read_half, write_half) = stream.into_split();
                            tasks.spawn(connection::run(
                                connection_id,
                                read_half,
                                write_half,
                                registry,
                                heartbeat_period,
                                conn_shutdown_rx,
                            ));
                        },
                        Err(e) => tracing::warn!(error = %e, "failed to accept connection"),
                    }
                }
            }
        }

        let drain = async {
            while tasks.join_next().await.is_some() {}
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            tracing::warn!("shutdown grace period elapsed with connections still closing");
        }
    }
}
