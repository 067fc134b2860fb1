// SPDX-FileCopyrightText: © 2025 Greenhouse Broker Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Wires a loaded [`BrokerConfig`] to a running [`greenhouse_broker::BrokerServer`],
//! including signal-driven graceful shutdown (`SPEC_FULL.md` §4.6).

use std::time::Duration;

use anyhow::Context;
use greenhouse_broker::BrokerServer;
use tracing::info;

use crate::config::BrokerConfig;

/// Binds and serves the broker until a `SIGINT`/`SIGTERM` is received, then
/// drains in-flight connections before returning.
///
/// # Errors
///
/// Returns an error if `listen_addr` doesn't parse as a socket address or
/// the listener fails to bind (e.g. the port is already in use or outside
/// the allowed range).
pub async fn run(config: &BrokerConfig) -> anyhow::Result<()> {
    let addr = config
        .listen_addr
        .parse()
        .with_context(|| format!("invalid listen_addr `{}`", config.listen_addr))?;
    let heartbeat_period = Duration::from_secs(config.heartbeat_period_secs);

    let server = BrokerServer::bind(addr, heartbeat_period)
        .await
        .with_context(|| format!("failed to bind listener on `{addr}`"))?;
    info!(local_addr = %server.local_addr().context("bound listener has no local address")?, "listening");

    let shutdown_trigger = server.shutdown_trigger();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        shutdown_trigger.shutdown();
    });

    server.serve().await;
    info!("shutdown complete");
    Ok(())
}

/// Resolves once a `Ctrl+C` or (on Unix) `SIGTERM` is received.
///
/// # Panics
///
/// Panics if the OS signal handlers themselves cannot be installed — a
/// condition that indicates a broken process environment, not a recoverable
/// runtime error.
#[allow(clippy::expect_used)]
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received CTRL-C, initiating graceful shutdown"),
        () = terminate => info!("received SIGTERM, initiating graceful shutdown"),
    }
}
