// SPDX-FileCopyrightText: © 2025 Greenhouse Broker Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Targeted send (panel → sensor) and broadcast (sensor → panels) with
//! dead-stream pruning (`SPEC_FULL.md` §4.5).

use greenhouse_core::frame;
use greenhouse_core::protocol::Message;

use crate::registry::{ConnHandle, NodeRegistry};

/// Stateless routing operations over a [`NodeRegistry`].
///
/// `Router` carries no state of its own; every operation takes the
/// registry snapshot it needs, releases the registry lock, then performs
/// socket I/O — never holding the registry lock across a write (§5).
pub struct Router;

impl Router {
    /// Sends `message` to the sensor registered as `target_node_id`.
    ///
    /// If the target is absent or the write fails, sends an `ERROR` back to
    /// `origin` whose `message` field contains `not found` or `disconnected`
    /// (§4.5, §6.2). Returns the connection id to prune on write failure.
    pub async fn route(
        registry: &NodeRegistry,
        message: &Message,
        target_node_id: &str,
        origin: &ConnHandle,
    ) -> Option<u64> {
        let Some(target) = registry.find_sensor(target_node_id) else {
            let err = Message::error(format!("target node `{target_node_id}` not found"));
            Self::send_one(origin, &err).await;
            return None;
        };

        let Ok(payload) = message.encode() else {
            let err = Message::error(format!("target node `{target_node_id}` disconnected"));
            Self::send_one(origin, &err).await;
            return None;
        };

        let mut writer = target.writer.lock().await;
        if frame::write_frame(&mut *writer, &payload).await.is_err() {
            drop(writer);
            let err = Message::error(format!("target node `{target_node_id}` disconnected"));
            Self::send_one(origin, &err).await;
            return Some(target.connection_id);
        }
        None
    }

    /// Sends `message` to every connection in `audience`, continuing the
    /// fan-out past any individual write failure. Returns the connection
    /// ids that failed so the caller can prune them from the registry
    /// (§4.5).
    pub async fn broadcast(message: &Message, audience: &[ConnHandle]) -> Vec<u64> {
        let Ok(payload) = message.encode() else {
            tracing::error!("failed to encode broadcast message; dropping fan-out");
            return Vec::new();
        };

        let mut dead = Vec::new();
        for recipient in audience {
            let mut writer = recipient.writer.lock().await;
            if frame::write_frame(&mut *writer, &payload).await.is_err() {
                dead.push(recipient.connection_id);
            }
        }
        dead
    }

    /// Sends a single message to one connection, swallowing write errors —
    /// used for direct replies (`REGISTER_ACK`, `NODE_LIST`, `ERROR`) where
    /// the caller's read loop will observe and clean up a dead connection
    /// on its own next read (§4.3).
    pub async fn send_one(target: &ConnHandle, message: &Message) {
        if let Ok(payload) = message.encode() {
            let mut writer = target.writer.lock().await;
            let _ = frame::write_frame(&mut *writer, &payload).await;
        }
    }
}
