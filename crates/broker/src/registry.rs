// SPDX-FileCopyrightText: © 2025 Greenhouse Broker Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The authoritative map of registered sensor nodes and control panels
//! (`SPEC_FULL.md` §4.4).
//!
//! Backed by a `std::sync::RwLock`: mutations take the write lock,
//! broadcast/snapshot reads take the read lock and copy the audience out
//! before any socket I/O happens, so the lock is never held across an
//! `.await` (§5).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::io::AsyncWrite;
use tokio::sync::Mutex as AsyncMutex;

use greenhouse_core::protocol::NodeDescriptor;

/// A boxed, type-erased async writer half so the registry and router don't
/// need to be generic over the concrete socket type (production: the write
/// half of a `TcpStream`; tests: one end of a `tokio::io::duplex` pipe).
pub type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// A connection's outbound half plus the identity used to prune it.
///
/// Writes are serialized through the `Mutex` so a broadcast and a direct
/// reply can never interleave bytes within a single frame (§4.3, §5).
#[derive(Clone)]
pub struct ConnHandle {
    pub connection_id: u64,
    pub writer: Arc<AsyncMutex<BoxedWriter>>,
}

/// Result of a registration attempt (§4.4).
#[derive(Debug, PartialEq, Eq)]
pub enum RegisterOutcome {
    Ok,
    /// A sensor/panel with this id is already registered; the newcomer is
    /// rejected and the existing entry is preserved (the conservative
    /// policy pinned in `spec.md` §9).
    Collision,
}

struct Entry {
    connection_id: u64,
    handle: ConnHandle,
    sensor_keys: Vec<String>,
    actuator_keys: Vec<String>,
}

#[derive(Default)]
struct Inner {
    sensors: HashMap<String, Entry>,
    panels: HashMap<String, Entry>,
}

/// The broker's shared, thread-safe node/panel registry.
#[derive(Default)]
pub struct NodeRegistry {
    inner: RwLock<Inner>,
}

impl NodeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a sensor node, or returns [`RegisterOutcome::Collision`]
    /// if `node_id` is already registered (§4.4).
    pub fn register_sensor(
        &self,
        node_id: &str,
        handle: ConnHandle,
        sensor_keys: Vec<String>,
        actuator_keys: Vec<String>,
    ) -> RegisterOutcome {
        let mut inner = self.inner.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        if inner.sensors.contains_key(node_id) {
            return RegisterOutcome::Collision;
        }
        inner.sensors.insert(
            node_id.to_string(),
            Entry { connection_id: handle.connection_id, handle, sensor_keys, actuator_keys },
        );
        RegisterOutcome::Ok
    }

    /// Registers a control panel, or returns [`RegisterOutcome::Collision`]
    /// if `panel_id` is already registered (§4.4).
    pub fn register_panel(&self, panel_id: &str, handle: ConnHandle) -> RegisterOutcome {
        let mut inner = self.inner.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        if inner.panels.contains_key(panel_id) {
            return RegisterOutcome::Collision;
        }
        inner.panels.insert(
            panel_id.to_string(),
            Entry { connection_id: handle.connection_id, handle, sensor_keys: Vec::new(), actuator_keys: Vec::new() },
        );
        RegisterOutcome::Ok
    }

    /// Removes any entry (sensor or panel) bound to `connection_id`.
    /// Idempotent: removing an already-absent connection is a no-op (§4.4).
    pub fn unregister(&self, connection_id: u64) {
        let mut inner = self.inner.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.sensors.retain(|_, e| e.connection_id != connection_id);
        inner.panels.retain(|_, e| e.connection_id != connection_id);
    }

    /// Removes registry entries whose connection id is in `dead`, used by
    /// the router to prune connections that failed mid-broadcast (§4.5).
    pub fn prune(&self, dead: &[u64]) {
        if dead.is_empty() {
            return;
        }
        let mut inner = self.inner.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.sensors.retain(|_, e| !dead.contains(&e.connection_id));
        inner.panels.retain(|_, e| !dead.contains(&e.connection_id));
    }

    /// A snapshot of currently registered sensor nodes, used to answer
    /// `NODE_LIST` (§4.4). Ordering is unspecified.
    #[must_use]
    pub fn snapshot_nodes(&self) -> Vec<NodeDescriptor> {
        let inner = self.inner.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner
            .sensors
            .iter()
            .map(|(node_id, e)| NodeDescriptor {
                node_id: node_id.clone(),
                sensor_keys: e.sensor_keys.clone(),
                actuator_keys: e.actuator_keys.clone(),
            })
            .collect()
    }

    /// Looks up the connection handle for a registered sensor by node id (§4.4).
    #[must_use]
    pub fn find_sensor(&self, node_id: &str) -> Option<ConnHandle> {
        let inner = self.inner.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.sensors.get(node_id).map(|e| e.handle.clone())
    }

    /// A shallow copy of all currently registered panels' handles, safe to
    /// iterate after the read lock is released (§4.4, §5).
    #[must_use]
    pub fn panels(&self) -> Vec<ConnHandle> {
        let inner = self.inner.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.panels.values().map(|e| e.handle.clone()).collect()
    }
}

/// Wraps any boxed async writer as a fresh [`ConnHandle`] for `connection_id`.
#[must_use]
pub fn handle_for(connection_id: u64, writer: BoxedWriter) -> ConnHandle {
    ConnHandle { connection_id, writer: Arc::new(AsyncMutex::new(writer)) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_handle(connection_id: u64) -> ConnHandle {
        let (_a, b) = tokio::io::duplex(64);
        let (_r, w) = tokio::io::split(b);
        handle_for(connection_id, Box::new(w))
    }

    #[test]
    fn duplicate_sensor_registration_is_rejected() {
        let registry = NodeRegistry::new();
        assert_eq!(
            registry.register_sensor("dev-1", dummy_handle(1), vec![], vec![]),
            RegisterOutcome::Ok
        );
        assert_eq!(
            registry.register_sensor("dev-1", dummy_handle(2), vec![], vec![]),
            RegisterOutcome::Collision
        );
        // The original entry survives the collision.
        assert!(registry.find_sensor("dev-1").is_some());
    }

    #[test]
    fn unregister_is_idempotent_and_matches_by_connection() {
        let registry = NodeRegistry::new();
        registry.register_sensor("dev-1", dummy_handle(1), vec![], vec![]);
        registry.unregister(1);
        registry.unregister(1);
        assert!(registry.find_sensor("dev-1").is_none());
    }

    #[test]
    fn prune_removes_only_listed_connections() {
        let registry = NodeRegistry::new();
        registry.register_panel("ui-1", dummy_handle(10));
        registry.register_panel("ui-2", dummy_handle(20));
        registry.prune(&[10]);
        assert_eq!(registry.panels().len(), 1);
    }

    #[test]
    fn snapshot_nodes_reflects_registered_sensors() {
        let registry = NodeRegistry::new();
        registry.register_sensor("dev-1", dummy_handle(1), vec!["temp".into()], vec!["fan".into()]);
        let snapshot = registry.snapshot_nodes();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].node_id, "dev-1");
        assert_eq!(snapshot[0].sensor_keys, vec!["temp".to_string()]);
    }
}
