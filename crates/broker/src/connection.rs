// SPDX-FileCopyrightText: © 2025 Greenhouse Broker Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The per-connection read loop and registration state machine
//! (`SPEC_FULL.md` §4.3).
//!
//! One [`run`] task per accepted TCP connection. A single cooperative read
//! loop drives the state machine in §4.3's table; writes (including a
//! concurrent `Router` broadcast) are serialized through the connection's
//! shared writer lock so a broadcast and a direct reply can never
//! interleave bytes within one frame.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;

use greenhouse_core::error::BrokerError;
use greenhouse_core::frame;
use greenhouse_core::protocol::{role, Message, MessageType};

use crate::heartbeat;
use crate::registry::{handle_for, BoxedWriter, ConnHandle, NodeRegistry, RegisterOutcome};
use crate::router::Router;

/// Window within which more than `PROTOCOL_ERROR_LIMIT` protocol errors
/// cause the connection to be dropped at the implementation's discretion
/// (§7).
const PROTOCOL_ERROR_WINDOW: Duration = Duration::from_secs(60);
const PROTOCOL_ERROR_LIMIT: usize = 10;

/// Registration state for one connection (§4.3's state table).
enum ConnState {
    New,
    RegisteredSensor { node_id: String },
    RegisteredPanel { panel_id: String },
}

/// Runs one connection's read loop to completion, then performs the
/// idempotent cleanup described in §4.3: mark closing, remove any
/// registry entry, broadcast `NODE_DISCONNECTED` if it was a sensor, and
/// let the caller close the socket by dropping the returned handles.
pub async fn run<R, W>(
    connection_id: u64,
    mut reader: R,
    writer: W,
    registry: Arc<NodeRegistry>,
    heartbeat_period: Duration,
    mut shutdown: watch::Receiver<bool>,
) where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let boxed: BoxedWriter = Box::new(writer);
    let own_handle = handle_for(connection_id, boxed);

    let mut state = ConnState::New;
    let mut protocol_errors: Vec<Instant> = Vec::new();
    let dead_interval = heartbeat::dead_interval(heartbeat_period);

    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    tracing::debug!(connection_id, "shutdown signaled, closing connection");
                    break;
                }
            }

            read_result = tokio::time::timeout(dead_interval, frame::read_frame(&mut reader)) => {
                match read_result {
                    Err(_elapsed) => {
                        tracing::debug!(connection_id, "heartbeat timeout, closing connection");
                        break;
                    }
                    Ok(Err(e)) => {
                        tracing::debug!(connection_id, error = %e, "connection read loop ending");
                        break;
                    }
                    Ok(Ok(payload)) => {
                        if !handle_frame(
                            connection_id,
                            &payload,
                            &mut state,
                            &registry,
                            &own_handle,
                            &mut protocol_errors,
                        ).await {
                            break;
                        }
                    }
                }
            }
        }
    }

    cleanup(connection_id, &state, &registry).await;
}

/// Parses and dispatches one frame. Returns `false` when the connection
/// should be torn down (too many protocol errors), `true` to keep reading.
async fn handle_frame(
    connection_id: u64,
    payload: &[u8],
    state: &mut ConnState,
    registry: &NodeRegistry,
    own_handle: &ConnHandle,
    protocol_errors: &mut Vec<Instant>,
) -> bool {
    let message = match Message::parse(payload) {
        Ok(m) => m,
        Err(e) => {
            Router::send_one(own_handle, &Message::error(e.to_string())).await;
            return !record_protocol_error(protocol_errors);
        },
    };

    match dispatch(connection_id, &message, state, registry, own_handle).await {
        Ok(()) => true,
        Err(e) if e.is_fatal() => {
            tracing::warn!(connection_id, error = %e, "fatal error on connection");
            false
        },
        Err(e) => {
            Router::send_one(own_handle, &Message::error(e.to_string())).await;
            !record_protocol_error(protocol_errors)
        },
    }
}

/// Records a protocol error and reports whether the per-minute limit has
/// now been exceeded (§7: "> 10 within a minute may terminate the
/// connection").
fn record_protocol_error(errors: &mut Vec<Instant>) -> bool {
    let now = Instant::now();
    errors.retain(|t| now.duration_since(*t) < PROTOCOL_ERROR_WINDOW);
    errors.push(now);
    errors.len() > PROTOCOL_ERROR_LIMIT
}

async fn dispatch(
    connection_id: u64,
    message: &Message,
    state: &mut ConnState,
    registry: &NodeRegistry,
    own_handle: &ConnHandle,
) -> Result<(), BrokerError> {
    match (&state, message.message_type) {
        (ConnState::New, MessageType::RegisterNode) => {
            register_sensor(connection_id, message, registry, own_handle).await.map(|node_id| {
                *state = ConnState::RegisteredSensor { node_id };
            })
        },
        (ConnState::New, MessageType::RegisterControlPanel) => {
            register_panel(message, registry, own_handle).await.map(|panel_id| {
                *state = ConnState::RegisteredPanel { panel_id };
            })
        },
        (ConnState::New, MessageType::Heartbeat) => Ok(()),
        (ConnState::New, _) => Err(BrokerError::Protocol("must register before sending this message".into())),

        (ConnState::RegisteredSensor { .. }, MessageType::RegisterNode | MessageType::RegisterControlPanel) => {
            Err(BrokerError::Protocol("connection is already registered".into()))
        },
        (ConnState::RegisteredSensor { .. }, mt) if mt.is_panel_broadcast() => {
            let dead = Router::broadcast(message, &registry.panels()).await;
            registry.prune(&dead);
            Ok(())
        },
        (ConnState::RegisteredSensor { .. }, MessageType::Heartbeat) => Ok(()),
        (ConnState::RegisteredSensor { .. }, _) => {
            Err(BrokerError::Protocol("message type not valid for a registered sensor".into()))
        },

        (ConnState::RegisteredPanel { .. }, MessageType::RegisterNode | MessageType::RegisterControlPanel) => {
            Err(BrokerError::Protocol("connection is already registered".into()))
        },
        (ConnState::RegisteredPanel { .. }, MessageType::ActuatorCommand) => {
            let target_node = message.require_str("targetNode")?;
            if let Some(dead_id) = Router::route(registry, message, &target_node, own_handle).await {
                registry.prune(&[dead_id]);
            }
            Ok(())
        },
        (ConnState::RegisteredPanel { .. }, MessageType::Heartbeat) => Ok(()),
        (ConnState::RegisteredPanel { .. }, _) => {
            Err(BrokerError::Protocol("message type not valid for a registered panel".into()))
        },
    }
}

async fn register_sensor(
    connection_id: u64,
    message: &Message,
    registry: &NodeRegistry,
    own_handle: &ConnHandle,
) -> Result<String, BrokerError> {
    let role = message.require_str("role")?;
    if role != role::SENSOR_NODE {
        return Err(BrokerError::Protocol(format!("REGISTER_NODE requires role={}", role::SENSOR_NODE)));
    }
    let node_id = message.require_str("nodeId")?;
    let sensor_keys = string_array(message, "sensorKeys");
    let actuator_keys = string_array(message, "actuatorKeys");

    // Hold this connection's writer lock across the registry insert: once
    // inserted, a panel's routed ACTUATOR_COMMAND could reach this socket
    // before our own REGISTER_ACK does. REGISTER_ACK must be the first
    // frame out (§8).
    let mut writer = own_handle.writer.lock().await;
    match registry.register_sensor(&node_id, own_handle.clone(), sensor_keys, actuator_keys) {
        RegisterOutcome::Collision => {
            drop(writer);
            Err(BrokerError::Protocol(format!("sensor `{node_id}` is already registered")))
        },
        RegisterOutcome::Ok => {
            if let Ok(ack) = Message::register_ack(&node_id, "registered").encode() {
                let _ = frame::write_frame(&mut *writer, &ack).await;
            }
            drop(writer);
            let dead = Router::broadcast(&Message::node_connected(&node_id), &registry.panels()).await;
            registry.prune(&dead);
            tracing::info!(connection_id, node_id = %node_id, "sensor node registered");
            Ok(node_id)
        },
    }
}

async fn register_panel(
    message: &Message,
    registry: &NodeRegistry,
    own_handle: &ConnHandle,
) -> Result<String, BrokerError> {
    let role = message.require_str("role")?;
    if role != role::CONTROL_PANEL {
        return Err(BrokerError::Protocol(format!("REGISTER_CONTROL_PANEL requires role={}", role::CONTROL_PANEL)));
    }
    let panel_id = message.require_str("nodeId")?;

    // Hold this connection's writer lock across the registry insert: once
    // inserted, this panel is part of registry.panels() and a concurrently
    // registering sensor could broadcast NODE_CONNECTED to it before our own
    // REGISTER_ACK/NODE_LIST are written. Both must precede any such event
    // (§8).
    let mut writer = own_handle.writer.lock().await;
    match registry.register_panel(&panel_id, own_handle.clone()) {
        RegisterOutcome::Collision => {
            drop(writer);
            Err(BrokerError::Protocol(format!("panel `{panel_id}` is already registered")))
        },
        RegisterOutcome::Ok => {
            if let Ok(ack) = Message::register_ack(&panel_id, "registered").encode() {
                let _ = frame::write_frame(&mut *writer, &ack).await;
            }
            let snapshot = registry.snapshot_nodes();
            if let Ok(list) = Message::node_list(&snapshot).encode() {
                let _ = frame::write_frame(&mut *writer, &list).await;
            }
            drop(writer);
            Ok(panel_id)
        },
    }
}

fn string_array(message: &Message, key: &str) -> Vec<String> {
    message
        .fields
        .get(key)
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

async fn cleanup(connection_id: u64, state: &ConnState, registry: &NodeRegistry) {
    registry.unregister(connection_id);
    if let ConnState::RegisteredSensor { node_id } = state {
        let dead = Router::broadcast(&Message::node_disconnected(node_id), &registry.panels()).await;
        registry.prune(&dead);
        tracing::info!(connection_id, node_id = %node_id, "sensor node disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::split;

    fn spawn_connection(
        connection_id: u64,
        registry: Arc<NodeRegistry>,
    ) -> (tokio::io::DuplexStream, watch::Sender<bool>) {
        let (server_side, client_side) = tokio::io::duplex(8192);
        let (server_read, server_write) = split(server_side);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(run(connection_id, server_read, server_write, registry, Duration::from_secs(30), shutdown_rx));
        (client_side, shutdown_tx)
    }

    #[tokio::test]
    async fn register_ack_is_first_frame_sent_to_sensor() {
        let registry = Arc::new(NodeRegistry::new());
        let (mut client, _shutdown) = spawn_connection(1, registry);

        frame::write_frame(&mut client, &Message::parse(br#"{"type":"REGISTER_NODE","role":"SENSOR_NODE","nodeId":"dev-1"}"#).unwrap().encode().unwrap()).await.unwrap();

        let reply = frame::read_frame(&mut client).await.unwrap();
        let reply = Message::parse(&reply).unwrap();
        assert!(matches!(reply.message_type, MessageType::RegisterAck));
        assert_eq!(reply.field_str("nodeId").as_deref(), Some("dev-1"));
    }

    #[tokio::test]
    async fn panel_receives_node_list_after_register_ack() {
        let registry = Arc::new(NodeRegistry::new());
        let (mut client, _shutdown) = spawn_connection(1, registry);

        frame::write_frame(&mut client, &Message::parse(br#"{"type":"REGISTER_CONTROL_PANEL","role":"CONTROL_PANEL","nodeId":"ui-1"}"#).unwrap().encode().unwrap()).await.unwrap();

        let ack = Message::parse(&frame::read_frame(&mut client).await.unwrap()).unwrap();
        assert!(matches!(ack.message_type, MessageType::RegisterAck));
        let list = Message::parse(&frame::read_frame(&mut client).await.unwrap()).unwrap();
        assert!(matches!(list.message_type, MessageType::NodeList));
    }

    #[tokio::test]
    async fn data_before_registration_is_a_protocol_error_not_a_disconnect() {
        let registry = Arc::new(NodeRegistry::new());
        let (mut client, _shutdown) = spawn_connection(1, registry);

        frame::write_frame(&mut client, &Message::parse(br#"{"type":"SENSOR_DATA","nodeId":"dev-1","sensorKey":"temp","value":"1"}"#).unwrap().encode().unwrap()).await.unwrap();
        let reply = Message::parse(&frame::read_frame(&mut client).await.unwrap()).unwrap();
        assert!(matches!(reply.message_type, MessageType::Error));

        // The connection should still be alive: a valid registration now succeeds.
        frame::write_frame(&mut client, &Message::parse(br#"{"type":"REGISTER_NODE","role":"SENSOR_NODE","nodeId":"dev-1"}"#).unwrap().encode().unwrap()).await.unwrap();
        let ack = Message::parse(&frame::read_frame(&mut client).await.unwrap()).unwrap();
        assert!(matches!(ack.message_type, MessageType::RegisterAck));
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected_with_error() {
        let registry = Arc::new(NodeRegistry::new());
        let (mut client, _shutdown) = spawn_connection(1, registry);

        let register = Message::parse(br#"{"type":"REGISTER_NODE","role":"SENSOR_NODE","nodeId":"dev-1"}"#).unwrap().encode().unwrap();
        frame::write_frame(&mut client, &register).await.unwrap();
        let _ack = frame::read_frame(&mut client).await.unwrap();

        frame::write_frame(&mut client, &register).await.unwrap();
        let reply = Message::parse(&frame::read_frame(&mut client).await.unwrap()).unwrap();
        assert!(matches!(reply.message_type, MessageType::Error));
    }
}
