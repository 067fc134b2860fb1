// SPDX-FileCopyrightText: © 2025 Greenhouse Broker Contributors
//
// SPDX-License-Identifier: MPL-2.0

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::time::Duration;

use greenhouse_broker::BrokerServer;
use greenhouse_core::frame::{self, MAX_FRAME_BYTES};
use greenhouse_core::protocol::{Message, MessageType};
use tokio::net::TcpStream;
use tokio::time::timeout;

async fn start_test_server() -> (SocketAddr, BrokerServer) {
    let server =
        BrokerServer::bind("127.0.0.1:0".parse().unwrap(), Duration::from_secs(30)).await.unwrap();
    let addr = server.local_addr().unwrap();
    (addr, server)
}

async fn connect(addr: SocketAddr) -> TcpStream {
    TcpStream::connect(addr).await.unwrap()
}

async fn send(stream: &mut TcpStream, msg: &Message) {
    frame::write_frame(stream, &msg.encode().unwrap()).await.unwrap();
}

async fn recv(stream: &mut TcpStream) -> Message {
    let payload = timeout(Duration::from_secs(5), frame::read_frame(stream)).await.unwrap().unwrap();
    Message::parse(&payload).unwrap()
}

fn register_node(node_id: &str) -> Message {
    Message::parse(
        format!(r#"{{"type":"REGISTER_NODE","role":"SENSOR_NODE","nodeId":"{node_id}"}}"#).as_bytes(),
    )
    .unwrap()
}

fn register_panel(panel_id: &str) -> Message {
    Message::parse(
        format!(r#"{{"type":"REGISTER_CONTROL_PANEL","role":"CONTROL_PANEL","nodeId":"{panel_id}"}}"#)
            .as_bytes(),
    )
    .unwrap()
}

/// Scenario 1: a sensor's `SENSOR_DATA` fans out to every connected panel.
#[tokio::test]
async fn sensor_data_fans_out_to_all_panels() {
    let (addr, server) = start_test_server().await;
    tokio::spawn(server.serve());

    let mut sensor = connect(addr).await;
    send(&mut sensor, &register_node("dev-1")).await;
    let _ack = recv(&mut sensor).await;

    let mut panel_a = connect(addr).await;
    send(&mut panel_a, &register_panel("ui-a")).await;
    let _ack = recv(&mut panel_a).await;
    let _list = recv(&mut panel_a).await;

    let mut panel_b = connect(addr).await;
    send(&mut panel_b, &register_panel("ui-b")).await;
    let _ack = recv(&mut panel_b).await;
    let _list = recv(&mut panel_b).await;

    let data = Message::parse(
        br#"{"type":"SENSOR_DATA","nodeId":"dev-1","sensorKey":"temperature","value":"23.4"}"#,
    )
    .unwrap();
    send(&mut sensor, &data).await;

    for panel in [&mut panel_a, &mut panel_b] {
        let forwarded = recv(panel).await;
        assert!(matches!(forwarded.message_type, MessageType::SensorData));
        assert_eq!(forwarded.field_str("value").as_deref(), Some("23.4"));
    }
}

/// Scenario 2: a panel that vanishes mid-broadcast is pruned without
/// disrupting delivery to the panels that are still alive.
#[tokio::test]
async fn dead_panel_is_pruned_without_blocking_other_panels() {
    let (addr, server) = start_test_server().await;
    let registry = server.registry();
    tokio::spawn(server.serve());

    let mut sensor = connect(addr).await;
    send(&mut sensor, &register_node("dev-1")).await;
    let _ack = recv(&mut sensor).await;

    let mut alive_panel = connect(addr).await;
    send(&mut alive_panel, &register_panel("ui-alive")).await;
    let _ack = recv(&mut alive_panel).await;
    let _list = recv(&mut alive_panel).await;

    {
        let mut doomed_panel = connect(addr).await;
        send(&mut doomed_panel, &register_panel("ui-doomed")).await;
        let _ack = recv(&mut doomed_panel).await;
        let _list = recv(&mut doomed_panel).await;
        // Dropping the socket here simulates the panel process dying.
    }

    // Give the doomed connection's read loop a moment to notice EOF.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let data =
        Message::parse(br#"{"type":"SENSOR_DATA","nodeId":"dev-1","sensorKey":"temp","value":"1"}"#)
            .unwrap();
    send(&mut sensor, &data).await;

    let forwarded = recv(&mut alive_panel).await;
    assert!(matches!(forwarded.message_type, MessageType::SensorData));

    // Eventually the dead panel is pruned from the registry (may take one
    // more broadcast if the EOF hadn't been observed yet).
    send(&mut sensor, &data).await;
    let _second = recv(&mut alive_panel).await;
    assert_eq!(registry.panels().len(), 1);
}

/// Scenario 3: a panel's `ACTUATOR_COMMAND` routes to the named sensor, and
/// an unknown target produces an `ERROR` back to the panel.
#[tokio::test]
async fn actuator_command_routes_to_named_node_and_errors_on_unknown_target() {
    let (addr, server) = start_test_server().await;
    tokio::spawn(server.serve());

    let mut sensor = connect(addr).await;
    send(&mut sensor, &register_node("dev-1")).await;
    let _ack = recv(&mut sensor).await;

    let mut panel = connect(addr).await;
    send(&mut panel, &register_panel("ui-1")).await;
    let _ack = recv(&mut panel).await;
    let _list = recv(&mut panel).await;

    let command = Message::parse(
        br#"{"type":"ACTUATOR_COMMAND","targetNode":"dev-1","actuator":"fan","action":"on"}"#,
    )
    .unwrap();
    send(&mut panel, &command).await;

    let delivered = recv(&mut sensor).await;
    assert!(matches!(delivered.message_type, MessageType::ActuatorCommand));
    assert_eq!(delivered.field_str("actuator").as_deref(), Some("fan"));

    let bad_command = Message::parse(
        br#"{"type":"ACTUATOR_COMMAND","targetNode":"ghost","actuator":"fan","action":"off"}"#,
    )
    .unwrap();
    send(&mut panel, &bad_command).await;
    let error = recv(&mut panel).await;
    assert!(matches!(error.message_type, MessageType::Error));
    assert!(error.field_str_or_default("message").contains("not found"));
}

/// Scenario 4: `COMMAND_ACK`/`ACTUATOR_STATUS` from a sensor broadcast to
/// every registered panel, same as `SENSOR_DATA`.
#[tokio::test]
async fn command_ack_and_actuator_status_broadcast_to_panels() {
    let (addr, server) = start_test_server().await;
    tokio::spawn(server.serve());

    let mut sensor = connect(addr).await;
    send(&mut sensor, &register_node("dev-1")).await;
    let _ack = recv(&mut sensor).await;

    let mut panel = connect(addr).await;
    send(&mut panel, &register_panel("ui-1")).await;
    let _ack = recv(&mut panel).await;
    let _list = recv(&mut panel).await;

    let ack = Message::parse(br#"{"type":"COMMAND_ACK","nodeId":"dev-1","actuator":"fan","state":"on"}"#)
        .unwrap();
    send(&mut sensor, &ack).await;
    let forwarded = recv(&mut panel).await;
    assert!(matches!(forwarded.message_type, MessageType::CommandAck));

    let status =
        Message::parse(br#"{"type":"ACTUATOR_STATUS","nodeId":"dev-1","actuator":"fan","state":"on"}"#)
            .unwrap();
    send(&mut sensor, &status).await;
    let forwarded = recv(&mut panel).await;
    assert!(matches!(forwarded.message_type, MessageType::ActuatorStatus));
}

/// Scenario 5: a frame whose declared length exceeds `MAX_FRAME_BYTES` is
/// rejected by the framing layer before it ever reaches the protocol layer.
#[tokio::test]
async fn oversize_frame_header_is_rejected() {
    let (addr, server) = start_test_server().await;
    tokio::spawn(server.serve());

    let mut stream = connect(addr).await;
    let too_big = (MAX_FRAME_BYTES + 1) as u32;
    tokio::io::AsyncWriteExt::write_all(&mut stream, &too_big.to_be_bytes()).await.unwrap();

    // The broker closes the connection rather than replying; observe EOF.
    let mut probe = [0u8; 1];
    let n = timeout(Duration::from_secs(2), tokio::io::AsyncReadExt::read(&mut stream, &mut probe))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0, "connection should be closed after an oversize length header");
}

/// Scenario 6: an invalid (zero) length header closes the connection
/// without hanging the server.
#[tokio::test]
async fn zero_length_header_closes_the_connection() {
    let (addr, server) = start_test_server().await;
    tokio::spawn(server.serve());

    let mut stream = connect(addr).await;
    tokio::io::AsyncWriteExt::write_all(&mut stream, &0u32.to_be_bytes()).await.unwrap();

    let mut probe = [0u8; 1];
    let n = timeout(Duration::from_secs(2), tokio::io::AsyncReadExt::read(&mut stream, &mut probe))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);
}
