// SPDX-FileCopyrightText: © 2025 Greenhouse Broker Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Canonical message-type strings, roles, and the typed [`Message`] record.
//!
//! Messages are flat JSON objects with a required `type` field (§6.2) plus
//! type-specific fields (§6.2 table). Unknown fields are tolerated and, for
//! message types that get broadcast or routed, carried opaquely so that
//! enrichments added by a sensor reach panels verbatim (§9).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{BrokerError, Result};

/// Role strings exchanged during registration (§6.2).
pub mod role {
    pub const SENSOR_NODE: &str = "SENSOR_NODE";
    pub const CONTROL_PANEL: &str = "CONTROL_PANEL";
}

/// The closed set of canonical message-type strings (§6.2), exact casing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "REGISTER_NODE")]
    RegisterNode,
    #[serde(rename = "REGISTER_CONTROL_PANEL")]
    RegisterControlPanel,
    #[serde(rename = "REGISTER_ACK")]
    RegisterAck,
    #[serde(rename = "NODE_LIST")]
    NodeList,
    #[serde(rename = "SENSOR_DATA")]
    SensorData,
    #[serde(rename = "ACTUATOR_COMMAND")]
    ActuatorCommand,
    #[serde(rename = "ACTUATOR_STATUS")]
    ActuatorStatus,
    #[serde(rename = "ACTUATOR_STATE")]
    ActuatorState,
    #[serde(rename = "COMMAND_ACK")]
    CommandAck,
    #[serde(rename = "NODE_CONNECTED")]
    NodeConnected,
    #[serde(rename = "NODE_DISCONNECTED")]
    NodeDisconnected,
    #[serde(rename = "HEARTBEAT")]
    Heartbeat,
    #[serde(rename = "ERROR")]
    Error,
}

impl MessageType {
    /// Broadcast-to-all-panels types forward their payload unchanged (§6.2 routing rules).
    #[must_use]
    pub const fn is_panel_broadcast(self) -> bool {
        matches!(self, Self::SensorData | Self::ActuatorStatus | Self::ActuatorState | Self::CommandAck)
    }
}

/// A flat JSON protocol message: a typed `type` tag plus every other field
/// preserved as JSON values, so unrecognized/extra fields round-trip
/// unchanged when a message is forwarded (§4.2, §9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Message {
    /// Parses one frame's payload bytes as a protocol message.
    ///
    /// Any error here (malformed JSON, or JSON lacking a recognized `type`)
    /// should be answered with an `ERROR` message by the caller; it does not
    /// disconnect the peer (§4.2).
    pub fn parse(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload)
            .map_err(|e| BrokerError::Protocol(format!("malformed message: {e}")))
    }

    /// Encodes this message as canonical, compact UTF-8 JSON.
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| BrokerError::Protocol(format!("failed to encode message: {e}")))
    }

    /// Looks up a field, tolerating both string and numeric JSON literals by
    /// coercing numbers to their string representation (`value`, `action`,
    /// `state` per §4.2).
    #[must_use]
    pub fn field_str(&self, key: &str) -> Option<String> {
        match self.fields.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Same as [`Self::field_str`] but returns an empty string for a missing
    /// optional field, per the tolerant-defaults rule in §4.2.
    #[must_use]
    pub fn field_str_or_default(&self, key: &str) -> String {
        self.field_str(key).unwrap_or_default()
    }

    /// Looks up a required field, failing with a descriptive protocol error
    /// when absent (§7: "missing required field").
    pub fn require_str(&self, key: &str) -> Result<String> {
        self.field_str(key)
            .ok_or_else(|| BrokerError::Protocol(format!("missing required field `{key}`")))
    }

    /// Builds a new message of `message_type` from `fields`.
    #[must_use]
    pub const fn new(message_type: MessageType, fields: Map<String, Value>) -> Self {
        Self { message_type, fields }
    }

    /// `REGISTER_ACK` synthesized by the broker on successful registration (§6.2).
    #[must_use]
    pub fn register_ack(node_id: &str, message: impl Into<String>) -> Self {
        let mut fields = Map::new();
        fields.insert("nodeId".into(), Value::String(node_id.to_string()));
        fields.insert("message".into(), Value::String(message.into()));
        Self::new(MessageType::RegisterAck, fields)
    }

    /// `NODE_LIST` snapshot sent to a panel right after its `REGISTER_ACK` (§4.3, §6.2).
    #[must_use]
    pub fn node_list(nodes: &[NodeDescriptor]) -> Self {
        let mut fields = Map::new();
        let list = nodes
            .iter()
            .map(|n| {
                serde_json::json!({
                    "nodeId": n.node_id,
                    "sensorKeys": n.sensor_keys,
                    "actuatorKeys": n.actuator_keys,
                })
            })
            .collect();
        fields.insert("nodes".into(), Value::Array(list));
        Self::new(MessageType::NodeList, fields)
    }

    /// `NODE_CONNECTED` broadcast to all panels when a sensor registers (§4.3, §6.2).
    #[must_use]
    pub fn node_connected(node_id: &str) -> Self {
        Self::node_event(MessageType::NodeConnected, node_id)
    }

    /// `NODE_DISCONNECTED` broadcast to all panels when a sensor's connection closes (§4.3, §6.2).
    #[must_use]
    pub fn node_disconnected(node_id: &str) -> Self {
        Self::node_event(MessageType::NodeDisconnected, node_id)
    }

    fn node_event(message_type: MessageType, node_id: &str) -> Self {
        let mut fields = Map::new();
        fields.insert("nodeId".into(), Value::String(node_id.to_string()));
        Self::new(message_type, fields)
    }

    /// `ERROR` message with a human-readable cause (§6.2, §7).
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        let mut fields = Map::new();
        fields.insert("message".into(), Value::String(message.into()));
        Self::new(MessageType::Error, fields)
    }
}

/// A registered sensor node's descriptor, as returned by
/// `NodeRegistry::snapshot_nodes` and rendered into `NODE_LIST` (§4.4, §6.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub node_id: String,
    #[serde(default)]
    pub sensor_keys: Vec<String>,
    #[serde(default)]
    pub actuator_keys: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_register_node() {
        let payload = br#"{"type":"REGISTER_NODE","role":"SENSOR_NODE","nodeId":"dev-1"}"#;
        let msg = Message::parse(payload).unwrap();
        assert!(matches!(msg.message_type, MessageType::RegisterNode));
        assert_eq!(msg.require_str("nodeId").unwrap(), "dev-1");
        assert_eq!(msg.field_str("role").as_deref(), Some(role::SENSOR_NODE));
    }

    #[test]
    fn unrecognized_type_is_a_protocol_error() {
        let payload = br#"{"type":"NOT_A_REAL_TYPE"}"#;
        assert!(Message::parse(payload).is_err());
    }

    #[test]
    fn numeric_value_field_coerces_to_string() {
        let payload = br#"{"type":"ACTUATOR_COMMAND","targetNode":"s1","actuator":"fan","action":1}"#;
        let msg = Message::parse(payload).unwrap();
        assert_eq!(msg.field_str("action").as_deref(), Some("1"));
    }

    #[test]
    fn missing_optional_field_is_empty_string() {
        let payload = br#"{"type":"SENSOR_DATA","nodeId":"dev-1","sensorKey":"temp","value":"42"}"#;
        let msg = Message::parse(payload).unwrap();
        assert_eq!(msg.field_str_or_default("unit"), "");
    }

    #[test]
    fn extra_fields_survive_a_round_trip() {
        let payload = br#"{"type":"SENSOR_DATA","nodeId":"dev-1","sensorKey":"temp","value":"42","battery":"low"}"#;
        let msg = Message::parse(payload).unwrap();
        let encoded = msg.encode().unwrap();
        let reparsed = Message::parse(&encoded).unwrap();
        assert_eq!(reparsed.field_str("battery").as_deref(), Some("low"));
    }

    #[test]
    fn encode_escapes_control_characters() {
        let msg = Message::error("bad \"quote\"\nand tab\t");
        let encoded = String::from_utf8(msg.encode().unwrap()).unwrap();
        assert!(encoded.contains(r#"\"quote\""#));
        assert!(encoded.contains(r"\n"));
        assert!(encoded.contains(r"\t"));
    }
}
