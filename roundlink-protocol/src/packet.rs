//! Network Packet
//!
//! Packets are JSON objects terminated by a single newline. The wire format is
//! compatible with KDE Connect:
//!
//! - `id`: UNIX epoch timestamp in milliseconds
//! - `type`: packet type such as `kdeconnect.pair` or `kdeconnect.battery`
//! - `body`: JSON dictionary of plugin-specific parameters
//! - `payloadSize`: (optional) size of an attached bulk payload in bytes
//! - `payloadTransferInfo`: (optional) how to fetch the payload, e.g. `{"port": 1739}`
//!
//! Unknown top-level fields and every body field are kept as they arrived, so
//! packets from peers running a newer protocol survive a decode/encode cycle.
//! Integer and floating point numbers keep their distinction.

use crate::{ProtocolError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identity announcement packet type
pub const PACKET_TYPE_IDENTITY: &str = "kdeconnect.identity";

/// Pairing control packet type
pub const PACKET_TYPE_PAIR: &str = "kdeconnect.pair";

/// A network packet
///
/// Equality compares `type` and `body` only. Two packets carrying the same
/// message at different times are equal.
///
/// ```
/// use roundlink_protocol::Packet;
/// use serde_json::json;
///
/// let packet = Packet::new("kdeconnect.ping", json!({"message": "hi"}));
/// let bytes = packet.to_bytes().unwrap();
/// let parsed = Packet::from_bytes(&bytes).unwrap();
/// assert_eq!(packet, parsed);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Packet {
    /// UNIX timestamp in milliseconds
    ///
    /// Some clients send this as a string; it is always written as a number.
    #[serde(deserialize_with = "deserialize_id", serialize_with = "serialize_id")]
    pub id: i64,

    /// Packet type
    #[serde(rename = "type")]
    pub packet_type: String,

    /// Plugin-specific parameters
    #[serde(default = "empty_body")]
    pub body: Value,

    /// Optional payload size in bytes (-1 for indefinite streams)
    #[serde(rename = "payloadSize", skip_serializing_if = "Option::is_none")]
    pub payload_size: Option<i64>,

    /// Optional payload transfer negotiation info
    #[serde(
        rename = "payloadTransferInfo",
        skip_serializing_if = "Option::is_none"
    )]
    pub payload_transfer_info: Option<Map<String, Value>>,

    /// Top-level fields this implementation does not know about
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PartialEq for Packet {
    fn eq(&self, other: &Self) -> bool {
        self.packet_type == other.packet_type && self.body == other.body
    }
}

impl Packet {
    /// Creates a new packet with the specified type and body
    ///
    /// The packet ID is set to the current timestamp in milliseconds.
    pub fn new(packet_type: impl Into<String>, body: Value) -> Self {
        Self::with_id(current_timestamp(), packet_type, body)
    }

    /// Create a new packet with an explicit timestamp
    pub fn with_id(id: i64, packet_type: impl Into<String>, body: Value) -> Self {
        Self {
            id,
            packet_type: packet_type.into(),
            body,
            payload_size: None,
            payload_transfer_info: None,
            extra: Map::new(),
        }
    }

    /// Serialize packet to bytes with newline terminator
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Deserialize a packet from bytes
    ///
    /// Accepts data with or without a trailing `\n` or `\r\n`.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::InvalidPacket` if the data is not valid JSON,
    /// lacks a `type`, or carries a body that is not an object.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let trimmed = data
            .strip_suffix(b"\r\n")
            .or_else(|| data.strip_suffix(b"\n"))
            .unwrap_or(data);

        let packet: Packet = serde_json::from_slice(trimmed).map_err(|e| {
            ProtocolError::InvalidPacket(format!("Failed to deserialize packet: {}", e))
        })?;

        if packet.packet_type.is_empty() {
            return Err(ProtocolError::InvalidPacket("empty packet type".to_string()));
        }
        if !packet.body.is_object() {
            return Err(ProtocolError::InvalidPacket(format!(
                "body of {} is not an object",
                packet.packet_type
            )));
        }

        Ok(packet)
    }

    /// Builder pattern: Set payload size
    pub fn with_payload_size(mut self, size: i64) -> Self {
        self.payload_size = Some(size);
        self
    }

    /// Builder pattern: Set payload transfer info
    pub fn with_payload_transfer_info(mut self, info: Map<String, Value>) -> Self {
        self.payload_transfer_info = Some(info);
        self
    }

    /// Builder pattern: Attach a payload served on `port`
    pub fn with_payload(self, size: u64, port: u16) -> Self {
        let mut info = Map::new();
        info.insert("port".to_string(), Value::from(port));
        self.with_payload_size(size as i64).with_payload_transfer_info(info)
    }

    /// Port announced in `payloadTransferInfo`, if any
    pub fn payload_port(&self) -> Option<u16> {
        self.payload_transfer_info
            .as_ref()
            .and_then(|info| info.get("port"))
            .and_then(Value::as_u64)
            .and_then(|port| u16::try_from(port).ok())
    }

    /// Whether the packet announces a bulk payload
    pub fn has_payload(&self) -> bool {
        self.payload_size.is_some() && self.payload_transfer_info.is_some()
    }

    /// Builder pattern: Add a key-value pair to the body
    pub fn with_body_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        if let Value::Object(ref mut map) = self.body {
            map.insert(key.into(), value.into());
        }
        self
    }

    /// Builder pattern: Add an opaque binary blob to the body
    ///
    /// Blobs travel as standard base64 strings.
    pub fn with_body_bytes(self, key: impl Into<String>, bytes: &[u8]) -> Self {
        let encoded = BASE64.encode(bytes);
        self.with_body_field(key, encoded)
    }

    /// Check if packet is of a specific type
    pub fn is_type(&self, packet_type: &str) -> bool {
        self.packet_type == packet_type
    }

    /// Whether this packet is handled by the connection layer itself
    ///
    /// Control packets reach the core even when the device is not paired.
    pub fn is_control(&self) -> bool {
        self.is_type(PACKET_TYPE_PAIR) || self.is_type(PACKET_TYPE_IDENTITY)
    }

    /// Get a field from the body as a specific type
    pub fn get_body_field<T>(&self, key: &str) -> Option<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.body
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Decode a base64 blob from the body
    pub fn get_body_bytes(&self, key: &str) -> Result<Vec<u8>> {
        let encoded = self
            .body
            .get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::InvalidPacket(format!("missing binary field {}", key)))?;
        BASE64
            .decode(encoded)
            .map_err(|e| ProtocolError::InvalidPacket(format!("field {} is not base64: {}", key, e)))
    }
}

fn empty_body() -> Value {
    Value::Object(Map::new())
}

/// Custom deserializer for the `id` field to handle both string and number formats
fn deserialize_id<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    let value: Value = Deserialize::deserialize(deserializer)?;
    match value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| Error::custom("Invalid number for id")),
        Value::String(s) => s
            .parse::<i64>()
            .map_err(|_| Error::custom("Invalid string for id")),
        _ => Err(Error::custom("id must be a number or string")),
    }
}

fn serialize_id<S>(id: &i64, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_i64(*id)
}

/// Generate current UNIX timestamp in milliseconds
pub fn current_timestamp() -> i64 {
    Utc::now().timestamp_millis()
}
