//! Wire message envelope and bodies.
//!
//! Every message exchanged between routers travels in a fixed envelope:
//!
//! ```text
//! type (1) | message ID (4) | expiration ms (8) | body length (2) | body
//! ```
//!
//! All multi-byte fields are big-endian (network byte order). Field
//! widths are part of the protocol and must not change.

use crate::error::MessageError;
use crate::identity::TunnelId;
use crate::{BUILD_RECORD_SIZE, MAX_BUILD_RECORDS, TUNNEL_DATA_SIZE, TUNNEL_DATA_WINDOW};

/// Envelope header size in bytes.
pub const ENVELOPE_HEADER_SIZE: usize = 1 + 4 + 8 + 2;

/// Default envelope time-to-live in milliseconds.
pub const DEFAULT_TTL_MS: u64 = 60_000;

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Expiration timestamp one default TTL from now.
#[must_use]
pub fn default_expiration() -> u64 {
    now_ms() + DEFAULT_TTL_MS
}

/// Wire message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
enum MessageType {
    TunnelData = 0x01,
    TunnelGateway = 0x02,
    TunnelBuild = 0x03,
    TunnelBuildReply = 0x04,
    DeliveryStatus = 0x05,
    Garlic = 0x06,
    DatabaseStore = 0x07,
}

impl TryFrom<u8> for MessageType {
    type Error = MessageError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::TunnelData),
            0x02 => Ok(Self::TunnelGateway),
            0x03 => Ok(Self::TunnelBuild),
            0x04 => Ok(Self::TunnelBuildReply),
            0x05 => Ok(Self::DeliveryStatus),
            0x06 => Ok(Self::Garlic),
            0x07 => Ok(Self::DatabaseStore),
            other => Err(MessageError::InvalidType(other)),
        }
    }
}

/// A tunnel-data message: one encrypted window moving through a tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelDataMessage {
    /// Tunnel ID of the hop this message is addressed to.
    pub tunnel_id: TunnelId,
    /// Initialization vector, transformed at every hop.
    pub iv: [u8; 16],
    /// Fixed-size encrypted payload window.
    pub window: Vec<u8>,
}

impl TunnelDataMessage {
    /// Assemble a tunnel-data message, validating the window size.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::LengthMismatch`] for a wrong-sized window.
    pub fn new(tunnel_id: TunnelId, iv: [u8; 16], window: Vec<u8>) -> Result<Self, MessageError> {
        if window.len() != TUNNEL_DATA_WINDOW {
            return Err(MessageError::LengthMismatch);
        }
        Ok(Self {
            tunnel_id,
            iv,
            window,
        })
    }
}

/// Wire message bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// Encrypted tunnel window addressed to a hop.
    TunnelData(TunnelDataMessage),
    /// A logical message handed to an inbound gateway for tunneling.
    /// The payload is a complete encoded envelope.
    TunnelGateway {
        /// Receiving tunnel ID at the gateway.
        tunnel_id: TunnelId,
        /// Encoded envelope to carry through the tunnel.
        payload: Vec<u8>,
    },
    /// Onion-encrypted build request records.
    TunnelBuild(Vec<Vec<u8>>),
    /// Layered build response records.
    TunnelBuildReply(Vec<Vec<u8>>),
    /// Round-trip acknowledgement used by liveness probes.
    DeliveryStatus {
        /// ID being acknowledged.
        status_id: u32,
        /// Millisecond timestamp at creation.
        created_ms: u64,
    },
    /// Garlic container, consumed opaquely by the session layer.
    Garlic(Vec<u8>),
    /// Network-database store, consumed opaquely by the netdb layer.
    DatabaseStore(Vec<u8>),
}

/// A complete wire message: ID, expiration and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEnvelope {
    /// Message ID; build replies are matched against pending builds by it.
    pub id: u32,
    /// Expiration, milliseconds since the Unix epoch.
    pub expiration_ms: u64,
    /// The message body.
    pub body: WireMessage,
}

impl MessageEnvelope {
    /// Encode to wire bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let (msg_type, body) = encode_body(&self.body);
        let mut buf = Vec::with_capacity(ENVELOPE_HEADER_SIZE + body.len());
        buf.push(msg_type as u8);
        buf.extend_from_slice(&self.id.to_be_bytes());
        buf.extend_from_slice(&self.expiration_ms.to_be_bytes());
        buf.extend_from_slice(&(body.len() as u16).to_be_bytes());
        buf.extend_from_slice(&body);
        buf
    }

    /// Decode from wire bytes.
    ///
    /// # Errors
    ///
    /// Returns a [`MessageError`] for truncated or malformed input.
    pub fn decode(data: &[u8]) -> Result<Self, MessageError> {
        if data.len() < ENVELOPE_HEADER_SIZE {
            return Err(MessageError::TooShort {
                expected: ENVELOPE_HEADER_SIZE,
                actual: data.len(),
            });
        }
        let msg_type = MessageType::try_from(data[0])?;
        let id = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
        let expiration_ms = u64::from_be_bytes([
            data[5], data[6], data[7], data[8], data[9], data[10], data[11], data[12],
        ]);
        let body_len = u16::from_be_bytes([data[13], data[14]]) as usize;
        if data.len() != ENVELOPE_HEADER_SIZE + body_len {
            return Err(MessageError::LengthMismatch);
        }
        let body = decode_body(msg_type, &data[ENVELOPE_HEADER_SIZE..])?;
        Ok(Self {
            id,
            expiration_ms,
            body,
        })
    }
}

fn encode_body(body: &WireMessage) -> (MessageType, Vec<u8>) {
    match body {
        WireMessage::TunnelData(td) => {
            let mut buf = Vec::with_capacity(TUNNEL_DATA_SIZE);
            buf.extend_from_slice(&td.tunnel_id.value().to_be_bytes());
            buf.extend_from_slice(&td.iv);
            buf.extend_from_slice(&td.window);
            (MessageType::TunnelData, buf)
        }
        WireMessage::TunnelGateway { tunnel_id, payload } => {
            let mut buf = Vec::with_capacity(6 + payload.len());
            buf.extend_from_slice(&tunnel_id.value().to_be_bytes());
            buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
            buf.extend_from_slice(payload);
            (MessageType::TunnelGateway, buf)
        }
        WireMessage::TunnelBuild(records) => {
            (MessageType::TunnelBuild, encode_records(records))
        }
        WireMessage::TunnelBuildReply(records) => {
            (MessageType::TunnelBuildReply, encode_records(records))
        }
        WireMessage::DeliveryStatus {
            status_id,
            created_ms,
        } => {
            let mut buf = Vec::with_capacity(12);
            buf.extend_from_slice(&status_id.to_be_bytes());
            buf.extend_from_slice(&created_ms.to_be_bytes());
            (MessageType::DeliveryStatus, buf)
        }
        WireMessage::Garlic(data) => (MessageType::Garlic, data.clone()),
        WireMessage::DatabaseStore(data) => (MessageType::DatabaseStore, data.clone()),
    }
}

fn encode_records(records: &[Vec<u8>]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + records.len() * BUILD_RECORD_SIZE);
    buf.push(records.len() as u8);
    for record in records {
        buf.extend_from_slice(record);
    }
    buf
}

fn decode_body(msg_type: MessageType, body: &[u8]) -> Result<WireMessage, MessageError> {
    match msg_type {
        MessageType::TunnelData => {
            if body.len() != TUNNEL_DATA_SIZE {
                return Err(MessageError::LengthMismatch);
            }
            let tunnel_id = TunnelId::new(u32::from_be_bytes([body[0], body[1], body[2], body[3]]));
            let mut iv = [0u8; 16];
            iv.copy_from_slice(&body[4..20]);
            Ok(WireMessage::TunnelData(TunnelDataMessage {
                tunnel_id,
                iv,
                window: body[20..].to_vec(),
            }))
        }
        MessageType::TunnelGateway => {
            if body.len() < 6 {
                return Err(MessageError::TooShort {
                    expected: 6,
                    actual: body.len(),
                });
            }
            let tunnel_id = TunnelId::new(u32::from_be_bytes([body[0], body[1], body[2], body[3]]));
            let payload_len = u16::from_be_bytes([body[4], body[5]]) as usize;
            if body.len() != 6 + payload_len {
                return Err(MessageError::LengthMismatch);
            }
            Ok(WireMessage::TunnelGateway {
                tunnel_id,
                payload: body[6..].to_vec(),
            })
        }
        MessageType::TunnelBuild => Ok(WireMessage::TunnelBuild(decode_records(body)?)),
        MessageType::TunnelBuildReply => Ok(WireMessage::TunnelBuildReply(decode_records(body)?)),
        MessageType::DeliveryStatus => {
            if body.len() != 12 {
                return Err(MessageError::LengthMismatch);
            }
            Ok(WireMessage::DeliveryStatus {
                status_id: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
                created_ms: u64::from_be_bytes([
                    body[4], body[5], body[6], body[7], body[8], body[9], body[10], body[11],
                ]),
            })
        }
        MessageType::Garlic => Ok(WireMessage::Garlic(body.to_vec())),
        MessageType::DatabaseStore => Ok(WireMessage::DatabaseStore(body.to_vec())),
    }
}

fn decode_records(body: &[u8]) -> Result<Vec<Vec<u8>>, MessageError> {
    if body.is_empty() {
        return Err(MessageError::TooShort {
            expected: 1,
            actual: 0,
        });
    }
    let count = body[0] as usize;
    if count == 0 || count > MAX_BUILD_RECORDS || body.len() != 1 + count * BUILD_RECORD_SIZE {
        return Err(MessageError::LengthMismatch);
    }
    Ok(body[1..]
        .chunks_exact(BUILD_RECORD_SIZE)
        .map(<[u8]>::to_vec)
        .collect())
}
