//! Length-prefixed framing for tunnel messages.
//!
//! Wire format: `[1-byte type][2-byte big-endian length][payload]`
//!
//! Each WebSocket binary message carries exactly one wire message, so the
//! declared length must account for every remaining byte.

use thiserror::Error;

/// Type tag for a data frame carrying one Ethernet frame.
pub const TYPE_DATA: u8 = 0x00;
/// Type tag for a control frame carrying a sideband message.
pub const TYPE_CONTROL: u8 = 0x01;

/// Size of the fixed header (type + length).
pub const HEADER_LEN: usize = 3;

/// Largest payload a `Data` frame may carry.
pub const MAX_DATA_PAYLOAD: usize = 2048;
/// Largest payload a `Control` frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 256;

/// Largest complete wire message, used to size WebSocket limits.
pub const MAX_WIRE_MESSAGE: usize = HEADER_LEN + MAX_DATA_PAYLOAD;

/// A decoded tunnel message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// Raw Ethernet frame.
    Data(Vec<u8>),
    /// Sideband payload, see [`crate::control`].
    Control(Vec<u8>),
}

/// Which frame kind a violation refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Data,
    Control,
}

impl FrameKind {
    pub fn type_tag(self) -> u8 {
        match self {
            FrameKind::Data => TYPE_DATA,
            FrameKind::Control => TYPE_CONTROL,
        }
    }

    pub fn max_payload(self) -> usize {
        match self {
            FrameKind::Data => MAX_DATA_PAYLOAD,
            FrameKind::Control => MAX_CONTROL_PAYLOAD,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            TYPE_DATA => Some(FrameKind::Data),
            TYPE_CONTROL => Some(FrameKind::Control),
            _ => None,
        }
    }
}

impl std::fmt::Display for FrameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameKind::Data => f.write_str("data"),
            FrameKind::Control => f.write_str("control"),
        }
    }
}

/// A peer sent (or we were asked to send) something the protocol forbids.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("truncated message: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("unknown message type 0x{0:02x}")]
    UnknownType(u8),

    #[error("{kind} payload too large: {len} bytes (max {max})")]
    PayloadTooLarge {
        kind: FrameKind,
        len: usize,
        max: usize,
    },

    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),

    #[error("text messages are not part of the tunnel protocol")]
    UnexpectedText,
}

impl WireMessage {
    pub fn kind(&self) -> FrameKind {
        match self {
            WireMessage::Data(_) => FrameKind::Data,
            WireMessage::Control(_) => FrameKind::Control,
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            WireMessage::Data(p) | WireMessage::Control(p) => p,
        }
    }

    pub fn into_payload(self) -> Vec<u8> {
        match self {
            WireMessage::Data(p) | WireMessage::Control(p) => p,
        }
    }
}

/// Encode a message into a single wire frame.
///
/// Oversized payloads are rejected before any bytes are produced.
pub fn encode(msg: &WireMessage) -> Result<Vec<u8>, ProtocolViolation> {
    encode_parts(msg.kind(), msg.payload())
}

/// Encode a payload of the given kind without building a [`WireMessage`] first.
pub fn encode_parts(kind: FrameKind, payload: &[u8]) -> Result<Vec<u8>, ProtocolViolation> {
    let max = kind.max_payload();
    if payload.len() > max {
        return Err(ProtocolViolation::PayloadTooLarge {
            kind,
            len: payload.len(),
            max,
        });
    }

    // max <= 2048, so the length always fits in u16.
    let len = payload.len() as u16;
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.push(kind.type_tag());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Decode one wire frame.
///
/// The declared length is validated against the per-type maximum before the
/// payload buffer is allocated.
pub fn decode(data: &[u8]) -> Result<WireMessage, ProtocolViolation> {
    if data.len() < HEADER_LEN {
        return Err(ProtocolViolation::Truncated {
            needed: HEADER_LEN,
            got: data.len(),
        });
    }

    let kind = FrameKind::from_tag(data[0]).ok_or(ProtocolViolation::UnknownType(data[0]))?;
    let len = u16::from_be_bytes([data[1], data[2]]) as usize;

    let max = kind.max_payload();
    if len > max {
        return Err(ProtocolViolation::PayloadTooLarge { kind, len, max });
    }

    let body = &data[HEADER_LEN..];
    if body.len() < len {
        return Err(ProtocolViolation::Truncated {
            needed: HEADER_LEN + len,
            got: data.len(),
        });
    }
    if body.len() > len {
        return Err(ProtocolViolation::TrailingBytes(body.len() - len));
    }

    let payload = body.to_vec();
    Ok(match kind {
        FrameKind::Data => WireMessage::Data(payload),
        FrameKind::Control => WireMessage::Control(payload),
    })
}
