//! Sideband messages carried inside `Control` frames.
//!
//! Layout: `[1-byte opcode][body]`. An `Error` body is
//! `[2-byte big-endian code][UTF-8 message]`.

use crate::codec::{self, FrameKind, ProtocolViolation, MAX_CONTROL_PAYLOAD};

pub const OP_PING: u8 = 0x01;
pub const OP_PONG: u8 = 0x02;
pub const OP_ERROR: u8 = 0x03;

pub const ERROR_CODE_PROTOCOL: u16 = 1;
pub const ERROR_CODE_QUOTA_BYTES: u16 = 2;
pub const ERROR_CODE_QUOTA_FPS: u16 = 3;
pub const ERROR_CODE_BACKPRESSURE: u16 = 4;

/// Largest body that still fits in a control frame after the opcode.
pub const MAX_CONTROL_BODY: usize = MAX_CONTROL_PAYLOAD - 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Error { code: u16, message: String },
    /// Opcodes this version does not know; receivers ignore them.
    Unknown { opcode: u8, body: Vec<u8> },
}

impl ControlMessage {
    /// Serialize into a control-frame payload (no wire header).
    pub fn to_payload(&self) -> Vec<u8> {
        match self {
            ControlMessage::Ping(body) => with_opcode(OP_PING, body),
            ControlMessage::Pong(body) => with_opcode(OP_PONG, body),
            ControlMessage::Error { code, message } => {
                let message = truncate_utf8(message, MAX_CONTROL_BODY - 2);
                let mut out = Vec::with_capacity(3 + message.len());
                out.push(OP_ERROR);
                out.extend_from_slice(&code.to_be_bytes());
                out.extend_from_slice(message.as_bytes());
                out
            }
            ControlMessage::Unknown { opcode, body } => with_opcode(*opcode, body),
        }
    }

    /// Encode as a complete wire frame.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolViolation> {
        codec::encode_parts(FrameKind::Control, &self.to_payload())
    }

    /// Parse a control-frame payload.
    ///
    /// Returns `None` for an empty payload or a truncated error body.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let (&opcode, body) = payload.split_first()?;
        Some(match opcode {
            OP_PING => ControlMessage::Ping(body.to_vec()),
            OP_PONG => ControlMessage::Pong(body.to_vec()),
            OP_ERROR => {
                if body.len() < 2 {
                    return None;
                }
                let code = u16::from_be_bytes([body[0], body[1]]);
                let message = String::from_utf8_lossy(&body[2..]).into_owned();
                ControlMessage::Error { code, message }
            }
            other => ControlMessage::Unknown {
                opcode: other,
                body: body.to_vec(),
            },
        })
    }
}

fn with_opcode(opcode: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(opcode);
    out.extend_from_slice(body);
    out
}

/// Truncate to at most `max_bytes` without splitting a UTF-8 sequence.
pub fn truncate_utf8(input: &str, max_bytes: usize) -> &str {
    if input.len() <= max_bytes {
        return input;
    }
    let mut end = max_bytes;
    while !input.is_char_boundary(end) {
        end -= 1;
    }
    &input[..end]
}
