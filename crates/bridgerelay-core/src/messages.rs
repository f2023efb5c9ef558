//! Control messages exchanged on the relay channel.
//!
//! ```text
//! pair:   flags (1B, bit 0 = initiator) | token (32B) | id (uint) | seq (uint)
//! unpair: flags (1B, zero)              | token (32B)
//! ```
//!
//! `uint` is a compact little-endian integer: values below `0xFD` take one
//! byte, otherwise a marker byte `0xFD`/`0xFE`/`0xFF` is followed by a
//! 2/4/8-byte value.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{RelayError, Result};
use crate::token::{Token, TOKEN_LEN};

/// Message type byte for [`PairMessage`].
pub const PAIR: u8 = 0;
/// Message type byte for [`UnpairMessage`].
pub const UNPAIR: u8 = 1;

const FLAG_INITIATOR: u8 = 0b0000_0001;

const U16_MARKER: u8 = 0xFD;
const U32_MARKER: u8 = 0xFE;
const U64_MARKER: u8 = 0xFF;

/// Join (client to broker) or acknowledge (broker to client) one side of a pairing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairMessage {
    pub is_initiator: bool,
    pub token: Token,
    /// Transport stream id. Opaque here, used only for peer correlation.
    pub id: u64,
    /// Reserved, always 0.
    pub seq: u64,
}

/// Cancel a pending pairing or tear down its relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnpairMessage {
    pub token: Token,
}

/// A decoded control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Pair(PairMessage),
    Unpair(UnpairMessage),
}

impl PairMessage {
    pub fn new(is_initiator: bool, token: Token, id: u64) -> Self {
        Self {
            is_initiator,
            token,
            id,
            seq: 0,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + TOKEN_LEN + 18);
        buf.put_u8(if self.is_initiator { FLAG_INITIATOR } else { 0 });
        buf.put_slice(self.token.as_bytes());
        put_uint(&mut buf, self.id);
        put_uint(&mut buf, self.seq);
        buf.freeze()
    }

    pub fn decode(mut src: &[u8]) -> Result<Self> {
        let flags = get_flags(&mut src, FLAG_INITIATOR)?;
        let token = get_token(&mut src)?;
        let id = get_uint(&mut src)?;
        let seq = get_uint(&mut src)?;
        ensure_consumed(src)?;
        Ok(Self {
            is_initiator: flags & FLAG_INITIATOR != 0,
            token,
            id,
            seq,
        })
    }
}

impl UnpairMessage {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + TOKEN_LEN);
        buf.put_u8(0);
        buf.put_slice(self.token.as_bytes());
        buf.freeze()
    }

    pub fn decode(mut src: &[u8]) -> Result<Self> {
        get_flags(&mut src, 0)?;
        let token = get_token(&mut src)?;
        ensure_consumed(src)?;
        Ok(Self { token })
    }
}

impl Message {
    /// Decode a message body by its channel message type.
    pub fn decode(message_type: u8, body: &[u8]) -> Result<Self> {
        match message_type {
            PAIR => PairMessage::decode(body).map(Self::Pair),
            UNPAIR => UnpairMessage::decode(body).map(Self::Unpair),
            other => Err(RelayError::Decode(format!("unknown message type {other}"))),
        }
    }
}

fn get_flags(src: &mut &[u8], allowed: u8) -> Result<u8> {
    if !src.has_remaining() {
        return Err(truncated("flags"));
    }
    let flags = src.get_u8();
    if flags & !allowed != 0 {
        return Err(RelayError::Decode(format!("reserved flag bits set: {flags:#04x}")));
    }
    Ok(flags)
}

fn get_token(src: &mut &[u8]) -> Result<Token> {
    if src.remaining() < TOKEN_LEN {
        return Err(truncated("token"));
    }
    let mut bytes = [0u8; TOKEN_LEN];
    src.copy_to_slice(&mut bytes);
    Ok(Token::from_bytes(bytes))
}

fn ensure_consumed(src: &[u8]) -> Result<()> {
    if src.is_empty() {
        Ok(())
    } else {
        Err(RelayError::Decode(format!("{} trailing bytes", src.len())))
    }
}

fn truncated(field: &str) -> RelayError {
    RelayError::Decode(format!("message truncated at {field}"))
}

fn put_uint(buf: &mut BytesMut, value: u64) {
    if value < u64::from(U16_MARKER) {
        buf.put_u8(value as u8);
    } else if value <= u64::from(u16::MAX) {
        buf.put_u8(U16_MARKER);
        buf.put_u16_le(value as u16);
    } else if value <= u64::from(u32::MAX) {
        buf.put_u8(U32_MARKER);
        buf.put_u32_le(value as u32);
    } else {
        buf.put_u8(U64_MARKER);
        buf.put_u64_le(value);
    }
}

fn get_uint(src: &mut &[u8]) -> Result<u64> {
    if !src.has_remaining() {
        return Err(truncated("uint"));
    }
    let width = match src.get_u8() {
        U16_MARKER => 2,
        U32_MARKER => 4,
        U64_MARKER => 8,
        small => return Ok(u64::from(small)),
    };
    if src.remaining() < width {
        return Err(truncated("uint"));
    }
    let (value, floor) = match width {
        2 => (u64::from(src.get_u16_le()), u64::from(U16_MARKER)),
        4 => (u64::from(src.get_u32_le()), u64::from(u16::MAX) + 1),
        _ => (src.get_u64_le(), u64::from(u32::MAX) + 1),
    };
    if value < floor {
        return Err(RelayError::Decode(format!(
            "uint {value} not minimally encoded"
        )));
    }
    Ok(value)
}
