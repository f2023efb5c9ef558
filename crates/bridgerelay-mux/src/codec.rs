use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{MuxError, Result};

/// Frame header: magic (2) + kind (1) + channel (2) + length (4) = 9 bytes.
pub const HEADER_SIZE: usize = 9;

/// Magic bytes: "BR" (0x42 0x52).
pub const MAGIC: [u8; 2] = [0x42, 0x52];

/// Default maximum payload size: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

const MAX_PROTOCOL_LEN: usize = u8::MAX as usize;
const MAX_ID_LEN: usize = u8::MAX as usize;

/// What a frame does to the sub-channel it names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Open = 1,
    Message = 2,
    Close = 3,
}

impl TryFrom<u8> for FrameKind {
    type Error = MuxError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::Open),
            2 => Ok(Self::Message),
            3 => Ok(Self::Close),
            other => Err(MuxError::UnknownKind(other)),
        }
    }
}

/// A framed unit on the wire.
///
/// `channel` is always the sender's local channel number; the receiver maps
/// it back to its own channel through the preceding `Open` frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: FrameKind,
    pub channel: u16,
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(kind: FrameKind, channel: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            channel,
            payload: payload.into(),
        }
    }

    /// The total wire size of this frame (header + payload).
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Encode a frame into the wire format.
///
/// ```text
/// ┌────────────┬──────────┬───────────┬───────────┬──────────────────┐
/// │ Magic (2B) │ Kind(1B) │ Channel   │ Length    │ Payload          │
/// │ 0x42 0x52  │          │ (2B LE)   │ (4B LE)   │ (Length bytes)   │
/// └────────────┴──────────┴───────────┴───────────┴──────────────────┘
/// ```
pub fn encode_frame(
    kind: FrameKind,
    channel: u16,
    payload: &[u8],
    dst: &mut BytesMut,
) -> Result<()> {
    if payload.len() > u32::MAX as usize {
        return Err(MuxError::PayloadTooLarge {
            size: payload.len(),
            max: u32::MAX as usize,
        });
    }
    dst.reserve(HEADER_SIZE + payload.len());
    dst.put_slice(&MAGIC);
    dst.put_u8(kind as u8);
    dst.put_u16_le(channel);
    dst.put_u32_le(payload.len() as u32);
    dst.put_slice(payload);
    Ok(())
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<Frame>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    if src[0..2] != MAGIC {
        return Err(MuxError::InvalidMagic);
    }

    let kind = FrameKind::try_from(src[2])?;
    let channel = u16::from_le_bytes([src[3], src[4]]);
    let payload_len = u32::from_le_bytes([src[5], src[6], src[7], src[8]]) as usize;

    if payload_len > max_payload {
        return Err(MuxError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }

    if src.len() < HEADER_SIZE + payload_len {
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    let payload = src.split_to(payload_len).freeze();

    Ok(Some(Frame {
        kind,
        channel,
        payload,
    }))
}

/// Body of an `Open` frame: which sub-channel is being opened and with what handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenPayload {
    pub protocol: String,
    pub id: Option<Bytes>,
    pub handshake: Option<Bytes>,
}

impl OpenPayload {
    pub fn encode(&self) -> Result<Bytes> {
        if self.protocol.is_empty() || self.protocol.len() > MAX_PROTOCOL_LEN {
            return Err(MuxError::Malformed(format!(
                "invalid protocol name length: {}",
                self.protocol.len()
            )));
        }

        let mut out = BytesMut::new();
        out.put_u8(self.protocol.len() as u8);
        out.put_slice(self.protocol.as_bytes());

        match &self.id {
            Some(id) if id.len() > MAX_ID_LEN => {
                return Err(MuxError::Malformed(format!(
                    "channel id too long: {} (max {MAX_ID_LEN})",
                    id.len()
                )));
            }
            Some(id) => {
                out.put_u8(1);
                out.put_u8(id.len() as u8);
                out.put_slice(id);
            }
            None => out.put_u8(0),
        }

        match &self.handshake {
            Some(handshake) => {
                out.put_u8(1);
                out.put_slice(handshake);
            }
            None => out.put_u8(0),
        }

        Ok(out.freeze())
    }

    pub fn decode(mut src: Bytes) -> Result<Self> {
        let protocol_len = take_u8(&mut src, "protocol length")? as usize;
        let protocol = take_bytes(&mut src, protocol_len, "protocol")?;
        let protocol = String::from_utf8(protocol.to_vec())
            .map_err(|_| MuxError::Malformed("protocol is not UTF-8".to_string()))?;

        let id = match take_u8(&mut src, "id flag")? {
            0 => None,
            1 => {
                let len = take_u8(&mut src, "id length")? as usize;
                Some(take_bytes(&mut src, len, "id")?)
            }
            other => return Err(MuxError::Malformed(format!("invalid id flag {other}"))),
        };

        let handshake = match take_u8(&mut src, "handshake flag")? {
            0 if src.is_empty() => None,
            0 => return Err(MuxError::Malformed("trailing bytes after open".to_string())),
            1 => Some(src),
            other => {
                return Err(MuxError::Malformed(format!(
                    "invalid handshake flag {other}"
                )))
            }
        };

        Ok(Self {
            protocol,
            id,
            handshake,
        })
    }
}

/// Prefix `body` with its one-byte message type for a `Message` frame.
pub fn encode_message(message_type: u8, body: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(1 + body.len());
    out.put_u8(message_type);
    out.put_slice(body);
    out.freeze()
}

/// Split a `Message` frame payload into its type and body.
pub fn decode_message(mut payload: Bytes) -> Result<(u8, Bytes)> {
    let message_type = take_u8(&mut payload, "message type")?;
    Ok((message_type, payload))
}

fn take_u8(src: &mut Bytes, what: &str) -> Result<u8> {
    if src.is_empty() {
        return Err(MuxError::Malformed(format!("missing {what}")));
    }
    Ok(src.get_u8())
}

fn take_bytes(src: &mut Bytes, len: usize, what: &str) -> Result<Bytes> {
    if src.len() < len {
        return Err(MuxError::Malformed(format!(
            "truncated {what}: need {len} bytes, have {}",
            src.len()
        )));
    }
    Ok(src.split_to(len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut buf = BytesMut::new();
        let payload = b"hello, relay!";

        encode_frame(FrameKind::Message, 7, payload, &mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE + payload.len());

        let frame = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD)
            .unwrap()
            .unwrap();

        assert_eq!(frame.kind, FrameKind::Message);
        assert_eq!(frame.channel, 7);
        assert_eq!(frame.payload.as_ref(), payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_incomplete_header() {
        let mut buf = BytesMut::from(&[0x42, 0x52, 0x02][..]);
        assert!(decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap().is_none());
    }

    #[test]
    fn test_decode_incomplete_payload() {
        let mut buf = BytesMut::new();
        encode_frame(FrameKind::Message, 1, b"hello", &mut buf).unwrap();
        buf.truncate(HEADER_SIZE + 2);

        assert!(decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap().is_none());
    }

    #[test]
    fn test_decode_invalid_magic() {
        let mut buf = BytesMut::from(&[0xFF; HEADER_SIZE][..]);
        let result = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD);
        assert!(matches!(result, Err(MuxError::InvalidMagic)));
    }

    #[test]
    fn test_decode_unknown_kind() {
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u8(9);
        buf.put_u16_le(0);
        buf.put_u32_le(0);

        let result = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD);
        assert!(matches!(result, Err(MuxError::UnknownKind(9))));
    }

    #[test]
    fn test_decode_payload_too_large() {
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u8(FrameKind::Message as u8);
        buf.put_u16_le(1);
        buf.put_u32_le(1024 * 1024 * 32);

        let result = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD);
        assert!(matches!(result, Err(MuxError::PayloadTooLarge { .. })));
    }

    #[test]
    fn test_close_frame_has_empty_payload() {
        let mut buf = BytesMut::new();
        encode_frame(FrameKind::Close, 3, b"", &mut buf).unwrap();

        let frame = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD)
            .unwrap()
            .unwrap();
        assert_eq!(frame.kind, FrameKind::Close);
        assert!(frame.payload.is_empty());
        assert_eq!(frame.wire_size(), HEADER_SIZE);
    }

    #[test]
    fn open_payload_with_id_and_handshake() {
        let open = OpenPayload {
            protocol: "bridging-relay".to_string(),
            id: Some(Bytes::from_static(b"\x01\x02")),
            handshake: Some(Bytes::from_static(b"hi")),
        };
        let decoded = OpenPayload::decode(open.encode().unwrap()).unwrap();
        assert_eq!(decoded, open);
    }

    #[test]
    fn open_payload_distinguishes_empty_handshake_from_none() {
        let empty = OpenPayload {
            protocol: "p".to_string(),
            id: None,
            handshake: Some(Bytes::new()),
        };
        let none = OpenPayload {
            handshake: None,
            ..empty.clone()
        };
        assert_eq!(OpenPayload::decode(empty.encode().unwrap()).unwrap(), empty);
        assert_eq!(OpenPayload::decode(none.encode().unwrap()).unwrap(), none);
    }

    #[test]
    fn open_payload_rejects_truncation() {
        let open = OpenPayload {
            protocol: "bridging-relay".to_string(),
            id: Some(Bytes::from_static(b"abc")),
            handshake: None,
        };
        let encoded = open.encode().unwrap();
        let truncated = encoded.slice(..encoded.len() - 3);
        assert!(matches!(
            OpenPayload::decode(truncated),
            Err(MuxError::Malformed(_))
        ));
    }

    #[test]
    fn open_payload_rejects_empty_protocol() {
        let open = OpenPayload {
            protocol: String::new(),
            id: None,
            handshake: None,
        };
        assert!(matches!(open.encode(), Err(MuxError::Malformed(_))));
    }

    #[test]
    fn message_payload_split() {
        let payload = encode_message(1, b"body");
        let (message_type, body) = decode_message(payload).unwrap();
        assert_eq!(message_type, 1);
        assert_eq!(body.as_ref(), b"body");

        assert!(decode_message(Bytes::new()).is_err());
    }
}
