//! The framed text-message codec used on the game socket. Only whole text
//! frames plus the three control frames are supported; fragmentation and
//! binary payloads are protocol errors that cost the sender its connection.

use bytes::{BufMut, BytesMut};
use protocol::MAX_FRAME_PAYLOAD;
use thiserror::Error;

const OPCODE_TEXT: u8 = 0x1;
const OPCODE_CLOSE: u8 = 0x8;
const OPCODE_PING: u8 = 0x9;
const OPCODE_PONG: u8 = 0xA;

const FIN_BIT: u8 = 0x80;
const MASK_BIT: u8 = 0x80;

/// One decoded frame, control frames included. Application code upstream
/// only ever sees the text variant; the endpoint answers the rest inline.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

/// Everything that forces a protocol-error close.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("fragmented frames are not supported")]
    Fragmented,
    #[error("unsupported opcode {0:#x}")]
    UnsupportedOpcode(u8),
    #[error("payload of {0} bytes exceeds the 64 KiB limit")]
    PayloadTooLarge(usize),
    #[error("client frame arrived unmasked")]
    MissingMask,
    #[error("control frame payload exceeds 125 bytes")]
    OversizedControl,
    #[error("text frame is not valid UTF-8")]
    InvalidUtf8,
}

/// Tries to decode one frame from the front of `buffer`.
///
/// Returns `Ok(None)` when more bytes are needed, otherwise the frame and
/// the number of bytes it consumed. The server passes `require_mask` so
/// unmasked client frames are thrown out; the client side of tests decodes
/// the unmasked server direction with it unset.
pub fn decode(buffer: &[u8], require_mask: bool) -> Result<Option<(Frame, usize)>, FrameError> {
    if buffer.len() < 2 {
        return Ok(None);
    }
    let first = buffer[0];
    let second = buffer[1];
    let opcode = first & 0x0F;
    if first & FIN_BIT == 0 {
        return Err(FrameError::Fragmented);
    }
    if !matches!(opcode, OPCODE_TEXT | OPCODE_CLOSE | OPCODE_PING | OPCODE_PONG) {
        return Err(FrameError::UnsupportedOpcode(opcode));
    }
    let masked = second & MASK_BIT != 0;
    if require_mask && !masked {
        return Err(FrameError::MissingMask);
    }

    let short_len = (second & 0x7F) as usize;
    let (payload_len, length_bytes) = match short_len {
        126 => {
            if buffer.len() < 4 {
                return Ok(None);
            }
            (u16::from_be_bytes([buffer[2], buffer[3]]) as usize, 2)
        }
        127 => {
            if buffer.len() < 10 {
                return Ok(None);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buffer[2..10]);
            let len = u64::from_be_bytes(raw);
            if len > MAX_FRAME_PAYLOAD as u64 {
                return Err(FrameError::PayloadTooLarge(len as usize));
            }
            (len as usize, 8)
        }
        len => (len, 0),
    };
    if payload_len > MAX_FRAME_PAYLOAD {
        return Err(FrameError::PayloadTooLarge(payload_len));
    }
    if opcode != OPCODE_TEXT && payload_len > 125 {
        return Err(FrameError::OversizedControl);
    }

    let mask_len = if masked { 4 } else { 0 };
    let header_len = 2 + length_bytes + mask_len;
    let total = header_len + payload_len;
    if buffer.len() < total {
        return Ok(None);
    }

    let mut payload = buffer[header_len..total].to_vec();
    if masked {
        let mask_offset = 2 + length_bytes;
        let mask: [u8; 4] = [
            buffer[mask_offset],
            buffer[mask_offset + 1],
            buffer[mask_offset + 2],
            buffer[mask_offset + 3],
        ];
        for (index, byte) in payload.iter_mut().enumerate() {
            *byte ^= mask[index % 4];
        }
    }

    let frame = match opcode {
        OPCODE_TEXT => {
            let text = String::from_utf8(payload).map_err(|_| FrameError::InvalidUtf8)?;
            Frame::Text(text)
        }
        OPCODE_PING => Frame::Ping(payload),
        OPCODE_PONG => Frame::Pong(payload),
        _ => Frame::Close,
    };
    Ok(Some((frame, total)))
}

/// Writes one frame header plus payload. Server-to-client traffic goes out
/// unmasked; the mask parameter exists for the client side of tests.
fn encode(opcode: u8, payload: &[u8], mask: Option<[u8; 4]>) -> BytesMut {
    let mut out = BytesMut::with_capacity(payload.len() + 14);
    out.put_u8(FIN_BIT | opcode);
    let mask_bit = if mask.is_some() { MASK_BIT } else { 0 };
    match payload.len() {
        len if len < 126 => out.put_u8(mask_bit | len as u8),
        len if len <= u16::MAX as usize => {
            out.put_u8(mask_bit | 126);
            out.put_u16(len as u16);
        }
        len => {
            out.put_u8(mask_bit | 127);
            out.put_u64(len as u64);
        }
    }
    match mask {
        Some(key) => {
            out.put_slice(&key);
            for (index, byte) in payload.iter().enumerate() {
                out.put_u8(byte ^ key[index % 4]);
            }
        }
        None => out.put_slice(payload),
    }
    out
}

pub fn encode_text(payload: &str, mask: Option<[u8; 4]>) -> BytesMut {
    encode(OPCODE_TEXT, payload.as_bytes(), mask)
}

pub fn encode_pong(payload: &[u8], mask: Option<[u8; 4]>) -> BytesMut {
    encode(OPCODE_PONG, payload, mask)
}

pub fn encode_ping(payload: &[u8], mask: Option<[u8; 4]>) -> BytesMut {
    encode(OPCODE_PING, payload, mask)
}

/// The close frame is an empty opcode-0x8 frame.
pub fn encode_close(mask: Option<[u8; 4]>) -> BytesMut {
    encode(OPCODE_CLOSE, &[], mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASK: [u8; 4] = [0x12, 0x34, 0x56, 0x78];

    fn decode_all(bytes: &[u8]) -> (Frame, usize) {
        decode(bytes, true).unwrap().expect("frame should be complete")
    }

    #[test]
    fn masked_text_round_trips() {
        let encoded = encode_text("hello maze", Some(MASK));
        let (frame, used) = decode_all(&encoded);
        assert_eq!(frame, Frame::Text("hello maze".into()));
        assert_eq!(used, encoded.len());
    }

    #[test]
    fn sixteen_bit_length_round_trips() {
        let long = "x".repeat(400);
        let encoded = encode_text(&long, Some(MASK));
        // 126 marker plus two length bytes.
        assert_eq!(encoded[1] & 0x7F, 126);
        let (frame, _) = decode_all(&encoded);
        assert_eq!(frame, Frame::Text(long));
    }

    #[test]
    fn sixty_four_bit_length_is_accepted_within_the_cap() {
        let payload = "y".repeat(700);
        let mut encoded = BytesMut::new();
        encoded.put_u8(FIN_BIT | OPCODE_TEXT);
        encoded.put_u8(MASK_BIT | 127);
        encoded.put_u64(payload.len() as u64);
        encoded.put_slice(&MASK);
        for (index, byte) in payload.as_bytes().iter().enumerate() {
            encoded.put_u8(byte ^ MASK[index % 4]);
        }
        let (frame, _) = decode_all(&encoded);
        assert_eq!(frame, Frame::Text(payload));
    }

    #[test]
    fn incomplete_frames_ask_for_more() {
        let encoded = encode_text("partial", Some(MASK));
        assert_eq!(decode(&encoded[..1], true).unwrap(), None);
        assert_eq!(decode(&encoded[..encoded.len() - 1], true).unwrap(), None);
    }

    #[test]
    fn fragmentation_is_a_protocol_error() {
        let mut encoded = encode_text("frag", Some(MASK));
        encoded[0] &= !FIN_BIT;
        assert_eq!(decode(&encoded, true), Err(FrameError::Fragmented));
    }

    #[test]
    fn binary_opcode_is_rejected() {
        let mut encoded = encode_text("data", Some(MASK));
        encoded[0] = FIN_BIT | 0x2;
        assert_eq!(decode(&encoded, true), Err(FrameError::UnsupportedOpcode(0x2)));
    }

    #[test]
    fn unmasked_client_frames_are_rejected() {
        let encoded = encode_text("nope", None);
        assert_eq!(decode(&encoded, true), Err(FrameError::MissingMask));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let mut encoded = BytesMut::new();
        encoded.put_u8(FIN_BIT | OPCODE_TEXT);
        encoded.put_u8(MASK_BIT | 127);
        encoded.put_u64(MAX_FRAME_PAYLOAD as u64 + 1);
        encoded.put_slice(&MASK);
        assert!(matches!(
            decode(&encoded, true),
            Err(FrameError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn control_frames_decode_inline() {
        let (frame, _) = decode_all(&encode_ping(b"beat", Some(MASK)));
        assert_eq!(frame, Frame::Ping(b"beat".to_vec()));
        let (frame, _) = decode_all(&encode_close(Some(MASK)));
        assert_eq!(frame, Frame::Close);
    }

    #[test]
    fn garbage_text_is_rejected() {
        let encoded = encode(OPCODE_TEXT, &[0xFF, 0xFE, 0xFD], Some(MASK));
        assert_eq!(decode(&encoded, true), Err(FrameError::InvalidUtf8));
    }
}
