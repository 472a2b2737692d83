//! Message codec: `header ‖ body`, the fixed header carrying magic, type, length, a
//! correlation tag, and the sender's `PeerId` (spec.md §4.A).
//!
//! The header is packed by hand at fixed offsets (not serde) so its layout is a wire
//! contract independent of any Rust-side struct change; the body is bincode, which is
//! free to evolve per message type.

use crate::identity::{PeerId, PEER_ID_LEN};
use crate::protocol::Message;

pub const MAGIC: [u8; 4] = *b"MSH1";
pub const HEADER_LEN: usize = 4 + 1 + 4 + 4 + PEER_ID_LEN; // 33 bytes

/// Body size cap for datagrams (spec.md §6 `max_udp_datagram_size` default, hard ceiling).
pub const MAX_DATAGRAM_BODY: usize = 64 * 1024;
/// Body size cap for reliable-stream frames (spec.md §4.A).
pub const MAX_STREAM_BODY: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub kind: u8,
    pub body_len: u32,
    pub tag: u32,
    pub sender: PeerId,
}

fn pack_header(header: &Header, out: &mut Vec<u8>) {
    out.extend_from_slice(&MAGIC);
    out.push(header.kind);
    out.extend_from_slice(&header.body_len.to_le_bytes());
    out.extend_from_slice(&header.tag.to_le_bytes());
    out.extend_from_slice(header.sender.as_bytes());
}

fn unpack_header(bytes: &[u8]) -> Result<Header, FrameDecodeError> {
    if bytes.len() < HEADER_LEN {
        return Err(FrameDecodeError::Truncated);
    }
    if bytes[0..4] != MAGIC {
        return Err(FrameDecodeError::WrongMagic);
    }
    let kind = bytes[4];
    let body_len = u32::from_le_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]);
    let tag = u32::from_le_bytes([bytes[9], bytes[10], bytes[11], bytes[12]]);
    let mut sender_bytes = [0u8; PEER_ID_LEN];
    sender_bytes.copy_from_slice(&bytes[13..13 + PEER_ID_LEN]);
    Ok(Header {
        kind,
        body_len,
        tag,
        sender: PeerId::from_bytes(sender_bytes),
    })
}

fn encode_frame(
    msg: &Message,
    tag: u32,
    sender: PeerId,
    max_body: usize,
) -> Result<Vec<u8>, FrameEncodeError> {
    let body = bincode::serialize(msg).map_err(FrameEncodeError::Encode)?;
    if body.len() > max_body {
        return Err(FrameEncodeError::BodyTooLarge);
    }
    let header = Header {
        kind: msg.kind(),
        body_len: body.len() as u32,
        tag,
        sender,
    };
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    pack_header(&header, &mut out);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Encode a datagram frame (64 KiB body cap).
pub fn encode_datagram(msg: &Message, tag: u32, sender: PeerId) -> Result<Vec<u8>, FrameEncodeError> {
    encode_frame(msg, tag, sender, MAX_DATAGRAM_BODY)
}

/// Encode a reliable-stream frame (16 MiB body cap).
pub fn encode_stream_frame(msg: &Message, tag: u32, sender: PeerId) -> Result<Vec<u8>, FrameEncodeError> {
    encode_frame(msg, tag, sender, MAX_STREAM_BODY)
}

/// Decode one frame from the front of `bytes`, enforcing `max_body`. Returns the header,
/// the decoded message, and the total number of bytes consumed.
fn decode_frame(bytes: &[u8], max_body: usize) -> Result<(Header, Message, usize), FrameDecodeError> {
    let header = unpack_header(bytes)?;
    let body_len = header.body_len as usize;
    if body_len > max_body {
        return Err(FrameDecodeError::BodyTooLarge);
    }
    if bytes.len() < HEADER_LEN + body_len {
        return Err(FrameDecodeError::Truncated);
    }
    let body = &bytes[HEADER_LEN..HEADER_LEN + body_len];
    let msg: Message = bincode::deserialize(body).map_err(FrameDecodeError::Decode)?;
    Ok((header, msg, HEADER_LEN + body_len))
}

/// Decode a single complete datagram. Datagrams never arrive partially (UDP delivers
/// whole packets or not at all), so there is no "need more bytes" case here.
pub fn decode_datagram(bytes: &[u8]) -> Result<(Header, Message), FrameDecodeError> {
    let (header, msg, consumed) = decode_frame(bytes, MAX_DATAGRAM_BODY)?;
    if consumed != bytes.len() {
        return Err(FrameDecodeError::Truncated);
    }
    Ok((header, msg))
}

/// Decode one frame from a stream buffer that may contain a partial trailing frame.
/// Returns `Err(Truncated)` when the caller should wait for more bytes.
pub fn decode_stream_frame(bytes: &[u8]) -> Result<(Header, Message, usize), FrameDecodeError> {
    decode_frame(bytes, MAX_STREAM_BODY)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[source] bincode::Error),
    #[error("frame body exceeds the size cap")]
    BodyTooLarge,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("wrong magic bytes")]
    WrongMagic,
    #[error("frame body exceeds the size cap")]
    BodyTooLarge,
    #[error("frame truncated, need more bytes")]
    Truncated,
    #[error("decode error: {0}")]
    Decode(#[source] bincode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{GetChunkStatus, Message};

    fn sample() -> Message {
        Message::Ping {
            sender: PeerId::generate(),
        }
    }

    #[test]
    fn roundtrip_datagram() {
        let sender = PeerId::generate();
        let msg = sample();
        let frame = encode_datagram(&msg, 7, sender).unwrap();
        let (header, decoded) = decode_datagram(&frame).unwrap();
        assert_eq!(header.tag, 7);
        assert_eq!(header.sender, sender);
        match decoded {
            Message::Ping { sender: s } => assert_eq!(s, sender),
            _ => panic!("expected Ping"),
        }
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let sender = PeerId::generate();
        let mut frame = encode_datagram(&sample(), 1, sender).unwrap();
        frame[0] = b'X';
        assert!(matches!(
            decode_datagram(&frame),
            Err(FrameDecodeError::WrongMagic)
        ));
    }

    #[test]
    fn truncated_datagram_is_rejected() {
        let sender = PeerId::generate();
        let frame = encode_datagram(&sample(), 1, sender).unwrap();
        assert!(matches!(
            decode_datagram(&frame[..frame.len() - 1]),
            Err(FrameDecodeError::Truncated)
        ));
    }

    #[test]
    fn stream_frame_partial_read_needs_more() {
        let sender = PeerId::generate();
        let frame = encode_stream_frame(&sample(), 1, sender).unwrap();
        assert!(matches!(
            decode_stream_frame(&frame[..HEADER_LEN]),
            Err(FrameDecodeError::Truncated)
        ));
        assert!(matches!(
            decode_stream_frame(&frame[..4]),
            Err(FrameDecodeError::Truncated)
        ));
    }

    #[test]
    fn stream_frames_are_fifo_in_one_buffer() {
        let sender = PeerId::generate();
        let a = encode_stream_frame(&sample(), 1, sender).unwrap();
        let b = encode_stream_frame(
            &Message::GetChunkResult {
                status: GetChunkStatus::Ok,
                chunk_size: 10,
            },
            2,
            sender,
        )
        .unwrap();
        let mut buf = Vec::new();
        buf.extend_from_slice(&a);
        buf.extend_from_slice(&b);
        let (h1, m1, n1) = decode_stream_frame(&buf).unwrap();
        assert_eq!(n1, a.len());
        assert_eq!(h1.tag, 1);
        assert!(matches!(m1, Message::Ping { .. }));
        let (h2, m2, n2) = decode_stream_frame(&buf[n1..]).unwrap();
        assert_eq!(n2, b.len());
        assert_eq!(h2.tag, 2);
        assert!(matches!(m2, Message::GetChunkResult { .. }));
    }

    #[test]
    fn oversize_body_rejected_at_encode() {
        let sender = PeerId::generate();
        let huge = Message::Chat {
            text: "x".repeat(MAX_DATAGRAM_BODY + 1),
        };
        assert!(matches!(
            encode_datagram(&huge, 1, sender),
            Err(FrameEncodeError::BodyTooLarge)
        ));
    }
}
