//! Frame codec for byte-oriented transports.
//!
//! A frame is a big-endian `u32` body length, then the body. The body starts
//! with a flag byte (`0` plain, `1` zlib) followed by the packet as JSON.
//! Datagram transports carry one body per datagram without the length prefix.

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

use super::packet::{CompressionMode, Packet};
use crate::error::ChannelError;

/// Largest accepted frame body
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Bodies smaller than this are never compressed
pub const COMPRESSION_THRESHOLD: usize = 64;

const FLAG_PLAIN: u8 = 0;
const FLAG_ZLIB: u8 = 1;

/// Encodes a packet body (flag byte plus payload).
pub fn encode_body(packet: &Packet, compression: CompressionMode) -> Result<Vec<u8>, ChannelError> {
    let json = serde_json::to_vec(packet)?;

    if compression == CompressionMode::Zlib && json.len() >= COMPRESSION_THRESHOLD {
        let mut encoder = ZlibEncoder::new(Vec::with_capacity(json.len() / 2 + 1), Compression::fast());
        encoder.write_all(&json)?;
        let compressed = encoder.finish()?;
        let mut body = Vec::with_capacity(compressed.len() + 1);
        body.push(FLAG_ZLIB);
        body.extend_from_slice(&compressed);
        return Ok(body);
    }

    let mut body = Vec::with_capacity(json.len() + 1);
    body.push(FLAG_PLAIN);
    body.extend_from_slice(&json);
    Ok(body)
}

/// Decodes a packet body produced by [`encode_body`].
pub fn decode_body(body: &[u8]) -> Result<Packet, ChannelError> {
    let (&flag, payload) = body
        .split_first()
        .ok_or(ChannelError::EmptyFrame)?;

    match flag {
        FLAG_PLAIN => Ok(serde_json::from_slice(payload)?),
        FLAG_ZLIB => {
            let mut json = Vec::new();
            ZlibDecoder::new(payload)
                .take(MAX_FRAME_LEN as u64 + 1)
                .read_to_end(&mut json)?;
            if json.len() > MAX_FRAME_LEN {
                return Err(ChannelError::FrameTooLarge(json.len()));
            }
            Ok(serde_json::from_slice(&json)?)
        }
        other => Err(ChannelError::UnknownFlag(other)),
    }
}

/// Encodes a length-prefixed frame for stream transports.
pub fn encode_frame(packet: &Packet, compression: CompressionMode) -> Result<Vec<u8>, ChannelError> {
    let body = encode_body(packet, compression)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(ChannelError::FrameTooLarge(body.len()));
    }
    let mut frame = Vec::with_capacity(body.len() + 4);
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Incremental decoder reassembling frames from a byte stream.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Returns the next complete packet, `None` when more bytes are needed.
    pub fn next_packet(&mut self) -> Result<Option<Packet>, ChannelError> {
        if self.buffer.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]]) as usize;
        if len == 0 {
            return Err(ChannelError::EmptyFrame);
        }
        if len > MAX_FRAME_LEN {
            return Err(ChannelError::FrameTooLarge(len));
        }
        if self.buffer.len() < len + 4 {
            return Ok(None);
        }
        let packet = decode_body(&self.buffer[4..len + 4]);
        self.buffer.drain(..len + 4);
        packet.map(Some)
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::ChatMode;
    use serde_json::json;

    fn large_packet() -> Packet {
        Packet::World {
            kind: 9,
            payload: json!({ "tiles": vec![7u8; 512] }),
        }
    }

    #[test]
    fn test_frames_split_across_reads() {
        let first = encode_frame(&Packet::ClientDisconnectRequest, CompressionMode::None).unwrap();
        let second = encode_frame(&large_packet(), CompressionMode::Zlib).unwrap();
        let mut stream = first.clone();
        stream.extend_from_slice(&second);

        let mut decoder = FrameDecoder::new();
        let mut decoded = Vec::new();
        for chunk in stream.chunks(7) {
            decoder.push(chunk);
            while let Some(packet) = decoder.next_packet().unwrap() {
                decoded.push(packet);
            }
        }

        assert_eq!(decoded, vec![Packet::ClientDisconnectRequest, large_packet()]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_compression_only_above_threshold() {
        let small = Packet::ChatSend {
            mode: ChatMode::Broadcast,
            text: "hi".into(),
        };
        assert_eq!(encode_body(&small, CompressionMode::Zlib).unwrap()[0], FLAG_PLAIN);

        let body = encode_body(&large_packet(), CompressionMode::Zlib).unwrap();
        assert_eq!(body[0], FLAG_ZLIB);
        let plain = encode_body(&large_packet(), CompressionMode::None).unwrap();
        assert!(body.len() < plain.len());
    }

    #[test]
    fn test_rejects_oversized_and_unknown_frames() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&((MAX_FRAME_LEN as u32) + 1).to_be_bytes());
        assert!(matches!(decoder.next_packet(), Err(ChannelError::FrameTooLarge(_))));

        assert!(matches!(decode_body(&[9, b'{', b'}']), Err(ChannelError::UnknownFlag(9))));
        assert!(matches!(decode_body(&[0, b'{']), Err(ChannelError::Malformed(_))));
    }
}
