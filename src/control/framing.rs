//! Control-plane binary framing.
//!
//! ```text
//! magic(2)=4D 4E | ver(1)=1 | type(1) | seq(4 LE) | len(4 LE) | payload
//! ```
//!
//! Payloads above 1 MiB are a framing violation; the session is closed.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

pub const MAGIC: [u8; 2] = [0x4D, 0x4E];
pub const VERSION: u8 = 1;
pub const HEADER_LEN: usize = 2 + 1 + 1 + 4 + 4;
pub const MAX_PAYLOAD: usize = 1024 * 1024;

/// Message kinds on the control wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    AuthChallenge = 1,
    AuthResponse = 2,
    AuthSuccess = 3,
    AuthFailure = 4,
    Ping = 5,
    Pong = 6,
    GetStatus = 10,
    Status = 11,
    GetConnections = 12,
    Connections = 13,
    GetChannels = 14,
    Channels = 15,
    GetUsers = 16,
    Users = 17,
    JoinChannel = 20,
    PartChannel = 21,
    SendMessage = 22,
    SendRaw = 23,
    Connect = 24,
    Disconnect = 25,
    Shutdown = 26,
    IrcMessage = 40,
    ConnectionStateChanged = 41,
    NotSupported = 254,
    Error = 255,
}

impl FrameType {
    pub fn from_u8(raw: u8) -> Option<FrameType> {
        Some(match raw {
            1 => FrameType::AuthChallenge,
            2 => FrameType::AuthResponse,
            3 => FrameType::AuthSuccess,
            4 => FrameType::AuthFailure,
            5 => FrameType::Ping,
            6 => FrameType::Pong,
            10 => FrameType::GetStatus,
            11 => FrameType::Status,
            12 => FrameType::GetConnections,
            13 => FrameType::Connections,
            14 => FrameType::GetChannels,
            15 => FrameType::Channels,
            16 => FrameType::GetUsers,
            17 => FrameType::Users,
            20 => FrameType::JoinChannel,
            21 => FrameType::PartChannel,
            22 => FrameType::SendMessage,
            23 => FrameType::SendRaw,
            24 => FrameType::Connect,
            25 => FrameType::Disconnect,
            26 => FrameType::Shutdown,
            40 => FrameType::IrcMessage,
            41 => FrameType::ConnectionStateChanged,
            254 => FrameType::NotSupported,
            255 => FrameType::Error,
            _ => return None,
        })
    }
}

/// One control-plane record. Unknown types surface with `frame_type`
/// `None` so the session can answer `NotSupported` instead of dying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: Option<FrameType>,
    pub raw_type: u8,
    pub seq: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(frame_type: FrameType, seq: u32, payload: Vec<u8>) -> Frame {
        Frame {
            frame_type: Some(frame_type),
            raw_type: frame_type as u8,
            seq,
            payload,
        }
    }
}

#[derive(Debug, Default)]
pub struct ControlCodec;

impl Decoder for ControlCodec {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        if src[0..2] != MAGIC {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "bad control magic",
            ));
        }
        if src[2] != VERSION {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "unsupported control version",
            ));
        }
        let raw_type = src[3];
        let seq = u32::from_le_bytes([src[4], src[5], src[6], src[7]]);
        let len = u32::from_le_bytes([src[8], src[9], src[10], src[11]]) as usize;
        if len > MAX_PAYLOAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "control payload exceeds 1 MiB",
            ));
        }
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }
        src.advance(HEADER_LEN);
        let payload = src.split_to(len).to_vec();
        Ok(Some(Frame {
            frame_type: FrameType::from_u8(raw_type),
            raw_type,
            seq,
            payload,
        }))
    }
}

impl Encoder<Frame> for ControlCodec {
    type Error = std::io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if frame.payload.len() > MAX_PAYLOAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "control payload exceeds 1 MiB",
            ));
        }
        dst.reserve(HEADER_LEN + frame.payload.len());
        dst.put_slice(&MAGIC);
        dst.put_u8(VERSION);
        dst.put_u8(frame.raw_type);
        dst.put_u32_le(frame.seq);
        dst.put_u32_le(frame.payload.len() as u32);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(frame: Frame) -> Frame {
        let mut codec = ControlCodec;
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();
        codec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn encode_decode_round_trip() {
        let frame = Frame::new(FrameType::SendMessage, 42, b"libera\0#rust\0hello".to_vec());
        let decoded = round_trip(frame.clone());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn wire_layout_is_exact() {
        let mut codec = ControlCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::new(FrameType::Ping, 0x01020304, b"ab".to_vec()), &mut buf)
            .unwrap();
        assert_eq!(&buf[0..2], &[0x4D, 0x4E]);
        assert_eq!(buf[2], 1);
        assert_eq!(buf[3], 5);
        // Little-endian seq and length.
        assert_eq!(&buf[4..8], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&buf[8..12], &[0x02, 0x00, 0x00, 0x00]);
        assert_eq!(&buf[12..], b"ab");
    }

    #[test]
    fn partial_header_waits() {
        let mut codec = ControlCodec;
        let mut buf = BytesMut::from(&MAGIC[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn split_payload_reassembles() {
        let mut codec = ControlCodec;
        let mut full = BytesMut::new();
        codec
            .encode(Frame::new(FrameType::SendRaw, 7, vec![9; 100]), &mut full)
            .unwrap();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&full[..HEADER_LEN + 10]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&full[HEADER_LEN + 10..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.seq, 7);
        assert_eq!(frame.payload.len(), 100);
    }

    #[test]
    fn bad_magic_is_fatal() {
        let mut codec = ControlCodec;
        let mut buf = BytesMut::from(&b"XX\x01\x05\x00\x00\x00\x00\x00\x00\x00\x00"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn oversized_payload_is_fatal() {
        let mut codec = ControlCodec;
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u8(VERSION);
        buf.put_u8(5);
        buf.put_u32_le(1);
        buf.put_u32_le((MAX_PAYLOAD + 1) as u32);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn unknown_type_still_decodes() {
        let mut codec = ControlCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(
                Frame {
                    frame_type: None,
                    raw_type: 200,
                    seq: 1,
                    payload: Vec::new(),
                },
                &mut buf,
            )
            .unwrap();
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.frame_type, None);
        assert_eq!(frame.raw_type, 200);
    }
}
