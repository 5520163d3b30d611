//! IRC line framing.
//!
//! CRLF-terminated lines, decoded as UTF-8 with a latin-1 fallback for
//! lines that fail UTF-8 (plenty of legacy clients still emit it).
//! Outbound lines are length-checked against the 512-byte limit at the
//! queue, so the encoder only appends the terminator.

use bytes::{BufMut, BytesMut};
use encoding_rs::WINDOWS_1252;
use tokio_util::codec::{Decoder, Encoder};

use munin_proto::MAX_LINE_LEN;

/// Hard cap on an inbound line before we declare the peer broken.
/// Generous beyond 512 to tolerate servers with tag-heavy lines.
const MAX_INBOUND_LINE: usize = 8192;

#[derive(Debug, Default)]
pub struct IrcCodec {
    /// Scan position to avoid re-searching the buffer prefix.
    scanned: usize,
}

impl IrcCodec {
    pub fn new() -> IrcCodec {
        IrcCodec::default()
    }
}

fn decode_line(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => {
            let (decoded, _, _) = WINDOWS_1252.decode(bytes);
            decoded.into_owned()
        }
    }
}

impl Decoder for IrcCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        if let Some(pos) = src[self.scanned..].iter().position(|&b| b == b'\n') {
            let pos = self.scanned + pos;
            let line = src.split_to(pos + 1);
            self.scanned = 0;
            let mut end = line.len() - 1;
            if end > 0 && line[end - 1] == b'\r' {
                end -= 1;
            }
            return Ok(Some(decode_line(&line[..end])));
        }
        self.scanned = src.len();
        if src.len() > MAX_INBOUND_LINE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "line exceeds maximum length",
            ));
        }
        Ok(None)
    }
}

impl Encoder<String> for IrcCodec {
    type Error = std::io::Error;

    fn encode(&mut self, line: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if line.len() + 2 > MAX_LINE_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "line exceeds 512 bytes",
            ));
        }
        dst.reserve(line.len() + 2);
        dst.put_slice(line.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_crlf_lines() {
        let mut codec = IrcCodec::new();
        let mut buf = BytesMut::from(&b"PING :abc\r\nPONG :def\r\n"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some("PING :abc".into()));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some("PONG :def".into()));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn tolerates_bare_lf() {
        let mut codec = IrcCodec::new();
        let mut buf = BytesMut::from(&b"NOTICE * :hi\n"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some("NOTICE * :hi".into()));
    }

    #[test]
    fn partial_line_waits_for_more() {
        let mut codec = IrcCodec::new();
        let mut buf = BytesMut::from(&b"PRIVMSG #x :hel"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"lo\r\n");
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some("PRIVMSG #x :hello".into())
        );
    }

    #[test]
    fn latin1_fallback() {
        let mut codec = IrcCodec::new();
        // 0xE9 is 'é' in windows-1252 and invalid UTF-8 on its own.
        let mut buf = BytesMut::from(&b"PRIVMSG #x :caf\xe9\r\n"[..]);
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some("PRIVMSG #x :café".into())
        );
    }

    #[test]
    fn encoder_appends_crlf() {
        let mut codec = IrcCodec::new();
        let mut buf = BytesMut::new();
        codec.encode("QUIT :bye".to_string(), &mut buf).unwrap();
        assert_eq!(&buf[..], b"QUIT :bye\r\n");
    }

    #[test]
    fn encoder_rejects_oversized_line() {
        let mut codec = IrcCodec::new();
        let mut buf = BytesMut::new();
        let line = format!("PRIVMSG #x :{}", "a".repeat(600));
        assert!(codec.encode(line, &mut buf).is_err());
    }
}
