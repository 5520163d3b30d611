//! Proxy handshakes: SOCKS4, SOCKS5 and HTTP CONNECT.
//!
//! Each handshake runs over an already-connected byte stream and leaves
//! it ready to carry the IRC session to `(target_host, target_port)`.
//! The handshakes are generic over the stream so they test against
//! in-memory duplex pipes.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{AgentError, AgentResult};

/// SOCKS4 CONNECT. Hostnames are resolved locally (A record only);
/// SOCKS4 has no room for a domain in the request.
pub async fn socks4_connect<S>(
    stream: &mut S,
    target_host: &str,
    target_port: u16,
    userid: &str,
) -> AgentResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let addr = resolve_ipv4(target_host, target_port).await?;

    let mut request = Vec::with_capacity(9 + userid.len());
    request.push(0x04);
    request.push(0x01);
    request.extend_from_slice(&target_port.to_be_bytes());
    request.extend_from_slice(&addr.octets());
    request.extend_from_slice(userid.as_bytes());
    request.push(0x00);
    stream.write_all(&request).await?;

    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply).await?;
    match reply[1] {
        0x5A => Ok(()),
        0x5B => Err(AgentError::Transport("SOCKS4: request rejected".into())),
        0x5C | 0x5D => Err(AgentError::Transport("SOCKS4: identd check failed".into())),
        other => Err(AgentError::Transport(format!(
            "SOCKS4: unknown reply status {:#04x}",
            other
        ))),
    }
}

async fn resolve_ipv4(host: &str, port: u16) -> AgentResult<std::net::Ipv4Addr> {
    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| AgentError::Transport(format!("resolve {}: {}", host, e)))?;
    for addr in addrs {
        if let std::net::SocketAddr::V4(v4) = addr {
            return Ok(*v4.ip());
        }
    }
    Err(AgentError::Transport(format!("no A record for {}", host)))
}

/// SOCKS5 CONNECT with optional RFC 1929 username/password auth. The
/// target goes through as a DOMAIN address; the proxy resolves it.
pub async fn socks5_connect<S>(
    stream: &mut S,
    target_host: &str,
    target_port: u16,
    credentials: Option<(&str, &str)>,
) -> AgentResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Method negotiation.
    let greeting: &[u8] = match credentials {
        Some(_) => &[0x05, 0x02, 0x00, 0x02],
        None => &[0x05, 0x01, 0x00],
    };
    stream.write_all(greeting).await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != 0x05 {
        return Err(AgentError::Transport("SOCKS5: bad version in reply".into()));
    }
    match choice[1] {
        0x00 => {}
        0x02 => {
            let (user, pass) = credentials
                .ok_or_else(|| AgentError::Transport("SOCKS5 requires auth".into()))?;
            socks5_userpass(stream, user, pass).await?;
        }
        0xFF => return Err(AgentError::Transport("SOCKS5 requires auth".into())),
        other => {
            return Err(AgentError::Transport(format!(
                "SOCKS5: unsupported method {:#04x}",
                other
            )))
        }
    }

    // CONNECT request with a domain target.
    if target_host.len() > 255 {
        return Err(AgentError::Transport("SOCKS5: hostname too long".into()));
    }
    let mut request = Vec::with_capacity(7 + target_host.len());
    request.extend_from_slice(&[0x05, 0x01, 0x00, 0x03, target_host.len() as u8]);
    request.extend_from_slice(target_host.as_bytes());
    request.extend_from_slice(&target_port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[1] != 0x00 {
        return Err(AgentError::Transport(format!(
            "SOCKS5: connect failed, status {:#04x}",
            head[1]
        )));
    }

    // Consume the bound address per ATYP.
    let remaining = match head[3] {
        0x01 => 4 + 2,
        0x04 => 16 + 2,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize + 2
        }
        other => {
            return Err(AgentError::Transport(format!(
                "SOCKS5: unknown address type {:#04x}",
                other
            )))
        }
    };
    let mut bound = vec![0u8; remaining];
    stream.read_exact(&mut bound).await?;
    Ok(())
}

async fn socks5_userpass<S>(stream: &mut S, user: &str, pass: &str) -> AgentResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if user.len() > 255 || pass.len() > 255 {
        return Err(AgentError::Transport("SOCKS5: credentials too long".into()));
    }
    let mut request = Vec::with_capacity(3 + user.len() + pass.len());
    request.push(0x01);
    request.push(user.len() as u8);
    request.extend_from_slice(user.as_bytes());
    request.push(pass.len() as u8);
    request.extend_from_slice(pass.as_bytes());
    stream.write_all(&request).await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[1] != 0x00 {
        return Err(AgentError::AuthFailed("SOCKS5: proxy rejected credentials".into()));
    }
    Ok(())
}

/// HTTP CONNECT tunnel.
pub async fn http_connect<S>(
    stream: &mut S,
    target_host: &str,
    target_port: u16,
    credentials: Option<(&str, &str)>,
) -> AgentResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n",
        host = target_host,
        port = target_port
    );
    if let Some((user, pass)) = credentials {
        let token = STANDARD.encode(format!("{}:{}", user, pass));
        request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", token));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    // Read the response head byte-wise until the blank line; the tunnel
    // payload must not be consumed.
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() > 16 * 1024 {
            return Err(AgentError::Transport("HTTP proxy: oversized response".into()));
        }
        stream.read_exact(&mut byte).await?;
        head.push(byte[0]);
    }

    let status = String::from_utf8_lossy(&head);
    let first = status.lines().next().unwrap_or_default();
    if !first.starts_with("HTTP/1.") || !first.contains(" 200 ") {
        return Err(AgentError::Transport(format!(
            "HTTP proxy: connect refused: {}",
            first.trim()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn socks5_no_auth_happy_path() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let peer = tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x00]);
            server.write_all(&[0x05, 0x00]).await.unwrap();

            let mut head = [0u8; 5];
            server.read_exact(&mut head).await.unwrap();
            assert_eq!(&head[..4], &[0x05, 0x01, 0x00, 0x03]);
            let mut rest = vec![0u8; head[4] as usize + 2];
            server.read_exact(&mut rest).await.unwrap();

            // Success with an IPv4 bound address.
            server
                .write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x1F, 0x90])
                .await
                .unwrap();
        });
        socks5_connect(&mut client, "irc.example", 6697, None)
            .await
            .unwrap();
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn socks5_domain_bound_address_consumed() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let peer = tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[0x05, 0x00]).await.unwrap();
            let mut head = [0u8; 5];
            server.read_exact(&mut head).await.unwrap();
            let mut rest = vec![0u8; head[4] as usize + 2];
            server.read_exact(&mut rest).await.unwrap();

            // Reply with a DOMAIN bound address: 1 + len + 2 trailing bytes.
            let bound = b"proxy.example";
            let mut reply = vec![0x05, 0x00, 0x00, 0x03, bound.len() as u8];
            reply.extend_from_slice(bound);
            reply.extend_from_slice(&[0x1F, 0x90]);
            // Then a first byte of tunneled traffic that must survive.
            reply.push(b':');
            server.write_all(&reply).await.unwrap();
        });
        socks5_connect(&mut client, "irc.example", 6697, None)
            .await
            .unwrap();
        // The tunnel byte is still readable.
        let mut b = [0u8; 1];
        client.read_exact(&mut b).await.unwrap();
        assert_eq!(b[0], b':');
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn socks5_no_acceptable_method() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[0x05, 0xFF]).await.unwrap();
        });
        let err = socks5_connect(&mut client, "irc.example", 6697, None)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "transport");
        assert!(err.to_string().contains("requires auth"));
    }

    #[tokio::test]
    async fn socks5_userpass_subnegotiation() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let peer = tokio::spawn(async move {
            let mut greeting = [0u8; 4];
            server.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x02, 0x00, 0x02]);
            server.write_all(&[0x05, 0x02]).await.unwrap();

            let mut ver_ulen = [0u8; 2];
            server.read_exact(&mut ver_ulen).await.unwrap();
            assert_eq!(ver_ulen[0], 0x01);
            let mut user = vec![0u8; ver_ulen[1] as usize];
            server.read_exact(&mut user).await.unwrap();
            assert_eq!(user, b"alice");
            let mut plen = [0u8; 1];
            server.read_exact(&mut plen).await.unwrap();
            let mut pass = vec![0u8; plen[0] as usize];
            server.read_exact(&mut pass).await.unwrap();
            assert_eq!(pass, b"sesame");
            server.write_all(&[0x01, 0x00]).await.unwrap();

            let mut head = [0u8; 5];
            server.read_exact(&mut head).await.unwrap();
            let mut rest = vec![0u8; head[4] as usize + 2];
            server.read_exact(&mut rest).await.unwrap();
            server
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });
        socks5_connect(&mut client, "irc.example", 6697, Some(("alice", "sesame")))
            .await
            .unwrap();
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn http_connect_happy_path() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let peer = tokio::spawn(async move {
            let mut buf = vec![0u8; 1];
            let mut req = Vec::new();
            while !req.ends_with(b"\r\n\r\n") {
                server.read_exact(&mut buf).await.unwrap();
                req.push(buf[0]);
            }
            let req = String::from_utf8(req).unwrap();
            assert!(req.starts_with("CONNECT irc.example:6697 HTTP/1.1\r\n"));
            assert!(req.contains("Host: irc.example:6697\r\n"));
            server
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();
        });
        http_connect(&mut client, "irc.example", 6697, None)
            .await
            .unwrap();
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn http_connect_includes_basic_auth() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let peer = tokio::spawn(async move {
            let mut buf = vec![0u8; 1];
            let mut req = Vec::new();
            while !req.ends_with(b"\r\n\r\n") {
                server.read_exact(&mut buf).await.unwrap();
                req.push(buf[0]);
            }
            let req = String::from_utf8(req).unwrap();
            // base64("user:pw")
            assert!(req.contains("Proxy-Authorization: Basic dXNlcjpwdw==\r\n"));
            server.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
        });
        http_connect(&mut client, "irc.example", 6697, Some(("user", "pw")))
            .await
            .unwrap();
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn http_connect_rejection() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1];
            let mut req = Vec::new();
            while !req.ends_with(b"\r\n\r\n") {
                server.read_exact(&mut buf).await.unwrap();
                req.push(buf[0]);
            }
            server
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await
                .unwrap();
        });
        let err = http_connect(&mut client, "irc.example", 6697, None)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "transport");
    }

    #[tokio::test]
    async fn socks4_reply_status_checked() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let mut req = Vec::new();
            let mut b = [0u8; 1];
            // 8 fixed bytes then userid until NUL.
            for _ in 0..8 {
                server.read_exact(&mut b).await.unwrap();
                req.push(b[0]);
            }
            loop {
                server.read_exact(&mut b).await.unwrap();
                if b[0] == 0 {
                    break;
                }
            }
            assert_eq!(req[0], 0x04);
            assert_eq!(req[1], 0x01);
            server
                .write_all(&[0x00, 0x5B, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });
        // 127.0.0.1 avoids DNS in tests.
        let err = socks4_connect(&mut client, "127.0.0.1", 6667, "munin")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("rejected"));
    }
}
