//! Byte-transport establishment: TCP, optional proxy hop, optional TLS.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{info, warn};

use crate::config::{ProxyConfig, ProxyKind, ServerConfig};
use crate::error::{AgentError, AgentResult};
use crate::irc::proxy;
use crate::keystore::Keystore;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const PROXY_TIMEOUT: Duration = Duration::from_secs(15);
const TLS_TIMEOUT: Duration = Duration::from_secs(15);

/// A connected IRC byte stream, plaintext or TLS.
pub enum IrcStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for IrcStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            IrcStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            IrcStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IrcStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            IrcStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            IrcStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            IrcStream::Plain(s) => Pin::new(s).poll_flush(cx),
            IrcStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            IrcStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            IrcStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Establish the full transport chain for a server: TCP (to the proxy
/// when configured, else the server), proxy handshake, TLS.
pub async fn establish(config: &ServerConfig, keystore: Option<&Keystore>) -> AgentResult<IrcStream> {
    let (dial_host, dial_port) = match &config.proxy {
        Some(proxy) => (proxy.host.as_str(), proxy.port),
        None => (config.host.as_str(), config.port),
    };

    let tcp = tokio::time::timeout(
        CONNECT_TIMEOUT,
        TcpStream::connect((dial_host, dial_port)),
    )
    .await
    .map_err(|_| AgentError::Timeout(format!("connect to {}:{}", dial_host, dial_port)))?
    .map_err(|e| AgentError::Transport(format!("connect to {}:{}: {}", dial_host, dial_port, e)))?;

    let mut tcp = tcp;
    if let Some(proxy_config) = &config.proxy {
        tokio::time::timeout(
            PROXY_TIMEOUT,
            run_proxy_handshake(&mut tcp, proxy_config, &config.host, config.port, keystore),
        )
        .await
        .map_err(|_| AgentError::Timeout("proxy handshake".into()))??;
        info!(proxy = %proxy_config.host, target = %config.host, "proxy tunnel established");
    }

    if !config.tls {
        return Ok(IrcStream::Plain(tcp));
    }

    let tls = tokio::time::timeout(TLS_TIMEOUT, upgrade_to_tls(tcp, config, keystore))
        .await
        .map_err(|_| AgentError::Timeout("tls handshake".into()))??;
    Ok(IrcStream::Tls(Box::new(tls)))
}

async fn run_proxy_handshake(
    tcp: &mut TcpStream,
    proxy_config: &ProxyConfig,
    target_host: &str,
    target_port: u16,
    keystore: Option<&Keystore>,
) -> AgentResult<()> {
    let password = proxy_config
        .password
        .as_ref()
        .map(|s| s.reveal(keystore))
        .transpose()?;
    let credentials = match (&proxy_config.username, &password) {
        (Some(user), Some(pass)) => Some((user.as_str(), pass.as_str())),
        _ => None,
    };
    match proxy_config.kind {
        ProxyKind::Socks4 => {
            let userid = proxy_config.username.as_deref().unwrap_or("");
            proxy::socks4_connect(tcp, target_host, target_port, userid).await
        }
        ProxyKind::Socks5 => proxy::socks5_connect(tcp, target_host, target_port, credentials).await,
        ProxyKind::Http => proxy::http_connect(tcp, target_host, target_port, credentials).await,
    }
}

async fn upgrade_to_tls(
    tcp: TcpStream,
    config: &ServerConfig,
    keystore: Option<&Keystore>,
) -> AgentResult<TlsStream<TcpStream>> {
    let builder = if config.accept_invalid_certificates {
        warn!(server = %config.id, "certificate validation disabled for this server");
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(DangerousNoVerifier))
    } else {
        let mut roots = RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for cert in native.certs {
            if let Err(e) = roots.add(cert) {
                warn!(error = %e, "failed to add native root certificate");
            }
        }
        for e in &native.errors {
            warn!(error = %e, "error loading native certificates");
        }
        ClientConfig::builder().with_root_certificates(roots)
    };

    let tls_config = match &config.client_cert {
        Some(client_cert) => {
            let _ = client_cert.password.as_ref().map(|s| s.reveal(keystore));
            let (chain, key) = load_pem_identity(&client_cert.path)?;
            builder
                .with_client_auth_cert(chain, key)
                .map_err(|e| AgentError::Tls(format!("client certificate: {}", e)))?
        }
        None => builder.with_no_client_auth(),
    };

    let connector = TlsConnector::from(Arc::new(tls_config));
    let server_name = ServerName::try_from(config.host.clone())
        .map_err(|e| AgentError::Tls(format!("invalid server name {}: {}", config.host, e)))?;
    connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| AgentError::Tls(e.to_string()))
}

/// Load a PEM file containing a certificate chain and a PKCS#8 key.
pub fn load_pem_identity(
    path: &str,
) -> AgentResult<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let data = std::fs::read(path)
        .map_err(|e| AgentError::Config(format!("read certificate {}: {}", path, e)))?;

    let chain: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut io::Cursor::new(&data))
            .filter_map(|r| r.ok())
            .collect();
    if chain.is_empty() {
        return Err(AgentError::Config(format!("no certificates in {}", path)));
    }

    let key = rustls_pemfile::pkcs8_private_keys(&mut io::Cursor::new(&data))
        .filter_map(|r| r.ok())
        .map(PrivateKeyDer::Pkcs8)
        .next()
        .ok_or_else(|| AgentError::Config(format!("no PKCS#8 private key in {}", path)))?;

    Ok((chain, key))
}

/// Accepts any server certificate. Only reachable when the operator set
/// `acceptInvalidCertificates` on the server block.
#[derive(Debug)]
pub struct DangerousNoVerifier;

impl tokio_rustls::rustls::client::danger::ServerCertVerifier for DangerousNoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: tokio_rustls::rustls::pki_types::UnixTime,
    ) -> Result<
        tokio_rustls::rustls::client::danger::ServerCertVerified,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> Result<
        tokio_rustls::rustls::client::danger::HandshakeSignatureValid,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> Result<
        tokio_rustls::rustls::client::danger::HandshakeSignatureValid,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<tokio_rustls::rustls::SignatureScheme> {
        vec![
            tokio_rustls::rustls::SignatureScheme::RSA_PKCS1_SHA256,
            tokio_rustls::rustls::SignatureScheme::RSA_PKCS1_SHA384,
            tokio_rustls::rustls::SignatureScheme::RSA_PKCS1_SHA512,
            tokio_rustls::rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            tokio_rustls::rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            tokio_rustls::rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            tokio_rustls::rustls::SignatureScheme::RSA_PSS_SHA256,
            tokio_rustls::rustls::SignatureScheme::RSA_PSS_SHA384,
            tokio_rustls::rustls::SignatureScheme::RSA_PSS_SHA512,
            tokio_rustls::rustls::SignatureScheme::ED25519,
        ]
    }
}
