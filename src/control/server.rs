//! Control-plane server.
//!
//! TLS-terminated binary RPC for remote operators: IP allow-list at
//! accept time, HMAC challenge after TLS, strictly sequential request
//! handling per session, broadcasts fanned out to every authenticated
//! session with a server-owned sequence counter.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_rustls::rustls::ServerConfig as TlsServerConfig;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::allowlist::IpAllowList;
use super::auth;
use super::framing::{ControlCodec, Frame, FrameType};
use crate::config::ControlServerConfig;
use crate::error::{AgentError, AgentResult};
use crate::events::{EventBus, EventKind};
use crate::host::BotService;
use crate::irc::transport::load_pem_identity;

/// Broadcast fan-out buffer per session.
const BROADCAST_CAPACITY: usize = 256;

pub struct ControlServer {
    config: ControlServerConfig,
    token: Zeroizing<String>,
    service: Arc<BotService>,
    bus: EventBus,
    shutdown_tx: broadcast::Sender<()>,
    broadcasts: broadcast::Sender<Frame>,
    broadcast_seq: AtomicU32,
}

impl ControlServer {
    pub fn new(
        config: ControlServerConfig,
        token: Zeroizing<String>,
        service: Arc<BotService>,
        bus: EventBus,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Arc<ControlServer> {
        let (broadcasts, _) = broadcast::channel(BROADCAST_CAPACITY);
        Arc::new(ControlServer {
            config,
            token,
            service,
            bus,
            shutdown_tx,
            broadcasts,
            broadcast_seq: AtomicU32::new(0),
        })
    }

    /// Bind the listener and start the accept and broadcast-pump tasks.
    pub async fn start(self: &Arc<ControlServer>) -> AgentResult<()> {
        let cert_path = self
            .config
            .certificate_path
            .as_deref()
            .ok_or_else(|| AgentError::Config("controlServer.certificatePath missing".into()))?;
        let (chain, key) = load_pem_identity(cert_path)?;
        let tls_config = TlsServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|e| AgentError::Tls(format!("control certificate: {}", e)))?;
        let acceptor = TlsAcceptor::from(Arc::new(tls_config));

        let addr = format!("{}:{}", self.config.bind_address, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| AgentError::Transport(format!("control bind {}: {}", addr, e)))?;
        info!(address = %addr, "control server started");

        let allowlist = Arc::new(IpAllowList::parse(&self.config.allowed_ips));

        {
            let server = Arc::clone(self);
            tokio::spawn(async move {
                server.pump_broadcasts().await;
            });
        }

        let server = Arc::clone(self);
        tokio::spawn(async move {
            let mut shutdown = server.shutdown_tx.subscribe();
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                if !allowlist.is_allowed(peer.ip()) {
                                    warn!(peer = %peer, "control connection rejected by allow-list");
                                    continue;
                                }
                                let server = Arc::clone(&server);
                                let acceptor = acceptor.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = server.run_session(stream, acceptor, peer).await {
                                        debug!(peer = %peer, error = %e, "control session ended");
                                    }
                                });
                            }
                            Err(e) => warn!(error = %e, "control accept failed"),
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("control server stopping");
                        return;
                    }
                }
            }
        });
        Ok(())
    }

    /// Turn bus events into broadcast frames with server-owned seq.
    async fn pump_broadcasts(self: Arc<ControlServer>) {
        let mut events = self.bus.subscribe();
        while let Some(event) = events.next().await {
            let frame = match &event.kind {
                EventKind::RawMessageReceived { line } => {
                    let (command, parameters) = match line.parse::<munin_proto::Message>() {
                        Ok(msg) => {
                            let name = msg.command.name();
                            (name, line.clone())
                        }
                        Err(_) => ("RAW".to_string(), line.clone()),
                    };
                    let body = json!({
                        "serverId": event.server_id,
                        "command": command,
                        "parameters": parameters,
                    });
                    Some((FrameType::IrcMessage, body))
                }
                EventKind::Connected
                | EventKind::Registered
                | EventKind::Disconnected { .. }
                | EventKind::Reconnecting { .. } => {
                    let state = match &event.kind {
                        EventKind::Connected => "connected",
                        EventKind::Registered => "registered",
                        EventKind::Disconnected { .. } => "disconnected",
                        _ => "reconnecting",
                    };
                    let body = json!({
                        "serverId": event.server_id,
                        "state": state,
                        "timestamp": chrono::Utc::now().to_rfc3339(),
                    });
                    Some((FrameType::ConnectionStateChanged, body))
                }
                _ => None,
            };
            if let Some((frame_type, body)) = frame {
                let seq = self.broadcast_seq.fetch_add(1, Ordering::Relaxed) + 1;
                let _ = self
                    .broadcasts
                    .send(Frame::new(frame_type, seq, body.to_string().into_bytes()));
            }
        }
    }

    async fn run_session(
        self: Arc<ControlServer>,
        stream: TcpStream,
        acceptor: TlsAcceptor,
        peer: std::net::SocketAddr,
    ) -> AgentResult<()> {
        let tls = acceptor
            .accept(stream)
            .await
            .map_err(|e| AgentError::Tls(format!("control tls accept: {}", e)))?;
        let mut framed = Framed::new(tls, ControlCodec);

        // Challenge immediately after TLS.
        let challenge = auth::make_challenge();
        framed
            .send(Frame::new(FrameType::AuthChallenge, 0, challenge.to_vec()))
            .await
            .map_err(|e| AgentError::Transport(e.to_string()))?;

        let auth_timeout = Duration::from_secs(self.config.auth_timeout_seconds.max(1));
        let response = tokio::time::timeout(auth_timeout, framed.next())
            .await
            .map_err(|_| AgentError::Timeout("control authentication".into()))?
            .ok_or_else(|| AgentError::Transport("client closed before auth".into()))?
            .map_err(|e| AgentError::Protocol(e.to_string()))?;

        let authenticated = response.frame_type == Some(FrameType::AuthResponse)
            && auth::verify_response(&self.token, &challenge, &response.payload);
        if !authenticated {
            warn!(peer = %peer, "control authentication failed");
            let _ = framed
                .send(Frame::new(
                    FrameType::AuthFailure,
                    response.seq,
                    b"authentication failed".to_vec(),
                ))
                .await;
            return Err(AgentError::AuthFailed("control hmac".into()));
        }

        let success = json!({
            "version": self.service.version,
            "hostname": self.service.agent_name,
            "platform": std::env::consts::OS,
            "uptime_ms": self.service.uptime_ms(),
        });
        framed
            .send(Frame::new(
                FrameType::AuthSuccess,
                response.seq,
                success.to_string().into_bytes(),
            ))
            .await
            .map_err(|e| AgentError::Transport(e.to_string()))?;
        info!(peer = %peer, "control session authenticated");

        let mut broadcasts = self.broadcasts.subscribe();
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                request = framed.next() => {
                    let frame = match request {
                        Some(Ok(frame)) => frame,
                        Some(Err(e)) => {
                            // Framing violations (bad magic, >1 MiB) kill
                            // the session with a final error record.
                            let _ = framed.send(Frame::new(FrameType::Error, 0, b"PROTO_BAD".to_vec())).await;
                            return Err(AgentError::Protocol(e.to_string()));
                        }
                        None => return Ok(()),
                    };
                    let reply = self.handle_request(&frame).await;
                    framed
                        .send(reply)
                        .await
                        .map_err(|e| AgentError::Transport(e.to_string()))?;
                }
                bcast = broadcasts.recv() => {
                    match bcast {
                        Ok(frame) => {
                            framed.send(frame).await.map_err(|e| AgentError::Transport(e.to_string()))?;
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(peer = %peer, missed, "control session lagged on broadcasts");
                        }
                        Err(broadcast::error::RecvError::Closed) => return Ok(()),
                    }
                }
                _ = shutdown.recv() => {
                    let _ = framed.send(Frame::new(FrameType::Error, 0, b"CLOSING".to_vec())).await;
                    return Ok(());
                }
            }
        }
    }

    /// Handle one request; the response echoes the request's seq.
    async fn handle_request(&self, frame: &Frame) -> Frame {
        let seq = frame.seq;
        let Some(frame_type) = frame.frame_type else {
            return Frame::new(FrameType::NotSupported, seq, Vec::new());
        };

        let result: AgentResult<Frame> = match frame_type {
            FrameType::Ping => Ok(Frame::new(FrameType::Pong, seq, frame.payload.clone())),
            FrameType::GetStatus => Ok(Frame::new(
                FrameType::Status,
                seq,
                self.service.status_json().to_string().into_bytes(),
            )),
            FrameType::GetConnections => Ok(Frame::new(
                FrameType::Connections,
                seq,
                self.service.connections_json().to_string().into_bytes(),
            )),
            FrameType::GetChannels => Ok(Frame::new(
                FrameType::Channels,
                seq,
                self.service.channels_json().to_string().into_bytes(),
            )),
            FrameType::GetUsers => Ok(Frame::new(
                FrameType::Users,
                seq,
                self.service.users_json().to_string().into_bytes(),
            )),
            FrameType::JoinChannel => self.fields(frame, 2, 3).and_then(|f| {
                self.service
                    .join(&f[0], &f[1], f.get(2).map(String::as_str))
                    .map(|_| Frame::new(FrameType::JoinChannel, seq, Vec::new()))
            }),
            FrameType::PartChannel => self.fields(frame, 2, 3).and_then(|f| {
                self.service
                    .part(&f[0], &f[1], f.get(2).map(String::as_str))
                    .map(|_| Frame::new(FrameType::PartChannel, seq, Vec::new()))
            }),
            FrameType::SendMessage => self.fields(frame, 3, 3).and_then(|f| {
                self.service
                    .send_message(&f[0], &f[1], &f[2])
                    .map(|_| Frame::new(FrameType::SendMessage, seq, Vec::new()))
            }),
            FrameType::SendRaw => self.fields(frame, 2, 2).and_then(|f| {
                self.service
                    .send_raw(&f[0], &f[1])
                    .map(|_| Frame::new(FrameType::SendRaw, seq, Vec::new()))
            }),
            FrameType::Connect => self.fields(frame, 1, 1).and_then(|f| {
                self.service
                    .connect(&f[0])
                    .map(|_| Frame::new(FrameType::Connect, seq, Vec::new()))
            }),
            FrameType::Disconnect => match self.fields(frame, 1, 2) {
                Ok(f) => self
                    .service
                    .disconnect(&f[0], f.get(1).cloned())
                    .await
                    .map(|_| Frame::new(FrameType::Disconnect, seq, Vec::new())),
                Err(e) => Err(e),
            },
            FrameType::Shutdown => {
                self.service.shutdown();
                Ok(Frame::new(FrameType::Shutdown, seq, Vec::new()))
            }
            // Client-only or server-only records in the wrong direction.
            _ => Ok(Frame::new(FrameType::NotSupported, seq, Vec::new())),
        };

        result.unwrap_or_else(|e| {
            Frame::new(
                FrameType::Error,
                seq,
                format!("{}: {}", e.error_code(), e).into_bytes(),
            )
        })
    }

    /// Split a `\0`-separated UTF-8 payload into fields.
    fn fields(&self, frame: &Frame, min: usize, max: usize) -> AgentResult<Vec<String>> {
        let text = std::str::from_utf8(&frame.payload)
            .map_err(|_| AgentError::Protocol("payload is not UTF-8".into()))?;
        let fields: Vec<String> = text.split('\0').map(str::to_string).collect();
        if fields.len() < min || fields.len() > max {
            return Err(AgentError::Protocol(format!(
                "expected {}..{} fields, got {}",
                min,
                max,
                fields.len()
            )));
        }
        Ok(fields)
    }
}
