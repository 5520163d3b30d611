//! Mesh link management.
//!
//! One task per link. The listener authenticates inbound peers with the
//! challenge/response handshake; outbound links dial configured peers
//! with exponential backoff. After authentication a link carries
//! partyline traffic, user-database sync and channel-operation
//! requests; everything arriving on a link is attributed to the peer
//! name pinned at handshake.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::handshake;
use super::protocol::{
    self, Challenge, ChallengeResponse, Chat, Envelope, Goodbye, Hello, Info, MeshError,
    MeshMessage, PingPong, UserSync, Welcome,
};
use crate::config::{BotnetConfig, LinkedBot};
use crate::error::{AgentError, AgentResult};
use crate::users::UserDb;

const HANDSHAKE_STEP_TIMEOUT: Duration = Duration::from_secs(15);
const RECONNECT_SEED: Duration = Duration::from_secs(10);
const RECONNECT_CAP: Duration = Duration::from_secs(300);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const PONG_DEADLINE: Duration = Duration::from_secs(90);
/// Per-link outbound buffer.
const LINK_QUEUE: usize = 128;

/// Something a peer asked of us, surfaced to the host.
#[derive(Debug, Clone)]
pub enum MeshEvent {
    PeerLinked {
        peer: String,
    },
    PeerUnlinked {
        peer: String,
        reason: String,
    },
    Chat {
        peer: String,
        from_nick: String,
        channel: String,
        text: String,
        action: bool,
    },
    PartyJoin {
        peer: String,
        nick: String,
        channel: String,
        flags: String,
    },
    PartyPart {
        peer: String,
        nick: String,
        channel: String,
        reason: String,
    },
    WhoRequest {
        peer: String,
        channel: Option<String>,
    },
    OpRequest {
        peer: String,
        server: String,
        channel: String,
        nick: String,
    },
    KickRequest {
        peer: String,
        server: String,
        channel: String,
        nick: String,
        reason: String,
    },
    BanSync {
        peer: String,
        server: String,
        channel: String,
        mask: String,
        ttl_seconds: Option<u64>,
    },
}

struct LinkHandle {
    tx: mpsc::Sender<String>,
    #[allow(dead_code)] // Surfaced through mesh telemetry later.
    connected_at: Instant,
    last_pong: Arc<Mutex<Instant>>,
}

pub struct MeshManager {
    local_name: String,
    version: String,
    secret: Zeroizing<String>,
    config: BotnetConfig,
    user_db: Arc<UserDb>,
    links: DashMap<String, LinkHandle>,
    events_tx: mpsc::UnboundedSender<MeshEvent>,
    shutdown_tx: broadcast::Sender<()>,
    started_at: Instant,
}

impl MeshManager {
    pub fn new(
        local_name: String,
        secret: Zeroizing<String>,
        config: BotnetConfig,
        user_db: Arc<UserDb>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> (Arc<MeshManager>, mpsc::UnboundedReceiver<MeshEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(MeshManager {
            local_name,
            version: env!("CARGO_PKG_VERSION").to_string(),
            secret,
            config,
            user_db,
            links: DashMap::new(),
            events_tx,
            shutdown_tx,
            started_at: Instant::now(),
        });
        (manager, events_rx)
    }

    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    pub fn peer_names(&self) -> Vec<String> {
        self.links.iter().map(|e| e.key().clone()).collect()
    }

    fn allowed_peer(&self, name: &str) -> bool {
        self.config
            .linked_bots
            .iter()
            .any(|b| b.name.eq_ignore_ascii_case(name))
    }

    /// Queue a message to one authenticated peer.
    pub fn send_to(&self, peer: &str, msg: &MeshMessage) -> AgentResult<()> {
        let link = self
            .links
            .get(peer)
            .ok_or_else(|| AgentError::InvalidState(format!("no link to {}", peer)))?;
        let line = msg.encode(&self.local_name, peer)?;
        link.tx
            .try_send(line)
            .map_err(|_| AgentError::Transport(format!("link to {} is backed up", peer)))
    }

    /// Queue a message to every authenticated peer.
    pub fn broadcast(&self, msg: &MeshMessage) {
        for entry in self.links.iter() {
            if let Ok(line) = msg.encode(&self.local_name, "") {
                if entry.value().tx.try_send(line).is_err() {
                    warn!(peer = %entry.key(), "mesh broadcast dropped, link backed up");
                }
            }
        }
    }

    /// Start listener, outbound dialers, heartbeat and user replication.
    pub fn start(self: &Arc<MeshManager>) {
        if self.config.enabled {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = manager.run_listener().await {
                    warn!(error = %e, "mesh listener failed");
                }
            });
        }
        for bot in &self.config.linked_bots {
            if bot.auto_connect {
                let manager = Arc::clone(self);
                let bot = bot.clone();
                tokio::spawn(async move {
                    manager.run_outbound(bot).await;
                });
            }
        }
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                manager.run_heartbeat().await;
            });
        }
        {
            // Subscribe before returning so no mutation can slip past
            // between startup and the replication task's first poll.
            let updates = self.user_db.subscribe();
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                manager.run_replication(updates).await;
            });
        }
    }

    async fn run_listener(self: Arc<MeshManager>) -> AgentResult<()> {
        let addr = format!("0.0.0.0:{}", self.config.listen_port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| AgentError::Transport(format!("mesh bind {}: {}", addr, e)))?;
        info!(address = %addr, "mesh listener started");
        let mut shutdown = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            info!(peer = %peer_addr, "inbound mesh connection");
                            let manager = Arc::clone(&self);
                            tokio::spawn(async move {
                                manager.handle_inbound(stream).await;
                            });
                        }
                        Err(e) => warn!(error = %e, "mesh accept failed"),
                    }
                }
                _ = shutdown.recv() => {
                    info!("mesh listener stopping");
                    return Ok(());
                }
            }
        }
    }

    async fn next_message(
        framed: &mut Framed<TcpStream, LinesCodec>,
    ) -> AgentResult<(Envelope, MeshMessage)> {
        let line = tokio::time::timeout(HANDSHAKE_STEP_TIMEOUT, framed.next())
            .await
            .map_err(|_| AgentError::Timeout("mesh handshake".into()))?
            .ok_or_else(|| AgentError::Transport("mesh peer closed".into()))?
            .map_err(|e| AgentError::Protocol(format!("mesh framing: {}", e)))?;
        MeshMessage::decode(&line)
    }

    async fn send_now(
        &self,
        framed: &mut Framed<TcpStream, LinesCodec>,
        to: &str,
        msg: &MeshMessage,
    ) -> AgentResult<()> {
        let line = msg.encode(&self.local_name, to)?;
        framed
            .send(line)
            .await
            .map_err(|e| AgentError::Transport(format!("mesh send: {}", e)))
    }

    async fn send_error(
        &self,
        framed: &mut Framed<TcpStream, LinesCodec>,
        to: &str,
        code: &str,
        message: &str,
    ) {
        let err = MeshMessage::Error(MeshError {
            code: code.to_string(),
            message: message.to_string(),
        });
        let _ = self.send_now(framed, to, &err).await;
    }

    /// Listener side of the handshake, then the link loop.
    async fn handle_inbound(self: Arc<MeshManager>, stream: TcpStream) {
        let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(protocol::MAX_LINE));

        let hello = match Self::next_message(&mut framed).await {
            Ok((_, MeshMessage::Hello(hello))) => hello,
            Ok(_) => {
                self.send_error(&mut framed, "", protocol::ERR_PROTO_BAD, "expected Hello")
                    .await;
                return;
            }
            Err(e) => {
                debug!(error = %e, "inbound mesh handshake aborted");
                return;
            }
        };

        if !self.allowed_peer(&hello.agent_name) {
            warn!(peer = %hello.agent_name, "mesh peer not in allowed list");
            self.send_error(
                &mut framed,
                &hello.agent_name,
                protocol::ERR_UNKNOWN_BOT,
                "unknown bot",
            )
            .await;
            return;
        }

        let challenge = handshake::generate_challenge();
        if self
            .send_now(
                &mut framed,
                &hello.agent_name,
                &MeshMessage::Challenge(Challenge {
                    challenge: challenge.clone(),
                }),
            )
            .await
            .is_err()
        {
            return;
        }

        let response = match Self::next_message(&mut framed).await {
            Ok((_, MeshMessage::Response(r))) => r,
            _ => {
                self.send_error(
                    &mut framed,
                    &hello.agent_name,
                    protocol::ERR_PROTO_BAD,
                    "expected Response",
                )
                .await;
                return;
            }
        };

        if !handshake::verify_response(&self.secret, &challenge, &response.response) {
            warn!(peer = %hello.agent_name, "mesh authentication failed");
            self.send_error(
                &mut framed,
                &hello.agent_name,
                protocol::ERR_AUTH_FAILED,
                "challenge response mismatch",
            )
            .await;
            return;
        }

        let welcome = MeshMessage::Welcome(Welcome {
            agent_name: self.local_name.clone(),
            linked_bots: self.peer_names(),
        });
        if self
            .send_now(&mut framed, &hello.agent_name, &welcome)
            .await
            .is_err()
        {
            return;
        }

        info!(peer = %hello.agent_name, "inbound mesh link authenticated");
        self.run_link(framed, hello.agent_name, false).await;
    }

    /// Initiator side: dial, authenticate, link loop, retry forever.
    async fn run_outbound(self: Arc<MeshManager>, bot: LinkedBot) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut delay = RECONNECT_SEED;

        loop {
            let (Some(host), Some(port)) = (bot.host.clone(), bot.port) else {
                warn!(peer = %bot.name, "outbound mesh peer has no endpoint");
                return;
            };

            let linked = match self.dial_and_authenticate(&bot.name, &host, port).await {
                Ok(framed) => {
                    delay = RECONNECT_SEED;
                    self.clone().run_link(framed, bot.name.clone(), true).await;
                    true
                }
                Err(e) => {
                    warn!(peer = %bot.name, error = %e, "mesh dial failed");
                    false
                }
            };
            if linked {
                debug!(peer = %bot.name, "mesh link ended, redialing");
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.recv() => return,
            }
            delay = (delay * 2).min(RECONNECT_CAP);
        }
    }

    async fn dial_and_authenticate(
        &self,
        peer: &str,
        host: &str,
        port: u16,
    ) -> AgentResult<Framed<TcpStream, LinesCodec>> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| AgentError::Transport(format!("connect {}:{}: {}", host, port, e)))?;
        let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(protocol::MAX_LINE));

        self.send_now(
            &mut framed,
            peer,
            &MeshMessage::Hello(Hello {
                agent_name: self.local_name.clone(),
                version: self.version.clone(),
                public_key: None,
            }),
        )
        .await?;

        let challenge = match Self::next_message(&mut framed).await? {
            (_, MeshMessage::Challenge(c)) => c,
            (_, MeshMessage::Error(e)) => {
                return Err(AgentError::AuthFailed(format!("{}: {}", e.code, e.message)))
            }
            _ => return Err(AgentError::Protocol("expected Challenge".into())),
        };

        let response = handshake::compute_response(&self.secret, &challenge.challenge)?;
        self.send_now(
            &mut framed,
            peer,
            &MeshMessage::Response(ChallengeResponse { response }),
        )
        .await?;

        match Self::next_message(&mut framed).await? {
            (envelope, MeshMessage::Welcome(w)) => {
                if !envelope.from_agent.is_empty() && !envelope.from_agent.eq_ignore_ascii_case(peer)
                {
                    return Err(AgentError::AuthFailed(format!(
                        "peer identified as {} but {} expected",
                        envelope.from_agent, peer
                    )));
                }
                info!(peer = %w.agent_name, linked = w.linked_bots.len(), "outbound mesh link authenticated");
                Ok(framed)
            }
            (_, MeshMessage::Error(e)) => {
                Err(AgentError::AuthFailed(format!("{}: {}", e.code, e.message)))
            }
            _ => Err(AgentError::Protocol("expected Welcome".into())),
        }
    }

    /// The post-auth link loop. `initiate_sync` marks the side that
    /// opens the full user sync.
    async fn run_link(
        self: Arc<MeshManager>,
        mut framed: Framed<TcpStream, LinesCodec>,
        peer: String,
        initiate_sync: bool,
    ) {
        let (tx, mut rx) = mpsc::channel::<String>(LINK_QUEUE);
        let last_pong = Arc::new(Mutex::new(Instant::now()));
        // A newer link for the same peer replaces the old one.
        self.links.insert(
            peer.clone(),
            LinkHandle {
                tx,
                connected_at: Instant::now(),
                last_pong: Arc::clone(&last_pong),
            },
        );
        let _ = self.events_tx.send(MeshEvent::PeerLinked { peer: peer.clone() });

        let mut sent_full_sync = false;
        if initiate_sync {
            let sync = MeshMessage::UserSync(UserSync {
                users: self.user_db.snapshot(),
                is_full_sync: true,
            });
            let _ = self.send_now(&mut framed, &peer, &sync).await;
            sent_full_sync = true;
            let info = MeshMessage::Info(Info {
                agent_name: self.local_name.clone(),
                version: self.version.clone(),
                uptime_seconds: self.started_at.elapsed().as_secs(),
            });
            let _ = self.send_now(&mut framed, &peer, &info).await;
        }

        let mut shutdown = self.shutdown_tx.subscribe();
        let reason = loop {
            tokio::select! {
                outgoing = rx.recv() => {
                    match outgoing {
                        Some(line) => {
                            if let Err(e) = framed.send(line).await {
                                break format!("send failed: {}", e);
                            }
                        }
                        // Handle dropped: replaced or expired by heartbeat.
                        None => break "link closed locally".to_string(),
                    }
                }
                inbound = framed.next() => {
                    let line = match inbound {
                        Some(Ok(line)) => line,
                        Some(Err(e)) => break format!("framing: {}", e),
                        None => break "peer closed connection".to_string(),
                    };
                    let (envelope, msg) = match MeshMessage::decode(&line) {
                        Ok(decoded) => decoded,
                        Err(e) => {
                            warn!(peer = %peer, error = %e, "dropping bad mesh line");
                            continue;
                        }
                    };
                    // Identity pin: envelope must match the handshake.
                    if !envelope.from_agent.eq_ignore_ascii_case(&peer) {
                        warn!(peer = %peer, claimed = %envelope.from_agent, "mesh identity mismatch, resetting link");
                        self.send_error(&mut framed, &peer, protocol::ERR_PROTO_BAD, "identity mismatch").await;
                        break "identity mismatch".to_string();
                    }

                    match msg {
                        MeshMessage::Ping(p) => {
                            let pong = MeshMessage::Pong(PingPong { ping_id: p.ping_id });
                            if self.send_now(&mut framed, &peer, &pong).await.is_err() {
                                break "pong send failed".to_string();
                            }
                        }
                        MeshMessage::Pong(_) => {
                            *last_pong.lock() = Instant::now();
                        }
                        MeshMessage::UserSync(sync) => {
                            let applied = self.user_db.apply_sync(&peer, sync.users, &self.local_name);
                            debug!(peer = %peer, applied, full = sync.is_full_sync, "user sync received");
                            if sync.is_full_sync && !sent_full_sync {
                                sent_full_sync = true;
                                let reply = MeshMessage::UserSync(UserSync {
                                    users: self.user_db.snapshot(),
                                    is_full_sync: true,
                                });
                                let _ = self.send_now(&mut framed, &peer, &reply).await;
                            }
                        }
                        MeshMessage::Chat(c) => {
                            let _ = self.events_tx.send(MeshEvent::Chat {
                                peer: peer.clone(),
                                from_nick: c.from_nick,
                                channel: c.channel,
                                text: c.text,
                                action: false,
                            });
                        }
                        MeshMessage::Action(c) => {
                            let _ = self.events_tx.send(MeshEvent::Chat {
                                peer: peer.clone(),
                                from_nick: c.from_nick,
                                channel: c.channel,
                                text: c.text,
                                action: true,
                            });
                        }
                        MeshMessage::PartyJoin(p) => {
                            let _ = self.events_tx.send(MeshEvent::PartyJoin {
                                peer: peer.clone(),
                                nick: p.nick,
                                channel: p.channel,
                                flags: p.flags,
                            });
                        }
                        MeshMessage::PartyPart(p) => {
                            let _ = self.events_tx.send(MeshEvent::PartyPart {
                                peer: peer.clone(),
                                nick: p.nick,
                                channel: p.channel,
                                reason: p.reason,
                            });
                        }
                        MeshMessage::Who(w) => {
                            let _ = self.events_tx.send(MeshEvent::WhoRequest {
                                peer: peer.clone(),
                                channel: w.channel,
                            });
                        }
                        MeshMessage::WhoReply(reply) => {
                            debug!(peer = %peer, members = reply.members.len(), "partyline who reply");
                        }
                        MeshMessage::OpRequest(r) => {
                            let _ = self.events_tx.send(MeshEvent::OpRequest {
                                peer: peer.clone(),
                                server: r.server,
                                channel: r.channel,
                                nick: r.nick,
                            });
                        }
                        MeshMessage::OpGrant(g) => {
                            debug!(peer = %peer, channel = %g.channel, nick = %g.nick, granted = g.granted, "op grant");
                        }
                        MeshMessage::KickRequest(r) => {
                            let _ = self.events_tx.send(MeshEvent::KickRequest {
                                peer: peer.clone(),
                                server: r.server,
                                channel: r.channel,
                                nick: r.nick,
                                reason: r.reason,
                            });
                        }
                        MeshMessage::BanSync(b) => {
                            let _ = self.events_tx.send(MeshEvent::BanSync {
                                peer: peer.clone(),
                                server: b.server,
                                channel: b.channel,
                                mask: b.mask,
                                ttl_seconds: b.ttl_seconds,
                            });
                        }
                        MeshMessage::Info(i) => {
                            debug!(peer = %peer, version = %i.version, uptime_s = i.uptime_seconds, "peer info");
                        }
                        MeshMessage::Status(_) | MeshMessage::Channels(_) => {
                            debug!(peer = %peer, "peer telemetry received");
                        }
                        MeshMessage::Goodbye(g) => break format!("goodbye: {}", g.reason),
                        MeshMessage::Error(e) => break format!("peer error {}: {}", e.code, e.message),
                        MeshMessage::Hello(_)
                        | MeshMessage::Challenge(_)
                        | MeshMessage::Response(_)
                        | MeshMessage::Welcome(_) => {
                            self.send_error(&mut framed, &peer, protocol::ERR_PROTO_BAD, "handshake message after auth").await;
                            break "handshake replay".to_string();
                        }
                    }
                }
                _ = shutdown.recv() => {
                    let goodbye = MeshMessage::Goodbye(Goodbye {
                        reason: protocol::ERR_CLOSING.to_string(),
                    });
                    let _ = self.send_now(&mut framed, &peer, &goodbye).await;
                    break "shutting down".to_string();
                }
            }
        };

        // Only unregister if this loop still owns the entry.
        if let Some(entry) = self.links.get(&peer) {
            if Arc::ptr_eq(&entry.last_pong, &last_pong) {
                drop(entry);
                self.links.remove(&peer);
            }
        }
        info!(peer = %peer, reason = %reason, "mesh link closed");
        let _ = self.events_tx.send(MeshEvent::PeerUnlinked { peer, reason });
    }

    async fn run_heartbeat(self: Arc<MeshManager>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let mut stale = Vec::new();
                    for entry in self.links.iter() {
                        if entry.value().last_pong.lock().elapsed() > PONG_DEADLINE {
                            stale.push(entry.key().clone());
                        }
                    }
                    for peer in stale {
                        warn!(peer = %peer, "mesh peer stopped answering pings, dropping link");
                        self.links.remove(&peer);
                    }
                    let ping = MeshMessage::Ping(PingPong {
                        ping_id: uuid::Uuid::new_v4().simple().to_string(),
                    });
                    self.broadcast(&ping);
                }
                _ = shutdown.recv() => return,
            }
        }
    }

    /// Replicate local user-database mutations to every peer.
    async fn run_replication(
        self: Arc<MeshManager>,
        mut updates: broadcast::Receiver<crate::users::AccessUser>,
    ) {
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                update = updates.recv() => {
                    match update {
                        Ok(user) => {
                            let sync = MeshMessage::UserSync(UserSync {
                                users: vec![user],
                                is_full_sync: false,
                            });
                            self.broadcast(&sync);
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "user replication lagged, sending full sync");
                            let sync = MeshMessage::UserSync(UserSync {
                                users: self.user_db.snapshot(),
                                is_full_sync: true,
                            });
                            self.broadcast(&sync);
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
                _ = shutdown.recv() => return,
            }
        }
    }
}

// Partyline helpers used by the host facade.
impl MeshManager {
    pub fn send_chat(&self, from_nick: &str, channel: &str, text: &str, action: bool) {
        let chat = Chat {
            from_nick: from_nick.to_string(),
            channel: channel.to_string(),
            text: text.to_string(),
        };
        let msg = if action {
            MeshMessage::Action(chat)
        } else {
            MeshMessage::Chat(chat)
        };
        self.broadcast(&msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn botnet_config(listen_port: u16, peers: serde_json::Value) -> BotnetConfig {
        serde_json::from_value(serde_json::json!({
            "enabled": true,
            "listenPort": listen_port,
            "sharedSecret": "p",
            "linkedBots": peers,
        }))
        .unwrap()
    }

    struct Node {
        manager: Arc<MeshManager>,
        events: mpsc::UnboundedReceiver<MeshEvent>,
        db: Arc<UserDb>,
        _shutdown: broadcast::Sender<()>,
    }

    fn node(name: &str, secret: &str, config: BotnetConfig) -> Node {
        let db = Arc::new(UserDb::new());
        let (shutdown, _) = broadcast::channel(4);
        let (manager, events) = MeshManager::new(
            name.to_string(),
            Zeroizing::new(secret.to_string()),
            config,
            Arc::clone(&db),
            shutdown.clone(),
        );
        manager.start();
        Node {
            manager,
            events,
            db,
            _shutdown: shutdown,
        }
    }

    async fn wait_event<F: Fn(&MeshEvent) -> bool>(
        events: &mut mpsc::UnboundedReceiver<MeshEvent>,
        limit: Duration,
        pred: F,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            match tokio::time::timeout(remaining, events.recv()).await {
                Ok(Some(event)) if pred(&event) => return true,
                Ok(Some(_)) => continue,
                _ => return false,
            }
        }
    }

    /// Poll until `pred` holds or the deadline passes.
    async fn eventually<F: Fn() -> bool>(limit: Duration, pred: F) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        while tokio::time::Instant::now() < deadline {
            if pred() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        pred()
    }

    #[tokio::test]
    async fn handshake_links_both_sides_and_syncs_users() {
        let port = free_port();
        let mut listener = node(
            "hugin",
            "p",
            botnet_config(port, serde_json::json!([{"name": "munin"}])),
        );

        let mut dialer_config = botnet_config(
            free_port(),
            serde_json::json!([{
                "name": "hugin",
                "host": "127.0.0.1",
                "port": port,
                "autoConnect": true,
            }]),
        );
        dialer_config.enabled = false;
        let mut dialer = node("munin", "p", dialer_config);
        dialer.db.add_user("alice").unwrap();
        dialer.db.add_hostmask("alice", "*!*@alice.example").unwrap();

        assert!(
            wait_event(&mut listener.events, Duration::from_secs(5), |e| {
                matches!(e, MeshEvent::PeerLinked { peer } if peer == "munin")
            })
            .await
        );
        assert!(
            wait_event(&mut dialer.events, Duration::from_secs(5), |e| {
                matches!(e, MeshEvent::PeerLinked { peer } if peer == "hugin")
            })
            .await
        );
        assert_eq!(listener.manager.peer_names(), vec!["munin".to_string()]);

        // The initiator's full sync lands in the listener's database.
        assert!(
            eventually(Duration::from_secs(5), || {
                listener.db.find_by_handle("alice").is_some()
            })
            .await
        );

        // An incremental update flows back the other way.
        listener.db.add_user("bob").unwrap();
        assert!(
            eventually(Duration::from_secs(5), || {
                dialer.db.find_by_handle("bob").is_some()
            })
            .await
        );
    }

    #[tokio::test]
    async fn wrong_password_never_links() {
        let port = free_port();
        let listener = node(
            "hugin",
            "p",
            botnet_config(port, serde_json::json!([{"name": "munin"}])),
        );

        let mut dialer_config = botnet_config(
            free_port(),
            serde_json::json!([{
                "name": "hugin",
                "host": "127.0.0.1",
                "port": port,
                "autoConnect": true,
            }]),
        );
        dialer_config.enabled = false;
        let _dialer = node("munin", "not-p", dialer_config);

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert!(listener.manager.peer_names().is_empty());
    }

    #[tokio::test]
    async fn unknown_peer_rejected() {
        let port = free_port();
        let listener = node(
            "hugin",
            "p",
            botnet_config(port, serde_json::json!([{"name": "munin"}])),
        );

        let mut dialer_config = botnet_config(
            free_port(),
            serde_json::json!([{
                "name": "hugin",
                "host": "127.0.0.1",
                "port": port,
                "autoConnect": true,
            }]),
        );
        dialer_config.enabled = false;
        let _stranger = node("stranger", "p", dialer_config);

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert!(listener.manager.peer_names().is_empty());
    }

    #[tokio::test]
    async fn partyline_chat_reaches_peer() {
        let port = free_port();
        let mut listener = node(
            "hugin",
            "p",
            botnet_config(port, serde_json::json!([{"name": "munin"}])),
        );
        let mut dialer_config = botnet_config(
            free_port(),
            serde_json::json!([{
                "name": "hugin",
                "host": "127.0.0.1",
                "port": port,
                "autoConnect": true,
            }]),
        );
        dialer_config.enabled = false;
        let mut dialer = node("munin", "p", dialer_config);

        assert!(
            wait_event(&mut dialer.events, Duration::from_secs(5), |e| {
                matches!(e, MeshEvent::PeerLinked { .. })
            })
            .await
        );

        dialer
            .manager
            .send_chat("operator", "*party*", "hello over there", false);
        assert!(
            wait_event(&mut listener.events, Duration::from_secs(5), |e| {
                matches!(
                    e,
                    MeshEvent::Chat { peer, from_nick, text, action: false, .. }
                        if peer == "munin" && from_nick == "operator" && text == "hello over there"
                )
            })
            .await
        );
    }
}
