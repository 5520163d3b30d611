//! One IRC session per configured server.
//!
//! A connection owns its transport, parser, flood queue and room model.
//! The reader task is the single writer of session state; the writer
//! task only drains the flood queue. Reconnection wraps both with
//! exponential backoff.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::StreamExt;
use futures_util::SinkExt;
use munin_proto::{Command, Message, MAX_LINE_LEN};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::{AgentError, AgentResult};
use crate::events::{Event, EventBus, EventKind};
use crate::irc::channel::Channel;
use crate::irc::codec::IrcCodec;
use crate::irc::handler;
use crate::irc::queue::{FloodQueue, OutboundCommand, Priority};
use crate::irc::registration::{RegEvent, Registration, RegistrationOptions, SaslOptions};
use crate::irc::state::{ConnectionState, SessionState};
use crate::irc::transport::{self, IrcStream};
use crate::keystore::Keystore;

/// Keepalive probe cadence and failure threshold.
const PING_INTERVAL: Duration = Duration::from_secs(60);
const MAX_PENDING_PINGS: usize = 3;
/// CAP negotiation and registration must finish within this window.
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(30);
/// Reconnect backoff cap.
const MAX_BACKOFF: Duration = Duration::from_secs(300);
/// Repeated protocol garbage inside this window escalates to Transport.
const PROTOCOL_ERROR_WINDOW: Duration = Duration::from_secs(10);
const PROTOCOL_ERROR_LIMIT: usize = 8;

enum WriterMsg {
    Cmd(OutboundCommand),
    /// Drain everything, flush the sink, then ack.
    Flush(oneshot::Sender<()>),
}

struct SessionHandle {
    outbound: mpsc::UnboundedSender<WriterMsg>,
}

#[derive(Debug)]
struct SessionEnd {
    error: Option<AgentError>,
    reached_registered: bool,
    requested: bool,
}

pub struct Connection {
    pub config: Arc<ServerConfig>,
    keystore: Option<Arc<Keystore>>,
    bus: EventBus,
    conn_state: Mutex<ConnectionState>,
    session_state: Arc<RwLock<SessionState>>,
    session: Mutex<Option<SessionHandle>>,
    /// Stop signal: `Some(quit message)` requests disconnect.
    stop_tx: watch::Sender<Option<String>>,
    latency_ms: AtomicU64,
    shutdown_tx: broadcast::Sender<()>,
}

impl Connection {
    pub fn new(
        config: Arc<ServerConfig>,
        keystore: Option<Arc<Keystore>>,
        bus: EventBus,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Arc<Connection> {
        let nickname = config.nickname.clone();
        let (stop_tx, _) = watch::channel(None);
        Arc::new(Connection {
            config,
            keystore,
            bus,
            conn_state: Mutex::new(ConnectionState::Disconnected),
            session_state: Arc::new(RwLock::new(SessionState::new(&nickname))),
            session: Mutex::new(None),
            stop_tx,
            latency_ms: AtomicU64::new(0),
            shutdown_tx,
        })
    }

    pub fn server_id(&self) -> &str {
        &self.config.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.conn_state.lock()
    }

    pub fn current_nick(&self) -> String {
        self.session_state.read().nick.clone()
    }

    pub fn latency_ms(&self) -> u64 {
        self.latency_ms.load(Ordering::Relaxed)
    }

    /// Snapshot of the joined channels.
    pub fn channels(&self) -> Vec<Channel> {
        self.session_state.read().channels.values().cloned().collect()
    }

    pub fn channel(&self, name: &str) -> Option<Channel> {
        self.session_state.read().channel(name).cloned()
    }

    pub fn isupport(&self) -> munin_proto::Isupport {
        self.session_state.read().isupport.clone()
    }

    fn emit(&self, kind: EventKind) {
        self.bus.publish(Event {
            server_id: self.config.id.clone(),
            batch: None,
            kind,
        });
    }

    fn emit_batched(&self, batch: Option<String>, kind: EventKind) {
        self.bus.publish(Event {
            server_id: self.config.id.clone(),
            batch,
            kind,
        });
    }

    /// Start the connect/reconnect loop. Idempotent while a session is
    /// active.
    pub fn connect(self: &Arc<Connection>) -> AgentResult<()> {
        {
            let state = self.conn_state.lock();
            if state.is_active() {
                debug!(server = %self.config.id, "connect() while already active");
                return Ok(());
            }
        }
        // Reset any stale disconnect request.
        self.stop_tx.send_replace(None);
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            conn.run_loop().await;
        });
        Ok(())
    }

    /// Request a clean disconnect and wait for the session to settle.
    pub async fn disconnect(&self, quit_msg: Option<String>) -> AgentResult<()> {
        if !self.state().is_active() {
            return Ok(());
        }
        let msg = quit_msg.unwrap_or_else(|| "Munin going down".to_string());
        self.stop_tx.send_replace(Some(msg));

        // Bounded: the session acks the flush or we force the state.
        for _ in 0..40 {
            if !self.state().is_active() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        warn!(server = %self.config.id, "disconnect timed out waiting for session teardown");
        *self.conn_state.lock() = ConnectionState::Disconnected;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Outbound API: each call enqueues one command at NORMAL priority.
    // ------------------------------------------------------------------

    pub fn send_message(&self, target: &str, text: &str) -> AgentResult<()> {
        self.enqueue(
            Command::Privmsg(target.to_string(), text.to_string()),
            Priority::Normal,
        )
    }

    pub fn send_notice(&self, target: &str, text: &str) -> AgentResult<()> {
        self.enqueue(
            Command::Notice(target.to_string(), text.to_string()),
            Priority::Normal,
        )
    }

    pub fn send_action(&self, target: &str, text: &str) -> AgentResult<()> {
        let wrapped = format!("\u{1}ACTION {}\u{1}", text);
        self.enqueue(Command::Privmsg(target.to_string(), wrapped), Priority::Normal)
    }

    pub fn send_raw(&self, line: &str) -> AgentResult<()> {
        self.enqueue_line(line.to_string(), Priority::Normal, false)
    }

    pub fn join(&self, channel: &str, key: Option<&str>) -> AgentResult<()> {
        self.enqueue(
            Command::Join(channel.to_string(), key.map(str::to_string)),
            Priority::Normal,
        )
    }

    pub fn part(&self, channel: &str, reason: Option<&str>) -> AgentResult<()> {
        self.enqueue(
            Command::Part(channel.to_string(), reason.map(str::to_string)),
            Priority::Normal,
        )
    }

    pub fn set_mode(&self, channel: &str, mode_string: &str) -> AgentResult<()> {
        let args: Vec<String> = mode_string.split(' ').map(str::to_string).collect();
        self.enqueue(Command::Mode(channel.to_string(), args), Priority::Normal)
    }

    pub fn kick(&self, channel: &str, nick: &str, reason: Option<&str>) -> AgentResult<()> {
        self.enqueue(
            Command::Kick {
                channel: channel.to_string(),
                nick: nick.to_string(),
                reason: reason.map(str::to_string),
            },
            Priority::Normal,
        )
    }

    fn enqueue(&self, command: Command, priority: Priority) -> AgentResult<()> {
        self.enqueue_line(command.to_string(), priority, false)
    }

    fn enqueue_line(&self, line: String, priority: Priority, bypass: bool) -> AgentResult<()> {
        if line.len() + 2 > MAX_LINE_LEN {
            return Err(AgentError::Protocol(format!(
                "outbound line exceeds 512 bytes ({})",
                line.len() + 2
            )));
        }
        let session = self.session.lock();
        let handle = session
            .as_ref()
            .ok_or_else(|| AgentError::InvalidState("not connected".into()))?;
        let cmd = if bypass {
            OutboundCommand::bypass(line)
        } else {
            OutboundCommand::new(line, priority)
        };
        handle
            .outbound
            .send(WriterMsg::Cmd(cmd))
            .map_err(|_| AgentError::InvalidState("session closing".into()))
    }

    // ------------------------------------------------------------------
    // Connect / reconnect loop
    // ------------------------------------------------------------------

    async fn run_loop(self: Arc<Connection>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut stop_rx = self.stop_tx.subscribe();
        let seed = Duration::from_secs(self.config.reconnect_delay_seconds.max(1));
        let mut delay = seed;
        let mut attempt: u32 = 0;

        loop {
            if stop_rx.borrow().is_some() {
                break;
            }
            {
                let mut state = self.conn_state.lock();
                let _ = state.transition(ConnectionState::Connecting);
            }
            info!(server = %self.config.id, host = %self.config.host, port = self.config.port, "connecting");

            let established = tokio::select! {
                result = transport::establish(&self.config, self.keystore.as_deref()) => result,
                _ = shutdown.recv() => break,
                _ = stop_rx.changed() => break,
            };

            let end = match established {
                Ok(stream) => {
                    self.emit(EventKind::Connected);
                    self.run_session(stream, &mut stop_rx, &mut shutdown).await
                }
                Err(e) => SessionEnd {
                    error: Some(e),
                    reached_registered: false,
                    requested: false,
                },
            };

            *self.session.lock() = None;
            let reason = match &end.error {
                Some(e) => e.to_string(),
                None => "disconnect requested".to_string(),
            };
            self.emit(EventKind::Disconnected {
                reason: reason.clone(),
            });

            if end.requested || stop_rx.borrow().is_some() {
                break;
            }

            let retriable = match &end.error {
                Some(e) => {
                    self.emit(EventKind::Error {
                        code: e.error_code(),
                        detail: e.to_string(),
                    });
                    e.is_retriable()
                }
                None => true,
            };
            if !self.config.auto_reconnect || !retriable {
                if let Some(e) = &end.error {
                    error!(server = %self.config.id, error = %e, "connection failed, not retrying");
                }
                break;
            }

            if end.reached_registered {
                attempt = 0;
                delay = seed;
            }
            attempt += 1;
            {
                let mut state = self.conn_state.lock();
                let _ = state.transition(ConnectionState::Reconnecting);
            }
            self.emit(EventKind::Reconnecting { attempt, delay });
            info!(server = %self.config.id, attempt, delay_s = delay.as_secs(), "reconnecting after backoff");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.recv() => break,
                _ = stop_rx.changed() => break,
            }
            delay = (delay * 2).min(MAX_BACKOFF);
        }

        *self.conn_state.lock() = ConnectionState::Disconnected;
        *self.session.lock() = None;
    }

    async fn run_session(
        &self,
        stream: IrcStream,
        stop_rx: &mut watch::Receiver<Option<String>>,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> SessionEnd {
        {
            let mut state = self.conn_state.lock();
            let _ = state.transition(ConnectionState::Negotiating);
        }
        *self.session_state.write() = SessionState::new(&self.config.nickname);

        let framed = Framed::new(stream, IrcCodec::new());
        let (sink, mut lines) = framed.split();

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let last_write = Arc::new(Mutex::new(Instant::now()));
        let writer = tokio::spawn(writer_task(
            sink,
            outbound_rx,
            self.config.flood_burst,
            Duration::from_millis(self.config.flood_interval_ms.max(1)),
            Arc::clone(&last_write),
        ));
        *self.session.lock() = Some(SessionHandle {
            outbound: outbound_tx.clone(),
        });

        let mut registration = match self.build_registration() {
            Ok(reg) => reg,
            Err(e) => {
                writer.abort();
                return SessionEnd {
                    error: Some(e),
                    reached_registered: false,
                    requested: false,
                };
            }
        };
        for line in registration.start() {
            let _ = outbound_tx.send(WriterMsg::Cmd(OutboundCommand::new(line, Priority::High)));
        }
        {
            let mut state = self.conn_state.lock();
            let _ = state.transition(ConnectionState::Registering);
        }

        let mut registered = false;
        let session_started = Instant::now();
        let mut protocol_errors: Vec<Instant> = Vec::new();
        let mut keepalive = tokio::time::interval(Duration::from_secs(5));
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let end = loop {
            tokio::select! {
                line = lines.next() => {
                    let line = match line {
                        Some(Ok(line)) => line,
                        Some(Err(e)) => break SessionEnd {
                            error: Some(AgentError::Transport(e.to_string())),
                            reached_registered: registered,
                            requested: false,
                        },
                        None => break SessionEnd {
                            error: Some(AgentError::Transport("connection closed by server".into())),
                            reached_registered: registered,
                            requested: false,
                        },
                    };

                    self.emit(EventKind::RawMessageReceived { line: line.clone() });

                    let msg: Message = match line.parse() {
                        Ok(msg) => msg,
                        Err(e) => {
                            warn!(server = %self.config.id, error = %e, line = %line, "dropping malformed line");
                            let now = Instant::now();
                            protocol_errors.retain(|t| now.duration_since(*t) < PROTOCOL_ERROR_WINDOW);
                            protocol_errors.push(now);
                            if protocol_errors.len() >= PROTOCOL_ERROR_LIMIT {
                                break SessionEnd {
                                    error: Some(AgentError::Transport("repeated protocol errors".into())),
                                    reached_registered: registered,
                                    requested: false,
                                };
                            }
                            continue;
                        }
                    };

                    if !registered {
                        let (reg_lines, reg_event) = registration.on_message(&msg);
                        for line in reg_lines {
                            let _ = outbound_tx.send(WriterMsg::Cmd(OutboundCommand::new(line, Priority::High)));
                        }
                        match reg_event {
                            Some(RegEvent::Registered { nick }) => {
                                registered = true;
                                {
                                    let mut state = self.conn_state.lock();
                                    let _ = state.transition(ConnectionState::Registered);
                                }
                                self.session_state.write().nick = nick.clone();
                                info!(server = %self.config.id, nick = %nick, "registered");
                                self.emit(EventKind::Registered);
                                self.run_auto_perform();
                            }
                            Some(RegEvent::Failed { reason }) => {
                                break SessionEnd {
                                    error: Some(AgentError::AuthFailed(reason)),
                                    reached_registered: false,
                                    requested: false,
                                };
                            }
                            None => {}
                        }
                    }

                    let batch = msg.batch_tag().map(str::to_string);
                    let output = {
                        let mut session = self.session_state.write();
                        handler::handle(&mut session, &msg, Instant::now())
                    };
                    for reply in output.replies {
                        let _ = outbound_tx.send(WriterMsg::Cmd(reply));
                    }
                    for kind in output.events {
                        if let EventKind::LatencyUpdated { ms } = kind {
                            self.latency_ms.store(ms, Ordering::Relaxed);
                        }
                        self.emit_batched(batch.clone(), kind);
                    }
                }
                _ = keepalive.tick() => {
                    if !registered {
                        if session_started.elapsed() > REGISTRATION_TIMEOUT {
                            break SessionEnd {
                                error: Some(AgentError::Timeout("registration did not complete".into())),
                                reached_registered: false,
                                requested: false,
                            };
                        }
                        continue;
                    }
                    let idle = last_write.lock().elapsed();
                    let pending = self.session_state.read().pending_pings.len();
                    if pending >= MAX_PENDING_PINGS {
                        break SessionEnd {
                            error: Some(AgentError::Timeout("no PONG after 3 probes".into())),
                            reached_registered: registered,
                            requested: false,
                        };
                    }
                    if idle >= PING_INTERVAL {
                        let cookie = uuid::Uuid::new_v4().simple().to_string();
                        self.session_state
                            .write()
                            .pending_pings
                            .push_back((cookie.clone(), Instant::now()));
                        let _ = outbound_tx.send(WriterMsg::Cmd(OutboundCommand::new(
                            Command::Ping(cookie, None).to_string(),
                            Priority::High,
                        )));
                    }
                }
                _ = stop_rx.changed() => {
                    let quit = stop_rx.borrow().clone();
                    if let Some(quit_msg) = quit {
                        if registered {
                            let _ = outbound_tx.send(WriterMsg::Cmd(OutboundCommand::new(
                                Command::Quit(Some(quit_msg)).to_string(),
                                Priority::High,
                            )));
                        }
                        break SessionEnd {
                            error: None,
                            reached_registered: registered,
                            requested: true,
                        };
                    }
                }
                _ = shutdown.recv() => {
                    if registered {
                        let _ = outbound_tx.send(WriterMsg::Cmd(OutboundCommand::new(
                            Command::Quit(Some("Shutting down".to_string())).to_string(),
                            Priority::High,
                        )));
                    }
                    break SessionEnd {
                        error: None,
                        reached_registered: registered,
                        requested: true,
                    };
                }
            }
        };

        // Flush whatever is queued (QUIT included), bounded.
        let (ack_tx, ack_rx) = oneshot::channel();
        if outbound_tx.send(WriterMsg::Flush(ack_tx)).is_ok() {
            let _ = tokio::time::timeout(Duration::from_secs(3), ack_rx).await;
        }
        writer.abort();
        *self.session.lock() = None;
        // The reconnect loop decides between Reconnecting and
        // Disconnected; the session only reports how it ended.
        end
    }

    fn run_auto_perform(&self) {
        if let Some(secret) = &self.config.nickserv_password {
            match secret.reveal(self.keystore.as_deref()) {
                Ok(password) => {
                    let _ = self.send_message("NickServ", &format!("IDENTIFY {}", &*password));
                }
                Err(e) => warn!(server = %self.config.id, error = %e, "nickserv password unavailable"),
            }
        }
        for raw in &self.config.auto_perform {
            if let Err(e) = self.send_raw(raw) {
                warn!(server = %self.config.id, error = %e, "auto-perform command rejected");
            }
        }
        for auto_join in &self.config.auto_join {
            let _ = self.join(&auto_join.channel, auto_join.key.as_deref());
        }
    }

    fn build_registration(&self) -> AgentResult<Registration> {
        let keystore = self.keystore.as_deref();
        let server_password = self
            .config
            .server_password
            .as_ref()
            .map(|s| s.reveal(keystore))
            .transpose()?;
        let sasl = match &self.config.sasl {
            Some(sasl_config) => Some(SaslOptions {
                username: sasl_config.username.clone(),
                password: sasl_config.password.reveal(keystore)?,
                required: sasl_config.required,
            }),
            None => None,
        };
        Ok(Registration::new(RegistrationOptions {
            nickname: self.config.nickname.clone(),
            alt_nicknames: self.config.alt_nicknames.clone(),
            username: self.config.username().to_string(),
            realname: self.config.realname().to_string(),
            server_password,
            sasl,
        }))
    }
}

/// Drains the flood queue into the sink. The only task that writes
/// bytes; everything else enqueues.
async fn writer_task(
    mut sink: futures_util::stream::SplitSink<Framed<IrcStream, IrcCodec>, String>,
    mut rx: mpsc::UnboundedReceiver<WriterMsg>,
    burst: u32,
    interval: Duration,
    last_write: Arc<Mutex<Instant>>,
) {
    let mut queue = FloodQueue::new(burst, interval, Instant::now());
    loop {
        let wait = queue.next_ready_in(Instant::now());
        tokio::select! {
            biased;
            msg = rx.recv() => {
                match msg {
                    Some(WriterMsg::Cmd(cmd)) => queue.push(cmd),
                    Some(WriterMsg::Flush(ack)) => {
                        // Closing down: push out everything left,
                        // ignoring the bucket.
                        while let Some(cmd) = pop_any(&mut queue) {
                            if sink.send(cmd.line).await.is_err() {
                                break;
                            }
                        }
                        let _ = sink.flush().await;
                        let _ = ack.send(());
                        return;
                    }
                    None => {
                        let _ = sink.flush().await;
                        return;
                    }
                }
            }
            _ = tokio::time::sleep(wait.unwrap_or(Duration::from_secs(3600))), if wait.is_some() => {}
        }

        while let Some(cmd) = queue.pop_ready(Instant::now()) {
            debug!(line = %cmd.line, waited_ms = cmd.enqueued_at.elapsed().as_millis() as u64, "send");
            if sink.send(cmd.line).await.is_err() {
                return;
            }
            *last_write.lock() = Instant::now();
        }
    }
}

fn pop_any(queue: &mut FloodQueue) -> Option<OutboundCommand> {
    // Far-future refill cannot be pending; take in priority order.
    let far = Instant::now() + Duration::from_secs(86400);
    queue.pop_ready(far)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};

    fn server_config(port: u16, extra: serde_json::Value) -> Arc<ServerConfig> {
        let mut base = serde_json::json!({
            "id": "test",
            "host": "127.0.0.1",
            "port": port,
            "tls": false,
            "nickname": "Munin",
            "altNicknames": ["Munin2"],
            "autoReconnect": false,
        });
        if let (Some(base_map), Some(extra_map)) = (base.as_object_mut(), extra.as_object()) {
            for (k, v) in extra_map {
                base_map.insert(k.clone(), v.clone());
            }
        }
        Arc::new(serde_json::from_value(base).unwrap())
    }

    struct MockPeer {
        reader: BufReader<tokio::io::ReadHalf<TcpStream>>,
        writer: tokio::io::WriteHalf<TcpStream>,
    }

    impl MockPeer {
        async fn accept(listener: &TcpListener) -> MockPeer {
            let (socket, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
                .await
                .expect("accept timeout")
                .expect("accept failed");
            let (read, writer) = tokio::io::split(socket);
            MockPeer {
                reader: BufReader::new(read),
                writer,
            }
        }

        async fn line(&mut self) -> Option<String> {
            let mut line = String::new();
            match tokio::time::timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
                .await
            {
                Ok(Ok(0)) => None,
                Ok(Ok(_)) => Some(line.trim_end().to_string()),
                Ok(Err(_)) => None,
                Err(_) => panic!("timed out waiting for a client line"),
            }
        }

        async fn line_within(&mut self, limit: Duration) -> Option<String> {
            let mut line = String::new();
            match tokio::time::timeout(limit, self.reader.read_line(&mut line)).await {
                Ok(Ok(0)) => None,
                Ok(Ok(_)) => Some(line.trim_end().to_string()),
                _ => None,
            }
        }

        async fn send(&mut self, line: &str) {
            self.writer
                .write_all(format!("{}\r\n", line).as_bytes())
                .await
                .expect("mock write");
        }

        /// Drive the registration exchange up to 001 for `nick`.
        async fn register(&mut self, nick: &str) {
            let mut saw_user = false;
            let mut saw_cap_ls = false;
            while !(saw_user && saw_cap_ls) {
                let line = self.line().await.expect("registration burst");
                if line.starts_with("CAP LS") {
                    saw_cap_ls = true;
                } else if line.starts_with("USER ") {
                    saw_user = true;
                }
            }
            self.send("CAP * LS :multi-prefix server-time").await;
            let req = self.line().await.expect("CAP REQ");
            assert!(req.starts_with("CAP REQ :"), "unexpected {}", req);
            self.send("CAP * ACK :multi-prefix server-time").await;
            let end = self.line().await.expect("CAP END");
            assert_eq!(end, "CAP END");
            self.send(&format!(":srv 001 {} :Welcome to the test net", nick))
                .await;
        }
    }

    async fn wait_for<F: Fn(&EventKind) -> bool>(
        events: &mut crate::events::EventStream,
        limit: Duration,
        pred: F,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            match tokio::time::timeout(remaining, events.next()).await {
                Ok(Some(event)) if pred(&event.kind) => return true,
                Ok(Some(_)) => continue,
                _ => return false,
            }
        }
    }

    async fn setup(
        extra: serde_json::Value,
    ) -> (Arc<Connection>, MockPeer, crate::events::EventStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let bus = EventBus::new();
        let events = bus.subscribe();
        let (shutdown_tx, _) = broadcast::channel(4);
        let conn = Connection::new(server_config(port, extra), None, bus, shutdown_tx);
        conn.connect().unwrap();
        let peer = MockPeer::accept(&listener).await;
        (conn, peer, events)
    }

    #[tokio::test]
    async fn registration_then_ping_pong() {
        let (conn, mut peer, mut events) = setup(serde_json::json!({})).await;
        peer.register("Munin").await;

        assert!(
            wait_for(&mut events, Duration::from_secs(1), |k| matches!(
                k,
                EventKind::Registered
            ))
            .await
        );
        assert_eq!(conn.state(), ConnectionState::Registered);
        assert_eq!(conn.current_nick(), "Munin");

        peer.send("PING :abc").await;
        let pong = peer
            .line_within(Duration::from_millis(200))
            .await
            .expect("PONG within 200ms");
        assert_eq!(pong, "PONG :abc");
        assert_eq!(conn.state(), ConnectionState::Registered);

        conn.disconnect(None).await.unwrap();
    }

    #[tokio::test]
    async fn nick_in_use_walks_alternates() {
        let (conn, mut peer, mut events) = setup(serde_json::json!({})).await;

        // Swallow the opening burst.
        let mut saw_nick = false;
        while !saw_nick {
            let line = peer.line().await.unwrap();
            saw_nick = line == "NICK Munin";
        }
        peer.send(":srv 433 * Munin :Nickname is already in use").await;

        // Client walks to the configured alternate.
        loop {
            let line = peer.line().await.unwrap();
            if line == "NICK Munin2" {
                break;
            }
        }
        peer.send(":srv 001 Munin2 :Welcome").await;
        assert!(
            wait_for(&mut events, Duration::from_secs(1), |k| matches!(
                k,
                EventKind::Registered
            ))
            .await
        );
        assert_eq!(conn.current_nick(), "Munin2");
        conn.disconnect(None).await.unwrap();
    }

    #[tokio::test]
    async fn auto_join_after_registration() {
        let extra = serde_json::json!({
            "autoJoin": [{"channel": "#rust", "key": "sekrit"}],
            "autoPerform": ["MODE Munin +B"],
        });
        let (conn, mut peer, _events) = setup(extra).await;
        peer.register("Munin").await;

        // Auto-perform precedes auto-join.
        let mut lines = Vec::new();
        for _ in 0..2 {
            lines.push(peer.line().await.unwrap());
        }
        assert_eq!(lines[0], "MODE Munin +B");
        assert_eq!(lines[1], "JOIN #rust sekrit");
        conn.disconnect(None).await.unwrap();
    }

    #[tokio::test]
    async fn flood_control_paces_outbound() {
        let extra = serde_json::json!({"floodBurst": 5, "floodIntervalMs": 200});
        let (conn, mut peer, mut events) = setup(extra).await;
        peer.register("Munin").await;
        assert!(
            wait_for(&mut events, Duration::from_secs(1), |k| matches!(
                k,
                EventKind::Registered
            ))
            .await
        );

        // Let the bucket refill after the registration burst.
        tokio::time::sleep(Duration::from_millis(1100)).await;

        let total = 15;
        for i in 0..total {
            conn.send_message("#x", &format!("msg {}", i)).unwrap();
        }
        let started = Instant::now();
        let mut received = 0;
        while received < total {
            let line = peer.line().await.expect("paced message");
            if line.starts_with("PRIVMSG #x") {
                received += 1;
            }
        }
        let elapsed = started.elapsed();
        // 15 messages, burst 5, 200ms per token: the tail 10 need 2s.
        assert!(
            elapsed >= Duration::from_millis(1500),
            "drained too fast: {:?}",
            elapsed
        );
        assert!(elapsed < Duration::from_secs(10), "too slow: {:?}", elapsed);
        conn.disconnect(None).await.unwrap();
    }

    #[tokio::test]
    async fn oversized_outbound_line_rejected() {
        let (conn, mut peer, mut events) = setup(serde_json::json!({})).await;
        peer.register("Munin").await;
        assert!(
            wait_for(&mut events, Duration::from_secs(1), |k| matches!(
                k,
                EventKind::Registered
            ))
            .await
        );
        let err = conn.send_message("#x", &"a".repeat(600)).unwrap_err();
        assert_eq!(err.error_code(), "protocol");
        conn.disconnect(None).await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_sends_quit_and_quiesces() {
        let (conn, mut peer, mut events) = setup(serde_json::json!({})).await;
        peer.register("Munin").await;
        assert!(
            wait_for(&mut events, Duration::from_secs(1), |k| matches!(
                k,
                EventKind::Registered
            ))
            .await
        );

        conn.disconnect(Some("bye then".to_string())).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        // QUIT is flushed, then nothing further is written.
        let quit = peer.line_within(Duration::from_secs(2)).await;
        assert_eq!(quit.as_deref(), Some("QUIT :bye then"));
        assert!(peer.line_within(Duration::from_millis(500)).await.is_none());

        let err = conn.send_message("#x", "after close").unwrap_err();
        assert_eq!(err.error_code(), "invalid_state");
    }

    #[tokio::test]
    async fn room_model_tracks_channel_events() {
        let (conn, mut peer, mut events) = setup(serde_json::json!({})).await;
        peer.register("Munin").await;
        assert!(
            wait_for(&mut events, Duration::from_secs(1), |k| matches!(
                k,
                EventKind::Registered
            ))
            .await
        );

        peer.send(":Munin!m@h JOIN #rust").await;
        peer.send(":srv 353 Munin = #rust :@alice +bob Munin").await;
        peer.send(":srv 366 Munin #rust :End of /NAMES list.").await;
        assert!(
            wait_for(&mut events, Duration::from_secs(1), |k| matches!(
                k,
                EventKind::UserListUpdated { .. }
            ))
            .await
        );
        let chan = conn.channel("#rust").expect("channel tracked");
        assert_eq!(chan.user_count(), 3);
        assert!(chan.joined);
        conn.disconnect(None).await.unwrap();
    }
}
