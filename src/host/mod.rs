//! Agent host: owns every subsystem and supervises their tasks.

mod dispatcher;
mod service;

pub use dispatcher::Dispatcher;
pub use service::BotService;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{error, info, warn};
use zeroize::Zeroizing;

use crate::config::Config;
use crate::error::{AgentError, AgentResult};
use crate::events::EventBus;
use crate::irc::Connection;
use crate::keystore::Keystore;
use crate::mesh::protocol::{OpGrant, PartyMember, WhoReply};
use crate::mesh::{MeshEvent, MeshManager, MeshMessage};
use crate::protect::ProtectionEngine;
use crate::script::lua::LuaEngine;
use crate::script::ScriptEngine;
use crate::stats::StatsStore;
use crate::triggers::TriggerEngine;
use crate::users::UserDb;

const USER_DB_SAVE_INTERVAL: Duration = Duration::from_secs(60);
const STATS_FLUSH_INTERVAL: Duration = Duration::from_secs(300);
const BAN_EXPIRY_INTERVAL: Duration = Duration::from_secs(30);

/// Restart a supervised task with exponential backoff when it panics;
/// a clean exit ends supervision.
fn spawn_supervised<F, Fut>(name: &'static str, mut shutdown: broadcast::Receiver<()>, factory: F)
where
    F: Fn() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut backoff = Duration::from_secs(1);
        loop {
            let handle = tokio::spawn(factory());
            tokio::select! {
                result = handle => {
                    match result {
                        Ok(()) => return,
                        Err(e) if e.is_panic() => {
                            error!(task = name, "task panicked, restarting in {:?}", backoff);
                            tokio::time::sleep(backoff).await;
                            backoff = (backoff * 2).min(Duration::from_secs(60));
                        }
                        Err(_) => return,
                    }
                }
                _ = shutdown.recv() => return,
            }
        }
    });
}

pub struct AgentHost {
    pub config: Config,
    pub data_dir: PathBuf,
    pub keystore: Option<Arc<Keystore>>,
}

impl AgentHost {
    /// Run the agent until shutdown. This is the whole supervisor:
    /// everything is wired here, in dependency order.
    pub async fn run(self) -> AgentResult<()> {
        let AgentHost {
            config,
            data_dir,
            keystore,
        } = self;

        std::fs::create_dir_all(&data_dir)
            .map_err(|e| AgentError::Config(format!("data dir {}: {}", data_dir.display(), e)))?;

        let (shutdown_tx, _) = broadcast::channel::<()>(8);
        let bus = EventBus::new();

        // User database.
        let user_db_path = data_dir.join("users.json");
        let user_db = Arc::new(UserDb::load(&user_db_path, keystore.as_deref())?);
        info!(users = user_db.len(), "user database loaded");

        // Facade + connections.
        let service = Arc::new(BotService::new(
            config.name.clone(),
            config.agent_id.clone(),
            Arc::clone(&user_db),
            shutdown_tx.clone(),
        ));
        for server_config in &config.servers {
            let conn = Connection::new(
                Arc::new(server_config.clone()),
                keystore.clone(),
                bus.clone(),
                shutdown_tx.clone(),
            );
            service.register_connection(Arc::clone(&conn));
            if server_config.auto_connect {
                conn.connect()?;
            }
        }
        info!(servers = config.servers.len(), "connections registered");

        // Triggers and scripts.
        let triggers = TriggerEngine::load_dir(&data_dir.join(&config.triggers_dir));
        info!(triggers = triggers.len(), "trigger rules loaded");
        let scripts: Option<Arc<dyn ScriptEngine>> = match LuaEngine::new() {
            Ok(engine) => {
                let engine = Arc::new(engine);
                let scripts_dir = data_dir.join(&config.scripts_dir);
                if let Ok(paths) = glob::glob(&scripts_dir.join("*.lua").to_string_lossy()) {
                    for path in paths.filter_map(Result::ok) {
                        match engine.load(&path) {
                            Ok(name) => info!(script = %name, "script loaded"),
                            Err(e) => warn!(path = %path.display(), error = %e, "script load failed"),
                        }
                    }
                }
                Some(engine)
            }
            Err(e) => {
                warn!(error = %e, "script engine unavailable");
                None
            }
        };

        // Protection and stats.
        let protection = Arc::new(ProtectionEngine::new(config.protection.clone()));
        let stats = Arc::new(StatsStore::new(&data_dir.join("stats")));

        // Mesh.
        let mesh = if config.botnet.enabled || !config.botnet.linked_bots.is_empty() {
            let secret = match &config.botnet.shared_secret {
                Some(secret) => secret.reveal(keystore.as_deref())?,
                None => {
                    return Err(AgentError::Config(
                        "botnet configured without sharedSecret".into(),
                    ))
                }
            };
            let (manager, events_rx) = MeshManager::new(
                config.name.clone(),
                Zeroizing::new(secret.to_string()),
                config.botnet.clone(),
                Arc::clone(&user_db),
                shutdown_tx.clone(),
            );
            manager.start();
            spawn_mesh_event_task(
                Arc::clone(&manager),
                Arc::clone(&service),
                Arc::clone(&user_db),
                events_rx,
                shutdown_tx.subscribe(),
            );
            Some(manager)
        } else {
            None
        };

        // Control plane.
        if config.control_server.enabled {
            let token = config
                .control_server
                .auth_token
                .as_ref()
                .ok_or_else(|| AgentError::Config("controlServer.authToken missing".into()))?
                .reveal(keystore.as_deref())?;
            let control = crate::control::ControlServer::new(
                config.control_server.clone(),
                Zeroizing::new(token.to_string()),
                Arc::clone(&service),
                bus.clone(),
                shutdown_tx.clone(),
            );
            control.start().await?;
        }

        // Dispatcher (supervised: trigger and script code runs here).
        {
            let dispatcher = Arc::new(Dispatcher {
                service: Arc::clone(&service),
                triggers,
                scripts,
                protection: Arc::clone(&protection),
                stats: Arc::clone(&stats),
                user_db: Arc::clone(&user_db),
            });
            let bus = bus.clone();
            let shutdown_tx = shutdown_tx.clone();
            spawn_supervised("dispatcher", shutdown_tx.subscribe(), move || {
                let dispatcher = Arc::clone(&dispatcher);
                let events = bus.subscribe();
                let shutdown = shutdown_tx.subscribe();
                async move {
                    dispatcher.run(events, shutdown).await;
                }
            });
        }

        // Periodic user-database save.
        {
            let user_db = Arc::clone(&user_db);
            let keystore = keystore.clone();
            let path = user_db_path.clone();
            let mut shutdown = shutdown_tx.subscribe();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(USER_DB_SAVE_INTERVAL);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            if user_db.is_dirty() {
                                if let Err(e) = user_db.save(&path, keystore.as_deref()) {
                                    warn!(error = %e, "user database save failed");
                                }
                            }
                        }
                        _ = shutdown.recv() => return,
                    }
                }
            });
        }

        // Periodic stats flush.
        {
            let stats = Arc::clone(&stats);
            let mut shutdown = shutdown_tx.subscribe();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(STATS_FLUSH_INTERVAL);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = interval.tick() => { stats.flush(); }
                        _ = shutdown.recv() => return,
                    }
                }
            });
        }

        // Timed-ban expiry: lift bans we placed once their TTL passes.
        {
            let protection = Arc::clone(&protection);
            let service = Arc::clone(&service);
            let mut shutdown = shutdown_tx.subscribe();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(BAN_EXPIRY_INTERVAL);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            for ban in protection.take_expired_bans() {
                                if service.has_ops(&ban.server_id, &ban.channel) {
                                    let _ = service.set_mode(
                                        &ban.server_id,
                                        &ban.channel,
                                        &format!("-b {}", ban.mask),
                                    );
                                } else {
                                    warn!(channel = %ban.channel, mask = %ban.mask, "ban expired but we lack ops");
                                }
                            }
                        }
                        _ = shutdown.recv() => return,
                    }
                }
            });
        }

        // Signals.
        {
            let shutdown_tx = shutdown_tx.clone();
            tokio::spawn(async move {
                wait_for_signal().await;
                info!("signal received, shutting down");
                let _ = shutdown_tx.send(());
            });
        }

        info!(agent = %config.name, "agent host running");
        let mut shutdown_rx = shutdown_tx.subscribe();
        let _ = shutdown_rx.recv().await;

        // Orderly teardown: QUIT connections, final saves.
        for conn in service.connections() {
            let _ = conn.disconnect(Some("Shutting down".to_string())).await;
        }
        if let Some(mesh) = &mesh {
            info!(peers = mesh.peer_names().len(), "mesh links closing");
        }
        if user_db.is_dirty() {
            if let Err(e) = user_db.save(&user_db_path, keystore.as_deref()) {
                warn!(error = %e, "final user database save failed");
            }
        }
        stats.flush();
        info!("agent host stopped");
        Ok(())
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(_) => return std::future::pending().await,
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(_) => return std::future::pending().await,
    };
    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// React to peer requests. Channel operations are gated on the peer
/// holding the bot-peer (`b`) or botnet (`t`) flag in the shared
/// database under its own agent name.
fn spawn_mesh_event_task(
    mesh: Arc<MeshManager>,
    service: Arc<BotService>,
    user_db: Arc<UserDb>,
    mut events: tokio::sync::mpsc::UnboundedReceiver<MeshEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let peer_trusted = |peer: &str| {
            user_db
                .find_by_handle(peer)
                .is_some_and(|u| u.has_flag(None, 'b') || u.has_flag(None, 't'))
        };
        loop {
            let event = tokio::select! {
                event = events.recv() => match event {
                    Some(event) => event,
                    None => return,
                },
                _ = shutdown.recv() => return,
            };
            match event {
                MeshEvent::PeerLinked { peer } => {
                    info!(peer = %peer, "mesh peer linked");
                }
                MeshEvent::PeerUnlinked { peer, reason } => {
                    info!(peer = %peer, reason = %reason, "mesh peer unlinked");
                }
                MeshEvent::Chat {
                    peer,
                    from_nick,
                    channel,
                    text,
                    action,
                } => {
                    info!(target: "partyline", peer = %peer, channel = %channel, action, "<{}> {}", from_nick, text);
                }
                MeshEvent::PartyJoin { peer, nick, channel, .. } => {
                    info!(target: "partyline", peer = %peer, channel = %channel, "{} joined", nick);
                }
                MeshEvent::PartyPart { peer, nick, channel, .. } => {
                    info!(target: "partyline", peer = %peer, channel = %channel, "{} left", nick);
                }
                MeshEvent::WhoRequest { peer, channel } => {
                    let reply = MeshMessage::WhoReply(WhoReply {
                        members: vec![PartyMember {
                            nick: mesh.local_name().to_string(),
                            agent: mesh.local_name().to_string(),
                            channel: channel.unwrap_or_else(|| "*party*".to_string()),
                        }],
                    });
                    let _ = mesh.send_to(&peer, &reply);
                }
                MeshEvent::OpRequest {
                    peer,
                    server,
                    channel,
                    nick,
                } => {
                    let granted = peer_trusted(&peer)
                        && service
                            .set_mode(&server, &channel, &format!("+o {}", nick))
                            .is_ok();
                    if !granted {
                        warn!(peer = %peer, channel = %channel, "op request refused");
                    }
                    let grant = MeshMessage::OpGrant(OpGrant {
                        server,
                        channel,
                        nick,
                        granted,
                    });
                    let _ = mesh.send_to(&peer, &grant);
                }
                MeshEvent::KickRequest {
                    peer,
                    server,
                    channel,
                    nick,
                    reason,
                } => {
                    if peer_trusted(&peer) {
                        let reason = if reason.is_empty() {
                            format!("requested by {}", peer)
                        } else {
                            reason
                        };
                        let _ = service.kick(&server, &channel, &nick, Some(&reason));
                    } else {
                        warn!(peer = %peer, "kick request refused");
                    }
                }
                MeshEvent::BanSync {
                    peer,
                    server,
                    channel,
                    mask,
                    ..
                } => {
                    if peer_trusted(&peer) {
                        let _ = service.set_mode(&server, &channel, &format!("+b {}", mask));
                    } else {
                        warn!(peer = %peer, "ban sync refused");
                    }
                }
            }
        }
    });
}
