//! Facade over the agent's connections.
//!
//! Peer links and control sessions never touch a `Connection` directly;
//! they call this service, which owns the connection table and applies
//! the permission model where one is required.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::info;

use crate::error::{AgentError, AgentResult};
use crate::irc::Connection;
use crate::users::UserDb;

pub struct BotService {
    pub agent_name: String,
    pub agent_id: String,
    pub version: String,
    started_at: Instant,
    connections: DashMap<String, Arc<Connection>>,
    pub user_db: Arc<UserDb>,
    shutdown_tx: broadcast::Sender<()>,
}

impl BotService {
    pub fn new(
        agent_name: String,
        agent_id: String,
        user_db: Arc<UserDb>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> BotService {
        BotService {
            agent_name,
            agent_id,
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: Instant::now(),
            connections: DashMap::new(),
            user_db,
            shutdown_tx,
        }
    }

    pub fn register_connection(&self, conn: Arc<Connection>) {
        self.connections
            .insert(conn.server_id().to_ascii_lowercase(), conn);
    }

    pub fn connection(&self, server_id: &str) -> AgentResult<Arc<Connection>> {
        self.connections
            .get(&server_id.to_ascii_lowercase())
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| AgentError::Config(format!("no such server: {}", server_id)))
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect()
    }

    pub fn uptime_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    pub fn shutdown(&self) {
        info!("shutdown requested");
        let _ = self.shutdown_tx.send(());
    }

    // Channel operations used by the control plane, mesh and dispatcher.

    pub fn join(&self, server_id: &str, channel: &str, key: Option<&str>) -> AgentResult<()> {
        self.connection(server_id)?.join(channel, key)
    }

    pub fn part(&self, server_id: &str, channel: &str, reason: Option<&str>) -> AgentResult<()> {
        self.connection(server_id)?.part(channel, reason)
    }

    pub fn send_message(&self, server_id: &str, target: &str, text: &str) -> AgentResult<()> {
        self.connection(server_id)?.send_message(target, text)
    }

    pub fn send_notice(&self, server_id: &str, target: &str, text: &str) -> AgentResult<()> {
        self.connection(server_id)?.send_notice(target, text)
    }

    pub fn send_action(&self, server_id: &str, target: &str, text: &str) -> AgentResult<()> {
        self.connection(server_id)?.send_action(target, text)
    }

    pub fn send_raw(&self, server_id: &str, line: &str) -> AgentResult<()> {
        self.connection(server_id)?.send_raw(line)
    }

    pub fn kick(
        &self,
        server_id: &str,
        channel: &str,
        nick: &str,
        reason: Option<&str>,
    ) -> AgentResult<()> {
        self.connection(server_id)?.kick(channel, nick, reason)
    }

    pub fn set_mode(&self, server_id: &str, channel: &str, mode_string: &str) -> AgentResult<()> {
        self.connection(server_id)?.set_mode(channel, mode_string)
    }

    pub fn connect(&self, server_id: &str) -> AgentResult<()> {
        self.connection(server_id)?.connect()
    }

    pub async fn disconnect(&self, server_id: &str, quit_msg: Option<String>) -> AgentResult<()> {
        self.connection(server_id)?.disconnect(quit_msg).await
    }

    /// True when the agent holds ops on the channel.
    pub fn has_ops(&self, server_id: &str, channel: &str) -> bool {
        let Ok(conn) = self.connection(server_id) else {
            return false;
        };
        let nick = conn.current_nick();
        let isupport = conn.isupport();
        conn.channel(channel).is_some_and(|chan| {
            chan.user(isupport.casemapping, &nick)
                .is_some_and(|user| user.is_op(&isupport))
        })
    }

    // JSON views for the control plane.

    pub fn status_json(&self) -> serde_json::Value {
        json!({
            "agentName": self.agent_name,
            "agentId": self.agent_id,
            "version": self.version,
            "uptimeMs": self.uptime_ms(),
            "servers": self.connections.len(),
            "users": self.user_db.len(),
        })
    }

    pub fn connections_json(&self) -> serde_json::Value {
        let list: Vec<serde_json::Value> = self
            .connections()
            .into_iter()
            .map(|conn| {
                json!({
                    "id": conn.server_id(),
                    "state": format!("{:?}", conn.state()),
                    "nickname": conn.current_nick(),
                    "latencyMs": conn.latency_ms(),
                })
            })
            .collect();
        json!(list)
    }

    pub fn channels_json(&self) -> serde_json::Value {
        let mut list = Vec::new();
        for conn in self.connections() {
            for chan in conn.channels() {
                list.push(json!({
                    "server": conn.server_id(),
                    "name": chan.name,
                    "users": chan.user_count(),
                    "topic": chan.topic.as_ref().map(|t| t.text.clone()),
                    "joined": chan.joined,
                }));
            }
        }
        json!(list)
    }

    pub fn users_json(&self) -> serde_json::Value {
        serde_json::to_value(self.user_db.snapshot()).unwrap_or_else(|_| json!([]))
    }
}
