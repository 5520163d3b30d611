//! Configuration type definitions.

use serde::{Deserialize, Serialize};

use super::defaults::*;
use super::secret::Secret;

/// Log output format, selected at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Top-level agent configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Stable agent identity (UUID).
    pub agent_id: String,
    /// Agent name; also the mesh peer name.
    pub name: String,
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    #[serde(default)]
    pub control_server: ControlServerConfig,
    #[serde(default)]
    pub botnet: BotnetConfig,
    /// Directory of trigger rule files, relative to the data dir.
    #[serde(default = "default_triggers_dir")]
    pub triggers_dir: String,
    /// Directory of Lua scripts, relative to the data dir.
    #[serde(default = "default_scripts_dir")]
    pub scripts_dir: String,
    #[serde(default)]
    pub protection: Vec<ProtectionRule>,
}

/// One IRC network the agent connects to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Stable id, unique across the document.
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub tls: bool,
    /// Accept certificates that fail validation (logged, not fatal).
    #[serde(default)]
    pub accept_invalid_certificates: bool,
    pub nickname: String,
    #[serde(default)]
    pub alt_nicknames: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub realname: Option<String>,
    #[serde(default)]
    pub server_password: Option<Secret>,
    #[serde(default)]
    pub nickserv_password: Option<Secret>,
    #[serde(default)]
    pub sasl: Option<SaslConfig>,
    #[serde(default)]
    pub client_cert: Option<ClientCertConfig>,
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
    #[serde(default)]
    pub auto_join: Vec<AutoJoin>,
    #[serde(default = "default_true")]
    pub auto_connect: bool,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    #[serde(default = "default_reconnect_delay_seconds")]
    pub reconnect_delay_seconds: u64,
    #[serde(default = "default_flood_burst")]
    pub flood_burst: u32,
    #[serde(default = "default_flood_interval_ms")]
    pub flood_interval_ms: u64,
    /// Raw commands executed after registration, before auto-join.
    #[serde(default)]
    pub auto_perform: Vec<String>,
}

impl ServerConfig {
    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.id)
    }

    pub fn username(&self) -> &str {
        self.username.as_deref().unwrap_or(&self.nickname)
    }

    pub fn realname(&self) -> &str {
        self.realname.as_deref().unwrap_or(&self.nickname)
    }
}

/// SASL PLAIN credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaslConfig {
    pub username: String,
    pub password: Secret,
    /// Abort registration when SASL fails instead of continuing without.
    #[serde(default)]
    pub required: bool,
}

/// Client certificate presented during TLS.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientCertConfig {
    pub path: String,
    #[serde(default)]
    pub password: Option<Secret>,
}

/// Proxy hop in front of the IRC transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<Secret>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Socks4,
    Socks5,
    Http,
}

/// Channel joined automatically after registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoJoin {
    pub channel: String,
    #[serde(default)]
    pub key: Option<String>,
}

/// Control-plane server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlServerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_control_port")]
    pub port: u16,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// PEM file holding the certificate chain and PKCS#8 key.
    #[serde(default)]
    pub certificate_path: Option<String>,
    /// Accepted for PFX-era documents; ignored for PEM inputs.
    #[serde(default)]
    pub certificate_password: Option<Secret>,
    #[serde(default)]
    pub auth_token: Option<Secret>,
    #[serde(default = "default_auth_timeout_seconds")]
    pub auth_timeout_seconds: u64,
    /// Literals, `*`/`?` globs or IPv4 CIDR. Empty means any.
    #[serde(default)]
    pub allowed_ips: Vec<String>,
}

impl Default for ControlServerConfig {
    fn default() -> ControlServerConfig {
        ControlServerConfig {
            enabled: false,
            port: default_control_port(),
            bind_address: default_bind_address(),
            certificate_path: None,
            certificate_password: None,
            auth_token: None,
            auth_timeout_seconds: default_auth_timeout_seconds(),
            allowed_ips: Vec::new(),
        }
    }
}

/// Bot-mesh settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotnetConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_botnet_port")]
    pub listen_port: u16,
    #[serde(default)]
    pub shared_secret: Option<Secret>,
    #[serde(default)]
    pub linked_bots: Vec<LinkedBot>,
}

impl Default for BotnetConfig {
    fn default() -> BotnetConfig {
        BotnetConfig {
            enabled: false,
            listen_port: default_botnet_port(),
            shared_secret: None,
            linked_bots: Vec::new(),
        }
    }
}

/// One peer agent this node may link with.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkedBot {
    pub name: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    /// Dial out to this peer; peers without host/port are inbound-only.
    #[serde(default)]
    pub auto_connect: bool,
}

/// Channel-protection reaction rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtectionRule {
    /// Server id filter; `None` applies everywhere.
    #[serde(default)]
    pub server: Option<String>,
    /// Channel filter (glob); `None` applies to every channel.
    #[serde(default)]
    pub channel: Option<String>,
    pub kind: crate::protect::WatchKind,
    #[serde(default = "default_protection_window")]
    pub window_seconds: u64,
    #[serde(default = "default_protection_threshold")]
    pub threshold: u32,
    #[serde(default)]
    pub scope: ProtectionScope,
    pub action: PunishAction,
    #[serde(default)]
    pub ban_ttl_seconds: Option<u64>,
    #[serde(default)]
    pub ban_mask: BanMaskStyle,
    /// Forbidden-pattern rules match this glob against message text.
    #[serde(default)]
    pub pattern: Option<String>,
}

/// How a ban mask is derived from `nick!user@host`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BanMaskStyle {
    /// `*!*@host`
    #[default]
    Host,
    /// `nick!*@*`
    Nick,
    /// `*!user@*`
    User,
    /// `nick!user@host`
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtectionScope {
    #[default]
    PerNick,
    PerChannel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PunishAction {
    Warn,
    Kick,
    Kickban,
}
