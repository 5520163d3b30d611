//! Agent configuration.
//!
//! The configuration is a JSON document with camelCase keys. Sensitive
//! fields are [`secret::Secret`] values: plain strings in an unlocked
//! document, `{ "data": "<base64 ciphertext>" }` wrappers in a sealed one.

mod defaults;
mod paths;
mod secret;
mod types;
mod validation;

pub use paths::data_dir;
pub use secret::Secret;
pub use types::{
    AutoJoin, BanMaskStyle, BotnetConfig, ClientCertConfig, Config, ControlServerConfig, LinkedBot,
    LogFormat, ProtectionRule, ProtectionScope, ProxyConfig, ProxyKind, PunishAction, SaslConfig,
    ServerConfig,
};
pub use validation::validate;

use crate::error::{AgentError, AgentResult};
use crate::keystore::Keystore;
use std::path::Path;

impl Config {
    /// Load a configuration document from disk.
    ///
    /// A document sealed by the blob cipher (detected via its magic
    /// prefix) is transparently decrypted when a keystore is supplied.
    pub fn load(path: &Path, keystore: Option<&Keystore>) -> AgentResult<Config> {
        let raw = std::fs::read(path)
            .map_err(|e| AgentError::Config(format!("read {}: {}", path.display(), e)))?;

        let raw = if crate::keystore::is_sealed(&raw) {
            let ks = keystore.ok_or_else(|| {
                AgentError::Config(format!(
                    "{} is encrypted; run `munin-agent decrypt` or set MUNIN_PASSPHRASE",
                    path.display()
                ))
            })?;
            ks.decrypt(&raw)?
        } else {
            raw
        };

        serde_json::from_slice(&raw)
            .map_err(|e| AgentError::Config(format!("parse {}: {}", path.display(), e)))
    }
}
