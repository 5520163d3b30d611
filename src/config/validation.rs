//! Startup configuration validation.
//!
//! Collects every problem instead of stopping at the first; a subsystem
//! with invalid configuration is fatal for that subsystem only, so the
//! operator sees the full list at once.

use std::collections::HashSet;

use super::types::Config;

/// Validate a configuration document, returning all errors found.
pub fn validate(config: &Config) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if config.name.is_empty() {
        errors.push("agent name must not be empty".to_string());
    }
    if config.agent_id.is_empty() {
        errors.push("agentId must not be empty".to_string());
    }

    let mut seen = HashSet::new();
    for server in &config.servers {
        if server.id.is_empty() {
            errors.push(format!("server {}: id must not be empty", server.host));
        }
        if !seen.insert(server.id.to_ascii_lowercase()) {
            errors.push(format!("server {}: duplicate id", server.id));
        }
        if server.host.is_empty() {
            errors.push(format!("server {}: host must not be empty", server.id));
        }
        if server.port == 0 {
            errors.push(format!("server {}: port must not be 0", server.id));
        }
        if server.nickname.is_empty() {
            errors.push(format!("server {}: nickname must not be empty", server.id));
        }
        if let Some(proxy) = &server.proxy {
            if proxy.host.is_empty() || proxy.port == 0 {
                errors.push(format!("server {}: proxy host/port invalid", server.id));
            }
        }
    }

    if config.control_server.enabled {
        if config.control_server.certificate_path.is_none() {
            errors.push("controlServer: certificatePath required when enabled".to_string());
        }
        if config.control_server.auth_token.is_none() {
            errors.push("controlServer: authToken required when enabled".to_string());
        }
        if config.control_server.port == 0 {
            errors.push("controlServer: port must not be 0".to_string());
        }
    }

    if config.botnet.enabled {
        if config.botnet.shared_secret.is_none() {
            errors.push("botnet: sharedSecret required when enabled".to_string());
        }
        for bot in &config.botnet.linked_bots {
            if bot.name.is_empty() {
                errors.push("botnet: linked bot with empty name".to_string());
            }
            if bot.auto_connect && (bot.host.is_none() || bot.port.is_none()) {
                errors.push(format!(
                    "botnet: linked bot {} has autoConnect but no host/port",
                    bot.name
                ));
            }
        }
    }

    for rule in &config.protection {
        if rule.window_seconds == 0 {
            errors.push("protection: windowSeconds must not be 0".to_string());
        }
        if rule.threshold == 0 {
            errors.push("protection: threshold must not be 0".to_string());
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ServerConfig};

    fn base_config() -> Config {
        serde_json::from_str(
            r#"{"agentId":"id","name":"munin","servers":[
                {"id":"a","host":"irc.example","port":6697,"nickname":"munin"}
            ]}"#,
        )
        .unwrap()
    }

    #[test]
    fn valid_config_passes() {
        assert!(validate(&base_config()).is_ok());
    }

    #[test]
    fn duplicate_server_ids_flagged() {
        let mut config = base_config();
        let mut dup: ServerConfig = config.servers[0].clone();
        dup.id = "A".to_string();
        config.servers.push(dup);
        let errors = validate(&config).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("duplicate id")));
    }

    #[test]
    fn enabled_control_server_requires_cert_and_token() {
        let mut config = base_config();
        config.control_server.enabled = true;
        let errors = validate(&config).unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn autoconnect_peer_requires_endpoint() {
        let mut config = base_config();
        config.botnet.enabled = true;
        config.botnet.shared_secret = Some(crate::config::Secret::Plain("s".into()));
        config.botnet.linked_bots.push(crate::config::LinkedBot {
            name: "hugin".into(),
            host: None,
            port: None,
            auto_connect: true,
        });
        let errors = validate(&config).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("hugin")));
    }
}
