//! Serde default helpers for the configuration document.

pub fn default_true() -> bool {
    true
}

pub fn default_port() -> u16 {
    6697
}

pub fn default_flood_burst() -> u32 {
    5
}

pub fn default_flood_interval_ms() -> u64 {
    1000
}

pub fn default_reconnect_delay_seconds() -> u64 {
    5
}

pub fn default_control_port() -> u16 {
    7550
}

pub fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

pub fn default_auth_timeout_seconds() -> u64 {
    15
}

pub fn default_botnet_port() -> u16 {
    7551
}

pub fn default_triggers_dir() -> String {
    "triggers".to_string()
}

pub fn default_scripts_dir() -> String {
    "scripts".to_string()
}

pub fn default_protection_window() -> u64 {
    10
}

pub fn default_protection_threshold() -> u32 {
    5
}
