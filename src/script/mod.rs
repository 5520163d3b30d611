//! Cross-language scripting binding.
//!
//! The dispatcher feeds events to a registered [`ScriptEngine`]; the
//! engine returns the side effects its scripts requested. The contract
//! does not care what language the scripts are written in; the shipped
//! implementation is an embedded Lua sandbox ([`lua::LuaEngine`]).

pub mod lua;

use std::path::Path;

use crate::error::AgentResult;
use crate::triggers::TriggerEvent;
use crate::users::AccessUser;

/// The event view handed to scripts.
#[derive(Debug, Clone)]
pub struct ScriptEventData {
    pub kind: TriggerEvent,
    pub server: String,
    pub channel: String,
    pub nick: String,
    pub hostmask: String,
    pub text: String,
}

/// A side effect requested by a script, performed by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptAction {
    Reply { target: String, text: String },
    Action { target: String, text: String },
    Notice { target: String, text: String },
    Raw { line: String },
    Join { channel: String, key: Option<String> },
    Part { channel: String, reason: Option<String> },
    Kick { channel: String, nick: String, reason: Option<String> },
    Mode { channel: String, modes: String },
    Log { message: String },
}

/// Script-engine provider contract.
pub trait ScriptEngine: Send + Sync {
    /// Load a script file; returns the script name it registered under.
    fn load(&self, path: &Path) -> AgentResult<String>;

    /// Unload a script and drop its binds.
    fn unload(&self, name: &str) -> AgentResult<()>;

    /// Reload a previously loaded script from its original path.
    fn reload(&self, name: &str) -> AgentResult<()>;

    /// Names of currently loaded scripts.
    fn loaded(&self) -> Vec<String>;

    /// Run all matching binds for an event. `access` is the matched
    /// access-database user, when any hostmask matched.
    fn dispatch(&self, event: &ScriptEventData, access: Option<&AccessUser>) -> Vec<ScriptAction>;
}
