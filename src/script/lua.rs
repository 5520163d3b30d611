//! Embedded Lua script engine.
//!
//! Scripts call a global `bind(kind, flags, mask, fn)` at load time;
//! matching events invoke the bound function with a context table that
//! exposes the reply/notice/raw/join/part/kick/mode/log surface. The VM
//! lives behind a mutex; script side effects are buffered and drained
//! by the dispatcher, so Lua never calls back into async code.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use mlua::{Function, Lua, RegistryKey, Table};
use parking_lot::Mutex;
use tracing::{debug, warn};
use wildmatch::WildMatch;

use super::{ScriptAction, ScriptEngine, ScriptEventData};
use crate::error::{AgentError, AgentResult};
use crate::triggers::TriggerEvent;
use crate::users::AccessUser;

struct Bind {
    script: String,
    kind: TriggerEvent,
    flags: String,
    mask: String,
    key: RegistryKey,
}

fn parse_kind(raw: &str) -> Option<TriggerEvent> {
    Some(match raw.to_ascii_lowercase().as_str() {
        "message" => TriggerEvent::Message,
        "privmsg" => TriggerEvent::Privmsg,
        "join" => TriggerEvent::Join,
        "part" => TriggerEvent::Part,
        "quit" => TriggerEvent::Quit,
        "nick" => TriggerEvent::Nick,
        "topic" => TriggerEvent::Topic,
        "kick" => TriggerEvent::Kick,
        "notice" => TriggerEvent::Notice,
        "ctcp" => TriggerEvent::Ctcp,
        "invite" => TriggerEvent::Invite,
        "mode" => TriggerEvent::Mode,
        "input" => TriggerEvent::Input,
        _ => return None,
    })
}

struct VmState {
    lua: Lua,
    scripts: HashMap<String, PathBuf>,
}

pub struct LuaEngine {
    vm: Mutex<VmState>,
    binds: Arc<Mutex<Vec<Bind>>>,
    /// Script currently being loaded; binds attribute to it.
    current: Arc<Mutex<Option<String>>>,
}

impl LuaEngine {
    pub fn new() -> AgentResult<LuaEngine> {
        let lua = Lua::new();
        let binds: Arc<Mutex<Vec<Bind>>> = Arc::new(Mutex::new(Vec::new()));
        let current: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

        {
            let binds = Arc::clone(&binds);
            let current = Arc::clone(&current);
            let bind_fn = lua
                .create_function(
                    move |lua, (kind, flags, mask, func): (String, String, String, Function)| {
                        let Some(kind) = parse_kind(&kind) else {
                            return Err(mlua::Error::RuntimeError(format!(
                                "unknown bind kind: {}",
                                kind
                            )));
                        };
                        let key = lua.create_registry_value(func)?;
                        let script = current.lock().clone().unwrap_or_default();
                        binds.lock().push(Bind {
                            script,
                            kind,
                            flags,
                            mask,
                            key,
                        });
                        Ok(())
                    },
                )
                .map_err(lua_err)?;
            lua.globals().set("bind", bind_fn).map_err(lua_err)?;
        }

        Ok(LuaEngine {
            vm: Mutex::new(VmState {
                lua,
                scripts: HashMap::new(),
            }),
            binds,
            current,
        })
    }

    /// Load script source under an explicit name (used by `load` and by
    /// tests that have no file on disk).
    pub fn load_source(&self, name: &str, source: &str, path: Option<PathBuf>) -> AgentResult<()> {
        // Replace an earlier incarnation first.
        self.drop_binds(name);
        *self.current.lock() = Some(name.to_string());
        let result = {
            let vm = self.vm.lock();
            vm.lua.load(source).set_name(name).exec()
        };
        *self.current.lock() = None;
        result.map_err(lua_err)?;

        let mut vm = self.vm.lock();
        vm.scripts
            .insert(name.to_string(), path.unwrap_or_default());
        debug!(script = %name, "script loaded");
        Ok(())
    }

    /// Lock order is always vm before binds; the `bind` global takes
    /// binds while the VM lock is held by `load_source`.
    fn drop_binds(&self, script: &str) {
        let vm = self.vm.lock();
        let removed: Vec<Bind> = {
            let mut binds = self.binds.lock();
            let (gone, keep): (Vec<Bind>, Vec<Bind>) =
                binds.drain(..).partition(|b| b.script == script);
            *binds = keep;
            gone
        };
        for bind in removed {
            let _ = vm.lua.remove_registry_value(bind.key);
        }
    }
}

fn lua_err(e: mlua::Error) -> AgentError {
    AgentError::Config(format!("script: {}", e))
}

fn script_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

/// Check bind flags against the matched access user. Empty flags bind
/// to everyone; otherwise every listed flag must be held (owner and
/// master pass implicitly via the flag cascade).
fn flags_satisfied(flags: &str, channel: &str, access: Option<&AccessUser>) -> bool {
    if flags.is_empty() {
        return true;
    }
    let Some(user) = access else { return false };
    let channel = (!channel.is_empty()).then_some(channel);
    flags.chars().all(|flag| user.has_flag(channel, flag))
}

impl ScriptEngine for LuaEngine {
    fn load(&self, path: &Path) -> AgentResult<String> {
        let source = std::fs::read_to_string(path)
            .map_err(|e| AgentError::Config(format!("read script {}: {}", path.display(), e)))?;
        let name = script_name(path);
        self.load_source(&name, &source, Some(path.to_path_buf()))?;
        Ok(name)
    }

    fn unload(&self, name: &str) -> AgentResult<()> {
        self.drop_binds(name);
        let mut vm = self.vm.lock();
        vm.scripts
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| AgentError::Config(format!("no such script: {}", name)))
    }

    fn reload(&self, name: &str) -> AgentResult<()> {
        let path = {
            let vm = self.vm.lock();
            vm.scripts
                .get(name)
                .cloned()
                .ok_or_else(|| AgentError::Config(format!("no such script: {}", name)))?
        };
        if path.as_os_str().is_empty() {
            return Err(AgentError::InvalidState(format!(
                "script {} was not loaded from a file",
                name
            )));
        }
        self.load(&path).map(|_| ())
    }

    fn loaded(&self) -> Vec<String> {
        self.vm.lock().scripts.keys().cloned().collect()
    }

    fn dispatch(&self, event: &ScriptEventData, access: Option<&AccessUser>) -> Vec<ScriptAction> {
        let actions: Arc<Mutex<Vec<ScriptAction>>> = Arc::new(Mutex::new(Vec::new()));

        let vm = self.vm.lock();
        // Resolve matching bind functions, then release the binds lock
        // before any Lua runs; a bind that calls `bind()` again must
        // not find it held.
        let matching: Vec<Function> = {
            let binds = self.binds.lock();
            binds
                .iter()
                .filter(|b| b.kind == event.kind)
                .filter(|b| flags_satisfied(&b.flags, &event.channel, access))
                .filter(|b| {
                    b.mask.is_empty()
                        || WildMatch::new(&b.mask.to_lowercase())
                            .matches(&event.text.to_lowercase())
                        || WildMatch::new(&b.mask.to_lowercase())
                            .matches(&event.hostmask.to_lowercase())
                })
                .filter_map(|b| vm.lua.registry_value(&b.key).ok())
                .collect()
        };

        for func in matching {
            match build_context(&vm.lua, event, access, &actions) {
                Ok(ctx) => {
                    if let Err(e) = func.call::<()>(ctx) {
                        warn!(error = %e, "script bind failed");
                    }
                }
                Err(e) => warn!(error = %e, "script context construction failed"),
            }
        }
        drop(vm);

        let drained = actions.lock().drain(..).collect();
        drained
    }
}

fn build_context(
    lua: &Lua,
    event: &ScriptEventData,
    access: Option<&AccessUser>,
    actions: &Arc<Mutex<Vec<ScriptAction>>>,
) -> mlua::Result<Table> {
    let ctx = lua.create_table()?;
    ctx.set("server", event.server.clone())?;
    ctx.set("channel", event.channel.clone())?;
    ctx.set("nick", event.nick.clone())?;
    ctx.set("hostmask", event.hostmask.clone())?;
    ctx.set("text", event.text.clone())?;
    if let Some(user) = access {
        ctx.set("user", user.handle.clone())?;
        ctx.set("flags", user.global_flags.to_string())?;
    }

    let reply_target = if event.channel.is_empty() {
        event.nick.clone()
    } else {
        event.channel.clone()
    };

    macro_rules! push_action {
        ($name:literal, $builder:expr) => {{
            let actions = Arc::clone(actions);
            #[allow(clippy::redundant_closure_call)]
            ctx.set($name, lua.create_function(move |_, args| {
                actions.lock().push(($builder)(args));
                Ok(())
            })?)?;
        }};
    }

    {
        let target = reply_target.clone();
        push_action!("reply", |text: String| ScriptAction::Reply {
            target: target.clone(),
            text,
        });
    }
    {
        let target = reply_target.clone();
        push_action!("action", |text: String| ScriptAction::Action {
            target: target.clone(),
            text,
        });
    }
    {
        let nick = event.nick.clone();
        push_action!("notice", |text: String| ScriptAction::Notice {
            target: nick.clone(),
            text,
        });
    }
    push_action!("raw", |line: String| ScriptAction::Raw { line });
    push_action!("join", |(channel, key): (String, Option<String>)| {
        ScriptAction::Join { channel, key }
    });
    push_action!("part", |(channel, reason): (String, Option<String>)| {
        ScriptAction::Part { channel, reason }
    });
    push_action!(
        "kick",
        |(channel, nick, reason): (String, String, Option<String>)| ScriptAction::Kick {
            channel,
            nick,
            reason,
        }
    );
    push_action!("mode", |(channel, modes): (String, String)| {
        ScriptAction::Mode { channel, modes }
    });
    push_action!("log", |message: String| ScriptAction::Log { message });

    Ok(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(kind: TriggerEvent, channel: &str, nick: &str, text: &str) -> ScriptEventData {
        ScriptEventData {
            kind,
            server: "libera".to_string(),
            channel: channel.to_string(),
            nick: nick.to_string(),
            hostmask: format!("{}!u@h.example", nick),
            text: text.to_string(),
        }
    }

    fn owner() -> AccessUser {
        let mut user: AccessUser = serde_json::from_value(serde_json::json!({
            "handle": "boss",
            "hostmasks": ["*!*@h.example"],
            "createdAt": Utc::now(),
            "lastModified": Utc::now(),
        }))
        .unwrap();
        user.global_flags = "n".parse().unwrap();
        user
    }

    #[test]
    fn bind_and_reply() {
        let engine = LuaEngine::new().unwrap();
        engine
            .load_source(
                "greet",
                r#"bind("message", "", "!hello*", function(ctx)
                       ctx.reply("hi " .. ctx.nick)
                   end)"#,
                None,
            )
            .unwrap();

        let actions = engine.dispatch(
            &event(TriggerEvent::Message, "#rust", "alice", "!hello there"),
            None,
        );
        assert_eq!(
            actions,
            vec![ScriptAction::Reply {
                target: "#rust".to_string(),
                text: "hi alice".to_string(),
            }]
        );

        // Non-matching mask produces nothing.
        assert!(engine
            .dispatch(&event(TriggerEvent::Message, "#rust", "alice", "bye"), None)
            .is_empty());
    }

    #[test]
    fn flag_gated_bind_requires_access() {
        let engine = LuaEngine::new().unwrap();
        engine
            .load_source(
                "admin",
                r#"bind("message", "o", "!op*", function(ctx)
                       ctx.mode(ctx.channel, "+o " .. ctx.nick)
                   end)"#,
                None,
            )
            .unwrap();

        let ev = event(TriggerEvent::Message, "#rust", "alice", "!op me");
        assert!(engine.dispatch(&ev, None).is_empty());

        let boss = owner();
        let actions = engine.dispatch(&ev, Some(&boss));
        assert_eq!(
            actions,
            vec![ScriptAction::Mode {
                channel: "#rust".to_string(),
                modes: "+o alice".to_string(),
            }]
        );
    }

    #[test]
    fn multiple_actions_and_kinds() {
        let engine = LuaEngine::new().unwrap();
        engine
            .load_source(
                "welcome",
                r#"bind("join", "", "", function(ctx)
                       ctx.notice("welcome to " .. ctx.channel)
                       ctx.log("greeted " .. ctx.nick)
                   end)"#,
                None,
            )
            .unwrap();

        let actions = engine.dispatch(&event(TriggerEvent::Join, "#rust", "bob", ""), None);
        assert_eq!(actions.len(), 2);
        assert_eq!(
            actions[0],
            ScriptAction::Notice {
                target: "bob".to_string(),
                text: "welcome to #rust".to_string(),
            }
        );
    }

    #[test]
    fn unload_drops_binds() {
        let engine = LuaEngine::new().unwrap();
        engine
            .load_source(
                "temp",
                r#"bind("message", "", "", function(ctx) ctx.reply("x") end)"#,
                None,
            )
            .unwrap();
        assert_eq!(engine.loaded(), vec!["temp".to_string()]);

        engine.unload("temp").unwrap();
        assert!(engine.loaded().is_empty());
        assert!(engine
            .dispatch(&event(TriggerEvent::Message, "#c", "n", "anything"), None)
            .is_empty());
        assert!(engine.unload("temp").is_err());
    }

    #[test]
    fn load_from_file_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counter.lua");
        std::fs::write(
            &path,
            r#"bind("message", "", "ping", function(ctx) ctx.reply("pong") end)"#,
        )
        .unwrap();

        let engine = LuaEngine::new().unwrap();
        let name = engine.load(&path).unwrap();
        assert_eq!(name, "counter");

        // New source takes over on reload.
        std::fs::write(
            &path,
            r#"bind("message", "", "ping", function(ctx) ctx.reply("pong v2") end)"#,
        )
        .unwrap();
        engine.reload("counter").unwrap();
        let actions = engine.dispatch(&event(TriggerEvent::Message, "#c", "n", "ping"), None);
        assert_eq!(
            actions,
            vec![ScriptAction::Reply {
                target: "#c".to_string(),
                text: "pong v2".to_string(),
            }]
        );
        assert_eq!(actions.len(), 1);
    }

    #[test]
    fn broken_script_is_rejected() {
        let engine = LuaEngine::new().unwrap();
        let err = engine
            .load_source("bad", "this is not lua at all (", None)
            .unwrap_err();
        assert_eq!(err.error_code(), "config");

        let err = engine
            .load_source("badbind", r#"bind("nonsense", "", "", function() end)"#, None)
            .unwrap_err();
        assert_eq!(err.error_code(), "config");
    }
}
