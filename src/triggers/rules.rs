//! Trigger rules: definition, loading, matching.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};
use wildmatch::WildMatch;

use super::expand::{expand, ExpandContext};
use crate::events::{Event, EventKind};

/// Event kinds a trigger can listen on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerEvent {
    Message,
    Privmsg,
    Join,
    Part,
    Quit,
    Nick,
    Topic,
    Kick,
    Notice,
    Ctcp,
    Invite,
    Mode,
    /// Operator input injected via the control plane or `command` actions.
    Input,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    #[default]
    Contains,
    Exact,
    StartsWith,
    EndsWith,
    Regex,
    Wildcard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerAction {
    Reply,
    Say,
    Action,
    Notice,
    Raw,
    Join,
    Part,
    Kick,
    Ban,
    Print,
    Log,
    Sound,
    Notify,
    Command,
}

/// One declarative rule.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    pub on: TriggerEvent,
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub nick: Option<String>,
    #[serde(default, rename = "match")]
    pub match_text: Option<String>,
    #[serde(default)]
    pub match_type: MatchType,
    pub action: TriggerAction,
    /// Expansion template; `message` accepted as an alias.
    #[serde(default, alias = "message")]
    pub text: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub cancel: bool,
    /// Milliseconds to wait before performing the action.
    #[serde(default)]
    pub delay: u64,
}

/// A matched trigger, expanded and ready to perform.
#[derive(Debug, Clone)]
pub struct PlannedAction {
    pub action: TriggerAction,
    pub server_id: String,
    pub target: String,
    pub text: String,
    pub key: Option<String>,
    pub delay: Duration,
    pub cancel: bool,
}

/// Literal (case-insensitive) or glob filter.
fn filter_matches(filter: &Option<String>, value: &str) -> bool {
    match filter {
        None => true,
        Some(pattern) => {
            if pattern.contains('*') || pattern.contains('?') {
                WildMatch::new(&pattern.to_lowercase()).matches(&value.to_lowercase())
            } else {
                pattern.eq_ignore_ascii_case(value)
            }
        }
    }
}

/// The view of an event the matcher works on.
struct EventView {
    kind: TriggerEvent,
    channel: String,
    nick: String,
    text: String,
    extra: HashMap<&'static str, String>,
}

fn view(event: &Event) -> Option<EventView> {
    let v = match &event.kind {
        EventKind::ChannelMessage {
            channel,
            nick,
            text,
            ..
        } => EventView {
            kind: TriggerEvent::Message,
            channel: channel.clone(),
            nick: nick.clone(),
            text: text.clone(),
            extra: HashMap::new(),
        },
        EventKind::PrivateMessage { nick, text, .. } => EventView {
            kind: TriggerEvent::Privmsg,
            channel: String::new(),
            nick: nick.clone(),
            text: text.clone(),
            extra: HashMap::new(),
        },
        EventKind::Notice {
            target, nick, text, ..
        } => EventView {
            kind: TriggerEvent::Notice,
            channel: target.clone(),
            nick: nick.clone(),
            text: text.clone(),
            extra: HashMap::new(),
        },
        EventKind::Ctcp {
            target,
            nick,
            command,
            args,
            ..
        } => EventView {
            kind: TriggerEvent::Ctcp,
            channel: target.clone(),
            nick: nick.clone(),
            text: format!("{} {}", command, args).trim_end().to_string(),
            extra: HashMap::new(),
        },
        EventKind::UserJoined { channel, nick, .. } => EventView {
            kind: TriggerEvent::Join,
            channel: channel.clone(),
            nick: nick.clone(),
            text: String::new(),
            extra: HashMap::new(),
        },
        EventKind::UserParted {
            channel,
            nick,
            reason,
            ..
        } => EventView {
            kind: TriggerEvent::Part,
            channel: channel.clone(),
            nick: nick.clone(),
            text: reason.clone().unwrap_or_default(),
            extra: HashMap::from([("reason", reason.clone().unwrap_or_default())]),
        },
        EventKind::UserQuit { nick, reason, .. } => EventView {
            kind: TriggerEvent::Quit,
            channel: String::new(),
            nick: nick.clone(),
            text: reason.clone().unwrap_or_default(),
            extra: HashMap::from([("reason", reason.clone().unwrap_or_default())]),
        },
        EventKind::NickChanged {
            old_nick, new_nick, ..
        } => EventView {
            kind: TriggerEvent::Nick,
            channel: String::new(),
            nick: old_nick.clone(),
            text: String::new(),
            extra: HashMap::from([
                ("oldnick", old_nick.clone()),
                ("newnick", new_nick.clone()),
            ]),
        },
        EventKind::TopicChanged {
            channel,
            setter,
            topic,
        } => EventView {
            kind: TriggerEvent::Topic,
            channel: channel.clone(),
            nick: setter.clone(),
            text: topic.clone(),
            extra: HashMap::from([("topic", topic.clone())]),
        },
        EventKind::UserKicked {
            channel,
            kicker,
            kicked,
            reason,
            ..
        } => EventView {
            kind: TriggerEvent::Kick,
            channel: channel.clone(),
            nick: kicker.clone(),
            text: reason.clone().unwrap_or_default(),
            extra: HashMap::from([
                ("kicker", kicker.clone()),
                ("kicked", kicked.clone()),
                ("reason", reason.clone().unwrap_or_default()),
            ]),
        },
        EventKind::Invited { channel, nick, .. } => EventView {
            kind: TriggerEvent::Invite,
            channel: channel.clone(),
            nick: nick.clone(),
            text: String::new(),
            extra: HashMap::new(),
        },
        EventKind::ModeChanged {
            target,
            setter,
            changes,
            ..
        } => EventView {
            kind: TriggerEvent::Mode,
            channel: target.clone(),
            nick: setter.clone(),
            text: changes
                .iter()
                .map(|c| {
                    format!(
                        "{}{}{}",
                        if c.add { '+' } else { '-' },
                        c.mode,
                        c.arg.as_deref().map(|a| format!(" {}", a)).unwrap_or_default()
                    )
                })
                .collect::<Vec<_>>()
                .join(" "),
            extra: HashMap::new(),
        },
        _ => return None,
    };
    Some(v)
}

/// Outcome of matching one trigger against one event.
enum TextMatch {
    No,
    Yes { args: String },
}

fn match_text(trigger: &Trigger, text: &str) -> TextMatch {
    let Some(pattern) = &trigger.match_text else {
        return TextMatch::Yes {
            args: text.to_string(),
        };
    };

    // Command-style: `!cmd` / `.cmd` match the first token exactly,
    // args are the remainder.
    if pattern.starts_with('!') || pattern.starts_with('.') {
        let mut tokens = text.splitn(2, ' ');
        let first = tokens.next().unwrap_or_default();
        if first.eq_ignore_ascii_case(pattern) {
            return TextMatch::Yes {
                args: tokens.next().unwrap_or_default().to_string(),
            };
        }
        return TextMatch::No;
    }

    let haystack = text.to_lowercase();
    let needle = pattern.to_lowercase();
    let hit = match trigger.match_type {
        MatchType::Contains => haystack.contains(&needle),
        MatchType::Exact => haystack == needle,
        MatchType::StartsWith => haystack.starts_with(&needle),
        MatchType::EndsWith => haystack.ends_with(&needle),
        MatchType::Wildcard => WildMatch::new(&needle).matches(&haystack),
        MatchType::Regex => match regex::Regex::new(pattern) {
            Ok(re) => re.is_match(text),
            Err(e) => {
                warn!(pattern = %pattern, error = %e, "invalid trigger regex");
                false
            }
        },
    };
    if hit {
        TextMatch::Yes {
            args: text.to_string(),
        }
    } else {
        TextMatch::No
    }
}

/// The ordered rule set, merged from all loaded files.
#[derive(Debug, Default)]
pub struct TriggerEngine {
    triggers: Vec<Trigger>,
}

impl TriggerEngine {
    pub fn new(triggers: Vec<Trigger>) -> TriggerEngine {
        TriggerEngine { triggers }
    }

    /// Load every `*.json` file under `dir`, merged in path sort order.
    /// Files that fail to parse are skipped with a warning.
    pub fn load_dir(dir: &Path) -> TriggerEngine {
        let mut triggers = Vec::new();
        let pattern = dir.join("*.json");
        let paths = match glob::glob(&pattern.to_string_lossy()) {
            Ok(paths) => paths,
            Err(e) => {
                warn!(error = %e, "bad trigger glob pattern");
                return TriggerEngine::default();
            }
        };
        let mut files: Vec<_> = paths.filter_map(Result::ok).collect();
        files.sort();
        for file in files {
            match std::fs::read_to_string(&file) {
                Ok(raw) => match serde_json::from_str::<Vec<Trigger>>(&raw) {
                    Ok(mut file_triggers) => {
                        debug!(file = %file.display(), count = file_triggers.len(), "loaded triggers");
                        triggers.append(&mut file_triggers);
                    }
                    Err(e) => warn!(file = %file.display(), error = %e, "skipping bad trigger file"),
                },
                Err(e) => warn!(file = %file.display(), error = %e, "cannot read trigger file"),
            }
        }
        TriggerEngine { triggers }
    }

    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }

    /// Evaluate an event against the rules in declared order. Stops
    /// after the first matching trigger with `cancel`.
    ///
    /// `me` is the agent's nick on the originating server.
    pub fn evaluate(&self, event: &Event, me: &str) -> (Vec<PlannedAction>, bool) {
        let Some(view) = view(event) else {
            return (Vec::new(), false);
        };
        self.evaluate_view(event, &view, me)
    }

    /// Evaluate operator input (the `input` trigger kind).
    pub fn evaluate_input(&self, server_id: &str, line: &str, me: &str) -> (Vec<PlannedAction>, bool) {
        let event = Event {
            server_id: server_id.to_string(),
            batch: None,
            kind: EventKind::RawMessageReceived {
                line: line.to_string(),
            },
        };
        let view = EventView {
            kind: TriggerEvent::Input,
            channel: String::new(),
            nick: me.to_string(),
            text: line.to_string(),
            extra: HashMap::new(),
        };
        self.evaluate_view(&event, &view, me)
    }

    fn evaluate_view(
        &self,
        event: &Event,
        view: &EventView,
        me: &str,
    ) -> (Vec<PlannedAction>, bool) {
        let mut planned = Vec::new();
        let mut cancelled = false;

        for trigger in &self.triggers {
            if trigger.on != view.kind {
                continue;
            }
            if !filter_matches(&trigger.server, &event.server_id)
                || !filter_matches(&trigger.channel, &view.channel)
                || !filter_matches(&trigger.nick, &view.nick)
            {
                continue;
            }
            let args = match match_text(trigger, &view.text) {
                TextMatch::No => continue,
                TextMatch::Yes { args } => args,
            };

            let ctx = ExpandContext {
                server: event.server_id.clone(),
                nick: view.nick.clone(),
                channel: view.channel.clone(),
                text: view.text.clone(),
                me: me.to_string(),
                args,
                extra: view.extra.clone(),
            };

            let target = match &trigger.target {
                Some(t) => expand(t, &ctx),
                None if !view.channel.is_empty() => view.channel.clone(),
                None => view.nick.clone(),
            };
            let text = trigger
                .text
                .as_deref()
                .map(|t| expand(t, &ctx))
                .unwrap_or_default();

            planned.push(PlannedAction {
                action: trigger.action,
                server_id: event.server_id.clone(),
                target,
                text,
                key: trigger.key.clone(),
                delay: Duration::from_millis(trigger.delay),
                cancel: trigger.cancel,
            });

            if trigger.cancel {
                cancelled = true;
                break;
            }
        }
        (planned, cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message_event(channel: &str, nick: &str, text: &str) -> Event {
        Event {
            server_id: "libera".to_string(),
            batch: None,
            kind: EventKind::ChannelMessage {
                channel: channel.to_string(),
                nick: nick.to_string(),
                hostmask: format!("{}!u@h", nick),
                text: text.to_string(),
                action: false,
            },
        }
    }

    fn engine(json: &str) -> TriggerEngine {
        TriggerEngine::new(serde_json::from_str(json).unwrap())
    }

    #[test]
    fn command_trigger_extracts_args() {
        let engine = engine(
            r#"[{"on":"message","match":"!echo","action":"reply","text":"{nick}: {args}"}]"#,
        );
        let (actions, cancelled) =
            engine.evaluate(&message_event("#rust", "alice", "!echo hello world"), "munin");
        assert!(!cancelled);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].target, "#rust");
        assert_eq!(actions[0].text, "alice: hello world");

        let (actions, _) =
            engine.evaluate(&message_event("#rust", "alice", "!echoes nope"), "munin");
        assert!(actions.is_empty());
    }

    #[test]
    fn filters_restrict_scope() {
        let engine = engine(
            r##"[{"on":"message","server":"libera","channel":"#ru*","nick":"alice","action":"say","text":"hi"}]"##,
        );
        let (actions, _) = engine.evaluate(&message_event("#rust", "alice", "x"), "munin");
        assert_eq!(actions.len(), 1);
        let (actions, _) = engine.evaluate(&message_event("#python", "alice", "x"), "munin");
        assert!(actions.is_empty());
        let (actions, _) = engine.evaluate(&message_event("#rust", "bob", "x"), "munin");
        assert!(actions.is_empty());
    }

    #[test]
    fn match_types() {
        let cases = [
            ("contains", "lo wor", "hello world", true),
            ("exact", "hello world", "hello world", true),
            ("exact", "hello", "hello world", false),
            ("starts_with", "hello", "hello world", true),
            ("ends_with", "world", "hello world", true),
            ("wildcard", "he*ld", "hello world", true),
            ("regex", "^h.llo", "hello world", true),
            ("regex", "^world", "hello world", false),
        ];
        for (match_type, pattern, text, expect) in cases {
            let engine = engine(&format!(
                r#"[{{"on":"message","match":"{}","matchType":"{}","action":"say","text":"x"}}]"#,
                pattern, match_type
            ));
            let (actions, _) = engine.evaluate(&message_event("#c", "n", text), "munin");
            assert_eq!(actions.len() == 1, expect, "{} {}", match_type, pattern);
        }
    }

    #[test]
    fn cancel_stops_evaluation() {
        let engine = engine(
            r#"[
                {"on":"message","match":"spam","action":"say","text":"first","cancel":true},
                {"on":"message","match":"spam","action":"say","text":"second"}
            ]"#,
        );
        let (actions, cancelled) =
            engine.evaluate(&message_event("#c", "n", "spam here"), "munin");
        assert!(cancelled);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].text, "first");
    }

    #[test]
    fn private_message_targets_sender() {
        let engine = engine(r#"[{"on":"privmsg","action":"reply","text":"hi {nick}"}]"#);
        let event = Event {
            server_id: "libera".to_string(),
            batch: None,
            kind: EventKind::PrivateMessage {
                nick: "alice".to_string(),
                hostmask: "alice!u@h".to_string(),
                text: "hello".to_string(),
                action: false,
            },
        };
        let (actions, _) = engine.evaluate(&event, "munin");
        assert_eq!(actions[0].target, "alice");
        assert_eq!(actions[0].text, "hi alice");
    }

    #[test]
    fn kick_event_extras() {
        let engine = engine(
            r#"[{"on":"kick","action":"say","text":"{kicker} kicked {kicked}: {reason}"}]"#,
        );
        let event = Event {
            server_id: "libera".to_string(),
            batch: None,
            kind: EventKind::UserKicked {
                channel: "#rust".to_string(),
                kicker: "op".to_string(),
                kicker_hostmask: "op!o@h".to_string(),
                kicked: "troll".to_string(),
                reason: Some("flood".to_string()),
            },
        };
        let (actions, _) = engine.evaluate(&event, "munin");
        assert_eq!(actions[0].text, "op kicked troll: flood");
    }

    #[test]
    fn delay_carried_through() {
        let engine =
            engine(r#"[{"on":"join","action":"say","text":"welcome","delay":1500}]"#);
        let event = Event {
            server_id: "s".to_string(),
            batch: None,
            kind: EventKind::UserJoined {
                channel: "#c".to_string(),
                nick: "n".to_string(),
                hostmask: "n!u@h".to_string(),
                account: None,
            },
        };
        let (actions, _) = engine.evaluate(&event, "munin");
        assert_eq!(actions[0].delay, Duration::from_millis(1500));
    }

    #[test]
    fn files_merge_in_path_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("20-second.json"),
            r#"[{"on":"message","action":"say","text":"second"}]"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("10-first.json"),
            r#"[{"on":"message","action":"say","text":"first"}]"#,
        )
        .unwrap();
        let engine = TriggerEngine::load_dir(dir.path());
        assert_eq!(engine.len(), 2);
        let (actions, _) = engine.evaluate(&message_event("#c", "n", "x"), "munin");
        assert_eq!(actions[0].text, "first");
        assert_eq!(actions[1].text, "second");
    }
}
