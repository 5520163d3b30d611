//! Channel protection.
//!
//! Sliding-window observation of channel behavior with configured
//! reactions: message floods, repeats, caps, mass-join/part and
//! forbidden patterns. Reactions escalate to kick or kickban with a
//! derived ban mask; timed bans are lifted when they expire.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use wildmatch::WildMatch;

use crate::config::{BanMaskStyle, ProtectionRule, ProtectionScope, PunishAction};
use crate::events::{Event, EventKind};

/// Behavior class a rule watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchKind {
    MessageFlood,
    Repeat,
    Caps,
    JoinFlood,
    PartFlood,
    Pattern,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ObservedKind {
    Message,
    Join,
    Part,
}

#[derive(Debug, Clone)]
struct LogEntry {
    at: Instant,
    nick: String,
    hostmask: String,
    kind: ObservedKind,
    text: String,
}

/// A reaction the agent should carry out on IRC.
#[derive(Debug, Clone)]
pub struct Reaction {
    pub server_id: String,
    pub channel: String,
    pub nick: String,
    pub action: PunishAction,
    pub rule_kind: WatchKind,
    /// Present for kickban.
    pub ban_mask: Option<String>,
    pub ban_ttl: Option<Duration>,
}

/// A timed ban we placed and must lift ourselves.
#[derive(Debug, Clone)]
pub struct TimedBan {
    pub server_id: String,
    pub channel: String,
    pub mask: String,
    expires_at: Instant,
}

/// Derive a ban mask from `nick!user@host`.
pub fn derive_ban_mask(style: BanMaskStyle, hostmask: &str) -> String {
    let (nick, rest) = hostmask.split_once('!').unwrap_or((hostmask, "*@*"));
    let (user, host) = rest.split_once('@').unwrap_or((rest, "*"));
    match style {
        BanMaskStyle::Host => format!("*!*@{}", host),
        BanMaskStyle::Nick => format!("{}!*@*", nick),
        BanMaskStyle::User => format!("*!{}@*", user),
        BanMaskStyle::Full => format!("{}!{}@{}", nick, user, host),
    }
}

/// True for shouting: mostly uppercase letters, long enough to matter.
fn is_caps(text: &str) -> bool {
    let letters: Vec<char> = text.chars().filter(|c| c.is_alphabetic()).collect();
    if letters.len() < 8 {
        return false;
    }
    let upper = letters.iter().filter(|c| c.is_uppercase()).count();
    upper * 100 / letters.len() >= 80
}

pub struct ProtectionEngine {
    rules: Vec<ProtectionRule>,
    /// Sliding windows keyed by (server, channel-lowercase).
    windows: Mutex<HashMap<(String, String), VecDeque<LogEntry>>>,
    bans: Mutex<Vec<TimedBan>>,
}

impl ProtectionEngine {
    pub fn new(rules: Vec<ProtectionRule>) -> ProtectionEngine {
        ProtectionEngine {
            rules,
            windows: Mutex::new(HashMap::new()),
            bans: Mutex::new(Vec::new()),
        }
    }

    fn rule_applies(rule: &ProtectionRule, server_id: &str, channel: &str) -> bool {
        if let Some(server) = &rule.server {
            if !server.eq_ignore_ascii_case(server_id) {
                return false;
            }
        }
        if let Some(pattern) = &rule.channel {
            if !WildMatch::new(&pattern.to_lowercase()).matches(&channel.to_lowercase()) {
                return false;
            }
        }
        true
    }

    /// Feed one event; returns reactions to carry out.
    pub fn observe(&self, event: &Event) -> Vec<Reaction> {
        self.observe_at(event, Instant::now())
    }

    fn observe_at(&self, event: &Event, now: Instant) -> Vec<Reaction> {
        let (channel, nick, hostmask, kind, text) = match &event.kind {
            EventKind::ChannelMessage {
                channel,
                nick,
                hostmask,
                text,
                ..
            } => (channel, nick, hostmask, ObservedKind::Message, text.clone()),
            EventKind::UserJoined {
                channel,
                nick,
                hostmask,
                ..
            } => (channel, nick, hostmask, ObservedKind::Join, String::new()),
            EventKind::UserParted {
                channel,
                nick,
                hostmask,
                ..
            } => (channel, nick, hostmask, ObservedKind::Part, String::new()),
            _ => return Vec::new(),
        };

        let key = (event.server_id.clone(), channel.to_lowercase());
        let max_window = self
            .rules
            .iter()
            .map(|r| r.window_seconds)
            .max()
            .unwrap_or(0);
        let mut windows = self.windows.lock();
        let log = windows.entry(key).or_default();
        log.push_back(LogEntry {
            at: now,
            nick: nick.clone(),
            hostmask: hostmask.clone(),
            kind,
            text,
        });
        while log
            .front()
            .is_some_and(|e| now.duration_since(e.at).as_secs() > max_window)
        {
            log.pop_front();
        }

        let mut reactions = Vec::new();
        for rule in &self.rules {
            if !Self::rule_applies(rule, &event.server_id, channel) {
                continue;
            }
            if let Some(reaction) =
                self.check_rule(rule, log, &event.server_id, channel, nick, hostmask, now)
            {
                // One strike resets the window so a single burst is
                // punished once.
                log.retain(|e| match rule.scope {
                    ProtectionScope::PerNick => !e.nick.eq_ignore_ascii_case(nick),
                    ProtectionScope::PerChannel => false,
                });
                if let (PunishAction::Kickban, Some(ttl)) = (rule.action, rule.ban_ttl_seconds) {
                    if let Some(mask) = &reaction.ban_mask {
                        self.bans.lock().push(TimedBan {
                            server_id: event.server_id.clone(),
                            channel: channel.clone(),
                            mask: mask.clone(),
                            expires_at: now + Duration::from_secs(ttl),
                        });
                    }
                }
                reactions.push(reaction);
            }
        }
        reactions
    }

    #[allow(clippy::too_many_arguments)]
    fn check_rule(
        &self,
        rule: &ProtectionRule,
        log: &VecDeque<LogEntry>,
        server_id: &str,
        channel: &str,
        nick: &str,
        hostmask: &str,
        now: Instant,
    ) -> Option<Reaction> {
        let window = Duration::from_secs(rule.window_seconds);
        let in_window = || {
            log.iter().filter(move |e| {
                now.duration_since(e.at) <= window
                    && match rule.scope {
                        ProtectionScope::PerNick => e.nick.eq_ignore_ascii_case(nick),
                        ProtectionScope::PerChannel => true,
                    }
            })
        };

        let latest_text = log.back().map(|e| e.text.as_str()).unwrap_or_default();
        let tripped = match rule.kind {
            WatchKind::MessageFlood => {
                in_window()
                    .filter(|e| e.kind == ObservedKind::Message)
                    .count() as u32
                    >= rule.threshold
            }
            WatchKind::Repeat => {
                let latest = latest_text.to_lowercase();
                !latest.is_empty()
                    && in_window()
                        .filter(|e| {
                            e.kind == ObservedKind::Message && e.text.to_lowercase() == latest
                        })
                        .count() as u32
                        >= rule.threshold
            }
            WatchKind::Caps => {
                in_window()
                    .filter(|e| e.kind == ObservedKind::Message && is_caps(&e.text))
                    .count() as u32
                    >= rule.threshold
            }
            WatchKind::JoinFlood => {
                in_window().filter(|e| e.kind == ObservedKind::Join).count() as u32
                    >= rule.threshold
            }
            WatchKind::PartFlood => {
                in_window().filter(|e| e.kind == ObservedKind::Part).count() as u32
                    >= rule.threshold
            }
            WatchKind::Pattern => match &rule.pattern {
                Some(pattern) => {
                    !latest_text.is_empty()
                        && WildMatch::new(&pattern.to_lowercase())
                            .matches(&latest_text.to_lowercase())
                }
                None => false,
            },
        };
        if !tripped {
            return None;
        }

        debug!(
            server = %server_id,
            channel = %channel,
            nick = %nick,
            kind = ?rule.kind,
            action = ?rule.action,
            "protection rule tripped"
        );
        let ban_mask = matches!(rule.action, PunishAction::Kickban)
            .then(|| derive_ban_mask(rule.ban_mask, hostmask));
        Some(Reaction {
            server_id: server_id.to_string(),
            channel: channel.to_string(),
            nick: nick.to_string(),
            action: rule.action,
            rule_kind: rule.kind,
            ban_mask,
            ban_ttl: rule.ban_ttl_seconds.map(Duration::from_secs),
        })
    }

    /// Remove and return bans whose TTL has elapsed.
    pub fn take_expired_bans(&self) -> Vec<TimedBan> {
        self.take_expired_bans_at(Instant::now())
    }

    fn take_expired_bans_at(&self, now: Instant) -> Vec<TimedBan> {
        let mut bans = self.bans.lock();
        let (expired, live): (Vec<TimedBan>, Vec<TimedBan>) =
            bans.drain(..).partition(|b| b.expires_at <= now);
        *bans = live;
        expired
    }

    pub fn pending_ban_count(&self) -> usize {
        self.bans.lock().len()
    }
}
