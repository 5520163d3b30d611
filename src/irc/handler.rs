//! Inbound message handling.
//!
//! Translates parsed messages into room/user model updates and semantic
//! events. Mutation happens under the session write guard held by the
//! reader task; events are returned for publication after the guard is
//! released.

use std::collections::HashMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use munin_proto::{numeric, Command, Message, ModeChange};
use tracing::debug;

use crate::events::{EventKind, WhoisInfo};
use crate::irc::channel::{Channel, ChannelUser, Topic};
use crate::irc::queue::OutboundCommand;
use crate::irc::state::SessionState;

/// What one inbound message produced.
#[derive(Debug, Default)]
pub struct HandlerOutput {
    pub events: Vec<EventKind>,
    pub replies: Vec<OutboundCommand>,
}

impl HandlerOutput {
    fn event(&mut self, kind: EventKind) {
        self.events.push(kind);
    }
}

/// CTCP delimiter.
const CTCP_MARKER: char = '\u{1}';

fn split_ctcp(text: &str) -> Option<(&str, &str)> {
    let inner = text.strip_prefix(CTCP_MARKER)?;
    let inner = inner.strip_suffix(CTCP_MARKER).unwrap_or(inner);
    Some(match inner.split_once(' ') {
        Some((cmd, args)) => (cmd, args),
        None => (inner, ""),
    })
}

fn source(msg: &Message) -> (String, String) {
    match &msg.prefix {
        Some(prefix) => (
            prefix.nick().unwrap_or_default().to_string(),
            prefix.hostmask(),
        ),
        None => (String::new(), String::new()),
    }
}

/// Apply one message to the session. `now` drives latency bookkeeping.
pub fn handle(state: &mut SessionState, msg: &Message, now: Instant) -> HandlerOutput {
    let mut out = HandlerOutput::default();
    match &msg.command {
        Command::Ping(token, _) => {
            // HIGH priority and bucket bypass, per keepalive contract.
            out.replies
                .push(OutboundCommand::bypass(Command::Pong(token.clone(), None).to_string()));
        }
        Command::Pong(a, b) => on_pong(state, a, b.as_deref(), now, &mut out),
        Command::Privmsg(target, text) => on_privmsg(state, msg, target, text, &mut out),
        Command::Notice(target, text) => {
            let (nick, hostmask) = source(msg);
            out.event(EventKind::Notice {
                target: target.clone(),
                nick,
                hostmask,
                text: text.clone(),
            });
        }
        Command::Join(channel, _) => on_join(state, msg, channel, &mut out),
        Command::Part(channel, reason) => on_part(state, msg, channel, reason.clone(), &mut out),
        Command::Kick {
            channel,
            nick,
            reason,
        } => on_kick(state, msg, channel, nick, reason.clone(), &mut out),
        Command::Quit(reason) => on_quit(state, msg, reason.clone(), &mut out),
        Command::Nick(new_nick) => on_nick(state, msg, new_nick, &mut out),
        Command::Mode(target, args) => on_mode(state, msg, target, args, &mut out),
        Command::Topic(channel, topic) => {
            let (nick, _) = source(msg);
            let text = topic.clone().unwrap_or_default();
            if let Some(chan) = state.channel_mut(channel) {
                chan.topic = Some(Topic {
                    text: text.clone(),
                    set_by: Some(nick.clone()),
                    set_at: Some(Utc::now()),
                });
            }
            out.event(EventKind::TopicChanged {
                channel: channel.clone(),
                setter: nick,
                topic: text,
            });
        }
        Command::Invite(_nick, channel) => {
            let (nick, hostmask) = source(msg);
            out.event(EventKind::Invited {
                channel: channel.clone(),
                nick,
                hostmask,
            });
        }
        Command::Away(reason) => {
            let (nick, _) = source(msg);
            let away = reason.is_some();
            let cm = state.casemap();
            for chan in state.channels.values_mut() {
                if let Some(user) = chan.user_mut(cm, &nick) {
                    user.away = away;
                }
            }
        }
        Command::Account(account) => {
            let (nick, _) = source(msg);
            let value = (account != "*").then(|| account.clone());
            let cm = state.casemap();
            for chan in state.channels.values_mut() {
                if let Some(user) = chan.user_mut(cm, &nick) {
                    user.account = value.clone();
                }
            }
        }
        Command::Chghost(new_user, new_host) => {
            let (nick, _) = source(msg);
            let cm = state.casemap();
            for chan in state.channels.values_mut() {
                if let Some(user) = chan.user_mut(cm, &nick) {
                    user.user = Some(new_user.clone());
                    user.host = Some(new_host.clone());
                }
            }
        }
        Command::Batch(reference, params) => on_batch(state, reference, params),
        Command::Response(code, params) => on_numeric(state, *code, params, &mut out),
        _ => {}
    }
    out
}

fn on_pong(
    state: &mut SessionState,
    a: &str,
    b: Option<&str>,
    now: Instant,
    out: &mut HandlerOutput,
) {
    let token = b.unwrap_or(a);
    if let Some(pos) = state.pending_pings.iter().position(|(c, _)| c == token) {
        let (_, sent_at) = state.pending_pings[pos];
        // Everything up to the answered probe is accounted for.
        state.pending_pings.drain(..=pos);
        let ms = now.saturating_duration_since(sent_at).as_millis() as u64;
        out.event(EventKind::LatencyUpdated { ms });
    }
}

fn on_privmsg(
    state: &mut SessionState,
    msg: &Message,
    target: &str,
    text: &str,
    out: &mut HandlerOutput,
) {
    let (nick, hostmask) = source(msg);
    let is_channel = state.isupport.is_channel_name(target);

    if let Some((ctcp_cmd, ctcp_args)) = split_ctcp(text) {
        if ctcp_cmd.eq_ignore_ascii_case("ACTION") {
            let text = ctcp_args.to_string();
            if is_channel {
                if let Some(chan) = state.channel_mut(target) {
                    chan.unread_messages += 1;
                }
                out.event(EventKind::ChannelMessage {
                    channel: target.to_string(),
                    nick,
                    hostmask,
                    text,
                    action: true,
                });
            } else {
                out.event(EventKind::PrivateMessage {
                    nick,
                    hostmask,
                    text,
                    action: true,
                });
            }
        } else {
            out.event(EventKind::Ctcp {
                target: target.to_string(),
                nick,
                hostmask,
                command: ctcp_cmd.to_ascii_uppercase(),
                args: ctcp_args.to_string(),
            });
        }
        return;
    }

    if is_channel {
        if let Some(chan) = state.channel_mut(target) {
            chan.unread_messages += 1;
        }
        out.event(EventKind::ChannelMessage {
            channel: target.to_string(),
            nick,
            hostmask,
            text: text.to_string(),
            action: false,
        });
    } else {
        out.event(EventKind::PrivateMessage {
            nick,
            hostmask,
            text: text.to_string(),
            action: false,
        });
    }
}

fn on_join(state: &mut SessionState, msg: &Message, channel: &str, out: &mut HandlerOutput) {
    let (nick, hostmask) = source(msg);
    // extended-join carries the account as the second parameter.
    let account = msg.account_tag().map(str::to_string);
    let cm = state.casemap();

    if state.is_self(&nick) {
        let key = cm.lower(channel);
        let chan = state
            .channels
            .entry(key)
            .or_insert_with(|| Channel::new(channel));
        chan.joined = true;
        out.event(EventKind::ChannelJoined {
            channel: channel.to_string(),
        });
        return;
    }

    if let Some(chan) = state.channel_mut(channel) {
        let mut user = ChannelUser::new(&nick);
        if let Some(prefix) = &msg.prefix {
            if let munin_proto::Prefix::Nickname { user: u, host, .. } = prefix {
                user.user = u.clone();
                user.host = host.clone();
            }
        }
        user.account = account.clone();
        chan.add_user(cm, user);
    }
    out.event(EventKind::UserJoined {
        channel: channel.to_string(),
        nick,
        hostmask,
        account,
    });
}

fn on_part(
    state: &mut SessionState,
    msg: &Message,
    channel: &str,
    reason: Option<String>,
    out: &mut HandlerOutput,
) {
    let (nick, hostmask) = source(msg);
    let cm = state.casemap();
    if state.is_self(&nick) {
        state.channels.remove(&cm.lower(channel));
        out.event(EventKind::ChannelParted {
            channel: channel.to_string(),
        });
        return;
    }
    if let Some(chan) = state.channel_mut(channel) {
        chan.remove_user(cm, &nick);
    }
    out.event(EventKind::UserParted {
        channel: channel.to_string(),
        nick,
        hostmask,
        reason,
    });
}

fn on_kick(
    state: &mut SessionState,
    msg: &Message,
    channel: &str,
    victim: &str,
    reason: Option<String>,
    out: &mut HandlerOutput,
) {
    let (kicker, kicker_hostmask) = source(msg);
    let cm = state.casemap();
    if state.is_self(victim) {
        state.channels.remove(&cm.lower(channel));
        out.event(EventKind::ChannelParted {
            channel: channel.to_string(),
        });
    } else if let Some(chan) = state.channel_mut(channel) {
        chan.remove_user(cm, victim);
    }
    out.event(EventKind::UserKicked {
        channel: channel.to_string(),
        kicker,
        kicker_hostmask,
        kicked: victim.to_string(),
        reason,
    });
}

fn on_quit(
    state: &mut SessionState,
    msg: &Message,
    reason: Option<String>,
    out: &mut HandlerOutput,
) {
    let (nick, hostmask) = source(msg);
    let cm = state.casemap();
    let mut affected = Vec::new();
    for chan in state.channels.values_mut() {
        if chan.remove_user(cm, &nick).is_some() {
            affected.push(chan.name.clone());
        }
    }
    out.event(EventKind::UserQuit {
        nick,
        hostmask,
        reason,
        channels: affected,
    });
}

fn on_nick(state: &mut SessionState, msg: &Message, new_nick: &str, out: &mut HandlerOutput) {
    let (old_nick, hostmask) = source(msg);
    let cm = state.casemap();
    if state.is_self(&old_nick) {
        state.nick = new_nick.to_string();
    }
    for chan in state.channels.values_mut() {
        chan.rename_user(cm, &old_nick, new_nick);
    }
    out.event(EventKind::NickChanged {
        old_nick,
        new_nick: new_nick.to_string(),
        hostmask,
    });
}

fn on_mode(
    state: &mut SessionState,
    msg: &Message,
    target: &str,
    args: &[String],
    out: &mut HandlerOutput,
) {
    if !state.isupport.is_channel_name(target) {
        // User-mode changes carry no channel state.
        return;
    }
    let (setter, setter_hostmask) = source(msg);
    let changes = ModeChange::parse(&state.isupport, args);
    let cm = state.casemap();

    // Borrow the dialect pieces before taking the channel mutably.
    let prefix_modes: Vec<char> = state.isupport.prefixes.iter().map(|p| p.mode).collect();
    let list_modes = state.isupport.chanmodes.list.clone();

    if let Some(chan) = state.channel_mut(target) {
        for change in &changes {
            if prefix_modes.contains(&change.mode) {
                if let Some(nick) = &change.arg {
                    if let Some(user) = chan.user_mut(cm, nick) {
                        if change.add {
                            user.modes.insert(change.mode);
                        } else {
                            user.modes.remove(&change.mode);
                        }
                    }
                }
            } else if list_modes.contains(change.mode) {
                // List modes (bans etc.) are tracked by the protection
                // engine, not the room model.
            } else if change.add {
                if change.mode == 'k' {
                    chan.key = change.arg.clone();
                }
                chan.modes.insert(change.mode, change.arg.clone());
            } else {
                if change.mode == 'k' {
                    chan.key = None;
                }
                chan.modes.remove(&change.mode);
            }
        }
    }

    out.event(EventKind::ModeChanged {
        target: target.to_string(),
        setter,
        setter_hostmask,
        changes,
    });
}

fn on_batch(state: &mut SessionState, reference: &str, params: &[String]) {
    if let Some(opened) = reference.strip_prefix('+') {
        let batch_type = params.first().cloned().unwrap_or_default();
        debug!(reference = %opened, batch_type = %batch_type, "batch opened");
        state.batches.insert(opened.to_string(), batch_type);
    } else if let Some(closed) = reference.strip_prefix('-') {
        state.batches.remove(closed);
    }
}

fn parse_topic_time(raw: &str) -> Option<DateTime<Utc>> {
    let secs: i64 = raw.parse().ok()?;
    DateTime::from_timestamp(secs, 0)
}

fn on_numeric(state: &mut SessionState, code: u16, params: &[String], out: &mut HandlerOutput) {
    match code {
        numeric::RPL_ISUPPORT => state.isupport.apply(params),
        numeric::RPL_TOPIC => {
            if let (Some(channel), Some(text)) = (params.get(1), params.get(2)) {
                if let Some(chan) = state.channel_mut(channel) {
                    chan.topic = Some(Topic {
                        text: text.clone(),
                        set_by: None,
                        set_at: None,
                    });
                }
            }
        }
        numeric::RPL_NOTOPIC => {
            if let Some(channel) = params.get(1) {
                if let Some(chan) = state.channel_mut(channel) {
                    chan.topic = None;
                }
            }
        }
        numeric::RPL_TOPICWHOTIME => {
            if let (Some(channel), Some(setter)) = (params.get(1), params.get(2)) {
                let set_at = params.get(3).and_then(|t| parse_topic_time(t));
                if let Some(chan) = state.channel_mut(channel) {
                    if let Some(topic) = &mut chan.topic {
                        topic.set_by = Some(setter.clone());
                        topic.set_at = set_at;
                    }
                }
            }
        }
        numeric::RPL_NAMREPLY => on_names(state, params),
        numeric::RPL_ENDOFNAMES => {
            if let Some(channel) = params.get(1) {
                if let Some(chan) = state.channel_mut(channel) {
                    if let Some(users) = chan.names_buffer.take() {
                        chan.replace_users(users);
                    }
                }
                out.event(EventKind::UserListUpdated {
                    channel: channel.clone(),
                });
            }
        }
        numeric::RPL_LIST => {
            if let Some(channel) = params.get(1) {
                out.event(EventKind::ChannelListEntry {
                    channel: channel.clone(),
                    user_count: params.get(2).and_then(|c| c.parse().ok()).unwrap_or(0),
                    topic: params.get(3).cloned().unwrap_or_default(),
                });
            }
        }
        numeric::RPL_LISTEND => out.event(EventKind::ChannelListComplete),
        numeric::RPL_WHOISUSER => {
            if let Some(nick) = params.get(1) {
                let cm = state.casemap();
                let info = state.whois.entry(cm.lower(nick)).or_default();
                info.nick = nick.clone();
                info.username = params.get(2).cloned();
                info.host = params.get(3).cloned();
                info.realname = params.get(5).cloned();
            }
        }
        numeric::RPL_WHOISSERVER => {
            if let Some(nick) = params.get(1) {
                let cm = state.casemap();
                let info = state.whois.entry(cm.lower(nick)).or_default();
                info.server = params.get(2).cloned();
            }
        }
        numeric::RPL_WHOISOPERATOR => {
            if let Some(nick) = params.get(1) {
                let cm = state.casemap();
                state.whois.entry(cm.lower(nick)).or_default().is_operator = true;
            }
        }
        numeric::RPL_WHOISCHANNELS => {
            if let (Some(nick), Some(chans)) = (params.get(1), params.get(2)) {
                let cm = state.casemap();
                let info = state.whois.entry(cm.lower(nick)).or_default();
                info.channels = chans.split(' ').map(str::to_string).collect();
            }
        }
        numeric::RPL_WHOISACCOUNT => {
            if let (Some(nick), Some(account)) = (params.get(1), params.get(2)) {
                let cm = state.casemap();
                let info = state.whois.entry(cm.lower(nick)).or_default();
                info.account = Some(account.clone());
            }
        }
        numeric::RPL_ENDOFWHOIS => {
            if let Some(nick) = params.get(1) {
                let cm = state.casemap();
                if let Some(info) = state.whois.remove(&cm.lower(nick)) {
                    out.event(EventKind::WhoisReceived { info });
                }
            }
        }
        _ => {}
    }
}

/// 353: `<me> =|*|@ <channel> :[sigils]nick [[sigils]nick ...]`
fn on_names(state: &mut SessionState, params: &[String]) {
    let (Some(channel), Some(names)) = (params.get(2), params.get(3)) else {
        return;
    };
    let cm = state.casemap();
    let isupport = state.isupport.clone();
    let Some(chan) = state.channel_mut(channel) else {
        return;
    };
    let buffer = chan.names_buffer.get_or_insert_with(HashMap::new);
    for name in names.split(' ').filter(|n| !n.is_empty()) {
        // multi-prefix: every held sigil, highest first.
        let mut modes = std::collections::BTreeSet::new();
        let mut rest = name;
        while let Some(c) = rest.chars().next() {
            match isupport.mode_for_sigil(c) {
                Some(mode) => {
                    modes.insert(mode);
                    rest = &rest[c.len_utf8()..];
                }
                None => break,
            }
        }
        // userhost-in-names sends nick!user@host.
        let (nick, user, host) = match munin_proto::Prefix::parse(rest) {
            Ok(munin_proto::Prefix::Nickname { nick, user, host }) => (nick, user, host),
            _ => (rest.to_string(), None, None),
        };
        let entry = ChannelUser {
            nick: nick.clone(),
            user,
            host,
            account: None,
            modes,
            away: false,
        };
        buffer.insert(cm.lower(&nick), entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irc::state::SessionState;

    fn state() -> SessionState {
        let mut s = SessionState::new("munin");
        // Pretend we joined #rust already.
        let mut chan = Channel::new("#rust");
        chan.joined = true;
        s.channels.insert("#rust".to_string(), chan);
        s
    }

    fn run(state: &mut SessionState, line: &str) -> HandlerOutput {
        handle(state, &line.parse().unwrap(), Instant::now())
    }

    #[test]
    fn ping_replies_with_bypass_pong() {
        let mut s = state();
        let out = run(&mut s, "PING :abc");
        assert_eq!(out.replies.len(), 1);
        assert_eq!(out.replies[0].line, "PONG :abc");
        assert!(out.replies[0].bypass);
    }

    #[test]
    fn channel_message_event() {
        let mut s = state();
        let out = run(&mut s, ":alice!a@h PRIVMSG #rust :hello world");
        assert!(matches!(
            &out.events[0],
            EventKind::ChannelMessage { channel, nick, text, action: false, .. }
                if channel == "#rust" && nick == "alice" && text == "hello world"
        ));
        assert_eq!(s.channel("#rust").unwrap().unread_messages, 1);
    }

    #[test]
    fn private_message_event() {
        let mut s = state();
        let out = run(&mut s, ":alice!a@h PRIVMSG munin :psst");
        assert!(matches!(
            &out.events[0],
            EventKind::PrivateMessage { nick, action: false, .. } if nick == "alice"
        ));
    }

    #[test]
    fn ctcp_action_is_action_message() {
        let mut s = state();
        let out = run(&mut s, ":alice!a@h PRIVMSG #rust :\u{1}ACTION waves\u{1}");
        assert!(matches!(
            &out.events[0],
            EventKind::ChannelMessage { text, action: true, .. } if text == "waves"
        ));
    }

    #[test]
    fn ctcp_version_event() {
        let mut s = state();
        let out = run(&mut s, ":alice!a@h PRIVMSG munin :\u{1}VERSION\u{1}");
        assert!(matches!(
            &out.events[0],
            EventKind::Ctcp { command, .. } if command == "VERSION"
        ));
    }

    #[test]
    fn self_join_creates_channel() {
        let mut s = state();
        let out = run(&mut s, ":munin!m@h JOIN #new");
        assert!(s.channel("#new").unwrap().joined);
        assert!(matches!(
            &out.events[0],
            EventKind::ChannelJoined { channel } if channel == "#new"
        ));
    }

    #[test]
    fn other_join_adds_member() {
        let mut s = state();
        run(&mut s, ":bob!b@h JOIN #rust");
        let chan = s.channel("#rust").unwrap();
        let user = chan.user(CaseMapping::Rfc1459, "bob").unwrap();
        assert_eq!(user.user.as_deref(), Some("b"));
        assert_eq!(user.host.as_deref(), Some("h"));
    }

    use munin_proto::CaseMapping;

    #[test]
    fn quit_removes_from_all_channels() {
        let mut s = state();
        let mut other = Channel::new("#other");
        other.joined = true;
        s.channels.insert("#other".to_string(), other);
        run(&mut s, ":bob!b@h JOIN #rust");
        run(&mut s, ":bob!b@h JOIN #other");

        let out = run(&mut s, ":bob!b@h QUIT :gone");
        match &out.events[0] {
            EventKind::UserQuit { channels, .. } => {
                let mut channels = channels.clone();
                channels.sort();
                assert_eq!(channels, vec!["#other", "#rust"]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!s.channel("#rust").unwrap().contains(CaseMapping::Rfc1459, "bob"));
    }

    #[test]
    fn kick_of_self_drops_channel() {
        let mut s = state();
        let out = run(&mut s, ":op!o@h KICK #rust munin :bye");
        assert!(s.channel("#rust").is_none());
        assert!(out
            .events
            .iter()
            .any(|e| matches!(e, EventKind::ChannelParted { .. })));
        assert!(out
            .events
            .iter()
            .any(|e| matches!(e, EventKind::UserKicked { kicked, .. } if kicked == "munin")));
    }

    #[test]
    fn nick_rename_updates_self_and_members() {
        let mut s = state();
        run(&mut s, ":bob!b@h JOIN #rust");
        run(&mut s, ":bob!b@h NICK :robert");
        assert!(s.channel("#rust").unwrap().contains(CaseMapping::Rfc1459, "robert"));

        run(&mut s, ":munin!m@h NICK :munin2");
        assert_eq!(s.nick, "munin2");
    }

    #[test]
    fn mode_updates_prefixes_and_key() {
        let mut s = state();
        run(&mut s, ":bob!b@h JOIN #rust");
        run(&mut s, ":op!o@h MODE #rust +ok bob sekrit");
        let chan = s.channel("#rust").unwrap();
        assert!(chan
            .user(CaseMapping::Rfc1459, "bob")
            .unwrap()
            .modes
            .contains(&'o'));
        assert_eq!(chan.key.as_deref(), Some("sekrit"));

        run(&mut s, ":op!o@h MODE #rust -k *");
        assert!(s.channel("#rust").unwrap().key.is_none());
    }

    #[test]
    fn names_accumulate_until_end() {
        let mut s = state();
        run(&mut s, ":srv 353 munin = #rust :@alice +bob");
        // Buffer not yet swapped in.
        assert_eq!(s.channel("#rust").unwrap().user_count(), 0);
        run(&mut s, ":srv 353 munin = #rust :carol");
        let out = run(&mut s, ":srv 366 munin #rust :End of /NAMES list.");
        assert!(matches!(
            &out.events[0],
            EventKind::UserListUpdated { channel } if channel == "#rust"
        ));
        let chan = s.channel("#rust").unwrap();
        assert_eq!(chan.user_count(), 3);
        assert!(chan
            .user(CaseMapping::Rfc1459, "alice")
            .unwrap()
            .modes
            .contains(&'o'));
        assert!(chan
            .user(CaseMapping::Rfc1459, "bob")
            .unwrap()
            .modes
            .contains(&'v'));
    }

    #[test]
    fn multi_prefix_names_collect_all_sigils() {
        let mut s = state();
        run(&mut s, ":srv 353 munin = #rust :@+alice");
        run(&mut s, ":srv 366 munin #rust :End");
        let user_modes = &s
            .channel("#rust")
            .unwrap()
            .user(CaseMapping::Rfc1459, "alice")
            .unwrap()
            .modes;
        assert!(user_modes.contains(&'o') && user_modes.contains(&'v'));
    }

    #[test]
    fn topic_numerics_and_live_topic() {
        let mut s = state();
        run(&mut s, ":srv 332 munin #rust :old topic");
        run(&mut s, ":srv 333 munin #rust alice 1700000000");
        {
            let topic = s.channel("#rust").unwrap().topic.clone().unwrap();
            assert_eq!(topic.text, "old topic");
            assert_eq!(topic.set_by.as_deref(), Some("alice"));
        }
        let out = run(&mut s, ":bob!b@h TOPIC #rust :new topic");
        assert!(matches!(
            &out.events[0],
            EventKind::TopicChanged { topic, setter, .. }
                if topic == "new topic" && setter == "bob"
        ));
    }

    #[test]
    fn isupport_tokens_applied() {
        let mut s = state();
        run(
            &mut s,
            ":srv 005 munin CASEMAPPING=ascii PREFIX=(ov)@+ :are supported by this server",
        );
        assert_eq!(s.isupport.casemapping, CaseMapping::Ascii);
    }

    #[test]
    fn whois_accumulates_and_finalizes() {
        let mut s = state();
        run(&mut s, ":srv 311 munin alice auser a.host * :Alice A.");
        run(&mut s, ":srv 312 munin alice srv.example :The server");
        run(&mut s, ":srv 330 munin alice alice_acct :is logged in as");
        run(&mut s, ":srv 319 munin alice :#rust @#ops");
        let out = run(&mut s, ":srv 318 munin alice :End of /WHOIS list.");
        match &out.events[0] {
            EventKind::WhoisReceived { info } => {
                assert_eq!(info.nick, "alice");
                assert_eq!(info.username.as_deref(), Some("auser"));
                assert_eq!(info.account.as_deref(), Some("alice_acct"));
                assert_eq!(info.channels.len(), 2);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(s.whois.is_empty());
    }

    #[test]
    fn pong_computes_latency_for_pending_probe() {
        let mut s = state();
        let sent = Instant::now();
        s.pending_pings.push_back(("cookie-1".to_string(), sent));
        let out = handle(
            &mut s,
            &":srv PONG srv :cookie-1".parse().unwrap(),
            sent + std::time::Duration::from_millis(40),
        );
        assert!(matches!(
            out.events[0],
            EventKind::LatencyUpdated { ms } if (30..200).contains(&ms)
        ));
        assert!(s.pending_pings.is_empty());
    }

    #[test]
    fn batches_open_and_close() {
        let mut s = state();
        run(&mut s, ":srv BATCH +ref netsplit");
        assert_eq!(s.batches.get("ref").map(String::as_str), Some("netsplit"));
        run(&mut s, ":srv BATCH -ref");
        assert!(s.batches.is_empty());
    }

    #[test]
    fn away_notify_flags_member() {
        let mut s = state();
        run(&mut s, ":bob!b@h JOIN #rust");
        run(&mut s, ":bob!b@h AWAY :lunch");
        assert!(s
            .channel("#rust")
            .unwrap()
            .user(CaseMapping::Rfc1459, "bob")
            .unwrap()
            .away);
        run(&mut s, ":bob!b@h AWAY");
        assert!(!s
            .channel("#rust")
            .unwrap()
            .user(CaseMapping::Rfc1459, "bob")
            .unwrap()
            .away);
    }
}
