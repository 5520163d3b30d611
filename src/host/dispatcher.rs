//! Event dispatcher.
//!
//! The primary subscriber pipeline: triggers first (they may consume
//! the event), then scripts, channel protection and statistics. The
//! control plane mirrors the bus independently and is not affected by
//! trigger cancellation.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::events::{Event, EventKind, EventStream};
use crate::protect::ProtectionEngine;
use crate::script::{ScriptAction, ScriptEngine, ScriptEventData};
use crate::stats::StatsStore;
use crate::triggers::{PlannedAction, TriggerAction, TriggerEngine, TriggerEvent};
use crate::users::UserDb;

use super::service::BotService;
use crate::config::PunishAction;

pub struct Dispatcher {
    pub service: Arc<BotService>,
    pub triggers: TriggerEngine,
    pub scripts: Option<Arc<dyn ScriptEngine>>,
    pub protection: Arc<ProtectionEngine>,
    pub stats: Arc<StatsStore>,
    pub user_db: Arc<UserDb>,
}

impl Dispatcher {
    pub async fn run(
        self: Arc<Dispatcher>,
        mut events: EventStream,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                event = events.next() => {
                    match event {
                        Some(event) => self.handle(&event),
                        None => return,
                    }
                }
                _ = shutdown.recv() => return,
            }
        }
    }

    fn handle(self: &Arc<Dispatcher>, event: &Event) {
        if let Some(hostmask) = event_hostmask(event) {
            self.user_db.touch_seen(hostmask);
        }

        let me = self
            .service
            .connection(&event.server_id)
            .map(|c| c.current_nick())
            .unwrap_or_default();

        let (actions, cancelled) = self.triggers.evaluate(event, &me);
        for action in actions {
            self.perform(action, 0);
        }
        if cancelled {
            debug!(server = %event.server_id, "event consumed by trigger");
            return;
        }

        if let Some(scripts) = &self.scripts {
            if let Some(script_event) = script_view(event) {
                let access = event_hostmask(event)
                    .and_then(|hostmask| self.user_db.find_by_hostmask(hostmask));
                for action in scripts.dispatch(&script_event, access.as_ref()) {
                    self.perform_script(&event.server_id, action);
                }
            }
        }

        for reaction in self.protection.observe(event) {
            self.punish(reaction);
        }

        self.stats.observe(event);
        self.auto_modes(event);
    }

    /// Auto-op / auto-voice / autokick from the access database.
    fn auto_modes(&self, event: &Event) {
        let EventKind::UserJoined {
            channel,
            nick,
            hostmask,
            ..
        } = &event.kind
        else {
            return;
        };
        let Some(user) = self.user_db.find_by_hostmask(hostmask) else {
            return;
        };
        let server = &event.server_id;
        if user.has_flag(Some(channel), 'k') {
            let _ = self.service.set_mode(
                server,
                channel,
                &format!("+b {}", crate::protect::derive_ban_mask(Default::default(), hostmask)),
            );
            let _ = self
                .service
                .kick(server, channel, nick, Some("autokick"));
        } else if user.has_flag(Some(channel), 'd') {
            let _ = self
                .service
                .set_mode(server, channel, &format!("-o {}", nick));
        } else if user.has_flag(Some(channel), 'a') {
            let _ = self
                .service
                .set_mode(server, channel, &format!("+o {}", nick));
        } else if user.has_flag(Some(channel), 'g') {
            let _ = self
                .service
                .set_mode(server, channel, &format!("+v {}", nick));
        }
    }

    fn punish(&self, reaction: crate::protect::Reaction) {
        let server = &reaction.server_id;
        match reaction.action {
            PunishAction::Warn => {
                let _ = self.service.send_message(
                    server,
                    &reaction.channel,
                    &format!("{}: easy there ({:?})", reaction.nick, reaction.rule_kind),
                );
            }
            PunishAction::Kick => {
                let _ = self.service.kick(
                    server,
                    &reaction.channel,
                    &reaction.nick,
                    Some("channel protection"),
                );
            }
            PunishAction::Kickban => {
                if let Some(mask) = &reaction.ban_mask {
                    debug!(
                        channel = %reaction.channel,
                        mask = %mask,
                        ttl_s = reaction.ban_ttl.map(|t| t.as_secs()),
                        "placing protection ban"
                    );
                    let _ = self
                        .service
                        .set_mode(server, &reaction.channel, &format!("+b {}", mask));
                }
                let _ = self.service.kick(
                    server,
                    &reaction.channel,
                    &reaction.nick,
                    Some("channel protection"),
                );
            }
        }
    }

    /// Carry out one trigger action. `depth` bounds `command`
    /// re-dispatch.
    fn perform(self: &Arc<Dispatcher>, action: PlannedAction, depth: u8) {
        if !action.delay.is_zero() {
            let dispatcher = Arc::clone(self);
            let mut action = action;
            let delay = action.delay;
            action.delay = Duration::ZERO;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                dispatcher.perform(action, depth);
            });
            return;
        }

        let service = &self.service;
        let server = &action.server_id;
        let result = match action.action {
            TriggerAction::Reply | TriggerAction::Say => {
                service.send_message(server, &action.target, &action.text)
            }
            TriggerAction::Action => service.send_action(server, &action.target, &action.text),
            TriggerAction::Notice => service.send_notice(server, &action.target, &action.text),
            TriggerAction::Raw => service.send_raw(server, &action.text),
            TriggerAction::Join => service.join(server, &action.target, action.key.as_deref()),
            TriggerAction::Part => service.part(server, &action.target, None),
            TriggerAction::Kick => {
                service.kick(server, &action.target, &action.text, Some("trigger"))
            }
            TriggerAction::Ban => {
                service.set_mode(server, &action.target, &format!("+b {}", action.text))
            }
            TriggerAction::Print | TriggerAction::Log => {
                info!(target: "trigger", server = %server, "{}", action.text);
                Ok(())
            }
            // UI collaborators own sounds and desktop notifications;
            // headless they degrade to log lines.
            TriggerAction::Sound | TriggerAction::Notify => {
                debug!(server = %server, kind = ?action.action, text = %action.text, "ui trigger action");
                Ok(())
            }
            TriggerAction::Command => {
                if depth == 0 {
                    let me = service
                        .connection(server)
                        .map(|c| c.current_nick())
                        .unwrap_or_default();
                    let (actions, _) = self.triggers.evaluate_input(server, &action.text, &me);
                    for inner in actions {
                        self.perform(inner, depth + 1);
                    }
                } else {
                    warn!("nested command trigger ignored");
                }
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!(server = %server, error = %e, "trigger action failed");
        }
    }

    fn perform_script(&self, server: &str, action: ScriptAction) {
        let service = &self.service;
        let result = match action {
            ScriptAction::Reply { target, text } => service.send_message(server, &target, &text),
            ScriptAction::Action { target, text } => service.send_action(server, &target, &text),
            ScriptAction::Notice { target, text } => service.send_notice(server, &target, &text),
            ScriptAction::Raw { line } => service.send_raw(server, &line),
            ScriptAction::Join { channel, key } => {
                service.join(server, &channel, key.as_deref())
            }
            ScriptAction::Part { channel, reason } => {
                service.part(server, &channel, reason.as_deref())
            }
            ScriptAction::Kick {
                channel,
                nick,
                reason,
            } => service.kick(server, &channel, &nick, reason.as_deref()),
            ScriptAction::Mode { channel, modes } => service.set_mode(server, &channel, &modes),
            ScriptAction::Log { message } => {
                info!(target: "script", server = %server, "{}", message);
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!(server = %server, error = %e, "script action failed");
        }
    }
}

fn event_hostmask(event: &Event) -> Option<&str> {
    match &event.kind {
        EventKind::ChannelMessage { hostmask, .. }
        | EventKind::PrivateMessage { hostmask, .. }
        | EventKind::Notice { hostmask, .. }
        | EventKind::Ctcp { hostmask, .. }
        | EventKind::UserJoined { hostmask, .. }
        | EventKind::UserParted { hostmask, .. }
        | EventKind::UserQuit { hostmask, .. }
        | EventKind::NickChanged { hostmask, .. }
        | EventKind::Invited { hostmask, .. } => Some(hostmask),
        _ => None,
    }
}

/// Map a bus event onto the script-engine view.
fn script_view(event: &Event) -> Option<ScriptEventData> {
    let (kind, channel, nick, hostmask, text) = match &event.kind {
        EventKind::ChannelMessage {
            channel,
            nick,
            hostmask,
            text,
            ..
        } => (
            TriggerEvent::Message,
            channel.clone(),
            nick.clone(),
            hostmask.clone(),
            text.clone(),
        ),
        EventKind::PrivateMessage {
            nick,
            hostmask,
            text,
            ..
        } => (
            TriggerEvent::Privmsg,
            String::new(),
            nick.clone(),
            hostmask.clone(),
            text.clone(),
        ),
        EventKind::Notice {
            target,
            nick,
            hostmask,
            text,
        } => (
            TriggerEvent::Notice,
            target.clone(),
            nick.clone(),
            hostmask.clone(),
            text.clone(),
        ),
        EventKind::Ctcp {
            target,
            nick,
            hostmask,
            command,
            args,
        } => (
            TriggerEvent::Ctcp,
            target.clone(),
            nick.clone(),
            hostmask.clone(),
            format!("{} {}", command, args).trim_end().to_string(),
        ),
        EventKind::UserJoined {
            channel,
            nick,
            hostmask,
            ..
        } => (
            TriggerEvent::Join,
            channel.clone(),
            nick.clone(),
            hostmask.clone(),
            String::new(),
        ),
        EventKind::UserParted {
            channel,
            nick,
            hostmask,
            reason,
        } => (
            TriggerEvent::Part,
            channel.clone(),
            nick.clone(),
            hostmask.clone(),
            reason.clone().unwrap_or_default(),
        ),
        EventKind::UserQuit {
            nick,
            hostmask,
            reason,
            ..
        } => (
            TriggerEvent::Quit,
            String::new(),
            nick.clone(),
            hostmask.clone(),
            reason.clone().unwrap_or_default(),
        ),
        EventKind::UserKicked {
            channel,
            kicker,
            kicker_hostmask,
            kicked,
            reason,
        } => (
            TriggerEvent::Kick,
            channel.clone(),
            kicker.clone(),
            kicker_hostmask.clone(),
            format!("{} {}", kicked, reason.clone().unwrap_or_default())
                .trim_end()
                .to_string(),
        ),
        EventKind::NickChanged {
            old_nick,
            new_nick,
            hostmask,
        } => (
            TriggerEvent::Nick,
            String::new(),
            old_nick.clone(),
            hostmask.clone(),
            new_nick.clone(),
        ),
        EventKind::TopicChanged {
            channel,
            setter,
            topic,
        } => (
            TriggerEvent::Topic,
            channel.clone(),
            setter.clone(),
            String::new(),
            topic.clone(),
        ),
        EventKind::Invited {
            channel,
            nick,
            hostmask,
        } => (
            TriggerEvent::Invite,
            channel.clone(),
            nick.clone(),
            hostmask.clone(),
            String::new(),
        ),
        _ => return None,
    };
    Some(ScriptEventData {
        kind,
        server: event.server_id.clone(),
        channel,
        nick,
        hostmask,
        text,
    })
}
