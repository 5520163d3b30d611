//! Connection state machine and per-session mutable state.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use munin_proto::{CaseMapping, Isupport};

use crate::error::{AgentError, AgentResult};
use crate::events::WhoisInfo;
use crate::irc::channel::Channel;

/// The connection lifecycle.
///
/// ```text
/// Disconnected -> Connecting -> Negotiating -> Registering -> Registered
/// Registered   -> Reconnecting | Disconnected
/// Reconnecting -> Connecting
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Negotiating,
    Registering,
    Registered,
    Reconnecting,
}

impl ConnectionState {
    fn may_become(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Negotiating)
                | (Negotiating, Registering)
                | (Registering, Registered)
                | (Registered, Reconnecting)
                | (Registering, Reconnecting)
                | (Negotiating, Reconnecting)
                | (Connecting, Reconnecting)
                | (Reconnecting, Connecting)
                | (_, Disconnected)
        )
    }

    /// Transition, rejecting anything the diagram does not allow.
    pub fn transition(&mut self, next: ConnectionState) -> AgentResult<()> {
        if *self == next {
            return Ok(());
        }
        if !self.may_become(next) {
            return Err(AgentError::InvalidState(format!(
                "{:?} -> {:?}",
                self, next
            )));
        }
        *self = next;
        Ok(())
    }

    pub fn is_active(self) -> bool {
        !matches!(self, ConnectionState::Disconnected)
    }
}

/// Everything the reader task mutates for one live session.
///
/// Single-writer: only the reader touches this through the write guard;
/// subscribers read snapshots.
#[derive(Debug)]
pub struct SessionState {
    /// Nickname currently held on the server.
    pub nick: String,
    pub isupport: Isupport,
    /// Capabilities the server ACKed.
    pub caps: std::collections::HashSet<String>,
    /// Joined (or joining) channels, keyed by casemapped name.
    pub channels: HashMap<String, Channel>,
    /// Open IRCv3 batches: reference -> batch type.
    pub batches: HashMap<String, String>,
    /// In-flight WHOIS accumulation, keyed by casemapped nick.
    pub whois: HashMap<String, WhoisInfo>,
    /// Outstanding keepalive probes (cookie, sent-at).
    pub pending_pings: VecDeque<(String, Instant)>,
}

impl SessionState {
    pub fn new(nick: &str) -> SessionState {
        SessionState {
            nick: nick.to_string(),
            isupport: Isupport::default(),
            caps: std::collections::HashSet::new(),
            channels: HashMap::new(),
            batches: HashMap::new(),
            whois: HashMap::new(),
            pending_pings: VecDeque::new(),
        }
    }

    pub fn casemap(&self) -> CaseMapping {
        self.isupport.casemapping
    }

    pub fn channel(&self, name: &str) -> Option<&Channel> {
        self.channels.get(&self.casemap().lower(name))
    }

    pub fn channel_mut(&mut self, name: &str) -> Option<&mut Channel> {
        let key = self.casemap().lower(name);
        self.channels.get_mut(&key)
    }

    /// True when `nick` is us under the server casemapping.
    pub fn is_self(&self, nick: &str) -> bool {
        self.casemap().eq(nick, &self.nick)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        let mut s = ConnectionState::Disconnected;
        for next in [
            ConnectionState::Connecting,
            ConnectionState::Negotiating,
            ConnectionState::Registering,
            ConnectionState::Registered,
        ] {
            s.transition(next).unwrap();
        }
        assert_eq!(s, ConnectionState::Registered);
    }

    #[test]
    fn illegal_transition_rejected() {
        let mut s = ConnectionState::Disconnected;
        let err = s.transition(ConnectionState::Registered).unwrap_err();
        assert_eq!(err.error_code(), "invalid_state");
        assert_eq!(s, ConnectionState::Disconnected);
    }

    #[test]
    fn anything_may_disconnect() {
        for from in [
            ConnectionState::Connecting,
            ConnectionState::Negotiating,
            ConnectionState::Registering,
            ConnectionState::Registered,
            ConnectionState::Reconnecting,
        ] {
            let mut s = from;
            s.transition(ConnectionState::Disconnected).unwrap();
        }
    }

    #[test]
    fn reconnecting_loops_to_connecting() {
        let mut s = ConnectionState::Registered;
        s.transition(ConnectionState::Reconnecting).unwrap();
        s.transition(ConnectionState::Connecting).unwrap();
    }

    #[test]
    fn self_nick_uses_casemap() {
        let mut state = SessionState::new("Munin[m]");
        assert!(state.is_self("munin{m}"));
        state.isupport.casemapping = CaseMapping::Ascii;
        assert!(!state.is_self("munin{m}"));
        assert!(state.is_self("MUNIN[M]"));
    }
}
