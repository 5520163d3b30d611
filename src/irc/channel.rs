//! Runtime channel and member model.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use munin_proto::{CaseMapping, Isupport};

/// Topic with attribution, from 332/333 or a live TOPIC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    pub text: String,
    pub set_by: Option<String>,
    pub set_at: Option<DateTime<Utc>>,
}

/// One member of a channel.
#[derive(Debug, Clone, Default)]
pub struct ChannelUser {
    pub nick: String,
    pub user: Option<String>,
    pub host: Option<String>,
    pub account: Option<String>,
    /// Held membership-prefix modes (`o`, `v`, ...).
    pub modes: BTreeSet<char>,
    pub away: bool,
}

impl ChannelUser {
    pub fn new(nick: &str) -> ChannelUser {
        ChannelUser {
            nick: nick.to_string(),
            ..ChannelUser::default()
        }
    }

    /// Rank of the best prefix held; lower is more privileged. `None`
    /// for a plain member.
    pub fn highest_rank(&self, isupport: &Isupport) -> Option<usize> {
        self.modes
            .iter()
            .filter_map(|&m| isupport.prefix_rank(m))
            .min()
    }

    /// True when this member holds op or better.
    pub fn is_op(&self, isupport: &Isupport) -> bool {
        match (self.highest_rank(isupport), isupport.prefix_rank('o')) {
            (Some(held), Some(op)) => held <= op,
            _ => false,
        }
    }
}

/// A channel the agent is in (or joining).
#[derive(Debug, Clone)]
pub struct Channel {
    pub name: String,
    pub topic: Option<Topic>,
    /// Members keyed by casemapped nick.
    users: HashMap<String, ChannelUser>,
    /// Non-list channel modes with their parameter.
    pub modes: HashMap<char, Option<String>>,
    pub joined: bool,
    pub key: Option<String>,
    pub unread_messages: u64,
    /// 353 accumulation, swapped in on 366.
    pub(crate) names_buffer: Option<HashMap<String, ChannelUser>>,
}

impl Channel {
    pub fn new(name: &str) -> Channel {
        Channel {
            name: name.to_string(),
            topic: None,
            users: HashMap::new(),
            modes: HashMap::new(),
            joined: false,
            key: None,
            unread_messages: 0,
            names_buffer: None,
        }
    }

    pub fn user(&self, cm: CaseMapping, nick: &str) -> Option<&ChannelUser> {
        self.users.get(&cm.lower(nick))
    }

    pub fn user_mut(&mut self, cm: CaseMapping, nick: &str) -> Option<&mut ChannelUser> {
        self.users.get_mut(&cm.lower(nick))
    }

    pub fn add_user(&mut self, cm: CaseMapping, user: ChannelUser) {
        self.users.insert(cm.lower(&user.nick), user);
    }

    pub fn remove_user(&mut self, cm: CaseMapping, nick: &str) -> Option<ChannelUser> {
        self.users.remove(&cm.lower(nick))
    }

    pub fn rename_user(&mut self, cm: CaseMapping, old: &str, new: &str) -> bool {
        match self.users.remove(&cm.lower(old)) {
            Some(mut user) => {
                user.nick = new.to_string();
                self.users.insert(cm.lower(new), user);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, cm: CaseMapping, nick: &str) -> bool {
        self.users.contains_key(&cm.lower(nick))
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn nicks(&self) -> impl Iterator<Item = &str> {
        self.users.values().map(|u| u.nick.as_str())
    }

    pub fn users(&self) -> impl Iterator<Item = &ChannelUser> {
        self.users.values()
    }

    /// Replace the member table wholesale (end of NAMES).
    pub fn replace_users(&mut self, users: HashMap<String, ChannelUser>) {
        self.users = users;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CM: CaseMapping = CaseMapping::Rfc1459;

    #[test]
    fn membership_is_casemapped() {
        let mut chan = Channel::new("#rust");
        chan.add_user(CM, ChannelUser::new("Alice[away]"));
        assert!(chan.contains(CM, "alice{AWAY}"));
        assert!(chan.remove_user(CM, "ALICE[away]").is_some());
        assert_eq!(chan.user_count(), 0);
    }

    #[test]
    fn rename_preserves_modes() {
        let mut chan = Channel::new("#rust");
        let mut alice = ChannelUser::new("alice");
        alice.modes.insert('o');
        chan.add_user(CM, alice);
        assert!(chan.rename_user(CM, "Alice", "alicia"));
        let user = chan.user(CM, "alicia").unwrap();
        assert_eq!(user.nick, "alicia");
        assert!(user.modes.contains(&'o'));
        assert!(!chan.contains(CM, "alice"));
    }

    #[test]
    fn rank_ordering() {
        let isupport = Isupport::default();
        let mut user = ChannelUser::new("x");
        assert_eq!(user.highest_rank(&isupport), None);
        user.modes.insert('v');
        assert_eq!(user.highest_rank(&isupport), Some(1));
        user.modes.insert('o');
        assert_eq!(user.highest_rank(&isupport), Some(0));
        assert!(user.is_op(&isupport));
    }

    #[test]
    fn replay_of_membership_events_matches_fresh_model() {
        // JOIN/PART/KICK/QUIT/NICK applied to a model equal the same
        // events replayed onto an empty model.
        let events: &[(&str, &str)] = &[
            ("join", "alice"),
            ("join", "bob"),
            ("nick", "bob:robert"),
            ("join", "carol"),
            ("part", "alice"),
            ("join", "dave"),
            ("quit", "carol"),
            ("kick", "dave"),
        ];

        let apply = |chan: &mut Channel| {
            for (kind, arg) in events {
                match *kind {
                    "join" => chan.add_user(CM, ChannelUser::new(arg)),
                    "part" | "quit" | "kick" => {
                        chan.remove_user(CM, arg);
                    }
                    "nick" => {
                        let (old, new) = arg.split_once(':').unwrap();
                        chan.rename_user(CM, old, new);
                    }
                    _ => unreachable!(),
                }
            }
        };

        let mut a = Channel::new("#x");
        apply(&mut a);
        let mut b = Channel::new("#x");
        apply(&mut b);

        let mut nicks_a: Vec<&str> = a.nicks().collect();
        let mut nicks_b: Vec<&str> = b.nicks().collect();
        nicks_a.sort_unstable();
        nicks_b.sort_unstable();
        assert_eq!(nicks_a, nicks_b);
        assert_eq!(nicks_a, vec!["robert"]);
    }
}
