//! Message prefix (source) parsing.

use std::fmt;

use crate::error::ProtocolError;

/// The source of an IRC message: a server name or a user hostmask.
///
/// A prefix containing `!` or `@` is always a user. A bare token is a
/// server name when it contains a `.`, otherwise a nickname (servers
/// routinely shorten `nick!user@host` to `nick` for self-originated
/// messages).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prefix {
    /// `:irc.example.net`
    ServerName(String),
    /// `:nick[!user][@host]`
    Nickname {
        nick: String,
        user: Option<String>,
        host: Option<String>,
    },
}

impl Prefix {
    /// Parse a prefix string (without the leading `:`).
    pub fn parse(s: &str) -> Result<Prefix, ProtocolError> {
        if s.is_empty() {
            return Err(ProtocolError::InvalidPrefix(s.to_string()));
        }
        if !s.contains('!') && !s.contains('@') {
            if s.contains('.') {
                return Ok(Prefix::ServerName(s.to_string()));
            }
            return Ok(Prefix::Nickname {
                nick: s.to_string(),
                user: None,
                host: None,
            });
        }

        let (nick_user, host) = match s.split_once('@') {
            Some((nu, h)) => (nu, Some(h.to_string())),
            None => (s, None),
        };
        let (nick, user) = match nick_user.split_once('!') {
            Some((n, u)) => (n.to_string(), Some(u.to_string())),
            None => (nick_user.to_string(), None),
        };
        if nick.is_empty() {
            return Err(ProtocolError::InvalidPrefix(s.to_string()));
        }
        Ok(Prefix::Nickname { nick, user, host })
    }

    /// The nickname, if this prefix identifies a user.
    pub fn nick(&self) -> Option<&str> {
        match self {
            Prefix::Nickname { nick, .. } => Some(nick),
            Prefix::ServerName(_) => None,
        }
    }

    /// Reassemble the full `nick!user@host` hostmask.
    ///
    /// Missing components are replaced by `*` so the result is always a
    /// valid match target for ban masks and access lookups.
    pub fn hostmask(&self) -> String {
        match self {
            Prefix::ServerName(name) => name.clone(),
            Prefix::Nickname { nick, user, host } => format!(
                "{}!{}@{}",
                nick,
                user.as_deref().unwrap_or("*"),
                host.as_deref().unwrap_or("*")
            ),
        }
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prefix::ServerName(name) => f.write_str(name),
            Prefix::Nickname { nick, user, host } => {
                f.write_str(nick)?;
                if let Some(user) = user {
                    write!(f, "!{}", user)?;
                }
                if let Some(host) = host {
                    write!(f, "@{}", host)?;
                }
                Ok(())
            }
        }
    }
}
