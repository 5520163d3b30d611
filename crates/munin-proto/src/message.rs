//! IRC message model, parser and serializer.
//!
//! Wire format: `[@tags] [:prefix] COMMAND [params...] [:trailing]`.
//! Parsing is zero-copy up to the final owned [`Message`]; the grammar
//! is small enough that a handful of nom combinators cover it.

use std::fmt;
use std::str::FromStr;

use nom::{
    bytes::complete::take_till1,
    character::complete::{char, space0},
    combinator::{opt, verify},
    sequence::{preceded, terminated},
    IResult,
};

use crate::error::ProtocolError;
use crate::prefix::Prefix;
use crate::tags::{escape_tag_value, unescape_tag_value};

/// An IRCv3 message tag: key plus optional value.
///
/// `Tag("time", Some(..))` serializes as `time=..`; a `None` value is a
/// presence-only flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag(pub String, pub Option<String>);

impl Tag {
    pub fn new(key: impl Into<String>, value: Option<String>) -> Tag {
        Tag(key.into(), value)
    }
}

/// An owned, parsed IRC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// IRCv3 tags in wire order.
    pub tags: Option<Vec<Tag>>,
    /// Message source.
    pub prefix: Option<Prefix>,
    /// Command and parameters.
    pub command: Command,
}

impl Message {
    /// Look up a tag value by key.
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags
            .as_ref()?
            .iter()
            .find(|Tag(k, _)| k == key)
            .and_then(|Tag(_, v)| v.as_deref())
    }

    /// The `batch` tag, if this message belongs to an open batch.
    pub fn batch_tag(&self) -> Option<&str> {
        self.tag_value("batch")
    }

    /// The `account` tag attached by `account-tag`.
    pub fn account_tag(&self) -> Option<&str> {
        self.tag_value("account")
    }

    /// The `time` tag attached by `server-time`.
    pub fn server_time(&self) -> Option<&str> {
        self.tag_value("time")
    }

    /// Nickname of the message source, when the prefix names a user.
    pub fn source_nickname(&self) -> Option<&str> {
        self.prefix.as_ref().and_then(Prefix::nick)
    }

    pub fn privmsg(target: impl Into<String>, text: impl Into<String>) -> Message {
        Command::Privmsg(target.into(), text.into()).into()
    }

    pub fn notice(target: impl Into<String>, text: impl Into<String>) -> Message {
        Command::Notice(target.into(), text.into()).into()
    }

    pub fn pong(token: impl Into<String>) -> Message {
        Command::Pong(token.into(), None).into()
    }

    /// Attach a tag, keeping existing ones.
    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: Option<String>) -> Message {
        self.tags
            .get_or_insert_with(Vec::new)
            .push(Tag::new(key, value));
        self
    }
}

impl From<Command> for Message {
    fn from(command: Command) -> Message {
        Message {
            tags: None,
            prefix: None,
            command,
        }
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// The commands the agent sends or interprets, plus a raw fallback.
///
/// Anything not listed round-trips through [`Command::Raw`] untouched;
/// unknown commands never fail parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Pass(String),
    Nick(String),
    User {
        user: String,
        mode: String,
        realname: String,
    },
    Quit(Option<String>),
    Join(String, Option<String>),
    Part(String, Option<String>),
    Topic(String, Option<String>),
    Kick {
        channel: String,
        nick: String,
        reason: Option<String>,
    },
    Privmsg(String, String),
    Notice(String, String),
    Mode(String, Vec<String>),
    Invite(String, String),
    Away(Option<String>),
    Ping(String, Option<String>),
    Pong(String, Option<String>),
    Cap(Vec<String>),
    Authenticate(String),
    Account(String),
    Chghost(String, String),
    Batch(String, Vec<String>),
    Error(String),
    /// A 3-digit numeric reply.
    Response(u16, Vec<String>),
    Raw(String, Vec<String>),
}

impl Command {
    /// Build a command from a name and parameter list.
    ///
    /// Commands with the wrong arity fall back to [`Command::Raw`] rather
    /// than failing; the dialect on real networks is too loose to reject.
    pub fn new(name: &str, params: Vec<String>) -> Command {
        if name.len() == 3 && name.bytes().all(|b| b.is_ascii_digit()) {
            // Cannot overflow: three ASCII digits max out at 999.
            let code: u16 = name.parse().unwrap_or(0);
            return Command::Response(code, params);
        }

        let upper = name.to_ascii_uppercase();
        let mut p = params;
        match (upper.as_str(), p.len()) {
            ("PASS", 1) => Command::Pass(p.remove(0)),
            ("NICK", 1) => Command::Nick(p.remove(0)),
            ("USER", 4) => Command::User {
                user: p.remove(0),
                mode: p.remove(0),
                realname: p.remove(1),
            },
            ("QUIT", 0) => Command::Quit(None),
            ("QUIT", 1) => Command::Quit(Some(p.remove(0))),
            ("JOIN", 1) => Command::Join(p.remove(0), None),
            ("JOIN", 2) => {
                let chan = p.remove(0);
                Command::Join(chan, Some(p.remove(0)))
            }
            // extended-join: JOIN <chan> <account> :<realname>
            ("JOIN", 3) => Command::Join(p.remove(0), None),
            ("PART", 1) => Command::Part(p.remove(0), None),
            ("PART", 2) => {
                let chan = p.remove(0);
                Command::Part(chan, Some(p.remove(0)))
            }
            ("TOPIC", 1) => Command::Topic(p.remove(0), None),
            ("TOPIC", 2) => {
                let chan = p.remove(0);
                Command::Topic(chan, Some(p.remove(0)))
            }
            ("KICK", 2) => Command::Kick {
                channel: p.remove(0),
                nick: p.remove(0),
                reason: None,
            },
            ("KICK", 3) => Command::Kick {
                channel: p.remove(0),
                nick: p.remove(0),
                reason: Some(p.remove(0)),
            },
            ("PRIVMSG", 2) => {
                let target = p.remove(0);
                Command::Privmsg(target, p.remove(0))
            }
            ("NOTICE", 2) => {
                let target = p.remove(0);
                Command::Notice(target, p.remove(0))
            }
            ("MODE", n) if n >= 1 => {
                let target = p.remove(0);
                Command::Mode(target, p)
            }
            ("INVITE", 2) => {
                let nick = p.remove(0);
                Command::Invite(nick, p.remove(0))
            }
            ("AWAY", 0) => Command::Away(None),
            ("AWAY", 1) => Command::Away(Some(p.remove(0))),
            ("PING", 1) => Command::Ping(p.remove(0), None),
            ("PING", 2) => {
                let a = p.remove(0);
                Command::Ping(a, Some(p.remove(0)))
            }
            ("PONG", 1) => Command::Pong(p.remove(0), None),
            ("PONG", 2) => {
                let a = p.remove(0);
                Command::Pong(a, Some(p.remove(0)))
            }
            ("CAP", _) => Command::Cap(p),
            ("AUTHENTICATE", 1) => Command::Authenticate(p.remove(0)),
            ("ACCOUNT", 1) => Command::Account(p.remove(0)),
            ("CHGHOST", 2) => {
                let user = p.remove(0);
                Command::Chghost(user, p.remove(0))
            }
            ("BATCH", n) if n >= 1 => {
                let reference = p.remove(0);
                Command::Batch(reference, p)
            }
            ("ERROR", 1) => Command::Error(p.remove(0)),
            _ => Command::Raw(upper, p),
        }
    }

    /// The wire name of this command (numeric replies format as digits).
    pub fn name(&self) -> String {
        match self {
            Command::Pass(_) => "PASS".into(),
            Command::Nick(_) => "NICK".into(),
            Command::User { .. } => "USER".into(),
            Command::Quit(_) => "QUIT".into(),
            Command::Join(..) => "JOIN".into(),
            Command::Part(..) => "PART".into(),
            Command::Topic(..) => "TOPIC".into(),
            Command::Kick { .. } => "KICK".into(),
            Command::Privmsg(..) => "PRIVMSG".into(),
            Command::Notice(..) => "NOTICE".into(),
            Command::Mode(..) => "MODE".into(),
            Command::Invite(..) => "INVITE".into(),
            Command::Away(_) => "AWAY".into(),
            Command::Ping(..) => "PING".into(),
            Command::Pong(..) => "PONG".into(),
            Command::Cap(_) => "CAP".into(),
            Command::Authenticate(_) => "AUTHENTICATE".into(),
            Command::Account(_) => "ACCOUNT".into(),
            Command::Chghost(..) => "CHGHOST".into(),
            Command::Batch(..) => "BATCH".into(),
            Command::Error(_) => "ERROR".into(),
            Command::Response(code, _) => format!("{:03}", code),
            Command::Raw(name, _) => name.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// One space-free word.
fn token(input: &str) -> IResult<&str, &str> {
    take_till1(|c| c == ' ')(input)
}

/// A sigil-introduced section (`@tags` or `:prefix`) with the spaces
/// that separate it from whatever follows.
fn sigil_section(sigil: char) -> impl FnMut(&str) -> IResult<&str, &str> {
    move |input| terminated(preceded(char(sigil), token), space0)(input)
}

type MessageHead<'a> = (Option<&'a str>, Option<&'a str>, &'a str);

/// `[@tags] [:prefix] COMMAND`; the unconsumed remainder is the
/// parameter section. Commands are alphanumeric words only, so a
/// malformed head fails here rather than producing garbage parameters.
fn parse_head(input: &str) -> IResult<&str, MessageHead<'_>> {
    let (input, tags) = opt(sigil_section('@'))(input)?;
    let (input, prefix) = opt(sigil_section(':'))(input)?;
    let (input, command) = verify(token, |word: &str| {
        word.bytes().all(|b| b.is_ascii_alphanumeric())
    })(input)?;
    Ok((input, (tags, prefix, command)))
}

/// Split the parameter section. Everything before the first ` :` is
/// whitespace-separated middle parameters (repeated separators
/// collapse); everything after it is a single trailing parameter that
/// may contain spaces or be empty.
fn split_params(section: &str) -> Vec<&str> {
    let (middles, trailing) = match section.find(" :") {
        Some(at) => (&section[..at], Some(&section[at + 2..])),
        None => (section, None),
    };
    let mut params: Vec<&str> = middles.split(' ').filter(|p| !p.is_empty()).collect();
    params.extend(trailing);
    params
}

fn parse_tag_list(raw: &str) -> Vec<Tag> {
    raw.split(';')
        .filter(|item| !item.is_empty())
        .map(|item| match item.split_once('=') {
            Some((key, value)) => Tag(key.to_string(), Some(unescape_tag_value(value))),
            None => Tag(item.to_string(), None),
        })
        .collect()
}

impl FromStr for Message {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Message, ProtocolError> {
        let line = s.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return Err(ProtocolError::EmptyMessage);
        }

        let (rest, (tags, prefix, command)) = parse_head(line).map_err(|_| {
            ProtocolError::InvalidMessage {
                line: line.to_string(),
                position: 0,
            }
        })?;

        let params = split_params(rest);
        if params.len() > 15 {
            return Err(ProtocolError::TooManyParams(params.len()));
        }

        let prefix = prefix.map(Prefix::parse).transpose()?;
        let tags = tags.map(parse_tag_list);
        let params: Vec<String> = params.into_iter().map(str::to_string).collect();

        Ok(Message {
            tags,
            prefix,
            command: Command::new(command, params),
        })
    }
}

// ---------------------------------------------------------------------------
// Serialization
// ---------------------------------------------------------------------------

/// Whether the final parameter is written as a trailing (`:`) parameter.
enum Trailing {
    Always,
    Auto,
    Never,
}

fn needs_colon(param: &str) -> bool {
    param.is_empty() || param.starts_with(':') || param.contains(' ')
}

fn write_params(f: &mut fmt::Formatter<'_>, params: &[&str], trailing: Trailing) -> fmt::Result {
    let last = params.len().saturating_sub(1);
    for (i, param) in params.iter().enumerate() {
        f.write_str(" ")?;
        if i == last {
            match trailing {
                Trailing::Always => f.write_str(":")?,
                Trailing::Auto if needs_colon(param) => f.write_str(":")?,
                _ => {}
            }
        }
        f.write_str(param)?;
    }
    Ok(())
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Pass(pass) => {
                f.write_str("PASS")?;
                write_params(f, &[pass], Trailing::Auto)
            }
            Command::Nick(nick) => {
                f.write_str("NICK")?;
                write_params(f, &[nick], Trailing::Auto)
            }
            Command::User {
                user,
                mode,
                realname,
            } => {
                f.write_str("USER")?;
                write_params(f, &[user, mode, "*", realname], Trailing::Always)
            }
            Command::Quit(reason) => {
                f.write_str("QUIT")?;
                match reason {
                    Some(r) => write_params(f, &[r], Trailing::Always),
                    None => Ok(()),
                }
            }
            Command::Join(chan, key) => {
                f.write_str("JOIN")?;
                match key {
                    Some(k) => write_params(f, &[chan, k], Trailing::Never),
                    None => write_params(f, &[chan], Trailing::Never),
                }
            }
            Command::Part(chan, reason) => {
                f.write_str("PART")?;
                match reason {
                    Some(r) => {
                        write_params(f, &[chan], Trailing::Never)?;
                        write_params(f, &[r], Trailing::Always)
                    }
                    None => write_params(f, &[chan], Trailing::Never),
                }
            }
            Command::Topic(chan, topic) => {
                f.write_str("TOPIC")?;
                match topic {
                    Some(t) => {
                        write_params(f, &[chan], Trailing::Never)?;
                        write_params(f, &[t], Trailing::Always)
                    }
                    None => write_params(f, &[chan], Trailing::Never),
                }
            }
            Command::Kick {
                channel,
                nick,
                reason,
            } => {
                f.write_str("KICK")?;
                match reason {
                    Some(r) => {
                        write_params(f, &[channel, nick], Trailing::Never)?;
                        write_params(f, &[r], Trailing::Always)
                    }
                    None => write_params(f, &[channel, nick], Trailing::Never),
                }
            }
            Command::Privmsg(target, text) => {
                f.write_str("PRIVMSG")?;
                write_params(f, &[target], Trailing::Never)?;
                write_params(f, &[text], Trailing::Always)
            }
            Command::Notice(target, text) => {
                f.write_str("NOTICE")?;
                write_params(f, &[target], Trailing::Never)?;
                write_params(f, &[text], Trailing::Always)
            }
            Command::Mode(target, args) => {
                f.write_str("MODE")?;
                let mut all: Vec<&str> = vec![target];
                all.extend(args.iter().map(String::as_str));
                write_params(f, &all, Trailing::Never)
            }
            Command::Invite(nick, chan) => {
                f.write_str("INVITE")?;
                write_params(f, &[nick, chan], Trailing::Never)
            }
            Command::Away(msg) => {
                f.write_str("AWAY")?;
                match msg {
                    Some(m) => write_params(f, &[m], Trailing::Always),
                    None => Ok(()),
                }
            }
            Command::Ping(a, b) => {
                f.write_str("PING")?;
                match b {
                    Some(b) => {
                        write_params(f, &[a], Trailing::Never)?;
                        write_params(f, &[b], Trailing::Always)
                    }
                    None => write_params(f, &[a], Trailing::Always),
                }
            }
            Command::Pong(a, b) => {
                f.write_str("PONG")?;
                match b {
                    Some(b) => {
                        write_params(f, &[a], Trailing::Never)?;
                        write_params(f, &[b], Trailing::Always)
                    }
                    None => write_params(f, &[a], Trailing::Always),
                }
            }
            Command::Cap(params) => {
                f.write_str("CAP")?;
                let refs: Vec<&str> = params.iter().map(String::as_str).collect();
                write_params(f, &refs, Trailing::Auto)
            }
            Command::Authenticate(payload) => {
                f.write_str("AUTHENTICATE")?;
                write_params(f, &[payload], Trailing::Never)
            }
            Command::Account(account) => {
                f.write_str("ACCOUNT")?;
                write_params(f, &[account], Trailing::Never)
            }
            Command::Chghost(user, host) => {
                f.write_str("CHGHOST")?;
                write_params(f, &[user, host], Trailing::Never)
            }
            Command::Batch(reference, params) => {
                f.write_str("BATCH")?;
                let mut all: Vec<&str> = vec![reference];
                all.extend(params.iter().map(String::as_str));
                write_params(f, &all, Trailing::Auto)
            }
            Command::Error(reason) => {
                f.write_str("ERROR")?;
                write_params(f, &[reason], Trailing::Always)
            }
            Command::Response(code, params) => {
                write!(f, "{:03}", code)?;
                let refs: Vec<&str> = params.iter().map(String::as_str).collect();
                write_params(f, &refs, Trailing::Auto)
            }
            Command::Raw(name, params) => {
                f.write_str(name)?;
                let refs: Vec<&str> = params.iter().map(String::as_str).collect();
                write_params(f, &refs, Trailing::Auto)
            }
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(tags) = &self.tags {
            if !tags.is_empty() {
                f.write_str("@")?;
                for (i, Tag(key, value)) in tags.iter().enumerate() {
                    if i > 0 {
                        f.write_str(";")?;
                    }
                    f.write_str(key)?;
                    if let Some(value) = value {
                        f.write_str("=")?;
                        escape_tag_value(f, value)?;
                    }
                }
                f.write_str(" ")?;
            }
        }
        if let Some(prefix) = &self.prefix {
            write!(f, ":{} ", prefix)?;
        }
        write!(f, "{}", self.command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(line: &str) {
        let msg: Message = line.parse().expect(line);
        assert_eq!(msg.to_string(), line, "round-trip mismatch");
    }

    #[test]
    fn parse_ping() {
        let msg: Message = "PING :abc\r\n".parse().unwrap();
        assert_eq!(msg.command, Command::Ping("abc".into(), None));
    }

    #[test]
    fn parse_privmsg_with_prefix() {
        let msg: Message = ":nick!user@host PRIVMSG #chan :Hello, world!".parse().unwrap();
        assert_eq!(msg.source_nickname(), Some("nick"));
        assert_eq!(
            msg.command,
            Command::Privmsg("#chan".into(), "Hello, world!".into())
        );
    }

    #[test]
    fn parse_tags_and_values() {
        let msg: Message = "@time=2026-01-01T00:00:00Z;account=munin :n!u@h PRIVMSG #c :hi"
            .parse()
            .unwrap();
        assert_eq!(msg.server_time(), Some("2026-01-01T00:00:00Z"));
        assert_eq!(msg.account_tag(), Some("munin"));
    }

    #[test]
    fn parse_escaped_tag_value() {
        let msg: Message = "@key=a\\sb\\:c PING :x".parse().unwrap();
        assert_eq!(msg.tag_value("key"), Some("a b;c"));
    }

    #[test]
    fn parse_numeric() {
        let msg: Message = ":server 001 munin :Welcome to the network".parse().unwrap();
        match msg.command {
            Command::Response(1, params) => {
                assert_eq!(params, vec!["munin", "Welcome to the network"]);
            }
            other => panic!("expected 001, got {:?}", other),
        }
    }

    #[test]
    fn parse_mode_with_args() {
        let msg: Message = ":x!y@z MODE #chan +ov alice bob".parse().unwrap();
        assert_eq!(
            msg.command,
            Command::Mode(
                "#chan".into(),
                vec!["+ov".into(), "alice".into(), "bob".into()]
            )
        );
    }

    #[test]
    fn parse_unknown_command_is_raw() {
        let msg: Message = "WALLOPS :look out".parse().unwrap();
        assert_eq!(
            msg.command,
            Command::Raw("WALLOPS".into(), vec!["look out".into()])
        );
    }

    #[test]
    fn empty_line_rejected() {
        assert!("".parse::<Message>().is_err());
        assert!("\r\n".parse::<Message>().is_err());
    }

    #[test]
    fn too_many_params_rejected() {
        let line = format!("CMD {}", "a ".repeat(16).trim_end());
        assert!(matches!(
            line.parse::<Message>(),
            Err(ProtocolError::TooManyParams(16))
        ));
    }

    #[test]
    fn roundtrip_representative_lines() {
        roundtrip("PING :abc");
        roundtrip("PONG :abc");
        roundtrip(":nick!user@host PRIVMSG #chan :Hello, world!");
        roundtrip(":nick!user@host NOTICE munin :psst");
        roundtrip(":server.example 001 munin :Welcome to the Example network");
        roundtrip(":server.example 433 * Munin :Nickname is already in use");
        roundtrip(":server.example 353 munin = #chan :@alice +bob carol");
        roundtrip(":server.example 333 munin #chan alice 1700000000");
        roundtrip(":a!b@c JOIN #chan");
        roundtrip(":a!b@c PART #chan :bye then");
        roundtrip(":a!b@c KICK #chan victim :flooding");
        roundtrip(":a!b@c TOPIC #chan :today: release day");
        roundtrip(":a!b@c MODE #chan +ov alice bob");
        roundtrip("@time=2026-01-01T00:00:00Z :a!b@c PRIVMSG #chan :tagged");
        roundtrip("@batch=ref123 :a!b@c QUIT :*.net *.split");
        roundtrip("CAP * LS :multi-prefix away-notify sasl");
        roundtrip("AUTHENTICATE +");
        roundtrip(":a!b@c AWAY :back later");
        roundtrip(":a!b@c CHGHOST newuser new.host");
        roundtrip("BATCH +yXNAbvnRHTRBv netsplit irc.hub other.host");
        roundtrip("ERROR :Closing Link: flooding");
    }

    #[test]
    fn roundtrip_preserves_tag_escapes() {
        roundtrip("@msg=hello\\sthere\\:ok PING :x");
    }

    #[test]
    fn nick_parse_with_trailing_colon() {
        // Some servers send NICK with a trailing parameter.
        let msg: Message = ":old!u@h NICK :newnick".parse().unwrap();
        assert_eq!(msg.command, Command::Nick("newnick".into()));
    }

    #[test]
    fn collapsed_whitespace_between_params() {
        let msg: Message = "JOIN   #chan".parse().unwrap();
        assert_eq!(msg.command, Command::Join("#chan".into(), None));
    }
}
