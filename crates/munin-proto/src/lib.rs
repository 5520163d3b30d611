//! munin-proto - IRC client protocol support.
//!
//! Parsing and encoding of IRC messages (RFC 1459/2812 plus the IRCv3
//! extensions the agent negotiates), server dialect handling (CASEMAPPING,
//! ISUPPORT tokens, channel-mode categories) and SASL payload construction.
//!
//! The crate is transport-agnostic: it deals in `&str` lines and owned
//! [`Message`] values. Framing, TLS and proxies live in the agent.

pub mod casemap;
pub mod error;
pub mod isupport;
pub mod message;
pub mod mode;
pub mod numeric;
pub mod prefix;
pub mod sasl;
pub mod tags;

pub use casemap::CaseMapping;
pub use error::ProtocolError;
pub use isupport::Isupport;
pub use message::{Command, Message, Tag};
pub use mode::ModeChange;
pub use prefix::Prefix;

/// Maximum length of a serialized IRC line, including the trailing CRLF.
pub const MAX_LINE_LEN: usize = 512;
