//! IRCv3 message-tag escaping.
//!
//! Tag values travel on the wire with `;`, space, backslash, CR and LF
//! escaped per the message-tags specification. Both directions share
//! one lookup table so the pairs cannot drift apart.

use std::fmt::{Result as FmtResult, Write};

/// `(literal, escape letter)` pairs; `;` becomes `\:`, space becomes
/// `\s`, and so on.
const ESCAPE_TABLE: [(char, char); 5] = [
    (';', ':'),
    (' ', 's'),
    ('\\', '\\'),
    ('\r', 'r'),
    ('\n', 'n'),
];

fn escape_for(literal: char) -> Option<char> {
    ESCAPE_TABLE
        .iter()
        .find(|(lit, _)| *lit == literal)
        .map(|(_, esc)| *esc)
}

fn literal_for(escape: char) -> Option<char> {
    ESCAPE_TABLE
        .iter()
        .find(|(_, esc)| *esc == escape)
        .map(|(lit, _)| *lit)
}

/// Escape a tag value for serialization.
pub fn escape_tag_value(f: &mut dyn Write, value: &str) -> FmtResult {
    for c in value.chars() {
        match escape_for(c) {
            Some(esc) => {
                f.write_char('\\')?;
                f.write_char(esc)?;
            }
            None => f.write_char(c)?,
        }
    }
    Ok(())
}

/// Unescape a tag value from wire format.
///
/// A lone trailing backslash is dropped; an unknown escape yields the
/// escaped character itself, matching the IRCv3 lenient-client rule.
pub fn unescape_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(esc) => out.push(literal_for(esc).unwrap_or(esc)),
            None => break,
        }
    }
    out
}
