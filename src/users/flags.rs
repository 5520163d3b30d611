//! Access flags.
//!
//! Single-letter flags with stable meanings:
//! `n` owner, `m` master, `o` operator, `v` voice, `p` partyline,
//! `x` file, `j` janitor, `f` friend, `a` auto-op, `g` auto-voice,
//! `t` botnet, `b` bot-peer, `d` deop, `k` autokick.
//!
//! Global flags cascade to every channel; a user holding `n` or `m`
//! satisfies any permission check.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Every letter with an assigned meaning.
pub const KNOWN_FLAGS: &str = "nmovpxjfagtbdk";

/// An ordered set of access flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlagSet(BTreeSet<char>);

impl FlagSet {
    pub fn new() -> FlagSet {
        FlagSet::default()
    }

    pub fn contains(&self, flag: char) -> bool {
        self.0.contains(&flag)
    }

    /// Add a flag; unknown letters are rejected.
    pub fn insert(&mut self, flag: char) -> bool {
        KNOWN_FLAGS.contains(flag) && self.0.insert(flag)
    }

    pub fn remove(&mut self, flag: char) -> bool {
        self.0.remove(&flag)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Apply a `+ab-cd` style delta. Bare letters add.
    pub fn apply_delta(&mut self, delta: &str) {
        let mut adding = true;
        for c in delta.chars() {
            match c {
                '+' => adding = true,
                '-' => adding = false,
                c if adding => {
                    self.insert(c);
                }
                c => {
                    self.remove(c);
                }
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = char> + '_ {
        self.0.iter().copied()
    }
}

impl FromStr for FlagSet {
    type Err = std::convert::Infallible;

    /// Parse a bare letter string, silently dropping unknown letters.
    fn from_str(s: &str) -> Result<FlagSet, Self::Err> {
        let mut set = FlagSet::new();
        for c in s.chars() {
            set.insert(c);
        }
        Ok(set)
    }
}

impl fmt::Display for FlagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in &self.0 {
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

impl Serialize for FlagSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for FlagSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<FlagSet, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(s.parse().expect("infallible"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display_round_trip() {
        let flags: FlagSet = "oan".parse().unwrap();
        assert_eq!(flags.to_string(), "ano");
        assert!(flags.contains('n'));
        assert!(flags.contains('a'));
    }

    #[test]
    fn unknown_letters_dropped() {
        let flags: FlagSet = "ozq".parse().unwrap();
        assert_eq!(flags.to_string(), "o");
    }

    #[test]
    fn delta_application() {
        let mut flags: FlagSet = "ov".parse().unwrap();
        flags.apply_delta("+a-v");
        assert_eq!(flags.to_string(), "ao");
        flags.apply_delta("g");
        assert!(flags.contains('g'));
    }

    #[test]
    fn add_then_remove_restores_initial() {
        let initial: FlagSet = "of".parse().unwrap();
        let mut flags = initial.clone();
        flags.apply_delta("+a");
        flags.apply_delta("-a");
        assert_eq!(flags, initial);
    }

    #[test]
    fn serde_as_string() {
        let flags: FlagSet = "nm".parse().unwrap();
        assert_eq!(serde_json::to_string(&flags).unwrap(), "\"mn\"");
        let back: FlagSet = serde_json::from_str("\"mn\"").unwrap();
        assert_eq!(back, flags);
    }
}
