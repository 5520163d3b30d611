//! ISUPPORT (numeric 005) dialect tracking.
//!
//! The tokens parameterize everything case- and mode-sensitive in the
//! client: CASEMAPPING, CHANMODES categories, PREFIX ranks, CHANTYPES,
//! CHANLIMIT, NICKLEN, NETWORK. Unknown tokens are ignored.

use std::collections::HashMap;

use crate::casemap::CaseMapping;

/// Channel-mode categories from `CHANMODES=A,B,C,D`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChanModes {
    /// Type A: list modes, always take a parameter (`b`, `e`, `I`).
    pub list: String,
    /// Type B: always take a parameter (`k`).
    pub always_param: String,
    /// Type C: take a parameter only when set (`l`).
    pub param_on_set: String,
    /// Type D: never take a parameter (`i`, `m`, `n`, ...).
    pub no_param: String,
}

impl Default for ChanModes {
    fn default() -> ChanModes {
        ChanModes {
            list: "b".into(),
            always_param: "k".into(),
            param_on_set: "l".into(),
            no_param: "imnpst".into(),
        }
    }
}

/// A prefix mode with its channel-membership sigil, e.g. `o` / `@`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefixMode {
    pub mode: char,
    pub sigil: char,
}

/// Accumulated server dialect, updated from each 005 reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Isupport {
    pub casemapping: CaseMapping,
    pub chanmodes: ChanModes,
    /// Ranked highest first (owner before voice).
    pub prefixes: Vec<PrefixMode>,
    pub chantypes: String,
    pub chanlimit: HashMap<char, u32>,
    pub nicklen: Option<u16>,
    pub network: Option<String>,
}

impl Default for Isupport {
    fn default() -> Isupport {
        Isupport {
            casemapping: CaseMapping::default(),
            chanmodes: ChanModes::default(),
            prefixes: vec![
                PrefixMode {
                    mode: 'o',
                    sigil: '@',
                },
                PrefixMode {
                    mode: 'v',
                    sigil: '+',
                },
            ],
            chantypes: "#&".into(),
            chanlimit: HashMap::new(),
            nicklen: None,
            network: None,
        }
    }
}

impl Isupport {
    /// Apply the tokens of one 005 reply.
    ///
    /// `params` is the full numeric parameter list; the leading nick and
    /// the trailing "are supported by this server" text are skipped.
    pub fn apply(&mut self, params: &[String]) {
        let tokens = match params.len() {
            0 | 1 => return,
            n => &params[1..n - 1],
        };
        for token in tokens {
            let (key, value) = match token.split_once('=') {
                Some((k, v)) => (k, v),
                None => (token.as_str(), ""),
            };
            match key {
                "CASEMAPPING" => self.casemapping = CaseMapping::from_token(value),
                "CHANMODES" => self.apply_chanmodes(value),
                "PREFIX" => self.apply_prefix(value),
                "CHANTYPES" => {
                    if !value.is_empty() {
                        self.chantypes = value.to_string();
                    }
                }
                "CHANLIMIT" => self.apply_chanlimit(value),
                "NICKLEN" => self.nicklen = value.parse().ok(),
                "NETWORK" => self.network = Some(value.to_string()),
                _ => {}
            }
        }
    }

    fn apply_chanmodes(&mut self, value: &str) {
        let mut parts = value.split(',');
        let list = parts.next().unwrap_or("").to_string();
        let always_param = parts.next().unwrap_or("").to_string();
        let param_on_set = parts.next().unwrap_or("").to_string();
        let no_param = parts.next().unwrap_or("").to_string();
        self.chanmodes = ChanModes {
            list,
            always_param,
            param_on_set,
            no_param,
        };
    }

    /// Parse `PREFIX=(qaohv)~&@%+`.
    fn apply_prefix(&mut self, value: &str) {
        let Some(rest) = value.strip_prefix('(') else {
            return;
        };
        let Some((modes, sigils)) = rest.split_once(')') else {
            return;
        };
        if modes.chars().count() != sigils.chars().count() {
            return;
        }
        self.prefixes = modes
            .chars()
            .zip(sigils.chars())
            .map(|(mode, sigil)| PrefixMode { mode, sigil })
            .collect();
    }

    fn apply_chanlimit(&mut self, value: &str) {
        for group in value.split(',') {
            let Some((prefixes, limit)) = group.split_once(':') else {
                continue;
            };
            let Ok(limit) = limit.parse::<u32>() else {
                continue;
            };
            for c in prefixes.chars() {
                self.chanlimit.insert(c, limit);
            }
        }
    }

    /// Rank of a prefix mode char; lower is more privileged. `None` for
    /// modes that are not membership prefixes.
    pub fn prefix_rank(&self, mode: char) -> Option<usize> {
        self.prefixes.iter().position(|p| p.mode == mode)
    }

    /// Map a membership sigil (`@`) back to its mode char (`o`).
    pub fn mode_for_sigil(&self, sigil: char) -> Option<char> {
        self.prefixes
            .iter()
            .find(|p| p.sigil == sigil)
            .map(|p| p.mode)
    }

    /// True if `c` is one of the advertised membership sigils.
    pub fn is_prefix_sigil(&self, c: char) -> bool {
        self.prefixes.iter().any(|p| p.sigil == c)
    }

    /// True if `name` starts with an advertised channel-type character.
    pub fn is_channel_name(&self, name: &str) -> bool {
        name.chars()
            .next()
            .is_some_and(|c| self.chantypes.contains(c))
    }
}
