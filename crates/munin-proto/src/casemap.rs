//! CASEMAPPING-aware case folding.
//!
//! Servers advertise their folding rule in ISUPPORT; nick and channel
//! comparisons must use it or user tracking silently diverges on networks
//! where `[` and `{` are the same letter.

/// The case-folding rule advertised by a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaseMapping {
    /// ASCII letters plus `[]\~` folding to `{}|^` (the historical default).
    #[default]
    Rfc1459,
    /// Plain ASCII letters only.
    Ascii,
    /// PRECIS (rfc7613); approximated with Unicode lowercasing.
    Rfc7613,
}

impl CaseMapping {
    /// Parse an ISUPPORT `CASEMAPPING=` value. Unknown values fall back to
    /// rfc1459 per the token's definition.
    pub fn from_token(value: &str) -> CaseMapping {
        match value.to_ascii_lowercase().as_str() {
            "ascii" => CaseMapping::Ascii,
            "rfc7613" => CaseMapping::Rfc7613,
            _ => CaseMapping::Rfc1459,
        }
    }

    /// Lowercase a string under this mapping.
    pub fn lower(&self, s: &str) -> String {
        match self {
            CaseMapping::Ascii => s.to_ascii_lowercase(),
            CaseMapping::Rfc7613 => s.to_lowercase(),
            CaseMapping::Rfc1459 => s
                .chars()
                .map(|c| match c {
                    '[' => '{',
                    ']' => '}',
                    '\\' => '|',
                    '~' => '^',
                    c => c.to_ascii_lowercase(),
                })
                .collect(),
        }
    }

    /// Compare two strings case-insensitively under this mapping.
    pub fn eq(&self, a: &str, b: &str) -> bool {
        self.lower(a) == self.lower(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc1459_folds_brackets() {
        let cm = CaseMapping::Rfc1459;
        assert!(cm.eq("Nick[away]", "nick{AWAY}"));
        assert!(cm.eq("a\\b~c", "A|B^C"));
    }

    #[test]
    fn ascii_does_not_fold_brackets() {
        let cm = CaseMapping::Ascii;
        assert!(cm.eq("NiCk", "nick"));
        assert!(!cm.eq("nick[", "nick{"));
    }

    #[test]
    fn unknown_token_defaults_to_rfc1459() {
        assert_eq!(CaseMapping::from_token("bogus"), CaseMapping::Rfc1459);
        assert_eq!(CaseMapping::from_token("ascii"), CaseMapping::Ascii);
        assert_eq!(CaseMapping::from_token("RFC7613"), CaseMapping::Rfc7613);
    }
}
