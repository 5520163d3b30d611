//! Hostmask pattern matching.
//!
//! Patterns use `*` and `?` over ASCII, compared case-insensitively.
//! Matching is deterministic: `match(p, h) == match(lower(p), lower(h))`.

use wildmatch::WildMatch;

/// Match a `nick!user@host` string against a glob pattern.
pub fn matches_mask(pattern: &str, hostmask: &str) -> bool {
    WildMatch::new(&pattern.to_ascii_lowercase()).matches(&hostmask.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matching() {
        assert!(matches_mask("*!*@host.example", "nick!user@host.example"));
        assert!(matches_mask("nick!*@*", "nick!anything@anywhere"));
        assert!(matches_mask("*!~?ser@*", "x!~user@h"));
        assert!(!matches_mask("*!*@other.example", "nick!user@host.example"));
    }

    #[test]
    fn matching_is_case_insensitive_and_symmetric() {
        let pairs = [
            ("*!*@HOST.example", "Nick!User@host.EXAMPLE"),
            ("NICK!*@*", "nick!u@h"),
        ];
        for (p, h) in pairs {
            assert!(matches_mask(p, h));
            assert_eq!(
                matches_mask(p, h),
                matches_mask(&p.to_ascii_lowercase(), &h.to_ascii_lowercase())
            );
        }
    }

    #[test]
    fn literal_without_globs() {
        assert!(matches_mask("a!b@c", "A!B@C"));
        assert!(!matches_mask("a!b@c", "a!b@cc"));
    }
}
