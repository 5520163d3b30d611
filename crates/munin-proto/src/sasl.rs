//! SASL PLAIN payload construction.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Build the base64 `AUTHENTICATE` payload for SASL PLAIN:
/// `base64("authzid \0 authcid \0 password")` with authzid = authcid.
pub fn plain_payload(user: &str, password: &str) -> String {
    let mut raw = Vec::with_capacity(user.len() * 2 + password.len() + 2);
    raw.extend_from_slice(user.as_bytes());
    raw.push(0);
    raw.extend_from_slice(user.as_bytes());
    raw.push(0);
    raw.extend_from_slice(password.as_bytes());
    STANDARD.encode(raw)
}

/// Split an oversized SASL payload into 400-byte `AUTHENTICATE` chunks.
/// A payload that is an exact multiple of 400 is terminated with `+`.
pub fn chunk_payload(payload: &str) -> Vec<String> {
    if payload.is_empty() {
        return vec!["+".to_string()];
    }
    let mut chunks: Vec<String> = payload
        .as_bytes()
        .chunks(400)
        .map(|c| String::from_utf8_lossy(c).into_owned())
        .collect();
    if payload.len() % 400 == 0 {
        chunks.push("+".to_string());
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_payload_matches_rfc_4616_shape() {
        // base64("jilles\0jilles\0sesame") from the SASL PLAIN examples.
        assert_eq!(plain_payload("jilles", "sesame"), "amlsbGVzAGppbGxlcwBzZXNhbWU=");
    }

    #[test]
    fn short_payload_is_single_chunk() {
        assert_eq!(chunk_payload("abc"), vec!["abc"]);
    }

    #[test]
    fn exact_multiple_gets_plus_terminator() {
        let payload = "a".repeat(400);
        let chunks = chunk_payload(&payload);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1], "+");
    }

    #[test]
    fn empty_payload_is_plus() {
        assert_eq!(chunk_payload(""), vec!["+"]);
    }
}
