//! Mesh link authentication.
//!
//! Challenge/response over a shared password: the listener sends 32
//! random bytes, the initiator answers with
//! `base64(SHA-256(password ∥ challenge-bytes))`, compared in constant
//! time.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::{AgentError, AgentResult};

/// Generate a fresh challenge: 32 random bytes, base64-encoded.
pub fn generate_challenge() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    STANDARD.encode(bytes)
}

/// Compute the expected response for a base64 challenge.
pub fn compute_response(password: &str, challenge_b64: &str) -> AgentResult<String> {
    let challenge = STANDARD
        .decode(challenge_b64)
        .map_err(|e| AgentError::Protocol(format!("challenge base64: {}", e)))?;
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hasher.update(&challenge);
    Ok(STANDARD.encode(hasher.finalize()))
}

/// Constant-time comparison of the peer's response.
pub fn verify_response(password: &str, challenge_b64: &str, response_b64: &str) -> bool {
    let Ok(expected) = compute_response(password, challenge_b64) else {
        return false;
    };
    let (Ok(expected), Ok(actual)) = (STANDARD.decode(expected), STANDARD.decode(response_b64))
    else {
        return false;
    };
    if expected.len() != actual.len() {
        return false;
    }
    expected.ct_eq(&actual).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_password_verifies() {
        let challenge = generate_challenge();
        let response = compute_response("p", &challenge).unwrap();
        assert!(verify_response("p", &challenge, &response));
    }

    #[test]
    fn wrong_password_rejected() {
        let challenge = generate_challenge();
        let response = compute_response("p", &challenge).unwrap();
        assert!(!verify_response("not-p", &challenge, &response));
    }

    #[test]
    fn altered_challenge_rejected() {
        let challenge = generate_challenge();
        let response = compute_response("p", &challenge).unwrap();
        let other = generate_challenge();
        assert!(!verify_response("p", &other, &response));
    }

    #[test]
    fn garbage_response_rejected() {
        let challenge = generate_challenge();
        assert!(!verify_response("p", &challenge, "????"));
        assert!(!verify_response("p", &challenge, ""));
    }

    #[test]
    fn construction_is_password_concat_challenge() {
        // Fixed vector: SHA-256("p" || 32 zero bytes).
        let challenge = STANDARD.encode([0u8; 32]);
        let response = compute_response("p", &challenge).unwrap();
        let mut hasher = Sha256::new();
        hasher.update(b"p");
        hasher.update([0u8; 32]);
        assert_eq!(response, STANDARD.encode(hasher.finalize()));
    }

    #[test]
    fn challenges_are_unique() {
        assert_ne!(generate_challenge(), generate_challenge());
    }
}
