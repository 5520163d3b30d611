//! Control-plane authentication.
//!
//! After TLS the server sends `nonce(8) ‖ challenge(32)`; the client
//! answers `nonce(8) ‖ HMAC-SHA256(token, challenge)`. The nonce echo
//! guards against replay and mis-wired clients; comparison is constant
//! time.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

pub const NONCE_LEN: usize = 8;
pub const CHALLENGE_LEN: usize = 32;
pub const MAC_LEN: usize = 32;

/// Fresh challenge payload: `nonce(8) ‖ challenge(32)`.
pub fn make_challenge() -> [u8; NONCE_LEN + CHALLENGE_LEN] {
    let mut payload = [0u8; NONCE_LEN + CHALLENGE_LEN];
    rand::thread_rng().fill_bytes(&mut payload);
    payload
}

/// Compute the MAC a client must return for a challenge.
pub fn compute_mac(token: &str, challenge: &[u8]) -> [u8; MAC_LEN] {
    // HMAC accepts any key length.
    let mut mac = HmacSha256::new_from_slice(token.as_bytes()).expect("hmac accepts any key");
    mac.update(challenge);
    let mut out = [0u8; MAC_LEN];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// Build a client response for a server challenge payload.
pub fn make_response(token: &str, challenge_payload: &[u8]) -> Option<Vec<u8>> {
    if challenge_payload.len() != NONCE_LEN + CHALLENGE_LEN {
        return None;
    }
    let mut response = Vec::with_capacity(NONCE_LEN + MAC_LEN);
    response.extend_from_slice(&challenge_payload[..NONCE_LEN]);
    response.extend_from_slice(&compute_mac(token, &challenge_payload[NONCE_LEN..]));
    Some(response)
}

/// Verify a client's `AuthResponse` payload against the challenge we
/// sent. Both the nonce echo and the MAC must hold.
pub fn verify_response(token: &str, challenge_payload: &[u8], response: &[u8]) -> bool {
    if challenge_payload.len() != NONCE_LEN + CHALLENGE_LEN
        || response.len() != NONCE_LEN + MAC_LEN
    {
        return false;
    }
    let nonce_ok: bool = response[..NONCE_LEN]
        .ct_eq(&challenge_payload[..NONCE_LEN])
        .into();
    let expected = compute_mac(token, &challenge_payload[NONCE_LEN..]);
    let mac_ok: bool = response[NONCE_LEN..].ct_eq(&expected).into();
    nonce_ok && mac_ok
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_response_accepted() {
        let challenge = make_challenge();
        let response = make_response("T0PSECRET", &challenge).unwrap();
        assert!(verify_response("T0PSECRET", &challenge, &response));
    }

    #[test]
    fn known_vector_zero_challenge() {
        // nonce 00..07, challenge = 32 zero bytes.
        let mut challenge = [0u8; NONCE_LEN + CHALLENGE_LEN];
        for (i, b) in challenge.iter_mut().take(NONCE_LEN).enumerate() {
            *b = i as u8;
        }
        let response = make_response("T0PSECRET", &challenge).unwrap();
        assert_eq!(&response[..NONCE_LEN], &[0, 1, 2, 3, 4, 5, 6, 7]);
        assert!(verify_response("T0PSECRET", &challenge, &response));

        // Any other 32 MAC bytes must fail.
        let mut forged = response.clone();
        forged[NONCE_LEN] ^= 0x01;
        assert!(!verify_response("T0PSECRET", &challenge, &forged));
    }

    #[test]
    fn wrong_token_rejected() {
        let challenge = make_challenge();
        let response = make_response("letmein", &challenge).unwrap();
        assert!(!verify_response("T0PSECRET", &challenge, &response));
    }

    #[test]
    fn nonce_mismatch_rejected() {
        let challenge = make_challenge();
        let mut response = make_response("t", &challenge).unwrap();
        response[0] ^= 0xFF;
        assert!(!verify_response("t", &challenge, &response));
    }

    #[test]
    fn malformed_lengths_rejected() {
        let challenge = make_challenge();
        assert!(!verify_response("t", &challenge, b"short"));
        assert!(!verify_response("t", b"tiny", &make_response("t", &challenge).unwrap()));
    }
}
