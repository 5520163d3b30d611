//! Encrypted-blob keystore.
//!
//! Sealed files and secrets share one framing:
//!
//! ```text
//! "MNSEC1" | salt(16) | nonce(12) | AES-256-GCM ciphertext+tag
//! ```
//!
//! The key is derived per blob with PBKDF2-HMAC-SHA256 over the unlock
//! passphrase. Anything that starts with the magic prefix is treated as
//! sealed; everything else passes through untouched.

use std::num::NonZeroU32;

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use zeroize::Zeroizing;

use crate::error::{AgentError, AgentResult};

/// Magic prefix identifying sealed blobs.
pub const MAGIC: &[u8; 6] = b"MNSEC1";

const SALT_LEN: usize = 16;
const PBKDF2_ITERATIONS: u32 = 600_000;

/// Sniff whether a byte buffer is a sealed blob.
pub fn is_sealed(bytes: &[u8]) -> bool {
    bytes.starts_with(MAGIC)
}

/// An unlocked keystore: the passphrase material held in memory, wiped
/// on drop.
pub struct Keystore {
    passphrase: Zeroizing<Vec<u8>>,
    rng: SystemRandom,
}

impl Keystore {
    /// Unlock with a passphrase. Derivation happens per blob, so this
    /// never fails; a wrong passphrase surfaces on the first decrypt.
    pub fn unlock(passphrase: &str) -> Keystore {
        Keystore {
            passphrase: Zeroizing::new(passphrase.as_bytes().to_vec()),
            rng: SystemRandom::new(),
        }
    }

    fn derive_key(&self, salt: &[u8]) -> Zeroizing<[u8; 32]> {
        let mut key = Zeroizing::new([0u8; 32]);
        // PBKDF2_ITERATIONS is a nonzero constant.
        let iterations = NonZeroU32::new(PBKDF2_ITERATIONS).unwrap();
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            iterations,
            salt,
            &self.passphrase,
            key.as_mut(),
        );
        key
    }

    /// Seal a plaintext buffer into a framed blob.
    pub fn encrypt(&self, plaintext: &[u8]) -> AgentResult<Vec<u8>> {
        let mut salt = [0u8; SALT_LEN];
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut salt)
            .map_err(|_| AgentError::Config("keystore: random source failed".into()))?;
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| AgentError::Config("keystore: random source failed".into()))?;

        let key = self.derive_key(&salt);
        let unbound = UnboundKey::new(&AES_256_GCM, key.as_ref())
            .map_err(|_| AgentError::Config("keystore: key setup failed".into()))?;
        let sealing = LessSafeKey::new(unbound);

        let mut in_out = plaintext.to_vec();
        sealing
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::from(MAGIC),
                &mut in_out,
            )
            .map_err(|_| AgentError::Config("keystore: seal failed".into()))?;

        let mut framed = Vec::with_capacity(MAGIC.len() + SALT_LEN + NONCE_LEN + in_out.len());
        framed.extend_from_slice(MAGIC);
        framed.extend_from_slice(&salt);
        framed.extend_from_slice(&nonce_bytes);
        framed.extend_from_slice(&in_out);
        Ok(framed)
    }

    /// Open a framed blob back into plaintext.
    pub fn decrypt(&self, framed: &[u8]) -> AgentResult<Vec<u8>> {
        let header = MAGIC.len() + SALT_LEN + NONCE_LEN;
        if !is_sealed(framed) || framed.len() < header + AES_256_GCM.tag_len() {
            return Err(AgentError::Config("keystore: not a sealed blob".into()));
        }
        let salt = &framed[MAGIC.len()..MAGIC.len() + SALT_LEN];
        let mut nonce_bytes = [0u8; NONCE_LEN];
        nonce_bytes.copy_from_slice(&framed[MAGIC.len() + SALT_LEN..header]);

        let key = self.derive_key(salt);
        let unbound = UnboundKey::new(&AES_256_GCM, key.as_ref())
            .map_err(|_| AgentError::Config("keystore: key setup failed".into()))?;
        let opening = LessSafeKey::new(unbound);

        let mut in_out = framed[header..].to_vec();
        let plain = opening
            .open_in_place(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::from(MAGIC),
                &mut in_out,
            )
            .map_err(|_| AgentError::AuthFailed("keystore: wrong passphrase or corrupt blob".into()))?;
        Ok(plain.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let ks = Keystore::unlock("correct horse");
        let sealed = ks.encrypt(b"attack at dawn").unwrap();
        assert!(is_sealed(&sealed));
        assert_eq!(ks.decrypt(&sealed).unwrap(), b"attack at dawn");
    }

    #[test]
    fn wrong_passphrase_fails_auth() {
        let sealed = Keystore::unlock("right").encrypt(b"secret").unwrap();
        let err = Keystore::unlock("wrong").decrypt(&sealed).unwrap_err();
        assert_eq!(err.error_code(), "auth_failed");
    }

    #[test]
    fn plain_bytes_are_not_sealed() {
        assert!(!is_sealed(b"{\"users\":[]}"));
        assert!(is_sealed(b"MNSEC1rest"));
    }

    #[test]
    fn truncated_blob_rejected() {
        let ks = Keystore::unlock("pw");
        assert!(ks.decrypt(b"MNSEC1short").is_err());
    }

    #[test]
    fn fresh_salt_per_blob() {
        let ks = Keystore::unlock("pw");
        let a = ks.encrypt(b"same").unwrap();
        let b = ks.encrypt(b"same").unwrap();
        assert_ne!(a, b);
    }
}
