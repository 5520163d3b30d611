//! Sensitive configuration values.
//!
//! A secret is stored either as a plain string (unlocked document) or as
//! `{ "data": "<base64 of blob-cipher output>" }` (sealed document).
//! Sealed values are only readable while the keystore is unlocked.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{AgentError, AgentResult};
use crate::keystore::Keystore;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Secret {
    /// `{ "data": "..." }` wrapper around blob-cipher output.
    Sealed { data: String },
    /// Plaintext value.
    Plain(String),
}

impl Secret {
    /// Resolve the secret to its plaintext.
    ///
    /// Sealed values require an unlocked keystore; the plaintext is
    /// wiped when the returned guard drops.
    pub fn reveal(&self, keystore: Option<&Keystore>) -> AgentResult<Zeroizing<String>> {
        match self {
            Secret::Plain(value) => Ok(Zeroizing::new(value.clone())),
            Secret::Sealed { data } => {
                let ks = keystore.ok_or_else(|| {
                    AgentError::Config("sealed secret present but keystore is locked".into())
                })?;
                let ciphertext = STANDARD
                    .decode(data)
                    .map_err(|e| AgentError::Config(format!("sealed secret base64: {}", e)))?;
                let plain = ks.decrypt(&ciphertext)?;
                let value = String::from_utf8(plain)
                    .map_err(|_| AgentError::Config("sealed secret is not UTF-8".into()))?;
                Ok(Zeroizing::new(value))
            }
        }
    }

    /// Seal a plaintext value with the keystore.
    pub fn seal(value: &str, keystore: &Keystore) -> AgentResult<Secret> {
        let ciphertext = keystore.encrypt(value.as_bytes())?;
        Ok(Secret::Sealed {
            data: STANDARD.encode(ciphertext),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_secret_reveals_without_keystore() {
        let s = Secret::Plain("hunter2".into());
        assert_eq!(s.reveal(None).unwrap().as_str(), "hunter2");
    }

    #[test]
    fn sealed_secret_requires_keystore() {
        let ks = Keystore::unlock("passphrase");
        let sealed = Secret::seal("hunter2", &ks).unwrap();
        assert!(matches!(sealed, Secret::Sealed { .. }));
        assert!(sealed.reveal(None).is_err());
        assert_eq!(sealed.reveal(Some(&ks)).unwrap().as_str(), "hunter2");
    }

    #[test]
    fn untagged_deserialization_picks_variant() {
        let plain: Secret = serde_json::from_str("\"pw\"").unwrap();
        assert!(matches!(plain, Secret::Plain(_)));
        let sealed: Secret = serde_json::from_str(r#"{"data":"QUJD"}"#).unwrap();
        assert!(matches!(sealed, Secret::Sealed { .. }));
    }
}
