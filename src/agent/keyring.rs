//! Gossip encryption keyring (spec §8: "gossip traffic is optionally
//! encrypted with a symmetric keyring supporting rotation without a
//! cluster-wide restart"). Adapted from the teacher's direct (non-envelope)
//! AES-256-GCM path in `networking::security::encryption`, generalized to a
//! multi-key ring: one primary key encrypts new traffic, every installed key
//! is tried on decrypt so a rotation can roll out node by node.

use crate::error::{AgentError, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use rand::RngCore;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

#[derive(Clone)]
struct KeyringEntry {
    encoded: String,
    material: [u8; KEY_LEN],
}

/// The set of keys a node will accept gossip traffic under, with one key
/// designated primary for encrypting outbound traffic.
pub struct Keyring {
    entries: Vec<KeyringEntry>,
    primary: usize,
}

impl Keyring {
    /// Build a keyring from base64-encoded 32-byte keys, the same encoding
    /// the `encrypt` config field and `keyring` file use. The first key is
    /// primary.
    pub fn from_base64_keys(keys: &[String]) -> Result<Self> {
        if keys.is_empty() {
            return Err(AgentError::Config("keyring requires at least one key".to_string()));
        }
        let entries = keys
            .iter()
            .map(|k| decode_key(k).map(|material| KeyringEntry { encoded: k.clone(), material }))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { entries, primary: 0 })
    }

    /// Generate a fresh random key and install it as the lone key in a new
    /// ring (used when `encrypt` is unset but encryption is requested).
    pub fn generate() -> (Self, String) {
        let mut material = [0u8; KEY_LEN];
        rand::rng().fill_bytes(&mut material);
        let encoded = base64::engine::general_purpose::STANDARD.encode(material);
        let ring = Self { entries: vec![KeyringEntry { encoded: encoded.clone(), material }], primary: 0 };
        (ring, encoded)
    }

    pub fn primary_key(&self) -> &str {
        &self.entries[self.primary].encoded
    }

    /// Install a new key without making it primary. Rotation is: install on
    /// every node, `use_primary` on every node, then `remove` the old key.
    pub fn install(&mut self, key: &str) -> Result<()> {
        let material = decode_key(key)?;
        if self.entries.iter().any(|e| e.encoded == key) {
            return Ok(());
        }
        self.entries.push(KeyringEntry { encoded: key.to_string(), material });
        Ok(())
    }

    pub fn use_primary(&mut self, key: &str) -> Result<()> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.encoded == key)
            .ok_or_else(|| AgentError::NotFound(format!("key {key} not installed")))?;
        self.primary = idx;
        Ok(())
    }

    /// Remove a key, refusing to remove the current primary.
    pub fn remove(&mut self, key: &str) -> Result<()> {
        if self.entries[self.primary].encoded == key {
            return Err(AgentError::InvalidArgument("cannot remove the primary key".to_string()));
        }
        self.entries.retain(|e| e.encoded != key);
        Ok(())
    }

    pub fn installed_keys(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.encoded.clone()).collect()
    }

    /// Encrypt `plaintext` under the primary key, returning
    /// `nonce || ciphertext || tag`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let key = &self.entries[self.primary].material;
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| AgentError::Gossip(format!("cipher init failed: {e}")))?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| AgentError::Gossip(format!("encryption failed: {e}")))?;
        let mut out = nonce_bytes.to_vec();
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt a `nonce || ciphertext || tag` frame, trying every installed
    /// key until one verifies (so traffic encrypted under an about-to-be-
    /// retired key still decodes during a rotation).
    pub fn decrypt(&self, framed: &[u8]) -> Result<Vec<u8>> {
        if framed.len() < NONCE_LEN {
            return Err(AgentError::Gossip("ciphertext shorter than nonce".to_string()));
        }
        let (nonce_bytes, ciphertext) = framed.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        for entry in &self.entries {
            let cipher = match Aes256Gcm::new_from_slice(&entry.material) {
                Ok(c) => c,
                Err(_) => continue,
            };
            if let Ok(plaintext) = cipher.decrypt(nonce, ciphertext) {
                return Ok(plaintext);
            }
        }
        Err(AgentError::Gossip("no installed key could decrypt frame".to_string()))
    }
}

fn decode_key(encoded: &str) -> Result<[u8; KEY_LEN]> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| AgentError::Config(format!("invalid gossip key encoding: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| AgentError::Config(format!("gossip key must decode to {KEY_LEN} bytes")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_encrypt_and_decrypt() {
        let (ring, _) = Keyring::generate();
        let framed = ring.encrypt(b"gossip payload").unwrap();
        let recovered = ring.decrypt(&framed).unwrap();
        assert_eq!(recovered, b"gossip payload");
    }

    #[test]
    fn decrypt_succeeds_with_an_older_installed_key_during_rotation() {
        let (mut ring, old_key) = Keyring::generate();
        let framed_under_old_key = ring.encrypt(b"pre-rotation").unwrap();

        let (_, new_key) = Keyring::generate();
        ring.install(&new_key).unwrap();
        ring.use_primary(&new_key).unwrap();

        assert_eq!(ring.decrypt(&framed_under_old_key).unwrap(), b"pre-rotation");
        assert!(ring.remove(&old_key).is_ok());
        assert!(ring.decrypt(&framed_under_old_key).is_err());
    }

    #[test]
    fn cannot_remove_the_primary_key() {
        let (mut ring, key) = Keyring::generate();
        assert!(ring.remove(&key).is_err());
    }

    #[test]
    fn rejects_malformed_base64_key() {
        assert!(Keyring::from_base64_keys(&["not-valid-base64!!".to_string()]).is_err());
    }
}
