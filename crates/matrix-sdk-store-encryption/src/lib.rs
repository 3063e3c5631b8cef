// Copyright 2021 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Helpers used to encrypt-at-rest the cryptographic state of a Matrix
//! account: a symmetric key provider (the "pickling key") plus a small
//! encryption wrapper built on top of it.
//!
//! The provider is deliberately a narrow trait: an OS keyring, a platform
//! secure-storage API, or a test double can all satisfy it without this
//! crate knowing anything about the storage medium.

#![deny(missing_debug_implementations, dead_code, missing_docs, trivial_casts, unused_qualifications)]

use std::collections::HashMap;
use std::sync::Mutex;

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// The length in bytes of a pickling key.
pub const PICKLE_KEY_LEN: usize = 32;

/// A 32-byte symmetric key used to encrypt all long-lived crypto state.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PicklingKey([u8; PICKLE_KEY_LEN]);

impl PicklingKey {
    /// Wrap a raw 32-byte key.
    pub fn new(bytes: [u8; PICKLE_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Generate a new random pickling key using the OS RNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; PICKLE_KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Borrow the raw bytes.
    pub fn as_bytes(&self) -> &[u8; PICKLE_KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for PicklingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PicklingKey").field(&"...").finish()
    }
}

/// Errors that can happen while fetching a pickling key from its backing
/// store.
#[derive(Debug, Error)]
pub enum KeychainError {
    /// The key that was found in the backing store did not have the expected
    /// length. This is a fatal, non-recoverable error: a corrupted or
    /// foreign entry must never be silently replaced with a fresh key, since
    /// that would make existing encrypted state permanently unreadable
    /// without a visible signal.
    #[error("the pickling key stored under {identifier:?} has length {found}, expected {PICKLE_KEY_LEN}")]
    InvalidKeyLength {
        /// The identifier the key was stored under.
        identifier: String,
        /// The length that was actually found.
        found: usize,
    },
    /// The underlying keychain/keyring backend returned an error.
    #[error("keychain backend error: {0}")]
    Backend(String),
}

/// Supplies the 32-byte symmetric key used to encrypt-at-rest all long-lived
/// crypto state for a given account.
///
/// Implementations are expected to be backed by a durable, private secret
/// store (an OS keyring, a platform secure-storage API, ...). This crate
/// does not implement such a backend itself; see [`InMemoryPicklingKeyProvider`]
/// for a reference implementation suitable for a single-process embedding of
/// the core and [`MockPicklingKeyProvider`] for unit tests.
#[async_trait::async_trait]
pub trait PicklingKeyProvider: std::fmt::Debug + Send + Sync {
    /// Get the pickling key for `account_id`, generating and persisting a new
    /// random one on first call.
    async fn get_or_create(&self, account_id: &str) -> Result<PicklingKey, KeychainError>;
}

/// A [`PicklingKeyProvider`] that keeps keys in an in-process map.
///
/// This is *not* a persistent keyring: keys are lost when the process exits.
/// It exists so that the core can be exercised end-to-end (bootstrap, sync
/// handling, SSSS unlock, ...) without wiring up a platform keychain.
#[derive(Debug, Default)]
pub struct InMemoryPicklingKeyProvider {
    keys: Mutex<HashMap<String, [u8; PICKLE_KEY_LEN]>>,
}

impl InMemoryPicklingKeyProvider {
    /// Create an empty provider.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl PicklingKeyProvider for InMemoryPicklingKeyProvider {
    async fn get_or_create(&self, account_id: &str) -> Result<PicklingKey, KeychainError> {
        let identifier = format!("{account_id}-Pickle");
        let mut keys = self.keys.lock().unwrap();

        if let Some(bytes) = keys.get(&identifier) {
            if bytes.len() != PICKLE_KEY_LEN {
                return Err(KeychainError::InvalidKeyLength {
                    identifier,
                    found: bytes.len(),
                });
            }
            Ok(PicklingKey::new(*bytes))
        } else {
            let key = PicklingKey::generate();
            keys.insert(identifier, *key.as_bytes());
            Ok(key)
        }
    }
}

/// A [`PicklingKeyProvider`] that always returns a fixed, well-known key.
///
/// Selectable only by test configuration; using it outside of tests defeats
/// the entire point of encryption-at-rest.
#[derive(Debug, Default)]
pub struct MockPicklingKeyProvider {
    key: [u8; PICKLE_KEY_LEN],
}

impl MockPicklingKeyProvider {
    /// Create a provider that always returns 32 zero bytes.
    pub fn zeroed() -> Self {
        Self { key: [0u8; PICKLE_KEY_LEN] }
    }
}

#[async_trait::async_trait]
impl PicklingKeyProvider for MockPicklingKeyProvider {
    async fn get_or_create(&self, _account_id: &str) -> Result<PicklingKey, KeychainError> {
        Ok(PicklingKey::new(self.key))
    }
}

/// An encrypted, versioned blob produced by [`StoreCipher`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedValue {
    /// The ChaCha20-Poly1305 nonce used for this value.
    nonce: Vec<u8>,
    /// The ciphertext, including the AEAD tag.
    ciphertext: Vec<u8>,
}

/// Errors that can occur while encrypting or decrypting store values.
#[derive(Debug, Error)]
pub enum StoreCipherError {
    /// Serialization into the internal msgpack representation failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),
    /// Deserialization from the internal msgpack representation failed.
    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),
    /// The AEAD cipher rejected the ciphertext (wrong key or corrupted data).
    #[error("failed to decrypt value, the data may be corrupted or the key is wrong")]
    Decryption,
}

/// A symmetric cipher derived from a [`PicklingKey`], used to encrypt
/// arbitrary values before they are persisted and to derive deterministic
/// lookup keys for indexed tables.
pub struct StoreCipher {
    cipher: ChaCha20Poly1305,
    mac_key: [u8; 32],
}

impl std::fmt::Debug for StoreCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreCipher").finish_non_exhaustive()
    }
}

type HmacSha256 = Hmac<Sha256>;

impl StoreCipher {
    /// Derive a cipher from a pickling key.
    ///
    /// The key is expanded with blake3 into an AEAD key and an independent
    /// HMAC key, so that the same root key can be used both for
    /// confidentiality and for hashing lookup keys.
    pub fn new(key: &PicklingKey) -> Self {
        let expanded = blake3::derive_key("matrix-sdk-crypto store-encryption v1", key.as_bytes());
        let mut mac_key = [0u8; 32];
        let mac_material =
            blake3::derive_key("matrix-sdk-crypto store-encryption v1 mac", key.as_bytes());
        mac_key.copy_from_slice(&mac_material);

        Self { cipher: ChaCha20Poly1305::new((&expanded).into()), mac_key }
    }

    /// Encrypt an arbitrary serializable value.
    pub fn encrypt_value<T: Serialize>(&self, value: &T) -> Result<EncryptedValue, StoreCipherError> {
        let serialized = rmp_serde::to_vec_named(value)?;

        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, serialized.as_slice())
            .map_err(|_| StoreCipherError::Decryption)?;

        Ok(EncryptedValue { nonce: nonce_bytes.to_vec(), ciphertext })
    }

    /// Decrypt a value previously produced by [`Self::encrypt_value`].
    pub fn decrypt_value<T: DeserializeOwned>(
        &self,
        value: &EncryptedValue,
    ) -> Result<T, StoreCipherError> {
        let nonce = Nonce::from_slice(&value.nonce);
        let plaintext = self
            .cipher
            .decrypt(nonce, value.ciphertext.as_slice())
            .map_err(|_| StoreCipherError::Decryption)?;

        Ok(rmp_serde::from_slice(&plaintext)?)
    }

    /// Derive a deterministic, keyed hash of a lookup key, so that indexed
    /// tables (e.g. device id, session id) can be looked up without storing
    /// the key material in the clear.
    pub fn hash_key(&self, table_name: &str, key: &[u8]) -> [u8; 32] {
        let mut mac = HmacSha256::new_from_slice(&self.mac_key).expect("HMAC accepts any key length");
        mac.update(table_name.as_bytes());
        mac.update(b"|");
        mac.update(key);
        let result = mac.finalize().into_bytes();
        let mut out = [0u8; 32];
        out.copy_from_slice(&result);
        out
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Demo {
        a: u32,
        b: String,
    }

    #[tokio::test]
    async fn in_memory_provider_is_stable_across_calls() {
        let provider = InMemoryPicklingKeyProvider::new();

        let first = provider.get_or_create("@alice:example.org").await.unwrap();
        let second = provider.get_or_create("@alice:example.org").await.unwrap();

        assert_eq!(first.as_bytes(), second.as_bytes());
    }

    #[tokio::test]
    async fn different_accounts_get_different_keys() {
        let provider = InMemoryPicklingKeyProvider::new();

        let alice = provider.get_or_create("@alice:example.org").await.unwrap();
        let bob = provider.get_or_create("@bob:example.org").await.unwrap();

        assert_ne!(alice.as_bytes(), bob.as_bytes());
    }

    #[tokio::test]
    async fn mock_provider_is_the_zero_key() {
        let provider = MockPicklingKeyProvider::zeroed();
        let key = provider.get_or_create("@alice:example.org").await.unwrap();

        assert_eq!(key.as_bytes(), &[0u8; PICKLE_KEY_LEN]);
    }

    #[test]
    fn round_trips_a_value() {
        let cipher = StoreCipher::new(&PicklingKey::new([1u8; 32]));
        let value = Demo { a: 42, b: "hello".to_owned() };

        let encrypted = cipher.encrypt_value(&value).unwrap();
        let decrypted: Demo = cipher.decrypt_value(&encrypted).unwrap();

        assert_eq!(value, decrypted);
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let cipher = StoreCipher::new(&PicklingKey::new([1u8; 32]));
        let other = StoreCipher::new(&PicklingKey::new([2u8; 32]));
        let value = Demo { a: 42, b: "hello".to_owned() };

        let encrypted = cipher.encrypt_value(&value).unwrap();
        let result: Result<Demo, _> = other.decrypt_value(&encrypted);

        assert!(result.is_err());
    }

    #[test]
    fn hash_key_is_deterministic_and_namespaced() {
        let cipher = StoreCipher::new(&PicklingKey::new([1u8; 32]));

        assert_eq!(cipher.hash_key("sessions", b"abc"), cipher.hash_key("sessions", b"abc"));
        assert_ne!(cipher.hash_key("sessions", b"abc"), cipher.hash_key("devices", b"abc"));
    }
}
