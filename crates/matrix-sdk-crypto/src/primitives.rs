// Copyright 2023 The Matrix.org Foundation C.I.C.
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

//! Stand-alone cryptographic primitives used by secret storage and device
//! verification.
//!
//! Olm and Megolm ratchet operations live in [`crate::olm`] and
//! [`crate::group_sessions`] and go through `vodozemac` directly; this module
//! only covers the primitives used outside of those ratchets.

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// The length in bytes of an AES-256 key, an HMAC-SHA256 key, and an AES
/// block / CTR IV.
pub const KEY_LEN: usize = 32;
pub const BLOCK_LEN: usize = 16;

/// Errors produced by the primitives in this module.
#[derive(Error, Debug)]
pub enum PrimitiveError {
    /// The HKDF output length requested was invalid for the hash in use.
    #[error("invalid length requested from HKDF")]
    HkdfLength,

    /// The AES-CTR IV or key had the wrong length.
    #[error("invalid key or IV length for AES-CTR")]
    InvalidKeyOrIv,

    /// Base58 decoding failed.
    #[error("invalid base58 data: {0}")]
    Base58(#[from] bs58::decode::Error),
}

/// The two keys split out of a single SSSS key by HKDF, matching
/// `HkdfKeys::aes()`/`HkdfKeys::mac()` in the original handler.
pub struct HkdfKeys {
    pub aes: [u8; KEY_LEN],
    pub mac: [u8; KEY_LEN],
}

/// Derive an AES key and a MAC key from a 32-byte SSSS key using HKDF-SHA256.
///
/// `salt` is the all-zero 32-byte salt the protocol always uses; `info` is
/// the per-purpose context (the secret's event type when decrypting an
/// individual secret, empty when deriving the key-validity test keys).
pub fn hkdf_sha256_keys(key: &[u8], salt: &[u8; 32], info: &[u8]) -> Result<HkdfKeys, PrimitiveError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), key);
    let mut okm = [0u8; 64];
    hk.expand(info, &mut okm).map_err(|_| PrimitiveError::HkdfLength)?;

    let mut aes = [0u8; KEY_LEN];
    let mut mac = [0u8; KEY_LEN];
    aes.copy_from_slice(&okm[..32]);
    mac.copy_from_slice(&okm[32..]);

    Ok(HkdfKeys { aes, mac })
}

/// Compute an HMAC-SHA256 over `data` keyed with `key`.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Constant-time comparison of two MACs.
pub fn mac_matches(expected: &[u8], computed: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    expected.ct_eq(computed).into()
}

/// Encrypt `plaintext` in place-equivalent fashion (returns a fresh buffer)
/// using AES-256 in CTR mode.
pub fn aes_ctr_256_encrypt(
    plaintext: &[u8],
    key: &[u8; KEY_LEN],
    iv: &[u8; BLOCK_LEN],
) -> Vec<u8> {
    let mut buffer = plaintext.to_vec();
    let mut cipher = Aes256Ctr::new(key.into(), iv.into());
    cipher.apply_keystream(&mut buffer);
    buffer
}

/// AES-256-CTR is its own inverse; decryption is the same operation as
/// encryption.
pub fn aes_ctr_256_decrypt(ciphertext: &[u8], key: &[u8; KEY_LEN], iv: &[u8; BLOCK_LEN]) -> Vec<u8> {
    aes_ctr_256_encrypt(ciphertext, key, iv)
}

/// Derive a 32-byte key from a passphrase using PBKDF2-HMAC-SHA512, per the
/// `m.pbkdf2` SSSS key-description algorithm.
pub fn pbkdf2_hmac_sha512(passphrase: &[u8], salt: &[u8], iterations: u32) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<sha2::Sha512>(passphrase, salt, iterations, &mut key);
    key
}

/// Verify an Ed25519 signature over a UTF-8 payload, reusing `vodozemac`'s
/// Ed25519 implementation rather than a second dependency.
pub fn ed25519_verify(
    public_key: &vodozemac::Ed25519PublicKey,
    message: &str,
    signature: &vodozemac::Ed25519Signature,
) -> bool {
    public_key.verify(message.as_bytes(), signature).is_ok()
}

/// Decrypt a single key-backup session entry using the Curve25519+AES-SHA2
/// hybrid scheme (`m.megolm_backup.v1.curve25519-aes-sha2`). This delegates
/// to `vodozemac`'s own `pk_encryption` module rather than reimplementing
/// the ECDH/HKDF/AES/HMAC chain by hand, since it is the same primitive
/// `vodozemac` already exposes for exactly this purpose.
pub fn curve25519_aes_sha2_decrypt(
    ciphertext: &str,
    decryption_key: vodozemac::Curve25519SecretKey,
    ephemeral_key: &str,
    mac: &str,
) -> Result<Vec<u8>, PrimitiveError> {
    let message = vodozemac::pk_encryption::Message::from_base64(ciphertext, mac, ephemeral_key)
        .map_err(|_| PrimitiveError::InvalidKeyOrIv)?;

    let decryptor = vodozemac::pk_encryption::PkDecryption::from_secret_key(decryption_key);
    decryptor.decrypt(&message).map_err(|_| PrimitiveError::InvalidKeyOrIv)
}

/// Decode a base58-encoded recovery key, stripping spaces the way the
/// original handler strips them before decoding.
pub fn base58_decode(encoded: &str) -> Result<Vec<u8>, PrimitiveError> {
    let stripped: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    Ok(bs58::decode(stripped).into_vec()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aes_ctr_roundtrip() {
        let key = [7u8; KEY_LEN];
        let iv = [1u8; BLOCK_LEN];
        let plaintext = b"a secret message of some length";

        let ciphertext = aes_ctr_256_encrypt(plaintext, &key, &iv);
        assert_ne!(ciphertext, plaintext);

        let decrypted = aes_ctr_256_decrypt(&ciphertext, &key, &iv);
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn hkdf_is_deterministic() {
        let key = [3u8; 32];
        let salt = [0u8; 32];

        let a = hkdf_sha256_keys(&key, &salt, b"m.megolm_backup.v1").unwrap();
        let b = hkdf_sha256_keys(&key, &salt, b"m.megolm_backup.v1").unwrap();

        assert_eq!(a.aes, b.aes);
        assert_eq!(a.mac, b.mac);
    }

    #[test]
    fn hkdf_info_changes_output() {
        let key = [3u8; 32];
        let salt = [0u8; 32];

        let a = hkdf_sha256_keys(&key, &salt, b"m.megolm_backup.v1").unwrap();
        let b = hkdf_sha256_keys(&key, &salt, b"m.cross_signing.master").unwrap();

        assert_ne!(a.aes, b.aes);
    }

    #[test]
    fn hmac_detects_tampering() {
        let key = [9u8; 32];
        let mac = hmac_sha256(&key, b"hello");
        let tampered = hmac_sha256(&key, b"hellp");
        assert!(!mac_matches(&mac, &tampered));
        assert!(mac_matches(&mac, &mac));
    }

    #[test]
    fn pbkdf2_is_deterministic() {
        let a = pbkdf2_hmac_sha512(b"passphrase", b"salt", 10);
        let b = pbkdf2_hmac_sha512(b"passphrase", b"salt", 10);
        assert_eq!(a, b);
    }

    #[test]
    fn base58_strips_spaces() {
        let plain = bs58::encode(b"abcdefgh").into_string();
        let spaced: String =
            plain.chars().enumerate().map(|(i, c)| if i % 2 == 0 { format!("{c} ") } else { c.to_string() }).collect();

        assert_eq!(base58_decode(&spaced).unwrap(), base58_decode(&plain).unwrap());
    }
}
