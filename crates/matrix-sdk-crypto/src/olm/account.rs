// Copyright 2020 The Matrix.org Foundation C.I.C.
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

use std::collections::BTreeMap;

use ruma::{OwnedDeviceId, OwnedUserId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use vodozemac::olm::{Account, AccountPickle, SessionConfig};

use crate::error::AccountBootstrapError;

/// The immutable identity keys created once on first bootstrap (§3).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityKeys {
    pub curve25519: String,
    pub ed25519: String,
}

/// Our own Olm account: identity keys, one-time keys, and the Ed25519
/// signing capability every outbound object needs.
///
/// The account's own pickle is *not* encrypted here; at-rest encryption is
/// the Encrypted Store's job, layered on top via `matrix-sdk-store-encryption`
/// (§4.1/§4.3 split between the pickling key and the store that uses it).
pub struct ReadOnlyAccount {
    pub(crate) user_id: OwnedUserId,
    pub(crate) device_id: OwnedDeviceId,
    inner: Account,
}

impl std::fmt::Debug for ReadOnlyAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadOnlyAccount")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("identity_keys", &self.identity_keys())
            .finish()
    }
}

impl ReadOnlyAccount {
    /// Create a brand new account (§4.7 `Cold` → `LoadingAccount`, `Created`
    /// branch).
    pub fn new(user_id: &ruma::UserId, device_id: &ruma::DeviceId) -> Self {
        Self { user_id: user_id.to_owned(), device_id: device_id.to_owned(), inner: Account::new() }
    }

    pub fn identity_keys(&self) -> IdentityKeys {
        let keys = self.inner.identity_keys();
        IdentityKeys { curve25519: keys.curve25519.to_base64(), ed25519: keys.ed25519.to_base64() }
    }

    pub fn curve25519_key(&self) -> vodozemac::Curve25519PublicKey {
        self.inner.curve25519_key()
    }

    pub fn ed25519_key(&self) -> vodozemac::Ed25519PublicKey {
        self.inner.ed25519_key()
    }

    /// Sign an arbitrary canonical-JSON string with this account's Ed25519
    /// key, returning the base64 signature.
    pub fn sign(&self, message: &str) -> String {
        self.inner.sign(message.as_bytes()).to_base64()
    }

    /// Sign the device-keys bundle and return it ready for `POST
    /// /keys/upload` (§4.7 `PublishingKeys`).
    pub fn device_keys(&self) -> Value {
        let keys = self.identity_keys();
        let ed25519_key_id = format!("ed25519:{}", self.device_id);
        let curve25519_key_id = format!("curve25519:{}", self.device_id);

        let mut unsigned = json!({
            "user_id": self.user_id,
            "device_id": self.device_id,
            "algorithms": [crate::types::OLM_ALGORITHM, crate::types::MEGOLM_ALGORITHM],
            "keys": {
                ed25519_key_id: keys.ed25519,
                curve25519_key_id: keys.curve25519,
            },
        });

        let canonical: ruma::serde::CanonicalJsonValue =
            unsigned.clone().try_into().expect("device keys object is always a JSON object");
        let signature = self.sign(&canonical.to_string());

        unsigned["signatures"] = json!({ self.user_id.as_str(): { ed25519_key_id: signature } });
        unsigned
    }

    pub fn max_one_time_keys(&self) -> usize {
        self.inner.max_number_of_one_time_keys()
    }

    /// Generate `count` new one-time keys (§4.7 `Ready` → `UploadingOTKs`).
    pub fn generate_one_time_keys(&mut self, count: usize) {
        self.inner.generate_one_time_keys(count);
    }

    pub fn one_time_keys_count(&self) -> usize {
        self.inner.one_time_keys().len()
    }

    /// Produce the signed one-time-key bundle for `POST /keys/upload`,
    /// `{ "signed_curve25519:<key_id>": { key, signatures } }` per the
    /// Matrix spec's signed-OTK wire shape.
    pub fn signed_one_time_keys(&self) -> BTreeMap<String, Value> {
        self.inner
            .one_time_keys()
            .into_iter()
            .map(|(key_id, key)| {
                let algorithm_key_id = format!("signed_curve25519:{key_id}");
                let unsigned = json!({ "key": key.to_base64() });
                let canonical: ruma::serde::CanonicalJsonValue =
                    unsigned.clone().try_into().expect("one-time key object is always an object");
                let signature = self.sign(&canonical.to_string());

                let key_id_label = format!("ed25519:{}", self.device_id);
                let signed = json!({
                    "key": key.to_base64(),
                    "signatures": { self.user_id.as_str(): { key_id_label: signature } },
                });
                (algorithm_key_id, signed)
            })
            .collect()
    }

    /// Mark every currently-generated one-time key as published (§4.7
    /// `UploadingOTKs` → `Ready`).
    pub fn mark_keys_as_published(&mut self) {
        self.inner.mark_keys_as_published();
    }

    pub fn create_outbound_session(
        &self,
        their_identity_key: vodozemac::Curve25519PublicKey,
        their_one_time_key: vodozemac::Curve25519PublicKey,
    ) -> vodozemac::olm::Session {
        self.inner.create_outbound_session(
            SessionConfig::version_2(),
            their_identity_key,
            their_one_time_key,
        )
    }

    pub fn create_inbound_session(
        &mut self,
        their_identity_key: vodozemac::Curve25519PublicKey,
        message: &vodozemac::olm::PreKeyMessage,
    ) -> Result<vodozemac::olm::InboundCreationResult, vodozemac::olm::SessionCreationError> {
        self.inner.create_inbound_session(their_identity_key, message)
    }

    pub fn pickle(&self) -> AccountPickle {
        self.inner.pickle()
    }

    pub fn from_pickle(
        user_id: &ruma::UserId,
        device_id: &ruma::DeviceId,
        pickle: AccountPickle,
    ) -> Result<Self, AccountBootstrapError> {
        Ok(Self { user_id: user_id.to_owned(), device_id: device_id.to_owned(), inner: Account::from_pickle(pickle) })
    }
}

/// On-disk representation: the vodozemac pickle plus the bookkeeping this
/// core needs to restore `ReadOnlyAccount` (its owner identity).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PickledAccount {
    pub user_id: OwnedUserId,
    pub device_id: OwnedDeviceId,
    pub pickle: AccountPickle,
    /// Whether a `device_keys` upload has ever succeeded for this account.
    pub uploaded_device_keys: bool,
}

#[cfg(test)]
mod tests {
    use ruma::{device_id, user_id};

    use super::*;

    fn account() -> ReadOnlyAccount {
        ReadOnlyAccount::new(user_id!("@alice:example.org"), device_id!("ALICEDEVICE"))
    }

    #[test]
    fn device_keys_bundle_is_self_signed() {
        let account = account();
        let bundle = account.device_keys();

        let ed25519_pub =
            vodozemac::Ed25519PublicKey::from_base64(&account.identity_keys().ed25519).unwrap();
        let key_id = format!("ed25519:{}", account.device_id);
        let signature_b64 =
            bundle["signatures"][account.user_id.as_str()][&key_id].as_str().unwrap();
        let signature = vodozemac::Ed25519Signature::from_base64(signature_b64).unwrap();

        let mut unsigned = bundle.clone();
        unsigned.as_object_mut().unwrap().remove("signatures");
        let canonical: ruma::serde::CanonicalJsonValue = unsigned.try_into().unwrap();

        assert!(crate::primitives::ed25519_verify(&ed25519_pub, &canonical.to_string(), &signature));
    }

    #[test]
    fn otk_count_reflects_generated_keys() {
        let mut account = account();
        assert_eq!(account.one_time_keys_count(), 0);

        account.generate_one_time_keys(15);
        assert_eq!(account.one_time_keys_count(), 15);

        let signed = account.signed_one_time_keys();
        assert_eq!(signed.len(), 15);

        account.mark_keys_as_published();
        assert_eq!(account.one_time_keys_count(), 0);
    }
}
