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

//! The Olm Session Store (C5): per-peer-curve25519 ordered session lists,
//! outbound session creation against claimed one-time keys, and the
//! decrypt-with-fallback-to-new-inbound-session logic of spec.md §4.5.

use std::collections::BTreeMap;

use matrix_sdk_common::locks::Mutex;
use ruma::{OwnedDeviceId, OwnedUserId};
use serde_json::Value;
use tracing::{debug, info, warn};
use vodozemac::{
    olm::{OlmMessage, PreKeyMessage},
    Curve25519PublicKey,
};

use crate::{
    error::{OlmError, OlmResult},
    identities::DeviceRecord,
    olm::{account::ReadOnlyAccount, session::Session},
    primitives::ed25519_verify,
};

/// Every Olm session this account currently holds, keyed by the peer's
/// Curve25519 identity key; the front (index 0) of each list is the
/// most-recently-used session (§3 "Olm session").
#[derive(Default)]
pub struct OlmSessionStore {
    sessions: Mutex<BTreeMap<String, Vec<Session>>>,
}

impl OlmSessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rehydrate from persisted state (Encrypted Store `load_olm_sessions`).
    pub fn restore(sessions: Vec<Session>) -> Self {
        let mut map: BTreeMap<String, Vec<Session>> = BTreeMap::new();
        for session in sessions {
            map.entry(session.their_identity_key.to_base64()).or_default().push(session);
        }
        Self { sessions: Mutex::new(map) }
    }

    pub async fn sessions_for(&self, curve25519: Curve25519PublicKey) -> Vec<Session> {
        self.sessions.lock().await.get(&curve25519.to_base64()).cloned().unwrap_or_default()
    }

    async fn push_front(&self, curve25519: Curve25519PublicKey, session: Session) {
        let mut sessions = self.sessions.lock().await;
        sessions.entry(curve25519.to_base64()).or_default().insert(0, session);
    }

    async fn promote_to_front(&self, curve25519: Curve25519PublicKey, session_id: &str) {
        let mut sessions = self.sessions.lock().await;
        if let Some(list) = sessions.get_mut(&curve25519.to_base64()) {
            if let Some(pos) = {
                let mut found = None;
                for (i, s) in list.iter().enumerate() {
                    if s.session_id().await == session_id {
                        found = Some(i);
                        break;
                    }
                }
                found
            } {
                let session = list.remove(pos);
                list.insert(0, session);
            }
        }
    }

    /// `create_outbound(user, device, claimed_one_time_keys)` (§4.5).
    ///
    /// `claimed_one_time_keys` is the `{ "signed_curve25519:<id>": <key object> }`
    /// map returned by `/keys/claim` for this single device.
    #[tracing::instrument(skip(self, account, claimed_one_time_keys))]
    pub async fn create_outbound(
        &self,
        account: &ReadOnlyAccount,
        user_id: &ruma::UserId,
        device: &DeviceRecord,
        claimed_one_time_keys: &BTreeMap<String, Value>,
    ) -> OlmResult<Session> {
        let (key_id, otk) = claimed_one_time_keys
            .iter()
            .find(|(algorithm_key_id, _)| algorithm_key_id.starts_with("signed_curve25519:"))
            .ok_or(OlmError::MissingSession)?;

        let key = otk["key"].as_str().ok_or(OlmError::MissingSession)?;
        let ed25519_key_id = format!("ed25519:{}", device.device_id);
        let signature = otk["signatures"][user_id.as_str()][&ed25519_key_id]
            .as_str()
            .ok_or(OlmError::MissingSession)?;

        let mut unsigned = otk.clone();
        if let Some(object) = unsigned.as_object_mut() {
            object.remove("signatures");
            object.remove("unsigned");
        }
        let canonical: ruma::serde::CanonicalJsonValue =
            unsigned.try_into().map_err(|_| OlmError::MissingSession)?;

        let device_ed25519 = vodozemac::Ed25519PublicKey::from_base64(&device.ed25519_pub)
            .map_err(|_| OlmError::MissingSession)?;
        let otk_signature = vodozemac::Ed25519Signature::from_base64(signature)
            .map_err(|_| OlmError::MissingSession)?;

        if !ed25519_verify(&device_ed25519, &canonical.to_string(), &otk_signature) {
            warn!(user_id = user_id.as_str(), device_id = device.device_id.as_str(), key_id, "one-time key signature verification failed, skipping device");
            return Err(OlmError::MissingSession);
        }

        let their_identity = vodozemac::Curve25519PublicKey::from_base64(&device.curve25519_pub)
            .map_err(|_| OlmError::MissingSession)?;
        let their_otk =
            vodozemac::Curve25519PublicKey::from_base64(key).map_err(|_| OlmError::MissingSession)?;

        let inner = account.create_outbound_session(their_identity, their_otk);
        let session = Session::wrap(
            user_id.to_owned(),
            device.device_id.clone(),
            account.identity_keys().curve25519,
            their_identity,
            inner,
        );

        self.push_front(their_identity, session.clone()).await;
        info!(user_id = user_id.as_str(), device_id = device.device_id.as_str(), session_id = %session.session_id().await, "created new outbound Olm session");

        Ok(session)
    }

    /// `encrypt(user, device, plaintext_json) -> (type, ciphertext)` (§4.5)
    /// using the front session for `device.curve25519`.
    pub async fn encrypt(
        &self,
        their_curve25519: Curve25519PublicKey,
        plaintext: &str,
    ) -> OlmResult<(u8, String)> {
        let sessions = self.sessions_for(their_curve25519).await;
        let session = sessions.first().ok_or(OlmError::MissingSession)?;
        Ok(session.encrypt(plaintext).await)
    }

    /// `decrypt(sender_curve25519, olm_message) -> plaintext` (§4.5).
    ///
    /// Tries every existing session in order, creates a new inbound session
    /// from a `PreKey` message as a last resort, and returns `SessionWedged`
    /// if every avenue is exhausted for a `Normal` message (triggers
    /// broken-session recovery at the caller).
    #[tracing::instrument(skip(self, account, message_type, body))]
    pub async fn decrypt(
        &self,
        account: &mut ReadOnlyAccount,
        user_id: &ruma::UserId,
        device_id: &ruma::DeviceId,
        sender_curve25519: Curve25519PublicKey,
        message_type: u8,
        body: &str,
    ) -> OlmResult<Vec<u8>> {
        let sessions = self.sessions_for(sender_curve25519).await;

        let prekey = if message_type == 1 {
            Some(PreKeyMessage::from_base64(body).map_err(|_| OlmError::MissingSession)?)
        } else {
            None
        };

        for session in &sessions {
            if prekey.is_some() {
                // `matches` consumes its message, so re-parse a fresh copy
                // from the same wire body for each candidate session.
                let check = PreKeyMessage::from_base64(body).map_err(|_| OlmError::MissingSession)?;
                if !session.matches(&sender_curve25519.to_base64(), check).await {
                    continue;
                }
            }

            match session.decrypt(message_type, body).await {
                Ok(plaintext) => {
                    self.promote_to_front(sender_curve25519, &session.session_id().await).await;
                    debug!(session_id = %session.session_id().await, "decrypted Olm message with an existing session");
                    return Ok(plaintext);
                }
                Err(_) => continue,
            }
        }

        if let Some(prekey) = prekey {
            let result = account
                .create_inbound_session(sender_curve25519, &prekey)
                .map_err(OlmError::OlmSession)?;

            let session = Session::wrap(
                user_id.to_owned(),
                device_id.to_owned(),
                account.identity_keys().curve25519,
                sender_curve25519,
                result.session,
            );

            self.push_front(sender_curve25519, session.clone()).await;
            info!(user_id = user_id.as_str(), device_id = device_id.as_str(), session_id = %session.session_id().await, "created new inbound Olm session");

            Ok(result.plaintext)
        } else {
            warn!(user_id = user_id.as_str(), device_id = device_id.as_str(), "Olm message failed to decrypt against every known session");
            Err(OlmError::SessionWedged(device_id.to_string()))
        }
    }
}

/// The `(user_id, device_id)` pairs the machine has already tried
/// broken-session recovery for, scoped to the process's lifetime (§9 "Open
/// question — `tried_devices` lifetime": resolved as in-memory-only).
#[derive(Default)]
pub struct TriedDevices {
    tried: Mutex<std::collections::BTreeSet<(OwnedUserId, OwnedDeviceId)>>,
}

impl TriedDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if this is the first attempt for `(user_id, device_id)`.
    pub async fn try_mark(&self, user_id: &ruma::UserId, device_id: &ruma::DeviceId) -> bool {
        self.tried.lock().await.insert((user_id.to_owned(), device_id.to_owned()))
    }

    /// Forget a device, e.g. because a fresh device-keys upload superseded it
    /// (not currently triggered anywhere in the core, kept for completeness
    /// of the set's lifecycle).
    pub async fn forget(&self, user_id: &ruma::UserId, device_id: &ruma::DeviceId) {
        self.tried.lock().await.remove(&(user_id.to_owned(), device_id.to_owned()));
    }
}

#[cfg(test)]
mod tests {
    use ruma::{device_id, user_id};
    use serde_json::json;

    use super::*;

    #[tokio::test(flavor = "current_thread")]
    async fn create_outbound_rejects_unsigned_key() {
        let alice = ReadOnlyAccount::new(user_id!("@alice:example.org"), device_id!("ALICE"));
        let bob = ReadOnlyAccount::new(user_id!("@bob:example.org"), device_id!("BOB"));

        let device = DeviceRecord {
            user_id: user_id!("@bob:example.org").to_owned(),
            device_id: device_id!("BOB").to_owned(),
            algorithms: vec![crate::types::OLM_ALGORITHM.to_owned()],
            curve25519_pub: bob.identity_keys().curve25519,
            ed25519_pub: bob.identity_keys().ed25519,
            verified: false,
        };

        let store = OlmSessionStore::new();
        let mut unsigned_otks = BTreeMap::new();
        unsigned_otks.insert(
            "signed_curve25519:AAAAAA".to_owned(),
            json!({ "key": bob.curve25519_key().to_base64() }),
        );

        let result =
            store.create_outbound(&alice, user_id!("@bob:example.org"), &device, &unsigned_otks).await;
        assert!(result.is_err());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn create_outbound_accepts_signed_key() {
        let alice = ReadOnlyAccount::new(user_id!("@alice:example.org"), device_id!("ALICE"));
        let mut bob = ReadOnlyAccount::new(user_id!("@bob:example.org"), device_id!("BOB"));
        bob.generate_one_time_keys(1);
        let signed = bob.signed_one_time_keys();

        let device = DeviceRecord {
            user_id: user_id!("@bob:example.org").to_owned(),
            device_id: device_id!("BOB").to_owned(),
            algorithms: vec![crate::types::OLM_ALGORITHM.to_owned()],
            curve25519_pub: bob.identity_keys().curve25519,
            ed25519_pub: bob.identity_keys().ed25519,
            verified: false,
        };

        let store = OlmSessionStore::new();
        let session = store
            .create_outbound(&alice, user_id!("@bob:example.org"), &device, &signed)
            .await
            .unwrap();

        assert_eq!(session.device_id.as_str(), "BOB");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn tried_devices_only_marks_once() {
        let tried = TriedDevices::new();
        assert!(tried.try_mark(user_id!("@alice:example.org"), device_id!("ALICE")).await);
        assert!(!tried.try_mark(user_id!("@alice:example.org"), device_id!("ALICE")).await);
    }
}
