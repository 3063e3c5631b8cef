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

use std::sync::Arc;

use ruma::{OwnedDeviceId, OwnedUserId};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use vodozemac::olm::{Message, OlmMessage, PreKeyMessage, Session as InnerSession, SessionPickle};

/// One 1:1 Olm session ratchet, addressed to a single `(user_id, device_id,
/// curve25519 identity key)` (§4.1). Sessions ratchet on every message, so
/// the inner state lives behind a mutex even though most callers only ever
/// touch one session at a time; this mirrors how the rest of the store keeps
/// mutable ratchets shareable across async tasks.
#[derive(Clone)]
pub struct Session {
    pub user_id: OwnedUserId,
    pub device_id: OwnedDeviceId,
    pub our_identity_keys_curve25519: String,
    pub their_identity_key: vodozemac::Curve25519PublicKey,
    pub creation_time: std::time::SystemTime,
    inner: Arc<Mutex<InnerSession>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("their_identity_key", &self.their_identity_key.to_base64())
            .finish()
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        // Comparing by id alone is enough: two sessions with the same id are
        // the same ratchet by construction, never two independent ones.
        self.user_id == other.user_id && self.device_id == other.device_id
    }
}

impl Session {
    pub(crate) fn wrap(
        user_id: OwnedUserId,
        device_id: OwnedDeviceId,
        our_identity_keys_curve25519: String,
        their_identity_key: vodozemac::Curve25519PublicKey,
        inner: InnerSession,
    ) -> Self {
        Self {
            user_id,
            device_id,
            our_identity_keys_curve25519,
            their_identity_key,
            creation_time: std::time::SystemTime::now(),
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    pub async fn session_id(&self) -> String {
        self.inner.lock().await.session_id()
    }

    /// Encrypt `plaintext` (a serialized Olm plaintext envelope) and return
    /// the wire ciphertext body plus its message type (0 normal, 1 pre-key).
    pub async fn encrypt(&self, plaintext: &str) -> (u8, String) {
        let message = self.inner.lock().await.encrypt(plaintext);
        match message {
            OlmMessage::Normal(m) => (0, m.to_base64()),
            OlmMessage::PreKey(m) => (1, m.to_base64()),
        }
    }

    /// Check whether a pre-key Olm message was encrypted for this session,
    /// without ratcheting it forward (§4.5 step 1: test before decrypting a
    /// PreKey message against an existing session).
    pub async fn matches(&self, their_identity_key: &str, message: PreKeyMessage) -> bool {
        self.inner.lock().await.matches_inbound_session_from(their_identity_key, message).unwrap_or(false)
    }

    /// Decrypt a ciphertext body of the given message type.
    pub async fn decrypt(
        &self,
        message_type: u8,
        body: &str,
    ) -> Result<Vec<u8>, vodozemac::olm::DecryptionError> {
        let message = match message_type {
            1 => OlmMessage::PreKey(
                PreKeyMessage::from_base64(body).map_err(|_| vodozemac::olm::DecryptionError::InvalidMac)?,
            ),
            _ => OlmMessage::Normal(
                Message::from_base64(body).map_err(|_| vodozemac::olm::DecryptionError::InvalidMac)?,
            ),
        };

        self.inner.lock().await.decrypt(&message)
    }

    pub async fn pickle(&self) -> SessionPickle {
        self.inner.lock().await.pickle()
    }

    pub fn from_pickle(
        user_id: OwnedUserId,
        device_id: OwnedDeviceId,
        our_identity_keys_curve25519: String,
        their_identity_key: vodozemac::Curve25519PublicKey,
        creation_time: std::time::SystemTime,
        pickle: SessionPickle,
    ) -> Self {
        Self {
            user_id,
            device_id,
            our_identity_keys_curve25519,
            their_identity_key,
            creation_time,
            inner: Arc::new(Mutex::new(InnerSession::from_pickle(pickle))),
        }
    }
}

/// On-disk representation of a [`Session`], persisted by the Encrypted
/// Store keyed on `(user_id, device_id, session_id)` (§4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PickledSession {
    pub user_id: OwnedUserId,
    pub device_id: OwnedDeviceId,
    pub our_identity_keys_curve25519: String,
    pub their_identity_key: String,
    pub creation_time: std::time::SystemTime,
    pub pickle: SessionPickle,
}

#[cfg(test)]
mod tests {
    use ruma::{device_id, user_id};

    use super::*;
    use crate::olm::account::ReadOnlyAccount;

    #[tokio::test]
    async fn outbound_inbound_roundtrip() {
        let alice = ReadOnlyAccount::new(user_id!("@alice:example.org"), device_id!("ALICE"));
        let mut bob = ReadOnlyAccount::new(user_id!("@bob:example.org"), device_id!("BOB"));
        bob.generate_one_time_keys(1);
        let otk = bob.signed_one_time_keys().into_iter().next().unwrap();
        let otk_key = otk.1["key"].as_str().unwrap().to_owned();
        let otk_curve = vodozemac::Curve25519PublicKey::from_base64(&otk_key).unwrap();

        let outbound = alice.create_outbound_session(bob.curve25519_key(), otk_curve);
        let alice_session = Session::wrap(
            user_id!("@bob:example.org").to_owned(),
            device_id!("BOB").to_owned(),
            alice.identity_keys().curve25519,
            bob.curve25519_key(),
            outbound,
        );

        let (message_type, body) = alice_session.encrypt("hello bob").await;
        assert_eq!(message_type, 1);

        let prekey = PreKeyMessage::from_base64(&body).unwrap();
        let result = bob.create_inbound_session(alice.curve25519_key(), &prekey).unwrap();
        assert_eq!(result.plaintext, b"hello bob");
    }
}
