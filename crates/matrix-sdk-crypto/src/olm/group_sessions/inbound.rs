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

use matrix_sdk_common::locks::Mutex;
use ruma::{OwnedRoomId, OwnedUserId};
use serde::{Deserialize, Serialize};
use vodozemac::megolm::{
    DecryptionError, InboundGroupSession as InnerSession, InboundGroupSessionPickle, MegolmMessage,
    SessionKey,
};

/// The in-memory, sender-identified marker used by [`InboundGroupSession`]
/// when the session is our own outbound session's local copy (§4.6
/// `rotate`: "install a matching inbound session tagged SELF").
pub const SELF_OLM_SESSION_ID: &str = "SELF";

/// A decrypted plaintext plus the message index it was encrypted at, used by
/// the Group Session Store's replay check (§4.6 `decrypt`).
pub struct InboundDecryptedMessage {
    pub plaintext: Vec<u8>,
    pub message_index: u32,
}

/// The read side of a Megolm session (§3 "Inbound Megolm session"), stamped
/// with the identity of whoever shared it so replay/sender checks can be
/// enforced without a second lookup.
#[derive(Clone)]
pub struct InboundGroupSession {
    room_id: Arc<ruma::RoomId>,
    session_id: Arc<str>,
    sender_curve25519: vodozemac::Curve25519PublicKey,
    sender_user: OwnedUserId,
    /// The Olm session id this room key arrived over, or [`SELF_OLM_SESSION_ID`]
    /// if this is our own outbound session's local inbound copy.
    olm_session_id: Arc<str>,
    inner: Arc<Mutex<InnerSession>>,
}

impl std::fmt::Debug for InboundGroupSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundGroupSession")
            .field("room_id", &self.room_id)
            .field("session_id", &self.session_id)
            .field("sender_user", &self.sender_user)
            .finish()
    }
}

impl InboundGroupSession {
    /// Install a session from a received `session_key` (§4.6 `add_inbound`).
    /// The caller is responsible for rejecting a pre-existing `session_id`
    /// before calling this — this constructor always succeeds for a
    /// structurally valid key.
    pub fn new(
        room_id: &ruma::RoomId,
        session_key: &SessionKey,
        sender_curve25519: vodozemac::Curve25519PublicKey,
        sender_user: OwnedUserId,
        olm_session_id: impl Into<Arc<str>>,
    ) -> Self {
        let session = InnerSession::new(session_key, vodozemac::megolm::SessionConfig::version_2());
        let session_id = session.session_id();

        Self {
            room_id: room_id.into(),
            session_id: session_id.into(),
            sender_curve25519,
            sender_user,
            olm_session_id: olm_session_id.into(),
            inner: Arc::new(Mutex::new(session)),
        }
    }

    pub fn room_id(&self) -> &ruma::RoomId {
        &self.room_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn sender_user(&self) -> &ruma::UserId {
        &self.sender_user
    }

    pub fn sender_curve25519(&self) -> vodozemac::Curve25519PublicKey {
        self.sender_curve25519
    }

    pub fn olm_session_id(&self) -> &str {
        &self.olm_session_id
    }

    pub fn is_self_copy(&self) -> bool {
        &*self.olm_session_id == SELF_OLM_SESSION_ID
    }

    pub async fn first_known_index(&self) -> u32 {
        self.inner.lock().await.first_known_index()
    }

    pub async fn decrypt(&self, ciphertext: &MegolmMessage) -> Result<InboundDecryptedMessage, DecryptionError> {
        let result = self.inner.lock().await.decrypt(ciphertext)?;
        Ok(InboundDecryptedMessage { plaintext: result.plaintext, message_index: result.message_index })
    }

    pub async fn pickle(&self) -> PickledInboundGroupSession {
        PickledInboundGroupSession {
            room_id: self.room_id.to_owned(),
            sender_curve25519: self.sender_curve25519.to_base64(),
            sender_user: self.sender_user.clone(),
            olm_session_id: self.olm_session_id.to_string(),
            pickle: self.inner.lock().await.pickle(),
        }
    }

    pub fn from_pickle(pickle: PickledInboundGroupSession) -> Result<Self, vodozemac::KeyError> {
        let sender_curve25519 = vodozemac::Curve25519PublicKey::from_base64(&pickle.sender_curve25519)?;
        let inner = InnerSession::from_pickle(pickle.pickle);
        let session_id = inner.session_id();

        Ok(Self {
            room_id: pickle.room_id.into(),
            session_id: session_id.into(),
            sender_curve25519,
            sender_user: pickle.sender_user,
            olm_session_id: pickle.olm_session_id.into(),
            inner: Arc::new(Mutex::new(inner)),
        })
    }
}

/// On-disk representation, persisted by the Encrypted Store as
/// `inbound_megolm(room_id, session_id PK, pickled, sender_user, olm_session_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PickledInboundGroupSession {
    pub room_id: OwnedRoomId,
    pub sender_curve25519: String,
    pub sender_user: OwnedUserId,
    pub olm_session_id: String,
    pub pickle: InboundGroupSessionPickle,
}

#[cfg(test)]
mod tests {
    use ruma::{room_id, user_id};

    use super::*;
    use crate::olm::group_sessions::outbound::OutboundGroupSession;
    use crate::types::EncryptionSettings;

    #[tokio::test(flavor = "current_thread")]
    async fn outbound_inbound_roundtrip() {
        let room = room_id!("!room:example.org");
        let outbound = OutboundGroupSession::new(room, EncryptionSettings::default());
        let session_key = outbound.session_key().await;

        let inbound = InboundGroupSession::new(
            room,
            &session_key,
            vodozemac::Curve25519PublicKey::from_bytes([1u8; 32]),
            user_id!("@alice:example.org").to_owned(),
            SELF_OLM_SESSION_ID,
        );

        assert_eq!(inbound.session_id(), outbound.session_id());

        let (ciphertext, index) = outbound.encrypt("hello room").await;
        let decrypted = inbound.decrypt(&ciphertext).await.unwrap();

        assert_eq!(decrypted.plaintext, b"hello room");
        assert_eq!(decrypted.message_index, index);
    }
}
