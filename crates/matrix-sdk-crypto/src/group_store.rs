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

//! The Group Session Store (C6): outbound Megolm lifecycle and rotation,
//! inbound session bookkeeping and replay protection, and the device/key
//! distribution bookkeeping of spec.md §4.6.

use std::{collections::BTreeMap, sync::Arc};

use matrix_sdk_common::locks::Mutex;
use ruma::{MilliSecondsSinceUnixEpoch, OwnedDeviceId, OwnedRoomId, OwnedUserId};
use tracing::{debug, info, warn};
use vodozemac::{megolm::MegolmMessage, Curve25519PublicKey};

use crate::{
    error::{MegolmError, MegolmResult},
    olm::group_sessions::{
        inbound::{InboundDecryptedMessage, SELF_OLM_SESSION_ID},
        InboundGroupSession, OutboundGroupSession,
    },
    store::{CryptoStore, MessageIndexRecord},
    types::EncryptionSettings,
};

/// Owns the in-memory overlay of outbound/inbound Megolm sessions for every
/// room, lazily hydrated from the [`CryptoStore`] and always written back to
/// it before an operation is considered complete (§4.6, §5 "a room key is
/// persisted before it is used to decrypt the queued events for its
/// session-id").
pub struct GroupSessionStore {
    own_user_id: OwnedUserId,
    own_curve25519: Curve25519PublicKey,
    store: Arc<dyn CryptoStore>,
    outbound: Mutex<BTreeMap<OwnedRoomId, OutboundGroupSession>>,
    inbound: Mutex<BTreeMap<OwnedRoomId, BTreeMap<String, InboundGroupSession>>>,
}

impl std::fmt::Debug for GroupSessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupSessionStore").field("own_user_id", &self.own_user_id).finish_non_exhaustive()
    }
}

impl GroupSessionStore {
    pub fn new(own_user_id: OwnedUserId, own_curve25519: Curve25519PublicKey, store: Arc<dyn CryptoStore>) -> Self {
        Self {
            own_user_id,
            own_curve25519,
            store,
            outbound: Mutex::new(BTreeMap::new()),
            inbound: Mutex::new(BTreeMap::new()),
        }
    }

    async fn hydrate_outbound(&self, room_id: &ruma::RoomId) -> MegolmResult<()> {
        let mut outbound = self.outbound.lock().await;
        if outbound.contains_key(room_id) {
            return Ok(());
        }
        if let Some(pickled) = self.store.load_current_outbound_megolm_session(room_id).await? {
            outbound.insert(room_id.to_owned(), OutboundGroupSession::from_pickle(pickled));
        }
        Ok(())
    }

    async fn hydrate_inbound(&self, room_id: &ruma::RoomId) -> MegolmResult<()> {
        let mut inbound = self.inbound.lock().await;
        if inbound.contains_key(room_id) {
            return Ok(());
        }
        let mut sessions = BTreeMap::new();
        for (session_id, pickled) in self.store.load_room_megolm_sessions(room_id).await? {
            match InboundGroupSession::from_pickle(pickled) {
                Ok(session) => {
                    sessions.insert(session_id, session);
                }
                Err(error) => {
                    warn!(room_id = room_id.as_str(), session_id, %error, "dropping an inbound Megolm session that failed to unpickle");
                }
            }
        }
        inbound.insert(room_id.to_owned(), sessions);
        Ok(())
    }

    /// `ensure_current_outbound(room_id)` (§4.6): returns the live session,
    /// rotating first if none exists or the rotation predicate is due.
    pub async fn ensure_current_outbound(
        &self,
        room_id: &ruma::RoomId,
        settings: &EncryptionSettings,
    ) -> MegolmResult<OutboundGroupSession> {
        self.hydrate_outbound(room_id).await?;

        let needs_rotation = {
            let outbound = self.outbound.lock().await;
            match outbound.get(room_id) {
                Some(session) => session.expired(),
                None => true,
            }
        };

        if needs_rotation {
            self.rotate(room_id, settings.clone()).await
        } else {
            Ok(self.outbound.lock().await.get(room_id).expect("just checked").clone())
        }
    }

    /// `rotate(room_id)` (§4.6): create and persist a fresh outbound session,
    /// and install a `SELF`-tagged inbound copy so the local account can read
    /// its own outgoing messages.
    pub async fn rotate(
        &self,
        room_id: &ruma::RoomId,
        settings: EncryptionSettings,
    ) -> MegolmResult<OutboundGroupSession> {
        let session = OutboundGroupSession::new(room_id, settings);
        let session_key = session.session_key().await;

        let self_inbound = InboundGroupSession::new(
            room_id,
            &session_key,
            self.own_curve25519,
            self.own_user_id.clone(),
            SELF_OLM_SESSION_ID,
        );

        self.store
            .save_changes(crate::store::PendingChanges {
                outbound_group_sessions: vec![session.pickle().await],
                inbound_group_sessions: vec![self_inbound.pickle().await],
                ..Default::default()
            })
            .await?;

        self.outbound.lock().await.insert(room_id.to_owned(), session.clone());
        self.inbound
            .lock()
            .await
            .entry(room_id.to_owned())
            .or_default()
            .insert(self_inbound.session_id().to_owned(), self_inbound);

        info!(room_id = room_id.as_str(), session_id = session.session_id(), "rotated outbound Megolm session");
        Ok(session)
    }

    /// `encrypt(room_id, plaintext)` (§4.6). Callers are responsible for
    /// having called [`Self::ensure_current_outbound`] first.
    pub async fn encrypt(&self, room_id: &ruma::RoomId, plaintext: &str) -> MegolmResult<(MegolmMessage, String, u32)> {
        let session = {
            let outbound = self.outbound.lock().await;
            outbound.get(room_id).cloned().ok_or(MegolmError::EncryptionNotEnabled)?
        };

        let (ciphertext, index) = session.encrypt(plaintext).await;
        self.store
            .save_changes(crate::store::PendingChanges {
                outbound_group_sessions: vec![session.pickle().await],
                ..Default::default()
            })
            .await?;

        Ok((ciphertext, session.session_id().to_owned(), index))
    }

    /// `add_inbound(session_id, session_key, sender_user, sender_olm_session_id)`
    /// (§4.6): refuses a duplicate `session_id`.
    #[tracing::instrument(skip(self, session_key))]
    pub async fn add_inbound(
        &self,
        room_id: &ruma::RoomId,
        session_key: &vodozemac::megolm::SessionKey,
        sender_curve25519: Curve25519PublicKey,
        sender_user: OwnedUserId,
        sender_olm_session_id: &str,
    ) -> MegolmResult<bool> {
        self.hydrate_inbound(room_id).await?;

        let session =
            InboundGroupSession::new(room_id, session_key, sender_curve25519, sender_user, sender_olm_session_id);

        let mut inbound = self.inbound.lock().await;
        let room_sessions = inbound.entry(room_id.to_owned()).or_default();
        if room_sessions.contains_key(session.session_id()) {
            debug!(room_id = room_id.as_str(), session_id = session.session_id(), "ignoring duplicate inbound Megolm session");
            return Ok(false);
        }

        self.store
            .save_changes(crate::store::PendingChanges {
                inbound_group_sessions: vec![session.pickle().await],
                ..Default::default()
            })
            .await?;

        room_sessions.insert(session.session_id().to_owned(), session);
        Ok(true)
    }

    /// `decrypt(session_id, ciphertext)` (§4.6): `MissingSession` doubles as
    /// the `UnknownSession` signal the caller queues the event under;
    /// `MismatchedSender`/`ReplayDetected` are hard rejections for this event
    /// only.
    #[tracing::instrument(skip(self, ciphertext))]
    pub async fn decrypt(
        &self,
        room_id: &ruma::RoomId,
        session_id: &str,
        event_sender: &ruma::UserId,
        event_id: &ruma::EventId,
        origin_server_ts: MilliSecondsSinceUnixEpoch,
        ciphertext: &MegolmMessage,
    ) -> MegolmResult<InboundDecryptedMessage> {
        self.hydrate_inbound(room_id).await?;

        let session = {
            let inbound = self.inbound.lock().await;
            inbound.get(room_id).and_then(|m| m.get(session_id)).cloned().ok_or(MegolmError::MissingSession)?
        };

        if session.sender_user() != event_sender {
            warn!(room_id = room_id.as_str(), session_id, "rejecting Megolm event: sender mismatch");
            return Err(MegolmError::MismatchedSender);
        }

        let decrypted = session.decrypt(ciphertext).await?;

        match self.store.group_session_index_record(room_id, session_id, decrypted.message_index).await? {
            Some(existing) if existing.event_id == event_id && existing.origin_server_ts == origin_server_ts => {}
            Some(_) => {
                warn!(room_id = room_id.as_str(), session_id, index = decrypted.message_index, "replay detected");
                return Err(MegolmError::ReplayDetected { session_id: session_id.to_owned(), index: decrypted.message_index });
            }
            None => {
                self.store
                    .add_group_session_index_record(
                        room_id,
                        session_id,
                        decrypted.message_index,
                        MessageIndexRecord { event_id: event_id.to_owned(), origin_server_ts },
                    )
                    .await?;
            }
        }

        Ok(decrypted)
    }

    /// `devices_without_key(room_id, session_id)` (§4.6 Distribution).
    pub async fn devices_without_key(
        &self,
        room_id: &ruma::RoomId,
        session_id: &str,
        candidate_devices: &[(OwnedUserId, OwnedDeviceId)],
    ) -> MegolmResult<Vec<(OwnedUserId, OwnedDeviceId)>> {
        Ok(self.store.devices_without_key(room_id, candidate_devices, session_id).await?)
    }

    /// Record that `devices` now hold the current session key, after a
    /// successful `send_session_key_to_devices` batch (§4.7 step 4).
    pub async fn mark_devices_received_key(
        &self,
        room_id: &ruma::RoomId,
        session_id: &str,
        message_index: u32,
        devices: &[(OwnedUserId, OwnedDeviceId, String)],
    ) -> MegolmResult<()> {
        self.store.set_devices_received_key(room_id, devices, session_id, message_index).await?;
        Ok(())
    }

    /// Room destruction: drop every cached and persisted session for the room.
    pub async fn clear_room(&self, room_id: &ruma::RoomId) -> MegolmResult<()> {
        self.outbound.lock().await.remove(room_id);
        self.inbound.lock().await.remove(room_id);
        self.store.clear_room_data(room_id).await?;
        Ok(())
    }

    /// A membership `Leave` (or a move out of `Join`/`Invite`) mandates
    /// rotation before the next send (§4.6). This simply forgets the cached
    /// outbound session so the next `ensure_current_outbound` rotates.
    pub async fn force_rotation_on_next_send(&self, room_id: &ruma::RoomId) {
        self.outbound.lock().await.remove(room_id);
    }

    pub async fn first_known_index(&self, room_id: &ruma::RoomId, session_id: &str) -> MegolmResult<Option<u32>> {
        self.hydrate_inbound(room_id).await?;
        let inbound = self.inbound.lock().await;
        Ok(match inbound.get(room_id).and_then(|m| m.get(session_id)) {
            Some(session) => Some(session.first_known_index().await),
            None => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use matrix_sdk_store_encryption::{PicklingKey, StoreCipher};
    use ruma::{event_id, room_id, user_id, MilliSecondsSinceUnixEpoch};

    use super::*;
    use crate::store::MemoryStore;

    fn store() -> Arc<dyn CryptoStore> {
        Arc::new(MemoryStore::new(Arc::new(StoreCipher::new(&PicklingKey::new([3u8; 32])))))
    }

    #[tokio::test(flavor = "current_thread")]
    async fn rotate_installs_self_readable_inbound_copy() {
        let room = room_id!("!room:example.org");
        let group_store =
            GroupSessionStore::new(user_id!("@alice:example.org").to_owned(), Curve25519PublicKey::from_bytes([1u8; 32]), store());

        let outbound = group_store.ensure_current_outbound(room, &EncryptionSettings::default()).await.unwrap();
        let (ciphertext, session_id, index) = group_store.encrypt(room, "hello").await.unwrap();
        assert_eq!(session_id, outbound.session_id());

        let decrypted = group_store
            .decrypt(
                room,
                &session_id,
                user_id!("@alice:example.org"),
                event_id!("$one:example.org"),
                MilliSecondsSinceUnixEpoch::now(),
                &ciphertext,
            )
            .await
            .unwrap();

        assert_eq!(decrypted.plaintext, b"hello");
        assert_eq!(decrypted.message_index, index);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn duplicate_session_id_is_refused() {
        let room = room_id!("!room:example.org");
        let group_store =
            GroupSessionStore::new(user_id!("@alice:example.org").to_owned(), Curve25519PublicKey::from_bytes([1u8; 32]), store());

        let outbound = OutboundGroupSession::new(room, EncryptionSettings::default());
        let key = outbound.session_key().await;

        let first = group_store
            .add_inbound(room, &key, Curve25519PublicKey::from_bytes([2u8; 32]), user_id!("@bob:example.org").to_owned(), "SESSIONID1")
            .await
            .unwrap();
        let second = group_store
            .add_inbound(room, &key, Curve25519PublicKey::from_bytes([2u8; 32]), user_id!("@bob:example.org").to_owned(), "SESSIONID1")
            .await
            .unwrap();

        assert!(first);
        assert!(!second);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn mismatched_sender_is_rejected() {
        let room = room_id!("!room:example.org");
        let group_store =
            GroupSessionStore::new(user_id!("@alice:example.org").to_owned(), Curve25519PublicKey::from_bytes([1u8; 32]), store());

        let outbound = OutboundGroupSession::new(room, EncryptionSettings::default());
        let key = outbound.session_key().await;
        group_store
            .add_inbound(room, &key, Curve25519PublicKey::from_bytes([2u8; 32]), user_id!("@bob:example.org").to_owned(), "SESSIONID1")
            .await
            .unwrap();

        let (ciphertext, _) = outbound.encrypt("hi").await;
        let result = group_store
            .decrypt(
                room,
                outbound.session_id(),
                user_id!("@eve:example.org"),
                event_id!("$one:example.org"),
                MilliSecondsSinceUnixEpoch::now(),
                &ciphertext,
            )
            .await;

        assert!(matches!(result, Err(MegolmError::MismatchedSender)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn replayed_index_with_different_event_id_is_rejected() {
        let room = room_id!("!room:example.org");
        let group_store =
            GroupSessionStore::new(user_id!("@alice:example.org").to_owned(), Curve25519PublicKey::from_bytes([1u8; 32]), store());

        let outbound = OutboundGroupSession::new(room, EncryptionSettings::default());
        let key = outbound.session_key().await;
        group_store
            .add_inbound(room, &key, Curve25519PublicKey::from_bytes([2u8; 32]), user_id!("@bob:example.org").to_owned(), "SESSIONID1")
            .await
            .unwrap();

        let (ciphertext, _) = outbound.encrypt("hi").await;
        let session_id = outbound.session_id();

        group_store
            .decrypt(
                room,
                session_id,
                user_id!("@bob:example.org"),
                event_id!("$one:example.org"),
                MilliSecondsSinceUnixEpoch::now(),
                &ciphertext,
            )
            .await
            .unwrap();

        let result = group_store
            .decrypt(
                room,
                session_id,
                user_id!("@bob:example.org"),
                event_id!("$two:example.org"),
                MilliSecondsSinceUnixEpoch::now(),
                &ciphertext,
            )
            .await;

        assert!(matches!(result, Err(MegolmError::ReplayDetected { .. })));
    }
}
