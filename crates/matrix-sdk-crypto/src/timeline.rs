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

//! The Timeline Adapter (C9): per-room decrypt entry point and the
//! pending-event bag for Megolm events that arrived before their session
//! (§4.9).

use std::{collections::BTreeMap, sync::Arc};

use matrix_sdk_common::locks::Mutex;
use ruma::{MilliSecondsSinceUnixEpoch, OwnedEventId, OwnedRoomId, OwnedUserId};
use tracing::{debug, warn};
use vodozemac::{megolm::MegolmMessage, Curve25519PublicKey};

use crate::{
    error::{EventError, MegolmError, MegolmResult},
    group_store::GroupSessionStore,
    types::MEGOLM_ALGORITHM,
};

/// A Megolm event this room received before the session that would decrypt
/// it, queued under that session's id (§3 "Pending undecrypted events").
#[derive(Clone)]
pub struct PendingRoomEvent {
    pub event_id: OwnedEventId,
    pub sender: OwnedUserId,
    pub origin_server_ts: MilliSecondsSinceUnixEpoch,
    pub ciphertext: MegolmMessage,
}

/// A successfully decrypted room event, ready to replace its placeholder in
/// the timeline.
#[derive(Clone, Debug)]
pub struct DecryptedRoomEvent {
    pub event_id: OwnedEventId,
    pub sender: OwnedUserId,
    pub room_id: OwnedRoomId,
    pub plaintext: serde_json::Value,
}

/// Per-room decrypt entry point and pending-event bag, sitting on top of the
/// account-wide [`GroupSessionStore`] (C6).
pub struct RoomEventCache {
    room_id: OwnedRoomId,
    group_store: Arc<GroupSessionStore>,
    pending: Mutex<BTreeMap<String, Vec<PendingRoomEvent>>>,
}

impl std::fmt::Debug for RoomEventCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomEventCache").field("room_id", &self.room_id).finish_non_exhaustive()
    }
}

impl RoomEventCache {
    pub fn new(room_id: OwnedRoomId, group_store: Arc<GroupSessionStore>) -> Self {
        Self { room_id, group_store, pending: Mutex::new(BTreeMap::new()) }
    }

    fn session_id_for(session_key: &vodozemac::megolm::SessionKey) -> String {
        vodozemac::megolm::InboundGroupSession::new(session_key, vodozemac::megolm::SessionConfig::version_2())
            .session_id()
    }

    /// `handle_room_key(event, sender_user, olm_session_id)` (§4.9): installs
    /// the session via C6 `add_inbound`, then replays and decrypts every
    /// event queued under its session id. A decrypt failure in the replay
    /// batch is logged and skipped, not propagated, so one bad queued event
    /// cannot block the rest (§7 class 3).
    #[tracing::instrument(skip(self, session_key))]
    pub async fn handle_room_key(
        &self,
        session_key: &vodozemac::megolm::SessionKey,
        sender_curve25519: Curve25519PublicKey,
        sender_user: OwnedUserId,
        olm_session_id: &str,
    ) -> MegolmResult<Vec<DecryptedRoomEvent>> {
        let session_id = Self::session_id_for(session_key);

        let inserted = self
            .group_store
            .add_inbound(&self.room_id, session_key, sender_curve25519, sender_user.clone(), olm_session_id)
            .await?;

        if !inserted {
            debug!(room_id = %self.room_id, session_id, "room key for an already-known session, nothing to replay");
            return Ok(Vec::new());
        }

        let queued = self.pending.lock().await.remove(&session_id).unwrap_or_default();
        let mut replaced = Vec::with_capacity(queued.len());

        for event in queued {
            match self.decrypt_inner(&session_id, &event.event_id, &event.sender, event.origin_server_ts, &event.ciphertext).await {
                Ok(Some(decrypted)) => replaced.push(decrypted),
                Ok(None) => {
                    warn!(room_id = %self.room_id, session_id, event_id = %event.event_id, "replayed event still has no matching session");
                }
                Err(error) => {
                    warn!(room_id = %self.room_id, session_id, event_id = %event.event_id, %error, "dropping queued event that failed to decrypt");
                }
            }
        }

        Ok(replaced)
    }

    /// `decrypt(encrypted_event) -> Option<decrypted_event>` (§4.9).
    /// `UnknownSession` (`MegolmError::MissingSession`) is swallowed into
    /// `Ok(None)` after queuing the event; every other failure propagates so
    /// the caller can log it without the unwinding affecting other events.
    pub async fn decrypt(
        &self,
        event_id: &ruma::EventId,
        sender: &ruma::UserId,
        origin_server_ts: MilliSecondsSinceUnixEpoch,
        algorithm: &str,
        session_id: &str,
        ciphertext: &MegolmMessage,
    ) -> MegolmResult<Option<DecryptedRoomEvent>> {
        if algorithm != MEGOLM_ALGORITHM {
            return Err(EventError::UnsupportedAlgorithm.into());
        }

        self.decrypt_inner(session_id, event_id, sender, origin_server_ts, ciphertext).await
    }

    async fn decrypt_inner(
        &self,
        session_id: &str,
        event_id: &ruma::EventId,
        sender: &ruma::UserId,
        origin_server_ts: MilliSecondsSinceUnixEpoch,
        ciphertext: &MegolmMessage,
    ) -> MegolmResult<Option<DecryptedRoomEvent>> {
        match self.group_store.decrypt(&self.room_id, session_id, sender, event_id, origin_server_ts, ciphertext).await {
            Ok(decrypted) => {
                let plaintext: serde_json::Value = serde_json::from_slice(&decrypted.plaintext)?;
                let event_room_id = plaintext
                    .get("room_id")
                    .and_then(|v| v.as_str())
                    .and_then(|s| ruma::RoomId::parse(s).ok());

                match event_room_id {
                    Some(ref room_id) if room_id == &*self.room_id => Ok(Some(DecryptedRoomEvent {
                        event_id: event_id.to_owned(),
                        sender: sender.to_owned(),
                        room_id: self.room_id.clone(),
                        plaintext,
                    })),
                    other => Err(EventError::MismatchedRoom {
                        expected_room_id: self.room_id.clone(),
                        event_room_id: other.unwrap_or_else(|| self.room_id.clone()),
                    }
                    .into()),
                }
            }
            Err(MegolmError::MissingSession) => {
                self.pending.lock().await.entry(session_id.to_owned()).or_default().push(PendingRoomEvent {
                    event_id: event_id.to_owned(),
                    sender: sender.to_owned(),
                    origin_server_ts,
                    ciphertext: ciphertext.clone(),
                });
                Ok(None)
            }
            Err(other) => Err(other),
        }
    }

    /// `add_inbound_from_backup` (§4.8 step 3 / §4.9): installs a session
    /// recovered from key backup, which has no companion Olm session. The
    /// caller resolves `sender_user` (e.g. via the Device Directory's
    /// curve-key lookup) since this adapter has no visibility into devices.
    pub async fn add_inbound_from_backup(
        &self,
        session_key: &vodozemac::megolm::SessionKey,
        sender_curve25519: Curve25519PublicKey,
        sender_user: OwnedUserId,
    ) -> MegolmResult<Vec<DecryptedRoomEvent>> {
        self.handle_room_key(session_key, sender_curve25519, sender_user, "BACKUP").await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use matrix_sdk_store_encryption::{PicklingKey, StoreCipher};
    use ruma::{event_id, room_id, user_id, MilliSecondsSinceUnixEpoch};
    use serde_json::json;

    use super::*;
    use crate::{
        olm::group_sessions::OutboundGroupSession, store::MemoryStore, types::EncryptionSettings,
    };

    fn cache(room_id: &ruma::RoomId) -> RoomEventCache {
        let store: Arc<dyn crate::store::CryptoStore> =
            Arc::new(MemoryStore::new(Arc::new(StoreCipher::new(&PicklingKey::new([5u8; 32])))));
        let group_store = Arc::new(GroupSessionStore::new(
            user_id!("@alice:example.org").to_owned(),
            Curve25519PublicKey::from_bytes([9u8; 32]),
            store,
        ));
        RoomEventCache::new(room_id.to_owned(), group_store)
    }

    #[tokio::test(flavor = "current_thread")]
    async fn event_before_its_session_is_queued_then_replayed() {
        let room = room_id!("!room:example.org");
        let cache = cache(room);

        let outbound = OutboundGroupSession::new(room, EncryptionSettings::default());
        let plaintext = json!({ "room_id": room, "type": "m.room.message", "content": {} }).to_string();
        let (ciphertext, _) = outbound.encrypt(&plaintext).await;

        let result = cache
            .decrypt(
                event_id!("$one:example.org"),
                user_id!("@bob:example.org"),
                MilliSecondsSinceUnixEpoch::now(),
                MEGOLM_ALGORITHM,
                outbound.session_id(),
                &ciphertext,
            )
            .await
            .unwrap();
        assert!(result.is_none());

        let session_key = outbound.session_key().await;
        let replayed = cache
            .handle_room_key(
                &session_key,
                Curve25519PublicKey::from_bytes([2u8; 32]),
                user_id!("@bob:example.org").to_owned(),
                "OLMSESSION1",
            )
            .await
            .unwrap();

        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].event_id.as_str(), "$one:example.org");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn mismatched_room_id_in_plaintext_is_rejected() {
        let room = room_id!("!room:example.org");
        let other_room = room_id!("!other:example.org");
        let cache = cache(room);

        let outbound = OutboundGroupSession::new(room, EncryptionSettings::default());
        let session_key = outbound.session_key().await;
        cache
            .handle_room_key(&session_key, Curve25519PublicKey::from_bytes([2u8; 32]), user_id!("@bob:example.org").to_owned(), "OLMSESSION1")
            .await
            .unwrap();

        let plaintext = json!({ "room_id": other_room, "type": "m.room.message", "content": {} }).to_string();
        let (ciphertext, _) = outbound.encrypt(&plaintext).await;

        let result = cache
            .decrypt(
                event_id!("$one:example.org"),
                user_id!("@bob:example.org"),
                MilliSecondsSinceUnixEpoch::now(),
                MEGOLM_ALGORITHM,
                outbound.session_id(),
                &ciphertext,
            )
            .await;

        assert!(matches!(result, Err(MegolmError::EventError(EventError::MismatchedRoom { .. }))));
    }
}
