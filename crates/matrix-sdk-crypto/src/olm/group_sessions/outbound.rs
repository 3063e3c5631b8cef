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

use std::{
    cmp::max,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};

use matrix_sdk_common::locks::Mutex;
use ruma::OwnedRoomId;
use serde::{Deserialize, Serialize};
use vodozemac::megolm::{GroupSession, GroupSessionPickle, MegolmMessage, SessionConfig, SessionKey};

use crate::types::EncryptionSettings;

/// The session a room currently uses to encrypt outgoing Megolm messages
/// (§3 "Outbound Megolm session", §4.6).
#[derive(Clone)]
pub struct OutboundGroupSession {
    room_id: Arc<ruma::RoomId>,
    session_id: Arc<str>,
    inner: Arc<Mutex<GroupSession>>,
    creation_time: SystemTime,
    message_count: Arc<AtomicU64>,
    settings: Arc<EncryptionSettings>,
}

impl std::fmt::Debug for OutboundGroupSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundGroupSession")
            .field("room_id", &self.room_id)
            .field("session_id", &self.session_id)
            .field("message_count", &self.message_count.load(Ordering::SeqCst))
            .finish()
    }
}

impl OutboundGroupSession {
    pub fn new(room_id: &ruma::RoomId, settings: EncryptionSettings) -> Self {
        let session = GroupSession::new(SessionConfig::version_2());
        let session_id = session.session_id();

        Self {
            room_id: room_id.into(),
            session_id: session_id.into(),
            inner: Arc::new(Mutex::new(session)),
            creation_time: SystemTime::now(),
            message_count: Arc::new(AtomicU64::new(0)),
            settings: Arc::new(settings),
        }
    }

    pub fn room_id(&self) -> &ruma::RoomId {
        &self.room_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn settings(&self) -> &EncryptionSettings {
        &self.settings
    }

    pub fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::SeqCst)
    }

    pub async fn session_key(&self) -> SessionKey {
        self.inner.lock().await.session_key()
    }

    /// Encrypt `plaintext`, returning the ciphertext and the message index it
    /// was encrypted at.
    pub async fn encrypt(&self, plaintext: &str) -> (MegolmMessage, u32) {
        let mut session = self.inner.lock().await;
        let message = session.encrypt(plaintext);
        let index = message.message_index();
        self.message_count.fetch_add(1, Ordering::SeqCst);
        (message, index)
    }

    fn elapsed(&self) -> bool {
        let rotation = max(self.settings.rotation_period, Duration::from_secs(3600));
        SystemTime::now().duration_since(self.creation_time).map(|e| e >= rotation).unwrap_or(true)
    }

    /// Rotation predicate (§4.6): message count reached the configured
    /// ceiling, or enough wall-clock time has passed.
    pub fn expired(&self) -> bool {
        self.message_count() >= self.settings.rotation_period_msgs || self.elapsed()
    }

    pub async fn pickle(&self) -> PickledOutboundGroupSession {
        PickledOutboundGroupSession {
            room_id: self.room_id.to_owned(),
            session_id: self.session_id.to_string(),
            pickle: self.inner.lock().await.pickle(),
            creation_time: self.creation_time,
            message_count: self.message_count(),
            settings: (*self.settings).clone(),
        }
    }

    pub fn from_pickle(pickle: PickledOutboundGroupSession) -> Self {
        Self {
            room_id: pickle.room_id.into(),
            session_id: pickle.session_id.into(),
            inner: Arc::new(Mutex::new(GroupSession::from_pickle(pickle.pickle))),
            creation_time: pickle.creation_time,
            message_count: Arc::new(AtomicU64::new(pickle.message_count)),
            settings: Arc::new(pickle.settings),
        }
    }
}

/// On-disk representation, persisted by the Encrypted Store as
/// `outbound_megolm(room_id PK, pickled, creation_time, message_count)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PickledOutboundGroupSession {
    pub room_id: OwnedRoomId,
    pub session_id: String,
    pub pickle: GroupSessionPickle,
    pub creation_time: SystemTime,
    pub message_count: u64,
    pub settings: EncryptionSettings,
}

#[cfg(test)]
mod tests {
    use ruma::room_id;

    use super::*;

    #[tokio::test(flavor = "current_thread")]
    async fn rotation_kicks_in_after_message_count() {
        let mut settings = EncryptionSettings::default();
        settings.rotation_period_msgs = 2;
        let session = OutboundGroupSession::new(room_id!("!room:example.org"), settings);

        assert!(!session.expired());
        session.encrypt("one").await;
        assert!(!session.expired());
        session.encrypt("two").await;
        assert!(session.expired());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn pickle_roundtrip_preserves_message_count() {
        let session = OutboundGroupSession::new(room_id!("!room:example.org"), EncryptionSettings::default());
        session.encrypt("one").await;

        let pickle = session.pickle().await;
        let restored = OutboundGroupSession::from_pickle(pickle);

        assert_eq!(restored.message_count(), 1);
        assert_eq!(restored.session_id(), session.session_id());
    }
}
