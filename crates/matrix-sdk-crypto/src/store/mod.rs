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

//! The Encrypted Store (C3): the persistence surface every other component
//! reads through and writes through, per spec.md §4.3.

pub mod memory;

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use ruma::{OwnedDeviceId, OwnedRoomId, OwnedUserId};

use crate::{
    error::CryptoStoreError,
    identities::DeviceRecord,
    olm::{
        account::PickledAccount,
        group_sessions::{PickledInboundGroupSession, PickledOutboundGroupSession},
        session::PickledSession,
    },
};

pub use memory::MemoryStore;

/// Convenience alias for a fallible store operation.
pub type Result<T> = std::result::Result<T, CryptoStoreError>;

/// Whether the Olm account found on load already existed or was created for
/// the caller (§4.7 `LoadingAccount`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountLoadResult {
    /// A pickled account already existed and was returned unchanged.
    Unchanged,
    /// No account existed; a fresh one was created by the caller and is
    /// being persisted for the first time via [`CryptoStore::save_olm_account`].
    Created,
}

/// A batch of mutations accumulated over the course of handling one sync
/// response or one explicit operation, written to the store as a single
/// transaction (§5 "Shared-resource policy", §4.3 "All multi-statement
/// changes run inside a single transaction").
#[derive(Debug, Default)]
pub struct PendingChanges {
    pub olm_account: Option<PickledAccount>,
    pub olm_sessions: Vec<PickledSession>,
    pub inbound_group_sessions: Vec<PickledInboundGroupSession>,
    pub outbound_group_sessions: Vec<PickledOutboundGroupSession>,
    pub devices: Vec<DeviceRecord>,
    pub tracked_users: BTreeSet<OwnedUserId>,
    pub outdated_users: BTreeSet<OwnedUserId>,
    pub removed_users: BTreeSet<OwnedUserId>,
}

impl PendingChanges {
    pub fn is_empty(&self) -> bool {
        self.olm_account.is_none()
            && self.olm_sessions.is_empty()
            && self.inbound_group_sessions.is_empty()
            && self.outbound_group_sessions.is_empty()
            && self.devices.is_empty()
            && self.tracked_users.is_empty()
            && self.outdated_users.is_empty()
            && self.removed_users.is_empty()
    }
}

/// An accepted record in the replay-protection index, or the record that was
/// already there when a conflicting one was rejected (§3 "Message-index
/// record", §4.6 `decrypt`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageIndexRecord {
    pub event_id: ruma::OwnedEventId,
    pub origin_server_ts: ruma::MilliSecondsSinceUnixEpoch,
}

/// The persistence surface of the core (§4.3). Every method is transactional
/// with respect to the tables it touches; [`CryptoStore::save_changes`] is
/// the only way to persist a batch that spans multiple tables at once.
#[async_trait]
pub trait CryptoStore: std::fmt::Debug + Send + Sync {
    /// Load the pickled Olm account, if one has ever been saved.
    async fn load_olm_account(&self) -> Result<Option<PickledAccount>>;

    /// Apply a batch of accumulated mutations as a single transaction.
    async fn save_changes(&self, changes: PendingChanges) -> Result<()>;

    /// Every Olm session currently stored, keyed by peer Curve25519 key.
    async fn load_olm_sessions(&self) -> Result<BTreeMap<String, Vec<PickledSession>>>;

    /// Every inbound Megolm session stored for `room_id`.
    async fn load_room_megolm_sessions(
        &self,
        room_id: &ruma::RoomId,
    ) -> Result<BTreeMap<String, PickledInboundGroupSession>>;

    /// The current outbound Megolm session for `room_id`, if any.
    async fn load_current_outbound_megolm_session(
        &self,
        room_id: &ruma::RoomId,
    ) -> Result<Option<PickledOutboundGroupSession>>;

    /// Look up a previously recorded replay-index entry.
    async fn group_session_index_record(
        &self,
        room_id: &ruma::RoomId,
        session_id: &str,
        message_index: u32,
    ) -> Result<Option<MessageIndexRecord>>;

    /// Record a replay-index entry the first time `message_index` is seen.
    async fn add_group_session_index_record(
        &self,
        room_id: &ruma::RoomId,
        session_id: &str,
        message_index: u32,
        record: MessageIndexRecord,
    ) -> Result<()>;

    async fn tracked_users(&self) -> Result<BTreeSet<OwnedUserId>>;
    async fn outdated_users(&self) -> Result<BTreeSet<OwnedUserId>>;
    async fn tracked_devices(&self) -> Result<Vec<DeviceRecord>>;

    /// For the candidate `(user, device)` pairs, the subset that has not yet
    /// been recorded as having received the current session key (§4.6
    /// `devices_without_key`).
    async fn devices_without_key(
        &self,
        room_id: &ruma::RoomId,
        candidate_devices: &[(OwnedUserId, OwnedDeviceId)],
        session_id: &str,
    ) -> Result<Vec<(OwnedUserId, OwnedDeviceId)>>;

    /// Record that the given devices have now received `session_id` at
    /// `message_index`.
    async fn set_devices_received_key(
        &self,
        room_id: &ruma::RoomId,
        devices: &[(OwnedUserId, OwnedDeviceId, String)],
        session_id: &str,
        message_index: u32,
    ) -> Result<()>;

    /// Look up a device's Ed25519 signing key by bare device id (no
    /// `algorithm:` prefix), for key-backup signature-verification lookups
    /// (§4.8 step 2).
    async fn ed_key_for_key_id(&self, user_id: &ruma::UserId, device_id: &str) -> Result<Option<String>>;

    /// Drop every table entry scoped to `room_id` (room destruction).
    async fn clear_room_data(&self, room_id: &ruma::RoomId) -> Result<()>;

    /// Store an arbitrary encrypted blob under `name` (SSSS-derived secrets,
    /// the key-backup `etag`).
    async fn store_encrypted(&self, name: &str, bytes: Vec<u8>) -> Result<()>;

    /// Load a blob previously written by [`Self::store_encrypted`].
    async fn load_encrypted(&self, name: &str) -> Result<Option<Vec<u8>>>;
}
