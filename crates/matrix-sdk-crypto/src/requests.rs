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

//! The outgoing-request types the Session Manager hands to the external
//! transport (§6). The transport executes the HTTP call and feeds the
//! matching response back through [`crate::OlmMachine`]'s `receive_*`
//! methods; this core never performs I/O itself.

use std::collections::BTreeMap;

use ruma::{api::client::keys::claim_keys, encryption::DeviceKeys, OwnedDeviceId, OwnedTransactionId, OwnedUserId};
use serde_json::Value;

use crate::types::MegolmEncryptedContent;

/// The one-time-key claim issued on `POST /keys/claim`, reusing `ruma`'s own
/// request/response shape since the wire format there is already
/// Client-Server-spec exact and worth getting for free.
pub type KeysClaimRequest = claim_keys::v3::Request;
pub type KeysClaimResponse = claim_keys::v3::Response;

/// A single outgoing `PUT /sendToDevice/{type}/{txnId}` request.
#[derive(Clone, Debug)]
pub struct ToDeviceRequest {
    pub txn_id: OwnedTransactionId,
    pub event_type: String,
    /// user -> device -> raw JSON content.
    pub messages: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, Value>>,
}

impl ToDeviceRequest {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            txn_id: OwnedTransactionId::from(ruma::TransactionId::new()),
            event_type: event_type.into(),
            messages: BTreeMap::new(),
        }
    }

    pub fn add_recipient(&mut self, user_id: OwnedUserId, device_id: OwnedDeviceId, content: Value) {
        self.messages.entry(user_id).or_default().insert(device_id, content);
    }
}

/// A `PUT /rooms/{roomId}/send/m.room.encrypted/{txnId}` request carrying a
/// Megolm-encrypted room event.
#[derive(Clone, Debug)]
pub struct RoomMessageRequest {
    pub txn_id: OwnedTransactionId,
    pub room_id: ruma::OwnedRoomId,
    pub content: MegolmEncryptedContent,
}

/// The device-keys bundle plus signed one-time keys uploaded on
/// `POST /keys/upload`, built from the local account's identity keys.
#[derive(Clone, Debug)]
pub struct UploadKeysRequest {
    pub device_keys: Option<DeviceKeys>,
    pub one_time_keys: BTreeMap<String, Value>,
}

/// `POST /keys/query`.
#[derive(Clone, Debug)]
pub struct KeysQueryRequest {
    pub users: Vec<OwnedUserId>,
}

/// `GET /room_keys/version` — fetch the current key-backup version metadata.
#[derive(Clone, Debug)]
pub struct KeysBackupVersionRequest;

/// `GET /room_keys/keys?version=...` — fetch every backed-up session.
#[derive(Clone, Debug)]
pub struct KeysBackupRequest {
    pub version: String,
}

/// Every kind of outgoing request the Session Manager can produce, tagged so
/// a single queue can hold them uniformly (§9 "dynamic dispatch" applies
/// equally to outbound plumbing).
#[derive(Clone, Debug)]
pub enum OutgoingRequests {
    KeysUpload(UploadKeysRequest),
    KeysQuery(KeysQueryRequest),
    KeysClaim(KeysClaimRequest),
    ToDevice(ToDeviceRequest),
    RoomMessage(RoomMessageRequest),
    KeysBackupVersion(KeysBackupVersionRequest),
    KeysBackup(KeysBackupRequest),
}

/// An outgoing request together with the id the caller must echo back via
/// the matching `receive_*` call so the core can correlate the response.
#[derive(Clone, Debug)]
pub struct OutgoingRequest {
    pub request_id: OwnedTransactionId,
    pub request: OutgoingRequests,
}

/// `PUT /sendToDevice/m.room.encrypted/{txnId}` convenience constructor used
/// by the broken-session recovery and room-key distribution paths.
pub fn olm_to_device_request(
    user_id: &ruma::UserId,
    device_id: &ruma::DeviceId,
    content: Value,
) -> ToDeviceRequest {
    let mut request = ToDeviceRequest::new("m.room.encrypted");
    request.add_recipient(user_id.to_owned(), device_id.to_owned(), content);
    request
}

/// The server-side responses the Session Manager consumes, mirroring
/// [`OutgoingRequests`] one-to-one so a caller can route a response back
/// without re-deriving which request it answers.
#[derive(Debug)]
pub enum IncomingResponse {
    KeysUpload { one_time_keys_counts: BTreeMap<String, u64> },
    KeysQuery { device_keys: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, DeviceKeys>> },
    KeysClaim(KeysClaimResponse),
    ToDevice,
    RoomMessage { event_id: ruma::OwnedEventId },
    KeysBackupVersion { version: String, etag: String, auth_data: Value },
    KeysBackup { rooms: Value },
}
