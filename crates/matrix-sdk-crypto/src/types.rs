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

//! Wire-format types for the events and account-data objects this core reads
//! and writes directly (§6).

use std::collections::BTreeMap;

use ruma::{OwnedDeviceId, OwnedRoomId, OwnedUserId};
use serde::{Deserialize, Serialize};

/// The two `m.room.encrypted` algorithms this core supports.
pub const OLM_ALGORITHM: &str = "m.olm.v1.curve25519-aes-sha2";
pub const MEGOLM_ALGORITHM: &str = "m.megolm.v1.aes-sha2";

/// One Olm ciphertext, addressed to a single recipient Curve25519 key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OlmCiphertext {
    /// `0` for a normal message, `1` for a pre-key message.
    #[serde(rename = "type")]
    pub message_type: u8,
    /// Base64 (or the library's native ascii encoding) ciphertext body.
    pub body: String,
}

/// `m.room.encrypted` content using the Olm (to-device) algorithm.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OlmEncryptedContent {
    pub algorithm: String,
    pub sender_key: String,
    pub ciphertext: BTreeMap<String, OlmCiphertext>,
}

/// `m.room.encrypted` content using the Megolm (room) algorithm.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MegolmEncryptedContent {
    pub algorithm: String,
    pub sender_key: String,
    pub device_id: OwnedDeviceId,
    pub session_id: String,
    pub ciphertext: String,
    #[serde(rename = "m.relates_to", skip_serializing_if = "Option::is_none")]
    pub relates_to: Option<serde_json::Value>,
}

/// The plaintext `m.room_key` event carried inside a decrypted Olm payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoomKeyContent {
    pub algorithm: String,
    pub room_id: OwnedRoomId,
    pub session_id: String,
    pub session_key: String,
}

/// The Ed25519 identity-key pair quoted in an Olm plaintext envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvelopeKeys {
    pub ed25519: String,
}

/// Every Olm plaintext payload carries these fields regardless of its inner
/// `content`/`type`; recipient-side validation rejects a mismatch against any
/// of them (§6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OlmPlaintextEnvelope {
    #[serde(rename = "type")]
    pub event_type: String,
    pub content: serde_json::Value,
    pub sender: OwnedUserId,
    pub recipient: OwnedUserId,
    pub keys: EnvelopeKeys,
    pub recipient_keys: EnvelopeKeys,
}

/// The tagged sum of to-device event kinds this core dispatches on, per §9's
/// "dynamic dispatch over event types" design note.
#[derive(Clone, Debug)]
pub enum ToDeviceEvent {
    RoomKey { sender_user: OwnedUserId, content: RoomKeyContent, olm_session_id: String },
    Dummy,
    KeyVerificationRequest(serde_json::Value),
    KeyVerificationDone(serde_json::Value),
    KeyVerificationOther(serde_json::Value),
    Unknown { event_type: String },
}

/// `m.secret_storage.key.<name>` account-data content.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SecretStorageKeyDescription {
    pub algorithm: String,
    pub iv: String,
    pub mac: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<SecretStoragePassphraseInfo>,
}

/// The `passphrase` sub-object of a key description, present only for
/// passphrase-derived keys.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SecretStoragePassphraseInfo {
    pub algorithm: String,
    pub salt: String,
    pub iterations: u32,
}

/// `m.secret_storage.default_key` account-data content.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SecretStorageDefaultKeyContent {
    pub key: String,
}

/// One secret, encrypted under one key description, as stored in the
/// `encrypted` map of a secret's account-data content.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncryptedSecret {
    pub ciphertext: String,
    pub iv: String,
    pub mac: String,
}

/// `{ encrypted: { <key_name>: EncryptedSecret } }` — the shape of every
/// SSSS-managed secret's account-data content.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SecretBlob {
    pub encrypted: BTreeMap<String, EncryptedSecret>,
}

/// Tunable parameters for outbound Megolm session lifecycle, following the
/// teacher's `EncryptionSettings` shape exactly.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncryptionSettings {
    pub algorithm: String,
    pub rotation_period: std::time::Duration,
    pub rotation_period_msgs: u64,
    pub history_visibility: HistoryVisibility,
}

impl Default for EncryptionSettings {
    fn default() -> Self {
        Self {
            algorithm: MEGOLM_ALGORITHM.to_owned(),
            rotation_period: std::time::Duration::from_millis(604_800_000),
            rotation_period_msgs: 100,
            history_visibility: HistoryVisibility::Shared,
        }
    }
}

/// Coarse room-history-visibility, recorded alongside an outbound session for
/// callers that need to reason about who can read backfilled history.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistoryVisibility {
    Invited,
    Joined,
    Shared,
    WorldReadable,
}

/// One-time-key upload tuning, exposed as machine-construction parameters
/// rather than hardcoded (§4.7 Ready/UploadingOTKs transition).
#[derive(Clone, Copy, Debug)]
pub struct OtkUploadSettings {
    pub max_one_time_keys: u64,
    /// Upload is triggered when the server-reported count falls strictly
    /// below `threshold_ratio * max_one_time_keys` (§8: at exactly 0.4x, no
    /// upload starts).
    pub threshold_ratio: f64,
}

impl Default for OtkUploadSettings {
    fn default() -> Self {
        Self { max_one_time_keys: 50, threshold_ratio: 0.4 }
    }
}
