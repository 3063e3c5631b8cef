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

use matrix_sdk_store_encryption::KeychainError;
use ruma::{DeviceKeyId, OwnedDeviceId, OwnedRoomId, OwnedUserId};
use serde_json::Error as SerdeError;
use thiserror::Error;

/// Convenience alias for the result of a 1:1 Olm operation.
pub type OlmResult<T> = Result<T, OlmError>;
/// Convenience alias for the result of a group (Megolm) operation.
pub type MegolmResult<T> = Result<T, MegolmError>;

/// Error representing a failure during a device-to-device (Olm) operation.
#[derive(Error, Debug)]
pub enum OlmError {
    /// The event that should have been decrypted is malformed.
    #[error(transparent)]
    EventError(#[from] EventError),

    /// The received decrypted event couldn't be deserialized.
    #[error(transparent)]
    JsonError(#[from] SerdeError),

    /// The underlying Olm session operation returned an error.
    #[error("can't finish an Olm session operation: {0}")]
    OlmSession(#[from] vodozemac::olm::SessionCreationError),

    /// The underlying Olm decryption operation returned an error.
    #[error("can't decrypt with the Olm session: {0}")]
    OlmDecryption(#[from] vodozemac::olm::DecryptionError),

    /// The storage layer returned an error.
    #[error("failed to read or write to the crypto store: {0}")]
    Store(#[from] CryptoStoreError),

    /// Decryption failed against every session we hold for the sender, and
    /// the message wasn't a pre-key message so no new session could be
    /// established either. This is the "broken session" condition of §4.5
    /// step 4 / §4.7 broken-session recovery.
    #[error("decryption failed against all known sessions for sender key {0}")]
    SessionWedged(String),

    /// Encryption was attempted but the device has no Olm session with us.
    #[error("encryption failed because the device does not have a valid Olm session with us")]
    MissingSession,
}

/// Error representing a failure during a group (Megolm) encryption
/// operation.
#[derive(Error, Debug)]
pub enum MegolmError {
    /// The event that should have been decrypted is malformed.
    #[error(transparent)]
    EventError(#[from] EventError),

    /// The received decrypted event couldn't be deserialized.
    #[error(transparent)]
    JsonError(#[from] SerdeError),

    /// Decryption failed because the inbound session needed to decrypt the
    /// event isn't installed yet (§4.6 `UnknownSession`, §7 class 5). The
    /// caller queues the event by `session_id` rather than treating this as
    /// a hard error.
    #[error("decryption failed because the session to decrypt the message is missing")]
    MissingSession,

    /// The underlying group session operation returned an error.
    #[error("can't finish a group session operation: {0}")]
    Decryption(#[from] vodozemac::megolm::DecryptionError),

    /// The message index for this session/index pair was already recorded
    /// with a different event id or timestamp (§3 Message-index record, §4.6
    /// replay protection).
    #[error("the message at session {session_id} index {index} was already decrypted with a different event id or timestamp (replay detected)")]
    ReplayDetected {
        /// The id of the session the replay was detected on.
        session_id: String,
        /// The message index that was replayed.
        index: u32,
    },

    /// The sender recorded for this inbound session doesn't match the
    /// sender of the event being decrypted.
    #[error("the sender of the event doesn't match the sender the inbound session was created for")]
    MismatchedSender,

    /// The room where a group session should be shared is not encrypted.
    #[error("the room where a group session should be shared is not encrypted")]
    EncryptionNotEnabled,

    /// The storage layer returned an error.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),
}

/// Errors about the shape of an encrypted event itself, as opposed to the
/// cryptographic operation performed on it.
#[derive(Error, Debug)]
pub enum EventError {
    /// The `m.room.encrypted` event used an algorithm we don't support.
    #[error("the encrypted event used an unsupported algorithm")]
    UnsupportedAlgorithm,

    /// The encrypted event doesn't contain a ciphertext addressed to us.
    #[error("the encrypted event doesn't contain a ciphertext for our device")]
    MissingCiphertext,

    /// The encrypted event is missing the sender's identity key.
    #[error("the encrypted event is missing the sender key")]
    MissingSenderKey,

    /// A required field was absent from the plaintext payload.
    #[error("the decrypted event is missing the field {0}")]
    MissingField(&'static str),

    /// The plaintext envelope's `sender`/`recipient`/key fields don't match
    /// our local identity (§6 "Recipient-side validation MUST reject
    /// mismatches").
    #[error("the sender or recipient fields of the decrypted Olm payload don't match our identity")]
    MismatchedSender,

    /// The `room_id` embedded in a decrypted Megolm event doesn't match the
    /// room the `m.room.encrypted` event was received in (§4.9).
    #[error("the room id of the decrypted event ({event_room_id}) doesn't match the room it was received in ({expected_room_id})")]
    MismatchedRoom {
        /// The room the encrypted envelope was received in.
        expected_room_id: OwnedRoomId,
        /// The room id embedded in the decrypted plaintext.
        event_room_id: OwnedRoomId,
    },
}

/// Error type describing the different ways that checking or creating a
/// signature over a canonical JSON object can fail.
#[derive(Error, Debug)]
pub enum SignatureError {
    /// The signature was made using an unsupported algorithm.
    #[error("the signature used an unsupported algorithm")]
    UnsupportedAlgorithm,

    /// The signing key was missing from the object that should carry it.
    #[error("the signing key is missing for key id {0}")]
    MissingSigningKey(Box<DeviceKeyId>),

    /// The provided value wasn't a JSON object, so it can't be canonicalized.
    #[error("the provided JSON value isn't an object")]
    NotAnObject,

    /// The object did not carry a `signatures` member at all.
    #[error("the provided JSON object doesn't contain a signatures field")]
    NoSignatureFound,

    /// The signature didn't verify against the given key.
    #[error("the signature didn't match the provided key")]
    VerificationError,

    /// The signed object couldn't be serialized into canonical JSON.
    #[error(transparent)]
    JsonError(#[from] SerdeError),
}

impl From<MegolmError> for OlmError {
    fn from(error: MegolmError) -> Self {
        match error {
            MegolmError::EventError(e) => OlmError::EventError(e),
            MegolmError::JsonError(e) => OlmError::JsonError(e),
            MegolmError::Store(e) => OlmError::Store(e),
            other => OlmError::Store(CryptoStoreError::Backend(other.to_string())),
        }
    }
}

/// Errors from the Encrypted Store (C3).
#[derive(Error, Debug)]
pub enum CryptoStoreError {
    /// A lower-level (de)serialization error while reading or writing a
    /// pickle.
    #[error("error serializing or deserializing crypto data: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Saving an inbound Megolm session whose `session_id` already exists.
    /// Per §3, a second attempt to add the same `session_id` is a no-op that
    /// reports failure rather than overwriting the existing session.
    #[error("an inbound group session with id {0} already exists")]
    DuplicateSession(String),

    /// A generic backend I/O failure.
    #[error("crypto store backend error: {0}")]
    Backend(String),
}

/// Errors from the [`PicklingKeyProvider`](matrix_sdk_store_encryption::PicklingKeyProvider),
/// surfaced as configuration faults (§7 class 1).
#[derive(Error, Debug)]
pub enum AccountBootstrapError {
    /// The pickling key couldn't be obtained.
    #[error(transparent)]
    Keychain(#[from] KeychainError),

    /// Restoring the pickled Olm account from the store failed.
    #[error("failed to unpickle the stored Olm account: {0}")]
    Unpickle(#[from] vodozemac::olm::SessionCreationError),

    /// The storage layer returned an error.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),
}

/// Errors from the device-reuse / algorithm / signature checks performed
/// while admitting a `/keys/query` response (§4.4).
#[derive(Error, Debug)]
pub enum DeviceKeyVerificationError {
    /// The device id embedded in the key object didn't match the map key it
    /// was returned under.
    #[error("device {device_id} in the response for {user_id} doesn't match the map it was returned under")]
    UserIdMismatch {
        /// The user id the response claimed to be for.
        user_id: OwnedUserId,
        /// The device id that carried a different user id.
        device_id: OwnedDeviceId,
    },

    /// The device's self-signature over its own key bundle didn't verify.
    #[error(transparent)]
    Signature(#[from] SignatureError),

    /// The device listed an algorithm this core doesn't support.
    #[error("device {1} of {0} listed an unsupported algorithm")]
    UnsupportedAlgorithm(OwnedUserId, OwnedDeviceId),

    /// A previously-admitted device changed its Ed25519 identity key — the
    /// device-reuse defense of §3/§4.4 step 4/§8.
    #[error("device {device_id} of {user_id} changed its ed25519 key, rejecting as a device-reuse attempt")]
    DeviceReuse {
        /// The affected user.
        user_id: OwnedUserId,
        /// The affected device.
        device_id: OwnedDeviceId,
    },
}

/// The five terminal failure modes of the SSSS unlock flow (§4.8, §7).
#[derive(Error, Debug)]
pub enum SecretStorageError {
    /// No `m.secret_storage.default_key` (or named key) account data was
    /// found.
    #[error("no secret storage key description found")]
    NoKey,

    /// The key description (or its passphrase sub-object) names an
    /// algorithm this core doesn't implement.
    #[error("unsupported secret storage algorithm")]
    UnsupportedAlgorithm,

    /// The derived/decoded key failed the stored test-MAC, or (for a
    /// recovery key) failed its length/prefix/parity checks.
    #[error("the provided passphrase or recovery key is incorrect")]
    WrongKey,

    /// A per-secret MAC check or AES-CTR decryption failed.
    #[error("failed to decrypt a secret: {0}")]
    Decryption(String),

    /// A key-backup auth-data signature didn't verify against any known
    /// device or cross-signing key.
    #[error("the key backup auth data signature is invalid")]
    InvalidSignature,

    /// The storage layer returned an error.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),
}
