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

//! End-to-end encryption core for a Matrix client: Olm 1:1 sessions, Megolm
//! group sessions, a device directory with replay/device-reuse defenses, a
//! Secret Storage (SSSS) unlock path, and the timeline glue that decrypts
//! incoming room events and redrives ones that arrived before their key.
//!
//! [`OlmMachine`] is the single entry point. It performs no I/O of its own:
//! it consumes sync deltas and to-device events, and produces
//! [`requests::OutgoingRequest`]s for the host application's transport to
//! execute, feeding responses back through the matching `receive_*` method.

pub mod error;
mod group_store;
pub mod identities;
mod machine;
pub mod olm;
mod olm_store;
pub mod primitives;
pub mod requests;
pub mod secret_storage;
pub mod store;
pub mod timeline;
pub mod types;

pub use error::{
    AccountBootstrapError, CryptoStoreError, DeviceKeyVerificationError, EventError, MegolmError,
    MegolmResult, OlmError, OlmResult, SecretStorageError, SignatureError,
};
pub use machine::{BackupKeyEntry, IncomingToDeviceEvent, OlmMachine, SyncInput, SyncOutput};
pub use requests::{IncomingResponse, OutgoingRequest, OutgoingRequests};
pub use timeline::DecryptedRoomEvent;
pub use types::{EncryptionSettings, OtkUploadSettings};
