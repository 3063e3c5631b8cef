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

//! The Session Manager (C7): [`OlmMachine`], the single entry point that
//! ties the Olm account, device directory, Olm session store, group session
//! store and timeline adapter together into the bootstrap state machine and
//! sync-response pipeline of spec.md §4.7.
//!
//! This core performs no I/O. Every state transition that needs the network
//! produces an [`OutgoingRequest`] queued for the caller to drain via
//! [`OlmMachine::outgoing_requests`]; the caller executes it and feeds the
//! result back through the matching `receive_*` method, correlated by
//! `request_id` (see `requests.rs`).

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use matrix_sdk_common::locks::Mutex;
use ruma::{
    encryption::DeviceKeys, DeviceKeyAlgorithm, MilliSecondsSinceUnixEpoch, OwnedDeviceId,
    OwnedRoomId, OwnedTransactionId, OwnedUserId,
};
use serde_json::Value;
use tracing::{debug, info, warn};
use vodozemac::{
    megolm::{MegolmMessage, SessionKey},
    Curve25519PublicKey,
};

use crate::{
    error::{
        AccountBootstrapError, CryptoStoreError, EventError, MegolmError, OlmError, OlmResult,
        SecretStorageError,
    },
    group_store::GroupSessionStore,
    identities::{DeviceDirectory, DeviceRecord},
    olm::{
        account::{PickledAccount, ReadOnlyAccount},
        session::{PickledSession, Session},
    },
    olm_store::{OlmSessionStore, TriedDevices},
    requests::{
        olm_to_device_request, KeysClaimRequest, KeysClaimResponse, KeysQueryRequest,
        OutgoingRequest, OutgoingRequests, ToDeviceRequest, UploadKeysRequest,
    },
    secret_storage::{self, SecretStorageUnlocker},
    store::{AccountLoadResult, CryptoStore, PendingChanges},
    timeline::{DecryptedRoomEvent, RoomEventCache},
    types::{
        EncryptionSettings, EnvelopeKeys, MegolmEncryptedContent, OlmCiphertext,
        OlmEncryptedContent, OlmPlaintextEnvelope, OtkUploadSettings, RoomKeyContent, ToDeviceEvent,
        MEGOLM_ALGORITHM, OLM_ALGORITHM,
    },
};

/// One inbound `/sync` to-device event, already unwrapped from the
/// transport's event envelope but not yet decrypted.
#[derive(Clone, Debug)]
pub struct IncomingToDeviceEvent {
    pub sender: OwnedUserId,
    pub event_type: String,
    pub content: Value,
}

/// One session entry from `GET /room_keys/keys` (§4.8 step 3), still under
/// its hybrid Curve25519+AES-SHA2 backup encryption.
#[derive(Clone, Debug)]
pub struct BackupKeyEntry {
    pub ciphertext: String,
    pub ephemeral: String,
    pub mac: String,
}

/// Everything a sync loop collects for one `/sync` response, in the order
/// §5 processes it: one-time-key count, then device-list delta, then any
/// rooms that need forced Megolm rotation, then to-device events. Room
/// state/timeline events are decrypted per-event through
/// [`OlmMachine::decrypt_room_event`] rather than folded into this input,
/// since a caller needs each event's plaintext back individually to update
/// its own timeline.
#[derive(Clone, Debug, Default)]
pub struct SyncInput {
    pub one_time_keys_counts: BTreeMap<String, u64>,
    pub device_list_changed: Vec<OwnedUserId>,
    pub device_list_left: Vec<OwnedUserId>,
    pub rooms_needing_rotation: Vec<OwnedRoomId>,
    pub to_device_events: Vec<IncomingToDeviceEvent>,
}

/// The result of [`OlmMachine::process_sync`]: any previously-queued Megolm
/// events that a room key delivered in this batch of to-device events
/// retroactively unlocked.
#[derive(Debug, Default)]
pub struct SyncOutput {
    pub replayed_room_events: Vec<DecryptedRoomEvent>,
}

struct PendingToDeviceEvent {
    sender: OwnedUserId,
    sender_curve25519: String,
    message_type: u8,
    body: String,
}

/// An outstanding `send_session_key_to_devices` call waiting on a
/// `/keys/claim` round trip before it can proceed (§4.7 Outbound room-key
/// distribution, step 2).
struct PendingRoomKeyDistribution {
    room_id: OwnedRoomId,
    session_id: String,
    session_key: String,
    message_index: u32,
    devices: Vec<(OwnedUserId, OwnedDeviceId)>,
}

/// The Session Manager: the public entry point of this crate (§4.7).
///
/// Every field that needs interior mutability is behind a lock rather than
/// requiring `&mut self`, so the whole API takes `&self` and can be driven
/// concurrently by a transport loop and an application thread at once.
pub struct OlmMachine {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    account: Mutex<ReadOnlyAccount>,
    uploaded_device_keys: AtomicBool,
    otk_upload_in_flight: AtomicBool,
    query_in_flight: AtomicBool,
    first_sync_done: AtomicBool,
    sessions: OlmSessionStore,
    tried_devices: TriedDevices,
    directory: Mutex<DeviceDirectory>,
    group_store: Arc<GroupSessionStore>,
    rooms: Mutex<BTreeMap<OwnedRoomId, Arc<RoomEventCache>>>,
    store: Arc<dyn CryptoStore>,
    otk_settings: OtkUploadSettings,
    outgoing: Mutex<Vec<OutgoingRequest>>,
    pending_encrypted_to_device: Mutex<Vec<PendingToDeviceEvent>>,
    deferred_key_distribution: Mutex<Vec<PendingRoomKeyDistribution>>,
    broken_session_requests: Mutex<BTreeMap<OwnedTransactionId, (OwnedUserId, OwnedDeviceId)>>,
    pending_distributions: Mutex<BTreeMap<OwnedTransactionId, PendingRoomKeyDistribution>>,
}

impl std::fmt::Debug for OlmMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OlmMachine")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

impl OlmMachine {
    /// Bootstrap (§4.7 `Cold` → `LoadingAccount`). Loads or creates the Olm
    /// account, rehydrates the device directory and Olm session store from
    /// `store`, and if the account was just created, queues the initial
    /// `device_keys` upload and starts tracking our own user.
    pub async fn new(
        user_id: &ruma::UserId,
        device_id: &ruma::DeviceId,
        store: Arc<dyn CryptoStore>,
        otk_settings: OtkUploadSettings,
    ) -> Result<Self, AccountBootstrapError> {
        let (account, load_result, uploaded_device_keys) = match store.load_olm_account().await? {
            Some(pickled) => {
                let account =
                    ReadOnlyAccount::from_pickle(&pickled.user_id, &pickled.device_id, pickled.pickle)?;
                (account, AccountLoadResult::Unchanged, pickled.uploaded_device_keys)
            }
            None => {
                let account = ReadOnlyAccount::new(user_id, device_id);
                store
                    .save_changes(PendingChanges {
                        olm_account: Some(PickledAccount {
                            user_id: user_id.to_owned(),
                            device_id: device_id.to_owned(),
                            pickle: account.pickle(),
                            uploaded_device_keys: false,
                        }),
                        ..Default::default()
                    })
                    .await?;
                (account, AccountLoadResult::Created, false)
            }
        };

        let directory = DeviceDirectory::restore(
            store.tracked_devices().await?,
            store.tracked_users().await?,
            store.outdated_users().await?,
        );

        let mut sessions = Vec::new();
        for pickled in store.load_olm_sessions().await?.into_values().flatten() {
            match Curve25519PublicKey::from_base64(&pickled.their_identity_key) {
                Ok(their_identity_key) => sessions.push(Session::from_pickle(
                    pickled.user_id,
                    pickled.device_id,
                    pickled.our_identity_keys_curve25519,
                    their_identity_key,
                    pickled.creation_time,
                    pickled.pickle,
                )),
                Err(error) => {
                    warn!(%error, "dropping a stored Olm session with an unparsable identity key")
                }
            }
        }

        let group_store =
            Arc::new(GroupSessionStore::new(user_id.to_owned(), account.curve25519_key(), store.clone()));

        let machine = Self {
            user_id: user_id.to_owned(),
            device_id: device_id.to_owned(),
            account: Mutex::new(account),
            uploaded_device_keys: AtomicBool::new(uploaded_device_keys),
            otk_upload_in_flight: AtomicBool::new(false),
            query_in_flight: AtomicBool::new(false),
            first_sync_done: AtomicBool::new(false),
            sessions: OlmSessionStore::restore(sessions),
            tried_devices: TriedDevices::new(),
            directory: Mutex::new(directory),
            group_store,
            rooms: Mutex::new(BTreeMap::new()),
            store,
            otk_settings,
            outgoing: Mutex::new(Vec::new()),
            pending_encrypted_to_device: Mutex::new(Vec::new()),
            deferred_key_distribution: Mutex::new(Vec::new()),
            broken_session_requests: Mutex::new(BTreeMap::new()),
            pending_distributions: Mutex::new(BTreeMap::new()),
        };

        if load_result == AccountLoadResult::Created {
            machine.queue_initial_keys_upload().await;

            let (tracked, outdated) = {
                let mut directory = machine.directory.lock().await;
                directory.track_user(user_id.to_owned());
                (directory.tracked_users().clone(), directory.outdated_users().clone())
            };
            machine
                .store
                .save_changes(PendingChanges { tracked_users: tracked, outdated_users: outdated, ..Default::default() })
                .await?;
        }

        Ok(machine)
    }

    pub fn user_id(&self) -> &ruma::UserId {
        &self.user_id
    }

    pub fn device_id(&self) -> &ruma::DeviceId {
        &self.device_id
    }

    pub(crate) fn group_store(&self) -> &Arc<GroupSessionStore> {
        &self.group_store
    }

    pub(crate) fn store(&self) -> &Arc<dyn CryptoStore> {
        &self.store
    }

    pub(crate) async fn device_directory(&self) -> tokio::sync::MutexGuard<'_, DeviceDirectory> {
        self.directory.lock().await
    }

    /// The Olm account's own identity keys, for display or cross-signing
    /// bootstrap elsewhere.
    pub async fn identity_keys(&self) -> crate::olm::account::IdentityKeys {
        self.account.lock().await.identity_keys()
    }

    /// Drain every request queued so far, for the caller's transport to
    /// execute. Requests are not re-queued if the caller drops them; the
    /// next relevant state transition queues a fresh one.
    pub async fn outgoing_requests(&self) -> Vec<OutgoingRequest> {
        std::mem::take(&mut *self.outgoing.lock().await)
    }

    async fn queue(&self, request: OutgoingRequests) -> OwnedTransactionId {
        let request_id = OwnedTransactionId::from(ruma::TransactionId::new());
        self.outgoing.lock().await.push(OutgoingRequest { request_id: request_id.clone(), request });
        request_id
    }

    fn pickle_account(&self, account: &ReadOnlyAccount) -> PickledAccount {
        PickledAccount {
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            pickle: account.pickle(),
            uploaded_device_keys: self.uploaded_device_keys.load(Ordering::SeqCst),
        }
    }

    async fn persist_sessions_for(&self, curve25519: Curve25519PublicKey) -> OlmResult<()> {
        let sessions = self.sessions.sessions_for(curve25519).await;
        let mut pickled_sessions = Vec::with_capacity(sessions.len());
        for session in &sessions {
            pickled_sessions.push(PickledSession {
                user_id: session.user_id.clone(),
                device_id: session.device_id.clone(),
                our_identity_keys_curve25519: session.our_identity_keys_curve25519.clone(),
                their_identity_key: session.their_identity_key.to_base64(),
                creation_time: session.creation_time,
                pickle: session.pickle().await,
            });
        }
        self.store.save_changes(PendingChanges { olm_sessions: pickled_sessions, ..Default::default() }).await?;
        Ok(())
    }

    async fn persist_account_and_sessions(
        &self,
        curve25519: Curve25519PublicKey,
        pickled_account: PickledAccount,
    ) -> OlmResult<()> {
        let sessions = self.sessions.sessions_for(curve25519).await;
        let mut pickled_sessions = Vec::with_capacity(sessions.len());
        for session in &sessions {
            pickled_sessions.push(PickledSession {
                user_id: session.user_id.clone(),
                device_id: session.device_id.clone(),
                our_identity_keys_curve25519: session.our_identity_keys_curve25519.clone(),
                their_identity_key: session.their_identity_key.to_base64(),
                creation_time: session.creation_time,
                pickle: session.pickle().await,
            });
        }
        self.store
            .save_changes(PendingChanges {
                olm_account: Some(pickled_account),
                olm_sessions: pickled_sessions,
                ..Default::default()
            })
            .await?;
        Ok(())
    }

    async fn queue_initial_keys_upload(&self) {
        let bundle = self.account.lock().await.device_keys();
        let device_keys: DeviceKeys = serde_json::from_value(bundle)
            .expect("our own signed device-keys bundle always matches the wire shape");
        self.queue(OutgoingRequests::KeysUpload(UploadKeysRequest {
            device_keys: Some(device_keys),
            one_time_keys: BTreeMap::new(),
        }))
        .await;
    }

    /// Feed back the response to a queued `KeysUpload` request (§4.7
    /// `PublishingKeys` → `Ready`, and `UploadingOTKs` → `Ready`).
    pub async fn receive_keys_upload_response(
        &self,
        one_time_keys_counts: &BTreeMap<String, u64>,
    ) -> OlmResult<()> {
        let was_uploaded = self.uploaded_device_keys.swap(true, Ordering::SeqCst);

        if !was_uploaded {
            let pickled = self.pickle_account(&*self.account.lock().await);
            self.store.save_changes(PendingChanges { olm_account: Some(pickled), ..Default::default() }).await?;
            info!(user_id = self.user_id.as_str(), "device keys uploaded, session manager is ready");
        } else if self.otk_upload_in_flight.swap(false, Ordering::SeqCst) {
            let mut account = self.account.lock().await;
            account.mark_keys_as_published();
            let pickled = self.pickle_account(&account);
            drop(account);
            self.store.save_changes(PendingChanges { olm_account: Some(pickled), ..Default::default() }).await?;
            debug!(user_id = self.user_id.as_str(), "marked one-time keys as published");
        }

        let count = one_time_keys_counts.get("signed_curve25519").copied().unwrap_or(0);
        self.maybe_queue_otk_upload(count).await
    }

    /// §4.7 `Ready` → `UploadingOTKs`: triggered whenever the server-reported
    /// signed Curve25519 count falls strictly below 0.4x the configured
    /// maximum and no upload is already in flight (§8: exactly 0.4x does not
    /// trigger an upload).
    async fn maybe_queue_otk_upload(&self, current_count: u64) -> OlmResult<()> {
        if self.otk_upload_in_flight.load(Ordering::SeqCst) {
            return Ok(());
        }

        let max = self.otk_settings.max_one_time_keys;
        if (current_count as f64) >= self.otk_settings.threshold_ratio * max as f64 {
            return Ok(());
        }

        let to_generate = (max / 2).saturating_sub(current_count);
        if to_generate == 0 {
            return Ok(());
        }

        let mut account = self.account.lock().await;
        account.generate_one_time_keys(to_generate as usize);
        let one_time_keys = account.signed_one_time_keys();
        let pickled = self.pickle_account(&account);
        drop(account);

        self.store.save_changes(PendingChanges { olm_account: Some(pickled), ..Default::default() }).await?;
        self.otk_upload_in_flight.store(true, Ordering::SeqCst);
        self.queue(OutgoingRequests::KeysUpload(UploadKeysRequest { device_keys: None, one_time_keys })).await;

        Ok(())
    }

    /// Start tracking a user's device list (e.g. on joining a room with
    /// them), queuing a `/keys/query` if one isn't already in flight.
    pub async fn track_user(&self, user_id: OwnedUserId) -> OlmResult<()> {
        let (tracked, outdated) = {
            let mut directory = self.directory.lock().await;
            directory.track_user(user_id);
            (directory.tracked_users().clone(), directory.outdated_users().clone())
        };
        self.store
            .save_changes(PendingChanges { tracked_users: tracked, outdated_users: outdated.clone(), ..Default::default() })
            .await?;
        self.queue_keys_query(outdated).await;
        Ok(())
    }

    /// `consume_device_list_delta` from a `/sync` response (§4.4, §4.7 step
    /// 2).
    pub async fn update_device_list_delta(
        &self,
        changed: impl IntoIterator<Item = OwnedUserId>,
        left: impl IntoIterator<Item = OwnedUserId>,
    ) -> OlmResult<()> {
        let left: Vec<_> = left.into_iter().collect();

        let (tracked, outdated) = {
            let mut directory = self.directory.lock().await;
            directory.consume_device_list_delta(changed, left.clone());
            (directory.tracked_users().clone(), directory.outdated_users().clone())
        };

        self.store
            .save_changes(PendingChanges {
                tracked_users: tracked,
                outdated_users: outdated.clone(),
                removed_users: left.into_iter().collect(),
                ..Default::default()
            })
            .await?;

        self.queue_keys_query(outdated).await;
        Ok(())
    }

    /// Singleton-per-account `/keys/query` (§4.7): a no-op if one is already
    /// in flight or there's nothing outdated.
    async fn queue_keys_query(&self, users: BTreeSet<OwnedUserId>) {
        if users.is_empty() {
            return;
        }
        if self.query_in_flight.swap(true, Ordering::SeqCst) {
            debug!("a keys query is already in flight, the next completion will pick up newly outdated users");
            return;
        }
        self.queue(OutgoingRequests::KeysQuery(KeysQueryRequest { users: users.into_iter().collect() })).await;
    }

    /// Feed back a `/keys/query` response: admits every device independently
    /// (§4.4, §7 class 3), drains the pending-to-device queue and any
    /// deferred room-key distributions, and re-queries if new users went
    /// outdated while this query was in flight.
    pub async fn receive_keys_query_response(
        &self,
        device_keys: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, DeviceKeys>>,
    ) -> OlmResult<Vec<DecryptedRoomEvent>> {
        let mut accepted = Vec::new();

        {
            let mut directory = self.directory.lock().await;
            for (user_id, user_devices) in &device_keys {
                for (device_id, keys) in user_devices {
                    match directory.admit_device(user_id, device_id, keys) {
                        Ok(record) => accepted.push(record),
                        Err(error) => warn!(
                            user_id = user_id.as_str(),
                            device_id = device_id.as_str(),
                            %error,
                            "rejected a device from a keys query response"
                        ),
                    }
                }
                directory.mark_refreshed(user_id);
            }
        }

        let (tracked, outdated) = {
            let directory = self.directory.lock().await;
            (directory.tracked_users().clone(), directory.outdated_users().clone())
        };

        self.store
            .save_changes(PendingChanges {
                devices: accepted,
                tracked_users: tracked,
                outdated_users: outdated.clone(),
                ..Default::default()
            })
            .await?;

        self.query_in_flight.store(false, Ordering::SeqCst);

        let replayed = self.drain_pending_to_device_events().await?;

        if !outdated.is_empty() {
            self.queue_keys_query(outdated).await;
        } else {
            let deferred: Vec<_> = std::mem::take(&mut *self.deferred_key_distribution.lock().await);
            for item in deferred {
                self.send_session_key_to_devices(
                    &item.room_id,
                    &item.session_id,
                    &item.session_key,
                    item.message_index,
                    item.devices,
                )
                .await?;
            }
        }

        Ok(replayed)
    }

    async fn drain_pending_to_device_events(&self) -> OlmResult<Vec<DecryptedRoomEvent>> {
        let pending = std::mem::take(&mut *self.pending_encrypted_to_device.lock().await);
        let mut still_pending = Vec::new();
        let mut replayed = Vec::new();

        for event in pending {
            let device = {
                let directory = self.directory.lock().await;
                directory.device_from_curve_key(&event.sender, &event.sender_curve25519).cloned()
            };

            match device {
                Some(device) => {
                    match self
                        .decrypt_and_dispatch_olm(
                            &event.sender,
                            &device.device_id,
                            &event.sender_curve25519,
                            event.message_type,
                            &event.body,
                        )
                        .await
                    {
                        Ok(mut events) => replayed.append(&mut events),
                        Err(error) => warn!(
                            sender = %event.sender,
                            %error,
                            "failed to process a queued encrypted to-device event"
                        ),
                    }
                }
                None => still_pending.push(event),
            }
        }

        *self.pending_encrypted_to_device.lock().await = still_pending;
        Ok(replayed)
    }

    /// Receive one `/sync` to-device event (§4.7, §6). Unknown senders are
    /// tracked and queued until the next `/keys/query` resolves them;
    /// verification events and other event types are ignored by this core.
    pub async fn receive_to_device_event(
        &self,
        event: IncomingToDeviceEvent,
    ) -> OlmResult<Vec<DecryptedRoomEvent>> {
        if event.event_type.starts_with("m.key.verification.") {
            debug!(sender = %event.sender, "routing verification event elsewhere, not handled by this core");
            return Ok(Vec::new());
        }

        if event.event_type != "m.room.encrypted" {
            debug!(sender = %event.sender, event_type = event.event_type, "ignoring to-device event of unsupported type");
            return Ok(Vec::new());
        }

        let content: OlmEncryptedContent = serde_json::from_value(event.content)?;
        if content.algorithm != OLM_ALGORITHM {
            warn!(sender = %event.sender, algorithm = content.algorithm, "dropping to-device m.room.encrypted with an unsupported algorithm");
            return Ok(Vec::new());
        }

        let our_curve25519 = self.account.lock().await.curve25519_key().to_base64();
        let Some(ciphertext) = content.ciphertext.get(&our_curve25519) else {
            return Err(EventError::MissingCiphertext.into());
        };

        let device = {
            let directory = self.directory.lock().await;
            directory.device_from_curve_key(&event.sender, &content.sender_key).cloned()
        };

        match device {
            Some(device) => {
                self.decrypt_and_dispatch_olm(
                    &event.sender,
                    &device.device_id,
                    &content.sender_key,
                    ciphertext.message_type,
                    &ciphertext.body,
                )
                .await
            }
            None => {
                let (tracked, outdated) = {
                    let mut directory = self.directory.lock().await;
                    directory.track_user(event.sender.clone());
                    (directory.tracked_users().clone(), directory.outdated_users().clone())
                };
                self.store
                    .save_changes(PendingChanges {
                        tracked_users: tracked,
                        outdated_users: outdated.clone(),
                        ..Default::default()
                    })
                    .await?;

                self.pending_encrypted_to_device.lock().await.push(PendingToDeviceEvent {
                    sender: event.sender.clone(),
                    sender_curve25519: content.sender_key.clone(),
                    message_type: ciphertext.message_type,
                    body: ciphertext.body.clone(),
                });

                self.queue_keys_query(outdated).await;
                Ok(Vec::new())
            }
        }
    }

    #[tracing::instrument(skip(self, message_type, body))]
    async fn decrypt_and_dispatch_olm(
        &self,
        sender_user: &ruma::UserId,
        device_id: &ruma::DeviceId,
        sender_curve25519_b64: &str,
        message_type: u8,
        body: &str,
    ) -> OlmResult<Vec<DecryptedRoomEvent>> {
        let sender_curve25519 =
            Curve25519PublicKey::from_base64(sender_curve25519_b64).map_err(|_| EventError::MissingSenderKey)?;

        let mut account = self.account.lock().await;
        let decrypt_result = self
            .sessions
            .decrypt(&mut account, sender_user, device_id, sender_curve25519, message_type, body)
            .await;
        let pickled_account = self.pickle_account(&account);
        drop(account);

        let plaintext = match decrypt_result {
            Ok(plaintext) => plaintext,
            Err(OlmError::SessionWedged(_)) => {
                warn!(
                    user_id = sender_user.as_str(),
                    device_id = device_id.as_str(),
                    "Olm session is wedged, starting broken-session recovery"
                );
                return self.recover_broken_session(sender_user, sender_curve25519).await;
            }
            Err(error) => return Err(error),
        };

        self.persist_account_and_sessions(sender_curve25519, pickled_account).await?;

        let envelope: OlmPlaintextEnvelope = serde_json::from_slice(&plaintext)?;

        let sender_device_ed25519 = {
            let directory = self.directory.lock().await;
            directory.device(sender_user, device_id).map(|d| d.ed25519_pub.clone())
        };
        let Some(sender_device_ed25519) = sender_device_ed25519 else {
            return Err(EventError::MismatchedSender.into());
        };
        let our_ed25519 = self.account.lock().await.identity_keys().ed25519;

        if &*envelope.sender != sender_user
            || envelope.recipient != self.user_id
            || envelope.keys.ed25519 != sender_device_ed25519
            || envelope.recipient_keys.ed25519 != our_ed25519
        {
            warn!(
                user_id = sender_user.as_str(),
                device_id = device_id.as_str(),
                "dropping Olm payload with mismatched sender/recipient fields"
            );
            return Err(EventError::MismatchedSender.into());
        }

        let olm_session_id = match self.sessions.sessions_for(sender_curve25519).await.first() {
            Some(session) => session.session_id().await,
            None => String::new(),
        };

        let event = Self::parse_to_device_event(envelope, olm_session_id)?;
        self.handle_decrypted_event(event, sender_curve25519).await
    }

    fn parse_to_device_event(envelope: OlmPlaintextEnvelope, olm_session_id: String) -> OlmResult<ToDeviceEvent> {
        match envelope.event_type.as_str() {
            "m.room_key" => {
                let content: RoomKeyContent = serde_json::from_value(envelope.content)?;
                Ok(ToDeviceEvent::RoomKey { sender_user: envelope.sender, content, olm_session_id })
            }
            "m.dummy" => Ok(ToDeviceEvent::Dummy),
            t if t.starts_with("m.key.verification.request") => {
                Ok(ToDeviceEvent::KeyVerificationRequest(envelope.content))
            }
            t if t.starts_with("m.key.verification.done") => Ok(ToDeviceEvent::KeyVerificationDone(envelope.content)),
            t if t.starts_with("m.key.verification.") => Ok(ToDeviceEvent::KeyVerificationOther(envelope.content)),
            other => Ok(ToDeviceEvent::Unknown { event_type: other.to_owned() }),
        }
    }

    async fn handle_decrypted_event(
        &self,
        event: ToDeviceEvent,
        sender_curve25519: Curve25519PublicKey,
    ) -> OlmResult<Vec<DecryptedRoomEvent>> {
        match event {
            ToDeviceEvent::RoomKey { sender_user, content, olm_session_id } => {
                self.handle_room_key(sender_user, content, sender_curve25519, &olm_session_id).await
            }
            ToDeviceEvent::Dummy => {
                debug!("received m.dummy, Olm ratchet resynchronized");
                Ok(Vec::new())
            }
            ToDeviceEvent::KeyVerificationRequest(_)
            | ToDeviceEvent::KeyVerificationDone(_)
            | ToDeviceEvent::KeyVerificationOther(_) => {
                debug!("ignoring verification event, not handled by this core");
                Ok(Vec::new())
            }
            ToDeviceEvent::Unknown { event_type } => {
                warn!(event_type, "ignoring decrypted to-device event of unknown type");
                Ok(Vec::new())
            }
        }
    }

    async fn handle_room_key(
        &self,
        sender_user: OwnedUserId,
        content: RoomKeyContent,
        sender_curve25519: Curve25519PublicKey,
        olm_session_id: &str,
    ) -> OlmResult<Vec<DecryptedRoomEvent>> {
        if content.algorithm != MEGOLM_ALGORITHM {
            warn!(algorithm = content.algorithm, "ignoring m.room_key with an unsupported algorithm");
            return Ok(Vec::new());
        }

        let session_key = SessionKey::from_base64(&content.session_key)
            .map_err(|_| EventError::MissingField("session_key"))?;

        let room = self.room_cache(content.room_id.clone()).await;
        let replayed =
            room.handle_room_key(&session_key, sender_curve25519, sender_user, olm_session_id).await.map_err(OlmError::from)?;
        Ok(replayed)
    }

    /// Broken-session recovery (§4.7): looks the sender up by Curve25519 key,
    /// skips devices already attempted this process lifetime, and claims a
    /// single fresh one-time key to rebuild the session.
    async fn recover_broken_session(
        &self,
        sender_user: &ruma::UserId,
        sender_curve25519: Curve25519PublicKey,
    ) -> OlmResult<Vec<DecryptedRoomEvent>> {
        let device = {
            let directory = self.directory.lock().await;
            directory.device_from_any_curve_key(&sender_curve25519.to_base64()).cloned()
        };

        let Some(device) = device else {
            warn!(sender = sender_user.as_str(), "broken session from an unknown device, cannot recover");
            return Ok(Vec::new());
        };

        if !self.tried_devices.try_mark(sender_user, &device.device_id).await {
            debug!(
                user_id = sender_user.as_str(),
                device_id = device.device_id.as_str(),
                "broken-session recovery already attempted for this device, not retrying"
            );
            return Ok(Vec::new());
        }

        let mut missing = BTreeMap::new();
        missing
            .entry(sender_user.to_owned())
            .or_insert_with(BTreeMap::new)
            .insert(device.device_id.clone(), DeviceKeyAlgorithm::SignedCurve25519);

        let mut request = KeysClaimRequest::new(missing);
        request.timeout = Some(std::time::Duration::from_secs(10));
        let request_id = self.queue(OutgoingRequests::KeysClaim(request)).await;

        self.broken_session_requests
            .lock()
            .await
            .insert(request_id, (sender_user.to_owned(), device.device_id.clone()));

        Ok(Vec::new())
    }

    /// Feed back a `/keys/claim` response, correlated by `request_id`:
    /// creates an outbound session for each claimed device, then either
    /// sends `m.dummy` (broken-session recovery) or dispatches the pending
    /// room key (outbound distribution) that was waiting on it.
    pub async fn receive_keys_claim_response(
        &self,
        request_id: &OwnedTransactionId,
        response: KeysClaimResponse,
    ) -> OlmResult<()> {
        let mut created = Vec::new();

        for (user_id, user_keys) in &response.one_time_keys {
            for (device_id, key_map) in user_keys {
                let device = {
                    let directory = self.directory.lock().await;
                    directory.device(user_id, device_id).cloned()
                };
                let Some(device) = device else { continue };

                let mut claimed = BTreeMap::new();
                if let Some((key_id, key)) = key_map.iter().next() {
                    claimed.insert(key_id.to_string(), serde_json::to_value(key).unwrap_or(Value::Null));
                }
                if claimed.is_empty() {
                    continue;
                }

                let account = self.account.lock().await;
                match self.sessions.create_outbound(&account, user_id, &device, &claimed).await {
                    Ok(_) => created.push((user_id.clone(), device.device_id.clone(), device.curve25519_pub.clone())),
                    Err(error) => warn!(
                        user_id = user_id.as_str(),
                        device_id = device_id.as_str(),
                        %error,
                        "failed to create an outbound session from a claimed one-time key"
                    ),
                }
            }
        }

        for (_, _, curve25519_b64) in &created {
            if let Ok(curve25519) = Curve25519PublicKey::from_base64(curve25519_b64) {
                self.persist_sessions_for(curve25519).await?;
            }
        }

        if let Some((user_id, device_id)) = self.broken_session_requests.lock().await.remove(request_id) {
            if created.iter().any(|(u, d, _)| u == &user_id && d == &device_id) {
                if let Some(device) = self.directory.lock().await.device(&user_id, &device_id).cloned() {
                    match self.build_olm_to_device_request(&user_id, &device, "m.dummy", serde_json::json!({})).await {
                        Ok(request) => {
                            self.queue(OutgoingRequests::ToDevice(request)).await;
                            info!(
                                user_id = user_id.as_str(),
                                device_id = device_id.as_str(),
                                "sent m.dummy to resynchronize after broken-session recovery"
                            );
                        }
                        Err(error) => warn!(%error, "failed to send m.dummy after broken-session recovery"),
                    }
                }
            }
        }

        if let Some(pending) = self.pending_distributions.lock().await.remove(request_id) {
            let ready: Vec<_> = pending
                .devices
                .iter()
                .filter(|(u, d)| created.iter().any(|(cu, cd, _)| cu == u && cd == d))
                .cloned()
                .collect();

            if !ready.is_empty() {
                self.dispatch_room_key(&pending.room_id, &pending.session_id, &pending.session_key, pending.message_index, &ready)
                    .await?;
            }
        }

        Ok(())
    }

    /// Outbound room-key distribution (§4.7): claims keys only for devices
    /// that have no live Olm session, dispatches immediately to the rest, and
    /// defers the whole call while a device-directory refresh is in flight.
    pub async fn send_session_key_to_devices(
        &self,
        room_id: &ruma::RoomId,
        session_id: &str,
        session_key: &str,
        message_index: u32,
        devices: Vec<(OwnedUserId, OwnedDeviceId)>,
    ) -> OlmResult<()> {
        if devices.is_empty() {
            return Ok(());
        }

        if self.query_in_flight.load(Ordering::SeqCst) {
            debug!(
                room_id = room_id.as_str(),
                session_id,
                "deferring room-key distribution until the in-flight device-directory refresh completes"
            );
            self.deferred_key_distribution.lock().await.push(PendingRoomKeyDistribution {
                room_id: room_id.to_owned(),
                session_id: session_id.to_owned(),
                session_key: session_key.to_owned(),
                message_index,
                devices,
            });
            return Ok(());
        }

        let mut missing: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, DeviceKeyAlgorithm>> = BTreeMap::new();
        let mut ready = Vec::new();

        for (user_id, device_id) in &devices {
            let device = {
                let directory = self.directory.lock().await;
                directory.device(user_id, device_id).cloned()
            };
            let Some(device) = device else { continue };
            if !device.supports_olm() {
                continue;
            }
            let Ok(curve) = Curve25519PublicKey::from_base64(&device.curve25519_pub) else { continue };

            if self.sessions.sessions_for(curve).await.is_empty() {
                missing.entry(user_id.clone()).or_default().insert(device_id.clone(), DeviceKeyAlgorithm::SignedCurve25519);
            } else {
                ready.push((user_id.clone(), device_id.clone()));
            }
        }

        if !ready.is_empty() {
            self.dispatch_room_key(room_id, session_id, session_key, message_index, &ready).await?;
        }

        if !missing.is_empty() {
            let claimed_devices: Vec<_> =
                missing.iter().flat_map(|(u, ds)| ds.keys().map(move |d| (u.clone(), d.clone()))).collect();

            let mut request = KeysClaimRequest::new(missing);
            request.timeout = Some(std::time::Duration::from_secs(10));
            let request_id = self.queue(OutgoingRequests::KeysClaim(request)).await;

            self.pending_distributions.lock().await.insert(
                request_id,
                PendingRoomKeyDistribution {
                    room_id: room_id.to_owned(),
                    session_id: session_id.to_owned(),
                    session_key: session_key.to_owned(),
                    message_index,
                    devices: claimed_devices,
                },
            );
        }

        Ok(())
    }

    async fn dispatch_room_key(
        &self,
        room_id: &ruma::RoomId,
        session_id: &str,
        session_key: &str,
        message_index: u32,
        devices: &[(OwnedUserId, OwnedDeviceId)],
    ) -> OlmResult<()> {
        let content = serde_json::to_value(RoomKeyContent {
            algorithm: MEGOLM_ALGORITHM.to_owned(),
            room_id: room_id.to_owned(),
            session_id: session_id.to_owned(),
            session_key: session_key.to_owned(),
        })?;

        let mut batch = ToDeviceRequest::new("m.room.encrypted");
        let mut recipients = Vec::new();

        for (user_id, device_id) in devices {
            let device = {
                let directory = self.directory.lock().await;
                directory.device(user_id, device_id).cloned()
            };
            let Some(device) = device else { continue };

            let request = match self.build_olm_to_device_request(user_id, &device, "m.room_key", content.clone()).await {
                Ok(request) => request,
                Err(error) => {
                    warn!(
                        user_id = user_id.as_str(),
                        device_id = device_id.as_str(),
                        %error,
                        "failed to encrypt a room key for a device"
                    );
                    continue;
                }
            };

            for (u, device_map) in request.messages {
                for (d, c) in device_map {
                    batch.add_recipient(u.clone(), d, c);
                }
            }
            recipients.push((user_id.clone(), device_id.clone(), device.curve25519_pub.clone()));
        }

        if recipients.is_empty() {
            return Ok(());
        }

        self.queue(OutgoingRequests::ToDevice(batch)).await;
        self.group_store
            .mark_devices_received_key(room_id, session_id, message_index, &recipients)
            .await
            .map_err(OlmError::from)?;

        Ok(())
    }

    async fn build_olm_to_device_request(
        &self,
        user_id: &ruma::UserId,
        device: &DeviceRecord,
        event_type: &str,
        content: Value,
    ) -> OlmResult<ToDeviceRequest> {
        let their_curve25519 =
            Curve25519PublicKey::from_base64(&device.curve25519_pub).map_err(|_| EventError::MissingSenderKey)?;

        let our_ed25519 = self.account.lock().await.identity_keys().ed25519;
        let our_curve25519 = self.account.lock().await.curve25519_key().to_base64();

        let envelope = OlmPlaintextEnvelope {
            event_type: event_type.to_owned(),
            content,
            sender: self.user_id.clone(),
            recipient: user_id.to_owned(),
            keys: EnvelopeKeys { ed25519: our_ed25519 },
            recipient_keys: EnvelopeKeys { ed25519: device.ed25519_pub.clone() },
        };
        let plaintext = serde_json::to_string(&envelope)?;

        let (message_type, body) = self.sessions.encrypt(their_curve25519, &plaintext).await?;
        self.persist_sessions_for(their_curve25519).await?;

        let mut ciphertext_map = BTreeMap::new();
        ciphertext_map.insert(device.curve25519_pub.clone(), OlmCiphertext { message_type, body });

        let encrypted_content =
            OlmEncryptedContent { algorithm: OLM_ALGORITHM.to_owned(), sender_key: our_curve25519, ciphertext: ciphertext_map };

        Ok(olm_to_device_request(user_id, &device.device_id, serde_json::to_value(encrypted_content)?))
    }

    pub(crate) async fn room_cache(&self, room_id: OwnedRoomId) -> Arc<RoomEventCache> {
        let mut rooms = self.rooms.lock().await;
        rooms
            .entry(room_id.clone())
            .or_insert_with(|| Arc::new(RoomEventCache::new(room_id, self.group_store.clone())))
            .clone()
    }

    /// The send gate for outgoing room messages (§4.7): ensures a live
    /// outbound session, distributes it to any devices that don't have it
    /// yet, encrypts, and wraps the result as `m.room.encrypted`.
    pub async fn encrypt_room_event(
        &self,
        room_id: &ruma::RoomId,
        plaintext_event: &Value,
        settings: &EncryptionSettings,
        room_members: &[(OwnedUserId, OwnedDeviceId)],
    ) -> Result<MegolmEncryptedContent, MegolmError> {
        let outbound = self.group_store.ensure_current_outbound(room_id, settings).await?;

        let missing = self.group_store.devices_without_key(room_id, outbound.session_id(), room_members).await?;
        if !missing.is_empty() {
            let session_key = outbound.session_key().await.to_base64();
            let message_index = outbound.message_count();
            self.send_session_key_to_devices(room_id, outbound.session_id(), &session_key, message_index, missing)
                .await
                .map_err(|error| MegolmError::Store(CryptoStoreError::Backend(error.to_string())))?;
        }

        let relates_to = plaintext_event.get("m.relates_to").cloned();
        let plaintext = plaintext_event.to_string();
        let (ciphertext, session_id, _index) = self.group_store.encrypt(room_id, &plaintext).await?;

        let sender_key = self.account.lock().await.curve25519_key().to_base64();

        Ok(MegolmEncryptedContent {
            algorithm: MEGOLM_ALGORITHM.to_owned(),
            sender_key,
            device_id: self.device_id.clone(),
            session_id,
            ciphertext: ciphertext.to_base64(),
            relates_to,
        })
    }

    /// Decrypt one Megolm room event (§4.9). `Ok(None)` means the event was
    /// queued because its session hasn't arrived yet; it will surface later
    /// through [`SyncOutput::replayed_room_events`].
    pub async fn decrypt_room_event(
        &self,
        room_id: &ruma::RoomId,
        event_id: &ruma::EventId,
        sender: &ruma::UserId,
        origin_server_ts: MilliSecondsSinceUnixEpoch,
        content: &MegolmEncryptedContent,
    ) -> Result<Option<DecryptedRoomEvent>, MegolmError> {
        let ciphertext =
            MegolmMessage::from_base64(&content.ciphertext).map_err(|_| EventError::MissingCiphertext)?;
        let room = self.room_cache(room_id.to_owned()).await;
        room.decrypt(event_id, sender, origin_server_ts, &content.algorithm, &content.session_id, &ciphertext).await
    }

    /// Room destruction: drop every cached and persisted Megolm session.
    pub async fn forget_room(&self, room_id: &ruma::RoomId) -> Result<(), MegolmError> {
        self.rooms.lock().await.remove(room_id);
        self.group_store.clear_room(room_id).await
    }

    /// A membership change that mandates Megolm rotation before the next
    /// send (§4.6): a `Leave`, or a move out of `Join`/`Invite`.
    pub async fn handle_room_membership_left(&self, room_id: &ruma::RoomId) {
        self.group_store.force_rotation_on_next_send(room_id).await;
    }

    /// Verify the key-backup version's `auth_data` signature, then decrypt
    /// and install every session in `entries` (§4.8 steps 2-3). A bad
    /// individual entry is logged and skipped rather than aborting the
    /// whole import (§7 class 3); a failed signature check aborts
    /// immediately, since it means the backup key itself can't be trusted.
    pub async fn import_key_backup(
        &self,
        megolm_backup_key: &[u8; 32],
        auth_data: &Value,
        entries: BTreeMap<OwnedRoomId, BTreeMap<String, BackupKeyEntry>>,
    ) -> Result<Vec<DecryptedRoomEvent>, SecretStorageError> {
        let unlocker = SecretStorageUnlocker::new(self.store.clone());
        unlocker.verify_backup_auth_data(&self.user_id, auth_data).await?;

        let mut replayed = Vec::new();
        for (room_id, sessions) in entries {
            let room = self.room_cache(room_id.clone()).await;

            for (session_id, entry) in sessions {
                let payload = match secret_storage::decrypt_backup_session(
                    megolm_backup_key,
                    &entry.ciphertext,
                    &entry.ephemeral,
                    &entry.mac,
                ) {
                    Ok(payload) => payload,
                    Err(error) => {
                        warn!(%room_id, session_id, %error, "dropping undecryptable key-backup entry");
                        continue;
                    }
                };

                let Ok(sender_curve25519) = Curve25519PublicKey::from_base64(&payload.sender_key) else {
                    warn!(%room_id, session_id, "key-backup entry had a malformed sender key");
                    continue;
                };
                let Ok(session_key) = SessionKey::from_base64(&payload.session_key) else {
                    warn!(%room_id, session_id, "key-backup entry had a malformed session key");
                    continue;
                };

                let sender_user = self
                    .directory
                    .lock()
                    .await
                    .device_from_any_curve_key(&payload.sender_key)
                    .map(|device| device.user_id.clone())
                    .unwrap_or_else(|| self.user_id.clone());

                match room.add_inbound_from_backup(&session_key, sender_curve25519, sender_user).await {
                    Ok(mut events) => replayed.append(&mut events),
                    Err(error) => warn!(%room_id, session_id, %error, "failed to install a key-backup session"),
                }
            }
        }

        Ok(replayed)
    }

    /// Drive one `/sync` response through §4.7's ordered pipeline: the
    /// one-time-key count check, then the device-list delta, then forced
    /// rotations, then every to-device event in order.
    pub async fn process_sync(&self, input: SyncInput) -> OlmResult<SyncOutput> {
        let count = input.one_time_keys_counts.get("signed_curve25519").copied().unwrap_or(0);
        self.maybe_queue_otk_upload(count).await?;

        if !self.first_sync_done.swap(true, Ordering::SeqCst) {
            debug!("first sync after load, tracking sets were already restored from the store at bootstrap");
        }

        self.update_device_list_delta(input.device_list_changed, input.device_list_left).await?;

        for room_id in &input.rooms_needing_rotation {
            self.group_store.force_rotation_on_next_send(room_id).await;
        }

        let mut replayed_room_events = Vec::new();
        for event in input.to_device_events {
            match self.receive_to_device_event(event).await {
                Ok(mut events) => replayed_room_events.append(&mut events),
                Err(error) => warn!(%error, "failed to process a to-device event"),
            }
        }

        Ok(SyncOutput { replayed_room_events })
    }
}

#[cfg(test)]
mod tests {
    use ruma::{device_id, event_id, room_id, user_id};
    use serde_json::json;

    use super::*;
    use crate::store::MemoryStore;
    use matrix_sdk_store_encryption::{PicklingKey, StoreCipher};

    fn memory_store(seed: u8) -> Arc<dyn CryptoStore> {
        Arc::new(MemoryStore::new(Arc::new(StoreCipher::new(&PicklingKey::new([seed; 32])))))
    }

    async fn machine(user_id: &ruma::UserId, device_id: &ruma::DeviceId, seed: u8) -> OlmMachine {
        OlmMachine::new(user_id, device_id, memory_store(seed), OtkUploadSettings::default()).await.unwrap()
    }

    #[tokio::test(flavor = "current_thread")]
    async fn bootstrap_of_a_fresh_account_queues_the_initial_keys_upload() {
        let bob = machine(user_id!("@bob:example.org"), device_id!("BOB"), 1).await;
        let outgoing = bob.outgoing_requests().await;

        assert_eq!(outgoing.len(), 1);
        match &outgoing[0].request {
            OutgoingRequests::KeysUpload(request) => {
                assert!(request.device_keys.is_some());
                assert!(request.one_time_keys.is_empty());
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn bootstrap_from_an_existing_store_queues_nothing() {
        let store = memory_store(2);
        let _first = OlmMachine::new(user_id!("@bob:example.org"), device_id!("BOB"), store.clone(), OtkUploadSettings::default())
            .await
            .unwrap();

        let second = OlmMachine::new(user_id!("@bob:example.org"), device_id!("BOB"), store, OtkUploadSettings::default())
            .await
            .unwrap();

        assert!(second.outgoing_requests().await.is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn receiving_keys_upload_response_with_a_low_otk_count_queues_an_upload() {
        let bob = machine(user_id!("@bob:example.org"), device_id!("BOB"), 3).await;
        bob.outgoing_requests().await;

        bob.receive_keys_upload_response(&BTreeMap::new()).await.unwrap();
        let outgoing = bob.outgoing_requests().await;

        assert_eq!(outgoing.len(), 1);
        match &outgoing[0].request {
            OutgoingRequests::KeysUpload(request) => {
                assert!(request.device_keys.is_none());
                assert!(!request.one_time_keys.is_empty());
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn otk_count_at_exactly_the_threshold_does_not_queue_an_upload() {
        let bob = machine(user_id!("@bob:example.org"), device_id!("BOB"), 4).await;
        bob.outgoing_requests().await;
        bob.receive_keys_upload_response(&BTreeMap::new()).await.unwrap();
        bob.outgoing_requests().await;

        let mut counts = BTreeMap::new();
        counts.insert("signed_curve25519".to_owned(), 20);
        bob.receive_keys_upload_response(&counts).await.unwrap();

        assert!(bob.outgoing_requests().await.is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn tracking_a_user_queues_a_single_keys_query() {
        let bob = machine(user_id!("@bob:example.org"), device_id!("BOB"), 5).await;
        bob.outgoing_requests().await;

        bob.track_user(user_id!("@alice:example.org").to_owned()).await.unwrap();
        let outgoing = bob.outgoing_requests().await;
        assert_eq!(outgoing.len(), 1);
        assert!(matches!(outgoing[0].request, OutgoingRequests::KeysQuery(_)));

        bob.track_user(user_id!("@carol:example.org").to_owned()).await.unwrap();
        assert!(bob.outgoing_requests().await.is_empty(), "a second query must not start while one is in flight");
    }

    fn device_keys_for(account: &ReadOnlyAccount) -> DeviceKeys {
        serde_json::from_value(account.device_keys()).unwrap()
    }

    #[tokio::test(flavor = "current_thread")]
    async fn keys_query_response_admits_device_and_clears_outdated() {
        let bob = machine(user_id!("@bob:example.org"), device_id!("BOB"), 6).await;
        let alice_account = ReadOnlyAccount::new(user_id!("@alice:example.org"), device_id!("ALICE"));

        bob.track_user(user_id!("@alice:example.org").to_owned()).await.unwrap();
        bob.outgoing_requests().await;

        let mut seen = BTreeMap::new();
        seen.entry(user_id!("@alice:example.org").to_owned())
            .or_insert_with(BTreeMap::new)
            .insert(device_id!("ALICE").to_owned(), device_keys_for(&alice_account));

        let replayed = bob.receive_keys_query_response(seen).await.unwrap();
        assert!(replayed.is_empty());

        let directory = bob.device_directory().await;
        assert!(!directory.outdated_users().contains(user_id!("@alice:example.org")));
        assert!(directory.device(user_id!("@alice:example.org"), device_id!("ALICE")).is_some());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn olm_room_key_from_a_known_device_unlocks_a_queued_megolm_event() {
        let room = room_id!("!room:example.org");
        let bob = machine(user_id!("@bob:example.org"), device_id!("BOB"), 7).await;
        bob.outgoing_requests().await;

        let alice_account = ReadOnlyAccount::new(user_id!("@alice:example.org"), device_id!("ALICE"));

        let mut seen = BTreeMap::new();
        seen.entry(user_id!("@alice:example.org").to_owned())
            .or_insert_with(BTreeMap::new)
            .insert(device_id!("ALICE").to_owned(), device_keys_for(&alice_account));
        bob.receive_keys_query_response(seen).await.unwrap();

        let outbound = crate::olm::group_sessions::OutboundGroupSession::new(room, EncryptionSettings::default());
        let plaintext_event = json!({ "room_id": room, "type": "m.room.message", "content": {} }).to_string();
        let (ciphertext, _index) = outbound.encrypt(&plaintext_event).await;
        let session_key = outbound.session_key().await.to_base64();

        let megolm_content = MegolmEncryptedContent {
            algorithm: MEGOLM_ALGORITHM.to_owned(),
            sender_key: "unused".to_owned(),
            device_id: device_id!("ALICE").to_owned(),
            session_id: outbound.session_id().to_owned(),
            ciphertext: ciphertext.to_base64(),
            relates_to: None,
        };

        let queued = bob
            .decrypt_room_event(
                room,
                event_id!("$one:example.org"),
                user_id!("@alice:example.org"),
                MilliSecondsSinceUnixEpoch::now(),
                &megolm_content,
            )
            .await
            .unwrap();
        assert!(queued.is_none());

        let (bob_curve, bob_otk) = {
            let mut account = bob.account.lock().await;
            account.generate_one_time_keys(1);
            let signed = account.signed_one_time_keys();
            let (_, otk) = signed.into_iter().next().unwrap();
            let otk_key = otk["key"].as_str().unwrap().to_owned();
            (account.curve25519_key(), Curve25519PublicKey::from_base64(&otk_key).unwrap())
        };

        let inner = alice_account.create_outbound_session(bob_curve, bob_otk);
        let alice_session = Session::wrap(
            user_id!("@bob:example.org").to_owned(),
            device_id!("BOB").to_owned(),
            alice_account.identity_keys().curve25519,
            bob_curve,
            inner,
        );

        let envelope = OlmPlaintextEnvelope {
            event_type: "m.room_key".to_owned(),
            content: serde_json::to_value(RoomKeyContent {
                algorithm: MEGOLM_ALGORITHM.to_owned(),
                room_id: room.to_owned(),
                session_id: outbound.session_id().to_owned(),
                session_key,
            })
            .unwrap(),
            sender: user_id!("@alice:example.org").to_owned(),
            recipient: user_id!("@bob:example.org").to_owned(),
            keys: EnvelopeKeys { ed25519: alice_account.identity_keys().ed25519 },
            recipient_keys: EnvelopeKeys { ed25519: bob.account.lock().await.identity_keys().ed25519 },
        };
        let (message_type, body) = alice_session.encrypt(&serde_json::to_string(&envelope).unwrap()).await;

        let mut ciphertext_map = BTreeMap::new();
        ciphertext_map.insert(bob_curve.to_base64(), OlmCiphertext { message_type, body });
        let olm_content = OlmEncryptedContent {
            algorithm: OLM_ALGORITHM.to_owned(),
            sender_key: alice_account.curve25519_key().to_base64(),
            ciphertext: ciphertext_map,
        };

        let event = IncomingToDeviceEvent {
            sender: user_id!("@alice:example.org").to_owned(),
            event_type: "m.room.encrypted".to_owned(),
            content: serde_json::to_value(olm_content).unwrap(),
        };

        let replayed = bob.receive_to_device_event(event).await.unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].event_id.as_str(), "$one:example.org");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn to_device_event_from_an_unknown_sender_is_queued_not_dropped() {
        let bob = machine(user_id!("@bob:example.org"), device_id!("BOB"), 8).await;
        bob.outgoing_requests().await;

        let olm_content = OlmEncryptedContent {
            algorithm: OLM_ALGORITHM.to_owned(),
            sender_key: Curve25519PublicKey::from_bytes([9u8; 32]).to_base64(),
            ciphertext: BTreeMap::new(),
        };
        let event = IncomingToDeviceEvent {
            sender: user_id!("@eve:example.org").to_owned(),
            event_type: "m.room.encrypted".to_owned(),
            content: serde_json::to_value(olm_content).unwrap(),
        };

        let result = bob.receive_to_device_event(event).await;
        assert!(result.is_err(), "no ciphertext addressed to us should be a hard error, not a silent drop");

        let directory = bob.device_directory().await;
        assert!(directory.tracked_users().contains(user_id!("@eve:example.org")));
    }
}
