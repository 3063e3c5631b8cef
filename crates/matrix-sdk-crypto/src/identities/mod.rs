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

//! The Device Directory (C4): the authoritative map of `(user_id, device_id)`
//! to device keys, plus the `tracked_users`/`outdated_users` tracking sets.

use std::collections::{BTreeMap, BTreeSet};

use ruma::{encryption::DeviceKeys, DeviceKeyAlgorithm, OwnedDeviceId, OwnedUserId};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{DeviceKeyVerificationError, SignatureError};

/// `DeviceRecord { user_id, device_id, algorithms[], curve25519_pub,
/// ed25519_pub, verified }` (§3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub user_id: OwnedUserId,
    pub device_id: OwnedDeviceId,
    pub algorithms: Vec<String>,
    pub curve25519_pub: String,
    pub ed25519_pub: String,
    pub verified: bool,
}

impl DeviceRecord {
    pub fn supports_olm(&self) -> bool {
        self.algorithms.iter().any(|a| a == crate::types::OLM_ALGORITHM)
    }

    pub fn supports_megolm(&self) -> bool {
        self.algorithms.iter().any(|a| a == crate::types::MEGOLM_ALGORITHM)
    }
}

/// The authoritative in-memory view of every known device, plus the
/// tracking sets from §3. Persistence of this state is the Encrypted
/// Store's job; this type is the logic that decides what gets written.
#[derive(Debug, Default)]
pub struct DeviceDirectory {
    devices: BTreeMap<(OwnedUserId, OwnedDeviceId), DeviceRecord>,
    tracked_users: BTreeSet<OwnedUserId>,
    outdated_users: BTreeSet<OwnedUserId>,
}

impl DeviceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rehydrate from persisted tables (used on Session Manager startup).
    pub fn restore(
        devices: Vec<DeviceRecord>,
        tracked_users: BTreeSet<OwnedUserId>,
        outdated_users: BTreeSet<OwnedUserId>,
    ) -> Self {
        let devices = devices.into_iter().map(|d| ((d.user_id.clone(), d.device_id.clone()), d)).collect();
        Self { devices, tracked_users, outdated_users }
    }

    pub fn tracked_users(&self) -> &BTreeSet<OwnedUserId> {
        &self.tracked_users
    }

    pub fn outdated_users(&self) -> &BTreeSet<OwnedUserId> {
        &self.outdated_users
    }

    pub fn track_user(&mut self, user_id: OwnedUserId) {
        self.tracked_users.insert(user_id.clone());
        self.outdated_users.insert(user_id);
    }

    /// `consume_device_list_delta(changed[], left[])` (§4.4).
    pub fn consume_device_list_delta(
        &mut self,
        changed: impl IntoIterator<Item = OwnedUserId>,
        left: impl IntoIterator<Item = OwnedUserId>,
    ) {
        for user in changed {
            if self.tracked_users.contains(&user) {
                self.outdated_users.insert(user);
            }
        }

        for user in left {
            self.tracked_users.remove(&user);
            self.outdated_users.remove(&user);
            self.devices.retain(|(u, _), _| u != &user);
        }
    }

    pub fn device(&self, user_id: &ruma::UserId, device_id: &ruma::DeviceId) -> Option<&DeviceRecord> {
        self.devices.get(&(user_id.to_owned(), device_id.to_owned()))
    }

    pub fn devices_for_user(&self, user_id: &ruma::UserId) -> impl Iterator<Item = &DeviceRecord> {
        self.devices.iter().filter(move |((u, _), _)| u == user_id).map(|(_, d)| d)
    }

    pub fn is_known_curve_key(&self, user_id: &ruma::UserId, curve25519: &str) -> bool {
        self.devices_for_user(user_id).any(|d| d.curve25519_pub == curve25519)
    }

    pub fn device_from_curve_key(&self, user_id: &ruma::UserId, curve25519: &str) -> Option<&DeviceRecord> {
        self.devices_for_user(user_id).find(|d| d.curve25519_pub == curve25519)
    }

    /// Reverse lookup used by broken-session recovery and key-backup import,
    /// where only the sender's Curve25519 identity key is known up front.
    pub fn device_from_any_curve_key(&self, curve25519: &str) -> Option<&DeviceRecord> {
        self.devices.values().find(|d| d.curve25519_pub == curve25519)
    }

    /// Admit one device-keys object from a `/keys/query` response, applying
    /// the five checks of §4.4 step 1-4 in order. Returns the admitted
    /// record or the rejection reason; rejection of one device MUST NOT
    /// affect any other (§7 class 3).
    pub fn admit_device(
        &mut self,
        response_user_id: &ruma::UserId,
        response_device_id: &ruma::DeviceId,
        device_keys: &DeviceKeys,
    ) -> Result<DeviceRecord, DeviceKeyVerificationError> {
        if device_keys.user_id != response_user_id || device_keys.device_id != response_device_id {
            return Err(DeviceKeyVerificationError::UserIdMismatch {
                user_id: response_user_id.to_owned(),
                device_id: response_device_id.to_owned(),
            });
        }

        let supported = [crate::types::OLM_ALGORITHM, crate::types::MEGOLM_ALGORITHM];
        let algorithms: Vec<String> = device_keys.algorithms.iter().map(|a| a.to_string()).collect();
        if !algorithms.iter().any(|a| supported.contains(&a.as_str())) {
            return Err(DeviceKeyVerificationError::UnsupportedAlgorithm(
                response_user_id.to_owned(),
                response_device_id.to_owned(),
            ));
        }

        let ed25519_key_id =
            ruma::DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, response_device_id);
        let ed25519_pub = device_keys
            .keys
            .get(&ed25519_key_id)
            .ok_or_else(|| {
                DeviceKeyVerificationError::Signature(SignatureError::MissingSigningKey(Box::new(
                    ed25519_key_id.clone(),
                )))
            })?
            .to_owned();

        let curve25519_key_id =
            ruma::DeviceKeyId::from_parts(DeviceKeyAlgorithm::Curve25519, response_device_id);
        let curve25519_pub = device_keys
            .keys
            .get(&curve25519_key_id)
            .ok_or_else(|| {
                DeviceKeyVerificationError::Signature(SignatureError::MissingSigningKey(Box::new(
                    curve25519_key_id.clone(),
                )))
            })?
            .to_owned();

        self.verify_self_signature(device_keys, response_device_id, &ed25519_pub)
            .map_err(DeviceKeyVerificationError::Signature)?;

        let key = (response_user_id.to_owned(), response_device_id.to_owned());
        if let Some(existing) = self.devices.get(&key) {
            if existing.ed25519_pub != ed25519_pub {
                warn!(
                    user_id = response_user_id.as_str(),
                    device_id = response_device_id.as_str(),
                    "rejecting device-keys update: ed25519 key changed (device-reuse defense)"
                );
                return Err(DeviceKeyVerificationError::DeviceReuse {
                    user_id: response_user_id.to_owned(),
                    device_id: response_device_id.to_owned(),
                });
            }
        }

        let record = DeviceRecord {
            user_id: response_user_id.to_owned(),
            device_id: response_device_id.to_owned(),
            algorithms,
            curve25519_pub,
            ed25519_pub,
            verified: false,
        };

        debug!(
            user_id = response_user_id.as_str(),
            device_id = response_device_id.as_str(),
            "admitted device"
        );
        self.devices.insert(key, record.clone());
        Ok(record)
    }

    fn verify_self_signature(
        &self,
        device_keys: &DeviceKeys,
        device_id: &ruma::DeviceId,
        ed25519_pub: &str,
    ) -> Result<(), SignatureError> {
        let public_key = vodozemac::Ed25519PublicKey::from_base64(ed25519_pub)
            .map_err(|_| SignatureError::VerificationError)?;

        let key_id = ruma::DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, device_id);
        let user_signatures = device_keys
            .signatures
            .get(&device_keys.user_id)
            .ok_or(SignatureError::NoSignatureFound)?;
        let signature_b64 =
            user_signatures.get(key_id.as_str()).ok_or(SignatureError::NoSignatureFound)?;
        let signature = vodozemac::Ed25519Signature::from_base64(signature_b64)
            .map_err(|_| SignatureError::VerificationError)?;

        let mut value = serde_json::to_value(device_keys).map_err(SignatureError::JsonError)?;
        let object = value.as_object_mut().ok_or(SignatureError::NotAnObject)?;
        object.remove("signatures");
        object.remove("unsigned");
        let canonical: ruma::serde::CanonicalJsonValue =
            value.try_into().map_err(|_| SignatureError::NotAnObject)?;
        let canonical = canonical.to_string();

        if crate::primitives::ed25519_verify(&public_key, &canonical, &signature) {
            Ok(())
        } else {
            Err(SignatureError::VerificationError)
        }
    }

    pub fn mark_refreshed(&mut self, user_id: &ruma::UserId) {
        self.outdated_users.remove(user_id);
    }
}

#[cfg(test)]
mod tests {
    use ruma::{device_id, user_id};

    use super::*;

    fn record(ed: &str, curve: &str) -> DeviceRecord {
        DeviceRecord {
            user_id: user_id!("@alice:example.org").to_owned(),
            device_id: device_id!("ABCDEFGH").to_owned(),
            algorithms: vec![crate::types::OLM_ALGORITHM.to_owned()],
            curve25519_pub: curve.to_owned(),
            ed25519_pub: ed.to_owned(),
            verified: false,
        }
    }

    #[test]
    fn consume_delta_marks_tracked_users_outdated() {
        let mut directory = DeviceDirectory::new();
        let alice = user_id!("@alice:example.org").to_owned();
        directory.track_user(alice.clone());
        directory.mark_refreshed(&alice);
        assert!(!directory.outdated_users().contains(&alice));

        directory.consume_device_list_delta(vec![alice.clone()], vec![]);
        assert!(directory.outdated_users().contains(&alice));
    }

    #[test]
    fn leaving_drops_tracking_and_devices() {
        let mut directory = DeviceDirectory::new();
        let alice = user_id!("@alice:example.org").to_owned();
        directory.track_user(alice.clone());
        directory.devices.insert(
            (alice.clone(), device_id!("ABCDEFGH").to_owned()),
            record("ed", "curve"),
        );

        directory.consume_device_list_delta(vec![], vec![alice.clone()]);

        assert!(!directory.tracked_users().contains(&alice));
        assert!(directory.devices_for_user(&alice).next().is_none());
    }

    #[test]
    fn device_reuse_is_rejected_without_touching_stored_record() {
        use crate::olm::account::ReadOnlyAccount;

        let mut directory = DeviceDirectory::new();
        let alice = user_id!("@alice:example.org");
        let device_id = device_id!("ABCDEFGH");

        // Two independently-generated accounts claiming the same
        // (user_id, device_id): a legitimate first upload, then a second
        // bundle signed by a different Ed25519 key for the same identity.
        let first = ReadOnlyAccount::new(alice, device_id);
        let second = ReadOnlyAccount::new(alice, device_id);
        assert_ne!(first.identity_keys().ed25519, second.identity_keys().ed25519);

        let first_keys: DeviceKeys = serde_json::from_value(first.device_keys()).unwrap();
        let second_keys: DeviceKeys = serde_json::from_value(second.device_keys()).unwrap();

        let admitted = directory.admit_device(alice, device_id, &first_keys).unwrap();
        assert_eq!(admitted.ed25519_pub, first.identity_keys().ed25519);

        let result = directory.admit_device(alice, device_id, &second_keys);
        assert!(matches!(
            result,
            Err(DeviceKeyVerificationError::DeviceReuse { .. })
        ));

        // The original record must survive the rejected update untouched.
        let stored = directory.device(alice, device_id).unwrap();
        assert_eq!(stored.ed25519_pub, first.identity_keys().ed25519);
    }
}
