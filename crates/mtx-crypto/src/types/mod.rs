// Copyright 2021 The Matrix.org Foundation C.I.C.
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

//! Wire-level data types shared between the modules of the crate.

pub mod events;

use std::collections::BTreeMap;

use ruma::{OwnedDeviceId, OwnedUserId};
use serde::{Deserialize, Serialize};

/// The algorithm used for pairwise, device to device encryption.
pub const OLM_V1_ALGORITHM: &str = "m.olm.v1.curve25519-aes-sha2";
/// The algorithm used for group message encryption.
pub const MEGOLM_V1_ALGORITHM: &str = "m.megolm.v1.aes-sha2";
/// The algorithm identifying a Megolm session backup.
pub const MEGOLM_BACKUP_V1_ALGORITHM: &str = "m.megolm_backup.v1.curve25519-aes-sha2";
/// The algorithm identifying a secret storage key.
pub const SECRET_STORAGE_V1_ALGORITHM: &str = "m.secret_storage.v1.aes-hmac-sha2";

/// Signatures, keyed by user, then by `<algorithm>:<key id>`.
pub type Signatures = BTreeMap<OwnedUserId, BTreeMap<String, String>>;

/// The signed, public device key bundle that gets uploaded to the server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceKeys {
    /// The user the device belongs to.
    pub user_id: OwnedUserId,
    /// The device these keys belong to.
    pub device_id: OwnedDeviceId,
    /// The encryption algorithms the device supports.
    pub algorithms: Vec<String>,
    /// Public identity keys, keyed by `<algorithm>:<device id>`.
    pub keys: BTreeMap<String, String>,
    /// Signatures over the canonical form of this object.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub signatures: Signatures,
}

/// A one-time or fallback key signed by the device's Ed25519 key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignedOneTimeKey {
    /// The unpadded base64 encoded Curve25519 public key.
    pub key: String,
    /// True if this is a fallback key.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fallback: bool,
    /// Signatures over the canonical form of this object.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub signatures: Signatures,
}
