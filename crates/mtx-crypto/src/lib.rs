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

#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_debug_implementations, missing_docs)]

pub mod backups;
mod ciphers;
mod cross_signing;
mod error;
mod key_export;
mod machine;
pub mod olm;
mod secret_storage;
pub mod store;
pub mod types;
mod utilities;
pub mod verification;

use std::collections::{BTreeMap, BTreeSet};

use ruma::OwnedRoomId;

/// Return type for the room key importing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomKeyImportResult {
    /// The number of room keys that were imported.
    pub imported_count: usize,
    /// The total number of room keys that were found in the export.
    pub total_count: usize,
    /// The keys that were imported, as a map from room id to a map of the
    /// sender key to a set of session ids.
    pub keys: BTreeMap<OwnedRoomId, BTreeMap<String, BTreeSet<String>>>,
}

impl RoomKeyImportResult {
    pub(crate) fn new(
        imported_count: usize,
        total_count: usize,
        keys: BTreeMap<OwnedRoomId, BTreeMap<String, BTreeSet<String>>>,
    ) -> Self {
        Self { imported_count, total_count, keys }
    }
}

pub use cross_signing::{
    verify_json_signature, CrossSigningBundle, CrossSigningKeys, CrossSigningSecrets, PkSigning,
    PrivateCrossSigningIdentity,
};
pub use error::{
    KeyExportError, KeyImportError, MegolmError, MegolmResult, OlmError, OlmResult,
    SecretStorageError, SignatureError,
};
pub use key_export::{decrypt_key_export, encrypt_key_export, DEFAULT_EXPORT_ROUNDS};
pub use machine::{DecryptedToDevice, OlmMachine, UploadKeysRequest};
pub use secret_storage::{
    secret_names, AesHmacSha2EncryptedData, PassphraseInfo, SecretStorageKey,
    SecretStorageKeyDescription, DEFAULT_PBKDF_ITERATIONS,
};
pub use utilities::{decode_recovery_key, encode_recovery_key, DecodeError};
