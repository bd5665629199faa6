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

mod inbound;
mod outbound;

use std::collections::BTreeMap;

use ruma::OwnedRoomId;
use serde::{Deserialize, Serialize};
use vodozemac::{megolm::ExportedSessionKey, Curve25519PublicKey};

pub use inbound::{InboundGroupSession, PickledInboundGroupSession};
pub use outbound::{
    EncryptionSettings, OutboundGroupSession, PickledOutboundGroupSession, ROTATION_MESSAGES,
    ROTATION_PERIOD,
};

/// The canonical export form of an inbound group session.
///
/// This is what ends up in key export files, key backups and
/// `m.forwarded_room_key` events. The contained session key is secret;
/// anyone holding it can decrypt the messages the session can decrypt.
#[derive(Deserialize, Serialize)]
pub struct ExportedRoomKey {
    /// The encryption algorithm the session uses.
    pub algorithm: String,
    /// The room where the session is used.
    pub room_id: OwnedRoomId,
    /// The Curve25519 key of the device that created the session.
    pub sender_key: Curve25519PublicKey,
    /// The unique id of the session.
    pub session_id: String,
    /// The ratchet state, advanced to the first index this export can
    /// decrypt.
    pub session_key: ExportedSessionKey,
    /// The claimed signing keys of the device that created the session.
    #[serde(default)]
    pub sender_claimed_keys: BTreeMap<String, String>,
    /// The devices the session was forwarded through, if any.
    #[serde(default)]
    pub forwarding_curve25519_key_chain: Vec<String>,
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for ExportedRoomKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportedRoomKey")
            .field("room_id", &self.room_id)
            .field("session_id", &self.session_id)
            .finish()
    }
}
