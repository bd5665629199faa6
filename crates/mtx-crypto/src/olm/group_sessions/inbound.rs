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

use std::{cmp::max, collections::BTreeMap, fmt};

use ruma::{OwnedRoomId, RoomId};
use serde::{Deserialize, Serialize};
use vodozemac::{
    megolm::{
        InboundGroupSession as InnerSession, InboundGroupSessionPickle, MegolmMessage,
        SessionConfig, SessionKey, SessionOrdering,
    },
    Curve25519PublicKey, Ed25519PublicKey, PickleError,
};

use super::ExportedRoomKey;
use crate::{
    error::MegolmError,
    types::{events::ForwardedRoomKeyContent, MEGOLM_V1_ALGORITHM},
};

/// The receiving half of a Megolm group session, also known as a room key.
///
/// An inbound group session decrypts the room messages of a single sender in
/// a single room. A given `(sender_key, session_id)` pair identifies a
/// unique ratchet; sessions only differ in how far back they can decrypt.
pub struct InboundGroupSession {
    inner: InnerSession,
    session_id: String,
    first_known_index: u32,
    /// The Curve25519 key of the device that created the session.
    ///
    /// For a directly received session this is proven by the pairwise
    /// channel it arrived through; for forwarded or imported sessions it is
    /// only a claim.
    pub sender_key: Curve25519PublicKey,
    /// The claimed public signing keys of the device that created the
    /// session.
    pub sender_claimed_keys: BTreeMap<String, String>,
    /// The room this session is used in.
    pub room_id: OwnedRoomId,
    /// The devices this session was forwarded through.
    pub forwarding_curve25519_key_chain: Vec<String>,
    imported: bool,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for InboundGroupSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundGroupSession").field("session_id", &self.session_id).finish()
    }
}

impl InboundGroupSession {
    /// Create an inbound group session from a freshly distributed session
    /// key, as carried by an `m.room_key` event.
    pub fn new(
        sender_key: Curve25519PublicKey,
        signing_key: Ed25519PublicKey,
        room_id: &RoomId,
        session_key: &SessionKey,
    ) -> Self {
        let session = InnerSession::new(session_key, SessionConfig::version_1());
        let session_id = session.session_id();
        let first_known_index = session.first_known_index();

        Self {
            inner: session,
            session_id,
            first_known_index,
            sender_key,
            sender_claimed_keys: BTreeMap::from([(
                "ed25519".to_owned(),
                signing_key.to_base64(),
            )]),
            room_id: room_id.to_owned(),
            forwarding_curve25519_key_chain: Vec::new(),
            imported: false,
        }
    }

    /// Create an inbound group session from an exported one.
    ///
    /// The export may start at a non-zero index; messages before it stay
    /// undecryptable.
    pub fn from_export(exported: &ExportedRoomKey) -> Self {
        let session = InnerSession::import(&exported.session_key, SessionConfig::version_1());
        let session_id = session.session_id();
        let first_known_index = session.first_known_index();

        Self {
            inner: session,
            session_id,
            first_known_index,
            sender_key: exported.sender_key,
            sender_claimed_keys: exported.sender_claimed_keys.clone(),
            room_id: exported.room_id.clone(),
            forwarding_curve25519_key_chain: exported.forwarding_curve25519_key_chain.clone(),
            imported: true,
        }
    }

    /// Create an inbound group session from an `m.forwarded_room_key`
    /// event, extending the forwarding chain with the key of the device
    /// that forwarded it to us.
    pub fn from_forwarded(
        forwarder_key: Curve25519PublicKey,
        content: &ForwardedRoomKeyContent,
    ) -> Self {
        let session = InnerSession::import(&content.session_key, SessionConfig::version_1());
        let session_id = session.session_id();
        let first_known_index = session.first_known_index();

        let mut chain = content.forwarding_curve25519_key_chain.clone();
        chain.push(forwarder_key.to_base64());

        Self {
            inner: session,
            session_id,
            first_known_index,
            sender_key: content.sender_key,
            sender_claimed_keys: BTreeMap::from([(
                "ed25519".to_owned(),
                content.sender_claimed_ed25519_key.clone(),
            )]),
            room_id: content.room_id.clone(),
            forwarding_curve25519_key_chain: chain,
            imported: true,
        }
    }

    /// Decrypt a ciphertext, returning the plaintext and the message index
    /// it was encrypted at.
    ///
    /// Fails with [`MegolmError::UnknownMessageIndex`] if the message was
    /// encrypted before the point the session was imported at.
    pub fn decrypt(&mut self, message: &MegolmMessage) -> Result<(Vec<u8>, u32), MegolmError> {
        let decrypted = self.inner.decrypt(message)?;

        Ok((decrypted.plaintext, decrypted.message_index))
    }

    /// Export the session so that it can decrypt messages starting at the
    /// given index.
    ///
    /// The index is clamped to the first index the session itself knows.
    pub fn export_at(&mut self, index: u32) -> ExportedRoomKey {
        let index = max(self.first_known_index, index);

        let session_key =
            self.inner.export_at(index).expect("an index at or above the first known index");

        ExportedRoomKey {
            algorithm: MEGOLM_V1_ALGORITHM.to_owned(),
            room_id: self.room_id.clone(),
            sender_key: self.sender_key,
            session_id: self.session_id.clone(),
            session_key,
            sender_claimed_keys: self.sender_claimed_keys.clone(),
            forwarding_curve25519_key_chain: self.forwarding_curve25519_key_chain.clone(),
        }
    }

    /// Export the session at the first index it knows.
    pub fn export(&mut self) -> ExportedRoomKey {
        self.export_at(self.first_known_index)
    }

    /// The unique identifier of this session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The room this session belongs to.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// The smallest message index this session can decrypt.
    pub fn first_known_index(&self) -> u32 {
        self.first_known_index
    }

    /// Did the session arrive through an export, a backup or a forward, as
    /// opposed to directly from its creator.
    pub fn has_been_imported(&self) -> bool {
        self.imported
    }

    /// Compare this session against another copy of the same ratchet.
    ///
    /// [`SessionOrdering::Better`] means this session can decrypt strictly
    /// more than the other one and should replace it in storage.
    pub fn compare(&mut self, other: &mut InboundGroupSession) -> SessionOrdering {
        if self.sender_key != other.sender_key || self.room_id != other.room_id {
            SessionOrdering::Unconnected
        } else {
            self.inner.compare(&mut other.inner)
        }
    }

    /// Store the session as an encrypted pickle.
    pub fn pickle(&self, pickle_key: &[u8; 32]) -> PickledInboundGroupSession {
        PickledInboundGroupSession {
            pickle: self.inner.pickle().encrypt(pickle_key),
            sender_key: self.sender_key,
            sender_claimed_keys: self.sender_claimed_keys.clone(),
            room_id: self.room_id.clone(),
            forwarding_curve25519_key_chain: self.forwarding_curve25519_key_chain.clone(),
            imported: self.imported,
        }
    }

    /// Restore a session from a previously pickled form.
    pub fn from_pickle(
        pickle: PickledInboundGroupSession,
        pickle_key: &[u8; 32],
    ) -> Result<Self, PickleError> {
        let session_pickle = InboundGroupSessionPickle::from_encrypted(&pickle.pickle, pickle_key)?;
        let inner = InnerSession::from_pickle(session_pickle);
        let session_id = inner.session_id();
        let first_known_index = inner.first_known_index();

        Ok(Self {
            inner,
            session_id,
            first_known_index,
            sender_key: pickle.sender_key,
            sender_claimed_keys: pickle.sender_claimed_keys,
            room_id: pickle.room_id,
            forwarding_curve25519_key_chain: pickle.forwarding_curve25519_key_chain,
            imported: pickle.imported,
        })
    }
}

impl PartialEq for InboundGroupSession {
    fn eq(&self, other: &Self) -> bool {
        self.session_id == other.session_id
    }
}

/// A pickled version of an [`InboundGroupSession`].
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PickledInboundGroupSession {
    /// The encrypted pickle holding the ratchet state.
    pub pickle: String,
    /// The Curve25519 key of the device that created the session.
    pub sender_key: Curve25519PublicKey,
    /// The claimed signing keys of the device that created the session.
    pub sender_claimed_keys: BTreeMap<String, String>,
    /// The room the session is used in.
    pub room_id: OwnedRoomId,
    /// The devices the session was forwarded through.
    #[serde(default)]
    pub forwarding_curve25519_key_chain: Vec<String>,
    /// Was the session imported rather than received from its creator.
    #[serde(default)]
    pub imported: bool,
}
