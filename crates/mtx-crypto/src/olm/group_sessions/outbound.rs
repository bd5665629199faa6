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

use std::{cmp::max, fmt, time::Duration};

use ruma::{OwnedRoomId, RoomId, SecondsSinceUnixEpoch};
use serde::{Deserialize, Serialize};
use vodozemac::{
    megolm::{GroupSession, GroupSessionPickle, MegolmMessage, SessionConfig, SessionKey},
    PickleError,
};

use crate::types::{events::RoomKeyContent, MEGOLM_V1_ALGORITHM};

/// How long a group session is used before it gets rotated.
pub const ROTATION_PERIOD: Duration = Duration::from_millis(604800000);
/// How many messages a group session encrypts before it gets rotated.
pub const ROTATION_MESSAGES: u64 = 100;

/// Settings for an encrypted room.
///
/// This determines the rotation periods of a group session. The values come
/// from the room's encryption state event.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct EncryptionSettings {
    /// How long the session should be used before changing it.
    pub rotation_period: Duration,
    /// How many messages should be sent before changing the session.
    pub rotation_period_msgs: u64,
}

impl Default for EncryptionSettings {
    fn default() -> Self {
        Self { rotation_period: ROTATION_PERIOD, rotation_period_msgs: ROTATION_MESSAGES }
    }
}

impl EncryptionSettings {
    /// Create new encryption settings from the values of the room's
    /// encryption event, falling back to the defaults for missing values.
    pub fn new(rotation_period_ms: Option<u64>, rotation_period_msgs: Option<u64>) -> Self {
        Self {
            rotation_period: rotation_period_ms
                .map_or(ROTATION_PERIOD, Duration::from_millis),
            rotation_period_msgs: rotation_period_msgs.unwrap_or(ROTATION_MESSAGES),
        }
    }
}

/// The sending half of a Megolm group session.
///
/// An outbound group session encrypts room messages for a single room. Its
/// session key needs to be shared with every recipient over a pairwise
/// session before they can decrypt anything.
pub struct OutboundGroupSession {
    inner: GroupSession,
    session_id: String,
    room_id: OwnedRoomId,
    creation_time: SecondsSinceUnixEpoch,
    message_count: u64,
    shared: bool,
    settings: EncryptionSettings,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for OutboundGroupSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundGroupSession")
            .field("session_id", &self.session_id)
            .field("room_id", &self.room_id)
            .field("creation_time", &self.creation_time)
            .field("message_count", &self.message_count)
            .finish()
    }
}

impl OutboundGroupSession {
    /// Create a new outbound group session for the given room.
    pub fn new(room_id: &RoomId, settings: EncryptionSettings) -> Self {
        let session = GroupSession::new(SessionConfig::version_1());
        let session_id = session.session_id();

        Self {
            inner: session,
            session_id,
            room_id: room_id.to_owned(),
            creation_time: SecondsSinceUnixEpoch::now(),
            message_count: 0,
            shared: false,
            settings,
        }
    }

    /// Encrypt the given plaintext.
    ///
    /// The message index increases by one for every encrypted message.
    pub fn encrypt(&mut self, plaintext: &str) -> MegolmMessage {
        self.message_count += 1;
        self.inner.encrypt(plaintext)
    }

    /// The message index that will be used for the next encrypted message.
    pub fn message_index(&self) -> u32 {
        self.inner.message_index()
    }

    /// Check if the session took enough wall-clock time or messages to
    /// require rotation.
    ///
    /// The host application must create a new session once this returns
    /// true.
    pub fn expired(&self) -> bool {
        self.message_count >= self.settings.rotation_period_msgs || self.elapsed()
    }

    fn elapsed(&self) -> bool {
        let creation_time = Duration::from_secs(self.creation_time.get().into());
        let now = Duration::from_secs(SecondsSinceUnixEpoch::now().get().into());

        // The rotation period comes from an unchecked room event, so clamp
        // it to an hour to avoid rotating on every message.
        now.checked_sub(creation_time)
            .map(|elapsed| elapsed >= max(self.settings.rotation_period, Duration::from_secs(3600)))
            .unwrap_or(true)
    }

    /// The encryption settings of this session.
    pub fn settings(&self) -> &EncryptionSettings {
        &self.settings
    }

    /// Mark the session as shared with its recipients.
    ///
    /// Messages shouldn't be encrypted with the session before it has been
    /// shared.
    pub fn mark_as_shared(&mut self) {
        self.shared = true;
    }

    /// Has the session been marked as shared.
    pub fn shared(&self) -> bool {
        self.shared
    }

    /// The session key that recipients need to construct a matching inbound
    /// session.
    ///
    /// This reveals material sufficient to decrypt everything the session
    /// encrypts from the current index on; treat it as a secret.
    pub fn session_key(&self) -> SessionKey {
        self.inner.session_key()
    }

    /// The room this session is used in.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// The unique identifier of this session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The `m.room_key` to-device content that shares this session.
    pub fn as_room_key_content(&self) -> RoomKeyContent {
        RoomKeyContent {
            algorithm: MEGOLM_V1_ALGORITHM.to_owned(),
            room_id: self.room_id.clone(),
            session_id: self.session_id.clone(),
            session_key: self.session_key().to_base64(),
        }
    }

    /// Store the session as an encrypted pickle.
    pub fn pickle(&self, pickle_key: &[u8; 32]) -> PickledOutboundGroupSession {
        PickledOutboundGroupSession {
            pickle: self.inner.pickle().encrypt(pickle_key),
            room_id: self.room_id.clone(),
            settings: self.settings.clone(),
            creation_time: self.creation_time,
            message_count: self.message_count,
            shared: self.shared,
        }
    }

    /// Restore a session from a previously pickled form.
    pub fn from_pickle(
        pickle: PickledOutboundGroupSession,
        pickle_key: &[u8; 32],
    ) -> Result<Self, PickleError> {
        let session_pickle = GroupSessionPickle::from_encrypted(&pickle.pickle, pickle_key)?;
        let inner = GroupSession::from_pickle(session_pickle);
        let session_id = inner.session_id();

        Ok(Self {
            inner,
            session_id,
            room_id: pickle.room_id,
            creation_time: pickle.creation_time,
            message_count: pickle.message_count,
            shared: pickle.shared,
            settings: pickle.settings,
        })
    }
}

/// A pickled version of an [`OutboundGroupSession`].
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PickledOutboundGroupSession {
    /// The encrypted pickle holding the ratchet state.
    pub pickle: String,
    /// The room id this session is used for.
    pub room_id: OwnedRoomId,
    /// The settings this session adheres to.
    pub settings: EncryptionSettings,
    /// The timestamp when this session was created.
    pub creation_time: SecondsSinceUnixEpoch,
    /// The number of messages this session has already encrypted.
    pub message_count: u64,
    /// Was the session shared with its recipients.
    pub shared: bool,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ruma::room_id;

    use super::{EncryptionSettings, OutboundGroupSession, ROTATION_MESSAGES, ROTATION_PERIOD};

    #[test]
    fn encryption_settings_conversion() {
        let settings = EncryptionSettings::new(None, None);
        assert_eq!(settings.rotation_period, ROTATION_PERIOD);
        assert_eq!(settings.rotation_period_msgs, ROTATION_MESSAGES);

        let settings = EncryptionSettings::new(Some(3600), Some(500));
        assert_eq!(settings.rotation_period, Duration::from_millis(3600));
        assert_eq!(settings.rotation_period_msgs, 500);
    }

    #[test]
    fn message_count_triggers_rotation() {
        let settings = EncryptionSettings::new(None, Some(2));
        let mut session = OutboundGroupSession::new(room_id!("!test:localhost"), settings);

        assert!(!session.expired());
        session.encrypt("one");
        assert!(!session.expired());
        session.encrypt("two");
        assert!(session.expired());
    }

    #[test]
    fn index_increases_with_each_message() {
        let mut session =
            OutboundGroupSession::new(room_id!("!test:localhost"), Default::default());

        assert_eq!(session.message_index(), 0);
        session.encrypt("a message");
        assert_eq!(session.message_index(), 1);
    }

    #[test]
    fn pickle_round_trip() {
        let pickle_key = [1u8; 32];
        let mut session =
            OutboundGroupSession::new(room_id!("!test:localhost"), Default::default());
        session.encrypt("advance the ratchet");
        session.mark_as_shared();

        let pickle = session.pickle(&pickle_key);
        let restored = OutboundGroupSession::from_pickle(pickle, &pickle_key).unwrap();

        assert_eq!(session.session_id(), restored.session_id());
        assert_eq!(restored.message_index(), 1);
        assert!(restored.shared());
    }
}
