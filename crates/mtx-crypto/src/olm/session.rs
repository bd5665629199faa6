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

use std::fmt;

use ruma::SecondsSinceUnixEpoch;
use serde::{Deserialize, Serialize};
use vodozemac::{
    olm::{OlmMessage, PreKeyMessage, Session as InnerSession, SessionPickle},
    Curve25519PublicKey, PickleError,
};

use crate::error::OlmError;

/// A pairwise double-ratchet session between two devices.
///
/// Sessions encrypt and decrypt to-device messages. A session is a
/// single-writer value; both [`encrypt`](Self::encrypt) and
/// [`decrypt`](Self::decrypt) advance the ratchet and take `&mut self`.
pub struct Session {
    pub(crate) inner: InnerSession,
    pub(crate) session_id: String,
    pub(crate) sender_key: Curve25519PublicKey,
    pub(crate) creation_time: SecondsSinceUnixEpoch,
    pub(crate) last_use_time: SecondsSinceUnixEpoch,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("sender_key", &self.sender_key.to_base64())
            .finish()
    }
}

impl Session {
    /// The stable, unique identifier of this session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The Curve25519 identity key of the device on the other end.
    pub fn sender_key(&self) -> Curve25519PublicKey {
        self.sender_key
    }

    /// When the session was created.
    pub fn creation_time(&self) -> SecondsSinceUnixEpoch {
        self.creation_time
    }

    /// When the session last encrypted or decrypted a message.
    pub fn last_use_time(&self) -> SecondsSinceUnixEpoch {
        self.last_use_time
    }

    /// Encrypt the given plaintext.
    ///
    /// The result is a pre-key message (type 0) until the other side has
    /// acknowledged the session by replying, a normal message (type 1)
    /// afterwards.
    pub fn encrypt(&mut self, plaintext: &str) -> OlmMessage {
        let message = self.inner.encrypt(plaintext);
        self.last_use_time = SecondsSinceUnixEpoch::now();

        message
    }

    /// Decrypt the given message.
    ///
    /// A failure never corrupts the ratchet; the session stays usable for
    /// other messages.
    pub fn decrypt(&mut self, message: &OlmMessage) -> Result<Vec<u8>, OlmError> {
        let plaintext = self.inner.decrypt(message)?;
        self.last_use_time = SecondsSinceUnixEpoch::now();

        Ok(plaintext)
    }

    /// Check if a pre-key message was encrypted for this session.
    ///
    /// Used to decide whether an incoming pre-key message can be decrypted
    /// by an existing session before creating a duplicate inbound session.
    pub fn matches(
        &self,
        their_identity_key: Curve25519PublicKey,
        message: &PreKeyMessage,
    ) -> bool {
        their_identity_key == self.sender_key && message.session_id() == self.session_id
    }

    /// Store the session as an encrypted pickle.
    pub fn pickle(&self, pickle_key: &[u8; 32]) -> PickledSession {
        PickledSession {
            pickle: self.inner.pickle().encrypt(pickle_key),
            sender_key: self.sender_key,
            creation_time: self.creation_time,
            last_use_time: self.last_use_time,
        }
    }

    /// Restore a session from a previously pickled form.
    pub fn from_pickle(pickle: PickledSession, pickle_key: &[u8; 32]) -> Result<Self, PickleError> {
        let session_pickle = SessionPickle::from_encrypted(&pickle.pickle, pickle_key)?;
        let inner = InnerSession::from_pickle(session_pickle);
        let session_id = inner.session_id();

        Ok(Self {
            inner,
            session_id,
            sender_key: pickle.sender_key,
            creation_time: pickle.creation_time,
            last_use_time: pickle.last_use_time,
        })
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.session_id == other.session_id
    }
}

/// A pickled version of a [`Session`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PickledSession {
    /// The encrypted pickle holding the ratchet state.
    pub pickle: String,
    /// The Curve25519 identity key of the other side.
    pub sender_key: Curve25519PublicKey,
    /// When the session was created.
    pub creation_time: SecondsSinceUnixEpoch,
    /// When the session was last used.
    pub last_use_time: SecondsSinceUnixEpoch,
}
