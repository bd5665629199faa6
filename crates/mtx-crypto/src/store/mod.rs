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

//! Persistence for the cryptographic state.
//!
//! Host applications provide a [`CryptoStore`], a blob store keyed by a
//! pickle kind and an id. The typed [`Store`] wrapper owns the pickle key
//! and is the only place where the symmetric-key-encrypted pickled forms
//! are written or read.

mod memorystore;

use std::{fmt, io::Error as IoError, sync::Arc};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use vodozemac::megolm::SessionOrdering;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub use memorystore::MemoryStore;

use crate::{
    ciphers::{AesHmacSha2Key, IV_SIZE, MAC_SIZE},
    olm::{
        Account, ExportedRoomKey, InboundGroupSession, OutboundGroupSession, PickledAccount,
        PickledInboundGroupSession, PickledOutboundGroupSession, PickledSession, Session,
    },
    RoomKeyImportResult,
};

/// Error type for the storage layer.
#[derive(Debug, Error)]
pub enum CryptoStoreError {
    /// The underlying backend couldn't read or write the data.
    #[error("can't read or write from the store")]
    Io(#[from] IoError),

    /// The data couldn't be (de)serialized.
    #[error("error serializing data for the store")]
    Serialization(#[from] serde_json::Error),

    /// A contained ratchet pickle couldn't be decrypted.
    #[error(transparent)]
    Pickle(#[from] vodozemac::PickleError),

    /// The stored blob failed authentication; the pickle key is wrong or
    /// the store is corrupted.
    #[error("the stored blob failed authentication")]
    BadPickleKey,

    /// The stored blob was sealed by a newer version of the store.
    #[error("the stored blob uses the unsupported version {0}")]
    UnsupportedBlobVersion(u8),

    /// An account needs to be stored before storing other values.
    #[error("an account needs to be stored before storing sessions")]
    AccountUnset,

    /// A backend specific error.
    #[error("the store backend failed: {0}")]
    Backend(String),
}

/// Result type for the storage layer.
pub type Result<T> = std::result::Result<T, CryptoStoreError>;

/// The kind tag a stored blob is filed and authenticated under.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PickleKind {
    /// The single account blob.
    Account,
    /// A pairwise session.
    Session,
    /// An inbound group session.
    InboundGroup,
    /// An outbound group session.
    OutboundGroup,
}

impl PickleKind {
    /// The wire name of the kind.
    pub fn as_str(self) -> &'static str {
        match self {
            PickleKind::Account => "account",
            PickleKind::Session => "session",
            PickleKind::InboundGroup => "inbound_group",
            PickleKind::OutboundGroup => "outbound_group",
        }
    }
}

/// A single entry for [`CryptoStore::put_many`].
#[derive(Debug)]
pub struct StoreEntry {
    /// The kind the blob is filed under.
    pub kind: PickleKind,
    /// The id of the blob within its kind.
    pub id: String,
    /// The sealed blob.
    pub blob: Vec<u8>,
}

/// An abstract store holding sealed blobs keyed by `(kind, id)`.
///
/// Implementations don't interpret the blobs; encryption and
/// authentication happen in [`Store`] before a blob reaches `put`.
#[async_trait]
pub trait CryptoStore: fmt::Debug + Send + Sync {
    /// Store a blob under the given kind and id, replacing any previous
    /// value.
    async fn put(&self, kind: PickleKind, id: &str, blob: Vec<u8>) -> Result<()>;

    /// Store several blobs atomically.
    ///
    /// Either all entries become visible or none of them do; this is what
    /// keeps an account and the sessions derived from it consistent.
    async fn put_many(&self, entries: Vec<StoreEntry>) -> Result<()>;

    /// Load the blob stored under the given kind and id.
    async fn get(&self, kind: PickleKind, id: &str) -> Result<Option<Vec<u8>>>;

    /// Delete the blob stored under the given kind and id.
    async fn delete(&self, kind: PickleKind, id: &str) -> Result<()>;

    /// List the ids of every blob of the given kind.
    async fn list(&self, kind: PickleKind) -> Result<Vec<String>>;
}

const BLOB_VERSION: u8 = 1;
const ACCOUNT_ID: &str = "account";

#[derive(Zeroize, ZeroizeOnDrop)]
struct PickleKey(Box<[u8; 32]>);

/// The typed storage layer.
///
/// Owns the pickle key and seals every pickled value into an
/// AES-256-CTR + HMAC-SHA-256 envelope whose sub-keys are derived per
/// pickle kind, so a blob can't be replayed under a different kind.
pub struct Store {
    inner: Arc<dyn CryptoStore>,
    pickle_key: PickleKey,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store").field("inner", &self.inner).finish()
    }
}

/// Values that should be stored together in one atomic write.
#[derive(Debug, Default)]
pub struct Changes<'a> {
    /// The account, if it changed.
    pub account: Option<&'a Account>,
    /// Pairwise sessions that were created or advanced.
    pub sessions: Vec<&'a Session>,
    /// Inbound group sessions that were installed.
    pub inbound_group_sessions: Vec<&'a InboundGroupSession>,
    /// Outbound group sessions that were created or advanced.
    pub outbound_group_sessions: Vec<&'a OutboundGroupSession>,
}

impl Store {
    /// Create a new typed store on top of the given blob store.
    ///
    /// The pickle key encrypts and authenticates everything that gets
    /// written; it never reaches the backend.
    pub fn new(inner: Arc<dyn CryptoStore>, pickle_key: [u8; 32]) -> Self {
        Self { inner, pickle_key: PickleKey(Box::new(pickle_key)) }
    }

    /// The key this store pickles the ratchet state with.
    pub(crate) fn pickle_key(&self) -> &[u8; 32] {
        &self.pickle_key.0
    }

    fn seal(&self, kind: PickleKind, value: &impl Serialize) -> Result<Vec<u8>> {
        let key = AesHmacSha2Key::from_secret(&self.pickle_key.0, kind.as_str().as_bytes());
        let iv = AesHmacSha2Key::random_iv();

        let ciphertext = key.encrypt(serde_json::to_vec(value)?, &iv);

        let mut blob = Vec::with_capacity(1 + IV_SIZE + ciphertext.len() + MAC_SIZE);
        blob.push(BLOB_VERSION);
        blob.extend_from_slice(&iv);
        blob.extend_from_slice(&ciphertext);

        let mut message = kind.as_str().as_bytes().to_vec();
        message.extend_from_slice(&blob);
        let mac = key.mac(&message);
        blob.extend_from_slice(&mac);

        Ok(blob)
    }

    fn open<T: DeserializeOwned>(&self, kind: PickleKind, blob: &[u8]) -> Result<T> {
        if blob.len() < 1 + IV_SIZE + MAC_SIZE {
            return Err(CryptoStoreError::BadPickleKey);
        }

        let version = blob[0];
        if version != BLOB_VERSION {
            return Err(CryptoStoreError::UnsupportedBlobVersion(version));
        }

        let key = AesHmacSha2Key::from_secret(&self.pickle_key.0, kind.as_str().as_bytes());

        let mac_start = blob.len() - MAC_SIZE;
        let mut message = kind.as_str().as_bytes().to_vec();
        message.extend_from_slice(&blob[..mac_start]);

        key.verify_mac(&message, &blob[mac_start..])
            .map_err(|_| CryptoStoreError::BadPickleKey)?;

        let iv: [u8; IV_SIZE] = blob[1..1 + IV_SIZE].try_into().expect("length checked above");
        let plaintext = key.decrypt(blob[1 + IV_SIZE..mac_start].to_vec(), &iv);

        Ok(serde_json::from_slice(&plaintext)?)
    }

    fn session_blob_id(sender_key: &str, session_id: &str) -> String {
        format!("{sender_key}|{session_id}")
    }

    fn inbound_blob_id(room_id: &str, sender_key: &str, session_id: &str) -> String {
        format!("{room_id}|{sender_key}|{session_id}")
    }

    /// Store the account.
    pub async fn save_account(&self, account: &Account) -> Result<()> {
        let blob = self.seal(PickleKind::Account, &account.pickle(self.pickle_key()))?;
        self.inner.put(PickleKind::Account, ACCOUNT_ID, blob).await
    }

    /// Load the account, if one was stored.
    pub async fn load_account(&self) -> Result<Option<Account>> {
        let Some(blob) = self.inner.get(PickleKind::Account, ACCOUNT_ID).await? else {
            return Ok(None);
        };

        let pickle: PickledAccount = self.open(PickleKind::Account, &blob)?;

        Ok(Some(Account::from_pickle(pickle, self.pickle_key())?))
    }

    /// Store a group of values in one atomic write.
    pub async fn save_changes(&self, changes: Changes<'_>) -> Result<()> {
        let mut entries = Vec::new();

        if let Some(account) = changes.account {
            entries.push(StoreEntry {
                kind: PickleKind::Account,
                id: ACCOUNT_ID.to_owned(),
                blob: self.seal(PickleKind::Account, &account.pickle(self.pickle_key()))?,
            });
        }

        for session in changes.sessions {
            entries.push(StoreEntry {
                kind: PickleKind::Session,
                id: Self::session_blob_id(&session.sender_key().to_base64(), session.session_id()),
                blob: self.seal(PickleKind::Session, &session.pickle(self.pickle_key()))?,
            });
        }

        for session in changes.inbound_group_sessions {
            entries.push(StoreEntry {
                kind: PickleKind::InboundGroup,
                id: Self::inbound_blob_id(
                    session.room_id().as_str(),
                    &session.sender_key.to_base64(),
                    session.session_id(),
                ),
                blob: self.seal(PickleKind::InboundGroup, &session.pickle(self.pickle_key()))?,
            });
        }

        for session in changes.outbound_group_sessions {
            entries.push(StoreEntry {
                kind: PickleKind::OutboundGroup,
                id: session.room_id().to_string(),
                blob: self.seal(PickleKind::OutboundGroup, &session.pickle(self.pickle_key()))?,
            });
        }

        self.inner.put_many(entries).await
    }

    /// Store a pairwise session.
    pub async fn save_session(&self, session: &Session) -> Result<()> {
        let id = Self::session_blob_id(&session.sender_key().to_base64(), session.session_id());
        let blob = self.seal(PickleKind::Session, &session.pickle(self.pickle_key()))?;
        self.inner.put(PickleKind::Session, &id, blob).await
    }

    /// Load every pairwise session we share with the given sender key.
    pub async fn get_sessions(&self, sender_key: &str) -> Result<Vec<Session>> {
        let prefix = format!("{sender_key}|");
        let mut sessions = Vec::new();

        for id in self.inner.list(PickleKind::Session).await? {
            if !id.starts_with(&prefix) {
                continue;
            }

            if let Some(blob) = self.inner.get(PickleKind::Session, &id).await? {
                let pickle: PickledSession = self.open(PickleKind::Session, &blob)?;
                sessions.push(Session::from_pickle(pickle, self.pickle_key())?);
            }
        }

        Ok(sessions)
    }

    /// Store an inbound group session, applying the replacement rule.
    ///
    /// A second copy of a known ratchet only replaces the stored one when
    /// it has a smaller first known index, i.e. when it can decrypt
    /// strictly more. Returns true if the session was stored.
    pub async fn save_inbound_group_session(
        &self,
        session: &mut InboundGroupSession,
    ) -> Result<bool> {
        let room_id = session.room_id().to_owned();
        let sender_key = session.sender_key.to_base64();
        let session_id = session.session_id().to_owned();

        if let Some(mut existing) =
            self.get_inbound_group_session(room_id.as_str(), &sender_key, &session_id).await?
        {
            match session.compare(&mut existing) {
                SessionOrdering::Better => {
                    debug!(
                        room_id = room_id.as_str(),
                        session_id = session_id.as_str(),
                        "Replacing a stored inbound group session with a better copy"
                    );
                }
                SessionOrdering::Unconnected => {
                    warn!(
                        room_id = room_id.as_str(),
                        session_id = session_id.as_str(),
                        "Discarding an inbound group session that clashes with a stored one"
                    );
                    return Ok(false);
                }
                _ => return Ok(false),
            }
        }

        let id = Self::inbound_blob_id(room_id.as_str(), &sender_key, &session_id);
        let blob = self.seal(PickleKind::InboundGroup, &session.pickle(self.pickle_key()))?;
        self.inner.put(PickleKind::InboundGroup, &id, blob).await?;

        Ok(true)
    }

    /// Load a single inbound group session.
    pub async fn get_inbound_group_session(
        &self,
        room_id: &str,
        sender_key: &str,
        session_id: &str,
    ) -> Result<Option<InboundGroupSession>> {
        let id = Self::inbound_blob_id(room_id, sender_key, session_id);

        let Some(blob) = self.inner.get(PickleKind::InboundGroup, &id).await? else {
            return Ok(None);
        };

        let pickle: PickledInboundGroupSession = self.open(PickleKind::InboundGroup, &blob)?;

        Ok(Some(InboundGroupSession::from_pickle(pickle, self.pickle_key())?))
    }

    /// Load every stored inbound group session.
    pub async fn get_inbound_group_sessions(&self) -> Result<Vec<InboundGroupSession>> {
        let mut sessions = Vec::new();

        for id in self.inner.list(PickleKind::InboundGroup).await? {
            if let Some(blob) = self.inner.get(PickleKind::InboundGroup, &id).await? {
                let pickle: PickledInboundGroupSession =
                    self.open(PickleKind::InboundGroup, &blob)?;
                sessions.push(InboundGroupSession::from_pickle(pickle, self.pickle_key())?);
            }
        }

        Ok(sessions)
    }

    /// Store the outbound group session of a room.
    pub async fn save_outbound_group_session(
        &self,
        session: &OutboundGroupSession,
    ) -> Result<()> {
        let blob = self.seal(PickleKind::OutboundGroup, &session.pickle(self.pickle_key()))?;
        self.inner.put(PickleKind::OutboundGroup, session.room_id().as_str(), blob).await
    }

    /// Load the outbound group session of a room, if one exists.
    pub async fn get_outbound_group_session(
        &self,
        room_id: &str,
    ) -> Result<Option<OutboundGroupSession>> {
        let Some(blob) = self.inner.get(PickleKind::OutboundGroup, room_id).await? else {
            return Ok(None);
        };

        let pickle: PickledOutboundGroupSession = self.open(PickleKind::OutboundGroup, &blob)?;

        Ok(Some(OutboundGroupSession::from_pickle(pickle, self.pickle_key())?))
    }

    /// Import a list of exported room keys, applying the replacement rule
    /// for duplicates.
    pub async fn import_room_keys(
        &self,
        exported: Vec<ExportedRoomKey>,
    ) -> Result<RoomKeyImportResult> {
        let total_count = exported.len();
        let mut keys = std::collections::BTreeMap::new();
        let mut imported_count = 0;

        for key in exported {
            let mut session = InboundGroupSession::from_export(&key);

            if self.save_inbound_group_session(&mut session).await? {
                imported_count += 1;

                keys.entry(session.room_id().to_owned())
                    .or_insert_with(std::collections::BTreeMap::new)
                    .entry(session.sender_key.to_base64())
                    .or_insert_with(std::collections::BTreeSet::new)
                    .insert(session.session_id().to_owned());
            }
        }

        debug!(imported_count, total_count, "Done importing room keys");

        Ok(RoomKeyImportResult::new(imported_count, total_count, keys))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use ruma::{device_id, room_id, user_id};
    use vodozemac::{Curve25519PublicKey, Curve25519SecretKey, Ed25519SecretKey};

    use super::{Changes, CryptoStoreError, MemoryStore, Store};
    use crate::olm::{Account, InboundGroupSession, OutboundGroupSession};

    fn store() -> Store {
        Store::new(Arc::new(MemoryStore::new()), [3u8; 32])
    }

    fn inbound_session(outbound: &OutboundGroupSession) -> InboundGroupSession {
        InboundGroupSession::new(
            Curve25519PublicKey::from(&Curve25519SecretKey::new()),
            Ed25519SecretKey::new().public_key(),
            outbound.room_id(),
            &outbound.session_key(),
        )
    }

    #[tokio::test]
    async fn account_round_trip() {
        let store = store();

        assert!(store.load_account().await.unwrap().is_none());

        let account = Account::new(user_id!("@alice:example.org"), device_id!("ALICEDEVICE"));
        store.save_account(&account).await.unwrap();

        let loaded = store.load_account().await.unwrap().unwrap();
        assert_eq!(account.identity_keys(), loaded.identity_keys());
    }

    #[tokio::test]
    async fn wrong_pickle_key_is_rejected() {
        let backend = Arc::new(MemoryStore::new());
        let store = Store::new(backend.clone(), [3u8; 32]);

        let account = Account::new(user_id!("@alice:example.org"), device_id!("ALICEDEVICE"));
        store.save_account(&account).await.unwrap();

        let wrong = Store::new(backend, [4u8; 32]);
        assert_matches!(wrong.load_account().await, Err(CryptoStoreError::BadPickleKey));
    }

    #[tokio::test]
    async fn sessions_are_found_by_sender_key() {
        let store = store();

        let alice = Account::new(user_id!("@alice:example.org"), device_id!("ALICEDEVICE"));
        let mut bob = Account::new(user_id!("@bob:example.org"), device_id!("BOBDEVICE"));

        bob.generate_one_time_keys(1);
        let one_time_key = bob.one_time_keys().into_values().next().unwrap();
        let session = alice.create_outbound_session(bob.curve25519_key(), one_time_key);

        store
            .save_changes(Changes {
                account: Some(&alice),
                sessions: vec![&session],
                ..Default::default()
            })
            .await
            .unwrap();

        let sessions = store.get_sessions(&bob.curve25519_key().to_base64()).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id(), session.session_id());

        let none = store.get_sessions(&alice.curve25519_key().to_base64()).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn better_inbound_sessions_replace_worse_ones() {
        let store = store();

        let outbound = OutboundGroupSession::new(room_id!("!test:localhost"), Default::default());
        let mut fresh = inbound_session(&outbound);

        let mut late = InboundGroupSession::from_export(&fresh.export_at(5));
        // Imports that arrive first get stored.
        assert!(store.save_inbound_group_session(&mut late).await.unwrap());

        // Worse or equal copies are discarded.
        let mut same = InboundGroupSession::from_export(&late.export());
        assert!(!store.save_inbound_group_session(&mut same).await.unwrap());

        // A copy with a smaller first known index replaces the stored one.
        assert!(store.save_inbound_group_session(&mut fresh).await.unwrap());

        let stored = store
            .get_inbound_group_session(
                "!test:localhost",
                &fresh.sender_key.to_base64(),
                fresh.session_id(),
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(stored.first_known_index(), 0);
    }

    #[tokio::test]
    async fn import_room_keys_counts_replacements() {
        let store = store();

        let outbound = OutboundGroupSession::new(room_id!("!test:localhost"), Default::default());
        let mut session = inbound_session(&outbound);

        let late = session.export_at(5);
        let early = session.export_at(0);
        let worse = session.export_at(7);

        let result = store.import_room_keys(vec![late]).await.unwrap();
        assert_eq!(result.imported_count, 1);
        assert_eq!(result.total_count, 1);

        let result = store.import_room_keys(vec![early, worse]).await.unwrap();
        assert_eq!(result.imported_count, 1);
        assert_eq!(result.total_count, 2);
    }

    #[tokio::test]
    async fn outbound_session_round_trip() {
        let store = store();

        let mut outbound =
            OutboundGroupSession::new(room_id!("!test:localhost"), Default::default());
        outbound.encrypt("advance");

        store.save_outbound_group_session(&outbound).await.unwrap();

        let loaded =
            store.get_outbound_group_session("!test:localhost").await.unwrap().unwrap();
        assert_eq!(loaded.session_id(), outbound.session_id());
        assert_eq!(loaded.message_index(), 1);
    }
}
