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

use std::collections::BTreeMap;

use rand::{thread_rng, RngCore};
use ruma::{DeviceId, OwnedRoomId, OwnedUserId, RoomId, UserId};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use vodozemac::{olm::OlmMessage, Curve25519PublicKey, Ed25519PublicKey};

use crate::{
    backups::{BackupDecryptionKey, BackupError, BackupVersion, KeyBackupData, MegolmV1BackupKey},
    cross_signing::PrivateCrossSigningIdentity,
    error::{
        KeyImportError, MegolmError, MegolmResult, OlmError, OlmResult, SignatureError,
    },
    key_export::{decrypt_key_export, encrypt_key_export},
    olm::{Account, EncryptionSettings, InboundGroupSession, OutboundGroupSession, SessionKey},
    store::{Changes, CryptoStore, MemoryStore, Store},
    types::{
        events::{MegolmV1Content, OlmCiphertext, OlmV1Content, ToDevicePayload},
        DeviceKeys, SignedOneTimeKey, MEGOLM_V1_ALGORITHM, OLM_V1_ALGORITHM,
    },
    utilities::DecodeError,
    RoomKeyImportResult,
};

/// The body of a `/keys/upload` request.
#[derive(Clone, Debug, Default, serde::Serialize, Deserialize)]
pub struct UploadKeysRequest {
    /// The signed device keys, present until they were published once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_keys: Option<DeviceKeys>,
    /// The signed one-time keys, keyed by `signed_curve25519:<key id>`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub one_time_keys: BTreeMap<String, SignedOneTimeKey>,
    /// The signed fallback keys.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fallback_keys: BTreeMap<String, SignedOneTimeKey>,
}

/// A decrypted to-device message.
#[derive(Debug)]
pub struct DecryptedToDevice {
    /// The user the payload claims as sender, checked against the event
    /// sender.
    pub sender: OwnedUserId,
    /// The Curve25519 key of the device that encrypted the message.
    pub sender_key: Curve25519PublicKey,
    /// The Ed25519 key the sender claims; proven by the Olm channel.
    pub claimed_ed25519_key: Option<Ed25519PublicKey>,
    /// The decrypted payload.
    pub payload: ToDevicePayload,
}

#[derive(Deserialize)]
struct DecryptedEnvelope {
    sender: OwnedUserId,
    recipient: OwnedUserId,
    #[serde(default)]
    keys: BTreeMap<String, String>,
    #[serde(default)]
    recipient_keys: BTreeMap<String, String>,
    #[serde(flatten)]
    payload: ToDevicePayload,
}

/// The state machine tying the E2EE pieces together for one device.
///
/// Owns the account and the typed store and implements the data flow:
/// incoming to-device ciphertext through a pairwise session into installed
/// group sessions, and outgoing plaintext through the room's outbound group
/// session. The machine is a single-writer value like the primitives it
/// wraps.
pub struct OlmMachine {
    user_id: OwnedUserId,
    account: Account,
    store: Store,
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for OlmMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OlmMachine")
            .field("user_id", &self.user_id)
            .field("device_id", &self.account.device_id())
            .finish()
    }
}

impl OlmMachine {
    /// Create a new machine with a fresh account and an in-memory store.
    pub fn new(user_id: &UserId, device_id: &DeviceId) -> Self {
        let mut pickle_key = [0u8; 32];
        thread_rng().fill_bytes(&mut pickle_key);

        Self {
            user_id: user_id.to_owned(),
            account: Account::new(user_id, device_id),
            store: Store::new(std::sync::Arc::new(MemoryStore::new()), pickle_key),
        }
    }

    /// Create a machine on top of a persistent store.
    ///
    /// Restores the account stored under the pickle key, or creates and
    /// stores a fresh one.
    pub async fn with_store(
        user_id: &UserId,
        device_id: &DeviceId,
        store: std::sync::Arc<dyn CryptoStore>,
        pickle_key: [u8; 32],
    ) -> Result<Self, crate::store::CryptoStoreError> {
        let store = Store::new(store, pickle_key);

        let account = match store.load_account().await? {
            Some(account) => {
                debug!(%user_id, "Restored an account from the store");
                account
            }
            None => {
                info!(%user_id, "Created a new account");
                let account = Account::new(user_id, device_id);
                store.save_account(&account).await?;
                account
            }
        };

        Ok(Self { user_id: user_id.to_owned(), account, store })
    }

    /// The user the machine belongs to.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The device the machine belongs to.
    pub fn device_id(&self) -> &DeviceId {
        self.account.device_id()
    }

    /// The public identity keys of the account.
    pub fn identity_keys(&self) -> crate::olm::IdentityKeys {
        self.account.identity_keys()
    }

    /// The typed store of this machine.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Generate one-time keys and build the `/keys/upload` request body.
    ///
    /// The device keys are included until the first upload was confirmed
    /// with [`mark_keys_as_published`](Self::mark_keys_as_published).
    pub fn create_upload_keys_request(
        &mut self,
        one_time_key_count: usize,
    ) -> Result<UploadKeysRequest, SignatureError> {
        self.account.generate_one_time_keys(one_time_key_count);

        if self.account.fallback_key().is_empty() && !self.account.shared() {
            self.account.generate_fallback_key();
        }

        Ok(UploadKeysRequest {
            device_keys: (!self.account.shared()).then(|| self.account.device_keys()).transpose()?,
            one_time_keys: self.account.signed_one_time_keys()?,
            fallback_keys: self.account.signed_fallback_keys()?,
        })
    }

    /// Mark the pending device and one-time keys as published.
    pub async fn mark_keys_as_published(&mut self) -> Result<(), crate::store::CryptoStoreError> {
        self.account.mark_keys_as_published();
        self.account.mark_as_shared();
        self.store.save_account(&self.account).await
    }

    /// Generate a new fallback key, retiring the current one.
    ///
    /// The retired key keeps working for inbound sessions until
    /// [`forget_old_fallback_key`](Self::forget_old_fallback_key) is
    /// called.
    pub async fn generate_fallback_key(&mut self) -> Result<(), crate::store::CryptoStoreError> {
        self.account.generate_fallback_key();
        self.store.save_account(&self.account).await
    }

    /// Drop the previous fallback key.
    ///
    /// Call this once the new fallback key has been published long enough
    /// for in-flight pre-key messages to have arrived.
    pub async fn forget_old_fallback_key(&mut self) -> Result<(), crate::store::CryptoStoreError> {
        self.account.forget_old_fallback_key();
        self.store.save_account(&self.account).await
    }

    /// Create a new outbound session to a device, using a one-time key
    /// claimed from the server.
    pub async fn create_outbound_session(
        &mut self,
        their_identity_key: Curve25519PublicKey,
        their_one_time_key: Curve25519PublicKey,
    ) -> OlmResult<()> {
        let session = self.account.create_outbound_session(their_identity_key, their_one_time_key);

        debug!(
            session_id = session.session_id(),
            "Created a new outbound Olm session"
        );

        self.store
            .save_changes(Changes { sessions: vec![&session], ..Default::default() })
            .await?;

        Ok(())
    }

    /// Encrypt a to-device payload for the given device.
    ///
    /// An Olm session with the device must already exist. The message stays
    /// a pre-key message until the other device acknowledges the session.
    pub async fn encrypt_to_device(
        &mut self,
        recipient: &UserId,
        recipient_identity_key: Curve25519PublicKey,
        recipient_ed25519_key: Ed25519PublicKey,
        payload: &ToDevicePayload,
    ) -> OlmResult<OlmV1Content> {
        let mut sessions =
            self.store.get_sessions(&recipient_identity_key.to_base64()).await?;
        // Prefer the session that was used most recently.
        sessions.sort_by_key(|s| std::cmp::Reverse(s.last_use_time()));
        let mut session = sessions.into_iter().next().ok_or(OlmError::MissingSession)?;

        let payload_json = serde_json::to_value(payload)?;

        let envelope = json!({
            "type": payload_json["type"],
            "content": payload_json["content"],
            "sender": self.user_id,
            "sender_device": self.account.device_id(),
            "keys": { "ed25519": self.account.identity_keys().ed25519.to_base64() },
            "recipient": recipient,
            "recipient_keys": { "ed25519": recipient_ed25519_key.to_base64() },
        });

        let message = session.encrypt(&envelope.to_string());

        self.store
            .save_changes(Changes { sessions: vec![&session], ..Default::default() })
            .await?;

        let mut ciphertext = BTreeMap::new();
        ciphertext.insert(
            recipient_identity_key.to_base64(),
            OlmCiphertext::from_message(&message),
        );

        Ok(OlmV1Content {
            algorithm: OLM_V1_ALGORITHM.to_owned(),
            sender_key: self.account.identity_keys().curve25519,
            ciphertext,
        })
    }

    /// Decrypt an `m.room.encrypted` to-device message.
    ///
    /// Pre-key messages re-use an existing matching session or establish a
    /// new inbound one; the account and the session are persisted in one
    /// atomic write. A decrypted `m.room_key` or `m.forwarded_room_key`
    /// payload installs the contained inbound group session.
    pub async fn decrypt_to_device(
        &mut self,
        sender: &UserId,
        content: &OlmV1Content,
    ) -> OlmResult<DecryptedToDevice> {
        let our_key = self.account.identity_keys().curve25519.to_base64();
        let ciphertext =
            content.ciphertext.get(&our_key).ok_or(OlmError::MissingCiphertext)?;

        let message = ciphertext.to_message()?;
        let plaintext = self.decrypt_olm_helper(content.sender_key, &message).await?;

        let envelope: DecryptedEnvelope = serde_json::from_slice(&plaintext)?;

        if envelope.sender != *sender {
            return Err(OlmError::MismatchedSender);
        }

        if envelope.recipient != self.user_id
            || envelope.recipient_keys.get("ed25519").map(String::as_str)
                != Some(self.account.identity_keys().ed25519.to_base64().as_str())
        {
            return Err(OlmError::MismatchedKeys);
        }

        let claimed_ed25519_key = envelope
            .keys
            .get("ed25519")
            .map(|k| Ed25519PublicKey::from_base64(k))
            .transpose()
            .map_err(DecodeError::from)?;

        self.install_room_key(content.sender_key, claimed_ed25519_key, &envelope.payload)
            .await?;

        Ok(DecryptedToDevice {
            sender: envelope.sender,
            sender_key: content.sender_key,
            claimed_ed25519_key,
            payload: envelope.payload,
        })
    }

    async fn decrypt_olm_helper(
        &mut self,
        sender_key: Curve25519PublicKey,
        message: &OlmMessage,
    ) -> OlmResult<Vec<u8>> {
        let mut sessions = self.store.get_sessions(&sender_key.to_base64()).await?;

        if let OlmMessage::PreKey(prekey) = message {
            if let Some(session) =
                sessions.iter_mut().find(|s| s.matches(sender_key, prekey))
            {
                let plaintext = session.decrypt(message)?;
                self.store
                    .save_changes(Changes { sessions: vec![session], ..Default::default() })
                    .await?;

                return Ok(plaintext);
            }

            let result = self.account.create_inbound_session(sender_key, prekey)?;

            debug!(
                session_id = result.session.session_id(),
                "Created a new inbound Olm session from a pre-key message"
            );

            // The account consumed a one-time key, it has to be stored
            // together with the session that used it.
            self.store
                .save_changes(Changes {
                    account: Some(&self.account),
                    sessions: vec![&result.session],
                    ..Default::default()
                })
                .await?;

            return Ok(result.plaintext);
        }

        let mut last_error = OlmError::MissingSession;

        for session in sessions.iter_mut() {
            match session.decrypt(message) {
                Ok(plaintext) => {
                    self.store
                        .save_changes(Changes { sessions: vec![session], ..Default::default() })
                        .await?;
                    return Ok(plaintext);
                }
                Err(error) => last_error = error,
            }
        }

        warn!(
            sender_key = sender_key.to_base64(),
            "No Olm session was able to decrypt the message"
        );

        Err(last_error)
    }

    async fn install_room_key(
        &mut self,
        sender_key: Curve25519PublicKey,
        claimed_ed25519_key: Option<Ed25519PublicKey>,
        payload: &ToDevicePayload,
    ) -> OlmResult<()> {
        match payload {
            ToDevicePayload::RoomKey(content) => {
                if content.algorithm != MEGOLM_V1_ALGORITHM {
                    warn!(
                        algorithm = content.algorithm.as_str(),
                        "Received a room key with an unsupported algorithm"
                    );
                    return Ok(());
                }

                let signing_key = claimed_ed25519_key.ok_or(OlmError::MismatchedKeys)?;
                let session_key = SessionKey::from_base64(&content.session_key)
                    .map_err(DecodeError::from)?;

                let mut session = InboundGroupSession::new(
                    sender_key,
                    signing_key,
                    &content.room_id,
                    &session_key,
                );

                info!(
                    room_id = content.room_id.as_str(),
                    session_id = session.session_id(),
                    "Installed a new inbound group session"
                );

                self.store.save_inbound_group_session(&mut session).await?;
            }
            ToDevicePayload::ForwardedRoomKey(content) => {
                let mut session = InboundGroupSession::from_forwarded(sender_key, content);

                info!(
                    room_id = content.room_id.as_str(),
                    session_id = session.session_id(),
                    "Installed a forwarded inbound group session"
                );

                self.store.save_inbound_group_session(&mut session).await?;
            }
            _ => {}
        }

        Ok(())
    }

    /// Get the room key that needs to be shared before encrypting in the
    /// given room, rotating the outbound session if it expired.
    ///
    /// Which devices to share the key with, and when, is the host
    /// application's decision; the key is wrapped per recipient with
    /// [`encrypt_to_device`](Self::encrypt_to_device).
    pub async fn share_room_key(
        &mut self,
        room_id: &RoomId,
        settings: EncryptionSettings,
    ) -> MegolmResult<crate::types::events::RoomKeyContent> {
        let outbound = match self.store.get_outbound_group_session(room_id.as_str()).await? {
            Some(outbound) if !outbound.expired() => outbound,
            expired => {
                if expired.is_some() {
                    debug!(room_id = room_id.as_str(), "Rotating the outbound group session");
                }

                self.create_outbound_group_session(room_id, settings).await?
            }
        };

        Ok(outbound.as_room_key_content())
    }

    async fn create_outbound_group_session(
        &mut self,
        room_id: &RoomId,
        settings: EncryptionSettings,
    ) -> MegolmResult<OutboundGroupSession> {
        let outbound = OutboundGroupSession::new(room_id, settings);

        // Install the matching inbound session so we can decrypt our own
        // messages.
        let inbound = InboundGroupSession::new(
            self.account.identity_keys().curve25519,
            self.account.identity_keys().ed25519,
            room_id,
            &outbound.session_key(),
        );

        self.store
            .save_changes(Changes {
                outbound_group_sessions: vec![&outbound],
                inbound_group_sessions: vec![&inbound],
                ..Default::default()
            })
            .await?;

        Ok(outbound)
    }

    /// Encrypt a room event with the room's outbound group session.
    ///
    /// The session must have been shared beforehand; rotation is handled
    /// the same way as in [`share_room_key`](Self::share_room_key).
    pub async fn encrypt_room_event(
        &mut self,
        room_id: &RoomId,
        event_type: &str,
        content: Value,
    ) -> MegolmResult<MegolmV1Content> {
        let mut outbound = match self.store.get_outbound_group_session(room_id.as_str()).await? {
            Some(outbound) if !outbound.expired() => outbound,
            _ => self.create_outbound_group_session(room_id, Default::default()).await?,
        };

        let plaintext = json!({
            "content": content,
            "room_id": room_id,
            "type": event_type,
        })
        .to_string();

        let ciphertext = outbound.encrypt(&plaintext);

        self.store.save_outbound_group_session(&outbound).await?;

        Ok(MegolmV1Content {
            algorithm: MEGOLM_V1_ALGORITHM.to_owned(),
            sender_key: self.account.identity_keys().curve25519,
            ciphertext: ciphertext.to_base64(),
            session_id: outbound.session_id().to_owned(),
            device_id: self.account.device_id().to_owned(),
        })
    }

    /// Decrypt an `m.room.encrypted` room event.
    ///
    /// Fails with [`MegolmError::MissingSession`] if the needed room key
    /// hasn't arrived, and with [`MegolmError::UnknownMessageIndex`] if the
    /// stored session was imported at a later point than the message.
    pub async fn decrypt_room_event(
        &mut self,
        room_id: &RoomId,
        content: &MegolmV1Content,
    ) -> MegolmResult<(Value, u32)> {
        let mut session = self
            .store
            .get_inbound_group_session(
                room_id.as_str(),
                &content.sender_key.to_base64(),
                &content.session_id,
            )
            .await?
            .ok_or(MegolmError::MissingSession)?;

        let message = vodozemac::megolm::MegolmMessage::from_base64(&content.ciphertext)
            .map_err(DecodeError::from)?;

        let (plaintext, message_index) = session.decrypt(&message)?;

        let event: Value = serde_json::from_slice(&plaintext)?;

        if event["room_id"].as_str() != Some(room_id.as_str()) {
            return Err(MegolmError::MismatchedRoom);
        }

        Ok((event, message_index))
    }

    /// Export every stored room key into the armored export format.
    pub async fn export_room_keys(
        &self,
        passphrase: &str,
        rounds: u32,
    ) -> MegolmResult<String> {
        let sessions = self.store.get_inbound_group_sessions().await?;
        let exported: Vec<_> = sessions.into_iter().map(|mut s| s.export()).collect();

        debug!(count = exported.len(), "Exporting room keys");

        Ok(encrypt_key_export(&exported, passphrase, rounds)?)
    }

    /// Import room keys from an armored export.
    pub async fn import_room_keys(
        &self,
        export: &str,
        passphrase: &str,
    ) -> Result<RoomKeyImportResult, KeyImportError> {
        let keys = decrypt_key_export(export, passphrase)?;

        Ok(self.store.import_room_keys(keys).await?)
    }

    /// Encrypt every stored room key to the given backup key.
    ///
    /// Returns the per-room, per-session map the backup endpoints expect.
    pub async fn backup_room_keys(
        &self,
        backup_key: &MegolmV1BackupKey,
    ) -> Result<BTreeMap<OwnedRoomId, BTreeMap<String, KeyBackupData>>, BackupError> {
        let sessions = self.store.get_inbound_group_sessions().await?;
        let mut rooms: BTreeMap<OwnedRoomId, BTreeMap<String, KeyBackupData>> = BTreeMap::new();

        for mut session in sessions {
            let exported = session.export();

            let data = KeyBackupData {
                first_message_index: session.first_known_index(),
                forwarded_count: session.forwarding_curve25519_key_chain.len() as u32,
                is_verified: false,
                session_data: backup_key.encrypt_session_data(&exported)?,
            };

            rooms
                .entry(session.room_id().to_owned())
                .or_default()
                .insert(session.session_id().to_owned(), data);
        }

        Ok(rooms)
    }

    /// Restore room keys from a backup.
    ///
    /// Each session is decrypted and imported on its own; duplicates obey
    /// the smaller-first-known-index replacement rule, and partial progress
    /// is preserved if the caller abandons a long restore.
    pub async fn restore_room_keys(
        &self,
        rooms: &BTreeMap<OwnedRoomId, BTreeMap<String, KeyBackupData>>,
        decryption_key: &BackupDecryptionKey,
    ) -> Result<RoomKeyImportResult, BackupError> {
        let mut exported = Vec::new();

        for sessions in rooms.values() {
            for data in sessions.values() {
                exported.push(decryption_key.decrypt_session_data(&data.session_data)?);
            }
        }

        Ok(self.store.import_room_keys(exported).await?)
    }

    /// Sign a backup version with the device key and, when available, the
    /// master cross-signing key.
    pub fn sign_backup_version(
        &self,
        version: &mut BackupVersion,
        identity: Option<&PrivateCrossSigningIdentity>,
    ) -> Result<(), SignatureError> {
        let auth_data = serde_json::to_value(&version.auth_data)?;

        let device_signature = self.account.sign_json(auth_data.clone())?;
        version
            .auth_data
            .signatures
            .entry(self.user_id.clone())
            .or_default()
            .insert(format!("ed25519:{}", self.account.device_id()), device_signature);

        if let Some(identity) = identity {
            let master_key = identity.master_public_key().to_base64();
            let signature = identity.sign_with_master(auth_data)?;
            version
                .auth_data
                .signatures
                .entry(self.user_id.clone())
                .or_default()
                .insert(format!("ed25519:{master_key}"), signature);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use ruma::{device_id, room_id, user_id, DeviceId, UserId};
    use serde_json::json;
    use vodozemac::Curve25519PublicKey;

    use super::OlmMachine;
    use crate::{
        backups::BackupDecryptionKey,
        cross_signing::{verify_json_signature, PrivateCrossSigningIdentity},
        error::MegolmError,
        types::events::ToDevicePayload,
    };

    fn alice_id() -> &'static UserId {
        user_id!("@alice:example.org")
    }

    fn alice_device_id() -> &'static DeviceId {
        device_id!("ALICEDEVICE")
    }

    fn bob_id() -> &'static UserId {
        user_id!("@bob:example.org")
    }

    fn bob_device_id() -> &'static DeviceId {
        device_id!("BOBDEVICE")
    }

    /// A pair of machines with an Olm session from Alice to Bob.
    async fn get_machine_pair() -> (OlmMachine, OlmMachine) {
        let mut alice = OlmMachine::new(alice_id(), alice_device_id());
        let mut bob = OlmMachine::new(bob_id(), bob_device_id());

        let request = bob.create_upload_keys_request(1).unwrap();
        let one_time_key = request
            .one_time_keys
            .values()
            .next()
            .map(|k| Curve25519PublicKey::from_base64(&k.key).unwrap())
            .unwrap();
        bob.mark_keys_as_published().await.unwrap();

        alice
            .create_outbound_session(bob.identity_keys().curve25519, one_time_key)
            .await
            .unwrap();

        (alice, bob)
    }

    #[tokio::test]
    async fn upload_request_contains_the_device_keys_once() {
        let mut machine = OlmMachine::new(alice_id(), alice_device_id());

        let request = machine.create_upload_keys_request(5).unwrap();
        assert!(request.device_keys.is_some());
        assert_eq!(request.one_time_keys.len(), 5);
        assert_eq!(request.fallback_keys.len(), 1);

        machine.mark_keys_as_published().await.unwrap();

        let request = machine.create_upload_keys_request(2).unwrap();
        assert!(request.device_keys.is_none());
        assert_eq!(request.one_time_keys.len(), 2);
        assert!(request.fallback_keys.is_empty());
    }

    #[tokio::test]
    async fn room_key_reaches_the_recipient() {
        let (mut alice, mut bob) = get_machine_pair().await;
        let room_id = room_id!("!test:localhost");

        let room_key = alice.share_room_key(room_id, Default::default()).await.unwrap();
        let payload = ToDevicePayload::RoomKey(room_key);

        let encrypted = alice
            .encrypt_to_device(
                bob_id(),
                bob.identity_keys().curve25519,
                bob.identity_keys().ed25519,
                &payload,
            )
            .await
            .unwrap();

        let decrypted = bob.decrypt_to_device(alice_id(), &encrypted).await.unwrap();

        assert_eq!(decrypted.sender, alice_id());
        assert_eq!(decrypted.sender_key, alice.identity_keys().curve25519);
        assert_eq!(
            decrypted.claimed_ed25519_key,
            Some(alice.identity_keys().ed25519)
        );

        let content = assert_matches!(decrypted.payload, ToDevicePayload::RoomKey(c) => c);
        assert_eq!(content.room_id, room_id);
    }

    #[tokio::test]
    async fn room_message_flow() {
        let (mut alice, mut bob) = get_machine_pair().await;
        let room_id = room_id!("!test:localhost");

        let content = json!({ "msgtype": "m.text", "body": "It's a secret to everybody" });

        // Without the room key the event stays undecryptable.
        let room_key = alice.share_room_key(room_id, Default::default()).await.unwrap();
        let event =
            alice.encrypt_room_event(room_id, "m.room.message", content.clone()).await.unwrap();

        assert_matches!(
            bob.decrypt_room_event(room_id, &event).await,
            Err(MegolmError::MissingSession)
        );

        let encrypted_key = alice
            .encrypt_to_device(
                bob_id(),
                bob.identity_keys().curve25519,
                bob.identity_keys().ed25519,
                &ToDevicePayload::RoomKey(room_key),
            )
            .await
            .unwrap();
        bob.decrypt_to_device(alice_id(), &encrypted_key).await.unwrap();

        let (decrypted, message_index) = bob.decrypt_room_event(room_id, &event).await.unwrap();

        assert_eq!(decrypted["content"], content);
        assert_eq!(decrypted["type"], "m.room.message");
        assert_eq!(message_index, 0);

        // The sender can decrypt their own messages too.
        let (decrypted, _) = alice.decrypt_room_event(room_id, &event).await.unwrap();
        assert_eq!(decrypted["content"], content);
    }

    #[tokio::test]
    async fn established_sessions_work_in_both_directions() {
        let (mut alice, mut bob) = get_machine_pair().await;

        let payload = ToDevicePayload::Unknown(crate::types::events::UnknownPayload {
            event_type: "org.example.ping".to_owned(),
            content: json!({ "sequence": 1 }),
        });

        let encrypted = alice
            .encrypt_to_device(
                bob_id(),
                bob.identity_keys().curve25519,
                bob.identity_keys().ed25519,
                &payload,
            )
            .await
            .unwrap();
        bob.decrypt_to_device(alice_id(), &encrypted).await.unwrap();

        // Bob now owns an established session and can answer.
        let answer = ToDevicePayload::Unknown(crate::types::events::UnknownPayload {
            event_type: "org.example.pong".to_owned(),
            content: json!({ "sequence": 1 }),
        });

        let encrypted = bob
            .encrypt_to_device(
                alice_id(),
                alice.identity_keys().curve25519,
                alice.identity_keys().ed25519,
                &answer,
            )
            .await
            .unwrap();

        let decrypted = alice.decrypt_to_device(bob_id(), &encrypted).await.unwrap();
        assert_eq!(decrypted.payload.event_type(), "org.example.pong");
    }

    #[tokio::test]
    async fn backup_and_restore_round_trip() {
        let (mut alice, _) = get_machine_pair().await;
        let room_id = room_id!("!test:localhost");

        let event = alice
            .encrypt_room_event(room_id, "m.room.message", json!({ "body": "hello" }))
            .await
            .unwrap();

        let decryption_key = BackupDecryptionKey::new();
        let backup_key = decryption_key.megolm_v1_public_key();

        let backup = alice.backup_room_keys(&backup_key).await.unwrap();
        assert_eq!(backup.len(), 1);

        let mut charlie = OlmMachine::new(user_id!("@charlie:example.org"), device_id!("CHARLIE"));
        let result = charlie.restore_room_keys(&backup, &decryption_key).await.unwrap();

        assert_eq!(result.imported_count, 1);

        let (decrypted, _) = charlie.decrypt_room_event(room_id, &event).await.unwrap();
        assert_eq!(decrypted["content"]["body"], "hello");
    }

    #[tokio::test]
    async fn key_export_round_trip_between_machines() {
        let (mut alice, _) = get_machine_pair().await;
        let room_id = room_id!("!test:localhost");

        let event = alice
            .encrypt_room_event(room_id, "m.room.message", json!({ "body": "exported" }))
            .await
            .unwrap();

        let export = alice.export_room_keys("passphrase", 10).await.unwrap();

        let mut charlie = OlmMachine::new(user_id!("@charlie:example.org"), device_id!("CHARLIE"));
        let result = charlie.import_room_keys(&export, "passphrase").await.unwrap();

        assert_eq!(result.imported_count, result.total_count);

        let (decrypted, _) = charlie.decrypt_room_event(room_id, &event).await.unwrap();
        assert_eq!(decrypted["content"]["body"], "exported");
    }

    #[tokio::test]
    async fn backup_version_signatures_verify() {
        let machine = OlmMachine::new(alice_id(), alice_device_id());
        let identity = PrivateCrossSigningIdentity::new(alice_id());

        let decryption_key = BackupDecryptionKey::new();
        let mut version = decryption_key.backup_version();

        machine.sign_backup_version(&mut version, Some(&identity)).unwrap();

        let signatures = version.auth_data.signatures.get(alice_id()).unwrap();
        assert_eq!(signatures.len(), 2);

        let auth_data = serde_json::to_value(&version.auth_data).unwrap();

        let device_signature = &signatures[&format!("ed25519:{}", alice_device_id())];
        verify_json_signature(
            &machine.identity_keys().ed25519.to_base64(),
            &auth_data,
            device_signature,
        )
        .unwrap();

        let master_key = identity.master_public_key().to_base64();
        let master_signature = &signatures[&format!("ed25519:{master_key}")];
        verify_json_signature(&master_key, &auth_data, master_signature).unwrap();
    }
}
