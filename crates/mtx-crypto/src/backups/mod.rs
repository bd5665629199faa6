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

//! Server-side backup of inbound group sessions.
//!
//! Every session is individually encrypted to the backup public key; only
//! the holder of the matching private key, usually stored in secret
//! storage, can restore them.

use rand::{thread_rng, RngCore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use vodozemac::{Curve25519PublicKey, Curve25519SecretKey};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{
    ciphers::AesHmacSha2Key,
    olm::ExportedRoomKey,
    types::{Signatures, MEGOLM_BACKUP_V1_ALGORITHM},
    utilities::{self, decode_recovery_key, encode_recovery_key, DecodeError},
};

/// Error type for the encryption and decryption of backed up sessions.
#[derive(Debug, Error)]
pub enum BackupError {
    /// The MAC of the encrypted session data didn't match; the backup key
    /// is wrong or the data was tampered with.
    #[error("the MAC of the encrypted session data didn't match")]
    Mac,

    /// A base64 field or key couldn't be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// An encrypted field has the wrong length.
    #[error("an encrypted field has an invalid length: expected {0}, got {1}")]
    Length(usize, usize),

    /// The session payload couldn't be (de)serialized.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// The storage layer returned an error.
    #[error(transparent)]
    Store(#[from] crate::store::CryptoStoreError),
}

impl From<utilities::Base64DecodeError> for BackupError {
    fn from(error: utilities::Base64DecodeError) -> Self {
        Self::Decode(error.into())
    }
}

impl From<vodozemac::KeyError> for BackupError {
    fn from(error: vodozemac::KeyError) -> Self {
        Self::Decode(error.into())
    }
}

/// A single session, encrypted to the backup public key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncryptedSessionData {
    /// The base64 encoded ephemeral Curve25519 key of the encrypting side.
    pub ephemeral: String,
    /// The base64 encoded ciphertext of the exported session.
    pub ciphertext: String,
    /// The base64 encoded MAC of the ciphertext.
    pub mac: String,
}

/// The per-session metadata stored next to the encrypted session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyBackupData {
    /// The first message index the backed up session can decrypt.
    pub first_message_index: u32,
    /// How many times the session was forwarded before it reached us.
    pub forwarded_count: u32,
    /// Whether the device that created the session was verified.
    pub is_verified: bool,
    /// The encrypted session itself.
    pub session_data: EncryptedSessionData,
}

/// The auth data identifying a backup version.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackupAuthData {
    /// The public half of the backup key pair.
    pub public_key: String,
    /// Signatures over the auth data, by the device and the master
    /// cross-signing key.
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub signatures: Signatures,
}

/// A key backup version as stored on the server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackupVersion {
    /// The backup algorithm, `m.megolm_backup.v1.curve25519-aes-sha2`.
    pub algorithm: String,
    /// The auth data binding the version to a backup key.
    pub auth_data: BackupAuthData,
}

/// The public half of a backup key pair, sufficient to encrypt sessions
/// into the backup.
#[derive(Clone, Copy)]
pub struct MegolmV1BackupKey {
    key: Curve25519PublicKey,
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for MegolmV1BackupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MegolmV1BackupKey").field("key", &self.to_base64()).finish()
    }
}

impl MegolmV1BackupKey {
    /// The full name of the backup algorithm this key supports.
    pub fn backup_algorithm(&self) -> &str {
        MEGOLM_BACKUP_V1_ALGORITHM
    }

    /// Create a backup key from its base64 encoded public part.
    pub fn from_base64(public_key: &str) -> Result<Self, DecodeError> {
        Ok(Self { key: Curve25519PublicKey::from_base64(public_key)? })
    }

    /// The base64 encoded public key.
    pub fn to_base64(&self) -> String {
        self.key.to_base64()
    }

    /// Encrypt one exported session to this backup key.
    ///
    /// A fresh ephemeral Curve25519 pair is used per session; the shared
    /// secret feeds HKDF-SHA-256 and the resulting keys drive the usual
    /// AES-CTR + HMAC envelope.
    pub fn encrypt_session_data(
        &self,
        session: &ExportedRoomKey,
    ) -> Result<EncryptedSessionData, BackupError> {
        let ephemeral_secret = Curve25519SecretKey::new();
        let ephemeral_public = Curve25519PublicKey::from(&ephemeral_secret);

        let shared_secret = ephemeral_secret.diffie_hellman(&self.key);

        // The envelope carries no IV, so it is expanded from the shared
        // secret along with the keys; the ephemeral pair makes it unique.
        let (key, iv) = AesHmacSha2Key::from_secret_with_iv(shared_secret.as_bytes(), b"");

        let ciphertext = key.encrypt(serde_json::to_vec(session)?, &iv);
        let mac = key.mac(&ciphertext);

        Ok(EncryptedSessionData {
            ephemeral: ephemeral_public.to_base64(),
            ciphertext: utilities::encode(ciphertext),
            mac: utilities::encode(mac),
        })
    }
}

/// The private half of a backup key pair.
///
/// Holders of this key can decrypt every session in the backup. It usually
/// lives in secret storage under `m.megolm_backup.v1`.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct BackupDecryptionKey {
    key: Box<[u8; 32]>,
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for BackupDecryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupDecryptionKey").field("key", &"...").finish()
    }
}

impl BackupDecryptionKey {
    /// Generate a new random backup key pair.
    pub fn new() -> Self {
        let mut key = Box::new([0u8; 32]);
        thread_rng().fill_bytes(key.as_mut_slice());

        Self { key }
    }

    /// Restore the key from its base64 form, the form it is stored in
    /// secret storage.
    pub fn from_base64(key: &str) -> Result<Self, DecodeError> {
        let decoded = utilities::decode(key)?;
        let len = decoded.len();

        let key = decoded.try_into().map_err(|_| DecodeError::Length(32, len))?;

        Ok(Self { key: Box::new(key) })
    }

    /// The base64 form of the key.
    pub fn to_base64(&self) -> String {
        utilities::encode(self.key.as_slice())
    }

    /// Restore the key from its base58 recovery key form.
    pub fn from_recovery_key(recovery_key: &str) -> Result<Self, DecodeError> {
        Ok(Self { key: decode_recovery_key(recovery_key)? })
    }

    /// The base58 recovery key form of the key.
    pub fn to_recovery_key(&self) -> String {
        encode_recovery_key(&self.key)
    }

    /// The public half of this key pair.
    pub fn megolm_v1_public_key(&self) -> MegolmV1BackupKey {
        let secret = Curve25519SecretKey::from_slice(self.key.as_ref());
        MegolmV1BackupKey { key: Curve25519PublicKey::from(&secret) }
    }

    /// An unsigned backup version announcing the public key.
    pub fn backup_version(&self) -> BackupVersion {
        BackupVersion {
            algorithm: MEGOLM_BACKUP_V1_ALGORITHM.to_owned(),
            auth_data: BackupAuthData {
                public_key: self.megolm_v1_public_key().to_base64(),
                signatures: Default::default(),
            },
        }
    }

    /// Decrypt a single backed up session.
    ///
    /// The MAC is checked before any decryption happens.
    pub fn decrypt_session_data(
        &self,
        data: &EncryptedSessionData,
    ) -> Result<ExportedRoomKey, BackupError> {
        let ephemeral_key = Curve25519PublicKey::from_base64(&data.ephemeral)?;
        let ciphertext = utilities::decode(&data.ciphertext)?;
        let mac = utilities::decode(&data.mac)?;

        let secret = Curve25519SecretKey::from_slice(self.key.as_ref());
        let shared_secret = secret.diffie_hellman(&ephemeral_key);
        let (key, iv) = AesHmacSha2Key::from_secret_with_iv(shared_secret.as_bytes(), b"");

        key.verify_mac(&ciphertext, &mac).map_err(|_| BackupError::Mac)?;

        let plaintext = key.decrypt(ciphertext, &iv);

        Ok(serde_json::from_slice(&plaintext)?)
    }
}

impl Default for BackupDecryptionKey {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use ruma::room_id;
    use vodozemac::{Curve25519PublicKey, Curve25519SecretKey, Ed25519SecretKey};

    use super::{BackupDecryptionKey, BackupError};
    use crate::olm::{InboundGroupSession, OutboundGroupSession};

    fn exported_session() -> crate::olm::ExportedRoomKey {
        let outbound = OutboundGroupSession::new(room_id!("!test:localhost"), Default::default());
        let mut inbound = InboundGroupSession::new(
            Curve25519PublicKey::from(&Curve25519SecretKey::new()),
            Ed25519SecretKey::new().public_key(),
            room_id!("!test:localhost"),
            &outbound.session_key(),
        );

        inbound.export()
    }

    #[test]
    fn session_round_trip() {
        let decryption_key = BackupDecryptionKey::new();
        let backup_key = decryption_key.megolm_v1_public_key();

        let session = exported_session();
        let encrypted = backup_key.encrypt_session_data(&session).unwrap();
        let decrypted = decryption_key.decrypt_session_data(&encrypted).unwrap();

        assert_eq!(decrypted.session_id, session.session_id);
        assert_eq!(decrypted.room_id, session.room_id);
        assert_eq!(decrypted.session_key.to_base64(), session.session_key.to_base64());
    }

    #[test]
    fn wrong_key_fails_the_mac_check() {
        let decryption_key = BackupDecryptionKey::new();
        let backup_key = decryption_key.megolm_v1_public_key();

        let encrypted = backup_key.encrypt_session_data(&exported_session()).unwrap();

        let other_key = BackupDecryptionKey::new();
        assert_matches!(other_key.decrypt_session_data(&encrypted), Err(BackupError::Mac));
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let decryption_key = BackupDecryptionKey::new();
        let backup_key = decryption_key.megolm_v1_public_key();

        let mut encrypted = backup_key.encrypt_session_data(&exported_session()).unwrap();
        let mut raw = crate::utilities::decode(&encrypted.ciphertext).unwrap();
        let len = raw.len();
        raw[len - 1] ^= 0x01;
        encrypted.ciphertext = crate::utilities::encode(raw);

        assert_matches!(
            decryption_key.decrypt_session_data(&encrypted),
            Err(BackupError::Mac)
        );
    }

    #[test]
    fn base64_round_trip() {
        let key = BackupDecryptionKey::new();
        let restored = BackupDecryptionKey::from_base64(&key.to_base64()).unwrap();

        assert_eq!(
            key.megolm_v1_public_key().to_base64(),
            restored.megolm_v1_public_key().to_base64()
        );
    }

    #[test]
    fn backup_version_announces_the_public_key() {
        let key = BackupDecryptionKey::new();
        let version = key.backup_version();

        assert_eq!(version.algorithm, "m.megolm_backup.v1.curve25519-aes-sha2");
        assert_eq!(version.auth_data.public_key, key.megolm_v1_public_key().to_base64());
    }
}
