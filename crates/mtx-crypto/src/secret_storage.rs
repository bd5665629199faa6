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

//! Secret storage (SSSS): encrypting small secrets under a user-derived
//! key so they can live in server-side account data.

use pbkdf2::pbkdf2_hmac;
use rand::{distributions::Alphanumeric, thread_rng, Rng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha512;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{
    ciphers::{AesHmacSha2Key, IV_SIZE, KEY_SIZE},
    error::SecretStorageError,
    types::{Signatures, SECRET_STORAGE_V1_ALGORITHM},
    utilities::{self, decode_recovery_key, encode_recovery_key, DecodeError},
};

/// The well-known names secrets are stored under.
pub mod secret_names {
    /// The private key of the online key backup.
    pub const MEGOLM_BACKUP_V1: &str = "m.megolm_backup.v1";
    /// The seed of the master cross-signing key.
    pub const CROSS_SIGNING_MASTER: &str = "m.cross_signing.master";
    /// The seed of the self-signing key.
    pub const CROSS_SIGNING_SELF_SIGNING: &str = "m.cross_signing.self_signing";
    /// The seed of the user-signing key.
    pub const CROSS_SIGNING_USER_SIGNING: &str = "m.cross_signing.user_signing";
}

/// The number of PBKDF2 rounds used when creating new passphrase-based
/// keys.
pub const DEFAULT_PBKDF_ITERATIONS: u32 = 500_000;

const PASSPHRASE_ALGORITHM: &str = "m.pbkdf2";
const ZERO_PLAINTEXT: [u8; KEY_SIZE] = [0u8; KEY_SIZE];

/// How a secret storage key can be rebuilt from a passphrase.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PassphraseInfo {
    /// The key derivation algorithm, `m.pbkdf2`.
    pub algorithm: String,
    /// The salt the passphrase is hashed with.
    pub salt: String,
    /// The number of PBKDF2 rounds.
    pub iterations: u32,
    /// The size of the derived key in bits.
    #[serde(default = "default_bits")]
    pub bits: u32,
}

fn default_bits() -> u32 {
    256
}

/// The public description of a secret storage key, stored in account data.
///
/// The `iv` and `mac` fields describe the encryption of a zeroed plaintext;
/// they let a client check a candidate key without decrypting any secret.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SecretStorageKeyDescription {
    /// A human readable name for the key.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// The algorithm of the key, `m.secret_storage.v1.aes-hmac-sha2`.
    pub algorithm: String,
    /// The IV the zero-plaintext check was encrypted with.
    pub iv: String,
    /// The MAC of the encrypted zero-plaintext check.
    pub mac: String,
    /// Present when the key can be derived from a passphrase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<PassphraseInfo>,
    /// Signatures over the description, usually by the master
    /// cross-signing key.
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub signatures: Signatures,
}

/// A secret encrypted under a secret storage key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AesHmacSha2EncryptedData {
    /// The base64 encoded AES-CTR IV.
    pub iv: String,
    /// The base64 encoded ciphertext.
    pub ciphertext: String,
    /// The base64 encoded HMAC-SHA-256 of the ciphertext.
    pub mac: String,
}

/// A secret storage key: 32 bytes from which per-secret encryption keys are
/// derived.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SecretStorageKey {
    key: Box<[u8; KEY_SIZE]>,
    #[zeroize(skip)]
    passphrase_info: Option<PassphraseInfo>,
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for SecretStorageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretStorageKey")
            .field("passphrase_based", &self.passphrase_info.is_some())
            .finish()
    }
}

impl SecretStorageKey {
    /// Create a new random secret storage key.
    ///
    /// The key can only be re-entered through its recovery key form.
    pub fn new() -> Self {
        let mut key = Box::new([0u8; KEY_SIZE]);
        thread_rng().fill_bytes(key.as_mut_slice());

        Self { key, passphrase_info: None }
    }

    /// Derive a new secret storage key from a passphrase.
    ///
    /// A random salt is generated and recorded in the key's passphrase
    /// info.
    pub fn from_passphrase(passphrase: &str) -> Self {
        let salt: String = thread_rng().sample_iter(Alphanumeric).take(32).map(char::from).collect();

        Self::from_passphrase_info(
            passphrase,
            PassphraseInfo {
                algorithm: PASSPHRASE_ALGORITHM.to_owned(),
                salt,
                iterations: DEFAULT_PBKDF_ITERATIONS,
                bits: 256,
            },
        )
    }

    /// Re-derive a secret storage key from a passphrase and the passphrase
    /// info of an existing key description.
    pub fn from_passphrase_info(passphrase: &str, info: PassphraseInfo) -> Self {
        let mut key = Box::new([0u8; KEY_SIZE]);
        pbkdf2_hmac::<Sha512>(
            passphrase.as_bytes(),
            info.salt.as_bytes(),
            info.iterations,
            key.as_mut_slice(),
        );

        Self { key, passphrase_info: Some(info) }
    }

    /// Rebuild a secret storage key from its base58 recovery key form.
    pub fn from_recovery_key(recovery_key: &str) -> Result<Self, DecodeError> {
        let key = decode_recovery_key(recovery_key)?;
        Ok(Self { key, passphrase_info: None })
    }

    /// The base58 recovery key form of this key.
    pub fn to_recovery_key(&self) -> String {
        encode_recovery_key(&self.key)
    }

    /// The passphrase info of this key, if it was derived from one.
    pub fn passphrase_info(&self) -> Option<&PassphraseInfo> {
        self.passphrase_info.as_ref()
    }

    fn cipher_key(&self, secret_name: &str) -> AesHmacSha2Key {
        AesHmacSha2Key::from_secret(&self.key, secret_name.as_bytes())
    }

    /// Create the public key description for this key.
    ///
    /// The description contains the MAC of an encrypted zero plaintext so
    /// that a candidate key can be checked with
    /// [`verify`](Self::verify).
    pub fn key_description(&self, name: &str) -> SecretStorageKeyDescription {
        let iv = AesHmacSha2Key::random_iv();
        let check = self.encrypt_helper(ZERO_PLAINTEXT.to_vec(), "", &iv);

        SecretStorageKeyDescription {
            name: name.to_owned(),
            algorithm: SECRET_STORAGE_V1_ALGORITHM.to_owned(),
            iv: utilities::encode(iv),
            mac: check.mac,
            passphrase: self.passphrase_info.clone(),
            signatures: Default::default(),
        }
    }

    /// Check this key against a key description.
    ///
    /// Re-encrypts the zero plaintext with the description's IV and
    /// compares the MAC in constant time.
    pub fn verify(
        &self,
        description: &SecretStorageKeyDescription,
    ) -> Result<bool, SecretStorageError> {
        if description.algorithm != SECRET_STORAGE_V1_ALGORITHM {
            return Err(SecretStorageError::UnsupportedAlgorithm(
                description.algorithm.clone(),
            ));
        }

        let iv = decode_iv(&description.iv)?;
        let mac = utilities::decode(&description.mac)?;

        let key = self.cipher_key("");
        let ciphertext = key.encrypt(ZERO_PLAINTEXT.to_vec(), &iv);

        Ok(key.verify_mac(&ciphertext, &mac).is_ok())
    }

    fn encrypt_helper(
        &self,
        plaintext: Vec<u8>,
        secret_name: &str,
        iv: &[u8; IV_SIZE],
    ) -> AesHmacSha2EncryptedData {
        let key = self.cipher_key(secret_name);
        let ciphertext = key.encrypt(plaintext, iv);
        let mac = key.mac(&ciphertext);

        AesHmacSha2EncryptedData {
            iv: utilities::encode(iv),
            ciphertext: utilities::encode(ciphertext),
            mac: utilities::encode(mac),
        }
    }

    /// Encrypt a secret under this key.
    ///
    /// The secret name goes into the key derivation, so every secret is
    /// encrypted under its own sub-key.
    pub fn encrypt(&self, secret: &[u8], secret_name: &str) -> AesHmacSha2EncryptedData {
        let iv = AesHmacSha2Key::random_iv();
        self.encrypt_helper(secret.to_vec(), secret_name, &iv)
    }

    /// Decrypt an encrypted secret.
    ///
    /// The MAC is verified in constant time before any decryption happens;
    /// a mismatch fails with [`SecretStorageError::Mac`].
    pub fn decrypt(
        &self,
        data: &AesHmacSha2EncryptedData,
        secret_name: &str,
    ) -> Result<Vec<u8>, SecretStorageError> {
        let iv = decode_iv(&data.iv)?;
        let ciphertext = utilities::decode(&data.ciphertext)?;
        let mac = utilities::decode(&data.mac)?;

        let key = self.cipher_key(secret_name);
        key.verify_mac(&ciphertext, &mac).map_err(|_| SecretStorageError::Mac)?;

        Ok(key.decrypt(ciphertext, &iv))
    }
}

impl Default for SecretStorageKey {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_iv(iv: &str) -> Result<[u8; IV_SIZE], SecretStorageError> {
    let iv = utilities::decode(iv)?;
    let len = iv.len();

    iv.try_into().map_err(|_| SecretStorageError::Length(IV_SIZE, len))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::{secret_names, SecretStorageKey};
    use crate::error::SecretStorageError;

    #[test]
    fn secret_round_trip() {
        let key = SecretStorageKey::new();

        let encrypted = key.encrypt(b"the backup key", secret_names::MEGOLM_BACKUP_V1);
        let decrypted = key.decrypt(&encrypted, secret_names::MEGOLM_BACKUP_V1).unwrap();

        assert_eq!(decrypted, b"the backup key");
    }

    #[test]
    fn wrong_key_fails_the_mac_check() {
        let key = SecretStorageKey::new();
        let other = SecretStorageKey::new();

        let encrypted = key.encrypt(b"the backup key", secret_names::MEGOLM_BACKUP_V1);

        assert_matches!(
            other.decrypt(&encrypted, secret_names::MEGOLM_BACKUP_V1),
            Err(SecretStorageError::Mac)
        );
    }

    #[test]
    fn wrong_secret_name_fails_the_mac_check() {
        let key = SecretStorageKey::new();

        let encrypted = key.encrypt(b"the master seed", secret_names::CROSS_SIGNING_MASTER);

        assert_matches!(
            key.decrypt(&encrypted, secret_names::CROSS_SIGNING_USER_SIGNING),
            Err(SecretStorageError::Mac)
        );
    }

    #[test]
    fn passphrase_keys_verify_against_their_description() {
        let key = SecretStorageKey::from_passphrase("it's a secret to everybody");
        let description = key.key_description("Default Key");

        assert!(key.verify(&description).unwrap());

        let wrong = SecretStorageKey::from_passphrase_info(
            "hunter2",
            key.passphrase_info().unwrap().clone(),
        );
        assert!(!wrong.verify(&description).unwrap());

        // The same passphrase with the recorded salt re-derives the key.
        let rederived = SecretStorageKey::from_passphrase_info(
            "it's a secret to everybody",
            key.passphrase_info().unwrap().clone(),
        );
        assert!(rederived.verify(&description).unwrap());
    }

    #[test]
    fn recovery_key_round_trip() {
        let key = SecretStorageKey::new();
        let description = key.key_description("Default Key");

        let recovery_key = key.to_recovery_key();
        let restored = SecretStorageKey::from_recovery_key(&recovery_key).unwrap();

        assert!(restored.verify(&description).unwrap());
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let key = SecretStorageKey::new();

        let mut encrypted = key.encrypt(b"some secret", "m.example");
        let mut raw = crate::utilities::decode(&encrypted.ciphertext).unwrap();
        raw[0] ^= 0x01;
        encrypted.ciphertext = crate::utilities::encode(raw);

        assert_matches!(key.decrypt(&encrypted, "m.example"), Err(SecretStorageError::Mac));
    }
}
