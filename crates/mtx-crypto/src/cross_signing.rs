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

//! Cross-signing: a portable user identity built from a master key that
//! signs the user's devices and two subordinate signing keys.

use std::collections::BTreeMap;

use ruma::{OwnedUserId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vodozemac::{Ed25519PublicKey, Ed25519SecretKey, Ed25519Signature};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{
    error::{SecretStorageError, SignatureError},
    secret_storage::{
        secret_names, AesHmacSha2EncryptedData, SecretStorageKey, SecretStorageKeyDescription,
    },
    types::{DeviceKeys, Signatures},
    utilities::{self, canonical_json},
};

/// An Ed25519 key pair for signing arbitrary JSON objects.
///
/// The seed is kept so the key can be stored in secret storage and
/// reconstructed on another device.
pub struct PkSigning {
    secret_key: Ed25519SecretKey,
    seed: SigningSeed,
    public_key: Ed25519PublicKey,
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct SigningSeed(Box<[u8; 32]>);

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for PkSigning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PkSigning").field("public_key", &self.public_key.to_base64()).finish()
    }
}

impl PkSigning {
    /// Create a new random signing key.
    pub fn new() -> Self {
        let mut seed = Box::new([0u8; 32]);
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), seed.as_mut_slice());

        Self::from_seed_boxed(SigningSeed(seed))
    }

    /// Reconstruct a signing key from its 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self::from_seed_boxed(SigningSeed(Box::new(*seed)))
    }

    /// Reconstruct a signing key from a base64 encoded seed, the form
    /// secrets are stored in.
    pub fn from_base64(seed: &str) -> Result<Self, SecretStorageError> {
        let decoded = utilities::decode(seed)?;
        let len = decoded.len();
        let mut seed: Box<[u8; 32]> =
            decoded.try_into().map_err(|_| SecretStorageError::Length(32, len))?;

        let key = Self::from_seed(&seed);
        seed.zeroize();

        Ok(key)
    }

    fn from_seed_boxed(seed: SigningSeed) -> Self {
        let secret_key = Ed25519SecretKey::from_slice(&seed.0);
        let public_key = secret_key.public_key();

        Self { secret_key, seed, public_key }
    }

    /// The public part of the key.
    pub fn public_key(&self) -> Ed25519PublicKey {
        self.public_key
    }

    /// The base64 encoded seed, the form that goes into secret storage.
    pub fn seed_base64(&self) -> String {
        utilities::encode(self.seed.0.as_slice())
    }

    /// Sign the given message.
    pub fn sign(&self, message: &str) -> Ed25519Signature {
        self.secret_key.sign(message.as_bytes())
    }

    /// Sign the canonical form of the given JSON object.
    pub fn sign_json(&self, value: Value) -> Result<String, SignatureError> {
        Ok(self.sign(&canonical_json(value)?).to_base64())
    }
}

impl Default for PkSigning {
    fn default() -> Self {
        Self::new()
    }
}

/// Verify an Ed25519 signature over the canonical form of a JSON object.
pub fn verify_json_signature(
    signing_key: &str,
    value: &Value,
    signature: &str,
) -> Result<(), SignatureError> {
    let key = Ed25519PublicKey::from_base64(signing_key)?;
    let signature = Ed25519Signature::from_base64(signature)
        .map_err(|_| SignatureError::VerificationError)?;

    let canonical = canonical_json(value.clone())?;

    key.verify(canonical.as_bytes(), &signature)?;

    Ok(())
}

/// A public cross-signing key object as uploaded to the server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CrossSigningKeys {
    /// The user the key belongs to.
    pub user_id: OwnedUserId,
    /// What the key is used for; `master`, `self_signing` or
    /// `user_signing`.
    pub usage: Vec<String>,
    /// The public key, keyed by `ed25519:<unpadded base64 of the key>`.
    pub keys: BTreeMap<String, String>,
    /// Signatures over the canonical form of this object.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub signatures: Signatures,
}

impl CrossSigningKeys {
    /// The first (and in practice only) public key in the object.
    pub fn get_first_key(&self) -> Option<&str> {
        self.keys.values().next().map(|k| k.as_str())
    }
}

/// The three public cross-signing key objects, signed and ready for
/// upload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CrossSigningBundle {
    /// The master key, self-signed.
    pub master_key: CrossSigningKeys,
    /// The self-signing key, signed by the master key.
    pub self_signing_key: CrossSigningKeys,
    /// The user-signing key, signed by the master key.
    pub user_signing_key: CrossSigningKeys,
}

/// The private cross-signing seeds, encrypted for secret storage.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CrossSigningSecrets {
    /// The encrypted master key seed.
    pub master: AesHmacSha2EncryptedData,
    /// The encrypted self-signing key seed.
    pub self_signing: AesHmacSha2EncryptedData,
    /// The encrypted user-signing key seed.
    pub user_signing: AesHmacSha2EncryptedData,
}

/// The private half of a user's cross-signing identity.
pub struct PrivateCrossSigningIdentity {
    user_id: OwnedUserId,
    master: PkSigning,
    self_signing: PkSigning,
    user_signing: PkSigning,
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for PrivateCrossSigningIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateCrossSigningIdentity")
            .field("user_id", &self.user_id)
            .field("master", &self.master.public_key().to_base64())
            .finish()
    }
}

impl PrivateCrossSigningIdentity {
    /// Bootstrap a fresh cross-signing identity with three new random
    /// keys.
    pub fn new(user_id: &UserId) -> Self {
        Self {
            user_id: user_id.to_owned(),
            master: PkSigning::new(),
            self_signing: PkSigning::new(),
            user_signing: PkSigning::new(),
        }
    }

    /// The user this identity belongs to.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The public part of the master key.
    pub fn master_public_key(&self) -> Ed25519PublicKey {
        self.master.public_key()
    }

    fn key_object(&self, key: &PkSigning, usage: &str) -> CrossSigningKeys {
        CrossSigningKeys {
            user_id: self.user_id.clone(),
            usage: vec![usage.to_owned()],
            keys: BTreeMap::from([(
                format!("ed25519:{}", key.public_key().to_base64()),
                key.public_key().to_base64(),
            )]),
            signatures: Default::default(),
        }
    }

    fn master_key_id(&self) -> String {
        format!("ed25519:{}", self.master.public_key().to_base64())
    }

    /// The signed public key objects, ready for upload.
    ///
    /// The master key signs itself and the two subordinate keys.
    pub fn public_keys(&self) -> Result<CrossSigningBundle, SignatureError> {
        let mut master_key = self.key_object(&self.master, "master");
        let signature = self.master.sign_json(serde_json::to_value(&master_key)?)?;
        master_key
            .signatures
            .entry(self.user_id.clone())
            .or_default()
            .insert(self.master_key_id(), signature);

        let mut self_signing_key = self.key_object(&self.self_signing, "self_signing");
        let signature = self.master.sign_json(serde_json::to_value(&self_signing_key)?)?;
        self_signing_key
            .signatures
            .entry(self.user_id.clone())
            .or_default()
            .insert(self.master_key_id(), signature);

        let mut user_signing_key = self.key_object(&self.user_signing, "user_signing");
        let signature = self.master.sign_json(serde_json::to_value(&user_signing_key)?)?;
        user_signing_key
            .signatures
            .entry(self.user_id.clone())
            .or_default()
            .insert(self.master_key_id(), signature);

        Ok(CrossSigningBundle { master_key, self_signing_key, user_signing_key })
    }

    /// Sign one of our own device key bundles with the self-signing key.
    pub fn sign_device_keys(&self, device_keys: &mut DeviceKeys) -> Result<(), SignatureError> {
        let signature = self.self_signing.sign_json(serde_json::to_value(&*device_keys)?)?;

        device_keys
            .signatures
            .entry(self.user_id.clone())
            .or_default()
            .insert(format!("ed25519:{}", self.self_signing.public_key().to_base64()), signature);

        Ok(())
    }

    /// Sign another user's master key with the user-signing key.
    pub fn sign_user_master_key(
        &self,
        master_key: &mut CrossSigningKeys,
    ) -> Result<(), SignatureError> {
        let signature = self.user_signing.sign_json(serde_json::to_value(&*master_key)?)?;

        master_key
            .signatures
            .entry(self.user_id.clone())
            .or_default()
            .insert(format!("ed25519:{}", self.user_signing.public_key().to_base64()), signature);

        Ok(())
    }

    /// Sign the canonical form of an arbitrary JSON object with the master
    /// key.
    pub fn sign_with_master(&self, value: Value) -> Result<String, SignatureError> {
        self.master.sign_json(value)
    }

    /// Sign a secret storage key description with the master key, marking
    /// it as trusted by this identity.
    pub fn sign_key_description(
        &self,
        description: &mut SecretStorageKeyDescription,
    ) -> Result<(), SignatureError> {
        let signature = self.master.sign_json(serde_json::to_value(&*description)?)?;

        description
            .signatures
            .entry(self.user_id.clone())
            .or_default()
            .insert(self.master_key_id(), signature);

        Ok(())
    }

    /// Encrypt the three private seeds for secret storage.
    pub fn export_secrets(&self, key: &SecretStorageKey) -> CrossSigningSecrets {
        CrossSigningSecrets {
            master: key.encrypt(
                self.master.seed_base64().as_bytes(),
                secret_names::CROSS_SIGNING_MASTER,
            ),
            self_signing: key.encrypt(
                self.self_signing.seed_base64().as_bytes(),
                secret_names::CROSS_SIGNING_SELF_SIGNING,
            ),
            user_signing: key.encrypt(
                self.user_signing.seed_base64().as_bytes(),
                secret_names::CROSS_SIGNING_USER_SIGNING,
            ),
        }
    }

    /// Restore an identity from its secret storage form.
    pub fn from_secrets(
        user_id: &UserId,
        key: &SecretStorageKey,
        secrets: &CrossSigningSecrets,
    ) -> Result<Self, SecretStorageError> {
        let decrypt_seed = |data, name| -> Result<PkSigning, SecretStorageError> {
            let mut seed = key.decrypt(data, name)?;
            let signing = PkSigning::from_base64(std::str::from_utf8(&seed).map_err(|_| {
                SecretStorageError::Length(32, seed.len())
            })?)?;
            seed.zeroize();

            Ok(signing)
        };

        Ok(Self {
            user_id: user_id.to_owned(),
            master: decrypt_seed(&secrets.master, secret_names::CROSS_SIGNING_MASTER)?,
            self_signing: decrypt_seed(
                &secrets.self_signing,
                secret_names::CROSS_SIGNING_SELF_SIGNING,
            )?,
            user_signing: decrypt_seed(
                &secrets.user_signing,
                secret_names::CROSS_SIGNING_USER_SIGNING,
            )?,
        })
    }
}

#[cfg(test)]
mod tests {
    use ruma::user_id;

    use super::{verify_json_signature, PkSigning, PrivateCrossSigningIdentity};
    use crate::secret_storage::SecretStorageKey;

    #[test]
    fn seed_round_trip() {
        let signing = PkSigning::new();
        let restored = PkSigning::from_base64(&signing.seed_base64()).unwrap();

        assert_eq!(signing.public_key(), restored.public_key());

        let message = "a message worth signing";
        assert_eq!(signing.sign(message).to_base64(), restored.sign(message).to_base64());
    }

    #[test]
    fn bootstrap_produces_verifiable_signatures() {
        let identity = PrivateCrossSigningIdentity::new(user_id!("@alice:example.org"));
        let bundle = identity.public_keys().unwrap();

        let master_key = identity.master_public_key().to_base64();
        let master_key_id = format!("ed25519:{master_key}");

        for object in [&bundle.master_key, &bundle.self_signing_key, &bundle.user_signing_key] {
            let signature = object
                .signatures
                .get(user_id!("@alice:example.org"))
                .and_then(|s| s.get(&master_key_id))
                .expect("every key object is signed by the master key");

            verify_json_signature(
                &master_key,
                &serde_json::to_value(object).unwrap(),
                signature,
            )
            .unwrap();
        }
    }

    #[test]
    fn device_keys_get_a_self_signing_signature() {
        let user_id = user_id!("@alice:example.org");
        let identity = PrivateCrossSigningIdentity::new(user_id);
        let account = crate::olm::Account::new(user_id, ruma::device_id!("ALICEDEVICE"));

        let mut device_keys = account.device_keys().unwrap();
        identity.sign_device_keys(&mut device_keys).unwrap();

        let bundle = identity.public_keys().unwrap();
        let self_signing_key = bundle.self_signing_key.get_first_key().unwrap();

        let signature = device_keys
            .signatures
            .get(user_id)
            .and_then(|s| s.get(&format!("ed25519:{self_signing_key}")))
            .unwrap();

        verify_json_signature(
            self_signing_key,
            &serde_json::to_value(&device_keys).unwrap(),
            signature,
        )
        .unwrap();
    }

    #[test]
    fn secrets_round_trip_through_secret_storage() {
        let user_id = user_id!("@alice:example.org");
        let identity = PrivateCrossSigningIdentity::new(user_id);
        let key = SecretStorageKey::new();

        let secrets = identity.export_secrets(&key);
        let restored =
            PrivateCrossSigningIdentity::from_secrets(user_id, &key, &secrets).unwrap();

        assert_eq!(identity.master_public_key(), restored.master_public_key());
    }

    #[test]
    fn key_description_signing_verifies() {
        let identity = PrivateCrossSigningIdentity::new(user_id!("@alice:example.org"));
        let storage_key = SecretStorageKey::new();

        let mut description = storage_key.key_description("Default Key");
        identity.sign_key_description(&mut description).unwrap();

        let master_key = identity.master_public_key().to_base64();
        let signature = description
            .signatures
            .get(user_id!("@alice:example.org"))
            .and_then(|s| s.get(&format!("ed25519:{master_key}")))
            .unwrap();

        verify_json_signature(
            &master_key,
            &serde_json::to_value(&description).unwrap(),
            signature,
        )
        .unwrap();
    }
}
