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

use std::{collections::BTreeMap, fmt};

use ruma::{DeviceId, OwnedDeviceId, OwnedUserId, SecondsSinceUnixEpoch, UserId};
use serde::{Deserialize, Serialize};
use serde_json::json;
use vodozemac::{
    olm::{Account as InnerAccount, AccountPickle, IdentityKeys, PreKeyMessage, SessionConfig},
    Curve25519PublicKey, Ed25519Signature, KeyId, PickleError,
};

use super::Session;
use crate::{
    error::{OlmError, SignatureError},
    types::{DeviceKeys, SignedOneTimeKey, MEGOLM_V1_ALGORITHM, OLM_V1_ALGORITHM},
    utilities::canonical_json,
};

/// The result of creating an inbound session from a pre-key message.
pub struct InboundCreationResult {
    /// The newly created session.
    pub session: Session,
    /// The plaintext of the pre-key message that established the session.
    pub plaintext: Vec<u8>,
}

/// A long-lived per-device identity.
///
/// The account owns the device's Curve25519 and Ed25519 identity keys, the
/// pool of one-time keys, and at most one current plus one previous fallback
/// key. It is a single-writer value: the methods that mutate key material
/// take `&mut self` and callers are expected to serialize them.
pub struct Account {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    inner: InnerAccount,
    identity_keys: IdentityKeys,
    shared: bool,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("identity_keys", &self.identity_keys)
            .field("shared", &self.shared)
            .finish()
    }
}

impl Account {
    /// Create a fresh account with random identity keys for the given
    /// device.
    pub fn new(user_id: &UserId, device_id: &DeviceId) -> Self {
        let inner = InnerAccount::new();
        let identity_keys = inner.identity_keys();

        Self {
            user_id: user_id.to_owned(),
            device_id: device_id.to_owned(),
            inner,
            identity_keys,
            shared: false,
        }
    }

    /// The user this account belongs to.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The device this account belongs to.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// The public parts of the identity key pair.
    ///
    /// These never change over the lifetime of the account.
    pub fn identity_keys(&self) -> IdentityKeys {
        self.identity_keys
    }

    /// The public Curve25519 identity key.
    pub fn curve25519_key(&self) -> Curve25519PublicKey {
        self.identity_keys.curve25519
    }

    /// Has the account published its device keys to the server.
    pub fn shared(&self) -> bool {
        self.shared
    }

    /// Mark the account's device keys as published.
    pub fn mark_as_shared(&mut self) {
        self.shared = true;
    }

    /// Sign the given message with our Ed25519 identity key.
    pub fn sign(&self, message: &str) -> Ed25519Signature {
        self.inner.sign(message)
    }

    /// Sign the given JSON object in its canonical form.
    ///
    /// The `signatures` and `unsigned` fields are removed before the object
    /// is serialized with sorted keys and no insignificant whitespace.
    pub fn sign_json(&self, value: serde_json::Value) -> Result<String, SignatureError> {
        let canonical = canonical_json(value)?;
        Ok(self.sign(&canonical).to_base64())
    }

    fn unsigned_device_keys(&self) -> DeviceKeys {
        DeviceKeys {
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            algorithms: vec![OLM_V1_ALGORITHM.to_owned(), MEGOLM_V1_ALGORITHM.to_owned()],
            keys: BTreeMap::from([
                (
                    format!("curve25519:{}", self.device_id),
                    self.identity_keys.curve25519.to_base64(),
                ),
                (format!("ed25519:{}", self.device_id), self.identity_keys.ed25519.to_base64()),
            ]),
            signatures: Default::default(),
        }
    }

    /// The signed device key bundle for the `/keys/upload` request.
    pub fn device_keys(&self) -> Result<DeviceKeys, SignatureError> {
        let mut device_keys = self.unsigned_device_keys();

        let signature = self.sign_identity_keys()?;

        device_keys
            .signatures
            .entry(self.user_id.clone())
            .or_default()
            .insert(format!("ed25519:{}", self.device_id), signature);

        Ok(device_keys)
    }

    /// Sign the public identity key bundle, returning the base64 encoded
    /// signature.
    pub fn sign_identity_keys(&self) -> Result<String, SignatureError> {
        self.sign_json(serde_json::to_value(self.unsigned_device_keys())?)
    }

    /// The maximum number of one-time keys the account can hold.
    pub fn max_one_time_keys(&self) -> usize {
        self.inner.max_number_of_one_time_keys()
    }

    /// Generate up to `count` new one-time keys.
    ///
    /// Returns the number of keys that were actually generated, which is
    /// bounded by the ratchet's maximum.
    pub fn generate_one_time_keys(&mut self, count: usize) -> usize {
        let count = count.min(self.max_one_time_keys());
        self.inner.generate_one_time_keys(count);

        count
    }

    /// The one-time keys that haven't been published to the server yet.
    pub fn one_time_keys(&self) -> std::collections::HashMap<KeyId, Curve25519PublicKey> {
        self.inner.one_time_keys()
    }

    /// Generate a new fallback key.
    ///
    /// The previously generated fallback key, if any, is retained and stays
    /// valid for inbound session creation until
    /// [`forget_old_fallback_key`](Self::forget_old_fallback_key) is called.
    /// Returns the public part of the retired key.
    pub fn generate_fallback_key(&mut self) -> Option<Curve25519PublicKey> {
        self.inner.generate_fallback_key()
    }

    /// The fallback key that hasn't been published to the server yet.
    pub fn fallback_key(&self) -> std::collections::HashMap<KeyId, Curve25519PublicKey> {
        self.inner.fallback_key()
    }

    /// Drop the previous fallback key.
    ///
    /// Call this once the new fallback key has been published and enough
    /// time has passed for in-flight pre-key messages to have arrived.
    pub fn forget_old_fallback_key(&mut self) -> bool {
        self.inner.forget_fallback_key()
    }

    /// Mark the current set of one-time and fallback keys as published.
    ///
    /// The account stops listing them in
    /// [`one_time_keys`](Self::one_time_keys) and
    /// [`fallback_key`](Self::fallback_key).
    pub fn mark_keys_as_published(&mut self) {
        self.inner.mark_keys_as_published();
    }

    /// Sign a single one-time or fallback key.
    pub fn sign_one_time_key(
        &self,
        key: Curve25519PublicKey,
        fallback: bool,
    ) -> Result<SignedOneTimeKey, SignatureError> {
        let json = if fallback {
            json!({ "key": key.to_base64(), "fallback": true })
        } else {
            json!({ "key": key.to_base64() })
        };

        let signature = self.sign_json(json)?;

        let mut signatures: crate::types::Signatures = Default::default();
        signatures
            .entry(self.user_id.clone())
            .or_default()
            .insert(format!("ed25519:{}", self.device_id), signature);

        Ok(SignedOneTimeKey { key: key.to_base64(), fallback, signatures })
    }

    /// Sign every unpublished one-time key for the `/keys/upload` request.
    ///
    /// The map is keyed by `signed_curve25519:<key id>`.
    pub fn signed_one_time_keys(
        &self,
    ) -> Result<BTreeMap<String, SignedOneTimeKey>, SignatureError> {
        self.one_time_keys()
            .into_iter()
            .map(|(key_id, key)| {
                Ok((
                    format!("signed_curve25519:{}", key_id.to_base64()),
                    self.sign_one_time_key(key, false)?,
                ))
            })
            .collect()
    }

    /// Sign the unpublished fallback key for the `/keys/upload` request.
    pub fn signed_fallback_keys(
        &self,
    ) -> Result<BTreeMap<String, SignedOneTimeKey>, SignatureError> {
        self.fallback_key()
            .into_iter()
            .map(|(key_id, key)| {
                Ok((
                    format!("signed_curve25519:{}", key_id.to_base64()),
                    self.sign_one_time_key(key, true)?,
                ))
            })
            .collect()
    }

    /// Create a new outbound session to the device owning the given identity
    /// key, using one of its claimed one-time keys.
    ///
    /// No network I/O happens here; claiming the one-time key is the
    /// caller's business.
    pub fn create_outbound_session(
        &self,
        their_identity_key: Curve25519PublicKey,
        their_one_time_key: Curve25519PublicKey,
    ) -> Session {
        let session = self.inner.create_outbound_session(
            SessionConfig::version_1(),
            their_identity_key,
            their_one_time_key,
        );

        let now = SecondsSinceUnixEpoch::now();
        let session_id = session.session_id();

        Session {
            inner: session,
            session_id,
            sender_key: their_identity_key,
            creation_time: now,
            last_use_time: now,
        }
    }

    /// Create an inbound session from a pre-key message.
    ///
    /// On success the one-time key that the message used is removed from the
    /// account and the first plaintext is returned along with the session.
    pub fn create_inbound_session(
        &mut self,
        their_identity_key: Curve25519PublicKey,
        message: &PreKeyMessage,
    ) -> Result<InboundCreationResult, OlmError> {
        let result = self.inner.create_inbound_session(their_identity_key, message)?;

        let now = SecondsSinceUnixEpoch::now();
        let session_id = result.session.session_id();

        Ok(InboundCreationResult {
            session: Session {
                inner: result.session,
                session_id,
                sender_key: their_identity_key,
                creation_time: now,
                last_use_time: now,
            },
            plaintext: result.plaintext,
        })
    }

    /// Store the account as an encrypted pickle.
    pub fn pickle(&self, pickle_key: &[u8; 32]) -> PickledAccount {
        PickledAccount {
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            pickle: self.inner.pickle().encrypt(pickle_key),
            shared: self.shared,
        }
    }

    /// Restore an account from a previously pickled form.
    ///
    /// Fails with a [`PickleError`] if the pickle key is wrong or the pickle
    /// is corrupted.
    pub fn from_pickle(pickle: PickledAccount, pickle_key: &[u8; 32]) -> Result<Self, PickleError> {
        let account_pickle = AccountPickle::from_encrypted(&pickle.pickle, pickle_key)?;
        let inner = InnerAccount::from_pickle(account_pickle);
        let identity_keys = inner.identity_keys();

        Ok(Self {
            user_id: pickle.user_id,
            device_id: pickle.device_id,
            inner,
            identity_keys,
            shared: pickle.shared,
        })
    }
}

impl PartialEq for Account {
    fn eq(&self, other: &Self) -> bool {
        self.identity_keys == other.identity_keys && self.shared == other.shared
    }
}

/// A pickled version of an [`Account`].
///
/// Holds everything that needs to be stored to restore the account, with the
/// ratchet state encrypted under the pickle key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PickledAccount {
    /// The user id of the account owner.
    pub user_id: OwnedUserId,
    /// The device id of the account owner.
    pub device_id: OwnedDeviceId,
    /// The encrypted pickle holding the ratchet state.
    pub pickle: String,
    /// Was the account published to the server.
    pub shared: bool,
}

#[cfg(test)]
mod tests {
    use ruma::{device_id, user_id, DeviceId, UserId};

    use super::Account;

    fn alice_id() -> &'static UserId {
        user_id!("@alice:example.org")
    }

    fn alice_device_id() -> &'static DeviceId {
        device_id!("ALICEDEVICE")
    }

    #[test]
    fn one_time_key_generation_is_bounded() {
        let mut account = Account::new(alice_id(), alice_device_id());

        let generated = account.generate_one_time_keys(10);
        assert_eq!(generated, 10);
        assert_eq!(account.one_time_keys().len(), 10);

        let generated = account.generate_one_time_keys(usize::MAX);
        assert!(generated <= account.max_one_time_keys());
    }

    #[test]
    fn published_keys_are_no_longer_listed() {
        let mut account = Account::new(alice_id(), alice_device_id());

        account.generate_one_time_keys(5);
        account.mark_keys_as_published();

        assert!(account.one_time_keys().is_empty());
    }

    #[test]
    fn fallback_key_rotation_retains_the_previous_key() {
        let mut account = Account::new(alice_id(), alice_device_id());

        assert!(account.generate_fallback_key().is_none());
        let old_key = account.fallback_key().into_values().next().unwrap();

        let retired = account.generate_fallback_key();
        assert_eq!(retired, Some(old_key));

        account.forget_old_fallback_key();
    }

    #[test]
    fn device_keys_are_signed() {
        let account = Account::new(alice_id(), alice_device_id());
        let device_keys = account.device_keys().unwrap();

        let signature = device_keys
            .signatures
            .get(alice_id())
            .and_then(|s| s.get(&format!("ed25519:{}", alice_device_id())))
            .unwrap();

        let canonical =
            crate::utilities::canonical_json(serde_json::to_value(&device_keys).unwrap()).unwrap();

        let signature = vodozemac::Ed25519Signature::from_base64(signature).unwrap();
        account
            .identity_keys()
            .ed25519
            .verify(canonical.as_bytes(), &signature)
            .expect("the device keys should verify against the identity key");
    }

    #[test]
    fn signed_one_time_keys_have_the_fallback_flag() {
        let mut account = Account::new(alice_id(), alice_device_id());

        account.generate_one_time_keys(2);
        account.generate_fallback_key();

        let one_time_keys = account.signed_one_time_keys().unwrap();
        assert_eq!(one_time_keys.len(), 2);
        assert!(one_time_keys.values().all(|k| !k.fallback));

        let fallback_keys = account.signed_fallback_keys().unwrap();
        assert_eq!(fallback_keys.len(), 1);
        assert!(fallback_keys.values().all(|k| k.fallback));
    }

    #[test]
    fn pickle_round_trip() {
        let pickle_key = [0u8; 32];
        let account = Account::new(alice_id(), alice_device_id());

        let pickle = account.pickle(&pickle_key);
        let restored = Account::from_pickle(pickle, &pickle_key).unwrap();

        assert_eq!(account.identity_keys(), restored.identity_keys());
    }

    #[test]
    fn pickle_with_wrong_key_fails() {
        let account = Account::new(alice_id(), alice_device_id());
        let pickle = account.pickle(&[0u8; 32]);

        Account::from_pickle(pickle, &[1u8; 32]).unwrap_err();
    }
}
