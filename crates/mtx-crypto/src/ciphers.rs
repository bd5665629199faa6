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

//! The AES-256-CTR + HMAC-SHA-256 envelope shared by secret storage, session
//! backups, key exports and the store pickle format.

use aes::{
    cipher::{generic_array::GenericArray, KeyIvInit, StreamCipher},
    Aes256,
};
use ctr::Ctr128BE;
use hkdf::Hkdf;
use hmac::{Hmac, Mac as MacT};
use rand::{thread_rng, RngCore};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

type Aes256Ctr = Ctr128BE<Aes256>;
type HmacSha256 = Hmac<Sha256>;

pub(crate) const KEY_SIZE: usize = 32;
pub(crate) const IV_SIZE: usize = 16;
pub(crate) const MAC_SIZE: usize = 32;

/// An encryption and a MAC key expanded from a single 32-byte secret.
///
/// The expansion is HKDF-SHA-256 with a zeroed salt; the `info` input binds
/// the key pair to its purpose (the secret name, the pickle kind, or empty
/// for backups).
#[derive(Zeroize, ZeroizeOnDrop)]
pub(crate) struct AesHmacSha2Key {
    aes_key: Box<[u8; KEY_SIZE]>,
    mac_key: Box<[u8; KEY_SIZE]>,
}

impl AesHmacSha2Key {
    pub(crate) fn from_secret(secret: &[u8; KEY_SIZE], info: &[u8]) -> Self {
        let mut expanded = [0u8; KEY_SIZE * 2];

        Hkdf::<Sha256>::new(Some(&[0u8; KEY_SIZE]), secret)
            .expand(info, &mut expanded)
            .expect("two keys are a valid HKDF-SHA-256 output length");

        let key = Self::from_expanded(&expanded);
        expanded.zeroize();

        key
    }

    /// Expand a shared secret into an encryption key, a MAC key and an IV.
    ///
    /// Used where the wire format carries no IV, so the IV has to be
    /// derivable by both sides; the secret must be unique per message.
    pub(crate) fn from_secret_with_iv(
        secret: &[u8; KEY_SIZE],
        info: &[u8],
    ) -> (Self, [u8; IV_SIZE]) {
        let mut expanded = [0u8; KEY_SIZE * 2 + IV_SIZE];

        Hkdf::<Sha256>::new(Some(&[0u8; KEY_SIZE]), secret)
            .expand(info, &mut expanded)
            .expect("two keys and an IV are a valid HKDF-SHA-256 output length");

        let key = Self::from_expanded(
            expanded[..KEY_SIZE * 2].try_into().expect("the buffer is large enough"),
        );
        let iv = expanded[KEY_SIZE * 2..].try_into().expect("the buffer is large enough");

        expanded.zeroize();

        (key, iv)
    }

    /// Split a pre-expanded 64-byte buffer into the AES and MAC halves.
    ///
    /// Used by the key export format, which expands its keys with PBKDF2
    /// instead of HKDF.
    pub(crate) fn from_expanded(expanded: &[u8; KEY_SIZE * 2]) -> Self {
        let mut aes_key = Box::new([0u8; KEY_SIZE]);
        let mut mac_key = Box::new([0u8; KEY_SIZE]);

        aes_key.copy_from_slice(&expanded[..KEY_SIZE]);
        mac_key.copy_from_slice(&expanded[KEY_SIZE..]);

        Self { aes_key, mac_key }
    }

    /// Generate a random AES-CTR IV with the top bit of the counter half
    /// cleared, so the counter can't overflow into the nonce.
    pub(crate) fn random_iv() -> [u8; IV_SIZE] {
        let mut iv = [0u8; IV_SIZE];
        thread_rng().fill_bytes(&mut iv);
        iv[8] &= 0x7F;

        iv
    }

    pub(crate) fn apply_keystream(&self, mut data: Vec<u8>, iv: &[u8; IV_SIZE]) -> Vec<u8> {
        let mut cipher = Aes256Ctr::new(
            GenericArray::from_slice(self.aes_key.as_slice()),
            GenericArray::from_slice(iv),
        );
        cipher.apply_keystream(&mut data);

        data
    }

    pub(crate) fn encrypt(&self, plaintext: Vec<u8>, iv: &[u8; IV_SIZE]) -> Vec<u8> {
        self.apply_keystream(plaintext, iv)
    }

    pub(crate) fn decrypt(&self, ciphertext: Vec<u8>, iv: &[u8; IV_SIZE]) -> Vec<u8> {
        self.apply_keystream(ciphertext, iv)
    }

    pub(crate) fn mac(&self, message: &[u8]) -> [u8; MAC_SIZE] {
        let mut hmac = HmacSha256::new_from_slice(self.mac_key.as_slice())
            .expect("a 32 byte key is a valid HMAC key");
        hmac.update(message);

        hmac.finalize().into_bytes().into()
    }

    /// Verify the MAC of the message in constant time.
    pub(crate) fn verify_mac(&self, message: &[u8], mac: &[u8]) -> Result<(), MacError> {
        let mut hmac = HmacSha256::new_from_slice(self.mac_key.as_slice())
            .expect("a 32 byte key is a valid HMAC key");
        hmac.update(message);

        hmac.verify_slice(mac).map_err(|_| MacError)
    }
}

/// The MAC of a message failed to verify.
#[derive(Debug, thiserror::Error)]
#[error("the MAC didn't match")]
pub(crate) struct MacError;
