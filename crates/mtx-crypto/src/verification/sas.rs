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

use thiserror::Error;
use vodozemac::{
    sas::{EstablishedSas, Mac, Sas as InnerSas},
    Curve25519PublicKey,
};

use super::emoji_from_index;

/// Error type for the SAS primitive operations.
#[derive(Debug, Error)]
pub enum SasError {
    /// A generated value was requested before the other side's key was set.
    #[error("the other side's public key hasn't been set yet")]
    TheirKeyNotSet,

    /// `set_their_key` was called twice.
    #[error("the other side's public key was already set")]
    TheirKeyAlreadySet,

    /// The other side's key couldn't be used to establish a shared secret.
    #[error("the other side's public key couldn't be used to establish a shared secret")]
    InvalidKey,

    /// A MAC we should verify wasn't valid base64.
    #[error("the MAC couldn't be decoded")]
    InvalidMac,

    /// A MAC didn't match the value we calculated ourselves.
    #[error("the MAC didn't match the calculated one")]
    MacMismatch,
}

/// An ephemeral Curve25519 key pair used to agree on a short authentication
/// string.
///
/// The object starts out with only our key pair; once the other side's
/// public key is set the shared secret is derived and bytes, emoji and MACs
/// can be generated.
pub struct Sas {
    inner: Option<InnerSas>,
    established: Option<EstablishedSas>,
    public_key: Curve25519PublicKey,
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for Sas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sas")
            .field("public_key", &self.public_key.to_base64())
            .field("established", &self.established.is_some())
            .finish()
    }
}

impl Default for Sas {
    fn default() -> Self {
        Self::new()
    }
}

impl Sas {
    /// Create a new SAS object with a fresh ephemeral key pair.
    pub fn new() -> Self {
        let inner = InnerSas::new();
        let public_key = inner.public_key();

        Self { inner: Some(inner), established: None, public_key }
    }

    /// Our ephemeral public key, to be sent to the other side.
    pub fn public_key(&self) -> Curve25519PublicKey {
        self.public_key
    }

    /// Set the ephemeral public key of the other side and derive the shared
    /// secret.
    pub fn set_their_key(&mut self, their_public_key: Curve25519PublicKey) -> Result<(), SasError> {
        let sas = self.inner.take().ok_or(SasError::TheirKeyAlreadySet)?;

        self.established =
            Some(sas.diffie_hellman(their_public_key).map_err(|_| SasError::InvalidKey)?);

        Ok(())
    }

    fn established(&self) -> Result<&EstablishedSas, SasError> {
        self.established.as_ref().ok_or(SasError::TheirKeyNotSet)
    }

    /// Generate the three decimal numbers of the short auth string.
    ///
    /// Each number is in the range 1000 to 9191 inclusive. The `info` string
    /// binds the bytes to the verification flow; both sides must use the
    /// same one.
    pub fn bytes_decimal(&self, info: &str) -> Result<(u16, u16, u16), SasError> {
        let bytes = self.established()?.bytes(info);
        Ok(bytes_to_decimal(bytes.as_bytes()))
    }

    /// Generate the seven emoji indices of the short auth string.
    ///
    /// Each index is in the range 0 to 63 inclusive.
    pub fn bytes_emoji_index(&self, info: &str) -> Result<[u8; 7], SasError> {
        let bytes = self.established()?.bytes(info);
        Ok(bytes_to_emoji_index(bytes.as_bytes()))
    }

    /// Generate the seven emoji of the short auth string, as emoji plus
    /// English description tuples.
    pub fn bytes_emoji(&self, info: &str) -> Result<[(&'static str, &'static str); 7], SasError> {
        let indices = self.bytes_emoji_index(info)?;
        Ok(indices.map(emoji_from_index))
    }

    /// Calculate a MAC over the given input, keyed from the shared secret
    /// and the `info` string.
    pub fn calculate_mac(&self, input: &str, info: &str) -> Result<String, SasError> {
        Ok(self.established()?.calculate_mac(input, info).to_base64())
    }

    /// Verify a base64 encoded MAC the other side calculated over the given
    /// input.
    pub fn verify_mac(&self, input: &str, info: &str, mac: &str) -> Result<(), SasError> {
        let mac = Mac::from_base64(mac).map_err(|_| SasError::InvalidMac)?;

        self.established()?
            .verify_mac(input, info, &mac)
            .map_err(|_| SasError::MacMismatch)
    }
}

/// Convert the first five generated bytes into the three decimal numbers of
/// the short auth string.
///
/// This is the bitwise packing the Matrix specification defines: three
/// 13-bit chunks, each offset by 1000.
pub fn bytes_to_decimal(bytes: &[u8]) -> (u16, u16, u16) {
    let b: Vec<u16> = bytes.iter().map(|b| *b as u16).collect();

    let first = (b[0] << 5) | (b[1] >> 3);
    let second = ((b[1] & 0x7) << 10) | (b[2] << 2) | (b[3] >> 6);
    let third = ((b[3] & 0x3F) << 7) | (b[4] >> 1);

    (first + 1000, second + 1000, third + 1000)
}

/// Convert the first six generated bytes into seven 6-bit emoji indices.
pub fn bytes_to_emoji_index(bytes: &[u8]) -> [u8; 7] {
    let b: Vec<u64> = bytes.iter().map(|b| *b as u64).collect();

    // Join the six bytes into one 64 bit unsigned int, leaving 48 relevant
    // bits, and cut the top 42 of them into 6 bit chunks.
    let num: u64 = (b[0] << 40) | (b[1] << 32) | (b[2] << 24) | (b[3] << 16) | (b[4] << 8) | b[5];

    [
        ((num >> 42) & 63) as u8,
        ((num >> 36) & 63) as u8,
        ((num >> 30) & 63) as u8,
        ((num >> 24) & 63) as u8,
        ((num >> 18) & 63) as u8,
        ((num >> 12) & 63) as u8,
        ((num >> 6) & 63) as u8,
    ]
}
