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

use base64::{
    alphabet,
    engine::{general_purpose, DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    Engine,
};
use ruma::CanonicalJsonValue;
use serde_json::Value;
use thiserror::Error;
use zeroize::Zeroize;

use crate::error::SignatureError;

pub use base64::DecodeError as Base64DecodeError;

const STANDARD_NO_PAD: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    general_purpose::NO_PAD
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

const URL_SAFE_NO_PAD: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Decode the input as base64 with no padding.
pub fn decode(input: impl AsRef<[u8]>) -> Result<Vec<u8>, Base64DecodeError> {
    STANDARD_NO_PAD.decode(input)
}

/// Encode the input as base64 with no padding.
pub fn encode(input: impl AsRef<[u8]>) -> String {
    STANDARD_NO_PAD.encode(input)
}

/// Decode the input as URL-safe base64 with no padding.
pub fn decode_url_safe(input: impl AsRef<[u8]>) -> Result<Vec<u8>, Base64DecodeError> {
    URL_SAFE_NO_PAD.decode(input)
}

/// Encode the input as URL-safe base64 with no padding.
pub fn encode_url_safe(input: impl AsRef<[u8]>) -> String {
    URL_SAFE_NO_PAD.encode(input)
}

/// Serialize the given JSON object into the canonical form that gets signed.
///
/// The `signatures` and `unsigned` fields are stripped, keys are sorted and
/// insignificant whitespace is removed.
pub fn canonical_json(mut value: Value) -> Result<String, SignatureError> {
    let json = value.as_object_mut().ok_or(SignatureError::NotAnObject)?;

    json.remove("signatures");
    json.remove("unsigned");

    let canonical: CanonicalJsonValue = value.try_into()?;

    Ok(canonical.to_string())
}

const RECOVERY_KEY_PREFIX: [u8; 2] = [0x8B, 0x01];
const RECOVERY_KEY_LEN: usize = 2 + 32 + 1;

/// Error type for the decoding of binary key material, recovery keys in
/// particular.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The key wasn't valid base64.
    #[error(transparent)]
    Base64(#[from] Base64DecodeError),
    /// The key wasn't valid base58.
    #[error(transparent)]
    Base58(#[from] bs58::decode::Error),
    /// The decoded key has an invalid prefix.
    #[error("the decoded key has an invalid prefix: expected {0:?}, got {1:?}")]
    Prefix([u8; 2], [u8; 2]),
    /// The parity byte of the decoded key didn't match.
    #[error("the parity byte of the key doesn't match: expected {0:#02x}, got {1:#02x}")]
    Parity(u8, u8),
    /// The decoded key has an invalid length.
    #[error("the decoded key has an invalid length: expected {0}, got {1}")]
    Length(usize, usize),
    /// The key isn't a valid public key.
    #[error(transparent)]
    PublicKey(#[from] vodozemac::KeyError),
    /// The bytes aren't a valid Olm or Megolm message.
    #[error(transparent)]
    Message(#[from] vodozemac::DecodeError),
    /// The string isn't a valid Megolm session key.
    #[error(transparent)]
    SessionKey(#[from] vodozemac::megolm::SessionKeyDecodeError),
}

/// Encode a 32-byte key in the base58 recovery key form.
///
/// The encoding carries a two byte prefix and a trailing parity byte that is
/// the XOR of every other byte in the buffer.
pub fn encode_recovery_key(key: &[u8; 32]) -> String {
    let mut bytes = Vec::with_capacity(RECOVERY_KEY_LEN);

    bytes.extend_from_slice(&RECOVERY_KEY_PREFIX);
    bytes.extend_from_slice(key);

    let parity = bytes.iter().fold(0u8, |acc, b| acc ^ b);
    bytes.push(parity);

    let encoded = bs58::encode(&bytes).with_alphabet(bs58::Alphabet::BITCOIN).into_string();

    bytes.zeroize();

    encoded
}

/// Decode a base58 recovery key back into the 32-byte key it wraps.
///
/// Rejects keys with the wrong prefix, length, or parity byte.
pub fn decode_recovery_key(recovery_key: &str) -> Result<Box<[u8; 32]>, DecodeError> {
    // The spaces some clients insert for readability aren't part of the
    // alphabet.
    let stripped: String = recovery_key.chars().filter(|c| !c.is_whitespace()).collect();

    let mut decoded =
        bs58::decode(stripped.as_bytes()).with_alphabet(bs58::Alphabet::BITCOIN).into_vec()?;

    if decoded.len() != RECOVERY_KEY_LEN {
        let len = decoded.len();
        decoded.zeroize();
        return Err(DecodeError::Length(RECOVERY_KEY_LEN, len));
    }

    let prefix = [decoded[0], decoded[1]];

    if prefix != RECOVERY_KEY_PREFIX {
        decoded.zeroize();
        return Err(DecodeError::Prefix(RECOVERY_KEY_PREFIX, prefix));
    }

    let expected_parity = decoded[..RECOVERY_KEY_LEN - 1].iter().fold(0u8, |acc, b| acc ^ b);
    let parity = decoded[RECOVERY_KEY_LEN - 1];

    if expected_parity != parity {
        decoded.zeroize();
        return Err(DecodeError::Parity(expected_parity, parity));
    }

    let mut key = Box::new([0u8; 32]);
    key.copy_from_slice(&decoded[2..RECOVERY_KEY_LEN - 1]);

    decoded.zeroize();

    Ok(key)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::{canonical_json, decode, decode_recovery_key, encode, encode_recovery_key};
    use crate::utilities::DecodeError;

    #[test]
    fn base64_round_trip() {
        let data = b"It's a secret to everybody";
        assert_eq!(decode(encode(data)).unwrap(), data);
    }

    #[test]
    fn canonicalization_sorts_and_strips() {
        let value = json!({
            "b": 1,
            "a": {"d": 2, "c": 3},
            "signatures": {"@alice:example.org": {}},
            "unsigned": {"age": 5},
        });

        assert_eq!(canonical_json(value).unwrap(), r#"{"a":{"c":3,"d":2},"b":1}"#);
    }

    #[test]
    fn recovery_key_round_trip() {
        let key = [0u8; 32];
        let encoded = encode_recovery_key(&key);
        assert_eq!(*decode_recovery_key(&encoded).unwrap(), key);

        let key: [u8; 32] = core::array::from_fn(|i| i as u8);
        let encoded = encode_recovery_key(&key);
        assert_eq!(*decode_recovery_key(&encoded).unwrap(), key);
    }

    #[test]
    fn recovery_key_rejects_flipped_bits() {
        let key: [u8; 32] = core::array::from_fn(|i| i as u8);

        let mut bytes = vec![0x8B, 0x01];
        bytes.extend_from_slice(&key);
        bytes.push(bytes.iter().fold(0u8, |acc, b| acc ^ b));

        // Corrupt the parity byte.
        let mut corrupted = bytes.clone();
        *corrupted.last_mut().unwrap() ^= 0x01;
        let encoded = bs58::encode(&corrupted).into_string();
        assert_matches!(decode_recovery_key(&encoded), Err(DecodeError::Parity(..)));

        // Corrupt the prefix.
        let mut corrupted = bytes.clone();
        corrupted[0] = 0x8A;
        corrupted[34] ^= 0x8B ^ 0x8A;
        let encoded = bs58::encode(&corrupted).into_string();
        assert_matches!(decode_recovery_key(&encoded), Err(DecodeError::Prefix(..)));

        // Wrong length.
        bytes.push(0x00);
        let encoded = bs58::encode(&bytes).into_string();
        assert_matches!(decode_recovery_key(&encoded), Err(DecodeError::Length(..)));
    }

    #[test]
    fn recovery_key_ignores_whitespace() {
        let key = [0xAA; 32];
        let mut encoded = encode_recovery_key(&key);
        encoded.insert(4, ' ');
        encoded.insert(9, ' ');
        assert_eq!(*decode_recovery_key(&encoded).unwrap(), key);
    }
}
