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

use crate::{store::CryptoStoreError, utilities::DecodeError};

/// Result type for pairwise, device to device operations.
pub type OlmResult<T> = Result<T, OlmError>;
/// Result type for group encryption operations.
pub type MegolmResult<T> = Result<T, MegolmError>;

/// Error representing a failure during a device to device cryptographic
/// operation.
#[derive(Debug, Error)]
pub enum OlmError {
    /// The Olm message couldn't be decrypted.
    #[error(transparent)]
    Decryption(#[from] vodozemac::olm::DecryptionError),

    /// A new Olm session couldn't be created from a pre-key message.
    #[error(transparent)]
    SessionCreation(#[from] vodozemac::olm::SessionCreationError),

    /// The ciphertext or a contained key couldn't be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The decrypted plaintext couldn't be deserialized.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// The storage layer returned an error.
    #[error("failed to read or write to the crypto store: {0}")]
    Store(#[from] CryptoStoreError),

    /// The encrypted message doesn't contain a ciphertext for our device.
    #[error("the encrypted message doesn't contain a ciphertext for our device")]
    MissingCiphertext,

    /// Encryption failed because no Olm session with the device exists.
    #[error("encryption failed because no Olm session with the device exists")]
    MissingSession,

    /// The message used an Olm message type other than 0 or 1.
    #[error("the Olm message has the unsupported type {0}")]
    UnsupportedMessageType(usize),

    /// The sender in the decrypted payload doesn't match the sender of the
    /// encrypted message.
    #[error("the sender of the plaintext doesn't match the sender of the encrypted message")]
    MismatchedSender,

    /// The decrypted payload names another device as recipient.
    #[error("the keys in the decrypted payload don't match our own keys")]
    MismatchedKeys,
}

/// Error representing a failure during a group encryption operation.
#[derive(Debug, Error)]
pub enum MegolmError {
    /// The session can't reach the requested message index, it was imported
    /// at a later point in the ratchet.
    #[error("the message was encrypted using a message index the session can't decrypt")]
    UnknownMessageIndex,

    /// The group message couldn't be decrypted.
    #[error("decryption failed: {0}")]
    Decryption(vodozemac::megolm::DecryptionError),

    /// A session key couldn't be decoded.
    #[error(transparent)]
    SessionKey(#[from] vodozemac::megolm::SessionKeyDecodeError),

    /// The ciphertext couldn't be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The decrypted plaintext couldn't be deserialized.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Decryption failed because the needed session is missing.
    #[error("decryption failed because the session to decrypt the message is missing")]
    MissingSession,

    /// The message was encrypted with an algorithm we don't support.
    #[error("the message was encrypted using the unsupported algorithm {0}")]
    UnsupportedAlgorithm(String),

    /// The room id inside the decrypted event doesn't match the room the
    /// ciphertext came from.
    #[error("the room id of the room key doesn't match the room id of the decrypted event")]
    MismatchedRoom,

    /// The storage layer returned an error.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),
}

impl From<vodozemac::megolm::DecryptionError> for MegolmError {
    fn from(error: vodozemac::megolm::DecryptionError) -> Self {
        use vodozemac::megolm::DecryptionError;

        match error {
            DecryptionError::UnknownMessageIndex(..) => Self::UnknownMessageIndex,
            error => Self::Decryption(error),
        }
    }
}

/// Error type describing failures while creating or checking signatures on
/// canonical JSON objects.
#[derive(Debug, Error)]
pub enum SignatureError {
    /// The signature was made with an unsupported algorithm.
    #[error("the signature used an unsupported algorithm")]
    UnsupportedAlgorithm,

    /// The signing key that should check the signature is missing.
    #[error("the signing key is missing from the object that signed the message")]
    MissingSigningKey,

    /// The signed JSON value isn't a JSON object.
    #[error("the provided JSON value isn't an object")]
    NotAnObject,

    /// The object doesn't contain a signature for the expected key.
    #[error("the provided JSON object doesn't contain a signatures field")]
    NoSignatureFound,

    /// The signature didn't match.
    #[error("the signature didn't match the provided key")]
    VerificationError,

    /// The signing key couldn't be decoded.
    #[error(transparent)]
    InvalidKey(#[from] vodozemac::KeyError),

    /// The object couldn't be converted into canonical JSON.
    #[error(transparent)]
    CanonicalJson(#[from] ruma::CanonicalJsonError),

    /// The signed object couldn't be (de)serialized.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<vodozemac::SignatureError> for SignatureError {
    fn from(_: vodozemac::SignatureError) -> Self {
        Self::VerificationError
    }
}

/// Error type for the secret storage subsystem.
#[derive(Debug, Error)]
pub enum SecretStorageError {
    /// The MAC of the encrypted secret didn't match, the storage key is
    /// wrong or the data was tampered with.
    #[error("the MAC of the encrypted secret didn't match")]
    Mac,

    /// A base64 field or key couldn't be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// An encrypted field has the wrong length.
    #[error("an encrypted field has an invalid length: expected {0}, got {1}")]
    Length(usize, usize),

    /// The key description uses an algorithm we don't support.
    #[error("the key description uses the unsupported algorithm {0}")]
    UnsupportedAlgorithm(String),

    /// The secret payload couldn't be (de)serialized.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<crate::utilities::Base64DecodeError> for SecretStorageError {
    fn from(error: crate::utilities::Base64DecodeError) -> Self {
        Self::Decode(error.into())
    }
}

/// Error type for the import of an armored Megolm session export.
#[derive(Debug, Error)]
pub enum KeyExportError {
    /// The header or footer line of the export is missing.
    #[error("the export is missing its header or footer line")]
    InvalidHeader,

    /// The binary payload is too short to contain all the mandatory fields.
    #[error("the export payload is too short")]
    TooShort,

    /// The version byte of the payload isn't one we understand.
    #[error("the export uses the unsupported format version {0}")]
    UnsupportedVersion(u8),

    /// The MAC of the payload didn't match, the passphrase is likely wrong.
    #[error("the MAC of the export didn't match")]
    Mac,

    /// The payload wasn't valid base64.
    #[error(transparent)]
    Decode(#[from] crate::utilities::Base64DecodeError),

    /// The decrypted session list couldn't be deserialized.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Error type for the import of a session export into the store.
#[derive(Debug, Error)]
pub enum KeyImportError {
    /// The export file couldn't be decrypted.
    #[error(transparent)]
    Export(#[from] KeyExportError),

    /// The storage layer returned an error.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),
}
