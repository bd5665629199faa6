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

//! The to-device payloads the E2EE core routes on.
//!
//! The payload enum is closed over the types the core handles; everything
//! else round-trips through the [`UnknownPayload`] variant as raw JSON.

use std::collections::BTreeMap;

use ruma::{OwnedDeviceId, OwnedRoomId};
use serde::{de::Error as _, Deserialize, Serialize};
use serde_json::Value;
use vodozemac::{megolm::ExportedSessionKey, olm::OlmMessage, Curve25519PublicKey};

use crate::{error::OlmError, utilities, verification::CancelCode};

/// The content of an `m.room.encrypted` to-device event, pairwise encrypted
/// with Olm.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OlmV1Content {
    /// The algorithm, always `m.olm.v1.curve25519-aes-sha2`.
    pub algorithm: String,
    /// The Curve25519 identity key of the sending device.
    pub sender_key: Curve25519PublicKey,
    /// Per-recipient ciphertexts, keyed by the recipient's Curve25519 key.
    pub ciphertext: BTreeMap<String, OlmCiphertext>,
}

/// A single Olm ciphertext in its wire form.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OlmCiphertext {
    /// The message type; 0 for pre-key messages, 1 for normal messages.
    #[serde(rename = "type")]
    pub message_type: u8,
    /// The base64 encoded ciphertext.
    pub body: String,
}

impl OlmCiphertext {
    /// Convert an [`OlmMessage`] into its wire form.
    pub fn from_message(message: &OlmMessage) -> Self {
        match message {
            OlmMessage::PreKey(m) => {
                Self { message_type: 0, body: utilities::encode(m.to_bytes()) }
            }
            OlmMessage::Normal(m) => {
                Self { message_type: 1, body: utilities::encode(m.to_bytes()) }
            }
        }
    }

    /// Parse the wire form back into an [`OlmMessage`].
    pub fn to_message(&self) -> Result<OlmMessage, OlmError> {
        let bytes =
            utilities::decode(&self.body).map_err(crate::utilities::DecodeError::from)?;

        match self.message_type {
            0 => Ok(OlmMessage::PreKey(
                vodozemac::olm::PreKeyMessage::try_from(bytes.as_slice())
                    .map_err(crate::utilities::DecodeError::from)?,
            )),
            1 => Ok(OlmMessage::Normal(
                vodozemac::olm::Message::try_from(bytes.as_slice())
                    .map_err(crate::utilities::DecodeError::from)?,
            )),
            t => Err(OlmError::UnsupportedMessageType(t as usize)),
        }
    }
}

/// The content of an `m.room.encrypted` room event, group encrypted with
/// Megolm.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MegolmV1Content {
    /// The algorithm, always `m.megolm.v1.aes-sha2`.
    pub algorithm: String,
    /// The Curve25519 identity key of the sending device.
    pub sender_key: Curve25519PublicKey,
    /// The base64 encoded Megolm ciphertext.
    pub ciphertext: String,
    /// The id of the session that encrypted the message.
    pub session_id: String,
    /// The id of the sending device.
    pub device_id: OwnedDeviceId,
}

/// The content of an `m.room_key` event, sharing a fresh group session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoomKeyContent {
    /// The algorithm of the shared session.
    pub algorithm: String,
    /// The room the session is used in.
    pub room_id: OwnedRoomId,
    /// The unique id of the session.
    pub session_id: String,
    /// The base64 encoded session key.
    pub session_key: String,
}

/// The content of an `m.forwarded_room_key` event.
#[derive(Serialize, Deserialize)]
pub struct ForwardedRoomKeyContent {
    /// The algorithm of the forwarded session.
    pub algorithm: String,
    /// The room the session is used in.
    pub room_id: OwnedRoomId,
    /// The claimed Curve25519 key of the device that created the session.
    pub sender_key: Curve25519PublicKey,
    /// The unique id of the session.
    pub session_id: String,
    /// The exported session key.
    pub session_key: ExportedSessionKey,
    /// The claimed Ed25519 key of the device that created the session.
    pub sender_claimed_ed25519_key: String,
    /// The devices the session passed through before reaching us.
    #[serde(default)]
    pub forwarding_curve25519_key_chain: Vec<String>,
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for ForwardedRoomKeyContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardedRoomKeyContent")
            .field("room_id", &self.room_id)
            .field("session_id", &self.session_id)
            .finish()
    }
}

/// The content of an `m.room_key_request` event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoomKeyRequestContent {
    /// `request` or `request_cancellation`.
    pub action: String,
    /// The device requesting the key.
    pub requesting_device_id: OwnedDeviceId,
    /// The unique id of this request.
    pub request_id: String,
    /// Which key is being requested; absent for cancellations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<RequestedKeyInfo>,
}

/// The session an `m.room_key_request` asks for.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestedKeyInfo {
    /// The algorithm of the requested session.
    pub algorithm: String,
    /// The room the session is used in.
    pub room_id: OwnedRoomId,
    /// The Curve25519 key of the device that created the session.
    pub sender_key: Curve25519PublicKey,
    /// The unique id of the session.
    pub session_id: String,
}

/// The content of an `m.secret.request` event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SecretRequestContent {
    /// The name of the requested secret, e.g. `m.cross_signing.master`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// `request` or `request_cancellation`.
    pub action: String,
    /// The device requesting the secret.
    pub requesting_device_id: OwnedDeviceId,
    /// The unique id of this request.
    pub request_id: String,
}

/// The content of an `m.secret.send` event, answering a secret request.
#[derive(Clone, Serialize, Deserialize)]
pub struct SecretSendContent {
    /// The id of the request this answers.
    pub request_id: String,
    /// The secret itself.
    pub secret: String,
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for SecretSendContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretSendContent").field("request_id", &self.request_id).finish()
    }
}

/// The content of an `m.key.verification.start` event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StartContent {
    /// The device starting the verification.
    pub from_device: OwnedDeviceId,
    /// The id tying the verification messages together.
    pub transaction_id: String,
    /// The verification method, `m.sas.v1`.
    pub method: String,
    /// The key agreement protocols the sender supports.
    pub key_agreement_protocols: Vec<String>,
    /// The hash algorithms the sender supports.
    pub hashes: Vec<String>,
    /// The MAC algorithms the sender supports.
    pub message_authentication_codes: Vec<String>,
    /// The short auth string formats the sender supports.
    pub short_authentication_string: Vec<String>,
}

/// The content of an `m.key.verification.accept` event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AcceptContent {
    /// The id tying the verification messages together.
    pub transaction_id: String,
    /// The accepted verification method.
    pub method: String,
    /// The chosen key agreement protocol.
    pub key_agreement_protocol: String,
    /// The chosen hash algorithm.
    pub hash: String,
    /// The chosen MAC algorithm.
    pub message_authentication_code: String,
    /// The short auth string formats both sides support.
    pub short_authentication_string: Vec<String>,
    /// The hash commitment over the sender's ephemeral key and the start
    /// event.
    pub commitment: String,
}

/// The content of an `m.key.verification.key` event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyContent {
    /// The id tying the verification messages together.
    pub transaction_id: String,
    /// The sender's ephemeral Curve25519 public key.
    pub key: String,
}

/// The content of an `m.key.verification.mac` event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MacContent {
    /// The id tying the verification messages together.
    pub transaction_id: String,
    /// MACs of the sender's key ids, keyed by `<algorithm>:<key id>`.
    pub mac: BTreeMap<String, String>,
    /// The MAC of the sorted, comma-joined list of the key ids above.
    pub keys: String,
}

/// The content of an `m.key.verification.cancel` event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CancelContent {
    /// The id tying the verification messages together.
    pub transaction_id: String,
    /// The machine-readable cancellation reason.
    pub code: CancelCode,
    /// A human-readable description of the reason.
    pub reason: String,
}

/// A to-device payload the core doesn't handle, kept as raw JSON.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UnknownPayload {
    /// The event type of the payload.
    pub event_type: String,
    /// The raw content.
    pub content: Value,
}

/// The to-device payloads relevant to the E2EE core.
#[derive(Debug)]
pub enum ToDevicePayload {
    /// A fresh group session key, `m.room_key`.
    RoomKey(RoomKeyContent),
    /// A forwarded group session key, `m.forwarded_room_key`.
    ForwardedRoomKey(ForwardedRoomKeyContent),
    /// A request for a group session key, `m.room_key_request`.
    RoomKeyRequest(RoomKeyRequestContent),
    /// A request for a stored secret, `m.secret.request`.
    SecretRequest(SecretRequestContent),
    /// An answer carrying a stored secret, `m.secret.send`.
    SecretSend(SecretSendContent),
    /// The first message of an interactive verification.
    VerificationStart(StartContent),
    /// The acceptance of an interactive verification.
    VerificationAccept(AcceptContent),
    /// The ephemeral key exchange of an interactive verification.
    VerificationKey(KeyContent),
    /// The MAC exchange concluding an interactive verification.
    VerificationMac(MacContent),
    /// The cancellation of an interactive verification.
    VerificationCancel(CancelContent),
    /// Anything else, kept verbatim.
    Unknown(UnknownPayload),
}

impl ToDevicePayload {
    /// The event type of the payload.
    pub fn event_type(&self) -> &str {
        match self {
            Self::RoomKey(_) => "m.room_key",
            Self::ForwardedRoomKey(_) => "m.forwarded_room_key",
            Self::RoomKeyRequest(_) => "m.room_key_request",
            Self::SecretRequest(_) => "m.secret.request",
            Self::SecretSend(_) => "m.secret.send",
            Self::VerificationStart(_) => "m.key.verification.start",
            Self::VerificationAccept(_) => "m.key.verification.accept",
            Self::VerificationKey(_) => "m.key.verification.key",
            Self::VerificationMac(_) => "m.key.verification.mac",
            Self::VerificationCancel(_) => "m.key.verification.cancel",
            Self::Unknown(p) => &p.event_type,
        }
    }
}

#[derive(Serialize)]
struct PayloadSerHelper<'a, T> {
    #[serde(rename = "type")]
    event_type: &'a str,
    content: &'a T,
}

#[derive(Deserialize)]
struct PayloadDeHelper {
    #[serde(rename = "type")]
    event_type: String,
    content: Value,
}

impl Serialize for ToDevicePayload {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        fn helper<S: serde::Serializer, T: Serialize>(
            serializer: S,
            event_type: &str,
            content: &T,
        ) -> Result<S::Ok, S::Error> {
            PayloadSerHelper { event_type, content }.serialize(serializer)
        }

        match self {
            Self::RoomKey(c) => helper(serializer, self.event_type(), c),
            Self::ForwardedRoomKey(c) => helper(serializer, self.event_type(), c),
            Self::RoomKeyRequest(c) => helper(serializer, self.event_type(), c),
            Self::SecretRequest(c) => helper(serializer, self.event_type(), c),
            Self::SecretSend(c) => helper(serializer, self.event_type(), c),
            Self::VerificationStart(c) => helper(serializer, self.event_type(), c),
            Self::VerificationAccept(c) => helper(serializer, self.event_type(), c),
            Self::VerificationKey(c) => helper(serializer, self.event_type(), c),
            Self::VerificationMac(c) => helper(serializer, self.event_type(), c),
            Self::VerificationCancel(c) => helper(serializer, self.event_type(), c),
            Self::Unknown(c) => helper(serializer, &c.event_type, &c.content),
        }
    }
}

impl<'de> Deserialize<'de> for ToDevicePayload {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let helper = PayloadDeHelper::deserialize(deserializer)?;

        let payload = match helper.event_type.as_str() {
            "m.room_key" => {
                Self::RoomKey(serde_json::from_value(helper.content).map_err(D::Error::custom)?)
            }
            "m.forwarded_room_key" => Self::ForwardedRoomKey(
                serde_json::from_value(helper.content).map_err(D::Error::custom)?,
            ),
            "m.room_key_request" => Self::RoomKeyRequest(
                serde_json::from_value(helper.content).map_err(D::Error::custom)?,
            ),
            "m.secret.request" => Self::SecretRequest(
                serde_json::from_value(helper.content).map_err(D::Error::custom)?,
            ),
            "m.secret.send" => {
                Self::SecretSend(serde_json::from_value(helper.content).map_err(D::Error::custom)?)
            }
            "m.key.verification.start" => Self::VerificationStart(
                serde_json::from_value(helper.content).map_err(D::Error::custom)?,
            ),
            "m.key.verification.accept" => Self::VerificationAccept(
                serde_json::from_value(helper.content).map_err(D::Error::custom)?,
            ),
            "m.key.verification.key" => Self::VerificationKey(
                serde_json::from_value(helper.content).map_err(D::Error::custom)?,
            ),
            "m.key.verification.mac" => Self::VerificationMac(
                serde_json::from_value(helper.content).map_err(D::Error::custom)?,
            ),
            "m.key.verification.cancel" => Self::VerificationCancel(
                serde_json::from_value(helper.content).map_err(D::Error::custom)?,
            ),
            _ => Self::Unknown(UnknownPayload {
                event_type: helper.event_type,
                content: helper.content,
            }),
        };

        Ok(payload)
    }
}
