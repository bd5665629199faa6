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

//! Interactive device verification using short authentication strings.

mod sas;

use ruma::{DeviceId, OwnedDeviceId, OwnedUserId, UserId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use vodozemac::Curve25519PublicKey;

pub use sas::{bytes_to_decimal, bytes_to_emoji_index, Sas, SasError};

use crate::{
    error::SignatureError,
    types::events::{AcceptContent, CancelContent, KeyContent, MacContent, StartContent},
    utilities,
};

/// The method identifier for SAS verification.
pub const SAS_V1_METHOD: &str = "m.sas.v1";

const KEY_AGREEMENT_PROTOCOLS: &[&str] = &["curve25519-hkdf-sha256", "curve25519"];
const HASHES: &[&str] = &["sha256"];
const MACS: &[&str] = &["hkdf-hmac-sha256"];
const SAS_FORMATS: &[&str] = &["decimal", "emoji"];

fn string_vec(strings: &[&str]) -> Vec<String> {
    strings.iter().map(|s| (*s).to_owned()).collect()
}

/// The machine readable reasons a verification flow can be cancelled with.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelCode {
    /// The user cancelled the verification.
    #[serde(rename = "m.user")]
    User,
    /// The verification timed out.
    #[serde(rename = "m.timeout")]
    Timeout,
    /// The short authentication strings didn't match.
    #[serde(rename = "m.mismatched_sas")]
    MismatchedSas,
    /// The hash commitment didn't match the revealed key.
    #[serde(rename = "m.mismatched_commitment")]
    MismatchedCommitment,
    /// A MACed key didn't match the key we have on record.
    #[serde(rename = "m.key_mismatch")]
    KeyMismatch,
    /// The verification messages referred to an unexpected user.
    #[serde(rename = "m.user_mismatch")]
    UserMismatch,
    /// A message was malformed.
    #[serde(rename = "m.invalid_message")]
    InvalidMessage,
    /// The verification was accepted on another device.
    #[serde(rename = "m.accepted")]
    Accepted,
    /// The requested verification method isn't supported.
    #[serde(rename = "m.unknown_method")]
    UnknownMethod,
    /// A non-standard cancellation code.
    #[serde(untagged)]
    Custom(String),
}

impl CancelCode {
    /// The wire form of the code.
    pub fn as_str(&self) -> &str {
        match self {
            CancelCode::User => "m.user",
            CancelCode::Timeout => "m.timeout",
            CancelCode::MismatchedSas => "m.mismatched_sas",
            CancelCode::MismatchedCommitment => "m.mismatched_commitment",
            CancelCode::KeyMismatch => "m.key_mismatch",
            CancelCode::UserMismatch => "m.user_mismatch",
            CancelCode::InvalidMessage => "m.invalid_message",
            CancelCode::Accepted => "m.accepted",
            CancelCode::UnknownMethod => "m.unknown_method",
            CancelCode::Custom(c) => c,
        }
    }

    /// A human readable description of the code.
    pub fn reason(&self) -> &str {
        match self {
            CancelCode::User => "The user cancelled the verification",
            CancelCode::Timeout => "The verification process timed out",
            CancelCode::MismatchedSas => "The short authentication strings did not match",
            CancelCode::MismatchedCommitment => "The hash commitment did not match",
            CancelCode::KeyMismatch => "The key did not match the verified one",
            CancelCode::UserMismatch => "The expected user did not match the user verified",
            CancelCode::InvalidMessage => "The received message was invalid",
            CancelCode::Accepted => "A m.key.verification.request was accepted by a different device",
            CancelCode::UnknownMethod => "The verification method is not supported",
            CancelCode::Custom(_) => "A custom error occurred during the verification",
        }
    }
}

/// Get the emoji and description corresponding to a 6-bit index.
///
/// The mapping is the fixed 64 entry table from the Matrix specification.
///
/// # Panics
///
/// Panics if the index is larger than 63.
pub fn emoji_from_index(index: u8) -> (&'static str, &'static str) {
    match index {
        0 => ("🐶", "Dog"),
        1 => ("🐱", "Cat"),
        2 => ("🦁", "Lion"),
        3 => ("🐎", "Horse"),
        4 => ("🦄", "Unicorn"),
        5 => ("🐷", "Pig"),
        6 => ("🐘", "Elephant"),
        7 => ("🐰", "Rabbit"),
        8 => ("🐼", "Panda"),
        9 => ("🐓", "Rooster"),
        10 => ("🐧", "Penguin"),
        11 => ("🐢", "Turtle"),
        12 => ("🐟", "Fish"),
        13 => ("🐙", "Octopus"),
        14 => ("🦋", "Butterfly"),
        15 => ("🌷", "Flower"),
        16 => ("🌳", "Tree"),
        17 => ("🌵", "Cactus"),
        18 => ("🍄", "Mushroom"),
        19 => ("🌏", "Globe"),
        20 => ("🌙", "Moon"),
        21 => ("☁️", "Cloud"),
        22 => ("🔥", "Fire"),
        23 => ("🍌", "Banana"),
        24 => ("🍎", "Apple"),
        25 => ("🍓", "Strawberry"),
        26 => ("🌽", "Corn"),
        27 => ("🍕", "Pizza"),
        28 => ("🎂", "Cake"),
        29 => ("❤️", "Heart"),
        30 => ("😀", "Smiley"),
        31 => ("🤖", "Robot"),
        32 => ("🎩", "Hat"),
        33 => ("👓", "Glasses"),
        34 => ("🔧", "Spanner"),
        35 => ("🎅", "Santa"),
        36 => ("👍", "Thumbs up"),
        37 => ("☂️", "Umbrella"),
        38 => ("⌛", "Hourglass"),
        39 => ("⏰", "Clock"),
        40 => ("🎁", "Gift"),
        41 => ("💡", "Light Bulb"),
        42 => ("📕", "Book"),
        43 => ("✏️", "Pencil"),
        44 => ("📎", "Paperclip"),
        45 => ("✂️", "Scissors"),
        46 => ("🔒", "Lock"),
        47 => ("🔑", "Key"),
        48 => ("🔨", "Hammer"),
        49 => ("☎️", "Telephone"),
        50 => ("🏁", "Flag"),
        51 => ("🚂", "Train"),
        52 => ("🚲", "Bicycle"),
        53 => ("✈️", "Airplane"),
        54 => ("🚀", "Rocket"),
        55 => ("🏆", "Trophy"),
        56 => ("⚽", "Ball"),
        57 => ("🎸", "Guitar"),
        58 => ("🎺", "Trumpet"),
        59 => ("🔔", "Bell"),
        60 => ("⚓", "Anchor"),
        61 => ("🎧", "Headphones"),
        62 => ("📁", "Folder"),
        63 => ("📌", "Pin"),
        _ => panic!("Trying to fetch an emoji outside the allowed range"),
    }
}

/// Calculate the commitment an accept event carries.
///
/// The commitment is the unpadded base64 of the SHA-256 of the accepting
/// side's ephemeral public key concatenated with the canonical JSON of the
/// start event content.
pub fn calculate_commitment(
    public_key: &str,
    start: &StartContent,
) -> Result<String, SignatureError> {
    let content = utilities::canonical_json(serde_json::to_value(start)?)?;

    Ok(utilities::encode(
        Sha256::new().chain_update(public_key).chain_update(&content).finalize(),
    ))
}

/// The user and device ids of the two sides of a verification flow.
#[derive(Clone, Debug)]
pub struct SasIds {
    /// Our own user id.
    pub own_user_id: OwnedUserId,
    /// Our own device id.
    pub own_device_id: OwnedDeviceId,
    /// The user we are verifying.
    pub other_user_id: OwnedUserId,
    /// The device we are verifying.
    pub other_device_id: OwnedDeviceId,
}

/// Build the info string that the SAS bytes get generated with.
///
/// The starting side's identifiers come first.
fn extra_info_sas(
    ids: &SasIds,
    own_pubkey: &str,
    their_pubkey: &str,
    flow_id: &str,
    we_started: bool,
) -> String {
    let our_info = format!("{}|{}|{}", ids.own_user_id, ids.own_device_id, own_pubkey);
    let their_info = format!("{}|{}|{}", ids.other_user_id, ids.other_device_id, their_pubkey);

    let (first_info, second_info) =
        if we_started { (&our_info, &their_info) } else { (&their_info, &our_info) };

    format!("MATRIX_KEY_VERIFICATION_SAS|{first_info}|{second_info}|{flow_id}")
}

/// Build the info string our outgoing MACs are keyed with.
fn extra_mac_info_send(ids: &SasIds, flow_id: &str) -> String {
    format!(
        "MATRIX_KEY_VERIFICATION_MAC{first_user}{first_device}\
        {second_user}{second_device}{transaction_id}",
        first_user = ids.own_user_id,
        first_device = ids.own_device_id,
        second_user = ids.other_user_id,
        second_device = ids.other_device_id,
        transaction_id = flow_id,
    )
}

/// Build the info string the other side's MACs are keyed with.
fn extra_mac_info_receive(ids: &SasIds, flow_id: &str) -> String {
    format!(
        "MATRIX_KEY_VERIFICATION_MAC{first_user}{first_device}\
        {second_user}{second_device}{transaction_id}",
        first_user = ids.other_user_id,
        first_device = ids.other_device_id,
        second_user = ids.own_user_id,
        second_device = ids.own_device_id,
        transaction_id = flow_id,
    )
}

/// A single SAS verification flow between two devices.
///
/// The flow follows the to-device message exchange: start, accept with a
/// commitment, key exchange, user confirmation of the short auth string, and
/// a final MAC exchange over the device keys.
pub struct SasVerification {
    sas: Sas,
    ids: SasIds,
    flow_id: String,
    we_started: bool,
    start_content: StartContent,
    commitment: Option<String>,
    their_public_key: Option<Curve25519PublicKey>,
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for SasVerification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SasVerification")
            .field("flow_id", &self.flow_id)
            .field("we_started", &self.we_started)
            .finish()
    }
}

impl SasVerification {
    /// Start a new verification flow with the given device.
    ///
    /// Returns the flow and the `m.key.verification.start` content to send.
    pub fn start(
        own_user_id: &UserId,
        own_device_id: &DeviceId,
        other_user_id: &UserId,
        other_device_id: &DeviceId,
        flow_id: &str,
    ) -> (Self, StartContent) {
        let sas = Sas::new();

        let start_content = StartContent {
            from_device: own_device_id.to_owned(),
            transaction_id: flow_id.to_owned(),
            method: SAS_V1_METHOD.to_owned(),
            key_agreement_protocols: string_vec(KEY_AGREEMENT_PROTOCOLS),
            hashes: string_vec(HASHES),
            message_authentication_codes: string_vec(MACS),
            short_authentication_string: string_vec(SAS_FORMATS),
        };

        let flow = Self {
            sas,
            ids: SasIds {
                own_user_id: own_user_id.to_owned(),
                own_device_id: own_device_id.to_owned(),
                other_user_id: other_user_id.to_owned(),
                other_device_id: other_device_id.to_owned(),
            },
            flow_id: flow_id.to_owned(),
            we_started: true,
            start_content: start_content.clone(),
            commitment: None,
            their_public_key: None,
        };

        (flow, start_content)
    }

    /// Create a verification flow from a received
    /// `m.key.verification.start` event.
    ///
    /// Fails with an [`CancelCode::UnknownMethod`] cancellation content if
    /// the start event proposes a method or algorithms we don't support.
    pub fn from_start(
        own_user_id: &UserId,
        own_device_id: &DeviceId,
        other_user_id: &UserId,
        content: StartContent,
    ) -> Result<Self, CancelContent> {
        let supported = content.method == SAS_V1_METHOD
            && content.key_agreement_protocols.iter().any(|p| p == "curve25519-hkdf-sha256")
            && content.hashes.iter().any(|h| h == "sha256")
            && content.message_authentication_codes.iter().any(|m| m == "hkdf-hmac-sha256");

        if !supported {
            let code = CancelCode::UnknownMethod;
            return Err(CancelContent {
                transaction_id: content.transaction_id,
                reason: code.reason().to_owned(),
                code,
            });
        }

        Ok(Self {
            sas: Sas::new(),
            ids: SasIds {
                own_user_id: own_user_id.to_owned(),
                own_device_id: own_device_id.to_owned(),
                other_user_id: other_user_id.to_owned(),
                other_device_id: content.from_device.clone(),
            },
            flow_id: content.transaction_id.clone(),
            we_started: false,
            start_content: content,
            commitment: None,
            their_public_key: None,
        })
    }

    /// The id tying the flow's messages together.
    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    /// Accept a verification the other side started.
    ///
    /// The accept content commits to our ephemeral key without revealing it.
    pub fn accept(&self) -> Result<AcceptContent, SignatureError> {
        let commitment =
            calculate_commitment(&self.sas.public_key().to_base64(), &self.start_content)?;

        Ok(AcceptContent {
            transaction_id: self.flow_id.clone(),
            method: SAS_V1_METHOD.to_owned(),
            key_agreement_protocol: "curve25519-hkdf-sha256".to_owned(),
            hash: "sha256".to_owned(),
            message_authentication_code: "hkdf-hmac-sha256".to_owned(),
            short_authentication_string: string_vec(SAS_FORMATS),
            commitment,
        })
    }

    /// Record the commitment from the other side's accept event.
    pub fn receive_accept(&mut self, content: &AcceptContent) {
        self.commitment = Some(content.commitment.clone());
    }

    /// The `m.key.verification.key` content revealing our ephemeral key.
    pub fn key_content(&self) -> KeyContent {
        KeyContent {
            transaction_id: self.flow_id.clone(),
            key: self.sas.public_key().to_base64(),
        }
    }

    /// Receive the other side's ephemeral key and derive the shared secret.
    ///
    /// If we started the flow, the key is checked against the commitment
    /// from the accept event first.
    pub fn receive_key(&mut self, content: &KeyContent) -> Result<(), CancelContent> {
        if self.we_started {
            let commitment = self.commitment.as_deref().ok_or_else(|| self.cancel_content(CancelCode::InvalidMessage))?;

            let expected = calculate_commitment(&content.key, &self.start_content)
                .map_err(|_| self.cancel_content(CancelCode::InvalidMessage))?;

            if commitment != expected {
                return Err(self.cancel_content(CancelCode::MismatchedCommitment));
            }
        }

        let key = Curve25519PublicKey::from_base64(&content.key)
            .map_err(|_| self.cancel_content(CancelCode::InvalidMessage))?;

        self.their_public_key = Some(key);
        self.sas
            .set_their_key(key)
            .map_err(|_| self.cancel_content(CancelCode::InvalidMessage))
    }

    fn sas_info(&self) -> Result<String, SasError> {
        let their_key =
            self.their_public_key.as_ref().ok_or(SasError::TheirKeyNotSet)?.to_base64();

        Ok(extra_info_sas(
            &self.ids,
            &self.sas.public_key().to_base64(),
            &their_key,
            &self.flow_id,
            self.we_started,
        ))
    }

    /// The decimal representation of the short auth string.
    pub fn decimals(&self) -> Result<(u16, u16, u16), SasError> {
        self.sas.bytes_decimal(&self.sas_info()?)
    }

    /// The emoji representation of the short auth string.
    pub fn emoji(&self) -> Result<[(&'static str, &'static str); 7], SasError> {
        self.sas.bytes_emoji(&self.sas_info()?)
    }

    /// Produce the MAC content over our own keys, to be sent after the user
    /// confirmed that the short auth strings match.
    pub fn confirm(
        &self,
        own_keys: impl IntoIterator<Item = (String, String)>,
    ) -> Result<MacContent, SasError> {
        let info = extra_mac_info_send(&self.ids, &self.flow_id);

        let mut mac = std::collections::BTreeMap::new();

        for (key_id, key) in own_keys {
            let calculated = self.sas.calculate_mac(&key, &format!("{info}{key_id}"))?;
            mac.insert(key_id, calculated);
        }

        let mut key_ids: Vec<&str> = mac.keys().map(|k| k.as_str()).collect();
        key_ids.sort_unstable();
        let keys = self.sas.calculate_mac(&key_ids.join(","), &format!("{info}KEY_IDS"))?;

        Ok(MacContent { transaction_id: self.flow_id.clone(), mac, keys })
    }

    /// Verify the MAC content the other side sent over its keys.
    ///
    /// `their_keys` maps the key ids we know for the other device to the
    /// public keys we have on record; every MACed key must match.
    pub fn verify_mac(
        &self,
        content: &MacContent,
        their_keys: &std::collections::BTreeMap<String, String>,
    ) -> Result<(), CancelContent> {
        let info = extra_mac_info_receive(&self.ids, &self.flow_id);

        let mut key_ids: Vec<&str> = content.mac.keys().map(|k| k.as_str()).collect();
        key_ids.sort_unstable();

        let keys = self
            .sas
            .calculate_mac(&key_ids.join(","), &format!("{info}KEY_IDS"))
            .map_err(|_| self.cancel_content(CancelCode::InvalidMessage))?;

        if keys != content.keys {
            return Err(self.cancel_content(CancelCode::KeyMismatch));
        }

        for (key_id, key_mac) in &content.mac {
            if let Some(key) = their_keys.get(key_id) {
                let expected = self
                    .sas
                    .calculate_mac(key, &format!("{info}{key_id}"))
                    .map_err(|_| self.cancel_content(CancelCode::InvalidMessage))?;

                if *key_mac != expected {
                    return Err(self.cancel_content(CancelCode::KeyMismatch));
                }
            }
        }

        Ok(())
    }

    /// Build a cancellation content for this flow.
    pub fn cancel_content(&self, code: CancelCode) -> CancelContent {
        CancelContent {
            transaction_id: self.flow_id.clone(),
            reason: code.reason().to_owned(),
            code,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use ruma::{device_id, user_id};

    use super::{calculate_commitment, CancelCode, SasVerification};

    fn flow_pair() -> (SasVerification, SasVerification) {
        let (mut alice, start) = SasVerification::start(
            user_id!("@alice:example.org"),
            device_id!("ALICEDEVICE"),
            user_id!("@bob:example.org"),
            device_id!("BOBDEVICE"),
            "the_transaction_id",
        );

        let mut bob = SasVerification::from_start(
            user_id!("@bob:example.org"),
            device_id!("BOBDEVICE"),
            user_id!("@alice:example.org"),
            start,
        )
        .unwrap();

        let accept = bob.accept().unwrap();
        alice.receive_accept(&accept);

        // Alice reveals her key first, Bob answers with his.
        bob.receive_key(&alice.key_content()).unwrap();
        alice.receive_key(&bob.key_content()).unwrap();

        (alice, bob)
    }

    #[test]
    fn short_auth_strings_match() {
        let (alice, bob) = flow_pair();

        assert_eq!(alice.decimals().unwrap(), bob.decimals().unwrap());
        assert_eq!(alice.emoji().unwrap(), bob.emoji().unwrap());
    }

    #[test]
    fn mac_exchange_verifies() {
        let (alice, bob) = flow_pair();

        let alice_keys = BTreeMap::from([(
            "ed25519:ALICEDEVICE".to_owned(),
            "alice_ed25519_public_key".to_owned(),
        )]);

        let mac = alice.confirm(alice_keys.clone()).unwrap();
        bob.verify_mac(&mac, &alice_keys).unwrap();

        let mut wrong_keys = alice_keys;
        wrong_keys.insert("ed25519:ALICEDEVICE".to_owned(), "a_different_key".to_owned());
        let cancel = bob.verify_mac(&mac, &wrong_keys).unwrap_err();
        assert_eq!(cancel.code, CancelCode::KeyMismatch);
    }

    #[test]
    fn mismatched_commitment_is_detected() {
        let (mut alice, start) = SasVerification::start(
            user_id!("@alice:example.org"),
            device_id!("ALICEDEVICE"),
            user_id!("@bob:example.org"),
            device_id!("BOBDEVICE"),
            "txn",
        );

        let bob = SasVerification::from_start(
            user_id!("@bob:example.org"),
            device_id!("BOBDEVICE"),
            user_id!("@alice:example.org"),
            start,
        )
        .unwrap();

        let mut accept = bob.accept().unwrap();
        accept.commitment = "definitely not the right commitment".to_owned();
        alice.receive_accept(&accept);

        let cancel = alice.receive_key(&bob.key_content()).unwrap_err();
        assert_eq!(cancel.code, CancelCode::MismatchedCommitment);
    }

    #[test]
    fn unsupported_start_is_rejected() {
        let (_, mut start) = SasVerification::start(
            user_id!("@alice:example.org"),
            device_id!("ALICEDEVICE"),
            user_id!("@bob:example.org"),
            device_id!("BOBDEVICE"),
            "txn",
        );
        start.method = "m.reciprocate.v1".to_owned();

        let cancel = SasVerification::from_start(
            user_id!("@bob:example.org"),
            device_id!("BOBDEVICE"),
            user_id!("@alice:example.org"),
            start,
        )
        .unwrap_err();

        assert_eq!(cancel.code, CancelCode::UnknownMethod);
    }

    #[test]
    fn commitment_is_deterministic() {
        let (_, start) = SasVerification::start(
            user_id!("@alice:example.org"),
            device_id!("ALICEDEVICE"),
            user_id!("@bob:example.org"),
            device_id!("BOBDEVICE"),
            "txn",
        );

        let a = calculate_commitment("Q/NmNFEUS1fS+YeEmiZkjjblKTitrKOAk7cPEumcMlg", &start).unwrap();
        let b = calculate_commitment("Q/NmNFEUS1fS+YeEmiZkjjblKTitrKOAk7cPEumcMlg", &start).unwrap();

        assert_eq!(a, b);
    }
}
