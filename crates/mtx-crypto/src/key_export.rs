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

//! The passphrase protected, armored file format for Megolm session
//! exports.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use pbkdf2::pbkdf2_hmac;
use rand::{thread_rng, RngCore};
use sha2::Sha512;
use zeroize::Zeroize;

use crate::{
    ciphers::{AesHmacSha2Key, IV_SIZE, MAC_SIZE},
    error::KeyExportError,
    olm::ExportedRoomKey,
    utilities,
};

const HEADER: &str = "-----BEGIN MEGOLM SESSION DATA-----";
const FOOTER: &str = "-----END MEGOLM SESSION DATA-----";

const VERSION: u8 = 1;
const SALT_SIZE: usize = 16;
const ROUNDS_SIZE: usize = 4;

/// The number of PBKDF2 rounds a fresh export is written with.
pub const DEFAULT_EXPORT_ROUNDS: u32 = 100_000;

// Version byte, salt, IV, round count and MAC are all mandatory; only the
// ciphertext may be empty.
const MIN_PAYLOAD_SIZE: usize = 1 + SALT_SIZE + IV_SIZE + ROUNDS_SIZE + MAC_SIZE;

fn derive_keys(passphrase: &str, salt: &[u8], rounds: u32) -> AesHmacSha2Key {
    let mut expanded = [0u8; 64];
    pbkdf2_hmac::<Sha512>(passphrase.as_bytes(), salt, rounds, &mut expanded);

    let key = AesHmacSha2Key::from_expanded(&expanded);
    expanded.zeroize();

    key
}

/// Encrypt a list of exported sessions into the armored export format.
///
/// The format is a version byte, the PBKDF2 salt, the AES-CTR IV, the
/// big-endian round count, the ciphertext of the JSON session array and a
/// trailing HMAC over everything before it.
pub fn encrypt_key_export(
    keys: &[ExportedRoomKey],
    passphrase: &str,
    rounds: u32,
) -> Result<String, serde_json::Error> {
    let mut salt = [0u8; SALT_SIZE];
    thread_rng().fill_bytes(&mut salt);

    let mut iv = [0u8; IV_SIZE];
    thread_rng().fill_bytes(&mut iv);
    iv[8] &= 0x7F;

    let key = derive_keys(passphrase, &salt, rounds);
    let ciphertext = key.encrypt(serde_json::to_vec(keys)?, &iv);

    let mut payload = Vec::with_capacity(MIN_PAYLOAD_SIZE + ciphertext.len());
    payload.push(VERSION);
    payload.extend_from_slice(&salt);
    payload.extend_from_slice(&iv);
    payload.write_u32::<BigEndian>(rounds).expect("writing to a Vec can't fail");
    payload.extend_from_slice(&ciphertext);

    let mac = key.mac(&payload);
    payload.extend_from_slice(&mac);

    Ok([HEADER, &utilities::encode(payload), FOOTER].join("\n"))
}

/// Decrypt an armored session export.
///
/// The MAC is verified before anything is decrypted; a wrong passphrase
/// surfaces as [`KeyExportError::Mac`].
pub fn decrypt_key_export(
    export: &str,
    passphrase: &str,
) -> Result<Vec<ExportedRoomKey>, KeyExportError> {
    let payload = utilities::decode(unpack_export(export)?)?;

    if payload.len() < MIN_PAYLOAD_SIZE {
        return Err(KeyExportError::TooShort);
    }

    let version = payload[0];
    if version != VERSION {
        return Err(KeyExportError::UnsupportedVersion(version));
    }

    let salt = &payload[1..1 + SALT_SIZE];
    let iv: [u8; IV_SIZE] = payload[1 + SALT_SIZE..1 + SALT_SIZE + IV_SIZE]
        .try_into()
        .expect("length checked above");

    let rounds_start = 1 + SALT_SIZE + IV_SIZE;
    let mut rounds_bytes = &payload[rounds_start..rounds_start + ROUNDS_SIZE];
    let rounds = rounds_bytes.read_u32::<BigEndian>().expect("length checked above");

    let mac_start = payload.len() - MAC_SIZE;

    let key = derive_keys(passphrase, salt, rounds);
    key.verify_mac(&payload[..mac_start], &payload[mac_start..])
        .map_err(|_| KeyExportError::Mac)?;

    let ciphertext = payload[rounds_start + ROUNDS_SIZE..mac_start].to_vec();
    let plaintext = key.decrypt(ciphertext, &iv);

    Ok(serde_json::from_slice(&plaintext)?)
}

/// Collect the base64 payload between the header and footer lines.
fn unpack_export(export: &str) -> Result<String, KeyExportError> {
    let mut lines = export.lines().map(str::trim);

    if !lines.any(|l| l == HEADER) {
        return Err(KeyExportError::InvalidHeader);
    }

    let mut payload = String::new();
    let mut closed = false;

    for line in lines {
        if line == FOOTER {
            closed = true;
            break;
        }
        payload.push_str(line);
    }

    if closed {
        Ok(payload)
    } else {
        Err(KeyExportError::InvalidHeader)
    }
}
