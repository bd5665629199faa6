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

//! The Olm and Megolm ratchet wrappers: the per-device account, pairwise
//! sessions, and group sessions.

mod account;
mod group_sessions;
mod session;

pub use account::{Account, InboundCreationResult, PickledAccount};
pub use group_sessions::{
    EncryptionSettings, ExportedRoomKey, InboundGroupSession, OutboundGroupSession,
    PickledInboundGroupSession, PickledOutboundGroupSession, ROTATION_MESSAGES, ROTATION_PERIOD,
};
pub use session::{PickledSession, Session};
pub use vodozemac::{
    megolm::{ExportedSessionKey, MegolmMessage, SessionKey, SessionOrdering},
    olm::{IdentityKeys, OlmMessage, PreKeyMessage},
};
