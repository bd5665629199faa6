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

#![doc = include_str!("../README.md")]
#![warn(missing_debug_implementations, missing_docs)]

mod evaluator;

use std::collections::BTreeMap;

use serde::{
    de::Error as _,
    ser::{SerializeMap, Serializer},
    Deserialize, Serialize,
};
use serde_json::Value;

pub use evaluator::{PushRuleEvaluator, RelatedEvent, RoomContext};

/// A notification tweak attached to a `set_tweak` action.
#[derive(Clone, Debug, PartialEq)]
pub enum Tweak {
    /// Play the given sound.
    Sound(String),
    /// Highlight the message. An absent value on the wire means true.
    Highlight(bool),
    /// A tweak this library doesn't interpret.
    Custom {
        /// The name of the tweak.
        name: String,
        /// Its raw value.
        value: Value,
    },
}

/// A single action a matching push rule asks the client to perform.
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    /// Notify the user.
    Notify,
    /// Don't notify the user; a rule carrying this silences the event.
    DontNotify,
    /// Tweak how the notification is presented.
    SetTweak(Tweak),
}

impl Serialize for Action {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Action::Notify => serializer.serialize_str("notify"),
            Action::DontNotify => serializer.serialize_str("dont_notify"),
            Action::SetTweak(tweak) => tweak.serialize(serializer),
        }
    }
}

impl Serialize for Tweak {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Tweak::Sound(sound) => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("set_tweak", "sound")?;
                map.serialize_entry("value", sound)?;
                map.end()
            }
            // A highlight without a value means true on the wire.
            Tweak::Highlight(true) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("set_tweak", "highlight")?;
                map.end()
            }
            Tweak::Highlight(false) => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("set_tweak", "highlight")?;
                map.serialize_entry("value", &false)?;
                map.end()
            }
            Tweak::Custom { name, value } => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("set_tweak", name)?;
                map.serialize_entry("value", value)?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Action {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;

        match value {
            Value::String(action) => match action.as_str() {
                "notify" => Ok(Action::Notify),
                "dont_notify" => Ok(Action::DontNotify),
                other => Err(D::Error::custom(format!("unknown push action {other:?}"))),
            },
            Value::Object(map) => {
                let tweak = map
                    .get("set_tweak")
                    .and_then(Value::as_str)
                    .ok_or_else(|| D::Error::custom("a push action object needs a set_tweak"))?;

                let tweak = match tweak {
                    "sound" => Tweak::Sound(
                        map.get("value").and_then(Value::as_str).unwrap_or("default").to_owned(),
                    ),
                    "highlight" => {
                        Tweak::Highlight(map.get("value").and_then(Value::as_bool).unwrap_or(true))
                    }
                    name => Tweak::Custom {
                        name: name.to_owned(),
                        value: map.get("value").cloned().unwrap_or(Value::Null),
                    },
                };

                Ok(Action::SetTweak(tweak))
            }
            _ => Err(D::Error::custom("a push action is either a string or an object")),
        }
    }
}

/// A single condition of a push rule.
///
/// The `kind` decides which of the optional fields are meaningful.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PushCondition {
    /// The kind of the condition, e.g. `event_match`.
    pub kind: String,
    /// The dot-separated path into the event, for `event_match`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// The glob pattern to match with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// The member count comparison, for `room_member_count`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is: Option<String>,
    /// The relation type, for `related_event_match`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rel_type: Option<String>,
    /// Whether fallback relations should be considered, for
    /// `related_event_match`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_fallback: Option<bool>,
}

fn default_enabled() -> bool {
    true
}

/// A single push rule: conditions deciding whether it applies and the
/// actions it yields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PushRule {
    /// The id of the rule. For `room` and `sender` rules the id doubles as
    /// the room or sender to match.
    #[serde(default)]
    pub rule_id: String,
    /// Whether this is a server-default rule.
    #[serde(default)]
    pub default: bool,
    /// Disabled rules are skipped, but still occupy their spot in the
    /// precedence order.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// The body pattern of a `content` rule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// The conditions that all have to hold, for `override` and
    /// `underride` rules. No conditions means the rule always matches.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<PushCondition>,
    /// What to do when the rule matches.
    #[serde(default)]
    pub actions: Vec<Action>,
}

impl Default for PushRule {
    fn default() -> Self {
        Self {
            rule_id: String::new(),
            default: false,
            enabled: true,
            pattern: None,
            conditions: Vec::new(),
            actions: Vec::new(),
        }
    }
}

/// The five rule kinds, in precedence order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Ruleset {
    /// Rules that take precedence over everything else.
    #[serde(default, rename = "override", skip_serializing_if = "Vec::is_empty")]
    pub override_: Vec<PushRule>,
    /// Body-pattern rules.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<PushRule>,
    /// Per-room rules; the rule id is the room id.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub room: Vec<PushRule>,
    /// Per-sender rules; the rule id is the sender.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sender: Vec<PushRule>,
    /// Rules that apply when nothing else matched.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub underride: Vec<PushRule>,
}

/// The ruleset as returned from the `/pushrules` endpoint.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalRuleset {
    /// The user's global ruleset.
    #[serde(default)]
    pub global: Ruleset,
}

/// The relevant parts of the room's power levels event.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PowerLevels {
    /// Per-user power levels.
    #[serde(default)]
    pub users: BTreeMap<String, i64>,
    /// The power level of users not listed in `users`.
    #[serde(default)]
    pub users_default: i64,
    /// The power level required for `sender_notification_permission` keys,
    /// e.g. `room` for `@room` mentions.
    #[serde(default)]
    pub notifications: BTreeMap<String, i64>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{Action, GlobalRuleset, Tweak};

    #[test]
    fn actions_parse_their_wire_forms() {
        let actions: Vec<Action> = serde_json::from_value(json!([
            "notify",
            { "set_tweak": "sound", "value": "default" },
            { "set_tweak": "highlight" },
            { "set_tweak": "highlight", "value": false },
            { "set_tweak": "org.example.custom", "value": 7 },
        ]))
        .unwrap();

        assert_eq!(
            actions,
            vec![
                Action::Notify,
                Action::SetTweak(Tweak::Sound("default".to_owned())),
                Action::SetTweak(Tweak::Highlight(true)),
                Action::SetTweak(Tweak::Highlight(false)),
                Action::SetTweak(Tweak::Custom {
                    name: "org.example.custom".to_owned(),
                    value: json!(7),
                }),
            ]
        );
    }

    #[test]
    fn actions_round_trip() {
        let json = json!([
            "notify",
            "dont_notify",
            { "set_tweak": "sound", "value": "ring" },
            { "set_tweak": "highlight" },
            { "set_tweak": "highlight", "value": false },
        ]);

        let actions: Vec<Action> = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(serde_json::to_value(&actions).unwrap(), json);
    }

    #[test]
    fn default_ruleset_parses() {
        let data = json!({
            "global": {
                "content": [
                    {
                        "actions": [
                            "notify",
                            { "set_tweak": "sound", "value": "default" },
                            { "set_tweak": "highlight" }
                        ],
                        "default": true,
                        "pattern": "alice",
                        "rule_id": ".m.rule.contains_user_name"
                    }
                ],
                "override": [
                    {
                        "actions": ["dont_notify"],
                        "default": true,
                        "enabled": false,
                        "rule_id": ".m.rule.master"
                    },
                    {
                        "actions": ["dont_notify"],
                        "conditions": [
                            {
                                "key": "content.msgtype",
                                "kind": "event_match",
                                "pattern": "m.notice"
                            }
                        ],
                        "default": true,
                        "rule_id": ".m.rule.suppress_notices"
                    }
                ],
                "room": [],
                "sender": [],
                "underride": [
                    {
                        "actions": [
                            "notify",
                            { "set_tweak": "sound", "value": "ring" },
                            { "set_tweak": "highlight", "value": false }
                        ],
                        "conditions": [
                            { "key": "type", "kind": "event_match", "pattern": "m.call.invite" }
                        ],
                        "default": true,
                        "rule_id": ".m.rule.call"
                    },
                    {
                        "actions": [
                            "notify",
                            { "set_tweak": "sound", "value": "default" },
                            { "set_tweak": "highlight" }
                        ],
                        "conditions": [{ "kind": "contains_display_name" }],
                        "default": true,
                        "rule_id": ".m.rule.contains_display_name"
                    }
                ]
            }
        });

        let rules: GlobalRuleset = serde_json::from_value(data).unwrap();

        assert_eq!(rules.global.content[0].rule_id, ".m.rule.contains_user_name");
        assert_eq!(rules.global.content[0].actions.len(), 3);
        assert_eq!(rules.global.content[0].actions[0], Action::Notify);
        assert_eq!(
            rules.global.content[0].actions[1],
            Action::SetTweak(Tweak::Sound("default".to_owned()))
        );
        assert_eq!(
            rules.global.content[0].actions[2],
            Action::SetTweak(Tweak::Highlight(true))
        );

        assert!(!rules.global.override_[0].enabled);
        assert!(rules.global.override_[1].enabled);
        assert_eq!(rules.global.underride.len(), 2);
        assert_eq!(rules.global.underride[0].conditions[0].key.as_deref(), Some("type"));
    }
}
