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

use regex::Regex;
use serde_json::Value;
use tracing::warn;

use crate::{Action, PowerLevels, PushCondition, PushRule, Ruleset};

/// The room state the evaluator needs next to the event itself.
#[derive(Clone, Debug, Default)]
pub struct RoomContext {
    /// Our own user id.
    pub user_id: String,
    /// Our display name in the room. An empty name never matches.
    pub user_display_name: String,
    /// The number of joined members.
    pub member_count: u64,
    /// The room's power levels.
    pub power_levels: PowerLevels,
}

/// An event the evaluated event relates to, resolved by the caller.
#[derive(Clone, Debug)]
pub struct RelatedEvent {
    /// The relation type connecting the events, e.g. `m.in_reply_to`.
    pub rel_type: String,
    /// Whether the relation is only a thread fallback.
    pub is_fallback: bool,
    /// The related event itself.
    pub event: Value,
}

/// Evaluates events against a layered rule set to decide notification
/// actions.
///
/// Rule kinds are tried in precedence order (`override`, `content`,
/// `room`, `sender`, `underride`); within a kind the server-supplied order
/// is kept. The first enabled matching rule decides the outcome.
#[derive(Clone, Debug)]
pub struct PushRuleEvaluator {
    ruleset: Ruleset,
}

impl PushRuleEvaluator {
    /// Create an evaluator for the given rule set.
    pub fn new(ruleset: Ruleset) -> Self {
        Self { ruleset }
    }

    /// Return the actions of the first matching enabled rule.
    ///
    /// `related_events` are the events the evaluated event relates to,
    /// already resolved by the caller; they only matter for
    /// `related_event_match` conditions. A matched rule whose actions
    /// contain `dont_notify` yields an empty list.
    pub fn evaluate(
        &self,
        event: &Value,
        room: &RoomContext,
        related_events: &[RelatedEvent],
    ) -> Vec<Action> {
        for rule in &self.ruleset.override_ {
            if rule.enabled && self.rule_matches(rule, event, room, related_events) {
                return normalized_actions(rule);
            }
        }

        for rule in &self.ruleset.content {
            // Content rules without a pattern can never match anything.
            let Some(pattern) = rule.pattern.as_deref().filter(|p| !p.is_empty()) else {
                continue;
            };

            if rule.enabled && matches_body(event, pattern) {
                return normalized_actions(rule);
            }
        }

        for rule in &self.ruleset.room {
            if rule.enabled && Some(rule.rule_id.as_str()) == event["room_id"].as_str() {
                return normalized_actions(rule);
            }
        }

        for rule in &self.ruleset.sender {
            if rule.enabled && Some(rule.rule_id.as_str()) == event["sender"].as_str() {
                return normalized_actions(rule);
            }
        }

        for rule in &self.ruleset.underride {
            if rule.enabled && self.rule_matches(rule, event, room, related_events) {
                return normalized_actions(rule);
            }
        }

        Vec::new()
    }

    fn rule_matches(
        &self,
        rule: &PushRule,
        event: &Value,
        room: &RoomContext,
        related_events: &[RelatedEvent],
    ) -> bool {
        rule.conditions.iter().all(|c| condition_matches(c, event, room, related_events))
    }
}

fn normalized_actions(rule: &PushRule) -> Vec<Action> {
    if rule.actions.contains(&Action::DontNotify) {
        Vec::new()
    } else {
        rule.actions.clone()
    }
}

fn condition_matches(
    condition: &PushCondition,
    event: &Value,
    room: &RoomContext,
    related_events: &[RelatedEvent],
) -> bool {
    match condition.kind.as_str() {
        "event_match" => {
            let (Some(key), Some(pattern)) =
                (condition.key.as_deref(), condition.pattern.as_deref())
            else {
                return false;
            };

            event_match(event, key, pattern)
        }
        "contains_display_name" => {
            !room.user_display_name.is_empty()
                && contains_word(event["content"]["body"].as_str(), &room.user_display_name)
        }
        "room_member_count" => condition
            .is
            .as_deref()
            .is_some_and(|is| member_count_matches(is, room.member_count)),
        "sender_notification_permission" => {
            let Some(sender) = event["sender"].as_str() else {
                return false;
            };

            let sender_level = room
                .power_levels
                .users
                .get(sender)
                .copied()
                .unwrap_or(room.power_levels.users_default);

            let required = condition
                .key
                .as_deref()
                .and_then(|key| room.power_levels.notifications.get(key).copied())
                .unwrap_or(50);

            sender_level >= required
        }
        "related_event_match" | "im.nheko.msc3664.related_event_match" => {
            related_event_matches(condition, related_events)
        }
        "contains_user_mxid" => {
            !room.user_id.is_empty()
                && contains_word(event["content"]["body"].as_str(), &room.user_id)
        }
        "state_key_user_mxid" => event["state_key"].as_str() == Some(room.user_id.as_str()),
        kind => {
            warn!(kind, "Unknown push condition kind never matches");
            false
        }
    }
}

fn related_event_matches(condition: &PushCondition, related_events: &[RelatedEvent]) -> bool {
    let Some(rel_type) = condition.rel_type.as_deref() else {
        return false;
    };

    let include_fallback = condition.include_fallback.unwrap_or(false);

    related_events
        .iter()
        .filter(|related| related.rel_type == rel_type)
        .filter(|related| include_fallback || !related.is_fallback)
        .any(|related| {
            match (condition.key.as_deref(), condition.pattern.as_deref()) {
                (Some(key), Some(pattern)) => event_match(&related.event, key, pattern),
                // Without a key and pattern any related event of the
                // requested type matches.
                _ => true,
            }
        })
}

/// Look up a dot-separated path inside the event.
///
/// There is no escape mechanism; a field with a literal `.` in its name
/// can't be addressed.
fn lookup_path<'a>(event: &'a Value, path: &str) -> Option<&'a Value> {
    let mut value = event;

    for part in path.split('.') {
        value = value.get(part)?;
    }

    Some(value)
}

fn event_match(event: &Value, key: &str, pattern: &str) -> bool {
    let Some(value) = lookup_path(event, key).and_then(Value::as_str) else {
        return false;
    };

    if key == "content.body" {
        matches_body(event, pattern)
    } else {
        glob_matches(pattern, value)
    }
}

fn matches_body(event: &Value, pattern: &str) -> bool {
    let Some(body) = event["content"]["body"].as_str() else {
        return false;
    };

    word_regex(&glob_to_regex_fragment(pattern))
        .map(|regex| regex.is_match(body))
        .unwrap_or(false)
}

/// Case-insensitive glob match against the whole value.
fn glob_matches(pattern: &str, value: &str) -> bool {
    let fragment = glob_to_regex_fragment(pattern);

    Regex::new(&format!("(?is)^{fragment}$"))
        .map(|regex| regex.is_match(value))
        .unwrap_or_else(|_| {
            warn!(pattern, "Failed to compile a push rule pattern");
            false
        })
}

/// Case-insensitive whole-word search for a literal needle.
fn contains_word(haystack: Option<&str>, needle: &str) -> bool {
    let Some(haystack) = haystack else {
        return false;
    };

    word_regex(&regex::escape(needle))
        .map(|regex| regex.is_match(haystack))
        .unwrap_or(false)
}

/// Wrap a regex fragment in word boundaries.
///
/// Word characters are only `[A-Za-z0-9_]`; anything else, including
/// non-ASCII letters, counts as a boundary. That makes `ähonkü` match the
/// pattern `honk`, mirroring the reference behavior even though it is
/// questionable for non-English text.
fn word_regex(fragment: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("(?is)(^|[^A-Za-z0-9_]){fragment}([^A-Za-z0-9_]|$)"))
}

fn glob_to_regex_fragment(pattern: &str) -> String {
    let mut fragment = String::with_capacity(pattern.len());

    for c in pattern.chars() {
        match c {
            '*' => fragment.push_str(".*"),
            '?' => fragment.push('.'),
            c => {
                if regex_syntax_needs_escape(c) {
                    fragment.push('\\');
                }
                fragment.push(c);
            }
        }
    }

    fragment
}

fn regex_syntax_needs_escape(c: char) -> bool {
    matches!(
        c,
        '\\' | '.' | '+' | '(' | ')' | '|' | '[' | ']' | '{' | '}' | '^' | '$' | '#' | '&' | '-'
            | '~'
    )
}

fn member_count_matches(is: &str, member_count: u64) -> bool {
    let (operator, count) = if let Some(count) = is.strip_prefix("==") {
        ("==", count)
    } else if let Some(count) = is.strip_prefix("<=") {
        ("<=", count)
    } else if let Some(count) = is.strip_prefix(">=") {
        (">=", count)
    } else if let Some(count) = is.strip_prefix('<') {
        ("<", count)
    } else if let Some(count) = is.strip_prefix('>') {
        (">", count)
    } else {
        ("==", is)
    };

    let Ok(count) = count.parse::<u64>() else {
        return false;
    };

    match operator {
        "==" => member_count == count,
        "<" => member_count < count,
        ">" => member_count > count,
        "<=" => member_count <= count,
        ">=" => member_count >= count,
        _ => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::{PushRuleEvaluator, RelatedEvent, RoomContext};
    use crate::{Action, PowerLevels, PushCondition, PushRule, Ruleset, Tweak};

    fn text_event(body: &str) -> Value {
        json!({
            "content": { "body": body, "msgtype": "m.text" },
            "event_id": "$abc1234567890:def.ghi",
            "room_id": "!abc:def.ghi",
            "sender": "@me:def.ghi",
            "type": "m.room.message",
        })
    }

    fn notify_actions() -> Vec<Action> {
        vec![Action::Notify, Action::SetTweak(Tweak::Highlight(true))]
    }

    fn event_match_rule() -> PushRule {
        PushRule {
            actions: notify_actions(),
            conditions: vec![PushCondition {
                kind: "event_match".to_owned(),
                key: Some("content.body".to_owned()),
                pattern: Some("honk".to_owned()),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn assert_body_matching(evaluator: &PushRuleEvaluator) {
        let ctx = RoomContext::default();

        for body in
            ["abc def ghi honk jkl", "abc honk", "honk abc", "abc\nhonk\nabc", "honk", "HoNk", "@honk:", "ähonkü"]
        {
            assert_eq!(
                evaluator.evaluate(&text_event(body), &ctx, &[]),
                notify_actions(),
                "{body:?} should match",
            );
        }

        for body in ["HoN", "honkb", "ahonk"] {
            assert!(
                evaluator.evaluate(&text_event(body), &ctx, &[]).is_empty(),
                "{body:?} shouldn't match",
            );
        }
    }

    #[test]
    fn event_match_in_override_and_underride() {
        let evaluator = PushRuleEvaluator::new(Ruleset {
            override_: vec![event_match_rule()],
            ..Default::default()
        });
        assert_body_matching(&evaluator);

        let evaluator = PushRuleEvaluator::new(Ruleset {
            underride: vec![event_match_rule()],
            ..Default::default()
        });
        assert_body_matching(&evaluator);
    }

    #[test]
    fn content_rules_match_the_body() {
        let evaluator = PushRuleEvaluator::new(Ruleset {
            content: vec![PushRule {
                actions: notify_actions(),
                pattern: Some("honk".to_owned()),
                ..Default::default()
            }],
            ..Default::default()
        });

        assert_body_matching(&evaluator);
    }

    #[test]
    fn content_rules_without_a_pattern_never_match() {
        let evaluator = PushRuleEvaluator::new(Ruleset {
            content: vec![
                PushRule { actions: notify_actions(), pattern: None, ..Default::default() },
                PushRule {
                    actions: notify_actions(),
                    pattern: Some(String::new()),
                    ..Default::default()
                },
            ],
            ..Default::default()
        });

        assert!(evaluator
            .evaluate(&text_event("anything at all"), &RoomContext::default(), &[])
            .is_empty());
    }

    #[test]
    fn room_and_sender_rules_match_on_the_rule_id() {
        let evaluator = PushRuleEvaluator::new(Ruleset {
            room: vec![PushRule {
                rule_id: "!abc:def.ghi".to_owned(),
                actions: notify_actions(),
                ..Default::default()
            }],
            ..Default::default()
        });
        assert_eq!(
            evaluator.evaluate(&text_event("whatever"), &RoomContext::default(), &[]),
            notify_actions()
        );

        let evaluator = PushRuleEvaluator::new(Ruleset {
            sender: vec![PushRule {
                rule_id: "@me:def.ghi".to_owned(),
                actions: notify_actions(),
                ..Default::default()
            }],
            ..Default::default()
        });
        assert_eq!(
            evaluator.evaluate(&text_event("whatever"), &RoomContext::default(), &[]),
            notify_actions()
        );

        let evaluator = PushRuleEvaluator::new(Ruleset {
            room: vec![PushRule {
                rule_id: "!other:def.ghi".to_owned(),
                actions: notify_actions(),
                ..Default::default()
            }],
            ..Default::default()
        });
        assert!(evaluator
            .evaluate(&text_event("whatever"), &RoomContext::default(), &[])
            .is_empty());
    }

    #[test]
    fn display_name_matching() {
        let evaluator = PushRuleEvaluator::new(Ruleset {
            override_: vec![PushRule {
                actions: notify_actions(),
                conditions: vec![PushCondition {
                    kind: "contains_display_name".to_owned(),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        });

        let ctx = RoomContext { user_display_name: "honk".to_owned(), ..Default::default() };

        for body in ["honk", "abc honk", "@honk:", "HoNk", "ähonkü"] {
            assert_eq!(evaluator.evaluate(&text_event(body), &ctx, &[]), notify_actions());
        }

        for body in ["HoN", "honkb"] {
            assert!(evaluator.evaluate(&text_event(body), &ctx, &[]).is_empty());
        }

        // An empty display name never matches.
        let empty = RoomContext::default();
        assert!(evaluator.evaluate(&text_event("@honk:"), &empty, &[]).is_empty());
    }

    #[test]
    fn notification_power_levels() {
        let evaluator = PushRuleEvaluator::new(Ruleset {
            override_: vec![PushRule {
                actions: notify_actions(),
                conditions: vec![PushCondition {
                    kind: "sender_notification_permission".to_owned(),
                    key: Some("room".to_owned()),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        });

        let mut ctx = RoomContext {
            user_display_name: "me".to_owned(),
            member_count: 100,
            power_levels: PowerLevels {
                users: [("@me:def.ghi".to_owned(), 1)].into(),
                users_default: 0,
                notifications: [("room".to_owned(), 1)].into(),
            },
            ..Default::default()
        };

        let event = text_event("abc def ghi honk @room jkl");

        assert_eq!(evaluator.evaluate(&event, &ctx, &[]), notify_actions());

        ctx.power_levels.users.insert("@me:def.ghi".to_owned(), 0);
        assert!(evaluator.evaluate(&event, &ctx, &[]).is_empty());
    }

    #[test]
    fn member_count_comparisons() {
        let test = |is: &str, lt: bool, eq: bool, gt: bool| {
            let evaluator = PushRuleEvaluator::new(Ruleset {
                override_: vec![PushRule {
                    actions: notify_actions(),
                    conditions: vec![PushCondition {
                        kind: "room_member_count".to_owned(),
                        is: Some(is.to_owned()),
                        ..Default::default()
                    }],
                    ..Default::default()
                }],
                ..Default::default()
            });

            let event = text_event("hello");

            for (count, expected) in [(99, lt), (100, eq), (101, gt)] {
                let ctx = RoomContext { member_count: count, ..Default::default() };
                assert_eq!(
                    !evaluator.evaluate(&event, &ctx, &[]).is_empty(),
                    expected,
                    "is={is}, member_count={count}",
                );
            }
        };

        test("100", false, true, false);
        test("==100", false, true, false);
        test(">=100", false, true, true);
        test("<=100", true, true, false);
        test(">100", false, false, true);
        test("<100", true, false, false);
    }

    #[test]
    fn enabled_master_override_silences_everything() {
        let evaluator = PushRuleEvaluator::new(Ruleset {
            override_: vec![PushRule {
                rule_id: ".m.rule.master".to_owned(),
                default: true,
                actions: vec![Action::DontNotify],
                ..Default::default()
            }],
            content: vec![PushRule {
                actions: notify_actions(),
                pattern: Some("honk".to_owned()),
                ..Default::default()
            }],
            ..Default::default()
        });

        assert!(evaluator
            .evaluate(&text_event("honk"), &RoomContext::default(), &[])
            .is_empty());
    }

    #[test]
    fn disabled_rules_are_skipped_but_later_rules_still_fire() {
        let evaluator = PushRuleEvaluator::new(Ruleset {
            override_: vec![
                PushRule {
                    rule_id: ".m.rule.master".to_owned(),
                    enabled: false,
                    actions: vec![Action::DontNotify],
                    ..Default::default()
                },
                event_match_rule(),
            ],
            ..Default::default()
        });

        assert_eq!(
            evaluator.evaluate(&text_event("honk"), &RoomContext::default(), &[]),
            notify_actions()
        );
    }

    #[test]
    fn content_rules_take_precedence_over_room_rules() {
        let evaluator = PushRuleEvaluator::new(Ruleset {
            content: vec![PushRule {
                actions: notify_actions(),
                pattern: Some("lordmzte".to_owned()),
                ..Default::default()
            }],
            room: vec![PushRule {
                rule_id: "!abc:def.ghi".to_owned(),
                actions: vec![Action::DontNotify],
                ..Default::default()
            }],
            ..Default::default()
        });

        // The muted room wins unless the content rule matches first.
        assert!(evaluator
            .evaluate(&text_event("some text"), &RoomContext::default(), &[])
            .is_empty());

        assert_eq!(
            evaluator.evaluate(&text_event("hey lordmzte!"), &RoomContext::default(), &[]),
            notify_actions()
        );
    }

    fn reply_rule(key: Option<&str>, pattern: Option<&str>, include_fallback: bool) -> Ruleset {
        Ruleset {
            override_: vec![PushRule {
                rule_id: ".im.nheko.msc3664.reply".to_owned(),
                actions: notify_actions(),
                conditions: vec![PushCondition {
                    kind: "related_event_match".to_owned(),
                    key: key.map(str::to_owned),
                    pattern: pattern.map(str::to_owned),
                    rel_type: Some("m.in_reply_to".to_owned()),
                    include_fallback: include_fallback.then_some(true),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn reply_related_events(is_fallback: bool) -> Vec<RelatedEvent> {
        let parent = json!({
            "content": { "body": "the parent", "msgtype": "m.text" },
            "event_id": "$aaaaaaaaaaaaaaaaaaaa:bc.de",
            "room_id": "!abc:def.ghi",
            "sender": "@alice:x",
            "type": "m.room.message",
        });

        vec![RelatedEvent {
            rel_type: "m.in_reply_to".to_owned(),
            is_fallback,
            event: parent,
        }]
    }

    #[test]
    fn related_event_matching() {
        let event = text_event("a reply");

        let evaluator = PushRuleEvaluator::new(reply_rule(Some("sender"), Some("@alice:x"), false));

        // Matches when the resolved parent's sender fits the pattern.
        assert_eq!(
            evaluator.evaluate(&event, &RoomContext::default(), &reply_related_events(false)),
            notify_actions()
        );
        // No related events, no match.
        assert!(evaluator.evaluate(&event, &RoomContext::default(), &[]).is_empty());

        // A different sender doesn't match.
        let evaluator = PushRuleEvaluator::new(reply_rule(Some("sender"), Some("@bob:x"), false));
        assert!(evaluator
            .evaluate(&event, &RoomContext::default(), &reply_related_events(false))
            .is_empty());

        // Without a key and pattern any related event of the type matches.
        let evaluator = PushRuleEvaluator::new(reply_rule(None, None, false));
        assert_eq!(
            evaluator.evaluate(&event, &RoomContext::default(), &reply_related_events(false)),
            notify_actions()
        );
    }

    #[test]
    fn fallback_relations_are_ignored_unless_asked_for() {
        let event = text_event("a reply");

        let evaluator = PushRuleEvaluator::new(reply_rule(Some("sender"), Some("@alice:x"), false));
        assert!(evaluator
            .evaluate(&event, &RoomContext::default(), &reply_related_events(true))
            .is_empty());

        let evaluator = PushRuleEvaluator::new(reply_rule(Some("sender"), Some("@alice:x"), true));
        assert_eq!(
            evaluator.evaluate(&event, &RoomContext::default(), &reply_related_events(true)),
            notify_actions()
        );
    }

    #[test]
    fn state_key_and_mxid_conditions() {
        let ctx = RoomContext { user_id: "@me:def.ghi".to_owned(), ..Default::default() };

        let evaluator = PushRuleEvaluator::new(Ruleset {
            override_: vec![PushRule {
                actions: notify_actions(),
                conditions: vec![PushCondition {
                    kind: "contains_user_mxid".to_owned(),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        });

        assert_eq!(
            evaluator.evaluate(&text_event("hey @me:def.ghi, ping"), &ctx, &[]),
            notify_actions()
        );
        assert!(evaluator.evaluate(&text_event("hey @you:def.ghi"), &ctx, &[]).is_empty());

        let evaluator = PushRuleEvaluator::new(Ruleset {
            override_: vec![PushRule {
                actions: notify_actions(),
                conditions: vec![PushCondition {
                    kind: "state_key_user_mxid".to_owned(),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        });

        let mut invite = text_event("");
        invite["type"] = json!("m.room.member");
        invite["state_key"] = json!("@me:def.ghi");

        assert_eq!(evaluator.evaluate(&invite, &ctx, &[]), notify_actions());

        invite["state_key"] = json!("@you:def.ghi");
        assert!(evaluator.evaluate(&invite, &ctx, &[]).is_empty());
    }

    #[test]
    fn glob_patterns_in_event_match() {
        let rule = PushRule {
            actions: notify_actions(),
            conditions: vec![PushCondition {
                kind: "event_match".to_owned(),
                key: Some("type".to_owned()),
                pattern: Some("m.call.*".to_owned()),
                ..Default::default()
            }],
            ..Default::default()
        };

        let evaluator =
            PushRuleEvaluator::new(Ruleset { override_: vec![rule], ..Default::default() });

        let mut event = text_event("ring ring");
        event["type"] = json!("m.call.invite");
        assert_eq!(
            evaluator.evaluate(&event, &RoomContext::default(), &[]),
            notify_actions()
        );

        event["type"] = json!("m.room.message");
        assert!(evaluator.evaluate(&event, &RoomContext::default(), &[]).is_empty());
    }
}
