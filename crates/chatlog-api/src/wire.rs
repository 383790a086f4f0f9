use crate::ApiError;
use chatlog_core::{ConversationKind, ConversationSummary, CivilZone, Message, MessageKind};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    #[serde(default)]
    seq: i64,
    #[serde(default)]
    time: Option<String>,
    #[serde(default)]
    create_time: Option<i64>,
    #[serde(default)]
    talker: String,
    #[serde(default)]
    sender: String,
    #[serde(default)]
    sender_name: Option<String>,
    #[serde(default)]
    is_self: Option<Value>,
    #[serde(default)]
    is_send: Option<Value>,
    #[serde(rename = "type", default)]
    kind: i64,
    #[serde(default)]
    sub_type: i64,
    #[serde(default)]
    content: String,
    #[serde(default)]
    contents: Option<Value>,
}

impl WireMessage {
    fn timestamp(&self, zone: &CivilZone) -> Option<DateTime<Utc>> {
        self.time
            .as_deref()
            .filter(|raw| !raw.trim().is_empty())
            .and_then(|raw| zone.parse_timestamp(raw))
            .or_else(|| {
                self.create_time
                    .filter(|secs| *secs > 0)
                    .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            })
    }

    fn into_message(self, zone: &CivilZone, fallback_conversation: &str) -> Option<Message> {
        let timestamp = self.timestamp(zone)?;
        let is_outgoing = truthy(self.is_self.as_ref()) || truthy(self.is_send.as_ref());
        let conversation_id = if self.talker.is_empty() {
            fallback_conversation.to_string()
        } else {
            self.talker
        };

        Some(Message {
            conversation_id,
            seq: self.seq,
            timestamp,
            sender_id: self.sender,
            sender_name: self.sender_name.filter(|name| !name.is_empty()),
            is_outgoing,
            kind: MessageKind::from_code(self.kind),
            sub_kind: self.sub_type,
            content: self.content,
            contents: self.contents.filter(|value| !value.is_null()),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireSession {
    user_name: String,
    #[serde(default)]
    n_order: Option<i64>,
    #[serde(default)]
    nick_name: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    n_time: Option<String>,
}

impl WireSession {
    fn into_summary(self, zone: &CivilZone) -> ConversationSummary {
        let last_activity = self
            .n_time
            .as_deref()
            .and_then(|raw| zone.parse_timestamp(raw))
            .or_else(|| {
                self.n_order
                    .filter(|secs| *secs > 0)
                    .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            });
        let display_name = self
            .nick_name
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| self.user_name.clone());

        ConversationSummary {
            kind: ConversationKind::from_conversation_id(&self.user_name),
            id: self.user_name,
            display_name,
            last_activity,
            last_message_preview: self.content.filter(|content| !content.is_empty()),
        }
    }
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Number(number)) => number.as_i64().is_some_and(|n| n != 0),
        Some(Value::String(raw)) => matches!(raw.as_str(), "1" | "true"),
        _ => false,
    }
}

/// Unwraps a bare array, `{items: [...]}`, or a `{code, message, data}` envelope.
fn extract_items(payload: Value) -> Result<Vec<Value>, ApiError> {
    match payload {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => Ok(items),
        Value::Object(mut object) => {
            if let Some(code) = object.get("code").and_then(Value::as_i64) {
                if code != 0 {
                    let message = object
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error")
                        .to_string();
                    return Err(ApiError::Remote { code, message });
                }
                return extract_items(object.remove("data").unwrap_or(Value::Null));
            }
            match object.remove("items") {
                Some(items) => extract_items(items),
                None => Err(ApiError::Decode(
                    "expected an array, an items list or a code envelope".to_string(),
                )),
            }
        }
        other => Err(ApiError::Decode(format!("unexpected json value: {other}"))),
    }
}

/// Decodes a chatlog response. Malformed records and records without a
/// usable timestamp are dropped; the rest of the page is kept.
pub fn decode_messages(
    payload: Value,
    zone: &CivilZone,
    conversation_id: &str,
) -> Result<Vec<Message>, ApiError> {
    let items = extract_items(payload)?;
    let mut messages = Vec::with_capacity(items.len());
    for item in items {
        let wire: WireMessage = match serde_json::from_value(item) {
            Ok(wire) => wire,
            Err(err) => {
                tracing::warn!(
                    conversation = %conversation_id,
                    error = %err,
                    "dropping malformed record"
                );
                continue;
            }
        };
        match wire.into_message(zone, conversation_id) {
            Some(message) => messages.push(message),
            None => tracing::debug!(
                conversation = %conversation_id,
                "dropping record without timestamp"
            ),
        }
    }
    Ok(messages)
}

pub fn decode_conversations(
    payload: Value,
    zone: &CivilZone,
) -> Result<Vec<ConversationSummary>, ApiError> {
    let summaries = extract_items(payload)?
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<WireSession>(item) {
            Ok(wire) => Some(wire.into_summary(zone)),
            Err(err) => {
                tracing::warn!(error = %err, "dropping malformed conversation record");
                None
            }
        })
        .collect();
    Ok(summaries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_bare_array_with_naive_civil_time() {
        let zone = CivilZone::default();
        let messages = decode_messages(
            json!([{
                "id": 1,
                "seq": 42,
                "time": "2024-01-10T08:00:00",
                "talker": "team@chatroom",
                "sender": "bob",
                "senderName": "Bob",
                "isSelf": false,
                "isSend": 0,
                "type": 1,
                "subType": 0,
                "content": "hello"
            }]),
            &zone,
            "team@chatroom",
        )
        .expect("messages decoded");

        assert_eq!(messages.len(), 1);
        let message = &messages[0];
        assert_eq!(message.seq, 42);
        assert_eq!(message.timestamp, Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap());
        assert_eq!(message.kind, MessageKind::Text);
        assert_eq!(message.sender_name.as_deref(), Some("Bob"));
        assert!(!message.is_outgoing);
    }

    #[test]
    fn falls_back_to_create_time_and_query_conversation() {
        let zone = CivilZone::default();
        let messages = decode_messages(
            json!({"items": [{"seq": 1, "createTime": 1704873600, "isSend": 1, "type": 49}]}),
            &zone,
            "alice",
        )
        .expect("messages decoded");

        assert_eq!(messages[0].conversation_id, "alice");
        assert_eq!(messages[0].timestamp, Utc.with_ymd_and_hms(2024, 1, 10, 8, 0, 0).unwrap());
        assert!(messages[0].is_outgoing);
        assert_eq!(messages[0].kind, MessageKind::File);
    }

    #[test]
    fn code_envelope_errors_surface() {
        let zone = CivilZone::default();
        let err = decode_messages(json!({"code": 500, "message": "db locked"}), &zone, "alice")
            .expect_err("remote error");
        assert!(matches!(err, ApiError::Remote { code: 500, .. }));

        let ok = decode_messages(json!({"code": 0, "message": "ok", "data": null}), &zone, "alice")
            .expect("empty envelope");
        assert!(ok.is_empty());
    }

    #[test]
    fn records_without_time_are_dropped() {
        let zone = CivilZone::default();
        let messages = decode_messages(json!([{"seq": 1, "content": "orphan"}]), &zone, "alice")
            .expect("decoded");
        assert!(messages.is_empty());
    }

    #[test]
    fn malformed_records_do_not_sink_the_page() {
        let zone = CivilZone::default();
        let messages = decode_messages(
            json!([
                {"seq": "not-a-number", "time": "2024-01-10T08:00:00"},
                {"seq": 2, "time": "2024-01-10T08:01:00", "content": "kept"}
            ]),
            &zone,
            "alice",
        )
        .expect("decoded");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "kept");
    }

    #[test]
    fn decodes_conversation_list() {
        let zone = CivilZone::default();
        let conversations = decode_conversations(
            json!({"items": [
                {
                    "userName": "team@chatroom",
                    "nOrder": 0,
                    "nickName": "Team",
                    "content": "ok",
                    "nTime": "2024-01-10T08:05:00+08:00"
                },
                {"userName": "gh_news", "nickName": "", "content": "", "nTime": ""}
            ]}),
            &zone,
        )
        .expect("conversations decoded");

        assert_eq!(conversations[0].kind, ConversationKind::Group);
        assert_eq!(conversations[0].display_name, "Team");
        assert_eq!(
            conversations[0].last_activity,
            Some(Utc.with_ymd_and_hms(2024, 1, 10, 0, 5, 0).unwrap())
        );
        assert_eq!(conversations[1].display_name, "gh_news");
        assert_eq!(conversations[1].kind, ConversationKind::Official);
        assert!(conversations[1].last_activity.is_none());
        assert!(conversations[1].last_message_preview.is_none());
    }
}
