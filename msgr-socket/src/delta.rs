//! Decoding of individual sync deltas.
//!
//! A delta is one change record carried in the `deltas` array of a `/t_ms`
//! frame, discriminated by its `class` field. Unknown classes and records
//! missing required fields are skipped.

use serde_json::Value;
use tracing::{debug, trace};

use msgr_core::config::ListenConfig;

use crate::events::{
    DomainEvent, Mention, MessageEvent, MessageReplyEvent, ReactionEvent, ReadReceiptEvent,
    ThreadLogEvent, UnsendEvent,
};
use crate::session::SessionContext;

/// Strip the `fbid:` / `id.` prefixes some ids carry.
pub fn format_id(id: &str) -> String {
    id.strip_prefix("fbid:")
        .or_else(|| id.strip_prefix("id."))
        .unwrap_or(id)
        .to_string()
}

/// Read an id that may be encoded as a string or a number.
pub(crate) fn id_of(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Read an integer that may be encoded as a string or a number.
pub(crate) fn int_of(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        _ => None,
    }
}

/// `threadFbId` for groups, `otherUserFbId` for one-to-one threads.
fn thread_key(key: Option<&Value>) -> Option<(String, bool)> {
    let key = key?;
    if let Some(group) = id_of(key.get("threadFbId")) {
        return Some((format_id(&group), true));
    }
    id_of(key.get("otherUserFbId")).map(|id| (format_id(&id), false))
}

/// Decode one delta into zero or more domain events.
pub fn decode_delta(delta: &Value, session: &SessionContext, config: &ListenConfig) -> Vec<DomainEvent> {
    let class = delta.get("class").and_then(Value::as_str).unwrap_or_default();
    trace!("delta class {class:?}");
    match class {
        "NewMessage" => {
            let Some(message) = message_from(delta) else {
                debug!("NewMessage delta without metadata");
                return Vec::new();
            };
            if !config.self_listen && message.sender_id == session.user_id() {
                return Vec::new();
            }
            vec![DomainEvent::Message(message)]
        }
        "ClientPayload" => client_payload(delta),
        "ReadReceipt" => read_receipt(delta).map(DomainEvent::ReadReceipt).into_iter().collect(),
        "AdminTextMessage"
        | "ThreadName"
        | "ParticipantsAddedToGroupThread"
        | "ParticipantLeftGroupThread" => {
            if !config.listen_events {
                return Vec::new();
            }
            thread_log(class, delta).map(DomainEvent::ThreadLog).into_iter().collect()
        }
        _ => Vec::new(),
    }
}

/// Build a message from a record with `messageMetadata`, `body`,
/// `attachments`, `data.prng` and `participants`.
fn message_from(record: &Value) -> Option<MessageEvent> {
    let metadata = record.get("messageMetadata")?;
    let sender_id = format_id(&id_of(metadata.get("actorFbId"))?);
    let (thread_id, is_group) = thread_key(metadata.get("threadKey"))?;
    let message_id = id_of(metadata.get("messageId"))?;
    let body = record
        .get("body")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let attachments = record
        .get("attachments")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let participant_ids = record
        .get("participants")
        .and_then(Value::as_array)
        .map(|ids| ids.iter().filter_map(|id| id_of(Some(id))).collect())
        .unwrap_or_default();

    let mentions = mentions(record.pointer("/data/prng"), &body);

    Some(MessageEvent {
        sender_id,
        body,
        thread_id,
        message_id,
        attachments,
        mentions,
        timestamp: int_of(metadata.get("timestamp")).unwrap_or_default(),
        is_group,
        participant_ids,
    })
}

/// Mention ranges are `[{i: id, o: offset, l: length}]`, serialized as a
/// JSON string, with offsets counted in UTF-16 code units.
fn mentions(prng: Option<&Value>, body: &str) -> Vec<Mention> {
    let ranges: Vec<Value> = match prng {
        Some(Value::String(raw)) => serde_json::from_str(raw).unwrap_or_default(),
        Some(Value::Array(items)) => items.clone(),
        _ => return Vec::new(),
    };
    let units: Vec<u16> = body.encode_utf16().collect();

    ranges
        .iter()
        .filter_map(|range| {
            let id = id_of(range.get("i"))?;
            let offset = int_of(range.get("o"))?.max(0) as usize;
            let length = int_of(range.get("l"))?.max(0) as usize;
            let start = offset.min(units.len());
            let end = offset.saturating_add(length).min(units.len());
            Some(Mention {
                id,
                offset,
                length,
                text: String::from_utf16_lossy(&units[start..end]),
            })
        })
        .collect()
}

/// `ClientPayload` wraps further deltas in a byte array of UTF-8 JSON.
fn client_payload(delta: &Value) -> Vec<DomainEvent> {
    let Some(bytes) = delta.get("payload").and_then(Value::as_array) else {
        return Vec::new();
    };
    let Some(bytes) = bytes
        .iter()
        .map(|b| b.as_u64().and_then(|b| u8::try_from(b).ok()))
        .collect::<Option<Vec<u8>>>()
    else {
        debug!("client payload holds a value that is not a byte");
        return Vec::new();
    };
    let inner: Value = match serde_json::from_slice(&bytes) {
        Ok(v) => v,
        Err(e) => {
            debug!("unparsable client payload: {e}");
            return Vec::new();
        }
    };

    let mut events = Vec::new();
    for item in inner.get("deltas").and_then(Value::as_array).into_iter().flatten() {
        if let Some(reaction) = item.get("deltaMessageReaction") {
            events.extend(reaction_event(reaction).map(DomainEvent::MessageReaction));
        } else if let Some(recall) = item.get("deltaRecallMessageData") {
            events.extend(unsend_event(recall).map(DomainEvent::MessageUnsend));
        } else if let Some(reply) = item.get("deltaMessageReply") {
            events.extend(reply_event(reply).map(DomainEvent::MessageReply));
        }
    }
    events
}

fn reaction_event(reaction: &Value) -> Option<ReactionEvent> {
    let (thread_id, _) = thread_key(reaction.get("threadKey"))?;
    let emoji = reaction
        .get("reaction")
        .and_then(Value::as_str)
        .map(str::to_string);
    // action 0 adds, 1 removes
    let removed = int_of(reaction.get("action")) == Some(1) || emoji.is_none();
    Some(ReactionEvent {
        thread_id,
        message_id: id_of(reaction.get("messageId"))?,
        reaction: if removed { None } else { emoji },
        sender_id: id_of(reaction.get("senderId")).unwrap_or_default(),
        user_id: id_of(reaction.get("userId"))?,
        removed,
    })
}

fn unsend_event(recall: &Value) -> Option<UnsendEvent> {
    let (thread_id, _) = thread_key(recall.get("threadKey"))?;
    Some(UnsendEvent {
        thread_id,
        message_id: id_of(recall.get("messageID").or_else(|| recall.get("messageId")))?,
        sender_id: id_of(recall.get("senderID").or_else(|| recall.get("senderId")))
            .unwrap_or_default(),
        deletion_timestamp: int_of(recall.get("deletionTimestamp")).unwrap_or_default(),
        timestamp: int_of(recall.get("timestamp")).unwrap_or_default(),
    })
}

fn reply_event(reply: &Value) -> Option<MessageReplyEvent> {
    let message = message_from(reply.get("message")?)?;
    let replied_to = reply.get("repliedToMessage").and_then(message_from);
    Some(MessageReplyEvent { message, replied_to })
}

fn read_receipt(delta: &Value) -> Option<ReadReceiptEvent> {
    let key = delta.get("threadKey")?;
    let thread_id = id_of(key.get("otherUserFbId")).or_else(|| id_of(key.get("threadFbId")))?;
    let reader = id_of(delta.get("actorFbId")).or_else(|| id_of(key.get("otherUserFbId")))?;
    Some(ReadReceiptEvent {
        reader: format_id(&reader),
        time: int_of(delta.get("actionTimestampMs")).unwrap_or_default(),
        thread_id: format_id(&thread_id),
    })
}

fn thread_log(class: &str, delta: &Value) -> Option<ThreadLogEvent> {
    let metadata = delta.get("messageMetadata")?;
    let (thread_id, _) = thread_key(metadata.get("threadKey"))?;

    let (log_message_type, log_message_data) = match class {
        "AdminTextMessage" => (
            delta.get("type").and_then(Value::as_str).unwrap_or_default().to_string(),
            delta.get("untypedData").cloned().unwrap_or(Value::Null),
        ),
        "ThreadName" => (
            "log:thread-name".to_string(),
            serde_json::json!({ "name": delta.get("name").cloned().unwrap_or(Value::Null) }),
        ),
        "ParticipantsAddedToGroupThread" => (
            "log:subscribe".to_string(),
            serde_json::json!({
                "addedParticipants": delta.get("addedParticipants").cloned().unwrap_or(Value::Null)
            }),
        ),
        "ParticipantLeftGroupThread" => (
            "log:unsubscribe".to_string(),
            serde_json::json!({
                "leftParticipantFbId": delta.get("leftParticipantFbId").cloned().unwrap_or(Value::Null)
            }),
        ),
        _ => return None,
    };

    Some(ThreadLogEvent {
        thread_id,
        log_message_type,
        log_message_data,
        log_message_body: metadata
            .get("adminText")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        author: id_of(metadata.get("actorFbId")).map(|a| format_id(&a)).unwrap_or_default(),
        timestamp: int_of(metadata.get("timestamp")).unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use msgr_api::Credentials;
    use serde_json::json;

    fn session() -> SessionContext {
        SessionContext::new(
            Credentials::from_cookie_header("c_user=100", "https://www.facebook.com").unwrap(),
        )
    }

    fn new_message(sender: &str) -> Value {
        json!({
            "class": "NewMessage",
            "body": "hi @Ann there",
            "attachments": [{"mercury": {"blob_attachment": {}}}],
            "data": {"prng": r#"[{"i":"555","o":3,"l":4}]"#},
            "participants": ["100", 200],
            "messageMetadata": {
                "actorFbId": sender,
                "messageId": "mid.$abc",
                "threadKey": {"threadFbId": "900"},
                "timestamp": "1700000000123"
            }
        })
    }

    #[test]
    fn test_format_id() {
        assert_eq!(format_id("fbid:123"), "123");
        assert_eq!(format_id("id.456"), "456");
        assert_eq!(format_id("789"), "789");
    }

    #[test]
    fn test_new_message() {
        let events = decode_delta(&new_message("200"), &session(), &ListenConfig::default());
        let [DomainEvent::Message(message)] = events.as_slice() else {
            panic!("expected one message, got {events:?}");
        };
        assert_eq!(message.sender_id, "200");
        assert_eq!(message.thread_id, "900");
        assert!(message.is_group);
        assert_eq!(message.message_id, "mid.$abc");
        assert_eq!(message.timestamp, 1_700_000_000_123);
        assert_eq!(message.attachments.len(), 1);
        assert_eq!(message.participant_ids, vec!["100", "200"]);
        assert_eq!(message.mentions[0].id, "555");
        assert_eq!(message.mentions[0].text, "@Ann");
    }

    #[test]
    fn test_own_message_needs_self_listen() {
        let mut config = ListenConfig::default();
        assert!(decode_delta(&new_message("100"), &session(), &config).is_empty());
        config.self_listen = true;
        assert_eq!(decode_delta(&new_message("100"), &session(), &config).len(), 1);
    }

    #[test]
    fn test_one_to_one_thread() {
        let mut delta = new_message("200");
        delta["messageMetadata"]["threadKey"] = json!({"otherUserFbId": 200});
        let events = decode_delta(&delta, &session(), &ListenConfig::default());
        let [DomainEvent::Message(message)] = events.as_slice() else {
            panic!("expected one message");
        };
        assert_eq!(message.thread_id, "200");
        assert!(!message.is_group);
    }

    fn client_payload_delta(inner: Value) -> Value {
        let bytes: Vec<Value> = inner.to_string().bytes().map(|b| json!(b)).collect();
        json!({"class": "ClientPayload", "payload": bytes})
    }

    #[test]
    fn test_client_payload_reaction_and_unsend() {
        let delta = client_payload_delta(json!({
            "deltas": [
                {"deltaMessageReaction": {
                    "threadKey": {"otherUserFbId": "300"},
                    "messageId": "mid.1",
                    "reaction": "\u{1F44D}",
                    "senderId": 100,
                    "userId": 300,
                    "action": 0
                }},
                {"deltaRecallMessageData": {
                    "threadKey": {"threadFbId": "900"},
                    "messageID": "mid.2",
                    "senderID": "300",
                    "deletionTimestamp": 1700000000999i64,
                    "timestamp": 1700000000000i64
                }},
                {"somethingElse": {}}
            ]
        }));
        let events = decode_delta(&delta, &session(), &ListenConfig::default());
        assert_eq!(events.len(), 2);
        match &events[0] {
            DomainEvent::MessageReaction(r) => {
                assert_eq!(r.thread_id, "300");
                assert_eq!(r.user_id, "300");
                assert_eq!(r.reaction.as_deref(), Some("\u{1F44D}"));
                assert!(!r.removed);
            }
            other => panic!("expected reaction, got {other:?}"),
        }
        match &events[1] {
            DomainEvent::MessageUnsend(u) => {
                assert_eq!(u.message_id, "mid.2");
                assert_eq!(u.deletion_timestamp, 1_700_000_000_999);
            }
            other => panic!("expected unsend, got {other:?}"),
        }
    }

    #[test]
    fn test_client_payload_reply() {
        let mut original = new_message("300");
        original["messageMetadata"]["messageId"] = json!("mid.orig");
        let delta = client_payload_delta(json!({
            "deltas": [{"deltaMessageReply": {
                "message": new_message("200"),
                "repliedToMessage": original
            }}]
        }));
        let events = decode_delta(&delta, &session(), &ListenConfig::default());
        let [DomainEvent::MessageReply(reply)] = events.as_slice() else {
            panic!("expected one reply");
        };
        assert_eq!(reply.message.sender_id, "200");
        assert_eq!(reply.replied_to.as_ref().unwrap().message_id, "mid.orig");
    }

    #[test]
    fn test_garbage_client_payload_ignored() {
        let delta = json!({"class": "ClientPayload", "payload": [123, 34, 120]});
        assert!(decode_delta(&delta, &session(), &ListenConfig::default()).is_empty());
    }

    #[test]
    fn test_client_payload_with_non_byte_rejected() {
        let mut delta = client_payload_delta(json!({
            "deltas": [{"deltaRecallMessageData": {
                "threadKey": {"threadFbId": "900"},
                "messageID": "mid.2",
                "senderID": "300",
                "deletionTimestamp": 1,
                "timestamp": 1
            }}]
        }));
        assert_eq!(decode_delta(&delta, &session(), &ListenConfig::default()).len(), 1);

        // 379 wraps to b'{' when truncated
        delta["payload"][0] = json!(379);
        assert!(decode_delta(&delta, &session(), &ListenConfig::default()).is_empty());
        delta["payload"][0] = json!(-5);
        assert!(decode_delta(&delta, &session(), &ListenConfig::default()).is_empty());
    }

    #[test]
    fn test_read_receipt() {
        let delta = json!({
            "class": "ReadReceipt",
            "actorFbId": "300",
            "actionTimestampMs": "1700000000500",
            "threadKey": {"threadFbId": "900"}
        });
        let events = decode_delta(&delta, &session(), &ListenConfig::default());
        assert_eq!(
            events,
            vec![DomainEvent::ReadReceipt(ReadReceiptEvent {
                reader: "300".into(),
                time: 1_700_000_000_500,
                thread_id: "900".into(),
            })]
        );
    }

    #[test]
    fn test_thread_name_event() {
        let delta = json!({
            "class": "ThreadName",
            "name": "Weekend",
            "messageMetadata": {
                "actorFbId": "300",
                "adminText": "Sam named the group Weekend.",
                "threadKey": {"threadFbId": "900"},
                "timestamp": "1700000000000"
            }
        });
        let mut config = ListenConfig::default();
        let events = decode_delta(&delta, &session(), &config);
        let [DomainEvent::ThreadLog(log)] = events.as_slice() else {
            panic!("expected one log event");
        };
        assert_eq!(log.log_message_type, "log:thread-name");
        assert_eq!(log.log_message_data["name"], "Weekend");
        assert_eq!(log.author, "300");

        config.listen_events = false;
        assert!(decode_delta(&delta, &session(), &config).is_empty());
    }

    #[test]
    fn test_admin_text_uses_delta_type() {
        let delta = json!({
            "class": "AdminTextMessage",
            "type": "change_thread_theme",
            "untypedData": {"theme_color": "FF0084FF"},
            "messageMetadata": {"actorFbId": "300", "threadKey": {"threadFbId": "900"}}
        });
        let events = decode_delta(&delta, &session(), &ListenConfig::default());
        let [DomainEvent::ThreadLog(log)] = events.as_slice() else {
            panic!("expected one log event");
        };
        assert_eq!(log.log_message_type, "change_thread_theme");
        assert_eq!(log.log_message_data["theme_color"], "FF0084FF");
    }

    #[test]
    fn test_unknown_and_incomplete_deltas_ignored() {
        let config = ListenConfig::default();
        assert!(decode_delta(&json!({"class": "MarkRead"}), &session(), &config).is_empty());
        assert!(decode_delta(&json!({"class": "NewMessage"}), &session(), &config).is_empty());
        assert!(decode_delta(&json!(42), &session(), &config).is_empty());
    }
}
