//! Frame decoder: routes an inbound frame by topic and turns it into
//! domain events, updating the session cursor along the way.

use serde_json::{Map, Value};
use tracing::{debug, warn};

use msgr_core::config::ListenConfig;
use msgr_core::constants::topics;
use msgr_core::error::{MsgrError, MsgrResult};

use crate::delta::{decode_delta, format_id, id_of, int_of};
use crate::events::{DomainEvent, FriendRequestEvent, PresenceEvent, TypingEvent};
use crate::session::{SessionContext, TaskKind, TaskResponse, TaskResult, TaskTable};

/// Parse a frame payload, degrading anything that is not JSON to `{}`.
pub fn parse_payload(payload: &[u8]) -> Value {
    match serde_json::from_slice::<Value>(payload) {
        Ok(value) => value,
        Err(e) => {
            debug!("unparsable frame payload ({} bytes): {e}", payload.len());
            Value::Object(Map::new())
        }
    }
}

/// Decode one frame. Never fails; malformed input yields no events.
pub fn decode_frame(
    topic: &str,
    payload: &[u8],
    session: &mut SessionContext,
    tasks: &mut TaskTable,
    config: &ListenConfig,
) -> Vec<DomainEvent> {
    let json = parse_payload(payload);
    match topic {
        topics::SYNC => sync_frame(&json, session, config),
        topics::THREAD_TYPING | topics::ORCA_TYPING => {
            if config.listen_typing {
                typing(&json).map(DomainEvent::Typing).into_iter().collect()
            } else {
                Vec::new()
            }
        }
        topics::PRESENCE => {
            if config.update_presence {
                Vec::new()
            } else {
                presence(&json)
            }
        }
        topics::TASK_RESPONSE => {
            task_response(&json, tasks);
            Vec::new()
        }
        topics::LEGACY_WEB => friend_request(&json).into_iter().collect(),
        _ => {
            debug!("ignoring frame on {topic}");
            Vec::new()
        }
    }
}

fn sync_frame(json: &Value, session: &mut SessionContext, config: &ListenConfig) -> Vec<DomainEvent> {
    if let (Some(first), Some(token)) = (
        int_of(json.get("firstDeltaSeqId")),
        json.get("syncToken").and_then(Value::as_str),
    ) {
        debug!("queue created at seq {first}");
        session.last_seq_id = Some(first);
        session.sync_token = Some(token.to_string());
    }

    if let Some(last) = int_of(json.get("lastIssuedSeqId")) {
        session.last_seq_id = Some(last);
    }

    let Some(deltas) = json.get("deltas").and_then(Value::as_array) else {
        return Vec::new();
    };
    deltas
        .iter()
        .flat_map(|delta| decode_delta(delta, session, config))
        .collect()
}

fn typing(json: &Value) -> Option<TypingEvent> {
    let from = id_of(json.get("sender_fbid"))?;
    let thread = id_of(json.get("thread")).unwrap_or_else(|| from.clone());
    Some(TypingEvent {
        is_typing: int_of(json.get("state")).unwrap_or_default() != 0,
        thread_id: format_id(&thread),
        from,
    })
}

fn presence(json: &Value) -> Vec<DomainEvent> {
    json.get("list")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|entry| {
            Some(DomainEvent::Presence(PresenceEvent {
                user_id: id_of(entry.get("u"))?,
                timestamp: int_of(entry.get("l")).unwrap_or_default().saturating_mul(1000),
                statuses: entry.get("p").cloned().unwrap_or(Value::Null),
            }))
        })
        .collect()
}

fn friend_request(json: &Value) -> Option<DomainEvent> {
    let kind = json.get("type").and_then(Value::as_str)?;
    let event = FriendRequestEvent {
        actor_id: id_of(json.get("from"))?,
        timestamp: chrono::Utc::now().timestamp_millis(),
    };
    match kind {
        "jewel_requests_add" => Some(DomainEvent::FriendRequestReceived(event)),
        "jewel_requests_remove_old" => Some(DomainEvent::FriendRequestCancel(event)),
        _ => None,
    }
}

/// `/ls_resp` carries the request id outside and the result as a JSON
/// string inside `payload`.
fn task_response(json: &Value, tasks: &mut TaskTable) {
    let Some(request_id) = json.get("request_id").and_then(Value::as_u64) else {
        debug!("task response without request id");
        return;
    };
    let Some(task) = tasks.take(request_id) else {
        debug!("no pending task for request {request_id}");
        return;
    };

    let inner = json
        .get("payload")
        .and_then(Value::as_str)
        .map(|raw| parse_payload(raw.as_bytes()))
        .unwrap_or(Value::Null);

    let result = decode_task_result(task.kind, &inner).map(|result| TaskResponse {
        request_id,
        kind: task.kind,
        result,
    });
    if let Err(ref e) = result {
        warn!("task {request_id}: {e}");
    }
    task.resolve(result);
}

/// Pull the typed result for `kind` out of the `step` tree.
pub fn decode_task_result(kind: TaskKind, payload: &Value) -> MsgrResult<TaskResult> {
    let step = |path: &str| id_of(payload.pointer(path));
    let missing = |field: &str| MsgrError::TaskFailed {
        kind: kind.to_string(),
        message: format!("response has no {field}"),
    };

    match kind {
        TaskKind::SendMessageMqtt => Ok(TaskResult::MessageSent {
            thread_id: step("/step/1/2/2/1/2").ok_or_else(|| missing("thread id"))?,
            message_id: step("/step/1/2/2/1/3").ok_or_else(|| missing("message id"))?,
            payload: payload.pointer("/step/1/2").cloned().unwrap_or(Value::Null),
        }),
        TaskKind::SetMessageReaction => Ok(TaskResult::MessageId {
            message_id: step("/step/1/2/2/1/4").ok_or_else(|| missing("message id"))?,
        }),
        TaskKind::EditMessage => Ok(TaskResult::MessageId {
            message_id: step("/step/1/2/2/1/2").ok_or_else(|| missing("message id"))?,
        }),
    }
}
