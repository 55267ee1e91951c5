//! Session state owned by the connection manager.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use msgr_api::Credentials;
use msgr_core::error::{MsgrError, MsgrResult};

/// Per-listener session state. Only the manager task touches it.
#[derive(Debug)]
pub struct SessionContext {
    pub credentials: Credentials,
    /// Last known inbox cursor.
    pub last_seq_id: Option<i64>,
    /// Continuation token for resuming the queue.
    pub sync_token: Option<String>,
    pub logged_in: bool,
    pub reconnect_attempts: u32,
    /// Intentional teardown in progress; timers and completions become no-ops.
    pub ending: bool,
    /// A forced cycle is in flight.
    pub cycling: bool,
}

impl SessionContext {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            last_seq_id: None,
            sync_token: None,
            logged_in: true,
            reconnect_attempts: 0,
            ending: false,
            cycling: false,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.credentials.user_id
    }
}

/// Request kinds that can be published on `/ls_req`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    SendMessageMqtt,
    SetMessageReaction,
    EditMessage,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SendMessageMqtt => "send_message_mqtt",
            Self::SetMessageReaction => "set_message_reaction",
            Self::EditMessage => "edit_message",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "send_message_mqtt" => Some(Self::SendMessageMqtt),
            "set_message_reaction" => Some(Self::SetMessageReaction),
            "edit_message" => Some(Self::EditMessage),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed result of a completed task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskResult {
    MessageSent {
        thread_id: String,
        message_id: String,
        payload: Value,
    },
    MessageId {
        message_id: String,
    },
}

/// What a `send_task` caller receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResponse {
    pub request_id: u64,
    #[serde(rename = "type")]
    pub kind: TaskKind,
    #[serde(flatten)]
    pub result: TaskResult,
}

pub type TaskReply = oneshot::Sender<MsgrResult<TaskResponse>>;

/// A published task waiting for its `/ls_resp` frame.
#[derive(Debug)]
pub struct PendingTask {
    pub kind: TaskKind,
    pub deadline: Instant,
    reply: TaskReply,
}

impl PendingTask {
    /// Hand the result to the waiter. Consumes the entry so it cannot fire twice.
    pub fn resolve(self, result: MsgrResult<TaskResponse>) {
        if self.reply.send(result).is_err() {
            debug!("task waiter went away before its {} reply", self.kind);
        }
    }
}

/// Request id to pending task.
#[derive(Debug, Default)]
pub struct TaskTable {
    tasks: HashMap<u64, PendingTask>,
}

impl TaskTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task. A request id that is already pending is rejected
    /// through the new waiter's channel.
    pub fn insert(&mut self, request_id: u64, kind: TaskKind, reply: TaskReply, deadline: Instant) {
        if self.tasks.contains_key(&request_id) {
            warn!("duplicate task request id {request_id}");
            let _ = reply.send(Err(MsgrError::TaskFailed {
                kind: kind.to_string(),
                message: format!("request id {request_id} is already pending"),
            }));
            return;
        }
        self.tasks.insert(request_id, PendingTask { kind, deadline, reply });
    }

    pub fn take(&mut self, request_id: u64) -> Option<PendingTask> {
        self.tasks.remove(&request_id)
    }

    pub fn contains(&self, request_id: u64) -> bool {
        self.tasks.contains_key(&request_id)
    }

    /// Cancel every pending task. Returns how many were dropped.
    pub fn clear(&mut self, reason: &str) -> usize {
        let count = self.tasks.len();
        for (request_id, task) in self.tasks.drain() {
            debug!("cancelling task {request_id} ({})", task.kind);
            task.resolve(Err(MsgrError::TaskCancelled(reason.to_string())));
        }
        count
    }

    /// Fail every task whose deadline has passed.
    pub fn expire(&mut self, now: Instant) -> usize {
        let expired: Vec<u64> = self
            .tasks
            .iter()
            .filter(|(_, task)| task.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for request_id in &expired {
            if let Some(task) = self.tasks.remove(request_id) {
                let kind = task.kind;
                warn!("task {request_id} ({kind}) timed out");
                task.resolve(Err(MsgrError::Timeout(format!(
                    "no response for {kind} request {request_id}"
                ))));
            }
        }
        expired.len()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.tasks.values().map(|t| t.deadline).min()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_task_kind_names() {
        for kind in [TaskKind::SendMessageMqtt, TaskKind::SetMessageReaction, TaskKind::EditMessage] {
            assert_eq!(TaskKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(TaskKind::from_str("delete_thread"), None);
    }

    #[test]
    fn test_task_response_serializes_flat() {
        let response = TaskResponse {
            request_id: 4,
            kind: TaskKind::EditMessage,
            result: TaskResult::MessageId { message_id: "mid.1".into() },
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["request_id"], 4);
        assert_eq!(json["type"], "edit_message");
        assert_eq!(json["message_id"], "mid.1");
    }

    #[tokio::test]
    async fn test_take_resolves_once() {
        let mut table = TaskTable::new();
        let (tx, rx) = oneshot::channel();
        table.insert(1, TaskKind::EditMessage, tx, Instant::now() + Duration::from_secs(5));
        assert!(table.contains(1));

        let task = table.take(1).unwrap();
        assert!(table.take(1).is_none());
        task.resolve(Ok(TaskResponse {
            request_id: 1,
            kind: TaskKind::EditMessage,
            result: TaskResult::MessageId { message_id: "m".into() },
        }));
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_request_id_rejected() {
        let mut table = TaskTable::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        let (first, _first_rx) = oneshot::channel();
        let (second, second_rx) = oneshot::channel();
        table.insert(1, TaskKind::EditMessage, first, deadline);
        table.insert(1, TaskKind::EditMessage, second, deadline);
        assert_eq!(table.len(), 1);
        assert!(matches!(second_rx.await.unwrap(), Err(MsgrError::TaskFailed { .. })));
    }

    #[tokio::test]
    async fn test_clear_cancels_all() {
        let mut table = TaskTable::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        let (a, a_rx) = oneshot::channel();
        let (b, b_rx) = oneshot::channel();
        table.insert(1, TaskKind::SendMessageMqtt, a, deadline);
        table.insert(2, TaskKind::SetMessageReaction, b, deadline);

        assert_eq!(table.clear("stopped"), 2);
        assert!(table.is_empty());
        assert!(matches!(a_rx.await.unwrap(), Err(MsgrError::TaskCancelled(_))));
        assert!(matches!(b_rx.await.unwrap(), Err(MsgrError::TaskCancelled(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_only_past_deadline() {
        let mut table = TaskTable::new();
        let now = Instant::now();
        let (a, a_rx) = oneshot::channel();
        let (b, _b_rx) = oneshot::channel();
        table.insert(1, TaskKind::EditMessage, a, now + Duration::from_secs(1));
        table.insert(2, TaskKind::EditMessage, b, now + Duration::from_secs(10));
        assert_eq!(table.next_deadline(), Some(now + Duration::from_secs(1)));

        assert_eq!(table.expire(now + Duration::from_secs(2)), 1);
        match a_rx.await.unwrap() {
            Err(MsgrError::Timeout(message)) => {
                assert!(message.contains(TaskKind::EditMessage.as_str()));
                assert!(message.contains("request 1"));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(table.contains(2));
        assert_eq!(table.next_deadline(), Some(now + Duration::from_secs(10)));
    }
}
