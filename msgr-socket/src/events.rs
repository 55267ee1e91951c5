//! Event types and the broadcast event dispatcher.
//!
//! Every event the listener can produce is part of a closed set: lifecycle
//! events about the connection itself and domain events decoded from
//! frames. Subscribers pick the kinds they care about by `EventKind`.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Public names of every event the listener emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Connected,
    Ready,
    Disconnected,
    Reconnecting,
    Closed,
    Error,
    Fatal,
    Message,
    MessageReply,
    MessageReaction,
    MessageUnsend,
    Typing,
    Presence,
    ReadReceipt,
    Event,
    FriendRequestReceived,
    FriendRequestCancel,
}

impl EventKind {
    /// Every kind, lifecycle first.
    pub const ALL: &'static [EventKind] = &[
        EventKind::Connected,
        EventKind::Ready,
        EventKind::Disconnected,
        EventKind::Reconnecting,
        EventKind::Closed,
        EventKind::Error,
        EventKind::Fatal,
        EventKind::Message,
        EventKind::MessageReply,
        EventKind::MessageReaction,
        EventKind::MessageUnsend,
        EventKind::Typing,
        EventKind::Presence,
        EventKind::ReadReceipt,
        EventKind::Event,
        EventKind::FriendRequestReceived,
        EventKind::FriendRequestCancel,
    ];

    /// Parse a public event name.
    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == s)
    }

    /// The public event name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Ready => "ready",
            Self::Disconnected => "disconnected",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
            Self::Error => "error",
            Self::Fatal => "fatal",
            Self::Message => "message",
            Self::MessageReply => "message_reply",
            Self::MessageReaction => "message_reaction",
            Self::MessageUnsend => "message_unsend",
            Self::Typing => "typing",
            Self::Presence => "presence",
            Self::ReadReceipt => "read_receipt",
            Self::Event => "event",
            Self::FriendRequestReceived => "friend_request_received",
            Self::FriendRequestCancel => "friend_request_cancel",
        }
    }

    /// Whether this kind describes the connection rather than inbox data.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            Self::Connected
                | Self::Ready
                | Self::Disconnected
                | Self::Reconnecting
                | Self::Closed
                | Self::Error
                | Self::Fatal
        )
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user mentioned in a message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mention {
    pub id: String,
    pub offset: usize,
    pub length: usize,
    /// The mentioned text as it appears in the body.
    pub text: String,
}

/// A new message in a thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEvent {
    pub sender_id: String,
    pub body: String,
    pub thread_id: String,
    pub message_id: String,
    /// Attachment records as delivered; shaping them is left to callers.
    pub attachments: Vec<Value>,
    pub mentions: Vec<Mention>,
    pub timestamp: i64,
    pub is_group: bool,
    pub participant_ids: Vec<String>,
}

/// A message sent as a reply to an earlier one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageReplyEvent {
    pub message: MessageEvent,
    /// The quoted message, when the platform included it.
    pub replied_to: Option<MessageEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionEvent {
    pub thread_id: String,
    pub message_id: String,
    /// `None` when the reaction was removed.
    pub reaction: Option<String>,
    /// Author of the reacted-to message.
    pub sender_id: String,
    /// Who reacted.
    pub user_id: String,
    pub removed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsendEvent {
    pub thread_id: String,
    pub message_id: String,
    pub sender_id: String,
    pub deletion_timestamp: i64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingEvent {
    pub is_typing: bool,
    pub from: String,
    pub thread_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEvent {
    pub user_id: String,
    /// Last-active time in milliseconds.
    pub timestamp: i64,
    /// Opaque status payload.
    pub statuses: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceiptEvent {
    pub reader: String,
    pub time: i64,
    pub thread_id: String,
}

/// Thread administration event (rename, members joining or leaving, themes...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadLogEvent {
    pub thread_id: String,
    pub log_message_type: String,
    pub log_message_data: Value,
    pub log_message_body: String,
    pub author: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FriendRequestEvent {
    pub actor_id: String,
    pub timestamp: i64,
}

/// Inbox data decoded from frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    Message(MessageEvent),
    MessageReply(MessageReplyEvent),
    MessageReaction(ReactionEvent),
    MessageUnsend(UnsendEvent),
    Typing(TypingEvent),
    Presence(PresenceEvent),
    ReadReceipt(ReadReceiptEvent),
    #[serde(rename = "event")]
    ThreadLog(ThreadLogEvent),
    FriendRequestReceived(FriendRequestEvent),
    FriendRequestCancel(FriendRequestEvent),
}

impl DomainEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Message(_) => EventKind::Message,
            Self::MessageReply(_) => EventKind::MessageReply,
            Self::MessageReaction(_) => EventKind::MessageReaction,
            Self::MessageUnsend(_) => EventKind::MessageUnsend,
            Self::Typing(_) => EventKind::Typing,
            Self::Presence(_) => EventKind::Presence,
            Self::ReadReceipt(_) => EventKind::ReadReceipt,
            Self::ThreadLog(_) => EventKind::Event,
            Self::FriendRequestReceived(_) => EventKind::FriendRequestReceived,
            Self::FriendRequestCancel(_) => EventKind::FriendRequestCancel,
        }
    }
}

/// Why the listener gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FatalKind {
    /// The session was rejected; re-authenticate before restarting.
    AuthError,
    /// A connection failure with automatic reconnection disabled.
    ConnectionRefused,
}

/// Payload of the `fatal` lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FatalError {
    #[serde(rename = "type")]
    pub kind: FatalKind,
    pub reason: String,
    pub error: String,
    /// Milliseconds since the epoch.
    pub timestamp: i64,
}

/// Events about the connection itself. Tagged by `event` since the fatal
/// payload carries its own `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Connected,
    Ready,
    Disconnected { reason: String, will_retry: bool },
    Reconnecting { attempt: u32 },
    Closed,
    Error { detail: String },
    Fatal(FatalError),
}

impl LifecycleEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Connected => EventKind::Connected,
            Self::Ready => EventKind::Ready,
            Self::Disconnected { .. } => EventKind::Disconnected,
            Self::Reconnecting { .. } => EventKind::Reconnecting,
            Self::Closed => EventKind::Closed,
            Self::Error { .. } => EventKind::Error,
            Self::Fatal(_) => EventKind::Fatal,
        }
    }
}

/// Anything delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ListenerEvent {
    Lifecycle(LifecycleEvent),
    Domain(DomainEvent),
}

impl ListenerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Lifecycle(e) => e.kind(),
            Self::Domain(e) => e.kind(),
        }
    }
}

impl From<LifecycleEvent> for ListenerEvent {
    fn from(e: LifecycleEvent) -> Self {
        Self::Lifecycle(e)
    }
}

impl From<DomainEvent> for ListenerEvent {
    fn from(e: DomainEvent) -> Self {
        Self::Domain(e)
    }
}

/// Broadcast-based event dispatcher.
///
/// Uses a tokio broadcast channel so every subscription independently
/// receives every event without blocking the connection task.
#[derive(Clone)]
pub struct EventDispatcher {
    sender: broadcast::Sender<ListenerEvent>,
}

impl EventDispatcher {
    /// Create a new EventDispatcher with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to the given kinds. An empty slice subscribes to everything.
    pub fn subscribe(&self, kinds: &[EventKind]) -> Subscription {
        Subscription {
            rx: self.sender.subscribe(),
            kinds: if kinds.is_empty() {
                None
            } else {
                Some(kinds.iter().copied().collect())
            },
        }
    }

    /// Dispatch an event to all active subscribers.
    pub fn dispatch(&self, event: ListenerEvent) {
        let kind = event.kind();
        match self.sender.send(event) {
            Ok(count) => {
                debug!("dispatched {kind} to {count} subscriber(s)");
            }
            Err(_) => {
                // No active receivers -- this is fine during startup/shutdown
                debug!("no subscribers for event {kind}");
            }
        }
    }

    /// Get the current number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// A filtered view of the event stream. Dropping it unsubscribes.
pub struct Subscription {
    rx: broadcast::Receiver<ListenerEvent>,
    kinds: Option<HashSet<EventKind>>,
}

impl Subscription {
    /// Whether this subscription wants `kind`.
    pub fn wants(&self, kind: EventKind) -> bool {
        self.kinds.as_ref().map_or(true, |k| k.contains(&kind))
    }

    /// Wait for the next matching event. `None` once the listener is gone.
    pub async fn recv(&mut self) -> Option<ListenerEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.wants(event.kind()) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("subscription lagged, {missed} event(s) dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Return the next matching event if one is already queued.
    pub fn try_recv(&mut self) -> Option<ListenerEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if self.wants(event.kind()) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    warn!("subscription lagged, {missed} event(s) dropped");
                }
                Err(_) => return None,
            }
        }
    }
}

/// Connection manager state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected and not trying to connect.
    Idle,
    /// Fetching the initial sequence id.
    Bootstrapping,
    /// Transport opened, waiting for the MQTT handshake or sync ack.
    Connecting,
    /// Synced and receiving frames.
    Connected,
    /// Forced periodic reconnect in progress.
    Cycling,
    /// Waiting for the reconnect delay to elapse.
    Reconnecting,
    /// Intentional teardown in progress.
    Ending,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Bootstrapping => write!(f, "bootstrapping"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Cycling => write!(f, "cycling"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Ending => write!(f, "ending"),
        }
    }
}
