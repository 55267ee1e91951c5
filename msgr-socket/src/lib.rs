//! Msgr Socket - real-time listener over MQTT/WebSocket.
//!
//! This crate provides the connection lifecycle for the inbox stream:
//! - Cursor bootstrap through the batched GraphQL endpoint
//! - A single-task connection manager with forced cycling and fixed-delay reconnects
//! - Frame and delta decoding into typed domain events
//! - Session-loss detection with an idempotent fatal teardown
//! - A listener facade with typed subscriptions and a middleware pipeline

pub mod auth;
mod bootstrap;
pub mod decoder;
pub mod delta;
pub mod events;
pub mod listener;
pub mod manager;
pub mod middleware;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-export key types
pub use auth::{classify_auth, AuthReason};
pub use events::{
    ConnectionState, DomainEvent, EventDispatcher, EventKind, FatalError, FatalKind,
    LifecycleEvent, ListenerEvent, Subscription,
};
pub use listener::{Listener, ListenerBuilder};
pub use manager::{ManagerSnapshot, TimerSnapshot};
pub use middleware::{FnMiddleware, Middleware, Pipeline};
pub use protocol::ConnectParams;
pub use session::{TaskKind, TaskResponse, TaskResult};
pub use transport::{Connector, MqttConnector, TransportEvent, TransportHandle, TransportSink};
