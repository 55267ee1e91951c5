//! Public listener facade.
//!
//! `ListenerBuilder::start` spawns the connection manager and returns a
//! `Listener`, which is the only handle to it. Dropping the listener
//! tears the connection down without emitting further events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use msgr_api::{Credentials, GraphqlTransport};
use msgr_core::config::{ListenConfig, TransportConfig};
use msgr_core::error::{MsgrError, MsgrResult};

use crate::events::{ConnectionState, EventDispatcher, EventKind, Subscription};
use crate::manager::{Command, ConnectionManager, ManagerSnapshot};
use crate::middleware::{Middleware, Pipeline};
use crate::session::{SessionContext, TaskKind, TaskResponse};
use crate::transport::{Connector, MqttConnector};

const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Configures and starts a `Listener`.
pub struct ListenerBuilder {
    credentials: Credentials,
    poster: Arc<dyn GraphqlTransport>,
    config: ListenConfig,
    transport_config: TransportConfig,
    connector: Option<Arc<dyn Connector>>,
    pipeline: Pipeline,
    initial_kinds: Option<Vec<EventKind>>,
    event_capacity: usize,
}

impl ListenerBuilder {
    pub fn new(credentials: Credentials, poster: Arc<dyn GraphqlTransport>) -> Self {
        Self {
            credentials,
            poster,
            config: ListenConfig::default(),
            transport_config: TransportConfig::default(),
            connector: None,
            pipeline: Pipeline::new(),
            initial_kinds: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    pub fn with_config(mut self, config: ListenConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_transport_config(mut self, config: TransportConfig) -> Self {
        self.transport_config = config;
        self
    }

    /// Replace the rumqttc connector.
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Append a middleware stage. Stages run in the order they were added.
    pub fn with_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.pipeline.push(middleware);
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Subscribe before the connection starts so no early event is missed.
    /// Retrieve it with `Listener::take_subscription`.
    pub fn subscribe(mut self, kinds: &[EventKind]) -> Self {
        self.initial_kinds = Some(kinds.to_vec());
        self
    }

    /// Spawn the connection manager and begin bootstrapping.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(self) -> MsgrResult<Listener> {
        if self.credentials.user_id.trim().is_empty() {
            return Err(MsgrError::MissingConfig("user id".into()));
        }
        if self.credentials.cookie_header().is_none() {
            return Err(MsgrError::MissingConfig("session cookies".into()));
        }

        let dispatcher = EventDispatcher::new(self.event_capacity);
        let initial = self.initial_kinds.as_deref().map(|kinds| dispatcher.subscribe(kinds));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(MqttConnector::new()));

        info!(
            "starting listener for user {} ({} middleware stage(s))",
            self.credentials.user_id,
            self.pipeline.len()
        );
        let (manager, inbox) = ConnectionManager::new(
            SessionContext::new(self.credentials),
            self.config,
            self.transport_config,
            connector,
            self.poster,
            self.pipeline,
            dispatcher.clone(),
            state_tx,
        );

        let (commands, command_rx) = mpsc::unbounded_channel();
        tokio::spawn(manager.run(inbox, command_rx));
        commands
            .send(Command::Start)
            .map_err(|_| MsgrError::ListenerStopped)?;

        Ok(Listener {
            control: Control {
                commands,
                stopped: Arc::new(AtomicBool::new(false)),
            },
            dispatcher,
            state_rx,
            initial,
        })
    }
}

/// Cloneable command side of a listener.
#[derive(Clone)]
struct Control {
    commands: mpsc::UnboundedSender<Command>,
    stopped: Arc<AtomicBool>,
}

impl Control {
    async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            warn!("stop requested on a listener that is already stopped");
            return;
        }
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Stop { reply }).is_err() {
            debug!("connection manager already gone");
            return;
        }
        let _ = done.await;
    }

    fn send(&self, command: Command) -> MsgrResult<()> {
        self.commands.send(command).map_err(|_| MsgrError::ListenerStopped)
    }
}

/// Handle to one running listener.
pub struct Listener {
    control: Control,
    dispatcher: EventDispatcher,
    state_rx: watch::Receiver<ConnectionState>,
    initial: Option<Subscription>,
}

impl Listener {
    /// Subscribe to `kinds`.
    pub fn subscribe(&self, kinds: &[EventKind]) -> Subscription {
        self.dispatcher.subscribe(kinds)
    }

    pub fn subscribe_all(&self) -> Subscription {
        self.dispatcher.subscribe(&[])
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        drop(subscription);
    }

    /// The subscription requested through `ListenerBuilder::subscribe`.
    pub fn take_subscription(&mut self) -> Option<Subscription> {
        self.initial.take()
    }

    /// Stop listening and wait for teardown. Later calls only warn.
    pub async fn stop(&self) {
        self.control.stop().await;
    }

    /// Callback form of `stop`; the callback runs once teardown finishes,
    /// including on repeated calls.
    pub fn stop_listening<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let control = self.control.clone();
        tokio::spawn(async move {
            control.stop().await;
            callback();
        });
    }

    pub fn is_stopped(&self) -> bool {
        self.control.stopped.load(Ordering::SeqCst)
    }

    /// Begin a new bootstrap after `stop` or a fatal error.
    pub fn restart(&self) -> MsgrResult<()> {
        self.control.stopped.store(false, Ordering::SeqCst);
        self.control.send(Command::Start)
    }

    /// Force a reconnect now.
    pub fn cycle(&self) -> MsgrResult<()> {
        self.control.send(Command::Cycle)
    }

    /// Publish a task on `/ls_req` and wait for its response.
    pub async fn send_task(
        &self,
        kind: TaskKind,
        request_id: u64,
        payload: Value,
    ) -> MsgrResult<TaskResponse> {
        let (reply, response) = oneshot::channel();
        self.control.send(Command::SendTask {
            kind,
            request_id,
            payload,
            reply,
        })?;
        response.await.map_err(|_| MsgrError::ListenerStopped)?
    }

    pub async fn snapshot(&self) -> MsgrResult<ManagerSnapshot> {
        let (reply, snapshot) = oneshot::channel();
        self.control.send(Command::Snapshot { reply })?;
        snapshot.await.map_err(|_| MsgrError::ListenerStopped)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Watch state transitions.
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }
}
