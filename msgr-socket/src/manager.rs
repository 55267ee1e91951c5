//! Connection manager.
//!
//! A single tokio task owns the session, the live transport and every
//! timer. Callers reach it through `Command`s; the spawned bootstrap
//! request reports back through an internal channel and the transport
//! through a `TransportSink`. Both are tagged with a connection generation
//! that is bumped on every bootstrap and teardown, so completions from a
//! superseded connection are dropped.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};

use msgr_api::GraphqlTransport;
use msgr_core::config::{ListenConfig, TransportConfig};
use msgr_core::constants::{self, topics};
use msgr_core::error::{MsgrError, MsgrResult};

use crate::auth::{classify_auth, is_benign_shutdown};
use crate::decoder::decode_frame;
use crate::events::{
    ConnectionState, EventDispatcher, FatalError, FatalKind, LifecycleEvent, ListenerEvent,
};
use crate::middleware::Pipeline;
use crate::protocol;
use crate::session::{SessionContext, TaskKind, TaskReply, TaskTable};
use crate::transport::{Connector, TransportEvent, TransportHandle, TransportSink};

/// Requests from the listener facade.
#[derive(Debug)]
pub(crate) enum Command {
    /// Begin a bootstrap if idle.
    Start,
    Stop { reply: oneshot::Sender<()> },
    Cycle,
    SendTask {
        kind: TaskKind,
        request_id: u64,
        payload: Value,
        reply: TaskReply,
    },
    Snapshot { reply: oneshot::Sender<ManagerSnapshot> },
}

/// Completions of work the manager spawned.
#[derive(Debug)]
pub(crate) enum Op {
    SeqFetched { generation: u64, result: MsgrResult<i64> },
}

/// Every deadline the manager may be waiting on.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Timers {
    pub reconnect: Option<Instant>,
    pub connect: Option<Instant>,
    pub sync_ack: Option<Instant>,
    pub cycle: Option<Instant>,
}

impl Timers {
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    fn snapshot(&self) -> TimerSnapshot {
        TimerSnapshot {
            reconnect: self.reconnect.is_some(),
            connect: self.connect.is_some(),
            sync_ack: self.sync_ack.is_some(),
            cycle: self.cycle.is_some(),
        }
    }
}

/// Which timers are armed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimerSnapshot {
    pub reconnect: bool,
    pub connect: bool,
    pub sync_ack: bool,
    pub cycle: bool,
}

impl TimerSnapshot {
    pub fn any(&self) -> bool {
        self.reconnect || self.connect || self.sync_ack || self.cycle
    }
}

/// Point-in-time view of the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerSnapshot {
    pub state: ConnectionState,
    pub last_seq_id: Option<i64>,
    pub sync_token: Option<String>,
    pub reconnect_attempts: u32,
    pub pending_tasks: usize,
    pub timers: TimerSnapshot,
    pub ending: bool,
    pub cycling: bool,
    pub logged_in: bool,
}

pub(crate) struct ConnectionManager {
    pub(crate) session: SessionContext,
    pub(crate) tasks: TaskTable,
    pub(crate) timers: Timers,
    pub(crate) config: ListenConfig,
    pub(crate) transport_config: TransportConfig,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) poster: Arc<dyn GraphqlTransport>,
    pub(crate) pipeline: Pipeline,
    pub(crate) dispatcher: EventDispatcher,
    pub(crate) transport: Option<Arc<dyn TransportHandle>>,
    pub(crate) generation: u64,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    transport_tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
    pub(crate) ops_tx: mpsc::UnboundedSender<Op>,
}

/// Channels the run loop drains; kept out of the manager so handlers can
/// borrow it mutably.
pub(crate) struct Inbox {
    transport_rx: mpsc::UnboundedReceiver<(u64, TransportEvent)>,
    ops_rx: mpsc::UnboundedReceiver<Op>,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl ConnectionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: SessionContext,
        config: ListenConfig,
        transport_config: TransportConfig,
        connector: Arc<dyn Connector>,
        poster: Arc<dyn GraphqlTransport>,
        pipeline: Pipeline,
        dispatcher: EventDispatcher,
        state_tx: watch::Sender<ConnectionState>,
    ) -> (Self, Inbox) {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let manager = Self {
            session,
            tasks: TaskTable::new(),
            timers: Timers::default(),
            config,
            transport_config,
            connector,
            poster,
            pipeline,
            dispatcher,
            transport: None,
            generation: 0,
            state: ConnectionState::Idle,
            state_tx,
            transport_tx,
            ops_tx,
        };
        (manager, Inbox { transport_rx, ops_rx })
    }

    /// Drive the manager until the command channel closes.
    pub async fn run(mut self, mut inbox: Inbox, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let timers = self.timers;
            let task_deadline = self.tasks.next_deadline();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some((generation, event)) = inbox.transport_rx.recv() => {
                    self.handle_transport(generation, event).await;
                }
                Some(op) = inbox.ops_rx.recv() => self.handle_op(op).await,
                _ = sleep_until_opt(timers.reconnect) => {
                    self.timers.reconnect = None;
                    self.on_reconnect_timer();
                }
                _ = sleep_until_opt(timers.connect) => {
                    self.timers.connect = None;
                    self.on_failure("connect timed out".to_string()).await;
                }
                _ = sleep_until_opt(timers.sync_ack) => {
                    self.timers.sync_ack = None;
                    self.on_failure("sync ack timed out".to_string()).await;
                }
                _ = sleep_until_opt(timers.cycle) => {
                    self.timers.cycle = None;
                    self.cycle().await;
                }
                _ = sleep_until_opt(task_deadline) => {
                    self.tasks.expire(Instant::now());
                }
            }
        }
        debug!("connection manager exited");
    }

    /// Update the state and notify watchers.
    pub(crate) fn set_state(&mut self, new_state: ConnectionState) {
        if self.state != new_state {
            info!("listener state: {} -> {}", self.state, new_state);
            self.state = new_state;
            let _ = self.state_tx.send(new_state);
        }
    }

    pub(crate) fn emit(&self, event: LifecycleEvent) {
        self.dispatcher.dispatch(ListenerEvent::Lifecycle(event));
    }

    pub(crate) fn emit_fatal(&self, kind: FatalKind, reason: &str, error: &str) {
        self.emit(LifecycleEvent::Fatal(FatalError {
            kind,
            reason: reason.to_string(),
            error: error.to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }));
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start => self.start(),
            Command::Stop { reply } => {
                self.stop().await;
                let _ = reply.send(());
            }
            Command::Cycle => self.cycle().await,
            Command::SendTask { kind, request_id, payload, reply } => {
                self.send_task(kind, request_id, payload, reply).await;
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    async fn handle_op(&mut self, op: Op) {
        match op {
            Op::SeqFetched { generation, result } => self.on_seq_fetched(generation, result).await,
        }
    }

    async fn handle_transport(&mut self, generation: u64, event: TransportEvent) {
        if generation != self.generation {
            debug!("dropping stale transport event from generation {generation}: {event:?}");
            return;
        }
        match event {
            TransportEvent::Connected => self.on_transport_connected().await,
            TransportEvent::Frame { topic, payload } => self.on_frame(&topic, &payload),
            TransportEvent::Error(text) => self.on_failure(text).await,
            TransportEvent::Closed(reason) => {
                self.on_failure(reason.unwrap_or_else(|| "Connection closed".to_string()))
                    .await;
            }
        }
    }

    fn start(&mut self) {
        if self.state != ConnectionState::Idle {
            debug!("start ignored in state {}", self.state);
            return;
        }
        self.session.logged_in = true;
        self.session.ending = false;
        self.session.cycling = false;
        self.session.reconnect_attempts = 0;
        self.begin_bootstrap();
    }

    /// Open a transport for the current generation.
    pub(crate) async fn open_transport(&mut self) {
        let params = match protocol::connect_params(
            &self.session.credentials,
            &self.transport_config,
            self.config.online,
        ) {
            Ok(params) => params,
            Err(e) => {
                self.on_failure(e.to_string()).await;
                return;
            }
        };

        self.set_state(ConnectionState::Connecting);
        let sink = TransportSink::new(self.generation, self.transport_tx.clone());
        match self.connector.open(params, sink) {
            Ok(handle) => {
                self.transport = Some(handle);
                self.timers.connect =
                    Some(Instant::now() + Duration::from_millis(constants::CONNECT_TIMEOUT_MS));
            }
            Err(e) => self.on_failure(e.to_string()).await,
        }
    }

    async fn on_transport_connected(&mut self) {
        self.timers.connect = None;
        let Some(transport) = self.transport.clone() else {
            return;
        };
        debug!("transport connected, subscribing to {} topics", topics::SUBSCRIBED.len());

        if let Err(e) = self.announce(transport.as_ref()).await {
            self.on_failure(e.to_string()).await;
            return;
        }
        self.timers.sync_ack =
            Some(Instant::now() + Duration::from_millis(constants::SYNC_ACK_TIMEOUT_MS));
    }

    /// Subscribe and publish the queue sync and presence control messages.
    async fn announce(&self, transport: &dyn TransportHandle) -> MsgrResult<()> {
        for topic in topics::SUBSCRIBED {
            transport.subscribe(topic).await?;
        }
        let (queue_topic, queue_body) = protocol::queue_request(
            self.session.user_id(),
            self.session.last_seq_id,
            self.session.sync_token.as_deref(),
        )?;
        debug!("publishing queue sync on {queue_topic}");
        transport.publish(queue_topic, queue_body).await?;
        transport
            .publish(topics::FOREGROUND_STATE, protocol::foreground_state(self.config.online))
            .await?;
        transport
            .publish(topics::CLIENT_SETTINGS, protocol::client_settings())
            .await?;
        Ok(())
    }

    fn on_frame(&mut self, topic: &str, payload: &[u8]) {
        if topic == topics::SYNC && self.timers.sync_ack.is_some() {
            self.on_synced();
        }
        let events = decode_frame(topic, payload, &mut self.session, &mut self.tasks, &self.config);
        for event in events {
            if let Some(event) = self.pipeline.apply(event) {
                self.dispatcher.dispatch(ListenerEvent::Domain(event));
            }
        }
    }

    /// The first sync frame acknowledges the queue.
    fn on_synced(&mut self) {
        self.timers.sync_ack = None;
        self.session.reconnect_attempts = 0;
        self.session.cycling = false;
        self.set_state(ConnectionState::Connected);
        self.emit(LifecycleEvent::Connected);
        if self.config.emit_ready {
            self.emit(LifecycleEvent::Ready);
        }
        if let Some(interval) = self.config.cycle_interval() {
            self.timers.cycle = Some(Instant::now() + interval);
        }
    }

    /// Connection failure: transport error or close, handshake or sync stall.
    pub(crate) async fn on_failure(&mut self, detail: String) {
        if self.session.ending {
            if self.session.cycling && is_benign_shutdown(&detail) {
                debug!("ignoring benign failure during cycle teardown: {detail}");
            } else {
                debug!("ignoring failure while ending: {detail}");
            }
            return;
        }
        if let Some(reason) = classify_auth(&detail, None) {
            self.close_transport(true).await;
            self.emit_auth(reason, &detail).await;
            return;
        }

        warn!("connection failure: {detail}");
        self.emit(LifecycleEvent::Error { detail: detail.clone() });
        self.close_transport(true).await;

        if self.config.auto_reconnect || self.session.cycling {
            self.emit(LifecycleEvent::Disconnected {
                reason: detail,
                will_retry: true,
            });
            self.schedule_reconnect();
        } else {
            self.give_up(&detail);
        }
    }

    /// Terminal non-auth failure with reconnection disabled.
    pub(crate) fn give_up(&mut self, detail: &str) {
        error!("giving up: {detail}");
        self.timers.clear();
        self.tasks.clear("connection refused");
        self.set_state(ConnectionState::Idle);
        self.emit(LifecycleEvent::Disconnected {
            reason: detail.to_string(),
            will_retry: false,
        });
        self.emit_fatal(FatalKind::ConnectionRefused, "connection_refused", detail);
    }

    /// Arm the reconnect timer unless one is already pending.
    pub(crate) fn schedule_reconnect(&mut self) {
        if self.timers.reconnect.is_some() {
            debug!("reconnect already scheduled");
            return;
        }
        if self.session.ending {
            return;
        }
        self.generation += 1;
        self.session.reconnect_attempts += 1;
        self.timers.connect = None;
        self.timers.sync_ack = None;
        self.set_state(ConnectionState::Reconnecting);

        let attempt = self.session.reconnect_attempts;
        let delay = self.config.reconnect_delay();
        info!("reconnect attempt {attempt} in {}ms", delay.as_millis());
        self.emit(LifecycleEvent::Reconnecting { attempt });
        self.timers.reconnect = Some(Instant::now() + delay);
    }

    fn on_reconnect_timer(&mut self) {
        if self.session.ending {
            return;
        }
        self.begin_bootstrap();
    }

    /// Drop the transport without unsubscribing.
    pub(crate) async fn close_transport(&mut self, force: bool) {
        self.timers.connect = None;
        self.timers.sync_ack = None;
        if let Some(transport) = self.transport.take() {
            self.generation += 1;
            transport.end(force).await;
        }
    }

    /// Unsubscribe (bounded) and end the transport gracefully.
    async fn teardown_transport(&mut self) {
        self.timers.connect = None;
        self.timers.sync_ack = None;
        let Some(transport) = self.transport.take() else {
            return;
        };
        self.generation += 1;

        let bound = Duration::from_millis(constants::UNSUBSCRIBE_TIMEOUT_MS);
        match timeout(bound, transport.unsubscribe(topics::SUBSCRIBED)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("unsubscribe failed: {e}"),
            Err(_) => warn!("unsubscribe timed out after {}ms, closing anyway", bound.as_millis()),
        }
        transport.end(false).await;
    }

    /// Forced periodic reconnect.
    pub(crate) async fn cycle(&mut self) {
        if self.session.cycling {
            debug!("cycle already in progress");
            return;
        }
        if self.session.ending || self.state == ConnectionState::Idle {
            debug!("cycle ignored in state {}", self.state);
            return;
        }

        info!("cycling connection");
        self.session.cycling = true;
        self.session.ending = true;
        self.set_state(ConnectionState::Cycling);
        self.timers.cycle = None;
        self.timers.reconnect = None;

        self.teardown_transport().await;

        self.session.ending = false;
        self.session.reconnect_attempts += 1;
        self.emit(LifecycleEvent::Reconnecting {
            attempt: self.session.reconnect_attempts,
        });
        self.begin_bootstrap();
    }

    /// Intentional stop.
    async fn stop(&mut self) {
        self.session.ending = true;
        self.set_state(ConnectionState::Ending);
        self.timers.cycle = None;

        self.teardown_transport().await;
        // also invalidates an in-flight bootstrap request
        self.generation += 1;

        self.timers.clear();
        let cancelled = self.tasks.clear("listener stopped");
        if cancelled > 0 {
            debug!("cancelled {cancelled} pending task(s)");
        }
        self.set_state(ConnectionState::Idle);
        self.emit(LifecycleEvent::Closed);
        info!("listener stopped");

        if self.config.reconnect_after_stop && self.session.logged_in {
            info!("restarting after stop");
            self.session.ending = false;
            self.session.cycling = false;
            self.begin_bootstrap();
        }
    }

    /// Silent teardown when the facade is dropped.
    async fn shutdown(&mut self) {
        self.session.ending = true;
        self.teardown_transport().await;
        self.timers.clear();
        self.tasks.clear("listener dropped");
        self.set_state(ConnectionState::Idle);
    }

    async fn send_task(&mut self, kind: TaskKind, request_id: u64, payload: Value, reply: TaskReply) {
        let transport = match (&self.transport, self.state) {
            (Some(transport), ConnectionState::Connected) => transport.clone(),
            _ => {
                let _ = reply.send(Err(MsgrError::TransportClosed));
                return;
            }
        };

        let deadline = Instant::now() + self.config.task_timeout();
        self.tasks.insert(request_id, kind, reply, deadline);
        let body = protocol::task_envelope(request_id, &payload);
        debug!("publishing {kind} task {request_id}");
        if let Err(e) = transport.publish(topics::TASK_REQUEST, body).await {
            if let Some(task) = self.tasks.take(request_id) {
                task.resolve(Err(e));
            }
        }
    }

    fn snapshot(&self) -> ManagerSnapshot {
        ManagerSnapshot {
            state: self.state,
            last_seq_id: self.session.last_seq_id,
            sync_token: self.session.sync_token.clone(),
            reconnect_attempts: self.session.reconnect_attempts,
            pending_tasks: self.tasks.len(),
            timers: self.timers.snapshot(),
            ending: self.session.ending,
            cycling: self.session.cycling,
            logged_in: self.session.logged_in,
        }
    }
}
