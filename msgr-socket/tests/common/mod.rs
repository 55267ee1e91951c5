//! Shared test utilities for integration tests.
//!
//! Provides a scripted connector whose transports record every call, a
//! GraphQL poster with queued responses, and a harness wiring both into a
//! started listener.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use msgr_api::{Credentials, GraphqlTransport};
use msgr_core::config::ListenConfig;
use msgr_core::constants;
use msgr_core::error::MsgrResult;
use msgr_core::logging;
use msgr_socket::{
    ConnectParams, Connector, LifecycleEvent, Listener, ListenerBuilder, ListenerEvent,
    Middleware, Subscription, TransportEvent, TransportHandle, TransportSink,
};

/// Credentials with a session cookie for user 100.
pub fn create_test_credentials() -> Credentials {
    Credentials::from_cookie_header("c_user=100; xs=secret", constants::DEFAULT_BASE_URL)
        .expect("test credentials")
}

/// Listener config with a short reconnect delay.
pub fn create_test_config() -> ListenConfig {
    ListenConfig {
        reconnect_delay_ms: 1_000,
        ..ListenConfig::default()
    }
}

/// A successful batch response carrying `seq`.
pub fn seq_body(seq: i64) -> String {
    format!(
        "for (;;);{{\"o0\":{{\"data\":{{\"viewer\":{{\"message_threads\":{{\"sync_sequence_id\":\"{seq}\"}}}}}}}}}}\r\n{{\"successful_results\":1,\"error_results\":0}}"
    )
}

/// GraphQL poster returning queued responses, then `seq_body(100)`.
#[derive(Default)]
pub struct MockPoster {
    responses: Mutex<VecDeque<MsgrResult<String>>>,
    calls: AtomicUsize,
}

impl MockPoster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, response: MsgrResult<String>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GraphqlTransport for MockPoster {
    async fn post_form(&self, path: &str, form: &[(String, String)]) -> MsgrResult<String> {
        assert_eq!(path, constants::GRAPHQL_BATCH_PATH);
        assert!(form.iter().any(|(k, _)| k == "queries"));
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(seq_body(100)))
    }
}

/// Transport that records every call.
#[derive(Default)]
pub struct MockTransport {
    pub subscribed: Mutex<Vec<String>>,
    pub published: Mutex<Vec<(String, Vec<u8>)>>,
    pub unsubscribe_calls: AtomicUsize,
    pub ended: Mutex<Vec<bool>>,
    hang_unsubscribe: bool,
}

impl MockTransport {
    pub fn published_topics(&self) -> Vec<String> {
        self.published.lock().unwrap().iter().map(|(t, _)| t.clone()).collect()
    }

    pub fn published_on(&self, topic: &str) -> Vec<serde_json::Value> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, body)| serde_json::from_slice(body).expect("published json"))
            .collect()
    }

    pub fn is_ended(&self) -> bool {
        !self.ended.lock().unwrap().is_empty()
    }
}

#[async_trait]
impl TransportHandle for MockTransport {
    async fn subscribe(&self, topic: &str) -> MsgrResult<()> {
        self.subscribed.lock().unwrap().push(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, _topics: &[&str]) -> MsgrResult<()> {
        self.unsubscribe_calls.fetch_add(1, Ordering::SeqCst);
        if self.hang_unsubscribe {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> MsgrResult<()> {
        self.published.lock().unwrap().push((topic.to_string(), payload));
        Ok(())
    }

    async fn end(&self, force: bool) {
        self.ended.lock().unwrap().push(force);
    }
}

/// One `Connector::open` call.
pub struct Opened {
    pub params: ConnectParams,
    pub sink: TransportSink,
    pub transport: Arc<MockTransport>,
}

/// Connector handing out `MockTransport`s. With `auto_connect` each new
/// transport reports `Connected` right away.
pub struct MockConnector {
    opened: Mutex<Vec<Opened>>,
    auto_connect: bool,
    hang_unsubscribe: AtomicBool,
}

impl MockConnector {
    pub fn new(auto_connect: bool) -> Self {
        Self {
            opened: Mutex::new(Vec::new()),
            auto_connect,
            hang_unsubscribe: AtomicBool::new(false),
        }
    }

    /// Transports opened from now on never finish unsubscribing.
    pub fn hang_unsubscribe(&self) {
        self.hang_unsubscribe.store(true, Ordering::SeqCst);
    }

    pub fn open_count(&self) -> usize {
        self.opened.lock().unwrap().len()
    }

    pub fn transport(&self, index: usize) -> Arc<MockTransport> {
        self.opened.lock().unwrap()[index].transport.clone()
    }

    pub fn params(&self, index: usize) -> ConnectParams {
        self.opened.lock().unwrap()[index].params.clone()
    }

    /// Push an event through the sink of connection `index`.
    pub fn emit(&self, index: usize, event: TransportEvent) {
        let sink = self.opened.lock().unwrap()[index].sink.clone();
        sink.emit(event);
    }

    pub fn frame(&self, index: usize, topic: &str, payload: &str) {
        self.emit(
            index,
            TransportEvent::Frame {
                topic: topic.to_string(),
                payload: payload.as_bytes().to_vec(),
            },
        );
    }
}

impl Connector for MockConnector {
    fn open(&self, params: ConnectParams, sink: TransportSink) -> MsgrResult<Arc<dyn TransportHandle>> {
        let transport = Arc::new(MockTransport {
            hang_unsubscribe: self.hang_unsubscribe.load(Ordering::SeqCst),
            ..MockTransport::default()
        });
        if self.auto_connect {
            sink.emit(TransportEvent::Connected);
        }
        self.opened.lock().unwrap().push(Opened {
            params,
            sink,
            transport: transport.clone(),
        });
        Ok(transport)
    }
}

/// A started listener wired to mocks, with an all-events subscription.
pub struct Harness {
    pub listener: Listener,
    pub events: Subscription,
    pub connector: Arc<MockConnector>,
    pub poster: Arc<MockPoster>,
}

/// Start a listener; `poster` responses can be queued before the call.
pub fn start_with(config: ListenConfig, poster: Arc<MockPoster>) -> Harness {
    let connector = Arc::new(MockConnector::new(true));
    start_with_connector(config, poster, connector)
}

pub fn start_with_connector(
    config: ListenConfig,
    poster: Arc<MockPoster>,
    connector: Arc<MockConnector>,
) -> Harness {
    start_custom(config, poster, connector, Vec::new())
}

pub fn start_with_middleware(config: ListenConfig, middleware: Vec<Arc<dyn Middleware>>) -> Harness {
    start_custom(
        config,
        Arc::new(MockPoster::new()),
        Arc::new(MockConnector::new(true)),
        middleware,
    )
}

pub fn start_custom(
    config: ListenConfig,
    poster: Arc<MockPoster>,
    connector: Arc<MockConnector>,
    middleware: Vec<Arc<dyn Middleware>>,
) -> Harness {
    logging::init_console_logging("msgr_socket=debug,warn");
    let mut builder = ListenerBuilder::new(create_test_credentials(), poster.clone())
        .with_config(config)
        .with_connector(connector.clone())
        .subscribe(&[]);
    for stage in middleware {
        builder = builder.with_middleware(stage);
    }
    let mut listener = builder.start().expect("listener start");
    let events = listener.take_subscription().expect("initial subscription");
    Harness {
        listener,
        events,
        connector,
        poster,
    }
}

pub fn start(config: ListenConfig) -> Harness {
    start_with(config, Arc::new(MockPoster::new()))
}

/// Poll `condition` in 1ms steps of (paused) time, up to three seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..3_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}

/// Wait until connection `index` has subscribed and published its
/// queue-sync and control messages.
pub async fn wait_for_announce(h: &Harness, index: usize) {
    let connector = h.connector.clone();
    wait_until(|| {
        connector.open_count() > index && connector.transport(index).published.lock().unwrap().len() >= 3
    })
    .await;
}

/// Complete connection `index` with a sync frame and consume `connected`.
pub async fn sync(h: &mut Harness, index: usize) {
    wait_for_announce(h, index).await;
    h.connector
        .frame(index, "/t_ms", r#"{"firstDeltaSeqId":"100","syncToken":"tok-1"}"#);
    assert_eq!(next_lifecycle(&mut h.events).await, LifecycleEvent::Connected);
}

pub async fn next_event(events: &mut Subscription) -> ListenerEvent {
    tokio::time::timeout(Duration::from_secs(120), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("listener gone")
}

/// Next lifecycle event, skipping domain events.
pub async fn next_lifecycle(events: &mut Subscription) -> LifecycleEvent {
    loop {
        if let ListenerEvent::Lifecycle(event) = next_event(events).await {
            return event;
        }
    }
}

/// Let queued work run without advancing far enough to fire timers.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
