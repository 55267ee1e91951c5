//! Transport seam and the rumqttc-backed MQTT-over-WebSocket connector.
//!
//! The connection manager never talks to rumqttc directly. It opens a
//! connection through a `Connector`, drives it through a `TransportHandle`
//! and receives inbound traffic on a `TransportSink`. Each sink is tagged
//! with the manager's connection generation so traffic from a connection
//! that has since been replaced can be told apart.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, Proxy, ProxyAuth, ProxyType,
    QoS, Transport,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use msgr_core::constants;
use msgr_core::error::{MsgrError, MsgrResult};

use crate::protocol::ConnectParams;

/// Inbound traffic from one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The gateway acknowledged the MQTT connect.
    Connected,
    Frame { topic: String, payload: Vec<u8> },
    Error(String),
    Closed(Option<String>),
}

/// Where a connection delivers its events.
#[derive(Debug, Clone)]
pub struct TransportSink {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
}

impl TransportSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, TransportEvent)>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Deliver an event. Returns false once the manager is gone.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx.send((self.generation, event)).is_ok()
    }
}

/// A live connection.
#[async_trait]
pub trait TransportHandle: Send + Sync {
    async fn subscribe(&self, topic: &str) -> MsgrResult<()>;
    async fn unsubscribe(&self, topics: &[&str]) -> MsgrResult<()>;
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> MsgrResult<()>;
    /// Close the connection. `force` skips the graceful MQTT disconnect.
    async fn end(&self, force: bool);
}

/// Opens connections. Opening must not block on the network; the
/// handshake result arrives later as `TransportEvent::Connected` or
/// `TransportEvent::Error`.
pub trait Connector: Send + Sync {
    fn open(&self, params: ConnectParams, sink: TransportSink) -> MsgrResult<Arc<dyn TransportHandle>>;
}

/// Production connector on top of rumqttc.
#[derive(Debug, Default, Clone)]
pub struct MqttConnector;

impl MqttConnector {
    pub fn new() -> Self {
        Self
    }

    fn options(params: &ConnectParams) -> MqttOptions {
        let mut options = MqttOptions::new(constants::MQTT_CLIENT_ID, params.endpoint.clone(), 443);
        options.set_transport(Transport::wss_with_default_config());
        options.set_keep_alive(Duration::from_secs(params.keep_alive_secs));
        options.set_clean_session(true);
        options.set_max_packet_size(constants::MAX_PACKET_SIZE, constants::MAX_PACKET_SIZE);
        options.set_credentials(params.username.clone(), "");

        let headers = params.headers.clone();
        options.set_request_modifier(move |mut request: http::Request<()>| {
            let headers = headers.clone();
            async move {
                for (name, value) in headers {
                    match (
                        http::header::HeaderName::from_bytes(name.as_bytes()),
                        http::header::HeaderValue::from_str(&value),
                    ) {
                        (Ok(name), Ok(value)) => {
                            request.headers_mut().insert(name, value);
                        }
                        _ => warn!("skipping invalid upgrade header {name}"),
                    }
                }
                request
            }
        });

        if let Some(ref proxy) = params.proxy {
            let auth = match (&proxy.username, &proxy.password) {
                (Some(user), pass) => ProxyAuth::Basic {
                    username: user.clone(),
                    password: pass.clone().unwrap_or_default(),
                },
                (None, _) => ProxyAuth::None,
            };
            options.set_proxy(Proxy {
                ty: ProxyType::Http,
                auth,
                addr: proxy.host.clone(),
                port: proxy.port,
            });
        }
        options
    }
}

impl Connector for MqttConnector {
    fn open(&self, params: ConnectParams, sink: TransportSink) -> MsgrResult<Arc<dyn TransportHandle>> {
        info!("opening mqtt connection (sid {})", params.session_id);
        let (client, eventloop) = AsyncClient::new(Self::options(&params), 64);
        let task = tokio::spawn(drive(eventloop, sink));
        Ok(Arc::new(MqttTransport {
            client,
            task: Mutex::new(Some(task)),
        }))
    }
}

/// Pump the rumqttc event loop until the first error. rumqttc reconnects
/// on the next poll after an error, so stopping here leaves every retry
/// decision to the connection manager.
async fn drive(mut eventloop: EventLoop, sink: TransportSink) {
    loop {
        let delivered = match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                debug!("connack: {:?}", ack.code);
                sink.emit(TransportEvent::Connected)
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => sink.emit(TransportEvent::Frame {
                topic: publish.topic,
                payload: publish.payload.to_vec(),
            }),
            Ok(Event::Incoming(Packet::Disconnect)) => {
                sink.emit(TransportEvent::Closed(Some("server sent disconnect".into())));
                break;
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                sink.emit(TransportEvent::Closed(None));
                break;
            }
            Ok(_) => true,
            Err(e) => {
                sink.emit(TransportEvent::Error(e.to_string()));
                break;
            }
        };
        if !delivered {
            debug!("transport sink closed, stopping event loop");
            break;
        }
    }
}

struct MqttTransport {
    client: AsyncClient,
    task: Mutex<Option<JoinHandle<()>>>,
}

fn client_error(e: rumqttc::ClientError) -> MsgrError {
    MsgrError::Transport(e.to_string())
}

#[async_trait]
impl TransportHandle for MqttTransport {
    async fn subscribe(&self, topic: &str) -> MsgrResult<()> {
        self.client
            .subscribe(topic, QoS::AtMostOnce)
            .await
            .map_err(client_error)
    }

    async fn unsubscribe(&self, topics: &[&str]) -> MsgrResult<()> {
        for topic in topics {
            self.client.unsubscribe(*topic).await.map_err(client_error)?;
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> MsgrResult<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(client_error)
    }

    async fn end(&self, force: bool) {
        let task = match self.task.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(mut task) = task else {
            return;
        };
        if !force && self.client.try_disconnect().is_ok() {
            if tokio::time::timeout(Duration::from_secs(1), &mut task).await.is_ok() {
                return;
            }
        }
        task.abort();
    }
}
