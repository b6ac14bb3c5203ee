//! MQTT bus using rumqttc.
//!
//! The event loop runs on its own task. Subscriptions are remembered and
//! re-issued on every `ConnAck`, so a broker restart or network drop does not
//! silently lose them. Connection errors are logged and retried after
//! `reconnect_interval_ms`; the loop only exits on [`MessageBus::close`].
//! When the inbound queue is full the loop waits for room instead of
//! dropping messages the broker has already handed over.

use crate::error::{BusError, Result};
use crate::message::{Message, Qos};
use crate::{MessageBus, DEFAULT_INBOUND_CAPACITY};
use async_trait::async_trait;
use labctl_core::topic::{validate_topic, TopicFilter};
use parking_lot::{Mutex, RwLock};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

/// MQTT connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttBusConfig {
    /// Broker host.
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Client ID; a random one is generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Keep-alive interval in seconds.
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u64,

    #[serde(default = "default_clean_session")]
    pub clean_session: bool,

    #[serde(default)]
    pub qos: Qos,

    /// Delay before polling again after a connection error.
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_ms: u64,

    #[serde(default = "default_inbound_capacity")]
    pub inbound_capacity: usize,
}

fn default_port() -> u16 {
    1883
}

fn default_keep_alive() -> u64 {
    60
}

fn default_clean_session() -> bool {
    true
}

fn default_reconnect_interval() -> u64 {
    5000
}

fn default_inbound_capacity() -> usize {
    DEFAULT_INBOUND_CAPACITY
}

impl MqttBusConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            client_id: None,
            username: None,
            password: None,
            keep_alive: default_keep_alive(),
            clean_session: default_clean_session(),
            qos: Qos::default(),
            reconnect_interval_ms: default_reconnect_interval(),
            inbound_capacity: default_inbound_capacity(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn broker_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn options(&self) -> MqttOptions {
        let client_id = self
            .client_id
            .clone()
            .unwrap_or_else(|| format!("labctl-{}", uuid::Uuid::new_v4()));
        let mut options = MqttOptions::new(client_id, &self.host, self.port);
        options.set_keep_alive(Duration::from_secs(self.keep_alive.max(5)));
        options.set_clean_session(self.clean_session);
        options.set_max_packet_size(10 * 1024 * 1024, 10 * 1024 * 1024);
        if let (Some(user), Some(pass)) = (&self.username, &self.password) {
            options.set_credentials(user, pass);
        }
        options
    }
}

struct Shared {
    client: AsyncClient,
    qos: Qos,
    subscriptions: RwLock<BTreeSet<String>>,
    connected: AtomicBool,
    shutdown: Notify,
    closed: AtomicBool,
}

pub struct MqttBus {
    shared: Arc<Shared>,
    broker_addr: String,
    inbound_rx: Mutex<Option<mpsc::Receiver<Message>>>,
}

impl MqttBus {
    /// Create the client and spawn its event loop.
    ///
    /// Must be called inside a tokio runtime. The connection is established
    /// asynchronously; [`MessageBus::is_connected`] turns true on `ConnAck`.
    pub fn connect(config: MqttBusConfig) -> Self {
        let (client, eventloop) = AsyncClient::new(config.options(), 64);
        let (tx, rx) = mpsc::channel(config.inbound_capacity.max(1));

        let shared = Arc::new(Shared {
            client,
            qos: config.qos,
            subscriptions: RwLock::new(BTreeSet::new()),
            connected: AtomicBool::new(false),
            shutdown: Notify::new(),
            closed: AtomicBool::new(false),
        });

        let broker_addr = config.broker_addr();
        let reconnect = Duration::from_millis(config.reconnect_interval_ms.max(100));
        tokio::spawn(run_event_loop(
            eventloop,
            shared.clone(),
            tx,
            reconnect,
            broker_addr.clone(),
        ));

        info!(category = "bus", broker = %broker_addr, "MQTT bus started");
        Self {
            shared,
            broker_addr,
            inbound_rx: Mutex::new(Some(rx)),
        }
    }

    pub fn broker_addr(&self) -> &str {
        &self.broker_addr
    }

}

/// Hand an inbound message to the consumer, waiting while its queue is full.
/// `false` when the consumer is gone or the bus is closing.
async fn forward(tx: &mpsc::Sender<Message>, message: Message, shutdown: &Notify) -> bool {
    tokio::select! {
        sent = tx.send(message) => sent.is_ok(),
        _ = shutdown.notified() => false,
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    shared: Arc<Shared>,
    tx: mpsc::Sender<Message>,
    reconnect: Duration,
    broker: String,
) {
    let mut error_count: u64 = 0;

    loop {
        let polled = tokio::select! {
            _ = shared.shutdown.notified() => break,
            polled = eventloop.poll() => polled,
        };

        match polled {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                error_count = 0;
                shared.connected.store(true, Ordering::SeqCst);
                let filters: Vec<String> = shared.subscriptions.read().iter().cloned().collect();
                info!(
                    category = "bus",
                    broker = %broker,
                    resubscribing = filters.len(),
                    "MQTT connection acknowledged"
                );
                for filter in filters {
                    // The request queue is drained by this very loop, so never await here.
                    if let Err(e) = shared.client.try_subscribe(filter.as_str(), shared.qos.into()) {
                        warn!(category = "bus", filter = %filter, error = %e, "Resubscribe failed");
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = Message::new(publish.topic, publish.payload.to_vec());
                if !forward(&tx, message, &shared.shutdown).await {
                    debug!(category = "bus", "Inbound consumer gone or bus closing, stopping event loop");
                    break;
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                shared.connected.store(false, Ordering::SeqCst);
                warn!(category = "bus", broker = %broker, "Broker sent disconnect");
            }
            Ok(_) => {}
            Err(e) => {
                if shared.closed.load(Ordering::SeqCst) {
                    break;
                }
                shared.connected.store(false, Ordering::SeqCst);
                error_count += 1;
                if error_count == 1 || error_count % 10 == 0 {
                    error!(
                        category = "bus",
                        broker = %broker,
                        attempts = error_count,
                        error = %e,
                        "MQTT connection error, retrying"
                    );
                }
                tokio::select! {
                    _ = shared.shutdown.notified() => break,
                    _ = tokio::time::sleep(reconnect) => {}
                }
            }
        }
    }

    shared.connected.store(false, Ordering::SeqCst);
    info!(category = "bus", broker = %broker, "MQTT event loop stopped");
}

#[async_trait]
impl MessageBus for MqttBus {
    fn name(&self) -> &str {
        "mqtt"
    }

    async fn subscribe(&self, filter: &str) -> Result<()> {
        TopicFilter::parse(filter)?;
        let inserted = self.shared.subscriptions.write().insert(filter.to_string());
        if !inserted {
            return Ok(());
        }
        // Stored first: if the broker is down the ConnAck handler subscribes later.
        if self.shared.connected.load(Ordering::SeqCst) {
            self.shared
                .client
                .subscribe(filter, self.shared.qos.into())
                .await
                .map_err(|e| BusError::Subscribe(e.to_string()))?;
        }
        debug!(category = "bus", filter, "Subscribed");
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        validate_topic(topic)?;
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        self.shared
            .client
            .publish(topic, self.shared.qos.into(), false, payload)
            .await
            .map_err(|e| BusError::Publish(e.to_string()))
    }

    fn take_inbound(&self) -> Option<mpsc::Receiver<Message>> {
        self.inbound_rx.lock().take()
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn subscriptions(&self) -> Vec<String> {
        self.shared.subscriptions.read().iter().cloned().collect()
    }

    async fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.shared.client.disconnect().await {
            debug!(category = "bus", error = %e, "Disconnect request failed");
        }
        self.shared.shutdown.notify_one();
        Ok(())
    }
}
