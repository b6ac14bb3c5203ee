//! In-process loopback bus.
//!
//! Publishing to a topic that matches one of the bus's own subscriptions
//! delivers the message on the inbound stream, the same way a broker would
//! echo it back. Every publish is also recorded so tests can inspect the
//! outbound traffic.

use crate::error::{BusError, Result};
use crate::message::Message;
use crate::{MessageBus, DEFAULT_INBOUND_CAPACITY};
use async_trait::async_trait;
use labctl_core::topic::{validate_topic, TopicFilter};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub struct MemoryBus {
    subscriptions: RwLock<Vec<TopicFilter>>,
    inbound_tx: Mutex<Option<mpsc::Sender<Message>>>,
    inbound_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    published: Mutex<Vec<Message>>,
    connected: AtomicBool,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_INBOUND_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            subscriptions: RwLock::new(Vec::new()),
            inbound_tx: Mutex::new(Some(tx)),
            inbound_rx: Mutex::new(Some(rx)),
            published: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
        }
    }

    /// Deliver a message as if another client had published it.
    ///
    /// Returns `true` when the topic matched a subscription.
    pub async fn inject(&self, topic: &str, payload: impl Into<Vec<u8>>) -> Result<bool> {
        validate_topic(topic)?;
        self.deliver(Message::new(topic, payload)).await
    }

    /// Every message published through this bus, oldest first.
    pub fn published(&self) -> Vec<Message> {
        self.published.lock().clone()
    }

    /// Published messages whose topic matches `filter`.
    pub fn published_matching(&self, filter: &str) -> Vec<Message> {
        let Ok(filter) = TopicFilter::parse(filter) else {
            return Vec::new();
        };
        self.published
            .lock()
            .iter()
            .filter(|m| filter.matches(&m.topic))
            .cloned()
            .collect()
    }

    /// Simulate a connection drop or recovery.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions.read().iter().any(|f| f.matches(topic))
    }

    async fn deliver(&self, message: Message) -> Result<bool> {
        if !self.is_subscribed(&message.topic) {
            return Ok(false);
        }
        let tx = self.inbound_tx.lock().clone();
        match tx {
            Some(tx) => {
                if tx.send(message).await.is_err() {
                    debug!(category = "bus", "Inbound receiver dropped");
                    return Ok(false);
                }
                Ok(true)
            }
            None => Err(BusError::Closed),
        }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    fn name(&self) -> &str {
        "memory"
    }

    async fn subscribe(&self, filter: &str) -> Result<()> {
        let parsed = TopicFilter::parse(filter)?;
        let mut subs = self.subscriptions.write();
        if !subs.iter().any(|f| f == &parsed) {
            debug!(category = "bus", filter, "Subscribed");
            subs.push(parsed);
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        validate_topic(topic)?;
        if !self.connected.load(Ordering::SeqCst) {
            warn!(category = "bus", topic, "Publish while disconnected");
            return Err(BusError::NotConnected("memory".to_string()));
        }
        let message = Message::new(topic, payload);
        self.published.lock().push(message.clone());
        self.deliver(message).await?;
        Ok(())
    }

    fn take_inbound(&self) -> Option<mpsc::Receiver<Message>> {
        self.inbound_rx.lock().take()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn subscriptions(&self) -> Vec<String> {
        self.subscriptions
            .read()
            .iter()
            .map(|f| f.as_str().to_string())
            .collect()
    }

    async fn close(&self) -> Result<()> {
        self.inbound_tx.lock().take();
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_loopback_only_for_subscribed_topics() {
        let bus = MemoryBus::new();
        let mut rx = bus.take_inbound().unwrap();
        bus.subscribe("lab/+/cmd").await.unwrap();

        bus.publish("lab/proj/cmd", b"on".to_vec()).await.unwrap();
        bus.publish("lab/proj/status", b"ok".to_vec()).await.unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.topic, "lab/proj/cmd");
        assert!(rx.try_recv().is_err());
        assert_eq!(bus.published().len(), 2);
        assert_eq!(bus.published_matching("lab/+/status").len(), 1);
    }

    #[tokio::test]
    async fn test_inbound_taken_once() {
        let bus = MemoryBus::new();
        assert!(bus.take_inbound().is_some());
        assert!(bus.take_inbound().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_subscribe_is_noop() {
        let bus = MemoryBus::new();
        bus.subscribe("lab/#").await.unwrap();
        bus.subscribe("lab/#").await.unwrap();
        assert_eq!(bus.subscriptions(), vec!["lab/#".to_string()]);
        assert!(bus.subscribe("lab/#/x").await.is_err());
    }

    #[tokio::test]
    async fn test_publish_rejects_wildcards_and_disconnect() {
        let bus = MemoryBus::new();
        assert!(matches!(
            bus.publish("lab/+/cmd", Vec::new()).await,
            Err(BusError::InvalidTopic(_))
        ));

        bus.set_connected(false);
        assert!(matches!(
            bus.publish("lab/x/cmd", Vec::new()).await,
            Err(BusError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_inject_and_close() {
        let bus = MemoryBus::new();
        let mut rx = bus.take_inbound().unwrap();
        bus.subscribe("lab/device/+/status").await.unwrap();

        assert!(bus.inject("lab/device/d1/status", "{}").await.unwrap());
        assert!(!bus.inject("lab/other", "{}").await.unwrap());
        assert_eq!(rx.recv().await.unwrap().topic, "lab/device/d1/status");

        bus.close().await.unwrap();
        assert!(rx.recv().await.is_none());
        assert!(!bus.is_connected());
    }
}
