//! Message bus adapters for labctl.
//!
//! The orchestrator talks to its transport only through [`MessageBus`]:
//! it subscribes topic filters, publishes payloads and drains a single
//! stream of inbound [`Message`]s.
//!
//! | Adapter | Feature | Use |
//! |---------|---------|-----|
//! | [`MemoryBus`] | always | in-process loopback, tests and embedding |
//! | [`MqttBus`] | `mqtt` (default) | rumqttc client against a broker |

pub mod error;
pub mod memory;
pub mod message;
#[cfg(feature = "mqtt")]
pub mod mqtt;

pub use error::{BusError, Result};
pub use memory::MemoryBus;
pub use message::{Message, Qos};
#[cfg(feature = "mqtt")]
pub use mqtt::{MqttBus, MqttBusConfig};

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Default capacity of the inbound message channel.
pub const DEFAULT_INBOUND_CAPACITY: usize = 1024;

/// Publish/subscribe transport.
///
/// Implementations must remember their subscriptions and restore them after
/// a reconnect; callers subscribe once.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Adapter name for logs.
    fn name(&self) -> &str;

    /// Subscribe to a topic filter. Subscribing twice is a no-op.
    async fn subscribe(&self, filter: &str) -> Result<()>;

    /// Publish a payload to a concrete topic.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;

    /// Take the inbound message stream. Only the first caller gets it.
    fn take_inbound(&self) -> Option<mpsc::Receiver<Message>>;

    /// Whether the transport is currently connected.
    fn is_connected(&self) -> bool;

    /// Filters currently subscribed.
    fn subscriptions(&self) -> Vec<String>;

    /// Disconnect and stop delivering messages.
    async fn close(&self) -> Result<()>;
}

/// Shared bus handle.
pub type DynMessageBus = Arc<dyn MessageBus>;
