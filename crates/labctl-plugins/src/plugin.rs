//! The module trait and the context handed to every handler call.

use async_trait::async_trait;
use labctl_bus::{DynMessageBus, Message};
use labctl_core::envelope::{CommandAck, CommandEnvelope, ResponseCode};
use labctl_core::{EventBus, Result, TopicScheme};
use labctl_devices::DeviceRegistry;
use labctl_locks::{LeaseKind, LockHandle, LockManager};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// A handler module compiled into the service.
///
/// Modules declare the topic filters they care about and receive every
/// matching message. A module may also be invoked directly by the scheduler,
/// in which case `ctx.job_id()` is set. Returning an error (or panicking) is
/// reported as a handler fault and never reaches other modules.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Unique module name, `[A-Za-z0-9_]+`.
    fn name(&self) -> &str;

    /// MQTT-style filters this module subscribes to.
    fn topic_filters(&self) -> Vec<String>;

    async fn handle(&self, ctx: &PluginContext, message: &Message) -> anyhow::Result<()>;
}

pub type DynPlugin = Arc<dyn Plugin>;

/// Shared collaborators available to handlers.
#[derive(Clone)]
pub struct PluginServices {
    pub devices: Arc<DeviceRegistry>,
    pub locks: Arc<LockManager>,
    pub bus: DynMessageBus,
    pub events: EventBus,
    pub topics: TopicScheme,
}

/// Why a handler is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// Routed from an inbound bus message.
    Message,
    /// Fired by a scheduled job.
    Job { job_id: String },
}

/// Per-invocation context.
#[derive(Clone)]
pub struct PluginContext {
    services: PluginServices,
    module: String,
    origin: Origin,
}

impl PluginContext {
    pub fn new(services: PluginServices, module: impl Into<String>, origin: Origin) -> Self {
        Self {
            services,
            module: module.into(),
            origin,
        }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn job_id(&self) -> Option<&str> {
        match &self.origin {
            Origin::Job { job_id } => Some(job_id),
            Origin::Message => None,
        }
    }

    pub fn devices(&self) -> &Arc<DeviceRegistry> {
        &self.services.devices
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.services.locks
    }

    pub fn events(&self) -> &EventBus {
        &self.services.events
    }

    pub fn topics(&self) -> &TopicScheme {
        &self.services.topics
    }

    pub fn bus(&self) -> &DynMessageBus {
        &self.services.bus
    }

    /// Take an exclusive lease on a device in this module's name.
    pub fn lock_exclusive(&self, device_id: &str, ttl: Option<Duration>) -> Result<LockHandle> {
        self.services
            .locks
            .acquire(device_id, LeaseKind::Exclusive, &self.module, ttl)
    }

    /// Take a shared lease on a device in this module's name.
    pub fn lock_shared(&self, device_id: &str, ttl: Option<Duration>) -> Result<LockHandle> {
        self.services
            .locks
            .acquire(device_id, LeaseKind::Shared, &self.module, ttl)
    }

    pub async fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>) -> Result<()> {
        Ok(self.services.bus.publish(topic, payload.into()).await?)
    }

    pub async fn publish_json<T: Serialize + Sync>(&self, topic: &str, value: &T) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        self.publish(topic, payload).await
    }

    /// Publish to this module's status topic.
    pub async fn publish_status<T: Serialize + Sync>(&self, value: &T) -> Result<()> {
        let topic = self.services.topics.status_topic(&self.module);
        self.publish_json(&topic, value).await
    }

    /// Acknowledge a command on this module's status topic.
    pub async fn ack(
        &self,
        command: &CommandEnvelope,
        code: ResponseCode,
        error: Option<String>,
    ) -> Result<CommandAck> {
        let ack = command.ack(code, error);
        self.publish_status(&ack).await?;
        Ok(ack)
    }
}
