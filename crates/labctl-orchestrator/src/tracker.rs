//! Built-in module that keeps the device registry in sync with presence topics.

use async_trait::async_trait;
use labctl_bus::Message;
use labctl_core::envelope::{parse_envelope, DeviceMetaEnvelope, DeviceStatusEnvelope};
use labctl_core::{Error, TopicScheme};
use labctl_devices::{DeviceStatus, StatusDelta};
use labctl_plugins::{Plugin, PluginContext};
use tracing::debug;

pub const TRACKER_MODULE: &str = "device_tracker";

/// Upserts devices from `<root>/device/+/status` and `<root>/device/+/meta`.
pub struct DeviceTracker {
    topics: TopicScheme,
}

impl DeviceTracker {
    pub fn new(topics: TopicScheme) -> Self {
        Self { topics }
    }

    fn status_delta(envelope: &DeviceStatusEnvelope, message: &Message) -> StatusDelta {
        let status = if envelope.online {
            DeviceStatus::Online
        } else {
            DeviceStatus::Offline
        };
        // uptime_seconds is not kept in metadata
        StatusDelta::new()
            .with_status(status)
            .observed_at(message.received_at)
    }

    fn meta_delta(envelope: &DeviceMetaEnvelope, message: &Message) -> StatusDelta {
        let mut delta = StatusDelta::new()
            .with_metadata("version", envelope.version.clone())
            .observed_at(message.received_at);
        if let Some(device_type) = &envelope.device_type {
            delta = delta.with_type(device_type.clone());
        }
        if !envelope.modules.is_empty() {
            delta = delta.with_metadata("modules", envelope.modules.join(","));
        }
        if !envelope.labels.is_empty() {
            delta = delta.with_metadata("labels", envelope.labels.join(","));
        }
        delta
    }
}

fn check_topic_id(topic_id: &str, envelope_id: &str) -> labctl_core::Result<()> {
    if topic_id != envelope_id {
        return Err(Error::validation(format!(
            "device_id '{envelope_id}' does not match topic device '{topic_id}'"
        )));
    }
    Ok(())
}

#[async_trait]
impl Plugin for DeviceTracker {
    fn name(&self) -> &str {
        TRACKER_MODULE
    }

    fn topic_filters(&self) -> Vec<String> {
        vec![
            self.topics.device_status_filter(),
            self.topics.device_meta_filter(),
        ]
    }

    async fn handle(&self, ctx: &PluginContext, message: &Message) -> anyhow::Result<()> {
        let device_id = self
            .topics
            .parse_device_topic(&message.topic)
            .ok_or_else(|| Error::validation(format!("not a device topic: {}", message.topic)))?;

        let delta = if message.topic.ends_with("/status") {
            let envelope: DeviceStatusEnvelope =
                parse_envelope(&message.payload, DeviceStatusEnvelope::validate)?;
            check_topic_id(device_id, &envelope.device_id)?;
            Self::status_delta(&envelope, message)
        } else {
            let envelope: DeviceMetaEnvelope =
                parse_envelope(&message.payload, DeviceMetaEnvelope::validate)?;
            check_topic_id(device_id, &envelope.device_id)?;
            Self::meta_delta(&envelope, message)
        };

        let device = ctx.devices().upsert(device_id, delta).await?;
        debug!(
            category = "devices",
            device_id,
            status = %device.status,
            "Presence message applied"
        );
        Ok(())
    }
}
