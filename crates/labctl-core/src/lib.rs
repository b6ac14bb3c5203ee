//! Core types for labctl.
//!
//! This crate defines what every other labctl crate shares:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`error`] | Unified [`Error`] and [`Result`] |
//! | [`event`] | [`LabEvent`] announced on state changes |
//! | [`eventbus`] | Broadcast [`EventBus`] |
//! | [`topic`] | MQTT-style [`TopicFilter`] and the [`TopicScheme`] layout |
//! | [`envelope`] | JSON command/ack/presence envelopes |
//! | [`config`] | Shared defaults and environment variable names |
//! | [`shutdown`] | Stop signal for background loops |

pub mod config;
pub mod envelope;
pub mod error;
pub mod event;
pub mod eventbus;
pub mod shutdown;
pub mod topic;

pub use envelope::{
    CommandAck, CommandEnvelope, DeviceMetaEnvelope, DeviceStatusEnvelope, ModuleStatusEnvelope,
    ResponseCode,
};
pub use error::{Error, Result};
pub use event::{EventMetadata, LabEvent};
pub use eventbus::{
    EventBus, EventBusReceiver, FilterBuilder, FilteredReceiver, SharedEventBus,
    DEFAULT_CHANNEL_CAPACITY,
};
pub use shutdown::{Shutdown, ShutdownListener};
pub use topic::{TopicFilter, TopicScheme};

/// Version information.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Current time as unix seconds, the timestamp unit used by events.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
