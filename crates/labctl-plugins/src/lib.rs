//! Handler modules and message routing for labctl.
//!
//! | Type | Role |
//! |------|------|
//! | [`Plugin`] | A compiled-in handler module with its topic filters |
//! | [`PluginRegistry`] | Installed modules, in registration order |
//! | [`Router`] | Fault-isolated fan-out on a bounded handler pool |
//! | [`DeadLetterQueue`] | Failed messages kept for inspection and replay |

pub mod dead_letter;
pub mod plugin;
pub mod registry;
pub mod router;

pub use dead_letter::{
    DeadLetter, DeadLetterConfig, DeadLetterFilter, DeadLetterQueue, DeadLetterStats,
    FailedMessage, FailureReason,
};
pub use plugin::{DynPlugin, Origin, Plugin, PluginContext, PluginServices};
pub use registry::{PluginRegistry, RegisteredModule};
pub use router::{
    classify_error, Dispatch, DispatchReport, HandlerOutcome, ModuleOutcome, ModuleStats, Router,
    RouterConfig, RouterStats,
};

/// Version information.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
