//! The labctl service: component wiring and its outer surfaces.
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`config`] | [`OrchestratorConfig`], TOML file plus `LABCTL_*` overrides |
//! | [`service`] | [`Orchestrator`] and its builder, the dispatch loop |
//! | [`tracker`] | Built-in device presence module |
//! | [`dedup`] | Command deduplication by `req_id` |
//! | [`health`] | Health, readiness and liveness reports |
//! | [`metrics`] | Prometheus counters and gauges |
//! | [`api`] | [`ControlApi`] for a dashboard layer |
//! | [`logging`] | Tracing subscriber setup |
//!
//! ```no_run
//! use labctl_orchestrator::{Orchestrator, OrchestratorConfig};
//! use std::sync::Arc;
//!
//! # async fn run() -> labctl_core::Result<()> {
//! let config = OrchestratorConfig::load(None)?;
//! let orchestrator = Arc::new(Orchestrator::builder(config).build()?);
//! orchestrator.start().await?;
//! let api = orchestrator.api();
//! println!("{:?}", api.health().await.status);
//! orchestrator.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod config;
pub mod dedup;
pub mod health;
pub mod logging;
pub mod metrics;
pub mod service;
pub mod tracker;

pub use api::{ApiResult, ControlApi, Rejection};
pub use config::OrchestratorConfig;
pub use dedup::{DedupDecision, RequestDeduplicator};
pub use health::{HealthReport, HealthStatus};
pub use metrics::Metrics;
pub use service::{Orchestrator, OrchestratorBuilder};
pub use tracker::{DeviceTracker, TRACKER_MODULE};

/// Version information.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
