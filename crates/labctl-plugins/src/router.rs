//! Topic router.
//!
//! Delivers each inbound message to every module whose filter matches, in
//! registration order. Handlers run on a bounded pool: at most
//! `max_concurrent_handlers` are in flight at once across all messages.
//! A handler that returns an error, panics or times out is logged, reported
//! as a `HandlerFault` event and dead-lettered; the other handlers for the
//! same message run regardless and the router keeps going.

use crate::dead_letter::{DeadLetterQueue, FailedMessage, FailureReason};
use crate::plugin::{Origin, PluginContext, PluginServices};
use crate::registry::{PluginRegistry, RegisteredModule};
use dashmap::DashMap;
use futures::FutureExt;
use labctl_bus::Message;
use labctl_core::config::router::{DEFAULT_HANDLER_TIMEOUT_SECS, DEFAULT_MAX_CONCURRENT_HANDLERS};
use labctl_core::{Error, LabEvent, Result};
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Handler invocations allowed in flight at once (min 1).
    pub max_concurrent_handlers: usize,
    /// Per-invocation deadline in seconds; 0 disables it.
    pub handler_timeout_secs: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_concurrent_handlers: DEFAULT_MAX_CONCURRENT_HANDLERS,
            handler_timeout_secs: DEFAULT_HANDLER_TIMEOUT_SECS,
        }
    }
}

impl RouterConfig {
    pub fn handler_timeout(&self) -> Option<Duration> {
        (self.handler_timeout_secs > 0).then(|| Duration::from_secs(self.handler_timeout_secs))
    }
}

/// How one handler invocation ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "error", rename_all = "snake_case")]
pub enum HandlerOutcome {
    Completed,
    Failed(String),
    Panicked(String),
    TimedOut,
}

impl HandlerOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }

    pub fn error_message(&self) -> Option<String> {
        match self {
            Self::Completed => None,
            Self::Failed(e) => Some(e.clone()),
            Self::Panicked(e) => Some(format!("handler panicked: {e}")),
            Self::TimedOut => Some("handler timed out".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleOutcome {
    pub module: String,
    pub outcome: HandlerOutcome,
    pub duration_ms: u64,
}

/// Result of routing one message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReport {
    pub topic: String,
    pub outcomes: Vec<ModuleOutcome>,
}

impl DispatchReport {
    pub fn matched(&self) -> usize {
        self.outcomes.len()
    }

    pub fn failures(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.outcome.is_success()).count()
    }

    pub fn modules(&self) -> Vec<&str> {
        self.outcomes.iter().map(|o| o.module.as_str()).collect()
    }
}

/// Handlers launched for one message. Dropping it does not cancel them.
pub struct Dispatch {
    topic: String,
    tasks: Vec<(String, JoinHandle<ModuleOutcome>)>,
}

impl Dispatch {
    pub fn matched(&self) -> usize {
        self.tasks.len()
    }

    /// Wait for every handler and collect outcomes in registration order.
    pub async fn join(self) -> DispatchReport {
        let mut outcomes = Vec::with_capacity(self.tasks.len());
        for (module, task) in self.tasks {
            let outcome = match task.await {
                Ok(outcome) => outcome,
                // The task body catches panics; this only happens on runtime shutdown.
                Err(e) => ModuleOutcome {
                    module,
                    outcome: HandlerOutcome::Failed(format!("task aborted: {e}")),
                    duration_ms: 0,
                },
            };
            outcomes.push(outcome);
        }
        DispatchReport {
            topic: self.topic,
            outcomes,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleStats {
    pub invocations: u64,
    pub failures: u64,
    pub panics: u64,
    pub timeouts: u64,
    pub total_duration_ms: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterStats {
    pub messages_routed: u64,
    pub unmatched: u64,
    pub in_flight: usize,
    pub modules: std::collections::BTreeMap<String, ModuleStats>,
}

struct RouterInner {
    config: RouterConfig,
    registry: Arc<PluginRegistry>,
    services: PluginServices,
    permits: Arc<Semaphore>,
    dead_letters: OnceLock<Arc<DeadLetterQueue>>,
    stats: DashMap<String, ModuleStats>,
    routed: std::sync::atomic::AtomicU64,
    unmatched: std::sync::atomic::AtomicU64,
}

/// Cheap to clone; clones share the pool and counters.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    pub fn new(config: RouterConfig, registry: Arc<PluginRegistry>, services: PluginServices) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_handlers.max(1)));
        Self {
            inner: Arc::new(RouterInner {
                config,
                registry,
                services,
                permits,
                dead_letters: OnceLock::new(),
                stats: DashMap::new(),
                routed: Default::default(),
                unmatched: Default::default(),
            }),
        }
    }

    /// Record faults in `dlq`. Only the first queue attached is used.
    pub fn with_dead_letters(self, dlq: Arc<DeadLetterQueue>) -> Self {
        let _ = self.inner.dead_letters.set(dlq);
        self
    }

    pub fn dead_letters(&self) -> Option<&Arc<DeadLetterQueue>> {
        self.inner.dead_letters.get()
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.inner.registry
    }

    pub fn services(&self) -> &PluginServices {
        &self.inner.services
    }

    pub fn config(&self) -> &RouterConfig {
        &self.inner.config
    }

    /// Handler slots currently free.
    pub fn available_permits(&self) -> usize {
        self.inner.permits.available_permits()
    }

    /// Start every matching handler for `message`.
    ///
    /// Pool slots are taken in registration order before each handler is
    /// spawned, so when the pool is saturated this waits and the inbound
    /// loop feels the back-pressure. Handlers for one message may still run
    /// concurrently with each other.
    pub async fn launch(&self, message: Message) -> Dispatch {
        let modules = self.inner.registry.matching(&message.topic);
        self.inner
            .routed
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        if modules.is_empty() {
            self.inner
                .unmatched
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            trace!(category = "router", topic = %message.topic, "No module matched");
        } else {
            debug!(
                category = "router",
                topic = %message.topic,
                matched = modules.len(),
                "Routing message"
            );
        }

        let message = Arc::new(message);
        let mut tasks = Vec::with_capacity(modules.len());
        for module in modules {
            let name = module.name().to_string();
            let task = self
                .spawn_handler(module, message.clone(), Origin::Message)
                .await;
            tasks.push((name, task));
        }
        Dispatch {
            topic: message.topic.clone(),
            tasks,
        }
    }

    /// Route a message and wait for all of its handlers.
    pub async fn dispatch(&self, message: Message) -> DispatchReport {
        self.launch(message).await.join().await
    }

    /// Run a single module's handler directly, bypassing filters.
    pub async fn invoke(&self, module: &str, message: Message) -> Result<ModuleOutcome> {
        self.invoke_with_origin(module, message, Origin::Message).await
    }

    /// Run a module's handler on behalf of a scheduled job.
    pub async fn invoke_for_job(
        &self,
        module: &str,
        message: Message,
        job_id: &str,
    ) -> Result<ModuleOutcome> {
        let origin = Origin::Job {
            job_id: job_id.to_string(),
        };
        self.invoke_with_origin(module, message, origin).await
    }

    async fn invoke_with_origin(
        &self,
        module: &str,
        message: Message,
        origin: Origin,
    ) -> Result<ModuleOutcome> {
        let registered = self
            .inner
            .registry
            .get(module)
            .ok_or_else(|| Error::not_found(format!("module {module}")))?;
        self.spawn_handler(registered, Arc::new(message), origin)
            .await
            .await
            .map_err(Error::from)
    }

    async fn spawn_handler(
        &self,
        module: Arc<RegisteredModule>,
        message: Arc<Message>,
        origin: Origin,
    ) -> JoinHandle<ModuleOutcome> {
        // The semaphore is owned by the router and never closed.
        let permit = self.inner.permits.clone().acquire_owned().await.ok();
        let inner = self.inner.clone();

        tokio::spawn(async move {
            let _permit = permit;
            let (outcome, reason) = inner.run_handler(&module, &message, &origin).await;
            if let (Some(error), Some(reason)) = (outcome.outcome.error_message(), reason) {
                inner.report_fault(&module, &message, &origin, reason, error).await;
            }
            outcome
        })
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            messages_routed: self.inner.routed.load(std::sync::atomic::Ordering::Relaxed),
            unmatched: self.inner.unmatched.load(std::sync::atomic::Ordering::Relaxed),
            in_flight: self.inner.config.max_concurrent_handlers.max(1)
                - self.inner.permits.available_permits(),
            modules: self
                .inner
                .stats
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
        }
    }

    pub fn module_stats(&self, module: &str) -> Option<ModuleStats> {
        self.inner.stats.get(module).map(|s| s.clone())
    }
}

impl RouterInner {
    async fn run_handler(
        &self,
        module: &RegisteredModule,
        message: &Message,
        origin: &Origin,
    ) -> (ModuleOutcome, Option<FailureReason>) {
        let ctx = PluginContext::new(self.services.clone(), module.name(), origin.clone());
        let started = Instant::now();
        let call = AssertUnwindSafe(module.plugin().handle(&ctx, message)).catch_unwind();

        let caught = match self.config.handler_timeout() {
            Some(limit) => tokio::time::timeout(limit, call).await.ok(),
            None => Some(call.await),
        };
        let (outcome, reason) = match caught {
            None => (HandlerOutcome::TimedOut, Some(FailureReason::Timeout)),
            Some(Err(panic)) => (
                HandlerOutcome::Panicked(panic_message(panic.as_ref())),
                Some(FailureReason::ProcessingError),
            ),
            Some(Ok(Err(e))) => (
                HandlerOutcome::Failed(format!("{e:#}")),
                Some(classify_error(&e)),
            ),
            Some(Ok(Ok(()))) => (HandlerOutcome::Completed, None),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let mut stats = self.stats.entry(module.name().to_string()).or_default();
        stats.invocations += 1;
        stats.total_duration_ms += duration_ms;
        match &outcome {
            HandlerOutcome::Completed => {}
            HandlerOutcome::Failed(e) => {
                stats.failures += 1;
                stats.last_error = Some(e.clone());
            }
            HandlerOutcome::Panicked(e) => {
                stats.panics += 1;
                stats.last_error = Some(e.clone());
            }
            HandlerOutcome::TimedOut => {
                stats.timeouts += 1;
                stats.last_error = Some("timed out".to_string());
            }
        }
        drop(stats);

        let outcome = ModuleOutcome {
            module: module.name().to_string(),
            outcome,
            duration_ms,
        };
        (outcome, reason)
    }

    async fn report_fault(
        &self,
        module: &RegisteredModule,
        message: &Message,
        origin: &Origin,
        reason: FailureReason,
        error: String,
    ) {
        let job_id = match origin {
            Origin::Job { job_id } => Some(job_id.as_str()),
            Origin::Message => None,
        };
        error!(
            category = "router",
            module = module.name(),
            topic = %message.topic,
            job_id = ?job_id,
            error = %error,
            "Handler fault"
        );
        self.services.events.publish(LabEvent::HandlerFault {
            module: module.name().to_string(),
            topic: message.topic.clone(),
            error: error.clone(),
            job_id: job_id.map(str::to_string),
            timestamp: chrono::Utc::now().timestamp(),
        });

        if let Some(dlq) = self.dead_letters.get() {
            dlq.record(FailedMessage {
                topic: &message.topic,
                payload: &message.payload,
                reason,
                error,
                module: Some(module.name()),
                job_id,
            })
            .await;
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Classify an error returned by a handler.
pub fn classify_error(error: &anyhow::Error) -> FailureReason {
    match error.downcast_ref::<Error>() {
        Some(e) => FailureReason::from_error(e),
        None if error.downcast_ref::<serde_json::Error>().is_some() => FailureReason::ParseError,
        None => FailureReason::ModuleError,
    }
}
