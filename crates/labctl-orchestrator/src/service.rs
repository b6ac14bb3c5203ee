//! Service wiring: builds every component and runs the background loops.

use crate::config::OrchestratorConfig;
use crate::dedup::{DedupDecision, RequestDeduplicator};
use crate::health::{self, HealthInputs, HealthReport, LivenessReport, ReadinessReport};
use crate::metrics::{message_kind, GaugeSnapshot, MeteredBus, Metrics};
use crate::tracker::DeviceTracker;
use chrono::{DateTime, Utc};
use labctl_bus::{DynMessageBus, Message};
use labctl_core::envelope::CommandEnvelope;
use labctl_core::{Error, EventBus, Result, Shutdown, ShutdownListener, TopicScheme};
use labctl_devices::DeviceRegistry;
use labctl_locks::LockManager;
use labctl_plugins::{
    DeadLetterQueue, DynPlugin, Plugin, PluginRegistry, PluginServices, Router,
};
use labctl_scheduler::TaskScheduler;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const DLQ_PURGE_INTERVAL: Duration = Duration::from_secs(3600);

pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    bus: Option<DynMessageBus>,
    plugins: Vec<DynPlugin>,
}

impl OrchestratorBuilder {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            bus: None,
            plugins: Vec::new(),
        }
    }

    /// Use this transport instead of connecting to the configured broker.
    pub fn with_bus(mut self, bus: DynMessageBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Add a module. Modules are matched in the order they are added,
    /// after the built-in device tracker.
    pub fn with_plugin(mut self, plugin: impl Plugin + 'static) -> Self {
        self.plugins.push(Arc::new(plugin));
        self
    }

    pub fn with_dyn_plugin(mut self, plugin: DynPlugin) -> Self {
        self.plugins.push(plugin);
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        let config = self.config;
        config.validate()?;
        let topics = config.topic_scheme()?;
        let events = EventBus::new();
        let metrics = Arc::new(Metrics::new()?);

        let transport = match self.bus {
            Some(bus) => bus,
            None => connect_configured_bus(&config)?,
        };
        let bus = MeteredBus::wrap(transport, metrics.clone());

        let locks = Arc::new(LockManager::new(
            config.locks.to_manager_config(),
            events.clone(),
        ));
        let devices = Arc::new(DeviceRegistry::new(
            config.devices.clone(),
            locks.clone(),
            events.clone(),
        ));

        let registry = Arc::new(PluginRegistry::new());
        if config.tracker.enabled {
            registry.register(Arc::new(DeviceTracker::new(topics.clone())))?;
        }
        for plugin in self.plugins {
            registry.register(plugin)?;
        }

        let services = PluginServices {
            devices: devices.clone(),
            locks: locks.clone(),
            bus: bus.clone(),
            events: events.clone(),
            topics: topics.clone(),
        };
        let dead_letters = Arc::new(DeadLetterQueue::new(
            config.dead_letter.clone(),
            bus.clone(),
            events.clone(),
            topics.clone(),
        ));
        let router = Router::new(config.router.clone(), registry.clone(), services)
            .with_dead_letters(dead_letters.clone());
        let scheduler = Arc::new(TaskScheduler::new(
            config.scheduler.clone(),
            router.clone(),
            events.clone(),
        ));
        let dedup = config
            .dedup
            .enabled
            .then(|| Arc::new(RequestDeduplicator::new(&config.dedup)));

        info!(
            category = "config",
            root = topics.root(),
            bus = bus.name(),
            modules = ?registry.names(),
            "Orchestrator built"
        );

        Ok(Orchestrator {
            config,
            topics,
            events,
            bus,
            devices,
            locks,
            registry,
            router,
            dead_letters,
            scheduler,
            dedup,
            metrics,
            shutdown: Shutdown::new(),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            created_at: Utc::now(),
        })
    }
}

#[cfg(feature = "mqtt")]
fn connect_configured_bus(config: &OrchestratorConfig) -> Result<DynMessageBus> {
    let mqtt = config
        .mqtt
        .as_ref()
        .ok_or_else(|| Error::config("no [mqtt] section and no bus supplied"))?;
    Ok(Arc::new(labctl_bus::MqttBus::connect(mqtt.to_bus_config())))
}

#[cfg(not(feature = "mqtt"))]
fn connect_configured_bus(_config: &OrchestratorConfig) -> Result<DynMessageBus> {
    Err(Error::config("built without the mqtt feature; supply a bus"))
}

/// The running service.
pub struct Orchestrator {
    config: OrchestratorConfig,
    topics: TopicScheme,
    events: EventBus,
    bus: DynMessageBus,
    devices: Arc<DeviceRegistry>,
    locks: Arc<LockManager>,
    registry: Arc<PluginRegistry>,
    router: Router,
    dead_letters: Arc<DeadLetterQueue>,
    scheduler: Arc<TaskScheduler>,
    dedup: Option<Arc<RequestDeduplicator>>,
    metrics: Arc<Metrics>,
    shutdown: Shutdown,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    created_at: DateTime<Utc>,
}

impl Orchestrator {
    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    /// Subscribe every module filter and start the loops.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::validation("orchestrator already started"));
        }

        for filter in self.registry.all_filters() {
            if let Err(e) = self.bus.subscribe(&filter).await {
                self.started.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
            debug!(category = "bus", filter = %filter, "Subscribed");
        }
        let inbound = match self.bus.take_inbound() {
            Some(rx) => rx,
            None => {
                self.started.store(false, Ordering::SeqCst);
                return Err(Error::internal("inbound stream already taken"));
            }
        };

        let dispatcher = DispatchLoop {
            router: self.router.clone(),
            topics: self.topics.clone(),
            dedup: self.dedup.clone(),
            metrics: self.metrics.clone(),
        };
        let listener = || self.shutdown.listener();

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(dispatcher.run(inbound, listener())));
        tasks.push(self.locks.spawn_sweeper(listener()));
        tasks.push(self.devices.spawn_presence_monitor(listener()));
        tasks.push(self.scheduler.start(listener()));
        tasks.push(self.metrics.spawn_event_listener(&self.events, listener()));
        tasks.push(spawn_dlq_purge(self.dead_letters.clone(), listener()));

        info!(
            category = "router",
            filters = self.bus.subscriptions().len(),
            modules = self.registry.len(),
            "Orchestrator started"
        );
        Ok(())
    }

    /// Stop every loop, wait for them and close the bus.
    pub async fn shutdown(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(category = "router", "Orchestrator shutting down");
        self.shutdown.trigger();

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                error!(category = "router", error = %e, "Background task failed");
            }
        }
        if let Err(e) = self.bus.close().await {
            warn!(category = "bus", error = %e, "Bus close failed");
        }
        info!(category = "router", "Orchestrator stopped");
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn topics(&self) -> &TopicScheme {
        &self.topics
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn bus(&self) -> &DynMessageBus {
        &self.bus
    }

    pub fn devices(&self) -> &Arc<DeviceRegistry> {
        &self.devices
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterQueue> {
        &self.dead_letters
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    pub fn dedup(&self) -> Option<&Arc<RequestDeduplicator>> {
        self.dedup.as_ref()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn uptime_seconds(&self) -> u64 {
        (Utc::now() - self.created_at).num_seconds().max(0) as u64
    }

    async fn health_inputs(&self) -> HealthInputs {
        HealthInputs {
            bus_name: self.bus.name().to_string(),
            bus_connected: self.bus.is_connected(),
            devices: self.devices.stats().await,
            plugins: self.registry.names(),
            started: self.is_started(),
            scheduler_running: self.scheduler.is_running(),
            scheduled_jobs: self.scheduler.len().await,
            uptime_seconds: self.uptime_seconds(),
        }
    }

    pub async fn health(&self) -> HealthReport {
        health::assess(&self.health_inputs().await)
    }

    pub async fn readiness(&self) -> ReadinessReport {
        health::readiness(&self.health_inputs().await)
    }

    pub fn liveness(&self) -> LivenessReport {
        health::liveness(self.uptime_seconds())
    }

    /// Refresh gauges and render the Prometheus text format.
    pub async fn metrics_text(&self) -> Result<String> {
        let snapshot = GaugeSnapshot {
            devices: self.devices.stats().await,
            locks: self.locks.stats(),
            jobs: self.scheduler.len().await,
            dead_letters: self.dead_letters.len(),
        };
        self.metrics.refresh(&snapshot);
        self.metrics.render()
    }
}

/// Receives inbound messages and hands them to the router.
struct DispatchLoop {
    router: Router,
    topics: TopicScheme,
    dedup: Option<Arc<RequestDeduplicator>>,
    metrics: Arc<Metrics>,
}

impl DispatchLoop {
    async fn run(self, mut inbound: mpsc::Receiver<Message>, mut shutdown: ShutdownListener) {
        debug!(category = "router", "Dispatch loop started");
        loop {
            tokio::select! {
                message = inbound.recv() => match message {
                    Some(message) => self.handle(message).await,
                    None => {
                        warn!(category = "bus", "Inbound stream closed");
                        break;
                    }
                },
                _ = shutdown.wait() => break,
            }
        }
        debug!(category = "router", "Dispatch loop stopped");
    }

    async fn handle(&self, message: Message) {
        self.metrics
            .record_inbound(message_kind(&self.topics, &message.topic));

        let req_id = match self.admit(&message) {
            Admission::Untracked => None,
            Admission::Tracked(req_id) => Some(req_id),
            Admission::Duplicate => return,
        };

        // Waits for pool capacity; handlers then run off this loop.
        let dispatch = self.router.launch(message).await;
        let metrics = self.metrics.clone();
        let dedup = self.dedup.clone();
        tokio::spawn(async move {
            let report = dispatch.join().await;
            metrics.record_dispatch(&report);
            if let (Some(dedup), Some(req_id)) = (dedup, req_id) {
                if report.failures() == 0 {
                    dedup.mark_completed(&req_id);
                } else {
                    dedup.mark_failed(&req_id);
                }
            }
        });
    }

    fn admit(&self, message: &Message) -> Admission {
        let Some(dedup) = &self.dedup else {
            return Admission::Untracked;
        };
        let Some(module) = self.topics.parse_command_topic(&message.topic) else {
            return Admission::Untracked;
        };
        // Malformed commands pass through; the module rejects them.
        let Ok(command) = message.parse_json::<CommandEnvelope>() else {
            return Admission::Untracked;
        };
        match dedup.check_and_mark(&command.req_id, module, command.action.trim()) {
            DedupDecision::Fresh => Admission::Tracked(command.req_id),
            DedupDecision::Duplicate(state) => {
                self.metrics.record_duplicate();
                info!(
                    category = "router",
                    req_id = %command.req_id,
                    module,
                    state = ?state,
                    "Duplicate command dropped"
                );
                Admission::Duplicate
            }
        }
    }
}

enum Admission {
    /// Not a command, or deduplication is off.
    Untracked,
    /// Fresh command marked as processing under this `req_id`.
    Tracked(String),
    Duplicate,
}

fn spawn_dlq_purge(queue: Arc<DeadLetterQueue>, mut shutdown: ShutdownListener) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(DLQ_PURGE_INTERVAL);
        timer.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = timer.tick() => {
                    queue.purge_expired();
                }
            }
        }
    })
}
