//! Prometheus metrics.
//!
//! Counters fed from the dispatch loop and the event bus, gauges refreshed
//! from component stats right before rendering.

use async_trait::async_trait;
use labctl_bus::{DynMessageBus, Message, MessageBus};
use labctl_core::{Error, EventBus, LabEvent, Result, ShutdownListener, TopicScheme};
use labctl_devices::DeviceStats;
use labctl_locks::LockStats;
use labctl_plugins::{DispatchReport, HandlerOutcome};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

const NAMESPACE: &str = "labctl";

/// Inbound message class used as the `kind` label.
pub fn message_kind(topics: &TopicScheme, topic: &str) -> &'static str {
    if topics.parse_command_topic(topic).is_some() {
        "command"
    } else if topics.parse_device_topic(topic).is_some() {
        "device"
    } else {
        "other"
    }
}

fn outcome_label(outcome: &HandlerOutcome) -> &'static str {
    match outcome {
        HandlerOutcome::Completed => "completed",
        HandlerOutcome::Failed(_) => "failed",
        HandlerOutcome::Panicked(_) => "panicked",
        HandlerOutcome::TimedOut => "timed_out",
    }
}

fn prom_err(e: prometheus::Error) -> Error {
    Error::internal(format!("metrics: {e}"))
}

/// Point-in-time values for the gauges.
#[derive(Debug, Clone, Default)]
pub struct GaugeSnapshot {
    pub devices: DeviceStats,
    pub locks: LockStats,
    pub jobs: usize,
    pub dead_letters: usize,
}

pub struct Metrics {
    registry: Registry,
    inbound_messages: IntCounterVec,
    outbound_messages: IntCounterVec,
    handler_outcomes: IntCounterVec,
    unmatched_messages: IntCounter,
    duplicates_dropped: IntCounter,
    job_firings: IntCounterVec,
    dead_letters: IntCounterVec,
    lock_grants: IntCounter,
    lock_denials: IntCounter,
    lock_expiries: IntCounter,
    devices_known: IntGauge,
    devices_online: IntGauge,
    locks_active: IntGauge,
    jobs_scheduled: IntGauge,
    dead_letters_queued: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some(NAMESPACE.to_string()), None).map_err(prom_err)?;

        let counter_vec = |name: &str, help: &str, labels: &[&str]| -> Result<IntCounterVec> {
            let counter = IntCounterVec::new(Opts::new(name, help), labels).map_err(prom_err)?;
            registry.register(Box::new(counter.clone())).map_err(prom_err)?;
            Ok(counter)
        };
        let counter = |name: &str, help: &str| -> Result<IntCounter> {
            let counter = IntCounter::new(name, help).map_err(prom_err)?;
            registry.register(Box::new(counter.clone())).map_err(prom_err)?;
            Ok(counter)
        };
        let gauge = |name: &str, help: &str| -> Result<IntGauge> {
            let gauge = IntGauge::new(name, help).map_err(prom_err)?;
            registry.register(Box::new(gauge.clone())).map_err(prom_err)?;
            Ok(gauge)
        };

        Ok(Self {
            inbound_messages: counter_vec(
                "messages_inbound_total",
                "Messages received from the bus",
                &["kind"],
            )?,
            outbound_messages: counter_vec(
                "messages_outbound_total",
                "Publishes to the bus",
                &["result"],
            )?,
            handler_outcomes: counter_vec(
                "handler_invocations_total",
                "Handler invocations by module and outcome",
                &["module", "outcome"],
            )?,
            unmatched_messages: counter("messages_unmatched_total", "Messages no module matched")?,
            duplicates_dropped: counter(
                "commands_duplicate_total",
                "Commands dropped as duplicates",
            )?,
            job_firings: counter_vec("job_firings_total", "Scheduled job runs", &["outcome"])?,
            dead_letters: counter_vec(
                "dead_letters_total",
                "Messages dead-lettered",
                &["reason"],
            )?,
            lock_grants: counter("lock_grants_total", "Leases granted")?,
            lock_denials: counter("lock_denials_total", "Lease requests denied")?,
            lock_expiries: counter("lock_expiries_total", "Leases reclaimed by TTL")?,
            devices_known: gauge("devices_known", "Devices in the registry")?,
            devices_online: gauge("devices_online", "Devices currently online")?,
            locks_active: gauge("locks_active", "Leases currently held")?,
            jobs_scheduled: gauge("jobs_scheduled", "Jobs in the schedule")?,
            dead_letters_queued: gauge("dead_letters_queued", "Dead letters held in memory")?,
            registry,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_inbound(&self, kind: &str) {
        self.inbound_messages.with_label_values(&[kind]).inc();
    }

    pub fn record_outbound(&self, ok: bool) {
        let result = if ok { "ok" } else { "error" };
        self.outbound_messages.with_label_values(&[result]).inc();
    }

    pub fn record_duplicate(&self) {
        self.duplicates_dropped.inc();
    }

    pub fn record_dispatch(&self, report: &DispatchReport) {
        if report.outcomes.is_empty() {
            self.unmatched_messages.inc();
        }
        for outcome in &report.outcomes {
            self.handler_outcomes
                .with_label_values(&[outcome.module.as_str(), outcome_label(&outcome.outcome)])
                .inc();
        }
    }

    /// Update counters driven by domain events.
    pub fn observe_event(&self, event: &LabEvent) {
        match event {
            LabEvent::LockExpired { .. } => self.lock_expiries.inc(),
            LabEvent::JobFired { success, .. } => {
                let outcome = if *success { "success" } else { "failure" };
                self.job_firings.with_label_values(&[outcome]).inc();
            }
            LabEvent::MessageDeadLettered { reason, .. } => {
                self.dead_letters.with_label_values(&[reason.as_str()]).inc();
            }
            _ => {}
        }
    }

    pub fn refresh(&self, snapshot: &GaugeSnapshot) {
        self.devices_known.set(snapshot.devices.total as i64);
        self.devices_online.set(snapshot.devices.online as i64);
        self.locks_active.set(snapshot.locks.active as i64);
        self.jobs_scheduled.set(snapshot.jobs as i64);
        self.dead_letters_queued.set(snapshot.dead_letters as i64);
        // Lock grant/deny totals live in the manager; catch the counters up.
        sync_counter(&self.lock_grants, snapshot.locks.granted);
        sync_counter(&self.lock_denials, snapshot.locks.denied);
    }

    /// Text exposition format.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(prom_err)?;
        String::from_utf8(buffer).map_err(|e| Error::internal(format!("metrics: {e}")))
    }

    /// Feed event counters until `shutdown` fires.
    pub fn spawn_event_listener(
        self: &Arc<Self>,
        events: &EventBus,
        mut shutdown: ShutdownListener,
    ) -> JoinHandle<()> {
        let metrics = self.clone();
        let mut rx = events.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Some((event, _)) => metrics.observe_event(&event),
                        None => break,
                    },
                    _ = shutdown.wait() => break,
                }
            }
            debug!(category = "metrics", "Metrics listener stopped");
        })
    }
}

fn sync_counter(counter: &IntCounter, total: u64) {
    let current = counter.get();
    if total > current {
        counter.inc_by(total - current);
    }
}

/// Bus decorator that counts publishes.
pub struct MeteredBus {
    inner: DynMessageBus,
    metrics: Arc<Metrics>,
}

impl MeteredBus {
    pub fn wrap(inner: DynMessageBus, metrics: Arc<Metrics>) -> DynMessageBus {
        Arc::new(Self { inner, metrics })
    }
}

#[async_trait]
impl MessageBus for MeteredBus {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn subscribe(&self, filter: &str) -> labctl_bus::Result<()> {
        self.inner.subscribe(filter).await
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> labctl_bus::Result<()> {
        let result = self.inner.publish(topic, payload).await;
        self.metrics.record_outbound(result.is_ok());
        result
    }

    fn take_inbound(&self) -> Option<mpsc::Receiver<Message>> {
        self.inner.take_inbound()
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    fn subscriptions(&self) -> Vec<String> {
        self.inner.subscriptions()
    }

    async fn close(&self) -> labctl_bus::Result<()> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labctl_bus::MemoryBus;
    use labctl_plugins::ModuleOutcome;

    #[test]
    fn test_render_contains_recorded_values() {
        let metrics = Metrics::new().unwrap();
        metrics.record_inbound("command");
        metrics.record_dispatch(&DispatchReport {
            topic: "lab/proj/cmd".to_string(),
            outcomes: vec![
                ModuleOutcome {
                    module: "proj".to_string(),
                    outcome: HandlerOutcome::Completed,
                    duration_ms: 3,
                },
                ModuleOutcome {
                    module: "audit".to_string(),
                    outcome: HandlerOutcome::TimedOut,
                    duration_ms: 30_000,
                },
            ],
        });
        metrics.observe_event(&LabEvent::JobFired {
            job_id: "j".to_string(),
            module: "proj".to_string(),
            success: false,
            timestamp: 0,
        });
        metrics.refresh(&GaugeSnapshot {
            devices: DeviceStats {
                total: 3,
                online: 2,
                ..DeviceStats::default()
            },
            locks: LockStats {
                active: 1,
                granted: 5,
                denied: 2,
                ..LockStats::default()
            },
            jobs: 4,
            dead_letters: 0,
        });

        let text = metrics.render().unwrap();
        assert!(text.contains("labctl_messages_inbound_total{kind=\"command\"} 1"));
        assert!(text.contains("labctl_handler_invocations_total{module=\"audit\",outcome=\"timed_out\"} 1"));
        assert!(text.contains("labctl_job_firings_total{outcome=\"failure\"} 1"));
        assert!(text.contains("labctl_devices_online 2"));
        assert!(text.contains("labctl_lock_grants_total 5"));
        assert!(text.contains("labctl_jobs_scheduled 4"));
    }

    #[test]
    fn test_lock_counters_only_move_forward() {
        let metrics = Metrics::new().unwrap();
        let mut snapshot = GaugeSnapshot::default();
        snapshot.locks.granted = 7;
        metrics.refresh(&snapshot);
        snapshot.locks.granted = 7;
        metrics.refresh(&snapshot);
        assert_eq!(metrics.lock_grants.get(), 7);
    }

    #[test]
    fn test_message_kind() {
        let topics = TopicScheme::default();
        assert_eq!(message_kind(&topics, "lab/proj/cmd"), "command");
        assert_eq!(message_kind(&topics, "lab/device/d1/status"), "device");
        assert_eq!(message_kind(&topics, "other/x"), "other");
    }

    #[tokio::test]
    async fn test_metered_bus_counts_publishes() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let bus = MeteredBus::wrap(Arc::new(MemoryBus::new()), metrics.clone());
        bus.publish("lab/x/status", b"{}".to_vec()).await.unwrap();
        assert_eq!(
            metrics.outbound_messages.with_label_values(&["ok"]).get(),
            1
        );
    }
}
