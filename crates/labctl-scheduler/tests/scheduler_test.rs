//! Job lifecycle against a real router.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use labctl_bus::{MemoryBus, Message};
use labctl_core::{EventBus, LabEvent, Shutdown, TopicScheme};
use labctl_devices::{DeviceRegistry, HeartbeatConfig};
use labctl_locks::{LockManager, LockManagerConfig};
use labctl_plugins::{
    DeadLetterConfig, DeadLetterQueue, Plugin, PluginContext, PluginRegistry, PluginServices,
    Router, RouterConfig,
};
use labctl_scheduler::{
    CancelOutcome, JobSpec, JobState, SchedulerConfig, SchedulerError, TaskScheduler, Trigger,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Records every call; fails when the payload says so.
struct Recorder {
    name: &'static str,
    calls: Mutex<Vec<(String, Option<String>, serde_json::Value)>>,
    gate: Option<Arc<tokio::sync::Notify>>,
}

impl Recorder {
    fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            calls: Mutex::new(Vec::new()),
            gate: None,
        })
    }

    fn gated(name: &'static str, gate: Arc<tokio::sync::Notify>) -> Arc<Self> {
        Arc::new(Self {
            name,
            calls: Mutex::new(Vec::new()),
            gate: Some(gate),
        })
    }

    fn count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl Plugin for Recorder {
    fn name(&self) -> &str {
        self.name
    }

    fn topic_filters(&self) -> Vec<String> {
        vec![format!("lab/{}/cmd", self.name)]
    }

    async fn handle(&self, ctx: &PluginContext, message: &Message) -> anyhow::Result<()> {
        let body: serde_json::Value = message.parse_json()?;
        self.calls.lock().push((
            message.topic.clone(),
            ctx.job_id().map(str::to_string),
            body.clone(),
        ));
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if body.get("fail").and_then(|v| v.as_bool()).unwrap_or(false) {
            anyhow::bail!("instrument refused the run");
        }
        Ok(())
    }
}

fn setup(modules: Vec<Arc<Recorder>>) -> (Arc<TaskScheduler>, EventBus, Arc<DeadLetterQueue>) {
    setup_with(modules, 4)
}

fn setup_with(
    modules: Vec<Arc<Recorder>>,
    max_concurrent: usize,
) -> (Arc<TaskScheduler>, EventBus, Arc<DeadLetterQueue>) {
    let events = EventBus::new();
    let bus = Arc::new(MemoryBus::new());
    let locks = Arc::new(LockManager::new(LockManagerConfig::default(), events.clone()));
    let devices = Arc::new(DeviceRegistry::new(
        HeartbeatConfig::default(),
        locks.clone(),
        events.clone(),
    ));
    let services = PluginServices {
        devices,
        locks,
        bus: bus.clone(),
        events: events.clone(),
        topics: TopicScheme::default(),
    };
    let registry = Arc::new(PluginRegistry::new());
    for module in modules {
        registry.register(module).unwrap();
    }
    let dlq = Arc::new(DeadLetterQueue::new(
        DeadLetterConfig::default(),
        bus,
        events.clone(),
        TopicScheme::default(),
    ));
    let router = Router::new(RouterConfig::default(), registry, services).with_dead_letters(dlq.clone());
    let config = SchedulerConfig {
        tick_interval_ms: 50,
        max_concurrent,
    };
    (
        Arc::new(TaskScheduler::new(config, router, events.clone())),
        events,
        dlq,
    )
}

#[tokio::test]
async fn test_one_shot_fires_once_and_leaves_the_table() {
    let module = Recorder::new("proj");
    let (scheduler, events, _) = setup(vec![module.clone()]);
    let mut job_events = events.filter().job_events();
    let t0 = Utc::now();

    let job = scheduler
        .schedule_at(
            JobSpec::new("proj", Trigger::once(t0 + ChronoDuration::seconds(2)))
                .with_id("calibrate")
                .with_payload(serde_json::json!({"action": "calibrate"})),
            t0,
        )
        .await
        .unwrap();
    assert_eq!(job.state, JobState::Scheduled);

    assert!(scheduler.run_due_at(t0 + ChronoDuration::seconds(1)).await.is_empty());
    assert_eq!(module.count(), 0);

    let reports = scheduler.run_due_at(t0 + ChronoDuration::seconds(2)).await;
    assert_eq!(reports.len(), 1);
    assert!(reports[0].success);
    assert_eq!(reports[0].state, JobState::Completed);
    assert!(scheduler.get("calibrate").await.is_none());

    let calls = module.calls.lock().clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "lab/proj/cmd");
    assert_eq!(calls[0].1.as_deref(), Some("calibrate"));
    assert_eq!(calls[0].2["action"], "calibrate");

    let names: Vec<&str> = job_events.drain_types();
    assert_eq!(names, vec!["JobScheduled", "JobFired", "JobCompleted"]);
}

#[tokio::test]
async fn test_recurring_job_rescheduled_after_fault() {
    let module = Recorder::new("scope");
    let (scheduler, events, dlq) = setup(vec![module.clone()]);
    let mut faults = events.filter().fault_events();
    let t0 = Utc::now();

    scheduler
        .schedule_at(
            JobSpec::new("scope", Trigger::interval(Duration::from_secs(10)))
                .with_id("poll")
                .with_payload(serde_json::json!({"fail": true})),
            t0,
        )
        .await
        .unwrap();

    let first = scheduler.run_due_at(t0 + ChronoDuration::seconds(10)).await;
    assert_eq!(first.len(), 1);
    assert!(!first[0].success);
    assert!(first[0].error.as_deref().unwrap().contains("refused"));
    assert_eq!(first[0].state, JobState::Scheduled);
    assert_eq!(first[0].next_run_at, Some(t0 + ChronoDuration::seconds(20)));

    let job = scheduler.get("poll").await.unwrap();
    assert_eq!(job.run_count, 1);
    assert!(job.last_error.is_some());

    // Fires again on the next tick of the grid.
    let second = scheduler.run_due_at(t0 + ChronoDuration::seconds(20)).await;
    assert_eq!(second.len(), 1);
    assert_eq!(module.count(), 2);

    let mut saw_fault = false;
    while let Some((event, _)) = faults.try_recv() {
        if let LabEvent::HandlerFault { job_id, .. } = event {
            assert_eq!(job_id.as_deref(), Some("poll"));
            saw_fault = true;
        }
    }
    assert!(saw_fault);
    assert_eq!(dlq.len(), 2);
}

#[tokio::test]
async fn test_schedule_rejections() {
    let (scheduler, _, _) = setup(vec![Recorder::new("proj")]);
    let t0 = Utc::now();

    assert!(matches!(
        scheduler
            .schedule_at(JobSpec::new("ghost", Trigger::interval(Duration::from_secs(5))), t0)
            .await,
        Err(SchedulerError::UnknownModule(_))
    ));
    assert!(matches!(
        scheduler
            .schedule_at(JobSpec::new("proj", Trigger::once(t0 - ChronoDuration::seconds(1))), t0)
            .await,
        Err(SchedulerError::PastOneShot(_))
    ));
    assert!(matches!(
        scheduler
            .schedule_at(JobSpec::new("proj", Trigger::Interval { every_secs: u64::MAX }), t0)
            .await,
        Err(SchedulerError::InvalidTrigger(_))
    ));
    assert!(scheduler.is_empty().await);

    let spec = JobSpec::new("proj", Trigger::interval(Duration::from_secs(5))).with_id("dup");
    scheduler.schedule_at(spec.clone(), t0).await.unwrap();
    let err = scheduler.schedule_at(spec, t0).await.unwrap_err();
    assert_eq!(err, SchedulerError::DuplicateJob("dup".to_string()));
    assert!(matches!(
        labctl_core::Error::from(err),
        labctl_core::Error::AlreadyExists(_)
    ));
}

#[tokio::test]
async fn test_cancel_and_disable() {
    let module = Recorder::new("proj");
    let (scheduler, _, _) = setup(vec![module.clone()]);
    let t0 = Utc::now();
    let every = || Trigger::interval(Duration::from_secs(5));

    scheduler
        .schedule_at(JobSpec::new("proj", every()).with_id("a"), t0)
        .await
        .unwrap();
    scheduler
        .schedule_at(JobSpec::new("proj", every()).with_id("b").disabled(), t0)
        .await
        .unwrap();

    assert_eq!(scheduler.cancel("a").await.unwrap(), CancelOutcome::Cancelled);
    assert!(matches!(
        scheduler.cancel("a").await,
        Err(SchedulerError::JobNotFound(_))
    ));

    assert!(scheduler.run_due_at(t0 + ChronoDuration::seconds(60)).await.is_empty());
    assert_eq!(module.count(), 0);

    scheduler.set_enabled("b", true).await.unwrap();
    let reports = scheduler.run_due_at(t0 + ChronoDuration::seconds(60)).await;
    assert_eq!(reports.len(), 1);
    // Missed ticks are skipped, not replayed.
    assert_eq!(module.count(), 1);
    assert_eq!(reports[0].next_run_at, Some(t0 + ChronoDuration::seconds(65)));
}

#[tokio::test]
async fn test_cancel_while_firing_finishes_run_then_removes() {
    let gate = Arc::new(tokio::sync::Notify::new());
    let module = Recorder::gated("proj", gate.clone());
    let (scheduler, _, _) = setup(vec![module.clone()]);
    let t0 = Utc::now();

    scheduler
        .schedule_at(
            JobSpec::new("proj", Trigger::interval(Duration::from_secs(5))).with_id("long"),
            t0,
        )
        .await
        .unwrap();

    let runner = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run_due_at(t0 + ChronoDuration::seconds(5)).await })
    };

    // Wait until the handler is inside its run.
    for _ in 0..200 {
        if module.count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(scheduler.get("long").await.unwrap().state, JobState::Firing);
    assert_eq!(
        scheduler.cancel("long").await.unwrap(),
        CancelOutcome::AfterCurrentRun
    );

    gate.notify_one();
    let reports = runner.await.unwrap();
    assert_eq!(reports[0].state, JobState::Cancelled);
    assert!(reports[0].success);
    assert!(scheduler.is_empty().await);
}

#[tokio::test]
async fn test_cancel_while_waiting_for_a_slot_skips_the_run() {
    let gate = Arc::new(tokio::sync::Notify::new());
    let slow = Recorder::gated("slow", gate.clone());
    let proj = Recorder::new("proj");
    let (scheduler, events, _) = setup_with(vec![slow.clone(), proj.clone()], 1);
    let mut job_events = events.filter().job_events();
    let t0 = Utc::now();
    let at = t0 + ChronoDuration::seconds(1);

    for (id, module) in [("ja", "slow"), ("jb", "proj")] {
        scheduler
            .schedule_at(JobSpec::new(module, Trigger::once(at)).with_id(id), t0)
            .await
            .unwrap();
    }

    let runner = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run_due_at(at).await })
    };
    for _ in 0..200 {
        if slow.count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(scheduler.get("jb").await.unwrap().state, JobState::Due);
    assert_eq!(scheduler.cancel("jb").await.unwrap(), CancelOutcome::Cancelled);
    assert!(scheduler.get("jb").await.is_none());

    gate.notify_one();
    let reports = runner.await.unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].job_id, "ja");
    assert_eq!(proj.count(), 0);
    assert!(scheduler.is_empty().await);

    let fired: Vec<String> = std::iter::from_fn(|| job_events.try_recv())
        .filter_map(|(event, _)| match event {
            LabEvent::JobFired { job_id, .. } => Some(job_id),
            _ => None,
        })
        .collect();
    assert_eq!(fired, vec!["ja".to_string()]);
}

#[tokio::test]
async fn test_slow_job_does_not_hold_back_others() {
    let gate = Arc::new(tokio::sync::Notify::new());
    let slow = Recorder::gated("slow", gate.clone());
    let fast = Recorder::new("fast");
    let (scheduler, _, _) = setup(vec![slow.clone(), fast.clone()]);

    for module in ["slow", "fast"] {
        scheduler
            .schedule(JobSpec::new(module, Trigger::interval(Duration::from_secs(1))).with_id(module))
            .await
            .unwrap();
    }

    let shutdown = Shutdown::new();
    let handle = scheduler.start(shutdown.listener());
    tokio::time::sleep(Duration::from_millis(4500)).await;

    assert_eq!(slow.count(), 1);
    assert!(fast.count() >= 3, "fast job ran {} times", fast.count());
    assert_eq!(scheduler.get("slow").await.unwrap().state, JobState::Firing);

    gate.notify_one();
    shutdown.trigger();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_list_ordered_by_next_run() {
    let (scheduler, _, _) = setup(vec![Recorder::new("proj")]);
    let t0 = Utc::now();
    for (id, secs) in [("c", 30), ("a", 10), ("b", 10)] {
        scheduler
            .schedule_at(
                JobSpec::new("proj", Trigger::interval(Duration::from_secs(secs))).with_id(id),
                t0,
            )
            .await
            .unwrap();
    }
    let ids: Vec<String> = scheduler.list().await.into_iter().map(|j| j.job_id).collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_timer_loop_fires_and_stops() {
    let module = Recorder::new("proj");
    let (scheduler, _, _) = setup(vec![module.clone()]);
    scheduler
        .schedule(JobSpec::new(
            "proj",
            Trigger::once(Utc::now() + ChronoDuration::milliseconds(200)),
        ))
        .await
        .unwrap();

    let shutdown = Shutdown::new();
    let handle = scheduler.start(shutdown.listener());
    assert!(scheduler.is_running());

    tokio::time::timeout(Duration::from_secs(5), async {
        while !scheduler.is_empty().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(module.count(), 1);

    shutdown.trigger();
    handle.await.unwrap();
    assert!(!scheduler.is_running());
}

trait DrainTypes {
    fn drain_types(&mut self) -> Vec<&'static str>;
}

impl<F: Fn(&LabEvent) -> bool + Send> DrainTypes for labctl_core::eventbus::FilteredReceiver<F> {
    fn drain_types(&mut self) -> Vec<&'static str> {
        let mut names = Vec::new();
        while let Some((event, _)) = self.try_recv() {
            names.push(event.type_name());
        }
        names
    }
}
