//! The job table and its timer loop.

use crate::error::{Result, SchedulerError};
use crate::job::{CancelOutcome, FireReport, JobSpec, JobState, ScheduledJob};
use crate::SchedulerConfig;
use chrono::{DateTime, Utc};
use cron::Schedule;
use labctl_bus::Message;
use labctl_core::envelope::validate_module_name;
use labctl_core::{EventBus, LabEvent, ShutdownListener};
use labctl_plugins::Router;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

struct JobEntry {
    job: ScheduledJob,
    schedule: Option<Schedule>,
    cancel_requested: bool,
}

/// Fires module handlers on timers.
///
/// Firing goes through [`Router::invoke_for_job`], so a job run is isolated
/// exactly like a routed message: faults are logged, published as
/// `HandlerFault` and dead-lettered, and recurring jobs are rescheduled
/// regardless of the outcome. The scheduler never takes locks itself.
pub struct TaskScheduler {
    config: SchedulerConfig,
    router: Router,
    events: EventBus,
    jobs: RwLock<HashMap<String, JobEntry>>,
    permits: Arc<Semaphore>,
    running: AtomicBool,
}

impl TaskScheduler {
    pub fn new(config: SchedulerConfig, router: Router, events: EventBus) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            config,
            router,
            events,
            jobs: RwLock::new(HashMap::new()),
            permits,
            running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Add a job.
    pub async fn schedule(&self, spec: JobSpec) -> Result<ScheduledJob> {
        self.schedule_at(spec, Utc::now()).await
    }

    /// Add a job as if the current time were `now`.
    pub async fn schedule_at(&self, spec: JobSpec, now: DateTime<Utc>) -> Result<ScheduledJob> {
        if validate_module_name(&spec.module).is_err() || !self.router.registry().contains(&spec.module) {
            return Err(SchedulerError::UnknownModule(spec.module));
        }
        let schedule = spec.trigger.compile()?;
        let next_run_at = spec.trigger.first_run(schedule.as_ref(), now)?;
        let job_id = spec
            .job_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job_id) {
            return Err(SchedulerError::DuplicateJob(job_id));
        }
        let job = ScheduledJob {
            name: spec.name.unwrap_or_else(|| job_id.clone()),
            job_id: job_id.clone(),
            trigger: spec.trigger,
            module: spec.module,
            payload: spec.payload,
            next_run_at,
            enabled: spec.enabled,
            state: JobState::Scheduled,
            created_at: now,
            last_run_at: None,
            run_count: 0,
            last_error: None,
        };
        jobs.insert(
            job_id.clone(),
            JobEntry {
                job: job.clone(),
                schedule,
                cancel_requested: false,
            },
        );
        drop(jobs);

        info!(
            category = "scheduler",
            job_id = %job.job_id,
            module = %job.module,
            trigger = %job.trigger,
            next_run_at = %job.next_run_at,
            "Job scheduled"
        );
        self.events.publish(LabEvent::JobScheduled {
            job_id: job.job_id.clone(),
            module: job.module.clone(),
            next_run_at: job.next_run_at.timestamp(),
            timestamp: now.timestamp(),
        });
        Ok(job)
    }

    /// Cancel a job. A job whose handler is already running finishes that run
    /// first; a due job still waiting for a firing slot never runs.
    pub async fn cancel(&self, job_id: &str) -> Result<CancelOutcome> {
        let mut jobs = self.jobs.write().await;
        let entry = jobs
            .get_mut(job_id)
            .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?;

        if entry.job.state == JobState::Firing {
            entry.cancel_requested = true;
            debug!(category = "scheduler", job_id, "Cancel deferred until run completes");
            return Ok(CancelOutcome::AfterCurrentRun);
        }
        jobs.remove(job_id);
        drop(jobs);

        info!(category = "scheduler", job_id, "Job cancelled");
        self.events.publish(LabEvent::JobCancelled {
            job_id: job_id.to_string(),
            timestamp: Utc::now().timestamp(),
        });
        Ok(CancelOutcome::Cancelled)
    }

    pub async fn set_enabled(&self, job_id: &str, enabled: bool) -> Result<ScheduledJob> {
        let mut jobs = self.jobs.write().await;
        let entry = jobs
            .get_mut(job_id)
            .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?;
        entry.job.enabled = enabled;
        Ok(entry.job.clone())
    }

    pub async fn get(&self, job_id: &str) -> Option<ScheduledJob> {
        self.jobs.read().await.get(job_id).map(|e| e.job.clone())
    }

    /// All jobs ordered by next run, then id.
    pub async fn list(&self) -> Vec<ScheduledJob> {
        let mut jobs: Vec<ScheduledJob> = self
            .jobs
            .read()
            .await
            .values()
            .map(|e| e.job.clone())
            .collect();
        jobs.sort_by(|a, b| {
            a.next_run_at
                .cmp(&b.next_run_at)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        jobs
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// One timer pass: fire every enabled job whose time has come and wait
    /// for the runs to finish.
    pub async fn run_due_at(&self, now: DateTime<Utc>) -> Vec<FireReport> {
        let due = self.take_due(now).await;
        let runs = due.into_iter().map(|job| self.run_job(job, Some(now)));
        futures::future::join_all(runs)
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    /// Mark due jobs and run each on its own task, so a slow handler never
    /// holds back the next pass. Returns how many runs were started.
    pub async fn spawn_due_at(self: &Arc<Self>, now: DateTime<Utc>) -> usize {
        let due = self.take_due(now).await;
        let started = due.len();
        for job in due {
            let scheduler = self.clone();
            tokio::spawn(async move {
                scheduler.run_job(job, None).await;
            });
        }
        started
    }

    async fn take_due(&self, now: DateTime<Utc>) -> Vec<ScheduledJob> {
        let mut jobs = self.jobs.write().await;
        let mut due: Vec<&mut JobEntry> = jobs
            .values_mut()
            .filter(|e| e.job.enabled && e.job.state == JobState::Scheduled && e.job.next_run_at <= now)
            .collect();
        due.sort_by(|a, b| {
            a.job
                .next_run_at
                .cmp(&b.job.next_run_at)
                .then_with(|| a.job.job_id.cmp(&b.job.job_id))
        });
        let due: Vec<ScheduledJob> = due
            .into_iter()
            .map(|e| {
                e.job.state = JobState::Due;
                e.job.clone()
            })
            .collect();
        if !due.is_empty() {
            debug!(category = "scheduler", due = due.len(), "Jobs due");
        }
        due
    }

    /// Wait for a firing slot, then fire. `finished_at` of `None` means the
    /// wall clock at completion.
    async fn run_job(&self, job: ScheduledJob, finished_at: Option<DateTime<Utc>>) -> Option<FireReport> {
        let _permit = self.permits.clone().acquire_owned().await.ok();
        if !self.begin_firing(&job.job_id).await {
            debug!(category = "scheduler", job_id = %job.job_id, "Due job cancelled before firing");
            return None;
        }
        let outcome = self.fire(&job).await;
        let finished_at = finished_at.unwrap_or_else(Utc::now);
        Some(self.finish(job, outcome, finished_at).await)
    }

    /// `Due` to `Firing`. False when the job was cancelled while it waited.
    async fn begin_firing(&self, job_id: &str) -> bool {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(job_id) {
            Some(entry) if entry.job.state == JobState::Due => {
                entry.job.state = JobState::Firing;
                true
            }
            _ => false,
        }
    }

    async fn fire(&self, job: &ScheduledJob) -> std::result::Result<(), String> {
        let topics = &self.router.services().topics;
        let topic = topics.command_topic(&job.module);
        match serde_json::to_vec(&job.payload) {
            Ok(payload) => {
                let message = Message::new(topic, payload);
                match self.router.invoke_for_job(&job.module, message, &job.job_id).await {
                    Ok(result) => match result.outcome.error_message() {
                        None => Ok(()),
                        Some(e) => Err(e),
                    },
                    Err(e) => Err(e.to_string()),
                }
            }
            Err(e) => Err(format!("payload encoding failed: {e}")),
        }
    }

    async fn finish(
        &self,
        job: ScheduledJob,
        outcome: std::result::Result<(), String>,
        now: DateTime<Utc>,
    ) -> FireReport {
        let success = outcome.is_ok();
        let error = outcome.err();
        if let Some(e) = &error {
            error!(
                category = "scheduler",
                job_id = %job.job_id,
                module = %job.module,
                error = %e,
                "Scheduled run failed"
            );
        }
        self.events.publish(LabEvent::JobFired {
            job_id: job.job_id.clone(),
            module: job.module.clone(),
            success,
            timestamp: now.timestamp(),
        });

        let (state, next_run_at) = {
            let mut jobs = self.jobs.write().await;
            match jobs.get_mut(&job.job_id) {
                None => (JobState::Cancelled, None),
                Some(entry) => {
                    entry.job.last_run_at = Some(now);
                    entry.job.run_count += 1;
                    entry.job.last_error = error.clone();
                    let next = if entry.cancel_requested {
                        None
                    } else {
                        entry
                            .job
                            .trigger
                            .next_after_fire(entry.schedule.as_ref(), job.next_run_at, now)
                    };
                    match next {
                        Some(next) => {
                            entry.job.next_run_at = next;
                            entry.job.state = JobState::Scheduled;
                            (JobState::Scheduled, Some(next))
                        }
                        None => {
                            let state = if entry.cancel_requested {
                                JobState::Cancelled
                            } else {
                                JobState::Completed
                            };
                            jobs.remove(&job.job_id);
                            (state, None)
                        }
                    }
                }
            }
        };

        match state {
            JobState::Completed => {
                info!(category = "scheduler", job_id = %job.job_id, "Job completed");
                self.events.publish(LabEvent::JobCompleted {
                    job_id: job.job_id.clone(),
                    timestamp: now.timestamp(),
                });
            }
            JobState::Cancelled => {
                info!(category = "scheduler", job_id = %job.job_id, "Job cancelled after run");
                self.events.publish(LabEvent::JobCancelled {
                    job_id: job.job_id.clone(),
                    timestamp: now.timestamp(),
                });
            }
            _ => {
                debug!(
                    category = "scheduler",
                    job_id = %job.job_id,
                    next_run_at = ?next_run_at,
                    "Job rescheduled"
                );
            }
        }

        FireReport {
            job_id: job.job_id,
            module: job.module,
            scheduled_for: job.next_run_at,
            success,
            error,
            state,
            next_run_at,
        }
    }

    /// Spawn the timer loop. It stops when `shutdown` fires.
    pub fn start(self: &Arc<Self>, mut shutdown: ShutdownListener) -> JoinHandle<()> {
        let scheduler = self.clone();
        let tick = self.config.tick_interval();
        self.running.store(true, Ordering::SeqCst);
        info!(category = "scheduler", tick_ms = tick.as_millis() as u64, "Scheduler started");

        tokio::spawn(async move {
            let mut ticker = interval(tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        scheduler.spawn_due_at(Utc::now()).await;
                    }
                    _ = shutdown.wait() => break,
                }
            }
            scheduler.running.store(false, Ordering::SeqCst);
            info!(category = "scheduler", "Scheduler stopped");
        })
    }
}
