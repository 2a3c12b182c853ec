// src/ingest/scheduler.rs
//! Bounded worker pool for province pulls.
//!
//! Two queues feed the pool: pull-now jobs (admin trigger, staleness, full
//! sync) and recurring ticks. A free worker always takes pull-now work first.
//! A province slug is both the job id and the lock: while a province is
//! queued or running, further jobs for it are dropped.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, gauge};
use serde::Serialize;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;

use crate::config::{RetryPolicy, SchedulerConfig};
use crate::error::IngestResult;
use crate::pipeline::{Pipeline, PullReport};

/// What the pool runs. [`Pipeline`] in production.
#[async_trait]
pub trait ProvincePuller: Send + Sync {
    async fn pull(&self, province_slug: &str) -> IngestResult<PullReport>;
    /// Provinces a full sync covers.
    async fn provinces(&self) -> IngestResult<Vec<String>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Recurring,
    PullNow,
    FullSync,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Recurring => "recurring",
            Self::PullNow => "pull_now",
            Self::FullSync => "full_sync",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub kind: JobKind,
    /// Empty for full sync.
    pub province_slug: String,
    pub reason: String,
    /// 1-based.
    pub attempt: u32,
}

impl Job {
    pub fn pull_now(province_slug: &str, reason: &str) -> Self {
        Self {
            kind: JobKind::PullNow,
            province_slug: province_slug.trim().to_ascii_lowercase(),
            reason: reason.to_string(),
            attempt: 1,
        }
    }

    pub fn recurring(province_slug: &str) -> Self {
        Self {
            kind: JobKind::Recurring,
            province_slug: province_slug.trim().to_ascii_lowercase(),
            reason: "interval".to_string(),
            attempt: 1,
        }
    }

    pub fn full_sync(reason: &str) -> Self {
        Self {
            kind: JobKind::FullSync,
            province_slug: String::new(),
            reason: reason.to_string(),
            attempt: 1,
        }
    }
}

#[derive(Default)]
struct JobState {
    queued: HashSet<String>,
    running: HashSet<String>,
}

struct Shared {
    puller: Arc<dyn ProvincePuller>,
    recurring: RetryPolicy,
    pull_now: RetryPolicy,
    state: Mutex<JobState>,
    urgent_tx: mpsc::UnboundedSender<Job>,
    regular_tx: mpsc::UnboundedSender<Job>,
}

impl Shared {
    /// Queue a job unless its province is already queued or running.
    fn enqueue(&self, job: Job) -> bool {
        if job.kind != JobKind::FullSync {
            let Ok(mut st) = self.state.lock() else {
                return false;
            };
            if st.queued.contains(&job.province_slug) || st.running.contains(&job.province_slug) {
                counter!("scheduler_jobs_total", "kind" => job.kind.as_str(), "outcome" => "deduplicated").increment(1);
                tracing::debug!(
                    target: "scheduler",
                    province = %job.province_slug,
                    kind = job.kind.as_str(),
                    "job dropped, province already queued or running"
                );
                return false;
            }
            st.queued.insert(job.province_slug.clone());
        }
        let tx = match job.kind {
            JobKind::Recurring => &self.regular_tx,
            JobKind::PullNow | JobKind::FullSync => &self.urgent_tx,
        };
        let slug = job.province_slug.clone();
        if tx.send(job).is_err() {
            if let Ok(mut st) = self.state.lock() {
                st.queued.remove(&slug);
            }
            return false;
        }
        true
    }

    fn start(&self, slug: &str) {
        if let Ok(mut st) = self.state.lock() {
            st.queued.remove(slug);
            st.running.insert(slug.to_string());
        }
    }

    fn finish(&self, slug: &str) {
        if let Ok(mut st) = self.state.lock() {
            st.running.remove(slug);
        }
    }

    fn policy(&self, kind: JobKind) -> RetryPolicy {
        match kind {
            JobKind::Recurring => self.recurring,
            JobKind::PullNow | JobKind::FullSync => self.pull_now,
        }
    }
}

/// Cheap, cloneable front door to the pool.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
}

impl SchedulerHandle {
    /// Queue an immediate pull. `false` when deduplicated.
    pub fn pull_now(&self, province_slug: &str, reason: &str) -> bool {
        self.shared.enqueue(Job::pull_now(province_slug, reason))
    }

    pub fn recurring(&self, province_slug: &str) -> bool {
        self.shared.enqueue(Job::recurring(province_slug))
    }

    /// Queue a pull-now for every province with endpoints.
    pub fn full_sync(&self, reason: &str) -> bool {
        self.shared.enqueue(Job::full_sync(reason))
    }

    /// Provinces currently queued or running.
    pub fn busy(&self) -> Vec<String> {
        self.shared
            .state
            .lock()
            .map(|st| {
                let mut v: Vec<String> = st.queued.union(&st.running).cloned().collect();
                v.sort();
                v
            })
            .unwrap_or_default()
    }
}

pub struct Scheduler {
    shared: Arc<Shared>,
    workers: usize,
    urgent_rx: mpsc::UnboundedReceiver<Job>,
    regular_rx: mpsc::UnboundedReceiver<Job>,
}

impl Scheduler {
    pub fn new(puller: Arc<dyn ProvincePuller>, cfg: &SchedulerConfig) -> (Self, SchedulerHandle) {
        let (urgent_tx, urgent_rx) = mpsc::unbounded_channel();
        let (regular_tx, regular_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            puller,
            recurring: cfg.recurring,
            pull_now: cfg.pull_now,
            state: Mutex::new(JobState::default()),
            urgent_tx,
            regular_tx,
        });
        let handle = SchedulerHandle {
            shared: shared.clone(),
        };
        (
            Self {
                shared,
                workers: cfg.workers.max(1),
                urgent_rx,
                regular_rx,
            },
            handle,
        )
    }

    /// Dispatch jobs until `shutdown` flips to `true`. Running pulls are
    /// awaited before returning.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let sem = Arc::new(Semaphore::new(self.workers));
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        tracing::info!(target: "scheduler", workers = self.workers, "scheduler started");

        loop {
            let permit = tokio::select! {
                _ = shutdown.changed() => break,
                p = sem.clone().acquire_owned() => match p {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };
            let job = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                Some(job) = self.urgent_rx.recv() => job,
                Some(job) = self.regular_rx.recv() => job,
                else => break,
            };
            tasks.retain(|t| !t.is_finished());

            if job.kind == JobKind::FullSync {
                drop(permit);
                tasks.push(tokio::spawn(run_full_sync(self.shared.clone(), job)));
                continue;
            }
            self.shared.start(&job.province_slug);
            let shared = self.shared.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = permit;
                run_job(shared, job).await;
            }));
        }

        for t in tasks {
            let _ = t.await;
        }
        tracing::info!(target: "scheduler", "scheduler stopped");
    }
}

async fn run_full_sync(shared: Arc<Shared>, job: Job) {
    match shared.puller.provinces().await {
        Ok(provinces) => {
            let queued = provinces
                .iter()
                .filter(|p| shared.enqueue(Job::pull_now(p, &job.reason)))
                .count();
            counter!("scheduler_jobs_total", "kind" => "full_sync", "outcome" => "ok").increment(1);
            tracing::info!(target: "scheduler", provinces = provinces.len(), queued, "full sync queued");
        }
        Err(e) => {
            counter!("scheduler_jobs_total", "kind" => "full_sync", "outcome" => "failed").increment(1);
            tracing::warn!(target: "scheduler", error = %e, "full sync could not list provinces");
        }
    }
}

async fn run_job(shared: Arc<Shared>, job: Job) {
    gauge!("scheduler_in_flight").increment(1.0);
    let res = shared.puller.pull(&job.province_slug).await;
    gauge!("scheduler_in_flight").decrement(1.0);
    shared.finish(&job.province_slug);

    match res {
        Ok(report) => {
            counter!("scheduler_jobs_total", "kind" => job.kind.as_str(), "outcome" => "ok").increment(1);
            tracing::info!(
                target: "scheduler",
                province = %job.province_slug,
                kind = job.kind.as_str(),
                attempt = job.attempt,
                records = report.records,
                "job done"
            );
        }
        Err(e) => {
            let policy = shared.policy(job.kind);
            let retry = e.is_retryable() && job.attempt < policy.max_attempts;
            counter!(
                "scheduler_jobs_total",
                "kind" => job.kind.as_str(),
                "outcome" => if retry { "retry" } else { "failed" }
            )
            .increment(1);
            tracing::warn!(
                target: "scheduler",
                province = %job.province_slug,
                kind = job.kind.as_str(),
                attempt = job.attempt,
                retry,
                error = %e,
                "job failed"
            );
            if retry {
                let delay = policy.backoff(job.attempt);
                let next = Job {
                    attempt: job.attempt + 1,
                    ..job
                };
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    shared.enqueue(next);
                });
            }
        }
    }
}

/// Queue a recurring pull of every province on a fixed interval. An empty
/// list means every province the puller knows about.
pub fn spawn_recurring(
    handle: SchedulerHandle,
    interval: Duration,
    provinces: Vec<String>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            let targets = if provinces.is_empty() {
                match handle.shared.puller.provinces().await {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!(target: "scheduler", error = %e, "recurring tick could not list provinces");
                        continue;
                    }
                }
            } else {
                provinces.clone()
            };
            let queued = targets.iter().filter(|p| handle.recurring(p)).count();
            tracing::debug!(target: "scheduler", provinces = targets.len(), queued, "recurring tick");
        }
    })
}

#[async_trait]
impl ProvincePuller for Pipeline {
    async fn pull(&self, province_slug: &str) -> IngestResult<PullReport> {
        self.pull_province(province_slug).await
    }

    async fn provinces(&self) -> IngestResult<Vec<String>> {
        self.provinces_with_endpoints().await
    }
}
