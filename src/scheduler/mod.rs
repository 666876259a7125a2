//! Job scheduler
//!
//! A queue of project jobs plus a bounded pool of workers. Each worker claims
//! one waiting job at a time, runs the `JobProcessor` on it under a lease,
//! and settles the outcome:
//! - success: completed
//! - failure with attempts left: back to waiting after exponential backoff
//! - failure without attempts left: failed, reported to the dead-letter sink
//!
//! A refill task asks the backlog provider for more projects whenever
//! `waiting + active <= low_water_mark`, after every finished job and on a
//! fixed poll interval.
//!
//! With a `JobJournal` attached every state change is written through and
//! `start` reloads the journal, so attempts and failures survive restarts.

pub mod job;
pub mod journal;

pub use job::{Job, JobState, SchedulerStats};
pub use journal::JobJournal;

use async_trait::async_trait;
use chrono::Utc;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::any::Any;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::backlog::BacklogProvider;
use crate::config::SchedulerConfig;
use crate::events::{EventDispatcher, JudgeEvent};
use crate::storage::StoreError;
use crate::types::Project;

use job::Lease;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("Concurrency must be at least 1 (got {0})")]
    InvalidConcurrency(usize),
    #[error("Job {0} not found")]
    NotFound(String),
    #[error("Job {id} is {state:?}, expected {expected:?}")]
    InvalidState {
        id: String,
        state: JobState,
        expected: JobState,
    },
    #[error("Job {0} is active and cannot be removed")]
    JobActive(String),
}

/// Work executed for each job
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, ctx: JobContext) -> anyhow::Result<Value>;

    /// Called once a job has failed for good, before refill runs again
    async fn dead_lettered(&self, _job: &Job) {}
}

/// Handed to the processor for one attempt of one job
pub struct JobContext {
    pub job_id: String,
    pub project: Project,
    /// 1-based attempt number
    pub attempt: u32,
    owner: Option<(Arc<Inner>, u64)>,
}

impl JobContext {
    /// Context not attached to any scheduler; progress reports are dropped
    pub fn detached(project: Project) -> Self {
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            project,
            attempt: 1,
            owner: None,
        }
    }

    pub fn short_id(&self) -> &str {
        &self.job_id[..8.min(self.job_id.len())]
    }

    /// Report progress and renew the lease.
    ///
    /// Returns false once this attempt no longer owns the job (lease
    /// reclaimed or job removed).
    pub fn report_progress(&self, percent: u8, message: impl Into<String>) -> bool {
        match &self.owner {
            Some((inner, token)) => inner.progress(&self.job_id, Some(*token), percent, Some(message.into())),
            None => true,
        }
    }
}

#[derive(Default)]
struct QueueState {
    jobs: IndexMap<String, Job>,
    waiting: VecDeque<String>,
}

impl QueueState {
    fn count(&self, state: JobState) -> usize {
        self.jobs.values().filter(|j| j.state == state).count()
    }
}

/// Claimed job handed from the queue to a worker
struct Ticket {
    job_id: String,
    project: Project,
    attempt: u32,
    token: u64,
}

enum Claim {
    Job(Ticket),
    /// Nothing claimable; wake at this instant if a delayed job becomes due
    Idle(Option<Instant>),
}

struct Pool {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Pool {
    async fn stop(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!("Scheduler task ended abnormally: {}", e);
            }
        }
    }
}

#[derive(Default)]
struct Runtime {
    workers: Option<Pool>,
    background: Option<Pool>,
    restored: bool,
}

struct Inner {
    config: SchedulerConfig,
    processor: Arc<dyn JobProcessor>,
    backlog: Option<Arc<dyn BacklogProvider>>,
    journal: Option<Arc<JobJournal>>,
    events: EventDispatcher,
    state: Mutex<QueueState>,
    concurrency: AtomicUsize,
    paused: AtomicBool,
    running: AtomicBool,
    lease_seq: AtomicU64,
    /// Wakes idle workers: new job, resume, freed slot
    work: Notify,
    refill_wake: Notify,
    refill_lock: tokio::sync::Mutex<()>,
    runtime: tokio::sync::Mutex<Runtime>,
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl Inner {
    fn lease_duration(&self) -> Duration {
        self.config.lease()
    }

    fn record(&self, job: &Job) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.save(job) {
                warn!("Failed to journal job {}: {}", job.short_id(), e);
            }
        }
    }

    fn forget(&self, job_id: &str) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.remove(job_id) {
                warn!("Failed to drop journaled job {}: {}", &job_id[..8.min(job_id.len())], e);
            }
        }
    }

    fn push_job(&self, state: &mut QueueState, project: Project) -> String {
        let job = Job::new(project, self.config.max_attempts);
        let id = job.id.clone();
        debug!("Enqueued job {} for project {}", job.short_id(), job.project.short_id());
        self.record(&job);
        state.waiting.push_back(id.clone());
        state.jobs.insert(id.clone(), job);
        id
    }

    fn claim_next(&self) -> Claim {
        if self.paused.load(Ordering::SeqCst) {
            return Claim::Idle(None);
        }

        let mut guard = self.state.lock();
        let QueueState { jobs, waiting } = &mut *guard;

        let active = jobs.values().filter(|j| j.state == JobState::Active).count();
        if active >= self.concurrency.load(Ordering::SeqCst) {
            return Claim::Idle(None);
        }

        let now = Instant::now();
        let mut next_due: Option<Instant> = None;
        let position = waiting.iter().position(|id| match jobs.get(id) {
            Some(job) if job.state == JobState::Waiting => {
                if job.is_available(now) {
                    true
                } else {
                    next_due = job.available_at.into_iter().chain(next_due).min();
                    false
                }
            }
            // Stale entry; dropped below once found
            _ => true,
        });

        let Some(position) = position else {
            return Claim::Idle(next_due);
        };
        let Some(id) = waiting.remove(position) else {
            return Claim::Idle(next_due);
        };
        let Some(job) = jobs.get_mut(&id).filter(|j| j.state == JobState::Waiting) else {
            // Removed or already running; let the worker look again
            return Claim::Idle(Some(now));
        };

        let token = self.lease_seq.fetch_add(1, Ordering::SeqCst) + 1;
        job.set_state(JobState::Active);
        job.attempts += 1;
        job.progress = 0;
        job.progress_message = None;
        job.started_at = Some(Utc::now());
        job.available_at = None;
        job.lease = Some(Lease {
            token,
            expires_at: now + self.lease_duration(),
        });
        self.record(job);

        Claim::Job(Ticket {
            job_id: id,
            project: job.project.clone(),
            attempt: job.attempts,
            token,
        })
    }

    /// Failed attempt: back to waiting with backoff, or terminal failure.
    /// Returns the job when it was dead-lettered.
    fn settle_failure(&self, state: &mut QueueState, id: &str, error: String) -> Option<Job> {
        let QueueState { jobs, waiting } = state;
        let job = jobs.get_mut(id)?;
        job.lease = None;
        job.last_error = Some(error.clone());

        if job.has_attempts_left() {
            let delay = self.config.retry_policy().delay_for(job.attempts);
            job.set_state(JobState::Waiting);
            job.available_at = Some(Instant::now() + delay);
            waiting.push_back(id.to_string());
            warn!(
                "Job {} failed (attempt {}/{}), retrying in {:?}: {}",
                job.short_id(),
                job.attempts,
                job.max_attempts,
                delay,
                error
            );
            self.events.emit(JudgeEvent::JobFailed {
                job_id: job.id.clone(),
                project_id: job.project.id.clone(),
                attempt: job.attempts,
                error,
                will_retry: true,
            });
            self.record(job);
            None
        } else {
            let failed_at = Utc::now();
            job.set_state(JobState::Failed);
            job.finished_at = Some(failed_at);
            error!(
                "Job {} for project {} failed permanently after {} attempts: {}",
                job.short_id(),
                job.project.short_id(),
                job.attempts,
                error
            );
            self.events.emit(JudgeEvent::JobFailed {
                job_id: job.id.clone(),
                project_id: job.project.id.clone(),
                attempt: job.attempts,
                error: error.clone(),
                will_retry: false,
            });
            self.events.emit(JudgeEvent::DeadLetter {
                job_id: job.id.clone(),
                project_id: job.project.id.clone(),
                error,
                failed_at,
            });
            self.record(job);
            Some(job.clone())
        }
    }

    /// Settle one attempt. Returns the job when it was dead-lettered.
    fn finish(&self, ticket: &Ticket, outcome: Result<Value, String>) -> Option<Job> {
        let mut state = self.state.lock();
        let current = state
            .jobs
            .get(&ticket.job_id)
            .map(|j| (j.state, j.lease_token()));
        if current != Some((JobState::Active, Some(ticket.token))) {
            warn!(
                "Discarding stale result for job {} (attempt {})",
                &ticket.job_id[..8.min(ticket.job_id.len())],
                ticket.attempt
            );
            return None;
        }

        let dead = match outcome {
            Ok(value) => {
                if let Some(job) = state.jobs.get_mut(&ticket.job_id) {
                    job.lease = None;
                    job.set_state(JobState::Completed);
                    job.progress = 100;
                    job.finished_at = Some(Utc::now());
                    job.result = Some(value);
                    info!(
                        "Job {} for project {} completed (attempt {})",
                        job.short_id(),
                        job.project.short_id(),
                        job.attempts
                    );
                    self.record(job);
                }
                None
            }
            Err(error) => self.settle_failure(&mut state, &ticket.job_id, error),
        };
        self.trim_retention(&mut state);
        dead
    }

    /// Keep at most `keep_completed` / `keep_failed` finished jobs, dropping the oldest
    fn trim_retention(&self, state: &mut QueueState) {
        for (kind, keep) in [
            (JobState::Completed, self.config.keep_completed),
            (JobState::Failed, self.config.keep_failed),
        ] {
            let mut finished: Vec<_> = state
                .jobs
                .values()
                .enumerate()
                .filter(|(_, j)| j.state == kind)
                .map(|(index, j)| (j.finished_at.unwrap_or(j.created_at), index, j.id.clone()))
                .collect();
            if finished.len() <= keep {
                continue;
            }
            finished.sort();
            let excess = finished.len() - keep;
            for (_, _, id) in finished.into_iter().take(excess) {
                state.jobs.shift_remove(&id);
                self.forget(&id);
            }
            debug!("Dropped {} old {:?} jobs", excess, kind);
        }
    }

    fn progress(&self, job_id: &str, token: Option<u64>, percent: u8, message: Option<String>) -> bool {
        let mut state = self.state.lock();
        let Some(job) = state.jobs.get_mut(job_id) else {
            return false;
        };
        if job.state != JobState::Active {
            return false;
        }
        if token.is_some() && job.lease_token() != token {
            return false;
        }
        job.progress = percent.min(100);
        if message.is_some() {
            job.progress_message = message;
        }
        if let Some(lease) = job.lease.as_mut() {
            lease.expires_at = Instant::now() + self.config.lease();
        }
        true
    }

    /// Return active jobs whose lease ran out to the queue. Returns the
    /// reclaimed count and the jobs that ran out of attempts.
    fn reclaim_expired_leases(&self) -> (usize, Vec<Job>) {
        let now = Instant::now();
        let mut state = self.state.lock();
        let expired: Vec<String> = state
            .jobs
            .values()
            .filter(|j| j.state == JobState::Active && j.lease.is_some_and(|l| l.expires_at <= now))
            .map(|j| j.id.clone())
            .collect();

        let mut dead = Vec::new();
        for id in &expired {
            warn!("Lease expired for job {}; reclaiming", &id[..8.min(id.len())]);
            dead.extend(self.settle_failure(&mut state, id, "lease expired".to_string()));
        }
        drop(state);

        if !expired.is_empty() {
            self.work.notify_waiters();
        }
        (expired.len(), dead)
    }

    /// Reload journaled jobs. An attempt that was running when the process
    /// died counts as a failed attempt. Returns the restored count and the
    /// jobs that ran out of attempts.
    fn restore(&self) -> Result<(usize, Vec<Job>), StoreError> {
        let Some(journal) = &self.journal else {
            return Ok((0, Vec::new()));
        };
        let journaled = journal.load()?;

        let mut state = self.state.lock();
        let mut restored = 0;
        let mut interrupted = Vec::new();
        for mut job in journaled {
            if state.jobs.contains_key(&job.id) {
                continue;
            }
            job.lease = None;
            job.available_at = None;
            match job.state {
                JobState::Waiting => state.waiting.push_back(job.id.clone()),
                JobState::Active => interrupted.push(job.id.clone()),
                JobState::Completed | JobState::Failed => {}
            }
            state.jobs.insert(job.id.clone(), job);
            restored += 1;
        }

        let mut dead = Vec::new();
        for id in &interrupted {
            warn!("Job {} was running at shutdown", &id[..8.min(id.len())]);
            dead.extend(self.settle_failure(&mut state, id, "interrupted by restart".to_string()));
        }
        Ok((restored, dead))
    }

    async fn report_dead(&self, jobs: Vec<Job>) {
        for job in jobs {
            self.processor.dead_lettered(&job).await;
        }
    }

    fn below_low_water_mark(&self) -> bool {
        let state = self.state.lock();
        let queued = state.count(JobState::Waiting) + state.count(JobState::Active);
        queued <= self.config.low_water_mark
    }

    /// Enqueue projects not already waiting, active or dead-lettered.
    /// Failed jobs come back only through `retry_failed`.
    fn enqueue_fresh(&self, projects: Vec<Project>) -> usize {
        let mut state = self.state.lock();
        let mut queued: HashSet<String> = state
            .jobs
            .values()
            .filter(|j| j.state.is_queued() || j.state == JobState::Failed)
            .map(|j| j.project.id.clone())
            .collect();

        let mut added = 0;
        for project in projects {
            if queued.insert(project.id.clone()) {
                self.push_job(&mut state, project);
                added += 1;
            }
        }
        added
    }

    async fn refill(&self) -> usize {
        let Some(backlog) = &self.backlog else {
            return 0;
        };
        let Ok(_guard) = self.refill_lock.try_lock() else {
            debug!("Refill already in progress");
            return 0;
        };
        if !self.below_low_water_mark() {
            return 0;
        }

        let projects = match backlog.eligible_projects().await {
            Ok(projects) => projects,
            Err(e) => {
                error!("Backlog refill failed: {:#}", e);
                return 0;
            }
        };

        let offered = projects.len();
        let added = self.enqueue_fresh(projects);
        if added > 0 {
            info!("Refill queued {} new jobs ({} offered)", added, offered);
            self.work.notify_waiters();
        }
        added
    }

    async fn execute(self: &Arc<Self>, ticket: Ticket) {
        info!(
            "Job {} started for project {} (attempt {})",
            &ticket.job_id[..8.min(ticket.job_id.len())],
            ticket.project.short_id(),
            ticket.attempt
        );

        let ctx = JobContext {
            job_id: ticket.job_id.clone(),
            project: ticket.project.clone(),
            attempt: ticket.attempt,
            owner: Some((Arc::clone(self), ticket.token)),
        };
        let processor = Arc::clone(&self.processor);

        // Own task, so a panicking processor fails the job instead of the worker
        let outcome = match tokio::spawn(async move { processor.process(ctx).await }).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(format!("{:#}", e)),
            Err(e) if e.is_panic() => Err(format!("processor panicked: {}", panic_message(e.into_panic()))),
            Err(e) => Err(format!("processor task aborted: {}", e)),
        };

        if let Some(dead) = self.finish(&ticket, outcome) {
            self.report_dead(vec![dead]).await;
        }
        self.work.notify_waiters();
        self.refill_wake.notify_one();
    }
}

async fn worker_loop(inner: Arc<Inner>, worker: usize, mut shutdown: watch::Receiver<bool>) {
    debug!("Worker {} started", worker);
    loop {
        if *shutdown.borrow() {
            break;
        }

        let notified = inner.work.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        match inner.claim_next() {
            Claim::Job(ticket) => inner.execute(ticket).await,
            Claim::Idle(wake_at) => {
                let due = async move {
                    match wake_at {
                        Some(at) => sleep_until(at).await,
                        None => std::future::pending::<()>().await,
                    }
                };
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = &mut notified => {}
                    _ = due => {}
                }
            }
        }
    }
    debug!("Worker {} stopped", worker);
}

async fn refill_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(Duration::from_secs(inner.config.refill_interval_secs.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => { inner.refill().await; }
            _ = inner.refill_wake.notified() => { inner.refill().await; }
        }
    }
}

async fn lease_monitor(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(Duration::from_secs(inner.config.lease_check_interval_secs.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let (reclaimed, dead) = inner.reclaim_expired_leases();
                if reclaimed > 0 {
                    warn!("Reclaimed {} jobs with expired leases", reclaimed);
                }
                inner.report_dead(dead).await;
            }
        }
    }
}

pub struct SchedulerBuilder {
    config: SchedulerConfig,
    processor: Arc<dyn JobProcessor>,
    backlog: Option<Arc<dyn BacklogProvider>>,
    journal: Option<Arc<JobJournal>>,
    events: EventDispatcher,
}

impl SchedulerBuilder {
    pub fn backlog(mut self, backlog: Arc<dyn BacklogProvider>) -> Self {
        self.backlog = Some(backlog);
        self
    }

    /// Persist jobs; `start` reloads whatever the journal holds
    pub fn journal(mut self, journal: Arc<JobJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn events(mut self, events: EventDispatcher) -> Self {
        self.events = events;
        self
    }

    pub fn build(self) -> JobScheduler {
        let concurrency = self.config.concurrency.max(1);
        JobScheduler {
            inner: Arc::new(Inner {
                config: self.config,
                processor: self.processor,
                backlog: self.backlog,
                journal: self.journal,
                events: self.events,
                state: Mutex::new(QueueState::default()),
                concurrency: AtomicUsize::new(concurrency),
                paused: AtomicBool::new(false),
                running: AtomicBool::new(false),
                lease_seq: AtomicU64::new(0),
                work: Notify::new(),
                refill_wake: Notify::new(),
                refill_lock: tokio::sync::Mutex::new(()),
                runtime: tokio::sync::Mutex::new(Runtime::default()),
            }),
        }
    }
}

/// Bounded-concurrency job scheduler with explicit `start`/`stop` lifecycle
#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<Inner>,
}

impl JobScheduler {
    pub fn builder(config: SchedulerConfig, processor: Arc<dyn JobProcessor>) -> SchedulerBuilder {
        SchedulerBuilder {
            config,
            processor,
            backlog: None,
            journal: None,
            events: EventDispatcher::disabled(),
        }
    }

    pub fn new(config: SchedulerConfig, processor: Arc<dyn JobProcessor>) -> Self {
        Self::builder(config, processor).build()
    }

    fn spawn_workers(&self, count: usize) -> Pool {
        let (shutdown, rx) = watch::channel(false);
        let handles = (0..count)
            .map(|worker| tokio::spawn(worker_loop(Arc::clone(&self.inner), worker, rx.clone())))
            .collect();
        Pool { shutdown, handles }
    }

    fn spawn_background(&self) -> Pool {
        let (shutdown, rx) = watch::channel(false);
        let handles = vec![
            tokio::spawn(refill_loop(Arc::clone(&self.inner), rx.clone())),
            tokio::spawn(lease_monitor(Arc::clone(&self.inner), rx)),
        ];
        Pool { shutdown, handles }
    }

    /// Start workers, refill and lease monitoring. No-op when running.
    /// The first start reloads the journal, if any.
    pub async fn start(&self) {
        let mut runtime = self.inner.runtime.lock().await;
        if self.inner.running.load(Ordering::SeqCst) {
            return;
        }
        if !runtime.restored {
            runtime.restored = true;
            match self.inner.restore() {
                Ok((0, _)) => {}
                Ok((restored, dead)) => {
                    info!("Restored {} journaled jobs", restored);
                    self.inner.report_dead(dead).await;
                }
                Err(e) => error!("Failed to restore job journal: {}", e),
            }
        }
        let concurrency = self.inner.concurrency.load(Ordering::SeqCst);
        runtime.workers = Some(self.spawn_workers(concurrency));
        runtime.background = Some(self.spawn_background());
        self.inner.running.store(true, Ordering::SeqCst);
        info!("Scheduler started with concurrency {}", concurrency);
    }

    /// Stop taking work and wait for in-flight jobs to finish
    pub async fn stop(&self) {
        let mut runtime = self.inner.runtime.lock().await;
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Scheduler stopping; waiting for in-flight jobs");
        if let Some(background) = runtime.background.take() {
            background.stop().await;
        }
        if let Some(workers) = runtime.workers.take() {
            workers.stop().await;
        }
        info!("Scheduler stopped");
    }

    /// Resize the worker pool. In-flight jobs finish before the new size applies.
    pub async fn set_concurrency(&self, concurrency: usize) -> Result<(), SchedulerError> {
        if concurrency < 1 {
            return Err(SchedulerError::InvalidConcurrency(concurrency));
        }
        let mut runtime = self.inner.runtime.lock().await;
        let previous = self.inner.concurrency.swap(concurrency, Ordering::SeqCst);

        if self.inner.running.load(Ordering::SeqCst) {
            if let Some(workers) = runtime.workers.take() {
                workers.stop().await;
            }
            runtime.workers = Some(self.spawn_workers(concurrency));
        }
        info!("Scheduler concurrency changed {} -> {}", previous, concurrency);
        Ok(())
    }

    pub fn concurrency(&self) -> usize {
        self.inner.concurrency.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Stop claiming new jobs; running jobs continue
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
        info!("Scheduler paused");
    }

    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
        self.inner.work.notify_waiters();
        info!("Scheduler resumed");
    }

    /// Queue one job. Duplicates are not rejected here; refill filters them.
    pub fn enqueue(&self, project: Project) -> String {
        let id = self.inner.push_job(&mut self.inner.state.lock(), project);
        self.inner.work.notify_waiters();
        id
    }

    pub fn enqueue_batch(&self, projects: Vec<Project>) -> Vec<String> {
        let ids = {
            let mut state = self.inner.state.lock();
            projects
                .into_iter()
                .map(|p| self.inner.push_job(&mut state, p))
                .collect()
        };
        self.inner.work.notify_waiters();
        ids
    }

    /// Set progress of an active job (clamped to 100) and renew its lease
    pub fn update_progress(&self, job_id: &str, percent: u8, message: Option<&str>) -> Result<(), SchedulerError> {
        if self.inner.progress(job_id, None, percent, message.map(str::to_string)) {
            return Ok(());
        }
        match self.job(job_id) {
            None => Err(SchedulerError::NotFound(job_id.to_string())),
            Some(job) => Err(SchedulerError::InvalidState {
                id: job_id.to_string(),
                state: job.state,
                expected: JobState::Active,
            }),
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.inner.state.lock();
        SchedulerStats {
            waiting: state.count(JobState::Waiting),
            active: state.count(JobState::Active),
            completed: state.count(JobState::Completed),
            failed: state.count(JobState::Failed),
            total: state.jobs.len(),
            concurrency: self.concurrency(),
            is_running: self.is_running(),
            is_paused: self.inner.paused.load(Ordering::SeqCst),
        }
    }

    /// Every retained job, newest first
    pub fn jobs(&self) -> Vec<Job> {
        self.inner.state.lock().jobs.values().rev().cloned().collect()
    }

    pub fn job(&self, job_id: &str) -> Option<Job> {
        self.inner.state.lock().jobs.get(job_id).cloned()
    }

    /// Move a failed job back to waiting with a fresh attempt budget
    pub fn retry_failed(&self, job_id: &str) -> Result<(), SchedulerError> {
        {
            let mut guard = self.inner.state.lock();
            let QueueState { jobs, waiting } = &mut *guard;
            let job = jobs
                .get_mut(job_id)
                .ok_or_else(|| SchedulerError::NotFound(job_id.to_string()))?;
            if job.state != JobState::Failed {
                return Err(SchedulerError::InvalidState {
                    id: job_id.to_string(),
                    state: job.state,
                    expected: JobState::Failed,
                });
            }
            job.set_state(JobState::Waiting);
            job.attempts = 0;
            job.progress = 0;
            job.progress_message = None;
            job.finished_at = None;
            job.available_at = None;
            self.inner.record(job);
            waiting.push_back(job_id.to_string());
            info!("Job {} re-queued by explicit retry", job.short_id());
        }
        self.inner.work.notify_waiters();
        Ok(())
    }

    /// Remove a job that is not active
    pub fn remove(&self, job_id: &str) -> Result<Job, SchedulerError> {
        let mut state = self.inner.state.lock();
        match state.jobs.get(job_id).map(|j| j.state) {
            None => return Err(SchedulerError::NotFound(job_id.to_string())),
            Some(JobState::Active) => return Err(SchedulerError::JobActive(job_id.to_string())),
            Some(_) => {}
        }
        state.waiting.retain(|id| id != job_id);
        let job = state
            .jobs
            .shift_remove(job_id)
            .ok_or_else(|| SchedulerError::NotFound(job_id.to_string()))?;
        self.inner.forget(job_id);
        Ok(job)
    }

    fn clear(&self, kind: JobState) -> usize {
        let mut state = self.inner.state.lock();
        let before = state.jobs.len();
        state.jobs.retain(|id, j| {
            let keep = j.state != kind;
            if !keep {
                self.inner.forget(id);
            }
            keep
        });
        before - state.jobs.len()
    }

    pub fn clear_completed(&self) -> usize {
        self.clear(JobState::Completed)
    }

    pub fn clear_failed(&self) -> usize {
        self.clear(JobState::Failed)
    }

    /// Ask the refill task to check the low-water mark now
    pub fn trigger_refill(&self) {
        self.inner.refill_wake.notify_one();
    }

    /// Run one refill pass inline; returns the number of jobs queued
    pub async fn refill_now(&self) -> usize {
        self.inner.refill().await
    }
}
