//! Task queue
//!
//! Named queues of jobs executed by a bounded worker pool. Handler outcomes
//! are classified by [`JobError`]: a delay reschedules without touching the
//! attempt count, a failure retries with backoff until `max_attempts`, and an
//! unrecoverable error goes straight to the dead-letter set.

pub mod job;
pub mod postgres;
pub mod store;

pub use job::{backoff_delay, EnqueueRequest, Job, JobHandle, JobId, JobState, RecurringSchedule};
pub use postgres::PgQueueStore;
pub use store::{MemoryQueueStore, QueueSnapshot, QueueStore};

use crate::config::QueueConfig;
use crate::error::{JobError, RebalancerError, RebalancerResult};
use crate::metrics;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Executes jobs pulled off a queue
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<(), JobError>;

    /// Called once after a successful run
    async fn on_complete(&self, _job: &Job) {}

    /// Called once when a job becomes dead; never on intermediate retries or delays
    async fn on_failed(&self, _job: &Job, _error: &JobError) {}
}

/// One named queue and its worker loop
pub struct TaskQueue {
    name: String,
    store: Arc<dyn QueueStore>,
    config: QueueConfig,
}

impl TaskQueue {
    pub fn new(name: impl Into<String>, store: Arc<dyn QueueStore>, config: QueueConfig) -> Self {
        Self {
            name: name.into(),
            store,
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn build_job(&self, request: EnqueueRequest) -> RebalancerResult<Job> {
        let now = Utc::now();
        let delay = match request.delay {
            Some(delay) => chrono::Duration::from_std(delay)
                .map_err(|e| RebalancerError::Internal(format!("invalid delay: {}", e)))?,
            None => chrono::Duration::zero(),
        };

        Ok(Job {
            id: Uuid::new_v4(),
            queue: self.name.clone(),
            name: request.name,
            group_key: request.group_key,
            payload: request.payload,
            attempts: 0,
            max_attempts: request.max_attempts.unwrap_or(self.config.max_attempts).max(1),
            backoff_base_ms: request
                .backoff_base
                .unwrap_or_else(|| self.config.backoff_base())
                .as_millis() as u64,
            state: JobState::Queued,
            run_at: now + delay,
            last_error: None,
            schedule: None,
            created_at: now,
        })
    }

    /// Persist a job; it becomes eligible once its delay (if any) elapses
    pub async fn enqueue(&self, request: EnqueueRequest) -> RebalancerResult<JobHandle> {
        let job = self.build_job(request)?;
        self.store.push(job.clone()).await?;

        metrics::record_job_enqueued(&self.name, &job.name);
        debug!("Enqueued {} ({}) on {}", job.name, job.id, self.name);
        Ok(JobHandle::from(&job))
    }

    /// Register a recurring schedule. Any instance already scheduled under
    /// the same name is replaced, so re-registering leaves exactly one.
    pub async fn enqueue_recurring(
        &self,
        schedule: &str,
        interval: Duration,
        request: EnqueueRequest,
    ) -> RebalancerResult<JobHandle> {
        let mut job = self.build_job(request)?;
        job.schedule = Some(RecurringSchedule {
            name: schedule.to_string(),
            interval_ms: interval.as_millis() as u64,
        });

        if self.store.remove_schedule(&self.name, schedule).await? {
            debug!("Replacing scheduled instance of {} on {}", schedule, self.name);
        }
        let standing = self.store.push_recurring(job.clone()).await?;

        metrics::record_job_enqueued(&self.name, &job.name);
        info!(
            "Registered recurring {} every {:?} on {}",
            schedule, interval, self.name
        );
        Ok(JobHandle::from(&standing))
    }

    pub async fn get(&self, id: JobId) -> RebalancerResult<Option<Job>> {
        self.store.get(id).await
    }

    pub async fn snapshot(&self) -> RebalancerResult<QueueSnapshot> {
        self.store.snapshot(&self.name, Utc::now()).await
    }

    pub async fn dead_jobs(&self, limit: usize) -> RebalancerResult<Vec<Job>> {
        self.store.dead_jobs(&self.name, limit).await
    }

    /// Pull and execute jobs until `shutdown` flips to true, then wait for
    /// in-flight jobs to finish
    pub async fn run(
        self: Arc<Self>,
        handler: Arc<dyn JobHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> RebalancerResult<()> {
        let recovered = self.store.recover_active(&self.name).await?;
        if recovered > 0 {
            warn!("Requeued {} jobs left active on {}", recovered, self.name);
        }

        let concurrency = self.config.concurrency.max(1);
        let slots = Arc::new(Semaphore::new(concurrency));
        info!(
            "Starting workers for {} (concurrency {})",
            self.name, concurrency
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            match self.store.fetch_next(&self.name, Utc::now()).await {
                Ok(Some(job)) => {
                    let queue = self.clone();
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        queue.process(job, handler.as_ref()).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval()) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!("Failed to fetch from {}: {}", self.name, e);
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval()) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        info!("Draining in-flight jobs on {}", self.name);
        let _ = slots.acquire_many(concurrency as u32).await;
        info!("Workers for {} stopped", self.name);
        Ok(())
    }

    async fn process(&self, job: Job, handler: &dyn JobHandler) {
        let started = Instant::now();
        let job_id = job.id;
        let outcome = match AssertUnwindSafe(handler.handle(&job)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!("Job {} ({}) on {} panicked: {}", job.id, job.name, self.name, message);
                Err(JobError::Failed(format!("handler panicked: {}", message)))
            }
        };

        let result = match outcome {
            Ok(()) => self.finish(&job, handler, started).await,
            Err(JobError::Delayed(delay)) => self.defer(&job, delay).await,
            Err(JobError::Failed(message)) => {
                let attempts = job.attempts.saturating_add(1);
                if attempts >= job.max_attempts {
                    self.bury(job, attempts, JobError::Failed(message), handler).await
                } else {
                    self.retry(&job, attempts, message).await
                }
            }
            Err(err @ JobError::Unrecoverable(_)) => {
                let attempts = job.attempts;
                self.bury(job, attempts, err, handler).await
            }
        };

        if let Err(e) = result {
            error!("Failed to record outcome of job {} on {}: {}", job_id, self.name, e);
        }
    }

    async fn finish(&self, job: &Job, handler: &dyn JobHandler, started: Instant) -> RebalancerResult<()> {
        self.store.complete(job.id).await?;
        metrics::record_job_completed(&self.name, &job.name, started.elapsed().as_secs_f64());
        debug!("Job {} ({}) completed", job.name, job.id);

        handler.on_complete(job).await;
        self.schedule_next(job).await
    }

    async fn defer(&self, job: &Job, delay: Duration) -> RebalancerResult<()> {
        let run_at = Utc::now() + to_chrono(delay);
        self.store.reschedule(job.id, run_at, job.attempts, None).await?;
        metrics::record_job_delayed(&self.name, &job.name);
        debug!("Job {} ({}) delayed {:?}", job.name, job.id, delay);
        Ok(())
    }

    async fn retry(&self, job: &Job, attempts: u32, message: String) -> RebalancerResult<()> {
        let delay = backoff_delay(job.backoff_base(), attempts);
        warn!(
            "Job {} ({}) failed attempt {}/{}: {}; retrying in {:?}",
            job.name, job.id, attempts, job.max_attempts, message, delay
        );
        self.store
            .reschedule(job.id, Utc::now() + to_chrono(delay), attempts, Some(message))
            .await?;
        metrics::record_job_retried(&self.name, &job.name);
        Ok(())
    }

    async fn bury(
        &self,
        mut job: Job,
        attempts: u32,
        err: JobError,
        handler: &dyn JobHandler,
    ) -> RebalancerResult<()> {
        error!(
            "Job {} ({}) dead after {} attempts: {}",
            job.name, job.id, attempts, err
        );
        self.store.mark_dead(job.id, attempts, err.to_string()).await?;
        metrics::record_job_dead(&self.name, &job.name);

        job.attempts = attempts;
        job.state = JobState::Dead;
        job.last_error = Some(err.to_string());
        handler.on_failed(&job, &err).await;

        self.schedule_next(&job).await
    }

    /// Recurring jobs hand over to their next instance after a terminal outcome
    async fn schedule_next(&self, job: &Job) -> RebalancerResult<()> {
        if job.schedule.is_none() {
            return Ok(());
        }
        // the schedule may have been removed while this instance ran
        let still_scheduled = self
            .store
            .get(job.id)
            .await?
            .map(|stored| stored.schedule.is_some())
            .unwrap_or(false);
        if !still_scheduled {
            return Ok(());
        }

        if let Some(next) = job.next_occurrence(Utc::now()) {
            self.store.push_recurring(next).await?;
        }
        Ok(())
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub fn fast_config(concurrency: usize) -> QueueConfig {
        QueueConfig {
            concurrency,
            poll_interval_ms: 5,
            max_attempts: 3,
            backoff_base_ms: 5,
            group_requeue_ms: 5,
            group_key_path: None,
        }
    }

    pub fn memory_queue(name: &str, config: QueueConfig) -> Arc<TaskQueue> {
        Arc::new(TaskQueue::new(name, Arc::new(MemoryQueueStore::new()), config))
    }

    /// Poll until the job reaches a terminal state or the deadline passes
    pub async fn wait_terminal(queue: &TaskQueue, id: JobId, within: Duration) -> Job {
        let deadline = Instant::now() + within;
        loop {
            let job = queue.get(id).await.unwrap().expect("job exists");
            if job.state.is_terminal() {
                return job;
            }
            assert!(Instant::now() < deadline, "job {} still {:?}", id, job.state);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Poll `condition` until it holds; callbacks run just after the state change
    pub async fn eventually<F: Fn() -> bool>(condition: F, within: Duration) {
        let deadline = Instant::now() + within;
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met within {:?}", within);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Spawn the worker loop; send `true` on the returned sender to stop it
    pub fn spawn_workers(
        queue: Arc<TaskQueue>,
        handler: Arc<dyn JobHandler>,
    ) -> (watch::Sender<bool>, tokio::task::JoinHandle<RebalancerResult<()>>) {
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(queue.run(handler, rx));
        (tx, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Fails the first `failures` runs, then succeeds
    struct Flaky {
        failures: usize,
        unrecoverable: bool,
        runs: AtomicUsize,
        completed: AtomicUsize,
        failed: Mutex<Vec<(u32, JobError)>>,
    }

    impl Flaky {
        fn new(failures: usize) -> Self {
            Self {
                failures,
                unrecoverable: false,
                runs: AtomicUsize::new(0),
                completed: AtomicUsize::new(0),
                failed: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl JobHandler for Flaky {
        async fn handle(&self, _job: &Job) -> Result<(), JobError> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            if self.unrecoverable {
                return Err(JobError::Unrecoverable("bad payload".to_string()));
            }
            if run <= self.failures {
                return Err(JobError::Failed(format!("boom {}", run)));
            }
            Ok(())
        }

        async fn on_complete(&self, _job: &Job) {
            self.completed.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_failed(&self, job: &Job, error: &JobError) {
            self.failed.lock().unwrap().push((job.attempts, error.clone()));
        }
    }

    #[tokio::test]
    async fn test_retries_then_dead_letters_with_single_failure_callback() {
        let queue = memory_queue("retry", fast_config(2));
        let handler = Arc::new(Flaky::new(usize::MAX));
        let (stop, workers) = spawn_workers(queue.clone(), handler.clone());

        let handle = queue
            .enqueue(EnqueueRequest::new("flaky", json!({})).max_attempts(3))
            .await
            .unwrap();
        let job = wait_terminal(&queue, handle.id, Duration::from_secs(5)).await;

        assert_eq!(job.state, JobState::Dead);
        assert_eq!(job.attempts, 3);
        assert_eq!(job.last_error.as_deref(), Some("boom 3"));
        assert_eq!(handler.runs.load(Ordering::SeqCst), 3);

        eventually(|| !handler.failed.lock().unwrap().is_empty(), Duration::from_secs(2)).await;
        let failed = handler.failed.lock().unwrap().clone();
        assert_eq!(failed, vec![(3, JobError::Failed("boom 3".to_string()))]);
        assert_eq!(handler.completed.load(Ordering::SeqCst), 0);

        let dead = queue.dead_jobs(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(queue.snapshot().await.unwrap().dead, 1);

        stop.send(true).unwrap();
        workers.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let queue = memory_queue("recover", fast_config(1));
        let handler = Arc::new(Flaky::new(2));
        let (stop, workers) = spawn_workers(queue.clone(), handler.clone());

        let handle = queue.enqueue(EnqueueRequest::new("flaky", json!({}))).await.unwrap();
        let job = wait_terminal(&queue, handle.id, Duration::from_secs(5)).await;

        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.attempts, 2);
        eventually(|| handler.completed.load(Ordering::SeqCst) == 1, Duration::from_secs(2)).await;
        assert!(handler.failed.lock().unwrap().is_empty());

        stop.send(true).unwrap();
        workers.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unrecoverable_skips_remaining_attempts() {
        let queue = memory_queue("fatal", fast_config(1));
        let mut flaky = Flaky::new(0);
        flaky.unrecoverable = true;
        let handler = Arc::new(flaky);
        let (stop, workers) = spawn_workers(queue.clone(), handler.clone());

        let handle = queue
            .enqueue(EnqueueRequest::new("fatal", json!({})).max_attempts(5))
            .await
            .unwrap();
        let job = wait_terminal(&queue, handle.id, Duration::from_secs(5)).await;

        assert_eq!(job.state, JobState::Dead);
        assert_eq!(job.attempts, 0);
        assert_eq!(handler.runs.load(Ordering::SeqCst), 1);
        eventually(|| handler.failed.lock().unwrap().len() == 1, Duration::from_secs(2)).await;

        stop.send(true).unwrap();
        workers.await.unwrap().unwrap();
    }

    struct Panicking;

    #[async_trait]
    impl JobHandler for Panicking {
        async fn handle(&self, job: &Job) -> Result<(), JobError> {
            panic!("handler blew up on {}", job.name);
        }
    }

    #[tokio::test]
    async fn test_panicking_handler_counts_as_failure() {
        let queue = memory_queue("panics", fast_config(1));
        let (stop, workers) = spawn_workers(queue.clone(), Arc::new(Panicking));

        let handle = queue
            .enqueue(EnqueueRequest::new("explode", json!({})).max_attempts(2))
            .await
            .unwrap();
        let job = wait_terminal(&queue, handle.id, Duration::from_secs(5)).await;

        assert_eq!(job.state, JobState::Dead);
        assert_eq!(job.attempts, 2);
        assert_eq!(
            job.last_error.as_deref(),
            Some("handler panicked: handler blew up on explode")
        );
        assert_eq!(queue.snapshot().await.unwrap().active, 0);

        stop.send(true).unwrap();
        workers.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_recurring_registration_keeps_one_instance() {
        let queue = memory_queue("recurring", fast_config(1));
        let request = || EnqueueRequest::new("check-balances", json!({ "wallet": "0x01" }));

        let first = queue
            .enqueue_recurring("check-balances-0x01", Duration::from_secs(60), request())
            .await
            .unwrap();
        let second = queue
            .enqueue_recurring("check-balances-0x01", Duration::from_secs(60), request())
            .await
            .unwrap();

        assert_ne!(first.id, second.id);
        let snapshot = queue.snapshot().await.unwrap();
        assert_eq!(snapshot.ready + snapshot.deferred, 1);
        assert!(queue.get(first.id).await.unwrap().is_none());
        assert!(queue.get(second.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_recurring_job_schedules_successor_after_run() {
        let queue = memory_queue("successor", fast_config(1));
        let handler = Arc::new(Flaky::new(0));
        let (stop, workers) = spawn_workers(queue.clone(), handler.clone());

        let first = queue
            .enqueue_recurring(
                "tick",
                Duration::from_secs(3600),
                EnqueueRequest::new("tick", json!({})),
            )
            .await
            .unwrap();
        wait_terminal(&queue, first.id, Duration::from_secs(5)).await;

        // the successor is parked an hour out
        let deadline = Instant::now() + Duration::from_secs(5);
        let snapshot = loop {
            let snapshot = queue.snapshot().await.unwrap();
            if snapshot.deferred == 1 || Instant::now() > deadline {
                break snapshot;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        assert_eq!(snapshot.deferred, 1);
        assert_eq!(snapshot.completed, 1);
        assert_eq!(handler.runs.load(Ordering::SeqCst), 1);

        stop.send(true).unwrap();
        workers.await.unwrap().unwrap();

        // re-registering replaces the parked successor
        let again = queue
            .enqueue_recurring(
                "tick",
                Duration::from_secs(3600),
                EnqueueRequest::new("tick", json!({})).delay(Duration::from_secs(60)),
            )
            .await
            .unwrap();
        assert_ne!(again.id, first.id);
        let snapshot = queue.snapshot().await.unwrap();
        assert_eq!(snapshot.deferred, 1);
        assert_eq!(snapshot.ready, 0);
    }

    #[tokio::test]
    async fn test_shutdown_drains_and_returns() {
        let queue = memory_queue("shutdown", fast_config(2));
        let handler = Arc::new(Flaky::new(0));
        let (stop, workers) = spawn_workers(queue.clone(), handler);

        stop.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), workers)
            .await
            .expect("workers stop promptly")
            .unwrap()
            .unwrap();
    }
}
