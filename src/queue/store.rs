//! Persistence seam for queued jobs
//!
//! A store owns job state transitions. Every mutation that decides which
//! worker gets a job happens inside one store call so two workers can never
//! claim the same job.

use super::job::{Job, JobId, JobState};
use crate::error::RebalancerResult;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;

/// Completed jobs kept around for inspection before being discarded
const COMPLETED_RETENTION: usize = 1_000;

/// Point-in-time counts for one queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueSnapshot {
    /// Queued and due
    pub ready: u64,
    /// Queued with `run_at` in the future (backoff or delay)
    pub deferred: u64,
    pub active: u64,
    pub completed: u64,
    pub dead: u64,
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn push(&self, job: Job) -> RebalancerResult<()>;

    /// Insert a recurring instance unless one with the same schedule name is
    /// already queued or active; returns whichever instance now stands.
    async fn push_recurring(&self, job: Job) -> RebalancerResult<Job>;

    /// Claim the earliest due job on `queue`, marking it active
    async fn fetch_next(&self, queue: &str, now: DateTime<Utc>) -> RebalancerResult<Option<Job>>;

    async fn complete(&self, id: JobId) -> RebalancerResult<()>;

    /// Put an active job back in line
    async fn reschedule(
        &self,
        id: JobId,
        run_at: DateTime<Utc>,
        attempts: u32,
        last_error: Option<String>,
    ) -> RebalancerResult<()>;

    async fn mark_dead(&self, id: JobId, attempts: u32, error: String) -> RebalancerResult<()>;

    /// Stop a recurring schedule: queued instances are dropped, an active one
    /// finishes without a successor
    async fn remove_schedule(&self, queue: &str, name: &str) -> RebalancerResult<bool>;

    async fn get(&self, id: JobId) -> RebalancerResult<Option<Job>>;

    async fn snapshot(&self, queue: &str, now: DateTime<Utc>) -> RebalancerResult<QueueSnapshot>;

    async fn dead_jobs(&self, queue: &str, limit: usize) -> RebalancerResult<Vec<Job>>;

    /// Return jobs left active by a previous process to the queue
    async fn recover_active(&self, queue: &str) -> RebalancerResult<u64>;
}

struct Entry {
    seq: u64,
    job: Job,
}

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<JobId, Entry>,
    completed: VecDeque<JobId>,
    completed_total: HashMap<String, u64>,
    next_seq: u64,
}

impl MemoryState {
    fn insert(&mut self, job: Job) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.jobs.insert(job.id, Entry { seq, job });
    }
}

/// Process-local store; jobs do not survive a restart
#[derive(Default)]
pub struct MemoryQueueStore {
    state: Mutex<MemoryState>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn push(&self, job: Job) -> RebalancerResult<()> {
        self.state.lock().await.insert(job);
        Ok(())
    }

    async fn push_recurring(&self, job: Job) -> RebalancerResult<Job> {
        let mut state = self.state.lock().await;
        let schedule_name = job.schedule.as_ref().map(|s| s.name.clone());

        let existing = state.jobs.values().find(|e| {
            e.job.queue == job.queue
                && !e.job.state.is_terminal()
                && e.job.schedule.as_ref().map(|s| &s.name) == schedule_name.as_ref()
        });
        if let Some(entry) = existing {
            return Ok(entry.job.clone());
        }

        state.insert(job.clone());
        Ok(job)
    }

    async fn fetch_next(&self, queue: &str, now: DateTime<Utc>) -> RebalancerResult<Option<Job>> {
        let mut state = self.state.lock().await;

        let next = state
            .jobs
            .values()
            .filter(|e| e.job.queue == queue && e.job.state == JobState::Queued && e.job.run_at <= now)
            .min_by_key(|e| (e.job.run_at, e.seq))
            .map(|e| e.job.id);

        Ok(next.and_then(|id| {
            state.jobs.get_mut(&id).map(|entry| {
                entry.job.state = JobState::Active;
                entry.job.clone()
            })
        }))
    }

    async fn complete(&self, id: JobId) -> RebalancerResult<()> {
        let mut state = self.state.lock().await;
        let queue = match state.jobs.get_mut(&id) {
            Some(entry) => {
                entry.job.state = JobState::Completed;
                entry.job.queue.clone()
            }
            None => return Ok(()),
        };

        *state.completed_total.entry(queue).or_insert(0) += 1;
        state.completed.push_back(id);
        while state.completed.len() > COMPLETED_RETENTION {
            if let Some(old) = state.completed.pop_front() {
                state.jobs.remove(&old);
            }
        }
        Ok(())
    }

    async fn reschedule(
        &self,
        id: JobId,
        run_at: DateTime<Utc>,
        attempts: u32,
        last_error: Option<String>,
    ) -> RebalancerResult<()> {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.jobs.get_mut(&id) {
            entry.job.state = JobState::Queued;
            entry.job.run_at = run_at;
            entry.job.attempts = attempts;
            if last_error.is_some() {
                entry.job.last_error = last_error;
            }
        }
        Ok(())
    }

    async fn mark_dead(&self, id: JobId, attempts: u32, error: String) -> RebalancerResult<()> {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.jobs.get_mut(&id) {
            entry.job.state = JobState::Dead;
            entry.job.attempts = attempts;
            entry.job.last_error = Some(error);
        }
        Ok(())
    }

    async fn remove_schedule(&self, queue: &str, name: &str) -> RebalancerResult<bool> {
        let mut state = self.state.lock().await;
        let matches = |job: &Job| {
            job.queue == queue
                && !job.state.is_terminal()
                && job.schedule.as_ref().map(|s| s.name.as_str()) == Some(name)
        };

        let before = state.jobs.len();
        state
            .jobs
            .retain(|_, e| !(matches(&e.job) && e.job.state == JobState::Queued));
        let mut removed = before != state.jobs.len();

        for entry in state.jobs.values_mut() {
            if matches(&entry.job) {
                entry.job.schedule = None;
                removed = true;
            }
        }
        Ok(removed)
    }

    async fn get(&self, id: JobId) -> RebalancerResult<Option<Job>> {
        Ok(self.state.lock().await.jobs.get(&id).map(|e| e.job.clone()))
    }

    async fn snapshot(&self, queue: &str, now: DateTime<Utc>) -> RebalancerResult<QueueSnapshot> {
        let state = self.state.lock().await;
        let mut snapshot = QueueSnapshot {
            completed: state.completed_total.get(queue).copied().unwrap_or(0),
            ..Default::default()
        };

        for entry in state.jobs.values().filter(|e| e.job.queue == queue) {
            match entry.job.state {
                JobState::Queued if entry.job.run_at <= now => snapshot.ready += 1,
                JobState::Queued => snapshot.deferred += 1,
                JobState::Active => snapshot.active += 1,
                JobState::Dead => snapshot.dead += 1,
                JobState::Completed => {}
            }
        }
        Ok(snapshot)
    }

    async fn dead_jobs(&self, queue: &str, limit: usize) -> RebalancerResult<Vec<Job>> {
        let state = self.state.lock().await;
        let mut dead: Vec<(u64, Job)> = state
            .jobs
            .values()
            .filter(|e| e.job.queue == queue && e.job.state == JobState::Dead)
            .map(|e| (e.seq, e.job.clone()))
            .collect();
        dead.sort_by_key(|(seq, _)| std::cmp::Reverse(*seq));
        Ok(dead.into_iter().take(limit).map(|(_, job)| job).collect())
    }

    async fn recover_active(&self, queue: &str) -> RebalancerResult<u64> {
        let mut state = self.state.lock().await;
        let mut recovered = 0;
        for entry in state.jobs.values_mut() {
            if entry.job.queue == queue && entry.job.state == JobState::Active {
                entry.job.state = JobState::Queued;
                recovered += 1;
            }
        }
        Ok(recovered)
    }
}
