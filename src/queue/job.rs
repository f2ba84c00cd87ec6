//! Job records and enqueue requests

use crate::error::{RebalancerError, RebalancerResult};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

pub type JobId = Uuid;

/// Exponent cap so backoff stays well inside `Duration` range
const MAX_BACKOFF_EXPONENT: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting for `run_at`
    Queued,
    /// Claimed by a worker
    Active,
    Completed,
    /// Dead-letter: exhausted attempts or unrecoverable
    Dead,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Dead => "dead",
        }
    }

    pub fn parse(value: &str) -> RebalancerResult<Self> {
        match value {
            "queued" => Ok(JobState::Queued),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "dead" => Ok(JobState::Dead),
            other => Err(RebalancerError::Internal(format!(
                "unknown job state '{}'",
                other
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Dead)
    }
}

/// Named schedule that keeps exactly one pending instance per queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringSchedule {
    pub name: String,
    pub interval_ms: u64,
}

impl RecurringSchedule {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// A unit of work on a named queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue: String,
    pub name: String,
    pub group_key: Option<String>,
    pub payload: serde_json::Value,
    /// Failed attempts so far; delays never count
    pub attempts: u32,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub state: JobState,
    /// Not eligible for execution before this instant
    pub run_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub schedule: Option<RecurringSchedule>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Deserialize the payload into the manager's typed form
    pub fn payload_as<T: DeserializeOwned>(&self) -> RebalancerResult<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            RebalancerError::InvalidPayload {
                job: self.name.clone(),
                message: e.to_string(),
            }
        })
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    /// The next instance of a recurring job, due one interval from `now`
    pub fn next_occurrence(&self, now: DateTime<Utc>) -> Option<Job> {
        let schedule = self.schedule.clone()?;
        let delay = chrono::Duration::from_std(schedule.interval()).ok()?;
        Some(Job {
            id: Uuid::new_v4(),
            attempts: 0,
            state: JobState::Queued,
            run_at: now + delay,
            last_error: None,
            created_at: now,
            schedule: Some(schedule),
            ..self.clone()
        })
    }
}

/// What a producer hands to [`crate::queue::TaskQueue::enqueue`]
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub name: String,
    pub payload: serde_json::Value,
    pub group_key: Option<String>,
    pub max_attempts: Option<u32>,
    pub backoff_base: Option<Duration>,
    pub delay: Option<Duration>,
}

impl EnqueueRequest {
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            payload,
            group_key: None,
            max_attempts: None,
            backoff_base: None,
            delay: None,
        }
    }

    /// Serialize a typed payload
    pub fn with_payload<T: Serialize>(name: impl Into<String>, payload: &T) -> RebalancerResult<Self> {
        Ok(Self::new(name, serde_json::to_value(payload)?))
    }

    pub fn group(mut self, key: impl Into<String>) -> Self {
        self.group_key = Some(key.into());
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn backoff(mut self, base: Duration) -> Self {
        self.backoff_base = Some(base);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Returned from enqueue
#[derive(Debug, Clone, PartialEq)]
pub struct JobHandle {
    pub id: JobId,
    pub queue: String,
    pub name: String,
    pub run_at: DateTime<Utc>,
}

impl From<&Job> for JobHandle {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            queue: job.queue.clone(),
            name: job.name.clone(),
            run_at: job.run_at,
        }
    }
}

/// Delay before retry number `attempts` (1-based): `base * 2^(attempts - 1)` plus up to 20% jitter
pub fn backoff_delay(base: Duration, attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
    let delay = base.saturating_mul(1u32 << exponent);
    let jitter_ms = (delay.as_millis() / 5) as u64;
    if jitter_ms == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
}
