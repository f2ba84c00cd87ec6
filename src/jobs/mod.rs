//! Job managers and dispatch
//!
//! A [`JobManager`] owns one job type end to end: producing, processing and
//! reacting to terminal outcomes. The [`JobRegistry`] routes each job to the
//! first manager that claims it.

pub mod dispatcher;
pub mod gate;
pub mod poll;

pub use dispatcher::GroupedDispatcher;
pub use gate::{GroupGate, GroupPermit};
pub use poll::{poll_or_delay, PollStatus};

use crate::error::{JobError, RebalancerError};
use crate::queue::{Job, TaskQueue};

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, warn};

/// Handed to managers while they process a job
#[derive(Clone)]
pub struct JobContext {
    /// Queue the job came from; follow-up work is enqueued here
    pub queue: Arc<TaskQueue>,
}

#[async_trait]
pub trait JobManager: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this manager processes `job`; usually a match on `job.name`
    fn claims(&self, job: &Job) -> bool;

    async fn process(&self, job: &Job, ctx: &JobContext) -> Result<(), JobError>;

    async fn on_complete(&self, _job: &Job, _ctx: &JobContext) {}

    /// Terminal failure only
    async fn on_failed(&self, _job: &Job, _ctx: &JobContext, _error: &JobError) {}
}

/// Ordered set of managers
#[derive(Default)]
pub struct JobRegistry {
    managers: Vec<Arc<dyn JobManager>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, manager: Arc<dyn JobManager>) -> Self {
        self.managers.push(manager);
        self
    }

    pub fn len(&self) -> usize {
        self.managers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.managers.is_empty()
    }

    /// First manager, in registration order, that claims `job`
    pub fn find(&self, job: &Job) -> Option<&Arc<dyn JobManager>> {
        let mut claimants = self.managers.iter().filter(|m| m.claims(job));
        let first = claimants.next();
        if let (Some(first), Some(other)) = (first, claimants.next()) {
            warn!(
                "Job {} claimed by both {} and {}; using {}",
                job.name,
                first.name(),
                other.name(),
                first.name()
            );
        }
        first
    }

    pub async fn process(&self, job: &Job, ctx: &JobContext) -> Result<(), JobError> {
        match self.find(job) {
            Some(manager) => manager.process(job, ctx).await,
            None => {
                error!("No job manager claims {} ({}) on {}", job.name, job.id, job.queue);
                Err(RebalancerError::UnclaimedJob(job.name.clone()).into())
            }
        }
    }

    pub async fn on_complete(&self, job: &Job, ctx: &JobContext) {
        if let Some(manager) = self.find(job) {
            manager.on_complete(job, ctx).await;
        }
    }

    pub async fn on_failed(&self, job: &Job, ctx: &JobContext, err: &JobError) {
        match self.find(job) {
            Some(manager) => manager.on_failed(job, ctx, err).await,
            None => error!("Unclaimed job {} ({}) is dead: {}", job.name, job.id, err),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Manager that accepts one job name and runs a closure per job
    pub struct FnManager<F> {
        pub job_name: &'static str,
        pub run: F,
        pub completed: AtomicUsize,
        pub failed: Mutex<Vec<JobError>>,
    }

    impl<F> FnManager<F> {
        pub fn new(job_name: &'static str, run: F) -> Self {
            Self {
                job_name,
                run,
                completed: AtomicUsize::new(0),
                failed: Mutex::new(Vec::new()),
            }
        }

        pub fn completed(&self) -> usize {
            self.completed.load(Ordering::SeqCst)
        }

        pub fn failures(&self) -> Vec<JobError> {
            self.failed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl<F, Fut> JobManager for FnManager<F>
    where
        F: Fn(Job) -> Fut + Send + Sync,
        Fut: std::future::Future<Output = Result<(), JobError>> + Send,
    {
        fn name(&self) -> &'static str {
            self.job_name
        }

        fn claims(&self, job: &Job) -> bool {
            job.name == self.job_name
        }

        async fn process(&self, job: &Job, _ctx: &JobContext) -> Result<(), JobError> {
            (self.run)(job.clone()).await
        }

        async fn on_complete(&self, _job: &Job, _ctx: &JobContext) {
            self.completed.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_failed(&self, _job: &Job, _ctx: &JobContext, err: &JobError) {
            self.failed.lock().unwrap().push(err.clone());
        }
    }
}
