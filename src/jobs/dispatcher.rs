//! Grouped dispatcher
//!
//! Sits between a [`TaskQueue`] and a [`JobRegistry`]. At most one job per
//! group key runs at a time across the worker pool; a job whose group is busy
//! is delayed by `group_requeue_ms` instead of blocking a worker.

use super::gate::GroupGate;
use super::{JobContext, JobRegistry};
use crate::error::{JobError, RebalancerResult};
use crate::metrics;
use crate::queue::{EnqueueRequest, Job, JobHandle, JobHandler, TaskQueue};

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

pub struct GroupedDispatcher {
    queue: Arc<TaskQueue>,
    registry: Arc<JobRegistry>,
    gate: Arc<GroupGate>,
    requeue_interval: Duration,
    group_key_path: Option<String>,
}

impl GroupedDispatcher {
    pub fn new(queue: Arc<TaskQueue>, registry: Arc<JobRegistry>) -> Self {
        let requeue_interval = queue.config().group_requeue_interval();
        let group_key_path = queue.config().group_key_path.clone();
        Self {
            queue,
            registry,
            gate: GroupGate::new(),
            requeue_interval,
            group_key_path,
        }
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    /// Enqueue a job bound to `group_key`
    pub async fn enqueue(
        &self,
        request: EnqueueRequest,
        group_key: impl Into<String>,
    ) -> RebalancerResult<JobHandle> {
        self.queue.enqueue(request.group(group_key)).await
    }

    /// The job's explicit group, else the value at the configured payload path
    pub fn group_key(&self, job: &Job) -> Option<String> {
        if let Some(key) = &job.group_key {
            return Some(key.clone());
        }
        let path = self.group_key_path.as_deref()?;
        let value = path
            .split('.')
            .try_fold(&job.payload, |value, segment| value.get(segment))?;
        match value {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            serde_json::Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn active_groups(&self) -> Vec<String> {
        self.gate.active_keys()
    }

    /// Run the queue's workers with this dispatcher as handler
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> RebalancerResult<()> {
        let queue = self.queue.clone();
        queue.run(self, shutdown).await
    }

    fn context(&self) -> JobContext {
        JobContext {
            queue: self.queue.clone(),
        }
    }
}

#[async_trait]
impl JobHandler for GroupedDispatcher {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        let ctx = self.context();

        let Some(key) = self.group_key(job) else {
            return self.registry.process(job, &ctx).await;
        };

        let Some(permit) = self.gate.try_acquire(&key) else {
            metrics::record_group_contention(self.queue.name());
            debug!(
                "Group {} busy, delaying {} ({}) by {:?}",
                key, job.name, job.id, self.requeue_interval
            );
            return Err(JobError::delay(self.requeue_interval));
        };

        metrics::record_active_groups(self.queue.name(), self.gate.active_count());
        let result = self.registry.process(job, &ctx).await;
        drop(permit);
        metrics::record_active_groups(self.queue.name(), self.gate.active_count());
        result
    }

    async fn on_complete(&self, job: &Job) {
        self.registry.on_complete(job, &self.context()).await;
    }

    async fn on_failed(&self, job: &Job, error: &JobError) {
        self.registry.on_failed(job, &self.context(), error).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::testing::FnManager;
    use crate::queue::testing::{eventually, fast_config, memory_queue, wait_terminal};
    use crate::queue::JobState;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Tracks how many jobs of each group run at once
    #[derive(Default)]
    struct Overlap {
        running: Mutex<HashMap<String, usize>>,
        peak: Mutex<HashMap<String, usize>>,
    }

    impl Overlap {
        fn enter(&self, group: &str) {
            let mut running = self.running.lock().unwrap();
            let now = running.entry(group.to_string()).or_insert(0);
            *now += 1;
            let mut peak = self.peak.lock().unwrap();
            let p = peak.entry(group.to_string()).or_insert(0);
            *p = (*p).max(*now);
        }

        fn leave(&self, group: &str) {
            *self.running.lock().unwrap().get_mut(group).unwrap() -= 1;
        }
    }

    fn start(
        dispatcher: Arc<GroupedDispatcher>,
    ) -> (watch::Sender<bool>, tokio::task::JoinHandle<RebalancerResult<()>>) {
        let (tx, rx) = watch::channel(false);
        (tx, tokio::spawn(dispatcher.run(rx)))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_group_never_overlaps_and_all_groups_progress() {
        let overlap = Arc::new(Overlap::default());
        let tracker = overlap.clone();
        let manager = Arc::new(FnManager::new("rebalance", move |job: Job| {
            let tracker = tracker.clone();
            async move {
                let group = job.group_key.clone().unwrap();
                tracker.enter(&group);
                tokio::time::sleep(Duration::from_millis(15)).await;
                tracker.leave(&group);
                Ok(())
            }
        }));

        let queue = memory_queue("grouped", fast_config(4));
        let registry = Arc::new(JobRegistry::new().register(manager.clone()));
        let dispatcher = Arc::new(GroupedDispatcher::new(queue.clone(), registry));

        let mut handles = Vec::new();
        for i in 0..6 {
            for group in ["chain:10", "chain:8453"] {
                let request = EnqueueRequest::new("rebalance", json!({ "i": i }));
                handles.push(dispatcher.enqueue(request, group).await.unwrap());
            }
        }

        let (stop, workers) = start(dispatcher.clone());
        for handle in &handles {
            let job = wait_terminal(&queue, handle.id, Duration::from_secs(10)).await;
            assert_eq!(job.state, JobState::Completed);
            // group contention is a delay, never an attempt
            assert_eq!(job.attempts, 0);
        }

        let peak = overlap.peak.lock().unwrap().clone();
        assert_eq!(peak["chain:10"], 1);
        assert_eq!(peak["chain:8453"], 1);
        eventually(|| manager.completed() == 12, Duration::from_secs(2)).await;
        assert!(dispatcher.active_groups().is_empty());

        stop.send(true).unwrap();
        workers.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_delay_does_not_consume_attempts_or_fire_failure() {
        let polls = Arc::new(AtomicUsize::new(0));
        let counter = polls.clone();
        let manager = Arc::new(FnManager::new("check-settlement", move |_job: Job| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(JobError::delay(Duration::from_millis(5)))
                } else {
                    Ok(())
                }
            }
        }));

        let queue = memory_queue("settlement", fast_config(1));
        let registry = Arc::new(JobRegistry::new().register(manager.clone()));
        let dispatcher = Arc::new(GroupedDispatcher::new(queue.clone(), registry));
        let handle = dispatcher
            .enqueue(
                EnqueueRequest::new("check-settlement", json!({})).max_attempts(1),
                "chain:42161",
            )
            .await
            .unwrap();

        let (stop, workers) = start(dispatcher);
        let job = wait_terminal(&queue, handle.id, Duration::from_secs(5)).await;

        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.attempts, 0);
        assert_eq!(polls.load(Ordering::SeqCst), 4);
        assert!(manager.failures().is_empty());

        stop.send(true).unwrap();
        workers.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_group_released_after_failure() {
        let manager = Arc::new(FnManager::new("rebalance", |_job: Job| async {
            Err(JobError::Unrecoverable("invalid quote".to_string()))
        }));
        let queue = memory_queue("release", fast_config(2));
        let registry = Arc::new(JobRegistry::new().register(manager.clone()));
        let dispatcher = Arc::new(GroupedDispatcher::new(queue.clone(), registry));

        let first = dispatcher
            .enqueue(EnqueueRequest::new("rebalance", json!({})), "chain:1")
            .await
            .unwrap();
        let second = dispatcher
            .enqueue(EnqueueRequest::new("rebalance", json!({})), "chain:1")
            .await
            .unwrap();

        let (stop, workers) = start(dispatcher.clone());
        for id in [first.id, second.id] {
            let job = wait_terminal(&queue, id, Duration::from_secs(5)).await;
            assert_eq!(job.state, JobState::Dead);
        }
        eventually(|| manager.failures().len() == 2, Duration::from_secs(2)).await;
        assert!(dispatcher.active_groups().is_empty());

        stop.send(true).unwrap();
        workers.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_group_key_from_payload_path() {
        let mut config = fast_config(1);
        config.group_key_path = Some("quote.tokenIn.chainId".to_string());
        let queue = memory_queue("paths", config);
        let dispatcher = GroupedDispatcher::new(queue.clone(), Arc::new(JobRegistry::new()));

        let handle = queue
            .enqueue(EnqueueRequest::new(
                "rebalance",
                json!({ "quote": { "tokenIn": { "chainId": 8453 } } }),
            ))
            .await
            .unwrap();
        let job = queue.get(handle.id).await.unwrap().unwrap();
        assert_eq!(dispatcher.group_key(&job), Some("8453".to_string()));

        let explicit = dispatcher
            .enqueue(EnqueueRequest::new("rebalance", json!({})), "chain:10")
            .await
            .unwrap();
        let job = queue.get(explicit.id).await.unwrap().unwrap();
        assert_eq!(dispatcher.group_key(&job), Some("chain:10".to_string()));
    }
}
