//! Poll-or-delay helper for jobs that wait on external state

use crate::error::{JobError, RebalancerResult};

use std::future::Future;
use std::time::Duration;

/// Answer from a status check
#[derive(Debug, Clone, PartialEq)]
pub enum PollStatus<T> {
    Ready(T),
    Pending,
}

/// Run `check` once. Ready values are returned; pending becomes a cooperative
/// delay of `interval` that does not consume an attempt. Check errors keep
/// their own classification.
pub async fn poll_or_delay<T, F, Fut>(check: F, interval: Duration) -> Result<T, JobError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = RebalancerResult<PollStatus<T>>>,
{
    match check().await? {
        PollStatus::Ready(value) => Ok(value),
        PollStatus::Pending => Err(JobError::delay(interval)),
    }
}
