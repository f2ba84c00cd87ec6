//! Per-group mutual exclusion
//!
//! Holds the set of group keys currently executing. A [`GroupPermit`] is the
//! only way into the set and releases its key on drop, so every exit path of
//! a job (success, error, panic unwinding) frees the group.

use dashmap::DashSet;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default)]
pub struct GroupGate {
    active: DashSet<String>,
}

impl GroupGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim `key` if no other holder has it
    pub fn try_acquire(self: &Arc<Self>, key: &str) -> Option<GroupPermit> {
        if self.active.insert(key.to_string()) {
            Some(GroupPermit {
                gate: self.clone(),
                key: key.to_string(),
            })
        } else {
            None
        }
    }

    /// Wait, polling every `retry`, until `key` can be claimed
    pub async fn acquire(self: &Arc<Self>, key: &str, retry: Duration) -> GroupPermit {
        loop {
            if let Some(permit) = self.try_acquire(key) {
                return permit;
            }
            tokio::time::sleep(retry).await;
        }
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.active.contains(key)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn active_keys(&self) -> Vec<String> {
        self.active.iter().map(|k| k.clone()).collect()
    }
}

/// Exclusive hold on one group key
#[derive(Debug)]
pub struct GroupPermit {
    gate: Arc<GroupGate>,
    key: String,
}

impl GroupPermit {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for GroupPermit {
    fn drop(&mut self) {
        self.gate.active.remove(&self.key);
    }
}
