//! At-most-once claims on node invocations
//!
//! A worker claims `(task, node, lineage)` before running a stage. The bus
//! may redeliver an envelope; the redelivery finds the claim taken and is
//! skipped.
//!
//! The in-memory store holds a bounded number of claims and evicts the
//! oldest first. A redelivery arriving after its claim was evicted runs
//! again, so the capacity should cover the bus redelivery window.

use crate::error::PipelineError;
use crate::plan::NodeId;
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, PoisonError};

/// Identity of one node invocation within a task
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClaimKey {
    pub task_id: String,
    pub node: NodeId,
    pub lineage: String,
}

impl ClaimKey {
    pub fn new(task_id: impl Into<String>, node: NodeId, lineage: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            node,
            lineage: lineage.into(),
        }
    }
}

/// Store of claimed invocations
#[async_trait]
pub trait ClaimStore: Send + Sync {
    /// Take the claim; `true` only for the first caller
    async fn claim(&self, key: &ClaimKey) -> Result<bool, PipelineError>;

    /// Drop every claim of a task
    async fn forget_task(&self, task_id: &str) -> Result<(), PipelineError>;
}

/// Default number of claims an [`InMemoryClaimStore`] keeps
pub const DEFAULT_CLAIM_CAPACITY: usize = 100_000;

#[derive(Debug)]
struct ClaimLog {
    keys: HashSet<ClaimKey>,
    /// Claim order, oldest first
    order: VecDeque<ClaimKey>,
}

/// Claims held in worker memory
#[derive(Debug)]
pub struct InMemoryClaimStore {
    claims: Mutex<ClaimLog>,
    capacity: usize,
}

impl Default for InMemoryClaimStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CLAIM_CAPACITY)
    }
}

impl InMemoryClaimStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store keeping at most `capacity` claims
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            claims: Mutex::new(ClaimLog {
                keys: HashSet::new(),
                order: VecDeque::new(),
            }),
            capacity: capacity.max(1),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ClaimStore for InMemoryClaimStore {
    async fn claim(&self, key: &ClaimKey) -> Result<bool, PipelineError> {
        let mut log = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
        if log.keys.contains(key) {
            return Ok(false);
        }
        while log.keys.len() >= self.capacity {
            match log.order.pop_front() {
                Some(oldest) => {
                    log.keys.remove(&oldest);
                }
                None => break,
            }
        }
        log.keys.insert(key.clone());
        log.order.push_back(key.clone());
        Ok(true)
    }

    async fn forget_task(&self, task_id: &str) -> Result<(), PipelineError> {
        let mut log = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
        log.keys.retain(|k| k.task_id != task_id);
        log.order.retain(|k| k.task_id != task_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::block_on;

    #[test]
    fn test_claim_once() {
        let store = InMemoryClaimStore::new();
        let key = ClaimKey::new("T1", 0, "");

        assert!(block_on(store.claim(&key)).unwrap());
        assert!(!block_on(store.claim(&key)).unwrap());
        assert!(block_on(store.claim(&ClaimKey::new("T1", 0, "tracking#1"))).unwrap());
        assert!(block_on(store.claim(&ClaimKey::new("T2", 0, ""))).unwrap());
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_forget_task() {
        let store = InMemoryClaimStore::new();
        block_on(store.claim(&ClaimKey::new("T1", 0, ""))).unwrap();
        block_on(store.claim(&ClaimKey::new("T1", 1, ""))).unwrap();
        block_on(store.claim(&ClaimKey::new("T2", 0, ""))).unwrap();

        block_on(store.forget_task("T1")).unwrap();
        assert_eq!(store.len(), 1);
        assert!(block_on(store.claim(&ClaimKey::new("T1", 0, ""))).unwrap());
    }

    #[test]
    fn test_oldest_claims_evicted_at_capacity() {
        let store = InMemoryClaimStore::with_capacity(2);
        block_on(store.claim(&ClaimKey::new("T1", 0, ""))).unwrap();
        block_on(store.claim(&ClaimKey::new("T2", 0, ""))).unwrap();
        block_on(store.claim(&ClaimKey::new("T3", 0, ""))).unwrap();

        assert_eq!(store.len(), 2);
        assert!(!block_on(store.claim(&ClaimKey::new("T3", 0, ""))).unwrap());
        assert!(!block_on(store.claim(&ClaimKey::new("T2", 0, ""))).unwrap());
        // T1 fell out of the window
        assert!(block_on(store.claim(&ClaimKey::new("T1", 0, ""))).unwrap());
        assert_eq!(store.len(), 2);
    }
}
