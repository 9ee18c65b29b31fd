//! The durable customer-change queue seam and its in-memory
//! implementation, plus the backpressure and drain helpers the ingestion
//! and recompute paths poll through.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use cohort_core::CohortResult;

/// One unit of per-customer recomputation work. Serializable so durable
/// queue backends can persist it as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerChangeJob {
    pub workspace_id: Uuid,
    pub customer_id: Uuid,
    /// Set when the change was an event ingestion; drives the maintainer's
    /// event-name pre-filter.
    pub event_name: Option<String>,
}

/// Durable job-queue contract: add/pause/resume plus the counters the
/// backpressure and drain loops poll.
pub trait JobQueue: Send + Sync {
    fn add(&self, job: CustomerChangeJob) -> CohortResult<()>;
    fn pause(&self);
    fn resume(&self);
    fn is_paused(&self) -> bool;
    fn waiting_count(&self) -> usize;
    fn active_count(&self) -> usize;
    /// Pop the next job and mark it active. Returns `None` while paused
    /// or empty. Callers must pair every taken job with [`JobQueue::finish`].
    fn take_next(&self) -> Option<CustomerChangeJob>;
    fn finish(&self);
}

/// In-memory queue used by workers on a single node.
#[derive(Default)]
pub struct CustomerChangeQueue {
    waiting: Mutex<VecDeque<CustomerChangeJob>>,
    paused: AtomicBool,
    active: AtomicUsize,
}

impl CustomerChangeQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobQueue for CustomerChangeQueue {
    fn add(&self, job: CustomerChangeJob) -> CohortResult<()> {
        self.waiting.lock().push_back(job);
        Ok(())
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        info!("customer-change queue paused");
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        info!("customer-change queue resumed");
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn waiting_count(&self) -> usize {
        self.waiting.lock().len()
    }

    fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    fn take_next(&self) -> Option<CustomerChangeJob> {
        if self.is_paused() {
            return None;
        }
        let job = self.waiting.lock().pop_front()?;
        self.active.fetch_add(1, Ordering::SeqCst);
        Some(job)
    }

    fn finish(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Block until the waiting-job count falls under `threshold`, logging
/// progress periodically. Bounds queue growth during import spikes.
pub async fn wait_for_capacity(queue: &dyn JobQueue, threshold: usize, poll: Duration) {
    let mut polls = 0u64;
    loop {
        let waiting = queue.waiting_count();
        if waiting < threshold {
            return;
        }
        polls += 1;
        if polls % 10 == 0 {
            info!(waiting, threshold, "waiting for queue capacity");
        }
        tokio::time::sleep(poll).await;
    }
}

/// Block until no customer-change job is still active. Called after
/// pausing the queue, before a full recompute may touch membership.
pub async fn wait_until_drained(queue: &dyn JobQueue, backoff: Duration) {
    let mut polls = 0u64;
    loop {
        let active = queue.active_count();
        if active == 0 {
            return;
        }
        polls += 1;
        if polls % 10 == 0 {
            info!(active, "draining active customer-change jobs");
        }
        tokio::time::sleep(backoff).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> CustomerChangeJob {
        CustomerChangeJob {
            workspace_id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            event_name: None,
        }
    }

    #[test]
    fn test_pause_blocks_take_next() {
        let queue = CustomerChangeQueue::new();
        queue.add(job()).unwrap();

        queue.pause();
        assert!(queue.take_next().is_none());
        assert_eq!(queue.waiting_count(), 1);

        queue.resume();
        assert!(queue.take_next().is_some());
        assert_eq!(queue.active_count(), 1);
        queue.finish();
        assert_eq!(queue.active_count(), 0);
    }

    #[tokio::test]
    async fn test_wait_for_capacity_returns_under_threshold() {
        let queue = CustomerChangeQueue::new();
        queue.add(job()).unwrap();
        // threshold above waiting count: returns immediately
        wait_for_capacity(&queue, 2, Duration::from_millis(1)).await;

        queue.take_next().unwrap();
        queue.finish();
        wait_until_drained(&queue, Duration::from_millis(1)).await;
    }
}
