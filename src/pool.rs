//! Worker-slot pool
//!
//! A bounded counting semaphore limiting how many one-shot commands run at
//! once. Services and no-command executions never take a slot.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Clone)]
pub struct WorkerPool {
    semaphore: Option<Arc<Semaphore>>,
}

/// A held worker slot; dropping it frees the slot.
pub struct WorkerSlot {
    _permit: Option<OwnedSemaphorePermit>,
}

impl WorkerPool {
    /// `slots == 0` means unbounded.
    pub fn new(slots: usize) -> Self {
        Self {
            semaphore: (slots > 0).then(|| Arc::new(Semaphore::new(slots))),
        }
    }

    pub async fn acquire(&self) -> WorkerSlot {
        let permit = match &self.semaphore {
            Some(semaphore) => Some(
                semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .expect("worker pool semaphore is never closed"),
            ),
            None => None,
        };
        WorkerSlot { _permit: permit }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn bounds_concurrency() {
        let pool = WorkerPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            let running = running.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                let _slot = pool.acquire().await;
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn zero_slots_is_unbounded() {
        let pool = WorkerPool::new(0);
        let _a = pool.acquire().await;
        let _b = pool.acquire().await;
    }
}
