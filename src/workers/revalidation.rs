//! Bounded pool for background status revalidation.
//!
//! Each task holds one semaphore permit for its lifetime. A saturated pool
//! drops new work instead of queueing it; the next status read re-checks.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info};

pub const DEFAULT_MAX_IN_FLIGHT: usize = 64;

#[derive(Clone)]
pub struct RevalidationPool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl RevalidationPool {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }

    /// Run `task` in the background if a permit is free. Returns whether it
    /// was scheduled.
    pub fn spawn<F>(&self, label: &str, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                debug!(task = %label, capacity = self.capacity, "revalidation pool saturated, skipping");
                return false;
            }
        };

        tokio::spawn(async move {
            task.await;
            drop(permit);
        });
        true
    }

    /// Resolves once every scheduled task has finished.
    pub async fn wait_idle(&self) {
        let permits = u32::try_from(self.capacity).unwrap_or(u32::MAX);
        if let Ok(all) = self.semaphore.acquire_many(permits).await {
            drop(all);
        }
    }

    /// Wait for running tasks, then refuse new ones.
    pub async fn shutdown(&self) {
        info!(in_flight = self.in_flight(), "Draining revalidation pool");
        self.wait_idle().await;
        self.semaphore.close();
        info!("Revalidation pool stopped");
    }
}

impl Default for RevalidationPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IN_FLIGHT)
    }
}
