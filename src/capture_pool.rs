//! Admission control for capture jobs
//!
//! At most `max_concurrent` jobs run against the shared browser at once.
//! Further jobs wait in arrival order; the tokio semaphore hands released
//! permits to waiters first-come first-served.

use crate::engine::{CaptureEngine, CapturedPage, ChromeEngine};
use crate::{CaptureError, CaptureRequest, Config, Metrics};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

struct SlotState {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    waiting: AtomicUsize,
    metrics: Arc<Metrics>,
}

impl SlotState {
    fn active(&self) -> usize {
        self.max_concurrent
            .saturating_sub(self.semaphore.available_permits())
    }

    fn queued(&self) -> usize {
        self.waiting.load(Ordering::Relaxed)
    }

    fn publish(&self) {
        self.metrics.set_pool_state(self.active(), self.queued());
    }
}

/// A held concurrency slot. Dropping it admits the next waiter.
pub struct Slot {
    permit: Option<OwnedSemaphorePermit>,
    state: Arc<SlotState>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        drop(self.permit.take());
        self.state.publish();
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("held", &self.permit.is_some())
            .field("active", &self.state.active())
            .field("max_concurrent", &self.state.max_concurrent)
            .finish()
    }
}

/// Counts a caller as queued for as long as it waits, including if the wait is cancelled.
struct Queued<'a>(&'a SlotState);

impl<'a> Queued<'a> {
    fn enter(state: &'a SlotState) -> Self {
        state.waiting.fetch_add(1, Ordering::Relaxed);
        state.publish();
        Self(state)
    }
}

impl Drop for Queued<'_> {
    fn drop(&mut self) {
        self.0.waiting.fetch_sub(1, Ordering::Relaxed);
        self.0.publish();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub max_concurrent: usize,
    pub active: usize,
    pub queued: usize,
    pub browser_running: bool,
}

pub struct CapturePool {
    engine: Arc<dyn CaptureEngine>,
    state: Arc<SlotState>,
    is_shutting_down: AtomicBool,
}

impl CapturePool {
    pub fn new(engine: Arc<dyn CaptureEngine>, max_concurrent: usize, metrics: Arc<Metrics>) -> Self {
        let state = Arc::new(SlotState {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            waiting: AtomicUsize::new(0),
            metrics,
        });

        Self {
            engine,
            state,
            is_shutting_down: AtomicBool::new(false),
        }
    }

    /// Pool over a lazily launched headless Chrome.
    pub fn with_chrome(config: &Config, metrics: Arc<Metrics>) -> Self {
        let engine = Arc::new(ChromeEngine::new(config.clone()));
        Self::new(engine, config.pool.max_concurrent, metrics)
    }

    /// Waits for a free slot. Waiters are admitted in arrival order.
    pub async fn acquire_slot(&self) -> Result<Slot, CaptureError> {
        if self.is_shutting_down.load(Ordering::Relaxed) {
            return Err(CaptureError::BrowserUnavailable);
        }

        let semaphore = self.state.semaphore.clone();
        let permit = match semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                let _queued = Queued::enter(&self.state);
                debug!("All {} capture slots busy, queueing", self.state.max_concurrent);
                semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| CaptureError::BrowserUnavailable)?
            }
        };

        let slot = Slot {
            permit: Some(permit),
            state: self.state.clone(),
        };
        self.state.publish();
        Ok(slot)
    }

    /// Runs one job in a slot the caller already holds. The slot is released
    /// once the engine returns, on every outcome.
    ///
    /// Dropping this future mid-run abandons the job, so callers that can be
    /// cancelled drive it from a task of their own.
    pub async fn run_in(&self, slot: Slot, request: &CaptureRequest) -> Result<CapturedPage, CaptureError> {
        let result = self.engine.capture(request).await;
        drop(slot);
        result
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            max_concurrent: self.state.max_concurrent,
            active: self.state.active(),
            queued: self.state.queued(),
            browser_running: self.engine.is_running(),
        }
    }

    /// Rejects queued and future jobs, then shuts the engine down once running jobs finish.
    pub async fn shutdown(&self) {
        info!("Shutting down capture pool...");
        self.is_shutting_down.store(true, Ordering::Relaxed);
        self.state.semaphore.close();
        self.engine.shutdown().await;
        info!("Capture pool shutdown complete");
    }
}
