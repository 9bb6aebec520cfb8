use crate::CaptureError;
use metrics::{counter, gauge, histogram, Counter, Gauge, Histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use tracing::info;

/// Handles for every metric the service emits.
///
/// Handles bind to whatever recorder is installed when `new` runs, so
/// install the exporter first.
pub struct Metrics {
    pub cache_hits: Counter,
    pub cache_misses: Counter,
    pub jobs_succeeded: Counter,
    pub crop_fallbacks: Counter,
    pub job_duration: Histogram,
    pub pool_active_slots: Gauge,
    pub pool_queue_depth: Gauge,
    pub cache_entries: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            cache_hits: counter!("capture_cache_hits_total"),
            cache_misses: counter!("capture_cache_misses_total"),
            jobs_succeeded: counter!("capture_jobs_succeeded_total"),
            crop_fallbacks: counter!("capture_crop_fallbacks_total"),
            job_duration: histogram!("capture_job_duration_seconds"),
            pool_active_slots: gauge!("capture_pool_active_slots"),
            pool_queue_depth: gauge!("capture_pool_queue_depth"),
            cache_entries: gauge!("capture_cache_entries"),
        }
    }

    /// Handles that record nothing, for tests and one-shot CLI commands.
    pub fn noop() -> Self {
        Self {
            cache_hits: Counter::noop(),
            cache_misses: Counter::noop(),
            jobs_succeeded: Counter::noop(),
            crop_fallbacks: Counter::noop(),
            job_duration: Histogram::noop(),
            pool_active_slots: Gauge::noop(),
            pool_queue_depth: Gauge::noop(),
            cache_entries: Gauge::noop(),
        }
    }

    pub fn record_cache_lookup(&self, hit: bool) {
        if hit {
            self.cache_hits.increment(1);
        } else {
            self.cache_misses.increment(1);
        }
    }

    pub fn record_job(&self, duration: Duration, error: Option<&CaptureError>) {
        match error {
            None => self.jobs_succeeded.increment(1),
            Some(e) => counter!("capture_jobs_failed_total", "kind" => e.kind()).increment(1),
        }

        self.job_duration.record(duration.as_secs_f64());
    }

    pub fn record_crop_fallback(&self) {
        self.crop_fallbacks.increment(1);
    }

    pub fn set_pool_state(&self, active: usize, queued: usize) {
        self.pool_active_slots.set(active as f64);
        self.pool_queue_depth.set(queued as f64);
    }

    pub fn set_cache_entries(&self, count: usize) {
        self.cache_entries.set(count as f64);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Installs the global Prometheus recorder and returns the handle that renders it.
pub fn install_prometheus() -> Result<PrometheusHandle, CaptureError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| CaptureError::Unexpected(format!("failed to install metrics recorder: {e}")))?;

    info!("Prometheus recorder installed");
    Ok(handle)
}
