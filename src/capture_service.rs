//! The capture facade
//!
//! Ties validation, the result cache and the capture pool together. A
//! request is answered from the cache when a fresh entry exists; otherwise
//! it waits for a pool slot, runs the capture pipeline, and successful
//! results are written through to the cache.

use crate::{
    format_bytes, format_duration, now_millis, CacheStats, CacheStore, CaptureError, CapturePool,
    CaptureRequest, CaptureResponse, CaptureResult, Config, Metrics, PoolStats, Slot,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

/// Entry point for capture requests
///
/// Cheap to clone; clones share the cache and the pool.
///
/// # Examples
///
/// ```rust,no_run
/// use capture_service::{CaptureRequest, CaptureService, Config, Metrics};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let service = CaptureService::from_config(&Config::default(), Arc::new(Metrics::noop())).await?;
///
///     let request = CaptureRequest::new("https://example.com", "a");
///     let response = service.capture(&request).await?;
///     println!("cached: {}", response.cached);
///
///     service.shutdown().await;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct CaptureService {
    cache: Arc<CacheStore>,
    pool: Arc<CapturePool>,
    metrics: Arc<Metrics>,
}

impl CaptureService {
    pub fn new(cache: Arc<CacheStore>, pool: Arc<CapturePool>, metrics: Arc<Metrics>) -> Self {
        metrics.set_cache_entries(cache.len());
        Self {
            cache,
            pool,
            metrics,
        }
    }

    /// Opens the configured cache and a Chrome-backed pool. No browser is launched yet.
    pub async fn from_config(config: &Config, metrics: Arc<Metrics>) -> Result<Self, CaptureError> {
        let cache = Arc::new(CacheStore::open(&config.cache).await?);
        let pool = Arc::new(CapturePool::with_chrome(config, metrics.clone()));

        info!(
            "Capture service ready: {} cached entries, {} concurrent captures",
            cache.len(),
            config.pool.max_concurrent
        );

        Ok(Self::new(cache, pool, metrics))
    }

    pub async fn capture(&self, request: &CaptureRequest) -> Result<CaptureResponse, CaptureError> {
        request.validate()?;

        if let Some(entry) = self.cache.get(&request.url, &request.selector).await {
            info!("Cache hit for {} - {}", request.url, request.selector);
            self.metrics.record_cache_lookup(true);
            return Ok(CaptureResponse {
                result: entry.result,
                cached: true,
                timestamp: entry.timestamp,
            });
        }
        self.metrics.record_cache_lookup(false);

        let job_id = Uuid::new_v4();
        let span = info_span!(
            "capture_job",
            %job_id,
            url = %request.url,
            selector = %request.selector
        );

        // A caller that gives up while queued leaves the queue. Once admitted,
        // the job runs on its own task so it finishes, releases its browser
        // context and writes through even if the caller goes away.
        let started = Instant::now();
        let slot = match self.pool.acquire_slot().instrument(span.clone()).await {
            Ok(slot) => slot,
            Err(e) => return Err(span.in_scope(|| self.job_failed(e, started.elapsed()))),
        };

        let service = self.clone();
        let request = request.clone();
        tokio::spawn(async move { service.run_job(slot, &request, started).await }.instrument(span))
            .await
            .map_err(|e| CaptureError::Unexpected(format!("capture task failed: {e}")))?
    }

    async fn run_job(
        &self,
        slot: Slot,
        request: &CaptureRequest,
        started: Instant,
    ) -> Result<CaptureResponse, CaptureError> {
        let page = match self.pool.run_in(slot, request).await {
            Ok(page) => page,
            Err(e) => return Err(self.job_failed(e, started.elapsed())),
        };
        let duration = started.elapsed();
        self.metrics.record_job(duration, None);

        if !page.cropped {
            self.metrics.record_crop_fallback();
        }

        let size = page.png.len();
        let result = CaptureResult::captured(STANDARD.encode(&page.png), page.metadata);
        self.cache
            .set(&request.url, &request.selector, result.clone())
            .await;
        self.metrics.set_cache_entries(self.cache.len());

        info!("Captured {} in {}", format_bytes(size), format_duration(duration));
        Ok(CaptureResponse {
            result,
            cached: false,
            timestamp: now_millis(),
        })
    }

    fn job_failed(&self, e: CaptureError, duration: Duration) -> CaptureError {
        self.metrics.record_job(duration, Some(&e));
        error!(
            kind = e.kind(),
            retryable = e.is_retryable(),
            "Capture failed after {}: {}",
            format_duration(duration),
            e
        );
        e
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub async fn clear_cache(&self) {
        self.cache.clear().await;
        self.metrics.set_cache_entries(0);
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    /// Periodically drops expired cache entries. Abort the handle to stop it.
    pub fn start_cache_sweep(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let cache = self.cache.clone();
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let purged = cache.purge_expired().await;
                if purged > 0 {
                    info!("Purged {} expired cache entries", purged);
                }
                metrics.set_cache_entries(cache.len());
            }
        })
    }

    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}
