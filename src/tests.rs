#[cfg(test)]
mod integration_tests {
    use crate::engine::MockCaptureEngine;
    use crate::{
        create_router, AppState, CacheStore, CaptureEngine, CaptureError, CapturePool,
        CaptureRequest, CaptureService, CapturedPage, Metrics, PageInfo,
    };
    use async_trait::async_trait;
    use axum::body::Body;
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::Semaphore;
    use tower::ServiceExt;

    fn captured(request: &CaptureRequest) -> CapturedPage {
        let page = PageInfo {
            title: "Example Domain".to_string(),
            url: request.url.clone(),
            description: String::new(),
        };
        CapturedPage::new(request, vec![137, 80, 78, 71, 13, 10], page, true)
    }

    fn service_with(engine: impl CaptureEngine + 'static, max_concurrent: usize) -> CaptureService {
        let metrics = Arc::new(Metrics::noop());
        let cache = Arc::new(CacheStore::in_memory(100, Duration::from_secs(24 * 60 * 60)));
        let pool = Arc::new(CapturePool::new(
            Arc::new(engine),
            max_concurrent,
            metrics.clone(),
        ));
        CaptureService::new(cache, pool, metrics)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_invalid_request_never_reaches_engine() {
        let mut engine = MockCaptureEngine::new();
        engine.expect_capture().never();
        let service = service_with(engine, 3);

        let err = service
            .capture(&CaptureRequest::new("https://example.com", ""))
            .await
            .unwrap_err();
        assert!(err.is_validation());

        let err = service
            .capture(&CaptureRequest::new("ftp://example.com", "#cta"))
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert!(service.cache().is_empty());
    }

    #[tokio::test]
    async fn test_second_request_is_served_from_cache() {
        let mut engine = MockCaptureEngine::new();
        engine
            .expect_capture()
            .times(1)
            .returning(|request| Ok(captured(request)));
        let service = service_with(engine, 3);
        let request = CaptureRequest::new("https://example.com", "#cta").with_element_type("button");

        let first = service.capture(&request).await.unwrap();
        assert!(!first.cached);
        assert!(first.result.success);

        let second = service.capture(&request).await.unwrap();
        assert!(second.cached);
        assert_eq!(second.result.screenshot, first.result.screenshot);
        assert_eq!(second.result.metadata, first.result.metadata);

        let metadata = second.result.metadata.unwrap();
        assert_eq!(metadata.element_type, "button");
        assert_eq!(metadata.screenshot_size, 6);
        assert_eq!(service.cache_stats().count, 1);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let mut engine = MockCaptureEngine::new();
        engine
            .expect_capture()
            .times(2)
            .returning(|_| Err(CaptureError::Navigation("net::ERR_NAME_NOT_RESOLVED".to_string())));
        let service = service_with(engine, 3);
        let request = CaptureRequest::new("https://does-not-exist.invalid", "#cta");

        for _ in 0..2 {
            let err = service.capture(&request).await.unwrap_err();
            assert!(matches!(err, CaptureError::Navigation(_)));
        }
        assert!(service.cache().is_empty());
    }

    #[tokio::test]
    async fn test_element_not_found_releases_slot() {
        let mut engine = MockCaptureEngine::new();
        let mut calls = 0;
        engine.expect_capture().times(2).returning(move |request| {
            calls += 1;
            if calls == 1 {
                Err(CaptureError::ElementNotFound(format!(
                    "'{}' did not match any element within 10s",
                    request.selector
                )))
            } else {
                Ok(captured(request))
            }
        });
        engine.expect_is_running().return_const(true);
        let service = service_with(engine, 1);

        let err = service
            .capture(&CaptureRequest::new("https://example.com", "#missing"))
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("Element not found"));

        let ok = service
            .capture(&CaptureRequest::new("https://example.com", "#present"))
            .await
            .unwrap();
        assert!(ok.result.success);
        assert_eq!(service.pool_stats().active, 0);
    }

    /// Engine whose jobs block until the test releases them.
    struct GatedEngine {
        gate: Semaphore,
        running: AtomicUsize,
        peak: AtomicUsize,
        started: Mutex<Vec<String>>,
    }

    impl GatedEngine {
        fn new() -> Self {
            Self {
                gate: Semaphore::new(0),
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                started: Mutex::new(Vec::new()),
            }
        }

        fn started(&self) -> Vec<String> {
            self.started.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CaptureEngine for Arc<GatedEngine> {
        async fn capture(&self, request: &CaptureRequest) -> Result<CapturedPage, CaptureError> {
            self.started.lock().unwrap().push(request.url.clone());
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(running, Ordering::SeqCst);

            self.gate
                .acquire()
                .await
                .map_err(|_| CaptureError::BrowserUnavailable)?
                .forget();

            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(captured(request))
        }

        fn is_running(&self) -> bool {
            true
        }

        async fn shutdown(&self) {}
    }

    #[tokio::test]
    async fn test_at_most_three_jobs_run_and_fourth_waits_in_order() {
        let engine = Arc::new(GatedEngine::new());
        let service = service_with(engine.clone(), 3);

        let mut jobs = Vec::new();
        for i in 0..3 {
            let service = service.clone();
            jobs.push(tokio::spawn(async move {
                service
                    .capture(&CaptureRequest::new(format!("https://example.com/{i}"), "#cta"))
                    .await
            }));
            wait_until(|| engine.started().len() == i + 1).await;
        }

        let fourth = {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .capture(&CaptureRequest::new("https://example.com/3", "#cta"))
                    .await
            })
        };
        wait_until(|| service.pool_stats().queued == 1).await;

        let stats = service.pool_stats();
        assert_eq!(stats.active, 3);
        assert_eq!(stats.queued, 1);
        assert_eq!(engine.started().len(), 3);

        engine.gate.add_permits(1);
        wait_until(|| engine.started().len() == 4).await;
        assert_eq!(engine.started()[3], "https://example.com/3");

        engine.gate.add_permits(3);
        for job in jobs {
            assert!(!job.await.unwrap().unwrap().cached);
        }
        assert!(fourth.await.unwrap().unwrap().result.success);

        assert_eq!(engine.peak.load(Ordering::SeqCst), 3);
        assert_eq!(service.pool_stats().active, 0);
        assert_eq!(service.cache_stats().count, 4);
    }

    #[tokio::test]
    async fn test_dropped_caller_does_not_abandon_admitted_job() {
        let engine = Arc::new(GatedEngine::new());
        let service = service_with(engine.clone(), 1);

        let caller = {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .capture(&CaptureRequest::new("https://example.com/slow", "#cta"))
                    .await
            })
        };
        wait_until(|| engine.started().len() == 1).await;

        caller.abort();
        assert!(caller.await.unwrap_err().is_cancelled());
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        // Still mid-run: the slot stays held until the engine returns.
        assert_eq!(engine.running.load(Ordering::SeqCst), 1);
        assert_eq!(service.pool_stats().active, 1);

        engine.gate.add_permits(1);
        wait_until(|| service.cache_stats().count == 1).await;
        assert_eq!(engine.running.load(Ordering::SeqCst), 0);
        assert_eq!(service.pool_stats().active, 0);
        assert!(service
            .cache()
            .get("https://example.com/slow", "#cta")
            .await
            .is_some());
    }

    #[tokio::test]
    async fn test_crop_fallback_is_still_a_cached_success() {
        let full_page = vec![137, 80, 78, 71, 13, 10, 26, 10, 0, 0];
        let png = full_page.clone();
        let mut engine = MockCaptureEngine::new();
        engine.expect_capture().times(1).returning(move |request| {
            Ok(CapturedPage::new(request, png.clone(), PageInfo::default(), false))
        });
        let service = service_with(engine, 3);
        let request = CaptureRequest::new("https://example.com", "#huge");

        let first = service.capture(&request).await.unwrap();
        assert!(first.result.success);
        assert!(!first.cached);
        let encoded = STANDARD.encode(&full_page);
        assert_eq!(first.result.screenshot.as_deref(), Some(encoded.as_str()));
        assert_eq!(first.result.metadata.as_ref().unwrap().screenshot_size, full_page.len());

        let second = service.capture(&request).await.unwrap();
        assert!(second.cached);
        assert!(second.result.success);
        assert_eq!(second.result.screenshot, first.result.screenshot);
    }

    async fn send(state: &Arc<AppState>, request: Request<Body>) -> (StatusCode, Value) {
        let response = create_router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn post_screenshot(body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/screenshot")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_http_capture_and_cache_lifecycle() {
        let mut engine = MockCaptureEngine::new();
        engine
            .expect_capture()
            .times(1)
            .returning(|request| Ok(captured(request)));
        let state = Arc::new(AppState::new(service_with(engine, 3)));
        let body = json!({"url": "https://example.com", "selector": "#cta", "elementType": "button"});

        let (status, first) = send(&state, post_screenshot(body.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["success"], true);
        assert_eq!(first["cached"], false);
        assert_eq!(first["metadata"]["title"], "Example Domain");
        assert_eq!(first["metadata"]["originalUrl"], "https://example.com");

        let (status, second) = send(&state, post_screenshot(body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(second["cached"], true);
        assert_eq!(second["screenshot"], first["screenshot"]);

        let (status, stats) = send(&state, get("/cache/stats")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stats["success"], true);
        assert_eq!(stats["stats"]["count"], 1);
        assert_eq!(stats["stats"]["maxCacheSize"], 100);
        assert_eq!(stats["stats"]["cacheTTLHours"], 24.0);

        let clear = Request::builder()
            .method("DELETE")
            .uri("/cache")
            .body(Body::empty())
            .unwrap();
        let (status, cleared) = send(&state, clear).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cleared["success"], true);
        assert_eq!(cleared["message"], "Cache cleared successfully");

        let (_, stats) = send(&state, get("/cache/stats")).await;
        assert_eq!(stats["stats"]["count"], 0);
        assert!(stats["stats"]["oldestEntry"].is_null());
    }

    #[tokio::test]
    async fn test_http_missing_parameters_is_bad_request() {
        let mut engine = MockCaptureEngine::new();
        engine.expect_capture().never();
        let state = Arc::new(AppState::new(service_with(engine, 3)));

        let (status, body) = send(&state, post_screenshot(json!({"url": "https://example.com"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "Missing required parameters: url and selector");

        let malformed = Request::builder()
            .method("POST")
            .uri("/screenshot")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, body) = send(&state, malformed).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_http_capture_failure_is_server_error() {
        let mut engine = MockCaptureEngine::new();
        engine
            .expect_capture()
            .times(1)
            .returning(|_| Err(CaptureError::ElementNotFound("'#gone' did not match any element within 10s".to_string())));
        let state = Arc::new(AppState::new(service_with(engine, 3)));

        let (status, body) = send(
            &state,
            post_screenshot(json!({"url": "https://example.com", "selector": "#gone"})),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], false);
        assert_eq!(
            body["error"],
            "Element not found: '#gone' did not match any element within 10s"
        );
    }

    #[tokio::test]
    async fn test_http_health_and_disabled_metrics() {
        let mut engine = MockCaptureEngine::new();
        engine.expect_is_running().return_const(false);
        let state = Arc::new(AppState::new(service_with(engine, 3)));

        let (status, health) = send(&state, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(health["status"], "ok");
        assert_eq!(health["service"], "capture-service");
        assert_eq!(health["pool"]["maxConcurrent"], 3);
        assert_eq!(health["pool"]["browserRunning"], false);
        assert!(health["timestamp"].as_str().unwrap().ends_with('Z'));

        let (status, _) = send(&state, get("/metrics")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
