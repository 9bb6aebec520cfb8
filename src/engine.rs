//! Browser automation engine behind the capture pool
//!
//! `CaptureEngine` is the seam between admission control and the actual
//! browser work. `ChromeEngine` owns the single headless Chrome process,
//! launching it on first use and sharing it across all jobs; each job gets
//! its own isolated browsing context from the pipeline.

use crate::{
    create_browser_config, now_millis, pipeline, CaptureError, CaptureRequest, Config,
    PageMetadata,
};
use async_trait::async_trait;
use chromiumoxide::browser::Browser;
use chromiumoxide::error::CdpError;
use futures::{Stream, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// What a finished job produced, before base64 encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedPage {
    pub png: Vec<u8>,
    pub metadata: PageMetadata,
    /// False when cropping failed and `png` is the full-page image.
    pub cropped: bool,
}

/// Facts read from the page after the capture.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize)]
pub struct PageInfo {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub description: String,
}

impl CapturedPage {
    pub fn new(request: &CaptureRequest, png: Vec<u8>, page: PageInfo, cropped: bool) -> Self {
        let metadata = PageMetadata {
            title: page.title,
            url: page.url,
            description: page.description,
            element_type: request.element_type.clone(),
            selector: request.selector.clone(),
            original_url: request.url.clone(),
            screenshot_size: png.len(),
            timestamp: now_millis(),
        };

        Self {
            png,
            metadata,
            cropped,
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CaptureEngine: Send + Sync {
    /// Runs one capture job to completion. Callers hold a pool slot.
    async fn capture(&self, request: &CaptureRequest) -> Result<CapturedPage, CaptureError>;

    /// Whether the underlying browser has been launched.
    fn is_running(&self) -> bool;

    async fn shutdown(&self);
}

struct LaunchedBrowser {
    browser: Browser,
    handler: JoinHandle<Result<(), CdpError>>,
}

impl LaunchedBrowser {
    fn is_alive(&self) -> bool {
        !self.handler.is_finished()
    }

    async fn close(mut self) {
        if let Err(e) = self.browser.close().await {
            warn!("Failed to close browser cleanly: {}", e);
        }
        self.handler.abort();
    }
}

/// Polls the DevTools event stream for the browser's lifetime. `running` is
/// cleared when the stream ends or fails.
fn spawn_handler<S>(mut events: S, running: Arc<AtomicBool>) -> JoinHandle<Result<(), CdpError>>
where
    S: Stream<Item = Result<(), CdpError>> + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut outcome = Ok(());
        while let Some(event) = events.next().await {
            if let Err(e) = event {
                error!("Browser handler error: {}", e);
                outcome = Err(e);
                break;
            }
        }
        if outcome.is_ok() {
            info!("Browser handler stream ended");
        }
        running.store(false, Ordering::Relaxed);
        outcome
    })
}

pub struct ChromeEngine {
    config: Config,
    browser: RwLock<Option<LaunchedBrowser>>,
    /// Set on launch, cleared by the handler task when the connection ends.
    running: Arc<AtomicBool>,
    is_shutting_down: AtomicBool,
}

impl ChromeEngine {
    /// Nothing is launched until the first capture.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            browser: RwLock::new(None),
            running: Arc::new(AtomicBool::new(false)),
            is_shutting_down: AtomicBool::new(false),
        }
    }

    async fn launch(&self) -> Result<LaunchedBrowser, CaptureError> {
        let browser_config = create_browser_config(&self.config)?;

        let (browser, handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| CaptureError::BrowserLaunch(e.to_string()))?;

        self.running.store(true, Ordering::Relaxed);
        let handler = spawn_handler(handler, self.running.clone());

        info!("Headless browser launched");
        Ok(LaunchedBrowser { browser, handler })
    }

    /// Shared access to a live browser, launching or relaunching it if needed.
    ///
    /// Jobs hold the read guard for their whole run, so shutdown waits for them.
    async fn browser(&self) -> Result<RwLockReadGuard<'_, Option<LaunchedBrowser>>, CaptureError> {
        {
            let guard = self.browser.read().await;
            if guard.as_ref().is_some_and(LaunchedBrowser::is_alive) {
                return Ok(guard);
            }
        }

        let mut guard = self.browser.write().await;
        if self.is_shutting_down.load(Ordering::Relaxed) {
            return Err(CaptureError::BrowserUnavailable);
        }

        if !guard.as_ref().is_some_and(LaunchedBrowser::is_alive) {
            if let Some(stale) = guard.take() {
                warn!("Browser handler exited, relaunching");
                stale.close().await;
            }
            *guard = Some(self.launch().await?);
        }

        Ok(guard.downgrade())
    }
}

#[async_trait]
impl CaptureEngine for ChromeEngine {
    async fn capture(&self, request: &CaptureRequest) -> Result<CapturedPage, CaptureError> {
        if self.is_shutting_down.load(Ordering::Relaxed) {
            return Err(CaptureError::BrowserUnavailable);
        }

        let guard = self.browser().await?;
        let launched = guard.as_ref().ok_or(CaptureError::BrowserUnavailable)?;

        pipeline::run_capture(&launched.browser, request, &self.config.capture).await
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    async fn shutdown(&self) {
        self.is_shutting_down.store(true, Ordering::Relaxed);

        let mut guard = self.browser.write().await;
        if let Some(launched) = guard.take() {
            info!("Closing headless browser...");
            launched.close().await;
        }
        self.running.store(false, Ordering::Relaxed);
    }
}
