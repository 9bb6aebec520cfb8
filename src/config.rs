//! Configuration management with serde serialization/deserialization
//!
//! Holds every tunable of the capture service: HTTP binding, cache bounds,
//! pool admission, and the timings and geometry of the capture pipeline.

use crate::CaptureError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Desktop Chrome user agent presented by every isolated browsing context.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Main configuration structure for the capture service
///
/// # Examples
///
/// ```rust
/// use capture_service::Config;
///
/// let config = Config::default();
/// assert_eq!(config.pool.max_concurrent, 3);
/// assert_eq!(config.cache.max_entries, 100);
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// HTTP listener settings
    pub server: ServerSettings,

    /// Cache bounds and persistence
    pub cache: CacheSettings,

    /// Worker pool admission
    pub pool: PoolSettings,

    /// Per-job pipeline timings and crop geometry
    pub capture: CaptureSettings,

    /// Path to Chrome/Chromium executable (default: auto-detect)
    pub chrome_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            cache: CacheSettings::default(),
            pool: PoolSettings::default(),
            capture: CaptureSettings::default(),
            chrome_path: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Bind address (default: 127.0.0.1)
    ///
    /// The service has no authentication, so it should stay on loopback.
    pub host: String,

    /// Listen port (default: 3001)
    pub port: u16,

    /// Serve Prometheus text exposition at `/metrics` (default: false)
    pub metrics_endpoint: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3001,
            metrics_endpoint: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Directory for one JSON file per entry (default: none, memory only)
    pub dir: Option<PathBuf>,

    /// Entry count above which the oldest entries are evicted (default: 100)
    pub max_entries: usize,

    /// Age after which an entry is never returned (default: 24 hours)
    pub ttl: Duration,

    /// Period of the background purge of expired entries (default: 1 hour)
    pub sweep_interval: Option<Duration>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            dir: None,
            max_entries: 100,
            ttl: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Some(Duration::from_secs(60 * 60)),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Capture jobs allowed to run at once (default: 3)
    pub max_concurrent: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self { max_concurrent: 3 }
    }
}

/// Browser viewport used by every capture context
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Viewport {
    /// Viewport width in pixels (default: 1920)
    pub width: u32,

    /// Viewport height in pixels (default: 1080)
    pub height: u32,

    /// Device pixel ratio (default: 1.0)
    pub device_scale_factor: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            device_scale_factor: 1.0,
        }
    }
}

/// Timings and geometry of a single capture job
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CaptureSettings {
    pub viewport: Viewport,

    pub user_agent: String,

    /// Bound on navigation and on each network-idle wait (default: 30s)
    pub navigation_timeout: Duration,

    /// How long the target element may take to become visible (default: 10s)
    pub element_timeout: Duration,

    /// Pause after the initial load for late scripts (default: 2s)
    pub load_settle: Duration,

    /// Pause after clicking the element (default: 3s)
    pub click_settle: Duration,

    /// Quiet period with no new resource entries that counts as idle (default: 500ms)
    pub network_idle_window: Duration,

    /// Pixels added on every side of the element box before cropping (default: 100)
    pub crop_padding: u32,

    pub max_crop_width: u32,

    pub max_crop_height: u32,

    /// Outer bound over a whole job, covering steps without their own timeout.
    /// Must exceed [`CaptureSettings::step_bounds`] (default: 90s)
    pub job_timeout: Duration,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            viewport: Viewport::default(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            navigation_timeout: Duration::from_secs(30),
            element_timeout: Duration::from_secs(10),
            load_settle: Duration::from_secs(2),
            click_settle: Duration::from_secs(3),
            network_idle_window: Duration::from_millis(500),
            crop_padding: 100,
            max_crop_width: 800,
            max_crop_height: 600,
            job_timeout: Duration::from_secs(90),
        }
    }
}

impl CaptureSettings {
    /// Sum of the bounded waits in one job: navigation, the element wait, both
    /// settle pauses and the post-click idle wait.
    pub fn step_bounds(&self) -> Duration {
        self.navigation_timeout * 2 + self.element_timeout + self.load_settle + self.click_settle
    }
}

impl Config {
    /// Reads a JSON config file; absent keys keep their defaults.
    pub async fn from_file(path: &std::path::Path) -> Result<Self, CaptureError> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

/// Rejects settings that would make the service unable to admit or finish a job.
pub fn validate_config(config: &Config) -> Result<(), CaptureError> {
    let invalid = |msg: &str| Err(CaptureError::Validation(msg.to_string()));

    if config.pool.max_concurrent == 0 {
        return invalid("Max concurrent captures must be greater than 0");
    }

    if config.cache.max_entries == 0 {
        return invalid("Cache size must be greater than 0");
    }

    if config.cache.ttl.is_zero() {
        return invalid("Cache TTL must be greater than 0");
    }

    if matches!(config.cache.sweep_interval, Some(interval) if interval.is_zero()) {
        return invalid("Cache sweep interval must be greater than 0");
    }

    let capture = &config.capture;
    if capture.navigation_timeout.is_zero()
        || capture.element_timeout.is_zero()
        || capture.job_timeout.is_zero()
    {
        return invalid("Capture timeouts must be greater than 0");
    }

    if capture.job_timeout <= capture.step_bounds() {
        return Err(CaptureError::Validation(format!(
            "Job timeout {:?} must exceed the per-step timeouts ({:?})",
            capture.job_timeout,
            capture.step_bounds()
        )));
    }

    if capture.viewport.width == 0 || capture.viewport.height == 0 {
        return invalid("Viewport dimensions must be greater than 0");
    }

    if capture.max_crop_width == 0 || capture.max_crop_height == 0 {
        return invalid("Crop dimensions must be greater than 0");
    }

    Ok(())
}

/// Chrome command-line arguments for the shared headless browser
pub fn get_chrome_args(config: &Config) -> Vec<String> {
    let viewport = &config.capture.viewport;

    vec![
        "--headless".to_string(),
        "--no-sandbox".to_string(),
        "--disable-setuid-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-web-security".to_string(),
        "--disable-features=VizDisplayCompositor".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-backgrounding-occluded-windows".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--no-first-run".to_string(),
        format!("--window-size={},{}", viewport.width, viewport.height),
        format!(
            "--user-data-dir=/tmp/capture-service-{}",
            std::process::id()
        ),
    ]
}

pub fn create_browser_config(
    config: &Config,
) -> Result<chromiumoxide::browser::BrowserConfig, CaptureError> {
    use chromiumoxide::browser::BrowserConfig;

    let viewport = &config.capture.viewport;
    let mut builder = BrowserConfig::builder()
        .window_size(viewport.width, viewport.height)
        .request_timeout(config.capture.navigation_timeout)
        .args(get_chrome_args(config));

    if let Some(chrome_path) = &config.chrome_path {
        builder = builder.chrome_executable(chrome_path);
    }

    builder.build().map_err(CaptureError::BrowserLaunch)
}
