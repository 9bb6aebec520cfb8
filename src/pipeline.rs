//! The per-job capture sequence
//!
//! Every job runs in its own browsing context on the shared browser:
//! emulate a desktop viewport, load the page until the network settles,
//! wait for the target element, record its box, click it, let the page
//! react, take a full-page PNG and crop it around the element. The context
//! is closed whatever the outcome.

use crate::engine::{CapturedPage, PageInfo};
use crate::{BoundingBox, CaptureError, CaptureRequest, CaptureSettings};
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::page::{Page, ScreenshotParams};
use image::{GenericImageView, ImageFormat};
use serde::Deserialize;
use std::io::Cursor;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

const NETWORK_PROBE: &str = "({ ready: document.readyState === 'complete', resources: performance.getEntriesByType('resource').length })";

const ELEMENT_PROBE: &str = r#"(() => {
    let el;
    try {
        el = document.querySelector(__SELECTOR__);
    } catch (e) {
        return { found: false, visible: false, invalid: String(e) };
    }
    if (!el) {
        return { found: false, visible: false };
    }
    const r = el.getBoundingClientRect();
    const style = window.getComputedStyle(el);
    const visible = r.width > 0 && r.height > 0
        && style.visibility !== 'hidden' && style.display !== 'none';
    return {
        found: true,
        visible,
        rect: { x: r.left + window.scrollX, y: r.top + window.scrollY, width: r.width, height: r.height }
    };
})()"#;

const PAGE_INFO_PROBE: &str = r#"({
    title: document.title || '',
    url: window.location.href,
    description: (document.querySelector('meta[name="description"]') || {}).content || ''
})"#;

#[derive(Debug, Deserialize)]
struct NetworkProbe {
    ready: bool,
    resources: u64,
}

#[derive(Debug, Default, Deserialize)]
struct ElementProbe {
    found: bool,
    visible: bool,
    #[serde(default)]
    rect: Option<BoundingBox>,
    #[serde(default)]
    invalid: Option<String>,
}

fn element_probe_script(selector: &str) -> String {
    // A JSON string literal is also a valid JS string literal
    let literal = serde_json::Value::String(selector.to_string()).to_string();
    ELEMENT_PROBE.replace("__SELECTOR__", &literal)
}

/// Pixel rectangle inside the full-page image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Region centred on `bbox`, grown by `padding` on each side, capped at
/// `max_width` x `max_height` and shifted to lie inside the image.
pub fn crop_region(
    bbox: BoundingBox,
    image_width: u32,
    image_height: u32,
    padding: f64,
    max_width: u32,
    max_height: u32,
) -> Option<CropRegion> {
    let width = (bbox.width + 2.0 * padding)
        .min(max_width as f64)
        .min(image_width as f64);
    let height = (bbox.height + 2.0 * padding)
        .min(max_height as f64)
        .min(image_height as f64);

    let (center_x, center_y) = bbox.center();
    let x = (center_x - width / 2.0).clamp(0.0, (image_width as f64 - width).max(0.0));
    let y = (center_y - height / 2.0).clamp(0.0, (image_height as f64 - height).max(0.0));

    let region = CropRegion {
        x: x.floor() as u32,
        y: y.floor() as u32,
        width: width.floor() as u32,
        height: height.floor() as u32,
    };

    if region.width == 0 || region.height == 0 {
        None
    } else {
        Some(region)
    }
}

/// Crops a full-page PNG around `bbox`, which is in CSS pixels.
pub fn crop_png(
    full: &[u8],
    bbox: BoundingBox,
    settings: &CaptureSettings,
) -> Result<Vec<u8>, CaptureError> {
    let image = image::load_from_memory(full)
        .map_err(|e| CaptureError::Crop(format!("could not decode screenshot: {e}")))?;

    let scale = settings.viewport.device_scale_factor;
    let scaled = BoundingBox {
        x: bbox.x * scale,
        y: bbox.y * scale,
        width: bbox.width * scale,
        height: bbox.height * scale,
    };

    let (image_width, image_height) = image.dimensions();
    let region = crop_region(
        scaled,
        image_width,
        image_height,
        settings.crop_padding as f64 * scale,
        settings.max_crop_width,
        settings.max_crop_height,
    )
    .ok_or_else(|| {
        CaptureError::Crop(format!(
            "empty crop region for {image_width}x{image_height} screenshot"
        ))
    })?;

    let cropped = image.crop_imm(region.x, region.y, region.width, region.height);

    let mut png = Vec::new();
    cropped
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .map_err(|e| CaptureError::Crop(format!("could not encode crop: {e}")))?;

    Ok(png)
}

/// The crop, or the untouched full-page image if cropping fails.
///
/// The flag is true when the returned bytes are the crop.
pub fn crop_or_full(full: Vec<u8>, bbox: BoundingBox, settings: &CaptureSettings) -> (Vec<u8>, bool) {
    match crop_png(&full, bbox, settings) {
        Ok(cropped) => (cropped, true),
        Err(e) => {
            warn!("{}, returning full-page screenshot", e);
            (full, false)
        }
    }
}

struct IsolatedContext {
    id: BrowserContextId,
    page: Page,
}

impl IsolatedContext {
    async fn open(browser: &Browser) -> Result<Self, CaptureError> {
        let id = browser
            .execute(CreateBrowserContextParams::default())
            .await
            .map_err(|e| CaptureError::Unexpected(format!("could not create browsing context: {e}")))?
            .result
            .browser_context_id;

        let page = match CreateTargetParams::builder()
            .url("about:blank")
            .browser_context_id(id.clone())
            .build()
        {
            Ok(target) => browser.new_page(target).await.map_err(|e| e.to_string()),
            Err(e) => Err(e),
        };

        match page {
            Ok(page) => Ok(Self { id, page }),
            Err(e) => {
                dispose_context(browser, id).await;
                Err(CaptureError::Unexpected(format!("could not open page: {e}")))
            }
        }
    }

    async fn close(self, browser: &Browser) {
        if let Err(e) = self.page.close().await {
            warn!("Failed to close page: {}", e);
        }
        dispose_context(browser, self.id).await;
    }
}

async fn dispose_context(browser: &Browser, id: BrowserContextId) {
    if let Err(e) = browser.execute(DisposeBrowserContextParams::new(id)).await {
        warn!("Failed to dispose browsing context: {}", e);
    }
}

/// Runs one capture job against the shared browser.
pub async fn run_capture(
    browser: &Browser,
    request: &CaptureRequest,
    settings: &CaptureSettings,
) -> Result<CapturedPage, CaptureError> {
    let context = IsolatedContext::open(browser).await?;

    let outcome = match timeout(
        settings.job_timeout,
        capture_in_page(&context.page, request, settings),
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(_) => Err(CaptureError::Timeout(settings.job_timeout)),
    };

    context.close(browser).await;
    outcome
}

async fn capture_in_page(
    page: &Page,
    request: &CaptureRequest,
    settings: &CaptureSettings,
) -> Result<CapturedPage, CaptureError> {
    configure_page(page, settings).await?;

    debug!("Navigating to {}", request.url);
    navigate(page, &request.url, settings).await?;
    sleep(settings.load_settle).await;

    wait_for_visible_element(page, &request.selector, settings.element_timeout).await?;
    let bbox = element_box(page, &request.selector).await?;
    debug!("Element box: {:?}", bbox);

    click_element(page, &request.selector).await?;
    sleep(settings.click_settle).await;
    timeout(
        settings.navigation_timeout,
        wait_for_network_idle(page, settings.network_idle_window),
    )
    .await
    .map_err(|_| {
        CaptureError::Navigation(format!(
            "page did not settle within {:?} after clicking '{}'",
            settings.navigation_timeout, request.selector
        ))
    })?;

    let full = page
        .screenshot(
            ScreenshotParams::builder()
                .format(CaptureScreenshotFormat::Png)
                .full_page(true)
                .build(),
        )
        .await
        .map_err(|e| CaptureError::Unexpected(format!("full-page screenshot failed: {e}")))?;

    let (png, cropped) = crop_or_full(full, bbox, settings);
    let info = page_info(page).await?;

    Ok(CapturedPage::new(request, png, info, cropped))
}

async fn configure_page(page: &Page, settings: &CaptureSettings) -> Result<(), CaptureError> {
    let viewport = &settings.viewport;
    let metrics = SetDeviceMetricsOverrideParams::builder()
        .width(viewport.width)
        .height(viewport.height)
        .device_scale_factor(viewport.device_scale_factor)
        .mobile(false)
        .build()
        .map_err(CaptureError::Unexpected)?;
    page.execute(metrics).await?;

    let user_agent = SetUserAgentOverrideParams::builder()
        .user_agent(settings.user_agent.clone())
        .build()
        .map_err(CaptureError::Unexpected)?;
    page.execute(user_agent).await?;

    Ok(())
}

async fn navigate(page: &Page, url: &str, settings: &CaptureSettings) -> Result<(), CaptureError> {
    let load = async {
        page.goto(url)
            .await
            .map_err(|e| CaptureError::Navigation(format!("{url}: {e}")))?;
        wait_for_network_idle(page, settings.network_idle_window).await;
        Ok(())
    };

    timeout(settings.navigation_timeout, load)
        .await
        .map_err(|_| {
            CaptureError::Navigation(format!(
                "{url} did not reach network idle within {:?}",
                settings.navigation_timeout
            ))
        })?
}

/// Resolves once the document is complete and no new resource has been
/// requested for `quiet`. Unbounded; callers apply a timeout.
async fn wait_for_network_idle(page: &Page, quiet: Duration) {
    let mut last_count: Option<u64> = None;
    let mut quiet_since = Instant::now();

    loop {
        let probe = match page.evaluate(NETWORK_PROBE).await {
            Ok(result) => result.into_value::<NetworkProbe>().ok(),
            Err(e) => {
                // Evaluation fails while a navigation swaps the document
                debug!("Network probe failed: {}", e);
                None
            }
        };

        match probe {
            Some(probe) if probe.ready => {
                if last_count == Some(probe.resources) {
                    if quiet_since.elapsed() >= quiet {
                        return;
                    }
                } else {
                    last_count = Some(probe.resources);
                    quiet_since = Instant::now();
                }
            }
            _ => {
                last_count = None;
                quiet_since = Instant::now();
            }
        }

        sleep(POLL_INTERVAL).await;
    }
}

async fn probe_element(page: &Page, selector: &str) -> Result<ElementProbe, CaptureError> {
    let result = page.evaluate(element_probe_script(selector)).await?;
    Ok(result.into_value::<ElementProbe>()?)
}

async fn wait_for_visible_element(
    page: &Page,
    selector: &str,
    wait: Duration,
) -> Result<(), CaptureError> {
    let deadline = Instant::now() + wait;
    let mut seen = false;

    loop {
        match probe_element(page, selector).await {
            Ok(probe) if probe.visible => return Ok(()),
            Ok(ElementProbe {
                invalid: Some(reason),
                ..
            }) => {
                return Err(CaptureError::ElementNotFound(format!(
                    "invalid selector '{selector}': {reason}"
                )))
            }
            Ok(probe) => seen |= probe.found,
            Err(e) => debug!("Element probe failed: {}", e),
        }

        if Instant::now() >= deadline {
            let reason = if seen {
                "never became visible"
            } else {
                "did not match any element"
            };
            return Err(CaptureError::ElementNotFound(format!(
                "'{selector}' {reason} within {wait:?}"
            )));
        }

        sleep(POLL_INTERVAL).await;
    }
}

async fn element_box(page: &Page, selector: &str) -> Result<BoundingBox, CaptureError> {
    let probe = probe_element(page, selector)
        .await
        .map_err(|e| CaptureError::ElementNotVisible(format!("'{selector}': {e}")))?;

    match probe.rect {
        Some(rect) if probe.found && !rect.is_empty() => Ok(rect),
        _ => Err(CaptureError::ElementNotVisible(format!(
            "'{selector}' has no bounding box"
        ))),
    }
}

async fn click_element(page: &Page, selector: &str) -> Result<(), CaptureError> {
    let element = page.find_element(selector).await.map_err(|e| {
        CaptureError::ElementNotVisible(format!("'{selector}' could not be resolved: {e}"))
    })?;

    element
        .click()
        .await
        .map_err(|e| CaptureError::ElementNotVisible(format!("'{selector}' could not be clicked: {e}")))?;

    Ok(())
}

async fn page_info(page: &Page) -> Result<PageInfo, CaptureError> {
    let result = page
        .evaluate(PAGE_INFO_PROBE)
        .await
        .map_err(|e| CaptureError::Unexpected(format!("could not read page metadata: {e}")))?;
    Ok(result.into_value::<PageInfo>()?)
}
