//! # Capture Service
//!
//! A local HTTP service that captures a screenshot of the area around one
//! element of a web page, after clicking it, using a shared headless Chrome.
//! Results are cached per (URL, selector) so repeated requests are served
//! without touching the browser.
//!
//! ## Request Flow
//!
//! | Stage | Component | Behavior |
//! |-------|-----------|----------|
//! | Validation | [`CaptureRequest::validate`] | Rejects missing fields and non-http(s) URLs |
//! | Cache lookup | [`CacheStore`] | 24 hour TTL, 100 entries, oldest evicted first |
//! | Admission | [`CapturePool`] | 3 concurrent jobs, FIFO queue for the rest |
//! | Capture | [`pipeline`] | Isolated context, navigate, click, full-page PNG, crop |
//! | Write-through | [`CaptureService`] | Only successful results are cached |
//!
//! ## Capture Geometry
//!
//! The crop is centred on the element's box, grown by 100px on each side and
//! capped at 800x600, then shifted to stay inside the page image. If cropping
//! fails the full-page image is returned instead.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use capture_service::{CaptureRequest, CaptureService, Config, Metrics};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = CaptureService::from_config(&Config::default(), Arc::new(Metrics::noop())).await?;
//!
//!     let request = CaptureRequest::new("https://example.com", "a").with_element_type("a");
//!     let response = service.capture(&request).await?;
//!     println!("{} bytes, cached: {}", response.result.metadata.map_or(0, |m| m.screenshot_size), response.cached);
//!
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ### HTTP Service
//! ```bash
//! capture-service --cache-dir ./cache serve --port 3001 --metrics
//! ```
//!
//! ### Single Capture
//! ```bash
//! capture-service capture --url https://example.com --selector a --output link.png
//! ```

/// Configuration and settings for the capture service
pub mod config;

/// Error types and error handling utilities
pub mod error;

/// Request, result and geometry types
pub mod model;

/// Result cache with TTL, bounded size and optional persistence
pub mod cache_store;

/// Bounded FIFO admission of capture jobs
pub mod capture_pool;

/// Shared browser ownership behind the capture seam
pub mod engine;

/// The per-job browser automation sequence
pub mod pipeline;

/// Facade combining validation, cache and pool
pub mod capture_service;

/// HTTP routes and server lifecycle
pub mod server;

/// Command-line interface implementation
pub mod cli;

/// Metrics handles and Prometheus exporter
pub mod metrics;

/// Utility functions and helpers
pub mod utils;

#[cfg(test)]
mod tests;

pub use cache_store::*;
pub use capture_pool::*;
pub use capture_service::*;
pub use cli::*;
pub use config::*;
pub use engine::{CaptureEngine, CapturedPage, ChromeEngine, PageInfo};
pub use error::*;
pub use self::metrics::*;
pub use model::*;
pub use server::*;
pub use utils::*;
