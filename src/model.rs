//! Request and result types shared by the cache, the pool and the HTTP layer.
//!
//! Field names follow the JSON contract consumed by the browser extension,
//! hence the camelCase renames.

use crate::{validate_url, CaptureError};
use serde::{Deserialize, Serialize};

fn default_max_screenshots() -> u32 {
    25
}

/// A request to capture the area around one element of a page.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureRequest {
    #[serde(default)]
    pub url: String,

    /// CSS selector; the first match is the target.
    #[serde(default)]
    pub selector: String,

    /// Advisory tag name reported back in the metadata.
    #[serde(default)]
    pub element_type: String,

    /// Advisory cap carried for compatibility; the pipeline ignores it.
    #[serde(default = "default_max_screenshots")]
    pub max_screenshots: u32,
}

impl CaptureRequest {
    pub fn new(url: impl Into<String>, selector: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            selector: selector.into(),
            element_type: String::new(),
            max_screenshots: default_max_screenshots(),
        }
    }

    pub fn with_element_type(mut self, element_type: impl Into<String>) -> Self {
        self.element_type = element_type.into();
        self
    }

    /// Checks required fields before any cache or pool work happens.
    pub fn validate(&self) -> Result<(), CaptureError> {
        if self.url.trim().is_empty() || self.selector.trim().is_empty() {
            return Err(CaptureError::Validation(
                "Missing required parameters: url and selector".to_string(),
            ));
        }

        validate_url(&self.url)?;
        Ok(())
    }
}

/// Page facts gathered at the end of a successful capture.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageMetadata {
    pub title: String,
    /// URL after any redirects or click-triggered navigation.
    pub url: String,
    pub description: String,
    pub element_type: String,
    pub selector: String,
    pub original_url: String,
    /// Byte length of the PNG before base64 encoding.
    pub screenshot_size: usize,
    /// Epoch milliseconds.
    pub timestamp: u64,
}

/// Outcome of one capture job in wire form.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureResult {
    pub success: bool,

    /// Base64 PNG, present iff `success`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<PageMetadata>,

    /// Present iff `!success`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CaptureResult {
    pub fn captured(screenshot: String, metadata: PageMetadata) -> Self {
        Self {
            success: true,
            screenshot: Some(screenshot),
            metadata: Some(metadata),
            error: None,
        }
    }

    pub fn failed(error: &CaptureError) -> Self {
        Self {
            success: false,
            screenshot: None,
            metadata: None,
            error: Some(error.to_string()),
        }
    }
}

/// What the facade hands back: the result plus where it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureResponse {
    #[serde(flatten)]
    pub result: CaptureResult,
    pub cached: bool,
    /// Epoch milliseconds: when the entry was written for cache hits, now otherwise.
    pub timestamp: u64,
}

/// Element rectangle in page (document) pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize, Serialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub fn is_empty(&self) -> bool {
        !(self.width > 0.0 && self.height > 0.0)
    }

    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults_from_json() {
        let request: CaptureRequest =
            serde_json::from_str(r##"{"url": "https://example.com", "selector": "#cta"}"##)
                .unwrap();
        assert_eq!(request.url, "https://example.com");
        assert_eq!(request.selector, "#cta");
        assert_eq!(request.element_type, "");
        assert_eq!(request.max_screenshots, 25);
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_request_reads_camel_case_fields() {
        let request: CaptureRequest = serde_json::from_str(
            r#"{"url": "https://example.com", "selector": "a", "elementType": "a", "maxScreenshots": 1}"#,
        )
        .unwrap();
        assert_eq!(request.element_type, "a");
        assert_eq!(request.max_screenshots, 1);
    }

    #[test]
    fn test_request_validation() {
        assert!(CaptureRequest::new("", "#x").validate().unwrap_err().is_validation());
        assert!(CaptureRequest::new("https://example.com", "  ")
            .validate()
            .is_err());
        assert!(CaptureRequest::new("javascript:alert(1)", "#x")
            .validate()
            .is_err());

        let missing: CaptureRequest = serde_json::from_str(r##"{"selector": "#x"}"##).unwrap();
        let err = missing.validate().unwrap_err();
        assert!(err.to_string().starts_with("Missing required parameters"));
    }

    #[test]
    fn test_failed_result_serialization() {
        let err = CaptureError::Navigation("timed out after 30s".to_string());
        let json = serde_json::to_value(CaptureResult::failed(&err)).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "Navigation failed: timed out after 30s");
        assert!(json.get("screenshot").is_none());
        assert!(json.get("metadata").is_none());
    }

    #[test]
    fn test_response_flattens_result() {
        let metadata = PageMetadata {
            title: "Example".to_string(),
            url: "https://example.com/".to_string(),
            description: String::new(),
            element_type: "button".to_string(),
            selector: "#cta".to_string(),
            original_url: "https://example.com".to_string(),
            screenshot_size: 3,
            timestamp: 42,
        };
        let response = CaptureResponse {
            result: CaptureResult::captured("AAAA".to_string(), metadata),
            cached: true,
            timestamp: 42,
        };

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["screenshot"], "AAAA");
        assert_eq!(json["cached"], true);
        assert_eq!(json["metadata"]["originalUrl"], "https://example.com");
        assert_eq!(json["metadata"]["screenshotSize"], 3);
        assert_eq!(json["metadata"]["elementType"], "button");
    }

    #[test]
    fn test_bounding_box_helpers() {
        let bbox = BoundingBox { x: 10.0, y: 20.0, width: 100.0, height: 50.0 };
        assert!(!bbox.is_empty());
        assert_eq!(bbox.center(), (60.0, 45.0));
        assert!(BoundingBox { width: 0.0, ..bbox }.is_empty());
    }
}
