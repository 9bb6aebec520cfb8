use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    #[error("{0}")]
    Validation(String),

    #[error("Navigation failed: {0}")]
    Navigation(String),

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Element not visible: {0}")]
    ElementNotVisible(String),

    #[error("Crop failed: {0}")]
    Crop(String),

    #[error("Browser launch failed: {0}")]
    BrowserLaunch(String),

    #[error("Browser unavailable")]
    BrowserUnavailable,

    #[error("Capture job timed out after {0:?}")]
    Timeout(Duration),

    #[error("Unexpected error: {0}")]
    Unexpected(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CaptureError {
    /// Whether a later identical request has a reasonable chance to succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CaptureError::Navigation(_)
                | CaptureError::Timeout(_)
                | CaptureError::BrowserUnavailable
                | CaptureError::BrowserLaunch(_)
                | CaptureError::Unexpected(_)
        )
    }

    /// Stable code used as a metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            CaptureError::Validation(_) => "validation",
            CaptureError::Navigation(_) => "navigation",
            CaptureError::ElementNotFound(_) => "element_not_found",
            CaptureError::ElementNotVisible(_) => "element_not_visible",
            CaptureError::Crop(_) => "crop",
            CaptureError::BrowserLaunch(_) => "browser_launch",
            CaptureError::BrowserUnavailable => "browser_unavailable",
            CaptureError::Timeout(_) => "timeout",
            CaptureError::Unexpected(_) => "unexpected",
            CaptureError::Io(_) => "io",
            CaptureError::Serialization(_) => "serialization",
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, CaptureError::Validation(_))
    }
}

impl From<std::io::Error> for CaptureError {
    fn from(err: std::io::Error) -> Self {
        CaptureError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for CaptureError {
    fn from(err: serde_json::Error) -> Self {
        CaptureError::Serialization(err.to_string())
    }
}

impl From<chromiumoxide::error::CdpError> for CaptureError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        CaptureError::Unexpected(err.to_string())
    }
}
