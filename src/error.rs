use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RenderError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid abort-request pattern: {0}")]
    InvalidPattern(String),

    #[error("Navigation timeout of {} ms exceeded", .0.as_millis())]
    NavigationTimeout(Duration),

    #[error("no response")]
    NoResponse,

    #[error("No healthy renderer worker available")]
    WorkerUnavailable,

    #[error("Browser of worker {worker} exited while rendering")]
    BrowserCrashed { worker: usize },

    #[error("Browser launch failed: {0}")]
    BrowserLaunchFailed(String),

    #[error("Ad-block host list could not be loaded: {0}")]
    AdBlockLoad(String),

    #[error("Navigation failed: {0}")]
    Navigation(String),

    #[error("Chrome error: {0}")]
    Chrome(String),

    #[error("Page error: {0}")]
    Page(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Renderer pool is shutting down")]
    ShuttingDown,
}

impl RenderError {
    /// HTTP-equivalent status code for this failure.
    pub fn status_code(&self) -> u16 {
        match self {
            RenderError::InvalidUrl(_) | RenderError::InvalidPattern(_) | RenderError::NoResponse => 400,
            RenderError::NavigationTimeout(_) => 504,
            RenderError::ShuttingDown => 503,
            _ => 500,
        }
    }

    /// Message that is safe to hand back to a caller.
    ///
    /// Caller mistakes are echoed verbatim; operational faults are reduced to a
    /// short description so browser internals never leak through the HTTP layer.
    pub fn public_message(&self) -> String {
        match self {
            RenderError::InvalidUrl(_) => "Invalid URL".to_string(),
            RenderError::InvalidPattern(_)
            | RenderError::NavigationTimeout(_)
            | RenderError::NoResponse
            | RenderError::Navigation(_) => self.to_string(),
            RenderError::WorkerUnavailable | RenderError::BrowserCrashed { .. } => {
                "Renderer unavailable".to_string()
            }
            RenderError::ShuttingDown => "Renderer is shutting down".to_string(),
            _ => "Internal render error".to_string(),
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            RenderError::InvalidUrl(_)
            | RenderError::InvalidPattern(_)
            | RenderError::NavigationTimeout(_)
            | RenderError::NoResponse
            | RenderError::Navigation(_) => ErrorSeverity::Low,
            RenderError::Configuration(_)
            | RenderError::BrowserLaunchFailed(_)
            | RenderError::WorkerUnavailable
            | RenderError::AdBlockLoad(_) => ErrorSeverity::High,
            _ => ErrorSeverity::Medium,
        }
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            RenderError::InvalidUrl(_) => "invalid_url",
            RenderError::InvalidPattern(_) => "invalid_pattern",
            RenderError::NavigationTimeout(_) => "timeout",
            RenderError::NoResponse => "no_response",
            RenderError::WorkerUnavailable => "worker_unavailable",
            RenderError::BrowserCrashed { .. } => "browser_crashed",
            RenderError::BrowserLaunchFailed(_) => "launch_failed",
            RenderError::AdBlockLoad(_) => "adblock_load",
            RenderError::Navigation(_) => "navigation",
            RenderError::Chrome(_) => "chrome",
            RenderError::Page(_) => "page",
            RenderError::Configuration(_) => "configuration",
            RenderError::Io(_) => "io",
            RenderError::Serialization(_) => "serialization",
            RenderError::ShuttingDown => "shutting_down",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
}

impl From<chromiumoxide::error::CdpError> for RenderError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        match err {
            chromiumoxide::error::CdpError::Timeout => {
                RenderError::Chrome("CDP request timed out".to_string())
            }
            other => RenderError::Chrome(other.to_string()),
        }
    }
}

impl From<std::io::Error> for RenderError {
    fn from(err: std::io::Error) -> Self {
        RenderError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for RenderError {
    fn from(err: serde_json::Error) -> Self {
        RenderError::Serialization(err.to_string())
    }
}
