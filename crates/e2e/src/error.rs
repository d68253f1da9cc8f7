//! Error types for E2E verification

use thiserror::Error;

use crate::screen::ScreenId;

#[derive(Error, Debug)]
pub enum E2eError {
    /// The browser engine or driver process could not be brought up. Fatal for the whole run.
    #[error("Environment error: {0}")]
    Environment(String),

    #[error("Server failed to start: {0}")]
    ServerStartup(String),

    #[error("Server health check failed after {0} attempts")]
    ServerHealthCheck(usize),

    #[error("Playwright bridge error: {0}")]
    Bridge(String),

    #[error("Scenario parse error: {0}")]
    SpecParse(String),

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Timeout waiting for: {what} (last visible screen: {})", display_screen(.last_screen))]
    Timeout {
        what: String,
        last_screen: Option<ScreenId>,
    },

    #[error("No transition from {from} to {to}")]
    InvalidTransition { from: ScreenId, to: ScreenId },

    #[error("Assertion failed: {0}")]
    AssertionFailed(String),

    #[error("Request reached the real network: {method} {url} (no active mock for {guard})")]
    MockMismatch {
        method: String,
        url: String,
        guard: String,
    },

    #[error("Mock rule conflict: {0}")]
    MockConflict(String),

    #[error("Invalid storage snapshot: {0}")]
    Snapshot(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Pattern error: {0}")]
    Pattern(#[from] regex::Error),
}

fn display_screen(screen: &Option<ScreenId>) -> &'static str {
    screen.map(|s| s.as_str()).unwrap_or("unknown")
}

impl E2eError {
    pub fn timeout(what: impl Into<String>) -> Self {
        E2eError::Timeout {
            what: what.into(),
            last_screen: None,
        }
    }

    /// Fatal errors abort the whole run rather than a single scenario.
    pub fn is_fatal(&self) -> bool {
        matches!(self, E2eError::Environment(_))
    }
}

pub type E2eResult<T> = Result<T, E2eError>;
