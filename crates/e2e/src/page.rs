//! Browser engine, context and page seams
//!
//! The harness talks to a browser only through these traits. The Playwright
//! bridge implements them against a real browser; integration tests implement
//! them against an in-process simulation of the app.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::error::E2eResult;
use crate::mock::RouteRegistry;
use crate::profile::Profile;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitState {
    #[default]
    Visible,
    Hidden,
    Attached,
    Detached,
}

impl WaitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WaitState::Visible => "visible",
            WaitState::Hidden => "hidden",
            WaitState::Attached => "attached",
            WaitState::Detached => "detached",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub fn is_non_zero(&self) -> bool {
        self.width > 0.0 && self.height > 0.0
    }
}

/// One logical browser tab
#[async_trait]
pub trait PageHandle: Send + Sync {
    async fn goto(&self, url: &str, timeout: Duration) -> E2eResult<()>;

    async fn reload(&self, timeout: Duration) -> E2eResult<()>;

    async fn click(&self, selector: &str, timeout: Duration) -> E2eResult<()>;

    async fn fill(&self, selector: &str, value: &str) -> E2eResult<()>;

    async fn select_option(&self, selector: &str, value: &str) -> E2eResult<()>;

    async fn input_value(&self, selector: &str) -> E2eResult<String>;

    async fn is_visible(&self, selector: &str) -> E2eResult<bool>;

    async fn wait_for(&self, selector: &str, state: WaitState, timeout: Duration) -> E2eResult<()>;

    /// `id` attribute of the first element matching `selector`
    async fn element_id(&self, selector: &str) -> E2eResult<Option<String>>;

    async fn text_content(&self, selector: &str) -> E2eResult<Option<String>>;

    async fn bounding_box(&self, selector: &str) -> E2eResult<Option<BoundingBox>>;

    async fn local_storage_get(&self, key: &str) -> E2eResult<Option<String>>;

    /// Write `entries` into local storage before the page's first document
    /// runs. Later reloads of the same tab are not re-seeded.
    async fn seed_local_storage(&self, entries: &[(String, String)]) -> E2eResult<()>;

    async fn screenshot(&self, path: &Path, full_page: bool) -> E2eResult<()>;

    async fn close(&self) -> E2eResult<()>;
}

/// An isolated browsing context with its own storage, cookies and route registry
#[async_trait]
pub trait ContextHandle: Send + Sync {
    async fn new_page(&self) -> E2eResult<Arc<dyn PageHandle>>;

    /// Start intercepting requests matching `pattern`; they are answered from
    /// the registry the context was created with.
    async fn intercept(&self, pattern: &str) -> E2eResult<()>;

    async fn close(&self) -> E2eResult<()>;
}

#[async_trait]
pub trait Engine: Send + Sync {
    async fn new_context(
        &self,
        profile: &Profile,
        routes: Arc<RouteRegistry>,
        observations: ObservationLog,
    ) -> E2eResult<Arc<dyn ContextHandle>>;

    async fn shutdown(&self) -> E2eResult<()>;
}

/// Starts a fresh engine for every session
#[async_trait]
pub trait EngineLauncher: Send + Sync {
    async fn launch(&self) -> E2eResult<Arc<dyn Engine>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationKind {
    Console { level: String },
    PageError,
}

/// A console message or uncaught page error seen in a context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub context: String,
    pub kind: ObservationKind,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Side channel collecting observations; pushing never blocks the scenario.
#[derive(Debug, Clone, Default)]
pub struct ObservationLog {
    entries: Arc<Mutex<Vec<Observation>>>,
}

impl ObservationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, context: &str, kind: ObservationKind, text: impl Into<String>) {
        self.entries.lock().push(Observation {
            context: context.to_string(),
            kind,
            text: text.into(),
            timestamp: Utc::now(),
        });
    }

    pub fn snapshot(&self) -> Vec<Observation> {
        self.entries.lock().clone()
    }

    pub fn page_errors(&self) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|o| o.kind == ObservationKind::PageError)
            .count()
    }
}
