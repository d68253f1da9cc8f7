//! UI timing constants of the app under test
//!
//! Some transitions are not signalled by a clean visibility predicate: the
//! disclaimer fades out over a fixed duration and the interview hands over to
//! the history screen after a fixed settle delay. Those numbers live here and
//! nowhere else.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    /// CSS opacity transition on `#disclaimer-modal` after acceptance
    pub disclaimer_fade_ms: u64,

    /// Delay between the `[HPI_COMPLETE]` response and the switch to the history screen
    pub hpi_settle_ms: u64,

    /// Bound for a direct (click-and-show) transition
    pub direct_timeout_ms: u64,

    /// Bound for a content-driven transition waiting on a mocked response
    pub async_timeout_ms: u64,

    /// Bound for page loads and reloads
    pub navigation_timeout_ms: u64,

    /// Bound for locating and acting on a control
    pub action_timeout_ms: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            disclaimer_fade_ms: 500,
            hpi_settle_ms: 2000,
            direct_timeout_ms: 5000,
            async_timeout_ms: 10_000,
            navigation_timeout_ms: 30_000,
            action_timeout_ms: 5000,
        }
    }
}

impl Timings {
    pub fn disclaimer_fade(&self) -> Duration {
        Duration::from_millis(self.disclaimer_fade_ms)
    }

    pub fn hpi_settle(&self) -> Duration {
        Duration::from_millis(self.hpi_settle_ms)
    }

    pub fn direct_timeout(&self) -> Duration {
        Duration::from_millis(self.direct_timeout_ms)
    }

    pub fn async_timeout(&self) -> Duration {
        Duration::from_millis(self.async_timeout_ms)
    }

    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_millis(self.navigation_timeout_ms)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }
}
