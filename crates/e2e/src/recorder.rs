//! Checkpoint recording: screenshots plus assertion results
//!
//! Every checkpoint lands at `<artifacts>/<scenario>/<name>.png`. A name reused
//! within a run gets a numeric suffix, so evidence from an earlier step is
//! never overwritten by a later one.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::E2eResult;
use crate::page::PageHandle;

/// One explicit check and its outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assertion {
    pub description: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Assertion {
    pub fn pass(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            passed: true,
            detail: None,
        }
    }

    pub fn fail(description: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            passed: false,
            detail: Some(detail.into()),
        }
    }

    /// Detail is kept only when the check fails.
    pub fn check(description: impl Into<String>, passed: bool, detail: Option<String>) -> Self {
        Self {
            description: description.into(),
            passed,
            detail: if passed { None } else { detail },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub name: String,
    pub screenshot_path: Option<PathBuf>,
    pub timestamp: DateTime<Utc>,
    pub sha256: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub assertions: Vec<Assertion>,
    /// Why the screenshot could not be taken, if it could not
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_error: Option<String>,
}

impl Checkpoint {
    pub fn passed(&self) -> bool {
        self.assertions.iter().all(|a| a.passed)
    }

    pub fn failed_assertions(&self) -> impl Iterator<Item = &Assertion> {
        self.assertions.iter().filter(|a| !a.passed)
    }
}

pub struct Recorder {
    dir: PathBuf,
    used: Mutex<HashSet<String>>,
    checkpoints: Mutex<Vec<Checkpoint>>,
}

impl Recorder {
    /// Create a recorder writing under `artifacts_dir/<scenario>`
    pub fn new(artifacts_dir: &Path, scenario: &str) -> E2eResult<Self> {
        let dir = artifacts_dir.join(slug(scenario));
        std::fs::create_dir_all(&dir)?;

        Ok(Self {
            dir,
            used: Mutex::new(HashSet::new()),
            checkpoints: Mutex::new(Vec::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Claim the next unused path for `name` in this run
    pub fn reserve_path(&self, name: &str) -> (String, PathBuf) {
        let unique = claim_slug(&mut self.used.lock(), name);
        let path = self.dir.join(format!("{}.png", unique));
        (unique, path)
    }

    /// Capture the viewport and store the checkpoint with `assertions`.
    ///
    /// A failed screenshot still yields a checkpoint carrying the assertions and
    /// the capture error; the error is only returned for I/O on the artifact itself.
    pub async fn checkpoint(
        &self,
        page: &dyn PageHandle,
        name: &str,
        assertions: Vec<Assertion>,
    ) -> E2eResult<Checkpoint> {
        let (unique, path) = self.reserve_path(name);

        let mut checkpoint = Checkpoint {
            name: unique,
            screenshot_path: None,
            timestamp: Utc::now(),
            sha256: None,
            width: None,
            height: None,
            assertions,
            capture_error: None,
        };

        match page.screenshot(&path, false).await {
            Ok(()) => {
                let (sha, width, height) = describe_raster(&path)?;
                checkpoint.screenshot_path = Some(path);
                checkpoint.sha256 = Some(sha);
                checkpoint.width = Some(width);
                checkpoint.height = Some(height);
                info!("Checkpoint '{}' captured ({}x{})", checkpoint.name, width, height);
            }
            Err(e) => {
                warn!("Checkpoint '{}' has no screenshot: {}", checkpoint.name, e);
                checkpoint.capture_error = Some(e.to_string());
            }
        }

        self.checkpoints.lock().push(checkpoint.clone());
        Ok(checkpoint)
    }

    /// Ordered checkpoints recorded so far
    pub fn checkpoints(&self) -> Vec<Checkpoint> {
        self.checkpoints.lock().clone()
    }
}

/// SHA-256 of the PNG and its pixel dimensions
fn describe_raster(path: &Path) -> E2eResult<(String, u32, u32)> {
    let data = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&data);
    let (width, height) = image::image_dimensions(path)?;
    Ok((hex::encode(hasher.finalize()), width, height))
}

/// Lowercase, filesystem-safe form of a checkpoint or scenario name
pub fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "checkpoint".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Slug of `name`, suffixed `-2`, `-3`… until it is not in `used`, then claimed.
pub fn claim_slug(used: &mut HashSet<String>, name: &str) -> String {
    let base = slug(name);
    let mut unique = base.clone();
    let mut n = 1;
    while used.contains(&unique) {
        n += 1;
        unique = format!("{}-{}", base, n);
    }
    used.insert(unique.clone());
    unique
}
