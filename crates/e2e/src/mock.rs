//! Route mock registry
//!
//! Every browsing context owns one registry. Intercepted requests are matched
//! against the active rules in install order and answered locally. Requests to
//! a guarded endpoint with no active rule are aborted and recorded, so the real
//! backend is never contacted.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::content;
use crate::error::{E2eError, E2eResult};

/// Request metadata handed to a responder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterceptedRequest {
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub post_data: Option<String>,
}

impl InterceptedRequest {
    pub fn json_body(&self) -> Option<Value> {
        serde_json::from_str(self.post_data.as_deref()?).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fulfillment {
    pub status: u16,
    pub content_type: String,
    pub body: String,
}

impl Fulfillment {
    pub fn json(value: &Value) -> Self {
        Self {
            status: 200,
            content_type: "application/json".to_string(),
            body: value.to_string(),
        }
    }

    /// Chat-completions envelope carrying `text` as the model reply
    pub fn llm(text: &str) -> Self {
        Self::json(&content::envelope(text))
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }
}

/// Pure function from request metadata to a fulfillment
pub type Responder = Arc<dyn Fn(&InterceptedRequest) -> Fulfillment + Send + Sync>;

pub fn respond_with(fulfillment: Fulfillment) -> Responder {
    Arc::new(move |_| fulfillment.clone())
}

pub fn llm_responder(text: impl Into<String>) -> Responder {
    respond_with(Fulfillment::llm(&text.into()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleId(u64);

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rule-{}", self.0)
    }
}

/// What the engine should do with an intercepted request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    Fulfill { rule: RuleId, fulfillment: Fulfillment },
    /// Guarded endpoint without an active rule
    Abort { guard: String },
    /// Not ours; let it through
    Continue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleStats {
    pub id: RuleId,
    pub pattern: String,
    pub fulfilled: u64,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockMismatch {
    pub method: String,
    pub url: String,
    pub guard: String,
    pub at: DateTime<Utc>,
}

impl From<MockMismatch> for E2eError {
    fn from(m: MockMismatch) -> Self {
        E2eError::MockMismatch {
            method: m.method,
            url: m.url,
            guard: m.guard,
        }
    }
}

struct RouteRule {
    id: RuleId,
    pattern: String,
    matcher: Regex,
    responder: Responder,
}

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    active: Vec<RouteRule>,
    /// Every rule ever installed, in install order
    history: Vec<RuleStats>,
    mismatches: Vec<MockMismatch>,
}

impl RegistryInner {
    fn stats_mut(&mut self, id: RuleId) -> Option<&mut RuleStats> {
        self.history.iter_mut().find(|s| s.id == id)
    }

    fn push_rule(&mut self, pattern: &str, matcher: Regex, responder: Responder) -> RuleId {
        self.next_id += 1;
        let id = RuleId(self.next_id);
        self.active.push(RouteRule {
            id,
            pattern: pattern.to_string(),
            matcher,
            responder,
        });
        self.history.push(RuleStats {
            id,
            pattern: pattern.to_string(),
            fulfilled: 0,
            active: true,
        });
        id
    }

    fn remove_rule(&mut self, pattern: &str) -> Option<RuleId> {
        let index = self.active.iter().position(|r| r.pattern == pattern)?;
        let rule = self.active.remove(index);
        if let Some(stats) = self.stats_mut(rule.id) {
            stats.active = false;
        }
        Some(rule.id)
    }
}

pub struct RouteRegistry {
    guards: Vec<(String, Regex)>,
    inner: Mutex<RegistryInner>,
}

impl RouteRegistry {
    /// Create a registry; requests matching any `guarded` pattern never reach the network.
    pub fn new<S: AsRef<str>>(guarded: &[S]) -> E2eResult<Self> {
        let guards = guarded
            .iter()
            .map(|p| Ok((p.as_ref().to_string(), glob_to_regex(p.as_ref())?)))
            .collect::<E2eResult<Vec<_>>>()?;

        Ok(Self {
            guards,
            inner: Mutex::new(RegistryInner::default()),
        })
    }

    pub fn guarded_patterns(&self) -> Vec<String> {
        self.guards.iter().map(|(p, _)| p.clone()).collect()
    }

    /// Install a responder for `pattern`. Installing over an active rule for the
    /// same pattern is refused; use [`RouteRegistry::replace`].
    pub fn install(&self, pattern: &str, responder: Responder) -> E2eResult<RuleId> {
        let matcher = glob_to_regex(pattern)?;
        let mut inner = self.inner.lock();

        if inner.active.iter().any(|r| r.pattern == pattern) {
            return Err(E2eError::MockConflict(format!(
                "a rule for '{}' is already active; replace it instead",
                pattern
            )));
        }

        let id = inner.push_rule(pattern, matcher, responder);
        info!("Installed mock {} for {}", id, pattern);
        Ok(id)
    }

    /// Remove the active rule for `pattern` (if any) and install `responder`,
    /// under one lock so no request observes the gap.
    pub fn replace(&self, pattern: &str, responder: Responder) -> E2eResult<RuleId> {
        let matcher = glob_to_regex(pattern)?;
        let mut inner = self.inner.lock();

        let old = inner.remove_rule(pattern);
        let id = inner.push_rule(pattern, matcher, responder);
        match old {
            Some(old) => info!("Replaced mock {} with {} for {}", old, id, pattern),
            None => info!("Installed mock {} for {}", id, pattern),
        }
        Ok(id)
    }

    pub fn remove(&self, pattern: &str) -> Option<RuleId> {
        let removed = self.inner.lock().remove_rule(pattern);
        if let Some(id) = removed {
            info!("Removed mock {} for {}", id, pattern);
        }
        removed
    }

    pub fn has_active_rule(&self, pattern: &str) -> bool {
        self.inner.lock().active.iter().any(|r| r.pattern == pattern)
    }

    /// Decide the fate of an intercepted request and count the invocation.
    pub fn handle(&self, request: &InterceptedRequest) -> RouteDecision {
        let mut inner = self.inner.lock();

        let matched = inner
            .active
            .iter()
            .find(|r| r.matcher.is_match(&request.url))
            .map(|r| (r.id, (r.responder)(request)));

        if let Some((rule, fulfillment)) = matched {
            if let Some(stats) = inner.stats_mut(rule) {
                stats.fulfilled += 1;
            }
            debug!("{} fulfilled {} {} with {}", rule, request.method, request.url, fulfillment.status);
            return RouteDecision::Fulfill { rule, fulfillment };
        }

        if let Some((guard, _)) = self.guards.iter().find(|(_, m)| m.is_match(&request.url)) {
            warn!("No mock for guarded request {} {}; aborting it", request.method, request.url);
            inner.mismatches.push(MockMismatch {
                method: request.method.clone(),
                url: request.url.clone(),
                guard: guard.clone(),
                at: Utc::now(),
            });
            return RouteDecision::Abort { guard: guard.clone() };
        }

        RouteDecision::Continue
    }

    pub fn fulfilled_count(&self, id: RuleId) -> u64 {
        self.inner
            .lock()
            .history
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.fulfilled)
            .unwrap_or(0)
    }

    /// Count for the rule currently active on `pattern`
    pub fn active_count(&self, pattern: &str) -> Option<u64> {
        let inner = self.inner.lock();
        let rule = inner.active.iter().find(|r| r.pattern == pattern)?;
        inner.history.iter().find(|s| s.id == rule.id).map(|s| s.fulfilled)
    }

    /// Count across every rule ever installed on `pattern`
    pub fn total_count(&self, pattern: &str) -> u64 {
        self.inner
            .lock()
            .history
            .iter()
            .filter(|s| s.pattern == pattern)
            .map(|s| s.fulfilled)
            .sum()
    }

    pub fn stats(&self) -> Vec<RuleStats> {
        self.inner.lock().history.clone()
    }

    pub fn mismatches(&self) -> Vec<MockMismatch> {
        self.inner.lock().mismatches.clone()
    }
}

/// Translate a Playwright URL glob into an anchored regex.
///
/// `**` matches anything, `*` anything but `/`, `?` one character and
/// `{a,b}` either alternative.
pub fn glob_to_regex(glob: &str) -> E2eResult<Regex> {
    let mut out = String::from("^");
    let mut chars = glob.chars().peekable();
    let mut in_group = false;

    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                out.push_str(".*");
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push('.'),
            '{' => {
                in_group = true;
                out.push_str("(?:");
            }
            '}' if in_group => {
                in_group = false;
                out.push(')');
            }
            ',' if in_group => out.push('|'),
            '\\' => {
                if let Some(next) = chars.next() {
                    out.push_str(&regex::escape(&next.to_string()));
                }
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }

    out.push('$');
    Ok(Regex::new(&out)?)
}
