//! Playwright browser automation
//!
//! A single Node process runs `driver.js` for the lifetime of a session. Rust
//! writes one JSON command per line to its stdin and a reader task routes the
//! replies back to the waiting callers. The same stream carries console output,
//! page errors and intercepted requests; the latter are answered from the
//! context's [`RouteRegistry`] without a round trip through the caller.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout, Command as TokioCommand};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::error::{E2eError, E2eResult};
use crate::mock::{InterceptedRequest, RouteDecision, RouteRegistry};
use crate::page::{
    BoundingBox, ContextHandle, Engine, EngineLauncher, ObservationKind, ObservationLog, PageHandle,
    WaitState,
};
use crate::profile::Profile;

const DRIVER_JS: &str = include_str!("driver.js");

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Browser {
    #[default]
    Chromium,
    Firefox,
    Webkit,
}

impl Browser {
    fn as_str(&self) -> &'static str {
        match self {
            Browser::Chromium => "chromium",
            Browser::Firefox => "firefox",
            Browser::Webkit => "webkit",
        }
    }
}

impl std::str::FromStr for Browser {
    type Err = E2eError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chromium" => Ok(Browser::Chromium),
            "firefox" => Ok(Browser::Firefox),
            "webkit" => Ok(Browser::Webkit),
            other => Err(E2eError::SpecParse(format!("Unknown browser: {}", other))),
        }
    }
}

/// Configuration for Playwright
#[derive(Debug, Clone)]
pub struct PlaywrightConfig {
    pub browser: Browser,
    pub headless: bool,

    /// Node executable
    pub node_binary: PathBuf,

    /// Directory `playwright` is resolved from (its `node_modules` parent)
    pub working_dir: PathBuf,

    /// Extra module search path handed to node as `NODE_PATH`
    pub node_path: Option<PathBuf>,

    /// Bound for starting node and launching the browser
    pub launch_timeout: Duration,

    /// Slack added on top of an operation's own timeout before the bridge gives up on a reply
    pub command_timeout: Duration,
}

impl Default for PlaywrightConfig {
    fn default() -> Self {
        Self {
            browser: Browser::Chromium,
            headless: true,
            node_binary: PathBuf::from("node"),
            working_dir: PathBuf::from("."),
            node_path: std::env::var_os("NODE_PATH").map(PathBuf::from),
            launch_timeout: Duration::from_secs(60),
            command_timeout: Duration::from_secs(10),
        }
    }
}

/// Starts one driver process per session
pub struct PlaywrightLauncher {
    config: PlaywrightConfig,
}

impl PlaywrightLauncher {
    pub fn new(config: PlaywrightConfig) -> Self {
        Self { config }
    }

    /// Check that node can resolve the playwright package
    async fn check_playwright_installed(&self) -> E2eResult<()> {
        let mut cmd = TokioCommand::new(&self.config.node_binary);
        cmd.args(["-e", "require.resolve('playwright')"])
            .current_dir(&self.config.working_dir)
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(node_path) = &self.config.node_path {
            cmd.env("NODE_PATH", node_path);
        }

        match cmd.status().await {
            Ok(status) if status.success() => Ok(()),
            Ok(_) => Err(E2eError::Environment(format!(
                "playwright is not installed (resolved from {})",
                self.config.working_dir.display()
            ))),
            Err(e) => Err(E2eError::Environment(format!(
                "failed to run {}: {}",
                self.config.node_binary.display(),
                e
            ))),
        }
    }
}

#[async_trait]
impl EngineLauncher for PlaywrightLauncher {
    async fn launch(&self) -> E2eResult<Arc<dyn Engine>> {
        self.check_playwright_installed().await?;

        let bridge = PlaywrightBridge::start(&self.config).await.map_err(|e| {
            if e.is_fatal() {
                e
            } else {
                E2eError::Environment(format!("failed to launch {}: {}", self.config.browser.as_str(), e))
            }
        })?;

        Ok(Arc::new(bridge))
    }
}

/// Error reported by the driver for a failed command
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
struct DriverFailure {
    name: String,
    message: String,
}

impl DriverFailure {
    fn into_error(self, op: &str) -> E2eError {
        if self.name == "TimeoutError" {
            E2eError::timeout(first_line(&self.message))
        } else {
            E2eError::Bridge(format!("{} failed: {}", op, first_line(&self.message)))
        }
    }
}

fn first_line(message: &str) -> String {
    message.lines().next().unwrap_or(message).trim().to_string()
}

#[derive(Debug, Deserialize)]
struct Reply {
    id: u64,
    ok: bool,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<DriverFailure>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum DriverEvent {
    Console {
        context: String,
        level: String,
        text: String,
    },
    #[serde(rename = "pageerror")]
    PageError { context: String, text: String },
    Route {
        context: String,
        route: String,
        request: InterceptedRequest,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Inbound {
    Reply(Reply),
    Event(DriverEvent),
}

type ReplySender = oneshot::Sender<Result<Value, DriverFailure>>;

struct ContextState {
    routes: Arc<RouteRegistry>,
    observations: ObservationLog,
}

type DriverInput = Box<dyn AsyncWrite + Send + Unpin>;

struct BridgeInner {
    stdin: tokio::sync::Mutex<DriverInput>,
    pending: Mutex<HashMap<u64, ReplySender>>,
    contexts: Mutex<HashMap<String, ContextState>>,
    next_id: AtomicU64,
    next_handle: AtomicU64,
    command_timeout: Duration,
}

impl BridgeInner {
    async fn call(&self, op: &str, params: Value, timeout: Duration) -> E2eResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let mut line = serde_json::to_string(&json!({ "id": id, "op": op, "params": params }))?;
        line.push('\n');

        if let Err(e) = self.write_line(&line).await {
            self.pending.lock().remove(&id);
            return Err(E2eError::Bridge(format!("driver stdin closed during {}: {}", op, e)));
        }

        match tokio::time::timeout(timeout + self.command_timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(failure))) => Err(failure.into_error(op)),
            Ok(Err(_)) => Err(E2eError::Bridge(format!("driver exited before answering {}", op))),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(E2eError::timeout(format!("driver reply to {}", op)))
            }
        }
    }

    async fn write_line(&self, line: &str) -> std::io::Result<()> {
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await
    }

    fn handle_id(&self, prefix: &str) -> String {
        format!("{}{}", prefix, self.next_handle.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn dispatch_reply(&self, reply: Reply) {
        let Some(tx) = self.pending.lock().remove(&reply.id) else {
            debug!("Dropping reply {} nobody waits for", reply.id);
            return;
        };
        let outcome = if reply.ok {
            Ok(reply.result)
        } else {
            Err(reply.error.unwrap_or(DriverFailure {
                name: "Error".to_string(),
                message: "driver reported failure without detail".to_string(),
            }))
        };
        let _ = tx.send(outcome);
    }

    fn fail_pending(&self) {
        let pending: Vec<ReplySender> = self.pending.lock().drain().map(|(_, tx)| tx).collect();
        if !pending.is_empty() {
            warn!("Driver stream closed with {} commands in flight", pending.len());
        }
        // Dropping the senders wakes every waiter with a closed channel.
        drop(pending);
    }

    fn observe(&self, context: &str, kind: ObservationKind, text: String) {
        debug!("[{}] {:?}: {}", context, kind, text);
        if let Some(state) = self.contexts.lock().get(context) {
            state.observations.push(context, kind, text);
        }
    }
}

/// Registry decision for an intercepted request
fn decide_route(inner: &BridgeInner, context: &str, request: &InterceptedRequest) -> RouteDecision {
    let routes = inner.contexts.lock().get(context).map(|s| s.routes.clone());
    match routes {
        Some(routes) => routes.handle(request),
        None => RouteDecision::Continue,
    }
}

/// Send the decision back to the driver.
async fn answer_route(inner: Arc<BridgeInner>, route: String, request: InterceptedRequest, decision: RouteDecision) {
    let timeout = inner.command_timeout;
    let result = match decision {
        RouteDecision::Fulfill { fulfillment, .. } => {
            inner
                .call(
                    "fulfill",
                    json!({
                        "route": route,
                        "status": fulfillment.status,
                        "contentType": fulfillment.content_type,
                        "body": fulfillment.body,
                    }),
                    timeout,
                )
                .await
        }
        RouteDecision::Abort { .. } => inner.call("abort", json!({ "route": route }), timeout).await,
        RouteDecision::Continue => inner.call("continue", json!({ "route": route }), timeout).await,
    };

    if let Err(e) = result {
        warn!("Could not answer {} {}: {}", request.method, request.url, e);
    }
}

async fn read_driver_output(weak: Weak<BridgeInner>, stdout: ChildStdout) {
    let mut lines = BufReader::new(stdout).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!("Reading driver output failed: {}", e);
                break;
            }
        };
        let Some(inner) = weak.upgrade() else {
            return;
        };
        handle_line(&inner, &line);
    }

    if let Some(inner) = weak.upgrade() {
        inner.fail_pending();
    }
}

/// Apply one line of driver output. Route decisions are taken here, in stream
/// order; only the answer to the driver is sent from a spawned task.
fn handle_line(inner: &Arc<BridgeInner>, line: &str) {
    match serde_json::from_str::<Inbound>(line) {
        Ok(Inbound::Reply(reply)) => inner.dispatch_reply(reply),
        Ok(Inbound::Event(DriverEvent::Console { context, level, text })) => {
            inner.observe(&context, ObservationKind::Console { level }, text)
        }
        Ok(Inbound::Event(DriverEvent::PageError { context, text })) => {
            warn!("[{}] page error: {}", context, text);
            inner.observe(&context, ObservationKind::PageError, text)
        }
        Ok(Inbound::Event(DriverEvent::Route { context, route, request })) => {
            let decision = decide_route(inner, &context, &request);
            tokio::spawn(answer_route(inner.clone(), route, request, decision));
        }
        Err(_) => debug!("[driver] {}", line),
    }
}

/// Engine backed by one Node/Playwright driver process
pub struct PlaywrightBridge {
    inner: Arc<BridgeInner>,
    child: tokio::sync::Mutex<Option<Child>>,
    _workdir: TempDir,
}

impl PlaywrightBridge {
    pub async fn start(config: &PlaywrightConfig) -> E2eResult<Self> {
        let workdir = tempfile::tempdir()?;
        let script_path = workdir.path().join("driver.js");
        std::fs::write(&script_path, DRIVER_JS)?;

        debug!("Starting Playwright driver: {}", script_path.display());

        let mut cmd = TokioCommand::new(&config.node_binary);
        cmd.arg(&script_path)
            .current_dir(&config.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(node_path) = &config.node_path {
            cmd.env("NODE_PATH", node_path);
        }

        let mut child = cmd.spawn().map_err(|e| {
            E2eError::Environment(format!("failed to spawn {}: {}", config.node_binary.display(), e))
        })?;

        let stdin = child.stdin.take().ok_or_else(|| E2eError::Bridge("driver stdin unavailable".into()))?;
        let stdout = child.stdout.take().ok_or_else(|| E2eError::Bridge("driver stdout unavailable".into()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!("[driver stderr] {}", line);
                }
            });
        }

        let inner = Arc::new(BridgeInner {
            stdin: tokio::sync::Mutex::new(Box::new(stdin)),
            pending: Mutex::new(HashMap::new()),
            contexts: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            next_handle: AtomicU64::new(0),
            command_timeout: config.command_timeout,
        });
        tokio::spawn(read_driver_output(Arc::downgrade(&inner), stdout));

        let bridge = Self {
            inner,
            child: tokio::sync::Mutex::new(Some(child)),
            _workdir: workdir,
        };

        let launched = bridge
            .inner
            .call(
                "launch",
                json!({ "browser": config.browser.as_str(), "headless": config.headless }),
                config.launch_timeout,
            )
            .await;

        match launched {
            Ok(info) => {
                let version = info.get("version").and_then(Value::as_str).unwrap_or("");
                info!("Launched {} {}", config.browser.as_str(), version);
                Ok(bridge)
            }
            Err(e) => {
                bridge.kill().await;
                Err(E2eError::Environment(format!("browser launch failed: {}", e)))
            }
        }
    }

    async fn kill(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.kill().await;
        }
    }
}

#[async_trait]
impl Engine for PlaywrightBridge {
    async fn new_context(
        &self,
        profile: &Profile,
        routes: Arc<RouteRegistry>,
        observations: ObservationLog,
    ) -> E2eResult<Arc<dyn ContextHandle>> {
        let id = self.inner.handle_id("c");
        self.inner
            .contexts
            .lock()
            .insert(id.clone(), ContextState { routes, observations });

        let created = self
            .inner
            .call(
                "newContext",
                json!({ "id": id, "options": context_options(profile) }),
                self.inner.command_timeout,
            )
            .await;
        if let Err(e) = created {
            self.inner.contexts.lock().remove(&id);
            return Err(e);
        }

        info!("Created context {} for profile {}", id, profile.name);
        Ok(Arc::new(BridgeContext {
            inner: self.inner.clone(),
            id,
        }))
    }

    async fn shutdown(&self) -> E2eResult<()> {
        let closed = self.inner.call("close", Value::Null, self.inner.command_timeout).await;
        if let Err(e) = &closed {
            warn!("Driver did not close the browser cleanly: {}", e);
        }

        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };
        // The driver exits by itself once the browser is closed.
        match tokio::time::timeout(self.inner.command_timeout, child.wait()).await {
            Ok(Ok(status)) => debug!("Driver exited with {}", status),
            _ => {
                warn!("Driver still running; killing it");
                let _ = child.kill().await;
            }
        }
        Ok(())
    }
}

/// Playwright `newContext` options for a profile
fn context_options(profile: &Profile) -> Value {
    let mut options = json!({
        "viewport": { "width": profile.viewport.width, "height": profile.viewport.height },
        "isMobile": profile.is_mobile,
        "hasTouch": profile.has_touch,
    });
    if let Some(ua) = &profile.user_agent {
        options["userAgent"] = json!(ua);
    }
    if let Some(scale) = profile.device_scale_factor {
        options["deviceScaleFactor"] = json!(scale);
    }
    options
}

struct BridgeContext {
    inner: Arc<BridgeInner>,
    id: String,
}

#[async_trait]
impl ContextHandle for BridgeContext {
    async fn new_page(&self) -> E2eResult<Arc<dyn PageHandle>> {
        let id = self.inner.handle_id("p");
        self.inner
            .call("newPage", json!({ "context": self.id, "id": id }), self.inner.command_timeout)
            .await?;
        Ok(Arc::new(BridgePage {
            inner: self.inner.clone(),
            id,
        }))
    }

    async fn intercept(&self, pattern: &str) -> E2eResult<()> {
        debug!("Context {} intercepting {}", self.id, pattern);
        self.inner
            .call(
                "route",
                json!({ "context": self.id, "pattern": pattern }),
                self.inner.command_timeout,
            )
            .await?;
        Ok(())
    }

    async fn close(&self) -> E2eResult<()> {
        let result = self
            .inner
            .call("closeContext", json!({ "context": self.id }), self.inner.command_timeout)
            .await;
        self.inner.contexts.lock().remove(&self.id);
        result.map(|_| ())
    }
}

struct BridgePage {
    inner: Arc<BridgeInner>,
    id: String,
}

impl BridgePage {
    async fn call(&self, op: &str, mut params: Value, timeout: Duration) -> E2eResult<Value> {
        params["page"] = json!(self.id);
        self.inner.call(op, params, timeout).await
    }

    async fn quick(&self, op: &str, params: Value) -> E2eResult<Value> {
        self.call(op, params, Duration::ZERO).await
    }
}

fn ms(d: Duration) -> u64 {
    d.as_millis() as u64
}

fn optional_string(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        _ => None,
    }
}

#[async_trait]
impl PageHandle for BridgePage {
    async fn goto(&self, url: &str, timeout: Duration) -> E2eResult<()> {
        self.call("goto", json!({ "url": url, "timeout": ms(timeout) }), timeout).await?;
        Ok(())
    }

    async fn reload(&self, timeout: Duration) -> E2eResult<()> {
        self.call("reload", json!({ "timeout": ms(timeout) }), timeout).await?;
        Ok(())
    }

    async fn click(&self, selector: &str, timeout: Duration) -> E2eResult<()> {
        self.call("click", json!({ "selector": selector, "timeout": ms(timeout) }), timeout)
            .await?;
        Ok(())
    }

    async fn fill(&self, selector: &str, value: &str) -> E2eResult<()> {
        let timeout = self.inner.command_timeout;
        self.call(
            "fill",
            json!({ "selector": selector, "value": value, "timeout": ms(timeout) }),
            timeout,
        )
        .await?;
        Ok(())
    }

    async fn select_option(&self, selector: &str, value: &str) -> E2eResult<()> {
        let timeout = self.inner.command_timeout;
        self.call(
            "selectOption",
            json!({ "selector": selector, "value": value, "timeout": ms(timeout) }),
            timeout,
        )
        .await?;
        Ok(())
    }

    async fn input_value(&self, selector: &str) -> E2eResult<String> {
        let timeout = self.inner.command_timeout;
        let value = self
            .call("inputValue", json!({ "selector": selector, "timeout": ms(timeout) }), timeout)
            .await?;
        Ok(optional_string(value).unwrap_or_default())
    }

    async fn is_visible(&self, selector: &str) -> E2eResult<bool> {
        let value = self.quick("isVisible", json!({ "selector": selector })).await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn wait_for(&self, selector: &str, state: WaitState, timeout: Duration) -> E2eResult<()> {
        self.call(
            "waitFor",
            json!({ "selector": selector, "state": state.as_str(), "timeout": ms(timeout) }),
            timeout,
        )
        .await?;
        Ok(())
    }

    async fn element_id(&self, selector: &str) -> E2eResult<Option<String>> {
        let value = self.quick("elementId", json!({ "selector": selector })).await?;
        Ok(optional_string(value).filter(|id| !id.is_empty()))
    }

    async fn text_content(&self, selector: &str) -> E2eResult<Option<String>> {
        let value = self.quick("textContent", json!({ "selector": selector })).await?;
        Ok(optional_string(value))
    }

    async fn bounding_box(&self, selector: &str) -> E2eResult<Option<BoundingBox>> {
        let value = self.quick("boundingBox", json!({ "selector": selector })).await?;
        if value.is_null() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(value)?))
    }

    async fn local_storage_get(&self, key: &str) -> E2eResult<Option<String>> {
        let value = self.quick("storageGet", json!({ "key": key })).await?;
        Ok(optional_string(value))
    }

    async fn seed_local_storage(&self, entries: &[(String, String)]) -> E2eResult<()> {
        self.quick("seedStorage", json!({ "entries": entries })).await?;
        Ok(())
    }

    async fn screenshot(&self, path: &Path, full_page: bool) -> E2eResult<()> {
        self.quick(
            "screenshot",
            json!({ "path": path.to_string_lossy(), "fullPage": full_page }),
        )
        .await?;
        Ok(())
    }

    async fn close(&self) -> E2eResult<()> {
        self.quick("closePage", json!({})).await?;
        Ok(())
    }
}
