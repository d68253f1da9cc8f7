//! In-process stand-in for the Historia AI app behind the engine traits
//!
//! The simulation follows the DOM contract the harness relies on: the
//! disclaimer re-appears on every load and fades out after acceptance, each
//! click moves between screens as the real app does, progress is written to
//! local storage, and LLM calls are answered through the context's route
//! registry. Time is tokio time, so tests run with a paused clock.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

use historia_e2e::content::{extract_content, is_hpi_complete, parse_summary};
use historia_e2e::mock::{InterceptedRequest, RouteDecision, RouteRegistry};
use historia_e2e::page::{
    BoundingBox, ContextHandle, Engine, EngineLauncher, ObservationKind, ObservationLog, PageHandle, WaitState,
};
use historia_e2e::profile::Profile;
use historia_e2e::screen::{Control, Field, ScreenId, ACTIVE_SCREEN, APP_CONTAINER};
use historia_e2e::storage::{APP_STATE_KEY, CURRENT_SCREEN_KEY, STORAGE_PREFIX};
use historia_e2e::{E2eError, E2eResult};

pub const BASE_URL: &str = "http://127.0.0.1:8080";
const WELCOME_HEADING: &str = "#welcome-screen h1";
const POLL: Duration = Duration::from_millis(50);

/// Knobs for misbehaving variants of the app
#[derive(Debug, Clone)]
pub struct AppBehavior {
    pub launch_fails: bool,
    /// Only the first this many launches fail
    pub failing_launches: usize,
    pub launch_delay: Duration,
    /// Accepting the disclaimer does nothing
    pub stuck_disclaimer: bool,
    pub fade: Duration,
    /// Delay between the interview sentinel arriving and the next screen
    pub hpi_delay: Duration,
    pub summary_delay: Duration,
    /// Uncaught error thrown on every document load
    pub script_error: Option<String>,
    /// The app container lays out with zero height
    pub collapsed_layout: bool,
    pub fail_screenshots: bool,
}

impl Default for AppBehavior {
    fn default() -> Self {
        Self {
            launch_fails: false,
            failing_launches: 0,
            launch_delay: Duration::ZERO,
            stuck_disclaimer: false,
            fade: Duration::from_millis(300),
            hpi_delay: Duration::from_millis(1500),
            summary_delay: Duration::from_millis(200),
            script_error: None,
            collapsed_layout: false,
            fail_screenshots: false,
        }
    }
}

/// What the launcher saw over its lifetime
#[derive(Debug, Default)]
pub struct EngineLog {
    pub launches: AtomicUsize,
    pub shutdowns: AtomicUsize,
    pub contexts_opened: AtomicUsize,
    pub contexts_closed: AtomicUsize,
    pub live_engines: AtomicUsize,
    pub peak_engines: AtomicUsize,
    pub intercepts: Mutex<Vec<String>>,
    pub requests: Mutex<Vec<String>>,
}

impl EngineLog {
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    /// Most engines that were running at the same time
    pub fn peak_engines(&self) -> usize {
        self.peak_engines.load(Ordering::SeqCst)
    }

    pub fn contexts_closed(&self) -> usize {
        self.contexts_closed.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }
}

pub struct FakeLauncher {
    behavior: AppBehavior,
    attempts: AtomicUsize,
    pub log: Arc<EngineLog>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::with_behavior(AppBehavior::default())
    }

    pub fn with_behavior(behavior: AppBehavior) -> Self {
        Self {
            behavior,
            attempts: AtomicUsize::new(0),
            log: Arc::new(EngineLog::default()),
        }
    }
}

#[async_trait]
impl EngineLauncher for FakeLauncher {
    async fn launch(&self) -> E2eResult<Arc<dyn Engine>> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        sleep(self.behavior.launch_delay).await;
        if self.behavior.launch_fails || attempt < self.behavior.failing_launches {
            return Err(E2eError::Environment("browser executable not found".to_string()));
        }
        self.log.launches.fetch_add(1, Ordering::SeqCst);
        let live = self.log.live_engines.fetch_add(1, Ordering::SeqCst) + 1;
        self.log.peak_engines.fetch_max(live, Ordering::SeqCst);
        Ok(Arc::new(FakeEngine {
            behavior: self.behavior.clone(),
            log: self.log.clone(),
        }))
    }
}

struct FakeEngine {
    behavior: AppBehavior,
    log: Arc<EngineLog>,
}

#[async_trait]
impl Engine for FakeEngine {
    async fn new_context(
        &self,
        profile: &Profile,
        routes: Arc<RouteRegistry>,
        observations: ObservationLog,
    ) -> E2eResult<Arc<dyn ContextHandle>> {
        self.log.contexts_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeContext {
            inner: Arc::new(ContextInner {
                profile: profile.clone(),
                behavior: self.behavior.clone(),
                routes,
                observations,
                storage: Mutex::new(HashMap::new()),
                log: self.log.clone(),
            }),
        }))
    }

    async fn shutdown(&self) -> E2eResult<()> {
        self.log.shutdowns.fetch_add(1, Ordering::SeqCst);
        self.log.live_engines.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

/// State shared by every page of one context
struct ContextInner {
    profile: Profile,
    behavior: AppBehavior,
    routes: Arc<RouteRegistry>,
    observations: ObservationLog,
    storage: Mutex<HashMap<String, String>>,
    log: Arc<EngineLog>,
}

struct FakeContext {
    inner: Arc<ContextInner>,
}

#[async_trait]
impl ContextHandle for FakeContext {
    async fn new_page(&self) -> E2eResult<Arc<dyn PageHandle>> {
        Ok(Arc::new(FakePage {
            ctx: self.inner.clone(),
            state: Mutex::new(PageState::default()),
        }))
    }

    async fn intercept(&self, pattern: &str) -> E2eResult<()> {
        self.inner.log.intercepts.lock().push(pattern.to_string());
        Ok(())
    }

    async fn close(&self) -> E2eResult<()> {
        self.inner.log.contexts_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Disclaimer {
    Shown,
    Fading(Instant),
    Gone,
}

struct PageState {
    loaded: bool,
    closed: bool,
    disclaimer: Disclaimer,
    active: ScreenId,
    app_state: Value,
    /// Screen the app moves to once a response has been processed
    pending: Option<(Instant, ScreenId)>,
    seed: Option<Vec<(String, String)>>,
    summary: Option<String>,
}

impl Default for PageState {
    fn default() -> Self {
        Self {
            loaded: false,
            closed: false,
            disclaimer: Disclaimer::Shown,
            active: ScreenId::Welcome,
            app_state: blank_app_state(),
            pending: None,
            seed: None,
            summary: None,
        }
    }
}

fn blank_app_state() -> Value {
    json!({
        "preliminary": {},
        "cc": {},
        "hpiConversation": [],
        "history": {},
        "social": {},
        "labReports": "",
        "editingTarget": null
    })
}

/// Field pointers are at most two levels deep
fn set_pointer(target: &mut Value, pointer: &str, value: &str) {
    let parts: Vec<&str> = pointer.trim_start_matches('/').split('/').collect();
    let value = Value::String(value.to_string());
    match parts.as_slice() {
        [key] => {
            if let Some(map) = target.as_object_mut() {
                map.insert(key.to_string(), value);
            }
        }
        [section, key] => {
            let entry = target
                .as_object_mut()
                .map(|map| map.entry(section.to_string()).or_insert_with(|| json!({})));
            if let Some(Value::Object(map)) = entry {
                map.insert(key.to_string(), value);
            }
        }
        _ => {}
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Element {
    Disclaimer,
    AppContainer,
    ActiveScreen,
    WelcomeHeading,
    Screen(ScreenId),
    Control(Control),
    Field(Field),
}

fn controls() -> Vec<Control> {
    let mut all = vec![
        Control::AcceptDisclaimer,
        Control::BeginHistory,
        Control::StartHpi,
        Control::ConfirmAndGenerate,
        Control::StartNew,
        Control::DownloadPdf,
    ];
    all.extend(ScreenId::ALL.iter().map(|s| Control::Next(*s)));
    all
}

fn resolve(selector: &str) -> Option<Element> {
    if selector == ScreenId::DisclaimerModal.root_selector() {
        return Some(Element::Disclaimer);
    }
    if selector == APP_CONTAINER {
        return Some(Element::AppContainer);
    }
    if selector == ACTIVE_SCREEN {
        return Some(Element::ActiveScreen);
    }
    if selector == WELCOME_HEADING {
        return Some(Element::WelcomeHeading);
    }
    if let Some(screen) = ScreenId::ALL.iter().find(|s| s.root_selector() == selector) {
        return Some(Element::Screen(*screen));
    }
    if let Some(control) = controls().into_iter().find(|c| c.selector() == selector) {
        return Some(Element::Control(control));
    }
    Field::ALL
        .iter()
        .find(|f| f.selector() == selector)
        .map(|f| Element::Field(*f))
}

/// Screen a control is rendered on
fn control_screen(control: Control) -> Option<ScreenId> {
    match control {
        Control::AcceptDisclaimer => None,
        Control::BeginHistory => Some(ScreenId::Welcome),
        Control::Next(ScreenId::ChiefComplaint) => Some(ScreenId::PreliminaryData),
        Control::Next(ScreenId::SocialHistory) => Some(ScreenId::PastMedicalHistory),
        Control::Next(ScreenId::LabReport) => Some(ScreenId::SocialHistory),
        Control::Next(ScreenId::Review) => Some(ScreenId::LabReport),
        Control::Next(_) => None,
        Control::StartHpi => Some(ScreenId::ChiefComplaint),
        Control::ConfirmAndGenerate => Some(ScreenId::Review),
        Control::StartNew | Control::DownloadPdf => Some(ScreenId::Summary),
    }
}

impl PageState {
    /// Apply everything whose time has come
    fn tick(&mut self, ctx: &ContextInner) {
        let now = Instant::now();
        if let Disclaimer::Fading(until) = self.disclaimer {
            if now >= until {
                self.disclaimer = Disclaimer::Gone;
            }
        }
        if let Some((at, screen)) = self.pending {
            if now >= at {
                self.pending = None;
                self.show(ctx, screen);
            }
        }
    }

    fn show(&mut self, ctx: &ContextInner, screen: ScreenId) {
        self.active = screen;
        if !screen.is_transient() {
            self.persist(ctx);
        }
    }

    fn persist(&self, ctx: &ContextInner) {
        let mut storage = ctx.storage.lock();
        storage.insert(APP_STATE_KEY.to_string(), self.app_state.to_string());
        storage.insert(CURRENT_SCREEN_KEY.to_string(), self.active.as_str().to_string());
    }

    /// Run the app's startup against whatever storage holds
    fn load_document(&mut self, ctx: &ContextInner) {
        if let Some(entries) = self.seed.take() {
            let mut storage = ctx.storage.lock();
            for (key, value) in entries {
                storage.insert(key, value);
            }
        }

        let (app_state, active) = {
            let storage = ctx.storage.lock();
            let app_state = storage
                .get(APP_STATE_KEY)
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or_else(blank_app_state);
            let active = storage
                .get(CURRENT_SCREEN_KEY)
                .and_then(|id| id.parse().ok())
                .unwrap_or(ScreenId::Welcome);
            (app_state, active)
        };

        self.loaded = true;
        self.disclaimer = Disclaimer::Shown;
        self.app_state = app_state;
        self.active = active;
        self.pending = None;

        if let Some(message) = &ctx.behavior.script_error {
            ctx.observations
                .push(&ctx.profile.name, ObservationKind::PageError, message.clone());
        }
        ctx.observations.push(
            &ctx.profile.name,
            ObservationKind::Console {
                level: "log".to_string(),
            },
            format!("restored {}", self.active),
        );
    }

    fn field_value(&self, field: Field) -> String {
        self.app_state
            .pointer(field.pointer())
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| field.default_value().to_string())
    }

    fn disclaimer_up(&self) -> bool {
        self.disclaimer != Disclaimer::Gone
    }

    fn is_visible(&self, element: Element) -> bool {
        if !self.loaded || self.closed {
            return false;
        }
        match element {
            Element::Disclaimer => self.disclaimer_up(),
            Element::AppContainer | Element::ActiveScreen => true,
            Element::WelcomeHeading => self.active == ScreenId::Welcome,
            Element::Screen(screen) => self.active == screen,
            Element::Control(Control::AcceptDisclaimer) => self.disclaimer == Disclaimer::Shown,
            Element::Control(control) => control_screen(control) == Some(self.active),
            Element::Field(field) => field.screen() == self.active,
        }
    }

    /// Whether a click would land on `element` rather than the modal
    fn is_clickable(&self, element: Element) -> bool {
        match element {
            Element::Control(Control::AcceptDisclaimer) => self.is_visible(element),
            other => self.is_visible(other) && !self.disclaimer_up(),
        }
    }
}

pub struct FakePage {
    ctx: Arc<ContextInner>,
    state: Mutex<PageState>,
}

impl FakePage {
    fn with_state<T>(&self, f: impl FnOnce(&mut PageState, &ContextInner) -> T) -> T {
        let mut state = self.state.lock();
        state.tick(&self.ctx);
        f(&mut state, &self.ctx)
    }

    /// Poll until `ready` holds, like Playwright's auto-waiting
    async fn poll(&self, timeout: Duration, what: &str, ready: impl Fn(&PageState) -> bool) -> E2eResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.with_state(|s, _| ready(s)) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(E2eError::timeout(format!("{} after {:?}", what, timeout)));
            }
            sleep(POLL).await;
        }
    }

    fn element(selector: &str) -> E2eResult<Element> {
        resolve(selector).ok_or_else(|| E2eError::ElementNotFound(selector.to_string()))
    }

    fn post_llm(&self, purpose: &str) -> RouteDecision {
        let request = InterceptedRequest {
            url: format!("{}/api/groq-proxy", BASE_URL),
            method: "POST".to_string(),
            headers: HashMap::from([("content-type".to_string(), "application/json".to_string())]),
            post_data: Some(json!({ "purpose": purpose, "messages": [] }).to_string()),
        };
        self.ctx.log.requests.lock().push(purpose.to_string());
        self.ctx.routes.handle(&request)
    }

    fn console_error(&self, text: impl Into<String>) {
        self.ctx.observations.push(
            &self.ctx.profile.name,
            ObservationKind::Console {
                level: "error".to_string(),
            },
            text,
        );
    }

    /// Reply content of a fulfilled LLM call, or `None` when the call failed
    fn llm_reply(&self, decision: RouteDecision) -> Option<String> {
        match decision {
            RouteDecision::Fulfill { fulfillment, .. } => {
                if fulfillment.status >= 400 {
                    self.console_error(format!("proxy returned {}", fulfillment.status));
                    return None;
                }
                let body: Value = match serde_json::from_str(&fulfillment.body) {
                    Ok(body) => body,
                    Err(e) => {
                        self.console_error(format!("bad proxy body: {}", e));
                        return None;
                    }
                };
                extract_content(&body).map(str::to_string)
            }
            RouteDecision::Abort { .. } => {
                self.console_error("TypeError: Failed to fetch");
                None
            }
            RouteDecision::Continue => {
                self.console_error("net::ERR_CONNECTION_REFUSED");
                None
            }
        }
    }

    fn press(&self, control: Control) {
        match control {
            Control::AcceptDisclaimer => self.with_state(|s, ctx| {
                if !ctx.behavior.stuck_disclaimer {
                    s.disclaimer = Disclaimer::Fading(Instant::now() + ctx.behavior.fade);
                }
            }),
            Control::BeginHistory => self.with_state(|s, ctx| s.show(ctx, ScreenId::PreliminaryData)),
            Control::Next(target) => self.with_state(|s, ctx| s.show(ctx, target)),
            Control::StartHpi => {
                self.with_state(|s, ctx| s.show(ctx, ScreenId::HpiChat));
                let decision = self.post_llm("hpi");
                if let Some(reply) = self.llm_reply(decision) {
                    self.with_state(|s, ctx| {
                        if let Some(turns) = s.app_state.get_mut("hpiConversation").and_then(Value::as_array_mut) {
                            turns.push(json!({ "role": "assistant", "content": reply }));
                        }
                        if is_hpi_complete(&reply) {
                            s.pending = Some((Instant::now() + ctx.behavior.hpi_delay, ScreenId::PastMedicalHistory));
                        }
                        s.persist(ctx);
                    });
                }
            }
            Control::ConfirmAndGenerate => {
                self.with_state(|s, ctx| s.show(ctx, ScreenId::LoadingSummary));
                let decision = self.post_llm("summary");
                match self.llm_reply(decision).map(|text| (parse_summary(&text).is_ok(), text)) {
                    Some((true, text)) => self.with_state(|s, ctx| {
                        s.summary = Some(text);
                        s.pending = Some((Instant::now() + ctx.behavior.summary_delay, ScreenId::Summary));
                    }),
                    Some((false, _)) => self.ctx.observations.push(
                        &self.ctx.profile.name,
                        ObservationKind::PageError,
                        "Cannot read properties of undefined (reading 'split')",
                    ),
                    None => {}
                }
            }
            Control::StartNew => self.with_state(|s, ctx| {
                ctx.storage.lock().retain(|key, _| !key.starts_with(STORAGE_PREFIX));
                s.load_document(ctx);
            }),
            Control::DownloadPdf => {}
        }
    }
}

#[async_trait]
impl PageHandle for FakePage {
    async fn goto(&self, url: &str, _timeout: Duration) -> E2eResult<()> {
        if !url.starts_with(BASE_URL) {
            return Err(E2eError::Bridge(format!("net::ERR_CONNECTION_REFUSED at {}", url)));
        }
        self.with_state(|s, ctx| s.load_document(ctx));
        Ok(())
    }

    async fn reload(&self, _timeout: Duration) -> E2eResult<()> {
        self.with_state(|s, ctx| {
            if s.loaded {
                s.load_document(ctx);
                Ok(())
            } else {
                Err(E2eError::Bridge("nothing to reload".to_string()))
            }
        })
    }

    async fn click(&self, selector: &str, timeout: Duration) -> E2eResult<()> {
        let element = Self::element(selector)?;
        self.poll(timeout, &format!("click {}", selector), |s| s.is_clickable(element))
            .await?;
        if let Element::Control(control) = element {
            self.press(control);
        }
        Ok(())
    }

    async fn fill(&self, selector: &str, value: &str) -> E2eResult<()> {
        let Element::Field(field) = Self::element(selector)? else {
            return Err(E2eError::Bridge(format!("{} is not an input", selector)));
        };
        self.poll(Duration::from_secs(5), &format!("fill {}", selector), |s| {
            s.is_visible(Element::Field(field))
        })
        .await?;
        self.with_state(|s, ctx| {
            set_pointer(&mut s.app_state, field.pointer(), value);
            s.persist(ctx);
        });
        Ok(())
    }

    async fn select_option(&self, selector: &str, value: &str) -> E2eResult<()> {
        match Self::element(selector)? {
            Element::Field(field) if field.is_select() => self.fill(selector, value).await,
            _ => Err(E2eError::Bridge(format!("{} is not a select", selector))),
        }
    }

    async fn input_value(&self, selector: &str) -> E2eResult<String> {
        match Self::element(selector)? {
            Element::Field(field) => Ok(self.with_state(|s, _| s.field_value(field))),
            _ => Err(E2eError::Bridge(format!("{} is not an input", selector))),
        }
    }

    async fn is_visible(&self, selector: &str) -> E2eResult<bool> {
        Ok(match resolve(selector) {
            Some(element) => self.with_state(|s, _| s.is_visible(element)),
            None => false,
        })
    }

    async fn wait_for(&self, selector: &str, state: WaitState, timeout: Duration) -> E2eResult<()> {
        let element = Self::element(selector)?;
        let what = format!("waiting for {} to be {}", selector, state.as_str());
        self.poll(timeout, &what, |s| match state {
            WaitState::Visible => s.is_visible(element),
            WaitState::Hidden => !s.is_visible(element),
            WaitState::Attached => s.loaded,
            WaitState::Detached => !s.loaded,
        })
        .await
    }

    async fn element_id(&self, selector: &str) -> E2eResult<Option<String>> {
        Ok(self.with_state(|s, _| match resolve(selector) {
            Some(Element::ActiveScreen) if s.loaded => Some(s.active.as_str().to_string()),
            Some(Element::Screen(screen)) if s.loaded => Some(screen.as_str().to_string()),
            _ => None,
        }))
    }

    async fn text_content(&self, selector: &str) -> E2eResult<Option<String>> {
        Ok(self.with_state(|s, _| match resolve(selector) {
            Some(Element::WelcomeHeading) if s.loaded => Some("Welcome to Historia AI".to_string()),
            Some(Element::Screen(ScreenId::Summary)) if s.loaded => s.summary.clone(),
            _ => None,
        }))
    }

    async fn bounding_box(&self, selector: &str) -> E2eResult<Option<BoundingBox>> {
        let Some(element) = resolve(selector) else {
            return Ok(None);
        };
        Ok(self.with_state(|s, ctx| {
            if !s.is_visible(element) {
                return None;
            }
            let viewport = ctx.profile.viewport;
            let height = if ctx.behavior.collapsed_layout && element == Element::AppContainer {
                0.0
            } else {
                viewport.height as f64
            };
            Some(BoundingBox {
                x: 0.0,
                y: 0.0,
                width: viewport.width as f64,
                height,
            })
        }))
    }

    async fn local_storage_get(&self, key: &str) -> E2eResult<Option<String>> {
        Ok(self.ctx.storage.lock().get(key).cloned())
    }

    async fn seed_local_storage(&self, entries: &[(String, String)]) -> E2eResult<()> {
        self.state.lock().seed = Some(entries.to_vec());
        Ok(())
    }

    async fn screenshot(&self, path: &Path, _full_page: bool) -> E2eResult<()> {
        if self.ctx.behavior.fail_screenshots {
            return Err(E2eError::Bridge("Target page has been closed".to_string()));
        }
        let viewport = self.ctx.profile.viewport;
        let raster = image::RgbImage::from_pixel(viewport.width, viewport.height, image::Rgb([250, 250, 250]));
        raster.save(path)?;
        Ok(())
    }

    async fn close(&self) -> E2eResult<()> {
        self.state.lock().closed = true;
        Ok(())
    }
}
