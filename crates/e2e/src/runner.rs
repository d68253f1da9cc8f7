//! Scenario runner - sessions, steps, checkpoints and reports

use futures::stream::{FuturesOrdered, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::builtin;
use crate::content::LLM_ENDPOINT;
use crate::driver::ScreenDriver;
use crate::error::{E2eError, E2eResult};
use crate::mock::{respond_with, MockMismatch, RuleStats};
use crate::page::{EngineLauncher, Observation};
use crate::playwright::{PlaywrightConfig, PlaywrightLauncher};
use crate::recorder::{claim_slug, slug, Assertion, Checkpoint, Recorder};
use crate::scenario::{Check, Scenario, ScenarioStep, Step};
use crate::server::{ServerConfig, ServerHandle};
use crate::session::{Session, SessionContext};
use crate::screen::Field;
use crate::storage::{self, StorageState};
use crate::timing::Timings;

/// Outcome of one executed step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    pub index: usize,
    pub context: usize,
    pub name: String,
    pub success: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
    #[serde(default)]
    pub assertions: Vec<Assertion>,
}

/// Mock usage of one browsing context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextMocks {
    pub profile: String,
    pub rules: Vec<RuleStats>,
    pub mismatches: Vec<MockMismatch>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub name: String,
    pub profiles: Vec<String>,
    pub success: bool,
    pub duration_ms: u64,
    pub steps: Vec<StepOutcome>,
    pub checkpoints: Vec<Checkpoint>,
    pub observations: Vec<Observation>,
    pub mocks: Vec<ContextMocks>,
    pub error: Option<String>,
    /// The environment could not be brought up; nothing after this can run
    #[serde(default)]
    pub fatal: bool,
}

impl ScenarioReport {
    fn aborted(scenario: &Scenario, started: Instant, error: &E2eError) -> Self {
        Self {
            name: scenario.name.clone(),
            profiles: Vec::new(),
            success: false,
            duration_ms: started.elapsed().as_millis() as u64,
            steps: Vec::new(),
            checkpoints: Vec::new(),
            observations: Vec::new(),
            mocks: Vec::new(),
            error: Some(error.to_string()),
            fatal: error.is_fatal(),
        }
    }

    pub fn failed_assertions(&self) -> impl Iterator<Item = &Assertion> {
        self.steps.iter().flat_map(|s| s.assertions.iter()).filter(|a| !a.passed)
    }
}

/// Result of running a set of scenarios
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteReport {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    /// Scenarios never started because the environment failed
    pub skipped: usize,
    pub duration_ms: u64,
    pub results: Vec<ScenarioReport>,
}

impl SuiteReport {
    pub fn fatal(&self) -> Option<&ScenarioReport> {
        self.results.iter().find(|r| r.fatal)
    }

    /// Pass/fail narrative for the terminal
    pub fn narrative(&self) -> String {
        let mut out = String::new();

        for report in &self.results {
            let mark = if report.success { "✓" } else { "✗" };
            out.push_str(&format!("{} {} ({} ms)\n", mark, report.name, report.duration_ms));

            for step in &report.steps {
                let mark = if step.success { "✓" } else { "✗" };
                out.push_str(&format!("    {} [{}] {}\n", mark, step.context, step.name));
                if let Some(err) = &step.error {
                    out.push_str(&format!("        error: {}\n", err));
                }
                for assertion in step.assertions.iter().filter(|a| !a.passed) {
                    out.push_str(&format!(
                        "        ✗ {}: {}\n",
                        assertion.description,
                        assertion.detail.as_deref().unwrap_or("failed")
                    ));
                }
            }
            if report.steps.is_empty() {
                if let Some(err) = &report.error {
                    out.push_str(&format!("    error: {}\n", err));
                }
            }
            for checkpoint in &report.checkpoints {
                match &checkpoint.screenshot_path {
                    Some(path) => out.push_str(&format!("    ▣ {} -> {}\n", checkpoint.name, path.display())),
                    None => out.push_str(&format!("    ▣ {} (no screenshot)\n", checkpoint.name)),
                }
            }
        }

        out.push_str(&format!(
            "\nScenario results: {} passed, {} failed, {} skipped ({} ms)\n",
            self.passed, self.failed, self.skipped, self.duration_ms
        ));
        out
    }
}

/// Configuration for the scenario runner
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// App server to spawn; `None` when `base_url` is already served
    pub server: Option<ServerConfig>,
    pub playwright: PlaywrightConfig,
    pub base_url: String,
    pub artifacts_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Extra YAML scenarios loaded next to the bundled ones
    pub specs_dir: Option<PathBuf>,
    pub timings: Timings,
    /// Endpoints that must never be reached without an active mock
    pub guarded_endpoints: Vec<String>,
    /// Scenarios run at the same time, each on its own session
    pub concurrency: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            server: None,
            playwright: PlaywrightConfig::default(),
            base_url: "http://localhost:8080".to_string(),
            artifacts_dir: PathBuf::from("test-results/artifacts"),
            output_dir: PathBuf::from("test-results"),
            specs_dir: None,
            timings: Timings::default(),
            guarded_endpoints: vec![LLM_ENDPOINT.to_string()],
            concurrency: 1,
        }
    }
}

#[derive(Default)]
struct ContextRun {
    driver: Option<ScreenDriver>,
    seed: Option<StorageState>,
    /// Assertions waiting for the next checkpoint
    pending: Vec<Assertion>,
    snapshots: HashMap<String, StorageState>,
    mismatches_seen: usize,
}

impl ContextRun {
    fn driver(&self, index: usize) -> E2eResult<&ScreenDriver> {
        self.driver.as_ref().ok_or_else(|| {
            E2eError::SpecParse(format!("context {} has no page yet; open it first", index))
        })
    }

    fn snapshot(&self, label: &str) -> E2eResult<&StorageState> {
        self.snapshots
            .get(label)
            .ok_or_else(|| E2eError::SpecParse(format!("no storage snapshot labelled '{}'", label)))
    }
}

/// Label under which a seeded state is kept for later comparison
pub const SEED_SNAPSHOT: &str = "seed";

pub struct ScenarioRunner {
    config: RunnerConfig,
    launcher: Arc<dyn EngineLauncher>,
    server: Option<ServerHandle>,
    /// Artifact directories already claimed by a scenario of this runner
    artifact_dirs: Mutex<HashSet<String>>,
}

impl ScenarioRunner {
    /// Runner driving a real browser through Playwright
    pub fn new(config: RunnerConfig) -> Self {
        let launcher = Arc::new(PlaywrightLauncher::new(config.playwright.clone()));
        Self::with_launcher(config, launcher)
    }

    pub fn with_launcher(config: RunnerConfig, launcher: Arc<dyn EngineLauncher>) -> Self {
        Self {
            config,
            launcher,
            server: None,
            artifact_dirs: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Start the app server, if one is configured
    pub async fn start_server(&mut self) -> E2eResult<()> {
        if self.server.is_some() {
            return Ok(());
        }
        let Some(server_config) = self.config.server.clone() else {
            return Ok(());
        };

        let server = ServerHandle::spawn(server_config).await?;
        self.config.base_url = server.base_url().to_string();
        self.server = Some(server);
        Ok(())
    }

    pub fn stop_server(&mut self) -> E2eResult<()> {
        if let Some(mut server) = self.server.take() {
            server.stop()?;
        }
        Ok(())
    }

    /// Bundled scenarios followed by those under `specs_dir`
    pub fn load_scenarios(&self) -> E2eResult<Vec<Scenario>> {
        let mut scenarios = builtin::all()?;
        if let Some(dir) = &self.config.specs_dir {
            if dir.exists() {
                scenarios.extend(Scenario::load_all(dir)?);
            } else {
                warn!("Scenario directory {} does not exist", dir.display());
            }
        }
        Ok(scenarios)
    }

    /// Run `scenarios`, up to `concurrency` at a time. An environment failure
    /// stops the run: scenarios already started finish and are disposed, those
    /// not yet started are counted as skipped.
    pub async fn run_scenarios(&self, scenarios: &[Scenario]) -> SuiteReport {
        let start = Instant::now();
        info!("Running {} scenario(s)...", scenarios.len());

        let mut results = Vec::with_capacity(scenarios.len());
        let mut queue = scenarios.iter();
        let mut runs = FuturesOrdered::new();
        for scenario in queue.by_ref().take(self.config.concurrency.max(1)) {
            runs.push_back(self.run_scenario(scenario));
        }

        let mut abandoned = false;
        while let Some(report) = runs.next().await {
            if report.success {
                info!("✓ {} ({} ms)", report.name, report.duration_ms);
            } else {
                error!(
                    "✗ {} - {}",
                    report.name,
                    report.error.as_deref().unwrap_or("assertion failures")
                );
            }
            if report.fatal && !abandoned {
                error!("Environment failure; abandoning scenarios not yet started");
                abandoned = true;
            }
            results.push(report);
            if !abandoned {
                if let Some(next) = queue.next() {
                    runs.push_back(self.run_scenario(next));
                }
            }
        }

        let passed = results.iter().filter(|r| r.success).count();
        let failed = results.len() - passed;
        let skipped = scenarios.len() - results.len();
        let duration_ms = start.elapsed().as_millis() as u64;

        info!(
            "Scenario results: {} passed, {} failed, {} skipped ({} ms)",
            passed, failed, skipped, duration_ms
        );

        SuiteReport {
            total: scenarios.len(),
            passed,
            failed,
            skipped,
            duration_ms,
            results,
        }
    }

    /// Run one scenario on a fresh session. Never returns early without
    /// disposing the session it created.
    pub async fn run_scenario(&self, scenario: &Scenario) -> ScenarioReport {
        let started = Instant::now();
        info!("Running scenario: {}", scenario.name);

        let prepared = scenario
            .validate()
            .and_then(|_| scenario.resolve_profiles())
            .and_then(|profiles| {
                Recorder::new(&self.config.artifacts_dir, &self.claim_artifact_dir(&scenario.name))
                    .map(|r| (profiles, r))
            });
        let (profiles, recorder) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => return ScenarioReport::aborted(scenario, started, &e),
        };

        let guarded = scenario
            .guarded_endpoints
            .clone()
            .unwrap_or_else(|| self.config.guarded_endpoints.clone());

        let session = match Session::create(self.launcher.as_ref(), &profiles, &guarded).await {
            Ok(session) => session,
            Err(e) => {
                error!("Session for '{}' could not start: {}", scenario.name, e);
                return ScenarioReport::aborted(scenario, started, &e);
            }
        };

        let mut runs: Vec<ContextRun> = session.contexts().iter().map(|_| ContextRun::default()).collect();
        let mut outcomes = Vec::with_capacity(scenario.steps.len());
        let mut failure: Option<E2eError> = None;

        for (index, step) in scenario.steps.iter().enumerate() {
            let step_start = Instant::now();
            let name = step.action.name();
            debug!("Step {}: [{}] {}", index + 1, step.context, name);

            let result = match self.execute_step(&session, &recorder, &mut runs, step).await {
                Ok(assertions) => check_mismatches(&session, &mut runs).map(|_| assertions),
                Err(e) => Err(e),
            };

            let duration_ms = step_start.elapsed().as_millis() as u64;
            match result {
                Ok(assertions) => outcomes.push(StepOutcome {
                    index,
                    context: step.context,
                    name,
                    success: true,
                    duration_ms,
                    error: None,
                    assertions,
                }),
                Err(e) => {
                    error!("Step {} ({}) failed: {}", index + 1, name, e);
                    outcomes.push(StepOutcome {
                        index,
                        context: step.context,
                        name,
                        success: false,
                        duration_ms,
                        error: Some(e.to_string()),
                        assertions: Vec::new(),
                    });
                    failure = Some(e);
                    break;
                }
            }
        }

        self.final_checkpoints(&session, &recorder, &mut runs, failure.is_some())
            .await;

        let observations = session.observations();
        let mocks = session
            .contexts()
            .iter()
            .map(|c| ContextMocks {
                profile: c.profile().name.clone(),
                rules: c.routes().stats(),
                mismatches: c.routes().mismatches(),
            })
            .collect();

        drop(runs);
        if let Err(e) = session.dispose().await {
            warn!("Disposing session for '{}' failed: {}", scenario.name, e);
        }

        let checkpoints = recorder.checkpoints();
        let assertions_passed = outcomes.iter().flat_map(|o| o.assertions.iter()).all(|a| a.passed)
            && checkpoints.iter().all(Checkpoint::passed);

        ScenarioReport {
            name: scenario.name.clone(),
            profiles: profiles.iter().map(|p| p.name.clone()).collect(),
            success: failure.is_none() && assertions_passed,
            duration_ms: started.elapsed().as_millis() as u64,
            steps: outcomes,
            checkpoints,
            observations,
            mocks,
            error: failure.map(|e| e.to_string()),
            fatal: false,
        }
    }

    async fn execute_step(
        &self,
        session: &Session,
        recorder: &Recorder,
        runs: &mut [ContextRun],
        step: &Step,
    ) -> E2eResult<Vec<Assertion>> {
        let context = session.context(step.context)?;
        let run = runs
            .get_mut(step.context)
            .ok_or_else(|| E2eError::SpecParse(format!("context {} does not exist", step.context)))?;

        match &step.action {
            ScenarioStep::Open { dismiss_disclaimer } => {
                if let Some(previous) = run.driver.take() {
                    previous.page().close().await?;
                }
                let page = context.new_page().await?;
                if let Some(seed) = run.seed.take() {
                    storage::seed(page.as_ref(), &seed).await?;
                }
                // Kept before opening so a failed load still gets its failure checkpoint
                run.driver = Some(ScreenDriver::new(
                    page,
                    self.config.base_url.clone(),
                    self.config.timings.clone(),
                ));
                let screen = run.driver(step.context)?.open(*dismiss_disclaimer).await?;
                info!(
                    "[{}] app opened on {}",
                    context.profile().name,
                    screen.map(|s| s.as_str()).unwrap_or("no screen")
                );
            }
            ScenarioStep::Seed { state } => {
                state.to_entries()?;
                run.seed = Some(state.clone());
                run.snapshots.insert(SEED_SNAPSHOT.to_string(), state.clone());
            }
            ScenarioStep::Goto { screen, fields } => {
                run.driver(step.context)?.goto(*screen, &field_list(fields)).await?;
            }
            ScenarioStep::WalkTo { screen, fields } => {
                run.driver(step.context)?.walk_to(*screen, &field_list(fields)).await?;
            }
            ScenarioStep::Fill { fields } => {
                run.driver(step.context)?.fill(&field_list(fields)).await?;
            }
            ScenarioStep::Reload { dismiss_disclaimer } => {
                run.driver(step.context)?.reload(*dismiss_disclaimer).await?;
            }
            ScenarioStep::InstallMock { pattern, response } => {
                context.install_mock(pattern, respond_with(response.fulfillment()?)).await?;
            }
            ScenarioStep::ReplaceMock { pattern, response } => {
                context.replace_mock(pattern, respond_with(response.fulfillment()?)).await?;
            }
            ScenarioStep::RemoveMock { pattern } => {
                if context.remove_mock(pattern).is_none() {
                    warn!("No active mock for {} to remove", pattern);
                }
            }
            ScenarioStep::CaptureStorage { label } => {
                let page = run.driver(step.context)?.page().clone();
                let state = storage::capture(page.as_ref())
                    .await?
                    .ok_or_else(|| E2eError::Snapshot("the app has persisted nothing yet".to_string()))?;
                run.snapshots.insert(label.clone(), state);
            }
            ScenarioStep::Assert { check } => {
                let assertions = evaluate(check, context, run, step.context).await?;
                for assertion in assertions.iter().filter(|a| !a.passed) {
                    warn!(
                        "Assertion failed: {} ({})",
                        assertion.description,
                        assertion.detail.as_deref().unwrap_or("")
                    );
                }
                run.pending.extend(assertions.iter().cloned());
                return Ok(assertions);
            }
            ScenarioStep::Checkpoint { name, checks } => {
                let mut own = Vec::new();
                for check in checks {
                    own.extend(evaluate(check, context, run, step.context).await?);
                }
                let mut assertions: Vec<Assertion> = run.pending.drain(..).collect();
                assertions.extend(own.iter().cloned());

                let page = run.driver(step.context)?.page().clone();
                recorder.checkpoint(page.as_ref(), name, assertions).await?;
                return Ok(own);
            }
            ScenarioStep::Sleep { ms } => {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
            }
            ScenarioStep::Log { message } => {
                info!("[SCENARIO] {}", message);
            }
        }

        Ok(Vec::new())
    }

    /// Capture what each open page looks like now. After a failure this is the
    /// evidence; otherwise it flushes assertions no checkpoint has claimed.
    async fn final_checkpoints(&self, session: &Session, recorder: &Recorder, runs: &mut [ContextRun], failed: bool) {
        for (context, run) in session.contexts().iter().zip(runs.iter_mut()) {
            if !failed && run.pending.is_empty() {
                continue;
            }
            let Some(driver) = &run.driver else {
                continue;
            };

            let name = if failed {
                format!("failure {}", context.profile().name)
            } else {
                format!("final {}", context.profile().name)
            };
            let assertions: Vec<Assertion> = run.pending.drain(..).collect();
            if let Err(e) = recorder.checkpoint(driver.page().as_ref(), &name, assertions).await {
                warn!("Final checkpoint '{}' failed: {}", name, e);
            }
        }
    }

    /// Artifact directory name for `scenario`, unique within this runner
    fn claim_artifact_dir(&self, scenario: &str) -> String {
        let dir = claim_slug(&mut self.artifact_dirs.lock(), scenario);
        if dir != slug(scenario) {
            warn!("Artifacts for '{}' go to {} to keep earlier checkpoints", scenario, dir);
        }
        dir
    }

    /// Write the suite report as JSON
    pub fn write_results(&self, report: &SuiteReport) -> E2eResult<PathBuf> {
        write_report(&self.config.output_dir, report)
    }
}

impl Drop for ScenarioRunner {
    fn drop(&mut self) {
        let _ = self.stop_server();
    }
}

pub fn write_report(output_dir: &Path, report: &SuiteReport) -> E2eResult<PathBuf> {
    std::fs::create_dir_all(output_dir)?;

    let path = output_dir.join("scenario-results.json");
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(&path, json)?;

    info!("Results written to: {}", path.display());
    Ok(path)
}

fn field_list(fields: &std::collections::BTreeMap<Field, String>) -> Vec<(Field, String)> {
    fields.iter().map(|(f, v)| (*f, v.clone())).collect()
}

/// A guarded request that went unanswered by any mock fails the step it happened in.
/// Requests are charged to the step during which the driver reported them; one
/// the app issues after a step has returned counts against the next step.
fn check_mismatches(session: &Session, runs: &mut [ContextRun]) -> E2eResult<()> {
    for (context, run) in session.contexts().iter().zip(runs.iter_mut()) {
        let mismatches = context.routes().mismatches();
        if mismatches.len() > run.mismatches_seen {
            let first = mismatches[run.mismatches_seen].clone();
            run.mismatches_seen = mismatches.len();
            return Err(first.into());
        }
    }
    Ok(())
}

async fn evaluate(check: &Check, context: &SessionContext, run: &ContextRun, index: usize) -> E2eResult<Vec<Assertion>> {
    let description = check.describe();

    let assertion = match check {
        Check::Visible { selector } => {
            let page = run.driver(index)?.page();
            let visible = page.is_visible(selector).await?;
            Assertion::check(description, visible, Some("not visible".to_string()))
        }
        Check::Hidden { selector } => {
            let page = run.driver(index)?.page();
            let visible = page.is_visible(selector).await?;
            Assertion::check(description, !visible, Some("still visible".to_string()))
        }
        Check::Screen { screen } => {
            let current = run.driver(index)?.current_screen().await?;
            Assertion::check(
                description,
                current == Some(*screen),
                Some(format!(
                    "showing {}",
                    current.map(|s| s.as_str()).unwrap_or("no screen")
                )),
            )
        }
        Check::InputValue { field, value } => {
            let shown = run.driver(index)?.input_value(*field).await?;
            Assertion::check(description, &shown == value, Some(format!("input shows '{}'", shown)))
        }
        Check::TextContains { selector, text } => {
            let content = run.driver(index)?.page().text_content(selector).await?;
            let found = content.as_deref().map(|c| c.contains(text.as_str())).unwrap_or(false);
            Assertion::check(
                description,
                found,
                Some(match content {
                    Some(c) => format!("text is '{}'", c.trim()),
                    None => "element not found".to_string(),
                }),
            )
        }
        Check::NonZeroBox { selector } => {
            let bounds = run.driver(index)?.page().bounding_box(selector).await?;
            Assertion::check(
                description,
                bounds.map(|b| b.is_non_zero()).unwrap_or(false),
                Some(match bounds {
                    Some(b) => format!("box is {}x{} at ({}, {})", b.width, b.height, b.x, b.y),
                    None => "element has no layout box".to_string(),
                }),
            )
        }
        Check::RoundTrip { snapshot } => {
            let written = run.snapshot(snapshot)?;
            let page = run.driver(index)?.page();
            match storage::capture(page.as_ref()).await? {
                Some(read) => storage::assert_round_trip(written, &read).to_assertion(&description),
                None => Assertion::fail(description, "nothing persisted after reload"),
            }
        }
        Check::StorageCleared { snapshot } => {
            let previous = run.snapshot(snapshot)?;
            let page = run.driver(index)?.page();
            return storage::assert_cleared(page.as_ref(), previous).await;
        }
        Check::MockInvoked { pattern, count, min } => match context.routes().active_count(pattern) {
            None => Assertion::fail(description, format!("no active mock for {}", pattern)),
            Some(served) => {
                let passed = match (count, min) {
                    (Some(n), _) => served == *n,
                    (None, Some(n)) => served >= *n,
                    (None, None) => served > 0,
                };
                Assertion::check(description, passed, Some(format!("served {} time(s)", served)))
            }
        },
        Check::NoMockMismatch => {
            let mismatches = context.routes().mismatches();
            Assertion::check(
                description,
                mismatches.is_empty(),
                Some(
                    mismatches
                        .iter()
                        .map(|m| format!("{} {}", m.method, m.url))
                        .collect::<Vec<_>>()
                        .join(", "),
                ),
            )
        }
        Check::NoPageErrors => {
            let errors = context.observations().page_errors();
            Assertion::check(description, errors == 0, Some(format!("{} page error(s)", errors)))
        }
    };

    Ok(vec![assertion])
}
