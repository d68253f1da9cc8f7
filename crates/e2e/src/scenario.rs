//! Declarative scenarios
//!
//! A scenario is a named, ordered list of steps run against one session.
//! Scenarios are either built in (see [`crate::builtin`]) or loaded from YAML:
//!
//! ```yaml
//! name: persistence
//! profiles: [desktop]
//! steps:
//!   - action: open
//!   - action: walk_to
//!     screen: chief-complaint-screen
//!     fields: { name: John Doe, age: "45" }
//!   - action: capture_storage
//!     label: before
//!   - action: reload
//!   - action: assert
//!     check: { type: round_trip, snapshot: before }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

use crate::content::{self, DIAGNOSES_HEADING, LLM_ENDPOINT};
use crate::error::{E2eError, E2eResult};
use crate::mock::Fulfillment;
use crate::profile::{Profile, ProfileSpec};
use crate::screen::{Field, ScreenId};
use crate::storage::StorageState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub tags: Vec<String>,

    /// One browsing context is opened per profile, addressed by index
    #[serde(default = "default_profiles")]
    pub profiles: Vec<ProfileSpec>,

    /// Overrides the runner's guarded endpoints for this scenario
    #[serde(default)]
    pub guarded_endpoints: Option<Vec<String>>,

    pub steps: Vec<Step>,
}

fn default_profiles() -> Vec<ProfileSpec> {
    vec![ProfileSpec::Preset("desktop".to_string())]
}

/// A step and the context it acts on
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    #[serde(default)]
    pub context: usize,

    #[serde(flatten)]
    pub action: ScenarioStep,
}

impl From<ScenarioStep> for Step {
    fn from(action: ScenarioStep) -> Self {
        Step { context: 0, action }
    }
}

fn yes() -> bool {
    true
}

fn llm_endpoint() -> String {
    LLM_ENDPOINT.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ScenarioStep {
    /// Load the app in a fresh page of the context
    Open {
        #[serde(default = "yes")]
        dismiss_disclaimer: bool,
    },

    /// Persisted state the page starts from; must precede `open`
    Seed { state: StorageState },

    /// Take one edge of the screen graph
    Goto {
        screen: ScreenId,
        #[serde(default)]
        fields: BTreeMap<Field, String>,
    },

    /// Follow the screen graph until `screen` is reached
    WalkTo {
        screen: ScreenId,
        #[serde(default)]
        fields: BTreeMap<Field, String>,
    },

    Fill { fields: BTreeMap<Field, String> },

    Reload {
        #[serde(default = "yes")]
        dismiss_disclaimer: bool,
    },

    InstallMock {
        #[serde(default = "llm_endpoint")]
        pattern: String,
        response: MockResponse,
    },

    ReplaceMock {
        #[serde(default = "llm_endpoint")]
        pattern: String,
        response: MockResponse,
    },

    RemoveMock {
        #[serde(default = "llm_endpoint")]
        pattern: String,
    },

    /// Read the persisted state and keep it under `label`
    CaptureStorage { label: String },

    Assert { check: Check },

    /// Screenshot plus the assertions recorded since the previous checkpoint
    Checkpoint {
        name: String,
        #[serde(default)]
        checks: Vec<Check>,
    },

    Sleep { ms: u64 },

    Log { message: String },
}

impl ScenarioStep {
    /// Short label used in reports and logs
    pub fn name(&self) -> String {
        match self {
            ScenarioStep::Open { .. } => "open".to_string(),
            ScenarioStep::Seed { state } => format!("seed:{}", state.current_screen),
            ScenarioStep::Goto { screen, .. } => format!("goto:{}", screen),
            ScenarioStep::WalkTo { screen, .. } => format!("walk_to:{}", screen),
            ScenarioStep::Fill { fields } => format!("fill:{}", fields.len()),
            ScenarioStep::Reload { .. } => "reload".to_string(),
            ScenarioStep::InstallMock { pattern, .. } => format!("install_mock:{}", pattern),
            ScenarioStep::ReplaceMock { pattern, .. } => format!("replace_mock:{}", pattern),
            ScenarioStep::RemoveMock { pattern } => format!("remove_mock:{}", pattern),
            ScenarioStep::CaptureStorage { label } => format!("capture_storage:{}", label),
            ScenarioStep::Assert { check } => format!("assert:{}", check.describe()),
            ScenarioStep::Checkpoint { name, .. } => format!("checkpoint:{}", name),
            ScenarioStep::Sleep { ms } => format!("sleep:{}ms", ms),
            ScenarioStep::Log { message } => format!("log:{}", message.chars().take(30).collect::<String>()),
        }
    }
}

/// Canned response for a mocked endpoint. Exactly one of `body`, `json` and
/// `content` is given; `content` is wrapped in the chat-completions envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MockResponse {
    #[serde(default)]
    pub status: Option<u16>,

    #[serde(default)]
    pub content_type: Option<String>,

    #[serde(default)]
    pub body: Option<String>,

    #[serde(default)]
    pub json: Option<Value>,

    #[serde(default)]
    pub content: Option<String>,
}

impl MockResponse {
    /// Model reply `text` in the envelope the app reads
    pub fn llm(text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn fulfillment(&self) -> E2eResult<Fulfillment> {
        let mut fulfillment = match (&self.body, &self.json, &self.content) {
            (Some(body), None, None) => Fulfillment {
                status: 200,
                content_type: "text/plain".to_string(),
                body: body.clone(),
            },
            (None, Some(json), None) => Fulfillment::json(json),
            (None, None, Some(text)) => {
                if text.contains(DIAGNOSES_HEADING) {
                    content::parse_summary(text)?;
                }
                Fulfillment::llm(text)
            }
            _ => {
                return Err(E2eError::SpecParse(
                    "a mock response needs exactly one of body, json or content".to_string(),
                ))
            }
        };

        if let Some(status) = self.status {
            fulfillment.status = status;
        }
        if let Some(content_type) = &self.content_type {
            fulfillment.content_type = content_type.clone();
        }
        Ok(fulfillment)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Check {
    Visible { selector: String },

    Hidden { selector: String },

    /// The screen the user currently sees
    Screen { screen: ScreenId },

    InputValue { field: Field, value: String },

    TextContains { selector: String, text: String },

    /// Rendered with a non-empty layout box
    NonZeroBox { selector: String },

    /// Freshly captured storage equals the snapshot kept under `snapshot`
    RoundTrip { snapshot: String },

    /// Every field populated in `snapshot` reads back empty
    StorageCleared { snapshot: String },

    /// Invocations of the rule currently active on `pattern`
    MockInvoked {
        #[serde(default = "llm_endpoint")]
        pattern: String,
        #[serde(default)]
        count: Option<u64>,
        #[serde(default)]
        min: Option<u64>,
    },

    NoMockMismatch,

    NoPageErrors,
}

impl Check {
    pub fn describe(&self) -> String {
        match self {
            Check::Visible { selector } => format!("{} is visible", selector),
            Check::Hidden { selector } => format!("{} is hidden", selector),
            Check::Screen { screen } => format!("current screen is {}", screen),
            Check::InputValue { field, value } => format!("{} reads '{}'", field, value),
            Check::TextContains { selector, text } => format!("{} contains '{}'", selector, text),
            Check::NonZeroBox { selector } => format!("{} has a non-zero bounding box", selector),
            Check::RoundTrip { snapshot } => format!("storage round-trips '{}'", snapshot),
            Check::StorageCleared { snapshot } => format!("fields of '{}' are cleared", snapshot),
            Check::MockInvoked { pattern, count, min } => match (count, min) {
                (Some(n), _) => format!("{} served {} time(s)", pattern, n),
                (None, Some(n)) => format!("{} served at least {} time(s)", pattern, n),
                (None, None) => format!("{} served", pattern),
            },
            Check::NoMockMismatch => "no request reached a guarded endpoint unmocked".to_string(),
            Check::NoPageErrors => "no uncaught page errors".to_string(),
        }
    }
}

impl Scenario {
    /// Parse a scenario from YAML
    pub fn from_yaml(yaml: &str) -> E2eResult<Self> {
        let scenario: Scenario = serde_yaml::from_str(yaml)?;
        scenario.validate()?;
        Ok(scenario)
    }

    /// Load a scenario from a file
    pub fn from_file(path: &Path) -> E2eResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
            .map_err(|e| E2eError::SpecParse(format!("{}: {}", path.display(), e)))
    }

    /// Load every `.yaml`/`.yml` scenario under `dir`, in path order
    pub fn load_all(dir: &Path) -> E2eResult<Vec<Self>> {
        let mut scenarios = Vec::new();

        for entry in walkdir::WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.path()
                    .extension()
                    .map(|ext| ext == "yaml" || ext == "yml")
                    .unwrap_or(false)
            })
        {
            scenarios.push(Self::from_file(entry.path())?);
        }

        Ok(scenarios)
    }

    pub fn resolve_profiles(&self) -> E2eResult<Vec<Profile>> {
        self.profiles.iter().map(ProfileSpec::resolve).collect()
    }

    /// Reject scenarios that could only fail at run time for reasons of their own making
    pub fn validate(&self) -> E2eResult<()> {
        let profiles = self.resolve_profiles()?;
        if profiles.is_empty() {
            return Err(E2eError::SpecParse(format!("{}: no profiles", self.name)));
        }

        let mut opened = vec![false; profiles.len()];
        for (i, step) in self.steps.iter().enumerate() {
            let at = || format!("{}: step {} ({})", self.name, i + 1, step.action.name());

            let Some(is_open) = opened.get_mut(step.context) else {
                return Err(E2eError::SpecParse(format!(
                    "{} targets context {} but only {} profile(s) exist",
                    at(),
                    step.context,
                    profiles.len()
                )));
            };

            match &step.action {
                ScenarioStep::Open { .. } => *is_open = true,
                ScenarioStep::Seed { .. } if *is_open => {
                    return Err(E2eError::SpecParse(format!("{} must come before open", at())));
                }
                ScenarioStep::InstallMock { response, .. } | ScenarioStep::ReplaceMock { response, .. } => {
                    response
                        .fulfillment()
                        .map_err(|e| E2eError::SpecParse(format!("{}: {}", at(), e)))?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Filter scenarios by tag
    pub fn filter_by_tag<'a>(scenarios: &'a [Self], tag: &str) -> Vec<&'a Self> {
        scenarios.iter().filter(|s| s.tags.iter().any(|t| t == tag)).collect()
    }
}
