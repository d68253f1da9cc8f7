//! Screen state machine of the app under test
//!
//! The app never documents its screen graph, so it is modelled here once: the
//! closed set of screen identifiers, the controls that move between them, the
//! input fields each screen owns, and the transition table every scenario walks.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::E2eError;
use crate::timing::Timings;

/// Selector of the element wrapping every screen
pub const APP_CONTAINER: &str = ".app-container";

/// Selector of whichever screen currently carries the `active` class
pub const ACTIVE_SCREEN: &str = ".screen.active";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScreenId {
    #[serde(rename = "disclaimer-modal")]
    DisclaimerModal,
    #[serde(rename = "welcome-screen")]
    Welcome,
    #[serde(rename = "preliminary-data-screen")]
    PreliminaryData,
    #[serde(rename = "chief-complaint-screen")]
    ChiefComplaint,
    #[serde(rename = "hpi-chat-screen")]
    HpiChat,
    #[serde(rename = "past-medical-history-screen")]
    PastMedicalHistory,
    #[serde(rename = "social-history-screen")]
    SocialHistory,
    #[serde(rename = "lab-report-screen")]
    LabReport,
    #[serde(rename = "review-screen")]
    Review,
    #[serde(rename = "loading-summary-screen")]
    LoadingSummary,
    #[serde(rename = "summary-screen")]
    Summary,
}

impl ScreenId {
    pub const ALL: [ScreenId; 11] = [
        ScreenId::DisclaimerModal,
        ScreenId::Welcome,
        ScreenId::PreliminaryData,
        ScreenId::ChiefComplaint,
        ScreenId::HpiChat,
        ScreenId::PastMedicalHistory,
        ScreenId::SocialHistory,
        ScreenId::LabReport,
        ScreenId::Review,
        ScreenId::LoadingSummary,
        ScreenId::Summary,
    ];

    /// Element id used by the app, which is also the persisted screen marker
    pub fn as_str(&self) -> &'static str {
        match self {
            ScreenId::DisclaimerModal => "disclaimer-modal",
            ScreenId::Welcome => "welcome-screen",
            ScreenId::PreliminaryData => "preliminary-data-screen",
            ScreenId::ChiefComplaint => "chief-complaint-screen",
            ScreenId::HpiChat => "hpi-chat-screen",
            ScreenId::PastMedicalHistory => "past-medical-history-screen",
            ScreenId::SocialHistory => "social-history-screen",
            ScreenId::LabReport => "lab-report-screen",
            ScreenId::Review => "review-screen",
            ScreenId::LoadingSummary => "loading-summary-screen",
            ScreenId::Summary => "summary-screen",
        }
    }

    pub fn root_selector(&self) -> String {
        format!("#{}", self.as_str())
    }

    /// The disclaimer is a modal laid over whichever screen is active, not a `.screen`.
    pub fn is_overlay(&self) -> bool {
        matches!(self, ScreenId::DisclaimerModal)
    }

    /// Screens that only exist while a request is in flight
    pub fn is_transient(&self) -> bool {
        matches!(self, ScreenId::LoadingSummary)
    }
}

impl fmt::Display for ScreenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScreenId {
    type Err = E2eError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ScreenId::ALL
            .iter()
            .copied()
            .find(|screen| screen.as_str() == s)
            .ok_or_else(|| E2eError::Snapshot(format!("unknown screen identifier '{}'", s)))
    }
}

/// Actionable controls of the DOM contract
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    AcceptDisclaimer,
    BeginHistory,
    /// A `.next-btn` tagged with its destination screen
    Next(ScreenId),
    StartHpi,
    ConfirmAndGenerate,
    StartNew,
    DownloadPdf,
}

impl Control {
    pub fn selector(&self) -> String {
        match self {
            Control::AcceptDisclaimer => "#accept-disclaimer-btn".to_string(),
            Control::BeginHistory => "#begin-history-btn".to_string(),
            Control::Next(target) => format!("button[data-next='{}']", target.as_str()),
            Control::StartHpi => "#start-hpi-btn".to_string(),
            Control::ConfirmAndGenerate => "#confirm-and-generate-btn".to_string(),
            Control::StartNew => "#start-new-btn".to_string(),
            Control::DownloadPdf => "#download-pdf-btn".to_string(),
        }
    }
}

/// Named input fields and where the app persists them inside `historia_appState`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Name,
    Age,
    Sex,
    Symptom,
    Duration,
    Surgeries,
    Medications,
    Tobacco,
    Alcohol,
    LabReports,
}

impl Field {
    pub const ALL: [Field; 10] = [
        Field::Name,
        Field::Age,
        Field::Sex,
        Field::Symptom,
        Field::Duration,
        Field::Surgeries,
        Field::Medications,
        Field::Tobacco,
        Field::Alcohol,
        Field::LabReports,
    ];

    pub fn selector(&self) -> &'static str {
        match self {
            Field::Name => "#name",
            Field::Age => "#age",
            Field::Sex => "#sex",
            Field::Symptom => "#cc-symptom",
            Field::Duration => "#cc-duration",
            Field::Surgeries => "#psh-details",
            Field::Medications => "#meds-details",
            Field::Tobacco => "#social-tobacco",
            Field::Alcohol => "#social-alcohol",
            Field::LabReports => "#lab-reports",
        }
    }

    /// JSON pointer into the persisted application state
    pub fn pointer(&self) -> &'static str {
        match self {
            Field::Name => "/preliminary/name",
            Field::Age => "/preliminary/age",
            Field::Sex => "/preliminary/sex",
            Field::Symptom => "/cc/symptom",
            Field::Duration => "/cc/duration",
            Field::Surgeries => "/history/surgeries",
            Field::Medications => "/history/medications",
            Field::Tobacco => "/social/tobacco",
            Field::Alcohol => "/social/alcohol",
            Field::LabReports => "/labReports",
        }
    }

    pub fn screen(&self) -> ScreenId {
        match self {
            Field::Name | Field::Age | Field::Sex => ScreenId::PreliminaryData,
            Field::Symptom | Field::Duration => ScreenId::ChiefComplaint,
            Field::Surgeries | Field::Medications => ScreenId::PastMedicalHistory,
            Field::Tobacco | Field::Alcohol => ScreenId::SocialHistory,
            Field::LabReports => ScreenId::LabReport,
        }
    }

    /// Value the app shows when nothing has been entered
    pub fn default_value(&self) -> &'static str {
        match self {
            Field::Sex => "Male",
            Field::Tobacco | Field::Alcohol => "Never",
            _ => "",
        }
    }

    pub fn is_select(&self) -> bool {
        matches!(self, Field::Sex | Field::Tobacco | Field::Alcohol)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Field::Name => "name",
            Field::Age => "age",
            Field::Sex => "sex",
            Field::Symptom => "symptom",
            Field::Duration => "duration",
            Field::Surgeries => "surgeries",
            Field::Medications => "medications",
            Field::Tobacco => "tobacco",
            Field::Alcohol => "alcohol",
            Field::LabReports => "lab_reports",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionKind {
    /// Shown synchronously by the triggering click
    Direct,
    /// Shown only after a mocked response has been delivered and parsed
    Async,
    /// Clears persisted state and reloads the page
    Reset,
}

/// Fixed minimum wait before polling the destination's visibility
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settle {
    None,
    DisclaimerFade,
    HpiComplete,
}

impl Settle {
    pub fn duration(&self, timings: &Timings) -> Duration {
        match self {
            Settle::None => Duration::ZERO,
            Settle::DisclaimerFade => timings.disclaimer_fade(),
            Settle::HpiComplete => timings.hpi_settle(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ScreenId,
    pub to: ScreenId,
    /// `None` when the request was already issued on entering `from`
    pub trigger: Option<Control>,
    pub kind: TransitionKind,
    pub settle: Settle,
}

impl Transition {
    pub fn timeout(&self, timings: &Timings) -> Duration {
        match self.kind {
            TransitionKind::Direct => timings.direct_timeout(),
            TransitionKind::Async => timings.async_timeout(),
            TransitionKind::Reset => timings.navigation_timeout(),
        }
    }
}

const fn edge(
    from: ScreenId,
    to: ScreenId,
    trigger: Option<Control>,
    kind: TransitionKind,
    settle: Settle,
) -> Transition {
    Transition {
        from,
        to,
        trigger,
        kind,
        settle,
    }
}

pub const TRANSITIONS: &[Transition] = &[
    edge(
        ScreenId::DisclaimerModal,
        ScreenId::Welcome,
        Some(Control::AcceptDisclaimer),
        TransitionKind::Direct,
        Settle::DisclaimerFade,
    ),
    edge(
        ScreenId::Welcome,
        ScreenId::PreliminaryData,
        Some(Control::BeginHistory),
        TransitionKind::Direct,
        Settle::None,
    ),
    edge(
        ScreenId::PreliminaryData,
        ScreenId::ChiefComplaint,
        Some(Control::Next(ScreenId::ChiefComplaint)),
        TransitionKind::Direct,
        Settle::None,
    ),
    edge(
        ScreenId::ChiefComplaint,
        ScreenId::HpiChat,
        Some(Control::StartHpi),
        TransitionKind::Direct,
        Settle::None,
    ),
    edge(
        ScreenId::HpiChat,
        ScreenId::PastMedicalHistory,
        None,
        TransitionKind::Async,
        Settle::HpiComplete,
    ),
    edge(
        ScreenId::PastMedicalHistory,
        ScreenId::SocialHistory,
        Some(Control::Next(ScreenId::SocialHistory)),
        TransitionKind::Direct,
        Settle::None,
    ),
    edge(
        ScreenId::SocialHistory,
        ScreenId::LabReport,
        Some(Control::Next(ScreenId::LabReport)),
        TransitionKind::Direct,
        Settle::None,
    ),
    edge(
        ScreenId::LabReport,
        ScreenId::Review,
        Some(Control::Next(ScreenId::Review)),
        TransitionKind::Direct,
        Settle::None,
    ),
    edge(
        ScreenId::Review,
        ScreenId::Summary,
        Some(Control::ConfirmAndGenerate),
        TransitionKind::Async,
        Settle::None,
    ),
    edge(
        ScreenId::LoadingSummary,
        ScreenId::Summary,
        None,
        TransitionKind::Async,
        Settle::None,
    ),
    edge(
        ScreenId::Summary,
        ScreenId::Welcome,
        Some(Control::StartNew),
        TransitionKind::Reset,
        Settle::None,
    ),
];

/// The single edge from `from` to `to`, if the app has one
pub fn transition(from: ScreenId, to: ScreenId) -> Option<&'static Transition> {
    TRANSITIONS.iter().find(|t| t.from == from && t.to == to)
}

/// Shortest sequence of edges leading from `from` to `to`
pub fn path(from: ScreenId, to: ScreenId) -> Option<Vec<&'static Transition>> {
    if from == to {
        return Some(Vec::new());
    }

    let mut came_from: HashMap<ScreenId, &'static Transition> = HashMap::new();
    let mut queue = VecDeque::from([from]);

    while let Some(screen) = queue.pop_front() {
        for t in TRANSITIONS.iter().filter(|t| t.from == screen) {
            if t.to == from || came_from.contains_key(&t.to) {
                continue;
            }
            came_from.insert(t.to, t);
            if t.to == to {
                let mut edges = vec![t];
                let mut cursor = t.from;
                while cursor != from {
                    let prev = came_from[&cursor];
                    edges.push(prev);
                    cursor = prev.from;
                }
                edges.reverse();
                return Some(edges);
            }
            queue.push_back(t.to);
        }
    }

    None
}
