//! Bundled scenarios covering the app's known flows

use std::collections::BTreeMap;

use crate::content::{SummaryContent, HPI_COMPLETE, LLM_ENDPOINT};
use crate::error::E2eResult;
use crate::profile::{Profile, ProfileSpec};
use crate::scenario::{Check, MockResponse, Scenario, ScenarioStep, Step};
use crate::screen::{Control, Field, ScreenId, APP_CONTAINER};
use crate::storage::{AppState, StorageState};

const WELCOME_HEADING: &str = "#welcome-screen h1";
const APP_TITLE: &str = "Historia AI";

/// Every bundled scenario, in run order
pub fn all() -> E2eResult<Vec<Scenario>> {
    Ok(vec![
        disclaimer_dismissal(),
        persistence_and_start_new(),
        summary_from_review()?,
        responsive_layout(),
        mobile_layout(),
    ])
}

/// Summary reply used wherever the app asks for the final report
pub fn sample_summary() -> SummaryContent {
    SummaryContent::new("Patient has had a throbbing headache for 2 days.")
        .diagnosis("Migraine", "Unilateral throbbing pain, worse with light.")
}

fn fields(values: &[(Field, &str)]) -> BTreeMap<Field, String> {
    values.iter().map(|(f, v)| (*f, v.to_string())).collect()
}

fn on(context: usize, action: ScenarioStep) -> Step {
    Step { context, action }
}

fn check(check: Check) -> ScenarioStep {
    ScenarioStep::Assert { check }
}

fn checkpoint(name: &str) -> ScenarioStep {
    ScenarioStep::Checkpoint {
        name: name.to_string(),
        checks: Vec::new(),
    }
}

fn visible(selector: impl Into<String>) -> Check {
    Check::Visible {
        selector: selector.into(),
    }
}

fn welcome_layout_checks() -> Vec<Check> {
    vec![
        Check::Screen {
            screen: ScreenId::Welcome,
        },
        visible(APP_CONTAINER),
        Check::NonZeroBox {
            selector: APP_CONTAINER.to_string(),
        },
        Check::TextContains {
            selector: WELCOME_HEADING.to_string(),
            text: APP_TITLE.to_string(),
        },
    ]
}

/// The disclaimer blocks the app until accepted, then fades out and leaves
/// a laid-out app container behind.
pub fn disclaimer_dismissal() -> Scenario {
    let steps = vec![
        ScenarioStep::Open {
            dismiss_disclaimer: false,
        },
        check(visible(ScreenId::DisclaimerModal.root_selector())),
        checkpoint("modal visible"),
        ScenarioStep::Goto {
            screen: ScreenId::Welcome,
            fields: BTreeMap::new(),
        },
        check(Check::Hidden {
            selector: ScreenId::DisclaimerModal.root_selector(),
        }),
        check(visible(APP_CONTAINER)),
        check(Check::NonZeroBox {
            selector: APP_CONTAINER.to_string(),
        }),
        check(Check::NoPageErrors),
        checkpoint("after click"),
    ];

    Scenario {
        name: "disclaimer-dismissal".to_string(),
        description: "Accepting the disclaimer reveals the app container".to_string(),
        tags: vec!["smoke".to_string(), "disclaimer".to_string()],
        profiles: vec![ProfileSpec::Preset("desktop-large".to_string())],
        guarded_endpoints: None,
        steps: steps.into_iter().map(Step::from).collect(),
    }
}

/// Intake data survives a reload, the interview and summary run against
/// mocks that are swapped mid-walk, and "start new" wipes everything.
pub fn persistence_and_start_new() -> Scenario {
    let summary = sample_summary().render();

    let steps = vec![
        ScenarioStep::InstallMock {
            pattern: LLM_ENDPOINT.to_string(),
            response: MockResponse::llm(HPI_COMPLETE),
        },
        ScenarioStep::Open {
            dismiss_disclaimer: true,
        },
        ScenarioStep::WalkTo {
            screen: ScreenId::ChiefComplaint,
            fields: fields(&[(Field::Name, "John Doe"), (Field::Age, "45"), (Field::Sex, "Male")]),
        },
        ScenarioStep::CaptureStorage {
            label: "before-reload".to_string(),
        },
        ScenarioStep::Reload {
            dismiss_disclaimer: true,
        },
        check(Check::RoundTrip {
            snapshot: "before-reload".to_string(),
        }),
        check(Check::InputValue {
            field: Field::Name,
            value: "John Doe".to_string(),
        }),
        check(Check::Screen {
            screen: ScreenId::ChiefComplaint,
        }),
        checkpoint("persistence check"),
        ScenarioStep::Goto {
            screen: ScreenId::HpiChat,
            fields: fields(&[(Field::Symptom, "Headache"), (Field::Duration, "2 days")]),
        },
        ScenarioStep::Goto {
            screen: ScreenId::PastMedicalHistory,
            fields: BTreeMap::new(),
        },
        check(Check::MockInvoked {
            pattern: LLM_ENDPOINT.to_string(),
            count: None,
            min: Some(1),
        }),
        ScenarioStep::WalkTo {
            screen: ScreenId::Review,
            fields: fields(&[(Field::Surgeries, "None"), (Field::Medications, "None")]),
        },
        ScenarioStep::ReplaceMock {
            pattern: LLM_ENDPOINT.to_string(),
            response: MockResponse::llm(summary),
        },
        ScenarioStep::Goto {
            screen: ScreenId::Summary,
            fields: BTreeMap::new(),
        },
        check(visible(Control::DownloadPdf.selector())),
        check(visible(Control::StartNew.selector())),
        check(Check::MockInvoked {
            pattern: LLM_ENDPOINT.to_string(),
            count: Some(1),
            min: None,
        }),
        check(Check::NoMockMismatch),
        checkpoint("summary screen"),
        ScenarioStep::CaptureStorage {
            label: "before-reset".to_string(),
        },
        ScenarioStep::Goto {
            screen: ScreenId::Welcome,
            fields: BTreeMap::new(),
        },
        ScenarioStep::Goto {
            screen: ScreenId::PreliminaryData,
            fields: BTreeMap::new(),
        },
        check(Check::StorageCleared {
            snapshot: "before-reset".to_string(),
        }),
        checkpoint("after start new"),
    ];

    Scenario {
        name: "persistence-and-start-new".to_string(),
        description: "Persistence across reload, mocked interview and summary, reset".to_string(),
        tags: vec!["storage".to_string(), "mocks".to_string()],
        profiles: vec![ProfileSpec::Preset("desktop".to_string())],
        guarded_endpoints: None,
        steps: steps.into_iter().map(Step::from).collect(),
    }
}

/// Starting from a seeded review screen, generating the summary lands on
/// the summary screen with both of its actions available.
pub fn summary_from_review() -> E2eResult<Scenario> {
    let seeded = StorageState::new(&AppState::sample_patient(), ScreenId::Review)?;

    let steps = vec![
        ScenarioStep::Seed { state: seeded },
        ScenarioStep::InstallMock {
            pattern: LLM_ENDPOINT.to_string(),
            response: MockResponse::llm(sample_summary().render()),
        },
        ScenarioStep::Open {
            dismiss_disclaimer: true,
        },
        check(Check::Screen {
            screen: ScreenId::Review,
        }),
        check(Check::RoundTrip {
            snapshot: "seed".to_string(),
        }),
        ScenarioStep::Goto {
            screen: ScreenId::Summary,
            fields: BTreeMap::new(),
        },
        check(visible(Control::StartNew.selector())),
        check(visible(Control::DownloadPdf.selector())),
        check(Check::MockInvoked {
            pattern: LLM_ENDPOINT.to_string(),
            count: Some(1),
            min: None,
        }),
        check(Check::NoMockMismatch),
        checkpoint("summary buttons check"),
    ];

    Ok(Scenario {
        name: "summary-from-review".to_string(),
        description: "Seeded review screen generates a summary from a mocked reply".to_string(),
        tags: vec!["mocks".to_string(), "summary".to_string()],
        profiles: vec![ProfileSpec::Preset("desktop".to_string())],
        guarded_endpoints: None,
        steps: steps.into_iter().map(Step::from).collect(),
    })
}

/// The same welcome flow on an iPhone-sized and a wide desktop viewport
pub fn responsive_layout() -> Scenario {
    let mut steps = Vec::new();

    for (context, label) in [(0, "mobile"), (1, "desktop")] {
        steps.push(on(
            context,
            ScenarioStep::Open {
                dismiss_disclaimer: false,
            },
        ));
        steps.push(on(context, check(visible(ScreenId::DisclaimerModal.root_selector()))));
        steps.push(on(context, checkpoint(&format!("{} start", label))));
        steps.push(on(
            context,
            ScenarioStep::Goto {
                screen: ScreenId::Welcome,
                fields: BTreeMap::new(),
            },
        ));
        steps.push(on(
            context,
            ScenarioStep::Checkpoint {
                name: format!("{} welcome", label),
                checks: welcome_layout_checks(),
            },
        ));
    }

    Scenario {
        name: "responsive-layout".to_string(),
        description: "Welcome flow is identical on phone and desktop viewports".to_string(),
        tags: vec!["layout".to_string()],
        profiles: vec![
            ProfileSpec::Preset("iphone".to_string()),
            ProfileSpec::Custom(Profile::custom("desktop-wide", 1280, 800)),
        ],
        guarded_endpoints: None,
        steps,
    }
}

/// Pixel 5 emulation shows the disclaimer and a usable welcome screen
pub fn mobile_layout() -> Scenario {
    let steps = vec![
        on(
            0,
            ScenarioStep::Open {
                dismiss_disclaimer: false,
            },
        ),
        on(0, checkpoint("mobile fix verification")),
        on(
            0,
            ScenarioStep::Goto {
                screen: ScreenId::Welcome,
                fields: BTreeMap::new(),
            },
        ),
        on(
            0,
            ScenarioStep::Checkpoint {
                name: "mobile view".to_string(),
                checks: welcome_layout_checks(),
            },
        ),
        on(
            1,
            ScenarioStep::Open {
                dismiss_disclaimer: false,
            },
        ),
        on(1, checkpoint("pc verification")),
    ];

    Scenario {
        name: "mobile-layout".to_string(),
        description: "Mobile device emulation next to a plain desktop page".to_string(),
        tags: vec!["layout".to_string(), "mobile".to_string()],
        profiles: vec![
            ProfileSpec::Preset("mobile".to_string()),
            ProfileSpec::Preset("desktop".to_string()),
        ],
        guarded_endpoints: None,
        steps,
    }
}
