//! Historia AI E2E Harness
//!
//! This crate drives the Historia AI single-page app through a real browser
//! and checks that:
//! - The disclaimer gate, screen transitions and "start new" reset behave
//! - Intake data survives a reload through localStorage
//! - LLM proxy traffic is answered by scripted mocks and never leaks out
//! - Layout holds on desktop, tablet and mobile viewports
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Scenario Runner (Rust)                      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ScenarioRunner                                             │
//! │    ├── start_server() -> ServerHandle                       │
//! │    ├── Session::create(launcher, profiles, guarded)         │
//! │    │     └── SessionContext (profile, RouteRegistry, log)   │
//! │    ├── run_scenario(scenario) -> ScenarioReport             │
//! │    │     ├── ScreenDriver: goto / walk_to / fill / reload   │
//! │    │     ├── storage: seed / capture / round trip / cleared │
//! │    │     └── Recorder: checkpoint(name, assertions)         │
//! │    └── write_results(SuiteReport)                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Scenario (builtin or YAML)                                 │
//! │    ├── name, tags, profiles, guarded_endpoints              │
//! │    └── steps: [Step { context, action }]                    │
//! │          ├── open / reload / goto / walk_to / fill          │
//! │          ├── seed / capture_storage                         │
//! │          ├── install_mock / replace_mock / remove_mock      │
//! │          └── assert { check } / checkpoint { checks }       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Engine (trait) ── PlaywrightBridge ── node driver.js       │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod builtin;
pub mod content;
pub mod driver;
pub mod error;
pub mod mock;
pub mod page;
pub mod playwright;
pub mod profile;
pub mod recorder;
pub mod runner;
pub mod scenario;
pub mod screen;
pub mod server;
pub mod session;
pub mod storage;
pub mod timing;

pub use driver::ScreenDriver;
pub use error::{E2eError, E2eResult};
pub use mock::{Fulfillment, RouteRegistry};
pub use page::{ContextHandle, Engine, EngineLauncher, PageHandle};
pub use playwright::{PlaywrightConfig, PlaywrightLauncher};
pub use profile::Profile;
pub use recorder::{Assertion, Checkpoint, Recorder};
pub use runner::{RunnerConfig, ScenarioReport, ScenarioRunner, SuiteReport};
pub use scenario::{Check, Scenario, ScenarioStep, Step};
pub use screen::{Field, ScreenId};
pub use session::{Session, SessionContext};
pub use storage::StorageState;
pub use timing::Timings;
