//! Persisted application state and its round-trip verification
//!
//! The app keeps its progress in local storage under the `historia_` prefix:
//! a JSON blob with the form data, the id of the active screen, and the raw
//! interview transcript. Snapshots are compared as JSON values, so a field
//! persisted as `"45"` never equals one persisted as `45`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{E2eError, E2eResult};
use crate::page::PageHandle;
use crate::recorder::Assertion;
use crate::screen::{Field, ScreenId};

pub const STORAGE_PREFIX: &str = "historia_";
pub const APP_STATE_KEY: &str = "historia_appState";
pub const CURRENT_SCREEN_KEY: &str = "historia_currentScreen";
pub const CHAT_HISTORY_KEY: &str = "historia_chatHistory";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preliminary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sex: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChiefComplaint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symptom: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PastHistory {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub surgeries: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub medications: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocialHistory {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tobacco: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alcohol: Option<String>,
}

/// Typed view of `historia_appState`, used to build seeds
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppState {
    #[serde(default)]
    pub preliminary: Preliminary,
    #[serde(default, rename = "cc")]
    pub chief_complaint: ChiefComplaint,
    #[serde(default)]
    pub hpi_conversation: Vec<ChatTurn>,
    #[serde(default)]
    pub history: PastHistory,
    #[serde(default)]
    pub social: SocialHistory,
    #[serde(default)]
    pub lab_reports: String,
    #[serde(default)]
    pub editing_target: Option<String>,
}

impl AppState {
    /// Patient used by the bundled scenarios
    pub fn sample_patient() -> Self {
        Self {
            preliminary: Preliminary {
                name: Some("John Doe".to_string()),
                age: Some("45".to_string()),
                sex: Some("Male".to_string()),
            },
            chief_complaint: ChiefComplaint {
                symptom: Some("Headache".to_string()),
                duration: Some("2 days".to_string()),
            },
            social: SocialHistory {
                tobacco: Some("Never".to_string()),
                alcohol: Some("Never".to_string()),
            },
            ..Default::default()
        }
    }
}

/// A snapshot of everything the app persists
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageState {
    pub app_state: Value,
    pub current_screen: ScreenId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_history: Option<Value>,
}

impl StorageState {
    pub fn new(app_state: &AppState, current_screen: ScreenId) -> E2eResult<Self> {
        Ok(Self {
            app_state: serde_json::to_value(app_state)?,
            current_screen,
            chat_history: None,
        })
    }

    pub fn typed_app_state(&self) -> E2eResult<AppState> {
        Ok(serde_json::from_value(self.app_state.clone())?)
    }

    /// String value persisted for `field`, if any
    pub fn field(&self, field: Field) -> Option<&Value> {
        self.app_state.pointer(field.pointer())
    }

    /// Key/value pairs exactly as the app stores them
    pub fn to_entries(&self) -> E2eResult<Vec<(String, String)>> {
        if !self.app_state.is_object() {
            return Err(E2eError::Snapshot("appState must be a JSON object".to_string()));
        }

        let mut entries = vec![
            (APP_STATE_KEY.to_string(), serde_json::to_string(&self.app_state)?),
            (CURRENT_SCREEN_KEY.to_string(), self.current_screen.as_str().to_string()),
        ];
        if let Some(chat) = &self.chat_history {
            entries.push((CHAT_HISTORY_KEY.to_string(), serde_json::to_string(chat)?));
        }
        Ok(entries)
    }
}

/// Write `state` into the page's storage before its first navigation.
pub async fn seed(page: &dyn PageHandle, state: &StorageState) -> E2eResult<()> {
    let entries = state.to_entries()?;
    info!("Seeding storage with screen {}", state.current_screen);
    page.seed_local_storage(&entries).await
}

/// Read the persisted snapshot, or `None` when the app has nothing stored.
pub async fn capture(page: &dyn PageHandle) -> E2eResult<Option<StorageState>> {
    let Some(raw_state) = page.local_storage_get(APP_STATE_KEY).await? else {
        debug!("No {} in storage", APP_STATE_KEY);
        return Ok(None);
    };

    let app_state: Value = serde_json::from_str(&raw_state)
        .map_err(|e| E2eError::Snapshot(format!("{} is not valid JSON: {}", APP_STATE_KEY, e)))?;

    let current_screen = match page.local_storage_get(CURRENT_SCREEN_KEY).await? {
        Some(id) => id.parse()?,
        None => {
            return Err(E2eError::Snapshot(format!(
                "{} present without {}",
                APP_STATE_KEY, CURRENT_SCREEN_KEY
            )))
        }
    };

    let chat_history = match page.local_storage_get(CHAT_HISTORY_KEY).await? {
        Some(raw) => Some(serde_json::from_str(&raw)?),
        None => None,
    };

    Ok(Some(StorageState {
        app_state,
        current_screen,
        chat_history,
    }))
}

/// Differences between a written snapshot and the one read back
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundTripReport {
    pub differences: Vec<String>,
}

impl RoundTripReport {
    pub fn is_identical(&self) -> bool {
        self.differences.is_empty()
    }

    pub fn into_result(self) -> E2eResult<()> {
        if self.is_identical() {
            Ok(())
        } else {
            Err(E2eError::AssertionFailed(format!(
                "storage round-trip differs: {}",
                self.differences.join("; ")
            )))
        }
    }

    pub fn to_assertion(&self, description: &str) -> Assertion {
        Assertion::check(
            description,
            self.is_identical(),
            (!self.is_identical()).then(|| self.differences.join("; ")),
        )
    }
}

/// Structural equality on appState, identity on the screen marker.
pub fn assert_round_trip(written: &StorageState, read: &StorageState) -> RoundTripReport {
    let mut differences = Vec::new();

    if written.current_screen != read.current_screen {
        differences.push(format!(
            "currentScreen: wrote {} but read {}",
            written.current_screen, read.current_screen
        ));
    }
    diff_values("appState", &written.app_state, &read.app_state, &mut differences);

    RoundTripReport { differences }
}

fn diff_values(path: &str, written: &Value, read: &Value, out: &mut Vec<String>) {
    match (written, read) {
        (Value::Object(a), Value::Object(b)) => {
            for (key, va) in a {
                let child = format!("{}.{}", path, key);
                match b.get(key) {
                    Some(vb) => diff_values(&child, va, vb, out),
                    None => out.push(format!("{}: missing after reload", child)),
                }
            }
            for key in b.keys().filter(|k| !a.contains_key(*k)) {
                out.push(format!("{}.{}: appeared after reload", path, key));
            }
        }
        (Value::Array(a), Value::Array(b)) => {
            if a.len() != b.len() {
                out.push(format!("{}: length {} became {}", path, a.len(), b.len()));
            }
            for (i, (va, vb)) in a.iter().zip(b.iter()).enumerate() {
                diff_values(&format!("{}[{}]", path, i), va, vb, out);
            }
        }
        (a, b) if a != b => out.push(format!("{}: wrote {} but read {}", path, a, b)),
        _ => {}
    }
}

/// After "start new", every field populated in `previous` must read back as
/// its default, both in the form and in whatever is persisted.
pub async fn assert_cleared(page: &dyn PageHandle, previous: &StorageState) -> E2eResult<Vec<Assertion>> {
    let persisted = capture(page).await?;
    let mut assertions = Vec::new();

    for field in Field::ALL {
        let was_populated = previous
            .field(field)
            .and_then(Value::as_str)
            .map(|v| !v.is_empty() && v != field.default_value())
            .unwrap_or(false);
        if !was_populated {
            continue;
        }

        let shown = page.input_value(field.selector()).await?;
        assertions.push(Assertion::check(
            format!("{} input reset to '{}'", field, field.default_value()),
            shown == field.default_value(),
            Some(format!("input shows '{}'", shown)),
        ));

        if let Some(state) = &persisted {
            let stored = state.field(field).and_then(Value::as_str).unwrap_or("");
            assertions.push(Assertion::check(
                format!("{} cleared from storage", field),
                stored.is_empty() || stored == field.default_value(),
                Some(format!("storage holds '{}'", stored)),
            ));
        }
    }

    if assertions.is_empty() {
        assertions.push(Assertion::fail(
            "storage cleared",
            "the reference snapshot has no populated fields to check",
        ));
    }

    Ok(assertions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_app_state_uses_app_keys() {
        let value = serde_json::to_value(AppState::sample_patient()).unwrap();
        assert_eq!(value["cc"]["symptom"], "Headache");
        assert_eq!(value["preliminary"]["age"], "45");
        assert!(value["hpiConversation"].is_array());
        assert_eq!(value["labReports"], "");
        assert!(value["editingTarget"].is_null());
    }

    #[test]
    fn test_entries_carry_screen_marker() {
        let state = StorageState::new(&AppState::sample_patient(), ScreenId::Review).unwrap();
        let entries = state.to_entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1], (CURRENT_SCREEN_KEY.to_string(), "review-screen".to_string()));

        let decoded: Value = serde_json::from_str(&entries[0].1).unwrap();
        assert_eq!(decoded, state.app_state);
    }

    #[test]
    fn test_identical_snapshots_round_trip() {
        let state = StorageState::new(&AppState::sample_patient(), ScreenId::ChiefComplaint).unwrap();
        assert!(assert_round_trip(&state, &state.clone()).is_identical());
    }

    #[test]
    fn test_numeric_representation_is_not_coerced() {
        let written = StorageState::new(&AppState::sample_patient(), ScreenId::ChiefComplaint).unwrap();
        let mut read = written.clone();
        read.app_state["preliminary"]["age"] = json!(45);

        let report = assert_round_trip(&written, &read);
        assert_eq!(report.differences.len(), 1);
        assert!(report.differences[0].contains("appState.preliminary.age"));
        assert!(report.into_result().is_err());
    }

    #[test]
    fn test_screen_and_structure_differences_are_listed() {
        let written = StorageState::new(&AppState::sample_patient(), ScreenId::Review).unwrap();
        let mut read = written.clone();
        read.current_screen = ScreenId::Welcome;
        read.app_state["hpiConversation"] = json!([{ "role": "user", "content": "hi" }]);
        read.app_state.as_object_mut().unwrap().remove("labReports");

        let report = assert_round_trip(&written, &read);
        assert_eq!(report.differences.len(), 3);
    }

    #[test]
    fn test_typed_view_survives_unknown_shape() {
        let state = StorageState {
            app_state: json!({ "preliminary": {}, "cc": {}, "history": {}, "social": {} }),
            current_screen: ScreenId::Welcome,
            chat_history: None,
        };
        let typed = state.typed_app_state().unwrap();
        assert_eq!(typed, AppState::default());
        assert!(state.field(Field::Name).is_none());
    }
}
