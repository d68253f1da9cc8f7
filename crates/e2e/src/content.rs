//! LLM proxy content contract
//!
//! The app posts to `/api/groq-proxy` and reads `choices[0].message.content`.
//! Interview replies equal to the sentinel end the interview; summary replies
//! are split on two headings and the diagnoses are a numbered, bold list.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{E2eError, E2eResult};

/// Endpoint pattern of the LLM proxy call
pub const LLM_ENDPOINT: &str = "**/api/groq-proxy";

/// Reply that ends the interview
pub const HPI_COMPLETE: &str = "[HPI_COMPLETE]";

pub const HPI_HEADING: &str = "History of Presenting Illness:";
pub const DIAGNOSES_HEADING: &str = "Probable Diagnoses:";

/// Wrap `content` in the chat-completions envelope the app expects
pub fn envelope(content: &str) -> Value {
    json!({
        "choices": [
            { "message": { "content": content } }
        ]
    })
}

/// `choices[0].message.content`, if present
pub fn extract_content(body: &Value) -> Option<&str> {
    body.pointer("/choices/0/message/content")?.as_str()
}

/// The app trims the reply before comparing it to the sentinel.
pub fn is_hpi_complete(content: &str) -> bool {
    content.trim() == HPI_COMPLETE
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub rank: u32,
    pub name: String,
    pub justification: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryContent {
    pub hpi: String,
    pub diagnoses: Vec<Diagnosis>,
}

impl SummaryContent {
    pub fn new(hpi: impl Into<String>) -> Self {
        Self {
            hpi: hpi.into(),
            diagnoses: Vec::new(),
        }
    }

    pub fn diagnosis(mut self, name: impl Into<String>, justification: impl Into<String>) -> Self {
        let rank = self.diagnoses.len() as u32 + 1;
        self.diagnoses.push(Diagnosis {
            rank,
            name: name.into(),
            justification: justification.into(),
        });
        self
    }

    /// Render in the layout the summary prompt asks the model for
    pub fn render(&self) -> String {
        let mut out = format!("{}\n{}\n\n{}\n", HPI_HEADING, self.hpi, DIAGNOSES_HEADING);
        for d in &self.diagnoses {
            out.push_str(&format!("{}. **{}:** {}\n", d.rank, d.name, d.justification));
        }
        out
    }
}

/// Parse summary text the way the app splits it, and require at least one
/// numbered bold diagnosis so the summary screen has something to render.
pub fn parse_summary(text: &str) -> E2eResult<SummaryContent> {
    let sections = Regex::new(r"(?s)History of Presenting Illness:\s*(.*?)\s*Probable Diagnoses:\s*(.*)")?;
    let entry = Regex::new(r"(?m)^\s*(\d+)\.\s*\*\*([^*]+?):?\*\*:?\s*(.*)$")?;

    let caps = sections.captures(text).ok_or_else(|| {
        E2eError::SpecParse(format!(
            "summary content must contain '{}' followed by '{}'",
            HPI_HEADING, DIAGNOSES_HEADING
        ))
    })?;

    let diagnoses: Vec<Diagnosis> = entry
        .captures_iter(&caps[2])
        .filter_map(|c| {
            Some(Diagnosis {
                rank: c[1].parse().ok()?,
                name: c[2].trim().to_string(),
                justification: c[3].trim().to_string(),
            })
        })
        .collect();

    if diagnoses.is_empty() {
        return Err(E2eError::SpecParse(
            "summary content has no numbered, bold-marked diagnosis".to_string(),
        ));
    }

    Ok(SummaryContent {
        hpi: caps[1].trim().to_string(),
        diagnoses,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_round_trips_content() {
        let body = envelope(HPI_COMPLETE);
        assert_eq!(extract_content(&body), Some(HPI_COMPLETE));
        assert!(extract_content(&json!({ "choices": [] })).is_none());
    }

    #[test]
    fn test_sentinel_ignores_surrounding_whitespace() {
        assert!(is_hpi_complete("  [HPI_COMPLETE]\n"));
        assert!(!is_hpi_complete("Where is the pain? [Head|Chest]"));
    }

    #[test]
    fn test_parse_inline_summary() {
        let text = "History of Presenting Illness: Patient has headache.\n\nProbable Diagnoses:\n1. **Migraine:** Stress.";
        let summary = parse_summary(text).unwrap();
        assert_eq!(summary.hpi, "Patient has headache.");
        assert_eq!(summary.diagnoses.len(), 1);
        assert_eq!(summary.diagnoses[0].name, "Migraine");
        assert_eq!(summary.diagnoses[0].justification, "Stress.");
    }

    #[test]
    fn test_rendered_summary_parses_back() {
        let summary = SummaryContent::new("Two days of throbbing headache.")
            .diagnosis("Migraine", "Unilateral, throbbing.")
            .diagnosis("Tension headache", "Stress related.");
        let parsed = parse_summary(&summary.render()).unwrap();
        assert_eq!(parsed, summary);
    }

    #[test]
    fn test_summary_without_bold_entries_is_rejected() {
        let text = "History of Presenting Illness:\nx\n\nProbable Diagnoses:\nMigraine";
        assert!(parse_summary(text).is_err());
        assert!(parse_summary("Probable Diagnoses:\n1. **Migraine:** x").is_err());
    }
}
