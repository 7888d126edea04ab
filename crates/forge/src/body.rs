// Issue body rendering
//
// The tracking issue's body has four sections in fixed order: Original
// Request, Requirements, Implementation Plan, and a status footer. Sections
// without content are omitted (except the original request and the footer).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Structured content of a tracking issue's body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueBody {
    /// The user's verbatim request
    pub original_request: String,

    /// Requirements gathered from answered questions, in insertion order
    pub requirements: Vec<(String, String)>,

    /// The approved or proposed implementation plan
    pub plan: Option<String>,

    /// Task this issue tracks
    pub task_id: Uuid,

    /// Current task status, as shown in the footer
    pub status: String,
}

impl IssueBody {
    /// Body with only the original request filled in
    pub fn new(original_request: impl Into<String>, task_id: Uuid, status: impl Into<String>) -> Self {
        Self {
            original_request: original_request.into(),
            requirements: vec![],
            plan: None,
            task_id,
            status: status.into(),
        }
    }

    /// Add or replace a requirement
    pub fn set_requirement(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if let Some(entry) = self.requirements.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
        } else {
            self.requirements.push((key, value));
        }
    }

    /// Render the body as markdown
    pub fn render(&self) -> String {
        let mut sections = Vec::new();

        let quoted = self
            .original_request
            .lines()
            .map(|line| format!("> {line}"))
            .collect::<Vec<_>>()
            .join("\n");
        sections.push(format!("## Original Request\n{quoted}"));

        if !self.requirements.is_empty() {
            let items = self
                .requirements
                .iter()
                .map(|(k, v)| format!("- {k}: {v}"))
                .collect::<Vec<_>>()
                .join("\n");
            sections.push(format!("## Requirements\n{items}"));
        }

        if let Some(plan) = &self.plan {
            sections.push(format!("## Implementation Plan\n{plan}"));
        }

        sections.push(format!(
            "---\n_Task ID: `{}`_ | _Status: {}_",
            self.task_id, self.status
        ));

        sections.join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_body() {
        let body = IssueBody::new("Add dark mode toggle", Uuid::nil(), "planning");
        let rendered = body.render();

        assert!(rendered.starts_with("## Original Request\n> Add dark mode toggle"));
        assert!(rendered.contains("_Status: planning_"));
        // Empty sections are omitted
        assert!(!rendered.contains("## Requirements"));
        assert!(!rendered.contains("## Implementation Plan"));
    }

    #[test]
    fn test_full_body_section_order() {
        let mut body = IssueBody::new("Add dark mode toggle", Uuid::nil(), "waiting_plan_review");
        body.set_requirement("default", "system preference");
        body.plan = Some("1. Add a toggle component".to_string());

        let rendered = body.render();
        let request_pos = rendered.find("## Original Request").unwrap();
        let requirements_pos = rendered.find("## Requirements").unwrap();
        let plan_pos = rendered.find("## Implementation Plan").unwrap();
        let footer_pos = rendered.find("_Task ID:").unwrap();

        assert!(request_pos < requirements_pos);
        assert!(requirements_pos < plan_pos);
        assert!(plan_pos < footer_pos);
        assert!(rendered.contains("- default: system preference"));
    }

    #[test]
    fn test_set_requirement_replaces() {
        let mut body = IssueBody::new("req", Uuid::nil(), "planning");
        body.set_requirement("default", "light");
        body.set_requirement("default", "dark");
        assert_eq!(body.requirements.len(), 1);
        assert_eq!(body.requirements[0].1, "dark");
    }

    #[test]
    fn test_multiline_request_is_quoted() {
        let body = IssueBody::new("line one\nline two", Uuid::nil(), "planning");
        let rendered = body.render();
        assert!(rendered.contains("> line one\n> line two"));
    }
}
