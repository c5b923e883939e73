//! System prompts bundled at compile time, plus a small builder for the
//! per-call user prompt.

use crate::ai::offline::REQUEST_PREFIX;
use crate::models::Member;
use serde::Serialize;

/// Planner - turns a request into tasks
pub const PLANNER: &str = include_str!("prompts/planner.md");

/// Architect - binding technology decisions for complex plans
pub const ARCHITECT: &str = include_str!("prompts/architect.md");

/// Critic - plan review
pub const CRITIC: &str = include_str!("prompts/critic.md");

/// Coder - writes complete files
pub const CODER: &str = include_str!("prompts/coder.md");

pub const CODE_REVIEWER: &str = include_str!("prompts/code_reviewer.md");

/// Reviewer - request / plan / execution traceability
pub const REVIEWER: &str = include_str!("prompts/reviewer.md");

pub const QA_TESTER: &str = include_str!("prompts/qa_tester.md");

pub const FINAL_APPROVER: &str = include_str!("prompts/final_approver.md");

/// System prompt for a member. Tester and dependency manager drive the
/// toolchain and never reach a model.
pub fn system(member: Member) -> Option<&'static str> {
    match member {
        Member::Planner => Some(PLANNER),
        Member::Architect => Some(ARCHITECT),
        Member::Critic => Some(CRITIC),
        Member::Coder => Some(CODER),
        Member::CodeReviewer => Some(CODE_REVIEWER),
        Member::Reviewer => Some(REVIEWER),
        Member::QaTester => Some(QA_TESTER),
        Member::FinalApprover => Some(FINAL_APPROVER),
        Member::Tester | Member::DependencyManager => None,
    }
}

/// Accumulates titled sections into one user prompt.
#[derive(Debug, Default)]
pub struct PromptBuilder {
    out: String,
}

impl PromptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// The request line every prompt starts with.
    pub fn request(mut self, request: &str) -> Self {
        self.out.push_str(REQUEST_PREFIX);
        self.out.push_str(request.trim());
        self.out.push_str("\n\n");
        self
    }

    pub fn section(mut self, title: &str, body: impl AsRef<str>) -> Self {
        let body = body.as_ref().trim();
        if !body.is_empty() {
            self.out.push_str(&format!("## {title}\n{body}\n\n"));
        }
        self
    }

    /// A section holding pretty JSON. Skipped if the value does not serialize.
    pub fn json(self, title: &str, value: &impl Serialize) -> Self {
        match serde_json::to_string_pretty(value) {
            Ok(body) => self.section(title, format!("```json\n{body}\n```")),
            Err(_) => self,
        }
    }

    pub fn list<I, S>(self, title: &str, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let body = items
            .into_iter()
            .map(|item| format!("- {}", item.as_ref()))
            .collect::<Vec<_>>()
            .join("\n");
        self.section(title, body)
    }

    pub fn build(self) -> String {
        self.out.trim_end().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ai_members_have_prompts() {
        for member in [
            Member::Planner,
            Member::Architect,
            Member::Critic,
            Member::Coder,
            Member::CodeReviewer,
            Member::Reviewer,
            Member::QaTester,
            Member::FinalApprover,
        ] {
            let prompt = system(member).unwrap();
            assert!(prompt.len() > 50, "prompt for {member} seems too short");
            assert!(prompt.contains("JSON"), "prompt for {member} must ask for JSON");
        }
        assert!(system(Member::Tester).is_none());
    }

    #[test]
    fn test_builder_skips_empty_sections() {
        let prompt = PromptBuilder::new()
            .request("Add a login page")
            .section("Empty", "  ")
            .list("Files", ["src/a.ts", "src/b.ts"])
            .json("Plan", &json!({"tasks": []}))
            .build();

        assert!(prompt.starts_with("User request: Add a login page"));
        assert!(!prompt.contains("## Empty"));
        assert!(prompt.contains("## Files\n- src/a.ts\n- src/b.ts"));
        assert!(prompt.contains("```json"));
    }
}
