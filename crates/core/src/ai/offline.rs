//! Deterministic canned replies for dry runs and demos.

use super::{AiBackend, AiRequest};
use crate::error::AiError;
use crate::models::Member;
use async_trait::async_trait;
use serde_json::{json, Value};

/// Prompts carry the request on a line with this prefix.
pub const REQUEST_PREFIX: &str = "User request: ";

#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineBackend;

#[async_trait]
impl AiBackend for OfflineBackend {
    fn name(&self) -> &'static str {
        "offline"
    }

    async fn complete(&self, request: &AiRequest) -> Result<String, AiError> {
        Ok(canned_reply(request.member, &request.prompt).to_string())
    }
}

fn request_line(prompt: &str) -> &str {
    prompt
        .lines()
        .find_map(|line| line.strip_prefix(REQUEST_PREFIX))
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .unwrap_or("the requested feature")
}

fn canned_reply(member: Member, prompt: &str) -> Value {
    let request = request_line(prompt);
    match member {
        Member::Planner => json!({
            "requirements": {
                "functional": [request],
                "nonFunctional": ["Keep the change small and reviewable"]
            },
            "tasks": [
                {
                    "id": "task-1",
                    "title": "Define data types",
                    "description": format!("Types backing: {request}"),
                    "assignee": "frontend",
                    "targetFiles": ["src/types/feature.ts"],
                    "dependencies": [],
                    "estimatedTime": "15m"
                },
                {
                    "id": "task-2",
                    "title": "Implement component",
                    "description": format!("Component implementing: {request}"),
                    "assignee": "frontend",
                    "targetFiles": ["src/components/Feature.tsx"],
                    "dependencies": ["task-1"],
                    "estimatedTime": "30m"
                },
                {
                    "id": "task-3",
                    "title": "Add tests",
                    "description": "Cover the component behaviour",
                    "assignee": "frontend",
                    "targetFiles": ["src/components/Feature.test.tsx"],
                    "dependencies": ["task-2"],
                    "estimatedTime": "20m"
                }
            ],
            "decisions": [{
                "category": "pattern",
                "choice": "Function component with hooks",
                "reason": "Matches the existing code",
                "alternatives": ["Class component"]
            }],
            "validation_criteria": [{
                "scenario": "Render the feature",
                "expected": "The component renders without errors",
                "type": "functional"
            }]
        }),
        Member::Architect => json!({
            "frontend": {"framework": "React", "libraries": [], "reason": "Existing stack"},
            "backend": {"framework": "Express", "libraries": [], "reason": "Existing stack"},
            "database": {"type": "SQLite", "orm": null, "reason": "Local persistence"},
            "thirdParty": [],
            "decisions": [],
            "risks": []
        }),
        Member::Critic => json!({
            "status": "pass",
            "overallOpinion": "Plan is complete and well scoped",
            "issues": [],
            "strengths": ["Small tasks with explicit dependencies"],
            "suggestions": []
        }),
        Member::Coder => json!({
            "files": [{
                "path": "src/components/Feature.tsx",
                "action": "create",
                "content": format!(
                    "// {request}\nexport function Feature() {{\n  return <div>Feature</div>;\n}}\n"
                ),
                "dependencies": []
            }],
            "imports": {"added": [], "removed": []},
            "dependencies": {"added": [], "removed": []}
        }),
        Member::CodeReviewer => json!({
            "status": "pass",
            "overallOpinion": "Looks good",
            "issues": [],
            "checklist": {
                "typeSafety": true,
                "codeStyle": true,
                "bestPractices": true,
                "errorHandling": true,
                "securityCheck": true
            }
        }),
        Member::Reviewer => json!({
            "status": "pass",
            "overallOpinion": "Implementation matches the request and plan",
            "mismatches": [],
            "strengths": ["Scope matches the request"]
        }),
        Member::QaTester => json!({
            "status": "passed",
            "scenarios": [{
                "name": "Render the feature",
                "description": "The component renders",
                "steps": ["Mount the component"],
                "status": "passed"
            }],
            "logs": []
        }),
        Member::FinalApprover => json!({
            "status": "approved",
            "overallOpinion": "Ready for delivery",
            "issues": [],
            "nextAction": "deliver"
        }),
        Member::Tester | Member::DependencyManager => json!({"status": "passed"}),
    }
}
