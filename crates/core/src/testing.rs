//! Fixtures shared by squad and orchestrator tests.

use crate::ai::{AiClient, ScriptedBackend};
use crate::context::{ProjectContext, ProjectType};
use crate::error::ToolError;
use crate::tooling::{Diagnostic, DiagnosticLevel, TestSummary, Toolchain};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn client(backend: ScriptedBackend) -> (AiClient, Arc<ScriptedBackend>) {
    let backend = Arc::new(backend);
    (AiClient::new(backend.clone()), backend)
}

pub fn node_context(root: &Path) -> ProjectContext {
    ProjectContext {
        project_root: root.to_path_buf(),
        project_type: ProjectType::React,
        existing_files: vec!["package.json".into()],
        tech_stack: vec!["react".into()],
    }
}

/// A valid plan with `n` chained tasks.
pub fn planner_reply(n: usize) -> Value {
    let tasks: Vec<Value> = (1..=n)
        .map(|i| {
            let deps: Vec<String> = if i > 1 { vec![format!("t{}", i - 1)] } else { vec![] };
            json!({
                "id": format!("t{i}"),
                "title": format!("Task {i}"),
                "description": "Build part of the feature",
                "assignee": "frontend",
                "targetFiles": [format!("src/part{i}.ts")],
                "dependencies": deps,
                "estimatedTime": "30m"
            })
        })
        .collect();
    json!({
        "requirements": {"functional": ["Add the feature"], "nonFunctional": []},
        "tasks": tasks,
        "decisions": [],
        "validation_criteria": [{"scenario": "Open the page", "expected": "Feature visible", "type": "functional"}]
    })
}

pub fn coder_reply(files: &[&str], deps: &[&str]) -> Value {
    let files: Vec<Value> = files
        .iter()
        .map(|path| json!({"path": path, "action": "create", "content": format!("// {path}\n")}))
        .collect();
    json!({
        "files": files,
        "imports": {"added": [], "removed": []},
        "dependencies": {"added": deps, "removed": []}
    })
}

pub fn critic_pass() -> Value {
    json!({"status": "pass", "overallOpinion": "Solid plan", "issues": []})
}

pub fn critic_critical() -> Value {
    json!({
        "status": "reject",
        "overallOpinion": "Authentication is missing",
        "issues": [{
            "category": "completeness",
            "severity": "critical",
            "description": "No task covers authentication",
            "suggestion": "Add an auth task",
            "targetTask": "t1"
        }]
    })
}

pub fn code_review_pass() -> Value {
    json!({"status": "pass", "overallOpinion": "Clean", "issues": [], "checklist": {"typeSafety": true}})
}

pub fn reviewer_pass() -> Value {
    json!({"status": "pass", "overallOpinion": "Matches the request", "mismatches": []})
}

pub fn reviewer_reject(source: &str) -> Value {
    json!({
        "status": "reject",
        "overallOpinion": "The feature is incomplete",
        "mismatches": [{
            "category": "missing_feature",
            "severity": "critical",
            "description": "The export button is missing",
            "source": source,
            "suggestion": "Add the export button"
        }]
    })
}

pub fn qa_passed() -> Value {
    json!({"status": "passed", "scenarios": [{"name": "Open the page", "status": "passed"}]})
}

pub fn approver_approved() -> Value {
    json!({"status": "approved", "overallOpinion": "Ship it", "issues": []})
}

pub fn error(file: &str, message: &str) -> Diagnostic {
    Diagnostic {
        file: file.to_string(),
        line: 1,
        column: 1,
        message: message.to_string(),
        code: None,
        level: DiagnosticLevel::Error,
        fixable: false,
    }
}

pub fn summary(passed: u32, failed: u32) -> TestSummary {
    TestSummary {
        passed,
        failed,
        skipped: 0,
        total: passed + failed,
        results: Vec::new(),
    }
}

/// Toolchain with canned results. Type-check and test results are queues
/// whose last entry repeats.
#[derive(Default)]
pub struct ScriptedToolchain {
    type_errors: Vec<Vec<Diagnostic>>,
    lint: Vec<Diagnostic>,
    tests: Vec<TestSummary>,
    type_checks: AtomicUsize,
    test_runs: AtomicUsize,
    installs: Mutex<Vec<Vec<String>>>,
}

impl ScriptedToolchain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn type_check_result(mut self, errors: Vec<Diagnostic>) -> Self {
        self.type_errors.push(errors);
        self
    }

    pub fn lint_result(mut self, findings: Vec<Diagnostic>) -> Self {
        self.lint = findings;
        self
    }

    pub fn test_result(mut self, summary: TestSummary) -> Self {
        self.tests.push(summary);
        self
    }

    pub fn test_runs(&self) -> usize {
        self.test_runs.load(Ordering::SeqCst)
    }

    pub fn installs(&self) -> Vec<Vec<String>> {
        self.installs.lock().map(|i| i.clone()).unwrap_or_default()
    }
}

fn nth<T: Clone + Default>(queue: &[T], counter: &AtomicUsize) -> T {
    let i = counter.fetch_add(1, Ordering::SeqCst);
    queue.get(i).or_else(|| queue.last()).cloned().unwrap_or_default()
}

#[async_trait]
impl Toolchain for ScriptedToolchain {
    async fn type_check(&self, _ctx: &ProjectContext, _timeout: Duration) -> Result<Vec<Diagnostic>, ToolError> {
        Ok(nth(&self.type_errors, &self.type_checks))
    }

    async fn lint(&self, _ctx: &ProjectContext, _timeout: Duration) -> Result<Vec<Diagnostic>, ToolError> {
        Ok(self.lint.clone())
    }

    async fn run_tests(&self, _ctx: &ProjectContext, _timeout: Duration) -> Result<TestSummary, ToolError> {
        Ok(nth(&self.tests, &self.test_runs))
    }

    async fn install(
        &self,
        _ctx: &ProjectContext,
        packages: &[String],
        _timeout: Duration,
    ) -> Result<(), ToolError> {
        if let Ok(mut installs) = self.installs.lock() {
            installs.push(packages.to_vec());
        }
        Ok(())
    }
}
