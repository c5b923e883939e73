//! # Toolchain
//!
//! Structured results from the project's own type checker, linter, test
//! runner and package manager. Squads receive diagnostics and counts, never
//! raw logs.
//!
//! A tool that is not installed yields no diagnostics. Every invocation has
//! a deadline and its process is killed when the deadline passes.

use crate::context::{ProjectContext, ProjectType};
use crate::error::ToolError;
use crate::squad::replies::{FileAction, GeneratedFile, TestStatus};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::LazyLock;
use std::time::Duration;
use tokio::process::Command;

/// A finding from a type checker or linter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub message: String,
    pub code: Option<String>,
    pub level: DiagnosticLevel,
    /// The tool can apply a fix by itself
    pub fixable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticLevel {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub name: String,
    pub passed: bool,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestSummary {
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub total: u32,
    pub results: Vec<TestCase>,
}

impl TestSummary {
    pub fn status(&self) -> TestStatus {
        match (self.passed, self.failed) {
            (_, 0) => TestStatus::Passed,
            (0, _) => TestStatus::Failed,
            _ => TestStatus::Partial,
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &TestCase> {
        self.results.iter().filter(|r| !r.passed)
    }
}

/// The project's build tools.
#[async_trait]
pub trait Toolchain: Send + Sync {
    async fn type_check(&self, ctx: &ProjectContext, timeout: Duration)
        -> Result<Vec<Diagnostic>, ToolError>;

    async fn lint(&self, ctx: &ProjectContext, timeout: Duration) -> Result<Vec<Diagnostic>, ToolError>;

    async fn run_tests(&self, ctx: &ProjectContext, timeout: Duration) -> Result<TestSummary, ToolError>;

    async fn install(
        &self,
        ctx: &ProjectContext,
        packages: &[String],
        timeout: Duration,
    ) -> Result<(), ToolError>;
}

/// Runs npm/npx for Node projects and cargo for Rust projects.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandToolchain;

#[async_trait]
impl Toolchain for CommandToolchain {
    async fn type_check(
        &self,
        ctx: &ProjectContext,
        timeout: Duration,
    ) -> Result<Vec<Diagnostic>, ToolError> {
        let root = &ctx.project_root;
        match ctx.project_type {
            t if t.is_typescript_frontend() => {
                match run_tool("npx", &["tsc", "--noEmit"], root, timeout).await {
                    Ok(output) => Ok(parse_tsc_output(&combined(&output))),
                    Err(e) => missing_is_empty(e),
                }
            }
            ProjectType::Rust => {
                match run_tool("cargo", &["check", "--message-format=json"], root, timeout).await {
                    Ok(output) => Ok(parse_cargo_output(&String::from_utf8_lossy(&output.stdout))
                        .into_iter()
                        .filter(|d| d.level == DiagnosticLevel::Error)
                        .collect()),
                    Err(e) => missing_is_empty(e),
                }
            }
            _ => Ok(Vec::new()),
        }
    }

    async fn lint(&self, ctx: &ProjectContext, timeout: Duration) -> Result<Vec<Diagnostic>, ToolError> {
        let root = &ctx.project_root;
        match ctx.project_type {
            t if t.is_node() => match run_tool("npx", &["eslint", ".", "--format", "json"], root, timeout).await {
                Ok(output) => Ok(parse_eslint_output(&String::from_utf8_lossy(&output.stdout))),
                Err(e) => missing_is_empty(e),
            },
            ProjectType::Rust => {
                match run_tool("cargo", &["clippy", "--message-format=json"], root, timeout).await {
                    Ok(output) => Ok(parse_cargo_output(&String::from_utf8_lossy(&output.stdout))
                        .into_iter()
                        .filter(|d| d.level == DiagnosticLevel::Warning)
                        .collect()),
                    Err(e) => missing_is_empty(e),
                }
            }
            _ => Ok(Vec::new()),
        }
    }

    async fn run_tests(&self, ctx: &ProjectContext, timeout: Duration) -> Result<TestSummary, ToolError> {
        let root = &ctx.project_root;
        match ctx.project_type {
            t if t.is_node() => {
                let output = run_tool("npm", &["test", "--silent"], root, timeout).await?;
                Ok(parse_jest_summary(&combined(&output), output.status.success()))
            }
            ProjectType::Rust => {
                let output = run_tool("cargo", &["test"], root, timeout).await?;
                Ok(parse_cargo_test_output(&combined(&output)))
            }
            _ => Ok(TestSummary::default()),
        }
    }

    async fn install(
        &self,
        ctx: &ProjectContext,
        packages: &[String],
        timeout: Duration,
    ) -> Result<(), ToolError> {
        if packages.is_empty() {
            return Ok(());
        }
        if let Some(bad) = packages.iter().find(|p| !is_valid_package(p)) {
            return Err(ToolError::Spawn {
                program: "install".to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("refusing package name `{bad}`"),
                ),
            });
        }

        let (program, verb) = match ctx.project_type {
            ProjectType::Rust => ("cargo", "add"),
            t if t.is_node() || t == ProjectType::Unknown => ("npm", "install"),
            _ => return Ok(()),
        };
        let mut args = vec![verb];
        args.extend(packages.iter().map(String::as_str));

        let output = run_tool(program, &args, &ctx.project_root, timeout).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(ToolError::Spawn {
                program: format!("{program} {verb}"),
                source: std::io::Error::other(
                    String::from_utf8_lossy(&output.stderr).trim().to_string(),
                ),
            })
        }
    }
}

fn missing_is_empty(e: ToolError) -> Result<Vec<Diagnostic>, ToolError> {
    match e {
        ToolError::Spawn { ref source, .. } if source.kind() == std::io::ErrorKind::NotFound => {
            Ok(Vec::new())
        }
        other => Err(other),
    }
}

fn combined(output: &Output) -> String {
    format!(
        "{}\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    )
}

async fn run_tool(program: &str, args: &[&str], cwd: &Path, timeout: Duration) -> Result<Output, ToolError> {
    tracing::debug!(program, ?args, cwd = %cwd.display(), "Running tool");
    let child = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .env("CI", "true")
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(timeout, child).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(source)) => Err(ToolError::Spawn {
            program: program.to_string(),
            source,
        }),
        Err(_) => Err(ToolError::Timeout {
            program: program.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

static PACKAGE_NAME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^@?[A-Za-z0-9][A-Za-z0-9._/@^~=<>-]*$").ok());

fn is_valid_package(name: &str) -> bool {
    PACKAGE_NAME.as_ref().is_some_and(|re| re.is_match(name))
}

static TSC_LINE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^(.+?)\((\d+),(\d+)\): error (TS\d+)?:? ?(.+)$").ok());

/// `file(line,col): error TS1234: message` lines from `tsc`.
pub fn parse_tsc_output(output: &str) -> Vec<Diagnostic> {
    let Some(re) = TSC_LINE.as_ref() else {
        return Vec::new();
    };
    output
        .lines()
        .filter_map(|line| re.captures(line.trim()))
        .map(|caps| Diagnostic {
            file: caps[1].to_string(),
            line: caps[2].parse().unwrap_or(0),
            column: caps[3].parse().unwrap_or(0),
            message: caps[5].to_string(),
            code: caps.get(4).map(|m| m.as_str().to_string()),
            level: DiagnosticLevel::Error,
            fixable: false,
        })
        .collect()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EslintFile {
    file_path: String,
    #[serde(default)]
    messages: Vec<EslintMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EslintMessage {
    #[serde(default)]
    rule_id: Option<String>,
    #[serde(default)]
    severity: u8,
    message: String,
    #[serde(default)]
    line: u32,
    #[serde(default)]
    column: u32,
    #[serde(default)]
    fix: Option<serde_json::Value>,
}

/// `eslint --format json` output. Anything unparseable means no findings.
pub fn parse_eslint_output(output: &str) -> Vec<Diagnostic> {
    let Ok(files) = serde_json::from_str::<Vec<EslintFile>>(output.trim()) else {
        return Vec::new();
    };
    files
        .into_iter()
        .flat_map(|file| {
            let path = file.file_path;
            file.messages.into_iter().map(move |m| Diagnostic {
                file: path.clone(),
                line: m.line,
                column: m.column,
                message: m.message,
                code: m.rule_id,
                level: if m.severity >= 2 {
                    DiagnosticLevel::Error
                } else {
                    DiagnosticLevel::Warning
                },
                fixable: m.fix.is_some(),
            })
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct CargoMessage {
    message: Option<CargoDiagnostic>,
}

#[derive(Debug, Deserialize)]
struct CargoDiagnostic {
    message: String,
    level: String,
    code: Option<CargoCode>,
    spans: Vec<CargoSpan>,
    #[serde(default)]
    children: Vec<CargoChild>,
}

#[derive(Debug, Deserialize)]
struct CargoCode {
    code: String,
}

#[derive(Debug, Deserialize)]
struct CargoSpan {
    file_name: String,
    line_start: u32,
    column_start: u32,
    #[serde(default)]
    suggested_replacement: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CargoChild {
    #[serde(default)]
    spans: Vec<CargoSpan>,
}

/// `cargo --message-format=json` diagnostics with a primary span.
pub fn parse_cargo_output(output: &str) -> Vec<Diagnostic> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str::<CargoMessage>(line).ok())
        .filter_map(|msg| msg.message)
        .filter_map(|message| {
            let level = match message.level.as_str() {
                "error" => DiagnosticLevel::Error,
                "warning" => DiagnosticLevel::Warning,
                _ => return None,
            };
            let span = message.spans.first()?;
            let fixable = message
                .children
                .iter()
                .flat_map(|c| c.spans.iter())
                .any(|s| s.suggested_replacement.is_some());
            Some(Diagnostic {
                file: span.file_name.clone(),
                line: span.line_start,
                column: span.column_start,
                message: message.message.clone(),
                code: message.code.as_ref().map(|c| c.code.clone()),
                level,
                fixable,
            })
        })
        .collect()
}

static JEST_COUNT: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(\d+) (passed|failed|skipped|todo|total)").ok());
static JEST_CASE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^\s*(✓|✕|√|×)\s+(.+?)(?:\s+\(\d+\s*ms\))?$").ok());

/// Jest/Vitest style `Tests: 1 failed, 4 passed, 5 total` summaries.
pub fn parse_jest_summary(output: &str, exit_ok: bool) -> TestSummary {
    let mut summary = TestSummary::default();

    if let Some(line) = output.lines().rev().find(|l| l.trim_start().starts_with("Tests:")) {
        if let Some(re) = JEST_COUNT.as_ref() {
            for caps in re.captures_iter(line) {
                let n: u32 = caps[1].parse().unwrap_or(0);
                match &caps[2] {
                    "passed" => summary.passed = n,
                    "failed" => summary.failed = n,
                    "skipped" | "todo" => summary.skipped += n,
                    _ => summary.total = n,
                }
            }
        }
    }

    if let Some(re) = JEST_CASE.as_ref() {
        summary.results = output
            .lines()
            .filter_map(|line| re.captures(line))
            .map(|caps| TestCase {
                name: caps[2].trim().to_string(),
                passed: matches!(&caps[1], "✓" | "√"),
                message: None,
            })
            .collect();
    }

    let counted = summary.passed + summary.failed + summary.skipped;
    if counted == 0 && !exit_ok {
        // The runner failed before reporting anything.
        summary.failed = 1;
        summary.results.push(TestCase {
            name: "test command".to_string(),
            passed: false,
            message: output.lines().rev().find(|l| !l.trim().is_empty()).map(str::to_string),
        });
    }
    summary.total = summary.total.max(summary.passed + summary.failed + summary.skipped);
    summary
}

static CARGO_RESULT: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"test result: \w+\. (\d+) passed; (\d+) failed; (\d+) ignored").ok()
});
static CARGO_CASE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^test (\S+) \.\.\. (ok|FAILED|ignored)").ok());

/// Sums every `test result:` line of `cargo test` output.
pub fn parse_cargo_test_output(output: &str) -> TestSummary {
    let mut summary = TestSummary::default();
    if let Some(re) = CARGO_RESULT.as_ref() {
        for caps in re.captures_iter(output) {
            summary.passed += caps[1].parse::<u32>().unwrap_or(0);
            summary.failed += caps[2].parse::<u32>().unwrap_or(0);
            summary.skipped += caps[3].parse::<u32>().unwrap_or(0);
        }
    }
    if let Some(re) = CARGO_CASE.as_ref() {
        summary.results = output
            .lines()
            .filter_map(|line| re.captures(line))
            .filter(|caps| &caps[2] != "ignored")
            .map(|caps| TestCase {
                name: caps[1].to_string(),
                passed: &caps[2] == "ok",
                message: None,
            })
            .collect();
    }
    summary.total = summary.passed + summary.failed + summary.skipped;
    summary
}

/// Resolve `relative` under `root`, refusing absolute paths and `..`.
pub fn sandboxed_path(root: &Path, relative: &str) -> Result<PathBuf, ToolError> {
    let path = Path::new(relative);
    let escapes = relative.trim().is_empty()
        || path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(ToolError::PathEscape(relative.to_string()));
    }
    Ok(root.join(path))
}

/// Apply one generated file under `root` and return where it landed.
pub async fn write_generated(root: &Path, file: &GeneratedFile) -> Result<PathBuf, ToolError> {
    let path = sandboxed_path(root, &file.path)?;
    match file.action {
        FileAction::Delete => match tokio::fs::remove_file(&path).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        },
        FileAction::Create | FileAction::Modify => {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, &file.content).await?;
        }
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tsc_output() {
        let output = "src/App.tsx(12,5): error TS2322: Type 'string' is not assignable to type 'number'.\n\
                      Found 1 error.";
        let diags = parse_tsc_output(output);
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].file, "src/App.tsx");
        assert_eq!(diags[0].line, 12);
        assert_eq!(diags[0].column, 5);
        assert_eq!(diags[0].code.as_deref(), Some("TS2322"));
        assert!(diags[0].message.starts_with("Type 'string'"));
    }

    #[test]
    fn test_parse_eslint_output() {
        let output = r#"[{"filePath": "/p/src/a.ts", "messages": [
            {"ruleId": "no-unused-vars", "severity": 2, "message": "x is unused", "line": 3, "column": 7},
            {"ruleId": "semi", "severity": 1, "message": "Missing semicolon", "line": 4, "column": 1, "fix": {"range": [1, 2], "text": ";"}}
        ]}]"#;
        let diags = parse_eslint_output(output);
        assert_eq!(diags.len(), 2);
        assert_eq!(diags[0].level, DiagnosticLevel::Error);
        assert!(!diags[0].fixable);
        assert_eq!(diags[1].level, DiagnosticLevel::Warning);
        assert!(diags[1].fixable);
        assert!(parse_eslint_output("Oops! Something went wrong!").is_empty());
    }

    #[test]
    fn test_parse_cargo_output() {
        let output = concat!(
            r#"{"reason":"compiler-message","message":{"message":"unused variable: `x`","level":"warning","code":{"code":"unused_variables"},"spans":[{"file_name":"src/lib.rs","line_start":3,"column_start":9}],"children":[{"spans":[{"file_name":"src/lib.rs","line_start":3,"column_start":9,"suggested_replacement":"_x"}]}]}}"#,
            "\n",
            r#"{"reason":"compiler-message","message":{"message":"mismatched types","level":"error","code":{"code":"E0308"},"spans":[{"file_name":"src/main.rs","line_start":10,"column_start":1}]}}"#,
            "\n",
            r#"{"reason":"build-finished","success":false}"#,
        );
        let diags = parse_cargo_output(output);
        assert_eq!(diags.len(), 2);
        assert!(diags[0].fixable);
        assert_eq!(diags[1].level, DiagnosticLevel::Error);
        assert_eq!(diags[1].code.as_deref(), Some("E0308"));
    }

    #[test]
    fn test_parse_jest_summary() {
        let output = "PASS src/a.test.ts\n  ✓ adds (3 ms)\n  ✕ subtracts (1 ms)\n\
                      Tests:       1 failed, 1 skipped, 1 passed, 3 total\n";
        let summary = parse_jest_summary(output, false);
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.status(), TestStatus::Partial);
        assert_eq!(summary.failures().count(), 1);
        assert_eq!(summary.results[0].name, "adds");
    }

    #[test]
    fn test_runner_crash_counts_as_failure() {
        let summary = parse_jest_summary("npm ERR! missing script: test", false);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.status(), TestStatus::Failed);

        let quiet = parse_jest_summary("", true);
        assert_eq!(quiet.total, 0);
        assert_eq!(quiet.status(), TestStatus::Passed);
    }

    #[test]
    fn test_parse_cargo_test_output() {
        let output = "running 2 tests\ntest a::works ... ok\ntest a::breaks ... FAILED\n\
                      test result: FAILED. 1 passed; 1 failed; 0 ignored; 0 measured; 0 filtered out\n\
                      running 1 test\ntest b::slow ... ignored\n\
                      test result: ok. 0 passed; 0 failed; 1 ignored; 0 measured; 0 filtered out\n";
        let summary = parse_cargo_test_output(output);
        assert_eq!((summary.passed, summary.failed, summary.skipped), (1, 1, 1));
        assert_eq!(summary.total, 3);
        assert_eq!(summary.results.len(), 2);
    }

    #[test]
    fn test_sandbox_rejects_escapes() {
        let root = Path::new("/project");
        assert_eq!(
            sandboxed_path(root, "src/a.ts").unwrap(),
            PathBuf::from("/project/src/a.ts")
        );
        assert!(sandboxed_path(root, "./src/a.ts").is_ok());
        assert!(matches!(
            sandboxed_path(root, "../outside.ts"),
            Err(ToolError::PathEscape(_))
        ));
        assert!(sandboxed_path(root, "src/../../x").is_err());
        assert!(sandboxed_path(root, "/etc/passwd").is_err());
        assert!(sandboxed_path(root, "").is_err());
    }

    #[tokio::test]
    async fn test_write_and_delete_generated_files() {
        let dir = tempfile::tempdir().unwrap();
        let file = GeneratedFile {
            path: "src/components/Button.tsx".into(),
            action: FileAction::Create,
            content: "export {}".into(),
            dependencies: vec![],
        };
        let path = write_generated(dir.path(), &file).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "export {}");

        let delete = GeneratedFile {
            action: FileAction::Delete,
            ..file.clone()
        };
        write_generated(dir.path(), &delete).await.unwrap();
        assert!(!path.exists());
        // Deleting twice is not an error.
        write_generated(dir.path(), &delete).await.unwrap();
    }

    #[test]
    fn test_package_names() {
        assert!(is_valid_package("zustand"));
        assert!(is_valid_package("@tanstack/react-query"));
        assert!(is_valid_package("serde@1.0"));
        assert!(!is_valid_package("--global"));
        assert!(!is_valid_package("x; rm -rf /"));
    }

    #[tokio::test]
    async fn test_unknown_projects_have_no_tools() {
        let ctx = ProjectContext::empty(std::env::temp_dir());
        let timeout = Duration::from_secs(1);
        assert!(CommandToolchain.type_check(&ctx, timeout).await.unwrap().is_empty());
        assert!(CommandToolchain.lint(&ctx, timeout).await.unwrap().is_empty());
        assert_eq!(CommandToolchain.run_tests(&ctx, timeout).await.unwrap().total, 0);
    }
}
