//! # Project Context
//!
//! A snapshot of the target project handed to every squad: its type, a
//! capped list of existing files and the declared tech stack.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const MAX_EXISTING_FILES: usize = 100;
pub const MAX_TECH_STACK: usize = 20;

const SKIPPED_DIRS: &[&str] = &["node_modules", ".git", "target"];
const FRONTEND_MARKERS: &[&str] = &["react", "vue", "svelte", "next"];
const BACKEND_MARKERS: &[&str] = &[
    "express", "fastapi", "django", "flask", "axum", "actix-web", "rocket", "warp",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectType {
    NextJs,
    React,
    Vue,
    Svelte,
    Node,
    Python,
    Django,
    Rust,
    #[default]
    Unknown,
}

impl ProjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectType::NextJs => "nextjs",
            ProjectType::React => "react",
            ProjectType::Vue => "vue",
            ProjectType::Svelte => "svelte",
            ProjectType::Node => "node",
            ProjectType::Python => "python",
            ProjectType::Django => "django",
            ProjectType::Rust => "rust",
            ProjectType::Unknown => "unknown",
        }
    }

    /// Stacks whose output `tsc --noEmit` can check.
    pub fn is_typescript_frontend(&self) -> bool {
        matches!(self, ProjectType::NextJs | ProjectType::React)
    }

    pub fn is_node(&self) -> bool {
        matches!(
            self,
            ProjectType::NextJs
                | ProjectType::React
                | ProjectType::Vue
                | ProjectType::Svelte
                | ProjectType::Node
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectContext {
    pub project_root: PathBuf,
    pub project_type: ProjectType,
    /// Relative paths, at most [`MAX_EXISTING_FILES`]
    pub existing_files: Vec<String>,
    /// Declared packages, at most [`MAX_TECH_STACK`]
    pub tech_stack: Vec<String>,
}

impl ProjectContext {
    /// Context with nothing known beyond the root.
    pub fn empty(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            ..Default::default()
        }
    }

    /// Scan `root`. Fails only when the root itself cannot be read.
    pub async fn gather(root: &Path) -> Result<Self> {
        let root = root.to_path_buf();
        tokio::task::spawn_blocking(move || Self::scan(&root))
            .await
            .context("context scan task panicked")?
    }

    fn scan(root: &Path) -> Result<Self> {
        std::fs::read_dir(root)
            .with_context(|| format!("cannot read project root {}", root.display()))?;

        let existing_files = list_files(root);
        let (tech_stack, is_rust) = match read_package_json(root) {
            Some(stack) => (stack, false),
            None => match read_cargo_toml(root) {
                Some(stack) => (stack, true),
                None => (read_requirements(root), false),
            },
        };
        let project_type = detect_project_type(&tech_stack, &existing_files, is_rust);

        Ok(Self {
            project_root: root.to_path_buf(),
            project_type,
            existing_files,
            tech_stack,
        })
    }

    pub fn has_frontend(&self) -> bool {
        self.tech_stack
            .iter()
            .any(|t| FRONTEND_MARKERS.contains(&t.as_str()))
    }

    pub fn has_backend(&self) -> bool {
        self.tech_stack
            .iter()
            .any(|t| BACKEND_MARKERS.contains(&t.as_str()))
    }

    pub fn summary(&self) -> String {
        format!(
            "Project type: {}\nTech stack: {}\nExisting files ({}):\n{}",
            self.project_type.as_str(),
            if self.tech_stack.is_empty() {
                "unknown".to_string()
            } else {
                self.tech_stack.join(", ")
            },
            self.existing_files.len(),
            self.existing_files.join("\n")
        )
    }
}

fn list_files(root: &Path) -> Vec<String> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            e.depth() == 0 || !(SKIPPED_DIRS.contains(&name.as_ref()) || name.starts_with('.'))
        })
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            e.path()
                .strip_prefix(root)
                .ok()
                .map(|p| p.to_string_lossy().replace('\\', "/"))
        })
        .take(MAX_EXISTING_FILES)
        .collect()
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct PackageJson {
    dependencies: serde_json::Map<String, serde_json::Value>,
    dev_dependencies: serde_json::Map<String, serde_json::Value>,
}

fn read_package_json(root: &Path) -> Option<Vec<String>> {
    let content = std::fs::read_to_string(root.join("package.json")).ok()?;
    let package: PackageJson = match serde_json::from_str(&content) {
        Ok(package) => package,
        Err(e) => {
            tracing::warn!(error = %e, "Ignoring malformed package.json");
            PackageJson::default()
        }
    };
    Some(
        package
            .dependencies
            .keys()
            .chain(package.dev_dependencies.keys())
            .take(MAX_TECH_STACK)
            .cloned()
            .collect(),
    )
}

fn read_cargo_toml(root: &Path) -> Option<Vec<String>> {
    let content = std::fs::read_to_string(root.join("Cargo.toml")).ok()?;
    let manifest: toml::Table = match content.parse() {
        Ok(manifest) => manifest,
        Err(e) => {
            tracing::warn!(error = %e, "Ignoring malformed Cargo.toml");
            return Some(Vec::new());
        }
    };
    let tables = ["dependencies", "dev-dependencies"];
    Some(
        tables
            .iter()
            .filter_map(|t| manifest.get(*t).and_then(toml::Value::as_table))
            .flat_map(|t| t.keys().cloned())
            .take(MAX_TECH_STACK)
            .collect(),
    )
}

fn read_requirements(root: &Path) -> Vec<String> {
    let Ok(content) = std::fs::read_to_string(root.join("requirements.txt")) else {
        return Vec::new();
    };
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with('-'))
        .filter_map(|line| {
            line.split(|c: char| "=<>~![; ".contains(c))
                .next()
                .map(|name| name.to_ascii_lowercase())
        })
        .filter(|name| !name.is_empty())
        .take(MAX_TECH_STACK)
        .collect()
}

pub fn detect_project_type(tech_stack: &[String], files: &[String], is_rust: bool) -> ProjectType {
    let has = |name: &str| tech_stack.iter().any(|t| t == name);
    if has("next") {
        ProjectType::NextJs
    } else if has("react") {
        ProjectType::React
    } else if has("vue") {
        ProjectType::Vue
    } else if has("svelte") {
        ProjectType::Svelte
    } else if has("express") {
        ProjectType::Node
    } else if has("django") {
        ProjectType::Django
    } else if has("fastapi") || files.iter().any(|f| f.ends_with(".py")) {
        ProjectType::Python
    } else if is_rust {
        ProjectType::Rust
    } else {
        ProjectType::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stack(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_detection_precedence() {
        assert_eq!(detect_project_type(&stack(&["react", "next"]), &[], false), ProjectType::NextJs);
        assert_eq!(detect_project_type(&stack(&["react"]), &[], false), ProjectType::React);
        assert_eq!(detect_project_type(&stack(&["express"]), &[], false), ProjectType::Node);
        assert_eq!(
            detect_project_type(&stack(&["django"]), &stack(&["manage.py"]), false),
            ProjectType::Django
        );
        assert_eq!(detect_project_type(&[], &stack(&["app.py"]), false), ProjectType::Python);
        assert_eq!(detect_project_type(&stack(&["tokio"]), &[], true), ProjectType::Rust);
        assert_eq!(detect_project_type(&[], &[], false), ProjectType::Unknown);
    }

    #[tokio::test]
    async fn test_gather_node_project() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"dependencies": {"react": "18", "express": "4"}, "devDependencies": {"typescript": "5"}}"#,
        )
        .unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/App.tsx"), "export {}").unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules/react")).unwrap();
        std::fs::write(dir.path().join("node_modules/react/index.js"), "").unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git/HEAD"), "").unwrap();

        let ctx = ProjectContext::gather(dir.path()).await.unwrap();

        assert_eq!(ctx.project_type, ProjectType::React);
        assert_eq!(ctx.existing_files, vec!["package.json", "src/App.tsx"]);
        assert!(ctx.has_frontend());
        assert!(ctx.has_backend());
        assert_eq!(ctx.tech_stack.len(), 3);
    }

    #[tokio::test]
    async fn test_gather_caps_file_list() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..(MAX_EXISTING_FILES + 20) {
            std::fs::write(dir.path().join(format!("f{i:03}.txt")), "").unwrap();
        }
        let ctx = ProjectContext::gather(dir.path()).await.unwrap();
        assert_eq!(ctx.existing_files.len(), MAX_EXISTING_FILES);
        assert_eq!(ctx.project_type, ProjectType::Unknown);
    }

    #[tokio::test]
    async fn test_gather_rust_project() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("Cargo.toml"),
            "[package]\nname = \"x\"\n\n[dependencies]\naxum = \"0.7\"\ntokio = \"1\"\n",
        )
        .unwrap();
        let ctx = ProjectContext::gather(dir.path()).await.unwrap();
        assert_eq!(ctx.project_type, ProjectType::Rust);
        assert!(ctx.has_backend());
        assert!(!ctx.has_frontend());
    }

    #[tokio::test]
    async fn test_missing_root_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ProjectContext::gather(&dir.path().join("missing")).await.is_err());
    }
}
