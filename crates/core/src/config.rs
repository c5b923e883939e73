//! # Configuration
//!
//! `DevTeamConfig` is resolved in three layers: built-in defaults, the
//! optional `<workspace>/config.json`, then `DEV_TEAM_*` environment
//! variables. Values that fail to parse keep the previous layer's value and
//! numeric settings are clamped into range, so resolution never fails.

use crate::models::{LlmProvider, ModelConfig, ModelTier};
use crate::quality::QualityThresholds;
use crate::squad::mode::{Complexity, ReviewMode};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const MIN_TIMEOUT_MS: u64 = 1_000;

/// Which AI backend members are invoked through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Direct provider API calls through radkit
    #[default]
    Api,
    /// The Codex CLI, falling back to `Api` when unusable
    Codex,
    /// Canned replies, no network
    Offline,
}

impl ProviderKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "api" | "claude" => Some(ProviderKind::Api),
            "codex" => Some(ProviderKind::Codex),
            "offline" | "mock" => Some(ProviderKind::Offline),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Api => "api",
            ProviderKind::Codex => "codex",
            ProviderKind::Offline => "offline",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    #[default]
    Markdown,
    Json,
}

impl ReportFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "markdown" | "md" => Some(ReportFormat::Markdown),
            "json" => Some(ReportFormat::Json),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ReportFormat::Markdown => "md",
            ReportFormat::Json => "json",
        }
    }
}

/// Rework loop and scoring knobs shared by every squad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SquadSettings {
    pub max_rework_iterations: u32,
    pub enable_auto_escalation: bool,
    pub thresholds: QualityThresholds,
    /// Points deducted per rework iteration beyond the budget
    pub rework_penalty: u32,
}

impl Default for SquadSettings {
    fn default() -> Self {
        Self {
            max_rework_iterations: 3,
            enable_auto_escalation: true,
            thresholds: QualityThresholds::default(),
            rework_penalty: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PlanSquadConfig {
    #[serde(flatten)]
    pub squad: SquadSettings,
    pub default_mode: Complexity,
}

impl Default for PlanSquadConfig {
    fn default() -> Self {
        Self {
            squad: SquadSettings::default(),
            default_mode: Complexity::Medium,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExecutionSquadConfig {
    #[serde(flatten)]
    pub squad: SquadSettings,
    pub default_mode: Complexity,
    pub run_tests: bool,
    pub test_timeout_ms: u64,
    pub lint_timeout_ms: u64,
}

impl Default for ExecutionSquadConfig {
    fn default() -> Self {
        Self {
            squad: SquadSettings::default(),
            default_mode: Complexity::Medium,
            run_tests: true,
            test_timeout_ms: 60_000,
            lint_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReviewSquadConfig {
    #[serde(flatten)]
    pub squad: SquadSettings,
    pub default_mode: ReviewMode,
    /// When off, rejections never carry a route target
    pub enable_auto_routing: bool,
    pub enable_screenshots: bool,
    pub test_timeout_ms: u64,
}

impl Default for ReviewSquadConfig {
    fn default() -> Self {
        Self {
            squad: SquadSettings::default(),
            default_mode: ReviewMode::Basic,
            enable_auto_routing: true,
            enable_screenshots: true,
            test_timeout_ms: 120_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CodexConfig {
    pub model: String,
    pub timeout_ms: u64,
    /// Retry through the api backend when codex is unavailable or unauthenticated
    pub fallback: bool,
}

impl Default for CodexConfig {
    fn default() -> Self {
        Self {
            model: "gpt-5".to_string(),
            timeout_ms: 300_000,
            fallback: true,
        }
    }
}

/// Per-tier model overrides. `None` uses the provider's built-in choice.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierModels {
    pub quick: Option<String>,
    pub balanced: Option<String>,
    pub deep: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProviderConfig {
    pub default: ProviderKind,
    pub llm_provider: LlmProvider,
    pub base_url: Option<String>,
    pub timeout_ms: u64,
    pub models: TierModels,
    pub codex: CodexConfig,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            default: ProviderKind::Api,
            llm_provider: LlmProvider::Anthropic,
            base_url: None,
            timeout_ms: 300_000,
            models: TierModels::default(),
            codex: CodexConfig::default(),
        }
    }
}

impl ProviderConfig {
    /// Model selection for a tier on the api backend.
    pub fn model_for(&self, tier: ModelTier) -> ModelConfig {
        let name = match tier {
            ModelTier::Quick => self.models.quick.as_deref(),
            ModelTier::Balanced => self.models.balanced.as_deref(),
            ModelTier::Deep => self.models.deep.as_deref(),
        }
        .unwrap_or_else(|| self.llm_provider.default_model(tier));

        let config = ModelConfig::with_provider(self.llm_provider, name);
        match &self.base_url {
            Some(url) if self.llm_provider.supports_base_url() => config.with_base_url(url),
            _ => config,
        }
    }
}

/// Resolved configuration for one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DevTeamConfig {
    /// Where state, plans, logs and reports are written
    pub workspace: PathBuf,
    /// Where generated files land and tools run
    pub project_root: PathBuf,
    pub max_retries: u32,
    pub timeout_ms: u64,
    pub enable_screenshots: bool,
    pub report_format: ReportFormat,
    pub plan: PlanSquadConfig,
    pub execution: ExecutionSquadConfig,
    pub review: ReviewSquadConfig,
    pub provider: ProviderConfig,
}

impl Default for DevTeamConfig {
    fn default() -> Self {
        Self {
            workspace: PathBuf::from(".devteam"),
            project_root: PathBuf::from("."),
            max_retries: 3,
            timeout_ms: 3_600_000,
            enable_screenshots: true,
            report_format: ReportFormat::Markdown,
            plan: PlanSquadConfig::default(),
            execution: ExecutionSquadConfig::default(),
            review: ReviewSquadConfig::default(),
            provider: ProviderConfig::default(),
        }
    }
}

impl DevTeamConfig {
    /// Resolve from the process environment and the current directory.
    pub async fn load() -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self::load_with(&cwd, |key| std::env::var(key).ok()).await
    }

    /// Resolve with an explicit base directory and variable lookup.
    pub async fn load_with<F>(cwd: &Path, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let workspace = lookup("DEV_TEAM_WORKSPACE")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| cwd.join(".devteam"));

        let mut config = Self::read_file(&workspace.join("config.json")).await;
        config.workspace = workspace;
        if config.project_root == Path::new(".") {
            config.project_root = cwd.to_path_buf();
        }
        config.apply_env(lookup);
        config.sanitized()
    }

    async fn read_file(path: &Path) -> Self {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Ignoring malformed config file");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Overlay `DEV_TEAM_*` variables. Unparseable values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);

        if let Some(root) = lookup("DEV_TEAM_PROJECT_ROOT").filter(|v| !v.trim().is_empty()) {
            self.project_root = PathBuf::from(root);
        }
        env.int("DEV_TEAM_MAX_RETRIES", &mut self.max_retries);
        env.int("DEV_TEAM_TIMEOUT", &mut self.timeout_ms);
        env.flag("DEV_TEAM_ENABLE_SCREENSHOTS", &mut self.enable_screenshots);
        env.parsed("DEV_TEAM_REPORT_FORMAT", ReportFormat::parse, &mut self.report_format);

        env.squad("PLAN", &mut self.plan.squad);
        env.parsed("DEV_TEAM_PLAN_DEFAULT_MODE", Complexity::parse, &mut self.plan.default_mode);

        env.squad("EXECUTION", &mut self.execution.squad);
        env.parsed(
            "DEV_TEAM_EXECUTION_DEFAULT_MODE",
            Complexity::parse,
            &mut self.execution.default_mode,
        );
        env.flag("DEV_TEAM_EXECUTION_RUN_TESTS", &mut self.execution.run_tests);
        env.int("DEV_TEAM_EXECUTION_TEST_TIMEOUT", &mut self.execution.test_timeout_ms);
        env.int("DEV_TEAM_LINT_TIMEOUT", &mut self.execution.lint_timeout_ms);

        env.squad("REVIEW", &mut self.review.squad);
        env.parsed(
            "DEV_TEAM_REVIEW_DEFAULT_MODE",
            ReviewMode::parse,
            &mut self.review.default_mode,
        );
        env.flag("DEV_TEAM_REVIEW_AUTO_ROUTING", &mut self.review.enable_auto_routing);
        env.flag("DEV_TEAM_REVIEW_ENABLE_SCREENSHOTS", &mut self.review.enable_screenshots);
        env.int("DEV_TEAM_REVIEW_TEST_TIMEOUT", &mut self.review.test_timeout_ms);

        let mut penalty = None;
        env.int_opt("DEV_TEAM_REWORK_PENALTY", &mut penalty);
        if let Some(p) = penalty {
            self.plan.squad.rework_penalty = p;
            self.execution.squad.rework_penalty = p;
            self.review.squad.rework_penalty = p;
        }

        let provider = &mut self.provider;
        env.parsed("DEV_TEAM_PROVIDER", ProviderKind::parse, &mut provider.default);
        env.parsed("DEV_TEAM_LLM_PROVIDER", LlmProvider::parse, &mut provider.llm_provider);
        if let Some(url) = lookup("DEV_TEAM_LLM_BASE_URL").filter(|v| !v.trim().is_empty()) {
            provider.base_url = Some(url);
        }
        env.int("DEV_TEAM_AI_TIMEOUT", &mut provider.timeout_ms);
        env.text("DEV_TEAM_MODEL_QUICK", &mut provider.models.quick);
        env.text("DEV_TEAM_MODEL_BALANCED", &mut provider.models.balanced);
        env.text("DEV_TEAM_MODEL_DEEP", &mut provider.models.deep);
        if let Some(model) = lookup("DEV_TEAM_CODEX_MODEL").filter(|v| !v.trim().is_empty()) {
            provider.codex.model = model;
        }
        env.int("DEV_TEAM_CODEX_TIMEOUT", &mut provider.codex.timeout_ms);
        env.flag("DEV_TEAM_CODEX_FALLBACK", &mut provider.codex.fallback);
    }

    /// Clamp values into their valid ranges.
    pub fn sanitized(mut self) -> Self {
        self.timeout_ms = self.timeout_ms.max(MIN_TIMEOUT_MS);
        self.execution.test_timeout_ms = self.execution.test_timeout_ms.max(MIN_TIMEOUT_MS);
        self.execution.lint_timeout_ms = self.execution.lint_timeout_ms.max(MIN_TIMEOUT_MS);
        self.review.test_timeout_ms = self.review.test_timeout_ms.max(MIN_TIMEOUT_MS);
        self.provider.timeout_ms = self.provider.timeout_ms.max(MIN_TIMEOUT_MS);
        self.provider.codex.timeout_ms = self.provider.codex.timeout_ms.max(MIN_TIMEOUT_MS);
        for squad in [
            &mut self.plan.squad,
            &mut self.execution.squad,
            &mut self.review.squad,
        ] {
            squad.thresholds = squad.thresholds.sanitized();
        }
        self
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn int<T: std::str::FromStr>(&self, key: &str, target: &mut T) {
        if let Some(value) = self.get(key).and_then(|v| parse_int(&v)) {
            *target = value;
        }
    }

    fn int_opt<T: std::str::FromStr>(&self, key: &str, target: &mut Option<T>) {
        if let Some(value) = self.get(key).and_then(|v| parse_int(&v)) {
            *target = Some(value);
        }
    }

    fn flag(&self, key: &str, target: &mut bool) {
        if let Some(value) = self.get(key) {
            *target = parse_bool(&value);
        }
    }

    fn text(&self, key: &str, target: &mut Option<String>) {
        if let Some(value) = self.get(key) {
            *target = Some(value);
        }
    }

    fn parsed<T>(&self, key: &str, parse: fn(&str) -> Option<T>, target: &mut T) {
        if let Some(value) = self.get(key).and_then(|v| parse(&v)) {
            *target = value;
        }
    }

    fn squad(&self, prefix: &str, squad: &mut SquadSettings) {
        self.int(
            &format!("DEV_TEAM_{prefix}_MAX_REWORK"),
            &mut squad.max_rework_iterations,
        );
        self.flag(
            &format!("DEV_TEAM_{prefix}_AUTO_ESCALATION"),
            &mut squad.enable_auto_escalation,
        );
        self.int(
            &format!("DEV_TEAM_{prefix}_PASS_THRESHOLD"),
            &mut squad.thresholds.pass,
        );
        self.int(
            &format!("DEV_TEAM_{prefix}_WARN_THRESHOLD"),
            &mut squad.thresholds.warn,
        );
    }
}

/// Negative numbers clamp to zero; anything else unparseable is rejected.
fn parse_int<T: std::str::FromStr>(value: &str) -> Option<T> {
    match value.strip_prefix('-') {
        Some(digits) if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) => {
            "0".parse().ok()
        }
        _ => value.parse().ok(),
    }
}

pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "y"
    )
}
