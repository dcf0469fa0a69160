//! Runtime configuration for the analysis service.
//!
//! Everything is fixed at construction time. Config *discovery* (files,
//! environment) belongs to the host; this module only parses and validates.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{VigilError, VigilResult};
use crate::models::Plan;

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

pub const DEFAULT_MAX_CODE_CHARS: usize = 100_000;
pub const DEFAULT_ANALYSIS_BUDGET_MS: u64 = 30_000;
pub const DEFAULT_WINDOW_SECONDS: u64 = 60;
/// Extra seconds a window key outlives its window in the store.
pub const WINDOW_TTL_GRACE_SECONDS: u64 = 60;
pub const DEFAULT_TOKEN_LIFETIME_HOURS: i64 = 24;
pub const DEFAULT_ACTIVITY_RETENTION_DAYS: i64 = 7;
pub const DEFAULT_STORE_BUSY_TIMEOUT_MS: u64 = 250;
pub const DEFAULT_SCANNER_TIMEOUT_MS: u64 = 10_000;

/// Patterns rejected before parsing. Matched case-insensitively, per line.
pub const DEFAULT_DENYLIST: &[&str] = &[
    r"import\s+os\s*$",
    r"import\s+subprocess\s*$",
    r"import\s+sys\s*$",
    r"__import__\s*\(",
    r"eval\s*\(",
    r"exec\s*\(",
    r"compile\s*\(",
    r"open\s*\(",
    r"file\s*\(",
    r"input\s*\(",
    r"raw_input\s*\(",
    r"getattr\s*\(",
    r"setattr\s*\(",
    r"delattr\s*\(",
    r"hasattr\s*\(",
    r"globals\s*\(",
    r"locals\s*\(",
    r"vars\s*\(",
    r"dir\s*\(",
    r"help\s*\(",
    r"quit\s*\(",
    r"exit\s*\(",
    r"while\s+True\s*:",
    r"for\s+.*\s+in\s+.*\s*:.*while\s+True",
    r"import\s+.*\s*;.*import\s+.*\s*;.*import\s+.*",
];

// ---------------------------------------------------------------------------
// Plan limits
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanLimit {
    pub requests: u32,
    pub window_seconds: u64,
}

impl PlanLimit {
    pub const fn new(requests: u32, window_seconds: u64) -> Self {
        Self {
            requests,
            window_seconds,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanLimits {
    pub anonymous: PlanLimit,
    pub free: PlanLimit,
    pub pro: PlanLimit,
    pub enterprise: PlanLimit,
}

impl Default for PlanLimits {
    fn default() -> Self {
        Self {
            anonymous: PlanLimit::new(10, DEFAULT_WINDOW_SECONDS),
            free: PlanLimit::new(50, DEFAULT_WINDOW_SECONDS),
            pro: PlanLimit::new(200, DEFAULT_WINDOW_SECONDS),
            enterprise: PlanLimit::new(1000, DEFAULT_WINDOW_SECONDS),
        }
    }
}

impl PlanLimits {
    pub fn for_plan(&self, plan: Plan) -> PlanLimit {
        match plan {
            Plan::Anonymous => self.anonymous,
            Plan::Free => self.free,
            Plan::Pro => self.pro,
            Plan::Enterprise => self.enterprise,
        }
    }

    /// Each tier must allow at least the request rate of the tier below it.
    pub fn validate(&self) -> VigilResult<()> {
        let mut previous: Option<(Plan, PlanLimit)> = None;
        for plan in Plan::ALL {
            let limit = self.for_plan(plan);
            if limit.requests == 0 || limit.window_seconds == 0 {
                return Err(VigilError::Config(format!(
                    "plan '{plan}' needs a positive quota and window"
                )));
            }
            if let Some((prev_plan, prev)) = previous {
                // requests/window compared by cross-multiplication
                let lhs = u128::from(limit.requests) * u128::from(prev.window_seconds);
                let rhs = u128::from(prev.requests) * u128::from(limit.window_seconds);
                if lhs < rhs {
                    return Err(VigilError::Config(format!(
                        "plan '{plan}' allows fewer requests than '{prev_plan}'"
                    )));
                }
            }
            previous = Some((plan, limit));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Store / execution / optional components
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreConfig {
    /// SQLite file shared by every service instance.
    Shared {
        path: PathBuf,
        #[serde(default = "default_busy_timeout_ms")]
        busy_timeout_ms: u64,
    },
    /// Process-local store. Correct only for a single instance.
    #[default]
    Local,
}

fn default_busy_timeout_ms() -> u64 {
    DEFAULT_STORE_BUSY_TIMEOUT_MS
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Sequential,
    Parallel,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoverageMode {
    #[default]
    Disabled,
    Simulated,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalScannerConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_scanner_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_scanner_timeout_ms() -> u64 {
    DEFAULT_SCANNER_TIMEOUT_MS
}

impl Default for ExternalScannerConfig {
    fn default() -> Self {
        Self {
            program: "bandit".to_string(),
            args: vec!["-f".into(), "json".into(), "-q".into(), "-".into()],
            timeout_ms: DEFAULT_SCANNER_TIMEOUT_MS,
        }
    }
}

// ---------------------------------------------------------------------------
// VigilConfig
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VigilConfig {
    pub max_code_chars: usize,
    pub analysis_budget_ms: u64,
    pub denylist: Vec<String>,
    /// Replace lines naming credentials with a placeholder before analysis.
    pub redact_sensitive_lines: bool,
    pub execution: ExecutionMode,
    pub worker_threads: usize,
    pub plans: PlanLimits,
    pub store: StoreConfig,
    pub token_secret: String,
    pub token_issuer: String,
    pub token_lifetime_hours: i64,
    pub activity_retention_days: i64,
    pub coverage: CoverageMode,
    pub external_scanner: Option<ExternalScannerConfig>,
}

impl Default for VigilConfig {
    fn default() -> Self {
        Self {
            max_code_chars: DEFAULT_MAX_CODE_CHARS,
            analysis_budget_ms: DEFAULT_ANALYSIS_BUDGET_MS,
            denylist: DEFAULT_DENYLIST.iter().map(|p| p.to_string()).collect(),
            redact_sensitive_lines: false,
            execution: ExecutionMode::Sequential,
            worker_threads: 4,
            plans: PlanLimits::default(),
            store: StoreConfig::Local,
            token_secret: String::new(),
            token_issuer: "vigil".to_string(),
            token_lifetime_hours: DEFAULT_TOKEN_LIFETIME_HOURS,
            activity_retention_days: DEFAULT_ACTIVITY_RETENTION_DAYS,
            coverage: CoverageMode::Disabled,
            external_scanner: None,
        }
    }
}

impl VigilConfig {
    /// Parse a JSON document and validate it.
    pub fn from_json_str(raw: &str) -> VigilResult<Self> {
        let config: VigilConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.token_secret = secret.into();
        self
    }

    pub fn validate(&self) -> VigilResult<()> {
        if self.max_code_chars == 0 {
            return Err(VigilError::Config("max_code_chars must be positive".into()));
        }
        if self.analysis_budget_ms == 0 {
            return Err(VigilError::Config(
                "analysis_budget_ms must be positive".into(),
            ));
        }
        if self.token_secret.trim().is_empty() {
            return Err(VigilError::Config("token_secret must be set".into()));
        }
        if self.token_lifetime_hours <= 0 || self.activity_retention_days <= 0 {
            return Err(VigilError::Config(
                "token lifetime and activity retention must be positive".into(),
            ));
        }
        self.plans.validate()?;
        for pattern in &self.denylist {
            regex::Regex::new(pattern)?;
        }
        if let Some(scanner) = &self.external_scanner {
            if scanner.program.trim().is_empty() || scanner.timeout_ms == 0 {
                return Err(VigilError::Config(
                    "external scanner needs a program and a positive timeout".into(),
                ));
            }
        }
        Ok(())
    }
}
