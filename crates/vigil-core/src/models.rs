//! Shared typed models used across analysis, admission, and identity layers.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::VigilError;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Derive a stable anonymous identity key (first 16 hex chars of SHA-256)
/// from a client address.
pub fn anonymous_key(client_ip: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(client_ip.trim().as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

// ---------------------------------------------------------------------------
// Language
// ---------------------------------------------------------------------------

/// Languages accepted by the input guard. Only Python is parsed structurally.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Javascript,
    Typescript,
    Java,
    Cpp,
    Csharp,
}

impl Language {
    pub const ALL: [Language; 6] = [
        Language::Python,
        Language::Javascript,
        Language::Typescript,
        Language::Java,
        Language::Cpp,
        Language::Csharp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Javascript => "javascript",
            Language::Typescript => "typescript",
            Language::Java => "java",
            Language::Cpp => "cpp",
            Language::Csharp => "csharp",
        }
    }

    /// Line-comment prefix used by lexical counting.
    pub fn comment_prefix(&self) -> &'static str {
        match self {
            Language::Python => "#",
            _ => "//",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = VigilError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        Language::ALL
            .into_iter()
            .find(|lang| lang.as_str() == lowered)
            .ok_or_else(|| {
                VigilError::Validation(format!(
                    "Language must be one of: {}",
                    Language::ALL.map(|l| l.as_str()).join(", ")
                ))
            })
    }
}

// ---------------------------------------------------------------------------
// Severity / Category
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// Finding category. Declaration order is the order findings are reported in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    General,
    Security,
    Performance,
    Memory,
    CodeSmell,
    Concurrency,
    ApiDesign,
    DataFlow,
    Dependency,
    Testing,
    Algorithmic,
}

impl Category {
    pub const ORDER: [Category; 11] = [
        Category::General,
        Category::Security,
        Category::Performance,
        Category::Memory,
        Category::CodeSmell,
        Category::Concurrency,
        Category::ApiDesign,
        Category::DataFlow,
        Category::Dependency,
        Category::Testing,
        Category::Algorithmic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::General => "general",
            Category::Security => "security",
            Category::Performance => "performance",
            Category::Memory => "memory",
            Category::CodeSmell => "code_smell",
            Category::Concurrency => "concurrency",
            Category::ApiDesign => "api_design",
            Category::DataFlow => "data_flow",
            Category::Dependency => "dependency",
            Category::Testing => "testing",
            Category::Algorithmic => "algorithmic",
        }
    }

    /// Rule-id namespace owned by this category.
    pub fn rule_prefix(&self) -> &'static str {
        match self {
            Category::General => "GEN_",
            Category::Security => "SEC_",
            Category::Performance => "PERF_",
            Category::Memory => "MEM_",
            Category::CodeSmell => "SMELL_",
            Category::Concurrency => "CONC_",
            Category::ApiDesign => "API_",
            Category::DataFlow => "DATA_",
            Category::Dependency => "DEP_",
            Category::Testing => "TEST_",
            Category::Algorithmic => "ALG_",
        }
    }

    pub fn owns(&self, rule_id: &str) -> bool {
        rule_id.starts_with(self.rule_prefix())
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Analysis inputs and outputs
// ---------------------------------------------------------------------------

/// One submitted piece of source text. Lives for a single request.
#[derive(Clone, Debug)]
pub struct SourceUnit {
    pub text: String,
    pub language: Language,
    pub byte_len: usize,
}

impl SourceUnit {
    pub fn new(text: impl Into<String>, language: Language) -> Self {
        let text = text.into();
        let byte_len = text.len();
        Self {
            text,
            language,
            byte_len,
        }
    }
}

/// How the structural facts were obtained.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    /// Full structural parse succeeded.
    Parsed,
    /// Structural parse failed; counts are line-based defaults.
    Degraded,
    /// Keyword-pattern estimate for a language without a structural parser.
    Lexical,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StructuralFacts {
    pub lines_of_code: usize,
    pub function_count: usize,
    pub class_count: usize,
    pub cyclomatic_complexity: usize,
    pub maintainability_index: f64,
    pub comment_ratio: f64,
    pub confidence: Confidence,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub category: Category,
    pub rule_id: String,
    pub severity: Severity,
    pub message: String,
    pub line: usize,
    pub column: usize,
}

impl Finding {
    pub fn new(
        category: Category,
        rule_id: impl Into<String>,
        severity: Severity,
        message: impl Into<String>,
        line: usize,
    ) -> Self {
        Self {
            category,
            rule_id: rule_id.into(),
            severity,
            message: message.into(),
            line,
            column: 1,
        }
    }
}

/// Note left in the result when one detector failed in isolation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DegradedDetector {
    pub detector: String,
    pub reason: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct QualityScores {
    pub security: u32,
    pub performance: u32,
}

/// Coverage figure plus where it came from. Never presented unlabelled.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CoverageMetric {
    pub percent: f64,
    pub source: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub language: Language,
    pub facts: StructuralFacts,
    pub findings: Vec<Finding>,
    pub suggestions: Vec<String>,
    pub scores: QualityScores,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_coverage: Option<CoverageMetric>,
    pub degraded_detectors: Vec<DegradedDetector>,
    pub elapsed_ms: u64,
}

impl AnalysisResult {
    pub fn findings_in(&self, category: Category) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(move |f| f.category == category)
    }

    pub fn has_rule(&self, rule_id: &str) -> bool {
        self.findings.iter().any(|f| f.rule_id == rule_id)
    }
}

// ---------------------------------------------------------------------------
// Wire view
// ---------------------------------------------------------------------------

/// Finding as handed to callers, numbered in report order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindingView {
    pub id: String,
    pub category: Category,
    pub rule_id: String,
    pub severity: Severity,
    pub message: String,
    pub line: usize,
    pub column: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RateLimitView {
    pub plan: Plan,
    pub limit: u32,
    pub remaining: u32,
    pub reset_time: Option<DateTime<Utc>>,
    pub degraded: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResponse {
    pub language: Language,
    pub metrics: StructuralFacts,
    pub findings: Vec<FindingView>,
    pub suggestions: Vec<String>,
    pub scores: QualityScores,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_coverage: Option<CoverageMetric>,
    pub degraded_detectors: Vec<DegradedDetector>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitView>,
    pub elapsed_ms: u64,
}

impl AnalysisResponse {
    pub fn from_result(result: AnalysisResult, rate_limit: Option<RateLimitView>) -> Self {
        let findings = result
            .findings
            .into_iter()
            .enumerate()
            .map(|(index, f)| FindingView {
                id: format!("issue_{:03}", index + 1),
                category: f.category,
                rule_id: f.rule_id,
                severity: f.severity,
                message: f.message,
                line: f.line,
                column: f.column,
            })
            .collect();
        Self {
            language: result.language,
            metrics: result.facts,
            findings,
            suggestions: result.suggestions,
            scores: result.scores,
            test_coverage: result.test_coverage,
            degraded_detectors: result.degraded_detectors,
            rate_limit,
            elapsed_ms: result.elapsed_ms,
        }
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Subscription tier. Declaration order is ascending capacity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Anonymous,
    Free,
    Pro,
    Enterprise,
}

impl Plan {
    pub const ALL: [Plan; 4] = [Plan::Anonymous, Plan::Free, Plan::Pro, Plan::Enterprise];

    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Anonymous => "anonymous",
            Plan::Free => "free",
            Plan::Pro => "pro",
            Plan::Enterprise => "enterprise",
        }
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Plan {
    type Err = VigilError;

    /// Unknown plan names resolve to `Anonymous`, never to a larger quota.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        Ok(Plan::ALL
            .into_iter()
            .find(|plan| plan.as_str() == lowered)
            .unwrap_or(Plan::Anonymous))
    }
}

/// Who a request is attributed to after token resolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Identity {
    Anonymous { key: String, client_ip: String },
    User {
        user_id: String,
        plan: Plan,
        client_ip: String,
    },
}

impl Identity {
    pub fn anonymous(client_ip: &str) -> Self {
        Identity::Anonymous {
            key: anonymous_key(client_ip),
            client_ip: client_ip.to_string(),
        }
    }

    pub fn plan(&self) -> Plan {
        match self {
            Identity::Anonymous { .. } => Plan::Anonymous,
            Identity::User { plan, .. } => *plan,
        }
    }

    /// Shared-store key for this identity's request window.
    pub fn rate_limit_key(&self) -> String {
        match self {
            Identity::Anonymous { key, .. } => format!("rate_limit:ip:{key}"),
            Identity::User { user_id, .. } => format!("rate_limit:user:{user_id}"),
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        match self {
            Identity::Anonymous { .. } => None,
            Identity::User { user_id, .. } => Some(user_id),
        }
    }

    pub fn client_ip(&self) -> &str {
        match self {
            Identity::Anonymous { client_ip, .. } | Identity::User { client_ip, .. } => client_ip,
        }
    }
}

// ---------------------------------------------------------------------------
// Activity
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    CodeAnalysis,
    DangerousCodeDetected,
    RateLimitExceeded,
    UserRegistration,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::CodeAnalysis => "code_analysis",
            ActivityKind::DangerousCodeDetected => "dangerous_code_detected",
            ActivityKind::RateLimitExceeded => "rate_limit_exceeded",
            ActivityKind::UserRegistration => "user_registration",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub activity_type: ActivityKind,
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}
