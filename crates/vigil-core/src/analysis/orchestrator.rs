//! Analysis pipeline: validate → parse → detect → synthesize under one
//! wall-clock budget, with every detector behind its own isolation boundary.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::analysis::budget::Deadline;
use crate::analysis::coverage::{coverage_source, CoverageSource};
use crate::analysis::detectors::{builtin_rule_sets, Detector};
use crate::analysis::external::{BanditScanner, ExternalScanner};
use crate::analysis::guards::{InputGuard, Rejection};
use crate::analysis::metrics::{self, ParseOutcome};
use crate::analysis::rules::SourceView;
use crate::analysis::suggestions;
use crate::config::{ExecutionMode, VigilConfig};
use crate::errors::{VigilError, VigilResult};
use crate::models::{
    AnalysisResult, Category, DegradedDetector, Finding, QualityScores, Severity, SourceUnit,
};

/// Where an analysis is, or where it stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineStage {
    Idle,
    Validating,
    Parsing,
    Detecting,
    Synthesizing,
    Complete,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Idle => "idle",
            PipelineStage::Validating => "validating",
            PipelineStage::Parsing => "parsing",
            PipelineStage::Detecting => "detecting",
            PipelineStage::Synthesizing => "synthesizing",
            PipelineStage::Complete => "complete",
        }
    }
}

// ---------------------------------------------------------------------------
// Scores
// ---------------------------------------------------------------------------

const SECURITY_PENALTY: u32 = 15;
const CRITICAL_SECURITY_PENALTY: u32 = 25;
const PERFORMANCE_PENALTY: u32 = 8;
const N_PLUS_ONE_PENALTY: u32 = 20;

/// Deterministic 0–100 scores derived from the findings alone.
pub fn quality_scores(findings: &[Finding]) -> QualityScores {
    let mut security: u32 = 0;
    let mut performance: u32 = 0;
    for finding in findings {
        match finding.category {
            Category::Security => {
                security += SECURITY_PENALTY;
                if finding.severity == Severity::Critical {
                    security += CRITICAL_SECURITY_PENALTY;
                }
            }
            Category::Performance | Category::Memory => {
                performance += PERFORMANCE_PENALTY;
                if finding.rule_id == "PERF_N_PLUS_ONE_QUERY" {
                    performance += N_PLUS_ONE_PENALTY;
                }
            }
            _ => {}
        }
    }
    QualityScores {
        security: 100u32.saturating_sub(security),
        performance: 100u32.saturating_sub(performance),
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    guard: InputGuard,
    budget_ms: u64,
    execution: ExecutionMode,
    pool: Option<rayon::ThreadPool>,
    detectors: Vec<&'static dyn Detector>,
    scanner: Option<Box<dyn ExternalScanner>>,
    coverage: Box<dyn CoverageSource>,
}

impl Orchestrator {
    pub fn new(config: &VigilConfig) -> VigilResult<Self> {
        let pool = match config.execution {
            ExecutionMode::Parallel => rayon::ThreadPoolBuilder::new()
                .num_threads(config.worker_threads.max(1))
                .build()
                .map_err(|e| warn!(error = %e, "Detector pool unavailable, running sequentially"))
                .ok(),
            ExecutionMode::Sequential => None,
        };
        Ok(Self {
            guard: InputGuard::new(config)?,
            budget_ms: config.analysis_budget_ms,
            execution: config.execution,
            pool,
            detectors: builtin_rule_sets()
                .into_iter()
                .map(|set| set as &'static dyn Detector)
                .collect(),
            scanner: config
                .external_scanner
                .as_ref()
                .map(|cfg| Box::new(BanditScanner::new(cfg)) as Box<dyn ExternalScanner>),
            coverage: coverage_source(config.coverage),
        })
    }

    pub fn with_detector(mut self, detector: &'static dyn Detector) -> Self {
        self.detectors.push(detector);
        self
    }

    pub fn with_scanner(mut self, scanner: Box<dyn ExternalScanner>) -> Self {
        self.scanner = Some(scanner);
        self
    }

    pub fn with_coverage(mut self, coverage: Box<dyn CoverageSource>) -> Self {
        self.coverage = coverage;
        self
    }

    pub fn execution(&self) -> ExecutionMode {
        self.execution
    }

    /// Validating stage on its own, so callers can log denylist hits
    /// before spending any budget.
    pub fn validate(&self, code: &str, language: &str) -> Result<SourceUnit, Rejection> {
        self.guard.admit(code, language).inspect_err(|rejection| {
            warn!(
                target: "vigil::security",
                event = "VALIDATION_REJECTED",
                dangerous = rejection.is_dangerous(),
                reason = %rejection.message(),
                "Submission rejected"
            );
        })
    }

    /// Validate and analyze in one call.
    pub fn run(&self, code: &str, language: &str) -> VigilResult<AnalysisResult> {
        let unit = self.validate(code, language)?;
        self.analyze(&unit)
    }

    /// Analyze an already validated unit.
    pub fn analyze(&self, unit: &SourceUnit) -> VigilResult<AnalysisResult> {
        let deadline = Deadline::from_millis(self.budget_ms);
        let result = self.pipeline(unit, &deadline);
        if let Err(VigilError::Timeout { budget_ms, stage }) = &result {
            deadline.cancel();
            warn!(
                target: "vigil::security",
                event = "ANALYSIS_TIMEOUT",
                budget_ms = *budget_ms,
                stage = *stage,
                bytes = unit.byte_len,
                "Analysis exceeded its budget"
            );
        }
        result
    }

    fn pipeline(&self, unit: &SourceUnit, deadline: &Deadline) -> VigilResult<AnalysisResult> {
        let ParseOutcome {
            facts,
            findings: general,
            hints,
        } = catch_unwind(AssertUnwindSafe(|| metrics::extract(unit))).map_err(|payload| {
            VigilError::Internal(format!("metrics extraction panicked: {}", panic_message(&*payload)))
        })?;
        deadline.check(PipelineStage::Parsing.as_str())?;

        let view = SourceView::new(unit, &facts);
        let (detected, mut degraded) = self.detect(&view, deadline)?;
        let mut findings = general;
        findings.extend(detected);

        if let Some(scanner) = &self.scanner {
            match scanner.scan(unit, deadline.remaining()) {
                Ok(found) => findings.extend(found),
                Err(failure) => {
                    warn!(
                        event = "DETECTOR_DEGRADED",
                        detector = scanner.name(),
                        error = %failure,
                        "External scanner failed"
                    );
                    degraded.push(DegradedDetector {
                        detector: scanner.name().to_string(),
                        reason: failure.to_string(),
                    });
                }
            }
        }
        deadline.check(PipelineStage::Detecting.as_str())?;

        findings.sort_by_key(|f| (f.category, f.line));
        let suggestions = suggestions::synthesize(&unit.text, &facts, &findings, &hints);
        let scores = quality_scores(&findings);
        let test_coverage = self.coverage.measure(unit);
        deadline.check(PipelineStage::Synthesizing.as_str())?;

        let elapsed_ms = deadline.elapsed().as_millis() as u64;
        debug!(
            language = %unit.language,
            findings = findings.len(),
            degraded = degraded.len(),
            elapsed_ms,
            "Analysis complete"
        );
        Ok(AnalysisResult {
            language: unit.language,
            facts,
            findings,
            suggestions,
            scores,
            test_coverage,
            degraded_detectors: degraded,
            elapsed_ms,
        })
    }

    /// Run every detector. A timeout anywhere aborts the stage; any other
    /// failure is confined to its detector.
    fn detect(
        &self,
        view: &SourceView<'_>,
        deadline: &Deadline,
    ) -> VigilResult<(Vec<Finding>, Vec<DegradedDetector>)> {
        let run = |detector: &&'static dyn Detector| isolate(*detector, view, deadline);
        let outcomes: Vec<VigilResult<Vec<Finding>>> = match &self.pool {
            Some(pool) => pool.install(|| self.detectors.par_iter().map(run).collect()),
            None => self.detectors.iter().map(run).collect(),
        };

        let mut findings = Vec::new();
        let mut degraded = Vec::new();
        for (detector, outcome) in self.detectors.iter().zip(outcomes) {
            match outcome {
                Ok(found) => findings.extend(found),
                Err(err @ VigilError::Timeout { .. }) => {
                    deadline.cancel();
                    return Err(err);
                }
                Err(err) => {
                    warn!(
                        event = "DETECTOR_DEGRADED",
                        detector = detector.name(),
                        error = %err,
                        "Detector failed in isolation"
                    );
                    degraded.push(DegradedDetector {
                        detector: detector.name().to_string(),
                        reason: err.to_string(),
                    });
                }
            }
        }
        Ok((findings, degraded))
    }
}

fn isolate(
    detector: &dyn Detector,
    view: &SourceView<'_>,
    deadline: &Deadline,
) -> VigilResult<Vec<Finding>> {
    if deadline.is_cancelled() {
        return deadline.check(PipelineStage::Detecting.as_str()).map(|_| Vec::new());
    }
    match catch_unwind(AssertUnwindSafe(|| detector.detect(view, deadline))) {
        Ok(Ok(found)) => {
            let category = detector.category();
            if let Some(stray) = found.iter().find(|f| !category.owns(&f.rule_id)) {
                return Err(VigilError::Internal(format!(
                    "rule id {} outside the {category} namespace",
                    stray.rule_id
                )));
            }
            Ok(found)
        }
        Ok(Err(err)) => Err(err),
        Err(payload) => Err(VigilError::Internal(format!(
            "detector panicked: {}",
            panic_message(&*payload)
        ))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::analysis::external::ScanFailure;
    use crate::config::CoverageMode;
    use crate::models::{Confidence, Language};

    fn config() -> VigilConfig {
        VigilConfig::default().with_secret("test")
    }

    struct Panicky;

    impl Detector for Panicky {
        fn name(&self) -> &str {
            "panicky"
        }
        fn category(&self) -> Category {
            Category::CodeSmell
        }
        fn detect(&self, _view: &SourceView<'_>, _deadline: &Deadline) -> VigilResult<Vec<Finding>> {
            panic!("boom");
        }
    }

    struct Trespasser;

    impl Detector for Trespasser {
        fn name(&self) -> &str {
            "trespasser"
        }
        fn category(&self) -> Category {
            Category::Memory
        }
        fn detect(&self, _view: &SourceView<'_>, _deadline: &Deadline) -> VigilResult<Vec<Finding>> {
            Ok(vec![Finding::new(Category::Memory, "SEC_FAKE", Severity::High, "x", 1)])
        }
    }

    struct Stalling;

    impl Detector for Stalling {
        fn name(&self) -> &str {
            "stalling"
        }
        fn category(&self) -> Category {
            Category::Testing
        }
        fn detect(&self, _view: &SourceView<'_>, deadline: &Deadline) -> VigilResult<Vec<Finding>> {
            loop {
                deadline.check("detecting")?;
                std::thread::sleep(Duration::from_millis(5));
            }
        }
    }

    static PANICKY: Panicky = Panicky;
    static TRESPASSER: Trespasser = Trespasser;
    static STALLING: Stalling = Stalling;

    struct BrokenScanner;

    impl ExternalScanner for BrokenScanner {
        fn name(&self) -> &str {
            "broken"
        }
        fn scan(&self, _unit: &SourceUnit, _budget: Duration) -> Result<Vec<Finding>, ScanFailure> {
            Err(ScanFailure::NotInstalled("broken".into()))
        }
    }

    const SAMPLE: &str = "\
def get_user(user_id):
    query = \"SELECT * FROM users WHERE id = \" + user_id
    cursor.execute(query)
    try:
        pass
    except:
        pass
";

    #[test]
    fn test_simple_function_facts() {
        let orchestrator = Orchestrator::new(&config()).unwrap();
        let result = orchestrator.run("def f(): return 1", "python").unwrap();
        assert_eq!(result.facts.function_count, 1);
        assert_eq!(result.facts.class_count, 0);
        assert_eq!(result.facts.cyclomatic_complexity, 1);
        assert_eq!(result.facts.confidence, Confidence::Parsed);
        assert!(result.degraded_detectors.is_empty());
        assert!(result.test_coverage.is_none());
    }

    #[test]
    fn test_denylisted_input_rejected_before_parsing() {
        let orchestrator = Orchestrator::new(&config()).unwrap();
        let err = orchestrator.run("import os", "python").unwrap_err();
        assert!(matches!(err, VigilError::Validation(_)));
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn test_findings_follow_category_order() {
        let orchestrator = Orchestrator::new(&config()).unwrap();
        let result = orchestrator.run(SAMPLE, "python").unwrap();
        assert!(result.has_rule("GEN_BARE_EXCEPT"));
        assert!(result.has_rule("SEC_SQL_INJECTION"));
        let keys: Vec<(Category, usize)> = result.findings.iter().map(|f| (f.category, f.line)).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert_eq!(result.findings[0].category, Category::General);
        assert!(result.scores.security < 100);
    }

    #[test]
    fn test_results_are_reproducible() {
        let orchestrator = Orchestrator::new(&config()).unwrap();
        let a = orchestrator.run(SAMPLE, "python").unwrap();
        let b = orchestrator.run(SAMPLE, "python").unwrap();
        assert_eq!(a.findings, b.findings);
        assert_eq!(a.suggestions, b.suggestions);
        assert_eq!(a.facts, b.facts);
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let sequential = Orchestrator::new(&config()).unwrap();
        let mut parallel_cfg = config();
        parallel_cfg.execution = ExecutionMode::Parallel;
        parallel_cfg.worker_threads = 3;
        let parallel = Orchestrator::new(&parallel_cfg).unwrap();
        assert_eq!(parallel.execution(), ExecutionMode::Parallel);
        let a = sequential.run(SAMPLE, "python").unwrap();
        let b = parallel.run(SAMPLE, "python").unwrap();
        assert_eq!(a.findings, b.findings);
        assert_eq!(a.suggestions, b.suggestions);
    }

    #[test]
    fn test_panicking_detector_is_isolated() {
        let orchestrator = Orchestrator::new(&config()).unwrap().with_detector(&PANICKY);
        let result = orchestrator.run(SAMPLE, "python").unwrap();
        assert!(result.has_rule("SEC_SQL_INJECTION"));
        assert_eq!(result.degraded_detectors.len(), 1);
        assert_eq!(result.degraded_detectors[0].detector, "panicky");
        assert!(result.degraded_detectors[0].reason.contains("boom"));
    }

    #[test]
    fn test_namespace_violation_degrades_detector() {
        let orchestrator = Orchestrator::new(&config()).unwrap().with_detector(&TRESPASSER);
        let result = orchestrator.run("x = 1\n", "python").unwrap();
        assert!(!result.has_rule("SEC_FAKE"));
        assert_eq!(result.degraded_detectors[0].detector, "trespasser");
    }

    #[test]
    fn test_budget_exhaustion_is_a_timeout() {
        let mut cfg = config();
        cfg.analysis_budget_ms = 50;
        let orchestrator = Orchestrator::new(&cfg).unwrap().with_detector(&STALLING);
        let err = orchestrator.run("x = 1\n", "python").unwrap_err();
        assert!(matches!(err, VigilError::Timeout { budget_ms: 50, .. }));
        assert_eq!(err.status_code(), 408);
    }

    #[test]
    fn test_builtin_whole_file_passes_stop_within_budget() {
        // module-level containers against a long function body
        let mut src = String::new();
        for i in 0..3_000 {
            src.push_str(&format!("g{i} = []\n"));
        }
        src.push_str("def f():\n");
        for _ in 0..3_000 {
            src.push_str("    x = 1\n");
        }
        let mut cfg = config();
        cfg.analysis_budget_ms = 200;
        let orchestrator = Orchestrator::new(&cfg).unwrap();
        let started = std::time::Instant::now();
        let outcome = orchestrator.run(&src, "python");
        let elapsed = started.elapsed();
        assert!(
            elapsed < Duration::from_millis(200 + 1_500),
            "analysis ran {elapsed:?} on a 200ms budget"
        );
        assert!(matches!(outcome, Ok(_) | Err(VigilError::Timeout { budget_ms: 200, .. })));
    }

    #[test]
    fn test_scanner_failure_is_a_degraded_note() {
        let orchestrator = Orchestrator::new(&config())
            .unwrap()
            .with_scanner(Box::new(BrokenScanner));
        let result = orchestrator.run("x = 1\n", "python").unwrap();
        assert_eq!(result.degraded_detectors[0].detector, "broken");
    }

    #[test]
    fn test_simulated_coverage_only_when_configured() {
        let mut cfg = config();
        cfg.coverage = CoverageMode::Simulated;
        let orchestrator = Orchestrator::new(&cfg).unwrap();
        let result = orchestrator.run("x = 1\n", "python").unwrap();
        assert_eq!(result.test_coverage.unwrap().source, "simulated");
    }

    #[test]
    fn test_lexical_language_still_analyzed() {
        let orchestrator = Orchestrator::new(&config()).unwrap();
        let src = "function load(id) {\n  return db.query(\"SELECT * FROM t WHERE id=\" + id);\n}\n";
        let result = orchestrator.run(src, "javascript").unwrap();
        assert_eq!(result.language, Language::Javascript);
        assert_eq!(result.facts.confidence, Confidence::Lexical);
    }

    #[test]
    fn test_scores_penalize_critical_security() {
        let findings = vec![
            Finding::new(Category::Security, "SEC_EVAL", Severity::Critical, "x", 1),
            Finding::new(Category::Performance, "PERF_N_PLUS_ONE_QUERY", Severity::High, "x", 2),
            Finding::new(Category::Memory, "MEM_LARGE_OBJECTS", Severity::Low, "x", 3),
        ];
        let scores = quality_scores(&findings);
        assert_eq!(scores.security, 60);
        assert_eq!(scores.performance, 64);
        let many = vec![Finding::new(Category::Security, "SEC_X", Severity::Critical, "x", 1); 10];
        assert_eq!(quality_scores(&many).security, 0);
    }
}
