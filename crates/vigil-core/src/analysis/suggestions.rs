//! Suggestion synthesis: triggered rule ids → deduplicated recommendations.

use std::sync::LazyLock;

use indexmap::IndexSet;
use regex::Regex;

use crate::analysis::detectors::builtin_rule_sets;
use crate::models::{Category, Finding, StructuralFacts};

static CONSTANT_NAME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[A-Z_]{3,}").unwrap());

/// Canonical suggestions for the parser-level rules.
pub static GENERAL_SUGGESTIONS: &[(&str, &str)] = &[
    ("GEN_SYNTAX_ERROR", "Fix the syntax error before relying on the remaining findings"),
    ("GEN_BARE_EXCEPT", "Catch specific exception types instead of using a bare except"),
    ("GEN_TODO_MARKER", "Resolve or track TODO/FIXME markers in an issue tracker"),
];

/// Statement forms that count as error handling.
const ERROR_HANDLING_MARKERS: &[&str] = &["try:", "try {", "except", "catch (", "catch(", "catch {"];

const EXTERNAL_SCANNER_PREFIX: &str = "SEC_BANDIT_";
const EXTERNAL_SCANNER_SUGGESTION: &str =
    "Review the issues reported by the external security scanner";

/// Build the ordered suggestion list for one analysis.
///
/// Order: per-category table entries (category order, table order), then
/// structural hints, then the generic source-level checks. A suggestion
/// appears once no matter how many findings triggered it.
pub fn synthesize(
    text: &str,
    facts: &StructuralFacts,
    findings: &[Finding],
    hints: &[String],
) -> Vec<String> {
    let triggered: IndexSet<&str> = findings.iter().map(|f| f.rule_id.as_str()).collect();
    let mut out: IndexSet<String> = IndexSet::new();

    let tables = std::iter::once((Category::General, GENERAL_SUGGESTIONS))
        .chain(builtin_rule_sets().into_iter().map(|set| (set.category, set.suggestions)));
    for (category, table) in tables {
        for (rule_id, suggestion) in table {
            if triggered.contains(rule_id) {
                out.insert((*suggestion).to_string());
            }
        }
        if category == Category::Security
            && triggered.iter().any(|id| id.starts_with(EXTERNAL_SCANNER_PREFIX))
        {
            out.insert(EXTERNAL_SCANNER_SUGGESTION.to_string());
        }
    }

    out.extend(hints.iter().cloned());
    out.extend(generic_suggestions(text, facts));
    out.into_iter().collect()
}

/// Category-independent checks over the raw source.
fn generic_suggestions(text: &str, facts: &StructuralFacts) -> Vec<String> {
    let mut out = Vec::new();
    if facts.function_count > 0 {
        if !text.contains("\"\"\"") && !text.contains("'''") && !text.contains("/**") {
            out.push("Consider adding docstrings to your functions".to_string());
        }
        if !ERROR_HANDLING_MARKERS.iter().any(|m| text.contains(m)) {
            out.push("Consider adding error handling to your functions".to_string());
        }
    }
    if CONSTANT_NAME_RE.is_match(text) {
        out.push("Consider using constants for magic numbers and strings".to_string());
    }
    if text.contains("requests.get(") || text.contains("requests.post(") {
        out.push("Consider using async/await with httpx for better concurrency".to_string());
    }
    out
}
