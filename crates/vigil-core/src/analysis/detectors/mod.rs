//! The ten built-in heuristic detector categories.

pub mod algorithmic;
pub mod api_design;
pub mod code_smell;
pub mod concurrency;
pub mod data_flow;
pub mod dependency;
pub mod memory;
pub mod performance;
pub mod security;
pub mod testing;

use crate::analysis::budget::Deadline;
use crate::analysis::rules::{RuleSet, SourceView};
use crate::errors::VigilResult;
use crate::models::{Category, Finding};

/// A pure analysis over one source view.
///
/// Implementations must not mutate shared state: the orchestrator may run
/// them concurrently and abandon them on timeout.
pub trait Detector: Send + Sync {
    fn name(&self) -> &str;
    fn category(&self) -> Category;
    fn detect(&self, view: &SourceView<'_>, deadline: &Deadline) -> VigilResult<Vec<Finding>>;
}

impl Detector for RuleSet {
    fn name(&self) -> &str {
        self.category.as_str()
    }

    fn category(&self) -> Category {
        self.category
    }

    fn detect(&self, view: &SourceView<'_>, deadline: &Deadline) -> VigilResult<Vec<Finding>> {
        self.evaluate(view, deadline)
    }
}

/// Built-in rule sets in category order.
pub fn builtin_rule_sets() -> [&'static RuleSet; 10] {
    [
        &security::RULE_SET,
        &performance::RULE_SET,
        &memory::RULE_SET,
        &code_smell::RULE_SET,
        &concurrency::RULE_SET,
        &api_design::RULE_SET,
        &data_flow::RULE_SET,
        &dependency::RULE_SET,
        &testing::RULE_SET,
        &algorithmic::RULE_SET,
    ]
}

/// Canonical suggestion for a rule id, looked up in its owning category.
pub fn suggestion_for(rule_id: &str) -> Option<&'static str> {
    builtin_rule_sets()
        .into_iter()
        .find(|set| set.category.owns(rule_id))
        .and_then(|set| set.suggestion_for(rule_id))
}
