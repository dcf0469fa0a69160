//! Testing-gap rules: untested functions and classes, untestable
//! constructs, weak or slow tests.

use std::sync::LazyLock;

use regex::Regex;

use crate::analysis::budget::Deadline;
use crate::analysis::rules::{Hit, LineContext, LineRule, RuleSet, SourceView};
use crate::errors::VigilResult;
use crate::models::{Category, Severity};

type Ctx<'v, 'a> = LineContext<'v, 'a>;

static DEF_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:async\s+)?def\s+([A-Za-z_][A-Za-z0-9_]*)").unwrap());

static CLASS_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^class\s+([A-Za-z_][A-Za-z0-9_]*)").unwrap());

static WEAK_ASSERT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:assert\s+(?:true|false|1|0)\s*(?:$|,|#)|self\.assert(?:true|false)\(\s*(?:true|false|1|0)\s*\))")
        .unwrap()
});

const CRITICAL_PREFIXES: &[&str] = &["authenticate", "authorize", "validate", "encrypt", "decrypt"];

const HARDCODED_FIXTURES: &[&str] = &["user123", "test@example.com", "john doe", "password123", "'password'"];

fn untestable(ctx: &Ctx<'_, '_>) -> bool {
    !ctx.in_test() && ctx.has(&["input(", "raw_input(", "sys.argv", "os.environ"])
}

fn hardcoded_values(ctx: &Ctx<'_, '_>) -> bool {
    ctx.has(&["localhost", "127.0.0.1", "0.0.0.0"]) && ctx.has(&["=", "(", ":"])
}

fn anti_pattern(ctx: &Ctx<'_, '_>) -> bool {
    WEAK_ASSERT_RE.is_match(ctx.lower())
}

fn is_test_def(lower: &str) -> bool {
    lower.starts_with("def test") || lower.starts_with("async def test")
}

fn missing_documentation(ctx: &Ctx<'_, '_>) -> bool {
    is_test_def(ctx.lower()) && !ctx.next_has(1, &["\"\"\"", "'''"])
}

fn isolation_issue(ctx: &Ctx<'_, '_>) -> bool {
    ctx.lower().starts_with("global ") && ctx.in_test()
}

/// Test class with no setup or teardown hook in its body.
fn missing_setup(ctx: &Ctx<'_, '_>) -> bool {
    if !ctx.lower().starts_with("class test") {
        return false;
    }
    let end = ctx.view.block_end(ctx.index);
    !ctx.view.lowered_range(ctx.index, end).any(|l| {
        ["setup", "teardown", "fixture", "setup_method", "teardown_method"]
            .iter()
            .any(|hook| l.contains(hook))
    })
}

fn hardcoded_data(ctx: &Ctx<'_, '_>) -> bool {
    ctx.in_test() && ctx.has(HARDCODED_FIXTURES)
}

fn performance_issue(ctx: &Ctx<'_, '_>) -> bool {
    ctx.in_test()
        && ctx.has(&["time.sleep(", "requests.get(", "requests.post(", "database.query(", "urlopen("])
}

fn missing_integration(ctx: &Ctx<'_, '_>) -> bool {
    (is_test_def(ctx.lower()) || ctx.lower().starts_with("class test"))
        && ctx.has(&["database", "_api", "http", "external"])
        && !ctx.around_has(3, 0, &["integration"])
}

/// Functions, classes and critical routines with no sibling test in the file.
fn file_pass(view: &SourceView<'_>, deadline: &Deadline) -> VigilResult<Vec<Hit>> {
    let text = view.lower_text();
    let mut hits = Vec::new();
    let mut ticker = deadline.ticker("detecting");
    for i in view.code_lines() {
        ticker.tick()?;
        let raw = view.raw(i).trim_start();
        if let Some(caps) = DEF_NAME_RE.captures(raw) {
            let name = caps[1].to_lowercase();
            let untested = !name.starts_with("test")
                && !name.starts_with('_')
                && !["mock", "stub", "fixture"].iter().any(|p| name.contains(p))
                && !text.contains(&format!("test_{name}"));
            if !untested {
                continue;
            }
            if CRITICAL_PREFIXES.iter().any(|p| name.starts_with(p)) {
                hits.push(Hit::new(
                    "TEST_CRITICAL_FUNCTION",
                    Severity::High,
                    format!("Critical function {name} needs comprehensive test coverage"),
                    i + 1,
                ));
            }
            hits.push(Hit::new(
                "TEST_MISSING_FUNCTION_TEST",
                Severity::Medium,
                format!("Function {name} has no corresponding test - add unit tests"),
                i + 1,
            ));
        } else if let Some(caps) = CLASS_NAME_RE.captures(raw) {
            let name = &caps[1];
            let lower = name.to_lowercase();
            if lower.starts_with("test") || lower.contains("mock") || lower.contains("stub") {
                continue;
            }
            if !text.contains(&format!("test{lower}")) && !text.contains(&format!("test_{lower}")) {
                hits.push(Hit::new(
                    "TEST_MISSING_CLASS_TEST",
                    Severity::Medium,
                    format!("Class {name} has no corresponding test - add unit tests"),
                    i + 1,
                ));
            }
        }
    }
    Ok(hits)
}

pub static RULES: &[LineRule] = &[
    LineRule {
        id: "TEST_UNTESTABLE_CODE",
        severity: Severity::Medium,
        message: "Untestable code - direct user input or system interaction",
        applies: untestable,
    },
    LineRule {
        id: "TEST_HARDCODED_VALUES",
        severity: Severity::Low,
        message: "Hardcoded values make testing difficult - use configuration or dependency injection",
        applies: hardcoded_values,
    },
    LineRule {
        id: "TEST_ANTI_PATTERN",
        severity: Severity::Medium,
        message: "Test anti-pattern - use meaningful assertions instead of assert True/False",
        applies: anti_pattern,
    },
    LineRule {
        id: "TEST_MISSING_DOCUMENTATION",
        severity: Severity::Low,
        message: "Test function missing documentation - add docstring explaining test purpose",
        applies: missing_documentation,
    },
    LineRule {
        id: "TEST_ISOLATION_ISSUE",
        severity: Severity::Medium,
        message: "Test isolation issue - avoid global variables in tests",
        applies: isolation_issue,
    },
    LineRule {
        id: "TEST_MISSING_SETUP",
        severity: Severity::Low,
        message: "Test missing setup/teardown - add proper test lifecycle management",
        applies: missing_setup,
    },
    LineRule {
        id: "TEST_HARDCODED_DATA",
        severity: Severity::Low,
        message: "Hardcoded test data - use test fixtures or factories",
        applies: hardcoded_data,
    },
    LineRule {
        id: "TEST_PERFORMANCE_ISSUE",
        severity: Severity::Medium,
        message: "Slow test - use mocks or stubs for external dependencies",
        applies: performance_issue,
    },
    LineRule {
        id: "TEST_MISSING_INTEGRATION",
        severity: Severity::Low,
        message: "Integration test needed - test with real external dependencies",
        applies: missing_integration,
    },
];

pub static SUGGESTIONS: &[(&str, &str)] = &[
    ("TEST_UNTESTABLE_CODE", "Make code testable by using dependency injection and configuration"),
    ("TEST_HARDCODED_VALUES", "Replace hardcoded values with configuration or environment variables"),
    ("TEST_ANTI_PATTERN", "Use meaningful assertions instead of assert True/False"),
    ("TEST_MISSING_DOCUMENTATION", "Add docstrings to test functions explaining their purpose"),
    ("TEST_ISOLATION_ISSUE", "Avoid global variables in tests - use proper test isolation"),
    ("TEST_MISSING_SETUP", "Add proper test setup and teardown methods"),
    ("TEST_HARDCODED_DATA", "Use test fixtures or factories instead of hardcoded test data"),
    ("TEST_CRITICAL_FUNCTION", "Add comprehensive test coverage for critical functions"),
    ("TEST_PERFORMANCE_ISSUE", "Use mocks or stubs for external dependencies in tests"),
    ("TEST_MISSING_INTEGRATION", "Add integration tests that exercise real external dependencies"),
    ("TEST_MISSING_FUNCTION_TEST", "Add unit tests for all functions"),
    ("TEST_MISSING_CLASS_TEST", "Add unit tests for all classes"),
];

pub static RULE_SET: RuleSet = RuleSet {
    category: Category::Testing,
    rules: RULES,
    file_pass: Some(file_pass),
    suggestions: SUGGESTIONS,
};
