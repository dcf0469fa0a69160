//! Code smell rules: oversized classes and functions, long parameter lists,
//! magic numbers, tangled conditionals, duplicated lines.

use std::sync::LazyLock;

use indexmap::IndexMap;
use regex::Regex;

use crate::analysis::budget::Deadline;
use crate::analysis::rules::{is_function_header, Hit, LineContext, LineRule, RuleSet, SourceView};
use crate::errors::VigilResult;
use crate::models::{Category, Severity};

type Ctx<'v, 'a> = LineContext<'v, 'a>;

const MAX_METHODS_PER_CLASS: usize = 15;
const MAX_PARAMETERS: usize = 5;
const MAX_BOOLEAN_OPERATORS: usize = 3;
const MAX_METHOD_LINES: usize = 30;
const MIN_DUPLICATE_LEN: usize = 20;
const DUPLICATE_THRESHOLD: usize = 3;

static MAGIC_NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[^\w.])(\d{3,})(?:[^\w.]|$)").unwrap());

static CONSTANT_DECL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:const\s+|static\s+|final\s+)*[A-Z][A-Z0-9_]*\s*[:=]").unwrap());

static BOOL_OP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:\band\b|\bor\b|&&|\|\|)").unwrap());

static FUNCTION_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:async\s+)?(?:def|function)\s+([A-Za-z_][A-Za-z0-9_]*)").unwrap()
});

const MAGIC_NUMBER_EXEMPT: &[&str] = &[
    "version", "port", "timeout", "size", "limit", "count", "range(", "status", "http",
];

fn long_parameter_list(ctx: &Ctx<'_, '_>) -> bool {
    if !is_function_header(ctx.lower()) {
        return false;
    }
    let lower = ctx.lower();
    let (Some(open), Some(close)) = (lower.find('('), lower.rfind(')')) else {
        return false;
    };
    if close <= open + 1 {
        return false;
    }
    let params = lower[open + 1..close]
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty() && *p != "self" && *p != "cls")
        .count();
    params > MAX_PARAMETERS
}

fn magic_number(ctx: &Ctx<'_, '_>) -> bool {
    let raw = ctx.raw().trim();
    if CONSTANT_DECL_RE.is_match(raw) || ctx.has(MAGIC_NUMBER_EXEMPT) {
        return false;
    }
    if ctx.lower().starts_with("import ") || ctx.lower().starts_with("from ") {
        return false;
    }
    MAGIC_NUMBER_RE.is_match(ctx.lower())
}

fn complex_conditional(ctx: &Ctx<'_, '_>) -> bool {
    let lower = ctx.lower();
    let is_condition = ["if ", "if(", "elif ", "while ", "while(", "} else if"]
        .iter()
        .any(|p| lower.starts_with(p))
        || lower.starts_with("return ");
    is_condition && BOOL_OP_RE.find_iter(lower).count() > MAX_BOOLEAN_OPERATORS
}

fn long_method(ctx: &Ctx<'_, '_>) -> bool {
    if !is_function_header(ctx.lower()) {
        return false;
    }
    let end = ctx.view.block_end(ctx.index);
    (ctx.index + 1..end).filter(|&i| ctx.view.is_code(i)).count() > MAX_METHOD_LINES
}

fn dead_code(ctx: &Ctx<'_, '_>) -> bool {
    is_function_header(ctx.lower())
        && FUNCTION_NAME_RE
            .captures(ctx.lower())
            .is_some_and(|c| c[1].contains("unused") || c[1].starts_with("old_") || c[1].ends_with("_old"))
}

/// Mixed snake_case and camelCase in one function name.
fn inconsistent_naming(ctx: &Ctx<'_, '_>) -> bool {
    let Some(caps) = FUNCTION_NAME_RE.captures(ctx.raw()) else {
        return false;
    };
    let name = caps[1].trim_start_matches('_');
    name.contains('_') && name.chars().any(|c| c.is_ascii_uppercase())
        && !name.chars().all(|c| c.is_ascii_uppercase() || c == '_' || c.is_ascii_digit())
}

fn file_pass(view: &SourceView<'_>, deadline: &Deadline) -> VigilResult<Vec<Hit>> {
    let mut hits = Vec::new();
    let mut ticker = deadline.ticker("detecting");

    for i in view.code_lines() {
        ticker.tick()?;
        let lower = view.lower(i);
        if !lower.starts_with("class ") {
            continue;
        }
        let end = view.block_end(i);
        let methods = (i + 1..end)
            .filter(|&j| view.enclosing(j).next() == Some(i) && is_function_header(view.lower(j)))
            .count();
        if methods > MAX_METHODS_PER_CLASS {
            let name = view.raw(i).trim()["class ".len()..]
                .split(|c: char| c == '(' || c == ':' || c == ' ' || c == '{')
                .next()
                .unwrap_or_default()
                .to_string();
            hits.push(Hit::new(
                "SMELL_GOD_OBJECT",
                Severity::High,
                format!("Class '{name}' has {methods} methods - too many responsibilities"),
                i + 1,
            ));
        }
    }

    let mut seen: IndexMap<&str, Vec<usize>> = IndexMap::new();
    for i in view.code_lines() {
        ticker.tick()?;
        let line = view.lower(i);
        if line.len() < MIN_DUPLICATE_LEN
            || line.starts_with("import ")
            || line.starts_with("from ")
            || line.starts_with('@')
            || line.starts_with("def ")
            || line.starts_with("class ")
        {
            continue;
        }
        seen.entry(line).or_default().push(i);
    }
    for (_, lines) in seen.iter().filter(|(_, l)| l.len() >= DUPLICATE_THRESHOLD) {
        hits.push(Hit::new(
            "SMELL_DUPLICATE_CODE",
            Severity::Medium,
            format!(
                "Same statement repeated {} times (first at line {})",
                lines.len(),
                lines[0] + 1
            ),
            lines[1] + 1,
        ));
    }
    Ok(hits)
}

pub static RULES: &[LineRule] = &[
    LineRule {
        id: "SMELL_LONG_PARAMETER_LIST",
        severity: Severity::Medium,
        message: "Function takes too many parameters",
        applies: long_parameter_list,
    },
    LineRule {
        id: "SMELL_MAGIC_NUMBER",
        severity: Severity::Low,
        message: "Magic number - give it a named constant",
        applies: magic_number,
    },
    LineRule {
        id: "SMELL_COMPLEX_CONDITIONAL",
        severity: Severity::Medium,
        message: "Conditional combines too many boolean operators",
        applies: complex_conditional,
    },
    LineRule {
        id: "SMELL_LONG_METHOD",
        severity: Severity::Medium,
        message: "Function body is too long",
        applies: long_method,
    },
    LineRule {
        id: "SMELL_DEAD_CODE",
        severity: Severity::Low,
        message: "Function looks unused or obsolete",
        applies: dead_code,
    },
    LineRule {
        id: "SMELL_INCONSISTENT_NAMING",
        severity: Severity::Low,
        message: "Function name mixes snake_case and camelCase",
        applies: inconsistent_naming,
    },
];

pub static SUGGESTIONS: &[(&str, &str)] = &[
    ("SMELL_GOD_OBJECT", "Split god objects into smaller, focused classes with single responsibilities"),
    ("SMELL_LONG_PARAMETER_LIST", "Use data classes, configuration objects, or builder pattern for long parameter lists"),
    ("SMELL_MAGIC_NUMBER", "Replace magic numbers with named constants for better readability and maintainability"),
    ("SMELL_COMPLEX_CONDITIONAL", "Extract complex conditionals into separate methods or use early returns"),
    ("SMELL_DUPLICATE_CODE", "Extract duplicate code into common functions or utility classes"),
    ("SMELL_LONG_METHOD", "Break long methods into smaller, focused functions"),
    ("SMELL_DEAD_CODE", "Remove unused code to improve maintainability and reduce complexity"),
    ("SMELL_INCONSISTENT_NAMING", "Use consistent naming conventions throughout the codebase"),
];

pub static RULE_SET: RuleSet = RuleSet {
    category: Category::CodeSmell,
    rules: RULES,
    file_pass: Some(file_pass),
    suggestions: SUGGESTIONS,
};
