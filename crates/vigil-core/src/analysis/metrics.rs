//! Structural metrics extraction.
//!
//! Python sources are parsed with tree-sitter; every other accepted language
//! gets a keyword-pattern estimate flagged as `Confidence::Lexical`. The
//! extractor also owns the parser-level `GEN_` findings (syntax errors, bare
//! `except:` handlers, TODO markers) and the structural hints the suggestion
//! synthesizer appends.

use std::sync::LazyLock;

use regex::Regex;
use tree_sitter::{Node, Parser, Tree};

use crate::models::{Category, Confidence, Finding, Language, Severity, SourceUnit, StructuralFacts};

/// Functions with more body statements than this get a "quite long" hint.
pub const LONG_FUNCTION_STATEMENTS: usize = 20;
/// How many un-annotated function names the type-hint hint lists.
const TYPE_HINT_NAMES_SHOWN: usize = 3;
const DEGRADED_MAINTAINABILITY: f64 = 50.0;

static TODO_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(TODO|FIXME)\b").unwrap());

// -- Lexical patterns --

static JS_FUNCTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:export\s+)?(?:async\s+)?function\s*\*?\s*[A-Za-z_$][A-Za-z0-9_$]*\s*\(")
        .unwrap()
});

static JS_ARROW_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^\s*(?:export\s+)?(?:const|let|var)\s+[A-Za-z_$][A-Za-z0-9_$]*\s*(?::[^=]+)?=\s*(?:async\s+)?(?:\([^)]*\)|[A-Za-z_$][A-Za-z0-9_$]*)\s*(?::\s*[^=]+)?=>",
    )
    .unwrap()
});

static CLASS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^\s*(?:export\s+)?(?:public\s+|private\s+|protected\s+|internal\s+)?(?:abstract\s+|final\s+|static\s+|sealed\s+|partial\s+)*(?:class|struct|interface)\s+[A-Za-z_][A-Za-z0-9_]*",
    )
    .unwrap()
});

static METHOD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^\s*(?:(?:public|private|protected|internal|static|final|virtual|override|abstract|async|inline|synchronized|const)\s+)*[A-Za-z0-9_<>\[\],:*&?]+\s+\*?&?([A-Za-z_~][A-Za-z0-9_]*)\s*\([^;{]*\)\s*(?:const\s*)?(?:throws\s+[\w.,\s]+)?\{",
    )
    .unwrap()
});

static BRANCH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(if|for|while|catch|case)\b|&&|\|\|").unwrap());

const NOT_METHOD_NAMES: &[&str] = &["if", "for", "while", "switch", "catch", "return", "else"];

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Everything the extractor learned about one source unit.
#[derive(Clone, Debug)]
pub struct ParseOutcome {
    pub facts: StructuralFacts,
    /// `GEN_` findings in line order.
    pub findings: Vec<Finding>,
    /// Structural hints forwarded to the suggestion synthesizer.
    pub hints: Vec<String>,
}

pub fn extract(unit: &SourceUnit) -> ParseOutcome {
    let mut outcome = match unit.language {
        Language::Python => python_outcome(&unit.text),
        other => lexical_outcome(&unit.text, other),
    };
    outcome.findings.extend(todo_markers(&unit.text));
    outcome.findings.sort_by_key(|f| f.line);
    outcome
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// `100 - 2*complexity - loc/10`, clamped to [0, 100].
pub fn maintainability_index(complexity: usize, lines_of_code: usize) -> f64 {
    round1((100.0 - 2.0 * complexity as f64 - lines_of_code as f64 / 10.0).clamp(0.0, 100.0))
}

pub fn comment_ratio(comment_lines: usize, lines_of_code: usize) -> f64 {
    round1(comment_lines as f64 / lines_of_code.max(1) as f64 * 100.0)
}

/// (code lines, comment lines) for a given line-comment prefix.
fn line_counts(source: &str, language: Language) -> (usize, usize) {
    let prefix = language.comment_prefix();
    let mut code = 0;
    let mut comments = 0;
    for line in source.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let is_comment = trimmed.starts_with(prefix)
            || (language != Language::Python
                && (trimmed.starts_with("/*") || trimmed.starts_with('*')));
        if is_comment {
            comments += 1;
        } else {
            code += 1;
        }
    }
    (code, comments)
}

fn todo_markers(source: &str) -> Vec<Finding> {
    source
        .lines()
        .enumerate()
        .filter(|(_, line)| TODO_RE.is_match(line))
        .map(|(idx, _)| {
            Finding::new(
                Category::General,
                "GEN_TODO_MARKER",
                Severity::Info,
                "TODO/FIXME comment found",
                idx + 1,
            )
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Python (tree-sitter)
// ---------------------------------------------------------------------------

fn parse_python(source: &str) -> Option<Tree> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_python::LANGUAGE.into())
        .ok()?;
    parser.parse(source.as_bytes(), None)
}

struct FunctionInfo {
    name: String,
    start_row: usize,
    body_statements: usize,
    annotated: bool,
}

fn node_text<'a>(node: Node<'_>, source: &'a str) -> &'a str {
    source.get(node.byte_range()).unwrap_or("")
}

/// `a and b and c` is one decision; tree-sitter nests the chain left-first,
/// so only the outermost node of a same-operator chain counts.
fn starts_bool_chain(node: Node<'_>) -> bool {
    let operator = |n: Node<'_>| n.child_by_field_name("operator").map(|o| o.kind());
    match node.parent() {
        Some(parent) if parent.kind() == "boolean_operator" => operator(parent) != operator(node),
        _ => true,
    }
}

fn is_bare_except(node: Node<'_>) -> bool {
    let mut cursor = node.walk();
    let has_type = node
        .named_children(&mut cursor)
        .any(|child| !matches!(child.kind(), "block" | "comment"));
    !has_type
}

fn function_info(node: Node<'_>, source: &str) -> FunctionInfo {
    let name = node
        .child_by_field_name("name")
        .map(|n| node_text(n, source).to_string())
        .unwrap_or_default();
    let body_statements = node
        .child_by_field_name("body")
        .map(|body| body.named_child_count())
        .unwrap_or(0);
    let returns_annotated = node.child_by_field_name("return_type").is_some();
    let params_annotated = node
        .child_by_field_name("parameters")
        .map(|params| {
            let mut cursor = params.walk();
            let annotated = params
                .named_children(&mut cursor)
                .any(|p| matches!(p.kind(), "typed_parameter" | "typed_default_parameter"));
            annotated
        })
        .unwrap_or(false);
    FunctionInfo {
        name,
        start_row: node.start_position().row,
        body_statements,
        annotated: returns_annotated || params_annotated,
    }
}

fn degraded_python(source: &str, line: usize, message: String) -> ParseOutcome {
    let total_lines = source.split('\n').count();
    ParseOutcome {
        facts: StructuralFacts {
            lines_of_code: total_lines,
            function_count: 0,
            class_count: 0,
            cyclomatic_complexity: 1,
            maintainability_index: DEGRADED_MAINTAINABILITY,
            comment_ratio: 0.0,
            confidence: Confidence::Degraded,
        },
        findings: vec![Finding::new(
            Category::General,
            "GEN_SYNTAX_ERROR",
            Severity::High,
            message,
            line,
        )],
        hints: Vec::new(),
    }
}

fn python_outcome(source: &str) -> ParseOutcome {
    let Some(tree) = parse_python(source) else {
        return degraded_python(source, 1, "Syntax error: unable to parse source".into());
    };
    let root = tree.root_node();

    let mut functions: Vec<FunctionInfo> = Vec::new();
    let mut class_count = 0usize;
    let mut complexity = 1usize;
    let mut first_error: Option<(usize, usize, String)> = None;
    let mut bare_excepts: Vec<usize> = Vec::new();

    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        if node.is_error() || node.is_missing() {
            let pos = node.start_position();
            let message = if node.is_missing() {
                format!("Syntax error: missing '{}'", node.kind())
            } else {
                "Syntax error: invalid syntax".to_string()
            };
            let earlier = first_error
                .as_ref()
                .map_or(true, |(row, col, _)| (pos.row, pos.column) < (*row, *col));
            if earlier {
                first_error = Some((pos.row, pos.column, message));
            }
        }
        match node.kind() {
            "function_definition" => functions.push(function_info(node, source)),
            "class_definition" => class_count += 1,
            "if_statement" | "elif_clause" | "for_statement" | "while_statement" => complexity += 1,
            "boolean_operator" if starts_bool_chain(node) => complexity += 1,
            "except_clause" | "except_group_clause" => {
                complexity += 1;
                if node.kind() == "except_clause" && is_bare_except(node) {
                    bare_excepts.push(node.start_position().row + 1);
                }
            }
            _ => {}
        }
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            stack.push(child);
        }
    }

    if root.has_error() || first_error.is_some() {
        let (row, message) = first_error
            .map(|(row, _, message)| (row, message))
            .unwrap_or((0, "Syntax error: invalid syntax".to_string()));
        return degraded_python(source, row + 1, message);
    }

    functions.sort_by_key(|f| f.start_row);
    let (lines_of_code, comment_lines) = line_counts(source, Language::Python);

    let findings = bare_excepts
        .into_iter()
        .map(|line| {
            Finding::new(
                Category::General,
                "GEN_BARE_EXCEPT",
                Severity::Medium,
                "Bare except clause found. Consider catching specific exceptions.",
                line,
            )
        })
        .collect();

    ParseOutcome {
        facts: StructuralFacts {
            lines_of_code,
            function_count: functions.len(),
            class_count,
            cyclomatic_complexity: complexity,
            maintainability_index: maintainability_index(complexity, lines_of_code),
            comment_ratio: comment_ratio(comment_lines, lines_of_code),
            confidence: Confidence::Parsed,
        },
        findings,
        hints: structural_hints(&functions),
    }
}

fn structural_hints(functions: &[FunctionInfo]) -> Vec<String> {
    let mut hints = Vec::new();
    let unannotated: Vec<&str> = functions
        .iter()
        .filter(|f| !f.annotated && !f.name.is_empty())
        .map(|f| f.name.as_str())
        .collect();
    if !unannotated.is_empty() {
        let shown = unannotated
            .iter()
            .take(TYPE_HINT_NAMES_SHOWN)
            .copied()
            .collect::<Vec<_>>()
            .join(", ");
        hints.push(format!("Consider adding type hints to functions: {shown}"));
    }
    for f in functions {
        if f.body_statements > LONG_FUNCTION_STATEMENTS {
            hints.push(format!(
                "Function '{}' is quite long ({} statements). Consider breaking it into smaller functions.",
                f.name, f.body_statements
            ));
        }
    }
    hints
}

// ---------------------------------------------------------------------------
// Lexical estimate
// ---------------------------------------------------------------------------

fn lexical_outcome(source: &str, language: Language) -> ParseOutcome {
    let (lines_of_code, comment_lines) = line_counts(source, language);

    let function_count = match language {
        Language::Javascript | Language::Typescript => {
            JS_FUNCTION_RE.find_iter(source).count() + JS_ARROW_RE.find_iter(source).count()
        }
        _ => METHOD_RE
            .captures_iter(source)
            .filter(|caps| !NOT_METHOD_NAMES.contains(&&caps[1]))
            .count(),
    };
    let class_count = CLASS_RE.find_iter(source).count();

    let comment_prefix = language.comment_prefix();
    let branches: usize = source
        .lines()
        .filter(|line| !line.trim_start().starts_with(comment_prefix))
        .map(|line| BRANCH_RE.find_iter(line).count())
        .sum();
    let complexity = 1 + branches;

    ParseOutcome {
        facts: StructuralFacts {
            lines_of_code,
            function_count,
            class_count,
            cyclomatic_complexity: complexity,
            maintainability_index: maintainability_index(complexity, lines_of_code),
            comment_ratio: comment_ratio(comment_lines, lines_of_code),
            confidence: Confidence::Lexical,
        },
        findings: Vec::new(),
        hints: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn python(src: &str) -> ParseOutcome {
        extract(&SourceUnit::new(src, Language::Python))
    }

    #[test]
    fn test_single_function() {
        let outcome = python("def f(): return 1");
        let facts = &outcome.facts;
        assert_eq!(facts.function_count, 1);
        assert_eq!(facts.class_count, 0);
        assert_eq!(facts.cyclomatic_complexity, 1);
        assert_eq!(facts.lines_of_code, 1);
        assert_eq!(facts.maintainability_index, 97.9);
        assert_eq!(facts.confidence, Confidence::Parsed);
        assert!(outcome.findings.is_empty());
    }

    #[test]
    fn test_complexity_counts_branches_handlers_and_bool_ops() {
        let src = "\
class A:
    def run(self, x):
        if x and x > 1:
            return 1
        elif x:
            return 2
        for i in range(3):
            pass
        while False:
            pass
        try:
            pass
        except ValueError:
            pass
        return 0
";
        let facts = python(src).facts;
        assert_eq!(facts.class_count, 1);
        assert_eq!(facts.function_count, 1);
        // 1 + if + and + elif + for + while + except
        assert_eq!(facts.cyclomatic_complexity, 7);
        assert_eq!(facts.lines_of_code, 15);
    }

    #[test]
    fn test_boolean_chain_counts_once_per_operator() {
        let src = "if a and b and c:\n    pass\n";
        // 1 + if + one `and` chain
        assert_eq!(python(src).facts.cyclomatic_complexity, 3);
        let mixed = "if a and b and c or d:\n    pass\n";
        assert_eq!(python(mixed).facts.cyclomatic_complexity, 4);
        let grouped = "if (a and b) and c:\n    pass\n";
        assert_eq!(python(grouped).facts.cyclomatic_complexity, 4);
    }

    #[test]
    fn test_async_def_counts_as_function() {
        let src = "async def fetch():\n    return 1\n\ndef sync():\n    return 2\n";
        assert_eq!(python(src).facts.function_count, 2);
    }

    #[test]
    fn test_comment_ratio() {
        let src = "# header\nx = 1\n# note\ny = 2\n";
        let facts = python(src).facts;
        assert_eq!(facts.lines_of_code, 2);
        assert_eq!(facts.comment_ratio, 100.0);
    }

    #[test]
    fn test_syntax_error_degrades() {
        let src = "x = 1\ndef broken(:\n    pass\n";
        let outcome = python(src);
        assert_eq!(outcome.facts.confidence, Confidence::Degraded);
        assert_eq!(outcome.facts.cyclomatic_complexity, 1);
        assert_eq!(outcome.facts.maintainability_index, 50.0);
        assert_eq!(outcome.findings.len(), 1);
        let finding = &outcome.findings[0];
        assert_eq!(finding.rule_id, "GEN_SYNTAX_ERROR");
        assert_eq!(finding.severity, Severity::High);
        assert_eq!(finding.line, 2);
        assert!(finding.message.starts_with("Syntax error"));
    }

    #[test]
    fn test_bare_except_flagged() {
        let src = "\
try:
    work()
except:
    pass
try:
    work()
except OSError:
    pass
";
        let outcome = python(src);
        let bare: Vec<_> = outcome
            .findings
            .iter()
            .filter(|f| f.rule_id == "GEN_BARE_EXCEPT")
            .collect();
        assert_eq!(bare.len(), 1);
        assert_eq!(bare[0].line, 3);
    }

    #[test]
    fn test_type_hint_and_long_function_hints() {
        let mut src = String::from("def typed(a: int) -> int:\n    return a\n\ndef big(x):\n");
        for i in 0..22 {
            src.push_str(&format!("    v{i} = x\n"));
        }
        let hints = python(&src).hints;
        assert_eq!(hints[0], "Consider adding type hints to functions: big");
        assert!(hints[1].starts_with("Function 'big' is quite long (22 statements)"));
    }

    #[test]
    fn test_todo_marker_any_language() {
        let src = "// TODO: remove\nfunction a() {\n  return 1;\n}\n";
        let outcome = extract(&SourceUnit::new(src, Language::Javascript));
        assert_eq!(outcome.findings.len(), 1);
        assert_eq!(outcome.findings[0].rule_id, "GEN_TODO_MARKER");
        assert_eq!(outcome.findings[0].severity, Severity::Info);
    }

    #[test]
    fn test_lexical_javascript() {
        let src = "\
// helpers
function add(a, b) {
  if (a && b) { return a + b; }
  return 0;
}
const mul = (a, b) => a * b;
class Calc {}
";
        let facts = extract(&SourceUnit::new(src, Language::Javascript)).facts;
        assert_eq!(facts.confidence, Confidence::Lexical);
        assert_eq!(facts.function_count, 2);
        assert_eq!(facts.class_count, 1);
        assert_eq!(facts.cyclomatic_complexity, 3);
        assert_eq!(facts.lines_of_code, 6);
    }

    #[test]
    fn test_lexical_java_methods() {
        let src = "\
public class Service {
    public int total(int a) {
        for (int i = 0; i < a; i++) {}
        return a;
    }
    private static void log() {
    }
}
";
        let facts = extract(&SourceUnit::new(src, Language::Java)).facts;
        assert_eq!(facts.class_count, 1);
        assert_eq!(facts.function_count, 2);
        assert_eq!(facts.cyclomatic_complexity, 2);
    }

    #[test]
    fn test_maintainability_clamped() {
        assert_eq!(maintainability_index(60, 500), 0.0);
        assert_eq!(maintainability_index(1, 0), 98.0);
    }
}
