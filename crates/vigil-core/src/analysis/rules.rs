//! Declarative rule tables and the line engine that evaluates them.
//!
//! A category is a `RuleSet`: a static table of `LineRule`s checked against
//! every code line, an optional whole-file pass for rules that need global
//! context, and the rule-id → suggestion table the synthesizer reads.

use crate::analysis::budget::Deadline;
use crate::errors::VigilResult;
use crate::models::{Category, Finding, Language, Severity, SourceUnit, StructuralFacts};

// ---------------------------------------------------------------------------
// SourceView
// ---------------------------------------------------------------------------

/// Pre-split, pre-lowered view of one source unit shared by every detector.
pub struct SourceView<'a> {
    pub language: Language,
    pub facts: &'a StructuralFacts,
    pub text: &'a str,
    lower_text: String,
    raw: Vec<&'a str>,
    lower: Vec<String>,
    indent: Vec<usize>,
    /// Nearest enclosing block header (by indentation) for each line.
    parent: Vec<Option<usize>>,
    comment: Vec<bool>,
}

impl<'a> SourceView<'a> {
    pub fn new(unit: &'a SourceUnit, facts: &'a StructuralFacts) -> Self {
        let raw: Vec<&str> = unit.text.lines().collect();
        let lower: Vec<String> = raw.iter().map(|l| l.trim().to_lowercase()).collect();
        let indent: Vec<usize> = raw
            .iter()
            .map(|l| {
                l.chars()
                    .take_while(|c| c.is_whitespace())
                    .map(|c| if c == '\t' { 4 } else { 1 })
                    .sum()
            })
            .collect();
        let prefix = unit.language.comment_prefix();
        let comment = lower
            .iter()
            .map(|l| l.starts_with(prefix) || l.starts_with("/*") || l.starts_with("* "))
            .collect();

        let mut parent = vec![None; raw.len()];
        let mut stack: Vec<(usize, usize)> = Vec::new();
        for (idx, line) in lower.iter().enumerate() {
            if line.is_empty() {
                continue;
            }
            while stack.last().is_some_and(|&(_, depth)| depth >= indent[idx]) {
                stack.pop();
            }
            parent[idx] = stack.last().map(|&(j, _)| j);
            stack.push((idx, indent[idx]));
        }

        Self {
            language: unit.language,
            facts,
            text: &unit.text,
            lower_text: unit.text.to_lowercase(),
            raw,
            lower,
            indent,
            parent,
            comment,
        }
    }

    /// Whole source, lowercased.
    pub fn lower_text(&self) -> &str {
        &self.lower_text
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn raw(&self, idx: usize) -> &str {
        self.raw.get(idx).copied().unwrap_or("")
    }

    /// Trimmed, lowercased line.
    pub fn lower(&self, idx: usize) -> &str {
        self.lower.get(idx).map(String::as_str).unwrap_or("")
    }

    pub fn indent(&self, idx: usize) -> usize {
        self.indent.get(idx).copied().unwrap_or(0)
    }

    pub fn is_code(&self, idx: usize) -> bool {
        !self.lower(idx).is_empty() && !self.comment.get(idx).copied().unwrap_or(false)
    }

    /// Lowered lines in `[start, end)`, clamped to the source.
    pub fn lowered_range(&self, start: usize, end: usize) -> impl Iterator<Item = &str> {
        let end = end.min(self.len());
        let start = start.min(end);
        self.lower[start..end].iter().map(String::as_str)
    }

    /// Indices of enclosing block headers, innermost first.
    pub fn enclosing(&self, idx: usize) -> impl Iterator<Item = usize> + '_ {
        std::iter::successors(self.parent.get(idx).copied().flatten(), move |&j| {
            self.parent[j]
        })
    }

    /// One past the last line of the block opened at `header`.
    pub fn block_end(&self, header: usize) -> usize {
        let depth = self.indent(header);
        let mut end = header + 1;
        let mut last_code = header;
        while end < self.len() {
            if !self.lower(end).is_empty() {
                if self.indent(end) <= depth {
                    break;
                }
                last_code = end;
            }
            end += 1;
        }
        last_code + 1
    }

    pub fn code_lines(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len()).filter(move |&i| self.is_code(i))
    }
}

pub fn is_loop_header(lower: &str) -> bool {
    lower.starts_with("for ")
        || lower.starts_with("for(")
        || lower.starts_with("async for ")
        || lower.starts_with("while ")
        || lower.starts_with("while(")
        || lower.contains(".foreach(")
}

pub fn is_function_header(lower: &str) -> bool {
    lower.starts_with("def ")
        || lower.starts_with("async def ")
        || lower.starts_with("function ")
        || lower.starts_with("async function ")
}

pub fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

// ---------------------------------------------------------------------------
// LineContext
// ---------------------------------------------------------------------------

/// One code line handed to a rule predicate.
pub struct LineContext<'v, 'a> {
    pub view: &'v SourceView<'a>,
    pub index: usize,
}

impl<'v, 'a> LineContext<'v, 'a> {
    pub fn raw(&self) -> &str {
        self.view.raw(self.index)
    }

    pub fn lower(&self) -> &str {
        self.view.lower(self.index)
    }

    pub fn has(&self, needles: &[&str]) -> bool {
        contains_any(self.lower(), needles)
    }

    pub fn raw_has(&self, needles: &[&str]) -> bool {
        contains_any(self.raw(), needles)
    }

    /// Any line in `[index - before, index + after]` contains a needle.
    pub fn around_has(&self, before: usize, after: usize, needles: &[&str]) -> bool {
        let start = self.index.saturating_sub(before);
        self.view
            .lowered_range(start, self.index + after + 1)
            .any(|l| contains_any(l, needles))
    }

    /// Any of the next `n` lines contains a needle.
    pub fn next_has(&self, n: usize, needles: &[&str]) -> bool {
        self.view
            .lowered_range(self.index + 1, self.index + 1 + n)
            .any(|l| contains_any(l, needles))
    }

    /// Any of the previous `n` lines contains a needle.
    pub fn prev_has(&self, n: usize, needles: &[&str]) -> bool {
        self.view
            .lowered_range(self.index.saturating_sub(n), self.index)
            .any(|l| contains_any(l, needles))
    }

    /// Line sits in a loop body, or is a one-line loop itself.
    pub fn in_loop(&self) -> bool {
        let lower = self.lower();
        (is_loop_header(lower) && lower.contains(':') && !lower.ends_with(':'))
            || self
                .view
                .enclosing(self.index)
                .any(|j| is_loop_header(self.view.lower(j)))
    }

    pub fn enclosing_function(&self) -> Option<usize> {
        self.view
            .enclosing(self.index)
            .find(|&j| is_function_header(self.view.lower(j)))
    }

    /// Line belongs to (or declares) an `async` function.
    pub fn in_async(&self) -> bool {
        let lower = self.lower();
        if lower.starts_with("async def ") || lower.starts_with("async function ") {
            return true;
        }
        self.enclosing_function()
            .map(|j| self.view.lower(j).starts_with("async "))
            .unwrap_or(false)
    }

    /// Line is inside a test function or test class.
    pub fn in_test(&self) -> bool {
        std::iter::once(self.index)
            .chain(self.view.enclosing(self.index))
            .any(|j| {
                let l = self.view.lower(j);
                l.starts_with("def test") || l.starts_with("class test")
            })
    }
}

// ---------------------------------------------------------------------------
// Rule tables
// ---------------------------------------------------------------------------

pub struct LineRule {
    pub id: &'static str,
    pub severity: Severity,
    pub message: &'static str,
    pub applies: fn(&LineContext<'_, '_>) -> bool,
}

/// Finding produced by a whole-file pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Hit {
    pub rule_id: &'static str,
    pub severity: Severity,
    pub message: String,
    pub line: usize,
}

impl Hit {
    pub fn new(
        rule_id: &'static str,
        severity: Severity,
        message: impl Into<String>,
        line: usize,
    ) -> Self {
        Self {
            rule_id,
            severity,
            message: message.into(),
            line,
        }
    }
}

pub type FilePass = fn(&SourceView<'_>, &Deadline) -> VigilResult<Vec<Hit>>;

pub struct RuleSet {
    pub category: Category,
    pub rules: &'static [LineRule],
    pub file_pass: Option<FilePass>,
    /// Rule id → canonical suggestion, in presentation order.
    pub suggestions: &'static [(&'static str, &'static str)],
}

impl RuleSet {
    pub fn evaluate(&self, view: &SourceView<'_>, deadline: &Deadline) -> VigilResult<Vec<Finding>> {
        let mut findings = Vec::new();
        deadline.check("detecting")?;
        let mut ticker = deadline.ticker("detecting");
        for index in view.code_lines() {
            ticker.tick()?;
            let ctx = LineContext { view, index };
            for rule in self.rules {
                if (rule.applies)(&ctx) {
                    findings.push(Finding::new(
                        self.category,
                        rule.id,
                        rule.severity,
                        rule.message,
                        index + 1,
                    ));
                }
            }
        }
        if let Some(pass) = self.file_pass {
            deadline.check("detecting")?;
            for hit in pass(view, deadline)? {
                findings.push(Finding::new(
                    self.category,
                    hit.rule_id,
                    hit.severity,
                    hit.message,
                    hit.line,
                ));
            }
        }
        debug_assert!(findings.iter().all(|f| self.category.owns(&f.rule_id)));
        findings.sort_by_key(|f| f.line);
        Ok(findings)
    }

    pub fn suggestion_for(&self, rule_id: &str) -> Option<&'static str> {
        self.suggestions
            .iter()
            .find(|(id, _)| *id == rule_id)
            .map(|(_, text)| *text)
    }
}
