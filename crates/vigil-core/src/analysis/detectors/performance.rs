//! Performance rules: query patterns in loops, blocking calls in async code,
//! per-iteration work that could be hoisted.

use std::sync::LazyLock;

use regex::Regex;

use crate::analysis::rules::{is_loop_header, LineContext, LineRule, RuleSet};
use crate::models::{Category, Severity};

type Ctx<'v, 'a> = LineContext<'v, 'a>;

/// Lines after a loop header scanned for per-row queries.
const N_PLUS_ONE_LOOKAHEAD: usize = 10;

static RANGE_LEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"for\s+\w+\s+in\s+range\s*\(\s*len\s*\(").unwrap());

static WILDCARD_IMPORT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^from\s+\S+\s+import\s+\*").unwrap());

static LOOP_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:async\s+)?for\s+\(?(\w+)").unwrap());

static STRING_ACCUM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^(\w+)\s*(?:\+=|=\s*(\w+)\s*\+)\s*(?:f?["']|str\()"#).unwrap()
});

static NO_ARG_CONSTRUCTOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"=\s*[A-Z][A-Za-z0-9_]*\(\s*\)").unwrap());

const ORM_QUERIES: &[&str] = &[
    ".objects.get(",
    ".objects.filter(",
    ".objects.all(",
    ".objects.exclude(",
    "session.query(",
    ".query.filter",
    ".query.get(",
    "cursor.execute(",
    ".find_one(",
    ".fetchone(",
];

const HTTP_BLOCKING: &[&str] = &[
    "requests.get(",
    "requests.post(",
    "requests.put(",
    "requests.delete(",
    "requests.patch(",
    "urllib.request.urlopen(",
    "urlopen(",
];

fn range_len(ctx: &Ctx<'_, '_>) -> bool {
    RANGE_LEN_RE.is_match(ctx.lower())
}

/// `for x in xs:` whose only body line appends to a list.
fn list_comprehension_candidate(ctx: &Ctx<'_, '_>) -> bool {
    if !ctx.lower().contains(".append(") {
        return false;
    }
    let Some(parent) = ctx.view.enclosing(ctx.index).next() else {
        return false;
    };
    let header = ctx.view.lower(parent);
    header.starts_with("for ") && ctx.view.block_end(parent) == ctx.index + 1 && ctx.index == parent + 1
}

fn wildcard_import(ctx: &Ctx<'_, '_>) -> bool {
    WILDCARD_IMPORT_RE.is_match(ctx.lower())
}

fn n_plus_one(ctx: &Ctx<'_, '_>) -> bool {
    let lower = ctx.lower();
    if !(is_loop_header(lower) && lower.ends_with(':')) {
        return false;
    }
    let Some(var) = LOOP_VAR_RE.captures(lower).map(|c| c[1].to_string()) else {
        return false;
    };
    let end = ctx.view.block_end(ctx.index).min(ctx.index + 1 + N_PLUS_ONE_LOOKAHEAD);
    let related = [
        format!("{var}.id"),
        format!("{var}_id"),
        format!("={var}"),
        format!("= {var}"),
    ];
    ctx.view.lowered_range(ctx.index + 1, end).any(|line| {
        let queries = ORM_QUERIES.iter().any(|q| line.contains(q));
        let references_row = related.iter().any(|r| line.contains(r.as_str()));
        let lazy_relation = line.contains(&format!("{var}."))
            && (line.contains("_set.") || line.contains(".all()") || line.contains(".count()"));
        (queries && references_row) || lazy_relation
    })
}

fn orm_in_loop(ctx: &Ctx<'_, '_>) -> bool {
    ctx.in_loop() && ctx.has(ORM_QUERIES)
}

fn missing_eager_loading(ctx: &Ctx<'_, '_>) -> bool {
    ctx.has(&[".objects.all(", ".objects.filter("])
        && !ctx.has(&["select_related", "prefetch_related"])
        && ctx.next_has(3, &["for "])
}

fn aggregation_in_loop(ctx: &Ctx<'_, '_>) -> bool {
    ctx.in_loop()
        && ctx.has(&[
            ".count()",
            ".aggregate(",
            ".annotate(",
            "func.count(",
            "func.sum(",
        ])
}

fn nested_loop_queries(ctx: &Ctx<'_, '_>) -> bool {
    let loops = ctx
        .view
        .enclosing(ctx.index)
        .filter(|&j| is_loop_header(ctx.view.lower(j)))
        .count();
    loops >= 2 && ctx.has(ORM_QUERIES)
}

fn blocking_http_in_async(ctx: &Ctx<'_, '_>) -> bool {
    ctx.in_async() && ctx.has(HTTP_BLOCKING)
}

fn string_concat_in_loop(ctx: &Ctx<'_, '_>) -> bool {
    if !ctx.in_loop() {
        return false;
    }
    STRING_ACCUM_RE
        .captures(ctx.lower())
        .map(|caps| caps.get(2).map_or(true, |rhs| rhs.as_str() == &caps[1]))
        .unwrap_or(false)
}

fn lock_without_context(ctx: &Ctx<'_, '_>) -> bool {
    ctx.has(&[".acquire()"]) && !ctx.has(&["await ", "with "])
}

fn object_construction_in_loop(ctx: &Ctx<'_, '_>) -> bool {
    ctx.in_loop() && NO_ARG_CONSTRUCTOR_RE.is_match(ctx.raw())
}

pub static RULES: &[LineRule] = &[
    LineRule {
        id: "PERF_ENUMERATE",
        severity: Severity::Low,
        message: "Use enumerate() instead of range(len())",
        applies: range_len,
    },
    LineRule {
        id: "PERF_LIST_COMP",
        severity: Severity::Low,
        message: "Loop only appends to a list - consider a list comprehension",
        applies: list_comprehension_candidate,
    },
    LineRule {
        id: "PERF_WILDCARD_IMPORT",
        severity: Severity::Medium,
        message: "Wildcard import pulls every public name into the module",
        applies: wildcard_import,
    },
    LineRule {
        id: "PERF_N_PLUS_ONE_QUERY",
        severity: Severity::High,
        message: "N+1 query problem detected - use select_related() or prefetch_related() for eager loading",
        applies: n_plus_one,
    },
    LineRule {
        id: "PERF_ORM_IN_LOOP",
        severity: Severity::High,
        message: "Database query executed inside a loop",
        applies: orm_in_loop,
    },
    LineRule {
        id: "PERF_MISSING_EAGER_LOADING",
        severity: Severity::Medium,
        message: "Missing select_related/prefetch_related - add eager loading for related fields",
        applies: missing_eager_loading,
    },
    LineRule {
        id: "PERF_AGGREGATION_IN_LOOP",
        severity: Severity::High,
        message: "Aggregation query inside a loop - aggregate once in the database",
        applies: aggregation_in_loop,
    },
    LineRule {
        id: "PERF_NESTED_LOOP_QUERIES",
        severity: Severity::High,
        message: "Query inside nested loops - quadratic database round trips",
        applies: nested_loop_queries,
    },
    LineRule {
        id: "PERF_BLOCKING_IN_ASYNC",
        severity: Severity::Medium,
        message: "Blocking HTTP call inside an async function",
        applies: blocking_http_in_async,
    },
    LineRule {
        id: "PERF_STRING_CONCAT_LOOP",
        severity: Severity::Medium,
        message: "String built by concatenation inside a loop",
        applies: string_concat_in_loop,
    },
    LineRule {
        id: "PERF_LOCK_WITHOUT_CONTEXT",
        severity: Severity::High,
        message: "Lock acquired without a context manager - release is not guaranteed",
        applies: lock_without_context,
    },
    LineRule {
        id: "PERF_UNNECESSARY_OBJECTS",
        severity: Severity::Low,
        message: "Argument-free object constructed on every iteration - hoist it out of the loop",
        applies: object_construction_in_loop,
    },
];

pub static SUGGESTIONS: &[(&str, &str)] = &[
    ("PERF_ENUMERATE", "Use enumerate() when you need both index and value"),
    ("PERF_LIST_COMP", "Use list comprehensions instead of append loops"),
    ("PERF_WILDCARD_IMPORT", "Import only the names you need instead of using wildcard imports"),
    ("PERF_N_PLUS_ONE_QUERY", "Use select_related() or prefetch_related() to avoid N+1 queries"),
    ("PERF_ORM_IN_LOOP", "Fetch rows in bulk before the loop instead of querying per iteration"),
    ("PERF_MISSING_EAGER_LOADING", "Add eager loading for related fields you iterate over"),
    ("PERF_AGGREGATION_IN_LOOP", "Move aggregations into a single annotate()/aggregate() query"),
    ("PERF_NESTED_LOOP_QUERIES", "Replace queries in nested loops with joins or a pre-built lookup dict"),
    ("PERF_BLOCKING_IN_ASYNC", "Use an async HTTP client (httpx, aiohttp) inside async functions"),
    ("PERF_STRING_CONCAT_LOOP", "Collect string parts in a list and join them once"),
    ("PERF_LOCK_WITHOUT_CONTEXT", "Acquire locks with a with-statement so they are always released"),
    ("PERF_UNNECESSARY_OBJECTS", "Create invariant objects once outside the loop"),
];

pub static RULE_SET: RuleSet = RuleSet {
    category: Category::Performance,
    rules: RULES,
    file_pass: None,
    suggestions: SUGGESTIONS,
};
