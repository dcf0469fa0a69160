//! Algorithmic-efficiency rules: quadratic loops, unmemoized recursion,
//! repeated allocation and per-iteration I/O.

use std::sync::LazyLock;

use regex::Regex;

use crate::analysis::rules::{is_loop_header, LineContext, LineRule, RuleSet};
use crate::models::{Category, Severity};

type Ctx<'v, 'a> = LineContext<'v, 'a>;

static SWAP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\w+\[[^\]]+\]\s*,\s*\w+\[[^\]]+\]\s*=\s*\w+\[[^\]]+\]\s*,\s*\w+\[").unwrap()
});

static INDEXED_EQ_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\w+\[\w+\]\s*==\s*\w+\[\w+\]").unwrap());

static DEF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:async\s+)?def\s+([a-z_][a-z0-9_]*)\s*\(").unwrap());

static LIST_CONCAT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\w+)\s*(?:\+=\s*\[|=\s*(\w+)\s*\+\s*\[)").unwrap());

static GROUP_INIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^if\s+(\w+)\s+not\s+in\s+(\w+)\s*:").unwrap());

static STRING_CONCAT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^\w+\s*\+=\s*(?:f?["']|str\()"#).unwrap());

static LIST_MEMBERSHIP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bif\s+\w+\s+(?:not\s+)?in\s+\w*(?:list|_items|array)\s*:").unwrap());

const MANUAL_SORT_NAMES: &[&str] = &[
    "bubble_sort",
    "selection_sort",
    "insertion_sort",
    "bubblesort",
    "my_sort",
    "manual_sort",
    "custom_sort",
];

/// Inner loop header nested in another loop.
fn inner_loop(ctx: &Ctx<'_, '_>) -> bool {
    is_loop_header(ctx.lower())
        && ctx
            .view
            .enclosing(ctx.index)
            .any(|j| is_loop_header(ctx.view.lower(j)))
}

fn inner_loop_body_matches(ctx: &Ctx<'_, '_>, re: &Regex) -> bool {
    let end = ctx.view.block_end(ctx.index);
    ctx.view.lowered_range(ctx.index + 1, end).any(|l| re.is_match(l))
}

fn o2_sorting(ctx: &Ctx<'_, '_>) -> bool {
    inner_loop(ctx) && inner_loop_body_matches(ctx, &SWAP_RE)
}

fn o2_duplicate(ctx: &Ctx<'_, '_>) -> bool {
    inner_loop(ctx) && !o2_sorting(ctx) && inner_loop_body_matches(ctx, &INDEXED_EQ_RE)
}

fn o2_nested_loop(ctx: &Ctx<'_, '_>) -> bool {
    inner_loop(ctx)
        && ctx.has(&["range("])
        && !inner_loop_body_matches(ctx, &SWAP_RE)
        && !inner_loop_body_matches(ctx, &INDEXED_EQ_RE)
}

/// Function calling itself at least twice with no memoization.
fn exponential_recursion(ctx: &Ctx<'_, '_>) -> bool {
    let Some(caps) = DEF_RE.captures(ctx.lower()) else {
        return false;
    };
    let call = format!("{}(", &caps[1]);
    let end = ctx.view.block_end(ctx.index);
    let self_calls: usize = ctx
        .view
        .lowered_range(ctx.index + 1, end)
        .map(|l| l.matches(call.as_str()).count())
        .sum();
    self_calls >= 2
        && !ctx.prev_has(2, &["lru_cache", "@cache", "memoize"])
        && !ctx.view.lowered_range(ctx.index, end).any(|l| l.contains("memo"))
}

fn linear_search(ctx: &Ctx<'_, '_>) -> bool {
    ctx.in_loop() && (ctx.has(&[".index("]) || LIST_MEMBERSHIP_RE.is_match(ctx.lower()))
}

fn list_concat(ctx: &Ctx<'_, '_>) -> bool {
    LIST_CONCAT_RE
        .captures(ctx.lower())
        .is_some_and(|c| c.get(2).map_or(true, |rhs| rhs.as_str() == &c[1]))
}

fn inefficient_concat(ctx: &Ctx<'_, '_>) -> bool {
    list_concat(ctx) && !ctx.in_loop()
}

fn list_concat_in_loop(ctx: &Ctx<'_, '_>) -> bool {
    list_concat(ctx) && ctx.in_loop()
}

/// `if k not in groups:` followed by `groups[k] = []`.
fn manual_grouping(ctx: &Ctx<'_, '_>) -> bool {
    let Some(caps) = GROUP_INIT_RE.captures(ctx.lower()) else {
        return false;
    };
    let init = format!("{}[{}] = []", &caps[2], &caps[1]);
    ctx.next_has(2, &[init.as_str()])
}

fn manual_sort(ctx: &Ctx<'_, '_>) -> bool {
    DEF_RE
        .captures(ctx.lower())
        .is_some_and(|c| MANUAL_SORT_NAMES.contains(&&c[1]))
}

fn string_concat(ctx: &Ctx<'_, '_>) -> bool {
    ctx.in_loop() && STRING_CONCAT_RE.is_match(ctx.lower())
}

fn nested_comprehension(ctx: &Ctx<'_, '_>) -> bool {
    let lower = ctx.lower();
    (lower.contains('[') || lower.contains('{')) && lower.matches(" for ").count() >= 2
}

fn file_read(ctx: &Ctx<'_, '_>) -> bool {
    ctx.in_loop() && ctx.has(&["open(", ".readlines()", ".read()"]) && !is_loop_header(ctx.lower())
}

fn db_query(ctx: &Ctx<'_, '_>) -> bool {
    ctx.in_loop() && ctx.has(&["cursor.execute(", ".execute(", "session.query(", ".objects."])
}

fn network_request(ctx: &Ctx<'_, '_>) -> bool {
    ctx.in_loop()
        && ctx.has(&[
            "requests.get(",
            "requests.post(",
            "urlopen(",
            "httpx.get(",
            "httpx.post(",
            "session.get(",
        ])
}

fn object_copy(ctx: &Ctx<'_, '_>) -> bool {
    ctx.in_loop() && ctx.has(&["deepcopy(", "copy.copy("])
}

fn regex_compile(ctx: &Ctx<'_, '_>) -> bool {
    ctx.in_loop() && ctx.has(&["re.compile("])
}

pub static RULES: &[LineRule] = &[
    LineRule {
        id: "ALG_O2_SORTING",
        severity: Severity::High,
        message: "O(n²) sorting algorithm detected - use built-in sorted() for O(n log n) complexity",
        applies: o2_sorting,
    },
    LineRule {
        id: "ALG_O2_DUPLICATE",
        severity: Severity::High,
        message: "O(n²) duplicate detection - use set() for O(n) complexity",
        applies: o2_duplicate,
    },
    LineRule {
        id: "ALG_O2_NESTED_LOOP",
        severity: Severity::Medium,
        message: "O(n²) nested loop pattern detected - consider optimization",
        applies: o2_nested_loop,
    },
    LineRule {
        id: "ALG_EXPONENTIAL_RECURSION",
        severity: Severity::Critical,
        message: "Exponential recursion detected - use @lru_cache or iterative DP for O(n) complexity",
        applies: exponential_recursion,
    },
    LineRule {
        id: "ALG_LINEAR_SEARCH",
        severity: Severity::Medium,
        message: "Linear search inside a loop - use a set or dict for O(1) lookups",
        applies: linear_search,
    },
    LineRule {
        id: "ALG_INEFFICIENT_CONCAT",
        severity: Severity::Medium,
        message: "Inefficient list concatenation - creates new list each time O(n)",
        applies: inefficient_concat,
    },
    LineRule {
        id: "ALG_LIST_CONCAT_IN_LOOP",
        severity: Severity::Medium,
        message: "List concatenation in loop reallocates each time - use append() or extend() for O(1) amortized",
        applies: list_concat_in_loop,
    },
    LineRule {
        id: "ALG_MANUAL_GROUPING",
        severity: Severity::Medium,
        message: "Manual grouping pattern detected - use collections.defaultdict(list) for better performance",
        applies: manual_grouping,
    },
    LineRule {
        id: "ALG_MANUAL_SORT",
        severity: Severity::High,
        message: "Manual sorting algorithm - use built-in sorted() or list.sort() for better performance",
        applies: manual_sort,
    },
    LineRule {
        id: "ALG_STRING_CONCAT",
        severity: Severity::Medium,
        message: "String concatenation in loop - use join() for O(n) instead of O(n²)",
        applies: string_concat,
    },
    LineRule {
        id: "ALG_NESTED_COMPREHENSION",
        severity: Severity::Low,
        message: "Nested list comprehension - consider flattening or using itertools",
        applies: nested_comprehension,
    },
    LineRule {
        id: "ALG_FILE_READ",
        severity: Severity::Medium,
        message: "File reading in loop - read entire file once for better performance",
        applies: file_read,
    },
    LineRule {
        id: "ALG_DB_QUERY",
        severity: Severity::High,
        message: "Database query in loop - use bulk operations or joins",
        applies: db_query,
    },
    LineRule {
        id: "ALG_NETWORK_REQUEST",
        severity: Severity::High,
        message: "Network request in loop - use connection pooling or async requests",
        applies: network_request,
    },
    LineRule {
        id: "ALG_OBJECT_COPY",
        severity: Severity::Medium,
        message: "Object copying in loop - consider reusing objects or shallow copies",
        applies: object_copy,
    },
    LineRule {
        id: "ALG_REGEX_COMPILE",
        severity: Severity::Low,
        message: "Regex compiled on every loop iteration - compile once outside the loop",
        applies: regex_compile,
    },
];

pub static SUGGESTIONS: &[(&str, &str)] = &[
    ("ALG_O2_SORTING", "Replace manual sorting algorithms with built-in sorted() for O(n log n) complexity"),
    ("ALG_O2_DUPLICATE", "Use set() for duplicate detection instead of nested loops for O(n) complexity"),
    ("ALG_O2_NESTED_LOOP", "Optimize nested loops - consider using built-in functions or data structures"),
    ("ALG_EXPONENTIAL_RECURSION", "Use @lru_cache decorator or iterative approach for exponential recursion to achieve O(n) complexity"),
    ("ALG_LINEAR_SEARCH", "Use binary search for sorted data or consider using set/dict for O(1) lookups"),
    ("ALG_INEFFICIENT_CONCAT", "Use list.extend() or += operator instead of + for list concatenation"),
    ("ALG_LIST_CONCAT_IN_LOOP", "Use list.append() or list.extend() instead of concatenation in loops for better performance"),
    ("ALG_MANUAL_GROUPING", "Use collections.defaultdict(list) instead of manual grouping for better performance"),
    ("ALG_MANUAL_SORT", "Use built-in sorting functions instead of implementing manual algorithms"),
    ("ALG_STRING_CONCAT", "Use str.join() instead of string concatenation in loops"),
    ("ALG_NESTED_COMPREHENSION", "Flatten nested comprehensions or use itertools.chain for better readability"),
    ("ALG_FILE_READ", "Read entire file once instead of reading in loops"),
    ("ALG_DB_QUERY", "Use bulk operations, joins, or batch processing for database queries"),
    ("ALG_NETWORK_REQUEST", "Use connection pooling, async requests, or batch API calls"),
    ("ALG_OBJECT_COPY", "Reuse objects or use shallow copies instead of deep copying in loops"),
    ("ALG_REGEX_COMPILE", "Compile regex patterns once outside the loop for better performance"),
];

pub static RULE_SET: RuleSet = RuleSet {
    category: Category::Algorithmic,
    rules: RULES,
    file_pass: None,
    suggestions: SUGGESTIONS,
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::rules::test_support::{ids, lines_of, run};

    #[test]
    fn test_bubble_sort_shape() {
        let src = "\
def bubble_sort(arr):
    for i in range(len(arr)):
        for j in range(len(arr) - 1):
            if arr[j] > arr[j + 1]:
                arr[j], arr[j + 1] = arr[j + 1], arr[j]
";
        let findings = run(&RULE_SET, src);
        assert_eq!(lines_of(&findings, "ALG_MANUAL_SORT"), vec![1]);
        assert_eq!(lines_of(&findings, "ALG_O2_SORTING"), vec![3]);
        assert!(lines_of(&findings, "ALG_O2_NESTED_LOOP").is_empty());
    }

    #[test]
    fn test_duplicate_scan_and_plain_nested_loop() {
        let src = "\
for i in range(n):
    for j in range(i + 1, n):
        if items[i] == items[j]:
            dupes.append(items[i])
for x in range(w):
    for y in range(h):
        grid.paint(x, y)
";
        let findings = run(&RULE_SET, src);
        assert_eq!(lines_of(&findings, "ALG_O2_DUPLICATE"), vec![2]);
        assert_eq!(lines_of(&findings, "ALG_O2_NESTED_LOOP"), vec![6]);
    }

    #[test]
    fn test_exponential_recursion_and_memoized_variant() {
        let naive = "\
def fib(n):
    if n < 2:
        return n
    return fib(n - 1) + fib(n - 2)
";
        let findings = run(&RULE_SET, naive);
        assert_eq!(lines_of(&findings, "ALG_EXPONENTIAL_RECURSION"), vec![1]);
        assert_eq!(findings[0].severity, Severity::Critical);

        let cached = format!("@lru_cache(maxsize=None)\n{naive}");
        assert!(lines_of(&run(&RULE_SET, &cached), "ALG_EXPONENTIAL_RECURSION").is_empty());
    }

    #[test]
    fn test_list_concat_inside_and_outside_loops() {
        let src = "\
result = result + [1]
for x in xs:
    acc = acc + [x]
    acc += [x]
";
        let findings = run(&RULE_SET, src);
        assert_eq!(lines_of(&findings, "ALG_INEFFICIENT_CONCAT"), vec![1]);
        assert_eq!(lines_of(&findings, "ALG_LIST_CONCAT_IN_LOOP"), vec![3, 4]);
    }

    #[test]
    fn test_manual_grouping() {
        let src = "\
for row in rows:
    if key not in groups:
        groups[key] = []
    groups[key].append(row)
";
        assert_eq!(lines_of(&run(&RULE_SET, src), "ALG_MANUAL_GROUPING"), vec![2]);
    }

    #[test]
    fn test_per_iteration_work() {
        let src = "\
for url in urls:
    pattern = re.compile(r'\\d+')
    body = requests.get(url)
    snapshot = copy.deepcopy(state)
    text = open(url).read()
";
        let findings = run(&RULE_SET, src);
        assert_eq!(lines_of(&findings, "ALG_REGEX_COMPILE"), vec![2]);
        assert_eq!(lines_of(&findings, "ALG_NETWORK_REQUEST"), vec![3]);
        assert_eq!(lines_of(&findings, "ALG_OBJECT_COPY"), vec![4]);
        assert_eq!(lines_of(&findings, "ALG_FILE_READ"), vec![5]);
    }

    #[test]
    fn test_nested_comprehension() {
        let src = "flat = [x for row in grid for x in row]\nok = [x for x in xs]\n";
        assert_eq!(lines_of(&run(&RULE_SET, src), "ALG_NESTED_COMPREHENSION"), vec![1]);
    }

    #[test]
    fn test_straight_line_code_is_quiet() {
        assert!(ids(&run(&RULE_SET, "def f():\n    return 1\n")).is_empty());
    }

    #[test]
    fn test_every_rule_has_a_suggestion() {
        for rule in RULES {
            assert!(Category::Algorithmic.owns(rule.id), "{}", rule.id);
            assert!(RULE_SET.suggestion_for(rule.id).is_some(), "{}", rule.id);
        }
    }
}
