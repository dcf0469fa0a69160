//! Memory rules: unbounded growth of caches, lists, handlers and sessions,
//! leaked file handles, reference cycles.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::analysis::budget::Deadline;
use crate::analysis::rules::{
    contains_any, is_function_header, Hit, LineContext, LineRule, RuleSet, SourceView,
};
use crate::errors::VigilResult;
use crate::models::{Category, Severity};

type Ctx<'v, 'a> = LineContext<'v, 'a>;

static CACHE_STORE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\w*cache\w*\[[^\]]+\]\s*=[^=]").unwrap());

static LARGE_DATASET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\[[^\]]*\]\s*\*\s*\d{6,}|list\(\s*range\(\s*\d{6,}|range\(\s*\d{7,})").unwrap()
});

static LARGE_ALLOC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:\[[^\]]*\]\s*\*\s*\d{4,}|bytearray\(\s*\d{5,}|\b(?:np|numpy)\.(?:zeros|ones|empty)\()",
    )
    .unwrap()
});

static CYCLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:\w+\.(?:parent|owner|container|back_ref)\s*=\s*self\b|\.(?:children|nodes|items)\.append\(\s*self\s*\))",
    )
    .unwrap()
});

static SESSION_STORE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:sessions|session_store|active_sessions|user_sessions)\[[^\]]+\]\s*=[^=]").unwrap()
});

static INSTANCE_REGISTRY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\.(?:_?instances|registry|all_instances|_registry)\.(?:append|add)\(\s*self\s*\)")
        .unwrap()
});

static TEMP_STORE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:temp|tmp)\w*(?:\[[^\]]+\]\s*=[^=]|\.append\()").unwrap()
});

static TASK_ACCUM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\w*tasks\w*\.(?:append|add)\(\s*(?:asyncio\.)?(?:create_task|ensure_future)\(")
        .unwrap()
});

static GLOBAL_CONTAINER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-z_][a-z0-9_]*)\s*=\s*(?:\[\]|\{\}|set\(\)|dict\(\)|list\(\))\s*$").unwrap()
});

static OPEN_ASSIGN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([a-z_][a-z0-9_]*)\s*=\s*(?:io\.)?open\(").unwrap());

const EVICTION_MARKERS: &[&str] = &[
    "maxsize",
    "lru",
    "ttl",
    ".pop(",
    "popitem",
    "del ",
    ".clear()",
    "evict",
    "expire",
];

fn cache_growth(ctx: &Ctx<'_, '_>) -> bool {
    CACHE_STORE_RE.is_match(ctx.lower()) && !contains_any(ctx.view.lower_text(), EVICTION_MARKERS)
}

fn event_handlers(ctx: &Ctx<'_, '_>) -> bool {
    let registers = (ctx.has(&[".append(", ".add("])
        && ctx.has(&["handler", "listener", "callback", "subscriber"]))
        || ctx.has(&["addeventlistener(", ".on("]);
    registers
        && !contains_any(
            ctx.view.lower_text(),
            &["remove", "unsubscribe", "off(", "discard("],
        )
}

fn large_dataset(ctx: &Ctx<'_, '_>) -> bool {
    LARGE_DATASET_RE.is_match(ctx.lower())
}

fn large_objects_in_loop(ctx: &Ctx<'_, '_>) -> bool {
    ctx.in_loop() && LARGE_ALLOC_RE.is_match(ctx.lower())
}

/// Nested function defined inside a function that loads bulk data.
fn closure_capture(ctx: &Ctx<'_, '_>) -> bool {
    if !is_function_header(ctx.lower()) {
        return false;
    }
    let Some(outer) = ctx.enclosing_function() else {
        return false;
    };
    ctx.view
        .lowered_range(outer + 1, ctx.index)
        .any(|l| contains_any(l, &[".read()", ".readlines()", "json.load(", "pd.read_", "np.load("]))
}

fn cache_no_limits(ctx: &Ctx<'_, '_>) -> bool {
    let lower = ctx.lower();
    lower == "@cache" || lower == "@functools.cache" || lower.contains("maxsize=none")
}

/// Append inside a `while` loop whose body never trims the list.
fn list_accumulation(ctx: &Ctx<'_, '_>) -> bool {
    if !ctx.has(&[".append("]) {
        return false;
    }
    let Some(header) = ctx
        .view
        .enclosing(ctx.index)
        .find(|&j| ctx.view.lower(j).starts_with("while "))
    else {
        return false;
    };
    let end = ctx.view.block_end(header);
    !ctx.view
        .lowered_range(header, end)
        .any(|l| contains_any(l, &[".pop(", ".clear()", "del ", "[-", "maxlen", "break"]))
}

fn circular_reference(ctx: &Ctx<'_, '_>) -> bool {
    CYCLE_RE.is_match(ctx.lower()) && !ctx.view.lower_text().contains("weakref")
}

fn session_accumulation(ctx: &Ctx<'_, '_>) -> bool {
    SESSION_STORE_RE.is_match(ctx.lower())
        && !contains_any(ctx.view.lower_text(), &["del ", ".pop(", "expire", "cleanup"])
}

fn instance_collection(ctx: &Ctx<'_, '_>) -> bool {
    INSTANCE_REGISTRY_RE.is_match(ctx.lower()) && !ctx.view.lower_text().contains("weakref")
}

fn temp_storage(ctx: &Ctx<'_, '_>) -> bool {
    TEMP_STORE_RE.is_match(ctx.lower())
        && !contains_any(ctx.view.lower_text(), &[".clear()", "del ", ".pop("])
}

fn request_history(ctx: &Ctx<'_, '_>) -> bool {
    ctx.has(&[
        "history.append(",
        "request_log.append(",
        "requests_log.append(",
        "request_history.append(",
        "access_log.append(",
    ]) && !contains_any(ctx.view.lower_text(), &["maxlen", ".pop(", "[-"])
}

fn background_tasks(ctx: &Ctx<'_, '_>) -> bool {
    TASK_ACCUM_RE.is_match(ctx.lower())
        && !contains_any(
            ctx.view.lower_text(),
            &["add_done_callback", ".discard(", ".remove(", ".clear()"],
        )
}

/// Module-level containers mutated from inside functions and never trimmed;
/// `open()` handles that are never closed or managed.
fn file_pass(view: &SourceView<'_>, deadline: &Deadline) -> VigilResult<Vec<Hit>> {
    let mut hits = Vec::new();
    let mut ticker = deadline.ticker("detecting");

    let globals: Vec<String> = view
        .code_lines()
        .filter(|&i| view.indent(i) == 0)
        .filter_map(|i| GLOBAL_CONTAINER_RE.captures(view.lower(i)).map(|c| c[1].to_string()))
        .collect();
    let mut reported: HashSet<&str> = HashSet::new();
    for name in &globals {
        let trims = [
            format!("{name}.clear()"),
            format!("{name}.pop("),
            format!("del {name}["),
            format!("{name} = "),
        ];
        let growth = [
            format!("{name}.append("),
            format!("{name}.add("),
            format!("{name}.update("),
            format!("{name}["),
        ];
        let mut first_growth = None;
        let mut trimmed = false;
        for i in view.code_lines().filter(|&i| view.indent(i) > 0) {
            ticker.tick()?;
            let line = view.lower(i);
            if trims.iter().any(|t| line.contains(t.as_str())) {
                trimmed = true;
            }
            let grows = growth.iter().any(|g| line.contains(g.as_str()))
                && (line.contains(".append(")
                    || line.contains(".add(")
                    || line.contains(".update(")
                    || line.contains("] ="));
            if grows && first_growth.is_none() {
                first_growth = Some(i);
            }
        }
        if let (Some(line), false) = (first_growth, trimmed) {
            if reported.insert(name.as_str()) {
                hits.push(Hit::new(
                    "MEM_GLOBAL_GROWTH",
                    Severity::Medium,
                    format!("Global '{name}' grows without bound - add a size limit or cleanup"),
                    line + 1,
                ));
            }
        }
    }

    for i in view.code_lines() {
        ticker.tick()?;
        let Some(caps) = OPEN_ASSIGN_RE.captures(view.lower(i)) else {
            continue;
        };
        let var = &caps[1];
        let close_call = format!("{var}.close()");
        let with_block = format!("with {var}");
        let mut closed = false;
        for later in view.lowered_range(i + 1, view.len()) {
            ticker.tick()?;
            if later.contains(&close_call) || later.contains(&with_block) {
                closed = true;
                break;
            }
        }
        if !closed {
            hits.push(Hit::new(
                "MEM_FILE_HANDLE_LEAK",
                Severity::High,
                format!("File handle '{var}' opened without being closed - use a with-statement"),
                i + 1,
            ));
        }
    }
    Ok(hits)
}

pub static RULES: &[LineRule] = &[
    LineRule {
        id: "MEM_CACHE_GROWTH",
        severity: Severity::High,
        message: "Cache grows without eviction - unbounded memory use",
        applies: cache_growth,
    },
    LineRule {
        id: "MEM_EVENT_HANDLERS",
        severity: Severity::Medium,
        message: "Event handlers registered but never removed",
        applies: event_handlers,
    },
    LineRule {
        id: "MEM_LARGE_DATASETS",
        severity: Severity::Medium,
        message: "Very large in-memory dataset materialized at once",
        applies: large_dataset,
    },
    LineRule {
        id: "MEM_LARGE_OBJECTS",
        severity: Severity::Low,
        message: "Large allocation repeated on every loop iteration",
        applies: large_objects_in_loop,
    },
    LineRule {
        id: "MEM_CLOSURE_CAPTURE",
        severity: Severity::Medium,
        message: "Nested function may capture bulk data loaded by its enclosing function",
        applies: closure_capture,
    },
    LineRule {
        id: "MEM_CACHE_NO_LIMITS",
        severity: Severity::Medium,
        message: "Memoization cache without a size limit",
        applies: cache_no_limits,
    },
    LineRule {
        id: "MEM_LIST_ACCUMULATION",
        severity: Severity::High,
        message: "List grows inside a long-running loop and is never trimmed",
        applies: list_accumulation,
    },
    LineRule {
        id: "MEM_CIRCULAR_REFERENCE",
        severity: Severity::Medium,
        message: "Parent/child objects reference each other - reference cycle",
        applies: circular_reference,
    },
    LineRule {
        id: "MEM_SESSION_ACCUMULATION",
        severity: Severity::High,
        message: "Sessions stored without expiry or cleanup",
        applies: session_accumulation,
    },
    LineRule {
        id: "MEM_INSTANCE_COLLECTION",
        severity: Severity::Medium,
        message: "Every instance is kept alive by a class-level registry",
        applies: instance_collection,
    },
    LineRule {
        id: "MEM_TEMP_STORAGE_LEAK",
        severity: Severity::Medium,
        message: "Temporary storage is filled but never cleared",
        applies: temp_storage,
    },
    LineRule {
        id: "MEM_REQUEST_HISTORY_GROWTH",
        severity: Severity::Medium,
        message: "Request history grows with every request",
        applies: request_history,
    },
    LineRule {
        id: "MEM_BACKGROUND_TASK_ACCUMULATION",
        severity: Severity::Medium,
        message: "Background tasks accumulate without being cleaned up when done",
        applies: background_tasks,
    },
];

pub static SUGGESTIONS: &[(&str, &str)] = &[
    ("MEM_CACHE_GROWTH", "Implement LRU cache with size limits or TTL to prevent unbounded growth"),
    ("MEM_EVENT_HANDLERS", "Remove unused event handlers periodically to prevent memory accumulation"),
    ("MEM_LARGE_DATASETS", "Implement data cleanup strategy with TTL or size-based eviction"),
    ("MEM_GLOBAL_GROWTH", "Use bounded data structures or implement cleanup mechanisms for global variables"),
    ("MEM_LARGE_OBJECTS", "Cache or reuse large data structures instead of creating them repeatedly"),
    ("MEM_CLOSURE_CAPTURE", "Avoid capturing large objects in closures - use weak references or explicit cleanup"),
    ("MEM_CACHE_NO_LIMITS", "Use functools.lru_cache or implement custom cache with size limits"),
    ("MEM_LIST_ACCUMULATION", "Implement list rotation, size limits, or periodic cleanup for accumulating lists"),
    ("MEM_FILE_HANDLE_LEAK", "Use context managers (with open()) or ensure file.close() is called"),
    ("MEM_CIRCULAR_REFERENCE", "Break circular references using weak references or explicit cleanup"),
    ("MEM_SESSION_ACCUMULATION", "Implement session expiration, cleanup, or use bounded session storage"),
    ("MEM_INSTANCE_COLLECTION", "Avoid storing all instances - use weak references or remove instances when done"),
    ("MEM_TEMP_STORAGE_LEAK", "Clear temporary storage periodically or use bounded temporary storage"),
    ("MEM_REQUEST_HISTORY_GROWTH", "Implement request history rotation, size limits, or log to external storage"),
    ("MEM_BACKGROUND_TASK_ACCUMULATION", "Clean up completed background tasks or use bounded task queues"),
];

pub static RULE_SET: RuleSet = RuleSet {
    category: Category::Memory,
    rules: RULES,
    file_pass: Some(file_pass),
    suggestions: SUGGESTIONS,
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::rules::test_support::{assert_file_pass_bounded, lines_of, run};

    #[test]
    fn test_cache_growth_without_eviction() {
        let src = "_cache = {}\ndef get(k):\n    _cache[k] = compute(k)\n    return _cache[k]\n";
        let findings = run(&RULE_SET, src);
        assert_eq!(lines_of(&findings, "MEM_CACHE_GROWTH"), vec![3]);
        let bounded = format!("{src}def trim():\n    _cache.clear()\n");
        assert!(lines_of(&run(&RULE_SET, &bounded), "MEM_CACHE_GROWTH").is_empty());
    }

    #[test]
    fn test_global_growth_reported_once() {
        let src = "\
seen = []
def track(x):
    seen.append(x)
def track_more(x):
    seen.append(x)
";
        let findings = run(&RULE_SET, src);
        assert_eq!(lines_of(&findings, "MEM_GLOBAL_GROWTH"), vec![3]);
        assert!(findings
            .iter()
            .any(|f| f.message.contains("Global 'seen'")));
    }

    #[test]
    fn test_file_handle_leak() {
        let src = "\
f = open(path)
data = f.read()
g = open(other)
g.close()
";
        let findings = run(&RULE_SET, src);
        assert_eq!(lines_of(&findings, "MEM_FILE_HANDLE_LEAK"), vec![1]);
    }

    #[test]
    fn test_list_accumulation_in_while_loop() {
        let src = "\
events = []
while running:
    events.append(poll())
";
        let findings = run(&RULE_SET, src);
        assert_eq!(lines_of(&findings, "MEM_LIST_ACCUMULATION"), vec![3]);
        let trimmed = "\
while running:
    events.append(poll())
    if len(events) > 100:
        events.pop(0)
";
        assert!(lines_of(&run(&RULE_SET, trimmed), "MEM_LIST_ACCUMULATION").is_empty());
    }

    #[test]
    fn test_unbounded_lru_cache() {
        let src = "@lru_cache(maxsize=None)\ndef fib(n):\n    return n\n";
        assert_eq!(lines_of(&run(&RULE_SET, src), "MEM_CACHE_NO_LIMITS"), vec![1]);
    }

    #[test]
    fn test_cycle_and_instance_registry() {
        let src = "\
class Node:
    registry = []
    def __init__(self, parent):
        parent.children.append(self)
        Node.registry.append(self)
";
        let findings = run(&RULE_SET, src);
        assert_eq!(lines_of(&findings, "MEM_CIRCULAR_REFERENCE"), vec![4]);
        assert_eq!(lines_of(&findings, "MEM_INSTANCE_COLLECTION"), vec![5]);
    }

    #[test]
    fn test_sessions_and_background_tasks() {
        let src = "\
sessions[user_id] = new_session()
tasks.append(asyncio.create_task(job()))
";
        let findings = run(&RULE_SET, src);
        assert_eq!(lines_of(&findings, "MEM_SESSION_ACCUMULATION"), vec![1]);
        assert_eq!(lines_of(&findings, "MEM_BACKGROUND_TASK_ACCUMULATION"), vec![2]);
    }

    #[test]
    fn test_every_rule_has_a_suggestion() {
        for rule in RULES {
            assert!(Category::Memory.owns(rule.id), "{}", rule.id);
            assert!(RULE_SET.suggestion_for(rule.id).is_some(), "{}", rule.id);
        }
        assert!(RULE_SET.suggestion_for("MEM_GLOBAL_GROWTH").is_some());
        assert!(RULE_SET.suggestion_for("MEM_FILE_HANDLE_LEAK").is_some());
    }

    #[test]
    fn test_whole_file_pass_respects_deadline() {
        let mut src = String::new();
        for i in 0..3_000 {
            src.push_str(&format!("g{i} = []\n"));
        }
        src.push_str("def f():\n");
        for _ in 0..3_000 {
            src.push_str("    x = 1\n");
        }
        assert_file_pass_bounded(&RULE_SET, &src, 50);
    }
}
