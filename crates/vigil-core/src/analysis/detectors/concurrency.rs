//! Concurrency rules for async code: blocking calls on the event loop,
//! serialized awaits, unsafe shared state, leaked sessions and locks.

use std::sync::LazyLock;

use regex::Regex;

use crate::analysis::rules::{LineContext, LineRule, RuleSet};
use crate::models::{Category, Severity};

type Ctx<'v, 'a> = LineContext<'v, 'a>;

static SHARED_MUTATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:self\.)?(?:shared|counter|state|total|_?cache|results?)\w*\s*(?:\+=|-=|\[[^\]]+\]\s*=[^=])")
        .unwrap()
});

static MANUAL_ACQUIRE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:await\s+)?\w+(?:\.\w+)*\.acquire\(\s*\)").unwrap());

const CPU_BOUND_CALLS: &[&str] = &[
    "hashlib.",
    "bcrypt.",
    "pbkdf2",
    "json.loads(",
    "json.dumps(",
    "sorted(",
    "re.compile(",
    "numpy.",
    "np.",
    "pickle.",
    "zlib.compress(",
];

fn blocking_sleep(ctx: &Ctx<'_, '_>) -> bool {
    ctx.has(&["time.sleep("]) && ctx.in_async()
}

fn sequential_awaits(ctx: &Ctx<'_, '_>) -> bool {
    ctx.has(&["await "]) && !ctx.has(&["asyncio.sleep(", "gather("]) && ctx.in_loop() && ctx.in_async()
}

fn cpu_bound_work(ctx: &Ctx<'_, '_>) -> bool {
    ctx.in_async()
        && ctx.has(CPU_BOUND_CALLS)
        && !ctx.has(&["run_in_executor(", "to_thread(", "await "])
}

fn blocking_io(ctx: &Ctx<'_, '_>) -> bool {
    if !ctx.in_async() || ctx.has(&["aiofiles", "await ", "run_in_executor(", "to_thread("]) {
        return false;
    }
    ctx.has(&[
        "open(",
        "requests.get(",
        "requests.post(",
        "requests.put(",
        "requests.delete(",
        "urllib.request.urlopen(",
        ".read()",
        "socket.recv(",
    ])
}

/// New client session per call instead of one shared session.
fn session_creation(ctx: &Ctx<'_, '_>) -> bool {
    ctx.has(&["clientsession("]) && ctx.enclosing_function().is_some() && ctx.in_async()
}

fn gather_without_exceptions(ctx: &Ctx<'_, '_>) -> bool {
    if !ctx.has(&["asyncio.gather(", "await gather("]) {
        return false;
    }
    let lower = ctx.lower();
    // Multi-line call: the keyword may sit on a continuation line.
    let span = if lower.matches('(').count() > lower.matches(')').count() { 3 } else { 0 };
    !ctx.around_has(0, span, &["return_exceptions"])
}

/// Shared state mutated from async code with no lock in the function.
fn race_condition(ctx: &Ctx<'_, '_>) -> bool {
    if !SHARED_MUTATION_RE.is_match(ctx.lower()) || !ctx.in_async() {
        return false;
    }
    let Some(func) = ctx.enclosing_function() else {
        return false;
    };
    !ctx
        .view
        .lowered_range(func, ctx.view.block_end(func))
        .any(|l| l.contains("lock") || l.contains("semaphore"))
}

fn lock_without_context(ctx: &Ctx<'_, '_>) -> bool {
    MANUAL_ACQUIRE_RE.is_match(ctx.lower()) && ctx.in_async()
}

pub static RULES: &[LineRule] = &[
    LineRule {
        id: "CONC_BLOCKING_SLEEP",
        severity: Severity::Critical,
        message: "time.sleep() blocks the event loop inside an async function",
        applies: blocking_sleep,
    },
    LineRule {
        id: "CONC_SEQUENTIAL_AWAITS",
        severity: Severity::Medium,
        message: "Awaiting inside a loop serializes independent operations",
        applies: sequential_awaits,
    },
    LineRule {
        id: "CONC_CPU_BOUND_WORK",
        severity: Severity::Medium,
        message: "CPU-bound work runs directly on the event loop",
        applies: cpu_bound_work,
    },
    LineRule {
        id: "CONC_BLOCKING_IO",
        severity: Severity::High,
        message: "Blocking I/O call inside an async function",
        applies: blocking_io,
    },
    LineRule {
        id: "CONC_SESSION_CREATION",
        severity: Severity::Medium,
        message: "HTTP client session created per call instead of reused",
        applies: session_creation,
    },
    LineRule {
        id: "CONC_GATHER_NO_EXCEPTIONS",
        severity: Severity::Low,
        message: "asyncio.gather() without return_exceptions - one failure cancels the batch",
        applies: gather_without_exceptions,
    },
    LineRule {
        id: "CONC_RACE_CONDITION",
        severity: Severity::High,
        message: "Shared state mutated in async code without a lock",
        applies: race_condition,
    },
    LineRule {
        id: "CONC_LOCK_WITHOUT_CONTEXT",
        severity: Severity::Medium,
        message: "Lock acquired manually instead of with 'async with'",
        applies: lock_without_context,
    },
];

pub static SUGGESTIONS: &[(&str, &str)] = &[
    ("CONC_BLOCKING_SLEEP", "Replace time.sleep() with await asyncio.sleep() in async functions"),
    ("CONC_SEQUENTIAL_AWAITS", "Use asyncio.gather() to run async operations concurrently instead of sequentially"),
    ("CONC_SESSION_CREATION", "Create aiohttp.ClientSession once and reuse across requests for better performance"),
    ("CONC_GATHER_NO_EXCEPTIONS", "Add return_exceptions=True to asyncio.gather() to handle individual task failures"),
    ("CONC_CPU_BOUND_WORK", "Use asyncio.create_task() or run_in_executor() for CPU-bound work in async functions"),
    ("CONC_BLOCKING_IO", "Use async alternatives (aiohttp, aiofiles) instead of blocking I/O in async functions"),
    ("CONC_RACE_CONDITION", "Use asyncio.Lock() or other synchronization primitives to prevent race conditions"),
    ("CONC_LOCK_WITHOUT_CONTEXT", "Use async with statement for asyncio locks to prevent deadlocks"),
];

pub static RULE_SET: RuleSet = RuleSet {
    category: Category::Concurrency,
    rules: RULES,
    file_pass: None,
    suggestions: SUGGESTIONS,
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::rules::test_support::{ids, lines_of, run};

    #[test]
    fn test_blocking_sleep_only_in_async() {
        let src = "\
import time
async def poll():
    time.sleep(1)
def sync_poll():
    time.sleep(1)
";
        let findings = run(&RULE_SET, src);
        assert_eq!(lines_of(&findings, "CONC_BLOCKING_SLEEP"), vec![3]);
        assert_eq!(findings[0].severity, Severity::Critical);
    }

    #[test]
    fn test_sequential_awaits_in_loop() {
        let src = "\
async def fetch_all(urls):
    for url in urls:
        await fetch(url)
    await asyncio.sleep(0)
";
        let findings = run(&RULE_SET, src);
        assert_eq!(lines_of(&findings, "CONC_SEQUENTIAL_AWAITS"), vec![3]);
    }

    #[test]
    fn test_gather_and_sessions() {
        let src = "\
async def run(urls):
    session = aiohttp.ClientSession()
    results = await asyncio.gather(*tasks)
    ok = await asyncio.gather(*tasks, return_exceptions=True)
";
        let findings = run(&RULE_SET, src);
        assert_eq!(lines_of(&findings, "CONC_SESSION_CREATION"), vec![2]);
        assert_eq!(lines_of(&findings, "CONC_GATHER_NO_EXCEPTIONS"), vec![3]);
    }

    #[test]
    fn test_race_condition_needs_missing_lock() {
        let unsafe_src = "\
async def bump():
    counter += 1
";
        assert_eq!(lines_of(&run(&RULE_SET, unsafe_src), "CONC_RACE_CONDITION"), vec![2]);
        let locked = "\
async def bump():
    async with lock:
        counter += 1
";
        assert!(lines_of(&run(&RULE_SET, locked), "CONC_RACE_CONDITION").is_empty());
    }

    #[test]
    fn test_blocking_io_and_manual_lock() {
        let src = "\
async def load(lock):
    data = open('f.txt').read()
    await lock.acquire()
";
        let findings = run(&RULE_SET, src);
        assert_eq!(lines_of(&findings, "CONC_BLOCKING_IO"), vec![2]);
        assert_eq!(lines_of(&findings, "CONC_LOCK_WITHOUT_CONTEXT"), vec![3]);
    }

    #[test]
    fn test_sync_code_is_quiet() {
        let src = "def f():\n    data = open('x').read()\n    return sorted(data)\n";
        assert!(ids(&run(&RULE_SET, src)).is_empty());
    }

    #[test]
    fn test_every_rule_has_a_suggestion() {
        for rule in RULES {
            assert!(Category::Concurrency.owns(rule.id), "{}", rule.id);
            assert!(RULE_SET.suggestion_for(rule.id).is_some(), "{}", rule.id);
        }
    }
}
