//! Criterion benchmarks for vigil-core.
//!
//! These benchmarks exercise the pure-Rust internals and never need a Python
//! runtime.
//!
//! ## Benchmark groups
//!
//! 1. **metrics** — Structural extraction for Python (tree-sitter) and the
//!    lexical languages.
//! 2. **rule_sets** — Each built-in detector category on a mixed snippet.
//! 3. **orchestrator** — Full analysis, sequential and parallel.
//! 4. **suggestions** — Suggestion synthesis over a realistic finding set.
//! 5. **limiter** — Admission checks against the memory and SQLite stores.
//! 6. **schema** — DDL init + migration overhead.
//!
//! ## Running
//!
//! ```sh
//! cargo bench --manifest-path crates/vigil-core/Cargo.toml
//! # Run only the limiter group:
//! cargo bench --manifest-path crates/vigil-core/Cargo.toml -- limiter
//! ```

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rusqlite::Connection;

use _vigil_core::analysis::budget::Deadline;
use _vigil_core::analysis::detectors::builtin_rule_sets;
use _vigil_core::analysis::metrics::extract;
use _vigil_core::analysis::orchestrator::Orchestrator;
use _vigil_core::analysis::rules::SourceView;
use _vigil_core::analysis::suggestions::synthesize;
use _vigil_core::config::{ExecutionMode, PlanLimits, VigilConfig};
use _vigil_core::limiter::RateLimiter;
use _vigil_core::models::{Identity, Language, SourceUnit};
use _vigil_core::store::schema::{init_schema, migrate_schema};
use _vigil_core::store::{MemoryStore, SqliteStore, Store};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// A Python module that trips rules in most categories.
fn python_sample(functions: usize) -> String {
    let mut src = String::from("import json\nimport requests\nimport threading\n\nCACHE = {}\nresults = []\n\n");
    for i in 0..functions {
        src.push_str(&format!(
            "def handler_{i}(ids, password='hunter2'):\n    \
             # TODO: batch these\n    \
             for id in ids:\n        \
             row = db.query(\"SELECT * FROM t WHERE id = \" + str(id))\n        \
             resp = requests.get(f\"http://svc/{{id}}\")\n        \
             results.append(row)\n        \
             for other in ids:\n            \
             if other in list(ids):\n                \
             CACHE[id] = json.loads(resp.text)\n    \
             try:\n        \
             return len(results)\n    \
             except:\n        \
             pass\n\n"
        ));
    }
    src
}

fn javascript_sample(functions: usize) -> String {
    let mut src = String::new();
    for i in 0..functions {
        src.push_str(&format!(
            "function load{i}(items) {{\n  \
             // FIXME: cache\n  \
             for (let j = 0; j < items.length; j++) {{\n    \
             document.getElementById('out').innerHTML = items[j];\n    \
             fetch('/api/' + items[j]);\n  \
             }}\n}}\n\n"
        ));
    }
    src
}

fn t0() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

// ---------------------------------------------------------------------------
// Benchmark: metrics extraction
// ---------------------------------------------------------------------------

fn bench_metrics(c: &mut Criterion) {
    let mut group = c.benchmark_group("metrics");

    for functions in [1usize, 10, 100] {
        let python = SourceUnit::new(python_sample(functions), Language::Python);
        group.bench_with_input(
            BenchmarkId::new("python", functions),
            &python,
            |b, unit| b.iter(|| extract(black_box(unit))),
        );

        let js = SourceUnit::new(javascript_sample(functions), Language::Javascript);
        group.bench_with_input(
            BenchmarkId::new("javascript", functions),
            &js,
            |b, unit| b.iter(|| extract(black_box(unit))),
        );
    }

    group.finish();
}

// ---------------------------------------------------------------------------
// Benchmark: individual rule sets
// ---------------------------------------------------------------------------

fn bench_rule_sets(c: &mut Criterion) {
    let mut group = c.benchmark_group("rule_sets");
    let unit = SourceUnit::new(python_sample(20), Language::Python);
    let facts = extract(&unit).facts;
    let view = SourceView::new(&unit, &facts);
    let deadline = Deadline::from_millis(60_000);

    for set in builtin_rule_sets() {
        group.bench_function(set.category.as_str(), |b| {
            b.iter(|| set.evaluate(black_box(&view), &deadline).unwrap());
        });
    }

    group.finish();
}

// ---------------------------------------------------------------------------
// Benchmark: full orchestrated analysis
// ---------------------------------------------------------------------------

fn bench_orchestrator(c: &mut Criterion) {
    let mut group = c.benchmark_group("orchestrator");
    let sequential = Orchestrator::new(&VigilConfig::default()).unwrap();
    let parallel = Orchestrator::new(&VigilConfig {
        execution: ExecutionMode::Parallel,
        ..VigilConfig::default()
    })
    .unwrap();

    for functions in [10usize, 100] {
        let code = python_sample(functions);
        group.bench_with_input(BenchmarkId::new("sequential", functions), &code, |b, code| {
            b.iter(|| sequential.run(black_box(code), "python").unwrap());
        });
        group.bench_with_input(BenchmarkId::new("parallel", functions), &code, |b, code| {
            b.iter(|| parallel.run(black_box(code), "python").unwrap());
        });
    }

    let js = javascript_sample(50);
    group.bench_function("javascript_sequential_50", |b| {
        b.iter(|| sequential.run(black_box(&js), "javascript").unwrap());
    });

    group.finish();
}

// ---------------------------------------------------------------------------
// Benchmark: suggestion synthesis
// ---------------------------------------------------------------------------

fn bench_suggestions(c: &mut Criterion) {
    let orchestrator = Orchestrator::new(&VigilConfig::default()).unwrap();
    let code = python_sample(50);
    let unit = SourceUnit::new(code.clone(), Language::Python);
    let outcome = extract(&unit);
    let result = orchestrator.run(&code, "python").unwrap();

    c.bench_function("suggestions_synthesize_50_functions", |b| {
        b.iter(|| {
            synthesize(
                black_box(&code),
                &outcome.facts,
                black_box(&result.findings),
                &outcome.hints,
            )
        });
    });
}

// ---------------------------------------------------------------------------
// Benchmark: rate limiter admission
// ---------------------------------------------------------------------------

fn bench_limiter(c: &mut Criterion) {
    let mut group = c.benchmark_group("limiter");
    let backends: Vec<(&str, Arc<dyn Store>)> = vec![
        ("memory", Arc::new(MemoryStore::new())),
        ("sqlite_in_memory", Arc::new(SqliteStore::open_in_memory().unwrap())),
    ];

    for (name, store) in backends {
        let limiter = RateLimiter::new(store, PlanLimits::default());
        let identity = Identity::anonymous("198.51.100.7");
        // Simulated clock, 10ms apart, keeps the live window bounded.
        let mut tick = 0i64;
        group.bench_function(BenchmarkId::new("check", name), |b| {
            b.iter(|| {
                tick += 1;
                limiter.check_at(black_box(&identity), t0() + Duration::milliseconds(tick * 10))
            });
        });
        group.bench_function(BenchmarkId::new("status", name), |b| {
            b.iter(|| limiter.status_at(black_box(&identity), t0()).unwrap());
        });
    }

    group.finish();
}

// ---------------------------------------------------------------------------
// Benchmark: schema
// ---------------------------------------------------------------------------

fn bench_schema(c: &mut Criterion) {
    c.bench_function("schema_init_fresh", |b| {
        b.iter(|| {
            let conn = Connection::open_in_memory().unwrap();
            init_schema(&conn).unwrap();
            black_box(&conn);
        });
    });

    c.bench_function("schema_migration_noop_on_current", |b| {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        b.iter(|| migrate_schema(black_box(&conn)).unwrap());
    });
}

// ---------------------------------------------------------------------------
// Register all benchmark groups
// ---------------------------------------------------------------------------

criterion_group!(
    benches,
    bench_metrics,
    bench_rule_sets,
    bench_orchestrator,
    bench_suggestions,
    bench_limiter,
    bench_schema,
);
criterion_main!(benches);
