//! Data-flow rules: sensitive values reaching logs, responses, storage and
//! external services without validation or encryption, plus a
//! variable-level taint pass from input sources to sinks.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::analysis::budget::Deadline;
use crate::analysis::rules::{contains_any, Hit, LineContext, LineRule, RuleSet, SourceView};
use crate::errors::VigilResult;
use crate::models::{Category, Severity};

type Ctx<'v, 'a> = LineContext<'v, 'a>;

/// Lines scanned on each side for a validation or encryption marker.
const MARKER_WINDOW: usize = 5;

static SENSITIVE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:^|[^a-z0-9])(?:password|passwd|pwd|secret|token|api_?key|private_key|ssn|social_security|credit_card|card_number|cvv|email|phone)",
    )
    .unwrap()
});

static ASSIGN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([a-z_][a-z0-9_]*)\s*(?::\s*[^=]+)?=[^=](.*)$").unwrap());

const INPUT_SOURCES: &[&str] = &[
    "request.json",
    "request.form",
    "request.args",
    "request.data",
    "request.get_json(",
    "input(",
    "sys.argv",
    "os.environ",
    "getenv(",
    "req.body",
    "req.query",
];

const VALIDATION_MARKERS: &[&str] = &["validate", "sanitize", "escape", "clean", "whitelist", "allowlist"];

const TAINT_CLEANERS: &[&str] = &[
    "validate", "sanitize", "escape", "encrypt", "hash", "clean", "mask", "redact", "int(", "float(",
];

const SINKS: &[&str] = &[
    "print(",
    "logging.",
    "logger.",
    "log.",
    "console.log(",
    "return ",
    "jsonify(",
    "requests.post(",
    "requests.put(",
    ".write(",
    ".save(",
    ".execute(",
    "os.system(",
    "subprocess.",
];

fn sensitive(ctx: &Ctx<'_, '_>) -> bool {
    SENSITIVE_RE.is_match(ctx.lower())
}

fn sensitive_in_logs(ctx: &Ctx<'_, '_>) -> bool {
    ctx.has(&["print(", "logging.", "log.", "logger.", "console.log("])
        && sensitive(ctx)
        && !ctx.has(&["mask", "redact", "***"])
}

fn unvalidated_input(ctx: &Ctx<'_, '_>) -> bool {
    ctx.has(INPUT_SOURCES) && !ctx.around_has(MARKER_WINDOW, 10, VALIDATION_MARKERS)
}

fn sensitive_in_response(ctx: &Ctx<'_, '_>) -> bool {
    ctx.has(&["return ", "jsonify(", "response(", "json.dumps(", "res.json(", "res.send("])
        && sensitive(ctx)
        && !ctx.has(&["mask", "redact", "exclude", "hash"])
}

fn unencrypted_transmission(ctx: &Ctx<'_, '_>) -> bool {
    (ctx.has(&["http://"]) && ctx.has(&["requests.", "urlopen(", "httpx.", "fetch(", "send("]))
        || (ctx.has(&["send(", "transmit", "upload", "requests.post("])
            && sensitive(ctx)
            && !ctx.around_has(MARKER_WINDOW, MARKER_WINDOW, &["encrypt", "ssl", "tls", "https"]))
}

fn unencrypted_storage(ctx: &Ctx<'_, '_>) -> bool {
    ctx.has(&[".save(", ".store(", ".write(", "insert", ".update(", ".set("])
        && sensitive(ctx)
        && !ctx.around_has(
            MARKER_WINDOW,
            MARKER_WINDOW,
            &["encrypt", "hash", "bcrypt", "argon", "fernet"],
        )
}

fn external_without_validation(ctx: &Ctx<'_, '_>) -> bool {
    ctx.has(&["requests.post(", "requests.put(", "httpx.post(", "session.post(", "urllib.request"])
        && !ctx.around_has(MARKER_WINDOW, MARKER_WINDOW, VALIDATION_MARKERS)
}

fn file_without_validation(ctx: &Ctx<'_, '_>) -> bool {
    ctx.has(&["pickle.load(", "json.load(", "yaml.load(", "marshal.load("])
        && !ctx.around_has(MARKER_WINDOW, MARKER_WINDOW, &["validate", "verify", "schema", "checksum"])
}

fn db_without_sanitization(ctx: &Ctx<'_, '_>) -> bool {
    ctx.has(&[".execute(", ".executemany(", ".raw("])
        && ctx.has(&["%", "+", ".format(", "f\"", "f'"])
        && !ctx.around_has(
            MARKER_WINDOW,
            MARKER_WINDOW,
            &["sanitize", "escape", "parameterize", "prepared"],
        )
}

fn sensitive_global(ctx: &Ctx<'_, '_>) -> bool {
    (ctx.lower().starts_with("global ") || (ctx.view.indent(ctx.index) == 0 && ASSIGN_RE.is_match(ctx.lower())))
        && ASSIGN_RE
            .captures(ctx.lower())
            .map(|c| SENSITIVE_RE.is_match(&c[1]))
            .unwrap_or_else(|| sensitive(ctx))
}

fn sensitive_env(ctx: &Ctx<'_, '_>) -> bool {
    ctx.has(&["os.environ", "getenv("]) && sensitive(ctx) && ctx.has(&["print(", "log", "return "])
}

fn sensitive_temp(ctx: &Ctx<'_, '_>) -> bool {
    ctx.has(&["tempfile", "/tmp/", "temp_file", "tmp_file"]) && sensitive(ctx)
}

fn sensitive_cache_no_expiry(ctx: &Ctx<'_, '_>) -> bool {
    ctx.has(&["cache.set(", "cache[", "redis.set(", ".setex(", "memcache"])
        && sensitive(ctx)
        && !ctx.around_has(
            MARKER_WINDOW,
            MARKER_WINDOW,
            &["expire", "ttl", "timeout", "max_age", "ex=", "setex"],
        )
}

/// Variables assigned from an input source and later used at a sink with no
/// cleaning step in between.
fn file_pass(view: &SourceView<'_>, deadline: &Deadline) -> VigilResult<Vec<Hit>> {
    let mut tainted: HashMap<String, usize> = HashMap::new();
    let mut hits = Vec::new();
    let mut ticker = deadline.ticker("detecting");
    for i in view.code_lines() {
        ticker.tick()?;
        let line = view.lower(i);
        if let Some(caps) = ASSIGN_RE.captures(line) {
            let (name, rhs) = (caps[1].to_string(), caps[2].to_string());
            if contains_any(&rhs, INPUT_SOURCES) && !contains_any(&rhs, TAINT_CLEANERS) {
                tainted.insert(name, i);
                continue;
            }
            if contains_any(&rhs, TAINT_CLEANERS) {
                tainted.retain(|var, _| !mentions(&rhs, var) && *var != name);
                continue;
            }
            tainted.remove(&name);
        }
        if contains_any(line, TAINT_CLEANERS) {
            tainted.retain(|var, _| !mentions(line, var));
            continue;
        }
        if !contains_any(line, SINKS) {
            continue;
        }
        let mut reached: Vec<(&String, usize)> = Vec::new();
        for (var, &origin) in &tainted {
            ticker.tick()?;
            if mentions(line, var) {
                reached.push((var, origin));
            }
        }
        reached.sort();
        for (var, origin) in reached {
            hits.push(Hit::new(
                "DATA_TAINTED_SINK",
                Severity::High,
                format!(
                    "'{var}' flows from external input (line {}) to an output without validation",
                    origin + 1
                ),
                i + 1,
            ));
        }
    }
    Ok(hits)
}

/// Whole-word occurrence of an identifier.
fn mentions(line: &str, var: &str) -> bool {
    line.match_indices(var).any(|(at, _)| {
        let before = line[..at].chars().next_back();
        let after = line[at + var.len()..].chars().next();
        let ident = |c: Option<char>| c.is_some_and(|c| c.is_alphanumeric() || c == '_' || c == '.');
        !ident(before) && !after.is_some_and(|c| c.is_alphanumeric() || c == '_')
    })
}

pub static RULES: &[LineRule] = &[
    LineRule {
        id: "DATA_SENSITIVE_IN_LOGS",
        severity: Severity::High,
        message: "Sensitive data exposed in logs - remove or mask sensitive information",
        applies: sensitive_in_logs,
    },
    LineRule {
        id: "DATA_UNVALIDATED_INPUT",
        severity: Severity::High,
        message: "Unvalidated input from external source - add input validation and sanitization",
        applies: unvalidated_input,
    },
    LineRule {
        id: "DATA_SENSITIVE_IN_RESPONSE",
        severity: Severity::High,
        message: "Sensitive data in response - filter out sensitive fields before returning",
        applies: sensitive_in_response,
    },
    LineRule {
        id: "DATA_UNENCRYPTED_TRANSMISSION",
        severity: Severity::High,
        message: "Sensitive data transmitted without encryption - use HTTPS/SSL",
        applies: unencrypted_transmission,
    },
    LineRule {
        id: "DATA_UNENCRYPTED_STORAGE",
        severity: Severity::High,
        message: "Sensitive data stored without encryption - encrypt before storage",
        applies: unencrypted_storage,
    },
    LineRule {
        id: "DATA_EXTERNAL_WITHOUT_VALIDATION",
        severity: Severity::Medium,
        message: "Data sent to external service without validation - validate data before transmission",
        applies: external_without_validation,
    },
    LineRule {
        id: "DATA_FILE_WITHOUT_VALIDATION",
        severity: Severity::Medium,
        message: "Data loaded from file without validation - validate file content before processing",
        applies: file_without_validation,
    },
    LineRule {
        id: "DATA_DB_WITHOUT_SANITIZATION",
        severity: Severity::High,
        message: "Data sent to database without sanitization - use parameterized queries",
        applies: db_without_sanitization,
    },
    LineRule {
        id: "DATA_SENSITIVE_GLOBAL",
        severity: Severity::Medium,
        message: "Sensitive data stored in global variable - use secure storage mechanisms",
        applies: sensitive_global,
    },
    LineRule {
        id: "DATA_SENSITIVE_ENV",
        severity: Severity::Medium,
        message: "Sensitive data in environment variable - ensure proper access controls",
        applies: sensitive_env,
    },
    LineRule {
        id: "DATA_SENSITIVE_TEMP",
        severity: Severity::Medium,
        message: "Sensitive data in temporary file - ensure proper cleanup and permissions",
        applies: sensitive_temp,
    },
    LineRule {
        id: "DATA_SENSITIVE_CACHE_NO_EXPIRY",
        severity: Severity::Medium,
        message: "Sensitive data cached without expiration - set appropriate TTL",
        applies: sensitive_cache_no_expiry,
    },
];

pub static SUGGESTIONS: &[(&str, &str)] = &[
    ("DATA_SENSITIVE_IN_LOGS", "Remove or mask sensitive data from logs - use logging filters or data masking"),
    ("DATA_UNVALIDATED_INPUT", "Add input validation and sanitization for all external data sources"),
    ("DATA_SENSITIVE_IN_RESPONSE", "Filter out sensitive fields from API responses - use response serializers"),
    ("DATA_UNENCRYPTED_TRANSMISSION", "Use HTTPS/SSL for all data transmission - encrypt sensitive data in transit"),
    ("DATA_UNENCRYPTED_STORAGE", "Encrypt sensitive data before storage - use proper encryption algorithms"),
    ("DATA_EXTERNAL_WITHOUT_VALIDATION", "Validate data before sending to external services - implement data whitelisting"),
    ("DATA_FILE_WITHOUT_VALIDATION", "Validate file content before processing - check file types and content integrity"),
    ("DATA_DB_WITHOUT_SANITIZATION", "Use parameterized queries and input sanitization for database operations"),
    ("DATA_SENSITIVE_GLOBAL", "Use secure storage mechanisms instead of global variables for sensitive data"),
    ("DATA_SENSITIVE_ENV", "Ensure proper access controls for environment variables containing sensitive data"),
    ("DATA_SENSITIVE_TEMP", "Ensure proper cleanup and permissions for temporary files with sensitive data"),
    ("DATA_SENSITIVE_CACHE_NO_EXPIRY", "Set appropriate TTL for cached sensitive data - implement cache expiration"),
    ("DATA_TAINTED_SINK", "Validate or sanitize external input before it reaches logs, responses or storage"),
];

pub static RULE_SET: RuleSet = RuleSet {
    category: Category::DataFlow,
    rules: RULES,
    file_pass: Some(file_pass),
    suggestions: SUGGESTIONS,
};
