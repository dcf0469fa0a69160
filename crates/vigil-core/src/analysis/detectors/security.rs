//! Security rules: injection, hardcoded secrets, weak crypto, unsafe
//! deserialization, traversal, CSRF and auth bypass.

use std::sync::LazyLock;

use regex::Regex;

use crate::analysis::rules::{LineContext, LineRule, RuleSet};
use crate::models::{Category, Severity};

type Ctx<'v, 'a> = LineContext<'v, 'a>;

static SQL_CALL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"\b(?:execute|executemany|executescript|query)\s*\(\s*(?:f["']|["'][^"']*["']\s*(?:%|\+|\.format\()|\w+\s*(?:\+|%)\s*\w)"#,
    )
    .unwrap()
});

static SQL_BUILD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?:["'](?:select|insert\s+into|update|delete\s+from)\b[^"']*["']\s*(?:\+|%\s*[\w(])|f["'](?:select|insert\s+into|update|delete\s+from)\b[^"']*\{)"#,
    )
    .unwrap()
});

static ORM_RAW_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?:\.raw|\.extra|\btext)\s*\(\s*(?:f["']|["'][^"']*["']\s*(?:%|\+|\.format\())"#,
    )
    .unwrap()
});

static SECRET_ASSIGN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"^[\w.]*(?:password|passwd|secret|api_?key|access_?key|auth_?token|private_?key|token)\w*\s*=\s*["'][^"']{3,}["']"#,
    )
    .unwrap()
});

static CREDENTIAL_LITERAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?:["'](?:password|passwd|secret|api_?key|token)["']\s*:\s*["'][^"']{3,}["']|\([^)]*\b(?:password|passwd|api_?key|secret|token)\s*=\s*["'][^"']{3,}["'])"#,
    )
    .unwrap()
});

static WEAK_CRYPTO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:hashlib\.(?:md5|sha1)\b|\b(?:md5|sha1)\s*\(|\bdes\.new\b|\b(?:rc4|arc4)\b|mode_ecb|modes\.ecb)",
    )
    .unwrap()
});

static AUTH_BYPASS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?:if\s+\w*(?:user|role)\w*\s*==\s*["']admin["']|is_admin\s*=\s*true|skip_auth|login_required\s*=\s*false|verify_signature["']?\s*:\s*false|algorithms\s*=\s*\[\s*["']none["']|authenticated\s*=\s*true)"#,
    )
    .unwrap()
});

const CONCAT_MARKERS: &[&str] = &["+", ".format(", "f\"", "f'", "%"];
const FILE_OPS: &[&str] = &[
    "open(",
    "send_file(",
    "send_from_directory(",
    "os.path.join(",
    "file(",
    ".save(",
    "shutil.copy",
];
const SHELL_CALLS: &[&str] = &[
    "os.system(",
    "os.popen(",
    "subprocess.call(",
    "subprocess.run(",
    "subprocess.popen(",
    "subprocess.check_output(",
    "commands.getoutput(",
];
const REQUEST_INPUTS: &[&str] = &[
    "request.args",
    "request.form",
    "request.json",
    "request.get_json(",
    "request.data",
    "request.values",
    "request.get[",
    "request.post[",
    "request.query_params",
];
const STATE_CHANGING_ROUTES: &[&str] = &[
    "methods=[\"post",
    "methods=['post",
    "methods=[\"put",
    "methods=['put",
    "methods=[\"delete",
    "methods=['delete",
    "@app.post(",
    "@app.put(",
    "@app.delete(",
    "@router.post(",
    "@router.put(",
    "@router.delete(",
    "def post(",
    "def put(",
    "def delete(",
];

fn sql_injection(ctx: &Ctx<'_, '_>) -> bool {
    SQL_CALL_RE.is_match(ctx.lower()) || SQL_BUILD_RE.is_match(ctx.lower())
}

fn orm_sql_injection(ctx: &Ctx<'_, '_>) -> bool {
    ORM_RAW_RE.is_match(ctx.lower())
}

fn xss(ctx: &Ctx<'_, '_>) -> bool {
    ctx.has(&[
        "innerhtml",
        "outerhtml",
        "document.write(",
        "insertadjacenthtml(",
        "mark_safe(",
        "markup(",
        "render_template_string(",
    ]) && (ctx.raw_has(CONCAT_MARKERS) || ctx.has(&["${", "request."]))
}

fn hardcoded_secret(ctx: &Ctx<'_, '_>) -> bool {
    SECRET_ASSIGN_RE.is_match(ctx.lower()) && !ctx.has(&["environ", "getenv", "config["])
}

fn hardcoded_credentials(ctx: &Ctx<'_, '_>) -> bool {
    CREDENTIAL_LITERAL_RE.is_match(ctx.lower())
}

fn insecure_deserialization(ctx: &Ctx<'_, '_>) -> bool {
    ctx.has(&[
        "pickle.loads(",
        "pickle.load(",
        "cpickle.loads(",
        "marshal.loads(",
        "shelve.open(",
        "jsonpickle.decode(",
        "dill.loads(",
        "yaml.unsafe_load(",
    ]) || (ctx.has(&["yaml.load("]) && !ctx.has(&["safeloader", "safe_load"]))
}

fn weak_crypto(ctx: &Ctx<'_, '_>) -> bool {
    WEAK_CRYPTO_RE.is_match(ctx.lower())
}

fn missing_csrf(ctx: &Ctx<'_, '_>) -> bool {
    ctx.has(STATE_CHANGING_ROUTES) && !ctx.around_has(5, 10, &["csrf"])
}

fn auth_bypass(ctx: &Ctx<'_, '_>) -> bool {
    AUTH_BYPASS_RE.is_match(ctx.lower())
}

fn path_traversal(ctx: &Ctx<'_, '_>) -> bool {
    ctx.has(FILE_OPS)
        && (ctx.raw_has(&["../", "..\\"]) || ctx.has(&["request.", "user_input", "filename"]))
        && !ctx.has(&["secure_filename", "os.path.basename"])
}

fn command_injection(ctx: &Ctx<'_, '_>) -> bool {
    ctx.has(SHELL_CALLS) && ctx.raw_has(CONCAT_MARKERS)
}

fn shell_injection(ctx: &Ctx<'_, '_>) -> bool {
    ctx.has(&["subprocess.", "popen("]) && ctx.has(&["shell=true", "shell = true"])
}

fn sensitive_data_exposure(ctx: &Ctx<'_, '_>) -> bool {
    let lower = ctx.lower();
    ctx.has(&[
        "password",
        "credit_card",
        "ssn",
        "social_security",
        "api_key",
        "secret",
    ]) && (lower.starts_with("return ")
        || ctx.has(&["jsonify(", "response(", "render(", "render_template("]))
}

fn missing_input_validation(ctx: &Ctx<'_, '_>) -> bool {
    ctx.has(REQUEST_INPUTS)
        && !ctx.around_has(
            3,
            5,
            &[
                "validate",
                "schema",
                "clean",
                "sanitize",
                "isinstance(",
                "pydantic",
                "is_valid(",
            ],
        )
}

pub static RULES: &[LineRule] = &[
    LineRule {
        id: "SEC_SQL_INJECTION",
        severity: Severity::High,
        message: "SQL injection vulnerability - use parameterized queries instead of string interpolation",
        applies: sql_injection,
    },
    LineRule {
        id: "SEC_ORM_SQL_INJECTION",
        severity: Severity::High,
        message: "ORM raw query built from interpolated strings - use bound parameters",
        applies: orm_sql_injection,
    },
    LineRule {
        id: "SEC_XSS",
        severity: Severity::High,
        message: "Potential XSS - unescaped dynamic content written into HTML",
        applies: xss,
    },
    LineRule {
        id: "SEC_HARDCODED_SECRET",
        severity: Severity::High,
        message: "Hardcoded secret detected - load it from the environment or a secret store",
        applies: hardcoded_secret,
    },
    LineRule {
        id: "SEC_HARDCODED_CREDENTIALS",
        severity: Severity::High,
        message: "Hardcoded credentials in a literal or call argument",
        applies: hardcoded_credentials,
    },
    LineRule {
        id: "SEC_INSECURE_DESERIALIZATION",
        severity: Severity::High,
        message: "Insecure deserialization of potentially untrusted data",
        applies: insecure_deserialization,
    },
    LineRule {
        id: "SEC_WEAK_CRYPTO",
        severity: Severity::Medium,
        message: "Weak cryptographic primitive - use SHA-256 or stronger",
        applies: weak_crypto,
    },
    LineRule {
        id: "SEC_MISSING_CSRF",
        severity: Severity::Medium,
        message: "State-changing endpoint without CSRF protection",
        applies: missing_csrf,
    },
    LineRule {
        id: "SEC_AUTH_BYPASS",
        severity: Severity::High,
        message: "Possible authentication bypass - verification disabled or hardcoded role check",
        applies: auth_bypass,
    },
    LineRule {
        id: "SEC_PATH_TRAVERSAL",
        severity: Severity::High,
        message: "Path traversal risk - file path built from untrusted input",
        applies: path_traversal,
    },
    LineRule {
        id: "SEC_COMMAND_INJECTION",
        severity: Severity::High,
        message: "Command injection risk - shell command built from dynamic strings",
        applies: command_injection,
    },
    LineRule {
        id: "SEC_SHELL_INJECTION",
        severity: Severity::Critical,
        message: "Subprocess invoked with shell=True",
        applies: shell_injection,
    },
    LineRule {
        id: "SEC_SENSITIVE_DATA_EXPOSURE",
        severity: Severity::High,
        message: "Sensitive data returned or rendered to the client",
        applies: sensitive_data_exposure,
    },
    LineRule {
        id: "SEC_MISSING_INPUT_VALIDATION",
        severity: Severity::Medium,
        message: "Request input used without validation",
        applies: missing_input_validation,
    },
];

pub static SUGGESTIONS: &[(&str, &str)] = &[
    ("SEC_SQL_INJECTION", "Use parameterized queries or prepared statements for all database access"),
    ("SEC_ORM_SQL_INJECTION", "Prefer ORM query builders; pass parameters separately to raw queries"),
    ("SEC_XSS", "Escape or sanitize dynamic content before inserting it into HTML"),
    ("SEC_HARDCODED_SECRET", "Move secrets to environment variables or a dedicated secret manager"),
    ("SEC_HARDCODED_CREDENTIALS", "Load credentials from secure configuration instead of source code"),
    ("SEC_INSECURE_DESERIALIZATION", "Avoid deserializing untrusted data; use JSON or yaml.safe_load"),
    ("SEC_WEAK_CRYPTO", "Replace MD5/SHA1/DES with SHA-256, bcrypt or a modern AEAD cipher"),
    ("SEC_MISSING_CSRF", "Enable CSRF protection for all state-changing endpoints"),
    ("SEC_AUTH_BYPASS", "Review authentication logic and never disable token verification"),
    ("SEC_PATH_TRAVERSAL", "Validate file paths with secure_filename and restrict access to a base directory"),
    ("SEC_COMMAND_INJECTION", "Pass subprocess arguments as a list and never interpolate user input into commands"),
    ("SEC_SHELL_INJECTION", "Remove shell=True and invoke the program directly with an argument list"),
    ("SEC_SENSITIVE_DATA_EXPOSURE", "Filter sensitive fields out of responses with explicit serializers"),
    ("SEC_MISSING_INPUT_VALIDATION", "Validate request input with a schema (Pydantic, Marshmallow) before use"),
];

pub static RULE_SET: RuleSet = RuleSet {
    category: Category::Security,
    rules: RULES,
    file_pass: None,
    suggestions: SUGGESTIONS,
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::rules::test_support::{ids, lines_of, run};

    #[test]
    fn test_sql_injection_concat_and_fstring() {
        let src = "\
cursor.execute(\"SELECT * FROM users WHERE id = \" + user_id)
cursor.execute(f\"DELETE FROM t WHERE id = {tid}\")
cursor.execute(\"SELECT * FROM users WHERE id = %s\", (user_id,))
query = \"SELECT name FROM users WHERE id = \" + uid
";
        let findings = run(&RULE_SET, src);
        assert_eq!(lines_of(&findings, "SEC_SQL_INJECTION"), vec![1, 2, 4]);
    }

    #[test]
    fn test_orm_raw_query() {
        let findings = run(&RULE_SET, "User.objects.raw(\"SELECT * FROM u WHERE n = '%s'\" % name)\n");
        assert!(ids(&findings).contains(&"SEC_ORM_SQL_INJECTION"));
    }

    #[test]
    fn test_hardcoded_secret_and_env_lookup() {
        let src = "\
API_KEY = \"sk-live-1234567890\"
db_password = 'hunter22'
token = os.environ.get(\"TOKEN\", \"fallback\")
";
        let findings = run(&RULE_SET, src);
        assert_eq!(lines_of(&findings, "SEC_HARDCODED_SECRET"), vec![1, 2]);
    }

    #[test]
    fn test_credentials_in_literal() {
        let src = "config = {\"password\": \"admin123\"}\nconnect(host='db', password='admin123')\n";
        let findings = run(&RULE_SET, src);
        assert_eq!(lines_of(&findings, "SEC_HARDCODED_CREDENTIALS"), vec![1, 2]);
    }

    #[test]
    fn test_shell_true_is_critical() {
        let findings = run(&RULE_SET, "subprocess.run(cmd, shell=True)\n");
        let shell: Vec<_> = findings
            .iter()
            .filter(|f| f.rule_id == "SEC_SHELL_INJECTION")
            .collect();
        assert_eq!(shell.len(), 1);
        assert_eq!(shell[0].severity, Severity::Critical);
    }

    #[test]
    fn test_command_injection() {
        let findings = run(&RULE_SET, "os.system(\"rm -rf \" + path)\n");
        assert!(ids(&findings).contains(&"SEC_COMMAND_INJECTION"));
    }

    #[test]
    fn test_weak_crypto_and_deserialization() {
        let src = "\
digest = hashlib.md5(data).hexdigest()
obj = pickle.loads(blob)
cfg = yaml.load(stream)
safe = yaml.load(stream, Loader=yaml.SafeLoader)
";
        let findings = run(&RULE_SET, src);
        assert_eq!(lines_of(&findings, "SEC_WEAK_CRYPTO"), vec![1]);
        assert_eq!(lines_of(&findings, "SEC_INSECURE_DESERIALIZATION"), vec![2, 3]);
    }

    #[test]
    fn test_path_traversal_and_safe_variant() {
        let src = "\
f = open(\"../\" + name)
g = send_file(request.args[\"f\"])
h = open(os.path.join(base, secure_filename(filename)))
";
        let findings = run(&RULE_SET, src);
        assert_eq!(lines_of(&findings, "SEC_PATH_TRAVERSAL"), vec![1, 2]);
    }

    #[test]
    fn test_csrf_window() {
        let unprotected = "@app.route('/transfer', methods=['POST'])\ndef transfer():\n    return 1\n";
        assert!(ids(&run(&RULE_SET, unprotected)).contains(&"SEC_MISSING_CSRF"));
        let protected =
            "@csrf.protect\n@app.route('/transfer', methods=['POST'])\ndef transfer():\n    return 1\n";
        assert!(!ids(&run(&RULE_SET, protected)).contains(&"SEC_MISSING_CSRF"));
    }

    #[test]
    fn test_clean_function_has_no_findings() {
        assert!(run(&RULE_SET, "def f(): return 1").is_empty());
    }

    #[test]
    fn test_every_rule_has_a_suggestion() {
        for rule in RULES {
            assert!(Category::Security.owns(rule.id), "{}", rule.id);
            assert!(RULE_SET.suggestion_for(rule.id).is_some(), "{}", rule.id);
        }
    }
}
