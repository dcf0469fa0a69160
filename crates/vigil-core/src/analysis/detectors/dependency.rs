//! Dependency rules over requirement lines, install commands and imports.
//!
//! Version checks compare numerically against a fixed advisory table.

use std::cmp::Ordering;
use std::sync::LazyLock;

use regex::Regex;

use crate::analysis::budget::Deadline;
use crate::analysis::rules::{Hit, LineContext, LineRule, RuleSet, SourceView};
use crate::errors::VigilResult;
use crate::models::{Category, Severity};

type Ctx<'v, 'a> = LineContext<'v, 'a>;

struct Advisory {
    package: &'static str,
    fixed_in: &'static str,
    reason: &'static str,
}

const ADVISORIES: &[Advisory] = &[
    Advisory { package: "requests", fixed_in: "2.20.0", reason: "Known SSRF vulnerabilities" },
    Advisory { package: "urllib3", fixed_in: "1.24.0", reason: "Known security vulnerabilities" },
    Advisory { package: "pyyaml", fixed_in: "5.1", reason: "YAML deserialization vulnerabilities" },
    Advisory { package: "jinja2", fixed_in: "2.10.1", reason: "Template injection vulnerabilities" },
    Advisory { package: "django", fixed_in: "2.2.0", reason: "Multiple security vulnerabilities" },
    Advisory { package: "flask", fixed_in: "1.0.0", reason: "Security vulnerabilities" },
    Advisory { package: "tornado", fixed_in: "5.1.0", reason: "Security vulnerabilities" },
    Advisory { package: "cryptography", fixed_in: "2.3.0", reason: "Cryptographic vulnerabilities" },
    Advisory { package: "pillow", fixed_in: "6.0.0", reason: "Image processing vulnerabilities" },
    Advisory { package: "lxml", fixed_in: "4.3.0", reason: "XML parsing vulnerabilities" },
];

/// Import names that differ from the distribution name.
const IMPORT_ALIASES: &[(&str, &str)] = &[("yaml", "pyyaml"), ("pil", "pillow")];

static REQUIREMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:pip3?\s+install\s+)?([a-z0-9_.\-]+)(?:\[[^\]]*\])?\s*(==|~=|<=|>=|<|>)\s*([0-9][0-9a-z.]*)")
        .unwrap()
});

static IMPORT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:import|from)\s+([a-z0-9_]+)").unwrap());

static PIN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9_.\-]+(?:\[[^\]]*\])?\s*==\s*[0-9]").unwrap());

const DEV_PACKAGES: &[&str] = &[
    "pytest", "mock", "unittest.mock", "coverage", "black", "flake8", "faker", "factory_boy", "hypothesis",
];

const PY2_SHIMS: &[&str] = &["six", "future", "__future__", "backports", "past"];

/// Numeric dotted-version comparison; non-numeric suffixes are ignored.
fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.split('.')
            .map(|part| {
                part.chars()
                    .take_while(|c| c.is_ascii_digit())
                    .collect::<String>()
                    .parse()
                    .unwrap_or(0)
            })
            .collect()
    };
    let (mut a, mut b) = (parse(a), parse(b));
    let len = a.len().max(b.len());
    a.resize(len, 0);
    b.resize(len, 0);
    a.cmp(&b)
}

fn advisory_for(package: &str) -> Option<&'static Advisory> {
    let package = IMPORT_ALIASES
        .iter()
        .find(|(alias, _)| *alias == package)
        .map_or(package, |&(_, name)| name);
    ADVISORIES.iter().find(|a| a.package == package)
}

/// The bound named in the specifier sits below the fixed release, so the
/// requirement admits an affected version whatever the operator.
fn admits_vulnerable(version: &str, fixed_in: &str) -> bool {
    compare_versions(version, fixed_in) == Ordering::Less
}

fn hardcoded_version(ctx: &Ctx<'_, '_>) -> bool {
    ctx.has(&["pip install", "pip3 install", "install_requires", "require("]) && ctx.has(&["=="])
}

fn pinned_version(ctx: &Ctx<'_, '_>) -> bool {
    PIN_RE.is_match(ctx.lower())
}

fn dev_in_prod(ctx: &Ctx<'_, '_>) -> bool {
    if ctx.in_test() {
        return false;
    }
    IMPORT_RE
        .captures(ctx.lower())
        .is_some_and(|c| DEV_PACKAGES.contains(&&c[1]) || ctx.has(&["unittest.mock"]))
}

fn license_issue(ctx: &Ctx<'_, '_>) -> bool {
    ctx.has(&["license", "licence", "classifier"])
        && ctx.has(&["gpl", "copyleft", "proprietary"])
}

fn python2_compat(ctx: &Ctx<'_, '_>) -> bool {
    IMPORT_RE
        .captures(ctx.lower())
        .is_some_and(|c| PY2_SHIMS.contains(&&c[1]))
        || ctx.has(&["python2", "python 2"])
}

fn insecure_source(ctx: &Ctx<'_, '_>) -> bool {
    (ctx.has(&["--index-url", "--extra-index-url", "-i http://"]) && ctx.has(&["http://"]))
        || ctx.has(&["--trusted-host"])
}

fn skip_updates(ctx: &Ctx<'_, '_>) -> bool {
    ctx.has(&["--no-deps", "--no-dependencies", "--force-reinstall"])
}

fn file_pass(view: &SourceView<'_>, deadline: &Deadline) -> VigilResult<Vec<Hit>> {
    let mut hits = Vec::new();
    let mut ticker = deadline.ticker("detecting");
    for i in view.code_lines() {
        ticker.tick()?;
        let line = view.lower(i);
        if let Some(caps) = REQUIREMENT_RE.captures(line) {
            let (package, op, version) = (&caps[1], &caps[2], &caps[3]);
            if let Some(advisory) = advisory_for(package) {
                if admits_vulnerable(version, advisory.fixed_in) {
                    hits.push(Hit::new(
                        "DEP_VULNERABLE_PACKAGE",
                        Severity::High,
                        format!(
                            "Vulnerable package {package} {op}{version} (fixed in {}) - {}",
                            advisory.fixed_in, advisory.reason
                        ),
                        i + 1,
                    ));
                }
            }
            continue;
        }
        if let Some(caps) = IMPORT_RE.captures(line) {
            if let Some(advisory) = advisory_for(&caps[1]) {
                hits.push(Hit::new(
                    "DEP_VULNERABLE_IMPORT",
                    Severity::Low,
                    format!(
                        "Package {} has advisories before {} - {}; verify the installed version",
                        advisory.package, advisory.fixed_in, advisory.reason
                    ),
                    i + 1,
                ));
            }
        }
    }
    Ok(hits)
}

pub static RULES: &[LineRule] = &[
    LineRule {
        id: "DEP_HARDCODED_VERSION",
        severity: Severity::Low,
        message: "Hardcoded package version - consider using version ranges for flexibility",
        applies: hardcoded_version,
    },
    LineRule {
        id: "DEP_PINNED_VERSION",
        severity: Severity::Low,
        message: "Package pinned to specific version - may miss security updates",
        applies: pinned_version,
    },
    LineRule {
        id: "DEP_DEV_IN_PROD",
        severity: Severity::Medium,
        message: "Development dependency used in production code - separate dev and prod dependencies",
        applies: dev_in_prod,
    },
    LineRule {
        id: "DEP_LICENSE_ISSUE",
        severity: Severity::Medium,
        message: "Potentially problematic license detected - review license compatibility",
        applies: license_issue,
    },
    LineRule {
        id: "DEP_PYTHON2_COMPAT",
        severity: Severity::Medium,
        message: "Outdated Python 2 compatibility package - migrate to Python 3",
        applies: python2_compat,
    },
    LineRule {
        id: "DEP_INSECURE_SOURCE",
        severity: Severity::High,
        message: "Insecure package source - use HTTPS for package downloads",
        applies: insecure_source,
    },
    LineRule {
        id: "DEP_SKIP_UPDATES",
        severity: Severity::Medium,
        message: "Skipping dependency updates - may miss security patches",
        applies: skip_updates,
    },
];

pub static SUGGESTIONS: &[(&str, &str)] = &[
    ("DEP_VULNERABLE_PACKAGE", "Update vulnerable packages to latest secure versions - check CVE database"),
    ("DEP_VULNERABLE_IMPORT", "Review and update vulnerable package imports - use security scanning tools"),
    ("DEP_HARDCODED_VERSION", "Use version ranges instead of hardcoded versions for better flexibility"),
    ("DEP_DEV_IN_PROD", "Separate development and production dependencies - use requirements-dev.txt"),
    ("DEP_LICENSE_ISSUE", "Review package licenses for compliance - use license scanning tools"),
    ("DEP_PYTHON2_COMPAT", "Migrate from Python 2 compatibility packages to Python 3 native alternatives"),
    ("DEP_INSECURE_SOURCE", "Use HTTPS package sources and verify package integrity"),
    ("DEP_SKIP_UPDATES", "Enable automatic security updates and dependency scanning"),
    ("DEP_PINNED_VERSION", "Use version ranges for security updates while maintaining stability"),
];

pub static RULE_SET: RuleSet = RuleSet {
    category: Category::Dependency,
    rules: RULES,
    file_pass: Some(file_pass),
    suggestions: SUGGESTIONS,
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::rules::test_support::{assert_file_pass_bounded, ids, lines_of, run};

    #[test]
    fn test_version_compare_is_numeric() {
        assert_eq!(compare_versions("2.9.0", "2.20.0"), Ordering::Less);
        assert_eq!(compare_versions("2.20", "2.20.0"), Ordering::Equal);
        assert_eq!(compare_versions("5.1rc1", "5.1"), Ordering::Equal);
        assert_eq!(compare_versions("10.0", "9.9.9"), Ordering::Greater);
    }

    #[test]
    fn test_requirement_lines_against_advisories() {
        let src = "\
requests==2.9.0
requests==2.31.0
django>=1.11
flask<0.12
numpy==1.26.0
";
        let findings = run(&RULE_SET, src);
        assert_eq!(lines_of(&findings, "DEP_VULNERABLE_PACKAGE"), vec![1, 3, 4]);
        assert_eq!(lines_of(&findings, "DEP_PINNED_VERSION"), vec![1, 2, 5]);
        assert!(findings
            .iter()
            .any(|f| f.message.contains("requests ==2.9.0 (fixed in 2.20.0)")));
    }

    #[test]
    fn test_imports() {
        let src = "\
import yaml
import six
from pytest import fixture
import json
";
        let findings = run(&RULE_SET, src);
        assert_eq!(lines_of(&findings, "DEP_VULNERABLE_IMPORT"), vec![1]);
        assert_eq!(lines_of(&findings, "DEP_PYTHON2_COMPAT"), vec![2]);
        assert_eq!(lines_of(&findings, "DEP_DEV_IN_PROD"), vec![3]);
    }

    #[test]
    fn test_install_commands() {
        let src = "\
# pip install -r requirements.txt
RUN = 'pip install flask==2.0.1 --no-deps'
INDEX = '--index-url http://pypi.internal/simple'
";
        let findings = run(&RULE_SET, src);
        assert_eq!(lines_of(&findings, "DEP_HARDCODED_VERSION"), vec![2]);
        assert_eq!(lines_of(&findings, "DEP_SKIP_UPDATES"), vec![2]);
        assert_eq!(lines_of(&findings, "DEP_INSECURE_SOURCE"), vec![3]);
    }

    #[test]
    fn test_plain_code_is_quiet() {
        assert!(ids(&run(&RULE_SET, "def f():\n    return 1\n")).is_empty());
    }

    #[test]
    fn test_every_rule_has_a_suggestion() {
        for rule in RULES {
            assert!(Category::Dependency.owns(rule.id), "{}", rule.id);
            assert!(RULE_SET.suggestion_for(rule.id).is_some(), "{}", rule.id);
        }
    }

    #[test]
    fn test_whole_file_pass_respects_deadline() {
        let mut src = String::new();
        for i in 0..3_000 {
            src.push_str(&format!("requests=={}.{}.0\n", i % 3, i % 40));
        }
        assert_file_pass_bounded(&RULE_SET, &src, 50);
    }
}
